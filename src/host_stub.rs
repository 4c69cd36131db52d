//! Host-interaction opcode stubs
//!
//! Scripts written for full-featured hosts call pin-mapper and project
//! opcodes this engine does not implement. Registering no-op versions
//! keeps those scripts compiling; they all return 0.

use crate::vm::Vm;
use std::sync::Arc;

const STUB_NAMES: &[&str] = &[
    "export_buffer_to_project",
    "get_host_numchan",
    "set_host_numchan",
    "get_pin_mapping",
    "set_pin_mapping",
    "get_pinmapper_flags",
    "set_pinmapper_flags",
    "get_host_placement",
];

/// Register every stub opcode on the VM.
pub fn register_host_stubs(vm: &mut dyn Vm) {
    for name in STUB_NAMES {
        vm.register_function(name, Arc::new(|_vars, _args| 0.0));
    }
}
