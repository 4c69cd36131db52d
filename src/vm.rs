//! The seam between the engine and the embedded expression-language VM
//!
//! The engine never interprets script code itself; it compiles and executes
//! sections through this narrow interface. A production host plugs in the
//! real language runtime, tests use [`crate::mock_vm::MockVm`].

use crate::types::Real;
use std::sync::Arc;

/// Handle to one VM variable cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VarRef(pub u32);

/// Handle to one compiled code section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeId(pub u32);

/// One argument passed from script code into a host function. Arguments
/// that name a variable arrive by reference so the host function can write
/// through them (serializer reads, MIDI receives).
#[derive(Clone, Copy, Debug)]
pub enum HostArg {
    Value(Real),
    Var(VarRef),
}

/// VM state a host function is allowed to touch while script code runs:
/// variable cells and the script-addressable RAM.
pub trait VmAccess {
    fn get_var(&self, var: VarRef) -> Real;
    fn set_var(&mut self, var: VarRef, value: Real);
    fn read_ram(&mut self, addr: u32, dest: &mut [Real]);
    fn write_ram(&mut self, addr: u32, values: &[Real]);
}

impl<'a> dyn VmAccess + 'a {
    /// Resolve an argument to its numeric value.
    pub fn arg_value(&self, arg: HostArg) -> Real {
        match arg {
            HostArg::Value(v) => v,
            HostArg::Var(var) => self.get_var(var),
        }
    }
}

/// A host-side opcode callable from script code.
pub type HostFn = Arc<dyn Fn(&mut dyn VmAccess, &[HostArg]) -> Real + Send + Sync>;

/// Fallback lookup consulted when compilation meets an identifier that is
/// not a registered variable. The engine uses this to bind slider aliases.
pub type VarResolver = Arc<dyn Fn(&str) -> Option<VarRef> + Send + Sync>;

/// The embedded expression-language virtual machine.
pub trait Vm: VmAccess + Send {
    /// Register (or look up) a named variable and return its cell.
    fn register_var(&mut self, name: &str) -> VarRef;

    /// Install or clear the resolver used for unknown identifiers.
    fn set_var_resolver(&mut self, resolver: Option<VarResolver>);

    /// Register a host opcode under the given name.
    fn register_function(&mut self, name: &str, func: HostFn);

    /// Compile one section of script text. `line_offset` is the section's
    /// starting line in the original file, used in error messages.
    fn compile(&mut self, text: &str, line_offset: u32) -> Result<CodeId, String>;

    /// Execute a previously compiled section.
    fn execute(&mut self, code: CodeId);

    /// Visit every registered variable. Returning `false` stops the walk.
    fn for_each_var(&mut self, visit: &mut dyn FnMut(&str, VarRef) -> bool);

    /// Set the script RAM ceiling in bytes.
    fn set_mem_limit(&mut self, bytes: u32);

    /// Preallocate script RAM; -1 preallocates up to the ceiling.
    fn prealloc_mem(&mut self, bytes: i64);

    /// Drop all compiled code handles.
    fn drop_code(&mut self);

    /// Housekeeping after an unload: forget variables no code references.
    fn remove_unused_vars(&mut self);

    /// Housekeeping after an unload: release script RAM.
    fn free_ram(&mut self);
}
