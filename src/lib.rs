//! # rsfx - scripted audio effect runtime
//!
//! A host-embeddable runtime for JSFX-style scripted audio effects. An
//! effect is a text file with metadata headers and named code sections
//! (`@init`, `@slider`, `@block`, `@sample`, `@gfx`, `@serialize`); this
//! crate parses it, compiles the sections through an embedded
//! expression-language VM, and executes them inside the host's real-time
//! audio callback.
//!
//! ## Core Features
//!
//! - **Header & section parsing**: description/author/tags, pin
//!   declarations, `config:` constants, `options:`, the full `sliderN:`
//!   grammar (ranges, enums, path sliders, log/sqr curve shapes)
//! - **Preprocessing**: `<? ?>` directives expanded before parsing,
//!   seeded from `config:` constants
//! - **Imports**: recursive, depth-first post-order resolution with
//!   case-insensitive lookup and diamond deduplication
//! - **Real-time dispatch**: per-block `@block`, per-frame `@sample`,
//!   pass-through degradation when uncompiled, MIDI in/out buffering
//! - **Slider signaling**: lock-free 64-bit change/automation/touch/
//!   visibility masks per 64-slider group
//! - **Presets**: the RPL bank format with its legacy escaping rules,
//!   byte-exact save/load round trips, value-semantics bank editing
//! - **State**: opaque `@serialize` snapshots for host persistence and
//!   undo
//!
//! ## Quick Start
//!
//! ```rust
//! use rsfx::engine::{DspContext, Effect, EngineConfig, LoadOptions, CompileOptions};
//! use rsfx::mock_vm::MockVm;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("gain.jsfx");
//! std::fs::write(&path, "desc:gain\nslider1:vol=0.5<0,1,0.01>Volume\n@init\n")?;
//!
//! let mut fx = Effect::new(EngineConfig::default(), Box::new(MockVm::new()));
//! fx.load(&path, &LoadOptions::default())?;
//! fx.compile(&CompileOptions::default())?;
//! fx.init();
//!
//! assert_eq!(fx.slider_value(0), 0.5);
//!
//! let mut ctx = DspContext::new();
//! let (input, mut output) = ([0.0f32; 64], [0.0f32; 64]);
//! fx.process_float(&mut ctx, &[&input], &mut [&mut output], 64);
//! # Ok(())
//! # }
//! ```
//!
//! The expression-language VM itself is a collaborator, consumed through
//! [`vm::Vm`]; [`mock_vm::MockVm`] is a deterministic stand-in used by the
//! test suite and by hosts that only need the parsing/preset machinery.

pub mod engine;
pub mod files;
pub mod host_stub;
pub mod midi;
pub mod mock_vm;
pub mod parse;
pub mod paths;
pub mod preprocess;
pub mod preset;
pub mod slider_curve;
pub mod types;
pub mod vm;

pub use engine::state::{EffectState, SliderValue};
pub use engine::{
    CompileOptions, DspContext, Effect, EngineConfig, LoadOptions, SliderSignals,
};
pub use preset::{Bank, Preset};
pub use types::{
    EngineError, EngineResult, Header, ParseError, PlaybackState, Real, SliderDef, SliderShape,
    TimeInfo,
};
