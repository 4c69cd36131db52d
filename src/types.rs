//! Core data model for scripted effects
//!
//! Holds the parsed representation of an effect source (header metadata,
//! slider definitions, code sections) and the crate-wide error types.

use std::fmt;
use std::io;

/// Numeric type used for slider values, VM variables and sample data.
pub type Real = f64;

/// Maximum number of sliders an effect can declare.
pub const MAX_SLIDERS: usize = 256;
/// Sliders are partitioned into 64-wide groups matching the bitmask width
/// used for change/automation/touch/visibility signaling.
pub const SLIDER_GROUP_SIZE: usize = 64;
/// Number of 64-slider groups.
pub const MAX_SLIDER_GROUPS: usize = MAX_SLIDERS / SLIDER_GROUP_SIZE;
/// Maximum audio channels an effect can address (`spl0` .. `spl63`).
pub const MAX_CHANNELS: usize = 64;
/// Capacity of the per-effect file handle table, serializer included.
pub const MAX_FILE_HANDLES: usize = 64;
/// Number of trigger bits addressable through `send_trigger`.
pub const MAX_TRIGGERS: u32 = 32;
/// Import chains deeper than this abort the load.
pub const MAX_IMPORT_DEPTH: u32 = 32;

/// Value-curve shape of a slider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliderShape {
    #[default]
    Linear,
    Log,
    Sqr,
}

/// One parsed `sliderN:` declaration.
#[derive(Clone, Debug)]
pub struct SliderDef {
    /// 0-based slider id.
    pub id: u32,
    /// Variable name the script uses for this slider (`sliderN` when the
    /// declaration does not alias one).
    pub var: String,
    pub def: Real,
    pub min: Real,
    pub max: Real,
    pub inc: Real,
    pub shape: SliderShape,
    pub shape_modifier: Real,
    pub is_enum: bool,
    /// Enumeration labels; for path sliders these are filled from a
    /// directory listing after parsing.
    pub enum_names: Vec<String>,
    /// Non-empty for path sliders (`slider1:/dir:0:desc`).
    pub path: String,
    pub initially_visible: bool,
    pub desc: String,
    /// Set once a `sliderN:` line has actually been parsed into this slot.
    pub exists: bool,
}

impl Default for SliderDef {
    fn default() -> Self {
        Self {
            id: 0,
            var: String::new(),
            def: 0.0,
            min: 0.0,
            max: 1.0,
            inc: 0.0,
            shape: SliderShape::Linear,
            shape_modifier: 0.0,
            is_enum: false,
            enum_names: Vec::new(),
            path: String::new(),
            initially_visible: true,
            desc: String::new(),
            exists: false,
        }
    }
}

/// One `config:` line: a compile-time constant with named variants.
#[derive(Clone, Debug, Default)]
pub struct ConfigItem {
    pub identifier: String,
    pub name: String,
    pub default_value: Real,
    pub var_names: Vec<String>,
    pub var_values: Vec<Real>,
}

impl ConfigItem {
    /// A config line only takes effect when it is structurally complete.
    pub fn is_valid(&self) -> bool {
        self.identifier.len() >= 2
            && self.name.len() >= 2
            && self.var_names.len() >= 2
            && self.var_values.len() >= 2
            && self.var_names.iter().all(|n| !n.is_empty())
    }
}

/// `options:` line contents.
#[derive(Clone, Debug)]
pub struct HeaderOptions {
    /// Shared memory namespace, when requested.
    pub gmem: String,
    /// VM memory ceiling in bytes; 0 means "use the engine default".
    pub maxmem: u32,
    /// Bytes of VM memory to preallocate; -1 preallocates the whole ceiling.
    pub prealloc: i64,
    pub want_all_kb: bool,
    pub no_meter: bool,
    /// Requested `@gfx` frame rate.
    pub gfx_hz: u32,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            gmem: String::new(),
            maxmem: 0,
            prealloc: 0,
            want_all_kb: false,
            no_meter: false,
            gfx_hz: 30,
        }
    }
}

/// Parsed header metadata of one source file.
#[derive(Clone, Debug)]
pub struct Header {
    pub desc: String,
    pub author: String,
    pub tags: Vec<String>,
    /// True once an `in_pin:` or `out_pin:` line was seen.
    pub explicit_pins: bool,
    pub in_pins: Vec<String>,
    pub out_pins: Vec<String>,
    pub imports: Vec<String>,
    pub config_items: Vec<ConfigItem>,
    pub options: HeaderOptions,
    /// Always `MAX_SLIDERS` entries; unused slots have `exists == false`.
    pub sliders: Vec<SliderDef>,
    /// `filename:N,name` table, in declaration order.
    pub filenames: Vec<String>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            desc: String::new(),
            author: String::new(),
            tags: Vec::new(),
            explicit_pins: false,
            in_pins: Vec::new(),
            out_pins: Vec::new(),
            imports: Vec::new(),
            config_items: Vec::new(),
            options: HeaderOptions::default(),
            sliders: vec![SliderDef::default(); MAX_SLIDERS],
            filenames: Vec::new(),
        }
    }
}

/// One named code section, retaining where it started in the file so
/// compile errors can report original line numbers.
#[derive(Clone, Debug, Default)]
pub struct Section {
    pub text: String,
    pub line_offset: u32,
}

/// All sections of one source file, split but not yet compiled.
#[derive(Clone, Debug, Default)]
pub struct Toplevel {
    pub header: Section,
    pub init: Option<Section>,
    pub slider: Option<Section>,
    pub block: Option<Section>,
    pub sample: Option<Section>,
    pub gfx: Option<Section>,
    pub serialize: Option<Section>,
    /// Requested graphics dimensions from the `@gfx w h` line; 0 = none.
    pub gfx_w: u32,
    pub gfx_h: u32,
}

/// One parsed file: sections plus header metadata.
#[derive(Clone, Debug, Default)]
pub struct SourceUnit {
    pub toplevel: Toplevel,
    pub header: Header,
}

/// Host transport state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Recording,
}

impl PlaybackState {
    pub fn is_running(self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Recording)
    }
}

/// Tempo/transport snapshot handed to the engine once per block.
#[derive(Clone, Copy, Debug)]
pub struct TimeInfo {
    pub tempo: f64,
    pub playback_state: PlaybackState,
    /// Transport position in seconds.
    pub time_position: f64,
    /// Transport position in quarter notes.
    pub beat_position: f64,
    pub time_signature: [u32; 2],
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            playback_state: PlaybackState::Playing,
            time_position: 0.0,
            beat_position: 0.0,
            time_signature: [4, 4],
        }
    }
}

/// Error raised while preprocessing or parsing source text.
#[derive(Clone, Debug)]
pub struct ParseError {
    /// 0-based line number.
    pub line: u32,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line + 1, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Engine error types.
#[derive(Debug)]
pub enum EngineError {
    /// Preprocessor or header/section parse failure.
    Parse(ParseError),
    /// Import could not be resolved, opened, or nested too deep.
    Import(String),
    /// A code section was rejected by the VM.
    Compile { section: String, message: String },
    /// File open/read/write failure.
    Io(io::Error),
    /// An operation that needs loaded source was called without one.
    NoSource,
    /// An operation that needs compiled code was called without it.
    NotCompiled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Parse(e) => write!(f, "parse error: {}", e),
            EngineError::Import(msg) => write!(f, "import error: {}", msg),
            EngineError::Compile { section, message } => {
                write!(f, "compile error in {}: {}", section, message)
            }
            EngineError::Io(e) => write!(f, "IO error: {}", e),
            EngineError::NoSource => write!(f, "no source is loaded"),
            EngineError::NotCompiled => write!(f, "effect is not compiled"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Parse(e) => Some(e),
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::Parse(e)
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
