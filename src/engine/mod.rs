//! Effect engine
//!
//! Owns one scripted effect end to end: source loading with recursive
//! import resolution, section compilation through the embedded VM,
//! (re)initialization, the per-block audio/MIDI dispatch, and the
//! slider/visibility/automation bitmask API the host polls.
//!
//! # Threading
//!
//! Three roles share one effect: the audio thread calls
//! [`Effect::process_float`]/[`Effect::process_double`] on a real-time
//! deadline, the control thread drives `load`/`compile` and slider edits,
//! and an optional graphics thread runs `@gfx`. Hosts that share one
//! instance across threads wrap it in `Arc<Mutex<..>>` (or swap whole
//! instances), but mask polling never needs that lock: clone the
//! [`SliderSignals`] handle out of [`Effect::signals`] and read the atomic
//! bitmasks directly. Nothing on the audio path takes a lock that a slower
//! thread can hold.

pub mod process;
pub mod state;

use crate::files::{FileTable, RawFile, Serializer, TextFile};
use crate::midi::MidiBuffer;
use crate::parse;
use crate::paths;
use crate::preprocess::preprocess;
use crate::preset::locate_companion_bank;
use crate::slider_curve::SliderCurve;
use crate::types::{
    EngineError, EngineResult, Header, Real, Section, SliderDef, SourceUnit, Toplevel,
    MAX_CHANNELS, MAX_IMPORT_DEPTH, MAX_SLIDERS, MAX_SLIDER_GROUPS,
};
use crate::vm::{CodeId, HostArg, VarRef, Vm, VmAccess};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Engine-level configuration shared by every effect the host creates.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Extra root searched for `import` files.
    pub import_root: Option<PathBuf>,
    /// Root for data files referenced by path sliders and `filename:`.
    pub data_root: Option<PathBuf>,
    /// File extensions recognized as audio when enumerating directories.
    pub audio_extensions: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            import_root: None,
            data_root: None,
            audio_extensions: ["wav", "flac", "ogg", "mp3", "aif", "aiff"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Options for [`Effect::load`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    /// Skip `import` resolution entirely.
    pub ignore_imports: bool,
}

/// Options for [`Effect::compile`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CompileOptions {
    /// Do not compile `@gfx`.
    pub no_gfx: bool,
    /// Do not compile `@serialize`.
    pub no_serialize: bool,
}

/// Capability token for the real-time entry points. Constructing one per
/// audio thread makes the "process runs on the audio thread" contract an
/// explicit argument instead of ambient state.
#[derive(Debug, Default)]
pub struct DspContext {
    _private: (),
}

impl DspContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Which 64-slider group a slider index belongs to.
pub fn slider_group_index(slider: u32) -> u8 {
    (slider >> 6) as u8
}

/// Bit for a slider inside its group's mask.
pub fn slider_group_mask(slider: u32, group: u8) -> u64 {
    1u64 << (slider - ((group as u32) << 6))
}

/// Lock-free slider signaling between the audio thread and the host.
/// Change and automation masks are cleared by fetching; touch and
/// visibility are plain loads.
pub struct SliderSignals {
    change: [AtomicU64; MAX_SLIDER_GROUPS],
    automate: [AtomicU64; MAX_SLIDER_GROUPS],
    touch: [AtomicU64; MAX_SLIDER_GROUPS],
    visible: [AtomicU64; MAX_SLIDER_GROUPS],
}

impl SliderSignals {
    fn new() -> Self {
        Self {
            change: Default::default(),
            automate: Default::default(),
            touch: Default::default(),
            visible: Default::default(),
        }
    }

    /// Fetch-and-clear the change mask of one group.
    pub fn fetch_changes(&self, group: u8) -> u64 {
        self.change[group as usize & (MAX_SLIDER_GROUPS - 1)].swap(0, Ordering::AcqRel)
    }

    /// Fetch-and-clear the automation mask of one group.
    pub fn fetch_automations(&self, group: u8) -> u64 {
        self.automate[group as usize & (MAX_SLIDER_GROUPS - 1)].swap(0, Ordering::AcqRel)
    }

    /// Touch mask of one group; persists until the script releases it.
    pub fn touches(&self, group: u8) -> u64 {
        self.touch[group as usize & (MAX_SLIDER_GROUPS - 1)].load(Ordering::Acquire)
    }

    /// Visibility mask of one group.
    pub fn visibility(&self, group: u8) -> u64 {
        self.visible[group as usize & (MAX_SLIDER_GROUPS - 1)].load(Ordering::Acquire)
    }

    fn group_bit(slider: u32) -> (usize, u64) {
        ((slider as usize / 64) % MAX_SLIDER_GROUPS, 1u64 << (slider % 64))
    }

    pub(crate) fn mark_change(&self, slider: u32) {
        let (group, bit) = Self::group_bit(slider);
        self.change[group].fetch_or(bit, Ordering::AcqRel);
    }

    pub(crate) fn mark_automate(&self, slider: u32) {
        let (group, bit) = Self::group_bit(slider);
        self.automate[group].fetch_or(bit, Ordering::AcqRel);
    }

    pub(crate) fn set_touch(&self, slider: u32, touched: bool) {
        let (group, bit) = Self::group_bit(slider);
        if touched {
            self.touch[group].fetch_or(bit, Ordering::AcqRel);
        } else {
            self.touch[group].fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Show (`mode > 0`), hide (`mode == 0`) or toggle (`mode < 0`) one
    /// slider's visibility bit, marking its change bit.
    pub(crate) fn show_slider(&self, slider: u32, mode: i32) -> bool {
        let (group, bit) = Self::group_bit(slider);
        let shown = match mode {
            m if m > 0 => true,
            m if m < 0 => self.visible[group].load(Ordering::Acquire) & bit == 0,
            _ => false,
        };
        if shown {
            self.visible[group].fetch_or(bit, Ordering::AcqRel);
        } else {
            self.visible[group].fetch_and(!bit, Ordering::AcqRel);
        }
        self.change[group].fetch_or(bit, Ordering::AcqRel);
        shown
    }

    fn reset_events(&self) {
        for group in 0..MAX_SLIDER_GROUPS {
            self.change[group].store(0, Ordering::Release);
            self.automate[group].store(0, Ordering::Release);
            self.touch[group].store(0, Ordering::Release);
        }
    }

    fn init_visibility(&self, sliders: &[SliderDef]) {
        let mut index = 0;
        for group in 0..MAX_SLIDER_GROUPS {
            let mut visible = 0u64;
            for bit in 0..64 {
                let slider = &sliders[index];
                if slider.exists && slider.initially_visible {
                    visible |= 1u64 << bit;
                }
                index += 1;
            }
            self.visible[group].store(visible, Ordering::Release);
        }
    }
}

/// Registered VM variables the engine reads and writes directly.
pub(crate) struct VmVars {
    pub spl: Vec<VarRef>,
    pub slider: Vec<VarRef>,
    pub srate: VarRef,
    pub num_ch: VarRef,
    pub samplesblock: VarRef,
    pub trigger: VarRef,
    pub tempo: VarRef,
    pub play_state: VarRef,
    pub play_position: VarRef,
    pub beat_position: VarRef,
    pub ts_num: VarRef,
    pub ts_denom: VarRef,
    pub ext_noinit: VarRef,
    pub ext_nodenorm: VarRef,
    pub ext_midi_bus: VarRef,
    pub midi_bus: VarRef,
    pub pdc_delay: VarRef,
    pub pdc_bot_ch: VarRef,
    pub pdc_top_ch: VarRef,
    pub pdc_midi: VarRef,
    pub gfx_ext_retina: VarRef,
}

/// Everything produced by a successful `load`.
pub(crate) struct SourceState {
    pub main: SourceUnit,
    pub main_path: PathBuf,
    pub imports: Vec<SourceUnit>,
    pub slider_alias: HashMap<String, u32>,
    pub bank_path: Option<PathBuf>,
}

/// Compiled code handles.
#[derive(Default)]
pub(crate) struct CodeState {
    pub init: Vec<Option<CodeId>>,
    pub slider: Option<CodeId>,
    pub block: Option<CodeId>,
    pub sample: Option<CodeId>,
    pub gfx: Option<CodeId>,
    pub serialize: Option<CodeId>,
    pub compiled: bool,
}

#[derive(Default)]
struct GfxInner {
    ready: bool,
    wants_retina: bool,
}

/// Data-file lookup state shared with the `file_*` host opcodes.
#[derive(Default)]
struct DataFileContext {
    main_dir: Option<PathBuf>,
    data_root: Option<PathBuf>,
    filenames: Vec<String>,
    path_sliders: HashMap<u32, (String, Vec<String>)>,
}

/// One loaded scripted effect.
pub struct Effect {
    pub(crate) config: EngineConfig,
    pub(crate) vm: Box<dyn Vm>,
    pub(crate) vars: VmVars,
    built_ins: HashSet<VarRef>,
    slider_of_var: Arc<HashMap<VarRef, u32>>,
    pub(crate) source: Option<SourceState>,
    pub(crate) code: CodeState,
    pub(crate) has_serialize: bool,
    pub(crate) is_freshly_compiled: bool,
    pub(crate) must_compute_init: bool,
    pub(crate) must_compute_slider: bool,
    signals: Arc<SliderSignals>,
    pub(crate) serializer: Arc<Mutex<Serializer>>,
    files: Arc<FileTable>,
    file_ctx: Arc<Mutex<DataFileContext>>,
    pub(crate) midi_in: Arc<Mutex<MidiBuffer>>,
    pub(crate) midi_out: Arc<Mutex<MidiBuffer>>,
    pub(crate) pending_triggers: AtomicU32,
    pub(crate) sample_rate: Real,
    pub(crate) block_size: u32,
    pub(crate) valid_input_channels: u32,
    gfx: Mutex<GfxInner>,
    gfx_must_init: AtomicBool,
}

fn register_builtin(
    vm: &mut dyn Vm,
    built_ins: &mut HashSet<VarRef>,
    name: &str,
    value: Real,
) -> VarRef {
    let var = vm.register_var(name);
    vm.set_var(var, value);
    built_ins.insert(var);
    var
}

impl Effect {
    pub fn new(config: EngineConfig, mut vm: Box<dyn Vm>) -> Self {
        let mut built_ins = HashSet::new();

        let mut spl = Vec::with_capacity(MAX_CHANNELS);
        for i in 0..MAX_CHANNELS {
            spl.push(register_builtin(
                vm.as_mut(),
                &mut built_ins,
                &format!("spl{}", i),
                0.0,
            ));
        }

        let mut slider = Vec::with_capacity(MAX_SLIDERS);
        let mut slider_of_var = HashMap::with_capacity(MAX_SLIDERS);
        for i in 0..MAX_SLIDERS {
            let var = register_builtin(
                vm.as_mut(),
                &mut built_ins,
                &format!("slider{}", i + 1),
                0.0,
            );
            slider_of_var.insert(var, i as u32);
            slider.push(var);
        }

        let sample_rate = 44100.0;
        let block_size = 128;

        let auto =
            |vm: &mut Box<dyn Vm>, built_ins: &mut HashSet<VarRef>, name: &str, value: Real| {
                register_builtin(vm.as_mut(), built_ins, name, value)
            };

        let vars = VmVars {
            srate: auto(&mut vm, &mut built_ins, "srate", sample_rate),
            num_ch: auto(&mut vm, &mut built_ins, "num_ch", 0.0),
            samplesblock: auto(&mut vm, &mut built_ins, "samplesblock", block_size as Real),
            trigger: auto(&mut vm, &mut built_ins, "trigger", 0.0),
            tempo: auto(&mut vm, &mut built_ins, "tempo", 120.0),
            play_state: auto(&mut vm, &mut built_ins, "play_state", 1.0),
            play_position: auto(&mut vm, &mut built_ins, "play_position", 0.0),
            beat_position: auto(&mut vm, &mut built_ins, "beat_position", 0.0),
            ts_num: auto(&mut vm, &mut built_ins, "ts_num", 0.0),
            ts_denom: auto(&mut vm, &mut built_ins, "ts_denom", 4.0),
            ext_noinit: auto(&mut vm, &mut built_ins, "ext_noinit", 0.0),
            ext_nodenorm: auto(&mut vm, &mut built_ins, "ext_nodenorm", 0.0),
            ext_midi_bus: auto(&mut vm, &mut built_ins, "ext_midi_bus", 0.0),
            midi_bus: auto(&mut vm, &mut built_ins, "midi_bus", 0.0),
            pdc_delay: auto(&mut vm, &mut built_ins, "pdc_delay", 0.0),
            pdc_bot_ch: auto(&mut vm, &mut built_ins, "pdc_bot_ch", 0.0),
            pdc_top_ch: auto(&mut vm, &mut built_ins, "pdc_top_ch", 0.0),
            pdc_midi: auto(&mut vm, &mut built_ins, "pdc_midi", 0.0),
            gfx_ext_retina: auto(&mut vm, &mut built_ins, "gfx_ext_retina", 0.0),
            spl,
            slider,
        };

        // graphics and mouse state the script may keep across re-inits
        for name in [
            "gfx_r", "gfx_g", "gfx_b", "gfx_a", "gfx_a2", "gfx_w", "gfx_h", "gfx_x", "gfx_y",
            "gfx_mode", "gfx_clear", "gfx_texth", "gfx_dest", "mouse_x", "mouse_y", "mouse_cap",
            "mouse_wheel", "mouse_hwheel",
        ] {
            register_builtin(vm.as_mut(), &mut built_ins, name, 0.0);
        }

        let serializer = Arc::new(Mutex::new(Serializer::new()));
        let files = Arc::new(FileTable::new(serializer.clone()));
        let signals = Arc::new(SliderSignals::new());
        let slider_of_var = Arc::new(slider_of_var);
        let file_ctx = Arc::new(Mutex::new(DataFileContext::default()));

        let mut midi_in = MidiBuffer::new();
        let mut midi_out = MidiBuffer::new();
        midi_in.reserve(1024, true);
        midi_out.reserve(1024, true);
        let midi_in = Arc::new(Mutex::new(midi_in));
        let midi_out = Arc::new(Mutex::new(midi_out));

        let mut effect = Self {
            config,
            vm,
            vars,
            built_ins,
            slider_of_var,
            source: None,
            code: CodeState::default(),
            has_serialize: false,
            is_freshly_compiled: false,
            must_compute_init: false,
            must_compute_slider: false,
            signals,
            serializer,
            files,
            file_ctx,
            midi_in,
            midi_out,
            pending_triggers: AtomicU32::new(0),
            sample_rate,
            block_size,
            valid_input_channels: 0,
            gfx: Mutex::new(GfxInner::default()),
            gfx_must_init: AtomicBool::new(false),
        };
        effect.register_host_functions();
        crate::host_stub::register_host_stubs(effect.vm.as_mut());
        effect
    }

    /// Lock-free signal block; clone this out to poll masks from another
    /// thread.
    pub fn signals(&self) -> Arc<SliderSignals> {
        self.signals.clone()
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    //--------------------------------------------------------------------------
    // host opcode registration

    fn register_host_functions(&mut self) {
        let slider_of_var = self.slider_of_var.clone();
        let resolve_slider = move |arg: Option<&HostArg>| -> Option<u32> {
            match arg? {
                HostArg::Var(var) => slider_of_var.get(var).copied(),
                HostArg::Value(value) => {
                    let n = value.round() as i64;
                    (n >= 1 && n <= MAX_SLIDERS as i64).then(|| (n - 1) as u32)
                }
            }
        };

        {
            let signals = self.signals.clone();
            let resolve = resolve_slider.clone();
            self.vm.register_function(
                "slider_show",
                Arc::new(move |vars, args| {
                    let Some(index) = resolve(args.first()) else {
                        return 0.0;
                    };
                    let mode = args.get(1).map(|a| vars.arg_value(*a)).unwrap_or(1.0);
                    let mode = if mode < 0.0 {
                        -1
                    } else if mode >= 0.5 {
                        1
                    } else {
                        0
                    };
                    if signals.show_slider(index, mode) {
                        1.0
                    } else {
                        0.0
                    }
                }),
            );
        }

        {
            let signals = self.signals.clone();
            let resolve = resolve_slider.clone();
            self.vm.register_function(
                "sliderchange",
                Arc::new(move |_vars, args| {
                    if let Some(index) = resolve(args.first()) {
                        signals.mark_change(index);
                    }
                    0.0
                }),
            );
        }

        {
            let signals = self.signals.clone();
            let resolve = resolve_slider.clone();
            self.vm.register_function(
                "slider_automate",
                Arc::new(move |vars, args| {
                    let Some(index) = resolve(args.first()) else {
                        return 0.0;
                    };
                    match args.get(1) {
                        Some(touch) => {
                            signals.set_touch(index, vars.arg_value(*touch) != 0.0);
                        }
                        None => signals.mark_automate(index),
                    }
                    0.0
                }),
            );
        }

        {
            let files = self.files.clone();
            let file_ctx = self.file_ctx.clone();
            let slider_of_var = self.slider_of_var.clone();
            let slider_vars = self.vars.slider.clone();
            self.vm.register_function(
                "file_open",
                Arc::new(move |vars, args| {
                    let ctx = file_ctx.lock().unwrap();
                    let filepart = match args.first() {
                        Some(HostArg::Var(var)) if slider_of_var.contains_key(var) => {
                            let index = slider_of_var[var];
                            ctx.path_sliders.get(&index).and_then(|(path, names)| {
                                let value =
                                    vars.get_var(slider_vars[index as usize]).round() as i64;
                                if value >= 0 && (value as usize) < names.len() {
                                    Some(format!("{}/{}", path, names[value as usize]))
                                } else {
                                    None
                                }
                            })
                        }
                        Some(arg) => {
                            let index = vars.arg_value(*arg).round() as i64;
                            if index >= 0 {
                                ctx.filenames.get(index as usize).cloned()
                            } else {
                                None
                            }
                        }
                        None => None,
                    };
                    let Some(filepart) = filepart else {
                        return -1.0;
                    };

                    let relative = filepart.trim_start_matches('/');
                    let mut candidates = Vec::with_capacity(2);
                    if let Some(dir) = &ctx.main_dir {
                        candidates.push(dir.join(relative));
                    }
                    if let Some(root) = &ctx.data_root {
                        candidates.push(root.join(relative));
                    }
                    for candidate in candidates {
                        if !candidate.is_file() {
                            continue;
                        }
                        let opened: Option<crate::files::FileHandle> =
                            if paths::has_extension(&candidate, "txt") {
                                TextFile::open(&candidate)
                                    .ok()
                                    .map(|f| Arc::new(Mutex::new(f)) as crate::files::FileHandle)
                            } else {
                                RawFile::open(&candidate)
                                    .ok()
                                    .map(|f| Arc::new(Mutex::new(f)) as crate::files::FileHandle)
                            };
                        if let Some(file) = opened {
                            if let Some(handle) = files.insert(file) {
                                return handle as Real;
                            }
                        }
                        return -1.0;
                    }
                    -1.0
                }),
            );
        }

        {
            let files = self.files.clone();
            self.vm.register_function(
                "file_close",
                Arc::new(move |vars, args| {
                    let handle = args
                        .first()
                        .map(|a| vars.arg_value(*a).round())
                        .unwrap_or(-1.0);
                    if handle >= 0.0 {
                        files.close(handle as u32);
                    }
                    0.0
                }),
            );
        }

        {
            let files = self.files.clone();
            self.vm.register_function(
                "file_var",
                Arc::new(move |vars, args| {
                    let handle = args
                        .first()
                        .map(|a| vars.arg_value(*a).round())
                        .unwrap_or(-1.0);
                    if handle < 0.0 {
                        return 0.0;
                    }
                    let Some(file) = files.get(handle as u32) else {
                        return 0.0;
                    };
                    let mut file = file.lock().unwrap();
                    if file.in_write_mode() {
                        let value = args.get(1).map(|a| vars.arg_value(*a)).unwrap_or(0.0);
                        file.write_value(value);
                        value
                    } else {
                        let value = file.read_value().unwrap_or(0.0);
                        if let Some(HostArg::Var(var)) = args.get(1) {
                            vars.set_var(*var, value);
                        }
                        value
                    }
                }),
            );
        }

        {
            let files = self.files.clone();
            self.vm.register_function(
                "file_mem",
                Arc::new(move |vars, args| {
                    let handle = args
                        .first()
                        .map(|a| vars.arg_value(*a).round())
                        .unwrap_or(-1.0);
                    let addr = args.get(1).map(|a| vars.arg_value(*a)).unwrap_or(0.0);
                    let count = args.get(2).map(|a| vars.arg_value(*a)).unwrap_or(0.0);
                    if handle < 0.0 || addr < 0.0 || count <= 0.0 {
                        return 0.0;
                    }
                    let Some(file) = files.get(handle as u32) else {
                        return 0.0;
                    };
                    let mut file = file.lock().unwrap();
                    let addr = addr as u32;
                    let count = count as usize;
                    if file.in_write_mode() {
                        let mut values = vec![0.0; count];
                        vars.read_ram(addr, &mut values);
                        for value in values {
                            file.write_value(value);
                        }
                    } else {
                        let values: Vec<Real> = (0..count)
                            .map(|_| file.read_value().unwrap_or(0.0))
                            .collect();
                        vars.write_ram(addr, &values);
                    }
                    count as Real
                }),
            );
        }

        {
            let files = self.files.clone();
            self.vm.register_function(
                "file_avail",
                Arc::new(move |vars, args| {
                    let handle = args
                        .first()
                        .map(|a| vars.arg_value(*a).round())
                        .unwrap_or(-1.0);
                    if handle < 0.0 {
                        return -1.0;
                    }
                    match files.get(handle as u32) {
                        Some(file) => file.lock().unwrap().avail() as Real,
                        None => -1.0,
                    }
                }),
            );
        }

        {
            let midi_out = self.midi_out.clone();
            let ext_midi_bus = self.vars.ext_midi_bus;
            let midi_bus = self.vars.midi_bus;
            self.vm.register_function(
                "midisend",
                Arc::new(move |vars, args| {
                    if args.len() < 3 {
                        return 0.0;
                    }
                    let value = |i: usize| args.get(i).map(|a| vars.arg_value(*a)).unwrap_or(0.0);
                    let offset = value(0).max(0.0) as u32;
                    let msg1 = value(1) as i64 as u8;
                    let (msg2, msg3) = if args.len() >= 4 {
                        (value(2) as i64 as u8, value(3) as i64 as u8)
                    } else {
                        let msg23 = value(2) as i64;
                        ((msg23 & 0xff) as u8, ((msg23 >> 8) & 0xff) as u8)
                    };
                    let bus = if vars.get_var(ext_midi_bus) != 0.0 {
                        vars.get_var(midi_bus).max(0.0) as u32
                    } else {
                        0
                    };
                    let pushed = midi_out.lock().unwrap().push(crate::midi::MidiEvent::new(
                        bus,
                        offset,
                        &[msg1, msg2, msg3],
                    ));
                    if pushed {
                        msg1 as Real
                    } else {
                        0.0
                    }
                }),
            );
        }

        {
            let midi_in = self.midi_in.clone();
            let ext_midi_bus = self.vars.ext_midi_bus;
            let midi_bus = self.vars.midi_bus;
            self.vm.register_function(
                "midirecv",
                Arc::new(move |vars, args| {
                    if args.len() < 3 {
                        return 0.0;
                    }
                    let bus = if vars.get_var(ext_midi_bus) != 0.0 {
                        vars.get_var(midi_bus).max(0.0) as u32
                    } else {
                        0
                    };
                    let event = loop {
                        match midi_in.lock().unwrap().next_event_from_bus(bus) {
                            Some(event) if event.data.len() == 3 => break Some(event),
                            Some(_) => continue,
                            None => break None,
                        }
                    };
                    let Some(event) = event else {
                        return 0.0;
                    };
                    let mut set = |i: usize, value: Real| {
                        if let Some(HostArg::Var(var)) = args.get(i) {
                            vars.set_var(*var, value);
                        }
                    };
                    set(0, event.offset as Real);
                    set(1, event.data[0] as Real);
                    if args.len() >= 4 {
                        set(2, event.data[1] as Real);
                        set(3, event.data[2] as Real);
                    } else {
                        set(
                            2,
                            (event.data[1] as i64 | ((event.data[2] as i64) << 8)) as Real,
                        );
                    }
                    1.0
                }),
            );
        }
    }

    //--------------------------------------------------------------------------
    // lifecycle

    /// Load and parse an effect file, resolving imports depth-first in
    /// post-order. On any failure the partial source is fully discarded.
    pub fn load(&mut self, path: &Path, opts: &LoadOptions) -> EngineResult<()> {
        self.unload();
        let result = self.load_inner(path, opts);
        if result.is_err() {
            self.unload_source();
        }
        result
    }

    fn load_inner(&mut self, path: &Path, opts: &LoadOptions) -> EngineResult<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let text = fs::read_to_string(path).map_err(|e| {
            error!("{}: cannot open file for reading", file_name);
            EngineError::Io(e)
        })?;
        let main_uid = fs::canonicalize(path).map_err(EngineError::Io)?;

        // config constants must be known before directives expand
        let prescan = parse::header_prescan(&text);
        let pre_header = parse::parse_header(&prescan).map_err(|e| {
            error!("{}:{}: {}", file_name, e.line + 1, e.message);
            e
        })?;
        let seed: HashMap<String, Real> = pre_header
            .config_items
            .iter()
            .map(|item| (item.identifier.to_ascii_lowercase(), item.default_value))
            .collect();

        let preprocessed = preprocess(&text, &seed).map_err(|e| {
            error!("{}:{}: {}", file_name, e.line + 1, e.message);
            e
        })?;
        let toplevel = parse::parse_toplevel(&preprocessed).map_err(|e| {
            error!("{}:{}: {}", file_name, e.line + 1, e.message);
            e
        })?;
        let mut header = parse::parse_header(&toplevel.header).map_err(|e| {
            error!("{}:{}: {}", file_name, e.line + 1, e.message);
            e
        })?;

        if header.desc.is_empty() {
            warn!("{}: the required `desc` field is missing", file_name);
            header.desc = file_name.clone();
        }

        if opts.ignore_imports {
            header.imports.clear();
        }

        // with @sample and no pin declarations the default is stereo
        if toplevel.sample.is_some()
            && !header.explicit_pins
            && header.in_pins.is_empty()
            && header.out_pins.is_empty()
        {
            header.in_pins = vec!["JS input 1".to_string(), "JS input 2".to_string()];
            header.out_pins = vec!["JS output 1".to_string(), "JS output 2".to_string()];
        }

        let mut slider_alias = HashMap::new();
        for (i, slider) in header.sliders.iter().enumerate() {
            if slider.exists && !slider.var.is_empty() {
                slider_alias.insert(slider.var.to_ascii_lowercase(), i as u32);
            }
        }

        self.fill_file_enums(&mut header);
        parse::fix_invalid_enums(&mut header.sliders);

        let main = SourceUnit { toplevel, header };

        let mut imports = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        seen.insert(main_uid);
        for name in main.header.imports.clone() {
            self.load_import(&name, path, 0, &seed, &mut seen, &mut imports)?;
        }

        for i in 0..MAX_SLIDERS {
            self.vm
                .set_var(self.vars.slider[i], main.header.sliders[i].def);
        }

        let alias = Arc::new(slider_alias.clone());
        let slider_vars = self.vars.slider.clone();
        self.vm.set_var_resolver(Some(Arc::new(move |name: &str| {
            alias
                .get(&name.to_ascii_lowercase())
                .map(|&i| slider_vars[i as usize])
        })));

        self.signals.init_visibility(&main.header.sliders);

        {
            let mut ctx = self.file_ctx.lock().unwrap();
            ctx.main_dir = path.parent().map(Path::to_path_buf);
            ctx.data_root = self.config.data_root.clone();
            ctx.filenames = main.header.filenames.clone();
            ctx.path_sliders = main
                .header
                .sliders
                .iter()
                .filter(|s| s.exists && !s.path.is_empty())
                .map(|s| (s.id, (s.path.clone(), s.enum_names.clone())))
                .collect();
        }

        self.source = Some(SourceState {
            main,
            main_path: path.to_path_buf(),
            imports,
            slider_alias,
            bank_path: locate_companion_bank(path),
        });

        Ok(())
    }

    fn load_import(
        &self,
        name: &str,
        origin: &Path,
        level: u32,
        main_seed: &HashMap<String, Real>,
        seen: &mut HashSet<PathBuf>,
        imports: &mut Vec<SourceUnit>,
    ) -> EngineResult<()> {
        let origin_name = origin
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if level >= MAX_IMPORT_DEPTH {
            error!("{}: too many import levels", origin_name);
            return Err(EngineError::Import("too many import levels".to_string()));
        }

        let resolved = self.resolve_import_path(name, origin).ok_or_else(|| {
            error!("{}: cannot find import: {}", origin_name, name);
            EngineError::Import(format!("cannot find import: {}", name))
        })?;
        let resolved_name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let uid = fs::canonicalize(&resolved).map_err(EngineError::Io)?;
        if !seen.insert(uid) {
            // diamond imports are visited once
            return Ok(());
        }

        let text = fs::read_to_string(&resolved).map_err(|e| {
            error!("{}: cannot open file for reading", resolved_name);
            EngineError::Io(e)
        })?;

        let prescan = parse::header_prescan(&text);
        let pre_header = parse::parse_header(&prescan).map_err(|e| {
            error!("{}:{}: {}", resolved_name, e.line + 1, e.message);
            e
        })?;
        let mut seed = main_seed.clone();
        for item in &pre_header.config_items {
            seed.entry(item.identifier.to_ascii_lowercase())
                .or_insert(item.default_value);
        }

        let preprocessed = preprocess(&text, &seed).map_err(|e| {
            error!("{}:{}: {}", resolved_name, e.line + 1, e.message);
            e
        })?;
        let toplevel = parse::parse_toplevel(&preprocessed).map_err(|e| {
            error!("{}:{}: {}", resolved_name, e.line + 1, e.message);
            e
        })?;
        let header = parse::parse_header(&toplevel.header).map_err(|e| {
            error!("{}:{}: {}", resolved_name, e.line + 1, e.message);
            e
        })?;

        let unit = SourceUnit { toplevel, header };

        // dependencies first, then the importer itself
        for child in unit.header.imports.clone() {
            self.load_import(&child, &resolved, level + 1, main_seed, seen, imports)?;
        }
        imports.push(unit);

        Ok(())
    }

    /// Resolve an import name: the importer's directory first, then the
    /// configured import root, each tried exactly and then recursively,
    /// with case-insensitive file name matching.
    pub fn resolve_import_path(&self, name: &str, origin: &Path) -> Option<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::with_capacity(2);
        if let Some(dir) = origin.parent() {
            dirs.push(dir.to_path_buf());
        }
        if let Some(root) = &self.config.import_root {
            if dirs.first() != Some(root) {
                dirs.push(root.clone());
            }
        }

        for dir in &dirs {
            if let Some(found) = paths::resolve_case_insensitive(dir, name) {
                if found.is_file() {
                    return Some(found);
                }
            }
        }
        for dir in &dirs {
            if let Some(found) = paths::find_in_tree(dir, name) {
                return Some(found);
            }
        }
        None
    }

    fn detect_file_kind(&self, name: &str) -> bool {
        let path = Path::new(name);
        paths::has_extension(path, "txt")
            || paths::has_extension(path, "raw")
            || self
                .config
                .audio_extensions
                .iter()
                .any(|ext| paths::has_extension(path, ext))
    }

    /// Populate path-slider enumerations from directory listings under the
    /// configured data root.
    fn fill_file_enums(&self, header: &mut Header) {
        let Some(data_root) = &self.config.data_root else {
            return;
        };
        for slider in header.sliders.iter_mut() {
            if !slider.exists || slider.path.is_empty() {
                continue;
            }
            let dir = data_root.join(slider.path.trim_start_matches('/'));
            for filename in paths::list_files(&dir) {
                if self.detect_file_kind(&filename) {
                    slider.enum_names.push(filename);
                }
            }
            if !slider.enum_names.is_empty() {
                slider.max = (slider.enum_names.len() - 1) as Real;
            }
        }
    }

    /// Compile every code section through the VM. Any failure rolls the
    /// engine back to the loaded-but-uncompiled state.
    pub fn compile(&mut self, opts: &CompileOptions) -> EngineResult<()> {
        self.unload_code();

        if self.source.is_none() {
            error!("???: no source is loaded, cannot compile");
            return Err(EngineError::NoSource);
        }

        let source = self.source.take().unwrap();
        let result = self.compile_with(&source, opts);
        self.source = Some(source);

        if result.is_err() {
            self.unload_code();
        }
        result
    }

    fn compile_with(&mut self, source: &SourceState, opts: &CompileOptions) -> EngineResult<()> {
        {
            let mut maxmem = source.main.header.options.maxmem;
            if maxmem == 0 {
                maxmem = 8 * 1024 * 1024;
            }
            if maxmem > 128 * 1024 * 1024 {
                maxmem = 128 * 1024 * 1024;
            }
            self.vm.set_mem_limit(maxmem);
            let prealloc = source.main.header.options.prealloc;
            if prealloc != 0 {
                self.vm.prealloc_mem(prealloc);
            }
        }

        fn compile_section(
            vm: &mut Box<dyn Vm>,
            section: &Section,
            name: &str,
        ) -> EngineResult<Option<CodeId>> {
            if section.text.is_empty() {
                return Ok(None);
            }
            match vm.compile(&section.text, section.line_offset) {
                Ok(code) => Ok(Some(code)),
                Err(message) => {
                    error!("{}: {}", name, message);
                    Err(EngineError::Compile {
                        section: name.to_string(),
                        message,
                    })
                }
            }
        }

        // @init runs per unit, imports before the main file
        for unit in source.imports.iter().chain(std::iter::once(&source.main)) {
            let code = match &unit.toplevel.init {
                Some(section) => compile_section(&mut self.vm, section, "@init")?,
                None => None,
            };
            self.code.init.push(code);
        }

        let slider = Self::search_in(source, |tl| tl.slider.as_ref());
        let block = Self::search_in(source, |tl| tl.block.as_ref());
        let sample = Self::search_in(source, |tl| tl.sample.as_ref());
        let gfx = if opts.no_gfx {
            None
        } else {
            Self::search_in(source, |tl| tl.gfx.as_ref())
        };
        let serialize = if opts.no_serialize {
            None
        } else {
            Self::search_in(source, |tl| tl.serialize.as_ref())
        };

        if let Some((section, _)) = slider {
            self.code.slider = compile_section(&mut self.vm, section, "@slider")?;
        }
        if let Some((section, _)) = block {
            self.code.block = compile_section(&mut self.vm, section, "@block")?;
        }
        if let Some((section, _)) = sample {
            self.code.sample = compile_section(&mut self.vm, section, "@sample")?;
        }
        if let Some((section, _)) = gfx {
            self.code.gfx = compile_section(&mut self.vm, section, "@gfx")?;
        }
        if let Some((section, _)) = serialize {
            self.code.serialize = compile_section(&mut self.vm, section, "@serialize")?;
        }

        self.has_serialize = serialize.is_some();
        self.code.compiled = true;
        self.is_freshly_compiled = true;
        self.must_compute_init = true;

        Ok(())
    }

    /// A non-`@init` section lives in the main file, or failing that in
    /// the first import that has one.
    fn search_in<'a>(
        source: &'a SourceState,
        pick: impl Fn(&Toplevel) -> Option<&Section>,
    ) -> Option<(&'a Section, &'a Toplevel)> {
        if let Some(section) = pick(&source.main.toplevel) {
            return Some((section, &source.main.toplevel));
        }
        for unit in &source.imports {
            if let Some(section) = pick(&unit.toplevel) {
                return Some((section, &unit.toplevel));
            }
        }
        None
    }

    /// Run `@init`. A fresh compile zeroes engine bookkeeping first; a
    /// re-init zeroes all non-built-in VM variables unless the effect
    /// declares `@serialize`, which opts out of the reset to keep custom
    /// state across transport restarts.
    pub fn init(&mut self) {
        if !self.code.compiled {
            return;
        }

        self.vm
            .set_var(self.vars.samplesblock, self.block_size as Real);
        self.vm.set_var(self.vars.srate, self.sample_rate);

        if self.is_freshly_compiled {
            self.vm.set_var(self.vars.pdc_delay, 0.0);
            self.vm.set_var(self.vars.pdc_bot_ch, 0.0);
            self.vm.set_var(self.vars.pdc_top_ch, 0.0);
            self.vm.set_var(self.vars.pdc_midi, 0.0);
            self.first_init();
            self.is_freshly_compiled = false;
        } else if !self.has_serialize {
            self.reinitialize_vars();
        }

        self.files.clear();

        let inits = self.code.init.clone();
        for code in inits.into_iter().flatten() {
            self.vm.execute(code);
        }

        self.must_compute_init = false;
        self.must_compute_slider = true;

        // graphics re-initializes on its own thread at the next frame
        let wants_retina = self.vm.get_var(self.vars.gfx_ext_retina) > 0.0;
        self.gfx.lock().unwrap().wants_retina = wants_retina;
        self.gfx_must_init.store(true, Ordering::Release);
    }

    fn first_init(&mut self) {
        self.signals.reset_events();
        if let Some(source) = &self.source {
            self.signals.init_visibility(&source.main.header.sliders);
        }
    }

    fn reinitialize_vars(&mut self) {
        let mut to_clear: Vec<VarRef> = Vec::new();
        let built_ins = &self.built_ins;
        self.vm.for_each_var(&mut |_name, var| {
            if !built_ins.contains(&var) {
                to_clear.push(var);
            }
            true
        });
        for var in to_clear {
            self.vm.set_var(var, 0.0);
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_compiled(&self) -> bool {
        self.code.compiled
    }

    pub fn unload_source(&mut self) {
        self.source = None;
        self.vm.set_var_resolver(None);
        *self.file_ctx.lock().unwrap() = DataFileContext::default();
    }

    pub fn unload_code(&mut self) {
        // stop graphics before code handles disappear under it
        {
            let mut gfx = self.gfx.lock().unwrap();
            gfx.ready = false;
            gfx.wants_retina = false;
        }
        self.gfx_must_init.store(false, Ordering::Release);

        self.code = CodeState::default();
        self.has_serialize = false;
        self.is_freshly_compiled = false;
        self.must_compute_init = false;
        self.must_compute_slider = false;

        self.vm.drop_code();
        self.vm.remove_unused_vars();
        self.vm.free_ram();
    }

    pub fn unload(&mut self) {
        self.unload_code();
        self.unload_source();
    }

    //--------------------------------------------------------------------------
    // metadata accessors

    pub fn name(&self) -> &str {
        self.source
            .as_ref()
            .map(|s| s.main.header.desc.as_str())
            .unwrap_or("")
    }

    pub fn author(&self) -> &str {
        self.source
            .as_ref()
            .map(|s| s.main.header.author.as_str())
            .unwrap_or("")
    }

    pub fn tags(&self) -> &[String] {
        self.source
            .as_ref()
            .map(|s| s.main.header.tags.as_slice())
            .unwrap_or(&[])
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.source.as_ref().map(|s| s.main_path.as_path())
    }

    /// Companion preset bank discovered next to the effect file.
    pub fn bank_path(&self) -> Option<&Path> {
        self.source.as_ref().and_then(|s| s.bank_path.as_deref())
    }

    pub fn num_inputs(&self) -> u32 {
        self.source
            .as_ref()
            .map(|s| s.main.header.in_pins.len() as u32)
            .unwrap_or(0)
    }

    pub fn num_outputs(&self) -> u32 {
        self.source
            .as_ref()
            .map(|s| s.main.header.out_pins.len() as u32)
            .unwrap_or(0)
    }

    pub fn input_name(&self, index: u32) -> &str {
        self.source
            .as_ref()
            .and_then(|s| s.main.header.in_pins.get(index as usize))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn output_name(&self, index: u32) -> &str {
        self.source
            .as_ref()
            .and_then(|s| s.main.header.out_pins.get(index as usize))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn wants_meters(&self) -> bool {
        self.source
            .as_ref()
            .map(|s| !s.main.header.options.no_meter)
            .unwrap_or(false)
    }

    pub fn wants_all_keyboard(&self) -> bool {
        self.source
            .as_ref()
            .map(|s| s.main.header.options.want_all_kb)
            .unwrap_or(false)
    }

    //--------------------------------------------------------------------------
    // sliders

    /// Resolve a script identifier (a slider's aliased variable name,
    /// case-insensitive) to its slider index.
    pub fn slider_index_for_name(&self, name: &str) -> Option<u32> {
        self.source
            .as_ref()?
            .slider_alias
            .get(&name.to_ascii_lowercase())
            .copied()
    }

    fn slider_def(&self, index: u32) -> Option<&SliderDef> {
        let source = self.source.as_ref()?;
        let slider = source.main.header.sliders.get(index as usize)?;
        slider.exists.then_some(slider)
    }

    pub fn slider_exists(&self, index: u32) -> bool {
        self.slider_def(index).is_some()
    }

    pub fn slider_name(&self, index: u32) -> &str {
        self.slider_def(index)
            .map(|s| s.desc.as_str())
            .unwrap_or("")
    }

    /// Range and shape of one slider. `None` until a slider exists there.
    pub fn slider_curve(&self, index: u32) -> Option<SliderCurve> {
        self.slider_def(index).map(|s| SliderCurve {
            def: s.def,
            min: s.min,
            max: s.max,
            inc: s.inc,
            shape: s.shape,
            modifier: s.shape_modifier,
        })
    }

    pub fn slider_is_enum(&self, index: u32) -> bool {
        self.slider_def(index).map(|s| s.is_enum).unwrap_or(false)
    }

    pub fn slider_enum_names(&self, index: u32) -> &[String] {
        self.slider_def(index)
            .map(|s| s.enum_names.as_slice())
            .unwrap_or(&[])
    }

    pub fn slider_is_path(&self, index: u32) -> bool {
        self.slider_def(index)
            .map(|s| !s.path.is_empty())
            .unwrap_or(false)
    }

    pub fn slider_path(&self, index: u32) -> Option<&str> {
        self.slider_def(index)
            .and_then(|s| (!s.path.is_empty()).then_some(s.path.as_str()))
    }

    pub fn slider_is_initially_visible(&self, index: u32) -> bool {
        self.slider_def(index)
            .map(|s| s.initially_visible)
            .unwrap_or(false)
    }

    pub fn slider_value(&self, index: u32) -> Real {
        if index as usize >= MAX_SLIDERS {
            return 0.0;
        }
        self.vm.get_var(self.vars.slider[index as usize])
    }

    /// Write a slider value. With `notify`, the next processed block runs
    /// `@slider` before any audio.
    pub fn set_slider_value(&mut self, index: u32, value: Real, notify: bool) {
        if index as usize >= MAX_SLIDERS {
            return;
        }
        let var = self.vars.slider[index as usize];
        if self.vm.get_var(var) != value {
            self.vm.set_var(var, value);
            self.must_compute_slider = notify;
        }
    }

    /// Show/hide/toggle a slider from the host side.
    pub fn slider_show(&self, index: u32, mode: i32) -> bool {
        if index as usize >= MAX_SLIDERS {
            return false;
        }
        self.signals.show_slider(index, mode)
    }

    pub fn fetch_slider_changes(&self, group: u8) -> u64 {
        self.signals.fetch_changes(group)
    }

    pub fn fetch_slider_automations(&self, group: u8) -> u64 {
        self.signals.fetch_automations(group)
    }

    pub fn slider_touches(&self, group: u8) -> u64 {
        self.signals.touches(group)
    }

    pub fn slider_visibility(&self, group: u8) -> u64 {
        self.signals.visibility(group)
    }

    //--------------------------------------------------------------------------
    // VM introspection

    /// Look up a VM variable cell by name.
    pub fn find_var(&mut self, name: &str) -> Option<VarRef> {
        let mut found = None;
        self.vm.for_each_var(&mut |var_name, var| {
            if var_name.eq_ignore_ascii_case(name) {
                found = Some(var);
                false
            } else {
                true
            }
        });
        found
    }

    /// Read a VM variable by name.
    pub fn read_var(&mut self, name: &str) -> Option<Real> {
        self.find_var(name).map(|var| self.vm.get_var(var))
    }

    /// Read a span of script RAM.
    pub fn read_vmem(&mut self, addr: u32, dest: &mut [Real]) {
        self.vm.read_ram(addr, dest);
    }

    //--------------------------------------------------------------------------
    // graphics

    /// Dimensions requested on the `@gfx` line, from whichever unit
    /// supplied the section.
    pub fn gfx_dims(&self) -> Option<(u32, u32)> {
        let source = self.source.as_ref()?;
        let (_, origin) = Self::search_in(source, |tl| tl.gfx.as_ref())?;
        Some((origin.gfx_w, origin.gfx_h))
    }

    pub fn has_gfx(&self) -> bool {
        self.source
            .as_ref()
            .and_then(|s| Self::search_in(s, |tl| tl.gfx.as_ref()))
            .is_some()
    }

    /// Requested `@gfx` frame rate; 30 until compiled.
    pub fn requested_framerate(&self) -> u32 {
        if !self.is_compiled() {
            return 30;
        }
        self.source
            .as_ref()
            .map(|s| s.main.header.options.gfx_hz)
            .unwrap_or(30)
    }

    /// Run one `@gfx` frame on the graphics thread. The first call after a
    /// (re)compile performs the deferred graphics initialization.
    pub fn gfx_run(&mut self) -> bool {
        let mut gfx = self.gfx.lock().unwrap();
        if self.gfx_must_init.swap(false, Ordering::Acquire) {
            gfx.ready = self.code.gfx.is_some();
        }
        if !gfx.ready {
            return false;
        }
        if let Some(code) = self.code.gfx {
            self.vm.execute(code);
            true
        } else {
            false
        }
    }

    pub fn gfx_wants_retina(&self) -> bool {
        self.gfx.lock().unwrap().wants_retina
    }
}
