//! Effect engine integration tests
//!
//! End-to-end scenarios against on-disk effect files, driven through the
//! mock VM: loading, imports, slider aliasing, visibility signaling,
//! processing, state save/restore, and preprocessor expansion.

use rsfx::engine::{
    slider_group_index, slider_group_mask, CompileOptions, DspContext, Effect, EngineConfig,
    LoadOptions,
};
use rsfx::midi::MidiEvent;
use rsfx::mock_vm::MockVm;
use rsfx::types::{PlaybackState, TimeInfo};
use rsfx::vm::{Vm, VmAccess};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Effects");
        fs::create_dir(&root).unwrap();
        Self { _dir: dir, root }
    }

    fn write(&self, name: &str, text: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, text).unwrap();
        path
    }
}

fn new_effect() -> Effect {
    Effect::new(EngineConfig::default(), Box::new(MockVm::new()))
}

fn load_and_compile(fx: &mut Effect, path: &Path) {
    fx.load(path, &LoadOptions::default()).unwrap();
    fx.compile(&CompileOptions::default()).unwrap();
}

fn run_empty_block(fx: &mut Effect) {
    let mut ctx = DspContext::new();
    fx.process_float(&mut ctx, &[], &mut [], 1);
}

#[test]
fn slider_aliases_bind_to_cells() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:example\n",
            "out_pin:output\n",
            "slider1:foo=1<1,3,0.1>the slider 1\n",
            "slider2:bar=2<1,3,0.1>the slider 2\n",
            "@init\n",
            "foo=2;\n",
            "bar=3;\n",
            "@sample\n",
            "spl0=0.0;\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);

    assert_eq!(fx.slider_value(0), 1.0);
    assert_eq!(fx.slider_value(1), 2.0);
    fx.init();
    assert_eq!(fx.slider_value(0), 2.0);
    assert_eq!(fx.slider_value(1), 3.0);
}

#[test]
fn slider_aliases_are_case_insensitive() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:example\n",
            "out_pin:output\n",
            "slider1:fOo=1<1,3,0.1>the slider 1\n",
            "slider2:bar=2<1,3,0.1>the slider 2\n",
            "@init\n",
            "foo=2;\n",
            "bAr=3;\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();
    assert_eq!(fx.slider_value(0), 2.0);
    assert_eq!(fx.slider_value(1), 3.0);
}

#[test]
fn slider_visibility_signaling() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:example\n",
            "out_pin:output\n",
            "slider1:0<0,1,0.1>the slider 1\n",
            "slider2:0<0,1,0.1>the slider 2\n",
            "slider3:0<0,1,0.1>the slider 3\n",
            "slider4:0<0,1,0.1>-the slider 4\n",
            "slider5:0<0,1,0.1>-the slider 5\n",
            "slider6:0<0,1,0.1>-the slider 6\n",
            "slider7:0<0,1,0.1>the slider 7\n",
            "slider254:0<0,1,0.1>-the slider 254\n",
            "slider255:0<0,1,0.1>the slider 255\n",
            "@block\n",
            "slider_show(slider1,0);\n",
            "slider_show(slider2,1);\n",
            "slider_show(slider3,-1);\n",
            "slider_show(slider4,0);\n",
            "slider_show(slider5,1);\n",
            "slider_show(slider6,-1);\n",
            "slider_show(slider254,1);\n",
            "slider_show(slider255,-1);\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);

    for i in 0..256 {
        assert_eq!(fx.slider_exists(i), i < 7 || i == 253 || i == 254);
    }
    for i in 0..7 {
        assert_eq!(fx.slider_name(i), format!("the slider {}", i + 1));
    }

    fx.init();

    let is_visible = |fx: &Effect, i: u32| -> bool {
        let group = slider_group_index(i);
        fx.slider_visibility(group) & slider_group_mask(i, group) != 0
    };

    assert!(is_visible(&fx, 0));
    assert!(is_visible(&fx, 1));
    assert!(is_visible(&fx, 2));
    assert!(!is_visible(&fx, 3));
    assert!(!is_visible(&fx, 4));
    assert!(!is_visible(&fx, 5));
    assert!(!is_visible(&fx, 253));
    assert!(is_visible(&fx, 254));

    run_empty_block(&mut fx);

    assert!(!is_visible(&fx, 0));
    assert!(is_visible(&fx, 1));
    assert!(!is_visible(&fx, 2));
    assert!(!is_visible(&fx, 3));
    assert!(is_visible(&fx, 4));
    assert!(is_visible(&fx, 5));
    assert!(is_visible(&fx, 253));
    assert!(!is_visible(&fx, 254));

    // toggles surface on the change mask, which clears when fetched
    let changes = fx.fetch_slider_changes(0);
    for i in 0..6u32 {
        assert_ne!(changes & (1 << i), 0, "slider {} change bit", i + 1);
    }
    assert_eq!(fx.fetch_slider_changes(0), 0);
    let changes = fx.fetch_slider_changes(3);
    assert_ne!(changes & slider_group_mask(253, 3), 0);
    assert_ne!(changes & slider_group_mask(254, 3), 0);
    assert_eq!(fx.fetch_slider_changes(3), 0);
}

#[test]
fn slider_change_and_automation_masks() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:example\n",
            "out_pin:output\n",
            "slider1:0<0,1,0.1>the slider 1\n",
            "slider2:0<0,1,0.1>the slider 2\n",
            "slider66:0<0,1,0.1>the slider 66\n",
            "slider256:0<0,1,0.1>the slider 256\n",
            "@block\n",
            "sliderchange(slider1);\n",
            "slider_automate(slider2);\n",
            "slider_automate(slider66);\n",
            "sliderchange(slider256);\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();
    run_empty_block(&mut fx);

    assert_eq!(fx.fetch_slider_changes(0), 1 << 0);
    assert_eq!(fx.fetch_slider_automations(0), 1 << 1);
    assert_eq!(fx.fetch_slider_automations(1), slider_group_mask(65, 1));
    assert_eq!(fx.fetch_slider_changes(3), slider_group_mask(255, 3));
    assert_eq!(fx.fetch_slider_changes(0), 0);
    assert_eq!(fx.fetch_slider_automations(0), 0);
}

#[test]
fn touch_mask_persists_until_released() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:example\n",
            "out_pin:output\n",
            "slider1:0<0,1,0.1>the slider 1\n",
            "@block\n",
            "slider_automate(slider1, 1);\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();
    run_empty_block(&mut fx);

    assert_eq!(fx.slider_touches(0), 1);
    // touch is not consumed by reading
    assert_eq!(fx.slider_touches(0), 1);
}

#[test]
fn diamond_imports_compile_init_once_in_dependency_order() {
    let fixture = Fixture::new();
    fixture.write("d.jsfx-inc", "@init\nrecord(4);\n");
    fixture.write("b.jsfx-inc", "import d.jsfx-inc\n@init\nrecord(2);\n");
    fixture.write("c.jsfx-inc", "import d.jsfx-inc\n@init\nrecord(3);\n");
    let path = fixture.write(
        "a.jsfx",
        concat!(
            "desc:diamond\n",
            "out_pin:output\n",
            "import b.jsfx-inc\n",
            "import c.jsfx-inc\n",
            "@init\n",
            "record(1);\n",
        ),
    );

    let order = Arc::new(Mutex::new(Vec::<i64>::new()));
    let mut vm = MockVm::new();
    {
        let order = order.clone();
        vm.register_function(
            "record",
            Arc::new(move |vars: &mut dyn VmAccess, args: &[rsfx::vm::HostArg]| {
                let value = args.first().map(|a| vars.arg_value(*a)).unwrap_or(0.0);
                order.lock().unwrap().push(value as i64);
                0.0
            }),
        );
    }

    let mut fx = Effect::new(EngineConfig::default(), Box::new(vm));
    load_and_compile(&mut fx, &path);
    fx.init();

    assert_eq!(*order.lock().unwrap(), vec![4, 2, 3, 1]);
}

#[test]
fn import_chain_too_deep_fails() {
    let fixture = Fixture::new();
    for i in 0..40 {
        let text = format!("import chain{}.jsfx-inc\n@init\n", i + 1);
        fixture.write(&format!("chain{}.jsfx-inc", i), &text);
    }
    fixture.write("chain40.jsfx-inc", "@init\n");
    let path = fixture.write("main.jsfx", "desc:deep\nout_pin:output\nimport chain0.jsfx-inc\n");

    let mut fx = new_effect();
    let err = fx.load(&path, &LoadOptions::default()).unwrap_err();
    assert!(err.to_string().contains("too many import levels"));
    assert!(!fx.is_loaded());
}

#[test]
fn missing_import_discards_partial_source() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "main.jsfx",
        "desc:missing\nout_pin:output\nimport nowhere.jsfx-inc\n",
    );

    let mut fx = new_effect();
    assert!(fx.load(&path, &LoadOptions::default()).is_err());
    assert!(!fx.is_loaded());
    assert_eq!(fx.name(), "");

    // ignoring imports loads the same file fine
    let opts = LoadOptions {
        ignore_imports: true,
    };
    fx.load(&path, &opts).unwrap();
    assert!(fx.is_loaded());
    assert_eq!(fx.name(), "missing");
}

#[test]
fn import_resolution_is_case_insensitive_and_recursive() {
    let fixture = Fixture::new();
    let nested = fixture.root.join("lib").join("deep");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("Util.JSFX-INC"), "@init\nu = 1;\n").unwrap();
    let path = fixture.write(
        "main.jsfx",
        "desc:nested\nout_pin:output\nimport util.jsfx-inc\n@init\nm = 2;\n",
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();
    assert_eq!(fx.read_var("u"), Some(1.0));
    assert_eq!(fx.read_var("m"), Some(2.0));
}

#[test]
fn preprocessor_config_expansion() {
    let fixture = Fixture::new();
    fixture.write(
        "include.jsfx-inc",
        "@init\nx3 = <?printf(\"%d\", test1)?>;\n",
    );
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:test\n",
            "config: test1 \"test\" 8 1=test 2\n",
            "config: test2 \"test2\" 3 1 2\n",
            "config: invalid\n",
            "config:\n",
            "import include.jsfx-inc\n",
            "@init\n",
            "x1 = <?printf(\"%d\", test1)?>;\n",
            "x2 = <?printf(\"%d\", test2)?>;\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();

    assert_eq!(fx.read_var("x1"), Some(8.0));
    assert_eq!(fx.read_var("x2"), Some(3.0));
    assert_eq!(fx.read_var("x3"), Some(8.0));
}

#[test]
fn preprocessor_generated_slider_parses() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:test\n",
            "<?printf(\"slider1:0<0,1,0.1>the slider 1\");?>\n",
            "@init\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();

    assert!(fx.slider_exists(0));
    assert_eq!(fx.slider_name(0), "the slider 1");
}

#[test]
fn duplicate_config_identifier_fails_load() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "example.jsfx",
        concat!(
            "desc:test\n",
            "config:test1 \"test\" 8 1=test 2\n",
            "config: tESt1 \"test2\" 3 1 2\n",
            "@init\n",
        ),
    );

    let mut fx = new_effect();
    assert!(fx.load(&path, &LoadOptions::default()).is_err());
    assert!(!fx.is_loaded());
}

#[test]
fn memory_options_configure_the_vm() {
    let fixture = Fixture::new();

    let check = |text: &str, mem: u32, prealloc: i64| {
        let vm = MockVm::new();
        let stats = vm.stats();
        let path = fixture.write("mem.jsfx", text);
        let mut fx = Effect::new(EngineConfig::default(), Box::new(vm));
        load_and_compile(&mut fx, &path);
        assert_eq!(
            stats.mem_limit.load(std::sync::atomic::Ordering::Relaxed),
            mem,
            "for {:?}",
            text
        );
        assert_eq!(
            stats.preallocated.load(std::sync::atomic::Ordering::Relaxed),
            prealloc,
            "for {:?}",
            text
        );
    };

    check("desc:a\nout_pin:output\n@init\n", 8 * 1024 * 1024, 0);
    check(
        "desc:b\noptions:maxmem=134217728\nout_pin:output\n@init\n",
        128 * 1024 * 1024,
        0,
    );
    check(
        "desc:c\noptions:maxmem=200000000\nout_pin:output\n@init\n",
        128 * 1024 * 1024,
        0,
    );
    check(
        "desc:d\noptions:maxmem=13421772 prealloc=*\nout_pin:output\n@init\n",
        13421772,
        -1,
    );
    check(
        "desc:e\noptions:prealloc=16000000\nout_pin:output\n@init\n",
        8 * 1024 * 1024,
        16000000,
    );
}

#[test]
fn gfx_framerate_and_meters() {
    let fixture = Fixture::new();

    let check = |text: &str, framerate: u32, meters: bool| {
        let path = fixture.write("gfx.jsfx", text);
        let mut fx = new_effect();
        load_and_compile(&mut fx, &path);
        assert_eq!(fx.requested_framerate(), framerate, "for {:?}", text);
        assert_eq!(fx.wants_meters(), meters, "for {:?}", text);
    };

    check("desc:test\noptions:gfx_hz=60\nout_pin:output\n@init\n", 60, true);
    check(
        "desc:test\noptions:no_meter gfx_hz  =  60\nout_pin:output\n@init\n",
        60,
        false,
    );
    check("desc:test\noptions:gfx_hz=-1\nout_pin:output\n@init\n", 30, true);
    check("desc:test\nout_pin:output\n@init\n", 30, true);
    check(
        "desc:test\noptions:gfx_hz=60\noptions:no_meter\nout_pin:output\n@init\n",
        60,
        false,
    );
}

#[test]
fn gfx_dims_and_lazy_init() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "gfx.jsfx",
        "desc:test\nout_pin:output\n@gfx 320 240\ng = 1;\n",
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    assert_eq!(fx.gfx_dims(), Some((320, 240)));
    assert!(fx.has_gfx());

    // not armed until @init ran
    assert!(!fx.gfx_run());
    fx.init();
    assert!(fx.gfx_run());
    assert_eq!(fx.read_var("g"), Some(1.0));

    // skipping gfx at compile time leaves nothing to run
    let opts = CompileOptions {
        no_gfx: true,
        ..Default::default()
    };
    fx.compile(&opts).unwrap();
    fx.init();
    assert!(!fx.gfx_run());
}

#[test]
fn enum_slider_range_self_corrects() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "enums.jsfx",
        "desc:test\nout_pin:output\nslider1:5<5,10,2{a,b,c}>Mode\n@init\n",
    );

    let mut fx = new_effect();
    fx.load(&path, &LoadOptions::default()).unwrap();

    let curve = fx.slider_curve(0).unwrap();
    assert_eq!(curve.min, 0.0);
    assert_eq!(curve.max, 2.0);
    assert_eq!(curve.inc, 1.0);
    assert!(fx.slider_is_enum(0));
    assert_eq!(fx.slider_enum_names(0), ["a", "b", "c"]);
}

#[test]
fn path_slider_enumerates_data_directory() {
    let fixture = Fixture::new();
    let data_root = fixture.root.join("Data");
    fs::create_dir_all(data_root.join("snd")).unwrap();
    fs::write(data_root.join("snd/kick.wav"), b"").unwrap();
    fs::write(data_root.join("snd/notes.txt"), b"").unwrap();
    fs::write(data_root.join("snd/readme.xyz"), b"").unwrap();

    let path = fixture.write(
        "paths.jsfx",
        "desc:test\nout_pin:output\nslider1:/snd:0:Sample\n@init\n",
    );

    let config = EngineConfig {
        data_root: Some(data_root),
        ..Default::default()
    };
    let mut fx = Effect::new(config, Box::new(MockVm::new()));
    fx.load(&path, &LoadOptions::default()).unwrap();

    assert!(fx.slider_is_path(0));
    assert_eq!(fx.slider_path(0), Some("/snd"));
    assert_eq!(fx.slider_enum_names(0), ["kick.wav", "notes.txt"]);
    let curve = fx.slider_curve(0).unwrap();
    assert_eq!(curve.max, 1.0);
}

#[test]
fn uncompiled_effect_passes_audio_through() {
    let mut fx = new_effect();
    let mut ctx = DspContext::new();

    let input = [0.25f32; 8];
    let mut out0 = [9.0f32; 8];
    let mut out1 = [9.0f32; 8];
    fx.process_float(&mut ctx, &[&input], &mut [&mut out0, &mut out1], 8);

    assert_eq!(out0, [0.25; 8]);
    assert_eq!(out1, [0.0; 8]);
}

#[test]
fn sample_section_writes_outputs() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "constant.jsfx",
        "desc:constant\n@sample\nspl0 = 0.25;\n",
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);

    // no explicit pins plus @sample defaults to stereo
    assert_eq!(fx.num_inputs(), 2);
    assert_eq!(fx.num_outputs(), 2);
    assert_eq!(fx.input_name(0), "JS input 1");

    let mut ctx = DspContext::new();
    let input = [0.0f32; 16];
    let mut out0 = [9.0f32; 16];
    let mut out1 = [9.0f32; 16];
    fx.process_float(&mut ctx, &[&input], &mut [&mut out0, &mut out1], 16);

    for sample in out0 {
        assert!((sample - 0.25).abs() < 1e-6);
    }
    for sample in out1 {
        assert!(sample.abs() < 1e-9);
    }
}

#[test]
fn slider_edit_runs_slider_section_once() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "sliders.jsfx",
        concat!(
            "desc:sliders\n",
            "out_pin:output\n",
            "slider1:gain=0.5<0,1,0.01>Gain\n",
            "@slider\n",
            "applied = gain;\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();
    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("applied"), Some(0.5));

    fx.set_slider_value(0, 0.75, true);
    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("applied"), Some(0.75));

    // without notify the section does not rerun
    fx.set_slider_value(0, 0.25, false);
    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("applied"), Some(0.75));
    assert_eq!(fx.slider_value(0), 0.25);
}

#[test]
fn state_save_and_restore_roundtrip() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "stateful.jsfx",
        concat!(
            "desc:stateful\n",
            "out_pin:output\n",
            "slider1:0<0,1,0.01>S1\n",
            "slider2:0<0,1,0.01>S2\n",
            "slider4:0<0,1,0.01>S4\n",
            "@serialize\n",
            "file_var(0, slider4);\n",
            "file_var(0, slider2);\n",
            "file_var(0, slider1);\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();

    fx.set_slider_value(0, 0.34, true);
    fx.set_slider_value(1, 0.75, true);
    fx.set_slider_value(3, 0.62, true);

    let state = fx.save_state().unwrap();
    assert_eq!(state.sliders.len(), 3);
    assert_eq!(state.sliders[0].index, 0);
    assert_eq!(state.sliders[2].index, 3);
    assert_eq!(state.data.len(), 12);
    // write order: slider4, slider2, slider1
    assert!((f32::from_le_bytes(state.data[0..4].try_into().unwrap()) - 0.62).abs() < 1e-6);
    assert!((f32::from_le_bytes(state.data[4..8].try_into().unwrap()) - 0.75).abs() < 1e-6);
    assert!((f32::from_le_bytes(state.data[8..12].try_into().unwrap()) - 0.34).abs() < 1e-6);

    fx.set_slider_value(0, 0.0, true);
    fx.set_slider_value(1, 0.0, true);
    fx.set_slider_value(3, 0.0, true);

    fx.load_state(&state).unwrap();
    assert!((fx.slider_value(0) - 0.34).abs() < 1e-6);
    assert!((fx.slider_value(1) - 0.75).abs() < 1e-6);
    assert!((fx.slider_value(3) - 0.62).abs() < 1e-6);

    let state2 = fx.save_state().unwrap();
    assert_eq!(state, state2);
}

#[test]
fn reinit_resets_user_vars_unless_serialized() {
    let fixture = Fixture::new();
    let plain = fixture.write(
        "plain.jsfx",
        "desc:plain\nout_pin:output\n@block\ny = 7;\n",
    );
    let keeper = fixture.write(
        "keeper.jsfx",
        "desc:keeper\nout_pin:output\n@block\ny = 7;\n@serialize\nfile_var(0, y);\n",
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &plain);
    fx.init();
    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("y"), Some(7.0));

    // a re-init zeroes every non-built-in variable
    fx.init();
    assert_eq!(fx.read_var("y"), Some(0.0));

    let mut fx = new_effect();
    load_and_compile(&mut fx, &keeper);
    fx.init();
    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("y"), Some(7.0));

    // @serialize opts out of the reset
    fx.init();
    assert_eq!(fx.read_var("y"), Some(7.0));
}

#[test]
fn transport_restart_rearms_init() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "transport.jsfx",
        "desc:transport\nout_pin:output\n@init\nrecord(1);\n",
    );
    let noinit = fixture.write(
        "noinit.jsfx",
        "desc:noinit\nout_pin:output\n@init\nrecord(1);\next_noinit = 1;\n",
    );

    let runs = Arc::new(Mutex::new(0usize));
    let make_vm = |runs: Arc<Mutex<usize>>| {
        let mut vm = MockVm::new();
        vm.register_function(
            "record",
            Arc::new(move |_vars: &mut dyn VmAccess, _args: &[rsfx::vm::HostArg]| {
                *runs.lock().unwrap() += 1;
                0.0
            }),
        );
        vm
    };

    let mut fx = Effect::new(EngineConfig::default(), Box::new(make_vm(runs.clone())));
    load_and_compile(&mut fx, &path);
    run_empty_block(&mut fx);
    assert_eq!(*runs.lock().unwrap(), 1);

    let stopped = TimeInfo {
        playback_state: PlaybackState::Stopped,
        ..Default::default()
    };
    let playing = TimeInfo::default();
    fx.set_time_info(&stopped);
    fx.set_time_info(&playing);
    run_empty_block(&mut fx);
    assert_eq!(*runs.lock().unwrap(), 2);

    // a script that sets ext_noinit keeps its state across restarts
    let runs2 = Arc::new(Mutex::new(0usize));
    let mut fx = Effect::new(EngineConfig::default(), Box::new(make_vm(runs2.clone())));
    load_and_compile(&mut fx, &noinit);
    run_empty_block(&mut fx);
    assert_eq!(*runs2.lock().unwrap(), 1);

    fx.set_time_info(&stopped);
    fx.set_time_info(&playing);
    run_empty_block(&mut fx);
    assert_eq!(*runs2.lock().unwrap(), 1);
}

#[test]
fn midi_flows_both_ways() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "midi.jsfx",
        concat!(
            "desc:midi\n",
            "out_pin:output\n",
            "@block\n",
            "got = midirecv(moff, m1, m23);\n",
            "midisend(0, 144, 16191);\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();

    assert!(fx.send_midi(MidiEvent::new(0, 5, &[0x90, 60, 100])));
    run_empty_block(&mut fx);

    assert_eq!(fx.read_var("got"), Some(1.0));
    assert_eq!(fx.read_var("moff"), Some(5.0));
    assert_eq!(fx.read_var("m1"), Some(144.0));
    assert_eq!(fx.read_var("m23"), Some((60 + (100 << 8)) as f64));

    let sent = fx.receive_midi().unwrap();
    assert_eq!(sent.data, vec![144, 63, 63]);
    assert!(fx.receive_midi().is_none());

    // the input queue does not carry over into the next block
    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("got"), Some(0.0));
}

#[test]
fn data_files_open_through_filename_table() {
    let fixture = Fixture::new();
    fixture.write("data.txt", "# header\n0.25\n0.5\n");
    let path = fixture.write(
        "reader.jsfx",
        concat!(
            "desc:reader\n",
            "out_pin:output\n",
            "filename:0,data.txt\n",
            "@init\n",
            "h = file_open(0);\n",
            "n = file_avail(h);\n",
            "file_var(h, v1);\n",
            "file_var(h, v2);\n",
            "file_close(h);\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();

    assert_eq!(fx.read_var("h"), Some(1.0));
    assert_eq!(fx.read_var("n"), Some(2.0));
    assert_eq!(fx.read_var("v1"), Some(0.25));
    assert_eq!(fx.read_var("v2"), Some(0.5));
}

#[test]
fn file_mem_roundtrips_through_ram() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "mem.jsfx",
        concat!(
            "desc:mem\n",
            "out_pin:output\n",
            "@serialize\n",
            "file_var(0, 1337);\n",
            "file_mem(0, potato, 4);\n",
            "file_var(0, 1338);\n",
            "@init\n",
            "potato = 100;\n",
        ),
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();

    let mut state = fx.save_state().unwrap();
    assert_eq!(state.data.len(), 6 * 4);
    // splice values into the blob's four RAM slots, then replay it
    for (i, value) in [5.0f32, 10.0, 15.0, 20.0].iter().enumerate() {
        let offset = 4 + i * 4;
        state.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
    fx.load_state(&state).unwrap();

    let mut ram = [0.0f64; 4];
    fx.read_vmem(100, &mut ram);
    assert_eq!(ram, [5.0, 10.0, 15.0, 20.0]);

    let state2 = fx.save_state().unwrap();
    assert_eq!(&state2.data[..], &state.data[..]);
}

#[test]
fn bank_discovered_next_to_effect() {
    let fixture = Fixture::new();
    let path = fixture.write("example.jsfx", "desc:example\nout_pin:output\n@sample\nspl0=0.0;\n");

    let mut fx = new_effect();
    fx.load(&path, &LoadOptions::default()).unwrap();
    assert!(fx.bank_path().is_none());

    fixture.write("example.jsfx.RpL", "");
    fx.load(&path, &LoadOptions::default()).unwrap();
    let bank_path = fx.bank_path().expect("companion bank should be found");
    assert!(bank_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .eq_ignore_ascii_case("example.jsfx.rpl"));

    fx.unload();
    assert!(fx.bank_path().is_none());
}

#[test]
fn compile_failure_rolls_back_to_loaded() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "broken.jsfx",
        "desc:broken\nout_pin:output\n@init\nthis is not valid code %%%;\n",
    );

    let mut fx = new_effect();
    fx.load(&path, &LoadOptions::default()).unwrap();
    assert!(fx.compile(&CompileOptions::default()).is_err());
    assert!(fx.is_loaded());
    assert!(!fx.is_compiled());

    // processing an uncompiled effect degrades to pass-through
    let mut ctx = DspContext::new();
    let input = [1.0f32; 4];
    let mut output = [0.0f32; 4];
    fx.process_float(&mut ctx, &[&input], &mut [&mut output], 4);
    assert_eq!(output, [1.0; 4]);
}

#[test]
fn missing_desc_warns_and_uses_file_name() {
    let fixture = Fixture::new();
    let path = fixture.write("untitled.jsfx", "out_pin:output\n@init\n");

    let mut fx = new_effect();
    fx.load(&path, &LoadOptions::default()).unwrap();
    assert_eq!(fx.name(), "untitled.jsfx");
}

#[test]
fn triggers_latch_into_the_next_block() {
    let fixture = Fixture::new();
    let path = fixture.write(
        "trig.jsfx",
        "desc:trig\nout_pin:output\n@block\nseen = trigger;\n",
    );

    let mut fx = new_effect();
    load_and_compile(&mut fx, &path);
    fx.init();

    assert!(fx.send_trigger(0));
    assert!(fx.send_trigger(3));
    assert!(!fx.send_trigger(64));
    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("seen"), Some(9.0));

    run_empty_block(&mut fx);
    assert_eq!(fx.read_var("seen"), Some(0.0));
}
