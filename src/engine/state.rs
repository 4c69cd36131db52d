//! Effect state snapshots
//!
//! A state is an ordered list of (slider index, value) pairs plus the
//! opaque bytes the script produced through `@serialize`. States are what
//! presets store and what hosts persist in projects and undo history. Two
//! states are equal iff both parts are byte-identical.

use crate::engine::Effect;
use crate::types::{EngineError, EngineResult, Real, MAX_SLIDERS};
use crate::vm::{Vm as _, VmAccess as _};

/// One saved slider value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SliderValue {
    pub index: u32,
    pub value: Real,
}

/// Opaque persistent state of one effect instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EffectState {
    /// Saved sliders, ordered by index.
    pub sliders: Vec<SliderValue>,
    /// Raw `@serialize` output.
    pub data: Vec<u8>,
}

impl EffectState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Effect {
    /// Capture the current state: runs `@serialize` in write mode, then
    /// snapshots every declared slider.
    pub fn save_state(&mut self) -> EngineResult<EffectState> {
        if !self.is_compiled() {
            return Err(EngineError::NotCompiled);
        }

        self.serializer.lock().unwrap().begin_write();
        self.run_serialize();
        let data = self.serializer.lock().unwrap().end();

        let mut sliders = Vec::new();
        if let Some(source) = &self.source {
            for i in 0..MAX_SLIDERS {
                if source.main.header.sliders[i].exists {
                    sliders.push(SliderValue {
                        index: i as u32,
                        value: self.vm.get_var(self.vars.slider[i]),
                    });
                }
            }
        }

        Ok(EffectState { sliders, data })
    }

    /// Restore a previously saved state: sliders reset to their defaults,
    /// saved values applied on top, then `@serialize` replays the opaque
    /// bytes in read mode.
    pub fn load_state(&mut self, state: &EffectState) -> EngineResult<()> {
        if !self.is_compiled() {
            return Err(EngineError::NotCompiled);
        }

        if let Some(source) = &self.source {
            for i in 0..MAX_SLIDERS {
                let def = source.main.header.sliders[i].def;
                self.vm.set_var(self.vars.slider[i], def);
            }
            for slider in &state.sliders {
                let index = slider.index as usize;
                if index < MAX_SLIDERS && source.main.header.sliders[index].exists {
                    self.vm.set_var(self.vars.slider[index], slider.value);
                }
            }
        }
        self.must_compute_slider = true;

        self.serializer.lock().unwrap().begin_read(state.data.clone());
        self.run_serialize();
        self.serializer.lock().unwrap().end();

        Ok(())
    }

    /// Replay only the opaque `@serialize` bytes, leaving sliders alone.
    pub fn load_serialized_state(&mut self, state: &EffectState) -> EngineResult<()> {
        if !self.is_compiled() {
            return Err(EngineError::NotCompiled);
        }
        self.serializer.lock().unwrap().begin_read(state.data.clone());
        self.run_serialize();
        self.serializer.lock().unwrap().end();
        Ok(())
    }

    fn run_serialize(&mut self) {
        if let Some(code) = self.code.serialize {
            if self.must_compute_init {
                self.init();
            }
            self.vm.execute(code);
        }
    }
}
