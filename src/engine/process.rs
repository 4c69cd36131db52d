//! Real-time audio dispatch
//!
//! The per-block entry points the audio thread calls, plus the transport,
//! MIDI and PDC surface that frames each block. Nothing here is allowed to
//! fail destructively: an uncompiled or half-broken effect degrades to
//! pass-through (or silence where the host has more outputs than inputs).

use crate::engine::{DspContext, Effect};
use crate::midi::MidiEvent;
use crate::types::{PlaybackState, Real, TimeInfo, MAX_CHANNELS, MAX_TRIGGERS};
use crate::vm::{Vm as _, VmAccess as _};
use std::sync::atomic::Ordering;

/// Sample formats the engine can process in place.
pub trait Sample: Copy {
    fn to_real(self) -> Real;
    fn from_real(value: Real) -> Self;
}

impl Sample for f32 {
    fn to_real(self) -> Real {
        self as Real
    }

    fn from_real(value: Real) -> Self {
        value as f32
    }
}

impl Sample for f64 {
    fn to_real(self) -> Real {
        self
    }

    fn from_real(value: Real) -> Self {
        value
    }
}

fn playback_code(state: PlaybackState) -> Real {
    match state {
        PlaybackState::Stopped => 0.0,
        PlaybackState::Playing => 1.0,
        PlaybackState::Paused => 2.0,
        PlaybackState::Recording => 5.0,
    }
}

fn playback_code_is_running(code: u32) -> bool {
    code == 1 || code == 5
}

impl Effect {
    pub fn sample_rate(&self) -> Real {
        self.sample_rate
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Channels actually fed to the script in the last block.
    pub fn valid_input_channels(&self) -> u32 {
        self.valid_input_channels
    }

    pub fn set_sample_rate(&mut self, sample_rate: Real) {
        if self.sample_rate != sample_rate {
            self.sample_rate = sample_rate;
            self.must_compute_init = true;
        }
    }

    pub fn set_block_size(&mut self, block_size: u32) {
        if self.block_size != block_size {
            self.block_size = block_size;
            self.must_compute_init = true;
        }
    }

    /// Resize both MIDI buffers.
    pub fn set_midi_capacity(&mut self, capacity: usize, extensible: bool) {
        self.midi_in.lock().unwrap().reserve(capacity, extensible);
        self.midi_out.lock().unwrap().reserve(capacity, extensible);
    }

    /// Queue a MIDI event for the script to read during the next block.
    pub fn send_midi(&self, event: MidiEvent) -> bool {
        self.midi_in.lock().unwrap().push(event)
    }

    /// Drain one MIDI event the script produced during the last block.
    pub fn receive_midi(&self) -> Option<MidiEvent> {
        self.midi_out.lock().unwrap().next_event()
    }

    pub fn receive_midi_from_bus(&self, bus: u32) -> Option<MidiEvent> {
        self.midi_out.lock().unwrap().next_event_from_bus(bus)
    }

    /// Bus the script currently addresses through `midi_bus`.
    pub fn current_midi_bus(&self) -> u32 {
        if self.vm.get_var(self.vars.ext_midi_bus) != 0.0 {
            self.vm.get_var(self.vars.midi_bus).max(0.0) as u32
        } else {
            0
        }
    }

    /// Latch a trigger bit for the next block's `trigger` variable.
    pub fn send_trigger(&self, index: u32) -> bool {
        if index >= MAX_TRIGGERS {
            return false;
        }
        self.pending_triggers.fetch_or(1 << index, Ordering::AcqRel);
        true
    }

    /// Update transport state. A stop-to-run transition re-arms `@init`
    /// unless the script set `ext_noinit`.
    pub fn set_time_info(&mut self, info: &TimeInfo) {
        let prev_code = self.vm.get_var(self.vars.play_state) as u32;
        let new_code = playback_code(info.playback_state) as u32;

        if self.vm.get_var(self.vars.ext_noinit) == 0.0
            && !playback_code_is_running(prev_code)
            && playback_code_is_running(new_code)
        {
            self.must_compute_init = true;
        }

        self.vm.set_var(self.vars.tempo, info.tempo);
        self.vm
            .set_var(self.vars.play_state, playback_code(info.playback_state));
        self.vm
            .set_var(self.vars.play_position, info.time_position);
        self.vm
            .set_var(self.vars.beat_position, info.beat_position);
        self.vm
            .set_var(self.vars.ts_num, info.time_signature[0] as Real);
        self.vm
            .set_var(self.vars.ts_denom, info.time_signature[1] as Real);
    }

    /// Latency the script reports to the host, in samples.
    pub fn pdc_delay(&self) -> Real {
        let value = self.vm.get_var(self.vars.pdc_delay);
        if value > 0.0 {
            value
        } else {
            0.0
        }
    }

    /// Channel range `[bottom, top)` the reported latency applies to.
    pub fn pdc_channels(&self) -> (u32, u32) {
        let mut bot = self.vm.get_var(self.vars.pdc_bot_ch) as i64;
        bot = bot.clamp(0, MAX_CHANNELS as i64);
        let mut top = self.vm.get_var(self.vars.pdc_top_ch) as i64;
        top = top.clamp(bot, MAX_CHANNELS as i64);
        (bot as u32, top as u32)
    }

    pub fn pdc_midi(&self) -> bool {
        self.vm.get_var(self.vars.pdc_midi) != 0.0
    }

    /// Process one block of 32-bit samples.
    pub fn process_float(
        &mut self,
        _ctx: &mut DspContext,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        num_frames: u32,
    ) {
        self.process_generic(inputs, outputs, num_frames);
    }

    /// Process one block of 64-bit samples.
    pub fn process_double(
        &mut self,
        _ctx: &mut DspContext,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
        num_frames: u32,
    ) {
        self.process_generic(inputs, outputs, num_frames);
    }

    fn process_generic<T: Sample>(
        &mut self,
        inputs: &[&[T]],
        outputs: &mut [&mut [T]],
        num_frames: u32,
    ) {
        // output buffer from the previous block is stale now
        self.midi_out.lock().unwrap().clear();

        let triggers = self.pending_triggers.swap(0, Ordering::AcqRel);
        self.vm.set_var(self.vars.trigger, triggers as Real);

        let frames = usable_frames(inputs, outputs, num_frames);

        if !self.code.compiled || self.source.is_none() {
            forward_or_silence(inputs, outputs, frames, 0);
        } else {
            if self.must_compute_init {
                self.init();
            }

            let denorm = if self.vm.get_var(self.vars.ext_nodenorm) > 0.5 {
                0.0
            } else {
                1e-16
            };

            let (num_code_ins, num_code_outs) = {
                let header = &self.source.as_ref().unwrap().main.header;
                (header.in_pins.len(), header.out_pins.len())
            };

            let orig_num_ins = inputs.len();
            let orig_num_outs = outputs.len();
            let num_ins = orig_num_ins.min(num_code_ins);
            let num_outs = orig_num_outs.min(num_code_outs);

            self.valid_input_channels = num_ins as u32;
            self.vm
                .set_var(self.vars.samplesblock, num_frames as Real);
            self.vm.set_var(self.vars.num_ch, num_ins as Real);

            if self.must_compute_slider {
                if let Some(code) = self.code.slider {
                    self.vm.execute(code);
                }
                self.must_compute_slider = false;
            }

            if let Some(code) = self.code.block {
                self.vm.execute(code);
            }

            if let Some(code) = self.code.sample {
                for frame in 0..frames {
                    for ch in 0..num_ins {
                        self.vm.set_var(
                            self.vars.spl[ch],
                            inputs[ch][frame].to_real() + denorm,
                        );
                    }
                    for ch in num_ins..num_code_ins.min(MAX_CHANNELS) {
                        self.vm.set_var(self.vars.spl[ch], denorm);
                    }
                    self.vm.execute(code);
                    for ch in 0..num_outs {
                        outputs[ch][frame] = T::from_real(self.vm.get_var(self.vars.spl[ch]));
                    }
                }
            }

            // forward or silence any host channel beyond the script's pins
            forward_or_silence(inputs, outputs, frames, num_outs);
        }

        // whatever the host queued was only for this block
        self.midi_in.lock().unwrap().clear();
    }
}

fn usable_frames<T: Sample>(inputs: &[&[T]], outputs: &mut [&mut [T]], num_frames: u32) -> usize {
    let mut frames = num_frames as usize;
    for input in inputs {
        frames = frames.min(input.len());
    }
    for output in outputs.iter() {
        frames = frames.min(output.len());
    }
    frames
}

fn forward_or_silence<T: Sample>(
    inputs: &[&[T]],
    outputs: &mut [&mut [T]],
    frames: usize,
    from_channel: usize,
) {
    let both = inputs.len().min(outputs.len());
    for ch in from_channel..both {
        outputs[ch][..frames].copy_from_slice(&inputs[ch][..frames]);
    }
    for ch in both.max(from_channel)..outputs.len() {
        for sample in outputs[ch][..frames].iter_mut() {
            *sample = T::from_real(0.0);
        }
    }
}
