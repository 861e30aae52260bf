//! Temporary overlays.
//!
//! An effect is activated in one of three timing modes and stays in the
//! active set until its [`EffectRuntime`] reports it finished. Each frame the
//! [`EffectHandler`] runs, in order: pre-count, trigger check, cross-device
//! sync, active-flag recompute ([`EffectHandler::begin_frame`]), conditional
//! render ([`EffectHandler::render`]), post-count and finish check
//! ([`EffectHandler::end_frame`]).

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{BeatSnapshot, QUARTERS_PER_BEAT};
use crate::queue::{Instruction, InstructionQueue};
use crate::render::{Palette, PixelBuffer};
use crate::trigger::{quarter_letter_index, TriggerPattern};
use crate::{LightsError, Result};

/// Repeating frame activity pattern: `length` frames, of which those listed
/// in `indices` are active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramesPattern {
    pub length: usize,
    pub indices: Vec<usize>,
}

impl Default for FramesPattern {
    fn default() -> Self {
        Self {
            length: 1,
            indices: vec![0],
        }
    }
}

impl FramesPattern {
    pub fn new(length: usize, indices: &[usize]) -> Self {
        Self {
            length,
            indices: indices.to_vec(),
        }
    }

    /// Expands the pattern, stretching every step over `multi` frames.
    ///
    /// `(4, [0])` with `multi = 2` becomes `[T, T, F, F, F, F, F, F]`.
    pub fn to_binary(&self, multi: usize) -> Result<Vec<bool>> {
        if self.length == 0 {
            return Err(LightsError::config("frames pattern length must be positive"));
        }
        if multi == 0 {
            return Err(LightsError::config("frames pattern multiplier must be positive"));
        }
        Ok((0..self.length)
            .flat_map(|step| std::iter::repeat(self.indices.contains(&step)).take(multi))
            .collect())
    }
}

/// Parses entries such as `"0A"` or `"3C"` (beat number followed by a
/// quarter letter) into one flag per quarter of a loop of
/// `loop_length_beats` beats. Entries at or past `quarter_limit` are ignored.
pub fn quarters_to_binary(
    entries: &[String],
    loop_length_beats: usize,
    quarter_limit: Option<usize>,
) -> Result<Vec<bool>> {
    if loop_length_beats == 0 {
        return Err(LightsError::config("loop length must be at least one beat"));
    }
    let loop_quarters = loop_length_beats * QUARTERS_PER_BEAT;
    let limit = quarter_limit.unwrap_or(loop_quarters);
    let mut binary = vec![false; loop_quarters];

    for entry in entries {
        let malformed = || LightsError::config(format!("malformed quarter entry `{entry}`"));
        let letter = entry.chars().last().ok_or_else(malformed)?;
        let beat: usize = entry[..entry.len() - letter.len_utf8()]
            .parse()
            .map_err(|_| malformed())?;
        let quarter = quarter_letter_index(letter).ok_or_else(malformed)?;
        let index = beat * QUARTERS_PER_BEAT + quarter;
        if index >= loop_quarters {
            return Err(LightsError::config(format!(
                "quarter entry `{entry}` outside loop of {loop_length_beats} beats"
            )));
        }
        if index < limit {
            binary[index] = true;
        }
    }
    Ok(binary)
}

fn default_multi() -> usize {
    1
}

/// How long an overlay stays active and which of its frames render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EffectActivation {
    /// Runs for `limit` frames, forever when `None`.
    Frames {
        limit: Option<usize>,
        #[serde(default = "default_multi")]
        multi: usize,
        #[serde(default)]
        pattern: FramesPattern,
    },
    /// Runs for a number of quarters, converted to frames at activation.
    Quarters {
        quarters: usize,
        #[serde(default = "default_multi")]
        multi: usize,
        #[serde(default)]
        pattern: FramesPattern,
    },
    /// Waits for the next beat, then renders `frames_per_hit` frames every
    /// time the loop reaches an active quarter, for `loops` loops.
    LoopQuarters {
        quarters_pattern: Vec<String>,
        loop_length_beats: usize,
        #[serde(default)]
        quarter_limit: Option<usize>,
        frames_per_hit: usize,
        loops: usize,
        #[serde(default = "default_multi")]
        multi: usize,
        #[serde(default)]
        pattern: FramesPattern,
    },
}

impl EffectActivation {
    pub fn frames(limit: usize) -> Self {
        Self::Frames {
            limit: Some(limit),
            multi: 1,
            pattern: FramesPattern::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectMode {
    Frames,
    Quarters,
    LoopQuarters,
}

#[derive(Debug, Clone, PartialEq)]
struct LoopState {
    has_started: bool,
    quarters_binary: Vec<bool>,
    quarter_offset: usize,
    completed_loops: usize,
    limit_loops: usize,
}

/// Lifetime bookkeeping of one active overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRuntime {
    mode: EffectMode,
    frames_binary: Vec<bool>,
    counter_frames: usize,
    limit_frames: Option<usize>,
    looping: Option<LoopState>,
}

impl EffectRuntime {
    /// Builds the runtime for `activation`. Quarter durations are converted
    /// using the tempo and frame rate at the moment of activation.
    pub fn activate(activation: &EffectActivation, quarter_time: f64, fps: f64) -> Result<Self> {
        match activation {
            EffectActivation::Frames {
                limit,
                multi,
                pattern,
            } => Ok(Self {
                mode: EffectMode::Frames,
                frames_binary: pattern.to_binary(*multi)?,
                counter_frames: 0,
                limit_frames: *limit,
                looping: None,
            }),
            EffectActivation::Quarters {
                quarters,
                multi,
                pattern,
            } => Ok(Self {
                mode: EffectMode::Quarters,
                frames_binary: pattern.to_binary(*multi)?,
                counter_frames: 0,
                limit_frames: Some((*quarters as f64 * quarter_time * fps) as usize),
                looping: None,
            }),
            EffectActivation::LoopQuarters {
                quarters_pattern,
                loop_length_beats,
                quarter_limit,
                frames_per_hit,
                loops,
                multi,
                pattern,
            } => Ok(Self {
                mode: EffectMode::LoopQuarters,
                frames_binary: pattern.to_binary(*multi)?,
                // Nothing renders before the first active quarter.
                counter_frames: *frames_per_hit,
                limit_frames: Some(*frames_per_hit),
                looping: Some(LoopState {
                    has_started: false,
                    quarters_binary: quarters_to_binary(
                        quarters_pattern,
                        *loop_length_beats,
                        *quarter_limit,
                    )?,
                    quarter_offset: 0,
                    completed_loops: 0,
                    limit_loops: *loops,
                }),
            }),
        }
    }

    pub fn mode(&self) -> EffectMode {
        self.mode
    }

    pub fn counter_frames(&self) -> usize {
        self.counter_frames
    }

    pub fn has_started(&self) -> bool {
        self.looping.as_ref().map_or(true, |state| state.has_started)
    }

    pub fn completed_loops(&self) -> usize {
        self.looping.as_ref().map_or(0, |state| state.completed_loops)
    }

    /// Runs before the active check. In loop-quarters mode this starts the
    /// effect on the first beat, advances the loop position and restarts the
    /// frame counter on every active quarter.
    pub fn count_before(&mut self, snapshot: &BeatSnapshot) {
        let Some(state) = self.looping.as_mut() else {
            return;
        };

        if !state.has_started {
            if !snapshot.is_beat() {
                return;
            }
            state.has_started = true;
            state.quarter_offset = 0;
        } else if snapshot.is_new_quarter {
            state.quarter_offset += 1;
            if state.quarter_offset == state.quarters_binary.len() {
                state.quarter_offset = 0;
                state.completed_loops += 1;
            }
        }

        if snapshot.is_new_quarter
            && state.completed_loops < state.limit_loops
            && state.quarters_binary[state.quarter_offset]
        {
            self.counter_frames = 0;
        }
    }

    pub fn is_active(&self) -> bool {
        if !self.has_started() || self.is_finished() {
            return false;
        }
        if self.limit_frames.is_some_and(|limit| self.counter_frames >= limit) {
            return false;
        }
        self.frames_binary[self.counter_frames % self.frames_binary.len()]
    }

    pub fn count_after(&mut self) {
        if self.has_started() {
            self.counter_frames += 1;
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.looping {
            Some(state) => state.completed_loops >= state.limit_loops,
            None => self
                .limit_frames
                .is_some_and(|limit| self.counter_frames >= limit),
        }
    }
}

/// Rendering body and hooks of an overlay. One instance exists per device.
pub trait Overlay: Send {
    fn render(&mut self, buffer: &mut PixelBuffer, palette: &Palette);

    /// Called when the effect is (re)activated.
    fn reset(&mut self) {}

    fn on_trigger(&mut self) {}

    fn alternate(&mut self) {}

    /// Called once when the effect leaves the active set.
    fn on_delete(&mut self) {}

    /// Trigger rule for this overlay; `None` means it never triggers.
    fn new_trigger(&self) -> Option<TriggerPattern> {
        None
    }

    fn sync_send(&self) -> Option<Value> {
        None
    }

    fn sync_load(&mut self, _state: &Value) {}
}

pub type OverlayFactory = fn() -> Box<dyn Overlay>;

struct ActiveEffect {
    name: String,
    overlays: Vec<Box<dyn Overlay>>,
    trigger: Option<TriggerPattern>,
    runtime: EffectRuntime,
    active: bool,
}

impl ActiveEffect {
    fn sync(&mut self) {
        let Some((first, rest)) = self.overlays.split_first_mut() else {
            return;
        };
        if let Some(state) = first.sync_send() {
            for overlay in rest {
                overlay.sync_load(&state);
            }
        }
    }

    fn delete(&mut self) {
        tracing::debug!(effect = %self.name, "removing effect");
        for overlay in &mut self.overlays {
            overlay.on_delete();
        }
    }
}

/// Registry and active set of overlays.
pub struct EffectHandler {
    factories: BTreeMap<String, OverlayFactory>,
    active: Vec<ActiveEffect>,
    queue: InstructionQueue,
    n_devices: usize,
    enabled: bool,
}

impl EffectHandler {
    pub fn new(n_devices: usize, queue_length: usize) -> Self {
        Self {
            factories: BTreeMap::new(),
            active: Vec::new(),
            queue: InstructionQueue::new(queue_length),
            n_devices,
            enabled: true,
        }
    }

    /// Handler with the overlays that ship with the crate.
    pub fn with_builtins(n_devices: usize, queue_length: usize) -> Self {
        let mut handler = Self::new(n_devices, queue_length);
        handler.register("e_invert", || Box::new(Invert));
        handler.register("e_strobe", || Box::new(Strobe::default()));
        handler.register("e_dim", || Box::new(Dim));
        handler
    }

    pub fn register(&mut self, name: impl Into<String>, factory: OverlayFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Whether an effect called `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn queue_mut(&mut self) -> &mut InstructionQueue {
        &mut self.queue
    }

    /// Names of the effects currently in the active set.
    pub fn active_names(&self) -> Vec<&str> {
        self.active.iter().map(|effect| effect.name.as_str()).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.active.iter().any(|effect| effect.name == name)
    }

    /// Whether the named effect renders this frame.
    pub fn is_rendering(&self, name: &str) -> bool {
        self.active
            .iter()
            .any(|effect| effect.name == name && effect.active)
    }

    pub fn runtime(&self, name: &str) -> Option<&EffectRuntime> {
        self.find(name).map(|effect| &effect.runtime)
    }

    /// Activates `name`, replacing a running instance of the same effect.
    pub fn load_effect(
        &mut self,
        name: &str,
        activation: &EffectActivation,
        quarter_time: f64,
        fps: f64,
    ) -> Result<()> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LightsError::UnknownEffect(name.to_string()))?;
        let runtime = EffectRuntime::activate(activation, quarter_time, fps)?;

        let mut overlays: Vec<Box<dyn Overlay>> = (0..self.n_devices).map(|_| factory()).collect();
        overlays.iter_mut().for_each(|overlay| overlay.reset());
        let trigger = overlays.first().and_then(|overlay| overlay.new_trigger());

        tracing::info!(effect = name, ?activation, "loading effect");
        self.remove_effect(name);
        self.active.push(ActiveEffect {
            name: name.to_string(),
            overlays,
            trigger,
            runtime,
            active: false,
        });
        Ok(())
    }

    /// Removes `name` from the active set, running its delete hook. Returns
    /// whether it was active.
    pub fn remove_effect(&mut self, name: &str) -> bool {
        match self.active.iter().position(|effect| effect.name == name) {
            Some(position) => {
                self.active.remove(position).delete();
                true
            }
            None => false,
        }
    }

    pub fn renew_trigger(&mut self, name: &str) {
        if let Some(effect) = self.find_mut(name) {
            effect.trigger = effect.overlays.first().and_then(|overlay| overlay.new_trigger());
        }
    }

    pub fn alternate(&mut self, name: &str) {
        if let Some(effect) = self.find_mut(name) {
            effect.overlays.iter_mut().for_each(|overlay| overlay.alternate());
        }
    }

    /// Drops every active effect and every scheduled effect instruction.
    pub fn clear(&mut self) {
        for mut effect in self.active.drain(..) {
            effect.delete();
        }
        self.queue.clear();
    }

    /// Applies due effect instructions, then runs pre-count, trigger check,
    /// sync and the active-flag recompute for every active effect.
    ///
    /// # Panics
    ///
    /// Panics if the effect queue carries a device instruction.
    pub fn begin_frame<R: Rng>(
        &mut self,
        snapshot: &BeatSnapshot,
        quarter_time: f64,
        fps: f64,
        global_skip: u32,
        rng: &mut R,
    ) {
        for instruction in self.queue.drain(snapshot) {
            match instruction {
                Instruction::Effect { name, activation } => {
                    if let Err(err) = self.load_effect(&name, &activation, quarter_time, fps) {
                        tracing::warn!(
                            effect = %name,
                            error = %err,
                            "scheduled effect could not be loaded"
                        );
                    }
                }
                other => panic!("effect queue cannot handle {other:?}"),
            }
        }

        let enabled = self.enabled;
        for effect in &mut self.active {
            effect.runtime.count_before(snapshot);

            if let Some(trigger) = effect.trigger.as_mut() {
                if trigger.is_match(snapshot, global_skip, rng) {
                    effect.overlays.iter_mut().for_each(|overlay| overlay.on_trigger());
                }
            }

            effect.sync();
            effect.active = enabled && effect.runtime.is_active();
        }
    }

    /// Composites every effect that is active this frame onto `buffer`.
    pub fn render(&mut self, device_index: usize, buffer: &mut PixelBuffer, palette: &Palette) {
        for effect in &mut self.active {
            if !effect.active {
                continue;
            }
            if let Some(overlay) = effect.overlays.get_mut(device_index) {
                overlay.render(buffer, palette);
            }
        }
    }

    /// Post-counts every effect and evicts the finished ones.
    pub fn end_frame(&mut self) {
        for effect in &mut self.active {
            effect.runtime.count_after();
        }

        let mut index = 0;
        while index < self.active.len() {
            if self.active[index].runtime.is_finished() {
                self.active.remove(index).delete();
            } else {
                index += 1;
            }
        }
    }

    fn find(&self, name: &str) -> Option<&ActiveEffect> {
        self.active.iter().find(|effect| effect.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut ActiveEffect> {
        self.active.iter_mut().find(|effect| effect.name == name)
    }
}

struct Invert;

impl Overlay for Invert {
    fn render(&mut self, buffer: &mut PixelBuffer, _palette: &Palette) {
        for pixel in buffer.pixels_mut() {
            pixel.r = 1.0 - pixel.r;
            pixel.g = 1.0 - pixel.g;
            pixel.b = 1.0 - pixel.b;
        }
    }
}

struct Dim;

impl Overlay for Dim {
    fn render(&mut self, buffer: &mut PixelBuffer, _palette: &Palette) {
        for pixel in buffer.pixels_mut() {
            *pixel = pixel.scale(0.3);
        }
    }
}

/// Alternates between the secondary color and black; a trigger restarts the
/// phase on every device at once.
#[derive(Default)]
struct Strobe {
    lit: bool,
}

impl Overlay for Strobe {
    fn render(&mut self, buffer: &mut PixelBuffer, palette: &Palette) {
        if self.lit {
            buffer.fill(palette.secondary);
        } else {
            buffer.clear();
        }
        self.lit = !self.lit;
    }

    fn reset(&mut self) {
        self.lit = true;
    }

    fn on_trigger(&mut self) {
        self.lit = true;
    }

    fn new_trigger(&self) -> Option<TriggerPattern> {
        TriggerPattern::new(&[0], "AC", 1, 1.0).ok()
    }

    fn sync_send(&self) -> Option<Value> {
        Some(Value::Bool(self.lit))
    }

    fn sync_load(&mut self, state: &Value) {
        if let Some(lit) = state.as_bool() {
            self.lit = lit;
        }
    }
}
