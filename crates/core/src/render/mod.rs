//! Pixel buffers, generators and the devices that own them.
//!
//! Generators are resolved by name through a [`GeneratorRegistry`] once, when
//! a device selects them. The render loop then only talks to the
//! [`Generator`] trait.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::BeatSnapshot;
use crate::queue::{Instruction, InstructionQueue};
use crate::trigger::{effective_skip, TriggerPattern, TriggerSpec};
use crate::{LightsError, Result};

/// Highest selectable timeline level. Level 0 means "off".
pub const MAX_LEVEL: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0);
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn scale(self, factor: f32) -> Self {
        Self::new(self.r * factor, self.g * factor, self.b * factor)
    }
}

/// Primary and secondary color handed to every render call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    pub primary: Color,
    pub secondary: Color,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            primary: Color::new(1.0, 0.0, 0.0),
            secondary: Color::new(0.0, 0.0, 1.0),
        }
    }
}

/// RGB float pixels of one device, stored light by light.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    n_leds: usize,
    n_lights: usize,
    pixels: Vec<Color>,
}

impl PixelBuffer {
    pub fn new(n_leds: usize, n_lights: usize) -> Self {
        Self {
            n_leds,
            n_lights,
            pixels: vec![Color::BLACK; n_leds * n_lights],
        }
    }

    pub fn n_leds(&self) -> usize {
        self.n_leds
    }

    pub fn n_lights(&self) -> usize {
        self.n_lights
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[Color] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Color] {
        &mut self.pixels
    }

    pub fn get(&self, light: usize, led: usize) -> Option<Color> {
        self.index(light, led).map(|index| self.pixels[index])
    }

    pub fn set(&mut self, light: usize, led: usize, color: Color) {
        if let Some(index) = self.index(light, led) {
            self.pixels[index] = color;
        }
    }

    pub fn fill(&mut self, color: Color) {
        self.pixels.fill(color);
    }

    pub fn clear(&mut self) {
        self.fill(Color::BLACK);
    }

    /// Converts the buffer into 8-bit RGB channel bytes.
    pub fn to_channels(&self, brightness: f32) -> Vec<u8> {
        let to_byte = |value: f32| (value.clamp(0.0, 1.0) * brightness * 255.0).round() as u8;
        self.pixels
            .iter()
            .flat_map(|pixel| [to_byte(pixel.r), to_byte(pixel.g), to_byte(pixel.b)])
            .collect()
    }

    fn index(&self, light: usize, led: usize) -> Option<usize> {
        (light < self.n_lights && led < self.n_leds).then(|| light * self.n_leds + led)
    }
}

/// A visual pattern body.
pub trait Generator: Send {
    fn render(&mut self, buffer: &mut PixelBuffer, palette: &Palette, snapshot: &BeatSnapshot);

    fn on_trigger(&mut self) {}

    fn reset(&mut self) {}

    fn alternate(&mut self) {}

    /// Trigger rule used when the generator is selected.
    fn trigger(&self) -> TriggerSpec {
        TriggerSpec::default()
    }

    /// State shared with the same generator on the other devices.
    fn sync_send(&self) -> Option<Value> {
        None
    }

    fn sync_load(&mut self, _state: &Value) {}
}

pub type GeneratorFactory = fn() -> Box<dyn Generator>;

#[derive(Debug, Default, Clone)]
pub struct GeneratorRegistry {
    factories: BTreeMap<String, GeneratorFactory>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the generators that ship with the crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("p_none", || Box::new(Blank));
        registry.register("p_solid", || Box::new(Pulse::default()));
        registry.register("p_chase", || Box::new(Chase::default()));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: GeneratorFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Generator>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| LightsError::UnknownGenerator(name.to_string()))
    }
}

struct Blank;

impl Generator for Blank {
    fn render(&mut self, buffer: &mut PixelBuffer, _palette: &Palette, _snapshot: &BeatSnapshot) {
        buffer.clear();
    }
}

/// Full brightness on trigger, decaying until the next one.
#[derive(Default)]
struct Pulse {
    intensity: f32,
}

impl Generator for Pulse {
    fn render(&mut self, buffer: &mut PixelBuffer, palette: &Palette, _snapshot: &BeatSnapshot) {
        buffer.fill(palette.primary.scale(self.intensity));
        self.intensity *= 0.8;
    }

    fn on_trigger(&mut self) {
        self.intensity = 1.0;
    }

    fn reset(&mut self) {
        self.intensity = 0.0;
    }
}

/// A single lit led per light that steps forward on each trigger.
#[derive(Default)]
struct Chase {
    position: usize,
    secondary: bool,
}

impl Generator for Chase {
    fn render(&mut self, buffer: &mut PixelBuffer, palette: &Palette, _snapshot: &BeatSnapshot) {
        buffer.clear();
        if buffer.n_leds() == 0 {
            return;
        }
        let led = self.position % buffer.n_leds();
        let color = if self.secondary {
            palette.secondary
        } else {
            palette.primary
        };
        for light in 0..buffer.n_lights() {
            buffer.set(light, led, color);
        }
    }

    fn on_trigger(&mut self) {
        self.position += 1;
    }

    fn alternate(&mut self) {
        self.secondary = !self.secondary;
    }

    fn trigger(&self) -> TriggerSpec {
        TriggerSpec {
            beats: vec![0, 1, 2, 3],
            quarters: "AC".to_string(),
            ..TriggerSpec::default()
        }
    }

    fn sync_send(&self) -> Option<Value> {
        Some(Value::from(self.position))
    }

    fn sync_load(&mut self, state: &Value) {
        if let Some(position) = state.as_u64() {
            self.position = position as usize;
        }
    }

    fn reset(&mut self) {
        self.position = 0;
        self.secondary = false;
    }
}

struct Selection {
    name: String,
    generator: Box<dyn Generator>,
    trigger: TriggerPattern,
}

impl Selection {
    fn resolve(registry: &GeneratorRegistry, level: usize, name: &str) -> Result<Self> {
        if level == 0 || level > MAX_LEVEL {
            return Err(LightsError::config(format!(
                "cannot select a generator on level {level}"
            )));
        }
        let mut generator = registry.create(name)?;
        generator.reset();
        let trigger = TriggerPattern::from_spec(generator.trigger())?;
        Ok(Self {
            name: name.to_string(),
            generator,
            trigger,
        })
    }
}

/// Generators for every level, resolved but not yet installed on a device.
pub struct LevelTable(Vec<Option<Selection>>);

impl LevelTable {
    /// Resolves every `(level, generator)` pair; levels left out stay empty.
    pub fn resolve<'a>(
        registry: &GeneratorRegistry,
        selections: impl IntoIterator<Item = (usize, &'a str)>,
    ) -> Result<Self> {
        let mut table: Vec<Option<Selection>> = (0..=MAX_LEVEL).map(|_| None).collect();
        for (level, name) in selections {
            let selection = Selection::resolve(registry, level, name)?;
            table[level] = Some(selection);
        }
        Ok(Self(table))
    }
}

/// One physical fixture: its pixel buffer, the generator selected for each
/// timeline level and its own instruction queue.
pub struct Device {
    index: usize,
    buffer: PixelBuffer,
    selections: Vec<Option<Selection>>,
    level: usize,
    queue: InstructionQueue,
    triggerskip: Option<u32>,
}

impl Device {
    pub fn new(index: usize, n_leds: usize, n_lights: usize, queue_length: usize) -> Self {
        Self {
            index,
            buffer: PixelBuffer::new(n_leds, n_lights),
            selections: (0..=MAX_LEVEL).map(|_| None).collect(),
            level: 1,
            queue: InstructionQueue::new(queue_length),
            triggerskip: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn queue_mut(&mut self) -> &mut InstructionQueue {
        &mut self.queue
    }

    pub fn set_triggerskip(&mut self, skip: Option<u32>) {
        self.triggerskip = skip;
    }

    /// Switches the level whose generator renders.
    ///
    /// # Panics
    ///
    /// Panics if `level` is above [`MAX_LEVEL`].
    pub fn set_level(&mut self, level: usize) {
        assert!(level <= MAX_LEVEL, "timeline level {level} above {MAX_LEVEL}");
        if level != self.level {
            tracing::debug!(device = self.index, level, "switching timeline level");
        }
        self.level = level;
    }

    pub fn selected(&self, level: usize) -> Option<&str> {
        self.selections
            .get(level)
            .and_then(Option::as_ref)
            .map(|selection| selection.name.as_str())
    }

    /// Resolves `name` through `registry` and places it on `level`.
    pub fn select(&mut self, registry: &GeneratorRegistry, level: usize, name: &str) -> Result<()> {
        let selection = Selection::resolve(registry, level, name)?;
        self.selections[level] = Some(selection);
        Ok(())
    }

    /// Replaces every level's generator at once.
    pub fn install_levels(&mut self, table: LevelTable) {
        self.selections = table.0;
    }

    /// Replaces the trigger rule of the generator on `level`.
    pub fn renew_trigger(&mut self, level: usize, spec: TriggerSpec) -> Result<()> {
        match self.selections.get_mut(level).and_then(Option::as_mut) {
            Some(selection) => selection.trigger.update(spec),
            None => Err(LightsError::config(format!("no generator selected on level {level}"))),
        }
    }

    pub fn alternate(&mut self) {
        if let Some(selection) = self.active_selection_mut() {
            selection.generator.alternate();
        }
    }

    /// Applies every instruction due for this frame.
    ///
    /// # Panics
    ///
    /// Device queues only carry level changes; anything else is a scheduling
    /// bug.
    pub fn apply_instructions(&mut self, snapshot: &BeatSnapshot) {
        for instruction in self.queue.drain(snapshot) {
            match instruction {
                Instruction::Device { level } => self.set_level(level),
                other => panic!("device queue cannot handle {other:?}"),
            }
        }
    }

    pub fn render<R: Rng>(
        &mut self,
        snapshot: &BeatSnapshot,
        palette: &Palette,
        global_skip: u32,
        rng: &mut R,
    ) {
        let skip = effective_skip(global_skip, self.triggerskip);
        let level = self.level;
        let Some(selection) = self.selections.get_mut(level).and_then(Option::as_mut) else {
            self.buffer.clear();
            return;
        };

        if selection.trigger.is_match(snapshot, skip, rng) {
            selection.generator.on_trigger();
        }
        selection.generator.render(&mut self.buffer, palette, snapshot);
    }

    fn active_selection_mut(&mut self) -> Option<&mut Selection> {
        self.selections.get_mut(self.level).and_then(Option::as_mut)
    }
}

/// All devices of the installation.
#[derive(Default)]
pub struct RenderGraph {
    devices: Vec<Device>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&mut self, device: Device) {
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn apply_instructions(&mut self, snapshot: &BeatSnapshot) {
        for device in &mut self.devices {
            device.apply_instructions(snapshot);
        }
    }

    /// Copies the shared state of the first device's active generator onto
    /// the same generator of the other devices.
    pub fn sync_generators(&mut self) {
        let Some((first, rest)) = self.devices.split_first_mut() else {
            return;
        };
        let Some(source) = first.active_selection_mut() else {
            return;
        };
        let Some(state) = source.generator.sync_send() else {
            return;
        };
        let name = source.name.clone();

        for device in rest {
            if let Some(target) = device.active_selection_mut() {
                if target.name == name {
                    target.generator.sync_load(&state);
                }
            }
        }
    }

    pub fn render<R: Rng>(
        &mut self,
        snapshot: &BeatSnapshot,
        palette: &Palette,
        global_skip: u32,
        rng: &mut R,
    ) {
        for device in &mut self.devices {
            device.render(snapshot, palette, global_skip, rng);
        }
    }
}
