//! The frame engine.
//!
//! [`Engine`] owns every component of a running installation and drives one
//! cycle per frame:
//!
//! 1. mark the frame start and apply queued control messages,
//! 2. take the beat snapshot and poll the audio link,
//! 3. apply due device and effect instructions,
//! 4. render generators, then composite active overlays,
//! 5. post-count effects, encode and transmit,
//! 6. sleep for the rest of the frame.
//!
//! Nothing is shared between threads except the control and audio channels
//! and the serial writer queue.

use rand::{rngs::StdRng, SeedableRng};

use crate::{
    audio::{AudioEvent, AudioLink},
    clock::{BeatClock, BeatSnapshot, TempoConfig},
    config::{AppConfig, OutputConfig, OutputKind},
    control::{control_channel, ControlHandle, ControlMessage, ControlQueue},
    effect::EffectHandler,
    pacing::{FramePacer, PacingStats, StatsReporter, SystemTimer, Timer},
    protocol,
    render::{Device, GeneratorRegistry, Palette, RenderGraph, MAX_LEVEL},
    timeline::Scheduler,
    transport::{self, ArtnetTransmitter, SerialTransport, UdpTransport},
    LightsError, Result,
};

/// Upper bound applied to the configured brightness on the wire.
pub const MAX_BRIGHTNESS: f32 = 0.5;

/// Opens the transport described by `output` and wraps it in a transmitter.
pub fn open_output(output: &OutputConfig) -> Result<ArtnetTransmitter> {
    let transport: Box<dyn transport::Transport> = match output.kind {
        OutputKind::Udp => {
            let destination = output
                .address
                .as_deref()
                .map(|host| transport::resolve(host, output.port))
                .transpose()?;
            Box::new(UdpTransport::bind(destination)?)
        }
        OutputKind::Serial => Box::new(SerialTransport::open(
            &output.serial_path,
            output.baud_rate,
        )?),
    };

    let mut transmitter =
        ArtnetTransmitter::new(transport, output.start_universe).with_debug(output.debug);
    if let Some(leds) = output.leds_per_output {
        transmitter.transmit_output_config(leds);
    }
    Ok(transmitter)
}

pub struct Engine<T: Timer = SystemTimer> {
    clock: BeatClock,
    pacer: FramePacer<T>,
    reporter: StatsReporter,
    registry: GeneratorRegistry,
    graph: RenderGraph,
    effects: EffectHandler,
    scheduler: Scheduler,
    transmitters: Vec<ArtnetTransmitter>,
    control_handle: ControlHandle,
    controls: ControlQueue,
    audio: Option<AudioLink>,
    last_audio: Option<AudioEvent>,
    rng: StdRng,
    palette: Palette,
    fps: f64,
    global_skip: u32,
    brightness: f32,
    channel_count: usize,
    frames: u64,
}

impl Engine<SystemTimer> {
    /// Builds an engine on the wall clock, opening every configured output.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let mut engine = Self::with_timer(config, SystemTimer::default(), StdRng::from_os_rng())?;
        for output in &config.output {
            engine.add_transmitter(open_output(output)?)?;
        }
        Ok(engine)
    }
}

impl<T: Timer> Engine<T> {
    /// Builds an engine without outputs and loads the first timeline.
    pub fn with_timer(config: &AppConfig, timer: T, rng: StdRng) -> Result<Self> {
        config.validate()?;
        let timing = config.timing;

        let pacer = FramePacer::with_timer(timer, timing.fps)?;
        let now = pacer.now();
        let clock = BeatClock::new(timing.tempo(), timing.queue_length, now)?;

        let mut graph = RenderGraph::new();
        for (index, device) in config.devices.iter().enumerate() {
            graph.register_device(Device::new(
                index,
                device.n_leds,
                device.n_lights,
                timing.queue_length,
            ));
        }
        let mut effects = EffectHandler::with_builtins(graph.len(), timing.queue_length);
        effects.set_enabled(config.effects_enabled);

        let registry = GeneratorRegistry::with_builtins();
        let scheduler = Scheduler::new(
            config.timelines.clone(),
            timing.queue_length,
            &registry,
            &effects,
        )?;

        let (control_handle, controls) = control_channel();
        let mut engine = Self {
            clock,
            pacer,
            reporter: StatsReporter::new(config.stats_interval, now),
            registry,
            graph,
            effects,
            scheduler,
            transmitters: Vec::new(),
            control_handle,
            controls,
            audio: None,
            last_audio: None,
            rng,
            palette: Palette::default(),
            fps: timing.fps,
            global_skip: timing.global_triggerskip,
            brightness: config.brightness,
            channel_count: config.channel_count(),
            frames: 0,
        };
        engine.load_timeline(0)?;

        tracing::info!(
            devices = engine.graph.len(),
            bpm = engine.clock.tempo().bpm(),
            fps = engine.fps,
            channels = engine.channel_count,
            "engine ready"
        );
        Ok(engine)
    }

    /// Adds an output. Fails if a full frame would not fit below the
    /// configuration universe.
    pub fn add_transmitter(&mut self, transmitter: ArtnetTransmitter) -> Result<()> {
        protocol::encode(&vec![0; self.channel_count], transmitter.start_universe())?;
        self.transmitters.push(transmitter);
        Ok(())
    }

    pub fn attach_audio(&mut self, link: AudioLink) {
        self.audio = Some(link);
    }

    /// Handle for queueing control messages from other threads.
    pub fn control_handle(&self) -> ControlHandle {
        self.control_handle.clone()
    }

    pub fn clock(&self) -> &BeatClock {
        &self.clock
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn effects(&self) -> &EffectHandler {
        &self.effects
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn pacer(&self) -> &FramePacer<T> {
        &self.pacer
    }

    /// Latest audio data; kept across frames in which nothing new arrived.
    pub fn last_audio(&self) -> Option<AudioEvent> {
        self.last_audio
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn stats(&self) -> PacingStats {
        self.pacer.stats()
    }

    /// Runs `frames` cycles, or forever when `None`.
    pub fn run(&mut self, frames: Option<u64>) {
        tracing::info!(?frames, "render loop started");
        let mut remaining = frames;
        while remaining != Some(0) {
            self.run_frame();
            remaining = remaining.map(|left| left - 1);
        }
        tracing::info!(frames = self.frames, stats = ?self.stats(), "render loop finished");
    }

    /// Executes one full cycle and returns the snapshot it rendered.
    pub fn run_frame(&mut self) -> BeatSnapshot {
        let now = self.pacer.mark_start();
        for message in self.controls.drain() {
            self.apply_control(message, now);
        }

        let snapshot = self.clock.snapshot(now);
        if let Some(event) = self.audio.as_mut().and_then(AudioLink::poll) {
            if event.is_beat {
                tracing::trace!(timestamp = event.timestamp, "audio beat");
            }
            self.last_audio = Some(event);
        }

        self.graph.apply_instructions(&snapshot);
        self.effects.begin_frame(
            &snapshot,
            self.clock.quarter_time(),
            self.fps,
            self.global_skip,
            &mut self.rng,
        );

        self.graph.sync_generators();
        self.graph
            .render(&snapshot, &self.palette, self.global_skip, &mut self.rng);
        for device in self.graph.devices_mut() {
            let index = device.index();
            self.effects.render(index, device.buffer_mut(), &self.palette);
        }
        self.effects.end_frame();

        self.transmit();

        self.pacer.finish_frame();
        self.frames += 1;
        let stats = self.pacer.stats();
        self.reporter.notify(self.pacer.frame_start(), &stats);
        snapshot
    }

    fn transmit(&mut self) {
        if self.transmitters.is_empty() {
            return;
        }
        let brightness = self.brightness.min(MAX_BRIGHTNESS);
        let channels: Vec<u8> = self
            .graph
            .devices()
            .iter()
            .flat_map(|device| device.buffer().to_channels(brightness))
            .collect();

        for transmitter in &mut self.transmitters {
            if let Err(err) = transmitter.transmit_channels(&channels) {
                tracing::error!(error = %err, "frame could not be encoded");
            }
        }
    }

    fn load_timeline(&mut self, index: usize) -> Result<()> {
        self.scheduler.load(
            index,
            &mut self.graph,
            &mut self.effects,
            &self.registry,
            &mut self.rng,
        )
    }

    fn apply_control(&mut self, message: ControlMessage, now: f64) {
        tracing::debug!(?message, "applying control message");
        let outcome = match message {
            ControlMessage::SetSync => {
                self.clock.resync(now);
                Ok(())
            }
            ControlMessage::AdjustSync { value } => {
                self.clock.shift_epoch(value);
                Ok(())
            }
            ControlMessage::SetBpm { bpm } => {
                let tempo = self.clock.tempo();
                self.clock.set_tempo(TempoConfig {
                    bpm_base: bpm,
                    ..tempo
                })
            }
            ControlMessage::SetBpmMultiplier { multiplier } => {
                self.clock.set_bpm_multiplier(multiplier)
            }
            ControlMessage::SetFps { fps } => self.pacer.set_fps(fps).map(|()| self.fps = fps),
            ControlMessage::SetTriggerskip { skip } => {
                if skip == 0 {
                    Err(LightsError::config("trigger skip must be at least 1"))
                } else {
                    self.global_skip = skip;
                    Ok(())
                }
            }
            ControlMessage::SetDeviceTriggerskip { device, skip } => {
                match self.graph.devices_mut().get_mut(device) {
                    Some(device) => {
                        device.set_triggerskip(skip.filter(|skip| *skip > 0));
                        Ok(())
                    }
                    None => Err(LightsError::config(format!("no device {device}"))),
                }
            }
            ControlMessage::SetEffectsEnabled { enabled } => {
                self.effects.set_enabled(enabled);
                Ok(())
            }
            ControlMessage::SetBrightness { brightness } => {
                self.brightness = brightness.clamp(0.0, 1.0);
                Ok(())
            }
            ControlMessage::SetLevel { device, level } => {
                if level > MAX_LEVEL {
                    Err(LightsError::config(format!(
                        "timeline level {level} above {MAX_LEVEL}"
                    )))
                } else {
                    self.for_devices(device, |target| {
                        target.set_level(level);
                        Ok(())
                    })
                }
            }
            ControlMessage::RenewDeviceTrigger {
                device,
                level,
                trigger,
            } => self.for_devices(device, |target| target.renew_trigger(level, trigger.clone())),
            ControlMessage::AlternateDevice { device } => self.for_devices(device, |target| {
                target.alternate();
                Ok(())
            }),
            ControlMessage::LoadEffect { name, activation } => {
                self.effects
                    .load_effect(&name, &activation, self.clock.quarter_time(), self.fps)
            }
            ControlMessage::RemoveEffect { name } => {
                self.effects.remove_effect(&name);
                Ok(())
            }
            ControlMessage::RenewEffectTrigger { name } => {
                self.effects.renew_trigger(&name);
                Ok(())
            }
            ControlMessage::AlternateEffect { name } => {
                self.effects.alternate(&name);
                Ok(())
            }
            ControlMessage::SwitchTimeline { index } => self.load_timeline(index),
        };

        if let Err(err) = outcome {
            tracing::warn!(error = %err, "control message rejected");
        }
    }

    /// Runs `apply` on one device, or on every device when `device` is
    /// `None`. Stops at the first error.
    fn for_devices(
        &mut self,
        device: Option<usize>,
        mut apply: impl FnMut(&mut Device) -> Result<()>,
    ) -> Result<()> {
        match device {
            Some(index) => match self.graph.devices_mut().get_mut(index) {
                Some(target) => apply(target),
                None => Err(LightsError::config(format!("no device {index}"))),
            },
            None => self.graph.devices_mut().iter_mut().try_for_each(apply),
        }
    }
}
