//! Core library for the Beatlights LED engine.
//!
//! The crate turns a tempo into a quantized musical position, schedules
//! pattern and effect changes on a looping timeline of quarter beats, renders
//! LED frames at a paced rate and ships them as Art-Net over UDP or a serial
//! link. Each module owns one subsystem; [`Engine`] wires them together into
//! the per-frame cycle.

pub mod audio;
pub mod clock;
pub mod config;
pub mod control;
pub mod effect;
pub mod engine;
pub mod error;
pub mod pacing;
pub mod protocol;
pub mod queue;
pub mod render;
pub mod timeline;
pub mod transport;
pub mod trigger;

pub use audio::{audio_channel, AudioEvent, AudioFeed, AudioLink};
pub use clock::{BeatClock, BeatSnapshot, Fingerprint, TempoConfig};
pub use config::{AppConfig, DeviceConfig, OutputConfig, OutputKind, TimingConfig};
pub use control::{control_channel, ControlHandle, ControlMessage, ControlQueue};
pub use effect::{EffectActivation, EffectHandler, EffectMode, EffectRuntime, Overlay};
pub use engine::{open_output, Engine};
pub use error::{LightsError, Result};
pub use pacing::{FramePacer, PacingStats, StatsReporter, SystemTimer, Timer};
pub use protocol::ArtDmxPacket;
pub use queue::{Instruction, InstructionQueue};
pub use render::{
    Color, Device, Generator, GeneratorRegistry, LevelTable, Palette, PixelBuffer, RenderGraph,
};
pub use timeline::{Placement, Scheduler, Selection, Timeline};
pub use transport::{ArtnetTransmitter, SerialTransport, Transport, UdpTransport};
pub use trigger::{TriggerPattern, TriggerSpec};
