use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    clock::TempoConfig, protocol::ARTNET_PORT, timeline::Timeline, LightsError, Result,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub timing: TimingConfig,
    pub output: Vec<OutputConfig>,
    pub devices: Vec<DeviceConfig>,
    pub effects_enabled: bool,
    pub brightness: f32,
    /// Seconds between pacing reports.
    pub stats_interval: f64,
    pub timelines: Vec<Timeline>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let timing = TimingConfig::default();
        Self {
            output: Vec::new(),
            devices: vec![DeviceConfig::default()],
            effects_enabled: true,
            brightness: 1.0,
            stats_interval: 10.0,
            timelines: vec![Timeline::demo(timing.queue_length)],
            timing,
        }
    }
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "loading configuration");
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.timing.validate()?;
        if !(0.0..=1.0).contains(&self.brightness) {
            return Err(LightsError::config(format!(
                "brightness {} outside [0, 1]",
                self.brightness
            )));
        }
        if self.stats_interval <= 0.0 {
            return Err(LightsError::config("stats interval must be positive"));
        }
        if self.devices.iter().any(|device| device.n_leds == 0 || device.n_lights == 0) {
            return Err(LightsError::config("devices need at least one led and one light"));
        }
        if self.timelines.is_empty() {
            return Err(LightsError::config("at least one timeline is required"));
        }
        for timeline in &self.timelines {
            timeline.validate(self.timing.queue_length)?;
        }
        Ok(())
    }

    /// Bytes per frame once every device is flattened onto the wire.
    pub fn channel_count(&self) -> usize {
        self.devices
            .iter()
            .map(|device| device.n_leds * device.n_lights * 3)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub bpm_base: f64,
    pub bpm_multiplier: f64,
    pub fps: f64,
    /// Quarters in one timeline loop.
    pub queue_length: usize,
    pub global_triggerskip: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bpm_base: 140.0,
            bpm_multiplier: 1.0,
            fps: 20.0,
            queue_length: 128,
            global_triggerskip: 1,
        }
    }
}

impl TimingConfig {
    pub fn tempo(&self) -> TempoConfig {
        TempoConfig {
            bpm_base: self.bpm_base,
            bpm_multiplier: self.bpm_multiplier,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.tempo().validate()?;
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(LightsError::config(format!("fps {} must be positive", self.fps)));
        }
        if self.queue_length == 0 {
            return Err(LightsError::config("queue length must be positive"));
        }
        if self.global_triggerskip == 0 {
            return Err(LightsError::config("trigger skip must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Udp,
    Serial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub kind: OutputKind,
    pub address: Option<String>,
    pub port: u16,
    pub serial_path: String,
    pub baud_rate: u32,
    pub start_universe: u8,
    /// Sent once on the configuration universe at startup.
    pub leds_per_output: Option<[u32; 4]>,
    /// Trace-log every outgoing packet.
    pub debug: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::Udp,
            address: None,
            port: ARTNET_PORT,
            serial_path: "/dev/ttyAMA0".to_string(),
            baud_rate: 3_000_000,
            start_universe: 0,
            leds_per_output: None,
            debug: false,
        }
    }
}

impl OutputConfig {
    pub fn udp(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            kind: OutputKind::Serial,
            serial_path: path.into(),
            baud_rate,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub n_lights: usize,
    pub n_leds: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            n_lights: 2,
            n_leds: 100,
        }
    }
}
