use std::path::PathBuf;

use beatlights_core::{AppConfig, ArtnetTransmitter, Engine, OutputConfig, UdpTransport};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

fn main() -> beatlights_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::SendConfig { udp, port, leds } => send_config(&udp, port, &leds),
    }
}

fn run(args: RunArgs) -> beatlights_core::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    if config.output.is_empty() {
        tracing::warn!("no output configured, frames are rendered but not sent");
    }

    let mut engine = Engine::new(&config)?;
    engine.run(args.frames);
    Ok(())
}

fn send_config(udp: &str, port: u16, leds: &[u32]) -> beatlights_core::Result<()> {
    let leds: [u32; 4] = leds.try_into().map_err(|_| {
        beatlights_core::LightsError::config(format!("expected 4 led counts, got {}", leds.len()))
    })?;
    let destination = beatlights_core::transport::resolve(udp, port)?;
    let transport = UdpTransport::bind(Some(destination))?;
    let mut transmitter = ArtnetTransmitter::new(Box::new(transport), 0);
    transmitter.transmit_output_config(leds);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronized LED engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the render loop.
    Run(RunArgs),
    /// Send the per-output LED counts to a controller and exit.
    SendConfig {
        /// Controller address.
        #[arg(long)]
        udp: String,
        #[arg(long, default_value_t = beatlights_core::protocol::ARTNET_PORT)]
        port: u16,
        /// LED counts of the four physical outputs, comma separated.
        #[arg(long, value_delimiter = ',')]
        leds: Vec<u32>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Base tempo in beats per minute.
    #[arg(long)]
    bpm: Option<f64>,
    #[arg(long)]
    fps: Option<f64>,
    /// Send Art-Net over UDP to this host.
    #[arg(long)]
    udp: Option<String>,
    /// Send Art-Net over this serial device.
    #[arg(long)]
    serial: Option<String>,
    #[arg(long, default_value_t = 3_000_000)]
    baud: u32,
    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,
    /// Trace-log every outgoing Art-Net packet.
    #[arg(long)]
    debug_packets: bool,
}

impl RunArgs {
    /// Command line outputs replace the configured ones.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(bpm) = self.bpm {
            config.timing.bpm_base = bpm;
        }
        if let Some(fps) = self.fps {
            config.timing.fps = fps;
        }

        let mut outputs = Vec::new();
        if let Some(host) = &self.udp {
            outputs.push(OutputConfig::udp(host.clone()));
        }
        if let Some(path) = &self.serial {
            outputs.push(OutputConfig::serial(path.clone(), self.baud));
        }
        if !outputs.is_empty() {
            config.output = outputs;
        }
        if self.debug_packets {
            config.output.iter_mut().for_each(|output| output.debug = true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::parse_from([
            "beatlights",
            "run",
            "--bpm",
            "128",
            "--fps",
            "30",
            "--serial",
            "/dev/ttyUSB0",
            "--frames",
            "5",
            "--debug-packets",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut config = AppConfig::default();
        args.apply(&mut config);

        assert_eq!(config.timing.bpm_base, 128.0);
        assert_eq!(config.timing.fps, 30.0);
        let expected = OutputConfig {
            debug: true,
            ..OutputConfig::serial("/dev/ttyUSB0", 3_000_000)
        };
        assert_eq!(config.output, vec![expected]);
        assert_eq!(args.frames, Some(5));
    }

    #[test]
    fn send_config_parses_led_list() {
        let cli = Cli::parse_from([
            "beatlights",
            "send-config",
            "--udp",
            "10.0.0.2",
            "--leds",
            "1,2,3,4",
        ]);
        let Commands::SendConfig { leds, port, .. } = cli.command else {
            panic!("expected send-config");
        };
        assert_eq!(leds, vec![1, 2, 3, 4]);
        assert_eq!(port, 6454);
    }
}
