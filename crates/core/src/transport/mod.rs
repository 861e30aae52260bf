//! Delivery of encoded packets to the hardware.
//!
//! Both transports are fire-and-forget: nothing is retried, because the next
//! frame re-sends the complete pixel state anyway.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::protocol::{self, ArtDmxPacket};
use crate::{LightsError, Result};

/// Sink for raw packet bytes. Implementations must not block the caller.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]);
}

/// Non-blocking UDP sender. Without a destination, packets are dropped
/// silently; that is the normal state until device discovery finishes.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    destination: Option<SocketAddr>,
    error_logged: bool,
}

impl UdpTransport {
    pub fn bind(destination: Option<SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            destination,
            error_logged: false,
        })
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn set_destination(&mut self, destination: Option<SocketAddr>) {
        match destination {
            Some(address) => tracing::info!(%address, "artnet transmission enabled"),
            None => tracing::warn!("artnet transmission disabled until a destination is set"),
        }
        self.destination = destination;
    }

    fn record_outcome(&mut self, destination: SocketAddr, outcome: std::io::Result<usize>) {
        match outcome {
            Ok(_) => {
                if self.error_logged {
                    tracing::info!(
                        %destination,
                        "network reachable again, artnet transmission resumed"
                    );
                    self.error_logged = false;
                }
            }
            // Send buffer full; says nothing about reachability.
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(%destination, "udp send buffer full, packet dropped");
            }
            Err(err) => {
                if !self.error_logged {
                    tracing::warn!(%destination, error = %err, "artnet packet dropped");
                    self.error_logged = true;
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8]) {
        let Some(destination) = self.destination else {
            return;
        };

        let outcome = self.socket.send_to(bytes, destination);
        self.record_outcome(destination, outcome);
    }
}

/// Resolves `host` to an address on `port`.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| LightsError::config(format!("could not resolve `{host}`")))
}

/// Serial sender. The caller only enqueues; a dedicated thread performs the
/// blocking device writes.
#[derive(Debug)]
pub struct SerialTransport {
    sender: Option<Sender<Vec<u8>>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        tracing::info!(path, baud_rate, "serial port opened");
        Self::with_writer(port)
    }

    /// Drives an arbitrary writer from the background thread.
    pub fn with_writer<W: Write + Send + 'static>(writer: W) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name("serial-writer".to_string())
            .spawn(move || write_loop(writer, receiver))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) {
        if let Some(sender) = &self.sender {
            if sender.send(bytes.to_vec()).is_err() {
                tracing::debug!("serial writer has stopped, packet dropped");
            }
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("serial writer thread panicked");
            }
        }
    }
}

fn write_loop<W: Write>(mut writer: W, receiver: Receiver<Vec<u8>>) {
    for bytes in receiver {
        if let Err(err) = writer.write_all(&bytes) {
            tracing::debug!(error = %err, "serial write failed, packet dropped");
        }
    }
    let _ = writer.flush();
}

/// Encodes channel data into ArtDMX packets and hands them to a transport.
pub struct ArtnetTransmitter {
    transport: Box<dyn Transport>,
    start_universe: u8,
    debug: bool,
    scratch: Vec<u8>,
}

impl ArtnetTransmitter {
    pub fn new(transport: Box<dyn Transport>, start_universe: u8) -> Self {
        Self {
            transport,
            start_universe,
            debug: false,
            scratch: Vec::new(),
        }
    }

    /// Logs every outgoing packet at trace level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn start_universe(&self) -> u8 {
        self.start_universe
    }

    /// Ships `channels` as consecutive universes.
    pub fn transmit_channels(&mut self, channels: &[u8]) -> Result<()> {
        for packet in protocol::encode(channels, self.start_universe)? {
            self.send_packet(&packet);
        }
        Ok(())
    }

    /// Sends the LED counts of the four physical outputs. Only used at setup.
    pub fn transmit_output_config(&mut self, leds_per_output: [u32; 4]) {
        tracing::info!(?leds_per_output, "sending output configuration");
        self.send_packet(&protocol::encode_output_config(leds_per_output));
    }

    fn send_packet(&mut self, packet: &ArtDmxPacket) {
        self.scratch.clear();
        packet.write_to(&mut self.scratch);
        if self.debug {
            tracing::trace!(universe = packet.universe, bytes = ?self.scratch, "artnet packet");
        }
        self.transport.send(&self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Records every packet in memory.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    impl Transport for Recorder {
        fn send(&mut self, bytes: &[u8]) {
            self.0.lock().unwrap().push(bytes.to_vec());
        }
    }

    #[test]
    fn udp_without_destination_drops_silently() {
        let mut transport = UdpTransport::bind(None).unwrap();
        transport.send(&[1, 2, 3]);
        assert_eq!(transport.destination(), None);
    }

    #[test]
    fn udp_delivers_packets_to_destination() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut transport = UdpTransport::bind(Some(receiver.local_addr().unwrap())).unwrap();

        let packet = ArtDmxPacket::new(2, vec![9, 8, 7]).unwrap();
        transport.send(&packet.to_bytes());

        let mut buf = [0u8; 600];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(ArtDmxPacket::parse(&buf[..len]).unwrap(), packet);
    }

    #[test]
    fn udp_full_send_buffer_is_not_reported_as_unreachable() {
        let mut transport = UdpTransport::bind(None).unwrap();
        let destination: SocketAddr = "127.0.0.1:6454".parse().unwrap();

        transport.record_outcome(destination, Err(ErrorKind::WouldBlock.into()));
        assert!(!transport.error_logged);

        transport.record_outcome(destination, Err(ErrorKind::ConnectionRefused.into()));
        assert!(transport.error_logged);
        transport.record_outcome(destination, Err(ErrorKind::WouldBlock.into()));
        assert!(transport.error_logged);

        transport.record_outcome(destination, Ok(10));
        assert!(!transport.error_logged);
    }

    #[test]
    fn serial_writes_happen_on_background_thread() {
        let sink = SharedSink::default();
        let mut transport = SerialTransport::with_writer(sink.clone()).unwrap();
        transport.send(&[1, 2]);
        transport.send(&[3]);
        drop(transport);

        assert_eq!(*sink.0.lock().unwrap(), vec![1, 2, 3]);
    }

    /// Blocks every write until the gate sender is dropped.
    struct GatedSink {
        gate: Receiver<()>,
        entered: Sender<()>,
        inner: SharedSink,
    }

    impl Write for GatedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stalled_serial_device_does_not_block_sender() {
        let (gate_tx, gate) = crossbeam_channel::unbounded();
        let (entered, writer_entered) = crossbeam_channel::unbounded();
        let sink = SharedSink::default();
        let mut transport = SerialTransport::with_writer(GatedSink {
            gate,
            entered,
            inner: sink.clone(),
        })
        .unwrap();

        transport.send(&[1, 2]);
        writer_entered.recv_timeout(Duration::from_secs(2)).unwrap();
        transport.send(&[3]);
        transport.send(&[4, 5]);
        assert!(sink.0.lock().unwrap().is_empty());

        drop(gate_tx);
        drop(transport);
        assert_eq!(*sink.0.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn transmitter_splits_channels_across_universes() {
        let recorder = Recorder::default();
        let mut transmitter = ArtnetTransmitter::new(Box::new(recorder.clone()), 2);
        transmitter.transmit_channels(&vec![1u8; 600]).unwrap();

        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let first = ArtDmxPacket::parse(&sent[0]).unwrap();
        let second = ArtDmxPacket::parse(&sent[1]).unwrap();
        assert_eq!((first.universe, first.data().len()), (2, 512));
        assert_eq!((second.universe, second.data().len()), (3, 88));
    }

    #[test]
    fn transmitter_sends_output_config_on_reserved_universe() {
        let recorder = Recorder::default();
        let mut transmitter = ArtnetTransmitter::new(Box::new(recorder.clone()), 0);
        transmitter.transmit_output_config([10, 20, 30, 40]);

        let sent = recorder.0.lock().unwrap();
        let packet = ArtDmxPacket::parse(&sent[0]).unwrap();
        assert_eq!(packet.universe, protocol::CONFIG_UNIVERSE);
        assert_eq!(&packet.data()[16..], &100u32.to_le_bytes());
    }
}
