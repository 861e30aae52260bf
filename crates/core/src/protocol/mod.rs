//! ArtDMX packet encoding.
//!
//! Layout of one packet (multi-byte fields noted with their byte order):
//!
//! | bytes | field                                  |
//! |-------|----------------------------------------|
//! | 0..8  | `"Art-Net\0"`                          |
//! | 8..10 | opcode `0x5000`, little endian         |
//! | 10..12| protocol version `14`, big endian      |
//! | 12    | sequence (0 = unused)                  |
//! | 13    | physical port (informative)            |
//! | 14    | universe, low byte of the port address |
//! | 15    | subnet, high byte (MSB unused)         |
//! | 16..18| payload length, big endian             |
//! | 18..  | payload, at most 512 bytes             |

use crate::{LightsError, Result};

pub const ARTNET_ID: &[u8; 8] = b"Art-Net\0";
pub const OP_DMX: u16 = 0x5000;
pub const PROTOCOL_VERSION: u16 = 14;
pub const ARTNET_PORT: u16 = 6454;
pub const HEADER_LEN: usize = 18;
/// Channel bytes carried by one universe.
pub const UNIVERSE_SIZE: usize = 512;
/// Universe reserved for the output configuration packet.
pub const CONFIG_UNIVERSE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtDmxPacket {
    pub sequence: u8,
    pub physical_port: u8,
    pub universe: u8,
    pub subnet: u8,
    data: Vec<u8>,
}

impl ArtDmxPacket {
    pub fn new(universe: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() > UNIVERSE_SIZE {
            return Err(LightsError::PayloadTooLarge { len: data.len() });
        }
        Ok(Self {
            sequence: 0,
            physical_port: 0,
            universe,
            subnet: 0,
            data,
        })
    }

    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Value of the length field.
    pub fn length(&self) -> u16 {
        self.data.len() as u16
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(ARTNET_ID);
        out.extend_from_slice(&OP_DMX.to_le_bytes());
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.push(self.sequence);
        out.push(self.physical_port);
        out.push(self.universe);
        out.push(self.subnet);
        out.extend_from_slice(&self.length().to_be_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out);
        out
    }

    /// Decodes a packet, checking the fixed header fields and that the
    /// declared length matches the payload exactly.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(LightsError::config(format!(
                "packet of {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if &bytes[..8] != ARTNET_ID {
            return Err(LightsError::config("missing Art-Net identifier"));
        }
        let opcode = u16::from_le_bytes([bytes[8], bytes[9]]);
        if opcode != OP_DMX {
            return Err(LightsError::config(format!("unexpected opcode {opcode:#06x}")));
        }
        let version = u16::from_be_bytes([bytes[10], bytes[11]]);
        if version != PROTOCOL_VERSION {
            return Err(LightsError::config(format!("unsupported protocol version {version}")));
        }
        let length = u16::from_be_bytes([bytes[16], bytes[17]]) as usize;
        let data = &bytes[HEADER_LEN..];
        if data.len() != length {
            return Err(LightsError::config(format!(
                "declared length {length} does not match payload of {} bytes",
                data.len()
            )));
        }

        Ok(Self {
            sequence: bytes[12],
            physical_port: bytes[13],
            universe: bytes[14],
            subnet: bytes[15],
            ..Self::new(0, data.to_vec())?
        })
    }
}

/// Splits `channels` into consecutive universes starting at
/// `start_universe`.
pub fn encode(channels: &[u8], start_universe: u8) -> Result<Vec<ArtDmxPacket>> {
    channels
        .chunks(UNIVERSE_SIZE)
        .enumerate()
        .map(|(offset, chunk)| {
            let universe = usize::from(start_universe) + offset;
            if universe >= usize::from(CONFIG_UNIVERSE) {
                return Err(LightsError::config(format!(
                    "{} channels from universe {start_universe} reach the reserved universe",
                    channels.len()
                )));
            }
            ArtDmxPacket::new(universe as u8, chunk.to_vec())
        })
        .collect()
}

/// Payload of the output configuration packet: the LED count of each of the
/// four physical outputs followed by their sum, all little-endian `u32`.
pub fn output_config_payload(leds_per_output: [u32; 4]) -> Vec<u8> {
    let checksum = leds_per_output.iter().fold(0u32, |sum, leds| sum.wrapping_add(*leds));
    leds_per_output
        .iter()
        .chain(std::iter::once(&checksum))
        .flat_map(|value| value.to_le_bytes())
        .collect()
}

pub fn encode_output_config(leds_per_output: [u32; 4]) -> ArtDmxPacket {
    ArtDmxPacket {
        sequence: 0,
        physical_port: 0,
        universe: CONFIG_UNIVERSE,
        subnet: 0,
        data: output_config_payload(leds_per_output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_single_universe_frame() {
        let packet = ArtDmxPacket::new(3, vec![1, 2, 3, 4, 5]).unwrap();
        let bytes = packet.to_bytes();

        assert_eq!(bytes.len(), 23);
        assert_eq!(&bytes[..8], b"Art-Net\0");
        assert_eq!(&bytes[8..10], &[0x00, 0x50]);
        assert_eq!(&bytes[10..12], &[0x00, 0x0E]);
        assert_eq!(bytes[12], 0);
        assert_eq!(bytes[14], 0x03);
        assert_eq!(bytes[15], 0);
        assert_eq!(&bytes[16..18], &[0x00, 0x05]);
        assert_eq!(&bytes[18..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn splits_channels_into_universes() {
        let channels = vec![7u8; 1200];
        let packets = encode(&channels, 4).unwrap();

        let universes: Vec<u8> = packets.iter().map(|packet| packet.universe).collect();
        let lengths: Vec<u16> = packets.iter().map(ArtDmxPacket::length).collect();
        assert_eq!(universes, vec![4, 5, 6]);
        assert_eq!(lengths, vec![512, 512, 176]);
        assert_eq!(&packets[2].to_bytes()[16..18], &[0x00, 0xB0]);
    }

    #[test]
    fn empty_buffer_produces_no_frames() {
        assert!(encode(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn rejects_oversized_payload() {
        let err = ArtDmxPacket::new(0, vec![0; 513]).unwrap_err();
        assert!(matches!(err, LightsError::PayloadTooLarge { len: 513 }));
    }

    #[test]
    fn refuses_to_spill_into_reserved_universe() {
        assert!(encode(&[0; 1024], 253).is_err());
        assert_eq!(encode(&[0; 1024], 252).unwrap().len(), 2);
    }

    #[test]
    fn output_config_is_little_endian_with_checksum() {
        let packet = encode_output_config([100, 200, 0, 1]);
        assert_eq!(packet.universe, 0xFF);
        assert_eq!(packet.length(), 20);
        assert_eq!(&packet.data()[..4], &[100, 0, 0, 0]);
        assert_eq!(&packet.data()[4..8], &[200, 0, 0, 0]);
        assert_eq!(&packet.data()[16..], &301u32.to_le_bytes());
    }

    #[test]
    fn parse_validates_header_and_length() {
        let bytes = ArtDmxPacket::new(9, vec![1, 2, 3]).unwrap().with_sequence(5).to_bytes();
        let packet = ArtDmxPacket::parse(&bytes).unwrap();
        assert_eq!(packet.universe, 9);
        assert_eq!(packet.sequence, 5);
        assert_eq!(packet.data(), &[1, 2, 3]);

        let mut truncated = bytes.clone();
        truncated.pop();
        assert!(ArtDmxPacket::parse(&truncated).is_err());
        assert!(ArtDmxPacket::parse(&bytes[..10]).is_err());
    }
}
