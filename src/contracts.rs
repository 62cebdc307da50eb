//! Wire records for the PowerUDP data and control channels
//!
//! Every layout here is fixed-size and big-endian where a field spans more
//! than one byte. Nothing in this module performs I/O.
//!
//! # Data channel
//! ```text
//!  0       4     5       6          8
//!  +-------+-----+-------+----------+----------------+
//!  | seq   | ack | flags | length   | payload ...    |
//!  | u32be | u8  | u8    | u16be    | length bytes   |
//!  +-------+-----+-------+----------+----------------+
//! ```
//!
//! # Control channel and multicast
//! The configuration record is six bytes:
//! `retransmission:u8, backoff:u8, sequence:u8, base_timeout:u16be, max_retries:u8`.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DecodeError, PowerUdpError, Result};

/// Size of the PowerUDP header on the wire
pub const HEADER_LEN: usize = 8;

/// Size of the registration record carrying the pre-shared key
pub const REGISTRATION_RECORD_LEN: usize = 64;

/// Longest usable key; the last byte of the record is always a terminator
pub const MAX_PSK_LEN: usize = REGISTRATION_RECORD_LEN - 1;

/// Size of the configuration record
pub const CONFIG_RECORD_LEN: usize = 6;

/// Registration accepted
pub const REPLY_ACK: [u8; 3] = *b"ACK";

/// Registration refused
pub const REPLY_NAK: [u8; 3] = *b"NAK";

/// Datagram sent to registered clients when the server stops
pub const SHUTDOWN_NOTICE: [u8; 3] = *b"BYE";

const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 5;
const OFF_LENGTH: usize = 6;

/// Meaning of the header's `ack` byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    Nak = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Ack),
            2 => Ok(Self::Nak),
            other => Err(DecodeError::UnknownPacketType(other)),
        }
    }
}

/// PowerUdpHeader - fixed 8-byte prefix of every data-channel datagram
///
/// Fields are held in host byte order; [`encode`] and [`decode`] do the
/// conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerUdpHeader {
    /// Per-sender counter identifying the payload
    pub seq_num: u32,

    /// Data, ACK or NAK
    pub packet_type: PacketType,

    /// Reserved control bits, carried through untouched
    pub flags: u8,

    /// Payload length in bytes (0 for ACK/NAK)
    pub length: u16,
}

impl PowerUdpHeader {
    /// Header for an ACK or NAK, which never carries payload
    pub fn control(seq_num: u32, packet_type: PacketType) -> Self {
        Self {
            seq_num,
            packet_type,
            flags: 0,
            length: 0,
        }
    }

    pub fn is_data(&self) -> bool {
        self.packet_type == PacketType::Data
    }

    /// Serialize just the header
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq_num.to_be_bytes());
        buf[OFF_ACK] = self.packet_type as u8;
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_LENGTH..OFF_LENGTH + 2].copy_from_slice(&self.length.to_be_bytes());
        buf
    }
}

/// Encode header and payload into one datagram
///
/// `length` is taken from the payload. Fails with
/// [`PowerUdpError::PayloadTooLarge`] if the payload does not fit the 16-bit
/// length field.
pub fn encode(seq_num: u32, packet_type: PacketType, flags: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len()).map_err(|_| PowerUdpError::PayloadTooLarge {
        size: payload.len(),
        max: u16::MAX as usize,
    })?;

    let header = PowerUdpHeader {
        seq_num,
        packet_type,
        flags,
        length,
    };

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a datagram into its header and payload
///
/// The payload slice is bounded by the header's `length`; trailing bytes are
/// ignored.
pub fn decode(buf: &[u8]) -> std::result::Result<(PowerUdpHeader, &[u8]), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::TruncatedHeader {
            required: HEADER_LEN,
            available: buf.len(),
        });
    }

    let seq_num = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let packet_type = PacketType::try_from(buf[OFF_ACK])?;
    let flags = buf[OFF_FLAGS];
    let length = u16::from_be_bytes([buf[OFF_LENGTH], buf[OFF_LENGTH + 1]]);

    let available = buf.len() - HEADER_LEN;
    if available < length as usize {
        return Err(DecodeError::TruncatedPayload {
            declared: length as usize,
            available,
        });
    }

    let header = PowerUdpHeader {
        seq_num,
        packet_type,
        flags,
        length,
    };
    Ok((header, &buf[HEADER_LEN..HEADER_LEN + length as usize]))
}

/// ProtocolConfig - live parameters shared by every sender and receiver
///
/// Also the `[protocol]` section of the server settings file, which seeds
/// the store at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Await ACKs and retransmit; off means fire-and-forget
    pub enable_retransmission: bool,

    /// Double the wait on every attempt
    pub enable_backoff: bool,

    /// Enforce in-order delivery on receivers
    pub enable_sequence: bool,

    /// Wait for the first attempt, in milliseconds
    pub base_timeout: u16,

    /// Transmission attempts before giving up
    pub max_retries: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enable_retransmission: true,
            enable_backoff: true,
            enable_sequence: true,
            base_timeout: 200,
            max_retries: 5,
        }
    }
}

impl ProtocolConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout as u64)
    }

    /// Serialize to the 6-byte control/multicast record
    pub fn to_record(&self) -> [u8; CONFIG_RECORD_LEN] {
        let timeout = self.base_timeout.to_be_bytes();
        [
            self.enable_retransmission as u8,
            self.enable_backoff as u8,
            self.enable_sequence as u8,
            timeout[0],
            timeout[1],
            self.max_retries,
        ]
    }

    /// Parse a configuration record
    ///
    /// # Errors
    /// - `MalformedConfigUpdate` if `buf` is not exactly one record long
    /// - `InvalidConfigRecord` if a toggle byte is neither 0 nor 1
    pub fn from_record(buf: &[u8]) -> Result<Self> {
        if buf.len() != CONFIG_RECORD_LEN {
            return Err(PowerUdpError::MalformedConfigUpdate {
                expected: CONFIG_RECORD_LEN,
                received: buf.len(),
            });
        }

        Ok(Self {
            enable_retransmission: toggle(buf[0], "enable_retransmission")?,
            enable_backoff: toggle(buf[1], "enable_backoff")?,
            enable_sequence: toggle(buf[2], "enable_sequence")?,
            base_timeout: u16::from_be_bytes([buf[3], buf[4]]),
            max_retries: buf[5],
        })
    }
}

fn toggle(byte: u8, field: &str) -> Result<bool> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(PowerUdpError::InvalidConfigRecord {
            reason: format!("{} must be 0 or 1, got {}", field, other),
        }),
    }
}

/// Build the NUL-padded registration record for `psk`
///
/// # Errors
/// Returns `ConfigInvalid` if the key is empty, longer than [`MAX_PSK_LEN`]
/// or contains a NUL byte.
pub fn registration_record(psk: &str) -> Result<[u8; REGISTRATION_RECORD_LEN]> {
    validate_psk(psk)?;

    let mut record = [0u8; REGISTRATION_RECORD_LEN];
    record[..psk.len()].copy_from_slice(psk.as_bytes());
    Ok(record)
}

/// Extract the key carried by a registration record
///
/// The key ends at the first NUL; the final byte is never part of it.
pub fn registration_key(record: &[u8; REGISTRATION_RECORD_LEN]) -> &[u8] {
    let body = &record[..MAX_PSK_LEN];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    &body[..end]
}

pub(crate) fn validate_psk(psk: &str) -> Result<()> {
    if psk.is_empty() {
        return Err(PowerUdpError::config_invalid("psk", "cannot be empty"));
    }
    if psk.len() > MAX_PSK_LEN {
        return Err(PowerUdpError::config_invalid(
            "psk",
            format!("cannot exceed {} bytes", MAX_PSK_LEN),
        ));
    }
    if psk.as_bytes().contains(&0) {
        return Err(PowerUdpError::config_invalid("psk", "cannot contain NUL bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let bytes = encode(0xDEAD_BEEF, PacketType::Data, 0xA5, b"hello").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 5);

        let (header, payload) = decode(&bytes).unwrap();
        assert_eq!(header.seq_num, 0xDEAD_BEEF);
        assert_eq!(header.packet_type, PacketType::Data);
        assert_eq!(header.flags, 0xA5);
        assert_eq!(header.length, 5);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_network_byte_order() {
        let bytes = encode(1, PacketType::Nak, 0, &[0u8; 258]).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(bytes[4], 2);
        assert_eq!(&bytes[6..8], &[0x01, 0x02]);
    }

    #[test]
    fn test_truncated_header() {
        for len in 0..HEADER_LEN {
            let buf = vec![0u8; len];
            assert_eq!(
                decode(&buf),
                Err(DecodeError::TruncatedHeader { required: HEADER_LEN, available: len })
            );
        }
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = encode(3, PacketType::Data, 0, b"abcdef").unwrap();
        bytes.truncate(HEADER_LEN + 4);
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::TruncatedPayload { declared: 6, available: 4 })
        );
    }

    #[test]
    fn test_payload_bounded_by_length() {
        let mut bytes = encode(9, PacketType::Data, 0, b"abc").unwrap();
        bytes.extend_from_slice(b"garbage");
        let (_, payload) = decode(&bytes).unwrap();
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut bytes = PowerUdpHeader::control(1, PacketType::Ack).to_bytes();
        bytes[OFF_ACK] = 7;
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownPacketType(7)));
    }

    #[test]
    fn test_config_record_layout() {
        let config = ProtocolConfig::default();
        assert_eq!(config.to_record(), [1, 1, 1, 0x00, 0xC8, 5]);

        let custom = ProtocolConfig {
            enable_retransmission: false,
            enable_backoff: true,
            enable_sequence: false,
            base_timeout: 1500,
            max_retries: 9,
        };
        assert_eq!(ProtocolConfig::from_record(&custom.to_record()).unwrap(), custom);
    }

    #[test]
    fn test_config_record_validation() {
        assert!(matches!(
            ProtocolConfig::from_record(&[1, 1, 1, 0]),
            Err(PowerUdpError::MalformedConfigUpdate { expected: 6, received: 4 })
        ));
        assert!(matches!(
            ProtocolConfig::from_record(&[1, 2, 1, 0, 200, 5]),
            Err(PowerUdpError::InvalidConfigRecord { .. })
        ));
    }

    #[test]
    fn test_registration_record() {
        let record = registration_record("my_secret_key").unwrap();
        assert_eq!(registration_key(&record), b"my_secret_key");
        assert!(record[13..].iter().all(|&b| b == 0));

        assert!(registration_record("").is_err());
        assert!(registration_record(&"k".repeat(MAX_PSK_LEN + 1)).is_err());
        assert!(registration_record(&"k".repeat(MAX_PSK_LEN)).is_ok());
    }

    #[test]
    fn test_registration_key_ignores_last_byte() {
        let record = [b'x'; REGISTRATION_RECORD_LEN];
        assert_eq!(registration_key(&record).len(), MAX_PSK_LEN);
    }
}
