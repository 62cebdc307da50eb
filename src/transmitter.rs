//! Transmitter module - data-channel send path
//!
//! Frames payloads with the PowerUDP header and puts them on the wire.
//! Stateless: sequence numbers and retries belong to the caller.

use std::net::SocketAddr;

use tracing::trace;

use crate::contracts::{self, PacketType, PowerUdpHeader};
use crate::errors::{PowerUdpError, Result};
use crate::transport::Transport;

/// Transmitter - frames and sends PowerUDP datagrams
pub struct Transmitter;

impl Transmitter {
    /// Frame a data payload
    ///
    /// # Errors
    /// Returns `PayloadTooLarge` if the payload exceeds [`crate::MAX_PAYLOAD_SIZE`]
    pub fn serialize_data(seq_num: u32, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > crate::MAX_PAYLOAD_SIZE {
            return Err(PowerUdpError::PayloadTooLarge {
                size: payload.len(),
                max: crate::MAX_PAYLOAD_SIZE,
            });
        }

        contracts::encode(seq_num, PacketType::Data, 0, payload)
    }

    /// Send a data packet carrying `payload` as `seq_num`
    ///
    /// # Returns
    /// Number of bytes put on the wire
    pub fn send<T: Transport + ?Sized>(
        transport: &T,
        seq_num: u32,
        payload: &[u8],
        destination: SocketAddr,
    ) -> Result<usize> {
        let bytes = Self::serialize_data(seq_num, payload)?;
        Self::send_raw(transport, &bytes, destination)
    }

    /// Send an already framed datagram
    ///
    /// Used by the retransmission loop, which frames once and resends the
    /// same bytes on every attempt.
    pub fn send_raw<T: Transport + ?Sized>(
        transport: &T,
        bytes: &[u8],
        destination: SocketAddr,
    ) -> Result<usize> {
        if bytes.len() > crate::MAX_DATAGRAM_SIZE {
            return Err(PowerUdpError::PayloadTooLarge {
                size: bytes.len(),
                max: crate::MAX_DATAGRAM_SIZE,
            });
        }

        trace!("sending {} bytes to {}", bytes.len(), destination);
        transport.send_to(bytes, destination)
    }

    /// Send an ACK or NAK for `seq_num`
    pub fn send_control<T: Transport + ?Sized>(
        transport: &T,
        seq_num: u32,
        packet_type: PacketType,
        destination: SocketAddr,
    ) -> Result<usize> {
        let header = PowerUdpHeader::control(seq_num, packet_type);
        transport.send_to(&header.to_bytes(), destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::HEADER_LEN;

    #[test]
    fn test_serialization() {
        let bytes = Transmitter::serialize_data(4, b"payload").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 7);

        let (header, payload) = contracts::decode(&bytes).unwrap();
        assert!(header.is_data());
        assert_eq!(header.seq_num, 4);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; crate::MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            Transmitter::serialize_data(0, &payload),
            Err(PowerUdpError::PayloadTooLarge { .. })
        ));

        let payload = vec![0u8; crate::MAX_PAYLOAD_SIZE];
        assert!(Transmitter::serialize_data(0, &payload).is_ok());
    }
}
