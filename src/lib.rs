//! PowerUDP - reliable delivery over UDP with a multicast control plane
//!
//! The data channel frames each message with an 8-byte header and runs a
//! stop-and-wait ARQ over it: the sender retransmits until it sees a matching
//! ACK, the receiver accepts strictly in order and NAKs everything else.
//!
//! The control plane is a TCP server. Clients register with a pre-shared key
//! and may push new protocol parameters; the server keeps one live
//! configuration and multicasts it to every participant whenever it changes.
//!
//! # Design Principles
//! - Data path is blocking and written against the [`transport::Transport`] trait
//! - Control plane runs on tokio, one task per client
//! - Shared configuration sits behind a single lock that is never held across I/O

pub mod errors;
pub mod contracts;
pub mod transport;
pub mod transmitter;
pub mod ack_manager;
pub mod receiver;
pub mod store;
pub mod registry;
pub mod broadcaster;
pub mod session;
pub mod server;
pub mod client;
pub mod config;

#[cfg(test)]
mod test_util;

pub use ack_manager::{send_reliable, DeliveryReport, ReliableSender};
pub use contracts::{PacketType, PowerUdpHeader, ProtocolConfig};
pub use errors::{DecodeError, PowerUdpError, Result};
pub use receiver::{Reception, RejectKind, Sequencer};
pub use server::{Server, ServerState, ShutdownHandle};

/// Largest datagram the data channel sends or accepts
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Maximum payload size (in bytes) - header plus payload fit one datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - contracts::HEADER_LEN;

/// Backoff multiplier for retransmission (exponential)
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Upper bound on a single attempt's wait, in milliseconds
pub const MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;
