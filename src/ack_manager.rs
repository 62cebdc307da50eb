//! ACK Manager module - reliable sender
//!
//! Stop-and-wait ARQ over the PowerUDP data channel: one message is sent,
//! then the sender waits for an ACK carrying the same sequence number. A NAK
//! cuts the wait short and triggers an immediate resend. Waits grow
//! exponentially when backoff is enabled.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::contracts::{self, PacketType, ProtocolConfig};
use crate::errors::{PowerUdpError, Result};
use crate::transmitter::Transmitter;
use crate::transport::Transport;

/// Outcome of waiting for a reply to one transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// ACK matching the outstanding sequence number
    Acked,
    /// NAK for any sequence number
    Nacked,
    /// Wait bound reached without a decisive reply
    TimedOut,
}

/// ACK Manager - acknowledgment and retransmission logic
///
/// Stateless; per-send state lives in [`RetransmissionState`].
pub struct AckManager;

impl AckManager {
    /// Send an ACK for `seq_num` (receiver -> sender)
    pub fn send_ack<T: Transport + ?Sized>(
        transport: &T,
        seq_num: u32,
        destination: SocketAddr,
    ) -> Result<usize> {
        Transmitter::send_control(transport, seq_num, PacketType::Ack, destination)
    }

    /// Send a NAK for `seq_num` (receiver -> sender)
    ///
    /// Carries the sequence number that was received, not the one expected.
    pub fn send_nack<T: Transport + ?Sized>(
        transport: &T,
        seq_num: u32,
        destination: SocketAddr,
    ) -> Result<usize> {
        Transmitter::send_control(transport, seq_num, PacketType::Nak, destination)
    }

    /// Calculate exponential backoff delay
    ///
    /// Formula: delay = min(base_ms * (2 ^ attempt), max_delay_ms)
    pub fn calculate_backoff_ms(attempt: u32, base_ms: u64, max_delay_ms: u64) -> u64 {
        let multiplier = crate::BACKOFF_MULTIPLIER;
        let backoff = base_ms.saturating_mul(multiplier.saturating_pow(attempt));
        backoff.min(max_delay_ms)
    }

    /// Wait bound for attempt `attempt` (0-based) under `config`
    pub fn attempt_timeout(attempt: u32, config: &ProtocolConfig) -> Duration {
        let base_ms = config.base_timeout as u64;
        let timeout_ms = if config.enable_backoff {
            Self::calculate_backoff_ms(attempt, base_ms, crate::MAX_BACKOFF_MS)
        } else {
            base_ms
        };
        Duration::from_millis(timeout_ms)
    }

    /// Wait for a reply to `seq_num` until `timeout` elapses
    ///
    /// Replies that decide nothing (ACKs for other sequence numbers, stray
    /// data, undecodable datagrams) are skipped and the wait continues with
    /// whatever time is left.
    pub fn wait_for_reply<T: Transport + ?Sized>(
        transport: &T,
        seq_num: u32,
        timeout: Duration,
        buffer: &mut [u8],
    ) -> Result<ReplyOutcome> {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return Ok(ReplyOutcome::TimedOut);
            }

            let (len, from) = match transport.recv_timeout(buffer, remaining)? {
                Some(received) => received,
                None => return Ok(ReplyOutcome::TimedOut),
            };

            let header = match contracts::decode(&buffer[..len]) {
                Ok((header, _)) => header,
                Err(e) => {
                    debug!("discarding undecodable reply from {}: {}", from, e);
                    continue;
                }
            };

            match header.packet_type {
                PacketType::Ack if header.seq_num == seq_num => return Ok(ReplyOutcome::Acked),
                PacketType::Nak => {
                    debug!("NAK for seq {} from {} while sending seq {}", header.seq_num, from, seq_num);
                    return Ok(ReplyOutcome::Nacked);
                }
                other => {
                    trace!("ignoring {:?} seq {} from {} while awaiting ACK {}", other, header.seq_num, from, seq_num);
                }
            }
        }
    }
}

/// Retransmission state tracker
///
/// Maintains state for a single payload's retransmission attempts.
#[derive(Debug, Clone)]
pub struct RetransmissionState {
    /// Sequence number of the outstanding message
    pub seq_num: u32,

    /// Transmissions made so far
    pub attempt: u32,

    /// Attempts allowed before giving up
    pub max_attempts: u32,

    /// Matching ACK received
    pub acknowledged: bool,

    /// Time of the first transmission
    pub started: Instant,
}

impl RetransmissionState {
    /// Create a new retransmission state
    ///
    /// `max_retries` bounds the total number of transmissions; zero allows
    /// none.
    pub fn new(seq_num: u32, max_retries: u8) -> Self {
        Self {
            seq_num,
            attempt: 0,
            max_attempts: max_retries as u32,
            acknowledged: false,
            started: Instant::now(),
        }
    }

    /// Record one transmission, returning its 0-based index
    pub fn record_attempt(&mut self) -> u32 {
        let index = self.attempt;
        self.attempt += 1;
        index
    }

    /// Check if max retries exceeded
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Summarize the send for the caller
    pub fn report(&self) -> DeliveryReport {
        DeliveryReport {
            seq_num: self.seq_num,
            attempts: self.attempt,
            acknowledged: self.acknowledged,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Statistics for one completed reliable send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub seq_num: u32,

    /// Transmissions made, including the first
    pub attempts: u32,

    /// False in fire-and-forget mode, where no ACK is awaited
    pub acknowledged: bool,

    /// Time from first transmission to completion
    pub elapsed: Duration,
}

impl DeliveryReport {
    pub fn retransmissions(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Send `payload` as `seq_num` and wait until it is acknowledged
///
/// # Arguments
/// * `transport` - channel used for both the data packet and the replies
/// * `destination` - receiving peer
/// * `payload` - message body, at most [`crate::MAX_PAYLOAD_SIZE`] bytes
/// * `seq_num` - sequence number the receiver is expected to ACK
/// * `config` - snapshot of the live protocol configuration
///
/// # Returns
/// A [`DeliveryReport`] once an ACK arrives, or immediately after the first
/// transmission when retransmission is disabled.
///
/// # Errors
/// - `MaxRetriesExceeded` when every attempt ended in a timeout or NAK
/// - `PayloadTooLarge` or `IoError` from the transmit path
pub fn send_reliable<T: Transport + ?Sized>(
    transport: &T,
    destination: SocketAddr,
    payload: &[u8],
    seq_num: u32,
    config: &ProtocolConfig,
) -> Result<DeliveryReport> {
    let bytes = Transmitter::serialize_data(seq_num, payload)?;
    let mut state = RetransmissionState::new(seq_num, config.max_retries);
    let mut reply_buffer = vec![0u8; crate::MAX_DATAGRAM_SIZE];

    if !config.enable_retransmission {
        Transmitter::send_raw(transport, &bytes, destination)?;
        state.record_attempt();
        trace!("seq {} sent without acknowledgment", seq_num);
        return Ok(state.report());
    }

    while !state.is_exhausted() {
        let attempt = state.record_attempt();
        Transmitter::send_raw(transport, &bytes, destination)?;

        let timeout = AckManager::attempt_timeout(attempt, config);
        match AckManager::wait_for_reply(transport, seq_num, timeout, &mut reply_buffer)? {
            ReplyOutcome::Acked => {
                state.acknowledged = true;
                debug!("ACK for seq {} after {} attempt(s)", seq_num, state.attempt);
                return Ok(state.report());
            }
            ReplyOutcome::Nacked => {
                debug!("seq {} NAKed on attempt {}, resending", seq_num, attempt + 1);
            }
            ReplyOutcome::TimedOut => {
                debug!("seq {} timed out after {:?} on attempt {}", seq_num, timeout, attempt + 1);
            }
        }
    }

    warn!("could not confirm delivery of seq {} after {} attempts", seq_num, state.attempt);
    Err(PowerUdpError::MaxRetriesExceeded {
        seq_num,
        attempts: state.attempt,
    })
}

/// Sender bound to one transport that numbers its own messages
///
/// Sequence numbers start at 0 and advance after every send, whether or not
/// it was acknowledged, so a receiver that already accepted a message whose
/// ACK was lost is not fed a duplicate.
pub struct ReliableSender<T> {
    transport: T,
    next_seq: u32,
    last_report: Option<DeliveryReport>,
}

impl<T: Transport> ReliableSender<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_seq: 0,
            last_report: None,
        }
    }

    /// Reliably send the next message in this sender's sequence
    pub fn send_next(
        &mut self,
        destination: SocketAddr,
        payload: &[u8],
        config: &ProtocolConfig,
    ) -> Result<DeliveryReport> {
        let seq_num = self.next_seq;
        let started = Instant::now();
        let result = send_reliable(&self.transport, destination, payload, seq_num, config);

        match &result {
            Ok(report) => {
                self.next_seq = self.next_seq.wrapping_add(1);
                self.last_report = Some(*report);
            }
            Err(PowerUdpError::MaxRetriesExceeded { attempts, .. }) => {
                self.next_seq = self.next_seq.wrapping_add(1);
                self.last_report = Some(DeliveryReport {
                    seq_num,
                    attempts: *attempts,
                    acknowledged: false,
                    elapsed: started.elapsed(),
                });
            }
            Err(_) => {}
        }

        result
    }

    /// Statistics of the most recent send that reached the wire
    pub fn last_report(&self) -> Option<DeliveryReport> {
        self.last_report
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
