use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::ack_manager::AckManager;
use crate::contracts::{self, PacketType, ProtocolConfig, SHUTDOWN_NOTICE};
use crate::errors::{DecodeError, Result};
use crate::store::ConfigStore;
use crate::transport::Transport;

/// Most peers a [`PeerSequencers`] table tracks at once
pub const MAX_TRACKED_PEERS: usize = 1024;

/// Peers silent this long are the first to lose their sequencer
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Why an inbound datagram was not delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectKind {
    /// Sequence number differs from the expected one (duplicate or ahead)
    OutOfOrder { expected: u32, received: u32 },

    /// Datagram could not be decoded; dropped without reply
    Malformed(DecodeError),

    /// ACK or NAK arriving on the receive path; dropped without reply
    NotData { packet_type: PacketType, seq_num: u32 },
}

/// Result of processing one inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reception {
    Delivered {
        seq_num: u32,
        payload: Vec<u8>,
        from: SocketAddr,
    },
    Rejected {
        kind: RejectKind,
        from: SocketAddr,
    },
}

impl Reception {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Sequencer - in-order receiver for one peer relationship
///
/// Holds the next expected sequence number. There is no reordering buffer:
/// anything but the expected packet is NAKed and dropped, and the sender is
/// expected to resend it.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    expected_seq: u32,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(expected_seq: u32) -> Self {
        Self { expected_seq }
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Block for one datagram and process it
    pub fn receive<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        config: &ProtocolConfig,
        buffer: &mut [u8],
    ) -> Result<Reception> {
        let (len, from) = transport.recv_blocking(buffer)?;
        self.process(transport, config, &buffer[..len], from)
    }

    /// Wait at most `timeout` for one datagram and process it
    ///
    /// # Returns
    /// `Ok(None)` if nothing arrived in time
    pub fn receive_timeout<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        config: &ProtocolConfig,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<Reception>> {
        match transport.recv_timeout(buffer, timeout)? {
            Some((len, from)) => self.process(transport, config, &buffer[..len], from).map(Some),
            None => Ok(None),
        }
    }

    /// Classify `datagram` from `from`, replying with ACK or NAK
    pub fn process<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        config: &ProtocolConfig,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<Reception> {
        let (header, payload) = match contracts::decode(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", from, e);
                return Ok(Reception::Rejected {
                    kind: RejectKind::Malformed(e),
                    from,
                });
            }
        };

        if !header.is_data() {
            trace!("dropping {:?} seq {} from {} on receive path", header.packet_type, header.seq_num, from);
            return Ok(Reception::Rejected {
                kind: RejectKind::NotData {
                    packet_type: header.packet_type,
                    seq_num: header.seq_num,
                },
                from,
            });
        }

        if config.enable_sequence && header.seq_num != self.expected_seq {
            debug!(
                "out of order from {}: expected {}, received {}",
                from, self.expected_seq, header.seq_num
            );
            AckManager::send_nack(transport, header.seq_num, from)?;
            return Ok(Reception::Rejected {
                kind: RejectKind::OutOfOrder {
                    expected: self.expected_seq,
                    received: header.seq_num,
                },
                from,
            });
        }

        AckManager::send_ack(transport, header.seq_num, from)?;
        if config.enable_sequence {
            self.expected_seq = self.expected_seq.wrapping_add(1);
        }

        trace!("delivered seq {} ({} bytes) from {}", header.seq_num, payload.len(), from);
        Ok(Reception::Delivered {
            seq_num: header.seq_num,
            payload: payload.to_vec(),
            from,
        })
    }
}

struct TrackedPeer {
    sequencer: Sequencer,
    last_seen: Instant,
}

/// One [`Sequencer`] per sending peer, bounded in size
///
/// A new peer arriving at a full table first evicts peers idle longer than
/// the idle timeout, then, if still full, the least recently seen peer. An
/// evicted peer starts again at seq 0.
pub struct PeerSequencers {
    peers: HashMap<SocketAddr, TrackedPeer>,
    capacity: usize,
    idle_timeout: Duration,
}

impl PeerSequencers {
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.peers.contains_key(peer)
    }

    /// Run `datagram` through the sequencer kept for `from`
    pub fn process<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        config: &ProtocolConfig,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<Reception> {
        self.process_at(transport, config, datagram, from, Instant::now())
    }

    fn process_at<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        config: &ProtocolConfig,
        datagram: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Reception> {
        if !self.peers.contains_key(&from) {
            self.make_room(now);
        }

        let peer = self.peers.entry(from).or_insert_with(|| TrackedPeer {
            sequencer: Sequencer::new(),
            last_seen: now,
        });
        peer.last_seen = now;
        peer.sequencer.process(transport, config, datagram, from)
    }

    fn make_room(&mut self, now: Instant) {
        if self.peers.len() < self.capacity {
            return;
        }

        let idle_timeout = self.idle_timeout;
        self.peers
            .retain(|_, peer| now.saturating_duration_since(peer.last_seen) < idle_timeout);

        if self.peers.len() >= self.capacity {
            let oldest = self
                .peers
                .iter()
                .min_by_key(|(_, peer)| peer.last_seen)
                .map(|(addr, _)| *addr);
            if let Some(addr) = oldest {
                debug!("dropping sequencer state for {}", addr);
                self.peers.remove(&addr);
            }
        }
    }
}

impl Default for PeerSequencers {
    fn default() -> Self {
        Self::new(MAX_TRACKED_PEERS, PEER_IDLE_TIMEOUT)
    }
}

/// Payload accepted in order on a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDelivery {
    pub from: SocketAddr,
    pub seq_num: u32,
    pub payload: Vec<u8>,
}

/// Receive on `transport` until `stop` is set
///
/// Each datagram is judged against the configuration in `store` at the time
/// it arrives. `poll` bounds how long a stop request goes unnoticed.
pub fn run_receive_loop<T, F>(
    transport: &T,
    store: &ConfigStore,
    stop: &AtomicBool,
    poll: Duration,
    mut on_delivery: F,
) where
    T: Transport + ?Sized,
    F: FnMut(DataDelivery),
{
    let mut peers = PeerSequencers::default();
    let mut buffer = vec![0u8; crate::MAX_DATAGRAM_SIZE];

    while !stop.load(Ordering::Relaxed) {
        let (len, from) = match transport.recv_timeout(&mut buffer, poll) {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(e) => {
                warn!("data channel receive failed: {}", e);
                continue;
            }
        };

        if buffer[..len] == SHUTDOWN_NOTICE {
            info!("server at {} is shutting down", from);
            continue;
        }

        let config = store.snapshot();
        match peers.process(transport, &config, &buffer[..len], from) {
            Ok(Reception::Delivered { seq_num, payload, from }) => on_delivery(DataDelivery { from, seq_num, payload }),
            Ok(Reception::Rejected { kind: RejectKind::OutOfOrder { expected, received }, from }) => {
                info!("out of order from {}: expected {}, received {}", from, expected, received);
            }
            Ok(Reception::Rejected { .. }) => {}
            Err(e) => warn!("could not answer {}: {}", from, e),
        }
    }

    debug!("data channel stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ScriptedTransport;

    fn receive(sequencer: &mut Sequencer, transport: &ScriptedTransport, config: &ProtocolConfig) -> Reception {
        let mut buffer = vec![0u8; crate::MAX_DATAGRAM_SIZE];
        sequencer.receive(transport, config, &mut buffer).unwrap()
    }

    #[test]
    fn test_in_order_delivery() {
        let transport = ScriptedTransport::new();
        transport.push_data(0, b"first");
        transport.push_data(1, b"second");

        let mut sequencer = Sequencer::new();
        let config = ProtocolConfig::default();

        match receive(&mut sequencer, &transport, &config) {
            Reception::Delivered { seq_num, payload, .. } => {
                assert_eq!(seq_num, 0);
                assert_eq!(payload, b"first");
            }
            other => panic!("expected delivery, got {:?}", other),
        }
        assert!(receive(&mut sequencer, &transport, &config).is_delivered());
        assert_eq!(sequencer.expected_seq(), 2);

        let replies = transport.sent_headers();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|h| h.packet_type == PacketType::Ack && h.length == 0));
        assert_eq!(replies[1].seq_num, 1);
    }

    #[test]
    fn test_duplicate_is_nacked() {
        let transport = ScriptedTransport::new();
        transport.push_data(0, b"once");
        transport.push_data(0, b"once");

        let mut sequencer = Sequencer::new();
        let config = ProtocolConfig::default();

        assert!(receive(&mut sequencer, &transport, &config).is_delivered());
        let second = receive(&mut sequencer, &transport, &config);
        assert_eq!(
            second,
            Reception::Rejected {
                kind: RejectKind::OutOfOrder { expected: 1, received: 0 },
                from: transport.peer(),
            }
        );
        assert_eq!(sequencer.expected_seq(), 1);

        let nak = transport.sent_headers()[1];
        assert_eq!(nak.packet_type, PacketType::Nak);
        assert_eq!(nak.seq_num, 0);
    }

    #[test]
    fn test_ahead_of_expectation_nacks_received_seq() {
        let transport = ScriptedTransport::new();
        transport.push_data(5, b"early");

        let mut sequencer = Sequencer::starting_at(3);
        let reception = receive(&mut sequencer, &transport, &ProtocolConfig::default());

        assert!(!reception.is_delivered());
        assert_eq!(sequencer.expected_seq(), 3);
        assert_eq!(transport.sent_headers()[0].seq_num, 5);
    }

    #[test]
    fn test_sequencing_disabled_accepts_anything() {
        let transport = ScriptedTransport::new();
        transport.push_data(9, b"a");
        transport.push_data(2, b"b");

        let mut sequencer = Sequencer::new();
        let config = ProtocolConfig {
            enable_sequence: false,
            ..ProtocolConfig::default()
        };

        assert!(receive(&mut sequencer, &transport, &config).is_delivered());
        assert!(receive(&mut sequencer, &transport, &config).is_delivered());
        assert_eq!(sequencer.expected_seq(), 0);
    }

    #[test]
    fn test_malformed_and_control_packets_dropped_silently() {
        let transport = ScriptedTransport::new();
        transport.push_raw(vec![0, 0, 0]);
        transport.push_ack(0);

        let mut sequencer = Sequencer::new();
        let config = ProtocolConfig::default();

        assert!(matches!(
            receive(&mut sequencer, &transport, &config),
            Reception::Rejected { kind: RejectKind::Malformed(DecodeError::TruncatedHeader { .. }), .. }
        ));
        assert!(matches!(
            receive(&mut sequencer, &transport, &config),
            Reception::Rejected { kind: RejectKind::NotData { .. }, .. }
        ));
        assert!(transport.sent_headers().is_empty());
        assert_eq!(sequencer.expected_seq(), 0);
    }

    fn data(seq_num: u32, payload: &[u8]) -> Vec<u8> {
        contracts::encode(seq_num, PacketType::Data, 0, payload).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_peer_sequencers_track_each_peer() {
        let transport = ScriptedTransport::new();
        let config = ProtocolConfig::default();
        let mut peers = PeerSequencers::default();

        assert!(peers.process(&transport, &config, &data(0, b"a0"), addr(1)).unwrap().is_delivered());
        assert!(peers.process(&transport, &config, &data(0, b"b0"), addr(2)).unwrap().is_delivered());
        assert!(peers.process(&transport, &config, &data(1, b"a1"), addr(1)).unwrap().is_delivered());
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn test_full_table_evicts_least_recent_peer() {
        let transport = ScriptedTransport::new();
        let config = ProtocolConfig::default();
        let mut peers = PeerSequencers::new(2, Duration::from_secs(600));
        let t0 = Instant::now();

        peers.process_at(&transport, &config, &data(0, b"a"), addr(1), t0).unwrap();
        peers.process_at(&transport, &config, &data(0, b"b"), addr(2), t0 + Duration::from_secs(1)).unwrap();
        peers.process_at(&transport, &config, &data(0, b"c"), addr(3), t0 + Duration::from_secs(2)).unwrap();

        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&addr(1)));
        assert!(peers.contains(&addr(2)));
        assert!(peers.contains(&addr(3)));

        // The evicted peer starts over, so its next seq is out of order
        let reception = peers
            .process_at(&transport, &config, &data(1, b"a"), addr(1), t0 + Duration::from_secs(3))
            .unwrap();
        assert!(matches!(
            reception,
            Reception::Rejected { kind: RejectKind::OutOfOrder { expected: 0, received: 1 }, .. }
        ));
    }

    #[test]
    fn test_idle_peers_evicted_together() {
        let transport = ScriptedTransport::new();
        let config = ProtocolConfig::default();
        let mut peers = PeerSequencers::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        peers.process_at(&transport, &config, &data(0, b"a"), addr(1), t0).unwrap();
        peers.process_at(&transport, &config, &data(0, b"b"), addr(2), t0 + Duration::from_secs(1)).unwrap();
        peers.process_at(&transport, &config, &data(0, b"c"), addr(3), t0 + Duration::from_secs(100)).unwrap();
        peers.process_at(&transport, &config, &data(0, b"d"), addr(4), t0 + Duration::from_secs(120)).unwrap();

        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&addr(3)));
        assert!(peers.contains(&addr(4)));
    }

    #[test]
    fn test_receive_loop_delivers_and_stops() {
        let transport = ScriptedTransport::new();
        transport.push_data(0, b"first");
        transport.push_raw(SHUTDOWN_NOTICE.to_vec());
        transport.push_data(0, b"first again");
        transport.push_data(1, b"second");

        let store = ConfigStore::default();
        let stop = AtomicBool::new(false);
        let mut delivered = Vec::new();

        run_receive_loop(&transport, &store, &stop, Duration::from_millis(10), |delivery| {
            delivered.push(delivery);
            if delivered.len() == 2 {
                stop.store(true, Ordering::Relaxed);
            }
        });

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].payload, b"first");
        assert_eq!(delivered[1].seq_num, 1);
        assert_eq!(delivered[1].from, transport.peer());

        let replies: Vec<_> = transport
            .sent_headers()
            .iter()
            .map(|h| (h.packet_type, h.seq_num))
            .collect();
        assert_eq!(replies, vec![(PacketType::Ack, 0), (PacketType::Nak, 0), (PacketType::Ack, 1)]);
    }
}
