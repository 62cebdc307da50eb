use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;

use crate::contracts::{self, PacketType, PowerUdpHeader};
use crate::errors::{PowerUdpError, Result};
use crate::transport::Transport;

/// In-memory transport replaying a queue of inbound datagrams
///
/// An empty queue, or a queued `None`, behaves like a receive timeout.
pub struct ScriptedTransport {
    inbound: Mutex<VecDeque<Option<(Vec<u8>, SocketAddr)>>>,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    peer: SocketAddr,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            peer: "127.0.0.1:9877".parse().unwrap(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn push_raw(&self, bytes: Vec<u8>) {
        self.inbound.lock().push_back(Some((bytes, self.peer)));
    }

    pub fn push_timeout(&self) {
        self.inbound.lock().push_back(None);
    }

    pub fn push_ack(&self, seq_num: u32) {
        self.push_raw(PowerUdpHeader::control(seq_num, PacketType::Ack).to_bytes().to_vec());
    }

    pub fn push_nak(&self, seq_num: u32) {
        self.push_raw(PowerUdpHeader::control(seq_num, PacketType::Nak).to_bytes().to_vec());
    }

    pub fn push_data(&self, seq_num: u32, payload: &[u8]) {
        self.push_raw(contracts::encode(seq_num, PacketType::Data, 0, payload).unwrap());
    }

    /// Headers of everything sent so far
    pub fn sent_headers(&self) -> Vec<PowerUdpHeader> {
        self.sent
            .lock()
            .iter()
            .map(|(bytes, _)| contracts::decode(bytes).unwrap().0)
            .collect()
    }

    pub fn sent_data_count(&self) -> usize {
        self.sent_headers().iter().filter(|h| h.is_data()).count()
    }
}

impl Transport for ScriptedTransport {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize> {
        self.sent.lock().push((buf.to_vec(), dest));
        Ok(buf.len())
    }

    fn recv_timeout(&self, buf: &mut [u8], _timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        match self.inbound.lock().pop_front().flatten() {
            Some((bytes, from)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(Some((bytes.len(), from)))
            }
            None => Ok(None),
        }
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.recv_timeout(buf, Duration::ZERO)?
            .ok_or_else(|| PowerUdpError::IoError("script exhausted".to_string()))
    }
}
