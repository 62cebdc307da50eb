//! Multicast distribution of the live configuration
//!
//! [`Broadcaster`] is the server side: snapshot the store, drop the lock,
//! then send the 6-byte record to the group. [`ConfigFollower`] is the peer
//! side: receive records from the group and apply them to a local store.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::contracts::{ProtocolConfig, CONFIG_RECORD_LEN};
use crate::errors::Result;
use crate::store::ConfigStore;
use crate::transport::{self, Transport};

/// Publishes configuration snapshots to a multicast group
#[derive(Debug)]
pub struct Broadcaster {
    socket: UdpSocket,
    group: SocketAddr,
}

impl Broadcaster {
    /// Open the sending socket
    ///
    /// `ttl` only applies when `group` is an IPv4 multicast address; any
    /// other destination is sent to as plain unicast, which tests rely on.
    pub async fn bind(group: SocketAddr, ttl: u32) -> Result<Self> {
        let local: SocketAddr = match group.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;

        if let IpAddr::V4(ip) = group.ip() {
            if ip.is_multicast() {
                socket.set_multicast_ttl_v4(ttl)?;
                socket.set_multicast_loop_v4(true)?;
            }
        }

        debug!("broadcaster ready for {}", group);
        Ok(Self { socket, group })
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// Publish the current contents of `store`
    ///
    /// # Returns
    /// The snapshot that was sent
    pub async fn publish(&self, store: &ConfigStore) -> Result<ProtocolConfig> {
        let snapshot = store.snapshot();
        self.publish_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    pub async fn publish_snapshot(&self, snapshot: &ProtocolConfig) -> Result<()> {
        self.socket.send_to(&snapshot.to_record(), self.group).await?;
        info!(
            "configuration sent to {}: retransmission={} backoff={} sequence={} timeout={}ms retries={}",
            self.group,
            snapshot.enable_retransmission,
            snapshot.enable_backoff,
            snapshot.enable_sequence,
            snapshot.base_timeout,
            snapshot.max_retries
        );
        Ok(())
    }

    /// Send an arbitrary datagram from the broadcast socket
    pub(crate) async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<()> {
        self.socket.send_to(bytes, dest).await?;
        Ok(())
    }
}

/// Receives configuration records and applies them locally
pub struct ConfigFollower {
    socket: StdUdpSocket,
}

impl ConfigFollower {
    /// Join `group` and start listening on its port
    pub fn join(group: SocketAddrV4) -> Result<Self> {
        let socket = transport::bind_multicast_listener(*group.ip(), group.port())?;
        Ok(Self { socket })
    }

    /// Follow records arriving on an already bound socket
    pub fn from_socket(socket: StdUdpSocket) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait up to `timeout` for one valid configuration record
    ///
    /// Datagrams that are not valid records are logged and skipped; the call
    /// then returns `Ok(None)` like a timeout does.
    pub fn recv_update(&self, timeout: Duration) -> Result<Option<ProtocolConfig>> {
        let mut buf = [0u8; 64];
        let (len, from) = match self.socket.recv_timeout(&mut buf, timeout)? {
            Some(received) => received,
            None => return Ok(None),
        };

        match ProtocolConfig::from_record(&buf[..len]) {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                warn!("ignoring {}-byte datagram from {} (want {}): {}", len, from, CONFIG_RECORD_LEN, e);
                Ok(None)
            }
        }
    }

    /// Receive one record and apply it to `store`
    pub fn follow(&self, store: &ConfigStore, timeout: Duration) -> Result<Option<ProtocolConfig>> {
        let update = self.recv_update(timeout)?;
        if let Some(config) = update {
            store.apply(config);
            info!("applied multicast configuration {:?}", config);
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_sends_current_snapshot() {
        let listener = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let follower = ConfigFollower::from_socket(listener);
        let group = follower.local_addr().unwrap();

        let broadcaster = Broadcaster::bind(group, 1).await.unwrap();
        let store = ConfigStore::default();
        let update = ProtocolConfig {
            base_timeout: 750,
            max_retries: 8,
            ..ProtocolConfig::default()
        };
        store.apply(update);

        let sent = broadcaster.publish(&store).await.unwrap();
        assert_eq!(sent, update);

        let local = ConfigStore::default();
        let received = follower.follow(&local, Duration::from_secs(2)).unwrap();
        assert_eq!(received, Some(update));
        assert_eq!(local.snapshot(), update);
    }

    #[test]
    fn test_follower_skips_garbage() {
        let listener = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let follower = ConfigFollower::from_socket(listener);

        let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"not a record", follower.local_addr().unwrap()).unwrap();

        assert_eq!(follower.recv_update(Duration::from_secs(2)).unwrap(), None);
    }

    #[test]
    fn test_two_followers_join_same_group() {
        let group = SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 78), 49878);

        let first = ConfigFollower::join(group).unwrap();
        let second = ConfigFollower::join(group).unwrap();

        assert_eq!(first.local_addr().unwrap().port(), group.port());
        assert_eq!(second.local_addr().unwrap().port(), group.port());
    }
}
