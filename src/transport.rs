//! Transport module - datagram channel used by the data path
//!
//! The sender and receiver state machines only need three primitives, so
//! they are written against [`Transport`] rather than a concrete socket.
//! `std::net::UdpSocket` implements it directly; tests substitute scripted
//! channels.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::errors::Result;

/// Blocking datagram channel
pub trait Transport {
    /// Send one datagram to `dest`
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize>;

    /// Wait at most `timeout` for one datagram
    ///
    /// # Returns
    /// `Ok(None)` when the wait expires without data
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>>;

    /// Wait without bound for one datagram
    fn recv_blocking(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

impl Transport for UdpSocket {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize> {
        Ok(UdpSocket::send_to(self, buf, dest)?)
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        // A zero read timeout is rejected by the OS; treat it as already expired
        if timeout.is_zero() {
            return Ok(None);
        }

        self.set_read_timeout(Some(timeout))?;
        match self.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.set_read_timeout(None)?;
        Ok(self.recv_from(buf)?)
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize> {
        (**self).send_to(buf, dest)
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        (**self).recv_timeout(buf, timeout)
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        (**self).recv_blocking(buf)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize> {
        (**self).send_to(buf, dest)
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        (**self).recv_timeout(buf, timeout)
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        (**self).recv_blocking(buf)
    }
}

/// Bind a socket on `port` and join the multicast `group` on all interfaces
///
/// The port is shared: several listeners on one host may join the same group.
pub fn bind_multicast_listener(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&local.into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;

    debug!("joined multicast group {}:{}", group, port);
    Ok(socket.into())
}
