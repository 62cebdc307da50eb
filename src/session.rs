//! Session engine - per-client control channel
//!
//! Each accepted connection gets one [`SessionEngine`], which moves through
//! `AwaitingRegistration -> Authenticated -> Closed`. Engines never talk to
//! each other; the only thing they share is the [`ServerState`].
//!
//! Every read is raced against the shutdown channel so a stopping server can
//! tear sessions down while they are blocked on their peer.

use std::net::SocketAddr;
use std::sync::Arc;

use blake2::{Blake2s256, Digest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::contracts::{
    self, ProtocolConfig, CONFIG_RECORD_LEN, REGISTRATION_RECORD_LEN, REPLY_ACK, REPLY_NAK,
};
use crate::errors::{PowerUdpError, Result};
use crate::server::ServerState;

/// Pre-shared key the server authenticates clients against
///
/// Only a digest of the secret is kept; candidates are hashed the same way
/// and the digests compared.
#[derive(Clone)]
pub struct PresharedKey {
    digest: [u8; 32],
}

impl PresharedKey {
    pub fn new(secret: &str) -> Result<Self> {
        contracts::validate_psk(secret)?;
        Ok(Self {
            digest: Self::hash(secret.as_bytes()),
        })
    }

    pub fn verify(&self, candidate: &[u8]) -> bool {
        Self::hash(candidate) == self.digest
    }

    fn hash(bytes: &[u8]) -> [u8; 32] {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Blake2s256::digest(bytes));
        digest
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRegistration,
    Authenticated,
    Closed,
}

/// How a session that ended without a protocol error finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed the connection between records
    PeerClosed,
    /// Server shutdown interrupted the session
    Shutdown,
}

pub struct SessionEngine<S> {
    stream: S,
    peer: SocketAddr,
    state: SessionState,
    server: Arc<ServerState>,
    shutdown: watch::Receiver<bool>,
}

impl<S> SessionEngine<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        server: Arc<ServerState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            peer,
            state: SessionState::AwaitingRegistration,
            server,
            shutdown,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion
    ///
    /// # Errors
    /// `AuthenticationFailed`, `MalformedConfigUpdate`,
    /// `InvalidConfigRecord` or `IoError`; each only ends this session.
    pub async fn run(mut self) -> Result<SessionEnd> {
        let result = self.drive().await;
        self.state = SessionState::Closed;
        let _ = self.stream.shutdown().await;

        match &result {
            Ok(end) => debug!("session with {} closed: {:?}", self.peer, end),
            Err(e) => warn!("session with {} closed: {}", self.peer, e),
        }
        result
    }

    async fn drive(&mut self) -> Result<SessionEnd> {
        match self.authenticate().await {
            Ok(()) => {}
            Err(PowerUdpError::ShuttingDown) => return Ok(SessionEnd::Shutdown),
            Err(e) => return Err(e),
        }

        loop {
            let mut record = [0u8; CONFIG_RECORD_LEN];
            let filled = match self.read_record(&mut record).await {
                Ok(filled) => filled,
                Err(PowerUdpError::ShuttingDown) => return Ok(SessionEnd::Shutdown),
                Err(e) => return Err(e),
            };

            if filled == 0 {
                info!("client {} closed the connection", self.peer);
                return Ok(SessionEnd::PeerClosed);
            }

            let update = ProtocolConfig::from_record(&record[..filled])?;
            self.server.apply_config(update);
            info!("new configuration received from {}", self.peer.ip());
            self.server.publish_config().await;
        }
    }

    async fn authenticate(&mut self) -> Result<()> {
        let mut record = [0u8; REGISTRATION_RECORD_LEN];
        let read = tokio::select! {
            read = self.stream.read_exact(&mut record) => read,
            _ = stop_requested(&mut self.shutdown) => return Err(PowerUdpError::ShuttingDown),
        };

        if let Err(e) = read {
            self.reply(&REPLY_NAK).await;
            return Err(PowerUdpError::AuthenticationFailed {
                reason: format!("incomplete registration record: {}", e),
            });
        }

        if !self.server.verify_key(contracts::registration_key(&record)) {
            warn!("invalid PSK from {}", self.peer);
            self.reply(&REPLY_NAK).await;
            return Err(PowerUdpError::AuthenticationFailed {
                reason: "pre-shared key mismatch".to_string(),
            });
        }

        self.stream.write_all(&REPLY_ACK).await?;
        self.state = SessionState::Authenticated;
        info!("client {} authenticated", self.peer);

        self.server.register_client(self.peer.ip());
        self.server.publish_config().await;
        Ok(())
    }

    /// Read up to one configuration record
    ///
    /// # Returns
    /// Bytes read; 0 means the peer closed before sending anything.
    ///
    /// # Errors
    /// `MalformedConfigUpdate` when the connection ends mid-record.
    async fn read_record(&mut self, record: &mut [u8; CONFIG_RECORD_LEN]) -> Result<usize> {
        let mut filled = 0;
        while filled < record.len() {
            let n = tokio::select! {
                n = self.stream.read(&mut record[filled..]) => n?,
                _ = stop_requested(&mut self.shutdown) => return Err(PowerUdpError::ShuttingDown),
            };
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled != 0 && filled != record.len() {
            return Err(PowerUdpError::MalformedConfigUpdate {
                expected: CONFIG_RECORD_LEN,
                received: filled,
            });
        }
        Ok(filled)
    }

    async fn reply(&mut self, reply: &[u8; 3]) {
        if let Err(e) = self.stream.write_all(reply).await {
            debug!("could not send reply to {}: {}", self.peer, e);
        }
    }
}

/// Resolves once shutdown has been requested, including before the call
///
/// A dropped sender counts as a request.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
