//! Control-channel client
//!
//! Registers with a PowerUDP server using the pre-shared key and pushes
//! configuration updates over the same connection.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::contracts::{registration_record, ProtocolConfig, REPLY_ACK, REPLY_NAK};
use crate::errors::{PowerUdpError, Result};

pub struct ControlClient {
    stream: TcpStream,
    server: SocketAddr,
}

impl ControlClient {
    /// Connect and register with `psk`
    ///
    /// # Errors
    /// - `RegistrationRejected` if the server answers NAK
    /// - `UnexpectedReply` for any other 3-byte answer
    /// - `IoError` if the connection fails or closes before a reply
    pub async fn register(server: SocketAddr, psk: &str) -> Result<Self> {
        let record = registration_record(psk)?;
        let mut stream = TcpStream::connect(server).await?;
        stream.write_all(&record).await?;

        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).await?;

        match reply {
            REPLY_ACK => {
                info!("registered with {}", server);
                Ok(Self { stream, server })
            }
            REPLY_NAK => Err(PowerUdpError::RegistrationRejected),
            other => Err(PowerUdpError::UnexpectedReply(other)),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Ask the server to replace its live configuration
    ///
    /// The server does not answer on this connection; the new values come
    /// back over multicast.
    pub async fn request_config(&mut self, config: &ProtocolConfig) -> Result<()> {
        self.stream.write_all(&config.to_record()).await?;
        debug!("configuration update sent to {}: {:?}", self.server, config);
        Ok(())
    }

    /// Close the control connection
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        debug!("control connection to {} closed", self.server);
        Ok(())
    }
}
