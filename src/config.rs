//! Server settings
//!
//! Loaded from TOML. Every field has a default, so an empty file yields a
//! server on the standard ports with the initial protocol configuration.
//!
//! ```toml
//! [control]
//! listen_addr = "0.0.0.0:443"
//! psk = "my_secret_key"
//! max_clients = 3
//!
//! [multicast]
//! group = "239.0.0.1"
//! port = 9876
//! ttl = 1
//!
//! [data]
//! listen_addr = "0.0.0.0:9877"
//! notify_port = 9877
//!
//! [protocol]
//! enable_retransmission = true
//! enable_backoff = true
//! enable_sequence = true
//! base_timeout = 200
//! max_retries = 5
//!
//! [logging]
//! level = "info"
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::contracts::{self, ProtocolConfig};
use crate::errors::{PowerUdpError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub control: ControlSettings,

    #[serde(default)]
    pub multicast: MulticastSettings,

    #[serde(default)]
    pub data: DataSettings,

    /// Configuration the store starts with
    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl ServerSettings {
    /// Loads settings from a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigLoad` if the file cannot be read or parsed, or
    /// `ConfigInvalid` if a value is out of range.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PowerUdpError::config_load(&path_str, e.to_string()))?;

        let settings: Self = toml::from_str(&content)
            .map_err(|e| PowerUdpError::config_load(&path_str, e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a string (useful for testing).
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| PowerUdpError::config_load("<string>", e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.control.validate()?;
        self.multicast.validate()?;

        if self.protocol.base_timeout == 0 {
            return Err(PowerUdpError::config_invalid(
                "protocol.base_timeout",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// TCP address the control channel listens on
    #[serde(default = "default_control_addr")]
    pub listen_addr: SocketAddr,

    /// Pre-shared key clients must present
    #[serde(default = "default_psk")]
    pub psk: String,

    /// Registry capacity
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

fn default_control_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 443))
}

fn default_psk() -> String {
    "my_secret_key".to_string()
}

fn default_max_clients() -> usize {
    3
}

impl ControlSettings {
    fn validate(&self) -> Result<()> {
        if self.listen_addr.port() == 0 {
            return Err(PowerUdpError::config_invalid("control.listen_addr", "port cannot be 0"));
        }

        contracts::validate_psk(&self.psk)
            .map_err(|_| PowerUdpError::config_invalid(
                "control.psk",
                format!("must be 1 to {} bytes without NUL", contracts::MAX_PSK_LEN),
            ))?;

        if self.max_clients == 0 {
            return Err(PowerUdpError::config_invalid(
                "control.max_clients",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_control_addr(),
            psk: default_psk(),
            max_clients: default_max_clients(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastSettings {
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,

    #[serde(default = "default_multicast_port")]
    pub port: u16,

    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 0, 0, 1)
}

fn default_multicast_port() -> u16 {
    9876
}

fn default_ttl() -> u32 {
    1
}

impl MulticastSettings {
    pub fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.port)
    }

    fn validate(&self) -> Result<()> {
        if !self.group.is_multicast() {
            return Err(PowerUdpError::config_invalid(
                "multicast.group",
                format!("{} is not a multicast address", self.group),
            ));
        }
        if self.port == 0 {
            return Err(PowerUdpError::config_invalid("multicast.port", "cannot be 0"));
        }
        Ok(())
    }
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_multicast_port(),
            ttl: default_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Where the server's own data-channel receiver binds; none by default
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Port registered clients receive the shutdown notice on
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,
}

fn default_notify_port() -> u16 {
    9877
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            listen_addr: None,
            notify_port: default_notify_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
