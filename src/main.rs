//! # PowerUDP command line
//!
//! ```bash
//! powerudp serve --config powerudp.toml
//! powerudp listen --bind 0.0.0.0:9877
//! powerudp send --server 127.0.0.1:443 --psk my_secret_key --peer 127.0.0.1:9877 hello world
//! powerudp validate --config powerudp.toml
//! ```

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use powerudp::broadcaster::ConfigFollower;
use powerudp::client::ControlClient;
use powerudp::config::ServerSettings;
use powerudp::receiver::run_receive_loop;
use powerudp::store::ConfigStore;
use powerudp::{ProtocolConfig, ReliableSender, Result, Server};

/// How long `send` listens for the configuration broadcast after registering
const CONFIG_WAIT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "powerudp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane server
    Serve {
        /// Path to configuration file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Register with a server, then reliably send messages to a peer
    Send(SendArgs),

    /// Receive messages in order and follow multicast configuration
    Listen {
        /// Data-channel address to receive on
        #[arg(short, long, default_value = "0.0.0.0:9877")]
        bind: SocketAddr,

        /// Multicast group carrying configuration
        #[arg(short, long, default_value = "239.0.0.1:9876")]
        group: SocketAddrV4,
    },

    /// Validate configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Control-channel address of the server
    #[arg(short, long, default_value = "127.0.0.1:443")]
    server: SocketAddr,

    /// Pre-shared key
    #[arg(long)]
    psk: String,

    /// Peer receiving the messages
    #[arg(short, long)]
    peer: SocketAddr,

    /// Local data-channel address
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Multicast group carrying configuration
    #[arg(short, long, default_value = "239.0.0.1:9876")]
    group: SocketAddrV4,

    /// Push this configuration before sending:
    /// retransmission,backoff,sequence,timeout_ms,retries (e.g. 1,1,1,200,5)
    #[arg(long, value_parser = parse_protocol_config)]
    set_config: Option<ProtocolConfig>,

    /// Messages to send, one datagram each
    #[arg(required = true)]
    messages: Vec<String>,
}

fn parse_protocol_config(value: &str) -> std::result::Result<ProtocolConfig, String> {
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return Err("expected 5 comma-separated values".to_string());
    }

    let toggle = |s: &str| match s {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        other => Err(format!("invalid toggle '{}'", other)),
    };

    Ok(ProtocolConfig {
        enable_retransmission: toggle(fields[0])?,
        enable_backoff: toggle(fields[1])?,
        enable_sequence: toggle(fields[2])?,
        base_timeout: fields[3].parse().map_err(|e| format!("base timeout: {}", e))?,
        max_retries: fields[4].parse().map_err(|e| format!("max retries: {}", e))?,
    })
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match &cli.command {
        Commands::Serve { config: Some(path) } | Commands::Validate { config: path } => {
            match ServerSettings::load(path).await {
                Ok(settings) => Some(settings),
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        _ => None,
    };

    let level = cli
        .log_level
        .clone()
        .or_else(|| settings.as_ref().map(|s| s.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    let result = match cli.command {
        Commands::Serve { .. } => serve(settings.unwrap_or_default()).await,
        Commands::Send(args) => send(args).await,
        Commands::Listen { bind, group } => listen(bind, group).await,
        Commands::Validate { config } => {
            info!("{} is valid", config.display());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn serve(settings: ServerSettings) -> Result<()> {
    let server = Server::bind(&settings).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown.shutdown();
        }
    });

    server.run().await
}

async fn send(args: SendArgs) -> Result<()> {
    let follower = ConfigFollower::join(args.group)?;

    let mut control = ControlClient::register(args.server, &args.psk).await?;
    if let Some(update) = &args.set_config {
        control.request_config(update).await?;
    }

    let socket = UdpSocket::bind(args.bind)?;
    let SendArgs { peer, messages, .. } = args;

    let outcome = tokio::task::spawn_blocking(move || -> Result<()> {
        let store = ConfigStore::default();
        let deadline = Instant::now() + CONFIG_WAIT;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            if remaining.is_zero() || follower.follow(&store, remaining)?.is_none() {
                break;
            }
        }
        let config = store.snapshot();

        let mut sender = ReliableSender::new(socket);
        for message in &messages {
            match sender.send_next(peer, message.as_bytes(), &config) {
                Ok(report) => info!(
                    "seq {} delivered: {} retransmission(s), {} ms",
                    report.seq_num,
                    report.retransmissions(),
                    report.elapsed.as_millis()
                ),
                Err(e) => warn!("{}", e),
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| powerudp::PowerUdpError::IoError(e.to_string()))?;

    control.close().await?;
    outcome
}

async fn listen(bind: SocketAddr, group: SocketAddrV4) -> Result<()> {
    let store = Arc::new(ConfigStore::default());
    let follower = ConfigFollower::join(group)?;
    let socket = UdpSocket::bind(bind)?;
    let stop = Arc::new(AtomicBool::new(false));

    {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Err(e) = follower.follow(&store, Duration::from_millis(500)) {
                    warn!("multicast receive failed: {}", e);
                }
            }
        });
    }

    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    info!("listening for PowerUDP data on {}", socket.local_addr()?);
    tokio::task::spawn_blocking(move || {
        run_receive_loop(&socket, &store, &stop, Duration::from_millis(200), |delivery| {
            println!(
                "[{} #{}] {}",
                delivery.from,
                delivery.seq_num,
                String::from_utf8_lossy(&delivery.payload)
            );
        })
    })
    .await
    .map_err(|e| powerudp::PowerUdpError::IoError(e.to_string()))?;

    Ok(())
}
