//! # Control-plane server
//!
//! ```text
//!   TCP accept loop ──spawn──▶ SessionEngine (one task per client)
//!          │                          │
//!          │                          ▼
//!          │                     ServerState ── ConfigStore (one lock)
//!          │                          │      ── ClientRegistry
//!          │                          └───── Broadcaster ──▶ multicast group
//!          │
//!          └── optional data channel: blocking Sequencer loop,
//!              parameterized by ConfigStore snapshots
//! ```
//!
//! Shutdown is a watch flag every session holds a receiver for. Once set it
//! stays set, so a request made before [`Server::run`] starts still stops it.
//! On shutdown the server notifies registered clients, waits for sessions to
//! close and stops the data channel.

use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::ServerSettings;
use crate::contracts::{ProtocolConfig, SHUTDOWN_NOTICE};
use crate::errors::Result;
use crate::receiver::run_receive_loop;
use crate::registry::{ClientRegistry, Registration};
use crate::session::{stop_requested, PresharedKey, SessionEngine};
use crate::store::ConfigStore;

/// How often the data channel wakes up to check for shutdown
const DATA_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State shared by every session of one server
#[derive(Debug)]
pub struct ServerState {
    store: ConfigStore,
    registry: ClientRegistry,
    psk: PresharedKey,
    broadcaster: Broadcaster,
}

impl ServerState {
    pub fn new(
        psk: PresharedKey,
        initial: ProtocolConfig,
        max_clients: usize,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            store: ConfigStore::new(initial),
            registry: ClientRegistry::new(max_clients),
            psk,
            broadcaster,
        }
    }

    pub fn verify_key(&self, key: &[u8]) -> bool {
        self.psk.verify(key)
    }

    pub fn register_client(&self, address: IpAddr) -> Registration {
        self.registry.register(address)
    }

    /// Replace the live configuration
    pub fn apply_config(&self, update: ProtocolConfig) -> ProtocolConfig {
        self.store.apply(update)
    }

    pub fn snapshot(&self) -> ProtocolConfig {
        self.store.snapshot()
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Multicast the current configuration
    ///
    /// Failures are logged and swallowed; a lost broadcast never ends a
    /// session.
    pub async fn publish_config(&self) -> Option<ProtocolConfig> {
        match self.broadcaster.publish(&self.store).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("multicast publish to {} failed: {}", self.broadcaster.group(), e);
                None
            }
        }
    }

    /// Send the shutdown notice to every registered client
    ///
    /// # Returns
    /// Number of clients the notice was sent to
    pub async fn notify_shutdown(&self, port: u16) -> usize {
        let mut notified = 0;
        for ip in self.registry.addresses() {
            let dest = SocketAddr::new(ip, port);
            match self.broadcaster.send_to(&SHUTDOWN_NOTICE, dest).await {
                Ok(()) => notified += 1,
                Err(e) => warn!("could not notify {} of shutdown: {}", dest, e),
            }
        }
        notified
    }
}

pub use crate::receiver::DataDelivery;

/// Cloneable trigger for [`Server::run`] to stop
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    data_socket: Option<Arc<StdUdpSocket>>,
    deliveries: broadcast::Sender<DataDelivery>,
    notify_port: u16,
}

impl Server {
    /// Bind the control listener, the broadcast socket and, when configured,
    /// the data channel
    pub async fn bind(settings: &ServerSettings) -> Result<Self> {
        let listener = TcpListener::bind(settings.control.listen_addr).await?;
        let broadcaster = Broadcaster::bind(
            settings.multicast.group_addr().into(),
            settings.multicast.ttl,
        )
        .await?;

        let state = ServerState::new(
            PresharedKey::new(&settings.control.psk)?,
            settings.protocol,
            settings.control.max_clients,
            broadcaster,
        );

        let data_socket = match settings.data.listen_addr {
            Some(addr) => Some(Arc::new(StdUdpSocket::bind(addr)?)),
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (deliveries, _) = broadcast::channel(64);

        info!("control channel listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state: Arc::new(state),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            data_socket,
            deliveries,
            notify_port: settings.data.notify_port,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Payloads delivered in order on the data channel
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<DataDelivery> {
        self.deliveries.subscribe()
    }

    /// Accept clients until shutdown
    pub async fn run(self) -> Result<()> {
        let stop_data = Arc::new(AtomicBool::new(false));
        let data_task = self.data_socket.clone().map(|socket| {
            let state = Arc::clone(&self.state);
            let stop = Arc::clone(&stop_data);
            let deliveries = self.deliveries.clone();
            tokio::task::spawn_blocking(move || {
                info!("data channel listening on {:?}", socket.local_addr());
                run_receive_loop(&*socket, state.store(), &stop, DATA_POLL_INTERVAL, |delivery| {
                    info!(
                        "received seq {} from {}: {}",
                        delivery.seq_num,
                        delivery.from,
                        String::from_utf8_lossy(&delivery.payload)
                    );
                    let _ = deliveries.send(delivery);
                })
            })
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted control connection from {}", peer);
                        let engine = SessionEngine::new(
                            stream,
                            peer,
                            Arc::clone(&self.state),
                            self.shutdown_rx.clone(),
                        );
                        sessions.spawn(async move {
                            let _ = engine.run().await;
                        });
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("session task failed: {}", e);
                    }
                }
                _ = stop_requested(&mut shutdown_rx) => break,
            }
        }

        info!("shutting down, {} session(s) open", sessions.len());
        let notified = self.state.notify_shutdown(self.notify_port).await;
        info!("shutdown notice sent to {} client(s)", notified);

        while sessions.join_next().await.is_some() {}

        stop_data.store(true, Ordering::Relaxed);
        if let Some(task) = data_task {
            if let Err(e) = task.await {
                error!("data channel task failed: {}", e);
            }
        }

        info!("server stopped");
        Ok(())
    }
}
