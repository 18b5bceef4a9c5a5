use crate::codec::{JsonCodec, SharedCodec};
use crate::config::Config;
use crate::holding::{HoldingWorld, StaticHoldingWorld};
use crate::lifecycle::{BackendLifecycle, Status};
use crate::session::{self, Player, SessionContext};
use crate::translate::PacketTranslator;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Tracks logged-in players and turns the 0 <-> 1 transitions of their count
/// into idle-shutdown decisions.
pub struct Orchestrator {
    lifecycle: Arc<BackendLifecycle>,
    /// Usernames by session id
    players: DashMap<Uuid, String>,
    /// Guards count transitions so queue and unqueue never interleave
    count: Mutex<usize>,
}

impl Orchestrator {
    pub fn new(lifecycle: Arc<BackendLifecycle>) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            players: DashMap::new(),
            count: Mutex::new(0),
        })
    }

    pub fn lifecycle(&self) -> &Arc<BackendLifecycle> {
        &self.lifecycle
    }

    pub fn player_count(&self) -> usize {
        *self.count.lock()
    }

    /// Usernames of everyone currently connected
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .players
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        names.sort();
        names
    }

    pub async fn player_joined(&self, player: &Player) {
        self.players.insert(player.id, player.username.clone());
        {
            let mut count = self.count.lock();
            *count += 1;
            if *count == 1 {
                self.lifecycle.unqueue_shutdown();
            }
        }

        // Warm the backend up while the client is still loading in
        if self.lifecycle.status() == Status::Offline {
            match self.lifecycle.ensure_started().await {
                Ok(Some(outcome)) => info!(?outcome, username = %player.username, "Backend start requested"),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Failed to start backend"),
            }
        }
    }

    pub fn player_left(&self, player: &Player) {
        self.players.remove(&player.id);
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            info!("No players left, queueing idle shutdown");
            self.lifecycle.queue_shutdown();
        }
    }
}

/// Accepts client connections and runs one session task per connection
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<SessionContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<SessionContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    /// Assemble the session context for `config` around an existing lifecycle
    pub fn context(
        config: &Config,
        lifecycle: Arc<BackendLifecycle>,
    ) -> anyhow::Result<Arc<SessionContext>> {
        let holding: Arc<dyn HoldingWorld> = match &config.proxy.holding_world_dir {
            Some(dir) => Arc::new(StaticHoldingWorld::load(
                dir,
                config.proxy.max_players,
                config.proxy.view_distance,
            )?),
            None => Arc::new(StaticHoldingWorld::empty(
                config.proxy.max_players,
                config.proxy.view_distance,
            )),
        };
        let codec: SharedCodec = Arc::new(JsonCodec);

        Ok(Arc::new(SessionContext {
            proxy: config.proxy.clone(),
            backend_address: config.backend.socket_address(),
            orchestrator: Orchestrator::new(Arc::clone(&lifecycle)),
            lifecycle,
            translator: PacketTranslator::new(config.translation.clone()),
            holding,
            codec,
        }))
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.context.orchestrator
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Proxy server listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = session::handle_connection(context, stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
