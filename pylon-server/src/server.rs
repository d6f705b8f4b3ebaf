//! Listening sockets and the accept loop.

use std::sync::Arc;
use std::time::Duration;

use pylon_mtproto::Stores;
use pylon_mtproto::store::{RsaKeyRing, SystemClock};
use pylon_mtproto::transport::AcceptOptions;
use pylon_tl::Schema;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::connection;
use crate::context::ServerState;
use crate::errors::Result;
use crate::keys;
use crate::registry::RpcRegistry;

/// A running server: shared state plus the transport options every
/// connection is accepted with.
#[derive(Debug)]
pub struct Server {
    state: Arc<ServerState>,
    options: AcceptOptions,
    shutdown: CancellationToken,
    /// How often expired salts are swept.
    sweep_every: Duration,
}

impl Server {
    pub fn new(state: ServerState, options: AcceptOptions) -> Self {
        Self {
            state: Arc::new(state),
            options,
            shutdown: CancellationToken::new(),
            sweep_every: Duration::from_secs(3600),
        }
    }

    /// A server with in-memory stores set up from `config`.
    pub fn from_config(
        config: &ServerConfig,
        rsa_keys: RsaKeyRing,
        user_schema: Option<Arc<Schema>>,
        registry: RpcRegistry,
    ) -> Result<Self> {
        let stores = Stores::in_memory_with(
            rsa_keys,
            config.dh_prime_source(),
            Arc::new(SystemClock),
            config.salt_lifetime_secs as i32,
        );
        let state = ServerState::new(stores, user_schema, registry)?.with_window(config.msg_id_window());
        let mut server = Self::new(state, config.accept_options()?);
        server.sweep_every = Duration::from_secs(config.salt_lifetime_secs.into());
        Ok(server)
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// The RSA public keys clients should pin.
    pub fn public_keys(&self) -> Result<Vec<Vec<u8>>> {
        keys::public_keys(self.state.stores.rsa_keys.as_ref())
    }

    /// Cancelling the token stops accepting and closes every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serves a single already-established stream.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        connection::serve(Arc::clone(&self.state), stream, &self.options, self.shutdown.clone()).await
    }

    /// Accepts on every listener until shut down, then waits for open
    /// connections to finish.
    pub async fn run(&self, listeners: Vec<TcpListener>) -> Result<()> {
        let tracker = TaskTracker::new();
        for listener in listeners {
            tracing::info!("[pylon] listening on {}", listener.local_addr()?);
            tracker.spawn(accept_loop(
                listener,
                Arc::clone(&self.state),
                self.options.clone(),
                self.shutdown.clone(),
                tracker.clone(),
            ));
        }
        tracker.spawn(sweep_salts(Arc::clone(&self.state), self.sweep_every, self.shutdown.clone()));

        self.shutdown.cancelled().await;
        tracing::info!("[pylon] shutting down");
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    options: AcceptOptions,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("[pylon] accept failed: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[pylon] TCP_NODELAY on {peer}: {e}");
        }

        tracing::debug!("[pylon] connection from {peer}");
        let state = Arc::clone(&state);
        let options = options.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            match connection::serve(state, stream, &options, shutdown).await {
                Ok(()) => tracing::debug!("[pylon] {peer} disconnected"),
                Err(e) => tracing::info!("[pylon] {peer} dropped: {e}"),
            }
        });
    }
}

async fn sweep_salts(state: Arc<ServerState>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        if let Err(e) = state.stores.salts.clear(None).await {
            tracing::warn!("[pylon] salt sweep failed: {e}");
        }
    }
}
