//! MQTT broker server
//!
//! Accepts TCP connections and runs each on its own task against a shared
//! [`Router`].

mod connection;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::{AllowAll, AuthHook, MemoryStore, PersistenceStore, Router};
use crate::callbacks::Callbacks;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::transport::Transport;

use connection::Connection;

/// Stops a running [`Server`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting, close every connection and let [`Server::run`] return
    ///
    /// Stored even while nothing is subscribed yet, so a shutdown requested
    /// before `run` starts still stops it.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Server {
    config: BrokerConfig,
    listener: TcpListener,
    router: Router,
    auth: Arc<dyn AuthHook>,
    callbacks: Callbacks,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Bind the listener described by `config`
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        Ok(Self::with_listener(listener, config))
    }

    pub fn with_listener(listener: TcpListener, config: BrokerConfig) -> Self {
        let router = Router::new(
            config.max_qos,
            config.queue_capacity,
            Arc::new(MemoryStore::with_offline_limit(config.queue_capacity)),
        );
        let (shutdown, _) = watch::channel(false);
        let mut callbacks = Callbacks::new();
        callbacks.set_budget(config.timings.callback_budget);
        Self {
            config,
            listener,
            router,
            auth: Arc::new(AllowAll),
            callbacks,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Replace the persistence store. Call before [`Server::run`]; state held
    /// by the previous store is not carried over.
    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.router = Router::new(self.config.max_qos, self.config.queue_capacity, store);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthHook>) -> Self {
        self.auth = auth;
        self
    }

    /// Hooks invoked for every client session
    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Handle to the routing table, e.g. to publish from the host program
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Serve one connection on an already established transport
    pub fn spawn_connection<S: Transport>(&self, stream: S, peer: String) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.connection(stream, peer).run())
    }

    fn connection<S: Transport>(&self, stream: S, peer: String) -> Connection<S> {
        Connection::new(
            stream,
            peer,
            self.config.clone(),
            self.router.clone(),
            Arc::clone(&self.auth),
            self.callbacks.clone(),
            self.shutdown.subscribe(),
        )
    }

    /// Accept connections until shut down, then wait for every connection
    /// task to finish
    pub async fn run(self) -> Result<()> {
        info!("listening on {}", self.local_addr()?);
        let mut stop = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {}: {}", peer, e);
                        }
                        tasks.spawn(self.connection(stream, peer.to_string()).run());
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        sleep(self.config.timings.io_retry_backoff).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task failed: {}", e);
                    }
                }
                _ = stop.changed() => {}
            }
        }

        info!("shutting down, closing {} connection(s)", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("connection task failed: {}", e);
            }
        }
        Ok(())
    }
}
