//! Async MQTT client
//!
//! [`Client`] is a handle; the connection itself runs on a spawned task that
//! owns the session and invokes the registered [`Callbacks`].

mod event_loop;
mod options;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::callbacks::Callbacks;
use crate::error::{Error, Result};
use crate::protocol::{Publish, QoS};
use crate::session::Phase;
use crate::transport::Transport;

use event_loop::{Command, EventLoop};
pub use options::ClientOptions;

/// Requests buffered between the handle and the connection task
const COMMAND_CAPACITY: usize = 64;

struct Handle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

/// MQTT client handle
pub struct Client {
    options: ClientOptions,
    callbacks: Callbacks,
    handle: Option<Handle>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            callbacks: Callbacks::new(),
            handle: None,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Hooks used by the next connection
    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    pub fn is_connected(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.connected.load(Ordering::SeqCst))
    }

    /// Open a TCP connection and perform the CONNECT/CONNACK exchange
    pub async fn connect<A: ToSocketAddrs>(&mut self, addr: A) -> Result<()> {
        let stream = timeout(self.options.timings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        self.connect_with(stream).await
    }

    /// Perform the CONNECT/CONNACK exchange over an established transport
    pub async fn connect_with<S: Transport>(&mut self, stream: S) -> Result<()> {
        if self.is_connected() {
            return Err(Error::InvalidState {
                expected: Phase::Disconnected,
                actual: Phase::Active,
            });
        }
        if let Some(stale) = self.handle.take() {
            stale.task.abort();
        }

        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let (ready, ready_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(false));
        let event_loop = EventLoop::new(
            stream,
            self.options.clone(),
            self.callbacks.clone(),
            receiver,
            Arc::clone(&connected),
        );
        let task = tokio::spawn(event_loop.run(ready));

        match ready_rx.await {
            Ok(Ok(())) => {
                self.handle = Some(Handle {
                    commands,
                    task,
                    connected,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = task.await;
                Err(e)
            }
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Publish a message. Returns the packet identifier for QoS1/QoS2; the
    /// session retransmits until acknowledged.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retain;
        self.request(|reply| Command::Publish { publish, reply })
            .await
    }

    /// Publish `value` serialized as JSON, to `client/{client_id}` when no
    /// topic is given
    pub async fn publish_json<T>(&self, topic: Option<&str>, value: &T, qos: QoS) -> Result<Option<u16>>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value)?;
        let topic = match topic {
            Some(topic) => topic.to_string(),
            None => self.options.default_topic(),
        };
        self.publish(&topic, payload, qos, false).await
    }

    /// Subscribe to one filter; resolves with the granted QoS once SUBACK
    /// arrives, `None` if the broker refused it
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Option<QoS>> {
        let results = self
            .subscribe_many(vec![(filter.to_string(), qos)])
            .await?;
        Ok(results.into_iter().next().and_then(|(_, granted)| granted))
    }

    /// Subscribe to several filters in one SUBSCRIBE packet
    pub async fn subscribe_many(
        &self,
        filters: Vec<(String, QoS)>,
    ) -> Result<Vec<(String, Option<QoS>)>> {
        self.request(|reply| Command::Subscribe { filters, reply })
            .await
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let filters = vec![filter.to_string()];
        self.request(|reply| Command::Unsubscribe { filters, reply })
            .await
    }

    /// Flush queued work, send DISCONNECT and wait for the connection task
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        if handle
            .commands
            .send(Command::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        } else {
            debug!("connection task already stopped");
        }
        if let Err(e) = handle.task.await {
            warn!("client task failed: {}", e);
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let handle = self.handle.as_ref().ok_or(Error::InvalidState {
            expected: Phase::Active,
            actual: Phase::Disconnected,
        })?;
        let (reply, response) = oneshot::channel();
        handle
            .commands
            .send(command(reply))
            .await
            .map_err(|_| Error::ConnectionLost)?;
        response.await.map_err(|_| Error::ConnectionLost)?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.task.abort();
        }
    }
}
