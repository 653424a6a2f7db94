#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use mqttd::{BrokerConfig, Router, Server, ShutdownHandle};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Broker on an ephemeral localhost port
pub struct TestBroker {
    pub addr: SocketAddr,
    pub router: Router,
    shutdown: ShutdownHandle,
    task: JoinHandle<mqttd::Result<()>>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(BrokerConfig::default()).await
    }

    pub async fn start_with(config: BrokerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::with_listener(listener, config);
        let addr = server.local_addr().unwrap();
        let router = server.router();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        Self {
            addr,
            router,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.shutdown();
        timeout(WAIT, self.task)
            .await
            .expect("server stops")
            .unwrap()
            .unwrap();
    }
}

/// Next item from a callback channel, failing the test after [`WAIT`]
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

/// Assert nothing more arrives within a short grace period
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(item)) = timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected callback: {:?}", item);
    }
}
