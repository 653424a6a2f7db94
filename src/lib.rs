//! mqttd - MQTT 3.1.1 protocol engine
//!
//! Provides:
//! - A frame codec for every MQTT 3.1.1 control packet
//! - A sans-I/O session state machine with QoS 0/1/2 delivery and keep-alive
//! - A topic matcher for `+` and `#` filters
//! - A broker router with retained messages and per-session outbound queues
//! - An async [`Client`] and an embeddable broker [`Server`] on tokio
//!
//! ```no_run
//! use mqttd::{Client, ClientOptions, QoS};
//!
//! # async fn example() -> mqttd::Result<()> {
//! let mut client = Client::new(ClientOptions::generated("sensor"));
//! client.callbacks_mut().on_message(|_, message| {
//!     println!("{}: {}", message.topic, message.payload_str());
//! });
//! client.connect("localhost:1883").await?;
//! client.subscribe("sensors/+/temp", QoS::AtLeastOnce).await?;
//! client.publish("sensors/room1/temp", "21.5", QoS::AtLeastOnce, false).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod server;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{AuthHook, MemoryStore, PersistenceStore, RetainedMessage, Router};
pub use callbacks::{Callbacks, DisconnectReason, SessionInfo};
pub use client::{Client, ClientOptions};
pub use config::{BrokerConfig, Timings};
pub use error::{CodecError, Error, Result};
pub use message::Message;
pub use protocol::{ConnectReturnCode, Packet, QoS};
pub use server::{Server, ShutdownHandle};
pub use session::{Session, SessionEvent};
