//! Broker routing: subscriptions, fan-out, retained messages and the
//! pluggable persistence and authentication collaborators

mod auth;
mod queue;
mod router;
mod store;

pub use auth::{AllowAll, AuthDecision, AuthHook, Credentials, StaticCredentials};
pub use queue::{OutboundQueue, PushOutcome};
pub use router::{Registration, Router, SessionId};
pub use store::{MemoryStore, PersistenceStore, RetainedMessage};
