//! Cluster-wide presence directory backed by Redis.
//!
//! Maps each user to the gateway instance that currently owns their
//! connection. Records carry a timestamp and auto-expire, so a crashed
//! gateway's entries disappear within the TTL without any coordination.
//! Registration uses a server-side compare-and-set on the stored timestamp
//! to survive fast disconnect/reconnect races between instances.

pub mod error;
pub mod store;

pub use error::{PresenceError, Result};
pub use store::{PresenceRecord, PresenceStore, PRESENCE_KEY_PREFIX};
