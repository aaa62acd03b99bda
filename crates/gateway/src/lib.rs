//! Horizontally scalable WebSocket fan-out gateway.
//!
//! Each gateway instance:
//! - Accepts WebSocket connections and tracks them in a local registry
//! - Records which instance owns each user in a cluster-wide presence
//!   directory (Redis, TTL'd, timestamp-CAS on registration)
//! - Routes point-to-point messages to the owning instance through a
//!   shared broker (Redis pub/sub or Kafka)
//!
//! ## Architecture
//!
//! ```text
//! client ──ws──▶ handler ──▶ presence.lookup(to)
//!                   │              │
//!                   ▼              ▼
//!               registry     router.route_to(gateway)
//!                   ▲              │
//!                   │           broker
//!                deliver ◀── remote consumer
//! ```
//!
//! No instance holds authoritative state about its peers: the presence
//! directory is the only shared mutable state, and its entries expire on
//! their own if an instance crashes.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;

pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionRegistry};
pub use error::{GatewayError, Result};
pub use protocol::{ClientFrame, ServerFrame};
pub use server::{create_router, AppState};
