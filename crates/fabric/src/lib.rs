//! Topic-scoped WebSocket connection pools.
//!
//! A pool exists per `contract/topic0` channel. Each pool runs a single
//! loop that owns registration, unregistration, and broadcast ordering;
//! clients hold a bounded send buffer and are evicted rather than allowed
//! to stall the pool.
mod fabric;
mod pool;

pub use fabric::ConnectionFabric;
pub use pool::{ConnectionPool, RegisteredClient};
