//! Redis transport adapter for the fabric defined in `fulcrum-core`.
//!
//! [`RedisTransport`] is the production [`fulcrum_core::Transport`]
//! implementation; `fulcrum_core::testing::InMemoryTransport` remains the
//! one used by `fulcrum-core`'s own unit tests and is re-exported here for
//! convenience so downstream crates don't need to depend on `fulcrum-core`
//! directly just to stand up a transport for local testing.

pub mod redis_transport;

pub use redis_transport::RedisTransport;
pub use fulcrum_core::testing::InMemoryTransport;
