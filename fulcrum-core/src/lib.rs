//! Core, transport-agnostic fabric for a distributed game server backplane:
//! envelopes and type registry, the transport adapter contract, service
//! identity, deduplication, the message bus, the service lifecycle manager,
//! the server registry, and player routing.
//!
//! Concrete transports (Redis, in-process for tests) and the process
//! entrypoints that wire a `Runtime` together live in sibling crates.

pub mod bus;
pub mod config;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod testing;
pub mod transport;

pub use bus::MessageBus;
pub use config::FulcrumConfig;
pub use envelope::Envelope;
pub use error::{FulcrumError, FulcrumResult};
pub use identity::{ServiceIdentity, ServiceMetadata, ServiceStatus, ServiceType};
pub use lifecycle::{LifecycleCallbacks, LifecycleManager};
pub use registry::{RegisterOutcome, Registration, ServerRecord, ServerRegistry};
pub use router::PlayerRouter;
pub use runtime::Runtime;
pub use transport::Transport;
