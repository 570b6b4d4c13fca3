use thiserror::Error;

/// Every error kind surfaced by the fabric (spec.md §7).
///
/// Handler-local failures never escape as this type — they are caught,
/// logged, and dropped at the dispatch boundary (see `bus::MessageBus`).
/// Only request/response failures and setup-time failures are meant to
/// reach a caller through `Result`.
#[derive(Debug, Error)]
pub enum FulcrumError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("type `{type_name}` already registered with a different decoder")]
    TypeConflict { type_name: String },

    #[error("no handler registered for request type `{type_name}`")]
    NoHandler { type_name: String },

    #[error("request to `{target}` timed out after {elapsed_ms}ms")]
    Timeout { target: String, elapsed_ms: u64 },

    #[error("duplicate correlation id `{correlation_id}` dropped")]
    Duplicate { correlation_id: String },

    #[error("identity conflict: `{service_id}` is owned by a live instance")]
    IdentityConflict { service_id: String },

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("message bus shut down")]
    BusShutdown,

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

pub type FulcrumResult<T> = Result<T, FulcrumError>;
