//! Error types for listsync.

use chrono::{DateTime, Utc};

/// Top-level error type for the sync core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Remote service error: {0}")]
    Remote(#[from] RemoteError),

    #[error("State conflict: {0}")]
    State(#[from] StateError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),
}

/// Configuration-related errors. Fatal, raised at setup or
/// mapping-evaluation time, never silently downgraded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required parameter: {key} for {owner}")]
    MissingParameter { owner: String, key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error(
        "Composite field mapping for tag {tag} must specify exactly 6 attributes, got {count}"
    )]
    BadCompositeMapping { tag: String, count: usize },

    #[error("Unknown mailer plugin: {0}")]
    UnknownPlugin(String),
}

/// Persistence-related errors from the registry stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} {id}")]
    NotFound { entity: String, id: String },

    #[error("Query failed: {0}")]
    Query(String),
}

/// Address policy errors. Recoverable, surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("{email} is a known bad email address (denylisted {since})")]
    Rejected { email: String, since: DateTime<Utc> },

    #[error("Invalid email address: {0}")]
    Invalid(String),
}

/// Errors from the mailing-list server or the marketing provider.
///
/// Batch-level failures during bulk sync are aggregated, not propagated;
/// single-record operations propagate these directly.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Provider returned an error for {operation}: {message}")]
    Api { operation: String, message: String },

    #[error("All {batches} outbound batches failed: {first_error}")]
    AllBatchesFailed { batches: usize, first_error: String },

    #[error("Mailing-list server failure: {0}")]
    ListServer(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Scheduling/sending guard violations. Always fatal to the requested
/// operation, never auto-corrected.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Newsletter {id} has already been sent")]
    AlreadySent { id: String },

    #[error("Newsletter {id} is scheduled for sending ({state}); unschedule first")]
    AlreadyScheduled { id: String, state: String },

    #[error("Newsletter {id} is not scheduled for sending")]
    NotScheduled { id: String },

    #[error("Newsletter {id} has no recorded task handle; cannot cancel sending")]
    MissingTaskHandle { id: String },

    #[error("Cannot schedule newsletter {id} to be sent in the past")]
    ReleaseInPast { id: String },

    #[error("Channel {channel} failed: {message}")]
    ChannelFailed { channel: String, message: String },
}

/// Webhook validation errors. Swallowed at the router boundary — logged
/// and answered with an opaque generic response, never propagated into
/// the engines.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Unknown or expired token")]
    BadToken,

    #[error("Token does not match list {list_id}")]
    ListMismatch { list_id: String },

    #[error("Malformed payload: {0}")]
    BadPayload(String),

    #[error("Unknown provider list: {0}")]
    UnknownList(String),
}

/// Result type alias for the sync core. Boundary traits narrow the error
/// parameter to their own domain enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;
