use callbridge::signal::{NameRegistrationState, RegistrationState};
use callbridge::SignalKind;
use thiserror::Error;

/// Failures reported synchronously by a native daemon call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    #[error("signal handlers are already registered")]
    AlreadyRegistered,

    #[error("signal handlers must be registered from inside a tokio runtime")]
    NoRuntime,

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Failures of a correlated request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("no nameserver is configured")]
    NoNameserver,

    #[error("account {account_id} failed to register: {state}")]
    Registration {
        account_id: String,
        state: RegistrationState,
    },

    #[error("registering name {username} for account {account_id} failed: {state:?}")]
    NameRegistration {
        account_id: String,
        username: String,
        state: NameRegistrationState,
    },

    #[error("name lookup for {query} failed")]
    LookupFailed { query: String },

    #[error("timed out waiting for {0}")]
    Timeout(SignalKind),

    #[error("signal hub went away while waiting for {0}")]
    Detached(SignalKind),
}
