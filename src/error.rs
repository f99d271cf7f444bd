//! Error types for the bounce relay.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by the mailbox connector.
///
/// Anything raised while connecting, logging in, opening a folder or
/// searching aborts the run. A `Fetch` error only skips one message.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Authentication failed for {user}")]
    Auth { user: String },

    #[error("None of the folders {candidates:?} could be opened")]
    NoFolder { candidates: Vec<String> },

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Fetch of message {uid} failed: {reason}")]
    Fetch { uid: String, reason: String },

    #[error("Unexpected server response: {0}")]
    Protocol(String),

    #[error("Mailbox session is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while composing or sending a message.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP send failed: {0}")]
    Send(String),
}

/// State document persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
