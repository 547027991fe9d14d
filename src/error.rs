//! WolfKV Error Types

use thiserror::Error;

/// Result type alias for WolfKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfKV error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // WAL errors
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL record corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: u64, reason: String },

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No leader available")]
    NoLeader,

    #[error("Quorum not reached: {reached}/{required}")]
    QuorumNotReached { reached: usize, required: usize },

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    // Election errors
    #[error("Election error: {0}")]
    Election(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::QuorumNotReached { .. }
                | Error::Network(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}
