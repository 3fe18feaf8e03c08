use ferry_protocol::ProtocolError;

/// Failures of an archive backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage driver panicked during {op}: {message}")]
    Panicked { op: &'static str, message: String },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Join(String),
}

/// Mail server errors. Request validation failures never reach the
/// requesting peer; they are logged and counted.
#[derive(Debug, thiserror::Error)]
pub enum MailServerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("failed to decrypt p2p request")]
    Decryption,

    #[error("p2p request is not signed")]
    Unsigned,

    #[error("request PoW too low: {pow:.6} < {required:.6}")]
    LowPow { pow: f64, required: f64 },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request processing timed out")]
    Timeout,
}

impl MailServerError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        MailServerError::InvalidRequest { reason: reason.into() }
    }
}
