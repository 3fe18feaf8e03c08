/// Errors returned by the ferry wire layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("connection closed")]
    Closed,

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// True when the remote side (or we) shut the connection down cleanly.
    pub fn is_closed(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_message_too_large() {
        let err = TransportError::MessageTooLarge { size: 11, max: 10 };
        assert_eq!(err.to_string(), "message too large: 11 bytes (max 10)");
    }

    #[test]
    fn eof_counts_as_closed() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(TransportError::from(eof).is_closed());
        assert!(TransportError::Closed.is_closed());
        assert!(!TransportError::MalformedFrame("x".into()).is_closed());
    }
}
