use serde::{Deserialize, Serialize};

/// Hard ceiling for a single packet, whatever the configuration says.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default packet ceiling (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Configuration for framed connections.
///
/// ```rust
/// use ferry_transport::TransportConfig;
///
/// let config = TransportConfig::new().max_message_size(2 * 1024 * 1024);
/// assert_eq!(config.get_max_message_size(), 2 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum accepted frame payload in bytes.
    pub(crate) max_message_size: usize,
    /// Capacity of the in-memory pipe channels.
    pub(crate) pipe_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a config with defaults.
    ///
    /// `FERRY_MAX_MESSAGE_SIZE` overrides the packet ceiling when set to a
    /// valid number.
    pub fn new() -> Self {
        let max_message_size = std::env::var("FERRY_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);

        Self {
            max_message_size,
            pipe_buffer: 16,
        }
    }

    /// Set maximum frame size (clamped to [`MAX_MESSAGE_SIZE`]).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes.min(MAX_MESSAGE_SIZE);
        self
    }

    /// Set the in-memory pipe buffer (default: 16 packets).
    pub fn pipe_buffer(mut self, capacity: usize) -> Self {
        self.pipe_buffer = capacity.max(1);
        self
    }

    pub fn get_max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn get_pipe_buffer(&self) -> usize {
        self.pipe_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_hard_ceiling() {
        let config = TransportConfig::new().max_message_size(usize::MAX);
        assert_eq!(config.get_max_message_size(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: TransportConfig = serde_json::from_str(r#"{"pipe_buffer": 4}"#).unwrap();
        assert_eq!(config.get_pipe_buffer(), 4);
    }
}
