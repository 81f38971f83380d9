//! Log configuration.

/// Configuration for a segmented log.
///
/// The store and index limits are seal thresholds: a segment whose store has
/// reached `max_store_bytes`, or whose index cannot take another entry
/// within `max_index_bytes`, stops accepting writes and the log rolls a new
/// segment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Seal threshold for a segment's store file, in bytes.
    pub max_store_bytes: u64,
    /// Seal threshold and preallocation size for a segment's index file.
    pub max_index_bytes: u64,
    /// Offset assigned to the first record of a fresh log.
    pub initial_offset: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}

impl LogConfig {
    /// Creates a config with the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the store seal threshold.
    pub fn with_max_store_bytes(mut self, bytes: u64) -> Self {
        self.max_store_bytes = bytes;
        self
    }

    /// Sets the index seal threshold.
    pub fn with_max_index_bytes(mut self, bytes: u64) -> Self {
        self.max_index_bytes = bytes;
        self
    }

    /// Sets the offset the first record receives.
    pub fn with_initial_offset(mut self, offset: u64) -> Self {
        self.initial_offset = offset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.max_store_bytes, 1024);
        assert_eq!(config.max_index_bytes, 1024);
        assert_eq!(config.initial_offset, 0);
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_max_store_bytes(4096)
            .with_max_index_bytes(2048)
            .with_initial_offset(100);

        assert_eq!(config.max_store_bytes, 4096);
        assert_eq!(config.max_index_bytes, 2048);
        assert_eq!(config.initial_offset, 100);
    }
}
