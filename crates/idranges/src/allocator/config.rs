use crate::{DEFAULT_REQUEST_BUFFER, Error, Result};

/// IDs withdrawn from the backend per batch.
pub const DEFAULT_BATCH_SIZE: u64 = 10;

/// Retries allowed after the first attempt of a withdraw or push.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// First ID of a category created on demand.
pub const DEFAULT_START_ID: u64 = 1;

/// Tunables for an [`Allocator`](crate::Allocator).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// IDs withdrawn per batch. Must be non-zero.
    pub batch_size: u64,
    /// Retries after the first attempt, so a cycle makes at most
    /// `max_attempts + 1` attempts.
    pub max_attempts: u32,
    /// First ID of a category the allocator creates itself.
    pub start_id: u64,
    /// Capacity of the dispatcher and batch request channels. Must be
    /// non-zero.
    pub request_buffer: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            start_id: DEFAULT_START_ID,
            request_buffer: DEFAULT_REQUEST_BUFFER,
        }
    }
}

impl AllocatorConfig {
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_start_id(mut self, start_id: u64) -> Self {
        self.start_id = start_id;
        self
    }

    pub fn with_request_buffer(mut self, request_buffer: usize) -> Self {
        self.request_buffer = request_buffer;
        self
    }

    /// # Errors
    /// - [`Error::InvalidConfig`] if `batch_size` or `request_buffer` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "batch_size must be greater than 0".to_string(),
            });
        }
        if self.request_buffer == 0 {
            return Err(Error::InvalidConfig {
                reason: "request_buffer must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_attempts, 100);
        assert_eq!(config.start_id, 1);
        assert_eq!(config.request_buffer, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_sizes() {
        let config = AllocatorConfig::default().with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
        let config = AllocatorConfig::default().with_request_buffer(0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
