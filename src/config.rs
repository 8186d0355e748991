use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};
use crate::part_size::{DEFAULT_PART_SIZE, MAX_PART_SIZE, MIN_PART_SIZE};

/// Configuration for the S3-backed upload store
#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    /// Bucket holding the target object, its info sidecar and the carry.
    pub bucket: String,

    /// Preferred part size in bytes. Must stay within S3's 5 MiB minimum and
    /// a 500 MiB ceiling.
    pub part_size: u64,

    /// Upper bound on part uploads in flight within one `write` call. Also
    /// bounds temp-chunk disk usage to roughly `part_size` times this value.
    pub max_concurrent_part_uploads: usize,

    /// Directory for temporary chunk files produced by the splitter.
    pub tmp_dir: PathBuf,
}

impl S3StoreConfig {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            part_size: DEFAULT_PART_SIZE,
            max_concurrent_part_uploads: 60,
            tmp_dir: std::env::temp_dir(),
        }
    }

    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    pub fn with_max_concurrent_part_uploads(mut self, limit: usize) -> Self {
        self.max_concurrent_part_uploads = limit;
        self
    }

    pub fn with_tmp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    /// Validate the configuration before a store is built from it.
    pub fn validate(&self) -> StoreResult<()> {
        if self.bucket.is_empty() {
            return Err(StoreError::invalid("bucket name is required"));
        }
        if self.part_size < MIN_PART_SIZE || self.part_size > MAX_PART_SIZE {
            return Err(StoreError::invalid(format!(
                "part_size {} is outside the supported range {}..={} bytes",
                self.part_size, MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }
        if self.max_concurrent_part_uploads == 0 {
            return Err(StoreError::invalid(
                "max_concurrent_part_uploads must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = S3StoreConfig::new("uploads");
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
        assert_eq!(config.max_concurrent_part_uploads, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn part_size_bounds_are_enforced() {
        let too_small = S3StoreConfig::new("uploads").with_part_size(MIN_PART_SIZE - 1);
        assert!(too_small.validate().is_err());

        let too_large = S3StoreConfig::new("uploads").with_part_size(MAX_PART_SIZE + 1);
        assert!(too_large.validate().is_err());

        let min = S3StoreConfig::new("uploads").with_part_size(MIN_PART_SIZE);
        assert!(min.validate().is_ok());

        let max = S3StoreConfig::new("uploads").with_part_size(MAX_PART_SIZE);
        assert!(max.validate().is_ok());
    }

    #[test]
    fn empty_bucket_is_rejected() {
        assert!(S3StoreConfig::new("").validate().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = S3StoreConfig::new("uploads").with_max_concurrent_part_uploads(0);
        assert!(config.validate().is_err());
    }
}
