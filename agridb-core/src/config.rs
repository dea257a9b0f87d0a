use crate::validation::ExtraAttributes;

/// Database configuration for durability and record validation
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Fsync the commit log after every committed transaction
    pub sync_on_commit: bool,

    /// Policy for undeclared attributes, applied to stores created without
    /// an explicit policy
    pub extra_attributes: ExtraAttributes,

    /// Maximum encoded record size in bytes (None = unlimited)
    pub max_record_bytes: Option<usize>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            extra_attributes: ExtraAttributes::Reject,
            max_record_bytes: None,
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable fsync on commit (faster, loses the last commits on power failure)
    pub fn without_sync(mut self) -> Self {
        self.sync_on_commit = false;
        self
    }

    /// Set the default policy for undeclared attributes
    pub fn with_extra_attributes(mut self, policy: ExtraAttributes) -> Self {
        self.extra_attributes = policy;
        self
    }

    /// Set maximum encoded record size in bytes
    pub fn with_max_record_bytes(mut self, bytes: usize) -> Self {
        self.max_record_bytes = Some(bytes);
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if let Some(size) = self.max_record_bytes {
            if size == 0 {
                return Err("max_record_bytes must be greater than 0 when set".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert!(config.sync_on_commit);
        assert_eq!(config.extra_attributes, ExtraAttributes::Reject);
        assert!(config.max_record_bytes.is_none());
    }

    #[test]
    fn test_builder_methods() {
        let config = DatabaseConfig::new()
            .without_sync()
            .with_extra_attributes(ExtraAttributes::Ignore)
            .with_max_record_bytes(4096);

        assert!(!config.sync_on_commit);
        assert_eq!(config.extra_attributes, ExtraAttributes::Ignore);
        assert_eq!(config.max_record_bytes, Some(4096));
    }

    #[test]
    fn test_validate_zero_record_size() {
        let config = DatabaseConfig::new().with_max_record_bytes(0);
        assert!(config.validate().is_err());
        assert!(DatabaseConfig::default().validate().is_ok());
    }
}
