//! Configuration validation.

use super::Config;
use crate::error::{IngestError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Store validation
    if config.store.host.is_empty() {
        return Err(IngestError::Config("store.host is required".into()));
    }
    if config.store.port == 0 {
        return Err(IngestError::Config("store.port must be non-zero".into()));
    }
    if config.store.database.is_empty() {
        return Err(IngestError::Config("store.database is required".into()));
    }
    if config.store.username.is_empty() {
        return Err(IngestError::Config("store.username is required".into()));
    }

    // File validation
    if let Some(file) = &config.file {
        if file.path.as_os_str().is_empty() {
            return Err(IngestError::Config("file.path is required".into()));
        }
        let delimiter = file.delimiter.as_str();
        if delimiter != "\\t" && delimiter != "tab" && delimiter.len() != 1 {
            return Err(IngestError::Config(format!(
                "file.delimiter must be a single ASCII character, got '{}'",
                delimiter
            )));
        }
    }

    // Ingest validation
    if config.ingest.min_batch_size == 0 {
        return Err(IngestError::Config(
            "ingest.min_batch_size must be at least 1".into(),
        ));
    }
    if config.ingest.progress_updates == 0 {
        return Err(IngestError::Config(
            "ingest.progress_updates must be at least 1".into(),
        ));
    }
    if let Some(max) = config.ingest.max_batch_size {
        if max < config.ingest.min_batch_size {
            return Err(IngestError::Config(format!(
                "ingest.max_batch_size ({}) must not be below ingest.min_batch_size ({})",
                max, config.ingest.min_batch_size
            )));
        }
    }
    if config.ingest.stream_buffer == 0 {
        return Err(IngestError::Config(
            "ingest.stream_buffer must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, IngestConfig, StoreConfig};

    fn valid_config() -> Config {
        Config {
            store: StoreConfig {
                host: "localhost".to_string(),
                port: 8443,
                database: "default".to_string(),
                username: "default".to_string(),
                token: "token".to_string(),
                snapshot: None,
            },
            file: Some(FileConfig::new("export.csv")),
            ingest: IngestConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_store_host() {
        let mut config = valid_config();
        config.store.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_multi_char_delimiter_rejected() {
        let mut config = valid_config();
        if let Some(file) = config.file.as_mut() {
            file.delimiter = ";;".to_string();
        }
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_tab_delimiter_accepted() {
        let mut config = valid_config();
        if let Some(file) = config.file.as_mut() {
            file.delimiter = "\\t".to_string();
        }
        assert!(validate(&config).is_ok());
        assert_eq!(config.file.as_ref().map(|f| f.delimiter_byte()), Some(b'\t'));
    }

    #[test]
    fn test_max_batch_below_min_rejected() {
        let mut config = valid_config();
        config.ingest.max_batch_size = Some(10);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_progress_updates_rejected() {
        let mut config = valid_config();
        config.ingest.progress_updates = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_store_config_debug_redacts_token() {
        let mut config = valid_config();
        config.store.token = "super_secret_token_123".to_string();
        let debug_output = format!("{:?}", config.store);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_token_123"),
            "Debug output should not contain actual token value"
        );
    }
}
