//! Store configuration via TOML
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Limits are validated eagerly on load.

use crate::error::{Error, Result};
use crate::types::Dn;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default bound on candidate-set size before a scan turns partial
pub const DEFAULT_MAX_SCAN_SIZE: usize = 4000;

/// Default maximum encoded index key length, tag included
pub const DEFAULT_MAX_KEY_BYTES: usize = 511;

/// Default number of cursor steps before a paged scan renews its transaction
pub const DEFAULT_PAGE_RENEW_STEPS: usize = 1000;

/// Store configuration
///
/// # Example
///
/// ```toml
/// max_scan_size = 4000
/// max_key_bytes = 511
/// page_renew_steps = 1000
/// suffixes = ["dc=example,dc=com"]
/// local_origin = 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Candidate-set bound; a scan collecting more ids is marked partial
    #[serde(default = "default_max_scan_size")]
    pub max_scan_size: usize,
    /// Largest accepted index key, tag byte included
    #[serde(default = "default_max_key_bytes")]
    pub max_key_bytes: usize,
    /// Index-iteration steps after which a paged cursor reopens its read transaction
    #[serde(default = "default_page_renew_steps")]
    pub page_renew_steps: usize,
    /// DNs stored as root entries (no parent) in addition to single-RDN DNs
    #[serde(default)]
    pub suffixes: Vec<String>,
    /// Replica id stamped on attribute metadata written by this store
    #[serde(default = "default_local_origin")]
    pub local_origin: u32,
}

fn default_max_scan_size() -> usize {
    DEFAULT_MAX_SCAN_SIZE
}

fn default_max_key_bytes() -> usize {
    DEFAULT_MAX_KEY_BYTES
}

fn default_page_renew_steps() -> usize {
    DEFAULT_PAGE_RENEW_STEPS
}

fn default_local_origin() -> u32 {
    1
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_scan_size: DEFAULT_MAX_SCAN_SIZE,
            max_key_bytes: DEFAULT_MAX_KEY_BYTES,
            page_renew_steps: DEFAULT_PAGE_RENEW_STEPS,
            suffixes: Vec::new(),
            local_origin: default_local_origin(),
        }
    }
}

impl StoreConfig {
    /// Builder: set the scan bound
    pub fn with_max_scan_size(mut self, max: usize) -> Self {
        self.max_scan_size = max;
        self
    }

    /// Builder: set the renewal interval of paged cursors
    pub fn with_page_renew_steps(mut self, steps: usize) -> Self {
        self.page_renew_steps = steps;
        self
    }

    /// Builder: add a root suffix
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffixes.push(suffix.to_string());
        self
    }

    /// Check limits and parse suffixes
    ///
    /// # Errors
    /// `InvalidParameter` on a zero scan bound or renewal interval, a key
    /// limit too small to hold a tag plus one byte, or an unparsable suffix.
    pub fn validate(&self) -> Result<()> {
        if self.max_scan_size == 0 {
            return Err(Error::InvalidParameter(
                "max_scan_size must be at least 1".to_string(),
            ));
        }
        if self.max_key_bytes < 2 {
            return Err(Error::InvalidParameter(
                "max_key_bytes must be at least 2".to_string(),
            ));
        }
        if self.page_renew_steps == 0 {
            return Err(Error::InvalidParameter(
                "page_renew_steps must be at least 1".to_string(),
            ));
        }
        self.suffix_dns()?;
        Ok(())
    }

    /// Configured suffixes as parsed DNs
    pub fn suffix_dns(&self) -> Result<Vec<Dn>> {
        self.suffixes.iter().map(|s| Dn::parse(s)).collect()
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Directory store configuration
#
# Candidate-set bound. An index scan that collects more entry ids is
# marked partial and the search falls back to full evaluation.
max_scan_size = 4000

# Largest index key in bytes, including the one-byte key tag.
max_key_bytes = 511

# Paged searches reopen their read transaction after this many cursor steps.
page_renew_steps = 1000

# Entries whose DN equals one of these suffixes have no parent.
# suffixes = ["dc=example,dc=com"]

# Replica id stamped on attribute metadata.
local_origin = 1
"#
    }

    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(content)
            .map_err(|e| Error::InvalidParameter(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::StorageEngine(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::StorageEngine(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_scan_size, DEFAULT_MAX_SCAN_SIZE);
    }

    #[test]
    fn test_default_toml_parses_to_default() {
        let parsed = StoreConfig::from_toml_str(StoreConfig::default_toml()).unwrap();
        assert_eq!(parsed, StoreConfig::default());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let parsed = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(parsed, StoreConfig::default());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        assert!(StoreConfig::from_toml_str("max_scan_size = 0").is_err());
        assert!(StoreConfig::from_toml_str("max_key_bytes = 1").is_err());
        assert!(StoreConfig::from_toml_str("page_renew_steps = 0").is_err());
        assert!(StoreConfig::from_toml_str("suffixes = [\"dc=x,,dc=y\"]").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dirstore.toml");
        let config = StoreConfig::default()
            .with_max_scan_size(5)
            .with_suffix("dc=example,dc=com");
        config.write_to_file(&path).unwrap();
        let loaded = StoreConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.suffix_dns().unwrap()[0].normalized(), "dc=example,dc=com");
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(StoreConfig::from_file(&dir.path().join("absent.toml")).is_err());
    }
}
