//! Configuration for codecs, commits and merges.
//!
//! Every knob lives on a struct that is handed to the component that needs
//! it; there is no process-wide tuning state.
//!
//! # Example
//!
//! ```
//! use quiver::config::IndexConfig;
//!
//! let config = IndexConfig::from_json(r#"{"merge": {"check_abort_interval": 1000}}"#).unwrap();
//! assert_eq!(config.merge.check_abort_interval, 1000);
//! assert_eq!(config.commit.gen_lookahead_count, 10);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};

/// Top-level configuration grouping every component's settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Settings for the standard codec formats.
    pub codec: CodecConfig,

    /// Settings for the commit log.
    pub commit: CommitConfig,

    /// Settings for the merge engine.
    pub merge: MergeConfig,
}

impl IndexConfig {
    /// Parse a configuration from JSON. Missing sections use defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: IndexConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Serialize the configuration to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values that would disable a required mechanism.
    pub fn validate(&self) -> Result<()> {
        if self.codec.term_index_interval == 0 {
            return Err(QuiverError::invalid_config(
                "term_index_interval must be greater than 0",
            ));
        }
        if self.merge.check_abort_interval == 0 {
            return Err(QuiverError::invalid_config(
                "check_abort_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Configuration of the standard codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Every N-th term of a field is recorded in the term index (`.tip`).
    ///
    /// Smaller values make seeks faster at the cost of a larger in-memory
    /// index.
    pub term_index_interval: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            term_index_interval: 32,
        }
    }
}

/// Configuration of the commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// How many generations past the last known one discovery will probe
    /// before giving up.
    pub gen_lookahead_count: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        CommitConfig {
            gen_lookahead_count: 10,
        }
    }
}

/// Configuration of the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Accumulated work units (document frequencies, copied documents)
    /// between two checks of the abort signal.
    pub check_abort_interval: u64,

    /// Verify the checksums of every input file before merging.
    pub verify_checksums: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            check_abort_interval: 60_000,
            verify_checksums: true,
        }
    }
}
