use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{XferError, XferResult};

/// Top-level configuration (loaded from xfer.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XferConfig {
    pub log: LogConfig,
    pub integrity: IntegrityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Chunk MAC engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Segment unit S of the progressive chunk layout (default: 128 KiB).
    /// Must be a non-zero multiple of the 16-byte cipher block.
    pub segment_size: u64,
    /// Distance the folded prefix must stay behind contiguous progress (default: 5 MiB)
    pub fold_margin_bytes: u64,
    /// Entries kept individually before the prefix may be folded (default: 101)
    pub fold_min_entries: usize,
    /// Alignment unit for handing chunk state between striped layouts (default: 80)
    pub alignment_unit: u64,
    pub gap_search: GapSearchConfig,
}

/// Bounds of the search for MACs computed with late entries missing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapSearchConfig {
    /// Trailing ordinals in which a single gap may end (default: 96)
    pub single_window: usize,
    /// Longest single gap tried (default: 64)
    pub single_max_len: usize,
    /// Trailing ordinals in which a pair of gaps may start (default: 40)
    pub pair_window: usize,
    /// Longest gap tried for each of the pair (default: 16)
    pub pair_max_len: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            segment_size: 128 * 1024,
            fold_margin_bytes: 5 * 1024 * 1024,
            fold_min_entries: 32 * 3 + 5,
            alignment_unit: 16 * 5,
            gap_search: GapSearchConfig::default(),
        }
    }
}

impl Default for GapSearchConfig {
    fn default() -> Self {
        Self {
            single_window: 32 * 3,
            single_max_len: 64,
            pair_window: 16 * 2 + 8,
            pair_max_len: 16,
        }
    }
}

impl XferConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> XferResult<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| XferError::Config(format!("parsing {}: {e}", path.display())))?
        } else {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> XferResult<()> {
        let integrity = &self.integrity;
        if integrity.segment_size == 0 || integrity.segment_size % 16 != 0 {
            return Err(XferError::Config(format!(
                "integrity.segment_size must be a non-zero multiple of 16, got {}",
                integrity.segment_size
            )));
        }
        if integrity.alignment_unit == 0 {
            return Err(XferError::Config(
                "integrity.alignment_unit must be non-zero".into(),
            ));
        }
        match self.log.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(XferError::Config(format!(
                "log.format must be \"json\" or \"text\", got {other:?}"
            ))),
        }
    }
}
