//! ChunkLog Configuration
//!
//! TOML configuration for the chunked transaction log and the runtime
//! options derived from it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::CheckpointMode;
use crate::chunk::ChunkOptions;
use crate::scavenge::ScavengeOptions;

/// Smallest data region a chunk may be configured with
pub const MIN_CHUNK_SIZE: i32 = 1024;

/// Main ChunkLog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLogConfig {
    /// Database storage configuration
    pub db: DbSection,

    /// Scavenging configuration
    #[serde(default)]
    pub scavenge: ScavengeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSection {
    /// Directory holding chunk and checkpoint files
    pub path: PathBuf,

    /// Size of the data region of a chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i32,

    /// Number of most recent completed chunks kept in memory
    #[serde(default = "default_cached_chunks")]
    pub cached_chunks: usize,

    /// File readers opened per chunk up front
    #[serde(default = "default_initial_reader_count")]
    pub initial_reader_count: usize,

    /// Upper bound on file readers per chunk
    #[serde(default = "default_max_reader_count")]
    pub max_reader_count: usize,

    /// Depth of the midpoint index kept for scavenged chunks (2^depth samples)
    #[serde(default = "default_midpoints_depth")]
    pub midpoints_depth: u32,

    /// Verify chunk checksums when the database is opened
    #[serde(default = "default_true")]
    pub verify_hash: bool,

    /// Checkpoint durability mode
    #[serde(default)]
    pub checkpoint_mode: CheckpointMode,

    /// How long a chunk swap waits for a replaced file to be released
    #[serde(default = "default_file_deletion_wait_ms")]
    pub file_deletion_wait_ms: u64,
}

/// Scavenging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScavengeConfig {
    /// Swap in scavenged chunks even when they are not smaller
    #[serde(default)]
    pub always_keep_scavenged: bool,

    /// Merge adjacent small chunks after scavenging
    #[serde(default = "default_true")]
    pub merge_chunks: bool,

    /// Physical data budget of a merged chunk (defaults to the chunk size)
    #[serde(default)]
    pub max_chunk_data_size: Option<i64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_chunk_size() -> i32 {
    256 * 1024 * 1024
}

fn default_cached_chunks() -> usize {
    2
}

fn default_initial_reader_count() -> usize {
    5
}

fn default_max_reader_count() -> usize {
    25
}

fn default_midpoints_depth() -> u32 {
    14
}

fn default_file_deletion_wait_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        Self {
            always_keep_scavenged: false,
            merge_chunks: true,
            max_chunk_data_size: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ChunkLogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ChunkLogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.db_config().validate()?;

        if let Some(max) = self.scavenge.max_chunk_data_size {
            if max <= 0 || max > i32::MAX as i64 {
                return Err(crate::Error::Config(format!(
                    "scavenge.max_chunk_data_size must be between 1 and {}",
                    i32::MAX
                )));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Runtime options for opening the database
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            path: self.db.path.clone(),
            chunk_size: self.db.chunk_size,
            cached_chunks: self.db.cached_chunks,
            initial_reader_count: self.db.initial_reader_count,
            max_reader_count: self.db.max_reader_count,
            midpoints_depth: self.db.midpoints_depth,
            verify_hash: self.db.verify_hash,
            checkpoint_mode: self.db.checkpoint_mode,
            file_deletion_wait: Duration::from_millis(self.db.file_deletion_wait_ms),
        }
    }

    /// Runtime options for the scavenger
    pub fn scavenge_options(&self) -> ScavengeOptions {
        ScavengeOptions {
            always_keep_scavenged: self.scavenge.always_keep_scavenged,
            merge_chunks: self.scavenge.merge_chunks,
            max_chunk_data_size: self
                .scavenge
                .max_chunk_data_size
                .unwrap_or(self.db.chunk_size as i64),
        }
    }
}

/// Options the storage engine is opened with
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding chunk and checkpoint files
    pub path: PathBuf,
    /// Size of the data region of a chunk in bytes
    pub chunk_size: i32,
    /// Number of most recent completed chunks kept in memory
    pub cached_chunks: usize,
    pub initial_reader_count: usize,
    pub max_reader_count: usize,
    pub midpoints_depth: u32,
    pub verify_hash: bool,
    pub checkpoint_mode: CheckpointMode,
    /// How long a chunk swap waits for a replaced file to be released
    pub file_deletion_wait: Duration,
}

impl DbConfig {
    /// Options with defaults for everything but the location and chunk size
    pub fn new(path: impl Into<PathBuf>, chunk_size: i32) -> Self {
        Self {
            path: path.into(),
            chunk_size,
            cached_chunks: default_cached_chunks(),
            initial_reader_count: default_initial_reader_count(),
            max_reader_count: default_max_reader_count(),
            midpoints_depth: default_midpoints_depth(),
            verify_hash: true,
            checkpoint_mode: CheckpointMode::default(),
            file_deletion_wait: Duration::from_millis(default_file_deletion_wait_ms()),
        }
    }

    /// Validate the options
    pub fn validate(&self) -> crate::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("db.path cannot be empty".into()));
        }

        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(crate::Error::Config(format!(
                "db.chunk_size must be at least {} bytes",
                MIN_CHUNK_SIZE
            )));
        }

        if self.max_reader_count == 0 || self.initial_reader_count > self.max_reader_count {
            return Err(crate::Error::Config(
                "db.max_reader_count must be positive and not below db.initial_reader_count"
                    .into(),
            ));
        }

        if !(1..=24).contains(&self.midpoints_depth) {
            return Err(crate::Error::Config(
                "db.midpoints_depth must be between 1 and 24".into(),
            ));
        }

        Ok(())
    }

    /// Options handed to every chunk opened by the database
    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions {
            initial_reader_count: self.initial_reader_count,
            max_reader_count: self.max_reader_count,
            midpoints_depth: self.midpoints_depth,
        }
    }

    /// Directory for checkpoint files
    pub fn checkpoint_dir(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[db]
path = "/var/lib/chunklog"
chunk_size = 1048576
cached_chunks = 4
checkpoint_mode = "durable"

[scavenge]
merge_chunks = false

[logging]
level = "debug"
"#;

        let config = ChunkLogConfig::from_str(toml).unwrap();
        assert_eq!(config.db.chunk_size, 1048576);
        assert_eq!(config.db.cached_chunks, 4);
        assert_eq!(config.db.checkpoint_mode, CheckpointMode::Durable);
        assert_eq!(config.db.max_reader_count, 25);
        assert!(config.db.verify_hash);
        assert!(!config.scavenge.merge_chunks);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");

        let options = config.scavenge_options();
        assert_eq!(options.max_chunk_data_size, 1048576);
    }

    #[test]
    fn test_defaults_apply() {
        let config = ChunkLogConfig::from_str("[db]\npath = \"data\"\n").unwrap();
        assert_eq!(config.db.chunk_size, 256 * 1024 * 1024);
        assert_eq!(config.db.checkpoint_mode, CheckpointMode::Batched);
        assert!(config.scavenge.merge_chunks);
        assert_eq!(config.db_config().file_deletion_wait, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let small = "[db]\npath = \"data\"\nchunk_size = 10\n";
        assert!(matches!(
            ChunkLogConfig::from_str(small),
            Err(crate::Error::Config(_))
        ));

        let readers = "[db]\npath = \"data\"\ninitial_reader_count = 30\nmax_reader_count = 2\n";
        assert!(ChunkLogConfig::from_str(readers).is_err());

        let depth = "[db]\npath = \"data\"\nmidpoints_depth = 0\n";
        assert!(ChunkLogConfig::from_str(depth).is_err());

        let format = "[db]\npath = \"data\"\n[logging]\nformat = \"xml\"\n";
        assert!(ChunkLogConfig::from_str(format).is_err());
    }
}
