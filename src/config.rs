//! Tracer configuration
//!
//! Settings come from an optional TOML file and are then overridden by any
//! flags given explicitly on the command line:
//!
//! ```toml
//! filter_file = "calltrace.filter"
//! max_cache_size = 4096
//! cache_capacity = 131072
//! grepable = true
//! output = "trace.log"    # "-" writes to stderr
//! ```

use crate::cache::{CacheConfig, DEFAULT_CAPACITY};
use crate::cli::Cli;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// White/black list file
    pub filter_file: Option<PathBuf>,
    /// Flush the whole cache once it holds this many records (0 = off)
    pub max_cache_size: usize,
    /// Fixed capacity of the return value cache
    pub cache_capacity: usize,
    /// One line per call
    pub grepable: bool,
    /// Trace log path, or `-` for stderr
    pub output: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            filter_file: None,
            max_cache_size: 0,
            cache_capacity: DEFAULT_CAPACITY,
            grepable: false,
            output: "-".to_string(),
        }
    }
}

impl TraceConfig {
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Toml {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }

    /// Apply flags the user passed explicitly
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(path) = &cli.filter_file {
            self.filter_file = Some(path.clone());
        }
        if let Some(size) = cli.max_cache_size {
            self.max_cache_size = size;
        }
        if let Some(capacity) = cli.cache_capacity {
            self.cache_capacity = capacity;
        }
        if cli.grepable {
            self.grepable = true;
        }
        if let Some(output) = &cli.output {
            self.output = output.clone();
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity,
            max_cache_size: self.max_cache_size,
            grepable: self.grepable,
        }
    }

    /// True when the trace goes to stderr rather than a file
    pub fn writes_to_stderr(&self) -> bool {
        self.output == "-"
    }
}
