//! TOML configuration loading for the CLI embedding.

use std::path::Path;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Load a [`Config`] from a TOML file.
///
/// ```toml
/// [defaults]
/// interval_sec = 60
/// threshold = 3
///
/// [guards.corp-dns]
/// kind = "dns"
/// hostname = "internal.example.com"
///
/// [[channels]]
/// id = "api"
/// kind = "http"
/// url = "https://api.example.com/health"
/// priority = "high"
/// guards = ["corp-dns"]
/// ```
pub fn load(path: &Path) -> Result<Config, ConfigFileError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigFileError::Parse {
        path: path.display().to_string(),
        source,
    })
}
