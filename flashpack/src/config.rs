//! Layered configuration, following the search-and-merge shape of
//! `moss::config`: a vendor/admin pair of YAML files is enumerated, each
//! parsed and reduced together with [`Config::merge`], then environment
//! overrides are applied last.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    Gzip,
    Brotli,
}

/// Every setting `spec.md` §6.3 lists as owned by the configuration
/// collaborator.
// Unknown top-level keys in a config file are tolerated by default
// (serde ignores fields it doesn't recognize unless `deny_unknown_fields`
// is set), which is exactly the forward-compatible behavior spec.md §9 asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Bounded worker pool size. Defaults to `max(1, cpus - 1)`.
    pub concurrency: Option<usize>,
    pub compression_enabled: bool,
    pub compression_format: CompressionFormat,
    pub compression_level: u32,
    pub integrity_check: bool,
    pub hardlink: bool,
    pub streaming: bool,
    /// Soft cap, in seconds, on uploading a materialized tree to the
    /// tree store during `create` (spec.md §4.6).
    pub tree_cache_timeout_secs: u64,
    pub registry_url: String,
    pub offline: bool,
    pub allow_version_fallback: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            compression_enabled: true,
            compression_format: CompressionFormat::Gzip,
            compression_level: 6,
            integrity_check: true,
            hardlink: true,
            streaming: true,
            tree_cache_timeout_secs: 30,
            registry_url: "https://registry.npmjs.org".to_string(),
            offline: false,
            allow_version_fallback: false,
            max_retries: 2,
            retry_delay_ms: 250,
        }
    }
}

/// Deserializable config type with domain-scoped search paths and a
/// deterministic merge order. Implemented once for [`FlashConfig`], the
/// same shape `moss::config::Config` takes for every `.conf` domain.
pub trait Config: Sized {
    fn domain() -> &'static str;
    fn merge(self, other: Self) -> Self;
}

impl Config for FlashConfig {
    fn domain() -> &'static str {
        "flash-install"
    }

    fn merge(self, other: Self) -> Self {
        // `other` is the higher-priority source (later in the search order).
        other
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration at {path}: {source}")]
    Invalid { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid concurrency override {0:?}")]
    InvalidConcurrency(String),
    #[error("invalid boolean override {0:?}")]
    InvalidBool(String),
}

/// Loads [`FlashConfig`] by searching, in priority order: a project-local
/// `flash-install.yaml`, a user-level `${user_home}/.flash-install/config.yaml`,
/// then environment overrides. Unknown top-level keys are tolerated
/// (forward-compatible); a structurally invalid file is a `ConfigError`.
pub fn load(project_dir: &Path) -> Result<FlashConfig, Error> {
    let mut config = FlashConfig::default();

    for path in search_paths(project_dir) {
        if let Some(found) = read_config(&path)? {
            config = config.merge(found);
        }
    }

    apply_env_overrides(&mut config)?;

    Ok(config)
}

fn search_paths(project_dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".flash-install").join(FILE_NAME));
    }
    paths.push(project_dir.join("flash-install.yaml"));

    paths
}

fn read_config(path: &Path) -> Result<Option<FlashConfig>, Error> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };

    match serde_yaml::from_str::<PartialConfig>(&raw) {
        Ok(partial) => Ok(Some(partial.into_config())),
        Err(source) => Err(Error::Invalid {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Mirrors `FlashConfig` but every field is optional, so a file only
/// needs to name the settings it overrides.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    concurrency: Option<usize>,
    compression_enabled: Option<bool>,
    compression_format: Option<CompressionFormat>,
    compression_level: Option<u32>,
    integrity_check: Option<bool>,
    hardlink: Option<bool>,
    streaming: Option<bool>,
    tree_cache_timeout_secs: Option<u64>,
    registry_url: Option<String>,
    offline: Option<bool>,
    allow_version_fallback: Option<bool>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

impl PartialConfig {
    fn into_config(self) -> FlashConfig {
        let default = FlashConfig::default();
        FlashConfig {
            concurrency: self.concurrency.or(default.concurrency),
            compression_enabled: self.compression_enabled.unwrap_or(default.compression_enabled),
            compression_format: self.compression_format.unwrap_or(default.compression_format),
            compression_level: self.compression_level.unwrap_or(default.compression_level),
            integrity_check: self.integrity_check.unwrap_or(default.integrity_check),
            hardlink: self.hardlink.unwrap_or(default.hardlink),
            streaming: self.streaming.unwrap_or(default.streaming),
            tree_cache_timeout_secs: self
                .tree_cache_timeout_secs
                .unwrap_or(default.tree_cache_timeout_secs),
            registry_url: self.registry_url.unwrap_or(default.registry_url),
            offline: self.offline.unwrap_or(default.offline),
            allow_version_fallback: self.allow_version_fallback.unwrap_or(default.allow_version_fallback),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(default.retry_delay_ms),
        }
    }
}

fn apply_env_overrides(config: &mut FlashConfig) -> Result<(), Error> {
    if let Ok(url) = std::env::var("FLASH_INSTALL_REGISTRY") {
        config.registry_url = url;
    }
    if let Ok(raw) = std::env::var("FLASH_INSTALL_OFFLINE") {
        config.offline = parse_bool(&raw).ok_or_else(|| Error::InvalidBool(raw.clone()))?;
    }
    if let Ok(raw) = std::env::var("FLASH_INSTALL_CONCURRENCY") {
        let value = raw
            .parse::<usize>()
            .map_err(|_| Error::InvalidConcurrency(raw.clone()))?;
        config.concurrency = Some(value);
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Default store root: `${user_home}/.flash-install/cache`.
pub fn default_store_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flash-install")
        .join("cache")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_spec_compliant() {
        let config = FlashConfig::default();
        assert_eq!(config.registry_url, "https://registry.npmjs.org");
        assert_eq!(config.compression_level, 6);
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("FLASH_INSTALL_OFFLINE", "true");
        let mut config = FlashConfig::default();
        apply_env_overrides(&mut config).unwrap();
        assert!(config.offline);
        std::env::remove_var("FLASH_INSTALL_OFFLINE");
    }

    #[test]
    fn unknown_keys_in_project_file_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("flash-install.yaml"),
            "registry_url: https://example.test\nfrobnicate: true\n",
        )
        .unwrap();

        let config = load(dir.path()).unwrap();
        assert_eq!(config.registry_url, "https://example.test");
    }

    #[test]
    fn structurally_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flash-install.yaml"), "concurrency: [1, 2\n").unwrap();

        assert!(load(dir.path()).is_err());
    }
}
