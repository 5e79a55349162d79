//! Module for application configuration settings.
//!
//! User configurations may be specified in a TOML configuration file; every
//! field has a sensible default so the proxy and origin run without one.

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Deserialize a path field, expanding a leading `~` to the user's home
/// directory so every path coming out of configuration is already resolved.
fn expanded_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(PathBuf::from(shellexpand::tilde(&raw).into_owned()))
}

fn runtime_dir() -> PathBuf {
    if let Some(path) = dirs::runtime_dir() {
        return path.join("proxyfs");
    }
    if let Some(path) = dirs::home_dir() {
        return path.join(".local").join("share").join("proxyfs");
    }
    PathBuf::from("/tmp/proxyfs")
}

fn default_cache_dir() -> PathBuf {
    runtime_dir().join("cache")
}

fn default_origin_root() -> PathBuf {
    runtime_dir().join("store")
}

fn default_capacity() -> ByteSize {
    ByteSize::mib(512)
}

fn default_proxy_listen() -> String {
    "127.0.0.1:7070".to_owned()
}

fn default_origin_listen() -> String {
    "127.0.0.1:7071".to_owned()
}

/// Settings for the caching proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyConfig {
    /// Address the proxy accepts client connections on.
    pub listen: String,

    /// Address of the origin server.
    pub origin: String,

    /// The path to the cache directory.
    #[serde(deserialize_with = "expanded_path")]
    pub cache_dir: PathBuf,

    /// The maximum size of the cache in bytes.
    pub cache_capacity: ByteSize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            origin: default_origin_listen(),
            cache_dir: default_cache_dir(),
            cache_capacity: default_capacity(),
        }
    }
}

/// Settings for the origin server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OriginConfig {
    /// Address the origin accepts proxy connections on.
    pub listen: String,

    /// Root directory of the authoritative store.
    #[serde(deserialize_with = "expanded_path")]
    pub root: PathBuf,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            listen: default_origin_listen(),
            root: default_origin_root(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub origin: OriginConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (field, addr) in [("proxy.listen", &self.proxy.listen),
            ("proxy.origin", &self.proxy.origin),
            ("origin.listen", &self.origin.listen)]
        {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("'{field}' is not a valid socket address: {addr}"));
            }
        }

        if self.proxy.cache_capacity.as_u64() == 0 {
            errors.push("'proxy.cache-capacity' must be positive.".to_owned());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Returns config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("proxyfs").join("config.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("proxyfs").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/proxyfs/config.toml"));

        paths
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, from the first
    /// found search path otherwise, and falls back to defaults when no file
    /// exists. A file that exists but is malformed or invalid is an error.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = if let Some(path) = external_config_path {
            Some(Self::load_from_file(path).map(|cfg| (cfg, path.to_path_buf())))
        } else {
            Self::config_search_paths()
                .iter()
                .find(|p| p.exists())
                .map(|path| Self::load_from_file(path).map(|cfg| (cfg, path.clone())))
        };

        let Some(config) = config else {
            info!("No configuration file found, using defaults.");
            return Ok(Self::default());
        };

        let (config, path) = config?;
        if let Err(validation_errors) = config.validate() {
            return Err(ConfigError::ValidationErrors(validation_errors));
        }
        info!(path = %path.display(), "Loaded config file.");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok(), "{:?}", config.validate());
    }

    #[test]
    fn toml_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            listen = "0.0.0.0:9000"
            cache-capacity = "10 MiB"

            [origin]
            root = "/srv/files"
            "#,
        )
        .expect("parse");

        assert_eq!(config.proxy.listen, "0.0.0.0:9000");
        assert_eq!(config.proxy.cache_capacity, ByteSize::mib(10));
        assert_eq!(config.origin.root, PathBuf::from("/srv/files"));
        // Untouched fields keep their defaults.
        assert_eq!(config.origin.listen, default_origin_listen());
    }

    #[test]
    fn bad_listen_address_fails_validation() {
        let mut config = Config::default();
        config.proxy.listen = "not-an-address".to_owned();

        let errors = config.validate().expect_err("must fail");
        assert!(errors.iter().any(|e| e.contains("proxy.listen")), "{errors:?}");
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let mut config = Config::default();
        config.proxy.cache_capacity = ByteSize::b(0);

        assert!(config.validate().is_err());
    }

    #[test]
    fn tilde_paths_are_expanded() {
        if dirs::home_dir().is_none() {
            return; // nothing to expand against
        }
        let config: Config = toml::from_str(
            r#"
            [proxy]
            cache-dir = "~/proxy-cache"
            "#,
        )
        .expect("parse");

        assert!(
            !config.proxy.cache_dir.starts_with("~"),
            "tilde must be expanded, got {}",
            config.proxy.cache_dir.display()
        );
    }
}
