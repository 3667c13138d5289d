//! Layered configuration for the revalidation engine.
//!
//! Values are resolved in three layers, later layers winning:
//!
//! 1. Built-in defaults ([`Config::default`]).
//! 2. An optional configuration file. The format is chosen by extension
//!    (`.toml`, `.yaml`/`.yml` or `.json`), anything else is read as TOML.
//! 3. Environment variables prefixed with `SWR_`, nested with `__`, for example
//!    `SWR_STORE__DEFAULT_TTL_MS=1000`.
//!
//! ```toml
//! [store]
//! default_ttl_ms = 300000
//! sweep_interval_ms = 60000
//!
//! [revalidate]
//! retry_limit = 3
//! retry_interval_ms = 1000
//! debounce_ms = 300
//! fire_immediately = true
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "SWR_";
/// File name looked up in the platform configuration directory.
pub const DEFAULT_FILE_NAME: &str = "swr.toml";

/// Root configuration object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub revalidate: RevalidateConfig,
}

/// Settings for the cache store and its background sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Age after which a record is expired when no per-call TTL is given, and
    /// after which the background sweep evicts it.
    pub default_ttl_ms: u64,
    /// How often the background sweep runs while the store is non-empty.
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { default_ttl_ms: 5 * 60 * 1000, sweep_interval_ms: 60 * 1000 }
    }
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Defaults applied to every binding unless overridden per binding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevalidateConfig {
    /// Number of retries after the first failed fetch.
    pub retry_limit: u32,
    /// Pause between retries.
    pub retry_interval_ms: u64,
    /// Window in which dependency changes are coalesced.
    pub debounce_ms: u64,
    /// Fetch on construction when the cached record is expired.
    pub fire_immediately: bool,
}

impl Default for RevalidateConfig {
    fn default() -> Self {
        Self { retry_limit: 3, retry_interval_ms: 1000, debounce_ms: 300, fire_immediately: true }
    }
}

impl RevalidateConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Build the layered [`Figment`] without extracting it.
    ///
    /// Useful for callers that want to merge in their own providers before
    /// extraction.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// A file path that does not exist is silently skipped (figment treats
    /// missing files as empty providers).
    #[instrument(level = "debug")]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Config = Self::figment(path).extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Load configuration using the file in the platform configuration
    /// directory, if there is one.
    pub fn discover() -> Result<Self> {
        Self::load(Self::default_path().as_deref())
    }

    /// Location of `swr.toml` in the platform configuration directory, when
    /// such a file exists.
    pub fn default_path() -> Option<PathBuf> {
        let dirs = ProjectDirs::from("", "", "swr")?;
        let path = dirs.config_dir().join(DEFAULT_FILE_NAME);
        path.is_file().then_some(path)
    }

    /// Reject values that would turn periodic tasks into busy loops.
    pub fn validate(&self) -> Result<()> {
        if self.store.sweep_interval_ms == 0 {
            exn::bail!(ErrorKind::Invalid("store.sweep_interval_ms must be greater than zero"));
        }
        if self.revalidate.debounce_ms == 0 {
            exn::bail!(ErrorKind::Invalid("revalidate.debounce_ms must be greater than zero"));
        }
        Ok(())
    }
}
