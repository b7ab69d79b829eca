//! Per-version proxy configuration.
//!
//! A [`ProxyConfig`] is everything one deployed version of the proxy needs:
//! the name of its cache store, the shell assets to pre-cache, how `/api/`
//! requests are recognised, which shell policy it runs and whether it skips
//! the waiting phase. Configs are built in code (see the famcal presets) or
//! loaded from JSON:
//!
//! ```json
//! {
//!   "version_name": "famcal-v3",
//!   "shell_policy": "network-first",
//!   "skip_waiting": true
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The famcal application shell, in pre-cache order.
pub const FAMCAL_SHELL_ASSETS: [&str; 5] = [
    "/",
    "/index.html",
    "/calendar.html",
    "/assets/styles.css",
    "/manifest.json",
];

/// Requests whose path starts with this prefix are API requests.
pub const DEFAULT_API_PREFIX: &str = "/api/";

/// Errors raised while loading or validating a [`ProxyConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How shell (non-API) requests are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShellPolicy {
    /// Serve from the cache; only reach the network on a miss. The cache is
    /// never refreshed after install.
    CacheFirst,
    /// Try the network and store a copy of every success; fall back to the
    /// cache when the network rejects.
    #[default]
    NetworkFirst,
}

/// Configuration of one deployed proxy version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Name of this version's cache store. Bumping it is how stale shell
    /// assets are discarded.
    pub version_name: String,

    #[serde(default = "default_shell_assets")]
    pub shell_assets: Vec<String>,

    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    #[serde(default)]
    pub shell_policy: ShellPolicy,

    /// Activate as soon as install succeeds instead of waiting for pages
    /// controlled by the previous version to close.
    #[serde(default)]
    pub skip_waiting: bool,
}

fn default_shell_assets() -> Vec<String> {
    FAMCAL_SHELL_ASSETS.iter().map(|s| (*s).to_owned()).collect()
}

fn default_api_prefix() -> String {
    DEFAULT_API_PREFIX.to_owned()
}

impl ProxyConfig {
    /// A config with the famcal shell, the default API prefix, the
    /// network-first policy and no skip-waiting.
    pub fn new(version_name: impl Into<String>) -> Self {
        Self {
            version_name: version_name.into(),
            shell_assets: default_shell_assets(),
            api_prefix: default_api_prefix(),
            shell_policy: ShellPolicy::default(),
            skip_waiting: false,
        }
    }

    /// First famcal release: cache-first shell, waits for old pages.
    pub fn famcal_v1() -> Self {
        Self::new("famcal-v1").with_policy(ShellPolicy::CacheFirst)
    }

    /// Second famcal release: network-first shell with refresh, skips waiting.
    pub fn famcal_v2() -> Self {
        Self::new("famcal-v2")
            .with_policy(ShellPolicy::NetworkFirst)
            .with_skip_waiting(true)
    }

    #[must_use]
    pub fn with_shell_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ShellPolicy) -> Self {
        self.shell_policy = policy;
        self
    }

    #[must_use]
    pub fn with_skip_waiting(mut self, skip: bool) -> Self {
        self.skip_waiting = skip;
        self
    }

    /// Parses and validates a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the JSON config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json(&contents)
    }

    /// Checks the invariants the proxy relies on.
    ///
    /// The version name doubles as a file name for persistent stores, so it
    /// must be non-empty and free of path separators. Shell assets and the
    /// API prefix must be absolute paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version_name.trim().is_empty() {
            return Err(ConfigError::Invalid("version_name must not be empty".into()));
        }
        if self.version_name.contains(['/', '\\']) || self.version_name.starts_with('.') {
            return Err(ConfigError::Invalid(format!(
                "version_name {:?} is not a valid store name",
                self.version_name
            )));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "api_prefix {:?} must start with '/'",
                self.api_prefix
            )));
        }
        if let Some(bad) = self.shell_assets.iter().find(|a| !a.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "shell asset {bad:?} must be an absolute path"
            )));
        }
        Ok(())
    }
}
