//! The caching proxy and its lifecycle.
//!
//! One deployed version moves through three states, each a distinct type so
//! that an out-of-order transition does not compile:
//!
//! ```text
//! CacheProxy ──install()──▶ InstalledProxy ──activate()──▶ ActiveProxy ──fetch()…
//! ```
//!
//! - **install** opens the version's cache store and pre-caches every shell
//!   asset, all or nothing.
//! - **activate** deletes every other cache store and claims all open pages.
//! - **fetch** answers one intercepted request according to its
//!   [`RequestKind`] and the configured [`ShellPolicy`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheError, CacheStorage};
use crate::clients::Clients;
use crate::config::{ConfigError, ProxyConfig, ShellPolicy};
use crate::http::{Request, Response};
use crate::network::Network;

/// How an intercepted request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Path starts with the API prefix: network first, never cached.
    Api,
    /// Everything else: the application shell.
    Shell,
}

impl RequestKind {
    /// Classifies `path` by a literal prefix match against `api_prefix`.
    pub fn classify(path: &str, api_prefix: &str) -> Self {
        if path.starts_with(api_prefix) {
            Self::Api
        } else {
            Self::Shell
        }
    }
}

/// Install failed; the version never takes control.
#[derive(Debug, Error)]
#[error("install of {version} failed: {source}")]
pub struct InstallError {
    pub version: String,
    #[source]
    pub source: CacheError,
}

/// Activation failed partway; the installed version is handed back so it
/// can be activated again without reinstalling.
#[derive(Debug, Error)]
#[error("activation of {version} failed: {source}")]
pub struct ActivateError {
    pub version: String,
    #[source]
    pub source: CacheError,
    proxy: Box<InstalledProxy>,
}

impl ActivateError {
    /// Splits the error into the still-installed version and the cause.
    pub fn into_parts(self) -> (InstalledProxy, CacheError) {
        (*self.proxy, self.source)
    }
}

/// A freshly constructed version, not yet installed.
pub struct CacheProxy {
    config: ProxyConfig,
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
}

impl CacheProxy {
    /// Creates a proxy for `config`, validating it first.
    pub fn new(
        config: ProxyConfig,
        storage: Arc<CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            network,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Opens this version's cache store and pre-caches the shell assets.
    ///
    /// # Errors
    ///
    /// Fails if any asset fetch rejects or returns a non-2xx status; in that
    /// case nothing was written to the store.
    pub async fn install(self) -> Result<InstalledProxy, InstallError> {
        let version = self.config.version_name.clone();
        info!(
            version = %version,
            assets = self.config.shell_assets.len(),
            "installing"
        );

        let result = async {
            let cache = self.storage.open(&version).await?;
            cache
                .add_all(self.network.as_ref(), &self.config.shell_assets)
                .await?;
            Ok::<_, CacheError>(cache)
        }
        .await;

        match result {
            Ok(cache) => {
                info!(version = %version, "installed");
                Ok(InstalledProxy {
                    config: self.config,
                    storage: self.storage,
                    network: self.network,
                    cache,
                })
            }
            Err(source) => {
                warn!(version = %version, error = %source, "install failed");
                Err(InstallError { version, source })
            }
        }
    }

    /// Adopts the store a previous run of this version already installed,
    /// without touching the network.
    ///
    /// # Errors
    ///
    /// [`CacheError::StoreMissing`] if no store of this version exists.
    pub async fn resume(self) -> Result<InstalledProxy, InstallError> {
        let version = self.config.version_name.clone();
        if !self.storage.has(&version).await {
            return Err(InstallError {
                source: CacheError::StoreMissing(version.clone()),
                version,
            });
        }
        let cache = self
            .storage
            .open(&version)
            .await
            .map_err(|source| InstallError {
                version: version.clone(),
                source,
            })?;
        info!(version = %version, "resumed installed store");
        Ok(InstalledProxy {
            config: self.config,
            storage: self.storage,
            network: self.network,
            cache,
        })
    }
}

/// A version whose shell is pre-cached, waiting to activate.
pub struct InstalledProxy {
    config: ProxyConfig,
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    cache: Cache,
}

impl fmt::Debug for InstalledProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstalledProxy")
            .field("version", &self.config.version_name)
            .field("cache", &self.cache.name())
            .finish_non_exhaustive()
    }
}

impl InstalledProxy {
    pub fn version(&self) -> &str {
        &self.config.version_name
    }

    /// Whether this version asked to activate without waiting for pages
    /// controlled by the previous version to close.
    pub fn skip_waiting(&self) -> bool {
        self.config.skip_waiting
    }

    /// Deletes every cache store except this version's, then claims all
    /// open pages.
    ///
    /// # Errors
    ///
    /// If a stale store cannot be deleted the version stays installed and
    /// comes back inside the [`ActivateError`]. Stores deleted before the
    /// failure stay deleted.
    pub async fn activate(self, clients: &Clients) -> Result<ActiveProxy, ActivateError> {
        let version = self.config.version_name.clone();
        info!(version = %version, "activating");

        for name in self.storage.keys().await {
            if name == version {
                continue;
            }
            if let Err(source) = self.storage.delete(&name).await {
                warn!(version = %version, stale = %name, error = %source, "activation failed");
                return Err(ActivateError {
                    version,
                    source,
                    proxy: Box::new(self),
                });
            }
            debug!(version = %version, stale = %name, "deleted stale cache");
        }

        let claimed = clients.claim(&version).await;
        info!(version = %version, claimed, "activated");

        Ok(ActiveProxy {
            config: self.config,
            storage: self.storage,
            network: self.network,
            cache: self.cache,
        })
    }
}

/// The version in control: answers intercepted requests.
///
/// `fetch` takes `&self`; any number of fetches may run concurrently and
/// share only the cache storage.
pub struct ActiveProxy {
    config: ProxyConfig,
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    cache: Cache,
}

impl ActiveProxy {
    pub fn version(&self) -> &str {
        &self.config.version_name
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn policy(&self) -> ShellPolicy {
        self.config.shell_policy
    }

    /// This version's cache store.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Answers one intercepted request.
    ///
    /// Returns `None` when the network rejected and nothing matched in the
    /// cache; the caller decides how to render that failure.
    pub async fn fetch(&self, request: &Request) -> Option<Response> {
        let kind = RequestKind::classify(request.path(), &self.config.api_prefix);
        match (kind, self.config.shell_policy) {
            (RequestKind::Api, _) => self.network_first(request, false).await,
            (RequestKind::Shell, ShellPolicy::CacheFirst) => self.cache_first(request).await,
            (RequestKind::Shell, ShellPolicy::NetworkFirst) => {
                self.network_first(request, true).await
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Option<Response> {
        if let Some(hit) = self.storage.match_request(request).await {
            debug!(url = %request.target(), "served from cache");
            return Some(hit);
        }
        match self.network.fetch(request).await {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(url = %request.target(), error = %e, "cache miss and network unavailable");
                None
            }
        }
    }

    // On success with `refresh`, a copy of the response replaces the cached entry.
    async fn network_first(&self, request: &Request, refresh: bool) -> Option<Response> {
        match self.network.fetch(request).await {
            Ok(response) if refresh && request.method().is_cacheable() => {
                let (response, copy) = response.tee();
                if let Err(e) = self.cache.put(request, copy).await {
                    warn!(url = %request.target(), error = %e, "failed to refresh cache entry");
                }
                Some(response)
            }
            Ok(response) => Some(response),
            Err(e) => {
                debug!(url = %request.target(), error = %e, "network unavailable, trying cache");
                self.storage.match_request(request).await
            }
        }
    }
}
