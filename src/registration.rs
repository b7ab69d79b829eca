//! Versioned rollout of proxy versions.
//!
//! A [`Registration`] owns at most one active version and at most one
//! waiting version. Registering a new [`ProxyConfig`] installs it and then
//! either activates it straight away or parks it until no open page is
//! controlled by the active version any more:
//!
//! | Situation                                              | Outcome   |
//! |--------------------------------------------------------|-----------|
//! | no active version                                      | activated |
//! | `skip_waiting` set                                     | activated |
//! | active version controls no open page                   | activated |
//! | otherwise                                              | waiting   |
//!
//! A failed install leaves the active version untouched. Registration jobs
//! (register, promote, restore, retiring pages) run one at a time; request
//! handling never waits on them.
//!
//! The proxy never sees a page close. Pages silent for longer than an idle
//! window are retired with [`Registration::retire_idle`], which is what lets
//! a waiting version take over in a long-running proxy.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStorage};
use crate::clients::{ClientId, Clients};
use crate::config::{ConfigError, ProxyConfig};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::proxy::{ActiveProxy, CacheProxy, InstallError, InstalledProxy};

/// Errors produced while registering or promoting a version.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("activation of {version} failed: {source}")]
    Activate {
        version: String,
        #[source]
        source: CacheError,
    },
}

/// What [`Registration::register`] did with an installed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Activated,
    Waiting,
}

#[derive(Default)]
struct Slots {
    active: Option<Arc<ActiveProxy>>,
    waiting: Option<InstalledProxy>,
}

/// Routes page requests to the version controlling each page.
pub struct Registration {
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<Clients>,
    slots: RwLock<Slots>,
    jobs: Mutex<()>,
}

impl Registration {
    pub fn new(storage: Arc<CacheStorage>, network: Arc<dyn Network>, clients: Arc<Clients>) -> Self {
        Self {
            storage,
            network,
            clients,
            slots: RwLock::new(Slots::default()),
            jobs: Mutex::new(()),
        }
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    /// Name of the version currently in control, if any.
    pub async fn active_version(&self) -> Option<String> {
        let slots = self.slots.read().await;
        slots.active.as_ref().map(|a| a.version().to_owned())
    }

    /// Name of the installed version waiting to activate, if any.
    pub async fn waiting_version(&self) -> Option<String> {
        let slots = self.slots.read().await;
        slots.waiting.as_ref().map(|w| w.version().to_owned())
    }

    /// Installs `config` as a new version and activates it when nothing
    /// blocks it. A previously waiting version is discarded in favour of
    /// the new one.
    ///
    /// # Errors
    ///
    /// An invalid config or a failed install returns an error and leaves
    /// the active version in control.
    pub async fn register(&self, config: ProxyConfig) -> Result<RegisterOutcome, RegistrationError> {
        let _job = self.jobs.lock().await;

        let proxy = CacheProxy::new(config, Arc::clone(&self.storage), Arc::clone(&self.network))?;
        let installed = proxy.install().await?;

        if !installed.skip_waiting() && self.active_has_pages().await {
            let version = installed.version().to_owned();
            let mut slots = self.slots.write().await;
            if let Some(previous) = slots.waiting.replace(installed) {
                debug!(version = %previous.version(), "waiting version superseded");
            }
            info!(version = %version, "installed version waiting for open pages to close");
            return Ok(RegisterOutcome::Waiting);
        }

        self.promote(installed).await?;
        Ok(RegisterOutcome::Activated)
    }

    /// Activates the waiting version immediately, regardless of open pages.
    ///
    /// Returns `false` if nothing was waiting.
    pub async fn skip_waiting(&self) -> Result<bool, RegistrationError> {
        let _job = self.jobs.lock().await;
        let waiting = self.slots.write().await.waiting.take();
        match waiting {
            Some(installed) => {
                self.promote(installed).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reinstates the version recorded as active in the storage, adopting
    /// its existing store without touching the network.
    ///
    /// Call this before [`register`](Self::register) when reopening a
    /// persistent storage, so an offline restart still serves the cached
    /// shell. Returns the restored version, or `None` if nothing was
    /// recorded.
    ///
    /// # Errors
    ///
    /// Fails if the recorded store no longer exists or cannot be activated.
    pub async fn restore(&self) -> Result<Option<String>, RegistrationError> {
        let _job = self.jobs.lock().await;
        let Some(config) = self.storage.recorded_active().await else {
            return Ok(None);
        };

        let proxy = CacheProxy::new(config, Arc::clone(&self.storage), Arc::clone(&self.network))?;
        let installed = proxy.resume().await?;
        let version = installed.version().to_owned();
        self.promote(installed).await?;
        info!(version = %version, "restored active version");
        Ok(Some(version))
    }

    /// Forgets a closed page and activates the waiting version if that was
    /// the last page held by the active one.
    ///
    /// Returns `true` if a waiting version was activated.
    pub async fn client_closed(&self, id: &ClientId) -> Result<bool, RegistrationError> {
        let _job = self.jobs.lock().await;
        self.clients.remove(id).await;
        self.promote_if_unblocked().await
    }

    /// Retires every page silent for at least `max_idle`, then activates
    /// the waiting version if no remaining page holds the active one.
    ///
    /// Returns how many pages were retired.
    pub async fn retire_idle(&self, max_idle: Duration) -> Result<usize, RegistrationError> {
        let _job = self.jobs.lock().await;
        let idle = self.clients.idle(max_idle).await;
        for id in &idle {
            self.clients.remove(id).await;
        }
        if !idle.is_empty() {
            debug!(retired = idle.len(), "retired idle pages");
        }
        self.promote_if_unblocked().await?;
        Ok(idle.len())
    }

    /// Runs [`retire_idle`](Self::retire_idle) every `every` until the
    /// returned task is aborted.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        let registration = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = registration.retire_idle(max_idle).await {
                    warn!(error = %e, "idle page sweep failed");
                }
            }
        })
    }

    /// Answers `request` on behalf of page `client`.
    ///
    /// Pages controlled by a version go through the active proxy; pages
    /// that are not controlled talk to the network directly. `None` means
    /// no response could be produced.
    pub async fn handle(&self, client: &ClientId, request: &Request) -> Option<Response> {
        let active = self.slots.read().await.active.clone();
        let controller = self
            .clients
            .controller_or_register(client, active.as_ref().map(|a| a.version()))
            .await;

        match (controller, active) {
            (Some(_), Some(active)) => active.fetch(request).await,
            _ => {
                debug!(client = %client, url = %request.target(), "uncontrolled page, bypassing cache");
                self.network.fetch(request).await.ok()
            }
        }
    }

    async fn active_has_pages(&self) -> bool {
        let version = self.active_version().await;
        match version {
            Some(v) => self.clients.controlled_by(&v).await > 0,
            None => false,
        }
    }

    async fn promote_if_unblocked(&self) -> Result<bool, RegistrationError> {
        if self.active_has_pages().await {
            return Ok(false);
        }
        let waiting = self.slots.write().await.waiting.take();
        match waiting {
            Some(installed) => {
                self.promote(installed).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // A version whose activation fails is parked as the waiting version, so
    // `skip_waiting` or the next retired page can try again.
    async fn promote(&self, installed: InstalledProxy) -> Result<(), RegistrationError> {
        let version = installed.version().to_owned();
        let active = match installed.activate(&self.clients).await {
            Ok(active) => active,
            Err(e) => {
                let (installed, source) = e.into_parts();
                self.slots.write().await.waiting = Some(installed);
                return Err(RegistrationError::Activate { version, source });
            }
        };

        if let Err(e) = self.storage.record_active(active.config()).await {
            warn!(version = %version, error = %e, "could not record active version");
        }

        let mut slots = self.slots.write().await;
        if let Some(previous) = slots.active.replace(Arc::new(active)) {
            info!(version = %previous.version(), replaced_by = %version, "version retired");
        }
        Ok(())
    }
}
