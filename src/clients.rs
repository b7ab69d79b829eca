//! Open pages and the proxy version controlling each of them.
//!
//! A page that opened before any version was active stays uncontrolled
//! (its requests bypass the proxy) until a version [claims](Clients::claim)
//! it. A page opened while a version is active is controlled by that
//! version from the start.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

/// Identity of an open page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// One open page.
#[derive(Debug)]
struct Page {
    controller: Option<String>,
    last_seen: Instant,
}

/// Registry of open pages.
///
/// The proxy never sees a page close, so a page counts as open until it
/// has been silent for longer than the idle window passed to
/// [`idle`](Self::idle).
#[derive(Debug, Default)]
pub struct Clients {
    inner: RwLock<HashMap<ClientId, Page>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the controller of `id`, registering the page first if it is
    /// new. A new page is controlled by `active` (which may be `None`).
    ///
    /// Every call marks the page as seen.
    pub async fn controller_or_register(&self, id: &ClientId, active: Option<&str>) -> Option<String> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let page = inner.entry(id.clone()).or_insert_with(|| {
            debug!(client = %id, controller = ?active, "client registered");
            Page {
                controller: active.map(str::to_owned),
                last_seen: now,
            }
        });
        page.last_seen = now;
        page.controller.clone()
    }

    /// Returns the controller of a known page.
    pub async fn controller(&self, id: &ClientId) -> Option<String> {
        self.inner
            .read()
            .await
            .get(id)
            .and_then(|page| page.controller.clone())
    }

    /// Forgets a closed page. Returns `true` if it was known.
    pub async fn remove(&self, id: &ClientId) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    /// Returns the pages that have not been seen for at least `max_idle`.
    pub async fn idle(&self, max_idle: Duration) -> Vec<ClientId> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(_, page)| page.last_seen.elapsed() >= max_idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Makes `version` the controller of every open page and returns how
    /// many pages changed controller.
    pub async fn claim(&self, version: &str) -> usize {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for page in inner.values_mut() {
            if page.controller.as_deref() != Some(version) {
                page.controller = Some(version.to_owned());
                changed += 1;
            }
        }
        changed
    }

    /// Counts the open pages controlled by `version`.
    pub async fn controlled_by(&self, version: &str) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|page| page.controller.as_deref() == Some(version))
            .count()
    }

    /// Counts open pages.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
