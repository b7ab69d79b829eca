use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{CacheError, CachedResponse};
use crate::config::ProxyConfig;
use crate::http::{Request, Response};
use crate::network::Network;

// One named store. `seq` records creation order across restarts.
#[derive(Debug, Serialize, Deserialize)]
struct Store {
    name: String,
    seq: u64,
    entries: BTreeMap<String, CachedResponse>,
}

// Store names may not start with a dot, so this never shadows a snapshot.
const ACTIVE_FILE: &str = ".active.json";

#[derive(Debug, Default)]
struct Inner {
    stores: Vec<Store>,
    next_seq: u64,
    active: Option<ProxyConfig>,
}

impl Inner {
    fn store(&self, name: &str) -> Option<&Store> {
        self.stores.iter().find(|s| s.name == name)
    }

    fn store_mut(&mut self, name: &str) -> Option<&mut Store> {
        self.stores.iter_mut().find(|s| s.name == name)
    }
}

/// The set of named cache stores.
///
/// Always used behind an [`Arc`]; [`Cache`] handles keep a reference back
/// to the storage they were opened from.
///
/// # Examples
///
/// ```
/// use famcal_proxy::cache::CacheStorage;
/// use famcal_proxy::http::{Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = CacheStorage::in_memory();
/// let cache = storage.open("famcal-v2").await?;
/// cache
///     .put(&Request::get("/index.html"), Response::new(StatusCode::Ok).body("hi"))
///     .await?;
///
/// assert_eq!(storage.keys().await, vec!["famcal-v2"]);
/// assert!(storage.match_request(&Request::get("/index.html")).await.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CacheStorage {
    inner: RwLock<Inner>,
    dir: Option<PathBuf>,
    // Serializes snapshot writes so the file always reflects the latest state.
    disk: Mutex<()>,
}

impl CacheStorage {
    /// Creates an empty storage that lives only as long as the process.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            dir: None,
            disk: Mutex::new(()),
        })
    }

    /// Opens (creating if needed) a storage mirrored to `dir`, loading every
    /// store snapshot already present there.
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] if the directory cannot be created or read, and
    /// [`CacheError::Snapshot`] if a snapshot file is not valid.
    pub async fn persistent(dir: impl Into<PathBuf>) -> Result<Arc<Self>, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let active_path = dir.join(ACTIVE_FILE);
        let active = match tokio::fs::read(&active_path).await {
            Ok(contents) => Some(serde_json::from_slice::<ProxyConfig>(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error(&active_path, e)),
        };

        let mut stores = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        while let Some(item) = listing.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = item.path();
            let hidden = item.file_name().to_string_lossy().starts_with('.');
            if hidden || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            let store: Store = serde_json::from_slice(&contents)?;
            debug!(cache = %store.name, entries = store.entries.len(), "loaded cache snapshot");
            stores.push(store);
        }
        stores.sort_by_key(|s| s.seq);
        let next_seq = stores.last().map_or(0, |s| s.seq + 1);

        info!(dir = %dir.display(), stores = stores.len(), "cache storage opened");
        Ok(Arc::new(Self {
            inner: RwLock::new(Inner {
                stores,
                next_seq,
                active,
            }),
            dir: Some(dir),
            disk: Mutex::new(()),
        }))
    }

    /// Returns a handle to the store called `name`, creating it if absent.
    pub async fn open(self: &Arc<Self>, name: &str) -> Result<Cache, CacheError> {
        validate_name(name)?;

        let created = {
            let mut inner = self.inner.write().await;
            if inner.store(name).is_none() {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.stores.push(Store {
                    name: name.to_owned(),
                    seq,
                    entries: BTreeMap::new(),
                });
                true
            } else {
                false
            }
        };

        if created {
            info!(cache = %name, "cache created");
            self.persist(name).await?;
        }

        Ok(Cache {
            name: name.to_owned(),
            storage: Arc::clone(self),
        })
    }

    /// Returns `true` if a store called `name` exists.
    pub async fn has(&self, name: &str) -> bool {
        self.inner.read().await.store(name).is_some()
    }

    /// Returns every store name in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .stores
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Deletes the store called `name` with all of its entries.
    ///
    /// Returns `Ok(false)` if no such store existed.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let removed = {
            let mut inner = self.inner.write().await;
            let before = inner.stores.len();
            inner.stores.retain(|s| s.name != name);
            inner.stores.len() < before
        };

        if removed {
            info!(cache = %name, "cache deleted");
            self.persist(name).await?;
        }
        Ok(removed)
    }

    /// Looks `request` up in every store, oldest first, returning the first hit.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        if !request.method().is_cacheable() {
            return None;
        }
        let key = request.target();
        let inner = self.inner.read().await;
        inner
            .stores
            .iter()
            .find_map(|store| lookup(store, &key))
    }

    /// Remembers `config` as the version in control, so that a later
    /// [`recorded_active`](Self::recorded_active) on this storage (or on a
    /// persistent storage reopened from the same directory) returns it.
    pub async fn record_active(&self, config: &ProxyConfig) -> Result<(), CacheError> {
        self.inner.write().await.active = Some(config.clone());

        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let _guard = self.disk.lock().await;
        let bytes = serde_json::to_vec(config)?;
        let tmp = dir.join(format!("{ACTIVE_FILE}.tmp"));
        let path = dir.join(ACTIVE_FILE);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        debug!(version = %config.version_name, "recorded active version");
        Ok(())
    }

    /// The config last passed to [`record_active`](Self::record_active).
    pub async fn recorded_active(&self) -> Option<ProxyConfig> {
        self.inner.read().await.active.clone()
    }

    // Mirror the current state of store `name` to disk; a missing store
    // removes its file.
    async fn persist(&self, name: &str) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let _guard = self.disk.lock().await;

        let snapshot = {
            let inner = self.inner.read().await;
            match inner.store(name) {
                Some(store) => Some(serde_json::to_vec(store)?),
                None => None,
            }
        };

        let path = dir.join(format!("{name}.json"));
        match snapshot {
            Some(bytes) => {
                let tmp = dir.join(format!("{name}.json.tmp"));
                tokio::fs::write(&tmp, bytes)
                    .await
                    .map_err(|e| io_error(&tmp, e))?;
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| io_error(&path, e))?;
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            },
        }
        Ok(())
    }
}

/// A handle to one named store.
#[derive(Debug, Clone)]
pub struct Cache {
    name: String,
    storage: Arc<CacheStorage>,
}

impl Cache {
    /// Returns the store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks `request` up in this store only.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        if !request.method().is_cacheable() {
            return None;
        }
        let key = request.target();
        let inner = self.storage.inner.read().await;
        inner.store(&self.name).and_then(|store| lookup(store, &key))
    }

    /// Stores `response` under `request`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// [`CacheError::MethodNotCacheable`] for anything but `GET`,
    /// [`CacheError::StoreMissing`] if the store was deleted since this
    /// handle was opened, and persistence errors.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        if !request.method().is_cacheable() {
            return Err(CacheError::MethodNotCacheable {
                method: request.method().to_string(),
            });
        }
        let entry = CachedResponse::capture(response);
        {
            let mut inner = self.storage.inner.write().await;
            let store = inner
                .store_mut(&self.name)
                .ok_or_else(|| CacheError::StoreMissing(self.name.clone()))?;
            store.entries.insert(request.target(), entry);
        }
        self.storage.persist(&self.name).await
    }

    /// Fetches every target and stores all responses, or stores nothing.
    ///
    /// Targets are fetched concurrently. If any fetch rejects or answers
    /// with a non-2xx status, the whole operation fails and the store is
    /// left untouched.
    pub async fn add_all<S>(&self, network: &dyn Network, targets: &[S]) -> Result<(), CacheError>
    where
        S: AsRef<str> + Sync,
    {
        let fetches = targets.iter().map(|target| async move {
            let request = Request::get(target.as_ref());
            let response = network
                .fetch(&request)
                .await
                .map_err(|source| CacheError::Fetch {
                    target: request.target(),
                    source,
                })?;
            if !response.status().is_success() {
                return Err(CacheError::BadStatus {
                    target: request.target(),
                    status: response.status(),
                });
            }
            Ok((request.target(), CachedResponse::capture(response)))
        });
        let entries = try_join_all(fetches).await?;

        {
            let mut inner = self.storage.inner.write().await;
            let store = inner
                .store_mut(&self.name)
                .ok_or_else(|| CacheError::StoreMissing(self.name.clone()))?;
            store.entries.extend(entries);
        }
        debug!(cache = %self.name, count = targets.len(), "pre-cached targets");
        self.storage.persist(&self.name).await
    }

    /// Removes the entry for `request`. Returns `Ok(false)` if there was none.
    pub async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        let removed = {
            let mut inner = self.storage.inner.write().await;
            inner
                .store_mut(&self.name)
                .is_some_and(|store| store.entries.remove(&request.target()).is_some())
        };
        if removed {
            self.storage.persist(&self.name).await?;
        }
        Ok(removed)
    }

    /// Returns the targets stored in this store, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let inner = self.storage.inner.read().await;
        inner
            .store(&self.name)
            .map(|store| store.entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn lookup(store: &Store, key: &str) -> Option<Response> {
    let entry = store.entries.get(key)?;
    match entry.to_response() {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(cache = %store.name, url = %key, error = %e, "skipping unreadable entry");
            None
        }
    }
}

// Store names become file names, so keep them to a single path component.
fn validate_name(name: &str) -> Result<(), CacheError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(CacheError::InvalidName(name.to_owned()));
    }
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}
