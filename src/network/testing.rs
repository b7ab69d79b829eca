//! In-memory network double for unit tests.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{FetchFuture, Network, NetworkError};
use crate::http::{Request, Response, StatusCode};

/// Serves canned bodies by path; unknown paths answer `404`. Can be taken
/// offline, in which case every fetch rejects with a refused connection.
pub(crate) struct MockNetwork {
    online: AtomicBool,
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    calls: AtomicUsize,
}

impl MockNetwork {
    pub(crate) fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            routes: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A network serving every famcal shell asset with a body naming its path.
    pub(crate) fn famcal_shell() -> Self {
        let net = Self::new();
        for path in crate::config::FAMCAL_SHELL_ASSETS {
            net.serve(path, StatusCode::Ok, &format!("shell:{path}"));
        }
        net
    }

    pub(crate) fn serve(&self, target: &str, status: StatusCode, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(target.to_owned(), (status, body.to_owned()));
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Network for MockNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.online.load(Ordering::SeqCst) {
                return Err(NetworkError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "offline",
                )));
            }
            let route = self.routes.lock().unwrap().get(&request.target()).cloned();
            Ok(match route {
                Some((status, body)) => Response::new(status).body(body),
                None => Response::new(StatusCode::NotFound),
            })
        })
    }
}
