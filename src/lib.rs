//! # famcal-proxy
//!
//! An offline-first caching proxy for the famcal web application.
//!
//! Pages talk to the proxy instead of the famcal backend. The proxy
//! pre-caches the application shell into a versioned cache store, answers
//! `/api/` requests from the network first, and serves the shell according
//! to the policy of the version in control:
//!
//! - **cache-first** (`famcal-v1`): cached shell, network only on a miss;
//! - **network-first with refresh** (`famcal-v2`): network, with every
//!   success copied into the cache for later offline use.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use famcal_proxy::cache::CacheStorage;
//! use famcal_proxy::clients::Clients;
//! use famcal_proxy::config::ProxyConfig;
//! use famcal_proxy::http::Request;
//! use famcal_proxy::clients::ClientId;
//! use famcal_proxy::network::HttpNetwork;
//! use famcal_proxy::registration::Registration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registration = Registration::new(
//!         CacheStorage::in_memory(),
//!         Arc::new(HttpNetwork::new("127.0.0.1:5000")),
//!         Arc::new(Clients::new()),
//!     );
//!     registration.register(ProxyConfig::famcal_v2()).await?;
//!
//!     let page = ClientId::new("tab-1");
//!     let response = registration.handle(&page, &Request::get("/calendar.html")).await;
//!     println!("{:?}", response.map(|r| r.status()));
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clients;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod network;
pub mod proxy;
pub mod registration;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ProxyConfig, ShellPolicy};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{ActivateError, ActiveProxy, CacheProxy, InstalledProxy, RequestKind};
pub use registration::{RegisterOutcome, Registration};
pub use server::{Server, ServerError};
