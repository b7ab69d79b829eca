mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use famcal_proxy::cache::CacheStorage;
use famcal_proxy::clients::Clients;
use famcal_proxy::network::{HttpNetwork, Network, NetworkError};
use famcal_proxy::{Method, ProxyConfig, RegisterOutcome, Registration, Request, StatusCode};

use common::{Backend, get, spawn_proxy};

fn registration(storage: Arc<CacheStorage>, backend: &Backend) -> Arc<Registration> {
    Arc::new(Registration::new(
        storage,
        Arc::new(HttpNetwork::new(backend.addr.to_string())),
        Arc::new(Clients::new()),
    ))
}

#[tokio::test]
async fn http_network_talks_to_upstream() {
    let backend = Backend::spawn().await;
    let network = HttpNetwork::new(backend.addr.to_string());

    let ok = network.fetch(&Request::get("/index.html")).await.unwrap();
    assert_eq!(ok.status(), StatusCode::Ok);
    assert_eq!(ok.body_ref().as_ref(), b"/index.html@0");

    // Error statuses are responses, not network failures.
    let missing = network.fetch(&Request::get("/nope")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NotFound);

    backend.kill().await;
    let err = network.fetch(&Request::get("/index.html")).await.unwrap_err();
    assert!(matches!(err, NetworkError::Connect { .. }));
}

#[tokio::test]
async fn network_first_release_end_to_end() {
    let backend = Backend::spawn().await;
    let storage = CacheStorage::in_memory();
    let reg = registration(Arc::clone(&storage), &backend);
    assert_eq!(
        reg.register(ProxyConfig::famcal_v2()).await.unwrap(),
        RegisterOutcome::Activated
    );
    let (proxy, _task) = spawn_proxy(Arc::clone(&reg)).await;

    // Online: fresh copies from the backend, each one written to the cache.
    assert_eq!(get(proxy, "/calendar.html").await, (200, "/calendar.html@0".into()));
    backend.bump();
    assert_eq!(get(proxy, "/calendar.html").await, (200, "/calendar.html@1".into()));

    // API responses pass through untouched and are never cached.
    let (status, body) = get(proxy, "/api/users").await;
    assert_eq!(status, 200);
    assert_eq!(body, r#"[{"name":"ana"},{"name":"ben"}]"#);
    assert!(storage.match_request(&Request::get("/api/users")).await.is_none());

    backend.kill().await;

    // Offline: the last refreshed copy, and 504 where nothing was cached.
    assert_eq!(get(proxy, "/calendar.html").await, (200, "/calendar.html@1".into()));
    assert_eq!(get(proxy, "/manifest.json").await, (200, "/manifest.json@0".into()));
    assert_eq!(get(proxy, "/api/users").await.0, 504);
    assert_eq!(get(proxy, "/settings.html").await.0, 504);
}

#[tokio::test]
async fn cache_first_release_serves_install_time_shell() {
    let backend = Backend::spawn().await;
    let reg = registration(CacheStorage::in_memory(), &backend);
    reg.register(ProxyConfig::famcal_v1()).await.unwrap();
    let (proxy, _task) = spawn_proxy(Arc::clone(&reg)).await;

    let hits = backend.hits.load(Ordering::SeqCst);
    backend.bump();
    assert_eq!(get(proxy, "/calendar.html").await, (200, "/calendar.html@0".into()));
    assert_eq!(backend.hits.load(Ordering::SeqCst), hits);

    // Misses still reach the network.
    assert_eq!(get(proxy, "/api/users").await.0, 200);
    assert_eq!(get(proxy, "/elsewhere").await.0, 404);
}

#[tokio::test]
async fn upgrade_from_v1_to_v2_discards_old_store() {
    let backend = Backend::spawn().await;
    let storage = CacheStorage::in_memory();
    let reg = registration(Arc::clone(&storage), &backend);
    let (proxy, _task) = spawn_proxy(Arc::clone(&reg)).await;

    reg.register(ProxyConfig::famcal_v1()).await.unwrap();
    assert_eq!(get(proxy, "/").await.0, 200);

    backend.bump();
    reg.register(ProxyConfig::famcal_v2()).await.unwrap();
    assert_eq!(reg.active_version().await.as_deref(), Some("famcal-v2"));
    assert_eq!(storage.keys().await, vec!["famcal-v2"]);

    backend.kill().await;
    assert_eq!(get(proxy, "/").await, (200, "/@1".into()));
}

#[tokio::test]
async fn failed_install_leaves_no_active_version() {
    let backend = Backend::spawn().await;
    let reg = registration(CacheStorage::in_memory(), &backend);

    let broken = ProxyConfig::new("famcal-v3").with_shell_assets(["/", "/missing.css"]);
    assert!(reg.register(broken).await.is_err());
    assert_eq!(reg.active_version().await, None);

    // Pages are served straight from the backend while nothing is active.
    let (proxy, _task) = spawn_proxy(Arc::clone(&reg)).await;
    assert_eq!(get(proxy, "/index.html").await, (200, "/index.html@0".into()));
}

#[tokio::test]
async fn offline_restart_serves_persisted_shell() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::spawn().await;
    let upstream = backend.addr;
    {
        let storage = CacheStorage::persistent(dir.path()).await.unwrap();
        let reg = registration(storage, &backend);
        reg.register(ProxyConfig::famcal_v2()).await.unwrap();
    }
    backend.kill().await;

    let storage = CacheStorage::persistent(dir.path()).await.unwrap();
    assert_eq!(storage.keys().await, vec!["famcal-v2"]);
    let reg = Arc::new(Registration::new(
        storage,
        Arc::new(HttpNetwork::new(upstream.to_string())),
        Arc::new(Clients::new()),
    ));
    assert_eq!(reg.restore().await.unwrap().as_deref(), Some("famcal-v2"));
    assert!(reg.register(ProxyConfig::famcal_v2()).await.is_err());

    let (proxy, _task) = spawn_proxy(reg).await;
    assert_eq!(get(proxy, "/calendar.html").await, (200, "/calendar.html@0".into()));
    assert_eq!(get(proxy, "/api/users").await.0, 504);
}

#[tokio::test]
async fn http_network_accepts_bodyless_head_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 1024];
        let _ = socket.read(&mut request).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap();
    });

    let network = HttpNetwork::new(addr.to_string());
    let response = network
        .fetch(&Request::new(Method::Head, "/index.html"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::Ok);
    assert!(response.body_ref().is_empty());
    upstream.await.unwrap();
}

#[tokio::test]
async fn chunked_page_request_is_refused() {
    let backend = Backend::spawn().await;
    let reg = registration(CacheStorage::in_memory(), &backend);
    let (proxy, _task) = spawn_proxy(reg).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            b"POST /api/events HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.starts_with("HTTP/1.1 411 Length Required\r\n"));
    assert_eq!(text.matches("HTTP/1.1 ").count(), 1);
    assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pipelined_requests_on_one_connection() {
    let backend = Backend::spawn().await;
    let reg = registration(CacheStorage::in_memory(), &backend);
    reg.register(ProxyConfig::famcal_v1()).await.unwrap();
    let (proxy, _task) = spawn_proxy(reg).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\nGET /manifest.json HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert!(text.contains("/index.html@0"));
    assert!(text.ends_with("/manifest.json@0"));
}
