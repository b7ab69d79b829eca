#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use famcal_proxy::config::FAMCAL_SHELL_ASSETS;
use famcal_proxy::context::Context;
use famcal_proxy::middleware::{
    LoggerMiddleware, MiddlewareHandler, Next, ServiceWorkerMiddleware, from_middleware,
};
use famcal_proxy::{Method, Registration, Response, Server, StatusCode};

/// A stand-in famcal backend. Shell bodies carry a generation number the
/// test can bump to tell fresh responses from cached ones.
pub struct Backend {
    pub addr: SocketAddr,
    pub generation: Arc<AtomicUsize>,
    pub hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Backend {
    pub async fn spawn() -> Self {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let generation = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        let (g, h) = (Arc::clone(&generation), Arc::clone(&hits));
        let task = tokio::spawn(async move {
            let _ = server
                .run(move |request, _peer| {
                    let gen_now = g.load(Ordering::SeqCst);
                    h.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let path = request.path().to_owned();
                        if FAMCAL_SHELL_ASSETS.contains(&path.as_str()) {
                            Response::new(StatusCode::Ok).body(format!("{path}@{gen_now}"))
                        } else if path == "/api/users" {
                            Response::new(StatusCode::Ok)
                                .header("Content-Type", "application/json")
                                .body(r#"[{"name":"ana"},{"name":"ben"}]"#)
                        } else {
                            Response::new(StatusCode::NotFound).body("not found")
                        }
                    }
                })
                .await;
        });

        Self {
            addr,
            generation,
            hits,
            task,
        }
    }

    pub fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stops the backend; afterwards connections to it are refused.
    pub async fn kill(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Runs the proxy pipeline on an ephemeral port.
pub async fn spawn_proxy(registration: Arc<Registration>) -> (SocketAddr, JoinHandle<()>) {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let stack: Arc<[MiddlewareHandler]> = Arc::from(vec![
        from_middleware(Arc::new(LoggerMiddleware)),
        from_middleware(Arc::new(ServiceWorkerMiddleware::new(registration))),
    ]);
    let task = tokio::spawn(async move {
        let _ = server
            .run(move |request, peer| {
                let next = Next::new(Arc::clone(&stack));
                async move { next.run(Context::from_peer(request, peer)).await }
            })
            .await;
    });
    (addr, task)
}

/// Issues one `GET` over a fresh connection and returns status and body.
pub async fn get(addr: SocketAddr, target: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!("GET {target} HTTP/1.1\r\nHost: famcal.test\r\nConnection: close\r\n\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = Response::parse(&buf, &Method::Get).unwrap();
    (
        response.status().as_u16(),
        String::from_utf8(response.body_ref().to_vec()).unwrap(),
    )
}
