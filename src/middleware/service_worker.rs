use std::{future::Future, pin::Pin, sync::Arc};

use tracing::debug;

use super::{Middleware, Next};
use crate::registration::Registration;
use crate::{Response, StatusCode, context::Context};

/// Terminal middleware: answers every request through the [`Registration`].
///
/// When neither the network nor the cache can produce a response the page
/// gets `504 Gateway Timeout`; the proxy itself never retries.
pub struct ServiceWorkerMiddleware {
    registration: Arc<Registration>,
}

impl ServiceWorkerMiddleware {
    pub fn new(registration: Arc<Registration>) -> Self {
        Self { registration }
    }
}

impl Middleware for ServiceWorkerMiddleware {
    fn handle(&self, ctx: Context, _next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let registration = Arc::clone(&self.registration);
        Box::pin(async move {
            match registration.handle(ctx.client(), ctx.request()).await {
                Some(response) => response,
                None => {
                    debug!(url = %ctx.request().target(), "no network and no cached copy");
                    Response::new(StatusCode::GatewayTimeout)
                        .body("Offline and no cached copy is available")
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::cache::CacheStorage;
    use crate::clients::{ClientId, Clients};
    use crate::config::ProxyConfig;
    use crate::middleware::{MiddlewareHandler, from_middleware};
    use crate::network::testing::MockNetwork;

    #[tokio::test]
    async fn renders_missing_response_as_gateway_timeout() {
        let network = Arc::new(MockNetwork::famcal_shell());
        let registration = Arc::new(Registration::new(
            CacheStorage::in_memory(),
            network.clone(),
            Arc::new(Clients::new()),
        ));
        registration.register(ProxyConfig::famcal_v2()).await.unwrap();

        let stack: Arc<[MiddlewareHandler]> = Arc::from(vec![from_middleware(Arc::new(
            ServiceWorkerMiddleware::new(registration),
        ))]);
        let run = |target: &str| {
            let ctx = Context::new(Request::get(target), ClientId::new("page"));
            Next::new(Arc::clone(&stack)).run(ctx)
        };

        network.set_online(false);
        assert_eq!(run("/index.html").await.status(), StatusCode::Ok);
        assert_eq!(run("/api/events").await.status(), StatusCode::GatewayTimeout);
    }
}
