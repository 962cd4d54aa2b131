//! HTTP surface: health check and the internal invalidation endpoint

mod health;
mod invalidate;

use std::net::SocketAddr;

use axum::Router;
use conduit_config::Config;
use conduit_gateway::Gateway;
use tower_http::trace::TraceLayer;

/// Assembled router bound to a listen address
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
}

impl Server {
    /// Mount the routes enabled by `config` over `gateway`
    ///
    /// `/internal/invalidate` is only mounted when an internal secret is set.
    pub fn new(config: &Config, gateway: Gateway) -> Self {
        let listen_address = config
            .server
            .listen_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let mut app = Router::new();

        if config.server.health.enabled {
            app = app.route(&config.server.health.path, axum::routing::get(health::health_handler));
        }

        if let Some(secret) = &config.server.internal_secret {
            let state = invalidate::InvalidateState {
                gateway,
                internal_secret: secret.clone(),
            };
            app = app.route(
                "/internal/invalidate",
                axum::routing::post(invalidate::invalidate_handler).with_state(state),
            );
        } else {
            tracing::info!("internal secret unset, /internal/invalidate not mounted");
        }

        app = app.layer(TraceLayer::new_for_http());

        Self {
            router: app,
            listen_address,
        }
    }

    #[must_use]
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Consume the server and return the inner router
    ///
    /// Useful for testing when the caller manages the listener
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns an error if binding the TCP listener or serving fails
    pub async fn serve(self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("graceful shutdown initiated");
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use conduit_config::ServerConfig;
    use conduit_gateway::HttpExecutor;
    use conduit_store::MemoryStore;
    use http::{Request, StatusCode};
    use secrecy::SecretString;
    use tower::ServiceExt;

    use super::*;

    fn router(internal_secret: Option<&str>) -> Router {
        let config = Config {
            server: ServerConfig {
                internal_secret: internal_secret.map(SecretString::from),
                ..ServerConfig::default()
            },
            ..Config::default()
        };
        let gateway = Gateway::new(Arc::new(MemoryStore::new()), &config, Arc::new(HttpExecutor::default()));
        Server::new(&config, gateway).into_router()
    }

    fn invalidate(secret: &str, key: &str) -> Request<Body> {
        Request::post("/internal/invalidate")
            .header(invalidate::SECRET_HEADER, secret)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "key": key }).to_string()))
            .unwrap()
    }

    #[test]
    fn default_listen_address() {
        let config = Config::default();
        let gateway = Gateway::new(Arc::new(MemoryStore::new()), &config, Arc::new(HttpExecutor::default()));
        assert_eq!(
            Server::new(&config, gateway).listen_address(),
            SocketAddr::from(([0, 0, 0, 0], 3000))
        );
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let resp = router(None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn invalidate_checks_the_secret() {
        let resp = router(Some("s3cret"))
            .oneshot(invalidate("nope", "token_auth"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = router(Some("s3cret"))
            .oneshot(invalidate("s3cret", "token_auth"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, serde_json::json!({"key": "token_auth", "version": 1}));
    }

    #[tokio::test]
    async fn invalidate_is_unmounted_without_a_secret() {
        let resp = router(None).oneshot(invalidate("s3cret", "token_auth")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
