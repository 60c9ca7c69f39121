use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{config::ServerConfig, handlers, receiver::Storage, signals::ShutdownSignal};

/// Create the Axum router
///
/// `/hits` is only mounted when the process runs a receiver.
pub fn create_router(metrics_handle: Arc<PrometheusHandle>, ingest: Option<Arc<dyn Storage>>) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics_handler::metrics))
        .with_state(metrics_handle);

    if let Some(storage) = ingest {
        let ingest_routes = Router::new()
            .route("/hits", post(handlers::hits::ingest_hits))
            .with_state(storage);
        router = router.merge(ingest_routes);
    }

    router
        // Limit request body size to 10MB
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
}

/// Serve `router` until shutdown is broadcast, then give in-flight
/// requests up to `drain` to finish.
pub async fn serve(
    config: &ServerConfig,
    router: Router,
    shutdown: &broadcast::Sender<ShutdownSignal>,
    drain: Duration,
) -> Result<()> {
    let addr = SocketAddr::from((
        config
            .host
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("invalid server.host {:?}", config.host))?,
        config.port,
    ));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    let mut graceful_rx = shutdown.subscribe();
    let mut drain_rx = shutdown.subscribe();

    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.recv().await;
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = drain_rx.recv() => {
            info!("Shutdown signal received, draining connections...");
        }
    }

    match tokio::time::timeout(drain, &mut server).await {
        Ok(result) => result??,
        Err(_) => {
            warn!("HTTP listener did not drain within {:?}, aborting", drain);
            server.abort();
        }
    }

    info!("HTTP listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::hits::Hit;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    struct Discard;

    #[async_trait]
    impl Storage for Discard {
        async fn push(&self, _hits: Vec<Hit>) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn handle() -> Arc<PrometheusHandle> {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        Arc::new(recorder.handle())
    }

    #[tokio::test]
    async fn test_hits_route_only_with_receiver() {
        let without = create_router(handle(), None);
        let response = without
            .oneshot(
                Request::post("/hits")
                    .header("content-type", "application/json")
                    .body(Body::from("[]"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let with = create_router(handle(), Some(Arc::new(Discard)));
        let response = with
            .oneshot(
                Request::post("/hits")
                    .header("content-type", "application/json")
                    .body(Body::from("[]"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_health_route() {
        let response = create_router(handle(), None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let shutdown = crate::signals::shutdown_channel();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                serve(&config, create_router(handle(), None), &shutdown, Duration::from_secs(1)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(ShutdownSignal::Graceful).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
