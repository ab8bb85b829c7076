use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::muxlink::{
    telemetry,
    tunnel::{registry::Registry, transport::TransportSession},
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub registry: Arc<Registry>,
    pub session: Arc<dyn TransportSession>,
    pub started_at_unix_ms: u64,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/routes", get(routes))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|s| *s).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    server: String,
    session_closed: bool,
    routes: usize,
    started_at_unix_ms: u64,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let closed = st.session.is_closed();
    let code = if closed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(HealthResponse {
            ok: !closed,
            server: st.session.peer(),
            session_closed: closed,
            routes: st.registry.len(),
            started_at_unix_ms: st.started_at_unix_ms,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn routes(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.snapshot()))
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::muxlink::tunnel::{control::tests::session_pair, registry::Target};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        c.write_all(req.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        c.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn health_and_routes() {
        let (client, _server) = session_pair();
        let registry = Arc::new(Registry::new());
        registry.register(7, Target::Tcp("127.0.0.1:9000".into()));

        let state = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            registry,
            session: client,
            started_at_unix_ms: 1,
        };

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(ln, router(state)).await });

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "got: {health}");
        assert!(health.contains(r#""ok":true"#));
        assert!(health.contains(r#""routes":1"#));

        let routes = get(addr, "/routes").await;
        assert!(routes.contains(r#""id":7"#), "got: {routes}");
        assert!(routes.contains(r#""network":"tcp""#));
        assert!(routes.contains(r#""target":"127.0.0.1:9000""#));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
    }
}
