//! Process endpoints for the operator: health probes and metrics
//!
//! `/healthz` answers OK for the lifetime of the process. `/readyz` answers
//! 503 until the SessionBinding cache has completed its initial sync, then
//! OK. The metrics listener serves reconcile counters in Prometheus text
//! exposition format.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

/// Readiness signal shared between `main` and the probe server.
#[derive(Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    /// Mark the process ready to serve.
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the process is ready.
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reconcile outcome counters exposed on the metrics endpoint.
#[derive(Default)]
pub struct ReconcileMetrics {
    successes: AtomicU64,
    errors: AtomicU64,
}

impl ReconcileMetrics {
    /// Count a completed reconcile.
    pub fn observe_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed reconcile.
    pub fn observe_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Render counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let successes = self.successes.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        format!(
            "# HELP sessionbinding_reconciliations_total Completed SessionBinding reconciliations.\n\
             # TYPE sessionbinding_reconciliations_total counter\n\
             sessionbinding_reconciliations_total{{result=\"success\"}} {successes}\n\
             sessionbinding_reconciliations_total{{result=\"error\"}} {errors}\n"
        )
    }
}

/// Build the health probe router (`/healthz`, `/readyz`).
pub fn health_routes(ready: ReadyFlag) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

async fn readyz(State(ready): State<ReadyFlag>) -> (StatusCode, &'static str) {
    if ready.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Build the metrics router (`/metrics`).
pub fn metrics_routes(metrics: Arc<ReconcileMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<ReconcileMetrics>>) -> String {
    metrics.render()
}

/// Parse a controller-runtime style bind address (`:8080` or `host:port`).
pub fn parse_bind_addr(spec: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port) = spec.strip_prefix(':') {
        format!("0.0.0.0:{port}").parse()
    } else {
        spec.parse()
    }
}

/// Bind and serve a router. Bind failures are logged and end the task; the
/// controller keeps running without the endpoint.
pub async fn serve(app: Router, addr_spec: String, name: &'static str) {
    let addr = match parse_bind_addr(&addr_spec) {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, addr = %addr_spec, "invalid {name} bind address");
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => {
            info!(addr = %addr, "{name} server started");
            l
        }
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind {name} server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "{name} server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let app = health_routes(ReadyFlag::default());
        assert_eq!(get_status(app, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_flips_with_the_flag() {
        let ready = ReadyFlag::default();

        let status = get_status(health_routes(ready.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        ready.set_ready();
        let status = get_status(health_routes(ready), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_counters() {
        let metrics = Arc::new(ReconcileMetrics::default());
        metrics.observe_success();
        metrics.observe_success();
        metrics.observe_error();

        let response = metrics_routes(metrics)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("sessionbinding_reconciliations_total{result=\"success\"} 2"));
        assert!(text.contains("sessionbinding_reconciliations_total{result=\"error\"} 1"));
    }

    #[test]
    fn bind_addr_accepts_port_only_form() {
        assert_eq!(
            parse_bind_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
        assert_eq!(
            parse_bind_addr("127.0.0.1:9090").unwrap(),
            "127.0.0.1:9090".parse().unwrap()
        );
        assert!(parse_bind_addr("not-an-addr").is_err());
    }
}
