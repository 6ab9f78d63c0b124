use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse { pub status: &'static str }

/// Liveness probe: the process is up and serving.
pub async fn healthz() -> Json<HealthResponse> { Json(HealthResponse { status: "ok" }) }

/// Readiness probe: flips once the manager has started its runnables.
pub async fn readyz(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, Json<HealthResponse>) {
    if ready.load(Ordering::Acquire) { (StatusCode::OK, Json(HealthResponse { status: "ready" })) }
    else { (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "starting" })) }
}

pub fn health_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn get_req(path: &str) -> Request<Body> { Request::builder().uri(path).body(Body::empty()).unwrap() }

    #[tokio::test]
    async fn readyz_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let app = health_router(ready.clone());
        assert_eq!(app.clone().oneshot(get_req("/readyz")).await.unwrap().status(), StatusCode::SERVICE_UNAVAILABLE);
        ready.store(true, Ordering::Release);
        assert_eq!(app.clone().oneshot(get_req("/readyz")).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.oneshot(get_req("/healthz")).await.unwrap().status(), StatusCode::OK);
    }
}
