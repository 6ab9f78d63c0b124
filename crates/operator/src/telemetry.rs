use prometheus::{TextEncoder, Encoder, Registry, IntCounterVec, IntGauge, opts};
use once_cell::sync::Lazy;
use axum::{response::IntoResponse, http::StatusCode, routing::get, Router};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("observability_reconcile_total", "Observability reconcile count"), &["result"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SINGLETON_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("observability_singleton_operations_total", "Create/delete calls against the singleton Observability object"), &["op", "result"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static IS_LEADER: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("observability_leader_is_leader", "1 while this instance holds the leader lease").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn record_singleton_op(op: &str, ok: bool) {
    SINGLETON_OPERATIONS.with_label_values(&[op, if ok { "success" } else { "error" }]).inc();
}

pub async fn metrics_handler() -> impl IntoResponse {
    // Touch lazies so families show up before the first event.
    Lazy::force(&RECONCILE_TOTAL);
    Lazy::force(&SINGLETON_OPERATIONS);
    Lazy::force(&IS_LEADER);
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_exposes_operator_families() {
        record_singleton_op("create", true);
        let res = metrics_router().oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("observability_singleton_operations_total"));
        assert!(text.contains("observability_leader_is_leader"));
    }
}
