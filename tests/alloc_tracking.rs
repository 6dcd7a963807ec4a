//! Memory-spike detection end to end. This test binary installs the
//! tracking allocator globally, which is exactly how a host application
//! opts in, so the allocation counter and the `memory_spike` rule are live
//! here and nowhere else in the test suite.

use std::sync::Arc;

use axum::body::Body;
use axum::routing::get;
use axum::Router;
use http::Request;
use http_body_util::BodyExt;
use tower::ServiceExt;
use xrayhq::runtime::TrackingAllocator;
use xrayhq::{Collector, Config, TraceLayer};

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;

#[test]
fn allocation_counter_is_cumulative() {
    let before = xrayhq::runtime::total_allocated();
    let data = vec![0u8; 64 * 1024];
    let after = xrayhq::runtime::total_allocated();
    assert!(after >= before + 64 * 1024);
    drop(data);
    // Cumulative: frees never decrement.
    assert!(xrayhq::runtime::total_allocated() >= after);
}

#[tokio::test]
async fn memory_spike_alert_fires_for_allocating_handler() {
    let config = Arc::new(Config::default().with_memory_spike_bytes(100 * 1024));
    let collector = Arc::new(Collector::new(config.clone()));
    let app = Router::new()
        .route(
            "/heavy",
            get(|| async {
                let buffer = vec![7u8; 2 * 1024 * 1024];
                format!("allocated {} bytes", buffer.len())
            }),
        )
        .layer(TraceLayer::new(collector.clone(), config));

    let response = app
        .oneshot(Request::builder().uri("/heavy").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let _ = response.into_body().collect().await.unwrap();

    let trace = &collector.recent_requests(1)[0];
    assert!(trace.mem_alloc_after > trace.mem_alloc_before);
    assert!(trace.alerts.iter().any(|a| a.kind == "memory_spike"));
}
