//! Drop-in request observability for axum services.
//!
//! xrayhq wraps an application's handlers with a tracing middleware that
//! captures one trace per request (latency, TTFB, bodies, headers, database
//! queries, outbound calls, panics), aggregates per-route metrics,
//! evaluates alert rules inline (N+1 queries, slow queries, slow routes,
//! high error rates, memory spikes, panics), and serves a live dashboard on
//! its own listener.
//!
//! # Quick start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() {
//!     xrayhq::init(xrayhq::Config::default());
//!
//!     let app = axum::Router::new()
//!         .route("/", axum::routing::get(|| async { "hello" }))
//!         .layer(xrayhq::layer());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! The dashboard is then available at <http://127.0.0.1:9090>.
//!
//! For hosts that prefer explicit wiring over process-wide state, build the
//! pieces directly:
//!
//! ```ignore
//! let config = std::sync::Arc::new(xrayhq::Config::default());
//! let collector = std::sync::Arc::new(xrayhq::Collector::new(config.clone()));
//! let app = router.layer(xrayhq::TraceLayer::new(collector.clone(), config.clone()));
//! // mount xrayhq::dashboard::router(collector, config) wherever it fits
//! ```
//!
//! Instrumentation shims report sub-events through free functions that find
//! the active trace on the task: [`record_db_query`], [`record_external_call`],
//! [`record_redis_op`], [`record_mongo_op`]. Outside a traced request they
//! are no-ops, so shims need no conditional wiring.

pub mod alerts;
pub mod collector;
pub mod config;
pub mod context;
pub mod dashboard;
pub mod interceptor;
pub mod metrics;
pub mod middleware;
pub mod runtime;
pub mod trace;

pub use collector::{Collector, LiveSubscription};
pub use config::{Config, ConfigError, Mode};
pub use context::{
    current_trace, record_db_query, record_external_call, record_mongo_op, record_redis_op,
    set_route_pattern,
};
pub use metrics::{RouteMetrics, RouteStatus};
pub use middleware::TraceLayer;
pub use trace::{
    Alert, DbQuery, ExternalCall, MongoOp, RedisOp, RequestTrace, Severity, TraceHandle,
};

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;

struct Globals {
    collector: Arc<Collector>,
    config: Arc<Config>,
}

static GLOBALS: ArcSwapOption<Globals> = ArcSwapOption::const_empty();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Installs `config` as the process-wide configuration, constructs the
/// default collector, and spawns the dashboard listener in the background.
///
/// Calling it again replaces the defaults ("second call wins"); layers
/// built afterwards with [`layer`] use the new collector. Must run inside a
/// tokio runtime for the dashboard to start; without one the dashboard is
/// skipped with a warning and tracing still works.
pub fn init(config: Config) -> Arc<Collector> {
    let _guard = INIT_LOCK.lock().expect("init lock poisoned");
    install(config).collector.clone()
}

/// The middleware layer bound to the process-wide collector, initialising
/// defaults first if [`init`] has not run.
pub fn layer() -> TraceLayer {
    let globals = ensure_init();
    TraceLayer::new(globals.collector.clone(), globals.config.clone())
}

/// The process-wide collector, if initialised.
pub fn collector() -> Option<Arc<Collector>> {
    GLOBALS.load_full().map(|g| g.collector.clone())
}

/// The process-wide configuration, if initialised.
pub fn config() -> Option<Arc<Config>> {
    GLOBALS.load_full().map(|g| g.config.clone())
}

fn ensure_init() -> Arc<Globals> {
    if let Some(globals) = GLOBALS.load_full() {
        return globals;
    }
    let _guard = INIT_LOCK.lock().expect("init lock poisoned");
    // Re-check under the lock so concurrent first users share one install.
    if let Some(globals) = GLOBALS.load_full() {
        return globals;
    }
    install(Config::default())
}

fn install(config: Config) -> Arc<Globals> {
    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!(field = error.field, message = %error.message, "invalid configuration");
        }
    }
    let config = Arc::new(config);
    let collector = Arc::new(Collector::new(config.clone()));
    let globals = Arc::new(Globals {
        collector: collector.clone(),
        config: config.clone(),
    });
    GLOBALS.store(Some(globals.clone()));

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(dashboard::serve(collector, config));
        }
        Err(_) => {
            tracing::warn!("xrayhq initialised outside a tokio runtime; dashboard not started");
        }
    }
    globals
}
