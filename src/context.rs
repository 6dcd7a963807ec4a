//! Ambient binding between a request's task and its in-flight trace.
//!
//! The middleware scopes the downstream handler inside a task-local holding
//! the current [`TraceHandle`]; recorders called from anywhere under that
//! scope find the trace without threading it through arguments. Outside a
//! scope (untraced request, sampled-out request, or a spawned child task)
//! every recorder is a silent no-op.

use std::sync::Arc;

use crate::trace::{DbQuery, ExternalCall, MongoOp, RedisOp, TraceHandle};

tokio::task_local! {
    static CURRENT_TRACE: Arc<TraceHandle>;
}

/// Runs `fut` with `handle` installed as the ambient trace.
pub(crate) async fn scope<F: std::future::Future>(handle: Arc<TraceHandle>, fut: F) -> F::Output {
    CURRENT_TRACE.scope(handle, fut).await
}

/// The trace bound to the current task, if any.
pub fn current_trace() -> Option<Arc<TraceHandle>> {
    CURRENT_TRACE.try_with(|handle| handle.clone()).ok()
}

/// Sets the matched route pattern on the current trace.
///
/// Routers that resolve the pattern after the middleware has recorded the
/// raw path call this from the handler (or an inner layer).
pub fn set_route_pattern(pattern: impl Into<String>) {
    let Some(handle) = current_trace() else {
        return;
    };
    let pattern = pattern.into();
    handle.with(|trace| trace.route_pattern = pattern);
}

/// Appends a database query to the current trace.
pub fn record_db_query(query: DbQuery) {
    let Some(handle) = current_trace() else {
        return;
    };
    handle.with(|trace| {
        trace.total_db_time += query.duration;
        trace.db_queries.push(query);
    });
}

/// Appends an outbound HTTP call to the current trace.
pub fn record_external_call(call: ExternalCall) {
    let Some(handle) = current_trace() else {
        return;
    };
    handle.with(|trace| {
        trace.total_ext_time += call.duration;
        trace.external_calls.push(call);
    });
}

/// Appends a key-value store command to the current trace.
pub fn record_redis_op(op: RedisOp) {
    let Some(handle) = current_trace() else {
        return;
    };
    handle.with(|trace| {
        trace.total_redis_time += op.duration;
        trace.redis_ops.push(op);
    });
}

/// Appends a document-store operation to the current trace.
pub fn record_mongo_op(op: MongoOp) {
    let Some(handle) = current_trace() else {
        return;
    };
    handle.with(|trace| {
        trace.total_mongo_time += op.duration;
        trace.mongo_ops.push(op);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::RequestTrace;
    use std::time::Duration;

    #[tokio::test]
    async fn recorders_are_noops_without_a_scope() {
        assert!(current_trace().is_none());
        record_db_query(DbQuery::new("SELECT 1", Duration::from_millis(1)));
        set_route_pattern("/nowhere");
    }

    #[tokio::test]
    async fn recorders_append_and_accumulate_inside_scope() {
        let handle = Arc::new(TraceHandle::new(RequestTrace::new("id", "GET", "/orders")));

        scope(handle.clone(), async {
            record_db_query(DbQuery::new("SELECT * FROM orders", Duration::from_millis(5)));
            record_db_query(DbQuery::new("SELECT * FROM items", Duration::from_millis(3)));
            record_redis_op(RedisOp::new("GET", "user:1", Duration::from_millis(1)));
            set_route_pattern("/orders/{id}");
        })
        .await;

        let trace = handle.take().unwrap();
        assert_eq!(trace.db_queries.len(), 2);
        assert_eq!(trace.total_db_time, Duration::from_millis(8));
        assert_eq!(trace.redis_ops.len(), 1);
        assert_eq!(trace.total_redis_time, Duration::from_millis(1));
        assert_eq!(trace.route_pattern, "/orders/{id}");
    }
}
