//! Server-rendered dashboard pages.
//!
//! The markup is deliberately plain: tables and links, a few status
//! classes, no client framework. The live page drives the SSE endpoint
//! with a handful of lines of inline script.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use serde::Deserialize;

use super::format::{
    encode_path, escape_html, format_bytes, format_date_time, format_duration, format_time,
    format_uptime, status_class, truncate_display,
};
use super::DashboardState;
use crate::metrics::RouteMetrics;
use crate::runtime;
use crate::trace::RequestTrace;

const STYLE: &str = "body{font-family:monospace;margin:2em;background:#111;color:#ddd}\
a{color:#6cf}table{border-collapse:collapse;margin:1em 0}td,th{border:1px solid #333;\
padding:4px 10px;text-align:left}nav a{margin-right:1em}\
.status-ok{color:#6f6}.status-info{color:#6cf}.status-warn{color:#fc6}.status-error{color:#f66}\
.health-ok{color:#6f6}.health-warning{color:#fc6}.health-critical{color:#f66}\
.severity-info{color:#6cf}.severity-warning{color:#fc6}.severity-critical{color:#f66}";

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>xrayhq · {title}</title>\
         <style>{STYLE}</style></head><body>\
         <nav><a href=\"/\">routes</a><a href=\"/live\">live</a><a href=\"/alerts\">alerts</a>\
         <a href=\"/system\">system</a><a href=\"/xrayhq/export?format=json\">export json</a>\
         <a href=\"/xrayhq/export?format=csv\">export csv</a></nav>\
         <h1>{title}</h1>{body}</body></html>"
    ))
}

#[derive(Deserialize)]
pub(crate) struct IndexQuery {
    sort: Option<String>,
}

pub(crate) async fn routes_index(
    State(state): State<DashboardState>,
    Query(query): Query<IndexQuery>,
) -> Html<String> {
    let sort = query.sort.as_deref().unwrap_or("hits");
    let mut routes = state.collector.routes();
    match sort {
        "route" => routes.sort_by(|a, b| a.pattern.cmp(&b.pattern)),
        "method" => routes.sort_by(|a, b| a.method.cmp(&b.method)),
        "avg" => routes.sort_by(|a, b| b.avg_latency().cmp(&a.avg_latency())),
        "p95" => routes.sort_by(|a, b| b.p95().cmp(&a.p95())),
        "p99" => routes.sort_by(|a, b| b.p99().cmp(&a.p99())),
        "errors" => routes.sort_by(|a, b| b.error_rate().total_cmp(&a.error_rate())),
        _ => {} // "hits": the collector already orders by total descending.
    }

    let mut body = format!(
        "<p>{} requests in buffer, {} alerts</p>\
         <table><tr>\
         <th><a href=\"/?sort=method\">method</a></th>\
         <th><a href=\"/?sort=route\">route</a></th>\
         <th><a href=\"/?sort=hits\">hits</a></th>\
         <th><a href=\"/?sort=avg\">avg</a></th>\
         <th><a href=\"/?sort=p95\">p95</a></th>\
         <th><a href=\"/?sort=p99\">p99</a></th>\
         <th><a href=\"/?sort=errors\">errors</a></th>\
         <th>status</th></tr>",
        state.collector.request_count(),
        state.collector.alerts().len(),
    );
    for rm in &routes {
        let pattern = if rm.pattern.is_empty() {
            "(unmatched)"
        } else {
            rm.pattern.as_str()
        };
        body.push_str(&format!(
            "<tr><td>{method}</td>\
             <td><a href=\"/route/{method}{link}\">{pattern}</a></td>\
             <td>{hits}</td><td>{avg}</td><td>{p95}</td><td>{p99}</td>\
             <td>{errors:.1}%</td><td class=\"health-{class}\">{status}</td></tr>",
            method = escape_html(&rm.method),
            link = escape_html(&encode_path(&rm.pattern)),
            pattern = escape_html(pattern),
            hits = rm.total_requests,
            avg = format_duration(rm.avg_latency()),
            p95 = format_duration(rm.p95()),
            p99 = format_duration(rm.p99()),
            errors = rm.error_rate(),
            class = health_suffix(rm),
            status = rm.status().as_str(),
        ));
    }
    body.push_str("</table>");
    page("routes", &body)
}

fn health_suffix(rm: &RouteMetrics) -> &'static str {
    match rm.status() {
        crate::metrics::RouteStatus::Healthy => "ok",
        crate::metrics::RouteStatus::Warning => "warning",
        crate::metrics::RouteStatus::Critical => "critical",
    }
}

pub(crate) async fn route_detail(
    State(state): State<DashboardState>,
    Path((method, pattern)): Path<(String, String)>,
) -> Result<Html<String>, StatusCode> {
    let pattern = format!("/{pattern}");
    let rm = state
        .collector
        .route(&method, &pattern)
        .ok_or(StatusCode::NOT_FOUND)?;

    let requests = state.collector.requests_for_route(&method, &pattern, 50);
    let mut slowest = requests.clone();
    slowest.sort_by(|a, b| b.latency.cmp(&a.latency));
    slowest.truncate(10);

    let mut status_dist: Vec<(u16, u64)> = rm.status_codes.iter().map(|(k, v)| (*k, *v)).collect();
    status_dist.sort_by_key(|(code, _)| *code);

    let mut body = format!(
        "<p>{hits} requests, avg {avg}, p50 {p50}, p95 {p95}, p99 {p99}, min {min}, max {max}, \
         error rate {errors:.1}%, avg db queries {avg_db:.1}</p>",
        hits = rm.total_requests,
        avg = format_duration(rm.avg_latency()),
        p50 = format_duration(rm.p50()),
        p95 = format_duration(rm.p95()),
        p99 = format_duration(rm.p99()),
        min = format_duration(rm.min()),
        max = format_duration(rm.max()),
        errors = rm.error_rate(),
        avg_db = rm.avg_db_queries,
    );

    body.push_str("<h2>status codes</h2><table><tr><th>code</th><th>count</th></tr>");
    for (code, count) in &status_dist {
        body.push_str(&format!(
            "<tr><td class=\"{}\">{code}</td><td>{count}</td></tr>",
            status_class(*code)
        ));
    }
    body.push_str("</table>");

    body.push_str("<h2>latency distribution</h2><table><tr><th>bucket</th><th>count</th></tr>");
    for (label, count) in latency_buckets(&rm.latencies) {
        body.push_str(&format!("<tr><td>{label}</td><td>{count}</td></tr>"));
    }
    body.push_str("</table>");

    body.push_str("<h2>slowest</h2>");
    body.push_str(&request_table(&slowest));
    body.push_str("<h2>recent</h2>");
    body.push_str(&request_table(&requests));

    Ok(page(&format!("{} {}", escape_html(&method), escape_html(&pattern)), &body))
}

/// Fixed-edge latency histogram: 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, >1s.
fn latency_buckets(latencies: &[Duration]) -> Vec<(&'static str, usize)> {
    const LABELS: [&str; 8] = [
        "<1ms", "1-5ms", "5-10ms", "10-50ms", "50-100ms", "100-500ms", "500ms-1s", ">1s",
    ];
    const EDGES: [Duration; 7] = [
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_millis(10),
        Duration::from_millis(50),
        Duration::from_millis(100),
        Duration::from_millis(500),
        Duration::from_secs(1),
    ];
    let mut counts = [0usize; 8];
    for l in latencies {
        let slot = EDGES.iter().position(|edge| l < edge).unwrap_or(7);
        counts[slot] += 1;
    }
    LABELS.into_iter().zip(counts).collect()
}

fn request_table(requests: &[std::sync::Arc<RequestTrace>]) -> String {
    let mut out = String::from(
        "<table><tr><th>time</th><th>method</th><th>path</th><th>status</th>\
         <th>latency</th><th>db</th><th>id</th></tr>",
    );
    for t in requests {
        out.push_str(&format!(
            "<tr><td>{time}</td><td>{method}</td><td>{path}</td>\
             <td class=\"{class}\">{status}</td><td>{latency}</td><td>{db}</td>\
             <td><a href=\"/request/{id}\">{id}</a></td></tr>",
            time = format_time(t.started_at),
            method = escape_html(&t.method),
            path = escape_html(&t.path),
            class = status_class(t.response_status),
            status = t.response_status,
            latency = format_duration(t.latency),
            db = t.db_queries.len(),
            id = escape_html(&t.id),
        ));
    }
    out.push_str("</table>");
    out
}

pub(crate) async fn request_detail(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Html<String>, StatusCode> {
    let t = state.collector.request_by_id(&id).ok_or(StatusCode::NOT_FOUND)?;

    let mut body = format!(
        "<table>\
         <tr><th>method / path</th><td>{method} {path}{query}</td></tr>\
         <tr><th>route</th><td>{route}</td></tr>\
         <tr><th>status</th><td class=\"{class}\">{status}</td></tr>\
         <tr><th>started</th><td>{started}</td></tr>\
         <tr><th>latency</th><td>{latency} (ttfb {ttfb}, handler {handler})</td></tr>\
         <tr><th>sizes</th><td>in {req_size} / out {resp_size}</td></tr>\
         <tr><th>client</th><td>{client} ({agent})</td></tr>\
         <tr><th>tasks</th><td>{tasks_before} \u{2192} {tasks_after}</td></tr>\
         <tr><th>alloc delta</th><td>{alloc}</td></tr>\
         </table>",
        method = escape_html(&t.method),
        path = escape_html(&t.path),
        query = if t.query_params.is_empty() {
            String::new()
        } else {
            format!("?{}", escape_html(&t.query_params))
        },
        route = escape_html(&t.route_pattern),
        class = status_class(t.response_status),
        status = t.response_status,
        started = format_date_time(t.started_at),
        latency = format_duration(t.latency),
        ttfb = format_duration(t.ttfb),
        handler = format_duration(t.handler_time),
        req_size = format_bytes(t.request_size),
        resp_size = format_bytes(t.response_size),
        client = escape_html(&t.client_ip),
        agent = escape_html(&t.user_agent),
        tasks_before = t.tasks_before,
        tasks_after = t.tasks_after,
        alloc = format_bytes(t.mem_alloc_after.saturating_sub(t.mem_alloc_before) as i64),
    );

    if t.panicked {
        body.push_str(&format!(
            "<h2 class=\"severity-critical\">panic</h2><p>{}</p><pre>{}</pre>",
            escape_html(t.panic_value.as_deref().unwrap_or("")),
            escape_html(&t.panic_stack),
        ));
    }

    if !t.alerts.is_empty() {
        body.push_str("<h2>alerts</h2><table><tr><th>kind</th><th>severity</th><th>message</th></tr>");
        for a in &t.alerts {
            body.push_str(&format!(
                "<tr><td>{}</td><td class=\"severity-{}\">{}</td><td>{}</td></tr>",
                escape_html(&a.kind),
                a.severity.as_str(),
                a.severity.as_str(),
                escape_html(&a.message),
            ));
        }
        body.push_str("</table>");
    }

    if !t.db_queries.is_empty() {
        body.push_str(&format!(
            "<h2>db queries ({} total, {})</h2><table><tr><th>query</th><th>duration</th><th>error</th></tr>",
            t.db_queries.len(),
            format_duration(t.total_db_time),
        ));
        for q in &t.db_queries {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&truncate_display(&q.query, 200)),
                format_duration(q.duration),
                escape_html(q.error.as_deref().unwrap_or("")),
            ));
        }
        body.push_str("</table>");
    }

    if !t.external_calls.is_empty() {
        body.push_str(&format!(
            "<h2>external calls ({})</h2><table><tr><th>call</th><th>status</th><th>duration</th></tr>",
            format_duration(t.total_ext_time),
        ));
        for c in &t.external_calls {
            body.push_str(&format!(
                "<tr><td>{} {}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&c.method),
                escape_html(&truncate_display(&c.url, 120)),
                c.status_code,
                format_duration(c.duration),
            ));
        }
        body.push_str("</table>");
    }

    if !t.redis_ops.is_empty() {
        body.push_str(&format!(
            "<h2>redis ops ({})</h2><table><tr><th>command</th><th>key</th><th>duration</th></tr>",
            format_duration(t.total_redis_time),
        ));
        for op in &t.redis_ops {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&op.command),
                escape_html(&op.key),
                format_duration(op.duration),
            ));
        }
        body.push_str("</table>");
    }

    if !t.mongo_ops.is_empty() {
        body.push_str(&format!(
            "<h2>mongo ops ({})</h2><table><tr><th>operation</th><th>collection</th><th>duration</th></tr>",
            format_duration(t.total_mongo_time),
        ));
        for op in &t.mongo_ops {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&op.operation),
                escape_html(&op.collection),
                format_duration(op.duration),
            ));
        }
        body.push_str("</table>");
    }

    if let Some(req_body) = &t.request_body {
        if !req_body.is_empty() {
            body.push_str(&format!(
                "<h2>request body</h2><pre>{}</pre>",
                escape_html(&truncate_display(&String::from_utf8_lossy(req_body), 4096)),
            ));
        }
    }
    if let Some(resp_body) = &t.response_body {
        if !resp_body.is_empty() {
            body.push_str(&format!(
                "<h2>response body</h2><pre>{}</pre>",
                escape_html(&truncate_display(&String::from_utf8_lossy(resp_body), 4096)),
            ));
        }
    }

    if !t.request_headers.is_empty() || !t.response_headers.is_empty() {
        body.push_str("<h2>headers</h2><table><tr><th>direction</th><th>name</th><th>value</th></tr>");
        for (name, value) in &t.request_headers {
            body.push_str(&format!(
                "<tr><td>req</td><td>{}</td><td>{}</td></tr>",
                escape_html(name),
                escape_html(value),
            ));
        }
        for (name, value) in &t.response_headers {
            body.push_str(&format!(
                "<tr><td>resp</td><td>{}</td><td>{}</td></tr>",
                escape_html(name),
                escape_html(value),
            ));
        }
        body.push_str("</table>");
    }

    Ok(page(&format!("request {}", escape_html(&t.id)), &body))
}

pub(crate) async fn live_tail(State(_state): State<DashboardState>) -> Html<String> {
    let body = "<p>streaming recorded requests; newest on top</p>\
        <table id=\"tail\"><tr><th>time</th><th>method</th><th>path</th>\
        <th>status</th><th>latency</th><th>db</th></tr></table>\
        <script>\
        const tail = document.getElementById('tail');\
        const source = new EventSource('/events');\
        source.onmessage = (e) => {\
          const t = JSON.parse(e.data);\
          const row = tail.insertRow(1);\
          row.innerHTML = `<td>${t.timestamp}</td><td>${t.method}</td>\
            <td><a href=\"/request/${t.id}\">${t.path}</a></td>\
            <td class=\"${t.statusClass}\">${t.status}</td>\
            <td>${t.latencyFmt}</td><td>${t.dbQueries}</td>`;\
          while (tail.rows.length > 101) tail.deleteRow(101);\
        };\
        </script>";
    page("live", body)
}

pub(crate) async fn alerts(State(state): State<DashboardState>) -> Html<String> {
    let mut alerts = state.collector.alerts();
    alerts.reverse(); // newest first

    let mut body = String::from(
        "<table><tr><th>time</th><th>kind</th><th>severity</th><th>route</th>\
         <th>message</th><th>request</th></tr>",
    );
    for a in &alerts {
        body.push_str(&format!(
            "<tr><td>{time}</td><td>{kind}</td><td class=\"severity-{sev}\">{sev}</td>\
             <td>{route}</td><td>{message}</td>\
             <td><a href=\"/request/{id}\">{id}</a></td></tr>",
            time = format_time(a.timestamp),
            kind = escape_html(&a.kind),
            sev = a.severity.as_str(),
            route = escape_html(&a.route_pattern),
            message = escape_html(&a.message),
            id = escape_html(&a.request_id),
        ));
    }
    body.push_str("</table>");
    page("alerts", &body)
}

pub(crate) async fn system(State(state): State<DashboardState>) -> Html<String> {
    let sample = runtime::sample();
    let config = &state.config;
    let body = format!(
        "<table>\
         <tr><th>uptime</th><td>{uptime}</td></tr>\
         <tr><th>requests in buffer</th><td>{requests}</td></tr>\
         <tr><th>routes</th><td>{routes}</td></tr>\
         <tr><th>live subscribers</th><td>{subscribers}</td></tr>\
         <tr><th>tasks alive</th><td>{tasks}</td></tr>\
         <tr><th>bytes allocated</th><td>{allocated}</td></tr>\
         <tr><th>mode</th><td>{mode}</td></tr>\
         <tr><th>buffer size</th><td>{buffer}</td></tr>\
         <tr><th>sampling rate</th><td>{sampling}</td></tr>\
         <tr><th>capture body / headers</th><td>{body_cap} / {header_cap}</td></tr>\
         <tr><th>slow query threshold</th><td>{slow_query}</td></tr>\
         <tr><th>slow route p95 threshold</th><td>{slow_route}</td></tr>\
         <tr><th>high error rate</th><td>{err_rate}%</td></tr>\
         <tr><th>n+1 threshold</th><td>{n_plus_one}</td></tr>\
         <tr><th>memory spike</th><td>{mem_spike}</td></tr>\
         <tr><th>latency reservoir cap</th><td>{latency_cap}</td></tr>\
         </table>",
        uptime = format_uptime(state.collector.uptime()),
        requests = state.collector.request_count(),
        routes = state.collector.route_count(),
        subscribers = state.collector.subscriber_count(),
        tasks = sample.tasks,
        allocated = format_bytes(sample.allocated as i64),
        mode = config.mode,
        buffer = config.buffer_size,
        sampling = config.sampling_rate,
        body_cap = config.capture_body,
        header_cap = config.capture_headers,
        slow_query = format_duration(config.slow_query_threshold()),
        slow_route = format_duration(config.slow_route_p95_threshold()),
        err_rate = config.high_error_rate_percent,
        n_plus_one = config.n_plus_one_threshold,
        mem_spike = format_bytes(config.memory_spike_bytes as i64),
        latency_cap = config.latency_cap,
    );
    page("system", &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_buckets_place_edges() {
        let latencies = [
            Duration::from_micros(500), // <1ms
            Duration::from_millis(3),   // 1-5ms
            Duration::from_millis(75),  // 50-100ms
            Duration::from_secs(2),     // >1s
        ];
        let buckets = latency_buckets(&latencies);
        assert_eq!(buckets[0], ("<1ms", 1));
        assert_eq!(buckets[1], ("1-5ms", 1));
        assert_eq!(buckets[4], ("50-100ms", 1));
        assert_eq!(buckets[7], (">1s", 1));
        assert_eq!(buckets.iter().map(|(_, c)| c).sum::<usize>(), 4);
    }
}
