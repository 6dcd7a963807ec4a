//! Ring-buffer export: the full trace window as JSON (default) or CSV.

use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use super::DashboardState;
use crate::trace::RequestTrace;

#[derive(Deserialize)]
pub(crate) struct ExportQuery {
    format: Option<String>,
}

pub(crate) async fn export(
    State(state): State<DashboardState>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let requests = state.collector.all_requests();
    match query.format.as_deref() {
        Some("csv") => export_csv(&requests),
        _ => export_json(&requests),
    }
}

fn export_json(requests: &[std::sync::Arc<RequestTrace>]) -> Response {
    let refs: Vec<&RequestTrace> = requests.iter().map(|t| t.as_ref()).collect();
    match serde_json::to_string(&refs) {
        Ok(body) => (
            [
                (CONTENT_TYPE, "application/json"),
                (CONTENT_DISPOSITION, "attachment; filename=xrayhq-export.json"),
            ],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

fn export_csv(requests: &[std::sync::Arc<RequestTrace>]) -> Response {
    let mut out = String::new();
    write_csv_row(
        &mut out,
        &[
            "ID",
            "Method",
            "Path",
            "RoutePattern",
            "Status",
            "Latency(ms)",
            "TTFB(ms)",
            "RequestSize",
            "ResponseSize",
            "DBQueries",
            "TotalDBTime(ms)",
            "ExternalCalls",
            "TotalExtTime(ms)",
            "ClientIP",
            "UserAgent",
            "Timestamp",
            "Panicked",
        ],
    );
    for t in requests {
        write_csv_row(
            &mut out,
            &[
                &t.id,
                &t.method,
                &t.path,
                &t.route_pattern,
                &t.response_status.to_string(),
                &format!("{:.2}", t.latency.as_secs_f64() * 1000.0),
                &format!("{:.2}", t.ttfb.as_secs_f64() * 1000.0),
                &t.request_size.to_string(),
                &t.response_size.to_string(),
                &t.db_queries.len().to_string(),
                &format!("{:.2}", t.total_db_time.as_secs_f64() * 1000.0),
                &t.external_calls.len().to_string(),
                &format!("{:.2}", t.total_ext_time.as_secs_f64() * 1000.0),
                &t.client_ip,
                &t.user_agent,
                &t.started_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                &t.panicked.to_string(),
            ],
        );
    }

    (
        [
            (CONTENT_TYPE, "text/csv"),
            (CONTENT_DISPOSITION, "attachment; filename=xrayhq-export.csv"),
        ],
        out,
    )
        .into_response()
}

fn write_csv_row(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains(',') || field.contains('"') || field.contains('\n') {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push_str("\r\n");
}
