//! Display formatting shared by the dashboard pages and the SSE stream.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Human-scaled duration: ns, then µs, ms, s.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{:.1}\u{3bc}s", nanos as f64 / 1_000.0);
    }
    if nanos < 1_000_000_000 {
        return format!("{:.1}ms", nanos as f64 / 1_000_000.0);
    }
    format!("{:.2}s", d.as_secs_f64())
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.format("%H:%M:%S%.3f").to_string()
}

pub fn format_date_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_bytes(b: i64) -> String {
    crate::alerts::format_bytes(b.max(0) as u64)
}

pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        return format!("{hours}h {minutes}m {seconds}s");
    }
    if minutes > 0 {
        return format!("{minutes}m {seconds}s");
    }
    format!("{seconds}s")
}

/// CSS class for a status code; also the `statusClass` field of SSE events.
pub fn status_class(code: u16) -> &'static str {
    match code {
        500.. => "status-error",
        400.. => "status-warn",
        300.. => "status-info",
        _ => "status-ok",
    }
}

/// Minimal HTML entity escaping for untrusted strings in page bodies.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn truncate_display(s: &str, n: usize) -> String {
    crate::alerts::truncate(s, n)
}

/// Percent-encodes the characters route patterns contain that are not
/// valid raw in a URI path (`{`, `}` from axum capture syntax, plus space).
pub fn encode_path(s: &str) -> String {
    s.replace('{', "%7B").replace('}', "%7D").replace(' ', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_pick_the_right_unit() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_micros(12)), "12.0\u{3bc}s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250.0ms");
        assert_eq!(format_duration(Duration::from_secs(3)), "3.00s");
    }

    #[test]
    fn uptime_collapses_zero_components() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(62)), "1m 2s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1h 2m 5s");
    }

    #[test]
    fn status_classes() {
        assert_eq!(status_class(200), "status-ok");
        assert_eq!(status_class(302), "status-info");
        assert_eq!(status_class(404), "status-warn");
        assert_eq!(status_class(503), "status-error");
    }

    #[test]
    fn escapes_html_entities() {
        assert_eq!(escape_html("<b>&\"x\"</b>"), "&lt;b&gt;&amp;&quot;x&quot;&lt;/b&gt;");
    }
}
