//! One line per served request, in the combined log format.

use std::net::SocketAddr;

use chrono::{DateTime, FixedOffset, Local};
use garrison_http::{Request, Status};
use tracing::info;

/// Target used for access log events, so that filters can route them.
pub const ACCESS_TARGET: &str = "garrison::access";

/// Logs a completed request.
pub fn log_request(peer: SocketAddr, request: &Request, status: Status, size: usize) {
    let line = format_line(peer, request, status, size, Local::now().fixed_offset());
    info!(target: "garrison::access", "{line}");
}

/// `ADDR - - [date] "METHOD URI HTTP/M.m" STATUS SIZE "REFERER" "USER-AGENT"`
pub fn format_line(
    peer: SocketAddr,
    request: &Request,
    status: Status,
    size: usize,
    now: DateTime<FixedOffset>,
) -> String {
    let request_line = if request.method.is_empty() {
        "-".to_string()
    } else {
        let mut uri = request.uri.clone();
        for (i, param) in request.params.iter().enumerate() {
            uri.push(if i == 0 { '?' } else { '&' });
            uri.push_str(param);
        }
        format!("{} {uri} {}", request.method, request.version)
    };

    format!(
        "{} - - [{}] \"{request_line}\" {} {size} \"{}\" \"{}\"",
        peer.ip(),
        now.format("%d/%b/%Y:%T %z"),
        status.code(),
        or_dash(request.headers.get("referer")),
        or_dash(request.headers.get("user-agent")),
    )
}

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}
