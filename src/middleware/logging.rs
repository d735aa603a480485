//! Request logging middleware.
//!
//! Logs every admin request with method, path, status code and latency.
//! Balance-moving calls (any POST) are tagged so they stand out in the log.

use axum::{body::Body, http::Method, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

pub async fn request_logging_simple(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Health checks are noise
    if path == "/health" {
        return next.run(request).await;
    }

    let mutating = method == Method::POST;
    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            mutating,
            "Admin request failed (5xx)"
        );
    } else if status >= 400 {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            mutating,
            "Admin request rejected (4xx)"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            mutating,
            "Admin request completed"
        );
    }

    response
}
