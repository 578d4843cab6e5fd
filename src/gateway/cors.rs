//! CORS and request logging middleware for the gateway.

use axum::extract::Request;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::info;

/// Methods advertised to preflight requests.
pub const PREFLIGHT_METHODS: &str = "GET,HEAD,POST,PUT,DELETE";

/// Echo `Origin` back on every response; answer preflights directly.
///
/// A preflight is `OPTIONS` carrying both `Origin` and
/// `Access-Control-Request-Method`. It never reaches a backend.
pub async fn allow_cors(request: Request, next: Next) -> Response {
    let Some(origin) = request.headers().get(ORIGIN).cloned() else {
        return next.run(request).await;
    };

    if request.method() == Method::OPTIONS
        && request.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    {
        info!(path = %request.uri().path(), "Preflight request");
        return preflight();
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    response
}

fn preflight() -> Response {
    let any = HeaderValue::from_static("*");
    (
        StatusCode::OK,
        [
            (ACCESS_CONTROL_ALLOW_ORIGIN, any.clone()),
            (ACCESS_CONTROL_ALLOW_HEADERS, any),
            (
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(PREFLIGHT_METHODS),
            ),
        ],
    )
        .into_response()
}

pub async fn log_requests(request: Request, next: Next) -> Response {
    info!(method = %request.method(), url = %request.uri(), "Request");
    next.run(request).await
}
