//! HTTP response building helpers

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::error::BridgeError;

pub type HttpResponse = Response<Full<Bytes>>;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn ok<T: Serialize>(body: &T) -> HttpResponse {
    json_response(StatusCode::OK, body)
}

pub fn created<T: Serialize>(body: &T) -> HttpResponse {
    json_response(StatusCode::CREATED, body)
}

pub fn not_found(message: &str) -> HttpResponse {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": message }))
}

pub fn bad_request(message: &str) -> HttpResponse {
    json_response(StatusCode::BAD_REQUEST, &serde_json::json!({ "error": message }))
}

pub fn conflict(message: &str) -> HttpResponse {
    json_response(StatusCode::CONFLICT, &serde_json::json!({ "error": message }))
}

pub fn method_not_allowed() -> HttpResponse {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({ "error": "Method not allowed" }),
    )
}

pub fn internal_error(message: &str) -> HttpResponse {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &serde_json::json!({ "error": message }),
    )
}

/// Map a service error onto a response. Internal failures are logged and
/// reported without detail.
pub fn from_error(err: &BridgeError) -> HttpResponse {
    match err {
        BridgeError::InvalidInput(msg) => bad_request(msg),
        BridgeError::NotFound(msg) => not_found(msg),
        BridgeError::Conflict(msg) => conflict(msg),
        other => {
            error!(error = %other, "Request failed");
            internal_error("internal error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            from_error(&BridgeError::InvalidInput("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            from_error(&BridgeError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            from_error(&BridgeError::Conflict("dup".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            from_error(&BridgeError::Upstream("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
