//! Dispatcher error responses.
//!
//! Every refusal the dispatcher can issue maps to one of four error
//! kinds. Clients get a small JSON body, and an `X-Proxy-Error` header
//! lets monitoring tell engine refusals apart from upstream output.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error kinds the dispatcher surfaces to clients.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchErrorCode {
    /// No configured backend matched the request.
    NoBackendMatch,
    /// The matched backend is administratively inactive.
    BackendInactive,
    /// The matched backend is missing its host or path mapping.
    BackendMisconfigured,
    /// The upstream failed before response headers were sent.
    UpstreamUnavailable,
}

impl DispatchErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchErrorCode::NoBackendMatch => StatusCode::NOT_FOUND,
            DispatchErrorCode::BackendInactive => StatusCode::FORBIDDEN,
            DispatchErrorCode::BackendMisconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value for the `X-Proxy-Error` header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DispatchErrorCode::NoBackendMatch => "NO_BACKEND_MATCH",
            DispatchErrorCode::BackendInactive => "BACKEND_INACTIVE",
            DispatchErrorCode::BackendMisconfigured => "BACKEND_MISCONFIGURED",
            DispatchErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
        }
    }
}

/// Wire shape of a dispatcher error.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: DispatchErrorCode,
    message: &'a str,
    status: u16,
}

/// Build the JSON refusal for `code`.
pub fn json_error_response(
    code: DispatchErrorCode,
    message: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let payload = serde_json::to_vec(&ErrorBody {
        code,
        message,
        status: code.status_code().as_u16(),
    })
    .unwrap_or_default();

    let mut response = Response::new(
        Full::new(Bytes::from(payload))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-proxy-error", HeaderValue::from_static(code.as_header_value()));
    response
}
