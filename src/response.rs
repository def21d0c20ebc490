//! Outgoing HTTP response type.
//!
//! Locally generated responses are small plain-text bodies; proxied responses
//! wrap the upstream's streaming body unchanged.

use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};

use crate::body::{self, Body};

const TEXT_PLAIN: &str = "text/plain";

/// An outgoing HTTP response.
///
/// ```rust
/// use http::StatusCode;
/// use revproxy::Response;
///
/// Response::text(StatusCode::OK, "OK");
/// Response::status(StatusCode::NO_CONTENT);
/// Response::builder()
///     .status(StatusCode::CREATED)
///     .header("location", "/users/42")
///     .text("created");
/// ```
pub struct Response {
    inner: http::Response<Body>,
}

impl Response {
    /// `text/plain` body with the given status.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::builder().status(status).text(body)
    }

    /// Response with no body.
    pub fn status(code: StatusCode) -> Self {
        Self::builder().status(code).body(body::empty())
    }

    /// The fixed reply for request-time evaluation failures.
    pub fn internal_error() -> Self {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    /// The fixed reply of a route whose verb failed to compile.
    pub fn bad_gateway() -> Self {
        Self::text(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: HeaderMap::new(), status: StatusCode::OK }
    }

    pub fn from_http(inner: http::Response<Body>) -> Self {
        Self { inner }
    }

    pub fn status_code(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn into_inner(self) -> http::Response<Body> {
        self.inner
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `200 OK`.
pub struct ResponseBuilder {
    headers: HeaderMap,
    status: StatusCode,
}

impl ResponseBuilder {
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code;
        self
    }

    /// Adds a header. Names or values that are not valid HTTP are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.append(name, value);
        }
        self
    }

    /// Terminate with a `text/plain` body.
    pub fn text(mut self, body: impl Into<String>) -> Response {
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        self.body(body::full(body.into()))
    }

    pub fn body(self, body: Body) -> Response {
        let mut inner = http::Response::new(body);
        *inner.status_mut() = self.status;
        *inner.headers_mut() = self.headers;
        Response { inner }
    }
}
