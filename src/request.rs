//! Incoming HTTP request type.

use std::collections::HashMap;

use http::request::Parts;
use http::{HeaderMap, Method, Uri};

use crate::body::{self, Body, BoxError};

/// An incoming request plus the placeholders its route extracted.
pub struct Request {
    pub(crate) head: Parts,
    pub(crate) body: Body,
    pub(crate) params: HashMap<String, String>,
}

impl Request {
    /// Wraps an `http` request with no path parameters.
    pub fn from_http<B>(req: http::Request<B>) -> Self
    where
        B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (head, body) = req.into_parts();
        Self { head, body: body::boxed(body), params: HashMap::new() }
    }

    pub(crate) fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn query(&self) -> Option<&str> { self.head.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }

    /// Path plus query, as the client sent it.
    pub fn request_uri(&self) -> &str {
        self.head
            .uri
            .path_and_query()
            .map_or_else(|| self.head.uri.path(), |pq| pq.as_str())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub(crate) fn into_parts(self) -> (Parts, Body) {
        (self.head, self.body)
    }
}
