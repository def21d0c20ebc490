//! Reverse-proxy forwarding.
//!
//! The outbound request keeps the inbound method and body but takes its
//! scheme, authority and path from the resolved target URL. Its query string
//! is the target's query followed by the caller's, and its headers are only
//! the allow-listed inbound headers, each collapsed to one comma-joined
//! value.
//!
//! Targets may use `http` or `https`; TLS is handled by `hyper-rustls`.
//!
//! The upstream response is relayed with its status and end-to-end headers.
//! Its body streams through [`PooledBody`], which coalesces small upstream
//! frames in a buffer leased from the byte pool.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Uri};
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error, warn};
use url::{Position, Url};

use crate::body::{self, Body, BoxError};
use crate::pool::{BytePool, Lease};
use crate::request::Request;
use crate::response::Response;

/// Headers that describe one connection and are never relayed.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Shared by every proxy route of one server.
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    allow_headers: Vec<HeaderName>,
    bytes: BytePool,
}

impl Forwarder {
    /// Names that are not valid header names are dropped with a warning.
    pub fn new(allow_headers: &[String], bytes: BytePool) -> Self {
        let allow_headers = allow_headers
            .iter()
            .filter_map(|name| match HeaderName::try_from(name.as_str()) {
                Ok(name) => Some(name),
                Err(_) => {
                    warn!(header = %name, "ignoring invalid allow-listed header name");
                    None
                }
            })
            .collect();

        // Targets may be plain http or https; TLS trusts the webpki roots.
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            allow_headers,
            bytes,
        }
    }

    pub fn allow_headers(&self) -> &[HeaderName] {
        &self.allow_headers
    }

    /// Sends `req` to `target` and relays the answer.
    ///
    /// A target that cannot be expressed as a request URI yields 500; an
    /// upstream that cannot be reached yields 502.
    pub async fn forward(self: Arc<Self>, req: Request, target: &Url) -> Response {
        let uri = match outbound_uri(target, req.query()) {
            Ok(uri) => uri,
            Err(e) => {
                error!(target = %target, "url parse error: {e}");
                return Response::internal_error();
            }
        };

        let (head, inbound_body) = req.into_parts();
        let mut outbound = http::Request::new(inbound_body);
        *outbound.method_mut() = head.method.clone();
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = copy_allowed_headers(&head.headers, &self.allow_headers);

        debug!(method = %head.method, upstream = %outbound.uri(), "forwarding request");

        match self.client.request(outbound).await {
            Ok(res) => {
                let (mut parts, upstream) = res.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                let relay = PooledBody::new(body::boxed(upstream), self.bytes.get());
                Response::from_http(http::Response::from_parts(parts, body::boxed(relay)))
            }
            Err(e) => {
                error!(upstream = %target, "http: proxy error: {e}");
                Response::status(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// Target query first, then the caller's; `&` only when both are non-empty.
pub fn merge_query(target: Option<&str>, inbound: Option<&str>) -> Option<String> {
    let target = target.unwrap_or_default();
    let inbound = inbound.unwrap_or_default();
    match (target.is_empty(), inbound.is_empty()) {
        (true, true) => None,
        (false, true) => Some(target.to_owned()),
        (true, false) => Some(inbound.to_owned()),
        (false, false) => Some(format!("{target}&{inbound}")),
    }
}

/// The outbound URI: target scheme, authority and path plus the merged query.
pub fn outbound_uri(target: &Url, inbound_query: Option<&str>) -> Result<Uri, http::Error> {
    let authority = &target[Position::BeforeHost..Position::AfterPort];
    let mut path_and_query = target.path().to_owned();
    if let Some(query) = merge_query(target.query(), inbound_query) {
        path_and_query.push('?');
        path_and_query.push_str(&query);
    }
    Uri::builder()
        .scheme(target.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}

/// Copies only allow-listed headers; repeated values become one `a,b` value.
pub fn copy_allowed_headers(inbound: &HeaderMap, allow: &[HeaderName]) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(allow.len());
    for name in allow {
        let mut values = inbound.get_all(name).iter();
        let Some(first) = values.next() else { continue };

        let mut joined = first.as_bytes().to_vec();
        for value in values {
            joined.push(b',');
            joined.extend_from_slice(value.as_bytes());
        }
        match HeaderValue::from_bytes(&joined) {
            Ok(value) => {
                outbound.insert(name.clone(), value);
            }
            Err(e) => warn!(header = %name, "dropping unjoinable header: {e}"),
        }
    }
    outbound
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are connection-scoped too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

// ── Pooled relay body ─────────────────────────────────────────────────────────

/// Relays an upstream body, gathering small data frames into a pooled buffer.
///
/// Data is emitted when the buffer fills, when the upstream has nothing ready,
/// or at end of stream. Each flush copies the gathered bytes into a fresh
/// [`Bytes`], so small upstream frames cost one copy and reach the client as
/// fewer, larger writes. Frames at least as large as the buffer are passed on
/// as they are, without a copy. The lease goes back to the pool when this
/// body is dropped.
pub struct PooledBody {
    inner: Body,
    buf: Lease<Vec<u8>>,
    limit: usize,
    trailers: Option<HeaderMap>,
    done: bool,
}

impl PooledBody {
    pub fn new(inner: Body, buf: Lease<Vec<u8>>) -> Self {
        let limit = buf.capacity().max(1);
        Self { inner, buf, limit, trailers: None, done: false }
    }

    fn flush(&mut self) -> Frame<Bytes> {
        let chunk = Bytes::copy_from_slice(&self.buf);
        self.buf.clear();
        Frame::data(chunk)
    }
}

impl HttpBody for PooledBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        loop {
            if this.done {
                if !this.buf.is_empty() {
                    return Poll::Ready(Some(Ok(this.flush())));
                }
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Pending => {
                    if this.buf.is_empty() {
                        return Poll::Pending;
                    }
                    return Poll::Ready(Some(Ok(this.flush())));
                }
                Poll::Ready(None) => this.done = true,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) if this.buf.is_empty() && data.len() >= this.limit => {
                        return Poll::Ready(Some(Ok(Frame::data(data))));
                    }
                    Ok(data) => {
                        this.buf.extend_from_slice(&data);
                        if this.buf.len() >= this.limit {
                            return Poll::Ready(Some(Ok(this.flush())));
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            this.trailers = Some(trailers);
                            this.done = true;
                        }
                    }
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done && self.buf.is_empty() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        let buffered = self.buf.len() as u64;
        let inner = self.inner.size_hint();
        let mut hint = SizeHint::new();
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + buffered);
        }
        hint.set_lower(inner.lower() + buffered);
        hint
    }
}
