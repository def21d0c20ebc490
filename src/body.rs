//! The body type shared by inbound requests, outbound requests and responses.
//!
//! Everything is boxed into one type so a route can hand the inbound body
//! straight to the upstream client and relay the upstream body straight back,
//! with no buffering in between.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A streaming body of [`Bytes`] frames.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// Boxes any compatible body.
pub fn boxed<B>(body: B) -> Body
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> Body {
    boxed(Full::new(data.into()))
}

pub fn empty() -> Body {
    boxed(Empty::<Bytes>::new())
}
