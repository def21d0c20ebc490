//! Route handlers.
//!
//! Every verb compiles to a closure `Fn(Request) -> impl Future<Output = Response>`.
//! The router keeps them side by side as [`SharedHandler`]s, so a request
//! costs one `Arc` clone, one virtual call and one boxed future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::Response;

/// The future a handler returns.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Answers a routed request.
///
/// Implemented for every `Fn(Request) -> impl Future<Output = Response>`
/// closure that can be shared across connections.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request) -> ResponseFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn call(&self, req: Request) -> ResponseFuture {
        Box::pin(self(req))
    }
}

/// A handler installed in the router and shared by every connection.
pub type SharedHandler = Arc<dyn Handler>;

pub(crate) fn share(handler: impl Handler) -> SharedHandler {
    Arc::new(handler)
}
