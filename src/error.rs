//! Unified error type.

use thiserror::Error;

use crate::router::RouteError;
use crate::template::{EvalError, ParseError};

/// The error type returned by revproxy's fallible operations.
///
/// Request-time failures (an unreachable upstream, a URL template that
/// renders garbage) are expressed as HTTP [`Response`](crate::Response)
/// values, not as `Error`s. This type surfaces startup failures: a
/// configuration document that does not compile, or a port that cannot be
/// bound.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Template(#[from] ParseError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Route(#[from] RouteError),

    /// `start` was called on a server that is not in the `Created` state.
    #[error("server already started")]
    AlreadyStarted,
}
