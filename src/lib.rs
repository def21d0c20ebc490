//! # revproxy
//!
//! A reverse-proxy gateway whose routing table is written in a small
//! template language and compiled once at startup.
//!
//! ## The configuration
//!
//! The configuration is a template. Evaluating it calls the routing verbs,
//! and every `HandleFunc` or `HandlePrefix` call installs one route:
//!
//! ```text
//! {{ with $path := "/consistent-hashing/{key}" -}}
//!   {{- $a := "http://{{ .BASE_IP }}:8081/{{ .key }}/" -}}
//!   {{- $b := "http://{{ .BASE_IP }}:8082/{{ .key }}/" -}}
//!   {{ HandleFunc $path (ProxyConsistent $a $b) }}
//! {{- end }}
//! {{ HandleFunc "/ok" (Text 200 "OK") }}
//! {{ HandlePrefix "/" (Proxy "http://{{ hostport .BASE_IP .BASE_PORT 1 }}/") }}
//! ```
//!
//! Operator values (`-v BASE_IP=10.0.0.1`) are the dot of the outer document.
//! The quoted URLs are templates of their own, rendered per request against
//! the operator values plus the placeholders the route captured.
//!
//! ## What happens per request
//!
//! - Router lookup: exact routes first, then the longest prefix route.
//! - `Text` answers directly.
//! - `Proxy` renders its URL and forwards the request there.
//! - `ProxyConsistent` hashes the request URI onto a ring of URL templates,
//!   so the same URI always reaches the same backend.
//!
//! A verb whose URL template does not parse still gets its route, which
//! answers `502 Bad Gateway`. A URL that fails to render or parse at request
//! time answers `500 Internal Server Error` to that caller only.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use revproxy::{KeyValue, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), revproxy::Error> {
//!     let server = Server::new(
//!         ServerOptions::new()
//!             .listen_addr("0.0.0.0:8080")
//!             .allow_headers(["x-request-id"])
//!             .write_timeout(Duration::from_secs(10)),
//!     );
//!     let mut kv = KeyValue::new();
//!     kv.insert("BASE_IP".into(), "10.0.0.1".into());
//!
//!     server.start(r#"{{ HandleFunc "/ok" (Text 200 "OK") }}"#, kv).await
//! }
//! ```

pub mod body;
pub mod command;
pub mod compile;
pub mod context;
pub mod forward;
pub mod funcs;
pub mod pool;
pub mod ring;
pub mod template;

mod error;
mod handler;
mod options;
mod request;
mod response;
mod router;
mod server;

pub use compile::{Compiled, DEFAULT_CONFIG_TEMPLATE, compile};
pub use context::KeyValue;
pub use error::Error;
pub use handler::Handler;
pub use options::ServerOptions;
pub use request::Request;
pub use response::{Response, ResponseBuilder};
pub use router::{PatternKind, RouteError, RouteInfo, Router};
pub use server::{Server, State};
