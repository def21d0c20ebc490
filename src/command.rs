//! Route actions.
//!
//! Evaluating a verb such as `Proxy "..."` produces a [`Verb`]: a plain
//! description of what the route should do, carrying its already-parsed URL
//! templates. Installing a route turns the verb into a [`Command`], which
//! pairs that description with a request handler bound to the server's
//! shared state.
//!
//! A verb whose nested template failed to parse is kept as
//! [`Verb::Failed`]; its route is still installed and answers 502.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::context::{self, KeyValue};
use crate::forward::Forwarder;
use crate::funcs::CommonFuncs;
use crate::handler::{self, Handler, SharedHandler};
use crate::pool::BufferPool;
use crate::request::Request;
use crate::response::Response;
use crate::ring::{HashRing, RingError};
use crate::template::{ParseError, Template, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Text,
    Proxy,
    ProxyConsistent,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Proxy => "proxy",
            Self::ProxyConsistent => "proxy-consistent",
        })
    }
}

/// What a route does, as evaluated from the configuration.
#[derive(Debug)]
pub enum Verb {
    Text { status: StatusCode, body: String },
    Proxy(Arc<Template>),
    ProxyConsistent(Arc<BackendSet>),
    /// A verb whose configuration was rejected; answers 502.
    Failed(Kind),
}

impl Verb {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Text { .. } => Kind::Text,
            Self::Proxy(_) => Kind::Proxy,
            Self::ProxyConsistent(_) => Kind::ProxyConsistent,
            Self::Failed(kind) => *kind,
        }
    }

    pub fn success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error("ring member {0:?} has no url template")]
    Unknown(String),
}

/// The backends of one `ProxyConsistent` route: a hash ring over the literal
/// URL templates plus the parsed template for each ring member.
#[derive(Debug)]
pub struct BackendSet {
    ring: HashRing,
    templates: HashMap<String, Arc<Template>>,
}

impl BackendSet {
    /// Parses every URL template. Duplicates collapse into one ring member.
    pub fn parse(urls: &[String]) -> Result<Self, ParseError> {
        let mut ring = HashRing::new();
        let mut templates = HashMap::with_capacity(urls.len());
        for (i, url) in urls.iter().enumerate() {
            if templates.contains_key(url) {
                continue;
            }
            let tpl = Template::parse(&format!("proxy-consistent:{i}"), url, &CommonFuncs)?;
            templates.insert(url.clone(), Arc::new(tpl));
            ring.add(url.as_str());
        }
        Ok(Self { ring, templates })
    }

    /// The member owning `key` and its URL template.
    pub fn pick(&self, key: &str) -> Result<(&str, &Template), PickError> {
        let member = self.ring.get(key)?;
        let tpl = self
            .templates
            .get(member)
            .ok_or_else(|| PickError::Unknown(member.to_owned()))?;
        Ok((member, tpl))
    }

    pub fn members(&self) -> &[String] {
        self.ring.members()
    }
}

/// Server state every route handler shares.
pub struct RouteEnv {
    pub(crate) kv: KeyValue,
    pub(crate) forwarder: Arc<Forwarder>,
    pub(crate) buffers: BufferPool,
}

impl RouteEnv {
    pub fn new(kv: KeyValue, forwarder: Arc<Forwarder>, buffers: BufferPool) -> Self {
        Self { kv, forwarder, buffers }
    }

    /// Renders `tpl` for one request and parses the result as the target URL.
    fn resolve(&self, tpl: &Template, params: &HashMap<String, String>) -> Result<Url, Response> {
        let vars = context::merge(&self.kv, params);
        let mut buf = self.buffers.get();
        if let Err(e) = tpl.execute(&mut buf, Value::Map(Arc::new(vars)), &mut CommonFuncs) {
            error!(template = tpl.name(), "url template error: {e}");
            return Err(Response::internal_error());
        }
        Url::parse(buf.as_str()).map_err(|e| {
            error!(url = buf.as_str(), "url parse error: {e}");
            Response::internal_error()
        })
    }

    async fn proxy(&self, tpl: &Template, req: Request) -> Response {
        match self.resolve(tpl, req.params()) {
            Ok(target) => Arc::clone(&self.forwarder).forward(req, &target).await,
            Err(res) => res,
        }
    }
}

/// An installed route action.
pub struct Command {
    kind: Kind,
    success: bool,
    handler: SharedHandler,
}

impl Command {
    pub fn new(kind: Kind, success: bool, handler: impl Handler) -> Self {
        Self { kind, success, handler: handler::share(handler) }
    }

    /// Binds `verb` to the shared server state.
    pub fn build(verb: &Verb, env: &Arc<RouteEnv>) -> Self {
        match verb {
            Verb::Text { status, body } => {
                let (status, body) = (*status, body.clone());
                Self::new(Kind::Text, true, move |_req: Request| {
                    let body = body.clone();
                    async move { Response::text(status, body) }
                })
            }
            Verb::Proxy(tpl) => {
                let (env, tpl) = (Arc::clone(env), Arc::clone(tpl));
                Self::new(Kind::Proxy, true, move |req: Request| {
                    let (env, tpl) = (Arc::clone(&env), Arc::clone(&tpl));
                    async move { env.proxy(&tpl, req).await }
                })
            }
            Verb::ProxyConsistent(set) => {
                let (env, set) = (Arc::clone(env), Arc::clone(set));
                Self::new(Kind::ProxyConsistent, true, move |req: Request| {
                    let (env, set) = (Arc::clone(&env), Arc::clone(&set));
                    async move {
                        let (member, tpl) = match set.pick(req.request_uri()) {
                            Ok(picked) => picked,
                            Err(e) => {
                                error!(uri = req.request_uri(), "consistent lookup failed: {e}");
                                return Response::internal_error();
                            }
                        };
                        debug!(uri = req.request_uri(), member, "consistent pick");
                        env.proxy(tpl, req).await
                    }
                })
            }
            Verb::Failed(kind) => Self::new(*kind, false, |_req: Request| async { Response::bad_gateway() }),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn handler(&self) -> SharedHandler {
        Arc::clone(&self.handler)
    }
}
