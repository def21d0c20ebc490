//! Path-dispatch table.
//!
//! Exact routes live in a radix tree ([`matchit`]) keyed by their shape, with
//! placeholder names replaced by positions so `/items/{id}` and
//! `/items/{name:[a-z]+}` share one node and are tried in registration order.
//! A `{name:regex}` placeholder matches one segment and the regex must match
//! that whole segment.
//!
//! Prefix routes are anchored regexes tried after the tree: the literal part
//! of the pattern is a plain string prefix, so `/static` also matches
//! `/static-v2/app.js`. The longest match wins, earlier registration on ties.
//!
//! An exact route always beats an overlapping prefix route. When some route
//! matched the path but none accepted the method the answer is 405.
//!
//! The table is built once and only read afterwards, so lookups take no lock.

use std::collections::HashMap;
use std::fmt;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::handler::{self, Handler, SharedHandler};
use crate::request::Request;
use crate::response::Response;

/// Default placeholder expression: one path segment.
const SEGMENT: &str = "[^/]+";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("invalid placeholder regex in {pattern:?}: {source}")]
    Regex { pattern: String, source: regex::Error },

    #[error("route {pattern:?} conflicts with an existing route: {source}")]
    Conflict { pattern: String, source: matchit::InsertError },
}

/// How a pattern is matched against the request path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternKind {
    Exact,
    Prefix,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exact => "route",
            Self::Prefix => "prefix",
        })
    }
}

/// Read-only view of an installed route, for diagnostics.
#[derive(Clone, Debug)]
pub struct RouteInfo {
    pub pattern: String,
    pub kind: PatternKind,
    pub methods: Vec<Method>,
    /// The compiled expression of a prefix route.
    pub regexp: Option<String>,
}

struct Route {
    info: RouteInfo,
    handler: SharedHandler,
    names: Vec<String>,
    /// Exact routes: one optional whole-segment constraint per placeholder.
    constraints: Vec<Option<Regex>>,
    /// Prefix routes: anchored at the start, captures named `v0`, `v1`, ...
    prefix: Option<Regex>,
}

impl Route {
    fn allows(&self, method: &Method) -> bool {
        self.info.methods.is_empty() || self.info.methods.contains(method)
    }
}

/// Outcome of a lookup.
pub(crate) enum Lookup {
    Found(SharedHandler, HashMap<String, String>),
    MethodNotAllowed,
    NotFound,
}

/// The application router.
///
/// ```rust
/// use http::{Method, StatusCode};
/// use revproxy::{Request, Response, Router};
///
/// let mut router = Router::new();
/// router
///     .handle("/items/{id:[0-9]+}", &[Method::GET], |req: Request| async move {
///         Response::text(StatusCode::OK, req.param("id").unwrap_or_default().to_owned())
///     })
///     .unwrap();
/// router
///     .handle_prefix("/static/", &[], |_req: Request| async { Response::text(StatusCode::OK, "asset") })
///     .unwrap();
/// ```
pub struct Router {
    routes: Vec<Route>,
    tree: MatchitRouter<usize>,
    /// Route ids per tree node, in registration order.
    slots: Vec<Vec<usize>>,
    shapes: HashMap<String, usize>,
    prefixes: Vec<usize>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            tree: MatchitRouter::new(),
            slots: Vec::new(),
            shapes: HashMap::new(),
            prefixes: Vec::new(),
        }
    }

    /// Routes requests whose path is exactly `pattern`. An empty `methods`
    /// slice accepts every method.
    pub fn handle(
        &mut self,
        pattern: &str,
        methods: &[Method],
        handler: impl Handler,
    ) -> Result<&mut Self, RouteError> {
        self.insert(PatternKind::Exact, pattern, methods, handler::share(handler))?;
        Ok(self)
    }

    /// Routes requests whose path starts with `pattern`.
    pub fn handle_prefix(
        &mut self,
        pattern: &str,
        methods: &[Method],
        handler: impl Handler,
    ) -> Result<&mut Self, RouteError> {
        self.insert(PatternKind::Prefix, pattern, methods, handler::share(handler))?;
        Ok(self)
    }

    pub(crate) fn insert(
        &mut self,
        kind: PatternKind,
        pattern: &str,
        methods: &[Method],
        handler: SharedHandler,
    ) -> Result<(), RouteError> {
        let parts = split_pattern(pattern)?;
        let names = parts.iter().filter_map(Part::name).map(str::to_owned).collect();
        let id = self.routes.len();

        let route = match kind {
            PatternKind::Exact => {
                let constraints = parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::Param { regex, .. } => Some(regex.map(|re| compile(pattern, &format!("^(?:{re})$")))),
                        Part::Literal(_) => None,
                    })
                    .map(Option::transpose)
                    .collect::<Result<_, _>>()?;

                let shape = tree_shape(&parts);
                let slot = match self.shapes.get(&shape) {
                    Some(slot) => *slot,
                    None => {
                        let slot = self.slots.len();
                        self.tree
                            .insert(shape.clone(), slot)
                            .map_err(|source| RouteError::Conflict { pattern: pattern.to_owned(), source })?;
                        self.shapes.insert(shape, slot);
                        self.slots.push(Vec::new());
                        slot
                    }
                };
                self.slots[slot].push(id);

                Route {
                    info: RouteInfo { pattern: pattern.to_owned(), kind, methods: methods.to_vec(), regexp: None },
                    handler,
                    names,
                    constraints,
                    prefix: None,
                }
            }
            PatternKind::Prefix => {
                let regex = compile(pattern, &prefix_regex(&parts))?;
                self.prefixes.push(id);
                Route {
                    info: RouteInfo {
                        pattern: pattern.to_owned(),
                        kind,
                        methods: methods.to_vec(),
                        regexp: Some(regex.as_str().to_owned()),
                    },
                    handler,
                    names,
                    constraints: Vec::new(),
                    prefix: Some(regex),
                }
            }
        };
        self.routes.push(route);
        Ok(())
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Lookup {
        let mut path_matched = false;

        if let Ok(matched) = self.tree.at(path) {
            let values: Vec<&str> = matched.params.iter().map(|(_, v)| v).collect();
            for &id in &self.slots[*matched.value] {
                let route = &self.routes[id];
                let fits = route
                    .constraints
                    .iter()
                    .zip(&values)
                    .all(|(constraint, value)| constraint.as_ref().is_none_or(|re| re.is_match(value)));
                if !fits {
                    continue;
                }
                path_matched = true;
                if route.allows(method) {
                    let params = route.names.iter().cloned().zip(values.iter().map(|v| (*v).to_owned())).collect();
                    return Lookup::Found(route.handler.clone(), params);
                }
            }
        }

        let mut best: Option<(usize, usize, HashMap<String, String>)> = None;
        for &id in &self.prefixes {
            let route = &self.routes[id];
            let Some(caps) = route.prefix.as_ref().and_then(|re| re.captures(path)) else {
                continue;
            };
            path_matched = true;
            if !route.allows(method) {
                continue;
            }
            let len = caps.get(0).map_or(0, |m| m.end());
            if best.as_ref().is_some_and(|(best_len, _, _)| *best_len >= len) {
                continue;
            }
            let params = route
                .names
                .iter()
                .enumerate()
                .filter_map(|(i, name)| caps.name(&format!("v{i}")).map(|m| (name.clone(), m.as_str().to_owned())))
                .collect();
            best = Some((len, id, params));
        }

        match best {
            Some((_, id, params)) => Lookup::Found(self.routes[id].handler.clone(), params),
            None if path_matched => Lookup::MethodNotAllowed,
            None => Lookup::NotFound,
        }
    }

    /// Routes one request to its handler.
    pub async fn dispatch(&self, req: Request) -> Response {
        match self.lookup(req.method(), req.path()) {
            Lookup::Found(handler, params) => handler.call(req.with_params(params)).await,
            Lookup::MethodNotAllowed => Response::status(StatusCode::METHOD_NOT_ALLOWED),
            Lookup::NotFound => Response::text(StatusCode::NOT_FOUND, "404 page not found"),
        }
    }

    /// Installed routes in registration order.
    pub fn routes(&self) -> impl Iterator<Item = &RouteInfo> {
        self.routes.iter().map(|r| &r.info)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Logs every route at debug level.
    pub fn inspect(&self) {
        for info in self.routes() {
            let methods: Vec<&str> = info.methods.iter().map(Method::as_str).collect();
            debug!(
                route = %info.pattern,
                kind = %info.kind,
                regexp = info.regexp.as_deref().unwrap_or(""),
                methods = %methods.join(","),
                "installed route",
            );
        }
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

// ── Pattern parsing ───────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Part<'a> {
    Literal(&'a str),
    Param { name: &'a str, regex: Option<&'a str> },
}

impl<'a> Part<'a> {
    fn name(&self) -> Option<&'a str> {
        match self {
            Self::Param { name, .. } => Some(*name),
            Self::Literal(_) => None,
        }
    }
}

/// Splits `/a/{id:[0-9]{2}}/b` into literals and placeholders. Braces inside
/// a placeholder's regex must balance.
fn split_pattern(pattern: &str) -> Result<Vec<Part<'_>>, RouteError> {
    let err = |reason: &str| RouteError::Pattern { pattern: pattern.to_owned(), reason: reason.to_owned() };
    if !pattern.starts_with('/') {
        return Err(err("must start with '/'"));
    }

    let mut parts = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find(['{', '}']) {
        if rest.as_bytes()[open] == b'}' {
            return Err(err("unbalanced braces"));
        }
        if open > 0 {
            parts.push(Part::Literal(&rest[..open]));
        }

        let mut depth = 0usize;
        let mut close = None;
        for (i, b) in rest.bytes().enumerate().skip(open) {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(|| err("unbalanced braces"))?;

        let inner = &rest[open + 1..close];
        let (name, regex) = match inner.split_once(':') {
            Some((name, regex)) => (name.trim(), Some(regex.trim())),
            None => (inner.trim(), None),
        };
        if name.is_empty() || !name.chars().all(|c| c == '_' || c.is_alphanumeric()) {
            return Err(err("placeholder names must be non-empty words"));
        }
        if regex.is_some_and(str::is_empty) {
            return Err(err("empty placeholder regex"));
        }
        parts.push(Part::Param { name, regex });
        rest = &rest[close + 1..];
    }
    if !rest.is_empty() {
        parts.push(Part::Literal(rest));
    }
    Ok(parts)
}

/// The radix-tree key: literals kept, placeholders renamed by position.
fn tree_shape(parts: &[Part<'_>]) -> String {
    let mut shape = String::new();
    let mut n = 0;
    for part in parts {
        match part {
            Part::Literal(text) => shape.push_str(text),
            Part::Param { .. } => {
                shape.push_str(&format!("{{p{n}}}"));
                n += 1;
            }
        }
    }
    shape
}

fn prefix_regex(parts: &[Part<'_>]) -> String {
    let mut re = String::from("^");
    let mut n = 0;
    for part in parts {
        match part {
            Part::Literal(text) => re.push_str(&regex::escape(text)),
            Part::Param { regex, .. } => {
                re.push_str(&format!("(?P<v{n}>{})", regex.unwrap_or(SEGMENT)));
                n += 1;
            }
        }
    }
    re
}

fn compile(pattern: &str, re: &str) -> Result<Regex, RouteError> {
    Regex::new(re).map_err(|source| RouteError::Regex { pattern: pattern.to_owned(), source })
}
