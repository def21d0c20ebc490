//! Builds the routing table from a configuration document.
//!
//! The document is an ordinary template whose function table adds the
//! routing verbs to the common helpers:
//!
//! | Verb | Result |
//! |---|---|
//! | `HandleFunc path cmd [method...]` | installs an exact route, prints its status |
//! | `HandlePrefix pattern cmd [method...]` | installs a prefix route, prints its status |
//! | `Text status body` | a command answering with a fixed text body |
//! | `Proxy url_template` | a command forwarding to one rendered URL |
//! | `ProxyConsistent url_template...` | a command forwarding to a URL picked by hashing the request URI |
//!
//! Evaluation only records what to install. The router is assembled in a
//! second pass over the recorded routes, in document order, so the finished
//! table is never shared while it is still being written.

use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::{debug, error, info, trace};

use crate::command::{BackendSet, Command, Kind, RouteEnv, Verb};
use crate::context::KeyValue;
use crate::error::Error;
use crate::forward::Forwarder;
use crate::funcs::CommonFuncs;
use crate::pool::BufferPool;
use crate::router::{PatternKind, Router};
use crate::template::{Funcs, Template, Value};

/// The configuration used when the operator supplies none.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"
{{ with $path := "/port-balance/{id:[0-9]+}" -}}
  {{- with $url := "http://{{ hostport .BASE_IP .BASE_PORT .id }}/api/{{ .id }}" -}}
  {{ HandlePrefix $path (Proxy $url) }}
  {{- end -}}
{{- end }}
{{ with $path := "/consistent-hashing/{key}" -}}
  {{- $url1 := "http://{{ .BASE_IP }}:8081/{{ .key }}/" -}}
  {{- $url2 := "http://{{ .BASE_IP }}:8082/{{ .key }}/" -}}
  {{- $url3 := "http://{{ .BASE_IP }}:8083/{{ .key }}/" -}}
  {{ HandleFunc $path (ProxyConsistent $url1 $url2 $url3) }}
{{- end }}
{{ with $path := "/ok" -}}
  {{ HandleFunc $path (Text 200 "OK") }}
{{- end }}
{{ HandleFunc "/" (Proxy "http://www.google.com/") }}
"#;

const VERBS: [&str; 5] = ["HandleFunc", "HandlePrefix", "Proxy", "ProxyConsistent", "Text"];

/// One route recorded during evaluation.
struct PendingRoute {
    kind: PatternKind,
    pattern: String,
    methods: Vec<Method>,
    verb: Arc<Verb>,
}

/// The result of compiling a configuration document.
pub struct Compiled {
    pub router: Router,
    /// The rendered document: one install status line per route plus any
    /// literal text.
    pub output: String,
}

/// Function table of the outer document.
#[derive(Default)]
struct Registry {
    routes: Vec<PendingRoute>,
}

impl Funcs for Registry {
    fn has(&self, name: &str) -> bool {
        VERBS.contains(&name) || CommonFuncs.has(name)
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        match name {
            "HandleFunc" => self.install(PatternKind::Exact, args),
            "HandlePrefix" => self.install(PatternKind::Prefix, args),
            "Text" => text(args),
            "Proxy" => proxy(args),
            "ProxyConsistent" => Ok(proxy_consistent(args)),
            _ => CommonFuncs.call(name, args),
        }
    }

    fn names(&self) -> Vec<&'static str> {
        let mut names = VERBS.to_vec();
        names.extend(CommonFuncs.names());
        names
    }
}

impl Registry {
    fn install(&mut self, kind: PatternKind, args: Vec<Value>) -> Result<Value, String> {
        let got = args.len();
        let mut args = args.into_iter();
        let (Some(pattern), Some(cmd)) = (args.next(), args.next()) else {
            return Err(format!("wrong number of args: want at least 2 got {got}"));
        };
        let Value::Command(verb) = cmd else {
            return Err(format!("wrong type for value; expected command; got {}", cmd.type_name()));
        };
        let pattern = pattern.into_string();
        let methods = args.map(|m| method(&m.into_string())).collect::<Result<Vec<_>, _>>()?;

        let status = if verb.success() { "success" } else { "failure" };
        let line = format!("install({status}) {kind} {pattern} = {}", verb.kind());
        self.routes.push(PendingRoute { kind, pattern, methods, verb });
        Ok(line.into())
    }
}

fn method(name: &str) -> Result<Method, String> {
    Method::from_bytes(name.to_ascii_uppercase().as_bytes()).map_err(|_| format!("invalid http method {name:?}"))
}

fn text(args: Vec<Value>) -> Result<Value, String> {
    let [status, body]: [Value; 2] = args
        .try_into()
        .map_err(|args: Vec<Value>| format!("wrong number of args for Text: want 2 got {}", args.len()))?;
    let code = match &status {
        Value::Int(n) => Some(*n),
        Value::Str(s) => s.trim().parse().ok(),
        _ => None,
    };
    let status = code
        .and_then(|n| u16::try_from(n).ok())
        .and_then(|n| StatusCode::from_u16(n).ok())
        .ok_or_else(|| format!("invalid status code {status}"))?;

    Ok(Value::Command(Arc::new(Verb::Text { status, body: body.into_string() })))
}

fn proxy(args: Vec<Value>) -> Result<Value, String> {
    let [url]: [Value; 1] = args
        .try_into()
        .map_err(|args: Vec<Value>| format!("wrong number of args for Proxy: want 1 got {}", args.len()))?;
    let url = url.into_string();
    let verb = match Template::parse("proxy", &url, &CommonFuncs) {
        Ok(tpl) => Verb::Proxy(Arc::new(tpl)),
        Err(e) => {
            error!(url = %url, "proxy template parse error: {e}");
            Verb::Failed(Kind::Proxy)
        }
    };
    Ok(Value::Command(Arc::new(verb)))
}

fn proxy_consistent(args: Vec<Value>) -> Value {
    let urls: Vec<String> = args.into_iter().map(Value::into_string).collect();
    let verb = match BackendSet::parse(&urls) {
        Ok(set) => Verb::ProxyConsistent(Arc::new(set)),
        Err(e) => {
            error!("proxy-consistent template parse error: {e}");
            Verb::Failed(Kind::ProxyConsistent)
        }
    };
    Value::Command(Arc::new(verb))
}

/// Evaluates `src` against `kv` and installs every route it declares.
///
/// A document that does not parse or evaluate is an error; a route whose
/// nested URL template does not parse is installed anyway and answers 502.
pub fn compile(src: &str, kv: KeyValue, forwarder: Arc<Forwarder>, buffers: BufferPool) -> Result<Compiled, Error> {
    let src = src.trim();
    let mut registry = Registry::default();
    for name in registry.names() {
        debug!(func = name, "template func");
    }

    let tpl = Template::parse("config", src, &registry)?;
    trace!(template = src, "config template");

    let mut output = String::new();
    tpl.execute(&mut output, Value::Map(Arc::new(kv.clone())), &mut registry)?;

    let env = Arc::new(RouteEnv::new(kv, forwarder, buffers));
    let mut router = Router::new();
    for route in &registry.routes {
        let command = Command::build(&route.verb, &env);
        router.insert(route.kind, &route.pattern, &route.methods, command.handler())?;
    }
    router.inspect();
    info!("routes installed:\n{}", output.trim());

    Ok(Compiled { router, output })
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::body;
    use crate::pool::BytePool;
    use crate::request::Request;

    fn build(src: &str, kv: &[(&str, &str)]) -> Result<Compiled, Error> {
        let kv = kv.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        let forwarder = Arc::new(Forwarder::new(&[], BytePool::new(4, 64)));
        compile(src, kv, forwarder, BufferPool::new(4, 64))
    }

    async fn hit(router: &Router, method: Method, path: &str) -> (StatusCode, String) {
        let req = http::Request::builder().method(method).uri(path).body(body::empty()).unwrap();
        let res = router.dispatch(Request::from_http(req)).await.into_inner();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn text_route_answers() {
        let c = build(r#"{{ HandleFunc "/ok" (Text 200 "OK") }}"#, &[]).unwrap();
        assert_eq!(c.output, "install(success) route /ok = text");
        assert_eq!(hit(&c.router, Method::GET, "/ok").await, (StatusCode::OK, "OK".into()));
    }

    #[tokio::test]
    async fn each_handle_installs_one_route() {
        let src = r#"
            {{ HandleFunc "/a" (Text 200 "a") }}
            {{ HandleFunc "/b" (Text 200 "b") "post" "GET" }}
            {{ HandlePrefix "/c" (Text 200 "c") }}
        "#;
        let c = build(src, &[]).unwrap();
        assert_eq!(c.router.len(), 3);

        let b = c.router.routes().nth(1).unwrap();
        assert_eq!(b.methods, [Method::POST, Method::GET]);
        assert_eq!(hit(&c.router, Method::DELETE, "/b").await.0, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(hit(&c.router, Method::GET, "/c/d").await.1, "c");
    }

    #[tokio::test]
    async fn bad_nested_template_still_routes_with_bad_gateway() {
        let src = r#"{{ HandleFunc "/broken" (Proxy "http://{{ .HOST") }}
{{ HandleFunc "/ok" (Text 200 "OK") }}"#;
        let c = build(src, &[]).unwrap();
        assert!(c.output.starts_with("install(failure) route /broken = proxy"));
        assert_eq!(hit(&c.router, Method::GET, "/broken").await, (StatusCode::BAD_GATEWAY, "Bad Gateway".into()));
        assert_eq!(hit(&c.router, Method::GET, "/ok").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn exact_route_wins_over_prefix() {
        let src = r#"{{ HandlePrefix "/" (Text 200 "prefix") }}{{ HandleFunc "/ok" (Text 200 "exact") }}"#;
        let c = build(src, &[]).unwrap();
        assert_eq!(hit(&c.router, Method::GET, "/ok").await.1, "exact");
        assert_eq!(hit(&c.router, Method::GET, "/other").await.1, "prefix");
    }

    #[tokio::test]
    async fn overrides_feed_the_outer_document() {
        let src = r#"{{ HandleFunc .PATH (Text 201 .BODY) }}"#;
        let c = build(src, &[("PATH", "/v"), ("BODY", "hello")]).unwrap();
        assert_eq!(hit(&c.router, Method::GET, "/v").await, (StatusCode::CREATED, "hello".into()));
    }

    #[test]
    fn default_template_compiles() {
        let c = build(DEFAULT_CONFIG_TEMPLATE, &[("BASE_IP", "127.0.0.1"), ("BASE_PORT", "9000")]).unwrap();
        let lines: Vec<&str> = c.output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        assert_eq!(
            lines,
            [
                "install(success) prefix /port-balance/{id:[0-9]+} = proxy",
                "install(success) route /consistent-hashing/{key} = proxy-consistent",
                "install(success) route /ok = text",
                "install(success) route / = proxy",
            ],
        );
    }

    #[test]
    fn document_errors_are_fatal() {
        assert!(matches!(build("{{ Nope }}", &[]), Err(Error::Template(_))));
        assert!(matches!(build(r#"{{ Text 42 "x" }}"#, &[]), Err(Error::Eval(_))));
        assert!(matches!(build(r#"{{ HandleFunc "/x" "not a command" }}"#, &[]), Err(Error::Eval(_))));
        assert!(matches!(build(r#"{{ HandleFunc "/x" (Text 200 "x") "BAD METHOD" }}"#, &[]), Err(Error::Eval(_))));
        assert!(matches!(build(r#"{{ HandleFunc "x" (Text 200 "x") }}"#, &[]), Err(Error::Route(_))));
    }
}
