//! The configuration language.
//!
//! A small text-template language: literal text interleaved with `{{ ... }}`
//! actions that call functions, bind variables and branch with `if`/`with`.
//! The same engine runs the configuration document once at startup (with the
//! verbs from [`crate::compile`] in scope) and every nested URL template per
//! request (with only the [common functions](crate::funcs)).
//!
//! ```text
//! {{ with $path := "/items/{id:[0-9]+}" -}}
//!   {{ HandleFunc $path (Proxy "http://{{ .BASE_IP }}:8080/items/{{ .id }}") "GET" }}
//! {{- end }}
//! ```
//!
//! Parsing and evaluation are separate: [`Template::parse`] checks syntax and
//! that every function name exists, [`Template::execute`] renders against a
//! dot value and may fail on type errors.

mod exec;
mod lex;
mod parse;

use thiserror::Error;

pub use exec::Value;

use parse::{Node, Parser};

/// Syntax error in a template.
#[derive(Debug, Error)]
#[error("template: {name}:{line}: {message}")]
pub struct ParseError {
    pub name: String,
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self { name: String::new(), line, message: message.into() }
    }

    fn named(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }
}

/// Failure while executing a parsed template.
#[derive(Debug, Error)]
#[error("template: {name}:{line}: {message}")]
pub struct EvalError {
    pub name: String,
    pub line: usize,
    pub message: String,
}

impl EvalError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self { name: String::new(), line, message: message.into() }
    }
}

/// The functions callable from a template, besides the builtins.
pub trait Funcs {
    fn has(&self, name: &str) -> bool;

    /// Calls `name`. Errors abort the execution that made the call.
    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String>;

    /// Every name [`has`](Funcs::has) accepts, for diagnostics.
    fn names(&self) -> Vec<&'static str>;
}

/// A parsed template, reusable across any number of executions.
#[derive(Debug)]
pub struct Template {
    name: String,
    root: Vec<Node>,
}

impl Template {
    /// Parses `src`, rejecting calls to functions `funcs` does not provide.
    pub fn parse(name: &str, src: &str, funcs: &dyn Funcs) -> Result<Self, ParseError> {
        let known = |f: &str| funcs.has(f);
        let items = lex::lex(src).map_err(|e| e.named(name))?;
        let root = Parser::new(items, &known).parse().map_err(|e| e.named(name))?;
        Ok(Self { name: name.to_owned(), root })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders into `out`, appending. On error `out` holds partial output.
    pub fn execute<F: Funcs + ?Sized>(
        &self,
        out: &mut String,
        dot: Value,
        funcs: &mut F,
    ) -> Result<(), EvalError> {
        exec::Exec::new(funcs, out, dot)
            .run(&self.root)
            .map_err(|mut e| {
                e.name.clone_from(&self.name);
                e
            })
    }
}
