//! Evaluates a parsed template against a dot value and a function table.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use super::parse::{Branch, Cmd, Node, Operand, Pipeline};
use super::{EvalError, Funcs};
use crate::command::Verb;

/// A value flowing through a template.
#[derive(Clone, Debug)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    /// A context map; `.NAME` looks keys up in it.
    Map(Arc<HashMap<String, String>>),
    /// What a verb such as `Proxy` evaluates to.
    Command(Arc<Verb>),
}

impl Value {
    /// Empty strings, zero, `false` and empty maps are false.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Int(n) => *n != 0,
            Self::Bool(b) => *b,
            Self::Map(m) => !m.is_empty(),
            Self::Command(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Map(_) => "map",
            Self::Command(_) => "command",
        }
    }

    /// Text form used when a function wants a string argument.
    pub fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Map(m) => {
                let mut keys: Vec<_> = m.keys().collect();
                keys.sort();
                f.write_str("map[")?;
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{key}:{}", m[key])?;
                }
                f.write_str("]")
            }
            Self::Command(verb) => write!(f, "{{{} {}}}", verb.success(), verb.kind()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Self::Str(s.to_owned()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Self::Str(s) }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self { Self::Int(n) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Self::Bool(b) }
}

const BUILTINS: [&str; 6] = ["and", "eq", "ne", "not", "or", "print"];

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub(crate) struct Exec<'a, F: Funcs + ?Sized> {
    funcs: &'a mut F,
    out: &'a mut String,
    root: Value,
    vars: Vec<(String, Value)>,
}

impl<'a, F: Funcs + ?Sized> Exec<'a, F> {
    pub(crate) fn new(funcs: &'a mut F, out: &'a mut String, root: Value) -> Self {
        Self { funcs, out, root, vars: Vec::new() }
    }

    pub(crate) fn run(mut self, nodes: &[Node]) -> Result<(), EvalError> {
        let dot = self.root.clone();
        self.walk(&dot, nodes)
    }

    fn walk(&mut self, dot: &Value, nodes: &[Node]) -> Result<(), EvalError> {
        let mark = self.vars.len();
        for node in nodes {
            match node {
                Node::Text(text) => self.out.push_str(text),
                Node::Action(pipe) => {
                    let value = self.pipeline(dot, pipe)?;
                    if pipe.decl.is_none() {
                        let _ = write!(self.out, "{value}");
                    }
                }
                Node::If(branch) => self.branch(dot, branch, false)?,
                Node::With(branch) => self.branch(dot, branch, true)?,
            }
        }
        self.vars.truncate(mark);
        Ok(())
    }

    fn branch(&mut self, dot: &Value, branch: &Branch, rebind: bool) -> Result<(), EvalError> {
        let mark = self.vars.len();
        let value = self.pipeline(dot, &branch.pipe)?;
        let result = if value.truthy() {
            let inner = if rebind { value } else { dot.clone() };
            self.walk(&inner, &branch.then)
        } else {
            self.walk(dot, &branch.otherwise)
        };
        self.vars.truncate(mark);
        result
    }

    fn pipeline(&mut self, dot: &Value, pipe: &Pipeline) -> Result<Value, EvalError> {
        let mut value = None;
        for cmd in &pipe.cmds {
            value = Some(self.command(dot, cmd, value.take(), pipe.line)?);
        }
        let value = value.ok_or_else(|| EvalError::new(pipe.line, "empty pipeline"))?;

        if let Some(decl) = &pipe.decl {
            if decl.declare {
                self.vars.push((decl.name.clone(), value.clone()));
            } else {
                let slot = self
                    .vars
                    .iter_mut()
                    .rev()
                    .find(|(name, _)| *name == decl.name)
                    .ok_or_else(|| EvalError::new(pipe.line, format!("undefined variable ${}", decl.name)))?;
                slot.1 = value.clone();
            }
        }
        Ok(value)
    }

    fn command(&mut self, dot: &Value, cmd: &Cmd, piped: Option<Value>, line: usize) -> Result<Value, EvalError> {
        let (first, rest) = cmd
            .args
            .split_first()
            .ok_or_else(|| EvalError::new(line, "empty command"))?;

        let Operand::Func(name) = first else {
            if !rest.is_empty() || piped.is_some() {
                return Err(EvalError::new(line, "can't give argument to non-function"));
            }
            return self.operand(dot, first, line);
        };

        let mut args = Vec::with_capacity(rest.len() + 1);
        for operand in rest {
            args.push(self.operand(dot, operand, line)?);
        }
        args.extend(piped);

        if is_builtin(name) {
            builtin(name, args).map_err(|msg| EvalError::new(line, format!("{name}: {msg}")))
        } else {
            self.funcs
                .call(name, args)
                .map_err(|msg| EvalError::new(line, format!("error calling {name}: {msg}")))
        }
    }

    fn operand(&mut self, dot: &Value, operand: &Operand, line: usize) -> Result<Value, EvalError> {
        match operand {
            Operand::Str(s) => Ok(Value::Str(s.clone())),
            Operand::Int(n) => Ok(Value::Int(*n)),
            Operand::Bool(b) => Ok(Value::Bool(*b)),
            Operand::Dot => Ok(dot.clone()),
            Operand::Field(fields) => field_chain(dot.clone(), fields, line),
            Operand::Var(name, fields) => {
                let base = if name.is_empty() {
                    self.root.clone()
                } else {
                    self.vars
                        .iter()
                        .rev()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| EvalError::new(line, format!("undefined variable ${name}")))?
                };
                field_chain(base, fields, line)
            }
            Operand::Func(name) => self.command(
                dot,
                &Cmd { args: vec![Operand::Func(name.clone())] },
                None,
                line,
            ),
            Operand::Sub(pipe) => self.pipeline(dot, pipe),
        }
    }
}

/// A missing key yields the empty string so `{{ if .FLAG }}` works unset.
fn field_chain(mut value: Value, fields: &[String], line: usize) -> Result<Value, EvalError> {
    for field in fields {
        value = match &value {
            Value::Map(map) => Value::Str(map.get(field).cloned().unwrap_or_default()),
            other => {
                return Err(EvalError::new(
                    line,
                    format!("can't evaluate field {field} in type {}", other.type_name()),
                ));
            }
        };
    }
    Ok(value)
}

fn builtin(name: &str, args: Vec<Value>) -> Result<Value, String> {
    match name {
        "not" => match args.as_slice() {
            [v] => Ok(Value::Bool(!v.truthy())),
            _ => Err(format!("wrong number of args: want 1 got {}", args.len())),
        },
        "and" | "or" => {
            let want = name == "or";
            let mut last = None;
            for arg in args {
                if arg.truthy() == want {
                    return Ok(arg);
                }
                last = Some(arg);
            }
            last.ok_or_else(|| "wrong number of args: want at least 1 got 0".to_owned())
        }
        "eq" => {
            let mut args = args.into_iter();
            let first = args.next().ok_or("missing argument for comparison")?;
            let mut compared = false;
            for other in args {
                compared = true;
                if equal(&first, &other)? {
                    return Ok(Value::Bool(true));
                }
            }
            if compared { Ok(Value::Bool(false)) } else { Err("missing argument for comparison".into()) }
        }
        "ne" => match args.as_slice() {
            [a, b] => Ok(Value::Bool(!equal(a, b)?)),
            _ => Err(format!("wrong number of args: want 2 got {}", args.len())),
        },
        "print" => {
            let mut out = String::new();
            let mut prev_str = true;
            for (i, arg) in args.iter().enumerate() {
                let is_str = matches!(arg, Value::Str(_));
                if i > 0 && !is_str && !prev_str {
                    out.push(' ');
                }
                let _ = write!(out, "{arg}");
                prev_str = is_str;
            }
            Ok(Value::Str(out))
        }
        _ => Err("not a builtin".into()),
    }
}

fn equal(a: &Value, b: &Value) -> Result<bool, String> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x == y),
        (Value::Int(x), Value::Int(y)) => Ok(x == y),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        _ => Err(format!("incompatible types for comparison: {} and {}", a.type_name(), b.type_name())),
    }
}
