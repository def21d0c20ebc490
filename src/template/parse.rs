//! Builds the node tree from lexed items.

use std::vec::IntoIter;

use super::ParseError;
use super::exec::is_builtin;
use super::lex::{Item, Tok};

#[derive(Debug)]
pub(crate) enum Node {
    Text(String),
    Action(Pipeline),
    If(Branch),
    With(Branch),
}

/// Shared shape of `if` and `with`: `else if` / `else with` chains nest in
/// `otherwise`.
#[derive(Debug)]
pub(crate) struct Branch {
    pub pipe: Pipeline,
    pub then: Vec<Node>,
    pub otherwise: Vec<Node>,
}

#[derive(Debug)]
pub(crate) struct Pipeline {
    pub line: usize,
    pub decl: Option<Decl>,
    pub cmds: Vec<Cmd>,
}

#[derive(Debug)]
pub(crate) struct Decl {
    pub name: String,
    /// `:=` when true, `=` otherwise.
    pub declare: bool,
}

#[derive(Debug)]
pub(crate) struct Cmd {
    pub args: Vec<Operand>,
}

#[derive(Debug)]
pub(crate) enum Operand {
    Str(String),
    Int(i64),
    Bool(bool),
    Dot,
    Field(Vec<String>),
    Var(String, Vec<String>),
    Func(String),
    Sub(Pipeline),
}

enum End {
    Eof,
    End,
    Else(usize, Vec<Tok>),
}

pub(crate) struct Parser<'f> {
    items: IntoIter<Item>,
    known: &'f dyn Fn(&str) -> bool,
    /// Variables in scope, innermost last. `$` is always present.
    scope: Vec<String>,
}

impl<'f> Parser<'f> {
    pub(crate) fn new(items: Vec<Item>, known: &'f dyn Fn(&str) -> bool) -> Self {
        Self { items: items.into_iter(), known, scope: vec![String::new()] }
    }

    pub(crate) fn parse(mut self) -> Result<Vec<Node>, ParseError> {
        match self.list()? {
            (nodes, End::Eof) => Ok(nodes),
            (_, End::End) => Err(ParseError::new(0, "unexpected {{end}}")),
            (_, End::Else(line, _)) => Err(ParseError::new(line, "unexpected {{else}}")),
        }
    }

    fn list(&mut self) -> Result<(Vec<Node>, End), ParseError> {
        let mut nodes = Vec::new();
        while let Some(item) = self.items.next() {
            let (line, toks) = match item {
                Item::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Item::Action { line, toks } => (line, toks),
            };

            match toks.first() {
                Some(Tok::Ident(kw)) if kw == "end" => {
                    if toks.len() > 1 {
                        return Err(ParseError::new(line, "unexpected tokens after end"));
                    }
                    return Ok((nodes, End::End));
                }
                Some(Tok::Ident(kw)) if kw == "else" => {
                    return Ok((nodes, End::Else(line, toks[1..].to_vec())));
                }
                Some(Tok::Ident(kw)) if kw == "if" => {
                    nodes.push(Node::If(self.branch(line, &toks[1..], "if")?));
                }
                Some(Tok::Ident(kw)) if kw == "with" => {
                    nodes.push(Node::With(self.branch(line, &toks[1..], "with")?));
                }
                Some(Tok::Ident(kw)) if is_unsupported_keyword(kw) => {
                    return Err(ParseError::new(line, format!("{{{{{kw}}}}} is not supported")));
                }
                _ => nodes.push(Node::Action(self.pipeline(line, &toks)?)),
            }
        }
        Ok((nodes, End::Eof))
    }

    /// Parses `if`/`with` after its keyword, through the matching `end`.
    fn branch(&mut self, line: usize, toks: &[Tok], keyword: &str) -> Result<Branch, ParseError> {
        let mark = self.scope.len();
        let pipe = self.pipeline(line, toks)?;
        if pipe.cmds.is_empty() {
            return Err(ParseError::new(line, format!("missing value for {keyword}")));
        }

        let inner = self.scope.len();
        let (then, end) = self.list()?;
        self.scope.truncate(inner);
        let otherwise = match end {
            End::Eof => return Err(ParseError::new(line, format!("unexpected EOF in {keyword}"))),
            End::End => Vec::new(),
            End::Else(else_line, rest) => match rest.first() {
                None => match self.list()? {
                    (nodes, End::End) => nodes,
                    (_, End::Eof) => {
                        return Err(ParseError::new(else_line, format!("unexpected EOF in {keyword}")));
                    }
                    (_, End::Else(l, _)) => {
                        return Err(ParseError::new(l, "expected end; found else"));
                    }
                },
                Some(Tok::Ident(kw)) if kw == "if" => {
                    vec![Node::If(self.branch(else_line, &rest[1..], "if")?)]
                }
                Some(Tok::Ident(kw)) if kw == "with" => {
                    vec![Node::With(self.branch(else_line, &rest[1..], "with")?)]
                }
                Some(_) => return Err(ParseError::new(else_line, "unexpected tokens after else")),
            },
        };
        self.scope.truncate(mark);
        Ok(Branch { pipe, then, otherwise })
    }

    fn pipeline(&mut self, line: usize, toks: &[Tok]) -> Result<Pipeline, ParseError> {
        let (decl, toks) = match toks {
            [Tok::Var(name, fields), Tok::Declare, rest @ ..] if fields.is_empty() => {
                (Some(Decl { name: name.clone(), declare: true }), rest)
            }
            [Tok::Var(name, fields), Tok::Assign, rest @ ..] if fields.is_empty() => {
                if !self.scope.contains(name) {
                    return Err(ParseError::new(line, format!("undefined variable ${name}")));
                }
                (Some(Decl { name: name.clone(), declare: false }), rest)
            }
            _ => (None, toks),
        };
        if decl.is_some() && toks.is_empty() {
            return Err(ParseError::new(line, "missing value for declaration"));
        }

        let mut pos = 0;
        let cmds = self.commands(line, toks, &mut pos)?;
        if pos != toks.len() {
            return Err(ParseError::new(line, "unexpected )"));
        }

        // Declared after the value is parsed: `$x := $x` refers to the outer one.
        if let Some(Decl { name, declare: true }) = &decl {
            self.scope.push(name.clone());
        }
        Ok(Pipeline { line, decl, cmds })
    }

    /// Reads `cmd | cmd ...` until the end of `toks` or an unmatched `)`.
    fn commands(&mut self, line: usize, toks: &[Tok], pos: &mut usize) -> Result<Vec<Cmd>, ParseError> {
        let mut cmds = Vec::new();
        let mut args = Vec::new();

        while let Some(tok) = toks.get(*pos) {
            *pos += 1;
            let operand = match tok {
                Tok::RParen => {
                    *pos -= 1;
                    break;
                }
                Tok::Pipe => {
                    if args.is_empty() {
                        return Err(ParseError::new(line, "missing command before |"));
                    }
                    cmds.push(Cmd { args: std::mem::take(&mut args) });
                    continue;
                }
                Tok::LParen => {
                    let inner = self.commands(line, toks, pos)?;
                    if toks.get(*pos) != Some(&Tok::RParen) {
                        return Err(ParseError::new(line, "unclosed left paren"));
                    }
                    *pos += 1;
                    if inner.is_empty() {
                        return Err(ParseError::new(line, "missing value in ()"));
                    }
                    Operand::Sub(Pipeline { line, decl: None, cmds: inner })
                }
                Tok::Str(s) => Operand::Str(s.clone()),
                Tok::Int(n) => Operand::Int(*n),
                Tok::Bool(b) => Operand::Bool(*b),
                Tok::Dot => Operand::Dot,
                Tok::Field(fields) => Operand::Field(fields.clone()),
                Tok::Var(name, fields) => {
                    if !self.scope.contains(name) {
                        return Err(ParseError::new(line, format!("undefined variable ${name}")));
                    }
                    Operand::Var(name.clone(), fields.clone())
                }
                Tok::Ident(name) => {
                    if !is_builtin(name) && !(self.known)(name) {
                        return Err(ParseError::new(line, format!("function {name:?} not defined")));
                    }
                    Operand::Func(name.clone())
                }
                Tok::Declare | Tok::Assign => {
                    return Err(ParseError::new(line, "unexpected declaration"));
                }
            };
            args.push(operand);
        }

        if !args.is_empty() {
            cmds.push(Cmd { args });
        } else if !cmds.is_empty() {
            return Err(ParseError::new(line, "missing command after |"));
        }
        Ok(cmds)
    }
}

fn is_unsupported_keyword(word: &str) -> bool {
    matches!(word, "range" | "define" | "template" | "block" | "break" | "continue" | "nil")
}
