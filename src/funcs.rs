//! Helper functions available in every template.
//!
//! All of them take and return string-encoded integers. A malformed number
//! counts as zero rather than failing the request.

use crate::template::{Funcs, Value};

/// `hostport`, `add` and `sub`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommonFuncs;

const NAMES: [&str; 3] = ["add", "hostport", "sub"];

impl Funcs for CommonFuncs {
    fn has(&self, name: &str) -> bool {
        NAMES.contains(&name)
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        let args: Vec<String> = args.into_iter().map(Value::into_string).collect();
        match (name, args.as_slice()) {
            ("hostport", [ip, port, offset]) => Ok(hostport(ip, port, offset).into()),
            ("add", [a, b]) => Ok(add(a, b).into()),
            ("sub", [a, b]) => Ok(sub(a, b).into()),
            ("hostport", _) => Err(arity(3, args.len())),
            ("add" | "sub", _) => Err(arity(2, args.len())),
            _ => Err(format!("function {name:?} not defined")),
        }
    }

    fn names(&self) -> Vec<&'static str> {
        NAMES.to_vec()
    }
}

fn arity(want: usize, got: usize) -> String {
    format!("wrong number of args: want {want} got {got}")
}

fn atoi(s: &str) -> i64 {
    s.parse().unwrap_or(0)
}

/// `base_ip:(base_port + offset)`, bracketing IPv6 hosts.
pub fn hostport(base_ip: &str, base_port: &str, offset: &str) -> String {
    let port = atoi(base_port).wrapping_add(atoi(offset));
    if base_ip.contains(':') {
        format!("[{base_ip}]:{port}")
    } else {
        format!("{base_ip}:{port}")
    }
}

pub fn add(a: &str, b: &str) -> String {
    atoi(a).wrapping_add(atoi(b)).to_string()
}

pub fn sub(a: &str, b: &str) -> String {
    atoi(a).wrapping_sub(atoi(b)).to_string()
}
