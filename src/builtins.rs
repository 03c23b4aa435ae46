// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::{Expr, Ref};
use crate::lexer::Span;
use crate::number::Number;
use crate::value::Value;

use std::collections::HashMap;

use anyhow::{bail, Result};
use lazy_static::lazy_static;

pub type BuiltinFcn = (fn(&Span, &[Ref<Expr>], &[Value]) -> Result<Value>, u8);

lazy_static! {
    pub static ref BUILTINS: HashMap<&'static str, BuiltinFcn> = {
        let mut m: HashMap<&'static str, BuiltinFcn> = HashMap::new();

        m.insert("length", (length, 1));
        m.insert("range", (range, 2));
        m.insert("keys", (keys, 1));
        m.insert("values", (values, 1));
        m.insert("concat", (concat, 2));
        m.insert("join", (join, 2));
        m.insert("split", (split, 2));
        m.insert("upper", (upper, 1));
        m.insert("lower", (lower, 1));
        m.insert("string", (string, 1));
        m.insert("contains", (contains, 2));
        m.insert("type", (type_name, 1));

        m
    };
}

fn ensure_args_count(
    span: &Span,
    fcn: &'static str,
    params: &[Ref<Expr>],
    args: &[Value],
    expected: usize,
) -> Result<()> {
    if args.len() != expected {
        let span = match params.len() > expected {
            true => params[expected].span(),
            false => span,
        };
        if expected == 1 {
            bail!(span.error(format!("`{fcn}` expects 1 argument").as_str()))
        } else {
            bail!(span.error(format!("`{fcn}` expects {expected} arguments").as_str()))
        }
    }
    Ok(())
}

fn length(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "length", params, args, 1)?;
    let n = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        _ => bail!(params[0]
            .span()
            .error("`length` requires a string, array or object argument")),
    };
    Ok(Value::from(n))
}

// Half-open integer range [from, to).
fn range(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "range", params, args, 2)?;
    let from = match args[0].as_i64() {
        Ok(v) => v,
        Err(_) => bail!(params[0].span().error("`range` requires integer arguments")),
    };
    let to = match args[1].as_i64() {
        Ok(v) => v,
        Err(_) => bail!(params[1].span().error("`range` requires integer arguments")),
    };
    let values: Vec<Value> = (from..to).map(Value::from).collect();
    Ok(Value::from(values))
}

fn keys(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "keys", params, args, 1)?;
    match &args[0] {
        Value::Object(o) => Ok(Value::from(o.keys().cloned().collect::<Vec<Value>>())),
        _ => bail!(params[0].span().error("`keys` requires an object argument")),
    }
}

fn values(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "values", params, args, 1)?;
    match &args[0] {
        Value::Object(o) => Ok(Value::from(o.values().cloned().collect::<Vec<Value>>())),
        _ => bail!(params[0]
            .span()
            .error("`values` requires an object argument")),
    }
}

fn concat(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "concat", params, args, 2)?;
    match (&args[0], &args[1]) {
        (Value::Array(a), Value::Array(b)) => {
            let mut out = (**a).clone();
            out.extend(b.iter().cloned());
            Ok(Value::from(out))
        }
        (Value::String(a), Value::String(b)) => {
            Ok(Value::String(format!("{a}{b}").into()))
        }
        _ => bail!(span.error("`concat` requires two arrays or two strings")),
    }
}

fn join(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "join", params, args, 2)?;
    let sep = match &args[1] {
        Value::String(s) => s.clone(),
        _ => bail!(params[1].span().error("`join` separator must be a string")),
    };
    match &args[0] {
        Value::Array(a) => {
            let mut parts = vec![];
            for v in a.iter() {
                match v {
                    Value::String(s) => parts.push(s.to_string()),
                    _ => bail!(params[0]
                        .span()
                        .error("`join` requires an array of strings")),
                }
            }
            Ok(Value::String(parts.join(&sep).into()))
        }
        _ => bail!(params[0].span().error("`join` requires an array argument")),
    }
}

fn split(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "split", params, args, 2)?;
    match (&args[0], &args[1]) {
        (Value::String(s), Value::String(sep)) => Ok(Value::from(
            s.split(sep.as_ref())
                .map(|p| Value::String(p.into()))
                .collect::<Vec<Value>>(),
        )),
        _ => bail!(span.error("`split` requires string arguments")),
    }
}

fn upper(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "upper", params, args, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::String(s.to_uppercase().into())),
        _ => bail!(params[0].span().error("`upper` requires a string argument")),
    }
}

fn lower(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "lower", params, args, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::String(s.to_lowercase().into())),
        _ => bail!(params[0].span().error("`lower` requires a string argument")),
    }
}

// Renders scalars without json quoting; containers render as json.
fn string(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "string", params, args, 1)?;
    let text = match &args[0] {
        Value::String(s) => s.to_string(),
        Value::Number(Number::Int(i)) => format!("{i}"),
        Value::Number(n) => format!("{:?}", n),
        Value::Bool(b) => format!("{b}"),
        Value::Null => "null".to_string(),
        v => v.to_string(),
    };
    Ok(Value::String(text.into()))
}

fn contains(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "contains", params, args, 2)?;
    let found = match (&args[0], &args[1]) {
        (Value::String(s), Value::String(needle)) => s.contains(needle.as_ref()),
        (Value::Array(a), v) => a.iter().any(|x| x == v),
        (Value::Object(o), k) => o.contains_key(k),
        _ => bail!(span.error("`contains` requires a string, array or object")),
    };
    Ok(Value::Bool(found))
}

fn type_name(span: &Span, params: &[Ref<Expr>], args: &[Value]) -> Result<Value> {
    ensure_args_count(span, "type", params, args, 1)?;
    Ok(Value::String(args[0].type_name().into()))
}
