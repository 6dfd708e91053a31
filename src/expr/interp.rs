//! Tree-walking interpreter over the JSON value domain.
//!
//! Values are `serde_json::Value` plus transient function values produced by
//! arrow expressions; a function escaping to the top level is a type error.
//! Numbers are computed as f64 and re-materialised as integer JSON numbers
//! when integral, so `6/2` and `3` surface identically. Non-finite results
//! (division by zero, overflow) are type errors rather than JS infinities,
//! which the JSON domain cannot represent.
//!
//! The interpreter has no clock, no filesystem, no network and no
//! randomness; everything it can reach comes in through the bindings.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Number, Value};

use super::EvalError;
use super::parser::{BinaryOp, Expr, UnaryOp};

const MAX_INT: f64 = 9_007_199_254_740_992.0; // 2^53

#[derive(Clone)]
enum Val {
    Json(Value),
    Fn(Closure),
    Ns(Ns),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Ns {
    Math,
    Json,
    Object,
    StringCast,
    NumberCast,
}

#[derive(Clone)]
struct Closure {
    params: Rc<Vec<String>>,
    body: Rc<Expr>,
    env: Env,
}

type Env = Option<Rc<EnvNode>>;

struct EnvNode {
    vars: HashMap<String, Val>,
    parent: Env,
}

pub(super) struct Interp<'a> {
    bindings: &'a Map<String, Value>,
}

impl<'a> Interp<'a> {
    pub(super) fn new(bindings: &'a Map<String, Value>) -> Self {
        Self { bindings }
    }

    pub(super) fn eval_root(&self, expr: &Expr) -> Result<Value, EvalError> {
        match self.eval(expr, &None)? {
            Val::Json(value) => Ok(value),
            Val::Fn(_) | Val::Ns(_) => Err(EvalError::type_err(
                "expression evaluated to a function, not a value",
            )),
        }
    }

    fn eval(&self, expr: &Expr, env: &Env) -> Result<Val, EvalError> {
        match expr {
            Expr::Null => Ok(Val::Json(Value::Null)),
            Expr::Bool(b) => Ok(Val::Json(Value::Bool(*b))),
            Expr::Number(n) => Ok(Val::Json(num_val(*n)?)),
            Expr::Str(s) => Ok(Val::Json(Value::String(s.clone()))),
            Expr::Array(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(self.eval_json(element, env)?);
                }
                Ok(Val::Json(Value::Array(out)))
            }
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval_json(value, env)?);
                }
                Ok(Val::Json(Value::Object(map)))
            }
            Expr::Ident(name) => self.lookup(name, env),
            Expr::Member { object, property } => {
                let object = self.eval(object, env)?;
                self.member(object, property)
            }
            Expr::Index { object, index } => {
                let object = self.eval_json(object, env)?;
                let index = self.eval_json(index, env)?;
                self.index(object, index)
            }
            Expr::Unary { op, operand } => {
                let operand = self.eval_json(operand, env)?;
                match op {
                    UnaryOp::Not => Ok(Val::Json(Value::Bool(!truthy(&operand)))),
                    UnaryOp::Neg => Ok(Val::Json(num_val(-to_number(&operand)?)?)),
                }
            }
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, env),
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.eval_json(cond, env)?;
                if truthy(&cond) {
                    self.eval(then, env)
                } else {
                    self.eval(otherwise, env)
                }
            }
            Expr::Arrow { params, body } => Ok(Val::Fn(Closure {
                params: Rc::new(params.clone()),
                body: Rc::new((**body).clone()),
                env: env.clone(),
            })),
            Expr::Call { callee, args } => self.call(callee, args, env),
        }
    }

    /// Evaluate and require a plain JSON value.
    fn eval_json(&self, expr: &Expr, env: &Env) -> Result<Value, EvalError> {
        match self.eval(expr, env)? {
            Val::Json(value) => Ok(value),
            Val::Fn(_) | Val::Ns(_) => {
                Err(EvalError::type_err("a function is not a value here"))
            }
        }
    }

    fn lookup(&self, name: &str, env: &Env) -> Result<Val, EvalError> {
        let mut node = env.as_deref();
        while let Some(scope) = node {
            if let Some(value) = scope.vars.get(name) {
                return Ok(value.clone());
            }
            node = scope.parent.as_deref();
        }
        if let Some(value) = self.bindings.get(name) {
            return Ok(Val::Json(value.clone()));
        }
        match name {
            "Math" => Ok(Val::Ns(Ns::Math)),
            "JSON" => Ok(Val::Ns(Ns::Json)),
            "Object" => Ok(Val::Ns(Ns::Object)),
            "String" => Ok(Val::Ns(Ns::StringCast)),
            "Number" => Ok(Val::Ns(Ns::NumberCast)),
            _ => Err(EvalError::UnknownIdentifier(name.to_string())),
        }
    }

    fn member(&self, object: Val, property: &str) -> Result<Val, EvalError> {
        match object {
            Val::Json(Value::Object(map)) => {
                Ok(Val::Json(map.get(property).cloned().unwrap_or(Value::Null)))
            }
            Val::Json(Value::String(s)) if property == "length" => {
                Ok(Val::Json(Value::from(s.chars().count() as i64)))
            }
            Val::Json(Value::Array(a)) if property == "length" => {
                Ok(Val::Json(Value::from(a.len() as i64)))
            }
            Val::Json(Value::Null) => Err(EvalError::type_err(format!(
                "cannot read property '{property}' of null"
            ))),
            Val::Json(other) => Err(EvalError::type_err(format!(
                "no property '{property}' on {}",
                type_name(&other)
            ))),
            Val::Fn(_) | Val::Ns(_) => Err(EvalError::type_err(format!(
                "'{property}' is not a readable property"
            ))),
        }
    }

    fn index(&self, object: Value, index: Value) -> Result<Val, EvalError> {
        let value = match (&object, &index) {
            (Value::Object(map), Value::String(key)) => {
                map.get(key).cloned().unwrap_or(Value::Null)
            }
            (Value::Array(a), Value::Number(_)) => {
                let i = to_number(&index)?;
                if i.fract() != 0.0 || i < 0.0 {
                    Value::Null
                } else {
                    a.get(i as usize).cloned().unwrap_or(Value::Null)
                }
            }
            (Value::String(s), Value::Number(_)) => {
                let i = to_number(&index)?;
                if i.fract() != 0.0 || i < 0.0 {
                    Value::Null
                } else {
                    s.chars()
                        .nth(i as usize)
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null)
                }
            }
            _ => {
                return Err(EvalError::type_err(format!(
                    "cannot index {} with {}",
                    type_name(&object),
                    type_name(&index)
                )));
            }
        };
        Ok(Val::Json(value))
    }

    fn binary(
        &self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        env: &Env,
    ) -> Result<Val, EvalError> {
        // Short-circuit operators return an operand value, JS-style, so
        // `shared.name || 'anonymous'` works as a default.
        if op == BinaryOp::Or {
            let lhs = self.eval_json(lhs, env)?;
            return if truthy(&lhs) {
                Ok(Val::Json(lhs))
            } else {
                self.eval(rhs, env)
            };
        }
        if op == BinaryOp::And {
            let lhs = self.eval_json(lhs, env)?;
            return if truthy(&lhs) {
                self.eval(rhs, env)
            } else {
                Ok(Val::Json(lhs))
            };
        }

        let lhs = self.eval_json(lhs, env)?;
        let rhs = self.eval_json(rhs, env)?;
        let value = match op {
            BinaryOp::Add => {
                if lhs.is_string() || rhs.is_string() {
                    Value::String(format!(
                        "{}{}",
                        to_display_string(&lhs),
                        to_display_string(&rhs)
                    ))
                } else {
                    num_val(to_number(&lhs)? + to_number(&rhs)?)?
                }
            }
            BinaryOp::Sub => num_val(to_number(&lhs)? - to_number(&rhs)?)?,
            BinaryOp::Mul => num_val(to_number(&lhs)? * to_number(&rhs)?)?,
            BinaryOp::Div => num_val(to_number(&lhs)? / to_number(&rhs)?)?,
            BinaryOp::Rem => num_val(to_number(&lhs)? % to_number(&rhs)?)?,
            BinaryOp::Eq => Value::Bool(loose_eq(&lhs, &rhs)),
            BinaryOp::NotEq => Value::Bool(!loose_eq(&lhs, &rhs)),
            BinaryOp::StrictEq => Value::Bool(strict_eq(&lhs, &rhs)),
            BinaryOp::StrictNotEq => Value::Bool(!strict_eq(&lhs, &rhs)),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                Value::Bool(compare(op, &lhs, &rhs)?)
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        Ok(Val::Json(value))
    }

    fn call(&self, callee: &Expr, args: &[Expr], env: &Env) -> Result<Val, EvalError> {
        // Method-call shape: receiver.method(args)
        if let Expr::Member { object, property } = callee {
            let receiver = self.eval(object, env)?;
            return match receiver {
                Val::Ns(Ns::Math) => {
                    let args = self.eval_args(args, env)?;
                    Ok(Val::Json(math_call(property, &args)?))
                }
                Val::Ns(Ns::Json) => {
                    let args = self.eval_args(args, env)?;
                    Ok(Val::Json(json_call(property, &args)?))
                }
                Val::Ns(Ns::Object) => {
                    let args = self.eval_args(args, env)?;
                    Ok(Val::Json(object_call(property, &args)?))
                }
                Val::Ns(Ns::StringCast | Ns::NumberCast) => Err(EvalError::type_err(format!(
                    "'{property}' is not a function"
                ))),
                Val::Json(Value::String(s)) => {
                    let args = self.eval_args(args, env)?;
                    Ok(Val::Json(string_method(&s, property, &args)?))
                }
                Val::Json(Value::Array(items)) => self.array_method(&items, property, args, env),
                Val::Json(Value::Object(map)) => {
                    // Mapping lookup: `secrets.get('API_KEY')`.
                    if property == "get" {
                        let args = self.eval_args(args, env)?;
                        let key = arg_str(&args, 0, "get")?;
                        Ok(Val::Json(map.get(&key).cloned().unwrap_or(Value::Null)))
                    } else {
                        Err(EvalError::type_err(format!(
                            "no method '{property}' on mapping"
                        )))
                    }
                }
                Val::Json(other) => Err(EvalError::type_err(format!(
                    "no method '{property}' on {}",
                    type_name(&other)
                ))),
                Val::Fn(_) => Err(EvalError::type_err("functions have no methods")),
            };
        }

        match self.eval(callee, env)? {
            Val::Fn(closure) => {
                let args = self.eval_vals(args, env)?;
                self.invoke(&closure, args)
            }
            Val::Ns(Ns::StringCast) => {
                let args = self.eval_args(args, env)?;
                let value = args.first().cloned().unwrap_or(Value::Null);
                Ok(Val::Json(Value::String(to_display_string(&value))))
            }
            Val::Ns(Ns::NumberCast) => {
                let args = self.eval_args(args, env)?;
                let value = args.first().cloned().unwrap_or(Value::Null);
                Ok(Val::Json(num_val(to_number(&value)?)?))
            }
            _ => Err(EvalError::type_err("value is not callable")),
        }
    }

    fn invoke(&self, closure: &Closure, args: Vec<Val>) -> Result<Val, EvalError> {
        let mut vars = HashMap::with_capacity(closure.params.len());
        for (i, param) in closure.params.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Val::Json(Value::Null));
            vars.insert(param.clone(), value);
        }
        let env = Some(Rc::new(EnvNode {
            vars,
            parent: closure.env.clone(),
        }));
        self.eval(&closure.body, &env)
    }

    fn eval_args(&self, args: &[Expr], env: &Env) -> Result<Vec<Value>, EvalError> {
        args.iter().map(|a| self.eval_json(a, env)).collect()
    }

    fn eval_vals(&self, args: &[Expr], env: &Env) -> Result<Vec<Val>, EvalError> {
        args.iter().map(|a| self.eval(a, env)).collect()
    }

    fn array_method(
        &self,
        items: &[Value],
        method: &str,
        args: &[Expr],
        env: &Env,
    ) -> Result<Val, EvalError> {
        // Callback-taking methods evaluate args lazily so closures survive.
        match method {
            "map" => {
                let callback = self.callback_arg(args, env, "map")?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.call_callback(&callback, item, i)?);
                }
                return Ok(Val::Json(Value::Array(out)));
            }
            "filter" => {
                let callback = self.callback_arg(args, env, "filter")?;
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if truthy(&self.call_callback(&callback, item, i)?) {
                        out.push(item.clone());
                    }
                }
                return Ok(Val::Json(Value::Array(out)));
            }
            "find" => {
                let callback = self.callback_arg(args, env, "find")?;
                for (i, item) in items.iter().enumerate() {
                    if truthy(&self.call_callback(&callback, item, i)?) {
                        return Ok(Val::Json(item.clone()));
                    }
                }
                return Ok(Val::Json(Value::Null));
            }
            "reduce" => {
                let callback = self.callback_arg(args, env, "reduce")?;
                let mut iter = items.iter();
                let mut acc = match args.get(1) {
                    Some(init) => self.eval_json(init, env)?,
                    None => iter
                        .next()
                        .cloned()
                        .ok_or_else(|| {
                            EvalError::type_err("reduce of empty array with no initial value")
                        })?,
                };
                for item in iter {
                    acc = match self.invoke(
                        &callback,
                        vec![Val::Json(acc), Val::Json(item.clone())],
                    )? {
                        Val::Json(value) => value,
                        _ => {
                            return Err(EvalError::type_err(
                                "reduce callback returned a function",
                            ));
                        }
                    };
                }
                return Ok(Val::Json(acc));
            }
            _ => {}
        }

        let args = self.eval_args(args, env)?;
        let value = match method {
            "join" => {
                let sep = match args.first() {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => to_display_string(other),
                    None => ",".to_string(),
                };
                Value::String(
                    items
                        .iter()
                        .map(to_display_string)
                        .collect::<Vec<_>>()
                        .join(&sep),
                )
            }
            "includes" => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                Value::Bool(items.iter().any(|item| strict_eq(item, &needle)))
            }
            "indexOf" => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                match items.iter().position(|item| strict_eq(item, &needle)) {
                    Some(i) => Value::from(i as i64),
                    None => Value::from(-1),
                }
            }
            "slice" => {
                let len = items.len();
                let start = slice_bound(args.first(), 0, len)?;
                let end = slice_bound(args.get(1), len as i64, len)?;
                Value::Array(items[start.min(end)..end].to_vec())
            }
            "concat" => {
                let mut out = items.to_vec();
                for arg in &args {
                    match arg {
                        Value::Array(more) => out.extend(more.iter().cloned()),
                        other => out.push(other.clone()),
                    }
                }
                Value::Array(out)
            }
            "reverse" => {
                let mut out = items.to_vec();
                out.reverse();
                Value::Array(out)
            }
            other => {
                return Err(EvalError::type_err(format!(
                    "no method '{other}' on sequence"
                )));
            }
        };
        Ok(Val::Json(value))
    }

    fn callback_arg(
        &self,
        args: &[Expr],
        env: &Env,
        method: &str,
    ) -> Result<Closure, EvalError> {
        let Some(first) = args.first() else {
            return Err(EvalError::type_err(format!("{method} expects a callback")));
        };
        match self.eval(first, env)? {
            Val::Fn(closure) => Ok(closure),
            _ => Err(EvalError::type_err(format!(
                "{method} expects a function argument"
            ))),
        }
    }

    fn call_callback(
        &self,
        callback: &Closure,
        item: &Value,
        index: usize,
    ) -> Result<Value, EvalError> {
        match self.invoke(
            callback,
            vec![
                Val::Json(item.clone()),
                Val::Json(Value::from(index as i64)),
            ],
        )? {
            Val::Json(value) => Ok(value),
            _ => Err(EvalError::type_err("callback returned a function")),
        }
    }
}

// ---------------------------------------------------------------------------
// Coercions, centralised (spec'd value-domain note: one place for number and
// string conversions).
// ---------------------------------------------------------------------------

pub(super) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EvalError::type_err("number out of range")),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(0.0)
            } else {
                trimmed
                    .parse::<f64>()
                    .map_err(|_| EvalError::type_err(format!("'{s}' is not numeric")))
            }
        }
        Value::Bool(true) => Ok(1.0),
        Value::Bool(false) | Value::Null => Ok(0.0),
        Value::Array(_) | Value::Object(_) => {
            Err(EvalError::type_err("cannot convert a collection to a number"))
        }
    }
}

/// Canonical numeric materialisation: integral magnitudes within 2^53 become
/// integer JSON numbers, everything else stays a float.
fn num_val(n: f64) -> Result<Value, EvalError> {
    if !n.is_finite() {
        return Err(EvalError::type_err("arithmetic produced a non-finite number"));
    }
    if n.fract() == 0.0 && n.abs() <= MAX_INT {
        Ok(Value::from(n as i64))
    } else {
        Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| EvalError::type_err("arithmetic produced a non-finite number"))
    }
}

pub(super) fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
        }
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Number(_), Value::Number(_)) => num_eq(lhs, rhs),
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (to_number(lhs), to_number(rhs)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        (Value::Bool(_), _) | (_, Value::Bool(_)) => match (to_number(lhs), to_number(rhs)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        _ => strict_eq(lhs, rhs),
    }
}

fn strict_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => num_eq(lhs, rhs),
        _ => lhs == rhs,
    }
}

fn num_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering;
    let ordering = match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            let (a, b) = (to_number(lhs)?, to_number(rhs)?);
            match a.partial_cmp(&b) {
                Some(ordering) => ordering,
                None => return Ok(false),
            }
        }
    };
    Ok(match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::LtEq => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::GtEq => ordering != Ordering::Less,
        _ => unreachable!("compare called with non-relational operator"),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

// ---------------------------------------------------------------------------
// Builtin namespaces and methods
// ---------------------------------------------------------------------------

fn arg_num(args: &[Value], i: usize, name: &str) -> Result<f64, EvalError> {
    let value = args
        .get(i)
        .ok_or_else(|| EvalError::type_err(format!("{name}: missing argument {i}")))?;
    to_number(value)
}

fn arg_str(args: &[Value], i: usize, name: &str) -> Result<String, EvalError> {
    match args.get(i) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(to_display_string(other)),
        None => Err(EvalError::type_err(format!("{name}: missing argument {i}"))),
    }
}

fn math_call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let value = match name {
        "abs" => num_val(arg_num(args, 0, "Math.abs")?.abs())?,
        "floor" => num_val(arg_num(args, 0, "Math.floor")?.floor())?,
        "ceil" => num_val(arg_num(args, 0, "Math.ceil")?.ceil())?,
        "round" => num_val(arg_num(args, 0, "Math.round")?.round())?,
        "trunc" => num_val(arg_num(args, 0, "Math.trunc")?.trunc())?,
        "sqrt" => num_val(arg_num(args, 0, "Math.sqrt")?.sqrt())?,
        "sign" => num_val({
            let n = arg_num(args, 0, "Math.sign")?;
            if n == 0.0 { 0.0 } else { n.signum() }
        })?,
        "pow" => num_val(arg_num(args, 0, "Math.pow")?.powf(arg_num(args, 1, "Math.pow")?))?,
        "min" | "max" => {
            if args.is_empty() {
                return Err(EvalError::type_err(format!("Math.{name}: no arguments")));
            }
            let mut best = to_number(&args[0])?;
            for arg in &args[1..] {
                let n = to_number(arg)?;
                best = if name == "min" { best.min(n) } else { best.max(n) };
            }
            num_val(best)?
        }
        other => {
            return Err(EvalError::type_err(format!("unknown function Math.{other}")));
        }
    };
    Ok(value)
}

fn json_call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "stringify" => {
            let value = args.first().cloned().unwrap_or(Value::Null);
            serde_json::to_string(&value)
                .map(Value::String)
                .map_err(|e| EvalError::type_err(format!("JSON.stringify: {e}")))
        }
        "parse" => {
            let text = arg_str(args, 0, "JSON.parse")?;
            serde_json::from_str(&text)
                .map_err(|e| EvalError::type_err(format!("JSON.parse: {e}")))
        }
        other => Err(EvalError::type_err(format!("unknown function JSON.{other}"))),
    }
}

fn object_call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let Some(Value::Object(map)) = args.first() else {
        return Err(EvalError::type_err(format!("Object.{name} expects a mapping")));
    };
    let value = match name {
        "keys" => Value::Array(map.keys().map(|k| Value::String(k.clone())).collect()),
        "values" => Value::Array(map.values().cloned().collect()),
        "entries" => Value::Array(
            map.iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        ),
        other => {
            return Err(EvalError::type_err(format!(
                "unknown function Object.{other}"
            )));
        }
    };
    Ok(value)
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    let value = match method {
        "toUpperCase" => Value::String(s.to_uppercase()),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "trim" => Value::String(s.trim().to_string()),
        "split" => {
            let parts: Vec<Value> = match args.first() {
                None => vec![Value::String(s.to_string())],
                Some(Value::String(sep)) if sep.is_empty() => {
                    s.chars().map(|c| Value::String(c.to_string())).collect()
                }
                Some(sep) => {
                    let sep = to_display_string(sep);
                    s.split(sep.as_str())
                        .map(|part| Value::String(part.to_string()))
                        .collect()
                }
            };
            Value::Array(parts)
        }
        "includes" => Value::Bool(s.contains(&arg_str(args, 0, "includes")?)),
        "startsWith" => Value::Bool(s.starts_with(&arg_str(args, 0, "startsWith")?)),
        "endsWith" => Value::Bool(s.ends_with(&arg_str(args, 0, "endsWith")?)),
        "indexOf" => {
            let needle = arg_str(args, 0, "indexOf")?;
            match s.find(&needle) {
                Some(byte_idx) => Value::from(s[..byte_idx].chars().count() as i64),
                None => Value::from(-1),
            }
        }
        "charAt" => {
            let i = arg_num(args, 0, "charAt")?;
            if i.fract() != 0.0 || i < 0.0 {
                Value::String(String::new())
            } else {
                s.chars()
                    .nth(i as usize)
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_else(|| Value::String(String::new()))
            }
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len();
            let start = slice_bound(args.first(), 0, len)?;
            let end = slice_bound(args.get(1), len as i64, len)?;
            Value::String(chars[start.min(end)..end].iter().collect())
        }
        "replace" => {
            let from = arg_str(args, 0, "replace")?;
            let to = arg_str(args, 1, "replace")?;
            Value::String(s.replacen(&from, &to, 1))
        }
        "repeat" => {
            let n = arg_num(args, 0, "repeat")?;
            if n < 0.0 || n.fract() != 0.0 || n > 10_000.0 {
                return Err(EvalError::type_err("repeat: invalid count"));
            }
            Value::String(s.repeat(n as usize))
        }
        "concat" => {
            let mut out = s.to_string();
            for arg in args {
                out.push_str(&to_display_string(arg));
            }
            Value::String(out)
        }
        "toString" => Value::String(s.to_string()),
        other => {
            return Err(EvalError::type_err(format!("no method '{other}' on string")));
        }
    };
    Ok(value)
}

/// Normalise a slice bound: negative counts from the end, everything clamps
/// into `0..=len`.
fn slice_bound(arg: Option<&Value>, default: i64, len: usize) -> Result<usize, EvalError> {
    let raw = match arg {
        Some(value) => {
            let n = to_number(value)?;
            if n.fract() != 0.0 {
                return Err(EvalError::type_err("slice bounds must be integers"));
            }
            n as i64
        }
        None => default,
    };
    let len = len as i64;
    let bounded = if raw < 0 { (len + raw).max(0) } else { raw.min(len) };
    Ok(bounded as usize)
}
