//! # Expression Evaluator
//!
//! Resolves `${…}` expression fragments against a set of named bindings.
//! Parameters in flow definitions carry these fragments; the runtime binds
//! `secrets`, `results` and `shared` (plus any caller-supplied names) and
//! resolves them just before a node's prep phase.
//!
//! Two modes, per the template contract:
//! - **Pass-through**: any string not wholly of the shape `${…}` is returned
//!   unchanged.
//! - **Evaluated**: a string of the shape `${expr}` evaluates `expr` in a
//!   JavaScript-subset language: arithmetic, string concatenation, member
//!   access and indexing, comparisons, ternaries, method calls on strings
//!   and sequences, the `Math`/`JSON`/`Object` namespaces, and arrow
//!   functions for `map`/`filter`/`find`/`reduce` callbacks.
//!
//! The evaluator is synchronous, CPU-bound and sandboxed by construction:
//! there is no filesystem, network, clock or host-environment access — the
//! bindings are the entire reachable world. Because of that, secret values
//! must be materialised *before* evaluation; [`secret_refs`] reports which
//! vault keys an expression mentions so the caller can prefetch exactly
//! those (see `FlowContext`).

mod interp;
mod lexer;
mod parser;

use serde_json::{Map, Value};

use interp::Interp;
use lexer::Token;

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// The expression text failed to lex or parse.
    #[error("parse error: {0}")]
    Parse(String),

    /// A top-level identifier is not among the bindings.
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    /// An operation was applied to a value of the wrong shape.
    #[error("type error: {0}")]
    Type(String),
}

impl EvalError {
    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        EvalError::Parse(msg.into())
    }

    pub(crate) fn type_err(msg: impl Into<String>) -> Self {
        EvalError::Type(msg.into())
    }
}

/// Named top-level bindings visible to an expression.
pub type Bindings = Map<String, Value>;

/// JS-style truthiness over the value domain: `null`, `false`, `0`, `NaN`
/// and `""` are falsy; collections are always truthy.
pub fn truthy(value: &Value) -> bool {
    interp::truthy(value)
}

/// Resolve a template string: expression mode for `${…}` strings,
/// pass-through for everything else.
pub fn evaluate(input: &str, bindings: &Bindings) -> Result<Value, EvalError> {
    match template_body(input) {
        Some(body) => evaluate_expression(body, bindings),
        None => Ok(Value::String(input.to_string())),
    }
}

/// Evaluate a raw expression (no `${…}` wrapper).
pub fn evaluate_expression(src: &str, bindings: &Bindings) -> Result<Value, EvalError> {
    let ast = parser::parse(src)?;
    Interp::new(bindings).eval_root(&ast)
}

/// Walk a keyed mapping, resolving `${…}` keys to strings and evaluating
/// every string value; nested mappings and sequences recurse, scalars pass
/// through untouched.
pub fn evaluate_in_object(
    obj: &Map<String, Value>,
    bindings: &Bindings,
) -> Result<Map<String, Value>, EvalError> {
    let mut out = Map::with_capacity(obj.len());
    for (key, value) in obj {
        let resolved_key = match template_body(key) {
            Some(body) => match evaluate_expression(body, bindings)? {
                Value::String(s) => s,
                other => interp::to_display_string(&other),
            },
            None => key.clone(),
        };
        out.insert(resolved_key, evaluate_value(value, bindings)?);
    }
    Ok(out)
}

fn evaluate_value(value: &Value, bindings: &Bindings) -> Result<Value, EvalError> {
    match value {
        Value::String(s) => evaluate(s, bindings),
        Value::Object(map) => Ok(Value::Object(evaluate_in_object(map, bindings)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_value(item, bindings)?);
            }
            Ok(Value::Array(out))
        }
        scalar => Ok(scalar.clone()),
    }
}

/// If `input` is wholly of the shape `${…}`, return the inner expression.
///
/// The scan is quote-aware so `'}'` inside a string literal does not close
/// the template early; a string like `"${a}-${b}"` is *not* a template (its
/// first close brace is not the last character) and passes through.
pub fn template_body(input: &str) -> Option<&str> {
    let body = input.strip_prefix("${")?;
    let mut depth = 1usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => in_string = Some(c),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return if i == body.len() - 1 {
                        Some(&body[..i])
                    } else {
                        None
                    };
                }
            }
            _ => {}
        }
    }
    None
}

/// Which secrets a template mentions, for prefetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRefs {
    /// The template does not touch `secrets` (or is not a template at all).
    None,
    /// Statically resolvable key accesses: `secrets.K`, `secrets['K']`.
    Keys(Vec<String>),
    /// `secrets` appears in a form the scan cannot resolve (computed index,
    /// passed as a value); the caller must materialise every key.
    All,
}

impl SecretRefs {
    /// Fold another template's references into this one.
    pub fn merge(self, other: SecretRefs) -> SecretRefs {
        match (self, other) {
            (SecretRefs::All, _) | (_, SecretRefs::All) => SecretRefs::All,
            (SecretRefs::None, refs) | (refs, SecretRefs::None) => refs,
            (SecretRefs::Keys(mut a), SecretRefs::Keys(b)) => {
                for key in b {
                    if !a.contains(&key) {
                        a.push(key);
                    }
                }
                SecretRefs::Keys(a)
            }
        }
    }
}

/// Scan a template string for `secrets` accesses without evaluating it.
pub fn secret_refs(input: &str) -> SecretRefs {
    let Some(body) = template_body(input) else {
        return SecretRefs::None;
    };
    let Ok(tokens) = lexer::tokenize(body) else {
        return SecretRefs::None;
    };

    let mut keys: Vec<String> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if !matches!(token, Token::Ident(name) if name == "secrets") {
            continue;
        }
        // `foo.secrets` is a property named "secrets", not the binding.
        if i > 0 && tokens[i - 1] == Token::Dot {
            continue;
        }
        match (tokens.get(i + 1), tokens.get(i + 2), tokens.get(i + 3)) {
            (Some(Token::Dot), Some(Token::Ident(key)), next) => {
                // `secrets.get('K')` resolves through the argument instead.
                if key == "get" && next == Some(&Token::LParen) {
                    match (tokens.get(i + 4), tokens.get(i + 5)) {
                        (Some(Token::Str(k)), Some(Token::RParen)) => {
                            if !keys.contains(k) {
                                keys.push(k.clone());
                            }
                        }
                        _ => return SecretRefs::All,
                    }
                } else if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
            (Some(Token::LBracket), Some(Token::Str(key)), Some(Token::RBracket)) => {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
            _ => return SecretRefs::All,
        }
    }

    if keys.is_empty() {
        SecretRefs::None
    } else {
        SecretRefs::Keys(keys)
    }
}

/// Scan a whole parameter value (mapping/sequence/scalar) for secret
/// references, merging across every string found.
pub fn secret_refs_in_value(value: &Value) -> SecretRefs {
    match value {
        Value::String(s) => secret_refs(s),
        Value::Array(items) => items
            .iter()
            .fold(SecretRefs::None, |acc, v| acc.merge(secret_refs_in_value(v))),
        Value::Object(map) => map.iter().fold(SecretRefs::None, |acc, (k, v)| {
            acc.merge(secret_refs(k)).merge(secret_refs_in_value(v))
        }),
        _ => SecretRefs::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(pairs: &[(&str, Value)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn pass_through_for_non_templates() {
        let ctx = Bindings::new();
        assert_eq!(evaluate("hello", &ctx).unwrap(), json!("hello"));
        assert_eq!(evaluate("", &ctx).unwrap(), json!(""));
        assert_eq!(evaluate("${a}-${b}", &ctx).unwrap(), json!("${a}-${b}"));
        assert_eq!(evaluate("${unclosed", &ctx).unwrap(), json!("${unclosed"));
    }

    #[test]
    fn arithmetic_and_concatenation() {
        let ctx = Bindings::new();
        assert_eq!(evaluate("${1 + 2 * 3}", &ctx).unwrap(), json!(7));
        assert_eq!(evaluate("${10 / 4}", &ctx).unwrap(), json!(2.5));
        assert_eq!(evaluate("${10 % 3}", &ctx).unwrap(), json!(1));
        assert_eq!(
            evaluate("${'Bearer ' + 'abc'}", &ctx).unwrap(),
            json!("Bearer abc")
        );
        assert_eq!(evaluate("${'n=' + 5}", &ctx).unwrap(), json!("n=5"));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let ctx = Bindings::new();
        assert!(matches!(
            evaluate("${1 / 0}", &ctx),
            Err(EvalError::Type(_))
        ));
    }

    #[test]
    fn numbers_normalise_to_one_canonical_shape() {
        let ctx = Bindings::new();
        assert_eq!(evaluate("${6 / 2}", &ctx).unwrap(), json!(3));
        assert_eq!(evaluate("${2.5 + 2.5}", &ctx).unwrap(), json!(5));
        assert_eq!(evaluate("${1.0}", &ctx).unwrap(), json!(1));
    }

    #[test]
    fn member_access_and_indexing() {
        let ctx = bindings(&[
            ("shared", json!({"user": {"name": "ada"}, "tags": ["a", "b"]})),
        ]);
        assert_eq!(evaluate("${shared.user.name}", &ctx).unwrap(), json!("ada"));
        assert_eq!(evaluate("${shared.tags[1]}", &ctx).unwrap(), json!("b"));
        assert_eq!(evaluate("${shared.tags[9]}", &ctx).unwrap(), json!(null));
        assert_eq!(evaluate("${shared.missing}", &ctx).unwrap(), json!(null));
        assert_eq!(
            evaluate("${shared['user']['name']}", &ctx).unwrap(),
            json!("ada")
        );
    }

    #[test]
    fn unknown_identifier_fails() {
        let ctx = Bindings::new();
        assert_eq!(
            evaluate("${nobody}", &ctx),
            Err(EvalError::UnknownIdentifier("nobody".into()))
        );
    }

    #[test]
    fn missing_secret_yields_null() {
        let ctx = bindings(&[("secrets", json!({}))]);
        assert_eq!(evaluate("${secrets.MISSING}", &ctx).unwrap(), json!(null));
        assert_eq!(
            evaluate("${secrets.get('MISSING')}", &ctx).unwrap(),
            json!(null)
        );
    }

    #[test]
    fn ternary_and_logic() {
        let ctx = bindings(&[("shared", json!({"n": 5, "name": ""}))]);
        assert_eq!(
            evaluate("${shared.n > 3 ? 'big' : 'small'}", &ctx).unwrap(),
            json!("big")
        );
        assert_eq!(
            evaluate("${shared.name || 'anonymous'}", &ctx).unwrap(),
            json!("anonymous")
        );
        assert_eq!(
            evaluate("${shared.n == '5'}", &ctx).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate("${shared.n === '5'}", &ctx).unwrap(),
            json!(false)
        );
        assert_eq!(evaluate("${!shared.name}", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn string_methods() {
        let ctx = bindings(&[("shared", json!({"s": "  Flow Runner  "}))]);
        assert_eq!(
            evaluate("${shared.s.trim().toUpperCase()}", &ctx).unwrap(),
            json!("FLOW RUNNER")
        );
        assert_eq!(
            evaluate("${'a,b,c'.split(',')}", &ctx).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(evaluate("${'hello'.slice(-3)}", &ctx).unwrap(), json!("llo"));
        assert_eq!(
            evaluate("${'hello'.replace('l', 'L')}", &ctx).unwrap(),
            json!("heLlo")
        );
        assert_eq!(evaluate("${'abc'.length}", &ctx).unwrap(), json!(3));
    }

    #[test]
    fn array_methods_and_callbacks() {
        let ctx = bindings(&[("shared", json!({"xs": [1, 2, 3, 4]}))]);
        assert_eq!(
            evaluate("${shared.xs.map(x => x * 2)}", &ctx).unwrap(),
            json!([2, 4, 6, 8])
        );
        assert_eq!(
            evaluate("${shared.xs.filter(x => x % 2 == 0)}", &ctx).unwrap(),
            json!([2, 4])
        );
        assert_eq!(
            evaluate("${shared.xs.reduce((a, b) => a + b)}", &ctx).unwrap(),
            json!(10)
        );
        assert_eq!(
            evaluate("${shared.xs.find(x => x > 2)}", &ctx).unwrap(),
            json!(3)
        );
        assert_eq!(
            evaluate("${shared.xs.join('-')}", &ctx).unwrap(),
            json!("1-2-3-4")
        );
        assert_eq!(evaluate("${shared.xs.length}", &ctx).unwrap(), json!(4));
    }

    #[test]
    fn closures_see_outer_bindings() {
        let ctx = bindings(&[("shared", json!({"xs": [1, 2], "offset": 10}))]);
        assert_eq!(
            evaluate("${shared.xs.map(x => x + shared.offset)}", &ctx).unwrap(),
            json!([11, 12])
        );
    }

    #[test]
    fn math_json_and_object_namespaces() {
        let ctx = bindings(&[("shared", json!({"o": {"a": 1, "b": 2}}))]);
        assert_eq!(evaluate("${Math.max(1, 7, 3)}", &ctx).unwrap(), json!(7));
        assert_eq!(evaluate("${Math.floor(2.9)}", &ctx).unwrap(), json!(2));
        assert_eq!(
            evaluate("${JSON.stringify(shared.o)}", &ctx).unwrap(),
            json!(r#"{"a":1,"b":2}"#)
        );
        assert_eq!(
            evaluate("${JSON.parse('[1,2]')}", &ctx).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            evaluate("${Object.keys(shared.o)}", &ctx).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(evaluate("${Number('42') + 1}", &ctx).unwrap(), json!(43));
        assert_eq!(evaluate("${String(42)}", &ctx).unwrap(), json!("42"));
    }

    #[test]
    fn anonymous_function_invocation() {
        let ctx = Bindings::new();
        assert_eq!(evaluate("${(x => x * x)(6)}", &ctx).unwrap(), json!(36));
        assert_eq!(
            evaluate("${((a, b) => a + b)('x', 'y')}", &ctx).unwrap(),
            json!("xy")
        );
    }

    #[test]
    fn object_traversal_resolves_nested_templates() {
        let ctx = bindings(&[
            ("secrets", json!({"API_KEY": "k-1"})),
            ("shared", json!({"user_id": "u-7"})),
        ]);
        let params = json!({
            "headers": {"Authorization": "${'Bearer ' + secrets.API_KEY}"},
            "body": {"user": "${shared.user_id}", "count": 3},
            "tags": ["${shared.user_id}", "static"],
            "${'dyn' + 'amic'}": true,
        });
        let Value::Object(params) = params else {
            unreachable!()
        };
        let resolved = evaluate_in_object(&params, &ctx).unwrap();
        assert_eq!(resolved["headers"]["Authorization"], json!("Bearer k-1"));
        assert_eq!(resolved["body"]["user"], json!("u-7"));
        assert_eq!(resolved["body"]["count"], json!(3));
        assert_eq!(resolved["tags"], json!(["u-7", "static"]));
        assert_eq!(resolved["dynamic"], json!(true));
    }

    #[test]
    fn object_traversal_is_idempotent_once_resolved() {
        let ctx = Bindings::new();
        let params = json!({"a": "plain", "b": {"c": 7}, "d": [true, null]});
        let Value::Object(params) = params else {
            unreachable!()
        };
        let once = evaluate_in_object(&params, &ctx).unwrap();
        let twice = evaluate_in_object(&once, &ctx).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn template_shape_detection() {
        assert_eq!(template_body("${a + b}"), Some("a + b"));
        assert_eq!(template_body("${'}' + x}"), Some("'}' + x"));
        assert_eq!(template_body("${a}${b}"), None);
        assert_eq!(template_body("plain"), None);
        assert_eq!(template_body("${open"), None);
    }

    #[test]
    fn secret_reference_scan() {
        assert_eq!(secret_refs("plain"), SecretRefs::None);
        assert_eq!(
            secret_refs("${'Bearer ' + secrets.API_KEY}"),
            SecretRefs::Keys(vec!["API_KEY".into()])
        );
        assert_eq!(
            secret_refs("${secrets['DB_URL'] + secrets.API_KEY}"),
            SecretRefs::Keys(vec!["DB_URL".into(), "API_KEY".into()])
        );
        assert_eq!(
            secret_refs("${secrets.get('TOKEN')}"),
            SecretRefs::Keys(vec!["TOKEN".into()])
        );
        assert_eq!(secret_refs("${secrets[shared.k]}"), SecretRefs::All);
        assert_eq!(
            secret_refs("${shared.secrets.nothing}"),
            SecretRefs::None
        );
    }

    #[test]
    fn secret_refs_merge_across_a_parameter_tree() {
        let params = json!({
            "a": "${secrets.ONE}",
            "nested": {"b": ["${secrets.TWO}", "${secrets.ONE}"]},
        });
        assert_eq!(
            secret_refs_in_value(&params),
            SecretRefs::Keys(vec!["ONE".into(), "TWO".into()])
        );
    }

    #[test]
    fn no_host_access_identifiers() {
        let ctx = Bindings::new();
        for forbidden in ["process", "require", "globalThis", "fetch", "Date"] {
            let expr = format!("${{{forbidden}}}");
            assert!(matches!(
                evaluate(&expr, &ctx),
                Err(EvalError::UnknownIdentifier(_))
            ));
        }
    }
}
