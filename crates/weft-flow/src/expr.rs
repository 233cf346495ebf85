//! Minimal expression language for conditions and parameter templates.
//!
//! ```text
//! expr    := operand [ ("==" | "!=") operand ]
//! operand := string | number | true | false | null | path
//! path    := segment ( "." segment )*
//! ```
//!
//! Expressions are tokenized, parsed into an [`Expr`], and evaluated against
//! a JSON scope. A lone operand is judged by truthiness. Anything that fails
//! to tokenize or parse evaluates to `false`.

use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Word(String),
    Eq,
    Ne,
}

/// A literal or a dotted path into the scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
}

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Operand(Operand),
    Compare { left: Operand, op: CmpOp, right: Operand },
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '$')
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some(escaped) => s.push(escaped),
                            None => break,
                        },
                        ch if ch == quote => {
                            closed = true;
                            break;
                        }
                        ch => s.push(ch),
                    }
                }
                if !closed {
                    return Err("unterminated string".into());
                }
                tokens.push(Token::Str(s));
            }
            '=' | '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(format!("expected '=' after '{}'", c));
                }
                tokens.push(if c == '=' { Token::Eq } else { Token::Ne });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || matches!(d, '.' | '-' | 'e' | 'E' | '+') {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s.parse().map_err(|_| format!("bad number '{}'", s))?;
                tokens.push(Token::Num(n));
            }
            c if is_word_char(c) => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if is_word_char(d) {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(s));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

fn operand(token: Token) -> Result<Operand, String> {
    Ok(match token {
        Token::Str(s) => Operand::Literal(Value::String(s)),
        Token::Num(n) => Operand::Literal(
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        ),
        Token::Word(w) => match w.as_str() {
            "true" => Operand::Literal(Value::Bool(true)),
            "false" => Operand::Literal(Value::Bool(false)),
            "null" => Operand::Literal(Value::Null),
            path => {
                let segments: Vec<String> = path.split('.').map(String::from).collect();
                if segments.iter().any(|s| s.is_empty()) {
                    return Err(format!("bad path '{}'", path));
                }
                Operand::Path(segments)
            }
        },
        Token::Eq | Token::Ne => return Err("operator where operand expected".into()),
    })
}

/// Parse an expression.
pub fn parse(src: &str) -> Result<Expr, String> {
    let mut tokens = tokenize(src)?.into_iter();
    let left = operand(tokens.next().ok_or("empty expression")?)?;
    let op = match tokens.next() {
        None => return Ok(Expr::Operand(left)),
        Some(Token::Eq) => CmpOp::Eq,
        Some(Token::Ne) => CmpOp::Ne,
        Some(_) => return Err("expected '==' or '!='".into()),
    };
    let right = operand(tokens.next().ok_or("missing right operand")?)?;
    if tokens.next().is_some() {
        return Err("trailing tokens".into());
    }
    Ok(Expr::Compare { left, op, right })
}

impl Operand {
    fn resolve(&self, scope: &Value) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(segments) => lookup_segments(scope, segments).cloned().unwrap_or(Value::Null),
        }
    }
}

impl Expr {
    pub fn evaluate(&self, scope: &Value) -> bool {
        match self {
            Self::Operand(o) => truthy(&o.resolve(scope)),
            Self::Compare { left, op, right } => {
                let equal = values_equal(&left.resolve(scope), &right.resolve(scope));
                match op {
                    CmpOp::Eq => equal,
                    CmpOp::Ne => !equal,
                }
            }
        }
    }
}

/// Parse and evaluate; malformed expressions are `false`.
pub fn evaluate(expression: &str, scope: &Value) -> bool {
    match parse(expression) {
        Ok(expr) => expr.evaluate(scope),
        Err(e) => {
            debug!(expression, error = %e, "Malformed expression, evaluating to false");
            false
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn lookup_segments<'a>(scope: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(scope, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Look up a dotted path such as `steps.fetch.result`.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let segments: Vec<String> = path.split('.').map(String::from).collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    lookup_segments(scope, &segments)
}

fn placeholder_path(inner: &str) -> Option<&str> {
    let path = inner.trim();
    (!path.is_empty() && path.chars().all(is_word_char)).then_some(path)
}

/// Substitute `{{path}}` placeholders throughout a JSON value.
pub fn resolve_template(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_template(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_template(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A string that is exactly one placeholder becomes the raw value; otherwise
/// placeholders are spliced in as text. Unresolvable ones stay verbatim.
pub fn resolve_string(s: &str, scope: &Value) -> Value {
    let trimmed = s.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
        if !inner.contains("{{") && !inner.contains("}}") {
            if let Some(v) = placeholder_path(inner).and_then(|p| lookup(scope, p)) {
                return v.clone();
            }
            return Value::String(s.to_string());
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return Value::String(out);
        };
        let inner = &after[..end];
        match placeholder_path(inner).and_then(|p| lookup(scope, p)) {
            Some(Value::String(v)) => out.push_str(v),
            Some(v) => out.push_str(&v.to_string()),
            None => {
                out.push_str("{{");
                out.push_str(inner);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "variables": { "x": 5, "name": "ada", "flag": true, "empty": "", "list": [10, 20] },
            "steps": { "fetch": { "status": "completed", "result": { "id": 42 } } }
        })
    }

    #[test]
    fn test_equality() {
        let s = scope();
        assert!(evaluate("variables.x == 5", &s));
        assert!(evaluate("variables.x == 5.0", &s));
        assert!(!evaluate("variables.x != 5", &s));
        assert!(evaluate("variables.name == \"ada\"", &s));
        assert!(evaluate("variables.name == 'ada'", &s));
        assert!(evaluate("steps.fetch.status == \"completed\"", &s));
        assert!(evaluate("steps.fetch.result.id != 41", &s));
        assert!(evaluate("variables.missing == null", &s));
        assert!(evaluate("variables.list.1 == 20", &s));
    }

    #[test]
    fn test_truthiness() {
        let s = scope();
        assert!(evaluate("variables.flag", &s));
        assert!(evaluate("variables.x", &s));
        assert!(!evaluate("variables.empty", &s));
        assert!(!evaluate("variables.missing", &s));
        assert!(evaluate("true", &s));
        assert!(!evaluate("0", &s));
    }

    #[test]
    fn test_malformed_is_false() {
        let s = scope();
        assert!(!evaluate("", &s));
        assert!(!evaluate("variables.x ==", &s));
        assert!(!evaluate("variables.x = 5", &s));
        assert!(!evaluate("\"open", &s));
        assert!(!evaluate("a == b == c", &s));
        assert!(!evaluate("variables..x", &s));
        assert!(parse("x > 3").is_err());
    }

    #[test]
    fn test_parse_shape() {
        let expr = parse("variables.x != \"y\"").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                left: Operand::Path(vec!["variables".into(), "x".into()]),
                op: CmpOp::Ne,
                right: Operand::Literal(json!("y")),
            }
        );
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let s = scope();
        assert_eq!(resolve_string("{{variables.x}}", &s), json!(5));
        assert_eq!(resolve_string("{{ steps.fetch.result }}", &s), json!({ "id": 42 }));
    }

    #[test]
    fn test_inline_placeholders() {
        let s = scope();
        assert_eq!(
            resolve_string("hi {{variables.name}}, id={{steps.fetch.result.id}}", &s),
            json!("hi ada, id=42")
        );
    }

    #[test]
    fn test_unresolvable_placeholders_stay_verbatim() {
        let s = scope();
        assert_eq!(resolve_string("{{variables.nope}}", &s), json!("{{variables.nope}}"));
        assert_eq!(resolve_string("a {{bad path!}} b", &s), json!("a {{bad path!}} b"));
        assert_eq!(resolve_string("open {{variables.x", &s), json!("open {{variables.x"));
    }

    #[test]
    fn test_resolve_nested_template() {
        let s = scope();
        let params = json!({ "user": "{{variables.name}}", "ids": ["{{variables.x}}", 1], "n": 3 });
        assert_eq!(
            resolve_template(&params, &s),
            json!({ "user": "ada", "ids": [5, 1], "n": 3 })
        );
    }
}
