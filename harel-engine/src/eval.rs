//! Guard/action evaluation capability.
//!
//! The engine never interprets expression syntax itself: it talks to an
//! injected [`Evaluator`]. Evaluation failure is always surfaced as an error
//! attributed to the transition or action under evaluation, never coerced to
//! a default boolean.
//!
//! [`ContextEvaluator`] is the default implementation. Its guard language:
//!
//! - `ctx.field` / `evt.field` - field access, truthy check, nested dots
//! - `== != > >= < <=` - comparisons (ordering requires numbers)
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)`
//!
//! Its action language: `ctx.field = <json literal>` or
//! `ctx.field = evt.field` assignments mutate the context; any other action
//! string is an opaque named effect that leaves the context untouched.

use crate::error::EvalError;
use serde_json::Value;

/// Pure guard/action evaluation injected into the engine.
pub trait Evaluator: Send + Sync {
    /// Evaluates a guard against the context and the triggering payload.
    fn eval_guard(&self, guard: &str, ctx: &Value, payload: &Value) -> Result<bool, EvalError>;

    /// Applies an action, returning the new context.
    fn apply_action(&self, action: &str, ctx: &Value, payload: &Value)
        -> Result<Value, EvalError>;
}

/// Default evaluator over JSON contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextEvaluator;

impl Evaluator for ContextEvaluator {
    fn eval_guard(&self, guard: &str, ctx: &Value, payload: &Value) -> Result<bool, EvalError> {
        let tokens = tokenize(guard)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvalError::new(format!(
                "trailing input in guard '{}'",
                guard
            )));
        }
        expr.eval(ctx, payload)
    }

    fn apply_action(
        &self,
        action: &str,
        ctx: &Value,
        payload: &Value,
    ) -> Result<Value, EvalError> {
        let trimmed = action.trim();
        if !(trimmed.starts_with("ctx.") && trimmed.contains('=')) {
            // Opaque named effect; the trace records it, the context stays.
            return Ok(ctx.clone());
        }

        let tokens = tokenize(trimmed)?;
        match tokens.as_slice() {
            [Token::Ref(Scope::Ctx, path), Token::Assign, Token::Lit(value)] => {
                Ok(set_field(ctx, path, value.clone()))
            }
            [Token::Ref(Scope::Ctx, path), Token::Assign, Token::Ref(scope, src)] => {
                let value = resolve(*scope, src, ctx, payload);
                Ok(set_field(ctx, path, value))
            }
            _ => Err(EvalError::new(format!(
                "malformed assignment action '{}'",
                action
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Ctx,
    Evt,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(Scope, String),
    Lit(Value),
    AndAnd,
    OrOr,
    Not,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Assign,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if input[i..].starts_with("&&") => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if input[i..].starts_with("||") => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if input[i..].starts_with("==") => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Assign);
                i += 1;
            }
            '!' if input[i..].starts_with("!=") => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if input[i..].starts_with(">=") => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if input[i..].starts_with("<=") => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '"' => {
                let rest = &input[i + 1..];
                let end = rest
                    .find('"')
                    .ok_or_else(|| EvalError::new("unterminated string"))?;
                tokens.push(Token::Lit(Value::String(rest[..end].to_string())));
                i += end + 2;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &input[start..i];
                let num: f64 = text
                    .parse()
                    .map_err(|_| EvalError::new(format!("invalid number '{}'", text)))?;
                let num = serde_json::Number::from_f64(num)
                    .ok_or_else(|| EvalError::new(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Lit(Value::Number(num)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                match word {
                    "true" => tokens.push(Token::Lit(Value::Bool(true))),
                    "false" => tokens.push(Token::Lit(Value::Bool(false))),
                    "null" => tokens.push(Token::Lit(Value::Null)),
                    _ => {
                        let (scope, path) = if let Some(path) = word.strip_prefix("ctx.") {
                            (Scope::Ctx, path)
                        } else if let Some(path) = word.strip_prefix("evt.") {
                            (Scope::Evt, path)
                        } else {
                            return Err(EvalError::new(format!(
                                "reference '{}' must start with 'ctx.' or 'evt.'",
                                word
                            )));
                        };
                        if path.is_empty() {
                            return Err(EvalError::new("empty field path"));
                        }
                        tokens.push(Token::Ref(scope, path.to_string()));
                    }
                }
            }
            other => {
                return Err(EvalError::new(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    if tokens.is_empty() {
        return Err(EvalError::new("empty expression"));
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug)]
enum Expr {
    Truthy(Scope, String),
    Cmp(Scope, String, CmpOp, Value),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(EvalError::new("expected ')'")),
                }
            }
            Some(Token::Ref(scope, path)) => {
                self.pos += 1;
                let op = match self.peek() {
                    Some(Token::Eq) => Some(CmpOp::Eq),
                    Some(Token::Ne) => Some(CmpOp::Ne),
                    Some(Token::Gt) => Some(CmpOp::Gt),
                    Some(Token::Ge) => Some(CmpOp::Ge),
                    Some(Token::Lt) => Some(CmpOp::Lt),
                    Some(Token::Le) => Some(CmpOp::Le),
                    _ => None,
                };
                match op {
                    None => Ok(Expr::Truthy(scope, path)),
                    Some(op) => {
                        self.pos += 1;
                        match self.peek().cloned() {
                            Some(Token::Lit(value)) => {
                                self.pos += 1;
                                Ok(Expr::Cmp(scope, path, op, value))
                            }
                            _ => Err(EvalError::new("expected literal after comparison")),
                        }
                    }
                }
            }
            _ => Err(EvalError::new("expected reference or '('")),
        }
    }
}

impl Expr {
    fn eval(&self, ctx: &Value, payload: &Value) -> Result<bool, EvalError> {
        match self {
            Expr::Truthy(scope, path) => Ok(is_truthy(&resolve(*scope, path, ctx, payload))),
            Expr::Cmp(scope, path, op, expected) => {
                let actual = resolve(*scope, path, ctx, payload);
                compare(&actual, *op, expected)
            }
            Expr::And(a, b) => Ok(a.eval(ctx, payload)? && b.eval(ctx, payload)?),
            Expr::Or(a, b) => Ok(a.eval(ctx, payload)? || b.eval(ctx, payload)?),
            Expr::Not(inner) => Ok(!inner.eval(ctx, payload)?),
        }
    }
}

fn resolve(scope: Scope, path: &str, ctx: &Value, payload: &Value) -> Value {
    let mut current = match scope {
        Scope::Ctx => ctx,
        Scope::Evt => payload,
    };
    for part in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(part).unwrap_or(&Value::Null),
            _ => return Value::Null,
        }
    }
    current.clone()
}

fn compare(actual: &Value, op: CmpOp, expected: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_equal(actual, expected)),
        CmpOp::Ne => Ok(!values_equal(actual, expected)),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let (a, b) = match (as_f64(actual), as_f64(expected)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EvalError::new(format!(
                        "ordering comparison requires numbers, got {} and {}",
                        actual, expected
                    )))
                }
            };
            Ok(match op {
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Returns a copy of `ctx` with `path` set, creating intermediate objects.
fn set_field(ctx: &Value, path: &str, value: Value) -> Value {
    fn insert(map: &mut serde_json::Map<String, Value>, parts: &[&str], value: Value) {
        if parts.len() == 1 {
            map.insert(parts[0].to_string(), value);
            return;
        }
        let slot = map
            .entry(parts[0].to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(child) = slot {
            insert(child, &parts[1..], value);
        }
    }

    let mut root = match ctx {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let parts: Vec<&str> = path.split('.').collect();
    insert(&mut root, &parts, value);
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard(expr: &str, ctx: Value) -> Result<bool, EvalError> {
        ContextEvaluator.eval_guard(expr, &ctx, &Value::Null)
    }

    #[test]
    fn test_truthy() {
        assert!(guard("ctx.on", json!({"on": true})).unwrap());
        assert!(!guard("ctx.on", json!({"on": false})).unwrap());
        assert!(!guard("ctx.on", json!({})).unwrap());
        assert!(guard("ctx.n", json!({"n": 3})).unwrap());
        assert!(!guard("ctx.n", json!({"n": 0})).unwrap());
    }

    #[test]
    fn test_comparisons() {
        assert!(guard("ctx.amount > 100", json!({"amount": 150})).unwrap());
        assert!(!guard("ctx.amount > 100", json!({"amount": 100})).unwrap());
        assert!(guard("ctx.amount >= 100", json!({"amount": 100})).unwrap());
        assert!(guard("ctx.status == \"active\"", json!({"status": "active"})).unwrap());
        assert!(guard("ctx.status != \"active\"", json!({"status": "idle"})).unwrap());
        assert!(guard("ctx.t > -5", json!({"t": 0})).unwrap());
    }

    #[test]
    fn test_boolean_operators_and_grouping() {
        let ctx = json!({"a": true, "b": false, "c": true});
        assert!(guard("ctx.a && ctx.c", ctx.clone()).unwrap());
        assert!(guard("ctx.b || ctx.c", ctx.clone()).unwrap());
        assert!(guard("!(ctx.a && ctx.b)", ctx.clone()).unwrap());
        // && binds tighter than ||
        assert!(guard("ctx.b && ctx.a || ctx.c", ctx.clone()).unwrap());
        assert!(!guard("ctx.b && (ctx.a || ctx.c)", ctx).unwrap());
    }

    #[test]
    fn test_payload_reference() {
        let ok = ContextEvaluator
            .eval_guard("evt.amount > 10", &json!({}), &json!({"amount": 25}))
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn test_nested_fields() {
        assert!(guard("ctx.order.paid", json!({"order": {"paid": true}})).unwrap());
        assert!(!guard("ctx.order.paid", json!({"order": {}})).unwrap());
    }

    #[test]
    fn test_evaluation_errors_are_not_coerced() {
        // Ordering a string is a fault, not false.
        assert!(guard("ctx.v > 10", json!({"v": "nope"})).is_err());
        assert!(guard("", json!({})).is_err());
        assert!(guard("foo.bar", json!({})).is_err());
        assert!(guard("(ctx.a", json!({"a": true})).is_err());
        assert!(guard("ctx.a ctx.b", json!({})).is_err());
    }

    #[test]
    fn test_assignment_action() {
        let ctx = ContextEvaluator
            .apply_action("ctx.count = 3", &json!({}), &Value::Null)
            .unwrap();
        assert_eq!(ctx, json!({"count": 3.0}));

        let ctx = ContextEvaluator
            .apply_action("ctx.nested.flag = true", &ctx, &Value::Null)
            .unwrap();
        assert_eq!(ctx["nested"]["flag"], json!(true));
    }

    #[test]
    fn test_assignment_from_payload() {
        let ctx = ContextEvaluator
            .apply_action("ctx.amount = evt.amount", &json!({}), &json!({"amount": 42}))
            .unwrap();
        assert_eq!(ctx["amount"], json!(42));
    }

    #[test]
    fn test_opaque_action_keeps_context() {
        let ctx = json!({"x": 1});
        let out = ContextEvaluator
            .apply_action("spin_up", &ctx, &Value::Null)
            .unwrap();
        assert_eq!(out, ctx);
    }

    #[test]
    fn test_malformed_assignment_is_an_error() {
        assert!(ContextEvaluator
            .apply_action("ctx.a = = 1", &json!({}), &Value::Null)
            .is_err());
    }
}
