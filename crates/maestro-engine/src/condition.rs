//! Step conditions.
//!
//! A condition is a small boolean expression over run variables:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := operand ( ("==" | "===" | "!=" | "!==") operand )*
//! operand := "${" path "}" | string | number | true | false | null | undefined
//!          | "(" expr ")"
//! ```
//!
//! `${path}` reads a dotted path from the variables (missing → `null`).
//! Resolved values are data, never re-parsed as expression text. Equality is
//! strict JSON equality, except that numbers compare by value. `==` is an
//! alias of `===`: loose coercing equality (`3 == "3"`, `1 == true`) is not
//! supported. An operand on its own is judged by truthiness.

use serde_json::Value;
use tracing::warn;

use maestro_core::error::{MaestroError, Result};
use maestro_core::types::Variables;

use crate::mapper;

/// Evaluate `expression` against `variables`.
///
/// Expressions that fail to parse evaluate to `true`, so the guarded step
/// runs.
pub fn evaluate(expression: &str, variables: &Variables) -> bool {
    match Condition::parse(expression) {
        Ok(condition) => condition.evaluate(variables),
        Err(e) => {
            warn!(expression, error = %e, "Unparseable step condition, running step");
            true
        }
    }
}

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    root: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(MaestroError::InvalidCondition(format!(
                "unexpected {:?} in '{}'",
                token, source
            )));
        }
        Ok(Self { root })
    }

    pub fn evaluate(&self, variables: &Variables) -> bool {
        truthy(&self.root.eval(variables))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Compare { negate: bool, left: Box<Expr>, right: Box<Expr> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, vars: &Variables) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Var(path) => mapper::resolve_in(path, vars).cloned().unwrap_or(Value::Null),
            Expr::Compare { negate, left, right } => {
                let equal = values_equal(&left.eval(vars), &right.eval(vars));
                Value::Bool(equal != *negate)
            }
            Expr::And(l, r) => Value::Bool(truthy(&l.eval(vars)) && truthy(&r.eval(vars))),
            Expr::Or(l, r) => Value::Bool(truthy(&l.eval(vars)) || truthy(&r.eval(vars))),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Literal(Value),
    Eq,
    NotEq,
    And,
    Or,
    LParen,
    RParen,
}

fn invalid(msg: impl Into<String>) -> MaestroError {
    MaestroError::InvalidCondition(msg.into())
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|p| start + p)
                    .ok_or_else(|| invalid("unterminated ${...} reference"))?;
                let path: String = chars[start..end].iter().collect::<String>().trim().to_string();
                if path.is_empty() || path.split('.').any(str::is_empty) {
                    return Err(invalid(format!("invalid variable path '{}'", path)));
                }
                tokens.push(Token::Var(path));
                i = end + 1;
            }
            '=' | '!' => {
                let negate = c == '!';
                if chars.get(i + 1) != Some(&'=') {
                    return Err(invalid(format!("unsupported operator at position {}", i)));
                }
                i += 2;
                // `===` / `!==` are accepted as synonyms.
                if chars.get(i) == Some(&'=') {
                    i += 1;
                }
                tokens.push(if negate { Token::NotEq } else { Token::Eq });
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(invalid(format!("unsupported operator '{}' at position {}", c, i)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '"' | '\'' => {
                let (text, next) = read_string(&chars, i)?;
                tokens.push(Token::Literal(Value::String(text)));
                i = next;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '+' | '-'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .ok_or_else(|| invalid(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Literal(Value::Number(number)));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let literal = match word.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    "null" | "undefined" => Value::Null,
                    _ => return Err(invalid(format!("unknown identifier '{}'", word))),
                };
                tokens.push(Token::Literal(literal));
            }
            other => return Err(invalid(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

/// Read a quoted string starting at `start`; returns the text and the index
/// after the closing quote.
fn read_string(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = *chars
                    .get(i + 1)
                    .ok_or_else(|| invalid("dangling escape in string literal"))?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }

    Err(invalid("unterminated string literal"))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_compare()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_compare()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let mut left = self.parse_operand()?;
        loop {
            let negate = match self.peek() {
                Some(Token::Eq) => false,
                Some(Token::NotEq) => true,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_operand()?;
            left = Expr::Compare {
                negate,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Var(path)) => Ok(Expr::Var(path)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(invalid("missing closing parenthesis")),
                }
            }
            Some(token) => Err(invalid(format!("expected operand, found {:?}", token))),
            None => Err(invalid("unexpected end of expression")),
        }
    }
}
