//! Sandboxed condition evaluation.
//!
//! Decision and while-loop conditions are evaluated against the run
//! context only: comparison, arithmetic, and boolean operators over
//! context identifiers and literals, plus a fixed builtin table
//! (`len`, `abs`, `str`, `int`). There is no assignment, no general
//! function calls, and no host access.
//!
//! Supported grammar, loosest to tightest binding:
//! `or`/`||` < `and`/`&&` < `not`/`!` < comparisons
//! (`== != < <= > >= in contains`) < `+ -` < `* / %` < unary minus.
//! Literals: numbers, single- or double-quoted strings, `true`,
//! `false`, `null`. Unknown identifiers evaluate to `null`.

use serde_json::Value;

use gantry_core::error::{GantryError, Result};
use gantry_core::Context;

/// Evaluate an expression to its JSON value.
pub fn evaluate(expr: &str, ctx: &Context) -> Result<Value> {
    let tokens = lex(expr)?;
    if tokens.is_empty() {
        return Err(GantryError::Expression("empty expression".into()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        ctx,
    };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(GantryError::Expression(format!(
            "unexpected trailing input in '{}'",
            expr
        )));
    }
    Ok(value)
}

/// Evaluate an expression and coerce the result to a boolean.
pub fn evaluate_bool(expr: &str, ctx: &Context) -> Result<bool> {
    Ok(truthy(&evaluate(expr, ctx)?))
}

/// JSON truthiness: null, false, zero, and empty strings/arrays/objects
/// are false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Contains,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    return Err(GantryError::Expression(
                        "assignment is not supported, use '=='".into(),
                    ));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(GantryError::Expression("expected '&&'".into()));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(GantryError::Expression("expected '||'".into()));
                }
                tokens.push(Token::Or);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(GantryError::Expression(
                                "unterminated string literal".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        num.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed = num.parse::<f64>().map_err(|_| {
                    GantryError::Expression(format!("invalid number '{}'", num))
                })?;
                tokens.push(Token::Number(parsed));
            }
            ch if ch.is_alphabetic() || ch == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "contains" => Token::Contains,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "none" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(GantryError::Expression(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a Context,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.advance().as_ref() == Some(&token) {
            Ok(())
        } else {
            Err(GantryError::Expression(format!("expected {:?}", token)))
        }
    }

    fn or_expr(&mut self) -> Result<Value> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and_expr()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value> {
        let mut left = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.not_expr()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let value = self.not_expr()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(
                t @ (Token::Eq
                | Token::Ne
                | Token::Lt
                | Token::Le
                | Token::Gt
                | Token::Ge
                | Token::In
                | Token::Contains),
            ) => t.clone(),
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;

        let result = match op {
            Token::Eq => json_eq(&left, &right),
            Token::Ne => !json_eq(&left, &right),
            Token::Lt | Token::Le | Token::Gt | Token::Ge => order(&op, &left, &right)?,
            Token::In => membership(&left, &right)?,
            Token::Contains => membership(&right, &left)?,
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }

    fn additive(&mut self) -> Result<Value> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(t @ (Token::Plus | Token::Minus)) => t.clone(),
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = match op {
                Token::Plus => add(&left, &right)?,
                Token::Minus => arith(&left, &right, "-", |a, b| Ok(a - b))?,
                _ => unreachable!(),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Value> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(t @ (Token::Star | Token::Slash | Token::Percent)) => t.clone(),
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = match op {
                Token::Star => arith(&left, &right, "*", |a, b| Ok(a * b))?,
                Token::Slash => arith(&left, &right, "/", |a, b| {
                    if b == 0.0 {
                        Err(GantryError::Expression("division by zero".into()))
                    } else {
                        Ok(a / b)
                    }
                })?,
                Token::Percent => arith(&left, &right, "%", |a, b| {
                    if b == 0.0 {
                        Err(GantryError::Expression("modulo by zero".into()))
                    } else {
                        Ok(a % b)
                    }
                })?,
                _ => unreachable!(),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Minus) {
            self.advance();
            let value = self.unary()?;
            let n = as_number(&value)?;
            return Ok(number(-n));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(number(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let arg = self.or_expr()?;
                    self.expect(Token::RParen)?;
                    builtin(&name, &arg)
                } else {
                    // Unknown identifiers read as null so conditions like
                    // `x == null` work before x is ever set
                    Ok(self.ctx.get(&name).cloned().unwrap_or(Value::Null))
                }
            }
            other => Err(GantryError::Expression(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

/// The fixed builtin table. Anything else is rejected.
fn builtin(name: &str, arg: &Value) -> Result<Value> {
    match name {
        "len" => match arg {
            Value::String(s) => Ok(number(s.chars().count() as f64)),
            Value::Array(a) => Ok(number(a.len() as f64)),
            Value::Object(o) => Ok(number(o.len() as f64)),
            other => Err(GantryError::Expression(format!(
                "len() is not defined for {}",
                type_name(other)
            ))),
        },
        "abs" => Ok(number(as_number(arg)?.abs())),
        "str" => Ok(Value::String(Context::value_string(arg))),
        "int" => match arg {
            Value::Number(_) => Ok(number(as_number(arg)?.trunc())),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| GantryError::Expression(format!("int() cannot parse '{}'", s))),
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            other => Err(GantryError::Expression(format!(
                "int() is not defined for {}",
                type_name(other)
            ))),
        },
        other => Err(GantryError::Expression(format!(
            "unknown function '{}'",
            other
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A JSON number, collapsed to an integer when the value is integral.
fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        Value::from(f)
    }
}

fn as_number(value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        GantryError::Expression(format!("{} is not a number", type_name(value)))
    })
}

/// Equality with numeric cross-type tolerance (1 == 1.0).
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn order(op: &Token, a: &Value, b: &Value) -> Result<bool> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(match op {
            Token::Lt => x < y,
            Token::Le => x <= y,
            Token::Gt => x > y,
            Token::Ge => x >= y,
            _ => unreachable!(),
        });
    }
    let x = as_number(a)?;
    let y = as_number(b)?;
    Ok(match op {
        Token::Lt => x < y,
        Token::Le => x <= y,
        Token::Gt => x > y,
        Token::Ge => x >= y,
        _ => unreachable!(),
    })
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool> {
    match haystack {
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(GantryError::Expression(format!(
                "cannot search a string for {}",
                type_name(other)
            ))),
        },
        Value::Array(items) => Ok(items.iter().any(|item| json_eq(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key.as_str())),
            other => Err(GantryError::Expression(format!(
                "object keys are strings, not {}",
                type_name(other)
            ))),
        },
        other => Err(GantryError::Expression(format!(
            "'in' is not defined for {}",
            type_name(other)
        ))),
    }
}

fn add(a: &Value, b: &Value) -> Result<Value> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(Value::String(format!("{}{}", x, y)));
    }
    arith(a, b, "+", |x, y| Ok(x + y))
}

fn arith(
    a: &Value,
    b: &Value,
    op: &str,
    f: impl Fn(f64, f64) -> Result<f64>,
) -> Result<Value> {
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Err(GantryError::Expression(format!(
            "'{}' requires numbers, got {} and {}",
            op,
            type_name(a),
            type_name(b)
        )));
    };
    Ok(number(f(x, y)?))
}
