//! A line-oriented language understood by [`LocalKernel`](super::LocalKernel).
//!
//! ```text
//! # comment
//! total = (a + b) * config.scale
//! print "total is " + total
//! progress 0.5
//! sleep 20
//! fail "bad input"
//! ```

use crate::progress;
use pipecore::{RemoteError, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

pub type Namespace = BTreeMap<String, Value>;

/// Run every statement of `code`, streaming printed text to `stdout`.
pub async fn run(
    code: &str,
    namespace: &mut Namespace,
    stdout: &watch::Sender<String>,
) -> Result<(), RemoteError> {
    let mut captured = String::new();

    for (index, raw) in code.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let outcome = statement(line, namespace, &mut captured, stdout).await;
        if let Err(err) = outcome {
            let traceback = format!(
                "Traceback (line {}):\n    {}\n{}: {}",
                index + 1,
                line,
                err.kind,
                err.message
            );
            return Err(err.with_traceback(traceback));
        }
    }

    Ok(())
}

async fn statement(
    line: &str,
    namespace: &mut Namespace,
    captured: &mut String,
    stdout: &watch::Sender<String>,
) -> Result<(), RemoteError> {
    if let Some(rest) = keyword(line, "print") {
        let value = eval(rest, namespace)?;
        captured.push_str(&value.to_string());
        captured.push('\n');
        stdout.send_replace(captured.clone());
    } else if let Some(rest) = keyword(line, "progress") {
        let fraction = number(eval(rest, namespace)?)?;
        captured.push_str(&progress::marker(fraction));
        captured.push('\n');
        stdout.send_replace(captured.clone());
    } else if let Some(rest) = keyword(line, "sleep") {
        let millis = number(eval(rest, namespace)?)?.max(0.0);
        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
    } else if let Some(rest) = keyword(line, "fail") {
        let message = eval(rest, namespace)?;
        return Err(RemoteError::new("ScriptError", message.to_string()));
    } else if let Some((name, expr)) = line.split_once('=') {
        let name = name.trim();
        if !is_identifier(name) {
            return Err(RemoteError::new(
                "SyntaxError",
                format!("cannot assign to '{}'", name),
            ));
        }
        let value = eval(expr, namespace)?;
        namespace.insert(name.to_string(), value);
    } else {
        return Err(RemoteError::new("SyntaxError", "invalid statement"));
    }
    Ok(())
}

fn keyword<'a>(line: &'a str, word: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(word)?;
    if rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn number(value: Value) -> Result<f64, RemoteError> {
    value.as_f64().ok_or_else(|| {
        RemoteError::new(
            "TypeError",
            format!("expected number, got {}", value.type_name()),
        )
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Name(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(src: &str) -> Result<Vec<Token>, RemoteError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = text.parse().map_err(|_| {
                    RemoteError::new("SyntaxError", format!("invalid number '{}'", text))
                })?;
                tokens.push(Token::Number(n));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(d) => text.push(d),
                        None => {
                            return Err(RemoteError::new(
                                "SyntaxError",
                                "unterminated string",
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '+' | '-' | '*' | '/' => {
                chars.next();
                tokens.push(Token::Op(c));
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(text));
            }
            other => {
                return Err(RemoteError::new(
                    "SyntaxError",
                    format!("unexpected character '{}'", other),
                ))
            }
        }
    }

    Ok(tokens)
}

fn eval(src: &str, namespace: &Namespace) -> Result<Value, RemoteError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        namespace,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(RemoteError::new("SyntaxError", "unexpected trailing input"));
    }
    Ok(value)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    namespace: &'a Namespace,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<Value, RemoteError> {
        let mut left = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.term()?;
            left = binary(op, left, right)?;
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Value, RemoteError> {
        let mut left = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.factor()?;
            left = binary(op, left, right)?;
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Value, RemoteError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| RemoteError::new("SyntaxError", "unexpected end of expression"))?;
        self.pos += 1;

        match token {
            Token::Number(n) => Ok(Value::Number(n)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Name(name) => lookup(&name, self.namespace),
            Token::Op('-') => {
                let value = self.factor()?;
                Ok(Value::Number(-number(value)?))
            }
            Token::Open => {
                let value = self.expr()?;
                match self.peek() {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err(RemoteError::new("SyntaxError", "expected ')'")),
                }
            }
            other => Err(RemoteError::new(
                "SyntaxError",
                format!("unexpected token {:?}", other),
            )),
        }
    }
}

fn lookup(path: &str, namespace: &Namespace) -> Result<Value, RemoteError> {
    let mut parts = path.split('.');
    let head = parts.next().unwrap_or_default();
    let mut value = match head {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => namespace.get(head).cloned().ok_or_else(|| {
            RemoteError::new("NameError", format!("name '{}' is not defined", head))
        })?,
    };

    for key in parts {
        value = value
            .field(key)
            .ok_or_else(|| RemoteError::new("KeyError", format!("'{}' in '{}'", key, path)))?;
    }
    Ok(value)
}

fn binary(op: char, left: Value, right: Value) -> Result<Value, RemoteError> {
    match (op, &left, &right) {
        ('+', Value::String(a), b) => Ok(Value::String(format!("{}{}", a, b))),
        ('+', a, Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (_, Value::Number(a), Value::Number(b)) => match op {
            '+' => Ok(Value::Number(a + b)),
            '-' => Ok(Value::Number(a - b)),
            '*' => Ok(Value::Number(a * b)),
            _ if *b == 0.0 => Err(RemoteError::new("ZeroDivisionError", "division by zero")),
            _ => Ok(Value::Number(a / b)),
        },
        _ => Err(RemoteError::new(
            "TypeError",
            format!(
                "unsupported operand types for {}: {} and {}",
                op,
                left.type_name(),
                right.type_name()
            ),
        )),
    }
}
