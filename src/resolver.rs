//! Placeholder resolution for pipeline stage arguments.
//!
//! Any string value inside a stage's `args` or `run_if` may contain
//! `${{ expression }}` regions. Expressions are evaluated against the
//! pipeline context and support member access, arithmetic, comparison and
//! boolean logic. A string that consists of exactly one region yields the
//! native value; embedded regions render as strings.

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigError;

pub struct Resolver {
    region: Regex,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            region: Regex::new(r"\$\{\{(.*?)\}\}").expect("hardcoded regex"),
        }
    }

    /// Resolve every string in `template` recursively: lists element-wise,
    /// mappings value-wise, everything else as-is.
    pub fn resolve(&self, template: &Value, context: &Value) -> Result<Value, ConfigError> {
        match template {
            Value::String(s) => self.resolve_str(s, context),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| Ok((key.clone(), self.resolve(value, context)?)))
                .collect::<Result<serde_json::Map<_, _>, ConfigError>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve one string. A bare `${{ x }}` yields the native context value;
    /// a region embedded in surrounding text renders as a string.
    pub fn resolve_str(&self, template: &str, context: &Value) -> Result<Value, ConfigError> {
        let trimmed = template.trim();
        if let Some(captures) = self.region.captures(trimmed) {
            let whole = captures.get(0).expect("regex match");
            if whole.start() == 0 && whole.end() == trimmed.len() {
                return eval_expression(&captures[1], context).map_err(|reason| {
                    ConfigError::BadTemplate {
                        template: template.to_string(),
                        reason,
                    }
                });
            }
        }

        let mut rendered = String::new();
        let mut last_end = 0;
        for captures in self.region.captures_iter(trimmed) {
            let whole = captures.get(0).expect("regex match");
            rendered.push_str(&trimmed[last_end..whole.start()]);
            let value = eval_expression(&captures[1], context).map_err(|reason| {
                ConfigError::BadTemplate {
                    template: template.to_string(),
                    reason,
                }
            })?;
            rendered.push_str(&stringify(&value));
            last_end = whole.end();
        }
        rendered.push_str(&trimmed[last_end..]);
        Ok(Value::String(rendered))
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
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
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
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
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("expected '==' in expression".to_string());
                }
                tokens.push(Token::Eq);
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
                    return Err("expected '&&' in expression".to_string());
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err("expected '||' in expression".to_string());
                }
                tokens.push(Token::Or);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => literal.push(ch),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() => {
                let mut number = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        number.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // a '.' is part of the number only when a digit follows
                let mut lookahead = chars.clone();
                if lookahead.next() == Some('.')
                    && lookahead.peek().is_some_and(|ch| ch.is_ascii_digit())
                {
                    number.push('.');
                    chars.next();
                    while let Some(&ch) = chars.peek() {
                        if ch.is_ascii_digit() {
                            number.push(ch);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let parsed: f64 = number.parse().map_err(|_| format!("bad number {number}"))?;
                    tokens.push(Token::Float(parsed));
                } else {
                    let parsed: i64 = number.parse().map_err(|_| format!("bad number {number}"))?;
                    tokens.push(Token::Int(parsed));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    context: &'a Value,
}

pub fn eval_expression(expression: &str, context: &Value) -> Result<Value, String> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser {
        tokens,
        position: 0,
        context,
    };
    let value = parser.or_expr()?;
    if parser.position != parser.tokens.len() {
        return Err(format!("unexpected trailing tokens in '{expression}'"));
    }
    Ok(value)
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn or_expr(&mut self) -> Result<Value, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and_expr()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, String> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.equality()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Value, String> {
        let mut left = self.comparison()?;
        loop {
            let negate = match self.peek() {
                Some(Token::Eq) => false,
                Some(Token::Ne) => true,
                _ => break,
            };
            self.advance();
            let right = self.comparison()?;
            let equal = values_equal(&left, &right);
            left = Value::Bool(equal != negate);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value, String> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        let ordering = compare(&left, &right)?;
        let result = match op {
            Token::Lt => ordering.is_lt(),
            Token::Le => ordering.is_le(),
            Token::Gt => ordering.is_gt(),
            Token::Ge => ordering.is_ge(),
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }

    fn additive(&mut self) -> Result<Value, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Token::Plus,
                Some(Token::Minus) => Token::Minus,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = match op {
                Token::Plus => add(&left, &right)?,
                Token::Minus => numeric_op(&left, &right, |a, b| a - b, |a, b| a.checked_sub(b))?,
                _ => unreachable!(),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Value, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Token::Star,
                Some(Token::Slash) => Token::Slash,
                Some(Token::Percent) => Token::Percent,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = match op {
                Token::Star => numeric_op(&left, &right, |a, b| a * b, |a, b| a.checked_mul(b))?,
                Token::Slash => divide(&left, &right)?,
                Token::Percent => modulo(&left, &right)?,
                _ => unreachable!(),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let value = self.unary()?;
                numeric_op(&Value::from(0), &value, |a, b| a - b, |a, b| a.checked_sub(b))
            }
            Some(Token::Not) => {
                self.advance();
                let value = self.unary()?;
                Ok(Value::Bool(!truthy(&value)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Value, String> {
        let mut value = self.primary()?;
        let mut path = String::new();
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            let member = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => return Err(format!("expected member name after '.', got {other:?}")),
            };
            value = match &value {
                Value::Object(map) => map
                    .get(&member)
                    .cloned()
                    .ok_or_else(|| format!("undefined member '{member}' (after '{path}')"))?,
                other => {
                    return Err(format!(
                        "cannot access member '{member}' on non-object value {other}"
                    ))
                }
            };
            path.push('.');
            path.push_str(&member);
        }
        Ok(value)
    }

    fn primary(&mut self) -> Result<Value, String> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Value::from(n)),
            Some(Token::Float(f)) => Ok(Value::from(f)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => match self.context {
                    Value::Object(map) => map
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| format!("undefined name '{name}'")),
                    _ => Err(format!("undefined name '{name}'")),
                },
            },
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                if self.advance() != Some(Token::RParen) {
                    return Err("expected ')'".to_string());
                }
                Ok(value)
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, String> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let a = left
                .as_f64()
                .ok_or_else(|| format!("cannot compare non-numeric value {left}"))?;
            let b = right
                .as_f64()
                .ok_or_else(|| format!("cannot compare non-numeric value {right}"))?;
            a.partial_cmp(&b)
                .ok_or_else(|| "cannot compare NaN".to_string())
        }
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, String> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    numeric_op(left, right, |a, b| a + b, |a, b| a.checked_add(b))
}

fn numeric_op(
    left: &Value,
    right: &Value,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, String> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        if let Some(result) = int_op(a, b) {
            return Ok(Value::from(result));
        }
    }
    let a = left
        .as_f64()
        .ok_or_else(|| format!("arithmetic on non-numeric value {left}"))?;
    let b = right
        .as_f64()
        .ok_or_else(|| format!("arithmetic on non-numeric value {right}"))?;
    Ok(Value::from(float_op(a, b)))
}

fn divide(left: &Value, right: &Value) -> Result<Value, String> {
    let a = left
        .as_f64()
        .ok_or_else(|| format!("arithmetic on non-numeric value {left}"))?;
    let b = right
        .as_f64()
        .ok_or_else(|| format!("arithmetic on non-numeric value {right}"))?;
    if b == 0.0 {
        return Err("division by zero".to_string());
    }
    Ok(Value::from(a / b))
}

fn modulo(left: &Value, right: &Value) -> Result<Value, String> {
    match (left.as_i64(), right.as_i64()) {
        (Some(_), Some(0)) => Err("division by zero".to_string()),
        (Some(a), Some(b)) => Ok(Value::from(a % b)),
        _ => Err(format!("modulo on non-integer values {left} and {right}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "global": {"temp_dir": "/tmp/testing", "task_names": ["a", "b"]},
            "task": {"task_name": "sorting", "task_score_percent": 0.5},
            "parameters": {"timeout": 60, "run_linter": true},
            "env": {"CI": "1"},
            "outputs": {"tests": {"percentage": 0.8, "failed": false}},
        })
    }

    fn resolve(template: &str) -> Value {
        Resolver::new().resolve_str(template, &context()).unwrap()
    }

    #[test]
    fn test_bare_region_yields_native_value() {
        assert_eq!(resolve("${{ parameters.timeout }}"), json!(60));
        assert_eq!(resolve("${{ parameters.run_linter }}"), json!(true));
        assert_eq!(resolve("${{ task.task_score_percent }}"), json!(0.5));
        assert_eq!(resolve("${{ global.task_names }}"), json!(["a", "b"]));
    }

    #[test]
    fn test_embedded_region_renders_as_string() {
        assert_eq!(
            resolve("${{ global.temp_dir }}/build"),
            json!("/tmp/testing/build")
        );
        assert_eq!(
            resolve("timeout is ${{ parameters.timeout }}s"),
            json!("timeout is 60s")
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(resolve("${{ 2 + 3 * 4 }}"), json!(14));
        assert_eq!(resolve("${{ (2 + 3) * 4 }}"), json!(20));
        assert_eq!(resolve("${{ 7 % 3 }}"), json!(1));
        assert_eq!(resolve("${{ -parameters.timeout }}"), json!(-60));
        assert_eq!(resolve("${{ 1 / 2 }}"), json!(0.5));
        assert_eq!(resolve("${{ parameters.timeout * 2 }}"), json!(120));
    }

    #[test]
    fn test_comparisons_and_boolean_logic() {
        assert_eq!(resolve("${{ outputs.tests.percentage >= 0.5 }}"), json!(true));
        assert_eq!(resolve("${{ task.task_name == 'sorting' }}"), json!(true));
        assert_eq!(resolve("${{ 1 != 1.0 }}"), json!(false));
        assert_eq!(
            resolve("${{ outputs.tests.failed || parameters.run_linter }}"),
            json!(true)
        );
        assert_eq!(resolve("${{ !outputs.tests.failed }}"), json!(true));
        assert_eq!(
            resolve("${{ env.CI == '1' && parameters.timeout > 30 }}"),
            json!(true)
        );
    }

    #[test]
    fn test_undefined_name_is_config_error() {
        let err = Resolver::new()
            .resolve_str("${{ unknown_root }}", &context())
            .unwrap_err();
        assert!(err.to_string().contains("undefined name 'unknown_root'"));

        let err = Resolver::new()
            .resolve_str("${{ parameters.missing }}", &context())
            .unwrap_err();
        assert!(err.to_string().contains("undefined member 'missing'"));
    }

    #[test]
    fn test_resolve_nested_tree() {
        let template = json!({
            "origin": "${{ global.temp_dir }}",
            "scores": ["${{ outputs.tests.percentage }}", 1.0],
            "timeout": 30,
        });
        let resolved = Resolver::new().resolve(&template, &context()).unwrap();
        assert_eq!(
            resolved,
            json!({
                "origin": "/tmp/testing",
                "scores": [0.8, 1.0],
                "timeout": 30,
            })
        );
    }

    #[test]
    fn test_plain_string_untouched() {
        assert_eq!(resolve("echo hello"), json!("echo hello"));
    }

    #[test]
    fn test_division_by_zero() {
        let err = Resolver::new()
            .resolve_str("${{ 1 / 0 }}", &context())
            .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }
}
