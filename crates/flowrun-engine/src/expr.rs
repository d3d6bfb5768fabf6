//! Predicate language for condition nodes.
//!
//! Supported: `||` / `or`, `&&` / `and`, `!` / `not`, comparisons
//! `== != > >= < <=`, `contains`, parentheses, string/number/bool/null
//! literals and dotted identifiers resolved against the Run State.
//! A bare operand is tested for truthiness.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExprError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError("unterminated string literal".into())),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ExprError(format!("expected '{}{}'", c, c)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let eq_next = chars.get(i + 1) == Some(&'=');
                let token = match (c, eq_next) {
                    ('=', true) => Token::Op(CmpOp::Eq),
                    ('!', true) => Token::Op(CmpOp::Ne),
                    ('<', true) => Token::Op(CmpOp::Le),
                    ('>', true) => Token::Op(CmpOp::Ge),
                    ('<', false) => Token::Op(CmpOp::Lt),
                    ('>', false) => Token::Op(CmpOp::Gt),
                    ('!', false) => Token::Not,
                    _ => return Err(ExprError("single '=' is not an operator, use '=='".into())),
                };
                i += if eq_next { 2 } else { 1 };
                tokens.push(token);
            }
            _ if c.is_ascii_digit() || (c == '-' && starts_number(&chars, i, &tokens)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(n));
            }
            _ if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CmpOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(ExprError(format!("unexpected character '{}'", c))),
        }
    }
    Ok(tokens)
}

/// A '-' starts a number literal when followed by a digit and not preceded
/// by an operand.
fn starts_number(chars: &[char], i: usize, tokens: &[Token]) -> bool {
    let digit_follows = chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
    let after_operand = matches!(
        tokens.last(),
        Some(
            Token::Ident(_)
                | Token::Str(_)
                | Token::Num(_)
                | Token::True
                | Token::False
                | Token::Null
                | Token::RParen
        )
    );
    digit_follows && !after_operand
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

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Path(name)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError("missing ')'".into())),
                }
            }
            Some(other) => Err(ExprError(format!("unexpected token {:?}", other))),
            None => Err(ExprError("unexpected end of expression".into())),
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl Expr {
    /// Parse a predicate.
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExprError("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if let Some(extra) = parser.peek() {
            return Err(ExprError(format!("unexpected trailing token {:?}", extra)));
        }
        Ok(expr)
    }

    /// Evaluate to a boolean against a state snapshot.
    pub fn evaluate(&self, state: &HashMap<String, Value>) -> bool {
        truthy(&self.value(state))
    }

    fn value(&self, state: &HashMap<String, Value>) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(path) => lookup(state, path).cloned().unwrap_or(Value::Null),
            Self::Not(inner) => Value::Bool(!inner.evaluate(state)),
            Self::And(a, b) => Value::Bool(a.evaluate(state) && b.evaluate(state)),
            Self::Or(a, b) => Value::Bool(a.evaluate(state) || b.evaluate(state)),
            Self::Compare(op, a, b) => Value::Bool(compare(*op, &a.value(state), &b.value(state))),
        }
    }
}

/// Resolve a dotted path. A key containing dots is matched whole first.
pub fn lookup<'a>(state: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = state.get(path) {
        return Some(v);
    }
    let mut segments = path.split('.');
    let mut current = state.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

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

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    };

    match op {
        CmpOp::Eq => values_equal(a, b),
        CmpOp::Ne => !values_equal(a, b),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Contains => match (a, b) {
            (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn eval(src: &str, st: &HashMap<String, Value>) -> bool {
        Expr::parse(src).unwrap().evaluate(st)
    }

    #[test]
    fn equality_on_strings() {
        let st = state(&[("status", json!("success"))]);
        assert!(eval(r#"status == "success""#, &st));
        assert!(!eval(r#"status == 'failure'"#, &st));
        assert!(eval(r#"status != "failure""#, &st));
    }

    #[test]
    fn numeric_comparisons() {
        let st = state(&[("score", json!(7)), ("ratio", json!(0.5))]);
        assert!(eval("score > 5", &st));
        assert!(eval("score >= 7", &st));
        assert!(!eval("score < 7", &st));
        assert!(eval("score == 7.0", &st));
        assert!(eval("ratio <= 0.5 && score > -1", &st));
    }

    #[test]
    fn boolean_logic_and_precedence() {
        let st = state(&[("a", json!(true)), ("b", json!(false))]);
        assert!(eval("a || b && false", &st));
        assert!(!eval("(a || b) && b", &st));
        assert!(eval("!b", &st));
        assert!(eval("not b and a", &st));
    }

    #[test]
    fn contains_operator() {
        let st = state(&[
            ("output", json!("The file was created successfully.")),
            ("tags", json!(["rust", "async"])),
            ("meta", json!({"lang": "en"})),
        ]);
        assert!(eval(r#"output contains "created""#, &st));
        assert!(!eval(r#"output contains "deleted""#, &st));
        assert!(eval(r#"tags contains "rust""#, &st));
        assert!(eval(r#"meta contains "lang""#, &st));
    }

    #[test]
    fn dotted_paths_and_missing_keys() {
        let st = state(&[("user", json!({"age": 30, "roles": ["admin"]}))]);
        assert!(eval("user.age >= 18", &st));
        assert!(eval(r#"user.roles.0 == "admin""#, &st));
        assert!(!eval("missing == \"value\"", &st));
        assert!(eval("missing == null", &st));
        assert!(!eval("missing", &st));
    }

    #[test]
    fn truthiness_of_bare_operands() {
        let st = state(&[("name", json!("")), ("items", json!([1]))]);
        assert!(!eval("name", &st));
        assert!(eval("items", &st));
    }

    #[test]
    fn mixed_types_do_not_order() {
        let st = state(&[("n", json!("10"))]);
        assert!(!eval("n > 5", &st));
        assert!(!eval("n < 5", &st));
    }

    #[test]
    fn parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("a = 1").is_err());
        assert!(Expr::parse("(a == 1").is_err());
        assert!(Expr::parse("a == 'open").is_err());
        assert!(Expr::parse("a == 1 b").is_err());
        assert!(Expr::parse("a & b").is_err());
    }
}
