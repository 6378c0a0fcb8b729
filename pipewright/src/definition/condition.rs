//! Boolean expressions for stage conditions and quality gates.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) primary )?
//! primary := "(" expr ")" | literal | path
//! literal := true | false | null | number | 'text' | "text"
//! path    := ident ( "." ident )*
//! ```
//!
//! Paths are resolved against the run scope, a JSON object holding
//! `topic`, `run_id`, `vars` and `stages.<id>.{status,success,output}`.
//! Missing paths resolve to `null`.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first syntax error.
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected token '{tok}'"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Returns the original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression and applies truthiness.
    #[must_use]
    pub fn evaluate(&self, scope: &Value) -> bool {
        truthy(&self.expr.eval(scope))
    }

    /// Evaluates the expression to a raw value.
    #[must_use]
    pub fn value(&self, scope: &Value) -> Value {
        self.expr.eval(scope)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Resolves a dotted path such as `stages.research.output.sources`.
///
/// Numeric segments index into arrays.
#[must_use]
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.
#[must_use]
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, scope: &Value) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(p) => lookup(scope, p).cloned().unwrap_or(Value::Null),
            Self::Not(inner) => Value::Bool(!truthy(&inner.eval(scope))),
            Self::And(l, r) => Value::Bool(truthy(&l.eval(scope)) && truthy(&r.eval(scope))),
            Self::Or(l, r) => Value::Bool(truthy(&l.eval(scope)) || truthy(&r.eval(scope))),
            Self::Compare(op, l, r) => Value::Bool(compare(*op, &l.eval(scope), &r.eval(scope))),
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        CmpOp::Eq => ordering.map_or_else(|| left == right, |o| o == Ordering::Equal),
        CmpOp::Ne => ordering.map_or_else(|| left != right, |o| o != Ordering::Equal),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CmpOp),
    Ident(String),
    Str(String),
    Num(f64),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::Not => f.write_str("!"),
            Self::And => f.write_str("&&"),
            Self::Or => f.write_str("||"),
            Self::Op(op) => f.write_str(match op {
                CmpOp::Eq => "==",
                CmpOp::Ne => "!=",
                CmpOp::Lt => "<",
                CmpOp::Le => "<=",
                CmpOp::Gt => ">",
                CmpOp::Ge => ">=",
            }),
            Self::Ident(s) => f.write_str(s),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Num(n) => write!(f, "{n}"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let inclusive = next == Some('=');
                tokens.push(Token::Op(match (c, inclusive) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    (_, false) => CmpOp::Gt,
                    (_, true) => CmpOp::Ge,
                }));
                i += if inclusive { 2 } else { 1 };
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| format!("unterminated string at offset {i}"))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}' at offset {i}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Ident(ident)) => Ok(match ident.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Path(ident),
            }),
            Some(tok) => Err(format!("unexpected token '{tok}'")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "topic": "rust",
            "vars": {"illustrate": true, "chapters": 3, "style": "formal"},
            "stages": {
                "research": {"status": "completed", "success": true, "output": {"sources": ["a", "b"]}},
                "fact-check": {"status": "failed", "success": false, "output": {}}
            }
        })
    }

    #[test]
    fn test_path_truthiness() {
        assert!(Condition::parse("vars.illustrate").unwrap().evaluate(&scope()));
        assert!(!Condition::parse("vars.missing").unwrap().evaluate(&scope()));
        assert!(Condition::parse("stages.research.output.sources").unwrap().evaluate(&scope()));
    }

    #[test]
    fn test_boolean_operators() {
        let s = scope();
        assert!(Condition::parse("stages.research.success && vars.illustrate")
            .unwrap()
            .evaluate(&s));
        assert!(Condition::parse("stages.fact-check.success || vars.illustrate")
            .unwrap()
            .evaluate(&s));
        assert!(!Condition::parse("!(vars.illustrate)").unwrap().evaluate(&s));
        assert!(Condition::parse("!stages.fact-check.success").unwrap().evaluate(&s));
    }

    #[test]
    fn test_comparisons() {
        let s = scope();
        assert!(Condition::parse("vars.chapters == 3").unwrap().evaluate(&s));
        assert!(Condition::parse("vars.chapters >= 2 && vars.chapters < 4")
            .unwrap()
            .evaluate(&s));
        assert!(Condition::parse("vars.style == 'formal'").unwrap().evaluate(&s));
        assert!(Condition::parse("stages.research.status != \"failed\"")
            .unwrap()
            .evaluate(&s));
        assert!(Condition::parse("vars.missing == null").unwrap().evaluate(&s));
        assert!(!Condition::parse("vars.style > 3").unwrap().evaluate(&s));
    }

    #[test]
    fn test_lookup_array_index() {
        let s = scope();
        assert_eq!(
            lookup(&s, "stages.research.output.sources.1"),
            Some(&json!("b"))
        );
        assert_eq!(lookup(&s, "stages.research.output.sources.9"), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("(vars.a").is_err());
        assert!(Condition::parse("vars.a &&").is_err());
        assert!(Condition::parse("vars.a vars.b").is_err());
        assert!(Condition::parse("'open").is_err());
        assert!(Condition::parse("vars.a # 1").is_err());
    }
}
