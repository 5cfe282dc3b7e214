//! Condition Evaluation
//!
//! A small expression language used to gate connections and steps:
//!
//! ```text
//! ${lookup.found} == true and ${lookup.score} >= 0.5
//! not (${input.tier} == "free" || ${input.seats} < 3)
//! ```
//!
//! Expressions are tokenized and parsed into an AST; `${path}` references
//! become typed values looked up in the execution state. Nothing is ever
//! evaluated as host code. Evaluation is fail-closed: a reference that
//! cannot be found, a malformed expression or a type error all yield
//! `false`. An empty expression is `true`.

use std::fmt;

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use super::resolver::resolve_path;
use crate::workflow::ExecutionState;

/// Errors produced while parsing or evaluating a condition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated {0}")]
    Unterminated(&'static str),

    #[error("unexpected token {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("reference '{0}' not found")]
    MissingReference(String),

    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("expression has more than {0} tokens")]
    TooLong(usize),
}

/// Closed set of values an expression can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Literal {
    /// Converts a JSON value; arrays and objects become their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Null),
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
        }
    }

    /// Numeric view; booleans count as 0/1.
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Reference(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Reference(r) => write!(f, "${{{}}}", r),
            Token::Ident(i) => write!(f, "'{}'", i),
            Token::Op(op) => write!(f, "'{}'", op),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

/// Multi-character operators first so `<=` wins over `<`.
const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '$' && chars.get(i + 1).map(|(_, c)| *c) == Some('{') {
            let rest = &source[offset + 2..];
            let end = rest.find('}').ok_or(ConditionError::Unterminated("reference"))?;
            tokens.push(Token::Reference(rest[..end].trim().to_string()));
            let consumed = offset + 2 + end + 1;
            while i < chars.len() && chars[i].0 < consumed {
                i += 1;
            }
            continue;
        }

        if c == '"' || c == '\'' {
            let mut text = String::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < chars.len() {
                let ch = chars[j].1;
                if ch == '\\' && j + 1 < chars.len() {
                    text.push(chars[j + 1].1);
                    j += 2;
                    continue;
                }
                if ch == c {
                    closed = true;
                    break;
                }
                text.push(ch);
                j += 1;
            }
            if !closed {
                return Err(ConditionError::Unterminated("string"));
            }
            tokens.push(Token::Str(text));
            i = j + 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|(_, d)| d.is_ascii_digit())) {
            let mut j = i;
            while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                j += 1;
            }
            let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
            let text = &source[offset..end];
            let n = text
                .parse::<f64>()
                .map_err(|_| ConditionError::UnexpectedToken(text.to_string()))?;
            tokens.push(Token::Number(n));
            i = j;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut j = i;
            while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                j += 1;
            }
            let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
            tokens.push(Token::Ident(source[offset..end].to_string()));
            i = j;
            continue;
        }

        if c == '(' || c == ')' {
            tokens.push(if c == '(' { Token::LParen } else { Token::RParen });
            i += 1;
            continue;
        }

        let rest = &source[offset..];
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(*op));
                i += op.len();
            }
            None => return Err(ConditionError::UnexpectedChar(c, offset)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Literal),
    Reference(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `a < b < c` compares pairwise and joins with and
    Compare(Box<Expr>, Vec<(CompareOp, Expr)>),
}

/// Deepest nesting of parentheses and prefix operators.
const MAX_NESTING: usize = 64;

/// Longest accepted expression; bounds operator chains.
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Result<Self, ConditionError> {
        if tokens.len() > MAX_TOKENS {
            return Err(ConditionError::TooLong(MAX_TOKENS));
        }
        Ok(Self {
            tokens,
            pos: 0,
            depth: 0,
        })
    }

    /// Parses one nested level with `f`.
    fn nested(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<Expr, ConditionError>,
    ) -> Result<Expr, ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(ConditionError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let expr = f(self);
        self.depth -= 1;
        expr
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, words: &[&str]) -> bool {
        match self.peek() {
            Some(Token::Ident(word)) => words.contains(&word.as_str()),
            Some(Token::Op(op)) => words.contains(op),
            _ => false,
        }
    }

    fn parse(mut self) -> Result<Expr, ConditionError> {
        let expr = self.parse_or()?;
        match self.next() {
            None => Ok(expr),
            Some(token) => Err(ConditionError::UnexpectedToken(token.to_string())),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword(&["or", "||"]) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_not()?;
        while self.peek_keyword(&["and", "&&"]) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        if self.peek_keyword(&["not", "!"]) {
            self.pos += 1;
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let first = self.parse_additive()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Op("==")) => CompareOp::Eq,
                Some(Token::Op("!=")) => CompareOp::Ne,
                Some(Token::Op("<")) => CompareOp::Lt,
                Some(Token::Op("<=")) => CompareOp::Le,
                Some(Token::Op(">")) => CompareOp::Gt,
                Some(Token::Op(">=")) => CompareOp::Ge,
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.parse_additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                Some(Token::Op("%")) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if matches!(self.peek(), Some(Token::Op("-"))) {
            self.pos += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next().ok_or(ConditionError::UnexpectedEnd)? {
            Token::Number(n) => Ok(Expr::Literal(Literal::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Token::Reference(path) => Ok(Expr::Reference(path)),
            Token::Ident(word) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(Literal::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Literal::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Literal::Null)),
                _ => Err(ConditionError::UnexpectedToken(format!("'{}'", word))),
            },
            Token::LParen => {
                let inner = self.nested(Self::parse_or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(token) => Err(ConditionError::UnexpectedToken(token.to_string())),
                    None => Err(ConditionError::Unterminated("parenthesis")),
                }
            }
            token => Err(ConditionError::UnexpectedToken(token.to_string())),
        }
    }
}

fn mismatch(op: &'static str, left: &Literal, right: &Literal) -> ConditionError {
    ConditionError::TypeMismatch {
        op,
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn equals(left: &Literal, right: &Literal) -> bool {
    match (left, right) {
        (Literal::Null, Literal::Null) => true,
        (Literal::Str(a), Literal::Str(b)) => a == b,
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn compare(op: CompareOp, left: &Literal, right: &Literal) -> Result<bool, ConditionError> {
    match op {
        CompareOp::Eq => return Ok(equals(left, right)),
        CompareOp::Ne => return Ok(!equals(left, right)),
        _ => {}
    }

    let ordering = match (left, right) {
        (Literal::Str(a), Literal::Str(b)) => a.partial_cmp(b),
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
    .ok_or_else(|| mismatch(op.symbol(), left, right))?;

    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
    })
}

fn arithmetic(op: BinaryOp, left: Literal, right: Literal) -> Result<Literal, ConditionError> {
    if let (BinaryOp::Add, Literal::Str(a), Literal::Str(b)) = (op, &left, &right) {
        return Ok(Literal::Str(format!("{}{}", a, b)));
    }

    let symbol = match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
    };
    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return Err(mismatch(symbol, &left, &right));
    };

    let n = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ConditionError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
    };
    Ok(Literal::Number(n))
}

fn eval(expr: &Expr, lookup: &dyn Fn(&str) -> Option<Literal>) -> Result<Literal, ConditionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Reference(path) => {
            lookup(path).ok_or_else(|| ConditionError::MissingReference(path.clone()))
        }
        Expr::Not(inner) => Ok(Literal::Bool(!eval(inner, lookup)?.truthy())),
        Expr::Neg(inner) => {
            let value = eval(inner, lookup)?;
            match value.as_number() {
                Some(n) => Ok(Literal::Number(-n)),
                None => Err(mismatch("-", &Literal::Number(0.0), &value)),
            }
        }
        Expr::And(left, right) => {
            if !eval(left, lookup)?.truthy() {
                return Ok(Literal::Bool(false));
            }
            Ok(Literal::Bool(eval(right, lookup)?.truthy()))
        }
        Expr::Or(left, right) => {
            if eval(left, lookup)?.truthy() {
                return Ok(Literal::Bool(true));
            }
            Ok(Literal::Bool(eval(right, lookup)?.truthy()))
        }
        Expr::Binary(op, left, right) => {
            arithmetic(*op, eval(left, lookup)?, eval(right, lookup)?)
        }
        Expr::Compare(first, rest) => {
            let mut left = eval(first, lookup)?;
            for (op, right_expr) in rest {
                let right = eval(right_expr, lookup)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Literal::Bool(false));
                }
                left = right;
            }
            Ok(Literal::Bool(true))
        }
    }
}

fn collect_references<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Reference(path) => out.push(path),
        Expr::Literal(_) => {}
        Expr::Not(inner) | Expr::Neg(inner) => collect_references(inner, out),
        Expr::And(l, r) | Expr::Or(l, r) | Expr::Binary(_, l, r) => {
            collect_references(l, out);
            collect_references(r, out);
        }
        Expr::Compare(first, rest) => {
            collect_references(first, out);
            for (_, e) in rest {
                collect_references(e, out);
            }
        }
    }
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Option<Expr>,
}

impl Condition {
    /// Parses an expression; blank input is the always-true condition.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let trimmed = source.trim();
        let expr = if trimmed.is_empty() {
            None
        } else {
            Some(Parser::new(tokenize(trimmed)?)?.parse()?)
        };
        Ok(Self {
            source: trimmed.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Paths referenced by the expression, in order of appearance.
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        if let Some(expr) = &self.expr {
            collect_references(expr, &mut refs);
        }
        refs
    }

    /// Evaluates against the execution state.
    ///
    /// Every reference must resolve before anything is evaluated; the
    /// first missing one is reported.
    pub fn evaluate(&self, state: &ExecutionState) -> Result<bool, ConditionError> {
        let Some(expr) = &self.expr else {
            return Ok(true);
        };

        for path in self.references() {
            if resolve_path(path, state).is_none() {
                return Err(ConditionError::MissingReference(path.to_string()));
            }
        }

        let lookup = |path: &str| resolve_path(path, state).map(|v| Literal::from_json(&v));
        Ok(eval(expr, &lookup)?.truthy())
    }
}

/// Evaluates a condition expression, failing closed.
///
/// Blank expressions are true. Missing references, parse errors and type
/// errors are logged and evaluate to false.
pub fn evaluate_condition(expression: &str, state: &ExecutionState) -> bool {
    let result = Condition::parse(expression).and_then(|c| c.evaluate(state));
    match result {
        Ok(value) => {
            debug!("Condition '{}' evaluated to {}", expression.trim(), value);
            value
        }
        Err(ConditionError::MissingReference(path)) => {
            warn!(
                "Condition '{}' references missing '{}'; treating as false",
                expression.trim(),
                path
            );
            false
        }
        Err(e) => {
            warn!(
                "Condition '{}' could not be evaluated ({}); treating as false",
                expression.trim(),
                e
            );
            false
        }
    }
}
