//! Explicitly registered capabilities that can answer part of a query locally.
//!
//! A capability inspects the query, says whether it applies, and produces a
//! short text that the augmenter merges into the prompt as tool output.
//! Registration happens once at startup; there is no discovery.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local};
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::error::{Error, Result};
use crate::query::Query;

/// A locally executed helper.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique name, used as the supplement source label.
    fn name(&self) -> &str;

    /// Whether this capability applies to the query.
    fn can_handle(&self, query: &Query) -> bool;

    /// Produce text for the prompt.
    async fn execute(&self, query: &Query) -> Result<String>;
}

/// Ordered set of registered capabilities.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    entries: Vec<Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("entries", &self.names())
            .finish()
    }
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the arithmetic and clock capabilities registered.
    pub fn with_builtins() -> Self {
        Self {
            entries: vec![
                Arc::new(ArithmeticCapability),
                Arc::new(ClockCapability::new()),
            ],
        }
    }

    /// Register a capability. Names must be unique.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        if self.get(capability.name()).is_some() {
            return Err(Error::Config(format!(
                "capability '{}' registered twice",
                capability.name()
            )));
        }
        self.entries.push(capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.iter().find(|c| c.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|c| c.name()).collect()
    }

    /// Capabilities that claim the query, in registration order.
    pub fn matching(&self, query: &Query) -> Vec<Arc<dyn Capability>> {
        self.entries
            .iter()
            .filter(|c| c.can_handle(query))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

static PERCENT_OF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(-?\d+(?:\.\d+)?)\s*%\s*of\s*(-?\d+(?:\.\d+)?)").expect("invalid regex")
});

static EXPRESSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\d\s.+\-*/^()×÷]+").expect("invalid regex"));

static MATH_CUE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(calculate|compute|evaluate|solve|what\s+is|what's|how\s+much|=)")
        .expect("invalid regex")
});

/// Evaluates arithmetic expressions and "N% of M" questions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticCapability;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Op(char),
    Open,
    Close,
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(literal.parse().ok()?));
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '×' => {
                tokens.push(Token::Op('*'));
                i += 1;
            }
            '÷' => {
                tokens.push(Token::Op('/'));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            _ => return None,
        }
    }
    Some(tokens)
}

/// Recursive-descent evaluator over `+ - * / ^` and parentheses.
struct Evaluator {
    tokens: Vec<Token>,
    pos: usize,
}

impl Evaluator {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.power()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            self.pos += 1;
            let rhs = self.power()?;
            if op == '/' {
                if rhs == 0.0 {
                    return Err("division by zero".to_string());
                }
                value /= rhs;
            } else {
                value *= rhs;
            }
        }
        Ok(value)
    }

    // Right-associative.
    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.unary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> std::result::Result<f64, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err("unbalanced parentheses".to_string()),
                }
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expr: &str) -> std::result::Result<f64, String> {
    let tokens = tokenize(expr).ok_or_else(|| "invalid character".to_string())?;
    let mut evaluator = Evaluator { tokens, pos: 0 };
    let value = evaluator.expr()?;
    if evaluator.pos != evaluator.tokens.len() {
        return Err("trailing input".to_string());
    }
    if !value.is_finite() {
        return Err("result is not finite".to_string());
    }
    Ok(value)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.6}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn has_operator_between_numbers(candidate: &str) -> bool {
    matches!(tokenize(candidate), Some(tokens) if tokens.iter().filter(|t| matches!(t, Token::Num(_))).count() >= 2
        && tokens.iter().any(|t| matches!(t, Token::Op(_))))
}

impl ArithmeticCapability {
    /// Longest evaluable arithmetic span in `text`, if the text reads as a
    /// math question.
    fn extract_expression(text: &str) -> Option<String> {
        let trimmed = text.trim();
        let candidate = EXPRESSION_PATTERN
            .find_iter(trimmed)
            .map(|m| m.as_str().trim())
            .filter(|s| has_operator_between_numbers(s) && evaluate(s).is_ok())
            .max_by_key(|s| s.len())?;

        // Dates and version strings look like subtraction; require either a
        // cue word or that the expression is most of the text.
        let dominant = candidate.len() * 10 >= trimmed.trim_end_matches('?').len() * 6;
        (dominant || MATH_CUE_PATTERN.is_match(trimmed)).then(|| candidate.to_string())
    }

    fn percent_of(text: &str) -> Option<(f64, f64)> {
        let caps = PERCENT_OF_PATTERN.captures(text)?;
        let pct = caps.get(1)?.as_str().parse().ok()?;
        let of = caps.get(2)?.as_str().parse().ok()?;
        Some((pct, of))
    }
}

#[async_trait]
impl Capability for ArithmeticCapability {
    fn name(&self) -> &str {
        "arithmetic"
    }

    fn can_handle(&self, query: &Query) -> bool {
        Self::percent_of(&query.raw_text).is_some()
            || Self::extract_expression(&query.raw_text).is_some()
    }

    async fn execute(&self, query: &Query) -> Result<String> {
        if let Some((pct, of)) = Self::percent_of(&query.raw_text) {
            let value = pct / 100.0 * of;
            return Ok(format!(
                "{}% of {} = {}",
                format_number(pct),
                format_number(of),
                format_number(value)
            ));
        }

        let expr = Self::extract_expression(&query.raw_text)
            .ok_or_else(|| Error::capability(self.name(), "no arithmetic expression found"))?;
        let value = evaluate(&expr).map_err(|e| Error::capability(self.name(), e))?;
        Ok(format!("{} = {}", expr, format_number(value)))
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

static CLOCK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(what\s+time|current\s+time|time\s+is\s+it|the\s+time\s+now|(what's|what\s+is)\s+(the\s+)?date|today'?s\s+date|what\s+day\s+is)")
        .expect("invalid regex")
});

/// Answers current date and time questions.
#[derive(Debug, Clone, Default)]
pub struct ClockCapability {
    fixed: Option<DateTime<FixedOffset>>,
}

impl ClockCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always report `now` instead of reading the system clock.
    pub fn at(now: DateTime<FixedOffset>) -> Self {
        Self { fixed: Some(now) }
    }

    fn now(&self) -> DateTime<FixedOffset> {
        self.fixed.unwrap_or_else(|| Local::now().fixed_offset())
    }
}

#[async_trait]
impl Capability for ClockCapability {
    fn name(&self) -> &str {
        "clock"
    }

    fn can_handle(&self, query: &Query) -> bool {
        CLOCK_PATTERN.is_match(&query.raw_text)
    }

    async fn execute(&self, _query: &Query) -> Result<String> {
        Ok(format!(
            "Current local time: {}",
            self.now().format("%A, %B %-d %Y, %H:%M (UTC%:z)")
        ))
    }
}
