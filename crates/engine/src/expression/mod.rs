//! Expression evaluator for edge conditions and variable mappings
//!
//! Expressions are parsed once when a definition is compiled and evaluated
//! many times against instance state. Evaluation is pure: it reads the scope
//! it is given and never mutates anything, so a compiled expression can be
//! shared across scheduler workers.
//!
//! Supported syntax:
//!
//! - literals: `1`, `2.5`, `'text'`, `"text"`, `true`, `false`, `null`
//! - paths: `order.status`, `items[0].sku`, `lookup['key']`
//! - logical: `&&` / `and`, `||` / `or`, `!` / `not`
//! - comparison: `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - arithmetic: `+`, `-`, `*`, `/`, `%` (`+` concatenates when either side is a string)
//!
//! A path that does not resolve fails with [`ExpressionError::UnknownVariable`].

mod eval;
mod lexer;
mod parser;

use serde_json::{Map, Value};

pub use parser::{BinaryOp, Expr, Path, Segment, UnaryOp};

/// Errors raised while parsing or evaluating an expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number: {0}")]
    InvalidNumber(String),

    #[error("expression did not evaluate to a boolean: {0}")]
    NotBoolean(String),
}

impl ExpressionError {
    /// Error code recorded on an instance that faults on this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownVariable(_) => "UnknownVariable",
            _ => "ExpressionError",
        }
    }
}

/// A parsed expression, keeping its source text for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    tree: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            source: source.to_string(),
            tree: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tree(&self) -> &Expr {
        &self.tree
    }

    pub fn evaluate(&self, scope: &Map<String, Value>) -> Result<Value, ExpressionError> {
        eval::eval(&self.tree, scope)
    }

    /// Evaluate as a condition; anything but a boolean is an error
    pub fn evaluate_bool(&self, scope: &Map<String, Value>) -> Result<bool, ExpressionError> {
        match self.evaluate(scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean(format!(
                "'{}' produced {}",
                self.source, other
            ))),
        }
    }
}

/// Parse and evaluate `expression` in one call
pub fn evaluate(expression: &str, variables: &Map<String, Value>) -> Result<Value, ExpressionError> {
    Expression::parse(expression)?.evaluate(variables)
}
