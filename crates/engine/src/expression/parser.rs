//! Parser: builds an expression tree from the token stream
//!
//! Precedence, lowest first:
//!
//! ```text
//! ||        logical or
//! &&        logical and
//! == !=     equality
//! < <= > >= comparison
//! + -       additive
//! * / %     multiplicative
//! ! -       unary
//! . []      path access
//! ```

use serde_json::Value;

use super::lexer::{Lexer, Token, TokenKind};
use super::ExpressionError;

/// Deepest nesting of parentheses, brackets and unary operators accepted
pub const MAX_NESTING: usize = 128;

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Variable reference such as `order.items[0].sku`
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub root: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }
}

/// Parse an expression string into a tree
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };

    if parser.check(&TokenKind::Eof) {
        return Err(ExpressionError::Parse {
            position: 0,
            message: "empty expression".to_string(),
        });
    }

    let expr = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                TokenKind::Eq => BinaryOp::Eq,
                TokenKind::Ne => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            _ => return self.parse_primary(),
        };
        let position = self.position();
        self.pos += 1;
        let operand = self.nested(position, Self::parse_unary)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.bump();
        match token.kind {
            TokenKind::Integer(n) => Ok(Expr::Literal(Value::from(n))),
            TokenKind::Number(n) => Ok(Expr::Literal(Value::from(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Ident(root) => self.parse_path(root),
            TokenKind::LParen => {
                let inner = self.nested(token.position, Self::parse_or)?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            other => Err(ExpressionError::Parse {
                position: token.position,
                message: format!("unexpected {}", other),
            }),
        }
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, ExpressionError> {
        let mut segments = Vec::new();
        loop {
            if self.eat(&TokenKind::Dot) {
                let token = self.bump();
                match token.kind {
                    TokenKind::Ident(name) => segments.push(Segment::Field(name)),
                    // Keywords are valid field names after a dot
                    TokenKind::True => segments.push(Segment::Field("true".into())),
                    TokenKind::False => segments.push(Segment::Field("false".into())),
                    TokenKind::Null => segments.push(Segment::Field("null".into())),
                    other => {
                        return Err(ExpressionError::Parse {
                            position: token.position,
                            message: format!("expected field name after '.', found {}", other),
                        })
                    }
                }
            } else if self.check(&TokenKind::LBracket) {
                let position = self.position();
                self.pos += 1;
                let index = self.nested(position, Self::parse_or)?;
                self.expect(&TokenKind::RBracket)?;
                segments.push(Segment::Index(Box::new(index)));
            } else {
                break;
            }
        }
        Ok(Expr::Path(Path { root, segments }))
    }

    /// Run `parse` one nesting level deeper, failing past [`MAX_NESTING`]
    fn nested(
        &mut self,
        position: usize,
        parse: fn(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(ExpressionError::Parse {
                position,
                message: format!("expression nests deeper than {} levels", MAX_NESTING),
            });
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn peek(&self) -> &TokenKind {
        // The token stream always ends with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ExpressionError> {
        if self.eat(kind) {
            return Ok(());
        }
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        Err(ExpressionError::Parse {
            position: token.position,
            message: format!("expected {}, found {}", kind, token.kind),
        })
    }

    fn expect_eof(&self) -> Result<(), ExpressionError> {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if token.kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(ExpressionError::Parse {
                position: token.position,
                message: format!("unexpected trailing {}", token.kind),
            })
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(root: &str, fields: &[&str]) -> Expr {
        Expr::Path(Path {
            root: root.to_string(),
            segments: fields
                .iter()
                .map(|f| Segment::Field(f.to_string()))
                .collect(),
        })
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a || b && c").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Or,
                path("a", &[]),
                binary(BinaryOp::And, path("b", &[]), path("c", &[]))
            )
        );
    }

    #[test]
    fn test_arithmetic_binds_tighter_than_comparison() {
        let expr = parse("input.x + 1 > 2 * 3").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Gt,
                binary(BinaryOp::Add, path("input", &["x"]), Expr::Literal(json!(1))),
                binary(
                    BinaryOp::Mul,
                    Expr::Literal(json!(2)),
                    Expr::Literal(json!(3))
                )
            )
        );
    }

    #[test]
    fn test_index_segment() {
        let expr = parse("items[0].sku").unwrap();
        assert_eq!(
            expr,
            Expr::Path(Path {
                root: "items".into(),
                segments: vec![
                    Segment::Index(Box::new(Expr::Literal(json!(0)))),
                    Segment::Field("sku".into()),
                ],
            })
        );
    }

    #[test]
    fn test_unary_chain() {
        let expr = parse("!!flag").unwrap();
        assert!(matches!(
            expr,
            Expr::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_expression_rejected() {
        assert!(matches!(
            parse("   "),
            Err(ExpressionError::Parse { .. })
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let ok = format!("{}1{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert_eq!(parse(&ok).unwrap(), Expr::Literal(json!(1)));

        let deep = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = parse(&deep).unwrap_err();
        assert!(err.to_string().contains("nests deeper"), "{}", err);

        let negations = format!("{}x", "!".repeat(MAX_NESTING + 1));
        assert!(matches!(parse(&negations), Err(ExpressionError::Parse { .. })));

        let indexes = format!("a{}0{}", "[a".repeat(MAX_NESTING + 1), "]".repeat(MAX_NESTING + 1));
        assert!(matches!(parse(&indexes), Err(ExpressionError::Parse { .. })));
    }

    #[test]
    fn test_unbalanced_parenthesis() {
        assert!(matches!(
            parse("(a == 1"),
            Err(ExpressionError::Parse { .. })
        ));
        assert!(matches!(parse("a == 1)"), Err(ExpressionError::Parse { .. })));
    }
}
