//! Lexer: tokenizes condition and mapping expressions

use super::ExpressionError;

/// A token produced by the lexer
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Character offset of the token start (0-based)
    pub position: usize,
}

impl Token {
    fn new(kind: TokenKind, position: usize) -> Self {
        Self { kind, position }
    }
}

/// Token types
#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // Literals and names
    Number(f64),
    Integer(i64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,

    // Logical
    And,
    Or,
    Not,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Structural
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,

    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "'{}'", s),
            Self::Ident(name) => write!(f, "{}", name),
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Null => write!(f, "null"),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
            Self::Not => write!(f, "!"),
            Self::Eq => write!(f, "=="),
            Self::Ne => write!(f, "!="),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Star => write!(f, "*"),
            Self::Slash => write!(f, "/"),
            Self::Percent => write!(f, "%"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::Dot => write!(f, "."),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// Lexer for expressions
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    /// Tokenize the entire input, always ending with `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();

            if self.pos >= self.input.len() {
                tokens.push(Token::new(TokenKind::Eof, self.pos));
                break;
            }

            tokens.push(self.next_token()?);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        let start = self.pos;
        let ch = self.input[self.pos];

        let kind = match ch {
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '[' => self.single(TokenKind::LBracket),
            ']' => self.single(TokenKind::RBracket),
            '.' if !self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.single(TokenKind::Dot)
            }
            '+' => self.single(TokenKind::Plus),
            '-' => self.single(TokenKind::Minus),
            '*' => self.single(TokenKind::Star),
            '/' => self.single(TokenKind::Slash),
            '%' => self.single(TokenKind::Percent),
            '&' if self.peek_at(1) == Some('&') => self.double(TokenKind::And),
            '|' if self.peek_at(1) == Some('|') => self.double(TokenKind::Or),
            '=' if self.peek_at(1) == Some('=') => self.double(TokenKind::Eq),
            '!' if self.peek_at(1) == Some('=') => self.double(TokenKind::Ne),
            '!' => self.single(TokenKind::Not),
            '<' if self.peek_at(1) == Some('=') => self.double(TokenKind::Le),
            '<' => self.single(TokenKind::Lt),
            '>' if self.peek_at(1) == Some('=') => self.double(TokenKind::Ge),
            '>' => self.single(TokenKind::Gt),
            '\'' | '"' => self.read_string(ch)?,
            c if c.is_ascii_digit() || c == '.' => self.read_number()?,
            c if c.is_alphabetic() || c == '_' || c == '$' => self.read_identifier(),
            _ => {
                return Err(ExpressionError::Parse {
                    position: start,
                    message: format!("unexpected character '{}'", ch),
                })
            }
        };

        Ok(Token::new(kind, start))
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn double(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        self.advance();
        kind
    }

    fn read_string(&mut self, quote: char) -> Result<TokenKind, ExpressionError> {
        let start = self.pos;
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            match self.current() {
                None => {
                    return Err(ExpressionError::Parse {
                        position: start,
                        message: "unterminated string literal".to_string(),
                    })
                }
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(TokenKind::Str(value));
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.current() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some(c) => c,
                        None => continue,
                    };
                    value.push(escaped);
                    self.advance();
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<TokenKind, ExpressionError> {
        let start = self.pos;
        let mut text = String::new();
        let mut seen_dot = false;

        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '.' && !seen_dot && self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) {
                seen_dot = true;
                text.push(c);
            } else if c == '.' && !seen_dot && text.is_empty() {
                seen_dot = true;
                text.push(c);
            } else {
                break;
            }
            self.advance();
        }

        if !seen_dot {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(TokenKind::Integer(n));
            }
        }

        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| ExpressionError::Parse {
                position: start,
                message: format!("invalid number literal '{}'", text),
            })
    }

    fn read_identifier(&mut self) -> TokenKind {
        let mut name = String::new();
        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }

        match name.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            _ => TokenKind::Ident(name),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.current().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}
