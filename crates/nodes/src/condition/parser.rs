//! Condition expression parser.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr    := and_expr (("or" | "||") and_expr)*
//! and_expr:= unary (("and" | "&&") unary)*
//! unary   := ("not" | "!") unary | "(" expr ")" | compare
//! compare := operand (op operand)?
//! op      := "==" | "!=" | ">" | ">=" | "<" | "<=" | "contains"
//! operand := 'string' | "string" | number | true | false | null | reference
//! ```
//!
//! Expressions often carry interpolated user input, so both the number of
//! tokens and the `not`/parenthesis nesting are bounded.

use thiserror::Error;

use super::ast::{CompareOp, Expression, Literal, Operand};

/// Deepest `not`/parenthesis nesting accepted.
pub const MAX_DEPTH: usize = 64;

/// Longest expression accepted, in tokens.
pub const MAX_TOKENS: usize = 1024;

/// A malformed condition expression.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid condition at offset {offset}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Parse a condition expression into an AST.
pub fn parse(input: &str) -> Result<Expression, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::new(0, "empty expression"));
    }
    if let Some((offset, _)) = tokens.get(MAX_TOKENS) {
        return Err(ParseError::new(*offset, format!("expression longer than {MAX_TOKENS} tokens")));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if let Some((offset, tok)) = parser.tokens.get(parser.pos) {
        return Err(ParseError::new(*offset, format!("unexpected token {tok:?}")));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '$')
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = |a: char, b: char| c == a && next == Some(b);

        let (token, width) = if c == '(' {
            (Token::LParen, 1)
        } else if c == ')' {
            (Token::RParen, 1)
        } else if two('=', '=') {
            (Token::Op(CompareOp::Eq), 2)
        } else if two('!', '=') {
            (Token::Op(CompareOp::NotEq), 2)
        } else if two('>', '=') {
            (Token::Op(CompareOp::Gte), 2)
        } else if two('<', '=') {
            (Token::Op(CompareOp::Lte), 2)
        } else if two('&', '&') {
            (Token::And, 2)
        } else if two('|', '|') {
            (Token::Or, 2)
        } else if c == '>' {
            (Token::Op(CompareOp::Gt), 1)
        } else if c == '<' {
            (Token::Op(CompareOp::Lt), 1)
        } else if c == '!' {
            (Token::Not, 1)
        } else if c == '\'' || c == '"' {
            let mut value = String::new();
            let mut j = i + 1;
            loop {
                match chars.get(j) {
                    None => return Err(ParseError::new(offset, "unterminated string")),
                    Some((_, '\\')) => {
                        if let Some((_, escaped)) = chars.get(j + 1) {
                            value.push(*escaped);
                        }
                        j += 2;
                    }
                    Some((_, ch)) if *ch == c => break,
                    Some((_, ch)) => {
                        value.push(*ch);
                        j += 1;
                    }
                }
            }
            (Token::Str(value), j + 1 - i)
        } else if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) {
            let mut j = i + 1;
            while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                j += 1;
            }
            let text: String = chars[i..j].iter().map(|(_, ch)| ch).collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| ParseError::new(offset, format!("invalid number '{text}'")))?;
            (Token::Number(number), j - i)
        } else if is_ident_start(c) {
            let mut j = i + 1;
            while j < chars.len() && is_ident_char(chars[j].1) {
                j += 1;
            }
            let word: String = chars[i..j].iter().map(|(_, ch)| ch).collect();
            let token = match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "contains" => Token::Op(CompareOp::Contains),
                _ => Token::Ident(word),
            };
            (token, j - i)
        } else {
            return Err(ParseError::new(offset, format!("unexpected character '{c}'")));
        };

        tokens.push((offset, token));
        i += width;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Recursive descent
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        match self.peek() {
            Some(Token::Not) => {
                self.descend()?;
                self.advance();
                let inner = self.parse_unary();
                self.depth -= 1;
                Ok(Expression::Not(Box::new(inner?)))
            }
            Some(Token::LParen) => {
                self.descend()?;
                self.advance();
                let inner = self.parse_or();
                self.depth -= 1;
                let inner = inner?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError::new(self.offset(), "expected ')'")),
                }
            }
            _ => self.parse_compare(),
        }
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(ParseError::new(
                self.offset(),
                format!("expression nested deeper than {MAX_DEPTH} levels"),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_compare(&mut self) -> Result<Expression, ParseError> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_operand()?;
            return Ok(Expression::Compare { left, op, right });
        }
        Ok(Expression::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Str(s)) => Ok(Operand::Literal(Literal::String(s))),
            Some(Token::Number(n)) => Ok(Operand::Literal(Literal::Number(n))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Operand::Literal(Literal::Boolean(true)),
                "false" => Operand::Literal(Literal::Boolean(false)),
                "null" => Operand::Literal(Literal::Null),
                _ => Operand::Reference(word),
            }),
            Some(other) => Err(ParseError::new(offset, format!("expected a value, found {other:?}"))),
            None => Err(ParseError::new(offset, "unexpected end of expression")),
        }
    }
}
