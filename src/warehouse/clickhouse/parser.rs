//! Recursive-descent parser for ClickHouse type strings
//!
//! Grammar:
//! ```text
//! type := IDENT [ "(" [ arg { "," arg } ] ")" ]
//! arg  := IDENT type      (named, as in Nested(a String))
//!       | type
//! ```

use std::fmt;

use crate::error::MappingError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeExpr {
    pub name: String,
    pub args: Vec<TypeArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeArg {
    pub name: Option<String>,
    pub ty: TypeExpr,
}

impl TypeExpr {
    /// The single unnamed argument of a wrapper like `Array(T)`
    pub fn single_arg(&self) -> Option<&TypeExpr> {
        match self.args.as_slice() {
            [TypeArg { name: None, ty }] => Some(ty),
            _ => None,
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.args.is_empty() {
            return Ok(());
        }
        write!(f, "(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if let Some(name) = &arg.name {
                write!(f, "{} ", name)?;
            }
            write!(f, "{}", arg.ty)?;
        }
        write!(f, ")")
    }
}

fn parse_error(input: &str, reason: impl Into<String>) -> MappingError {
    MappingError::Parse {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, MappingError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(parse_error(input, format!("unexpected character {:?} at position {}", other, pos)));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn ident(&mut self) -> Result<String, MappingError> {
        match self.tokens.get(self.pos) {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            other => Err(parse_error(self.input, format!("expected type name, found {:?}", other))),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), MappingError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(parse_error(
                self.input,
                format!("expected {:?}, found {:?}", token, self.peek()),
            ))
        }
    }

    fn type_expr(&mut self) -> Result<TypeExpr, MappingError> {
        let name = self.ident()?;
        let mut args = Vec::new();

        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            if self.peek() != Some(&Token::RParen) {
                loop {
                    args.push(self.arg()?);
                    if self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            self.expect(Token::RParen)?;
        }

        Ok(TypeExpr { name, args })
    }

    fn arg(&mut self) -> Result<TypeArg, MappingError> {
        let named = matches!(
            (self.peek(), self.peek_at(1)),
            (Some(Token::Ident(_)), Some(Token::Ident(_)))
        );
        if named {
            let name = self.ident()?;
            Ok(TypeArg {
                name: Some(name),
                ty: self.type_expr()?,
            })
        } else {
            Ok(TypeArg {
                name: None,
                ty: self.type_expr()?,
            })
        }
    }
}

/// Parse a full type string, rejecting trailing input
pub fn parse_type(input: &str) -> Result<TypeExpr, MappingError> {
    let mut parser = Parser {
        input,
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.type_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parse_error(input, "trailing input"));
    }
    Ok(expr)
}
