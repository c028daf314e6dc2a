// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Hand-written recursive descent parser for parameter expressions.
//!
//! It uses the lexer from `token` and produces parse-stage `Expr0` values;
//! typing of function applications happens in `ast::Expr::from`.

use crate::ast::{BinaryOp, Expr0, UnaryOp};
use crate::builtins::{Loc, UntypedBuiltinFn};
use crate::common::{EquationError, ErrorCode};
use crate::token::{Lexer, Spanned, Token};


/// TokenKind discriminant for efficient peek comparisons without payload matching
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Plus,
    Minus,
    Mul,
    Div,
    Pow,
    LParen,
    RParen,
    Comma,
    Ident,
    Num,
}

impl<'a> From<&Token<'a>> for TokenKind {
    fn from(token: &Token<'a>) -> Self {
        match token {
            Token::Eq => TokenKind::Eq,
            Token::Neq => TokenKind::Neq,
            Token::Lt => TokenKind::Lt,
            Token::Lte => TokenKind::Lte,
            Token::Gt => TokenKind::Gt,
            Token::Gte => TokenKind::Gte,
            Token::Plus => TokenKind::Plus,
            Token::Minus => TokenKind::Minus,
            Token::Mul => TokenKind::Mul,
            Token::Div => TokenKind::Div,
            Token::Pow => TokenKind::Pow,
            Token::LParen => TokenKind::LParen,
            Token::RParen => TokenKind::RParen,
            Token::Comma => TokenKind::Comma,
            Token::Ident(_) => TokenKind::Ident,
            Token::Num(_) => TokenKind::Num,
        }
    }
}

/// Parser state holding tokenized input
struct Parser<'input> {
    tokens: Vec<Spanned<Token<'input>>>,
    pos: usize,
}

impl<'input> Parser<'input> {
    /// Create a new parser from a lexer, collecting all tokens up front.
    /// Returns an error if the lexer produces any errors.
    fn new(lexer: Lexer<'input>) -> Result<Self, EquationError> {
        let mut tokens = Vec::new();
        for result in lexer {
            match result {
                Ok(tok) => tokens.push(tok),
                Err(e) => return Err(e),
            }
        }
        Ok(Parser { tokens, pos: 0 })
    }

    /// Peek at the current token without consuming it
    fn peek(&self) -> Option<&Spanned<Token<'input>>> {
        self.tokens.get(self.pos)
    }

    /// Peek at the kind of the current token
    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|(_, tok, _)| TokenKind::from(tok))
    }

    /// Advance to the next token and return the consumed token
    fn advance(&mut self) -> Option<&Spanned<Token<'input>>> {
        if self.pos < self.tokens.len() {
            let tok = &self.tokens[self.pos];
            self.pos += 1;
            Some(tok)
        } else {
            None
        }
    }

    /// Expect the current token to match the expected kind, returning an error if not
    fn expect(&mut self, expected: TokenKind) -> Result<&Spanned<Token<'input>>, EquationError> {
        if self.peek_kind() == Some(expected) {
            Ok(self.advance().unwrap())
        } else if let Some((start, _, end)) = self.peek() {
            Err(EquationError {
                start: *start as u16,
                end: *end as u16,
                code: ErrorCode::UnrecognizedToken,
            })
        } else {
            let pos = self.eof_position();
            Err(EquationError {
                start: pos as u16,
                end: (pos + 1) as u16,
                code: ErrorCode::UnrecognizedEof,
            })
        }
    }

    /// Get the position for EOF errors
    fn eof_position(&self) -> usize {
        if let Some((_, _, end)) = self.tokens.last() {
            *end
        } else {
            0
        }
    }

    /// Check if we've consumed all tokens
    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Parse an expression from the token stream.
    /// Returns Ok(None) for empty input.
    fn parse_equation(&mut self) -> Result<Option<Expr0>, EquationError> {
        if self.is_at_end() {
            return Ok(None);
        }

        let expr = self.parse_expr()?;

        // Check for extra tokens after the expression
        if let Some((start, _, end)) = self.peek() {
            return Err(EquationError {
                start: *start as u16,
                end: *end as u16,
                code: ErrorCode::ExtraToken,
            });
        }

        Ok(Some(expr))
    }

    /// Parse a top-level expression (equality, lowest precedence)
    fn parse_expr(&mut self) -> Result<Expr0, EquationError> {
        self.parse_equality()
    }

    /// Parse equality operators (==, !=)
    fn parse_equality(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Eq) => BinaryOp::Eq,
                Some(TokenKind::Neq) => BinaryOp::Neq,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            let loc = Loc::new(left.get_loc().start as usize, right.get_loc().end as usize);
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    /// Parse comparison operators (<, <=, >, >=)
    fn parse_comparison(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_additive()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Lt) => BinaryOp::Lt,
                Some(TokenKind::Lte) => BinaryOp::Lte,
                Some(TokenKind::Gt) => BinaryOp::Gt,
                Some(TokenKind::Gte) => BinaryOp::Gte,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            let loc = Loc::new(left.get_loc().start as usize, right.get_loc().end as usize);
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    /// Parse additive operators (+, -)
    fn parse_additive(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            let loc = Loc::new(left.get_loc().start as usize, right.get_loc().end as usize);
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    /// Parse multiplicative operators (*, /)
    fn parse_multiplicative(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Mul) => BinaryOp::Mul,
                Some(TokenKind::Div) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            let loc = Loc::new(left.get_loc().start as usize, right.get_loc().end as usize);
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    /// Parse unary operators (+, -)
    fn parse_unary(&mut self) -> Result<Expr0, EquationError> {
        match self.peek_kind() {
            Some(TokenKind::Plus) => {
                let (lpos, _, _) = *self.advance().unwrap();
                let operand = self.parse_power()?;
                let rpos = operand.get_loc().end as usize;
                Ok(Expr0::Op1(
                    UnaryOp::Positive,
                    Box::new(operand),
                    Loc::new(lpos, rpos),
                ))
            }
            Some(TokenKind::Minus) => {
                let (lpos, _, _) = *self.advance().unwrap();
                let operand = self.parse_power()?;
                let rpos = operand.get_loc().end as usize;
                Ok(Expr0::Op1(
                    UnaryOp::Negative,
                    Box::new(operand),
                    Loc::new(lpos, rpos),
                ))
            }
            _ => self.parse_power(),
        }
    }

    /// Parse the power operator (**) - left associative
    fn parse_power(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_app()?;

        while self.peek_kind() == Some(TokenKind::Pow) {
            self.advance();
            let right = self.parse_app()?;
            let loc = Loc::new(left.get_loc().start as usize, right.get_loc().end as usize);
            left = Expr0::Op2(BinaryOp::Pow, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    /// Parse function application: id(args)
    fn parse_app(&mut self) -> Result<Expr0, EquationError> {
        // Check if we have an identifier followed by '('
        if self.peek_kind() == Some(TokenKind::Ident)
            && self.pos + 1 < self.tokens.len()
            && TokenKind::from(&self.tokens[self.pos + 1].1) == TokenKind::LParen
        {
            // This is a function call
            let (lpos, tok, _) = *self.advance().unwrap();
            let name = if let Token::Ident(s) = tok {
                s.to_lowercase()
            } else {
                unreachable!()
            };

            self.advance(); // consume '('
            let args = self.parse_comma_separated_exprs()?;
            let (_, _, rpos) = *self.expect(TokenKind::RParen)?;

            return Ok(Expr0::App(
                UntypedBuiltinFn(name, args),
                Loc::new(lpos, rpos),
            ));
        }

        self.parse_atom()
    }

    /// Parse an atomic expression (number, identifier, parenthesized expression)
    fn parse_atom(&mut self) -> Result<Expr0, EquationError> {
        match self.peek_kind() {
            Some(TokenKind::Num) => {
                let (lpos, tok, rpos) = *self.advance().unwrap();
                if let Token::Num(s) = tok {
                    match s.parse::<f64>() {
                        Ok(n) => Ok(Expr0::Const(s.to_string(), n, Loc::new(lpos, rpos))),
                        Err(_) => Err(EquationError {
                            start: lpos as u16,
                            end: rpos as u16,
                            code: ErrorCode::ExpectedNumber,
                        }),
                    }
                } else {
                    unreachable!()
                }
            }
            Some(TokenKind::Ident) => {
                let (lpos, tok, rpos) = *self.advance().unwrap();
                if let Token::Ident(s) = tok {
                    Ok(Expr0::Var(s.to_string(), Loc::new(lpos, rpos)))
                } else {
                    unreachable!()
                }
            }
            Some(TokenKind::LParen) => {
                self.advance(); // consume '('
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            Some(_) => {
                let (start, _, end) = self.peek().unwrap();
                Err(EquationError {
                    start: *start as u16,
                    end: *end as u16,
                    code: ErrorCode::UnrecognizedToken,
                })
            }
            None => {
                let pos = self.eof_position();
                Err(EquationError {
                    start: pos as u16,
                    end: (pos + 1) as u16,
                    code: ErrorCode::UnrecognizedEof,
                })
            }
        }
    }

    /// Parse comma-separated expressions (for function arguments)
    fn parse_comma_separated_exprs(&mut self) -> Result<Vec<Expr0>, EquationError> {
        let mut exprs = Vec::new();

        // Handle empty list
        if self.peek_kind() == Some(TokenKind::RParen) {
            return Ok(exprs);
        }

        // Parse first expression
        exprs.push(self.parse_expr()?);

        // Parse remaining expressions
        while self.peek_kind() == Some(TokenKind::Comma) {
            self.advance(); // consume ','

            // Handle trailing comma
            if self.peek_kind() == Some(TokenKind::RParen) {
                break;
            }

            exprs.push(self.parse_expr()?);
        }

        Ok(exprs)
    }
}

/// Parse an expression string into an AST.
///
/// Returns:
/// - `Ok(Some(expr))` for valid expressions
/// - `Ok(None)` for empty input
/// - `Err(error)` for parse errors
pub fn parse(input: &str) -> Result<Option<Expr0>, Vec<EquationError>> {
    let lexer = Lexer::new(input);
    let mut parser = match Parser::new(lexer) {
        Ok(p) => p,
        Err(e) => return Err(vec![e]),
    };

    parser.parse_equation().map_err(|e| vec![e])
}
