//! Recursive-descent / Pratt parser producing the expression AST.
//!
//! Grammar (loosest binding first): ternary, `||`, `&&`, equality,
//! relational, additive, multiplicative, unary, postfix (call, member,
//! index), primary. Arrow functions take a single expression body:
//! `x => x * 2` or `(a, b) => a + b`.

use super::EvalError;
use super::lexer::{Token, tokenize};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Arrow {
        params: Vec<String>,
        body: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// Parse a complete expression; trailing tokens are an error.
pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::parse(format!(
            "unexpected trailing token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), EvalError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(EvalError::parse(format!(
                "expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn expression(&mut self) -> Result<Expr, EvalError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Expr, EvalError> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(&Token::Colon)?;
            let otherwise = self.expression()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.equality()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                Some(Token::EqEqEq) => BinaryOp::StrictEq,
                Some(Token::NotEqEq) => BinaryOp::StrictNotEq,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.relational()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Bang) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let property = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    other => {
                        return Err(EvalError::parse(format!(
                            "expected property name after '.', found {other:?}"
                        )));
                    }
                };
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RParen)?;
                        break;
                    }
                }
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        // `x => body`
        if let (Some(Token::Ident(name)), Some(Token::Arrow)) =
            (self.peek(), self.tokens.get(self.pos + 1))
        {
            let param = name.clone();
            self.pos += 2;
            let body = self.expression()?;
            return Ok(Expr::Arrow {
                params: vec![param],
                body: Box::new(body),
            });
        }

        // `(a, b) => body` needs lookahead past the matching paren.
        if self.peek() == Some(&Token::LParen) && self.paren_starts_arrow() {
            self.pos += 1;
            let mut params = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    match self.advance() {
                        Some(Token::Ident(name)) => params.push(name),
                        other => {
                            return Err(EvalError::parse(format!(
                                "expected parameter name, found {other:?}"
                            )));
                        }
                    }
                    if self.eat(&Token::Comma) {
                        continue;
                    }
                    self.expect(&Token::RParen)?;
                    break;
                }
            }
            self.expect(&Token::Arrow)?;
            let body = self.expression()?;
            return Ok(Expr::Arrow {
                params,
                body: Box::new(body),
            });
        }

        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut elements = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        elements.push(self.expression()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket)?;
                        break;
                    }
                }
                Ok(Expr::Array(elements))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Token::Ident(name)) => name,
                            Some(Token::Str(s)) => s,
                            other => {
                                return Err(EvalError::parse(format!(
                                    "expected object key, found {other:?}"
                                )));
                            }
                        };
                        self.expect(&Token::Colon)?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBrace)?;
                        break;
                    }
                }
                Ok(Expr::Object(entries))
            }
            other => Err(EvalError::parse(format!(
                "unexpected token {other:?} at start of expression"
            ))),
        }
    }

    /// True when the `(` at the cursor opens an arrow parameter list,
    /// i.e. its matching `)` is immediately followed by `=>`.
    fn paren_starts_arrow(&self) -> bool {
        let mut depth = 0usize;
        for (offset, token) in self.tokens[self.pos..].iter().enumerate() {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return self.tokens.get(self.pos + offset + 1) == Some(&Token::Arrow);
                    }
                }
                _ => {}
            }
        }
        false
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}
