use serde_json::{Number, Value};

use crate::error::{FlowError, Result};

use super::ast::{Arg, BinaryOp, Call, Expr, Stmt, UnaryOp};
use super::lexer::{tokenize, Span, SpannedToken, Token};

/// 递归下降解析器
pub struct Parser<'source> {
    source: &'source str,
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Result<Self> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].token
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn advance(&mut self) -> SpannedToken {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == expected
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<SpannedToken> {
        if self.check(expected) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {expected}, found {}", self.peek())))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, found {other}"))),
        }
    }

    fn error(&self, message: String) -> FlowError {
        FlowError::Parse {
            message,
            span: self.peek_span(),
        }
    }

    fn line_of(&self, span: Span) -> usize {
        self.source[..span.start.min(self.source.len())]
            .matches('\n')
            .count()
            + 1
    }

    pub fn parse_program(&mut self) -> Result<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check(&Token::Eof) {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&Token::LBrace)?;
        let mut statements = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.error("unterminated block".to_string()));
            }
            statements.push(self.parse_statement()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        let statement = match self.peek().clone() {
            Token::Let => {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(&Token::Eq)?;
                Stmt::Let {
                    name,
                    value: self.parse_expr()?,
                }
            }
            Token::If => return self.parse_if(),
            Token::Try => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(&Token::Catch)?;
                self.expect(&Token::LParen)?;
                let binding = self.expect_ident()?;
                self.expect(&Token::RParen)?;
                let handler = self.parse_block()?;
                return Ok(Stmt::Try {
                    body,
                    binding,
                    handler,
                });
            }
            Token::Return => {
                self.advance();
                let value = if matches!(self.peek(), Token::Semi | Token::RBrace | Token::Eof) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Stmt::Return(value)
            }
            Token::Ident(name) if self.peek_at(1) == &Token::Eq => {
                self.advance();
                self.advance();
                Stmt::Assign {
                    name,
                    value: self.parse_expr()?,
                }
            }
            _ => Stmt::Expr(self.parse_expr()?),
        };
        self.eat(&Token::Semi);
        Ok(statement)
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        self.expect(&Token::LParen)?;
        let condition = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.advance();
        Ok(Expr::Unary {
            op,
            expr: Box::new(self.parse_unary()?),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.expect_ident()?;
                expr = Expr::Member {
                    target: Box::new(expr),
                    name,
                };
            } else if self.check(&Token::LBracket) {
                self.advance();
                let index = self.parse_expr()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let spanned = self.advance();
        let expr = match spanned.token {
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Int(v) => Expr::Literal(Value::from(v)),
            Token::Float(v) => Expr::Literal(
                Number::from_f64(v)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                inner
            }
            Token::LBracket => self.parse_collection()?,
            Token::LBrace => {
                self.pos -= 1;
                let start = self.peek_span();
                let body = self.parse_block()?;
                let end = self.tokens[self.pos.saturating_sub(1)].span;
                Expr::Closure {
                    body,
                    span: start.merge(end),
                }
            }
            Token::Ident(name) => {
                if self.check(&Token::LParen) || self.check(&Token::LBrace) {
                    Expr::Call(self.parse_call(name, spanned.span)?)
                } else {
                    Expr::Var(name)
                }
            }
            other => {
                return Err(FlowError::Parse {
                    message: format!("unexpected {other}"),
                    span: spanned.span,
                })
            }
        };
        Ok(expr)
    }

    fn parse_call(&mut self, name: String, span: Span) -> Result<Call> {
        let mut args = Vec::new();
        if self.eat(&Token::LParen) {
            while !self.check(&Token::RParen) {
                args.push(self.parse_arg()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }
        if self.check(&Token::LBrace) {
            let start = self.peek_span();
            let body = self.parse_block()?;
            let end = self.tokens[self.pos.saturating_sub(1)].span;
            args.push(Arg {
                name: None,
                value: Expr::Closure {
                    body,
                    span: start.merge(end),
                },
            });
        }
        Ok(Call {
            name,
            args,
            line: self.line_of(span),
        })
    }

    fn parse_arg(&mut self) -> Result<Arg> {
        let label = match (self.peek().clone(), self.peek_at(1)) {
            (Token::Ident(name), Token::Colon) | (Token::Str(name), Token::Colon) => Some(name),
            _ => None,
        };
        if label.is_some() {
            self.advance();
            self.advance();
        }
        Ok(Arg {
            name: label,
            value: self.parse_expr()?,
        })
    }

    fn parse_collection(&mut self) -> Result<Expr> {
        if self.check(&Token::Colon) && self.peek_at(1) == &Token::RBracket {
            self.advance();
            self.advance();
            return Ok(Expr::Map(Vec::new()));
        }
        let is_map = matches!(
            (self.peek(), self.peek_at(1)),
            (Token::Ident(_) | Token::Str(_), Token::Colon)
        );
        if is_map {
            let mut entries = Vec::new();
            while !self.check(&Token::RBracket) {
                let key = match self.advance().token {
                    Token::Ident(key) | Token::Str(key) => key,
                    other => return Err(self.error(format!("expected map key, found {other}"))),
                };
                self.expect(&Token::Colon)?;
                entries.push((key, self.parse_expr()?));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RBracket)?;
            return Ok(Expr::Map(entries));
        }
        let mut items = Vec::new();
        while !self.check(&Token::RBracket) {
            items.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBracket)?;
        Ok(Expr::List(items))
    }
}

pub fn parse(source: &str) -> Result<Vec<Stmt>> {
    Parser::new(source)?.parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_branches_and_trailing_block() {
        let program = parse("parallel(a: { echo('a') }, failFast: true)\nretry(2) { echo('b') }").unwrap();
        assert_eq!(program.len(), 2);
        match &program[0] {
            Stmt::Expr(Expr::Call(call)) => {
                assert_eq!(call.name, "parallel");
                assert_eq!(call.args[0].name.as_deref(), Some("a"));
                assert!(matches!(call.args[0].value, Expr::Closure { .. }));
                assert_eq!(call.args[1].value, Expr::Literal(Value::Bool(true)));
                assert_eq!(call.line, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &program[1] {
            Stmt::Expr(Expr::Call(call)) => {
                assert_eq!(call.line, 2);
                assert!(call.args[0].name.is_none());
                assert!(matches!(call.args[1].value, Expr::Closure { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_control_flow() {
        let program = parse(
            "let x = 1; if (x == 1 && !false) { x = x + 1 } else if (x != 2) { return } try { error('e') } catch (e) { echo(e.message) }",
        )
        .unwrap();
        assert!(matches!(program[0], Stmt::Let { .. }));
        assert!(matches!(program[1], Stmt::If { .. }));
        assert!(matches!(program[2], Stmt::Try { .. }));
    }

    #[test]
    fn parses_maps_and_lists() {
        let program = parse("let m = [a: 1, 'b c': [1, 2]]; let e = [:]; m['a']").unwrap();
        match &program[0] {
            Stmt::Let { value: Expr::Map(entries), .. } => {
                assert_eq!(entries[1].0, "b c");
                assert!(matches!(entries[1].1, Expr::List(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            program[1],
            Stmt::Let {
                name: "e".into(),
                value: Expr::Map(vec![])
            }
        );
        assert!(matches!(program[2], Stmt::Expr(Expr::Index { .. })));
    }

    #[test]
    fn reports_unterminated_block() {
        let err = parse("retry(1) { echo('x')").unwrap_err();
        assert!(err.to_string().contains("unterminated block"));
    }
}
