use crate::ast::*;
use crate::lexer::Token;

type Span = std::ops::Range<usize>;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("parse error at token {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.peek() {
            Some(token) if token == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(token) => Err(self.error(format!("expected {expected:?}, got {token:?}"))),
            None => Err(self.error(format!("expected {expected:?}, got EOF"))),
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok(name)
            }
            Some(token) => Err(self.error(format!("expected name, got {token:?}"))),
            None => Err(self.error("expected name, got EOF".into())),
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            position: self.pos,
            message,
        }
    }

    pub fn parse_chunk(&mut self) -> Result<Block> {
        let block = self.parse_block()?;
        match self.peek() {
            None => Ok(block),
            Some(token) => Err(self.error(format!("unexpected {token:?} after chunk"))),
        }
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.peek(),
            None | Some(Token::End | Token::Else | Token::ElseIf | Token::Until)
        )
    }

    fn parse_block(&mut self) -> Result<Block> {
        let protected = self.eat(&Token::Protect);
        let mut stats = Vec::new();
        while !self.block_follows() {
            if self.eat(&Token::Protect) || self.eat(&Token::Semi) {
                continue;
            }
            let stat = self.parse_stat()?;
            let last = matches!(stat, Stat::Return(_) | Stat::Break);
            stats.push(stat);
            self.eat(&Token::Semi);
            if last {
                break;
            }
        }
        Ok(Block { stats, protected })
    }

    fn parse_stat(&mut self) -> Result<Stat> {
        match self.peek() {
            Some(Token::If) => self.parse_if(),
            Some(Token::While) => {
                self.pos += 1;
                let cond = self.parse_expr()?;
                self.expect(&Token::Do)?;
                let body = self.parse_block()?;
                self.expect(&Token::End)?;
                Ok(Stat::While { cond, body })
            }
            Some(Token::Do) => {
                self.pos += 1;
                let body = self.parse_block()?;
                self.expect(&Token::End)?;
                Ok(Stat::Do(body))
            }
            Some(Token::For) => self.parse_for(),
            Some(Token::Repeat) => {
                self.pos += 1;
                let body = self.parse_block()?;
                self.expect(&Token::Until)?;
                let cond = self.parse_expr()?;
                Ok(Stat::Repeat { body, cond })
            }
            Some(Token::Function) => {
                self.pos += 1;
                let mut path = vec![self.expect_name()?];
                while self.eat(&Token::Dot) {
                    path.push(self.expect_name()?);
                }
                let method = if self.eat(&Token::Colon) {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                let func = self.parse_funcbody(method.is_some())?;
                Ok(Stat::Function {
                    name: FuncName { path, method },
                    func,
                })
            }
            Some(Token::Local) => {
                self.pos += 1;
                if self.eat(&Token::Function) {
                    let name = self.expect_name()?;
                    let func = self.parse_funcbody(false)?;
                    return Ok(Stat::LocalFunction { name, func });
                }
                let mut names = vec![self.expect_name()?];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_name()?);
                }
                let values = if self.eat(&Token::Assign) {
                    self.parse_exprlist()?
                } else {
                    Vec::new()
                };
                Ok(Stat::Local { names, values })
            }
            Some(Token::Return) => {
                self.pos += 1;
                let values = if self.block_follows() || self.check(&Token::Semi) {
                    Vec::new()
                } else {
                    self.parse_exprlist()?
                };
                Ok(Stat::Return(values))
            }
            Some(Token::Break) => {
                self.pos += 1;
                Ok(Stat::Break)
            }
            _ => self.parse_exprstat(),
        }
    }

    fn parse_if(&mut self) -> Result<Stat> {
        self.expect(&Token::If)?;
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        self.expect(&Token::Then)?;
        branches.push((cond, self.parse_block()?));
        let mut otherwise = None;
        loop {
            match self.advance() {
                Some(Token::ElseIf) => {
                    let cond = self.parse_expr()?;
                    self.expect(&Token::Then)?;
                    branches.push((cond, self.parse_block()?));
                }
                Some(Token::Else) => {
                    otherwise = Some(self.parse_block()?);
                    self.expect(&Token::End)?;
                    break;
                }
                Some(Token::End) => break,
                other => return Err(self.error(format!("expected end of if, got {other:?}"))),
            }
        }
        Ok(Stat::If {
            branches,
            otherwise,
        })
    }

    fn parse_for(&mut self) -> Result<Stat> {
        self.expect(&Token::For)?;
        let first = self.expect_name()?;
        if self.eat(&Token::Assign) {
            let start = self.parse_expr()?;
            self.expect(&Token::Comma)?;
            let limit = self.parse_expr()?;
            let step = if self.eat(&Token::Comma) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(&Token::Do)?;
            let body = self.parse_block()?;
            self.expect(&Token::End)?;
            return Ok(Stat::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
            });
        }
        let mut names = vec![first];
        while self.eat(&Token::Comma) {
            names.push(self.expect_name()?);
        }
        self.expect(&Token::In)?;
        let exprs = self.parse_exprlist()?;
        self.expect(&Token::Do)?;
        let body = self.parse_block()?;
        self.expect(&Token::End)?;
        Ok(Stat::GenericFor { names, exprs, body })
    }

    fn parse_exprstat(&mut self) -> Result<Stat> {
        let first = self.parse_suffixed()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.eat(&Token::Comma) {
                targets.push(self.parse_suffixed()?);
            }
            if let Some(bad) = targets
                .iter()
                .find(|t| !matches!(t, Expr::Name(_) | Expr::Index { .. }))
            {
                return Err(self.error(format!("cannot assign to {bad:?}")));
            }
            self.expect(&Token::Assign)?;
            let values = self.parse_exprlist()?;
            return Ok(Stat::Assign { targets, values });
        }
        match first {
            Expr::Call { .. } | Expr::Method { .. } => Ok(Stat::Call(first)),
            other => Err(self.error(format!("syntax error near {other:?}"))),
        }
    }

    fn parse_funcbody(&mut self, method: bool) -> Result<FuncBody> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if method {
            params.push("self".to_string());
        }
        let mut vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                if self.eat(&Token::Ellipsis) {
                    vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let body = self.parse_block()?;
        self.expect(&Token::End)?;
        Ok(FuncBody {
            params,
            vararg,
            body,
        })
    }

    fn parse_exprlist(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.eat(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_subexpr(0)
    }

    fn binop(&self) -> Option<BinOp> {
        Some(match self.peek()? {
            Token::Plus => BinOp::Add,
            Token::Minus => BinOp::Sub,
            Token::Star => BinOp::Mul,
            Token::Slash => BinOp::Div,
            Token::Percent => BinOp::Mod,
            Token::Caret => BinOp::Pow,
            Token::DotDot => BinOp::Concat,
            Token::Eq => BinOp::Eq,
            Token::Ne => BinOp::Ne,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            Token::And => BinOp::And,
            Token::Or => BinOp::Or,
            _ => return None,
        })
    }

    fn parse_subexpr(&mut self, limit: u8) -> Result<Expr> {
        let unary = match self.peek() {
            Some(Token::Minus) => Some(UnOp::Neg),
            Some(Token::Not) => Some(UnOp::Not),
            Some(Token::Hash) => Some(UnOp::Len),
            _ => None,
        };
        let mut left = match unary {
            Some(op) => {
                self.pos += 1;
                let operand = self.parse_subexpr(UNARY_PRIORITY)?;
                Expr::Unary {
                    op,
                    operand: Box::new(operand),
                }
            }
            None => self.parse_simple()?,
        };
        while let Some(op) = self.binop() {
            let (left_priority, right_priority) = op.priority();
            if left_priority <= limit {
                break;
            }
            self.pos += 1;
            let right = self.parse_subexpr(right_priority)?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_simple(&mut self) -> Result<Expr> {
        let expr = match self.peek() {
            Some(Token::Nil) => Expr::Nil,
            Some(Token::True) => Expr::True,
            Some(Token::False) => Expr::False,
            Some(Token::Ellipsis) => Expr::Vararg,
            Some(Token::Number(text)) => Expr::Number(text.clone()),
            Some(Token::String(text)) => Expr::String(text.clone()),
            Some(Token::LBrace) => return self.parse_table(),
            Some(Token::Function) => {
                self.pos += 1;
                return Ok(Expr::Function(self.parse_funcbody(false)?));
            }
            _ => return self.parse_suffixed(),
        };
        self.pos += 1;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Name(name)) => Ok(Expr::Name(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            other => Err(self.error(format!("unexpected {other:?}"))),
        }
    }

    fn parse_suffixed(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = self.expect_name()?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        key: Box::new(Expr::String(format!("\"{name}\""))),
                    };
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let key = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        key: Box::new(key),
                    };
                }
                Some(Token::Colon) => {
                    self.pos += 1;
                    let name = self.expect_name()?;
                    let args = self.parse_args()?;
                    expr = Expr::Method {
                        object: Box::new(expr),
                        name,
                        args,
                    };
                }
                Some(Token::LParen | Token::String(_) | Token::LBrace) => {
                    let args = self.parse_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        match self.peek() {
            Some(Token::String(text)) => {
                let arg = Expr::String(text.clone());
                self.pos += 1;
                Ok(vec![arg])
            }
            Some(Token::LBrace) => Ok(vec![self.parse_table()?]),
            _ => {
                self.expect(&Token::LParen)?;
                if self.eat(&Token::RParen) {
                    return Ok(Vec::new());
                }
                let args = self.parse_exprlist()?;
                self.expect(&Token::RParen)?;
                Ok(args)
            }
        }
    }

    fn parse_table(&mut self) -> Result<Expr> {
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let field = match (self.peek(), self.peek_at(1)) {
                (Some(Token::LBracket), _) => {
                    self.pos += 1;
                    let key = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    TableField::Keyed(key, self.parse_expr()?)
                }
                (Some(Token::Name(name)), Some(Token::Assign)) => {
                    let name = name.clone();
                    self.pos += 2;
                    TableField::Named(name, self.parse_expr()?)
                }
                _ => TableField::Positional(self.parse_expr()?),
            };
            fields.push(field);
            if !self.eat(&Token::Comma) && !self.eat(&Token::Semi) {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Table(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse(source: &str) -> Block {
        Parser::new(lex(source).unwrap()).parse_chunk().unwrap()
    }

    #[test]
    fn concat_is_right_associative() {
        let block = parse("x = a .. b .. c");
        let Stat::Assign { values, .. } = &block.stats[0] else {
            panic!("expected assignment");
        };
        let Expr::Binary { op, right, .. } = &values[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Concat);
        assert!(matches!(**right, Expr::Binary { op: BinOp::Concat, .. }));
    }

    #[test]
    fn unary_binds_tighter_than_arithmetic_but_not_pow() {
        let block = parse("x = -a ^ b + c");
        let Stat::Assign { values, .. } = &block.stats[0] else {
            panic!("expected assignment");
        };
        let Expr::Binary { op, left, .. } = &values[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Add);
        let Expr::Unary { operand, .. } = &**left else {
            panic!("expected unary");
        };
        assert!(matches!(**operand, Expr::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn call_sugar_and_methods() {
        let block = parse("obj:m{1}; print 'x'; f(a)(b).c = 1");
        assert_eq!(block.stats.len(), 3);
        assert!(matches!(block.stats[0], Stat::Call(Expr::Method { .. })));
        assert!(matches!(block.stats[2], Stat::Assign { .. }));
    }

    #[test]
    fn protect_marker_sets_flag() {
        let block = parse("while true do --@protect\n x = 1 end");
        let Stat::While { body, .. } = &block.stats[0] else {
            panic!("expected while");
        };
        assert!(body.protected);
    }

    #[test]
    fn rejects_assignment_to_call() {
        let tokens = lex("f() = 1").unwrap();
        assert!(Parser::new(tokens).parse_chunk().is_err());
    }
}
