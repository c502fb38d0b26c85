//! Recursive-descent parser for the kernel language.
//!
//! Errors are reported to the session and parsing resumes at the next item, so
//! one compile reports every malformed function instead of only the first.

use super::ast::*;
use super::lexer::{tokenize, Token, TokenKind};
use crate::core::{CompileSession, Span};

/// Parse the session source into a module named `module_name`.
pub fn parse_module<'a>(session: &mut CompileSession<'a>, module_name: &str) -> Module<'a> {
    let tokens = tokenize(session);
    let name = session.intern_str(module_name);
    let parser = Parser::new(session, tokens);
    parser.parse(name)
}

/// Marker for an error that has already been reported to the session.
#[derive(Debug)]
struct Reported;

type PResult<T> = Result<T, Reported>;

struct Parser<'s, 'a> {
    session: &'s mut CompileSession<'a>,
    tokens: Vec<Token<'a>>,
    pos: usize,
    next_expr_id: u32,
}

impl<'s, 'a> Parser<'s, 'a> {
    fn new(session: &'s mut CompileSession<'a>, tokens: Vec<Token<'a>>) -> Self {
        Self {
            session,
            tokens,
            pos: 0,
            next_expr_id: 0,
        }
    }

    fn parse(mut self, name: &'a str) -> Module<'a> {
        let mut items = Vec::new();

        while !self.at(TokenKind::Eof) {
            let item_start = self.pos;
            match self.parse_item() {
                Ok(item) => items.push(item),
                Err(Reported) => self.recover_to_item(item_start),
            }
        }

        log::debug!("parsed module `{}`: {} items", name, items.len());
        Module { name, items }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> Token<'a> {
        self.tokens[self.pos]
    }

    fn peek_kind(&self) -> TokenKind {
        self.tokens[self.pos].kind
    }

    fn peek_nth_kind(&self, n: usize) -> TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        self.tokens[idx].kind
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token<'a> {
        let token = self.tokens[self.pos];
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn try_read(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token<'a>> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&mut self, what: &str) -> Reported {
        let token = self.peek();
        let found = if token.kind == TokenKind::Eof {
            "end of input".to_string()
        } else {
            format!("`{}`", token.text)
        };
        self.session
            .error(token.span, format!("expected {}, found {}", what, found));
        Reported
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn new_expr(&mut self, kind: ExprKind<'a>, span: Span) -> Expr<'a> {
        let id = ExprId(self.next_expr_id);
        self.next_expr_id += 1;
        Expr { id, kind, span }
    }

    /// Skip the rest of the failed item: close every brace it opened, or stop
    /// at the next item keyword if it never opened one.
    fn recover_to_item(&mut self, item_start: usize) {
        let mut depth = self.tokens[item_start..self.pos]
            .iter()
            .fold(0usize, |depth, token| match token.kind {
                TokenKind::LBrace => depth + 1,
                TokenKind::RBrace => depth.saturating_sub(1),
                _ => depth,
            });
        if self.pos == item_start {
            self.advance();
        }
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                }
                TokenKind::Fn | TokenKind::Pub | TokenKind::Extern if depth == 0 => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn read_ident(&mut self, what: &str) -> PResult<Ident<'a>> {
        let token = self.expect(TokenKind::Ident, what)?;
        let name = self.session.intern_str(token.text);
        Ok(Ident {
            name,
            span: token.span,
        })
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    fn parse_item(&mut self) -> PResult<Item<'a>> {
        if self.try_read(TokenKind::Extern) {
            let sig = self.parse_sig()?;
            self.expect(TokenKind::Semi, "`;` after extern declaration")?;
            return Ok(Item::Extern(sig));
        }

        let public = self.try_read(TokenKind::Pub);
        let sig = self.parse_sig()?;
        let body = self.parse_block()?;
        Ok(Item::Fn(FnDecl { public, sig, body }))
    }

    fn parse_sig(&mut self) -> PResult<FnSig<'a>> {
        let start = self.expect(TokenKind::Fn, "`fn`")?.span;
        let name = self.read_ident("function name")?;
        self.expect(TokenKind::LParen, "`(`")?;

        let mut params = Vec::new();
        while !self.at(TokenKind::RParen) {
            let pname = self.read_ident("parameter name")?;
            self.expect(TokenKind::Colon, "`:`")?;
            let ty = self.parse_type()?;
            params.push(Param {
                name: pname,
                ty,
                span: pname.span.to(self.prev_span()),
            });
            if !self.try_read(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;

        let ret = if self.try_read(TokenKind::Arrow) {
            self.parse_type()?
        } else {
            Type::Unit
        };

        Ok(FnSig {
            name,
            params,
            ret,
            span: start.to(self.prev_span()),
        })
    }

    fn parse_type(&mut self) -> PResult<Type> {
        if self.try_read(TokenKind::LParen) {
            self.expect(TokenKind::RParen, "`)`")?;
            return Ok(Type::Unit);
        }

        let token = self.expect(TokenKind::Ident, "type")?;
        match token.text {
            "i32" => Ok(Type::I32),
            "i64" => Ok(Type::I64),
            "f64" => Ok(Type::F64),
            "bool" => Ok(Type::Bool),
            other => {
                self.session
                    .error(token.span, format!("unknown type `{}`", other));
                Err(Reported)
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> PResult<Block<'a>> {
        let start = self.expect(TokenKind::LBrace, "`{`")?.span;
        let mut stmts = Vec::new();
        let mut tail = None;

        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(self.unexpected("`}`"));
            }

            let stmt_start = self.peek().span;
            match self.peek_kind() {
                TokenKind::Let => {
                    let stmt = self.parse_let()?;
                    stmts.push(stmt);
                }
                TokenKind::While => {
                    self.advance();
                    let cond = self.parse_expr()?;
                    let body = self.parse_block()?;
                    stmts.push(Stmt {
                        kind: StmtKind::While { cond, body },
                        span: stmt_start.to(self.prev_span()),
                    });
                }
                TokenKind::Return => {
                    self.advance();
                    let value = if self.at(TokenKind::Semi) || self.at(TokenKind::RBrace) {
                        None
                    } else {
                        Some(self.parse_expr()?)
                    };
                    if !self.at(TokenKind::RBrace) {
                        self.expect(TokenKind::Semi, "`;` after return")?;
                    }
                    stmts.push(Stmt {
                        kind: StmtKind::Return(value),
                        span: stmt_start.to(self.prev_span()),
                    });
                }
                TokenKind::Ident if self.is_assignment() => {
                    let stmt = self.parse_assign()?;
                    stmts.push(stmt);
                }
                _ => {
                    let expr = self.parse_expr()?;
                    if self.try_read(TokenKind::Semi) {
                        stmts.push(Stmt {
                            span: expr.span,
                            kind: StmtKind::Expr(expr),
                        });
                    } else if self.at(TokenKind::RBrace) {
                        tail = Some(Box::new(expr));
                    } else if expr.kind.is_block_like() {
                        stmts.push(Stmt {
                            span: expr.span,
                            kind: StmtKind::Expr(expr),
                        });
                    } else {
                        return Err(self.unexpected("`;` or `}`"));
                    }
                }
            }
        }

        let end = self.expect(TokenKind::RBrace, "`}`")?.span;
        Ok(Block {
            stmts,
            tail,
            span: start.to(end),
        })
    }

    fn is_assignment(&self) -> bool {
        matches!(
            self.peek_nth_kind(1),
            TokenKind::Assign
                | TokenKind::PlusEq
                | TokenKind::MinusEq
                | TokenKind::StarEq
                | TokenKind::SlashEq
        )
    }

    fn parse_let(&mut self) -> PResult<Stmt<'a>> {
        let start = self.expect(TokenKind::Let, "`let`")?.span;
        let mutable = self.try_read(TokenKind::Mut);
        let name = self.read_ident("variable name")?;
        let ty = if self.try_read(TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(TokenKind::Assign, "`=`")?;
        let init = self.parse_expr()?;
        self.expect(TokenKind::Semi, "`;` after let")?;

        Ok(Stmt {
            kind: StmtKind::Let {
                name,
                mutable,
                ty,
                init,
            },
            span: start.to(self.prev_span()),
        })
    }

    fn parse_assign(&mut self) -> PResult<Stmt<'a>> {
        let target = self.read_ident("assignment target")?;
        let op = match self.advance().kind {
            TokenKind::Assign => None,
            TokenKind::PlusEq => Some(BinOp::Add),
            TokenKind::MinusEq => Some(BinOp::Sub),
            TokenKind::StarEq => Some(BinOp::Mul),
            TokenKind::SlashEq => Some(BinOp::Div),
            _ => unreachable!("is_assignment checked the operator"),
        };
        let value = self.parse_expr()?;
        self.expect(TokenKind::Semi, "`;` after assignment")?;

        Ok(Stmt {
            kind: StmtKind::Assign { target, op, value },
            span: target.span.to(self.prev_span()),
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<Expr<'a>> {
        self.parse_binary(0)
    }

    fn binary_op(kind: TokenKind) -> Option<(BinOp, u8)> {
        Some(match kind {
            TokenKind::PipePipe => (BinOp::Or, 1),
            TokenKind::AmpAmp => (BinOp::And, 2),
            TokenKind::EqEq => (BinOp::Eq, 3),
            TokenKind::Ne => (BinOp::Ne, 3),
            TokenKind::Lt => (BinOp::Lt, 3),
            TokenKind::Le => (BinOp::Le, 3),
            TokenKind::Gt => (BinOp::Gt, 3),
            TokenKind::Ge => (BinOp::Ge, 3),
            TokenKind::Pipe => (BinOp::BitOr, 4),
            TokenKind::Caret => (BinOp::BitXor, 5),
            TokenKind::Amp => (BinOp::BitAnd, 6),
            TokenKind::Shl => (BinOp::Shl, 7),
            TokenKind::Shr => (BinOp::Shr, 7),
            TokenKind::Plus => (BinOp::Add, 8),
            TokenKind::Minus => (BinOp::Sub, 8),
            TokenKind::Star => (BinOp::Mul, 9),
            TokenKind::Slash => (BinOp::Div, 9),
            TokenKind::Percent => (BinOp::Rem, 9),
            _ => return None,
        })
    }

    /// Precedence climbing; all binary operators are left associative.
    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr<'a>> {
        let mut lhs = self.parse_cast()?;

        while let Some((op, prec)) = Self::binary_op(self.peek_kind()) {
            if prec <= min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(prec)?;
            let span = lhs.span.to(rhs.span);
            lhs = self.new_expr(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }

        Ok(lhs)
    }

    fn parse_cast(&mut self) -> PResult<Expr<'a>> {
        let mut expr = self.parse_unary()?;
        while self.try_read(TokenKind::As) {
            let ty = self.parse_type()?;
            let span = expr.span.to(self.prev_span());
            expr = self.new_expr(
                ExprKind::Cast {
                    expr: Box::new(expr),
                    ty,
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> PResult<Expr<'a>> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnOp::Neg,
            TokenKind::Bang => UnOp::Not,
            _ => return self.parse_primary(),
        };
        let start = self.advance().span;
        let operand = self.parse_unary()?;
        let span = start.to(operand.span);
        Ok(self.new_expr(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_primary(&mut self) -> PResult<Expr<'a>> {
        let token = self.peek();
        match token.kind {
            TokenKind::Int { value, suffix } => {
                self.advance();
                Ok(self.new_expr(ExprKind::Int { value, suffix }, token.span))
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(self.new_expr(ExprKind::Float(value), token.span))
            }
            TokenKind::True | TokenKind::False => {
                self.advance();
                Ok(self.new_expr(ExprKind::Bool(token.kind == TokenKind::True), token.span))
            }
            TokenKind::Ident => {
                let ident = self.read_ident("identifier")?;
                if !self.try_read(TokenKind::LParen) {
                    return Ok(self.new_expr(ExprKind::Var(ident), ident.span));
                }

                let mut args = Vec::new();
                while !self.at(TokenKind::RParen) {
                    args.push(self.parse_expr()?);
                    if !self.try_read(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen, "`)` after arguments")?;
                let span = ident.span.to(self.prev_span());
                Ok(self.new_expr(ExprKind::Call { callee: ident, args }, span))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                let span = block.span;
                Ok(self.new_expr(ExprKind::Block(block), span))
            }
            TokenKind::If => self.parse_if(),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_if(&mut self) -> PResult<Expr<'a>> {
        let start = self.expect(TokenKind::If, "`if`")?.span;
        let cond = self.parse_expr()?;
        let then_block = self.parse_block()?;

        let else_branch = if self.try_read(TokenKind::Else) {
            if self.at(TokenKind::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                let block = self.parse_block()?;
                let span = block.span;
                Some(Box::new(self.new_expr(ExprKind::Block(block), span)))
            }
        } else {
            None
        };

        let span = start.to(self.prev_span());
        Ok(self.new_expr(
            ExprKind::If {
                cond: Box::new(cond),
                then_block,
                else_branch,
            },
            span,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn test_parse_function_items() {
        let arena = Bump::new();
        let mut session = CompileSession::new(
            &arena,
            "",
            "extern fn sqrt(x: f64) -> f64;\n\
             pub fn add(a: i64, b: i64) -> i64 { a + b }\n\
             fn helper() { }",
        );
        let module = parse_module(&mut session, "jit");

        assert_eq!(session.error_count(), 0);
        assert_eq!(module.items.len(), 3);
        assert!(matches!(module.items[0], Item::Extern(_)));
        match &module.items[1] {
            Item::Fn(decl) => {
                assert!(decl.public);
                assert_eq!(decl.sig.name.name, "add");
                assert_eq!(decl.sig.params.len(), 2);
                assert_eq!(decl.sig.ret, Type::I64);
                assert!(decl.body.tail.is_some());
            }
            _ => panic!("expected function"),
        }
        assert_eq!(module.items[2].sig().ret, Type::Unit);
    }

    #[test]
    fn test_precedence() {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "", "fn f() -> i64 { 1 + 2 * 3 - 4 }");
        let module = parse_module(&mut session, "jit");
        assert_eq!(session.error_count(), 0);

        let Item::Fn(decl) = &module.items[0] else {
            panic!("expected function");
        };
        // (1 + (2 * 3)) - 4
        let tail = decl.body.tail.as_ref().unwrap();
        let ExprKind::Binary { op, lhs, .. } = &tail.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Sub);
        let ExprKind::Binary { op, rhs, .. } = &lhs.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_statements_and_control_flow() {
        let arena = Bump::new();
        let mut session = CompileSession::new(
            &arena,
            "",
            "pub fn f(n: i64) -> i64 {\n\
                 let mut acc = 0;\n\
                 let mut i: i64 = 0;\n\
                 while i < n { acc += i; i = i + 1; }\n\
                 if acc > 10 { return acc; }\n\
                 acc as i64\n\
             }",
        );
        let module = parse_module(&mut session, "jit");
        assert_eq!(session.error_count(), 0);

        let Item::Fn(decl) = &module.items[0] else {
            panic!("expected function");
        };
        assert_eq!(decl.body.stmts.len(), 4);
        assert!(matches!(decl.body.stmts[2].kind, StmtKind::While { .. }));
        assert!(matches!(decl.body.tail.as_ref().unwrap().kind, ExprKind::Cast { .. }));
    }

    #[test]
    fn test_recovery_reports_each_bad_item() {
        let arena = Bump::new();
        let mut session = CompileSession::new(
            &arena,
            "",
            "fn a() -> i64 { let = 1; }\n\
             fn b() -> i64 { 2 }\n\
             fn c( { }\n\
             pub fn d() -> i64 { 4 }",
        );
        let module = parse_module(&mut session, "jit");

        assert_eq!(session.error_count(), 2);
        let names: Vec<_> = module.items.iter().map(|i| i.sig().name.name).collect();
        assert_eq!(names, vec!["b", "d"]);
    }
}
