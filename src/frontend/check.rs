// This module implements the semantic checker for the kernel language. It resolves every name
// against lexical scopes and the module-level function table, infers and records a type for
// every expression in a TypeTable keyed by ExprId, and reports problems to the compile session:
// unknown names, duplicate definitions, type and arity mismatches, assignments to immutable
// bindings, non-bool conditions, invalid operands and casts, out-of-range literals and missing
// return values are errors; unused variables and parameters are warnings. The checker never
// stops at the first problem. Expressions that already failed are given the Error type so one
// mistake produces one report, and diverging expressions (return) get the Never type which is
// compatible with every expected type.

//! Name resolution and type checking.

use super::ast::*;
use crate::core::{CompileSession, Span};
use hashbrown::HashMap;

/// Types of every checked expression.
#[derive(Debug, Default, Clone)]
pub struct TypeTable {
    types: HashMap<ExprId, Type>,
}

impl TypeTable {
    pub fn get(&self, id: ExprId) -> Type {
        self.types.get(&id).copied().unwrap_or(Type::Error)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn insert(&mut self, id: ExprId, ty: Type) {
        self.types.insert(id, ty);
    }
}

/// Check `module`, reporting into `session`.
///
/// The returned table is only meaningful when the session holds no errors.
pub fn check_module<'a>(session: &mut CompileSession<'a>, module: &Module<'a>) -> TypeTable {
    let mut checker = Checker {
        session,
        functions: HashMap::new(),
        scopes: Vec::new(),
        ret: Type::Unit,
        types: TypeTable::default(),
    };

    checker.collect_signatures(module);
    for item in &module.items {
        if let Item::Fn(decl) = item {
            checker.check_fn(decl);
        }
    }

    log::debug!(
        "checked module `{}`: {} expressions typed, {} error(s), {} warning(s)",
        module.name,
        checker.types.len(),
        checker.session.error_count(),
        checker.session.warning_count()
    );
    checker.types
}

#[derive(Debug, Clone)]
struct FnType {
    params: Vec<Type>,
    ret: Type,
}

#[derive(Debug)]
struct Local<'a> {
    name: &'a str,
    ty: Type,
    mutable: bool,
    used: bool,
    span: Span,
}

struct Checker<'s, 'a> {
    session: &'s mut CompileSession<'a>,
    functions: HashMap<&'a str, FnType>,
    scopes: Vec<Vec<Local<'a>>>,
    ret: Type,
    types: TypeTable,
}

impl<'s, 'a> Checker<'s, 'a> {
    fn collect_signatures(&mut self, module: &Module<'a>) {
        for item in &module.items {
            let sig = item.sig();
            for param in &sig.params {
                if param.ty == Type::Unit {
                    self.session.error(
                        param.span,
                        format!("parameter `{}` cannot have type ()", param.name.name),
                    );
                }
            }

            if self.functions.contains_key(sig.name.name) {
                self.session.error(
                    sig.name.span,
                    format!("function `{}` is defined more than once", sig.name.name),
                );
                continue;
            }
            self.functions.insert(
                sig.name.name,
                FnType {
                    params: sig.params.iter().map(|p| p.ty).collect(),
                    ret: sig.ret,
                },
            );
        }
    }

    fn check_fn(&mut self, decl: &FnDecl<'a>) {
        self.ret = decl.sig.ret;
        self.scopes.push(Vec::new());

        for param in &decl.sig.params {
            if self.lookup_in_current(param.name.name) {
                self.session.error(
                    param.name.span,
                    format!("parameter `{}` is bound more than once", param.name.name),
                );
            }
            self.declare(param.name, param.ty, false);
        }

        let body_ty = self.check_block(&decl.body, Some(decl.sig.ret));
        if body_ty == Type::Unit && decl.sig.ret != Type::Unit && decl.body.tail.is_none() {
            self.session.error(
                decl.sig.span,
                format!(
                    "function `{}` must return a value of type {}",
                    decl.sig.name.name, decl.sig.ret
                ),
            );
        } else {
            let span = decl.body.tail.as_ref().map_or(decl.body.span, |t| t.span);
            self.expect_type(span, decl.sig.ret, body_ty);
        }

        self.pop_scope();
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn declare(&mut self, name: Ident<'a>, ty: Type, mutable: bool) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(Local {
                name: name.name,
                ty,
                mutable,
                used: false,
                span: name.span,
            });
        }
    }

    fn lookup_in_current(&self, name: &str) -> bool {
        self.scopes
            .last()
            .is_some_and(|scope| scope.iter().any(|l| l.name == name))
    }

    fn lookup(&mut self, name: &str) -> Option<&mut Local<'a>> {
        self.scopes
            .iter_mut()
            .rev()
            .flat_map(|scope| scope.iter_mut().rev())
            .find(|local| local.name == name)
    }

    fn pop_scope(&mut self) {
        let Some(scope) = self.scopes.pop() else {
            return;
        };
        for local in scope {
            if !local.used && !local.name.starts_with('_') {
                self.session
                    .warning(local.span, format!("unused variable `{}`", local.name));
            }
        }
    }

    // ------------------------------------------------------------------
    // Type relations
    // ------------------------------------------------------------------

    /// Report a mismatch unless one side already failed or diverges.
    fn expect_type(&mut self, span: Span, expected: Type, actual: Type) -> bool {
        if expected == actual || matches!(actual, Type::Never | Type::Error) || expected == Type::Error
        {
            return true;
        }
        self.session.error(
            span,
            format!("mismatched types: expected {}, found {}", expected, actual),
        );
        false
    }

    /// The type two branches agree on, if any.
    fn unify(a: Type, b: Type) -> Option<Type> {
        match (a, b) {
            (Type::Error, _) | (_, Type::Error) => Some(Type::Error),
            (Type::Never, other) | (other, Type::Never) => Some(other),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn check_block(&mut self, block: &Block<'a>, expected: Option<Type>) -> Type {
        self.scopes.push(Vec::new());
        let mut diverges = false;

        for stmt in &block.stmts {
            if self.check_stmt(stmt) == Type::Never {
                diverges = true;
            }
        }

        let ty = match &block.tail {
            Some(tail) => {
                let ty = self.check_expr(tail, expected);
                if diverges && ty != Type::Error {
                    Type::Never
                } else {
                    ty
                }
            }
            None if diverges => Type::Never,
            None => Type::Unit,
        };

        self.pop_scope();
        ty
    }

    fn check_stmt(&mut self, stmt: &Stmt<'a>) -> Type {
        match &stmt.kind {
            StmtKind::Let {
                name,
                mutable,
                ty,
                init,
            } => {
                let init_ty = self.check_expr(init, *ty);
                let local_ty = match ty {
                    Some(declared) => {
                        self.expect_type(init.span, *declared, init_ty);
                        *declared
                    }
                    None if init_ty == Type::Never => Type::Error,
                    None => init_ty,
                };
                self.declare(*name, local_ty, *mutable);
                if init_ty == Type::Never {
                    Type::Never
                } else {
                    Type::Unit
                }
            }
            StmtKind::Assign { target, op, value } => {
                let Some(local) = self.lookup(target.name) else {
                    self.session.error(
                        target.span,
                        format!("cannot find value `{}` in this scope", target.name),
                    );
                    self.check_expr(value, None);
                    return Type::Unit;
                };
                let (local_ty, mutable) = (local.ty, local.mutable);

                if !mutable {
                    self.session.error(
                        target.span,
                        format!("cannot assign twice to immutable variable `{}`", target.name),
                    );
                }
                if let Some(op) = op {
                    if !local_ty.is_numeric() && local_ty != Type::Error {
                        self.session.error(
                            stmt.span,
                            format!("cannot apply `{}=` to type {}", op.symbol(), local_ty),
                        );
                    }
                }

                let value_ty = self.check_expr(value, Some(local_ty));
                self.expect_type(value.span, local_ty, value_ty);
                if value_ty == Type::Never {
                    Type::Never
                } else {
                    Type::Unit
                }
            }
            StmtKind::While { cond, body } => {
                let cond_ty = self.check_expr(cond, Some(Type::Bool));
                self.expect_condition(cond.span, cond_ty);
                let body_ty = self.check_block(body, Some(Type::Unit));
                self.expect_type(body.span, Type::Unit, body_ty);
                Type::Unit
            }
            StmtKind::Return(value) => {
                let ret = self.ret;
                match value {
                    Some(value) => {
                        let ty = self.check_expr(value, Some(ret));
                        self.expect_type(value.span, ret, ty);
                    }
                    None if ret != Type::Unit => {
                        self.session.error(
                            stmt.span,
                            format!("missing return value of type {}", ret),
                        );
                    }
                    None => {}
                }
                Type::Never
            }
            StmtKind::Expr(expr) => {
                let ty = self.check_expr(expr, None);
                if ty == Type::Never {
                    Type::Never
                } else {
                    Type::Unit
                }
            }
        }
    }

    fn expect_condition(&mut self, span: Span, ty: Type) {
        if !matches!(ty, Type::Bool | Type::Never | Type::Error) {
            self.session
                .error(span, format!("condition must be bool, found {}", ty));
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn check_expr(&mut self, expr: &Expr<'a>, expected: Option<Type>) -> Type {
        let ty = self.infer_expr(expr, expected);
        self.types.insert(expr.id, ty);
        ty
    }

    fn infer_expr(&mut self, expr: &Expr<'a>, expected: Option<Type>) -> Type {
        match &expr.kind {
            ExprKind::Int { value, suffix } => {
                self.check_int_literal(expr.span, *value, *suffix, expected, false)
            }
            ExprKind::Float(_) => Type::F64,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Var(ident) => match self.lookup(ident.name) {
                Some(local) => {
                    local.used = true;
                    local.ty
                }
                None => {
                    self.session.error(
                        ident.span,
                        format!("cannot find value `{}` in this scope", ident.name),
                    );
                    Type::Error
                }
            },
            ExprKind::Call { callee, args } => self.check_call(expr.span, *callee, args),
            ExprKind::Unary { op, operand } => self.check_unary(*op, operand, expected),
            ExprKind::Binary { op, lhs, rhs } => {
                self.check_binary(expr.span, *op, lhs, rhs, expected)
            }
            ExprKind::Cast { expr: inner, ty } => {
                let from = self.check_expr(inner, None);
                let valid = match (from, *ty) {
                    (Type::Error, _) | (Type::Never, _) => true,
                    (from, to) if from.is_numeric() && to.is_numeric() => true,
                    (Type::Bool, to) if to.is_integer() => true,
                    (Type::Bool, Type::Bool) => true,
                    _ => false,
                };
                if !valid {
                    self.session
                        .error(expr.span, format!("cannot cast {} as {}", from, ty));
                }
                *ty
            }
            ExprKind::If {
                cond,
                then_block,
                else_branch,
            } => {
                let cond_ty = self.check_expr(cond, Some(Type::Bool));
                self.expect_condition(cond.span, cond_ty);
                let then_ty = self.check_block(then_block, expected);

                match else_branch {
                    Some(else_expr) => {
                        let else_ty = self.check_expr(else_expr, expected.or(Some(then_ty)));
                        match Self::unify(then_ty, else_ty) {
                            Some(ty) => ty,
                            None => {
                                self.session.error(
                                    else_expr.span,
                                    format!(
                                        "`if` and `else` have incompatible types: {} and {}",
                                        then_ty, else_ty
                                    ),
                                );
                                Type::Error
                            }
                        }
                    }
                    None => {
                        if !matches!(then_ty, Type::Unit | Type::Never | Type::Error) {
                            self.session.error(
                                then_block.span,
                                format!("`if` without `else` must have type (), found {}", then_ty),
                            );
                        }
                        Type::Unit
                    }
                }
            }
            ExprKind::Block(block) => self.check_block(block, expected),
        }
    }

    fn check_int_literal(
        &mut self,
        span: Span,
        value: u64,
        suffix: Option<Type>,
        expected: Option<Type>,
        negated: bool,
    ) -> Type {
        let ty = suffix.unwrap_or(match expected {
            Some(ty) if ty.is_integer() => ty,
            _ => Type::I64,
        });

        let max = match ty {
            Type::I32 => i32::MAX as u64,
            _ => i64::MAX as u64,
        } + u64::from(negated);

        if value > max {
            self.session
                .error(span, format!("literal out of range for {}", ty));
        }
        ty
    }

    fn check_call(&mut self, span: Span, callee: Ident<'a>, args: &[Expr<'a>]) -> Type {
        let Some(fn_ty) = self.functions.get(callee.name).cloned() else {
            self.session.error(
                callee.span,
                format!("cannot find function `{}` in this module", callee.name),
            );
            for arg in args {
                self.check_expr(arg, None);
            }
            return Type::Error;
        };

        if args.len() != fn_ty.params.len() {
            self.session.error(
                span,
                format!(
                    "function `{}` takes {} argument(s) but {} were supplied",
                    callee.name,
                    fn_ty.params.len(),
                    args.len()
                ),
            );
        }

        for (i, arg) in args.iter().enumerate() {
            match fn_ty.params.get(i) {
                Some(&param_ty) => {
                    let ty = self.check_expr(arg, Some(param_ty));
                    self.expect_type(arg.span, param_ty, ty);
                }
                None => {
                    self.check_expr(arg, None);
                }
            }
        }

        fn_ty.ret
    }

    fn check_unary(&mut self, op: UnOp, operand: &Expr<'a>, expected: Option<Type>) -> Type {
        let ty = match (op, &operand.kind) {
            (UnOp::Neg, ExprKind::Int { value, suffix }) => {
                let ty = self.check_int_literal(operand.span, *value, *suffix, expected, true);
                self.types.insert(operand.id, ty);
                ty
            }
            _ => self.check_expr(operand, expected),
        };

        let valid = match op {
            UnOp::Neg => ty.is_numeric(),
            UnOp::Not => ty.is_integer() || ty == Type::Bool,
        };
        if !valid && !matches!(ty, Type::Error | Type::Never) {
            let symbol = if op == UnOp::Neg { "-" } else { "!" };
            self.session.error(
                operand.span,
                format!("cannot apply unary `{}` to type {}", symbol, ty),
            );
            return Type::Error;
        }
        ty
    }

    fn check_binary(
        &mut self,
        span: Span,
        op: BinOp,
        lhs: &Expr<'a>,
        rhs: &Expr<'a>,
        expected: Option<Type>,
    ) -> Type {
        let operand_hint = if op.is_comparison() {
            None
        } else if op.is_logical() {
            Some(Type::Bool)
        } else {
            expected
        };

        // An unsuffixed literal on the left takes its type from the right.
        let untyped = |e: &Expr<'a>| matches!(e.kind, ExprKind::Int { suffix: None, .. });
        let (lhs_ty, rhs_ty) = if untyped(lhs) && !untyped(rhs) && !op.is_logical() {
            let rhs_ty = self.check_expr(rhs, operand_hint);
            let lhs_ty = self.check_expr(lhs, Some(rhs_ty));
            (lhs_ty, rhs_ty)
        } else {
            let lhs_ty = self.check_expr(lhs, operand_hint);
            let rhs_hint = if op.is_logical() { Some(Type::Bool) } else { Some(lhs_ty) };
            let rhs_ty = self.check_expr(rhs, rhs_hint);
            (lhs_ty, rhs_ty)
        };

        if matches!(lhs_ty, Type::Error) || matches!(rhs_ty, Type::Error) {
            return if op.is_comparison() || op.is_logical() {
                Type::Bool
            } else {
                Type::Error
            };
        }

        let operand_ty = match Self::unify(lhs_ty, rhs_ty) {
            Some(ty) => ty,
            None => {
                self.session.error(
                    span,
                    format!(
                        "cannot apply `{}` to {} and {}",
                        op.symbol(),
                        lhs_ty,
                        rhs_ty
                    ),
                );
                return Type::Error;
            }
        };

        let valid = match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                operand_ty.is_numeric()
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                operand_ty.is_integer() || operand_ty == Type::Bool
            }
            BinOp::Shl | BinOp::Shr => operand_ty.is_integer(),
            BinOp::Eq | BinOp::Ne => operand_ty.is_numeric() || operand_ty == Type::Bool,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => operand_ty.is_numeric(),
            BinOp::And | BinOp::Or => operand_ty == Type::Bool,
        };

        if !valid && operand_ty != Type::Never {
            self.session.error(
                span,
                format!("cannot apply `{}` to type {}", op.symbol(), operand_ty),
            );
            return Type::Error;
        }

        if op.is_comparison() || op.is_logical() {
            Type::Bool
        } else {
            operand_ty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parser::parse_module;
    use bumpalo::Bump;

    fn check(src: &str) -> (usize, usize, Vec<String>) {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "", src);
        let module = parse_module(&mut session, "jit");
        check_module(&mut session, &module);
        let messages = session
            .diagnostics()
            .iter()
            .map(|d| d.message.clone())
            .collect();
        (session.error_count(), session.warning_count(), messages)
    }

    #[test]
    fn test_valid_module() {
        let (errors, warnings, _) = check(
            "extern fn sqrt(x: f64) -> f64;\n\
             fn square(x: f64) -> f64 { x * x }\n\
             pub fn norm(x: f64, y: f64) -> f64 { sqrt(square(x) + square(y)) }\n\
             pub fn count(n: i32) -> i32 {\n\
                 let mut i: i32 = 0;\n\
                 while i < n { i += 1; }\n\
                 if i == n { i } else { -1 }\n\
             }",
        );
        assert_eq!(errors, 0);
        assert_eq!(warnings, 0);
    }

    #[test]
    fn test_literal_typing() {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "", "pub fn f(x: i32) -> bool { 1 < x }");
        let module = parse_module(&mut session, "jit");
        let types = check_module(&mut session, &module);
        assert_eq!(session.error_count(), 0);

        let Item::Fn(decl) = &module.items[0] else {
            panic!("expected function");
        };
        let ExprKind::Binary { lhs, .. } = &decl.body.tail.as_ref().unwrap().kind else {
            panic!("expected comparison");
        };
        assert_eq!(types.get(lhs.id), Type::I32);
    }

    #[test]
    fn test_semantic_errors() {
        let (errors, _, messages) = check(
            "pub fn f(a: i64) -> i64 {\n\
                 let b = a;\n\
                 b = 2;\n\
                 if a { 1 } else { 2 };\n\
                 missing(a) + c\n\
             }",
        );
        assert_eq!(errors, 4);
        assert!(messages.iter().any(|m| m.contains("immutable")));
        assert!(messages.iter().any(|m| m.contains("condition must be bool")));
        assert!(messages.iter().any(|m| m.contains("cannot find function `missing`")));
        assert!(messages.iter().any(|m| m.contains("cannot find value `c`")));
    }

    #[test]
    fn test_mismatch_and_arity() {
        let (errors, _, messages) = check(
            "fn g(x: i64, y: i64) -> i64 { x + y }\n\
             pub fn f() -> f64 { let z: i32 = g(1); 2.0 + z }",
        );
        assert_eq!(errors, 3);
        assert!(messages.iter().any(|m| m.contains("takes 2 argument(s)")));
        assert!(messages.iter().any(|m| m.contains("expected i32, found i64")));
        assert!(messages.iter().any(|m| m.contains("cannot apply `+` to f64 and i32")));
    }

    #[test]
    fn test_literal_range() {
        let (errors, _, _) = check("pub fn f() -> i32 { -2147483648 }");
        assert_eq!(errors, 0);
        let (errors, _, messages) = check("pub fn f() -> i32 { 2147483648 }");
        assert_eq!(errors, 1);
        assert!(messages[0].contains("out of range for i32"));
    }

    #[test]
    fn test_missing_return_value() {
        let (errors, _, messages) = check("pub fn f(a: i64) -> i64 { let _b = a; }");
        assert_eq!(errors, 1);
        assert!(messages[0].contains("must return a value"));

        let (errors, _, _) = check("pub fn f(a: i64) -> i64 { return a; }");
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_unused_variable_warnings() {
        let (errors, warnings, messages) = check(
            "pub fn f(a: i64, _b: i64) -> i64 { let unused = 3; let _quiet = 4; a }",
        );
        assert_eq!(errors, 0);
        assert_eq!(warnings, 1);
        assert!(messages[0].contains("unused variable `unused`"));
    }

    #[test]
    fn test_duplicate_definition() {
        let (errors, _, messages) = check("fn a() {}\nfn a() {}\npub fn b() { a() }");
        assert_eq!(errors, 1);
        assert!(messages[0].contains("defined more than once"));
    }
}
