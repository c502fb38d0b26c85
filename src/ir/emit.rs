//! Lowering of a checked AST into a [`World`].
//!
//! Immutable bindings become SSA values directly. Mutable bindings get a stack
//! slot in the entry block. Code following a `return` is emitted into a fresh
//! block without predecessors, which `cleanup` later deletes.

use super::*;
use crate::frontend::ast::{self, BinOp, Block, Expr, ExprKind, Item, Stmt, StmtKind, UnOp};
use crate::frontend::TypeTable;
use hashbrown::HashMap;

/// Emit every item of `module` into `world`.
///
/// `types` must come from a check of `module` that reported no errors.
pub fn emit_module(module: &ast::Module<'_>, types: &TypeTable, world: &mut World) {
    let mut signatures = HashMap::new();

    for item in &module.items {
        let sig = item.sig();
        let linkage = match item {
            Item::Extern(_) => Linkage::Import,
            Item::Fn(decl) if decl.public => Linkage::Export,
            Item::Fn(_) => Linkage::Internal,
        };
        let params = sig.params.iter().map(|p| lower_type(p.ty)).collect();
        let id = world.add_function(Function::new(
            sig.name.name,
            linkage,
            params,
            lower_type(sig.ret),
        ));
        signatures.insert(sig.name.name, id);
    }

    let rets: HashMap<FuncId, Type> = signatures
        .values()
        .map(|&id| (id, world.function(id).ret))
        .collect();

    for item in &module.items {
        let Item::Fn(decl) = item else {
            continue;
        };
        let id = signatures[decl.sig.name.name];
        let func = world.function_mut(id);

        let mut emitter = FnEmitter {
            b: FunctionBuilder::new(func),
            types,
            signatures: &signatures,
            rets: &rets,
            scopes: vec![Vec::new()],
        };
        emitter.emit_body(decl);
        log::debug!(
            "emitted `{}`: {} blocks, {} instructions",
            decl.sig.name.name,
            world.function(id).blocks.len(),
            world.function(id).inst_count()
        );
    }
}

fn lower_type(ty: ast::Type) -> Type {
    match ty {
        ast::Type::I32 => Type::I32,
        ast::Type::I64 => Type::I64,
        ast::Type::F64 => Type::F64,
        ast::Type::Bool => Type::Bool,
        ast::Type::Unit | ast::Type::Never | ast::Type::Error => Type::Unit,
    }
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    /// SSA value, absent for unit-typed bindings.
    Value(Option<Value>),
    /// Stack slot and the type stored in it.
    Slot(Value, Type),
}

struct FnEmitter<'f, 'a, 't> {
    b: FunctionBuilder<'f>,
    types: &'t TypeTable,
    signatures: &'t HashMap<&'a str, FuncId>,
    rets: &'t HashMap<FuncId, Type>,
    scopes: Vec<Vec<(&'a str, Binding)>>,
}

impl<'f, 'a, 't> FnEmitter<'f, 'a, 't> {
    fn emit_body(&mut self, decl: &ast::FnDecl<'a>) {
        let params = self.b.block_params(BlockId::ENTRY).to_vec();
        for (param, value) in decl.sig.params.iter().zip(params) {
            self.bind(param.name.name, Binding::Value(Some(value)));
        }

        let ret = self.b.function().ret;
        let value = self.emit_block(&decl.body);
        let term = if ret == Type::Unit {
            Terminator::Return(None)
        } else {
            Terminator::Return(Some(self.value_or_dead(value, ret)))
        };
        self.b.terminate(term);
    }

    fn ty(&self, expr: &Expr<'_>) -> Type {
        lower_type(self.types.get(expr.id))
    }

    fn bind(&mut self, name: &'a str, binding: Binding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name, binding));
        }
    }

    fn lookup(&self, name: &str) -> Option<Binding> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(n, _)| *n == name)
            .map(|(_, binding)| *binding)
    }

    /// A value for code that can never run, where the real value is missing
    /// because an operand diverged.
    fn value_or_dead(&mut self, value: Option<Value>, ty: Type) -> Value {
        match value {
            Some(value) => value,
            None => {
                let c = match ty {
                    Type::F64 => Const::Float(0.0),
                    Type::Bool => Const::Bool(false),
                    _ => Const::Int(0),
                };
                self.b.ins(InstKind::Const(c), ty)
            }
        }
    }

    /// Continue emission in a block nothing jumps to.
    fn start_dead_block(&mut self) {
        let dead = self.b.create_block();
        self.b.switch_to(dead);
    }

    fn emit_block(&mut self, block: &Block<'a>) -> Option<Value> {
        self.scopes.push(Vec::new());
        for stmt in &block.stmts {
            self.emit_stmt(stmt);
        }
        let value = block.tail.as_ref().and_then(|tail| self.emit_expr(tail));
        self.scopes.pop();
        value
    }

    fn emit_stmt(&mut self, stmt: &Stmt<'a>) {
        match &stmt.kind {
            StmtKind::Let {
                name,
                mutable,
                init,
                ..
            } => {
                let ty = self.ty(init);
                let value = self.emit_expr(init);
                let binding = if *mutable && ty != Type::Unit {
                    let slot = self.b.alloca(ty);
                    let value = self.value_or_dead(value, ty);
                    self.b.ins_void(InstKind::Store { ptr: slot, value });
                    Binding::Slot(slot, ty)
                } else {
                    Binding::Value(value)
                };
                self.bind(name.name, binding);
            }
            StmtKind::Assign { target, op, value } => {
                let new_value = self.emit_expr(value);
                let Some(Binding::Slot(slot, ty)) = self.lookup(target.name) else {
                    return;
                };
                let new_value = self.value_or_dead(new_value, ty);
                let stored = match op {
                    Some(op) => {
                        let current = self.b.ins(InstKind::Load(slot), ty);
                        self.b
                            .ins(InstKind::Binary(binary_op(*op), current, new_value), ty)
                    }
                    None => new_value,
                };
                self.b.ins_void(InstKind::Store {
                    ptr: slot,
                    value: stored,
                });
            }
            StmtKind::While { cond, body } => {
                let header = self.b.create_block();
                let body_bb = self.b.create_block();
                let exit = self.b.create_block();

                self.b.terminate(Terminator::Jump(header, Vec::new()));
                self.b.switch_to(header);
                let c = self.emit_expr(cond);
                let c = self.value_or_dead(c, Type::Bool);
                self.b.terminate(Terminator::Branch {
                    cond: c,
                    then_dest: body_bb,
                    else_dest: exit,
                });

                self.b.switch_to(body_bb);
                self.emit_block(body);
                self.b.terminate(Terminator::Jump(header, Vec::new()));

                self.b.switch_to(exit);
            }
            StmtKind::Return(value) => {
                let ret = self.b.function().ret;
                let v = value.as_ref().and_then(|v| self.emit_expr(v));
                let term = if ret == Type::Unit {
                    Terminator::Return(None)
                } else {
                    Terminator::Return(Some(self.value_or_dead(v, ret)))
                };
                self.b.terminate(term);
                self.start_dead_block();
            }
            StmtKind::Expr(expr) => {
                self.emit_expr(expr);
            }
        }
    }

    fn emit_expr(&mut self, expr: &Expr<'a>) -> Option<Value> {
        let ty = self.ty(expr);
        match &expr.kind {
            ExprKind::Int { value, .. } => Some(self.b.iconst(ty, *value as i64)),
            ExprKind::Float(value) => Some(self.b.ins(InstKind::Const(Const::Float(*value)), ty)),
            ExprKind::Bool(value) => Some(self.b.ins(InstKind::Const(Const::Bool(*value)), ty)),
            ExprKind::Var(ident) => match self.lookup(ident.name)? {
                Binding::Value(value) => value,
                Binding::Slot(slot, slot_ty) => Some(self.b.ins(InstKind::Load(slot), slot_ty)),
            },
            ExprKind::Call { callee, args } => {
                let id = *self.signatures.get(callee.name)?;
                let ret = self.rets.get(&id).copied().unwrap_or(Type::Unit);
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let arg_ty = self.ty(arg);
                    let v = self.emit_expr(arg);
                    values.push(self.value_or_dead(v, arg_ty));
                }
                if ret == Type::Unit {
                    self.b.ins_void(InstKind::Call(id, values));
                    None
                } else {
                    Some(self.b.ins(InstKind::Call(id, values), ret))
                }
            }
            ExprKind::Unary { op, operand } => {
                // Negated literals are folded here so `-2147483648` stays in range.
                if let (UnOp::Neg, ExprKind::Int { value, .. }) = (op, &operand.kind) {
                    return Some(self.b.iconst(ty, (*value as i64).wrapping_neg()));
                }
                let v = self.emit_expr(operand);
                let v = self.value_or_dead(v, ty);
                let op = match op {
                    UnOp::Neg => UnaryOp::Neg,
                    UnOp::Not => UnaryOp::Not,
                };
                Some(self.b.ins(InstKind::Unary(op, v), ty))
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_logical() => {
                Some(self.emit_short_circuit(*op, lhs, rhs))
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let operand_ty = self.ty(lhs);
                let l = self.emit_expr(lhs);
                let l = self.value_or_dead(l, operand_ty);
                let r = self.emit_expr(rhs);
                let r = self.value_or_dead(r, operand_ty);
                let kind = match cmp_op(*op) {
                    Some(cmp) => InstKind::Cmp(cmp, l, r),
                    None => InstKind::Binary(binary_op(*op), l, r),
                };
                Some(self.b.ins(kind, ty))
            }
            ExprKind::Cast { expr: inner, .. } => {
                let from = self.ty(inner);
                let v = self.emit_expr(inner);
                let v = self.value_or_dead(v, from);
                Some(self.b.ins(InstKind::Cast(v), ty))
            }
            ExprKind::If {
                cond,
                then_block,
                else_branch,
            } => {
                let c = self.emit_expr(cond);
                let c = self.value_or_dead(c, Type::Bool);

                let then_bb = self.b.create_block();
                let else_bb = self.b.create_block();
                let join = self.b.create_block();
                let result = (ty != Type::Unit).then(|| self.b.add_block_param(join, ty));

                self.b.terminate(Terminator::Branch {
                    cond: c,
                    then_dest: then_bb,
                    else_dest: else_bb,
                });

                self.b.switch_to(then_bb);
                let v = self.emit_block(then_block);
                self.jump_with(join, v, result.map(|_| ty));

                self.b.switch_to(else_bb);
                let v = else_branch.as_ref().and_then(|e| self.emit_expr(e));
                self.jump_with(join, v, result.map(|_| ty));

                self.b.switch_to(join);
                result
            }
            ExprKind::Block(block) => self.emit_block(block),
        }
    }

    fn jump_with(&mut self, dest: BlockId, value: Option<Value>, param: Option<Type>) {
        let args = match param {
            Some(ty) => vec![self.value_or_dead(value, ty)],
            None => Vec::new(),
        };
        self.b.terminate(Terminator::Jump(dest, args));
    }

    /// `a && b` / `a || b`: the right operand only runs when it decides the result.
    fn emit_short_circuit(&mut self, op: BinOp, lhs: &Expr<'a>, rhs: &Expr<'a>) -> Value {
        let l = self.emit_expr(lhs);
        let l = self.value_or_dead(l, Type::Bool);

        let rhs_bb = self.b.create_block();
        let short_bb = self.b.create_block();
        let join = self.b.create_block();
        let result = self.b.add_block_param(join, Type::Bool);

        let (then_dest, else_dest) = match op {
            BinOp::And => (rhs_bb, short_bb),
            _ => (short_bb, rhs_bb),
        };
        self.b.terminate(Terminator::Branch {
            cond: l,
            then_dest,
            else_dest,
        });

        self.b.switch_to(rhs_bb);
        let r = self.emit_expr(rhs);
        self.jump_with(join, r, Some(Type::Bool));

        self.b.switch_to(short_bb);
        let short = self
            .b
            .ins(InstKind::Const(Const::Bool(op == BinOp::Or)), Type::Bool);
        self.b.terminate(Terminator::Jump(join, vec![short]));

        self.b.switch_to(join);
        result
    }
}

fn binary_op(op: BinOp) -> BinaryOp {
    match op {
        BinOp::Add => BinaryOp::Add,
        BinOp::Sub => BinaryOp::Sub,
        BinOp::Mul => BinaryOp::Mul,
        BinOp::Div => BinaryOp::Div,
        BinOp::Rem => BinaryOp::Rem,
        BinOp::BitAnd | BinOp::And => BinaryOp::And,
        BinOp::BitOr | BinOp::Or => BinaryOp::Or,
        BinOp::BitXor => BinaryOp::Xor,
        BinOp::Shl => BinaryOp::Shl,
        BinOp::Shr => BinaryOp::Shr,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            unreachable!("comparisons lower to Cmp")
        }
    }
}

fn cmp_op(op: BinOp) -> Option<CmpOp> {
    Some(match op {
        BinOp::Eq => CmpOp::Eq,
        BinOp::Ne => CmpOp::Ne,
        BinOp::Lt => CmpOp::Lt,
        BinOp::Le => CmpOp::Le,
        BinOp::Gt => CmpOp::Gt,
        BinOp::Ge => CmpOp::Ge,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileSession;
    use crate::frontend::{check_module, parse_module};
    use bumpalo::Bump;

    fn lower(src: &str) -> World {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "", src);
        let module = parse_module(&mut session, "jit");
        let types = check_module(&mut session, &module);
        assert_eq!(session.error_count(), 0, "{}", session.diagnostics());
        let mut world = World::new("jit");
        emit_module(&module, &types, &mut world);
        world
    }

    #[test]
    fn test_linkage_follows_visibility() {
        let world = lower(
            "extern fn sqrt(x: f64) -> f64;\n\
             fn helper(x: f64) -> f64 { sqrt(x) }\n\
             pub fn api(x: f64) -> f64 { helper(x) }",
        );
        let linkages: Vec<_> = world.functions.iter().map(|f| f.linkage).collect();
        assert_eq!(linkages, vec![Linkage::Import, Linkage::Internal, Linkage::Export]);
        assert!(world.function(FuncId(0)).blocks.is_empty());
    }

    #[test]
    fn test_mutable_bindings_use_slots() {
        let world = lower(
            "pub fn sum(n: i64) -> i64 {\n\
                 let mut acc = 0;\n\
                 let mut i = 0;\n\
                 while i < n { acc += i; i += 1; }\n\
                 acc\n\
             }",
        );
        let func = world.function(FuncId(0));
        let entry = func.block(BlockId::ENTRY);
        assert!(matches!(entry.insts[0].kind, InstKind::Alloca(Type::I64)));
        assert!(matches!(entry.insts[1].kind, InstKind::Alloca(Type::I64)));
        // entry, header, body, exit
        assert_eq!(func.blocks.len(), 4);
    }

    #[test]
    fn test_if_expression_joins_with_block_param() {
        let world = lower("pub fn max(a: i64, b: i64) -> i64 { if a > b { a } else { b } }");
        let func = world.function(FuncId(0));
        let join = func
            .blocks
            .iter()
            .find(|b| !b.params.is_empty() && !std::ptr::eq(*b, func.block(BlockId::ENTRY)))
            .expect("join block");
        assert_eq!(join.params.len(), 1);
        assert!(matches!(join.term, Terminator::Return(Some(v)) if v == join.params[0]));
    }

    #[test]
    fn test_code_after_return_is_detached() {
        let world = lower("pub fn f(a: i64) -> i64 { return a; }");
        let func = world.function(FuncId(0));
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.block(BlockId::ENTRY).term, Terminator::Return(Some(Value(0))));
    }
}
