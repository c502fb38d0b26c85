// This module implements the IR optimizer that runs between the two cleanup passes. It folds
// instructions whose operands are constants (integer arithmetic wraps at the operand width,
// exactly like the generated machine code), applies algebraic identities such as x + 0 and
// x * 1 by substituting the surviving operand for the result, and turns conditional branches
// on constant conditions into unconditional jumps. Folds that would change run-time behaviour
// are refused: division or remainder by zero, MIN / -1, shift amounts outside the operand
// width, and float-to-integer casts of values that do not fit. Instructions left without users
// and blocks left without predecessors are removed by the following cleanup.

//! Constant folding, algebraic identities and branch folding.

use super::*;
use hashbrown::HashMap;

/// Optimize every defined function of `world`.
pub fn opt(world: &mut World) {
    let before = world.inst_count();
    let mut folded = 0;
    for func in world.functions.iter_mut().filter(|f| !f.is_declaration()) {
        folded += optimize_function(func);
    }
    log::debug!(
        "opt: folded {} instruction(s), {} instructions remain before cleanup",
        folded,
        before
    );
}

fn optimize_function(func: &mut Function) -> usize {
    let mut consts: HashMap<Value, Const> = HashMap::new();
    let mut subst: HashMap<Value, Value> = HashMap::new();
    let mut folded = 0;

    let resolve = |subst: &HashMap<Value, Value>, mut v: Value| {
        while let Some(&next) = subst.get(&v) {
            v = next;
        }
        v
    };

    // Values are defined before use along every path, so one pass in block order
    // sees each constant operand before the instructions reading it, except
    // across back edges where nothing is constant anyway.
    for block_index in 0..func.blocks.len() {
        for inst_index in 0..func.blocks[block_index].insts.len() {
            let (result, kind) = {
                let inst = &mut func.blocks[block_index].insts[inst_index];
                inst.kind.map_operands(|v| resolve(&subst, v));
                (inst.result, inst.kind.clone())
            };
            let Some(result) = result else {
                continue;
            };
            let ty = func.value_type(result);

            match simplify(&kind, ty, func, &consts) {
                Simplified::Const(c) => {
                    consts.insert(result, c);
                    if !matches!(kind, InstKind::Const(_)) {
                        func.blocks[block_index].insts[inst_index].kind = InstKind::Const(c);
                        folded += 1;
                    }
                }
                Simplified::Value(v) => {
                    subst.insert(result, v);
                    if let Some(&c) = consts.get(&v) {
                        consts.insert(result, c);
                    }
                    folded += 1;
                }
                Simplified::None => {}
            }
        }

        let block = &mut func.blocks[block_index];
        block.term.map_operands(|v| resolve(&subst, v));
        if let Terminator::Branch {
            cond,
            then_dest,
            else_dest,
        } = block.term
        {
            if let Some(Const::Bool(c)) = consts.get(&cond) {
                let dest = if *c { then_dest } else { else_dest };
                block.term = Terminator::Jump(dest, Vec::new());
                folded += 1;
            }
        }
    }

    // Back edges may still name substituted values.
    if !subst.is_empty() {
        for block in &mut func.blocks {
            for inst in &mut block.insts {
                inst.kind.map_operands(|v| resolve(&subst, v));
            }
            block.term.map_operands(|v| resolve(&subst, v));
        }
    }

    folded
}

enum Simplified {
    Const(Const),
    Value(Value),
    None,
}

fn simplify(
    kind: &InstKind,
    ty: Type,
    func: &Function,
    consts: &HashMap<Value, Const>,
) -> Simplified {
    let get = |v: &Value| consts.get(v).copied();

    match kind {
        InstKind::Const(c) => Simplified::Const(*c),
        InstKind::Unary(op, a) => match get(a).and_then(|a| fold_unary(*op, a, ty)) {
            Some(c) => Simplified::Const(c),
            None => Simplified::None,
        },
        InstKind::Binary(op, a, b) => match (get(a), get(b)) {
            (Some(ca), Some(cb)) => match fold_binary(*op, ca, cb, ty) {
                Some(c) => Simplified::Const(c),
                None => Simplified::None,
            },
            (ca, cb) => identity(*op, *a, ca, *b, cb, ty),
        },
        InstKind::Cmp(op, a, b) => match (get(a), get(b)) {
            (Some(ca), Some(cb)) => fold_cmp(*op, ca, cb).map_or(Simplified::None, |c| {
                Simplified::Const(Const::Bool(c))
            }),
            _ => Simplified::None,
        },
        InstKind::Cast(a) => {
            let from = func.value_type(*a);
            if from == ty {
                return Simplified::Value(*a);
            }
            match get(a).and_then(|c| fold_cast(c, ty)) {
                Some(c) => Simplified::Const(c),
                None => Simplified::None,
            }
        }
        InstKind::Call(..) | InstKind::Alloca(_) | InstKind::Load(_) | InstKind::Store { .. } => {
            Simplified::None
        }
    }
}

/// Truncate to `ty`'s width and sign-extend back.
fn wrap(value: i64, ty: Type) -> i64 {
    match ty {
        Type::I32 => value as i32 as i64,
        _ => value,
    }
}

fn fold_unary(op: UnaryOp, a: Const, ty: Type) -> Option<Const> {
    Some(match (op, a) {
        (UnaryOp::Neg, Const::Int(a)) => Const::Int(wrap(a.wrapping_neg(), ty)),
        (UnaryOp::Neg, Const::Float(a)) => Const::Float(-a),
        (UnaryOp::Not, Const::Int(a)) => Const::Int(wrap(!a, ty)),
        (UnaryOp::Not, Const::Bool(a)) => Const::Bool(!a),
        _ => return None,
    })
}

fn fold_binary(op: BinaryOp, a: Const, b: Const, ty: Type) -> Option<Const> {
    match (a, b) {
        (Const::Int(a), Const::Int(b)) => {
            let width = ty.int_width()?;
            let min = if width == 32 { i32::MIN as i64 } else { i64::MIN };
            let value = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div | BinaryOp::Rem if b == 0 || (a == min && b == -1) => return None,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::Shl | BinaryOp::Shr if b < 0 || b >= i64::from(width) => return None,
                BinaryOp::Shl => a << b,
                BinaryOp::Shr => a >> b,
            };
            Some(Const::Int(wrap(value, ty)))
        }
        (Const::Float(a), Const::Float(b)) => Some(Const::Float(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            _ => return None,
        })),
        (Const::Bool(a), Const::Bool(b)) => Some(Const::Bool(match op {
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            _ => return None,
        })),
        _ => None,
    }
}

fn fold_cmp(op: CmpOp, a: Const, b: Const) -> Option<bool> {
    fn cmp<T: PartialOrd>(op: CmpOp, a: T, b: T) -> bool {
        match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }

    match (a, b) {
        (Const::Int(a), Const::Int(b)) => Some(cmp(op, a, b)),
        (Const::Float(a), Const::Float(b)) => Some(cmp(op, a, b)),
        (Const::Bool(a), Const::Bool(b)) => Some(cmp(op, a, b)),
        _ => None,
    }
}

fn fold_cast(c: Const, to: Type) -> Option<Const> {
    // Out-of-range conversions are poison in the generated code; leave them alone.
    let fits = |v: f64, lo: f64, hi: f64| v.is_finite() && v.trunc() >= lo && v.trunc() < hi;

    match (c, to) {
        (Const::Int(v), Type::I32 | Type::I64) => Some(Const::Int(wrap(v, to))),
        (Const::Int(v), Type::F64) => Some(Const::Float(v as f64)),
        (Const::Bool(v), Type::I32 | Type::I64) => Some(Const::Int(i64::from(v))),
        (Const::Float(v), Type::I32) if fits(v, i32::MIN as f64, i32::MAX as f64 + 1.0) => {
            Some(Const::Int(v as i32 as i64))
        }
        (Const::Float(v), Type::I64) if fits(v, i64::MIN as f64, -(i64::MIN as f64)) => {
            Some(Const::Int(v as i64))
        }
        (Const::Float(v), Type::F64) => Some(Const::Float(v)),
        _ => None,
    }
}

/// `x op c` / `c op x` rewrites that need only one constant operand.
fn identity(
    op: BinaryOp,
    a: Value,
    ca: Option<Const>,
    b: Value,
    cb: Option<Const>,
    ty: Type,
) -> Simplified {
    if ty.is_integer() {
        let is = |c: Option<Const>, n: i64| c == Some(Const::Int(n));
        return match op {
            BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor if is(cb, 0) => Simplified::Value(a),
            BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor if is(ca, 0) => Simplified::Value(b),
            BinaryOp::Sub | BinaryOp::Shl | BinaryOp::Shr if is(cb, 0) => Simplified::Value(a),
            BinaryOp::Mul | BinaryOp::Div if is(cb, 1) => Simplified::Value(a),
            BinaryOp::Mul if is(ca, 1) => Simplified::Value(b),
            BinaryOp::Mul | BinaryOp::And if is(ca, 0) || is(cb, 0) => {
                Simplified::Const(Const::Int(0))
            }
            _ => Simplified::None,
        };
    }

    if ty == Type::Bool {
        return match (op, ca, cb) {
            (BinaryOp::And, _, Some(Const::Bool(true))) => Simplified::Value(a),
            (BinaryOp::And, Some(Const::Bool(true)), _) => Simplified::Value(b),
            (BinaryOp::Or, _, Some(Const::Bool(false))) => Simplified::Value(a),
            (BinaryOp::Or, Some(Const::Bool(false)), _) => Simplified::Value(b),
            _ => Simplified::None,
        };
    }

    Simplified::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_binary_wraps_at_width() {
        assert_eq!(
            fold_binary(BinaryOp::Add, Const::Int(i32::MAX as i64), Const::Int(1), Type::I32),
            Some(Const::Int(i32::MIN as i64))
        );
        assert_eq!(
            fold_binary(BinaryOp::Mul, Const::Int(6), Const::Int(7), Type::I64),
            Some(Const::Int(42))
        );
        assert_eq!(
            fold_binary(BinaryOp::Shr, Const::Int(-8), Const::Int(1), Type::I64),
            Some(Const::Int(-4))
        );
    }

    #[test]
    fn test_unsafe_folds_are_refused() {
        assert_eq!(fold_binary(BinaryOp::Div, Const::Int(1), Const::Int(0), Type::I64), None);
        assert_eq!(
            fold_binary(BinaryOp::Rem, Const::Int(i64::MIN), Const::Int(-1), Type::I64),
            None
        );
        assert_eq!(fold_binary(BinaryOp::Shl, Const::Int(1), Const::Int(32), Type::I32), None);
        assert_eq!(fold_cast(Const::Float(f64::NAN), Type::I64), None);
        assert_eq!(fold_cast(Const::Float(3e9), Type::I32), None);
    }

    #[test]
    fn test_constant_function_folds_to_return() {
        let mut func = Function::new("f", Linkage::Export, vec![], Type::I64);
        let mut b = FunctionBuilder::new(&mut func);
        let two = b.iconst(Type::I64, 2);
        let three = b.iconst(Type::I64, 3);
        let sum = b.ins(InstKind::Binary(BinaryOp::Add, two, three), Type::I64);
        let ten = b.iconst(Type::I64, 10);
        let cond = b.ins(InstKind::Cmp(CmpOp::Lt, sum, ten), Type::Bool);
        let yes = b.create_block();
        let no = b.create_block();
        b.terminate(Terminator::Branch {
            cond,
            then_dest: yes,
            else_dest: no,
        });
        b.switch_to(yes);
        b.terminate(Terminator::Return(Some(sum)));
        b.switch_to(no);
        b.terminate(Terminator::Return(Some(ten)));

        let mut world = World::new("jit");
        world.add_function(func);
        opt(&mut world);
        cleanup(&mut world);

        let func = world.function(FuncId(0));
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.inst_count(), 1);
        assert_eq!(
            func.block(BlockId::ENTRY).insts[0].kind,
            InstKind::Const(Const::Int(5))
        );
    }

    #[test]
    fn test_identities_substitute_operand() {
        let mut func = Function::new("f", Linkage::Export, vec![Type::I64], Type::I64);
        let mut b = FunctionBuilder::new(&mut func);
        let x = b.block_params(BlockId::ENTRY)[0];
        let zero = b.iconst(Type::I64, 0);
        let one = b.iconst(Type::I64, 1);
        let a = b.ins(InstKind::Binary(BinaryOp::Add, x, zero), Type::I64);
        let m = b.ins(InstKind::Binary(BinaryOp::Mul, one, a), Type::I64);
        b.terminate(Terminator::Return(Some(m)));

        let mut world = World::new("jit");
        world.add_function(func);
        opt(&mut world);
        cleanup(&mut world);

        let func = world.function(FuncId(0));
        assert_eq!(func.inst_count(), 0);
        assert_eq!(func.block(BlockId::ENTRY).term, Terminator::Return(Some(x)));
    }
}
