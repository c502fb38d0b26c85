//! Last IR rewrite before code generation.
//!
//! The code generator only handles binary arithmetic, so unary operators are
//! expressed through it here: `-x` becomes `0 - x` (`-0.0 - x` for floats) and
//! `!x` becomes `x ^ true` or `x ^ -1`. Casts to the operand's own type are
//! dropped.

use super::*;
use hashbrown::HashMap;

pub fn codegen_prepare(world: &mut World) {
    let mut lowered = 0;
    for func in world.functions.iter_mut().filter(|f| !f.is_declaration()) {
        lowered += prepare_function(func);
    }
    log::debug!("codegen_prepare: lowered {} instruction(s)", lowered);
}

fn prepare_function(func: &mut Function) -> usize {
    let mut subst: HashMap<Value, Value> = HashMap::new();
    let mut lowered = 0;

    for block_index in 0..func.blocks.len() {
        let insts = std::mem::take(&mut func.blocks[block_index].insts);
        let mut out = Vec::with_capacity(insts.len());

        for mut inst in insts {
            inst.kind
                .map_operands(|v| subst.get(&v).copied().unwrap_or(v));

            let Some(result) = inst.result else {
                out.push(inst);
                continue;
            };
            let ty = func.value_type(result);

            match inst.kind {
                InstKind::Unary(op, operand) => {
                    let (identity, binop) = match (op, ty) {
                        (UnaryOp::Neg, Type::F64) => (Const::Float(-0.0), BinaryOp::Sub),
                        (UnaryOp::Neg, _) => (Const::Int(0), BinaryOp::Sub),
                        (UnaryOp::Not, Type::Bool) => (Const::Bool(true), BinaryOp::Xor),
                        (UnaryOp::Not, _) => (Const::Int(-1), BinaryOp::Xor),
                    };
                    let c = func.new_value(ty);
                    out.push(Inst {
                        result: Some(c),
                        kind: InstKind::Const(identity),
                    });
                    let kind = match binop {
                        BinaryOp::Sub => InstKind::Binary(binop, c, operand),
                        _ => InstKind::Binary(binop, operand, c),
                    };
                    out.push(Inst {
                        result: Some(result),
                        kind,
                    });
                    lowered += 1;
                }
                InstKind::Cast(operand) if func.value_type(operand) == ty => {
                    subst.insert(result, operand);
                    lowered += 1;
                }
                _ => out.push(inst),
            }
        }

        func.blocks[block_index].insts = out;
    }

    if !subst.is_empty() {
        let resolve = |v: Value| subst.get(&v).copied().unwrap_or(v);
        for block in &mut func.blocks {
            for inst in &mut block.insts {
                inst.kind.map_operands(resolve);
            }
            block.term.map_operands(resolve);
        }
    }

    lowered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_ops_become_binary() {
        let mut func = Function::new("f", Linkage::Export, vec![Type::I64, Type::Bool], Type::I64);
        let mut b = FunctionBuilder::new(&mut func);
        let params = b.block_params(BlockId::ENTRY).to_vec();
        let neg = b.ins(InstKind::Unary(UnaryOp::Neg, params[0]), Type::I64);
        let _not = b.ins(InstKind::Unary(UnaryOp::Not, params[1]), Type::Bool);
        b.terminate(Terminator::Return(Some(neg)));

        let mut world = World::new("jit");
        world.add_function(func);
        codegen_prepare(&mut world);

        let insts = &world.function(FuncId(0)).block(BlockId::ENTRY).insts;
        assert_eq!(insts.len(), 4);
        assert_eq!(insts[0].kind, InstKind::Const(Const::Int(0)));
        assert!(matches!(insts[1].kind, InstKind::Binary(BinaryOp::Sub, _, x) if x == params[0]));
        assert_eq!(insts[2].kind, InstKind::Const(Const::Bool(true)));
        assert!(matches!(insts[3].kind, InstKind::Binary(BinaryOp::Xor, x, _) if x == params[1]));
        assert!(world
            .functions
            .iter()
            .flat_map(|f| &f.blocks)
            .flat_map(|b| &b.insts)
            .all(|i| !matches!(i.kind, InstKind::Unary(..))));
    }

    #[test]
    fn test_identity_casts_removed() {
        let mut func = Function::new("f", Linkage::Export, vec![Type::I32], Type::I32);
        let mut b = FunctionBuilder::new(&mut func);
        let x = b.block_params(BlockId::ENTRY)[0];
        let same = b.ins(InstKind::Cast(x), Type::I32);
        b.terminate(Terminator::Return(Some(same)));

        let mut world = World::new("jit");
        world.add_function(func);
        codegen_prepare(&mut world);

        let func = world.function(FuncId(0));
        assert_eq!(func.inst_count(), 0);
        assert_eq!(func.block(BlockId::ENTRY).term, Terminator::Return(Some(x)));
    }
}
