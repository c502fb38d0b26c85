//! Textual form of the IR, used by debug logging and `hetrt compile --emit ir`.

use super::*;
use std::fmt;

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Type::Bool => "bool",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F64 => "f64",
            Type::Ptr => "ptr",
            Type::Unit => "()",
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(v) => write!(f, "{}", v),
            Const::Float(v) => write!(f, "{:?}", v),
            Const::Bool(v) => write!(f, "{}", v),
        }
    }
}

fn join(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn binary_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Rem => "rem",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
    }
}

fn cmp_name(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "eq",
        CmpOp::Ne => "ne",
        CmpOp::Lt => "lt",
        CmpOp::Le => "le",
        CmpOp::Gt => "gt",
        CmpOp::Ge => "ge",
    }
}

impl World {
    fn fmt_inst(&self, func: &Function, inst: &Inst, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "    ")?;
        if let Some(result) = inst.result {
            write!(f, "{} = ", result)?;
        }
        let ty = inst.result.map_or(Type::Unit, |r| func.value_type(r));
        match &inst.kind {
            InstKind::Const(c) => write!(f, "const {} {}", ty, c),
            InstKind::Unary(UnaryOp::Neg, v) => write!(f, "neg {} {}", ty, v),
            InstKind::Unary(UnaryOp::Not, v) => write!(f, "not {} {}", ty, v),
            InstKind::Binary(op, a, b) => write!(f, "{} {} {}, {}", binary_name(*op), ty, a, b),
            InstKind::Cmp(op, a, b) => write!(
                f,
                "cmp {} {} {}, {}",
                cmp_name(*op),
                func.value_type(*a),
                a,
                b
            ),
            InstKind::Cast(v) => write!(f, "cast {} {} to {}", func.value_type(*v), v, ty),
            InstKind::Call(callee, args) => {
                let name = self
                    .functions
                    .get(callee.index())
                    .map_or("?", |c| c.name.as_str());
                write!(f, "call @{}({})", name, join(args))
            }
            InstKind::Alloca(slot) => write!(f, "alloca {}", slot),
            InstKind::Load(ptr) => write!(f, "load {} {}", ty, ptr),
            InstKind::Store { ptr, value } => write!(f, "store {}, {}", value, ptr),
        }?;
        writeln!(f)
    }
}

impl fmt::Display for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;

        for func in &self.functions {
            writeln!(f)?;
            let linkage = match func.linkage {
                Linkage::Export => "export",
                Linkage::Internal => "internal",
                Linkage::Import => "import",
            };
            let params = func
                .params
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "{} fn @{}({}) -> {}", linkage, func.name, params, func.ret)?;

            if func.is_declaration() {
                writeln!(f)?;
                continue;
            }
            writeln!(f, " {{")?;

            for (index, block) in func.blocks.iter().enumerate() {
                let params = block
                    .params
                    .iter()
                    .map(|p| format!("{}: {}", p, func.value_type(*p)))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(f, "{}({}):", BlockId(index as u32), params)?;

                for inst in &block.insts {
                    self.fmt_inst(func, inst, f)?;
                }

                match &block.term {
                    Terminator::Return(None) => writeln!(f, "    ret")?,
                    Terminator::Return(Some(v)) => writeln!(f, "    ret {}", v)?,
                    Terminator::Jump(dest, args) => {
                        writeln!(f, "    jump {}({})", dest, join(args))?
                    }
                    Terminator::Branch {
                        cond,
                        then_dest,
                        else_dest,
                    } => writeln!(f, "    br {}, {}, {}", cond, then_dest, else_dest)?,
                    Terminator::Unreachable => writeln!(f, "    unreachable")?,
                }
            }
            writeln!(f, "}}")?;
        }

        Ok(())
    }
}
