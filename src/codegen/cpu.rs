// This module lowers an IR World into an LLVM module with inkwell. All functions are declared
// first so calls can reference functions defined later in the World. Bodies are then emitted
// block by block in reverse postorder, which guarantees every value is defined before any use
// outside block parameters. Block parameters become phi nodes created at the head of each block
// before its instructions are emitted; jump arguments are added as incoming values when the
// predecessor's terminator is lowered. Exported functions get external linkage with the C
// calling convention, internal ones private linkage, and imports are bare declarations that
// the engine resolves against the process symbol table. The module is verified after lowering
// and the new pass manager pipeline of the requested OptLevel runs on it.

//! World to LLVM lowering.

use super::{host_target_machine, OptLevel};
use crate::core::JitError;
use crate::ir::{
    self, BinaryOp, BlockId, CmpOp, Const, Function, InstKind, Linkage, Terminator, UnaryOp,
    World,
};
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::module::{self, Module};
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{FileType, TargetMachine};
use inkwell::types::{BasicMetadataTypeEnum, BasicTypeEnum, FunctionType};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValueEnum, FunctionValue, IntValue, PhiValue,
};
use inkwell::{FloatPredicate, IntPredicate};

/// LLVM code generator for the host.
pub struct CpuCodeGen<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
    target_machine: TargetMachine,
    opt: OptLevel,
    debug: bool,
}

impl<'ctx> CpuCodeGen<'ctx> {
    pub fn new(
        context: &'ctx Context,
        module_name: &str,
        opt: OptLevel,
        debug: bool,
    ) -> Result<Self, JitError> {
        let target_machine = host_target_machine(opt)?;
        let module = context.create_module(module_name);
        module.set_triple(&target_machine.get_triple());
        module.set_data_layout(&target_machine.get_target_data().get_data_layout());

        Ok(Self {
            context,
            module,
            builder: context.create_builder(),
            target_machine,
            opt,
            debug,
        })
    }

    /// Lower every function of `world`, verify and optimize the result.
    pub fn compile(&mut self, world: &World) -> Result<(), JitError> {
        let decls = world
            .functions
            .iter()
            .map(|f| self.declare(f))
            .collect::<Vec<_>>();

        for (func, &value) in world.functions.iter().zip(&decls) {
            if !func.is_declaration() {
                FnLowering::new(self, &decls, func, value).lower()?;
            }
        }

        if self.debug {
            log::debug!("LLVM IR before passes:\n{}", self.module.print_to_string());
        }
        self.module
            .verify()
            .map_err(|e| JitError::codegen(format!("module verification failed: {}", e)))?;

        if let Some(pipeline) = self.opt.pipeline() {
            self.module
                .run_passes(pipeline, &self.target_machine, PassBuilderOptions::create())
                .map_err(|e| JitError::codegen(format!("{} pipeline failed: {}", pipeline, e)))?;
        }
        log::trace!("LLVM IR:\n{}", self.module.print_to_string());
        Ok(())
    }

    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    pub fn into_module(self) -> Module<'ctx> {
        self.module
    }

    /// Exported function `name`, if the module defines one.
    pub fn lookup(&self, name: &str) -> Option<FunctionValue<'ctx>> {
        self.module
            .get_function(name)
            .filter(|f| f.count_basic_blocks() > 0 && f.get_linkage() == module::Linkage::External)
    }

    /// Names of declared-but-undefined functions, excluding LLVM intrinsics.
    pub fn external_symbols(&self) -> Vec<String> {
        self.module
            .get_functions()
            .filter(|f| f.count_basic_blocks() == 0)
            .filter_map(|f| f.get_name().to_str().ok().map(str::to_string))
            .filter(|name| !name.starts_with("llvm."))
            .collect()
    }

    /// Write the module as a relocatable object.
    pub fn emit_object(&self) -> Result<MemoryBuffer, JitError> {
        self.target_machine
            .write_to_memory_buffer(&self.module, FileType::Object)
            .map_err(|e| JitError::ObjectEmission {
                reason: e.to_string(),
            })
    }

    fn basic_type(&self, ty: ir::Type) -> Option<BasicTypeEnum<'ctx>> {
        Some(match ty {
            ir::Type::Bool => self.context.bool_type().into(),
            ir::Type::I32 => self.context.i32_type().into(),
            ir::Type::I64 => self.context.i64_type().into(),
            ir::Type::F64 => self.context.f64_type().into(),
            ir::Type::Ptr => self.context.ptr_type(Default::default()).into(),
            ir::Type::Unit => return None,
        })
    }

    fn fn_type(&self, func: &Function) -> FunctionType<'ctx> {
        let params = func
            .params
            .iter()
            .filter_map(|&ty| self.basic_type(ty))
            .map(BasicMetadataTypeEnum::from)
            .collect::<Vec<_>>();
        match self.basic_type(func.ret) {
            Some(ret) => ret.fn_type(&params, false),
            None => self.context.void_type().fn_type(&params, false),
        }
    }

    fn declare(&self, func: &Function) -> FunctionValue<'ctx> {
        let linkage = match func.linkage {
            Linkage::Export | Linkage::Import => module::Linkage::External,
            Linkage::Internal => module::Linkage::Private,
        };
        self.module
            .add_function(&func.name, self.fn_type(func), Some(linkage))
    }
}

/// State for lowering one function body.
struct FnLowering<'g, 'ctx> {
    gen: &'g CpuCodeGen<'ctx>,
    decls: &'g [FunctionValue<'ctx>],
    func: &'g Function,
    value: FunctionValue<'ctx>,
    blocks: Vec<Option<BasicBlock<'ctx>>>,
    phis: Vec<Vec<PhiValue<'ctx>>>,
    values: Vec<Option<BasicValueEnum<'ctx>>>,
}

impl<'g, 'ctx> FnLowering<'g, 'ctx> {
    fn new(
        gen: &'g CpuCodeGen<'ctx>,
        decls: &'g [FunctionValue<'ctx>],
        func: &'g Function,
        value: FunctionValue<'ctx>,
    ) -> Self {
        Self {
            gen,
            decls,
            func,
            value,
            blocks: vec![None; func.blocks.len()],
            phis: vec![Vec::new(); func.blocks.len()],
            values: vec![None; func.value_types.len()],
        }
    }

    fn lower(mut self) -> Result<(), JitError> {
        let func = self.func;
        let order = reverse_postorder(func);
        let ctx = self.gen.context;

        for &block in &order {
            self.blocks[block.index()] =
                Some(ctx.append_basic_block(self.value, &format!("bb{}", block.0)));
        }

        // Entry parameters are the function parameters, the rest become phis.
        let entry = func.block(BlockId::ENTRY);
        for (i, &param) in entry.params.iter().enumerate() {
            let arg = self
                .value
                .get_nth_param(i as u32)
                .ok_or_else(|| JitError::codegen(format!("missing parameter {}", i)))?;
            self.values[param.index()] = Some(arg);
        }
        for &block in order.iter().filter(|&&b| b != BlockId::ENTRY) {
            self.gen.builder.position_at_end(self.llvm_block(block)?);
            for &param in &func.block(block).params {
                let ty = self.value_type(param)?;
                let phi = self.gen.builder.build_phi(ty, "")?;
                self.values[param.index()] = Some(phi.as_basic_value());
                self.phis[block.index()].push(phi);
            }
        }

        for &block in &order {
            self.gen.builder.position_at_end(self.llvm_block(block)?);
            let data = func.block(block);
            for inst in &data.insts {
                let result = self.inst(&inst.kind, inst.result)?;
                if let (Some(value), Some(result)) = (inst.result, result) {
                    self.values[value.index()] = Some(result);
                }
            }
            self.terminator(block, &data.term)?;
        }
        Ok(())
    }

    fn llvm_block(&self, block: BlockId) -> Result<BasicBlock<'ctx>, JitError> {
        self.blocks[block.index()]
            .ok_or_else(|| JitError::codegen(format!("jump to unreachable block bb{}", block.0)))
    }

    fn value_type(&self, value: ir::Value) -> Result<BasicTypeEnum<'ctx>, JitError> {
        self.gen
            .basic_type(self.func.value_type(value))
            .ok_or_else(|| JitError::codegen(format!("{} has unit type", value)))
    }

    fn get(&self, value: ir::Value) -> Result<BasicValueEnum<'ctx>, JitError> {
        self.values[value.index()]
            .ok_or_else(|| JitError::codegen(format!("{} used before definition", value)))
    }

    fn int(&self, value: ir::Value) -> Result<IntValue<'ctx>, JitError> {
        Ok(self.get(value)?.into_int_value())
    }

    fn inst(
        &self,
        kind: &InstKind,
        result: Option<ir::Value>,
    ) -> Result<Option<BasicValueEnum<'ctx>>, JitError> {
        let b = &self.gen.builder;
        let ty = result.map(|r| self.func.value_type(r));

        let value: BasicValueEnum<'ctx> = match kind {
            InstKind::Const(c) => {
                let ty = result
                    .map(|r| self.value_type(r))
                    .transpose()?
                    .ok_or_else(|| JitError::codegen("constant without result"))?;
                match (*c, ty) {
                    (Const::Int(v), BasicTypeEnum::IntType(t)) => {
                        t.const_int(v as u64, true).into()
                    }
                    (Const::Bool(v), BasicTypeEnum::IntType(t)) => {
                        t.const_int(u64::from(v), false).into()
                    }
                    (Const::Float(v), BasicTypeEnum::FloatType(t)) => t.const_float(v).into(),
                    (c, ty) => {
                        return Err(JitError::codegen(format!("constant {} as {:?}", c, ty)))
                    }
                }
            }
            InstKind::Unary(op, a) => {
                // codegen_prepare rewrites these, but lowering them is trivial.
                let a = self.get(*a)?;
                match (op, a) {
                    (UnaryOp::Neg, BasicValueEnum::FloatValue(f)) => {
                        b.build_float_neg(f, "")?.into()
                    }
                    (UnaryOp::Neg, BasicValueEnum::IntValue(i)) => b.build_int_neg(i, "")?.into(),
                    (UnaryOp::Not, BasicValueEnum::IntValue(i)) => b.build_not(i, "")?.into(),
                    _ => return Err(JitError::codegen(format!("invalid operand for {:?}", op))),
                }
            }
            InstKind::Binary(op, l, r) => self.binary(*op, *l, *r)?,
            InstKind::Cmp(op, l, r) => self.compare(*op, *l, *r)?,
            InstKind::Cast(a) => {
                let to = ty.ok_or_else(|| JitError::codegen("cast without result"))?;
                self.cast(*a, to)?
            }
            InstKind::Call(callee, args) => {
                let args = args
                    .iter()
                    .map(|&a| self.get(a).map(BasicMetadataValueEnum::from))
                    .collect::<Result<Vec<_>, _>>()?;
                let call = b.build_call(self.decls[callee.index()], &args, "")?;
                return Ok(call.try_as_basic_value().left());
            }
            InstKind::Alloca(slot) => {
                let slot = self
                    .gen
                    .basic_type(*slot)
                    .ok_or_else(|| JitError::codegen("unit-typed stack slot"))?;
                b.build_alloca(slot, "")?.into()
            }
            InstKind::Load(ptr) => {
                let ty = result
                    .map(|r| self.value_type(r))
                    .transpose()?
                    .ok_or_else(|| JitError::codegen("load without result"))?;
                let ptr = self.get(*ptr)?.into_pointer_value();
                b.build_load(ty, ptr, "")?
            }
            InstKind::Store { ptr, value } => {
                let ptr = self.get(*ptr)?.into_pointer_value();
                b.build_store(ptr, self.get(*value)?)?;
                return Ok(None);
            }
        };
        Ok(Some(value))
    }

    fn binary(
        &self,
        op: BinaryOp,
        l: ir::Value,
        r: ir::Value,
    ) -> Result<BasicValueEnum<'ctx>, JitError> {
        let b = &self.gen.builder;
        let (l, r) = (self.get(l)?, self.get(r)?);

        if let (BasicValueEnum::FloatValue(l), BasicValueEnum::FloatValue(r)) = (l, r) {
            return Ok(match op {
                BinaryOp::Add => b.build_float_add(l, r, "")?,
                BinaryOp::Sub => b.build_float_sub(l, r, "")?,
                BinaryOp::Mul => b.build_float_mul(l, r, "")?,
                BinaryOp::Div => b.build_float_div(l, r, "")?,
                BinaryOp::Rem => b.build_float_rem(l, r, "")?,
                _ => return Err(JitError::codegen(format!("{:?} on f64", op))),
            }
            .into());
        }

        let (l, r) = (l.into_int_value(), r.into_int_value());
        Ok(match op {
            BinaryOp::Add => b.build_int_add(l, r, "")?,
            BinaryOp::Sub => b.build_int_sub(l, r, "")?,
            BinaryOp::Mul => b.build_int_mul(l, r, "")?,
            BinaryOp::Div => b.build_int_signed_div(l, r, "")?,
            BinaryOp::Rem => b.build_int_signed_rem(l, r, "")?,
            BinaryOp::And => b.build_and(l, r, "")?,
            BinaryOp::Or => b.build_or(l, r, "")?,
            BinaryOp::Xor => b.build_xor(l, r, "")?,
            BinaryOp::Shl => b.build_left_shift(l, r, "")?,
            BinaryOp::Shr => b.build_right_shift(l, r, true, "")?,
        }
        .into())
    }

    fn compare(
        &self,
        op: CmpOp,
        l: ir::Value,
        r: ir::Value,
    ) -> Result<BasicValueEnum<'ctx>, JitError> {
        let b = &self.gen.builder;
        let ty = self.func.value_type(l);
        let (l, r) = (self.get(l)?, self.get(r)?);

        if ty == ir::Type::F64 {
            let pred = match op {
                CmpOp::Eq => FloatPredicate::OEQ,
                // NaN compares unequal to everything.
                CmpOp::Ne => FloatPredicate::UNE,
                CmpOp::Lt => FloatPredicate::OLT,
                CmpOp::Le => FloatPredicate::OLE,
                CmpOp::Gt => FloatPredicate::OGT,
                CmpOp::Ge => FloatPredicate::OGE,
            };
            let cmp = b.build_float_compare(pred, l.into_float_value(), r.into_float_value(), "")?;
            return Ok(cmp.into());
        }

        // Booleans order false < true.
        let signed = ty != ir::Type::Bool;
        let pred = match (op, signed) {
            (CmpOp::Eq, _) => IntPredicate::EQ,
            (CmpOp::Ne, _) => IntPredicate::NE,
            (CmpOp::Lt, true) => IntPredicate::SLT,
            (CmpOp::Le, true) => IntPredicate::SLE,
            (CmpOp::Gt, true) => IntPredicate::SGT,
            (CmpOp::Ge, true) => IntPredicate::SGE,
            (CmpOp::Lt, false) => IntPredicate::ULT,
            (CmpOp::Le, false) => IntPredicate::ULE,
            (CmpOp::Gt, false) => IntPredicate::UGT,
            (CmpOp::Ge, false) => IntPredicate::UGE,
        };
        Ok(b.build_int_compare(pred, l.into_int_value(), r.into_int_value(), "")?
            .into())
    }

    fn cast(&self, value: ir::Value, to: ir::Type) -> Result<BasicValueEnum<'ctx>, JitError> {
        let b = &self.gen.builder;
        let ctx = self.gen.context;
        let from = self.func.value_type(value);
        let v = self.get(value)?;

        let int_type = |ty: ir::Type| match ty {
            ir::Type::I32 => Some(ctx.i32_type()),
            ir::Type::I64 => Some(ctx.i64_type()),
            _ => None,
        };

        Ok(match (from, to) {
            _ if from == to => v,
            (ir::Type::Bool, _) if to.is_integer() => {
                let t = int_type(to).ok_or_else(|| JitError::codegen("bool cast"))?;
                b.build_int_z_extend(v.into_int_value(), t, "")?.into()
            }
            (ir::Type::I32, ir::Type::I64) => b
                .build_int_s_extend(v.into_int_value(), ctx.i64_type(), "")?
                .into(),
            (ir::Type::I64, ir::Type::I32) => b
                .build_int_truncate(v.into_int_value(), ctx.i32_type(), "")?
                .into(),
            (ir::Type::I32 | ir::Type::I64, ir::Type::F64) => b
                .build_signed_int_to_float(v.into_int_value(), ctx.f64_type(), "")?
                .into(),
            (ir::Type::F64, ir::Type::I32 | ir::Type::I64) => {
                let t = int_type(to).ok_or_else(|| JitError::codegen("float cast"))?;
                b.build_float_to_signed_int(v.into_float_value(), t, "")?
                    .into()
            }
            _ => return Err(JitError::codegen(format!("invalid cast {} as {}", from, to))),
        })
    }

    fn terminator(&self, block: BlockId, term: &Terminator) -> Result<(), JitError> {
        let b = &self.gen.builder;
        match term {
            Terminator::Return(None) => {
                b.build_return(None)?;
            }
            Terminator::Return(Some(value)) => {
                let value = self.get(*value)?;
                b.build_return(Some(&value))?;
            }
            Terminator::Jump(dest, args) => {
                let from = self.llvm_block(block)?;
                for (phi, &arg) in self.phis[dest.index()].iter().zip(args) {
                    phi.add_incoming(&[(&self.get(arg)?, from)]);
                }
                b.build_unconditional_branch(self.llvm_block(*dest)?)?;
            }
            Terminator::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                b.build_conditional_branch(
                    self.int(*cond)?,
                    self.llvm_block(*then_dest)?,
                    self.llvm_block(*else_dest)?,
                )?;
            }
            Terminator::Unreachable => {
                b.build_unreachable()?;
            }
        }
        Ok(())
    }
}

/// Blocks reachable from the entry, in reverse postorder.
fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let mut visited = vec![false; func.blocks.len()];
    let mut post = Vec::with_capacity(func.blocks.len());
    // (block, next successor index)
    let mut stack = vec![(BlockId::ENTRY, 0usize)];
    visited[BlockId::ENTRY.index()] = true;

    while let Some((block, next)) = stack.pop() {
        let succs = func.block(block).term.successors();
        if let Some(&succ) = succs.get(next) {
            stack.push((block, next + 1));
            if !visited[succ.index()] {
                visited[succ.index()] = true;
                stack.push((succ, 0));
            }
        } else {
            post.push(block);
        }
    }

    post.reverse();
    post
}
