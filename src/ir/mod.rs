// This module defines the intermediate representation the JIT pipeline optimizes before handing
// code to LLVM. A World holds the functions of one compile; it is created empty for each
// compile and dropped with it, so no IR state survives between calls. Functions are in
// block-parameter SSA form: every value is defined exactly once, either as a block parameter
// or as the result of an instruction, and control-flow merges pass values as jump arguments
// instead of phi nodes. The entry block's parameters are the function parameters. Mutable
// source variables live in stack slots created by Alloca instructions, which the emitter
// always places in the entry block. Submodules implement emission from the checked AST, the
// cleanup/opt/codegen_prepare passes and a textual printer.

//! Block-parameter SSA intermediate representation.

pub mod cleanup;
pub mod emit;
pub mod opt;
pub mod prepare;
pub mod print;

pub use cleanup::cleanup;
pub use emit::emit_module;
pub use opt::opt;
pub use prepare::codegen_prepare;

/// IR value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    I32,
    I64,
    F64,
    /// Address of a stack slot.
    Ptr,
    Unit,
}

impl Type {
    pub fn is_integer(self) -> bool {
        matches!(self, Type::I32 | Type::I64)
    }

    pub fn is_float(self) -> bool {
        self == Type::F64
    }

    /// Bit width of integer types.
    pub fn int_width(self) -> Option<u32> {
        match self {
            Type::I32 => Some(32),
            Type::I64 => Some(64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Value {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Visible to the JIT loader under its own name.
    Export,
    /// Only callable from within the world.
    Internal,
    /// Declared here, defined by the host process.
    Import,
}

/// Constant payload. Integers are stored sign-extended from their type width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Const(Const),
    Unary(UnaryOp, Value),
    Binary(BinaryOp, Value, Value),
    Cmp(CmpOp, Value, Value),
    /// Convert to the result type.
    Cast(Value),
    Call(FuncId, Vec<Value>),
    /// Stack slot holding one value of the given type.
    Alloca(Type),
    Load(Value),
    Store { ptr: Value, value: Value },
}

impl InstKind {
    /// Whether removing an unused instance changes behaviour.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, InstKind::Call(..) | InstKind::Store { .. })
    }

    /// Values read by the instruction.
    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstKind::Const(_) | InstKind::Alloca(_) => Vec::new(),
            InstKind::Unary(_, v) | InstKind::Cast(v) | InstKind::Load(v) => vec![*v],
            InstKind::Binary(_, a, b) | InstKind::Cmp(_, a, b) => vec![*a, *b],
            InstKind::Call(_, args) => args.clone(),
            InstKind::Store { ptr, value } => vec![*ptr, *value],
        }
    }

    /// Rewrite every operand through `f`.
    pub fn map_operands(&mut self, mut f: impl FnMut(Value) -> Value) {
        match self {
            InstKind::Const(_) | InstKind::Alloca(_) => {}
            InstKind::Unary(_, v) | InstKind::Cast(v) | InstKind::Load(v) => *v = f(*v),
            InstKind::Binary(_, a, b) | InstKind::Cmp(_, a, b) => {
                *a = f(*a);
                *b = f(*b);
            }
            InstKind::Call(_, args) => {
                for arg in args {
                    *arg = f(*arg);
                }
            }
            InstKind::Store { ptr, value } => {
                *ptr = f(*ptr);
                *value = f(*value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub result: Option<Value>,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Return(Option<Value>),
    Jump(BlockId, Vec<Value>),
    Branch {
        cond: Value,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(dest, _) => vec![*dest],
            Terminator::Branch {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Terminator::Return(v) => v.iter().copied().collect(),
            Terminator::Jump(_, args) => args.clone(),
            Terminator::Branch { cond, .. } => vec![*cond],
            Terminator::Unreachable => Vec::new(),
        }
    }

    pub fn map_operands(&mut self, mut f: impl FnMut(Value) -> Value) {
        match self {
            Terminator::Return(Some(v)) => *v = f(*v),
            Terminator::Jump(_, args) => {
                for arg in args {
                    *arg = f(*arg);
                }
            }
            Terminator::Branch { cond, .. } => *cond = f(*cond),
            Terminator::Return(None) | Terminator::Unreachable => {}
        }
    }

    pub fn map_blocks(&mut self, mut f: impl FnMut(BlockId) -> BlockId) {
        match self {
            Terminator::Jump(dest, _) => *dest = f(*dest),
            Terminator::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                *then_dest = f(*then_dest);
                *else_dest = f(*else_dest);
            }
            Terminator::Return(_) | Terminator::Unreachable => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub params: Vec<Value>,
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

impl BasicBlock {
    fn new() -> Self {
        Self {
            params: Vec::new(),
            insts: Vec::new(),
            term: Terminator::Unreachable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub params: Vec<Type>,
    pub ret: Type,
    /// Empty for imports. Block 0 is the entry.
    pub blocks: Vec<BasicBlock>,
    /// Type of every value, indexed by `Value`.
    pub value_types: Vec<Type>,
}

impl Function {
    pub fn new(name: impl Into<String>, linkage: Linkage, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.into(),
            linkage,
            params,
            ret,
            blocks: Vec::new(),
            value_types: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.linkage == Linkage::Import
    }

    pub fn new_value(&mut self, ty: Type) -> Value {
        let value = Value(self.value_types.len() as u32);
        self.value_types.push(ty);
        value
    }

    pub fn value_type(&self, value: Value) -> Type {
        self.value_types[value.index()]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }
}

/// All IR of one compile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct World {
    pub name: String,
    pub functions: Vec<Function>,
}

impl World {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn find(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// Names of exported functions, in definition order.
    pub fn exports(&self) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|f| f.linkage == Linkage::Export)
            .map(|f| f.name.as_str())
            .collect()
    }

    pub fn imports(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|f| f.is_declaration())
    }

    pub fn inst_count(&self) -> usize {
        self.functions.iter().map(Function::inst_count).sum()
    }
}

/// Incremental construction of a function body.
pub struct FunctionBuilder<'f> {
    func: &'f mut Function,
    current: BlockId,
    terminated: Vec<bool>,
}

impl<'f> FunctionBuilder<'f> {
    /// Start building `func`: creates the entry block with one parameter per
    /// function parameter.
    pub fn new(func: &'f mut Function) -> Self {
        func.blocks.clear();
        func.value_types.clear();
        let mut builder = Self {
            func,
            current: BlockId::ENTRY,
            terminated: Vec::new(),
        };
        let entry = builder.create_block();
        for ty in builder.func.params.clone() {
            builder.add_block_param(entry, ty);
        }
        builder
    }

    pub fn function(&self) -> &Function {
        self.func
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(BasicBlock::new());
        self.terminated.push(false);
        id
    }

    pub fn add_block_param(&mut self, block: BlockId, ty: Type) -> Value {
        let value = self.func.new_value(ty);
        self.func.block_mut(block).params.push(value);
        value
    }

    pub fn block_params(&self, block: BlockId) -> &[Value] {
        &self.func.block(block).params
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated[self.current.index()]
    }

    /// Append an instruction producing a value of type `ty`.
    pub fn ins(&mut self, kind: InstKind, ty: Type) -> Value {
        let value = self.func.new_value(ty);
        self.push(Inst {
            result: Some(value),
            kind,
        });
        value
    }

    /// Append an instruction whose result (if any) is discarded.
    pub fn ins_void(&mut self, kind: InstKind) {
        self.push(Inst { result: None, kind });
    }

    /// Create a stack slot in the entry block.
    pub fn alloca(&mut self, ty: Type) -> Value {
        let value = self.func.new_value(Type::Ptr);
        let entry = self.func.block_mut(BlockId::ENTRY);
        let at = entry
            .insts
            .iter()
            .take_while(|i| matches!(i.kind, InstKind::Alloca(_)))
            .count();
        entry.insts.insert(
            at,
            Inst {
                result: Some(value),
                kind: InstKind::Alloca(ty),
            },
        );
        value
    }

    pub fn iconst(&mut self, ty: Type, value: i64) -> Value {
        self.ins(InstKind::Const(Const::Int(value)), ty)
    }

    pub fn terminate(&mut self, term: Terminator) {
        if self.is_terminated() {
            return;
        }
        self.func.block_mut(self.current).term = term;
        self.terminated[self.current.index()] = true;
    }

    fn push(&mut self, inst: Inst) {
        let current = self.current;
        self.func.block_mut(current).insts.push(inst);
    }
}
