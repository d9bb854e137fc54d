//! SSA-IR abstraction the transformation passes (D-G) operate over.
//!
//! §1 explicitly carves out "the exact bit-level layout of the compiler's
//! intermediate representation" as out of scope — the contracts in §4 are
//! specified over an SSA form, not a syntax. This module is a minimal,
//! in-memory stand-in for that SSA form: an arena of functions, each an
//! arena of basic blocks, each a flat list of instructions referencing
//! earlier results by a newtype index rather than a pointer. There is no
//! compiler-IR precedent in this crate's ancestry to imitate, so the shape
//! here follows the ordinary Rust idiom for such arenas — `Vec<T>` plus
//! small `Copy` index newtypes — rather than any one example file.

use std::collections::HashMap;
use std::fmt;

/// Index of an instruction's result within its function. Stable across
/// passes that only append instructions; passes that remove instructions
/// must renumber (none of D-G do — they replace in place or mark
/// no-instrument rather than delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// A reference to an SSA value: either a prior instruction's result, an
/// incoming function argument, a named global, or a literal constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Result(ValueId),
    Argument(u32),
    Global(String),
    Constant(Constant),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Null,
    /// All-zero aggregate initializer, e.g. `= { 0 }` or `memset`-style zero
    /// fill (§4.F: "memset for zero initializers").
    ZeroInitializer,
    Array(Vec<Constant>),
    /// A constant expression referencing another global by name — the
    /// cyclic-reference case §9 and §4.F's preparatory sub-pass exist for.
    GlobalRef(String),
    Undef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(u32),
    Ptr(Box<Type>),
    Array(Box<Type>, usize),
    Struct(String),
}

impl Type {
    pub fn ptr_to(self) -> Type {
        Type::Ptr(Box::new(self))
    }

    pub fn i8() -> Type {
        Type::Int(8)
    }

    pub fn array_len(&self) -> Option<usize> {
        match self {
            Type::Array(_, n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Ptr(inner) => write!(f, "{inner}*"),
            Type::Array(inner, n) => write!(f, "[{n} x {inner}]"),
            Type::Struct(name) => write!(f, "%{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
    Private,
    Weak,
    Common,
}

/// The callee of a [`InstructionKind::Call`]: either a direct symbol
/// reference (the common case D walks) or an indirect call through a
/// value — a loaded function pointer, the case E's trampolines exist for.
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Direct(String),
    Indirect(Value),
}

/// Per-instruction bookkeeping the passes attach rather than mutating the
/// instruction's shape — keeps D/E/F/G's rewrites additive (§4.E: "marked
/// ... so that optional whole-program analyses can recognize them").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionMeta {
    /// Set by F on any instruction that must never be visited by G
    /// (§4.F/§4.G "no-instrument marker").
    pub no_instrument: bool,
    /// Set by E on the call instruction it just tagged, recording the tag
    /// constant it assigned.
    pub tagged_allocation: Option<u16>,
    /// Set by G on the loads/stores it generates for its own tag extraction
    /// (§4.C/§4.G: "mark the generated loads and stores nosanitize").
    pub nosanitize: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    Alloca {
        ty: Type,
    },
    Load {
        pointer: Value,
        ty: Type,
    },
    Store {
        pointer: Value,
        value: Value,
    },
    /// Indexed access into an aggregate; `indices[0] == 0` for the classic
    /// fixed-array "leading zero index" GEP shape F's rewrite drops
    /// (§4.F: "skipping the leading index 0").
    GetElementPtr {
        base: Value,
        indices: Vec<Value>,
    },
    Call {
        callee: Callee,
        args: Vec<Value>,
    },
    AtomicRmw {
        pointer: Value,
        value: Value,
    },
    CmpXchg {
        pointer: Value,
        expected: Value,
        new: Value,
    },
    MaskedLoad {
        pointer: Value,
        mask: Value,
        ty: Type,
    },
    MaskedStore {
        pointer: Value,
        value: Value,
        mask: Value,
    },
    LifetimeStart {
        object: Value,
    },
    LifetimeEnd {
        object: Value,
    },
    MemIntrinsic {
        name: String,
        dest: Value,
        align: u32,
    },
    Phi {
        incoming: Vec<(BlockId, Value)>,
    },
    Select {
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },
    Return {
        value: Option<Value>,
    },
    /// Any instruction kind this crate's transformation passes don't need
    /// to understand structurally, preserved opaquely so a real IR
    /// round-trip (beyond this abstraction) wouldn't lose it.
    Opaque {
        mnemonic: String,
    },
}

impl InstructionKind {
    /// True for the load/store/RMW/cmpxchg/masked-access family §4.G calls
    /// "interesting memory accesses".
    pub fn is_memory_access(&self) -> bool {
        matches!(
            self,
            InstructionKind::Load { .. }
                | InstructionKind::Store { .. }
                | InstructionKind::AtomicRmw { .. }
                | InstructionKind::CmpXchg { .. }
                | InstructionKind::MaskedLoad { .. }
                | InstructionKind::MaskedStore { .. }
        )
    }

    pub fn is_masked(&self) -> bool {
        matches!(self, InstructionKind::MaskedLoad { .. } | InstructionKind::MaskedStore { .. })
    }

    /// The pointer operand of a memory access, if any.
    pub fn accessed_pointer(&self) -> Option<&Value> {
        match self {
            InstructionKind::Load { pointer, .. }
            | InstructionKind::Store { pointer, .. }
            | InstructionKind::AtomicRmw { pointer, .. }
            | InstructionKind::CmpXchg { pointer, .. }
            | InstructionKind::MaskedLoad { pointer, .. }
            | InstructionKind::MaskedStore { pointer, .. } => Some(pointer),
            _ => None,
        }
    }

    /// True if this instruction may itself access arbitrary memory, which
    /// invalidates per-block dedup tracking in G (§4.G: "after any call
    /// that may access memory").
    pub fn may_clobber_memory(&self) -> bool {
        matches!(self, InstructionKind::Call { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: ValueId,
    pub kind: InstructionKind,
    pub ty: Type,
    pub meta: InstructionMeta,
}

impl Instruction {
    pub fn new(id: ValueId, kind: InstructionKind, ty: Type) -> Self {
        Instruction { id, kind, ty, meta: InstructionMeta::default() }
    }
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(id: BlockId, name: impl Into<String>) -> Self {
        BasicBlock { id, name: name.into(), instructions: Vec::new() }
    }

    pub fn push(&mut self, instruction: Instruction) -> ValueId {
        let id = instruction.id;
        self.instructions.push(instruction);
        id
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub return_ty: Type,
    pub blocks: Vec<BasicBlock>,
    pub linkage: Linkage,
    /// Set on allocator shims, module constructors/destructors, and other
    /// helpers G must not instrument (§4.G: "accesses in allocator /
    /// constructor / destructor helpers").
    pub is_instrumentation_helper: bool,
    next_value_id: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<Type>, return_ty: Type) -> Self {
        Function {
            name: name.into(),
            params,
            return_ty,
            blocks: Vec::new(),
            linkage: Linkage::External,
            is_instrumentation_helper: false,
            next_value_id: 0,
        }
    }

    pub fn fresh_value_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }

    /// Bumps the fresh-id counter past `n`, for callers (the textual IR
    /// reader) that construct instructions with explicit ids rather than
    /// minting them through `fresh_value_id`.
    pub fn set_next_value_id(&mut self, n: u32) {
        self.next_value_id = self.next_value_id.max(n);
    }

    pub fn push_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, name));
        id
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn instructions_mut(&mut self) -> impl Iterator<Item = &mut Instruction> {
        self.blocks.iter_mut().flat_map(|b| b.instructions.iter_mut())
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn find_calls<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = &'a Instruction> + 'a {
        self.instructions().filter(move |inst| match &inst.kind {
            InstructionKind::Call { callee: Callee::Direct(name), .. } => name == symbol,
            _ => false,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: Type,
    pub initializer: Option<Constant>,
    pub linkage: Linkage,
    pub is_constant: bool,
}

#[derive(Debug, Clone)]
pub struct GlobalAlias {
    pub name: String,
    pub aliasee: String,
}

/// Records that struct type `type_name`'s field `element_index` is
/// initialized (somewhere in the module) to point at `function_name`. This
/// abstraction does not model per-instance aggregate field values the way
/// a real compiler IR's constant-aggregate initializers would, so struct-
/// held function pointers are tracked as this explicit fact list instead —
/// directly mirroring the tag log's own `struct,<type>,<index>,<fn>` record
/// shape (§3, §6), which is the only place this abstraction's fidelity to
/// this particular case needs to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructFieldAssignment {
    pub type_name: String,
    pub element_index: usize,
    pub function_name: String,
}

#[derive(Debug, Clone)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<Type>,
}

impl StructType {
    /// Converts a byte offset into the field index, recursing through
    /// nested structs (§4.D: "converting byte offsets to element indices by
    /// walking the struct layout, recursing through nested structs").
    /// Field sizes are approximated at one machine word per scalar and the
    /// element count for arrays — sufficient for this abstraction, which
    /// never lays out real memory for struct-typed globals.
    pub fn field_index_at_byte_offset(&self, registry: &StructRegistry, mut byte_offset: usize) -> Option<usize> {
        const WORD: usize = 8;
        for (index, field) in self.fields.iter().enumerate() {
            let field_size = registry.size_of(field).unwrap_or(WORD);
            if byte_offset < field_size {
                return Some(index);
            }
            byte_offset -= field_size;
        }
        None
    }
}

/// Lookup table of named struct layouts, used for the offset-to-index walk
/// above. Kept separate from `Module` so passes can build a scratch
/// registry without borrowing the whole module mutably.
#[derive(Debug, Clone, Default)]
pub struct StructRegistry {
    structs: HashMap<String, StructType>,
}

impl StructRegistry {
    pub fn from_module(module: &Module) -> Self {
        let mut structs = HashMap::new();
        for s in &module.structs {
            structs.insert(s.name.clone(), s.clone());
        }
        StructRegistry { structs }
    }

    pub fn get(&self, name: &str) -> Option<&StructType> {
        self.structs.get(name)
    }

    /// Size in bytes of `ty`, used by heapification to size its `malloc`
    /// calls as `N * sizeof(elem)` rather than assuming a fixed word size.
    pub fn size_of(&self, ty: &Type) -> Option<usize> {
        match ty {
            Type::Int(bits) => Some((*bits as usize).div_ceil(8)),
            Type::Ptr(_) => Some(8),
            Type::Array(elem, n) => Some(self.size_of(elem)? * n),
            Type::Struct(name) => {
                let s = self.structs.get(name)?;
                s.fields.iter().map(|f| self.size_of(f)).sum()
            }
            Type::Void => Some(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVariable>,
    pub aliases: Vec<GlobalAlias>,
    pub structs: Vec<StructType>,
    pub struct_field_assignments: Vec<StructFieldAssignment>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module { name: name.into(), ..Default::default() }
    }

    pub fn add_function(&mut self, function: Function) -> &mut Function {
        self.functions.push(function);
        self.functions.last_mut().unwrap()
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalVariable> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// All direct call sites to `symbol`, across every function, paired
    /// with the name of the function containing them — the shape D's walk
    /// needs (§4.D step 2's "directly called" case is a no-op, but E's
    /// rewrite needs exactly this list).
    pub fn find_direct_calls<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = (&'a str, &'a Instruction)> + 'a {
        self.functions
            .iter()
            .flat_map(move |f| f.find_calls(symbol).map(move |inst| (f.name.as_str(), inst)))
    }
}
