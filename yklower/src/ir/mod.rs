//! The lowering IR.
//!
//! A [Func] owns everything about one function being compiled: an arena of [Instr]s, its symbols,
//! bailout descriptors, exception regions and loops. The same IR is used on both sides of
//! lowering: before lowering, instructions use high-level opcodes (`Add`, `CallI`, `TryCatch`,
//! ...); after lowering, only machine-dependent opcodes (`MOV`, `ADD`, `JO`, `LDR`, ...) remain.
//!
//!
//! ## Instruction list
//!
//! Instructions are allocated in an arena and referenced by [InstrIdx]. An instruction's index
//! never changes: the program order is instead defined by explicit `prev`/`next` links, starting
//! at [Func::head] (always a `FunctionEntry`) and ending at [Func::tail] (always a
//! `FunctionExit`). Inserting or removing an instruction thus only relinks neighbours: an
//! [InstrIdx] held across a mutation remains valid, although an unlinked instruction is no longer
//! part of the program.
//!
//! Textually, a function looks like:
//!
//! ```text
//! FunctionEntry
//! s1 = ArgIn 0
//! s2 = LdC 7
//! s3 = Add s1, s2
//! Ret s3
//! FunctionExit
//! ```
//!
//!
//! ## Labels and branches
//!
//! Basic blocks are delimited by label instructions. A label may be flagged as a "helper" label:
//! the code it starts is cold (it is reached only when a fast path's guard fails) and the
//! register allocator should treat it as such. Labels that head loops record the symbols live on
//! the loop's back edge. Branches refer to their target label by [InstrIdx].
//!
//!
//! ## Symbols and operands
//!
//! Values are named by symbols ([SymIdx]). A symbol is used either as a virtual register (via a
//! [RegOpnd]) or as a stack slot (via a [SymOpnd]). Before register allocation, virtual registers
//! are unbounded. Physical registers are only used where an instruction or an ABI demands one.

use crate::target::{RegT, Target};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::fmt::Write;
use strum::{Display, EnumCount, EnumIter};
use vob::Vob;

mod bailout;
pub mod builder;
mod opnd;
mod region;
pub mod well_formed;

pub use bailout::{BailOutInfo, BailOutKind, BailOutRecord, RestoreLoc};
pub use opnd::{
    AddrKind, AddrOpnd, FloatConstOpnd, HelperCallOpnd, IndirOpnd, IntConstOpnd, LabelOpnd,
    MemRefOpnd, Opnd, OpndKind, OpndT, RegOpnd, SymOpnd,
};
pub use region::{Loop, Region, RegionKind};

index_vec::define_index_type! {
    pub struct InstrIdx = u32;
}

index_vec::define_index_type! {
    pub struct SymIdx = u32;
}

index_vec::define_index_type! {
    pub struct BailOutIdx = u32;
}

index_vec::define_index_type! {
    pub struct RegionIdx = u16;
}

index_vec::define_index_type! {
    pub struct LoopIdx = u16;
}

index_vec::define_index_type! {
    /// A physical register number. What register a given number denotes is up to the target.
    pub struct RegIdx = u8;
}

static_assertions::assert_eq_size!(InstrIdx, u32);
static_assertions::assert_eq_size!(RegIdx, u8);

/// Machine types.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum Ty {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// A tagged dynamic-language value: a machine word.
    Var,
    /// An untagged machine word.
    MachPtr,
}

impl Ty {
    pub fn byte_size(self, ptr_size: u32) -> u32 {
        match self {
            Ty::I8 | Ty::U8 => 1,
            Ty::I16 | Ty::U16 => 2,
            Ty::I32 | Ty::U32 | Ty::F32 => 4,
            Ty::I64 | Ty::U64 | Ty::F64 => 8,
            Ty::Var | Ty::MachPtr => ptr_size,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Ty::F32 | Ty::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Ty::U8 | Ty::U16 | Ty::U32 | Ty::U64)
    }

    /// The suffix used when displaying operands. Machine-word types have no suffix.
    fn suffix(self) -> &'static str {
        match self {
            Ty::I8 => ".i8",
            Ty::I16 => ".i16",
            Ty::I32 => ".i32",
            Ty::I64 => ".i64",
            Ty::U8 => ".u8",
            Ty::U16 => ".u16",
            Ty::U32 => ".u32",
            Ty::U64 => ".u64",
            Ty::F32 => ".f32",
            Ty::F64 => ".f64",
            Ty::Var | Ty::MachPtr => "",
        }
    }
}

/// The optimiser's knowledge about the dynamic type of a value.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ValueType {
    /// Nothing is known.
    Any,
    /// Definitely a tagged integer.
    TaggedInt,
    /// Profiling suggests a tagged integer.
    LikelyTaggedInt,
    /// Definitely a number (tagged integer or float).
    Number,
    /// Definitely not a number (e.g. an object or a string).
    NotNumber,
}

impl ValueType {
    pub fn is_tagged_int(self) -> bool {
        self == ValueType::TaggedInt
    }

    pub fn is_likely_tagged_int(self) -> bool {
        matches!(self, ValueType::TaggedInt | ValueType::LikelyTaggedInt)
    }

    pub fn is_definitely_not_number(self) -> bool {
        self == ValueType::NotNumber
    }
}

/// Opcodes. High-level opcodes (those before `MOV`) are the optimiser's vocabulary and must not
/// survive lowering. Machine-dependent opcodes are shared by all targets: which of them a given
/// target accepts, and with which operand forms, is defined by its legal-forms table.
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Opcode {
    // Structural.
    FunctionEntry,
    FunctionExit,
    Label,
    Nop,
    StatementBoundary,
    PrologStart,
    PrologEnd,

    // Values.
    ArgIn,
    Ld,
    LdC,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    ShrU,
    And,
    Or,
    Xor,
    Neg,
    Not,
    AddI4,
    SubI4,
    MulI4,
    NegI4,
    DivI4,
    RemI4,
    DivU4,
    RemU4,
    AddF,
    SubF,
    MulF,
    DivF,
    FromVar,
    ToVar,
    ConvNum,
    ToFloat,

    // Control flow.
    Br,
    BrLt,
    BrLe,
    BrGt,
    BrGe,
    BrEq,
    BrNeq,
    StartCall,
    ArgOut,
    CallI,
    CallDirect,
    CallHelper,
    Ret,

    // Bailouts and probes.
    BailTarget,
    BailOnNotTaggedInt,
    BailOnNotNumber,
    InterruptProbe,

    // Exception regions.
    TryCatch,
    TryFinally,
    Catch,
    Finally,
    Leave,
    LeaveNull,
    BrOnException,
    Throw,

    // Generators.
    GeneratorResumeJumpTable,
    CreateInterpreterStackFrameForGenerator,
    Yield,
    ResumeYield,

    // x86 family.
    MOV,
    MOV_TRUNC,
    MOVSXD,
    MOVSD,
    MOVAPS,
    LEA,
    ADD,
    SUB,
    IMUL2,
    IMUL,
    MUL,
    IDIV,
    DIV,
    CDQ,
    NEG,
    NOT,
    AND,
    OR,
    XOR,
    SHL,
    SHR,
    SAR,
    TEST,
    CMP,
    XCHG,
    PUSH,
    POP,
    CALL,
    RET,
    JMP,
    JO,
    JNO,
    JEQ,
    JNE,
    JLT,
    JLE,
    JGT,
    JGE,
    JB,
    JBE,
    JA,
    JAE,
    JSB,
    JNSB,
    JP,
    JNP,
    CVTSI2SD,
    CVTTSD2SI,
    ADDSD,
    SUBSD,
    MULSD,
    DIVSD,
    UCOMISD,
    INT3,

    // ARM32 (`MOV`, `ADD`, `SUB`, `AND`, `CMP`, `PUSH`, `POP` and `RET` are shared with the x86
    // family).
    LDIMM,
    LDR,
    STR,
    VLDR,
    VSTR,
    VMOV,
    ORR,
    EOR,
    MVN,
    RSB,
    ADDS,
    SUBS,
    RSBS,
    MUL_ARM,
    SMULL,
    LSL,
    LSR,
    ASR,
    CMN,
    TST,
    B,
    BL,
    BLX,
    BX,
    BEQ,
    BNE,
    BLT,
    BLE,
    BGT,
    BGE,
    BLO,
    BLS,
    BHI,
    BHS,
    BMI,
    BPL,
    BVS,
    BVC,
    VPUSH,
    VPOP,
    VADD,
    VSUB,
    VMUL,
    VDIV,
    /// Compare two doubles and transfer the result to the integer condition flags.
    VCMP,
    VCVT_F64_S32,
    VCVT_S32_F64,
    DEBUGBREAK,
}

impl Opcode {
    /// Is this a machine-dependent opcode?
    pub fn is_md(self) -> bool {
        (self as usize) >= (Opcode::MOV as usize)
    }

    /// Is this a conditional or unconditional direct branch?
    pub fn is_branch(self) -> bool {
        self.is_uncond_branch() || self.is_cond_branch()
    }

    pub fn is_uncond_branch(self) -> bool {
        matches!(self, Opcode::Br | Opcode::JMP | Opcode::B)
    }

    pub fn is_cond_branch(self) -> bool {
        matches!(
            self,
            Opcode::BrLt
                | Opcode::BrLe
                | Opcode::BrGt
                | Opcode::BrGe
                | Opcode::BrEq
                | Opcode::BrNeq
                | Opcode::BrOnException
                | Opcode::JO
                | Opcode::JNO
                | Opcode::JEQ
                | Opcode::JNE
                | Opcode::JLT
                | Opcode::JLE
                | Opcode::JGT
                | Opcode::JGE
                | Opcode::JB
                | Opcode::JBE
                | Opcode::JA
                | Opcode::JAE
                | Opcode::JSB
                | Opcode::JNSB
                | Opcode::JP
                | Opcode::JNP
                | Opcode::BEQ
                | Opcode::BNE
                | Opcode::BLT
                | Opcode::BLE
                | Opcode::BGT
                | Opcode::BGE
                | Opcode::BLO
                | Opcode::BLS
                | Opcode::BHI
                | Opcode::BHS
                | Opcode::BMI
                | Opcode::BPL
                | Opcode::BVS
                | Opcode::BVC
        )
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            Opcode::CALL | Opcode::BL | Opcode::BLX | Opcode::CallI | Opcode::CallDirect
        ) || self == Opcode::CallHelper
    }

    /// Does this machine instruction read the condition flags?
    pub fn reads_flags(self) -> bool {
        self.is_cond_branch() && self.is_md()
    }

    /// Does this machine instruction set the condition flags?
    pub fn writes_flags(self) -> bool {
        matches!(
            self,
            Opcode::ADD
                | Opcode::SUB
                | Opcode::IMUL2
                | Opcode::IMUL
                | Opcode::MUL
                | Opcode::IDIV
                | Opcode::DIV
                | Opcode::NEG
                | Opcode::AND
                | Opcode::OR
                | Opcode::XOR
                | Opcode::SHL
                | Opcode::SHR
                | Opcode::SAR
                | Opcode::TEST
                | Opcode::CMP
                | Opcode::UCOMISD
                | Opcode::ADDS
                | Opcode::SUBS
                | Opcode::RSBS
                | Opcode::CMN
                | Opcode::TST
                | Opcode::VCMP
        )
    }
}

/// What sort of node an [Instr] is.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrKind {
    Plain,
    Label(LabelInfo),
    /// A branch. Indirect branches (e.g. `JMP RAX`) have no target and carry the address in
    /// `src1`.
    Branch(Option<InstrIdx>),
    /// A marker with no run-time effect (e.g. `PrologStart`).
    Pragma,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelInfo {
    /// Is this label the start of a cold ("helper") block?
    pub is_helper: bool,
    /// If this label heads a loop, which one?
    pub loop_: Option<LoopIdx>,
    /// The exception region this label's block belongs to. `None` means "the same region as the
    /// preceding code".
    pub region: Option<RegionIdx>,
}

#[derive(Clone, Debug)]
pub struct Instr {
    pub opcode: Opcode,
    pub dst: Option<Opnd>,
    pub src1: Option<Opnd>,
    pub src2: Option<Opnd>,
    pub kind: InstrKind,
    pub bailout: Option<BailOutIdx>,
    pub bytecode_offset: Option<u32>,
    prev: Option<InstrIdx>,
    next: Option<InstrIdx>,
    linked: bool,
}

impl Instr {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            dst: None,
            src1: None,
            src2: None,
            kind: InstrKind::Plain,
            bailout: None,
            bytecode_offset: None,
            prev: None,
            next: None,
            linked: false,
        }
    }

    pub fn with_dst(mut self, dst: Opnd) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn with_src1(mut self, src: Opnd) -> Self {
        self.src1 = Some(src);
        self
    }

    pub fn with_src2(mut self, src: Opnd) -> Self {
        self.src2 = Some(src);
        self
    }

    pub fn with_bailout(mut self, b: BailOutIdx) -> Self {
        self.bailout = Some(b);
        self
    }

    pub fn label(is_helper: bool) -> Self {
        let mut x = Self::new(Opcode::Label);
        x.kind = InstrKind::Label(LabelInfo {
            is_helper,
            ..Default::default()
        });
        x
    }

    pub fn branch(opcode: Opcode, target: InstrIdx) -> Self {
        let mut x = Self::new(opcode);
        x.kind = InstrKind::Branch(Some(target));
        x
    }

    pub fn pragma(opcode: Opcode) -> Self {
        let mut x = Self::new(opcode);
        x.kind = InstrKind::Pragma;
        x
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InstrKind::Label(_))
    }

    pub fn label_info(&self) -> Option<&LabelInfo> {
        match &self.kind {
            InstrKind::Label(x) => Some(x),
            _ => None,
        }
    }

    pub fn label_info_mut(&mut self) -> Option<&mut LabelInfo> {
        match &mut self.kind {
            InstrKind::Label(x) => Some(x),
            _ => None,
        }
    }

    pub fn branch_target(&self) -> Option<InstrIdx> {
        match self.kind {
            InstrKind::Branch(x) => x,
            _ => None,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Iterate over `dst`, `src1`, `src2` in that order, skipping absent operands.
    pub fn iter_opnds(&self) -> impl Iterator<Item = &Opnd> {
        self.dst
            .iter()
            .chain(self.src1.iter())
            .chain(self.src2.iter())
    }

    /// Iterate over the operands this instruction reads. Note that the registers used to form an
    /// indirect destination's address are read too.
    pub fn iter_src_opnds(&self) -> impl Iterator<Item = &Opnd> {
        self.src1.iter().chain(self.src2.iter())
    }
}

/// What role a symbol plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymKind {
    /// An ordinary value.
    Var,
    /// The outgoing argument slot `n` (0-based) of a call.
    ArgSlot(u16),
    /// The incoming parameter `n` (0-based).
    Param(u16),
}

#[derive(Clone, Debug)]
pub struct Sym {
    pub ty: Ty,
    pub kind: SymKind,
    /// Frame-pointer-relative offset once the symbol has been given a stack slot.
    pub offset: Option<i32>,
    /// The single defining instruction, for symbols that have one (argument slots always do).
    pub def: Option<InstrIdx>,
}

/// Facts about the thread context the compiled code will run under.
#[derive(Clone, Debug)]
pub struct ThreadContextInfo {
    /// Is the compiled code bound to a single thread? If so, the stack limit is a compile-time
    /// constant.
    pub thread_bound: bool,
    /// The stack limit for a thread-bound context.
    pub script_stack_limit: u64,
    /// The address of the cell holding the current thread's stack limit.
    pub stack_limit_addr: u64,
    /// Should stack probes also serve as script-interrupt checks?
    pub interrupt_probe: bool,
    /// The address of the script context the function runs in.
    pub script_context_addr: u64,
    /// The address of the thread's implicit-call flags byte.
    pub implicit_call_flags_addr: u64,
}

impl Default for ThreadContextInfo {
    fn default() -> Self {
        Self {
            thread_bound: false,
            script_stack_limit: 0x1_0000,
            stack_limit_addr: 0x4000,
            interrupt_probe: false,
            script_context_addr: 0x5000,
            implicit_call_flags_addr: 0x4008,
        }
    }
}

/// Frame-layout state accumulated while lowering.
#[derive(Clone, Debug, Default)]
pub struct FrameLayout {
    /// Bytes of locals (including spill slots) below the frame pointer.
    pub local_stack_height: u32,
    /// The largest number of outgoing argument slots needed by any call.
    pub arg_slots_for_functions_called: u32,
    /// Bytes of the outgoing-argument area.
    pub args_size: u32,
    /// Bytes of callee-saved registers pushed by the prolog.
    pub saved_reg_size: u32,
    /// Bytes reserved for the argument-out area of inlined calls.
    pub max_inlinee_argout_size: u32,
    /// The total frame size, including the return address, once the prolog has been lowered.
    pub frame_size: u32,
}

/// Per-function properties supplied by the optimiser.
#[derive(Clone, Debug, Default)]
pub struct FuncFlags {
    pub is_generator: bool,
    /// The dedicated arguments-object slot, which must start out zeroed.
    pub argument_slot: Option<SymIdx>,
    /// The argument count of the first inlinee frame, which must start out zeroed.
    pub inlinee_argc: Option<SymIdx>,
    /// The number of incoming parameters.
    pub param_count: u16,
    /// For generators, the symbol holding the generator object.
    pub generator: Option<SymIdx>,
}

/// One function being compiled.
#[derive(Debug)]
pub struct Func {
    pub target: Target,
    pub name: String,
    instrs: IndexVec<InstrIdx, Instr>,
    head: InstrIdx,
    tail: InstrIdx,
    syms: IndexVec<SymIdx, Sym>,
    bailouts: IndexVec<BailOutIdx, BailOutInfo>,
    pub(crate) regions: IndexVec<RegionIdx, Region>,
    pub(crate) loops: IndexVec<LoopIdx, Loop>,
    /// Interned floating-point constants. The `n`th is at `FLOAT_CONST_BASE + 8 * n`.
    float_consts: Vec<u64>,
    pub frame: FrameLayout,
    pub flags: FuncFlags,
    pub tctx: ThreadContextInfo,
    /// Which physical registers the function uses.
    pub regs_used: Vob,
    /// Has lowering emitted any call (including helper calls)?
    pub has_calls: bool,
    /// Has lowering emitted any bailout?
    pub has_bailout: bool,
}

/// The base address of the floating-point constant pool.
pub const FLOAT_CONST_BASE: u64 = 0x2_0000;

impl Func {
    pub fn new(target: Target, name: &str) -> Self {
        let mut instrs: IndexVec<InstrIdx, Instr> = IndexVec::new();
        let head = instrs.push(Instr::new(Opcode::FunctionEntry));
        let tail = instrs.push(Instr::new(Opcode::FunctionExit));
        instrs[head].next = Some(tail);
        instrs[head].linked = true;
        instrs[tail].prev = Some(head);
        instrs[tail].linked = true;
        let mut regions: IndexVec<RegionIdx, Region> = IndexVec::new();
        regions.push(Region::root());
        Self {
            target,
            name: name.to_owned(),
            instrs,
            head,
            tail,
            syms: IndexVec::new(),
            bailouts: IndexVec::new(),
            regions,
            loops: IndexVec::new(),
            float_consts: Vec::new(),
            frame: FrameLayout::default(),
            flags: FuncFlags::default(),
            tctx: ThreadContextInfo::default(),
            regs_used: Vob::from_elem(false, usize::from(u8::MAX) + 1),
            has_calls: false,
            has_bailout: false,
        }
    }

    pub fn head(&self) -> InstrIdx {
        self.head
    }

    pub fn tail(&self) -> InstrIdx {
        self.tail
    }

    pub fn ptr_size(&self) -> u32 {
        self.target.ptr_size()
    }

    /// The root exception region.
    pub fn root_region(&self) -> RegionIdx {
        RegionIdx::from_usize(0)
    }

    // Instructions

    pub fn instr(&self, iidx: InstrIdx) -> &Instr {
        &self.instrs[iidx]
    }

    pub fn instr_mut(&mut self, iidx: InstrIdx) -> &mut Instr {
        &mut self.instrs[iidx]
    }

    pub fn next(&self, iidx: InstrIdx) -> Option<InstrIdx> {
        self.instrs[iidx].next
    }

    pub fn prev(&self, iidx: InstrIdx) -> Option<InstrIdx> {
        self.instrs[iidx].prev
    }

    /// Add `instr` to the arena without linking it into the instruction list.
    pub fn new_instr(&mut self, instr: Instr) -> InstrIdx {
        self.instrs.push(instr)
    }

    /// Add a (not yet linked) label to the arena.
    pub fn new_label(&mut self, is_helper: bool) -> InstrIdx {
        self.new_instr(Instr::label(is_helper))
    }

    /// Link the unlinked instruction `new` immediately before `before`.
    ///
    /// # Panics
    ///
    /// If `new` is already linked, `before` is not linked, or `before` is the function's head.
    pub fn insert_before(&mut self, before: InstrIdx, new: InstrIdx) {
        assert!(!self.instrs[new].linked, "%{new:?} is already linked");
        assert!(self.instrs[before].linked, "%{before:?} is not linked");
        let prev = self.instrs[before]
            .prev
            .unwrap_or_else(|| panic!("cannot insert before the function entry"));
        self.instrs[prev].next = Some(new);
        self.instrs[new].prev = Some(prev);
        self.instrs[new].next = Some(before);
        self.instrs[before].prev = Some(new);
        self.instrs[new].linked = true;
    }

    /// Link the unlinked instruction `new` immediately after `after`.
    ///
    /// # Panics
    ///
    /// If `new` is already linked, `after` is not linked, or `after` is the function's tail.
    pub fn insert_after(&mut self, after: InstrIdx, new: InstrIdx) {
        let next = self.instrs[after]
            .next
            .unwrap_or_else(|| panic!("cannot insert after the function exit"));
        self.insert_before(next, new);
    }

    /// Create `instr` and link it before `before`, returning its index.
    pub fn insert_instr_before(&mut self, before: InstrIdx, instr: Instr) -> InstrIdx {
        let iidx = self.new_instr(instr);
        self.insert_before(before, iidx);
        iidx
    }

    /// Create `instr` and link it after `after`, returning its index.
    pub fn insert_instr_after(&mut self, after: InstrIdx, instr: Instr) -> InstrIdx {
        let iidx = self.new_instr(instr);
        self.insert_after(after, iidx);
        iidx
    }

    /// Create `instr` and link it just before the function exit.
    pub fn append(&mut self, instr: Instr) -> InstrIdx {
        let tail = self.tail;
        self.insert_instr_before(tail, instr)
    }

    /// Unlink `iidx` from the instruction list. The instruction stays in the arena.
    ///
    /// # Panics
    ///
    /// If `iidx` is the function's head or tail, or is not linked.
    pub fn unlink(&mut self, iidx: InstrIdx) {
        assert!(iidx != self.head && iidx != self.tail);
        assert!(self.instrs[iidx].linked, "%{iidx:?} is not linked");
        let prev = self.instrs[iidx].prev.unwrap();
        let next = self.instrs[iidx].next.unwrap();
        self.instrs[prev].next = Some(next);
        self.instrs[next].prev = Some(prev);
        let x = &mut self.instrs[iidx];
        x.prev = None;
        x.next = None;
        x.linked = false;
    }

    /// Replace the linked instruction `old` with the unlinked instruction `new`.
    pub fn replace(&mut self, old: InstrIdx, new: InstrIdx) {
        self.insert_before(old, new);
        self.unlink(old);
    }

    /// Return the indexes of all linked instructions in program order. This is a snapshot:
    /// subsequent mutations are not reflected in it.
    pub fn instr_idxs(&self) -> Vec<InstrIdx> {
        let mut v = Vec::with_capacity(self.instrs.len());
        let mut cur = Some(self.head);
        while let Some(iidx) = cur {
            v.push(iidx);
            cur = self.instrs[iidx].next;
        }
        v
    }

    /// How many instructions are in the arena (linked or not)?
    pub fn arena_len(&self) -> usize {
        self.instrs.len()
    }

    /// Find the label that starts the block containing `iidx`, if there is one.
    pub fn block_label(&self, iidx: InstrIdx) -> Option<InstrIdx> {
        let mut cur = Some(iidx);
        while let Some(x) = cur {
            if self.instrs[x].is_label() {
                return Some(x);
            }
            cur = self.instrs[x].prev;
        }
        None
    }

    /// Is `iidx` in a helper (cold) block?
    pub fn is_in_helper_block(&self, iidx: InstrIdx) -> bool {
        self.block_label(iidx)
            .and_then(|l| self.instrs[l].label_info().map(|x| x.is_helper))
            .unwrap_or(false)
    }

    // Symbols

    pub fn new_sym(&mut self, ty: Ty) -> SymIdx {
        self.syms.push(Sym {
            ty,
            kind: SymKind::Var,
            offset: None,
            def: None,
        })
    }

    pub fn new_sym_of_kind(&mut self, ty: Ty, kind: SymKind) -> SymIdx {
        self.syms.push(Sym {
            ty,
            kind,
            offset: None,
            def: None,
        })
    }

    pub fn sym(&self, sidx: SymIdx) -> &Sym {
        &self.syms[sidx]
    }

    pub fn sym_mut(&mut self, sidx: SymIdx) -> &mut Sym {
        &mut self.syms[sidx]
    }

    pub fn sym_count(&self) -> usize {
        self.syms.len()
    }

    /// A fresh virtual register of type `ty`.
    pub fn new_temp(&mut self, ty: Ty) -> RegOpnd {
        let s = self.new_sym(ty);
        RegOpnd::sym(s, ty)
    }

    /// A physical register operand.
    pub fn phys_reg<R: RegT>(&mut self, reg: R, ty: Ty) -> RegOpnd {
        self.regs_used.set(usize::from(reg.regidx()), true);
        RegOpnd::phys(reg.regidx(), ty)
    }

    /// Give `sidx` a stack slot if it does not already have one, returning its offset relative to
    /// the frame pointer.
    pub fn stack_allocate(&mut self, sidx: SymIdx) -> i32 {
        if let Some(off) = self.syms[sidx].offset {
            return off;
        }
        let ptr_size = self.ptr_size();
        let size = self.syms[sidx].ty.byte_size(ptr_size).max(ptr_size);
        let off = match self.syms[sidx].kind {
            SymKind::Param(n) => {
                // Parameters live above the return address and saved frame pointer.
                i32::try_from(2 * ptr_size + u32::from(n) * ptr_size).unwrap()
            }
            SymKind::ArgSlot(n) => i32::try_from(u32::from(n) * ptr_size).unwrap(),
            SymKind::Var => {
                self.frame.local_stack_height =
                    self.frame.local_stack_height.next_multiple_of(size) + size;
                -i32::try_from(self.frame.local_stack_height).unwrap()
            }
        };
        self.syms[sidx].offset = Some(off);
        off
    }

    /// Move every local stack slot `delta` bytes further below the frame pointer, making room
    /// for the callee-saved registers the prolog pushes there.
    pub(crate) fn shift_locals(&mut self, delta: u32) {
        let delta = i32::try_from(delta).unwrap();
        for s in self.syms.iter_mut() {
            if let (SymKind::Var, Some(off)) = (s.kind, s.offset.as_mut()) {
                *off -= delta;
            }
        }
    }

    // Constants

    /// Intern the floating-point constant `v`, returning the address it will live at.
    pub fn float_const_addr(&mut self, v: f64) -> u64 {
        let bits = v.to_bits();
        let i = match self.float_consts.iter().position(|x| *x == bits) {
            Some(i) => i,
            None => {
                self.float_consts.push(bits);
                self.float_consts.len() - 1
            }
        };
        FLOAT_CONST_BASE + 8 * u64::try_from(i).unwrap()
    }

    /// The interned floating-point constants in address order.
    pub fn float_consts(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.float_consts
            .iter()
            .enumerate()
            .map(|(i, x)| (FLOAT_CONST_BASE + 8 * (i as u64), f64::from_bits(*x)))
    }

    // Bailouts

    pub fn add_bailout(&mut self, info: BailOutInfo) -> BailOutIdx {
        self.bailouts.push(info)
    }

    pub fn bailout(&self, bidx: BailOutIdx) -> &BailOutInfo {
        &self.bailouts[bidx]
    }

    pub fn bailout_mut(&mut self, bidx: BailOutIdx) -> &mut BailOutInfo {
        &mut self.bailouts[bidx]
    }

    pub fn bailouts(&self) -> impl Iterator<Item = (BailOutIdx, &BailOutInfo)> {
        self.bailouts.iter_enumerated()
    }

    // Regions and loops

    pub fn add_region(&mut self, region: Region) -> RegionIdx {
        self.regions.push(region)
    }

    pub fn region(&self, ridx: RegionIdx) -> &Region {
        &self.regions[ridx]
    }

    pub fn region_mut(&mut self, ridx: RegionIdx) -> &mut Region {
        &mut self.regions[ridx]
    }

    pub fn has_try(&self) -> bool {
        self.regions.len() > 1
    }

    /// Create a loop headed by the label `header`, with nothing live on its back edge.
    pub fn add_loop(&mut self, header: InstrIdx) -> LoopIdx {
        let lidx = self.loops.push(Loop {
            header,
            live_on_back_edge: Vob::from_elem(false, self.syms.len()),
        });
        if let Some(li) = self.instrs[header].label_info_mut() {
            li.loop_ = Some(lidx);
        }
        lidx
    }

    pub fn loop_(&self, lidx: LoopIdx) -> &Loop {
        &self.loops[lidx]
    }

    pub fn loop_mut(&mut self, lidx: LoopIdx) -> &mut Loop {
        &mut self.loops[lidx]
    }

    // Display

    pub fn instr_to_string(&self, iidx: InstrIdx) -> String {
        let inst = &self.instrs[iidx];
        if let InstrKind::Label(li) = &inst.kind {
            let mut attrs: SmallVec<[String; 3]> = SmallVec::new();
            if li.is_helper {
                attrs.push("helper".to_owned());
            }
            if let Some(l) = li.loop_ {
                attrs.push(format!("loop {}", usize::from(l)));
            }
            if let Some(r) = li.region {
                if r != self.root_region() {
                    attrs.push(format!("region {}", usize::from(r)));
                }
            }
            return if attrs.is_empty() {
                format!("L{}:", usize::from(iidx))
            } else {
                format!("L{}: [{}]", usize::from(iidx), attrs.join(", "))
            };
        }

        let mut s = String::new();
        if let Some(dst) = &inst.dst {
            write!(s, "{} = ", dst.to_string(self)).ok();
        }
        write!(s, "{}", inst.opcode).ok();
        let mut srcs: SmallVec<[String; 3]> = SmallVec::new();
        if let InstrKind::Branch(Some(t)) = inst.kind {
            srcs.push(format!("L{}", usize::from(t)));
        }
        for x in inst.iter_src_opnds() {
            srcs.push(x.to_string(self));
        }
        if !srcs.is_empty() {
            write!(s, " {}", srcs.join(", ")).ok();
        }
        if let Some(b) = inst.bailout {
            write!(
                s,
                " [bailout {}: {}]",
                usize::from(b),
                self.bailouts[b].kind
            )
            .ok();
        }
        s
    }
}

impl std::fmt::Display for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "func {} ({}) {{", self.name, self.target)?;
        for iidx in self.instr_idxs() {
            if self.instrs[iidx].is_label() {
                writeln!(f, "{}", self.instr_to_string(iidx))?;
            } else {
                writeln!(f, "  {}", self.instr_to_string(iidx))?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn link_unlink() {
        let mut f = Func::new(Target::SysVX64, "t");
        let a = f.append(Instr::new(Opcode::Nop));
        let b = f.append(Instr::new(Opcode::StatementBoundary));
        let c = f.insert_instr_before(b, Instr::new(Opcode::Ld));
        assert_eq!(f.instr_idxs(), vec![f.head(), a, c, b, f.tail()]);
        f.unlink(c);
        assert!(!f.instr(c).is_linked());
        assert_eq!(f.instr_idxs(), vec![f.head(), a, b, f.tail()]);
        // An unlinked instruction can be relinked elsewhere and keeps its index.
        f.insert_after(b, c);
        assert_eq!(f.instr_idxs(), vec![f.head(), a, b, c, f.tail()]);
        let d = f.new_instr(Instr::new(Opcode::Nop));
        f.replace(a, d);
        assert_eq!(f.instr_idxs(), vec![f.head(), d, b, c, f.tail()]);
    }

    #[test]
    #[should_panic(expected = "is already linked")]
    fn double_link() {
        let mut f = Func::new(Target::SysVX64, "t");
        let a = f.append(Instr::new(Opcode::Nop));
        let tail = f.tail();
        f.insert_before(tail, a);
    }

    #[test]
    fn helper_blocks() {
        let mut f = Func::new(Target::SysVX64, "t");
        let a = f.append(Instr::new(Opcode::Nop));
        let l = f.new_label(true);
        let tail = f.tail();
        f.insert_before(tail, l);
        let b = f.append(Instr::new(Opcode::Nop));
        assert!(!f.is_in_helper_block(a));
        assert!(f.is_in_helper_block(b));
        assert_eq!(f.block_label(b), Some(l));
    }

    #[test]
    fn stack_allocation() {
        let mut f = Func::new(Target::SysVX64, "t");
        let s1 = f.new_sym(Ty::Var);
        let s2 = f.new_sym(Ty::I32);
        assert_eq!(f.stack_allocate(s1), -8);
        assert_eq!(f.stack_allocate(s2), -16);
        assert_eq!(f.stack_allocate(s1), -8);
        let p = f.new_sym_of_kind(Ty::Var, SymKind::Param(1));
        assert_eq!(f.stack_allocate(p), 24);
        assert_eq!(f.frame.local_stack_height, 16);
    }

    #[test]
    fn float_consts() {
        let mut f = Func::new(Target::SysVX64, "t");
        let a = f.float_const_addr(1.5);
        let b = f.float_const_addr(-0.0);
        assert_eq!(f.float_const_addr(1.5), a);
        // 0.0 and -0.0 are different bit patterns.
        assert_ne!(f.float_const_addr(0.0), b);
        assert_eq!(f.float_consts().count(), 3);
    }
}
