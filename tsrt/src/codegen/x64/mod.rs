//! The x64 code generator.
//!
//! Every value lives in a stack slot: an operation loads its operands into scratch registers
//! (`rax`, `rcx`, `rdx`), computes, and pushes the result. A builder therefore knows, at any
//! point, exactly how deep its frame is, and a jump between builders only has to reconcile two
//! stack layouts (see [super::remap]).
//!
//! Generated functions use the System V calling convention and take at most six word arguments,
//! which the prologue pushes in order. Slot 0 is the caller's return address.

use super::{
    codebuf::{CodeDumper, CodePool, MachineCodeBlock},
    remap::{self, Move},
    replay::ReplayBuilder,
    ArrayToken, BlockDesc, FlexSwitch, GenBuilder, GenVar, RGenOp, StackPos,
};
use crate::{
    config::Config,
    error::CompilationError,
    lltype::{tsrt_malloc, tsrt_malloc_varsize, LLOp, LLType, WORD},
    log::stats::Stats,
};
use iced_x86::{Code, IcedError, Instruction as Op, MemoryOperand, Register};
use std::{cell::RefCell, collections::HashMap, rc::Rc};

mod asm;
mod flexswitch;

use asm::Asm;
use flexswitch::X64FlexSwitch;

/// The System V argument registers, in order.
const ARG_REGS: [Register; 6] = [
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::R8,
    Register::R9,
];

/// State shared by a code generator and every builder it has handed out.
struct Inner {
    pool: RefCell<CodePool>,
    dumper: RefCell<CodeDumper>,
    insns: RefCell<HashMap<&'static str, usize>>,
    stats: Rc<Stats>,
}

impl Inner {
    fn open_mc(&self) -> Result<MachineCodeBlock, CompilationError> {
        let mc = self.pool.borrow_mut().open_mc()?;
        self.stats.code_block_opened();
        Ok(mc)
    }

    fn close_mc(&self, mut mc: MachineCodeBlock) {
        mc.done(&mut self.dumper.borrow_mut());
        self.pool.borrow_mut().close_mc(mc);
    }

    /// Dump code that was patched in place.
    fn dump_patch(&self, mut region: MachineCodeBlock) {
        region.done(&mut self.dumper.borrow_mut());
    }

    fn count(&self, name: &'static str) {
        *self.insns.borrow_mut().entry(name).or_insert(0) += 1;
    }
}

/// An x64 code generator. Cloning it is cheap, and generated code stays mapped for as long as any
/// clone (or any builder it handed out) is alive.
#[derive(Clone)]
pub struct X64RGenOp {
    inner: Rc<Inner>,
}

impl X64RGenOp {
    pub(crate) fn new(config: &Config, stats: Rc<Stats>) -> Result<Self, CompilationError> {
        let pool = CodePool::new(config.code_arena_size, config.code_block_size)?;
        let dumper = CodeDumper::new(config.code_dump.as_deref());
        Ok(Self {
            inner: Rc::new(Inner {
                pool: RefCell::new(pool),
                dumper: RefCell::new(dumper),
                insns: RefCell::new(HashMap::new()),
                stats,
            }),
        })
    }
}

/// `x`, a count of stack slots or bytes, as a signed offset.
fn signed<T: TryFrom<usize>>(x: usize) -> Result<T, CompilationError> {
    T::try_from(x)
        .map_err(|_| CompilationError::InternalError(format!("stack offset {x} out of range")))
}

impl RGenOp for X64RGenOp {
    fn newgraph(
        &self,
        nargs: usize,
        name: &str,
    ) -> Result<(Box<dyn GenBuilder>, usize, Vec<GenVar>), CompilationError> {
        if nargs > ARG_REGS.len() {
            return Err(CompilationError::LimitExceeded(format!(
                "{name} takes {nargs} arguments but at most {} are supported",
                ARG_REGS.len()
            )));
        }
        let mut b = Builder::open(Rc::clone(&self.inner), 1)?;
        let entry = b.tell()?;
        b.asm.log(&format!("{name}:"));
        for reg in &ARG_REGS[..nargs] {
            b.emit(Op::with1(Code::Push_r64, *reg))?;
            b.stackdepth += 1;
        }
        let vars = (1..=nargs).map(GenVar::Var).collect();
        Ok((Box::new(b), entry, vars))
    }

    fn replay(&self, block: &BlockDesc, kinds: &[LLType]) -> (Box<dyn GenBuilder>, Vec<GenVar>) {
        let (b, vars) = ReplayBuilder::new(block, kinds);
        (Box::new(b), vars)
    }

    fn insns(&self) -> HashMap<&'static str, usize> {
        self.inner.insns.borrow().clone()
    }

    fn reset_insns(&self) {
        self.inner.insns.borrow_mut().clear();
    }
}

/// Generates one basic block (and whatever falls through from it) into a machine code block.
pub(crate) struct Builder {
    inner: Rc<Inner>,
    /// `None` once the builder has been closed.
    mc: Option<MachineCodeBlock>,
    stackdepth: usize,
    asm: Asm,
}

impl Builder {
    fn open(inner: Rc<Inner>, stackdepth: usize) -> Result<Self, CompilationError> {
        let mc = inner.open_mc()?;
        Ok(Self {
            inner,
            mc: Some(mc),
            stackdepth,
            asm: Asm::new(),
        })
    }

    fn tell(&self) -> Result<usize, CompilationError> {
        self.mc
            .as_ref()
            .map(|mc| mc.tell())
            .ok_or_else(|| CompilationError::InternalError("builder used after closing".into()))
    }

    fn emit(&mut self, op: Result<Op, IcedError>) -> Result<(), CompilationError> {
        let mc = self
            .mc
            .as_mut()
            .ok_or_else(|| CompilationError::InternalError("builder used after closing".into()))?;
        self.asm.push_inst(mc, op)
    }

    fn close(&mut self) {
        if let Some(mc) = self.mc.take() {
            self.inner.close_mc(mc);
        }
    }

    /// The memory operand addressing stack position `pos`.
    fn slot(&self, pos: StackPos) -> Result<MemoryOperand, CompilationError> {
        if pos >= self.stackdepth {
            return Err(CompilationError::InternalError(format!(
                "stack position {pos} outside a frame of depth {}",
                self.stackdepth
            )));
        }
        let off = WORD * signed::<i64>(self.stackdepth - 1 - pos)?;
        Ok(MemoryOperand::with_base_displ(Register::RSP, off))
    }

    fn load(&mut self, reg: Register, gv: GenVar) -> Result<(), CompilationError> {
        match gv {
            GenVar::Const(c) => self.emit(Op::with2(Code::Mov_r64_imm64, reg, c)),
            GenVar::Var(pos) => {
                let m = self.slot(pos)?;
                self.emit(Op::with2(Code::Mov_r64_rm64, reg, m))
            }
        }
    }

    fn store(&mut self, pos: StackPos, reg: Register) -> Result<(), CompilationError> {
        let m = self.slot(pos)?;
        self.emit(Op::with2(Code::Mov_rm64_r64, m, reg))
    }

    /// Push `rax` as a new stack slot.
    fn push_result(&mut self) -> Result<GenVar, CompilationError> {
        self.emit(Op::with1(Code::Push_r64, Register::RAX))?;
        self.stackdepth += 1;
        Ok(GenVar::Var(self.stackdepth - 1))
    }

    /// Move `rsp` by `words` slots: negative values grow the frame.
    fn adjust_rsp(&mut self, words: isize) -> Result<(), CompilationError> {
        let bytes = i32::try_from(words.unsigned_abs() * WORD as usize)
            .map_err(|_| CompilationError::LimitExceeded(format!("frame of {words} words")))?;
        match words {
            0 => Ok(()),
            w if w < 0 => self.emit(Op::with2(Code::Sub_rm64_imm32, Register::RSP, bytes)),
            _ => self.emit(Op::with2(Code::Add_rm64_imm32, Register::RSP, bytes)),
        }
    }

    fn setcc(&mut self, code: Code) -> Result<(), CompilationError> {
        self.emit(Op::with1(code, Register::AL))?;
        self.emit(Op::with2(Code::Movzx_r64_rm8, Register::RAX, Register::AL))
    }

    /// Call `fnaddr` with `args`, leaving the result in `rax`. The stack pointer is padded so that
    /// it is 16-byte aligned at the call.
    fn emit_call(&mut self, fnaddr: GenVar, args: &[GenVar]) -> Result<(), CompilationError> {
        if args.len() > ARG_REGS.len() {
            return Err(CompilationError::LimitExceeded(format!(
                "call with {} arguments",
                args.len()
            )));
        }
        for (reg, gv) in ARG_REGS.iter().zip(args) {
            self.load(*reg, *gv)?;
        }
        self.load(Register::RAX, fnaddr)?;
        // On entry `rsp` is 8 mod 16 and every slot after the return address is one word.
        let pad = self.stackdepth % 2 == 1;
        if pad {
            self.adjust_rsp(-1)?;
        }
        self.emit(Op::with1(Code::Call_rm64, Register::RAX))?;
        if pad {
            self.adjust_rsp(1)?;
        }
        Ok(())
    }

    fn branch(&mut self, gv: GenVar, jcc: Code) -> Result<Box<dyn GenBuilder>, CompilationError> {
        let target = Builder::open(Rc::clone(&self.inner), self.stackdepth)?;
        let addr = target.tell()?;
        self.load(Register::RAX, gv)?;
        self.emit(Op::with2(Code::Test_rm64_r64, Register::RAX, Register::RAX))?;
        self.emit(Op::with_branch(jcc, addr as u64))?;
        Ok(Box::new(target))
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.close();
    }
}

impl GenBuilder for Builder {
    fn genop1(&mut self, op: LLOp, gv: GenVar) -> Result<GenVar, CompilationError> {
        self.inner.count(op.opname());
        self.load(Register::RAX, gv)?;
        match op {
            LLOp::IntNeg => self.emit(Op::with1(Code::Neg_rm64, Register::RAX))?,
            LLOp::IntInvert => self.emit(Op::with1(Code::Not_rm64, Register::RAX))?,
            LLOp::IntIsTrue | LLOp::BoolNot => {
                self.emit(Op::with2(Code::Test_rm64_r64, Register::RAX, Register::RAX))?;
                self.setcc(if op == LLOp::IntIsTrue {
                    Code::Setne_rm8
                } else {
                    Code::Sete_rm8
                })?;
            }
            LLOp::CastBoolToInt | LLOp::CastCharToInt => (),
            LLOp::CastIntToChar => {
                self.emit(Op::with2(Code::And_rm64_imm32, Register::RAX, 0xffi32))?
            }
            _ => {
                return Err(CompilationError::InternalError(format!(
                    "{} is not a unary operation",
                    op.opname()
                )))
            }
        }
        self.push_result()
    }

    fn genop2(&mut self, op: LLOp, gv1: GenVar, gv2: GenVar) -> Result<GenVar, CompilationError> {
        if op.nargs() != 2 {
            return Err(CompilationError::InternalError(format!(
                "{} is not a binary operation",
                op.opname()
            )));
        }
        self.inner.count(op.opname());
        self.load(Register::RAX, gv1)?;
        self.load(Register::RCX, gv2)?;
        let (rax, rcx) = (Register::RAX, Register::RCX);
        match op {
            LLOp::IntAdd => self.emit(Op::with2(Code::Add_r64_rm64, rax, rcx))?,
            LLOp::IntSub => self.emit(Op::with2(Code::Sub_r64_rm64, rax, rcx))?,
            LLOp::IntMul => self.emit(Op::with2(Code::Imul_r64_rm64, rax, rcx))?,
            LLOp::IntAnd => self.emit(Op::with2(Code::And_r64_rm64, rax, rcx))?,
            LLOp::IntOr => self.emit(Op::with2(Code::Or_r64_rm64, rax, rcx))?,
            LLOp::IntXor => self.emit(Op::with2(Code::Xor_r64_rm64, rax, rcx))?,
            LLOp::IntLshift => self.emit(Op::with2(Code::Shl_rm64_CL, rax, Register::CL))?,
            LLOp::IntRshift => self.emit(Op::with2(Code::Sar_rm64_CL, rax, Register::CL))?,
            LLOp::IntFloorDiv | LLOp::IntMod => {
                self.emit(Ok(Op::with(Code::Cqo)))?;
                self.emit(Op::with1(Code::Idiv_rm64, rcx))?;
                if op == LLOp::IntMod {
                    self.emit(Op::with2(Code::Mov_r64_rm64, rax, Register::RDX))?;
                }
            }
            LLOp::IntLt
            | LLOp::IntLe
            | LLOp::IntEq
            | LLOp::IntNe
            | LLOp::IntGt
            | LLOp::IntGe
            | LLOp::CharEq
            | LLOp::CharNe => {
                self.emit(Op::with2(Code::Cmp_r64_rm64, rax, rcx))?;
                self.setcc(match op {
                    LLOp::IntLt => Code::Setl_rm8,
                    LLOp::IntLe => Code::Setle_rm8,
                    LLOp::IntEq | LLOp::CharEq => Code::Sete_rm8,
                    LLOp::IntNe | LLOp::CharNe => Code::Setne_rm8,
                    LLOp::IntGt => Code::Setg_rm8,
                    _ => Code::Setge_rm8,
                })?;
            }
            _ => unreachable!(),
        }
        self.push_result()
    }

    fn genop_getfield(&mut self, offset: i64, ptr: GenVar) -> Result<GenVar, CompilationError> {
        self.inner.count("getfield");
        self.load(Register::RAX, ptr)?;
        self.emit(Op::with2(
            Code::Mov_r64_rm64,
            Register::RAX,
            MemoryOperand::with_base_displ(Register::RAX, offset),
        ))?;
        self.push_result()
    }

    fn genop_setfield(
        &mut self,
        offset: i64,
        ptr: GenVar,
        value: GenVar,
    ) -> Result<(), CompilationError> {
        self.inner.count("setfield");
        self.load(Register::RAX, ptr)?;
        self.load(Register::RCX, value)?;
        self.emit(Op::with2(
            Code::Mov_rm64_r64,
            MemoryOperand::with_base_displ(Register::RAX, offset),
            Register::RCX,
        ))
    }

    fn genop_getarrayitem(
        &mut self,
        token: ArrayToken,
        ptr: GenVar,
        index: GenVar,
    ) -> Result<GenVar, CompilationError> {
        self.inner.count("getarrayitem");
        let m = item_operand(token)?;
        self.load(Register::RAX, ptr)?;
        self.load(Register::RCX, index)?;
        self.emit(Op::with2(Code::Mov_r64_rm64, Register::RAX, m))?;
        self.push_result()
    }

    fn genop_setarrayitem(
        &mut self,
        token: ArrayToken,
        ptr: GenVar,
        index: GenVar,
        value: GenVar,
    ) -> Result<(), CompilationError> {
        self.inner.count("setarrayitem");
        let m = item_operand(token)?;
        self.load(Register::RAX, ptr)?;
        self.load(Register::RCX, index)?;
        self.load(Register::RDX, value)?;
        self.emit(Op::with2(Code::Mov_rm64_r64, m, Register::RDX))
    }

    fn genop_getarraysize(
        &mut self,
        token: ArrayToken,
        ptr: GenVar,
    ) -> Result<GenVar, CompilationError> {
        self.inner.count("getarraysize");
        self.load(Register::RAX, ptr)?;
        self.emit(Op::with2(
            Code::Mov_r64_rm64,
            Register::RAX,
            MemoryOperand::with_base_displ(Register::RAX, token.lengthoffset),
        ))?;
        self.push_result()
    }

    fn genop_malloc_fixedsize(&mut self, size: i64) -> Result<GenVar, CompilationError> {
        self.inner.count("malloc");
        let f = tsrt_malloc as extern "C" fn(i64) -> i64;
        self.emit_call(GenVar::Const(f as usize as i64), &[GenVar::Const(size)])?;
        self.push_result()
    }

    fn genop_malloc_varsize(
        &mut self,
        token: ArrayToken,
        length: GenVar,
    ) -> Result<GenVar, CompilationError> {
        self.inner.count("malloc_varsize");
        let f = tsrt_malloc_varsize as extern "C" fn(i64) -> i64;
        self.emit_call(GenVar::Const(f as usize as i64), &[length])?;
        self.load(Register::RCX, length)?;
        self.emit(Op::with2(
            Code::Mov_rm64_r64,
            MemoryOperand::with_base_displ(Register::RAX, token.lengthoffset),
            Register::RCX,
        ))?;
        self.push_result()
    }

    fn genop_call(&mut self, fnaddr: GenVar, args: &[GenVar]) -> Result<GenVar, CompilationError> {
        self.inner.count("call");
        self.emit_call(fnaddr, args)?;
        self.push_result()
    }

    fn genop_same_as(&mut self, gv: GenVar) -> Result<GenVar, CompilationError> {
        self.inner.count("same_as");
        self.load(Register::RAX, gv)?;
        self.push_result()
    }

    fn enter_next_block(
        &mut self,
        _kinds: &[LLType],
        args: &mut [GenVar],
    ) -> Result<BlockDesc, CompilationError> {
        let mut arg_positions = Vec::with_capacity(args.len());
        for gv in args.iter_mut() {
            match *gv {
                GenVar::Var(p) if !arg_positions.contains(&p) => arg_positions.push(p),
                _ => {
                    self.load(Register::RAX, *gv)?;
                    *gv = self.push_result()?;
                    arg_positions.push(self.stackdepth - 1);
                }
            }
        }
        Ok(BlockDesc {
            startaddr: self.tell()?,
            arg_positions,
            stackdepth: self.stackdepth,
        })
    }

    fn jump_if_false(&mut self, gv: GenVar) -> Result<Box<dyn GenBuilder>, CompilationError> {
        self.branch(gv, Code::Je_rel32_64)
    }

    fn jump_if_true(&mut self, gv: GenVar) -> Result<Box<dyn GenBuilder>, CompilationError> {
        self.branch(gv, Code::Jne_rel32_64)
    }

    fn finish_and_goto(
        &mut self,
        args: &[GenVar],
        target: &BlockDesc,
    ) -> Result<(), CompilationError> {
        let plan = remap::plan(
            self.stackdepth,
            args,
            &target.arg_positions,
            target.stackdepth,
        )?;
        self.adjust_rsp(-signed::<isize>(plan.grow)?)?;
        self.stackdepth += plan.grow;
        for m in plan.moves {
            match m {
                Move::Copy { src, dst } => {
                    self.load(Register::RAX, src)?;
                    self.store(dst, Register::RAX)?;
                }
                Move::Save { src } => self.load(Register::RDX, GenVar::Var(src))?,
                Move::Restore { dst } => self.store(dst, Register::RDX)?,
            }
        }
        self.adjust_rsp(signed::<isize>(plan.shrink)?)?;
        self.stackdepth -= plan.shrink;
        self.emit(Op::with_branch(Code::Jmp_rel32_64, target.startaddr as u64))?;
        self.close();
        Ok(())
    }

    fn finish_and_return(&mut self, gv: GenVar) -> Result<(), CompilationError> {
        self.load(Register::RAX, gv)?;
        self.adjust_rsp(signed::<isize>(self.stackdepth - 1)?)?;
        self.emit(Ok(Op::with(Code::Retnq)))?;
        self.close();
        Ok(())
    }

    fn flexswitch(&mut self, gv: GenVar) -> Result<Box<dyn FlexSwitch>, CompilationError> {
        self.load(Register::RAX, gv)?;
        let mc = self
            .mc
            .as_mut()
            .ok_or_else(|| CompilationError::InternalError("builder used after closing".into()))?;
        let sw = X64FlexSwitch::new(Rc::clone(&self.inner), self.stackdepth, mc)?;
        self.close();
        Ok(Box::new(sw))
    }

    fn end(&mut self) -> Result<(), CompilationError> {
        self.close();
        Ok(())
    }
}

/// The memory operand `[rax + rcx * itemsize + itemsoffset]`.
fn item_operand(token: ArrayToken) -> Result<MemoryOperand, CompilationError> {
    match token.itemsize {
        1 | 2 | 4 | 8 => Ok(MemoryOperand::with_base_index_scale_displ_size(
            Register::RAX,
            Register::RCX,
            token.itemsize as u32,
            token.itemsoffset,
            1,
        )),
        x => Err(CompilationError::InternalError(format!(
            "unsupported array item size {x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{asm::tests::disassemble, *};
    use crate::lltype::{call_native, read_item, read_word};
    use fm::{FMBuilder, FMatcher};
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        /// Use `{{name}}` to match a register or immediate in tests.
        static ref PTN_RE: Regex = {
            Regex::new(r"\{\{.+?\}\}").unwrap()
        };

        static ref TEXT_RE: Regex = {
            Regex::new(r"[a-zA-Z0-9\._]+").unwrap()
        };
    }

    fn fmatcher(ptn: &str) -> FMatcher<'_> {
        FMBuilder::new(ptn)
            .unwrap()
            .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
            .build()
            .unwrap()
    }

    pub(super) fn rgenop() -> X64RGenOp {
        X64RGenOp::new(&Config::default(), Rc::new(Stats::new())).unwrap()
    }

    fn call(entry: usize, args: &[i64]) -> i64 {
        unsafe { call_native(entry as i64, args) }.unwrap()
    }

    /// Build `fn(a, b) = a <op> b`.
    fn binop_fn(rgenop: &X64RGenOp, op: LLOp) -> usize {
        let (mut b, entry, args) = rgenop.newgraph(2, op.opname()).unwrap();
        let r = b.genop2(op, args[0], args[1]).unwrap();
        b.finish_and_return(r).unwrap();
        entry
    }

    #[test]
    fn adder() {
        let rgenop = rgenop();
        let entry = binop_fn(&rgenop, LLOp::IntAdd);
        assert_eq!(call(entry, &[3, 4]), 7);
        assert_eq!(call(entry, &[i64::MAX, 1]), i64::MIN);
        assert_eq!(rgenop.insns(), HashMap::from([("int_add", 1)]));
        rgenop.reset_insns();
        assert!(rgenop.insns().is_empty());
    }

    #[test]
    fn binops_agree_with_folding() {
        let rgenop = rgenop();
        let vals = [-7, -1, 0, 1, 3, 64, 1000];
        for op in [
            LLOp::IntAdd,
            LLOp::IntSub,
            LLOp::IntMul,
            LLOp::IntFloorDiv,
            LLOp::IntMod,
            LLOp::IntAnd,
            LLOp::IntOr,
            LLOp::IntXor,
            LLOp::IntLshift,
            LLOp::IntRshift,
            LLOp::IntLt,
            LLOp::IntLe,
            LLOp::IntEq,
            LLOp::IntNe,
            LLOp::IntGt,
            LLOp::IntGe,
        ] {
            let entry = binop_fn(&rgenop, op);
            for x in vals {
                for y in vals {
                    if matches!(op, LLOp::IntFloorDiv | LLOp::IntMod) && y == 0 {
                        continue;
                    }
                    assert_eq!(
                        call(entry, &[x, y]),
                        op.fold(&[x, y]).unwrap(),
                        "{}({x}, {y})",
                        op.opname()
                    );
                }
            }
        }
    }

    #[test]
    fn unops_agree_with_folding() {
        let rgenop = rgenop();
        for op in [
            LLOp::IntNeg,
            LLOp::IntInvert,
            LLOp::IntIsTrue,
            LLOp::BoolNot,
            LLOp::CastIntToChar,
            LLOp::CastBoolToInt,
        ] {
            let (mut b, entry, args) = rgenop.newgraph(1, op.opname()).unwrap();
            let r = b.genop1(op, args[0]).unwrap();
            b.finish_and_return(r).unwrap();
            for x in [-300, -1, 0, 1, 2, 300] {
                assert_eq!(call(entry, &[x]), op.fold(&[x]).unwrap(), "{}({x})", op.opname());
            }
        }
        let (mut b, _, args) = rgenop.newgraph(1, "bad").unwrap();
        assert!(b.genop1(LLOp::IntAdd, args[0]).is_err());
    }

    #[test]
    fn increment_asm() {
        let rgenop = rgenop();
        let (mut b, entry, args) = rgenop.newgraph(1, "inc").unwrap();
        let r = b.genop2(LLOp::IntAdd, args[0], GenVar::Const(1)).unwrap();
        b.finish_and_return(r).unwrap();
        let dis = disassemble(entry, 64);
        let ret = dis.iter().position(|x| x == "ret").unwrap();
        let fmm = fmatcher(
            "push {{arg}}
mov rax, [rsp]
mov {{tmp}}, 1
add rax, {{tmp}}
push rax
mov rax, [rsp]
add rsp, 0x10
ret",
        );
        if let Err(e) = fmm.matches(&dis[..=ret].join("\n")) {
            panic!("{e}");
        }
        assert_eq!(call(entry, &[41]), 42);
    }

    #[test]
    fn branches() {
        let rgenop = rgenop();
        let (mut b, entry, args) = rgenop.newgraph(1, "pick").unwrap();
        let mut fb = b.jump_if_false(args[0]).unwrap();
        fb.finish_and_return(GenVar::Const(2)).unwrap();
        b.finish_and_return(GenVar::Const(1)).unwrap();
        assert_eq!(call(entry, &[5]), 1);
        assert_eq!(call(entry, &[0]), 2);

        let (mut b, entry, args) = rgenop.newgraph(1, "pick2").unwrap();
        let mut tb = b.jump_if_true(args[0]).unwrap();
        tb.finish_and_return(args[0]).unwrap();
        b.finish_and_return(GenVar::Const(-1)).unwrap();
        assert_eq!(call(entry, &[5]), 5);
        assert_eq!(call(entry, &[0]), -1);
    }

    #[test]
    fn summing_loop() {
        let rgenop = rgenop();
        let (mut b, entry, args) = rgenop.newgraph(1, "sum").unwrap();
        let mut vars = [GenVar::Const(0), args[0]];
        let bd = b
            .enter_next_block(&[LLType::Signed, LLType::Signed], &mut vars)
            .unwrap();
        assert!(vars.iter().all(|x| !x.is_const()));
        let [acc, i] = vars;
        let cond = b.genop1(LLOp::IntIsTrue, i).unwrap();
        let mut done = b.jump_if_false(cond).unwrap();
        done.finish_and_return(acc).unwrap();
        let acc2 = b.genop2(LLOp::IntAdd, acc, i).unwrap();
        let i2 = b.genop2(LLOp::IntSub, i, GenVar::Const(1)).unwrap();
        b.finish_and_goto(&[acc2, i2], &bd).unwrap();
        assert_eq!(call(entry, &[10]), 55);
        assert_eq!(call(entry, &[0]), 0);
    }

    #[test]
    fn goto_swaps_and_grows() {
        // A loop that swaps its two variables n times, reaching its header from a shallower
        // frame the first time round.
        let rgenop = rgenop();
        let (mut b, entry, args) = rgenop.newgraph(3, "swap").unwrap();
        let mut vars = [args[0], args[1], args[2]];
        let bd = b
            .enter_next_block(&[const { LLType::Signed }; 3], &mut vars)
            .unwrap();
        let [x, y, n] = vars;
        let mut done = b.jump_if_false(n).unwrap();
        let r = done.genop2(LLOp::IntSub, x, y).unwrap();
        done.finish_and_return(r).unwrap();
        let n2 = b.genop2(LLOp::IntSub, n, GenVar::Const(1)).unwrap();
        b.finish_and_goto(&[y, x, n2], &bd).unwrap();
        assert_eq!(call(entry, &[10, 3, 0]), 7);
        assert_eq!(call(entry, &[10, 3, 1]), -7);
        assert_eq!(call(entry, &[10, 3, 4]), 7);

        let (mut b, entry, args) = rgenop.newgraph(1, "grow").unwrap();
        let one = b.genop_same_as(GenVar::Const(1)).unwrap();
        let mut vars = [args[0], one, GenVar::Const(5)];
        let bd = b
            .enter_next_block(&[const { LLType::Signed }; 3], &mut vars)
            .unwrap();
        let s = b.genop2(LLOp::IntAdd, vars[0], vars[1]).unwrap();
        let s = b.genop2(LLOp::IntAdd, s, vars[2]).unwrap();
        b.finish_and_return(s).unwrap();
        // A second entry jumping into the block with constants only.
        let (mut c, entry2, _) = rgenop.newgraph(0, "into").unwrap();
        c.finish_and_goto(
            &[GenVar::Const(100), GenVar::Const(20), GenVar::Const(3)],
            &bd,
        )
        .unwrap();
        assert_eq!(call(entry, &[10]), 16);
        assert_eq!(call(entry2, &[]), 123);
    }

    extern "C" fn sub3(a: i64, b: i64, c: i64) -> i64 {
        a - b - c
    }

    #[test]
    fn calls_at_either_parity() {
        let rgenop = rgenop();
        let f = GenVar::Const(sub3 as extern "C" fn(i64, i64, i64) -> i64 as usize as i64);
        for extra in 0..2 {
            let (mut b, entry, args) = rgenop.newgraph(2, "caller").unwrap();
            for _ in 0..extra {
                b.genop_same_as(GenVar::Const(0)).unwrap();
            }
            let r = b
                .genop_call(f, &[args[0], GenVar::Const(10), args[1]])
                .unwrap();
            b.finish_and_return(r).unwrap();
            assert_eq!(call(entry, &[100, 1]), 89);
        }
        let (mut b, _, _) = rgenop.newgraph(0, "toomany").unwrap();
        assert!(matches!(
            b.genop_call(f, &[GenVar::Const(0); 7]),
            Err(CompilationError::LimitExceeded(_))
        ));
        assert!(matches!(
            rgenop.newgraph(7, "toomany"),
            Err(CompilationError::LimitExceeded(_))
        ));
    }

    #[test]
    fn structs_and_arrays() {
        let rgenop = rgenop();
        let (mut b, entry, args) = rgenop.newgraph(1, "mkstruct").unwrap();
        let p = b.genop_malloc_fixedsize(16).unwrap();
        b.genop_setfield(8, p, args[0]).unwrap();
        let v = b.genop_getfield(8, p).unwrap();
        let v = b.genop2(LLOp::IntMul, v, GenVar::Const(2)).unwrap();
        b.genop_setfield(0, p, v).unwrap();
        b.finish_and_return(p).unwrap();
        let p = call(entry, &[21]);
        assert_eq!(read_word(p, 0).unwrap(), 42);
        assert_eq!(read_word(p, 8).unwrap(), 21);

        let t = ArrayToken::WORDS;
        let (mut b, entry, args) = rgenop.newgraph(2, "mkarray").unwrap();
        let a = b.genop_malloc_varsize(t, args[0]).unwrap();
        b.genop_setarrayitem(t, a, GenVar::Const(1), args[1]).unwrap();
        let x = b.genop_getarrayitem(t, a, GenVar::Const(1)).unwrap();
        let n = b.genop_getarraysize(t, a).unwrap();
        let x = b.genop2(LLOp::IntAdd, x, n).unwrap();
        b.genop_setarrayitem(t, a, GenVar::Const(2), x).unwrap();
        b.finish_and_return(a).unwrap();
        let a = call(entry, &[3, 7]);
        assert_eq!(read_word(a, 0).unwrap(), 3);
        assert_eq!(read_item(a, 0).unwrap(), 0);
        assert_eq!(read_item(a, 1).unwrap(), 7);
        assert_eq!(read_item(a, 2).unwrap(), 10);

        let insns = rgenop.insns();
        for k in [
            "malloc",
            "malloc_varsize",
            "getfield",
            "setfield",
            "getarrayitem",
            "setarrayitem",
            "getarraysize",
        ] {
            assert!(insns.contains_key(k), "{k}");
        }
    }

    #[test]
    fn used_after_close() {
        let rgenop = rgenop();
        let (mut b, _, args) = rgenop.newgraph(1, "closed").unwrap();
        b.finish_and_return(args[0]).unwrap();
        let e = b.genop_same_as(args[0]).unwrap_err();
        assert!(Regex::new("closing").unwrap().is_match(&e.to_string()));
    }

    #[test]
    fn stack_offsets_must_fit() {
        assert_eq!(signed::<i64>(3).unwrap(), 3);
        assert!(matches!(
            signed::<isize>(usize::MAX),
            Err(CompilationError::InternalError(_))
        ));
    }
}
