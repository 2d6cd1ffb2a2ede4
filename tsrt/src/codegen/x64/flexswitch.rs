//! Flexswitches: a dispatch on `rax` that keeps growing cases after its code has started running.
//!
//! A region of `ud2`s is reserved where the switch is emitted. Each case is appended to the
//! region as `mov r11, <value>; cmp rax, r11; je <case>` and is always followed by a trailer that
//! either jumps to the default case or, if there is none yet, traps. When a region fills up, a
//! new one is reserved elsewhere and the old trailer becomes a jump to it.

use super::{asm::Asm, Builder, Inner};
use crate::{
    codegen::{codebuf::MachineCodeBlock, FlexSwitch, GenBuilder},
    error::CompilationError,
};
use iced_x86::{Code, Instruction as Op, Register};
use std::rc::Rc;

/// The size in bytes of each reserved region.
const RESERVED: usize = 158;
/// `mov r11, imm64` (10) + `cmp rax, r11` (3) + `je rel32` (6).
const CASE_SIZE: usize = 19;
/// `jmp rel32`.
const JMP_SIZE: usize = 5;
const UD2: [u8; 2] = [0x0F, 0x0B];

pub(super) struct X64FlexSwitch {
    inner: Rc<Inner>,
    /// The stack depth every case starts at.
    stackdepth: usize,
    /// Where the next case (or the trailer) goes.
    nextfreepos: usize,
    endfreepos: usize,
    default_addr: Option<usize>,
    asm: Asm,
}

impl X64FlexSwitch {
    /// Start a switch at the cursor of `mc`, which must have already loaded the switched value
    /// into `rax`.
    pub(super) fn new(
        inner: Rc<Inner>,
        stackdepth: usize,
        mc: &mut MachineCodeBlock,
    ) -> Result<Self, CompilationError> {
        let (nextfreepos, endfreepos) = reserve(mc)?;
        Ok(Self {
            inner,
            stackdepth,
            nextfreepos,
            endfreepos,
            default_addr: None,
            asm: Asm::new(),
        })
    }

    fn write_trailer(&mut self) -> Result<(), CompilationError> {
        let mut region = MachineCodeBlock::over(self.nextfreepos, self.endfreepos);
        match self.default_addr {
            Some(addr) => self.asm.push_inst(
                &mut region,
                Op::with_branch(Code::Jmp_rel32_64, addr as u64),
            )?,
            None => self.asm.push_inst(&mut region, Ok(Op::with(Code::Ud2)))?,
        }
        self.inner.dump_patch(region);
        Ok(())
    }

    /// Move the tail of the switch to a freshly reserved region.
    fn reserve_more(&mut self) -> Result<(), CompilationError> {
        let mut mc = self.inner.open_mc()?;
        let r = reserve(&mut mc);
        self.inner.close_mc(mc);
        let (start, end) = r?;
        let mut region = MachineCodeBlock::over(self.nextfreepos, self.endfreepos);
        self.asm.push_inst(
            &mut region,
            Op::with_branch(Code::Jmp_rel32_64, start as u64),
        )?;
        self.inner.dump_patch(region);
        self.nextfreepos = start;
        self.endfreepos = end;
        self.write_trailer()
    }
}

/// Fill `RESERVED` bytes of `mc` with `ud2`s, returning the region.
fn reserve(mc: &mut MachineCodeBlock) -> Result<(usize, usize), CompilationError> {
    let start = mc.tell();
    mc.write(&UD2.repeat(RESERVED / UD2.len()))?;
    Ok((start, mc.tell()))
}

impl FlexSwitch for X64FlexSwitch {
    fn add_case(&mut self, value: i64) -> Result<Box<dyn GenBuilder>, CompilationError> {
        if self.nextfreepos + CASE_SIZE + JMP_SIZE > self.endfreepos {
            self.reserve_more()?;
        }
        let target = Builder::open(Rc::clone(&self.inner), self.stackdepth)?;
        let addr = target.tell()?;
        let mut region = MachineCodeBlock::over(self.nextfreepos, self.endfreepos);
        self.asm.log(&format!("flexswitch case {value}"));
        self.asm.push_inst(
            &mut region,
            Op::with2(Code::Mov_r64_imm64, Register::R11, value),
        )?;
        self.asm.push_inst(
            &mut region,
            Op::with2(Code::Cmp_r64_rm64, Register::RAX, Register::R11),
        )?;
        self.asm
            .push_inst(&mut region, Op::with_branch(Code::Je_rel32_64, addr as u64))?;
        self.nextfreepos = region.tell();
        self.inner.dump_patch(region);
        self.write_trailer()?;
        self.inner.count("flexswitch_case");
        self.inner.stats.flexswitch_arm();
        Ok(Box::new(target))
    }

    fn add_default(&mut self) -> Result<Box<dyn GenBuilder>, CompilationError> {
        let target = Builder::open(Rc::clone(&self.inner), self.stackdepth)?;
        self.default_addr = Some(target.tell()?);
        self.write_trailer()?;
        Ok(Box::new(target))
    }
}
