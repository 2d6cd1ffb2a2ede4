//! The code generation interface the timeshifter drives, and its implementations.
//!
//! Code is generated one basic block at a time by a [GenBuilder]. Values are named by
//! [GenVar]s: either an immediate constant or a position in the builder's operand stack. Every
//! operation pushes its result as a new stack slot, so there is no register allocation at all.

use crate::{
    error::CompilationError,
    lltype::{LLOp, LLType, WORD},
};
use std::collections::HashMap;

pub(crate) mod codebuf;
pub(crate) mod remap;
pub(crate) mod replay;
pub mod x64;

/// A position in a builder's operand stack, counted from the bottom of the frame. Position 0
/// holds the return address.
pub type StackPos = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenVar {
    Var(StackPos),
    Const(i64),
}

impl GenVar {
    pub fn is_const(&self) -> bool {
        matches!(self, GenVar::Const(_))
    }

    pub fn revealconst(&self) -> Option<i64> {
        match self {
            GenVar::Const(x) => Some(*x),
            GenVar::Var(_) => None,
        }
    }
}

/// The entry point of a generated block, and the stack layout it expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDesc {
    pub startaddr: usize,
    /// Where each of the block's input values lives.
    pub arg_positions: Vec<StackPos>,
    pub stackdepth: usize,
}

/// The memory layout of an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayToken {
    pub lengthoffset: i64,
    pub itemsoffset: i64,
    pub itemsize: i64,
}

impl ArrayToken {
    /// The layout every array in tsrt uses.
    pub const WORDS: ArrayToken = ArrayToken {
        lengthoffset: 0,
        itemsoffset: WORD,
        itemsize: WORD,
    };
}

/// A cursor generating one basic block.
pub trait GenBuilder {
    fn genop1(&mut self, op: LLOp, gv: GenVar) -> Result<GenVar, CompilationError>;
    fn genop2(&mut self, op: LLOp, gv1: GenVar, gv2: GenVar) -> Result<GenVar, CompilationError>;
    fn genop_getfield(&mut self, offset: i64, ptr: GenVar) -> Result<GenVar, CompilationError>;
    fn genop_setfield(
        &mut self,
        offset: i64,
        ptr: GenVar,
        value: GenVar,
    ) -> Result<(), CompilationError>;
    fn genop_getarrayitem(
        &mut self,
        token: ArrayToken,
        ptr: GenVar,
        index: GenVar,
    ) -> Result<GenVar, CompilationError>;
    fn genop_setarrayitem(
        &mut self,
        token: ArrayToken,
        ptr: GenVar,
        index: GenVar,
        value: GenVar,
    ) -> Result<(), CompilationError>;
    fn genop_getarraysize(
        &mut self,
        token: ArrayToken,
        ptr: GenVar,
    ) -> Result<GenVar, CompilationError>;
    /// Allocate a zeroed struct of `size` bytes.
    fn genop_malloc_fixedsize(&mut self, size: i64) -> Result<GenVar, CompilationError>;
    /// Allocate a zeroed array of `length` items and store its length.
    fn genop_malloc_varsize(
        &mut self,
        token: ArrayToken,
        length: GenVar,
    ) -> Result<GenVar, CompilationError>;
    /// Call the native function at address `fnaddr` with word arguments.
    fn genop_call(&mut self, fnaddr: GenVar, args: &[GenVar]) -> Result<GenVar, CompilationError>;
    fn genop_same_as(&mut self, gv: GenVar) -> Result<GenVar, CompilationError>;

    /// Start a new block whose inputs are `args`. Constants and duplicated variables in `args`
    /// are first copied into fresh slots, and `args` is updated in place.
    fn enter_next_block(
        &mut self,
        kinds: &[LLType],
        args: &mut [GenVar],
    ) -> Result<BlockDesc, CompilationError>;
    /// Jump to a new builder (returned) if `gv` is zero; otherwise keep going in `self`.
    fn jump_if_false(&mut self, gv: GenVar) -> Result<Box<dyn GenBuilder>, CompilationError>;
    /// Jump to a new builder (returned) if `gv` is non-zero; otherwise keep going in `self`.
    fn jump_if_true(&mut self, gv: GenVar) -> Result<Box<dyn GenBuilder>, CompilationError>;
    /// Close this builder with a jump to `target`, moving `args` into its input layout.
    fn finish_and_goto(
        &mut self,
        args: &[GenVar],
        target: &BlockDesc,
    ) -> Result<(), CompilationError>;
    /// Close this builder by returning `gv` from the generated function.
    fn finish_and_return(&mut self, gv: GenVar) -> Result<(), CompilationError>;
    /// Close this builder with a multi-way dispatch on `gv`.
    fn flexswitch(&mut self, gv: GenVar) -> Result<Box<dyn FlexSwitch>, CompilationError>;
    /// Close this builder without emitting anything further.
    fn end(&mut self) -> Result<(), CompilationError>;
}

/// A multi-way dispatch that can grow new cases after code has started running.
pub trait FlexSwitch {
    /// Add a case for `value`, returning a builder for its code.
    fn add_case(&mut self, value: i64) -> Result<Box<dyn GenBuilder>, CompilationError>;
    /// Add the default case, returning a builder for its code.
    fn add_default(&mut self) -> Result<Box<dyn GenBuilder>, CompilationError>;
}

/// A code generator: creates graphs and builders.
pub trait RGenOp {
    /// Start a new function of `nargs` word arguments. Returns the builder of its first block,
    /// the function's entry address, and the variables holding its arguments.
    fn newgraph(
        &self,
        nargs: usize,
        name: &str,
    ) -> Result<(Box<dyn GenBuilder>, usize, Vec<GenVar>), CompilationError>;

    /// A builder that generates no code but otherwise behaves as if it had started at `block`,
    /// together with placeholder variables for the block's inputs.
    fn replay(&self, block: &BlockDesc, kinds: &[LLType]) -> (Box<dyn GenBuilder>, Vec<GenVar>);

    /// How many of each abstract operation have been generated so far.
    fn insns(&self) -> HashMap<&'static str, usize>;

    fn reset_insns(&self);
}
