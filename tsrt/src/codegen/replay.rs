//! A builder that generates nothing, used to rebuild the specializer's state when resuming from a
//! promotion point: the replayed path has already been compiled, so only the boxes matter.

use super::{ArrayToken, BlockDesc, FlexSwitch, GenBuilder, GenVar};
use crate::{
    error::CompilationError,
    lltype::{LLOp, LLType},
};

pub(crate) struct ReplayBuilder {
    stackdepth: usize,
}

impl ReplayBuilder {
    pub(crate) fn new(block: &BlockDesc, kinds: &[LLType]) -> (Self, Vec<GenVar>) {
        debug_assert_eq!(kinds.len(), block.arg_positions.len());
        let vars = block
            .arg_positions
            .iter()
            .map(|p| GenVar::Var(*p))
            .collect();
        (
            Self {
                stackdepth: block.stackdepth,
            },
            vars,
        )
    }

    /// A placeholder for a value that would have been computed.
    fn returnvar(&mut self) -> GenVar {
        let gv = GenVar::Var(self.stackdepth);
        self.stackdepth += 1;
        gv
    }
}

impl GenBuilder for ReplayBuilder {
    fn genop1(&mut self, _op: LLOp, _gv: GenVar) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop2(&mut self, _op: LLOp, _: GenVar, _: GenVar) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop_getfield(&mut self, _: i64, _: GenVar) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop_setfield(&mut self, _: i64, _: GenVar, _: GenVar) -> Result<(), CompilationError> {
        Ok(())
    }

    fn genop_getarrayitem(
        &mut self,
        _: ArrayToken,
        _: GenVar,
        _: GenVar,
    ) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop_setarrayitem(
        &mut self,
        _: ArrayToken,
        _: GenVar,
        _: GenVar,
        _: GenVar,
    ) -> Result<(), CompilationError> {
        Ok(())
    }

    fn genop_getarraysize(&mut self, _: ArrayToken, _: GenVar) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop_malloc_fixedsize(&mut self, _: i64) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop_malloc_varsize(&mut self, _: ArrayToken, _: GenVar) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop_call(&mut self, _: GenVar, _: &[GenVar]) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
    }

    fn genop_same_as(&mut self, _: GenVar) -> Result<GenVar, CompilationError> {
        Ok(self.returnvar())
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
                    *gv = self.returnvar();
                    if let GenVar::Var(p) = *gv {
                        arg_positions.push(p);
                    }
                }
            }
        }
        Ok(BlockDesc {
            startaddr: 0,
            arg_positions,
            stackdepth: self.stackdepth,
        })
    }

    fn jump_if_false(&mut self, _: GenVar) -> Result<Box<dyn GenBuilder>, CompilationError> {
        Ok(Box::new(ReplayBuilder {
            stackdepth: self.stackdepth,
        }))
    }

    fn jump_if_true(&mut self, _: GenVar) -> Result<Box<dyn GenBuilder>, CompilationError> {
        Ok(Box::new(ReplayBuilder {
            stackdepth: self.stackdepth,
        }))
    }

    fn finish_and_goto(&mut self, _: &[GenVar], _: &BlockDesc) -> Result<(), CompilationError> {
        Ok(())
    }

    fn finish_and_return(&mut self, _: GenVar) -> Result<(), CompilationError> {
        Ok(())
    }

    fn flexswitch(&mut self, _: GenVar) -> Result<Box<dyn FlexSwitch>, CompilationError> {
        Ok(Box::new(ReplayFlexSwitch {
            stackdepth: self.stackdepth,
        }))
    }

    fn end(&mut self) -> Result<(), CompilationError> {
        Ok(())
    }
}

struct ReplayFlexSwitch {
    stackdepth: usize,
}

impl FlexSwitch for ReplayFlexSwitch {
    fn add_case(&mut self, _: i64) -> Result<Box<dyn GenBuilder>, CompilationError> {
        Ok(Box::new(ReplayBuilder {
            stackdepth: self.stackdepth,
        }))
    }

    fn add_default(&mut self) -> Result<Box<dyn GenBuilder>, CompilationError> {
        Ok(Box::new(ReplayBuilder {
            stackdepth: self.stackdepth,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_variables() {
        let block = BlockDesc {
            startaddr: 0,
            arg_positions: vec![1, 3],
            stackdepth: 4,
        };
        let (mut b, vars) = ReplayBuilder::new(&block, &[LLType::Signed, LLType::Signed]);
        assert_eq!(vars, vec![GenVar::Var(1), GenVar::Var(3)]);
        let r = b.genop2(LLOp::IntAdd, vars[0], GenVar::Const(1)).unwrap();
        assert_eq!(r, GenVar::Var(4));
        let mut args = [GenVar::Const(3), r, r];
        let bd = b
            .enter_next_block(&[LLType::Signed, LLType::Signed, LLType::Signed], &mut args)
            .unwrap();
        assert!(args.iter().all(|gv| !gv.is_const()));
        assert_eq!(bd.arg_positions, vec![5, 4, 6]);
    }
}
