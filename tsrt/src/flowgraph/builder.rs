//! A small API for building [Graph]s by hand.

use super::{Arg, Block, BlockIdx, ExitCase, Graph, Link, OpKind, SpaceOp, VarIdx, VarInfo};
use crate::{error::CompilationError, lltype::LLType};
use index_vec::IndexVec;

pub struct GraphBuilder {
    graph: Graph<OpKind>,
}

impl GraphBuilder {
    /// Start a graph taking arguments of types `args` and returning `result`.
    pub fn new(name: &str, args: &[LLType], result: LLType) -> Self {
        let mut vars = IndexVec::new();
        let mut blocks = IndexVec::new();
        let inputargs = args
            .iter()
            .map(|t| vars.push(VarInfo { ty: t.clone() }))
            .collect::<Vec<_>>();
        let startblock = blocks.push(Block::new(inputargs));
        let retvar = vars.push(VarInfo { ty: result });
        let returnblock = blocks.push(Block::new(vec![retvar]));
        Self {
            graph: Graph {
                name: name.to_owned(),
                vars,
                blocks,
                startblock,
                returnblock,
            },
        }
    }

    pub fn args(&self) -> Vec<VarIdx> {
        self.graph.getargs().to_vec()
    }

    pub fn startblock(&self) -> BlockIdx {
        self.graph.startblock
    }

    pub fn returnblock(&self) -> BlockIdx {
        self.graph.returnblock
    }

    /// Create a block with input arguments of types `args`.
    pub fn new_block(&mut self, args: &[LLType]) -> (BlockIdx, Vec<VarIdx>) {
        let inputargs = args
            .iter()
            .map(|t| self.graph.new_var(t.clone()))
            .collect::<Vec<_>>();
        (self.graph.new_block(inputargs.clone()), inputargs)
    }

    /// Append an operation to `block`, returning its result variable.
    pub fn op(&mut self, block: BlockIdx, kind: OpKind, args: Vec<Arg>, result: LLType) -> VarIdx {
        let result = self.graph.new_var(result);
        self.graph.blocks[block]
            .operations
            .push(SpaceOp { kind, args, result });
        result
    }

    /// Close `block` with an unconditional jump to `target`.
    pub fn goto(&mut self, block: BlockIdx, target: BlockIdx, args: Vec<Arg>) {
        let b = &mut self.graph.blocks[block];
        b.exitswitch = None;
        b.exits = vec![Link::new(args, target)];
    }

    /// Close `block` with a boolean switch on `cond`.
    pub fn branch(
        &mut self,
        block: BlockIdx,
        cond: Arg,
        iftrue: (BlockIdx, Vec<Arg>),
        iffalse: (BlockIdx, Vec<Arg>),
    ) {
        let b = &mut self.graph.blocks[block];
        b.exitswitch = Some(cond);
        b.exits = vec![
            Link {
                args: iffalse.1,
                target: iffalse.0,
                exitcase: Some(ExitCase::Bool(false)),
            },
            Link {
                args: iftrue.1,
                target: iftrue.0,
                exitcase: Some(ExitCase::Bool(true)),
            },
        ];
    }

    /// Close `block` with a multi-way switch on `value`.
    pub fn switch(&mut self, block: BlockIdx, value: Arg, cases: Vec<(ExitCase, BlockIdx, Vec<Arg>)>) {
        let b = &mut self.graph.blocks[block];
        b.exitswitch = Some(value);
        b.exits = cases
            .into_iter()
            .map(|(case, target, args)| Link {
                args,
                target,
                exitcase: Some(case),
            })
            .collect();
    }

    /// Close `block` by returning `value`.
    pub fn ret(&mut self, block: BlockIdx, value: Arg) {
        let rb = self.graph.returnblock;
        self.goto(block, rb, vec![value]);
    }

    pub fn finish(self) -> Result<Graph<OpKind>, CompilationError> {
        self.graph.check()?;
        Ok(self.graph)
    }
}
