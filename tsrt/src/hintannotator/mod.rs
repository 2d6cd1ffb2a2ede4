//! The hint annotator: decides which values of a program are known at specialization time.
//!
//! Starting from the portal graph and the colours of its arguments, the annotator computes an
//! [HValue] for every variable of a set of specialized copies of the program's graphs, iterating
//! until nothing changes. A block is (re)flowed whenever the annotations of its input arguments
//! are generalized, or whenever a fact that one of its operations depended on changes (an origin
//! becoming fixed, a callee's return value being generalized, or a container field being
//! written). Calls are annotated against a copy of the callee chosen by [bookkeeper::SpecKey], so
//! the same graph can be green in one context and red in another.

use crate::{
    error::CompilationError,
    flowgraph::{Arg, BlockIdx, Graph, GraphIdx, OpKind, Program, VarIdx},
    log::{log_ir, should_log_ir, IRPhase},
};
use index_vec::IndexVec;
use std::collections::{HashMap, HashSet, VecDeque};

mod bookkeeper;
mod container;
pub mod model;

use bookkeeper::{Bookkeeper, SpecKey};
use container::ContainerDef;
pub use model::{HValue, Position};
use model::ContainerIdx;

index_vec::define_index_type! {
    pub struct HGraphIdx = u32;
}

/// What the annotator may assume about the program.
#[derive(Clone, Debug, Default)]
pub struct HintPolicy {
    /// Never treat allocations as virtual structs: every pointer is red.
    pub novirtualcontainer: bool,
    dont_look_inside: HashSet<GraphIdx>,
}

impl HintPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy which calls `graphs` residually instead of looking inside them. Like all policies
    /// that stop somewhere, it also disables virtual structs.
    pub fn stop_at(graphs: &[GraphIdx]) -> Self {
        Self {
            novirtualcontainer: true,
            dont_look_inside: graphs.iter().copied().collect(),
        }
    }

    pub fn with_novirtualcontainer(mut self, novirtualcontainer: bool) -> Self {
        self.novirtualcontainer = novirtualcontainer;
        self
    }

    /// Should calls to `graph` be annotated (and later specialized) rather than left residual?
    pub fn look_inside(&self, graph: GraphIdx) -> bool {
        !self.dont_look_inside.contains(&graph)
    }
}

/// A specialized copy of a program graph, with the annotation of each of its variables.
#[derive(Debug)]
pub struct HGraph {
    /// The program graph this is a copy of.
    pub origgraph: GraphIdx,
    pub graph: Graph<OpKind>,
    pub(crate) bindings: IndexVec<VarIdx, Option<HValue>>,
}

pub struct HintAnnotator<'a> {
    program: &'a Program,
    pub(crate) policy: HintPolicy,
    pub(crate) bookkeeper: Bookkeeper,
    pub(crate) containers: IndexVec<ContainerIdx, ContainerDef>,
    pub(crate) hgraphs: IndexVec<HGraphIdx, HGraph>,
    /// The copies each call position may reach. Residual calls map to an empty list.
    pub(crate) call_targets: HashMap<Position, Vec<HGraphIdx>>,
    pending: VecDeque<(HGraphIdx, BlockIdx)>,
    pending_set: HashSet<(HGraphIdx, BlockIdx)>,
    /// Blocks whose flow stopped at an operation with no possible result yet, and that operation's
    /// index.
    blocked: HashMap<(HGraphIdx, BlockIdx), usize>,
    /// The positions reading each graph's return value.
    notify: HashMap<HGraphIdx, HashSet<Position>>,
}

impl<'a> HintAnnotator<'a> {
    pub fn new(program: &'a Program, policy: HintPolicy) -> Self {
        Self {
            program,
            policy,
            bookkeeper: Bookkeeper::default(),
            containers: IndexVec::new(),
            hgraphs: IndexVec::new(),
            call_targets: HashMap::new(),
            pending: VecDeque::new(),
            pending_set: HashSet::new(),
            blocked: HashMap::new(),
            notify: HashMap::new(),
        }
    }

    /// Annotate `graph`, and everything it calls, given the annotations of its arguments. Returns
    /// the annotated copy of `graph`.
    pub fn build_types(
        &mut self,
        graph: GraphIdx,
        args: &[HValue],
    ) -> Result<HGraphIdx, CompilationError> {
        let mut inputs = args.to_vec();
        let hg = self.specialize(graph, SpecKey::Default, &mut inputs)?;
        let start = self.hgraphs[hg].graph.startblock;
        self.mergeinputargs(hg, start, &inputs)?;
        self.complete()?;
        if should_log_ir(IRPhase::Hint) {
            for h in self.hgraphs.indices() {
                log_ir(&self.render(h));
            }
        }
        Ok(hg)
    }

    pub fn hgraph(&self, hg: HGraphIdx) -> &HGraph {
        &self.hgraphs[hg]
    }

    pub fn hgraphs(&self) -> impl Iterator<Item = (HGraphIdx, &HGraph)> {
        self.hgraphs.iter_enumerated()
    }

    /// The annotation of `v`, or `None` if no value ever reached it.
    pub fn binding(&self, hg: HGraphIdx, v: VarIdx) -> Option<&HValue> {
        self.hgraphs[hg].bindings[v].as_ref()
    }

    pub fn is_green_var(&self, hg: HGraphIdx, v: VarIdx) -> bool {
        self.binding(hg, v).is_some_and(|hs| self.is_green(hs))
    }

    /// The annotated copies a call at `pos` reaches, or `None` if `pos` is not an annotated call.
    /// An empty list means the call is residual.
    pub fn call_targets(&self, pos: Position) -> Option<&[HGraphIdx]> {
        self.call_targets.get(&pos).map(|x| &x[..])
    }

    pub(crate) fn var_binding(&self, hg: HGraphIdx, v: VarIdx) -> HValue {
        self.hgraphs[hg].bindings[v]
            .clone()
            .unwrap_or(HValue::Impossible)
    }

    pub(crate) fn arg_binding(&self, hg: HGraphIdx, a: &Arg) -> HValue {
        match a {
            Arg::Var(v) => self.var_binding(hg, *v),
            Arg::Const(c) => HValue::constant(c.ty.clone()),
        }
    }

    /// The current annotation of the result of the operation at `pos`.
    pub(crate) fn op_binding(&self, pos: Position) -> HValue {
        match pos {
            Position::Op(hg, block, index) => {
                let op = &self.hgraphs[hg].graph.blocks[block].operations[index];
                self.var_binding(hg, op.result)
            }
            Position::InputArg(..) => HValue::Impossible,
        }
    }

    fn schedule(&mut self, hg: HGraphIdx, block: BlockIdx) {
        if self.pending_set.insert((hg, block)) {
            self.pending.push_back((hg, block));
        }
    }

    pub(crate) fn reflow_from_position(&mut self, pos: Position) {
        match pos {
            Position::Op(hg, block, _) => self.schedule(hg, block),
            Position::InputArg(hg, _) => {
                let start = self.hgraphs[hg].graph.startblock;
                self.schedule(hg, start)
            }
        }
    }

    /// Annotate a call from `pos` to `hg` with (already reorigined) arguments `inputs`, returning
    /// the callee's return value as currently known.
    pub(crate) fn recursivecall(
        &mut self,
        hg: HGraphIdx,
        pos: Position,
        inputs: &[HValue],
    ) -> Result<HValue, CompilationError> {
        self.notify.entry(hg).or_default().insert(pos);
        let start = self.hgraphs[hg].graph.startblock;
        self.mergeinputargs(hg, start, inputs)?;
        let ret = self.hgraphs[hg].graph.getreturnvar();
        Ok(self.var_binding(hg, ret))
    }

    /// Generalize the input arguments of `block` with `cells`, scheduling the block if anything
    /// changed.
    fn mergeinputargs(
        &mut self,
        hg: HGraphIdx,
        block: BlockIdx,
        cells: &[HValue],
    ) -> Result<(), CompilationError> {
        let inputargs = self.hgraphs[hg].graph.blocks[block].inputargs.clone();
        if inputargs.len() != cells.len() {
            return Err(CompilationError::InternalError(format!(
                "{}: block {} expects {} values, got {}",
                self.hgraphs[hg].graph.name,
                block.index(),
                inputargs.len(),
                cells.len()
            )));
        }
        let mut changed = false;
        for (v, hs) in inputargs.iter().zip(cells) {
            let old = self.hgraphs[hg].bindings[*v].clone();
            let new = match &old {
                None => hs.clone(),
                Some(o) => self.union(o, hs)?,
            };
            if old.as_ref() != Some(&new) {
                self.hgraphs[hg].bindings[*v] = Some(new);
                changed = true;
            }
        }
        if changed {
            if block == self.hgraphs[hg].graph.returnblock {
                let readers = self
                    .notify
                    .get(&hg)
                    .map(|x| x.iter().copied().collect::<Vec<_>>())
                    .unwrap_or_default();
                for p in readers {
                    self.reflow_from_position(p);
                }
            } else {
                self.schedule(hg, block);
            }
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<(), CompilationError> {
        while let Some((hg, block)) = self.pending.pop_front() {
            self.pending_set.remove(&(hg, block));
            self.flowin(hg, block)?;
        }
        if let Some(((hg, block), index)) = self.blocked.iter().next() {
            return Err(CompilationError::General(format!(
                "{}: block {} is blocked at operation {index}, whose callee never returns",
                self.hgraphs[*hg].graph.name,
                block.index()
            )));
        }
        Ok(())
    }

    fn flowin(&mut self, hg: HGraphIdx, block: BlockIdx) -> Result<(), CompilationError> {
        let b = self.hgraphs[hg].graph.blocks[block].clone();
        self.blocked.remove(&(hg, block));
        for (i, op) in b.operations.iter().enumerate() {
            let pos = Position::Op(hg, block, i);
            let args_hs = op
                .args
                .iter()
                .map(|a| self.arg_binding(hg, a))
                .collect::<Vec<_>>();
            let ty = self.hgraphs[hg].graph.var_type(op.result).clone();
            let res = self.consider_op(pos, &op.kind, &args_hs, &ty)?;
            if res == HValue::Impossible {
                self.blocked.insert((hg, block), i);
                return Ok(());
            }
            self.hgraphs[hg].bindings[op.result] = Some(res);
        }
        for link in &b.exits {
            let cells = link
                .args
                .iter()
                .map(|a| self.arg_binding(hg, a))
                .collect::<Vec<_>>();
            self.mergeinputargs(hg, link.target, &cells)?;
        }
        Ok(())
    }

    /// Render `hg` followed by the colour of each variable.
    pub fn render(&self, hg: HGraphIdx) -> String {
        let g = &self.hgraphs[hg].graph;
        let mut out = g.render(|k| k.opname().to_owned());
        let (mut green, mut red) = (Vec::new(), Vec::new());
        for (v, hs) in self.hgraphs[hg].bindings.iter_enumerated() {
            if let Some(hs) = hs {
                let name = format!("v{}", v.index());
                if self.is_green(hs) {
                    green.push(name);
                } else {
                    red.push(name);
                }
            }
        }
        out.push_str(&format!("  green: {}\n", green.join(", ")));
        out.push_str(&format!("  red: {}\n", red.join(", ")));
        out
    }
}
