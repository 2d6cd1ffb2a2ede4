//! Per-position state of the hint annotator, and the specialization of called graphs.

use super::{
    model::{ContainerIdx, HValue, OriginFlags, OriginIdx, Position},
    HGraph, HGraphIdx, HintAnnotator,
};
use crate::{error::CompilationError, flowgraph::GraphIdx};
use index_vec::IndexVec;
use std::collections::HashMap;

/// Which copy of a graph a call uses.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum SpecKey {
    /// The plain copy.
    Default,
    /// The caller needs the result to be green, so everything it depends on becomes green too.
    Fixed,
    /// Some arguments are eagerly concrete: one character per argument, `E` for those and `x` for
    /// the others.
    Eager(String),
}

#[derive(Default)]
pub(crate) struct Bookkeeper {
    pub(crate) origins: IndexVec<OriginIdx, OriginFlags>,
    originflags: HashMap<Position, OriginIdx>,
    pub(crate) virtual_containers: HashMap<Position, ContainerIdx>,
    descs: HashMap<GraphIdx, HashMap<SpecKey, HGraphIdx>>,
}

impl Bookkeeper {
    /// The origin of the value computed at `pos`.
    pub(crate) fn myorigin(&mut self, pos: Position) -> OriginIdx {
        if let Some(o) = self.originflags.get(&pos) {
            return *o;
        }
        let spaceop = match pos {
            Position::Op(..) => Some(pos),
            Position::InputArg(..) => None,
        };
        let o = self.origins.push(OriginFlags::new(spaceop));
        self.originflags.insert(pos, o);
        o
    }
}

impl HintAnnotator<'_> {
    /// The annotated copy of `graph` for a call with arguments `args_hs`.
    pub(crate) fn get_graph_for_call(
        &mut self,
        graph: GraphIdx,
        fixed: bool,
        args_hs: &mut [HValue],
    ) -> Result<HGraphIdx, CompilationError> {
        let key = if fixed {
            SpecKey::Fixed
        } else if args_hs
            .iter()
            .any(|hs| matches!(hs, HValue::Const(c) if c.eager))
        {
            SpecKey::Eager(
                args_hs
                    .iter()
                    .map(|hs| match hs {
                        HValue::Const(c) if c.eager => 'E',
                        _ => 'x',
                    })
                    .collect(),
            )
        } else {
            SpecKey::Default
        };
        self.specialize(graph, key, args_hs)
    }

    /// The copy of `graph` for `key`, with `args_hs` replaced by the values its input arguments
    /// receive.
    pub(super) fn specialize(
        &mut self,
        graph: GraphIdx,
        key: SpecKey,
        args_hs: &mut [HValue],
    ) -> Result<HGraphIdx, CompilationError> {
        let hg = self.cachedgraph(graph, key)?;
        let nargs = self.hgraphs[hg].graph.getargs().len();
        if nargs != args_hs.len() {
            return Err(CompilationError::General(format!(
                "{} takes {nargs} arguments, got {}",
                self.hgraphs[hg].graph.name,
                args_hs.len()
            )));
        }
        for (i, hs) in args_hs.iter_mut().enumerate() {
            *hs = self.reorigin(hs, Position::InputArg(hg, i), &[]);
        }
        Ok(hg)
    }

    fn cachedgraph(&mut self, graph: GraphIdx, key: SpecKey) -> Result<HGraphIdx, CompilationError> {
        if let Some(hg) = self.bookkeeper.descs.get(&graph).and_then(|d| d.get(&key)) {
            return Ok(*hg);
        }
        let mut copy = (**self.program.graph(graph)?).clone();
        match &key {
            SpecKey::Default => (),
            SpecKey::Fixed => copy.name = format!("{}_HFixed", copy.name),
            SpecKey::Eager(k) => copy.name = format!("{}_H{k}", copy.name),
        }
        let bindings = IndexVec::from_vec(vec![None; copy.vars.len()]);
        let hg = self.hgraphs.push(HGraph {
            origgraph: graph,
            graph: copy,
            bindings,
        });
        self.bookkeeper
            .descs
            .entry(graph)
            .or_default()
            .insert(key, hg);
        Ok(hg)
    }

    /// Annotate a call at `pos` to one of the graphs in `family`.
    pub(crate) fn call(
        &mut self,
        pos: Position,
        family: &[GraphIdx],
        args_hs: &[HValue],
        direct: bool,
    ) -> Result<HValue, CompilationError> {
        let myorigin = self.bookkeeper.myorigin(pos);
        let fixed = self.read_fixed(myorigin, pos);
        let mut result = HValue::Impossible;
        let mut targets = Vec::with_capacity(family.len());
        for g in family {
            let mut inputs = args_hs.to_vec();
            let hg = self.get_graph_for_call(*g, fixed, &mut inputs)?;
            targets.push(hg);
            // If the callee needs an argument to be green, so does the caller.
            for (inp, arg) in inputs.iter().zip(args_hs) {
                if let (HValue::Const(ic), HValue::Const(ac)) = (inp, arg) {
                    if let Some(o) = ic.origins.first() {
                        if self.read_fixed(*o, pos) {
                            for ao in ac.origins.clone() {
                                self.set_fixed(ao);
                            }
                        }
                    }
                }
            }
            let mut res = self.recursivecall(hg, pos, &inputs)?;
            if let HValue::Const(rc) = &res {
                let mut deps = inputs
                    .iter()
                    .zip(args_hs)
                    .filter(|(inp, _)| match inp {
                        HValue::Const(ic) => ic.origins.first().is_some_and(|o| rc.origins.contains(o)),
                        _ => false,
                    })
                    .map(|(_, arg)| arg.clone())
                    .collect::<Vec<_>>();
                if fixed {
                    deps.push(res.clone());
                }
                res = self.reorigin(&res, pos, &deps);
            }
            result = self.union(&result, &res)?;
        }
        self.call_targets.insert(pos, targets);
        if let HValue::Const(c) = &mut result {
            c.myorigin = Some(myorigin);
            if direct {
                self.bookkeeper.origins[myorigin].is_call_result = true;
            }
        }
        // Calling another copy of the callee must not make the result less general than before.
        let current = self.op_binding(pos);
        self.union(&result, &current)
    }
}
