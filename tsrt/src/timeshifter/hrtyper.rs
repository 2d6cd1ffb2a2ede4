//! Resolve the operations of hint-annotated graphs into timeshifted ones.

use super::{
    rcontainer::TypeDescCache,
    transform::{has_sideeffects, CallInfo, Transformer},
    Colour, PtrTest, Residual, TsGraph, TsGraphIdx, TsOp,
};
use crate::{
    error::CompilationError,
    flowgraph::{Arg, BlockIdx, Callee, GraphIdx, OpKind, Program, SpaceOp, VarIdx},
    hintannotator::{HGraphIdx, HValue, HintAnnotator, Position},
};
use index_vec::IndexVec;
use std::{collections::HashMap, rc::Rc};
use vob::Vob;

pub(crate) struct HrTyper<'a, 'p> {
    program: &'p Program,
    ha: &'a HintAnnotator<'p>,
    portal: HGraphIdx,
    descs: TypeDescCache,
    sideeffects: HashMap<GraphIdx, bool>,
}

impl<'a, 'p> HrTyper<'a, 'p> {
    pub(crate) fn new(program: &'p Program, ha: &'a HintAnnotator<'p>, portal: HGraphIdx) -> Self {
        Self {
            program,
            ha,
            portal,
            descs: TypeDescCache::default(),
            sideeffects: HashMap::new(),
        }
    }

    /// Timeshift every annotated graph. The timeshifted copy of `hg` has index `hg.index()`.
    pub(crate) fn specialize(mut self) -> Result<IndexVec<TsGraphIdx, TsGraph>, CompilationError> {
        let hgs = self.ha.hgraphs().map(|(hg, _)| hg).collect::<Vec<_>>();
        let mut tsgraphs = IndexVec::with_capacity(hgs.len());
        for hg in hgs {
            let tsg = self.timeshift_graph(hg)?;
            tsg.log();
            tsgraphs.push(tsg);
        }
        Ok(tsgraphs)
    }

    fn var_green(&self, hg: HGraphIdx, v: VarIdx) -> bool {
        self.ha.hgraph(hg).graph.var_type(v).is_void() || self.ha.is_green_var(hg, v)
    }

    fn arg_green(&self, hg: HGraphIdx, a: &Arg) -> bool {
        match a {
            Arg::Var(v) => self.var_green(hg, *v),
            Arg::Const(_) => true,
        }
    }

    pub(crate) fn colour_of(&self, hg: HGraphIdx) -> Colour {
        if hg == self.portal {
            return Colour::Red;
        }
        let graph = &self.ha.hgraph(hg).graph;
        let ret = graph.getreturnvar();
        if graph.var_type(ret).is_void() {
            Colour::Gray
        } else if self.ha.is_green_var(hg, ret) {
            Colour::Yellow
        } else {
            Colour::Red
        }
    }

    fn timeshift_graph(&mut self, hg: HGraphIdx) -> Result<TsGraph, CompilationError> {
        let ha = self.ha;
        let h = ha.hgraph(hg);
        let mut graph = h.graph.map_ops(|k| TsOp::Orig(k.clone()));
        let mut green = Vob::with_capacity(graph.vars.len());
        for v in graph.vars.indices() {
            green.push(self.var_green(hg, v));
        }
        let mut calls = HashMap::new();
        for block in graph.iterblocks() {
            for (i, op) in h.graph.blocks[block].operations.iter().enumerate() {
                graph.blocks[block].operations[i].kind = self.resolve(hg, block, i, op, &mut calls)?;
            }
        }
        let colour = self.colour_of(hg);
        let (graph, green) = Transformer::new(graph, green, colour, &calls).transform()?;
        Ok(TsGraph {
            graph,
            green,
            colour,
            origgraph: h.origgraph,
        })
    }

    fn resolve(
        &mut self,
        hg: HGraphIdx,
        block: BlockIdx,
        index: usize,
        op: &SpaceOp<OpKind>,
        calls: &mut HashMap<VarIdx, CallInfo>,
    ) -> Result<TsOp, CompilationError> {
        let ha = self.ha;
        let graph = &ha.hgraph(hg).graph;
        let res_green = self.var_green(hg, op.result);
        let all_green = op.args.iter().all(|a| self.arg_green(hg, a));
        let green = res_green && all_green;
        Ok(match &op.kind {
            OpKind::Op(llop) => {
                if res_green {
                    TsOp::Green(*llop)
                } else {
                    TsOp::Red(*llop)
                }
            }
            OpKind::SameAs => {
                if res_green {
                    TsOp::GreenSameAs
                } else {
                    TsOp::RedSameAs
                }
            }
            OpKind::Getfield(name) => {
                let desc = self.descs.get(&graph.arg_type(&op.args[0]))?;
                let index = desc.field_index(name)?;
                if green {
                    TsOp::GreenGetfield {
                        offset: desc.fields[index].offset,
                    }
                } else {
                    let deepfrozen = self.ha.arg_binding(hg, &op.args[0]).deepfrozen();
                    TsOp::RedGetfield {
                        desc,
                        index,
                        deepfrozen,
                    }
                }
            }
            OpKind::Setfield(name) => {
                let desc = self.descs.get(&graph.arg_type(&op.args[0]))?;
                let index = desc.field_index(name)?;
                TsOp::RedSetfield { desc, index }
            }
            OpKind::Getarrayitem => {
                if green {
                    TsOp::GreenGetarrayitem
                } else {
                    let arrty = graph.arg_type(&op.args[0]);
                    let immutable = arrty.array_type().is_some_and(|a| a.immutable);
                    TsOp::RedGetarrayitem {
                        kind: graph.var_type(op.result).clone(),
                        fold: immutable || self.ha.arg_binding(hg, &op.args[0]).deepfrozen(),
                    }
                }
            }
            OpKind::Setarrayitem => TsOp::RedSetarrayitem,
            OpKind::Getarraysize => {
                if green {
                    TsOp::GreenGetarraysize
                } else {
                    TsOp::RedGetarraysize
                }
            }
            OpKind::Malloc(ty) => TsOp::RedMalloc {
                desc: self.descs.get(ty)?,
                is_virtual: matches!(
                    self.ha.var_binding(hg, op.result),
                    HValue::Container { .. }
                ),
            },
            OpKind::MallocVarsize(ty) => TsOp::RedMallocVarsize(ty.clone()),
            OpKind::PtrNonzero => ptr_op(green, PtrTest::Nonzero),
            OpKind::PtrIszero => ptr_op(green, PtrTest::Iszero),
            OpKind::PtrEq => ptr_op(green, PtrTest::Eq),
            OpKind::PtrNe => ptr_op(green, PtrTest::Ne),
            OpKind::DirectCall(Callee::External(f)) => {
                if f.pure && green {
                    TsOp::GreenCall(Callee::External(Rc::clone(f)))
                } else {
                    TsOp::ResidualCall(Residual::External(Rc::clone(f)))
                }
            }
            OpKind::DirectCall(Callee::Graph(_)) | OpKind::IndirectCall(_) => {
                self.resolve_call(hg, Position::Op(hg, block, index), op, green, calls)?
            }
            OpKind::Hint(_) => TsOp::Orig(op.kind.clone()),
            OpKind::GetExc(f) => TsOp::GetExcBox(*f),
            OpKind::SetExc(f) => TsOp::SetExcBox(*f),
        })
    }

    /// A call to graphs of the program: green if everything about it is green and the callees
    /// have no side effects, residual if the annotator did not follow it, and otherwise left for
    /// the transformation with its [CallInfo].
    fn resolve_call(
        &mut self,
        hg: HGraphIdx,
        pos: Position,
        op: &SpaceOp<OpKind>,
        green: bool,
        calls: &mut HashMap<VarIdx, CallInfo>,
    ) -> Result<TsOp, CompilationError> {
        let family = match &op.kind {
            OpKind::DirectCall(Callee::Graph(g)) => vec![*g],
            OpKind::IndirectCall(f) => f.to_vec(),
            _ => unreachable!(),
        };
        if green {
            let mut effects = false;
            for g in &family {
                effects |= has_sideeffects(self.program, *g, &mut self.sideeffects)?;
            }
            if !effects {
                return Ok(match &op.kind {
                    OpKind::IndirectCall(f) => TsOp::GreenIndirectCall(Rc::clone(f)),
                    k => TsOp::GreenCall(match k {
                        OpKind::DirectCall(c) => c.clone(),
                        _ => unreachable!(),
                    }),
                });
            }
        }
        if family.contains(&self.ha.hgraph(self.portal).origgraph) {
            if matches!(op.kind, OpKind::IndirectCall(_)) {
                return Err(CompilationError::General(format!(
                    "{}: indirect call to the portal",
                    self.ha.hgraph(hg).graph.name
                )));
            }
            calls.insert(
                op.result,
                CallInfo {
                    colour: Colour::Red,
                    targets: vec![TsGraphIdx::from_usize(self.portal.index())],
                    portal: true,
                },
            );
            return Ok(TsOp::Orig(op.kind.clone()));
        }
        let targets = match self.ha.call_targets(pos) {
            Some(t) if !t.is_empty() => t.to_vec(),
            _ => {
                return Ok(TsOp::ResidualCall(match &op.kind {
                    OpKind::IndirectCall(f) => Residual::Indirect(Rc::clone(f)),
                    _ => Residual::Graph(family[0]),
                }))
            }
        };
        let colour = self.colour_of(targets[0]);
        if targets.iter().any(|t| self.colour_of(*t) != colour) {
            return Err(CompilationError::General(format!(
                "{}: call targets return values of different colours",
                self.ha.hgraph(hg).graph.name
            )));
        }
        calls.insert(
            op.result,
            CallInfo {
                colour,
                targets: targets
                    .into_iter()
                    .map(|t| TsGraphIdx::from_usize(t.index()))
                    .collect(),
                portal: false,
            },
        );
        Ok(TsOp::Orig(op.kind.clone()))
    }
}

fn ptr_op(green: bool, t: PtrTest) -> TsOp {
    if green {
        TsOp::GreenPtr(t)
    } else {
        TsOp::RedPtr(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flowgraph::{builder::GraphBuilder, Constant},
        hintannotator::HintPolicy,
        lltype::{LLOp, LLType},
    };

    fn s() -> LLType {
        LLType::Signed
    }

    fn timeshift(p: &Program, f: GraphIdx, args: &[HValue]) -> IndexVec<TsGraphIdx, TsGraph> {
        let mut ha = HintAnnotator::new(p, HintPolicy::new());
        let hg = ha.build_types(f, args).unwrap();
        HrTyper::new(p, &ha, hg).specialize().unwrap()
    }

    fn ops(tsg: &TsGraph) -> Vec<String> {
        tsg.graph
            .iterblocks()
            .into_iter()
            .flat_map(|b| tsg.graph.blocks[b].operations.iter().map(|op| op.kind.to_string()))
            .collect()
    }

    #[test]
    fn straight_line() {
        // f(x, y) = (x * 2) + y
        let mut gb = GraphBuilder::new("f", &[s(), s()], s());
        let [x, y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let d = gb.op(sb, OpKind::Op(LLOp::IntMul), vec![x.into(), Constant::signed(2).into()], s());
        let r = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![d.into(), y.into()], s());
        gb.ret(sb, r.into());
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let tsgs = timeshift(&p, f, &[HValue::concrete(s()), HValue::variable(s())]);
        assert_eq!(tsgs.len(), 1);
        let tsg = &tsgs[TsGraphIdx::from_usize(0)];
        assert_eq!(tsg.colour, Colour::Red);
        let ops = ops(tsg);
        assert_eq!(
            ops,
            [
                "ensure_queue",
                "enter_frame",
                "int_mul",
                "red_int_add",
                "save_locals",
                "save_return",
                "leave_graph_red"
            ]
        );
        assert!(tsg.is_green(x));
        assert!(!tsg.is_green(y));
    }

    #[test]
    fn red_branch_splits() {
        // f(x) = x > 0 ? x : -x, x red
        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [x] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let c = gb.op(sb, OpKind::Op(LLOp::IntGt), vec![x.into(), Constant::signed(0).into()], LLType::Bool);
        let (neg, negargs) = gb.new_block(&[s()]);
        let n = gb.op(neg, OpKind::Op(LLOp::IntNeg), vec![negargs[0].into()], s());
        gb.ret(neg, n.into());
        let rb = gb.returnblock();
        gb.branch(sb, c.into(), (rb, vec![x.into()]), (neg, vec![x.into()]));
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let tsgs = timeshift(&p, f, &[HValue::variable(s())]);
        let ops = ops(&tsgs[TsGraphIdx::from_usize(0)]);
        for expected in ["split[0]", "dispatch_next", "getresumepoint", "restore_local[0]"] {
            assert!(ops.iter().any(|o| o == expected), "{expected} missing from {ops:?}");
        }
        assert!(!ops.iter().any(|o| o.starts_with("merge_point")));
    }

    #[test]
    fn green_branch_stays() {
        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [x] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let c = gb.op(sb, OpKind::Op(LLOp::IntGt), vec![x.into(), Constant::signed(0).into()], LLType::Bool);
        let (neg, negargs) = gb.new_block(&[s()]);
        let n = gb.op(neg, OpKind::Op(LLOp::IntNeg), vec![negargs[0].into()], s());
        gb.ret(neg, n.into());
        let rb = gb.returnblock();
        gb.branch(sb, c.into(), (rb, vec![x.into()]), (neg, vec![x.into()]));
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let tsgs = timeshift(&p, f, &[HValue::concrete(s())]);
        let ops = ops(&tsgs[TsGraphIdx::from_usize(0)]);
        assert!(!ops.iter().any(|o| o.starts_with("split")));
        assert!(!ops.iter().any(|o| o == "dispatch_next"));
    }

    #[test]
    fn calls_and_colours() {
        // g(a) = a + 1; h(a) = a; f(x, y) = g(y) + h(x)
        let mut p = Program::new();
        let mut gb = GraphBuilder::new("g", &[s()], s());
        let [a] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![a.into(), Constant::signed(1).into()], s());
        gb.ret(sb, r.into());
        let g = p.add(gb.finish().unwrap()).unwrap();

        let mut gb = GraphBuilder::new("f", &[s(), s()], s());
        let [x, y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r1 = gb.op(sb, OpKind::DirectCall(Callee::Graph(g)), vec![y.into()], s());
        let r2 = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![r1.into(), x.into()], s());
        gb.ret(sb, r2.into());
        let f = p.add(gb.finish().unwrap()).unwrap();

        let tsgs = timeshift(&p, f, &[HValue::concrete(s()), HValue::variable(s())]);
        assert_eq!(tsgs.len(), 2);
        let fts = tsgs.iter().find(|t| t.origgraph == f).unwrap();
        let gts = tsgs.iter().find(|t| t.origgraph == g).unwrap();
        assert_eq!(gts.colour, Colour::Red);
        let ops = ops(fts);
        assert!(ops.iter().any(|o| o.starts_with("red_call[ts")));
        assert!(ops.iter().any(|o| o.starts_with("collect_split[")));
    }

    #[test]
    fn pure_green_calls_fold() {
        let mut p = Program::new();
        let mut gb = GraphBuilder::new("g", &[s()], s());
        let [a] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![a.into(), Constant::signed(1).into()], s());
        gb.ret(sb, r.into());
        let g = p.add(gb.finish().unwrap()).unwrap();

        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [x] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r1 = gb.op(sb, OpKind::DirectCall(Callee::Graph(g)), vec![x.into()], s());
        let h = gb.op(sb, OpKind::hint(&[("concrete", true)]), vec![r1.into()], s());
        gb.ret(sb, h.into());
        let f = p.add(gb.finish().unwrap()).unwrap();

        let tsgs = timeshift(&p, f, &[HValue::concrete(s())]);
        let fts = tsgs.iter().find(|t| t.origgraph == f).unwrap();
        let ops = ops(fts);
        assert!(ops.iter().any(|o| o == &format!("green_call[g{}]", g.index())));
        assert!(!ops.iter().any(|o| o.contains("red_call")));
    }
}
