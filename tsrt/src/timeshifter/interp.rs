//! Run timeshifted graphs.
//!
//! Interpreting a [TsGraph] is what specializes its program graph: green operations compute
//! their values on the spot, red ones go through the value model and the [Engine]'s builders, and
//! the dispatch operations move jitstates between blocks and queues. Each invocation of a graph
//! gets its own [Interp] (its variables and its dispatch queue); calls between timeshifted graphs
//! recurse.

use super::{
    rtimeshift::{
        ll_gen1, ll_gen2, ll_gen_getarrayitem, ll_gen_getarraysize, ll_gen_getfield,
        ll_gen_malloc_varsize, ll_gen_ptreq, ll_gen_ptrnonzero, ll_gen_setarrayitem,
        ll_gen_setfield, DispatchQueue, Engine, JsIdx, QueueIdx, Resumer,
    },
    rvalue::BoxIdx,
    Colour, PtrTest, Residual, TsGraph, TsGraphIdx, TsOp,
};
use crate::{
    codegen::{ArrayToken, GenVar},
    error::CompilationError,
    flowgraph::{
        llinterp::{graph_of_fnptr, LLInterpreter},
        Arg, Callee, ExitCase, SpaceOp, VarIdx,
    },
    lltype::{call_native, read_item, read_word, ExcField, LLType},
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::rc::Rc;

/// The value of a variable of a timeshifted graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Val {
    Green(i64),
    Red(BoxIdx),
}

/// One invocation of a timeshifted graph.
struct Interp {
    tsgraph: TsGraphIdx,
    tsg: Rc<TsGraph>,
    env: IndexVec<VarIdx, Option<Val>>,
    js: JsIdx,
    queue: Option<QueueIdx>,
    /// Set by `leave_graph`: the state leaving the graph, if any.
    left: Option<Option<JsIdx>>,
}

impl Interp {
    fn get(&self, a: &Arg) -> Result<Val, CompilationError> {
        match a {
            Arg::Const(c) => Ok(Val::Green(c.value)),
            Arg::Var(v) => self.env[*v].ok_or_else(|| {
                CompilationError::InternalError(format!(
                    "{}: v{} read before it is set",
                    self.tsg.graph.name,
                    v.index()
                ))
            }),
        }
    }

    fn queue(&self) -> Result<QueueIdx, CompilationError> {
        self.queue.ok_or_else(|| {
            CompilationError::InternalError(format!("{}: no dispatch queue", self.tsg.graph.name))
        })
    }
}

impl Engine {
    fn green_of(&self, v: Val) -> Result<i64, CompilationError> {
        match v {
            Val::Green(x) => Ok(x),
            Val::Red(b) => self.boxes.constvalue(b).ok_or_else(|| {
                CompilationError::InternalError(format!(
                    "{:?} used as a green value",
                    self.boxes[b]
                ))
            }),
        }
    }

    fn red_of(&mut self, v: Val, kind: &LLType) -> BoxIdx {
        match v {
            Val::Red(b) => b,
            Val::Green(x) => self.boxes.constant(kind.clone(), x),
        }
    }

    /// Convert `v` to the colour of variable `var` of `tsg`.
    fn coerce(&mut self, tsg: &TsGraph, var: VarIdx, v: Val) -> Result<Val, CompilationError> {
        if tsg.is_green(var) {
            Ok(Val::Green(self.green_of(v)?))
        } else {
            Ok(Val::Red(self.red_of(v, tsg.graph.var_type(var))))
        }
    }

    fn arg_reds(&mut self, st: &Interp, args: &[Arg]) -> Result<Vec<BoxIdx>, CompilationError> {
        let mut boxes = Vec::with_capacity(args.len());
        for a in args {
            let v = st.get(a)?;
            let kind = st.tsg.graph.arg_type(a);
            boxes.push(self.red_of(v, &kind));
        }
        Ok(boxes)
    }

    fn arg_greens(&self, st: &Interp, args: &[Arg]) -> Result<Vec<i64>, CompilationError> {
        args.iter().map(|a| self.green_of(st.get(a)?)).collect()
    }

    /// Run `tsgraph` for the state `js` on `args`. Returns the state that leaves the graph, or
    /// `None` if every state finished inside it.
    pub(crate) fn run_tsgraph(
        &mut self,
        tsgraph: TsGraphIdx,
        js: JsIdx,
        args: Vec<Val>,
    ) -> Result<Option<JsIdx>, CompilationError> {
        let tsg = Rc::clone(&self.tsgraphs[tsgraph]);
        let mut st = Interp {
            tsgraph,
            env: IndexVec::from_vec(vec![None; tsg.graph.vars.len()]),
            tsg: Rc::clone(&tsg),
            js,
            queue: None,
            left: None,
        };
        let graph = &tsg.graph;
        let mut block = graph.startblock;
        let mut incoming = args;
        loop {
            let b = &graph.blocks[block];
            if b.inputargs.len() != incoming.len() {
                return Err(CompilationError::InternalError(format!(
                    "{}: block takes {} values, got {}",
                    graph.name,
                    b.inputargs.len(),
                    incoming.len()
                )));
            }
            for (v, x) in b.inputargs.iter().zip(incoming) {
                st.env[*v] = Some(self.coerce(&tsg, *v, x)?);
            }
            if block == graph.returnblock {
                return st.left.ok_or_else(|| {
                    CompilationError::InternalError(format!(
                        "{}: returned without leaving the graph",
                        graph.name
                    ))
                });
            }
            for op in &b.operations {
                let r = self.eval_op(&mut st, op)?;
                st.env[op.result] = Some(self.coerce(&tsg, op.result, r)?);
            }
            let link = match &b.exitswitch {
                None => &b.exits[0],
                Some(s) => {
                    let x = self.green_of(st.get(s)?)?;
                    b.exits
                        .iter()
                        .find(|l| match &l.exitcase {
                            Some(ExitCase::Bool(c)) => i64::from(*c) == x,
                            Some(ExitCase::Int(c)) => *c == x,
                            _ => false,
                        })
                        .or_else(|| {
                            b.exits
                                .iter()
                                .find(|l| l.exitcase == Some(ExitCase::Default))
                        })
                        .ok_or_else(|| {
                            CompilationError::InternalError(format!(
                                "{}: no exit for switch value {x}",
                                graph.name
                            ))
                        })?
                }
            };
            incoming = link
                .args
                .iter()
                .map(|a| st.get(a))
                .collect::<Result<_, _>>()?;
            block = link.target;
        }
    }

    fn eval_op(&mut self, st: &mut Interp, op: &SpaceOp<TsOp>) -> Result<Val, CompilationError> {
        let vals = op
            .args
            .iter()
            .map(|a| st.get(a))
            .collect::<Result<SmallVec<[Val; 4]>, _>>()?;
        let js = st.js;
        let rty = st.tsg.graph.var_type(op.result).clone();
        let void = Val::Green(0);
        match &op.kind {
            TsOp::Orig(k) => Err(CompilationError::InternalError(format!(
                "{}: untransformed operation {}",
                st.tsg.graph.name,
                k.opname()
            ))),

            TsOp::Green(llop) => {
                let xs = self.arg_greens(st, &op.args)?;
                Ok(Val::Green(llop.fold(&xs)?))
            }
            TsOp::GreenSameAs | TsOp::RedSameAs => Ok(vals[0]),
            TsOp::GreenGetfield { offset } => {
                Ok(Val::Green(read_word(self.green_of(vals[0])?, *offset)?))
            }
            TsOp::GreenGetarrayitem => {
                let xs = self.arg_greens(st, &op.args)?;
                Ok(Val::Green(read_item(xs[0], xs[1])?))
            }
            TsOp::GreenGetarraysize => Ok(Val::Green(read_word(
                self.green_of(vals[0])?,
                ArrayToken::WORDS.lengthoffset,
            )?)),
            TsOp::GreenPtr(t) => {
                let xs = self.arg_greens(st, &op.args)?;
                Ok(Val::Green(i64::from(t.eval(&xs))))
            }
            TsOp::GreenCall(Callee::Graph(g)) => {
                let xs = self.arg_greens(st, &op.args)?;
                Ok(Val::Green(LLInterpreter::new(&self.program).eval_graph(*g, &xs)?))
            }
            TsOp::GreenCall(Callee::External(f)) => {
                let xs = self.arg_greens(st, &op.args)?;
                Ok(Val::Green(unsafe { call_native(f.addr, &xs) }?))
            }
            TsOp::GreenIndirectCall(family) => {
                let xs = self.arg_greens(st, &op.args)?;
                let g = graph_of_fnptr(xs[0], family)?;
                Ok(Val::Green(LLInterpreter::new(&self.program).eval_graph(g, &xs[1..])?))
            }

            TsOp::Red(llop) => {
                let bs = self.arg_reds(st, &op.args)?;
                let builder = self.jitstates[js].builder()?;
                let r = match bs[..] {
                    [a] => ll_gen1(&mut self.boxes, builder, *llop, a)?,
                    [a, b] => ll_gen2(&mut self.boxes, builder, *llop, a, b)?,
                    _ => {
                        return Err(CompilationError::InternalError(format!(
                            "{} with {} arguments",
                            llop.opname(),
                            bs.len()
                        )))
                    }
                };
                Ok(Val::Red(r))
            }
            TsOp::RedGetfield {
                desc,
                index,
                deepfrozen,
            } => {
                let ptr = self.red_of(vals[0], &desc.ptrtype);
                let builder = self.jitstates[js].builder()?;
                Ok(Val::Red(ll_gen_getfield(
                    &mut self.boxes,
                    builder,
                    desc,
                    *index,
                    *deepfrozen,
                    ptr,
                )?))
            }
            TsOp::RedSetfield { desc, index } => {
                let bs = self.arg_reds(st, &op.args)?;
                let builder = self.jitstates[js].builder()?;
                ll_gen_setfield(&mut self.boxes, builder, desc, *index, bs[0], bs[1])?;
                Ok(void)
            }
            TsOp::RedGetarrayitem { kind, fold } => {
                let bs = self.arg_reds(st, &op.args)?;
                let builder = self.jitstates[js].builder()?;
                Ok(Val::Red(ll_gen_getarrayitem(
                    &mut self.boxes,
                    builder,
                    kind,
                    *fold,
                    bs[0],
                    bs[1],
                )?))
            }
            TsOp::RedSetarrayitem => {
                let bs = self.arg_reds(st, &op.args)?;
                let builder = self.jitstates[js].builder()?;
                ll_gen_setarrayitem(&mut self.boxes, builder, bs[0], bs[1], bs[2])?;
                Ok(void)
            }
            TsOp::RedGetarraysize => {
                let bs = self.arg_reds(st, &op.args)?;
                let builder = self.jitstates[js].builder()?;
                Ok(Val::Red(ll_gen_getarraysize(&mut self.boxes, builder, bs[0])?))
            }
            TsOp::RedMalloc { desc, is_virtual } => {
                if *is_virtual {
                    return Ok(Val::Red(self.boxes.factory(desc)));
                }
                let gv = self.jitstates[js]
                    .builder()?
                    .genop_malloc_fixedsize(desc.size)?;
                Ok(Val::Red(self.boxes.var(desc.ptrtype.clone(), gv)))
            }
            TsOp::RedMallocVarsize(kind) => {
                let bs = self.arg_reds(st, &op.args)?;
                let builder = self.jitstates[js].builder()?;
                Ok(Val::Red(ll_gen_malloc_varsize(
                    &mut self.boxes,
                    builder,
                    kind,
                    bs[0],
                )?))
            }
            TsOp::RedPtr(t) => {
                let bs = self.arg_reds(st, &op.args)?;
                let builder = self.jitstates[js].builder()?;
                let r = match t {
                    PtrTest::Nonzero => ll_gen_ptrnonzero(&mut self.boxes, builder, bs[0], false)?,
                    PtrTest::Iszero => ll_gen_ptrnonzero(&mut self.boxes, builder, bs[0], true)?,
                    PtrTest::Eq => ll_gen_ptreq(&mut self.boxes, builder, bs[0], bs[1], false)?,
                    PtrTest::Ne => ll_gen_ptreq(&mut self.boxes, builder, bs[0], bs[1], true)?,
                };
                Ok(Val::Red(r))
            }
            TsOp::GetExcBox(f) => {
                let state = &self.jitstates[js];
                Ok(Val::Red(match f {
                    ExcField::Type => state.exc_type,
                    ExcField::Value => state.exc_value,
                }))
            }
            TsOp::SetExcBox(f) => {
                let kind = st.tsg.graph.arg_type(&op.args[0]);
                let b = self.red_of(vals[0], &kind);
                let state = &mut self.jitstates[js];
                match f {
                    ExcField::Type => state.exc_type = b,
                    ExcField::Value => state.exc_value = b,
                }
                Ok(void)
            }
            TsOp::ResidualCall(r) => {
                let mut bs = self.arg_reds(st, &op.args)?;
                let (fnaddr, ctx, raises) = match r {
                    Residual::External(f) => (f.addr, None, false),
                    Residual::Graph(g) => {
                        let (addr, ctx) = self.residual_target(&[*g], false, bs.len())?;
                        (addr, Some(ctx), self.can_raise(&[*g])?)
                    }
                    Residual::Indirect(family) => {
                        let (addr, ctx) = self.residual_target(family, true, bs.len())?;
                        (addr, Some(ctx), self.can_raise(family)?)
                    }
                };
                if let Some(ctx) = ctx {
                    bs.insert(0, self.boxes.constant(LLType::Signed, ctx));
                }
                let r = self.residual_call(js, GenVar::Const(fnaddr), &bs, &rty)?;
                if raises {
                    self.fetch_global_excdata(js)?;
                }
                match r {
                    Some(b) => Ok(Val::Red(b)),
                    None => Ok(void),
                }
            }

            TsOp::Call { target, .. } => self.call(st, *target, &vals),
            TsOp::IndirectCall {
                family, targets, ..
            } => {
                let fnptr = self.green_of(vals[0])?;
                let g = graph_of_fnptr(fnptr, family)?;
                let i = family.iter().position(|x| *x == g).ok_or_else(|| {
                    CompilationError::InternalError("call target outside its family".into())
                })?;
                self.call(st, targets[i], &vals[1..])
            }
            TsOp::PortalCall => self.portal_call(st, &op.args),

            TsOp::EnsureQueue { replayable } => {
                st.queue = Some(self.ensure_queue(js, *replayable)?);
                Ok(void)
            }
            TsOp::EnterFrame => {
                self.enter_frame(js, st.queue()?)?;
                Ok(void)
            }
            TsOp::LeaveGraph(colour) => {
                let q = st.queue()?;
                st.left = Some(match colour {
                    Colour::Red => self.leave_graph_red(js, q)?,
                    Colour::Gray => self.leave_graph_gray(js, q)?,
                    Colour::Yellow => self.leave_graph_yellow(js, q)?,
                });
                Ok(void)
            }
            TsOp::SaveLocals => {
                let bs = self.arg_reds(st, &op.args)?;
                self.save_locals(js, bs)?;
                Ok(void)
            }
            TsOp::SaveGreens => {
                let xs = self.arg_greens(st, &op.args)?;
                self.save_greens(js, xs);
                Ok(void)
            }
            TsOp::RestoreLocal(i) => Ok(Val::Red(self.restore_local(js, *i)?)),
            TsOp::RestoreGreen(i) => Ok(Val::Green(self.restore_green(js, *i)?)),
            TsOp::SaveReturn => {
                self.save_return(js)?;
                Ok(void)
            }
            TsOp::IsConstant => Ok(Val::Green(match vals[0] {
                Val::Green(_) => 1,
                Val::Red(b) => i64::from(self.boxes.is_constant(b)),
            })),
            TsOp::Revealconst => Ok(Val::Green(self.green_of(vals[0])?)),
            TsOp::Split { resumepoint } => {
                let kind = st.tsg.graph.arg_type(&op.args[0]);
                let switchbox = self.red_of(vals[0], &kind);
                let greens = self.arg_greens(st, &op.args[1..])?;
                Ok(Val::Green(i64::from(self.split(js, switchbox, *resumepoint, greens)?)))
            }
            TsOp::CollectSplit { resumepoint } => {
                let greens = self.arg_greens(st, &op.args)?;
                st.js = self.collect_split(js, *resumepoint, &greens)?;
                Ok(void)
            }
            TsOp::MergePoint { mp, resume_after } => {
                let key = self.arg_greens(st, &op.args)?;
                let resumer = match resume_after {
                    Some(resumepoint) => Resumer::Global {
                        tsgraph: st.tsgraph,
                        resumepoint: *resumepoint,
                    },
                    None => Resumer::Local,
                };
                let q = st.queue()?;
                Ok(Val::Green(i64::from(self.merge_point(js, q, *mp, key, resumer)?)))
            }
            TsOp::GuardGlobalMerge { resumepoint } => {
                self.guard_global_merge(js, *resumepoint)?;
                Ok(void)
            }
            TsOp::DispatchNext => {
                st.js = self.dispatch_next(js, st.queue()?)?;
                Ok(void)
            }
            TsOp::GetResumepoint => Ok(Val::Green(self.jitstates[js].resumepoint)),
            TsOp::Promote => {
                let kind = st.tsg.graph.arg_type(&op.args[0]);
                let b = self.red_of(vals[0], &kind);
                Ok(Val::Green(i64::from(self.ll_promote(js, b)?)))
            }
            TsOp::ReverseSplitQueue => {
                self.reverse_split_queue(st.queue()?);
                Ok(void)
            }
        }
    }

    /// Call the timeshifted `target`. The result is true if the state finished inside it.
    fn call(
        &mut self,
        st: &mut Interp,
        target: TsGraphIdx,
        args: &[Val],
    ) -> Result<Val, CompilationError> {
        self.jitstates[st.js].resumepoint = -1;
        match self.run_tsgraph(target, st.js, args.to_vec())? {
            Some(js) => {
                st.js = js;
                Ok(Val::Green(0))
            }
            None => Ok(Val::Green(1)),
        }
    }

    /// A call from the portal to itself: a residual call to the specialization for the green
    /// arguments, whose result becomes the caller's local 0 as for any red call.
    fn portal_call(&mut self, st: &mut Interp, args: &[Arg]) -> Result<Val, CompilationError> {
        let desc = self
            .portal
            .as_ref()
            .ok_or_else(|| CompilationError::InternalError("no portal".into()))?;
        let (kinds, result) = (desc.kinds.clone(), desc.result.clone());
        let origgraph = self.tsgraphs[desc.tsgraph].origgraph;
        let greenmask = desc.args.clone();
        if greenmask.len() != args.len() {
            return Err(CompilationError::General(format!(
                "portal takes {} arguments, got {}",
                greenmask.len(),
                args.len()
            )));
        }
        let mut key = Vec::new();
        let mut reds = Vec::new();
        for ((a, pa), kind) in args.iter().zip(&greenmask).zip(&kinds) {
            let v = st.get(a)?;
            if pa.is_green() {
                key.push(self.green_of(v)?);
            } else {
                reds.push(self.red_of(v, kind));
            }
        }
        let compiled = self.compile_portal(&key)?;
        let js = st.js;
        let r = match self.residual_call(js, GenVar::Const(compiled.entry as i64), &reds, &result)? {
            Some(b) => b,
            None => self.boxes.constant(LLType::Void, 0),
        };
        if self.can_raise(&[origgraph])? {
            self.fetch_global_excdata(js)?;
        }
        let state = &mut self.jitstates[js];
        state.greens.clear();
        state.next = None;
        state.frame_mut()?.local_boxes.insert(0, r);
        Ok(Val::Green(0))
    }

    /// Resume compiling `tsgraph` at `resumepoint` for `js`, a state rebuilt from a global merge
    /// point, and close the code of the state that leaves it.
    pub(crate) fn global_resumer(
        &mut self,
        js: JsIdx,
        tsgraph: TsGraphIdx,
        resumepoint: i64,
    ) -> Result<(), CompilationError> {
        let q = self.queues.push(DispatchQueue::default());
        self.jitstates[js].frame_mut()?.queue = Some(q);
        self.jitstates[js].resumepoint = resumepoint;
        let tsg = Rc::clone(&self.tsgraphs[tsgraph]);
        // The graph's arguments are not read when resuming.
        let mut args = Vec::new();
        for v in tsg.graph.getargs() {
            if tsg.is_green(*v) {
                args.push(Val::Green(0));
            } else {
                let kind = tsg.graph.var_type(*v).clone();
                args.push(Val::Red(self.boxes.constant(kind, 0)));
            }
        }
        if let Some(js) = self.run_tsgraph(tsgraph, js, args)? {
            self.finish_jitstate(js)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, flowgraph::Program};
    use std::cell::RefCell;

    fn engine() -> Rc<RefCell<Engine>> {
        Engine::new(Rc::new(Program::new()), Config::default()).unwrap()
    }

    #[test]
    fn colours_are_coerced() {
        let engine = engine();
        let mut e = engine.borrow_mut();
        let b = e.red_of(Val::Green(5), &LLType::Signed);
        assert_eq!(e.boxes.constvalue(b), Some(5));
        assert_eq!(e.green_of(Val::Red(b)).unwrap(), 5);
        let gv = GenVar::Var(0);
        let v = e.boxes.var(LLType::Signed, gv);
        assert!(matches!(
            e.green_of(Val::Red(v)),
            Err(CompilationError::InternalError(_))
        ));
        assert_eq!(e.red_of(Val::Red(v), &LLType::Signed), v);
    }
}
