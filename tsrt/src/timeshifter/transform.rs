//! Thread the dispatch machinery through a timeshifted graph.
//!
//! After [super::hrtyper] has resolved the operations of a graph, the passes here rewrite its
//! control flow so that interpreting it drives the [super::rtimeshift::Engine]:
//!
//!   * every red branch becomes a `split`, queueing the false case;
//!   * every block with several predecessors becomes a merge point, local to one invocation of
//!     the graph or (when hinted) global across invocations;
//!   * calls to other timeshifted graphs save the live reds, and resume at a block restoring
//!     them once the callee has returned;
//!   * a dispatcher at the end of the graph picks the next queued state and jumps to its resume
//!     point, until no state is left.
//!
//! Resume points are numbered in order of creation; the dispatcher switches on
//! `getresumepoint`, with `-1` meaning "leave the graph".

use super::{Colour, Residual, TsGraphIdx, TsOp};
use crate::{
    error::CompilationError,
    flowgraph::{
        Arg, BlockIdx, Callee, Constant, ExitCase, Graph, GraphIdx, Link, OpKind, Program, SpaceOp,
        VarIdx,
    },
    lltype::{LLOp, LLType},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    mem,
    rc::Rc,
};
use vob::Vob;

/// How a call to other timeshifted graphs is made, keyed (in [Transformer::new]) by the
/// result variable of the call.
#[derive(Clone, Debug)]
pub(crate) struct CallInfo {
    pub(crate) colour: Colour,
    /// One timeshifted graph per member of the call family, in family order.
    pub(crate) targets: Vec<TsGraphIdx>,
    /// The callee is the portal itself.
    pub(crate) portal: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MergeKind {
    Local,
    Global,
}

pub(crate) struct Transformer<'a> {
    graph: Graph<TsOp>,
    green: Vob,
    colour: Colour,
    calls: &'a HashMap<VarIdx, CallInfo>,
    /// Resume point number and resume block of each block states can be resumed at.
    resumepoints: HashMap<BlockIdx, (i64, BlockIdx)>,
    mergepoints: BTreeMap<BlockIdx, MergeKind>,
    mp_count: usize,
    has_global: bool,
}

impl<'a> Transformer<'a> {
    pub(crate) fn new(
        graph: Graph<TsOp>,
        green: Vob,
        colour: Colour,
        calls: &'a HashMap<VarIdx, CallInfo>,
    ) -> Self {
        Self {
            graph,
            green,
            colour,
            calls,
            resumepoints: HashMap::new(),
            mergepoints: BTreeMap::new(),
            mp_count: 0,
            has_global: false,
        }
    }

    /// Run every pass, returning the transformed graph and the colour of each of its variables.
    pub(crate) fn transform(mut self) -> Result<(Graph<TsOp>, Vob), CompilationError> {
        self.compute_merge_points()?;
        self.insert_save_return();
        self.insert_splits()?;
        self.split_after_calls()?;
        self.handle_hints()?;
        self.insert_merge_points()?;
        self.insert_enter_frame();
        self.insert_dispatcher()?;
        self.insert_ensure_queue();
        self.insert_leave_graph();
        for (orig, new) in self.graph.to_ssi()? {
            let g = self.is_green(orig);
            self.set_colour(new, g);
        }
        self.graph.check()?;
        if self.green.len() != self.graph.vars.len() {
            return Err(CompilationError::InternalError(format!(
                "{}: {} variables but {} colours",
                self.graph.name,
                self.graph.vars.len(),
                self.green.len()
            )));
        }
        Ok((self.graph, self.green))
    }

    // Helpers.

    fn is_green(&self, v: VarIdx) -> bool {
        self.green.get(v.index()).unwrap_or(false)
    }

    fn is_green_arg(&self, a: &Arg) -> bool {
        match a {
            Arg::Var(v) => self.is_green(*v),
            Arg::Const(_) => true,
        }
    }

    fn set_colour(&mut self, v: VarIdx, green: bool) {
        while self.green.len() <= v.index() {
            self.green.push(false);
        }
        self.green.set(v.index(), green);
    }

    fn new_var(&mut self, ty: LLType, green: bool) -> VarIdx {
        let v = self.graph.new_var(ty);
        self.set_colour(v, green);
        v
    }

    fn copyvar(&mut self, v: VarIdx) -> VarIdx {
        let g = self.is_green(v);
        let nv = self.graph.copyvar(v);
        self.set_colour(nv, g);
        nv
    }

    fn genop(
        &mut self,
        block: BlockIdx,
        kind: TsOp,
        args: Vec<Arg>,
        ty: LLType,
        green: bool,
    ) -> VarIdx {
        let result = self.new_var(ty, green);
        self.graph.blocks[block]
            .operations
            .push(SpaceOp { kind, args, result });
        result
    }

    fn void_op(&mut self, block: BlockIdx, kind: TsOp, args: Vec<Arg>) -> VarIdx {
        self.genop(block, kind, args, LLType::Void, true)
    }

    /// [Graph::split_block], colouring the new input arguments like the values passed to them.
    fn split_block(&mut self, block: BlockIdx, index: usize) -> BlockIdx {
        let nb = self.graph.split_block(block, index);
        let pairs = self.graph.blocks[block].exits[0]
            .args
            .iter()
            .cloned()
            .zip(self.graph.blocks[nb].inputargs.clone())
            .collect::<Vec<_>>();
        for (a, v) in pairs {
            let g = self.is_green_arg(&a);
            self.set_colour(v, g);
        }
        nb
    }

    /// Split `args` into reds and greens, by their own colour or by the colour of the
    /// corresponding variable of `by_colour_of`. `Void` values are dropped.
    fn sort_by_colour(&self, args: &[Arg], by_colour_of: Option<&[VarIdx]>) -> (Vec<Arg>, Vec<Arg>) {
        let mut reds = Vec::new();
        let mut greens = Vec::new();
        for (i, a) in args.iter().enumerate() {
            if self.graph.arg_type(a).is_void() {
                continue;
            }
            let green = match by_colour_of {
                Some(vs) => self.is_green(vs[i]),
                None => self.is_green_arg(a),
            };
            if green {
                greens.push(a.clone());
            } else {
                reds.push(a.clone());
            }
        }
        (reds, greens)
    }

    fn genswitch(&mut self, block: BlockIdx, flag: VarIdx, iffalse: BlockIdx, iftrue: BlockIdx) {
        let b = &mut self.graph.blocks[block];
        b.exitswitch = Some(Arg::Var(flag));
        b.recloseblock(vec![
            Link {
                args: Vec::new(),
                target: iffalse,
                exitcase: Some(ExitCase::Bool(false)),
            },
            Link {
                args: Vec::new(),
                target: iftrue,
                exitcase: Some(ExitCase::Bool(true)),
            },
        ]);
    }

    /// Make `block` jump to `target` instead of its single exit if `flag` is true.
    fn go_to_if(
        &mut self,
        block: BlockIdx,
        target: BlockIdx,
        flag: VarIdx,
    ) -> Result<(), CompilationError> {
        let b = &mut self.graph.blocks[block];
        if b.exits.len() != 1 || b.exitswitch.is_some() {
            return Err(CompilationError::InternalError(format!(
                "{}: conditional exit added to a block that already branches",
                self.graph.name
            )));
        }
        let mut link_f = b.exits.remove(0);
        link_f.exitcase = Some(ExitCase::Bool(false));
        let link_t = Link {
            args: vec![Arg::Const(Constant::void())],
            target,
            exitcase: Some(ExitCase::Bool(true)),
        };
        b.exitswitch = Some(Arg::Var(flag));
        b.recloseblock(vec![link_f, link_t]);
        Ok(())
    }

    fn go_to_dispatcher_if(&mut self, block: BlockIdx, flag: VarIdx) -> Result<(), CompilationError> {
        let rb = self.graph.returnblock;
        self.go_to_if(block, rb, flag)
    }

    /// Insert a block in front of the start block, passing the graph's arguments through.
    fn before_start_block(&mut self) -> BlockIdx {
        let start = self.graph.startblock;
        let args = self.graph.blocks[start].inputargs.clone();
        let newargs = args.iter().map(|v| self.copyvar(*v)).collect::<Vec<_>>();
        let entry = self.graph.new_block(newargs.clone());
        self.graph.blocks[entry].exits =
            vec![Link::new(newargs.into_iter().map(Arg::Var).collect(), start)];
        self.graph.startblock = entry;
        entry
    }

    /// Turn the return block into an ordinary block, in front of a new return block taking a
    /// `Void` dummy. Returns the old return block.
    fn before_return_block(&mut self) -> BlockIdx {
        let block = self.graph.returnblock;
        let newblock = self.graph.split_block(block, 0);
        let dummy = self.new_var(LLType::Void, true);
        self.graph.blocks[newblock].inputargs = vec![dummy];
        self.graph.blocks[block].exits[0].args = vec![Arg::Const(Constant::void())];
        self.graph.returnblock = newblock;
        block
    }

    /// The number of the resume point of `block`, creating its resume block if needed. The
    /// resume block restores the input arguments of `block` from the state's saved locals and
    /// greens.
    fn get_resume_point(&mut self, block: BlockIdx) -> i64 {
        if let Some((n, _)) = self.resumepoints.get(&block) {
            return *n;
        }
        let rb = self.graph.new_block(Vec::new());
        let (mut reds, mut greens) = (0, 0);
        let mut newvars = Vec::new();
        for v in self.graph.blocks[block].inputargs.clone() {
            let ty = self.graph.var_type(v).clone();
            if ty.is_void() {
                newvars.push(Arg::Const(Constant::void()));
            } else if self.is_green(v) {
                newvars.push(Arg::Var(self.genop(rb, TsOp::RestoreGreen(greens), vec![], ty, true)));
                greens += 1;
            } else {
                newvars.push(Arg::Var(self.genop(rb, TsOp::RestoreLocal(reds), vec![], ty, false)));
                reds += 1;
            }
        }
        self.graph.blocks[rb].exits = vec![Link::new(newvars, block)];
        let n = i64::try_from(self.resumepoints.len()).unwrap_or(i64::MAX);
        self.resumepoints.insert(block, (n, rb));
        n
    }

    fn resume_block(&mut self, block: BlockIdx) -> BlockIdx {
        self.get_resume_point(block);
        self.resumepoints[&block].1
    }

    // Passes.

    /// Find the blocks with several predecessors (local merge points), and those a
    /// `global_merge_point` hint designates.
    fn compute_merge_points(&mut self) -> Result<(), CompilationError> {
        let entrymap = self.graph.mkentrymap();
        let start = self.graph.startblock;
        let mut global = HashSet::new();
        for block in self.graph.iterblocks() {
            for (i, op) in self.graph.blocks[block].operations.iter().enumerate() {
                let TsOp::Orig(OpKind::Hint(flags)) = &op.kind else {
                    continue;
                };
                if flags.get("global_merge_point") != Some(&true) {
                    continue;
                }
                let err = |what: &str| CompilationError::HintError {
                    hints: "global_merge_point".into(),
                    value: format!("{what} in {}", self.graph.name),
                };
                if i != 0 {
                    return Err(err("an operation that does not start its block"));
                }
                let entries = entrymap.get(&block).map(|x| &x[..]).unwrap_or(&[]);
                if block == start || entries.len() > 1 {
                    global.insert(block);
                } else {
                    let prev = match entries.first() {
                        Some(Some((pb, _))) => *pb,
                        _ => return Err(err("an unreachable block")),
                    };
                    if entrymap.get(&prev).is_some_and(|x| x.len() > 1) {
                        global.insert(prev);
                    } else {
                        return Err(err("a block with no merging predecessor"));
                    }
                }
            }
        }
        let returnblock = self.graph.returnblock;
        for (block, links) in entrymap {
            if links.len() > 1 && block != returnblock {
                let kind = if global.contains(&block) {
                    MergeKind::Global
                } else {
                    MergeKind::Local
                };
                self.mergepoints.insert(block, kind);
            }
        }
        if global.contains(&start) {
            self.mergepoints.insert(start, MergeKind::Global);
        }
        Ok(())
    }

    fn insert_save_return(&mut self) {
        let block = self.before_return_block();
        let ret = Arg::Var(self.graph.blocks[block].inputargs[0]);
        match self.colour {
            Colour::Gray => {
                self.void_op(block, TsOp::SaveLocals, vec![]);
            }
            Colour::Yellow => {
                self.void_op(block, TsOp::SaveLocals, vec![]);
                self.void_op(block, TsOp::SaveGreens, vec![ret]);
            }
            Colour::Red => {
                self.void_op(block, TsOp::SaveLocals, vec![ret]);
            }
        }
        self.void_op(block, TsOp::SaveReturn, vec![]);
    }

    /// Replace every switch on a red boolean by a split, which queues the false case.
    fn insert_splits(&mut self) -> Result<(), CompilationError> {
        for block in self.graph.iterblocks() {
            let Some(Arg::Var(sw)) = self.graph.blocks[block].exitswitch.clone() else {
                continue;
            };
            if self.is_green(sw) {
                continue;
            }
            if *self.graph.var_type(sw) != LLType::Bool {
                return Err(CompilationError::General(format!(
                    "{}: switch on a red {} value",
                    self.graph.name,
                    self.graph.var_type(sw)
                )));
            }
            let link_f = self.graph.blocks[block]
                .exits
                .iter()
                .find(|l| l.exitcase == Some(ExitCase::Bool(false)))
                .cloned()
                .ok_or_else(|| {
                    CompilationError::InternalError(format!(
                        "{}: boolean switch without a false exit",
                        self.graph.name
                    ))
                })?;
            let targetargs = self.graph.blocks[link_f.target].inputargs.clone();
            let (reds, greens) = self.sort_by_colour(&link_f.args, Some(&targetargs));
            self.void_op(block, TsOp::SaveLocals, reds);
            let resumepoint = self.get_resume_point(link_f.target);
            let mut args = vec![Arg::Var(sw)];
            args.extend(greens);
            let flag = self.genop(block, TsOp::Split { resumepoint }, args, LLType::Bool, true);
            self.graph.blocks[block].exitswitch = Some(Arg::Var(flag));
        }
        Ok(())
    }

    fn split_after_calls(&mut self) -> Result<(), CompilationError> {
        let calls = self.calls;
        for block in self.graph.iterblocks() {
            for i in (0..self.graph.blocks[block].operations.len()).rev() {
                let op = &self.graph.blocks[block].operations[i];
                if !matches!(
                    op.kind,
                    TsOp::Orig(OpKind::DirectCall(_) | OpKind::IndirectCall(_))
                ) {
                    continue;
                }
                let info = calls.get(&op.result).ok_or_else(|| {
                    CompilationError::InternalError(format!(
                        "{}: unresolved call to {}",
                        self.graph.name, op.kind
                    ))
                })?;
                match info.colour {
                    Colour::Red | Colour::Gray => self.handle_red_call(block, i, info)?,
                    Colour::Yellow => self.handle_yellow_call(block, i, info)?,
                }
            }
        }
        Ok(())
    }

    /// Emit the call itself at the end of `block`, after saving `reds`, and leave for the
    /// dispatcher if the state finished inside the callee.
    fn make_call(
        &mut self,
        block: BlockIdx,
        op: &SpaceOp<TsOp>,
        kind: &OpKind,
        reds: Vec<Arg>,
        info: &CallInfo,
    ) -> Result<(), CompilationError> {
        self.void_op(block, TsOp::SaveLocals, reds);
        let flag = match kind {
            OpKind::DirectCall(_) => {
                let call = if info.portal {
                    TsOp::PortalCall
                } else {
                    let target = *info.targets.first().ok_or_else(|| {
                        CompilationError::InternalError("direct call without a target".into())
                    })?;
                    TsOp::Call {
                        colour: info.colour,
                        target,
                    }
                };
                self.genop(block, call, op.args.clone(), LLType::Bool, true)
            }
            OpKind::IndirectCall(family) => {
                let mut args = op.args.clone();
                if !self.is_green_arg(&args[0]) {
                    // Only reached once the function pointer is known to be constant.
                    let ty = self.graph.arg_type(&args[0]);
                    let f = self.genop(block, TsOp::Revealconst, vec![args[0].clone()], ty, true);
                    args[0] = Arg::Var(f);
                }
                let call = TsOp::IndirectCall {
                    colour: info.colour,
                    family: Rc::clone(family),
                    targets: Rc::new(info.targets.clone()),
                };
                self.genop(block, call, args, LLType::Bool, true)
            }
            _ => {
                return Err(CompilationError::InternalError(format!(
                    "{kind:?} is not a call"
                )))
            }
        };
        self.go_to_dispatcher_if(block, flag)
    }

    fn orig_kind(&self, op: &SpaceOp<TsOp>) -> Result<OpKind, CompilationError> {
        match &op.kind {
            TsOp::Orig(k) => Ok(k.clone()),
            k => Err(CompilationError::InternalError(format!(
                "{}: expected a call, found {k}",
                self.graph.name
            ))),
        }
    }

    /// A call returning a red value (or nothing). The caller's reds are saved; the callee's
    /// result arrives as local 0 of the resume point after the call. A red function pointer
    /// that is not constant at specialization time makes the call residual.
    fn handle_red_call(
        &mut self,
        block: BlockIdx,
        pos: usize,
        info: &CallInfo,
    ) -> Result<(), CompilationError> {
        let nextblock = self.split_block(block, pos + 1);
        let op = self.graph.blocks[block]
            .operations
            .pop()
            .ok_or_else(|| CompilationError::InternalError("call vanished".into()))?;
        let kind = self.orig_kind(&op)?;
        let mut linkargs = mem::take(&mut self.graph.blocks[block].exits[0].args);
        let mut varsalive = linkargs.clone();
        let res = Arg::Var(op.result);

        if info.colour == Colour::Red {
            if self.is_green(op.result) {
                return Err(CompilationError::General(format!(
                    "{}: call returning a red value into a green variable",
                    self.graph.name
                )));
            }
            match varsalive.iter().position(|a| *a == res) {
                None => {
                    linkargs.insert(0, res);
                    let v = self.copyvar(op.result);
                    self.graph.blocks[nextblock].inputargs.insert(0, v);
                }
                Some(i) => {
                    varsalive.remove(i);
                    let a = linkargs.remove(i);
                    linkargs.insert(0, a);
                    let ia = &mut self.graph.blocks[nextblock].inputargs;
                    let v = ia.remove(i);
                    ia.insert(0, v);
                }
            }
        } else if let Some(i) = varsalive.iter().position(|a| *a == res) {
            varsalive.remove(i);
            linkargs.remove(i);
            linkargs.insert(0, Arg::Const(Constant::void()));
            let ia = &mut self.graph.blocks[nextblock].inputargs;
            let v = ia.remove(i);
            ia.insert(0, v);
        }
        let (reds, greens) = self.sort_by_colour(&varsalive, None);

        let func_green = match &kind {
            OpKind::DirectCall(_) => true,
            _ => self.is_green_arg(&op.args[0]),
        };
        let (constantblock, nonconstantblock) = if func_green {
            (block, None)
        } else {
            let cb = self.graph.new_block(Vec::new());
            let ncb = self.graph.new_block(Vec::new());
            let flag = self.genop(block, TsOp::IsConstant, vec![op.args[0].clone()], LLType::Bool, true);
            self.genswitch(block, flag, ncb, cb);
            (cb, Some(ncb))
        };

        let nops = self.graph.blocks[constantblock].operations.len();
        let postblock = self.graph.naive_split_block(constantblock, nops);
        self.make_call(constantblock, &op, &kind, reds, info)?;

        let resumepoint = self.get_resume_point(nextblock);
        self.void_op(postblock, TsOp::CollectSplit { resumepoint }, greens);
        let rb = self.resume_block(nextblock);
        let pb = &mut self.graph.blocks[postblock];
        pb.exitswitch = None;
        pb.recloseblock(vec![Link::new(Vec::new(), rb)]);

        if let Some(ncb) = nonconstantblock {
            let OpKind::IndirectCall(family) = &kind else {
                return Err(CompilationError::InternalError(
                    "red function pointer in a direct call".into(),
                ));
            };
            let v_res = self.copyvar(op.result);
            self.graph.blocks[ncb].operations.push(SpaceOp {
                kind: TsOp::ResidualCall(Residual::Indirect(Rc::clone(family))),
                args: op.args.clone(),
                result: v_res,
            });
            if info.colour == Colour::Red {
                linkargs[0] = Arg::Var(v_res);
            }
            self.graph.blocks[ncb].recloseblock(vec![Link::new(linkargs, nextblock)]);
        }
        Ok(())
    }

    /// A call returning a green value. Each state returning from the callee carries the
    /// result as its green 0, so the block after the call becomes a merge point for them.
    fn handle_yellow_call(
        &mut self,
        block: BlockIdx,
        pos: usize,
        info: &CallInfo,
    ) -> Result<(), CompilationError> {
        let result = self.graph.blocks[block].operations[pos].result;
        if !self.is_green(result) {
            // The caller sees a red value: convert the green result right after the call.
            let ty = self.graph.var_type(result).clone();
            let tmp = self.new_var(ty, true);
            let ops = &mut self.graph.blocks[block].operations;
            ops[pos].result = tmp;
            ops.insert(
                pos + 1,
                SpaceOp {
                    kind: TsOp::RedSameAs,
                    args: vec![Arg::Var(tmp)],
                    result,
                },
            );
        }
        let nextblock = self.split_block(block, pos + 1);
        let op = self.graph.blocks[block]
            .operations
            .pop()
            .ok_or_else(|| CompilationError::InternalError("call vanished".into()))?;
        let kind = self.orig_kind(&op)?;
        let mut varsalive = mem::take(&mut self.graph.blocks[block].exits[0].args);
        match varsalive.iter().position(|a| *a == Arg::Var(op.result)) {
            Some(i) => {
                varsalive.remove(i);
                let ia = &mut self.graph.blocks[nextblock].inputargs;
                let v = ia.remove(i);
                ia.insert(0, v);
            }
            None => {
                let v = self.copyvar(op.result);
                self.graph.blocks[nextblock].inputargs.insert(0, v);
            }
        }
        let (reds, greens) = self.sort_by_colour(&varsalive, None);
        let nops = self.graph.blocks[block].operations.len();
        let postblock = self.graph.naive_split_block(block, nops);
        self.make_call(block, &op, &kind, reds, info)?;

        let resumepoint = self.get_resume_point(nextblock);
        self.void_op(postblock, TsOp::CollectSplit { resumepoint }, greens);
        let rb = self.resume_block(nextblock);
        let pb = &mut self.graph.blocks[postblock];
        pb.exitswitch = None;
        pb.recloseblock(vec![Link::new(Vec::new(), rb)]);
        self.mergepoints.insert(nextblock, MergeKind::Local);
        Ok(())
    }

    fn handle_hints(&mut self) -> Result<(), CompilationError> {
        for block in self.graph.iterblocks() {
            for i in (0..self.graph.blocks[block].operations.len()).rev() {
                let op = &self.graph.blocks[block].operations[i];
                let TsOp::Orig(OpKind::Hint(flags)) = &op.kind else {
                    continue;
                };
                let flag = |name: &str| flags.get(name) == Some(&true);
                let (promote, forget, reverse, merge) = (
                    flag("promote"),
                    flag("forget"),
                    flag("reverse_split_queue"),
                    flag("global_merge_point"),
                );
                let green = self.is_green(op.result);
                if promote {
                    self.handle_promote(block, i)?;
                } else if forget {
                    self.graph.blocks[block].operations[i].kind = TsOp::Revealconst;
                } else if reverse {
                    let op = &mut self.graph.blocks[block].operations[i];
                    op.kind = TsOp::ReverseSplitQueue;
                    op.args.clear();
                } else if merge {
                    // The merge itself was placed by `compute_merge_points`; what remains is a
                    // void marker whose argument may be red.
                    let op = &mut self.graph.blocks[block].operations[i];
                    op.kind = TsOp::GreenSameAs;
                    op.args = vec![Arg::Const(Constant::void())];
                } else {
                    self.graph.blocks[block].operations[i].kind = if green {
                        TsOp::GreenSameAs
                    } else {
                        TsOp::RedSameAs
                    };
                }
            }
        }
        Ok(())
    }

    /// Promote a red value: the state stops at a promotion point, and goes on (in a later
    /// compilation) once per run-time value, with the value constant.
    fn handle_promote(&mut self, block: BlockIdx, i: usize) -> Result<(), CompilationError> {
        let v = self.graph.blocks[block].operations[i].args[0].clone();
        if self.is_green_arg(&v) {
            self.graph.blocks[block].operations[i].kind = TsOp::GreenSameAs;
            return Ok(());
        }
        self.graph.blocks[block].operations[i].kind = TsOp::Revealconst;
        self.split_block(block, i);
        let linkargs = self.graph.blocks[block].exits[0].args.clone();
        let (reds, _) = self.sort_by_colour(&linkargs, None);
        self.void_op(block, TsOp::SaveLocals, reds);
        let flag = self.genop(block, TsOp::Promote, vec![v], LLType::Bool, true);
        self.go_to_dispatcher_if(block, flag)
    }

    fn insert_merge_points(&mut self) -> Result<(), CompilationError> {
        for (block, kind) in mem::take(&mut self.mergepoints) {
            self.insert_merge(block, kind)?;
        }
        Ok(())
    }

    /// Make `block` a merge point. The states reaching it save their reds and are merged on
    /// their greens; the block's operations then start from the restored reds. A global merge
    /// point first parks the state on the queue's global chain, so every state reaches it
    /// through the dispatcher.
    fn insert_merge(&mut self, block: BlockIdx, kind: MergeKind) -> Result<(), CompilationError> {
        let allvars = self.graph.blocks[block].inputargs.clone();
        let copies = allvars.iter().map(|v| self.copyvar(*v)).collect::<Vec<_>>();
        self.graph.blocks[block].inputargs = copies.clone();
        let copy_args = copies.iter().copied().map(Arg::Var).collect::<Vec<_>>();
        let all_args = allvars.iter().copied().map(Arg::Var).collect::<Vec<_>>();
        let (reds1, greens1) = self.sort_by_colour(&copy_args, None);
        let (reds3, greens3) = self.sort_by_colour(&all_args, None);
        let nextblock = self.graph.naive_split_block(block, 0);
        self.void_op(block, TsOp::SaveLocals, reds1);

        let mp = self.mp_count;
        self.mp_count += 1;
        let (mergeblock, greens2) = match kind {
            MergeKind::Global => {
                self.has_global = true;
                let mut greens2 = Vec::with_capacity(greens1.len());
                for g in &greens1 {
                    match g {
                        Arg::Var(v) => greens2.push(Arg::Var(self.copyvar(*v))),
                        Arg::Const(_) => greens2.push(g.clone()),
                    }
                }
                let nops = self.graph.blocks[block].operations.len();
                let mergeblock = self.graph.naive_split_block(block, nops);
                self.graph.blocks[mergeblock].inputargs =
                    greens2.iter().filter_map(Arg::as_var).collect();
                self.void_op(block, TsOp::SaveGreens, greens1);
                let rb = self.graph.returnblock;
                self.graph.blocks[block].recloseblock(vec![Link::new(
                    vec![Arg::Const(Constant::void())],
                    rb,
                )]);
                let resumepoint = self.get_resume_point(mergeblock);
                self.void_op(block, TsOp::GuardGlobalMerge { resumepoint }, vec![]);
                (mergeblock, greens2)
            }
            MergeKind::Local => (block, greens1),
        };
        self.graph.blocks[mergeblock].exits[0].args = greens2.clone();
        self.graph.blocks[nextblock].inputargs = greens3.iter().filter_map(Arg::as_var).collect();

        let flag = self.genop(
            mergeblock,
            TsOp::MergePoint {
                mp,
                resume_after: None,
            },
            greens2,
            LLType::Bool,
            true,
        );
        let mpop = self.graph.blocks[mergeblock].operations.len() - 1;
        self.go_to_dispatcher_if(mergeblock, flag)?;

        let restores = reds3
            .iter()
            .enumerate()
            .filter_map(|(i, a)| {
                a.as_var().map(|v| SpaceOp {
                    kind: TsOp::RestoreLocal(i),
                    args: Vec::new(),
                    result: v,
                })
            })
            .collect::<Vec<_>>();
        self.graph.blocks[nextblock].operations.splice(0..0, restores);

        if kind == MergeKind::Global {
            let n = self.get_resume_point(nextblock);
            self.graph.blocks[mergeblock].operations[mpop].kind = TsOp::MergePoint {
                mp,
                resume_after: Some(n),
            };
        }
        Ok(())
    }

    fn insert_enter_frame(&mut self) {
        let entry = self.before_start_block();
        self.void_op(entry, TsOp::EnterFrame, vec![]);
    }

    /// Add the dispatcher in front of the return block: pick the next queued state and jump
    /// to its resume point, or fall through to the return block once no state is left. A graph
    /// with global merge points is also entered through the dispatcher when resumed.
    fn insert_dispatcher(&mut self) -> Result<(), CompilationError> {
        if self.resumepoints.is_empty() {
            return Ok(());
        }
        let mut block = self.before_return_block();
        self.void_op(block, TsOp::DispatchNext, vec![]);
        if self.has_global {
            block = self.before_return_block();
            let entry = self.before_start_block();
            let rp = self.genop(entry, TsOp::GetResumepoint, vec![], LLType::Signed, true);
            let abnormal = self.genop(
                entry,
                TsOp::Green(LLOp::IntGe),
                vec![Arg::Var(rp), Arg::Const(Constant::signed(0))],
                LLType::Bool,
                true,
            );
            self.go_to_if(entry, block, abnormal)?;
        }
        let v = self.genop(block, TsOp::GetResumepoint, vec![], LLType::Signed, true);
        let b = &mut self.graph.blocks[block];
        b.exitswitch = Some(Arg::Var(v));
        let mut default = b.exits.remove(0);
        default.exitcase = Some(ExitCase::Default);
        let mut cases = self.resumepoints.values().copied().collect::<Vec<_>>();
        cases.sort();
        let mut links = cases
            .into_iter()
            .map(|(n, rb)| Link {
                args: Vec::new(),
                target: rb,
                exitcase: Some(ExitCase::Int(n)),
            })
            .collect::<Vec<_>>();
        links.push(default);
        self.graph.blocks[block].recloseblock(links);
        Ok(())
    }

    fn insert_ensure_queue(&mut self) {
        let entry = self.before_start_block();
        let replayable = self.has_global;
        self.void_op(entry, TsOp::EnsureQueue { replayable }, vec![]);
    }

    fn insert_leave_graph(&mut self) {
        let block = self.before_return_block();
        self.void_op(block, TsOp::LeaveGraph(self.colour), vec![]);
    }
}

/// Does `graph` (or anything it calls) write memory, allocate, or call an impure function?
/// `memo` caches the answer per graph; graphs still being analyzed count as pure.
pub(crate) fn has_sideeffects(
    program: &Program,
    graph: GraphIdx,
    memo: &mut HashMap<GraphIdx, bool>,
) -> Result<bool, CompilationError> {
    if let Some(x) = memo.get(&graph) {
        return Ok(*x);
    }
    memo.insert(graph, false);
    let g = Rc::clone(program.graph(graph)?);
    let mut effects = false;
    'blocks: for b in g.iterblocks() {
        for op in &g.blocks[b].operations {
            effects = match &op.kind {
                OpKind::Op(llop) => llop.sideeffects(),
                OpKind::Setfield(_)
                | OpKind::Setarrayitem
                | OpKind::Malloc(_)
                | OpKind::MallocVarsize(_)
                | OpKind::GetExc(_)
                | OpKind::SetExc(_) => true,
                OpKind::DirectCall(Callee::External(f)) => !f.pure,
                OpKind::DirectCall(Callee::Graph(callee)) => {
                    has_sideeffects(program, *callee, memo)?
                }
                OpKind::IndirectCall(family) => {
                    let mut any = false;
                    for callee in family.iter() {
                        any |= has_sideeffects(program, *callee, memo)?;
                    }
                    any
                }
                _ => false,
            };
            if effects {
                break 'blocks;
            }
        }
    }
    memo.insert(graph, effects);
    Ok(effects)
}

/// Can a call to `graph` return with an exception pending? True if it sets the exception or
/// calls a graph that can.
pub(crate) fn can_raise(
    program: &Program,
    graph: GraphIdx,
    memo: &mut HashMap<GraphIdx, bool>,
) -> Result<bool, CompilationError> {
    if let Some(x) = memo.get(&graph) {
        return Ok(*x);
    }
    memo.insert(graph, false);
    let g = Rc::clone(program.graph(graph)?);
    let mut raises = false;
    for b in g.iterblocks() {
        for op in &g.blocks[b].operations {
            raises |= match &op.kind {
                OpKind::SetExc(_) => true,
                OpKind::DirectCall(Callee::Graph(callee)) => can_raise(program, *callee, memo)?,
                OpKind::IndirectCall(family) => {
                    let mut any = false;
                    for callee in family.iter() {
                        any |= can_raise(program, *callee, memo)?;
                    }
                    any
                }
                _ => false,
            };
        }
    }
    memo.insert(graph, raises);
    Ok(raises)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flowgraph::builder::GraphBuilder, lltype::ExcField};

    #[test]
    fn raising_through_calls() {
        let s = LLType::Signed;
        let mut p = Program::new();
        let mut gb = GraphBuilder::new("leaf", &[s.clone()], s.clone());
        let x = gb.args()[0];
        let sb = gb.startblock();
        gb.op(sb, OpKind::SetExc(ExcField::Type), vec![x.into()], LLType::Void);
        gb.ret(sb, x.into());
        let leaf = p.add(gb.finish().unwrap()).unwrap();

        // rec calls itself and leaf; pure only calls itself.
        let mut graphs = Vec::new();
        for (name, callee) in [("rec", Some(leaf)), ("pure", None)] {
            let g = p.declare(name);
            let mut gb = GraphBuilder::new(name, &[s.clone()], s.clone());
            let x = gb.args()[0];
            let sb = gb.startblock();
            let mut r = gb.op(sb, OpKind::DirectCall(Callee::Graph(g)), vec![x.into()], s.clone());
            if let Some(c) = callee {
                r = gb.op(sb, OpKind::DirectCall(Callee::Graph(c)), vec![r.into()], s.clone());
            }
            gb.ret(sb, r.into());
            p.define(g, gb.finish().unwrap()).unwrap();
            graphs.push(g);
        }
        let mut memo = HashMap::new();
        assert!(can_raise(&p, leaf, &mut memo).unwrap());
        assert!(can_raise(&p, graphs[0], &mut memo).unwrap());
        assert!(!can_raise(&p, graphs[1], &mut memo).unwrap());
        assert!(!has_sideeffects(&p, graphs[1], &mut HashMap::new()).unwrap());
        assert!(has_sideeffects(&p, leaf, &mut HashMap::new()).unwrap());
    }
}
