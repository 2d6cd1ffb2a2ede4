//! The portal: the entry point of a timeshifted program, and the cache of its specializations.
//!
//! A [Timeshifter] annotates and timeshifts a program once, then compiles one native function
//! per distinct tuple of green portal arguments, on demand. Each compiled function takes the
//! red arguments only.

use super::{
    hrtyper::HrTyper,
    interp::Val,
    promotion::fatal,
    rtimeshift::{Engine, JsIdx},
    TsGraphIdx,
};
use crate::{
    codegen::{GenBuilder, GenVar, RGenOp},
    config::Config,
    error::CompilationError,
    flowgraph::{
        llinterp::{graph_of_fnptr, LLInterpreter},
        GraphIdx, Program,
    },
    hintannotator::{HGraphIdx, HValue, HintAnnotator, HintPolicy},
    log::{
        stats::{Stats, TimingState},
        Verbosity,
    },
    lltype::{call_native, tsrt_exc_clear, LLType},
};
use index_vec::IndexVec;
use std::{cell::RefCell, collections::HashMap, rc::Rc};

/// Is a portal argument known at specialization time?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortalArg {
    /// Specialized on: one native function is compiled per distinct value.
    Green,
    /// Passed to the compiled function at run time.
    Red,
}

impl PortalArg {
    pub fn is_green(self) -> bool {
        self == PortalArg::Green
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PortalDesc {
    pub(crate) tsgraph: TsGraphIdx,
    pub(crate) args: Vec<PortalArg>,
    pub(crate) kinds: Vec<LLType>,
    pub(crate) result: LLType,
    pub(crate) name: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CompiledPortal {
    pub(crate) entry: usize,
}

/// The most words a residual call to a graph passes, not counting the target itself.
const MAX_RESIDUAL_ARGS: usize = 5;

/// A graph (or a family of graphs called through a function pointer) that specialized code calls
/// residually. Generated code passes the address of its target to [tsrt_residual_call], which
/// runs the graph with the program's interpreter.
pub(crate) struct ResidualTarget {
    program: Rc<Program>,
    family: Vec<GraphIdx>,
    indirect: bool,
    nargs: usize,
}

impl ResidualTarget {
    fn run(&self, args: &[i64; MAX_RESIDUAL_ARGS]) -> Result<i64, CompilationError> {
        let args = &args[..self.nargs];
        let mut interp = LLInterpreter::new(&self.program);
        if self.indirect {
            let g = graph_of_fnptr(args[0], &self.family)?;
            interp.eval_graph(g, &args[1..])
        } else {
            interp.eval_graph(self.family[0], args)
        }
    }
}

pub(crate) extern "C" fn tsrt_residual_call(
    target: i64,
    a0: i64,
    a1: i64,
    a2: i64,
    a3: i64,
    a4: i64,
) -> i64 {
    let target = unsafe { &*(target as *const ResidualTarget) };
    match target.run(&[a0, a1, a2, a3, a4]) {
        Ok(r) => r,
        Err(e) => fatal(e),
    }
}

impl Engine {
    /// The native function and first argument with which generated code calls `family`
    /// residually with `nargs` arguments (the function pointer included, if `indirect`).
    pub(crate) fn residual_target(
        &mut self,
        family: &[GraphIdx],
        indirect: bool,
        nargs: usize,
    ) -> Result<(i64, i64), CompilationError> {
        if nargs > MAX_RESIDUAL_ARGS {
            return Err(CompilationError::LimitExceeded(format!(
                "residual calls to graphs take at most {MAX_RESIDUAL_ARGS} arguments, got {nargs}"
            )));
        }
        let fnaddr = tsrt_residual_call as usize as i64;
        if let Some(i) = self
            .residual_targets
            .iter()
            .position(|t| t.family == family && t.indirect == indirect && t.nargs == nargs)
        {
            let t: &ResidualTarget = &self.residual_targets[i];
            return Ok((fnaddr, t as *const ResidualTarget as i64));
        }
        let t = Box::new(ResidualTarget {
            program: Rc::clone(&self.program),
            family: family.to_vec(),
            indirect,
            nargs,
        });
        let ctx = &*t as *const ResidualTarget as i64;
        self.residual_targets.push(t);
        Ok((fnaddr, ctx))
    }

    /// The specialization of the portal for `greens`, compiling it if needed. A specialization
    /// is cached before its compilation starts, so recursive portal calls reuse it.
    pub(crate) fn compile_portal(
        &mut self,
        greens: &[i64],
    ) -> Result<CompiledPortal, CompilationError> {
        if let Some(c) = self.portal_cache.get(greens) {
            return Ok(*c);
        }
        let desc = self
            .portal
            .clone()
            .ok_or_else(|| CompilationError::InternalError("no portal".into()))?;
        let ngreens = desc.args.iter().filter(|a| a.is_green()).count();
        if greens.len() != ngreens {
            return Err(CompilationError::General(format!(
                "{} takes {ngreens} green arguments, got {}",
                desc.name,
                greens.len()
            )));
        }
        let name = format!("{}_{}", desc.name, self.portal_cache.len());
        let (builder, entry, gvs) = self
            .rgenop
            .newgraph(desc.args.len() - ngreens, &name)?;
        let compiled = CompiledPortal { entry };
        self.portal_cache.insert(greens.to_vec(), compiled);
        self.enter_compile();
        let r = self.specialize_portal(&desc, greens, builder, gvs);
        self.leave_compile();
        match r {
            Ok(()) => {
                self.stats.portal_compiled_ok();
                self.log.log(
                    Verbosity::SpecializationEvent,
                    &format!("compiled {name} for {greens:?}"),
                );
                Ok(compiled)
            }
            Err(e) => {
                self.portal_cache.remove(greens);
                self.stats.portal_compiled_err();
                self.log
                    .log(Verbosity::Error, &format!("compiling {name}: {e}"));
                Err(e)
            }
        }
    }

    fn specialize_portal(
        &mut self,
        desc: &PortalDesc,
        greens: &[i64],
        builder: Box<dyn GenBuilder>,
        gvs: Vec<GenVar>,
    ) -> Result<(), CompilationError> {
        let js = self.fresh_jitstate(builder);
        let mut greens = greens.iter();
        let mut gvs = gvs.into_iter();
        let mut args = Vec::with_capacity(desc.args.len());
        for (a, kind) in desc.args.iter().zip(&desc.kinds) {
            let v = match a {
                PortalArg::Green => greens.next().map(|x| Val::Green(*x)),
                PortalArg::Red => gvs
                    .next()
                    .map(|gv| Val::Red(self.boxes.var(kind.clone(), gv))),
            };
            args.push(v.ok_or_else(|| {
                CompilationError::InternalError("portal arguments ran out".into())
            })?);
        }
        self.run_portal(desc.tsgraph, js, args)
    }

    fn run_portal(
        &mut self,
        tsgraph: TsGraphIdx,
        js: JsIdx,
        args: Vec<Val>,
    ) -> Result<(), CompilationError> {
        if let Some(js) = self.run_tsgraph(tsgraph, js, args)? {
            self.finish_jitstate(js)?;
        }
        Ok(())
    }
}

/// A program prepared for specialization at `portal`.
///
/// ```ignore
/// let ts = Timeshifter::new(program, f, &[PortalArg::Green, PortalArg::Red],
///                           HintPolicy::new(), Config::from_env()?)?;
/// assert_eq!(ts.call(&[5, 7])?, 12);
/// ```
pub struct Timeshifter {
    engine: Rc<RefCell<Engine>>,
    args: Vec<PortalArg>,
}

impl Timeshifter {
    /// Annotate and timeshift everything reachable from `portal`, whose arguments are green or
    /// red as `args` says. No code is generated until the first [Timeshifter::specialize].
    pub fn new(
        program: Program,
        portal: GraphIdx,
        args: &[PortalArg],
        policy: HintPolicy,
        config: Config,
    ) -> Result<Self, CompilationError> {
        let program = Rc::new(program);
        let engine = Engine::new(Rc::clone(&program), config)?;
        let graph = program.graph(portal)?;
        if graph.getargs().len() != args.len() {
            return Err(CompilationError::General(format!(
                "{} takes {} arguments, but {} portal arguments were given",
                graph.name,
                graph.getargs().len(),
                args.len()
            )));
        }
        let kinds = graph
            .getargs()
            .iter()
            .map(|v| graph.var_type(*v).clone())
            .collect::<Vec<_>>();
        let hvalues = args
            .iter()
            .zip(&kinds)
            .map(|(a, k)| match a {
                PortalArg::Green => HValue::concrete(k.clone()),
                PortalArg::Red => HValue::variable(k.clone()),
            })
            .collect::<Vec<_>>();

        let stats = Rc::clone(&engine.borrow().stats);
        let r = timeshift_program(&program, portal, &hvalues, policy, &stats);
        stats.timing_state(TimingState::None);
        let (hg, tsgraphs) = r?;

        let mut e = engine.borrow_mut();
        e.log.log(
            Verbosity::SpecializationEvent,
            &format!("timeshifted {} graphs for {}", tsgraphs.len(), graph.name),
        );
        e.tsgraphs = tsgraphs.into_iter().map(Rc::new).collect();
        e.portal = Some(PortalDesc {
            tsgraph: TsGraphIdx::from_usize(hg.index()),
            args: args.to_vec(),
            kinds,
            result: graph.var_type(graph.getreturnvar()).clone(),
            name: graph.name.clone(),
        });
        drop(e);
        Ok(Self {
            engine,
            args: args.to_vec(),
        })
    }

    /// The entry address of the native function specialized for `greens`, the values of the
    /// green portal arguments in order. It takes the red arguments.
    pub fn specialize(&self, greens: &[i64]) -> Result<usize, CompilationError> {
        let mut e = self.engine.try_borrow_mut().map_err(|_| {
            CompilationError::InternalError("specializing while specializing".into())
        })?;
        e.stats.timing_state(TimingState::Specializing);
        let r = e.compile_portal(greens);
        e.stats.timing_state(TimingState::None);
        Ok(r?.entry)
    }

    /// Run the portal on `args` (all of them, green and red) through its specialization. If the
    /// portal raises, its exception is left for [crate::lltype::take_exception]; one already
    /// pending is discarded first.
    pub fn call(&self, args: &[i64]) -> Result<i64, CompilationError> {
        if args.len() != self.args.len() {
            return Err(CompilationError::General(format!(
                "the portal takes {} arguments, got {}",
                self.args.len(),
                args.len()
            )));
        }
        let (greens, reds): (Vec<_>, Vec<_>) = args
            .iter()
            .zip(&self.args)
            .partition(|(_, a)| a.is_green());
        let greens = greens.into_iter().map(|(x, _)| *x).collect::<Vec<_>>();
        let reds = reds.into_iter().map(|(x, _)| *x).collect::<Vec<_>>();
        let entry = self.specialize(&greens)?;
        tsrt_exc_clear();
        unsafe { call_native(entry as i64, &reds) }
    }

    /// How many of each abstract operation have been generated so far.
    pub fn insns(&self) -> HashMap<&'static str, usize> {
        self.engine.borrow().rgenop.insns()
    }

    pub fn reset_insns(&self) {
        self.engine.borrow().rgenop.reset_insns()
    }
}

fn timeshift_program(
    program: &Program,
    portal: GraphIdx,
    args: &[HValue],
    policy: HintPolicy,
    stats: &Stats,
) -> Result<(HGraphIdx, IndexVec<TsGraphIdx, super::TsGraph>), CompilationError> {
    stats.timing_state(TimingState::HintAnnotating);
    let mut ha = HintAnnotator::new(program, policy);
    let hg = ha.build_types(portal, args)?;
    stats.timing_state(TimingState::Timeshifting);
    let tsgraphs = HrTyper::new(program, &ha, hg).specialize()?;
    Ok((hg, tsgraphs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flowgraph::{builder::GraphBuilder, Callee, Constant, OpKind},
        lltype::{take_exception, ExcField, LLOp},
    };

    const VALUE_ERROR: i64 = 0x51;

    fn s() -> LLType {
        LLType::Signed
    }

    fn timeshifter(p: Program, f: GraphIdx, args: &[PortalArg]) -> Timeshifter {
        Timeshifter::new(p, f, args, HintPolicy::new(), Config::default()).unwrap()
    }

    /// f(x, y) = (x + 4) * y
    fn add_mul() -> (Program, GraphIdx) {
        let mut gb = GraphBuilder::new("add_mul", &[s(), s()], s());
        let [x, y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let a = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![x.into(), Constant::signed(4).into()], s());
        let r = gb.op(sb, OpKind::Op(LLOp::IntMul), vec![a.into(), y.into()], s());
        gb.ret(sb, r.into());
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        (p, f)
    }

    #[test]
    fn all_green() {
        let (p, f) = add_mul();
        let ts = timeshifter(p, f, &[PortalArg::Green, PortalArg::Green]);
        assert_eq!(ts.call(&[3, 2]).unwrap(), 14);
        let insns = ts.insns();
        assert!(!insns.contains_key("int_add"));
        assert!(!insns.contains_key("int_mul"));
    }

    #[test]
    fn green_and_red() {
        let (p, f) = add_mul();
        let ts = timeshifter(p, f, &[PortalArg::Green, PortalArg::Red]);
        assert_eq!(ts.call(&[3, 2]).unwrap(), 14);
        assert_eq!(ts.call(&[3, 5]).unwrap(), 35);
        assert_eq!(ts.insns().get("int_mul"), Some(&1));
        assert!(!ts.insns().contains_key("int_add"));
        assert_eq!(ts.call(&[0, 5]).unwrap(), 20);
        assert_eq!(ts.insns().get("int_mul"), Some(&2));
    }

    #[test]
    fn red_add() {
        let mut gb = GraphBuilder::new("add", &[s(), s()], s());
        let [x, y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![x.into(), y.into()], s());
        gb.ret(sb, r.into());
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Green, PortalArg::Red]);
        assert_eq!(ts.call(&[5, 7]).unwrap(), 12);
        assert_eq!(ts.insns().get("int_add"), Some(&1));
    }

    #[test]
    fn red_inputs_add() {
        let mut gb = GraphBuilder::new("add", &[s(), s()], s());
        let [x, y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![x.into(), y.into()], s());
        gb.ret(sb, r.into());
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Red, PortalArg::Red]);
        assert_eq!(ts.call(&[5, 7]).unwrap(), 12);
        assert_eq!(ts.call(&[-5, 2]).unwrap(), -3);
        assert_eq!(ts.insns(), HashMap::from([("int_add", 1)]));
    }

    #[test]
    fn specializations_are_cached() {
        let (p, f) = add_mul();
        let ts = timeshifter(p, f, &[PortalArg::Green, PortalArg::Red]);
        let e1 = ts.specialize(&[3]).unwrap();
        ts.reset_insns();
        assert_eq!(ts.specialize(&[3]).unwrap(), e1);
        assert!(ts.insns().is_empty());
        assert_ne!(ts.specialize(&[4]).unwrap(), e1);
        assert!(matches!(
            ts.specialize(&[3, 4]),
            Err(CompilationError::General(_))
        ));
        assert!(ts.call(&[1]).is_err());
    }

    #[test]
    fn virtual_structs_vanish() {
        // f(y) = { s = S(); s.a = y; s.b = 2; s.a * s.b }
        let st = LLType::new_struct("S", &[("a", s()), ("b", s())], false);
        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let v = gb.op(sb, OpKind::Malloc(st.clone()), vec![], st.clone());
        gb.op(sb, OpKind::Setfield("a".into()), vec![v.into(), y.into()], LLType::Void);
        gb.op(
            sb,
            OpKind::Setfield("b".into()),
            vec![v.into(), Constant::signed(2).into()],
            LLType::Void,
        );
        let a = gb.op(sb, OpKind::Getfield("a".into()), vec![v.into()], s());
        let b = gb.op(sb, OpKind::Getfield("b".into()), vec![v.into()], s());
        let r = gb.op(sb, OpKind::Op(LLOp::IntMul), vec![a.into(), b.into()], s());
        gb.ret(sb, r.into());
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Red]);
        assert_eq!(ts.call(&[21]).unwrap(), 42);
        let insns = ts.insns();
        for k in ["malloc", "getfield", "setfield"] {
            assert!(!insns.contains_key(k), "{k}");
        }
        assert_eq!(insns.get("int_mul"), Some(&1));
    }

    /// f(x, y) = { acc = 0; while x > 0 { acc += y; x -= 1 }; acc }
    fn add_loop() -> (Program, GraphIdx) {
        let mut gb = GraphBuilder::new("f", &[s(), s()], s());
        let [x, y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let (head, hargs) = gb.new_block(&[s(), s(), s()]);
        let (body, bargs) = gb.new_block(&[s(), s(), s()]);
        gb.goto(sb, head, vec![x.into(), y.into(), Constant::signed(0).into()]);
        let c = gb.op(
            head,
            OpKind::Op(LLOp::IntGt),
            vec![hargs[0].into(), Constant::signed(0).into()],
            LLType::Bool,
        );
        let rb = gb.returnblock();
        gb.branch(
            head,
            c.into(),
            (body, hargs.iter().map(|v| (*v).into()).collect()),
            (rb, vec![hargs[2].into()]),
        );
        let acc = gb.op(body, OpKind::Op(LLOp::IntAdd), vec![bargs[2].into(), bargs[1].into()], s());
        let x1 = gb.op(
            body,
            OpKind::Op(LLOp::IntSub),
            vec![bargs[0].into(), Constant::signed(1).into()],
            s(),
        );
        gb.goto(body, head, vec![x1.into(), bargs[1].into(), acc.into()]);
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        (p, f)
    }

    #[test]
    fn green_loops_unroll() {
        let (p, f) = add_loop();
        let ts = timeshifter(p, f, &[PortalArg::Green, PortalArg::Red]);
        assert_eq!(ts.call(&[7, 2]).unwrap(), 14);
        assert_eq!(ts.call(&[7, -3]).unwrap(), -21);
        let insns = ts.insns();
        assert_eq!(insns.get("int_add"), Some(&7));
        assert!(!insns.contains_key("int_sub"));
        assert!(!insns.contains_key("int_gt"));
    }

    #[test]
    fn red_loops_generalize_once() {
        let (p, f) = add_loop();
        let ts = timeshifter(p, f, &[PortalArg::Red, PortalArg::Red]);
        assert_eq!(ts.call(&[7, 2]).unwrap(), 14);
        assert_eq!(ts.call(&[0, 5]).unwrap(), 0);
        assert_eq!(ts.call(&[100, 3]).unwrap(), 300);
        // acc starts as the constant 0, so the loop body is compiled twice: once for the first
        // iteration and once with acc a variable.
        assert_eq!(
            ts.insns(),
            HashMap::from([("int_gt", 2), ("int_add", 2), ("int_sub", 2)])
        );
        assert_eq!(ts.engine.borrow().stats.counter("merges_generalized"), 1);
    }

    #[test]
    fn red_branches() {
        // f(x) = x > 0 ? x : -x
        let mut gb = GraphBuilder::new("abs", &[s()], s());
        let [x] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let c = gb.op(sb, OpKind::Op(LLOp::IntGt), vec![x.into(), Constant::signed(0).into()], LLType::Bool);
        let (neg, nargs) = gb.new_block(&[s()]);
        let n = gb.op(neg, OpKind::Op(LLOp::IntNeg), vec![nargs[0].into()], s());
        gb.ret(neg, n.into());
        let rb = gb.returnblock();
        gb.branch(sb, c.into(), (rb, vec![x.into()]), (neg, vec![x.into()]));
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Red]);
        assert_eq!(ts.call(&[5]).unwrap(), 5);
        assert_eq!(ts.call(&[-5]).unwrap(), 5);
        assert_eq!(ts.call(&[0]).unwrap(), 0);
        assert_eq!(ts.insns().get("int_gt"), Some(&1));
    }

    fn merge_hint() -> OpKind {
        OpKind::hint(&[("global_merge_point", true)])
    }

    fn promote_hint() -> OpKind {
        OpKind::hint(&[("promote", true)])
    }

    fn variable_hint() -> OpKind {
        OpKind::hint(&[("variable", true)])
    }

    fn counters(ts: &Timeshifter) -> (u64, u64) {
        let e = ts.engine.borrow();
        (e.stats.counter("flexswitch_arms"), e.stats.counter("continuations"))
    }

    #[test]
    fn promotion() {
        // f(x) = { hint(x, global_merge_point); promote(x) * 10 }
        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [x] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        gb.op(sb, merge_hint(), vec![x.into()], LLType::Void);
        let px = gb.op(sb, promote_hint(), vec![x.into()], s());
        let r = gb.op(sb, OpKind::Op(LLOp::IntMul), vec![px.into(), Constant::signed(10).into()], s());
        gb.ret(sb, r.into());
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Red]);
        assert_eq!(ts.call(&[3]).unwrap(), 30);
        assert_eq!(counters(&ts), (1, 1));
        // A value already seen takes its compiled case.
        assert_eq!(ts.call(&[3]).unwrap(), 30);
        assert_eq!(counters(&ts), (1, 1));
        assert_eq!(ts.call(&[4]).unwrap(), 40);
        assert_eq!(counters(&ts), (2, 2));
        assert_eq!(ts.call(&[3]).unwrap(), 30);
        assert_eq!(counters(&ts), (2, 2));
        // Each value was compiled as a constant.
        assert!(!ts.insns().contains_key("int_mul"));
        assert_eq!(ts.engine.borrow().pms.len(), 1);
    }

    #[test]
    fn many_promotions() {
        // f(n, total) = {
        //     while n > 0 { hint(n, global_merge_point); k = promote(n); total += k * k; n -= 1 }
        //     total
        // }
        let mut gb = GraphBuilder::new("f", &[s(), s()], s());
        let [n, total] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let (head, hargs) = gb.new_block(&[s(), s()]);
        let (body, bargs) = gb.new_block(&[s(), s()]);
        gb.goto(sb, head, vec![n.into(), total.into()]);
        let c = gb.op(
            head,
            OpKind::Op(LLOp::IntGt),
            vec![hargs[0].into(), Constant::signed(0).into()],
            LLType::Bool,
        );
        let rb = gb.returnblock();
        gb.branch(
            head,
            c.into(),
            (body, vec![hargs[0].into(), hargs[1].into()]),
            (rb, vec![hargs[1].into()]),
        );
        gb.op(body, merge_hint(), vec![bargs[0].into()], LLType::Void);
        let k = gb.op(body, promote_hint(), vec![bargs[0].into()], s());
        let kk = gb.op(body, OpKind::Op(LLOp::IntMul), vec![k.into(), k.into()], s());
        let kv = gb.op(body, variable_hint(), vec![kk.into()], s());
        let t1 = gb.op(body, OpKind::Op(LLOp::IntAdd), vec![bargs[1].into(), kv.into()], s());
        let n1 = gb.op(
            body,
            OpKind::Op(LLOp::IntSub),
            vec![bargs[0].into(), Constant::signed(1).into()],
            s(),
        );
        gb.goto(body, head, vec![n1.into(), t1.into()]);
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Red, PortalArg::Red]);
        assert_eq!(ts.call(&[10, 0]).unwrap(), 385);
        let insns = ts.insns();
        assert_eq!(insns.get("int_add"), Some(&10));
        assert!(!insns.contains_key("int_mul"));
        assert!(!insns.contains_key("int_sub"));
        assert_eq!(counters(&ts), (10, 10));
        // Every value of n up to 10 already has its case.
        assert_eq!(ts.call(&[3, 5]).unwrap(), 19);
        assert_eq!(counters(&ts), (10, 10));
        assert_eq!(ts.engine.borrow().pms.len(), 1);
    }

    #[test]
    fn promote_after_call() {
        // two(k, s) = if k > 5 { s.x = hint(20, variable) } else { s.x = hint(10, variable) }
        // f(n) = { hint(n, global_merge_point); s = S(); two(n, s); promote(n) * 17 + s.x }
        let st = LLType::new_struct("S", &[("x", s())], false);
        let mut p = Program::new();
        let mut gb = GraphBuilder::new("two", &[s(), st.clone()], LLType::Void);
        let [k, sp] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let c = gb.op(sb, OpKind::Op(LLOp::IntGt), vec![k.into(), Constant::signed(5).into()], LLType::Bool);
        let (big, bargs) = gb.new_block(&[st.clone()]);
        let (small, sargs) = gb.new_block(&[st.clone()]);
        gb.branch(sb, c.into(), (big, vec![sp.into()]), (small, vec![sp.into()]));
        let x = gb.op(big, variable_hint(), vec![Constant::signed(20).into()], s());
        gb.op(big, OpKind::Setfield("x".into()), vec![bargs[0].into(), x.into()], LLType::Void);
        gb.ret(big, Constant::void().into());
        let x = gb.op(small, variable_hint(), vec![Constant::signed(10).into()], s());
        gb.op(small, OpKind::Setfield("x".into()), vec![sargs[0].into(), x.into()], LLType::Void);
        gb.ret(small, Constant::void().into());
        let two = p.add(gb.finish().unwrap()).unwrap();

        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [n] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        gb.op(sb, merge_hint(), vec![n.into()], LLType::Void);
        let sp = gb.op(sb, OpKind::Malloc(st.clone()), vec![], st.clone());
        gb.op(
            sb,
            OpKind::DirectCall(Callee::Graph(two)),
            vec![n.into(), sp.into()],
            LLType::Void,
        );
        let pn = gb.op(sb, promote_hint(), vec![n.into()], s());
        let k = gb.op(sb, OpKind::Op(LLOp::IntMul), vec![pn.into(), Constant::signed(17).into()], s());
        let kv = gb.op(sb, variable_hint(), vec![k.into()], s());
        let x = gb.op(sb, OpKind::Getfield("x".into()), vec![sp.into()], s());
        let r = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![kv.into(), x.into()], s());
        gb.ret(sb, r.into());
        let f = p.add(gb.finish().unwrap()).unwrap();

        let ts = timeshifter(p, f, &[PortalArg::Red]);
        assert_eq!(ts.call(&[4]).unwrap(), 4 * 17 + 10);
        let insns = ts.insns();
        assert_eq!(insns.get("int_add"), Some(&1));
        assert!(!insns.contains_key("int_mul"));
        assert_eq!(ts.call(&[7]).unwrap(), 7 * 17 + 20);
        assert_eq!(ts.call(&[4]).unwrap(), 4 * 17 + 10);
        assert_eq!(counters(&ts), (2, 2));
        assert_eq!(ts.insns().get("int_add"), Some(&2));
    }

    #[test]
    fn promote_inside_call() {
        // two(m) = promote(m) * 17; f(n) = { hint(n, global_merge_point); two(n + 1) - 1 }
        let mut p = Program::new();
        let mut gb = GraphBuilder::new("two", &[s()], s());
        let [m] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let pm = gb.op(sb, promote_hint(), vec![m.into()], s());
        let k = gb.op(sb, OpKind::Op(LLOp::IntMul), vec![pm.into(), Constant::signed(17).into()], s());
        let kv = gb.op(sb, variable_hint(), vec![k.into()], s());
        gb.ret(sb, kv.into());
        let two = p.add(gb.finish().unwrap()).unwrap();

        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [n] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        gb.op(sb, merge_hint(), vec![n.into()], LLType::Void);
        let n1 = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![n.into(), Constant::signed(1).into()], s());
        let r = gb.op(sb, OpKind::DirectCall(Callee::Graph(two)), vec![n1.into()], s());
        let r1 = gb.op(sb, OpKind::Op(LLOp::IntSub), vec![r.into(), Constant::signed(1).into()], s());
        gb.ret(sb, r1.into());
        let f = p.add(gb.finish().unwrap()).unwrap();

        let ts = timeshifter(p, f, &[PortalArg::Red]);
        assert_eq!(ts.call(&[10]).unwrap(), 186);
        assert_eq!(ts.call(&[4]).unwrap(), 84);
        let insns = ts.insns();
        assert_eq!(insns.get("int_add"), Some(&1));
        assert!(!insns.contains_key("int_mul"));
        assert!(!insns.contains_key("int_sub"));
        assert_eq!(counters(&ts), (2, 2));
    }

    #[test]
    fn two_promotions() {
        // f(n, m) = { hint(n, global_merge_point); promote(n) + promote(m) }
        let mut gb = GraphBuilder::new("f", &[s(), s()], s());
        let [n, m] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        gb.op(sb, merge_hint(), vec![n.into()], LLType::Void);
        let n1 = gb.op(sb, promote_hint(), vec![n.into()], s());
        let m1 = gb.op(sb, promote_hint(), vec![m.into()], s());
        let r = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![n1.into(), m1.into()], s());
        let rv = gb.op(sb, variable_hint(), vec![r.into()], s());
        gb.ret(sb, rv.into());
        let mut p = Program::new();
        let f = p.add(gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Red, PortalArg::Red]);
        assert_eq!(ts.call(&[40, 2]).unwrap(), 42);
        assert_eq!(counters(&ts), (2, 2));
        assert_eq!(ts.call(&[40, 3]).unwrap(), 43);
        assert_eq!(counters(&ts), (3, 3));
        // A new n gets its own promotion point for m.
        assert_eq!(ts.call(&[41, 2]).unwrap(), 43);
        assert_eq!(counters(&ts), (5, 5));
        assert_eq!(ts.call(&[40, 2]).unwrap(), 42);
        assert_eq!(counters(&ts), (5, 5));
        assert!(!ts.insns().contains_key("int_add"));
        assert_eq!(ts.engine.borrow().pms.len(), 3);
    }

    #[test]
    fn portal_reentry() {
        // f(n, y) = n == 0 ? y : f(n - 1, y) + 1
        let mut p = Program::new();
        let f = p.declare("f");
        let mut gb = GraphBuilder::new("f", &[s(), s()], s());
        let [n, y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let c = gb.op(sb, OpKind::Op(LLOp::IntEq), vec![n.into(), Constant::signed(0).into()], LLType::Bool);
        let (rec, rargs) = gb.new_block(&[s(), s()]);
        let rb = gb.returnblock();
        gb.branch(sb, c.into(), (rb, vec![y.into()]), (rec, vec![n.into(), y.into()]));
        let n1 = gb.op(rec, OpKind::Op(LLOp::IntSub), vec![rargs[0].into(), Constant::signed(1).into()], s());
        let r = gb.op(rec, OpKind::DirectCall(Callee::Graph(f)), vec![n1.into(), rargs[1].into()], s());
        let r1 = gb.op(rec, OpKind::Op(LLOp::IntAdd), vec![r.into(), Constant::signed(1).into()], s());
        gb.ret(rec, r1.into());
        p.define(f, gb.finish().unwrap()).unwrap();
        let ts = timeshifter(p, f, &[PortalArg::Green, PortalArg::Red]);
        assert_eq!(ts.call(&[3, 10]).unwrap(), 13);
        assert_eq!(ts.call(&[1, 10]).unwrap(), 11);
        assert_eq!(ts.engine.borrow().portal_cache.len(), 4);
    }

    #[test]
    fn residual_graph_calls() {
        // g(a) = a * 3, never looked inside; f(y) = g(y) + 1
        let mut p = Program::new();
        let mut gb = GraphBuilder::new("g", &[s()], s());
        let [a] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r = gb.op(sb, OpKind::Op(LLOp::IntMul), vec![a.into(), Constant::signed(3).into()], s());
        gb.ret(sb, r.into());
        let g = p.add(gb.finish().unwrap()).unwrap();

        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r = gb.op(sb, OpKind::DirectCall(Callee::Graph(g)), vec![y.into()], s());
        let r1 = gb.op(sb, OpKind::Op(LLOp::IntAdd), vec![r.into(), Constant::signed(1).into()], s());
        gb.ret(sb, r1.into());
        let f = p.add(gb.finish().unwrap()).unwrap();

        let ts = Timeshifter::new(
            p,
            f,
            &[PortalArg::Red],
            HintPolicy::stop_at(&[g]),
            Config::default(),
        )
        .unwrap();
        assert_eq!(ts.call(&[5]).unwrap(), 16);
        assert_eq!(ts.call(&[-1]).unwrap(), -2);
        let insns = ts.insns();
        assert_eq!(insns.get("call"), Some(&1));
        assert!(!insns.contains_key("int_mul"));
        assert_eq!(ts.engine.borrow().residual_targets.len(), 1);
    }

    /// two(x) = x == 0 ? raise(VALUE_ERROR, 77) : x + 7, returning -1 when it raises.
    fn raising_two(p: &mut Program) -> GraphIdx {
        let mut gb = GraphBuilder::new("two", &[s()], s());
        let [x] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let c = gb.op(sb, OpKind::Op(LLOp::IntEq), vec![x.into(), Constant::signed(0).into()], LLType::Bool);
        let (raise, _) = gb.new_block(&[]);
        let (ok, oargs) = gb.new_block(&[s()]);
        gb.branch(sb, c.into(), (raise, vec![]), (ok, vec![x.into()]));
        gb.op(
            raise,
            OpKind::SetExc(ExcField::Type),
            vec![Constant::signed(VALUE_ERROR).into()],
            LLType::Void,
        );
        gb.op(raise, OpKind::SetExc(ExcField::Value), vec![Constant::signed(77).into()], LLType::Void);
        gb.ret(raise, Constant::signed(-1).into());
        let r = gb.op(ok, OpKind::Op(LLOp::IntAdd), vec![oargs[0].into(), Constant::signed(7).into()], s());
        gb.ret(ok, r.into());
        p.add(gb.finish().unwrap()).unwrap()
    }

    /// f(y) = { r = callee(y); if an exception is pending { -1 } else { r * 2 } }
    fn propagating_caller(p: &mut Program, callee: GraphIdx) -> GraphIdx {
        let mut gb = GraphBuilder::new("f", &[s()], s());
        let [y] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let r = gb.op(sb, OpKind::DirectCall(Callee::Graph(callee)), vec![y.into()], s());
        let e = gb.op(sb, OpKind::GetExc(ExcField::Type), vec![], s());
        let c = gb.op(sb, OpKind::Op(LLOp::IntIsTrue), vec![e.into()], LLType::Bool);
        let (fail, _) = gb.new_block(&[]);
        let (done, dargs) = gb.new_block(&[s()]);
        gb.branch(sb, c.into(), (fail, vec![]), (done, vec![r.into()]));
        gb.ret(fail, Constant::signed(-1).into());
        let r2 = gb.op(done, OpKind::Op(LLOp::IntMul), vec![dargs[0].into(), Constant::signed(2).into()], s());
        gb.ret(done, r2.into());
        p.add(gb.finish().unwrap()).unwrap()
    }

    #[test]
    fn exceptions_propagate() {
        for arg in [PortalArg::Red, PortalArg::Green] {
            let mut p = Program::new();
            let two = raising_two(&mut p);
            let f = propagating_caller(&mut p, two);
            let ts = timeshifter(p, f, &[arg]);
            assert_eq!(ts.call(&[0]).unwrap(), -1);
            assert_eq!(take_exception(), Some((VALUE_ERROR, 77)));
            assert_eq!(ts.call(&[17]).unwrap(), 48);
            assert_eq!(take_exception(), None);
            // A new call starts without the exception of the last one.
            assert_eq!(ts.call(&[0]).unwrap(), -1);
            assert_eq!(ts.call(&[17]).unwrap(), 48);
            assert_eq!(take_exception(), None);
            if arg.is_green() {
                // Only the specialization for 0 raises, and it knows what.
                assert_eq!(ts.insns().get("call"), Some(&1));
                assert!(!ts.insns().contains_key("int_is_true"));
            } else {
                assert_eq!(ts.insns().get("int_is_true"), Some(&1));
            }
        }
    }

    #[test]
    fn exceptions_are_caught() {
        // f(y) = { r = two(y); if the pending exception is VALUE_ERROR { clear it; 42 } else { r } }
        for arg in [PortalArg::Red, PortalArg::Green] {
            let mut p = Program::new();
            let two = raising_two(&mut p);
            let mut gb = GraphBuilder::new("f", &[s()], s());
            let [y] = gb.args()[..] else { panic!() };
            let sb = gb.startblock();
            let r = gb.op(sb, OpKind::DirectCall(Callee::Graph(two)), vec![y.into()], s());
            let e = gb.op(sb, OpKind::GetExc(ExcField::Type), vec![], s());
            let c = gb.op(
                sb,
                OpKind::Op(LLOp::IntEq),
                vec![e.into(), Constant::signed(VALUE_ERROR).into()],
                LLType::Bool,
            );
            let (handler, _) = gb.new_block(&[]);
            let (done, dargs) = gb.new_block(&[s()]);
            gb.branch(sb, c.into(), (handler, vec![]), (done, vec![r.into()]));
            for field in [ExcField::Type, ExcField::Value] {
                gb.op(handler, OpKind::SetExc(field), vec![Constant::signed(0).into()], LLType::Void);
            }
            gb.ret(handler, Constant::signed(42).into());
            gb.ret(done, dargs[0].into());
            let f = p.add(gb.finish().unwrap()).unwrap();

            let ts = timeshifter(p, f, &[arg]);
            assert_eq!(ts.call(&[0]).unwrap(), 42);
            assert_eq!(take_exception(), None);
            assert_eq!(ts.call(&[17]).unwrap(), 24);
            assert_eq!(take_exception(), None);
            if arg.is_green() {
                let insns = ts.insns();
                assert!(!insns.contains_key("call"));
                assert!(!insns.contains_key("int_eq"));
            }
        }
    }

    #[test]
    fn residual_calls_raise() {
        // g(a) = a < 0 ? raise(VALUE_ERROR, a) : a * 3, never looked inside
        let mut p = Program::new();
        let mut gb = GraphBuilder::new("g", &[s()], s());
        let [a] = gb.args()[..] else { panic!() };
        let sb = gb.startblock();
        let c = gb.op(sb, OpKind::Op(LLOp::IntLt), vec![a.into(), Constant::signed(0).into()], LLType::Bool);
        let (raise, rargs) = gb.new_block(&[s()]);
        let (ok, oargs) = gb.new_block(&[s()]);
        gb.branch(sb, c.into(), (raise, vec![a.into()]), (ok, vec![a.into()]));
        gb.op(
            raise,
            OpKind::SetExc(ExcField::Type),
            vec![Constant::signed(VALUE_ERROR).into()],
            LLType::Void,
        );
        gb.op(raise, OpKind::SetExc(ExcField::Value), vec![rargs[0].into()], LLType::Void);
        gb.ret(raise, Constant::signed(-1).into());
        let r = gb.op(ok, OpKind::Op(LLOp::IntMul), vec![oargs[0].into(), Constant::signed(3).into()], s());
        gb.ret(ok, r.into());
        let g = p.add(gb.finish().unwrap()).unwrap();
        let f = propagating_caller(&mut p, g);

        let ts = Timeshifter::new(
            p,
            f,
            &[PortalArg::Red],
            HintPolicy::stop_at(&[g]),
            Config::default(),
        )
        .unwrap();
        assert_eq!(ts.call(&[5]).unwrap(), 30);
        assert_eq!(take_exception(), None);
        assert_eq!(ts.call(&[-4]).unwrap(), -1);
        assert_eq!(take_exception(), Some((VALUE_ERROR, -4)));
        let insns = ts.insns();
        // The call itself, fetching and clearing the exception, and reraising it on return.
        assert_eq!(insns.get("call"), Some(&5));
        assert!(!insns.contains_key("int_lt"));
    }

    #[test]
    fn wrong_portal_arity() {
        let (p, f) = add_mul();
        assert!(matches!(
            Timeshifter::new(p, f, &[PortalArg::Red], HintPolicy::new(), Config::default()),
            Err(CompilationError::General(_))
        ));
    }
}
