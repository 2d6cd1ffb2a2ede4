//! Promotion: turning a red value green by compiling one specialization per run-time value.
//!
//! `ll_promote` ends the current block with a flexswitch on the value. Its default case calls
//! [tsrt_continue_compilation] and jumps back to the switch. When that continuation runs it
//! rebuilds the state of the nearest global merge point from the recorded [PromotionPath],
//! replays the timeshifted graph from there without generating code (so every decision is
//! remade as it was the first time), and once the replay reaches the promotion point again
//! compiles a new case for the value.

use super::{
    rtimeshift::{Engine, FrozenJitState, JsIdx},
    rvalue::{BoxIdx, RedBox},
    TsGraphIdx,
};
use crate::{
    codegen::{BlockDesc, FlexSwitch, GenVar, RGenOp},
    error::CompilationError,
    log::Verbosity,
    lltype::LLType,
};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

index_vec::define_index_type! {
    pub(crate) struct PmIdx = u32;
}

/// While resuming: merges are ignored until the current call returns.
pub(crate) const MC_IGNORE_UNTIL_RETURN: i64 = -1;
/// While resuming: the call being entered was not followed by the recorded path.
pub(crate) const MC_CALL_NOT_TAKEN: i64 = -2;

/// The start of every path: a global merge point whose state can be rebuilt.
pub(crate) struct Root {
    pub(crate) greens: Vec<i64>,
    pub(crate) frozen: Rc<FrozenJitState>,
    pub(crate) block: BlockDesc,
    pub(crate) tsgraph: TsGraphIdx,
    pub(crate) resumepoint: i64,
}

/// The decisions taken since the last global merge point, most recent first.
pub(crate) enum PromotionPath {
    /// The path of a state that has not (yet) passed a global merge point.
    Start,
    Root(Root),
    Yes(Rc<PromotionPath>),
    No(Rc<PromotionPath>),
    /// The `n`th of the states a call returned was followed.
    CollectSplit(Rc<PromotionPath>, usize),
    CallNotTaken(Rc<PromotionPath>),
    Promote {
        next: Rc<PromotionPath>,
        pm: PmIdx,
        value: i64,
    },
    Call(Rc<PromotionPath>),
    BackFromReturn(Rc<PromotionPath>),
    /// This many merges of the current graph must be seen before the next decision.
    MergesToSee(Rc<PromotionPath>, i64),
}

impl PromotionPath {
    pub(crate) fn next(&self) -> Option<&Rc<PromotionPath>> {
        match self {
            PromotionPath::Start | PromotionPath::Root(_) => None,
            PromotionPath::Yes(n)
            | PromotionPath::No(n)
            | PromotionPath::CollectSplit(n, _)
            | PromotionPath::CallNotTaken(n)
            | PromotionPath::Promote { next: n, .. }
            | PromotionPath::Call(n)
            | PromotionPath::BackFromReturn(n)
            | PromotionPath::MergesToSee(n, _) => Some(n),
        }
    }

    /// Does generalizing a merge stop looking further down the path at this node?
    pub(crate) fn cut_limit(&self) -> bool {
        matches!(
            self,
            PromotionPath::Start
                | PromotionPath::Root(_)
                | PromotionPath::Promote { .. }
                | PromotionPath::Call(_)
                | PromotionPath::BackFromReturn(_)
        )
    }
}

/// The first node of `path` that is a cut limit.
pub(crate) fn cut_node(path: &Rc<PromotionPath>) -> Rc<PromotionPath> {
    let mut node = path;
    while !node.cut_limit() {
        match node.next() {
            Some(n) => node = n,
            None => break,
        }
    }
    Rc::clone(node)
}

/// Push every node of `path` up to (excluding) its end onto `out`, returning the end.
fn follow_path(path: &Rc<PromotionPath>, out: &mut Vec<Rc<PromotionPath>>) -> Rc<PromotionPath> {
    let mut node = path;
    while let Some(n) = node.next() {
        out.push(Rc::clone(node));
        node = n;
    }
    Rc::clone(node)
}

/// The part of a promotion path still to be replayed.
pub(crate) struct ResumingInfo {
    /// The decisions left to remake; the next one is last.
    pub(crate) path: Vec<Rc<PromotionPath>>,
    pub(crate) mergesleft: i64,
}

impl ResumingInfo {
    /// Start replaying the path of promotion point `pm` for `value`. Returns the info and the
    /// root of the path.
    pub(crate) fn new(
        pm: PmIdx,
        pmpath: &Rc<PromotionPath>,
        value: i64,
    ) -> (Self, Rc<PromotionPath>) {
        let mut path = vec![Rc::new(PromotionPath::Promote {
            next: Rc::clone(pmpath),
            pm,
            value,
        })];
        let root = follow_path(pmpath, &mut path);
        (
            Self {
                path,
                mergesleft: 0,
            },
            root,
        )
    }

    pub(crate) fn merges_to_see(&mut self) {
        match self.path.last().map(|n| &**n) {
            Some(PromotionPath::MergesToSee(_, count)) => {
                self.mergesleft = *count;
                self.path.pop();
            }
            _ => self.mergesleft = MC_IGNORE_UNTIL_RETURN,
        }
    }

    /// The next decision to remake.
    pub(crate) fn pop(&mut self) -> Result<Rc<PromotionPath>, CompilationError> {
        self.path
            .pop()
            .ok_or_else(|| CompilationError::InternalError("promotion path exhausted".into()))
    }

    /// Leave a call whose caller's queue has `parent_mergesleft` as its merge counter.
    pub(crate) fn leave_call(&mut self, parent_mergesleft: i64) -> Result<(), CompilationError> {
        match parent_mergesleft {
            0 => {
                let node = self.pop()?;
                if !matches!(&*node, PromotionPath::BackFromReturn(_)) {
                    return Err(CompilationError::InternalError(
                        "expected a return in the promotion path".into(),
                    ));
                }
                self.merges_to_see();
            }
            MC_CALL_NOT_TAKEN => self.mergesleft = 0,
            x => self.mergesleft = x,
        }
        Ok(())
    }
}

pub(crate) struct PromotionPoint {
    pub(crate) flexswitch: Box<dyn FlexSwitch>,
    /// The operands of the switch block's inputs.
    pub(crate) incoming_gv: Vec<GenVar>,
    pub(crate) path: Rc<PromotionPath>,
}

/// What the code of a promotion point passes to [tsrt_continue_compilation].
pub(crate) struct PromotionHandle {
    engine: Weak<RefCell<Engine>>,
    pm: PmIdx,
}

/// Called by generated code the first time a promotion point sees `value`.
pub(crate) extern "C" fn tsrt_continue_compilation(handle: i64, value: i64) -> i64 {
    let handle = unsafe { &*(handle as *const PromotionHandle) };
    let Some(engine) = handle.engine.upgrade() else {
        fatal(CompilationError::InternalError(
            "promotion point outlived its engine".into(),
        ));
    };
    let r = match engine.try_borrow_mut() {
        Ok(mut e) => e.continue_compilation(handle.pm, value),
        Err(_) => Err(CompilationError::InternalError(
            "promotion point reached while compiling".into(),
        )),
    };
    if let Err(e) = r {
        fatal(e);
    }
    0
}

pub(super) fn fatal(e: CompilationError) -> ! {
    eprintln!("compilation-time error {e}");
    std::process::abort();
}

impl Engine {
    /// Promote the red box `b`. Returns true if `js` is finished (it ended in a promotion
    /// point), or false if it goes on with `b` now constant.
    pub(crate) fn ll_promote(&mut self, js: JsIdx, b: BoxIdx) -> Result<bool, CompilationError> {
        let gv = self.genvar(js, b)?;
        if gv.is_const() {
            return Ok(false);
        }
        let mut incoming = self.live_vars(js);
        if !incoming.contains(&b) {
            incoming.push(b);
        }
        let switchblock = self.enter_next_block(js, &incoming)?;
        let gv = self.genvar(js, b)?;
        let mut flexswitch = self.jitstates[js].builder()?.flexswitch(gv)?;

        let Some(resuming) = self.jitstates[js].resuming.clone() else {
            let mut incoming_gv = Vec::with_capacity(incoming.len());
            for ib in &incoming {
                incoming_gv.push(self.genvar_of_var(*ib)?);
            }
            self.jitstates[js].curbuilder = Some(flexswitch.add_default()?);
            self.enter_block(js)?;
            let path = Rc::clone(self.jitstates[js].path()?);
            let pm = self.pms.push(PromotionPoint {
                flexswitch,
                incoming_gv,
                path,
            });
            let handle = Box::new(PromotionHandle {
                engine: self.me.clone(),
                pm,
            });
            let handle_addr = &*handle as *const PromotionHandle as i64;
            self.handles.push(handle);
            self.log.log(
                Verbosity::SpecializationEvent,
                &format!("promotion point {}", pm.index()),
            );

            let gv = self.genvar(js, b)?;
            let builder = self.jitstates[js].builder()?;
            builder.genop_call(
                GenVar::Const(tsrt_continue_compilation as usize as i64),
                &[GenVar::Const(handle_addr), gv],
            )?;
            let mut args = Vec::with_capacity(incoming.len());
            for ib in &incoming {
                args.push(self.boxes.getgenvar(*ib, builder)?);
            }
            builder.finish_and_goto(&args, &switchblock)?;
            self.jitstates[js].curbuilder = None;
            return Ok(true);
        };

        if self.jitstates[js].promotion_path.is_some() {
            return Err(CompilationError::InternalError(
                "a resuming state has a promotion path".into(),
            ));
        }
        if resuming.borrow().mergesleft != 0 {
            return Ok(true);
        }
        let node = resuming.borrow_mut().pop()?;
        let PromotionPath::Promote { next, pm, value } = &*node else {
            return Err(CompilationError::InternalError(
                "expected a promotion in the promotion path".into(),
            ));
        };
        let (pm, value) = (*pm, *value);
        if !Rc::ptr_eq(&self.pms[pm].path, next) {
            return Err(CompilationError::InternalError(
                "replay reached the wrong promotion point".into(),
            ));
        }

        // Whatever was queued while replaying has already been compiled.
        let mut f = self.jitstates[js].frame.as_deref();
        let mut queues = Vec::new();
        while let Some(frame) = f {
            queues.extend(frame.queue);
            f = frame.backframe.as_deref();
        }
        for q in queues {
            self.queues[q].clear();
        }

        let kind = self.boxes.kind(b).clone();
        let newbuilder = if resuming.borrow().path.is_empty() {
            let incoming_gv = self.pms[pm].incoming_gv.clone();
            if incoming_gv.len() != incoming.len() {
                return Err(CompilationError::InternalError(format!(
                    "replayed promotion has {} live variables instead of {}",
                    incoming.len(),
                    incoming_gv.len()
                )));
            }
            for (ib, gv) in incoming.iter().zip(incoming_gv) {
                self.boxes.set_genvar(*ib, gv)?;
            }
            self.boxes.set(b, RedBox::Const { kind, value });
            let state = &mut self.jitstates[js];
            state.resuming = None;
            state.promotion_path = Some(Rc::new(PromotionPath::MergesToSee(Rc::clone(&node), 0)));
            self.log.log(
                Verbosity::SpecializationEvent,
                &format!("new case {value} for promotion point {}", pm.index()),
            );
            self.pms[pm].flexswitch.add_case(value)?
        } else {
            resuming.borrow_mut().merges_to_see();
            self.boxes.set(b, RedBox::Const { kind, value });
            flexswitch.add_case(value)?
        };
        self.jitstates[js].curbuilder = Some(newbuilder);
        self.enter_block(js)?;
        Ok(false)
    }

    fn genvar_of_var(&self, b: BoxIdx) -> Result<GenVar, CompilationError> {
        match &self.boxes[b] {
            RedBox::Var { gv, .. } => Ok(*gv),
            x => Err(CompilationError::InternalError(format!(
                "{x:?} is not a variable"
            ))),
        }
    }

    /// Compile a new case of promotion point `pm` for `value`.
    pub(crate) fn continue_compilation(
        &mut self,
        pm: PmIdx,
        value: i64,
    ) -> Result<(), CompilationError> {
        self.stats.continuation();
        self.log.log(
            Verbosity::SpecializationEvent,
            &format!("resuming promotion point {} with {value}", pm.index()),
        );
        let (info, root) = ResumingInfo::new(pm, &self.pms[pm].path, value);
        let PromotionPath::Root(root) = &*root else {
            return Err(CompilationError::General(
                "promotion without a preceding global merge point".into(),
            ));
        };
        self.enter_compile();
        let r = self.resume_from_root(root, info);
        self.leave_compile();
        r
    }

    fn resume_from_root(&mut self, root: &Root, info: ResumingInfo) -> Result<(), CompilationError> {
        let mut incoming = Vec::new();
        let mut state = root.frozen.unfreeze(&mut self.boxes, &mut incoming);
        let kinds = incoming
            .iter()
            .map(|b| self.boxes.kind(*b).clone())
            .collect::<Vec<LLType>>();
        let (builder, gvs) = self.rgenop.replay(&root.block, &kinds);
        for (b, gv) in incoming.iter().zip(gvs) {
            self.boxes.set_genvar(*b, gv)?;
        }
        state.curbuilder = Some(builder);
        state.greens = root.greens.clone();
        if state.frame()?.backframe.is_some() {
            return Err(CompilationError::InternalError(
                "global merge point inside a call".into(),
            ));
        }
        let mut info = info;
        info.merges_to_see();
        state.resuming = Some(Rc::new(RefCell::new(info)));
        let js = self.jitstates.push(state);
        self.global_resumer(js, root.tsgraph, root.resumepoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> Rc<PromotionPath> {
        Rc::new(PromotionPath::Start)
    }

    #[test]
    fn cut_nodes() {
        let call = Rc::new(PromotionPath::Call(start()));
        let path = Rc::new(PromotionPath::MergesToSee(
            Rc::new(PromotionPath::Yes(Rc::new(PromotionPath::No(Rc::clone(&call))))),
            2,
        ));
        assert!(Rc::ptr_eq(&cut_node(&path), &call));
        assert!(Rc::ptr_eq(&cut_node(&call), &call));
        let s = start();
        assert!(Rc::ptr_eq(&cut_node(&s), &s));
    }

    #[test]
    fn follow_and_replay() {
        let base = start();
        let yes = Rc::new(PromotionPath::Yes(Rc::clone(&base)));
        let mts = Rc::new(PromotionPath::MergesToSee(Rc::clone(&yes), 3));
        let (mut info, root) = ResumingInfo::new(PmIdx::new(0), &mts, 42);
        assert!(Rc::ptr_eq(&root, &base));
        // Replayed nearest-to-the-root first.
        assert_eq!(info.path.len(), 3);
        assert!(matches!(&*info.pop().unwrap(), PromotionPath::Yes(_)));
        info.merges_to_see();
        assert_eq!(info.mergesleft, 3);
        info.merges_to_see();
        assert_eq!(info.mergesleft, MC_IGNORE_UNTIL_RETURN);
        assert!(matches!(
            &*info.pop().unwrap(),
            PromotionPath::Promote { value: 42, .. }
        ));
        assert!(info.pop().is_err());
    }

    #[test]
    fn leaving_calls() {
        let back = Rc::new(PromotionPath::BackFromReturn(start()));
        let mts = Rc::new(PromotionPath::MergesToSee(back, 1));
        let (mut info, _) = ResumingInfo::new(PmIdx::new(0), &mts, 0);
        info.leave_call(0).unwrap();
        assert_eq!(info.mergesleft, 1);
        info.leave_call(MC_CALL_NOT_TAKEN).unwrap();
        assert_eq!(info.mergesleft, 0);
        info.leave_call(5).unwrap();
        assert_eq!(info.mergesleft, 5);
        // Only the promotion itself is left, which is not a return.
        assert!(info.leave_call(0).is_err());
    }
}
