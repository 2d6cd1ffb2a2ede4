//! The specialization-time machine.
//!
//! A [JitState] is one path through the program being specialized: the builder generating its
//! code, its stack of [VirtualFrame]s (whose local boxes are the live red values), and the
//! bookkeeping needed to resume it. Timeshifted graphs call the operations here to split a state
//! at a red branch, queue the halves on a [DispatchQueue], merge states that reach the same merge
//! point, and pass states in and out of calls.
//!
//! Everything allocated while compiling lives in the [Engine]'s arenas, which are emptied once
//! the outermost compilation finishes. Promotion points, their paths and merge-point snapshots
//! outlive that, since generated code can resume compilation from them at any time.

use super::{
    portal::{CompiledPortal, PortalDesc, ResidualTarget},
    promotion::{
        cut_node, PmIdx, PromotionHandle, PromotionPath, PromotionPoint, ResumingInfo, Root,
        MC_CALL_NOT_TAKEN, MC_IGNORE_UNTIL_RETURN,
    },
    rcontainer::StructTypeDesc,
    rvalue::{exactmatch, unfreeze, BoxIdx, Boxes, CopyMemo, FreezeMemo, FrozenBox, MatchMemo, RedBox},
    transform::can_raise,
    TsGraph, TsGraphIdx,
};
use crate::{
    codegen::{x64::X64RGenOp, ArrayToken, BlockDesc, GenBuilder, GenVar},
    config::Config,
    error::CompilationError,
    flowgraph::{GraphIdx, Program},
    log::{stats::Stats, Log, Verbosity},
    lltype::{
        read_item, read_word, tsrt_exc_clear, tsrt_exc_fetch_type, tsrt_exc_fetch_value,
        tsrt_exc_raise, LLOp, LLType,
    },
};
use index_vec::IndexVec;
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    mem,
    rc::{Rc, Weak},
};

index_vec::define_index_type! {
    pub(crate) struct JsIdx = u32;
}

index_vec::define_index_type! {
    pub(crate) struct QueueIdx = u32;
}

pub(crate) struct VirtualFrame {
    pub(crate) backframe: Option<Box<VirtualFrame>>,
    /// The queue of the graph this frame belongs to. `None` only while a frame rebuilt from a
    /// snapshot waits for its queue.
    pub(crate) queue: Option<QueueIdx>,
    pub(crate) local_boxes: Vec<BoxIdx>,
}

impl VirtualFrame {
    fn copy(&self, boxes: &mut Boxes, memo: &mut CopyMemo) -> VirtualFrame {
        let backframe = self
            .backframe
            .as_ref()
            .map(|f| Box::new(f.copy(boxes, memo)));
        VirtualFrame {
            backframe,
            queue: self.queue,
            local_boxes: self.local_boxes.iter().map(|b| boxes.copy(*b, memo)).collect(),
        }
    }

    fn freeze(&self, boxes: &Boxes, memo: &mut FreezeMemo) -> FrozenFrame {
        FrozenFrame {
            locals: self.local_boxes.iter().map(|b| boxes.freeze(*b, memo)).collect(),
            back: self.backframe.as_ref().map(|f| Box::new(f.freeze(boxes, memo))),
        }
    }

    fn replace(&mut self, boxes: &mut Boxes, memo: &mut CopyMemo) {
        for b in self.local_boxes.iter_mut() {
            *b = boxes.replace(*b, memo);
        }
        if let Some(f) = self.backframe.as_mut() {
            f.replace(boxes, memo);
        }
    }
}

pub(crate) struct FrozenFrame {
    locals: Vec<usize>,
    back: Option<Box<FrozenFrame>>,
}

impl FrozenFrame {
    fn unfreeze(
        &self,
        fz: &[FrozenBox],
        boxes: &mut Boxes,
        incoming: &mut Vec<BoxIdx>,
        memo: &mut HashMap<usize, BoxIdx>,
    ) -> VirtualFrame {
        let local_boxes = self
            .locals
            .iter()
            .map(|i| unfreeze(fz, *i, boxes, incoming, memo))
            .collect();
        let backframe = self
            .back
            .as_ref()
            .map(|f| Box::new(f.unfreeze(fz, boxes, incoming, memo)));
        VirtualFrame {
            backframe,
            queue: None,
            local_boxes,
        }
    }
}

/// A snapshot of a [JitState] taken when it started a block at a merge point.
pub(crate) struct FrozenJitState {
    boxes: Vec<FrozenBox>,
    frame: Option<FrozenFrame>,
    exc_type: usize,
    exc_value: usize,
}

impl FrozenJitState {
    /// Can `js` jump to the block this snapshot was taken at? The boxes `js` has to pass along
    /// (or, on a mismatch, generalize) are appended to `outgoing`.
    fn exactmatch(
        &self,
        boxes: &Boxes,
        js: &JitState,
        outgoing: &mut Vec<BoxIdx>,
    ) -> Result<bool, CompilationError> {
        let mut memo = MatchMemo::default();
        let mut fullmatch = true;
        let mut fz = self.frame.as_ref();
        let mut live = js.frame.as_deref();
        loop {
            match (fz, live) {
                (None, None) => break,
                (Some(f), Some(l)) => {
                    if f.locals.len() != l.local_boxes.len() {
                        return Err(CompilationError::InternalError(format!(
                            "merging a frame of {} locals into one of {}",
                            l.local_boxes.len(),
                            f.locals.len()
                        )));
                    }
                    for (i, b) in f.locals.iter().zip(&l.local_boxes) {
                        if !exactmatch(&self.boxes, *i, boxes, *b, outgoing, &mut memo) {
                            fullmatch = false;
                        }
                    }
                    fz = f.back.as_deref();
                    live = l.backframe.as_deref();
                }
                _ => {
                    return Err(CompilationError::InternalError(
                        "merging states of different frame depths".into(),
                    ))
                }
            }
        }
        for (i, b) in [(self.exc_type, js.exc_type), (self.exc_value, js.exc_value)] {
            if !exactmatch(&self.boxes, i, boxes, b, outgoing, &mut memo) {
                fullmatch = false;
            }
        }
        Ok(fullmatch)
    }

    /// Rebuild a jitstate without a builder. Every variable box is pushed onto `incoming`.
    pub(super) fn unfreeze(&self, boxes: &mut Boxes, incoming: &mut Vec<BoxIdx>) -> JitState {
        let mut memo = HashMap::new();
        let frame = self
            .frame
            .as_ref()
            .map(|f| Box::new(f.unfreeze(&self.boxes, boxes, incoming, &mut memo)));
        let exc_type = unfreeze(&self.boxes, self.exc_type, boxes, incoming, &mut memo);
        let exc_value = unfreeze(&self.boxes, self.exc_value, boxes, incoming, &mut memo);
        JitState::new(None, frame, exc_type, exc_value)
    }
}

pub(crate) struct JitState {
    /// `None` once the state's code has been closed.
    pub(crate) curbuilder: Option<Box<dyn GenBuilder>>,
    pub(crate) frame: Option<Box<VirtualFrame>>,
    pub(crate) exc_type: BoxIdx,
    pub(crate) exc_value: BoxIdx,
    /// Where the dispatcher resumes this state, or -1 to leave the graph.
    pub(crate) resumepoint: i64,
    pub(crate) greens: Vec<i64>,
    pub(crate) resuming: Option<Rc<RefCell<ResumingInfo>>>,
    /// `None` while resuming.
    pub(crate) promotion_path: Option<Rc<PromotionPath>>,
    pub(crate) next: Option<JsIdx>,
    pub(crate) returnbox: Option<BoxIdx>,
}

impl JitState {
    fn new(
        curbuilder: Option<Box<dyn GenBuilder>>,
        frame: Option<Box<VirtualFrame>>,
        exc_type: BoxIdx,
        exc_value: BoxIdx,
    ) -> Self {
        Self {
            curbuilder,
            frame,
            exc_type,
            exc_value,
            resumepoint: -1,
            greens: Vec::new(),
            resuming: None,
            promotion_path: None,
            next: None,
            returnbox: None,
        }
    }

    pub(crate) fn builder(&mut self) -> Result<&mut dyn GenBuilder, CompilationError> {
        match self.curbuilder.as_deref_mut() {
            Some(b) => Ok(b),
            None => Err(CompilationError::InternalError(
                "jitstate has no builder".into(),
            )),
        }
    }

    pub(crate) fn frame(&self) -> Result<&VirtualFrame, CompilationError> {
        self.frame
            .as_deref()
            .ok_or_else(|| CompilationError::InternalError("jitstate has no frame".into()))
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut VirtualFrame, CompilationError> {
        self.frame
            .as_deref_mut()
            .ok_or_else(|| CompilationError::InternalError("jitstate has no frame".into()))
    }

    pub(crate) fn queue(&self) -> Result<QueueIdx, CompilationError> {
        self.frame()?
            .queue
            .ok_or_else(|| CompilationError::InternalError("frame has no dispatch queue".into()))
    }

    pub(super) fn path(&self) -> Result<&Rc<PromotionPath>, CompilationError> {
        self.promotion_path
            .as_ref()
            .ok_or_else(|| CompilationError::InternalError("jitstate has no promotion path".into()))
    }

    fn enter_block(&self, boxes: &Boxes, incoming: &mut Vec<BoxIdx>, memo: &mut HashSet<BoxIdx>) {
        let mut f = self.frame.as_deref();
        while let Some(frame) = f {
            for b in &frame.local_boxes {
                boxes.enter_block(*b, incoming, memo);
            }
            f = frame.backframe.as_deref();
        }
        boxes.enter_block(self.exc_type, incoming, memo);
        boxes.enter_block(self.exc_value, incoming, memo);
    }

    fn freeze(&self, boxes: &Boxes) -> FrozenJitState {
        let mut memo = FreezeMemo::default();
        let frame = self.frame.as_ref().map(|f| f.freeze(boxes, &mut memo));
        let exc_type = boxes.freeze(self.exc_type, &mut memo);
        let exc_value = boxes.freeze(self.exc_value, &mut memo);
        FrozenJitState {
            boxes: memo.frozen,
            frame,
            exc_type,
            exc_value,
        }
    }

    fn replace(&mut self, boxes: &mut Boxes, memo: &mut CopyMemo) {
        if let Some(f) = self.frame.as_mut() {
            f.replace(boxes, memo);
        }
        self.exc_type = boxes.replace(self.exc_type, memo);
        self.exc_value = boxes.replace(self.exc_value, memo);
    }
}

/// The pending states of one invocation of a timeshifted graph.
#[derive(Default)]
pub(crate) struct DispatchQueue {
    pub(crate) split_chain: Option<JsIdx>,
    pub(crate) global_merge_chain: Option<JsIdx>,
    pub(crate) return_chain: Option<JsIdx>,
    pub(crate) mergecounter: i64,
    /// The blocks started at each local merge point of the graph.
    pub(crate) states: HashMap<usize, StatesDic>,
}

impl DispatchQueue {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

struct MergeEntry {
    frozen: Rc<FrozenJitState>,
    block: BlockDesc,
    /// How often this entry has been replaced by a more general one.
    generalized: usize,
}

/// The blocks started at one merge point, by green key.
#[derive(Default)]
pub(crate) struct StatesDic {
    entries: HashMap<Vec<i64>, MergeEntry>,
}

impl StatesDic {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What a merge point does with the block it starts.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Resumer {
    Local,
    /// Merging the states returning from a graph.
    ReturnMarker,
    /// A global merge point: compilation can later be resumed from the block, by re-entering
    /// `tsgraph` at `resumepoint`.
    Global {
        tsgraph: TsGraphIdx,
        resumepoint: i64,
    },
}

pub(crate) struct Engine {
    pub(crate) me: Weak<RefCell<Engine>>,
    pub(crate) rgenop: X64RGenOp,
    pub(crate) config: Config,
    pub(crate) log: Log,
    pub(crate) stats: Rc<Stats>,
    pub(crate) program: Rc<Program>,
    pub(crate) tsgraphs: IndexVec<TsGraphIdx, Rc<TsGraph>>,
    pub(crate) portal: Option<PortalDesc>,
    pub(crate) boxes: Boxes,
    pub(crate) jitstates: IndexVec<JsIdx, JitState>,
    pub(crate) queues: IndexVec<QueueIdx, DispatchQueue>,
    pub(crate) global_states: HashMap<(TsGraphIdx, usize), StatesDic>,
    pub(crate) pms: IndexVec<PmIdx, PromotionPoint>,
    /// Passed by address to generated code, so never moved or freed.
    pub(crate) handles: Vec<Box<PromotionHandle>>,
    pub(crate) portal_cache: HashMap<Vec<i64>, CompiledPortal>,
    pub(crate) residual_targets: Vec<Box<ResidualTarget>>,
    /// Which graphs called residually can leave an exception pending.
    raising: HashMap<GraphIdx, bool>,
    /// How many compilations are in progress (portal reentry nests them).
    depth: usize,
}

impl Engine {
    pub(crate) fn new(
        program: Rc<Program>,
        config: Config,
    ) -> Result<Rc<RefCell<Self>>, CompilationError> {
        let stats = Rc::new(Stats::new());
        let rgenop = X64RGenOp::new(&config, Rc::clone(&stats))?;
        let log = Log::new().map_err(|e| CompilationError::General(e.to_string()))?;
        Ok(Rc::new_cyclic(|me| {
            RefCell::new(Self {
                me: me.clone(),
                rgenop,
                config,
                log,
                stats,
                program,
                tsgraphs: IndexVec::new(),
                portal: None,
                boxes: Boxes::default(),
                jitstates: IndexVec::new(),
                queues: IndexVec::new(),
                global_states: HashMap::new(),
                pms: IndexVec::new(),
                handles: Vec::new(),
                portal_cache: HashMap::new(),
                residual_targets: Vec::new(),
                raising: HashMap::new(),
                depth: 0,
            })
        }))
    }

    pub(crate) fn enter_compile(&mut self) {
        self.depth += 1;
    }

    /// Leave a compilation. The outermost one empties the arenas.
    pub(crate) fn leave_compile(&mut self) {
        self.depth -= 1;
        if self.depth == 0 {
            self.jitstates.clear();
            self.queues.clear();
            self.boxes.clear();
        }
    }

    /// A state for a new function whose code `builder` generates.
    pub(crate) fn fresh_jitstate(&mut self, builder: Box<dyn GenBuilder>) -> JsIdx {
        let exc_type = self.boxes.constant(LLType::Signed, 0);
        let exc_value = self.boxes.constant(LLType::Signed, 0);
        let mut js = JitState::new(Some(builder), None, exc_type, exc_value);
        js.promotion_path = Some(Rc::new(PromotionPath::Start));
        self.jitstates.push(js)
    }

    /// The operand for box `b` in the code of `js`.
    pub(crate) fn genvar(&mut self, js: JsIdx, b: BoxIdx) -> Result<GenVar, CompilationError> {
        self.boxes.getgenvar(b, self.jitstates[js].builder()?)
    }

    /// Start a new block in `js` whose inputs are the variable boxes `incoming`.
    pub(crate) fn enter_next_block(
        &mut self,
        js: JsIdx,
        incoming: &[BoxIdx],
    ) -> Result<BlockDesc, CompilationError> {
        let mut kinds = Vec::with_capacity(incoming.len());
        let mut gvs = Vec::with_capacity(incoming.len());
        for b in incoming {
            match &self.boxes[*b] {
                RedBox::Var { kind, gv } => {
                    kinds.push(kind.clone());
                    gvs.push(*gv);
                }
                x => {
                    return Err(CompilationError::InternalError(format!(
                        "block input {x:?} is not a variable"
                    )))
                }
            }
        }
        let block = self.jitstates[js]
            .builder()?
            .enter_next_block(&kinds, &mut gvs)?;
        for (b, gv) in incoming.iter().zip(gvs) {
            self.boxes.set_genvar(*b, gv)?;
        }
        Ok(block)
    }

    /// Every variable box reachable from `js`, each once.
    pub(crate) fn live_vars(&self, js: JsIdx) -> Vec<BoxIdx> {
        let mut incoming = Vec::new();
        self.jitstates[js].enter_block(&self.boxes, &mut incoming, &mut HashSet::new());
        incoming
    }

    /// Start a new block holding every variable live in `js`.
    pub(crate) fn enter_block(&mut self, js: JsIdx) -> Result<BlockDesc, CompilationError> {
        let incoming = self.live_vars(js);
        self.enter_next_block(js, &incoming)
    }

    fn start_new_block(
        &mut self,
        dic: &mut StatesDic,
        js: JsIdx,
        key: Vec<i64>,
        resumer: Resumer,
        generalized: usize,
    ) -> Result<(), CompilationError> {
        let frozen = self.jitstates[js].freeze(&self.boxes);
        let mut outgoing = Vec::new();
        if !frozen.exactmatch(&self.boxes, &self.jitstates[js], &mut outgoing)? {
            return Err(CompilationError::InternalError(
                "a state does not match its own snapshot".into(),
            ));
        }
        let block = self.enter_next_block(js, &outgoing)?;
        let frozen = Rc::new(frozen);
        if let Resumer::Global {
            tsgraph,
            resumepoint,
        } = resumer
        {
            let root = PromotionPath::Root(Root {
                greens: self.jitstates[js].greens.clone(),
                frozen: Rc::clone(&frozen),
                block: block.clone(),
                tsgraph,
                resumepoint,
            });
            let q = self.jitstates[js].queue()?;
            self.queues[q].mergecounter = 0;
            self.jitstates[js].promotion_path =
                Some(Rc::new(PromotionPath::MergesToSee(Rc::new(root), 0)));
        }
        self.stats.block_started();
        dic.entries.insert(
            key,
            MergeEntry {
                frozen,
                block,
                generalized,
            },
        );
        Ok(())
    }

    /// Bring `js` to the merge point `dic` with green `key`. Returns true if `js` jumped to an
    /// existing block (and is finished), or false if it started a new block and goes on.
    pub(crate) fn retrieve_jitstate_for_merge(
        &mut self,
        dic: &mut StatesDic,
        js: JsIdx,
        key: Vec<i64>,
        resumer: Resumer,
    ) -> Result<bool, CompilationError> {
        let Some(entry) = dic.entries.get(&key) else {
            self.log
                .log(Verbosity::MergeEvent, &format!("new block for key {key:?}"));
            self.start_new_block(dic, js, key, resumer, 0)?;
            return Ok(false);
        };
        let frozen = Rc::clone(&entry.frozen);
        let mut outgoing = Vec::new();
        if frozen.exactmatch(&self.boxes, &self.jitstates[js], &mut outgoing)? {
            let block = entry.block.clone();
            let builder = self.jitstates[js].builder()?;
            let mut args = Vec::with_capacity(outgoing.len());
            for b in outgoing {
                args.push(self.boxes.getgenvar(b, builder)?);
            }
            builder.finish_and_goto(&args, &block)?;
            self.jitstates[js].curbuilder = None;
            return Ok(true);
        }

        // Generalize every mismatching box into a variable and start a more general block.
        let generalized = entry.generalized + 1;
        if generalized > self.config.merge_limit {
            return Err(CompilationError::LimitExceeded(format!(
                "merge point generalized more than {} times for key {key:?}",
                self.config.merge_limit
            )));
        }
        let mut memo = CopyMemo::default();
        let builder = self.jitstates[js].builder()?;
        for b in outgoing {
            self.boxes.forcevar(b, builder, &mut memo)?;
        }
        if !memo.boxes.is_empty() {
            self.jitstates[js].replace(&mut self.boxes, &mut memo);
        }
        self.log.log(
            Verbosity::MergeEvent,
            &format!("generalized block for key {key:?}"),
        );
        self.start_new_block(dic, js, key, resumer, generalized)?;
        if let Resumer::Local = resumer {
            self.merge_generalized(js)?;
        }
        Ok(false)
    }

    /// Merge `js` at merge point `mp` of the graph whose queue is `queue`.
    pub(crate) fn merge_point(
        &mut self,
        js: JsIdx,
        queue: QueueIdx,
        mp: usize,
        key: Vec<i64>,
        resumer: Resumer,
    ) -> Result<bool, CompilationError> {
        let slot = match resumer {
            Resumer::Global { tsgraph, .. } => {
                mem::take(self.global_states.entry((tsgraph, mp)).or_default())
            }
            _ => mem::take(self.queues[queue].states.entry(mp).or_default()),
        };
        let mut dic = slot;
        let r = self.retrieve_jitstate_for_merge(&mut dic, js, key, resumer);
        match resumer {
            Resumer::Global { tsgraph, .. } => {
                self.global_states.insert((tsgraph, mp), dic);
            }
            _ => {
                self.queues[queue].states.insert(mp, dic);
            }
        }
        r
    }

    fn merge_generalized(&mut self, js: JsIdx) -> Result<(), CompilationError> {
        self.stats.merge_generalized();
        match self.jitstates[js].resuming.clone() {
            None => {
                let node = cut_node(self.jitstates[js].path()?);
                let q = self.jitstates[js].queue()?;
                let count = self.queues[q].mergecounter + 1;
                self.queues[q].mergecounter = count;
                self.jitstates[js].promotion_path =
                    Some(Rc::new(PromotionPath::MergesToSee(node, count)));
            }
            Some(r) => {
                let mut r = r.borrow_mut();
                if r.mergesleft != MC_IGNORE_UNTIL_RETURN {
                    if r.mergesleft <= 0 {
                        return Err(CompilationError::InternalError(
                            "more merges replayed than recorded".into(),
                        ));
                    }
                    r.mergesleft -= 1;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn guard_global_merge(
        &mut self,
        js: JsIdx,
        resumepoint: i64,
    ) -> Result<(), CompilationError> {
        let q = self.jitstates[js].queue()?;
        self.jitstates[js].next = self.queues[q].global_merge_chain;
        self.queues[q].global_merge_chain = Some(js);
        self.jitstates[js].resumepoint = resumepoint;
        Ok(())
    }

    /// Split `js` on the red boolean `switchbox`. `js` goes on with the true case; a copy for
    /// the false case is queued, to be resumed at `resumepoint` with `greens`.
    pub(crate) fn split(
        &mut self,
        js: JsIdx,
        switchbox: BoxIdx,
        resumepoint: i64,
        greens: Vec<i64>,
    ) -> Result<bool, CompilationError> {
        let gv = self.genvar(js, switchbox)?;
        if let Some(v) = gv.revealconst() {
            return Ok(v != 0);
        }
        let resuming = self.jitstates[js].resuming.clone();
        if let Some(r) = &resuming {
            let mut r = r.borrow_mut();
            if r.mergesleft == 0 {
                let node = r.pop()?;
                return match &*node {
                    PromotionPath::Yes(_) => Ok(true),
                    PromotionPath::No(_) => Ok(false),
                    _ => Err(CompilationError::InternalError(
                        "expected a split in the promotion path".into(),
                    )),
                };
            }
        }
        let later = self.jitstates[js].builder()?.jump_if_false(gv)?;
        let js2 = self.split_jitstate(js, later, resumepoint, greens)?;
        if resuming.is_none() {
            let node = Rc::clone(self.jitstates[js].path()?);
            self.jitstates[js2].promotion_path = Some(Rc::new(PromotionPath::No(Rc::clone(&node))));
            self.jitstates[js].promotion_path = Some(Rc::new(PromotionPath::Yes(node)));
        }
        Ok(true)
    }

    /// Copy `js` into a new state generated by `builder` and queue it.
    fn split_jitstate(
        &mut self,
        js: JsIdx,
        builder: Box<dyn GenBuilder>,
        resumepoint: i64,
        greens: Vec<i64>,
    ) -> Result<JsIdx, CompilationError> {
        let mut memo = CopyMemo::default();
        let old = &self.jitstates[js];
        let frame = old
            .frame
            .as_ref()
            .map(|f| Box::new(f.copy(&mut self.boxes, &mut memo)));
        let exc_type = self.boxes.copy(old.exc_type, &mut memo);
        let exc_value = self.boxes.copy(old.exc_value, &mut memo);
        let mut new = JitState::new(Some(builder), frame, exc_type, exc_value);
        new.resumepoint = resumepoint;
        new.greens = greens;
        new.resuming = old.resuming.clone();
        let q = old.queue()?;
        new.next = self.queues[q].split_chain;
        let js2 = self.jitstates.push(new);
        self.queues[q].split_chain = Some(js2);
        Ok(js2)
    }

    /// After a call returned the states `chain`, queue all but the one that goes on.
    pub(crate) fn collect_split(
        &mut self,
        chain: JsIdx,
        resumepoint: i64,
        greens: &[i64],
    ) -> Result<JsIdx, CompilationError> {
        let resuming = self.jitstates[chain].resuming.clone();
        if let Some(r) = &resuming {
            let mut r = r.borrow_mut();
            if r.mergesleft == 0 {
                let node = r.pop()?;
                let PromotionPath::CollectSplit(_, n) = &*node else {
                    return Err(CompilationError::InternalError(
                        "expected a collected split in the promotion path".into(),
                    ));
                };
                let mut pending = chain;
                for _ in 0..*n {
                    pending = self.jitstates[pending].next.ok_or_else(|| {
                        CompilationError::InternalError("returned chain too short".into())
                    })?;
                }
                let js = &mut self.jitstates[pending];
                js.greens.extend_from_slice(greens);
                js.next = None;
                return Ok(pending);
            }
        }

        let mut n = 0;
        let mut last = chain;
        loop {
            let js = &mut self.jitstates[last];
            js.greens.extend_from_slice(greens);
            js.resumepoint = resumepoint;
            if resuming.is_none() {
                let node = Rc::clone(js.path()?);
                js.promotion_path = Some(Rc::new(PromotionPath::CollectSplit(node, n)));
                n += 1;
            }
            match js.next {
                Some(next) => last = next,
                None => break,
            }
        }
        let q = self.jitstates[chain].queue()?;
        self.jitstates[last].next = self.queues[q].split_chain;
        self.queues[q].split_chain = self.jitstates[chain].next;
        self.jitstates[chain].next = None;
        Ok(chain)
    }

    pub(crate) fn reverse_split_queue(&mut self, queue: QueueIdx) {
        let mut newchain = None;
        while let Some(js) = self.queues[queue].split_chain {
            self.queues[queue].split_chain = self.jitstates[js].next;
            self.jitstates[js].next = newchain;
            newchain = Some(js);
        }
        self.queues[queue].split_chain = newchain;
    }

    /// The next state of `queue` to compile, or `old` (told to leave the graph) if there is
    /// none.
    pub(crate) fn dispatch_next(
        &mut self,
        old: JsIdx,
        queue: QueueIdx,
    ) -> Result<JsIdx, CompilationError> {
        if let Some(js) = self.queues[queue].split_chain {
            self.queues[queue].split_chain = self.jitstates[js].next.take();
            self.enter_block(js)?;
            return Ok(js);
        }
        if let Some(js) = self.queues[queue].global_merge_chain {
            self.queues[queue].global_merge_chain = self.jitstates[js].next.take();
            return Ok(js);
        }
        self.jitstates[old].resumepoint = -1;
        Ok(old)
    }

    pub(crate) fn save_locals(
        &mut self,
        js: JsIdx,
        boxes: Vec<BoxIdx>,
    ) -> Result<(), CompilationError> {
        self.jitstates[js].frame_mut()?.local_boxes = boxes;
        Ok(())
    }

    pub(crate) fn save_greens(&mut self, js: JsIdx, greens: Vec<i64>) {
        self.jitstates[js].greens = greens;
    }

    pub(crate) fn restore_local(&self, js: JsIdx, i: usize) -> Result<BoxIdx, CompilationError> {
        self.jitstates[js]
            .frame()?
            .local_boxes
            .get(i)
            .copied()
            .ok_or_else(|| CompilationError::InternalError(format!("no saved local {i}")))
    }

    pub(crate) fn restore_green(&self, js: JsIdx, i: usize) -> Result<i64, CompilationError> {
        self.jitstates[js]
            .greens
            .get(i)
            .copied()
            .ok_or_else(|| CompilationError::InternalError(format!("no saved green {i}")))
    }

    pub(crate) fn save_return(&mut self, js: JsIdx) -> Result<(), CompilationError> {
        let q = self.jitstates[js].queue()?;
        self.jitstates[js].next = self.queues[q].return_chain;
        self.queues[q].return_chain = Some(js);
        Ok(())
    }

    /// The queue for a new invocation of a graph. A graph with global merge points reuses the
    /// queue its resumed frame was given.
    pub(crate) fn ensure_queue(
        &mut self,
        js: JsIdx,
        replayable: bool,
    ) -> Result<QueueIdx, CompilationError> {
        if replayable && self.jitstates[js].resuming.is_some() {
            return self.jitstates[js].queue();
        }
        Ok(self.queues.push(DispatchQueue::default()))
    }

    pub(crate) fn enter_frame(&mut self, js: JsIdx, queue: QueueIdx) -> Result<(), CompilationError> {
        let state = &mut self.jitstates[js];
        let backframe = state.frame.take();
        state.frame = Some(Box::new(VirtualFrame {
            backframe,
            queue: Some(queue),
            local_boxes: Vec::new(),
        }));
        match state.resuming.clone() {
            None => {
                let node = Rc::new(PromotionPath::Call(Rc::clone(state.path()?)));
                state.promotion_path = Some(Rc::new(PromotionPath::MergesToSee(node, 0)));
            }
            Some(r) => {
                let mut r = r.borrow_mut();
                let mut parent_mergesleft = r.mergesleft;
                r.mergesleft = MC_IGNORE_UNTIL_RETURN;
                if parent_mergesleft == 0 {
                    let node = r.pop()?;
                    match &*node {
                        PromotionPath::Call(_) => r.merges_to_see(),
                        PromotionPath::CallNotTaken(_) => parent_mergesleft = MC_CALL_NOT_TAKEN,
                        _ => {
                            return Err(CompilationError::InternalError(
                                "expected a call in the promotion path".into(),
                            ))
                        }
                    }
                }
                self.queues[queue].mergecounter = parent_mergesleft;
            }
        }
        Ok(())
    }

    pub(crate) fn leave_frame(&mut self, js: JsIdx) -> Result<(), CompilationError> {
        let state = &mut self.jitstates[js];
        let frame = state
            .frame
            .take()
            .ok_or_else(|| CompilationError::InternalError("leaving a missing frame".into()))?;
        state.frame = frame.backframe;
        if state.resuming.is_none() {
            let node = cut_node(state.path()?);
            let node = match &*node {
                PromotionPath::Call(next) => PromotionPath::CallNotTaken(Rc::clone(next)),
                _ => PromotionPath::MergesToSee(Rc::new(PromotionPath::BackFromReturn(node)), 0),
            };
            state.promotion_path = Some(Rc::new(node));
        }
        Ok(())
    }

    /// Merge the states that returned from the graph owning `queue`. Returns the state that
    /// goes on, or `None` if every one of them jumped to an existing block.
    pub(crate) fn merge_returning_jitstates(
        &mut self,
        js: JsIdx,
        queue: QueueIdx,
    ) -> Result<Option<JsIdx>, CompilationError> {
        let resuming = self.jitstates[js].resuming.clone();
        let mut return_chain = self.queues[queue].return_chain.take();
        let mut cache = StatesDic::default();
        let mut still_pending = None;
        while let Some(j) = return_chain {
            return_chain = self.jitstates[j].next;
            if !self.retrieve_jitstate_for_merge(&mut cache, j, Vec::new(), Resumer::ReturnMarker)?
            {
                self.jitstates[j].next = still_pending;
                still_pending = Some(j);
            }
        }
        // The last state to start a block is the most general one: all others must merge into it.
        let most_general = still_pending;
        if let Some(mg) = most_general {
            let mut pending = self.jitstates[mg].next.take();
            while let Some(j) = pending {
                pending = self.jitstates[j].next;
                if !self.retrieve_jitstate_for_merge(
                    &mut cache,
                    j,
                    Vec::new(),
                    Resumer::ReturnMarker,
                )? {
                    return Err(CompilationError::InternalError(
                        "a returning state did not merge into the most general one".into(),
                    ));
                }
            }
        }
        if let Some(r) = resuming {
            let mergecounter = self.queues[queue].mergecounter;
            r.borrow_mut().leave_call(mergecounter)?;
        }
        Ok(most_general)
    }

    /// Leave a graph returning a red value, which it saved as its local 0. The value becomes
    /// local 0 of the caller's frame, which is restored by the caller's resume block.
    pub(crate) fn leave_graph_red(
        &mut self,
        js: JsIdx,
        queue: QueueIdx,
    ) -> Result<Option<JsIdx>, CompilationError> {
        let Some(js) = self.merge_returning_jitstates(js, queue)? else {
            return Ok(None);
        };
        let retbox = self.jitstates[js].frame()?.local_boxes.first().copied();
        self.leave_frame(js)?;
        let state = &mut self.jitstates[js];
        state.returnbox = retbox;
        state.greens.clear();
        if let (Some(b), Some(caller)) = (retbox, state.frame.as_deref_mut()) {
            caller.local_boxes.insert(0, b);
        }
        Ok(Some(js))
    }

    pub(crate) fn leave_graph_gray(
        &mut self,
        js: JsIdx,
        queue: QueueIdx,
    ) -> Result<Option<JsIdx>, CompilationError> {
        let Some(js) = self.merge_returning_jitstates(js, queue)? else {
            return Ok(None);
        };
        self.leave_frame(js)?;
        self.jitstates[js].greens.clear();
        Ok(Some(js))
    }

    /// Leave a graph returning a green value. Every returning state leaves separately, carrying
    /// its result as green 0; the head of their chain is returned.
    pub(crate) fn leave_graph_yellow(
        &mut self,
        js: JsIdx,
        queue: QueueIdx,
    ) -> Result<Option<JsIdx>, CompilationError> {
        if let Some(r) = self.jitstates[js].resuming.clone() {
            let mergecounter = self.queues[queue].mergecounter;
            r.borrow_mut().leave_call(mergecounter)?;
        }
        let chain = self.queues[queue].return_chain.take();
        let mut pending = chain;
        while let Some(j) = pending {
            self.leave_frame(j)?;
            pending = self.jitstates[j].next;
        }
        Ok(chain)
    }

    /// Close the code of the state that leaves the portal by returning its return value. An
    /// exception the state may have pending is stored for the portal's caller first.
    pub(crate) fn finish_jitstate(&mut self, js: JsIdx) -> Result<(), CompilationError> {
        self.store_global_excdata(js)?;
        let returnbox = self.jitstates[js].returnbox;
        let builder = self.jitstates[js].builder()?;
        let gv = match returnbox {
            Some(b) => self.boxes.getgenvar(b, builder)?,
            None => GenVar::Const(0),
        };
        builder.finish_and_return(gv)?;
        self.jitstates[js].curbuilder = None;
        Ok(())
    }

    /// Can a residual call to any of `family` leave an exception pending?
    pub(crate) fn can_raise(&mut self, family: &[GraphIdx]) -> Result<bool, CompilationError> {
        let program = Rc::clone(&self.program);
        let mut any = false;
        for g in family {
            any |= can_raise(&program, *g, &mut self.raising)?;
        }
        Ok(any)
    }

    /// After a call that may raise, move the pending exception into the exception boxes of `js`
    /// and clear it.
    pub(crate) fn fetch_global_excdata(&mut self, js: JsIdx) -> Result<(), CompilationError> {
        let fetch_type = tsrt_exc_fetch_type as extern "C" fn() -> i64;
        let fetch_value = tsrt_exc_fetch_value as extern "C" fn() -> i64;
        let clear = tsrt_exc_clear as extern "C" fn() -> i64;
        let builder = self.jitstates[js].builder()?;
        let gv_type = builder.genop_call(GenVar::Const(fetch_type as usize as i64), &[])?;
        let gv_value = builder.genop_call(GenVar::Const(fetch_value as usize as i64), &[])?;
        builder.genop_call(GenVar::Const(clear as usize as i64), &[])?;
        let exc_type = self.boxes.var(LLType::Signed, gv_type);
        let exc_value = self.boxes.var(LLType::Signed, gv_value);
        let state = &mut self.jitstates[js];
        state.exc_type = exc_type;
        state.exc_value = exc_value;
        Ok(())
    }

    /// Make the exception boxes of `js` the pending exception of the generated code, unless they
    /// are known to hold none.
    fn store_global_excdata(&mut self, js: JsIdx) -> Result<(), CompilationError> {
        let (exc_type, exc_value) = (self.jitstates[js].exc_type, self.jitstates[js].exc_value);
        if self.boxes.constvalue(exc_type) == Some(0) {
            return Ok(());
        }
        let raise = tsrt_exc_raise as extern "C" fn(i64, i64) -> i64;
        let builder = self.jitstates[js].builder()?;
        let gv_type = self.boxes.getgenvar(exc_type, builder)?;
        let gv_value = self.boxes.getgenvar(exc_value, builder)?;
        builder.genop_call(GenVar::Const(raise as usize as i64), &[gv_type, gv_value])?;
        Ok(())
    }

    /// Emit a call to the native function `fnaddr`.
    pub(crate) fn residual_call(
        &mut self,
        js: JsIdx,
        fnaddr: GenVar,
        args: &[BoxIdx],
        result: &LLType,
    ) -> Result<Option<BoxIdx>, CompilationError> {
        let builder = self.jitstates[js].builder()?;
        let mut gvs = Vec::with_capacity(args.len());
        for b in args {
            gvs.push(self.boxes.getgenvar(*b, builder)?);
        }
        let gv = builder.genop_call(fnaddr, &gvs)?;
        if result.is_void() {
            Ok(None)
        } else {
            Ok(Some(self.boxes.var(result.clone(), gv)))
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stats.output();
    }
}

// Red operations. Each folds when it can and otherwise emits code through `builder`.

pub(crate) fn ll_gen1(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    op: LLOp,
    arg: BoxIdx,
) -> Result<BoxIdx, CompilationError> {
    if op.canfold() {
        if let Some(x) = boxes.constvalue(arg) {
            return Ok(boxes.constant(op.result_type(), op.fold(&[x])?));
        }
    }
    let gv = boxes.getgenvar(arg, builder)?;
    Ok(boxes.var(op.result_type(), builder.genop1(op, gv)?))
}

pub(crate) fn ll_gen2(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    op: LLOp,
    arg1: BoxIdx,
    arg2: BoxIdx,
) -> Result<BoxIdx, CompilationError> {
    if op.canfold() {
        if let (Some(x), Some(y)) = (boxes.constvalue(arg1), boxes.constvalue(arg2)) {
            return Ok(boxes.constant(op.result_type(), op.fold(&[x, y])?));
        }
    }
    let gv1 = boxes.getgenvar(arg1, builder)?;
    let gv2 = boxes.getgenvar(arg2, builder)?;
    Ok(boxes.var(op.result_type(), builder.genop2(op, gv1, gv2)?))
}

pub(crate) fn ll_gen_getfield(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    desc: &StructTypeDesc,
    index: usize,
    deepfrozen: bool,
    ptr: BoxIdx,
) -> Result<BoxIdx, CompilationError> {
    if boxes.is_virtual(ptr) {
        return boxes.op_getfield(ptr, index);
    }
    let fd = &desc.fields[index];
    if fd.kind.is_void() {
        return Ok(boxes.constant(LLType::Void, 0));
    }
    if desc.immutable || deepfrozen {
        if let Some(addr) = boxes.constvalue(ptr) {
            return Ok(boxes.constant(fd.kind.clone(), read_word(addr, fd.offset)?));
        }
    }
    let gv = boxes.getgenvar(ptr, builder)?;
    Ok(boxes.var(fd.kind.clone(), builder.genop_getfield(fd.offset, gv)?))
}

pub(crate) fn ll_gen_setfield(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    desc: &StructTypeDesc,
    index: usize,
    ptr: BoxIdx,
    value: BoxIdx,
) -> Result<(), CompilationError> {
    if boxes.is_virtual(ptr) {
        return boxes.op_setfield(ptr, index, value);
    }
    let fd = &desc.fields[index];
    if fd.kind.is_void() {
        return Ok(());
    }
    let gvp = boxes.getgenvar(ptr, builder)?;
    let gvv = boxes.getgenvar(value, builder)?;
    builder.genop_setfield(fd.offset, gvp, gvv)
}

/// `fold` says whether the array's items may be read at specialization time.
pub(crate) fn ll_gen_getarrayitem(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    kind: &LLType,
    fold: bool,
    array: BoxIdx,
    index: BoxIdx,
) -> Result<BoxIdx, CompilationError> {
    if fold {
        if let (Some(a), Some(i)) = (boxes.constvalue(array), boxes.constvalue(index)) {
            return Ok(boxes.constant(kind.clone(), read_item(a, i)?));
        }
    }
    let gva = boxes.getgenvar(array, builder)?;
    let gvi = boxes.getgenvar(index, builder)?;
    Ok(boxes.var(
        kind.clone(),
        builder.genop_getarrayitem(ArrayToken::WORDS, gva, gvi)?,
    ))
}

pub(crate) fn ll_gen_setarrayitem(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    array: BoxIdx,
    index: BoxIdx,
    value: BoxIdx,
) -> Result<(), CompilationError> {
    let gva = boxes.getgenvar(array, builder)?;
    let gvi = boxes.getgenvar(index, builder)?;
    let gvv = boxes.getgenvar(value, builder)?;
    builder.genop_setarrayitem(ArrayToken::WORDS, gva, gvi, gvv)
}

pub(crate) fn ll_gen_getarraysize(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    array: BoxIdx,
) -> Result<BoxIdx, CompilationError> {
    if let Some(a) = boxes.constvalue(array) {
        let len = read_word(a, ArrayToken::WORDS.lengthoffset)?;
        return Ok(boxes.constant(LLType::Signed, len));
    }
    let gva = boxes.getgenvar(array, builder)?;
    Ok(boxes.var(
        LLType::Signed,
        builder.genop_getarraysize(ArrayToken::WORDS, gva)?,
    ))
}

pub(crate) fn ll_gen_malloc_varsize(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    kind: &LLType,
    length: BoxIdx,
) -> Result<BoxIdx, CompilationError> {
    let gvl = boxes.getgenvar(length, builder)?;
    Ok(boxes.var(
        kind.clone(),
        builder.genop_malloc_varsize(ArrayToken::WORDS, gvl)?,
    ))
}

/// `ptr_nonzero`, or `ptr_iszero` if `reverse`.
pub(crate) fn ll_gen_ptrnonzero(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    ptr: BoxIdx,
    reverse: bool,
) -> Result<BoxIdx, CompilationError> {
    if let Some(addr) = boxes.constvalue(ptr) {
        return Ok(boxes.constant(LLType::Bool, i64::from((addr != 0) ^ reverse)));
    }
    if boxes.is_virtual(ptr) {
        return Ok(boxes.constant(LLType::Bool, i64::from(!reverse)));
    }
    let gv = boxes.getgenvar(ptr, builder)?;
    let op = if reverse {
        LLOp::BoolNot
    } else {
        LLOp::IntIsTrue
    };
    Ok(boxes.var(LLType::Bool, builder.genop1(op, gv)?))
}

/// `ptr_eq`, or `ptr_ne` if `reverse`.
pub(crate) fn ll_gen_ptreq(
    boxes: &mut Boxes,
    builder: &mut dyn GenBuilder,
    ptr1: BoxIdx,
    ptr2: BoxIdx,
    reverse: bool,
) -> Result<BoxIdx, CompilationError> {
    if boxes.is_virtual(ptr1) || boxes.is_virtual(ptr2) {
        return Ok(boxes.constant(LLType::Bool, i64::from((ptr1 == ptr2) ^ reverse)));
    }
    if let (Some(x), Some(y)) = (boxes.constvalue(ptr1), boxes.constvalue(ptr2)) {
        return Ok(boxes.constant(LLType::Bool, i64::from((x == y) ^ reverse)));
    }
    let gv1 = boxes.getgenvar(ptr1, builder)?;
    let gv2 = boxes.getgenvar(ptr2, builder)?;
    let op = if reverse { LLOp::IntNe } else { LLOp::IntEq };
    Ok(boxes.var(LLType::Bool, builder.genop2(op, gv1, gv2)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codegen::{replay::ReplayBuilder, RGenOp},
        lltype::call_native,
    };

    fn engine(config: Config) -> Rc<RefCell<Engine>> {
        Engine::new(Rc::new(Program::new()), config).unwrap()
    }

    fn call(entry: usize, args: &[i64]) -> i64 {
        unsafe { call_native(entry as i64, args) }.unwrap()
    }

    /// Start compiling a one-argument function: returns the jitstate, its queue and a box for
    /// the argument.
    fn start(e: &mut Engine, name: &str) -> (usize, JsIdx, QueueIdx, BoxIdx) {
        let (b, entry, args) = e.rgenop.newgraph(1, name).unwrap();
        let js = e.fresh_jitstate(b);
        let q = e.ensure_queue(js, false).unwrap();
        e.enter_frame(js, q).unwrap();
        let x = e.boxes.var(LLType::Signed, args[0]);
        (entry, js, q, x)
    }

    fn ret(e: &mut Engine, js: JsIdx, b: BoxIdx) {
        let gv = e.genvar(js, b).unwrap();
        e.jitstates[js].builder().unwrap().finish_and_return(gv).unwrap();
        e.jitstates[js].curbuilder = None;
    }

    #[test]
    fn folding_and_emitting() {
        let engine = engine(Config::default());
        let mut guard = engine.borrow_mut();
        let e = &mut *guard;
        let (entry, js, _, x) = start(e, "fold");
        let c3 = e.boxes.constant(LLType::Signed, 3);
        let c4 = e.boxes.constant(LLType::Signed, 4);
        let builder = e.jitstates[js].builder().unwrap();
        let c7 = ll_gen2(&mut e.boxes, builder, LLOp::IntAdd, c3, c4).unwrap();
        assert_eq!(e.boxes.constvalue(c7), Some(7));
        assert!(e.rgenop.insns().is_empty());
        let r = ll_gen2(&mut e.boxes, builder, LLOp::IntMul, x, c7).unwrap();
        let r = ll_gen1(&mut e.boxes, builder, LLOp::IntNeg, r).unwrap();
        assert_eq!(e.rgenop.insns().get("int_mul"), Some(&1));
        assert_eq!(e.rgenop.insns().get("int_neg"), Some(&1));
        let zero = e.boxes.constant(LLType::Signed, 0);
        assert!(ll_gen2(&mut e.boxes, builder, LLOp::IntFloorDiv, c7, zero).is_err());
        ret(e, js, r);
        assert_eq!(call(entry, &[2]), -14);
    }

    #[test]
    fn identical_states_merge() {
        let engine = engine(Config::default());
        let mut guard = engine.borrow_mut();
        let e = &mut *guard;
        let (entry, js, q, x) = start(e, "merge");
        e.save_locals(js, vec![x]).unwrap();
        assert!(e.split(js, x, 3, vec![]).unwrap());
        assert!(matches!(
            e.jitstates[js].promotion_path.as_deref(),
            Some(PromotionPath::Yes(_))
        ));
        let mut dic = StatesDic::default();
        assert!(!e
            .retrieve_jitstate_for_merge(&mut dic, js, vec![], Resumer::Local)
            .unwrap());
        let x1 = e.restore_local(js, 0).unwrap();
        let one = e.boxes.constant(LLType::Signed, 1);
        let builder = e.jitstates[js].builder().unwrap();
        let r = ll_gen2(&mut e.boxes, builder, LLOp::IntAdd, x1, one).unwrap();
        ret(e, js, r);

        let js2 = e.dispatch_next(js, q).unwrap();
        assert_ne!(js2, js);
        assert_eq!(e.jitstates[js2].resumepoint, 3);
        assert!(e
            .retrieve_jitstate_for_merge(&mut dic, js2, vec![], Resumer::Local)
            .unwrap());
        assert!(e.jitstates[js2].curbuilder.is_none());
        assert_eq!(dic.len(), 1);
        assert_eq!(e.dispatch_next(js, q).unwrap(), js);
        assert_eq!(e.jitstates[js].resumepoint, -1);

        assert_eq!(call(entry, &[5]), 6);
        assert_eq!(call(entry, &[0]), 1);
        assert_eq!(e.rgenop.insns().get("int_add"), Some(&1));
    }

    #[test]
    fn different_constants_generalize() {
        let engine = engine(Config::default());
        let mut guard = engine.borrow_mut();
        let e = &mut *guard;
        let (entry, js, q, x) = start(e, "generalize");
        let c10 = e.boxes.constant(LLType::Signed, 10);
        e.save_locals(js, vec![c10]).unwrap();
        assert!(e.split(js, x, 0, vec![]).unwrap());
        let mut dic = StatesDic::default();
        assert!(!e
            .retrieve_jitstate_for_merge(&mut dic, js, vec![], Resumer::Local)
            .unwrap());
        let l = e.restore_local(js, 0).unwrap();
        assert_eq!(e.boxes.constvalue(l), Some(10));
        ret(e, js, l);

        let js2 = e.dispatch_next(js, q).unwrap();
        let c20 = e.boxes.constant(LLType::Signed, 20);
        e.save_locals(js2, vec![c20]).unwrap();
        assert!(!e
            .retrieve_jitstate_for_merge(&mut dic, js2, vec![], Resumer::Local)
            .unwrap());
        let l = e.restore_local(js2, 0).unwrap();
        assert!(!e.boxes.is_constant(l));
        assert_eq!(e.queues[q].mergecounter, 1);
        assert!(matches!(
            e.jitstates[js2].promotion_path.as_deref(),
            Some(PromotionPath::MergesToSee(_, 1))
        ));
        ret(e, js2, l);

        assert_eq!(call(entry, &[1]), 10);
        assert_eq!(call(entry, &[0]), 20);
    }

    #[test]
    fn merge_limit() {
        let engine = engine(Config::default().with_merge_limit(0));
        let mut guard = engine.borrow_mut();
        let e = &mut *guard;
        let (_, js, q, x) = start(e, "limit");
        let c1 = e.boxes.constant(LLType::Signed, 1);
        e.save_locals(js, vec![c1]).unwrap();
        e.split(js, x, 0, vec![]).unwrap();
        let mut dic = StatesDic::default();
        e.retrieve_jitstate_for_merge(&mut dic, js, vec![], Resumer::Local)
            .unwrap();
        let js2 = e.dispatch_next(js, q).unwrap();
        let c2 = e.boxes.constant(LLType::Signed, 2);
        e.save_locals(js2, vec![c2]).unwrap();
        assert!(matches!(
            e.retrieve_jitstate_for_merge(&mut dic, js2, vec![], Resumer::Local),
            Err(CompilationError::LimitExceeded(_))
        ));
    }

    #[test]
    fn split_chain_order() {
        let engine = engine(Config::default());
        let mut guard = engine.borrow_mut();
        let e = &mut *guard;
        let block = BlockDesc {
            startaddr: 0,
            arg_positions: vec![1],
            stackdepth: 2,
        };
        let (b, vars) = ReplayBuilder::new(&block, &[LLType::Bool]);
        let js = e.fresh_jitstate(Box::new(b));
        let q = e.ensure_queue(js, false).unwrap();
        e.enter_frame(js, q).unwrap();
        let cond = e.boxes.var(LLType::Bool, vars[0]);
        e.split(js, cond, 1, vec![]).unwrap();
        e.split(js, cond, 2, vec![]).unwrap();
        e.reverse_split_queue(q);
        let first = e.dispatch_next(js, q).unwrap();
        let second = e.dispatch_next(js, q).unwrap();
        assert_eq!(e.jitstates[first].resumepoint, 1);
        assert_eq!(e.jitstates[second].resumepoint, 2);
        assert_eq!(e.dispatch_next(js, q).unwrap(), js);
        // A constant condition never splits.
        let t = e.boxes.constant(LLType::Bool, 0);
        assert!(!e.split(js, t, 3, vec![]).unwrap());
        assert!(e.queues[q].split_chain.is_none());
    }

    #[test]
    fn calls_and_returns() {
        let engine = engine(Config::default());
        let mut guard = engine.borrow_mut();
        let e = &mut *guard;
        let (entry, js, _, x) = start(e, "calls");
        e.save_locals(js, vec![]).unwrap();
        // A red callee returning its argument doubled, from two returning states.
        let q2 = e.ensure_queue(js, false).unwrap();
        e.enter_frame(js, q2).unwrap();
        assert!(matches!(
            e.jitstates[js].promotion_path.as_deref(),
            Some(PromotionPath::MergesToSee(_, 0))
        ));
        let two = e.boxes.constant(LLType::Signed, 2);
        let builder = e.jitstates[js].builder().unwrap();
        let r = ll_gen2(&mut e.boxes, builder, LLOp::IntMul, x, two).unwrap();
        e.save_locals(js, vec![r]).unwrap();
        e.save_return(js).unwrap();
        let js = e.dispatch_next(js, q2).unwrap();
        let js = e.leave_graph_red(js, q2).unwrap().unwrap();
        assert_eq!(e.jitstates[js].returnbox, Some(r));
        assert!(matches!(
            e.jitstates[js].promotion_path.as_deref(),
            Some(PromotionPath::CallNotTaken(_))
        ));
        // The result became the caller's local 0.
        assert_eq!(e.restore_local(js, 0).unwrap(), r);
        let r = e.restore_local(js, 0).unwrap();
        ret(e, js, r);
        assert_eq!(call(entry, &[21]), 42);
    }

    #[test]
    fn ptr_ops_on_virtuals() {
        let engine = engine(Config::default());
        let mut guard = engine.borrow_mut();
        let e = &mut *guard;
        let (entry, js, _, x) = start(e, "ptrs");
        let mut cache = super::super::rcontainer::TypeDescCache::default();
        let desc = cache
            .get(&LLType::new_struct("S", &[("a", LLType::Signed)], false))
            .unwrap();
        let v = e.boxes.factory(&desc);
        let w = e.boxes.factory(&desc);
        let builder = e.jitstates[js].builder().unwrap();
        let nz = ll_gen_ptrnonzero(&mut e.boxes, builder, v, false).unwrap();
        assert_eq!(e.boxes.constvalue(nz), Some(1));
        let z = ll_gen_ptrnonzero(&mut e.boxes, builder, v, true).unwrap();
        assert_eq!(e.boxes.constvalue(z), Some(0));
        let eq = ll_gen_ptreq(&mut e.boxes, builder, v, v, false).unwrap();
        assert_eq!(e.boxes.constvalue(eq), Some(1));
        let ne = ll_gen_ptreq(&mut e.boxes, builder, v, w, true).unwrap();
        assert_eq!(e.boxes.constvalue(ne), Some(1));
        let null = e.boxes.constant(LLType::Signed, 0);
        let isz = ll_gen_ptrnonzero(&mut e.boxes, builder, null, true).unwrap();
        assert_eq!(e.boxes.constvalue(isz), Some(1));
        assert!(e.rgenop.insns().is_empty());
        let r = ll_gen_ptrnonzero(&mut e.boxes, builder, x, true).unwrap();
        assert_eq!(e.rgenop.insns().get("bool_not"), Some(&1));
        ret(e, js, r);
        assert_eq!(call(entry, &[0]), 1);
        assert_eq!(call(entry, &[1234]), 0);
    }
}
