//! Hint annotations and the rules for computing them.
//!
//! Every variable of an annotated graph is bound to an [HValue]:
//!
//!   * [HValue::Const]: a value that *may* be known at specialization time. Whether it actually
//!     is (i.e. whether it is green) depends on its [OriginFlags]: a constant is green if all of
//!     its origins have been fixed, if it was eagerly made concrete, or if the operation that
//!     produced it only had green arguments.
//!   * [HValue::Var]: a value that is definitely only known at run time (red).
//!   * [HValue::Container]: a pointer to a struct allocated by the program, whose fields are
//!     tracked by a [super::container::ContainerDef] (blue).
//!   * [HValue::Impossible]: no value has flowed here yet.

use super::{HGraphIdx, HintAnnotator};
use crate::{
    error::CompilationError,
    flowgraph::{Arg, BlockIdx, Callee, OpKind},
    lltype::LLType,
};
use std::collections::{BTreeSet, HashMap, HashSet};

index_vec::define_index_type! {
    pub struct OriginIdx = u32;
}

index_vec::define_index_type! {
    pub struct ContainerIdx = u32;
}

/// Greenness checks follow call results and operation arguments recursively. Anything deeper than
/// this is conservatively considered red.
const MAX_GREEN_DEPTH: usize = 64;

/// The hints a program may use. Anything else is a [CompilationError::HintError].
pub(crate) const HINT_VOCABULARY: [&str; 7] = [
    "concrete",
    "promote",
    "variable",
    "forget",
    "deepfreeze",
    "global_merge_point",
    "reverse_split_queue",
];

/// A place in an annotated graph where annotations are computed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Position {
    /// Operation `index` of `block`.
    Op(HGraphIdx, BlockIdx, usize),
    /// Input argument `index` of a graph.
    InputArg(HGraphIdx, usize),
}

/// Where a [ConstValue] came from, and whether something needs it to be known at specialization
/// time.
#[derive(Debug)]
pub(crate) struct OriginFlags {
    pub(crate) fixed: bool,
    /// The positions whose result depended on the value of `fixed`.
    read_positions: HashSet<Position>,
    /// The operation this origin stands for, or `None` for a graph's input argument.
    pub(crate) spaceop: Option<Position>,
    pub(crate) is_call_result: bool,
}

impl OriginFlags {
    pub(crate) fn new(spaceop: Option<Position>) -> Self {
        Self {
            fixed: false,
            read_positions: HashSet::new(),
            spaceop,
            is_call_result: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstValue {
    pub ty: LLType,
    pub origins: BTreeSet<OriginIdx>,
    /// Forced to be green by a `concrete` or `promote` hint.
    pub eager: bool,
    /// The origin of the operation which produced this value, if it is still relevant.
    pub myorigin: Option<OriginIdx>,
    /// Reads through this (pointer) value see memory that will not change.
    pub deepfrozen: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HValue {
    Const(ConstValue),
    Var { ty: LLType, deepfrozen: bool },
    Container { ty: LLType, def: ContainerIdx },
    Impossible,
}

impl HValue {
    /// A constant with no origins: green no matter what.
    pub fn constant(ty: LLType) -> Self {
        HValue::Const(ConstValue {
            ty,
            origins: BTreeSet::new(),
            eager: false,
            myorigin: None,
            deepfrozen: false,
        })
    }

    /// A constant that is green because it was eagerly made concrete, as portal green arguments
    /// are.
    pub fn concrete(ty: LLType) -> Self {
        HValue::Const(ConstValue {
            ty,
            origins: BTreeSet::new(),
            eager: true,
            myorigin: None,
            deepfrozen: false,
        })
    }

    pub fn variable(ty: LLType) -> Self {
        HValue::Var {
            ty,
            deepfrozen: false,
        }
    }

    pub(crate) fn void() -> Self {
        Self::constant(LLType::Void)
    }

    /// The low-level type of this value, or `None` for [HValue::Impossible].
    pub fn ty(&self) -> Option<&LLType> {
        match self {
            HValue::Const(c) => Some(&c.ty),
            HValue::Var { ty, .. } | HValue::Container { ty, .. } => Some(ty),
            HValue::Impossible => None,
        }
    }

    pub(crate) fn deepfrozen(&self) -> bool {
        match self {
            HValue::Const(c) => c.deepfrozen,
            HValue::Var { deepfrozen, .. } => *deepfrozen,
            HValue::Container { .. } | HValue::Impossible => false,
        }
    }

    fn deepunfreeze(&self) -> Self {
        match self {
            HValue::Const(c) => HValue::Const(ConstValue {
                deepfrozen: false,
                ..c.clone()
            }),
            HValue::Var { ty, .. } => HValue::variable(ty.clone()),
            x => x.clone(),
        }
    }
}

/// The argument bindings visible while checking whether a callee's value is green for one
/// particular call.
pub(crate) struct GreenFrame<'a> {
    parent: Option<&'a GreenFrame<'a>>,
    inputarg2actual: HashMap<OriginIdx, HValue>,
}

impl<'a> GreenFrame<'a> {
    fn root() -> Self {
        Self {
            parent: None,
            inputarg2actual: HashMap::new(),
        }
    }
}

impl HintAnnotator<'_> {
    // Greenness.

    pub(crate) fn is_fixed(&self, c: &ConstValue) -> bool {
        c.origins.iter().all(|o| self.bookkeeper.origins[*o].fixed)
    }

    /// Is `hs` known at specialization time?
    pub fn is_green(&self, hs: &HValue) -> bool {
        self.is_green_in(hs, None, 0)
    }

    fn is_green_in(&self, hs: &HValue, frame: Option<&GreenFrame>, depth: usize) -> bool {
        match hs {
            HValue::Const(c) => {
                self.is_fixed(c)
                    || c.eager
                    || c.ty.is_void()
                    || c
                        .myorigin
                        .is_some_and(|o| self.greenargs(o, frame, depth + 1))
            }
            HValue::Var { ty, .. } => ty.is_void(),
            HValue::Container { .. } | HValue::Impossible => false,
        }
    }

    fn greenargs(&self, origin: OriginIdx, frame: Option<&GreenFrame>, depth: usize) -> bool {
        if depth > MAX_GREEN_DEPTH {
            return false;
        }
        let o = &self.bookkeeper.origins[origin];
        let Some(Position::Op(hg, block, index)) = o.spaceop else {
            return false;
        };
        let root = GreenFrame::root();
        let frame = frame.unwrap_or(&root);
        if o.is_call_result {
            self.greencallresult(hg, block, index, frame, depth)
        } else {
            self.hgraphs[hg].graph.blocks[block].operations[index]
                .args
                .iter()
                .all(|a| self.greenvar(hg, a, frame, depth))
        }
    }

    fn greenvar(&self, hg: HGraphIdx, a: &Arg, frame: &GreenFrame, depth: usize) -> bool {
        let hs = self.arg_binding(hg, a);
        if let HValue::Const(c) = &hs {
            if c.origins.len() == 1 {
                let o = c.origins.first().copied();
                if let Some(actual) = o.and_then(|o| frame.inputarg2actual.get(&o)) {
                    return self.is_green_in(actual, frame.parent, depth + 1);
                }
            }
        }
        self.is_green_in(&hs, Some(frame), depth + 1)
    }

    /// Is the result of the call at `(hg, block, index)` green given the argument bindings of
    /// `frame`?
    fn greencallresult(
        &self,
        hg: HGraphIdx,
        block: BlockIdx,
        index: usize,
        frame: &GreenFrame,
        depth: usize,
    ) -> bool {
        let op = &self.hgraphs[hg].graph.blocks[block].operations[index];
        if !matches!(self.var_binding(hg, op.result), HValue::Const(_)) {
            return false;
        }
        let args = match &op.kind {
            OpKind::DirectCall(_) => &op.args[..],
            OpKind::IndirectCall(_) => &op.args[1..],
            _ => return false,
        };
        let Some(targets) = self.call_targets.get(&Position::Op(hg, block, index)) else {
            return false;
        };
        targets.iter().all(|callee| {
            let callee_graph = &self.hgraphs[*callee].graph;
            let mut newframe = GreenFrame {
                parent: Some(frame),
                inputarg2actual: HashMap::new(),
            };
            for (inp, a) in callee_graph.getargs().iter().zip(args) {
                let hs_arg = self.arg_binding(hg, a);
                if !matches!(hs_arg, HValue::Const(_)) {
                    continue;
                }
                if let HValue::Const(c) = self.var_binding(*callee, *inp) {
                    if let Some(o) = c.origins.first() {
                        newframe.inputarg2actual.insert(*o, hs_arg);
                    }
                }
            }
            let ret = Arg::Var(callee_graph.getreturnvar());
            self.greenvar(*callee, &ret, &newframe, depth + 1)
        })
    }

    // Union.

    /// The most precise annotation that includes both `a` and `b`.
    pub(crate) fn union(&mut self, a: &HValue, b: &HValue) -> Result<HValue, CompilationError> {
        let (a, b) = match (a, b) {
            (HValue::Impossible, x) | (x, HValue::Impossible) => return Ok(x.clone()),
            (a, b) if a.deepfrozen() != b.deepfrozen() => {
                let (a, b) = (a.deepunfreeze(), b.deepunfreeze());
                if a == b {
                    return Ok(a);
                }
                (a, b)
            }
            (a, b) => (a.clone(), b.clone()),
        };
        if a.ty() != b.ty() {
            return Err(CompilationError::InternalError(format!(
                "cannot merge values of types {} and {}",
                fmt_ty(&a),
                fmt_ty(&b)
            )));
        }
        match (a, b) {
            (HValue::Const(c1), HValue::Const(c2)) => {
                let myorigin = if c1.myorigin == c2.myorigin {
                    c1.myorigin
                } else {
                    None
                };
                Ok(HValue::Const(ConstValue {
                    ty: c1.ty,
                    origins: c1.origins.union(&c2.origins).copied().collect(),
                    eager: c1.eager && c2.eager,
                    myorigin,
                    deepfrozen: c1.deepfrozen,
                }))
            }
            (HValue::Var { ty, deepfrozen }, HValue::Var { .. }) => Ok(HValue::Var { ty, deepfrozen }),
            (HValue::Var { ty, deepfrozen }, HValue::Const(c))
            | (HValue::Const(c), HValue::Var { ty, deepfrozen }) => {
                if c.eager {
                    return Err(CompilationError::General(format!(
                        "a value forced to be concrete merges with a run-time value of type {ty}"
                    )));
                }
                Ok(HValue::Var { ty, deepfrozen })
            }
            (HValue::Container { ty, def: d1 }, HValue::Container { def: d2, .. }) => {
                let def = self.union_containers(d1, d2)?;
                Ok(HValue::Container { ty, def })
            }
            (HValue::Container { ty, def }, _) | (_, HValue::Container { ty, def }) => {
                self.mark_degenerated(def)?;
                Ok(HValue::variable(ty))
            }
            (HValue::Impossible, _) | (_, HValue::Impossible) => Err(CompilationError::InternalError(
                "impossible values are handled above".into(),
            )),
        }
    }

    /// A copy of `hs` whose origins are replaced by the origin of `pos`, plus the origins of any
    /// constants in `deps`.
    pub(crate) fn reorigin(&mut self, hs: &HValue, pos: Position, deps: &[HValue]) -> HValue {
        match hs {
            HValue::Const(c) => {
                let mut origins = BTreeSet::from([self.bookkeeper.myorigin(pos)]);
                for d in deps {
                    if let HValue::Const(dc) = d {
                        origins.extend(dc.origins.iter().copied());
                    }
                }
                HValue::Const(ConstValue {
                    ty: c.ty.clone(),
                    origins,
                    eager: c.eager,
                    myorigin: None,
                    deepfrozen: c.deepfrozen,
                })
            }
            x => x.clone(),
        }
    }

    // Operations.

    /// Compute the annotation of the result of the operation at `pos`, given the annotations of
    /// its arguments.
    pub(crate) fn consider_op(
        &mut self,
        pos: Position,
        kind: &OpKind,
        args_hs: &[HValue],
        result_ty: &LLType,
    ) -> Result<HValue, CompilationError> {
        if args_hs.iter().any(|x| matches!(x, HValue::Impossible)) {
            return Ok(HValue::Impossible);
        }
        match kind {
            OpKind::Op(_) | OpKind::Getarraysize => Ok(self.fold_or_var(pos, args_hs, result_ty)),
            OpKind::SameAs => Ok(args_hs[0].clone()),
            OpKind::Hint(flags) => self.hint(pos, &args_hs[0], flags),
            OpKind::Getfield(name) => match &args_hs[0] {
                HValue::Container { def, .. } => self.read_field(*def, name, pos),
                HValue::Const(c) => {
                    let immutable = c.ty.struct_type().is_some_and(|s| s.immutable);
                    if immutable || c.deepfrozen {
                        let origin = self.bookkeeper.myorigin(pos);
                        let mut origins = c.origins.clone();
                        origins.insert(origin);
                        Ok(HValue::Const(ConstValue {
                            ty: result_ty.clone(),
                            origins,
                            eager: c.eager,
                            myorigin: Some(origin),
                            deepfrozen: c.deepfrozen,
                        }))
                    } else {
                        Ok(HValue::variable(result_ty.clone()))
                    }
                }
                hs => Ok(HValue::Var {
                    ty: result_ty.clone(),
                    deepfrozen: hs.deepfrozen(),
                }),
            },
            OpKind::Setfield(name) => {
                if let HValue::Container { def, .. } = &args_hs[0] {
                    self.generalize_field(*def, name, &args_hs[1])?;
                }
                Ok(HValue::void())
            }
            OpKind::Getarrayitem => match (&args_hs[0], &args_hs[1]) {
                (HValue::Const(a), HValue::Const(i)) => {
                    let immutable = a.ty.array_type().is_some_and(|at| at.immutable);
                    if immutable || a.deepfrozen {
                        let origin = self.bookkeeper.myorigin(pos);
                        let mut origins = a.origins.clone();
                        origins.extend(i.origins.iter().copied());
                        origins.insert(origin);
                        Ok(HValue::Const(ConstValue {
                            ty: result_ty.clone(),
                            origins,
                            eager: a.eager,
                            myorigin: Some(origin),
                            deepfrozen: a.deepfrozen,
                        }))
                    } else {
                        Ok(HValue::variable(result_ty.clone()))
                    }
                }
                (a, _) => Ok(HValue::Var {
                    ty: result_ty.clone(),
                    deepfrozen: a.deepfrozen(),
                }),
            },
            OpKind::Setarrayitem | OpKind::SetExc(_) => Ok(HValue::void()),
            OpKind::GetExc(_) => Ok(HValue::variable(result_ty.clone())),
            OpKind::Malloc(ty) => {
                if self.policy.novirtualcontainer {
                    Ok(HValue::variable(ty.clone()))
                } else {
                    let def = self.getvirtualcontainerdef(pos, ty)?;
                    Ok(HValue::Container {
                        ty: ty.clone(),
                        def,
                    })
                }
            }
            OpKind::MallocVarsize(ty) => Ok(HValue::variable(ty.clone())),
            OpKind::PtrNonzero | OpKind::PtrIszero => match &args_hs[0] {
                HValue::Container { .. } => Ok(HValue::constant(LLType::Bool)),
                _ => Ok(self.fold_or_var(pos, args_hs, result_ty)),
            },
            OpKind::PtrEq | OpKind::PtrNe => match (&args_hs[0], &args_hs[1]) {
                (HValue::Container { .. }, _) | (_, HValue::Container { .. }) => {
                    Ok(HValue::constant(LLType::Bool))
                }
                _ => Ok(self.fold_or_var(pos, args_hs, result_ty)),
            },
            OpKind::DirectCall(Callee::External(f)) => {
                if f.pure {
                    Ok(self.fold_or_var(pos, args_hs, result_ty))
                } else {
                    Ok(HValue::variable(result_ty.clone()))
                }
            }
            OpKind::DirectCall(Callee::Graph(g)) => {
                if !self.policy.look_inside(*g) {
                    self.call_targets.insert(pos, Vec::new());
                    return Ok(HValue::variable(result_ty.clone()));
                }
                self.call(pos, &[*g], args_hs, true)
            }
            OpKind::IndirectCall(family) => {
                if family.is_empty() {
                    return Err(CompilationError::General(
                        "indirect call with an empty call family".into(),
                    ));
                }
                if family.iter().any(|g| !self.policy.look_inside(*g)) {
                    self.call_targets.insert(pos, Vec::new());
                    return Ok(HValue::variable(result_ty.clone()));
                }
                self.call(pos, family, &args_hs[1..], false)
            }
        }
    }

    /// The result of a foldable operation: a constant depending on the constant arguments, or a
    /// variable if any argument is not a constant.
    fn fold_or_var(&mut self, pos: Position, args_hs: &[HValue], result_ty: &LLType) -> HValue {
        let mut origins = BTreeSet::new();
        let mut eager = false;
        for hs in args_hs {
            match hs {
                HValue::Const(c) => {
                    origins.extend(c.origins.iter().copied());
                    eager |= c.eager;
                }
                _ => return HValue::variable(result_ty.clone()),
            }
        }
        let origin = self.bookkeeper.myorigin(pos);
        origins.insert(origin);
        HValue::Const(ConstValue {
            ty: result_ty.clone(),
            origins,
            eager,
            myorigin: Some(origin),
            deepfrozen: false,
        })
    }

    fn hint(
        &mut self,
        pos: Position,
        hs: &HValue,
        flags: &std::collections::BTreeMap<String, bool>,
    ) -> Result<HValue, CompilationError> {
        let err = || CompilationError::HintError {
            hints: fmt_flags(flags),
            value: format!("{hs:?}"),
        };
        if flags
            .keys()
            .any(|k| !HINT_VOCABULARY.contains(&k.as_str()))
        {
            return Err(err());
        }
        let flag = |name: &str| flags.get(name).copied().unwrap_or(false);
        if let HValue::Const(c) = hs {
            if flag("concrete") {
                for o in c.origins.clone() {
                    self.set_fixed(o);
                }
                let mut r = self.reorigin(hs, pos, &[]);
                if let HValue::Const(rc) = &mut r {
                    rc.eager = true;
                }
                return Ok(r);
            }
            if flag("forget") {
                return Ok(self.reorigin(hs, pos, &[]));
            }
            if flag("deepfreeze") {
                return Ok(HValue::Const(ConstValue {
                    ty: c.ty.clone(),
                    origins: c.origins.clone(),
                    eager: false,
                    myorigin: None,
                    deepfrozen: true,
                }));
            }
        }
        let ty = hs.ty().cloned().ok_or_else(err)?;
        if flag("variable") {
            return Ok(HValue::variable(ty));
        }
        if flag("forget") {
            let origin = self.bookkeeper.myorigin(pos);
            return Ok(HValue::Const(ConstValue {
                ty,
                origins: BTreeSet::from([origin]),
                eager: false,
                myorigin: None,
                deepfrozen: false,
            }));
        }
        if flag("promote") {
            return Ok(HValue::concrete(ty));
        }
        if flag("reverse_split_queue") || flag("global_merge_point") {
            return Ok(HValue::void());
        }
        Err(err())
    }

    /// Mark `origin` as fixed, reflowing everything that read its previous state.
    pub(crate) fn set_fixed(&mut self, origin: OriginIdx) {
        let o = &mut self.bookkeeper.origins[origin];
        if !o.fixed {
            o.fixed = true;
            let readers = o.read_positions.drain().collect::<Vec<_>>();
            for p in readers {
                self.reflow_from_position(p);
            }
        }
    }

    /// Is `origin` fixed? Records that `pos` depends on the answer.
    pub(crate) fn read_fixed(&mut self, origin: OriginIdx, pos: Position) -> bool {
        let o = &mut self.bookkeeper.origins[origin];
        if !o.fixed {
            o.read_positions.insert(pos);
        }
        o.fixed
    }
}

fn fmt_ty(hs: &HValue) -> String {
    hs.ty()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "<impossible>".into())
}

fn fmt_flags(flags: &std::collections::BTreeMap<String, bool>) -> String {
    flags
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}
