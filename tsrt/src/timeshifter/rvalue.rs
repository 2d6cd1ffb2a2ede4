//! Red boxes: the specialization-time stand-ins for values that only exist at run time.
//!
//! A box is either a known constant, a variable of the code being generated, or a virtual struct
//! that has not been allocated (yet). Boxes live in an arena and are named by [BoxIdx]; two
//! references to the same `BoxIdx` are the same box, so forcing a virtual in place is seen by
//! every holder.
//!
//! Merging needs a snapshot of a state that can be compared against later states: that is what
//! [FrozenBox]es are. A frozen state is a flat vector of frozen boxes, with sharing expressed by
//! repeated indices.

use super::rcontainer::{StructTypeDesc, VirtualStruct};
use crate::{codegen::GenBuilder, codegen::GenVar, error::CompilationError, lltype::LLType};
use index_vec::IndexVec;
use std::{
    collections::{HashMap, HashSet},
    ops::Index,
    rc::Rc,
};

index_vec::define_index_type! {
    pub(crate) struct BoxIdx = u32;
}

#[derive(Debug)]
pub(crate) enum RedBox {
    Const { kind: LLType, value: i64 },
    Var { kind: LLType, gv: GenVar },
    Virtual { kind: LLType, content: VirtualStruct },
}

impl RedBox {
    pub(crate) fn kind(&self) -> &LLType {
        match self {
            RedBox::Const { kind, .. } | RedBox::Var { kind, .. } | RedBox::Virtual { kind, .. } => {
                kind
            }
        }
    }
}

/// The box arena of one compilation.
#[derive(Default)]
pub(crate) struct Boxes {
    arena: IndexVec<BoxIdx, RedBox>,
}

impl Index<BoxIdx> for Boxes {
    type Output = RedBox;

    fn index(&self, idx: BoxIdx) -> &RedBox {
        &self.arena[idx]
    }
}

/// Maps boxes to their copies (or replacements). Containers are remembered separately so that
/// cyclic virtual structures are only walked once.
#[derive(Default)]
pub(crate) struct CopyMemo {
    pub(crate) boxes: HashMap<BoxIdx, BoxIdx>,
    containers: HashSet<BoxIdx>,
}

impl Boxes {
    /// Drop every box. Only valid once nothing refers to the arena any more.
    pub(crate) fn clear(&mut self) {
        self.arena.clear();
    }

    pub(crate) fn constant(&mut self, kind: LLType, value: i64) -> BoxIdx {
        self.arena.push(RedBox::Const { kind, value })
    }

    pub(crate) fn var(&mut self, kind: LLType, gv: GenVar) -> BoxIdx {
        match gv {
            GenVar::Const(value) => self.constant(kind, value),
            GenVar::Var(_) => self.arena.push(RedBox::Var { kind, gv }),
        }
    }

    pub(crate) fn push(&mut self, b: RedBox) -> BoxIdx {
        self.arena.push(b)
    }

    pub(crate) fn kind(&self, b: BoxIdx) -> &LLType {
        self.arena[b].kind()
    }

    pub(crate) fn is_constant(&self, b: BoxIdx) -> bool {
        matches!(self.arena[b], RedBox::Const { .. })
    }

    pub(crate) fn is_virtual(&self, b: BoxIdx) -> bool {
        matches!(self.arena[b], RedBox::Virtual { .. })
    }

    /// The value of a constant box.
    pub(crate) fn constvalue(&self, b: BoxIdx) -> Option<i64> {
        match self.arena[b] {
            RedBox::Const { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The content of a virtual box.
    pub(crate) fn content(&self, b: BoxIdx) -> Option<&VirtualStruct> {
        match &self.arena[b] {
            RedBox::Virtual { content, .. } => Some(content),
            _ => None,
        }
    }

    pub(crate) fn content_mut(&mut self, b: BoxIdx) -> Option<&mut VirtualStruct> {
        match &mut self.arena[b] {
            RedBox::Virtual { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Overwrite `b` in place.
    pub(crate) fn set(&mut self, b: BoxIdx, new: RedBox) {
        self.arena[b] = new;
    }

    /// Point a variable box at `gv`, as `enter_next_block` does for block inputs.
    pub(crate) fn set_genvar(&mut self, b: BoxIdx, gv: GenVar) -> Result<(), CompilationError> {
        match &mut self.arena[b] {
            RedBox::Var { gv: old, .. } => {
                *old = gv;
                Ok(())
            }
            x => Err(CompilationError::InternalError(format!(
                "cannot set the genvar of {x:?}"
            ))),
        }
    }

    /// The operand standing for `b` in generated code, forcing it first if it is virtual.
    pub(crate) fn getgenvar(
        &mut self,
        b: BoxIdx,
        builder: &mut dyn GenBuilder,
    ) -> Result<GenVar, CompilationError> {
        match &self.arena[b] {
            RedBox::Const { value, .. } => Ok(GenVar::Const(*value)),
            RedBox::Var { gv, .. } => Ok(*gv),
            RedBox::Virtual { .. } => self.force_runtime_container(b, builder),
        }
    }

    /// Is `b` the constant `value`?
    pub(crate) fn same_constant(&self, b: BoxIdx, value: i64) -> bool {
        self.constvalue(b) == Some(value)
    }

    /// Make sure `b` is a run-time variable. A constant box cannot be mutated (it may be
    /// shared), so a fresh variable box is recorded in `memo` for [Self::replace] to substitute.
    pub(crate) fn forcevar(
        &mut self,
        b: BoxIdx,
        builder: &mut dyn GenBuilder,
        memo: &mut CopyMemo,
    ) -> Result<(), CompilationError> {
        match &self.arena[b] {
            RedBox::Const { kind, value } => {
                if memo.boxes.contains_key(&b) {
                    return Ok(());
                }
                let (kind, value) = (kind.clone(), *value);
                let gv = builder.genop_same_as(GenVar::Const(value))?;
                let nb = self.arena.push(RedBox::Var { kind, gv });
                memo.boxes.insert(b, nb);
                Ok(())
            }
            RedBox::Var { .. } => Ok(()),
            RedBox::Virtual { .. } => self.force_runtime_container(b, builder).map(|_| ()),
        }
    }

    /// Apply the substitutions of `memo` to `b` and (for virtuals) to everything it reaches.
    pub(crate) fn replace(&mut self, b: BoxIdx, memo: &mut CopyMemo) -> BoxIdx {
        if let Some(nb) = memo.boxes.get(&b) {
            return *nb;
        }
        if self.is_virtual(b) && memo.containers.insert(b) {
            let fields = self.content(b).map(|c| c.fields.clone()).unwrap_or_default();
            let fields = fields
                .into_iter()
                .map(|f| self.replace(f, memo))
                .collect();
            if let Some(c) = self.content_mut(b) {
                c.fields = fields;
            }
        }
        b
    }

    /// A deep copy of `b`: variables and constants get fresh boxes with the same operand, and
    /// virtuals are copied along with their content.
    pub(crate) fn copy(&mut self, b: BoxIdx, memo: &mut CopyMemo) -> BoxIdx {
        if let Some(nb) = memo.boxes.get(&b) {
            return *nb;
        }
        let (nb, fields) = match &self.arena[b] {
            RedBox::Const { kind, value } => (
                RedBox::Const {
                    kind: kind.clone(),
                    value: *value,
                },
                None,
            ),
            RedBox::Var { kind, gv } => (
                RedBox::Var {
                    kind: kind.clone(),
                    gv: *gv,
                },
                None,
            ),
            RedBox::Virtual { kind, content } => (
                RedBox::Virtual {
                    kind: kind.clone(),
                    content: VirtualStruct {
                        desc: Rc::clone(&content.desc),
                        fields: Vec::new(),
                    },
                },
                Some(content.fields.clone()),
            ),
        };
        let nb = self.arena.push(nb);
        memo.boxes.insert(b, nb);
        if let Some(fields) = fields {
            let fields = fields.into_iter().map(|f| self.copy(f, memo)).collect();
            if let Some(c) = self.content_mut(nb) {
                c.fields = fields;
            }
        }
        nb
    }

    /// Collect into `incoming` every variable box reachable from `b` that is not yet in `memo`.
    pub(crate) fn enter_block(
        &self,
        b: BoxIdx,
        incoming: &mut Vec<BoxIdx>,
        memo: &mut HashSet<BoxIdx>,
    ) {
        match &self.arena[b] {
            RedBox::Const { .. } => (),
            RedBox::Var { .. } => {
                if memo.insert(b) {
                    incoming.push(b);
                }
            }
            RedBox::Virtual { content, .. } => {
                if memo.insert(b) {
                    for f in &content.fields {
                        self.enter_block(*f, incoming, memo);
                    }
                }
            }
        }
    }

    /// Freeze `b` into `memo`, returning the index of its frozen counterpart.
    pub(crate) fn freeze(&self, b: BoxIdx, memo: &mut FreezeMemo) -> usize {
        if let Some(i) = memo.map.get(&b) {
            return *i;
        }
        let i = memo.frozen.len();
        memo.map.insert(b, i);
        match &self.arena[b] {
            RedBox::Const { kind, value } => memo.frozen.push(FrozenBox::Const {
                kind: kind.clone(),
                value: *value,
            }),
            RedBox::Var { kind, .. } => memo.frozen.push(FrozenBox::Var { kind: kind.clone() }),
            RedBox::Virtual { kind, content } => {
                memo.frozen.push(FrozenBox::Virtual {
                    kind: kind.clone(),
                    desc: Rc::clone(&content.desc),
                    fields: Vec::new(),
                });
                let fields = content
                    .fields
                    .iter()
                    .map(|f| self.freeze(*f, memo))
                    .collect::<Vec<_>>();
                if let FrozenBox::Virtual { fields: fz, .. } = &mut memo.frozen[i] {
                    *fz = fields;
                }
            }
        }
        i
    }
}

/// A snapshot of one box.
#[derive(Debug)]
pub(crate) enum FrozenBox {
    Const {
        kind: LLType,
        value: i64,
    },
    Var {
        kind: LLType,
    },
    Virtual {
        kind: LLType,
        desc: Rc<StructTypeDesc>,
        fields: Vec<usize>,
    },
}

#[derive(Default)]
pub(crate) struct FreezeMemo {
    map: HashMap<BoxIdx, usize>,
    pub(crate) frozen: Vec<FrozenBox>,
}

/// The correspondences established while matching a frozen state against a live one.
#[derive(Default)]
pub(crate) struct MatchMemo {
    vars: HashMap<usize, BoxIdx>,
    frozen_containers: HashMap<usize, BoxIdx>,
    live_containers: HashMap<BoxIdx, usize>,
}

/// Can the live box `b` flow into a block that was compiled for the frozen box `fz[i]`? Live
/// boxes that must be passed to that block (or, on a mismatch, generalized) are appended to
/// `outgoing`.
pub(crate) fn exactmatch(
    fz: &[FrozenBox],
    i: usize,
    boxes: &Boxes,
    b: BoxIdx,
    outgoing: &mut Vec<BoxIdx>,
    memo: &mut MatchMemo,
) -> bool {
    match &fz[i] {
        FrozenBox::Const { value, .. } => {
            if boxes.same_constant(b, *value) {
                true
            } else {
                outgoing.push(b);
                false
            }
        }
        FrozenBox::Var { .. } => match memo.vars.get(&i) {
            None => {
                memo.vars.insert(i, b);
                outgoing.push(b);
                true
            }
            Some(prev) if *prev == b => true,
            Some(_) => {
                outgoing.push(b);
                false
            }
        },
        FrozenBox::Virtual { desc, fields, .. } => {
            let Some(content) = boxes.content(b) else {
                outgoing.push(b);
                return false;
            };
            if let Some(prev) = memo.frozen_containers.get(&i) {
                let ok = *prev == b;
                if !ok {
                    outgoing.push(b);
                }
                return ok;
            }
            if memo.live_containers.contains_key(&b) || !Rc::ptr_eq(desc, &content.desc) {
                outgoing.push(b);
                return false;
            }
            memo.frozen_containers.insert(i, b);
            memo.live_containers.insert(b, i);
            let mut fullmatch = true;
            for (fi, lb) in fields.iter().zip(content.fields.iter()) {
                if !exactmatch(fz, *fi, boxes, *lb, outgoing, memo) {
                    fullmatch = false;
                }
            }
            fullmatch
        }
    }
}

/// Rebuild live boxes from `fz[i]`. Each frozen variable becomes one fresh variable box, pushed
/// onto `incoming` for the caller to point at real operands.
pub(crate) fn unfreeze(
    fz: &[FrozenBox],
    i: usize,
    boxes: &mut Boxes,
    incoming: &mut Vec<BoxIdx>,
    memo: &mut HashMap<usize, BoxIdx>,
) -> BoxIdx {
    match &fz[i] {
        FrozenBox::Const { kind, value } => boxes.constant(kind.clone(), *value),
        FrozenBox::Var { kind } => {
            if let Some(b) = memo.get(&i) {
                return *b;
            }
            let b = boxes.push(RedBox::Var {
                kind: kind.clone(),
                gv: GenVar::Const(0),
            });
            memo.insert(i, b);
            incoming.push(b);
            b
        }
        FrozenBox::Virtual { kind, desc, fields } => {
            if let Some(b) = memo.get(&i) {
                return *b;
            }
            let b = boxes.push(RedBox::Virtual {
                kind: kind.clone(),
                content: VirtualStruct {
                    desc: Rc::clone(desc),
                    fields: Vec::new(),
                },
            });
            memo.insert(i, b);
            let fields = fields
                .iter()
                .map(|f| unfreeze(fz, *f, boxes, incoming, memo))
                .collect();
            if let Some(c) = boxes.content_mut(b) {
                c.fields = fields;
            }
            b
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{replay::ReplayBuilder, BlockDesc};

    fn builder() -> ReplayBuilder {
        let block = BlockDesc {
            startaddr: 0,
            arg_positions: vec![],
            stackdepth: 1,
        };
        ReplayBuilder::new(&block, &[]).0
    }

    fn freeze_all(boxes: &Boxes, bs: &[BoxIdx]) -> (Vec<FrozenBox>, Vec<usize>) {
        let mut memo = FreezeMemo::default();
        let idxs = bs.iter().map(|b| boxes.freeze(*b, &mut memo)).collect();
        (memo.frozen, idxs)
    }

    fn matches(fz: &[FrozenBox], idxs: &[usize], boxes: &Boxes, bs: &[BoxIdx]) -> (bool, Vec<BoxIdx>) {
        let mut memo = MatchMemo::default();
        let mut out = Vec::new();
        let mut ok = true;
        for (i, b) in idxs.iter().zip(bs) {
            if !exactmatch(fz, *i, boxes, *b, &mut out, &mut memo) {
                ok = false;
            }
        }
        (ok, out)
    }

    #[test]
    fn constants_match_only_themselves() {
        let mut boxes = Boxes::default();
        let c = boxes.constant(LLType::Signed, 3);
        let (fz, idxs) = freeze_all(&boxes, &[c]);
        let c2 = boxes.constant(LLType::Signed, 3);
        assert_eq!(matches(&fz, &idxs, &boxes, &[c2]), (true, vec![]));
        let c3 = boxes.constant(LLType::Signed, 4);
        assert_eq!(matches(&fz, &idxs, &boxes, &[c3]), (false, vec![c3]));
        let v = boxes.var(LLType::Signed, GenVar::Var(2));
        assert_eq!(matches(&fz, &idxs, &boxes, &[v]), (false, vec![v]));
        assert!(boxes.same_constant(c2, 3));
        assert!(!boxes.same_constant(c3, 3));
        assert!(!boxes.same_constant(v, 3));
    }

    #[test]
    fn variables_match_anything_but_keep_sharing() {
        let mut boxes = Boxes::default();
        let v = boxes.var(LLType::Signed, GenVar::Var(1));
        let (fz, idxs) = freeze_all(&boxes, &[v, v]);
        assert_eq!(idxs, vec![0, 0]);
        let a = boxes.var(LLType::Signed, GenVar::Var(2));
        let c = boxes.constant(LLType::Signed, 9);
        assert_eq!(matches(&fz, &idxs, &boxes, &[a, a]), (true, vec![a]));
        assert_eq!(matches(&fz, &idxs, &boxes, &[c, c]), (true, vec![c]));
        // A frozen shared variable cannot accept two distinct live boxes.
        assert_eq!(matches(&fz, &idxs, &boxes, &[a, c]), (false, vec![a, c]));
    }

    #[test]
    fn forcevar_and_replace() {
        let mut boxes = Boxes::default();
        let mut b = builder();
        let c = boxes.constant(LLType::Signed, 5);
        let mut memo = CopyMemo::default();
        boxes.forcevar(c, &mut b, &mut memo).unwrap();
        let r = boxes.replace(c, &mut memo);
        assert_ne!(r, c);
        assert!(!boxes.is_constant(r));
        assert!(boxes.is_constant(c));
        let other = boxes.constant(LLType::Signed, 5);
        assert_eq!(boxes.replace(other, &mut memo), other);
    }

    #[test]
    fn copy_preserves_sharing() {
        let mut boxes = Boxes::default();
        let v = boxes.var(LLType::Signed, GenVar::Var(3));
        let mut memo = CopyMemo::default();
        let v1 = boxes.copy(v, &mut memo);
        let v2 = boxes.copy(v, &mut memo);
        assert_eq!(v1, v2);
        assert_ne!(v1, v);
        let mut b = builder();
        assert_eq!(boxes.getgenvar(v1, &mut b).unwrap(), GenVar::Var(3));
    }

    #[test]
    fn enter_block_collects_each_variable_once() {
        let mut boxes = Boxes::default();
        let v = boxes.var(LLType::Signed, GenVar::Var(1));
        let w = boxes.var(LLType::Signed, GenVar::Var(2));
        let c = boxes.constant(LLType::Signed, 0);
        let mut incoming = Vec::new();
        let mut memo = HashSet::new();
        for b in [v, c, w, v] {
            boxes.enter_block(b, &mut incoming, &mut memo);
        }
        assert_eq!(incoming, vec![v, w]);
    }

    #[test]
    fn unfreeze_makes_fresh_variables() {
        let mut boxes = Boxes::default();
        let v = boxes.var(LLType::Signed, GenVar::Var(1));
        let c = boxes.constant(LLType::Bool, 1);
        let (fz, idxs) = freeze_all(&boxes, &[v, c, v]);
        let mut incoming = Vec::new();
        let mut memo = HashMap::new();
        let live = idxs
            .iter()
            .map(|i| unfreeze(&fz, *i, &mut boxes, &mut incoming, &mut memo))
            .collect::<Vec<_>>();
        assert_eq!(incoming.len(), 1);
        assert_eq!(live[0], live[2]);
        assert_eq!(boxes.constvalue(live[1]), Some(1));
        assert!(matches(&fz, &idxs, &boxes, &live).0);
    }
}
