//! Typed flow graphs.
//!
//! A [Graph] is a set of basic blocks. Each block has input arguments, a sequence of operations,
//! and either zero exits (the return block), one unconditional exit, or several exits selected
//! by an `exitswitch` value. Links pass values to the target block's input arguments. Every
//! operation has a result variable (of type `Void` if the operation produces nothing).
//!
//! Graphs are generic over the kind of operation they contain: input programs use [OpKind], while
//! timeshifted graphs use [crate::timeshifter::TsOp].

use crate::{
    error::CompilationError,
    lltype::{ExcField, LLOp, LLType},
};
use index_vec::IndexVec;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    rc::Rc,
};

pub mod builder;
pub mod llinterp;

index_vec::define_index_type! {
    pub struct VarIdx = u32;
}

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
}

index_vec::define_index_type! {
    pub struct GraphIdx = u32;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constant {
    pub ty: LLType,
    pub value: i64,
}

impl Constant {
    pub fn new(ty: LLType, value: i64) -> Self {
        Self { ty, value }
    }

    pub fn signed(value: i64) -> Self {
        Self::new(LLType::Signed, value)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(LLType::Bool, i64::from(value))
    }

    pub fn void() -> Self {
        Self::new(LLType::Void, 0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Var(VarIdx),
    Const(Constant),
}

impl Arg {
    pub fn as_var(&self) -> Option<VarIdx> {
        match self {
            Arg::Var(v) => Some(*v),
            Arg::Const(_) => None,
        }
    }
}

impl From<VarIdx> for Arg {
    fn from(v: VarIdx) -> Self {
        Arg::Var(v)
    }
}

impl From<Constant> for Arg {
    fn from(c: Constant) -> Self {
        Arg::Const(c)
    }
}

/// A function implemented outside of the program's graphs.
#[derive(Debug)]
pub struct ExternalFn {
    pub name: String,
    /// The address of an `extern "C"` function taking `nargs` words and returning a word.
    pub addr: i64,
    pub nargs: usize,
    /// Has no side effects and depends only on its arguments, so may be folded.
    pub pure: bool,
}

#[derive(Clone, Debug)]
pub enum Callee {
    Graph(GraphIdx),
    External(Rc<ExternalFn>),
}

/// The operations of input programs.
#[derive(Clone, Debug)]
pub enum OpKind {
    Op(LLOp),
    SameAs,
    /// `getfield(ptr)`.
    Getfield(String),
    /// `setfield(ptr, value)`.
    Setfield(String),
    /// `getarrayitem(ptr, index)`.
    Getarrayitem,
    /// `setarrayitem(ptr, index, value)`.
    Setarrayitem,
    /// `getarraysize(ptr)`.
    Getarraysize,
    /// `malloc()` of the struct type pointed to by the given pointer type.
    Malloc(LLType),
    /// `malloc_varsize(length)` of the array type pointed to by the given pointer type.
    MallocVarsize(LLType),
    PtrNonzero,
    PtrIszero,
    PtrEq,
    PtrNe,
    /// A direct call; the arguments are the callee's arguments.
    DirectCall(Callee),
    /// A call through a function pointer (the first argument, a graph index) to one of the
    /// graphs in the family.
    IndirectCall(Rc<Vec<GraphIdx>>),
    /// `hint(value)` with a set of flags.
    Hint(Rc<BTreeMap<String, bool>>),
    /// Read a word of the pending exception.
    GetExc(ExcField),
    /// `setexc(value)`: write a word of the pending exception. A graph raises by setting both
    /// words and returning; its callers check the type after the call.
    SetExc(ExcField),
}

impl OpKind {
    pub fn opname(&self) -> &'static str {
        match self {
            OpKind::Op(op) => op.opname(),
            OpKind::SameAs => "same_as",
            OpKind::Getfield(_) => "getfield",
            OpKind::Setfield(_) => "setfield",
            OpKind::Getarrayitem => "getarrayitem",
            OpKind::Setarrayitem => "setarrayitem",
            OpKind::Getarraysize => "getarraysize",
            OpKind::Malloc(_) => "malloc",
            OpKind::MallocVarsize(_) => "malloc_varsize",
            OpKind::PtrNonzero => "ptr_nonzero",
            OpKind::PtrIszero => "ptr_iszero",
            OpKind::PtrEq => "ptr_eq",
            OpKind::PtrNe => "ptr_ne",
            OpKind::DirectCall(_) => "direct_call",
            OpKind::IndirectCall(_) => "indirect_call",
            OpKind::Hint(_) => "hint",
            OpKind::GetExc(_) => "getexc",
            OpKind::SetExc(_) => "setexc",
        }
    }

    /// Build a hint op kind from `(flag, value)` pairs.
    pub fn hint(flags: &[(&str, bool)]) -> Self {
        OpKind::Hint(Rc::new(
            flags.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect(),
        ))
    }
}

#[derive(Clone, Debug)]
pub struct SpaceOp<K> {
    pub kind: K,
    pub args: Vec<Arg>,
    pub result: VarIdx,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitCase {
    Bool(bool),
    Int(i64),
    Default,
}

#[derive(Clone, Debug)]
pub struct Link {
    pub args: Vec<Arg>,
    pub target: BlockIdx,
    /// `None` for the single exit of a block without an exitswitch.
    pub exitcase: Option<ExitCase>,
}

impl Link {
    pub fn new(args: Vec<Arg>, target: BlockIdx) -> Self {
        Self {
            args,
            target,
            exitcase: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Block<K> {
    pub inputargs: Vec<VarIdx>,
    pub operations: Vec<SpaceOp<K>>,
    pub exitswitch: Option<Arg>,
    pub exits: Vec<Link>,
}

impl<K> Block<K> {
    pub fn new(inputargs: Vec<VarIdx>) -> Self {
        Self {
            inputargs,
            operations: Vec::new(),
            exitswitch: None,
            exits: Vec::new(),
        }
    }

    /// Replace the exits of this block.
    pub fn recloseblock(&mut self, exits: Vec<Link>) {
        self.exits = exits;
    }

    /// The variables this block reads, in order of first use.
    fn used_vars(&self) -> Vec<VarIdx>
    where
        K: Clone,
    {
        let mut seen = HashSet::new();
        let mut used = Vec::new();
        let mut note = |a: &Arg| {
            if let Arg::Var(v) = a {
                if seen.insert(*v) {
                    used.push(*v);
                }
            }
        };
        for op in &self.operations {
            op.args.iter().for_each(&mut note);
        }
        if let Some(s) = &self.exitswitch {
            note(s);
        }
        for l in &self.exits {
            l.args.iter().for_each(&mut note);
        }
        used
    }

    /// The variables this block defines: its input arguments and operation results.
    fn defined_vars(&self) -> HashSet<VarIdx> {
        self.inputargs
            .iter()
            .copied()
            .chain(self.operations.iter().map(|op| op.result))
            .collect()
    }

    /// Replace every read of a variable in `map` (but not the definitions).
    pub fn renamevariables(&mut self, map: &HashMap<VarIdx, Arg>) {
        let ren = |a: &mut Arg| {
            if let Arg::Var(v) = a {
                if let Some(na) = map.get(v) {
                    *a = na.clone();
                }
            }
        };
        for op in self.operations.iter_mut() {
            op.args.iter_mut().for_each(ren);
        }
        if let Some(s) = self.exitswitch.as_mut() {
            ren(s);
        }
        for l in self.exits.iter_mut() {
            l.args.iter_mut().for_each(ren);
        }
    }
}

#[derive(Clone, Debug)]
pub struct VarInfo {
    pub ty: LLType,
}

#[derive(Clone, Debug)]
pub struct Graph<K> {
    pub name: String,
    pub vars: IndexVec<VarIdx, VarInfo>,
    pub blocks: IndexVec<BlockIdx, Block<K>>,
    pub startblock: BlockIdx,
    /// The block with one input argument (the return value) and no exits.
    pub returnblock: BlockIdx,
}

impl<K: Clone> Graph<K> {
    pub fn getargs(&self) -> &[VarIdx] {
        &self.blocks[self.startblock].inputargs
    }

    pub fn getreturnvar(&self) -> VarIdx {
        self.blocks[self.returnblock].inputargs[0]
    }

    pub fn var_type(&self, v: VarIdx) -> &LLType {
        &self.vars[v].ty
    }

    pub fn arg_type(&self, a: &Arg) -> LLType {
        match a {
            Arg::Var(v) => self.vars[*v].ty.clone(),
            Arg::Const(c) => c.ty.clone(),
        }
    }

    pub fn new_var(&mut self, ty: LLType) -> VarIdx {
        self.vars.push(VarInfo { ty })
    }

    /// Create a new variable with the same type as `v`.
    pub fn copyvar(&mut self, v: VarIdx) -> VarIdx {
        let info = self.vars[v].clone();
        self.vars.push(info)
    }

    pub fn new_block(&mut self, inputargs: Vec<VarIdx>) -> BlockIdx {
        self.blocks.push(Block::new(inputargs))
    }

    /// The blocks reachable from the start block, in depth-first order.
    pub fn iterblocks(&self) -> Vec<BlockIdx> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![self.startblock];
        while let Some(b) = stack.pop() {
            if !seen.insert(b) {
                continue;
            }
            order.push(b);
            for l in self.blocks[b].exits.iter().rev() {
                if !seen.contains(&l.target) {
                    stack.push(l.target);
                }
            }
        }
        order
    }

    /// Map each reachable block to the links entering it, as `(source block, exit index)`. The
    /// start block has an extra `None` entry standing for the graph's caller.
    pub fn mkentrymap(&self) -> HashMap<BlockIdx, Vec<Option<(BlockIdx, usize)>>> {
        let mut map: HashMap<_, Vec<_>> = HashMap::new();
        map.insert(self.startblock, vec![None]);
        for b in self.iterblocks() {
            for (i, l) in self.blocks[b].exits.iter().enumerate() {
                map.entry(l.target).or_default().push(Some((b, i)));
            }
        }
        map
    }

    /// Split `block` before operation `index`, moving the remaining operations and the exits into
    /// a new block. Variables the new block reads but does not define are renamed to fresh input
    /// arguments, passed along the new link. Returns the new block.
    pub fn split_block(&mut self, block: BlockIdx, index: usize) -> BlockIdx {
        let newblock = self.naive_split_block(block, index);
        let tail = &self.blocks[newblock];
        let defined = tail.defined_vars();
        let missing = tail
            .used_vars()
            .into_iter()
            .filter(|v| !defined.contains(v))
            .collect::<Vec<_>>();
        let mut rename = HashMap::new();
        let mut linkargs = Vec::with_capacity(missing.len());
        for v in missing {
            let nv = self.copyvar(v);
            rename.insert(v, Arg::Var(nv));
            linkargs.push(Arg::Var(v));
            self.blocks[newblock].inputargs.push(nv);
        }
        self.blocks[newblock].renamevariables(&rename);
        self.blocks[block].exits[0].args = linkargs;
        newblock
    }

    /// Split `block` before operation `index` without renaming anything: the new block has no
    /// input arguments and reads the variables of `block` directly, until [Graph::to_ssi] runs.
    pub fn naive_split_block(&mut self, block: BlockIdx, index: usize) -> BlockIdx {
        let mut tail = Block::new(Vec::new());
        tail.operations = self.blocks[block].operations.split_off(index);
        tail.exitswitch = self.blocks[block].exitswitch.take();
        tail.exits = std::mem::take(&mut self.blocks[block].exits);
        let newblock = self.blocks.push(tail);
        self.blocks[block].exits = vec![Link::new(Vec::new(), newblock)];
        newblock
    }

    /// Make every block read only its own input arguments and operation results. A block reading
    /// a variable defined elsewhere gets a fresh input argument for it, and every link entering
    /// the block passes the variable along; this repeats until each predecessor defines what it
    /// passes. `Void` variables carry nothing, so reads of undefined ones become constants.
    /// Returns the `(original, renamed)` pair of each new input argument.
    pub fn to_ssi(&mut self) -> Result<Vec<(VarIdx, VarIdx)>, CompilationError> {
        let entrymap = self.mkentrymap();
        let mut renamed: HashMap<(BlockIdx, VarIdx), VarIdx> = HashMap::new();
        let mut pairs = Vec::new();
        let mut todo = self.iterblocks();
        while let Some(b) = todo.pop() {
            let defined = self.blocks[b].defined_vars();
            let missing = self.blocks[b]
                .used_vars()
                .into_iter()
                .filter(|v| !defined.contains(v))
                .collect::<Vec<_>>();
            if missing.is_empty() {
                continue;
            }
            let mut rename = HashMap::new();
            let mut threaded = Vec::new();
            for v in missing {
                if self.vars[v].ty.is_void() {
                    rename.insert(v, Arg::Const(Constant::void()));
                    continue;
                }
                let nv = self.copyvar(v);
                renamed.insert((b, v), nv);
                rename.insert(v, Arg::Var(nv));
                self.blocks[b].inputargs.push(nv);
                pairs.push((v, nv));
                threaded.push(v);
            }
            self.blocks[b].renamevariables(&rename);
            let preds = entrymap.get(&b).map(|x| &x[..]).unwrap_or(&[]);
            for v in threaded {
                for p in preds {
                    let Some((pb, i)) = p else {
                        return Err(CompilationError::General(format!(
                            "{}: variable v{} is read before it is defined",
                            self.name,
                            v.index()
                        )));
                    };
                    let arg = renamed.get(&(*pb, v)).copied().unwrap_or(v);
                    self.blocks[*pb].exits[*i].args.push(Arg::Var(arg));
                    if arg == v && !self.blocks[*pb].defined_vars().contains(&v) {
                        todo.push(*pb);
                    }
                }
            }
        }
        Ok(pairs)
    }

    /// Convert every operation of this graph with `f`.
    pub fn map_ops<L, F>(&self, mut f: F) -> Graph<L>
    where
        F: FnMut(&K) -> L,
    {
        Graph {
            name: self.name.clone(),
            vars: self.vars.clone(),
            blocks: self
                .blocks
                .iter()
                .map(|b| Block {
                    inputargs: b.inputargs.clone(),
                    operations: b
                        .operations
                        .iter()
                        .map(|op| SpaceOp {
                            kind: f(&op.kind),
                            args: op.args.clone(),
                            result: op.result,
                        })
                        .collect(),
                    exitswitch: b.exitswitch.clone(),
                    exits: b.exits.clone(),
                })
                .collect(),
            startblock: self.startblock,
            returnblock: self.returnblock,
        }
    }

    /// Check the structural invariants the rest of tsrt relies on.
    pub fn check(&self) -> Result<(), CompilationError> {
        let err = |msg: String| Err(CompilationError::General(format!("{}: {msg}", self.name)));
        let rb = &self.blocks[self.returnblock];
        if rb.inputargs.len() != 1 || !rb.exits.is_empty() || !rb.operations.is_empty() {
            return err("return block must have one input and no operations or exits".into());
        }
        let mut defined = HashSet::new();
        for bidx in self.iterblocks() {
            let b = &self.blocks[bidx];
            for v in &b.inputargs {
                if !defined.insert(*v) {
                    return err(format!("variable {v:?} defined twice"));
                }
            }
            for op in &b.operations {
                if !defined.insert(op.result) {
                    return err(format!("variable {:?} defined twice", op.result));
                }
            }
            if bidx != self.returnblock && b.exits.is_empty() {
                return err(format!("block {bidx:?} has no exits"));
            }
            match &b.exitswitch {
                None if b.exits.len() > 1 => {
                    return err(format!("block {bidx:?} has several exits but no exitswitch"))
                }
                Some(_) if b.exits.iter().any(|l| l.exitcase.is_none()) => {
                    return err(format!("block {bidx:?} has an exit without an exitcase"))
                }
                _ => (),
            }
            for l in &b.exits {
                if l.args.len() != self.blocks[l.target].inputargs.len() {
                    return err(format!(
                        "link from {bidx:?} to {:?} passes the wrong number of arguments",
                        l.target
                    ));
                }
            }
        }
        Ok(())
    }
}

impl<K: fmt::Debug> Graph<K> {
    /// Render this graph as text, one block per paragraph, with `fmt_op` rendering operation
    /// kinds.
    pub fn render<F>(&self, fmt_op: F) -> String
    where
        F: Fn(&K) -> String,
    {
        let fmt_arg = |a: &Arg| match a {
            Arg::Var(v) => format!("v{}", v.index()),
            Arg::Const(c) => format!("{}", c.value),
        };
        let fmt_args = |args: &[Arg]| args.iter().map(fmt_arg).collect::<Vec<_>>().join(", ");
        let mut out = format!("graph {}:\n", self.name);
        for (bidx, b) in self.blocks.iter_enumerated() {
            let ins = b
                .inputargs
                .iter()
                .map(|v| format!("v{}", v.index()))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("  b{}({ins}):\n", bidx.index()));
            for op in &b.operations {
                out.push_str(&format!(
                    "    v{} = {}({})\n",
                    op.result.index(),
                    fmt_op(&op.kind),
                    fmt_args(&op.args)
                ));
            }
            if let Some(s) = &b.exitswitch {
                out.push_str(&format!("    switch {}\n", fmt_arg(s)));
            }
            for l in &b.exits {
                let case = match &l.exitcase {
                    None => String::new(),
                    Some(ExitCase::Bool(x)) => format!("{x}: "),
                    Some(ExitCase::Int(x)) => format!("{x}: "),
                    Some(ExitCase::Default) => "default: ".to_owned(),
                };
                out.push_str(&format!(
                    "    {case}goto b{}({})\n",
                    l.target.index(),
                    fmt_args(&l.args)
                ));
            }
        }
        out
    }
}

/// A set of graphs that may call one another.
#[derive(Default)]
pub struct Program {
    names: IndexVec<GraphIdx, String>,
    graphs: IndexVec<GraphIdx, Option<Rc<Graph<OpKind>>>>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a [GraphIdx] for a graph that will be defined later, so that graphs can call each
    /// other (or themselves) recursively.
    pub fn declare(&mut self, name: &str) -> GraphIdx {
        self.names.push(name.to_owned());
        self.graphs.push(None)
    }

    pub fn define(&mut self, idx: GraphIdx, graph: Graph<OpKind>) -> Result<(), CompilationError> {
        if self.graphs[idx].is_some() {
            return Err(CompilationError::General(format!(
                "graph {} defined twice",
                self.names[idx]
            )));
        }
        graph.check()?;
        self.graphs[idx] = Some(Rc::new(graph));
        Ok(())
    }

    pub fn add(&mut self, graph: Graph<OpKind>) -> Result<GraphIdx, CompilationError> {
        let idx = self.declare(&graph.name.clone());
        self.define(idx, graph)?;
        Ok(idx)
    }

    pub fn graph(&self, idx: GraphIdx) -> Result<&Rc<Graph<OpKind>>, CompilationError> {
        match self.graphs.get(idx) {
            Some(Some(g)) => Ok(g),
            Some(None) => Err(CompilationError::General(format!(
                "graph {} declared but never defined",
                self.names[idx]
            ))),
            None => Err(CompilationError::General(format!(
                "no graph with index {}",
                idx.index()
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}
