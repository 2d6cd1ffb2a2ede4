//! The timeshifter: turns annotated graphs into graphs that, when interpreted, generate the
//! specialized code.
//!
//! [hrtyper] resolves every operation of a hint-annotated graph into a [TsOp] according to the
//! colours of its arguments and result; [transform] then threads the dispatch machinery through
//! the graph (splits at red branches, merge points, resume points, a dispatcher and the calls
//! into and out of other timeshifted graphs); [interp] runs the result against an [Engine],
//! folding the green operations and emitting the red ones; [portal] ties it together behind
//! [Timeshifter].
//!
//! [Engine]: rtimeshift::Engine
//! [Timeshifter]: portal::Timeshifter

use crate::{
    flowgraph::{Callee, ExternalFn, Graph, GraphIdx, OpKind, VarIdx},
    lltype::{ExcField, LLOp, LLType},
    log::{log_ir, should_log_ir, IRPhase},
};
use rcontainer::StructTypeDesc;
use std::{fmt, rc::Rc};
use vob::Vob;

pub(crate) mod hrtyper;
pub(crate) mod interp;
pub mod portal;
pub(crate) mod promotion;
pub(crate) mod rcontainer;
pub(crate) mod rtimeshift;
pub(crate) mod rvalue;
pub(crate) mod transform;

index_vec::define_index_type! {
    pub(crate) struct TsGraphIdx = u32;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PtrTest {
    Nonzero,
    Iszero,
    Eq,
    Ne,
}

impl PtrTest {
    pub(crate) fn eval(self, args: &[i64]) -> bool {
        match self {
            PtrTest::Nonzero => args[0] != 0,
            PtrTest::Iszero => args[0] == 0,
            PtrTest::Eq => args[0] == args[1],
            PtrTest::Ne => args[0] != args[1],
        }
    }
}

/// How a graph gives its result back: `Red` as a box, `Yellow` as a green value, `Gray` not at
/// all.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Colour {
    Red,
    Gray,
    Yellow,
}

/// A call the specializer cannot look into, emitted as a native call.
#[derive(Clone, Debug)]
pub(crate) enum Residual {
    External(Rc<ExternalFn>),
    Graph(GraphIdx),
    /// Through a function pointer (the first argument) to one of a family of graphs.
    Indirect(Rc<Vec<GraphIdx>>),
}

/// The operations of timeshifted graphs.
///
/// Green operations compute plain values at specialization time. Red operations work on boxes
/// through the value model, folding when they can and generating code otherwise. The remaining
/// operations drive the [rtimeshift::Engine].
#[derive(Clone, Debug)]
pub(crate) enum TsOp {
    /// An input operation still to be rewritten by the transformation (calls and hints).
    Orig(OpKind),

    Green(LLOp),
    GreenSameAs,
    GreenGetfield {
        offset: i64,
    },
    GreenGetarrayitem,
    GreenGetarraysize,
    GreenPtr(PtrTest),
    GreenCall(Callee),
    /// The first argument is the function pointer.
    GreenIndirectCall(Rc<Vec<GraphIdx>>),

    Red(LLOp),
    RedSameAs,
    RedGetfield {
        desc: Rc<StructTypeDesc>,
        index: usize,
        deepfrozen: bool,
    },
    RedSetfield {
        desc: Rc<StructTypeDesc>,
        index: usize,
    },
    RedGetarrayitem {
        kind: LLType,
        fold: bool,
    },
    RedSetarrayitem,
    RedGetarraysize,
    RedMalloc {
        desc: Rc<StructTypeDesc>,
        is_virtual: bool,
    },
    RedMallocVarsize(LLType),
    RedPtr(PtrTest),
    /// Read a word of the state's pending exception.
    GetExcBox(ExcField),
    /// Replace a word of the state's pending exception.
    SetExcBox(ExcField),
    ResidualCall(Residual),

    /// Run the timeshifted `target` on the arguments. The result says whether the state
    /// finished inside the call.
    Call {
        colour: Colour,
        target: TsGraphIdx,
    },
    /// Like [TsOp::Call], choosing the target by the first (green) argument, a function
    /// pointer into `family`; `targets` are the timeshifted graphs of `family`, in order.
    IndirectCall {
        colour: Colour,
        family: Rc<Vec<GraphIdx>>,
        targets: Rc<Vec<TsGraphIdx>>,
    },
    /// A red call to the portal: a call to the specialization for the green arguments,
    /// compiled on first use.
    PortalCall,

    EnsureQueue {
        replayable: bool,
    },
    EnterFrame,
    LeaveGraph(Colour),
    SaveLocals,
    SaveGreens,
    RestoreLocal(usize),
    RestoreGreen(usize),
    SaveReturn,
    IsConstant,
    Revealconst,
    Split {
        resumepoint: i64,
    },
    CollectSplit {
        resumepoint: i64,
    },
    /// Merge the state at merge point `mp` keyed by the (green) arguments. A global merge point
    /// records where compilation resumes after it.
    MergePoint {
        mp: usize,
        resume_after: Option<i64>,
    },
    GuardGlobalMerge {
        resumepoint: i64,
    },
    DispatchNext,
    GetResumepoint,
    Promote,
    ReverseSplitQueue,
}

impl fmt::Display for TsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsOp::Orig(k) => write!(f, "orig {}", k.opname()),
            TsOp::Green(op) => write!(f, "{}", op.opname()),
            TsOp::GreenSameAs => write!(f, "same_as"),
            TsOp::GreenGetfield { offset } => write!(f, "getfield[{offset}]"),
            TsOp::GreenGetarrayitem => write!(f, "getarrayitem"),
            TsOp::GreenGetarraysize => write!(f, "getarraysize"),
            TsOp::GreenPtr(t) => write!(f, "{}", ptr_opname(*t)),
            TsOp::GreenCall(Callee::Graph(g)) => write!(f, "green_call[g{}]", g.index()),
            TsOp::GreenCall(Callee::External(e)) => write!(f, "green_call[{}]", e.name),
            TsOp::GreenIndirectCall(_) => write!(f, "green_indirect_call"),
            TsOp::Red(op) => write!(f, "red_{}", op.opname()),
            TsOp::RedSameAs => write!(f, "red_same_as"),
            TsOp::RedGetfield { desc, index, .. } => {
                write!(f, "red_getfield[{}.{}]", desc.name, desc.fields[*index].name)
            }
            TsOp::RedSetfield { desc, index } => {
                write!(f, "red_setfield[{}.{}]", desc.name, desc.fields[*index].name)
            }
            TsOp::RedGetarrayitem { .. } => write!(f, "red_getarrayitem"),
            TsOp::RedSetarrayitem => write!(f, "red_setarrayitem"),
            TsOp::RedGetarraysize => write!(f, "red_getarraysize"),
            TsOp::RedMalloc { desc, is_virtual } => {
                if *is_virtual {
                    write!(f, "red_malloc_virtual[{}]", desc.name)
                } else {
                    write!(f, "red_malloc[{}]", desc.name)
                }
            }
            TsOp::RedMallocVarsize(_) => write!(f, "red_malloc_varsize"),
            TsOp::RedPtr(t) => write!(f, "red_{}", ptr_opname(*t)),
            TsOp::GetExcBox(ExcField::Type) => write!(f, "getexc[type]"),
            TsOp::GetExcBox(ExcField::Value) => write!(f, "getexc[value]"),
            TsOp::SetExcBox(ExcField::Type) => write!(f, "setexc[type]"),
            TsOp::SetExcBox(ExcField::Value) => write!(f, "setexc[value]"),
            TsOp::ResidualCall(Residual::External(e)) => write!(f, "residual_call[{}]", e.name),
            TsOp::ResidualCall(Residual::Graph(g)) => write!(f, "residual_call[g{}]", g.index()),
            TsOp::ResidualCall(Residual::Indirect(_)) => write!(f, "residual_indirect_call"),
            TsOp::Call { colour, target } => {
                write!(f, "{}_call[ts{}]", colour_name(*colour), target.index())
            }
            TsOp::IndirectCall { colour, .. } => {
                write!(f, "indirect_{}_call", colour_name(*colour))
            }
            TsOp::PortalCall => write!(f, "portal_call"),
            TsOp::EnsureQueue { replayable } => {
                if *replayable {
                    write!(f, "ensure_queue[replayable]")
                } else {
                    write!(f, "ensure_queue")
                }
            }
            TsOp::EnterFrame => write!(f, "enter_frame"),
            TsOp::LeaveGraph(c) => write!(f, "leave_graph_{}", colour_name(*c)),
            TsOp::SaveLocals => write!(f, "save_locals"),
            TsOp::SaveGreens => write!(f, "save_greens"),
            TsOp::RestoreLocal(i) => write!(f, "restore_local[{i}]"),
            TsOp::RestoreGreen(i) => write!(f, "restore_green[{i}]"),
            TsOp::SaveReturn => write!(f, "save_return"),
            TsOp::IsConstant => write!(f, "is_constant"),
            TsOp::Revealconst => write!(f, "revealconst"),
            TsOp::Split { resumepoint } => write!(f, "split[{resumepoint}]"),
            TsOp::CollectSplit { resumepoint } => write!(f, "collect_split[{resumepoint}]"),
            TsOp::MergePoint {
                mp,
                resume_after: None,
            } => write!(f, "merge_point[{mp}]"),
            TsOp::MergePoint {
                mp,
                resume_after: Some(rp),
            } => write!(f, "global_merge_point[{mp}, {rp}]"),
            TsOp::GuardGlobalMerge { resumepoint } => {
                write!(f, "guard_global_merge[{resumepoint}]")
            }
            TsOp::DispatchNext => write!(f, "dispatch_next"),
            TsOp::GetResumepoint => write!(f, "getresumepoint"),
            TsOp::Promote => write!(f, "promote"),
            TsOp::ReverseSplitQueue => write!(f, "reverse_split_queue"),
        }
    }
}

fn ptr_opname(t: PtrTest) -> &'static str {
    match t {
        PtrTest::Nonzero => "ptr_nonzero",
        PtrTest::Iszero => "ptr_iszero",
        PtrTest::Eq => "ptr_eq",
        PtrTest::Ne => "ptr_ne",
    }
}

fn colour_name(c: Colour) -> &'static str {
    match c {
        Colour::Red => "red",
        Colour::Gray => "gray",
        Colour::Yellow => "yellow",
    }
}

/// A timeshifted graph.
#[derive(Debug)]
pub(crate) struct TsGraph {
    pub(crate) graph: Graph<TsOp>,
    /// Which variables hold green values; all others hold boxes.
    pub(crate) green: Vob,
    pub(crate) colour: Colour,
    /// The program graph this is a specialized copy of.
    pub(crate) origgraph: GraphIdx,
}

impl TsGraph {
    pub(crate) fn is_green(&self, v: VarIdx) -> bool {
        self.green.get(v.index()).unwrap_or(false)
    }

    /// Render the graph followed by the colour (`g` or `r`) of each variable in index order.
    pub(crate) fn render(&self) -> String {
        let mut out = self.graph.render(|op| op.to_string());
        out.push_str("  colours:");
        for v in self.graph.vars.indices() {
            out.push_str(if self.is_green(v) { " g" } else { " r" });
        }
        out.push('\n');
        out
    }

    pub(crate) fn log(&self) {
        if should_log_ir(IRPhase::TsGraph) {
            log_ir(&format!(
                "--- Begin ts-graph {} ---\n{}--- End ts-graph ---\n",
                self.graph.name,
                self.render()
            ));
        }
    }
}
