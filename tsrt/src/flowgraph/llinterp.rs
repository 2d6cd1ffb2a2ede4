//! A concrete interpreter for input graphs. Used to evaluate green calls at specialization time,
//! and as the reference semantics that specialized code is tested against.

use super::{Arg, Callee, ExitCase, Graph, GraphIdx, OpKind, Program, VarIdx};
use crate::{
    error::CompilationError,
    lltype::{self, LLType, WORD},
};
use index_vec::IndexVec;

/// Recursion deeper than this is reported as an error rather than overflowing the native stack.
const MAX_DEPTH: usize = 10000;

pub struct LLInterpreter<'a> {
    program: &'a Program,
    depth: usize,
}

impl<'a> LLInterpreter<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self { program, depth: 0 }
    }

    /// Run graph `gidx` on `args`, returning its result (0 for `Void` results).
    pub fn eval_graph(&mut self, gidx: GraphIdx, args: &[i64]) -> Result<i64, CompilationError> {
        let graph = self.program.graph(gidx)?.clone();
        if args.len() != graph.getargs().len() {
            return Err(CompilationError::General(format!(
                "{} takes {} arguments, got {}",
                graph.name,
                graph.getargs().len(),
                args.len()
            )));
        }
        if self.depth >= MAX_DEPTH {
            return Err(CompilationError::LimitExceeded(format!(
                "recursion deeper than {MAX_DEPTH} calls"
            )));
        }
        self.depth += 1;
        let r = self.run(&graph, args);
        self.depth -= 1;
        r
    }

    fn run(&mut self, graph: &Graph<OpKind>, args: &[i64]) -> Result<i64, CompilationError> {
        let mut env: IndexVec<VarIdx, i64> = IndexVec::from_vec(vec![0; graph.vars.len()]);
        let mut block = graph.startblock;
        let mut incoming = args.to_vec();
        loop {
            let b = &graph.blocks[block];
            for (v, x) in b.inputargs.iter().zip(incoming.iter()) {
                env[*v] = *x;
            }
            if block == graph.returnblock {
                return Ok(env[b.inputargs[0]]);
            }
            for op in &b.operations {
                let vals = op
                    .args
                    .iter()
                    .map(|a| value(&env, a))
                    .collect::<Vec<_>>();
                env[op.result] = self.eval_op(graph, &op.kind, &op.args, &vals)?;
            }
            let link = match &b.exitswitch {
                None => &b.exits[0],
                Some(s) => {
                    let x = value(&env, s);
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
                            CompilationError::General(format!(
                                "{}: no exit for switch value {x}",
                                graph.name
                            ))
                        })?
                }
            };
            incoming = link.args.iter().map(|a| value(&env, a)).collect();
            block = link.target;
        }
    }

    fn eval_op(
        &mut self,
        graph: &Graph<OpKind>,
        kind: &OpKind,
        args: &[Arg],
        vals: &[i64],
    ) -> Result<i64, CompilationError> {
        match kind {
            OpKind::Op(op) => op.fold(vals),
            OpKind::SameAs => Ok(vals[0]),
            OpKind::Hint(_) => Ok(vals.first().copied().unwrap_or(0)),
            OpKind::Getfield(name) => {
                let (i, _) = field_index(graph, &args[0], name)?;
                lltype::read_word(vals[0], WORD * i)
            }
            OpKind::Setfield(name) => {
                let (i, _) = field_index(graph, &args[0], name)?;
                lltype::write_word(vals[0], WORD * i, vals[1])?;
                Ok(0)
            }
            OpKind::Getarrayitem => lltype::read_item(vals[0], vals[1]),
            OpKind::Setarrayitem => {
                lltype::write_item(vals[0], vals[1], vals[2])?;
                Ok(0)
            }
            OpKind::Getarraysize => lltype::read_word(vals[0], 0),
            OpKind::Malloc(ty) => {
                let st = ty.struct_type().ok_or_else(|| {
                    CompilationError::General(format!("malloc of non-struct type {ty}"))
                })?;
                Ok(lltype::tsrt_malloc(st.size()))
            }
            OpKind::MallocVarsize(_) => lltype::alloc_array(vals[0]),
            OpKind::PtrNonzero => Ok(i64::from(vals[0] != 0)),
            OpKind::PtrIszero => Ok(i64::from(vals[0] == 0)),
            OpKind::PtrEq => Ok(i64::from(vals[0] == vals[1])),
            OpKind::PtrNe => Ok(i64::from(vals[0] != vals[1])),
            OpKind::DirectCall(Callee::Graph(g)) => self.eval_graph(*g, vals),
            OpKind::DirectCall(Callee::External(f)) => {
                if f.nargs != vals.len() {
                    return Err(CompilationError::General(format!(
                        "{} takes {} arguments, got {}",
                        f.name,
                        f.nargs,
                        vals.len()
                    )));
                }
                unsafe { lltype::call_native(f.addr, vals) }
            }
            OpKind::IndirectCall(family) => {
                let target = graph_of_fnptr(vals[0], family)?;
                self.eval_graph(target, &vals[1..])
            }
            OpKind::GetExc(f) => Ok(lltype::exc_field(*f)),
            OpKind::SetExc(f) => {
                lltype::set_exc_field(*f, vals[0]);
                Ok(0)
            }
        }
    }
}

fn value(env: &IndexVec<VarIdx, i64>, a: &Arg) -> i64 {
    match a {
        Arg::Var(v) => env[*v],
        Arg::Const(c) => c.value,
    }
}

fn field_index(
    graph: &Graph<OpKind>,
    ptr: &Arg,
    name: &str,
) -> Result<(i64, LLType), CompilationError> {
    let ty = graph.arg_type(ptr);
    let st = ty
        .struct_type()
        .ok_or_else(|| CompilationError::General(format!("field access on {ty}")))?;
    let (i, fty) = st.field(name)?;
    let i = i64::try_from(i).map_err(|e| CompilationError::InternalError(e.to_string()))?;
    Ok((i, fty.clone()))
}

/// Map a function pointer value (a graph index) to a member of `family`.
pub(crate) fn graph_of_fnptr(fnptr: i64, family: &[GraphIdx]) -> Result<GraphIdx, CompilationError> {
    family
        .iter()
        .find(|g| i64::try_from(g.index()).ok() == Some(fnptr))
        .copied()
        .ok_or_else(|| {
            CompilationError::General(format!(
                "function pointer {fnptr} is not in the call family"
            ))
        })
}
