//! Stack layout remapping: the parallel move needed when a builder jumps to a block whose input
//! layout was fixed by an earlier path.
//!
//! Stack positions count from the bottom of the frame (position 0 is the return address). The
//! planner only decides which moves to make; builders execute the resulting [Move]s through a
//! scratch register (for ordinary moves) and a second scratch register (for breaking cycles).

use super::{GenVar, StackPos};
use crate::error::CompilationError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Move {
    /// Copy `src` (a stack slot or an immediate) into slot `dst`.
    Copy { src: GenVar, dst: StackPos },
    /// Save the current contents of slot `src` in the cycle-breaking scratch location.
    Save { src: StackPos },
    /// Write the cycle-breaking scratch location into slot `dst`.
    Restore { dst: StackPos },
}

#[derive(Debug)]
pub(crate) struct RemapPlan {
    /// How many slots to allocate before moving.
    pub(crate) grow: usize,
    pub(crate) moves: Vec<Move>,
    /// How many slots to release after moving.
    pub(crate) shrink: usize,
}

/// Plan the moves taking `outputargs` (at stack depth `depth`) to `arg_positions` (in a frame of
/// depth `target_depth`).
pub(crate) fn plan(
    depth: usize,
    outputargs: &[GenVar],
    arg_positions: &[StackPos],
    target_depth: usize,
) -> Result<RemapPlan, CompilationError> {
    if outputargs.len() != arg_positions.len() {
        return Err(CompilationError::InternalError(format!(
            "jump passes {} values to a block taking {}",
            outputargs.len(),
            arg_positions.len()
        )));
    }
    let n = target_depth;
    let grow = n.saturating_sub(depth);
    let shrink = depth.saturating_sub(n);

    // srccount[p] is the number of pending moves still reading slot `p`, or `None` for slots
    // that are not (or no longer) destinations.
    let mut targetlayout: Vec<Option<GenVar>> = vec![None; n];
    let mut srccount: Vec<Option<usize>> = vec![None; n];
    for (gv, &pos) in outputargs.iter().zip(arg_positions) {
        if pos >= n || targetlayout[pos].is_some() {
            return Err(CompilationError::InternalError(format!(
                "invalid target position {pos} in a frame of depth {n}"
            )));
        }
        targetlayout[pos] = Some(*gv);
        srccount[pos] = Some(0);
    }
    let mut pending = outputargs.len();
    for (gv, &pos) in outputargs.iter().zip(arg_positions) {
        if let GenVar::Var(p) = *gv {
            if p == pos {
                // `v = v`: nothing to do.
                srccount[p] = None;
                pending -= 1;
            } else if let Some(Some(c)) = srccount.get_mut(p) {
                *c += 1;
            }
        }
    }

    let mut moves = Vec::new();
    while pending > 0 {
        let mut progress = false;
        for i in 0..n {
            if srccount[i] == Some(0) {
                srccount[i] = None;
                pending -= 1;
                let gv = targetlayout[i].unwrap();
                if let GenVar::Var(p) = gv {
                    if p < n {
                        if let Some(c) = srccount[p].as_mut() {
                            *c -= 1;
                        }
                    }
                }
                moves.push(Move::Copy { src: gv, dst: i });
                progress = true;
            }
        }
        if !progress {
            // Only disjoint cycles remain: break each one through the scratch location.
            for i in 0..n {
                if srccount[i].is_none() {
                    continue;
                }
                moves.push(Move::Save { src: i });
                let mut dst = i;
                loop {
                    if srccount[dst] != Some(1) {
                        return Err(CompilationError::InternalError(
                            "stack remap left a slot outside any cycle".to_owned(),
                        ));
                    }
                    srccount[dst] = None;
                    pending -= 1;
                    let src = match targetlayout[dst] {
                        Some(GenVar::Var(p)) if p < n => p,
                        _ => {
                            return Err(CompilationError::InternalError(
                                "stack remap cycle through a non-slot".to_owned(),
                            ))
                        }
                    };
                    if src == i {
                        break;
                    }
                    moves.push(Move::Copy {
                        src: GenVar::Var(src),
                        dst,
                    });
                    dst = src;
                }
                moves.push(Move::Restore { dst });
            }
            if pending != 0 {
                return Err(CompilationError::InternalError(
                    "stack remap did not converge".to_owned(),
                ));
            }
        }
    }
    Ok(RemapPlan {
        grow,
        moves,
        shrink,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `plan` against a simulated stack, returning the values in the target slots.
    fn simulate(
        stack: &[i64],
        outputargs: &[GenVar],
        arg_positions: &[StackPos],
        target_depth: usize,
    ) -> Vec<i64> {
        let p = plan(stack.len(), outputargs, arg_positions, target_depth).unwrap();
        let mut mem = stack.to_vec();
        mem.resize(stack.len() + p.grow, -1);
        let mut scratch = None;
        for m in &p.moves {
            match *m {
                Move::Copy { src, dst } => {
                    mem[dst] = match src {
                        GenVar::Var(s) => mem[s],
                        GenVar::Const(c) => c,
                    }
                }
                Move::Save { src } => scratch = Some(mem[src]),
                Move::Restore { dst } => mem[dst] = scratch.take().unwrap(),
            }
        }
        mem.truncate(mem.len() - p.shrink);
        assert_eq!(mem.len(), target_depth);
        arg_positions.iter().map(|&pos| mem[pos]).collect()
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![vec![]];
        }
        let mut out = Vec::new();
        for p in permutations(n - 1) {
            for i in 0..=p.len() {
                let mut q = p.clone();
                q.insert(i, n - 1);
                out.push(q);
            }
        }
        out
    }

    #[test]
    fn all_permutations_up_to_6() {
        for n in 0..=6 {
            // Slot 0 is the return address; values live in slots 1..=n.
            let stack = (0..=n).map(|x| 100 + x as i64).collect::<Vec<_>>();
            let positions = (1..=n).collect::<Vec<_>>();
            for perm in permutations(n) {
                let outputargs = perm.iter().map(|&i| GenVar::Var(i + 1)).collect::<Vec<_>>();
                let expected = perm.iter().map(|&i| 100 + (i + 1) as i64).collect::<Vec<_>>();
                assert_eq!(
                    simulate(&stack, &outputargs, &positions, n + 1),
                    expected,
                    "{perm:?}"
                );
            }
        }
    }

    #[test]
    fn identity_emits_nothing() {
        let outputargs = [GenVar::Var(1), GenVar::Var(2)];
        let p = plan(3, &outputargs, &[1, 2], 3).unwrap();
        assert!(p.moves.is_empty());
        assert_eq!((p.grow, p.shrink), (0, 0));
    }

    #[test]
    fn swap_uses_one_cycle() {
        let p = plan(3, &[GenVar::Var(2), GenVar::Var(1)], &[1, 2], 3).unwrap();
        assert_eq!(
            p.moves,
            vec![
                Move::Save { src: 1 },
                Move::Copy {
                    src: GenVar::Var(2),
                    dst: 1
                },
                Move::Restore { dst: 2 },
            ]
        );
    }

    #[test]
    fn grow_shrink_and_constants() {
        // Sources above the target frame are read before the frame shrinks.
        let stack = [0, 10, 11, 12, 13];
        assert_eq!(
            simulate(&stack, &[GenVar::Var(4), GenVar::Const(7)], &[1, 2], 3),
            vec![13, 7]
        );
        // The target frame is deeper than the current one.
        let stack = [0, 10];
        assert_eq!(
            simulate(
                &stack,
                &[GenVar::Const(5), GenVar::Var(1), GenVar::Var(1)],
                &[1, 2, 3],
                4
            ),
            vec![5, 10, 10]
        );
    }

    #[test]
    fn mixed_chain_and_cycle() {
        // 1 -> 2 -> 3 is a chain, 4 <-> 5 a cycle.
        let stack = [0, 1, 2, 3, 4, 5];
        let outputargs = [
            GenVar::Const(9),
            GenVar::Var(1),
            GenVar::Var(2),
            GenVar::Var(5),
            GenVar::Var(4),
        ];
        assert_eq!(
            simulate(&stack, &outputargs, &[1, 2, 3, 4, 5], 6),
            vec![9, 1, 2, 5, 4]
        );
    }

    #[test]
    fn bad_layout() {
        assert!(plan(3, &[GenVar::Var(1)], &[1, 2], 3).is_err());
        assert!(plan(3, &[GenVar::Var(1), GenVar::Var(2)], &[1, 1], 3).is_err());
    }
}
