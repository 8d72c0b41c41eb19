//! Empty-state elimination.
//!
//! After splitting, many states are nothing but a forwarding goto (the tails
//! of lists fully consumed by a split, the continuations of whiles). This
//! pass appends the exit state, renumbers the survivors, chases forwarding
//! chains out of goto targets and table entries, and drops the dead states.
//! Running it twice is a no-op.

use crate::context::{Ctx, State};
use crate::error::{LowerError, LowerResult};
use crate::hir::HirStmt;
use crate::split::EXIT_TARGET;

pub fn eliminate_empty_states(ctx: &mut Ctx) -> LowerResult<()> {
    let exit_old = ensure_exit_state(ctx)?;
    let count = ctx.state_count();

    // pass 1: renumber, marking pure forwarders dead
    let mut new_index = vec![0i32; count];
    let mut next = 0i32;
    for (i, state) in ctx.states.iter().enumerate() {
        let forwarder = bare_goto_target(&state.body).is_some();
        if forwarder && i != 0 && i != exit_old {
            new_index[i] = -1;
        } else {
            new_index[i] = next;
            next += 1;
        }
    }

    // pass 2: resolve every possible target once, then rewrite
    let mut resolved = vec![0i32; count];
    for (i, slot) in resolved.iter_mut().enumerate() {
        let end = chase(&ctx.states, i as i32, exit_old, count)?;
        *slot = new_index[end as usize];
        if *slot == -1 {
            return Err(LowerError::Internal(
                "goto target resolved to a dead state".to_string(),
            ));
        }
    }
    let exit_resolved = new_index[exit_old];

    for (i, state) in ctx.states.iter_mut().enumerate() {
        if new_index[i] == -1 || i == exit_old {
            // dead states are about to go; the exit keeps its literal -1
            continue;
        }
        retarget(&mut state.body, &resolved, exit_resolved)?;
    }

    for (i, entry) in ctx.exc_table.iter_mut().enumerate() {
        if new_index[i] == -1 || *entry == 0 {
            continue;
        }
        let negative = *entry < 0;
        let handler = resolved[entry.unsigned_abs() as usize];
        let handler = i16::try_from(handler)
            .map_err(|_| LowerError::TooManyStates(count))?;
        *entry = if negative { -handler } else { handler };
    }

    let mut keep = new_index.iter().map(|&n| n != -1);
    ctx.states.retain(|_| keep.next() == Some(true));
    let mut keep = new_index.iter().map(|&n| n != -1);
    ctx.exc_table.retain(|_| keep.next() == Some(true));

    ctx.exit_state_idx = new_index[exit_old];
    tracing::debug!(
        states = ctx.state_count(),
        exit = ctx.exit_state_idx,
        "empty states elided"
    );
    Ok(())
}

/// Appends the exit state unless a previous run already did.
fn ensure_exit_state(ctx: &mut Ctx) -> LowerResult<usize> {
    if let Some(last) = ctx.states.last() {
        if bare_goto_target(&last.body) == Some(EXIT_TARGET) {
            return Ok(ctx.state_count() - 1);
        }
    }
    let idx = ctx.new_state(vec![HirStmt::GotoState(EXIT_TARGET)])?;
    Ok(idx as usize)
}

/// A body that is a lone goto, the shape a forwarder has.
fn bare_goto_target(body: &[HirStmt]) -> Option<i32> {
    match body {
        [HirStmt::GotoState(n)] => Some(*n),
        _ => None,
    }
}

/// Follows bare forwarders from `n` to the first real state; `-1` resolves
/// to the exit. Bounded by the state count, which no legal chain exceeds.
fn chase(states: &[State], mut n: i32, exit_old: usize, count: usize) -> LowerResult<i32> {
    let mut hops = 0usize;
    loop {
        if n == EXIT_TARGET {
            return Ok(exit_old as i32);
        }
        match states
            .get(n as usize)
            .and_then(|s| bare_goto_target(&s.body))
        {
            Some(next) => {
                n = next;
                hops += 1;
                if hops > count {
                    return Err(LowerError::ForwardingCycle(count));
                }
            }
            None => return Ok(n),
        }
    }
}

fn retarget(body: &mut [HirStmt], resolved: &[i32], exit_resolved: i32) -> LowerResult<()> {
    for stmt in body.iter_mut() {
        match stmt {
            HirStmt::GotoState(n) => {
                *n = if *n == EXIT_TARGET {
                    exit_resolved
                } else {
                    resolved[*n as usize]
                };
            }
            HirStmt::If { arms, else_body } => {
                for arm in arms.iter_mut() {
                    retarget(&mut arm.body, resolved, exit_resolved)?;
                }
                if let Some(else_body) = else_body {
                    retarget(else_body, resolved, exit_resolved)?;
                }
            }
            HirStmt::Case {
                arms, else_body, ..
            } => {
                for arm in arms.iter_mut() {
                    retarget(&mut arm.body, resolved, exit_resolved)?;
                }
                if let Some(else_body) = else_body {
                    retarget(else_body, resolved, exit_resolved)?;
                }
            }
            HirStmt::While { body, .. } | HirStmt::Block { body, .. } => {
                retarget(body, resolved, exit_resolved)?;
            }
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                retarget(body, resolved, exit_resolved)?;
                for handler in handlers.iter_mut() {
                    retarget(&mut handler.body, resolved, exit_resolved)?;
                }
                if let Some(finally) = finally {
                    retarget(finally, resolved, exit_resolved)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EnvMode;
    use crate::hir::{CondArm, HirExpr, Type};

    fn ctx_with(states: Vec<Vec<HirStmt>>, table: Vec<i16>) -> Ctx {
        let mut ctx = Ctx::new(EnvMode::Locals, Type::Int);
        for (body, entry) in states.into_iter().zip(table) {
            ctx.cur_exc_handling_state = i32::from(entry);
            ctx.new_state(body).expect("state");
        }
        ctx.cur_exc_handling_state = 0;
        ctx
    }

    #[test]
    fn test_forwarder_is_deleted_and_targets_chase_through() {
        // 0 -> 1 (forwarder) -> yield at 2
        let mut ctx = ctx_with(
            vec![
                vec![HirStmt::GotoState(1)],
                vec![HirStmt::GotoState(2)],
                vec![HirStmt::Yield(None), HirStmt::GotoState(EXIT_TARGET)],
            ],
            vec![0, 0, 0],
        );
        eliminate_empty_states(&mut ctx).expect("elide");
        // forwarder gone, exit appended
        assert_eq!(ctx.state_count(), 3);
        assert_eq!(ctx.states[0].body, vec![HirStmt::GotoState(1)]);
        assert_eq!(ctx.exit_state_idx, 2);
        // the yield state's exit edge now names the exit state
        assert_eq!(
            ctx.states[1].body,
            vec![HirStmt::Yield(None), HirStmt::GotoState(2)]
        );
        // the exit keeps its literal -1
        assert_eq!(ctx.states[2].body, vec![HirStmt::GotoState(EXIT_TARGET)]);
    }

    #[test]
    fn test_exception_table_entries_are_forwarded_with_sign() {
        // state 0 names 1 as its except handler; 1 forwards to 2
        let mut ctx = ctx_with(
            vec![
                vec![HirStmt::Yield(None), HirStmt::GotoState(EXIT_TARGET)],
                vec![HirStmt::GotoState(2)],
                vec![HirStmt::Yield(None), HirStmt::GotoState(EXIT_TARGET)],
            ],
            vec![-1, 0, 0],
        );
        eliminate_empty_states(&mut ctx).expect("elide");
        // handler renumbered from 2 to 1, sign preserved
        assert_eq!(ctx.exc_table[0], -1);
        assert_eq!(ctx.state_count(), 3);
    }

    #[test]
    fn test_elision_is_idempotent() {
        let mut ctx = ctx_with(
            vec![
                vec![HirStmt::If {
                    arms: vec![CondArm {
                        condition: HirExpr::name("c"),
                        body: vec![HirStmt::GotoState(1)],
                    }],
                    else_body: Some(vec![HirStmt::GotoState(EXIT_TARGET)]),
                }],
                vec![HirStmt::GotoState(2)],
                vec![HirStmt::Yield(None), HirStmt::GotoState(EXIT_TARGET)],
            ],
            vec![0, 0, 0],
        );
        eliminate_empty_states(&mut ctx).expect("first run");
        let states = ctx.states.clone();
        let table = ctx.exc_table.clone();
        let exit = ctx.exit_state_idx;
        eliminate_empty_states(&mut ctx).expect("second run");
        assert_eq!(ctx.states, states);
        assert_eq!(ctx.exc_table, table);
        assert_eq!(ctx.exit_state_idx, exit);
    }

    #[test]
    fn test_forwarding_cycle_is_detected() {
        let mut ctx = ctx_with(
            vec![
                vec![HirStmt::Yield(None), HirStmt::GotoState(1)],
                vec![HirStmt::GotoState(2)],
                vec![HirStmt::GotoState(1)],
            ],
            vec![0, 0, 0],
        );
        let err = eliminate_empty_states(&mut ctx).expect_err("cycle");
        assert!(matches!(err, LowerError::ForwardingCycle(_)));
    }
}
