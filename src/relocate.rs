//! Control-flow relocation helpers used during splitting.
//!
//! `relocate_loop_exits` and `relocate_block_breaks` redirect break/continue
//! statements to the goto targets a lowered while/block supplies.
//! `relocate_returns_into_finally` rewrites `return` into the unroll-finally
//! protocol inside a try whose finally state is known.

use crate::context::{Ctx, CUR_EXC_VAR, TMP_RESULT_VAR, UNROLL_FINALLY_VAR};
use crate::hir::{stmts_contain_yield, HirExpr, HirStmt, Symbol, Type};

/// Redirects the exits of a while body being lowered: `continue` jumps back
/// to the loop-head state, a depth-0 unlabelled `break` jumps past the loop.
/// Nested whiles own their exits and are not entered; blocks bump the depth
/// so their unlabelled breaks stay theirs.
pub fn relocate_loop_exits(stmts: &mut [HirStmt], before: &HirStmt, after: &HirStmt) {
    relocate_loop_in(stmts, before, after, 0);
}

fn relocate_loop_in(stmts: &mut [HirStmt], before: &HirStmt, after: &HirStmt, depth: u32) {
    for stmt in stmts.iter_mut() {
        match stmt {
            HirStmt::Continue => *stmt = before.clone(),
            HirStmt::Break { label: None } if depth == 0 => *stmt = after.clone(),
            HirStmt::Break { .. } | HirStmt::While { .. } => {}
            HirStmt::Block { body, .. } => relocate_loop_in(body, before, after, depth + 1),
            HirStmt::If { arms, else_body } => {
                for arm in arms.iter_mut() {
                    relocate_loop_in(&mut arm.body, before, after, depth);
                }
                if let Some(else_body) = else_body {
                    relocate_loop_in(else_body, before, after, depth);
                }
            }
            HirStmt::Case {
                arms, else_body, ..
            } => {
                for arm in arms.iter_mut() {
                    relocate_loop_in(&mut arm.body, before, after, depth);
                }
                if let Some(else_body) = else_body {
                    relocate_loop_in(else_body, before, after, depth);
                }
            }
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                relocate_loop_in(body, before, after, depth);
                for handler in handlers.iter_mut() {
                    relocate_loop_in(&mut handler.body, before, after, depth);
                }
                if let Some(finally) = finally {
                    relocate_loop_in(finally, before, after, depth);
                }
            }
            _ => {}
        }
    }
}

/// Redirects breaks that leave the block being lowered: a matching labelled
/// break from any depth, an unlabelled one only when the block is its
/// innermost breakable construct.
pub fn relocate_block_breaks(stmts: &mut [HirStmt], label: Option<&Symbol>, target: &HirStmt) {
    relocate_block_in(stmts, label, target, 0);
}

fn relocate_block_in(
    stmts: &mut [HirStmt],
    label: Option<&Symbol>,
    target: &HirStmt,
    depth: u32,
) {
    for stmt in stmts.iter_mut() {
        match stmt {
            HirStmt::Break { label: Some(l) } if Some(&*l) == label => *stmt = target.clone(),
            HirStmt::Break { label: None } if depth == 0 => *stmt = target.clone(),
            HirStmt::Break { .. } | HirStmt::Continue => {}
            HirStmt::While { body, .. } => relocate_block_in(body, label, target, depth + 1),
            HirStmt::Block { body, .. } => relocate_block_in(body, label, target, depth + 1),
            HirStmt::If { arms, else_body } => {
                for arm in arms.iter_mut() {
                    relocate_block_in(&mut arm.body, label, target, depth);
                }
                if let Some(else_body) = else_body {
                    relocate_block_in(else_body, label, target, depth);
                }
            }
            HirStmt::Case {
                arms, else_body, ..
            } => {
                for arm in arms.iter_mut() {
                    relocate_block_in(&mut arm.body, label, target, depth);
                }
                if let Some(else_body) = else_body {
                    relocate_block_in(else_body, label, target, depth);
                }
            }
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                relocate_block_in(body, label, target, depth);
                for handler in handlers.iter_mut() {
                    relocate_block_in(&mut handler.body, label, target, depth);
                }
                if let Some(finally) = finally {
                    relocate_block_in(finally, label, target, depth);
                }
            }
            _ => {}
        }
    }
}

/// Rewrites `return e` into
/// `:unrollFinally := true; :tmpResult := e; :curExc := nil; goto finally`
/// so the finally runs before the return completes. A nested try that has
/// both a finally and a yield lowers its own returns when it is split, so it
/// is not entered; every other nested statement is.
pub fn relocate_returns_into_finally(
    ctx: &mut Ctx,
    stmts: Vec<HirStmt>,
    finally_state: i32,
) -> Vec<HirStmt> {
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        match stmt {
            HirStmt::Return(value) => {
                ctx.ensure_var(UNROLL_FINALLY_VAR, Type::Bool);
                ctx.ensure_var(CUR_EXC_VAR, Type::Exception);
                out.push(ctx.assign(UNROLL_FINALLY_VAR, HirExpr::truth(true)));
                if let Some(value) = value {
                    ctx.ensure_result_var();
                    out.push(ctx.assign(TMP_RESULT_VAR, value));
                }
                out.push(ctx.assign(CUR_EXC_VAR, HirExpr::nil()));
                out.push(HirStmt::GotoState(finally_state));
            }
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                let shielded = finally.is_some()
                    && (stmts_contain_yield(&body)
                        || handlers.iter().any(|h| stmts_contain_yield(&h.body))
                        || finally.as_deref().is_some_and(stmts_contain_yield));
                if shielded {
                    out.push(HirStmt::Try {
                        body,
                        handlers,
                        finally,
                    });
                } else {
                    out.push(HirStmt::Try {
                        body: relocate_returns_into_finally(ctx, body, finally_state),
                        handlers: handlers
                            .into_iter()
                            .map(|mut h| {
                                h.body =
                                    relocate_returns_into_finally(ctx, h.body, finally_state);
                                h
                            })
                            .collect(),
                        finally: finally
                            .map(|f| relocate_returns_into_finally(ctx, f, finally_state)),
                    });
                }
            }
            HirStmt::If { arms, else_body } => out.push(HirStmt::If {
                arms: arms
                    .into_iter()
                    .map(|mut a| {
                        a.body = relocate_returns_into_finally(ctx, a.body, finally_state);
                        a
                    })
                    .collect(),
                else_body: else_body
                    .map(|b| relocate_returns_into_finally(ctx, b, finally_state)),
            }),
            HirStmt::Case {
                selector,
                arms,
                else_body,
            } => out.push(HirStmt::Case {
                selector,
                arms: arms
                    .into_iter()
                    .map(|mut a| {
                        a.body = relocate_returns_into_finally(ctx, a.body, finally_state);
                        a
                    })
                    .collect(),
                else_body: else_body
                    .map(|b| relocate_returns_into_finally(ctx, b, finally_state)),
            }),
            HirStmt::While { condition, body } => out.push(HirStmt::While {
                condition,
                body: relocate_returns_into_finally(ctx, body, finally_state),
            }),
            HirStmt::Block { label, body } => out.push(HirStmt::Block {
                label,
                body: relocate_returns_into_finally(ctx, body, finally_state),
            }),
            other => out.push(other),
        }
    }
    out
}
