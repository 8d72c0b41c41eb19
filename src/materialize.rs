//! State-assignment materialisation.
//!
//! Turns the abstract control nodes left by the splitter into concrete data
//! movement: a yield suspends by storing the next state and returning, a
//! goto re-enters the dispatch loop, a return parks the state at -1.

use crate::context::{Ctx, STATE_LOOP_LABEL};
use crate::error::{LowerError, LowerResult};
use crate::hir::{HirStmt, Symbol};

pub fn materialize_states(ctx: &mut Ctx) -> LowerResult<()> {
    let mut states = std::mem::take(&mut ctx.states);
    for state in &mut states {
        let body = std::mem::take(&mut state.body);
        state.body = rewrite_list(ctx, body)?;
    }
    ctx.states = states;
    Ok(())
}

fn state_loop() -> Symbol {
    STATE_LOOP_LABEL.to_string()
}

fn rewrite_list(ctx: &Ctx, stmts: Vec<HirStmt>) -> LowerResult<Vec<HirStmt>> {
    let mut out = Vec::with_capacity(stmts.len());
    let mut it = stmts.into_iter();
    while let Some(stmt) = it.next() {
        match stmt {
            HirStmt::Yield(value) => match it.next() {
                Some(HirStmt::GotoState(next)) => {
                    out.push(ctx.assign_state(next));
                    if let Some(value) = value {
                        out.push(ctx.assign_result(value));
                    }
                    out.push(HirStmt::Return(None));
                }
                _ => return Err(LowerError::DanglingYield),
            },
            HirStmt::Return(value) => {
                out.push(ctx.assign_state(-1));
                out.push(HirStmt::Return(value));
            }
            HirStmt::GotoState(next) => {
                out.push(ctx.assign_state(next));
                out.push(HirStmt::Break {
                    label: Some(state_loop()),
                });
            }
            HirStmt::If { arms, else_body } => {
                let mut lowered = Vec::with_capacity(arms.len());
                for mut arm in arms {
                    arm.body = rewrite_list(ctx, arm.body)?;
                    lowered.push(arm);
                }
                let else_body = match else_body {
                    Some(b) => Some(rewrite_list(ctx, b)?),
                    None => None,
                };
                out.push(HirStmt::If {
                    arms: lowered,
                    else_body,
                });
            }
            HirStmt::Case {
                selector,
                arms,
                else_body,
            } => {
                let mut lowered = Vec::with_capacity(arms.len());
                for mut arm in arms {
                    arm.body = rewrite_list(ctx, arm.body)?;
                    lowered.push(arm);
                }
                let else_body = match else_body {
                    Some(b) => Some(rewrite_list(ctx, b)?),
                    None => None,
                };
                out.push(HirStmt::Case {
                    selector,
                    arms: lowered,
                    else_body,
                });
            }
            HirStmt::While { condition, body } => out.push(HirStmt::While {
                condition,
                body: rewrite_list(ctx, body)?,
            }),
            HirStmt::Block { label, body } => out.push(HirStmt::Block {
                label,
                body: rewrite_list(ctx, body)?,
            }),
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                let body = rewrite_list(ctx, body)?;
                let mut lowered = Vec::with_capacity(handlers.len());
                for mut handler in handlers {
                    handler.body = rewrite_list(ctx, handler.body)?;
                    lowered.push(handler);
                }
                let finally = match finally {
                    Some(f) => Some(rewrite_list(ctx, f)?),
                    None => None,
                };
                out.push(HirStmt::Try {
                    body,
                    handlers: lowered,
                    finally,
                });
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
