//! Dispatcher emission.
//!
//! Wraps the finished state list in the resumable shell: an endless loop
//! around a labelled block whose body dispatches on the persisted `:state`.
//! State bodies never fall through (each ends in a return or a break back to
//! the loop), so the dispatch is a dense case statement with one arm per
//! state; a `:state` of -1 lands in the else arm and leaves the generator.
//! When any state lives inside a try, a single catch translates the raising
//! state through the exception table.

use crate::context::{Ctx, CUR_EXC_VAR, STATE_LOOP_LABEL, STATE_VAR, UNROLL_FINALLY_VAR};
use crate::hir::{BinOp, CaseArm, CondArm, ExceptHandler, HirExpr, HirStmt, Literal, UnaryOp};
use crate::runtime;

pub fn emit_dispatcher(ctx: &mut Ctx) -> Vec<HirStmt> {
    let states = std::mem::take(&mut ctx.states);
    let arms = states
        .into_iter()
        .enumerate()
        .map(|(i, state)| CaseArm {
            labels: vec![Literal::Int(i as i64)],
            body: state.body,
        })
        .collect();
    let dispatch = HirStmt::Case {
        selector: ctx.access(STATE_VAR),
        arms,
        else_body: Some(vec![HirStmt::Return(None)]),
    };

    let core = if ctx.has_exceptions {
        vec![HirStmt::Try {
            body: vec![
                runtime::setup_exception(ctx.access(CUR_EXC_VAR)),
                dispatch,
            ],
            handlers: vec![ExceptHandler {
                exception_types: Vec::new(),
                body: exception_arm(ctx),
            }],
            finally: None,
        }]
    } else {
        vec![dispatch]
    };

    let mut inner = ctx.declared_vars();
    inner.extend(core);
    vec![HirStmt::While {
        condition: HirExpr::truth(true),
        body: vec![HirStmt::Block {
            label: Some(STATE_LOOP_LABEL.to_string()),
            body: inner,
        }],
    }]
}

/// The single catch: look the raising state up in the table, re-raise when
/// it has no handler, otherwise unwind toward the encoded target.
fn exception_arm(ctx: &Ctx) -> Vec<HirStmt> {
    let table = HirExpr::Array(
        ctx.exc_table
            .iter()
            .map(|&e| HirExpr::int(i64::from(e)))
            .collect(),
    );
    vec![
        ctx.assign(
            STATE_VAR,
            HirExpr::Index {
                base: Box::new(table),
                index: Box::new(ctx.access(STATE_VAR)),
            },
        ),
        HirStmt::If {
            arms: vec![CondArm {
                condition: HirExpr::binary(BinOp::Eq, ctx.access(STATE_VAR), HirExpr::int(0)),
                body: vec![HirStmt::Raise(None)],
            }],
            else_body: None,
        },
        ctx.assign(
            UNROLL_FINALLY_VAR,
            HirExpr::binary(BinOp::Gt, ctx.access(STATE_VAR), HirExpr::int(0)),
        ),
        HirStmt::If {
            arms: vec![CondArm {
                condition: HirExpr::binary(BinOp::Lt, ctx.access(STATE_VAR), HirExpr::int(0)),
                body: vec![ctx.assign(
                    STATE_VAR,
                    HirExpr::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(ctx.access(STATE_VAR)),
                    },
                )],
            }],
            else_body: None,
        },
        ctx.assign(CUR_EXC_VAR, runtime::get_current_exception()),
    ]
}
