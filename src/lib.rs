//! # Genlower - closure-iterator lowering
//!
//! Rewrites the body of a resumable generator into a flat state machine in
//! ordinary structured control flow. After the pass the function has no
//! suspension points: it dispatches on a persisted integer state at entry,
//! runs one straight-line segment, stores the next state, and returns. A
//! caller loop invoking the function once per element is all the coroutine
//! runtime that remains.
//!
//! Exception handling that spans yields is lowered too: try/except/finally
//! becomes states plus a static table mapping each state to its handler,
//! and "unwind to the nearest finally" becomes data movement and gotos.
//!
//! ## Pipeline
//!
//! 1. **Normalisation** ([`normalize`]) - yields buried in compound
//!    expressions are hoisted to statement level (run on demand while
//!    splitting).
//! 2. **Splitting** ([`split`]) - the body is carved into numbered states
//!    linked by goto-state edges; the exception table grows in lockstep.
//! 3. **Elision** ([`elide`]) - forwarding-only states disappear and the
//!    exit state is appended.
//! 4. **Materialisation** ([`materialize`]) - abstract yields, gotos and
//!    returns become `:state` assignments plus returns and breaks.
//! 5. **Emission** ([`emit`]) - the dispatch loop and, when needed, the
//!    table-consulting catch are wrapped around the states.
//!
//! ## Example
//!
//! ```rust
//! use genlower::hir::{BinOp, HirExpr, HirFunction, HirParam, HirStmt, Type};
//! use genlower::interp::{IterDriver, Value};
//! use genlower::{lower_closure_iterator, EnvMode};
//!
//! // while n > 0: yield n; n := n - 1
//! let body = vec![HirStmt::While {
//!     condition: HirExpr::binary(BinOp::Gt, HirExpr::name("n"), HirExpr::int(0)),
//!     body: vec![
//!         HirStmt::Yield(Some(HirExpr::name("n"))),
//!         HirStmt::Assign {
//!             target: genlower::hir::AssignTarget::Symbol("n".to_string()),
//!             value: HirExpr::binary(BinOp::Sub, HirExpr::name("n"), HirExpr::int(1)),
//!             fast: false,
//!         },
//!     ],
//! }];
//! let func = HirFunction {
//!     name: "countdown".to_string(),
//!     params: [HirParam::new("n", Type::Int)].into_iter().collect(),
//!     ret_type: Type::Unit,
//!     body,
//!     is_closure_iter: true,
//! };
//!
//! let lowered = lower_closure_iterator(&func, EnvMode::Locals).expect("lowering");
//! let mut driver = IterDriver::new(&lowered);
//! driver.seed("n", Value::Int(3));
//! let (yields, _) = driver.drain(16).expect("drive");
//! assert_eq!(yields, vec![Value::Int(3), Value::Int(2), Value::Int(1)]);
//! ```

pub mod context;
pub mod elide;
pub mod emit;
pub mod error;
pub mod hir;
pub mod interp;
pub mod materialize;
pub mod normalize;
pub mod relocate;
pub mod runtime;
pub mod split;
pub mod verify;

pub use context::{Ctx, EnvMode};
pub use error::{LowerError, LowerResult};

use crate::elide::eliminate_empty_states;
use crate::emit::emit_dispatcher;
use crate::hir::{HirFunction, HirStmt, Symbol, Type};
use crate::materialize::materialize_states;
use crate::split::Splitter;

/// The transformed generator plus the facts its integration needs.
#[derive(Debug, Clone)]
pub struct Lowered {
    pub func: HirFunction,
    pub state_count: usize,
    pub exit_state: i32,
    pub exception_table: Vec<i16>,
    /// Fields to add to the closure environment in `Lifted` mode, `:state`
    /// first.
    pub env_fields: Vec<(Symbol, Type)>,
}

/// Lowers one closure iterator. The input body must already be desugared
/// (no `for` loops) and semantically checked.
pub fn lower_closure_iterator(func: &HirFunction, mode: EnvMode) -> LowerResult<Lowered> {
    if !func.is_closure_iter {
        return Err(LowerError::NotAClosureIterator);
    }
    check_input(&func.body)?;

    let mut ctx = Ctx::new(mode, func.ret_type.clone());
    Splitter::new(&mut ctx).split_body(func.body.clone())?;
    eliminate_empty_states(&mut ctx)?;
    materialize_states(&mut ctx)?;
    let state_count = ctx.state_count();
    let exception_table = ctx.exc_table.clone();
    let body = emit_dispatcher(&mut ctx);
    tracing::debug!(name = %func.name, states = state_count, "lowered closure iterator");

    Ok(Lowered {
        func: HirFunction {
            body,
            ..func.clone()
        },
        state_count,
        exit_state: ctx.exit_state_idx,
        exception_table,
        env_fields: ctx.env_fields(),
    })
}

/// Rejects node kinds that must not reach this pass.
fn check_input(stmts: &[HirStmt]) -> LowerResult<()> {
    for stmt in stmts {
        match stmt {
            HirStmt::For { .. } => return Err(LowerError::ForLoopInInput),
            HirStmt::GotoState(_) => return Err(LowerError::GotoStateInInput),
            HirStmt::If { arms, else_body } => {
                for arm in arms {
                    check_input(&arm.body)?;
                }
                if let Some(else_body) = else_body {
                    check_input(else_body)?;
                }
            }
            HirStmt::Case {
                arms, else_body, ..
            } => {
                for arm in arms {
                    check_input(&arm.body)?;
                }
                if let Some(else_body) = else_body {
                    check_input(else_body)?;
                }
            }
            HirStmt::While { body, .. } | HirStmt::Block { body, .. } => check_input(body)?,
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                check_input(body)?;
                for handler in handlers {
                    check_input(&handler.body)?;
                }
                if let Some(finally) = finally {
                    check_input(finally)?;
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
    use crate::hir::HirExpr;

    fn generator(body: Vec<HirStmt>) -> HirFunction {
        HirFunction {
            name: "g".to_string(),
            params: Default::default(),
            ret_type: Type::Int,
            body,
            is_closure_iter: true,
        }
    }

    #[test]
    fn test_plain_functions_are_refused() {
        let mut func = generator(vec![]);
        func.is_closure_iter = false;
        let err = lower_closure_iterator(&func, EnvMode::Locals).expect_err("not a generator");
        assert!(matches!(err, LowerError::NotAClosureIterator));
    }

    #[test]
    fn test_for_loops_are_refused_even_without_yields() {
        let func = generator(vec![HirStmt::For {
            target: "i".to_string(),
            iter: HirExpr::name("xs"),
            body: vec![],
        }]);
        let err = lower_closure_iterator(&func, EnvMode::Locals).expect_err("for loop");
        assert!(matches!(err, LowerError::ForLoopInInput));
    }

    #[test]
    fn test_input_goto_state_is_refused() {
        let func = generator(vec![HirStmt::Block {
            label: None,
            body: vec![HirStmt::GotoState(3)],
        }]);
        let err = lower_closure_iterator(&func, EnvMode::Locals).expect_err("goto-state");
        assert!(matches!(err, LowerError::GotoStateInInput));
    }

    #[test]
    fn test_lowered_shape_is_structurally_sound() {
        let func = generator(vec![
            HirStmt::Yield(Some(HirExpr::int(1))),
            HirStmt::Yield(Some(HirExpr::int(2))),
        ]);
        let lowered = lower_closure_iterator(&func, EnvMode::Locals).expect("lowering");
        assert!(crate::verify::structural_issues(&lowered).is_empty());
        assert_eq!(lowered.state_count, 3);
        assert_eq!(lowered.exit_state, 2);
    }

    #[test]
    fn test_lifted_mode_reports_env_fields_state_first() {
        let func = generator(vec![HirStmt::Yield(Some(HirExpr::int(1)))]);
        let lowered = lower_closure_iterator(
            &func,
            EnvMode::Lifted {
                env_param: ":env".to_string(),
            },
        )
        .expect("lowering");
        assert_eq!(lowered.env_fields[0].0, crate::context::STATE_VAR);
    }
}
