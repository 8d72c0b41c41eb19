//! The splitter: carves a structured body into numbered states.
//!
//! Every yield boundary and every structured join becomes a fresh state;
//! states are linked by explicit goto-state edges whose targets are plain
//! integers (`-1` meaning exit until the eliminator resolves it). Exception
//! handling that spans yields is compiled here into the per-state handler
//! table plus the end-finally unroll protocol.

use crate::context::{Ctx, CUR_EXC_VAR, TMP_RESULT_VAR, UNROLL_FINALLY_VAR};
use crate::error::{LowerError, LowerResult};
use crate::hir::{
    stmt_contains_yield, stmt_has_expr_yields, BinOp, CaseArm, CondArm, ExceptHandler, HirExpr,
    HirStmt, Type,
};
use crate::normalize::Normalizer;
use crate::relocate::{
    relocate_block_breaks, relocate_loop_exits, relocate_returns_into_finally,
};
use crate::runtime;

/// Goto target meaning "leave the generator" until the exit state exists.
pub const EXIT_TARGET: i32 = -1;

pub struct Splitter<'a> {
    ctx: &'a mut Ctx,
}

impl<'a> Splitter<'a> {
    pub fn new(ctx: &'a mut Ctx) -> Self {
        Self { ctx }
    }

    /// Creates state 0 from the whole body and splits it recursively.
    pub fn split_body(&mut self, body: Vec<HirStmt>) -> LowerResult<()> {
        let entry = self.ctx.new_state(Vec::new())?;
        if entry != 0 {
            return Err(LowerError::StateIndexMismatch {
                expected: 0,
                actual: entry,
            });
        }
        let lowered = self.split_stmts(body, EXIT_TARGET)?;
        self.ctx.states[0].body = lowered;
        tracing::debug!(states = self.ctx.state_count(), "split complete");
        Ok(())
    }

    /// Splits a statement list whose continuation is `goto_out`.
    fn split_stmts(&mut self, mut stmts: Vec<HirStmt>, goto_out: i32) -> LowerResult<Vec<HirStmt>> {
        if !matches!(stmts.last(), Some(HirStmt::GotoState(_))) {
            stmts.push(HirStmt::GotoState(goto_out));
        }
        let mut i = 0;
        while i < stmts.len() {
            if stmt_has_expr_yields(&stmts[i]) {
                let stmt = stmts.remove(i);
                let (seq, changed) = Normalizer::new(self.ctx).normalize_stmt(stmt);
                if !changed {
                    return Err(LowerError::YieldInExpression);
                }
                stmts.splice(i..i, seq);
                continue;
            }
            if stmt_contains_yield(&stmts[i]) {
                // Everything after this child moves into a fresh state; the
                // child's own continuation becomes that state.
                let tail = stmts.split_off(i + 1);
                let Some(stmt) = stmts.pop() else {
                    return Err(LowerError::Internal(
                        "split point vanished from statement list".to_string(),
                    ));
                };
                let tail_state = self.ctx.new_state(Vec::new())?;
                let replacement = self.split_stmt(stmt, tail_state)?;
                stmts.extend(replacement);
                let tail_body = self.split_stmts(tail, goto_out)?;
                self.ctx.states[tail_state as usize].body = tail_body;
                return Ok(stmts);
            }
            i += 1;
        }
        Ok(stmts)
    }

    /// Splits a single yield-bearing statement; returns its replacement.
    fn split_stmt(&mut self, stmt: HirStmt, goto_out: i32) -> LowerResult<Vec<HirStmt>> {
        match stmt {
            HirStmt::Yield(value) => Ok(vec![
                HirStmt::Yield(value),
                HirStmt::GotoState(goto_out),
            ]),
            HirStmt::If { arms, else_body } => {
                let mut lowered = Vec::with_capacity(arms.len());
                for arm in arms {
                    lowered.push(CondArm {
                        condition: arm.condition,
                        body: self.split_stmts(arm.body, goto_out)?,
                    });
                }
                // without an else, falling through would skip the goto
                let else_body = self.split_stmts(else_body.unwrap_or_default(), goto_out)?;
                Ok(vec![HirStmt::If {
                    arms: lowered,
                    else_body: Some(else_body),
                }])
            }
            HirStmt::Case {
                selector,
                arms,
                else_body,
            } => {
                let mut lowered = Vec::with_capacity(arms.len());
                for arm in arms {
                    lowered.push(CaseArm {
                        labels: arm.labels,
                        body: self.split_stmts(arm.body, goto_out)?,
                    });
                }
                let else_body = self.split_stmts(else_body.unwrap_or_default(), goto_out)?;
                Ok(vec![HirStmt::Case {
                    selector,
                    arms: lowered,
                    else_body: Some(else_body),
                }])
            }
            HirStmt::While { condition, body } => {
                let head = self.ctx.new_state(Vec::new())?;
                let mut body = body;
                relocate_loop_exits(
                    &mut body,
                    &HirStmt::GotoState(head),
                    &HirStmt::GotoState(goto_out),
                );
                let body = self.split_stmts(body, head)?;
                self.ctx.states[head as usize].body = vec![HirStmt::If {
                    arms: vec![CondArm { condition, body }],
                    else_body: Some(vec![HirStmt::GotoState(goto_out)]),
                }];
                // entering the loop is a jump to its head state
                Ok(vec![HirStmt::GotoState(head)])
            }
            HirStmt::Block { label, body } => {
                let mut body = body;
                relocate_block_breaks(&mut body, label.as_ref(), &HirStmt::GotoState(goto_out));
                let body = self.split_stmts(body, goto_out)?;
                Ok(vec![HirStmt::Block { label, body }])
            }
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => self.split_try(body, handlers, finally, goto_out),
            HirStmt::For { .. } => Err(LowerError::ForLoopInInput),
            HirStmt::GotoState(_) => Err(LowerError::GotoStateInInput),
            other => Err(LowerError::Internal(format!(
                "statement kind {} cannot carry a yield",
                stmt_kind(&other)
            ))),
        }
    }

    /// Lowers a yield-crossing try into a try state, an optional except
    /// state and a finally state, with deterministic indices predicted from
    /// the current state count.
    fn split_try(
        &mut self,
        body: Vec<HirStmt>,
        handlers: Vec<ExceptHandler>,
        finally: Option<Vec<HirStmt>>,
        goto_out: i32,
    ) -> LowerResult<Vec<HirStmt>> {
        self.ctx.has_exceptions = true;
        self.ctx.ensure_var(CUR_EXC_VAR, Type::Exception);
        self.ctx.ensure_var(UNROLL_FINALLY_VAR, Type::Bool);

        let try_idx = self.ctx.state_count() as i32;
        let have_except = !handlers.is_empty();
        // Without an except branch the table entry points straight at the
        // finally, and must stay positive so the finally still runs.
        let (exc_encoding, finally_idx) = if have_except {
            (-(try_idx + 1), try_idx + 2)
        } else {
            (try_idx + 1, try_idx + 1)
        };

        let mut try_body = body;
        let mut except_body = if have_except {
            self.build_except_chain(handlers, finally_idx)
        } else {
            Vec::new()
        };
        let mut finally_body = finally.unwrap_or_default();
        finally_body.push(self.end_finally());

        let outer_finally = self.ctx.nearest_finally;
        try_body = relocate_returns_into_finally(self.ctx, try_body, finally_idx);
        except_body = relocate_returns_into_finally(self.ctx, except_body, finally_idx);
        if outer_finally != -1 {
            // the end-finally return chains to the enclosing finally
            finally_body = relocate_returns_into_finally(self.ctx, finally_body, outer_finally);
        }

        let saved_exc = self.ctx.cur_exc_handling_state;
        self.ctx.cur_exc_handling_state = exc_encoding;
        let real_try = self.ctx.new_state(Vec::new())?;
        if real_try != try_idx {
            return Err(LowerError::StateIndexMismatch {
                expected: try_idx,
                actual: real_try,
            });
        }
        if have_except {
            self.ctx.cur_exc_handling_state = finally_idx;
            let real_except = self.ctx.new_state(Vec::new())?;
            if real_except != try_idx + 1 {
                return Err(LowerError::StateIndexMismatch {
                    expected: try_idx + 1,
                    actual: real_except,
                });
            }
        }
        self.ctx.cur_exc_handling_state = saved_exc;
        let real_finally = self.ctx.new_state(Vec::new())?;
        if real_finally != finally_idx {
            return Err(LowerError::StateIndexMismatch {
                expected: finally_idx,
                actual: real_finally,
            });
        }

        let saved_finally = self.ctx.nearest_finally;
        self.ctx.nearest_finally = finally_idx;
        self.ctx.cur_exc_handling_state = exc_encoding;
        let try_res = self.split_stmts(try_body, finally_idx);
        self.ctx.cur_exc_handling_state = finally_idx;
        let except_res = if have_except {
            self.split_stmts(except_body, finally_idx).map(Some)
        } else {
            Ok(None)
        };
        self.ctx.nearest_finally = saved_finally;
        self.ctx.cur_exc_handling_state = saved_exc;
        let finally_res = self.split_stmts(finally_body, goto_out);

        self.ctx.states[try_idx as usize].body = try_res?;
        if let Some(except_lowered) = except_res? {
            self.ctx.states[(try_idx + 1) as usize].body = except_lowered;
        }
        self.ctx.states[finally_idx as usize].body = finally_res?;

        Ok(vec![HirStmt::GotoState(try_idx)])
    }

    /// The except branches as a chain of is-of tests. When nothing matches,
    /// the synthesised else re-raises through the table machinery: set the
    /// unroll flag, save the exception, run the finally.
    fn build_except_chain(
        &mut self,
        handlers: Vec<ExceptHandler>,
        finally_idx: i32,
    ) -> Vec<HirStmt> {
        let mut arms = Vec::new();
        let mut catch_all = None;
        for handler in handlers {
            if handler.exception_types.is_empty() {
                catch_all = Some(handler.body);
                break;
            }
            let condition = handler
                .exception_types
                .iter()
                .map(|t| runtime::exc_matches(t))
                .reduce(|a, b| HirExpr::binary(BinOp::Or, a, b))
                .unwrap_or(HirExpr::truth(false));
            let mut body = vec![self.ctx.assign(CUR_EXC_VAR, HirExpr::nil())];
            body.extend(handler.body);
            arms.push(CondArm { condition, body });
        }
        let else_body = match catch_all {
            Some(body) => {
                let mut matched = vec![self.ctx.assign(CUR_EXC_VAR, HirExpr::nil())];
                matched.extend(body);
                matched
            }
            None => vec![
                self.ctx.assign(UNROLL_FINALLY_VAR, HirExpr::truth(true)),
                self.ctx
                    .assign(CUR_EXC_VAR, runtime::get_current_exception()),
                HirStmt::GotoState(finally_idx),
            ],
        };
        if arms.is_empty() {
            else_body
        } else {
            vec![HirStmt::If {
                arms,
                else_body: Some(else_body),
            }]
        }
    }

    /// The end-finally node: once the finally body ran, either resume the
    /// pending return or re-raise the pending exception.
    fn end_finally(&mut self) -> HirStmt {
        self.ctx.ensure_result_var();
        self.ctx.ensure_var(UNROLL_FINALLY_VAR, Type::Bool);
        self.ctx.ensure_var(CUR_EXC_VAR, Type::Exception);
        HirStmt::If {
            arms: vec![CondArm {
                condition: self.ctx.access(UNROLL_FINALLY_VAR),
                body: vec![HirStmt::If {
                    arms: vec![CondArm {
                        condition: HirExpr::binary(
                            BinOp::Eq,
                            self.ctx.access(CUR_EXC_VAR),
                            HirExpr::nil(),
                        ),
                        body: vec![HirStmt::Return(Some(self.ctx.access(TMP_RESULT_VAR)))],
                    }],
                    else_body: Some(vec![HirStmt::Raise(Some(self.ctx.access(CUR_EXC_VAR)))]),
                }],
            }],
            else_body: None,
        }
    }
}

fn stmt_kind(stmt: &HirStmt) -> &'static str {
    match stmt {
        HirStmt::Expr(_) => "expression statement",
        HirStmt::VarDecl { .. } => "variable declaration",
        HirStmt::Assign { .. } => "assignment",
        HirStmt::Return(_) => "return",
        HirStmt::Raise(_) => "raise",
        HirStmt::Yield(_) => "yield",
        HirStmt::If { .. } => "if",
        HirStmt::Case { .. } => "case",
        HirStmt::While { .. } => "while",
        HirStmt::For { .. } => "for",
        HirStmt::Block { .. } => "block",
        HirStmt::Break { .. } => "break",
        HirStmt::Continue => "continue",
        HirStmt::Try { .. } => "try",
        HirStmt::GotoState(_) => "goto-state",
    }
}
