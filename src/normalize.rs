//! Statement-list-expression normalisation.
//!
//! A yield buried inside a compound expression (a call argument, a branch
//! condition, an assignment source) cannot be carved into states: the
//! surrounding expression context would be torn. This pass floats the
//! statement parts of such expressions up to statement level, so that after
//! it runs every yield sits at a statement position and the splitter can cut
//! the list there.
//!
//! Rules fire only on subtrees that actually contain a yield; everything else
//! is passed through untouched.

use crate::context::Ctx;
use crate::hir::{
    expr_contains_yield, stmt_has_expr_yields, AssignTarget, BinOp, CaseArm, CondArm,
    ExceptHandler, HirExpr, HirStmt, Type,
};

pub struct Normalizer<'a> {
    ctx: &'a mut Ctx,
}

impl<'a> Normalizer<'a> {
    pub fn new(ctx: &'a mut Ctx) -> Self {
        Self { ctx }
    }

    /// Rewrites one statement into a sequence in which every yield it
    /// contained sits at statement level. The bool reports whether anything
    /// was hoisted.
    pub fn normalize_stmt(&mut self, stmt: HirStmt) -> (Vec<HirStmt>, bool) {
        if !stmt_has_expr_yields(&stmt) {
            return (vec![stmt], false);
        }
        let mut out = Vec::new();
        let mut changed = false;
        match stmt {
            HirStmt::Expr(e) => {
                let value = self.normalize_expr(e, &mut out, &mut changed);
                if !matches!(value, HirExpr::Literal(_) | HirExpr::Var(_)) {
                    out.push(HirStmt::Expr(value));
                }
            }
            HirStmt::Yield(Some(e)) => {
                let value = self.normalize_expr(e, &mut out, &mut changed);
                out.push(HirStmt::Yield(Some(value)));
            }
            HirStmt::VarDecl {
                name,
                ty,
                init,
                mutable,
            } => {
                let init = init.map(|e| self.normalize_expr(e, &mut out, &mut changed));
                out.push(HirStmt::VarDecl {
                    name,
                    ty,
                    init,
                    mutable,
                });
            }
            HirStmt::Assign {
                target,
                value,
                fast,
            } => {
                let target = match target {
                    AssignTarget::Symbol(s) => AssignTarget::Symbol(s),
                    AssignTarget::Field { base, field } => AssignTarget::Field {
                        base: Box::new(self.normalize_expr(*base, &mut out, &mut changed)),
                        field,
                    },
                    AssignTarget::Index { base, index } => {
                        let base = self.normalize_expr(*base, &mut out, &mut changed);
                        let index = self.normalize_expr(*index, &mut out, &mut changed);
                        AssignTarget::Index {
                            base: Box::new(base),
                            index: Box::new(index),
                        }
                    }
                };
                let value = self.normalize_expr(value, &mut out, &mut changed);
                out.push(HirStmt::Assign {
                    target,
                    value,
                    fast,
                });
            }
            HirStmt::Return(Some(e)) => {
                let value = self.normalize_expr(e, &mut out, &mut changed);
                out.push(HirStmt::Return(Some(value)));
            }
            HirStmt::Raise(Some(e)) => {
                let value = self.normalize_expr(e, &mut out, &mut changed);
                out.push(HirStmt::Raise(Some(value)));
            }
            HirStmt::If { arms, else_body } => {
                if arms.iter().any(|a| expr_contains_yield(&a.condition)) {
                    // Later conditions may only run when reached, so each arm
                    // nests into the else of the previous one.
                    changed = true;
                    let chain = self.build_if_chain(arms, else_body, &mut changed);
                    out.extend(chain);
                } else {
                    let arms = arms
                        .into_iter()
                        .map(|a| {
                            let (body, c) = self.normalize_stmts(a.body);
                            changed |= c;
                            CondArm {
                                condition: a.condition,
                                body,
                            }
                        })
                        .collect();
                    let else_body = else_body.map(|b| {
                        let (b, c) = self.normalize_stmts(b);
                        changed |= c;
                        b
                    });
                    out.push(HirStmt::If { arms, else_body });
                }
            }
            HirStmt::Case {
                selector,
                arms,
                else_body,
            } => {
                let selector = self.normalize_expr(selector, &mut out, &mut changed);
                let arms = arms
                    .into_iter()
                    .map(|a| {
                        let (body, c) = self.normalize_stmts(a.body);
                        changed |= c;
                        CaseArm {
                            labels: a.labels,
                            body,
                        }
                    })
                    .collect();
                let else_body = else_body.map(|b| {
                    let (b, c) = self.normalize_stmts(b);
                    changed |= c;
                    b
                });
                out.push(HirStmt::Case {
                    selector,
                    arms,
                    else_body,
                });
            }
            HirStmt::While { condition, body } => {
                let (mut body, c) = self.normalize_stmts(body);
                changed |= c;
                let condition = if expr_contains_yield(&condition) {
                    changed = true;
                    let mut head = Vec::new();
                    let cond = self.normalize_expr(condition, &mut head, &mut changed);
                    head.push(HirStmt::If {
                        arms: vec![CondArm {
                            condition: HirExpr::not(cond),
                            body: vec![HirStmt::Break { label: None }],
                        }],
                        else_body: None,
                    });
                    head.append(&mut body);
                    body = head;
                    HirExpr::truth(true)
                } else {
                    condition
                };
                out.push(HirStmt::While { condition, body });
            }
            HirStmt::Block { label, body } => {
                let (body, c) = self.normalize_stmts(body);
                changed |= c;
                out.push(HirStmt::Block { label, body });
            }
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                let (body, c) = self.normalize_stmts(body);
                changed |= c;
                let handlers = handlers
                    .into_iter()
                    .map(|h| {
                        let (body, c) = self.normalize_stmts(h.body);
                        changed |= c;
                        ExceptHandler {
                            exception_types: h.exception_types,
                            body,
                        }
                    })
                    .collect();
                let finally = finally.map(|f| {
                    let (f, c) = self.normalize_stmts(f);
                    changed |= c;
                    f
                });
                out.push(HirStmt::Try {
                    body,
                    handlers,
                    finally,
                });
            }
            // The remaining kinds carry no expressions that can hide a yield;
            // the guard above never lets them through.
            other => out.push(other),
        }
        (out, changed)
    }

    pub fn normalize_stmts(&mut self, stmts: Vec<HirStmt>) -> (Vec<HirStmt>, bool) {
        let mut out = Vec::new();
        let mut changed = false;
        for stmt in stmts {
            let (seq, c) = self.normalize_stmt(stmt);
            changed |= c;
            out.extend(seq);
        }
        (out, changed)
    }

    /// Rewrites `expr` into a yield-free value expression, pushing the
    /// statement parts (including the yields) onto `prelude`.
    fn normalize_expr(
        &mut self,
        expr: HirExpr,
        prelude: &mut Vec<HirStmt>,
        changed: &mut bool,
    ) -> HirExpr {
        if !expr_contains_yield(&expr) {
            return expr;
        }
        *changed = true;
        match expr {
            HirExpr::StmtListExpr { stmts, value } => {
                let (stmts, _) = self.normalize_stmts(stmts);
                prelude.extend(stmts);
                self.normalize_expr(*value, prelude, changed)
            }
            HirExpr::Binary { op, left, right } if op.is_lazy() => {
                self.lower_lazy_binary(op, *left, *right, prelude, changed)
            }
            HirExpr::Binary { op, left, right } => {
                let mut operands =
                    self.flatten_operands(vec![*left, *right], prelude, changed);
                let right = operands.pop().unwrap_or(HirExpr::nil());
                let left = operands.pop().unwrap_or(HirExpr::nil());
                HirExpr::binary(op, left, right)
            }
            HirExpr::Unary { op, operand } => HirExpr::Unary {
                op,
                operand: Box::new(self.normalize_expr(*operand, prelude, changed)),
            },
            HirExpr::Cast { ty, operand } => HirExpr::Cast {
                ty,
                operand: Box::new(self.normalize_expr(*operand, prelude, changed)),
            },
            HirExpr::Field { base, field } => HirExpr::Field {
                base: Box::new(self.normalize_expr(*base, prelude, changed)),
                field,
            },
            HirExpr::Index { base, index } => {
                let mut operands =
                    self.flatten_operands(vec![*base, *index], prelude, changed);
                let index = operands.pop().unwrap_or(HirExpr::nil());
                let base = operands.pop().unwrap_or(HirExpr::nil());
                HirExpr::Index {
                    base: Box::new(base),
                    index: Box::new(index),
                }
            }
            HirExpr::Call { func, args } => HirExpr::Call {
                func,
                args: self.flatten_operands(args, prelude, changed),
            },
            HirExpr::Tuple(args) => {
                HirExpr::Tuple(self.flatten_operands(args, prelude, changed))
            }
            HirExpr::Array(args) => {
                HirExpr::Array(self.flatten_operands(args, prelude, changed))
            }
            HirExpr::ObjConstr { ty, fields } => {
                let (names, exprs): (Vec<_>, Vec<_>) = fields.into_iter().unzip();
                let exprs = self.flatten_operands(exprs, prelude, changed);
                HirExpr::ObjConstr {
                    ty,
                    fields: names.into_iter().zip(exprs).collect(),
                }
            }
            HirExpr::IfExpr { arms, orelse } => {
                let tmp = self.ctx.fresh_temp(Type::Unknown);
                let chain = self.build_if_value_chain(arms, *orelse, &tmp, changed);
                prelude.extend(chain);
                self.ctx.access(&tmp)
            }
            HirExpr::CaseExpr {
                selector,
                arms,
                orelse,
            } => {
                let tmp = self.ctx.fresh_temp(Type::Unknown);
                let selector = self.normalize_expr(*selector, prelude, changed);
                let arms = arms
                    .into_iter()
                    .map(|(labels, value)| CaseArm {
                        labels,
                        body: self.value_into(&tmp, value, changed),
                    })
                    .collect();
                let else_body = self.value_into(&tmp, *orelse, changed);
                prelude.push(HirStmt::Case {
                    selector,
                    arms,
                    else_body: Some(else_body),
                });
                self.ctx.access(&tmp)
            }
            HirExpr::TryExpr {
                body,
                handlers,
                finally,
            } => {
                let tmp = self.ctx.fresh_temp(Type::Unknown);
                let body = self.value_into(&tmp, *body, changed);
                let handlers = handlers
                    .into_iter()
                    .map(|(exception_types, value)| ExceptHandler {
                        exception_types,
                        body: self.value_into(&tmp, value, changed),
                    })
                    .collect();
                let finally = finally.map(|f| self.normalize_stmts(f).0);
                prelude.push(HirStmt::Try {
                    body,
                    handlers,
                    finally,
                });
                self.ctx.access(&tmp)
            }
            // Terminal nodes cannot contain a yield; the guard filters them.
            other => other,
        }
    }

    /// Normalises `value` into statements that leave its result in `tmp`.
    fn value_into(&mut self, tmp: &str, value: HirExpr, changed: &mut bool) -> Vec<HirStmt> {
        let mut stmts = Vec::new();
        let value = self.normalize_expr(value, &mut stmts, changed);
        stmts.push(self.ctx.assign(tmp, value));
        stmts
    }

    /// `a and b` / `a or b` with a yield on the right: the right operand may
    /// only be evaluated when required, so it moves under an `if`.
    fn lower_lazy_binary(
        &mut self,
        op: BinOp,
        left: HirExpr,
        right: HirExpr,
        prelude: &mut Vec<HirStmt>,
        changed: &mut bool,
    ) -> HirExpr {
        let left = self.normalize_expr(left, prelude, changed);
        let tmp = self.ctx.fresh_temp(Type::Bool);
        prelude.push(self.ctx.assign(&tmp, left));
        let mut rhs = Vec::new();
        let right = self.normalize_expr(right, &mut rhs, changed);
        rhs.push(self.ctx.assign(&tmp, right));
        let condition = if matches!(op, BinOp::And) {
            self.ctx.access(&tmp)
        } else {
            HirExpr::not(self.ctx.access(&tmp))
        };
        prelude.push(HirStmt::If {
            arms: vec![CondArm {
                condition,
                body: rhs,
            }],
            else_body: None,
        });
        self.ctx.access(&tmp)
    }

    /// Argument-list rule: hoist offending children; with more than one
    /// argument, spill every non-literal argument into a temporary so
    /// left-to-right evaluation survives the split.
    fn flatten_operands(
        &mut self,
        args: Vec<HirExpr>,
        prelude: &mut Vec<HirStmt>,
        changed: &mut bool,
    ) -> Vec<HirExpr> {
        let spill_all = args.len() > 1;
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            let value = if expr_contains_yield(&arg) {
                self.normalize_expr(arg, prelude, changed)
            } else {
                arg
            };
            let value = if spill_all && !value.is_literal() {
                *changed = true;
                self.spill(value, prelude)
            } else {
                value
            };
            out.push(value);
        }
        out
    }

    fn spill(&mut self, value: HirExpr, prelude: &mut Vec<HirStmt>) -> HirExpr {
        let tmp = self.ctx.fresh_temp(Type::Unknown);
        prelude.push(self.ctx.assign(&tmp, value));
        self.ctx.access(&tmp)
    }

    fn build_if_chain(
        &mut self,
        mut arms: Vec<CondArm>,
        else_body: Option<Vec<HirStmt>>,
        changed: &mut bool,
    ) -> Vec<HirStmt> {
        if arms.is_empty() {
            return match else_body {
                Some(b) => {
                    let (b, c) = self.normalize_stmts(b);
                    *changed |= c;
                    b
                }
                None => Vec::new(),
            };
        }
        let arm = arms.remove(0);
        let mut out = Vec::new();
        let condition = self.normalize_expr(arm.condition, &mut out, changed);
        let (body, c) = self.normalize_stmts(arm.body);
        *changed |= c;
        let rest = self.build_if_chain(arms, else_body, changed);
        let else_body = if rest.is_empty() { None } else { Some(rest) };
        out.push(HirStmt::If {
            arms: vec![CondArm { condition, body }],
            else_body,
        });
        out
    }

    fn build_if_value_chain(
        &mut self,
        mut arms: Vec<(HirExpr, HirExpr)>,
        orelse: HirExpr,
        tmp: &str,
        changed: &mut bool,
    ) -> Vec<HirStmt> {
        if arms.is_empty() {
            return self.value_into(tmp, orelse, changed);
        }
        let (cond, value) = arms.remove(0);
        let mut out = Vec::new();
        let condition = self.normalize_expr(cond, &mut out, changed);
        let body = self.value_into(tmp, value, changed);
        let rest = self.build_if_value_chain(arms, orelse, tmp, changed);
        out.push(HirStmt::If {
            arms: vec![CondArm { condition, body }],
            else_body: Some(rest),
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EnvMode;
    use crate::hir::Literal;

    fn ctx() -> Ctx {
        Ctx::new(EnvMode::Locals, Type::Int)
    }

    fn yield_then(value: i64) -> HirExpr {
        HirExpr::StmtListExpr {
            stmts: vec![HirStmt::Yield(Some(HirExpr::int(1)))],
            value: Box::new(HirExpr::int(value)),
        }
    }

    #[test]
    fn test_clean_statement_is_untouched() {
        let mut ctx = ctx();
        let stmt = HirStmt::Expr(HirExpr::Call {
            func: "f".to_string(),
            args: vec![HirExpr::name("a")],
        });
        let (out, changed) = Normalizer::new(&mut ctx).normalize_stmt(stmt.clone());
        assert!(!changed);
        assert_eq!(out, vec![stmt]);
    }

    #[test]
    fn test_call_arguments_are_spilled_in_order() {
        let mut ctx = ctx();
        let stmt = HirStmt::Expr(HirExpr::Call {
            func: "f".to_string(),
            args: vec![HirExpr::name("a"), yield_then(2)],
        });
        let (out, changed) = Normalizer::new(&mut ctx).normalize_stmt(stmt);
        assert!(changed);
        // tmp := a, then the hoisted yield, then the call
        assert!(matches!(&out[0], HirStmt::Assign { .. }));
        assert!(matches!(&out[1], HirStmt::Yield(_)));
        let HirStmt::Expr(HirExpr::Call { args, .. }) = &out[2] else {
            panic!("expected the rebuilt call, got {:?}", out[2]);
        };
        // literal value needs no temporary; the spilled `a` does
        assert!(matches!(&args[0], HirExpr::Var(name) if name.starts_with(":tmp")));
        assert_eq!(args[1], HirExpr::int(2));
    }

    #[test]
    fn test_short_circuit_and_keeps_right_operand_conditional() {
        let mut ctx = ctx();
        let stmt = HirStmt::Expr(HirExpr::binary(
            BinOp::And,
            HirExpr::name("a"),
            HirExpr::StmtListExpr {
                stmts: vec![HirStmt::Yield(None)],
                value: Box::new(HirExpr::name("b")),
            },
        ));
        let (out, _) = Normalizer::new(&mut ctx).normalize_stmt(stmt);
        // tmp := a; if tmp: (yield; tmp := b)
        assert!(matches!(&out[0], HirStmt::Assign { .. }));
        let HirStmt::If { arms, else_body } = &out[1] else {
            panic!("expected the guard if, got {:?}", out[1]);
        };
        assert!(else_body.is_none());
        assert!(matches!(&arms[0].body[0], HirStmt::Yield(None)));
        assert!(matches!(&arms[0].body[1], HirStmt::Assign { .. }));
    }

    #[test]
    fn test_while_condition_moves_into_the_body() {
        let mut ctx = ctx();
        let stmt = HirStmt::While {
            condition: HirExpr::binary(BinOp::Eq, yield_then(2), HirExpr::int(2)),
            body: vec![HirStmt::Continue],
        };
        let (out, _) = Normalizer::new(&mut ctx).normalize_stmt(stmt);
        assert_eq!(out.len(), 1);
        let HirStmt::While { condition, body } = &out[0] else {
            panic!("expected a while, got {:?}", out[0]);
        };
        assert_eq!(*condition, HirExpr::truth(true));
        assert!(matches!(&body[0], HirStmt::Yield(_)));
        // the negated condition guards a break
        let HirStmt::If { arms, .. } = &body[1] else {
            panic!("expected the exit guard, got {:?}", body[1]);
        };
        assert!(matches!(&arms[0].body[0], HirStmt::Break { label: None }));
    }

    #[test]
    fn test_elif_condition_runs_only_when_reached() {
        let mut ctx = ctx();
        let stmt = HirStmt::If {
            arms: vec![
                CondArm {
                    condition: HirExpr::name("a"),
                    body: vec![HirStmt::Continue],
                },
                CondArm {
                    condition: HirExpr::binary(BinOp::Eq, yield_then(2), HirExpr::int(2)),
                    body: vec![HirStmt::Break { label: None }],
                },
            ],
            else_body: None,
        };
        let (out, _) = Normalizer::new(&mut ctx).normalize_stmt(stmt);
        assert_eq!(out.len(), 1);
        let HirStmt::If { arms, else_body } = &out[0] else {
            panic!("expected the outer if, got {:?}", out[0]);
        };
        assert_eq!(arms.len(), 1);
        assert_eq!(arms[0].condition, HirExpr::name("a"));
        // the second condition's yield lives inside the else arm
        let else_body = else_body.as_ref().expect("nested else");
        assert!(matches!(&else_body[0], HirStmt::Yield(_)));
        assert!(matches!(&else_body[1], HirStmt::If { .. }));
    }

    #[test]
    fn test_yield_operand_statements_are_hoisted_before_the_yield() {
        let mut ctx = ctx();
        let stmt = HirStmt::Yield(Some(yield_then(2)));
        let (out, _) = Normalizer::new(&mut ctx).normalize_stmt(stmt);
        assert!(matches!(&out[0], HirStmt::Yield(Some(v)) if *v == HirExpr::int(1)));
        assert!(matches!(&out[1], HirStmt::Yield(Some(v)) if *v == HirExpr::int(2)));
    }

    #[test]
    fn test_if_expression_collapses_into_a_temporary() {
        let mut ctx = ctx();
        let stmt = HirStmt::Assign {
            target: AssignTarget::Symbol("x".to_string()),
            value: HirExpr::IfExpr {
                arms: vec![(HirExpr::name("c"), yield_then(10))],
                orelse: Box::new(HirExpr::Literal(Literal::Int(20))),
            },
            fast: false,
        };
        let (out, _) = Normalizer::new(&mut ctx).normalize_stmt(stmt);
        let HirStmt::If { arms, else_body } = &out[0] else {
            panic!("expected the lowered if, got {:?}", out[0]);
        };
        assert!(matches!(&arms[0].body[0], HirStmt::Yield(_)));
        assert!(matches!(&arms[0].body[1], HirStmt::Assign { .. }));
        assert!(matches!(
            else_body.as_ref().map(|b| &b[0]),
            Some(HirStmt::Assign { .. })
        ));
        // the assignment now reads the shared temporary
        let HirStmt::Assign { value, .. } = &out[1] else {
            panic!("expected the original assignment, got {:?}", out[1]);
        };
        assert!(matches!(value, HirExpr::Var(name) if name.starts_with(":tmp")));
    }

    #[test]
    fn test_no_yield_after_normalisation() {
        let mut ctx = ctx();
        let stmt = HirStmt::Expr(HirExpr::Call {
            func: "f".to_string(),
            args: vec![
                yield_then(1),
                HirExpr::binary(BinOp::Or, HirExpr::name("a"), yield_then(2)),
            ],
        });
        let (out, _) = Normalizer::new(&mut ctx).normalize_stmt(stmt);
        assert!(out.iter().all(|s| !stmt_has_expr_yields(s)));
    }
}
