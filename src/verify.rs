//! Structural invariants of a lowered generator.
//!
//! Reusable checks shared by unit and property tests: every dispatch arm
//! terminates, no yield or goto-state survives, and the exception table is
//! parallel to the state list with entries in range.

use crate::context::STATE_LOOP_LABEL;
use crate::hir::{stmts_contain_yield, CaseArm, HirStmt};
use crate::Lowered;

/// Returns everything wrong with the lowered shape; empty means sound.
pub fn structural_issues(lowered: &Lowered) -> Vec<String> {
    let mut issues = Vec::new();

    match dispatch_arms(&lowered.func.body) {
        Some(arms) => {
            if arms.len() != lowered.state_count {
                issues.push(format!(
                    "dispatch has {} arms for {} states",
                    arms.len(),
                    lowered.state_count
                ));
            }
            for (i, arm) in arms.iter().enumerate() {
                if !terminates(&arm.body) {
                    issues.push(format!("state {i} can fall through its body"));
                }
            }
        }
        None => issues.push("no dispatch case found in the emitted body".to_string()),
    }

    if stmts_contain_yield(&lowered.func.body) {
        issues.push("a yield survived lowering".to_string());
    }
    if body_has_goto(&lowered.func.body) {
        issues.push("a goto-state survived materialisation".to_string());
    }

    if lowered.exception_table.len() != lowered.state_count {
        issues.push(format!(
            "exception table has {} entries for {} states",
            lowered.exception_table.len(),
            lowered.state_count
        ));
    }
    for (i, &entry) in lowered.exception_table.iter().enumerate() {
        let handler = i64::from(entry).unsigned_abs() as usize;
        if entry != 0 && (handler == 0 || handler >= lowered.state_count) {
            issues.push(format!("state {i} names invalid handler {entry}"));
        }
    }

    issues
}

/// Digs the dispatch case out of the emitted shell.
fn dispatch_arms(body: &[HirStmt]) -> Option<&[CaseArm]> {
    let [HirStmt::While { body, .. }] = body else {
        return None;
    };
    let [HirStmt::Block { body, .. }] = body.as_slice() else {
        return None;
    };
    match body.last()? {
        HirStmt::Case { arms, .. } => Some(arms),
        HirStmt::Try { body, .. } => match body.last()? {
            HirStmt::Case { arms, .. } => Some(arms),
            _ => None,
        },
        _ => None,
    }
}

/// Every path through a state body must end in a return, a raise, or a
/// break back to the dispatch loop.
fn terminates(body: &[HirStmt]) -> bool {
    match body.last() {
        Some(HirStmt::Return(_) | HirStmt::Raise(_)) => true,
        Some(HirStmt::Break { label: Some(l) }) => l == STATE_LOOP_LABEL,
        Some(HirStmt::If { arms, else_body }) => {
            arms.iter().all(|a| terminates(&a.body))
                && else_body.as_deref().is_some_and(terminates)
        }
        Some(HirStmt::Case {
            arms, else_body, ..
        }) => {
            arms.iter().all(|a| terminates(&a.body))
                && else_body.as_deref().is_some_and(terminates)
        }
        Some(HirStmt::Block { body, .. }) => terminates(body),
        Some(HirStmt::Try { body, .. }) => terminates(body),
        _ => false,
    }
}

fn body_has_goto(stmts: &[HirStmt]) -> bool {
    stmts.iter().any(|stmt| match stmt {
        HirStmt::GotoState(_) => true,
        HirStmt::If { arms, else_body } => {
            arms.iter().any(|a| body_has_goto(&a.body))
                || else_body.as_deref().is_some_and(body_has_goto)
        }
        HirStmt::Case {
            arms, else_body, ..
        } => {
            arms.iter().any(|a| body_has_goto(&a.body))
                || else_body.as_deref().is_some_and(body_has_goto)
        }
        HirStmt::While { body, .. } | HirStmt::Block { body, .. } => body_has_goto(body),
        HirStmt::Try {
            body,
            handlers,
            finally,
        } => {
            body_has_goto(body)
                || handlers.iter().any(|h| body_has_goto(&h.body))
                || finally.as_deref().is_some_and(body_has_goto)
        }
        _ => false,
    })
}
