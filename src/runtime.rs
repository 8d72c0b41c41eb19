//! Names and call shapes of the generator runtime services.
//!
//! The pass resolves every auxiliary service by symbol name at the AST level;
//! these are the only names the emitted code depends on. Their semantics live
//! in the runtime (the test evaluator implements the same contract).

use crate::hir::{HirExpr, HirStmt, Literal};

/// Returns the currently propagating exception, or nil.
pub const GET_CURRENT_EXCEPTION: &str = "getCurrentException";

/// Registers the `:curExc` slot with the runtime at the top of each resume.
pub const SETUP_EXCEPTION: &str = "closureIterSetupExc";

/// `excMatches(getCurrentException(), "T")` - the `is-of` test of an except
/// branch.
pub const EXC_MATCHES: &str = "excMatches";

/// Constructs an exception value of the named kind.
pub const NEW_EXCEPTION: &str = "newException";

pub fn get_current_exception() -> HirExpr {
    HirExpr::Call {
        func: GET_CURRENT_EXCEPTION.to_string(),
        args: vec![],
    }
}

pub fn setup_exception(slot: HirExpr) -> HirStmt {
    HirStmt::Expr(HirExpr::Call {
        func: SETUP_EXCEPTION.to_string(),
        args: vec![slot],
    })
}

pub fn exc_matches(kind: &str) -> HirExpr {
    HirExpr::Call {
        func: EXC_MATCHES.to_string(),
        args: vec![
            get_current_exception(),
            HirExpr::Literal(Literal::String(kind.to_string())),
        ],
    }
}

pub fn new_exception(kind: &str) -> HirExpr {
    HirExpr::Call {
        func: NEW_EXCEPTION.to_string(),
        args: vec![HirExpr::Literal(Literal::String(kind.to_string()))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exc_matches_shape() {
        let expr = exc_matches("IoError");
        let HirExpr::Call { func, args } = expr else {
            panic!("expected a call");
        };
        assert_eq!(func, EXC_MATCHES);
        assert_eq!(args.len(), 2);
        assert!(matches!(&args[0], HirExpr::Call { func, .. } if func == GET_CURRENT_EXCEPTION));
    }
}
