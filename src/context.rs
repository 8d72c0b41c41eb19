//! The context threaded through every component of the pass.
//!
//! Owns the synthetic environment variables, the scope-tracking counters and
//! the growing state list with its parallel exception table. States reference
//! each other by integer index, so ownership stays tree-shaped.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{LowerError, LowerResult};
use crate::hir::{AssignTarget, HirExpr, HirStmt, Symbol, Type};

/// Persisted dispatch state. Always the first environment field.
pub const STATE_VAR: &str = ":state";
/// Saved operand of a `return` that must first unwind through a finally.
pub const TMP_RESULT_VAR: &str = ":tmpResult";
/// True while unwinding toward a finally.
pub const UNROLL_FINALLY_VAR: &str = ":unrollFinally";
/// The currently propagating exception; nil when none.
pub const CUR_EXC_VAR: &str = ":curExc";
/// The slot a suspended yield publishes its value through.
pub const RESULT_VAR: &str = ":result";
/// Label of the dispatch block; `break :stateLoop` re-enters the dispatcher.
pub const STATE_LOOP_LABEL: &str = ":stateLoop";

const TEMP_PREFIX: &str = ":tmp";

/// Where the synthetic variables live, decided once per transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvMode {
    /// Closure conversion has not run yet: plain locals, declared in a block
    /// the emitter prepends; lifting will relocate them later.
    Locals,
    /// Closure conversion already ran: new fields on the environment object,
    /// accessed through the environment parameter.
    Lifted { env_param: Symbol },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub body: Vec<HirStmt>,
}

#[derive(Debug)]
pub struct Ctx {
    pub mode: EnvMode,
    vars: IndexMap<Symbol, Type>,
    temp_id: u32,
    /// State index of the enclosing finally, or -1.
    pub nearest_finally: i32,
    /// Exception-table encoding active for states created right now.
    pub cur_exc_handling_state: i32,
    pub states: Vec<State>,
    pub exc_table: Vec<i16>,
    pub has_exceptions: bool,
    /// Index of the exit state, assigned by the empty-state eliminator.
    pub exit_state_idx: i32,
    pub ret_type: Type,
}

impl Ctx {
    pub fn new(mode: EnvMode, ret_type: Type) -> Self {
        let mut ctx = Self {
            mode,
            vars: IndexMap::new(),
            temp_id: 0,
            nearest_finally: -1,
            cur_exc_handling_state: 0,
            states: Vec::new(),
            exc_table: Vec::new(),
            has_exceptions: false,
            exit_state_idx: -1,
            ret_type,
        };
        // The code generator relies on :state being the first field.
        ctx.ensure_var(STATE_VAR, Type::Int);
        ctx
    }

    /// Idempotent: the first call fixes the variable's type and position.
    pub fn ensure_var(&mut self, name: &str, ty: Type) {
        if !self.vars.contains_key(name) {
            self.vars.insert(name.to_string(), ty);
        }
    }

    pub fn ensure_result_var(&mut self) {
        let ty = self.ret_type.clone();
        self.ensure_var(TMP_RESULT_VAR, ty);
    }

    pub fn fresh_temp(&mut self, ty: Type) -> Symbol {
        let name = format!("{}{}", TEMP_PREFIX, self.temp_id);
        self.temp_id += 1;
        self.ensure_var(&name, ty);
        name
    }

    /// Read access to a managed variable, mode-aware.
    pub fn access(&self, name: &str) -> HirExpr {
        match &self.mode {
            EnvMode::Locals => HirExpr::Var(name.to_string()),
            EnvMode::Lifted { env_param } => HirExpr::Field {
                base: Box::new(HirExpr::Var(env_param.clone())),
                field: name.to_string(),
            },
        }
    }

    /// Assignment to a managed variable, mode-aware.
    pub fn assign(&self, name: &str, value: HirExpr) -> HirStmt {
        let target = match &self.mode {
            EnvMode::Locals => AssignTarget::Symbol(name.to_string()),
            EnvMode::Lifted { env_param } => AssignTarget::Field {
                base: Box::new(HirExpr::Var(env_param.clone())),
                field: name.to_string(),
            },
        };
        HirStmt::Assign {
            target,
            value,
            fast: false,
        }
    }

    pub fn assign_state(&self, idx: i32) -> HirStmt {
        self.assign(STATE_VAR, HirExpr::int(i64::from(idx)))
    }

    /// The yield result slot is the caller-visible result symbol, not an
    /// environment field; the code generator resolves it.
    pub fn assign_result(&self, value: HirExpr) -> HirStmt {
        HirStmt::Assign {
            target: AssignTarget::Symbol(RESULT_VAR.to_string()),
            value,
            fast: false,
        }
    }

    /// Creates a state and its exception-table entry in lockstep.
    pub fn new_state(&mut self, body: Vec<HirStmt>) -> LowerResult<i32> {
        if self.states.len() >= i16::MAX as usize {
            return Err(LowerError::TooManyStates(self.states.len()));
        }
        let idx = self.states.len() as i32;
        let entry = i16::try_from(self.cur_exc_handling_state)
            .map_err(|_| LowerError::TooManyStates(self.states.len()))?;
        self.states.push(State { body });
        self.exc_table.push(entry);
        tracing::trace!(state = idx, handler = entry, "created state");
        Ok(idx)
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Declaration block for `Locals` mode; empty when lifted.
    pub fn declared_vars(&self) -> Vec<HirStmt> {
        match self.mode {
            EnvMode::Locals => self
                .vars
                .iter()
                .map(|(name, ty)| HirStmt::VarDecl {
                    name: name.clone(),
                    ty: ty.clone(),
                    init: None,
                    mutable: true,
                })
                .collect(),
            EnvMode::Lifted { .. } => Vec::new(),
        }
    }

    /// Fields to add to the closure environment in `Lifted` mode.
    pub fn env_fields(&self) -> Vec<(Symbol, Type)> {
        match self.mode {
            EnvMode::Locals => Vec::new(),
            EnvMode::Lifted { .. } => self
                .vars
                .iter()
                .map(|(name, ty)| (name.clone(), ty.clone()))
                .collect(),
        }
    }
}
