//! Structural execution of lowered bodies, plus the resume driver.
//!
//! The engine evaluates the *output* language of the pass: ordinary
//! structured control flow, labelled blocks, host-level try/except/finally,
//! arrays and indexing (the exception table), and the runtime services the
//! emitter calls by name. It deliberately knows nothing about suspension -
//! that is the point of the transform. `IterDriver` is the caller loop from
//! the design: one invocation per element, dispatching on the persisted
//! `:state`.
//!
//! Exceptions of the executed program travel as `Signal::Raised` and are
//! catchable; engine misuse (an unknown builtin, a yield that survived
//! lowering) travels as `Signal::Fault` and never is, so broken lowerings
//! fail tests loudly instead of being swallowed by the very machinery under
//! test.

use fnv::FnvHashMap;

use crate::context::{RESULT_VAR, STATE_VAR};
use crate::hir::{
    AssignTarget, BinOp, CaseArm, HirExpr, HirStmt, Literal, Symbol, Type, UnaryOp,
};
use crate::runtime;
use crate::Lowered;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcValue {
    pub kind: Symbol,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Unit,
    Seq(Vec<Value>),
    Exc(ExcValue),
}

impl Value {
    fn default_for(ty: &Type) -> Value {
        match ty {
            Type::Int | Type::Int16 => Value::Int(0),
            Type::Float => Value::Float(0.0),
            Type::Bool => Value::Bool(false),
            Type::String => Value::Str(String::new()),
            _ => Value::Unit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// An exception of the executed program; catchable by its tries.
    Raised(ExcValue),
    /// Engine-level misuse; propagates through everything.
    Fault(String),
}

fn fault(msg: impl Into<String>) -> Signal {
    Signal::Fault(msg.into())
}

type Exec<T> = Result<T, Signal>;

#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Normal,
    Break(Option<Symbol>),
    Continue,
    Return(Option<Value>),
}

#[derive(Debug, Default)]
pub struct Interp {
    pub vars: FnvHashMap<Symbol, Value>,
    current_exc: Option<ExcValue>,
}

impl Interp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exec_block(&mut self, stmts: &[HirStmt]) -> Exec<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &HirStmt) -> Exec<Flow> {
        match stmt {
            HirStmt::Expr(e) => {
                self.eval(e)?;
                Ok(Flow::Normal)
            }
            HirStmt::VarDecl { name, ty, init, .. } => {
                match init {
                    Some(e) => {
                        let value = self.eval(e)?;
                        self.vars.insert(name.clone(), value);
                    }
                    // a bare declaration must not clobber persisted state
                    None => {
                        if !self.vars.contains_key(name) {
                            self.vars.insert(name.clone(), Value::default_for(ty));
                        }
                    }
                }
                Ok(Flow::Normal)
            }
            HirStmt::Assign { target, value, .. } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
                Ok(Flow::Normal)
            }
            HirStmt::Return(e) => {
                let value = match e {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                Ok(Flow::Return(value))
            }
            HirStmt::Raise(Some(e)) => {
                let value = self.eval(e)?;
                match value {
                    Value::Exc(exc) => {
                        self.current_exc = Some(exc.clone());
                        Err(Signal::Raised(exc))
                    }
                    other => Err(fault(format!("raise of a non-exception value {other:?}"))),
                }
            }
            HirStmt::Raise(None) => match self.current_exc.clone() {
                Some(exc) => Err(Signal::Raised(exc)),
                None => Err(fault("re-raise without an active exception")),
            },
            HirStmt::Yield(_) => Err(fault("yield reached the evaluator; lowering is incomplete")),
            HirStmt::If { arms, else_body } => {
                for arm in arms {
                    if self.truthy(&arm.condition)? {
                        return self.exec_block(&arm.body);
                    }
                }
                match else_body {
                    Some(body) => self.exec_block(body),
                    None => Ok(Flow::Normal),
                }
            }
            HirStmt::Case {
                selector,
                arms,
                else_body,
            } => {
                let selector = self.eval(selector)?;
                match Self::select_arm(arms, &selector) {
                    Some(body) => self.exec_block(body),
                    None => match else_body {
                        Some(body) => self.exec_block(body),
                        None => Err(fault(format!("no case arm matches {selector:?}"))),
                    },
                }
            }
            HirStmt::While { condition, body } => loop {
                if !self.truthy(condition)? {
                    return Ok(Flow::Normal);
                }
                match self.exec_block(body)? {
                    Flow::Normal | Flow::Continue => {}
                    Flow::Break(None) => return Ok(Flow::Normal),
                    Flow::Break(label) => return Ok(Flow::Break(label)),
                    flow @ Flow::Return(_) => return Ok(flow),
                }
            },
            HirStmt::Block { label, body } => match self.exec_block(body)? {
                Flow::Break(None) => Ok(Flow::Normal),
                Flow::Break(Some(l)) if Some(&l) == label.as_ref() => Ok(Flow::Normal),
                flow => Ok(flow),
            },
            HirStmt::Break { label } => Ok(Flow::Break(label.clone())),
            HirStmt::Continue => Ok(Flow::Continue),
            HirStmt::Try {
                body,
                handlers,
                finally,
            } => {
                let outcome = match self.exec_block(body) {
                    Err(Signal::Raised(exc)) => {
                        let handler = handlers.iter().find(|h| {
                            h.exception_types.is_empty()
                                || h.exception_types.contains(&exc.kind)
                        });
                        match handler {
                            Some(h) => {
                                self.current_exc = Some(exc);
                                self.exec_block(&h.body)
                            }
                            None => Err(Signal::Raised(exc)),
                        }
                    }
                    other => other,
                };
                if let Some(finally) = finally {
                    // a finally that breaks, returns or raises wins
                    match self.exec_block(finally)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                outcome
            }
            HirStmt::For { .. } => Err(fault("for loop in executed code")),
            HirStmt::GotoState(_) => Err(fault("goto-state reached the evaluator")),
        }
    }

    fn select_arm<'b>(arms: &'b [CaseArm], selector: &Value) -> Option<&'b [HirStmt]> {
        arms.iter()
            .find(|arm| arm.labels.iter().any(|l| lit_matches(l, selector)))
            .map(|arm| arm.body.as_slice())
    }

    fn assign(&mut self, target: &AssignTarget, value: Value) -> Exec<()> {
        match target {
            AssignTarget::Symbol(name) => {
                self.vars.insert(name.clone(), value);
                Ok(())
            }
            AssignTarget::Index { base, index } => {
                let HirExpr::Var(name) = base.as_ref() else {
                    return Err(fault("indexed assignment needs a named base"));
                };
                let index = match self.eval(index)? {
                    Value::Int(i) => i,
                    other => return Err(fault(format!("non-integer index {other:?}"))),
                };
                match self.vars.get_mut(name) {
                    Some(Value::Seq(items)) => {
                        let slot = usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| fault(format!("index {index} out of bounds")))?;
                        *slot = value;
                        Ok(())
                    }
                    _ => Err(fault(format!("{name} is not indexable"))),
                }
            }
            AssignTarget::Field { .. } => {
                Err(fault("field assignment requires a lowered environment object"))
            }
        }
    }

    fn truthy(&mut self, condition: &HirExpr) -> Exec<bool> {
        match self.eval(condition)? {
            Value::Bool(b) => Ok(b),
            other => Err(fault(format!("non-boolean condition {other:?}"))),
        }
    }

    pub fn eval(&mut self, expr: &HirExpr) -> Exec<Value> {
        match expr {
            HirExpr::Literal(lit) => Ok(lit_value(lit)),
            HirExpr::Var(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| fault(format!("undefined variable {name}"))),
            HirExpr::Field { .. } => {
                Err(fault("field access requires a lowered environment object"))
            }
            HirExpr::Index { base, index } => {
                let base = self.eval(base)?;
                let index = match self.eval(index)? {
                    Value::Int(i) => i,
                    other => return Err(fault(format!("non-integer index {other:?}"))),
                };
                match base {
                    Value::Seq(items) => usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .ok_or_else(|| fault(format!("index {index} out of bounds"))),
                    other => Err(fault(format!("cannot index {other:?}"))),
                }
            }
            HirExpr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            HirExpr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match (op, value) {
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, Value::Int(n)) => Ok(Value::Int(-n)),
                    (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                    (op, value) => Err(fault(format!("cannot apply {op:?} to {value:?}"))),
                }
            }
            HirExpr::Call { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call_builtin(func, values)
            }
            HirExpr::Tuple(items) | HirExpr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::Seq(values))
            }
            HirExpr::ObjConstr { ty, .. } => {
                Err(fault(format!("object construction of {ty} is not executable here")))
            }
            HirExpr::Cast { ty, operand } => {
                let value = self.eval(operand)?;
                match (ty, value) {
                    (Type::Float, Value::Int(n)) => Ok(Value::Float(n as f64)),
                    (Type::Int | Type::Int16, Value::Float(f)) => Ok(Value::Int(f as i64)),
                    (_, value) => Ok(value),
                }
            }
            HirExpr::StmtListExpr { stmts, value } => match self.exec_block(stmts)? {
                Flow::Normal => self.eval(value),
                flow => Err(fault(format!(
                    "control flow {flow:?} escaped a statement-list expression"
                ))),
            },
            HirExpr::IfExpr { arms, orelse } => {
                for (condition, value) in arms {
                    if self.truthy(condition)? {
                        return self.eval(value);
                    }
                }
                self.eval(orelse)
            }
            HirExpr::CaseExpr {
                selector,
                arms,
                orelse,
            } => {
                let selector = self.eval(selector)?;
                for (labels, value) in arms {
                    if labels.iter().any(|l| lit_matches(l, &selector)) {
                        return self.eval(value);
                    }
                }
                self.eval(orelse)
            }
            HirExpr::TryExpr {
                body,
                handlers,
                finally,
            } => {
                let outcome = match self.eval(body) {
                    Err(Signal::Raised(exc)) => {
                        let handler = handlers
                            .iter()
                            .find(|(types, _)| types.is_empty() || types.contains(&exc.kind));
                        match handler {
                            Some((_, value)) => {
                                self.current_exc = Some(exc);
                                self.eval(value)
                            }
                            None => Err(Signal::Raised(exc)),
                        }
                    }
                    other => other,
                };
                if let Some(finally) = finally {
                    match self.exec_block(finally)? {
                        Flow::Normal => {}
                        flow => {
                            return Err(fault(format!(
                                "control flow {flow:?} escaped a try expression finally"
                            )))
                        }
                    }
                }
                outcome
            }
            HirExpr::Lambda { .. } => Err(fault("nested routines are not executable here")),
        }
    }

    fn eval_binary(&mut self, op: BinOp, left: &HirExpr, right: &HirExpr) -> Exec<Value> {
        if op.is_lazy() {
            let left = match self.eval(left)? {
                Value::Bool(b) => b,
                other => return Err(fault(format!("non-boolean operand {other:?}"))),
            };
            let shortcut = match op {
                BinOp::And => !left,
                _ => left,
            };
            if shortcut {
                return Ok(Value::Bool(left));
            }
            return match self.eval(right)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(fault(format!("non-boolean operand {other:?}"))),
            };
        }
        let left = self.eval(left)?;
        let right = self.eval(right)?;
        apply_binop(op, left, right)
    }

    fn call_builtin(&mut self, func: &str, mut args: Vec<Value>) -> Exec<Value> {
        match func {
            runtime::GET_CURRENT_EXCEPTION => Ok(match &self.current_exc {
                Some(exc) => Value::Exc(exc.clone()),
                None => Value::Unit,
            }),
            runtime::SETUP_EXCEPTION => {
                self.current_exc = match args.first() {
                    Some(Value::Exc(exc)) => Some(exc.clone()),
                    _ => None,
                };
                Ok(Value::Unit)
            }
            runtime::EXC_MATCHES => match (args.first(), args.get(1)) {
                (Some(Value::Exc(exc)), Some(Value::Str(kind))) => {
                    Ok(Value::Bool(exc.kind == *kind))
                }
                (Some(Value::Unit), Some(Value::Str(_))) => Ok(Value::Bool(false)),
                _ => Err(fault("excMatches expects an exception and a kind name")),
            },
            runtime::NEW_EXCEPTION => match args.pop() {
                Some(Value::Str(kind)) => Ok(Value::Exc(ExcValue { kind })),
                _ => Err(fault("newException expects a kind name")),
            },
            other => Err(fault(format!("unknown function {other}"))),
        }
    }
}

fn lit_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::Str(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::None => Value::Unit,
    }
}

fn lit_matches(lit: &Literal, value: &Value) -> bool {
    &lit_value(lit) == value
}

fn apply_binop(op: BinOp, left: Value, right: Value) -> Exec<Value> {
    use Value::{Float, Int};
    let value = match (op, &left, &right) {
        (BinOp::Add, Int(a), Int(b)) => Int(a + b),
        (BinOp::Sub, Int(a), Int(b)) => Int(a - b),
        (BinOp::Mul, Int(a), Int(b)) => Int(a * b),
        (BinOp::Div, Int(a), Int(b)) if *b != 0 => Int(a / b),
        (BinOp::Mod, Int(a), Int(b)) if *b != 0 => Int(a.rem_euclid(*b)),
        (BinOp::Add, Float(a), Float(b)) => Float(a + b),
        (BinOp::Sub, Float(a), Float(b)) => Float(a - b),
        (BinOp::Mul, Float(a), Float(b)) => Float(a * b),
        (BinOp::Div, Float(a), Float(b)) => Float(a / b),
        (BinOp::Div | BinOp::Mod, Int(_), Int(0)) => {
            return Err(Signal::Raised(ExcValue {
                kind: "DivByZero".to_string(),
            }))
        }
        (BinOp::Eq, _, _) => Value::Bool(left == right),
        (BinOp::NotEq, _, _) => Value::Bool(left != right),
        (BinOp::Lt, Int(a), Int(b)) => Value::Bool(a < b),
        (BinOp::LtEq, Int(a), Int(b)) => Value::Bool(a <= b),
        (BinOp::Gt, Int(a), Int(b)) => Value::Bool(a > b),
        (BinOp::GtEq, Int(a), Int(b)) => Value::Bool(a >= b),
        (BinOp::Lt, Float(a), Float(b)) => Value::Bool(a < b),
        (BinOp::Gt, Float(a), Float(b)) => Value::Bool(a > b),
        _ => {
            return Err(fault(format!(
                "cannot apply {op:?} to {left:?} and {right:?}"
            )))
        }
    };
    Ok(value)
}

/// One resumption outcome of the generator.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Yielded(Value),
    Finished(Value),
}

/// The caller loop: invokes the lowered body once per element. All state
/// lives in the variable store, which persists across resumptions the way a
/// closure environment would.
#[derive(Debug)]
pub struct IterDriver {
    pub interp: Interp,
    body: Vec<HirStmt>,
}

impl IterDriver {
    pub fn new(lowered: &Lowered) -> Self {
        Self {
            interp: Interp::new(),
            body: lowered.func.body.clone(),
        }
    }

    /// Pre-seeds a captured variable, the way the closure constructor would.
    pub fn seed(&mut self, name: &str, value: Value) {
        self.interp.vars.insert(name.to_string(), value);
    }

    pub fn resume(&mut self) -> Result<Step, Signal> {
        let flow = self.interp.exec_block(&self.body)?;
        match flow {
            Flow::Return(value) => {
                let state = match self.interp.vars.get(STATE_VAR) {
                    Some(Value::Int(n)) => *n,
                    other => return Err(fault(format!("missing :state after resume: {other:?}"))),
                };
                if state == -1 {
                    Ok(Step::Finished(value.unwrap_or(Value::Unit)))
                } else {
                    Ok(Step::Yielded(
                        self.interp
                            .vars
                            .get(RESULT_VAR)
                            .cloned()
                            .unwrap_or(Value::Unit),
                    ))
                }
            }
            other => Err(fault(format!("generator body ended with {other:?}"))),
        }
    }

    /// Runs to completion, collecting yields; faults if the generator does
    /// not finish within `max_steps` resumptions.
    pub fn drain(&mut self, max_steps: usize) -> Result<(Vec<Value>, Value), Signal> {
        let mut yields = Vec::new();
        for _ in 0..max_steps {
            match self.resume()? {
                Step::Yielded(v) => yields.push(v),
                Step::Finished(v) => return Ok((yields, v)),
            }
        }
        Err(fault("generator did not finish within the step budget"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::CondArm;

    fn assign(name: &str, value: HirExpr) -> HirStmt {
        HirStmt::Assign {
            target: AssignTarget::Symbol(name.to_string()),
            value,
            fast: false,
        }
    }

    #[test]
    fn test_while_with_labelled_break() {
        let mut interp = Interp::new();
        interp.vars.insert("x".to_string(), Value::Int(0));
        let flow = interp
            .exec_block(&[HirStmt::Block {
                label: Some("out".to_string()),
                body: vec![HirStmt::While {
                    condition: HirExpr::truth(true),
                    body: vec![
                        assign(
                            "x",
                            HirExpr::binary(BinOp::Add, HirExpr::name("x"), HirExpr::int(1)),
                        ),
                        HirStmt::If {
                            arms: vec![CondArm {
                                condition: HirExpr::binary(
                                    BinOp::Eq,
                                    HirExpr::name("x"),
                                    HirExpr::int(3),
                                ),
                                body: vec![HirStmt::Break {
                                    label: Some("out".to_string()),
                                }],
                            }],
                            else_body: None,
                        },
                    ],
                }],
            }])
            .expect("runs");
        assert_eq!(flow, Flow::Normal);
        assert_eq!(interp.vars.get("x"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_try_catches_matching_kind() {
        let mut interp = Interp::new();
        let flow = interp
            .exec_block(&[HirStmt::Try {
                body: vec![HirStmt::Raise(Some(runtime::new_exception("IoError")))],
                handlers: vec![crate::hir::ExceptHandler {
                    exception_types: vec!["IoError".to_string()],
                    body: vec![HirStmt::Return(Some(HirExpr::int(1)))],
                }],
                finally: None,
            }])
            .expect("caught");
        assert_eq!(flow, Flow::Return(Some(Value::Int(1))));
    }

    #[test]
    fn test_finally_runs_on_break_and_return() {
        let mut interp = Interp::new();
        interp.vars.insert("log".to_string(), Value::Int(0));
        let bump = assign(
            "log",
            HirExpr::binary(BinOp::Add, HirExpr::name("log"), HirExpr::int(1)),
        );
        let flow = interp
            .exec_block(&[HirStmt::Try {
                body: vec![HirStmt::Return(Some(HirExpr::int(9)))],
                handlers: vec![],
                finally: Some(vec![bump]),
            }])
            .expect("runs");
        assert_eq!(flow, Flow::Return(Some(Value::Int(9))));
        assert_eq!(interp.vars.get("log"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_unhandled_exception_propagates() {
        let mut interp = Interp::new();
        let err = interp
            .exec_block(&[HirStmt::Try {
                body: vec![HirStmt::Raise(Some(runtime::new_exception("A")))],
                handlers: vec![crate::hir::ExceptHandler {
                    exception_types: vec!["B".to_string()],
                    body: vec![],
                }],
                finally: None,
            }])
            .expect_err("no handler matches");
        assert_eq!(
            err,
            Signal::Raised(ExcValue {
                kind: "A".to_string()
            })
        );
    }

    #[test]
    fn test_exception_table_lookup_shape() {
        // the emitter's table access: array literal indexed by :state
        let mut interp = Interp::new();
        interp.vars.insert(STATE_VAR.to_string(), Value::Int(2));
        let value = interp
            .eval(&HirExpr::Index {
                base: Box::new(HirExpr::Array(vec![
                    HirExpr::int(0),
                    HirExpr::int(-3),
                    HirExpr::int(4),
                ])),
                index: Box::new(HirExpr::name(STATE_VAR)),
            })
            .expect("lookup");
        assert_eq!(value, Value::Int(4));
    }

    #[test]
    fn test_setup_exception_restores_and_clears() {
        let mut interp = Interp::new();
        interp
            .call_builtin(
                runtime::SETUP_EXCEPTION,
                vec![Value::Exc(ExcValue {
                    kind: "E".to_string(),
                })],
            )
            .expect("setup");
        let current = interp
            .call_builtin(runtime::GET_CURRENT_EXCEPTION, vec![])
            .expect("read");
        assert!(matches!(current, Value::Exc(_)));
        interp
            .call_builtin(runtime::SETUP_EXCEPTION, vec![Value::Unit])
            .expect("clear");
        let current = interp
            .call_builtin(runtime::GET_CURRENT_EXCEPTION, vec![])
            .expect("read");
        assert_eq!(current, Value::Unit);
    }

    #[test]
    fn test_yield_in_executed_code_is_a_fault() {
        let mut interp = Interp::new();
        let err = interp
            .exec_block(&[HirStmt::Yield(None)])
            .expect_err("yields must not survive lowering");
        assert!(matches!(err, Signal::Fault(_)));
    }

    #[test]
    fn test_redeclaration_preserves_persisted_state() {
        let mut interp = Interp::new();
        interp.vars.insert(STATE_VAR.to_string(), Value::Int(4));
        interp
            .exec_block(&[HirStmt::VarDecl {
                name: STATE_VAR.to_string(),
                ty: Type::Int,
                init: None,
                mutable: true,
            }])
            .expect("runs");
        assert_eq!(interp.vars.get(STATE_VAR), Some(&Value::Int(4)));
    }
}
