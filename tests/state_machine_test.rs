//! End-to-end scenarios: lower a generator body, then drive the result
//! through the resume loop and compare the produced element sequence.

use genlower::context::STATE_VAR;
use genlower::hir::{
    AssignTarget, BinOp, CaseArm, CondArm, ExceptHandler, HirExpr, HirFunction, HirParam,
    HirStmt, Type,
};
use genlower::interp::{IterDriver, Signal, Step, Value};
use genlower::{lower_closure_iterator, runtime, verify, EnvMode, Lowered};

fn generator(params: Vec<HirParam>, ret_type: Type, body: Vec<HirStmt>) -> HirFunction {
    HirFunction {
        name: "gen".to_string(),
        params: params.into_iter().collect(),
        ret_type,
        body,
        is_closure_iter: true,
    }
}

fn lower(body: Vec<HirStmt>) -> Lowered {
    let func = generator(vec![], Type::Int, body);
    let lowered = lower_closure_iterator(&func, EnvMode::Locals).expect("lowering succeeds");
    let issues = verify::structural_issues(&lowered);
    assert!(issues.is_empty(), "structural issues: {issues:?}");
    lowered
}

fn assign(name: &str, value: HirExpr) -> HirStmt {
    HirStmt::Assign {
        target: AssignTarget::Symbol(name.to_string()),
        value,
        fast: false,
    }
}

fn yield_int(v: i64) -> HirStmt {
    HirStmt::Yield(Some(HirExpr::int(v)))
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|&v| Value::Int(v)).collect()
}

#[test]
fn test_simple_countdown_loop() {
    // while a > 0: yield a; a := a - 1
    let lowered = lower(vec![HirStmt::While {
        condition: HirExpr::binary(BinOp::Gt, HirExpr::name("a"), HirExpr::int(0)),
        body: vec![
            HirStmt::Yield(Some(HirExpr::name("a"))),
            assign(
                "a",
                HirExpr::binary(BinOp::Sub, HirExpr::name("a"), HirExpr::int(1)),
            ),
        ],
    }]);
    let mut driver = IterDriver::new(&lowered);
    driver.seed("a", Value::Int(3));
    let (yields, _) = driver.drain(32).expect("drives");
    assert_eq!(yields, ints(&[3, 2, 1]));
}

#[test]
fn test_try_except_finally_with_yields_in_every_arm() {
    // try: yield 0; raise E
    // except: yield 1; return 3
    // finally: yield 2
    let lowered = lower(vec![HirStmt::Try {
        body: vec![
            yield_int(0),
            HirStmt::Raise(Some(runtime::new_exception("E"))),
        ],
        handlers: vec![ExceptHandler {
            exception_types: vec![],
            body: vec![yield_int(1), HirStmt::Return(Some(HirExpr::int(3)))],
        }],
        finally: Some(vec![yield_int(2)]),
    }]);
    // try-body states carry a negative entry naming the except state, the
    // except states a positive one naming the finally, the finally none
    assert_eq!(lowered.exception_table, vec![0, -2, 3, 0, -2, 3, 0, 0]);

    let mut driver = IterDriver::new(&lowered);
    let (yields, result) = driver.drain(32).expect("drives");
    assert_eq!(yields, ints(&[0, 1, 2]));
    assert_eq!(result, Value::Int(3));
}

#[test]
fn test_yield_inside_a_condition() {
    // if (yield 1; 2) == 2: yield 3
    let lowered = lower(vec![HirStmt::If {
        arms: vec![CondArm {
            condition: HirExpr::binary(
                BinOp::Eq,
                HirExpr::StmtListExpr {
                    stmts: vec![yield_int(1)],
                    value: Box::new(HirExpr::int(2)),
                },
                HirExpr::int(2),
            ),
            body: vec![yield_int(3)],
        }],
        else_body: None,
    }]);
    let mut driver = IterDriver::new(&lowered);
    let (yields, _) = driver.drain(32).expect("drives");
    assert_eq!(yields, ints(&[1, 3]));
}

#[test]
fn test_return_from_try_runs_the_finally() {
    // try: return 5 finally: yield 9
    let lowered = lower(vec![HirStmt::Try {
        body: vec![HirStmt::Return(Some(HirExpr::int(5)))],
        handlers: vec![],
        finally: Some(vec![yield_int(9)]),
    }]);
    let mut driver = IterDriver::new(&lowered);
    let (yields, result) = driver.drain(32).expect("drives");
    assert_eq!(yields, ints(&[9]));
    assert_eq!(result, Value::Int(5));
}

#[test]
fn test_broken_out_block_elides_its_forwarding_state() {
    // block B: break B
    // yield 7
    let lowered = lower(vec![
        HirStmt::Block {
            label: Some("B".to_string()),
            body: vec![HirStmt::Break {
                label: Some("B".to_string()),
            }],
        },
        yield_int(7),
    ]);
    // entry and exit only; the forwarding continuation is gone
    assert_eq!(lowered.state_count, 2);
    let mut driver = IterDriver::new(&lowered);
    let (yields, _) = driver.drain(8).expect("drives");
    assert_eq!(yields, ints(&[7]));
}

#[test]
fn test_labelled_break_across_nested_whiles() {
    // block L: while true: while true: yield 1; break L
    let lowered = lower(vec![HirStmt::Block {
        label: Some("L".to_string()),
        body: vec![HirStmt::While {
            condition: HirExpr::truth(true),
            body: vec![HirStmt::While {
                condition: HirExpr::truth(true),
                body: vec![
                    yield_int(1),
                    HirStmt::Break {
                        label: Some("L".to_string()),
                    },
                ],
            }],
        }],
    }]);
    let mut driver = IterDriver::new(&lowered);
    let (yields, _) = driver.drain(8).expect("drives");
    assert_eq!(yields, ints(&[1]));
}

#[test]
fn test_unmatched_exception_runs_finally_then_propagates() {
    // try: yield 0; raise A except B: yield 91 finally: yield 2
    let lowered = lower(vec![HirStmt::Try {
        body: vec![
            yield_int(0),
            HirStmt::Raise(Some(runtime::new_exception("A"))),
        ],
        handlers: vec![ExceptHandler {
            exception_types: vec!["B".to_string()],
            body: vec![yield_int(91)],
        }],
        finally: Some(vec![yield_int(2)]),
    }]);
    let mut driver = IterDriver::new(&lowered);
    assert_eq!(driver.resume().expect("first"), Step::Yielded(Value::Int(0)));
    assert_eq!(
        driver.resume().expect("second"),
        Step::Yielded(Value::Int(2))
    );
    match driver.resume() {
        Err(Signal::Raised(exc)) => assert_eq!(exc.kind, "A"),
        other => panic!("expected the exception to propagate, got {other:?}"),
    }
}

#[test]
fn test_matching_handler_resumes_after_the_try() {
    // try: yield 0; raise A except A: yield 91 finally: yield 2
    // yield 5
    let lowered = lower(vec![
        HirStmt::Try {
            body: vec![
                yield_int(0),
                HirStmt::Raise(Some(runtime::new_exception("A"))),
            ],
            handlers: vec![ExceptHandler {
                exception_types: vec!["A".to_string()],
                body: vec![yield_int(91)],
            }],
            finally: Some(vec![yield_int(2)]),
        },
        yield_int(5),
    ]);
    let mut driver = IterDriver::new(&lowered);
    let (yields, _) = driver.drain(32).expect("drives");
    assert_eq!(yields, ints(&[0, 91, 2, 5]));
}

#[test]
fn test_nested_finally_chain_preserves_the_pending_return() {
    // try:
    //   try: yield 1; return 10
    //   finally: yield 2
    // finally: yield 3
    let lowered = lower(vec![HirStmt::Try {
        body: vec![HirStmt::Try {
            body: vec![yield_int(1), HirStmt::Return(Some(HirExpr::int(10)))],
            handlers: vec![],
            finally: Some(vec![yield_int(2)]),
        }],
        handlers: vec![],
        finally: Some(vec![yield_int(3)]),
    }]);
    let mut driver = IterDriver::new(&lowered);
    let (yields, result) = driver.drain(32).expect("drives");
    assert_eq!(yields, ints(&[1, 2, 3]));
    assert_eq!(result, Value::Int(10));
}

#[test]
fn test_case_statement_with_yielding_arms() {
    let case = HirStmt::Case {
        selector: HirExpr::name("x"),
        arms: vec![
            CaseArm {
                labels: vec![genlower::hir::Literal::Int(1), genlower::hir::Literal::Int(2)],
                body: vec![yield_int(10)],
            },
            CaseArm {
                labels: vec![genlower::hir::Literal::Int(3)],
                body: vec![yield_int(30)],
            },
        ],
        else_body: Some(vec![yield_int(99)]),
    };
    let lowered = lower(vec![case]);
    let mut driver = IterDriver::new(&lowered);
    driver.seed("x", Value::Int(3));
    let (yields, _) = driver.drain(8).expect("drives");
    assert_eq!(yields, ints(&[30]));

    let mut driver = IterDriver::new(&lowered);
    driver.seed("x", Value::Int(7));
    let (yields, _) = driver.drain(8).expect("drives");
    assert_eq!(yields, ints(&[99]));
}

#[test]
fn test_exception_without_any_try_propagates_immediately() {
    let lowered = lower(vec![
        yield_int(1),
        HirStmt::Raise(Some(runtime::new_exception("Boom"))),
    ]);
    let mut driver = IterDriver::new(&lowered);
    assert_eq!(driver.resume().expect("first"), Step::Yielded(Value::Int(1)));
    match driver.resume() {
        Err(Signal::Raised(exc)) => assert_eq!(exc.kind, "Boom"),
        other => panic!("expected propagation, got {other:?}"),
    }
}

#[test]
fn test_lifted_mode_produces_field_accesses_and_no_declarations() {
    let func = generator(
        vec![HirParam::new("n", Type::Int)],
        Type::Int,
        vec![yield_int(1), yield_int(2)],
    );
    let lowered = lower_closure_iterator(
        &func,
        EnvMode::Lifted {
            env_param: ":env".to_string(),
        },
    )
    .expect("lowering succeeds");
    assert_eq!(lowered.env_fields[0].0, STATE_VAR);
    let json = serde_json::to_string(&lowered.func.body).expect("serializes");
    assert!(json.contains(":env"));
    assert!(!json.contains("VarDecl"));
}
