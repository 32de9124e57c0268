//! Host-predicate and pool tests against the real engine binary.
//!
//! These need `libtpl.wasm`; point `TREALLA_WASM` at it to run them.

use trealla::{Atom, Config, Error, Interpreter, Pool, PoolConfig, Runtime, Term, Variable};

fn runtime() -> Option<Runtime> {
    let path = std::env::var_os("TREALLA_WASM")?;
    Some(Runtime::from_file(path).expect("failed to compile engine module"))
}

fn interpreter(runtime: &Runtime) -> Interpreter {
    Interpreter::new(runtime, Config::default()).expect("failed to boot interpreter")
}

macro_rules! require_engine {
    () => {
        match runtime() {
            Some(runtime) => runtime,
            None => {
                eprintln!("set TREALLA_WASM to run engine tests");
                return;
            }
        }
    };
}

/// RFC 4648 base32, enough for the test fixture.
fn base32(input: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::new();
    for chunk in input.chunks(5) {
        let mut buffer = [0u8; 5];
        buffer[..chunk.len()].copy_from_slice(chunk);
        let bits = u64::from_be_bytes([
            0, 0, 0, buffer[0], buffer[1], buffer[2], buffer[3], buffer[4],
        ]);
        let digits = (chunk.len() * 8).div_ceil(5);
        for i in 0..digits {
            let shift = 35 - 5 * i;
            out.push(ALPHABET[((bits >> shift) & 0x1f) as usize] as char);
        }
        for _ in digits..8 {
            out.push('=');
        }
    }
    out
}

#[test]
fn deterministic_host_predicate_unifies_its_reply() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    pl.register("base32", 2, |_pl, _subquery, goal| {
        let Term::Compound(call) = goal else {
            return trealla::term::type_error("compound", goal.clone(), Term::atom("base32"));
        };
        let Term::Str(input) = &call.args[0] else {
            return trealla::term::type_error(
                "list",
                call.args[0].clone(),
                Atom::new("/").of([Term::atom("base32"), Term::Int(2)]),
            );
        };
        Atom::new("base32")
            .of([call.args[0].clone(), Term::string(base32(input.as_bytes()))])
            .into()
    })
    .unwrap();

    let answer = pl.query_once(r#"base32("hello", X)."#).unwrap();
    assert_eq!(answer.solution.get("X"), Some(&Term::string("NBSWY3DP")));
}

#[test]
fn host_predicate_can_run_nested_queries() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    pl.register("interop_test", 1, |pl, _subquery, goal| {
        let Term::Compound(call) = goal else {
            panic!("unexpected goal shape: {goal}");
        };
        assert_eq!(call.args[0], Term::Var(Variable::new("A")));

        let answer = pl.query_once("X is 1 + 1.").unwrap();
        Atom::new("interop_test")
            .of([answer.solution.get("X").unwrap().clone()])
            .into()
    })
    .unwrap();

    let answer = pl.query_once("interop_test(X).").unwrap();
    assert_eq!(answer.solution.get("X"), Some(&Term::Int(2)));
}

#[test]
fn host_predicate_failure_and_throw_continuations() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    pl.register("always_fail", 0, |_pl, _subquery, _goal| Term::atom("fail"))
        .unwrap();
    assert!(pl.query_once("always_fail.").unwrap_err().is_failure());

    pl.register("always_throw", 0, |_pl, _subquery, _goal| {
        trealla::term::throw_term(Term::atom("kaboom"))
    })
    .unwrap();
    match pl.query_once("always_throw.").unwrap_err() {
        Error::Throw { ball, .. } => assert_eq!(ball, Term::atom("kaboom")),
        other => panic!("expected throw, got {other}"),
    }
}

#[test]
fn host_predicate_panic_becomes_system_error() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    pl.register("explode", 0, |_pl, _subquery, _goal| panic!("boom"))
        .unwrap();

    match pl.query_once("explode.").unwrap_err() {
        Error::Throw { ball, .. } => {
            let text = ball.to_string();
            assert!(text.contains("system_error"), "unexpected ball: {text}");
            assert!(text.contains("boom"), "unexpected ball: {text}");
        }
        other => panic!("expected throw, got {other}"),
    }

    // The interpreter survives the panic.
    assert!(pl.query_once("true.").is_ok());
}

#[test]
fn unknown_host_predicate_is_an_existence_error() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    // host_rpc routes through host-call; nothing is registered for it.
    match pl.query_once("host_rpc(never_registered(1)).").unwrap_err() {
        Error::Throw { ball, .. } => {
            let text = ball.to_string();
            assert!(text.contains("existence_error"), "unexpected ball: {text}");
        }
        other => panic!("expected throw, got {other}"),
    }
}

#[test]
fn nondet_predicate_drains_through_backtracking() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    pl.register_nondet("countdown", 2, |_pl, _subquery, goal| {
        let Term::Compound(call) = goal else {
            return Box::new(std::iter::empty());
        };
        let Term::Int(n) = call.args[0] else {
            return Box::new(std::iter::empty());
        };
        let functor = call.functor.clone();
        Box::new((0..n).map(move |i| Term::from(functor.clone().of([Term::Int(n), Term::Int(i)]))))
    })
    .unwrap();

    let mut values = Vec::new();
    for answer in pl.query("countdown(10, X).") {
        values.push(answer.unwrap().solution.get("X").cloned().unwrap());
    }
    assert_eq!(values, (0..10).map(Term::Int).collect::<Vec<_>>());
}

#[test]
fn nondet_sequence_stops_early_on_cut() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    pl.register_nondet("naturals", 1, |_pl, _subquery, goal| {
        let Term::Compound(call) = goal else {
            return Box::new(std::iter::empty());
        };
        let functor = call.functor.clone();
        // An unbounded sequence; the engine must stop pulling once the
        // choice point is cut.
        Box::new((0i64..).map(move |i| Term::from(functor.clone().of([Term::Int(i)]))))
    })
    .unwrap();

    let answer = pl.query_once("naturals(X), X > 2, !.").unwrap();
    assert_eq!(answer.solution.get("X"), Some(&Term::Int(3)));

    // And the interpreter keeps working afterwards.
    assert!(pl.query_once("true.").is_ok());
}

#[test]
fn crypto_data_hash_builtin() {
    let runtime = require_engine!();
    let pl = interpreter(&runtime);

    let answer = pl
        .query_once(r#"crypto_data_hash("foo", X, [algorithm(A)])."#)
        .unwrap();
    assert_eq!(
        answer.solution.get("X"),
        Some(&Term::string(
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        ))
    );
    assert_eq!(answer.solution.get("A"), Some(&Term::atom("sha256")));

    let err = pl
        .query_once(r#"crypto_data_hash("foo", X, [algorithm(md5)])."#)
        .unwrap_err();
    match err {
        Error::Throw { ball, .. } => {
            assert!(ball.to_string().contains("domain_error"));
        }
        other => panic!("expected throw, got {other}"),
    }
}

#[test]
fn pool_reads_observe_completed_writes() {
    let runtime = require_engine!();
    let pool = Pool::new(
        &runtime,
        PoolConfig {
            replicas: 4,
            config: Config::default(),
        },
    )
    .unwrap();

    pool.write_tx(|pl| pl.consult_text("user", "test(123)."))
        .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..100 {
            scope.spawn(|| {
                pool.read_tx(|pl| {
                    let answer = pl.query_once("test(X).")?;
                    assert_eq!(answer.solution.get("X"), Some(&Term::Int(123)));
                    Ok(())
                })
                .unwrap();
            });
        }
    });
}

#[test]
fn failed_pool_writes_leave_replicas_unchanged() {
    let runtime = require_engine!();
    let pool = Pool::new(
        &runtime,
        PoolConfig {
            replicas: 2,
            config: Config::default(),
        },
    )
    .unwrap();

    pool.write_tx(|pl| pl.consult_text("user", "stable(1)."))
        .unwrap();

    let result: Result<(), Error> = pool.write_tx(|pl| {
        pl.query_once("assertz(leaked(1)).")?;
        // The transaction fails after mutating the canon; replicas must
        // not pick the write up.
        Err(Error::Config {
            message: "rollback".into(),
        })
    });
    assert!(result.is_err());

    pool.read_tx(|pl| {
        assert!(pl.query_once("leaked(1).").unwrap_err().is_failure());
        let answer = pl.query_once("stable(X).")?;
        assert_eq!(answer.solution.get("X"), Some(&Term::Int(1)));
        Ok(())
    })
    .unwrap();
}
