//! Query throughput benchmarks. Need `TREALLA_WASM` pointing at the
//! engine binary; without it the benchmarks are skipped.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use trealla::{Config, Interpreter, Runtime};

fn bench_queries(c: &mut Criterion) {
    let Some(path) = std::env::var_os("TREALLA_WASM") else {
        eprintln!("set TREALLA_WASM to run engine benchmarks");
        return;
    };
    let runtime = Runtime::from_file(path).expect("failed to compile engine module");
    let pl = Interpreter::new(&runtime, Config::default()).expect("failed to boot interpreter");
    pl.consult_text("user", "test(123).").expect("consult failed");

    c.bench_function("query_once", |b| {
        b.iter(|| black_box(pl.query_once("test(X).").unwrap()))
    });

    c.bench_function("query_iterate_10", |b| {
        b.iter(|| {
            let mut count = 0;
            for answer in pl.query("between(1, 10, X).") {
                black_box(answer.unwrap());
                count += 1;
            }
            assert_eq!(count, 10);
        })
    });

    c.bench_function("fork", |b| b.iter(|| black_box(pl.fork().unwrap())));
}

criterion_group!(benches, bench_queries);
criterion_main!(benches);
