//! # Insertion Benchmarks
//!
//! Measures the slot-allocation path under different row shapes:
//!
//! | Case | Row | What it stresses |
//! |------|-----|------------------|
//! | fixed-row | bigint + integer + double | pure slot writes |
//! | varchar-row | bigint + 24-byte string | pool insert + handle write |
//! | reuse | insert/delete churn | free-list reuse over block growth |
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench insertion
//! cargo bench --bench insertion -- fixed
//! ```

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use tupleheap::{ColumnSpec, Schema, Table, Value, ValueType};

const ROWS: u64 = 10_000;

fn fixed_table() -> Table {
    let mut table = Table::new(256 * 1024);
    let schema = Arc::new(Schema::new(vec![
        ColumnSpec::fixed(ValueType::BigInt, false),
        ColumnSpec::fixed(ValueType::Integer, true),
        ColumnSpec::fixed(ValueType::Double, true),
    ]));
    table
        .initialize(schema, vec!["id".into(), "count".into(), "score".into()])
        .unwrap();
    table
}

fn varchar_table() -> Table {
    let mut table = Table::new(256 * 1024);
    let schema = Arc::new(Schema::new(vec![
        ColumnSpec::fixed(ValueType::BigInt, false),
        ColumnSpec::varchar(64, true),
    ]));
    table
        .initialize(schema, vec!["id".into(), "name".into()])
        .unwrap();
    table
}

fn bench_fixed_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("insertion");
    group.throughput(Throughput::Elements(ROWS));
    group.bench_function("fixed-row", |b| {
        b.iter_batched(
            fixed_table,
            |mut table| {
                for i in 0..ROWS as i64 {
                    table
                        .insert(&[
                            Value::BigInt(i),
                            Value::Integer(i as i32 & 0xFFFF),
                            Value::Double(i as f64 * 0.5),
                        ])
                        .unwrap();
                }
                table
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn bench_varchar_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("insertion");
    group.throughput(Throughput::Elements(ROWS));
    group.bench_function("varchar-row", |b| {
        b.iter_batched(
            varchar_table,
            |mut table| {
                for i in 0..ROWS as i64 {
                    table
                        .insert(&[
                            Value::BigInt(i),
                            Value::varchar(format!("payload-{:016}", i)),
                        ])
                        .unwrap();
                }
                table
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn bench_slot_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("insertion");
    group.throughput(Throughput::Elements(ROWS / 2));
    group.bench_function("reuse", |b| {
        b.iter_batched(
            || {
                let mut table = fixed_table();
                let addrs: Vec<_> = (0..ROWS as i64)
                    .map(|i| {
                        table
                            .insert(&[Value::BigInt(i), Value::Null, Value::Null])
                            .unwrap()
                    })
                    .collect();
                for addr in addrs.iter().step_by(2) {
                    table.free_slot(*addr).unwrap();
                }
                table
            },
            |mut table| {
                for i in 0..(ROWS as i64 / 2) {
                    table
                        .insert(&[Value::BigInt(i), Value::Null, Value::Null])
                        .unwrap();
                }
                table
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_fixed_rows,
    bench_varchar_rows,
    bench_slot_reuse
);
criterion_main!(benches);
