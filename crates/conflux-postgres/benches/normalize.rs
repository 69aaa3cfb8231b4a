use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use conflux_postgres::{
    encode_copy_rows, ColumnDescriptor, ColumnType, ConflictAction, TableModel, UpsertOptions,
};
use serde_json::{json, Value as JsonValue};

fn model() -> TableModel {
    TableModel::builder("foos")
        .column(ColumnDescriptor::new("id", ColumnType::Text).primary_key())
        .column(ColumnDescriptor::new("name", ColumnType::Text))
        .column(ColumnDescriptor::new("score", ColumnType::Double))
        .column(
            ColumnDescriptor::new("data", ColumnType::Jsonb)
                .field("my_data_field")
                .on_conflict(ConflictAction::MergeJsonb),
        )
        .timestamps("createdAt", "updatedAt")
        .build()
        .unwrap()
}

fn records(n: usize) -> Vec<JsonValue> {
    (0..n)
        .map(|i| {
            json!({
                "id": format!("foo{}", i),
                "name": format!("Foo, \"{}\"", i),
                "score": i as f64 * 0.5,
                "data": {"tags": ["a", "b"], "n": i},
            })
        })
        .collect()
}

fn benchmark_build_instance(c: &mut Criterion) {
    let model = model();
    let record = records(1).remove(0);
    c.bench_function("build_instance", |b| {
        b.iter(|| black_box(model.build_instance(black_box(&record)).unwrap()));
    });
}

fn benchmark_encode_copy_rows(c: &mut Criterion) {
    let model = model();
    let options = UpsertOptions::default();
    let mut group = c.benchmark_group("encode_copy_rows");
    for size in [100usize, 1_000, 10_000] {
        let batch = records(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| black_box(encode_copy_rows(&model, batch, &options).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_build_instance, benchmark_encode_copy_rows);
criterion_main!(benches);
