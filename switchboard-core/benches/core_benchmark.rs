use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use switchboard_core::{
    pointer, ArrayMutator, Operation, Replicant, ReplicantKey, ReplicantOptions, Schema, ValueTree,
};
use uuid::Uuid;

fn bench_pointer_encode(c: &mut Criterion) {
    let segments = vec!["teams", "a/b", "players", "~tilde", "42"];
    c.bench_function("pointer_encode_5_segments", |b| {
        b.iter(|| black_box(pointer::encode(black_box(&segments))))
    });
}

fn bench_pointer_decode(c: &mut Criterion) {
    let encoded = pointer::encode(&["teams", "a/b", "players", "~tilde", "42"]);
    c.bench_function("pointer_decode_5_segments", |b| {
        b.iter(|| black_box(pointer::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_operation_json(c: &mut Criterion) {
    let op = Operation::mutate(
        "/rundown/items",
        ArrayMutator::Splice,
        vec![json!(3), json!(1), json!({"id": "seg-7", "duration": 95})],
    );
    c.bench_function("operation_json_roundtrip", |b| {
        b.iter(|| {
            let text = serde_json::to_string(black_box(&op)).unwrap();
            black_box(serde_json::from_str::<Operation>(&text).unwrap());
        })
    });
}

fn bench_tree_apply(c: &mut Criterion) {
    let items: Vec<_> = (0..1000).map(|i| json!({"id": i, "label": format!("item {i}")})).collect();
    let mut tree = ValueTree::with_value(Uuid::new_v4(), Some(json!({"items": items})));
    let push = Operation::mutate("/items", ArrayMutator::Push, vec![json!({"id": -1})]);
    let pop = Operation::mutate("/items", ArrayMutator::Pop, vec![]);

    c.bench_function("tree_push_pop_1000_items", |b| {
        b.iter(|| {
            tree.apply(black_box(&push)).unwrap();
            tree.apply(black_box(&pop)).unwrap();
        })
    });
}

fn bench_tree_import_export(c: &mut Criterion) {
    let items: Vec<_> = (0..1000).map(|i| json!({"id": i, "tags": ["a", "b"]})).collect();
    let value = json!({"items": items});

    c.bench_function("tree_import_export_1000_items", |b| {
        b.iter(|| {
            let tree = ValueTree::with_value(Uuid::new_v4(), Some(black_box(value.clone())));
            black_box(tree.value());
        })
    });
}

fn bench_schema_validate(c: &mut Criterion) {
    let schema = Schema::new(json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {"id": {"type": "integer"}, "tags": {"type": "array", "items": {"type": "string"}}},
                    "required": ["id"]
                }
            }
        }
    }))
    .unwrap();
    let items: Vec<_> = (0..1000).map(|i| json!({"id": i, "tags": ["a", "b"]})).collect();
    let value = json!({"items": items});

    c.bench_function("schema_validate_1000_items", |b| {
        b.iter(|| black_box(schema.is_valid(black_box(&value))))
    });
}

fn bench_authority_write_flush(c: &mut Criterion) {
    let replicant = Replicant::authority(
        ReplicantKey::new("bench", "scores"),
        ReplicantOptions::default().with_default(json!({"home": 0, "away": 0})),
        None,
        None,
    )
    .unwrap();
    let root = replicant.root().unwrap();
    let mut n = 0i64;

    c.bench_function("authority_write_and_flush", |b| {
        b.iter(|| {
            n += 1;
            root.set("home", n).unwrap();
            replicant.flush_operations();
        })
    });
}

criterion_group!(
    benches,
    bench_pointer_encode,
    bench_pointer_decode,
    bench_operation_json,
    bench_tree_apply,
    bench_tree_import_export,
    bench_schema_validate,
    bench_authority_write_flush,
);
criterion_main!(benches);
