//! End-to-end scenarios exercising this crate's pieces together rather
//! than in isolation: operator dispatch specificity, JSON round-trips,
//! generator iteration, concurrent producers against one message queue,
//! and an FFI struct round-trip. S2 (GC liveness under repeated
//! collection) lives alongside the collector's own unit tests in
//! `loom_runtime::gc` instead of here, since it needs `AllocList`
//! internals no public API exposes.

use loom_core::{ClassId, Value, ValueKind};
use loom_runtime::class::ClassTable;
use loom_runtime::dispatch::OperatorTable;
use loom_runtime::ffi::{FfiType, StructTable, load, store};
use loom_runtime::generator::{Generator, GeneratorOutcome};
use loom_runtime::interpreter::Interpreter;
use loom_runtime::json;
use loom_runtime::queue::{Message, MessageQueue};
use std::sync::Arc;

/// S1: register `A + B -> fAB`, `A + A -> fAA` with `B <: A`. Dispatch
/// on `(A, B)` picks `fAB` over the less-specific `A + A`; after also
/// registering `B + B -> fBB`, `(B, B)` picks the new, more specific
/// match while `(A, B)` is unaffected.
#[test]
fn s1_operator_dispatch_specificity() {
    let classes = ClassTable::new();
    let a = classes.class_new(1, false, None);
    let b = classes.class_new(2, false, Some(a));

    let operators = OperatorTable::new();
    let op = 0u32;
    operators.with_group(op, |g| {
        g.register(a, b, 100); // fAB
        g.register(a, a, 200); // fAA
    });

    let is_subclass = |x: ClassId, y: ClassId| classes.is_subclass(x, y);
    let picked = operators.with_group(op, |g| g.dispatch(a, b, is_subclass));
    assert_eq!(picked, Some(100));

    operators.with_group(op, |g| g.register(b, b, 300)); // fBB
    let picked_bb = operators.with_group(op, |g| g.dispatch(b, b, is_subclass));
    assert_eq!(picked_bb, Some(300));
    let picked_ab_again = operators.with_group(op, |g| g.dispatch(a, b, is_subclass));
    assert_eq!(picked_ab_again, Some(100));
}

/// S3: parse a mixed JSON document, re-encode it, and parse the result
/// again — the round-trip is value-equal even though the textual form
/// need not be byte-identical (float formatting, key order).
#[test]
fn s3_json_round_trip() {
    let parsed = json::parse(r#"[1, 2.5, {"x": "hi"}, null, true]"#).unwrap();
    let ValueKind::Array(arr) = &parsed.kind else { panic!("expected array") };
    let items = arr.lock().unwrap();
    assert_eq!(items.len(), 5);
    assert_eq!(items[0].as_int(), Some(1));
    assert!(matches!(items[3].kind, ValueKind::Nil));
    assert!(matches!(items[4].kind, ValueKind::Bool(true)));

    let mut interp = Interpreter::new(Arc::new(ClassTable::new()), Arc::new(OperatorTable::new()));
    let mut encoder = json::Encoder::new(&mut interp, 1);
    let text = encoder.encode(&parsed).unwrap();
    let reparsed = json::parse(&text).unwrap();
    let ValueKind::Array(arr2) = &reparsed.kind else { panic!("expected array") };
    assert_eq!(arr2.lock().unwrap().len(), 5);
}

/// S4: a generator yielding 1, 2, 3 then returning produces three
/// `Yielded`s and a `Returned`; resuming again after completion is a
/// no-op that keeps reporting done.
#[test]
fn s4_generator_yields_then_completes() {
    let gen = Generator::spawn(|_first, yield_value| {
        yield_value(Value::int(1));
        yield_value(Value::int(2));
        yield_value(Value::int(3));
        Value::nil()
    });

    let mut seen = Vec::new();
    loop {
        match gen.resume(Value::nil()) {
            GeneratorOutcome::Yielded(v) => seen.push(v.as_int()),
            GeneratorOutcome::Returned(_) => break,
            GeneratorOutcome::Threw(_) => panic!("unexpected throw"),
        }
    }
    assert_eq!(seen, vec![Some(1), Some(2), Some(3)]);
    assert!(gen.is_done());

    match gen.resume(Value::nil()) {
        GeneratorOutcome::Returned(_) => {}
        other => panic!("expected a no-op Returned after completion, got {other:?}"),
    }
}

/// S5 (scaled down from N=16/10000 for test runtime): several producer
/// threads each enqueue a run of distinct ints; one consumer drains
/// until all are received. Every message is seen exactly once, and the
/// sequence from any single producer is observed in order.
#[test]
fn s5_concurrent_producers_single_consumer() {
    const PRODUCERS: i64 = 8;
    const PER_PRODUCER: i64 = 500;

    let queue = Arc::new(MessageQueue::new());
    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let queue = queue.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                queue.send(Message::Result(Value::int(p * 1_000_000 + i)));
            }
        }));
    }

    let total = (PRODUCERS * PER_PRODUCER) as usize;
    let mut last_seen = vec![-1i64; PRODUCERS as usize];
    let mut received = 0usize;
    while received < total {
        let Message::Result(v) = queue.recv() else { panic!("unexpected message kind") };
        let n = v.as_int().unwrap();
        let producer = (n / 1_000_000) as usize;
        let seq = n % 1_000_000;
        assert!(seq > last_seen[producer], "producer {producer}'s messages arrived out of order");
        last_seen[producer] = seq;
        received += 1;
    }

    for h in handles {
        h.join().unwrap();
    }
    assert!(queue.is_empty());
}

/// S6: a struct `{ int32, double, pointer }` round-trips through
/// `store`/`load` unchanged, element-wise.
#[test]
fn s6_ffi_struct_round_trip() {
    let structs = StructTable::new();
    let id = structs.define(vec![FfiType::Sint32, FfiType::Double, FfiType::Pointer]);

    let original = Value::new(ValueKind::Tuple(Arc::new(loom_core::TupleData {
        items: vec![Value::int(42), Value::float(3.14), Value::new(ValueKind::Ptr(loom_core::PtrData { addr: 0, extra: None }))],
        field_ids: None,
    })));

    let mut buf = vec![0u8; 32];
    store(FfiType::Struct(id), buf.as_mut_ptr(), &original, &structs).unwrap();
    let loaded = load(FfiType::Struct(id), buf.as_ptr(), &structs).unwrap();

    let ValueKind::Tuple(t) = &loaded.kind else { panic!("expected tuple") };
    assert_eq!(t.items[0].as_int(), Some(42));
    assert!(matches!(t.items[1].kind, ValueKind::Float(f) if (f - 3.14).abs() < 1e-9));
    assert!(matches!(t.items[2].kind, ValueKind::Ptr(p) if p.addr == 0));
}
