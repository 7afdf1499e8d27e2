//! End-to-end tests against the public `Engine` API.
//!
//! Unlike `engine.rs`'s own `#[cfg(test)]` module, these only use what a
//! front end sees through `caliper_annotation::*` — no access to private
//! fields or helper methods.

use std::sync::{Arc, Barrier};
use std::thread;

use caliper_annotation::{
    AttributeProperties, AttributeType, Engine, EngineConfig, RecordValue, TextSink,
};

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

#[test]
fn full_round_trip_through_the_public_api() {
    let engine = engine();
    let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
    let iteration = engine.create_attribute(
        "iteration",
        AttributeType::UInt,
        AttributeProperties::STORE_AS_VALUE,
    );

    engine.begin(0, &function, b"main").unwrap();
    engine.begin(0, &function, b"compute").unwrap();
    engine.set(0, &iteration, &3u64.to_le_bytes()).unwrap();

    assert_eq!(engine.context_size(0), 2);

    let mut buf = [0u64; 8];
    let written = engine.get_context(0, &mut buf);
    let records = engine.unpack(&buf[..written * 2]);

    let function_frames: Vec<_> = records
        .iter()
        .filter(|r| r.attribute == function)
        .collect();
    assert_eq!(function_frames.len(), 2);
    assert_eq!(function_frames[0].value, RecordValue::Bytes(b"compute".to_vec()));
    assert_eq!(function_frames[1].value, RecordValue::Bytes(b"main".to_vec()));

    let iteration_frame = records.iter().find(|r| r.attribute == iteration).unwrap();
    assert_eq!(iteration_frame.value, RecordValue::Immediate(3));

    engine.set(0, &iteration, &4u64.to_le_bytes()).unwrap();
    let mut buf2 = [0u64; 8];
    let written2 = engine.get_context(0, &mut buf2);
    let records2 = engine.unpack(&buf2[..written2 * 2]);
    let updated = records2.iter().find(|r| r.attribute == iteration).unwrap();
    assert_eq!(updated.value, RecordValue::Immediate(4));

    engine.end(0, &function).unwrap();
    engine.end(0, &function).unwrap();
    engine.end(0, &iteration).unwrap();
    assert_eq!(engine.context_size(0), 0);
}

#[test]
fn global_attributes_are_visible_from_every_environment() {
    let engine = engine();
    let phase = engine.create_attribute("phase", AttributeType::String, AttributeProperties::GLOBAL);
    engine.begin(0, &phase, b"warmup").unwrap();

    let env1 = engine.clone_environment(0);
    let env2 = engine.clone_environment(0);

    assert_eq!(engine.context_size(env1), 1);
    assert_eq!(engine.context_size(env2), 1);

    let mut buf = [0u64; 2];
    engine.get_context(env2, &mut buf);
    let records = engine.unpack(&buf);
    assert_eq!(records[0].value, RecordValue::Bytes(b"warmup".to_vec()));
}

#[test]
fn write_nodes_and_write_attributes_stream_the_full_registry_and_tree() {
    let engine = engine();
    let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
    engine.begin(0, &function, b"main").unwrap();
    engine.begin(0, &function, b"inner").unwrap();

    let mut attribute_sink = TextSink::default();
    engine.write_attributes(&mut attribute_sink);
    assert_eq!(attribute_sink.lines.len(), 1);
    assert!(attribute_sink.lines[0].contains("function"));

    let mut node_sink = TextSink::default();
    engine.write_nodes(&mut node_sink);
    // root + "main" + "inner"
    assert_eq!(node_sink.lines.len(), 3);
    assert!(node_sink.lines.iter().any(|l| l.contains("main")));
    assert!(node_sink.lines.iter().any(|l| l.contains("inner")));
}

#[test]
fn begin_is_idempotent_under_repeated_identical_nesting() {
    let engine = engine();
    let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());

    let mut buf = [0u64; 2];

    engine.begin(0, &function, b"main").unwrap();
    engine.end(0, &function).unwrap();
    engine.begin(0, &function, b"main").unwrap();
    engine.get_context(0, &mut buf);
    let first_id = buf[1];

    engine.end(0, &function).unwrap();
    engine.begin(0, &function, b"main").unwrap();
    engine.get_context(0, &mut buf);
    let second_id = buf[1];

    assert_eq!(first_id, second_id);
}

#[test]
fn unknown_attribute_is_rejected_by_every_mutator() {
    let engine = engine();
    let bogus = caliper_annotation::Attribute::invalid();
    assert!(engine.begin(0, &bogus, b"x").is_err());
    assert!(engine.set(0, &bogus, b"x").is_err());
    assert!(engine.end(0, &bogus).is_err());
}

#[test]
fn many_threads_sharing_one_engine_never_deadlock_or_corrupt_the_tree() {
    let engine = Arc::new(engine());
    let function = Arc::new(engine.create_attribute(
        "function",
        AttributeType::String,
        AttributeProperties::empty(),
    ));
    let thread_count = 8;
    let barrier = Arc::new(Barrier::new(thread_count));

    let handles: Vec<_> = (0..thread_count)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let function = Arc::clone(&function);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let env = engine.clone_environment(0);
                barrier.wait();
                for _ in 0..200 {
                    engine.begin(env, &function, format!("frame-{i}").as_bytes()).unwrap();
                    let _ = engine.context_size(env);
                    engine.end(env, &function).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("worker thread panicked");
    }

    // Every thread interned the same distinct value exactly once.
    let mut sink = TextSink::default();
    engine.write_nodes(&mut sink);
    assert_eq!(sink.lines.len(), 1 + thread_count);
}
