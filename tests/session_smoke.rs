//! End-to-end session smoke test: multiple producer threads through the TLS
//! recording API, down to trace files and the manifest.

use tracer_rs::event::EventKind;
use tracer_rs::lane::LaneConfig;
use tracer_rs::registry::RegistryConfig;
use tracer_rs::session::{self, SessionConfig, TraceSession};
use tracer_rs::writer::read_index_file;
use tracer_rs::DrainConfig;

use std::path::Path;
use std::sync::Mutex;

// Sessions bind the process-wide registry; run one at a time.
static SESSION_LOCK: Mutex<()> = Mutex::new(());

const PRODUCERS: u64 = 3;
const EVENTS_PER_PRODUCER: u64 = 2_000;

// Distinct function-id namespaces per producer so file contents reveal both
// the owning thread and the production order.
fn function_id(producer: u64, seq: u64) -> u64 {
    (producer + 1) * 10_000_000 + seq
}

#[test]
fn events_survive_the_full_pipeline_in_order() {
    let _guard = SESSION_LOCK.lock().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let session_dir = dir.path().join("session");

    let mut session = TraceSession::new(SessionConfig {
        directory: session_dir.clone(),
        registry: RegistryConfig {
            capacity: 8,
            index_lane: LaneConfig {
                rings: 8,
                ring_capacity: 64,
                record_size: tracer_rs::event::INDEX_EVENT_SIZE as u32,
            },
            detail_lane: LaneConfig {
                rings: 4,
                ring_capacity: 8,
                record_size: tracer_rs::event::DETAIL_EVENT_SIZE as u32,
            },
            backpressure: Default::default(),
        },
        drain: DrainConfig {
            poll_interval_us: 50,
            max_batch_size: 8,
            fairness_quantum: 8,
            yield_on_idle: false,
        },
        reporter: None,
    })
    .unwrap();

    let libc_open = session.symbols().register_symbol("/usr/lib/libc.so", "open");
    let same_open = session.symbols().register_symbol("/USR/LIB/libc.so", "open");
    assert_eq!(libc_open, same_open);

    session.start().unwrap();

    let workers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            std::thread::spawn(move || {
                for seq in 0..EVENTS_PER_PRODUCER {
                    session::record_enter(function_id(producer, seq));
                    // Brief breather so the drain keeps pace on slow machines.
                    if seq % 64 == 0 {
                        std::thread::yield_now();
                    }
                }
                // TLS handle drops here: the tail ring is flushed.
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    session.stop().unwrap();

    // One thread directory per producer, each internally ordered.
    let mut arrived_total = 0u64;
    let mut producers_seen = std::collections::BTreeSet::new();

    for slot in 0..8u32 {
        let path = session_dir.join(format!("thread_{slot}/index.atf"));
        if !path.exists() {
            continue;
        }
        let (header, events) = read_index_file(&path).unwrap();
        assert_eq!(header.event_count as usize, events.len());
        assert!(!events.is_empty());

        // All events in one file belong to one producer namespace...
        let producer = events[0].function_id / 10_000_000 - 1;
        producers_seen.insert(producer);

        // ...and arrive in production order. Drops (oldest-ring reclaim)
        // may thin the sequence but never reorder it.
        let mut last_seq = None;
        for event in &events {
            assert_eq!(event.kind, EventKind::Enter);
            assert_eq!(event.function_id / 10_000_000 - 1, producer);
            assert_eq!(event.thread_id, header.thread_id);
            let seq = event.function_id % 10_000_000;
            if let Some(last) = last_seq {
                assert!(seq > last, "order violated: {seq} after {last}");
            }
            last_seq = Some(seq);
        }
        arrived_total += events.len() as u64;
    }

    assert_eq!(producers_seen.len(), PRODUCERS as usize);
    assert!(arrived_total > 0);
    assert!(arrived_total <= PRODUCERS * EVENTS_PER_PRODUCER);

    verify_manifest(&session_dir);
}

fn verify_manifest(session_dir: &Path) {
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(session_dir.join("manifest.json")).unwrap()).unwrap();

    assert_eq!(manifest["format_version"], "1.0.0");
    let modules = manifest["modules"].as_array().unwrap();
    assert_eq!(modules.len(), 1, "case-insensitive paths share one module");
    let module_id = modules[0]["module_id"].as_u64().unwrap();
    assert_ne!(module_id, 0);

    let symbols = manifest["symbols"].as_array().unwrap();
    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols[0]["name"], "open");
    assert_eq!(symbols[0]["symbol_index"], 1);
    let function_id = symbols[0]["function_id"].as_str().unwrap();
    assert_eq!(function_id.len(), 18);
    let parsed = u64::from_str_radix(&function_id[2..], 16).unwrap();
    assert_eq!(parsed >> 32, module_id);
    assert_eq!(parsed & 0xffff_ffff, 1);
}

#[test]
fn samples_produce_linked_detail_files() {
    let _guard = SESSION_LOCK.lock().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let session_dir = dir.path().join("session");

    let mut session = TraceSession::new(SessionConfig {
        directory: session_dir.clone(),
        drain: DrainConfig {
            poll_interval_us: 50,
            ..Default::default()
        },
        reporter: None,
        ..Default::default()
    })
    .unwrap();

    session.start().unwrap();
    let worker = std::thread::spawn(|| {
        for i in 0..50u64 {
            assert!(session::record_sample(1, &[0x1000 + i, 0x2000 + i]));
        }
    });
    worker.join().unwrap();
    session.stop().unwrap();

    let (index_header, index_events) =
        read_index_file(&session_dir.join("thread_0/index.atf")).unwrap();
    assert_eq!(index_header.event_count, 50);
    assert!(index_events.iter().all(|e| e.kind == EventKind::Sample));
    for (i, event) in index_events.iter().enumerate() {
        assert_eq!(event.detail_seq as usize, i, "index links its detail record");
    }

    let (detail_header, detail_records) =
        tracer_rs::writer::read_detail_file(&session_dir.join("thread_0/detail.atf")).unwrap();
    assert_eq!(detail_header.event_count, 50);
    assert_eq!(detail_records.len(), 50);
}
