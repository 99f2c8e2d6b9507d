//! End-to-end scenarios exercising the full engine stack: WAL, memtable,
//! freeze, flush, SSTables, and compaction.

use std::collections::HashMap;
use std::io::Write;

use rand::Rng;
use stratadb::wal::{ReadOptions, Reader, Writer};
use stratadb::{Config, Engine};
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::INFO)
        .try_init();
}

#[test]
fn basic_put_get_cycle() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let engine: Engine<String, String> = Engine::open(Config::new(dir.path())).unwrap();

    engine.put("key1".into(), "hello".into()).unwrap();
    engine.put("key2".into(), "iam".into()).unwrap();
    engine.put("key3".into(), "peter".into()).unwrap();

    assert_eq!(engine.get(&"key1".into()).unwrap(), Some("hello".into()));
    assert_eq!(engine.get(&"key2".into()).unwrap(), Some("iam".into()));
    assert_eq!(engine.get(&"key3".into()).unwrap(), Some("peter".into()));

    engine.close().unwrap();
}

#[test]
fn last_write_wins_across_layers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let engine: Engine<String, String> = Engine::open(Config::new(dir.path())).unwrap();

    // Generation 1 goes to an SSTable, generation 2 stays in memory.
    engine.put("k".into(), "v1".into()).unwrap();
    engine.flush().unwrap();
    engine.put("k".into(), "v2".into()).unwrap();
    assert_eq!(engine.get(&"k".into()).unwrap(), Some("v2".into()));

    // And once both generations are on disk.
    engine.flush().unwrap();
    assert_eq!(engine.get(&"k".into()).unwrap(), Some("v2".into()));

    engine.close().unwrap();
}

#[test]
fn thousand_keys_through_flush() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let engine: Engine<String, String> = Engine::open(Config::new(dir.path())).unwrap();

    for i in 0..1000 {
        engine.put(format!("key{i}"), format!("value{i}")).unwrap();
    }
    engine.flush().unwrap();

    assert_eq!(engine.get(&"key777".into()).unwrap(), Some("value777".into()));
    assert_eq!(engine.get(&"key0".into()).unwrap(), Some("value0".into()));
    assert_eq!(engine.get(&"key999".into()).unwrap(), Some("value999".into()));

    engine.close().unwrap();
}

#[test]
fn wal_round_trip_ten_thousand_records() {
    init_tracing();

    let mut writer = Writer::new(Vec::new());
    for _ in 0..10_000 {
        let mut rec = writer.next().unwrap();
        rec.write_all(b"test").unwrap();
    }
    writer.close().unwrap();
    let sink = writer.reset(Vec::new());

    let mut reader = Reader::new(std::io::Cursor::new(sink), None, ReadOptions::default());
    let mut count = 0;
    while let Some(record) = reader.read_record().unwrap() {
        assert_eq!(record, b"test");
        count += 1;
    }
    assert_eq!(count, 10_000);
}

#[test]
fn random_workload_matches_oracle() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut conf = Config::new(dir.path());
    conf.memtable_size = 4096; // frequent freezes and flushes

    let engine: Engine<String, String> = Engine::open(conf).unwrap();
    let mut oracle: HashMap<String, Option<String>> = HashMap::new();
    let mut rng = rand::rng();

    for i in 0..3000 {
        let key = format!("key{:03}", rng.random_range(0..300));
        if rng.random_range(0..5) == 0 {
            engine.delete(key.clone()).unwrap();
            oracle.insert(key, None);
        } else {
            let value = format!("value-{i}");
            engine.put(key.clone(), value.clone()).unwrap();
            oracle.insert(key, Some(value));
        }
        if i % 503 == 0 {
            engine.flush().unwrap();
        }
    }

    for (key, expected) in &oracle {
        assert_eq!(
            engine.get(key).unwrap(),
            *expected,
            "divergence on {key}"
        );
    }

    engine.close().unwrap();
}

#[test]
fn heavy_write_load_compacts_and_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut conf = Config::new(dir.path());
    conf.memtable_size = 2048;
    conf.sst_size = 4096;
    conf.level0_compact_threshold = 2;

    {
        let engine: Engine<String, String> = Engine::open(conf.clone()).unwrap();
        for i in 0..2000 {
            engine
                .put(format!("key{i:05}"), format!("value{i:05}"))
                .unwrap();
        }
        engine.close().unwrap();
    }

    let engine: Engine<String, String> = Engine::open(conf).unwrap();
    for i in (0..2000).step_by(101) {
        assert_eq!(
            engine.get(&format!("key{i:05}")).unwrap(),
            Some(format!("value{i:05}")),
            "key{i:05} lost after reopen"
        );
    }
    engine.close().unwrap();
}

#[test]
fn deletes_hold_across_flush_and_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    {
        let engine: Engine<String, String> = Engine::open(Config::new(dir.path())).unwrap();
        for i in 0..100 {
            engine.put(format!("key{i:02}"), "v".into()).unwrap();
        }
        engine.flush().unwrap();
        for i in (0..100).step_by(2) {
            engine.delete(format!("key{i:02}")).unwrap();
        }
        engine.close().unwrap();
    }

    let engine: Engine<String, String> = Engine::open(Config::new(dir.path())).unwrap();
    for i in 0..100 {
        let expected = if i % 2 == 0 { None } else { Some("v".to_string()) };
        assert_eq!(engine.get(&format!("key{i:02}")).unwrap(), expected);
    }
    engine.close().unwrap();
}
