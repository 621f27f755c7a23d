use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata_core::config::{EngineConfig, TimeIndexLevel};
use strata_core::resource::TsFileResource;
use strata_core::tsfile::TsFileSequenceReader;
use strata_core::{SeriesPath, StorageEngine, TimeRange, TsValue};
use tempfile::TempDir;

const SG: &str = "root.vehicle";

fn config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::with_data_dir(dir.path());
    config.compaction.compaction_interval_ms = 0;
    config
}

fn s0() -> SeriesPath {
    SeriesPath::new("root.vehicle.d0", "s0")
}

fn insert_range(engine: &StorageEngine, times: impl IntoIterator<Item = i64>, offset: i64) {
    for t in times {
        engine.insert(&s0(), t, TsValue::Int64(t + offset)).unwrap();
    }
}

#[test]
fn test_last_inserted_value_survives_flush() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(config(&dir)).unwrap();

    engine.insert(&s0(), 100, TsValue::Int32(99)).unwrap();
    engine.insert(&s0(), 101, TsValue::Int32(99)).unwrap();
    engine.insert(&s0(), 2, TsValue::Int32(198)).unwrap();
    engine.insert(&s0(), 2, TsValue::Int32(10000)).unwrap();
    engine.close_partition(SG, 0).unwrap();

    let management = engine.storage_group(SG).unwrap().management(0).unwrap();
    let file = &management.iter(true)[0];
    let reader = TsFileSequenceReader::open(file.path()).unwrap();
    assert_eq!(
        reader.read_series(&s0()).unwrap(),
        vec![
            (2, TsValue::Int32(10000)),
            (100, TsValue::Int32(99)),
            (101, TsValue::Int32(99)),
        ]
    );
    let statistics = reader.timeseries_metadata(&s0()).unwrap().unwrap().statistics;
    assert_eq!(statistics.count(), 3);
    assert_eq!(statistics.start_time(), 2);
    assert_eq!(statistics.end_time(), 101);
    engine.shutdown().unwrap();
}

#[test]
fn test_inner_compaction_merges_closed_sequence_files() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.compaction.enable_cross_space_compaction = false;
    let engine = StorageEngine::open(config).unwrap();

    for batch in 0..3 {
        insert_range(&engine, batch * 10..batch * 10 + 10, 0);
        engine.close_partition(SG, 0).unwrap();
    }
    let management = engine.storage_group(SG).unwrap().management(0).unwrap();
    assert_eq!(management.size(true), 3);
    let newest = management.iter(true)[2].name();

    assert_eq!(engine.schedule_compaction(), 1);
    assert!(engine.wait_compaction_idle(Duration::from_secs(30)));

    let files = management.iter(true);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name(), newest.next_inner());
    assert_eq!(files[0].start_time("root.vehicle.d0"), Some(0));
    assert_eq!(files[0].end_time("root.vehicle.d0"), Some(29));

    let points = engine.query_series(&s0(), TimeRange::all()).unwrap();
    assert_eq!(points.len(), 30);
    assert!(points.iter().all(|(t, v)| *v == TsValue::Int64(*t)));
    assert_eq!(engine.context().task_manager().stats().completed, 1);
    engine.shutdown().unwrap();
}

#[test]
fn test_cross_compaction_folds_unsequenced_points() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.compaction.enable_seq_space_compaction = false;
    config.compaction.enable_unseq_space_compaction = false;
    let engine = StorageEngine::open(config).unwrap();

    insert_range(&engine, 1..=10, 0);
    engine.close_partition(SG, 0).unwrap();
    insert_range(&engine, 11..=20, 0);
    engine.close_partition(SG, 0).unwrap();
    insert_range(&engine, [5, 15], 1000);
    engine.close_partition(SG, 0).unwrap();

    let management = engine.storage_group(SG).unwrap().management(0).unwrap();
    assert_eq!(management.size(true), 2);
    assert_eq!(management.size(false), 1);

    assert_eq!(engine.schedule_compaction(), 1);
    assert!(engine.wait_compaction_idle(Duration::from_secs(30)));

    assert!(management.is_empty(false));
    assert!(!management.is_unseq_merging());
    assert!(!management.merge_log_path().exists());
    let files = management.iter(true);
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.name().cross_compaction_count == 1));
    assert_eq!(files[0].end_time("root.vehicle.d0"), Some(10));

    let points = engine.query_series(&s0(), TimeRange::all()).unwrap();
    assert_eq!(points.len(), 20);
    assert_eq!(points[4], (5, TsValue::Int64(1005)));
    assert_eq!(points[14], (15, TsValue::Int64(1015)));
    assert_eq!(points[5], (6, TsValue::Int64(6)));
    engine.shutdown().unwrap();
}

#[test]
fn test_delete_during_merge_window_reaches_new_file() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(config(&dir)).unwrap();

    insert_range(&engine, 1..=10, 0);
    engine.close_partition(SG, 0).unwrap();
    insert_range(&engine, [3, 5], 100);
    engine.close_partition(SG, 0).unwrap();

    let management = engine.storage_group(SG).unwrap().management(0).unwrap();
    let old = management.iter(true)[0].clone();
    let unseq = management.iter(false);
    assert_eq!(unseq.len(), 1);

    management.start_unseq_merge();
    engine.delete(&s0(), TimeRange::new(5, 6)).unwrap();
    assert_eq!(unseq[0].mod_entry_count().unwrap(), 1);
    assert_eq!(
        management.merging_modification().unwrap().read_all().unwrap().len(),
        1
    );

    // Stand-in for the merged output: the old file under its next name
    let merged_path = management
        .file_dir(true)
        .join(old.name().next_cross().to_string());
    fs::copy(old.path(), &merged_path).unwrap();
    let merged =
        Arc::new(TsFileResource::load(&merged_path, true, TimeIndexLevel::Device).unwrap());
    management
        .merge_end_action(&[(old.clone(), merged.clone())], &unseq, engine.context().caches())
        .unwrap();

    let migrated = merged.mod_file().read_all().unwrap();
    assert_eq!(migrated.len(), 1);
    assert_eq!(migrated[0].range(), TimeRange::new(5, 6));
    assert_eq!(migrated[0].file_offset, u64::MAX);
    assert!(!old.path().exists());
    assert!(management.is_empty(false));

    let times: Vec<_> = engine
        .query_series(&s0(), TimeRange::all())
        .unwrap()
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(times, vec![1, 2, 3, 4, 7, 8, 9, 10]);
    engine.shutdown().unwrap();
}

#[test]
fn test_concurrent_writers_then_compaction() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.memtable_size_threshold = 4 * 1024;
    config.tsfile_size_threshold = 2 * 1024;
    config.compaction.target_compaction_file_size = 64 * 1024 * 1024;
    let engine = Arc::new(StorageEngine::open(config).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|d| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let device = format!("root.vehicle.d{}", d);
                for t in 0..2_000i64 {
                    engine
                        .insert_record(&device, t, &[("s0".to_string(), TsValue::Int64(t * 2))])
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    engine.close_all().unwrap();

    let management = engine.storage_group(SG).unwrap().management(0).unwrap();
    assert!(management.size(true) > 1);
    assert!(management.is_empty(false));

    assert!(engine.schedule_compaction() >= 1);
    assert!(engine.wait_compaction_idle(Duration::from_secs(60)));

    for d in 0..4 {
        let path = SeriesPath::new(format!("root.vehicle.d{}", d), "s0");
        let points = engine.query_series(&path, TimeRange::all()).unwrap();
        assert_eq!(points.len(), 2_000);
        assert!(points.iter().all(|(t, v)| *v == TsValue::Int64(t * 2)));
    }
    assert_eq!(engine.context().task_manager().stats().failed, 0);
    engine.shutdown().unwrap();
}
