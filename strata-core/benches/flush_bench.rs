use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::Rng;
use strata_core::config::{FlushConfig, TsFileConfig};
use strata_core::flush::{LexicographicOrder, MemTableFlushTask};
use strata_core::memtable::MemTable;
use strata_core::tsfile::TsFileIOWriter;
use strata_core::TsValue;
use tempfile::TempDir;

const DEVICES: usize = 10;
const MEASUREMENTS: usize = 8;
const POINTS: i64 = 2_000;

fn build_memtable(out_of_order: bool) -> MemTable {
    let mut rng = rand::thread_rng();
    let mut memtable = MemTable::new(usize::MAX);
    for d in 0..DEVICES {
        let device = format!("root.bench.d{}", d);
        for m in 0..MEASUREMENTS {
            let measurement = format!("s{}", m);
            for t in 0..POINTS {
                let time = if out_of_order { rng.gen_range(0..POINTS) } else { t };
                memtable
                    .insert(&device, &measurement, time, TsValue::Double(rng.gen()))
                    .unwrap();
            }
        }
    }
    memtable.set_version(1);
    memtable
}

fn bench_flush(c: &mut Criterion) {
    let flush_config = FlushConfig::default();
    let tsfile_config = TsFileConfig::default();
    let dir = TempDir::new().unwrap();

    let mut group = c.benchmark_group("flush");
    group.throughput(Throughput::Elements(DEVICES as u64 * MEASUREMENTS as u64 * POINTS as u64));
    group.sample_size(20);

    for (name, out_of_order) in [("sorted", false), ("out_of_order", true)] {
        let memtable = build_memtable(out_of_order);
        let mut file_id = 0u64;
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    file_id += 1;
                    let path = dir.path().join(format!("{}-{}-0-0.tsfile", file_id, file_id));
                    TsFileIOWriter::create(path, &tsfile_config).unwrap()
                },
                |mut writer| {
                    MemTableFlushTask::new(
                        &memtable,
                        &mut writer,
                        &LexicographicOrder,
                        &flush_config,
                        &tsfile_config,
                        "root.bench",
                    )
                    .sync_flush()
                    .unwrap();
                    black_box(writer.end_file().unwrap());
                },
                BatchSize::PerIteration,
            )
        });
    }
    group.finish();
}

fn bench_memtable_insert(c: &mut Criterion) {
    c.bench_function("memtable_insert_10k", |b| {
        b.iter(|| {
            let mut memtable = MemTable::new(usize::MAX);
            for t in 0..10_000 {
                memtable
                    .insert("root.bench.d0", "s0", black_box(t), TsValue::Int64(t))
                    .unwrap();
            }
            black_box(memtable.total_points())
        })
    });
}

criterion_group!(benches, bench_flush, bench_memtable_insert);
criterion_main!(benches);
