use chrono::NaiveDate;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pairflow::config::Layout;
use pairflow::consolidate::{merge_summary, Consolidator};
use pairflow::model::{DailyPairTotal, DailySummary, DayPairKey, PairKey};
use pairflow::reducer::FlowRecordReducer;
use pairflow::retry::RetryPolicy;
use pairflow::store::{MemoryStore, ObjectStore};
use pairflow::table::{daily, AggregateTable};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn pair(i: usize) -> PairKey {
    PairKey::new(format!("10.{}.{}.1", i / 256, i % 256), "192.168.0.1")
}

// One day of traffic for `pairs` pairs
fn summary(pairs: usize, day: u64) -> DailySummary {
    let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(day);
    (0..pairs)
        .map(|i| {
            (
                DayPairKey::new(date, pair(i)),
                DailyPairTotal::new((i as i64 + 1) * 1_000, i as i64 % 97),
            )
        })
        .collect()
}

fn table(pairs: usize, days: u64) -> AggregateTable {
    (0..days).fold(AggregateTable::new(), |table, day| merge_summary(&table, &summary(pairs, day)).0)
}

fn raw_file(records: usize) -> Vec<u8> {
    let mut text = String::from("Src IP,Dst IP,Timestamp,Flow Duration,Tot Fwd Pkts\n");
    for i in 0..records {
        text.push_str(&format!(
            "10.0.{}.{},10.1.0.1,{:02}/03/2024 0{}:15:00 AM,{},{}\n",
            i % 16,
            i % 250,
            i % 28 + 1,
            i % 9 + 1,
            i * 3,
            i % 11
        ));
    }
    text.into_bytes()
}

fn benchmark_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_summary");

    for pairs in [100, 1_000, 10_000].iter() {
        let existing = table(*pairs, 5);
        let incoming = summary(*pairs, 6);
        group.throughput(Throughput::Elements(*pairs as u64));
        group.bench_with_input(BenchmarkId::new("existing_pairs", pairs), pairs, |b, _| {
            b.iter(|| black_box(merge_summary(black_box(&existing), black_box(&incoming))));
        });
    }

    group.finish();
}

fn benchmark_table_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_table");

    for pairs in [1_000, 10_000].iter() {
        let table = table(*pairs, 3);
        let bytes = table.encode().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", pairs), pairs, |b, _| {
            b.iter(|| black_box(table.encode().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", pairs), pairs, |b, _| {
            b.iter(|| black_box(AggregateTable::decode(black_box(&bytes)).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_reduce(c: &mut Criterion) {
    let reducer = FlowRecordReducer::default();
    let mut group = c.benchmark_group("reduce");

    for records in [1_000, 50_000].iter() {
        let bytes = raw_file(*records);
        group.throughput(Throughput::Elements(*records as u64));
        group.bench_with_input(BenchmarkId::new("records", records), records, |b, _| {
            b.iter(|| black_box(reducer.reduce_bytes(black_box(&bytes)).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_consolidation_cycle(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let layout = Layout::default();
    let summary_bytes = daily::encode(&summary(1_000, 0)).unwrap();

    c.bench_function("consolidate_1000_pairs", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let store = Arc::new(MemoryStore::new());
                store
                    .put(&layout.summary_key("bench_summary.csv"), summary_bytes.clone())
                    .await
                    .unwrap();
                let consolidator = Consolidator::new(store, layout.clone(), RetryPolicy::no_retry());
                black_box(consolidator.consolidate("bench_summary.csv").await.unwrap())
            })
        });
    });
}

criterion_group!(
    benches,
    benchmark_merge,
    benchmark_table_codec,
    benchmark_reduce,
    benchmark_consolidation_cycle
);
criterion_main!(benches);
