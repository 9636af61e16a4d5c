use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{TimeZone, Utc};
use payremind_core::{ManualClock, PayableId};
use payremind_infra::jobs::{
    Enqueuer, GarbageCollector, InMemoryScheduleStore, ReminderConfig, ReminderWorker,
    ScheduleStore,
};
use payremind_payables::{InMemoryPayables, Payable, Recipients, RecordingSender};
use std::sync::Arc;

const T0: i64 = 1_700_000_000;
const DAY: i64 = 86_400;

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_throughput");

    for offsets in [1usize, 3, 7].iter() {
        group.throughput(Throughput::Elements(*offsets as u64));
        group.bench_with_input(
            BenchmarkId::new("offsets_per_payable", offsets),
            offsets,
            |b, &count| {
                let clock = Arc::new(ManualClock::at_ts(T0));
                let store = InMemoryScheduleStore::arc(clock.clone());
                let enqueuer = Enqueuer::new(store, clock, ReminderConfig::default());
                let offsets: Vec<i64> = (1..=count as i64).collect();
                let due = Utc.timestamp_opt(T0 + 30 * DAY, 0).unwrap();

                b.iter(|| {
                    black_box(enqueuer.enqueue(PayableId::new(), due, &offsets).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_pop_due(c: &mut Criterion) {
    let mut group = c.benchmark_group("pop_due");

    for backlog in [100usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("batch_50", backlog), backlog, |b, &size| {
            let clock = Arc::new(ManualClock::at_ts(T0));
            let store = InMemoryScheduleStore::arc(clock.clone());
            let enqueuer = Enqueuer::new(store.clone(), clock, ReminderConfig::default());
            let due = Utc.timestamp_opt(T0 + 2 * DAY, 0).unwrap();
            for _ in 0..size {
                enqueuer.enqueue(PayableId::new(), due, &[1]).unwrap();
            }

            b.iter(|| {
                let popped = store.index_pop_due(T0 + DAY, 50).unwrap();
                for entry in &popped {
                    store.index_insert(&entry.job_id, entry.due_at, true).unwrap();
                }
                black_box(popped.len())
            });
        });
    }

    group.finish();
}

fn bench_worker_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_tick");
    group.sample_size(50);

    group.bench_function("deliver_batch_of_50", |b| {
        b.iter_batched(
            || {
                let clock = Arc::new(ManualClock::at_ts(T0));
                let store = InMemoryScheduleStore::arc(clock.clone());
                let payables = InMemoryPayables::arc(Recipients::new(
                    vec!["ap@example.com".to_string()],
                    vec![],
                ));
                let sender = RecordingSender::arc();
                let config = ReminderConfig::default();
                let enqueuer = Enqueuer::new(store.clone(), clock.clone(), config.clone());
                let due = Utc.timestamp_opt(T0 + 2 * DAY, 0).unwrap();
                for _ in 0..50 {
                    let payable = Payable::new(PayableId::new(), due, 1_000);
                    payables.insert(payable.clone());
                    enqueuer.enqueue(payable.id, due, &[1]).unwrap();
                }
                clock.set_ts(T0 + DAY);
                ReminderWorker::new(store, payables, sender, clock, config).unwrap()
            },
            |mut worker| black_box(worker.tick().unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_gc_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_sweep");

    for stale in [100usize, 2_000].iter() {
        group.throughput(Throughput::Elements(*stale as u64));
        group.bench_with_input(BenchmarkId::new("reclaim", stale), stale, |b, &size| {
            b.iter_batched(
                || {
                    let clock = Arc::new(ManualClock::at_ts(T0));
                    let store = InMemoryScheduleStore::arc(clock.clone());
                    let enqueuer =
                        Enqueuer::new(store.clone(), clock.clone(), ReminderConfig::default());
                    let due = Utc.timestamp_opt(T0 + 2 * DAY, 0).unwrap();
                    for _ in 0..size {
                        enqueuer.enqueue(PayableId::new(), due, &[1]).unwrap();
                    }
                    clock.set_ts(T0 + 3 * DAY);
                    GarbageCollector::new(store, clock, ReminderConfig::default())
                },
                |gc| black_box(gc.sweep().unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_pop_due,
    bench_worker_tick,
    bench_gc_sweep
);
criterion_main!(benches);
