//! JOIN benchmark across the table strategies.
//!
//! Simulates a database equi-join workload:
//!   SELECT * FROM probe_side JOIN build_side ON probe_side.key = build_side.key
//!
//! Measures:
//!   - Build throughput (tuples/sec to construct the index)
//!   - Probe throughput (lookups/sec across varying selectivity & multiplicity)
//!   - The prefetch-pipelined probe loop against the plain one
//!   - The fingerprint filter fast path on all-miss probes
//!
//! Workload parameters:
//!   - Build size: number of tuples on the build side
//!   - Probe size: number of lookups to perform
//!   - Selectivity: fraction of probe keys that have a match (0.0 = no matches, 1.0 = all match)
//!   - Multiplicity: number of build-side duplicates per key (1 = unique, N = 1:N join)

use criterion::measurement::WallTime;
use criterion::{BenchmarkGroup, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::hint::black_box;
use std::time::Duration;

use equijoin::{
    AdaptiveChainTable, ChainedTable, CompactBucketTable, FingerprintTable, LinearProbeTable,
    RowSet, SortedBucketTable,
};

// How long to record measurements for.
const MEASURE_DURATION_SECS: u64 = 10;

const PAYLOAD: usize = 8;
type Rows = RowSet<PAYLOAD>;

struct JoinWorkload {
    build_rows: Rows,
    /// Keys to probe (mix of matching and non-matching)
    probe_keys: Vec<u64>,
}

impl JoinWorkload {
    /// Generate a join workload.
    ///
    /// - `build_keys`: number of distinct keys on the build side
    /// - `multiplicity`: duplicates per key (total build tuples = build_keys * multiplicity)
    /// - `probe_count`: number of probe operations
    /// - `selectivity`: fraction of probe keys that exist in the build side
    fn generate(
        build_keys: usize,
        multiplicity: usize,
        probe_count: usize,
        selectivity: f64,
        seed: u64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        // Build side: keys 0..build_keys, each repeated `multiplicity`
        // times, shuffled to simulate unordered input.
        let mut tuples = Vec::with_capacity(build_keys * multiplicity);
        for key in 0..build_keys as u64 {
            for dup in 0..multiplicity as u64 {
                tuples.push((key, (key * 1000 + dup).to_le_bytes()));
            }
        }
        tuples.shuffle(&mut rng);
        let build_rows: Rows = tuples.into_iter().collect();

        // Probe side: selectivity% of keys hit, the rest target keys past
        // the build key range.
        let matching_probes = (probe_count as f64 * selectivity) as usize;
        let mut probe_keys = Vec::with_capacity(probe_count);
        for _ in 0..matching_probes {
            probe_keys.push(rng.random_range(0..build_keys as u64));
        }
        let miss_base = build_keys as u64;
        for _ in 0..probe_count - matching_probes {
            probe_keys.push(miss_base + rng.random_range(0..build_keys as u64));
        }
        probe_keys.shuffle(&mut rng);

        Self {
            build_rows,
            probe_keys,
        }
    }
}

trait JoinBench<'r>: Sized {
    const NAME: &'static str;
    fn build_from(rows: &'r Rows) -> Self;
    fn probe_sum(&self, key: u64) -> u64; // sum of matched payloads (to prevent elision)
}

struct HashMapIndex {
    map: HashMap<u64, Vec<u64>>,
}

impl<'r> JoinBench<'r> for HashMapIndex {
    const NAME: &'static str = "HashMap";

    fn build_from(rows: &'r Rows) -> Self {
        let mut map: HashMap<u64, Vec<u64>> = HashMap::with_capacity(rows.len());
        for row in rows.iter() {
            map.entry(row.key)
                .or_default()
                .push(u64::from_le_bytes(row.payload));
        }
        Self { map }
    }

    #[inline]
    fn probe_sum(&self, key: u64) -> u64 {
        match self.map.get(&key) {
            Some(payloads) => {
                let mut sum = 0u64;
                for &p in payloads {
                    sum = sum.wrapping_add(p);
                }
                sum
            }
            None => 0,
        }
    }
}

macro_rules! impl_join_bench {
    ($table:ident, $name:literal) => {
        impl<'r> JoinBench<'r> for $table<'r, PAYLOAD> {
            const NAME: &'static str = $name;

            fn build_from(rows: &'r Rows) -> Self {
                $table::build(rows)
            }

            #[inline]
            fn probe_sum(&self, key: u64) -> u64 {
                let mut sum = 0u64;
                for row in self.probe(key) {
                    sum = sum.wrapping_add(u64::from_le_bytes(row.payload));
                }
                sum
            }
        }
    };
}

impl_join_bench!(LinearProbeTable, "Linear");
impl_join_bench!(ChainedTable, "Chained");
impl_join_bench!(FingerprintTable, "Fingerprint");
impl_join_bench!(SortedBucketTable, "SortedBucket");
impl_join_bench!(CompactBucketTable, "CompactBucket");
impl_join_bench!(AdaptiveChainTable, "AdaptiveChain");

fn bench_probe<'r, T: JoinBench<'r>>(index: &T, probe_keys: &[u64]) -> u64 {
    let mut total = 0u64;
    for &key in probe_keys {
        total = total.wrapping_add(index.probe_sum(key));
    }
    total
}

/// The software-pipelined probe loop: hash `PREFETCH` keys ahead, prefetch
/// their home slots, probe with hashes computed earlier.
fn bench_probe_prefetch(index: &LinearProbeTable<'_, PAYLOAD>, probe_keys: &[u64]) -> u64 {
    const PREFETCH: usize = 8;
    let mut hashes = [0u64; PREFETCH];
    for i in 0..PREFETCH.min(probe_keys.len()) {
        hashes[i] = index.hash_key(probe_keys[i]);
    }
    let mut total = 0u64;
    for i in 0..probe_keys.len() {
        let pos = i % PREFETCH;
        let hash = hashes[pos];
        if i + PREFETCH < probe_keys.len() {
            hashes[pos] = index.hash_key(probe_keys[i + PREFETCH]);
            index.prefetch(hashes[pos]);
        }
        for row in index.probe_hashed(probe_keys[i], hash) {
            total = total.wrapping_add(u64::from_le_bytes(row.payload));
        }
    }
    total
}

fn build_group<'r, T: JoinBench<'r>>(
    group: &mut BenchmarkGroup<'_, WallTime>,
    rows: &'r Rows,
    size: usize,
) {
    group.bench_function(BenchmarkId::new(T::NAME, size), |b| {
        b.iter(|| T::build_from(black_box(rows)))
    });
}

fn probe_group<'r, T: JoinBench<'r>>(
    group: &mut BenchmarkGroup<'_, WallTime>,
    rows: &'r Rows,
    keys: &[u64],
    label: &str,
) {
    let index = T::build_from(rows);
    group.bench_function(BenchmarkId::new(T::NAME, label), |b| {
        b.iter(|| bench_probe(&index, black_box(keys)))
    });
}

fn bench_build_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    for &build_size in &[1_000, 10_000, 100_000, 1_000_000] {
        let workload = JoinWorkload::generate(build_size, 1, 0, 0.0, 42);
        let rows = &workload.build_rows;
        group.throughput(Throughput::Elements(build_size as u64));

        build_group::<HashMapIndex>(&mut group, rows, build_size);
        build_group::<LinearProbeTable<PAYLOAD>>(&mut group, rows, build_size);
        build_group::<ChainedTable<PAYLOAD>>(&mut group, rows, build_size);
        build_group::<FingerprintTable<PAYLOAD>>(&mut group, rows, build_size);
        build_group::<SortedBucketTable<PAYLOAD>>(&mut group, rows, build_size);
        build_group::<CompactBucketTable<PAYLOAD>>(&mut group, rows, build_size);
        build_group::<AdaptiveChainTable<PAYLOAD>>(&mut group, rows, build_size);
    }

    group.finish();
}

fn bench_probe_selectivity(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_selectivity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let build_size = 100_000;
    let probe_count = 1_000_000;

    // Varying selectivity: 0% (all misses), 1%, 10%, 50%, 100% (all hits)
    for &selectivity in &[0.0, 0.01, 0.1, 0.5, 1.0] {
        let workload = JoinWorkload::generate(build_size, 1, probe_count, selectivity, 42);
        let rows = &workload.build_rows;
        let keys = &workload.probe_keys;
        let label = format!("{:.0}pct", selectivity * 100.0);

        group.throughput(Throughput::Elements(probe_count as u64));

        probe_group::<HashMapIndex>(&mut group, rows, keys, &label);
        probe_group::<LinearProbeTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<ChainedTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<FingerprintTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<SortedBucketTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<CompactBucketTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<AdaptiveChainTable<PAYLOAD>>(&mut group, rows, keys, &label);
    }

    group.finish();
}

fn bench_probe_multiplicity(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_multiplicity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let build_keys = 100_000;
    let probe_count = 1_000_000;
    let selectivity = 1.0; // all probes hit

    // Varying multiplicity: 1 (unique), 2, 5, 10, 50
    for &multiplicity in &[1, 2, 5, 10, 50] {
        let workload =
            JoinWorkload::generate(build_keys, multiplicity, probe_count, selectivity, 42);
        let rows = &workload.build_rows;
        let keys = &workload.probe_keys;
        let label = format!("{multiplicity}");

        group.throughput(Throughput::Elements(probe_count as u64));

        probe_group::<HashMapIndex>(&mut group, rows, keys, &label);
        probe_group::<LinearProbeTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<ChainedTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<SortedBucketTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<CompactBucketTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<AdaptiveChainTable<PAYLOAD>>(&mut group, rows, keys, &label);
    }

    group.finish();
}

fn bench_probe_table_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_table_size");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let probe_count = 1_000_000;
    let selectivity = 0.5;

    // Varying build size: fits in L1, L2, L3, exceeds LLC
    for &build_size in &[1_000, 10_000, 100_000, 1_000_000, 5_000_000] {
        let workload = JoinWorkload::generate(build_size, 1, probe_count, selectivity, 42);
        let rows = &workload.build_rows;
        let keys = &workload.probe_keys;
        let label = format!("{build_size}");

        group.throughput(Throughput::Elements(probe_count as u64));

        probe_group::<HashMapIndex>(&mut group, rows, keys, &label);
        probe_group::<LinearProbeTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<ChainedTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<SortedBucketTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<CompactBucketTable<PAYLOAD>>(&mut group, rows, keys, &label);
        probe_group::<AdaptiveChainTable<PAYLOAD>>(&mut group, rows, keys, &label);
    }

    group.finish();
}

fn bench_prefetch_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("prefetch_pipeline");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let probe_count = 1_000_000;

    // Large tables are where the probe loop stalls on cache misses and
    // pipelining has something to hide.
    for &build_size in &[100_000, 1_000_000, 5_000_000] {
        let workload = JoinWorkload::generate(build_size, 1, probe_count, 0.5, 42);
        let index = LinearProbeTable::<PAYLOAD>::build(&workload.build_rows);
        let keys = &workload.probe_keys;

        group.throughput(Throughput::Elements(probe_count as u64));

        group.bench_with_input(BenchmarkId::new("plain", build_size), keys, |b, keys| {
            b.iter(|| bench_probe(&index, black_box(keys)))
        });
        group.bench_with_input(BenchmarkId::new("prefetch", build_size), keys, |b, keys| {
            b.iter(|| bench_probe_prefetch(&index, black_box(keys)))
        });
    }

    group.finish();
}

fn bench_fingerprint_rejection(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint_rejection");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    // 100% miss rate: ideally every probe is rejected by the per-bucket
    // fingerprint before a single list link is followed.
    let build_size = 100_000;
    let probe_count = 10_000_000;
    let workload = JoinWorkload::generate(build_size, 1, probe_count, 0.0, 42);
    let index = FingerprintTable::<PAYLOAD>::build(&workload.build_rows);
    let keys = &workload.probe_keys;

    group.throughput(Throughput::Elements(probe_count as u64));

    // Full probe (filter check + would-scan, but the filter rejects).
    group.bench_with_input(
        BenchmarkId::new("probe_all_miss", probe_count),
        keys,
        |b, keys| b.iter(|| bench_probe(&index, black_box(keys))),
    );

    // Filter check only (the semi-join reducer path).
    group.bench_with_input(
        BenchmarkId::new("filter_only_all_miss", probe_count),
        keys,
        |b, keys| {
            b.iter(|| {
                let mut count = 0u64;
                for &key in keys {
                    if index.may_contain(black_box(key)) {
                        count += 1;
                    }
                }
                count
            })
        },
    );

    group.finish();
}

criterion_group!(
    benches,
    bench_build_throughput,
    bench_probe_selectivity,
    bench_probe_multiplicity,
    bench_probe_table_size,
    bench_prefetch_pipeline,
    bench_fingerprint_rejection,
);
criterion_main!(benches);
