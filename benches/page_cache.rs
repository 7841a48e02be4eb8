use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use udb::cache::{CacheModule, CreateFlag, DefaultCacheBackend};
use udb::{Config, Engine, PageNo, Txn};

const CACHE_PAGES: u32 = 1024;

fn cache_fetch_unpin(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/fetch_unpin");
    group.throughput(Throughput::Elements(1));

    let cache = DefaultCacheBackend::new(&Config::new()).create_cache(4096, 0);
    cache.set_cache_size(CACHE_PAGES);
    for n in 1..=CACHE_PAGES {
        if let Some(item) = cache.fetch(PageNo::new(n), CreateFlag::HardAllocate) {
            cache.unpin(&item, false);
        }
    }

    let mut rng = StdRng::seed_from_u64(7);
    group.bench_function("hit", |b| {
        b.iter(|| {
            let key = PageNo::new(rng.gen_range(1..=CACHE_PAGES));
            let item = cache.fetch(black_box(key), CreateFlag::DoNotCreate);
            if let Some(item) = item {
                cache.unpin(&item, false);
            }
        });
    });

    // Every key is new, so each fetch recycles the LRU tail.
    let mut next = CACHE_PAGES + 1;
    group.bench_function("recycle", |b| {
        b.iter(|| {
            let item = cache.fetch(PageNo::new(next), CreateFlag::HardAllocate);
            next += 1;
            if let Some(item) = item {
                cache.unpin(&item, false);
            }
        });
    });

    group.finish();
}

fn tree_point_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/get");
    group.throughput(Throughput::Elements(1));

    let dir = TempDir::new().unwrap();
    let engine = Engine::new(Config::new().with_cache_size(CACHE_PAGES)).unwrap();
    let pager = engine.open_pager(dir.path().join("bench.db")).unwrap();
    let keys: Vec<Vec<u8>> = (0..20_000u32).map(|i| format!("k{:08}", i).into_bytes()).collect();

    let txn = Txn::begin_write(&pager).unwrap();
    let tree = txn.open_tree("bench", true).unwrap().unwrap();
    for key in &keys {
        txn.write(&tree, key, &[0u8; 32]).unwrap();
    }
    txn.commit().unwrap();

    let mut rng = StdRng::seed_from_u64(11);
    let txn = Txn::begin_read(&pager).unwrap();
    group.bench_function("random", |b| {
        b.iter(|| {
            let key = &keys[rng.gen_range(0..keys.len())];
            black_box(txn.get(&tree, key).unwrap());
        });
    });
    drop(txn);

    group.bench_function("insert_batch", |b| {
        b.iter_batched(
            || rng.gen::<u32>(),
            |seed| {
                let txn = Txn::begin_write(&pager).unwrap();
                for i in 0..100u32 {
                    let key = format!("b{:010}", seed.wrapping_add(i)).into_bytes();
                    txn.write(&tree, &key, &[1u8; 32]).unwrap();
                }
                txn.commit().unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, cache_fetch_unpin, tree_point_reads);
criterion_main!(benches);
