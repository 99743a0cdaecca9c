use std::collections::BTreeSet;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use og_core::config::JitConfig;
use og_jit::{BlockKey, CodeRegion, Jit};
use og_memory::{MemoryBus, PageFlags};
use og_ppu::PpuState;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const BLOCKS: u32 = 2048;
const QUERY_COUNT: usize = 4096;
const BLOCK_STRIDE: u32 = 16;
const BASE: u32 = 0x1_0000;

/// Memory holding `BLOCKS` four-instruction blocks, each ending in `blr`
fn program_memory() -> MemoryBus {
    let mut memory = MemoryBus::empty();
    memory.map_ram(0, 0x10_0000, PageFlags::RWX).unwrap();
    let block = [0x3863_0001, 0x3884_0001, 0x38A5_0001, 0x4E80_0020];
    for i in 0..BLOCKS {
        memory.load_program(BASE + i * BLOCK_STRIDE, &block).unwrap();
    }
    memory
}

fn populated_jit(memory: &mut MemoryBus) -> Jit {
    let config = JitConfig {
        code_size: 1024 * 1024,
        ..JitConfig::default()
    };
    let mut jit = Jit::new(&config);
    let breakpoints = BTreeSet::new();
    for i in 0..BLOCKS {
        let state = PpuState::new(BASE + i * BLOCK_STRIDE);
        jit.translate(&state, memory, &breakpoints).unwrap();
    }
    jit
}

fn bench_lookup(c: &mut Criterion) {
    let mut memory = program_memory();
    let jit = populated_jit(&mut memory);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);

    let hits: Vec<BlockKey> = (0..QUERY_COUNT)
        .map(|_| BlockKey::new(BASE + rng.gen_range(0..BLOCKS) * BLOCK_STRIDE, 0))
        .collect();
    let misses: Vec<BlockKey> = (0..QUERY_COUNT)
        .map(|_| BlockKey::new(BASE + rng.gen_range(0..BLOCKS) * BLOCK_STRIDE + 4, 0))
        .collect();

    let mut group = c.benchmark_group("block_cache");
    group.throughput(Throughput::Elements(1));
    group.bench_function("lookup_hit", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            let key = hits[idx % QUERY_COUNT];
            idx = idx.wrapping_add(1);
            black_box(jit.blocks().lookup(black_box(key)))
        });
    });
    group.bench_function("lookup_miss", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            let key = misses[idx % QUERY_COUNT];
            idx = idx.wrapping_add(1);
            black_box(jit.blocks().lookup(black_box(key)))
        });
    });
    group.finish();
}

fn bench_allocator(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(0xA110C);
    let sizes: Vec<usize> = (0..QUERY_COUNT).map(|_| rng.gen_range(32..512)).collect();

    c.bench_function("code_region_allocate_release", |b| {
        let mut region = CodeRegion::new("near", 0, 4 * 1024 * 1024);
        let mut live = Vec::with_capacity(64);
        let mut idx = 0usize;
        b.iter(|| {
            let size = sizes[idx % QUERY_COUNT];
            idx = idx.wrapping_add(1);
            if let Ok(reservation) = region.allocate(size) {
                if let Ok(range) = region.commit(reservation, size) {
                    live.push(range);
                }
            }
            if live.len() == 64 {
                // Free every other range to keep the free list fragmented
                for range in live.drain(..).step_by(2) {
                    region.release(range).unwrap();
                }
                region.reset();
            }
        });
    });
}

fn bench_translate(c: &mut Criterion) {
    c.bench_function("translate_cold_cache", |b| {
        b.iter_batched(
            program_memory,
            |mut memory| {
                let jit = populated_jit(&mut memory);
                black_box(jit.stats().translations)
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_lookup, bench_allocator, bench_translate);
criterion_main!(benches);
