use std::{hint::black_box, sync::Arc};

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use weir_core::{BufferPool, PoolConfig, buffer_master};

/// 比较三种借还路径的单次开销：本地命中、直连主池（本地容量为 0）、绕过池直接分配。
///
/// # 设计目的（Why）
/// - 量化线程本地列表相对于“每次加锁访问主池”的收益，这是分级池存在的理由；
/// - 作为退化基线，`alloc_direct` 展示了没有池时每个报文的分配成本。
///
/// # 执行逻辑（How）
/// - 三个基准使用同一份 `PoolConfig`（16 KiB 缓冲），每次迭代借出一个缓冲、写入一个字节后归还；
/// - `cargo bench -- --quick` 与仓库其余基准保持同样的调用约定。
fn bench_pool_roundtrip(c: &mut Criterion) {
    let config = PoolConfig {
        master_capacity: 256,
        local_capacity: 64,
        buffer_size: 16 * 1024,
        headroom: 64,
    };

    let mut local = BufferPool::new(buffer_master(&config), config.local_capacity);
    c.bench_function("local_hit", |b| {
        b.iter(|| {
            let mut buf = local.acquire().expect("本地池借出");
            buf.extend_from_slice(black_box(b"x")).expect("写入");
            local.release(buf);
        })
    });

    let master = buffer_master(&config);
    let mut direct = BufferPool::new(Arc::clone(&master), 0);
    c.bench_function("master_only", |b| {
        b.iter(|| {
            let mut buf = direct.acquire().expect("主池借出");
            buf.extend_from_slice(black_box(b"x")).expect("写入");
            direct.release(buf);
        })
    });

    c.bench_function("alloc_direct", |b| {
        b.iter_batched(
            || (),
            |()| {
                let mut buf = weir_core::ShiftBuffer::try_new(config.buffer_size, config.headroom)
                    .expect("直接分配");
                buf.extend_from_slice(black_box(b"x")).expect("写入");
                black_box(buf)
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(pool_benches, bench_pool_roundtrip);
criterion_main!(pool_benches);
