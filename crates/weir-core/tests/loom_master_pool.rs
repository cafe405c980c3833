#![cfg(all(loom, feature = "loom-model"))]

//! 以 loom 穷举两个线程同时成批借还时的交错：近似长度 `len` 允许过期，
//! 但锁内的真实长度始终不越过容量，且同一条目不会同时被两个线程持有。
//!
//! 运行方式：`RUSTFLAGS="--cfg loom" cargo test -p weir-core --features loom-model --test loom_master_pool`

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};
use weir_core::MasterPool;

#[test]
fn concurrent_batches_respect_capacity() {
    model(|| {
        let next = Arc::new(AtomicU64::new(10));
        let seq = Arc::clone(&next);
        let pool = Arc::new(MasterPool::new(
            2,
            move || Ok(seq.fetch_add(1, Ordering::Relaxed)),
            |_| {},
        ));
        assert_eq!(pool.charge(2).expect("预填充"), 2);

        let other = Arc::clone(&pool);
        let borrower = thread::spawn(move || {
            let mut items = Vec::new();
            other.pop_batch(&mut items, 2).expect("取出批次");
            let snapshot = items.clone();
            other.push_batch(&mut items);
            snapshot
        });

        let mut mine = Vec::new();
        pool.pop_batch(&mut mine, 1).expect("取出批次");
        let kept = mine.clone();
        pool.push_batch(&mut mine);

        let theirs = borrower.join().expect("借用线程不应 panic");
        assert!(
            !theirs.iter().any(|item| kept.contains(item)),
            "同一条目被两个线程同时持有"
        );

        let stats = pool.stats();
        assert!(stats.len <= stats.cap);
        assert_eq!(stats.created, stats.destroyed + stats.len as u64);
    });
}
