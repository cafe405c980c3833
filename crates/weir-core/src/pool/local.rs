use std::{cmp, sync::Arc};

use tracing::debug;

use crate::error::{CoreError, ErrorCategory, Result, codes};

use super::master::MasterPool;

/// 工作线程独占的空闲列表，是 `acquire`/`release` 的快速路径。
///
/// # 逻辑解析（How）
/// - 本地列表非空时 `acquire` 只是一次 `Vec::pop`，不触碰任何同步原语；
/// - 本地列表为空时从主池成批补给 `batch = max(cap / 2, 1)` 个条目；
/// - 本地列表已满时把 `batch` 个条目成批溢出到主池，由主池决定存放或销毁；
/// - `cap == 0` 时退化为直连主池，每次只搬运一个条目。
///
/// # 契约说明（What）
/// - 所有方法取 `&mut self`，类型本身不实现 `Sync`，从类型层面保证“每个工作线程一个实例”；
/// - 析构时把剩余条目全部交还主池。
pub struct LocalPool<T> {
    items: Vec<T>,
    spill: Vec<T>,
    cap: usize,
    batch: usize,
    master: Arc<MasterPool<T>>,
    stats: LocalStats,
}

/// 本地池计数，仅由所属工作线程更新。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocalStats {
    pub len: usize,
    pub cap: usize,
    /// 命中本地空闲列表的次数。
    pub hits: u64,
    /// 向主池发起批量补给的次数。
    pub refills: u64,
    /// 向主池批量溢出的次数。
    pub spills: u64,
}

impl<T> LocalPool<T> {
    pub fn new(master: Arc<MasterPool<T>>, cap: usize) -> Self {
        Self {
            items: Vec::with_capacity(cap),
            spill: Vec::with_capacity(cmp::max(cap / 2, 1)),
            cap,
            batch: cmp::max(cap / 2, 1),
            master,
            stats: LocalStats::default(),
        }
    }

    pub fn master(&self) -> &Arc<MasterPool<T>> {
        &self.master
    }

    pub fn acquire(&mut self) -> Result<T> {
        if let Some(item) = self.items.pop() {
            self.stats.hits += 1;
            return Ok(item);
        }
        if self.cap == 0 {
            return self.master.acquire();
        }

        self.stats.refills += 1;
        if let Err(err) = self.master.pop_batch(&mut self.items, self.batch) {
            if self.items.is_empty() {
                return Err(err);
            }
            debug!(
                error = %err,
                obtained = self.items.len(),
                "local pool refill was partial"
            );
        }
        self.items.pop().ok_or_else(|| {
            CoreError::new(codes::POOL_ALLOC_FAILED, "master pool returned an empty batch")
                .with_category(ErrorCategory::ResourceExhausted)
        })
    }

    pub fn release(&mut self, item: T) {
        if self.cap == 0 {
            self.master.release(item);
            return;
        }
        if self.items.len() >= self.cap {
            let keep = self.items.len() - cmp::min(self.batch, self.items.len());
            self.spill.extend(self.items.drain(keep..));
            self.master.push_batch(&mut self.spill);
            self.stats.spills += 1;
        }
        self.items.push(item);
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            len: self.items.len(),
            cap: self.cap,
            ..self.stats
        }
    }
}

impl<T> Drop for LocalPool<T> {
    fn drop(&mut self) {
        self.master.push_batch(&mut self.items);
    }
}
