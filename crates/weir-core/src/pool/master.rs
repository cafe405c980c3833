use std::{cmp, fmt};

use tracing::trace;

use crate::{
    error::Result,
    sync::{AtomicU64, AtomicUsize, Mutex, Ordering},
};

/// 池条目的构造回调。失败时返回 `ResourceExhausted` 类错误，由请求方拆除连接。
pub type CreateFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// 池条目的销毁回调，在溢出或池析构时调用。
pub type DestroyFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// 交还时的准入判定。返回 `false` 的条目不进入任何空闲列表，直接销毁。
pub type AdmitFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// `MasterPool` 是所有工作线程共享的定容溢出/补给池。
///
/// # 设计背景（Why）
/// - 线程本地池为空或已满时才访问主池，并且总是成批搬运，使互斥锁的持有频率与时长都保持在低位；
/// - 容量是硬上限：超出部分立即销毁，而不是静默丢弃或扩容，以约束突发扇入时的最坏内存占用。
///
/// # 逻辑解析（How）
/// - `available` 由互斥锁保护，所有真实的读写都在锁内完成，临界区只包含一次切片搬运；
/// - `len` 是锁外可读的近似长度，以 `Relaxed` 读取做快速判空/判满，允许短暂过期，
///   过期的代价只是多一次加锁或多一次分配/销毁，不会破坏 `0 <= len <= cap`；
/// - 创建与销毁回调一律在锁外执行。
///
/// # 契约说明（What）
/// - `pop_batch` 先取走 `min(len, count)` 个尾部条目，剩余部分调用 `create` 补足；
/// - `push_batch` 最多存入 `cap - len` 个，其余全部交给 `destroy`；
/// - 设置了准入判定时，[`admits`](Self::admits) 为假的条目由 [`discard`](Self::discard) 销毁，
///   不会回到任何空闲列表；
/// - 池析构时销毁仍在 `available` 中的条目。
pub struct MasterPool<T> {
    available: Mutex<Vec<T>>,
    len: AtomicUsize,
    cap: usize,
    create: CreateFn<T>,
    destroy: DestroyFn<T>,
    admit: Option<AdmitFn<T>>,
    metrics: PoolMetrics,
}

/// 池状态快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 当前空闲条目数。
    pub len: usize,
    /// 容量上限。
    pub cap: usize,
    /// 通过 `create` 新建的条目总数。
    pub created: u64,
    /// 因溢出或析构而销毁的条目总数。
    pub destroyed: u64,
    /// 直接从空闲列表取出复用的条目总数。
    pub reused: u64,
}

impl<T> MasterPool<T> {
    /// 以给定容量与回调构造主池，初始为空。
    pub fn new(
        cap: usize,
        create: impl Fn() -> Result<T> + Send + Sync + 'static,
        destroy: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            available: Mutex::new(Vec::with_capacity(cap)),
            len: AtomicUsize::new(0),
            cap,
            create: Box::new(create),
            destroy: Box::new(destroy),
            admit: None,
            metrics: PoolMetrics::new(),
        }
    }

    /// 设置交还时的准入判定，例如只接受与 `create` 产出形状一致的条目。
    pub fn with_admission(mut self, admit: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.admit = Some(Box::new(admit));
        self
    }

    /// 条目是否可以回到空闲列表。未设置准入判定时一律接受。
    #[inline]
    pub fn admits(&self, item: &T) -> bool {
        self.admit.as_ref().is_none_or(|admit| admit(item))
    }

    /// 绕过空闲列表直接销毁条目，计入 `destroyed`。
    pub fn discard(&self, item: T) {
        self.destroy_item(item);
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// 近似的空闲条目数，可能短暂过期。
    #[inline]
    pub fn len_hint(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// 向 `out` 追加恰好 `count` 个条目。
    ///
    /// # 契约说明（What）
    /// - 优先复用空闲条目，不足部分通过 `create` 补足；
    /// - `create` 失败时立即返回错误，已追加到 `out` 的条目仍然有效，归调用方所有。
    pub fn pop_batch(&self, out: &mut Vec<T>, count: usize) -> Result<()> {
        let mut taken = 0;
        if count > 0 && self.len.load(Ordering::Relaxed) > 0 {
            let mut available = self.available.lock();
            taken = cmp::min(count, available.len());
            let start = available.len() - taken;
            out.extend(available.drain(start..));
            self.len.store(available.len(), Ordering::Relaxed);
        }
        self.metrics.reused.fetch_add(taken as u64, Ordering::Relaxed);

        out.reserve(count - taken);
        for _ in taken..count {
            out.push(self.create_item()?);
        }
        trace!(requested = count, reused = taken, "master pool batch popped");
        Ok(())
    }

    /// 取出单个条目，空闲列表为空时新建。
    pub fn acquire(&self) -> Result<T> {
        if self.len.load(Ordering::Relaxed) > 0 {
            let mut available = self.available.lock();
            if let Some(item) = available.pop() {
                self.len.store(available.len(), Ordering::Relaxed);
                self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(item);
            }
        }
        self.create_item()
    }

    /// 把 `items` 中的条目全部交还，调用结束后 `items` 为空。
    ///
    /// 能放下的存入空闲列表，其余在释放锁之后销毁。返回实际存入的数量。
    pub fn push_batch(&self, items: &mut Vec<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let mut stored = 0;
        if self.len.load(Ordering::Relaxed) < self.cap {
            let mut available = self.available.lock();
            let room = self.cap - available.len();
            stored = cmp::min(room, items.len());
            let start = items.len() - stored;
            available.extend(items.drain(start..));
            self.len.store(available.len(), Ordering::Relaxed);
        }
        for item in items.drain(..) {
            self.destroy_item(item);
        }
        stored
    }

    /// 交还单个条目。
    pub fn release(&self, item: T) {
        let item = if self.len.load(Ordering::Relaxed) < self.cap {
            let mut available = self.available.lock();
            if available.len() < self.cap {
                available.push(item);
                self.len.store(available.len(), Ordering::Relaxed);
                return;
            }
            item
        } else {
            item
        };
        self.destroy_item(item);
    }

    /// 预先创建至多 `n` 个条目，不超过剩余容量，返回实际存入的数量。
    pub fn charge(&self, n: usize) -> Result<usize> {
        let wanted = cmp::min(n, self.cap.saturating_sub(self.len.load(Ordering::Relaxed)));
        let mut fresh = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            fresh.push(self.create_item()?);
        }
        Ok(self.push_batch(&mut fresh))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            len: self.len.load(Ordering::Relaxed),
            cap: self.cap,
            created: self.metrics.created.load(Ordering::Relaxed),
            destroyed: self.metrics.destroyed.load(Ordering::Relaxed),
            reused: self.metrics.reused.load(Ordering::Relaxed),
        }
    }

    fn create_item(&self) -> Result<T> {
        let item = (self.create)()?;
        self.metrics.created.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    fn destroy_item(&self, item: T) {
        (self.destroy)(item);
        self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T> Drop for MasterPool<T> {
    fn drop(&mut self) {
        let remaining: Vec<T> = self.available.lock().drain(..).collect();
        for item in remaining {
            self.destroy_item(item);
        }
    }
}

impl<T> fmt::Debug for MasterPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct PoolMetrics {
    created: AtomicU64,
    destroyed: AtomicU64,
    reused: AtomicU64,
}

impl PoolMetrics {
    fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }
}
