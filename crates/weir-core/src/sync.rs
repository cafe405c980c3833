//! 主池使用的同步原语。
//!
//! 常规构建使用 `parking_lot::Mutex` 与标准原子量；在 `--cfg loom` 且启用 `loom-model`
//! 特性时切换为 loom 的实现，以便模型测试穷举 `pop_batch`/`push_batch` 的交错。

#[cfg(not(all(loom, feature = "loom-model")))]
pub(crate) use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(all(loom, feature = "loom-model"))]
pub(crate) use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(not(all(loom, feature = "loom-model")))]
pub(crate) type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

#[cfg(all(loom, feature = "loom-model"))]
pub(crate) type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;

/// 屏蔽两种实现的加锁签名差异：`parking_lot` 不会中毒，loom 返回 `LockResult`。
#[derive(Debug)]
pub(crate) struct Mutex<T> {
    #[cfg(not(all(loom, feature = "loom-model")))]
    inner: parking_lot::Mutex<T>,
    #[cfg(all(loom, feature = "loom-model"))]
    inner: loom::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            #[cfg(not(all(loom, feature = "loom-model")))]
            inner: parking_lot::Mutex::new(value),
            #[cfg(all(loom, feature = "loom-model"))]
            inner: loom::sync::Mutex::new(value),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        #[cfg(not(all(loom, feature = "loom-model")))]
        {
            self.inner.lock()
        }
        #[cfg(all(loom, feature = "loom-model"))]
        {
            // 模型中不存在持锁 panic 的路径，中毒时沿用内部值。
            self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }
}
