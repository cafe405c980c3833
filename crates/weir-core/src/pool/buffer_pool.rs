use std::sync::Arc;

use tracing::trace;

use crate::{buffer::ShiftBuffer, error::Result, settings::PoolConfig};

use super::{
    local::{LocalPool, LocalStats},
    master::MasterPool,
};

/// 按 [`PoolConfig`] 构造缓冲主池：新建缓冲使用配置的大小与前部预留空间。
///
/// 主池只接纳与新建形状完全一致的缓冲：扩容过的、或由 [`ShiftBuffer::from_slice`]
/// 等途径构造的外来缓冲在交还时直接销毁，池中每个缓冲的容量因此恒为
/// `buffer_size + headroom`。
pub fn buffer_master(config: &PoolConfig) -> Arc<MasterPool<ShiftBuffer>> {
    let (size, headroom) = (config.buffer_size, config.headroom);
    let total = size.saturating_add(headroom);
    Arc::new(
        MasterPool::new(
            config.master_capacity,
            move || ShiftBuffer::try_new(size, headroom),
            drop,
        )
        .with_admission(move |buf: &ShiftBuffer| {
            buf.capacity() == total && buf.headroom() == headroom
        }),
    )
}

/// 工作线程的缓冲来源，经由 [`WorkerEnv`](crate::WorkerEnv) 注入到每次派发中。
///
/// 与通用 [`LocalPool`] 的区别在于回收时先 [`reset`](ShiftBuffer::reset)，
/// 保证下一次借出的缓冲为空且前部空间完整；主池拒绝准入的缓冲不进入本地列表，直接销毁。
pub struct BufferPool {
    local: LocalPool<ShiftBuffer>,
}

impl BufferPool {
    pub fn new(master: Arc<MasterPool<ShiftBuffer>>, local_capacity: usize) -> Self {
        Self {
            local: LocalPool::new(master, local_capacity),
        }
    }

    /// 借出一个空缓冲；分配失败时返回 `ResourceExhausted`。
    #[inline]
    pub fn acquire(&mut self) -> Result<ShiftBuffer> {
        self.local.acquire()
    }

    /// 借出缓冲并写入 `bytes`。
    pub fn acquire_with(&mut self, bytes: &[u8]) -> Result<ShiftBuffer> {
        let mut buf = self.acquire()?;
        if let Err(err) = buf.extend_from_slice(bytes) {
            self.release(buf);
            return Err(err);
        }
        Ok(buf)
    }

    #[inline]
    pub fn release(&mut self, mut buf: ShiftBuffer) {
        if !self.local.master().admits(&buf) {
            trace!(capacity = buf.capacity(), "foreign-sized buffer destroyed on release");
            self.local.master().discard(buf);
            return;
        }
        buf.reset();
        self.local.release(buf);
    }

    pub fn stats(&self) -> LocalStats {
        self.local.stats()
    }

    pub fn master(&self) -> &Arc<MasterPool<ShiftBuffer>> {
        self.local.master()
    }
}
