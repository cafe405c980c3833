use std::{cmp, fmt, io};

use bytes::Buf;

use crate::error::{CoreError, ErrorCategory, Result, codes};

/// `ShiftBuffer` 是链路上流动的字节载体：一段独占的后备内存，加上读写两个偏移。
///
/// # 设计动机（Why）
/// - 节点拆包、剥离协议头时只需推进 `read_offset`（`shift_right`），不移动任何字节；
/// - 预留的头部空间（headroom）允许节点通过 `shift_left` 原地前插协议头，避免“分配新缓冲再拷贝”；
/// - 缓冲在任一时刻只属于一个 [`Context`](crate::Context) 或一个池槽位，转移即 move，
///   从而以所有权表达原实现中依赖手工引用计数维持的约束。
///
/// # 契约说明（What）
/// - 不变量：`read_offset <= write_offset <= capacity`；
/// - `shift_right`/`shift_left` 只调整偏移，越界请求返回 [`codes::BUFFER_OUT_OF_BOUNDS`]，
///   不触碰 `[0, capacity)` 之外的内存；
/// - `extend_from_slice` 在剩余空间不足时通过可失败的 `try_reserve_exact` 扩容，
///   失败以 [`ErrorCategory::ResourceExhausted`] 上报；
/// - `reset` 把两个偏移恢复到构造时的 headroom，供池回收时复用。
pub struct ShiftBuffer {
    data: Vec<u8>,
    headroom: usize,
    read: usize,
    write: usize,
}

impl ShiftBuffer {
    /// 分配一个可写区容量为 `capacity`、头部预留 `headroom` 字节的缓冲。
    ///
    /// 分配失败不会中止进程，而是返回 `ResourceExhausted`，由调用方拆除当前连接。
    pub fn try_new(capacity: usize, headroom: usize) -> Result<Self> {
        let total = capacity.checked_add(headroom).ok_or_else(|| {
            alloc_error(format!(
                "buffer size overflow: capacity {capacity} + headroom {headroom}"
            ))
        })?;
        let mut data = Vec::new();
        data.try_reserve_exact(total).map_err(|err| {
            alloc_error(format!("failed to allocate {total} bytes")).with_cause(err)
        })?;
        data.resize(total, 0);
        Ok(Self {
            data,
            headroom,
            read: headroom,
            write: headroom,
        })
    }

    /// 以现有字节构造缓冲，不预留头部空间。主要供测试与外部 I/O 适配使用。
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut buf = Self::try_new(bytes.len(), 0)?;
        buf.extend_from_slice(bytes)?;
        Ok(buf)
    }

    /// 后备内存总长度。
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 当前可读字节数，即 `write_offset - read_offset`。
    #[inline]
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    #[inline]
    pub fn read_offset(&self) -> usize {
        self.read
    }

    #[inline]
    pub fn write_offset(&self) -> usize {
        self.write
    }

    /// 构造时预留的头部空间，`reset` 后读写偏移回到这里。
    #[inline]
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// 当前可供 `shift_left` 回退的前部空间。
    #[inline]
    pub fn front_room(&self) -> usize {
        self.read
    }

    /// 写偏移之后仍可直接写入的字节数。
    #[inline]
    pub fn spare_capacity(&self) -> usize {
        self.data.len() - self.write
    }

    /// 可读区间的只读视图。
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// 可读区间的可变视图，常用于 `shift_left` 之后填写新前插的协议头。
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.read..self.write]
    }

    /// 丢弃前 `n` 个可读字节，只推进 `read_offset`。
    pub fn shift_right(&mut self, n: usize) -> Result<()> {
        if n > self.len() {
            return Err(out_of_bounds(format!(
                "shift_right({n}) exceeds readable length {}",
                self.len()
            )));
        }
        self.read += n;
        Ok(())
    }

    /// 把 `read_offset` 向前回退 `n` 字节，为前插协议头腾出可写区间。
    pub fn shift_left(&mut self, n: usize) -> Result<()> {
        if n > self.read {
            return Err(out_of_bounds(format!(
                "shift_left({n}) exceeds front room {}",
                self.read
            )));
        }
        self.read -= n;
        Ok(())
    }

    /// 写偏移之后的空闲区间，配合 [`commit`](Self::commit) 使用。
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write..]
    }

    /// 声明 `spare_mut` 中前 `n` 字节已被写入。
    pub fn commit(&mut self, n: usize) -> Result<()> {
        if n > self.spare_capacity() {
            return Err(out_of_bounds(format!(
                "commit({n}) exceeds spare capacity {}",
                self.spare_capacity()
            )));
        }
        self.write += n;
        Ok(())
    }

    /// 把可读长度设置为 `len`（以当前 `read_offset` 为起点）。
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        let end = self
            .read
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                out_of_bounds(format!(
                    "set_len({len}) at offset {} exceeds capacity {}",
                    self.read,
                    self.data.len()
                ))
            })?;
        self.write = end;
        Ok(())
    }

    /// 仅保留前 `len` 个可读字节；`len` 不小于当前长度时无效果。
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.write = self.read + len;
        }
    }

    /// 追加字节，空间不足时扩容。扩容会迁移后备内存，但两个偏移保持不变。
    pub fn extend_from_slice(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.spare_capacity() {
            self.grow(src.len() - self.spare_capacity())?;
        }
        let end = self.write + src.len();
        self.data[self.write..end].copy_from_slice(src);
        self.write = end;
        Ok(())
    }

    /// 恢复到刚分配时的状态：内容被视为清空，前部空间恢复为 headroom。
    pub fn reset(&mut self) {
        let headroom = cmp::min(self.headroom, self.data.len());
        self.read = headroom;
        self.write = headroom;
    }

    /// 复制可读区间。
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    fn grow(&mut self, additional: usize) -> Result<()> {
        let wanted = cmp::max(additional, self.data.len());
        self.data.try_reserve_exact(wanted).map_err(|err| {
            alloc_error(format!("failed to grow buffer by {wanted} bytes")).with_cause(err)
        })?;
        let new_len = self.data.len() + wanted;
        self.data.resize(new_len, 0);
        Ok(())
    }
}

impl fmt::Debug for ShiftBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShiftBuffer")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Buf for ShiftBuffer {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.len(),
            "ShiftBuffer::advance 超出可读字节：请求 {cnt}，剩余 {}",
            self.len()
        );
        self.read += cnt;
    }
}

/// 从前部消费字节，供加密引擎等以 `io::Read` 方式吸收密文。
impl io::Read for ShiftBuffer {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = cmp::min(dst.len(), self.len());
        dst[..n].copy_from_slice(&self.data[self.read..self.read + n]);
        self.read += n;
        Ok(n)
    }
}

/// 追加写入到剩余空间，不扩容；空间耗尽时返回 `Ok(0)`。
///
/// 不扩容是刻意的：引擎输出被切分为若干个池缓冲大小的片段，每个片段独立成为一个 Context。
impl io::Write for ShiftBuffer {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let n = cmp::min(src.len(), self.spare_capacity());
        self.data[self.write..self.write + n].copy_from_slice(&src[..n]);
        self.write += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn out_of_bounds(message: String) -> CoreError {
    CoreError::new(codes::BUFFER_OUT_OF_BOUNDS, message)
        .with_category(ErrorCategory::ProtocolViolation)
}

fn alloc_error(message: String) -> CoreError {
    CoreError::new(codes::POOL_ALLOC_FAILED, message)
        .with_category(ErrorCategory::ResourceExhausted)
}
