use std::{fmt, rc::Rc};

use crate::{
    buffer::ShiftBuffer,
    line::{IoHandle, Line},
    pool::BufferPool,
};

/// `fin` 携带的结束原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinReason {
    /// 对端或上层正常关闭。
    Graceful,
    /// 底层连接被重置。
    Reset,
    /// 节点内部失败，附带稳定错误码。
    Failure(&'static str),
}

/// `Context` 是相邻节点之间传递的最小单元：可选的缓冲负载、生命周期信号与所属 Line。
///
/// # 契约说明（What）
/// - 至多携带一个缓冲，缓冲随 Context 一起移动；
/// - `init`（会话开始，上行）、`first`（会话后的首个负载，上行）、`est`（路由就绪，下行）、
///   `fin`（终止，双向）四个信号由构造函数决定，`first` 只能附加在负载上；
/// - Context 在一次派发中被下一个节点消费：转发、拆分，
///   或经 [`discard`](Self::discard) 把缓冲还给池。
///   直接丢弃带负载的 Context 不会泄漏内存，但缓冲会绕过池回到分配器。
#[must_use = "Context 必须被转发或通过 discard 归还缓冲"]
pub struct Context {
    payload: Option<ShiftBuffer>,
    init: bool,
    first: bool,
    est: bool,
    fin: Option<FinReason>,
    line: Rc<Line>,
    src_io: Option<IoHandle>,
}

impl Context {
    fn bare(line: Rc<Line>) -> Self {
        let src_io = line.src_io();
        Self {
            payload: None,
            init: false,
            first: false,
            est: false,
            fin: None,
            line,
            src_io,
        }
    }

    pub fn init(line: Rc<Line>) -> Self {
        Self {
            init: true,
            ..Self::bare(line)
        }
    }

    pub fn est(line: Rc<Line>) -> Self {
        Self {
            est: true,
            ..Self::bare(line)
        }
    }

    pub fn fin(line: Rc<Line>, reason: FinReason) -> Self {
        Self {
            fin: Some(reason),
            ..Self::bare(line)
        }
    }

    pub fn payload(line: Rc<Line>, buffer: ShiftBuffer) -> Self {
        Self {
            payload: Some(buffer),
            ..Self::bare(line)
        }
    }

    /// 标记为会话建立后的首个负载。
    pub fn with_first(mut self) -> Self {
        debug_assert!(self.payload.is_some(), "first 只能附加在负载上");
        self.first = true;
        self
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.init
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.first
    }

    #[inline]
    pub fn is_est(&self) -> bool {
        self.est
    }

    #[inline]
    pub fn is_fin(&self) -> bool {
        self.fin.is_some()
    }

    #[inline]
    pub fn fin_reason(&self) -> Option<FinReason> {
        self.fin
    }

    #[inline]
    pub fn line(&self) -> &Rc<Line> {
        &self.line
    }

    #[inline]
    pub fn src_io(&self) -> Option<IoHandle> {
        self.src_io
    }

    #[inline]
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub fn payload_ref(&self) -> Option<&ShiftBuffer> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut ShiftBuffer> {
        self.payload.as_mut()
    }

    /// 取走负载，Context 本身只剩信号与 Line。
    pub fn take_payload(&mut self) -> Option<ShiftBuffer> {
        self.payload.take()
    }

    /// 丢弃 Context，并把负载缓冲还给当前工作线程的池。
    pub fn discard(mut self, pool: &mut BufferPool) {
        if let Some(buffer) = self.payload.take() {
            pool.release(buffer);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("line", &self.line.id())
            .field("payload", &self.payload.as_ref().map(ShiftBuffer::len))
            .field("init", &self.init)
            .field("first", &self.first)
            .field("est", &self.est)
            .field("fin", &self.fin)
            .finish()
    }
}
