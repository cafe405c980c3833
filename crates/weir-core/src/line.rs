use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use tracing::warn;

/// 连接在所属工作线程内的编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub u64);

/// 工作线程编号。Line 在整个生命周期内固定属于一个工作线程。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

/// I/O 层分配给原始连接（套接字、TUN 流等）的不透明句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoHandle(pub u64);

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line#{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

type Slot = RefCell<Option<Box<dyn Any>>>;

/// `Line` 是一条逻辑连接在链路上的全部状态：每个节点一个槽位，按节点在链中的下标寻址。
///
/// # 设计背景（Why）
/// - 节点只通过自己的下标访问自己的槽位，槽位之间没有别名；
/// - 槽位为空即“该节点对此连接已无状态”，任何仍持有该 Line 的代码都必须把它视为连接已失效；
/// - Line 只在所属工作线程内流转（`Rc` 且非 `Send`），因此槽位是单写者，无需加锁。
///
/// # 契约说明（What）
/// - [`with_state`](Self::with_state) 在闭包执行期间独占借用该槽位；
///   在闭包内再次进入同一槽位（例如闭包里向邻居派发，邻居又回调本节点）属于契约破坏，会直接 panic。
///   节点应先在借用内计算出待派发的 Context，释放借用后再派发；
/// - 析构时若仍有非空槽位，记录一条泄漏告警。
pub struct Line {
    id: LineId,
    worker: WorkerId,
    src_io: Option<IoHandle>,
    slots: Box<[Slot]>,
    closed: Cell<bool>,
}

impl Line {
    pub fn new(
        id: LineId,
        worker: WorkerId,
        src_io: Option<IoHandle>,
        slot_count: usize,
    ) -> Rc<Self> {
        let slots = (0..slot_count).map(|_| RefCell::new(None)).collect();
        Rc::new(Self {
            id,
            worker,
            src_io,
            slots,
            closed: Cell::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> LineId {
        self.id
    }

    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    #[inline]
    pub fn src_io(&self) -> Option<IoHandle> {
        self.src_io
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// 节点 `index` 是否仍持有此连接的状态。
    #[inline]
    pub fn is_alive(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.borrow().is_some())
    }

    /// 安装节点状态。槽位已被占用时覆盖旧状态并告警。
    pub fn install<T: 'static>(&self, index: usize, state: T) {
        let previous = self.slots[index].replace(Some(Box::new(state)));
        if previous.is_some() {
            warn!(line = %self.id, index, "node state installed twice; previous state dropped");
        }
    }

    /// 以独占借用访问节点状态；槽位为空或类型不符时返回 `None`。
    pub fn with_state<T: 'static, R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut slot = self.slots[index].borrow_mut();
        let state = slot.as_mut()?.downcast_mut::<T>()?;
        Some(f(state))
    }

    /// 取出并清空节点状态。类型不符时保持槽位不变并返回 `None`。
    pub fn take<T: 'static>(&self, index: usize) -> Option<T> {
        let mut slot = self.slots[index].borrow_mut();
        match slot.take()?.downcast::<T>() {
            Ok(state) => Some(*state),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// 仍持有状态的槽位数量。
    pub fn live_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.borrow().is_some()).count()
    }

    /// `fin` 已离开链路底部，I/O 层会关闭原始连接。
    pub fn mark_closed(&self) {
        self.closed.set(true);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("src_io", &self.src_io)
            .field("slots", &self.slots.len())
            .field("closed", &self.closed.get())
            .finish()
    }
}

impl Drop for Line {
    fn drop(&mut self) {
        let live = self.live_slots();
        if live > 0 {
            warn!(
                line = %self.id,
                worker = %self.worker,
                live,
                "line dropped while nodes still hold state"
            );
        }
    }
}
