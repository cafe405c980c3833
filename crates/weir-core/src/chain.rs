use std::{fmt, rc::Rc, sync::Arc};

use tracing::{debug, error};

use crate::{
    context::Context,
    error::{CoreError, ErrorCategory, Result, codes},
    line::{IoHandle, Line, LineId, WorkerId},
    node::{ControlCommand, ControlReply, Tunnel},
    pool::BufferPool,
    registry::{NodeInstanceContext, NodeRegistry},
    settings::NodeSettings,
    worker::WorkerEnv,
};

/// 链路底部的 I/O 协作者：接收离开 0 号节点向下的 Context。
///
/// 实现方负责把负载写到原始连接，并在写出后把缓冲还给 `env` 中的池；
/// 收到 `fin` 时关闭原始连接。
pub trait IoEdge: Send + Sync {
    fn on_down(&self, ctx: Context, env: &mut WorkerEnv);

    fn on_packet_down(&self, ctx: Context, env: &mut WorkerEnv) {
        self.on_down(ctx, env);
    }
}

/// 构建完成后不可变的节点序列，所有工作线程共享同一实例。
///
/// # 契约说明（What）
/// - 节点下标即其 Line 槽位下标，链路拓扑在连接生命周期内不变；
/// - 由 I/O 层注入的 Context 从 0 号节点进入（[`feed_up`](Self::feed_up)），
///   离开 0 号节点向下的 Context 交给 [`IoEdge`]；
/// - 向已释放槽位的节点派发非 `init` 的 Context 属于契约破坏：调试构建直接 panic，
///   发布构建记录错误并回收该 Context。
pub struct Chain {
    nodes: Box<[Arc<dyn Tunnel>]>,
    edge: Arc<dyn IoEdge>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Stream,
    Packet,
}

impl Chain {
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&Arc<dyn Tunnel>> {
        self.nodes.get(index)
    }

    /// 为新连接创建 Line，每个节点一个空槽位。
    pub fn new_line(&self, id: LineId, worker: WorkerId, src_io: Option<IoHandle>) -> Rc<Line> {
        Line::new(id, worker, src_io, self.nodes.len())
    }

    /// 把 I/O 层产生的 Context 注入 0 号节点的上行入口。
    pub fn feed_up(&self, ctx: Context, env: &mut WorkerEnv) {
        self.dispatch(0, Direction::Up, Mode::Stream, ctx, env);
    }

    pub fn feed_packet_up(&self, ctx: Context, env: &mut WorkerEnv) {
        self.dispatch(0, Direction::Up, Mode::Packet, ctx, env);
    }

    /// 把链路顶端协作者（如出站连接的 I/O 线程）产生的 Context 注入最上层节点的下行入口。
    pub fn feed_down(&self, ctx: Context, env: &mut WorkerEnv) {
        match self.nodes.len().checked_sub(1) {
            Some(top) => self.dispatch(top, Direction::Down, Mode::Stream, ctx, env),
            None => self.leave_bottom(Mode::Stream, ctx, env),
        }
    }

    /// 向 `index` 号节点发送运行时控制命令。
    pub fn control(&self, index: usize, command: &ControlCommand) -> Result<ControlReply> {
        let node = self.nodes.get(index).ok_or_else(|| {
            CoreError::new(
                codes::CHAIN_NO_SUCH_NODE,
                format!("chain has {} nodes, no node at {index}", self.nodes.len()),
            )
            .with_category(ErrorCategory::Unsupported)
        })?;
        node.control(command)
    }

    /// 依次通知各节点链路已拆除。调用方须保证此后不再派发。
    pub fn destroy(&self) {
        for node in self.nodes.iter() {
            node.destroy();
        }
    }

    fn dispatch(
        &self,
        target: usize,
        direction: Direction,
        mode: Mode,
        ctx: Context,
        env: &mut WorkerEnv,
    ) {
        let Some(node) = self.nodes.get(target) else {
            reject(env, ctx, target, "no node above the top of the chain");
            return;
        };
        let admissible = match direction {
            Direction::Up => ctx.is_init() || ctx.line().is_alive(target),
            Direction::Down => ctx.line().is_alive(target),
        };
        if !admissible {
            reject(env, ctx, target, "dispatch into a released node slot");
            return;
        }

        let mut hop = Hop {
            chain: self,
            index: target,
            env,
        };
        match (direction, mode) {
            (Direction::Up, Mode::Stream) => node.up_stream(ctx, &mut hop),
            (Direction::Up, Mode::Packet) => node.packet_up_stream(ctx, &mut hop),
            (Direction::Down, Mode::Stream) => node.down_stream(ctx, &mut hop),
            (Direction::Down, Mode::Packet) => node.packet_down_stream(ctx, &mut hop),
        }
    }

    fn leave_bottom(&self, mode: Mode, ctx: Context, env: &mut WorkerEnv) {
        if ctx.is_fin() {
            ctx.line().mark_closed();
        }
        match mode {
            Mode::Stream => self.edge.on_down(ctx, env),
            Mode::Packet => self.edge.on_packet_down(ctx, env),
        }
    }
}

fn reject(env: &mut WorkerEnv, ctx: Context, target: usize, what: &'static str) {
    error!(
        line = %ctx.line().id(),
        worker = %env.id(),
        node = target,
        init = ctx.is_init(),
        fin = ctx.is_fin(),
        "{what}"
    );
    if cfg!(debug_assertions) {
        panic!("链路契约被破坏：{what}（节点 {target}）");
    }
    ctx.discard(env.buffers());
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|node| node.name()))
            .finish()
    }
}

/// 节点在一次派发中持有的“位置”：所在链路、自身下标与当前工作线程环境。
///
/// 节点只能通过 `Hop` 把 Context 交给相邻节点，从而保证不会派发给自己，
/// 也不会跨越邻居直接访问更远的节点。
pub struct Hop<'a> {
    chain: &'a Chain,
    index: usize,
    env: &'a mut WorkerEnv,
}

impl Hop<'_> {
    /// 本节点在链中的下标，同时也是其 Line 槽位下标。
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn env(&mut self) -> &mut WorkerEnv {
        self.env
    }

    #[inline]
    pub fn buffers(&mut self) -> &mut BufferPool {
        self.env.buffers()
    }

    /// 是否存在上方邻居。
    #[inline]
    pub fn has_upstream(&self) -> bool {
        self.index + 1 < self.chain.len()
    }

    pub fn up(&mut self, ctx: Context) {
        self.chain
            .dispatch(self.index + 1, Direction::Up, Mode::Stream, ctx, self.env);
    }

    pub fn packet_up(&mut self, ctx: Context) {
        self.chain
            .dispatch(self.index + 1, Direction::Up, Mode::Packet, ctx, self.env);
    }

    pub fn down(&mut self, ctx: Context) {
        self.forward_down(Mode::Stream, ctx);
    }

    pub fn packet_down(&mut self, ctx: Context) {
        self.forward_down(Mode::Packet, ctx);
    }

    fn forward_down(&mut self, mode: Mode, ctx: Context) {
        match self.index.checked_sub(1) {
            Some(target) => self
                .chain
                .dispatch(target, Direction::Down, mode, ctx, self.env),
            None => self.chain.leave_bottom(mode, ctx, self.env),
        }
    }
}

/// 按顺序装配节点，产出不可变的 [`Chain`]。
#[derive(Default)]
pub struct ChainBuilder {
    nodes: Vec<Arc<dyn Tunnel>>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个已构造的节点，位于当前所有节点的上方。
    pub fn node(mut self, node: Arc<dyn Tunnel>) -> Self {
        self.nodes.push(node);
        self
    }

    /// 通过注册表按类型名构造并追加节点。
    pub fn node_from(
        mut self,
        registry: &NodeRegistry,
        type_name: &str,
        settings: &NodeSettings,
        workers: usize,
    ) -> Result<Self> {
        let instance = NodeInstanceContext {
            settings,
            workers,
            index: self.nodes.len(),
        };
        self.nodes.push(registry.create(type_name, &instance)?);
        Ok(self)
    }

    pub fn build(self, edge: Arc<dyn IoEdge>) -> Result<Chain> {
        if self.nodes.is_empty() {
            return Err(CoreError::new(codes::CHAIN_EMPTY, "a chain needs at least one node")
                .with_category(ErrorCategory::Unsupported));
        }
        let chain = Chain {
            nodes: self.nodes.into_boxed_slice(),
            edge,
        };
        debug!(nodes = ?chain, "chain built");
        Ok(chain)
    }
}
