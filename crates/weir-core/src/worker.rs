//! 工作线程：每个线程独占一个缓冲池与一组 Line，同一连接的全部派发都在所属线程内同步完成。
//!
//! # 设计背景（Why）
//! - Line 固定在一个工作线程上，节点槽位因此是单写者，无需任何连接级锁；
//! - 线程外的生产者（设备读线程、监听线程）只能通过投递通道交付缓冲，
//!   缓冲的所有权在投递那一刻整体转移给工作线程，这是唯一的跨线程所有权转移点。
//!
//! # 契约说明（What）
//! - [`Delivery::Open`] 为原始连接创建 Line 并向链路注入 `init`；
//! - [`Delivery::Data`]/[`Delivery::Datagram`] 把缓冲包装成负载 Context 注入 0 号节点；
//! - [`Delivery::Close`] 注入 `fin`（超时、套接字错误等由 I/O 层以同样方式表达）；
//! - `fin` 从链路底部离开或收到 `Close` 后，Line 从映射表中移除；
//! - [`Delivery::Shutdown`] 或通道断开时，对所有存活 Line 注入 `fin` 后退出。

use std::{
    collections::HashMap,
    rc::Rc,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::{
    buffer::ShiftBuffer,
    chain::Chain,
    context::{Context, FinReason},
    error::{CoreError, ErrorCategory, Result, codes},
    line::{IoHandle, Line, LineId, WorkerId},
    pool::{BufferPool, MasterPool},
    settings::PoolConfig,
};

/// 派发期间注入到每个节点的工作线程环境。
pub struct WorkerEnv {
    id: WorkerId,
    buffers: BufferPool,
}

impl WorkerEnv {
    pub fn new(id: WorkerId, buffers: BufferPool) -> Self {
        Self { id, buffers }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn buffers(&mut self) -> &mut BufferPool {
        &mut self.buffers
    }
}

/// 跨线程投递给工作线程的事件。
#[derive(Debug)]
pub enum Delivery {
    Open { io: IoHandle },
    Data { io: IoHandle, buffer: ShiftBuffer },
    Datagram { io: IoHandle, buffer: ShiftBuffer },
    Close { io: IoHandle, reason: FinReason },
    Shutdown,
}

/// 工作线程参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub id: WorkerId,
    /// 本地缓冲空闲列表容量。
    pub local_capacity: usize,
    /// 投递通道容量；`None` 表示无界。
    pub inbox_capacity: Option<usize>,
}

impl WorkerConfig {
    pub fn new(id: WorkerId, pool: &PoolConfig) -> Self {
        Self {
            id,
            local_capacity: pool.local_capacity,
            inbox_capacity: Some(1024),
        }
    }
}

pub struct Worker {
    env: WorkerEnv,
    chain: Arc<Chain>,
    inbox: Receiver<Delivery>,
    lines: HashMap<IoHandle, Rc<Line>>,
    next_line: u64,
    stopped: bool,
}

impl Worker {
    /// 在当前线程构造工作线程状态，返回其投递端。主要用于测试与自定义事件循环。
    pub fn new(
        config: &WorkerConfig,
        chain: Arc<Chain>,
        master: Arc<MasterPool<ShiftBuffer>>,
    ) -> (Self, Sender<Delivery>) {
        let (sender, inbox) = match config.inbox_capacity {
            Some(capacity) => crossbeam_channel::bounded(capacity),
            None => crossbeam_channel::unbounded(),
        };
        let worker = Self {
            env: WorkerEnv::new(config.id, BufferPool::new(master, config.local_capacity)),
            chain,
            inbox,
            lines: HashMap::new(),
            next_line: 0,
            stopped: false,
        };
        (worker, sender)
    }

    /// 启动具名 OS 线程运行工作循环。Line 与 Context 不是 `Send`，因此 Worker 在线程内部构造。
    pub fn spawn(
        config: WorkerConfig,
        chain: Arc<Chain>,
        master: Arc<MasterPool<ShiftBuffer>>,
    ) -> Result<WorkerHandle> {
        let id = config.id;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name(format!("weir-worker-{}", id.0))
            .spawn(move || {
                let (worker, sender) = Worker::new(&config, chain, master);
                if ready_tx.send(sender).is_err() {
                    return;
                }
                worker.run();
            })
            .map_err(|err| unavailable(id, "failed to spawn worker thread").with_cause(err))?;
        let sender = ready_rx
            .recv()
            .map_err(|_| unavailable(id, "worker thread exited before it was ready"))?;
        Ok(WorkerHandle { id, sender, thread })
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.env.id()
    }

    pub fn env(&mut self) -> &mut WorkerEnv {
        &mut self.env
    }

    pub fn active_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, io: IoHandle) -> Option<&Rc<Line>> {
        self.lines.get(&io)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// 非阻塞地处理所有已到达的投递，返回处理数量。
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while !self.stopped {
            match self.inbox.try_recv() {
                Ok(delivery) => {
                    self.handle(delivery);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stop(FinReason::Reset);
                    break;
                }
            }
        }
        handled
    }

    /// 阻塞运行，直到收到 `Shutdown` 或所有投递端断开。
    pub fn run(mut self) {
        info!(worker = %self.id(), nodes = self.chain.len(), "worker started");
        while !self.stopped {
            match self.inbox.recv() {
                Ok(delivery) => self.handle(delivery),
                Err(_) => self.stop(FinReason::Reset),
            }
        }
        info!(worker = %self.id(), "worker stopped");
    }

    /// 处理单个投递。
    pub fn handle(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Open { io } => self.open(io),
            Delivery::Data { io, buffer } => self.feed(io, buffer, false),
            Delivery::Datagram { io, buffer } => self.feed(io, buffer, true),
            Delivery::Close { io, reason } => self.close(io, reason),
            Delivery::Shutdown => self.stop(FinReason::Graceful),
        }
    }

    fn open(&mut self, io: IoHandle) {
        if self.lines.contains_key(&io) {
            warn!(worker = %self.id(), io = io.0, "duplicate open for a live line ignored");
            return;
        }
        let line = self
            .chain
            .new_line(LineId(self.next_line), self.env.id(), Some(io));
        self.next_line += 1;
        self.lines.insert(io, Rc::clone(&line));
        debug!(worker = %self.id(), line = %line.id(), io = io.0, "line opened");

        self.chain.feed_up(Context::init(Rc::clone(&line)), &mut self.env);
        self.reap(io, &line);
    }

    fn feed(&mut self, io: IoHandle, buffer: ShiftBuffer, datagram: bool) {
        let Some(line) = self.lines.get(&io).cloned() else {
            debug!(worker = %self.id(), io = io.0, "data for unknown line dropped");
            self.env.buffers().release(buffer);
            return;
        };
        if !line.is_alive(0) {
            debug!(worker = %self.id(), line = %line.id(), "data for a released line dropped");
            self.env.buffers().release(buffer);
            self.lines.remove(&io);
            return;
        }
        let ctx = Context::payload(Rc::clone(&line), buffer);
        if datagram {
            self.chain.feed_packet_up(ctx, &mut self.env);
        } else {
            self.chain.feed_up(ctx, &mut self.env);
        }
        self.reap(io, &line);
    }

    fn close(&mut self, io: IoHandle, reason: FinReason) {
        let Some(line) = self.lines.remove(&io) else {
            return;
        };
        debug!(worker = %self.id(), line = %line.id(), ?reason, "line closed");
        if line.is_alive(0) {
            self.chain.feed_up(Context::fin(line, reason), &mut self.env);
        }
    }

    fn stop(&mut self, reason: FinReason) {
        let live: Vec<IoHandle> = self.lines.keys().copied().collect();
        for io in live {
            self.close(io, reason);
        }
        self.stopped = true;
    }

    fn reap(&mut self, io: IoHandle, line: &Rc<Line>) {
        if line.is_closed() {
            self.lines.remove(&io);
            debug!(worker = %self.id(), line = %line.id(), "line finished at the edge");
        }
    }
}

/// 运行中的工作线程句柄。
pub struct WorkerHandle {
    id: WorkerId,
    sender: Sender<Delivery>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// 克隆投递端，供 I/O 线程持有。
    pub fn sender(&self) -> Sender<Delivery> {
        self.sender.clone()
    }

    /// 投递事件；工作线程已退出时返回错误，事件中的缓冲随之释放。
    pub fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.sender
            .send(delivery)
            .map_err(|_| unavailable(self.id, "worker inbox is closed"))
    }

    /// 请求停机并等待线程退出。
    pub fn shutdown(self) -> Result<()> {
        let _ = self.sender.send(Delivery::Shutdown);
        drop(self.sender);
        self.thread
            .join()
            .map_err(|_| unavailable(self.id, "worker thread panicked"))
    }
}

fn unavailable(id: WorkerId, message: &'static str) -> CoreError {
    CoreError::new(codes::WORKER_UNAVAILABLE, format!("{id}: {message}"))
        .with_category(ErrorCategory::ResourceExhausted)
}
