//! `weir-core` 定义隧道链路的核心协议：缓冲与分级对象池、Context 与 Line 模型、
//! 节点契约 [`Tunnel`] 以及把它们串联起来的 [`Chain`] 与工作线程。
//!
//! # 模块定位（Why）
//! - 流量沿一条固定的节点链路流动（监听 → TLS 终结 → 协议分流 → 出站连接），
//!   每个节点以同步直接调用的方式把 Context 交给相邻节点；
//! - 每个报文的缓冲都来自分级池：线程本地列表是无锁快速路径，带锁的主池只在成批补给/溢出时介入。
//!
//! # 结构概览（How）
//! - [`buffer`]：可原地裁剪前后缀的 [`ShiftBuffer`]；
//! - [`pool`]：[`MasterPool`]、[`LocalPool`] 与面向缓冲的 [`BufferPool`]；
//! - [`context`] / [`line`]：节点间传递的单元与按连接划分的节点状态槽位；
//! - [`node`] / [`chain`] / [`registry`]：节点契约、链路派发与按类型名构造节点；
//! - [`worker`]：按线程分片运行链路，并提供跨线程投递通道；
//! - [`echo`]：内置的回显节点。
//!
//! # 并发模型（What）
//! - 一条连接的 Line 固定在一个工作线程上，全部派发在该线程内同步完成；
//! - 唯一的跨线程协调点是主池的互斥锁与投递通道。

pub mod buffer;
pub mod chain;
pub mod context;
pub mod echo;
pub mod error;
pub mod line;
pub mod node;
pub mod pool;
pub mod registry;
pub mod settings;
mod sync;
pub mod worker;

pub use buffer::ShiftBuffer;
pub use chain::{Chain, ChainBuilder, Hop, IoEdge};
pub use context::{Context, FinReason};
pub use echo::{EchoFactory, EchoNode};
pub use error::{CoreError, ErrorCategory, Result, SecurityClass};
pub use line::{IoHandle, Line, LineId, WorkerId};
pub use node::{ControlCommand, ControlReply, Tunnel};
pub use pool::{BufferPool, LocalPool, LocalStats, MasterPool, PoolStats, buffer_master};
pub use registry::{NodeFactory, NodeInstanceContext, NodeRegistry};
pub use settings::{NodeSettings, PoolConfig, SettingsError};
pub use worker::{Delivery, Worker, WorkerConfig, WorkerEnv, WorkerHandle};
