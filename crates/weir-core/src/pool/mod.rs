//! 分级对象池：每个工作线程一个无锁的 [`LocalPool`]，共享一个带互斥锁的定容 [`MasterPool`]。
//!
//! # 设计背景（Why）
//! - 每个报文都要借还缓冲，热路径上不能有锁竞争，也不能每次都走系统分配器；
//! - 主池的固定容量约束了整体驻留内存，多余条目被真正释放。
//!
//! # 契约说明（What）
//! - `acquire`：本地列表 → 主池批量补给 → 新建，三级逐次回退；池耗尽不是错误，只有分配失败才是；
//! - `release`：本地列表 → 主池批量溢出 → 销毁；
//! - 池本身对条目类型无感知，创建/销毁回调由条目类型的定义方提供。

mod buffer_pool;
mod local;
mod master;

pub use buffer_pool::{BufferPool, buffer_master};
pub use local::{LocalPool, LocalStats};
pub use master::{CreateFn, DestroyFn, MasterPool, PoolStats};
