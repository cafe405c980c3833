//! weir 的 TLS 终结节点。
//!
//! # 设计背景（Why）
//! - 代理链路通常第一跳就要剥掉 TLS：节点下方是原始连接上的密文，
//!   上方的协议识别、路由节点只看到明文；
//! - 加密引擎选用 rustls 的 sans-I/O 接口，节点只在池缓冲与引擎之间搬运字节，
//!   不持有套接字，也不阻塞工作线程。
//!
//! # 契约说明（What）
//! - [`TlsServerNode`] 实现 [`weir_core::Tunnel`]，每条 Line 一个 rustls 会话；
//! - [`TlsServerFactory`] 以类型名 `TlsServer` 注册，配置见 [`TlsServerSettings`]；
//! - 运行期控制命令：`stats` 返回 `active`/`handshakes`/`failures`，
//!   `reload` 按（可选覆盖的）`cert_file`/`key_file` 重新加载证书，只影响之后建立的连接。

mod config;
mod error;
mod node;
mod settings;

use std::sync::Arc;

use weir_core::NodeRegistry;

pub use config::{HotReloadingServerConfig, build_server_config, load_server_config};
pub use error::{TlsSetupError, codes};
pub use node::{TlsServerFactory, TlsServerNode};
pub use settings::TlsServerSettings;

/// 把 `TlsServer` 工厂登记到注册表。
pub fn register(registry: &mut NodeRegistry) {
    registry.register(Arc::new(TlsServerFactory));
}
