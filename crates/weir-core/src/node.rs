use std::borrow::Cow;

use crate::{
    chain::Hop,
    context::Context,
    error::{CoreError, ErrorCategory, Result, codes},
    settings::NodeSettings,
};

/// `Tunnel` 是链路中每个节点实现的多态契约。
///
/// # 设计背景（Why）
/// - 链路是直接调用的流水线：节点在自己的入口中检查 Context，再通过 [`Hop`] 同步调用相邻节点，
///   单线程内没有排队；
/// - 节点实例在所有工作线程间共享（`Send + Sync`），每条连接的可变状态只存放在 Line 的槽位中。
///
/// # 契约说明（What）
/// - `up_stream`：由下方邻居调用（客户端 → 目的端方向）；`down_stream`：由上方邻居调用；
/// - 节点只能经由 `hop` 派发给邻居，`hop.index()` 即本节点在链中的下标，也是其 Line 槽位下标；
/// - 收到 `init` 时安装槽位状态；收到 `fin` 时释放槽位并沿原方向继续传播，每个方向恰好一次；
/// - 数据报变体默认与流式变体一致。
pub trait Tunnel: Send + Sync {
    /// 节点类型名，用于日志与注册表。
    fn name(&self) -> &str;

    fn up_stream(&self, ctx: Context, hop: &mut Hop<'_>);

    fn down_stream(&self, ctx: Context, hop: &mut Hop<'_>);

    fn packet_up_stream(&self, ctx: Context, hop: &mut Hop<'_>) {
        self.up_stream(ctx, hop);
    }

    fn packet_down_stream(&self, ctx: Context, hop: &mut Hop<'_>) {
        self.down_stream(ctx, hop);
    }

    /// 运行时控制入口，默认不支持任何命令。
    fn control(&self, command: &ControlCommand) -> Result<ControlReply> {
        Err(CoreError::new(
            codes::CONTROL_UNSUPPORTED,
            format!("node `{}` does not accept `{}`", self.name(), command.verb),
        )
        .with_category(ErrorCategory::Unsupported))
    }

    /// 链路拆除时调用一次，此后不会再有任何派发。
    fn destroy(&self) {}
}

/// 发给节点的运行时控制命令：动词加不透明参数表。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlCommand {
    pub verb: Cow<'static, str>,
    pub args: NodeSettings,
}

impl ControlCommand {
    pub fn new(verb: impl Into<Cow<'static, str>>) -> Self {
        Self {
            verb: verb.into(),
            args: NodeSettings::default(),
        }
    }

    pub fn with_args(mut self, args: NodeSettings) -> Self {
        self.args = args;
        self
    }
}

/// 控制命令的应答，与参数一样是键值表。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlReply(toml::Table);

impl ControlReply {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.0.get(key)
    }

    /// 读取整数字段，常用于统计类应答。
    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(toml::Value::as_integer)
    }
}
