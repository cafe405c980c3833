//! 回显节点：把上行负载原样送回下行方向，常作为链路的最顶端，用于联调下方节点。

use std::sync::Arc;

use tracing::debug;

use crate::{
    chain::Hop,
    context::Context,
    error::Result,
    node::Tunnel,
    registry::{NodeFactory, NodeInstanceContext},
};

#[derive(Debug, Default)]
struct EchoState {
    echoed_bytes: u64,
}

/// 收到 `init` 立即回送 `est`；收到负载把同一个缓冲下行送回；收到 `fin` 释放槽位。
#[derive(Debug, Default)]
pub struct EchoNode;

impl Tunnel for EchoNode {
    fn name(&self) -> &str {
        "Echo"
    }

    fn up_stream(&self, mut ctx: Context, hop: &mut Hop<'_>) {
        let index = hop.index();
        let line = ctx.line().clone();

        if ctx.is_init() {
            line.install(index, EchoState::default());
            hop.down(Context::est(line));
            return;
        }
        if ctx.is_fin() {
            if let Some(state) = line.take::<EchoState>(index) {
                debug!(line = %line.id(), echoed = state.echoed_bytes, "echo line closed");
            }
            return;
        }
        match ctx.take_payload() {
            Some(buffer) => {
                let len = buffer.len() as u64;
                line.with_state(index, |state: &mut EchoState| state.echoed_bytes += len);
                hop.down(Context::payload(line, buffer));
            }
            None => ctx.discard(hop.buffers()),
        }
    }

    fn down_stream(&self, ctx: Context, hop: &mut Hop<'_>) {
        hop.down(ctx);
    }
}

/// 注册名 `Echo`，不读取任何配置。
#[derive(Debug, Default)]
pub struct EchoFactory;

impl NodeFactory for EchoFactory {
    fn type_name(&self) -> &'static str {
        "Echo"
    }

    fn create(&self, _instance: &NodeInstanceContext<'_>) -> Result<Arc<dyn Tunnel>> {
        Ok(Arc::new(EchoNode))
    }
}
