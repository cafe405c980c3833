use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    echo::EchoFactory,
    error::{CoreError, ErrorCategory, Result, codes},
    node::Tunnel,
    settings::NodeSettings,
};

/// 节点工厂收到的构造参数。
#[derive(Clone, Copy, Debug)]
pub struct NodeInstanceContext<'a> {
    /// 节点自身的不透明配置。
    pub settings: &'a NodeSettings,
    /// 工作线程数量，需要按线程预分配资源的节点据此决定规模。
    pub workers: usize,
    /// 节点将要占据的链路下标。
    pub index: usize,
}

/// 按类型名构造节点的工厂。
pub trait NodeFactory: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn create(&self, instance: &NodeInstanceContext<'_>) -> Result<Arc<dyn Tunnel>>;
}

/// 类型名到工厂的映射，链路装配时据此把配置中的节点名解析为实例。
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<&'static str, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    /// 空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 预先注册核心自带的节点（`Echo`）。
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoFactory));
        registry
    }

    /// 注册工厂；同名工厂被替换并返回旧值。
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) -> Option<Arc<dyn NodeFactory>> {
        self.factories.insert(factory.type_name(), factory)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn create(
        &self,
        type_name: &str,
        instance: &NodeInstanceContext<'_>,
    ) -> Result<Arc<dyn Tunnel>> {
        let factory = self.factories.get(type_name).ok_or_else(|| {
            CoreError::new(
                codes::NODE_UNKNOWN_TYPE,
                format!("no node factory registered for `{type_name}`"),
            )
            .with_category(ErrorCategory::Unsupported)
        })?;
        factory.create(instance)
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("NodeRegistry").field("types", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_reported() {
        let registry = NodeRegistry::with_builtin();
        assert!(registry.contains("Echo"));
        let settings = NodeSettings::default();
        let instance = NodeInstanceContext {
            settings: &settings,
            workers: 1,
            index: 0,
        };
        assert_eq!(
            registry.create("Echo", &instance).expect("内置节点").name(),
            "Echo"
        );
        let err = match registry.create("Socks5", &instance) {
            Ok(_) => panic!("未注册类型不应构造成功"),
            Err(err) => err,
        };
        assert_eq!(err.code(), codes::NODE_UNKNOWN_TYPE);
    }
}
