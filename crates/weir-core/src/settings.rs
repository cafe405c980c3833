//! 节点与缓冲池的配置模型。
//!
//! 节点配置在核心层是不透明的键值表（[`NodeSettings`]），只有节点工厂知道如何把它解释为
//! 强类型结构；池配置（[`PoolConfig`]）则由核心直接消费。

use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;

use crate::error::{CoreError, ErrorCategory, codes};

/// 配置解析失败。
#[derive(Debug, Error)]
pub enum SettingsError {
    /// 文本不是合法的 TOML。
    #[error("malformed settings document: {0}")]
    Document(#[source] toml::de::Error),
    /// 键值表无法映射到目标结构。
    #[error("settings do not match `{target}`: {source}")]
    Shape {
        target: &'static str,
        #[source]
        source: toml::de::Error,
    },
    /// 字段取值不合法。
    #[error("invalid value for `{field}`: {reason}")]
    Value {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<SettingsError> for CoreError {
    fn from(err: SettingsError) -> Self {
        CoreError::new(codes::SETTINGS_INVALID, err.to_string())
            .with_category(ErrorCategory::Unsupported)
            .with_cause(err)
    }
}

/// 节点工厂收到的不透明配置。
///
/// ```rust
/// use weir_core::NodeSettings;
///
/// #[derive(serde::Deserialize)]
/// struct Demo {
///     greeting: String,
/// }
///
/// let settings = NodeSettings::from_toml_str(r#"greeting = "hi""#).expect("合法 TOML");
/// let demo: Demo = settings.parse().expect("字段匹配");
/// assert_eq!(demo.greeting, "hi");
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeSettings(toml::Table);

impl NodeSettings {
    pub fn new(table: toml::Table) -> Self {
        Self(table)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        toml::from_str::<toml::Table>(text)
            .map(Self)
            .map_err(SettingsError::Document)
    }

    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.0.get(key)
    }

    /// 插入或覆盖一个键，返回自身以便链式构造。
    pub fn with(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn as_table(&self) -> &toml::Table {
        &self.0
    }

    /// 把键值表解释为强类型结构。
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, SettingsError> {
        toml::Value::Table(self.0.clone())
            .try_into()
            .map_err(|source| SettingsError::Shape {
                target: std::any::type_name::<T>(),
                source,
            })
    }
}

impl From<toml::Table> for NodeSettings {
    fn from(table: toml::Table) -> Self {
        Self(table)
    }
}

/// 缓冲池层级的尺寸配置。
///
/// # 契约说明（What）
/// - `master_capacity`：主池空闲条目上限，超出即销毁；
/// - `local_capacity`：每个工作线程本地空闲列表上限，`0` 表示直连主池；
/// - `buffer_size` / `headroom`：新建缓冲的可写区大小与前部预留空间；
/// - 所有字段都有默认值，配置中缺省的键保持默认。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub master_capacity: usize,
    pub local_capacity: usize,
    pub buffer_size: usize,
    pub headroom: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            master_capacity: 4096,
            local_capacity: 256,
            buffer_size: 18 * 1024,
            headroom: 128,
        }
    }
}

impl PoolConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let config: Self = toml::from_str(text).map_err(|source| SettingsError::Shape {
            target: "PoolConfig",
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.buffer_size == 0 {
            return Err(SettingsError::Value {
                field: "buffer_size",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}
