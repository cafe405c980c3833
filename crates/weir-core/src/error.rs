use std::{borrow::Cow, error::Error, fmt};

/// `CoreError` 是链路协议、缓冲池与各节点共享的稳定错误域。
///
/// # 设计背景（Why）
/// - 节点在热路径上产生的失败必须被折叠为“连接级”处置：要么等待更多 I/O，要么合成 `fin`
///   并释放该 Line 的全部状态。统一错误类型让节点只需根据 [`ErrorCategory`] 选择分支，
///   而不必解析底层库（如 TLS 引擎）的具体错误。
/// - 错误码 `code` 始终为 `'static` 字符串，便于日志检索与聚合；`message` 面向排障人员。
///
/// # 契约说明（What）
/// - **前置条件**：调用方使用 [`codes`] 模块中的稳定码值，或遵循 `<域>.<语义>` 约定的自定义码值；
/// - **后置条件**：返回值拥有独立所有权，满足 `Send + Sync + 'static`，可随 `Delivery` 跨线程移动；
/// - 未显式设置分类时，[`category`](Self::category) 回退为 [`ErrorCategory::PeerFailure`]，
///   即默认按“对端引发、连接粒度恢复”处理。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    category: Option<ErrorCategory>,
    cause: Option<ErrorCause>,
}

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以方便跨线程传递。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 框架统一的返回值别名，默认错误类型为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

impl CoreError {
    /// 构造核心错误。
    ///
    /// ```rust
    /// use weir_core::{CoreError, error::codes};
    ///
    /// let err = CoreError::new(codes::POOL_ALLOC_FAILED, "buffer allocation failed");
    /// assert_eq!(err.code(), codes::POOL_ALLOC_FAILED);
    /// assert!(err.cause().is_none());
    /// ```
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: None,
            cause: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 为错误标记结构化分类。
    ///
    /// # 契约说明（What）
    /// - **输入**：`category` 表示该错误在连接生命周期中的处置策略；
    /// - **前置条件**：应与错误码语义保持一致，例如不得把分配失败标记为 `Transient`；
    /// - **后置条件**：覆盖此前设置的分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 获取结构化错误分类，未设置时为 [`ErrorCategory::PeerFailure`]。
    pub fn category(&self) -> ErrorCategory {
        self.category.unwrap_or(ErrorCategory::PeerFailure)
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 是否为“等待更多 I/O 即可恢复”的瞬时状态。
    pub fn is_transient(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

/// 错误分类枚举，对应链路上的四类处置策略。
///
/// # 契约说明（What）
/// - `Transient`：池暂时为空、加密引擎需要更多 I/O 等，节点本地吸收，绝不上报为失败；
/// - `ResourceExhausted`：池回退后仍分配失败，对当前连接致命，需双向传播 `fin`；
/// - `ProtocolViolation`：编程契约被破坏（如握手完成前下行写入），调试构建下应直接中止；
/// - `PeerFailure` / `Security`：对端引发的失败，只影响该 Line，降级为干净的 `fin`；
/// - `Unsupported`：运行时控制命令不被节点识别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCategory {
    Transient,
    ResourceExhausted,
    ProtocolViolation,
    PeerFailure,
    Security(SecurityClass),
    Unsupported,
}

impl ErrorCategory {
    /// 该分类是否意味着连接必须终止。
    pub fn is_fatal_to_line(self) -> bool {
        !matches!(self, ErrorCategory::Transient | ErrorCategory::Unsupported)
    }
}

/// 安全类错误的细分。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecurityClass {
    /// 记录完整性、解密或协议状态被破坏。
    Integrity,
    /// 证书或身份校验失败。
    Authentication,
    /// 无法归类的安全事件。
    Unknown,
}

/// 稳定错误码集合。
pub mod codes {
    /// 池回退到分配器后依旧无法获得内存。
    pub const POOL_ALLOC_FAILED: &str = "pool.alloc_failed";
    /// 缓冲偏移越界。
    pub const BUFFER_OUT_OF_BOUNDS: &str = "buffer.out_of_bounds";
    /// 链路中没有任何节点。
    pub const CHAIN_EMPTY: &str = "chain.empty";
    /// 控制命令指向的节点下标不存在。
    pub const CHAIN_NO_SUCH_NODE: &str = "chain.no_such_node";
    /// 注册表中不存在请求的节点类型。
    pub const NODE_UNKNOWN_TYPE: &str = "node.unknown_type";
    /// 节点配置无法解析。
    pub const SETTINGS_INVALID: &str = "settings.invalid";
    /// 节点不支持的运行时控制命令。
    pub const CONTROL_UNSUPPORTED: &str = "control.unsupported";
    /// 工作线程无法启动或其投递通道已关闭。
    pub const WORKER_UNAVAILABLE: &str = "worker.unavailable";
    /// 在已释放的 Line 槽位上派发。
    pub const LINE_NOT_ALIVE: &str = "line.not_alive";
}
