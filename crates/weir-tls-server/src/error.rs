use std::{io, path::PathBuf};

use rustls::{AlertDescription, Error as RustlsError};
use rustls_pki_types::pem;
use thiserror::Error;
use weir_core::{CoreError, ErrorCategory, SecurityClass};

/// TLS 节点的稳定错误码。
pub mod codes {
    /// 握手阶段加密引擎报告不可恢复错误。
    pub const HANDSHAKE_FAILED: &str = "tls.handshake_failed";
    /// 握手完成后记录层解密或协议错误。
    pub const RECORD_FAILED: &str = "tls.record_failed";
    /// 向引擎灌入或从引擎取出密文时失败。
    pub const IO_FAILED: &str = "tls.io_failed";
    /// 证书、私钥或引擎配置无效。
    pub const CONFIG_INVALID: &str = "tls.config_invalid";
    /// 握手完成前收到下行明文。
    pub const NOT_ESTABLISHED: &str = "tls.not_established";
    /// 借出的池缓冲没有可写空间，引擎输出无法搬出。
    pub const BUFFER_EXHAUSTED: &str = "tls.buffer_exhausted";
}

/// 证书加载与配置构建阶段的错误。
///
/// # 契约说明（What）
/// - 只在节点构造或 `reload` 控制命令中产生，不会出现在数据路径上；
/// - 通过 `From` 转换为 [`CoreError`]（错误码 [`codes::CONFIG_INVALID`]），
///   保留原始错误作为 `source`。
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("cannot read certificate chain from `{path}`: {source}")]
    Certificates {
        path: PathBuf,
        #[source]
        source: pem::Error,
    },
    #[error("certificate file `{path}` contains no certificates")]
    NoCertificates { path: PathBuf },
    #[error("cannot read private key from `{path}`: {source}")]
    PrivateKey {
        path: PathBuf,
        #[source]
        source: pem::Error,
    },
    #[error("rustls rejected the server configuration: {0}")]
    Engine(#[from] RustlsError),
}

impl From<TlsSetupError> for CoreError {
    fn from(err: TlsSetupError) -> Self {
        CoreError::new(codes::CONFIG_INVALID, err.to_string())
            .with_category(ErrorCategory::Unsupported)
            .with_cause(err)
    }
}

/// 把 `process_new_packets` 返回的引擎错误映射为连接级失败。
pub(crate) fn engine_error(established: bool, error: RustlsError) -> CoreError {
    let code = if established {
        codes::RECORD_FAILED
    } else {
        codes::HANDSHAKE_FAILED
    };
    let category = categorize_rustls_error(&error);
    CoreError::new(code, error.to_string())
        .with_category(category)
        .with_cause(error)
}

/// 把 `read_tls`/`write_tls`/明文读写中的 `io::Error` 映射为连接级失败。
pub(crate) fn io_error(error: io::Error) -> CoreError {
    let category = categorize_with_rustls(&error);
    CoreError::new(codes::IO_FAILED, format!("tls io: {error}"))
        .with_category(category)
        .with_cause(error)
}

pub(crate) fn not_established() -> CoreError {
    CoreError::new(
        codes::NOT_ESTABLISHED,
        "plaintext arrived downstream before the handshake completed",
    )
    .with_category(ErrorCategory::ProtocolViolation)
}

pub(crate) fn buffer_exhausted() -> CoreError {
    CoreError::new(
        codes::BUFFER_EXHAUSTED,
        "pooled buffer has no spare capacity for pending tls output",
    )
    .with_category(ErrorCategory::ResourceExhausted)
}

fn categorize_with_rustls(error: &io::Error) -> ErrorCategory {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    match error.kind() {
        io::ErrorKind::WriteZero | io::ErrorKind::OutOfMemory => ErrorCategory::ResourceExhausted,
        _ => ErrorCategory::PeerFailure,
    }
}

/// 对端可引发的引擎错误按安全语义细分，其余一律视为对端失败。
pub(crate) fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => ErrorCategory::Security(SecurityClass::Integrity),
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => ErrorCategory::Security(SecurityClass::Authentication),
        FailedToGetCurrentTime | FailedToGetRandomBytes | BadMaxFragmentSize => {
            ErrorCategory::ResourceExhausted
        }
        AlertReceived(alert) => alert_to_category(alert),
        NoApplicationProtocol => ErrorCategory::Security(SecurityClass::Unknown),
        _ => ErrorCategory::PeerFailure,
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired
        | AccessDenied => ErrorCategory::Security(SecurityClass::Authentication),
        DecodeError
        | DecryptError
        | DecryptionFailed
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | InsufficientSecurity
        | InappropriateFallback
        | MissingExtension
        | UnsupportedExtension
        | UnrecognisedName
        | NoApplicationProtocol
        | ProtocolVersion => ErrorCategory::Security(SecurityClass::Integrity),
        _ => ErrorCategory::PeerFailure,
    }
}
