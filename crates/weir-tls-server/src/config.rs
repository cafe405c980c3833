use std::{fmt, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use tracing::info;

use crate::{error::TlsSetupError, settings::TlsServerSettings};

/// 可在运行期整体替换的 rustls 服务端配置。
///
/// # 设计背景（Why）
/// - 证书轮换不应打断存量连接：每条 Line 在收到 `init` 时取一次快照并在自己的会话里持有，
///   之后的替换只影响新 Line；
/// - 快照读取无锁，工作线程之间不因配置而竞争。
///
/// # 契约说明（What）
/// - [`snapshot`](Self::snapshot) 返回的 `Arc` 永远有效，即便随后发生替换；
/// - [`replace`](Self::replace) 对之后的 `snapshot` 立即可见，返回被换下的旧配置。
#[derive(Clone)]
pub struct HotReloadingServerConfig {
    current: Arc<ArcSwap<ServerConfig>>,
}

impl HotReloadingServerConfig {
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            current: Arc::new(ArcSwap::new(initial)),
        }
    }

    #[inline]
    pub fn from_config(initial: ServerConfig) -> Self {
        Self::new(Arc::new(initial))
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.current.load_full()
    }

    #[inline]
    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.current.swap(next)
    }
}

impl fmt::Debug for HotReloadingServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotReloadingServerConfig")
            .finish_non_exhaustive()
    }
}

/// 以显式的 ring 提供者构造服务端配置，不依赖进程级默认提供者。
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[String],
) -> Result<ServerConfig, TlsSetupError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn.iter().map(|proto| proto.as_bytes().to_vec()).collect();
    Ok(config)
}

/// 从 PEM 文件读取证书链与私钥并构造服务端配置。
pub fn load_server_config(settings: &TlsServerSettings) -> Result<ServerConfig, TlsSetupError> {
    let certs = read_certificates(&settings.cert_file)?;
    let key = read_private_key(&settings.key_file)?;
    let config = build_server_config(certs, key, &settings.alpn)?;
    info!(
        cert_file = %settings.cert_file.display(),
        alpn = ?settings.alpn,
        "tls server config loaded"
    );
    Ok(config)
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|source| TlsSetupError::Certificates {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    PrivateKeyDer::from_pem_file(path).map_err(|source| TlsSetupError::PrivateKey {
        path: path.to_path_buf(),
        source,
    })
}
