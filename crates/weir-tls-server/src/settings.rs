use std::path::PathBuf;

use serde::Deserialize;

/// `TlsServer` 节点的配置。
///
/// # 契约说明（What）
/// - `cert_file`：PEM 格式的完整证书链，默认 `cert/fullchain.pem`；
/// - `key_file`：PEM 格式的私钥（PKCS#8、PKCS#1 或 SEC1），默认 `cert/privkey.pem`；
/// - `alpn`：按优先级排列的 ALPN 协议名，默认不协商。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsServerSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub alpn: Vec<String>,
}

impl Default for TlsServerSettings {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("cert/fullchain.pem"),
            key_file: PathBuf::from("cert/privkey.pem"),
            alpn: Vec::new(),
        }
    }
}
