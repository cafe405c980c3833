//! TLS 集成测试共用的证书、参考客户端与链路夹具。

#![allow(dead_code)]

use std::{
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

use parking_lot::Mutex;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use weir_core::{
    Chain, ChainBuilder, Context, FinReason, Hop, IoEdge, IoHandle, Line, LineId, PoolConfig,
    Tunnel, WorkerEnv, WorkerId, BufferPool, buffer_master,
};
use weir_tls_server::build_server_config;

/// 自签名证书及其 PEM 形式。
pub struct Certs {
    pub cert: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
    key_der: Vec<u8>,
}

impl Certs {
    pub fn self_signed(name: &str) -> anyhow::Result<Self> {
        let key = rcgen::KeyPair::generate()?;
        let cert = rcgen::CertificateParams::new(vec![name.to_owned()])?.self_signed(&key)?;
        Ok(Self {
            cert: cert.der().clone(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            key_der: key.serialize_der(),
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        let key = PrivateKeyDer::try_from(self.key_der.clone()).expect("私钥 DER");
        build_server_config(vec![self.cert.clone()], key, &[]).expect("构造服务端配置")
    }

    /// 只信任本证书的参考客户端，SNI 为 `localhost`。
    pub fn client(&self) -> ClientConnection {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).expect("加入信任根");
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_root_certificates(roots)
        .with_no_client_auth();
        let name = ServerName::try_from("localhost").expect("合法主机名").to_owned();
        ClientConnection::new(Arc::new(config), name).expect("创建客户端会话")
    }

    /// 把证书与私钥写入 `dir`，返回 `(cert_file, key_file)`。
    pub fn write_pem(&self, dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
        std::fs::create_dir_all(dir).expect("创建临时目录");
        let cert_file = dir.join(format!("{stem}-fullchain.pem"));
        let key_file = dir.join(format!("{stem}-privkey.pem"));
        std::fs::write(&cert_file, &self.cert_pem).expect("写入证书");
        std::fs::write(&key_file, &self.key_pem).expect("写入私钥");
        (cert_file, key_file)
    }
}

/// 链路底部观察到的输出。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wire {
    Est,
    Bytes(Vec<u8>),
    Fin(FinReason),
}

#[derive(Default)]
pub struct RecordingEdge {
    wire: Mutex<Vec<Wire>>,
}

impl IoEdge for RecordingEdge {
    fn on_down(&self, mut ctx: Context, env: &mut WorkerEnv) {
        let wire = if let Some(reason) = ctx.fin_reason() {
            Wire::Fin(reason)
        } else if ctx.is_est() {
            Wire::Est
        } else {
            let buf = ctx.take_payload().expect("下行 Context 应携带负载");
            let bytes = buf.to_vec();
            env.buffers().release(buf);
            Wire::Bytes(bytes)
        };
        self.wire.lock().push(wire);
    }
}

/// 链路顶端观察到的输入。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seen {
    Init,
    Data { first: bool, bytes: Vec<u8> },
    Fin(FinReason),
}

/// 记录上行 Context 的顶端节点；收到下行 Context 原样转发。
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

impl Tunnel for Recorder {
    fn name(&self) -> &str {
        "Recorder"
    }

    fn up_stream(&self, mut ctx: Context, hop: &mut Hop<'_>) {
        let index = hop.index();
        let seen = if ctx.is_init() {
            ctx.line().install(index, ());
            Seen::Init
        } else if let Some(reason) = ctx.fin_reason() {
            ctx.line().take::<()>(index);
            Seen::Fin(reason)
        } else {
            let first = ctx.is_first();
            let buf = ctx.take_payload().expect("上行 Context 应携带负载");
            let bytes = buf.to_vec();
            hop.buffers().release(buf);
            Seen::Data { first, bytes }
        };
        self.seen.lock().push(seen);
        ctx.discard(hop.buffers());
    }

    fn down_stream(&self, ctx: Context, hop: &mut Hop<'_>) {
        if ctx.is_fin() {
            ctx.line().take::<()>(hop.index());
        }
        hop.down(ctx);
    }
}

/// 单条 Line 的同步驱动器：直接在当前线程上喂入密文、收集底部输出。
pub struct Harness {
    pub chain: Chain,
    pub env: WorkerEnv,
    pub line: Rc<Line>,
    edge: Arc<RecordingEdge>,
}

impl Harness {
    pub fn new(nodes: Vec<Arc<dyn Tunnel>>) -> Self {
        let edge = Arc::new(RecordingEdge::default());
        let chain = nodes
            .into_iter()
            .fold(ChainBuilder::new(), ChainBuilder::node)
            .build(edge.clone())
            .expect("构建链路");
        // 缓冲刻意取小，使握手报文与密文输出被切分成多个 Context。
        let config = PoolConfig {
            master_capacity: 64,
            local_capacity: 8,
            buffer_size: 512,
            headroom: 16,
        };
        let env = WorkerEnv::new(
            WorkerId(0),
            BufferPool::new(buffer_master(&config), config.local_capacity),
        );
        let line = chain.new_line(LineId(1), WorkerId(0), Some(IoHandle(7)));
        Self {
            chain,
            env,
            line,
            edge,
        }
    }

    pub fn open(&mut self) {
        self.chain
            .feed_up(Context::init(Rc::clone(&self.line)), &mut self.env);
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let buffer = self.env.buffers().acquire_with(bytes).expect("借出缓冲");
        self.chain
            .feed_up(Context::payload(Rc::clone(&self.line), buffer), &mut self.env);
    }

    pub fn feed_down(&mut self, ctx: Context) {
        self.chain.feed_down(ctx, &mut self.env);
    }

    /// 取走底部累计的密文，保留其余信号。
    pub fn take_ciphertext(&self) -> Vec<u8> {
        let mut wire = self.edge.wire.lock();
        let mut bytes = Vec::new();
        wire.retain(|item| match item {
            Wire::Bytes(chunk) => {
                bytes.extend_from_slice(chunk);
                false
            }
            _ => true,
        });
        bytes
    }

    /// 底部累计的全部输出（不含已被取走的密文）。
    pub fn wire(&self) -> Vec<Wire> {
        self.edge.wire.lock().clone()
    }

    pub fn bytes_chunks(&self) -> usize {
        self.edge
            .wire
            .lock()
            .iter()
            .filter(|item| matches!(item, Wire::Bytes(_)))
            .count()
    }
}

/// 在参考客户端与链路之间往返搬运密文，直到双方都没有待发数据。
pub fn pump(client: &mut ClientConnection, harness: &mut Harness) -> Result<(), rustls::Error> {
    for _ in 0..16 {
        let mut outbound = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut outbound).expect("写入内存");
        }
        if !outbound.is_empty() {
            harness.feed(&outbound);
        }

        let inbound = harness.take_ciphertext();
        let mut reader = inbound.as_slice();
        while !reader.is_empty() {
            client.read_tls(&mut reader).expect("读取内存");
            client.process_new_packets()?;
        }

        if outbound.is_empty() && inbound.is_empty() {
            break;
        }
    }
    Ok(())
}

/// 完成握手后由客户端发送 `payload`，一起交给链路。
pub fn handshake_then_send(client: &mut ClientConnection, harness: &mut Harness, payload: &[u8]) {
    while client.is_handshaking() {
        let mut outbound = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut outbound).expect("写入内存");
        }
        harness.feed(&outbound);
        let inbound = harness.take_ciphertext();
        let mut reader = inbound.as_slice();
        while !reader.is_empty() {
            client.read_tls(&mut reader).expect("读取内存");
            client.process_new_packets().expect("握手应成功");
        }
    }
    client.writer().write_all(payload).expect("写入明文");
    pump(client, harness).expect("数据往返");
}
