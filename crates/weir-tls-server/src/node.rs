//! `TlsServer` 节点：在链路上终结 TLS，下方是密文，上方是明文。
//!
//! # 设计背景（Why）
//! - rustls 的 `ServerConnection` 本身就是“内存中的记录缓冲 + 握手状态机”，
//!   节点只负责在池缓冲与引擎之间搬运字节，不接触套接字；
//! - 每条 Line 的会话状态放在节点自己的槽位里，节点实例本身只持有共享配置与计数器。
//!
//! # 逻辑解析（How）
//! - 每次入口先在槽位借用内驱动引擎，把要派发的 Context 收集成批，释放借用后再按序派发；
//! - 派发过程中若邻居拆除了本节点的槽位，剩余批次直接回收，不再派发；
//! - 致命错误、对端 `close_notify` 都汇入同一条拆除路径：取出状态、尽力冲刷告警记录、
//!   向尚未通知的方向合成 `fin`。
//!
//! # 契约说明（What）
//! - `init` 在握手完成时才继续上行；握手完成前已到达的应用数据在同一次调用中随后上行，不丢弃；
//! - 首个明文负载带 `first`，每条 Line 恰好一次；
//! - 只有已经上行过 `init`，才会向上传播 `fin`。

use std::{
    io::{self, Read, Write},
    path::PathBuf,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use rustls::ServerConnection;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use weir_core::{
    BufferPool, Context, ControlCommand, ControlReply, CoreError, ErrorCategory, FinReason, Hop,
    Line, NodeFactory, NodeInstanceContext, ShiftBuffer, Tunnel, error::codes as core_codes,
};

use crate::{
    config::{HotReloadingServerConfig, load_server_config},
    error::{self, TlsSetupError},
    settings::TlsServerSettings,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Established,
    Closed,
}

/// 单条 Line 上的会话状态。
struct TlsLine {
    conn: ServerConnection,
    phase: Phase,
    init_sent: bool,
    first_sent: bool,
}

/// 一次入口调用中待派发的 Context。
enum Emit {
    Up(Context),
    Down(Context),
}

/// 驱动引擎后的结论：继续，或对端已发送 `close_notify`。
enum Progress {
    Open,
    PeerClosed,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicU64,
    handshakes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ReloadArgs {
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

pub struct TlsServerNode {
    config: HotReloadingServerConfig,
    settings: ArcSwap<TlsServerSettings>,
    counters: Counters,
}

impl TlsServerNode {
    pub fn new(settings: TlsServerSettings, config: HotReloadingServerConfig) -> Self {
        Self {
            config,
            settings: ArcSwap::from_pointee(settings),
            counters: Counters::default(),
        }
    }

    /// 按配置中的路径加载证书与私钥。
    pub fn from_settings(settings: TlsServerSettings) -> Result<Self, TlsSetupError> {
        let config = load_server_config(&settings)?;
        Ok(Self::new(settings, HotReloadingServerConfig::from_config(config)))
    }

    /// 热更容器。替换后只有新建的 Line 使用新配置。
    pub fn config(&self) -> &HotReloadingServerConfig {
        &self.config
    }

    fn open(&self, ctx: Context, hop: &mut Hop<'_>) {
        let index = hop.index();
        let line = Rc::clone(ctx.line());
        match ServerConnection::new(self.config.snapshot()) {
            Ok(conn) => {
                line.install(
                    index,
                    TlsLine {
                        conn,
                        phase: Phase::Handshaking,
                        init_sent: false,
                        first_sent: false,
                    },
                );
                self.counters.active.fetch_add(1, Ordering::Relaxed);
                debug!(line = %line.id(), index, "tls session allocated");
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let err = error::engine_error(false, err);
                warn!(
                    line = %line.id(),
                    index,
                    code = err.code(),
                    error = %err,
                    "tls session rejected"
                );
                hop.down(Context::fin(line, FinReason::Failure(err.code())));
            }
        }
    }

    fn ciphertext(&self, input: ShiftBuffer, line: &Rc<Line>, hop: &mut Hop<'_>) {
        let index = hop.index();
        let mut emits = Vec::new();
        let mut pending = Some(input);
        let outcome = line
            .with_state(index, |state: &mut TlsLine| {
                pending
                    .take()
                    .map(|input| absorb(state, input, line, hop.buffers(), &mut emits))
            })
            .flatten();
        if let Some(input) = pending {
            hop.buffers().release(input);
        }
        let Some(outcome) = outcome else {
            debug!(line = %line.id(), index, "ciphertext for a released tls slot recycled");
            return;
        };
        if emits.iter().any(|emit| matches!(emit, Emit::Up(ctx) if ctx.is_init())) {
            self.counters.handshakes.fetch_add(1, Ordering::Relaxed);
            debug!(line = %line.id(), index, "tls handshake complete");
        }

        flush(hop, line, emits, true);
        if !line.is_alive(index) {
            return;
        }
        match outcome {
            Ok(Progress::Open) => {}
            Ok(Progress::PeerClosed) => {
                debug!(line = %line.id(), index, "peer sent close_notify");
                self.teardown(line, hop, FinReason::Graceful, true);
            }
            Err(err) => self.fail(line, hop, err),
        }
    }

    fn plaintext(&self, mut ctx: Context, hop: &mut Hop<'_>) {
        let index = hop.index();
        let line = Rc::clone(ctx.line());
        let Some(plain) = ctx.take_payload() else {
            ctx.discard(hop.buffers());
            return;
        };
        let phase = line
            .with_state(index, |state: &mut TlsLine| state.phase)
            .unwrap_or(Phase::Closed);
        match phase {
            Phase::Established => {}
            Phase::Closed => {
                hop.buffers().release(plain);
                return;
            }
            Phase::Handshaking => {
                hop.buffers().release(plain);
                error!(
                    line = %line.id(),
                    index,
                    "plaintext sent downstream before the tls handshake completed"
                );
                if cfg!(debug_assertions) {
                    panic!("下行明文早于 TLS 握手完成（{}）", line.id());
                }
                self.fail(&line, hop, error::not_established());
                return;
            }
        }

        let mut emits = Vec::new();
        let mut pending = Some(plain);
        let outcome = line
            .with_state(index, |state: &mut TlsLine| {
                pending
                    .take()
                    .map(|plain| seal(&mut state.conn, plain, &line, hop.buffers(), &mut emits))
            })
            .flatten();
        if let Some(plain) = pending {
            hop.buffers().release(plain);
        }
        flush(hop, &line, emits, true);
        if let Some(Err(err)) = outcome {
            self.fail(&line, hop, err);
        }
    }

    /// 上方发来 `fin`：发送 `close_notify` 后向下传播。
    fn close_from_above(&self, ctx: Context, hop: &mut Hop<'_>) {
        let line = Rc::clone(ctx.line());
        let reason = ctx.fin_reason().unwrap_or(FinReason::Graceful);
        ctx.discard(hop.buffers());
        self.teardown(&line, hop, reason, false);
    }

    /// 下方发来 `fin`：原始连接已经结束，无需再写任何记录。
    fn close_from_below(&self, ctx: Context, hop: &mut Hop<'_>) {
        let index = hop.index();
        let line = Rc::clone(ctx.line());
        let reason = ctx.fin_reason().unwrap_or(FinReason::Reset);
        ctx.discard(hop.buffers());
        let Some(state) = line.take::<TlsLine>(index) else {
            return;
        };
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        debug!(
            line = %line.id(),
            index,
            phase = ?state.phase,
            ?reason,
            "tls line closed by transport"
        );
        if state.init_sent {
            flush(hop, &line, vec![Emit::Up(Context::fin(line.clone(), reason))], false);
        }
    }

    fn fail(&self, line: &Rc<Line>, hop: &mut Hop<'_>, err: CoreError) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            line = %line.id(),
            index = hop.index(),
            code = err.code(),
            category = ?err.category(),
            error = %err,
            "tls line failed"
        );
        self.teardown(line, hop, FinReason::Failure(err.code()), true);
    }

    /// 唯一的拆除路径：取出状态，尽力冲刷待发记录（告警或 `close_notify`），
    /// 向下传播 `fin`，需要时也向上传播。
    fn teardown(&self, line: &Rc<Line>, hop: &mut Hop<'_>, reason: FinReason, notify_up: bool) {
        let index = hop.index();
        let Some(mut state) = line.take::<TlsLine>(index) else {
            return;
        };
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        if !matches!(reason, FinReason::Failure(_)) {
            state.conn.send_close_notify();
        }

        let mut emits = Vec::new();
        if let Err(err) = drain(&mut state.conn, line, hop.buffers(), &mut emits) {
            debug!(
                line = %line.id(),
                index,
                error = %err,
                "pending tls records dropped during teardown"
            );
        }
        emits.push(Emit::Down(Context::fin(line.clone(), reason)));
        if notify_up && state.init_sent {
            emits.push(Emit::Up(Context::fin(line.clone(), reason)));
        }
        flush(hop, line, emits, false);
    }
}

impl Tunnel for TlsServerNode {
    fn name(&self) -> &str {
        "TlsServer"
    }

    fn up_stream(&self, mut ctx: Context, hop: &mut Hop<'_>) {
        if ctx.is_init() {
            self.open(ctx, hop);
            return;
        }
        if ctx.is_fin() {
            self.close_from_below(ctx, hop);
            return;
        }
        let line = Rc::clone(ctx.line());
        match ctx.take_payload() {
            Some(input) => self.ciphertext(input, &line, hop),
            None => ctx.discard(hop.buffers()),
        }
    }

    fn down_stream(&self, ctx: Context, hop: &mut Hop<'_>) {
        if ctx.is_fin() {
            self.close_from_above(ctx, hop);
        } else if ctx.has_payload() {
            self.plaintext(ctx, hop);
        } else {
            hop.down(ctx);
        }
    }

    fn control(&self, command: &ControlCommand) -> weir_core::Result<ControlReply> {
        match command.verb.as_ref() {
            "stats" => {
                let read = |counter: &AtomicU64| {
                    i64::try_from(counter.load(Ordering::Relaxed)).unwrap_or(i64::MAX)
                };
                Ok(ControlReply::default()
                    .with("active", read(&self.counters.active))
                    .with("handshakes", read(&self.counters.handshakes))
                    .with("failures", read(&self.counters.failures)))
            }
            "reload" => {
                let args: ReloadArgs = command.args.parse()?;
                let mut next = TlsServerSettings::clone(&self.settings.load());
                if let Some(cert_file) = args.cert_file {
                    next.cert_file = cert_file;
                }
                if let Some(key_file) = args.key_file {
                    next.key_file = key_file;
                }
                let config = load_server_config(&next)?;
                self.config.replace(Arc::new(config));
                info!(cert_file = %next.cert_file.display(), "tls certificates reloaded");
                self.settings.store(Arc::new(next));
                Ok(ControlReply::default().with("reloaded", true))
            }
            other => Err(CoreError::new(
                core_codes::CONTROL_UNSUPPORTED,
                format!("TlsServer does not accept `{other}`"),
            )
            .with_category(ErrorCategory::Unsupported)),
        }
    }

    fn destroy(&self) {
        info!(
            active = self.counters.active.load(Ordering::Relaxed),
            handshakes = self.counters.handshakes.load(Ordering::Relaxed),
            failures = self.counters.failures.load(Ordering::Relaxed),
            "tls server node destroyed"
        );
    }
}

/// 吸收一段密文：推进握手、冲刷引擎输出、读取明文，直到输入耗尽。
fn absorb(
    state: &mut TlsLine,
    mut input: ShiftBuffer,
    line: &Rc<Line>,
    pool: &mut BufferPool,
    emits: &mut Vec<Emit>,
) -> Result<Progress, CoreError> {
    let outcome = absorb_from(state, &mut input, line, pool, emits);
    pool.release(input);
    outcome
}

fn absorb_from(
    state: &mut TlsLine,
    input: &mut ShiftBuffer,
    line: &Rc<Line>,
    pool: &mut BufferPool,
    emits: &mut Vec<Emit>,
) -> Result<Progress, CoreError> {
    while !input.is_empty() {
        let read = state.conn.read_tls(input).map_err(error::io_error)?;
        if read == 0 {
            break;
        }
        let io_state = state
            .conn
            .process_new_packets()
            .map_err(|err| error::engine_error(state.phase == Phase::Established, err))?;
        drain(&mut state.conn, line, pool, emits)?;

        if state.phase == Phase::Handshaking && !state.conn.is_handshaking() {
            state.phase = Phase::Established;
            state.init_sent = true;
            emits.push(Emit::Up(Context::init(line.clone())));
        }
        if state.phase == Phase::Established {
            read_plaintext(state, line, pool, emits)?;
        }
        if io_state.peer_has_closed() {
            state.phase = Phase::Closed;
            return Ok(Progress::PeerClosed);
        }
    }
    Ok(Progress::Open)
}

/// 把已解密的明文按池缓冲大小切片上行。
///
/// 读入零字节的缓冲会被误读为“明文已取尽”，所以没有可写空间的缓冲直接作为资源耗尽上报。
fn read_plaintext(
    state: &mut TlsLine,
    line: &Rc<Line>,
    pool: &mut BufferPool,
    emits: &mut Vec<Emit>,
) -> Result<(), CoreError> {
    loop {
        let mut buf = pool.acquire()?;
        if buf.spare_capacity() == 0 {
            pool.release(buf);
            return Err(error::buffer_exhausted());
        }
        match state.conn.reader().read(buf.spare_mut()) {
            Ok(0) => {
                pool.release(buf);
                return Ok(());
            }
            Ok(n) => {
                buf.commit(n)?;
                let mut ctx = Context::payload(line.clone(), buf);
                if !state.first_sent {
                    state.first_sent = true;
                    ctx = ctx.with_first();
                }
                emits.push(Emit::Up(ctx));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                pool.release(buf);
                return Ok(());
            }
            Err(err) => {
                pool.release(buf);
                return Err(error::io_error(err));
            }
        }
    }
}

/// 加密一段下行明文，密文按池缓冲大小切片下行。明文缓冲无论成败都还给池。
fn seal(
    conn: &mut ServerConnection,
    mut plain: ShiftBuffer,
    line: &Rc<Line>,
    pool: &mut BufferPool,
    emits: &mut Vec<Emit>,
) -> Result<(), CoreError> {
    let outcome = seal_from(conn, &mut plain, line, pool, emits);
    pool.release(plain);
    outcome
}

fn seal_from(
    conn: &mut ServerConnection,
    plain: &mut ShiftBuffer,
    line: &Rc<Line>,
    pool: &mut BufferPool,
    emits: &mut Vec<Emit>,
) -> Result<(), CoreError> {
    while !plain.is_empty() {
        let n = conn.writer().write(plain.as_slice()).map_err(error::io_error)?;
        if n == 0 {
            return Err(error::io_error(io::Error::from(io::ErrorKind::WriteZero)));
        }
        plain.shift_right(n)?;
        drain(conn, line, pool, emits)?;
    }
    Ok(())
}

/// 取出引擎待发的全部记录，每个池缓冲装满后成为一个下行 Context。
///
/// 引擎仍有输出而借到的缓冲装不下任何字节时返回 `ResourceExhausted`，不会让记录滞留在引擎里。
fn drain(
    conn: &mut ServerConnection,
    line: &Rc<Line>,
    pool: &mut BufferPool,
    emits: &mut Vec<Emit>,
) -> Result<(), CoreError> {
    while conn.wants_write() {
        let mut buf = pool.acquire()?;
        while conn.wants_write() && buf.spare_capacity() > 0 {
            match conn.write_tls(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    pool.release(buf);
                    return Err(error::io_error(err));
                }
            }
        }
        if buf.is_empty() {
            let unusable = buf.spare_capacity() == 0;
            pool.release(buf);
            if unusable && conn.wants_write() {
                return Err(error::buffer_exhausted());
            }
            break;
        }
        emits.push(Emit::Down(Context::payload(line.clone(), buf)));
    }
    Ok(())
}

/// 按序派发一批 Context。`guarded` 时一旦本节点槽位被邻居拆除，回收剩余批次。
fn flush(hop: &mut Hop<'_>, line: &Rc<Line>, emits: Vec<Emit>, guarded: bool) {
    let index = hop.index();
    let mut emits = emits.into_iter();
    while let Some(emit) = emits.next() {
        if guarded && !line.is_alive(index) {
            discard(hop, emit);
            for rest in emits.by_ref() {
                discard(hop, rest);
            }
            debug!(line = %line.id(), index, "line released mid-batch; remaining contexts dropped");
            return;
        }
        match emit {
            Emit::Down(ctx) => hop.down(ctx),
            Emit::Up(ctx) if hop.has_upstream() => hop.up(ctx),
            Emit::Up(ctx) => {
                debug!(
                    line = %line.id(),
                    index,
                    "no node above TlsServer; upstream context dropped"
                );
                ctx.discard(hop.buffers());
            }
        }
    }
}

fn discard(hop: &mut Hop<'_>, emit: Emit) {
    match emit {
        Emit::Up(ctx) | Emit::Down(ctx) => ctx.discard(hop.buffers()),
    }
}

/// 注册名 `TlsServer`。构造时即加载证书，路径无效会使链路构建失败。
#[derive(Debug, Default)]
pub struct TlsServerFactory;

impl NodeFactory for TlsServerFactory {
    fn type_name(&self) -> &'static str {
        "TlsServer"
    }

    fn create(&self, instance: &NodeInstanceContext<'_>) -> weir_core::Result<Arc<dyn Tunnel>> {
        let settings: TlsServerSettings = instance.settings.parse()?;
        let node = TlsServerNode::from_settings(settings)?;
        debug!(index = instance.index, workers = instance.workers, "tls server node created");
        Ok(Arc::new(node))
    }
}
