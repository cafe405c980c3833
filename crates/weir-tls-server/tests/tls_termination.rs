//! 以 rustls 客户端为参照驱动 `TlsServer` 节点：握手、解密、回显加密、关闭与失败路径。

mod common;

use std::{
    io::{Read, Write},
    rc::Rc,
    sync::Arc,
};

use common::{Certs, Harness, Recorder, RecordingEdge, Seen, Wire, handshake_then_send, pump};
use weir_core::{
    BufferPool, ChainBuilder, Context, ControlCommand, CoreError, EchoNode, ErrorCategory,
    FinReason, MasterPool, NodeRegistry, NodeSettings, ShiftBuffer, Tunnel, WorkerEnv, WorkerId,
    error::codes::POOL_ALLOC_FAILED,
};
use weir_tls_server::{HotReloadingServerConfig, TlsServerNode, TlsServerSettings, codes};

fn tls_node(certs: &Certs) -> Arc<dyn Tunnel> {
    Arc::new(TlsServerNode::new(
        TlsServerSettings::default(),
        HotReloadingServerConfig::from_config(certs.server_config()),
    ))
}

fn stat(harness: &Harness, key: &str) -> i64 {
    harness
        .chain
        .control(0, &ControlCommand::new("stats"))
        .expect("stats 命令")
        .get_integer(key)
        .expect("统计字段")
}

#[test]
fn handshake_yields_one_init_then_plaintext_in_order() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(vec![tls_node(&certs), recorder.clone()]);
    let mut client = certs.client();

    harness.open();
    assert!(recorder.seen().is_empty(), "握手完成前不得上行 init");

    handshake_then_send(&mut client, &mut harness, b"hello");
    client.writer().write_all(b"world").expect("写入明文");
    pump(&mut client, &mut harness).expect("数据往返");

    assert_eq!(
        recorder.seen(),
        vec![
            Seen::Init,
            Seen::Data {
                first: true,
                bytes: b"hello".to_vec()
            },
            Seen::Data {
                first: false,
                bytes: b"world".to_vec()
            },
        ]
    );
    assert_eq!(stat(&harness, "handshakes"), 1);
    assert_eq!(stat(&harness, "active"), 1);
}

#[test]
fn echo_over_tls_round_trips_through_the_reference_client() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let mut harness = Harness::new(vec![tls_node(&certs), Arc::new(EchoNode)]);
    let mut client = certs.client();

    harness.open();
    handshake_then_send(&mut client, &mut harness, b"hello");

    assert!(harness.wire().contains(&Wire::Est), "回显节点的 est 应到达底部");
    let mut plain = [0_u8; 64];
    let n = client.reader().read(&mut plain).expect("客户端读取回显");
    assert_eq!(&plain[..n], b"hello");
}

#[test]
fn server_flight_is_split_across_pool_sized_buffers() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let mut harness = Harness::new(vec![tls_node(&certs), Arc::new(Recorder::default())]);
    let mut client = certs.client();

    harness.open();
    let mut hello = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut hello).expect("写入内存");
    }
    harness.feed(&hello);

    // 证书链加签名远超 512 字节的池缓冲，必然被切成多个下行 Context。
    assert!(harness.bytes_chunks() > 1);
    let flight = harness.take_ciphertext();
    let mut reader = flight.as_slice();
    while !reader.is_empty() {
        client.read_tls(&mut reader).expect("读取内存");
        client.process_new_packets().expect("按序拼接的片段应可被客户端解析");
    }
    assert!(!client.is_handshaking());
}

#[test]
fn garbage_from_the_peer_fails_only_this_line() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(vec![tls_node(&certs), recorder.clone()]);

    harness.open();
    harness.feed(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    let wire = harness.wire();
    assert_eq!(
        wire.last(),
        Some(&Wire::Fin(FinReason::Failure(codes::HANDSHAKE_FAILED)))
    );
    assert_eq!(wire.iter().filter(|w| matches!(w, Wire::Fin(_))).count(), 1);
    assert!(recorder.seen().is_empty(), "未上行过 init 就不向上传播 fin");
    assert!(!harness.line.is_alive(0));
    assert!(harness.line.is_closed());
    assert_eq!(stat(&harness, "failures"), 1);
    assert_eq!(stat(&harness, "active"), 0);
}

#[test]
fn peer_close_notify_ends_the_line_both_ways() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(vec![tls_node(&certs), recorder.clone()]);
    let mut client = certs.client();

    harness.open();
    handshake_then_send(&mut client, &mut harness, b"bye");
    client.send_close_notify();
    pump(&mut client, &mut harness).expect("关闭往返");

    assert_eq!(recorder.seen().last(), Some(&Seen::Fin(FinReason::Graceful)));
    assert_eq!(harness.wire().last(), Some(&Wire::Fin(FinReason::Graceful)));
    assert!(harness.line.is_closed());
    assert_eq!(harness.line.live_slots(), 0);
}

#[test]
fn fin_from_above_sends_close_notify_first() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(vec![tls_node(&certs), recorder.clone()]);
    let mut client = certs.client();

    harness.open();
    handshake_then_send(&mut client, &mut harness, b"ping");
    let fin = Context::fin(Rc::clone(&harness.line), FinReason::Graceful);
    harness.feed_down(fin);

    assert_eq!(harness.wire().last(), Some(&Wire::Fin(FinReason::Graceful)));
    let tail = harness.take_ciphertext();
    let mut reader = tail.as_slice();
    let mut closed = false;
    while !reader.is_empty() {
        client.read_tls(&mut reader).expect("读取内存");
        closed |= client.process_new_packets().expect("close_notify").peer_has_closed();
    }
    assert!(closed, "fin 之前应冲刷 close_notify");
    assert_eq!(
        recorder.seen().iter().filter(|s| matches!(s, Seen::Fin(_))).count(),
        0,
        "fin 来自上方时不再回送给上方"
    );
}

/// 把工作线程的缓冲池换成 `master`，本地列表容量为零，每次借还都直达主池。
fn swap_pool(harness: &mut Harness, master: MasterPool<ShiftBuffer>) {
    harness.env = WorkerEnv::new(WorkerId(0), BufferPool::new(Arc::new(master), 0));
}

#[test]
fn zero_sized_pool_buffers_fail_the_handshake_instead_of_stalling() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(vec![tls_node(&certs), recorder.clone()]);
    let mut client = certs.client();

    harness.open();
    swap_pool(&mut harness, MasterPool::new(0, || ShiftBuffer::try_new(0, 0), drop));
    let mut hello = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut hello).expect("写入内存");
    }
    harness.feed(&hello);

    assert_eq!(
        harness.wire().last(),
        Some(&Wire::Fin(FinReason::Failure(codes::BUFFER_EXHAUSTED)))
    );
    assert!(!harness.line.is_alive(0));
    assert!(recorder.seen().is_empty());
    assert_eq!(stat(&harness, "failures"), 1);
}

#[test]
fn buffer_exhaustion_after_the_handshake_fails_the_line_both_ways() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(vec![tls_node(&certs), recorder.clone()]);
    let mut client = certs.client();

    harness.open();
    handshake_then_send(&mut client, &mut harness, b"hello");
    swap_pool(
        &mut harness,
        MasterPool::new(
            0,
            || {
                Err(CoreError::new(POOL_ALLOC_FAILED, "no buffers left")
                    .with_category(ErrorCategory::ResourceExhausted))
            },
            drop,
        ),
    );

    client.writer().write_all(b"more").expect("写入明文");
    let mut outbound = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut outbound).expect("写入内存");
    }
    // 池已无法借出缓冲，密文只能由外部构造后直接喂入。
    let input = ShiftBuffer::from_slice(&outbound).expect("构造密文缓冲");
    let ciphertext = Context::payload(Rc::clone(&harness.line), input);
    harness.chain.feed_up(ciphertext, &mut harness.env);

    let fin = FinReason::Failure(POOL_ALLOC_FAILED);
    assert!(!harness.line.is_alive(0));
    assert_eq!(recorder.seen().last(), Some(&Seen::Fin(fin)));
    assert_eq!(harness.wire().last(), Some(&Wire::Fin(fin)));
    assert_eq!(stat(&harness, "failures"), 1);
    assert_eq!(stat(&harness, "active"), 0);
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "下行明文早于 TLS 握手完成"))]
fn plaintext_before_the_handshake_is_a_contract_violation() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let mut harness = Harness::new(vec![tls_node(&certs)]);
    harness.open();

    let buffer = harness.env.buffers().acquire_with(b"too early").expect("借出缓冲");
    let early = Context::payload(Rc::clone(&harness.line), buffer);
    harness.feed_down(early);

    // 发布构建：按连接级失败处理，不终止进程。
    assert_eq!(
        harness.wire().last(),
        Some(&Wire::Fin(FinReason::Failure(codes::NOT_ESTABLISHED)))
    );
    assert!(!harness.line.is_alive(0));
}

#[test]
fn reload_applies_to_new_lines_only() {
    let old = Certs::self_signed("localhost").expect("生成证书");
    let new = Certs::self_signed("localhost").expect("生成证书");
    let dir = std::env::temp_dir().join(format!("weir-tls-reload-{}", std::process::id()));
    let (old_cert, old_key) = old.write_pem(&dir, "old");
    let (new_cert, new_key) = new.write_pem(&dir, "new");

    let node: Arc<dyn Tunnel> = Arc::new(
        TlsServerNode::from_settings(TlsServerSettings {
            cert_file: old_cert,
            key_file: old_key,
            alpn: Vec::new(),
        })
        .expect("加载旧证书"),
    );

    let mut before = Harness::new(vec![node.clone(), Arc::new(Recorder::default())]);
    before.open();

    let bad = ControlCommand::new("reload").with_args(
        NodeSettings::default().with("cert_file", dir.join("missing.pem").display().to_string()),
    );
    let err = before.chain.control(0, &bad).expect_err("证书不存在");
    assert_eq!(err.code(), codes::CONFIG_INVALID);

    let reload = ControlCommand::new("reload").with_args(
        NodeSettings::default()
            .with("cert_file", new_cert.display().to_string())
            .with("key_file", new_key.display().to_string()),
    );
    let reply = before.chain.control(0, &reload).expect("重新加载");
    assert_eq!(reply.get("reloaded").and_then(toml::Value::as_bool), Some(true));

    // 重新加载前打开的 Line 仍持有旧证书。
    let mut stale_client = new.client();
    assert!(pump(&mut stale_client, &mut before).is_err());

    let mut after = Harness::new(vec![node.clone(), Arc::new(Recorder::default())]);
    after.open();
    let mut client = new.client();
    handshake_then_send(&mut client, &mut after, b"fresh");
    assert!(!client.is_handshaking());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_control_verbs_are_rejected() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let node = tls_node(&certs);
    let err = node
        .control(&ControlCommand::new("rotate"))
        .expect_err("未知命令");
    assert_eq!(err.code(), weir_core::error::codes::CONTROL_UNSUPPORTED);
}

#[test]
fn registry_builds_the_node_from_settings() {
    let certs = Certs::self_signed("localhost").expect("生成证书");
    let dir = std::env::temp_dir().join(format!("weir-tls-registry-{}", std::process::id()));
    let (cert_file, key_file) = certs.write_pem(&dir, "site");

    let mut registry = NodeRegistry::with_builtin();
    weir_tls_server::register(&mut registry);
    assert!(registry.contains("TlsServer"));

    let missing = ChainBuilder::new()
        .node_from(&registry, "TlsServer", &NodeSettings::default(), 1)
        .err()
        .expect("默认证书路径不存在");
    assert_eq!(missing.code(), codes::CONFIG_INVALID);

    let settings = NodeSettings::default()
        .with("cert_file", cert_file.display().to_string())
        .with("key_file", key_file.display().to_string())
        .with("alpn", vec!["http/1.1".to_owned()]);
    let chain = ChainBuilder::new()
        .node_from(&registry, "TlsServer", &settings, 1)
        .and_then(|b| b.node_from(&registry, "Echo", &NodeSettings::default(), 1))
        .and_then(|b| b.build(Arc::new(RecordingEdge::default())))
        .expect("由注册表装配链路");
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.node(0).map(|n| n.name()), Some("TlsServer"));
    chain.destroy();

    let _ = std::fs::remove_dir_all(&dir);
}
