//! 代理端到端集成测试
//!
//! 用真实加密的 QUIC v1 Initial packets (本文件里的 synth 模块构造)
//! 打一个跑在环回地址上的完整代理，后端是测试内的 mock UDP socket。

use hyproxy::{Config, HandlerRegistry, Proxy, ProxyHandle};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// 构造真实可解密的 QUIC v1 Initial packet
mod synth {
    use ring::aead::quic::{HeaderProtectionKey, AES_128};
    use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

    fn encode_varint_2(v: u64) -> [u8; 2] {
        assert!(v < 16384);
        [0x40 | (v >> 8) as u8, v as u8]
    }

    /// TLS 1.3 ClientHello handshake message
    pub fn client_hello(sni: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut data = Vec::new();

        data.push(0x01); // ClientHello
        let hs_len_pos = data.len();
        data.extend_from_slice(&[0, 0, 0]);

        data.extend_from_slice(&[0x03, 0x03]);
        for i in 0u8..32 {
            data.push(i);
        }
        data.push(0x00); // session id
        data.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // TLS_AES_128_GCM_SHA256
        data.extend_from_slice(&[0x01, 0x00]); // compression

        let ext_start = data.len();
        data.extend_from_slice(&[0, 0]);

        if let Some(host) = sni {
            let name = host.as_bytes();
            data.extend_from_slice(&[0x00, 0x00]);
            let list_len = 3 + name.len();
            data.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            data.extend_from_slice(&(list_len as u16).to_be_bytes());
            data.push(0x00);
            data.extend_from_slice(&(name.len() as u16).to_be_bytes());
            data.extend_from_slice(name);
        }

        if !alpn.is_empty() {
            data.extend_from_slice(&[0x00, 0x10]);
            let list_len: usize = alpn.iter().map(|p| 1 + p.len()).sum();
            data.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            data.extend_from_slice(&(list_len as u16).to_be_bytes());
            for p in alpn {
                data.push(p.len() as u8);
                data.extend_from_slice(p.as_bytes());
            }
        }

        // supported_versions: TLS 1.3
        data.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

        let ext_len = data.len() - ext_start - 2;
        data[ext_start] = (ext_len >> 8) as u8;
        data[ext_start + 1] = (ext_len & 0xFF) as u8;

        let hs_len = data.len() - hs_len_pos - 3;
        data[hs_len_pos] = (hs_len >> 16) as u8;
        data[hs_len_pos + 1] = ((hs_len >> 8) & 0xFF) as u8;
        data[hs_len_pos + 2] = (hs_len & 0xFF) as u8;

        data
    }

    /// 把 ClientHello 装进 CRYPTO frame、加密、套 header protection
    pub fn initial_packet(sni: &str, dcid: &[u8]) -> Vec<u8> {
        initial_packet_from_hello(client_hello(Some(sni), &["h3"]), dcid)
    }

    pub fn initial_packet_from_hello(hello: Vec<u8>, dcid: &[u8]) -> Vec<u8> {
        // CRYPTO frame (offset 0) + PADDING 填充到标准 Initial 体量
        let mut plain = vec![0x06, 0x00];
        plain.extend_from_slice(&encode_varint_2(hello.len() as u64));
        plain.extend_from_slice(&hello);
        while plain.len() < 1162 {
            plain.push(0x00);
        }

        let keys = hyproxy::quic::derive_initial_keys(dcid, 0x0000_0001).unwrap();

        // Long header: v1 Initial, pn_len = 1
        let mut pkt = vec![0xC0];
        pkt.extend_from_slice(&1u32.to_be_bytes());
        pkt.push(dcid.len() as u8);
        pkt.extend_from_slice(dcid);
        pkt.push(0x08);
        pkt.extend_from_slice(&[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]); // SCID
        pkt.push(0x00); // token len
        let length = 1 + plain.len() + 16; // PN + ciphertext + tag
        pkt.extend_from_slice(&encode_varint_2(length as u64));
        let pn_offset = pkt.len();
        pkt.push(0x00); // PN = 0

        // AEAD seal: AAD = header (含 PN)，nonce = IV (PN 为 0)
        let aad = pkt.clone();
        let key = LessSafeKey::new(UnboundKey::new(&AES_128_GCM, &keys.key).unwrap());
        let nonce = Nonce::try_assume_unique_for_key(&keys.iv).unwrap();
        let mut in_out = plain;
        key.seal_in_place_append_tag(nonce, Aad::from(&aad), &mut in_out)
            .unwrap();
        pkt.extend_from_slice(&in_out);

        // Header protection
        let hp = HeaderProtectionKey::new(&AES_128, &keys.hp_key).unwrap();
        let sample: [u8; 16] = pkt[pn_offset + 4..pn_offset + 20].try_into().unwrap();
        let mask = hp.new_mask(&sample).unwrap();
        pkt[0] ^= mask[0] & 0x0F;
        pkt[pn_offset] ^= mask[1];

        pkt
    }

    /// 后端发回的 long header packet，携带指定的 SCID
    pub fn long_header_from_backend(scid: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0xE0]; // Handshake
        pkt.extend_from_slice(&1u32.to_be_bytes());
        pkt.push(0x08);
        pkt.extend_from_slice(&[0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28]); // DCID
        pkt.push(scid.len() as u8);
        pkt.extend_from_slice(scid);
        pkt.extend_from_slice(&[0xAB; 32]);
        pkt
    }

    /// 客户端发出的短头部 packet，DCID 是后端选的 CID
    pub fn short_header(dcid: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x41];
        pkt.extend_from_slice(dcid);
        pkt.extend_from_slice(payload);
        pkt
    }
}

async fn start_proxy(config: serde_json::Value) -> (ProxyHandle, SocketAddr) {
    let config = Config::parse(&config.to_string()).expect("bad test config");
    let registry = HandlerRegistry::builtin();
    let proxy = Proxy::bind(&config, &registry).await.expect("bind failed");
    let addr = proxy.local_addr().unwrap();
    let handle = proxy.handle();
    tokio::spawn(proxy.run());
    (handle, addr)
}

async fn mock_backend() -> (Arc<UdpSocket>, SocketAddr) {
    let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = sock.local_addr().unwrap();
    (sock, addr)
}

async fn recv_with_timeout(sock: &UdpSocket, ms: u64) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 65535];
    match timeout(Duration::from_millis(ms), sock.recv_from(&mut buf)).await {
        Ok(Ok((n, from))) => Some((buf[..n].to_vec(), from)),
        _ => None,
    }
}

/// 等待条件成立，最多 ~2 秒
async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[test]
fn test_client_hello_roundtrip() {
    // 合成的 Initial 必须能被自己的解析器还原出 SNI / ALPN
    let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
    let packet = synth::initial_packet("play.example.com", &dcid);

    let hello = hyproxy::quic::parse_client_hello(&packet).expect("parse failed");
    assert_eq!(hello.sni, "play.example.com");
    assert_eq!(hello.alpn, vec!["h3".to_string()]);
}

#[test]
fn test_client_hello_roundtrip_case_normalized() {
    let packet = synth::initial_packet("Lobby.Example.COM", &[0x01, 0x02, 0x03, 0x04]);
    let hello = hyproxy::quic::parse_client_hello(&packet).expect("parse failed");
    assert_eq!(hello.sni, "lobby.example.com");
}

#[test]
fn test_no_sni_initial_rejected() {
    let dcid = [0x0A; 8];
    let packet = synth::initial_packet_from_hello(synth::client_hello(None, &["h3"]), &dcid);
    let result = hyproxy::quic::parse_client_hello(&packet);
    assert!(matches!(result, Err(hyproxy::quic::QuicError::NoSni)));
}

#[tokio::test]
async fn test_single_backend_pass_through() {
    let (backend, backend_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "session_timeout": 0,
        "handlers": [
            { "type": "simple-router", "config": { "backend": backend_addr.to_string() } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&[0xCA, 0xFE, 0xBA, 0xBE], proxy_addr)
        .await
        .unwrap();

    // 同样的四个字节原样到达后端
    let (data, _) = recv_with_timeout(&backend, 1000)
        .await
        .expect("no packet at backend");
    assert_eq!(data, vec![0xCA, 0xFE, 0xBA, 0xBE]);

    // session_timeout = 0:立即清扫模式，会话数归零
    assert!(wait_until(|| handle.session_count() == 0).await);

    handle.shutdown();
}

#[tokio::test]
async fn test_backend_reply_reaches_client() {
    let (backend, backend_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "simple-router", "config": { "backend": backend_addr.to_string() } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", proxy_addr).await.unwrap();

    let (data, relay_addr) = recv_with_timeout(&backend, 1000).await.expect("no packet");
    assert_eq!(data, b"ping");

    // 后端回包 → 经代理回到客户端
    backend.send_to(b"pong", relay_addr).await.unwrap();
    let (data, from) = recv_with_timeout(&client, 1000).await.expect("no reply");
    assert_eq!(data, b"pong");
    assert_eq!(from, proxy_addr);

    handle.shutdown();
}

#[tokio::test]
async fn test_sni_routing_hit() {
    let (b1, b1_addr) = mock_backend().await;
    let (b2, b2_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "sni-router", "config": { "routes": {
                "play.example.com": b1_addr.to_string(),
                "lobby.example.com": b2_addr.to_string()
            } } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = synth::initial_packet("lobby.example.com", &[0x42; 8]);
    client.send_to(&packet, proxy_addr).await.unwrap();

    // datagram 原样到 b2，b1 一无所获
    let (data, _) = recv_with_timeout(&b2, 1000).await.expect("no packet at b2");
    assert_eq!(data, packet);
    assert!(recv_with_timeout(&b1, 200).await.is_none());

    handle.shutdown();
}

#[tokio::test]
async fn test_sni_routing_miss() {
    let (b1, b1_addr) = mock_backend().await;
    let (b2, b2_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "sni-router", "config": { "routes": {
                "play.example.com": b1_addr.to_string(),
                "lobby.example.com": b2_addr.to_string()
            } } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = synth::initial_packet("other.example.com", &[0x43; 8]);
    client.send_to(&packet, proxy_addr).await.unwrap();

    // 哪个后端都收不到，也不留会话
    assert!(recv_with_timeout(&b1, 300).await.is_none());
    assert!(recv_with_timeout(&b2, 100).await.is_none());
    assert_eq!(handle.session_count(), 0);

    handle.shutdown();
}

#[tokio::test]
async fn test_rate_limit_gates_third_connection() {
    let (backend, backend_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "simple-router", "config": { "backend": backend_addr.to_string() } },
            { "type": "ratelimit-global", "config": { "max_parallel_connections": 2 } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let c3 = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    c1.send_to(b"one", proxy_addr).await.unwrap();
    c2.send_to(b"two", proxy_addr).await.unwrap();
    c3.send_to(b"three", proxy_addr).await.unwrap();

    // 前两个建立，第三个在 on_connect 被拒
    assert!(recv_with_timeout(&backend, 1000).await.is_some());
    assert!(recv_with_timeout(&backend, 1000).await.is_some());
    assert!(recv_with_timeout(&backend, 300).await.is_none());
    assert_eq!(handle.session_count(), 2);

    // 关掉一个之后，第四个进得来
    assert!(handle.close_session(c1.local_addr().unwrap()));
    assert!(wait_until(|| handle.session_count() == 1).await);

    let c4 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    c4.send_to(b"four", proxy_addr).await.unwrap();
    let (data, _) = recv_with_timeout(&backend, 1000).await.expect("fourth blocked");
    assert_eq!(data, b"four");
    assert_eq!(handle.session_count(), 2);

    handle.shutdown();
}

#[tokio::test]
async fn test_round_robin_across_100_connections() {
    let (b1, b1_addr) = mock_backend().await;
    let (b2, b2_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "sni-router", "config": { "routes": {
                "a.com": [b1_addr.to_string(), b2_addr.to_string()]
            } } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    for i in 0..100u8 {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = synth::initial_packet("a.com", &[i, i, i, i, 0xAA, 0xBB, 0xCC, 0xDD]);
        client.send_to(&packet, proxy_addr).await.unwrap();
        // 让派发跟上发送，避免积压
        if i % 10 == 9 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    assert!(wait_until(|| handle.session_count() == 100).await);

    // 轮询是确定性的:两个后端各收 50 个 Initial
    let b1_count = drain_count(&b1).await;
    let b2_count = drain_count(&b2).await;
    assert_eq!(b1_count + b2_count, 100);
    assert_eq!(b1_count, 50, "b1 got {} of 100", b1_count);
    assert_eq!(b2_count, 50, "b2 got {} of 100", b2_count);

    handle.shutdown();
}

async fn drain_count(sock: &UdpSocket) -> usize {
    let mut count = 0;
    while recv_with_timeout(sock, 300).await.is_some() {
        count += 1;
    }
    count
}

#[tokio::test]
async fn test_cid_learning_routes_new_source_port() {
    let (backend, backend_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "sni-router", "config": { "routes": { "x.com": backend_addr.to_string() } } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    // 1. 建立会话
    let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let initial = synth::initial_packet("x.com", &[0x77; 8]);
    c1.send_to(&initial, proxy_addr).await.unwrap();
    let (_, relay_addr) = recv_with_timeout(&backend, 1000).await.expect("no initial");

    // 2. 后端用 long header 宣告自己选的 CID
    let server_cid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    let reply = synth::long_header_from_backend(&server_cid);
    backend.send_to(&reply, relay_addr).await.unwrap();
    let (data, _) = recv_with_timeout(&c1, 1000).await.expect("reply not relayed");
    assert_eq!(data, reply);

    // 3. 客户端从另一个源端口用该 CID 发短头部包
    let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let short = synth::short_header(&server_cid, &[0xDE, 0xAD, 0xBE, 0xEF]);
    c2.send_to(&short, proxy_addr).await.unwrap();

    // 同一个后端 socket (同一会话) 收到它
    let (data, from) = recv_with_timeout(&backend, 1000).await.expect("short header lost");
    assert_eq!(data, short);
    assert_eq!(from, relay_addr);
    assert_eq!(handle.session_count(), 1);

    handle.shutdown();
}

#[tokio::test]
async fn test_reload_preserves_inflight_sessions() {
    let (backend_a, a_addr) = mock_backend().await;
    let (backend_b, b_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "simple-router", "config": { "backend": a_addr.to_string() } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    // 旧链下建立会话
    let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    c1.send_to(b"before", proxy_addr).await.unwrap();
    assert!(recv_with_timeout(&backend_a, 1000).await.is_some());

    // 热更新:新连接改走 backend_b
    let registry = HandlerRegistry::builtin();
    let new_config = Config::parse(
        &json!({
            "listen": "127.0.0.1:0",
            "handlers": [
                { "type": "simple-router", "config": { "backend": b_addr.to_string() } },
                { "type": "forwarder" }
            ]
        })
        .to_string(),
    )
    .unwrap();
    handle.reload(&new_config, &registry).expect("reload failed");

    // 在途会话继续走 backend_a
    c1.send_to(b"still-a", proxy_addr).await.unwrap();
    let (data, _) = recv_with_timeout(&backend_a, 1000).await.expect("session broken");
    assert_eq!(data, b"still-a");

    // 新连接走 backend_b
    let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    c2.send_to(b"new-conn", proxy_addr).await.unwrap();
    let (data, _) = recv_with_timeout(&backend_b, 1000).await.expect("new chain unused");
    assert_eq!(data, b"new-conn");

    handle.shutdown();
}

#[tokio::test]
async fn test_reload_rejects_listen_change() {
    let (_backend, backend_addr) = mock_backend().await;
    let (handle, _proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "simple-router", "config": { "backend": backend_addr.to_string() } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    let registry = HandlerRegistry::builtin();
    let new_config = Config::parse(
        &json!({
            "listen": "127.0.0.1:45999",
            "handlers": [{ "type": "forwarder" }]
        })
        .to_string(),
    )
    .unwrap();

    let err = handle.reload(&new_config, &registry).unwrap_err();
    assert!(err.to_string().contains("'listen' cannot be changed"));

    handle.shutdown();
}

#[tokio::test]
async fn test_graceful_shutdown_drains_sessions() {
    let (backend, backend_addr) = mock_backend().await;
    let (handle, proxy_addr) = start_proxy(json!({
        "listen": "127.0.0.1:0",
        "handlers": [
            { "type": "simple-router", "config": { "backend": backend_addr.to_string() } },
            { "type": "forwarder" }
        ]
    }))
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello", proxy_addr).await.unwrap();
    assert!(recv_with_timeout(&backend, 1000).await.is_some());
    assert_eq!(handle.session_count(), 1);

    handle.shutdown();
    assert!(wait_until(|| handle.session_count() == 0).await);
}
