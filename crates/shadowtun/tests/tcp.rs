use std::{io, net::SocketAddr, sync::Arc};

use log::info;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Barrier,
};

use shadowtun::{
    config::ServerConfig,
    crypto::{Cipher, CipherKind},
    discover_cipher,
    relay::tcprelay::utils::copy_bidirectional,
    ProxyClientStream,
};

/// Minimal remote peer: discovery, handshake, dial, relay
async fn run_remote_peer(listen: SocketAddr, candidates: Arc<Vec<ServerConfig>>, barrier: Arc<Barrier>) {
    let listener = TcpListener::bind(listen).await.unwrap();
    barrier.wait().await;

    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("remote peer accepted {}", peer_addr);

        let candidates = candidates.clone();
        tokio::spawn(async move {
            let mut shadow = discover_cipher(stream, &candidates).await?;
            let target = shadow.handshake().await?;

            let mut remote = match target {
                shadowtun::relay::socks5::Address::SocketAddress(sa) => TcpStream::connect(sa).await?,
                shadowtun::relay::socks5::Address::DomainNameAddress(ref dname, port) => {
                    TcpStream::connect((dname.as_str(), port)).await?
                }
            };

            copy_bidirectional(&mut shadow, &mut remote).await?;
            Ok::<_, io::Error>(())
        });
    }
}

/// Echo everything back until the client closes
async fn run_echo_server(listen: SocketAddr, barrier: Arc<Barrier>) {
    let listener = TcpListener::bind(listen).await.unwrap();
    barrier.wait().await;

    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let (mut r, mut w) = stream.split();
            tokio::io::copy(&mut r, &mut w).await
        });
    }
}

async fn tcp_tunnel_example(server_addr: SocketAddr, echo_addr: SocketAddr, password: &str, method: CipherKind) {
    let _ = env_logger::try_init();

    let svr_cfg = ServerConfig::new(server_addr, password, method);
    let candidates = Arc::new(vec![svr_cfg.clone()]);

    let barrier = Arc::new(Barrier::new(3));
    tokio::spawn(run_remote_peer(server_addr, candidates, barrier.clone()));
    tokio::spawn(run_echo_server(echo_addr, barrier.clone()));
    barrier.wait().await;

    let target: shadowtun::relay::socks5::Address = echo_addr.into();
    let mut client = ProxyClientStream::connect(&svr_cfg, target).await.unwrap();

    const MESSAGE: &[u8] = b"the quick brown fox jumps over the lazy dog";
    client.write_all(MESSAGE).await.unwrap();

    let mut buf = vec![0u8; MESSAGE.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, MESSAGE);
}

#[tokio::test]
async fn tcp_tunnel_aes_128_gcm() {
    tcp_tunnel_example(
        "127.0.0.1:31001".parse().unwrap(),
        "127.0.0.1:31101".parse().unwrap(),
        "p$p",
        CipherKind::AES_128_GCM,
    )
    .await;
}

#[tokio::test]
async fn tcp_tunnel_aes_192_gcm() {
    tcp_tunnel_example(
        "127.0.0.1:31002".parse().unwrap(),
        "127.0.0.1:31102".parse().unwrap(),
        "p$p",
        CipherKind::AES_192_GCM,
    )
    .await;
}

#[tokio::test]
async fn tcp_tunnel_aes_256_gcm() {
    tcp_tunnel_example(
        "127.0.0.1:31003".parse().unwrap(),
        "127.0.0.1:31103".parse().unwrap(),
        "p$p",
        CipherKind::AES_256_GCM,
    )
    .await;
}

#[tokio::test]
async fn tcp_tunnel_chacha20_poly1305() {
    tcp_tunnel_example(
        "127.0.0.1:31004".parse().unwrap(),
        "127.0.0.1:31104".parse().unwrap(),
        "p$p",
        CipherKind::CHACHA20_POLY1305,
    )
    .await;
}

#[tokio::test]
async fn tcp_tunnel_multi_key_server() {
    let _ = env_logger::try_init();

    let server_addr: SocketAddr = "127.0.0.1:31005".parse().unwrap();
    let echo_addr: SocketAddr = "127.0.0.1:31105".parse().unwrap();

    let cfg_a = ServerConfig::new(server_addr, "key-a", CipherKind::AES_256_GCM);
    let cfg_b = ServerConfig::new(server_addr, "key-b", CipherKind::CHACHA20_POLY1305);
    let candidates = Arc::new(vec![cfg_a, cfg_b.clone()]);

    let barrier = Arc::new(Barrier::new(3));
    tokio::spawn(run_remote_peer(server_addr, candidates, barrier.clone()));
    tokio::spawn(run_echo_server(echo_addr, barrier.clone()));
    barrier.wait().await;

    // the client uses the second configured key
    let target: shadowtun::relay::socks5::Address = echo_addr.into();
    let mut client = ProxyClientStream::connect(&cfg_b, target).await.unwrap();

    const MESSAGE: &[u8] = b"selected without losing a byte";
    client.write_all(MESSAGE).await.unwrap();

    let mut buf = vec![0u8; MESSAGE.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, MESSAGE);
}

#[tokio::test]
async fn wire_bytes_are_ciphertext() {
    let _ = env_logger::try_init();

    let sniffer_addr: SocketAddr = "127.0.0.1:31006".parse().unwrap();

    let method = CipherKind::AES_128_GCM;
    let svr_cfg = ServerConfig::new(sniffer_addr, "sniff-me", method);

    let listener = TcpListener::bind(sniffer_addr).await.unwrap();

    let target: shadowtun::relay::socks5::Address = "127.0.0.1:9".parse().unwrap();
    let mut client = ProxyClientStream::connect(&svr_cfg, target.clone()).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    client.shutdown().await.unwrap();

    let (mut wire_stream, _) = listener.accept().await.unwrap();
    let mut wire = Vec::new();
    wire_stream.read_to_end(&mut wire).await.unwrap();

    // salt || seal(len) || seal(addr-header || "hello")
    let header_len = target.serialized_len() + 5;
    assert_eq!(
        wire.len(),
        method.salt_len() + (2 + method.tag_len()) + (header_len + method.tag_len())
    );

    // no plaintext anywhere on the wire
    assert!(!wire.windows(5).any(|w| w == b"hello"));

    // and it decrypts to exactly the tunnel header + payload
    let salt = &wire[..method.salt_len()];
    let mut cipher = Cipher::new(method, svr_cfg.key(), salt);

    let mut len_chunk = wire[method.salt_len()..method.salt_len() + 2 + method.tag_len()].to_vec();
    assert!(cipher.decrypt_packet(&mut len_chunk));
    assert_eq!(u16::from_be_bytes([len_chunk[0], len_chunk[1]]) as usize, header_len);

    let mut data_chunk = wire[method.salt_len() + 2 + method.tag_len()..].to_vec();
    assert!(cipher.decrypt_packet(&mut data_chunk));
    assert_eq!(&data_chunk[..header_len], b"\x01\x7f\x00\x00\x01\x00\x09hello");
}
