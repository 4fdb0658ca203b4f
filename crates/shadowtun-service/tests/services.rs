use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};

use shadowtun::{
    relay::socks5::{
        Command, HandshakeRequest, HandshakeResponse, Reply, TcpRequestHeader, TcpResponseHeader,
        SOCKS5_AUTH_METHOD_NONE,
    },
    CipherKind, ServerConfig,
};
use shadowtun_service::{
    config::{LocalConfig, TunnelConfig},
    local, server,
};

const UDP_TIMEOUT: Duration = Duration::from_secs(1);

fn spawn_pair(server_addr: SocketAddr, config: LocalConfig, password: &str, method: CipherKind) {
    let svr_cfg = ServerConfig::new(server_addr, password, method);

    tokio::spawn(server::run(vec![svr_cfg.clone()], UDP_TIMEOUT));
    tokio::spawn(local::run(config, Arc::new(svr_cfg), UDP_TIMEOUT));
}

/// Listeners bind inside the service tasks; retry until one answers
async fn connect_ready(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    panic!("service on {addr} never came up");
}

async fn spawn_tcp_echo(listen: SocketAddr) {
    let listener = TcpListener::bind(listen).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                tokio::io::copy(&mut r, &mut w).await
            });
        }
    });
}

#[tokio::test]
async fn socks5_connect_echo() {
    let _ = env_logger::try_init();

    let server_addr: SocketAddr = "127.0.0.1:32001".parse().unwrap();
    let socks_addr: SocketAddr = "127.0.0.1:32002".parse().unwrap();
    let echo_addr: SocketAddr = "127.0.0.1:32003".parse().unwrap();

    spawn_tcp_echo(echo_addr).await;
    spawn_pair(
        server_addr,
        LocalConfig {
            socks: Some(socks_addr.into()),
            ..LocalConfig::default()
        },
        "socks-test",
        CipherKind::AES_256_GCM,
    );

    let mut client = connect_ready(socks_addr).await;

    HandshakeRequest::new(vec![SOCKS5_AUTH_METHOD_NONE])
        .write_to(&mut client)
        .await
        .unwrap();
    let rsp = HandshakeResponse::read_from(&mut client).await.unwrap();
    assert_eq!(rsp.chosen_method, SOCKS5_AUTH_METHOD_NONE);

    TcpRequestHeader::new(Command::TcpConnect, echo_addr.into())
        .write_to(&mut client)
        .await
        .unwrap();
    let rsp = TcpResponseHeader::read_from(&mut client).await.unwrap();
    assert!(matches!(rsp.reply, Reply::Succeeded));

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn static_tcp_tunnel_echo() {
    let _ = env_logger::try_init();

    let server_addr: SocketAddr = "127.0.0.1:32011".parse().unwrap();
    let tunnel_addr: SocketAddr = "127.0.0.1:32012".parse().unwrap();
    let echo_addr: SocketAddr = "127.0.0.1:32013".parse().unwrap();

    spawn_tcp_echo(echo_addr).await;
    spawn_pair(
        server_addr,
        LocalConfig {
            tcp_tunnels: vec![TunnelConfig {
                local: tunnel_addr.into(),
                remote: echo_addr.into(),
            }],
            ..LocalConfig::default()
        },
        "tunnel-test",
        CipherKind::CHACHA20_POLY1305,
    );

    let mut client = connect_ready(tunnel_addr).await;
    client.write_all(b"tunnel vision").await.unwrap();

    let mut buf = [0u8; 13];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel vision");
}

#[tokio::test]
async fn garbage_connection_is_dropped() {
    let _ = env_logger::try_init();

    let server_addr: SocketAddr = "127.0.0.1:32021".parse().unwrap();

    let svr_cfg = ServerConfig::new(server_addr, "garbage-test", CipherKind::AES_128_GCM);
    tokio::spawn(server::run(vec![svr_cfg], UDP_TIMEOUT));

    let mut client = connect_ready(server_addr).await;

    // a full salt and a corrupted length chunk
    let junk = vec![0x5Au8; 16 + 2 + 16];
    client.write_all(&junk).await.unwrap();

    // the server drops the connection without replying
    let mut buf = [0u8; 1];
    let res = time::timeout(Duration::from_secs(5), client.read(&mut buf)).await;
    assert_eq!(res.unwrap().unwrap(), 0);
}

async fn spawn_udp_echo(listen: SocketAddr) -> Arc<UdpSocket> {
    let socket = Arc::new(UdpSocket::bind(listen).await.unwrap());
    let echo = socket.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        loop {
            let (n, peer) = match echo.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(..) => break,
            };
            let _ = echo.send_to(&buf[..n], peer).await;
        }
    });
    socket
}

/// UDP echo that records the source address of each datagram it sees
async fn spawn_udp_echo_recording(listen: SocketAddr) -> tokio::sync::mpsc::UnboundedReceiver<SocketAddr> {
    let socket = UdpSocket::bind(listen).await.unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(..) => break,
            };
            let _ = tx.send(peer);
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    rx
}

#[tokio::test]
async fn udp_tunnel_echo() {
    let _ = env_logger::try_init();

    let server_addr: SocketAddr = "127.0.0.1:32031".parse().unwrap();
    let tunnel_addr: SocketAddr = "127.0.0.1:32032".parse().unwrap();
    let echo_addr: SocketAddr = "127.0.0.1:32033".parse().unwrap();

    let _echo = spawn_udp_echo(echo_addr).await;
    spawn_pair(
        server_addr,
        LocalConfig {
            udp_tunnels: vec![TunnelConfig {
                local: tunnel_addr.into(),
                remote: echo_addr.into(),
            }],
            ..LocalConfig::default()
        },
        "udp-test",
        CipherKind::AES_128_GCM,
    );

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // tunnels bind asynchronously, retry until the first echo comes back
    let mut buf = [0u8; 1024];
    let mut echoed = None;
    for _ in 0..50 {
        client.send_to(b"dns query", tunnel_addr).await.unwrap();
        match time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => {
                echoed = Some(buf[..n].to_vec());
                break;
            }
            _ => continue,
        }
    }

    assert_eq!(echoed.expect("no echo through udp tunnel"), b"dns query");
}

#[tokio::test]
async fn udp_session_expires_when_idle() {
    let _ = env_logger::try_init();

    let server_addr: SocketAddr = "127.0.0.1:32041".parse().unwrap();
    let tunnel_addr: SocketAddr = "127.0.0.1:32042".parse().unwrap();
    let echo_addr: SocketAddr = "127.0.0.1:32043".parse().unwrap();

    let mut seen = spawn_udp_echo_recording(echo_addr).await;
    spawn_pair(
        server_addr,
        LocalConfig {
            udp_tunnels: vec![TunnelConfig {
                local: tunnel_addr.into(),
                remote: echo_addr.into(),
            }],
            ..LocalConfig::default()
        },
        "udp-expire",
        CipherKind::AES_128_GCM,
    );

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 1024];

    // first datagram; retry until the tunnel is up
    let mut first_src = None;
    for _ in 0..50 {
        client.send_to(b"one", tunnel_addr).await.unwrap();
        match time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await {
            Ok(Ok(..)) => {
                first_src = Some(seen.recv().await.unwrap());
                break;
            }
            _ => continue,
        }
    }
    let mut first_src = first_src.expect("tunnel never came up");

    // idle past both NAT timeouts (local and remote)
    time::sleep(UDP_TIMEOUT + Duration::from_secs(1)).await;

    // late echoes of the startup retries all came from the first session
    while let Ok(addr) = seen.try_recv() {
        first_src = addr;
    }

    client.send_to(b"two", tunnel_addr).await.unwrap();
    let (n, _) = time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("no echo after expiry")
        .unwrap();
    assert_eq!(&buf[..n], b"two");

    // the expired session's outbound socket is gone, a fresh one was created
    let second_src = seen.recv().await.unwrap();
    assert_ne!(first_src, second_src);
}
