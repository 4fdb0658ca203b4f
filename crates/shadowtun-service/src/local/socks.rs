//! SOCKS5 local server
//!
//! Minimal server side of RFC 1928: no-auth negotiation, CONNECT and
//! UDP-ASSOCIATE. UDP forwarding itself runs on the separate UDP tunnel
//! listener, so the ASSOCIATE reply carries the zero address and the TCP
//! connection is simply held open until the client leaves.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, trace};
use shadowtun::{
    net::{self, TCP_KEEPALIVE_PERIOD},
    relay::socks5::{
        Address, Command, Error as Socks5Error, HandshakeRequest, HandshakeResponse, Reply, TcpRequestHeader,
        TcpResponseHeader, SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
    },
    ServerAddr, ServerConfig,
};
use tokio::{net::TcpStream, time};

use crate::net::ignore_until_end;

/// Run a SOCKS5 server on `listen`, proxying through `svr_cfg`
pub async fn run_socks_local(listen: ServerAddr, svr_cfg: Arc<ServerConfig>) -> io::Result<()> {
    let listener = net::bind_tcp(&listen).await?;

    info!(
        "SOCKS proxy listening on {}, remote {}",
        listener.local_addr()?,
        svr_cfg.addr()
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                error!("socks accept failed with error: {}", err);
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let svr_cfg = svr_cfg.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_socks_client(stream, peer_addr, svr_cfg).await {
                debug!("socks client {} aborted with error: {}", peer_addr, err);
            }
        });
    }
}

async fn handle_socks_client(mut stream: TcpStream, peer_addr: SocketAddr, svr_cfg: Arc<ServerConfig>) -> io::Result<()> {
    let _ = net::set_tcp_keepalive(&stream, TCP_KEEPALIVE_PERIOD);

    // 1. Version/method negotiation, no-auth only
    let handshake_req = HandshakeRequest::read_from(&mut stream).await?;

    if !handshake_req.methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        HandshakeResponse::new(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE)
            .write_to(&mut stream)
            .await?;
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "no supported authentication method",
        ));
    }

    HandshakeResponse::new(SOCKS5_AUTH_METHOD_NONE).write_to(&mut stream).await?;

    // 2. Request
    let header = match TcpRequestHeader::read_from(&mut stream).await {
        Ok(h) => h,
        Err(Socks5Error::IoError(err)) => return Err(err),
        Err(err) => {
            let rh = TcpResponseHeader::new(err.as_reply(), zero_address());
            rh.write_to(&mut stream).await?;
            return Err(err.into());
        }
    };

    trace!("socks5 {:?} peer: {}", header, peer_addr);

    match header.command {
        Command::TcpConnect => {
            let rh = TcpResponseHeader::new(Reply::Succeeded, zero_address());
            rh.write_to(&mut stream).await?;

            super::establish_tcp_tunnel(stream, peer_addr, &header.address, &svr_cfg).await
        }
        Command::UdpAssociate => {
            // the UDP tunnel endpoint is known to the client out-of-band
            let rh = TcpResponseHeader::new(Reply::Succeeded, zero_address());
            rh.write_to(&mut stream).await?;

            // hold the connection until the client closes it
            let res = ignore_until_end(&mut stream).await;
            trace!("socks5 udp associate from {} ended", peer_addr);
            res
        }
        Command::TcpBind => {
            let rh = TcpResponseHeader::new(Reply::CommandNotSupported, header.address);
            rh.write_to(&mut stream).await?;
            Ok(())
        }
    }
}

fn zero_address() -> Address {
    Address::SocketAddress(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
}
