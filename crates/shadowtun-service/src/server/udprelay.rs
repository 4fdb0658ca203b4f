//! Shadowsocks UDP server with a per-source NAT table
//!
//! Inbound datagrams are opened at the listener; the plaintext
//! `target || payload` rides through the session's single-slot mailbox to
//! the forward worker, which splits the target off, resolves it and sends
//! the bare payload into the world. Replies come back through the receive
//! worker, which prepends the real source address and seals the packet for
//! the client.

use std::{
    collections::HashMap,
    io::{self, Cursor},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::BytesMut;
use log::{debug, error, info, trace};
use shadowtun::{
    net,
    relay::{
        socks5::Address,
        udprelay::{decrypt_packet, encrypt_payload},
    },
    ServerConfig,
};
use tokio::{net::UdpSocket, sync::mpsc, time};

use crate::net::{bind_outbound_udp, BufferPool};

type NatMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// Run a UDP server for `svr_cfg`
pub async fn run_udp_server(svr_cfg: Arc<ServerConfig>, timeout: Duration, pool: Arc<BufferPool>) -> io::Result<()> {
    let inbound = Arc::new(net::bind_udp(svr_cfg.addr()).await?);

    info!("shadowsocks UDP server listening on {}", inbound.local_addr()?);

    let nat: NatMap = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let mut buf = pool.get();

        let (n, peer_addr) = match inbound.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                error!("udp server recv_from failed with error: {}", err);
                pool.put(buf);
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // leave plaintext `target || payload` at the front
        let data_len = match decrypt_packet(svr_cfg.method(), svr_cfg.key(), &mut buf[..n]) {
            Ok(v) => v,
            Err(err) => {
                debug!("udp packet from {} rejected: {}", peer_addr, err);
                pool.put(buf);
                continue;
            }
        };
        buf.truncate(data_len);

        let mut guard = nat.lock().unwrap();
        let tx = match guard.get(&peer_addr) {
            Some(tx) => tx.clone(),
            None => {
                let outbound = match bind_outbound_udp(&family_hint(&buf)) {
                    Ok(s) => Arc::new(s),
                    Err(err) => {
                        error!("failed to create outbound udp socket: {}", err);
                        drop(guard);
                        pool.put(buf);
                        continue;
                    }
                };

                // single-slot mailbox, excess datagrams are dropped
                let (tx, rx) = mpsc::channel(1);
                guard.insert(peer_addr, tx.clone());

                trace!("created udp session for {}", peer_addr);

                tokio::spawn(forward_worker(rx, outbound.clone(), pool.clone()));
                tokio::spawn(receive_worker(
                    inbound.clone(),
                    outbound,
                    peer_addr,
                    svr_cfg.clone(),
                    timeout,
                    pool.clone(),
                    nat.clone(),
                ));

                tx
            }
        };
        drop(guard);

        // non-blocking send; a full slot drops the datagram
        if let Err(err) = tx.try_send(buf) {
            let buf = match err {
                mpsc::error::TrySendError::Full(b) => b,
                mpsc::error::TrySendError::Closed(b) => b,
            };
            pool.put(buf);
        }
    }
}

/// Which address family the outbound socket should be bound with
fn family_hint(packet: &[u8]) -> SocketAddr {
    let mut cur = Cursor::new(packet);
    match Address::read_cursor(&mut cur) {
        Ok(Address::SocketAddress(sa)) => sa,
        _ => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0),
    }
}

/// Split `target || payload`, resolve the target and send the payload out
async fn forward_worker(mut rx: mpsc::Receiver<Vec<u8>>, outbound: Arc<UdpSocket>, pool: Arc<BufferPool>) {
    while let Some(buf) = rx.recv().await {
        let (addr_len, target) = {
            let mut cur = Cursor::new(&buf[..]);
            match Address::read_cursor(&mut cur) {
                Ok(addr) => (cur.position() as usize, addr),
                Err(err) => {
                    error!("failed to split target address from packet: {}", err);
                    pool.put(buf);
                    continue;
                }
            }
        };

        let target_addr = match net::resolve_remote(&target).await {
            Ok(sa) => sa,
            Err(err) => {
                error!("failed to resolve target udp address {}: {}", target, err);
                pool.put(buf);
                continue;
            }
        };

        if let Err(err) = outbound.send_to(&buf[addr_len..], target_addr).await {
            error!("udp server write to {} failed with error: {}", target_addr, err);
        }

        pool.put(buf);
    }
}

/// Seal replies with the real source address prepended and return them to
/// the client
///
/// Terminates on idle timeout or error, tearing down the session: the map
/// entry is removed under the lock, which drops the mailbox sender and
/// stops the forward worker; the outbound socket closes with its last Arc.
async fn receive_worker(
    inbound: Arc<UdpSocket>,
    outbound: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    svr_cfg: Arc<ServerConfig>,
    timeout: Duration,
    pool: Arc<BufferPool>,
    nat: NatMap,
) {
    let mut buf = pool.get();
    let mut packet = BytesMut::new();

    loop {
        // deadline is refreshed ahead of each read
        let (n, from_addr) = match time::timeout(timeout, outbound.recv_from(&mut buf)).await {
            Err(..) => {
                trace!("udp session for {} timed out", peer_addr);
                break;
            }
            Ok(Err(err)) => {
                debug!("udp session for {} read failed with error: {}", peer_addr, err);
                break;
            }
            Ok(Ok(v)) => v,
        };

        packet.clear();
        encrypt_payload(
            svr_cfg.method(),
            svr_cfg.key(),
            &Address::SocketAddress(from_addr),
            &buf[..n],
            &mut packet,
        );

        if let Err(err) = inbound.send_to(&packet, peer_addr).await {
            debug!("udp server write to client {} failed with error: {}", peer_addr, err);
            break;
        }
    }

    pool.put(buf);
    nat.lock().unwrap().remove(&peer_addr);
}
