//! Transparent redirect (`iptables REDIRECT`) local server
//!
//! The kernel rewrites the destination of redirected connections; the
//! original destination is recovered with `getsockopt(SO_ORIGINAL_DST)`
//! (`IP6T_SO_ORIGINAL_DST` for IPv6). Linux only.

use std::{io, sync::Arc};

use cfg_if::cfg_if;
use shadowtun::{ServerAddr, ServerConfig};

cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::{net::SocketAddr, time::Duration};

        use log::{debug, error, info};
        use shadowtun::{
            net::{self, TCP_KEEPALIVE_PERIOD},
            relay::socks5::Address,
        };
        use tokio::time;

        /// Run a transparent redirect server on `listen`
        pub async fn run_redir_local(listen: ServerAddr, svr_cfg: Arc<ServerConfig>) -> io::Result<()> {
            let listener = net::bind_tcp(&listen).await?;

            info!(
                "TCP redirect listening on {}, remote {}",
                listener.local_addr()?,
                svr_cfg.addr()
            );

            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(s) => s,
                    Err(err) => {
                        error!("redir accept failed with error: {}", err);
                        time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let _ = net::set_tcp_keepalive(&stream, TCP_KEEPALIVE_PERIOD);

                let target = match sys::get_original_destination_addr(&stream) {
                    Ok(t) => t,
                    Err(err) => {
                        debug!("failed to get original destination of {}: {}", peer_addr, err);
                        continue;
                    }
                };

                let svr_cfg = svr_cfg.clone();
                tokio::spawn(async move {
                    let target = Address::SocketAddress(target);
                    if let Err(err) = super::establish_tcp_tunnel(stream, peer_addr, &target, &svr_cfg).await {
                        debug!("redir client {} aborted with error: {}", peer_addr, err);
                    }
                });
            }
        }

        mod sys {
            use std::{io, mem, net::{SocketAddr, SocketAddrV4, SocketAddrV6, Ipv4Addr, Ipv6Addr}, os::unix::io::AsRawFd};

            use tokio::net::TcpStream;

            pub fn get_original_destination_addr(s: &TcpStream) -> io::Result<SocketAddr> {
                let fd = s.as_raw_fd();

                unsafe {
                    let mut target_addr: libc::sockaddr_storage = mem::zeroed();
                    let mut target_addr_len = mem::size_of_val(&target_addr) as libc::socklen_t;

                    match s.local_addr()? {
                        SocketAddr::V4(..) => {
                            let ret = libc::getsockopt(
                                fd,
                                libc::SOL_IP,
                                libc::SO_ORIGINAL_DST,
                                &mut target_addr as *mut _ as *mut _,
                                &mut target_addr_len,
                            );
                            if ret != 0 {
                                return Err(io::Error::last_os_error());
                            }
                        }
                        SocketAddr::V6(..) => {
                            let ret = libc::getsockopt(
                                fd,
                                libc::SOL_IPV6,
                                libc::IP6T_SO_ORIGINAL_DST,
                                &mut target_addr as *mut _ as *mut _,
                                &mut target_addr_len,
                            );
                            if ret != 0 {
                                return Err(io::Error::last_os_error());
                            }
                        }
                    }

                    sockaddr_to_std(&target_addr)
                }
            }

            fn sockaddr_to_std(saddr: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
                match saddr.ss_family as libc::c_int {
                    libc::AF_INET => {
                        let addr = unsafe { &*(saddr as *const _ as *const libc::sockaddr_in) };
                        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                        let port = u16::from_be(addr.sin_port);
                        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
                    }
                    libc::AF_INET6 => {
                        let addr = unsafe { &*(saddr as *const _ as *const libc::sockaddr_in6) };
                        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
                        let port = u16::from_be(addr.sin6_port);
                        Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, addr.sin6_flowinfo, addr.sin6_scope_id)))
                    }
                    _ => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "getsockopt returned unsupported address family",
                    )),
                }
            }
        }
    } else {
        use log::warn;

        /// Transparent redirect is not available on this platform
        pub async fn run_redir_local(_listen: ServerAddr, _svr_cfg: Arc<ServerConfig>) -> io::Result<()> {
            warn!("TCP transparent redirect is only supported on Linux");
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }
}
