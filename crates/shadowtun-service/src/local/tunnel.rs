//! Static TCP tunnel
//!
//! Every connection accepted on the local address is forwarded to one
//! preset target through the remote peer.

use std::{io, sync::Arc, time::Duration};

use log::{debug, error, info};
use shadowtun::{
    net::{self, TCP_KEEPALIVE_PERIOD},
    relay::socks5::Address,
    ServerAddr, ServerConfig,
};
use tokio::time;

/// Run a TCP tunnel from `listen` to `target` through `svr_cfg`
pub async fn run_tcp_tunnel(listen: ServerAddr, target: Address, svr_cfg: Arc<ServerConfig>) -> io::Result<()> {
    let listener = net::bind_tcp(&listen).await?;

    info!(
        "TCP tunnel {} <-> {} <-> {}",
        listener.local_addr()?,
        svr_cfg.addr(),
        target
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                error!("tcp tunnel accept failed with error: {}", err);
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let _ = net::set_tcp_keepalive(&stream, TCP_KEEPALIVE_PERIOD);

        let svr_cfg = svr_cfg.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = super::establish_tcp_tunnel(stream, peer_addr, &target, &svr_cfg).await {
                debug!("tcp tunnel client {} aborted with error: {}", peer_addr, err);
            }
        });
    }
}
