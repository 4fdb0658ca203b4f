//! Service-level network utilities

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Mutex,
};

use tokio::io::{AsyncRead, AsyncReadExt};

/// A pool of fixed-size datagram buffers
///
/// Buffers handed out always have their full length available; `put`
/// restores the length before recycling.
pub struct BufferPool {
    buf_size: usize,
    pool: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool of `buf_size`-byte buffers
    pub fn new(buf_size: usize) -> BufferPool {
        BufferPool {
            buf_size,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a buffer of `buf_size` bytes
    pub fn get(&self) -> Vec<u8> {
        match self.pool.lock().unwrap().pop() {
            Some(buf) => buf,
            None => vec![0u8; self.buf_size],
        }
    }

    /// Return a buffer to the pool
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.resize(self.buf_size, 0);
        self.pool.lock().unwrap().push(buf);
    }
}

/// Bind an ephemeral outbound UDP socket without suspending
///
/// UDP NAT sessions are created while the mapping lock is held, so the
/// bind must not await.
pub fn bind_outbound_udp(family_hint: &SocketAddr) -> io::Result<tokio::net::UdpSocket> {
    let bind_addr: SocketAddr = match family_hint {
        SocketAddr::V4(..) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(..) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = std::net::UdpSocket::bind(bind_addr)?;
    socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(socket)
}

/// Consume all data from `reader` and throw it away until EOF
pub async fn ignore_until_end<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 2048];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
    }

    Ok(())
}
