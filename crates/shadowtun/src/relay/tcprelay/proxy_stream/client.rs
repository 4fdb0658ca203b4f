//! TCP stream for communicating with a remote proxy peer

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use bytes::{BufMut, BytesMut};
use futures::ready;
use log::trace;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    config::ServerConfig,
    net,
    relay::{socks5::Address, tcprelay::crypto_io::CryptoStream},
};

/// A stream that reaches `target` through a remote proxy peer
///
/// The encoded target address is the first plaintext of the session. It is
/// prepended lazily to the first written payload so that the tunnel header
/// and the first application bytes share one chunk.
pub struct ProxyClientStream<S> {
    stream: CryptoStream<S>,
    addr: Option<Address>,
}

impl ProxyClientStream<TcpStream> {
    /// Connect to `addr` via the proxy server configured by `svr_cfg`
    pub async fn connect<A>(svr_cfg: &ServerConfig, addr: A) -> io::Result<ProxyClientStream<TcpStream>>
    where
        A: Into<Address>,
    {
        let stream = net::connect_server(svr_cfg.addr()).await?;

        trace!("connected tcp remote {}", svr_cfg.addr());

        Ok(ProxyClientStream::from_stream(stream, svr_cfg, addr))
    }
}

impl<S> ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a `stream` already connected to the proxy server
    pub fn from_stream<A>(stream: S, svr_cfg: &ServerConfig, addr: A) -> ProxyClientStream<S>
    where
        A: Into<Address>,
    {
        let addr = addr.into();
        let stream = CryptoStream::from_stream(stream, svr_cfg.method(), svr_cfg.key());

        ProxyClientStream {
            stream,
            addr: Some(addr),
        }
    }

    /// Get reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Get mutable reference to the underlying stream
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Consume the wrapper and return the underlying stream
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S> AsyncRead for ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_decrypted(cx, buf).map_err(Into::into)
    }
}

impl<S> AsyncWrite for ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.addr.is_none() {
            // header already sent, proxy straight through
            return self.stream.poll_write_encrypted(cx, buf).map_err(Into::into);
        }

        let addr = self.addr.take().expect("addr");
        let addr_length = addr.serialized_len();

        // the header and the first payload bytes share one chunk
        let consumed = usize::min(buf.len(), super::super::aead::MAX_PACKET_SIZE - addr_length);

        let mut buffer = BytesMut::with_capacity(addr_length + consumed);
        addr.write_to_buf(&mut buffer);
        buffer.put_slice(&buf[..consumed]);

        ready!(self.stream.poll_write_encrypted(cx, &buffer)).map_err(io::Error::from)?;

        Ok(consumed).into()
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
