//! TCP stream for communicating with a proxy client

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    crypto::CipherKind,
    relay::{socks5::Address, tcprelay::crypto_io::CryptoStream},
};

/// A stream accepted from a proxy client
#[derive(Debug)]
pub struct ProxyServerStream<S> {
    stream: CryptoStream<S>,
    has_handshaked: bool,
}

impl<S> ProxyServerStream<S> {
    /// Wrap an accepted connection stream
    pub fn from_stream(stream: S, method: CipherKind, key: &[u8]) -> ProxyServerStream<S> {
        ProxyServerStream {
            stream: CryptoStream::from_stream(stream, method, key),
            has_handshaked: false,
        }
    }

    pub(crate) fn from_crypto_stream(stream: CryptoStream<S>) -> ProxyServerStream<S> {
        ProxyServerStream {
            stream,
            has_handshaked: false,
        }
    }

    /// Get reference of the internal stream
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Get mutable reference of the internal stream
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Consume the object and return the internal stream
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S> ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handshaking, getting the destination address from the client
    ///
    /// Must be called exactly once after accepting.
    pub async fn handshake(&mut self) -> io::Result<Address> {
        if self.has_handshaked {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "stream is already handshaked",
            ));
        }

        self.has_handshaked = true;
        let addr = Address::read_from(self).await?;
        Ok(addr)
    }
}

impl<S> AsyncRead for ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_decrypted(cx, buf).map_err(Into::into)
    }
}

impl<S> AsyncWrite for ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.stream.poll_write_encrypted(cx, buf).map_err(Into::into)
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
