//! Cipher discovery for servers configured with more than one key
//!
//! The client does not announce which key it used, so the server trial-
//! decrypts the head of the stream with each candidate until one
//! authenticates. AEAD authentication is the decision function; a false
//! positive has negligible probability.
//!
//! Every byte pulled from the wire while probing is recorded, each failed
//! candidate rewinds to the start of the recording, and the accepted
//! reader is rebuilt over the recording followed by the live stream, so no
//! byte is lost or duplicated. A probe reads exactly one salt and one
//! length chunk, nothing more.

use std::{
    future::poll_fn,
    io::{self, ErrorKind},
    pin::Pin,
    task::{self, Poll},
};

use bytes::BytesMut;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
    aead::{DecryptedReader, ProtocolError},
    crypto_io::CryptoStream,
    proxy_stream::ProxyServerStream,
};
use crate::config::ServerConfig;

/// A stream that can replay the bytes read while probing
///
/// While recording, everything read from the inner stream is appended to a
/// buffer; `rewind` restarts delivery from its beginning. After
/// `stop_recording`, reads drain the remaining buffered bytes and then go
/// straight to the inner stream. Writes always pass through.
pub struct ReplayStream<S> {
    stream: S,
    buffer: BytesMut,
    pos: usize,
    recording: bool,
}

impl<S> ReplayStream<S> {
    pub fn new(stream: S) -> ReplayStream<S> {
        ReplayStream {
            stream,
            buffer: BytesMut::new(),
            pos: 0,
            recording: true,
        }
    }

    /// Restart delivery from the first recorded byte
    pub fn rewind(&mut self) {
        debug_assert!(self.recording);
        self.pos = 0;
    }

    /// Stop recording; buffered bytes are delivered once, then passthrough
    pub fn stop_recording(&mut self) {
        self.recording = false;
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S> AsyncRead for ReplayStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.buffer.len() {
            let replay = &this.buffer[this.pos..];
            let consumed = usize::min(replay.len(), buf.remaining());
            buf.put_slice(&replay[..consumed]);
            this.pos += consumed;
            return Ok(()).into();
        }

        if !this.recording && !this.buffer.is_empty() {
            // recording fully drained, release it
            this.buffer = BytesMut::new();
            this.pos = 0;
        }

        if this.recording {
            let filled_before = buf.filled().len();
            futures::ready!(Pin::new(&mut this.stream).poll_read(cx, buf))?;
            let newly = &buf.filled()[filled_before..];
            this.buffer.extend_from_slice(newly);
            this.pos = this.buffer.len();
            Ok(()).into()
        } else {
            Pin::new(&mut this.stream).poll_read(cx, buf)
        }
    }
}

impl<S> AsyncWrite for ReplayStream<S>
where
    S: AsyncWrite + Unpin,
{
    #[inline]
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Identify which configured key the accepted connection used
///
/// With a single candidate no probing happens at all. Authentication
/// failure is the only per-candidate non-fatal outcome; transport errors
/// abort discovery. If no candidate authenticates, the connection is
/// rejected.
pub async fn discover_cipher<S>(
    stream: S,
    candidates: &[ServerConfig],
) -> io::Result<ProxyServerStream<ReplayStream<S>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    assert!(!candidates.is_empty(), "no cipher candidates");

    let mut stream = ReplayStream::new(stream);

    if candidates.len() == 1 {
        let svr = &candidates[0];
        stream.stop_recording();
        return Ok(ProxyServerStream::from_stream(stream, svr.method(), svr.key()));
    }

    for (i, svr) in candidates.iter().enumerate() {
        trace!("trying cipher {} ({})", i, svr.method());

        // drive lazy init and the first length chunk's authenticated open
        let mut dec = DecryptedReader::new(svr.method(), svr.key());
        let mut empty = [0u8; 0];
        let mut probe = ReadBuf::new(&mut empty);

        match poll_fn(|cx| dec.poll_read_decrypted(cx, &mut stream, &mut probe)).await {
            Ok(()) => {
                trace!("selected cipher {} ({})", i, svr.method());

                stream.rewind();
                stream.stop_recording();

                let crypto = CryptoStream::from_stream(stream, svr.method(), svr.key());
                return Ok(ProxyServerStream::from_crypto_stream(crypto));
            }
            Err(ProtocolError::AuthFailed) | Err(ProtocolError::TruncatedFrame) => {
                trace!("failed cipher {} ({})", i, svr.method());
                stream.rewind();
            }
            Err(ProtocolError::IoError(err)) => return Err(err),
        }
    }

    Err(io::Error::new(
        ErrorKind::Other,
        "no configured cipher could authenticate the connection",
    ))
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{crypto::CipherKind, relay::tcprelay::proxy_stream::ProxyClientStream};

    fn server(password: &str, kind: CipherKind) -> ServerConfig {
        ServerConfig::new(("127.0.0.1", 8388), password, kind)
    }

    async fn run_discovery(candidates: Vec<ServerConfig>, used: &ServerConfig) {
        let (a, b) = duplex(1 << 20);

        let target: crate::relay::socks5::Address = "example.com:80".parse().unwrap();
        let mut client = ProxyClientStream::from_stream(a, used, target.clone());
        client.write_all(b"first payload bytes").await.unwrap();

        let mut accepted = discover_cipher(b, &candidates).await.unwrap();
        let addr = accepted.handshake().await.unwrap();
        assert_eq!(addr, target);

        let mut buf = vec![0u8; 19];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first payload bytes");

        // bytes written after discovery still flow
        client.write_all(b" and more").await.unwrap();
        let mut buf = vec![0u8; 9];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b" and more");
    }

    #[tokio::test]
    async fn selects_first_key() {
        let a = server("key-a", CipherKind::AES_128_GCM);
        let b = server("key-b", CipherKind::AES_128_GCM);
        run_discovery(vec![a.clone(), b], &a).await;
    }

    #[tokio::test]
    async fn selects_second_key() {
        let a = server("key-a", CipherKind::AES_128_GCM);
        let b = server("key-b", CipherKind::AES_128_GCM);
        run_discovery(vec![a, b.clone()], &b).await;
    }

    #[tokio::test]
    async fn selects_across_cipher_kinds() {
        let a = server("alpha", CipherKind::AES_256_GCM);
        let b = server("beta", CipherKind::CHACHA20_POLY1305);
        run_discovery(vec![a.clone(), b.clone()], &b).await;
        run_discovery(vec![b, a.clone()], &a).await;
    }

    #[tokio::test]
    async fn rejects_unknown_key() {
        let a = server("key-a", CipherKind::AES_128_GCM);
        let b = server("key-b", CipherKind::AES_128_GCM);
        let mallory = server("key-m", CipherKind::AES_128_GCM);

        let (client_end, server_end) = duplex(1 << 20);

        let target: crate::relay::socks5::Address = "example.com:80".parse().unwrap();
        let mut client = ProxyClientStream::from_stream(client_end, &mallory, target);
        client.write_all(b"denied").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(discover_cipher(server_end, &[a, b]).await.is_err());
    }
}
