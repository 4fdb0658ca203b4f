//! Encrypted byte-stream wrapper
//!
//! Presents a plain duplex stream whose bytes travel the AEAD chunk
//! framing on the wire. Each direction owns its own salt and therefore its
//! own subkey: this side's writer generates one, the peer's writer
//! generates the other.

use std::{
    fmt, io,
    pin::Pin,
    task::{self, Poll},
};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::aead::{DecryptedReader, EncryptedWriter, ProtocolResult};
use crate::crypto::CipherKind;

/// A bidirectional stream carrying AEAD-framed data
pub struct CryptoStream<S> {
    stream: S,
    dec: DecryptedReader,
    enc: EncryptedWriter,
    method: CipherKind,
}

impl<S> fmt::Debug for CryptoStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoStream").field("method", &self.method).finish()
    }
}

impl<S> CryptoStream<S> {
    /// Wrap `stream`, generating a fresh random salt for the write direction
    pub fn from_stream(stream: S, method: CipherKind, key: &[u8]) -> CryptoStream<S> {
        let mut salt = vec![0u8; method.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);

        CryptoStream {
            stream,
            dec: DecryptedReader::new(method, key),
            enc: EncryptedWriter::new(method, key, &salt),
            method,
        }
    }

    /// Get the encryption method
    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Salt sent at the head of the write direction
    pub fn sent_salt(&self) -> &[u8] {
        self.enc.salt()
    }

    /// Return a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Return a mutable reference to the underlying stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the wrapper and return the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> CryptoStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Attempt to read decrypted data, surfacing protocol errors
    pub fn poll_read_decrypted(
        &mut self,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<ProtocolResult<()>> {
        let CryptoStream {
            ref mut dec,
            ref mut stream,
            ..
        } = *self;
        dec.poll_read_decrypted(cx, stream, buf)
    }
}

impl<S> CryptoStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Attempt to write encrypted data, surfacing protocol errors
    pub fn poll_write_encrypted(&mut self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<ProtocolResult<usize>> {
        let CryptoStream {
            ref mut enc,
            ref mut stream,
            ..
        } = *self;
        enc.poll_write_encrypted(cx, stream, buf)
    }
}

impl<S> AsyncRead for CryptoStream<S>
where
    S: AsyncRead + Unpin,
{
    #[inline]
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.poll_read_decrypted(cx, buf).map_err(Into::into)
    }
}

impl<S> AsyncWrite for CryptoStream<S>
where
    S: AsyncWrite + Unpin,
{
    #[inline]
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_write_encrypted(cx, buf).map_err(Into::into)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    /// Half-closes the write direction of the underlying stream
    ///
    /// No trailer is defined; the peer observes FIN at a record boundary.
    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
