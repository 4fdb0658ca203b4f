//! AEAD chunked stream framing
//!
//! Defined in <https://shadowsocks.org/en/spec/AEAD-Ciphers.html>.
//!
//! ```plain
//! TCP stream (*ciphertext*)
//! +--------+--------------+---------------+--------------+------------+
//! |  SALT  |   *DataLen*  |  DataLen_TAG  |    *Data*    |  Data_TAG  |
//! +--------+--------------+---------------+--------------+------------+
//! | Fixed  |       2      |     Fixed     |   Variable   |   Fixed    |
//! +--------+--------------+---------------+--------------+------------+
//! ```
//!
//! The salt is written exactly once at the head of each direction; the
//! `(length, payload)` chunk pair repeats after it. Every chunk is sealed
//! with the session subkey and an incrementing little-endian nonce. A
//! length chunk that decodes to zero marks clean end-of-stream.

use std::{
    io::{self, ErrorKind},
    marker::Unpin,
    pin::Pin,
    slice,
    task::{self, Poll},
};

use byte_string::ByteStr;
use bytes::{BufMut, Bytes, BytesMut};
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{Cipher, CipherKind};

/// AEAD chunk payload must be smaller than 0x3FFF
///
/// The decoded length is masked with this value; the top two bits are
/// reserved and ignored.
pub const MAX_PACKET_SIZE: usize = 0x3FFF;

/// AEAD stream protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("AEAD authentication failed")]
    AuthFailed,
    #[error("stream ended in the middle of a record")]
    TruncatedFrame,
}

/// AEAD stream protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> io::Error {
        match e {
            ProtocolError::IoError(err) => err,
            ProtocolError::AuthFailed => io::Error::new(ErrorKind::Other, "AEAD authentication failed"),
            ProtocolError::TruncatedFrame => ErrorKind::UnexpectedEof.into(),
        }
    }
}

enum DecryptReadState {
    WaitSalt { key: Bytes },
    ReadLength,
    ReadData { length: usize },
    BufferedData { pos: usize },
    Eof,
}

/// Reader half of one direction, decrypting chunks from the underlying stream
///
/// Construction performs no I/O: the salt is consumed and the session
/// subkey derived lazily on the first read.
pub struct DecryptedReader {
    state: DecryptReadState,
    cipher: Option<Cipher>,
    buffer: BytesMut,
    method: CipherKind,
}

impl DecryptedReader {
    pub fn new(method: CipherKind, key: &[u8]) -> DecryptedReader {
        DecryptedReader {
            state: DecryptReadState::WaitSalt {
                key: Bytes::copy_from_slice(key),
            },
            cipher: None,
            buffer: BytesMut::with_capacity(method.salt_len()),
            method,
        }
    }

    /// Attempt to read decrypted data from `stream`
    ///
    /// A read with an empty `buf` still drives the lazy initialization and
    /// authenticates at most one length chunk, consuming nothing beyond
    /// `salt || len-chunk` from the wire. Cipher discovery and EOF
    /// observation both rely on this.
    pub fn poll_read_decrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        loop {
            match self.state {
                DecryptReadState::WaitSalt { ref key } => {
                    let key = key.clone();
                    if !ready!(self.poll_read_salt(cx, stream, &key))? {
                        // EOF before the salt is a clean close
                        self.state = DecryptReadState::Eof;
                        return Ok(()).into();
                    }

                    self.buffer.clear();
                    self.state = DecryptReadState::ReadLength;
                    self.buffer.reserve(2 + self.method.tag_len());
                }
                DecryptReadState::ReadLength => match ready!(self.poll_read_length(cx, stream))? {
                    None => {
                        self.state = DecryptReadState::Eof;
                        return Ok(()).into();
                    }
                    Some(0) => {
                        // explicit end-of-stream chunk
                        self.state = DecryptReadState::Eof;
                        return Ok(()).into();
                    }
                    Some(length) => {
                        self.buffer.clear();
                        self.state = DecryptReadState::ReadData { length };
                        self.buffer.reserve(length + self.method.tag_len());
                    }
                },
                DecryptReadState::ReadData { length } => {
                    if buf.remaining() == 0 {
                        // probe read stops after authenticating the length
                        return Ok(()).into();
                    }

                    ready!(self.poll_read_data(cx, stream, length))?;
                    self.state = DecryptReadState::BufferedData { pos: 0 };
                }
                DecryptReadState::BufferedData { ref mut pos } => {
                    if *pos < self.buffer.len() {
                        let buffered = &self.buffer[*pos..];

                        let consumed = usize::min(buffered.len(), buf.remaining());
                        buf.put_slice(&buffered[..consumed]);

                        *pos += consumed;

                        return Ok(()).into();
                    }

                    self.buffer.clear();
                    self.state = DecryptReadState::ReadLength;
                    self.buffer.reserve(2 + self.method.tag_len());
                }
                DecryptReadState::Eof => {
                    return Ok(()).into();
                }
            }
        }
    }

    /// Returns `false` on clean EOF before any salt byte
    fn poll_read_salt<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        key: &[u8],
    ) -> Poll<ProtocolResult<bool>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let salt_len = self.method.salt_len();

        let n = ready!(self.poll_read_exact(cx, stream, salt_len))?;
        if n == 0 {
            return Ok(false).into();
        }

        let salt = &self.buffer[..salt_len];
        trace!("got AEAD salt {:?}", ByteStr::new(salt));

        self.cipher = Some(Cipher::new(self.method, key, salt));

        Ok(true).into()
    }

    fn poll_read_length<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
    ) -> Poll<ProtocolResult<Option<usize>>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let length_len = 2 + self.method.tag_len();

        let n = ready!(self.poll_read_exact(cx, stream, length_len))?;
        if n == 0 {
            return Ok(None).into();
        }

        let cipher = self.cipher.as_mut().expect("cipher is None");

        let m = &mut self.buffer[..length_len];
        if !cipher.decrypt_packet(m) {
            return Err(ProtocolError::AuthFailed).into();
        }

        // The higher two bits are reserved
        let length = u16::from_be_bytes([m[0], m[1]]) as usize & MAX_PACKET_SIZE;
        Ok(Some(length)).into()
    }

    fn poll_read_data<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        size: usize,
    ) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let data_len = size + self.method.tag_len();

        let n = ready!(self.poll_read_exact(cx, stream, data_len))?;
        if n == 0 {
            return Err(ProtocolError::TruncatedFrame).into();
        }

        let cipher = self.cipher.as_mut().expect("cipher is None");

        let m = &mut self.buffer[..data_len];
        if !cipher.decrypt_packet(m) {
            return Err(ProtocolError::AuthFailed).into();
        }

        // Remove TAG
        self.buffer.truncate(size);

        Ok(()).into()
    }

    /// Read exactly `size` bytes into the internal buffer
    ///
    /// EOF on a record boundary (nothing buffered) yields `Ok(0)`; EOF in
    /// the middle of a record is `TruncatedFrame`.
    fn poll_read_exact<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        size: usize,
    ) -> Poll<ProtocolResult<usize>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        assert!(size != 0);

        while self.buffer.len() < size {
            let remaining = size - self.buffer.len();
            let buffer = &mut self.buffer.chunk_mut()[..remaining];

            let mut read_buf =
                ReadBuf::uninit(unsafe { slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut _, remaining) });
            ready!(Pin::new(&mut *stream).poll_read(cx, &mut read_buf))?;

            let n = read_buf.filled().len();
            if n == 0 {
                if !self.buffer.is_empty() {
                    return Err(ProtocolError::TruncatedFrame).into();
                } else {
                    return Ok(0).into();
                }
            }

            unsafe {
                self.buffer.advance_mut(n);
            }
        }

        Ok(size).into()
    }
}

enum EncryptWriteState {
    AssemblePacket,
    Writing { pos: usize },
}

/// Writer half of one direction, sealing chunks into the underlying stream
///
/// The salt is queued at construction and leaves with the first chunk, so
/// constructors never touch the network. Writes larger than
/// [`MAX_PACKET_SIZE`] are truncated and the framed byte count returned;
/// callers loop.
pub struct EncryptedWriter {
    cipher: Cipher,
    buffer: BytesMut,
    state: EncryptWriteState,
    salt: Bytes,
}

impl EncryptedWriter {
    /// Creates a new writer with the session `salt`
    pub fn new(method: CipherKind, key: &[u8], salt: &[u8]) -> EncryptedWriter {
        // salt is sent with the first chunk
        let mut buffer = BytesMut::with_capacity(salt.len());
        buffer.put(salt);

        EncryptedWriter {
            cipher: Cipher::new(method, key, salt),
            buffer,
            state: EncryptWriteState::AssemblePacket,
            salt: Bytes::copy_from_slice(salt),
        }
    }

    /// The salt this writer prefixes its stream with
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Attempt to write encrypted data to `stream`
    pub fn poll_write_encrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        mut buf: &[u8],
    ) -> Poll<ProtocolResult<usize>>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        if buf.len() > MAX_PACKET_SIZE {
            buf = &buf[..MAX_PACKET_SIZE];
        }

        loop {
            match self.state {
                EncryptWriteState::AssemblePacket => {
                    // Step 1. Append length chunk
                    let length_size = 2 + self.cipher.tag_len();
                    self.buffer.reserve(length_size);

                    let mbuf = &mut self.buffer.chunk_mut()[..length_size];
                    let mbuf = unsafe { slice::from_raw_parts_mut(mbuf.as_mut_ptr(), mbuf.len()) };

                    self.buffer.put_u16(buf.len() as u16);
                    self.cipher.encrypt_packet(mbuf);
                    unsafe { self.buffer.advance_mut(self.cipher.tag_len()) };

                    // Step 2. Append payload chunk
                    let data_size = buf.len() + self.cipher.tag_len();
                    self.buffer.reserve(data_size);

                    let mbuf = &mut self.buffer.chunk_mut()[..data_size];
                    let mbuf = unsafe { slice::from_raw_parts_mut(mbuf.as_mut_ptr(), mbuf.len()) };

                    self.buffer.put_slice(buf);
                    self.cipher.encrypt_packet(mbuf);
                    unsafe { self.buffer.advance_mut(self.cipher.tag_len()) };

                    // Step 3. Write all
                    self.state = EncryptWriteState::Writing { pos: 0 };
                }
                EncryptWriteState::Writing { ref mut pos } => {
                    while *pos < self.buffer.len() {
                        let n = ready!(Pin::new(&mut *stream).poll_write(cx, &self.buffer[*pos..]))?;
                        if n == 0 {
                            return Err(ProtocolError::IoError(ErrorKind::WriteZero.into())).into();
                        }
                        *pos += n;
                    }

                    self.state = EncryptWriteState::AssemblePacket;
                    self.buffer.clear();

                    return Ok(buf.len()).into();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    fn test_pair(kind: CipherKind) -> (Vec<u8>, Vec<u8>) {
        let key = vec![0x55u8; kind.key_len()];
        let salt = vec![0xAAu8; kind.salt_len()];
        (key, salt)
    }

    async fn write_all_framed(w: &mut EncryptedWriter, stream: &mut DuplexStream, mut data: &[u8]) {
        while !data.is_empty() {
            let n = poll_fn(|cx| w.poll_write_encrypted(cx, stream, data)).await.unwrap();
            data = &data[n..];
        }
    }

    async fn read_framed(r: &mut DecryptedReader, stream: &mut DuplexStream, out: &mut Vec<u8>) -> ProtocolResult<()> {
        let mut chunk = [0u8; 1024];
        loop {
            let mut buf = ReadBuf::new(&mut chunk);
            poll_fn(|cx| r.poll_read_decrypted(cx, stream, &mut buf)).await?;
            if buf.filled().is_empty() {
                return Ok(());
            }
            out.extend_from_slice(buf.filled());
        }
    }

    #[tokio::test]
    async fn roundtrip_arbitrary_splits() {
        let kind = CipherKind::AES_256_GCM;
        let (key, salt) = test_pair(kind);

        let message: Vec<u8> = (0..(3 * MAX_PACKET_SIZE + 177)).map(|i| i as u8).collect();

        let (mut client, mut server) = duplex(1 << 20);

        let mut w = EncryptedWriter::new(kind, &key, &salt);
        // uneven splits across chunk boundaries
        for piece in message.chunks(MAX_PACKET_SIZE / 2 + 13) {
            write_all_framed(&mut w, &mut client, piece).await;
        }
        client.shutdown().await.unwrap();
        drop(client);

        let mut r = DecryptedReader::new(kind, &key);
        let mut received = Vec::new();
        read_framed(&mut r, &mut server, &mut received).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn oversize_write_is_truncated() {
        let kind = CipherKind::AES_128_GCM;
        let (key, salt) = test_pair(kind);

        let (mut client, _server) = duplex(1 << 20);
        let mut w = EncryptedWriter::new(kind, &key, &salt);

        let big = vec![0u8; MAX_PACKET_SIZE + 1000];
        let n = poll_fn(|cx| w.poll_write_encrypted(cx, &mut client, &big)).await.unwrap();
        assert_eq!(n, MAX_PACKET_SIZE);
    }

    #[tokio::test]
    async fn wire_format_is_salt_then_sealed_chunks() {
        let kind = CipherKind::CHACHA20_POLY1305;
        let (key, salt) = test_pair(kind);

        let (mut client, mut server) = duplex(1 << 20);
        let mut w = EncryptedWriter::new(kind, &key, &salt);
        write_all_framed(&mut w, &mut client, b"attack at dawn").await;
        drop(client);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();

        assert_eq!(&wire[..kind.salt_len()], &salt[..]);
        assert_eq!(
            wire.len(),
            kind.salt_len() + (2 + kind.tag_len()) + (14 + kind.tag_len())
        );

        // replay the two sealed records manually
        let mut c = Cipher::new(kind, &key, &salt);
        let mut len_chunk = wire[kind.salt_len()..kind.salt_len() + 2 + kind.tag_len()].to_vec();
        assert!(c.decrypt_packet(&mut len_chunk));
        assert_eq!(u16::from_be_bytes([len_chunk[0], len_chunk[1]]), 14);

        let mut data_chunk = wire[kind.salt_len() + 2 + kind.tag_len()..].to_vec();
        assert!(c.decrypt_packet(&mut data_chunk));
        assert_eq!(&data_chunk[..14], b"attack at dawn");
    }

    #[tokio::test]
    async fn bit_flip_is_auth_failure() {
        let kind = CipherKind::AES_128_GCM;
        let (key, salt) = test_pair(kind);

        let (mut client, mut server) = duplex(1 << 20);
        let mut w = EncryptedWriter::new(kind, &key, &salt);
        write_all_framed(&mut w, &mut client, b"hello").await;
        drop(client);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();

        // flip one bit after the salt
        let flip_at = kind.salt_len() + 3;
        wire[flip_at] ^= 0x80;

        let mut r = DecryptedReader::new(kind, &key);
        let mut received = Vec::new();
        let mut cur = std::io::Cursor::new(wire);
        let err = read_framed_cursor(&mut r, &mut cur, &mut received).await.unwrap_err();
        assert!(matches!(err, ProtocolError::AuthFailed));
        assert!(received.is_empty());
    }

    async fn read_framed_cursor(
        r: &mut DecryptedReader,
        cur: &mut std::io::Cursor<Vec<u8>>,
        out: &mut Vec<u8>,
    ) -> ProtocolResult<()> {
        let mut chunk = [0u8; 1024];
        loop {
            let mut buf = ReadBuf::new(&mut chunk);
            poll_fn(|cx| r.poll_read_decrypted(cx, cur, &mut buf)).await?;
            if buf.filled().is_empty() {
                return Ok(());
            }
            out.extend_from_slice(buf.filled());
        }
    }

    #[tokio::test]
    async fn eof_after_salt_is_clean() {
        let kind = CipherKind::AES_128_GCM;
        let (key, salt) = test_pair(kind);

        let mut cur = std::io::Cursor::new(salt.clone());
        let mut r = DecryptedReader::new(kind, &key);
        let mut received = Vec::new();
        read_framed_cursor(&mut r, &mut cur, &mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn eof_before_salt_is_clean() {
        let kind = CipherKind::AES_256_GCM;
        let (key, _) = test_pair(kind);

        let mut cur = std::io::Cursor::new(Vec::new());
        let mut r = DecryptedReader::new(kind, &key);
        let mut received = Vec::new();
        read_framed_cursor(&mut r, &mut cur, &mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn eof_mid_record_is_truncated_frame() {
        let kind = CipherKind::AES_128_GCM;
        let (key, salt) = test_pair(kind);

        let (mut client, mut server) = duplex(1 << 20);
        let mut w = EncryptedWriter::new(kind, &key, &salt);
        write_all_framed(&mut w, &mut client, b"cut me short").await;
        drop(client);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        wire.truncate(wire.len() - 5);

        let mut r = DecryptedReader::new(kind, &key);
        let mut received = Vec::new();
        let mut cur = std::io::Cursor::new(wire);
        let err = read_framed_cursor(&mut r, &mut cur, &mut received).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame));
    }

    #[tokio::test]
    async fn zero_length_chunk_is_eof() {
        let kind = CipherKind::AES_128_GCM;
        let (key, salt) = test_pair(kind);

        // salt || seal(len=0)
        let mut wire = salt.clone();
        let mut c = Cipher::new(kind, &key, &salt);
        let mut len_chunk = vec![0u8; 2 + kind.tag_len()];
        c.encrypt_packet(&mut len_chunk);
        wire.extend_from_slice(&len_chunk);

        let mut r = DecryptedReader::new(kind, &key);
        let mut received = Vec::new();
        let mut cur = std::io::Cursor::new(wire);
        read_framed_cursor(&mut r, &mut cur, &mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn empty_probe_consumes_only_salt_and_length() {
        let kind = CipherKind::AES_128_GCM;
        let (key, salt) = test_pair(kind);

        let (mut client, mut server) = duplex(1 << 20);
        let mut w = EncryptedWriter::new(kind, &key, &salt);
        write_all_framed(&mut w, &mut client, b"payload stays put").await;

        let mut r = DecryptedReader::new(kind, &key);
        let mut empty_storage = [0u8; 0];
        let mut empty = ReadBuf::new(&mut empty_storage);
        poll_fn(|cx| r.poll_read_decrypted(cx, &mut server, &mut empty))
            .await
            .unwrap();

        // the sealed payload chunk must still be readable from the wire
        let mut rest = vec![0u8; 17 + kind.tag_len()];
        server.read_exact(&mut rest).await.unwrap();

        // the payload chunk was sealed with nonce 1, so burn nonce 0 first
        let mut probe = Cipher::new(kind, &key, &salt);
        let mut sink = vec![0u8; 2 + kind.tag_len()];
        probe.encrypt_packet(&mut sink);
        assert!(probe.decrypt_packet(&mut rest[..]));
        assert_eq!(&rest[..17], b"payload stays put");
    }
}
