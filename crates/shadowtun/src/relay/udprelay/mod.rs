//! Per-datagram AEAD sealing for UDP relay
//!
//! ```plain
//! UDP packet (*ciphertext*)
//! +--------+------------------------+-----------+
//! |  SALT  |  *ADDRESS || Payload*  |  Data_TAG |
//! +--------+------------------------+-----------+
//! | Fixed  |        Variable        |   Fixed   |
//! +--------+------------------------+-----------+
//! ```
//!
//! Datagrams are independent: each carries its own freshly random salt and
//! is sealed with an all-zero nonce. Nonce uniqueness therefore rests
//! entirely on the salt RNG, which must be the OS CSPRNG.

use std::io::Cursor;

use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use log::trace;
use rand::RngCore;

use crate::{
    crypto::{Cipher, CipherKind},
    relay::socks5::{Address, Error as Socks5Error},
};

/// Maximum size of one datagram payload buffer
pub const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;

/// UDP AEAD protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("packet too short for salt, at least {0} bytes, but only {1} bytes")]
    PacketTooShortForSalt(usize, usize),
    #[error("packet too short for tag, at least {0} bytes, but only {1} bytes")]
    PacketTooShortForTag(usize, usize),
    #[error("invalid address in packet, {0}")]
    InvalidAddress(Socks5Error),
    #[error("decrypt payload failed")]
    DecryptPayloadError,
}

/// UDP AEAD protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Seal `plain` (already `ADDRESS || payload`) into a datagram
pub fn encrypt_prefixed_payload(method: CipherKind, key: &[u8], plain: &[u8], dst: &mut BytesMut) {
    let salt_len = method.salt_len();

    // Packet = SALT || PLAIN || TAG
    dst.reserve(salt_len + plain.len() + method.tag_len());

    dst.resize(salt_len, 0);
    let salt = &mut dst[..salt_len];
    rand::thread_rng().fill_bytes(salt);
    trace!("UDP packet generated AEAD salt {:?}", ByteStr::new(salt));

    let mut cipher = Cipher::new(method, key, salt);

    dst.put_slice(plain);

    unsafe {
        dst.advance_mut(method.tag_len());
    }

    let m = &mut dst[salt_len..];
    cipher.encrypt_packet(m);
}

/// Seal `addr || payload` into a datagram
pub fn encrypt_payload(method: CipherKind, key: &[u8], addr: &Address, payload: &[u8], dst: &mut BytesMut) {
    let mut plain = BytesMut::with_capacity(addr.serialized_len() + payload.len());
    addr.write_to_buf(&mut plain);
    plain.put_slice(payload);

    encrypt_prefixed_payload(method, key, &plain, dst)
}

/// Open a datagram in place, leaving `ADDRESS || payload` at the front
///
/// Returns the plaintext length.
pub fn decrypt_packet(method: CipherKind, key: &[u8], packet: &mut [u8]) -> ProtocolResult<usize> {
    let plen = packet.len();
    let salt_len = method.salt_len();
    if plen < salt_len {
        return Err(ProtocolError::PacketTooShortForSalt(salt_len, plen));
    }

    let (salt, data) = packet.split_at_mut(salt_len);
    trace!("UDP packet got AEAD salt {:?}", ByteStr::new(salt));

    let mut cipher = Cipher::new(method, key, salt);
    let tag_len = cipher.tag_len();

    if data.len() < tag_len {
        return Err(ProtocolError::PacketTooShortForTag(tag_len, data.len()));
    }

    if !cipher.decrypt_packet(data) {
        return Err(ProtocolError::DecryptPayloadError);
    }

    let data_len = data.len() - tag_len;
    packet.copy_within(salt_len..salt_len + data_len, 0);

    Ok(data_len)
}

/// Open a datagram in place and split the leading address off
///
/// The bare payload is moved to the front of `packet`; returns its length
/// and the embedded destination (or source) address.
pub fn decrypt_payload(method: CipherKind, key: &[u8], packet: &mut [u8]) -> ProtocolResult<(usize, Address)> {
    let data_len = decrypt_packet(method, key, packet)?;

    let (addr_len, addr) = {
        let mut cur = Cursor::new(&packet[..data_len]);
        match Address::read_cursor(&mut cur) {
            Ok(address) => (cur.position() as usize, address),
            Err(err) => return Err(ProtocolError::InvalidAddress(err)),
        }
    };

    let payload_len = data_len - addr_len;
    packet.copy_within(addr_len..data_len, 0);

    Ok((payload_len, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_roundtrip() {
        let method = CipherKind::AES_256_GCM;
        let key = vec![0x42u8; method.key_len()];
        let addr: Address = "8.8.8.8:53".parse().unwrap();
        let query = b"\x12\x34\x01\x00 dns question";

        let mut packet = BytesMut::new();
        encrypt_payload(method, &key, &addr, query, &mut packet);

        assert_eq!(
            packet.len(),
            method.salt_len() + addr.serialized_len() + query.len() + method.tag_len()
        );

        let mut buf = packet.to_vec();
        let (n, parsed) = decrypt_payload(method, &key, &mut buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(&buf[..n], query);
    }

    #[test]
    fn fresh_salt_per_packet() {
        let method = CipherKind::CHACHA20_POLY1305;
        let key = vec![1u8; method.key_len()];
        let addr: Address = "example.com:53".parse().unwrap();

        let mut p1 = BytesMut::new();
        let mut p2 = BytesMut::new();
        encrypt_payload(method, &key, &addr, b"same", &mut p1);
        encrypt_payload(method, &key, &addr, b"same", &mut p2);

        assert_ne!(&p1[..method.salt_len()], &p2[..method.salt_len()]);
        assert_ne!(p1, p2);
    }

    #[test]
    fn tampered_datagram_rejected() {
        let method = CipherKind::AES_128_GCM;
        let key = vec![7u8; method.key_len()];
        let addr: Address = "10.0.0.1:1000".parse().unwrap();

        let mut packet = BytesMut::new();
        encrypt_payload(method, &key, &addr, b"payload", &mut packet);

        let mut buf = packet.to_vec();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(matches!(
            decrypt_payload(method, &key, &mut buf),
            Err(ProtocolError::DecryptPayloadError)
        ));
    }

    #[test]
    fn short_packets_rejected() {
        let method = CipherKind::AES_128_GCM;
        let key = vec![7u8; method.key_len()];

        let mut buf = vec![0u8; method.salt_len() - 1];
        assert!(matches!(
            decrypt_packet(method, &key, &mut buf),
            Err(ProtocolError::PacketTooShortForSalt(..))
        ));

        let mut buf = vec![0u8; method.salt_len() + 3];
        assert!(matches!(
            decrypt_packet(method, &key, &mut buf),
            Err(ProtocolError::PacketTooShortForTag(..))
        ));
    }
}
