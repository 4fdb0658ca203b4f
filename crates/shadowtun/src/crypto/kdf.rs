//! Key derivation
//!
//! `openssl_bytes_to_key` is OpenSSL's legacy `EVP_BytesToKey` (MD5, no
//! salt, one round). It is kept only for interoperability with every other
//! shadowsocks implementation; treat it as an opaque primitive.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

/// Derive the master key from a password with `EVP_BytesToKey`
///
/// Fills `key` completely; `key.len()` selects the derived length.
pub fn openssl_bytes_to_key(password: &[u8], key: &mut [u8]) {
    let key_len = key.len();

    let mut last_digest: Option<[u8; 16]> = None;
    let mut offset = 0;

    while offset < key_len {
        let mut m = Md5::new();
        if let Some(ref digest) = last_digest {
            m.update(digest);
        }
        m.update(password);

        let digest = m.finalize();

        let amt = usize::min(key_len - offset, digest.len());
        key[offset..offset + amt].copy_from_slice(&digest[..amt]);

        offset += amt;
        last_digest = Some(digest.into());
    }
}

/// Derive a per-session subkey with HKDF-SHA1, info `"ss-subkey"`
///
/// `okm.len()` must equal the cipher's key length.
pub fn hkdf_sha1(key: &[u8], salt: &[u8], okm: &mut [u8]) {
    const SUBKEY_INFO: &[u8] = b"ss-subkey";

    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    hk.expand(SUBKEY_INFO, okm).expect("HKDF-SHA1 expand");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_key_16() {
        // EVP_BytesToKey("foobar", md5, no salt) first block is md5("foobar")
        let mut key = [0u8; 16];
        openssl_bytes_to_key(b"foobar", &mut key);
        assert_eq!(
            key,
            [
                0x38, 0x58, 0xf6, 0x22, 0x30, 0xac, 0x3c, 0x91, 0x5f, 0x30, 0x0c, 0x66, 0x43, 0x12,
                0xc6, 0x3f
            ]
        );
    }

    #[test]
    fn bytes_to_key_32() {
        // Second block is md5(md5("foobar") || "foobar")
        let mut key = [0u8; 32];
        openssl_bytes_to_key(b"foobar", &mut key);

        let mut first = [0u8; 16];
        openssl_bytes_to_key(b"foobar", &mut first);
        assert_eq!(&key[..16], &first[..]);

        let mut m = Md5::new();
        m.update(first);
        m.update(b"foobar");
        assert_eq!(&key[16..], &m.finalize()[..]);
    }

    #[test]
    fn subkey_depends_on_salt() {
        let key = [7u8; 32];
        let mut okm1 = [0u8; 32];
        let mut okm2 = [0u8; 32];
        hkdf_sha1(&key, &[1u8; 32], &mut okm1);
        hkdf_sha1(&key, &[2u8; 32], &mut okm2);
        assert_ne!(okm1, okm2);
    }
}
