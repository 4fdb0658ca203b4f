//! Per-session AEAD cipher with an incrementing little-endian nonce

use aes_gcm::{
    aead::{consts::U12, generic_array::GenericArray, AeadInPlace, KeyInit},
    AesGcm,
};
use chacha20poly1305::ChaCha20Poly1305;

use super::{kdf::hkdf_sha1, CipherKind};

type Aes128Gcm = aes_gcm::Aes128Gcm;
type Aes192Gcm = AesGcm<aes::Aes192, U12>;
type Aes256Gcm = aes_gcm::Aes256Gcm;

enum CipherVariant {
    Aes128Gcm(Aes128Gcm),
    Aes192Gcm(Aes192Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl CipherVariant {
    fn new(kind: CipherKind, subkey: &[u8]) -> CipherVariant {
        debug_assert_eq!(subkey.len(), kind.key_len());

        match kind {
            CipherKind::AES_128_GCM => {
                CipherVariant::Aes128Gcm(Aes128Gcm::new(GenericArray::from_slice(subkey)))
            }
            CipherKind::AES_192_GCM => {
                CipherVariant::Aes192Gcm(Aes192Gcm::new(GenericArray::from_slice(subkey)))
            }
            CipherKind::AES_256_GCM => {
                CipherVariant::Aes256Gcm(Aes256Gcm::new(GenericArray::from_slice(subkey)))
            }
            CipherKind::CHACHA20_POLY1305 => CipherVariant::ChaCha20Poly1305(ChaCha20Poly1305::new(
                GenericArray::from_slice(subkey),
            )),
        }
    }

    fn encrypt(&self, nonce: &[u8], plaintext_in_ciphertext_out: &mut [u8], tag_len: usize) {
        let nonce = GenericArray::from_slice(nonce);
        let (plaintext, out_tag) =
            plaintext_in_ciphertext_out.split_at_mut(plaintext_in_ciphertext_out.len() - tag_len);

        let tag = match *self {
            CipherVariant::Aes128Gcm(ref c) => c.encrypt_in_place_detached(nonce, &[], plaintext),
            CipherVariant::Aes192Gcm(ref c) => c.encrypt_in_place_detached(nonce, &[], plaintext),
            CipherVariant::Aes256Gcm(ref c) => c.encrypt_in_place_detached(nonce, &[], plaintext),
            CipherVariant::ChaCha20Poly1305(ref c) => c.encrypt_in_place_detached(nonce, &[], plaintext),
        }
        .expect("AEAD seal");

        out_tag.copy_from_slice(tag.as_slice());
    }

    fn decrypt(&self, nonce: &[u8], ciphertext_in_plaintext_out: &mut [u8], tag_len: usize) -> bool {
        let nonce = GenericArray::from_slice(nonce);
        let (ciphertext, in_tag) =
            ciphertext_in_plaintext_out.split_at_mut(ciphertext_in_plaintext_out.len() - tag_len);
        let in_tag = GenericArray::from_slice(in_tag);

        match *self {
            CipherVariant::Aes128Gcm(ref c) => c.decrypt_in_place_detached(nonce, &[], ciphertext, in_tag),
            CipherVariant::Aes192Gcm(ref c) => c.decrypt_in_place_detached(nonce, &[], ciphertext, in_tag),
            CipherVariant::Aes256Gcm(ref c) => c.decrypt_in_place_detached(nonce, &[], ciphertext, in_tag),
            CipherVariant::ChaCha20Poly1305(ref c) => {
                c.decrypt_in_place_detached(nonce, &[], ciphertext, in_tag)
            }
        }
        .is_ok()
    }
}

/// One direction of one session
///
/// Holds the AEAD keyed with the salt-derived subkey and the nonce counter,
/// which starts at zero and increments after every seal or open. The nonce
/// is never reused within a (subkey, direction) pair.
pub struct Cipher {
    cipher: CipherVariant,
    kind: CipherKind,
    nonce: [u8; Cipher::NONCE_MAX],
}

impl Cipher {
    const NONCE_MAX: usize = 12;

    /// Create a cipher for one direction of one session
    ///
    /// `key` is the master key; the actual AEAD key is
    /// HKDF-SHA1(key, salt, "ss-subkey").
    pub fn new(kind: CipherKind, key: &[u8], salt: &[u8]) -> Cipher {
        const MAX_KEY_LEN: usize = 32;

        debug_assert_eq!(key.len(), kind.key_len());
        debug_assert_eq!(salt.len(), kind.salt_len());
        debug_assert!(kind.nonce_len() <= Cipher::NONCE_MAX);

        let mut okm = [0u8; MAX_KEY_LEN];
        let subkey = &mut okm[..kind.key_len()];
        hkdf_sha1(key, salt, subkey);

        Cipher {
            cipher: CipherVariant::new(kind, subkey),
            kind,
            nonce: [0u8; Cipher::NONCE_MAX],
        }
    }

    /// AEAD tag overhead, in bytes
    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    fn increase_nonce(&mut self) {
        // little-endian +1, wrapping
        for b in self.nonce[..self.kind.nonce_len()].iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                return;
            }
        }
    }

    /// Seal `data || tag` in place with the current nonce, then increment it
    ///
    /// The trailing `tag_len()` bytes of the buffer are overwritten with the tag.
    pub fn encrypt_packet(&mut self, plaintext_in_ciphertext_out: &mut [u8]) {
        let nonce_len = self.kind.nonce_len();
        let tag_len = self.kind.tag_len();
        self.cipher
            .encrypt(&self.nonce[..nonce_len], plaintext_in_ciphertext_out, tag_len);
        self.increase_nonce();
    }

    /// Open `data || tag` in place with the current nonce, then increment it
    ///
    /// Returns `false` if the tag does not authenticate.
    #[must_use]
    pub fn decrypt_packet(&mut self, ciphertext_in_plaintext_out: &mut [u8]) -> bool {
        let nonce_len = self.kind.nonce_len();
        let tag_len = self.kind.tag_len();
        let ret = self
            .cipher
            .decrypt(&self.nonce[..nonce_len], ciphertext_in_plaintext_out, tag_len);
        self.increase_nonce();
        ret
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self) -> &[u8] {
        &self.nonce[..self.kind.nonce_len()]
    }
}
