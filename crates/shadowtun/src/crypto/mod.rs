//! Cipher profiles for the shadowsocks AEAD protocol
//!
//! Only AEAD ciphers are supported. Each profile pins the master key
//! length, the per-session salt length and the AEAD tag overhead.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

pub use self::{
    cipher::Cipher,
    kdf::{hkdf_sha1, openssl_bytes_to_key},
};

mod cipher;
mod kdf;

/// Supported AEAD cipher kinds
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[allow(non_camel_case_types)]
pub enum CipherKind {
    AES_128_GCM,
    AES_192_GCM,
    AES_256_GCM,
    CHACHA20_POLY1305,
}

impl CipherKind {
    /// Master key length, in bytes
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::AES_128_GCM => 16,
            CipherKind::AES_192_GCM => 24,
            CipherKind::AES_256_GCM => 32,
            CipherKind::CHACHA20_POLY1305 => 32,
        }
    }

    /// Per-session salt length, in bytes
    ///
    /// Follows the key length for every supported profile.
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    /// AEAD authentication tag length, in bytes
    pub fn tag_len(self) -> usize {
        16
    }

    /// AEAD nonce length, in bytes
    pub fn nonce_len(self) -> usize {
        12
    }

    /// Canonical names of every supported cipher, for `--list-ciphers`
    pub fn supported() -> &'static [&'static str] {
        &[
            "AEAD_AES_128_GCM",
            "AEAD_AES_192_GCM",
            "AEAD_AES_256_GCM",
            "AEAD_CHACHA20_POLY1305",
        ]
    }
}

impl Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CipherKind::AES_128_GCM => f.write_str("AEAD_AES_128_GCM"),
            CipherKind::AES_192_GCM => f.write_str("AEAD_AES_192_GCM"),
            CipherKind::AES_256_GCM => f.write_str("AEAD_AES_256_GCM"),
            CipherKind::CHACHA20_POLY1305 => f.write_str("AEAD_CHACHA20_POLY1305"),
        }
    }
}

/// Error while parsing `CipherKind` from string
#[derive(Debug, Clone)]
pub struct ParseCipherKindError;

impl Display for ParseCipherKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unrecognized cipher")
    }
}

impl std::error::Error for ParseCipherKindError {}

impl FromStr for CipherKind {
    type Err = ParseCipherKindError;

    fn from_str(s: &str) -> Result<CipherKind, ParseCipherKindError> {
        match s {
            "AEAD_AES_128_GCM" | "aes-128-gcm" => Ok(CipherKind::AES_128_GCM),
            "AEAD_AES_192_GCM" | "aes-192-gcm" => Ok(CipherKind::AES_192_GCM),
            "AEAD_AES_256_GCM" | "aes-256-gcm" => Ok(CipherKind::AES_256_GCM),
            "AEAD_CHACHA20_POLY1305" | "chacha20-ietf-poly1305" | "chacha20-poly1305" => {
                Ok(CipherKind::CHACHA20_POLY1305)
            }
            _ => Err(ParseCipherKindError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_aliases() {
        let k = "aes-256-gcm".parse::<CipherKind>().unwrap();
        assert_eq!(k, CipherKind::AES_256_GCM);
        assert_eq!(k.to_string().parse::<CipherKind>().unwrap(), k);

        assert_eq!(
            "chacha20-ietf-poly1305".parse::<CipherKind>().unwrap(),
            CipherKind::CHACHA20_POLY1305
        );

        assert!("rc4-md5".parse::<CipherKind>().is_err());
    }

    #[test]
    fn profile_constants() {
        for name in CipherKind::supported() {
            let kind = name.parse::<CipherKind>().unwrap();
            assert_eq!(kind.salt_len(), kind.key_len());
            assert_eq!(kind.tag_len(), 16);
            assert_eq!(kind.nonce_len(), 12);
        }
    }
}
