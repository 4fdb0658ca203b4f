//! TCP relay: AEAD stream framing and the streams built on it

pub use self::{
    discover::{discover_cipher, ReplayStream},
    proxy_stream::{ProxyClientStream, ProxyServerStream},
};

pub mod aead;
pub mod crypto_io;
pub mod discover;
pub mod proxy_stream;
pub mod utils;
