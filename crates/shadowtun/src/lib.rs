//! Shadowsocks AEAD protocol core
//!
//! The building blocks of a shadowsocks v2 proxy pair: the destination
//! address codec shared by SOCKS5 and the tunnel header, the AEAD chunked
//! stream framing with cipher discovery for multi-key servers, per-datagram
//! UDP sealing, and the bidirectional relay engine.

pub use self::{
    config::{ServerAddr, ServerConfig},
    crypto::CipherKind,
    relay::tcprelay::{discover_cipher, ProxyClientStream, ProxyServerStream},
};

pub mod config;
pub mod crypto;
pub mod net;
pub mod relay;
