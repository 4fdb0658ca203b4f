//! Stream wrappers for the two ends of a proxied TCP connection

pub use self::{client::ProxyClientStream, server::ProxyServerStream};

pub mod client;
pub mod server;
