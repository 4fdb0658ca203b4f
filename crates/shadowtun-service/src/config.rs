//! Service configuration

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::Duration,
};

use shadowtun::{relay::socks5::Address, ServerAddr};

/// Default UDP NAT session idle expiry
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(120);

/// One static tunnel, `local-listen = remote-target`
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Local listen address
    pub local: ServerAddr,
    /// Target the tunnel forwards to
    pub remote: Address,
}

impl FromStr for TunnelConfig {
    type Err = PairListError;

    fn from_str(s: &str) -> Result<TunnelConfig, PairListError> {
        let mut sp = s.splitn(2, '=');
        match (sp.next(), sp.next()) {
            (Some(local), Some(remote)) => {
                let local = local.parse::<ServerAddr>().map_err(|_| PairListError(s.to_owned()))?;
                let remote = remote.parse::<Address>().map_err(|_| PairListError(s.to_owned()))?;
                Ok(TunnelConfig { local, remote })
            }
            _ => Err(PairListError(s.to_owned())),
        }
    }
}

/// Parse a `laddr1=raddr1,laddr2=raddr2,...` flag value
pub fn parse_pair_list(s: &str) -> Result<Vec<TunnelConfig>, PairListError> {
    s.split(',').map(str::trim).map(TunnelConfig::from_str).collect()
}

/// Error for malformed tunnel pair lists
#[derive(Debug, Clone)]
pub struct PairListError(pub String);

impl Display for PairListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid tunnel pair {:?}, expected laddr=raddr", self.0)
    }
}

impl std::error::Error for PairListError {}

/// Everything the local (client-side) instance serves
#[derive(Clone, Debug, Default)]
pub struct LocalConfig {
    /// SOCKS5 listen address
    pub socks: Option<ServerAddr>,
    /// Static TCP tunnels
    pub tcp_tunnels: Vec<TunnelConfig>,
    /// Static UDP tunnels
    pub udp_tunnels: Vec<TunnelConfig>,
    /// Transparent redirect listen address (IPv4)
    pub redir: Option<ServerAddr>,
    /// Transparent redirect listen address (IPv6)
    pub redir6: Option<ServerAddr>,
}

impl LocalConfig {
    /// True if no service is enabled at all
    pub fn is_empty(&self) -> bool {
        self.socks.is_none()
            && self.tcp_tunnels.is_empty()
            && self.udp_tunnels.is_empty()
            && self.redir.is_none()
            && self.redir6.is_none()
    }
}
