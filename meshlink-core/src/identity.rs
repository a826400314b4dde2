//! Peer identity: the remote network address, one connection per identity.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Key of the peer registry. Ports are deliberately not part of the identity:
/// an accepted socket arrives from an ephemeral port, while the same peer is
/// dialed on its advertised listening port.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerIdentity(IpAddr);

impl PeerIdentity {
    pub fn new(addr: IpAddr) -> Self {
        PeerIdentity(addr)
    }

    pub fn addr(&self) -> IpAddr {
        self.0
    }

    /// Socket address for dialing this peer on `port`.
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.0, port)
    }
}

impl From<IpAddr> for PeerIdentity {
    fn from(addr: IpAddr) -> Self {
        PeerIdentity(addr)
    }
}

impl From<SocketAddr> for PeerIdentity {
    fn from(addr: SocketAddr) -> Self {
        PeerIdentity(addr.ip())
    }
}

impl FromStr for PeerIdentity {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpAddr>().map(PeerIdentity)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addresses_with_same_ip_share_identity() {
        let inbound: SocketAddr = "10.0.0.5:53211".parse().unwrap();
        let advertised: SocketAddr = "10.0.0.5:5000".parse().unwrap();
        assert_eq!(PeerIdentity::from(inbound), PeerIdentity::from(advertised));
        assert_eq!(PeerIdentity::from(inbound).socket_addr(5000), advertised);
    }

    #[test]
    fn parses_and_displays_plain_address() {
        let id: PeerIdentity = "10.0.0.5".parse().unwrap();
        assert_eq!(id.to_string(), "10.0.0.5");
        assert!("10.0.0.5:80".parse::<PeerIdentity>().is_err());
    }
}
