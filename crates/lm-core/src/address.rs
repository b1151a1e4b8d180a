//! Unified address model carried through every layer.
//!
//! One value covers TCP, UDP and Unix-socket targets. At least one of
//! host/ip is always set; unix targets keep their filesystem path in
//! `host` and ignore the port.

use bytes::{Buf, BufMut};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
    Unix,
}

impl Network {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "tcp" => Some(Network::Tcp),
            "udp" => Some(Network::Udp),
            "unix" => Some(Network::Unix),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub network: Network,
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl Address {
    pub fn from_host_port(network: Network, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        match host.parse::<IpAddr>() {
            Ok(ip) => Self {
                network,
                host: None,
                ip: Some(ip),
                port,
            },
            Err(_) => Self {
                network,
                host: Some(host),
                ip: None,
                port,
            },
        }
    }

    pub fn from_socket_addr(network: Network, sa: SocketAddr) -> Self {
        Self {
            network,
            host: None,
            ip: Some(sa.ip()),
            port: sa.port(),
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            network: Network::Unix,
            host: Some(path.into()),
            ip: None,
            port: 0,
        }
    }

    /// Parse `host:port`, `ip:port` or a bare unix path (when `network`
    /// is unix).
    pub fn parse(network: Network, s: &str) -> Option<Self> {
        if network == Network::Unix {
            return Some(Self::unix(s));
        }
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Some(Self::from_socket_addr(network, sa));
        }
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::from_host_port(network, host, port))
    }

    /// Parse a `scheme://authority` url such as `tcp://1.2.3.4:443`.
    /// Only tcp and udp schemes are meaningful here (dokodemo targets).
    pub fn parse_url(s: &str) -> Option<Self> {
        let (scheme, rest) = s.split_once("://")?;
        let network = Network::parse(scheme)?;
        Self::parse(network, rest)
    }

    pub fn is_udp(&self) -> bool {
        self.network == Network::Udp
    }

    pub fn is_unix(&self) -> bool {
        self.network == Network::Unix
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.ip.is_none()
    }

    /// Render preferring the hostname, as shown to humans.
    pub fn host_port(&self) -> String {
        if self.is_unix() {
            return self.host.clone().unwrap_or_default();
        }
        match (&self.host, &self.ip) {
            (Some(h), _) => format!("{}:{}", h, self.port),
            (None, Some(ip)) => render_ip_port(*ip, self.port),
            (None, None) => format!(":{}", self.port),
        }
    }

    /// Render preferring the ip, as used for dialing.
    pub fn dial_string(&self) -> String {
        if self.is_unix() {
            return self.host.clone().unwrap_or_default();
        }
        match (&self.ip, &self.host) {
            (Some(ip), _) => render_ip_port(*ip, self.port),
            (None, Some(h)) => format!("{}:{}", h, self.port),
            (None, None) => format!(":{}", self.port),
        }
    }

    pub fn url_string(&self) -> String {
        format!("{}://{}", self.network.as_str(), self.host_port())
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolve the hostname and populate `ip`, so ip-based routing rules
    /// and ip-preferred dialing can apply. No-op for unix targets and
    /// already-resolved addresses.
    pub async fn resolve(&mut self) -> std::io::Result<()> {
        if self.is_unix() || self.ip.is_some() {
            return Ok(());
        }
        let Some(host) = self.host.clone() else {
            return Ok(());
        };
        let mut addrs = tokio::net::lookup_host((host.as_str(), self.port)).await?;
        if let Some(sa) = addrs.next() {
            self.ip = Some(sa.ip());
        }
        Ok(())
    }
}

fn render_ip_port(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_port())
    }
}

/// Routing input: the requested target plus the tag of the ingress that
/// produced it.
#[derive(Debug, Clone, Default)]
pub struct TargetDescription {
    pub addr: Address,
    pub tag: Option<String>,
}

// SOCKS-family address type bytes, shared by socks5/trojan/simplesocks.
pub const ATYP_V4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_V6: u8 = 0x04;

/// Decode an ATYP-prefixed address followed by a be16 port. Returns
/// `None` when the buffer is short or the type byte is unknown; the
/// caller decides whether that is a reject-with-replay.
pub fn read_socks_addr(buf: &mut impl Buf, network: Network) -> Option<Address> {
    if buf.remaining() < 1 {
        return None;
    }
    match buf.get_u8() {
        ATYP_V4 => {
            if buf.remaining() < 6 {
                return None;
            }
            let mut b = [0u8; 4];
            buf.copy_to_slice(&mut b);
            let port = buf.get_u16();
            Some(Address {
                network,
                host: None,
                ip: Some(IpAddr::from(b)),
                port,
            })
        }
        ATYP_DOMAIN => {
            if buf.remaining() < 1 {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len + 2 {
                return None;
            }
            let mut name = vec![0u8; len];
            buf.copy_to_slice(&mut name);
            let port = buf.get_u16();
            let host = String::from_utf8(name).ok()?;
            Some(Address::from_host_port(network, host, port))
        }
        ATYP_V6 => {
            if buf.remaining() < 18 {
                return None;
            }
            let mut b = [0u8; 16];
            buf.copy_to_slice(&mut b);
            let port = buf.get_u16();
            Some(Address {
                network,
                host: None,
                ip: Some(IpAddr::from(b)),
                port,
            })
        }
        _ => None,
    }
}

/// Encode an address in SOCKS ATYP form followed by a be16 port.
pub fn write_socks_addr(buf: &mut impl BufMut, addr: &Address) {
    match (&addr.ip, &addr.host) {
        (Some(IpAddr::V4(v4)), _) => {
            buf.put_u8(ATYP_V4);
            buf.put_slice(&v4.octets());
        }
        (Some(IpAddr::V6(v6)), _) => {
            buf.put_u8(ATYP_V6);
            buf.put_slice(&v6.octets());
        }
        (None, Some(host)) => {
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
        }
        (None, None) => {
            buf.put_u8(ATYP_V4);
            buf.put_slice(&[0, 0, 0, 0]);
        }
    }
    buf.put_u16(addr.port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn parse_prefers_ip_when_literal() {
        let a = Address::parse(Network::Tcp, "1.2.3.4:80").unwrap();
        assert!(a.host.is_none());
        assert_eq!(a.ip.unwrap().to_string(), "1.2.3.4");
        assert_eq!(a.dial_string(), "1.2.3.4:80");

        let b = Address::parse(Network::Tcp, "example.com:443").unwrap();
        assert_eq!(b.host.as_deref(), Some("example.com"));
        assert!(b.ip.is_none());
        assert_eq!(b.host_port(), "example.com:443");
    }

    #[test]
    fn v6_renders_bracketed() {
        let a = Address::parse(Network::Udp, "[::1]:53").unwrap();
        assert_eq!(a.dial_string(), "[::1]:53");
        assert!(a.is_udp());
    }

    #[test]
    fn unix_ignores_port() {
        let a = Address::unix("/tmp/lam.sock");
        assert!(a.is_unix());
        assert_eq!(a.host_port(), "/tmp/lam.sock");
        assert_eq!(a.dial_string(), "/tmp/lam.sock");
    }

    #[test]
    fn url_parse_roundtrip() {
        let a = Address::parse_url("udp://8.8.8.8:53").unwrap();
        assert!(a.is_udp());
        assert_eq!(a.url_string(), "udp://8.8.8.8:53");
    }

    #[test]
    fn socks_addr_roundtrip() {
        for addr in [
            Address::parse(Network::Tcp, "1.2.3.4:80").unwrap(),
            Address::from_host_port(Network::Tcp, "example.com", 443),
            Address::parse(Network::Tcp, "[2001:db8::1]:8080").unwrap(),
        ] {
            let mut buf = BytesMut::new();
            write_socks_addr(&mut buf, &addr);
            let mut rd = buf.freeze();
            let got = read_socks_addr(&mut rd, Network::Tcp).unwrap();
            assert_eq!(got, addr);
            assert_eq!(rd.remaining(), 0);
        }
    }

    #[test]
    fn socks_addr_short_buffer_is_none() {
        let mut short = bytes::Bytes::from_static(&[ATYP_V4, 1, 2]);
        assert!(read_socks_addr(&mut short, Network::Tcp).is_none());
        let mut bad = bytes::Bytes::from_static(&[0x09, 0, 0]);
        assert!(read_socks_addr(&mut bad, Network::Tcp).is_none());
    }
}
