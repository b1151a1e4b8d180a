//! Rule evaluation over `(target, ingress-tag)` → outbound tag, plus the
//! shared routing environment handed to every pipeline.

use crate::address::{Address, TargetDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Reserved tag selecting the process-wide direct client.
pub const DIRECT_TAG: &str = "direct";

/// Pluggable resolver used before rule evaluation so ip rules can apply
/// to named targets.
#[async_trait]
pub trait DnsMachine: Send + Sync {
    async fn query(&self, name: &str) -> Option<IpAddr>;
}

/// System resolver backed by tokio's lookup.
pub struct SystemDns;

#[async_trait]
impl DnsMachine for SystemDns {
    async fn query(&self, name: &str) -> Option<IpAddr> {
        tokio::net::lookup_host((name, 0))
            .await
            .ok()?
            .next()
            .map(|sa| sa.ip())
    }
}

/// One routing rule; all configured matchers must hold for the rule to
/// fire (first matching rule wins).
#[derive(Debug, Clone, Default)]
pub struct RouteRule {
    pub domain_suffix: Vec<String>,
    pub ip_cidr: Vec<IpCidr>,
    pub networks: Vec<crate::address::Network>,
    pub in_tags: Vec<String>,
    pub out_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    pub ip: IpAddr,
    pub prefix: u8,
}

impl IpCidr {
    pub fn parse(s: &str) -> Option<Self> {
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, p)) => (ip.parse().ok()?, p.parse().ok()?),
            None => {
                let ip: IpAddr = s.parse().ok()?;
                let full = if ip.is_ipv4() { 32 } else { 128 };
                (ip, full)
            }
        };
        Some(Self { ip, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        fn to_bits(ip: IpAddr) -> (u128, u32) {
            match ip {
                IpAddr::V4(v4) => (u32::from(v4) as u128, 32),
                IpAddr::V6(v6) => (u128::from(v6), 128),
            }
        }
        let (net, net_len) = to_bits(self.ip);
        let (probe, probe_len) = to_bits(ip);
        if net_len != probe_len {
            return false;
        }
        let prefix = self.prefix.min(net_len as u8) as u32;
        if prefix == 0 {
            return true;
        }
        let shift = net_len - prefix;
        (net >> shift) == (probe >> shift)
    }
}

impl RouteRule {
    fn matches(&self, desc: &TargetDescription) -> bool {
        if !self.in_tags.is_empty() {
            match &desc.tag {
                Some(tag) if self.in_tags.iter().any(|t| t == tag) => {}
                _ => return false,
            }
        }
        if !self.networks.is_empty() && !self.networks.contains(&desc.addr.network) {
            return false;
        }
        if !self.domain_suffix.is_empty() {
            let Some(host) = &desc.addr.host else {
                return false;
            };
            if !self
                .domain_suffix
                .iter()
                .any(|s| host == s || host.ends_with(&format!(".{s}")) || host.ends_with(s.as_str()))
            {
                return false;
            }
        }
        if !self.ip_cidr.is_empty() {
            let Some(ip) = desc.addr.ip else {
                return false;
            };
            if !self.ip_cidr.iter().any(|c| c.contains(ip)) {
                return false;
            }
        }
        true
    }
}

/// Ordered rule list. A miss returns `None` and the caller falls through
/// to the default client, never an error.
#[derive(Debug, Default)]
pub struct RoutePolicy {
    pub rules: Vec<RouteRule>,
}

impl RoutePolicy {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn out_tag(&self, desc: &TargetDescription) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.matches(desc))
            .map(|r| r.out_tag.as_str())
    }
}

/// Shared, immutable-after-bootstrap routing environment.
pub struct RoutingEnv<C: ?Sized> {
    pub policy: Option<RoutePolicy>,
    pub clients_by_tag: HashMap<String, Arc<C>>,
    pub dns: Option<Arc<dyn DnsMachine>>,
    /// The client selected by the reserved `direct` tag.
    pub direct: Option<Arc<C>>,
}

impl<C: ?Sized> RoutingEnv<C> {
    pub fn new() -> Self {
        Self {
            policy: None,
            clients_by_tag: HashMap::new(),
            dns: None,
            direct: None,
        }
    }

    /// Resolve the target name when ip rules might need it (named target,
    /// no ip yet, dns configured, not unix).
    pub async fn maybe_resolve(&self, addr: &mut Address) {
        let Some(dns) = &self.dns else { return };
        if addr.is_unix() || addr.ip.is_some() {
            return;
        }
        let Some(host) = addr.host.clone() else {
            return;
        };
        debug!(domain = %host, "dns querying");
        if let Some(ip) = dns.query(&host).await {
            debug!(domain = %host, ip = %ip, "dns result");
            addr.ip = Some(ip);
        }
    }
}

impl<C: ?Sized> Default for RoutingEnv<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;

    fn desc(addr: &str, tag: Option<&str>) -> TargetDescription {
        TargetDescription {
            addr: Address::parse(Network::Tcp, addr)
                .or_else(|| Some(Address::from_host_port(Network::Tcp, addr, 0)))
                .unwrap(),
            tag: tag.map(String::from),
        }
    }

    #[test]
    fn cidr_contains() {
        let c = IpCidr::parse("10.0.0.0/8").unwrap();
        assert!(c.contains("10.1.2.3".parse().unwrap()));
        assert!(!c.contains("11.0.0.1".parse().unwrap()));
        let single = IpCidr::parse("192.168.1.1").unwrap();
        assert!(single.contains("192.168.1.1".parse().unwrap()));
        assert!(!single.contains("192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn first_match_wins_and_miss_falls_through() {
        let policy = RoutePolicy::new(vec![
            RouteRule {
                domain_suffix: vec!["example.com".into()],
                out_tag: "proxy-a".into(),
                ..Default::default()
            },
            RouteRule {
                ip_cidr: vec![IpCidr::parse("127.0.0.0/8").unwrap()],
                out_tag: DIRECT_TAG.into(),
                ..Default::default()
            },
        ]);

        assert_eq!(
            policy.out_tag(&desc("www.example.com:443", None)),
            Some("proxy-a")
        );
        assert_eq!(policy.out_tag(&desc("127.0.0.1:80", None)), Some(DIRECT_TAG));
        assert_eq!(policy.out_tag(&desc("9.9.9.9:53", None)), None);
    }

    #[test]
    fn tag_rule_requires_matching_ingress() {
        let policy = RoutePolicy::new(vec![RouteRule {
            in_tags: vec!["edge".into()],
            out_tag: "tunnel".into(),
            ..Default::default()
        }]);
        assert_eq!(policy.out_tag(&desc("a.b:1", Some("edge"))), Some("tunnel"));
        assert_eq!(policy.out_tag(&desc("a.b:1", Some("other"))), None);
        assert_eq!(policy.out_tag(&desc("a.b:1", None)), None);
    }

    #[test]
    fn network_rule() {
        let policy = RoutePolicy::new(vec![RouteRule {
            networks: vec![Network::Udp],
            out_tag: "udp-out".into(),
            ..Default::default()
        }]);
        let mut d = desc("1.2.3.4:53", None);
        d.addr.network = Network::Udp;
        assert_eq!(policy.out_tag(&d), Some("udp-out"));
    }
}
