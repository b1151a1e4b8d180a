//! lm-config: TOML-shaped configuration for laminar.
//!
//! A config file holds `[[listen]]` and `[[dial]]` entries sharing a
//! common shape, optional `[[route]]` rules, `[[fallback]]` overrides and
//! an `[app]` table. Unknown advanced-layer options travel in `extra`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Fields shared by listen and dial entries.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CommonConf {
    pub tag: Option<String>,
    /// Proxy-layer protocol. A trailing `s` on a known protocol name
    /// (`trojans`) implies TLS, inherited from the minimal-config
    /// convention; the explicit `tls` flag is clearer.
    pub protocol: String,
    /// Credential: uuid for vless, any password for trojan.
    pub uuid: String,
    /// Hostname or, for unix networks, the socket path.
    pub host: String,
    /// Optional ip; with both host and ip set, the ip dials and the host
    /// goes into SNI/headers (CDN-style).
    pub ip: String,
    pub port: u16,
    pub version: u32,
    /// Transport network: tcp (default), udp or unix.
    pub network: String,
    pub sockopt: Option<SockOptConf>,
    pub tls: bool,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    pub alpn: Vec<String>,
    /// Fixed HTTP header disguise.
    pub header: Option<HeaderConf>,
    /// Advanced layer: "ws", "grpc" or "quic".
    #[serde(rename = "advancedLayer")]
    pub advanced_layer: String,
    /// 0-rtt / early data for carriers that support it.
    pub early: bool,
    /// ws path or grpc service name.
    pub path: String,
    /// Free-form extras for layer-specific knobs
    /// (e.g. quic: `maxStreamsInOneConn`, `congestion_control = "hy"`,
    /// `mbps`, `hy_manual`).
    pub extra: Option<toml::value::Table>,
}

impl CommonConf {
    /// Normalize the `s`-suffix convention: `trojans` → (`trojan`, tls).
    pub fn effective_protocol(&self) -> (&str, bool) {
        if self.tls {
            return (self.protocol.as_str(), true);
        }
        if let Some(stem) = self.protocol.strip_suffix('s') {
            if KNOWN_PROTOCOLS.contains(&stem) {
                return (stem, true);
            }
        }
        (self.protocol.as_str(), false)
    }

    /// Listen/dial address string, ip preferred.
    pub fn addr_str(&self) -> String {
        if self.network == "unix" {
            return self.host.clone();
        }
        if !self.ip.is_empty() {
            format!("{}:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

const KNOWN_PROTOCOLS: &[&str] = &[
    "socks5",
    "http",
    "trojan",
    "vless",
    "simplesocks",
    "dokodemo",
    "direct",
    "reject",
];

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SockOptConf {
    pub reuse_port: bool,
    pub bind_interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HeaderConf {
    pub request: HeaderBlockConf,
    pub response: HeaderBlockConf,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HeaderBlockConf {
    pub first_line: String,
    pub headers: Vec<(String, String)>,
}

/// A listener entry.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ListenConf {
    #[serde(flatten)]
    pub common: CommonConf,
    /// Default fallback: `"host:port"`, a bare port number, or a unix
    /// path.
    pub fallback: Option<toml::Value>,
    pub cert: String,
    pub key: String,
    /// Traffic from this listener is never routed; it always goes to the
    /// default dial.
    pub noroute: bool,
    /// Dokodemo fixed target, `tcp://host:port` or `udp://host:port`.
    pub target: String,
}

/// A dial entry.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DialConf {
    #[serde(flatten)]
    pub common: CommonConf,
    /// Accepted for config compatibility; fingerprint-mimicking TLS is
    /// not wired in.
    pub utls: bool,
    /// Full-cone UDP; keeps sockets open per remote, so opt-in.
    pub fullcone: bool,
    /// Inner mux for protocols with a MUX command.
    #[serde(rename = "use_mux")]
    pub use_mux: bool,
    /// Lazy-TLS capability on this dial.
    pub tls_lazy: bool,
}

/// Routing rule entry.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuleConf {
    #[serde(rename = "toTag")]
    pub to_tag: String,
    pub domain: Vec<String>,
    pub ip: Vec<String>,
    pub network: Vec<String>,
    #[serde(rename = "fromTag")]
    pub from_tag: Vec<String>,
}

/// Path-keyed fallback overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConf {
    pub path: String,
    pub dest: toml::Value,
    /// PROXY protocol version to emit: 0, 1 or 2.
    pub xver: u8,
}

impl Default for FallbackConf {
    fn default() -> Self {
        Self {
            path: String::default(),
            dest: toml::Value::String(String::new()),
            xver: u8::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConf {
    /// Enables the admin API (together with the CLI switch).
    pub admin_pass: String,
    pub log_level: String,
    pub log_format: String,
    /// Global default fallback address applied to listeners without one.
    pub default_fallback: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StandardConf {
    pub app: Option<AppConf>,
    pub listen: Vec<ListenConf>,
    pub dial: Vec<DialConf>,
    pub route: Vec<RuleConf>,
    pub fallback: Vec<FallbackConf>,
}

/// Load and validate a config file.
pub fn load_file(path: impl AsRef<Path>) -> Result<StandardConf> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read config {}", path.as_ref().display()))?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<StandardConf> {
    let conf: StandardConf = toml::from_str(text).context("parse config")?;
    validate(&conf)?;
    Ok(conf)
}

fn validate(conf: &StandardConf) -> Result<()> {
    if conf.listen.is_empty() {
        bail!("config has no listen entries");
    }
    if conf.dial.is_empty() {
        bail!("config has no dial entries");
    }
    let mut tags = HashSet::new();
    for l in &conf.listen {
        let (proto, _) = l.common.effective_protocol();
        if !KNOWN_PROTOCOLS.contains(&proto) {
            bail!("unknown listen protocol: {}", l.common.protocol);
        }
        if l.common.network != "unix"
            && !l.common.network.is_empty()
            && !matches!(l.common.network.as_str(), "tcp" | "udp")
        {
            bail!("bad network {:?}", l.common.network);
        }
        if l.common.network != "unix" && l.common.port == 0 {
            bail!("listen entry {:?} needs a port", l.common.tag);
        }
        if proto == "dokodemo" && l.target.is_empty() {
            bail!("dokodemo listener needs a target");
        }
    }
    for d in &conf.dial {
        let (proto, _) = d.common.effective_protocol();
        if !KNOWN_PROTOCOLS.contains(&proto) {
            bail!("unknown dial protocol: {}", d.common.protocol);
        }
        if let Some(tag) = &d.common.tag {
            if !tags.insert(tag.clone()) {
                bail!("duplicate dial tag {tag}");
            }
        }
    }
    for r in &conf.route {
        if r.to_tag.is_empty() {
            bail!("route rule without toTag");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[app]
admin_pass = "secret"

[[listen]]
protocol = "socks5"
ip = "127.0.0.1"
port = 1080
tag = "local"

[[listen]]
protocol = "trojan"
uuid = "hunter2"
ip = "0.0.0.0"
port = 443
tls = true
cert = "cert.pem"
key = "key.pem"
fallback = "127.0.0.1:8080"
advancedLayer = "ws"
path = "/tunnel"

[[dial]]
protocol = "vless"
uuid = "2f8bb5b0-bd23-4316-9cb4-8a3a87a5b1a2"
host = "proxy.example.com"
port = 443
tls = true
tag = "main"
use_mux = true

[[dial]]
protocol = "direct"
tag = "direct"
fullcone = true

[[route]]
toTag = "direct"
domain = ["cn"]
ip = ["10.0.0.0/8"]
"#;

    #[test]
    fn parse_sample() {
        let conf = load_str(SAMPLE).unwrap();
        assert_eq!(conf.listen.len(), 2);
        assert_eq!(conf.dial.len(), 2);
        assert_eq!(conf.app.as_ref().unwrap().admin_pass, "secret");

        let trojan = &conf.listen[1];
        assert_eq!(trojan.common.effective_protocol(), ("trojan", true));
        assert_eq!(trojan.common.advanced_layer, "ws");
        assert_eq!(trojan.fallback.as_ref().unwrap().as_str(), Some("127.0.0.1:8080"));

        let vless = &conf.dial[0];
        assert!(vless.use_mux);
        assert_eq!(vless.common.addr_str(), "proxy.example.com:443");
    }

    #[test]
    fn s_suffix_implies_tls() {
        let conf = CommonConf {
            protocol: "trojans".into(),
            ..Default::default()
        };
        assert_eq!(conf.effective_protocol(), ("trojan", true));

        let plain = CommonConf {
            protocol: "socks5".into(),
            ..Default::default()
        };
        assert_eq!(plain.effective_protocol(), ("socks5", false));
    }

    #[test]
    fn rejects_unknown_protocol() {
        let text = r#"
[[listen]]
protocol = "wat"
port = 1
[[dial]]
protocol = "direct"
"#;
        assert!(load_str(text).is_err());
    }

    #[test]
    fn quic_extra_table_roundtrips() {
        let text = r#"
[[listen]]
protocol = "trojan"
uuid = "p"
port = 443
advancedLayer = "quic"
cert = "c.pem"
key = "k.pem"

[listen.extra]
maxStreamsInOneConn = 4
congestion_control = "hy"
mbps = 100
hy_manual = false

[[dial]]
protocol = "direct"
"#;
        let conf = load_str(text).unwrap();
        let extra = conf.listen[0].common.extra.as_ref().unwrap();
        assert_eq!(extra.get("maxStreamsInOneConn").unwrap().as_integer(), Some(4));
        assert_eq!(extra.get("congestion_control").unwrap().as_str(), Some("hy"));
    }
}
