//! Turn a validated config into running listeners: build every dial
//! descriptor, the routing environment, then one pipeline per listen
//! entry.

use anyhow::{anyhow, Context, Result};
use lm_config::{CommonConf, DialConf, ListenConf, StandardConf};
use lm_core::fallback::FallbackTable;
use lm_core::pipeline::{AdvClient, AdvServer, Client, Server, TlsOut};
use lm_core::router::{IpCidr, RoutePolicy, RouteRule, RoutingEnv, SystemDns};
use lm_core::{Address, Network};
use lm_transport::header::{HeaderBlock, HeaderPreset};
use lm_transport::quic;
use lm_transport::tls::{self, TlsClientParams};
use lm_transport::websocket::{WsClient, WsClientConfig, WsServer, WsServerConfig};
use lm_transport::{grpc, SockOpt, TcpDialer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct Runtime {
    pub handles: Vec<lm_core::ListenerHandle>,
    clients: Vec<Arc<Client>>,
}

impl Runtime {
    /// Stop listeners and close pooled sessions (QUIC closes with error
    /// code 0).
    pub async fn shutdown(self) {
        for h in &self.handles {
            h.abort();
        }
        for c in &self.clients {
            if let Some(AdvClient::Quic(q)) = &c.adv {
                q.close_all().await;
            }
            if let Some(pool) = &c.mux_pool {
                pool.close().await;
            }
        }
    }
}

pub async fn start(conf: &StandardConf) -> Result<Runtime> {
    let mut clients = Vec::new();
    let mut clients_by_tag: HashMap<String, Arc<Client>> = HashMap::new();
    for d in &conf.dial {
        let client = Arc::new(build_client(d).context("build dial entry")?);
        if let Some(tag) = &client.tag {
            clients_by_tag.insert(tag.clone(), client.clone());
        }
        clients.push(client);
    }
    let default_client = clients
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no dial entries"))?;

    let direct_client = clients
        .iter()
        .find(|c| c.proxy.name() == "direct")
        .cloned()
        .unwrap_or_else(|| {
            Arc::new(
                build_client(&DialConf {
                    common: CommonConf {
                        protocol: "direct".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .expect("direct client builds"),
            )
        });

    let env = if conf.route.is_empty() {
        None
    } else {
        let rules = conf
            .route
            .iter()
            .map(build_rule)
            .collect::<Result<Vec<_>>>()?;
        let mut env = RoutingEnv::new();
        env.policy = Some(RoutePolicy::new(rules));
        env.clients_by_tag = clients_by_tag;
        env.dns = Some(Arc::new(SystemDns));
        env.direct = Some(direct_client);
        Some(Arc::new(env))
    };

    let mut handles = Vec::new();
    for l in &conf.listen {
        let server = Arc::new(build_server(l, conf).context("build listen entry")?);
        info!(protocol = %server.full_name(), addr = %server.addr, "starting listener");
        let handle =
            lm_core::listen_server(server, default_client.clone(), env.clone()).await?;
        handles.push(handle);
    }

    Ok(Runtime { handles, clients })
}

fn network_of(conf: &CommonConf) -> Result<Network> {
    Network::parse(&conf.network).ok_or_else(|| anyhow!("bad network {:?}", conf.network))
}

fn sockopt_of(conf: &CommonConf) -> SockOpt {
    conf.sockopt
        .as_ref()
        .map(|s| SockOpt {
            reuse_port: s.reuse_port,
            bind_interface: s.bind_interface.clone(),
        })
        .unwrap_or_default()
}

fn header_of(conf: &CommonConf) -> Option<HeaderPreset> {
    conf.header.as_ref().map(|h| HeaderPreset {
        request: HeaderBlock {
            first_line: h.request.first_line.clone(),
            headers: h.request.headers.clone(),
        },
        response: HeaderBlock {
            first_line: h.response.first_line.clone(),
            headers: h.response.headers.clone(),
        },
    })
}

fn build_client(d: &DialConf) -> Result<Client> {
    let (protocol, use_tls) = d.common.effective_protocol();
    let network = network_of(&d.common)?;
    let proxy = lm_adapters::new_client(protocol, &d.common.uuid, d.use_mux, d.fullcone)?;

    let addr = if protocol == "direct" || protocol == "reject" {
        None
    } else {
        Some(
            Address::parse(network, &d.common.addr_str())
                .ok_or_else(|| anyhow!("bad dial address {:?}", d.common.addr_str()))?,
        )
    };

    let sni = if !d.common.host.is_empty() {
        d.common.host.clone()
    } else {
        d.common.ip.clone()
    };
    let tls = if use_tls && d.common.advanced_layer != "quic" {
        Some(TlsOut {
            config: tls::client_config(&TlsClientParams {
                server_name: Some(sni.clone()),
                alpn: d.common.alpn.clone(),
                insecure: d.common.insecure,
            }),
            server_name: sni.clone(),
        })
    } else {
        None
    };

    let adv = match d.common.advanced_layer.as_str() {
        "" => None,
        "ws" => Some(AdvClient::Ws(WsClient::new(
            WsClientConfig {
                path: if d.common.path.is_empty() {
                    "/".into()
                } else {
                    d.common.path.clone()
                },
                host: d.common.host.clone(),
                headers: d
                    .common
                    .header
                    .as_ref()
                    .map(|h| h.request.headers.clone())
                    .unwrap_or_default(),
                early_data: d.common.early,
            },
            Box::new(TcpDialer),
        ))),
        "grpc" => Some(AdvClient::Grpc(grpc::GrpcClient::new(
            d.common.path.clone(),
            d.common.addr_str(),
        ))),
        "quic" => {
            let (congestion, _) = d
                .common
                .extra
                .as_ref()
                .map(|e| quic::congestion_from_extra(e))
                .unwrap_or_default();
            Some(AdvClient::Quic(
                quic::QuicClient::new(quic::QuicClientConfig {
                    server_addr: d.common.addr_str(),
                    server_name: sni,
                    alpn: d.common.alpn.clone(),
                    insecure: d.common.insecure,
                    early: d.common.early,
                    congestion,
                })
                .map_err(|e| anyhow!("quic client: {e}"))?,
            ))
        }
        other => anyhow::bail!("unknown advanced layer {other}"),
    };

    let has_mux = proxy.inner_mux_kind() == 2;
    Ok(Client {
        tag: d.common.tag.clone(),
        addr,
        network,
        sockopt: sockopt_of(&d.common),
        inner_mux_client: if has_mux {
            Some(lm_adapters::new_client("simplesocks", "", false, false)?)
        } else {
            None
        },
        mux_pool: if has_mux {
            Some(lm_transport::multiplex::MuxClientPool::new())
        } else {
            None
        },
        proxy,
        tls,
        tls_lazy: d.tls_lazy,
        header: header_of(&d.common),
        adv,
    })
}

fn build_server(l: &ListenConf, conf: &StandardConf) -> Result<Server> {
    let (protocol, use_tls) = l.common.effective_protocol();
    let network = network_of(&l.common)?;
    let target = if l.target.is_empty() {
        None
    } else {
        Some(
            Address::parse_url(&l.target)
                .ok_or_else(|| anyhow!("bad dokodemo target {:?}", l.target))?,
        )
    };
    let proxy = lm_adapters::new_server(protocol, &l.common.uuid, target)?;

    let addr = Address::parse(network, &l.common.addr_str())
        .ok_or_else(|| anyhow!("bad listen address {:?}", l.common.addr_str()))?;

    let tls = if use_tls && l.common.advanced_layer != "quic" {
        Some(
            tls::server_acceptor(&l.cert, &l.key, &l.common.alpn)
                .map_err(|e| anyhow!("listen tls: {e}"))?,
        )
    } else {
        None
    };

    let adv = match l.common.advanced_layer.as_str() {
        "" => None,
        "ws" => Some(AdvServer::Ws(WsServer::new(WsServerConfig {
            path: if l.common.path.is_empty() {
                "/".into()
            } else {
                l.common.path.clone()
            },
            required_headers: l
                .common
                .header
                .as_ref()
                .map(|h| h.request.headers.clone())
                .unwrap_or_default(),
            accept_early_data: l.common.early,
        }))),
        "grpc" => Some(AdvServer::Grpc(grpc::GrpcServer::new(
            grpc::GrpcServerConfig {
                service_name: l.common.path.clone(),
                required_headers: l
                    .common
                    .header
                    .as_ref()
                    .map(|h| h.request.headers.clone())
                    .unwrap_or_default(),
                fallback_to_h1: false,
            },
        ))),
        "quic" => {
            let (congestion, max_streams) = l
                .common
                .extra
                .as_ref()
                .map(|e| quic::congestion_from_extra(e))
                .unwrap_or_default();
            let listen = l
                .common
                .addr_str()
                .parse()
                .map_err(|e| anyhow!("quic listen addr: {e}"))?;
            Some(AdvServer::Quic(quic::QuicServer::new(
                quic::QuicServerConfig {
                    listen,
                    cert_path: l.cert.clone(),
                    key_path: l.key.clone(),
                    alpn: l.common.alpn.clone(),
                    max_streams_per_conn: max_streams
                        .unwrap_or(quic::SERVER_MAX_STREAMS_PER_CONN),
                    congestion,
                },
            )))
        }
        other => anyhow::bail!("unknown advanced layer {other}"),
    };

    // Lazy TLS applies only to credential-validating protocols under our
    // own TLS.
    let tls_lazy = tls.is_some() && matches!(protocol, "trojan" | "vless");

    Ok(Server {
        tag: l.common.tag.clone(),
        addr,
        sockopt: sockopt_of(&l.common),
        inner_mux_server: proxy
            .inner_mux_protocol()
            .map(|p| lm_adapters::new_server(p, "", None))
            .transpose()?,
        proxy,
        tls,
        tls_lazy,
        header: header_of(&l.common),
        adv,
        fallback: build_fallback_table(l, conf)?,
        no_route: l.noroute,
    })
}

fn build_fallback_table(l: &ListenConf, conf: &StandardConf) -> Result<FallbackTable> {
    let mut table = FallbackTable::default();
    if let Some(dest) = &l.fallback {
        let addr = parse_fallback_dest(dest)
            .ok_or_else(|| anyhow!("bad fallback dest {dest:?}"))?;
        table = FallbackTable::with_default(addr, 0);
    } else if let Some(app) = &conf.app {
        if !app.default_fallback.is_empty() {
            let addr = Address::parse(Network::Tcp, &app.default_fallback)
                .ok_or_else(|| anyhow!("bad default_fallback"))?;
            table = FallbackTable::with_default(addr, 0);
        }
    }
    for fb in &conf.fallback {
        let addr = parse_fallback_dest(&fb.dest)
            .ok_or_else(|| anyhow!("bad fallback dest {:?}", fb.dest))?;
        if fb.path.is_empty() {
            table.default = Some(lm_core::fallback::FallbackEntry {
                target: addr,
                xver: fb.xver,
            });
        } else {
            table.insert_path(fb.path.clone(), addr, fb.xver);
        }
    }
    Ok(table)
}

/// Fallback destinations come in three spellings: a bare port, a
/// `host:port` string, or a unix socket path.
fn parse_fallback_dest(v: &toml::Value) -> Option<Address> {
    match v {
        toml::Value::Integer(port) => Some(Address::parse(
            Network::Tcp,
            &format!("127.0.0.1:{port}"),
        )?),
        toml::Value::String(s) if s.contains(':') => Address::parse(Network::Tcp, s),
        toml::Value::String(s) => Some(Address::unix(s)),
        _ => None,
    }
}

fn build_rule(r: &lm_config::RuleConf) -> Result<RouteRule> {
    let ip_cidr = r
        .ip
        .iter()
        .map(|s| IpCidr::parse(s).ok_or_else(|| anyhow!("bad ip rule {s}")))
        .collect::<Result<Vec<_>>>()?;
    let networks = r
        .network
        .iter()
        .map(|s| Network::parse(s).ok_or_else(|| anyhow!("bad network rule {s}")))
        .collect::<Result<Vec<_>>>()?;
    Ok(RouteRule {
        domain_suffix: r.domain.clone(),
        ip_cidr,
        networks,
        in_tags: r.from_tag.clone(),
        out_tag: r.to_tag.clone(),
    })
}
