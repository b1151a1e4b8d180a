//! lm-adapters: proxy-layer protocol implementations.
//!
//! Inbound servers turn an accepted carrier stream into `(inner stream,
//! target)`; outbound clients do the reverse over a dialed carrier
//! stream. Handshake failures that leave the consumed bytes intact are
//! reported as rejects so the pipeline can replay them into fallback.

pub mod inbound;
pub mod outbound;
mod stream_util;

use lm_core::proxy::{ProxyClient, ProxyServer};
use std::sync::Arc;

/// Build an inbound proxy server by protocol name.
pub fn new_server(
    protocol: &str,
    uuid: &str,
    target: Option<lm_core::Address>,
) -> anyhow::Result<Arc<dyn ProxyServer>> {
    Ok(match protocol {
        "socks5" => Arc::new(inbound::socks5::Socks5Server::new()),
        "http" => Arc::new(inbound::http::HttpServer::new()),
        "trojan" => Arc::new(inbound::trojan::TrojanServer::new(&[uuid])),
        "vless" => Arc::new(inbound::vless::VlessServer::new(uuid)?),
        "simplesocks" => Arc::new(inbound::simplesocks::SimpleSocksServer::new()),
        "dokodemo" => {
            let target =
                target.ok_or_else(|| anyhow::anyhow!("dokodemo listener needs a target"))?;
            Arc::new(inbound::dokodemo::DokodemoServer::new(target))
        }
        other => anyhow::bail!("unknown listen protocol: {other}"),
    })
}

/// Build an outbound proxy client by protocol name.
pub fn new_client(
    protocol: &str,
    uuid: &str,
    use_mux: bool,
    fullcone: bool,
) -> anyhow::Result<Arc<dyn ProxyClient>> {
    Ok(match protocol {
        "direct" => Arc::new(outbound::direct::DirectClient::new(fullcone)),
        "reject" => Arc::new(outbound::reject::RejectClient),
        "socks5" => Arc::new(outbound::socks5::Socks5Client::new()),
        "http" => Arc::new(outbound::http::HttpClient::new()),
        "trojan" => Arc::new(outbound::trojan::TrojanClient::new(uuid, use_mux)),
        "vless" => Arc::new(outbound::vless::VlessClient::new(uuid, use_mux)?),
        "simplesocks" => Arc::new(outbound::simplesocks::SimpleSocksClient::new()),
        other => anyhow::bail!("unknown dial protocol: {other}"),
    })
}
