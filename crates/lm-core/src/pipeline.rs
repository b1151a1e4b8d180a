//! Per-connection orchestration: threads ingress bytes up through the
//! carrier layers, hands them to the proxy layer, consults fallback and
//! routing, dials the symmetric outbound stack and finally relays.
//!
//! The ingress side composes bottom-up (transport → TLS → header →
//! advanced layer → proxy); the egress side composes the same layers
//! top-down. Cancellation propagates by closing the outermost conn, which
//! errors every wrapped read/write above it.

use crate::address::{Address, Network, TargetDescription};
use crate::error::HandshakeError;
use crate::fallback::FallbackTable;
use crate::proxy::{MsgConn, ProxyClient, ProxyServer, ServerHandshake, FIRST_PAYLOAD_TIMEOUT};
use crate::proxy_protocol;
use crate::relay::{relay, ConnCaps, RelayConn};
use crate::router::{RoutingEnv, DIRECT_TAG};
use crate::stats;
use crate::udp::{relay_udp, relay_udp_separate, UdpDialFn};
use lm_transport::advanced::{FallbackMeta, H2FallbackRequest, MAX_EARLY_DATA_LEN};
use lm_transport::grpc::{GrpcClient, GrpcServer};
use lm_transport::header::{read_and_validate, HeaderError, HeaderPreset, HeaderStream};
use lm_transport::multiplex::{MuxClientPool, MuxError};
use lm_transport::quic::{QuicClient, QuicServer};
use lm_transport::tls_lazy::{looks_like_tls, RawRecorder, TeeStream};
use lm_transport::websocket::{WsClient, WsServer};
use lm_transport::{listener, IoStream, SingleAcceptError, SockOpt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info, warn};

/// Global switch for the lazy-TLS optimization (both ends opt in via
/// config; this gates the machinery at runtime).
pub fn tls_lazy_encrypt() -> bool {
    static ON: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *ON.get_or_init(|| std::env::var("LM_TLS_LAZY").map(|v| v == "1").unwrap_or(false))
}

/// Secure-sniff variant: the ingress client's first TLS record is
/// detected before the outbound dial commits to a TLS layer.
pub fn tls_lazy_secure() -> bool {
    static ON: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *ON.get_or_init(|| {
        std::env::var("LM_TLS_LAZY_SECURE")
            .map(|v| v == "1")
            .unwrap_or(false)
    })
}

/// Advanced-layer server variants, dispatched by capability.
pub enum AdvServer {
    Ws(WsServer),
    Grpc(GrpcServer),
    Quic(QuicServer),
}

impl AdvServer {
    pub fn caps(&self) -> lm_transport::AdvCapabilities {
        match self {
            AdvServer::Ws(_) => lm_transport::websocket::CAPABILITIES,
            AdvServer::Grpc(_) => lm_transport::grpc::CAPABILITIES,
            AdvServer::Quic(_) => lm_transport::quic::CAPABILITIES,
        }
    }

    fn layer_name(&self) -> &'static str {
        match self {
            AdvServer::Ws(_) => "ws",
            AdvServer::Grpc(_) => "grpc",
            AdvServer::Quic(_) => "quic",
        }
    }
}

/// Advanced-layer client variants.
pub enum AdvClient {
    Ws(WsClient),
    Grpc(GrpcClient),
    Quic(QuicClient),
}

impl AdvClient {
    pub fn caps(&self) -> lm_transport::AdvCapabilities {
        match self {
            AdvClient::Ws(_) => lm_transport::websocket::CAPABILITIES,
            AdvClient::Grpc(_) => lm_transport::grpc::CAPABILITIES,
            AdvClient::Quic(_) => lm_transport::quic::CAPABILITIES,
        }
    }

    fn layer_name(&self) -> &'static str {
        match self {
            AdvClient::Ws(_) => "ws",
            AdvClient::Grpc(_) => "grpc",
            AdvClient::Quic(_) => "quic",
        }
    }
}

/// Outbound TLS parameters resolved at build time.
pub struct TlsOut {
    pub config: Arc<tokio_rustls::rustls::ClientConfig>,
    pub server_name: String,
}

/// Immutable ingress descriptor: one listener with its full layer stack.
pub struct Server {
    pub tag: Option<String>,
    pub addr: Address,
    pub sockopt: SockOpt,
    pub proxy: Arc<dyn ProxyServer>,
    /// Proxy server used inside accepted inner-mux sessions.
    pub inner_mux_server: Option<Arc<dyn ProxyServer>>,
    pub tls: Option<tokio_rustls::TlsAcceptor>,
    pub tls_lazy: bool,
    pub header: Option<HeaderPreset>,
    pub adv: Option<AdvServer>,
    pub fallback: FallbackTable,
    pub no_route: bool,
}

impl Server {
    /// Layer-stack name for logs, e.g. `tcp+tls+ws+vless`.
    pub fn full_name(&self) -> String {
        let mut parts = vec![self.addr.network.as_str().to_string()];
        if self.tls.is_some() {
            parts.push("tls".into());
        }
        if self.header.is_some() {
            parts.push("http".into());
        }
        if let Some(adv) = &self.adv {
            parts.push(adv.layer_name().into());
        }
        parts.push(self.proxy.name().into());
        parts.join("+")
    }
}

/// Immutable egress descriptor: one outbound client with its layer stack.
pub struct Client {
    pub tag: Option<String>,
    /// The proxy server to dial; `None` for direct-style clients that
    /// dial the requested target itself.
    pub addr: Option<Address>,
    pub network: Network,
    pub sockopt: SockOpt,
    pub proxy: Arc<dyn ProxyClient>,
    /// Proxy client used inside inner-mux streams.
    pub inner_mux_client: Option<Arc<dyn ProxyClient>>,
    /// Present when `use_mux` is configured (inner-mux kind 2).
    pub mux_pool: Option<MuxClientPool>,
    pub tls: Option<TlsOut>,
    pub tls_lazy: bool,
    pub header: Option<HeaderPreset>,
    pub adv: Option<AdvClient>,
}

impl Client {
    pub fn full_name(&self) -> String {
        if self.proxy.name() == "direct" {
            return "direct".into();
        }
        let mut parts = vec![self.network.as_str().to_string()];
        if self.tls.is_some() {
            parts.push("tls".into());
        }
        if self.header.is_some() {
            parts.push("http".into());
        }
        if let Some(adv) = &self.adv {
            parts.push(adv.layer_name().into());
        }
        parts.push(self.proxy.name().into());
        if self.proxy.inner_mux_kind() == 2 {
            parts.push("mux".into());
            if let Some(p) = self.proxy.inner_mux_protocol() {
                parts.push(p.into());
            }
        }
        parts.join("+")
    }

    pub fn addr_str(&self) -> String {
        self.addr
            .as_ref()
            .map(|a| a.host_port())
            .unwrap_or_default()
    }
}

/// Per-accepted-connection state threaded through the stages.
struct IncomingState {
    server: Arc<Server>,
    default_client: Arc<Client>,
    env: Option<Arc<RoutingEnv<Client>>>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    wrapped: Option<IoStream>,
    /// Present only for lazy-TLS ingress.
    recorder: Option<RawRecorder>,
    lazy_server: bool,
    /// Bytes consumed by a failed handshake, replayed into fallback (or
    /// the SOCKS5 first datagram on the UDP path).
    fallback_first_buffer: Option<Vec<u8>>,
    request_path: Option<String>,
    fallback_h2: Option<H2FallbackRequest>,
    is_fallback_h2: bool,
    fallback_xver: u8,
    routed_to_direct: bool,
    should_close_base: bool,
    from_mux_adv: bool,
}

impl IncomingState {
    fn new(
        server: Arc<Server>,
        default_client: Arc<Client>,
        env: Option<Arc<RoutingEnv<Client>>>,
    ) -> Self {
        Self {
            server,
            default_client,
            env,
            peer: None,
            local: None,
            wrapped: None,
            recorder: None,
            lazy_server: false,
            fallback_first_buffer: None,
            request_path: None,
            fallback_h2: None,
            is_fallback_h2: false,
            fallback_xver: 0,
            routed_to_direct: false,
            should_close_base: true,
            from_mux_adv: false,
        }
    }

    /// Child state for a substream (mux advanced layer or inner mux):
    /// shares the descriptors, owns nothing yet.
    fn child(&self) -> Self {
        let mut c = Self::new(
            self.server.clone(),
            self.default_client.clone(),
            self.env.clone(),
        );
        c.peer = self.peer;
        c.local = self.local;
        c.from_mux_adv = self.from_mux_adv;
        c
    }
}

/// A running listener: the accept-loop task plus the actually bound
/// address (useful with port 0).
pub struct ListenerHandle {
    pub task: tokio::task::JoinHandle<()>,
    pub local_addr: Option<SocketAddr>,
}

impl ListenerHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start listening for one ingress descriptor. Aborting the returned
/// handle stops the listener.
pub async fn listen_server(
    server: Arc<Server>,
    default_client: Arc<Client>,
    env: Option<Arc<RoutingEnv<Client>>>,
) -> anyhow::Result<ListenerHandle> {
    // Super+mux carriers own their transport: substreams arrive on a
    // channel already demuxed, and the generic accept path is skipped.
    if let Some(AdvServer::Quic(q)) = &server.adv {
        let (mut rx, endpoint) = q.start_listen()?;
        let local_addr = endpoint.local_addr().ok();
        info!(
            protocol = %server.full_name(),
            addr = %server.addr,
            "listening super advanced layer"
        );
        let task = tokio::spawn(async move {
            let _endpoint = endpoint;
            while let Some(stream) = rx.recv().await {
                let mut state = IncomingState::new(
                    server.clone(),
                    default_client.clone(),
                    env.clone(),
                );
                state.wrapped = Some(stream);
                state.from_mux_adv = true;
                tokio::spawn(handshake_inserver_and_pass(state));
            }
            warn!("super advanced layer accept channel closed");
        });
        return Ok(ListenerHandle { task, local_addr });
    }

    let acceptor = match server.addr.network {
        Network::Unix => {
            #[cfg(unix)]
            {
                listener::listen_unix(&server.addr.host_port()).await?
            }
            #[cfg(not(unix))]
            anyhow::bail!("unix listeners unsupported on this platform")
        }
        _ => listener::listen_tcp(&server.addr.dial_string(), &server.sockopt).await?,
    };
    let local_addr = acceptor.local_addr();
    info!(
        protocol = %server.full_name(),
        addr = %server.addr,
        "listening"
    );

    let task = tokio::spawn(async move {
        loop {
            match acceptor.accept().await {
                Ok((conn, peer)) => {
                    let mut state = IncomingState::new(
                        server.clone(),
                        default_client.clone(),
                        env.clone(),
                    );
                    state.peer = peer;
                    state.local = acceptor.local_addr();
                    tokio::spawn(handle_incoming(state, conn));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    });
    Ok(ListenerHandle { task, local_addr })
}

/// Carry one raw accepted conn through TLS, header and the advanced
/// layer, then into the proxy handshake stage.
async fn handle_incoming(mut state: IncomingState, conn: IoStream) {
    let server = state.server.clone();
    if let Some(peer) = state.peer {
        debug!(from = %peer, handler = %server.full_name(), "new accepted conn");
    }

    state.lazy_server = tls_lazy_encrypt() && server.tls_lazy && server.tls.is_some();

    let mut wrapped: IoStream = conn;

    // TLS layer. For lazy servers the base conn is teed into a recorder
    // first: nothing is recorded during our own handshake, recording
    // starts right after it.
    if let Some(acceptor) = &server.tls {
        if state.lazy_server {
            let recorder = RawRecorder::new();
            let teed = TeeStream::new(wrapped, recorder.clone());
            match acceptor.accept(teed).await {
                Ok(tls) => {
                    recorder.start();
                    state.recorder = Some(recorder);
                    wrapped = Box::new(tls);
                }
                Err(e) => {
                    warn!(addr = %server.addr, error = %e, "tls handshake failed");
                    return;
                }
            }
        } else {
            match acceptor.accept(wrapped).await {
                Ok(tls) => wrapped = Box::new(tls),
                Err(e) => {
                    warn!(addr = %server.addr, error = %e, "tls handshake failed");
                    return;
                }
            }
        }
    }

    // Header layer, unless the advanced layer validates headers itself.
    let adv_handles_headers = server
        .adv
        .as_ref()
        .map(|a| a.caps().can_handle_headers)
        .unwrap_or(false);
    if let Some(preset) = &server.header {
        if !adv_handles_headers {
            match read_and_validate(&mut wrapped, &preset.request).await {
                Ok(leftover) => {
                    wrapped = Box::new(HeaderStream::new(
                        wrapped,
                        preset.response.render(),
                        leftover,
                    ));
                }
                Err(HeaderError::Mismatch { consumed }) => {
                    debug!(len = consumed.len(), "header mismatch, will fall back");
                    state.fallback_first_buffer = Some(consumed);
                    state.wrapped = Some(wrapped);
                    pass_to_out_client(state, true, None, None, Address::default()).await;
                    return;
                }
                Err(HeaderError::Io(e)) => {
                    debug!(error = %e, "header read failed");
                    return;
                }
            }
        }
    }

    // Advanced layer: mux fans out substreams, single wraps in place.
    match &server.adv {
        Some(AdvServer::Quic(_)) => {
            // Handled in listen_server; never reaches here.
        }
        Some(AdvServer::Grpc(g)) => {
            let (sub_tx, mut sub_rx, fb_tx, mut fb_rx) = lm_transport::grpc::bounded_channels();
            state.from_mux_adv = true;

            let fb_state = state.child();
            tokio::spawn(async move {
                while let Some(meta) = fb_rx.recv().await {
                    let mut s = fb_state.child();
                    apply_fallback_meta(&mut s, meta);
                    tokio::spawn(pass_to_out_client(s, true, None, None, Address::default()));
                }
            });

            let sub_state = state.child();
            tokio::spawn(async move {
                while let Some(sub) = sub_rx.recv().await {
                    let mut s = sub_state.child();
                    s.wrapped = Some(sub);
                    tokio::spawn(handshake_inserver_and_pass(s));
                }
                debug!("grpc substream channel closed");
            });

            // Drive the HTTP/2 server conn to completion on this task.
            g.start_handle(wrapped, sub_tx, fb_tx).await;
            return;
        }
        Some(AdvServer::Ws(w)) => match w.handshake(wrapped).await {
            Ok(ws) => wrapped = ws,
            Err(SingleAcceptError::ShouldFallback(meta)) => {
                debug!(
                    handler = %server.addr,
                    valid_path = %w.path(),
                    got_path = %meta.path,
                    got_method = %meta.method,
                    "single advanced layer check failed, will fall back"
                );
                apply_fallback_meta(&mut state, *meta);
                pass_to_out_client(state, true, None, None, Address::default()).await;
                return;
            }
            Err(e) => {
                warn!(handler = %server.addr, error = %e, "single advanced layer handshake failed");
                return;
            }
        },
        None => {}
    }

    state.wrapped = Some(wrapped);
    handshake_inserver_and_pass(state).await;
}

fn apply_fallback_meta(state: &mut IncomingState, meta: FallbackMeta) {
    state.request_path = Some(meta.path);
    state.fallback_first_buffer = meta.h1_request_buf;
    state.is_fallback_h2 = meta.is_h2;
    state.fallback_h2 = meta.h2_request;
    state.wrapped = Some(meta.conn);
}

async fn handshake_inserver_and_pass(mut state: IncomingState) {
    match handshake_inserver(&mut state).await {
        Ok((wlc, udp_wlc, target)) => {
            pass_to_out_client(state, false, wlc, udp_wlc, target).await
        }
        Err(HandshakeError::Handled) => {}
        Err(e) => {
            let reason = e.to_string();
            match e.into_replay() {
                Some((buf, conn)) if !buf.is_empty() => {
                    debug!(%reason, len = buf.len(), "ingress handshake rejected, will fall back");
                    state.fallback_first_buffer = Some(buf);
                    if let Some(c) = conn {
                        state.wrapped = Some(c);
                    }
                    pass_to_out_client(state, true, None, None, Address::default()).await;
                }
                _ => {
                    debug!(%reason, "ingress handshake failed, hanging up");
                    // Dropping the state drops whatever conn remains.
                }
            }
        }
    }
}

type InboundResult = (Option<IoStream>, Option<Arc<dyn MsgConn>>, Address);

async fn handshake_inserver(state: &mut IncomingState) -> Result<InboundResult, HandshakeError> {
    let conn = state
        .wrapped
        .take()
        .ok_or_else(|| HandshakeError::fatal("no wrapped conn"))?;

    match state.server.proxy.handshake(conn).await? {
        ServerHandshake::Tcp { stream, target } => Ok((Some(stream), None, target)),
        ServerHandshake::Udp { conn, target } => {
            // SOCKS5 returns the associate placeholder, not the real
            // first target; one datagram must be read to learn it.
            if state.server.proxy.name() == "socks5" {
                let (data, first_target) = conn.read_msg().await.map_err(|e| {
                    warn!(error = %e, "failed reading first socks5 datagram");
                    HandshakeError::fatal(format!("socks5 first datagram: {e}"))
                })?;
                state.fallback_first_buffer = Some(data.to_vec());
                state.should_close_base = false;
                Ok((None, Some(conn), first_target))
            } else {
                Ok((None, Some(conn), target))
            }
        }
        ServerHandshake::Mux { stream } => {
            let inner = state
                .server
                .inner_mux_server
                .clone()
                .ok_or_else(|| HandshakeError::fatal("mux requested but no inner protocol"))?;
            debug!(inner = inner.name(), "ingress mux session starting");
            let mut rx = lm_transport::multiplex::serve_session(stream);
            let parent = state.child();
            tokio::spawn(async move {
                while let Some(sub) = rx.recv().await {
                    let inner = inner.clone();
                    let s = parent.child();
                    tokio::spawn(async move {
                        match inner.handshake(sub).await {
                            Ok(ServerHandshake::Tcp { stream, target }) => {
                                pass_to_out_client(s, false, Some(stream), None, target).await;
                            }
                            Ok(ServerHandshake::Udp { conn, target }) => {
                                pass_to_out_client(s, false, None, Some(conn), target).await;
                            }
                            Ok(ServerHandshake::Mux { .. }) => {
                                debug!("nested mux rejected");
                            }
                            Err(e) => match e.into_replay() {
                                Some((buf, conn)) if !buf.is_empty() => {
                                    let mut s = s;
                                    s.fallback_first_buffer = Some(buf);
                                    if let Some(c) = conn {
                                        s.wrapped = Some(c);
                                    }
                                    pass_to_out_client(s, true, None, None, Address::default())
                                        .await;
                                }
                                _ => debug!("inner mux handshake failed"),
                            },
                        }
                    });
                }
                debug!("ingress mux session ended");
            });
            Err(HandshakeError::Handled)
        }
    }
}

/// Fallback, DNS, routing, the lazy/close decisions, then dial and relay.
async fn pass_to_out_client(
    mut state: IncomingState,
    is_fallback: bool,
    mut wlc: Option<IoStream>,
    udp_wlc: Option<Arc<dyn MsgConn>>,
    mut target: Address,
) {
    if is_fallback {
        let path = state.request_path.clone();
        match state.server.fallback.check(path.as_deref()) {
            Some(entry) => {
                target = entry.target.clone();
                state.fallback_xver = entry.xver;

                if state.is_fallback_h2 {
                    // H2-shaped failure: replay over the cached H2C
                    // transport and answer the ingress in place.
                    let Some(req) = state.fallback_h2.take() else {
                        return;
                    };
                    let addr = target.dial_string();
                    let preamble = build_fallback_preamble(&state, entry.xver);
                    let path = path.unwrap_or_else(|| "/".into());
                    if let Err(e) = lm_transport::h2c::global()
                        .round_trip(&addr, entry.xver, preamble, req, &path)
                        .await
                    {
                        warn!(error = %e, url = %format!("https://{addr}{path}"), "h2 fallback round trip failed");
                    }
                    return;
                }

                wlc = state.wrapped.take();
            }
            None => {
                debug!("invalid request and no matched fallback, hanging up");
                return;
            }
        }
    }

    if wlc.is_none() && udp_wlc.is_none() {
        debug!("no inbound stream survived the handshake, hanging up");
        return;
    }

    // DNS stage: populate the ip so geo-style rules and ip-preferred
    // dialing can work.
    if let Some(env) = &state.env {
        env.maybe_resolve(&mut target).await;
    }

    // Routing stage.
    let mut client = state.default_client.clone();
    let mut routed = false;
    if let Some(env) = &state.env {
        if !state.server.no_route {
            if let Some(policy) = &env.policy {
                let desc = TargetDescription {
                    addr: target.clone(),
                    tag: state.server.tag.clone(),
                };
                match policy.out_tag(&desc) {
                    Some(tag) if tag == DIRECT_TAG => {
                        if let Some(direct) = &env.direct {
                            client = direct.clone();
                            state.routed_to_direct = true;
                            routed = true;
                            info!(target = %target.url_string(), "route to direct");
                        }
                    }
                    Some(tag) => {
                        if let Some(c) = env.clients_by_tag.get(tag) {
                            client = c.clone();
                            routed = true;
                            info!(
                                out_tag = %tag,
                                addr = %client.addr_str(),
                                protocol = %client.full_name(),
                                "routed"
                            );
                        }
                    }
                    None => {}
                }
            }
        }
    }
    if !routed {
        debug!(target = %target, client = %client.full_name(), "default route");
    }

    // Lazy-TLS applicability. UDP payloads cannot be spliced; a lazy
    // ingress recorder is stopped as soon as UDP is known.
    let mut lazy_client = false;
    if target.is_udp() {
        if state.lazy_server {
            state.lazy_server = false;
            if let Some(rec) = &state.recorder {
                rec.stop();
            }
        }
    } else {
        lazy_client = tls_lazy_encrypt()
            && !state.routed_to_direct
            && client.tls_lazy
            && client.tls.is_some();
    }

    // Close-base decision: SOCKS5 UDP keeps its control conn alive, lazy
    // hands the base conn to the raw path, and a mux substream only ever
    // closes itself.
    if !target.is_udp() {
        state.should_close_base = !state.lazy_server && !state.from_mux_adv;
    }

    dial_client_and_relay(state, target, client, lazy_client, wlc, udp_wlc).await;
}

fn build_fallback_preamble(state: &IncomingState, xver: u8) -> Option<bytes::Bytes> {
    if !(1..=2).contains(&xver) {
        return None;
    }
    let src = state.peer?;
    let dst = state
        .local
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    proxy_protocol::build_preamble(xver, src, dst).map(bytes::Bytes::from)
}

enum DialOutcome {
    Tcp(RelayConn),
    Udp(Arc<dyn MsgConn>),
    Rejected,
    Failed,
}

/// Dial through the outbound stack and perform the egress proxy
/// handshake. Mirrors the ingress layering in reverse.
async fn dial_client(
    state: &mut IncomingState,
    target: &Address,
    client: &Arc<Client>,
    wlc: &mut Option<IoStream>,
    lazy_client: bool,
) -> DialOutcome {
    // Reject clients hang up instead of dialing.
    if client.proxy.name() == "reject" {
        if let Some(conn) = wlc.take() {
            let _ = client.proxy.handshake(conn, &[], target).await;
        }
        return DialOutcome::Rejected;
    }

    let is_udp = target.is_udp();
    let has_inner_mux = client.proxy.inner_mux_kind() == 2;

    // Established inner mux: open a stream without touching the outer
    // stack.
    if has_inner_mux {
        if let Some(pool) = &client.mux_pool {
            if pool.established().await {
                match dial_inner_proxy(client, pool, wlc, target, is_udp).await {
                    Ok(outcome) => return outcome,
                    Err(e) => debug!(error = %e, "inner mux failed, will redial"),
                }
            }
        }
    }

    if let Some(peer) = state.peer {
        info!(
            from = %peer,
            target = %target.url_string(),
            through = %client.full_name(),
            "request"
        );
    }

    // The dial address: the client's own server, or the requested target
    // for direct-style clients.
    let mut real_target = match &client.addr {
        Some(a) => a.clone(),
        None => target.clone(),
    };
    if client.addr.is_some() {
        real_target.network = client.network;
    }

    // Fast path: a transparent client with no layers relays a bare
    // socket, which keeps the splice strategy available.
    let transparent_plain = client.proxy.is_transparent()
        && client.tls.is_none()
        && client.header.is_none()
        && client.adv.is_none();

    if is_udp && client.proxy.is_transparent() {
        // Direct UDP dials its own socket (full cone lives there).
        match client.proxy.establish_udp(None, target).await {
            Ok(conn) => return DialOutcome::Udp(conn),
            Err(e) => {
                warn!(target = %target, error = %e, "udp establish failed");
                return DialOutcome::Failed;
            }
        }
    }

    // Lazy secure client: sniff the ingress first record before letting
    // TLS anywhere near the outbound conn. A timeout downgrades to the
    // classic path; other errors are fatal.
    let mut sniffed_payload: Option<Vec<u8>> = None;
    let mut engage_lazy = false;
    if lazy_client && tls_lazy_secure() && !is_udp {
        if let Some(conn) = wlc.as_mut() {
            match read_first_payload(conn).await {
                Ok(payload) if looks_like_tls(&payload) => {
                    debug!(len = payload.len(), "lazy tls: first record sniffed, raw path engaged");
                    engage_lazy = true;
                    sniffed_payload = Some(payload);
                }
                Ok(payload) => sniffed_payload = Some(payload),
                Err(e) => {
                    warn!(error = %e, "lazy tls sniff read failed, hanging up");
                    return DialOutcome::Failed;
                }
            }
        }
    }

    let mux_adv = client
        .adv
        .as_ref()
        .map(|a| a.caps().is_mux)
        .unwrap_or(false);
    let super_adv = client
        .adv
        .as_ref()
        .map(|a| a.caps().is_super)
        .unwrap_or(false);

    let mut conn: Option<IoStream> = None;
    let mut caps = ConnCaps::plain();

    if super_adv {
        // QUIC owns its transport: pool selection replaces the dial.
        let AdvClient::Quic(q) = client.adv.as_ref().expect("super checked") else {
            unreachable!("super implies quic");
        };
        let session = match q.get_common_conn().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "super advanced layer get_common_conn failed");
                return DialOutcome::Failed;
            }
        };
        match q.dial_sub_conn(&session).await {
            Ok(s) => {
                conn = Some(s);
                caps = ConnCaps::multi();
            }
            Err(e) => {
                warn!(error = %e, "dial_sub_conn failed");
                return DialOutcome::Failed;
            }
        }
    } else if mux_adv {
        let AdvClient::Grpc(g) = client.adv.as_ref().expect("mux checked") else {
            unreachable!("mux implies grpc");
        };
        let common = match g.get_pooled().await {
            Some(c) => c,
            None => {
                // No pooled transport: dial the carrier stack and start
                // one over it.
                let carrier = match dial_carrier(state, client, &real_target, false).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn_dial_failure(&real_target, &e);
                        return DialOutcome::Failed;
                    }
                };
                match g.new_transport(carrier).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "grpc transport setup failed");
                        return DialOutcome::Failed;
                    }
                }
            }
        };
        match g.dial_sub_conn(&common).await {
            Ok(s) => {
                conn = Some(s);
                caps = ConnCaps::multi();
            }
            Err(e) => {
                warn!(error = %e, "grpc dial_sub_conn failed");
                g.invalidate().await;
                return DialOutcome::Failed;
            }
        }
    } else if transparent_plain && !is_udp && real_target.network == Network::Tcp && !engage_lazy {
        // Bare TCP to the target; keep the typed socket for splice.
        let sa = match resolve_dial_addr(&real_target).await {
            Ok(sa) => sa,
            Err(e) => {
                warn_dial_failure(&real_target, &e);
                return DialOutcome::Failed;
            }
        };
        match listener::dial_tcp(sa, &client.sockopt).await {
            Ok(s) => {
                let mut rc = RelayConn::basic(s);
                // A replay buffer normally rides in the proxy handshake;
                // direct has none, so it goes straight onto the socket.
                if let Err(e) = write_pending_first_bytes(state, &mut rc).await {
                    warn!(error = %e, "first payload write failed");
                    return DialOutcome::Failed;
                }
                return DialOutcome::Tcp(rc);
            }
            Err(e) => {
                warn_dial_failure(&real_target, &e);
                return DialOutcome::Failed;
            }
        }
    } else {
        let skip_tls = engage_lazy;
        match dial_carrier(state, client, &real_target, skip_tls).await {
            Ok(c) => {
                conn = Some(c);
                caps = if engage_lazy {
                    ConnCaps {
                        splice_eventually: true,
                        ..ConnCaps::plain()
                    }
                } else if client.tls.is_none() && client.header.is_none() {
                    ConnCaps::multi()
                } else {
                    ConnCaps::plain()
                };
            }
            Err(e) => {
                warn_dial_failure(&real_target, &e);
                return DialOutcome::Failed;
            }
        }
    }

    // Single advanced layer (ws). With early data the upgrade is
    // deferred: the proxy-layer handshake runs against a late-bound
    // stream first, and its buffered first write rides inside the
    // upgrade request; the server prepends it back in front of the
    // substream, so protocol order survives.
    if let Some(AdvClient::Ws(w)) = &client.adv {
        let host = real_target.host.clone().unwrap_or_else(|| {
            real_target
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_default()
        });
        let port = real_target.port;

        // Deferral requires a handshake that only writes; the SOCKS5
        // client waits for replies and would deadlock.
        let write_only_handshake =
            matches!(client.proxy.name(), "trojan" | "vless" | "simplesocks");
        if w.is_early() && !is_udp && !has_inner_mux && write_only_handshake {
            let first_payload = match take_first_payload(state, &mut sniffed_payload, wlc).await
            {
                Ok(p) => p,
                Err(()) => return DialOutcome::Failed,
            };
            let (late, binder) = lm_transport::util::LateBoundStream::new();
            let wrc = match client
                .proxy
                .handshake(Box::new(late), &first_payload, target)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(target = %target, error = %e, "egress handshake failed");
                    return DialOutcome::Failed;
                }
            };
            let mut early = binder.take_buffered();
            let rest = if early.len() > MAX_EARLY_DATA_LEN {
                early.split_off(MAX_EARLY_DATA_LEN)
            } else {
                Vec::new()
            };
            debug!(len = early.len(), "sending early data");
            let mut ws = match w
                .upgrade_on(conn.take().expect("carrier dialed"), &host, port, &early)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(target = %target, error = %e, "single advanced layer handshake failed");
                    return DialOutcome::Failed;
                }
            };
            if !rest.is_empty() {
                use tokio::io::AsyncWriteExt;
                if let Err(e) = ws.write_all(&rest).await {
                    warn!(error = %e, "early data overflow write failed");
                    return DialOutcome::Failed;
                }
            }
            binder.bind(ws);
            return DialOutcome::Tcp(RelayConn::from_stream(wrc, ConnCaps::multi()));
        }

        match w
            .upgrade_on(conn.take().expect("carrier dialed"), &host, port, &[])
            .await
        {
            Ok(s) => {
                conn = Some(s);
                caps = ConnCaps::multi();
            }
            Err(e) => {
                warn!(target = %target, error = %e, "single advanced layer handshake failed");
                return DialOutcome::Failed;
            }
        }
    }

    let conn = conn.expect("outbound conn established");

    // Proxy-layer handshake. UDP without inner mux takes the message
    // channel; everything else reads the first payload and handshakes.
    if !is_udp || has_inner_mux {
        // With inner mux the outer handshake is a bare MUX request; the
        // first payload is read later, inside the inner stream.
        let first_payload = if has_inner_mux {
            Vec::new()
        } else {
            match take_first_payload(state, &mut sniffed_payload, wlc).await {
                Ok(p) => p,
                Err(()) => return DialOutcome::Failed,
            }
        };
        if !first_payload.is_empty() {
            debug!(len = first_payload.len(), "handshaking client with first payload");
        }
        let wrc = match client.proxy.handshake(conn, &first_payload, target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target = %target, error = %e, "egress handshake failed");
                return DialOutcome::Failed;
            }
        };

        if has_inner_mux {
            let Some(pool) = &client.mux_pool else {
                warn!("inner mux configured without a pool");
                return DialOutcome::Failed;
            };
            pool.install(wrc).await;
            match dial_inner_proxy(client, pool, wlc, target, is_udp).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    warn!(error = %e, "inner mux dial failed after redial");
                    pool.close().await;
                    return DialOutcome::Failed;
                }
            }
        }

        let mut rc = RelayConn::from_stream(wrc, caps);
        if engage_lazy {
            rc.caps.splice_eventually = true;
        }
        DialOutcome::Tcp(rc)
    } else {
        match client.proxy.establish_udp(Some(conn), target).await {
            Ok(c) => DialOutcome::Udp(c),
            Err(e) => {
                warn!(target = %target, error = %e, "establish udp channel failed");
                DialOutcome::Failed
            }
        }
    }
}

/// First payload priority: a fallback/replay buffer, then a sniffed lazy
/// payload, then a bounded read from the ingress (timeout tolerated,
/// anything else fatal).
async fn take_first_payload(
    state: &mut IncomingState,
    sniffed: &mut Option<Vec<u8>>,
    wlc: &mut Option<IoStream>,
) -> Result<Vec<u8>, ()> {
    if let Some(buf) = state.fallback_first_buffer.take() {
        return Ok(buf);
    }
    if let Some(buf) = sniffed.take() {
        return Ok(buf);
    }
    if let Some(conn) = wlc.as_mut() {
        match read_first_payload(conn).await {
            Ok(p) => return Ok(p),
            Err(e) => {
                warn!(error = %e, "read first payload failed not because of timeout, hanging up");
                return Err(());
            }
        }
    }
    Ok(Vec::new())
}

/// Write replay/first-buffer bytes straight to a bare outbound socket
/// (the direct fast path has no handshake to carry them).
async fn write_pending_first_bytes(
    state: &mut IncomingState,
    rc: &mut RelayConn,
) -> std::io::Result<()> {
    if let Some(buf) = state.fallback_first_buffer.take() {
        use tokio::io::AsyncWriteExt;
        if let Some(s) = rc.as_tcp_mut() {
            s.write_all(&buf).await?;
        }
    }
    Ok(())
}

/// A 100 ms deadline bounds the read; elapsing it yields an empty
/// payload, any real error propagates.
async fn read_first_payload(conn: &mut IoStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 16 * 1024];
    match tokio::time::timeout(FIRST_PAYLOAD_TIMEOUT, conn.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!("first payload timeout, relaying without it");
            Ok(Vec::new())
        }
    }
}

/// Generic carrier dial: TCP/unix, PROXY preamble, TLS (unless skipped),
/// header. Advanced layers are handled by the caller.
async fn dial_carrier(
    state: &IncomingState,
    client: &Arc<Client>,
    real_target: &Address,
    skip_tls: bool,
) -> Result<IoStream, lm_transport::DialError> {
    let mut conn: IoStream = match real_target.network {
        Network::Unix => {
            #[cfg(unix)]
            {
                let s =
                    tokio::net::UnixStream::connect(real_target.host_port()).await?;
                Box::new(s)
            }
            #[cfg(not(unix))]
            return Err(lm_transport::DialError::NotSupported);
        }
        _ => {
            let sa = resolve_dial_addr(real_target).await?;
            Box::new(listener::dial_tcp(sa, &client.sockopt).await?)
        }
    };

    // PROXY protocol preamble for fallback targets.
    if (1..=2).contains(&state.fallback_xver) {
        if let Some(src) = state.peer {
            let dst = state
                .local
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
            debug!("writing proxy protocol preamble");
            proxy_protocol::write_preamble(&mut conn, state.fallback_xver, src, dst).await?;
        }
    }

    if !skip_tls {
        if let Some(tls) = &client.tls {
            let sn = ServerName::try_from(tls.server_name.clone())
                .map_err(|e| lm_transport::DialError::Tls(format!("bad sni: {e}")))?;
            let connector = tokio_rustls::TlsConnector::from(tls.config.clone());
            let s = connector
                .connect(sn, conn)
                .await
                .map_err(|e| lm_transport::DialError::Tls(format!("client handshake: {e}")))?;
            conn = Box::new(s);
        }
    }

    let adv_handles_headers = client
        .adv
        .as_ref()
        .map(|a| a.caps().can_handle_headers)
        .unwrap_or(false);
    if let Some(preset) = &client.header {
        if !adv_handles_headers {
            conn = Box::new(HeaderStream::client(
                conn,
                preset.request.render(),
                preset.response.clone(),
            ));
        }
    }

    Ok(conn)
}

async fn resolve_dial_addr(addr: &Address) -> Result<SocketAddr, lm_transport::DialError> {
    if let Some(sa) = addr.socket_addr() {
        return Ok(sa);
    }
    let host = addr
        .host
        .clone()
        .ok_or_else(|| lm_transport::DialError::Other("address has no host".into()))?;
    let resolved = tokio::net::lookup_host((host.as_str(), addr.port))
        .await?
        .next();
    resolved.ok_or_else(|| lm_transport::DialError::Other(format!("resolve {host} failed")))
}

fn warn_dial_failure(target: &Address, e: &lm_transport::DialError) {
    match e {
        lm_transport::DialError::NoIpv6OnHost => {
            warn!(target = %target, "machine has no ipv6 but got an ipv6 request");
        }
        _ => {
            warn!(target = %target, error = %e, "failed dialing");
        }
    }
}

/// Open an inner-mux stream and re-handshake inside it. At most one
/// outer redial happens per open, and it is driven by the caller seeing
/// `NeedRedial` exactly once.
async fn dial_inner_proxy(
    client: &Arc<Client>,
    pool: &MuxClientPool,
    wlc: &mut Option<IoStream>,
    target: &Address,
    is_udp: bool,
) -> Result<DialOutcome, MuxError> {
    let stream = pool.open_stream().await?;
    let inner = client
        .inner_mux_client
        .clone()
        .ok_or_else(|| MuxError::Session("no inner mux client".into()))?;

    if is_udp {
        match inner.establish_udp(Some(stream), target).await {
            Ok(c) => Ok(DialOutcome::Udp(c)),
            Err(e) => Err(MuxError::Session(format!("inner udp: {e}"))),
        }
    } else {
        let mut first_payload = Vec::new();
        if let Some(conn) = wlc.as_mut() {
            match read_first_payload(conn).await {
                Ok(p) => first_payload = p,
                Err(e) => return Err(MuxError::Session(format!("inner first payload: {e}"))),
            }
        }
        match inner.handshake(stream, &first_payload, target).await {
            Ok(s) => Ok(DialOutcome::Tcp(RelayConn::multi(s))),
            Err(e) => Err(MuxError::Session(format!("inner handshake: {e}"))),
        }
    }
}

/// Dial and relay; owns the tail of the connection's life.
async fn dial_client_and_relay(
    mut state: IncomingState,
    target: Address,
    client: Arc<Client>,
    lazy_client: bool,
    mut wlc: Option<IoStream>,
    udp_wlc: Option<Arc<dyn MsgConn>>,
) {
    let outcome = dial_client(&mut state, &target, &client, &mut wlc, lazy_client).await;

    match outcome {
        DialOutcome::Rejected | DialOutcome::Failed => {
            // Dropping state and wlc closes everything that remains.
        }
        DialOutcome::Tcp(rc) => {
            let Some(wlc) = wlc else {
                debug!("tcp outcome without an inbound stream");
                return;
            };
            let lc_caps = ingress_caps(&state);
            let lc = RelayConn::from_stream(wlc, lc_caps);
            stats::ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
            relay(
                &target,
                rc,
                lc,
                stats::download_counter(),
                stats::upload_counter(),
            )
            .await;
            stats::ACTIVE_CONNECTIONS.fetch_add(-1, Ordering::Relaxed);
        }
        DialOutcome::Udp(udp_wrc) => {
            let Some(udp_wlc) = udp_wlc else {
                debug!("udp outcome without an inbound message conn");
                return;
            };
            // Replay the first datagram learned during the associate.
            if let Some(buf) = state.fallback_first_buffer.take() {
                if let Err(e) = udp_wrc.write_msg(bytes::Bytes::from(buf), &target).await {
                    debug!(error = %e, "first datagram write failed");
                }
            }
            stats::ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
            if client.proxy.is_udp_multi_channel() {
                debug!("relaying udp with multi channel");
                let dial: UdpDialFn = {
                    let client = client.clone();
                    Arc::new(move |raddr: Address| {
                        let client = client.clone();
                        Box::pin(async move {
                            dial_udp_channel(&client, &raddr).await.ok()
                        })
                    })
                };
                relay_udp_separate(
                    udp_wrc,
                    udp_wlc,
                    target.clone(),
                    stats::download_counter(),
                    stats::upload_counter(),
                    dial,
                )
                .await;
            } else {
                relay_udp(
                    udp_wrc,
                    udp_wlc,
                    stats::download_counter(),
                    stats::upload_counter(),
                )
                .await;
            }
            stats::ACTIVE_CONNECTIONS.fetch_add(-1, Ordering::Relaxed);
            if !state.should_close_base {
                // SOCKS5 keeps its TCP control conn alive until the
                // association tears down; the adapter owns that wait.
                debug!("udp relay done, ingress base conn stays with its keeper");
            }
        }
    }
}

/// Outbound UDP channel for the full-cone relay, outside any ingress
/// state.
async fn dial_udp_channel(
    client: &Arc<Client>,
    target: &Address,
) -> Result<Arc<dyn MsgConn>, ()> {
    if client.proxy.is_transparent() {
        return client
            .proxy
            .establish_udp(None, target)
            .await
            .map_err(|e| debug!(error = %e, "udp channel establish failed"));
    }
    let real_target = client.addr.clone().unwrap_or_else(|| target.clone());
    let sa = resolve_dial_addr(&real_target)
        .await
        .map_err(|e| debug!(error = %e, "udp channel dial failed"))?;
    let conn: IoStream = Box::new(
        listener::dial_tcp(sa, &client.sockopt)
            .await
            .map_err(|e| debug!(error = %e, "udp channel dial failed"))?,
    );
    let conn = match &client.tls {
        Some(tls) => {
            let sn = ServerName::try_from(tls.server_name.clone()).map_err(|_| ())?;
            let connector = tokio_rustls::TlsConnector::from(tls.config.clone());
            Box::new(connector.connect(sn, conn).await.map_err(|_| ())?) as IoStream
        }
        None => conn,
    };
    client
        .proxy
        .establish_udp(Some(conn), target)
        .await
        .map_err(|e| debug!(error = %e, "udp channel establish failed"))
}

/// Capabilities of the ingress side for strategy selection: frame-based
/// layers batch well, TLS does not, a lazy ingress may eventually splice.
fn ingress_caps(state: &IncomingState) -> ConnCaps {
    if state.lazy_server {
        return ConnCaps {
            splice_eventually: true,
            multi_read_benefit: true,
            multi_write: true,
            ..ConnCaps::plain()
        };
    }
    if state.server.adv.is_some() {
        return ConnCaps::multi();
    }
    if state.server.tls.is_some() {
        return ConnCaps::plain();
    }
    ConnCaps::multi()
}
