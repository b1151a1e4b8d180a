//! QUIC carrier: the super-multiplex advanced layer.
//!
//! QUIC owns its UDP socket, so both listening and dialing bypass the
//! generic TCP carrier entirely. The client keeps a pool of sessions and
//! learns the server's per-session stream limit by probing: the first
//! "too many open streams" failure fixes the limit, and later selections
//! never pick a session at or above it.

use crate::advanced::AdvCapabilities;
use crate::dialer::{DialError, IoStream};
use crate::tls::{self, TlsClientParams};
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub const CAPABILITIES: AdvCapabilities = AdvCapabilities {
    is_super: true,
    is_mux: true,
    can_handle_headers: false,
};

pub const DEFAULT_ALPN: &[&str] = &["h3"];
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(45);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const CONNECTION_ID_LEN: u8 = 12;
/// Streams per server connection; more streams per conn degrade
/// throughput, so the cap stays low and clients open extra sessions.
pub const SERVER_MAX_STREAMS_PER_CONN: u32 = 4;
/// quinn parks `open_bi` instead of failing when the peer's limit is
/// reached; a bounded wait turns that into the saturation signal.
const OPEN_STREAM_TIMEOUT: Duration = Duration::from_millis(300);
const TOO_MANY_OPEN_STREAMS: &str = "too many open streams";

/// Congestion knobs from the `extra` config table.
#[derive(Debug, Clone, Default)]
pub struct CongestionArgs {
    /// `congestion_control = "hy"` requests the brutal-style sender; the
    /// closest built-in controller is installed and the rate recorded.
    pub use_hy: bool,
    pub hy_mbps: u64,
    pub hy_manual: bool,
}

#[derive(Debug, Clone)]
pub struct QuicClientConfig {
    pub server_addr: String,
    pub server_name: String,
    pub alpn: Vec<String>,
    pub insecure: bool,
    pub early: bool,
    pub congestion: CongestionArgs,
}

struct SessionState {
    id: [u8; 16],
    conn: Connection,
    opened_stream_count: Arc<AtomicI32>,
    redialing: AtomicBool,
}

impl SessionState {
    fn is_active(&self) -> bool {
        self.conn.close_reason().is_none()
    }
}

/// Client side: session pool with learned server stream limit.
pub struct QuicClient {
    config: QuicClientConfig,
    endpoint: Endpoint,
    sessions: RwLock<HashMap<[u8; 16], Arc<SessionState>>>,
    known_server_max_streams: AtomicI32,
}

impl QuicClient {
    pub fn new(config: QuicClientConfig) -> Result<Self, DialError> {
        let endpoint = client_endpoint(&config)?;
        Ok(Self {
            config,
            endpoint,
            sessions: RwLock::new(HashMap::new()),
            known_server_max_streams: AtomicI32::new(0),
        })
    }

    pub fn is_early(&self) -> bool {
        self.config.early
    }

    pub fn known_server_max_streams(&self) -> i32 {
        self.known_server_max_streams.load(Ordering::Acquire)
    }

    /// Drop dead sessions and pick the best live one for a new stream:
    /// with an unknown limit the first live session wins; otherwise the
    /// live session with the fewest opened streams strictly below the
    /// limit. `None` means every session is saturated (or the pool is
    /// empty) and a fresh dial is needed.
    async fn best_session(&self) -> Option<Arc<SessionState>> {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| {
            if s.is_active() {
                true
            } else {
                s.conn.close(VarInt::from_u32(0), b"");
                false
            }
        });
        if sessions.is_empty() {
            // Pool fully drained: the learned limit may be stale (server
            // restarted with another config), so forget it.
            self.known_server_max_streams.store(0, Ordering::Release);
            return None;
        }
        let known = self.known_server_max_streams.load(Ordering::Acquire);
        if known == 0 {
            return sessions.values().next().cloned();
        }
        sessions
            .values()
            .filter(|s| s.opened_stream_count.load(Ordering::Acquire) < known)
            .min_by_key(|s| s.opened_stream_count.load(Ordering::Acquire))
            .cloned()
    }

    /// Get a session usable for a new substream, dialing when the pool has
    /// none to offer.
    pub async fn get_common_conn(&self) -> Result<Arc<PooledSession>, DialError> {
        if let Some(s) = self.best_session().await {
            debug!(
                opened = s.opened_stream_count.load(Ordering::Acquire),
                "quic: reuse pooled session"
            );
            return Ok(Arc::new(PooledSession(s)));
        }
        let s = self.dial_session().await?;
        Ok(Arc::new(PooledSession(s)))
    }

    async fn dial_session(&self) -> Result<Arc<SessionState>, DialError> {
        let addr: SocketAddr = tokio::net::lookup_host(&self.config.server_addr)
            .await?
            .next()
            .ok_or_else(|| {
                DialError::Other(format!("resolve {} failed", self.config.server_addr))
            })?;
        debug!(addr = %addr, early = self.config.early, "quic: dialing session");

        let connecting = self
            .endpoint
            .connect(addr, &self.config.server_name)
            .map_err(|e| DialError::Other(format!("quic connect: {e}")))?;
        let conn = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
            .await
            .map_err(|_| DialError::Other("quic handshake timeout".into()))?
            .map_err(|e| DialError::Other(format!("quic handshake: {e}")))?;

        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        let state = Arc::new(SessionState {
            id,
            conn,
            opened_stream_count: Arc::new(AtomicI32::new(0)),
            redialing: AtomicBool::new(false),
        });
        self.sessions.write().await.insert(id, state.clone());
        Ok(state)
    }

    fn process_when_full(&self, full: &SessionState) {
        if self.known_server_max_streams.load(Ordering::Acquire) == 0 {
            let learned = full.opened_stream_count.load(Ordering::Acquire);
            self.known_server_max_streams.store(learned, Ordering::Release);
            debug!(count = learned, "quic: learned server max streams per session");
        }
    }

    /// Open a substream on `session`. A saturated session triggers at
    /// most one redial; a second saturation in a row is an error.
    pub async fn dial_sub_conn(&self, session: &PooledSession) -> Result<IoStream, DialError> {
        let mut state = session.0.clone();
        loop {
            match tokio::time::timeout(OPEN_STREAM_TIMEOUT, state.conn.open_bi()).await {
                Ok(Ok((send, recv))) => {
                    state.redialing.store(false, Ordering::Release);
                    state.opened_stream_count.fetch_add(1, Ordering::AcqRel);
                    return Ok(Box::new(QuicStreamAdapter::new(
                        send,
                        recv,
                        state.id,
                        Arc::clone(&state.opened_stream_count),
                    )));
                }
                Ok(Err(e)) => {
                    let msg = e.to_string();
                    if state.redialing.swap(false, Ordering::AcqRel) {
                        return Err(DialError::Other(msg));
                    }
                    if !msg.contains(TOO_MANY_OPEN_STREAMS) {
                        return Err(DialError::Other(format!("quic open stream: {msg}")));
                    }
                    debug!(reason = %msg, "quic: session full, opening another");
                    self.process_when_full(&state);
                    state = self.redial_after_full().await?;
                }
                Err(_) => {
                    // Stream-limit saturation shows up as a parked open.
                    if state.redialing.swap(false, Ordering::AcqRel) {
                        return Err(DialError::Other(TOO_MANY_OPEN_STREAMS.into()));
                    }
                    debug!("quic: open stream parked, treating session as full");
                    self.process_when_full(&state);
                    state = self.redial_after_full().await?;
                }
            }
        }
    }

    async fn redial_after_full(&self) -> Result<Arc<SessionState>, DialError> {
        let next = match self.best_session().await {
            Some(s) => s,
            None => self.dial_session().await.map_err(|e| {
                DialError::Other(format!("quic redial when full failed: {e}"))
            })?,
        };
        next.redialing.store(true, Ordering::Release);
        Ok(next)
    }

    /// Close every pooled session (shutdown path); error code 0.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, s) in sessions.drain() {
            s.conn.close(VarInt::from_u32(0), b"");
        }
    }
}

/// Opaque handle to a chosen session; pool internals stay private to
/// this module while the pipeline holds one across the dial steps.
pub struct PooledSession(Arc<SessionState>);

fn transport_config(congestion: &CongestionArgs) -> Arc<quinn::TransportConfig> {
    let mut t = quinn::TransportConfig::default();
    t.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT).expect("idle timeout fits"),
    ));
    t.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    if congestion.use_hy {
        // No brutal-style sender in tree; BBR is the closest pacing.
        info!(
            mbps = congestion.hy_mbps,
            manual = congestion.hy_manual,
            "quic: hy congestion requested, installing bbr"
        );
        t.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));
    }
    Arc::new(t)
}

fn endpoint_config() -> quinn::EndpointConfig {
    let mut cfg = quinn::EndpointConfig::default();
    cfg.cid_generator(|| {
        Box::new(quinn_proto::RandomConnectionIdGenerator::new(
            CONNECTION_ID_LEN as usize,
        ))
    });
    cfg
}

fn client_endpoint(config: &QuicClientConfig) -> Result<Endpoint, DialError> {
    let bind: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
    let socket = std::net::UdpSocket::bind(bind)?;
    let runtime = quinn::default_runtime()
        .ok_or_else(|| DialError::Other("no async runtime for quic".into()))?;
    let mut endpoint = Endpoint::new(endpoint_config(), None, socket, runtime)
        .map_err(|e| DialError::Other(format!("quic endpoint: {e}")))?;

    let alpn = if config.alpn.is_empty() {
        DEFAULT_ALPN.iter().map(|s| s.to_string()).collect()
    } else {
        config.alpn.clone()
    };
    let rustls_cfg = tls::client_config(&TlsClientParams {
        server_name: Some(config.server_name.clone()),
        alpn,
        insecure: config.insecure,
    });
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(
        Arc::try_unwrap(rustls_cfg).unwrap_or_else(|arc| (*arc).clone()),
    )
    .map_err(|e| DialError::Tls(format!("quic tls: {e}")))?;
    let mut client_cfg = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_cfg.transport_config(transport_config(&config.congestion));
    endpoint.set_default_client_config(client_cfg);
    Ok(endpoint)
}

#[derive(Debug, Clone)]
pub struct QuicServerConfig {
    pub listen: SocketAddr,
    pub cert_path: String,
    pub key_path: String,
    pub alpn: Vec<String>,
    pub max_streams_per_conn: u32,
    pub congestion: CongestionArgs,
}

/// Server side: accepts sessions and fans every bidirectional stream out
/// on one channel, already demuxed.
pub struct QuicServer {
    config: QuicServerConfig,
}

impl QuicServer {
    pub fn new(config: QuicServerConfig) -> Self {
        Self { config }
    }

    /// Bind and start accepting. Returned receiver yields demuxed
    /// substreams; dropping the endpoint (via the returned handle) stops
    /// the listener.
    pub fn start_listen(&self) -> Result<(mpsc::Receiver<IoStream>, Endpoint), DialError> {
        let alpn = if self.config.alpn.is_empty() {
            DEFAULT_ALPN.iter().map(|s| s.to_string()).collect()
        } else {
            self.config.alpn.clone()
        };
        let mut tls_cfg = rustls_server_config(&self.config.cert_path, &self.config.key_path)?;
        tls_cfg.alpn_protocols = alpn.iter().map(|a| a.as_bytes().to_vec()).collect();
        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_cfg)
            .map_err(|e| DialError::Tls(format!("quic server tls: {e}")))?;
        let mut server_cfg = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT).expect("idle timeout fits"),
        ));
        transport.max_concurrent_bidi_streams(VarInt::from_u32(
            self.config.max_streams_per_conn.max(1),
        ));
        // Unidirectional streams carry nothing in this tunnel.
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));
        if self.config.congestion.use_hy {
            transport.congestion_controller_factory(Arc::new(
                quinn::congestion::BbrConfig::default(),
            ));
        }
        server_cfg.transport_config(Arc::new(transport));

        let socket = std::net::UdpSocket::bind(self.config.listen)?;
        let runtime = quinn::default_runtime()
            .ok_or_else(|| DialError::Other("no async runtime for quic".into()))?;
        let endpoint = Endpoint::new(endpoint_config(), Some(server_cfg), socket, runtime)
            .map_err(|e| DialError::Other(format!("quic endpoint: {e}")))?;

        let (tx, rx) = mpsc::channel::<IoStream>(16);
        let accept_endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let conn = match tokio::time::timeout(HANDSHAKE_TIMEOUT, incoming).await {
                        Ok(Ok(c)) => c,
                        Ok(Err(e)) => {
                            warn!(error = %e, "quic: incoming handshake failed");
                            return;
                        }
                        Err(_) => {
                            warn!("quic: incoming handshake timeout");
                            return;
                        }
                    };
                    debug!(remote = %conn.remote_address(), "quic: session established");
                    loop {
                        match conn.accept_bi().await {
                            Ok((send, recv)) => {
                                let stream: IoStream =
                                    Box::new(QuicStreamAdapter::new_plain(send, recv));
                                if tx.send(stream).await.is_err() {
                                    conn.close(VarInt::from_u32(0), b"");
                                    return;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "quic: session ended");
                                return;
                            }
                        }
                    }
                });
            }
        });
        Ok((rx, endpoint))
    }
}

fn rustls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<rustls::ServerConfig, DialError> {
    use rustls_pki_types::{CertificateDer, PrivateKeyDer};
    use std::io::BufReader;
    let f = std::fs::File::open(cert_path)?;
    let mut rd = BufReader::new(f);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut rd)
        .collect::<Result<_, _>>()
        .map_err(|e| DialError::Tls(format!("read certs {cert_path}: {e}")))?;
    let f = std::fs::File::open(key_path)?;
    let mut rd = BufReader::new(f);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut rd)
        .map_err(|e| DialError::Tls(format!("read key {key_path}: {e}")))?
        .ok_or_else(|| DialError::Tls(format!("no private key in {key_path}")))?;
    // QUIC requires TLS 1.3.
    rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DialError::Tls(format!("quic server config: {e}")))
}

/// Stream adapter over a quinn bidi pair. Client streams carry a
/// non-owning back-reference used only to keep the pool's stream counter
/// honest; the pool remains authoritative for session lifetime.
pub struct QuicStreamAdapter {
    send: SendStream,
    recv: RecvStream,
    /// `(session_id, opened-stream counter)`; not an owning handle.
    _session: Option<([u8; 16], Arc<AtomicI32>)>,
}

impl QuicStreamAdapter {
    fn new(send: SendStream, recv: RecvStream, id: [u8; 16], counter: Arc<AtomicI32>) -> Self {
        Self {
            send,
            recv,
            _session: Some((id, counter)),
        }
    }

    fn new_plain(send: SendStream, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            _session: None,
        }
    }
}

impl AsyncRead for QuicStreamAdapter {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStreamAdapter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.send)
            .poll_write(cx, buf)
            .map_err(std::io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_flush(cx)
            .map_err(std::io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_shutdown(cx)
            .map_err(std::io::Error::other)
    }
}

/// Parse the QUIC-specific `extra` config keys.
pub fn congestion_from_extra(extra: &toml::value::Table) -> (CongestionArgs, Option<u32>) {
    let mut args = CongestionArgs::default();
    let max_streams = extra
        .get("maxStreamsInOneConn")
        .and_then(|v| v.as_integer())
        .filter(|v| *v > 0)
        .map(|v| v as u32);
    if extra.get("congestion_control").and_then(|v| v.as_str()) == Some("hy") {
        args.use_hy = true;
        args.hy_mbps = extra
            .get("mbps")
            .and_then(|v| v.as_integer())
            .filter(|v| *v > 1)
            .map(|v| v as u64)
            .unwrap_or(100);
        args.hy_manual = extra
            .get("hy_manual")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
    }
    (args, max_streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_parsing() {
        let mut t = toml::value::Table::new();
        t.insert("maxStreamsInOneConn".into(), toml::Value::Integer(8));
        t.insert("congestion_control".into(), toml::Value::String("hy".into()));
        t.insert("mbps".into(), toml::Value::Integer(50));
        t.insert("hy_manual".into(), toml::Value::Boolean(true));
        let (args, max) = congestion_from_extra(&t);
        assert!(args.use_hy);
        assert_eq!(args.hy_mbps, 50);
        assert!(args.hy_manual);
        assert_eq!(max, Some(8));
    }

    #[test]
    fn extra_defaults() {
        let t = toml::value::Table::new();
        let (args, max) = congestion_from_extra(&t);
        assert!(!args.use_hy);
        assert_eq!(max, None);
    }
}
