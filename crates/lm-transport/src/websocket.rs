//! WebSocket carrier: the single-stream advanced layer.
//!
//! The server side performs the HTTP upgrade by hand so that a rejected
//! request keeps its raw bytes for fallback; accepted connections are
//! handed to tungstenite in server role. The client supports an
//! early-data preamble carried base64url-encoded in the
//! `Sec-WebSocket-Protocol` header of the upgrade request.

use crate::advanced::{AdvCapabilities, FallbackMeta, SingleAcceptError, MAX_EARLY_DATA_LEN};
use crate::dialer::{DialError, Dialer, IoStream};
use crate::util::ReplayStream;
use base64::Engine;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig as TungsteniteConfig};
use tokio_tungstenite::WebSocketStream as TungsteniteStream;
use tracing::{debug, warn};

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const EARLY_DATA_HEADER: &str = "sec-websocket-protocol";

pub const CAPABILITIES: AdvCapabilities = AdvCapabilities {
    is_super: false,
    is_mux: false,
    can_handle_headers: true,
};

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub path: String,
    /// Extra request headers that must match by value when configured.
    pub required_headers: Vec<(String, String)>,
    pub accept_early_data: bool,
}

pub struct WsServer {
    config: WsServerConfig,
}

impl WsServer {
    pub fn new(config: WsServerConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Accept one upgrade on `conn`. A path or header mismatch yields
    /// [`SingleAcceptError::ShouldFallback`] carrying the raw request.
    pub async fn handshake(&self, mut conn: IoStream) -> Result<IoStream, SingleAcceptError> {
        let mut raw = BytesMut::with_capacity(512);
        let mut tmp = [0u8; 512];
        let head_len = loop {
            let n = conn.read(&mut tmp).await?;
            if n == 0 {
                return Err(SingleAcceptError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "closed during upgrade",
                )));
            }
            raw.extend_from_slice(&tmp[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if raw.len() > MAX_REQUEST_HEAD {
                return Err(SingleAcceptError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "upgrade request too large",
                )));
            }
        };

        let mut headers = [httparse::EMPTY_HEADER; 48];
        let mut req = httparse::Request::new(&mut headers);
        let parsed = req.parse(&raw[..head_len]).map_err(|e| {
            SingleAcceptError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad upgrade request: {e}"),
            ))
        })?;
        if parsed.is_partial() {
            return Err(SingleAcceptError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated upgrade request",
            )));
        }

        let method = req.method.unwrap_or("").to_string();
        let path = req.path.unwrap_or("").to_string();
        let header = |name: &str| -> Option<&[u8]> {
            req.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value)
        };

        let mut ok = method == "GET" && path == self.config.path;
        if ok {
            ok = header("upgrade")
                .map(|v| v.eq_ignore_ascii_case(b"websocket"))
                .unwrap_or(false);
        }
        if ok {
            for (k, want) in &self.config.required_headers {
                let got = header(k).map(|v| String::from_utf8_lossy(v).into_owned());
                if got.as_deref() != Some(want.as_str()) {
                    warn!(header = %k, got = ?got, "ws: required header mismatch");
                    ok = false;
                    break;
                }
            }
        }

        let ws_key = header("sec-websocket-key").map(|v| v.to_vec());
        if !ok || ws_key.is_none() {
            debug!(%method, %path, valid = %self.config.path, "ws: upgrade check failed, will fall back");
            // The head goes into the first-payload buffer; the conn only
            // replays bytes that arrived after it. Splitting this way keeps
            // the replay order intact without duplicating the head.
            let leftover = raw.split_off(head_len);
            let h1_buf = raw.to_vec();
            return Err(SingleAcceptError::ShouldFallback(Box::new(FallbackMeta {
                path,
                method,
                conn: Box::new(ReplayStream::new(leftover, conn)),
                h1_request_buf: Some(h1_buf),
                is_h2: false,
                h2_request: None,
            })));
        }

        // Early data rides in on the protocol header, base64url encoded.
        let early = if self.config.accept_early_data {
            header(EARLY_DATA_HEADER)
                .and_then(|v| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(v).ok())
                .filter(|d| d.len() <= MAX_EARLY_DATA_LEN)
        } else {
            None
        };

        let accept = derive_accept_key(&ws_key.unwrap_or_default());
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        conn.write_all(response.as_bytes()).await?;

        let leftover = raw.split_off(head_len);
        let stream = ReplayStream::new(leftover, conn);
        let ws = TungsteniteStream::from_raw_socket(stream, Role::Server, Some(ws_config())).await;
        let mut adapter = WsStreamAdapter::new(ws);
        if let Some(ed) = early {
            debug!(len = ed.len(), "ws: server got early data");
            adapter.read_buffer = ed;
        }
        Ok(Box::new(adapter))
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub path: String,
    /// Host header; falls back to the dialed host when empty.
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub early_data: bool,
}

pub struct WsClient {
    config: WsClientConfig,
    inner: Box<dyn Dialer>,
}

impl WsClient {
    pub fn new(config: WsClientConfig, inner: Box<dyn Dialer>) -> Self {
        Self { config, inner }
    }

    pub fn is_early(&self) -> bool {
        self.config.early_data
    }

    /// Dial the stack below and upgrade, optionally carrying `early_data`
    /// inside the request.
    pub async fn handshake(
        &self,
        host: &str,
        port: u16,
        early_data: &[u8],
    ) -> Result<IoStream, DialError> {
        let stream = self.inner.connect(host, port).await?;
        self.upgrade_on(stream, host, port, early_data).await
    }

    /// Upgrade on an already-established stream (used when an outer layer
    /// dialed for us).
    pub async fn upgrade_on(
        &self,
        stream: IoStream,
        host: &str,
        port: u16,
        early_data: &[u8],
    ) -> Result<IoStream, DialError> {
        let host_header = if self.config.host.is_empty() {
            host
        } else {
            &self.config.host
        };
        let uri = format!("ws://{host}:{port}{}", self.config.path);
        let mut builder = http::Request::get(uri.as_str())
            .header("Host", host_header)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Sec-WebSocket-Version", "13");
        for (k, v) in &self.config.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if !early_data.is_empty() {
            let ed = &early_data[..early_data.len().min(MAX_EARLY_DATA_LEN)];
            builder = builder.header(
                "Sec-WebSocket-Protocol",
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(ed),
            );
        }
        let request = builder
            .body(())
            .map_err(|e| DialError::Other(format!("ws request: {e}")))?;

        let (ws, response) =
            tokio_tungstenite::client_async_with_config(request, stream, Some(ws_config()))
                .await
                .map_err(|e| DialError::Other(format!("ws handshake: {e}")))?;
        debug!(status = %response.status(), "ws: client upgrade done");
        Ok(Box::new(WsStreamAdapter::new(ws)))
    }
}

fn ws_config() -> TungsteniteConfig {
    let mut cfg = TungsteniteConfig::default();
    cfg.max_message_size = Some(64 * 1024 * 1024);
    cfg.max_frame_size = Some(16 * 1024 * 1024);
    cfg
}

fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Adapter exposing a tungstenite stream as plain bytes: reads drain
/// binary frames, writes emit one binary frame each.
pub struct WsStreamAdapter<S> {
    inner: TungsteniteStream<S>,
    read_buffer: Vec<u8>,
    read_offset: usize,
}

impl<S> WsStreamAdapter<S> {
    fn new(inner: TungsteniteStream<S>) -> Self {
        Self {
            inner,
            read_buffer: Vec::new(),
            read_offset: 0,
        }
    }
}

impl<S> AsyncRead for WsStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_offset < self.read_buffer.len() {
            let remaining = &self.read_buffer[self.read_offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.read_offset += n;
            if self.read_offset >= self.read_buffer.len() {
                self.read_buffer.clear();
                self.read_offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    use tokio_tungstenite::tungstenite::Message;
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Close(_) => return Poll::Ready(Ok(())),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Frame(_) => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "unexpected raw frame",
                            )))
                        }
                    };
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        self.read_buffer = data[n..].to_vec();
                        self.read_offset = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(format!("ws read: {e}"))))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        use tokio_tungstenite::tungstenite::Message;
        match self.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => {
                match self.inner.start_send_unpin(Message::Binary(buf.to_vec())) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(std::io::Error::other(format!("ws send: {e}")))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(format!("ws: {e}")))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner
            .poll_flush_unpin(cx)
            .map_err(|e| std::io::Error::other(format!("ws flush: {e}")))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner
            .poll_close_unpin(cx)
            .map_err(|e| std::io::Error::other(format!("ws close: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::FnDialer;
    use tokio::io::duplex;

    fn server(path: &str) -> WsServer {
        WsServer::new(WsServerConfig {
            path: path.into(),
            required_headers: vec![],
            accept_early_data: true,
        })
    }

    #[tokio::test]
    async fn upgrade_and_relay_frames() {
        let (client_end, server_end) = duplex(16 * 1024);
        let srv = server("/tunnel");

        let server_task = tokio::spawn(async move {
            let mut conn = srv.handshake(Box::new(server_end)).await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"early");
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"more");
            conn.write_all(b"reply").await.unwrap();
        });

        let client_end = std::sync::Mutex::new(Some(client_end));
        let dialer = FnDialer::new(move |_h: &str, _p: u16| {
            let s = client_end.lock().unwrap().take().unwrap();
            Box::pin(async move { Ok(Box::new(s) as IoStream) })
                as std::pin::Pin<
                    Box<dyn std::future::Future<Output = Result<IoStream, DialError>> + Send>,
                >
        });
        let client = WsClient::new(
            WsClientConfig {
                path: "/tunnel".into(),
                host: String::new(),
                headers: vec![],
                early_data: true,
            },
            Box::new(dialer),
        );

        let mut conn = client.handshake("example.com", 443, b"early").await.unwrap();
        conn.write_all(b"more").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_path_falls_back_with_request_bytes() {
        let (mut client_end, server_end) = duplex(8 * 1024);
        let srv = server("/tunnel");
        let raw = b"GET /other HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nSec-WebSocket-Key: aaaa\r\n\r\n";
        client_end.write_all(raw).await.unwrap();

        match srv.handshake(Box::new(server_end)).await {
            Err(SingleAcceptError::ShouldFallback(meta)) => {
                assert_eq!(meta.path, "/other");
                assert_eq!(meta.method, "GET");
                assert_eq!(meta.h1_request_buf.as_deref(), Some(&raw[..]));
                assert!(!meta.is_h2);
            }
            other => panic!("expected fallback, got {:?}", other.map(|_| ())),
        }
    }
}
