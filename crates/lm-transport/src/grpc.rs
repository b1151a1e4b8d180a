//! gRPC-shaped carrier: the multiplex-per-connection advanced layer.
//!
//! One underlying conn carries many logical substreams as HTTP/2 request
//! streams. Requests matching `POST /<service-name>` with content-type
//! `application/grpc` (and any configured custom headers) become
//! substreams; everything else is surfaced as a fallback meta. Substream
//! payload uses gRPC wire framing: a zero flag byte plus a u32-be length
//! prefix per message, flushed after every buffer.

use crate::advanced::{AdvCapabilities, FallbackMeta, H2FallbackRequest};
use crate::dialer::{DialError, IoStream};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub const CONTENT_TYPE: &str = "application/grpc";
const FRAME_HEADER_LEN: usize = 5;
const CHANNEL_DEPTH: usize = 10;

pub const CAPABILITIES: AdvCapabilities = AdvCapabilities {
    is_super: false,
    is_mux: true,
    can_handle_headers: true,
};

#[derive(Debug, Clone)]
pub struct GrpcServerConfig {
    pub service_name: String,
    /// Custom request headers that must all match by value.
    pub required_headers: Vec<(String, String)>,
    /// Serialize mismatched requests to HTTP/1 bytes instead of keeping
    /// the H2 request object.
    pub fallback_to_h1: bool,
}

pub struct GrpcServer {
    config: GrpcServerConfig,
}

impl GrpcServer {
    pub fn new(config: GrpcServerConfig) -> Self {
        Self { config }
    }

    pub fn service_path(&self) -> String {
        format!("/{}", self.config.service_name)
    }

    /// Run the HTTP/2 server over `conn`, delivering matched substreams on
    /// `sub_tx` and mismatches on `fb_tx`. Returns when the underlying
    /// conn dies; both channels close with it.
    pub async fn start_handle(
        &self,
        conn: IoStream,
        sub_tx: mpsc::Sender<IoStream>,
        fb_tx: mpsc::Sender<FallbackMeta>,
    ) {
        let want_path = self.service_path();
        let required = self.config.required_headers.clone();
        let fallback_to_h1 = self.config.fallback_to_h1;

        let mut h2conn = match h2::server::Builder::new()
            .max_concurrent_streams(256)
            .handshake::<_, Bytes>(conn)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "grpc: server handshake failed");
                return;
            }
        };

        while let Some(result) = h2conn.accept().await {
            let (request, mut respond) = match result {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "grpc: accept ended");
                    break;
                }
            };

            let path = request.uri().path().to_string();
            let method = request.method().clone();
            let content_type = request
                .headers()
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let mut matched = path == want_path && content_type == CONTENT_TYPE;
            if matched {
                for (k, want) in &required {
                    let got = request.headers().get(k.as_str()).and_then(|v| v.to_str().ok());
                    if got != Some(want.as_str()) {
                        warn!(header = %k, got = ?got, "grpc: custom header mismatch");
                        matched = false;
                        break;
                    }
                }
            }

            if !matched {
                debug!(%path, %method, %content_type, "grpc: request rejected, will fall back");
                let (parts, body) = request.into_parts();
                let meta = if fallback_to_h1 {
                    let h1 = serialize_h1_request(&parts);
                    FallbackMeta {
                        path,
                        method: method.to_string(),
                        conn: Box::new(H2RespondStream::new(body, respond)),
                        h1_request_buf: Some(h1),
                        is_h2: false,
                        h2_request: None,
                    }
                } else {
                    // The respond handle travels with the request; the
                    // fallback engine answers through it after its H2C
                    // round-trip.
                    FallbackMeta {
                        path: path.clone(),
                        method: method.to_string(),
                        conn: Box::new(NullStream),
                        h1_request_buf: None,
                        is_h2: true,
                        h2_request: Some(H2FallbackRequest {
                            parts,
                            body,
                            respond,
                        }),
                    }
                };
                if fb_tx.send(meta).await.is_err() {
                    break;
                }
                continue;
            }

            let response = http::Response::builder()
                .status(http::StatusCode::OK)
                .header(http::header::CONTENT_TYPE, CONTENT_TYPE)
                .body(())
                .expect("static response");
            let send = match respond.send_response(response, false) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "grpc: send_response failed");
                    continue;
                }
            };
            let sub: IoStream = Box::new(GrpcFramedStream::new(send, request.into_body()));
            if sub_tx.send(sub).await.is_err() {
                break;
            }
        }
        debug!("grpc: server conn finished");
    }
}

fn serialize_h1_request(parts: &http::request::Parts) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", parts.method, path).as_bytes());
    for (k, v) in &parts.headers {
        out.extend_from_slice(k.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(v.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Placeholder stream for H2 fallback metas: the real plumbing is the
/// request/respond pair carried alongside.
struct NullStream;

impl AsyncRead for NullStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NullStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Bidirectional stream over a mismatched H2 request: reads drain the
/// request body, writes answer through the response (headers sent on the
/// first write). Used for the H1-style fallback replay.
pub struct H2RespondStream {
    body: RecvStream,
    respond: h2::server::SendResponse<Bytes>,
    send: Option<SendStream<Bytes>>,
    read_buf: Bytes,
    staged: Option<Bytes>,
    staged_len: usize,
}

impl H2RespondStream {
    pub fn new(body: RecvStream, respond: h2::server::SendResponse<Bytes>) -> Self {
        Self {
            body,
            respond,
            send: None,
            read_buf: Bytes::new(),
            staged: None,
            staged_len: 0,
        }
    }

    fn ensure_send(&mut self) -> std::io::Result<()> {
        if self.send.is_none() {
            let response = http::Response::builder()
                .status(http::StatusCode::OK)
                .body(())
                .expect("static response");
            let s = self
                .respond
                .send_response(response, false)
                .map_err(|e| std::io::Error::other(format!("h2 respond: {e}")))?;
            self.send = Some(s);
        }
        Ok(())
    }
}

impl AsyncRead for H2RespondStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        match self.body.poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let _ = self.body.flow_control().release_capacity(data.len());
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Err(std::io::Error::other(format!("h2 body: {e}"))))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for H2RespondStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.ensure_send()?;
        if self.staged.is_none() {
            self.staged = Some(Bytes::copy_from_slice(buf));
            self.staged_len = buf.len();
        }
        let this = self.get_mut();
        let send = this.send.as_mut().expect("send initialized");
        match drain_staged(send, &mut this.staged, cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(this.staged_len)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if let Some(send) = self.send.as_mut() {
            let _ = send.send_data(Bytes::new(), true);
        }
        Poll::Ready(Ok(()))
    }
}

/// Queue `staged` into `send` respecting h2 flow-control capacity.
fn drain_staged(
    send: &mut SendStream<Bytes>,
    staged: &mut Option<Bytes>,
    cx: &mut Context<'_>,
) -> Poll<std::io::Result<()>> {
    while let Some(data) = staged.as_mut() {
        if data.is_empty() {
            *staged = None;
            break;
        }
        send.reserve_capacity(data.len());
        match send.poll_capacity(cx) {
            Poll::Ready(Some(Ok(cap))) => {
                let n = cap.min(data.len());
                let chunk = data.split_to(n);
                send.send_data(chunk, false)
                    .map_err(|e| std::io::Error::other(format!("h2 send: {e}")))?;
            }
            Poll::Ready(Some(Err(e))) => {
                return Poll::Ready(Err(std::io::Error::other(format!("h2 capacity: {e}"))))
            }
            Poll::Ready(None) => {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "h2 stream closed",
                )))
            }
            Poll::Pending => return Poll::Pending,
        }
    }
    Poll::Ready(Ok(()))
}

/// Substream adapter speaking gRPC wire framing in both directions.
pub struct GrpcFramedStream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    /// Decoded payload ready for the reader.
    pending: BytesMut,
    /// Partial frame header collected across data chunks.
    header: BytesMut,
    /// Payload bytes still expected for the current frame.
    frame_remaining: usize,
    staged: Option<Bytes>,
    staged_len: usize,
}

impl GrpcFramedStream {
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            pending: BytesMut::new(),
            header: BytesMut::with_capacity(FRAME_HEADER_LEN),
            frame_remaining: 0,
            staged: None,
            staged_len: 0,
        }
    }

    fn decode_chunk(&mut self, mut data: Bytes) {
        while !data.is_empty() {
            if self.frame_remaining > 0 {
                let n = self.frame_remaining.min(data.len());
                self.pending.extend_from_slice(&data[..n]);
                data.advance(n);
                self.frame_remaining -= n;
                continue;
            }
            let need = FRAME_HEADER_LEN - self.header.len();
            let n = need.min(data.len());
            self.header.extend_from_slice(&data[..n]);
            data.advance(n);
            if self.header.len() == FRAME_HEADER_LEN {
                // Flag byte ignored; no compression in this tunnel.
                let len = u32::from_be_bytes([
                    self.header[1],
                    self.header[2],
                    self.header[3],
                    self.header[4],
                ]) as usize;
                self.frame_remaining = len;
                self.header.clear();
            }
        }
    }
}

fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.put_u8(0);
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
    out.freeze()
}

impl AsyncRead for GrpcFramedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    let _ = self.recv.flow_control().release_capacity(data.len());
                    self.decode_chunk(data);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(format!("grpc read: {e}"))))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for GrpcFramedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.staged.is_none() {
            self.staged = Some(encode_frame(buf));
            self.staged_len = buf.len();
        }
        let this = self.get_mut();
        match drain_staged(&mut this.send, &mut this.staged, cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(this.staged_len)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Every frame is handed to h2 as soon as capacity allows.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

/// Client side: one HTTP/2 transport per outbound client, created over a
/// conn dialed by the carrier stack; substreams opened on demand.
pub struct GrpcClient {
    pub service_name: String,
    /// `:authority` / Host for substream requests, `host:port` of the
    /// dial target when empty.
    pub authority: String,
    transport: Arc<Mutex<Option<SendRequest<Bytes>>>>,
}

impl GrpcClient {
    pub fn new(service_name: String, authority: String) -> Self {
        Self {
            service_name,
            authority,
            transport: Arc::new(Mutex::new(None)),
        }
    }

    /// The pooled transport, if one is alive.
    pub async fn get_pooled(&self) -> Option<SendRequest<Bytes>> {
        let guard = self.transport.lock().await;
        if guard.is_some() {
            debug!("grpc: reuse pooled transport");
        }
        guard.clone()
    }

    /// Install a new transport over a freshly dialed carrier conn.
    pub async fn new_transport(&self, conn: IoStream) -> Result<SendRequest<Bytes>, DialError> {
        let (send_request, connection) = h2::client::handshake(conn)
            .await
            .map_err(|e| DialError::Other(format!("h2 handshake: {e}")))?;
        let slot = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "grpc: client conn ended");
            }
            *slot.lock().await = None;
        });
        *self.transport.lock().await = Some(send_request.clone());
        Ok(send_request)
    }

    /// Open a new substream over `common`.
    pub async fn dial_sub_conn(
        &self,
        common: &SendRequest<Bytes>,
    ) -> Result<IoStream, DialError> {
        let mut sr = common
            .clone()
            .ready()
            .await
            .map_err(|e| DialError::Other(format!("h2 not ready: {e}")))?;
        let uri = format!("http://{}/{}", self.authority, self.service_name);
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, CONTENT_TYPE)
            .header("te", "trailers")
            .body(())
            .map_err(|e| DialError::Other(format!("grpc request: {e}")))?;
        let (response, send) = sr
            .send_request(request, false)
            .map_err(|e| DialError::Other(format!("grpc open stream: {e}")))?;
        let response = response
            .await
            .map_err(|e| DialError::Other(format!("grpc response: {e}")))?;
        if !response.status().is_success() {
            return Err(DialError::Other(format!(
                "grpc upstream status {}",
                response.status()
            )));
        }
        Ok(Box::new(GrpcFramedStream::new(send, response.into_body())))
    }

    /// Drop the pooled transport after a failed stream open so the next
    /// dial starts a new one.
    pub async fn invalidate(&self) {
        *self.transport.lock().await = None;
    }
}

pub fn bounded_channels() -> (
    mpsc::Sender<IoStream>,
    mpsc::Receiver<IoStream>,
    mpsc::Sender<FallbackMeta>,
    mpsc::Receiver<FallbackMeta>,
) {
    let (sub_tx, sub_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (fb_tx, fb_rx) = mpsc::channel(CHANNEL_DEPTH);
    (sub_tx, sub_rx, fb_tx, fb_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encode_shape() {
        let f = encode_frame(b"abc");
        assert_eq!(&f[..], &[0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn frame_decode_across_chunks() {
        // Build a framed stream decoder and feed it split chunks.
        let frame = encode_frame(b"hello world");
        let (a, b) = frame.split_at(3);
        // Feed through the decoder state machine without real h2 plumbing.
        struct Probe {
            pending: BytesMut,
            header: BytesMut,
            frame_remaining: usize,
        }
        impl Probe {
            fn push(&mut self, mut data: Bytes) {
                while !data.is_empty() {
                    if self.frame_remaining > 0 {
                        let n = self.frame_remaining.min(data.len());
                        self.pending.extend_from_slice(&data[..n]);
                        data.advance(n);
                        self.frame_remaining -= n;
                        continue;
                    }
                    let need = FRAME_HEADER_LEN - self.header.len();
                    let n = need.min(data.len());
                    self.header.extend_from_slice(&data[..n]);
                    data.advance(n);
                    if self.header.len() == FRAME_HEADER_LEN {
                        let len = u32::from_be_bytes([
                            self.header[1],
                            self.header[2],
                            self.header[3],
                            self.header[4],
                        ]) as usize;
                        self.frame_remaining = len;
                        self.header.clear();
                    }
                }
            }
        }
        let mut p = Probe {
            pending: BytesMut::new(),
            header: BytesMut::new(),
            frame_remaining: 0,
        };
        p.push(Bytes::copy_from_slice(a));
        p.push(Bytes::copy_from_slice(b));
        assert_eq!(&p.pending[..], b"hello world");
    }

    #[test]
    fn h1_serialization_includes_headers() {
        let req = http::Request::builder()
            .method("POST")
            .uri("https://example.com/wrong-path?q=1")
            .header("content-type", "text/plain")
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();
        let bytes = serialize_h1_request(&parts);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /wrong-path?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
