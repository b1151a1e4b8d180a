//! H2C transports for the gRPC fallback path.
//!
//! When an HTTP/2 ingress request misses the gRPC service check, the
//! original request is replayed against the fallback upstream over
//! cleartext HTTP/2 (prior knowledge), optionally prefixed with a PROXY
//! protocol preamble. One transport is kept per fallback address.

use crate::advanced::H2FallbackRequest;
use bytes::Bytes;
use futures::future::poll_fn;
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Process-wide cache of H2C transports keyed by
/// `(fallback_addr, proxy_protocol_version)`.
#[derive(Default)]
pub struct H2cTransportMap {
    map: RwLock<HashMap<(String, u8), SendRequest<Bytes>>>,
}

impl H2cTransportMap {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_dial(
        &self,
        addr: &str,
        xver: u8,
        preamble: Option<Bytes>,
    ) -> std::io::Result<SendRequest<Bytes>> {
        let key = (addr.to_string(), xver);
        {
            let map = self.map.read().await;
            if let Some(sr) = map.get(&key) {
                return Ok(sr.clone());
            }
        }

        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        if let Some(pre) = preamble {
            stream.write_all(&pre).await?;
        }
        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| std::io::Error::other(format!("h2c handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "h2c: transport ended");
            }
        });

        let mut map = self.map.write().await;
        map.insert(key, send_request.clone());
        Ok(send_request)
    }

    /// Evict a transport after a failed round trip so the next fallback
    /// redials.
    pub async fn evict(&self, addr: &str, xver: u8) {
        self.map.write().await.remove(&(addr.to_string(), xver));
    }

    /// Replay `request` against `fallback_addr` and stream the response
    /// back to the original ingress client. Consumes the captured request;
    /// the ingress stream is finished when this returns.
    pub async fn round_trip(
        &self,
        fallback_addr: &str,
        xver: u8,
        preamble: Option<Bytes>,
        request: H2FallbackRequest,
        original_path: &str,
    ) -> std::io::Result<()> {
        let H2FallbackRequest {
            parts,
            body,
            mut respond,
        } = request;

        let sr = match self.get_or_dial(fallback_addr, xver, preamble).await {
            Ok(sr) => sr,
            Err(e) => {
                warn!(error = %e, addr = %fallback_addr, "h2c: dial failed");
                let _ = respond.send_reset(h2::Reason::REFUSED_STREAM);
                return Err(e);
            }
        };
        let mut sr = sr
            .ready()
            .await
            .map_err(|e| std::io::Error::other(format!("h2c not ready: {e}")))?;

        let uri = format!("https://{fallback_addr}{original_path}")
            .parse::<http::Uri>()
            .map_err(|e| std::io::Error::other(format!("h2c uri: {e}")))?;
        let mut builder = http::Request::builder().method(parts.method.clone()).uri(uri);
        for (k, v) in &parts.headers {
            if k != http::header::HOST {
                builder = builder.header(k, v);
            }
        }
        builder = builder.header(http::header::HOST, fallback_addr);
        let upstream_req = builder
            .body(())
            .map_err(|e| std::io::Error::other(format!("h2c request: {e}")))?;

        let (response, upstream_send) = sr
            .send_request(upstream_req, false)
            .map_err(|e| std::io::Error::other(format!("h2c send: {e}")))?;

        // Pump the original request body upstream while waiting for the
        // upstream response headers.
        let body_task = tokio::spawn(pipe_h2(body, upstream_send));

        let response = match response.await {
            Ok(r) => r,
            Err(e) => {
                self.evict(fallback_addr, xver).await;
                let _ = respond.send_reset(h2::Reason::REFUSED_STREAM);
                body_task.abort();
                return Err(std::io::Error::other(format!("h2c round trip: {e}")));
            }
        };

        let (rparts, rbody) = response.into_parts();
        let mut down = http::Response::builder().status(rparts.status);
        for (k, v) in &rparts.headers {
            down = down.header(k, v);
        }
        let down = down
            .body(())
            .map_err(|e| std::io::Error::other(format!("h2c response: {e}")))?;
        let ingress_send = respond
            .send_response(down, false)
            .map_err(|e| std::io::Error::other(format!("h2c respond: {e}")))?;

        pipe_h2(rbody, ingress_send).await?;
        let _ = body_task.await;
        Ok(())
    }
}

/// Copy an h2 receive stream into an h2 send stream, honoring both flow
/// controls, and end the stream when the source finishes.
async fn pipe_h2(mut from: RecvStream, mut to: SendStream<Bytes>) -> std::io::Result<()> {
    loop {
        let chunk = poll_fn(|cx| from.poll_data(cx)).await;
        match chunk {
            Some(Ok(mut data)) => {
                let _ = from.flow_control().release_capacity(data.len());
                while !data.is_empty() {
                    to.reserve_capacity(data.len());
                    let cap = poll_fn(|cx| to.poll_capacity(cx)).await;
                    match cap {
                        Some(Ok(n)) => {
                            let chunk = data.split_to(n.min(data.len()));
                            to.send_data(chunk, false)
                                .map_err(|e| std::io::Error::other(format!("h2 pipe: {e}")))?;
                        }
                        Some(Err(e)) => {
                            return Err(std::io::Error::other(format!("h2 pipe cap: {e}")))
                        }
                        None => {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::BrokenPipe,
                                "h2 pipe closed",
                            ))
                        }
                    }
                }
            }
            Some(Err(e)) => return Err(std::io::Error::other(format!("h2 pipe read: {e}"))),
            None => {
                let _ = to.send_data(Bytes::new(), true);
                return Ok(());
            }
        }
    }
}

/// Global instance used by the pipeline; initialized lazily.
pub fn global() -> &'static H2cTransportMap {
    static GLOBAL: std::sync::OnceLock<H2cTransportMap> = std::sync::OnceLock::new();
    GLOBAL.get_or_init(H2cTransportMap::new)
}
