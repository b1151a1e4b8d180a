//! HTTP CONNECT inbound. Anything that is not a CONNECT keeps its bytes
//! for fallback replay.

use async_trait::async_trait;
use bytes::BytesMut;
use lm_core::proxy::{ProxyServer, ServerHandshake};
use lm_core::{Address, HandshakeError, Network};
use lm_transport::{IoStream, ReplayStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAX_HEAD: usize = 8 * 1024;

pub struct HttpServer;

impl HttpServer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyServer for HttpServer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn handshake(&self, mut conn: IoStream) -> Result<ServerHandshake, HandshakeError> {
        let mut raw = BytesMut::with_capacity(256);
        let mut tmp = [0u8; 512];
        let head_len = loop {
            let n = conn.read(&mut tmp).await?;
            if n == 0 {
                return Err(HandshakeError::reject(raw.to_vec(), "closed before request", conn));
            }
            raw.extend_from_slice(&tmp[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if raw.len() > MAX_HEAD {
                return Err(HandshakeError::reject(raw.to_vec(), "request too large", conn));
            }
        };

        let head = String::from_utf8_lossy(&raw[..head_len]).into_owned();
        let mut first = head.split("\r\n").next().unwrap_or("").split_whitespace();
        let method = first.next().unwrap_or("");
        let authority = first.next().unwrap_or("");

        if !method.eq_ignore_ascii_case("CONNECT") {
            return Err(HandshakeError::reject(
                raw.to_vec(),
                format!("not a connect request: {method}"),
                conn,
            ));
        }
        let target = Address::parse(Network::Tcp, authority)
            .ok_or_else(|| HandshakeError::fatal(format!("bad connect target {authority}")))?;

        conn.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        conn.flush().await?;

        let leftover = raw.split_off(head_len);
        Ok(ServerHandshake::Tcp {
            stream: Box::new(ReplayStream::new(leftover, conn)),
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn connect_ok() {
        let (mut client, server_end) = duplex(1024);
        let srv = HttpServer::new();
        let task = tokio::spawn(async move { srv.handshake(Box::new(server_end)).await });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly")
            .await
            .unwrap();
        let mut buf = [0u8; 39];
        client.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 200"));

        match task.await.unwrap().unwrap() {
            ServerHandshake::Tcp { mut stream, target } => {
                assert_eq!(target.host.as_deref(), Some("example.com"));
                assert_eq!(target.port, 443);
                let mut b = [0u8; 5];
                stream.read_exact(&mut b).await.unwrap();
                assert_eq!(&b, b"early");
            }
            _ => panic!("expected tcp"),
        }
    }

    #[tokio::test]
    async fn get_request_is_replayable_reject() {
        let (mut client, server_end) = duplex(1024);
        let srv = HttpServer::new();
        let task = tokio::spawn(async move { srv.handshake(Box::new(server_end)).await });
        let req = b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n";
        client.write_all(req).await.unwrap();
        match task.await.unwrap() {
            Err(HandshakeError::Reject { buf, .. }) => assert_eq!(&buf, req),
            other => panic!("expected reject, got {:?}", other.err()),
        }
    }
}
