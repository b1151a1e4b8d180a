//! HTTP CONNECT outbound.

use async_trait::async_trait;
use bytes::BytesMut;
use lm_core::proxy::{MsgConn, ProxyClient};
use lm_core::Address;
use lm_transport::{IoStream, ReplayStream};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct HttpClient;

impl HttpClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyClient for HttpClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn handshake(
        &self,
        mut conn: IoStream,
        first_payload: &[u8],
        target: &Address,
    ) -> std::io::Result<IoStream> {
        let authority = target.host_port();
        let req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
        conn.write_all(req.as_bytes()).await?;
        conn.flush().await?;

        let mut raw = BytesMut::with_capacity(128);
        let mut tmp = [0u8; 256];
        let head_len = loop {
            let n = conn.read(&mut tmp).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "closed before connect reply",
                ));
            }
            raw.extend_from_slice(&tmp[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if raw.len() > 8 * 1024 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "connect reply too large",
                ));
            }
        };
        let head = String::from_utf8_lossy(&raw[..head_len]).into_owned();
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connect refused: {status}"),
            ));
        }

        let leftover = raw.split_off(head_len);
        let mut out: IoStream = Box::new(ReplayStream::new(leftover, conn));
        if !first_payload.is_empty() {
            out.write_all(first_payload).await?;
            out.flush().await?;
        }
        Ok(out)
    }

    async fn establish_udp(
        &self,
        _conn: Option<IoStream>,
        _target: &Address,
    ) -> std::io::Result<Arc<dyn MsgConn>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "http proxy has no udp",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::Network;
    use tokio::io::duplex;

    #[tokio::test]
    async fn connect_roundtrip() {
        let (client_end, mut server) = duplex(1024);
        let c = HttpClient::new();
        let target = Address::from_host_port(Network::Tcp, "example.com", 80);

        let task =
            tokio::spawn(async move { c.handshake(Box::new(client_end), b"GET", &target).await });

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        let req = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(req.starts_with("CONNECT example.com:80 HTTP/1.1\r\n"));

        server
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();
        let mut fp = [0u8; 3];
        server.read_exact(&mut fp).await.unwrap();
        assert_eq!(&fp, b"GET");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_2xx_fails() {
        let (client_end, mut server) = duplex(1024);
        let c = HttpClient::new();
        let target = Address::from_host_port(Network::Tcp, "example.com", 80);
        let task =
            tokio::spawn(async move { c.handshake(Box::new(client_end), &[], &target).await });
        let mut buf = vec![0u8; 256];
        let _ = server.read(&mut buf).await.unwrap();
        server
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
        assert!(task.await.unwrap().is_err());
    }
}
