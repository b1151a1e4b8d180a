//! Trojan outbound. The request has no reply, so the first payload rides
//! in the same write as the header.

use crate::inbound::trojan::{password_hash, TrojanUdpConn, CMD_CONNECT, CMD_UDP_ASSOCIATE};
use async_trait::async_trait;
use bytes::BytesMut;
use lm_core::address::write_socks_addr;
use lm_core::proxy::{MsgConn, ProxyClient};
use lm_core::Address;
use lm_transport::IoStream;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub struct TrojanClient {
    hash: String,
    use_mux: bool,
}

impl TrojanClient {
    pub fn new(password: &str, use_mux: bool) -> Self {
        Self {
            hash: password_hash(password),
            use_mux,
        }
    }

    fn request(&self, cmd: u8, target: &Address, first_payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(64 + first_payload.len());
        out.extend_from_slice(self.hash.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&[cmd]);
        write_socks_addr(&mut out, target);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(first_payload);
        out
    }
}

#[async_trait]
impl ProxyClient for TrojanClient {
    fn name(&self) -> &'static str {
        "trojan"
    }

    fn inner_mux_kind(&self) -> u8 {
        if self.use_mux {
            2
        } else {
            0
        }
    }

    fn inner_mux_protocol(&self) -> Option<&'static str> {
        Some("simplesocks")
    }

    async fn handshake(
        &self,
        mut conn: IoStream,
        first_payload: &[u8],
        target: &Address,
    ) -> std::io::Result<IoStream> {
        // With inner mux enabled the outer request announces the mux
        // session; the real targets travel per-stream inside it.
        let req = if self.use_mux {
            let mux_addr = Address::from_host_port(lm_core::Network::Tcp, "mux", 0);
            self.request(crate::inbound::trojan::CMD_MUX, &mux_addr, &[])
        } else {
            self.request(CMD_CONNECT, target, first_payload)
        };
        conn.write_all(&req).await?;
        conn.flush().await?;
        Ok(conn)
    }

    async fn establish_udp(
        &self,
        conn: Option<IoStream>,
        target: &Address,
    ) -> std::io::Result<Arc<dyn MsgConn>> {
        let mut conn = conn.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "trojan udp needs a stream")
        })?;
        let req = self.request(CMD_UDP_ASSOCIATE, target, &[]);
        conn.write_all(&req).await?;
        conn.flush().await?;
        Ok(Arc::new(TrojanUdpConn::new(conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::Network;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn request_layout() {
        let (client_end, mut server) = duplex(1024);
        let c = TrojanClient::new("hunter2", false);
        let target = Address::from_host_port(Network::Tcp, "example.com", 443);
        let task = tokio::spawn(async move {
            c.handshake(Box::new(client_end), b"first", &target).await
        });

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        let got = &buf[..n];
        assert_eq!(&got[..56], password_hash("hunter2").as_bytes());
        assert_eq!(&got[56..58], b"\r\n");
        assert_eq!(got[58], CMD_CONNECT);
        assert_eq!(&got[n - 7..n - 5], b"\r\n");
        assert_eq!(&got[n - 5..], b"first");
        task.await.unwrap().unwrap();
    }

    #[test]
    fn mux_kind_follows_config() {
        assert_eq!(TrojanClient::new("p", true).inner_mux_kind(), 2);
        assert_eq!(TrojanClient::new("p", false).inner_mux_kind(), 0);
        assert_eq!(
            TrojanClient::new("p", true).inner_mux_protocol(),
            Some("simplesocks")
        );
    }
}
