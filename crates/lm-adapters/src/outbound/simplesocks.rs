//! SimpleSocks outbound, the client half of the inner-mux protocol.

use crate::inbound::trojan::{TrojanUdpConn, CMD_CONNECT, CMD_UDP_ASSOCIATE};
use async_trait::async_trait;
use bytes::BytesMut;
use lm_core::address::write_socks_addr;
use lm_core::proxy::{MsgConn, ProxyClient};
use lm_core::Address;
use lm_transport::IoStream;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub struct SimpleSocksClient;

impl SimpleSocksClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimpleSocksClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyClient for SimpleSocksClient {
    fn name(&self) -> &'static str {
        "simplesocks"
    }

    async fn handshake(
        &self,
        mut conn: IoStream,
        first_payload: &[u8],
        target: &Address,
    ) -> std::io::Result<IoStream> {
        let mut out = BytesMut::with_capacity(32 + first_payload.len());
        out.extend_from_slice(&[CMD_CONNECT]);
        write_socks_addr(&mut out, target);
        out.extend_from_slice(first_payload);
        conn.write_all(&out).await?;
        conn.flush().await?;
        Ok(conn)
    }

    async fn establish_udp(
        &self,
        conn: Option<IoStream>,
        target: &Address,
    ) -> std::io::Result<Arc<dyn MsgConn>> {
        let mut conn = conn.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "simplesocks udp needs a stream",
            )
        })?;
        let mut out = BytesMut::new();
        out.extend_from_slice(&[CMD_UDP_ASSOCIATE]);
        write_socks_addr(&mut out, target);
        conn.write_all(&out).await?;
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
        let (client_end, mut server) = duplex(256);
        let c = SimpleSocksClient::new();
        let target = Address::from_host_port(Network::Tcp, "a.b", 80);
        let task =
            tokio::spawn(async move { c.handshake(Box::new(client_end), b"pp", &target).await });

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], CMD_CONNECT);
        assert_eq!(buf[1], 0x03);
        assert_eq!(buf[2], 3);
        assert_eq!(&buf[3..6], b"a.b");
        assert_eq!(&buf[n - 2..n], b"pp");
        task.await.unwrap().unwrap();
    }
}
