//! Dokodemo-door inbound: no wire exchange at all. Every accepted conn
//! goes to the target fixed in configuration.

use crate::stream_util::StreamDatagramConn;
use async_trait::async_trait;
use lm_core::proxy::{ProxyServer, ServerHandshake};
use lm_core::{Address, HandshakeError};
use lm_transport::IoStream;

pub struct DokodemoServer {
    target: Address,
}

impl DokodemoServer {
    pub fn new(target: Address) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ProxyServer for DokodemoServer {
    fn name(&self) -> &'static str {
        "dokodemo"
    }

    async fn handshake(&self, conn: IoStream) -> Result<ServerHandshake, HandshakeError> {
        let target = self.target.clone();
        if target.is_udp() {
            // The accepted stream is treated as a datagram flow toward
            // the fixed target: each chunk is one message.
            return Ok(ServerHandshake::Udp {
                conn: std::sync::Arc::new(StreamDatagramConn::new(conn, target.clone())),
                target,
            });
        }
        Ok(ServerHandshake::Tcp {
            stream: conn,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::Network;
    use tokio::io::duplex;

    #[tokio::test]
    async fn fixed_target_no_bytes_consumed() {
        let (mut client, server_end) = duplex(1024);
        let srv = DokodemoServer::new(Address::parse_url("tcp://10.0.0.1:8443").unwrap());

        use tokio::io::AsyncWriteExt;
        client.write_all(b"raw").await.unwrap();

        match srv.handshake(Box::new(server_end)).await.unwrap() {
            ServerHandshake::Tcp { mut stream, target } => {
                assert_eq!(target.dial_string(), "10.0.0.1:8443");
                assert_eq!(target.network, Network::Tcp);
                let mut b = [0u8; 3];
                tokio::io::AsyncReadExt::read_exact(&mut stream, &mut b)
                    .await
                    .unwrap();
                assert_eq!(&b, b"raw");
            }
            _ => panic!("expected tcp"),
        }
    }
}
