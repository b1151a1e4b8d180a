//! SimpleSocks inbound: a trojan request without the hash, used as the
//! protocol inside inner-mux streams.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use lm_core::address::read_socks_addr;
use lm_core::proxy::{ProxyServer, ServerHandshake};
use lm_core::{HandshakeError, Network};
use lm_transport::{IoStream, ReplayStream};
use tokio::io::AsyncReadExt;

use super::trojan::{TrojanUdpConn, CMD_CONNECT, CMD_UDP_ASSOCIATE};

pub struct SimpleSocksServer;

impl SimpleSocksServer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimpleSocksServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyServer for SimpleSocksServer {
    fn name(&self) -> &'static str {
        "simplesocks"
    }

    async fn handshake(&self, mut conn: IoStream) -> Result<ServerHandshake, HandshakeError> {
        let mut buf = vec![0u8; 16 * 1024];
        let n = conn.read(&mut buf).await?;
        buf.truncate(n);
        if n < 1 + 1 + 6 {
            return Err(HandshakeError::reject(buf, "request too short", conn));
        }

        let mut rd = Bytes::copy_from_slice(&buf);
        let cmd = rd.get_u8();
        let is_udp = match cmd {
            CMD_CONNECT => false,
            CMD_UDP_ASSOCIATE => true,
            _ => return Err(HandshakeError::reject(buf, format!("cmd byte wrong: {cmd}"), conn)),
        };
        let network = if is_udp { Network::Udp } else { Network::Tcp };
        let Some(target) = read_socks_addr(&mut rd, network) else {
            return Err(HandshakeError::reject(buf, "malformed address", conn));
        };

        let leftover = BytesMut::from(&rd[..]);
        let stream: IoStream = Box::new(ReplayStream::new(leftover, conn));
        if is_udp {
            Ok(ServerHandshake::Udp {
                conn: std::sync::Arc::new(TrojanUdpConn::new(stream)),
                target,
            })
        } else {
            Ok(ServerHandshake::Tcp { stream, target })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::address::write_socks_addr;
    use lm_core::Address;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn connect_request() {
        let (mut client, server_end) = duplex(1024);
        let srv = SimpleSocksServer::new();
        let target = Address::from_host_port(Network::Tcp, "example.com", 80);
        let mut req = vec![CMD_CONNECT];
        write_socks_addr(&mut req, &target);
        req.extend_from_slice(b"data");
        client.write_all(&req).await.unwrap();

        match srv.handshake(Box::new(server_end)).await.unwrap() {
            ServerHandshake::Tcp { mut stream, target } => {
                assert_eq!(target.host.as_deref(), Some("example.com"));
                let mut b = [0u8; 4];
                stream.read_exact(&mut b).await.unwrap();
                assert_eq!(&b, b"data");
            }
            _ => panic!("expected tcp"),
        }
    }
}
