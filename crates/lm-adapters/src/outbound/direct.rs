//! Direct outbound: no protocol of its own. TCP passes the dialed stream
//! through untouched (after flushing any first payload); UDP opens its
//! own socket, with full-cone semantics when configured.

use async_trait::async_trait;
use bytes::Bytes;
use lm_core::proxy::{MsgConn, ProxyClient};
use lm_core::Address;
use lm_transport::IoStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;

pub struct DirectClient {
    fullcone: bool,
}

impl DirectClient {
    pub fn new(fullcone: bool) -> Self {
        Self { fullcone }
    }
}

#[async_trait]
impl ProxyClient for DirectClient {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn is_transparent(&self) -> bool {
        true
    }

    fn is_udp_multi_channel(&self) -> bool {
        self.fullcone
    }

    async fn handshake(
        &self,
        mut conn: IoStream,
        first_payload: &[u8],
        _target: &Address,
    ) -> std::io::Result<IoStream> {
        if !first_payload.is_empty() {
            conn.write_all(first_payload).await?;
            conn.flush().await?;
        }
        Ok(conn)
    }

    async fn establish_udp(
        &self,
        _conn: Option<IoStream>,
        target: &Address,
    ) -> std::io::Result<Arc<dyn MsgConn>> {
        let bind = if target.ip.map(|ip| ip.is_ipv6()).unwrap_or(false) {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Arc::new(DirectUdpConn {
            socket,
            fixed: if self.fullcone {
                None
            } else {
                resolve(target).await
            },
        }))
    }
}

async fn resolve(addr: &Address) -> Option<SocketAddr> {
    if let Some(sa) = addr.socket_addr() {
        return Some(sa);
    }
    let host = addr.host.clone()?;
    let resolved = tokio::net::lookup_host((host.as_str(), addr.port))
        .await
        .ok()?
        .next();
    resolved
}

/// Plain UDP socket. Full-cone keeps it unconnected and resolves each
/// write's target; the pinned form locks onto the first one.
pub struct DirectUdpConn {
    socket: UdpSocket,
    fixed: Option<SocketAddr>,
}

#[async_trait]
impl MsgConn for DirectUdpConn {
    async fn read_msg(&self) -> std::io::Result<(Bytes, Address)> {
        let mut buf = vec![0u8; 64 * 1024];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((
            Bytes::from(buf),
            Address::from_socket_addr(lm_core::Network::Udp, from),
        ))
    }

    async fn write_msg(&self, data: Bytes, target: &Address) -> std::io::Result<()> {
        let sa = match self.fixed {
            Some(sa) => sa,
            None => resolve(target).await.ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {target}"),
                )
            })?,
        };
        self.socket.send_to(&data, sa).await?;
        Ok(())
    }

    async fn close_msg(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::Network;

    #[tokio::test]
    async fn udp_roundtrip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let client = DirectClient::new(false);
        let target = Address::from_socket_addr(Network::Udp, echo_addr);
        let conn = client.establish_udp(None, &target).await.unwrap();
        conn.write_msg(Bytes::from_static(b"ping"), &target)
            .await
            .unwrap();
        let (data, from) = conn.read_msg().await.unwrap();
        assert_eq!(&data[..], b"ping");
        assert_eq!(from.port, echo_addr.port());
    }

    #[tokio::test]
    async fn tcp_handshake_writes_first_payload() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut s, &mut buf)
                .await
                .unwrap();
            buf
        });

        let conn: IoStream = Box::new(tokio::net::TcpStream::connect(addr).await.unwrap());
        let client = DirectClient::new(false);
        let target = Address::from_socket_addr(Network::Tcp, addr);
        let _out = client.handshake(conn, b"hello", &target).await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }
}
