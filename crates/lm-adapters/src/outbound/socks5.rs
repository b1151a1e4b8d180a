//! SOCKS5 outbound: CONNECT and UDP ASSOCIATE against an upstream
//! server, no-auth.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lm_core::address::{read_socks_addr, write_socks_addr};
use lm_core::proxy::{MsgConn, ProxyClient};
use lm_core::{Address, Network};
use lm_transport::IoStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

pub struct Socks5Client;

impl Socks5Client {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Socks5Client {
    fn default() -> Self {
        Self::new()
    }
}

async fn negotiate(conn: &mut IoStream, cmd: u8, target: &Address) -> std::io::Result<Address> {
    conn.write_all(&[0x05, 0x01, 0x00]).await?;
    conn.flush().await?;
    let mut r = [0u8; 2];
    conn.read_exact(&mut r).await?;
    if r != [0x05, 0x00] {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "upstream refused no-auth",
        ));
    }

    let mut req = vec![0x05, cmd, 0x00];
    write_socks_addr(&mut req, target);
    conn.write_all(&req).await?;
    conn.flush().await?;

    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("upstream replied {}", head[1]),
        ));
    }
    // BND address.
    let mut raw = BytesMut::new();
    raw.extend_from_slice(&head[3..4]);
    match head[3] {
        0x01 => {
            let mut b = [0u8; 6];
            conn.read_exact(&mut b).await?;
            raw.extend_from_slice(&b);
        }
        0x03 => {
            let mut l = [0u8; 1];
            conn.read_exact(&mut l).await?;
            raw.extend_from_slice(&l);
            let mut b = vec![0u8; l[0] as usize + 2];
            conn.read_exact(&mut b).await?;
            raw.extend_from_slice(&b);
        }
        0x04 => {
            let mut b = [0u8; 18];
            conn.read_exact(&mut b).await?;
            raw.extend_from_slice(&b);
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad bnd atyp {other}"),
            ))
        }
    }
    let mut rd = raw.freeze();
    read_socks_addr(&mut rd, Network::Udp)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad bnd address"))
}

#[async_trait]
impl ProxyClient for Socks5Client {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn handshake(
        &self,
        mut conn: IoStream,
        first_payload: &[u8],
        target: &Address,
    ) -> std::io::Result<IoStream> {
        negotiate(&mut conn, 0x01, target).await?;
        if !first_payload.is_empty() {
            conn.write_all(first_payload).await?;
            conn.flush().await?;
        }
        Ok(conn)
    }

    async fn establish_udp(
        &self,
        conn: Option<IoStream>,
        target: &Address,
    ) -> std::io::Result<Arc<dyn MsgConn>> {
        let mut conn = conn.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "socks5 udp needs a stream")
        })?;
        let bnd = negotiate(&mut conn, 0x03, target).await?;
        let relay_addr = bnd
            .socket_addr()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bnd not an ip"))?;
        let socket = UdpSocket::bind(if relay_addr.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        })
        .await?;
        Ok(Arc::new(Socks5ClientUdpConn {
            socket,
            relay: relay_addr,
            // The association dies with the control conn; keep it inside.
            _control: Mutex::new(conn),
        }))
    }
}

/// Client side of an association: datagrams to the relay carry the RFC
/// 1928 UDP header.
pub struct Socks5ClientUdpConn {
    socket: UdpSocket,
    relay: SocketAddr,
    _control: Mutex<IoStream>,
}

#[async_trait]
impl MsgConn for Socks5ClientUdpConn {
    async fn read_msg(&self) -> std::io::Result<(Bytes, Address)> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, _) = self.socket.recv_from(&mut buf).await?;
            if n < 4 || buf[2] != 0 {
                continue;
            }
            let mut rd = Bytes::copy_from_slice(&buf[3..n]);
            let Some(from) = read_socks_addr(&mut rd, Network::Udp) else {
                continue;
            };
            return Ok((rd, from));
        }
    }

    async fn write_msg(&self, data: Bytes, target: &Address) -> std::io::Result<()> {
        let mut out = BytesMut::with_capacity(data.len() + 32);
        out.extend_from_slice(&[0, 0, 0]);
        write_socks_addr(&mut out, target);
        out.extend_from_slice(&data);
        self.socket.send_to(&out, self.relay).await?;
        Ok(())
    }

    async fn close_msg(&self) -> std::io::Result<()> {
        let mut control = self._control.lock().await;
        let _ = control.shutdown().await;
        Ok(())
    }
}
