//! SOCKS5 inbound: greeting, CONNECT and UDP ASSOCIATE (RFC 1928),
//! no-auth only.
//!
//! For UDP associates the reply carries a freshly bound UDP socket and
//! the TCP control conn is parked with a keeper task: RFC 1928 keeps it
//! alive for the lifetime of the association, and its EOF tears the
//! association down.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use lm_core::address::{read_socks_addr, write_socks_addr};
use lm_core::proxy::{MsgConn, ProxyServer, ServerHandshake};
use lm_core::{Address, HandshakeError, Network};
use lm_transport::IoStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const REP_SUCCESS: u8 = 0x00;
const REP_CMD_UNSUPPORTED: u8 = 0x07;

pub struct Socks5Server;

impl Socks5Server {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Socks5Server {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyServer for Socks5Server {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn handshake(&self, mut conn: IoStream) -> Result<ServerHandshake, HandshakeError> {
        let mut consumed = Vec::with_capacity(64);

        // Greeting.
        let mut hdr = [0u8; 2];
        conn.read_exact(&mut hdr).await?;
        consumed.extend_from_slice(&hdr);
        if hdr[0] != VERSION {
            // Not SOCKS at all: drain what else arrived so the fallback
            // replay is complete.
            let mut extra = [0u8; 512];
            if let Ok(Ok(n)) =
                tokio::time::timeout(std::time::Duration::from_millis(20), conn.read(&mut extra))
                    .await
            {
                consumed.extend_from_slice(&extra[..n]);
            }
            return Err(HandshakeError::reject(consumed, "not socks5", conn));
        }
        let mut methods = vec![0u8; hdr[1] as usize];
        conn.read_exact(&mut methods).await?;
        conn.write_all(&[VERSION, METHOD_NONE]).await?;
        conn.flush().await?;

        // Request.
        let mut req = [0u8; 4];
        conn.read_exact(&mut req).await?;
        if req[0] != VERSION {
            return Err(HandshakeError::fatal("bad socks5 request version"));
        }
        let cmd = req[1];
        let atyp = req[3];
        let target = read_request_addr(&mut conn, atyp).await?;

        match cmd {
            CMD_CONNECT => {
                let bnd = SocketAddr::from(([0, 0, 0, 0], 0));
                conn.write_all(&reply(REP_SUCCESS, bnd)).await?;
                conn.flush().await?;
                Ok(ServerHandshake::Tcp {
                    stream: conn,
                    target,
                })
            }
            CMD_UDP_ASSOCIATE => {
                let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
                    HandshakeError::fatal(format!("udp associate bind: {e}"))
                })?;
                let bnd = socket
                    .local_addr()
                    .map_err(|e| HandshakeError::fatal(format!("udp local addr: {e}")))?;
                debug!(bnd = %bnd, "udp associate bound");
                conn.write_all(&reply(REP_SUCCESS, bnd)).await?;
                conn.flush().await?;

                let socket = Arc::new(socket);
                // Keeper: the association lives as long as the control
                // conn; EOF (or error) on it releases the UDP socket.
                let keeper_socket = socket.clone();
                tokio::spawn(async move {
                    let mut one = [0u8; 1];
                    loop {
                        match conn.read(&mut one).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    debug!("udp associate control conn closed");
                    drop(keeper_socket);
                });

                // The request DST is usually a placeholder; the real
                // first target comes from the first datagram, which the
                // pipeline reads next.
                Ok(ServerHandshake::Udp {
                    conn: Arc::new(Socks5UdpConn::new(socket)),
                    target: Address {
                        network: Network::Udp,
                        ..target
                    },
                })
            }
            _ => {
                let bnd = SocketAddr::from(([0, 0, 0, 0], 0));
                let _ = conn.write_all(&reply(REP_CMD_UNSUPPORTED, bnd)).await;
                Err(HandshakeError::fatal(format!("unsupported command {cmd}")))
            }
        }
    }
}

async fn read_request_addr(conn: &mut IoStream, atyp: u8) -> Result<Address, HandshakeError> {
    let mut raw = BytesMut::new();
    raw.put_u8(atyp);
    match atyp {
        0x01 => {
            let mut b = [0u8; 6];
            conn.read_exact(&mut b).await?;
            raw.extend_from_slice(&b);
        }
        0x03 => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut b = vec![0u8; len[0] as usize + 2];
            conn.read_exact(&mut b).await?;
            raw.put_u8(len[0]);
            raw.extend_from_slice(&b);
        }
        0x04 => {
            let mut b = [0u8; 18];
            conn.read_exact(&mut b).await?;
            raw.extend_from_slice(&b);
        }
        _ => return Err(HandshakeError::fatal(format!("bad atyp {atyp}"))),
    }
    let mut buf = raw.freeze();
    read_socks_addr(&mut buf, Network::Tcp)
        .ok_or_else(|| HandshakeError::fatal("malformed request address"))
}

fn reply(rep: u8, bnd: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.push(VERSION);
    out.push(rep);
    out.push(0x00);
    let addr = Address::from_socket_addr(Network::Tcp, bnd);
    write_socks_addr(&mut out, &addr);
    out
}

/// Datagram side of an association. Every packet carries the RFC 1928
/// UDP request header; the client's own address is learned from the
/// first packet received.
pub struct Socks5UdpConn {
    socket: Arc<UdpSocket>,
    client: OnceCell<SocketAddr>,
}

impl Socks5UdpConn {
    fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            client: OnceCell::new(),
        }
    }
}

#[async_trait]
impl MsgConn for Socks5UdpConn {
    async fn read_msg(&self) -> std::io::Result<(Bytes, Address)> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let _ = self.client.set(from);
            // RSV(2) FRAG(1) ATYP ADDR PORT DATA
            if n < 4 {
                continue;
            }
            if buf[2] != 0 {
                warn!("fragmented socks5 udp packet dropped");
                continue;
            }
            let mut rd = Bytes::copy_from_slice(&buf[3..n]);
            let Some(target) = read_socks_addr(&mut rd, Network::Udp) else {
                continue;
            };
            return Ok((rd, target));
        }
    }

    async fn write_msg(&self, data: Bytes, target: &Address) -> std::io::Result<()> {
        let Some(client) = self.client.get() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no client datagram seen yet",
            ));
        };
        let mut out = BytesMut::with_capacity(data.len() + 32);
        out.extend_from_slice(&[0, 0, 0]);
        write_socks_addr(&mut out, target);
        out.extend_from_slice(&data);
        self.socket.send_to(&out, client).await?;
        Ok(())
    }

    async fn close_msg(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn connect_handshake() {
        let (mut client, server_end) = duplex(1024);
        let srv = Socks5Server::new();

        let task = tokio::spawn(async move { srv.handshake(Box::new(server_end)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut r = [0u8; 2];
        client.read_exact(&mut r).await.unwrap();
        assert_eq!(r, [0x05, 0x00]);

        // CONNECT example.com:80
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut rep = [0u8; 10];
        client.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[0], 0x05);
        assert_eq!(rep[1], 0x00);

        match task.await.unwrap().unwrap() {
            ServerHandshake::Tcp { target, .. } => {
                assert_eq!(target.host.as_deref(), Some("example.com"));
                assert_eq!(target.port, 80);
            }
            _ => panic!("expected tcp handshake"),
        }
    }

    #[tokio::test]
    async fn non_socks_bytes_are_replayable() {
        let (mut client, server_end) = duplex(1024);
        let srv = Socks5Server::new();
        let task = tokio::spawn(async move { srv.handshake(Box::new(server_end)).await });
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        match task.await.unwrap() {
            Err(HandshakeError::Reject { buf, .. }) => {
                assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
            }
            other => panic!("expected reject, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn udp_associate_reads_first_datagram_target() {
        let (mut client, server_end) = duplex(1024);
        let srv = Socks5Server::new();
        let task = tokio::spawn(async move { srv.handshake(Box::new(server_end)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut r = [0u8; 2];
        client.read_exact(&mut r).await.unwrap();

        // ASSOCIATE with 0.0.0.0:0 placeholder.
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [0x05, 0x00, 0x00, 0x01]);
        let mut rest = [0u8; 6];
        client.read_exact(&mut rest).await.unwrap();
        let port = u16::from_be_bytes([rest[4], rest[5]]);
        assert_ne!(port, 0);

        let hs = task.await.unwrap().unwrap();
        let ServerHandshake::Udp { conn, .. } = hs else {
            panic!("expected udp handshake");
        };

        // First datagram declares 1.2.3.4:53.
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut pkt = vec![0, 0, 0, 0x01, 1, 2, 3, 4];
        pkt.extend_from_slice(&53u16.to_be_bytes());
        pkt.extend_from_slice(b"query");
        local
            .send_to(&pkt, ("127.0.0.1", port))
            .await
            .unwrap();

        let (data, target) = conn.read_msg().await.unwrap();
        assert_eq!(&data[..], b"query");
        assert_eq!(target.dial_string(), "1.2.3.4:53");
        assert!(target.is_udp());

        // Reply flows back to the client socket with the header restored.
        conn.write_msg(Bytes::from_static(b"answer"), &target)
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = local.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 0x01]);
        assert_eq!(&buf[n - 6..n], b"answer");

        // The control conn is still writable: the keeper holds it open.
        client.write_all(&[0]).await.unwrap();
    }
}
