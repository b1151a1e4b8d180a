//! Trojan inbound.
//!
//! Request: `hex(sha224(password))` (56 bytes) CRLF, command byte,
//! SOCKS-style address, CRLF, then payload. Any structural mismatch
//! rejects with every consumed byte intact so the listener can fall
//! back to a decoy, which is the protocol's whole point.

use crate::stream_util::SplitStream;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use lm_core::address::{read_socks_addr, write_socks_addr};
use lm_core::proxy::{MsgConn, ProxyServer, ServerHandshake};
use lm_core::{Address, HandshakeError, Network};
use lm_transport::{IoStream, ReplayStream};
use sha2::{Digest, Sha224};
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
pub const CMD_MUX: u8 = 0x7f;

const CRLF: [u8; 2] = [b'\r', b'\n'];
const HASH_LEN: usize = 56;
/// Below the shortest well-formed HTTP request there is nothing worth
/// replaying to a decoy.
const MIN_SNIFF_LEN: usize = 17;
const MIN_REQUEST_LEN: usize = HASH_LEN + 2 + 1 + 2 + 4;
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(4);

pub fn password_hash(password: &str) -> String {
    let mut h = Sha224::new();
    h.update(password.as_bytes());
    hex_encode(&h.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct TrojanServer {
    user_hashes: HashSet<String>,
}

impl TrojanServer {
    pub fn new(passwords: &[&str]) -> Self {
        Self {
            user_hashes: passwords.iter().map(|p| password_hash(p)).collect(),
        }
    }
}

#[async_trait]
impl ProxyServer for TrojanServer {
    fn name(&self) -> &'static str {
        "trojan"
    }

    fn inner_mux_protocol(&self) -> Option<&'static str> {
        Some("simplesocks")
    }

    async fn handshake(&self, mut conn: IoStream) -> Result<ServerHandshake, HandshakeError> {
        let mut buf = vec![0u8; 16 * 1024];
        let n = tokio::time::timeout(HANDSHAKE_DEADLINE, conn.read(&mut buf))
            .await
            .map_err(|_| HandshakeError::fatal("trojan handshake deadline"))??;
        buf.truncate(n);

        if n < MIN_SNIFF_LEN {
            return Err(HandshakeError::fatal(format!("msg too short: {n}")));
        }
        if n < MIN_REQUEST_LEN {
            return Err(HandshakeError::reject(buf, "handshake len too short", conn));
        }

        let mut rd = Bytes::copy_from_slice(&buf);
        let hash = rd.split_to(HASH_LEN);
        let hash_str = String::from_utf8_lossy(&hash).into_owned();
        if !self.user_hashes.contains(&hash_str) {
            return Err(HandshakeError::reject(buf, "hash not match", conn));
        }
        if rd.split_to(2) != Bytes::from_static(&CRLF) {
            return Err(HandshakeError::reject(buf, "crlf wrong", conn));
        }
        let cmd = rd.get_u8();
        let (is_udp, is_mux) = match cmd {
            CMD_CONNECT => (false, false),
            CMD_UDP_ASSOCIATE => (true, false),
            CMD_MUX => (false, true),
            _ => return Err(HandshakeError::reject(buf, format!("cmd byte wrong: {cmd}"), conn)),
        };
        let Some(mut target) = read_socks_addr(&mut rd, Network::Tcp) else {
            return Err(HandshakeError::reject(buf, "malformed address", conn));
        };
        if rd.remaining() < 2 || rd.split_to(2) != Bytes::from_static(&CRLF) {
            return Err(HandshakeError::reject(buf, "crlf wrong", conn));
        }
        if is_udp {
            target.network = Network::Udp;
        }

        let leftover = BytesMut::from(&rd[..]);
        let stream: IoStream = Box::new(ReplayStream::new(leftover, conn));

        if is_mux {
            return Ok(ServerHandshake::Mux { stream });
        }
        if is_udp {
            return Ok(ServerHandshake::Udp {
                conn: std::sync::Arc::new(TrojanUdpConn::new(stream)),
                target,
            });
        }
        Ok(ServerHandshake::Tcp { stream, target })
    }
}

/// UDP packets framed over the trojan stream:
/// `ATYP ADDR PORT LEN(2) CRLF payload`.
pub struct TrojanUdpConn {
    inner: SplitStream,
}

impl TrojanUdpConn {
    pub fn new(conn: IoStream) -> Self {
        Self {
            inner: SplitStream::new(conn),
        }
    }
}

#[async_trait]
impl MsgConn for TrojanUdpConn {
    async fn read_msg(&self) -> std::io::Result<(Bytes, Address)> {
        let mut r = self.inner.read.lock().await;
        // ATYP
        let mut atyp = [0u8; 1];
        r.read_exact(&mut atyp).await?;
        let mut head = BytesMut::new();
        head.put_u8(atyp[0]);
        let addr_len = match atyp[0] {
            0x01 => 6,
            0x04 => 18,
            0x03 => {
                let mut l = [0u8; 1];
                r.read_exact(&mut l).await?;
                head.put_u8(l[0]);
                l[0] as usize + 2
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad udp atyp {other}"),
                ))
            }
        };
        let mut rest = vec![0u8; addr_len];
        r.read_exact(&mut rest).await?;
        head.extend_from_slice(&rest);
        let mut head = head.freeze();
        let target = read_socks_addr(&mut head, Network::Udp).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad udp address")
        })?;

        let mut len_crlf = [0u8; 4];
        r.read_exact(&mut len_crlf).await?;
        let len = u16::from_be_bytes([len_crlf[0], len_crlf[1]]) as usize;
        if &len_crlf[2..] != b"\r\n" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "udp frame crlf wrong",
            ));
        }
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        Ok((Bytes::from(payload), target))
    }

    async fn write_msg(&self, data: Bytes, target: &Address) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut out = BytesMut::with_capacity(data.len() + 32);
        write_socks_addr(&mut out, target);
        out.put_u16(data.len() as u16);
        out.extend_from_slice(&CRLF);
        out.extend_from_slice(&data);
        let mut w = self.inner.write.lock().await;
        w.write_all(&out).await?;
        w.flush().await
    }

    async fn close_msg(&self) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let _ = self.inner.write.lock().await.shutdown().await;
        Ok(())
    }
}
