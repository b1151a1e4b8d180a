//! VLESS inbound (version 0).
//!
//! Request: version, uuid(16), addon-length (+ skipped addons), command,
//! port, address in VLESS order. The response header `[version, 0]` is
//! prefixed to the first server write.

use crate::stream_util::SplitStream;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use lm_core::proxy::{MsgConn, ProxyServer, ServerHandshake};
use lm_core::{Address, HandshakeError, Network};
use lm_transport::header::HeaderStream;
use lm_transport::{IoStream, ReplayStream};
use std::net::IpAddr;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

pub const CMD_TCP: u8 = 0x01;
pub const CMD_UDP: u8 = 0x02;
pub const CMD_MUX: u8 = 0x03;

// VLESS address types differ from the SOCKS family.
pub const VLESS_ATYP_V4: u8 = 0x01;
pub const VLESS_ATYP_DOMAIN: u8 = 0x02;
pub const VLESS_ATYP_V6: u8 = 0x03;

pub struct VlessServer {
    user: Uuid,
}

impl VlessServer {
    pub fn new(uuid: &str) -> anyhow::Result<Self> {
        Ok(Self {
            user: Uuid::parse_str(uuid)?,
        })
    }
}

/// Decode port + VLESS-order address from `rd`.
pub fn read_vless_addr(rd: &mut Bytes, network: Network) -> Option<Address> {
    if rd.remaining() < 3 {
        return None;
    }
    let port = rd.get_u16();
    match rd.get_u8() {
        VLESS_ATYP_V4 => {
            if rd.remaining() < 4 {
                return None;
            }
            let mut b = [0u8; 4];
            rd.copy_to_slice(&mut b);
            Some(Address {
                network,
                host: None,
                ip: Some(IpAddr::from(b)),
                port,
            })
        }
        VLESS_ATYP_DOMAIN => {
            if rd.remaining() < 1 {
                return None;
            }
            let len = rd.get_u8() as usize;
            if rd.remaining() < len {
                return None;
            }
            let mut name = vec![0u8; len];
            rd.copy_to_slice(&mut name);
            Some(Address::from_host_port(
                network,
                String::from_utf8(name).ok()?,
                port,
            ))
        }
        VLESS_ATYP_V6 => {
            if rd.remaining() < 16 {
                return None;
            }
            let mut b = [0u8; 16];
            rd.copy_to_slice(&mut b);
            Some(Address {
                network,
                host: None,
                ip: Some(IpAddr::from(b)),
                port,
            })
        }
        _ => None,
    }
}

/// Encode port + address in VLESS order.
pub fn write_vless_addr(out: &mut impl BufMut, addr: &Address) {
    out.put_u16(addr.port);
    match (&addr.ip, &addr.host) {
        (Some(IpAddr::V4(v4)), _) => {
            out.put_u8(VLESS_ATYP_V4);
            out.put_slice(&v4.octets());
        }
        (Some(IpAddr::V6(v6)), _) => {
            out.put_u8(VLESS_ATYP_V6);
            out.put_slice(&v6.octets());
        }
        (None, Some(host)) => {
            out.put_u8(VLESS_ATYP_DOMAIN);
            out.put_u8(host.len() as u8);
            out.put_slice(host.as_bytes());
        }
        (None, None) => {
            out.put_u8(VLESS_ATYP_V4);
            out.put_slice(&[0, 0, 0, 0]);
        }
    }
}

#[async_trait]
impl ProxyServer for VlessServer {
    fn name(&self) -> &'static str {
        "vless"
    }

    fn inner_mux_protocol(&self) -> Option<&'static str> {
        Some("simplesocks")
    }

    async fn handshake(&self, mut conn: IoStream) -> Result<ServerHandshake, HandshakeError> {
        let mut buf = vec![0u8; 16 * 1024];
        let n = conn.read(&mut buf).await?;
        buf.truncate(n);
        if n < 1 + 16 + 1 + 1 + 3 {
            return Err(HandshakeError::reject(buf, "vless request too short", conn));
        }

        let mut rd = Bytes::copy_from_slice(&buf);
        let version = rd.get_u8();
        if version != 0 {
            return Err(HandshakeError::reject(buf, format!("bad version {version}"), conn));
        }
        let mut id = [0u8; 16];
        rd.copy_to_slice(&mut id);
        if Uuid::from_bytes(id) != self.user {
            return Err(HandshakeError::reject(buf, "unknown user", conn));
        }
        let addon_len = rd.get_u8() as usize;
        if rd.remaining() < addon_len {
            return Err(HandshakeError::reject(buf, "truncated addons", conn));
        }
        rd.advance(addon_len);
        let cmd = rd.get_u8();
        let network = if cmd == CMD_UDP {
            Network::Udp
        } else {
            Network::Tcp
        };
        if cmd == CMD_MUX {
            let leftover = BytesMut::from(&rd[..]);
            let stream = respond_wrapped(conn, leftover);
            return Ok(ServerHandshake::Mux { stream });
        }
        if cmd != CMD_TCP && cmd != CMD_UDP {
            return Err(HandshakeError::reject(buf, format!("bad command {cmd}"), conn));
        }
        let Some(target) = read_vless_addr(&mut rd, network) else {
            return Err(HandshakeError::reject(buf, "malformed address", conn));
        };

        let leftover = BytesMut::from(&rd[..]);
        let stream = respond_wrapped(conn, leftover);

        if cmd == CMD_UDP {
            return Ok(ServerHandshake::Udp {
                conn: std::sync::Arc::new(VlessUdpConn::new(stream, target.clone())),
                target,
            });
        }
        Ok(ServerHandshake::Tcp { stream, target })
    }
}

/// Prefix the `[version, addon_len = 0]` response to the first write and
/// replay handshake leftovers on reads.
fn respond_wrapped(conn: IoStream, leftover: BytesMut) -> IoStream {
    Box::new(HeaderStream::new(
        Box::new(ReplayStream::new(leftover, conn)) as IoStream,
        Bytes::from_static(&[0u8, 0u8]),
        BytesMut::new(),
    ))
}

/// VLESS UDP: length-prefixed payloads toward a fixed target.
pub struct VlessUdpConn {
    inner: SplitStream,
    target: Address,
}

impl VlessUdpConn {
    pub fn new(conn: IoStream, target: Address) -> Self {
        Self {
            inner: SplitStream::new(conn),
            target,
        }
    }
}

#[async_trait]
impl MsgConn for VlessUdpConn {
    async fn read_msg(&self) -> std::io::Result<(Bytes, Address)> {
        let mut r = self.inner.read.lock().await;
        let mut len = [0u8; 2];
        r.read_exact(&mut len).await?;
        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        r.read_exact(&mut payload).await?;
        Ok((Bytes::from(payload), self.target.clone()))
    }

    async fn write_msg(&self, data: Bytes, _target: &Address) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut out = BytesMut::with_capacity(data.len() + 2);
        out.put_u16(data.len() as u16);
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
