//! VLESS outbound (version 0). The server's `[version, addon_len]`
//! response header is stripped from the first read.

use crate::inbound::vless::{write_vless_addr, VlessUdpConn, CMD_TCP, CMD_UDP};
use async_trait::async_trait;
use bytes::BytesMut;
use lm_core::proxy::{MsgConn, ProxyClient};
use lm_core::Address;
use lm_transport::IoStream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

pub struct VlessClient {
    user: Uuid,
    use_mux: bool,
}

impl VlessClient {
    pub fn new(uuid: &str, use_mux: bool) -> anyhow::Result<Self> {
        Ok(Self {
            user: Uuid::parse_str(uuid)?,
            use_mux,
        })
    }

    fn request(&self, cmd: u8, target: &Address, first_payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(32 + first_payload.len());
        out.extend_from_slice(&[0u8]);
        out.extend_from_slice(self.user.as_bytes());
        out.extend_from_slice(&[0u8]); // no addons
        out.extend_from_slice(&[cmd]);
        write_vless_addr(&mut out, target);
        out.extend_from_slice(first_payload);
        out
    }
}

#[async_trait]
impl ProxyClient for VlessClient {
    fn name(&self) -> &'static str {
        "vless"
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
        // The mux request stops after the command byte; targets travel
        // per-stream inside the session.
        let req = if self.use_mux {
            let mut out = BytesMut::with_capacity(19);
            out.extend_from_slice(&[0u8]);
            out.extend_from_slice(self.user.as_bytes());
            out.extend_from_slice(&[0u8, crate::inbound::vless::CMD_MUX]);
            out
        } else {
            self.request(CMD_TCP, target, first_payload)
        };
        conn.write_all(&req).await?;
        conn.flush().await?;
        Ok(Box::new(ResponseHeaderStream::new(conn)))
    }

    async fn establish_udp(
        &self,
        conn: Option<IoStream>,
        target: &Address,
    ) -> std::io::Result<Arc<dyn MsgConn>> {
        let mut conn = conn.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "vless udp needs a stream")
        })?;
        let req = self.request(CMD_UDP, target, &[]);
        conn.write_all(&req).await?;
        conn.flush().await?;
        let stream: IoStream = Box::new(ResponseHeaderStream::new(conn));
        Ok(Arc::new(VlessUdpConn::new(stream, target.clone())))
    }
}

/// Strips `version + addon_len (+ addons)` from the front of the
/// response stream.
struct ResponseHeaderStream {
    inner: IoStream,
    state: HeaderState,
}

#[derive(Clone, Copy)]
enum HeaderState {
    WaitVersion,
    WaitAddonLen,
    SkipAddons(usize),
    Done,
}

impl ResponseHeaderStream {
    fn new(inner: IoStream) -> Self {
        Self {
            inner,
            state: HeaderState::WaitVersion,
        }
    }
}

impl AsyncRead for ResponseHeaderStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            match self.state {
                HeaderState::Done => return Pin::new(&mut self.inner).poll_read(cx, buf),
                HeaderState::WaitVersion | HeaderState::WaitAddonLen => {
                    let mut one = [0u8; 1];
                    let mut rb = ReadBuf::new(&mut one);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut rb) {
                        Poll::Ready(Ok(())) => {
                            if rb.filled().is_empty() {
                                return Poll::Ready(Ok(()));
                            }
                            self.state = match self.state {
                                HeaderState::WaitVersion => HeaderState::WaitAddonLen,
                                HeaderState::WaitAddonLen => {
                                    let len = rb.filled()[0] as usize;
                                    if len == 0 {
                                        HeaderState::Done
                                    } else {
                                        HeaderState::SkipAddons(len)
                                    }
                                }
                                _ => unreachable!(),
                            };
                        }
                        other => return other,
                    }
                }
                HeaderState::SkipAddons(remaining) => {
                    let mut tmp = [0u8; 64];
                    let take = remaining.min(tmp.len());
                    let mut rb = ReadBuf::new(&mut tmp[..take]);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut rb) {
                        Poll::Ready(Ok(())) => {
                            let got = rb.filled().len();
                            if got == 0 {
                                return Poll::Ready(Ok(()));
                            }
                            self.state = if got >= remaining {
                                HeaderState::Done
                            } else {
                                HeaderState::SkipAddons(remaining - got)
                            };
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

impl AsyncWrite for ResponseHeaderStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::Network;
    use tokio::io::{duplex, AsyncReadExt};

    const USER: &str = "2f8bb5b0-bd23-4316-9cb4-8a3a87a5b1a2";

    #[tokio::test]
    async fn handshake_and_response_strip() {
        let (client_end, mut server) = duplex(1024);
        let c = VlessClient::new(USER, false).unwrap();
        let target = Address::from_host_port(Network::Tcp, "example.com", 443);

        let task = tokio::spawn(async move {
            c.handshake(Box::new(client_end), b"req", &target).await
        });

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        // version + uuid + addons(0) + cmd
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[1..17], Uuid::parse_str(USER).unwrap().as_bytes());
        assert_eq!(buf[17], 0);
        assert_eq!(buf[18], CMD_TCP);
        assert_eq!(&buf[n - 3..n], b"req");

        // Response header [0, 0] then payload; the client must only see
        // the payload.
        use tokio::io::AsyncWriteExt;
        server.write_all(&[0, 0]).await.unwrap();
        server.write_all(b"body").await.unwrap();

        let mut out = task.await.unwrap().unwrap();
        let mut got = [0u8; 4];
        out.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"body");
    }
}
