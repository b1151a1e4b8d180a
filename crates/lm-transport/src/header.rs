//! Fixed HTTP header disguise.
//!
//! A [`HeaderStream`] prefixes a canned HTTP header block to the first
//! write and strips/validates the counterpart block on the first read.
//! Validation failure keeps every byte already consumed so the caller can
//! replay them into a fallback target.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const MAX_HEADER_LEN: usize = 8 * 1024;

/// Configured disguise header, one side each.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HeaderPreset {
    #[serde(default)]
    pub request: HeaderBlock,
    #[serde(default)]
    pub response: HeaderBlock,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HeaderBlock {
    /// First line, e.g. `GET / HTTP/1.1` or `HTTP/1.1 200 OK`.
    #[serde(default)]
    pub first_line: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl HeaderBlock {
    /// Render the block including the terminating blank line.
    pub fn render(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.extend_from_slice(self.first_line.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (k, v) in &self.headers {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }

    /// The counterpart block matches when its first line equals ours;
    /// extra headers from real-world clients are tolerated.
    fn matches(&self, got_first_line: &str) -> bool {
        self.first_line.is_empty() || got_first_line == self.first_line
    }
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Counterpart header did not match; `consumed` holds every byte read
    /// so far for fallback replay.
    #[error("header mismatch after {} bytes", consumed.len())]
    Mismatch { consumed: Vec<u8> },
}

/// Read and validate the peer's header block from `conn`. Returns any
/// payload bytes that arrived after the blank line.
pub async fn read_and_validate<S: AsyncRead + Unpin>(
    conn: &mut S,
    expect: &HeaderBlock,
) -> Result<BytesMut, HeaderError> {
    let mut buf = BytesMut::with_capacity(512);
    let mut tmp = [0u8; 512];
    let header_end = loop {
        let n = conn.read(&mut tmp).await?;
        if n == 0 {
            return Err(HeaderError::Mismatch {
                consumed: buf.to_vec(),
            });
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_blank_line(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_LEN {
            return Err(HeaderError::Mismatch {
                consumed: buf.to_vec(),
            });
        }
    };

    let head = &buf[..header_end];
    let first_line = head
        .split(|&b| b == b'\r')
        .next()
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .unwrap_or_default();
    if !expect.matches(&first_line) {
        return Err(HeaderError::Mismatch {
            consumed: buf.to_vec(),
        });
    }

    let mut rest = buf;
    let _ = rest.split_to(header_end + 4);
    Ok(rest)
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Stream with the disguise applied. `to_send` goes out before the first
/// payload write; `pending` replays bytes left over from header parsing.
/// With `expect` set, the counterpart block is consumed and validated
/// lazily on the first read (client side: the server only answers after
/// our header has gone out, so eager validation would deadlock).
pub struct HeaderStream<S> {
    inner: S,
    to_send: Option<Bytes>,
    pending: BytesMut,
    expect: Option<HeaderBlock>,
    head_buf: BytesMut,
}

impl<S> HeaderStream<S> {
    pub fn new(inner: S, to_send: Bytes, pending: BytesMut) -> Self {
        Self {
            inner,
            to_send: Some(to_send),
            pending,
            expect: None,
            head_buf: BytesMut::new(),
        }
    }

    /// Client-side constructor: prefix `to_send`, strip-and-validate the
    /// peer's block on first read.
    pub fn client(inner: S, to_send: Bytes, expect: HeaderBlock) -> Self {
        Self {
            inner,
            to_send: Some(to_send),
            pending: BytesMut::new(),
            expect: Some(expect),
            head_buf: BytesMut::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HeaderStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Consume and check the peer's header block before any payload.
        while self.expect.is_some() {
            let mut tmp = [0u8; 512];
            let mut rb = ReadBuf::new(&mut tmp);
            match Pin::new(&mut self.inner).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    if rb.filled().is_empty() {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "closed before header",
                        )));
                    }
                    let filled = rb.filled().to_vec();
                    self.head_buf.extend_from_slice(&filled);
                    if let Some(pos) = find_blank_line(&self.head_buf) {
                        let head = self.head_buf.split_to(pos + 4);
                        let first_line = head
                            .as_ref()
                            .split(|&b| b == b'\r')
                            .next()
                            .map(|l| String::from_utf8_lossy(l).into_owned())
                            .unwrap_or_default();
                        let expect = self.expect.take().expect("expect set");
                        if !expect.matches(&first_line) {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                format!("header mismatch: {first_line}"),
                            )));
                        }
                        let leftover = std::mem::take(&mut self.head_buf);
                        self.pending.unsplit(leftover);
                    } else if self.head_buf.len() > MAX_HEADER_LEN {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "header too large",
                        )));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.remaining());
            let chunk = self.pending.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HeaderStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        // Drain the canned header before any payload byte.
        let this = self.get_mut();
        while let Some(hdr) = &mut this.to_send {
            match Pin::new(&mut this.inner).poll_write(cx, hdr) {
                Poll::Ready(Ok(n)) => {
                    let _ = hdr.split_to(n);
                    if hdr.is_empty() {
                        this.to_send = None;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
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
    use tokio::io::{duplex, AsyncWriteExt};

    fn http_preset() -> HeaderPreset {
        HeaderPreset {
            request: HeaderBlock {
                first_line: "GET /assets HTTP/1.1".into(),
                headers: vec![("Host".into(), "cdn.example.com".into())],
            },
            response: HeaderBlock {
                first_line: "HTTP/1.1 200 OK".into(),
                headers: vec![("Content-Type".into(), "application/octet-stream".into())],
            },
        }
    }

    #[tokio::test]
    async fn roundtrip_with_payload_after_header() {
        let preset = http_preset();
        let (mut client_raw, mut server_raw) = duplex(4096);

        // Client writes its request block followed by payload.
        let block = preset.request.render();
        client_raw.write_all(&block).await.unwrap();
        client_raw.write_all(b"payload-bytes").await.unwrap();

        let rest = read_and_validate(&mut server_raw, &preset.request)
            .await
            .unwrap();
        assert_eq!(&rest[..], b"payload-bytes");
    }

    #[tokio::test]
    async fn mismatch_keeps_consumed_bytes() {
        let preset = http_preset();
        let (mut client_raw, mut server_raw) = duplex(4096);
        let sent = b"POST /upload HTTP/1.1\r\nHost: other\r\n\r\ntrailing";
        client_raw.write_all(sent).await.unwrap();

        match read_and_validate(&mut server_raw, &preset.request).await {
            Err(HeaderError::Mismatch { consumed }) => assert_eq!(consumed, sent),
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_stream_prefixes_first_write() {
        let preset = http_preset();
        let (client_raw, mut server_raw) = duplex(4096);
        let mut hs = HeaderStream::new(client_raw, preset.request.render(), BytesMut::new());
        hs.write_all(b"data").await.unwrap();

        let expect = [preset.request.render().to_vec(), b"data".to_vec()].concat();
        let mut got = vec![0u8; expect.len()];
        tokio::io::AsyncReadExt::read_exact(&mut server_raw, &mut got)
            .await
            .unwrap();
        assert_eq!(got, expect);
    }
}
