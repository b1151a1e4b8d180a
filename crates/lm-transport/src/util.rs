//! Small stream utilities shared by the carrier layers.

use bytes::BytesMut;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream that replays `pending` bytes before reading from the inner
/// stream. Used wherever a layer over-read during its own handshake.
pub struct ReplayStream<S> {
    pending: BytesMut,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(pending: BytesMut, inner: S) -> Self {
        Self { pending, inner }
    }

    pub fn into_parts(self) -> (BytesMut, S) {
        (self.pending, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.remaining());
            let chunk = self.pending.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
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

/// Stream whose transport is attached after the fact.
///
/// Early-data carriers need the proxy-layer handshake bytes *before* the
/// upgrade goes out, so the handshake is performed against a late-bound
/// stream first: writes are buffered, the buffer becomes the early-data
/// preamble, and once the carrier is up the real stream is bound and
/// everything flows through it.
pub struct LateBoundStream {
    shared: std::sync::Arc<std::sync::Mutex<LateInner>>,
}

struct LateInner {
    buffered: Vec<u8>,
    inner: Option<crate::dialer::IoStream>,
    read_waker: Option<std::task::Waker>,
}

/// Controller half: drains the pre-bind writes and installs the real
/// stream.
pub struct LateBinder {
    shared: std::sync::Arc<std::sync::Mutex<LateInner>>,
}

impl LateBoundStream {
    pub fn new() -> (Self, LateBinder) {
        let shared = std::sync::Arc::new(std::sync::Mutex::new(LateInner {
            buffered: Vec::new(),
            inner: None,
            read_waker: None,
        }));
        (
            Self {
                shared: shared.clone(),
            },
            LateBinder { shared },
        )
    }
}

impl LateBinder {
    /// Everything written before the bind.
    pub fn take_buffered(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().expect("late lock").buffered)
    }

    /// Attach the real transport; blocked readers wake up.
    pub fn bind(&self, stream: crate::dialer::IoStream) {
        let mut inner = self.shared.lock().expect("late lock");
        inner.inner = Some(stream);
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
    }
}

impl AsyncRead for LateBoundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut inner = self.shared.lock().expect("late lock");
        match inner.inner.as_mut() {
            Some(s) => Pin::new(s).poll_read(cx, buf),
            None => {
                inner.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for LateBoundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut inner = self.shared.lock().expect("late lock");
        match inner.inner.as_mut() {
            Some(s) => Pin::new(s).poll_write(cx, buf),
            None => {
                inner.buffered.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut inner = self.shared.lock().expect("late lock");
        match inner.inner.as_mut() {
            Some(s) => Pin::new(s).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut inner = self.shared.lock().expect("late lock");
        match inner.inner.as_mut() {
            Some(s) => Pin::new(s).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replay_then_passthrough() {
        let (mut a, b) = duplex(64);
        let mut rs = ReplayStream::new(BytesMut::from(&b"head"[..]), b);
        a.write_all(b"tail").await.unwrap();

        let mut buf = [0u8; 8];
        rs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"headtail");
    }

    #[tokio::test]
    async fn late_bound_buffers_then_forwards() {
        let (mut late, binder) = LateBoundStream::new();
        late.write_all(b"handshake-bytes").await.unwrap();
        assert_eq!(binder.take_buffered(), b"handshake-bytes");

        let (real, mut peer) = duplex(256);
        binder.bind(Box::new(real));

        late.write_all(b"after").await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after");

        peer.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        late.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }
}
