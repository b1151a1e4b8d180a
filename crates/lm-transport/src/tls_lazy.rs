//! Lazy TLS plumbing: a tee recorder that mirrors raw ciphertext read
//! from the base connection, and the record sniffing used to decide when
//! the inner TLS stream may be relayed without re-encryption.
//!
//! The server side wraps its base conn in a [`TeeStream`] before the TLS
//! handshake with recording off (the handshake records are ours and carry
//! no user data), then turns recording on. Once both ends have seen an
//! application-data record from the peer, the pipeline switches to a raw
//! copy of the recorded ciphertext stream.

use bytes::BytesMut;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// TLS record header length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Shared raw-byte recorder. Cheap to clone; all clones observe the same
/// buffer and recording flag.
#[derive(Clone, Default)]
pub struct RawRecorder {
    recording: Arc<AtomicBool>,
    buf: Arc<Mutex<BytesMut>>,
}

impl RawRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.recording.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.recording.store(false, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    fn push(&self, data: &[u8]) {
        if self.is_recording() {
            self.buf.lock().expect("recorder lock").extend_from_slice(data);
        }
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> BytesMut {
        std::mem::take(&mut *self.buf.lock().expect("recorder lock"))
    }

    pub fn recorded_len(&self) -> usize {
        self.buf.lock().expect("recorder lock").len()
    }
}

/// Stream wrapper that mirrors every byte read from the inner stream into
/// a [`RawRecorder`]. Writes pass through untouched.
pub struct TeeStream<S> {
    inner: S,
    recorder: RawRecorder,
}

impl<S> TeeStream<S> {
    pub fn new(inner: S, recorder: RawRecorder) -> Self {
        Self { inner, recorder }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TeeStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled();
                if filled.len() > before {
                    self.recorder.push(&filled[before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TeeStream<S> {
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

/// True when `buf` starts with a TLS application-data record
/// (content type 0x17, TLS 1.2+ legacy record version).
pub fn is_app_data_record(buf: &[u8]) -> bool {
    buf.len() >= RECORD_HEADER_LEN && buf[0] == 0x17 && buf[1] == 0x03 && buf[2] >= 0x01
}

/// True when `buf` starts with any plausible TLS record at all, used to
/// decide whether the lazy path applies to a sniffed first payload.
pub fn looks_like_tls(buf: &[u8]) -> bool {
    buf.len() >= RECORD_HEADER_LEN && (0x14..=0x18).contains(&buf[0]) && buf[1] == 0x03
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tee_records_only_while_enabled() {
        let (mut a, b) = duplex(256);
        let rec = RawRecorder::new();
        let mut tee = TeeStream::new(b, rec.clone());

        a.write_all(b"handshake").await.unwrap();
        let mut buf = [0u8; 9];
        tee.read_exact(&mut buf).await.unwrap();
        assert_eq!(rec.recorded_len(), 0);

        rec.start();
        a.write_all(b"payload").await.unwrap();
        let mut buf = [0u8; 7];
        tee.read_exact(&mut buf).await.unwrap();
        assert_eq!(&rec.take()[..], b"payload");
    }

    #[test]
    fn record_sniffing() {
        assert!(is_app_data_record(&[0x17, 0x03, 0x03, 0x00, 0x20]));
        assert!(!is_app_data_record(&[0x16, 0x03, 0x03, 0x00, 0x20]));
        assert!(looks_like_tls(&[0x16, 0x03, 0x01, 0x01, 0x00]));
        assert!(!looks_like_tls(b"GET /"));
    }
}
