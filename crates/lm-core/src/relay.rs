//! Bidirectional relay engine.
//!
//! Per direction exactly one copy strategy applies:
//! - **splice**: both endpoints are bare sockets; the kernel moves the
//!   bytes (Linux zero-copy, with graceful fallback elsewhere).
//! - **vectored**: the reader benefits from batched reads and the writer
//!   is a bare socket or accepts buffer lists; reads are gathered
//!   opportunistically and written with one vectored syscall. The
//!   writer's own bulk-consume path is never used on a borrowed buffer
//!   list, since it would mutate the buffers.
//! - **classic**: single-buffer loop.
//!
//! When either direction ends, both connections are closed once and the
//! relay returns the downloaded byte count. Relay-level errors are
//! transient: logged at debug, never surfaced to the caller.

use crate::address::Address;
use lm_transport::IoStream;
use std::io::IoSlice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const CLASSIC_BUF: usize = 16 * 1024;
const VECTORED_BUFS: usize = 8;
const VECTORED_BUF_LEN: usize = 16 * 1024;

/// Copy strategy chosen for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    Splice,
    Vectored,
    Classic,
}

/// Endpoint capabilities the strategy selection keys from.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnCaps {
    /// Bare socket with nothing wrapped around it.
    pub is_basic: bool,
    /// A wrapped conn that will drain to a bare socket untouched, so a
    /// splice may still reach it (lazy-TLS raw path).
    pub splice_eventually: bool,
    /// Vectorized reads actually batch (frame-based conns, raw sockets).
    pub multi_read_benefit: bool,
    /// Accepts buffer lists without copying.
    pub multi_write: bool,
}

impl ConnCaps {
    pub fn basic() -> Self {
        Self {
            is_basic: true,
            splice_eventually: true,
            multi_read_benefit: true,
            multi_write: true,
        }
    }

    pub fn multi() -> Self {
        Self {
            is_basic: false,
            splice_eventually: false,
            multi_read_benefit: true,
            multi_write: true,
        }
    }

    pub fn plain() -> Self {
        Self::default()
    }
}

/// Whether the platform can splice at all.
pub fn system_can_splice() -> bool {
    cfg!(target_os = "linux")
}

/// Pick the strategy for one direction. `use_readv` gates the vectored
/// path globally (config / env switch).
pub fn select_strategy(use_readv: bool, reader: &ConnCaps, writer: &ConnCaps) -> CopyStrategy {
    if system_can_splice() && reader.is_basic && (writer.is_basic || writer.splice_eventually) {
        return CopyStrategy::Splice;
    }
    if !use_readv {
        return CopyStrategy::Classic;
    }
    if reader.is_basic || reader.multi_read_benefit {
        let reader_needs_multi_writer = !reader.is_basic;
        if writer.is_basic || writer.multi_write {
            if reader_needs_multi_writer && !writer.multi_write {
                return CopyStrategy::Classic;
            }
            return CopyStrategy::Vectored;
        }
    }
    CopyStrategy::Classic
}

/// One relay endpoint: stream plus capabilities.
pub struct RelayConn {
    kind: RelayKind,
    pub caps: ConnCaps,
}

enum RelayKind {
    Tcp(TcpStream),
    Stream(IoStream),
}

impl RelayConn {
    /// A bare socket; splice- and readv-capable.
    pub fn basic(s: TcpStream) -> Self {
        Self {
            kind: RelayKind::Tcp(s),
            caps: ConnCaps::basic(),
        }
    }

    /// A wrapped conn with frame-batched reads/writes (ws, grpc, proxy
    /// wrappers over them).
    pub fn multi(s: IoStream) -> Self {
        Self {
            kind: RelayKind::Stream(s),
            caps: ConnCaps::multi(),
        }
    }

    /// Anything else.
    pub fn plain(s: IoStream) -> Self {
        Self {
            kind: RelayKind::Stream(s),
            caps: ConnCaps::plain(),
        }
    }

    pub fn from_stream(s: IoStream, caps: ConnCaps) -> Self {
        Self {
            kind: RelayKind::Stream(s),
            caps,
        }
    }

    fn into_stream(self) -> IoStream {
        match self.kind {
            RelayKind::Tcp(s) => Box::new(s),
            RelayKind::Stream(s) => s,
        }
    }

    /// The typed socket, when this endpoint is a bare one.
    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.kind {
            RelayKind::Tcp(s) => Some(s),
            RelayKind::Stream(_) => None,
        }
    }

    fn is_tcp(&self) -> bool {
        matches!(self.kind, RelayKind::Tcp(_))
    }
}

/// Relay between the remote conn `rc` and the local conn `lc` until either
/// direction ends, then close both. Byte totals stream into the shared
/// counters; the return value is the downloaded (rc→lc) total.
pub async fn relay(
    target: &Address,
    rc: RelayConn,
    lc: RelayConn,
    download_count: Arc<AtomicU64>,
    upload_count: Arc<AtomicU64>,
) -> u64 {
    let up_strategy = select_strategy(true, &lc.caps, &rc.caps);
    let down_strategy = select_strategy(true, &rc.caps, &lc.caps);
    debug!(
        target = %target,
        up = ?up_strategy,
        down = ?down_strategy,
        "relay: strategies selected"
    );

    #[cfg(target_os = "linux")]
    if up_strategy == CopyStrategy::Splice
        && down_strategy == CopyStrategy::Splice
        && rc.is_tcp()
        && lc.is_tcp()
    {
        let (RelayKind::Tcp(mut r), RelayKind::Tcp(mut l)) = (rc.kind, lc.kind) else {
            unreachable!("is_tcp checked");
        };
        debug!("relay: copying with splice");
        match tokio_splice::zero_copy_bidirectional(&mut l, &mut r).await {
            Ok((up, down)) => {
                upload_count.fetch_add(up, Ordering::Relaxed);
                download_count.fetch_add(down, Ordering::Relaxed);
                return down;
            }
            Err(e) => {
                debug!(error = %e, "relay: splice failed, falling back to classic");
                let down = match tokio::io::copy_bidirectional(&mut l, &mut r).await {
                    Ok((up, down)) => {
                        upload_count.fetch_add(up, Ordering::Relaxed);
                        download_count.fetch_add(down, Ordering::Relaxed);
                        down
                    }
                    Err(e) => {
                        debug!(error = %e, "relay: ended");
                        0
                    }
                };
                return down;
            }
        }
    }

    let down_local = Arc::new(AtomicU64::new(0));
    let (rr, rw) = tokio::io::split(rc.into_stream());
    let (lr, lw) = tokio::io::split(lc.into_stream());

    let upload = {
        let counter = upload_count.clone();
        tokio::spawn(async move { copy_direction(lr, rw, up_strategy, counter).await })
    };
    let download = {
        let counter = download_count.clone();
        let local = down_local.clone();
        tokio::spawn(async move {
            let n = copy_direction(rr, lw, down_strategy, counter).await;
            local.fetch_add(n, Ordering::Relaxed);
            n
        })
    };

    // First direction to finish tears the tunnel down; aborting drops the
    // halves, which closes both conns exactly once.
    let mut upload = upload;
    let mut download = download;
    tokio::select! {
        _ = &mut upload => download.abort(),
        _ = &mut download => upload.abort(),
    }
    let _ = upload.await;
    let _ = download.await;

    let n = down_local.load(Ordering::Relaxed);
    debug!(target = %target, bytes = n, "relay: finished");
    n
}

/// Copy one direction with the chosen strategy, streaming the byte count
/// into `counter`. Splice is a whole-tunnel strategy; a direction that
/// lands here with it degrades to classic.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    strategy: CopyStrategy,
    counter: Arc<AtomicU64>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = match strategy {
        CopyStrategy::Vectored => copy_vectored(&mut reader, &mut writer, &counter).await,
        CopyStrategy::Splice | CopyStrategy::Classic => {
            copy_classic(&mut reader, &mut writer, &counter).await
        }
    };
    if let Err(e) = &result {
        debug!(error = %e, "relay: direction ended");
    }
    let _ = writer.shutdown().await;
    result.unwrap_or(0)
}

async fn copy_classic<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CLASSIC_BUF];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Gather up to [`VECTORED_BUFS`] reads without blocking past the first,
/// then push them out with one vectored write.
async fn copy_vectored<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bufs: Vec<Vec<u8>> = vec![vec![0u8; VECTORED_BUF_LEN]; VECTORED_BUFS];
    let mut total = 0u64;
    loop {
        // First read awaits; the rest only take what is already pending.
        let n = reader.read(&mut bufs[0]).await?;
        if n == 0 {
            return Ok(total);
        }
        let mut lens = vec![n];
        for buf in bufs.iter_mut().skip(1) {
            match read_now(reader, buf).await? {
                Some(0) | None => break,
                Some(n) => lens.push(n),
            }
        }
        let batch: u64 = lens.iter().map(|&n| n as u64).sum();
        write_all_vectored(writer, &bufs, &lens).await?;
        writer.flush().await?;
        total += batch;
        counter.fetch_add(batch, Ordering::Relaxed);
    }
}

/// Poll one read without waiting: `None` means nothing is buffered yet.
async fn read_now<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<Option<usize>> {
    use std::task::Poll;
    futures::future::poll_fn(|cx| {
        let mut rb = tokio::io::ReadBuf::new(buf);
        match std::pin::Pin::new(&mut *reader).poll_read(cx, &mut rb) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(rb.filled().len()))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Ready(Ok(None)),
        }
    })
    .await
}

/// Write the filled prefixes of `bufs` with vectored writes, advancing
/// across partially-written slices. The source buffers are never touched.
async fn write_all_vectored<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bufs: &[Vec<u8>],
    lens: &[usize],
) -> std::io::Result<()> {
    let mut offset = 0u64;
    let total: u64 = lens.iter().map(|&n| n as u64).sum();
    while offset < total {
        let mut slices = Vec::with_capacity(lens.len());
        let mut skipped = 0u64;
        for (buf, &len) in bufs.iter().zip(lens) {
            let end = skipped + len as u64;
            if end > offset {
                let start = (offset.max(skipped) - skipped) as usize;
                slices.push(IoSlice::new(&buf[start..len]));
            }
            skipped = end;
        }
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "vectored write stalled",
            ));
        }
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use tokio::io::duplex;

    #[test]
    fn strategy_matrix() {
        let basic = ConnCaps::basic();
        let multi = ConnCaps::multi();
        let plain = ConnCaps::plain();

        if system_can_splice() {
            assert_eq!(select_strategy(true, &basic, &basic), CopyStrategy::Splice);
        } else {
            assert_eq!(
                select_strategy(true, &basic, &basic),
                CopyStrategy::Vectored
            );
        }
        // MultiRead reader against a non-multi writer must not go vectored.
        assert_eq!(select_strategy(true, &multi, &plain), CopyStrategy::Classic);
        assert_eq!(select_strategy(true, &multi, &multi), CopyStrategy::Vectored);
        assert_eq!(select_strategy(true, &plain, &plain), CopyStrategy::Classic);
        // Global readv switch forces classic for wrapped conns.
        assert_eq!(select_strategy(false, &multi, &multi), CopyStrategy::Classic);
    }

    #[tokio::test]
    async fn classic_copy_counts() {
        let (mut a, b) = duplex(1024);
        let (c, mut d) = duplex(1024);
        let counter = Arc::new(AtomicU64::new(0));
        let c2 = counter.clone();
        let task = tokio::spawn(async move {
            let (br, _bw) = tokio::io::split(b);
            let (_cr, cw) = tokio::io::split(c);
            copy_direction(br, cw, CopyStrategy::Classic, c2).await
        });
        use tokio::io::AsyncWriteExt;
        a.write_all(b"0123456789").await.unwrap();
        drop(a);
        let n = task.await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut d, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn vectored_copy_preserves_order() {
        let (mut a, b) = duplex(64 * 1024);
        let (c, mut d) = duplex(64 * 1024);
        let counter = Arc::new(AtomicU64::new(0));
        let c2 = counter.clone();
        let task = tokio::spawn(async move {
            let (br, _bw) = tokio::io::split(b);
            let (_cr, cw) = tokio::io::split(c);
            copy_direction(br, cw, CopyStrategy::Vectored, c2).await
        });
        use tokio::io::AsyncWriteExt;
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();
        tokio::spawn(async move {
            a.write_all(&payload).await.unwrap();
            drop(a);
        });
        let n = task.await.unwrap();
        assert_eq!(n, expect.len() as u64);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut d, &mut out)
            .await
            .unwrap();
        assert_eq!(out, expect);
    }

    #[tokio::test]
    async fn relay_closes_both_sides() {
        let (a_local, a_relay) = duplex(1024);
        let (b_relay, b_remote) = duplex(1024);
        let down = Arc::new(AtomicU64::new(0));
        let up = Arc::new(AtomicU64::new(0));
        let target = Address::parse(Network::Tcp, "example.com:80").unwrap();

        let relay_task = tokio::spawn({
            let down = down.clone();
            let up = up.clone();
            async move {
                relay(
                    &target,
                    RelayConn::plain(Box::new(b_relay)),
                    RelayConn::plain(Box::new(a_relay)),
                    down,
                    up,
                )
                .await
            }
        });

        let (mut lr, mut lw) = tokio::io::split(a_local);
        let (mut rr, mut rw) = tokio::io::split(b_remote);
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        lw.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        rr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        rw.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        lr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Remote hangs up; the relay must finish and report the download.
        drop(rw);
        drop(rr);
        let n = relay_task.await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(down.load(Ordering::Relaxed), 4);
        assert_eq!(up.load(Ordering::Relaxed), 4);
    }
}
