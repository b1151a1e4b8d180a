//! Shared plumbing for stream-backed datagram conns.

use lm_core::proxy::MsgConn;
use lm_core::Address;
use lm_transport::IoStream;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Split halves guarded separately so read and write directions can run
/// concurrently through `&self` MsgConn methods.
pub(crate) struct SplitStream {
    pub read: Mutex<ReadHalf<IoStream>>,
    pub write: Mutex<WriteHalf<IoStream>>,
}

impl SplitStream {
    pub fn new(conn: IoStream) -> Self {
        let (r, w) = tokio::io::split(conn);
        Self {
            read: Mutex::new(r),
            write: Mutex::new(w),
        }
    }
}

/// A stream treated as a datagram flow toward one fixed target: each
/// read chunk is one message, writes pass through raw.
pub(crate) struct StreamDatagramConn {
    inner: SplitStream,
    target: Address,
}

impl StreamDatagramConn {
    pub fn new(conn: IoStream, target: Address) -> Self {
        Self {
            inner: SplitStream::new(conn),
            target,
        }
    }
}

#[async_trait::async_trait]
impl MsgConn for StreamDatagramConn {
    async fn read_msg(&self) -> std::io::Result<(bytes::Bytes, Address)> {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 16 * 1024];
        let n = self.inner.read.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed",
            ));
        }
        buf.truncate(n);
        Ok((bytes::Bytes::from(buf), self.target.clone()))
    }

    async fn write_msg(&self, data: bytes::Bytes, _target: &Address) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut w = self.inner.write.lock().await;
        w.write_all(&data).await?;
        w.flush().await
    }

    async fn close_msg(&self) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let _ = self.inner.write.lock().await.shutdown().await;
        Ok(())
    }
}
