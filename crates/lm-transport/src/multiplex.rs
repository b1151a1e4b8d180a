//! Inner stream multiplexing, layered above a proxy-layer carrier.
//!
//! One logical mux session lives over one outer connection; every payload
//! flow becomes a stream inside it. yamux fills the smux role here: same
//! shape (client/server modes, bidirectional streams, keep-alive), and the
//! session must be driven, so each session owns a driver task and the
//! handles talk to it over channels.
//!
//! Opening a stream on a dead session yields [`MuxError::NeedRedial`]; the
//! pipeline redials the full outer stack exactly once and installs a new
//! session.

use crate::dialer::IoStream;
use futures::future::poll_fn;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MuxError {
    /// No live session; the caller must redial the outer stack and call
    /// [`MuxClientPool::install`] before retrying.
    #[error("mux session dead, outer redial required")]
    NeedRedial,

    #[error("mux: {0}")]
    Session(String),
}

fn mux_config() -> yamux::Config {
    yamux::Config::default()
}

type StreamRequest = oneshot::Sender<Result<yamux::Stream, String>>;

/// Handle to one live client-mode session.
struct MuxSession {
    open_tx: mpsc::Sender<StreamRequest>,
}

impl MuxSession {
    /// Spawn the driver for `conn` in client mode. One task owns the
    /// yamux connection; open requests and inbound progress are polled
    /// together so the session keeps moving even when nobody is opening.
    fn start(conn: IoStream) -> Self {
        let (open_tx, mut open_rx) = mpsc::channel::<StreamRequest>(16);
        tokio::spawn(async move {
            let mut connection =
                yamux::Connection::new(conn.compat(), mux_config(), yamux::Mode::Client);
            let mut pending: Option<StreamRequest> = None;
            poll_fn(|cx| {
                if pending.is_none() {
                    match open_rx.poll_recv(cx) {
                        std::task::Poll::Ready(Some(req)) => pending = Some(req),
                        // All handles dropped: the session is abandoned.
                        std::task::Poll::Ready(None) => return std::task::Poll::Ready(()),
                        std::task::Poll::Pending => {}
                    }
                }
                if pending.is_some() {
                    if let std::task::Poll::Ready(res) = connection.poll_new_outbound(cx) {
                        let reply = pending.take().expect("pending request");
                        let failed = res.is_err();
                        let _ = reply.send(res.map_err(|e| e.to_string()));
                        if failed {
                            return std::task::Poll::Ready(());
                        }
                        // Pick up the next queued request on the same wake.
                        cx.waker().wake_by_ref();
                    }
                }
                loop {
                    match connection.poll_next_inbound(cx) {
                        // A client-mode peer is not expected to accept
                        // streams; draining keeps the session alive.
                        std::task::Poll::Ready(Some(Ok(stream))) => drop(stream),
                        std::task::Poll::Ready(Some(Err(e))) => {
                            debug!(error = %e, "mux: client session error");
                            return std::task::Poll::Ready(());
                        }
                        std::task::Poll::Ready(None) => return std::task::Poll::Ready(()),
                        std::task::Poll::Pending => break,
                    }
                }
                std::task::Poll::Pending
            })
            .await;
            debug!("mux: client session driver finished");
        });
        Self { open_tx }
    }

    async fn open_stream(&self) -> Result<IoStream, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| MuxError::NeedRedial)?;
        match rx.await {
            Ok(Ok(stream)) => Ok(Box::new(stream.compat())),
            Ok(Err(e)) => Err(MuxError::Session(e)),
            Err(_) => Err(MuxError::NeedRedial),
        }
    }
}

/// At most one logical session per outbound client. The pool only holds
/// the handle; liveness is discovered by trying to open.
#[derive(Default)]
pub struct MuxClientPool {
    session: Mutex<Option<Arc<MuxSession>>>,
}

impl MuxClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn established(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Install a fresh session over a newly dialed outer conn.
    pub async fn install(&self, conn: IoStream) {
        let mut guard = self.session.lock().await;
        *guard = Some(Arc::new(MuxSession::start(conn)));
    }

    /// Open a stream on the current session. `NeedRedial` both reports a
    /// dead session and clears it, so the caller's redial starts clean.
    pub async fn open_stream(&self) -> Result<IoStream, MuxError> {
        let session = { self.session.lock().await.clone() };
        let Some(session) = session else {
            return Err(MuxError::NeedRedial);
        };
        match session.open_stream().await {
            Ok(s) => Ok(s),
            Err(MuxError::NeedRedial) | Err(MuxError::Session(_)) => {
                self.close().await;
                Err(MuxError::NeedRedial)
            }
        }
    }

    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        *guard = None;
    }
}

/// Run `conn` in server mode, yielding accepted substreams until the
/// session dies. Used by proxy servers when they see a MUX command.
pub fn serve_session(conn: IoStream) -> mpsc::Receiver<IoStream> {
    let (tx, rx) = mpsc::channel::<IoStream>(16);
    tokio::spawn(async move {
        let mut connection =
            yamux::Connection::new(conn.compat(), mux_config(), yamux::Mode::Server);
        loop {
            match poll_fn(|cx| connection.poll_next_inbound(cx)).await {
                Some(Ok(stream)) => {
                    if tx.send(Box::new(stream.compat())).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "mux: server session error");
                    break;
                }
                None => break,
            }
        }
        debug!("mux: server session finished");
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn open_without_session_needs_redial() {
        let pool = MuxClientPool::new();
        assert!(matches!(
            pool.open_stream().await,
            Err(MuxError::NeedRedial)
        ));
    }

    #[tokio::test]
    async fn client_server_stream_roundtrip() {
        let (client_end, server_end) = duplex(64 * 1024);

        let mut accepted = serve_session(Box::new(server_end));
        let echo = tokio::spawn(async move {
            while let Some(mut s) = accepted.recv().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4];
                    s.read_exact(&mut buf).await.unwrap();
                    s.write_all(&buf).await.unwrap();
                });
            }
        });

        let pool = MuxClientPool::new();
        pool.install(Box::new(client_end)).await;
        assert!(pool.established().await);

        for payload in [b"abcd", b"wxyz"] {
            let mut s = pool.open_stream().await.unwrap();
            s.write_all(payload).await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, payload);
        }
        drop(pool);
        echo.abort();
    }

    #[tokio::test]
    async fn dead_session_clears_and_reports_redial() {
        let (client_end, server_end) = duplex(1024);
        let pool = MuxClientPool::new();
        pool.install(Box::new(client_end)).await;
        drop(server_end);

        // The first open may still succeed at the yamux layer before the
        // driver notices EOF; eventually the pool must demand a redial.
        let mut saw_redial = false;
        for _ in 0..4 {
            match pool.open_stream().await {
                Err(MuxError::NeedRedial) => {
                    saw_redial = true;
                    break;
                }
                Err(MuxError::Session(_)) => {}
                Ok(mut s) => {
                    // Writing into a dead session must fail.
                    let _ = s.write_all(b"x").await;
                    let _ = s.flush().await;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(saw_redial || !pool.established().await);
    }
}
