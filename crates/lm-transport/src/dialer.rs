//! Dialer abstraction shared by every carrier layer.
//!
//! A [`Dialer`] turns `(host, port)` into an [`IoStream`]. Carrier layers
//! (TLS, header disguise, WebSocket, ...) are decorators over an inner
//! dialer, so a full outbound stack is a chain of dialers ending in
//! [`TcpDialer`] or [`UnixDialer`].

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced while establishing a carrier-layer connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    /// The machine has no IPv6 route but an IPv6 literal was requested.
    /// Logged at warn by callers, not error.
    #[error("no ipv6 on host")]
    NoIpv6OnHost,

    #[error("not supported")]
    NotSupported,

    #[error("other: {0}")]
    Other(String),
}

impl From<tokio::time::error::Elapsed> for DialError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DialError::Other("timeout".into())
    }
}

/// Marker trait for boxed duplex byte streams.
pub trait AsyncReadWrite: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync {}

impl<T> AsyncReadWrite for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync {}

/// Unified boxed stream type passed between layers.
pub type IoStream = Box<dyn AsyncReadWrite>;

/// Async connection dialer. Implementations must be shareable across
/// tasks; stacking is done by wrapping an inner `Box<dyn Dialer>`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError>;
}

/// Plain TCP dialer, the bottom of most stacks.
#[derive(Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError> {
        let s = tokio::net::TcpStream::connect((host, port)).await?;
        s.set_nodelay(true).ok();
        Ok(Box::new(s))
    }
}

/// Unix domain socket dialer; `host` is the filesystem path, the port is
/// ignored.
#[cfg(unix)]
#[derive(Default)]
pub struct UnixDialer;

#[cfg(unix)]
#[async_trait]
impl Dialer for UnixDialer {
    async fn connect(&self, host: &str, _port: u16) -> Result<IoStream, DialError> {
        let s = tokio::net::UnixStream::connect(host).await?;
        Ok(Box::new(s))
    }
}

/// Closure-backed dialer, used by tests to splice in-memory pipes into a
/// layer stack.
pub struct FnDialer<F>(pub F);

#[async_trait]
impl<F> Dialer for FnDialer<F>
where
    F: Send
        + Sync
        + Fn(
            &str,
            u16,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<IoStream, DialError>> + Send>,
        >,
{
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError> {
        (self.0)(host, port).await
    }
}

impl<F> FnDialer<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}
