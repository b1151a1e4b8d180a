//! lm-transport: carrier layers for the laminar proxy.
//!
//! Everything between the raw socket and the proxy protocol lives here:
//! the dialer/listener abstraction, TLS (including the lazy-TLS tee
//! recorder), the fixed HTTP header disguise, and the three advanced-layer
//! carriers (WebSocket single-stream, gRPC-shaped HTTP/2 multiplex per
//! connection, QUIC super-multiplex with session pooling) plus the
//! inner stream mux layered above proxy protocols.
//!
//! The crate also centralizes the transport dependencies (tokio, rustls,
//! quinn, h2, tungstenite, yamux) so versions stay consistent across the
//! workspace.

pub mod advanced;
pub mod dialer;
pub mod grpc;
pub mod h2c;
pub mod header;
pub mod listener;
pub mod multiplex;
pub mod quic;
pub mod tls;
pub mod tls_lazy;
pub mod util;
pub mod websocket;

pub use advanced::{AdvCapabilities, FallbackMeta, H2FallbackRequest, SingleAcceptError};
pub use dialer::{AsyncReadWrite, DialError, Dialer, FnDialer, IoStream, TcpDialer};
#[cfg(unix)]
pub use dialer::UnixDialer;
pub use listener::{dial_tcp, host_has_ipv6, listen_tcp, Acceptor, SockOpt};
pub use util::ReplayStream;
