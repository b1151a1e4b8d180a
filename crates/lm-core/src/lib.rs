//! lm-core: the connection pipeline of the laminar proxy.
//!
//! Home of the pieces that are protocol-agnostic: the address model, the
//! relay engine with its copy strategies, routing, the fallback engine,
//! PROXY protocol emitters, the proxy-layer traits, and the orchestrator
//! that threads an accepted connection through carrier layers, handshake,
//! fallback, routing and outbound dialing.

pub mod address;
pub mod error;
pub mod fallback;
pub mod pipeline;
pub mod proxy;
pub mod proxy_protocol;
pub mod relay;
pub mod router;
pub mod stats;
pub mod udp;

pub use address::{Address, Network, TargetDescription};
pub use error::HandshakeError;
pub use pipeline::{listen_server, AdvClient, AdvServer, Client, ListenerHandle, Server, TlsOut};
pub use proxy::{MsgConn, ProxyClient, ProxyServer, ServerHandshake, FIRST_PAYLOAD_TIMEOUT};
pub use router::{RoutePolicy, RouteRule, RoutingEnv, DIRECT_TAG};
