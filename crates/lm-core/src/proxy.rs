//! Proxy-layer contracts: servers turn an accepted stream into a target
//! address plus an inner stream; clients do the reverse over a dialed
//! stream. Wire formats live in lm-adapters; the pipeline only sees these
//! traits.

use crate::address::Address;
use crate::error::HandshakeError;
use async_trait::async_trait;
use bytes::Bytes;
use lm_transport::IoStream;
use std::time::Duration;

/// Some clients legitimately wait for the server to speak first, so a
/// missing first payload must not kill the tunnel; this bounds how long
/// the outbound handshake waits for it.
pub const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Datagram-oriented connection produced by UDP-capable handshakes.
/// Methods take `&self` so the two relay directions can share one conn;
/// implementations guard their halves internally.
#[async_trait]
pub trait MsgConn: Send + Sync {
    /// Read one datagram and the remote address it belongs to.
    async fn read_msg(&self) -> std::io::Result<(Bytes, Address)>;

    /// Write one datagram toward `target`.
    async fn write_msg(&self, data: Bytes, target: &Address) -> std::io::Result<()>;

    /// Idempotent close.
    async fn close_msg(&self) -> std::io::Result<()>;
}

/// Successful ingress handshake.
pub enum ServerHandshake {
    Tcp {
        stream: IoStream,
        target: Address,
    },
    Udp {
        conn: std::sync::Arc<dyn MsgConn>,
        target: Address,
    },
    /// The peer requested inner multiplexing; the raw stream is to be
    /// handed to the mux server with inner-protocol handshakes inside.
    Mux { stream: IoStream },
}

#[async_trait]
pub trait ProxyServer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handshake(&self, conn: IoStream) -> Result<ServerHandshake, HandshakeError>;

    /// Inner proxy protocol accepted over a MUX command, when supported.
    fn inner_mux_protocol(&self) -> Option<&'static str> {
        None
    }
}

#[async_trait]
pub trait ProxyClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// TCP handshake; `first_payload` may be empty for protocols without
    /// a dedicated request packet it can ride on.
    async fn handshake(
        &self,
        conn: IoStream,
        first_payload: &[u8],
        target: &Address,
    ) -> std::io::Result<IoStream>;

    /// Establish the datagram channel used for every UDP target on this
    /// connection. `conn` is the dialed carrier stream; clients that open
    /// their own socket (direct) receive `None`.
    async fn establish_udp(
        &self,
        conn: Option<IoStream>,
        target: &Address,
    ) -> std::io::Result<std::sync::Arc<dyn MsgConn>>;

    /// Inner-mux kind: 0 = none, 2 = opt-in via config (`use_mux`).
    fn inner_mux_kind(&self) -> u8 {
        0
    }

    /// Protocol used for handshakes inside inner-mux streams.
    fn inner_mux_protocol(&self) -> Option<&'static str> {
        None
    }

    /// Full-cone UDP: one fresh outbound channel per remote target.
    fn is_udp_multi_channel(&self) -> bool {
        false
    }

    /// True when the handshake passes the dialed stream through
    /// unchanged (direct), which keeps bare-socket copy strategies
    /// available.
    fn is_transparent(&self) -> bool {
        false
    }
}
