//! Common surface of the advanced-layer carriers (WebSocket, gRPC-shaped
//! HTTP/2, QUIC). The three variants are distinguished by a capability
//! pair and dispatched through tagged enums so the pipeline stays free of
//! generics.

use crate::dialer::{DialError, IoStream};
use bytes::Bytes;

/// Upper bound on the early-data preamble a single-stream carrier may
/// smuggle inside its upgrade request.
pub const MAX_EARLY_DATA_LEN: usize = 2048;

/// Capability triple describing an advanced-layer carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvCapabilities {
    /// Owns its own transport (QUIC): listening and dialing bypass the
    /// generic TCP path entirely.
    pub is_super: bool,
    /// Carries many logical substreams per underlying conn.
    pub is_mux: bool,
    /// Validates HTTP headers itself; the generic header wrapper is
    /// skipped when true.
    pub can_handle_headers: bool,
}

/// What a failed advanced-layer accept leaves behind for the fallback
/// engine.
pub struct FallbackMeta {
    pub path: String,
    pub method: String,
    /// The handled connection: replays the raw request body and exposes
    /// the response writer as a bidirectional stream.
    pub conn: IoStream,
    /// Serialized HTTP/1 request, present when the mismatch is replayed
    /// as plain bytes.
    pub h1_request_buf: Option<Vec<u8>>,
    /// Set when the failed ingress was an HTTP/2 request; the fallback
    /// engine must take the H2C round-trip path.
    pub is_h2: bool,
    pub h2_request: Option<H2FallbackRequest>,
}

impl std::fmt::Debug for FallbackMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackMeta")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("is_h2", &self.is_h2)
            .field(
                "h1_request_buf",
                &self.h1_request_buf.as_ref().map(|b| b.len()),
            )
            .finish()
    }
}

/// An HTTP/2 request captured for the H2C fallback round-trip, together
/// with the handle used to answer the original client.
pub struct H2FallbackRequest {
    pub parts: http::request::Parts,
    pub body: h2::RecvStream,
    pub respond: h2::server::SendResponse<Bytes>,
}

/// Error surface of a single-stream advanced-layer accept.
#[derive(Debug, thiserror::Error)]
pub enum SingleAcceptError {
    /// Path or required-header mismatch; the request is preserved for
    /// fallback.
    #[error("should fallback: {} {}", .0.method, .0.path)]
    ShouldFallback(Box<FallbackMeta>),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
