//! Error kinds consumed by the pipeline orchestrator.

use lm_transport::IoStream;
use thiserror::Error;

/// Result of a failed ingress proxy handshake.
#[derive(Error)]
pub enum HandshakeError {
    /// The peer is not speaking our protocol but the consumed bytes are
    /// intact; the fallback engine may replay them verbatim. The conn
    /// rides along so the rest of the stream can follow the replay.
    #[error("handshake reject after {} bytes: {reason}", buf.len())]
    Reject {
        buf: Vec<u8>,
        reason: String,
        conn: Option<IoStream>,
    },

    /// Malformed or credential-invalid with no recoverable bytes.
    #[error("handshake fatal: {0}")]
    Fatal(String),

    /// The handshake spawned its own handler (inner-mux accept loop);
    /// the orchestrator must not relay this connection itself.
    #[error("handled elsewhere")]
    Handled,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl std::fmt::Debug for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Reject { buf, reason, conn } => f
                .debug_struct("Reject")
                .field("buf_len", &buf.len())
                .field("reason", reason)
                .field("has_conn", &conn.is_some())
                .finish(),
            HandshakeError::Fatal(r) => f.debug_tuple("Fatal").field(r).finish(),
            HandshakeError::Handled => f.write_str("Handled"),
            HandshakeError::Io(e) => f.debug_tuple("Io").field(e).finish(),
        }
    }
}

impl HandshakeError {
    pub fn reject(buf: impl Into<Vec<u8>>, reason: impl Into<String>, conn: IoStream) -> Self {
        Self::Reject {
            buf: buf.into(),
            reason: reason.into(),
            conn: Some(conn),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Extract the replay buffer and the surviving conn, if this failure
    /// carries them.
    pub fn into_replay(self) -> Option<(Vec<u8>, Option<IoStream>)> {
        match self {
            HandshakeError::Reject { buf, conn, .. } => Some((buf, conn)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reject_keeps_bytes_and_conn() {
        let (a, _b) = tokio::io::duplex(8);
        let e = HandshakeError::reject(b"abc".to_vec(), "bad magic", Box::new(a));
        let (buf, conn) = e.into_replay().unwrap();
        assert_eq!(buf, b"abc");
        assert!(conn.is_some());
        assert!(HandshakeError::fatal("x").into_replay().is_none());
    }
}
