//! Reject outbound: closes the inbound immediately, no handshake and no
//! dial. Selected by routing rules to drop traffic.

use async_trait::async_trait;
use lm_core::proxy::{MsgConn, ProxyClient};
use lm_core::Address;
use lm_transport::IoStream;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub struct RejectClient;

#[async_trait]
impl ProxyClient for RejectClient {
    fn name(&self) -> &'static str {
        "reject"
    }

    async fn handshake(
        &self,
        mut conn: IoStream,
        _first_payload: &[u8],
        _target: &Address,
    ) -> std::io::Result<IoStream> {
        let _ = conn.shutdown().await;
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "rejected",
        ))
    }

    async fn establish_udp(
        &self,
        _conn: Option<IoStream>,
        _target: &Address,
    ) -> std::io::Result<Arc<dyn MsgConn>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "rejected",
        ))
    }
}
