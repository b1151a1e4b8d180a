//! Minimal admin API server (opt-in via `--ea`).
//!
//! HTTPS on 127.0.0.1:48345 with a throwaway self-signed cert. Basic
//! auth compares SHA-256 hashes of username and password in constant
//! time. Endpoints:
//!   GET <prefix>/allstate → JSON {active, download_bytes, upload_bytes}

use anyhow::{anyhow, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const ADMIN_ADDR: &str = "127.0.0.1:48345";
const ADMIN_USER: &str = "admin";

struct Auth {
    user_hash: [u8; 32],
    pass_hash: [u8; 32],
}

impl Auth {
    fn new(user: &str, pass: &str) -> Self {
        Self {
            user_hash: Sha256::digest(user.as_bytes()).into(),
            pass_hash: Sha256::digest(pass.as_bytes()).into(),
        }
    }

    fn check(&self, header_value: &str) -> bool {
        let Some(b64) = header_value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(b64.trim()) else {
            return false;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = text.split_once(':') else {
            return false;
        };
        let user_hash: [u8; 32] = Sha256::digest(user.as_bytes()).into();
        let pass_hash: [u8; 32] = Sha256::digest(pass.as_bytes()).into();
        let user_ok: bool = user_hash.ct_eq(&self.user_hash).into();
        let pass_ok: bool = pass_hash.ct_eq(&self.pass_hash).into();
        user_ok && pass_ok
    }
}

pub async fn run_admin_server(path_prefix: &str, admin_pass: &str) -> Result<()> {
    let auth = Arc::new(Auth::new(ADMIN_USER, admin_pass));
    let tls_cfg = lm_transport::tls::self_signed_server_config(vec!["localhost".into()])
        .map_err(|e| anyhow!("admin cert: {e}"))?;
    let acceptor = TlsAcceptor::from(tls_cfg);
    let listener = TcpListener::bind(ADMIN_ADDR).await?;
    info!(addr = ADMIN_ADDR, prefix = %path_prefix, "admin api server listening");

    let prefix = path_prefix.trim_end_matches('/').to_string();
    loop {
        let (conn, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let auth = auth.clone();
        let prefix = prefix.clone();
        tokio::spawn(async move {
            let mut tls = match acceptor.accept(conn).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(error = %e, %peer, "admin tls accept failed");
                    return;
                }
            };
            if let Err(e) = handle_request(&mut tls, &auth, &prefix).await {
                debug!(error = %e, %peer, "admin request failed");
            }
            let _ = tls.shutdown().await;
        });
    }
}

async fn handle_request<S>(conn: &mut S, auth: &Auth, prefix: &str) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut raw = Vec::with_capacity(512);
    let mut tmp = [0u8; 512];
    let head_len = loop {
        let n = conn.read(&mut tmp).await?;
        if n == 0 {
            return Err(anyhow!("closed before request"));
        }
        raw.extend_from_slice(&tmp[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if raw.len() > 8 * 1024 {
            return Err(anyhow!("request too large"));
        }
    };

    let head = String::from_utf8_lossy(&raw[..head_len]).into_owned();
    let mut lines = head.split("\r\n");
    let mut first = lines.next().unwrap_or("").split_whitespace();
    let method = first.next().unwrap_or("");
    let path = first.next().unwrap_or("");

    let authorized = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("Authorization"))
        .map(|(_, v)| auth.check(v.trim()))
        .unwrap_or(false);
    if !authorized {
        write_response(
            conn,
            401,
            "Unauthorized",
            "text/plain",
            b"Unauthorized",
            &[("WWW-Authenticate", "Basic realm=\"restricted\", charset=\"UTF-8\"")],
        )
        .await?;
        return Ok(());
    }

    match (method, path) {
        ("GET", p) if p == format!("{prefix}/allstate") => {
            let (active, download, upload) = lm_core::stats::snapshot();
            let body = serde_json::json!({
                "active_connections": active,
                "download_bytes": download,
                "upload_bytes": upload,
            })
            .to_string();
            write_response(conn, 200, "OK", "application/json", body.as_bytes(), &[]).await?;
        }
        _ => {
            warn!(%method, %path, "admin: unknown endpoint");
            write_response(conn, 404, "Not Found", "text/plain", b"not found", &[]).await?;
        }
    }
    Ok(())
}

async fn write_response<S>(
    conn: &mut S,
    code: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
    extra: &[(&str, &str)],
) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (k, v) in extra {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str("\r\n");
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(body).await?;
    conn.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_accepts_only_exact_credentials() {
        let auth = Auth::new("admin", "s3cret");
        let good = format!("Basic {}", encode("admin:s3cret"));
        let bad_pass = format!("Basic {}", encode("admin:wrong"));
        let bad_user = format!("Basic {}", encode("root:s3cret"));
        assert!(auth.check(&good));
        assert!(!auth.check(&bad_pass));
        assert!(!auth.check(&bad_user));
        assert!(!auth.check("Bearer whatever"));
    }

    fn encode(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }
}
