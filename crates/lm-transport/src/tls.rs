//! TLS carrier layer: client dialer decorator and server acceptor
//! configuration, both on rustls.

use crate::dialer::{DialError, Dialer, IoStream};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Client-side TLS parameters derived from a dial descriptor.
#[derive(Debug, Clone, Default)]
pub struct TlsClientParams {
    /// SNI host; falls back to the dialed host when empty.
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
    /// Skip certificate verification (`insecure = true` in config).
    pub insecure: bool,
}

/// TLS dialer wrapping any inner dialer.
pub struct TlsDialer {
    pub inner: Box<dyn Dialer>,
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: Option<String>,
}

impl TlsDialer {
    pub fn new(inner: Box<dyn Dialer>, params: &TlsClientParams) -> Self {
        Self {
            inner,
            config: client_config(params),
            server_name: params.server_name.clone(),
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError> {
        let stream = self.inner.connect(host, port).await?;
        let sni = self.server_name.as_deref().unwrap_or(host);
        let sn = ServerName::try_from(sni.to_string())
            .map_err(|e| DialError::Tls(format!("bad server name {sni}: {e}")))?;
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        let tls = connector
            .connect(sn, stream)
            .await
            .map_err(|e| DialError::Tls(format!("client handshake: {e}")))?;
        Ok(Box::new(tls))
    }
}

/// Build a rustls client config from dial parameters. Secure mode uses the
/// webpki root store; insecure mode installs [`NoVerify`].
pub fn client_config(params: &TlsClientParams) -> Arc<rustls::ClientConfig> {
    let mut cfg = if params.insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    cfg.alpn_protocols = params.alpn.iter().map(|a| a.as_bytes().to_vec()).collect();
    Arc::new(cfg)
}

/// Load a server-side acceptor from PEM cert/key paths.
pub fn server_acceptor(
    cert_path: &str,
    key_path: &str,
    alpn: &[String],
) -> Result<TlsAcceptor, DialError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let mut cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DialError::Tls(format!("server config: {e}")))?;
    cfg.alpn_protocols = alpn.iter().map(|a| a.as_bytes().to_vec()).collect();
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

/// Generate a throwaway self-signed server config, used by the admin API
/// listener and by tests.
pub fn self_signed_server_config(
    hosts: Vec<String>,
) -> Result<Arc<rustls::ServerConfig>, DialError> {
    let ck = rcgen::generate_simple_self_signed(hosts)
        .map_err(|e| DialError::Tls(format!("self-signed cert: {e}")))?;
    let cert = CertificateDer::from(ck.cert.der().to_vec());
    let key = PrivateKeyDer::try_from(ck.key_pair.serialize_der())
        .map_err(|e| DialError::Tls(format!("self-signed key: {e}")))?;
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| DialError::Tls(format!("server config: {e}")))?;
    Ok(Arc::new(cfg))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, DialError> {
    let f = std::fs::File::open(path)?;
    let mut rd = BufReader::new(f);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut rd).collect();
    certs.map_err(|e| DialError::Tls(format!("read certs {path}: {e}")))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, DialError> {
    let f = std::fs::File::open(path)?;
    let mut rd = BufReader::new(f);
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut rd)
        .next()
        .transpose()
        .map_err(|e| DialError::Tls(format!("read pkcs8 key {path}: {e}")))?
    {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }
    let f = std::fs::File::open(path)?;
    let mut rd = BufReader::new(f);
    let key = rustls_pemfile::rsa_private_keys(&mut rd)
        .next()
        .ok_or_else(|| DialError::Tls(format!("no private key in {path}")))?
        .map_err(|e| DialError::Tls(format!("read rsa key {path}: {e}")))?;
    Ok(PrivateKeyDer::Pkcs1(key))
}

/// Certificate verifier that accepts everything. Installed only when the
/// user sets `insecure = true` on a dial entry.
#[derive(Debug)]
pub struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            ECDSA_NISTP256_SHA256,
            RSA_PKCS1_SHA384,
            ECDSA_NISTP384_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::TcpDialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn client_config_sets_alpn() {
        let cfg = client_config(&TlsClientParams {
            alpn: vec!["h2".into(), "http/1.1".into()],
            ..Default::default()
        });
        assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn insecure_client_talks_to_self_signed_server() {
        let server_cfg = self_signed_server_config(vec!["localhost".into()]).unwrap();
        let acceptor = TlsAcceptor::from(server_cfg);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let srv = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(s).await.unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            tls.write_all(b"world").await.unwrap();
            tls.shutdown().await.ok();
        });

        let dialer = TlsDialer {
            inner: Box::new(TcpDialer),
            config: client_config(&TlsClientParams {
                insecure: true,
                server_name: Some("localhost".into()),
                ..Default::default()
            }),
            server_name: Some("localhost".into()),
        };
        let mut conn = dialer.connect("127.0.0.1", addr.port()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        srv.await.unwrap();
    }
}
