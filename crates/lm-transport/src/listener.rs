//! Listening side of the carrier layer: TCP and Unix acceptors plus the
//! socket options applied on both listen and dial.

use crate::dialer::{DialError, IoStream};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Socket options shared by listeners and dialers. All fields are
/// best-effort: an option the platform rejects is logged and skipped.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SockOpt {
    #[serde(default)]
    pub reuse_port: bool,
    /// SO_BINDTODEVICE-style interface name.
    #[serde(default)]
    pub bind_interface: Option<String>,
}

fn apply_sockopt(sock: &socket2::Socket, opt: &SockOpt) {
    if opt.reuse_port {
        #[cfg(unix)]
        if let Err(e) = sock.set_reuse_port(true) {
            tracing::warn!(error = %e, "sockopt: reuse_port not applied");
        }
    }
    #[cfg(target_os = "linux")]
    if let Some(ref dev) = opt.bind_interface {
        if let Err(e) = sock.bind_device(Some(dev.as_bytes())) {
            tracing::warn!(error = %e, interface = %dev, "sockopt: bind_interface not applied");
        }
    }
    #[cfg(not(target_os = "linux"))]
    if let Some(ref dev) = opt.bind_interface {
        tracing::warn!(interface = %dev, "sockopt: bind_interface unsupported on this platform");
    }
}

/// Accepted connections from either address family, erased to a stream.
pub enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Acceptor {
    pub async fn accept(&self) -> std::io::Result<(IoStream, Option<SocketAddr>)> {
        match self {
            Acceptor::Tcp(l) => {
                let (s, peer) = l.accept().await?;
                s.set_nodelay(true).ok();
                Ok((Box::new(s), Some(peer)))
            }
            #[cfg(unix)]
            Acceptor::Unix(l) => {
                let (s, _) = l.accept().await?;
                Ok((Box::new(s), None))
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Acceptor::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Acceptor::Unix(_) => None,
        }
    }
}

/// Bind a TCP listener with the given socket options.
pub async fn listen_tcp(addr: &str, opt: &SockOpt) -> Result<Acceptor, DialError> {
    let sa: SocketAddr = addr
        .parse()
        .map_err(|e| DialError::Other(format!("bad listen addr {addr}: {e}")))?;
    let domain = if sa.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let sock = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    apply_sockopt(&sock, opt);
    sock.set_nonblocking(true)?;
    sock.bind(&sa.into())?;
    sock.listen(1024)?;
    let l = TcpListener::from_std(sock.into())?;
    Ok(Acceptor::Tcp(l))
}

/// Bind a Unix socket listener; `path` is removed first if it is a stale
/// socket file.
#[cfg(unix)]
pub async fn listen_unix(path: &str) -> Result<Acceptor, DialError> {
    let _ = std::fs::remove_file(path);
    let l = tokio::net::UnixListener::bind(path)?;
    Ok(Acceptor::Unix(l))
}

/// Dial a TCP target by socket address with options applied.
pub async fn dial_tcp(sa: SocketAddr, opt: &SockOpt) -> Result<TcpStream, DialError> {
    if sa.is_ipv6() && !host_has_ipv6() {
        return Err(DialError::NoIpv6OnHost);
    }
    let domain = if sa.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let sock = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    apply_sockopt(&sock, opt);
    sock.set_nonblocking(true)?;
    let std_stream: std::net::TcpStream = sock.into();
    let stream = tokio::net::TcpSocket::from_std_stream(std_stream).connect(sa).await?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Cheap probe for an IPv6 default route: try binding an unspecified v6
/// UDP socket. The result is computed once per process.
pub fn host_has_ipv6() -> bool {
    use std::sync::OnceLock;
    static HAS_V6: OnceLock<bool> = OnceLock::new();
    *HAS_V6.get_or_init(|| std::net::UdpSocket::bind("[::]:0").is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_listen_accept_roundtrip() {
        let acc = listen_tcp("127.0.0.1:0", &SockOpt::default()).await.unwrap();
        let addr = acc.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        let (mut conn, peer) = acc.accept().await.unwrap();
        assert!(peer.is_some());
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn dial_tcp_applies_nodelay() {
        let acc = listen_tcp("127.0.0.1:0", &SockOpt::default()).await.unwrap();
        let addr = acc.local_addr().unwrap();
        let s = dial_tcp(addr, &SockOpt::default()).await.unwrap();
        assert!(s.nodelay().unwrap());
    }
}
