//! PROXY protocol preamble emitters (v1 text, v2 binary), carrying the
//! original client address pair to a fallback upstream.

use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Build the preamble for version 1 or 2. Other versions yield `None`.
pub fn build_preamble(version: u8, src: SocketAddr, dst: SocketAddr) -> Option<Vec<u8>> {
    match version {
        1 => Some(build_v1(src, dst)),
        2 => Some(build_v2(src, dst)),
        _ => None,
    }
}

fn build_v1(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let family = if src.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {family} {} {} {} {}\r\n",
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
    .into_bytes()
}

fn build_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 36);
    out.extend_from_slice(&V2_SIGNATURE);
    out.push(0x21); // version 2, command PROXY
    match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => {
            out.push(0x11); // AF_INET, STREAM
            out.extend_from_slice(&12u16.to_be_bytes());
            out.extend_from_slice(&s.ip().octets());
            out.extend_from_slice(&d.ip().octets());
            out.extend_from_slice(&s.port().to_be_bytes());
            out.extend_from_slice(&d.port().to_be_bytes());
        }
        _ => {
            let s6 = match src {
                SocketAddr::V6(s) => s.ip().octets(),
                SocketAddr::V4(s) => s.ip().to_ipv6_mapped().octets(),
            };
            let d6 = match dst {
                SocketAddr::V6(d) => d.ip().octets(),
                SocketAddr::V4(d) => d.ip().to_ipv6_mapped().octets(),
            };
            out.push(0x21); // AF_INET6, STREAM
            out.extend_from_slice(&36u16.to_be_bytes());
            out.extend_from_slice(&s6);
            out.extend_from_slice(&d6);
            out.extend_from_slice(&src.port().to_be_bytes());
            out.extend_from_slice(&dst.port().to_be_bytes());
        }
    }
    out
}

/// Write the preamble to a fresh outbound conn. Version 0 (or unknown)
/// writes nothing.
pub async fn write_preamble<W: AsyncWrite + Unpin>(
    conn: &mut W,
    version: u8,
    src: SocketAddr,
    dst: SocketAddr,
) -> std::io::Result<()> {
    if let Some(pre) = build_preamble(version, src, dst) {
        conn.write_all(&pre).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_text_shape() {
        let src: SocketAddr = "192.168.1.10:51000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let pre = build_preamble(1, src, dst).unwrap();
        assert_eq!(
            String::from_utf8(pre).unwrap(),
            "PROXY TCP4 192.168.1.10 10.0.0.1 51000 443\r\n"
        );
    }

    #[test]
    fn v2_binary_header() {
        let src: SocketAddr = "192.168.1.10:51000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let pre = build_preamble(2, src, dst).unwrap();
        assert_eq!(&pre[..12], &V2_SIGNATURE);
        assert_eq!(pre[12], 0x21);
        assert_eq!(pre[13], 0x11);
        assert_eq!(pre.len(), 16 + 12);
    }

    #[test]
    fn version_zero_is_silent() {
        let src: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(build_preamble(0, src, src).is_none());
        assert!(build_preamble(3, src, src).is_none());
    }
}
