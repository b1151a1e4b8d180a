//! End-to-end pipeline scenarios over loopback sockets: ingress proxy
//! handshakes, routing to a direct egress, fallback replay, UDP
//! associates and the inner-mux chain.

use lm_core::fallback::FallbackTable;
use lm_core::pipeline::{Client, ListenerHandle, Server};
use lm_core::{Address, Network};
use lm_transport::SockOpt;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

fn direct_client() -> Arc<Client> {
    Arc::new(Client {
        tag: Some("direct".into()),
        addr: None,
        network: Network::Tcp,
        sockopt: SockOpt::default(),
        proxy: lm_adapters::new_client("direct", "", false, false).unwrap(),
        inner_mux_client: None,
        mux_pool: None,
        tls: None,
        tls_lazy: false,
        header: None,
        adv: None,
    })
}

fn plain_server(protocol: &str, uuid: &str) -> Server {
    let proxy = lm_adapters::new_server(protocol, uuid, None).unwrap();
    Server {
        tag: None,
        addr: Address::parse(Network::Tcp, "127.0.0.1:0").unwrap(),
        sockopt: SockOpt::default(),
        inner_mux_server: proxy
            .inner_mux_protocol()
            .map(|p| lm_adapters::new_server(p, "", None).unwrap()),
        proxy,
        tls: None,
        tls_lazy: false,
        header: None,
        adv: None,
        fallback: FallbackTable::default(),
        no_route: false,
    }
}

async fn start_listener(server: Server, client: Arc<Client>) -> (ListenerHandle, SocketAddr) {
    let handle = lm_core::listen_server(Arc::new(server), client, None)
        .await
        .unwrap();
    let addr = handle.local_addr.unwrap();
    (handle, addr)
}

/// Echo server that mirrors everything back.
async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut s, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if s.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn socks5_connect(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut s = TcpStream::connect(proxy).await.unwrap();
    s.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut r = [0u8; 2];
    s.read_exact(&mut r).await.unwrap();
    assert_eq!(r, [0x05, 0x00]);

    let target: SocketAddr = target.parse().unwrap();
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    match target {
        SocketAddr::V4(v4) => req.extend_from_slice(&v4.ip().octets()),
        SocketAddr::V6(_) => unreachable!("v4 only in tests"),
    }
    req.extend_from_slice(&target.port().to_be_bytes());
    s.write_all(&req).await.unwrap();
    let mut rep = [0u8; 10];
    s.read_exact(&mut rep).await.unwrap();
    assert_eq!(rep[1], 0x00);
    s
}

#[tokio::test]
async fn e1_socks5_to_direct_tcp_one_mib() {
    let echo = start_tcp_echo().await;
    let (listener, proxy_addr) = start_listener(plain_server("socks5", ""), direct_client()).await;

    let mut s = socks5_connect(proxy_addr, &echo.to_string()).await;

    let mut payload = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);
    let expect = payload.clone();

    let (mut rd, mut wr) = s.split();
    let writer = async {
        wr.write_all(&payload).await.unwrap();
        wr.flush().await.unwrap();
    };
    let reader = async {
        let mut got = vec![0u8; expect.len()];
        rd.read_exact(&mut got).await.unwrap();
        got
    };
    let (_, got) = tokio::join!(writer, reader);
    assert_eq!(got, expect);

    listener.abort();
}

#[tokio::test]
async fn e2_socks5_udp_associate_full_flow() {
    // Local UDP echo playing the remote target.
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, from)) = remote.recv_from(&mut buf).await else {
                return;
            };
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            let _ = remote.send_to(&reply, from).await;
        }
    });

    let (listener, proxy_addr) = start_listener(plain_server("socks5", ""), direct_client()).await;

    // Associate with a placeholder address.
    let mut control = TcpStream::connect(proxy_addr).await.unwrap();
    control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut r = [0u8; 2];
    control.read_exact(&mut r).await.unwrap();
    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut rep = [0u8; 10];
    control.read_exact(&mut rep).await.unwrap();
    assert_eq!(rep[1], 0x00);
    let relay_port = u16::from_be_bytes([rep[8], rep[9]]);

    // First datagram declares the true target.
    let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut pkt = vec![0, 0, 0, 0x01];
    let SocketAddr::V4(v4) = remote_addr else {
        unreachable!()
    };
    pkt.extend_from_slice(&v4.ip().octets());
    pkt.extend_from_slice(&remote_addr.port().to_be_bytes());
    pkt.extend_from_slice(b"ping");
    local
        .send_to(&pkt, ("127.0.0.1", relay_port))
        .await
        .unwrap();

    // The reply comes back through the associate socket with the header.
    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        local.recv_from(&mut buf),
    )
    .await
    .expect("udp reply in time")
    .unwrap();
    assert!(n > 10);
    assert_eq!(&buf[n - 7..n], b"re:ping");

    // The TCP control conn is still alive throughout.
    control.write_all(&[0x00]).await.unwrap();

    listener.abort();
}

#[tokio::test]
async fn e3_trojan_fallback_replays_exact_bytes() {
    // Fallback upstream records everything it receives.
    let fb_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fb_addr = fb_listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (mut s, _) = fb_listener.accept().await.unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        while got.len() < 32 + 16 {
            match s.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => got.extend_from_slice(&buf[..n]),
            }
        }
        let _ = tx.send(got);
    });

    let mut server = plain_server("trojan", "correct-password");
    server.fallback = FallbackTable::with_default(
        Address::from_socket_addr(Network::Tcp, fb_addr),
        0,
    );
    let (listener, proxy_addr) = start_listener(server, direct_client()).await;

    // 32 bytes of junk, then more stream data.
    let mut junk = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut junk);
    // Keep it above the minimum sniff length and clearly non-trojan.
    junk[0] = b'X';
    let mut s = TcpStream::connect(proxy_addr).await.unwrap();
    s.write_all(&junk).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    s.write_all(b"rest-of-the-flow").await.unwrap();

    let got = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
        .await
        .expect("fallback received in time")
        .unwrap();
    let mut expect = junk.clone();
    expect.extend_from_slice(b"rest-of-the-flow");
    assert_eq!(got, expect);

    listener.abort();
}

#[tokio::test]
async fn inner_mux_socks5_to_trojan_chain() {
    // user → socks5 ingress → trojan+mux egress → trojan ingress (mux
    // accept, simplesocks inside) → direct → echo.
    let echo = start_tcp_echo().await;

    let (trojan_listener, trojan_addr) =
        start_listener(plain_server("trojan", "chain-pass"), direct_client()).await;

    let trojan_client = Arc::new(Client {
        tag: Some("mux-out".into()),
        addr: Some(Address::from_socket_addr(Network::Tcp, trojan_addr)),
        network: Network::Tcp,
        sockopt: SockOpt::default(),
        proxy: lm_adapters::new_client("trojan", "chain-pass", true, false).unwrap(),
        inner_mux_client: Some(lm_adapters::new_client("simplesocks", "", false, false).unwrap()),
        mux_pool: Some(lm_transport::multiplex::MuxClientPool::new()),
        tls: None,
        tls_lazy: false,
        header: None,
        adv: None,
    });

    let (socks_listener, socks_addr) =
        start_listener(plain_server("socks5", ""), trojan_client.clone()).await;

    // Two sequential flows share the one mux session.
    for i in 0..2u8 {
        let mut s = socks5_connect(socks_addr, &echo.to_string()).await;
        let msg = format!("mux-flow-{i}");
        s.write_all(msg.as_bytes()).await.unwrap();
        let mut got = vec![0u8; msg.len()];
        tokio::time::timeout(std::time::Duration::from_secs(5), s.read_exact(&mut got))
            .await
            .expect("echo in time")
            .unwrap();
        assert_eq!(got, msg.as_bytes());
    }

    // Tear the session down; the next flow must trigger one full redial
    // and still succeed.
    trojan_client.mux_pool.as_ref().unwrap().close().await;
    let mut s = socks5_connect(socks_addr, &echo.to_string()).await;
    s.write_all(b"after-redial").await.unwrap();
    let mut got = vec![0u8; 12];
    tokio::time::timeout(std::time::Duration::from_secs(5), s.read_exact(&mut got))
        .await
        .expect("redial echo in time")
        .unwrap();
    assert_eq!(&got, b"after-redial");

    socks_listener.abort();
    trojan_listener.abort();
}

#[tokio::test]
async fn routing_reject_tag_closes_connection() {
    let echo = start_tcp_echo().await;

    let reject = Arc::new(Client {
        tag: Some("blackhole".into()),
        addr: None,
        network: Network::Tcp,
        sockopt: SockOpt::default(),
        proxy: lm_adapters::new_client("reject", "", false, false).unwrap(),
        inner_mux_client: None,
        mux_pool: None,
        tls: None,
        tls_lazy: false,
        header: None,
        adv: None,
    });

    let mut env = lm_core::RoutingEnv::new();
    env.policy = Some(lm_core::RoutePolicy::new(vec![lm_core::RouteRule {
        ip_cidr: vec![lm_core::router::IpCidr::parse("127.0.0.0/8").unwrap()],
        out_tag: "blackhole".into(),
        ..Default::default()
    }]));
    env.clients_by_tag = [("blackhole".to_string(), reject)].into_iter().collect();

    let server = Arc::new(plain_server("socks5", ""));
    let handle = lm_core::listen_server(server, direct_client(), Some(Arc::new(env)))
        .await
        .unwrap();
    let proxy_addr = handle.local_addr.unwrap();

    let mut s = socks5_connect(proxy_addr, &echo.to_string()).await;
    s.write_all(b"anything").await.unwrap();
    // The reject client closes without relaying; the read ends quickly.
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(std::time::Duration::from_secs(5), s.read(&mut buf))
        .await
        .expect("closed in time")
        .unwrap_or(0);
    assert_eq!(n, 0);

    handle.abort();
}
