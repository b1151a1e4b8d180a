//! gRPC carrier integration: substream matching, wire framing across the
//! h2 boundary, fallback metas for mismatched requests, and the H2C
//! fallback round trip.

use bytes::Bytes;
use lm_transport::grpc::{bounded_channels, GrpcClient, GrpcServer, GrpcServerConfig};
use lm_transport::h2c::H2cTransportMap;
use lm_transport::IoStream;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

fn server(service: &str) -> GrpcServer {
    GrpcServer::new(GrpcServerConfig {
        service_name: service.into(),
        required_headers: vec![],
        fallback_to_h1: false,
    })
}

#[tokio::test]
async fn substream_roundtrip_through_framing() {
    let (client_end, server_end) = duplex(64 * 1024);
    let srv = server("TunnelService");
    let (sub_tx, mut sub_rx, fb_tx, _fb_rx) = bounded_channels();

    tokio::spawn(async move {
        srv.start_handle(Box::new(server_end) as IoStream, sub_tx, fb_tx)
            .await;
    });

    let client = GrpcClient::new("TunnelService".into(), "example.com:443".into());
    let transport = client
        .new_transport(Box::new(client_end) as IoStream)
        .await
        .unwrap();

    let mut sub1 = client.dial_sub_conn(&transport).await.unwrap();
    let mut srv_sub1 = sub_rx.recv().await.expect("first substream");

    sub1.write_all(b"hello grpc").await.unwrap();
    let mut buf = [0u8; 10];
    srv_sub1.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello grpc");

    srv_sub1.write_all(b"pong").await.unwrap();
    let mut buf = [0u8; 4];
    sub1.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    // A second substream over the same transport.
    let mut sub2 = client.dial_sub_conn(&transport).await.unwrap();
    let mut srv_sub2 = sub_rx.recv().await.expect("second substream");
    sub2.write_all(b"two").await.unwrap();
    let mut buf = [0u8; 3];
    srv_sub2.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");
}

#[tokio::test]
async fn wrong_path_produces_h2_fallback_meta() {
    let (client_end, server_end) = duplex(64 * 1024);
    let srv = server("TunnelService");
    let (sub_tx, _sub_rx, fb_tx, mut fb_rx) = bounded_channels();

    tokio::spawn(async move {
        srv.start_handle(Box::new(server_end) as IoStream, sub_tx, fb_tx)
            .await;
    });

    // Raw h2 client issuing a plain POST to the wrong path.
    let (mut sr, conn) = h2::client::handshake(client_end).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = http::Request::builder()
        .method("POST")
        .uri("http://example.com/wrong-path")
        .header("content-type", "text/plain")
        .body(())
        .unwrap();
    let (_response, mut body) = sr.send_request(request, false).unwrap();
    body.send_data(Bytes::from_static(b"request body"), true)
        .unwrap();

    let meta = tokio::time::timeout(std::time::Duration::from_secs(5), fb_rx.recv())
        .await
        .expect("fallback meta in time")
        .expect("channel open");
    assert!(meta.is_h2);
    assert_eq!(meta.path, "/wrong-path");
    assert_eq!(meta.method, "POST");
    assert!(meta.h2_request.is_some());
}

#[tokio::test]
async fn e4_h2c_fallback_round_trip() {
    // Fallback upstream: a real cleartext HTTP/2 server answering 200
    // with a body.
    let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = upstream.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut conn = h2::server::handshake(sock).await.unwrap();
                while let Some(Ok((request, mut respond))) = conn.accept().await {
                    assert_eq!(request.uri().path(), "/wrong-path");
                    let response = http::Response::builder()
                        .status(200)
                        .body(())
                        .unwrap();
                    let mut send = respond.send_response(response, false).unwrap();
                    send.send_data(Bytes::from_static(b"fallback says hi"), true)
                        .unwrap();
                }
            });
        }
    });

    // Ingress side: grpc server rejects the request, producing the meta.
    let (client_end, server_end) = duplex(64 * 1024);
    let srv = server("TunnelService");
    let (sub_tx, _sub_rx, fb_tx, mut fb_rx) = bounded_channels();
    tokio::spawn(async move {
        srv.start_handle(Box::new(server_end) as IoStream, sub_tx, fb_tx)
            .await;
    });

    let (mut sr, conn) = h2::client::handshake(client_end).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = http::Request::builder()
        .method("POST")
        .uri("http://example.com/wrong-path")
        .header("content-type", "text/plain")
        .body(())
        .unwrap();
    let (response, mut body) = sr.send_request(request, false).unwrap();
    body.send_data(Bytes::new(), true).unwrap();

    let meta = fb_rx.recv().await.expect("fallback meta");
    let h2_request = meta.h2_request.expect("h2 request captured");

    // Drive the round trip the way the fallback engine does.
    let map = H2cTransportMap::new();
    let path = meta.path.clone();
    tokio::spawn(async move {
        map.round_trip(&upstream_addr.to_string(), 0, None, h2_request, &path)
            .await
            .unwrap();
    });

    // The original client sees the upstream's response streamed back.
    let response = tokio::time::timeout(std::time::Duration::from_secs(5), response)
        .await
        .expect("response in time")
        .unwrap();
    assert_eq!(response.status(), 200);
    let mut body = response.into_body();
    let mut got = Vec::new();
    while let Some(chunk) = futures::future::poll_fn(|cx| body.poll_data(cx)).await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        got.extend_from_slice(&chunk);
    }
    assert_eq!(&got, b"fallback says hi");
}
