//! UDP relay: the parallel form of the byte relay for message
//! connections, plus the full-cone variant that opens a fresh outbound
//! channel per remote target.

use crate::address::Address;
use crate::proxy::MsgConn;
#[cfg(test)]
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// NAT-style idle timeout for a UDP association.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(180);

/// Relay datagrams between the outbound conn `rc` and the ingress conn
/// `lc` until either side errors or goes idle. Returns downloaded bytes.
pub async fn relay_udp(
    rc: Arc<dyn MsgConn>,
    lc: Arc<dyn MsgConn>,
    download_count: Arc<AtomicU64>,
    upload_count: Arc<AtomicU64>,
) -> u64 {
    let down_total = Arc::new(AtomicU64::new(0));

    let upload = {
        let rc = rc.clone();
        let lc = lc.clone();
        let counter = upload_count.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::time::timeout(UDP_TIMEOUT, lc.read_msg()).await;
                let (data, target) = match msg {
                    Ok(Ok(v)) => v,
                    Ok(Err(e)) => {
                        debug!(error = %e, "udp relay: ingress read ended");
                        break;
                    }
                    Err(_) => {
                        debug!("udp relay: ingress idle timeout");
                        break;
                    }
                };
                counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                if let Err(e) = rc.write_msg(data, &target).await {
                    debug!(error = %e, "udp relay: outbound write ended");
                    break;
                }
            }
        })
    };

    let download = {
        let rc = rc.clone();
        let lc = lc.clone();
        let counter = download_count.clone();
        let total = down_total.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::time::timeout(UDP_TIMEOUT, rc.read_msg()).await;
                let (data, from) = match msg {
                    Ok(Ok(v)) => v,
                    Ok(Err(e)) => {
                        debug!(error = %e, "udp relay: outbound read ended");
                        break;
                    }
                    Err(_) => {
                        debug!("udp relay: outbound idle timeout");
                        break;
                    }
                };
                counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                total.fetch_add(data.len() as u64, Ordering::Relaxed);
                if let Err(e) = lc.write_msg(data, &from).await {
                    debug!(error = %e, "udp relay: ingress write ended");
                    break;
                }
            }
        })
    };

    let mut upload = upload;
    let mut download = download;
    tokio::select! {
        _ = &mut upload => download.abort(),
        _ = &mut download => upload.abort(),
    }
    let _ = upload.await;
    let _ = download.await;
    let _ = rc.close_msg().await;
    let _ = lc.close_msg().await;
    down_total.load(Ordering::Relaxed)
}

/// Dial callback for the full-cone relay: produce a fresh outbound
/// channel toward `target`, or `None` when the dial fails.
pub type UdpDialFn =
    Arc<dyn Fn(Address) -> BoxFuture<'static, Option<Arc<dyn MsgConn>>> + Send + Sync>;

/// Full-cone UDP relay: every distinct remote target learned from the
/// ingress gets its own outbound channel; replies from each channel are
/// tagged with that channel's target and funneled back to the ingress.
pub async fn relay_udp_separate(
    first_rc: Arc<dyn MsgConn>,
    lc: Arc<dyn MsgConn>,
    first_target: Address,
    download_count: Arc<AtomicU64>,
    upload_count: Arc<AtomicU64>,
    dial: UdpDialFn,
) -> u64 {
    let down_total = Arc::new(AtomicU64::new(0));
    let channels: Arc<Mutex<HashMap<String, Arc<dyn MsgConn>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    channels
        .lock()
        .await
        .insert(first_target.host_port(), first_rc.clone());

    let spawn_download = |rc: Arc<dyn MsgConn>, remote: Address| {
        let lc = lc.clone();
        let counter = download_count.clone();
        let total = down_total.clone();
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(UDP_TIMEOUT, rc.read_msg()).await {
                    Ok(Ok((data, _from))) => {
                        counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                        total.fetch_add(data.len() as u64, Ordering::Relaxed);
                        if lc.write_msg(data, &remote).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            let _ = rc.close_msg().await;
        })
    };

    spawn_download(first_rc, first_target);

    loop {
        let msg = tokio::time::timeout(UDP_TIMEOUT, lc.read_msg()).await;
        let (data, target) = match msg {
            Ok(Ok(v)) => v,
            _ => break,
        };
        upload_count.fetch_add(data.len() as u64, Ordering::Relaxed);

        let key = target.host_port();
        let existing = { channels.lock().await.get(&key).cloned() };
        let rc = match existing {
            Some(rc) => rc,
            None => {
                debug!(target = %key, "udp full-cone: dialing new channel");
                match dial(target.clone()).await {
                    Some(rc) => {
                        channels.lock().await.insert(key, rc.clone());
                        spawn_download(rc.clone(), target.clone());
                        rc
                    }
                    None => {
                        debug!(target = %key, "udp full-cone: dial failed, dropping datagram");
                        continue;
                    }
                }
            }
        };
        if rc.write_msg(data, &target).await.is_err() {
            channels.lock().await.remove(&target.host_port());
        }
    }

    for (_, rc) in channels.lock().await.drain() {
        let _ = rc.close_msg().await;
    }
    let _ = lc.close_msg().await;
    down_total.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// In-memory MsgConn: read side pops from a channel, writes are
    /// captured on another.
    struct ChanMsgConn {
        rx: Mutex<mpsc::Receiver<(Bytes, Address)>>,
        tx: mpsc::Sender<(Bytes, Address)>,
    }

    impl ChanMsgConn {
        fn pair() -> (Arc<Self>, mpsc::Sender<(Bytes, Address)>, mpsc::Receiver<(Bytes, Address)>)
        {
            let (in_tx, in_rx) = mpsc::channel(16);
            let (out_tx, out_rx) = mpsc::channel(16);
            (
                Arc::new(Self {
                    rx: Mutex::new(in_rx),
                    tx: out_tx,
                }),
                in_tx,
                out_rx,
            )
        }
    }

    #[async_trait]
    impl MsgConn for ChanMsgConn {
        async fn read_msg(&self) -> std::io::Result<(Bytes, Address)> {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed"))
        }

        async fn write_msg(&self, data: Bytes, target: &Address) -> std::io::Result<()> {
            self.tx
                .send((data, target.clone()))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        async fn close_msg(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn addr(s: &str) -> Address {
        Address::parse(Network::Udp, s).unwrap()
    }

    #[tokio::test]
    async fn udp_relay_both_directions() {
        let (ingress, ingress_feed, mut ingress_sink) = ChanMsgConn::pair();
        let (outbound, outbound_feed, mut outbound_sink) = ChanMsgConn::pair();
        let down = Arc::new(AtomicU64::new(0));
        let up = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(relay_udp(
            outbound.clone(),
            ingress.clone(),
            down.clone(),
            up.clone(),
        ));

        let dst = addr("1.2.3.4:53");
        ingress_feed
            .send((Bytes::from_static(b"query"), dst.clone()))
            .await
            .unwrap();
        let (data, to) = outbound_sink.recv().await.unwrap();
        assert_eq!(&data[..], b"query");
        assert_eq!(to, dst);

        outbound_feed
            .send((Bytes::from_static(b"answer!"), dst.clone()))
            .await
            .unwrap();
        let (data, from) = ingress_sink.recv().await.unwrap();
        assert_eq!(&data[..], b"answer!");
        assert_eq!(from, dst);

        // Closing the ingress feed ends the upload direction.
        drop(ingress_feed);
        let n = task.await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(up.load(Ordering::Relaxed), 5);
        assert_eq!(down.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn full_cone_opens_channel_per_target() {
        let (ingress, ingress_feed, _ingress_sink) = ChanMsgConn::pair();
        let (first_out, _first_feed, mut first_sink) = ChanMsgConn::pair();
        let (second_out, _second_feed, mut second_sink) = ChanMsgConn::pair();
        let down = Arc::new(AtomicU64::new(0));
        let up = Arc::new(AtomicU64::new(0));

        let second_slot: Arc<std::sync::Mutex<Option<Arc<dyn MsgConn>>>> =
            Arc::new(std::sync::Mutex::new(Some(second_out)));
        let dialed = Arc::new(AtomicU64::new(0));
        let dial: UdpDialFn = {
            let slot = second_slot.clone();
            let dialed = dialed.clone();
            Arc::new(move |_t| {
                let slot = slot.clone();
                let dialed = dialed.clone();
                Box::pin(async move {
                    dialed.fetch_add(1, Ordering::Relaxed);
                    slot.lock().unwrap().take()
                })
            })
        };

        let t1 = addr("1.1.1.1:53");
        let t2 = addr("8.8.8.8:53");
        let task = tokio::spawn(relay_udp_separate(
            first_out,
            ingress,
            t1.clone(),
            down,
            up,
            dial,
        ));

        ingress_feed
            .send((Bytes::from_static(b"to-first"), t1.clone()))
            .await
            .unwrap();
        let (d, _) = first_sink.recv().await.unwrap();
        assert_eq!(&d[..], b"to-first");

        ingress_feed
            .send((Bytes::from_static(b"to-second"), t2.clone()))
            .await
            .unwrap();
        let (d, _) = second_sink.recv().await.unwrap();
        assert_eq!(&d[..], b"to-second");
        assert_eq!(dialed.load(Ordering::Relaxed), 1);

        // Same target reuses the channel, no extra dial.
        ingress_feed
            .send((Bytes::from_static(b"again"), t2.clone()))
            .await
            .unwrap();
        let (d, _) = second_sink.recv().await.unwrap();
        assert_eq!(&d[..], b"again");
        assert_eq!(dialed.load(Ordering::Relaxed), 1);

        drop(ingress_feed);
        task.await.unwrap();
    }
}
