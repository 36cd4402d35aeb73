//! UDP advert broadcasting, used by standalone indexnodes (always
//! active and prospective) and by auto-indexnode clients (prospective,
//! active only while elected).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::constants::CAPABILITY_GRANULARITY;
use crate::wire::advert::Advert;

/// What the advertiser should currently say. Implementations answer
/// from live state; the sender re-reads them every interval.
pub trait AdvertSource: Send + Sync + 'static {
    /// There is a running indexnode on `port()`.
    fn is_active(&self) -> bool;
    /// This process could host one, at `capability()`.
    fn is_prospective(&self) -> bool;
    fn port(&self) -> u16;
    fn capability(&self) -> u64;
    fn advert_uid(&self) -> u64;
}

/// Self-reported election fitness: rounded down to a coarse granularity
/// with a random tail, so hosts of similar capacity tie-break randomly
/// rather than thrashing.
pub fn generate_capability_value() -> u64 {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1);
    let raw = parallelism * 64 * 1024 * 1024;
    let rounded = (raw / CAPABILITY_GRANULARITY) * CAPABILITY_GRANULARITY;
    rounded + rand::thread_rng().gen_range(0..CAPABILITY_GRANULARITY)
}

/// Spawn the periodic advert sender.
pub(crate) fn spawn_advertiser(
    source: Arc<dyn AdvertSource>,
    advert_port: u16,
    interval: Duration,
    running: Arc<tokio::sync::RwLock<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "cannot bind advert socket, not advertising");
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!(error = %e, "cannot enable broadcast, not advertising");
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        let mut warned = false;
        loop {
            ticker.tick().await;
            if !*running.read().await {
                break;
            }
            let mut datagrams = Vec::new();
            if source.is_active() {
                datagrams.push(
                    Advert::Active {
                        port: source.port(),
                        advert_uid: source.advert_uid(),
                    }
                    .encode(),
                );
            }
            if source.is_prospective() {
                datagrams.push(
                    Advert::Prospective {
                        capability: source.capability(),
                        advert_uid: source.advert_uid(),
                    }
                    .encode(),
                );
            }
            for datagram in datagrams {
                let target = (Ipv4Addr::BROADCAST, advert_port);
                if let Err(e) = socket.send_to(datagram.as_bytes(), target).await {
                    if !warned {
                        warn!(error = %e, "advert send failed, retrying silently");
                        warned = true;
                    }
                }
            }
        }
        debug!("advertiser stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_is_rounded_with_noise() {
        for _ in 0..32 {
            let cap = generate_capability_value();
            let tail = cap % CAPABILITY_GRANULARITY;
            let base = cap - tail;
            assert_eq!(base % CAPABILITY_GRANULARITY, 0);
            assert!(cap >= CAPABILITY_GRANULARITY, "some real base value");
        }
    }

    #[test]
    fn capability_varies_between_calls() {
        let all_same = (0..16)
            .map(|_| generate_capability_value())
            .collect::<std::collections::HashSet<_>>()
            .len()
            == 1;
        assert!(!all_same, "noise tail should differ");
    }

    struct FixedSource;
    impl AdvertSource for FixedSource {
        fn is_active(&self) -> bool {
            true
        }
        fn is_prospective(&self) -> bool {
            true
        }
        fn port(&self) -> u16 {
            42424
        }
        fn capability(&self) -> u64 {
            1_000_000
        }
        fn advert_uid(&self) -> u64 {
            7
        }
    }

    #[tokio::test]
    async fn advertiser_sends_both_forms() {
        // Listen on an ephemeral port and point the advertiser at it.
        let listener = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let running = Arc::new(tokio::sync::RwLock::new(true));
        let handle = spawn_advertiser(
            Arc::new(FixedSource),
            port,
            Duration::from_millis(50),
            running.clone(),
        );

        let mut seen_active = false;
        let mut seen_prospective = false;
        let mut buf = [0u8; 256];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while (!seen_active || !seen_prospective) && tokio::time::Instant::now() < deadline {
            let recv = tokio::time::timeout(Duration::from_millis(500), listener.recv(&mut buf));
            let Ok(Ok(n)) = recv.await else { continue };
            match Advert::parse(&String::from_utf8_lossy(&buf[..n])) {
                Some(Advert::Active { port, advert_uid }) => {
                    assert_eq!(port, 42424);
                    assert_eq!(advert_uid, 7);
                    seen_active = true;
                }
                Some(Advert::Prospective {
                    capability,
                    advert_uid,
                }) => {
                    assert_eq!(capability, 1_000_000);
                    assert_eq!(advert_uid, 7);
                    seen_prospective = true;
                }
                None => {}
            }
        }
        *running.write().await = false;
        handle.abort();
        assert!(seen_active && seen_prospective);
    }
}
