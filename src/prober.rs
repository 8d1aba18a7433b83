use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ProberConfig, TransportConfig};
use crate::envelope::{Action, Envelope};
use crate::error::DispatchResult;
use crate::netdb::{NetworkDb, PeerRecord};
use crate::transport::send_request;

/// A single liveness probe, returning the round-trip time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Pinger: Send + Sync + 'static {
    async fn ping(&self, ip: String) -> DispatchResult<Duration>;
}

/// Sends an unencrypted `APIV1Ping` envelope and measures the time until any reply arrives
pub struct UdpPinger {
    port: u16,
    transport: TransportConfig,
}

impl UdpPinger {
    pub fn new(port: u16, transport: TransportConfig) -> UdpPinger {
        UdpPinger {
            port,
            transport,
        }
    }
}

#[async_trait]
impl Pinger for UdpPinger {
    async fn ping(&self, ip: String) -> DispatchResult<Duration> {
        let endpoint = match ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", ip, self.port),
        };
        let buf = Envelope::new(Action::Ping, Vec::new()).encode()?;

        let started = Instant::now();
        send_request(&endpoint, &buf, &self.transport).await?;
        Ok(started.elapsed())
    }
}

/// Periodically measures the round-trip time to every known peer, and stores each peer's best
///  RTT across all its addresses in the network database.
///
/// Each round re-reads the peer list, so membership changes are picked up with the next round.
///  Rounds do not overlap: the next round starts one interval after all of the previous round's
///  updates are done.
pub struct RttProber {
    config: ProberConfig,
    db: Arc<dyn NetworkDb>,
    pinger: Arc<dyn Pinger>,
}

impl RttProber {
    pub fn new(config: ProberConfig, db: Arc<dyn NetworkDb>, pinger: Arc<dyn Pinger>) -> RttProber {
        RttProber {
            config,
            db,
            pinger,
        }
    }

    pub fn with_udp_pinger(config: ProberConfig, db: Arc<dyn NetworkDb>) -> RttProber {
        let pinger = Arc::new(UdpPinger::new(config.port, config.transport.clone()));
        Self::new(config, db, pinger)
    }

    /// Runs until `shutdown` is cancelled, or until the peer list can not be read. The latter
    ///  stops the prober for good, and the error is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.config.validate()?;
        info!("starting RTT prober with interval {:?}", self.config.interval);

        loop {
            let peers = match self.db.get_list().await {
                Ok(peers) => peers,
                Err(e) => {
                    error!("can not read the peer list - stopping RTT prober: {}", e);
                    return Err(e);
                }
            };

            select! {
                _ = shutdown.cancelled() => break,
                _ = self.probe_round(peers) => {}
            }
            select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.interval) => {}
            }
        }

        info!("shutting down RTT prober");
        Ok(())
    }

    /// probes all peers concurrently, updating each peer independently of the others
    async fn probe_round(&self, peers: Vec<PeerRecord>) {
        debug!("probing {} peers", peers.len());

        let mut updates = JoinSet::new();
        for peer in peers {
            let db = self.db.clone();
            let pinger = self.pinger.clone();
            updates.spawn(async move {
                let rtt = probe_peer(pinger, &peer.ipv4).await;
                debug!(device_id = %peer.device_id, rtt, "measured round-trip time");

                if let Err(e) = db.update_rtt(peer.device_id.clone(), rtt).await {
                    warn!("can not store round-trip time for {}: {}", peer.device_id, e);
                }
            });
        }

        while updates.join_next().await.is_some() {}
    }
}

/// Pings all addresses concurrently and returns the best round-trip time in seconds. A failed
///  probe counts as `0.0`, so the result is `0.0` if all probes fail.
pub async fn probe_peer(pinger: Arc<dyn Pinger>, addresses: &[String]) -> f64 {
    let mut probes = JoinSet::new();
    for addr in addresses {
        let pinger = pinger.clone();
        let addr = addr.clone();
        probes.spawn(async move {
            match pinger.ping(addr.clone()).await {
                Ok(rtt) => rtt.as_secs_f64(),
                Err(e) => {
                    debug!("probing {} failed: {}", addr, e);
                    0.0
                }
            }
        });
    }

    let mut rtts = Vec::with_capacity(addresses.len());
    while let Some(result) = probes.join_next().await {
        rtts.push(result.unwrap_or(0.0));
    }
    select_min_rtt(rtts)
}

/// the smallest strictly positive value, or `0.0` if there is none
pub fn select_min_rtt(rtts: impl IntoIterator<Item = f64>) -> f64 {
    rtts.into_iter()
        .filter(|rtt| *rtt > 0.0)
        .fold(None, |min: Option<f64>, rtt| Some(min.map_or(rtt, |m| m.min(rtt))))
        .unwrap_or(0.0)
}
