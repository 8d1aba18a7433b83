use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// A known peer device with all of its advertised addresses
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub device_id: String,
    pub ipv4: Vec<String>,
    /// round-trip time in seconds to the peer's best address, `0.0` if unknown or unreachable
    pub rtt: f64,
}

impl PeerRecord {
    pub fn new(device_id: impl Into<String>, ipv4: Vec<String>) -> PeerRecord {
        PeerRecord {
            device_id: device_id.into(),
            ipv4,
            rtt: 0.0,
        }
    }
}

/// The database of known peers. Peers are added and removed by discovery, which is not part of
///  this crate.
///
/// `update_rtt` is called concurrently for different peers, and implementations must support that.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkDb: Send + Sync + 'static {
    async fn get_list(&self) -> anyhow::Result<Vec<PeerRecord>>;

    /// Sets the RTT of the peer with this device id and leaves the rest of its record alone. The
    ///  peer may have been removed since it was listed, and that is not an error.
    async fn update_rtt(&self, device_id: String, rtt: f64) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryNetworkDb {
    peers: RwLock<FxHashMap<String, PeerRecord>>,
}

impl MemoryNetworkDb {
    pub fn new() -> MemoryNetworkDb {
        Default::default()
    }

    pub async fn insert(&self, record: PeerRecord) {
        self.peers.write().await
            .insert(record.device_id.clone(), record);
    }

    pub async fn remove(&self, device_id: &str) -> Option<PeerRecord> {
        self.peers.write().await
            .remove(device_id)
    }

    pub async fn get(&self, device_id: &str) -> Option<PeerRecord> {
        self.peers.read().await
            .get(device_id)
            .cloned()
    }
}

#[async_trait]
impl NetworkDb for MemoryNetworkDb {
    async fn get_list(&self) -> anyhow::Result<Vec<PeerRecord>> {
        let mut result = self.peers.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        result.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(result)
    }

    async fn update_rtt(&self, device_id: String, rtt: f64) -> anyhow::Result<()> {
        match self.peers.write().await.get_mut(&device_id) {
            Some(record) => record.rtt = rtt,
            None => debug!("peer {} was removed before its RTT could be stored", device_id),
        }
        Ok(())
    }
}
