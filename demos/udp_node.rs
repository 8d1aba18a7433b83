use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use clap_derive::Parser;
use edgerpc::cipher::{CipherContext, Message};
use edgerpc::config::{ProberConfig, ServerConfig};
use edgerpc::netdb::{MemoryNetworkDb, NetworkDb, PeerRecord};
use edgerpc::orchestration::{OrchestrationApi, ServiceRequest, ServiceResponse, TargetInfo};
use edgerpc::prober::RttProber;
use edgerpc::router::ActionRouter;
use edgerpc::transport::UdpServer;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// Runs a node that answers remote orchestration requests by logging them, and probes the
///  round-trip time to its peers.
#[derive(Parser)]
struct Args {
    bind_address: String,

    /// base64 encoded 32 byte key
    #[clap(long)]
    key: Option<String>,

    /// `<device id>=<ip>[,<ip>...]`
    #[clap(long)]
    peer: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingOrchestration;

#[async_trait]
impl OrchestrationApi for LoggingOrchestration {
    async fn execute_app_on_local(&self, app_info: Message) {
        info!("execute: {}", serde_json::Value::Object(app_info));
    }

    async fn handle_notification_on_local(&self, service_id: u64, status: String) -> anyhow::Result<()> {
        info!("service {} is now {}", service_id, status);
        Ok(())
    }

    async fn get_score(&self, device_id: String) -> anyhow::Result<f64> {
        info!("score requested for {}", device_id);
        Ok(1.0)
    }

    async fn request_service(&self, request: ServiceRequest) -> ServiceResponse {
        info!("service requested: {:?}", request);
        ServiceResponse {
            message: "ERROR_NONE".to_string(),
            service_name: request.service_name,
            remote_target_info: TargetInfo::default(),
        }
    }
}

fn parse_peer(s: &str) -> anyhow::Result<PeerRecord> {
    let (device_id, addresses) = s.split_once('=')
        .ok_or_else(|| anyhow!("peer {:?} is not of the form <device id>=<ip>,...", s))?;
    let ipv4 = addresses.split(',')
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    Ok(PeerRecord::new(device_id, ipv4))
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let cipher = Arc::new(CipherContext::new());
    if let Some(key) = &args.key {
        let key = STANDARD.decode(key)?;
        if key.len() != 32 {
            bail!("key must be 32 bytes, was {}", key.len());
        }
        cipher.set_key(&key)?;
    }

    let db = Arc::new(MemoryNetworkDb::new());
    for s in &args.peer {
        db.insert(parse_peer(s)?).await;
    }

    let bind_addr: SocketAddr = args.bind_address.parse()?;
    let server = UdpServer::bind(ServerConfig::new(bind_addr)).await?;

    let router = Arc::new(ActionRouter::new(cipher.clone()));
    router.set_orchestration_api(Arc::new(LoggingOrchestration)).await;

    let prober = RttProber::with_udp_pinger(ProberConfig::default(), db.clone());

    let shutdown = CancellationToken::new();
    let result = select! {
        _ = server.recv_loop(router, shutdown.clone()) => Ok(()),
        result = prober.run(shutdown.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C");
            Ok(())
        }
    };
    shutdown.cancel();

    for peer in db.get_list().await? {
        info!("{}: rtt {:.3}s", peer.device_id, peer.rtt);
    }
    result
}
