//! acquira-node — the card-payment acquiring gateway service binary.
//!
//! Startup sequence:
//!   1. Open (or initialise) the gateway database and seed merchants
//!   2. Build the HSM, vault, risk, routing and event components
//!   3. Spawn background workers (webhook retries, event drain, consumers)
//!   4. Start the JSON-RPC 2.0 server
//!   5. Wait for ctrl-c and shut the workers down cooperatively

mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use acquira_degrade::DegradationController;
use acquira_events::{spawn_consumer, EventBus, EventEnvelope, EventHandler, EventPublisher,
                     TOPIC_PAYMENT_EVENTS};
use acquira_fx::{CurrencyConverter, FixedRateProvider};
use acquira_hsm::HsmKeyService;
use acquira_retry::{BackoffPolicy, BreakerRegistry, DeadLetterQueue};
use acquira_risk::{Blacklist, FraudEngine, HeuristicScorer, SandboxAcs, ThreeDsService};
use acquira_router::{PspClient, PspRouter, SandboxPsp};
use acquira_rpc::{RpcServer, RpcServerState};
use acquira_saga::service::GatewayCore;
use acquira_saga::PaymentGateway;
use acquira_store::GatewayDb;
use acquira_token::TokenVault;
use acquira_webhook::{HttpTransport, WebhookDeliveryService, WebhookTransport};

use config::GatewayParams;

#[derive(Parser, Debug)]
#[command(
    name = "acquira-node",
    version,
    about = "Acquira gateway node — card-payment authorization, capture and refunds"
)]
struct Args {
    /// Directory for the persistent gateway database.
    #[arg(long, default_value = "~/.acquira/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8650")]
    rpc_addr: SocketAddr,

    /// Path to gateway params JSON (merchants, PSPs, blacklist).
    #[arg(long)]
    params: Option<PathBuf>,

    /// Cadence of the buffered-event replay worker, in seconds.
    #[arg(long, default_value_t = 30)]
    drain_interval_secs: u64,
}

/// Consumer group that mirrors every bus event into the service log.
struct AuditTrailHandler;

impl EventHandler for AuditTrailHandler {
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), acquira_core::error::GatewayError> {
        info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            payment = %envelope.payload.payment_id,
            status = %envelope.payload.status,
            "payment event consumed"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,acquira=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("acquira gateway node starting");

    // ── Gateway database ──────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db = Arc::new(GatewayDb::open(&data_dir).context("opening gateway database")?);

    // ── Configuration ─────────────────────────────────────────────────────────
    let params = load_params(args.params.as_deref())?;
    for merchant in &params.merchants {
        db.put_merchant(&merchant.to_record()).context("seeding merchant")?;
    }
    info!(merchants = params.merchants.len(), psps = params.psps.len(), "configuration loaded");

    // ── Crypto & vault ────────────────────────────────────────────────────────
    let hsm = Arc::new(HsmKeyService::new());
    let vault = Arc::new(
        TokenVault::new(Arc::clone(&db), Arc::clone(&hsm))
            .map_err(|e| anyhow::anyhow!("building token vault: {e}"))?,
    );

    // ── Risk capabilities ─────────────────────────────────────────────────────
    let degrade = Arc::new(DegradationController::new());
    let blacklist = Arc::new(Blacklist::new());
    for ip in &params.blacklist.ips {
        blacklist.add_ip(ip);
    }
    for device in &params.blacklist.devices {
        blacklist.add_device(device);
    }
    for hash in &params.blacklist.card_hashes {
        blacklist.add_card_hash(hash);
    }
    let fraud = Arc::new(FraudEngine::new(
        Arc::new(HeuristicScorer),
        blacklist,
        params.country_risk.clone(),
        Arc::clone(&degrade),
    ));
    let threeds = Arc::new(ThreeDsService::new(Arc::new(SandboxAcs), Arc::clone(&degrade)));

    // ── PSP routing ───────────────────────────────────────────────────────────
    let mut clients: Vec<Arc<dyn PspClient>> = Vec::new();
    for psp in &params.psps {
        let mut client = SandboxPsp::new(&psp.name);
        for amount in &psp.retryable_amounts {
            let amount = acquira_core::money::Amount::parse(amount)
                .map_err(|e| anyhow::anyhow!("bad retryable amount for {}: {e}", psp.name))?;
            client = client.with_retryable_amount(amount);
        }
        clients.push(Arc::new(client));
    }
    let router = Arc::new(PspRouter::new(
        clients,
        Arc::new(BreakerRegistry::default()),
        BackoffPolicy::default(),
        DeadLetterQueue::new(Arc::clone(&db)),
    ));

    // ── Event pipeline ────────────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let publisher = Arc::new(EventPublisher::new(Arc::clone(&bus), Arc::clone(&degrade)));

    // ── Webhooks ──────────────────────────────────────────────────────────────
    let webhooks = Arc::new(WebhookDeliveryService::new(
        Arc::clone(&db),
        Arc::new(HttpTransport::new()) as Arc<dyn WebhookTransport>,
    ));

    // ── Gateway service ───────────────────────────────────────────────────────
    let core = Arc::new(GatewayCore {
        db: Arc::clone(&db),
        vault,
        fraud,
        threeds,
        router,
        publisher: Arc::clone(&publisher),
        webhooks: Arc::clone(&webhooks),
        degrade: Arc::clone(&degrade),
    });
    let gateway = Arc::new(PaymentGateway::new(core));

    // ── Background workers ────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = spawn_consumer(
        Arc::clone(&bus),
        TOPIC_PAYMENT_EVENTS,
        "gateway-audit",
        Arc::clone(&db),
        Arc::new(AuditTrailHandler),
        shutdown_rx.clone(),
    )
    .map_err(|e| anyhow::anyhow!("starting event consumers: {e}"))?;

    let scheduler_webhooks = Arc::clone(&webhooks);
    let scheduler_shutdown = shutdown_rx.clone();
    worker_handles.push(tokio::spawn(async move {
        scheduler_webhooks.run_scheduler(scheduler_shutdown).await;
    }));

    let drain_publisher = Arc::clone(&publisher);
    let mut drain_shutdown = shutdown_rx.clone();
    let drain_interval = Duration::from_secs(args.drain_interval_secs.max(1));
    worker_handles.push(tokio::spawn(async move {
        let mut tick = tokio::time::interval(drain_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = drain_shutdown.changed() => break,
                _ = tick.tick() => {
                    let drained = drain_publisher.drain_buffered().await;
                    if drained > 0 {
                        info!(drained, "replayed buffered events");
                    }
                }
            }
        }
    }));

    // ── RPC server ────────────────────────────────────────────────────────────
    let converter = Arc::new(CurrencyConverter::new(
        Arc::new(FixedRateProvider::with_defaults()),
        Arc::clone(&degrade),
    ));
    let rpc_state = Arc::new(RpcServerState { gateway, converter });
    let rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    info!("gateway node ready");

    // ── Shutdown ──────────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = rpc_handle.stop();
    db.flush().map_err(|e| anyhow::anyhow!("final flush: {e}"))?;
    info!("gateway node stopped");
    Ok(())
}

/// Load gateway parameters from a JSON file, or fall back to development
/// defaults.
///
/// # Warning
/// The development profile ships a well-known API key. Only use it for local
/// testing.
fn load_params(path: Option<&Path>) -> anyhow::Result<GatewayParams> {
    if let Some(p) = path {
        let json = std::fs::read_to_string(p)
            .with_context(|| format!("reading gateway params from {}", p.display()))?;
        return serde_json::from_str(&json).context("parsing gateway params JSON");
    }
    warn!("No --params provided. Using development defaults — DO NOT USE IN PRODUCTION.");
    Ok(GatewayParams::development())
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
