//! Treasury Sync - Signer node for DAO treasuries
//!
//! A shared treasury is governed by two independent programs: a governance
//! program (proposals and council votes) and a multisig program (N-of-M
//! approvals over a vault). This node keeps the two in step. An integrated
//! proposal is a governance proposal whose description links to a multisig
//! vault transaction. Votes and executions made through this node advance
//! the linked transaction, and stalled transactions can be resumed from the
//! proposal alone.
//!
//! Each signer runs their own node with their own key. Nodes share no state
//! beyond what the two programs hold.

mod chain;
mod config;
mod error;
mod governance;
mod link;
mod models;
mod multisig;
mod provision;
mod recovery;
mod routes;
mod state;
mod sync;
mod transfer;

use crate::chain::{Cluster, LocalCluster, RpcCluster};
use crate::config::{ClusterKind, Settings};
use crate::routes::create_router;
use crate::state::AppState;
use solana_keypair::Keypair;
use solana_native_token::LAMPORTS_PER_SOL;
use solana_signer::Signer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Balance given to the operator wallet on a fresh local cluster
const LOCALNET_AIRDROP_LAMPORTS: u64 = 1_000 * LAMPORTS_PER_SOL;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting Treasury Sync signer node...");

    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let signer = match settings.load_signer()? {
        Some(keypair) => keypair,
        None => {
            warn!("⚠️  SIGNER_KEYPAIR not set, using an ephemeral keypair");
            Keypair::new()
        }
    };
    info!("🔑 Signer: {}", signer.pubkey());

    let cluster: Arc<dyn Cluster> = match &settings.cluster.kind {
        ClusterKind::Localnet => {
            let local = LocalCluster::new();
            local.airdrop(&signer.pubkey(), LOCALNET_AIRDROP_LAMPORTS).await;
            info!(
                "✅ In-memory localnet ready (RPC endpoint {} unused)",
                settings.cluster.rpc_endpoint
            );
            Arc::new(local)
        }
        kind => {
            let rpc = RpcCluster::new(settings.cluster.rpc_endpoint.clone())?;
            let blockhash = rpc.latest_blockhash().await?;
            info!(
                "✅ Connected to {:?} at {} (blockhash {})",
                kind, settings.cluster.rpc_endpoint, blockhash
            );
            Arc::new(rpc)
        }
    };

    if let Some(realm) = settings.sync.active_realm {
        info!("🏛️  Active realm: {}", realm);
    }

    let state = Arc::new(AppState::new(signer, cluster, &settings));
    let app = create_router(state, &settings);

    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── DAO ───");
    info!("   POST /api/dao                                   - Create realm, governance and multisig");
    info!("   POST /api/dao/fund                              - Fund treasury or vault");
    info!("");
    info!("   ─── Proposals ───");
    info!("   POST /api/proposals                             - Treasury transfer proposal");
    info!("   POST /api/proposals/integrated                  - Multisig-backed transfer proposal");
    info!("   GET  /api/proposals/{{address}}                   - Proposal with linked multisig status");
    info!("   POST /api/proposals/{{address}}/vote              - Vote and sync multisig");
    info!("   POST /api/proposals/{{address}}/execute           - Execute and sync multisig");
    info!("   POST /api/proposals/{{address}}/multisig/approve  - Approve linked transaction");
    info!("   POST /api/proposals/{{address}}/multisig/execute  - Execute linked transaction");
    info!("   POST /api/proposals/{{address}}/multisig/advance  - Approve, execute if ready");
    info!("");
    info!("   ─── Multisig ───");
    info!("   GET  /api/multisig/{{address}}/transactions              - Open transactions");
    info!("   GET  /api/multisig/{{address}}/transactions/{{index}}      - Approval status");
    info!("   POST /api/multisig/{{address}}/transactions/{{index}}/approve");
    info!("   POST /api/multisig/{{address}}/transactions/{{index}}/execute");
    info!("   POST /api/multisig/{{address}}/transactions/{{index}}/advance");
    info!("");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,treasury_sync=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
