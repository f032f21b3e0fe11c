//! Application state management
//!
//! Contains shared state accessible across all handlers. Nothing about
//! proposals or multisig transactions is kept here; every handler reads the
//! programs afresh.

use crate::chain::{Cluster, TransactionSender};
use crate::config::Settings;
use crate::error::AppError;
use crate::recovery::Recovery;
use crate::sync::Orchestrator;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Operator key of this signer node
    pub signer: Keypair,

    pub cluster: Arc<dyn Cluster>,

    pub sender: TransactionSender,

    pub orchestrator: Orchestrator,

    pub recovery: Recovery,

    /// Realm used when a request does not name one
    pub active_realm: Option<Pubkey>,
}

impl AppState {
    pub fn new(signer: Keypair, cluster: Arc<dyn Cluster>, settings: &Settings) -> Self {
        let sender = TransactionSender::new(
            cluster.clone(),
            settings.cluster.confirm_attempts,
            settings.cluster.confirm_interval,
        );

        Self {
            signer,
            cluster,
            orchestrator: Orchestrator::new(sender.clone(), settings.sync.sync_delay),
            recovery: Recovery::new(sender.clone()),
            sender,
            active_realm: settings.sync.active_realm,
        }
    }

    /// Realm named by the request, else the configured one
    pub fn realm_or_default(&self, realm: Option<Pubkey>) -> Result<Pubkey, AppError> {
        realm.or(self.active_realm).ok_or_else(|| {
            AppError::Validation("No realm given and ACTIVE_REALM is not configured".to_string())
        })
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
