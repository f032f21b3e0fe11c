//! Manual recovery
//!
//! Works from public state only: the proposal description and the two
//! programs' accounts. Nothing here depends on the process that created the
//! proposal, so a stalled multisig transaction can be resumed from any node.

use crate::chain::accounts::ProposalState;
use crate::chain::{pda, Cluster, TransactionSender};
use crate::error::AppError;
use crate::governance::GovernanceDriver;
use crate::link::{human_description, ProposalLink};
use crate::multisig::{AdvanceOutcome, MultisigDriver, TransactionStatus};
use serde::Serialize;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::sync::Arc;
use tracing::info;

/// A governance proposal together with its linked multisig transaction
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedProposal {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub proposal: Pubkey,
    pub name: String,
    pub description: String,
    pub state: ProposalState,
    pub yes_votes: u64,
    pub no_votes: u64,
    pub link: Option<ProposalLink>,
    pub multisig_status: Option<TransactionStatus>,
    /// Why the multisig status could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multisig_error: Option<String>,
}

/// Multisig transaction not executed yet
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTransaction {
    pub index: u64,
    pub memo: Option<String>,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub creator: Pubkey,
    /// `None` when the approval record is missing
    pub status: Option<TransactionStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTransactions {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub multisig: Pubkey,
    /// Index of the last transaction created on the multisig
    pub transaction_index: u64,
    pub transactions: Vec<OpenTransaction>,
}

#[derive(Clone)]
pub struct Recovery {
    cluster: Arc<dyn Cluster>,
    governance: GovernanceDriver,
    multisig: MultisigDriver,
}

impl Recovery {
    pub fn new(sender: TransactionSender) -> Self {
        Self {
            cluster: sender.cluster().clone(),
            governance: GovernanceDriver::new(sender.clone()),
            multisig: MultisigDriver::new(sender),
        }
    }

    pub async fn inspect(&self, proposal: &Pubkey) -> Result<LinkedProposal, AppError> {
        let account = self.governance.get_proposal(proposal).await?;
        let link = ProposalLink::decode(&account.description);

        let (multisig_status, multisig_error) = match &link {
            Some(link) => match self
                .multisig
                .get_proposal_status(&link.multisig, link.transaction_index)
                .await
            {
                Ok(status) => (Some(status), None),
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, None),
        };

        Ok(LinkedProposal {
            proposal: *proposal,
            description: human_description(&account.description).to_string(),
            name: account.name,
            state: account.state,
            yes_votes: account.yes_votes,
            no_votes: account.no_votes,
            link,
            multisig_status,
            multisig_error,
        })
    }

    pub async fn resolve_link(&self, proposal: &Pubkey) -> Result<ProposalLink, AppError> {
        let account = self.governance.get_proposal(proposal).await?;
        ProposalLink::decode(&account.description).ok_or_else(|| {
            AppError::NotFound(format!("Proposal {} is not linked to a multisig transaction", proposal))
        })
    }

    pub async fn approve(&self, proposal: &Pubkey, signer: &Keypair) -> Result<(ProposalLink, Signature), AppError> {
        let link = self.resolve_link(proposal).await?;
        info!(%proposal, multisig = %link.multisig, index = link.transaction_index, "Manual multisig approval");
        let signature = self
            .multisig
            .approve_proposal(&link.multisig, signer, link.transaction_index)
            .await?;
        Ok((link, signature))
    }

    pub async fn execute(&self, proposal: &Pubkey, signer: &Keypair) -> Result<(ProposalLink, Signature), AppError> {
        let link = self.resolve_link(proposal).await?;
        info!(%proposal, multisig = %link.multisig, index = link.transaction_index, "Manual multisig execution");
        let signature = self
            .multisig
            .execute_multisig_transaction(&link.multisig, signer, link.transaction_index)
            .await?;
        Ok((link, signature))
    }

    pub async fn advance(&self, proposal: &Pubkey, signer: &Keypair) -> Result<(ProposalLink, AdvanceOutcome), AppError> {
        let link = self.resolve_link(proposal).await?;
        let outcome = self
            .multisig
            .approve_and_execute_if_ready(&link.multisig, signer, link.transaction_index)
            .await?;
        Ok((link, outcome))
    }

    /// Unexecuted transactions still within reach of the multisig, oldest
    /// first. Finds transactions whose governance proposal never got created.
    pub async fn open_transactions(&self, multisig: &Pubkey) -> Result<OpenTransactions, AppError> {
        let account = self
            .cluster
            .get_multisig(multisig)
            .await
            .map_err(AppError::Unavailable)?
            .ok_or_else(|| AppError::NotFound(format!("Multisig {} does not exist", multisig)))?;

        let mut transactions = Vec::new();
        for index in (account.stale_transaction_index + 1)..=account.transaction_index {
            let Some(transaction) = self
                .cluster
                .get_vault_transaction(&pda::vault_transaction(multisig, index))
                .await
                .map_err(AppError::Unavailable)?
            else {
                continue;
            };

            let status = match self.multisig.get_proposal_status(multisig, index).await {
                Ok(status) if status.executed => continue,
                Ok(status) => Some(status),
                Err(AppError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            transactions.push(OpenTransaction {
                index,
                memo: transaction.memo,
                creator: transaction.creator,
                status,
            });
        }

        Ok(OpenTransactions {
            multisig: *multisig,
            transaction_index: account.transaction_index,
            transactions,
        })
    }
}
