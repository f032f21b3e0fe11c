//! Multisig transaction driver
//!
//! Creates vault transactions with their approval records, approves them and
//! executes them once enough members have approved. Nothing is cached here:
//! other members approve and execute from their own processes, so every
//! decision is taken on a fresh read.

use crate::chain::accounts::{MultisigProposalStatus, VaultTransactionMessage};
use crate::chain::{pda, ChainError, Cluster, MultisigInstruction, ProgramError, TransactionSender};
use crate::error::AppError;
use serde::Serialize;
use solana_instruction::Instruction;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Status reads retried while a just-confirmed write propagates
const STATUS_READ_ATTEMPTS: u32 = 3;

/// Approval progress of one multisig transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatus {
    pub transaction_index: u64,
    pub approval_count: usize,
    pub rejection_count: usize,
    pub threshold: u16,
    pub meets_threshold: bool,
    pub executed: bool,
    pub status: MultisigProposalStatus,
}

/// What `approve_and_execute_if_ready` achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum AdvanceOutcome {
    Executed {
        #[serde(serialize_with = "crate::models::serialize_display")]
        signature: Signature,
    },
    /// More approvals from other members are needed
    AwaitingApprovals { status: TransactionStatus },
    /// Another member executed it first
    AlreadyExecuted,
}

#[derive(Clone)]
pub struct MultisigDriver {
    sender: TransactionSender,
}

impl MultisigDriver {
    pub fn new(sender: TransactionSender) -> Self {
        Self { sender }
    }

    fn cluster(&self) -> &Arc<dyn Cluster> {
        self.sender.cluster()
    }

    /// Create a vault transaction and its approval record.
    ///
    /// The index is re-read from the multisig right before submission and
    /// never predicted. A failure is not retried: the caller has to re-read
    /// the multisig to learn whether the transaction landed anyway.
    pub async fn create_transaction_with_proposal(
        &self,
        multisig: &Pubkey,
        payer: &Keypair,
        instructions: Vec<Instruction>,
        title: &str,
    ) -> Result<u64, AppError> {
        let account = self
            .cluster()
            .get_multisig(multisig)
            .await
            .map_err(AppError::CreationFailed)?
            .ok_or_else(|| AppError::NotFound(format!("Multisig {} does not exist", multisig)))?;
        let transaction_index = account.transaction_index + 1;
        let vault = pda::vault(multisig, pda::DEFAULT_VAULT_INDEX);
        let message = VaultTransactionMessage::compile(&vault, &instructions)
            .map_err(|e| AppError::CreationFailed(e.into()))?;

        debug!(%multisig, index = transaction_index, "Creating vault transaction");
        let ixs = encode(vec![
            MultisigInstruction::VaultTransactionCreate {
                multisig: *multisig,
                transaction: pda::vault_transaction(multisig, transaction_index),
                creator: payer.pubkey(),
                vault_index: pda::DEFAULT_VAULT_INDEX,
                message,
                memo: Some(format!("Proposal: {}", title)),
            },
            MultisigInstruction::ProposalCreate {
                multisig: *multisig,
                creator: payer.pubkey(),
                transaction_index,
            },
        ])
        .map_err(AppError::CreationFailed)?;

        let signature = self
            .sender
            .send_and_confirm(payer, &[], ixs)
            .await
            .map_err(AppError::CreationFailed)?;

        info!(%multisig, index = transaction_index, %signature, "Created multisig transaction");
        Ok(transaction_index)
    }

    /// Approve as `signer`. Duplicate approvals are reported as the program
    /// rejects them.
    pub async fn approve_proposal(
        &self,
        multisig: &Pubkey,
        signer: &Keypair,
        transaction_index: u64,
    ) -> Result<Signature, AppError> {
        let ixs = encode(vec![MultisigInstruction::approve(multisig, &signer.pubkey(), transaction_index)])
            .map_err(AppError::SubmissionFailed)?;
        let signature = self
            .sender
            .send_and_confirm(signer, &[], ixs)
            .await
            .map_err(AppError::SubmissionFailed)?;

        info!(%multisig, index = transaction_index, member = %signer.pubkey(), "Approved multisig transaction");
        Ok(signature)
    }

    pub async fn get_proposal_status(
        &self,
        multisig: &Pubkey,
        transaction_index: u64,
    ) -> Result<TransactionStatus, AppError> {
        let cluster = self.cluster();
        let account = cluster
            .get_multisig(multisig)
            .await
            .map_err(AppError::Unavailable)?
            .ok_or_else(|| AppError::NotFound(format!("Multisig {} does not exist", multisig)))?;

        let proposal = cluster
            .get_multisig_proposal(&pda::multisig_proposal(multisig, transaction_index))
            .await
            .map_err(AppError::Unavailable)?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Transaction {} of multisig {} has no approval record",
                    transaction_index, multisig
                ))
            })?;

        let approval_count = proposal.approved.len();
        Ok(TransactionStatus {
            transaction_index,
            approval_count,
            rejection_count: proposal.rejected.len(),
            threshold: account.threshold,
            meets_threshold: approval_count >= account.threshold as usize,
            executed: proposal.status == MultisigProposalStatus::Executed,
            status: proposal.status,
        })
    }

    /// Execute, refusing locally when the threshold is not met
    pub async fn execute_multisig_transaction(
        &self,
        multisig: &Pubkey,
        signer: &Keypair,
        transaction_index: u64,
    ) -> Result<Signature, AppError> {
        let status = self.get_proposal_status(multisig, transaction_index).await?;
        if status.executed {
            return Err(AppError::Conflict(format!(
                "Transaction {} of multisig {} is already executed",
                transaction_index, multisig
            )));
        }
        if !status.meets_threshold {
            return Err(AppError::ThresholdNotMet {
                approvals: status.approval_count,
                threshold: status.threshold,
            });
        }

        self.submit_execute(multisig, signer, transaction_index).await
    }

    async fn submit_execute(
        &self,
        multisig: &Pubkey,
        signer: &Keypair,
        transaction_index: u64,
    ) -> Result<Signature, AppError> {
        let transaction = self
            .cluster()
            .get_vault_transaction(&pda::vault_transaction(multisig, transaction_index))
            .await
            .map_err(AppError::Unavailable)?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Transaction {} of multisig {} does not exist",
                    transaction_index, multisig
                ))
            })?;

        let ixs = encode(vec![MultisigInstruction::execute(
            multisig,
            &signer.pubkey(),
            transaction_index,
            &transaction.message,
        )])
        .map_err(AppError::SubmissionFailed)?;
        let signature = self
            .sender
            .send_and_confirm(signer, &[], ixs)
            .await
            .map_err(AppError::SubmissionFailed)?;

        info!(%multisig, index = transaction_index, %signature, "Executed multisig transaction");
        Ok(signature)
    }

    /// Approve, re-read the status and execute only if that fresh read says
    /// the threshold is met. Still needing approvals is an outcome, not an
    /// error.
    pub async fn approve_and_execute_if_ready(
        &self,
        multisig: &Pubkey,
        signer: &Keypair,
        transaction_index: u64,
    ) -> Result<AdvanceOutcome, AppError> {
        if let Err(e) = self.approve_proposal(multisig, signer, transaction_index).await {
            if !approval_already_settled(&e) {
                return Err(e);
            }
            debug!(%multisig, index = transaction_index, "Approval already settled: {}", e);
        }

        let status = self.wait_for_status(multisig, transaction_index).await?;
        if status.executed {
            return Ok(AdvanceOutcome::AlreadyExecuted);
        }
        if !status.meets_threshold {
            info!(
                %multisig,
                index = transaction_index,
                "Multisig transaction at {}/{} approvals",
                status.approval_count,
                status.threshold
            );
            return Ok(AdvanceOutcome::AwaitingApprovals { status });
        }

        match self.submit_execute(multisig, signer, transaction_index).await {
            Ok(signature) => Ok(AdvanceOutcome::Executed { signature }),
            Err(e) => {
                // Another member may have executed between our read and submit
                let fresh = self.get_proposal_status(multisig, transaction_index).await?;
                if fresh.executed {
                    Ok(AdvanceOutcome::AlreadyExecuted)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Status read that tolerates a record which is not visible yet
    pub async fn wait_for_status(
        &self,
        multisig: &Pubkey,
        transaction_index: u64,
    ) -> Result<TransactionStatus, AppError> {
        let mut attempt = 1;
        loop {
            match self.get_proposal_status(multisig, transaction_index).await {
                Err(AppError::NotFound(msg)) if attempt < STATUS_READ_ATTEMPTS => {
                    warn!(attempt, "Status not readable yet: {}", msg);
                    attempt += 1;
                    tokio::time::sleep(self.sender.confirm_interval()).await;
                }
                other => return other,
            }
        }
    }
}

fn encode(ixs: Vec<MultisigInstruction>) -> Result<Vec<Instruction>, ChainError> {
    ixs.into_iter()
        .map(|ix| Instruction::try_from(ix).map_err(ChainError::from))
        .collect()
}

/// Approval rejected because this member already approved or the
/// transaction moved past voting
fn approval_already_settled(err: &AppError) -> bool {
    matches!(
        err.chain_error().and_then(ChainError::program_error),
        Some(ProgramError::AlreadyApproved) | Some(ProgramError::InvalidState(_))
    )
}
