//! Sign, submit and wait for confirmation

use crate::chain::instruction::{build_transaction, instruction_name};
use crate::chain::{ChainError, Cluster};
use solana_instruction::Instruction;
use solana_keypair::Keypair;
use solana_signature::Signature;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Submits transactions and blocks until they are confirmed.
///
/// Waiting is bounded: once `confirm_attempts` status polls have passed the
/// sender gives up with [`ChainError::ConfirmationTimeout`]. The transaction
/// may still land afterwards, so callers must re-read state before retrying.
#[derive(Clone)]
pub struct TransactionSender {
    cluster: Arc<dyn Cluster>,
    confirm_attempts: u32,
    confirm_interval: Duration,
}

impl TransactionSender {
    pub fn new(cluster: Arc<dyn Cluster>, confirm_attempts: u32, confirm_interval: Duration) -> Self {
        Self {
            cluster,
            confirm_attempts: confirm_attempts.max(1),
            confirm_interval,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn confirm_interval(&self) -> Duration {
        self.confirm_interval
    }

    /// Sign with the payer (and extra signers) over a fresh blockhash, send and confirm
    pub async fn send_and_confirm(
        &self,
        payer: &Keypair,
        extra_signers: &[&Keypair],
        instructions: Vec<Instruction>,
    ) -> Result<Signature, ChainError> {
        let names: Vec<&str> = instructions.iter().map(instruction_name).collect();
        let blockhash = self.cluster.latest_blockhash().await?;
        let transaction = build_transaction(payer, extra_signers, &instructions, blockhash)?;

        let signature = self.cluster.send_transaction(&transaction).await?;
        debug!(%signature, instructions = ?names, "Transaction sent");

        self.confirm(&signature).await?;
        info!(%signature, instructions = ?names, "Transaction confirmed");
        Ok(signature)
    }

    /// Poll the signature status until it is confirmed or the budget runs out
    pub async fn confirm(&self, signature: &Signature) -> Result<(), ChainError> {
        for attempt in 1..=self.confirm_attempts {
            match self.cluster.signature_status(signature).await? {
                Some(Ok(())) => return Ok(()),
                Some(Err(e)) => return Err(ChainError::Program(e)),
                None => {
                    debug!(%signature, attempt, "Transaction not confirmed yet");
                    if attempt < self.confirm_attempts {
                        tokio::time::sleep(self.confirm_interval).await;
                    }
                }
            }
        }

        warn!(%signature, attempts = self.confirm_attempts, "Gave up waiting for confirmation");
        Err(ChainError::ConfirmationTimeout(*signature))
    }
}
