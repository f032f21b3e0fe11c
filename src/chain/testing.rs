//! Cluster wrapper that injects failures into a [`LocalCluster`]

use crate::chain::accounts::*;
use crate::chain::instruction::decompile;
use crate::chain::{ChainError, Cluster, GovernanceInstruction, LocalCluster, ProgramError};
use async_trait::async_trait;
use solana_hash::Hash;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::Transaction;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct FaultyCluster {
    inner: Arc<LocalCluster>,
    /// Drop every transaction that creates a governance proposal
    reject_proposal_creation: bool,
    /// Multisig approval records read as missing this many times
    hidden_proposal_reads: AtomicU32,
}

impl FaultyCluster {
    pub fn new(inner: Arc<LocalCluster>) -> Self {
        Self {
            inner,
            reject_proposal_creation: false,
            hidden_proposal_reads: AtomicU32::new(0),
        }
    }

    pub fn rejecting_proposal_creation(mut self) -> Self {
        self.reject_proposal_creation = true;
        self
    }

    pub fn hiding_proposal_reads(self, reads: u32) -> Self {
        self.hidden_proposal_reads.store(reads, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Cluster for FaultyCluster {
    async fn latest_blockhash(&self) -> Result<Hash, ChainError> {
        self.inner.latest_blockhash().await
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, ChainError> {
        if self.reject_proposal_creation {
            let creates_proposal = decompile(&transaction.message)?.iter().any(|ix| {
                matches!(
                    GovernanceInstruction::decode(ix),
                    Ok(GovernanceInstruction::CreateProposal { .. })
                )
            });
            if creates_proposal {
                return Err(ChainError::Rpc("connection reset".to_string()));
            }
        }
        self.inner.send_transaction(transaction).await
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<Result<(), ProgramError>>, ChainError> {
        self.inner.signature_status(signature).await
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, ChainError> {
        self.inner.get_balance(address).await
    }

    async fn minimum_balance_for_rent_exemption(&self, data_len: usize) -> Result<u64, ChainError> {
        self.inner.minimum_balance_for_rent_exemption(data_len).await
    }

    async fn get_realm(&self, address: &Pubkey) -> Result<Option<Realm>, ChainError> {
        self.inner.get_realm(address).await
    }

    async fn get_governance(&self, address: &Pubkey) -> Result<Option<Governance>, ChainError> {
        self.inner.get_governance(address).await
    }

    async fn get_token_owner_record(&self, address: &Pubkey) -> Result<Option<TokenOwnerRecord>, ChainError> {
        self.inner.get_token_owner_record(address).await
    }

    async fn get_governance_proposal(&self, address: &Pubkey) -> Result<Option<GovernanceProposal>, ChainError> {
        self.inner.get_governance_proposal(address).await
    }

    async fn get_proposal_transaction(&self, address: &Pubkey) -> Result<Option<ProposalTransaction>, ChainError> {
        self.inner.get_proposal_transaction(address).await
    }

    async fn get_program_config(&self) -> Result<Option<ProgramConfig>, ChainError> {
        self.inner.get_program_config().await
    }

    async fn get_multisig(&self, address: &Pubkey) -> Result<Option<Multisig>, ChainError> {
        self.inner.get_multisig(address).await
    }

    async fn get_multisig_proposal(&self, address: &Pubkey) -> Result<Option<MultisigProposal>, ChainError> {
        let hidden = self
            .hidden_proposal_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(None);
        }
        self.inner.get_multisig_proposal(address).await
    }

    async fn get_vault_transaction(&self, address: &Pubkey) -> Result<Option<VaultTransaction>, ChainError> {
        self.inner.get_vault_transaction(address).await
    }

    async fn get_mint(&self, address: &Pubkey) -> Result<Option<TokenMint>, ChainError> {
        self.inner.get_mint(address).await
    }

    async fn get_token_account(&self, address: &Pubkey) -> Result<Option<TokenAccount>, ChainError> {
        self.inner.get_token_account(address).await
    }
}
