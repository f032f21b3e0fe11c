//! Chain access layer
//!
//! Everything this service knows about the governance and multisig programs
//! goes through the [`Cluster`] trait: transactions in, account snapshots out.
//! Nothing read here is cached; both programs can be mutated by other signers
//! at any moment.

pub mod accounts;
pub mod error;
pub mod instruction;
pub mod local;
pub mod pda;
pub mod rpc;
pub mod sender;
#[cfg(test)]
pub(crate) mod testing;

use accounts::*;
use async_trait::async_trait;
use solana_hash::Hash;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::Transaction;

pub use error::{ChainError, ProgramError};
pub use instruction::{build_transaction, GovernanceInstruction, MultisigInstruction};
pub use local::LocalCluster;
pub use rpc::RpcCluster;
pub use sender::TransactionSender;

/// Read and submit interface of a cluster running both programs.
///
/// Account getters return `Ok(None)` when the account does not exist yet.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn latest_blockhash(&self) -> Result<Hash, ChainError>;

    /// Submit a signed transaction. The effect is only observable once
    /// `signature_status` reports it.
    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, ChainError>;

    /// `None` while the transaction is not yet confirmed
    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<Result<(), ProgramError>>, ChainError>;

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, ChainError>;

    /// Lamports an account of `data_len` bytes must hold to stay allocated
    async fn minimum_balance_for_rent_exemption(&self, data_len: usize) -> Result<u64, ChainError>;

    async fn get_realm(&self, address: &Pubkey) -> Result<Option<Realm>, ChainError>;

    async fn get_governance(&self, address: &Pubkey) -> Result<Option<Governance>, ChainError>;

    async fn get_token_owner_record(
        &self,
        address: &Pubkey,
    ) -> Result<Option<TokenOwnerRecord>, ChainError>;

    async fn get_governance_proposal(
        &self,
        address: &Pubkey,
    ) -> Result<Option<GovernanceProposal>, ChainError>;

    async fn get_proposal_transaction(
        &self,
        address: &Pubkey,
    ) -> Result<Option<ProposalTransaction>, ChainError>;

    async fn get_program_config(&self) -> Result<Option<ProgramConfig>, ChainError>;

    async fn get_multisig(&self, address: &Pubkey) -> Result<Option<Multisig>, ChainError>;

    async fn get_multisig_proposal(
        &self,
        address: &Pubkey,
    ) -> Result<Option<MultisigProposal>, ChainError>;

    async fn get_vault_transaction(
        &self,
        address: &Pubkey,
    ) -> Result<Option<VaultTransaction>, ChainError>;

    async fn get_mint(&self, address: &Pubkey) -> Result<Option<TokenMint>, ChainError>;

    async fn get_token_account(&self, address: &Pubkey) -> Result<Option<TokenAccount>, ChainError>;
}
