//! Governance proposal driver
//!
//! Council-gated proposals only: the proposal owner and every voter act
//! through their council token-owner record.

use crate::chain::accounts::{GovernanceProposal, Vote};
use crate::chain::{pda, Cluster, GovernanceInstruction, TransactionSender};
use crate::error::AppError;
use solana_instruction::{AccountMeta, Instruction};
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use std::sync::Arc;
use tracing::{debug, info};

/// Deposit required to own a proposal or vote
const MIN_COUNCIL_DEPOSIT: u64 = 1;

#[derive(Clone)]
pub struct GovernanceDriver {
    sender: TransactionSender,
}

impl GovernanceDriver {
    pub fn new(sender: TransactionSender) -> Self {
        Self { sender }
    }

    fn cluster(&self) -> &Arc<dyn Cluster> {
        self.sender.cluster()
    }

    /// Council mint of a realm. Realms without one are not supported.
    pub async fn council_mint(&self, realm: &Pubkey) -> Result<Pubkey, AppError> {
        let account = self
            .cluster()
            .get_realm(realm)
            .await
            .map_err(AppError::Unavailable)?
            .ok_or_else(|| AppError::NotFound(format!("Realm {} does not exist", realm)))?;

        account.council_mint.ok_or_else(|| {
            AppError::Configuration(format!("Realm {} has no council mint configured", realm))
        })
    }

    /// Make sure `owner` holds a funded council record in the realm
    pub async fn ensure_token_owner_record(
        &self,
        realm: &Pubkey,
        council_mint: &Pubkey,
        owner: &Keypair,
    ) -> Result<Pubkey, AppError> {
        let address = pda::token_owner_record(realm, council_mint, &owner.pubkey());
        let record = self
            .cluster()
            .get_token_owner_record(&address)
            .await
            .map_err(AppError::Unavailable)?;

        let mut ixs: Vec<Instruction> = Vec::new();
        let deposited = match record {
            Some(record) => record.deposit_amount,
            None => {
                ixs.push(
                    GovernanceInstruction::CreateTokenOwnerRecord {
                        realm: *realm,
                        governing_token_owner: owner.pubkey(),
                        governing_token_mint: *council_mint,
                        payer: owner.pubkey(),
                    }
                    .into(),
                );
                0
            }
        };
        // Only the council mint authority can fund a record this way; anyone
        // else has to be provisioned as a member.
        if deposited < MIN_COUNCIL_DEPOSIT {
            ixs.push(
                GovernanceInstruction::DepositGoverningTokens {
                    realm: *realm,
                    governing_token_mint: *council_mint,
                    source: *council_mint,
                    governing_token_owner: owner.pubkey(),
                    source_authority: owner.pubkey(),
                    payer: owner.pubkey(),
                    amount: MIN_COUNCIL_DEPOSIT - deposited,
                }
                .into(),
            );
        }

        if !ixs.is_empty() {
            debug!(%realm, owner = %owner.pubkey(), "Creating council token owner record");
            self.sender
                .send_and_confirm(owner, &[], ixs)
                .await
                .map_err(AppError::CreationFailed)?;
        }
        Ok(address)
    }

    /// Create a proposal holding `instructions` at option 0 / index 0 and
    /// sign it off so voting starts immediately.
    pub async fn create_proposal(
        &self,
        realm: &Pubkey,
        signer: &Keypair,
        title: &str,
        description: &str,
        instructions: Vec<Instruction>,
    ) -> Result<Pubkey, AppError> {
        let council_mint = self.council_mint(realm).await?;
        let governance = pda::governance(realm);
        if self
            .cluster()
            .get_governance(&governance)
            .await
            .map_err(AppError::Unavailable)?
            .is_none()
        {
            return Err(AppError::Configuration(format!(
                "Realm {} has no governance account",
                realm
            )));
        }

        let token_owner_record = self
            .ensure_token_owner_record(realm, &council_mint, signer)
            .await?;

        let seed = Keypair::new().pubkey();
        let proposal = pda::proposal(&governance, &council_mint, &seed);
        let owner = signer.pubkey();
        let ixs = vec![
            GovernanceInstruction::CreateProposal {
                realm: *realm,
                governance,
                token_owner_record,
                governing_token_mint: council_mint,
                governance_authority: owner,
                payer: owner,
                name: title.to_string(),
                description: description.to_string(),
                seed,
            }
            .into(),
            GovernanceInstruction::InsertTransaction {
                governance,
                proposal,
                token_owner_record,
                governance_authority: owner,
                payer: owner,
                option_index: 0,
                index: 0,
                instructions,
            }
            .into(),
            GovernanceInstruction::SignOffProposal {
                realm: *realm,
                governance,
                proposal,
                signatory: owner,
                token_owner_record,
            }
            .into(),
        ];

        let signature = self
            .sender
            .send_and_confirm(signer, &[], ixs)
            .await
            .map_err(AppError::CreationFailed)?;

        info!(%proposal, %signature, "Created governance proposal '{}'", title);
        Ok(proposal)
    }

    pub async fn cast_vote(
        &self,
        realm: &Pubkey,
        signer: &Keypair,
        proposal: &Pubkey,
        approve: bool,
    ) -> Result<Signature, AppError> {
        let account = self.get_proposal(proposal).await?;
        let vote = if approve { Vote::Approve } else { Vote::Deny };
        let voter = signer.pubkey();
        let ix = GovernanceInstruction::CastVote {
            realm: *realm,
            governance: account.governance,
            proposal: *proposal,
            proposal_owner_record: account.token_owner_record,
            voter_token_owner_record: pda::token_owner_record(realm, &account.governing_token_mint, &voter),
            governance_authority: voter,
            governing_token_mint: account.governing_token_mint,
            payer: voter,
            vote,
        };

        let signature = self
            .sender
            .send_and_confirm(signer, &[], vec![ix.into()])
            .await
            .map_err(AppError::SubmissionFailed)?;

        info!(%proposal, voter = %signer.pubkey(), ?vote, "Vote cast");
        Ok(signature)
    }

    /// Execute the stored transaction of a proposal that passed
    pub async fn execute_proposal(
        &self,
        signer: &Keypair,
        proposal: &Pubkey,
    ) -> Result<Signature, AppError> {
        let account = self.get_proposal(proposal).await?;
        let proposal_transaction = pda::proposal_transaction(proposal, 0, 0);
        let stored = self
            .cluster()
            .get_proposal_transaction(&proposal_transaction)
            .await
            .map_err(AppError::Unavailable)?
            .ok_or_else(|| {
                AppError::NotFound(format!("Proposal {} has no stored transaction", proposal))
            })?;

        let treasury = pda::native_treasury(&account.governance);
        let ix = GovernanceInstruction::ExecuteTransaction {
            governance: account.governance,
            proposal: *proposal,
            proposal_transaction,
            accounts: execution_accounts(&stored.instructions, &treasury, &signer.pubkey()),
        };

        let signature = self
            .sender
            .send_and_confirm(signer, &[], vec![ix.into()])
            .await
            .map_err(AppError::SubmissionFailed)?;

        info!(%proposal, %signature, "Executed governance proposal");
        Ok(signature)
    }

    pub async fn get_proposal(&self, proposal: &Pubkey) -> Result<GovernanceProposal, AppError> {
        self.cluster()
            .get_governance_proposal(proposal)
            .await
            .map_err(AppError::Unavailable)?
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} does not exist", proposal)))
    }
}

/// Account list passed to an execute instruction.
///
/// Stored instructions claim a signature from the treasury, which is a
/// program-derived authority. Only the payer can actually sign, so every
/// other signer flag is cleared.
pub fn execution_accounts(
    instructions: &[Instruction],
    treasury: &Pubkey,
    payer: &Pubkey,
) -> Vec<AccountMeta> {
    let mut accounts = Vec::new();
    for ix in instructions {
        accounts.push(AccountMeta::new_readonly(ix.program_id, false));
        for meta in &ix.accounts {
            let is_signer = meta.is_signer && meta.pubkey == *payer && meta.pubkey != *treasury;
            accounts.push(AccountMeta {
                pubkey: meta.pubkey,
                is_signer,
                is_writable: meta.is_writable,
            });
        }
    }
    accounts
}
