//! Integrated proposal orchestrator
//!
//! An integrated proposal is a governance proposal with no instructions of its
//! own, whose description links to a multisig vault transaction that carries
//! the real effect. The governance vote is the approval gate; every vote or
//! execution through this orchestrator then tries to push the linked multisig
//! transaction forward.
//!
//! The two programs cannot be updated atomically. The governance action the
//! caller asked for is the primary outcome and is always reported as is. The
//! multisig step is best effort and comes back next to it as a
//! [`MultisigSync`], never as a failure of the primary action.

use crate::chain::accounts::ProposalState;
use crate::chain::{pda, TransactionSender};
use crate::error::AppError;
use crate::governance::GovernanceDriver;
use crate::link::ProposalLink;
use crate::multisig::{AdvanceOutcome, MultisigDriver, TransactionStatus};
use serde::Serialize;
use solana_instruction::Instruction;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the linked multisig transaction stands after a governance action
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum MultisigSync {
    /// The proposal carries no (readable) link
    NotLinked,
    Skipped {
        link: ProposalLink,
        reason: String,
    },
    Executed {
        link: ProposalLink,
        #[serde(serialize_with = "crate::models::serialize_display")]
        signature: Signature,
    },
    AwaitingApprovals {
        link: ProposalLink,
        status: TransactionStatus,
    },
    AlreadyExecuted {
        link: ProposalLink,
    },
    /// The multisig step failed and may need manual recovery
    Unresolved {
        link: Option<ProposalLink>,
        #[serde(serialize_with = "crate::models::serialize_display")]
        error: AppError,
    },
}

/// Primary governance outcome plus the best-effort multisig outcome
#[derive(Debug)]
pub struct Synchronized<T> {
    pub primary: Result<T, AppError>,
    pub multisig: MultisigSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegratedProposal {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub proposal: Pubkey,
    pub link: ProposalLink,
}

#[derive(Clone)]
pub struct Orchestrator {
    governance: GovernanceDriver,
    multisig: MultisigDriver,
    /// Wait before re-reading the multisig after a governance execution
    sync_delay: Duration,
}

impl Orchestrator {
    pub fn new(sender: TransactionSender, sync_delay: Duration) -> Self {
        Self {
            governance: GovernanceDriver::new(sender.clone()),
            multisig: MultisigDriver::new(sender),
            sync_delay,
        }
    }

    pub fn governance(&self) -> &GovernanceDriver {
        &self.governance
    }

    pub fn multisig(&self) -> &MultisigDriver {
        &self.multisig
    }

    /// Create the multisig transaction first, then the governance proposal
    /// that links to it.
    ///
    /// If the governance side fails, the multisig transaction stays behind
    /// with nothing pointing at it. It is not rolled back; it can be found
    /// and driven through the recovery path.
    pub async fn create_integrated_asset_transfer_proposal(
        &self,
        realm: &Pubkey,
        signer: &Keypair,
        title: &str,
        description: &str,
        instructions: Vec<Instruction>,
    ) -> Result<IntegratedProposal, AppError> {
        let multisig = pda::realm_multisig(realm);
        let transaction_index = self
            .multisig
            .create_transaction_with_proposal(&multisig, signer, instructions, title)
            .await?;

        let link = ProposalLink::new(multisig, transaction_index);
        let text = link.encode(description);

        match self
            .governance
            .create_proposal(realm, signer, title, &text, Vec::new())
            .await
        {
            Ok(proposal) => {
                info!(%proposal, %multisig, index = transaction_index, "Created integrated proposal");
                Ok(IntegratedProposal { proposal, link })
            }
            Err(e) => {
                warn!(
                    %multisig,
                    index = transaction_index,
                    "Governance proposal failed, multisig transaction left unlinked: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Vote, then advance the linked multisig transaction on approval.
    ///
    /// When the vote itself is rejected (for example a repeated vote) the
    /// proposal is re-read, and a lagging multisig is still pushed forward
    /// as long as the proposal can pass or has passed. A defeated,
    /// cancelled or vetoed proposal never advances the multisig.
    pub async fn cast_vote(
        &self,
        realm: &Pubkey,
        signer: &Keypair,
        proposal: &Pubkey,
        approve: bool,
    ) -> Synchronized<Signature> {
        let primary = self.governance.cast_vote(realm, signer, proposal, approve).await;

        let gate = if !approve {
            Gate::Skip("deny votes do not approve the multisig transaction")
        } else if let Err(e) = &primary {
            warn!(%proposal, "Vote rejected: {}", e);
            Gate::WhileProposalLive
        } else {
            Gate::Open
        };
        let multisig = self.advance_linked(signer, proposal, gate).await;
        Synchronized { primary, multisig }
    }

    /// Execute the governance proposal, then advance the linked multisig
    /// transaction once that succeeded.
    pub async fn execute_proposal(&self, signer: &Keypair, proposal: &Pubkey) -> Synchronized<Signature> {
        let primary = self.governance.execute_proposal(signer, proposal).await;

        let gate = match &primary {
            Ok(_) => {
                if !self.sync_delay.is_zero() {
                    debug!(%proposal, delay_ms = self.sync_delay.as_millis() as u64, "Waiting before multisig sync");
                    tokio::time::sleep(self.sync_delay).await;
                }
                Gate::Open
            }
            Err(e) => {
                warn!(%proposal, "Governance execution failed: {}", e);
                Gate::Skip("governance execution failed")
            }
        };
        let multisig = self.advance_linked(signer, proposal, gate).await;
        Synchronized { primary, multisig }
    }

    async fn advance_linked(&self, signer: &Keypair, proposal: &Pubkey, gate: Gate) -> MultisigSync {
        let account = match self.governance.get_proposal(proposal).await {
            Ok(account) => account,
            Err(error) => {
                warn!(%proposal, "Could not read proposal for multisig sync: {}", error);
                return MultisigSync::Unresolved { link: None, error };
            }
        };
        let Some(link) = ProposalLink::decode(&account.description) else {
            return MultisigSync::NotLinked;
        };

        let skip = match gate {
            Gate::Open => None,
            Gate::Skip(reason) => Some(reason.to_string()),
            Gate::WhileProposalLive if keeps_multisig_live(account.state) => None,
            Gate::WhileProposalLive => Some(format!(
                "vote was rejected and the proposal is {:?}",
                account.state
            )),
        };
        if let Some(reason) = skip {
            debug!(%proposal, "Multisig sync skipped: {}", reason);
            return MultisigSync::Skipped { link, reason };
        }

        match self
            .multisig
            .approve_and_execute_if_ready(&link.multisig, signer, link.transaction_index)
            .await
        {
            Ok(AdvanceOutcome::Executed { signature }) => MultisigSync::Executed { link, signature },
            Ok(AdvanceOutcome::AwaitingApprovals { status }) => MultisigSync::AwaitingApprovals { link, status },
            Ok(AdvanceOutcome::AlreadyExecuted) => MultisigSync::AlreadyExecuted { link },
            Err(error) => {
                warn!(
                    %proposal,
                    multisig = %link.multisig,
                    index = link.transaction_index,
                    retryable = error.is_retryable(),
                    "Multisig sync unresolved: {}",
                    error
                );
                MultisigSync::Unresolved {
                    link: Some(link),
                    error,
                }
            }
        }
    }
}

/// Whether a governance action may advance the linked multisig
#[derive(Debug, Clone, Copy)]
enum Gate {
    Open,
    Skip(&'static str),
    /// Only while the proposal state still allows it to pass
    WhileProposalLive,
}

/// States in which the proposal is passing or has passed
fn keeps_multisig_live(state: ProposalState) -> bool {
    matches!(
        state,
        ProposalState::Voting | ProposalState::Succeeded | ProposalState::Executing | ProposalState::Completed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::accounts::*;
    use crate::chain::testing::FaultyCluster;
    use crate::chain::{ChainError, Cluster, LocalCluster, ProgramError};
    use crate::provision::{initialize_integrated_dao, DaoConfig, ProvisionedDao};
    use crate::recovery::Recovery;
    use crate::transfer;
    use solana_native_token::LAMPORTS_PER_SOL;
    use pretty_assertions::assert_eq;
    use solana_signer::Signer;
    use std::sync::Arc;

    const VAULT_FUNDS: u64 = 10_000;

    struct Setup {
        cluster: Arc<LocalCluster>,
        dao: ProvisionedDao,
        members: Vec<Keypair>,
    }

    async fn setup(member_count: usize, threshold: u16) -> Setup {
        let cluster = Arc::new(LocalCluster::new());
        let members: Vec<Keypair> = (0..member_count).map(|_| Keypair::new()).collect();
        cluster.airdrop(&members[0].pubkey(), LAMPORTS_PER_SOL).await;
        let sender = TransactionSender::new(cluster.clone(), 3, Duration::ZERO);
        let dao = initialize_integrated_dao(
            &sender,
            &members[0],
            &DaoConfig {
                name: "Sync DAO".to_string(),
                members: members.iter().map(|m| m.pubkey()).collect(),
                threshold,
            },
        )
        .await
        .unwrap();
        cluster.airdrop(&dao.vault, VAULT_FUNDS).await;

        Setup { cluster, dao, members }
    }

    fn orchestrator(cluster: Arc<dyn Cluster>) -> Orchestrator {
        Orchestrator::new(TransactionSender::new(cluster, 3, Duration::ZERO), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_single_signer_vote_executes_multisig() {
        let s = setup(1, 1).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let recipient = Pubkey::new_unique();
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &recipient, 500);

        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, &s.members[0], "Pay", "Pay Bob", vec![ix])
            .await
            .unwrap();
        assert_eq!(created.link, ProposalLink::new(s.dao.multisig, 1));

        let voted = orchestrator
            .cast_vote(&s.dao.realm, &s.members[0], &created.proposal, true)
            .await;
        assert!(voted.primary.is_ok());
        assert!(matches!(voted.multisig, MultisigSync::Executed { link, .. } if link == created.link));
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 500);
        assert_eq!(s.cluster.get_balance(&s.dao.vault).await.unwrap(), VAULT_FUNDS - 500);

        let executed = orchestrator.execute_proposal(&s.members[0], &created.proposal).await;
        assert!(executed.primary.is_ok());
        assert!(matches!(executed.multisig, MultisigSync::AlreadyExecuted { .. }));
        let state = orchestrator.governance().get_proposal(&created.proposal).await.unwrap().state;
        assert_eq!(state, ProposalState::Completed);
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_two_of_two_waits_for_second_signer() {
        let s = setup(2, 2).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let (alice, bob) = (&s.members[0], &s.members[1]);
        let recipient = Pubkey::new_unique();
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &recipient, 700);

        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, alice, "Pay", "", vec![ix])
            .await
            .unwrap();

        let voted = orchestrator.cast_vote(&s.dao.realm, alice, &created.proposal, true).await;
        assert!(voted.primary.is_ok());
        match voted.multisig {
            MultisigSync::AwaitingApprovals { status, .. } => {
                assert_eq!((status.approval_count, status.threshold), (1, 2));
                assert!(!status.meets_threshold);
            }
            other => panic!("unexpected sync: {:?}", other),
        }
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 0);

        orchestrator
            .multisig()
            .approve_proposal(&created.link.multisig, bob, created.link.transaction_index)
            .await
            .unwrap();

        let voted = orchestrator.cast_vote(&s.dao.realm, bob, &created.proposal, true).await;
        assert!(voted.primary.is_ok());
        assert!(matches!(voted.multisig, MultisigSync::Executed { .. }));
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 700);

        let executed = orchestrator.execute_proposal(alice, &created.proposal).await;
        assert!(executed.primary.is_ok());
        assert!(matches!(executed.multisig, MultisigSync::AlreadyExecuted { .. }));
    }

    #[tokio::test]
    async fn test_repeated_vote_still_advances_multisig() {
        let s = setup(2, 2).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let (alice, bob) = (&s.members[0], &s.members[1]);
        let recipient = Pubkey::new_unique();
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &recipient, 50);

        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, alice, "Pay", "", vec![ix])
            .await
            .unwrap();
        orchestrator.cast_vote(&s.dao.realm, alice, &created.proposal, true).await;
        orchestrator
            .multisig()
            .approve_proposal(&created.link.multisig, bob, created.link.transaction_index)
            .await
            .unwrap();

        let again = orchestrator.cast_vote(&s.dao.realm, alice, &created.proposal, true).await;
        let rejection = again.primary.unwrap_err();
        assert_eq!(
            rejection.chain_error().and_then(ChainError::program_error),
            Some(&ProgramError::AlreadyVoted)
        );
        assert!(matches!(again.multisig, MultisigSync::Executed { .. }));
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_deny_vote_skips_multisig() {
        let s = setup(1, 1).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &Pubkey::new_unique(), 1);
        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, &s.members[0], "Pay", "", vec![ix])
            .await
            .unwrap();

        let voted = orchestrator
            .cast_vote(&s.dao.realm, &s.members[0], &created.proposal, false)
            .await;
        assert!(voted.primary.is_ok());
        assert!(matches!(voted.multisig, MultisigSync::Skipped { .. }));

        let status = orchestrator
            .multisig()
            .get_proposal_status(&created.link.multisig, created.link.transaction_index)
            .await
            .unwrap();
        assert_eq!(status.approval_count, 0);
    }

    #[tokio::test]
    async fn test_corrupted_link_leaves_multisig_alone() {
        let s = setup(1, 1).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let description = format!(
            "Looks linked\n\n--- MULTISIG TRANSACTION INFO ---\nMultisig Address: {}\nTransaction Index: not-a-number\n----------------------------",
            s.dao.multisig
        );
        let proposal = orchestrator
            .governance()
            .create_proposal(&s.dao.realm, &s.members[0], "Corrupt", &description, vec![])
            .await
            .unwrap();

        let voted = orchestrator.cast_vote(&s.dao.realm, &s.members[0], &proposal, true).await;
        assert!(voted.primary.is_ok());
        assert!(matches!(voted.multisig, MultisigSync::NotLinked));

        let executed = orchestrator.execute_proposal(&s.members[0], &proposal).await;
        assert!(executed.primary.is_ok());
        assert!(matches!(executed.multisig, MultisigSync::NotLinked));

        let processed = s.cluster.processed_instructions().await;
        assert!(!processed.contains(&"ProposalApprove"));
        assert!(!processed.contains(&"VaultTransactionCreate"));
    }

    #[tokio::test]
    async fn test_orphaned_multisig_transaction_is_recoverable() {
        let s = setup(1, 1).await;
        let flaky: Arc<dyn Cluster> = Arc::new(FaultyCluster::new(s.cluster.clone()).rejecting_proposal_creation());
        let orchestrator = orchestrator(flaky.clone());
        let recipient = Pubkey::new_unique();
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &recipient, 900);

        let err = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, &s.members[0], "Pay", "", vec![ix])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CreationFailed(_)));
        assert!(!err.is_retryable());

        let recovery = Recovery::new(TransactionSender::new(flaky, 3, Duration::ZERO));
        let open = recovery.open_transactions(&s.dao.multisig).await.unwrap();
        assert_eq!(open.transaction_index, 1);
        assert_eq!(open.transactions.len(), 1);
        let orphan = &open.transactions[0];
        assert_eq!(orphan.index, 1);
        assert_eq!(orphan.memo.as_deref(), Some("Proposal: Pay"));
        assert_eq!(orphan.status.as_ref().map(|st| st.approval_count), Some(0));

        let outcome = orchestrator
            .multisig()
            .approve_and_execute_if_ready(&s.dao.multisig, &s.members[0], orphan.index)
            .await
            .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Executed { .. }));
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 900);
        assert!(recovery.open_transactions(&s.dao.multisig).await.unwrap().transactions.is_empty());
    }

    #[tokio::test]
    async fn test_approvals_after_defeat_do_not_move_funds() {
        let s = setup(3, 2).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let recipient = Pubkey::new_unique();
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &recipient, 400);
        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, &s.members[0], "Pay", "", vec![ix])
            .await
            .unwrap();

        for member in &s.members[1..] {
            let voted = orchestrator.cast_vote(&s.dao.realm, member, &created.proposal, false).await;
            assert!(voted.primary.is_ok());
        }
        let state = orchestrator.governance().get_proposal(&created.proposal).await.unwrap().state;
        assert_eq!(state, ProposalState::Defeated);

        for member in &s.members {
            let voted = orchestrator.cast_vote(&s.dao.realm, member, &created.proposal, true).await;
            assert!(voted.primary.is_err());
            match voted.multisig {
                MultisigSync::Skipped { reason, .. } => assert!(reason.contains("Defeated")),
                other => panic!("unexpected sync: {:?}", other),
            }
        }

        let status = orchestrator
            .multisig()
            .get_proposal_status(&created.link.multisig, created.link.transaction_index)
            .await
            .unwrap();
        assert_eq!(status.approval_count, 0);
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 0);
        assert_eq!(s.cluster.get_balance(&s.dao.vault).await.unwrap(), VAULT_FUNDS);
    }

    #[tokio::test]
    async fn test_execute_completes_multisig_approved_out_of_band() {
        let s = setup(2, 2).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let (alice, bob) = (&s.members[0], &s.members[1]);
        let recipient = Pubkey::new_unique();
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &recipient, 650);
        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, alice, "Pay", "", vec![ix])
            .await
            .unwrap();

        let voted = orchestrator.cast_vote(&s.dao.realm, alice, &created.proposal, true).await;
        assert!(matches!(voted.multisig, MultisigSync::AwaitingApprovals { .. }));
        orchestrator
            .multisig()
            .approve_proposal(&created.link.multisig, bob, created.link.transaction_index)
            .await
            .unwrap();
        // Bob's council vote goes straight to governance, without a sync
        orchestrator
            .governance()
            .cast_vote(&s.dao.realm, bob, &created.proposal, true)
            .await
            .unwrap();
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 0);

        let executed = orchestrator.execute_proposal(alice, &created.proposal).await;
        assert!(executed.primary.is_ok());
        assert!(matches!(executed.multisig, MultisigSync::Executed { link, .. } if link == created.link));
        assert_eq!(s.cluster.get_balance(&recipient).await.unwrap(), 650);
    }

    #[tokio::test]
    async fn test_execute_reports_missing_multisig_approvals() {
        let s = setup(3, 2).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &Pubkey::new_unique(), 10);
        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, &s.members[0], "Pay", "", vec![ix])
            .await
            .unwrap();
        for member in &s.members[..2] {
            orchestrator
                .governance()
                .cast_vote(&s.dao.realm, member, &created.proposal, true)
                .await
                .unwrap();
        }

        let executed = orchestrator.execute_proposal(&s.members[0], &created.proposal).await;
        assert!(executed.primary.is_ok());
        match executed.multisig {
            MultisigSync::AwaitingApprovals { status, .. } => {
                assert_eq!((status.approval_count, status.threshold), (1, 2));
                assert!(!status.executed);
            }
            other => panic!("unexpected sync: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_governance_execution_skips_multisig() {
        let s = setup(2, 2).await;
        let orchestrator = orchestrator(s.cluster.clone());
        let ix = transfer::vault_sol_transfer(&s.dao.multisig, &Pubkey::new_unique(), 10);
        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&s.dao.realm, &s.members[0], "Pay", "", vec![ix])
            .await
            .unwrap();
        orchestrator
            .cast_vote(&s.dao.realm, &s.members[0], &created.proposal, true)
            .await;

        // Still voting: Bob has not voted yet
        let executed = orchestrator.execute_proposal(&s.members[1], &created.proposal).await;
        assert!(matches!(
            executed.primary.unwrap_err().chain_error().and_then(ChainError::program_error),
            Some(ProgramError::InvalidState(_))
        ));
        assert!(matches!(executed.multisig, MultisigSync::Skipped { .. }));

        let status = orchestrator
            .multisig()
            .get_proposal_status(&created.link.multisig, created.link.transaction_index)
            .await
            .unwrap();
        assert_eq!(status.approval_count, 1);
    }
}
