//! Integrated DAO provisioning
//!
//! Sets up a council-gated realm, its governance and native treasury, a
//! funded council record per member, and the multisig tied to the realm.

use crate::chain::{pda, GovernanceInstruction, MultisigInstruction, TransactionSender};
use crate::error::AppError;
use serde::Serialize;
use solana_instruction::Instruction;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signer::Signer;
use tracing::info;

/// Council tokens each member starts with
const MEMBER_COUNCIL_DEPOSIT: u64 = 1;

const COMMUNITY_MINT_DECIMALS: u8 = 6;
const COUNCIL_MINT_DECIMALS: u8 = 0;

/// Size of an SPL token mint account
pub const MINT_ACCOUNT_LEN: usize = 82;

#[derive(Debug, Clone)]
pub struct DaoConfig {
    pub name: String,
    pub members: Vec<Pubkey>,
    /// Approvals needed on the multisig, also used for the council vote threshold
    pub threshold: u16,
}

impl DaoConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.is_empty() || self.name.len() > pda::MAX_REALM_NAME_LEN {
            return Err(AppError::Validation(format!(
                "Realm name must be 1 to {} bytes",
                pda::MAX_REALM_NAME_LEN
            )));
        }
        if self.members.is_empty() {
            return Err(AppError::Validation("At least one member is required".to_string()));
        }
        let mut unique = self.members.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != self.members.len() {
            return Err(AppError::Validation("Members must be distinct".to_string()));
        }
        if self.threshold == 0 || self.threshold as usize > self.members.len() {
            return Err(AppError::Validation(format!(
                "Threshold must be between 1 and {}",
                self.members.len()
            )));
        }
        // The governance program refuses a 0% yes threshold
        if self.council_yes_threshold_pct() == 0 {
            return Err(AppError::Validation(format!(
                "Threshold {} of {} members rounds down to a 0% council vote",
                self.threshold,
                self.members.len()
            )));
        }
        Ok(())
    }

    /// Share of the council that must vote yes, rounded down
    pub fn council_yes_threshold_pct(&self) -> u8 {
        (self.threshold as usize * 100 / self.members.len()) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedDao {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub realm: Pubkey,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub governance: Pubkey,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub treasury: Pubkey,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub community_mint: Pubkey,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub council_mint: Pubkey,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub multisig: Pubkey,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub vault: Pubkey,
}

/// Allocate and initialize a token mint owned by `authority`.
///
/// `mint` has to sign the transaction carrying these instructions.
pub fn create_mint(
    payer: &Pubkey,
    mint: &Pubkey,
    authority: &Pubkey,
    decimals: u8,
    rent: u64,
) -> Result<Vec<Instruction>, AppError> {
    let initialize = spl_token_2022::instruction::initialize_mint2(&pda::TOKEN_PROGRAM_ID, mint, authority, None, decimals)
        .map_err(|e| AppError::Validation(format!("Invalid mint: {}", e)))?;
    Ok(vec![
        solana_system_interface::instruction::create_account(
            payer,
            mint,
            rent,
            MINT_ACCOUNT_LEN as u64,
            &pda::TOKEN_PROGRAM_ID,
        ),
        initialize,
    ])
}

/// Create the realm side and the multisig side of a DAO.
///
/// `authority` pays for everything, becomes the realm authority and holds
/// the authority of both governing mints.
pub async fn initialize_integrated_dao(
    sender: &TransactionSender,
    authority: &Keypair,
    config: &DaoConfig,
) -> Result<ProvisionedDao, AppError> {
    config.validate()?;

    let cluster = sender.cluster();
    let program_config = cluster
        .get_program_config()
        .await
        .map_err(AppError::Unavailable)?
        .ok_or_else(|| AppError::Configuration("Multisig program config is not initialized".to_string()))?;
    let mint_rent = cluster
        .minimum_balance_for_rent_exemption(MINT_ACCOUNT_LEN)
        .await
        .map_err(AppError::Unavailable)?;

    let payer = authority.pubkey();
    let community_mint = Keypair::new();
    let council_mint = Keypair::new();
    let realm = pda::realm(&config.name);
    let governance = pda::governance(&realm);
    let treasury = pda::native_treasury(&governance);

    info!("🪙 Creating governing mints for '{}'", config.name);
    let mut ixs = create_mint(&payer, &community_mint.pubkey(), &payer, COMMUNITY_MINT_DECIMALS, mint_rent)?;
    ixs.extend(create_mint(&payer, &council_mint.pubkey(), &payer, COUNCIL_MINT_DECIMALS, mint_rent)?);
    submit(sender, authority, &[&community_mint, &council_mint], ixs).await?;

    info!("🏛️  Creating realm '{}' ({})", config.name, realm);
    submit(
        sender,
        authority,
        &[],
        vec![GovernanceInstruction::CreateRealm {
            name: config.name.clone(),
            realm_authority: payer,
            community_mint: community_mint.pubkey(),
            council_mint: Some(council_mint.pubkey()),
            payer,
        }
        .into()],
    )
    .await?;

    for member in &config.members {
        submit(
            sender,
            authority,
            &[],
            vec![
                GovernanceInstruction::CreateTokenOwnerRecord {
                    realm,
                    governing_token_owner: *member,
                    governing_token_mint: council_mint.pubkey(),
                    payer,
                }
                .into(),
                GovernanceInstruction::DepositGoverningTokens {
                    realm,
                    governing_token_mint: council_mint.pubkey(),
                    source: council_mint.pubkey(),
                    governing_token_owner: *member,
                    source_authority: payer,
                    payer,
                    amount: MEMBER_COUNCIL_DEPOSIT,
                }
                .into(),
            ],
        )
        .await?;
    }

    submit(
        sender,
        authority,
        &[],
        vec![
            GovernanceInstruction::CreateGovernance {
                realm,
                token_owner_record: pda::token_owner_record(&realm, &council_mint.pubkey(), &config.members[0]),
                create_authority: payer,
                payer,
                council_yes_threshold_pct: config.council_yes_threshold_pct(),
            }
            .into(),
            GovernanceInstruction::CreateNativeTreasury { governance, payer }.into(),
        ],
    )
    .await?;

    let create_key = pda::realm_create_key(&realm);
    let multisig = pda::multisig(&create_key.pubkey());
    let create_multisig = MultisigInstruction::MultisigCreate {
        treasury: program_config.treasury,
        create_key: create_key.pubkey(),
        creator: payer,
        members: config.members.clone(),
        threshold: config.threshold,
        memo: Some(format!("realm:{}", realm)),
    };
    let ix = Instruction::try_from(create_multisig).map_err(|e| AppError::Validation(e.to_string()))?;
    submit(sender, authority, &[&create_key], vec![ix]).await?;

    let dao = ProvisionedDao {
        realm,
        governance,
        treasury,
        community_mint: community_mint.pubkey(),
        council_mint: council_mint.pubkey(),
        multisig,
        vault: pda::vault(&multisig, pda::DEFAULT_VAULT_INDEX),
    };
    info!(
        "✅ DAO '{}' ready: multisig {} ({}-of-{})",
        config.name,
        multisig,
        config.threshold,
        config.members.len()
    );
    Ok(dao)
}

async fn submit(
    sender: &TransactionSender,
    authority: &Keypair,
    extra_signers: &[&Keypair],
    ixs: Vec<Instruction>,
) -> Result<(), AppError> {
    sender
        .send_and_confirm(authority, extra_signers, ixs)
        .await
        .map(|_| ())
        .map_err(AppError::CreationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Cluster, LocalCluster};
    use pretty_assertions::assert_eq;
    use solana_native_token::LAMPORTS_PER_SOL;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(members: usize, threshold: u16) -> DaoConfig {
        DaoConfig {
            name: "Provisioned".to_string(),
            members: (0..members).map(|_| Pubkey::new_unique()).collect(),
            threshold,
        }
    }

    #[test]
    fn test_council_threshold_rounds_down() {
        assert_eq!(config(1, 1).council_yes_threshold_pct(), 100);
        assert_eq!(config(3, 2).council_yes_threshold_pct(), 66);
        assert_eq!(config(3, 1).council_yes_threshold_pct(), 33);
    }

    #[test]
    fn test_validation() {
        assert!(config(2, 3).validate().is_err());
        assert!(config(2, 0).validate().is_err());
        assert!(config(0, 1).validate().is_err());
        assert!(DaoConfig { name: "x".repeat(33), ..config(1, 1) }.validate().is_err());

        let mut dup = config(2, 1);
        dup.members[1] = dup.members[0];
        assert!(dup.validate().is_err());

        assert!(config(3, 2).validate().is_ok());
    }

    #[test]
    fn test_zero_percent_council_threshold_is_rejected() {
        let cfg = config(101, 1);
        assert_eq!(cfg.council_yes_threshold_pct(), 0);
        assert!(matches!(cfg.validate(), Err(AppError::Validation(msg)) if msg.contains("0%")));

        assert_eq!(config(100, 1).council_yes_threshold_pct(), 1);
        assert!(config(100, 1).validate().is_ok());
    }

    #[tokio::test]
    async fn test_provisioned_accounts() {
        let cluster = Arc::new(LocalCluster::new());
        let sender = TransactionSender::new(cluster.clone(), 3, Duration::ZERO);
        let authority = Keypair::new();
        cluster.airdrop(&authority.pubkey(), LAMPORTS_PER_SOL).await;
        let mut cfg = config(2, 2);
        cfg.members[0] = authority.pubkey();

        let dao = initialize_integrated_dao(&sender, &authority, &cfg).await.unwrap();

        let council = cluster.get_mint(&dao.council_mint).await.unwrap().unwrap();
        assert_eq!(council.mint_authority, Some(authority.pubkey()));
        assert_eq!((council.decimals, council.supply), (0, 2));
        let community = cluster.get_mint(&dao.community_mint).await.unwrap().unwrap();
        assert_eq!(community.decimals, 6);
        let realm = cluster.get_realm(&dao.realm).await.unwrap().unwrap();
        assert_eq!(realm.council_mint, Some(dao.council_mint));
        assert_eq!(realm.authority, Some(authority.pubkey()));

        assert_eq!(dao.multisig, pda::realm_multisig(&dao.realm));
        let multisig = cluster.get_multisig(&dao.multisig).await.unwrap().unwrap();
        assert_eq!(multisig.threshold, 2);
        assert_eq!(multisig.members, cfg.members);
        assert_eq!(multisig.memo, Some(format!("realm:{}", dao.realm)));

        let governance = cluster.get_governance(&dao.governance).await.unwrap().unwrap();
        assert_eq!(governance.council_yes_threshold_pct, 100);

        for member in &cfg.members {
            let record = cluster
                .get_token_owner_record(&pda::token_owner_record(&dao.realm, &dao.council_mint, member))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.deposit_amount, 1);
        }

        let err = initialize_integrated_dao(&sender, &authority, &cfg).await.unwrap_err();
        assert!(matches!(err, AppError::CreationFailed(_)));
    }

    #[tokio::test]
    async fn test_unfunded_authority_cannot_create_mints() {
        let cluster = Arc::new(LocalCluster::new());
        let sender = TransactionSender::new(cluster.clone(), 3, Duration::ZERO);
        let authority = Keypair::new();
        let mut cfg = config(1, 1);
        cfg.members[0] = authority.pubkey();

        let err = initialize_integrated_dao(&sender, &authority, &cfg).await.unwrap_err();
        assert!(matches!(
            err.chain_error().and_then(|e| e.program_error()),
            Some(crate::chain::ProgramError::InsufficientFunds { .. })
        ));
        assert!(cluster.get_realm(&pda::realm(&cfg.name)).await.unwrap().is_none());
    }
}
