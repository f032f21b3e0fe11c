//! Asset transfer builders
//!
//! Instructions meant to be stored in a multisig vault transaction or a
//! governance proposal transaction. The funding account is a program-derived
//! authority in both cases, so the program signs for it on execution.
//!
//! Token transfers move balances between associated token accounts. The
//! recipient's account is created on the fly (idempotently) and the funding
//! authority pays its rent.

use crate::chain::{pda, Cluster, TransactionSender};
use crate::error::AppError;
use solana_instruction::{AccountMeta, Instruction};
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_sdk_ids::system_program;
use solana_signature::Signature;
use solana_signer::Signer;
use tracing::info;

/// Associated token program instruction tag for `CreateIdempotent`
const CREATE_IDEMPOTENT: u8 = 1;

pub fn system_transfer(from: &Pubkey, to: &Pubkey, lamports: u64) -> Instruction {
    solana_system_interface::instruction::transfer(from, to, lamports)
}

/// Transfer out of the default vault of a multisig
pub fn vault_sol_transfer(multisig: &Pubkey, recipient: &Pubkey, lamports: u64) -> Instruction {
    let vault = pda::vault(multisig, pda::DEFAULT_VAULT_INDEX);
    system_transfer(&vault, recipient, lamports)
}

/// Transfer out of the native treasury of a realm's governance
pub fn treasury_sol_transfer(realm: &Pubkey, recipient: &Pubkey, lamports: u64) -> Instruction {
    let treasury = pda::native_treasury(&pda::governance(realm));
    system_transfer(&treasury, recipient, lamports)
}

/// Create `wallet`'s associated token account for `mint` unless it exists
pub fn create_associated_token_account(payer: &Pubkey, wallet: &Pubkey, mint: &Pubkey) -> Instruction {
    Instruction {
        program_id: pda::ASSOCIATED_TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(pda::associated_token_account(wallet, mint), false),
            AccountMeta::new_readonly(*wallet, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program::ID, false),
            AccountMeta::new_readonly(pda::TOKEN_PROGRAM_ID, false),
        ],
        data: vec![CREATE_IDEMPOTENT],
    }
}

/// Move `amount` base units of `mint` from `owner`'s associated token
/// account to `recipient`'s, creating the latter with `owner` as payer.
pub fn token_transfer(
    owner: &Pubkey,
    recipient: &Pubkey,
    mint: &Pubkey,
    amount: u64,
    decimals: u8,
) -> Result<Vec<Instruction>, AppError> {
    let transfer = spl_token_2022::instruction::transfer_checked(
        &pda::TOKEN_PROGRAM_ID,
        &pda::associated_token_account(owner, mint),
        mint,
        &pda::associated_token_account(recipient, mint),
        owner,
        &[],
        amount,
        decimals,
    )
    .map_err(|e| AppError::Validation(format!("Invalid token transfer: {}", e)))?;

    Ok(vec![create_associated_token_account(owner, recipient, mint), transfer])
}

/// Token transfer out of the default vault of a multisig
pub async fn vault_token_transfer(
    cluster: &dyn Cluster,
    multisig: &Pubkey,
    recipient: &Pubkey,
    mint: &Pubkey,
    amount: u64,
) -> Result<Vec<Instruction>, AppError> {
    let vault = pda::vault(multisig, pda::DEFAULT_VAULT_INDEX);
    let decimals = mint_decimals(cluster, mint).await?;
    token_transfer(&vault, recipient, mint, amount, decimals)
}

/// Token transfer out of the native treasury of a realm's governance
pub async fn treasury_token_transfer(
    cluster: &dyn Cluster,
    realm: &Pubkey,
    recipient: &Pubkey,
    mint: &Pubkey,
    amount: u64,
) -> Result<Vec<Instruction>, AppError> {
    let treasury = pda::native_treasury(&pda::governance(realm));
    let decimals = mint_decimals(cluster, mint).await?;
    token_transfer(&treasury, recipient, mint, amount, decimals)
}

pub async fn mint_decimals(cluster: &dyn Cluster, mint: &Pubkey) -> Result<u8, AppError> {
    cluster
        .get_mint(mint)
        .await
        .map_err(AppError::Unavailable)?
        .map(|m| m.decimals)
        .ok_or_else(|| AppError::NotFound(format!("Mint {} does not exist", mint)))
}

/// Move lamports from the signer's wallet into a vault or treasury
pub async fn fund(
    sender: &TransactionSender,
    payer: &Keypair,
    target: &Pubkey,
    lamports: u64,
) -> Result<Signature, AppError> {
    if lamports == 0 {
        return Err(AppError::Validation("Amount must be greater than zero".to_string()));
    }

    let ix = system_transfer(&payer.pubkey(), target, lamports);
    let signature = sender
        .send_and_confirm(payer, &[], vec![ix])
        .await
        .map_err(AppError::SubmissionFailed)?;

    info!(%target, lamports, %signature, "Funded account");
    Ok(signature)
}

/// Move tokens from the signer's associated token account into the
/// vault's or treasury's, creating the latter if needed.
pub async fn fund_tokens(
    sender: &TransactionSender,
    payer: &Keypair,
    target: &Pubkey,
    mint: &Pubkey,
    amount: u64,
) -> Result<Signature, AppError> {
    if amount == 0 {
        return Err(AppError::Validation("Amount must be greater than zero".to_string()));
    }

    let decimals = mint_decimals(sender.cluster().as_ref(), mint).await?;
    let ixs = token_transfer(&payer.pubkey(), target, mint, amount, decimals)?;
    let signature = sender
        .send_and_confirm(payer, &[], ixs)
        .await
        .map_err(AppError::SubmissionFailed)?;

    info!(%target, %mint, amount, %signature, "Funded token account");
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LocalCluster;
    use crate::governance::GovernanceDriver;
    use crate::provision::{create_mint, initialize_integrated_dao, DaoConfig, ProvisionedDao};
    use crate::sync::{MultisigSync, Orchestrator};
    use pretty_assertions::assert_eq;
    use solana_native_token::LAMPORTS_PER_SOL;
    use std::sync::Arc;
    use std::time::Duration;

    const DECIMALS: u8 = 2;

    #[test]
    fn test_vault_transfer_draws_from_default_vault() {
        let multisig = Pubkey::new_unique();
        let recipient = Pubkey::new_unique();
        let ix = vault_sol_transfer(&multisig, &recipient, 7);

        assert_eq!(ix.accounts[0].pubkey, pda::vault(&multisig, 0));
        assert_eq!(ix.accounts[1].pubkey, recipient);
        assert!(ix.accounts[0].is_signer);
    }

    #[test]
    fn test_treasury_transfer_draws_from_native_treasury() {
        let realm = pda::realm("Pay DAO");
        let ix = treasury_sol_transfer(&realm, &Pubkey::new_unique(), 7);
        assert_eq!(ix.accounts[0].pubkey, pda::native_treasury(&pda::governance(&realm)));
    }

    #[test]
    fn test_token_transfer_creates_recipient_account_first() {
        let owner = Pubkey::new_unique();
        let recipient = Pubkey::new_unique();
        let mint = Pubkey::new_unique();

        let ixs = token_transfer(&owner, &recipient, &mint, 5, DECIMALS).unwrap();
        assert_eq!(ixs.len(), 2);

        let create = &ixs[0];
        assert_eq!(create.program_id, pda::ASSOCIATED_TOKEN_PROGRAM_ID);
        assert_eq!(create.accounts[0], AccountMeta::new(owner, true));
        assert_eq!(create.accounts[1].pubkey, pda::associated_token_account(&recipient, &mint));
        assert_eq!(create.data, vec![CREATE_IDEMPOTENT]);

        let transfer = &ixs[1];
        assert_eq!(transfer.program_id, pda::TOKEN_PROGRAM_ID);
        let keys: Vec<Pubkey> = transfer.accounts.iter().map(|m| m.pubkey).collect();
        assert_eq!(
            keys,
            vec![
                pda::associated_token_account(&owner, &mint),
                mint,
                pda::associated_token_account(&recipient, &mint),
                owner,
            ]
        );
        assert!(transfer.accounts[3].is_signer);
    }

    struct TokenDao {
        cluster: Arc<LocalCluster>,
        sender: TransactionSender,
        authority: Keypair,
        dao: ProvisionedDao,
        mint: Pubkey,
    }

    /// Single-member DAO plus a mint whose supply sits with the authority
    async fn token_dao() -> TokenDao {
        let cluster = Arc::new(LocalCluster::new());
        let sender = TransactionSender::new(cluster.clone(), 3, Duration::ZERO);
        let authority = Keypair::new();
        cluster.airdrop(&authority.pubkey(), LAMPORTS_PER_SOL).await;
        let dao = initialize_integrated_dao(
            &sender,
            &authority,
            &DaoConfig {
                name: "Token DAO".to_string(),
                members: vec![authority.pubkey()],
                threshold: 1,
            },
        )
        .await
        .unwrap();

        let mint = Keypair::new();
        let owner = authority.pubkey();
        let source = pda::associated_token_account(&owner, &mint.pubkey());
        let mut ixs = create_mint(&owner, &mint.pubkey(), &owner, DECIMALS, 1_461_600).unwrap();
        ixs.push(create_associated_token_account(&owner, &owner, &mint.pubkey()));
        ixs.push(
            spl_token_2022::instruction::mint_to_checked(
                &pda::TOKEN_PROGRAM_ID,
                &mint.pubkey(),
                &source,
                &owner,
                &[],
                10_000,
                DECIMALS,
            )
            .unwrap(),
        );
        sender.send_and_confirm(&authority, &[&mint], ixs).await.unwrap();

        TokenDao {
            cluster,
            sender,
            authority,
            dao,
            mint: mint.pubkey(),
        }
    }

    async fn token_balance(cluster: &LocalCluster, wallet: &Pubkey, mint: &Pubkey) -> Option<u64> {
        cluster
            .get_token_account(&pda::associated_token_account(wallet, mint))
            .await
            .unwrap()
            .map(|a| a.amount)
    }

    #[tokio::test]
    async fn test_integrated_vault_token_transfer() {
        let t = token_dao().await;
        fund_tokens(&t.sender, &t.authority, &t.dao.vault, &t.mint, 3_000).await.unwrap();
        // The vault pays rent for the recipient's token account
        fund(&t.sender, &t.authority, &t.dao.vault, 10_000_000).await.unwrap();
        assert_eq!(token_balance(&t.cluster, &t.dao.vault, &t.mint).await, Some(3_000));

        let recipient = Pubkey::new_unique();
        let ixs = vault_token_transfer(t.cluster.as_ref(), &t.dao.multisig, &recipient, &t.mint, 1_250)
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(t.sender.clone(), Duration::ZERO);
        let created = orchestrator
            .create_integrated_asset_transfer_proposal(&t.dao.realm, &t.authority, "Tokens", "", ixs)
            .await
            .unwrap();
        assert_eq!(token_balance(&t.cluster, &recipient, &t.mint).await, None);

        let voted = orchestrator
            .cast_vote(&t.dao.realm, &t.authority, &created.proposal, true)
            .await;
        assert!(voted.primary.is_ok());
        assert!(matches!(voted.multisig, MultisigSync::Executed { .. }));
        assert_eq!(token_balance(&t.cluster, &recipient, &t.mint).await, Some(1_250));
        assert_eq!(token_balance(&t.cluster, &t.dao.vault, &t.mint).await, Some(1_750));
    }

    #[tokio::test]
    async fn test_treasury_token_transfer_on_execution() {
        let t = token_dao().await;
        fund_tokens(&t.sender, &t.authority, &t.dao.treasury, &t.mint, 800).await.unwrap();
        fund(&t.sender, &t.authority, &t.dao.treasury, 10_000_000).await.unwrap();

        let recipient = Pubkey::new_unique();
        let ixs = treasury_token_transfer(t.cluster.as_ref(), &t.dao.realm, &recipient, &t.mint, 300)
            .await
            .unwrap();
        let driver = GovernanceDriver::new(t.sender.clone());
        let proposal = driver
            .create_proposal(&t.dao.realm, &t.authority, "Grant", "", ixs)
            .await
            .unwrap();
        driver.cast_vote(&t.dao.realm, &t.authority, &proposal, true).await.unwrap();
        driver.execute_proposal(&t.authority, &proposal).await.unwrap();

        assert_eq!(token_balance(&t.cluster, &recipient, &t.mint).await, Some(300));
        assert_eq!(token_balance(&t.cluster, &t.dao.treasury, &t.mint).await, Some(500));
    }

    #[tokio::test]
    async fn test_unknown_mint_is_not_found() {
        let cluster = LocalCluster::new();
        let err = vault_token_transfer(&cluster, &Pubkey::new_unique(), &Pubkey::new_unique(), &Pubkey::new_unique(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
