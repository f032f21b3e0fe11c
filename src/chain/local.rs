//! In-memory cluster
//!
//! Runs the observable rules of the governance, multisig, token and system
//! programs against a ledger held in memory. Used for the `localnet` backend
//! and by the test suite. Transactions are real signed transactions; they
//! are verified, decompiled and applied atomically: either all of their
//! instructions land or the ledger is left untouched and the rejection is
//! returned, the way preflight simulation behaves on a real cluster.

use crate::chain::accounts::*;
use crate::chain::instruction::{account_at, decompile, instruction_name};
use crate::chain::{pda, ChainError, Cluster, GovernanceInstruction, MultisigInstruction, ProgramError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use solana_hash::Hash;
use solana_instruction::{AccountMeta, Instruction};
use solana_pubkey::Pubkey;
use solana_sdk_ids::system_program;
use solana_signature::Signature;
use solana_system_interface::instruction::SystemInstruction;
use solana_transaction::Transaction;
use spl_token_2022::instruction::TokenInstruction;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

const ACCOUNT_STORAGE_OVERHEAD: u64 = 128;
const LAMPORTS_PER_BYTE_YEAR: u64 = 3_480;
const EXEMPTION_THRESHOLD_YEARS: u64 = 2;
const TOKEN_ACCOUNT_LEN: usize = 165;
const CREATE_IDEMPOTENT: u8 = 1;

/// Rent-exempt minimum with the default rent parameters
pub fn rent_exempt_minimum(data_len: usize) -> u64 {
    (ACCOUNT_STORAGE_OVERHEAD + data_len as u64) * LAMPORTS_PER_BYTE_YEAR * EXEMPTION_THRESHOLD_YEARS
}

#[derive(Debug, Clone)]
struct Ledger {
    balances: HashMap<Pubkey, u64>,
    /// Owner program of every account allocated through the system program
    allocations: HashMap<Pubkey, Pubkey>,
    mints: HashMap<Pubkey, TokenMint>,
    token_accounts: HashMap<Pubkey, TokenAccount>,
    realms: HashMap<Pubkey, Realm>,
    governances: HashMap<Pubkey, Governance>,
    token_owner_records: HashMap<Pubkey, TokenOwnerRecord>,
    proposals: HashMap<Pubkey, GovernanceProposal>,
    /// (proposal, voter token owner record)
    vote_records: HashSet<(Pubkey, Pubkey)>,
    proposal_transactions: HashMap<Pubkey, ProposalTransaction>,
    program_config: ProgramConfig,
    multisigs: HashMap<Pubkey, Multisig>,
    multisig_proposals: HashMap<Pubkey, MultisigProposal>,
    vault_transactions: HashMap<Pubkey, VaultTransaction>,
}

/// Cluster simulated in process memory
pub struct LocalCluster {
    ledger: RwLock<Ledger>,
    /// Status polls left before a signature reports as confirmed. A
    /// signature is forgotten once it has reported.
    pending: RwLock<HashMap<Signature, u32>>,
    blockhash_height: AtomicU64,
    confirmation_lag: u32,
    #[cfg(test)]
    processed: RwLock<Vec<&'static str>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::with_confirmation_lag(0)
    }

    /// Signatures stay unconfirmed for `lag` status polls
    pub fn with_confirmation_lag(lag: u32) -> Self {
        let program_config = ProgramConfig {
            treasury: Pubkey::new_unique(),
        };
        Self {
            ledger: RwLock::new(Ledger::new(program_config)),
            pending: RwLock::new(HashMap::new()),
            blockhash_height: AtomicU64::new(0),
            confirmation_lag: lag,
            #[cfg(test)]
            processed: RwLock::new(Vec::new()),
        }
    }

    pub async fn airdrop(&self, address: &Pubkey, lamports: u64) {
        let mut ledger = self.ledger.write().await;
        *ledger.balances.entry(*address).or_insert(0) += lamports;
    }

    /// Names of every instruction that landed, in order
    #[cfg(test)]
    pub async fn processed_instructions(&self) -> Vec<&'static str> {
        self.processed.read().await.clone()
    }

    #[cfg(test)]
    pub async fn pending_signatures(&self) -> usize {
        self.pending.read().await.len()
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    async fn latest_blockhash(&self) -> Result<Hash, ChainError> {
        let height = self.blockhash_height.fetch_add(1, Ordering::Relaxed);
        let digest: [u8; 32] = Sha256::digest(height.to_le_bytes()).into();
        Ok(Hash::new_from_array(digest))
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, ChainError> {
        transaction
            .verify()
            .map_err(|e| ChainError::Rpc(format!("Transaction signature verification failed: {}", e)))?;
        let signature = transaction
            .signatures
            .first()
            .copied()
            .ok_or_else(|| ChainError::Rpc("Transaction carries no signature".to_string()))?;

        let message = &transaction.message;
        let signers = &message.account_keys[..message.header.num_required_signatures as usize];
        let instructions = decompile(message)?;

        {
            let mut ledger = self.ledger.write().await;
            let mut working = ledger.clone();
            for ix in &instructions {
                if let Err(e) = working.process(ix, signers) {
                    debug!(%signature, instruction = instruction_name(ix), error = %e, "Simulation rejected transaction");
                    return Err(e.into());
                }
            }
            *ledger = working;
        }

        #[cfg(test)]
        self.processed
            .write()
            .await
            .extend(instructions.iter().map(instruction_name));

        debug!(%signature, instructions = instructions.len(), "Transaction applied");
        self.pending.write().await.insert(signature, self.confirmation_lag);
        Ok(signature)
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<Result<(), ProgramError>>, ChainError> {
        let mut pending = self.pending.write().await;
        match pending.get_mut(signature) {
            None => Ok(None),
            Some(polls_left) if *polls_left > 0 => {
                *polls_left -= 1;
                Ok(None)
            }
            Some(_) => {
                pending.remove(signature);
                Ok(Some(Ok(())))
            }
        }
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, ChainError> {
        Ok(self.ledger.read().await.balances.get(address).copied().unwrap_or(0))
    }

    async fn minimum_balance_for_rent_exemption(&self, data_len: usize) -> Result<u64, ChainError> {
        Ok(rent_exempt_minimum(data_len))
    }

    async fn get_realm(&self, address: &Pubkey) -> Result<Option<Realm>, ChainError> {
        Ok(self.ledger.read().await.realms.get(address).cloned())
    }

    async fn get_governance(&self, address: &Pubkey) -> Result<Option<Governance>, ChainError> {
        Ok(self.ledger.read().await.governances.get(address).cloned())
    }

    async fn get_token_owner_record(
        &self,
        address: &Pubkey,
    ) -> Result<Option<TokenOwnerRecord>, ChainError> {
        Ok(self.ledger.read().await.token_owner_records.get(address).cloned())
    }

    async fn get_governance_proposal(
        &self,
        address: &Pubkey,
    ) -> Result<Option<GovernanceProposal>, ChainError> {
        Ok(self.ledger.read().await.proposals.get(address).cloned())
    }

    async fn get_proposal_transaction(
        &self,
        address: &Pubkey,
    ) -> Result<Option<ProposalTransaction>, ChainError> {
        Ok(self.ledger.read().await.proposal_transactions.get(address).cloned())
    }

    async fn get_program_config(&self) -> Result<Option<ProgramConfig>, ChainError> {
        Ok(Some(self.ledger.read().await.program_config))
    }

    async fn get_multisig(&self, address: &Pubkey) -> Result<Option<Multisig>, ChainError> {
        Ok(self.ledger.read().await.multisigs.get(address).cloned())
    }

    async fn get_multisig_proposal(
        &self,
        address: &Pubkey,
    ) -> Result<Option<MultisigProposal>, ChainError> {
        Ok(self.ledger.read().await.multisig_proposals.get(address).cloned())
    }

    async fn get_vault_transaction(
        &self,
        address: &Pubkey,
    ) -> Result<Option<VaultTransaction>, ChainError> {
        Ok(self.ledger.read().await.vault_transactions.get(address).cloned())
    }

    async fn get_mint(&self, address: &Pubkey) -> Result<Option<TokenMint>, ChainError> {
        Ok(self.ledger.read().await.mints.get(address).copied())
    }

    async fn get_token_account(&self, address: &Pubkey) -> Result<Option<TokenAccount>, ChainError> {
        Ok(self.ledger.read().await.token_accounts.get(address).copied())
    }
}

// =============================================================================
// PROGRAM RULES
// =============================================================================

fn require_signer(signers: &[Pubkey], key: &Pubkey) -> Result<(), ProgramError> {
    if signers.contains(key) {
        Ok(())
    } else {
        Err(ProgramError::MissingSignature(*key))
    }
}

fn require_vacant(address: Pubkey, occupied: bool) -> Result<(), ProgramError> {
    if occupied {
        Err(ProgramError::AccountAlreadyExists(address))
    } else {
        Ok(())
    }
}

/// Outcome of a council vote under early tipping, if already decided
fn tipped_state(yes: u64, no: u64, supply: u64, threshold_pct: u8) -> Option<ProposalState> {
    let pct = threshold_pct as u128;
    let supply = supply as u128;
    if yes as u128 * 100 >= pct * supply {
        Some(ProposalState::Succeeded)
    } else if supply.saturating_sub(no as u128) * 100 < pct * supply {
        Some(ProposalState::Defeated)
    } else {
        None
    }
}

/// Every key an inner instruction touches must be passed to the outer one
fn require_passed(passed: &[AccountMeta], instructions: &[Instruction]) -> Result<(), ProgramError> {
    for ix in instructions {
        let keys = std::iter::once(&ix.program_id).chain(ix.accounts.iter().map(|m| &m.pubkey));
        for key in keys {
            if !passed.iter().any(|m| m.pubkey == *key) {
                return Err(ProgramError::InvalidArgument(format!("account {} was not passed", key)));
            }
        }
    }
    Ok(())
}

impl Ledger {
    fn new(program_config: ProgramConfig) -> Self {
        Self {
            balances: HashMap::new(),
            allocations: HashMap::new(),
            mints: HashMap::new(),
            token_accounts: HashMap::new(),
            realms: HashMap::new(),
            governances: HashMap::new(),
            token_owner_records: HashMap::new(),
            proposals: HashMap::new(),
            vote_records: HashSet::new(),
            proposal_transactions: HashMap::new(),
            program_config,
            multisigs: HashMap::new(),
            multisig_proposals: HashMap::new(),
            vault_transactions: HashMap::new(),
        }
    }

    /// Run one top-level instruction; `signers` signed the transaction
    fn process(&mut self, ix: &Instruction, signers: &[Pubkey]) -> Result<(), ProgramError> {
        if ix.program_id == pda::GOVERNANCE_PROGRAM_ID {
            self.process_governance(GovernanceInstruction::decode(ix)?, signers)
        } else if ix.program_id == pda::MULTISIG_PROGRAM_ID {
            self.process_multisig(MultisigInstruction::decode(ix)?, signers)
        } else {
            self.process_native(ix, signers)
        }
    }

    /// System, token and associated token account instructions, the only
    /// ones a treasury or vault may invoke
    fn process_native(&mut self, ix: &Instruction, signers: &[Pubkey]) -> Result<(), ProgramError> {
        if ix.program_id == system_program::ID {
            self.process_system(ix, signers)
        } else if ix.program_id == pda::TOKEN_PROGRAM_ID {
            self.process_token(ix, signers)
        } else if ix.program_id == pda::ASSOCIATED_TOKEN_PROGRAM_ID {
            self.process_associated_token(ix, signers)
        } else {
            Err(ProgramError::UnsupportedInstruction(ix.program_id))
        }
    }

    fn debit(&mut self, account: &Pubkey, lamports: u64) -> Result<(), ProgramError> {
        let available = self.balances.get(account).copied().unwrap_or(0);
        if available < lamports {
            return Err(ProgramError::InsufficientFunds {
                account: *account,
                needed: lamports,
                available,
            });
        }
        self.balances.insert(*account, available - lamports);
        Ok(())
    }

    fn credit(&mut self, account: &Pubkey, lamports: u64) {
        *self.balances.entry(*account).or_insert(0) += lamports;
    }

    // -------------------------------------------------------------------------
    // System, token and associated token account programs
    // -------------------------------------------------------------------------

    fn process_system(&mut self, ix: &Instruction, signers: &[Pubkey]) -> Result<(), ProgramError> {
        let instruction: SystemInstruction = bincode::deserialize(&ix.data)
            .map_err(|_| ProgramError::InvalidArgument("malformed system instruction".to_string()))?;

        match instruction {
            SystemInstruction::Transfer { lamports } => {
                let from = account_at(ix, 0)?;
                let to = account_at(ix, 1)?;
                require_signer(signers, &from)?;
                self.debit(&from, lamports)?;
                self.credit(&to, lamports);
            }
            SystemInstruction::CreateAccount { lamports, owner, .. } => {
                let from = account_at(ix, 0)?;
                let new = account_at(ix, 1)?;
                require_signer(signers, &from)?;
                require_signer(signers, &new)?;
                let occupied = self.allocations.contains_key(&new) || self.balances.get(&new).is_some_and(|b| *b > 0);
                require_vacant(new, occupied)?;

                self.debit(&from, lamports)?;
                self.credit(&new, lamports);
                self.allocations.insert(new, owner);
            }
            _ => return Err(ProgramError::UnsupportedInstruction(ix.program_id)),
        }
        Ok(())
    }

    fn mint_mut(&mut self, address: &Pubkey, decimals: u8) -> Result<&mut TokenMint, ProgramError> {
        let mint = self
            .mints
            .get_mut(address)
            .ok_or(ProgramError::UninitializedAccount(*address))?;
        if mint.decimals != decimals {
            return Err(ProgramError::InvalidArgument(format!(
                "mint has {} decimals, instruction says {}",
                mint.decimals, decimals
            )));
        }
        Ok(mint)
    }

    fn token_account_of_mint(&self, address: &Pubkey, mint: &Pubkey) -> Result<TokenAccount, ProgramError> {
        let account = self
            .token_accounts
            .get(address)
            .copied()
            .ok_or(ProgramError::UninitializedAccount(*address))?;
        if account.mint != *mint {
            return Err(ProgramError::InvalidArgument(format!("token account {} holds another mint", address)));
        }
        Ok(account)
    }

    fn process_token(&mut self, ix: &Instruction, signers: &[Pubkey]) -> Result<(), ProgramError> {
        let instruction = TokenInstruction::unpack(&ix.data)
            .map_err(|_| ProgramError::InvalidArgument("malformed token instruction".to_string()))?;

        match instruction {
            TokenInstruction::InitializeMint2 {
                decimals,
                mint_authority,
                ..
            } => {
                let mint = account_at(ix, 0)?;
                if self.allocations.get(&mint) != Some(&pda::TOKEN_PROGRAM_ID) {
                    return Err(ProgramError::UninitializedAccount(mint));
                }
                require_vacant(mint, self.mints.contains_key(&mint))?;
                self.mints.insert(
                    mint,
                    TokenMint {
                        mint_authority: Some(mint_authority),
                        supply: 0,
                        decimals,
                    },
                );
            }

            TokenInstruction::MintToChecked { amount, decimals } => {
                let mint = account_at(ix, 0)?;
                let destination = account_at(ix, 1)?;
                let authority = account_at(ix, 2)?;
                require_signer(signers, &authority)?;
                self.token_account_of_mint(&destination, &mint)?;

                let mint_account = self.mint_mut(&mint, decimals)?;
                if mint_account.mint_authority != Some(authority) {
                    return Err(ProgramError::Unauthorized);
                }
                mint_account.supply += amount;
                if let Some(account) = self.token_accounts.get_mut(&destination) {
                    account.amount += amount;
                }
            }

            TokenInstruction::TransferChecked { amount, decimals } => {
                let source = account_at(ix, 0)?;
                let mint = account_at(ix, 1)?;
                let destination = account_at(ix, 2)?;
                let authority = account_at(ix, 3)?;
                require_signer(signers, &authority)?;
                self.mint_mut(&mint, decimals)?;

                let from = self.token_account_of_mint(&source, &mint)?;
                self.token_account_of_mint(&destination, &mint)?;
                if from.owner != authority {
                    return Err(ProgramError::Unauthorized);
                }
                if from.amount < amount {
                    return Err(ProgramError::InsufficientFunds {
                        account: source,
                        needed: amount,
                        available: from.amount,
                    });
                }

                if let Some(account) = self.token_accounts.get_mut(&source) {
                    account.amount -= amount;
                }
                if let Some(account) = self.token_accounts.get_mut(&destination) {
                    account.amount += amount;
                }
            }

            _ => return Err(ProgramError::UnsupportedInstruction(ix.program_id)),
        }
        Ok(())
    }

    fn process_associated_token(&mut self, ix: &Instruction, signers: &[Pubkey]) -> Result<(), ProgramError> {
        if ix.data.as_slice() != [CREATE_IDEMPOTENT] {
            return Err(ProgramError::UnsupportedInstruction(ix.program_id));
        }
        let payer = account_at(ix, 0)?;
        let address = account_at(ix, 1)?;
        let wallet = account_at(ix, 2)?;
        let mint = account_at(ix, 3)?;
        require_signer(signers, &payer)?;

        if let Some(existing) = self.token_accounts.get(&address) {
            return if existing.mint == mint && existing.owner == wallet {
                Ok(())
            } else {
                Err(ProgramError::InvalidArgument(format!("{} is owned by another wallet", address)))
            };
        }
        if address != pda::associated_token_account(&wallet, &mint) {
            return Err(ProgramError::InvalidArgument(
                "address is not the associated token account of the wallet".to_string(),
            ));
        }
        if !self.mints.contains_key(&mint) {
            return Err(ProgramError::UninitializedAccount(mint));
        }

        let rent = rent_exempt_minimum(TOKEN_ACCOUNT_LEN);
        self.debit(&payer, rent)?;
        self.credit(&address, rent);
        self.allocations.insert(address, pda::TOKEN_PROGRAM_ID);
        self.token_accounts.insert(
            address,
            TokenAccount {
                mint,
                owner: wallet,
                amount: 0,
            },
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Governance program
    // -------------------------------------------------------------------------

    fn realm(&self, address: &Pubkey) -> Result<Realm, ProgramError> {
        self.realms
            .get(address)
            .cloned()
            .ok_or(ProgramError::UninitializedAccount(*address))
    }

    fn token_owner_record(&self, address: &Pubkey) -> Result<TokenOwnerRecord, ProgramError> {
        self.token_owner_records
            .get(address)
            .cloned()
            .ok_or(ProgramError::UninitializedAccount(*address))
    }

    fn proposal(&self, address: &Pubkey) -> Result<GovernanceProposal, ProgramError> {
        self.proposals
            .get(address)
            .cloned()
            .ok_or(ProgramError::UninitializedAccount(*address))
    }

    fn proposal_mut(&mut self, address: &Pubkey) -> Result<&mut GovernanceProposal, ProgramError> {
        self.proposals
            .get_mut(address)
            .ok_or(ProgramError::UninitializedAccount(*address))
    }

    /// The proposal owner must act in person
    fn require_proposal_owner(
        &self,
        proposal: &GovernanceProposal,
        authority: &Pubkey,
        signers: &[Pubkey],
    ) -> Result<(), ProgramError> {
        let owner = self.token_owner_record(&proposal.token_owner_record)?.governing_token_owner;
        if owner != *authority {
            return Err(ProgramError::Unauthorized);
        }
        require_signer(signers, authority)
    }

    fn require_governing_mint(realm: &Realm, mint: &Pubkey) -> Result<(), ProgramError> {
        if *mint == realm.community_mint || Some(*mint) == realm.council_mint {
            Ok(())
        } else {
            Err(ProgramError::InvalidArgument(
                "mint is not a governing token of the realm".to_string(),
            ))
        }
    }

    fn governing_supply(&self, realm: &Pubkey, mint: &Pubkey) -> u64 {
        self.token_owner_records
            .values()
            .filter(|r| r.realm == *realm && r.governing_token_mint == *mint)
            .map(|r| r.deposit_amount)
            .sum()
    }

    fn process_governance(&mut self, ix: GovernanceInstruction, signers: &[Pubkey]) -> Result<(), ProgramError> {
        match ix {
            GovernanceInstruction::CreateRealm {
                name,
                realm_authority,
                community_mint,
                council_mint,
                payer,
            } => {
                require_signer(signers, &payer)?;
                for mint in std::iter::once(&community_mint).chain(council_mint.as_ref()) {
                    if !self.mints.contains_key(mint) {
                        return Err(ProgramError::UninitializedAccount(*mint));
                    }
                }

                let address = pda::realm(&name);
                require_vacant(address, self.realms.contains_key(&address))?;
                self.realms.insert(
                    address,
                    Realm {
                        name,
                        community_mint,
                        council_mint,
                        authority: Some(realm_authority),
                    },
                );
            }

            GovernanceInstruction::CreateGovernance {
                realm,
                create_authority,
                payer,
                council_yes_threshold_pct,
                ..
            } => {
                require_signer(signers, &payer)?;
                require_signer(signers, &create_authority)?;
                if self.realm(&realm)?.authority != Some(create_authority) {
                    return Err(ProgramError::Unauthorized);
                }
                if council_yes_threshold_pct == 0 || council_yes_threshold_pct > 100 {
                    return Err(ProgramError::InvalidArgument(format!(
                        "council threshold {}% out of range",
                        council_yes_threshold_pct
                    )));
                }

                let address = pda::governance(&realm);
                require_vacant(address, self.governances.contains_key(&address))?;
                self.governances.insert(
                    address,
                    Governance {
                        realm,
                        council_yes_threshold_pct,
                    },
                );
            }

            GovernanceInstruction::CreateNativeTreasury { governance, payer } => {
                require_signer(signers, &payer)?;
                if !self.governances.contains_key(&governance) {
                    return Err(ProgramError::UninitializedAccount(governance));
                }
                self.balances.entry(pda::native_treasury(&governance)).or_insert(0);
            }

            GovernanceInstruction::CreateTokenOwnerRecord {
                realm,
                governing_token_owner,
                governing_token_mint,
                payer,
            } => {
                require_signer(signers, &payer)?;
                Self::require_governing_mint(&self.realm(&realm)?, &governing_token_mint)?;

                let address = pda::token_owner_record(&realm, &governing_token_mint, &governing_token_owner);
                require_vacant(address, self.token_owner_records.contains_key(&address))?;
                self.token_owner_records.insert(
                    address,
                    TokenOwnerRecord {
                        realm,
                        governing_token_mint,
                        governing_token_owner,
                        deposit_amount: 0,
                    },
                );
            }

            GovernanceInstruction::DepositGoverningTokens {
                realm,
                governing_token_mint,
                governing_token_owner,
                source_authority,
                payer,
                amount,
                ..
            } => {
                require_signer(signers, &payer)?;
                require_signer(signers, &source_authority)?;
                Self::require_governing_mint(&self.realm(&realm)?, &governing_token_mint)?;

                // Deposits are minted straight from the mint, so only its authority can fund them
                let mint = self
                    .mints
                    .get_mut(&governing_token_mint)
                    .ok_or(ProgramError::UninitializedAccount(governing_token_mint))?;
                if mint.mint_authority != Some(source_authority) {
                    return Err(ProgramError::InsufficientGoverningTokens);
                }
                mint.supply += amount;

                let address = pda::token_owner_record(&realm, &governing_token_mint, &governing_token_owner);
                self.token_owner_records
                    .entry(address)
                    .or_insert(TokenOwnerRecord {
                        realm,
                        governing_token_mint,
                        governing_token_owner,
                        deposit_amount: 0,
                    })
                    .deposit_amount += amount;
            }

            GovernanceInstruction::CreateProposal {
                realm,
                governance,
                token_owner_record,
                governing_token_mint,
                governance_authority,
                payer,
                name,
                description,
                seed,
            } => {
                require_signer(signers, &payer)?;
                let realm_account = self.realm(&realm)?;
                let governance_account = self
                    .governances
                    .get(&governance)
                    .ok_or(ProgramError::UninitializedAccount(governance))?;
                if governance_account.realm != realm {
                    return Err(ProgramError::InvalidArgument(
                        "governance does not belong to realm".to_string(),
                    ));
                }
                Self::require_governing_mint(&realm_account, &governing_token_mint)?;

                let record = self.token_owner_record(&token_owner_record)?;
                if record.governing_token_owner != governance_authority {
                    return Err(ProgramError::Unauthorized);
                }
                require_signer(signers, &governance_authority)?;
                if record.governing_token_mint != governing_token_mint || record.deposit_amount == 0 {
                    return Err(ProgramError::InsufficientGoverningTokens);
                }

                let address = pda::proposal(&governance, &governing_token_mint, &seed);
                require_vacant(address, self.proposals.contains_key(&address))?;
                self.proposals.insert(
                    address,
                    GovernanceProposal {
                        governance,
                        governing_token_mint,
                        token_owner_record,
                        name,
                        description,
                        state: ProposalState::Draft,
                        yes_votes: 0,
                        no_votes: 0,
                    },
                );
            }

            GovernanceInstruction::InsertTransaction {
                proposal,
                token_owner_record,
                governance_authority,
                payer,
                option_index,
                index,
                instructions,
                ..
            } => {
                require_signer(signers, &payer)?;
                let proposal_account = self.proposal(&proposal)?;
                if proposal_account.state != ProposalState::Draft {
                    return Err(ProgramError::InvalidState(format!(
                        "cannot insert transactions into a {:?} proposal",
                        proposal_account.state
                    )));
                }
                if proposal_account.token_owner_record != token_owner_record {
                    return Err(ProgramError::InvalidArgument(
                        "token owner record does not own the proposal".to_string(),
                    ));
                }
                self.require_proposal_owner(&proposal_account, &governance_authority, signers)?;

                let address = pda::proposal_transaction(&proposal, option_index, index);
                require_vacant(address, self.proposal_transactions.contains_key(&address))?;
                self.proposal_transactions.insert(
                    address,
                    ProposalTransaction {
                        proposal,
                        option_index,
                        index,
                        instructions,
                        executed: false,
                    },
                );
            }

            GovernanceInstruction::SignOffProposal {
                proposal, signatory, ..
            } => {
                let proposal_account = self.proposal(&proposal)?;
                self.require_proposal_owner(&proposal_account, &signatory, signers)?;
                let proposal_account = self.proposal_mut(&proposal)?;
                if !matches!(
                    proposal_account.state,
                    ProposalState::Draft | ProposalState::SigningOff
                ) {
                    return Err(ProgramError::InvalidState(format!(
                        "cannot sign off a {:?} proposal",
                        proposal_account.state
                    )));
                }
                proposal_account.state = ProposalState::Voting;
            }

            GovernanceInstruction::CastVote {
                realm,
                proposal,
                voter_token_owner_record,
                governance_authority,
                payer,
                vote,
                ..
            } => {
                require_signer(signers, &payer)?;
                let record = self.token_owner_record(&voter_token_owner_record)?;
                if record.governing_token_owner != governance_authority {
                    return Err(ProgramError::Unauthorized);
                }
                require_signer(signers, &governance_authority)?;

                let proposal_account = self.proposal(&proposal)?;
                if proposal_account.state != ProposalState::Voting {
                    return Err(ProgramError::InvalidState(format!(
                        "cannot vote on a {:?} proposal",
                        proposal_account.state
                    )));
                }
                if record.realm != realm || record.governing_token_mint != proposal_account.governing_token_mint {
                    return Err(ProgramError::InvalidArgument(
                        "token owner record does not match proposal".to_string(),
                    ));
                }
                if self.vote_records.contains(&(proposal, voter_token_owner_record)) {
                    return Err(ProgramError::AlreadyVoted);
                }
                if record.deposit_amount == 0 {
                    return Err(ProgramError::InsufficientGoverningTokens);
                }

                let threshold_pct = self
                    .governances
                    .get(&proposal_account.governance)
                    .map(|g| g.council_yes_threshold_pct)
                    .ok_or(ProgramError::UninitializedAccount(proposal_account.governance))?;
                let supply = self.governing_supply(&realm, &proposal_account.governing_token_mint);
                self.vote_records.insert((proposal, voter_token_owner_record));

                let proposal_account = self.proposal_mut(&proposal)?;
                match vote {
                    Vote::Approve => proposal_account.yes_votes += record.deposit_amount,
                    Vote::Deny => proposal_account.no_votes += record.deposit_amount,
                }
                if let Some(state) = tipped_state(
                    proposal_account.yes_votes,
                    proposal_account.no_votes,
                    supply,
                    threshold_pct,
                ) {
                    proposal_account.state = state;
                }
            }

            GovernanceInstruction::ExecuteTransaction {
                proposal,
                proposal_transaction,
                accounts,
                ..
            } => {
                let proposal_account = self.proposal(&proposal)?;
                if !proposal_account.state.can_execute() {
                    return Err(ProgramError::InvalidState(format!(
                        "cannot execute a {:?} proposal",
                        proposal_account.state
                    )));
                }
                let treasury = pda::native_treasury(&proposal_account.governance);

                let stored = self
                    .proposal_transactions
                    .get(&proposal_transaction)
                    .cloned()
                    .ok_or(ProgramError::UninitializedAccount(proposal_transaction))?;
                if stored.proposal != proposal {
                    return Err(ProgramError::InvalidArgument(
                        "transaction does not belong to proposal".to_string(),
                    ));
                }
                if stored.executed {
                    return Err(ProgramError::InvalidState("transaction already executed".to_string()));
                }
                require_passed(&accounts, &stored.instructions)?;

                // The program signs for its treasury
                let inner_signers: Vec<Pubkey> = signers.iter().copied().chain([treasury]).collect();
                for ix in &stored.instructions {
                    self.process_native(ix, &inner_signers)?;
                }

                if let Some(t) = self.proposal_transactions.get_mut(&proposal_transaction) {
                    t.executed = true;
                }
                let all_executed = self
                    .proposal_transactions
                    .values()
                    .filter(|t| t.proposal == proposal)
                    .all(|t| t.executed);

                self.proposal_mut(&proposal)?.state = if all_executed {
                    ProposalState::Completed
                } else {
                    ProposalState::Executing
                };
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Multisig program
    // -------------------------------------------------------------------------

    /// Multisig account, with `actor` checked as a signing member
    fn multisig_for_member(
        &self,
        multisig: &Pubkey,
        actor: &Pubkey,
        signers: &[Pubkey],
    ) -> Result<Multisig, ProgramError> {
        require_signer(signers, actor)?;
        let account = self
            .multisigs
            .get(multisig)
            .cloned()
            .ok_or(ProgramError::UninitializedAccount(*multisig))?;
        if !account.is_member(actor) {
            return Err(ProgramError::NotAMember);
        }
        Ok(account)
    }

    fn multisig_proposal(&self, multisig: &Pubkey, address: &Pubkey) -> Result<MultisigProposal, ProgramError> {
        let proposal = self
            .multisig_proposals
            .get(address)
            .cloned()
            .ok_or(ProgramError::UninitializedAccount(*address))?;
        if proposal.multisig != *multisig {
            return Err(ProgramError::InvalidArgument(
                "proposal does not belong to multisig".to_string(),
            ));
        }
        Ok(proposal)
    }

    fn process_multisig(&mut self, ix: MultisigInstruction, signers: &[Pubkey]) -> Result<(), ProgramError> {
        match ix {
            MultisigInstruction::MultisigCreate {
                treasury,
                create_key,
                creator,
                members,
                threshold,
                memo,
            } => {
                require_signer(signers, &create_key)?;
                require_signer(signers, &creator)?;
                if treasury != self.program_config.treasury {
                    return Err(ProgramError::InvalidArgument(
                        "treasury does not match the program config".to_string(),
                    ));
                }
                if members.is_empty() || threshold == 0 || threshold as usize > members.len() {
                    return Err(ProgramError::InvalidArgument(format!(
                        "threshold {} is invalid for {} members",
                        threshold,
                        members.len()
                    )));
                }

                let address = pda::multisig(&create_key);
                require_vacant(address, self.multisigs.contains_key(&address))?;
                self.multisigs.insert(
                    address,
                    Multisig {
                        create_key,
                        threshold,
                        members,
                        transaction_index: 0,
                        stale_transaction_index: 0,
                        memo,
                    },
                );
            }

            MultisigInstruction::VaultTransactionCreate {
                multisig,
                transaction,
                creator,
                vault_index,
                message,
                memo,
            } => {
                let account = self.multisig_for_member(&multisig, &creator, signers)?;
                let index = account.transaction_index + 1;
                if transaction != pda::vault_transaction(&multisig, index) {
                    return Err(ProgramError::InvalidArgument(format!(
                        "transaction account does not match next index {}",
                        index
                    )));
                }
                if message.account_keys.first() != Some(&pda::vault(&multisig, vault_index)) {
                    return Err(ProgramError::InvalidArgument(
                        "vault must be the first key of the message".to_string(),
                    ));
                }

                require_vacant(transaction, self.vault_transactions.contains_key(&transaction))?;
                if let Some(account) = self.multisigs.get_mut(&multisig) {
                    account.transaction_index = index;
                }
                self.vault_transactions.insert(
                    transaction,
                    VaultTransaction {
                        multisig,
                        index,
                        creator,
                        vault_index,
                        message,
                        memo,
                    },
                );
            }

            MultisigInstruction::ProposalCreate {
                multisig,
                creator,
                transaction_index,
            } => {
                let account = self.multisig_for_member(&multisig, &creator, signers)?;
                if transaction_index <= account.stale_transaction_index {
                    return Err(ProgramError::InvalidState("transaction is stale".to_string()));
                }

                let transaction = pda::vault_transaction(&multisig, transaction_index);
                if !self.vault_transactions.contains_key(&transaction) {
                    return Err(ProgramError::UninitializedAccount(transaction));
                }

                let address = pda::multisig_proposal(&multisig, transaction_index);
                require_vacant(address, self.multisig_proposals.contains_key(&address))?;
                self.multisig_proposals.insert(
                    address,
                    MultisigProposal {
                        multisig,
                        transaction_index,
                        status: MultisigProposalStatus::Active,
                        approved: Vec::new(),
                        rejected: Vec::new(),
                    },
                );
            }

            MultisigInstruction::ProposalApprove {
                multisig,
                member,
                proposal,
            } => {
                let threshold = self.multisig_for_member(&multisig, &member, signers)?.threshold as usize;
                let current = self.multisig_proposal(&multisig, &proposal)?;
                if current.approved.contains(&member) {
                    return Err(ProgramError::AlreadyApproved);
                }
                if current.status != MultisigProposalStatus::Active {
                    return Err(ProgramError::InvalidState(format!(
                        "cannot approve a {:?} proposal",
                        current.status
                    )));
                }

                if let Some(account) = self.multisig_proposals.get_mut(&proposal) {
                    account.approved.push(member);
                    if account.approved.len() >= threshold {
                        account.status = MultisigProposalStatus::Approved;
                    }
                }
            }

            MultisigInstruction::VaultTransactionExecute {
                multisig,
                proposal,
                transaction,
                member,
                remaining_accounts,
            } => {
                let threshold = self.multisig_for_member(&multisig, &member, signers)?.threshold;
                let current = self.multisig_proposal(&multisig, &proposal)?;
                match current.status {
                    MultisigProposalStatus::Approved => {}
                    MultisigProposalStatus::Active => {
                        return Err(ProgramError::ThresholdNotReached {
                            approvals: current.approved.len(),
                            threshold,
                        })
                    }
                    status => {
                        return Err(ProgramError::InvalidState(format!(
                            "cannot execute a {:?} proposal",
                            status
                        )))
                    }
                }

                let stored = self
                    .vault_transactions
                    .get(&transaction)
                    .cloned()
                    .ok_or(ProgramError::UninitializedAccount(transaction))?;
                if stored.multisig != multisig || stored.index != current.transaction_index {
                    return Err(ProgramError::InvalidArgument(
                        "transaction does not match proposal".to_string(),
                    ));
                }
                if !remaining_accounts
                    .iter()
                    .map(|m| m.pubkey)
                    .eq(stored.message.account_keys.iter().copied())
                {
                    return Err(ProgramError::InvalidArgument(
                        "remaining accounts do not match the transaction message".to_string(),
                    ));
                }

                // The program signs for its vault
                let vault = pda::vault(&multisig, stored.vault_index);
                let inner_signers: Vec<Pubkey> = signers.iter().copied().chain([vault]).collect();
                for ix in stored.message.instructions()? {
                    self.process_native(&ix, &inner_signers)?;
                }

                if let Some(account) = self.multisig_proposals.get_mut(&proposal) {
                    account.status = MultisigProposalStatus::Executed;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::accounts::VaultTransactionMessage;
    use crate::chain::build_transaction;
    use pretty_assertions::assert_eq;
    use solana_keypair::Keypair;
    use solana_signer::Signer;

    async fn send(
        cluster: &LocalCluster,
        payer: &Keypair,
        extra: &[&Keypair],
        ixs: Vec<Instruction>,
    ) -> Result<Signature, ChainError> {
        let blockhash = cluster.latest_blockhash().await?;
        let tx = build_transaction(payer, extra, &ixs, blockhash)?;
        cluster.send_transaction(&tx).await
    }

    #[test]
    fn test_tipping_thresholds() {
        assert_eq!(tipped_state(1, 0, 1, 100), Some(ProposalState::Succeeded));
        assert_eq!(tipped_state(1, 0, 2, 50), Some(ProposalState::Succeeded));
        assert_eq!(tipped_state(1, 0, 3, 66), None);
        assert_eq!(tipped_state(2, 0, 3, 66), Some(ProposalState::Succeeded));
        assert_eq!(tipped_state(0, 2, 3, 66), Some(ProposalState::Defeated));
    }

    #[test]
    fn test_rent_exempt_minimum_matches_default_rent() {
        assert_eq!(rent_exempt_minimum(82), 1_461_600);
        assert_eq!(rent_exempt_minimum(165), 2_039_280);
    }

    #[tokio::test]
    async fn test_mint_creation_and_token_transfer() {
        let cluster = LocalCluster::new();
        let payer = Keypair::new();
        let mint = Keypair::new();
        let holder = Keypair::new();
        cluster.airdrop(&payer.pubkey(), 10_000_000).await;

        let token = pda::TOKEN_PROGRAM_ID;
        let payer_ata = pda::associated_token_account(&payer.pubkey(), &mint.pubkey());
        let holder_ata = pda::associated_token_account(&holder.pubkey(), &mint.pubkey());
        let create_ata = |wallet: &Pubkey, ata: Pubkey| Instruction {
            program_id: pda::ASSOCIATED_TOKEN_PROGRAM_ID,
            accounts: vec![
                AccountMeta::new(payer.pubkey(), true),
                AccountMeta::new(ata, false),
                AccountMeta::new_readonly(*wallet, false),
                AccountMeta::new_readonly(mint.pubkey(), false),
                AccountMeta::new_readonly(system_program::ID, false),
                AccountMeta::new_readonly(token, false),
            ],
            data: vec![CREATE_IDEMPOTENT],
        };

        let ixs = vec![
            solana_system_interface::instruction::create_account(
                &payer.pubkey(),
                &mint.pubkey(),
                rent_exempt_minimum(82),
                82,
                &token,
            ),
            spl_token_2022::instruction::initialize_mint2(&token, &mint.pubkey(), &payer.pubkey(), None, 2).unwrap(),
            create_ata(&payer.pubkey(), payer_ata),
            create_ata(&holder.pubkey(), holder_ata),
            spl_token_2022::instruction::mint_to_checked(&token, &mint.pubkey(), &payer_ata, &payer.pubkey(), &[], 500, 2)
                .unwrap(),
            spl_token_2022::instruction::transfer_checked(
                &token,
                &payer_ata,
                &mint.pubkey(),
                &holder_ata,
                &payer.pubkey(),
                &[],
                120,
                2,
            )
            .unwrap(),
            // Idempotent: a second create is a no-op
            create_ata(&holder.pubkey(), holder_ata),
        ];
        send(&cluster, &payer, &[&mint], ixs).await.unwrap();

        let mint_account = cluster.get_mint(&mint.pubkey()).await.unwrap().unwrap();
        assert_eq!(mint_account.supply, 500);
        assert_eq!(mint_account.decimals, 2);
        assert_eq!(cluster.get_token_account(&payer_ata).await.unwrap().unwrap().amount, 380);
        assert_eq!(cluster.get_token_account(&holder_ata).await.unwrap().unwrap().amount, 120);
        assert_eq!(
            cluster.get_balance(&payer.pubkey()).await.unwrap(),
            10_000_000 - rent_exempt_minimum(82) - 2 * rent_exempt_minimum(165)
        );
    }

    #[tokio::test]
    async fn test_rejected_transaction_leaves_ledger_untouched() {
        let cluster = LocalCluster::new();
        let payer = Keypair::new();
        let recipient = Pubkey::new_unique();
        cluster.airdrop(&payer.pubkey(), 100).await;

        let ok = solana_system_interface::instruction::transfer(&payer.pubkey(), &recipient, 60);
        let too_much = solana_system_interface::instruction::transfer(&payer.pubkey(), &recipient, 60);

        assert!(send(&cluster, &payer, &[], vec![ok, too_much]).await.is_err());
        assert_eq!(cluster.get_balance(&payer.pubkey()).await.unwrap(), 100);
        assert_eq!(cluster.get_balance(&recipient).await.unwrap(), 0);
        assert!(cluster.processed_instructions().await.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_transaction_fails_verification() {
        let cluster = LocalCluster::new();
        let payer = Keypair::new();
        cluster.airdrop(&payer.pubkey(), 100).await;

        let ix = solana_system_interface::instruction::transfer(&payer.pubkey(), &Pubkey::new_unique(), 10);
        let blockhash = cluster.latest_blockhash().await.unwrap();
        let mut tx = build_transaction(&payer, &[], &[ix], blockhash).unwrap();
        tx.message.account_keys[1] = Pubkey::new_unique();

        let err = cluster.send_transaction(&tx).await.unwrap_err();
        assert!(matches!(err, ChainError::Rpc(_)));
        assert_eq!(cluster.get_balance(&payer.pubkey()).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_confirmed_signatures_are_forgotten() {
        let cluster = LocalCluster::with_confirmation_lag(1);
        let payer = Keypair::new();
        cluster.airdrop(&payer.pubkey(), 100).await;

        let ix = solana_system_interface::instruction::transfer(&payer.pubkey(), &Pubkey::new_unique(), 10);
        let signature = send(&cluster, &payer, &[], vec![ix]).await.unwrap();
        assert_eq!(cluster.pending_signatures().await, 1);

        assert_eq!(cluster.signature_status(&signature).await.unwrap(), None);
        assert_eq!(cluster.signature_status(&signature).await.unwrap(), Some(Ok(())));
        assert_eq!(cluster.pending_signatures().await, 0);
    }

    #[tokio::test]
    async fn test_multisig_rejects_duplicate_approval_and_early_execute() {
        let cluster = LocalCluster::new();
        let creator = Keypair::new();
        let other = Keypair::new();
        let create_key = Keypair::new();
        let multisig = pda::multisig(&create_key.pubkey());
        let vault = pda::vault(&multisig, 0);
        let treasury = cluster.get_program_config().await.unwrap().unwrap().treasury;
        cluster.airdrop(&vault, 1_000).await;

        let create = MultisigInstruction::MultisigCreate {
            treasury,
            create_key: create_key.pubkey(),
            creator: creator.pubkey(),
            members: vec![creator.pubkey(), other.pubkey()],
            threshold: 2,
            memo: None,
        };
        send(&cluster, &creator, &[&create_key], vec![create.try_into().unwrap()])
            .await
            .unwrap();

        let transfer = solana_system_interface::instruction::transfer(&vault, &other.pubkey(), 250);
        let message = VaultTransactionMessage::compile(&vault, &[transfer]).unwrap();
        let ixs = vec![
            MultisigInstruction::VaultTransactionCreate {
                multisig,
                transaction: pda::vault_transaction(&multisig, 1),
                creator: creator.pubkey(),
                vault_index: 0,
                message: message.clone(),
                memo: None,
            },
            MultisigInstruction::ProposalCreate {
                multisig,
                creator: creator.pubkey(),
                transaction_index: 1,
            },
            MultisigInstruction::approve(&multisig, &creator.pubkey(), 1),
        ];
        let ixs = ixs.into_iter().map(|ix| ix.try_into().unwrap()).collect();
        send(&cluster, &creator, &[], ixs).await.unwrap();

        let again = MultisigInstruction::approve(&multisig, &creator.pubkey(), 1);
        let err = send(&cluster, &creator, &[], vec![again.try_into().unwrap()])
            .await
            .unwrap_err();
        assert_eq!(err.program_error(), Some(&ProgramError::AlreadyApproved));

        let execute = MultisigInstruction::execute(&multisig, &creator.pubkey(), 1, &message);
        let err = send(&cluster, &creator, &[], vec![execute.try_into().unwrap()])
            .await
            .unwrap_err();
        assert_eq!(
            err.program_error(),
            Some(&ProgramError::ThresholdNotReached { approvals: 1, threshold: 2 })
        );

        let outsider = Keypair::new();
        let err = send(
            &cluster,
            &outsider,
            &[],
            vec![MultisigInstruction::approve(&multisig, &outsider.pubkey(), 1).try_into().unwrap()],
        )
        .await
        .unwrap_err();
        assert_eq!(err.program_error(), Some(&ProgramError::NotAMember));

        let names = cluster.processed_instructions().await;
        assert!(names.contains(&"VaultTransactionCreate"));
        assert!(names.contains(&"ProposalApprove"));
        assert!(!names.contains(&"VaultTransactionExecute"));
    }

    #[tokio::test]
    async fn test_multisig_create_requires_program_config_treasury() {
        let cluster = LocalCluster::new();
        let creator = Keypair::new();
        let create_key = Keypair::new();

        let create = MultisigInstruction::MultisigCreate {
            treasury: Pubkey::new_unique(),
            create_key: create_key.pubkey(),
            creator: creator.pubkey(),
            members: vec![creator.pubkey()],
            threshold: 1,
            memo: None,
        };
        let ix: Instruction = create.try_into().unwrap();
        assert_eq!(instruction_name(&ix), "MultisigCreate");

        let err = send(&cluster, &creator, &[&create_key], vec![ix]).await.unwrap_err();
        assert!(matches!(err.program_error(), Some(ProgramError::InvalidArgument(_))));
    }
}
