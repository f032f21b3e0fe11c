//! JSON-RPC backed cluster
//!
//! Talks to a validator over HTTP. Transactions go out base64-encoded with a
//! confirmed preflight, and accounts come back as raw bytes decoded against
//! the on-chain layouts of the governance, multisig and token programs.

use crate::chain::accounts::*;
use crate::chain::error::{ChainError, ProgramError};
use crate::chain::instruction::{discriminator, GovernanceConfig, InstructionData, MintMaxVoterWeightSource, VoteThreshold, VoteType};
use crate::chain::{pda, Cluster};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_hash::Hash;
use solana_instruction::Instruction;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::Transaction;
use std::str::FromStr;
use tracing::debug;
use url::Url;

/// Commitment used for reads, preflight and confirmation
const COMMITMENT: &str = "confirmed";

/// Account type tags of the governance program
mod account_type {
    pub const PROPOSAL_TRANSACTION_V2: u8 = 13;
    pub const PROPOSAL_V2: u8 = 14;
    pub const REALM_V2: u8 = 16;
    pub const TOKEN_OWNER_RECORD_V2: u8 = 17;
    pub const GOVERNANCE_V2: u8 = 18;
}

/// Governance program error codes
mod governance_error {
    pub const VOTE_ALREADY_EXISTS: u32 = 519;
    pub const NOT_ENOUGH_TOKENS: u32 = 520;
    pub const INVALID_STATE: [u32; 5] = [522, 524, 526, 530, 531];
}

/// Multisig program error codes
mod multisig_error {
    pub const UNAUTHORIZED: u32 = 6004;
    pub const NOT_A_MEMBER: u32 = 6005;
    pub const STALE_PROPOSAL: u32 = 6007;
    pub const INVALID_PROPOSAL_STATUS: u32 = 6008;
    pub const ALREADY_APPROVED: u32 = 6010;
}

const MINT_LEN: usize = 82;
const TOKEN_ACCOUNT_LEN: usize = 165;

pub struct RpcCluster {
    inner: reqwest::Client,
    endpoint: Url,
}

impl RpcCluster {
    pub fn new(endpoint: Url) -> Result<Self, ChainError> {
        let inner = reqwest::Client::builder()
            .build()
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(Self { inner, endpoint })
    }

    async fn perform<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .inner
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(format!("{}: {}", method, e)))?;

        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| ChainError::Rpc(format!("{}: malformed response: {}", method, e)))?;
        body.into_result(method)
    }

    /// Raw data of an account owned by one of `owners`
    async fn account_data(&self, address: &Pubkey, owners: &[Pubkey]) -> Result<Option<Vec<u8>>, ChainError> {
        let response: WithContext<Option<RpcAccount>> = self
            .perform(
                "getAccountInfo",
                json!([address.to_string(), {"encoding": "base64", "commitment": COMMITMENT}]),
            )
            .await?;
        let Some(account) = response.value else {
            return Ok(None);
        };

        let owner = Pubkey::from_str(&account.owner)
            .map_err(|_| ChainError::invalid_account(address, format!("owner '{}' is not an address", account.owner)))?;
        if !owners.contains(&owner) {
            return Err(ChainError::invalid_account(address, format!("owned by {}", owner)));
        }
        let (encoded, _) = account.data;
        STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| ChainError::invalid_account(address, format!("bad base64: {}", e)))
    }

    async fn governance_account<T>(
        &self,
        address: &Pubkey,
        decode: fn(&Pubkey, &[u8]) -> Result<T, ChainError>,
    ) -> Result<Option<T>, ChainError> {
        match self.account_data(address, &[pda::GOVERNANCE_PROGRAM_ID]).await? {
            Some(data) => decode(address, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn multisig_account<T>(
        &self,
        address: &Pubkey,
        decode: fn(&Pubkey, &[u8]) -> Result<T, ChainError>,
    ) -> Result<Option<T>, ChainError> {
        match self.account_data(address, &[pda::MULTISIG_PROGRAM_ID]).await? {
            Some(data) => decode(address, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn token_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, ChainError> {
        self.account_data(address, &[pda::TOKEN_PROGRAM_ID, spl_token_2022::id()])
            .await
    }
}

#[async_trait]
impl Cluster for RpcCluster {
    async fn latest_blockhash(&self) -> Result<Hash, ChainError> {
        let response: WithContext<RpcBlockhash> = self
            .perform("getLatestBlockhash", json!([{"commitment": COMMITMENT}]))
            .await?;
        Hash::from_str(&response.value.blockhash)
            .map_err(|e| ChainError::Rpc(format!("getLatestBlockhash: {}", e)))
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, ChainError> {
        let wire = bincode::serialize(transaction).map_err(|e| ChainError::Rpc(e.to_string()))?;
        let params = json!([
            STANDARD.encode(wire),
            {"encoding": "base64", "preflightCommitment": COMMITMENT},
        ]);
        let signature: String = self.perform("sendTransaction", params).await?;
        debug!(%signature, "Transaction submitted");
        Signature::from_str(&signature).map_err(|e| ChainError::Rpc(format!("sendTransaction: {}", e)))
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<Result<(), ProgramError>>, ChainError> {
        let response: WithContext<Vec<Option<RpcSignatureStatus>>> = self
            .perform(
                "getSignatureStatuses",
                json!([[signature.to_string()], {"searchTransactionHistory": true}]),
            )
            .await?;
        Ok(response.value.into_iter().next().flatten().and_then(RpcSignatureStatus::outcome))
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, ChainError> {
        let response: WithContext<u64> = self
            .perform("getBalance", json!([address.to_string(), {"commitment": COMMITMENT}]))
            .await?;
        Ok(response.value)
    }

    async fn minimum_balance_for_rent_exemption(&self, data_len: usize) -> Result<u64, ChainError> {
        self.perform("getMinimumBalanceForRentExemption", json!([data_len]))
            .await
    }

    async fn get_realm(&self, address: &Pubkey) -> Result<Option<Realm>, ChainError> {
        self.governance_account(address, decode_realm).await
    }

    async fn get_governance(&self, address: &Pubkey) -> Result<Option<Governance>, ChainError> {
        self.governance_account(address, decode_governance).await
    }

    async fn get_token_owner_record(
        &self,
        address: &Pubkey,
    ) -> Result<Option<TokenOwnerRecord>, ChainError> {
        self.governance_account(address, decode_token_owner_record).await
    }

    async fn get_governance_proposal(
        &self,
        address: &Pubkey,
    ) -> Result<Option<GovernanceProposal>, ChainError> {
        self.governance_account(address, decode_proposal).await
    }

    async fn get_proposal_transaction(
        &self,
        address: &Pubkey,
    ) -> Result<Option<ProposalTransaction>, ChainError> {
        self.governance_account(address, decode_proposal_transaction).await
    }

    async fn get_program_config(&self) -> Result<Option<ProgramConfig>, ChainError> {
        self.multisig_account(&pda::program_config(), decode_program_config)
            .await
    }

    async fn get_multisig(&self, address: &Pubkey) -> Result<Option<Multisig>, ChainError> {
        self.multisig_account(address, decode_multisig).await
    }

    async fn get_multisig_proposal(
        &self,
        address: &Pubkey,
    ) -> Result<Option<MultisigProposal>, ChainError> {
        self.multisig_account(address, decode_multisig_proposal).await
    }

    async fn get_vault_transaction(
        &self,
        address: &Pubkey,
    ) -> Result<Option<VaultTransaction>, ChainError> {
        self.multisig_account(address, decode_vault_transaction).await
    }

    async fn get_mint(&self, address: &Pubkey) -> Result<Option<TokenMint>, ChainError> {
        match self.token_account_data(address).await? {
            Some(data) => decode_mint(address, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn get_token_account(&self, address: &Pubkey) -> Result<Option<TokenAccount>, ChainError> {
        match self.token_account_data(address).await? {
            Some(data) => decode_token_account(address, &data).map(Some),
            None => Ok(None),
        }
    }
}

// =============================================================================
// JSON-RPC ENVELOPE
// =============================================================================

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl<T> RpcResponse<T> {
    fn into_result(self, method: &str) -> Result<T, ChainError> {
        if let Some(error) = self.error {
            // A failed preflight carries the program error in the error data
            if let Some(err) = error.data.as_ref().and_then(|d| d.get("err")).filter(|e| !e.is_null()) {
                return Err(ChainError::Program(program_error(err)));
            }
            return Err(ChainError::Rpc(format!("{}: {} ({})", method, error.message, error.code)));
        }
        self.result
            .ok_or_else(|| ChainError::Rpc(format!("{}: response has neither result nor error", method)))
    }
}

#[derive(Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Deserialize)]
struct RpcBlockhash {
    blockhash: String,
}

#[derive(Deserialize)]
struct RpcAccount {
    /// `[data, encoding]`
    data: (String, String),
    owner: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcSignatureStatus {
    confirmation_status: Option<String>,
    err: Option<Value>,
}

impl RpcSignatureStatus {
    /// `None` until the transaction reached the confirmed commitment
    fn outcome(self) -> Option<Result<(), ProgramError>> {
        match self.confirmation_status.as_deref() {
            Some("confirmed") | Some("finalized") => Some(match self.err {
                None | Some(Value::Null) => Ok(()),
                Some(err) => Err(program_error(&err)),
            }),
            _ => None,
        }
    }
}

/// Map a serialized transaction error to the program error it stands for
fn program_error(err: &Value) -> ProgramError {
    let custom = err
        .get("InstructionError")
        .and_then(|e| e.get(1))
        .and_then(|e| e.get("Custom"))
        .and_then(Value::as_u64)
        .and_then(|code| u32::try_from(code).ok());

    let Some(code) = custom else {
        return ProgramError::Rejected(err.to_string());
    };
    match code {
        governance_error::VOTE_ALREADY_EXISTS => ProgramError::AlreadyVoted,
        governance_error::NOT_ENOUGH_TOKENS => ProgramError::InsufficientGoverningTokens,
        c if governance_error::INVALID_STATE.contains(&c) => {
            ProgramError::InvalidState(format!("governance error {}", c))
        }
        multisig_error::UNAUTHORIZED => ProgramError::Unauthorized,
        multisig_error::NOT_A_MEMBER => ProgramError::NotAMember,
        multisig_error::STALE_PROPOSAL => ProgramError::InvalidState("proposal is stale".to_string()),
        multisig_error::INVALID_PROPOSAL_STATUS => {
            ProgramError::InvalidState("invalid proposal status".to_string())
        }
        multisig_error::ALREADY_APPROVED => ProgramError::AlreadyApproved,
        other => ProgramError::Custom(other),
    }
}

// =============================================================================
// GOVERNANCE ACCOUNT LAYOUTS
// =============================================================================

#[derive(BorshSerialize, BorshDeserialize)]
struct RealmConfigLayout {
    legacy1: u8,
    legacy2: u8,
    reserved: [u8; 6],
    min_community_weight_to_create_governance: u64,
    community_mint_max_voter_weight_source: MintMaxVoterWeightSource,
    council_mint: Option<Pubkey>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct RealmLayout {
    account_type: u8,
    community_mint: Pubkey,
    config: RealmConfigLayout,
    reserved: [u8; 6],
    legacy1: u16,
    authority: Option<Pubkey>,
    name: String,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct GovernanceLayout {
    account_type: u8,
    realm: Pubkey,
    governance_seed: Pubkey,
    reserved1: u32,
    config: GovernanceConfig,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct TokenOwnerRecordLayout {
    account_type: u8,
    realm: Pubkey,
    governing_token_mint: Pubkey,
    governing_token_owner: Pubkey,
    governing_token_deposit_amount: u64,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ProposalOptionLayout {
    label: String,
    vote_weight: u64,
    vote_result: u8,
    transactions_executed_count: u16,
    transactions_count: u16,
    transactions_next_index: u16,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ProposalLayout {
    account_type: u8,
    governance: Pubkey,
    governing_token_mint: Pubkey,
    state: u8,
    token_owner_record: Pubkey,
    signatories_count: u8,
    signatories_signed_off_count: u8,
    vote_type: VoteType,
    options: Vec<ProposalOptionLayout>,
    deny_vote_weight: Option<u64>,
    reserved1: u8,
    abstain_vote_weight: Option<u64>,
    start_voting_at: Option<i64>,
    draft_at: i64,
    signing_off_at: Option<i64>,
    voting_at: Option<i64>,
    voting_at_slot: Option<u64>,
    voting_completed_at: Option<i64>,
    executing_at: Option<i64>,
    closed_at: Option<i64>,
    execution_flags: u8,
    max_vote_weight: Option<u64>,
    max_voting_time: Option<u32>,
    vote_threshold: Option<VoteThreshold>,
    reserved: [u8; 64],
    name: String,
    description_link: String,
    veto_vote_weight: u64,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ProposalTransactionLayout {
    account_type: u8,
    proposal: Pubkey,
    option_index: u8,
    transaction_index: u16,
    hold_up_time: u32,
    instructions: Vec<InstructionData>,
    executed_at: Option<i64>,
    execution_status: u8,
}

/// Deserialize a layout prefix; accounts may carry trailing padding
fn layout<T: BorshDeserialize>(address: &Pubkey, data: &[u8]) -> Result<T, ChainError> {
    T::deserialize(&mut &data[..]).map_err(|e| ChainError::invalid_account(address, e.to_string()))
}

fn governance_layout<T: BorshDeserialize>(address: &Pubkey, data: &[u8], expected: u8) -> Result<T, ChainError> {
    match data.first() {
        Some(tag) if *tag == expected => layout(address, data),
        Some(tag) => Err(ChainError::invalid_account(
            address,
            format!("account type {} where {} was expected", tag, expected),
        )),
        None => Err(ChainError::invalid_account(address, "empty account")),
    }
}

fn decode_realm(address: &Pubkey, data: &[u8]) -> Result<Realm, ChainError> {
    let raw: RealmLayout = governance_layout(address, data, account_type::REALM_V2)?;
    Ok(Realm {
        name: raw.name,
        community_mint: raw.community_mint,
        council_mint: raw.config.council_mint,
        authority: raw.authority,
    })
}

fn decode_governance(address: &Pubkey, data: &[u8]) -> Result<Governance, ChainError> {
    let raw: GovernanceLayout = governance_layout(address, data, account_type::GOVERNANCE_V2)?;
    Ok(Governance {
        realm: raw.realm,
        council_yes_threshold_pct: raw.config.council_yes_threshold_pct(),
    })
}

fn decode_token_owner_record(address: &Pubkey, data: &[u8]) -> Result<TokenOwnerRecord, ChainError> {
    let raw: TokenOwnerRecordLayout = governance_layout(address, data, account_type::TOKEN_OWNER_RECORD_V2)?;
    Ok(TokenOwnerRecord {
        realm: raw.realm,
        governing_token_mint: raw.governing_token_mint,
        governing_token_owner: raw.governing_token_owner,
        deposit_amount: raw.governing_token_deposit_amount,
    })
}

fn decode_proposal(address: &Pubkey, data: &[u8]) -> Result<GovernanceProposal, ChainError> {
    let raw: ProposalLayout = governance_layout(address, data, account_type::PROPOSAL_V2)?;
    let state = ProposalState::from_tag(raw.state)
        .ok_or_else(|| ChainError::invalid_account(address, format!("unknown proposal state {}", raw.state)))?;
    Ok(GovernanceProposal {
        governance: raw.governance,
        governing_token_mint: raw.governing_token_mint,
        token_owner_record: raw.token_owner_record,
        name: raw.name,
        description: raw.description_link,
        state,
        yes_votes: raw.options.first().map_or(0, |o| o.vote_weight),
        no_votes: raw.deny_vote_weight.unwrap_or(0),
    })
}

fn decode_proposal_transaction(address: &Pubkey, data: &[u8]) -> Result<ProposalTransaction, ChainError> {
    let raw: ProposalTransactionLayout = governance_layout(address, data, account_type::PROPOSAL_TRANSACTION_V2)?;
    Ok(ProposalTransaction {
        proposal: raw.proposal,
        option_index: raw.option_index,
        index: raw.transaction_index,
        instructions: raw.instructions.into_iter().map(Instruction::from).collect(),
        executed: raw.executed_at.is_some(),
    })
}

// =============================================================================
// MULTISIG ACCOUNT LAYOUTS
// =============================================================================

#[derive(BorshSerialize, BorshDeserialize)]
struct ProgramConfigLayout {
    authority: Pubkey,
    multisig_creation_fee: u64,
    treasury: Pubkey,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct MemberLayout {
    key: Pubkey,
    permissions: u8,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct MultisigLayout {
    create_key: Pubkey,
    config_authority: Pubkey,
    threshold: u16,
    time_lock: u32,
    transaction_index: u64,
    stale_transaction_index: u64,
    rent_collector: Option<Pubkey>,
    bump: u8,
    members: Vec<MemberLayout>,
}

#[derive(BorshSerialize, BorshDeserialize)]
enum ProposalStatusLayout {
    Draft { timestamp: i64 },
    Active { timestamp: i64 },
    Rejected { timestamp: i64 },
    Approved { timestamp: i64 },
    Executing,
    Executed { timestamp: i64 },
    Cancelled { timestamp: i64 },
}

impl From<ProposalStatusLayout> for MultisigProposalStatus {
    fn from(status: ProposalStatusLayout) -> Self {
        match status {
            ProposalStatusLayout::Draft { .. } => MultisigProposalStatus::Draft,
            ProposalStatusLayout::Active { .. } => MultisigProposalStatus::Active,
            ProposalStatusLayout::Rejected { .. } => MultisigProposalStatus::Rejected,
            ProposalStatusLayout::Approved { .. } => MultisigProposalStatus::Approved,
            ProposalStatusLayout::Executing => MultisigProposalStatus::Executing,
            ProposalStatusLayout::Executed { .. } => MultisigProposalStatus::Executed,
            ProposalStatusLayout::Cancelled { .. } => MultisigProposalStatus::Cancelled,
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct MultisigProposalLayout {
    multisig: Pubkey,
    transaction_index: u64,
    status: ProposalStatusLayout,
    bump: u8,
    approved: Vec<Pubkey>,
    rejected: Vec<Pubkey>,
    cancelled: Vec<Pubkey>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct CompiledInstructionLayout {
    program_id_index: u8,
    account_indexes: Vec<u8>,
    data: Vec<u8>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct AddressTableLookupLayout {
    account_key: Pubkey,
    writable_indexes: Vec<u8>,
    readonly_indexes: Vec<u8>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct VaultMessageLayout {
    num_signers: u8,
    num_writable_signers: u8,
    num_writable_non_signers: u8,
    account_keys: Vec<Pubkey>,
    instructions: Vec<CompiledInstructionLayout>,
    address_table_lookups: Vec<AddressTableLookupLayout>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct VaultTransactionLayout {
    multisig: Pubkey,
    creator: Pubkey,
    index: u64,
    bump: u8,
    vault_index: u8,
    vault_bump: u8,
    ephemeral_signer_bumps: Vec<u8>,
    message: VaultMessageLayout,
}

/// Check the 8-byte account discriminator, then decode the rest
fn multisig_layout<T: BorshDeserialize>(address: &Pubkey, data: &[u8], name: &str) -> Result<T, ChainError> {
    let expected = discriminator("account", name);
    if data.len() < expected.len() || data[..expected.len()] != expected {
        return Err(ChainError::invalid_account(address, format!("not a {} account", name)));
    }
    layout(address, &data[expected.len()..])
}

fn decode_program_config(address: &Pubkey, data: &[u8]) -> Result<ProgramConfig, ChainError> {
    let raw: ProgramConfigLayout = multisig_layout(address, data, "ProgramConfig")?;
    Ok(ProgramConfig { treasury: raw.treasury })
}

fn decode_multisig(address: &Pubkey, data: &[u8]) -> Result<Multisig, ChainError> {
    let raw: MultisigLayout = multisig_layout(address, data, "Multisig")?;
    Ok(Multisig {
        create_key: raw.create_key,
        threshold: raw.threshold,
        members: raw.members.into_iter().map(|m| m.key).collect(),
        transaction_index: raw.transaction_index,
        stale_transaction_index: raw.stale_transaction_index,
        memo: None,
    })
}

fn decode_multisig_proposal(address: &Pubkey, data: &[u8]) -> Result<MultisigProposal, ChainError> {
    let raw: MultisigProposalLayout = multisig_layout(address, data, "Proposal")?;
    Ok(MultisigProposal {
        multisig: raw.multisig,
        transaction_index: raw.transaction_index,
        status: raw.status.into(),
        approved: raw.approved,
        rejected: raw.rejected,
    })
}

fn decode_vault_transaction(address: &Pubkey, data: &[u8]) -> Result<VaultTransaction, ChainError> {
    let raw: VaultTransactionLayout = multisig_layout(address, data, "VaultTransaction")?;
    if !raw.message.address_table_lookups.is_empty() {
        return Err(ChainError::invalid_account(address, "address lookup tables are not supported"));
    }
    Ok(VaultTransaction {
        multisig: raw.multisig,
        index: raw.index,
        creator: raw.creator,
        vault_index: raw.vault_index,
        message: VaultTransactionMessage {
            num_signers: raw.message.num_signers,
            num_writable_signers: raw.message.num_writable_signers,
            num_writable_non_signers: raw.message.num_writable_non_signers,
            account_keys: raw.message.account_keys,
            instructions: raw
                .message
                .instructions
                .into_iter()
                .map(|ix| CompiledVaultInstruction {
                    program_id_index: ix.program_id_index,
                    account_indexes: ix.account_indexes,
                    data: ix.data,
                })
                .collect(),
        },
        memo: None,
    })
}

// =============================================================================
// TOKEN ACCOUNT LAYOUTS
// =============================================================================

fn read_pubkey(data: &[u8], offset: usize) -> Option<Pubkey> {
    let bytes: [u8; 32] = data.get(offset..offset + 32)?.try_into().ok()?;
    Some(Pubkey::new_from_array(bytes))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

fn decode_mint(address: &Pubkey, data: &[u8]) -> Result<TokenMint, ChainError> {
    let short = || ChainError::invalid_account(address, "not a token mint");
    if data.len() < MINT_LEN {
        return Err(short());
    }
    let has_authority = data[..4] != [0, 0, 0, 0];
    Ok(TokenMint {
        mint_authority: if has_authority { read_pubkey(data, 4) } else { None },
        supply: read_u64(data, 36).ok_or_else(short)?,
        decimals: data[44],
    })
}

fn decode_token_account(address: &Pubkey, data: &[u8]) -> Result<TokenAccount, ChainError> {
    let short = || ChainError::invalid_account(address, "not a token account");
    if data.len() < TOKEN_ACCOUNT_LEN {
        return Err(short());
    }
    Ok(TokenAccount {
        mint: read_pubkey(data, 0).ok_or_else(short)?,
        owner: read_pubkey(data, 32).ok_or_else(short)?,
        amount: read_u64(data, 64).ok_or_else(short)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::instruction::VoteTipping;
    use pretty_assertions::assert_eq;

    fn bytes<T: BorshSerialize>(value: &T) -> Vec<u8> {
        borsh::to_vec(value).unwrap()
    }

    fn with_discriminator<T: BorshSerialize>(name: &str, value: &T) -> Vec<u8> {
        let mut data = discriminator("account", name).to_vec();
        data.extend(bytes(value));
        data
    }

    fn council_config(pct: u8) -> GovernanceConfig {
        GovernanceConfig {
            community_vote_threshold: VoteThreshold::Disabled,
            min_community_weight_to_create_proposal: u64::MAX,
            min_transaction_hold_up_time: 0,
            voting_base_time: 86_400,
            community_vote_tipping: VoteTipping::Disabled,
            council_vote_threshold: VoteThreshold::YesVotePercentage(pct),
            council_veto_vote_threshold: VoteThreshold::Disabled,
            min_council_weight_to_create_proposal: 1,
            council_vote_tipping: VoteTipping::Early,
            community_veto_vote_threshold: VoteThreshold::Disabled,
            voting_cool_off_time: 0,
            deposit_exempt_proposal_count: 254,
        }
    }

    fn proposal_layout(state: u8, yes: u64, deny: Option<u64>) -> ProposalLayout {
        ProposalLayout {
            account_type: account_type::PROPOSAL_V2,
            governance: Pubkey::new_unique(),
            governing_token_mint: Pubkey::new_unique(),
            state,
            token_owner_record: Pubkey::new_unique(),
            signatories_count: 1,
            signatories_signed_off_count: 1,
            vote_type: VoteType::SingleChoice,
            options: vec![ProposalOptionLayout {
                label: "Approve".to_string(),
                vote_weight: yes,
                vote_result: 0,
                transactions_executed_count: 0,
                transactions_count: 1,
                transactions_next_index: 1,
            }],
            deny_vote_weight: deny,
            reserved1: 0,
            abstain_vote_weight: None,
            start_voting_at: None,
            draft_at: 1_700_000_000,
            signing_off_at: None,
            voting_at: Some(1_700_000_100),
            voting_at_slot: Some(42),
            voting_completed_at: None,
            executing_at: None,
            closed_at: None,
            execution_flags: 0,
            max_vote_weight: None,
            max_voting_time: None,
            vote_threshold: None,
            reserved: [0; 64],
            name: "Pay".to_string(),
            description_link: "Pay Bob".to_string(),
            veto_vote_weight: 0,
        }
    }

    #[test]
    fn test_decode_realm_with_trailing_padding() {
        let council = Pubkey::new_unique();
        let authority = Pubkey::new_unique();
        let raw = RealmLayout {
            account_type: account_type::REALM_V2,
            community_mint: Pubkey::new_unique(),
            config: RealmConfigLayout {
                legacy1: 0,
                legacy2: 0,
                reserved: [0; 6],
                min_community_weight_to_create_governance: u64::MAX,
                community_mint_max_voter_weight_source: MintMaxVoterWeightSource::SupplyFraction(10_000_000_000),
                council_mint: Some(council),
            },
            reserved: [0; 6],
            legacy1: 0,
            authority: Some(authority),
            name: "Grants".to_string(),
        };
        let mut data = bytes(&raw);
        data.extend([0u8; 128]);

        let realm = decode_realm(&Pubkey::new_unique(), &data).unwrap();
        assert_eq!(realm.name, "Grants");
        assert_eq!(realm.council_mint, Some(council));
        assert_eq!(realm.authority, Some(authority));
    }

    #[test]
    fn test_decode_governance_threshold() {
        let realm = Pubkey::new_unique();
        let raw = GovernanceLayout {
            account_type: account_type::GOVERNANCE_V2,
            realm,
            governance_seed: realm,
            reserved1: 0,
            config: council_config(66),
        };
        let governance = decode_governance(&Pubkey::new_unique(), &bytes(&raw)).unwrap();
        assert_eq!(governance, Governance { realm, council_yes_threshold_pct: 66 });
    }

    #[test]
    fn test_wrong_account_type_is_rejected() {
        let raw = TokenOwnerRecordLayout {
            account_type: account_type::TOKEN_OWNER_RECORD_V2,
            realm: Pubkey::new_unique(),
            governing_token_mint: Pubkey::new_unique(),
            governing_token_owner: Pubkey::new_unique(),
            governing_token_deposit_amount: 3,
        };
        let data = bytes(&raw);
        assert_eq!(decode_token_owner_record(&Pubkey::new_unique(), &data).unwrap().deposit_amount, 3);
        assert!(matches!(
            decode_realm(&Pubkey::new_unique(), &data),
            Err(ChainError::InvalidAccountData { .. })
        ));
        assert!(decode_realm(&Pubkey::new_unique(), &[]).is_err());
    }

    #[test]
    fn test_decode_proposal_votes_and_state() {
        let raw = proposal_layout(7, 1, Some(2));
        let proposal = decode_proposal(&Pubkey::new_unique(), &bytes(&raw)).unwrap();
        assert_eq!(proposal.state, ProposalState::Defeated);
        assert_eq!((proposal.yes_votes, proposal.no_votes), (1, 2));
        assert_eq!(proposal.description, "Pay Bob");
        assert_eq!(proposal.token_owner_record, raw.token_owner_record);

        let unknown = proposal_layout(99, 0, None);
        assert!(decode_proposal(&Pubkey::new_unique(), &bytes(&unknown)).is_err());
    }

    #[test]
    fn test_decode_proposal_transaction() {
        let ix = solana_system_interface::instruction::transfer(&Pubkey::new_unique(), &Pubkey::new_unique(), 5);
        let raw = ProposalTransactionLayout {
            account_type: account_type::PROPOSAL_TRANSACTION_V2,
            proposal: Pubkey::new_unique(),
            option_index: 0,
            transaction_index: 0,
            hold_up_time: 0,
            instructions: vec![InstructionData::from(&ix)],
            executed_at: Some(1_700_000_500),
            execution_status: 1,
        };
        let stored = decode_proposal_transaction(&Pubkey::new_unique(), &bytes(&raw)).unwrap();
        assert_eq!(stored.instructions, vec![ix]);
        assert!(stored.executed);
    }

    #[test]
    fn test_decode_multisig_and_proposal() {
        let members = [Pubkey::new_unique(), Pubkey::new_unique()];
        let raw = MultisigLayout {
            create_key: Pubkey::new_unique(),
            config_authority: Pubkey::default(),
            threshold: 2,
            time_lock: 0,
            transaction_index: 4,
            stale_transaction_index: 1,
            rent_collector: None,
            bump: 255,
            members: members.iter().map(|key| MemberLayout { key: *key, permissions: 7 }).collect(),
        };
        let multisig = decode_multisig(&Pubkey::new_unique(), &with_discriminator("Multisig", &raw)).unwrap();
        assert_eq!(multisig.members, members.to_vec());
        assert_eq!((multisig.threshold, multisig.transaction_index), (2, 4));

        let proposal = MultisigProposalLayout {
            multisig: Pubkey::new_unique(),
            transaction_index: 4,
            status: ProposalStatusLayout::Approved { timestamp: 1 },
            bump: 254,
            approved: members.to_vec(),
            rejected: vec![],
            cancelled: vec![],
        };
        let decoded =
            decode_multisig_proposal(&Pubkey::new_unique(), &with_discriminator("Proposal", &proposal)).unwrap();
        assert_eq!(decoded.status, MultisigProposalStatus::Approved);
        assert_eq!(decoded.approved.len(), 2);

        // A proposal is not a multisig
        assert!(decode_multisig(&Pubkey::new_unique(), &with_discriminator("Proposal", &proposal)).is_err());
    }

    #[test]
    fn test_decode_vault_transaction() {
        let vault = Pubkey::new_unique();
        let recipient = Pubkey::new_unique();
        let compiled = VaultTransactionMessage::compile(
            &vault,
            &[solana_system_interface::instruction::transfer(&vault, &recipient, 9)],
        )
        .unwrap();
        let raw = VaultTransactionLayout {
            multisig: Pubkey::new_unique(),
            creator: Pubkey::new_unique(),
            index: 3,
            bump: 250,
            vault_index: 0,
            vault_bump: 251,
            ephemeral_signer_bumps: vec![],
            message: VaultMessageLayout {
                num_signers: compiled.num_signers,
                num_writable_signers: compiled.num_writable_signers,
                num_writable_non_signers: compiled.num_writable_non_signers,
                account_keys: compiled.account_keys.clone(),
                instructions: compiled
                    .instructions
                    .iter()
                    .map(|ix| CompiledInstructionLayout {
                        program_id_index: ix.program_id_index,
                        account_indexes: ix.account_indexes.clone(),
                        data: ix.data.clone(),
                    })
                    .collect(),
                address_table_lookups: vec![],
            },
        };

        let decoded =
            decode_vault_transaction(&Pubkey::new_unique(), &with_discriminator("VaultTransaction", &raw)).unwrap();
        assert_eq!(decoded.index, 3);
        assert_eq!(decoded.message, compiled);
    }

    #[test]
    fn test_decode_token_accounts() {
        let authority = Pubkey::new_unique();
        let mut mint = vec![0u8; MINT_LEN];
        mint[..4].copy_from_slice(&1u32.to_le_bytes());
        mint[4..36].copy_from_slice(authority.as_ref());
        mint[36..44].copy_from_slice(&5_000u64.to_le_bytes());
        mint[44] = 6;
        let decoded = decode_mint(&Pubkey::new_unique(), &mint).unwrap();
        assert_eq!(
            decoded,
            TokenMint {
                mint_authority: Some(authority),
                supply: 5_000,
                decimals: 6
            }
        );

        let (owner, token_mint) = (Pubkey::new_unique(), Pubkey::new_unique());
        let mut account = vec![0u8; TOKEN_ACCOUNT_LEN];
        account[..32].copy_from_slice(token_mint.as_ref());
        account[32..64].copy_from_slice(owner.as_ref());
        account[64..72].copy_from_slice(&77u64.to_le_bytes());
        let decoded = decode_token_account(&Pubkey::new_unique(), &account).unwrap();
        assert_eq!((decoded.mint, decoded.owner, decoded.amount), (token_mint, owner, 77));

        assert!(decode_token_account(&Pubkey::new_unique(), &mint).is_err());
    }

    #[test]
    fn test_program_error_mapping() {
        let custom = |code: u32| json!({"InstructionError": [0, {"Custom": code}]});
        assert_eq!(program_error(&custom(519)), ProgramError::AlreadyVoted);
        assert_eq!(program_error(&custom(520)), ProgramError::InsufficientGoverningTokens);
        assert!(matches!(program_error(&custom(524)), ProgramError::InvalidState(_)));
        assert_eq!(program_error(&custom(6005)), ProgramError::NotAMember);
        assert_eq!(program_error(&custom(6010)), ProgramError::AlreadyApproved);
        assert_eq!(program_error(&custom(1)), ProgramError::Custom(1));
        assert!(matches!(
            program_error(&json!({"InstructionError": [1, "MissingRequiredSignature"]})),
            ProgramError::Rejected(_)
        ));
    }

    #[test]
    fn test_signature_status_outcome() {
        let status = |confirmation: &str, err: Value| -> RpcSignatureStatus {
            serde_json::from_value(json!({"confirmationStatus": confirmation, "err": err, "slot": 10})).unwrap()
        };
        assert_eq!(status("processed", Value::Null).outcome(), None);
        assert_eq!(status("confirmed", Value::Null).outcome(), Some(Ok(())));
        assert_eq!(
            status("finalized", json!({"InstructionError": [0, {"Custom": 6004}]})).outcome(),
            Some(Err(ProgramError::Unauthorized))
        );
    }

    #[test]
    fn test_preflight_failure_becomes_program_error() {
        let body: RpcResponse<String> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {
                "code": -32002,
                "message": "Transaction simulation failed",
                "data": {"err": {"InstructionError": [0, {"Custom": 519}]}, "logs": []}
            }
        }))
        .unwrap();
        let err = body.into_result("sendTransaction").unwrap_err();
        assert_eq!(err.program_error(), Some(&ProgramError::AlreadyVoted));

        let body: RpcResponse<String> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32005, "message": "Node is behind", "data": {"numSlotsBehind": 40}}
        }))
        .unwrap();
        assert!(matches!(body.into_result("sendTransaction"), Err(ChainError::Rpc(_))));
    }
}
