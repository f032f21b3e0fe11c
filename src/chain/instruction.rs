//! Instruction surface of the external programs and transaction assembly
//!
//! Each program's instructions have a typed form that converts into a wire
//! [`Instruction`] and decodes back from one. Governance data is a one-byte
//! tag followed by borsh arguments; multisig data is an 8-byte method
//! discriminator followed by borsh arguments.

use crate::chain::accounts::{Vote, VaultTransactionMessage};
use crate::chain::error::{ChainError, ProgramError};
use crate::chain::pda;
use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use solana_hash::Hash;
use solana_instruction::{AccountMeta, Instruction};
use solana_keypair::Keypair;
use solana_message::Message;
use solana_pubkey::Pubkey;
use solana_sdk_ids::{system_program, sysvar};
use solana_signer::Signer;
use solana_transaction::Transaction;

/// Voter weight threshold that can never be reached
const DISABLED_VOTER_WEIGHT: u64 = u64::MAX;
/// Full supply in the program's fixed-point fraction format
const FULL_SUPPLY_FRACTION: u64 = 10_000_000_000;
const VOTING_BASE_TIME_SECS: u32 = 86_400;
const DEPOSIT_EXEMPT_PROPOSAL_COUNT: u8 = 254;
const SINGLE_OPTION_LABEL: &str = "Approve";
/// Initiate, vote and execute
const ALL_PERMISSIONS: u8 = 0b111;

// =============================================================================
// GOVERNANCE PROGRAM
// =============================================================================

mod tag {
    pub const CREATE_REALM: u8 = 0;
    pub const DEPOSIT_GOVERNING_TOKENS: u8 = 1;
    pub const CREATE_GOVERNANCE: u8 = 4;
    pub const CREATE_PROPOSAL: u8 = 6;
    pub const INSERT_TRANSACTION: u8 = 9;
    pub const SIGN_OFF_PROPOSAL: u8 = 12;
    pub const CAST_VOTE: u8 = 13;
    pub const EXECUTE_TRANSACTION: u8 = 16;
    pub const CREATE_TOKEN_OWNER_RECORD: u8 = 23;
    pub const CREATE_NATIVE_TREASURY: u8 = 25;
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) enum MintMaxVoterWeightSource {
    SupplyFraction(u64),
    Absolute(u64),
}

#[derive(BorshSerialize, BorshDeserialize)]
enum GoverningTokenType {
    Liquid,
    Membership,
    Dormant,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct GoverningTokenConfigArgs {
    use_voter_weight_addin: bool,
    use_max_voter_weight_addin: bool,
    token_type: GoverningTokenType,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct RealmConfigArgs {
    use_council_mint: bool,
    min_community_weight_to_create_governance: u64,
    community_mint_max_voter_weight_source: MintMaxVoterWeightSource,
    community_token_config_args: GoverningTokenConfigArgs,
    council_token_config_args: GoverningTokenConfigArgs,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct CreateRealmArgs {
    name: String,
    config_args: RealmConfigArgs,
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) enum VoteThreshold {
    YesVotePercentage(u8),
    QuorumPercentage(u8),
    Disabled,
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) enum VoteTipping {
    Strict,
    Early,
    Disabled,
}

/// Governance rules, shared by the create instruction and the account layout
#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) struct GovernanceConfig {
    pub community_vote_threshold: VoteThreshold,
    pub min_community_weight_to_create_proposal: u64,
    pub min_transaction_hold_up_time: u32,
    pub voting_base_time: u32,
    pub community_vote_tipping: VoteTipping,
    pub council_vote_threshold: VoteThreshold,
    pub council_veto_vote_threshold: VoteThreshold,
    pub min_council_weight_to_create_proposal: u64,
    pub council_vote_tipping: VoteTipping,
    pub community_veto_vote_threshold: VoteThreshold,
    pub voting_cool_off_time: u32,
    pub deposit_exempt_proposal_count: u8,
}

impl GovernanceConfig {
    /// Council-only voting that tips as soon as the outcome is certain
    fn council(yes_threshold_pct: u8) -> Self {
        Self {
            community_vote_threshold: VoteThreshold::Disabled,
            min_community_weight_to_create_proposal: DISABLED_VOTER_WEIGHT,
            min_transaction_hold_up_time: 0,
            voting_base_time: VOTING_BASE_TIME_SECS,
            community_vote_tipping: VoteTipping::Disabled,
            council_vote_threshold: VoteThreshold::YesVotePercentage(yes_threshold_pct),
            council_veto_vote_threshold: VoteThreshold::Disabled,
            min_council_weight_to_create_proposal: 1,
            council_vote_tipping: VoteTipping::Early,
            community_veto_vote_threshold: VoteThreshold::Disabled,
            voting_cool_off_time: 0,
            deposit_exempt_proposal_count: DEPOSIT_EXEMPT_PROPOSAL_COUNT,
        }
    }

    pub(crate) fn council_yes_threshold_pct(&self) -> u8 {
        match self.council_vote_threshold {
            VoteThreshold::YesVotePercentage(pct) => pct,
            _ => 0,
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) enum VoteType {
    SingleChoice,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct CreateProposalArgs {
    name: String,
    description_link: String,
    vote_type: VoteType,
    options: Vec<String>,
    use_deny_option: bool,
    proposal_seed: Pubkey,
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) struct AccountMetaData {
    pub pubkey: Pubkey,
    pub is_signer: bool,
    pub is_writable: bool,
}

/// Instruction as stored inside a proposal transaction
#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) struct InstructionData {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMetaData>,
    pub data: Vec<u8>,
}

impl From<&Instruction> for InstructionData {
    fn from(ix: &Instruction) -> Self {
        Self {
            program_id: ix.program_id,
            accounts: ix
                .accounts
                .iter()
                .map(|m| AccountMetaData {
                    pubkey: m.pubkey,
                    is_signer: m.is_signer,
                    is_writable: m.is_writable,
                })
                .collect(),
            data: ix.data.clone(),
        }
    }
}

impl From<InstructionData> for Instruction {
    fn from(ix: InstructionData) -> Self {
        Instruction {
            program_id: ix.program_id,
            accounts: ix
                .accounts
                .into_iter()
                .map(|m| AccountMeta {
                    pubkey: m.pubkey,
                    is_signer: m.is_signer,
                    is_writable: m.is_writable,
                })
                .collect(),
            data: ix.data,
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct InsertTransactionArgs {
    option_index: u8,
    index: u16,
    hold_up_time: u32,
    instructions: Vec<InstructionData>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct VoteChoice {
    rank: u8,
    weight_percentage: u8,
}

#[derive(BorshSerialize, BorshDeserialize)]
enum CastVoteArgs {
    Approve(Vec<VoteChoice>),
    Deny,
    Abstain,
    Veto,
}

/// Governance program instructions used by this service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernanceInstruction {
    CreateRealm {
        name: String,
        realm_authority: Pubkey,
        community_mint: Pubkey,
        council_mint: Option<Pubkey>,
        payer: Pubkey,
    },
    CreateTokenOwnerRecord {
        realm: Pubkey,
        governing_token_owner: Pubkey,
        governing_token_mint: Pubkey,
        payer: Pubkey,
    },
    /// Membership deposits mint straight from the mint: `source` is the
    /// mint itself and `source_authority` its mint authority.
    DepositGoverningTokens {
        realm: Pubkey,
        governing_token_mint: Pubkey,
        source: Pubkey,
        governing_token_owner: Pubkey,
        source_authority: Pubkey,
        payer: Pubkey,
        amount: u64,
    },
    CreateGovernance {
        realm: Pubkey,
        token_owner_record: Pubkey,
        create_authority: Pubkey,
        payer: Pubkey,
        council_yes_threshold_pct: u8,
    },
    CreateNativeTreasury {
        governance: Pubkey,
        payer: Pubkey,
    },
    CreateProposal {
        realm: Pubkey,
        governance: Pubkey,
        token_owner_record: Pubkey,
        governing_token_mint: Pubkey,
        governance_authority: Pubkey,
        payer: Pubkey,
        name: String,
        description: String,
        seed: Pubkey,
    },
    InsertTransaction {
        governance: Pubkey,
        proposal: Pubkey,
        token_owner_record: Pubkey,
        governance_authority: Pubkey,
        payer: Pubkey,
        option_index: u8,
        index: u16,
        instructions: Vec<Instruction>,
    },
    SignOffProposal {
        realm: Pubkey,
        governance: Pubkey,
        proposal: Pubkey,
        signatory: Pubkey,
        token_owner_record: Pubkey,
    },
    CastVote {
        realm: Pubkey,
        governance: Pubkey,
        proposal: Pubkey,
        proposal_owner_record: Pubkey,
        voter_token_owner_record: Pubkey,
        governance_authority: Pubkey,
        governing_token_mint: Pubkey,
        payer: Pubkey,
        vote: Vote,
    },
    /// `accounts` are passed through to the stored instructions
    ExecuteTransaction {
        governance: Pubkey,
        proposal: Pubkey,
        proposal_transaction: Pubkey,
        accounts: Vec<AccountMeta>,
    },
}

fn governance_ix<T: BorshSerialize>(tag: u8, args: &T, accounts: Vec<AccountMeta>) -> Instruction {
    Instruction::new_with_borsh(pda::GOVERNANCE_PROGRAM_ID, &(tag, args), accounts)
}

impl From<GovernanceInstruction> for Instruction {
    fn from(ix: GovernanceInstruction) -> Self {
        use GovernanceInstruction::*;
        match ix {
            CreateRealm {
                name,
                realm_authority,
                community_mint,
                council_mint,
                payer,
            } => {
                let realm = pda::realm(&name);
                let mut accounts = vec![
                    AccountMeta::new(realm, false),
                    AccountMeta::new_readonly(realm_authority, false),
                    AccountMeta::new_readonly(community_mint, false),
                    AccountMeta::new(pda::governing_token_holding(&realm, &community_mint), false),
                    AccountMeta::new(payer, true),
                    AccountMeta::new_readonly(system_program::ID, false),
                    AccountMeta::new_readonly(pda::TOKEN_PROGRAM_ID, false),
                    AccountMeta::new_readonly(sysvar::rent::ID, false),
                ];
                if let Some(council_mint) = council_mint {
                    accounts.push(AccountMeta::new_readonly(council_mint, false));
                    accounts.push(AccountMeta::new(pda::governing_token_holding(&realm, &council_mint), false));
                }
                accounts.push(AccountMeta::new(pda::realm_config(&realm), false));

                let args = CreateRealmArgs {
                    name,
                    config_args: RealmConfigArgs {
                        use_council_mint: council_mint.is_some(),
                        min_community_weight_to_create_governance: DISABLED_VOTER_WEIGHT,
                        community_mint_max_voter_weight_source: MintMaxVoterWeightSource::SupplyFraction(
                            FULL_SUPPLY_FRACTION,
                        ),
                        community_token_config_args: GoverningTokenConfigArgs {
                            use_voter_weight_addin: false,
                            use_max_voter_weight_addin: false,
                            token_type: GoverningTokenType::Dormant,
                        },
                        council_token_config_args: GoverningTokenConfigArgs {
                            use_voter_weight_addin: false,
                            use_max_voter_weight_addin: false,
                            token_type: GoverningTokenType::Membership,
                        },
                    },
                };
                governance_ix(tag::CREATE_REALM, &args, accounts)
            }

            CreateTokenOwnerRecord {
                realm,
                governing_token_owner,
                governing_token_mint,
                payer,
            } => governance_ix(
                tag::CREATE_TOKEN_OWNER_RECORD,
                &(),
                vec![
                    AccountMeta::new_readonly(realm, false),
                    AccountMeta::new_readonly(governing_token_owner, false),
                    AccountMeta::new(
                        pda::token_owner_record(&realm, &governing_token_mint, &governing_token_owner),
                        false,
                    ),
                    AccountMeta::new_readonly(governing_token_mint, false),
                    AccountMeta::new(payer, true),
                    AccountMeta::new_readonly(system_program::ID, false),
                ],
            ),

            DepositGoverningTokens {
                realm,
                governing_token_mint,
                source,
                governing_token_owner,
                source_authority,
                payer,
                amount,
            } => governance_ix(
                tag::DEPOSIT_GOVERNING_TOKENS,
                &amount,
                vec![
                    AccountMeta::new_readonly(realm, false),
                    AccountMeta::new(pda::governing_token_holding(&realm, &governing_token_mint), false),
                    AccountMeta::new(source, false),
                    // Members other than the payer are enrolled without their signature
                    AccountMeta::new_readonly(governing_token_owner, governing_token_owner == payer),
                    AccountMeta::new_readonly(source_authority, true),
                    AccountMeta::new(
                        pda::token_owner_record(&realm, &governing_token_mint, &governing_token_owner),
                        false,
                    ),
                    AccountMeta::new(payer, true),
                    AccountMeta::new_readonly(system_program::ID, false),
                    AccountMeta::new_readonly(pda::TOKEN_PROGRAM_ID, false),
                    AccountMeta::new_readonly(pda::realm_config(&realm), false),
                ],
            ),

            CreateGovernance {
                realm,
                token_owner_record,
                create_authority,
                payer,
                council_yes_threshold_pct,
            } => governance_ix(
                tag::CREATE_GOVERNANCE,
                &GovernanceConfig::council(council_yes_threshold_pct),
                vec![
                    AccountMeta::new_readonly(realm, false),
                    AccountMeta::new(pda::governance(&realm), false),
                    AccountMeta::new_readonly(realm, false),
                    AccountMeta::new_readonly(token_owner_record, false),
                    AccountMeta::new(payer, true),
                    AccountMeta::new_readonly(system_program::ID, false),
                    AccountMeta::new_readonly(create_authority, true),
                    AccountMeta::new_readonly(pda::realm_config(&realm), false),
                ],
            ),

            CreateNativeTreasury { governance, payer } => governance_ix(
                tag::CREATE_NATIVE_TREASURY,
                &(),
                vec![
                    AccountMeta::new_readonly(governance, false),
                    AccountMeta::new(pda::native_treasury(&governance), false),
                    AccountMeta::new(payer, true),
                    AccountMeta::new_readonly(system_program::ID, false),
                ],
            ),

            CreateProposal {
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
                let proposal = pda::proposal(&governance, &governing_token_mint, &seed);
                let args = CreateProposalArgs {
                    name,
                    description_link: description,
                    vote_type: VoteType::SingleChoice,
                    options: vec![SINGLE_OPTION_LABEL.to_string()],
                    use_deny_option: true,
                    proposal_seed: seed,
                };
                governance_ix(
                    tag::CREATE_PROPOSAL,
                    &args,
                    vec![
                        AccountMeta::new_readonly(realm, false),
                        AccountMeta::new(proposal, false),
                        AccountMeta::new(governance, false),
                        AccountMeta::new(token_owner_record, false),
                        AccountMeta::new_readonly(governing_token_mint, false),
                        AccountMeta::new_readonly(governance_authority, true),
                        AccountMeta::new(payer, true),
                        AccountMeta::new_readonly(system_program::ID, false),
                        AccountMeta::new_readonly(pda::realm_config(&realm), false),
                        AccountMeta::new(pda::proposal_deposit(&proposal, &payer), false),
                    ],
                )
            }

            InsertTransaction {
                governance,
                proposal,
                token_owner_record,
                governance_authority,
                payer,
                option_index,
                index,
                instructions,
            } => {
                let args = InsertTransactionArgs {
                    option_index,
                    index,
                    hold_up_time: 0,
                    instructions: instructions.iter().map(InstructionData::from).collect(),
                };
                governance_ix(
                    tag::INSERT_TRANSACTION,
                    &args,
                    vec![
                        AccountMeta::new_readonly(governance, false),
                        AccountMeta::new(proposal, false),
                        AccountMeta::new_readonly(token_owner_record, false),
                        AccountMeta::new_readonly(governance_authority, true),
                        AccountMeta::new(pda::proposal_transaction(&proposal, option_index, index), false),
                        AccountMeta::new(payer, true),
                        AccountMeta::new_readonly(system_program::ID, false),
                        AccountMeta::new_readonly(sysvar::rent::ID, false),
                    ],
                )
            }

            SignOffProposal {
                realm,
                governance,
                proposal,
                signatory,
                token_owner_record,
            } => governance_ix(
                tag::SIGN_OFF_PROPOSAL,
                &(),
                vec![
                    AccountMeta::new(realm, false),
                    AccountMeta::new(governance, false),
                    AccountMeta::new(proposal, false),
                    AccountMeta::new_readonly(signatory, true),
                    AccountMeta::new_readonly(token_owner_record, false),
                ],
            ),

            CastVote {
                realm,
                governance,
                proposal,
                proposal_owner_record,
                voter_token_owner_record,
                governance_authority,
                governing_token_mint,
                payer,
                vote,
            } => {
                let args = match vote {
                    Vote::Approve => CastVoteArgs::Approve(vec![VoteChoice {
                        rank: 0,
                        weight_percentage: 100,
                    }]),
                    Vote::Deny => CastVoteArgs::Deny,
                };
                governance_ix(
                    tag::CAST_VOTE,
                    &args,
                    vec![
                        AccountMeta::new_readonly(realm, false),
                        AccountMeta::new(governance, false),
                        AccountMeta::new(proposal, false),
                        AccountMeta::new(proposal_owner_record, false),
                        AccountMeta::new(voter_token_owner_record, false),
                        AccountMeta::new_readonly(governance_authority, true),
                        AccountMeta::new(pda::vote_record(&proposal, &voter_token_owner_record), false),
                        AccountMeta::new_readonly(governing_token_mint, false),
                        AccountMeta::new(payer, true),
                        AccountMeta::new_readonly(system_program::ID, false),
                        AccountMeta::new_readonly(pda::realm_config(&realm), false),
                    ],
                )
            }

            ExecuteTransaction {
                governance,
                proposal,
                proposal_transaction,
                accounts,
            } => {
                let mut metas = vec![
                    AccountMeta::new_readonly(governance, false),
                    AccountMeta::new(proposal, false),
                    AccountMeta::new(proposal_transaction, false),
                ];
                metas.extend(accounts);
                governance_ix(tag::EXECUTE_TRANSACTION, &(), metas)
            }
        }
    }
}

pub(crate) fn account_at(ix: &Instruction, index: usize) -> Result<Pubkey, ProgramError> {
    ix.accounts
        .get(index)
        .map(|m| m.pubkey)
        .ok_or_else(|| ProgramError::InvalidArgument(format!("missing account #{}", index)))
}

fn args<T: BorshDeserialize>(data: &[u8]) -> Result<T, ProgramError> {
    borsh::from_slice(data).map_err(|e| ProgramError::InvalidArgument(format!("malformed instruction data: {}", e)))
}

impl GovernanceInstruction {
    pub fn decode(ix: &Instruction) -> Result<Self, ProgramError> {
        if ix.program_id != pda::GOVERNANCE_PROGRAM_ID {
            return Err(ProgramError::UnsupportedInstruction(ix.program_id));
        }
        let (&tag, data) = ix
            .data
            .split_first()
            .ok_or_else(|| ProgramError::InvalidArgument("empty instruction data".to_string()))?;
        let at = |i| account_at(ix, i);

        let decoded = match tag {
            tag::CREATE_REALM => {
                let a: CreateRealmArgs = args(data)?;
                GovernanceInstruction::CreateRealm {
                    name: a.name,
                    realm_authority: at(1)?,
                    community_mint: at(2)?,
                    council_mint: if a.config_args.use_council_mint { Some(at(8)?) } else { None },
                    payer: at(4)?,
                }
            }
            tag::CREATE_TOKEN_OWNER_RECORD => GovernanceInstruction::CreateTokenOwnerRecord {
                realm: at(0)?,
                governing_token_owner: at(1)?,
                governing_token_mint: at(3)?,
                payer: at(4)?,
            },
            tag::DEPOSIT_GOVERNING_TOKENS => {
                let amount: u64 = args(data)?;
                let realm = at(0)?;
                // The mint is only implied by the holding account address
                let source = at(2)?;
                if at(1)? != pda::governing_token_holding(&realm, &source) {
                    return Err(ProgramError::InvalidArgument(
                        "only membership deposits from the mint are supported".to_string(),
                    ));
                }
                let owner = at(3)?;
                if at(5)? != pda::token_owner_record(&realm, &source, &owner) {
                    return Err(ProgramError::InvalidArgument("token owner record mismatch".to_string()));
                }
                GovernanceInstruction::DepositGoverningTokens {
                    realm,
                    governing_token_mint: source,
                    source,
                    governing_token_owner: owner,
                    source_authority: at(4)?,
                    payer: at(6)?,
                    amount,
                }
            }
            tag::CREATE_GOVERNANCE => {
                let config: GovernanceConfig = args(data)?;
                GovernanceInstruction::CreateGovernance {
                    realm: at(0)?,
                    token_owner_record: at(3)?,
                    create_authority: at(6)?,
                    payer: at(4)?,
                    council_yes_threshold_pct: config.council_yes_threshold_pct(),
                }
            }
            tag::CREATE_NATIVE_TREASURY => GovernanceInstruction::CreateNativeTreasury {
                governance: at(0)?,
                payer: at(2)?,
            },
            tag::CREATE_PROPOSAL => {
                let a: CreateProposalArgs = args(data)?;
                GovernanceInstruction::CreateProposal {
                    realm: at(0)?,
                    governance: at(2)?,
                    token_owner_record: at(3)?,
                    governing_token_mint: at(4)?,
                    governance_authority: at(5)?,
                    payer: at(6)?,
                    name: a.name,
                    description: a.description_link,
                    seed: a.proposal_seed,
                }
            }
            tag::INSERT_TRANSACTION => {
                let a: InsertTransactionArgs = args(data)?;
                GovernanceInstruction::InsertTransaction {
                    governance: at(0)?,
                    proposal: at(1)?,
                    token_owner_record: at(2)?,
                    governance_authority: at(3)?,
                    payer: at(5)?,
                    option_index: a.option_index,
                    index: a.index,
                    instructions: a.instructions.into_iter().map(Instruction::from).collect(),
                }
            }
            tag::SIGN_OFF_PROPOSAL => GovernanceInstruction::SignOffProposal {
                realm: at(0)?,
                governance: at(1)?,
                proposal: at(2)?,
                signatory: at(3)?,
                token_owner_record: at(4)?,
            },
            tag::CAST_VOTE => {
                let vote = match args::<CastVoteArgs>(data)? {
                    CastVoteArgs::Approve(_) => Vote::Approve,
                    CastVoteArgs::Deny => Vote::Deny,
                    CastVoteArgs::Abstain | CastVoteArgs::Veto => {
                        return Err(ProgramError::UnsupportedInstruction(ix.program_id))
                    }
                };
                GovernanceInstruction::CastVote {
                    realm: at(0)?,
                    governance: at(1)?,
                    proposal: at(2)?,
                    proposal_owner_record: at(3)?,
                    voter_token_owner_record: at(4)?,
                    governance_authority: at(5)?,
                    governing_token_mint: at(7)?,
                    payer: at(8)?,
                    vote,
                }
            }
            tag::EXECUTE_TRANSACTION => GovernanceInstruction::ExecuteTransaction {
                governance: at(0)?,
                proposal: at(1)?,
                proposal_transaction: at(2)?,
                accounts: ix.accounts.iter().skip(3).cloned().collect(),
            },
            _ => return Err(ProgramError::UnsupportedInstruction(ix.program_id)),
        };
        Ok(decoded)
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            GovernanceInstruction::CreateRealm { .. } => "CreateRealm",
            GovernanceInstruction::CreateTokenOwnerRecord { .. } => "CreateTokenOwnerRecord",
            GovernanceInstruction::DepositGoverningTokens { .. } => "DepositGoverningTokens",
            GovernanceInstruction::CreateGovernance { .. } => "CreateGovernance",
            GovernanceInstruction::CreateNativeTreasury { .. } => "CreateNativeTreasury",
            GovernanceInstruction::CreateProposal { .. } => "CreateProposal",
            GovernanceInstruction::InsertTransaction { .. } => "InsertTransaction",
            GovernanceInstruction::SignOffProposal { .. } => "SignOffProposal",
            GovernanceInstruction::CastVote { .. } => "CastVote",
            GovernanceInstruction::ExecuteTransaction { .. } => "ExecuteTransaction",
        }
    }
}

// =============================================================================
// MULTISIG PROGRAM
// =============================================================================

/// First 8 bytes of `sha256("<namespace>:<name>")`
pub(crate) fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", namespace, name).as_bytes());
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

mod method {
    pub const MULTISIG_CREATE: &str = "multisig_create_v2";
    pub const VAULT_TRANSACTION_CREATE: &str = "vault_transaction_create";
    pub const PROPOSAL_CREATE: &str = "proposal_create";
    pub const PROPOSAL_APPROVE: &str = "proposal_approve";
    pub const VAULT_TRANSACTION_EXECUTE: &str = "vault_transaction_execute";
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) struct Permissions {
    pub mask: u8,
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) struct Member {
    pub key: Pubkey,
    pub permissions: Permissions,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct MultisigCreateArgs {
    config_authority: Option<Pubkey>,
    threshold: u16,
    members: Vec<Member>,
    time_lock: u32,
    rent_collector: Option<Pubkey>,
    memo: Option<String>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct VaultTransactionCreateArgs {
    vault_index: u8,
    ephemeral_signers: u8,
    transaction_message: Vec<u8>,
    memo: Option<String>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ProposalCreateArgs {
    transaction_index: u64,
    draft: bool,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ProposalVoteArgs {
    memo: Option<String>,
}

/// Multisig program instructions used by this service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultisigInstruction {
    MultisigCreate {
        /// Fee treasury named in the program config
        treasury: Pubkey,
        create_key: Pubkey,
        creator: Pubkey,
        members: Vec<Pubkey>,
        threshold: u16,
        memo: Option<String>,
    },
    /// `transaction` must be the address of the next transaction index
    VaultTransactionCreate {
        multisig: Pubkey,
        transaction: Pubkey,
        creator: Pubkey,
        vault_index: u8,
        message: VaultTransactionMessage,
        memo: Option<String>,
    },
    ProposalCreate {
        multisig: Pubkey,
        creator: Pubkey,
        transaction_index: u64,
    },
    ProposalApprove {
        multisig: Pubkey,
        member: Pubkey,
        proposal: Pubkey,
    },
    VaultTransactionExecute {
        multisig: Pubkey,
        proposal: Pubkey,
        transaction: Pubkey,
        member: Pubkey,
        /// Keys of the vault message, see [`VaultTransactionMessage::execution_accounts`]
        remaining_accounts: Vec<AccountMeta>,
    },
}

fn multisig_ix<T: BorshSerialize>(method: &str, args: &T, accounts: Vec<AccountMeta>) -> Instruction {
    Instruction::new_with_borsh(
        pda::MULTISIG_PROGRAM_ID,
        &(discriminator("global", method), args),
        accounts,
    )
}

impl MultisigInstruction {
    /// Approval by `member` of the transaction at `transaction_index`
    pub fn approve(multisig: &Pubkey, member: &Pubkey, transaction_index: u64) -> Self {
        MultisigInstruction::ProposalApprove {
            multisig: *multisig,
            member: *member,
            proposal: pda::multisig_proposal(multisig, transaction_index),
        }
    }

    pub fn execute(
        multisig: &Pubkey,
        member: &Pubkey,
        transaction_index: u64,
        message: &VaultTransactionMessage,
    ) -> Self {
        MultisigInstruction::VaultTransactionExecute {
            multisig: *multisig,
            proposal: pda::multisig_proposal(multisig, transaction_index),
            transaction: pda::vault_transaction(multisig, transaction_index),
            member: *member,
            remaining_accounts: message.execution_accounts(),
        }
    }

    pub fn decode(ix: &Instruction) -> Result<Self, ProgramError> {
        if ix.program_id != pda::MULTISIG_PROGRAM_ID {
            return Err(ProgramError::UnsupportedInstruction(ix.program_id));
        }
        if ix.data.len() < 8 {
            return Err(ProgramError::InvalidArgument("missing method discriminator".to_string()));
        }
        let (disc, data) = ix.data.split_at(8);
        let at = |i| account_at(ix, i);
        let is = |method: &str| disc == discriminator("global", method);

        if is(method::MULTISIG_CREATE) {
            let a: MultisigCreateArgs = args(data)?;
            Ok(MultisigInstruction::MultisigCreate {
                treasury: at(1)?,
                create_key: at(3)?,
                creator: at(4)?,
                members: a.members.into_iter().map(|m| m.key).collect(),
                threshold: a.threshold,
                memo: a.memo,
            })
        } else if is(method::VAULT_TRANSACTION_CREATE) {
            let a: VaultTransactionCreateArgs = args(data)?;
            if a.ephemeral_signers != 0 {
                return Err(ProgramError::InvalidArgument("ephemeral signers are not supported".to_string()));
            }
            Ok(MultisigInstruction::VaultTransactionCreate {
                multisig: at(0)?,
                transaction: at(1)?,
                creator: at(2)?,
                vault_index: a.vault_index,
                message: VaultTransactionMessage::from_bytes(&a.transaction_message)?,
                memo: a.memo,
            })
        } else if is(method::PROPOSAL_CREATE) {
            let a: ProposalCreateArgs = args(data)?;
            Ok(MultisigInstruction::ProposalCreate {
                multisig: at(0)?,
                creator: at(2)?,
                transaction_index: a.transaction_index,
            })
        } else if is(method::PROPOSAL_APPROVE) {
            let _: ProposalVoteArgs = args(data)?;
            Ok(MultisigInstruction::ProposalApprove {
                multisig: at(0)?,
                member: at(1)?,
                proposal: at(2)?,
            })
        } else if is(method::VAULT_TRANSACTION_EXECUTE) {
            Ok(MultisigInstruction::VaultTransactionExecute {
                multisig: at(0)?,
                proposal: at(1)?,
                transaction: at(2)?,
                member: at(3)?,
                remaining_accounts: ix.accounts.iter().skip(4).cloned().collect(),
            })
        } else {
            Err(ProgramError::UnsupportedInstruction(ix.program_id))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MultisigInstruction::MultisigCreate { .. } => "MultisigCreate",
            MultisigInstruction::VaultTransactionCreate { .. } => "VaultTransactionCreate",
            MultisigInstruction::ProposalCreate { .. } => "ProposalCreate",
            MultisigInstruction::ProposalApprove { .. } => "ProposalApprove",
            MultisigInstruction::VaultTransactionExecute { .. } => "VaultTransactionExecute",
        }
    }
}

impl TryFrom<MultisigInstruction> for Instruction {
    type Error = ProgramError;

    /// Fails only when a vault message does not fit its compact wire form
    fn try_from(ix: MultisigInstruction) -> Result<Self, Self::Error> {
        use MultisigInstruction::*;
        let instruction = match ix {
            MultisigCreate {
                treasury,
                create_key,
                creator,
                members,
                threshold,
                memo,
            } => {
                let args = MultisigCreateArgs {
                    config_authority: None,
                    threshold,
                    members: members
                        .into_iter()
                        .map(|key| Member {
                            key,
                            permissions: Permissions { mask: ALL_PERMISSIONS },
                        })
                        .collect(),
                    time_lock: 0,
                    rent_collector: None,
                    memo,
                };
                multisig_ix(
                    method::MULTISIG_CREATE,
                    &args,
                    vec![
                        AccountMeta::new_readonly(pda::program_config(), false),
                        AccountMeta::new(treasury, false),
                        AccountMeta::new(pda::multisig(&create_key), false),
                        AccountMeta::new_readonly(create_key, true),
                        AccountMeta::new(creator, true),
                        AccountMeta::new_readonly(system_program::ID, false),
                    ],
                )
            }

            VaultTransactionCreate {
                multisig,
                transaction,
                creator,
                vault_index,
                message,
                memo,
            } => {
                let args = VaultTransactionCreateArgs {
                    vault_index,
                    ephemeral_signers: 0,
                    transaction_message: message.to_bytes()?,
                    memo,
                };
                multisig_ix(
                    method::VAULT_TRANSACTION_CREATE,
                    &args,
                    vec![
                        AccountMeta::new(multisig, false),
                        AccountMeta::new(transaction, false),
                        AccountMeta::new_readonly(creator, true),
                        AccountMeta::new(creator, true),
                        AccountMeta::new_readonly(system_program::ID, false),
                    ],
                )
            }

            ProposalCreate {
                multisig,
                creator,
                transaction_index,
            } => multisig_ix(
                method::PROPOSAL_CREATE,
                &ProposalCreateArgs {
                    transaction_index,
                    draft: false,
                },
                vec![
                    AccountMeta::new_readonly(multisig, false),
                    AccountMeta::new(pda::multisig_proposal(&multisig, transaction_index), false),
                    AccountMeta::new_readonly(creator, true),
                    AccountMeta::new(creator, true),
                    AccountMeta::new_readonly(system_program::ID, false),
                ],
            ),

            ProposalApprove {
                multisig,
                member,
                proposal,
            } => multisig_ix(
                method::PROPOSAL_APPROVE,
                &ProposalVoteArgs { memo: None },
                vec![
                    AccountMeta::new_readonly(multisig, false),
                    AccountMeta::new(member, true),
                    AccountMeta::new(proposal, false),
                ],
            ),

            VaultTransactionExecute {
                multisig,
                proposal,
                transaction,
                member,
                remaining_accounts,
            } => {
                let mut accounts = vec![
                    AccountMeta::new_readonly(multisig, false),
                    AccountMeta::new(proposal, false),
                    AccountMeta::new_readonly(transaction, false),
                    AccountMeta::new_readonly(member, true),
                ];
                accounts.extend(remaining_accounts);
                multisig_ix(method::VAULT_TRANSACTION_EXECUTE, &(), accounts)
            }
        };
        Ok(instruction)
    }
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// Short name of an instruction for logs
pub fn instruction_name(ix: &Instruction) -> &'static str {
    if ix.program_id == pda::GOVERNANCE_PROGRAM_ID {
        GovernanceInstruction::decode(ix).map(|d| d.name()).unwrap_or("Governance")
    } else if ix.program_id == pda::MULTISIG_PROGRAM_ID {
        MultisigInstruction::decode(ix).map(|d| d.name()).unwrap_or("Multisig")
    } else if ix.program_id == system_program::ID {
        "System"
    } else if ix.program_id == pda::TOKEN_PROGRAM_ID {
        "Token"
    } else if ix.program_id == pda::ASSOCIATED_TOKEN_PROGRAM_ID {
        "AssociatedTokenAccount"
    } else {
        "Unknown"
    }
}

/// Build and sign a transaction paid by `payer`.
///
/// Every signer the message requires must be among the keypairs; a missing
/// one is reported by address instead of failing inside the signer. Extra
/// keypairs the message does not need are ignored.
pub fn build_transaction(
    payer: &Keypair,
    extra_signers: &[&Keypair],
    instructions: &[Instruction],
    recent_blockhash: Hash,
) -> Result<Transaction, ChainError> {
    let message = Message::new(instructions, Some(&payer.pubkey()));
    let required = &message.account_keys[..message.header.num_required_signatures as usize];

    let mut signers: Vec<&Keypair> = Vec::with_capacity(required.len());
    for key in required {
        let signer = std::iter::once(payer)
            .chain(extra_signers.iter().copied())
            .find(|kp| kp.pubkey() == *key)
            .ok_or(ProgramError::MissingSignature(*key))?;
        signers.push(signer);
    }

    let mut transaction = Transaction::new_unsigned(message);
    transaction
        .try_sign(signers.as_slice(), recent_blockhash)
        .map_err(|e| ChainError::Rpc(format!("Failed to sign transaction: {}", e)))?;
    Ok(transaction)
}

/// Expand a legacy message back into instructions with signer and writable flags
pub fn decompile(message: &Message) -> Result<Vec<Instruction>, ProgramError> {
    let header = &message.header;
    let key_count = message.account_keys.len();
    let signers = header.num_required_signatures as usize;
    let is_writable = |i: usize| {
        if i < signers {
            i < signers - header.num_readonly_signed_accounts as usize
        } else {
            i < key_count - header.num_readonly_unsigned_accounts as usize
        }
    };
    let key = |i: u8| {
        message
            .account_keys
            .get(i as usize)
            .copied()
            .ok_or_else(|| ProgramError::InvalidArgument(format!("account index {} out of range", i)))
    };

    message
        .instructions
        .iter()
        .map(|ix| {
            let accounts = ix
                .accounts
                .iter()
                .map(|&i| {
                    Ok(AccountMeta {
                        pubkey: key(i)?,
                        is_signer: (i as usize) < signers,
                        is_writable: is_writable(i as usize),
                    })
                })
                .collect::<Result<Vec<_>, ProgramError>>()?;
            Ok(Instruction {
                program_id: key(ix.program_id_index)?,
                accounts,
                data: ix.data.clone(),
            })
        })
        .collect()
}
