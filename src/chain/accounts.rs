//! Account layouts read from the governance, multisig and token programs

use crate::chain::error::ProgramError;
use serde::{Deserialize, Serialize};
use solana_instruction::{AccountMeta, Instruction};
use solana_message::Message;
use solana_pubkey::Pubkey;

// =============================================================================
// GOVERNANCE PROGRAM
// =============================================================================

/// Root account of a DAO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realm {
    pub name: String,
    pub community_mint: Pubkey,
    /// Only council-gated realms can host proposals created by this service
    pub council_mint: Option<Pubkey>,
    pub authority: Option<Pubkey>,
}

/// Governance account controlling the realm's native treasury
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Governance {
    pub realm: Pubkey,
    /// Share of the deposited council supply that must vote yes; 0 when council voting is disabled
    pub council_yes_threshold_pct: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOwnerRecord {
    pub realm: Pubkey,
    pub governing_token_mint: Pubkey,
    pub governing_token_owner: Pubkey,
    pub deposit_amount: u64,
}

/// Lifecycle of a governance proposal, in the program's own order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProposalState {
    Draft,
    SigningOff,
    Voting,
    Succeeded,
    Executing,
    Completed,
    Cancelled,
    Defeated,
    ExecutingWithErrors,
    Vetoed,
}

impl ProposalState {
    pub fn can_execute(&self) -> bool {
        matches!(self, ProposalState::Succeeded | ProposalState::Executing)
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        use ProposalState::*;
        [
            Draft,
            SigningOff,
            Voting,
            Succeeded,
            Executing,
            Completed,
            Cancelled,
            Defeated,
            ExecutingWithErrors,
            Vetoed,
        ]
        .get(tag as usize)
        .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Vote {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceProposal {
    pub governance: Pubkey,
    pub governing_token_mint: Pubkey,
    /// Record of the proposal owner
    pub token_owner_record: Pubkey,
    pub name: String,
    pub description: String,
    pub state: ProposalState,
    pub yes_votes: u64,
    pub no_votes: u64,
}

/// Instructions stored under one option of a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalTransaction {
    pub proposal: Pubkey,
    pub option_index: u8,
    pub index: u16,
    pub instructions: Vec<Instruction>,
    pub executed: bool,
}

// =============================================================================
// MULTISIG PROGRAM
// =============================================================================

/// Global settings of the multisig program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramConfig {
    /// Receives the multisig creation fee
    pub treasury: Pubkey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multisig {
    pub create_key: Pubkey,
    pub threshold: u16,
    pub members: Vec<Pubkey>,
    /// Index of the last transaction created; the next one is `transaction_index + 1`
    pub transaction_index: u64,
    /// Transactions at or below this index can no longer be executed
    pub stale_transaction_index: u64,
    /// Creation memo. The program only logs it, so it is `None` when read over RPC.
    pub memo: Option<String>,
}

impl Multisig {
    pub fn is_member(&self, key: &Pubkey) -> bool {
        self.members.contains(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MultisigProposalStatus {
    Draft,
    Active,
    Rejected,
    Approved,
    Executing,
    Executed,
    Cancelled,
}

/// Approval record attached to a vault transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigProposal {
    pub multisig: Pubkey,
    pub transaction_index: u64,
    pub status: MultisigProposalStatus,
    pub approved: Vec<Pubkey>,
    pub rejected: Vec<Pubkey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultTransaction {
    pub multisig: Pubkey,
    pub index: u64,
    pub creator: Pubkey,
    pub vault_index: u8,
    pub message: VaultTransactionMessage,
    /// Creation memo. The program only logs it, so it is `None` when read over RPC.
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledVaultInstruction {
    pub program_id_index: u8,
    pub account_indexes: Vec<u8>,
    pub data: Vec<u8>,
}

/// Compiled instructions a vault signs for.
///
/// Keys are ordered the way a transaction message orders them: writable
/// signers, read-only signers, writable non-signers, read-only non-signers.
/// The vault is always the first key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultTransactionMessage {
    pub num_signers: u8,
    pub num_writable_signers: u8,
    pub num_writable_non_signers: u8,
    pub account_keys: Vec<Pubkey>,
    pub instructions: Vec<CompiledVaultInstruction>,
}

impl VaultTransactionMessage {
    pub fn compile(vault: &Pubkey, instructions: &[Instruction]) -> Result<Self, ProgramError> {
        let message = Message::new(instructions, Some(vault));
        let header = message.header;
        let key_count = u8::try_from(message.account_keys.len())
            .map_err(|_| ProgramError::InvalidArgument("too many accounts in vault transaction".to_string()))?;

        Ok(Self {
            num_signers: header.num_required_signatures,
            num_writable_signers: header.num_required_signatures - header.num_readonly_signed_accounts,
            num_writable_non_signers: key_count
                - header.num_required_signatures
                - header.num_readonly_unsigned_accounts,
            account_keys: message.account_keys,
            instructions: message
                .instructions
                .into_iter()
                .map(|ix| CompiledVaultInstruction {
                    program_id_index: ix.program_id_index,
                    account_indexes: ix.accounts,
                    data: ix.data,
                })
                .collect(),
        })
    }

    pub fn is_signer(&self, index: usize) -> bool {
        index < self.num_signers as usize
    }

    pub fn is_writable(&self, index: usize) -> bool {
        if self.is_signer(index) {
            index < self.num_writable_signers as usize
        } else {
            index - (self.num_signers as usize) < self.num_writable_non_signers as usize
        }
    }

    fn key(&self, index: u8) -> Result<Pubkey, ProgramError> {
        self.account_keys
            .get(index as usize)
            .copied()
            .ok_or_else(|| ProgramError::InvalidArgument(format!("account index {} out of range", index)))
    }

    /// Expand back into instructions
    pub fn instructions(&self) -> Result<Vec<Instruction>, ProgramError> {
        self.instructions
            .iter()
            .map(|ix| {
                let accounts = ix
                    .account_indexes
                    .iter()
                    .map(|&i| {
                        Ok(AccountMeta {
                            pubkey: self.key(i)?,
                            is_signer: self.is_signer(i as usize),
                            is_writable: self.is_writable(i as usize),
                        })
                    })
                    .collect::<Result<Vec<_>, ProgramError>>()?;
                Ok(Instruction {
                    program_id: self.key(ix.program_id_index)?,
                    accounts,
                    data: ix.data.clone(),
                })
            })
            .collect()
    }

    /// Remaining accounts an execute instruction must pass, in key order.
    /// Nobody signs at the top level; the program signs for the vault.
    pub fn execution_accounts(&self) -> Vec<AccountMeta> {
        self.account_keys
            .iter()
            .enumerate()
            .map(|(i, key)| AccountMeta {
                pubkey: *key,
                is_signer: false,
                is_writable: self.is_writable(i),
            })
            .collect()
    }

    /// Compact wire form taken by the create instruction: `u8` lengths for
    /// every list except instruction data, which has a `u16` length.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProgramError> {
        let too_long = |what: &str| ProgramError::InvalidArgument(format!("{} does not fit the message format", what));

        let mut out = vec![self.num_signers, self.num_writable_signers, self.num_writable_non_signers];
        out.push(u8::try_from(self.account_keys.len()).map_err(|_| too_long("account list"))?);
        for key in &self.account_keys {
            out.extend_from_slice(key.as_ref());
        }
        out.push(u8::try_from(self.instructions.len()).map_err(|_| too_long("instruction list"))?);
        for ix in &self.instructions {
            out.push(ix.program_id_index);
            out.push(u8::try_from(ix.account_indexes.len()).map_err(|_| too_long("instruction accounts"))?);
            out.extend_from_slice(&ix.account_indexes);
            let len = u16::try_from(ix.data.len()).map_err(|_| too_long("instruction data"))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&ix.data);
        }
        // No address lookup tables
        out.push(0);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        let mut reader = ByteReader(bytes);
        let num_signers = reader.u8()?;
        let num_writable_signers = reader.u8()?;
        let num_writable_non_signers = reader.u8()?;

        let key_count = reader.u8()?;
        let mut account_keys = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            account_keys.push(reader.pubkey()?);
        }

        let ix_count = reader.u8()?;
        let mut instructions = Vec::with_capacity(ix_count as usize);
        for _ in 0..ix_count {
            let program_id_index = reader.u8()?;
            let account_count = reader.u8()? as usize;
            let account_indexes = reader.take(account_count)?.to_vec();
            let data_len = u16::from_le_bytes([reader.u8()?, reader.u8()?]) as usize;
            let data = reader.take(data_len)?.to_vec();
            instructions.push(CompiledVaultInstruction {
                program_id_index,
                account_indexes,
                data,
            });
        }

        if reader.u8()? != 0 {
            return Err(ProgramError::InvalidArgument(
                "address lookup tables are not supported".to_string(),
            ));
        }
        if !reader.0.is_empty() {
            return Err(ProgramError::InvalidArgument("trailing bytes after message".to_string()));
        }

        Ok(Self {
            num_signers,
            num_writable_signers,
            num_writable_non_signers,
            account_keys,
            instructions,
        })
    }
}

struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ProgramError> {
        if self.0.len() < n {
            return Err(ProgramError::InvalidArgument("truncated transaction message".to_string()));
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ProgramError> {
        Ok(self.take(1)?[0])
    }

    fn pubkey(&mut self) -> Result<Pubkey, ProgramError> {
        let bytes: [u8; 32] = self
            .take(32)?
            .try_into()
            .map_err(|_| ProgramError::InvalidArgument("truncated address".to_string()))?;
        Ok(Pubkey::new_from_array(bytes))
    }
}

// =============================================================================
// TOKEN PROGRAM
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMint {
    pub mint_authority: Option<Pubkey>,
    pub supply: u64,
    pub decimals: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAccount {
    pub mint: Pubkey,
    pub owner: Pubkey,
    pub amount: u64,
}
