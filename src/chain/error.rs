//! Errors raised by the chain access layer
//!
//! `ProgramError` is what a program answers when it rejects an instruction;
//! `ChainError` is everything that can go wrong between this process and the
//! cluster, program rejections included.

use solana_pubkey::Pubkey;
use solana_signature::Signature;
use thiserror::Error;

/// Rejection reported by the governance, multisig, token or system program
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    #[error("account {0} already exists")]
    AccountAlreadyExists(Pubkey),

    #[error("account {0} is not initialized")]
    UninitializedAccount(Pubkey),

    #[error("governing token owner already voted on this proposal")]
    AlreadyVoted,

    #[error("member already approved this transaction")]
    AlreadyApproved,

    #[error("signer is not a member of the multisig")]
    NotAMember,

    #[error("invalid proposal state: {0}")]
    InvalidState(String),

    #[error("missing required signature for {0}")]
    MissingSignature(Pubkey),

    #[error("signer is not allowed to perform this action")]
    Unauthorized,

    #[error("insufficient funds in {account}: need {needed}, have {available}")]
    InsufficientFunds {
        account: Pubkey,
        needed: u64,
        available: u64,
    },

    #[error("not enough governing tokens to act on this proposal")]
    InsufficientGoverningTokens,

    #[error("threshold not reached: {approvals}/{threshold} approvals")]
    ThresholdNotReached { approvals: usize, threshold: u16 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported instruction for program {0}")]
    UnsupportedInstruction(Pubkey),

    /// Program error code with no dedicated variant
    #[error("custom program error {0:#x}")]
    Custom(u32),

    /// Runtime rejection reported as raw text by the cluster
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// Network or program failure observed while talking to the cluster
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("program error: {0}")]
    Program(#[from] ProgramError),

    #[error("transaction {0} was not confirmed within the retry budget")]
    ConfirmationTimeout(Signature),

    #[error("account {address} holds unexpected data: {reason}")]
    InvalidAccountData { address: Pubkey, reason: String },
}

impl ChainError {
    /// Program rejection carried by this error, if any
    pub fn program_error(&self) -> Option<&ProgramError> {
        match self {
            ChainError::Program(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn invalid_account(address: &Pubkey, reason: impl Into<String>) -> Self {
        ChainError::InvalidAccountData {
            address: *address,
            reason: reason.into(),
        }
    }
}
