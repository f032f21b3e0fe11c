//! Governance proposal handlers
//!
//! Votes and executions go through the orchestrator, so the response carries
//! the governance signature and, next to it, where the linked multisig
//! transaction ended up.

use super::{parse_address, parse_optional_address, validate_address};
use crate::chain::pda;
use crate::error::{validation_error, ApiResult, AppError};
use crate::link::ProposalLink;
use crate::models::SuccessResponse;
use crate::multisig::AdvanceOutcome;
use crate::recovery::LinkedProposal;
use crate::state::SharedState;
use crate::sync::{IntegratedProposal, MultisigSync};
use crate::transfer;
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use solana_instruction::Instruction;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use validator::Validate;

// =============================================================================
// REQUEST/RESPONSE TYPES
// =============================================================================

/// SOL or token transfer gated by a governance vote
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransferProposalRequest {
    /// Defaults to the configured active realm
    pub realm: Option<String>,

    #[validate(length(min = 1, max = 64, message = "Title must be 1 to 64 characters"))]
    pub title: String,

    #[serde(default)]
    #[validate(length(max = 2048, message = "Description is too long"))]
    pub description: String,

    #[validate(custom(function = "validate_address"))]
    pub recipient: String,

    /// Token mint; the transfer moves SOL when absent
    #[validate(custom(function = "validate_address"))]
    pub mint: Option<String>,

    /// Lamports, or base units of `mint`
    #[serde(alias = "lamports")]
    #[validate(range(min = 1, message = "Amount must be greater than zero"))]
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub realm: Option<String>,
    pub approve: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalCreatedResponse {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub proposal: Pubkey,
}

/// Governance outcome with the multisig outcome attached
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedActionResponse {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub signature: Signature,
    pub multisig: MultisigSync,
}

/// Failed governance action, still reporting the multisig outcome
#[derive(Debug)]
pub struct SyncedActionError {
    pub error: AppError,
    pub multisig: Option<MultisigSync>,
}

impl From<AppError> for SyncedActionError {
    fn from(error: AppError) -> Self {
        Self { error, multisig: None }
    }
}

#[derive(Serialize)]
struct MultisigOutcome {
    multisig: MultisigSync,
}

impl IntoResponse for SyncedActionError {
    fn into_response(self) -> Response {
        self.error
            .into_response_with(self.multisig.map(|multisig| MultisigOutcome { multisig }))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedActionResponse {
    pub link: ProposalLink,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub signature: Signature,
}

fn sync_message(action: &str, sync: &MultisigSync) -> String {
    match sync {
        MultisigSync::NotLinked => format!("{}.", action),
        MultisigSync::Skipped { reason, .. } => format!("{}. Multisig untouched: {}.", action, reason),
        MultisigSync::Executed { .. } => format!("{}. Linked multisig transaction executed.", action),
        MultisigSync::AwaitingApprovals { status, .. } => format!(
            "{}. Multisig has {}/{} approvals; more signers must approve.",
            action, status.approval_count, status.threshold
        ),
        MultisigSync::AlreadyExecuted { .. } => format!("{}. Linked multisig transaction was already executed.", action),
        MultisigSync::Unresolved { .. } => format!("{}. Multisig step needs manual attention.", action),
    }
}

/// Transfer out of `source`, a treasury or vault, as the request describes
async fn transfer_instructions(
    state: &SharedState,
    source: &Pubkey,
    recipient: &Pubkey,
    payload: &TransferProposalRequest,
) -> Result<Vec<Instruction>, AppError> {
    match parse_optional_address(payload.mint.as_deref(), "mint")? {
        None => Ok(vec![transfer::system_transfer(source, recipient, payload.amount)]),
        Some(mint) => {
            let decimals = transfer::mint_decimals(state.cluster.as_ref(), &mint).await?;
            transfer::token_transfer(source, recipient, &mint, payload.amount, decimals)
        }
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Standalone proposal: the treasury transfer runs on governance execution
pub async fn create_proposal(
    State(state): State<SharedState>,
    Json(payload): Json<TransferProposalRequest>,
) -> ApiResult<Json<SuccessResponse<ProposalCreatedResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let realm = state.realm_or_default(parse_optional_address(payload.realm.as_deref(), "realm")?)?;
    let recipient = parse_address(&payload.recipient, "recipient")?;
    let treasury = pda::native_treasury(&pda::governance(&realm));
    let ixs = transfer_instructions(&state, &treasury, &recipient, &payload).await?;

    let proposal = state
        .orchestrator
        .governance()
        .create_proposal(&realm, &state.signer, &payload.title, &payload.description, ixs)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Proposal '{}' created and open for voting.", payload.title),
        ProposalCreatedResponse { proposal },
    )))
}

/// Integrated proposal: the vault transfer runs through the realm's multisig
pub async fn create_integrated_proposal(
    State(state): State<SharedState>,
    Json(payload): Json<TransferProposalRequest>,
) -> ApiResult<Json<SuccessResponse<IntegratedProposal>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let realm = state.realm_or_default(parse_optional_address(payload.realm.as_deref(), "realm")?)?;
    let recipient = parse_address(&payload.recipient, "recipient")?;
    let vault = pda::vault(&pda::realm_multisig(&realm), pda::DEFAULT_VAULT_INDEX);
    let ixs = transfer_instructions(&state, &vault, &recipient, &payload).await?;

    let created = state
        .orchestrator
        .create_integrated_asset_transfer_proposal(&realm, &state.signer, &payload.title, &payload.description, ixs)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!(
            "Integrated proposal '{}' created with multisig transaction #{}.",
            payload.title, created.link.transaction_index
        ),
        created,
    )))
}

pub async fn get_proposal(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<SuccessResponse<LinkedProposal>>> {
    let proposal = parse_address(&address, "proposal")?;
    let view = state.recovery.inspect(&proposal).await?;

    Ok(Json(SuccessResponse::with_data("Proposal loaded.", view)))
}

pub async fn vote(
    State(state): State<SharedState>,
    Path(address): Path<String>,
    Json(payload): Json<VoteRequest>,
) -> Result<Json<SuccessResponse<SyncedActionResponse>>, SyncedActionError> {
    let proposal = parse_address(&address, "proposal")?;
    let realm = state.realm_or_default(parse_optional_address(payload.realm.as_deref(), "realm")?)?;

    let synced = state
        .orchestrator
        .cast_vote(&realm, &state.signer, &proposal, payload.approve)
        .await;
    let signature = match synced.primary {
        Ok(signature) => signature,
        Err(error) => {
            return Err(SyncedActionError {
                error,
                multisig: Some(synced.multisig),
            })
        }
    };

    Ok(Json(SuccessResponse::with_data(
        sync_message("Vote cast", &synced.multisig),
        SyncedActionResponse {
            signature,
            multisig: synced.multisig,
        },
    )))
}

pub async fn execute(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<Json<SuccessResponse<SyncedActionResponse>>, SyncedActionError> {
    let proposal = parse_address(&address, "proposal")?;

    let synced = state.orchestrator.execute_proposal(&state.signer, &proposal).await;
    let signature = match synced.primary {
        Ok(signature) => signature,
        Err(error) => {
            return Err(SyncedActionError {
                error,
                multisig: Some(synced.multisig),
            })
        }
    };

    Ok(Json(SuccessResponse::with_data(
        sync_message("Proposal executed", &synced.multisig),
        SyncedActionResponse {
            signature,
            multisig: synced.multisig,
        },
    )))
}

/// Approve the linked multisig transaction without voting
pub async fn approve_linked(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<SuccessResponse<LinkedActionResponse>>> {
    let proposal = parse_address(&address, "proposal")?;
    let (link, signature) = state.recovery.approve(&proposal, &state.signer).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Approved multisig transaction #{}.", link.transaction_index),
        LinkedActionResponse { link, signature },
    )))
}

pub async fn execute_linked(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<SuccessResponse<LinkedActionResponse>>> {
    let proposal = parse_address(&address, "proposal")?;
    let (link, signature) = state.recovery.execute(&proposal, &state.signer).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Executed multisig transaction #{}.", link.transaction_index),
        LinkedActionResponse { link, signature },
    )))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedAdvanceResponse {
    pub link: ProposalLink,
    #[serde(flatten)]
    pub outcome: AdvanceOutcome,
}

/// Approve the linked transaction and execute it if the threshold is met
pub async fn advance_linked(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<SuccessResponse<LinkedAdvanceResponse>>> {
    let proposal = parse_address(&address, "proposal")?;
    let (link, outcome) = state.recovery.advance(&proposal, &state.signer).await?;

    let message = match &outcome {
        AdvanceOutcome::Executed { .. } => format!("Multisig transaction #{} executed.", link.transaction_index),
        AdvanceOutcome::AwaitingApprovals { status } => format!(
            "Multisig transaction #{} has {}/{} approvals.",
            link.transaction_index, status.approval_count, status.threshold
        ),
        AdvanceOutcome::AlreadyExecuted => {
            format!("Multisig transaction #{} was already executed.", link.transaction_index)
        }
    };
    Ok(Json(SuccessResponse::with_data(message, LinkedAdvanceResponse { link, outcome })))
}
