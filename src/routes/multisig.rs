//! Multisig transaction handlers
//!
//! Address the multisig directly, without going through a governance
//! proposal. This is how orphaned transactions get found and finished.

use super::parse_address;
use crate::error::ApiResult;
use crate::models::SuccessResponse;
use crate::multisig::{AdvanceOutcome, TransactionStatus};
use crate::recovery::OpenTransactions;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use solana_signature::Signature;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResponse {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub signature: Signature,
}

pub async fn list_open_transactions(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<SuccessResponse<OpenTransactions>>> {
    let multisig = parse_address(&address, "multisig")?;
    let open = state.recovery.open_transactions(&multisig).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} open transaction(s).", open.transactions.len()),
        open,
    )))
}

pub async fn get_status(
    State(state): State<SharedState>,
    Path((address, index)): Path<(String, u64)>,
) -> ApiResult<Json<SuccessResponse<TransactionStatus>>> {
    let multisig = parse_address(&address, "multisig")?;
    let status = state.orchestrator.multisig().get_proposal_status(&multisig, index).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{}/{} approvals.", status.approval_count, status.threshold),
        status,
    )))
}

pub async fn approve(
    State(state): State<SharedState>,
    Path((address, index)): Path<(String, u64)>,
) -> ApiResult<Json<SuccessResponse<SignatureResponse>>> {
    let multisig = parse_address(&address, "multisig")?;
    let signature = state
        .orchestrator
        .multisig()
        .approve_proposal(&multisig, &state.signer, index)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Approved transaction #{}.", index),
        SignatureResponse { signature },
    )))
}

pub async fn execute(
    State(state): State<SharedState>,
    Path((address, index)): Path<(String, u64)>,
) -> ApiResult<Json<SuccessResponse<SignatureResponse>>> {
    let multisig = parse_address(&address, "multisig")?;
    let signature = state
        .orchestrator
        .multisig()
        .execute_multisig_transaction(&multisig, &state.signer, index)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Executed transaction #{}.", index),
        SignatureResponse { signature },
    )))
}

/// Approve, then execute if the threshold is now met
pub async fn advance(
    State(state): State<SharedState>,
    Path((address, index)): Path<(String, u64)>,
) -> ApiResult<Json<SuccessResponse<AdvanceOutcome>>> {
    let multisig = parse_address(&address, "multisig")?;
    let outcome = state
        .orchestrator
        .multisig()
        .approve_and_execute_if_ready(&multisig, &state.signer, index)
        .await?;

    let message = match &outcome {
        AdvanceOutcome::Executed { .. } => format!("Transaction #{} executed.", index),
        AdvanceOutcome::AwaitingApprovals { status } => format!(
            "Transaction #{} has {}/{} approvals.",
            index, status.approval_count, status.threshold
        ),
        AdvanceOutcome::AlreadyExecuted => format!("Transaction #{} was already executed.", index),
    };
    Ok(Json(SuccessResponse::with_data(message, outcome)))
}
