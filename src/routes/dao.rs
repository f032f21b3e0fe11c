//! DAO provisioning and funding handlers

use super::{parse_address, parse_optional_address, validate_address, validate_addresses};
use crate::chain::pda;
use crate::error::{validation_error, ApiResult, AppError};
use crate::models::SuccessResponse;
use crate::provision::{initialize_integrated_dao, DaoConfig, ProvisionedDao};
use crate::state::SharedState;
use crate::transfer;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use solana_native_token::LAMPORTS_PER_SOL;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use tracing::info;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateDaoRequest {
    #[validate(length(min = 1, max = 32, message = "Realm name must be 1 to 32 characters"))]
    pub name: String,

    /// Council holders and multisig members
    #[validate(
        length(min = 1, message = "At least one member is required"),
        custom(function = "validate_addresses")
    )]
    pub members: Vec<String>,

    #[validate(range(min = 1, message = "Threshold must be at least 1"))]
    pub threshold: u16,
}

pub async fn create_dao(
    State(state): State<SharedState>,
    Json(payload): Json<CreateDaoRequest>,
) -> ApiResult<Json<SuccessResponse<ProvisionedDao>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let members = payload
        .members
        .iter()
        .map(|m| parse_address(m, "member"))
        .collect::<Result<Vec<_>, _>>()?;
    let config = DaoConfig {
        name: payload.name,
        members,
        threshold: payload.threshold,
    };

    let dao = initialize_integrated_dao(&state.sender, &state.signer, &config).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("DAO '{}' created.", config.name),
        dao,
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FundTarget {
    /// Governance native treasury, spent by standalone proposals
    Treasury,
    /// Multisig vault, spent by integrated proposals
    Vault,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FundRequest {
    pub realm: Option<String>,

    pub target: FundTarget,

    /// Token mint; funds SOL when absent
    #[validate(custom(function = "validate_address"))]
    pub mint: Option<String>,

    /// Lamports, or base units of `mint`
    #[serde(alias = "lamports")]
    #[validate(range(min = 1, message = "Amount must be greater than zero"))]
    pub amount: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundResponse {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub target: Pubkey,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_optional_address")]
    pub mint: Option<Pubkey>,
    pub amount: u64,
    /// Balance of the target once the transfer confirmed
    pub balance: u64,
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub signature: Signature,
}

fn serialize_optional_address<S: serde::Serializer>(value: &Option<Pubkey>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(address) => serializer.collect_str(address),
        None => serializer.serialize_none(),
    }
}

/// Whole SOL, for log lines and messages
fn sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

pub async fn fund(
    State(state): State<SharedState>,
    Json(payload): Json<FundRequest>,
) -> ApiResult<Json<SuccessResponse<FundResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let realm = state.realm_or_default(parse_optional_address(payload.realm.as_deref(), "realm")?)?;
    let mint = parse_optional_address(payload.mint.as_deref(), "mint")?;
    let target = match payload.target {
        FundTarget::Treasury => pda::native_treasury(&pda::governance(&realm)),
        FundTarget::Vault => pda::vault(&pda::realm_multisig(&realm), pda::DEFAULT_VAULT_INDEX),
    };

    let (signature, balance, message) = match mint {
        None => {
            let signature = transfer::fund(&state.sender, &state.signer, &target, payload.amount).await?;
            info!("💰 Sent {} SOL to {:?} {}", sol(payload.amount), payload.target, target);
            let balance = state
                .cluster
                .get_balance(&target)
                .await
                .map_err(AppError::Unavailable)?;
            (signature, balance, format!("Sent {} SOL.", sol(payload.amount)))
        }
        Some(mint) => {
            let signature =
                transfer::fund_tokens(&state.sender, &state.signer, &target, &mint, payload.amount).await?;
            info!("💰 Sent {} of mint {} to {:?} {}", payload.amount, mint, payload.target, target);
            let balance = state
                .cluster
                .get_token_account(&pda::associated_token_account(&target, &mint))
                .await
                .map_err(AppError::Unavailable)?
                .map_or(0, |account| account.amount);
            (signature, balance, format!("Sent {} tokens of mint {}.", payload.amount, mint))
        }
    };

    Ok(Json(SuccessResponse::with_data(
        message,
        FundResponse {
            target,
            mint,
            amount: payload.amount,
            balance,
            signature,
        },
    )))
}
