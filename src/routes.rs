//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod dao;
mod multisig;
mod proposal;

use crate::config::Settings;
use crate::error::AppError;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use solana_pubkey::Pubkey;
use std::str::FromStr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;
use validator::ValidationError;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    let cors = build_cors_layer(settings);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))

        // DAO setup
        .route("/api/dao", post(dao::create_dao))
        .route("/api/dao/fund", post(dao::fund))

        // Governance proposals
        .route("/api/proposals", post(proposal::create_proposal))
        .route("/api/proposals/integrated", post(proposal::create_integrated_proposal))
        .route("/api/proposals/{address}", get(proposal::get_proposal))
        .route("/api/proposals/{address}/vote", post(proposal::vote))
        .route("/api/proposals/{address}/execute", post(proposal::execute))
        .route("/api/proposals/{address}/multisig/approve", post(proposal::approve_linked))
        .route("/api/proposals/{address}/multisig/execute", post(proposal::execute_linked))
        .route("/api/proposals/{address}/multisig/advance", post(proposal::advance_linked))

        // Multisig transactions
        .route("/api/multisig/{address}/transactions", get(multisig::list_open_transactions))
        .route("/api/multisig/{address}/transactions/{index}", get(multisig::get_status))
        .route("/api/multisig/{address}/transactions/{index}/approve", post(multisig::approve))
        .route("/api/multisig/{address}/transactions/{index}/execute", post(multisig::execute))
        .route("/api/multisig/{address}/transactions/{index}/advance", post(multisig::advance))

        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(origins)
    };

    cors.allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600))
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Signer node is running.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Parse a base58 address taken from a path or body
pub(crate) fn parse_address(raw: &str, field: &str) -> Result<Pubkey, AppError> {
    Pubkey::from_str(raw.trim())
        .map_err(|_| AppError::Validation(format!("{} '{}' is not a valid address", field, raw)))
}

pub(crate) fn parse_optional_address(raw: Option<&str>, field: &str) -> Result<Option<Pubkey>, AppError> {
    raw.map(|r| parse_address(r, field)).transpose()
}

pub(crate) fn validate_address(value: &str) -> Result<(), ValidationError> {
    Pubkey::from_str(value.trim())
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_address"))
}

pub(crate) fn validate_addresses(values: &[String]) -> Result<(), ValidationError> {
    values.iter().try_for_each(|v| validate_address(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing() {
        let address = Pubkey::new_unique();
        assert_eq!(parse_address(&address.to_string(), "realm").unwrap(), address);
        assert!(matches!(parse_address("0xdeadbeef", "realm"), Err(AppError::Validation(_))));
        assert_eq!(parse_optional_address(None, "realm").unwrap(), None);
        assert!(validate_addresses(&[address.to_string(), "bad".to_string()]).is_err());
    }
}
