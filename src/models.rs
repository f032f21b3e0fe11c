//! Shared response structures and serde helpers

use serde::{Serialize, Serializer};
use std::fmt::Display;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Serialize addresses and signatures in their base58 text form
pub fn serialize_display<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_pubkey::Pubkey;

    #[derive(Serialize)]
    struct Wrapped {
        #[serde(serialize_with = "serialize_display")]
        address: Pubkey,
    }

    #[test]
    fn test_success_body_is_flattened() {
        let address = Pubkey::new_unique();
        let body = SuccessResponse::with_data("ok", Wrapped { address });
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "ok");
        assert_eq!(json["address"], address.to_string());
    }
}
