//! Proposal link codec
//!
//! A governance proposal that gates a multisig transaction carries the
//! address and index of that transaction in its description, as a block of
//! marked lines after the human text:
//!
//! ```text
//! <human description>
//!
//! --- MULTISIG TRANSACTION INFO ---
//! Multisig Address: <base58 address>
//! Transaction Index: <decimal index>
//! ----------------------------
//! ```
//!
//! This block is the only join between the two programs. Every other module
//! goes through [`ProposalLink`] and never looks at description text itself.

use serde::Serialize;
use solana_pubkey::Pubkey;
use std::str::FromStr;

const MARKER: &str = "--- MULTISIG TRANSACTION INFO ---";
const MULTISIG_PREFIX: &str = "Multisig Address: ";
const INDEX_PREFIX: &str = "Transaction Index: ";
const FOOTER: &str = "----------------------------";

/// Reference from a governance proposal to the multisig transaction it gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalLink {
    #[serde(serialize_with = "crate::models::serialize_display")]
    pub multisig: Pubkey,
    pub transaction_index: u64,
}

impl ProposalLink {
    pub fn new(multisig: Pubkey, transaction_index: u64) -> Self {
        Self {
            multisig,
            transaction_index,
        }
    }

    /// Append the link block to a human description
    pub fn encode(&self, description: &str) -> String {
        format!(
            "{}\n\n{}\n{}{}\n{}{}\n{}",
            description, MARKER, MULTISIG_PREFIX, self.multisig, INDEX_PREFIX, self.transaction_index, FOOTER
        )
    }

    /// Read the link back out of a description.
    ///
    /// Returns `None` when there is no marker line or the lines after it do
    /// not parse. When the marker appears more than once the last block wins,
    /// since the encoder always appends.
    pub fn decode(text: &str) -> Option<Self> {
        let lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();
        let marker = lines.iter().rposition(|line| *line == MARKER)?;

        let multisig = lines.get(marker + 1)?.strip_prefix(MULTISIG_PREFIX)?;
        let index = lines.get(marker + 2)?.strip_prefix(INDEX_PREFIX)?;

        Some(Self {
            multisig: Pubkey::from_str(multisig.trim()).ok()?,
            transaction_index: index.trim().parse().ok()?,
        })
    }
}

/// Description with any link block removed, for display
pub fn human_description(text: &str) -> &str {
    match text.rfind(MARKER) {
        Some(pos) if ProposalLink::decode(text).is_some() => text[..pos].trim_end(),
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip_keeps_address_and_index() {
        let link = ProposalLink::new(Pubkey::new_unique(), 42);
        let text = link.encode("Pay the auditors\nSecond paragraph");
        assert_eq!(ProposalLink::decode(&text), Some(link));
    }

    #[test]
    fn test_encoded_layout() {
        let multisig = Pubkey::new_unique();
        let text = ProposalLink::new(multisig, 3).encode("Grant");
        let expected = format!(
            "Grant\n\n--- MULTISIG TRANSACTION INFO ---\nMultisig Address: {}\nTransaction Index: 3\n----------------------------",
            multisig
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_missing_marker_is_absent() {
        assert_eq!(ProposalLink::decode(""), None);
        assert_eq!(ProposalLink::decode("Just a grant proposal"), None);
        assert_eq!(
            ProposalLink::decode("Mentions Multisig Address: and Transaction Index: 5 inline"),
            None
        );
    }

    #[test]
    fn test_marker_must_be_a_whole_line() {
        let text = format!(
            "see {}\nMultisig Address: {}\nTransaction Index: 1",
            MARKER,
            Pubkey::new_unique()
        );
        assert_eq!(ProposalLink::decode(&text), None);
    }

    #[test]
    fn test_corrupted_fields_are_absent() {
        let multisig = Pubkey::new_unique();
        let bad_index = format!("{}\nMultisig Address: {}\nTransaction Index: not-a-number", MARKER, multisig);
        let bad_address = format!("{}\nMultisig Address: nope\nTransaction Index: 4", MARKER);
        let truncated = format!("{}\nMultisig Address: {}", MARKER, multisig);

        assert_eq!(ProposalLink::decode(&bad_index), None);
        assert_eq!(ProposalLink::decode(&bad_address), None);
        assert_eq!(ProposalLink::decode(&truncated), None);
    }

    #[test]
    fn test_human_text_with_lookalike_lines_does_not_confuse_decoding() {
        let decoy = format!(
            "{}\nMultisig Address: garbage\nTransaction Index: 99",
            MARKER
        );
        let link = ProposalLink::new(Pubkey::new_unique(), 8);
        assert_eq!(ProposalLink::decode(&link.encode(&decoy)), Some(link));
    }

    #[test]
    fn test_crlf_descriptions_decode() {
        let link = ProposalLink::new(Pubkey::new_unique(), 11);
        let text = link.encode("Windows text").replace('\n', "\r\n");
        assert_eq!(ProposalLink::decode(&text), Some(link));
    }

    #[test]
    fn test_human_description_strips_block() {
        let link = ProposalLink::new(Pubkey::new_unique(), 2);
        assert_eq!(human_description(&link.encode("Pay Bob")), "Pay Bob");
        assert_eq!(human_description("Plain"), "Plain");
    }
}
