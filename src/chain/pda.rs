//! Program-derived addresses of the governance and multisig programs

use sha2::{Digest, Sha256};
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signer::Signer;

pub const GOVERNANCE_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("GovER5Lthms3bLBqWub97yVrMmEogzX7xNjdXpPPCVZw");
pub const MULTISIG_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("SQDS4ep65T869zMMBKyuUq6aD6EgTu8psMjkvj52pCf");
pub const TOKEN_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Vault used for every transfer this service builds
pub const DEFAULT_VAULT_INDEX: u8 = 0;

const GOVERNANCE_SEED: &[u8] = b"governance";
const ACCOUNT_GOVERNANCE_SEED: &[u8] = b"account-governance";
const NATIVE_TREASURY_SEED: &[u8] = b"native-treasury";
const REALM_CONFIG_SEED: &[u8] = b"realm-config";
const PROPOSAL_DEPOSIT_SEED: &[u8] = b"proposal-deposit";
const PROGRAM_CONFIG_SEED: &[u8] = b"program_config";
const MULTISIG_SEED: &[u8] = b"multisig";
const VAULT_SEED: &[u8] = b"vault";
const TRANSACTION_SEED: &[u8] = b"transaction";
const PROPOSAL_SEED: &[u8] = b"proposal";
const REALM_MULTISIG_DOMAIN: &[u8] = b"realm-multisig";

/// Longest realm name that still fits in a single PDA seed
pub const MAX_REALM_NAME_LEN: usize = 32;

pub fn realm(name: &str) -> Pubkey {
    Pubkey::find_program_address(&[GOVERNANCE_SEED, name.as_bytes()], &GOVERNANCE_PROGRAM_ID).0
}

/// Governance account of a realm, seeded with the realm address itself
pub fn governance(realm: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[ACCOUNT_GOVERNANCE_SEED, realm.as_ref(), realm.as_ref()],
        &GOVERNANCE_PROGRAM_ID,
    )
    .0
}

pub fn native_treasury(governance: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[NATIVE_TREASURY_SEED, governance.as_ref()], &GOVERNANCE_PROGRAM_ID).0
}

pub fn realm_config(realm: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[REALM_CONFIG_SEED, realm.as_ref()], &GOVERNANCE_PROGRAM_ID).0
}

/// Token account where the realm holds deposits of one governing mint
pub fn governing_token_holding(realm: &Pubkey, governing_token_mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[GOVERNANCE_SEED, realm.as_ref(), governing_token_mint.as_ref()],
        &GOVERNANCE_PROGRAM_ID,
    )
    .0
}

pub fn token_owner_record(realm: &Pubkey, governing_token_mint: &Pubkey, owner: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[
            GOVERNANCE_SEED,
            realm.as_ref(),
            governing_token_mint.as_ref(),
            owner.as_ref(),
        ],
        &GOVERNANCE_PROGRAM_ID,
    )
    .0
}

pub fn proposal(governance: &Pubkey, governing_token_mint: &Pubkey, seed: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[
            GOVERNANCE_SEED,
            governance.as_ref(),
            governing_token_mint.as_ref(),
            seed.as_ref(),
        ],
        &GOVERNANCE_PROGRAM_ID,
    )
    .0
}

pub fn proposal_deposit(proposal: &Pubkey, payer: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[PROPOSAL_DEPOSIT_SEED, proposal.as_ref(), payer.as_ref()],
        &GOVERNANCE_PROGRAM_ID,
    )
    .0
}

pub fn vote_record(proposal: &Pubkey, token_owner_record: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[GOVERNANCE_SEED, proposal.as_ref(), token_owner_record.as_ref()],
        &GOVERNANCE_PROGRAM_ID,
    )
    .0
}

pub fn proposal_transaction(proposal: &Pubkey, option_index: u8, index: u16) -> Pubkey {
    Pubkey::find_program_address(
        &[
            GOVERNANCE_SEED,
            proposal.as_ref(),
            &[option_index],
            &index.to_le_bytes(),
        ],
        &GOVERNANCE_PROGRAM_ID,
    )
    .0
}

/// Global multisig program settings, including the creation fee treasury
pub fn program_config() -> Pubkey {
    Pubkey::find_program_address(&[MULTISIG_SEED, PROGRAM_CONFIG_SEED], &MULTISIG_PROGRAM_ID).0
}

pub fn multisig(create_key: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[MULTISIG_SEED, MULTISIG_SEED, create_key.as_ref()],
        &MULTISIG_PROGRAM_ID,
    )
    .0
}

pub fn vault(multisig: &Pubkey, index: u8) -> Pubkey {
    Pubkey::find_program_address(
        &[MULTISIG_SEED, multisig.as_ref(), VAULT_SEED, &[index]],
        &MULTISIG_PROGRAM_ID,
    )
    .0
}

pub fn vault_transaction(multisig: &Pubkey, transaction_index: u64) -> Pubkey {
    Pubkey::find_program_address(
        &[
            MULTISIG_SEED,
            multisig.as_ref(),
            TRANSACTION_SEED,
            &transaction_index.to_le_bytes(),
        ],
        &MULTISIG_PROGRAM_ID,
    )
    .0
}

pub fn multisig_proposal(multisig: &Pubkey, transaction_index: u64) -> Pubkey {
    Pubkey::find_program_address(
        &[
            MULTISIG_SEED,
            multisig.as_ref(),
            TRANSACTION_SEED,
            &transaction_index.to_le_bytes(),
            PROPOSAL_SEED,
        ],
        &MULTISIG_PROGRAM_ID,
    )
    .0
}

pub fn associated_token_account(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

/// Create key of the multisig that belongs to a realm.
///
/// The secret is a hash of the realm address, so every process derives the
/// same key without a registry.
pub fn realm_create_key(realm: &Pubkey) -> Keypair {
    let mut hasher = Sha256::new();
    hasher.update(REALM_MULTISIG_DOMAIN);
    hasher.update(realm.as_ref());
    let secret: [u8; 32] = hasher.finalize().into();
    Keypair::new_from_array(secret)
}

pub fn realm_multisig(realm: &Pubkey) -> Pubkey {
    multisig(&realm_create_key(realm).pubkey())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realm_multisig_is_deterministic() {
        let realm = realm("Treasury DAO");
        assert_eq!(realm_multisig(&realm), realm_multisig(&realm));
        assert_ne!(realm_multisig(&realm), realm_multisig(&Pubkey::new_unique()));
    }

    #[test]
    fn test_transaction_and_proposal_addresses_differ_per_index() {
        let multisig = Pubkey::new_unique();
        assert_ne!(vault_transaction(&multisig, 1), vault_transaction(&multisig, 2));
        assert_ne!(vault_transaction(&multisig, 1), multisig_proposal(&multisig, 1));
    }

    #[test]
    fn test_associated_token_account_depends_on_owner_and_mint() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let ata = associated_token_account(&owner, &mint);
        assert_eq!(ata, associated_token_account(&owner, &mint));
        assert_ne!(ata, associated_token_account(&Pubkey::new_unique(), &mint));
        assert_ne!(ata, associated_token_account(&owner, &Pubkey::new_unique()));
    }

    #[test]
    fn test_governance_chain_is_stable() {
        let realm = realm("Council");
        let governance = governance(&realm);
        assert_eq!(native_treasury(&governance), native_treasury(&governance));
        assert_ne!(native_treasury(&governance), governance);
    }
}
