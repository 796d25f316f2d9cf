//! Per-family mapping from raw chain error signatures to [`ChainRejection`]
//!
//! Nodes report HTLC reverts in different shapes: EVM nodes return either the
//! decoded custom error name or its 4-byte selector in the revert data,
//! Starknet returns Cairo short-string panics, and Solana returns Anchor
//! custom program error codes. Only this module knows those shapes.

use crate::config::NetworkFamily;
use crate::error::ChainRejection;

use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};

/// One signature -> rejection rule. Rules are matched in table order.
struct Rule {
    pattern: String,
    rejection: ChainRejection,
}

impl Rule {
    fn new(pattern: impl Into<String>, rejection: ChainRejection) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
            rejection,
        }
    }
}

/// 0x-prefixed 4-byte selector of a Solidity custom error
pub fn error_selector(signature: &str) -> String {
    let hash = Keccak256::digest(signature.as_bytes());
    format!("0x{}", hex::encode(&hash[..4]))
}

fn evm_custom_error(signature: &str, rejection: ChainRejection) -> [Rule; 2] {
    let name = signature.split('(').next().unwrap_or(signature);
    [
        Rule::new(error_selector(signature), rejection.clone()),
        Rule::new(name, rejection),
    ]
}

lazy_static! {
    static ref EVM_RULES: Vec<Rule> = {
        let mut rules = Vec::new();
        rules.extend(evm_custom_error("InvalidTimelock()", ChainRejection::InvalidTimelock));
        rules.extend(evm_custom_error("HashlockAlreadySet()", ChainRejection::HashlockAlreadySet));
        rules.extend(evm_custom_error("HTLCAlreadyExists()", ChainRejection::HtlcAlreadyExists));
        rules.extend(evm_custom_error("AlreadyClaimed()", ChainRejection::AlreadyClaimed));
        rules.push(Rule::new("replacement transaction underpriced", ChainRejection::Underpriced));
        rules.push(Rule::new("transaction underpriced", ChainRejection::Underpriced));
        rules.push(Rule::new("max fee per gas less than block base fee", ChainRejection::Underpriced));
        rules.push(Rule::new("fee cap less than block base fee", ChainRejection::Underpriced));
        rules.push(Rule::new("nonce too low", ChainRejection::NonceTooLow));
        rules.push(Rule::new("insufficient funds", ChainRejection::InsufficientFunds));
        rules
    };

    static ref STARKNET_RULES: Vec<Rule> = vec![
        Rule::new("Invalid TimeLock", ChainRejection::InvalidTimelock),
        Rule::new("Not Future TimeLock", ChainRejection::InvalidTimelock),
        Rule::new("Hashlock Already Set", ChainRejection::HashlockAlreadySet),
        Rule::new("HTLC Already Exists", ChainRejection::HtlcAlreadyExists),
        Rule::new("Already Claimed", ChainRejection::AlreadyClaimed),
        Rule::new("Insufficient max fee", ChainRejection::Underpriced),
        Rule::new("Max fee is smaller than the minimal transaction cost", ChainRejection::Underpriced),
        Rule::new("Invalid transaction nonce", ChainRejection::NonceTooLow),
        Rule::new("Exceeds balance", ChainRejection::InsufficientFunds),
    ];

    // Anchor custom errors start at 6000 (0x1770)
    static ref SOLANA_RULES: Vec<Rule> = vec![
        Rule::new("custom program error: 0x1770", ChainRejection::InvalidTimelock),
        Rule::new("custom program error: 0x1771", ChainRejection::HashlockAlreadySet),
        Rule::new("custom program error: 0x1772", ChainRejection::AlreadyClaimed),
        Rule::new("already in use", ChainRejection::HtlcAlreadyExists),
        Rule::new("block height exceeded", ChainRejection::Underpriced),
        Rule::new("insufficient lamports", ChainRejection::InsufficientFunds),
        Rule::new("found no record of a prior credit", ChainRejection::InsufficientFunds),
    ];
}

fn rules_for(family: NetworkFamily) -> &'static [Rule] {
    match family {
        NetworkFamily::Evm => &EVM_RULES,
        NetworkFamily::Starknet => &STARKNET_RULES,
        NetworkFamily::Solana => &SOLANA_RULES,
    }
}

/// Classify a raw error message (plus any revert data) from a node
pub fn classify(family: NetworkFamily, raw: &str) -> ChainRejection {
    let haystack = raw.to_lowercase();
    rules_for(family)
        .iter()
        .find(|rule| haystack.contains(&rule.pattern))
        .map(|rule| rule.rejection.clone())
        .unwrap_or_else(|| ChainRejection::Other(raw.to_string()))
}
