//! HTLC event types and parsing
//!
//! Defines the two domain events the solver reacts to and decodes them from
//! EVM logs emitted by the HTLC contract.

use crate::error::{SolverError, SolverResult};

use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A user committed funds on the source chain and expects a lock on the destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcCommitEvent {
    pub swap_id: String,
    pub sender: String,
    pub source_receiver: String,
    pub source_network: String,
    pub source_asset: String,
    pub destination_network: String,
    pub destination_address: String,
    pub destination_asset: String,
    pub amount: U256,
    pub timelock: u64,
    pub transaction_id: String,
    pub block_number: u64,
}

/// A hashlock was attached to a previously committed HTLC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcLockEvent {
    pub swap_id: String,
    pub hashlock: String,
    pub timelock: u64,
    pub transaction_id: String,
    pub block_number: u64,
}

/// Everything decoded from one block range, in chain order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScannedEvents {
    pub commits: Vec<HtlcCommitEvent>,
    pub locks: Vec<HtlcLockEvent>,
}

impl ScannedEvents {
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.locks.is_empty()
    }

    pub fn extend(&mut self, other: ScannedEvents) {
        self.commits.extend(other.commits);
        self.locks.extend(other.locks);
    }
}

/// Dedup key of a commit event in the scanner window
pub fn commit_key(transaction_id: &str) -> String {
    format!("commit:{}", transaction_id.to_lowercase())
}

/// Dedup key of a lock event in the scanner window
pub fn lock_key(transaction_id: &str) -> String {
    format!("lock:{}", transaction_id.to_lowercase())
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    pub const HTLC_COMMIT_SIGNATURE: &str =
        "HTLCCommit(bytes32,address,address,string,string,string,string,uint256,uint256)";
    pub const HTLC_LOCK_ADDED_SIGNATURE: &str = "HTLCLockAdded(bytes32,bytes32,uint256)";

    lazy_static! {
        pub static ref HTLC_COMMIT: H256 = H256::from(keccak256(HTLC_COMMIT_SIGNATURE));
        pub static ref HTLC_LOCK_ADDED: H256 = H256::from(keccak256(HTLC_LOCK_ADDED_SIGNATURE));
    }
}

/// Decoded log, before it is split into commits and locks
#[derive(Debug, Clone, PartialEq)]
pub enum HtlcEvent {
    Commit(HtlcCommitEvent),
    Lock(HtlcLockEvent),
}

/// Event parser for the HTLC contract of one network
pub struct EventParser {
    network: String,
}

impl EventParser {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
        }
    }

    /// Parse a log entry. Logs with unrelated topics yield `None`.
    pub fn parse_log(&self, log: &Log) -> SolverResult<Option<HtlcEvent>> {
        let topic = match log.topics.first() {
            Some(topic) => *topic,
            None => return Ok(None),
        };

        if topic == *topics::HTLC_COMMIT {
            self.parse_commit(log).map(|e| Some(HtlcEvent::Commit(e)))
        } else if topic == *topics::HTLC_LOCK_ADDED {
            self.parse_lock(log).map(|e| Some(HtlcEvent::Lock(e)))
        } else {
            Ok(None)
        }
    }

    /// Parse a batch of logs, preserving order. Logs that fail to decode are
    /// skipped so one malformed event cannot stall the range.
    pub fn parse_logs(&self, logs: &[Log]) -> ScannedEvents {
        let mut scanned = ScannedEvents::default();
        for log in logs {
            match self.parse_log(log) {
                Ok(Some(HtlcEvent::Commit(commit))) => scanned.commits.push(commit),
                Ok(Some(HtlcEvent::Lock(lock))) => scanned.locks.push(lock),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Skipping undecodable HTLC log on {} (tx {:?}, block {:?}): {}",
                        self.network, log.transaction_hash, log.block_number, e
                    );
                    crate::metrics::record_malformed_event(&self.network);
                }
            }
        }
        scanned
    }

    fn parse_commit(&self, log: &Log) -> SolverResult<HtlcCommitEvent> {
        let (transaction_id, block_number) = log_position(log)?;

        // id, sender and source receiver are indexed
        let swap_id = topic_at(log, 1)?;
        let sender = Address::from_slice(&topic_at(log, 2)?.0[12..32]);
        let source_receiver = Address::from_slice(&topic_at(log, 3)?.0[12..32]);

        let tokens = abi::decode(
            &[
                ParamType::String,
                ParamType::String,
                ParamType::String,
                ParamType::String,
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
            &log.data,
        )
        .map_err(|e| SolverError::EventParsing(format!("HTLCCommit data: {}", e)))?;

        let mut tokens = tokens.into_iter();
        let source_asset = next_string(&mut tokens)?;
        let destination_network = next_string(&mut tokens)?;
        let destination_address = next_string(&mut tokens)?;
        let destination_asset = next_string(&mut tokens)?;
        let amount = next_uint(&mut tokens)?;
        let timelock = next_uint(&mut tokens)?;

        Ok(HtlcCommitEvent {
            swap_id: format!("{:#x}", swap_id),
            sender: format!("{:#x}", sender),
            source_receiver: format!("{:#x}", source_receiver),
            source_network: self.network.clone(),
            source_asset,
            destination_network,
            destination_address,
            destination_asset,
            amount,
            timelock: to_u64(timelock, "timelock")?,
            transaction_id,
            block_number,
        })
    }

    fn parse_lock(&self, log: &Log) -> SolverResult<HtlcLockEvent> {
        let (transaction_id, block_number) = log_position(log)?;
        let swap_id = topic_at(log, 1)?;

        let tokens = abi::decode(&[ParamType::FixedBytes(32), ParamType::Uint(256)], &log.data)
            .map_err(|e| SolverError::EventParsing(format!("HTLCLockAdded data: {}", e)))?;

        let mut tokens = tokens.into_iter();
        let hashlock = match tokens.next() {
            Some(Token::FixedBytes(bytes)) => format!("0x{}", hex::encode(bytes)),
            other => {
                return Err(SolverError::EventParsing(format!(
                    "expected hashlock, got {:?}",
                    other
                )))
            }
        };
        let timelock = next_uint(&mut tokens)?;

        Ok(HtlcLockEvent {
            swap_id: format!("{:#x}", swap_id),
            hashlock,
            timelock: to_u64(timelock, "timelock")?,
            transaction_id,
            block_number,
        })
    }
}

fn log_position(log: &Log) -> SolverResult<(String, u64)> {
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| SolverError::EventParsing("log without transaction hash".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| SolverError::EventParsing("log without block number".to_string()))?;
    Ok((format!("{:#x}", tx_hash), block_number.as_u64()))
}

fn topic_at(log: &Log, index: usize) -> SolverResult<H256> {
    log.topics
        .get(index)
        .copied()
        .ok_or_else(|| SolverError::EventParsing(format!("missing topic {}", index)))
}

fn next_string(tokens: &mut impl Iterator<Item = Token>) -> SolverResult<String> {
    match tokens.next() {
        Some(Token::String(s)) => Ok(s),
        other => Err(SolverError::EventParsing(format!("expected string, got {:?}", other))),
    }
}

fn next_uint(tokens: &mut impl Iterator<Item = Token>) -> SolverResult<U256> {
    match tokens.next() {
        Some(Token::Uint(v)) => Ok(v),
        other => Err(SolverError::EventParsing(format!("expected uint, got {:?}", other))),
    }
}

fn to_u64(value: U256, field: &str) -> SolverResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(SolverError::EventParsing(format!("{} out of range: {}", field, value)));
    }
    Ok(value.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address_topic(byte: u8) -> H256 {
        let mut raw = [0u8; 32];
        raw[12..].copy_from_slice(&[byte; 20]);
        H256::from(raw)
    }

    fn log_with(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            topics,
            data: data.into(),
            transaction_hash: Some(H256::repeat_byte(0xab)),
            block_number: Some(U64::from(42u64)),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_commit() {
        let data = abi::encode(&[
            Token::String("USDC".into()),
            Token::String("STARKNET_SEPOLIA".into()),
            Token::String("0x0abc".into()),
            Token::String("USDC".into()),
            Token::Uint(U256::from(1_000_000u64)),
            Token::Uint(U256::from(1_700_000_000u64)),
        ]);
        let log = log_with(
            vec![
                *topics::HTLC_COMMIT,
                H256::repeat_byte(0x11),
                address_topic(0x22),
                address_topic(0x33),
            ],
            data,
        );

        let parser = EventParser::new("ETHEREUM_SEPOLIA");
        let event = parser.parse_log(&log).unwrap();
        let commit = match event {
            Some(HtlcEvent::Commit(commit)) => commit,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(commit.swap_id, format!("0x{}", "11".repeat(32)));
        assert_eq!(commit.sender, format!("0x{}", "22".repeat(20)));
        assert_eq!(commit.source_network, "ETHEREUM_SEPOLIA");
        assert_eq!(commit.destination_network, "STARKNET_SEPOLIA");
        assert_eq!(commit.amount, U256::from(1_000_000u64));
        assert_eq!(commit.timelock, 1_700_000_000);
        assert_eq!(commit.block_number, 42);
        assert_eq!(commit.transaction_id, format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn test_parse_lock_and_skip_unknown() {
        let data = abi::encode(&[
            Token::FixedBytes(vec![0x44; 32]),
            Token::Uint(U256::from(99u64)),
        ]);
        let lock_log = log_with(vec![*topics::HTLC_LOCK_ADDED, H256::repeat_byte(0x11)], data);
        let unrelated = log_with(vec![H256::repeat_byte(0x99)], vec![]);

        let scanned = EventParser::new("eth").parse_logs(&[unrelated, lock_log]);

        assert!(scanned.commits.is_empty());
        assert_eq!(scanned.locks.len(), 1);
        assert_eq!(scanned.locks[0].hashlock, format!("0x{}", "44".repeat(32)));
        assert_eq!(scanned.locks[0].timelock, 99);
    }

    #[test]
    fn test_truncated_data_is_a_parse_error() {
        let log = log_with(vec![*topics::HTLC_LOCK_ADDED, H256::repeat_byte(0x11)], vec![0u8; 8]);
        assert!(matches!(
            EventParser::new("eth").parse_log(&log),
            Err(SolverError::EventParsing(_))
        ));
    }

    #[test]
    fn test_out_of_range_timelock_does_not_drop_the_batch() {
        let hostile = log_with(
            vec![
                *topics::HTLC_COMMIT,
                H256::repeat_byte(0x11),
                address_topic(0x22),
                address_topic(0x33),
            ],
            abi::encode(&[
                Token::String("USDC".into()),
                Token::String("ARBITRUM_SEPOLIA".into()),
                Token::String("0x0abc".into()),
                Token::String("USDC".into()),
                Token::Uint(U256::from(1_000u64)),
                Token::Uint(U256::MAX),
            ]),
        );
        let lock = log_with(
            vec![*topics::HTLC_LOCK_ADDED, H256::repeat_byte(0x55)],
            abi::encode(&[Token::FixedBytes(vec![0x44; 32]), Token::Uint(U256::from(7u64))]),
        );

        let scanned = EventParser::new("eth").parse_logs(&[hostile, lock]);

        assert!(scanned.commits.is_empty());
        assert_eq!(scanned.locks.len(), 1);
        assert_eq!(scanned.locks[0].swap_id, format!("0x{}", "55".repeat(32)));
        assert_eq!(scanned.locks[0].timelock, 7);
    }

    #[test]
    fn test_dedup_keys_are_kind_scoped() {
        assert_ne!(commit_key("0xAB"), lock_key("0xab"));
        assert_eq!(commit_key("0xAB"), commit_key("0xab"));
    }
}
