//! Ledger event types and parsing
//!
//! Defines the events emitted by the IP registry, collateral manager,
//! loan manager and mailbox contracts, in the shape the orchestrator
//! consumes them.

use crate::error::{RelayerError, RelayerResult};
use crate::relay::MessageId;
use crate::types::{AssetId, Domain, LoanId};

use chrono::{DateTime, TimeZone, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use serde::{Deserialize, Serialize};

/// Something a ledger reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// Borrower asked for a loan against an approved asset
    LoanRequested {
        loan_id: LoanId,
        asset_id: AssetId,
        borrower: Address,
        principal: U256,
        interest_rate_bps: u32,
        duration_secs: u64,
        destination_domain: Domain,
        nonce: U256,
    },
    Approved {
        asset_id: AssetId,
        operator: Address,
    },
    Locked {
        asset_id: AssetId,
        loan_id: LoanId,
    },
    Released {
        asset_id: AssetId,
        loan_id: LoanId,
    },
    Issued {
        loan_id: LoanId,
        borrower: Address,
        principal: U256,
        due_at: DateTime<Utc>,
    },
    Repaid {
        loan_id: LoanId,
        amount: U256,
    },
    Defaulted {
        loan_id: LoanId,
    },
    /// A relay message was handled by its recipient
    MessageProcessed {
        message_id: MessageId,
    },
    Unknown {
        topic: H256,
    },
}

impl LedgerEvent {
    /// Event name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::LoanRequested { .. } => "loan_requested",
            LedgerEvent::Approved { .. } => "approved",
            LedgerEvent::Locked { .. } => "locked",
            LedgerEvent::Released { .. } => "released",
            LedgerEvent::Issued { .. } => "issued",
            LedgerEvent::Repaid { .. } => "repaid",
            LedgerEvent::Defaulted { .. } => "defaulted",
            LedgerEvent::MessageProcessed { .. } => "message_processed",
            LedgerEvent::Unknown { .. } => "unknown",
        }
    }

    pub fn loan_id(&self) -> Option<LoanId> {
        match self {
            LedgerEvent::LoanRequested { loan_id, .. }
            | LedgerEvent::Locked { loan_id, .. }
            | LedgerEvent::Released { loan_id, .. }
            | LedgerEvent::Issued { loan_id, .. }
            | LedgerEvent::Repaid { loan_id, .. }
            | LedgerEvent::Defaulted { loan_id } => Some(*loan_id),
            _ => None,
        }
    }
}

/// Where and when an event was finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub domain: Domain,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedEvent {
    pub meta: EventMeta,
    pub event: LedgerEvent,
}

impl ObservedEvent {
    /// Stable identifier of this log: `domain:txhash:logindex`
    pub fn id(&self) -> String {
        format!(
            "{}:{:?}:{}",
            self.meta.domain, self.meta.tx_hash, self.meta.log_index
        )
    }
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    fn topic(signature: &str) -> H256 {
        H256::from(keccak256(signature.as_bytes()))
    }

    lazy_static! {
        // CollateralManager
        pub static ref LOAN_REQUESTED: H256 =
            topic("LoanRequested(bytes32,uint256,address,uint256,uint32,uint64,uint32,uint256)");
        pub static ref COLLATERAL_LOCKED: H256 = topic("CollateralLocked(uint256,bytes32)");
        pub static ref COLLATERAL_RELEASED: H256 = topic("CollateralReleased(uint256,bytes32)");
        // IP registry (ERC-721)
        pub static ref APPROVAL: H256 = topic("Approval(address,address,uint256)");
        // LoanManager
        pub static ref LOAN_ISSUED: H256 = topic("LoanIssued(bytes32,address,uint256,uint64)");
        pub static ref LOAN_REPAID: H256 = topic("LoanRepaid(bytes32,uint256)");
        pub static ref LOAN_DEFAULTED: H256 = topic("LoanDefaulted(bytes32)");
        // Mailbox
        pub static ref DISPATCH_ID: H256 = topic("DispatchId(bytes32)");
        pub static ref PROCESS_ID: H256 = topic("ProcessId(bytes32)");
    }
}

/// Decodes contract logs from one domain
pub struct EventParser {
    domain: Domain,
}

impl EventParser {
    pub fn new(domain: Domain) -> Self {
        Self { domain }
    }

    /// Parse a log entry observed in a block with the given timestamp
    pub fn parse_log(&self, log: &Log, timestamp: DateTime<Utc>) -> RelayerResult<ObservedEvent> {
        let meta = EventMeta {
            domain: self.domain,
            block_number: log.block_number.map(|b| b.as_u64()).unwrap_or(0),
            tx_hash: log.transaction_hash.unwrap_or_default(),
            log_index: log.log_index.map(|i| i.as_u64()).unwrap_or(0),
            timestamp,
        };

        let topic = log.topics.first().copied().unwrap_or_default();
        let event = if topic == *topics::LOAN_REQUESTED {
            let data = decode_data(
                &[
                    ParamType::Uint(256),
                    ParamType::Uint(32),
                    ParamType::Uint(64),
                    ParamType::Uint(32),
                    ParamType::Uint(256),
                ],
                log,
            )?;
            LedgerEvent::LoanRequested {
                loan_id: topic_loan_id(log, 1)?,
                asset_id: topic_asset_id(log, 2)?,
                borrower: topic_address(log, 3)?,
                principal: uint(&data[0])?,
                interest_rate_bps: uint(&data[1])?.low_u32(),
                duration_secs: uint(&data[2])?.low_u64(),
                destination_domain: uint(&data[3])?.low_u32(),
                nonce: uint(&data[4])?,
            }
        } else if topic == *topics::COLLATERAL_LOCKED {
            LedgerEvent::Locked {
                asset_id: topic_asset_id(log, 1)?,
                loan_id: topic_loan_id(log, 2)?,
            }
        } else if topic == *topics::COLLATERAL_RELEASED {
            LedgerEvent::Released {
                asset_id: topic_asset_id(log, 1)?,
                loan_id: topic_loan_id(log, 2)?,
            }
        } else if topic == *topics::APPROVAL {
            LedgerEvent::Approved {
                operator: topic_address(log, 2)?,
                asset_id: topic_asset_id(log, 3)?,
            }
        } else if topic == *topics::LOAN_ISSUED {
            let data = decode_data(&[ParamType::Uint(256), ParamType::Uint(64)], log)?;
            let due_secs = uint(&data[1])?.low_u64() as i64;
            LedgerEvent::Issued {
                loan_id: topic_loan_id(log, 1)?,
                borrower: topic_address(log, 2)?,
                principal: uint(&data[0])?,
                due_at: Utc.timestamp_opt(due_secs, 0).single().ok_or_else(|| {
                    RelayerError::EventParsing(format!("invalid due timestamp {}", due_secs))
                })?,
            }
        } else if topic == *topics::LOAN_REPAID {
            let data = decode_data(&[ParamType::Uint(256)], log)?;
            LedgerEvent::Repaid {
                loan_id: topic_loan_id(log, 1)?,
                amount: uint(&data[0])?,
            }
        } else if topic == *topics::LOAN_DEFAULTED {
            LedgerEvent::Defaulted {
                loan_id: topic_loan_id(log, 1)?,
            }
        } else if topic == *topics::PROCESS_ID {
            LedgerEvent::MessageProcessed {
                message_id: MessageId(topic_word(log, 1)?.0),
            }
        } else {
            LedgerEvent::Unknown { topic }
        };

        Ok(ObservedEvent { meta, event })
    }
}

fn topic_word(log: &Log, index: usize) -> RelayerResult<H256> {
    log.topics.get(index).copied().ok_or_else(|| {
        RelayerError::EventParsing(format!(
            "log {:?} is missing topic {}",
            log.transaction_hash, index
        ))
    })
}

fn topic_loan_id(log: &Log, index: usize) -> RelayerResult<LoanId> {
    Ok(LoanId(topic_word(log, index)?.0))
}

fn topic_asset_id(log: &Log, index: usize) -> RelayerResult<AssetId> {
    let word = topic_word(log, index)?;
    Ok(AssetId(U256::from_big_endian(word.as_bytes()).low_u64()))
}

fn topic_address(log: &Log, index: usize) -> RelayerResult<Address> {
    Ok(Address::from_slice(&topic_word(log, index)?.0[12..32]))
}

fn decode_data(types: &[ParamType], log: &Log) -> RelayerResult<Vec<Token>> {
    abi::decode(types, &log.data).map_err(|e| RelayerError::EventParsing(e.to_string()))
}

fn uint(token: &Token) -> RelayerResult<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| RelayerError::EventParsing("expected uint".to_string()))
}
