//! Durable per-loan state
//!
//! Handles:
//! - Loan tracking records (state, attempt count, last attempt, last observed event)
//! - Processed relay message ids for idempotent delivery
//! - Block checkpoints for restart recovery

mod memory;
mod postgres;

pub use memory::MemoryLoanStore;
pub use postgres::PgLoanStore;

use crate::error::RelayerResult;
use crate::relay::MessageId;
use crate::types::{Domain, LoanId, LoanRecord};

use async_trait::async_trait;
use ethers::types::Address;
use serde::Serialize;
use std::collections::BTreeMap;

/// Storage for the orchestrator's tracking table
#[async_trait]
pub trait LoanStore: Send + Sync {
    async fn upsert_loan(&self, record: &LoanRecord) -> RelayerResult<()>;

    async fn get_loan(&self, loan_id: &LoanId) -> RelayerResult<Option<LoanRecord>>;

    /// Every record not yet in a terminal state, halted ones included
    async fn loans_in_flight(&self) -> RelayerResult<Vec<LoanRecord>>;

    /// Every record for one borrower, newest first
    async fn loans_by_borrower(&self, borrower: Address) -> RelayerResult<Vec<LoanRecord>>;

    async fn is_message_processed(&self, message_id: &MessageId) -> RelayerResult<bool>;

    async fn record_message(&self, message_id: &MessageId, domain: Domain) -> RelayerResult<()>;

    async fn get_checkpoint(&self, domain: Domain) -> RelayerResult<u64>;

    async fn save_checkpoint(&self, domain: Domain, block_number: u64) -> RelayerResult<()>;

    async fn stats(&self) -> RelayerResult<LoanStats>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// Loan counts for the status API
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoanStats {
    pub total: u64,
    pub halted: u64,
    pub by_state: BTreeMap<String, u64>,
}

impl LoanStats {
    pub(crate) fn from_records<'a>(records: impl Iterator<Item = &'a LoanRecord>) -> Self {
        let mut stats = LoanStats::default();
        for record in records {
            stats.total += 1;
            if record.halted {
                stats.halted += 1;
            }
            *stats
                .by_state
                .entry(record.state().as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }
}
