//! In-process loan store for the local transport and tests

use super::{LoanStats, LoanStore};
use crate::error::RelayerResult;
use crate::relay::MessageId;
use crate::types::{Domain, LoanId, LoanRecord};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ethers::types::Address;

#[derive(Default)]
pub struct MemoryLoanStore {
    loans: DashMap<LoanId, LoanRecord>,
    messages: DashSet<MessageId>,
    checkpoints: DashMap<Domain, u64>,
}

impl MemoryLoanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoanStore for MemoryLoanStore {
    async fn upsert_loan(&self, record: &LoanRecord) -> RelayerResult<()> {
        self.loans.insert(record.loan_id(), record.clone());
        Ok(())
    }

    async fn get_loan(&self, loan_id: &LoanId) -> RelayerResult<Option<LoanRecord>> {
        Ok(self.loans.get(loan_id).map(|r| r.clone()))
    }

    async fn loans_in_flight(&self) -> RelayerResult<Vec<LoanRecord>> {
        Ok(self
            .loans
            .iter()
            .filter(|r| !r.state().is_terminal())
            .map(|r| r.clone())
            .collect())
    }

    async fn loans_by_borrower(&self, borrower: Address) -> RelayerResult<Vec<LoanRecord>> {
        let mut records: Vec<LoanRecord> = self
            .loans
            .iter()
            .filter(|r| r.loan.borrower == borrower)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn is_message_processed(&self, message_id: &MessageId) -> RelayerResult<bool> {
        Ok(self.messages.contains(message_id))
    }

    async fn record_message(&self, message_id: &MessageId, _domain: Domain) -> RelayerResult<()> {
        self.messages.insert(*message_id);
        Ok(())
    }

    async fn get_checkpoint(&self, domain: Domain) -> RelayerResult<u64> {
        Ok(self.checkpoints.get(&domain).map(|b| *b).unwrap_or(0))
    }

    async fn save_checkpoint(&self, domain: Domain, block_number: u64) -> RelayerResult<()> {
        self.checkpoints.insert(domain, block_number);
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<LoanStats> {
        let records: Vec<LoanRecord> = self.loans.iter().map(|r| r.clone()).collect();
        Ok(LoanStats::from_records(records.iter()))
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
