//! Ledger adapters
//!
//! The collateral ledger lives on the source chain and custodies IP assets;
//! the loan ledger lives on the destination chain and holds loan funds.
//! Both report typed errors so the orchestrator can tell a retryable
//! transport failure from a business refusal.

pub mod evm;
pub mod memory;
pub mod recipient;

pub use evm::{EvmCollateralLedger, EvmLoanLedger};
pub use memory::{MemoryCollateralLedger, MemoryLoanLedger};
pub use recipient::{CollateralRecipient, LoanRecipient};

use crate::error::{CollateralError, LoanLedgerError};
use crate::types::{AssetId, Domain, LoanId};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use serde::Serialize;

/// Custody state of one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetView {
    pub asset_id: AssetId,
    pub owner: Address,
    pub approved_operator: Option<Address>,
    pub locked_by: Option<LoanId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerLoanStatus {
    Active,
    Repaid,
    Defaulted,
}

/// A loan as the destination ledger sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoanView {
    pub loan_id: LoanId,
    pub borrower: Address,
    pub principal: U256,
    pub repayment_due: U256,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub status: LedgerLoanStatus,
}

/// Source-chain NFT custody
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CollateralLedger: Send + Sync {
    fn domain(&self) -> Domain;

    /// The collateral manager: the operator an asset must approve before locking
    fn manager(&self) -> Address;

    /// Approve `operator` on behalf of `owner`
    async fn approve(
        &self,
        asset_id: AssetId,
        owner: Address,
        operator: Address,
    ) -> Result<(), CollateralError>;

    /// Lock for `loan_id`; locking again for the same loan succeeds without effect
    async fn lock(&self, asset_id: AssetId, loan_id: LoanId) -> Result<(), CollateralError>;

    /// Release a lock held by `loan_id`; releasing an unlocked asset succeeds without effect
    async fn release(&self, asset_id: AssetId, loan_id: LoanId) -> Result<(), CollateralError>;

    async fn asset(&self, asset_id: AssetId) -> Result<Option<AssetView>, CollateralError>;

    async fn token_uri(&self, asset_id: AssetId) -> Result<String, CollateralError>;
}

/// Destination-chain loan funds and lifecycle
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoanLedger: Send + Sync {
    fn domain(&self) -> Domain;

    async fn issue_loan(
        &self,
        loan_id: LoanId,
        borrower: Address,
        principal: U256,
        interest_rate_bps: u32,
        due_at: DateTime<Utc>,
    ) -> Result<(), LoanLedgerError>;

    async fn record_repayment(&self, loan_id: LoanId, amount: U256)
        -> Result<(), LoanLedgerError>;

    async fn mark_defaulted(&self, loan_id: LoanId) -> Result<(), LoanLedgerError>;

    async fn loan(&self, loan_id: LoanId) -> Result<Option<LoanView>, LoanLedgerError>;
}
