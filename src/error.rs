//! Error types for the loan relayer

use crate::types::{AssetId, Domain, LoanId};
use ethers::types::U256;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {tx_hash} reverted on chain {chain_id}")]
    Reverted { chain_id: u64, tx_hash: String },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error(transparent)]
    Collateral(#[from] CollateralError),

    #[error(transparent)]
    LoanLedger(#[from] LoanLedgerError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Loan {loan_id} not found")]
    LoanNotFound { loan_id: LoanId },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::ChainConnection { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::RateLimited { .. }
            | RelayerError::Database(_) => true,
            RelayerError::Collateral(e) => e.class().is_retryable(),
            RelayerError::LoanLedger(e) => e.class().is_retryable(),
            RelayerError::Relay(e) => e.class().is_retryable(),
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. } | RelayerError::Wallet(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

/// How the orchestrator reacts to an adapter error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport could not take the call; retry with backoff
    Transient,
    /// The call may or may not have landed; re-query ledger state before retrying
    Ambiguous,
    /// The ledger refused on business grounds; the error carries meaning
    Business,
    /// Anything else: halt this loan for operator intervention
    Unexpected,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Ambiguous)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Ambiguous => "ambiguous",
            ErrorClass::Business => "business",
            ErrorClass::Unexpected => "unexpected",
        }
    }
}

/// Errors from the source-chain collateral ledger
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollateralError {
    #[error("asset {asset_id} is already locked by loan {locked_by}")]
    AlreadyLocked { asset_id: AssetId, locked_by: LoanId },

    #[error("asset {0} is not approved for the collateral manager")]
    NotApproved(AssetId),

    #[error("asset {asset_id} is not locked by loan {loan_id}")]
    NotLockedByLoan { asset_id: AssetId, loan_id: LoanId },

    #[error("caller does not own asset {0}")]
    NotOwner(AssetId),

    #[error("asset {0} is not registered")]
    UnknownAsset(AssetId),

    #[error("collateral transaction outcome unknown: {0}")]
    Ambiguous(String),

    #[error("collateral ledger unavailable: {0}")]
    Unavailable(String),

    #[error("collateral call reverted: {0}")]
    Reverted(String),
}

impl CollateralError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CollateralError::AlreadyLocked { .. }
            | CollateralError::NotApproved(_)
            | CollateralError::NotLockedByLoan { .. }
            | CollateralError::NotOwner(_) => ErrorClass::Business,
            CollateralError::Ambiguous(_) => ErrorClass::Ambiguous,
            CollateralError::Unavailable(_) => ErrorClass::Transient,
            CollateralError::UnknownAsset(_) | CollateralError::Reverted(_) => {
                ErrorClass::Unexpected
            }
        }
    }
}

/// Errors from the destination-chain loan ledger
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoanLedgerError {
    #[error("loan {0} was already issued")]
    LoanAlreadyIssued(LoanId),

    #[error("insufficient liquidity: have {available}, need {requested}")]
    InsufficientLiquidity { available: U256, requested: U256 },

    #[error("loan {0} is not active")]
    LoanNotActive(LoanId),

    #[error("repayment of {paid} is below the {due} due")]
    AmountInsufficient { due: U256, paid: U256 },

    #[error("loan {0} is not overdue")]
    LoanNotOverdue(LoanId),

    #[error("loan {0} is unknown to the ledger")]
    UnknownLoan(LoanId),

    #[error("loan ledger transaction outcome unknown: {0}")]
    Ambiguous(String),

    #[error("loan ledger unavailable: {0}")]
    Unavailable(String),

    #[error("loan ledger call reverted: {0}")]
    Reverted(String),
}

impl LoanLedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LoanLedgerError::LoanAlreadyIssued(_)
            | LoanLedgerError::InsufficientLiquidity { .. }
            | LoanLedgerError::LoanNotActive(_)
            | LoanLedgerError::AmountInsufficient { .. }
            | LoanLedgerError::LoanNotOverdue(_) => ErrorClass::Business,
            LoanLedgerError::Ambiguous(_) => ErrorClass::Ambiguous,
            LoanLedgerError::Unavailable(_) => ErrorClass::Transient,
            LoanLedgerError::UnknownLoan(_) | LoanLedgerError::Reverted(_) => {
                ErrorClass::Unexpected
            }
        }
    }
}

/// Errors from the cross-chain message relay
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("dispatch outcome unknown: {0}")]
    Ambiguous(String),

    #[error("no route to domain {0}")]
    UnknownDomain(Domain),

    #[error("message encoding error: {0}")]
    Encoding(String),
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::RelayUnavailable(_) => ErrorClass::Transient,
            RelayError::Ambiguous(_) => ErrorClass::Ambiguous,
            RelayError::UnknownDomain(_) | RelayError::Encoding(_) => ErrorClass::Unexpected,
        }
    }
}

/// Map a transaction-layer failure onto the relay taxonomy
impl From<RelayerError> for RelayError {
    fn from(err: RelayerError) -> Self {
        match err {
            RelayerError::Timeout { operation } => RelayError::Ambiguous(operation),
            other => RelayError::RelayUnavailable(other.to_string()),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_classes() {
        let loan = LoanId([1u8; 32]);
        assert_eq!(
            CollateralError::NotApproved(AssetId(1)).class(),
            ErrorClass::Business
        );
        assert_eq!(
            CollateralError::Unavailable("rpc down".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            LoanLedgerError::LoanAlreadyIssued(loan).class(),
            ErrorClass::Business
        );
        assert_eq!(
            LoanLedgerError::UnknownLoan(loan).class(),
            ErrorClass::Unexpected
        );
        assert_eq!(
            RelayError::RelayUnavailable("mailbox paused".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_retryable_wraps_adapter_class() {
        let err: RelayerError = RelayError::Ambiguous("receipt".into()).into();
        assert!(err.is_retryable());
        let err: RelayerError = CollateralError::NotApproved(AssetId(3)).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_send_timeout_is_ambiguous_dispatch() {
        let err = RelayError::from(RelayerError::Timeout {
            operation: "dispatch receipt".into(),
        });
        assert_eq!(err.class(), ErrorClass::Ambiguous);
    }
}
