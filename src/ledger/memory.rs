//! In-process ledgers for the local transport and tests
//!
//! Each mutation that changes state emits an [`ObservedEvent`] on the
//! shared event bus, stamped with the ledger's domain, a fresh block
//! number and the shared clock.

use super::{AssetView, CollateralLedger, LedgerLoanStatus, LoanLedger, LoanView};
use crate::error::{CollateralError, LoanLedgerError};
use crate::events::{EventMeta, LedgerEvent, ObservedEvent};
use crate::types::{repayment_due, AssetId, Clock, Domain, LoanId};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Block production and fault injection shared by both in-memory ledgers
struct LocalChain {
    domain: Domain,
    clock: Clock,
    block: AtomicU64,
    events: broadcast::Sender<ObservedEvent>,
    unavailable_next: AtomicU32,
    ambiguous_next: AtomicU32,
}

enum Fault {
    Unavailable,
    Ambiguous,
}

impl LocalChain {
    fn new(domain: Domain, clock: Clock, events: broadcast::Sender<ObservedEvent>) -> Self {
        Self {
            domain,
            clock,
            block: AtomicU64::new(0),
            events,
            unavailable_next: AtomicU32::new(0),
            ambiguous_next: AtomicU32::new(0),
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Refusals happen before the call takes effect
    fn refuse(&self) -> bool {
        Self::take(&self.unavailable_next)
    }

    /// Ambiguous outcomes happen after the call took effect
    fn lose_receipt(&self) -> bool {
        Self::take(&self.ambiguous_next)
    }

    fn emit(&self, event: LedgerEvent) {
        let block_number = self.block.fetch_add(1, Ordering::SeqCst) + 1;
        let mut hasher = Keccak256::new();
        hasher.update(self.domain.to_be_bytes());
        hasher.update(block_number.to_be_bytes());
        let tx_hash = H256::from_slice(&hasher.finalize());

        debug!("Domain {} block {}: {}", self.domain, block_number, event.name());
        let _ = self.events.send(ObservedEvent {
            meta: EventMeta {
                domain: self.domain,
                block_number,
                tx_hash,
                log_index: 0,
                timestamp: self.clock.now(),
            },
            event,
        });
    }
}

struct AssetEntry {
    owner: Address,
    approved_operator: Option<Address>,
    locked_by: Option<LoanId>,
    token_uri: String,
}

/// Collateral manager plus IP registry on a local source chain
pub struct MemoryCollateralLedger {
    chain: LocalChain,
    manager: Address,
    assets: DashMap<AssetId, AssetEntry>,
    request_nonce: AtomicU64,
}

impl MemoryCollateralLedger {
    pub fn new(
        domain: Domain,
        manager: Address,
        clock: Clock,
        events: broadcast::Sender<ObservedEvent>,
    ) -> Self {
        Self {
            chain: LocalChain::new(domain, clock, events),
            manager,
            assets: DashMap::new(),
            request_nonce: AtomicU64::new(0),
        }
    }

    /// Mint an asset to `owner`
    pub fn register_asset(&self, asset_id: AssetId, owner: Address, token_uri: impl Into<String>) {
        self.assets.insert(
            asset_id,
            AssetEntry {
                owner,
                approved_operator: None,
                locked_by: None,
                token_uri: token_uri.into(),
            },
        );
    }

    /// Make the next `count` mutating calls fail before taking effect
    pub fn fail_next(&self, count: u32) {
        self.chain.unavailable_next.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` mutating calls take effect but report an unknown outcome
    pub fn lose_next_receipts(&self, count: u32) {
        self.chain.ambiguous_next.store(count, Ordering::SeqCst);
    }

    /// Borrower intake: validate the asset and announce a new loan request
    pub fn request_loan(
        &self,
        asset_id: AssetId,
        borrower: Address,
        principal: U256,
        interest_rate_bps: u32,
        duration_secs: u64,
        destination_domain: Domain,
    ) -> Result<LoanId, CollateralError> {
        {
            let entry = self
                .assets
                .get(&asset_id)
                .ok_or(CollateralError::UnknownAsset(asset_id))?;
            if entry.owner != borrower {
                return Err(CollateralError::NotOwner(asset_id));
            }
            if entry.approved_operator != Some(self.manager) {
                return Err(CollateralError::NotApproved(asset_id));
            }
            if let Some(locked_by) = entry.locked_by {
                return Err(CollateralError::AlreadyLocked {
                    asset_id,
                    locked_by,
                });
            }
        }

        let nonce = U256::from(self.request_nonce.fetch_add(1, Ordering::SeqCst) + 1);
        let loan_id = LoanId::derive(self.chain.domain, asset_id, borrower, nonce);
        self.chain.emit(LedgerEvent::LoanRequested {
            loan_id,
            asset_id,
            borrower,
            principal,
            interest_rate_bps,
            duration_secs,
            destination_domain,
            nonce,
        });
        Ok(loan_id)
    }

    fn unavailable(&self) -> CollateralError {
        CollateralError::Unavailable(format!("domain {} unreachable", self.chain.domain))
    }

    fn ambiguous(&self) -> CollateralError {
        CollateralError::Ambiguous(format!("domain {} receipt lost", self.chain.domain))
    }
}

#[async_trait]
impl CollateralLedger for MemoryCollateralLedger {
    fn domain(&self) -> Domain {
        self.chain.domain
    }

    fn manager(&self) -> Address {
        self.manager
    }

    async fn approve(
        &self,
        asset_id: AssetId,
        owner: Address,
        operator: Address,
    ) -> Result<(), CollateralError> {
        if self.chain.refuse() {
            return Err(self.unavailable());
        }
        {
            let mut entry = self
                .assets
                .get_mut(&asset_id)
                .ok_or(CollateralError::UnknownAsset(asset_id))?;
            if entry.owner != owner {
                return Err(CollateralError::NotOwner(asset_id));
            }
            entry.approved_operator = Some(operator);
        }
        self.chain.emit(LedgerEvent::Approved { asset_id, operator });
        Ok(())
    }

    async fn lock(&self, asset_id: AssetId, loan_id: LoanId) -> Result<(), CollateralError> {
        if self.chain.refuse() {
            return Err(self.unavailable());
        }
        {
            let mut entry = self
                .assets
                .get_mut(&asset_id)
                .ok_or(CollateralError::UnknownAsset(asset_id))?;
            match entry.locked_by {
                Some(holder) if holder == loan_id => return Ok(()),
                Some(locked_by) => {
                    return Err(CollateralError::AlreadyLocked {
                        asset_id,
                        locked_by,
                    })
                }
                None => {}
            }
            if entry.approved_operator != Some(self.manager) {
                return Err(CollateralError::NotApproved(asset_id));
            }
            entry.locked_by = Some(loan_id);
        }
        self.chain.emit(LedgerEvent::Locked { asset_id, loan_id });
        if self.chain.lose_receipt() {
            return Err(self.ambiguous());
        }
        Ok(())
    }

    async fn release(&self, asset_id: AssetId, loan_id: LoanId) -> Result<(), CollateralError> {
        if self.chain.refuse() {
            return Err(self.unavailable());
        }
        {
            let mut entry = self
                .assets
                .get_mut(&asset_id)
                .ok_or(CollateralError::UnknownAsset(asset_id))?;
            match entry.locked_by {
                None => return Ok(()),
                Some(holder) if holder != loan_id => {
                    return Err(CollateralError::NotLockedByLoan { asset_id, loan_id })
                }
                Some(_) => {
                    entry.locked_by = None;
                    entry.approved_operator = None;
                }
            }
        }
        self.chain.emit(LedgerEvent::Released { asset_id, loan_id });
        if self.chain.lose_receipt() {
            return Err(self.ambiguous());
        }
        Ok(())
    }

    async fn asset(&self, asset_id: AssetId) -> Result<Option<AssetView>, CollateralError> {
        Ok(self.assets.get(&asset_id).map(|entry| AssetView {
            asset_id,
            owner: entry.owner,
            approved_operator: entry.approved_operator,
            locked_by: entry.locked_by,
        }))
    }

    async fn token_uri(&self, asset_id: AssetId) -> Result<String, CollateralError> {
        self.assets
            .get(&asset_id)
            .map(|entry| entry.token_uri.clone())
            .ok_or(CollateralError::UnknownAsset(asset_id))
    }
}

struct LoanEntry {
    borrower: Address,
    principal: U256,
    interest_rate_bps: u32,
    issued_at: DateTime<Utc>,
    due_at: DateTime<Utc>,
    status: LedgerLoanStatus,
}

struct LoanBook {
    liquidity: U256,
    loans: HashMap<LoanId, LoanEntry>,
}

/// Loan manager with a single liquidity pool on a local destination chain
pub struct MemoryLoanLedger {
    chain: LocalChain,
    book: Mutex<LoanBook>,
}

impl MemoryLoanLedger {
    pub fn new(
        domain: Domain,
        liquidity: U256,
        clock: Clock,
        events: broadcast::Sender<ObservedEvent>,
    ) -> Self {
        Self {
            chain: LocalChain::new(domain, clock, events),
            book: Mutex::new(LoanBook {
                liquidity,
                loans: HashMap::new(),
            }),
        }
    }

    pub async fn available_liquidity(&self) -> U256 {
        self.book.lock().await.liquidity
    }

    pub fn fail_next(&self, count: u32) {
        self.chain.unavailable_next.store(count, Ordering::SeqCst);
    }

    pub fn lose_next_receipts(&self, count: u32) {
        self.chain.ambiguous_next.store(count, Ordering::SeqCst);
    }

    fn unavailable(&self) -> LoanLedgerError {
        LoanLedgerError::Unavailable(format!("domain {} unreachable", self.chain.domain))
    }

    fn ambiguous(&self) -> LoanLedgerError {
        LoanLedgerError::Ambiguous(format!("domain {} receipt lost", self.chain.domain))
    }
}

#[async_trait]
impl LoanLedger for MemoryLoanLedger {
    fn domain(&self) -> Domain {
        self.chain.domain
    }

    async fn issue_loan(
        &self,
        loan_id: LoanId,
        borrower: Address,
        principal: U256,
        interest_rate_bps: u32,
        due_at: DateTime<Utc>,
    ) -> Result<(), LoanLedgerError> {
        if self.chain.refuse() {
            return Err(self.unavailable());
        }
        let now = self.chain.clock.now();
        {
            let mut book = self.book.lock().await;
            if book.loans.contains_key(&loan_id) {
                return Err(LoanLedgerError::LoanAlreadyIssued(loan_id));
            }
            if due_at <= now {
                return Err(LoanLedgerError::Reverted(format!(
                    "due date {} is not after issuance {}",
                    due_at, now
                )));
            }
            if repayment_due(principal, interest_rate_bps).is_none() {
                return Err(LoanLedgerError::Reverted(format!(
                    "repayment on principal {} overflows",
                    principal
                )));
            }
            if book.liquidity < principal {
                return Err(LoanLedgerError::InsufficientLiquidity {
                    available: book.liquidity,
                    requested: principal,
                });
            }
            book.liquidity -= principal;
            book.loans.insert(
                loan_id,
                LoanEntry {
                    borrower,
                    principal,
                    interest_rate_bps,
                    issued_at: now,
                    due_at,
                    status: LedgerLoanStatus::Active,
                },
            );
        }
        self.chain.emit(LedgerEvent::Issued {
            loan_id,
            borrower,
            principal,
            due_at,
        });
        if self.chain.lose_receipt() {
            return Err(self.ambiguous());
        }
        Ok(())
    }

    async fn record_repayment(
        &self,
        loan_id: LoanId,
        amount: U256,
    ) -> Result<(), LoanLedgerError> {
        if self.chain.refuse() {
            return Err(self.unavailable());
        }
        {
            let mut book = self.book.lock().await;
            let entry = book
                .loans
                .get_mut(&loan_id)
                .ok_or(LoanLedgerError::UnknownLoan(loan_id))?;
            if entry.status != LedgerLoanStatus::Active {
                return Err(LoanLedgerError::LoanNotActive(loan_id));
            }
            let due = repayment_due(entry.principal, entry.interest_rate_bps)
                .ok_or_else(|| LoanLedgerError::Reverted("repayment overflows".to_string()))?;
            if amount < due {
                return Err(LoanLedgerError::AmountInsufficient { due, paid: amount });
            }
            entry.status = LedgerLoanStatus::Repaid;
            book.liquidity += amount;
        }
        self.chain.emit(LedgerEvent::Repaid { loan_id, amount });
        Ok(())
    }

    async fn mark_defaulted(&self, loan_id: LoanId) -> Result<(), LoanLedgerError> {
        if self.chain.refuse() {
            return Err(self.unavailable());
        }
        let now = self.chain.clock.now();
        {
            let mut book = self.book.lock().await;
            let entry = book
                .loans
                .get_mut(&loan_id)
                .ok_or(LoanLedgerError::UnknownLoan(loan_id))?;
            match entry.status {
                LedgerLoanStatus::Defaulted => return Ok(()),
                LedgerLoanStatus::Repaid => return Err(LoanLedgerError::LoanNotActive(loan_id)),
                LedgerLoanStatus::Active => {}
            }
            if now <= entry.due_at {
                return Err(LoanLedgerError::LoanNotOverdue(loan_id));
            }
            entry.status = LedgerLoanStatus::Defaulted;
        }
        self.chain.emit(LedgerEvent::Defaulted { loan_id });
        if self.chain.lose_receipt() {
            return Err(self.ambiguous());
        }
        Ok(())
    }

    async fn loan(&self, loan_id: LoanId) -> Result<Option<LoanView>, LoanLedgerError> {
        let book = self.book.lock().await;
        Ok(book.loans.get(&loan_id).map(|entry| LoanView {
            loan_id,
            borrower: entry.borrower,
            principal: entry.principal,
            // Issuance refuses terms whose repayment overflows
            repayment_due: repayment_due(entry.principal, entry.interest_rate_bps)
                .unwrap_or(U256::MAX),
            issued_at: entry.issued_at,
            due_at: entry.due_at,
            status: entry.status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    const SOURCE: Domain = 1;
    const DESTINATION: Domain = 2;

    fn clock() -> Clock {
        Clock::manual(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn collateral() -> (MemoryCollateralLedger, broadcast::Receiver<ObservedEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let ledger = MemoryCollateralLedger::new(SOURCE, Address::repeat_byte(0xcc), clock(), tx);
        ledger.register_asset(AssetId(5), Address::repeat_byte(0x01), "ipfs://asset-5");
        (ledger, rx)
    }

    #[tokio::test]
    async fn test_lock_requires_approval_and_is_idempotent_per_loan() {
        let (ledger, mut rx) = collateral();
        let owner = Address::repeat_byte(0x01);
        let loan = LoanId([1u8; 32]);

        assert_eq!(
            ledger.lock(AssetId(5), loan).await,
            Err(CollateralError::NotApproved(AssetId(5)))
        );

        assert_ok!(ledger.approve(AssetId(5), owner, ledger.manager()).await);
        assert_ok!(ledger.lock(AssetId(5), loan).await);
        assert_ok!(ledger.lock(AssetId(5), loan).await);

        let other = LoanId([2u8; 32]);
        assert_eq!(
            ledger.lock(AssetId(5), other).await,
            Err(CollateralError::AlreadyLocked {
                asset_id: AssetId(5),
                locked_by: loan
            })
        );

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event.name())
            .collect();
        assert_eq!(names, vec!["approved", "locked"]);
    }

    #[tokio::test]
    async fn test_release_rules() {
        let (ledger, _rx) = collateral();
        let owner = Address::repeat_byte(0x01);
        let loan = LoanId([1u8; 32]);
        ledger.approve(AssetId(5), owner, ledger.manager()).await.unwrap();
        ledger.lock(AssetId(5), loan).await.unwrap();

        assert_eq!(
            ledger.release(AssetId(5), LoanId([9u8; 32])).await,
            Err(CollateralError::NotLockedByLoan {
                asset_id: AssetId(5),
                loan_id: LoanId([9u8; 32])
            })
        );
        assert_ok!(ledger.release(AssetId(5), loan).await);
        assert_ok!(ledger.release(AssetId(5), loan).await);

        let view = ledger.asset(AssetId(5)).await.unwrap().unwrap();
        assert_eq!(view.locked_by, None);
        assert_eq!(view.approved_operator, None);
    }

    #[tokio::test]
    async fn test_request_loan_derives_unique_ids() {
        let (ledger, mut rx) = collateral();
        let owner = Address::repeat_byte(0x01);
        assert_eq!(
            ledger.request_loan(AssetId(5), owner, U256::one(), 500, 86_400, DESTINATION),
            Err(CollateralError::NotApproved(AssetId(5)))
        );
        ledger.approve(AssetId(5), owner, ledger.manager()).await.unwrap();
        let _ = rx.try_recv();

        let first = ledger
            .request_loan(AssetId(5), owner, U256::one(), 500, 86_400, DESTINATION)
            .unwrap();
        let second = ledger
            .request_loan(AssetId(5), owner, U256::one(), 500, 86_400, DESTINATION)
            .unwrap();
        assert_ne!(first, second);

        match rx.try_recv().unwrap().event {
            LedgerEvent::LoanRequested { loan_id, nonce, .. } => {
                assert_eq!(loan_id, first);
                assert_eq!(loan_id, LoanId::derive(SOURCE, AssetId(5), owner, nonce));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_loan_ledger_issue_repay_default() {
        let (tx, _rx) = broadcast::channel(64);
        let clock = clock();
        let ledger = MemoryLoanLedger::new(DESTINATION, U256::from(1000), clock.clone(), tx);
        let borrower = Address::repeat_byte(0x02);
        let due = clock.now() + chrono::Duration::days(30);
        let loan = LoanId([3u8; 32]);

        assert_eq!(
            ledger
                .issue_loan(loan, borrower, U256::from(5000), 500, due)
                .await,
            Err(LoanLedgerError::InsufficientLiquidity {
                available: U256::from(1000),
                requested: U256::from(5000)
            })
        );
        assert_ok!(ledger.issue_loan(loan, borrower, U256::from(400), 500, due).await);
        assert_eq!(
            ledger.issue_loan(loan, borrower, U256::from(400), 500, due).await,
            Err(LoanLedgerError::LoanAlreadyIssued(loan))
        );
        assert_eq!(ledger.available_liquidity().await, U256::from(600));

        assert_eq!(
            ledger.mark_defaulted(loan).await,
            Err(LoanLedgerError::LoanNotOverdue(loan))
        );
        assert_eq!(
            ledger.record_repayment(loan, U256::from(419)).await,
            Err(LoanLedgerError::AmountInsufficient {
                due: U256::from(420),
                paid: U256::from(419)
            })
        );
        assert_ok!(ledger.record_repayment(loan, U256::from(420)).await);
        assert_eq!(
            ledger.record_repayment(loan, U256::from(420)).await,
            Err(LoanLedgerError::LoanNotActive(loan))
        );

        let other = LoanId([4u8; 32]);
        ledger.issue_loan(other, borrower, U256::from(100), 500, due).await.unwrap();
        clock.advance(chrono::Duration::days(31));
        assert_ok!(ledger.mark_defaulted(other).await);
        assert_ok!(ledger.mark_defaulted(other).await);
        assert_eq!(
            ledger.loan(other).await.unwrap().unwrap().status,
            LedgerLoanStatus::Defaulted
        );
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let (ledger, _rx) = collateral();
        let owner = Address::repeat_byte(0x01);
        ledger.approve(AssetId(5), owner, ledger.manager()).await.unwrap();

        ledger.fail_next(1);
        assert!(matches!(
            ledger.lock(AssetId(5), LoanId([1u8; 32])).await,
            Err(CollateralError::Unavailable(_))
        ));
        assert_eq!(ledger.asset(AssetId(5)).await.unwrap().unwrap().locked_by, None);

        ledger.lose_next_receipts(1);
        assert!(matches!(
            ledger.lock(AssetId(5), LoanId([1u8; 32])).await,
            Err(CollateralError::Ambiguous(_))
        ));
        assert_eq!(
            ledger.asset(AssetId(5)).await.unwrap().unwrap().locked_by,
            Some(LoanId([1u8; 32]))
        );
    }
}
