//! End-to-end loan lifecycles over the local transport, driven step by step
//! on a manual clock.

use super::LoanEngine;
use crate::config::local_test_settings;
use crate::devnet::{Devnet, LoanApplication};
use crate::events::{EventMeta, LedgerEvent, ObservedEvent};
use crate::ledger::{CollateralLedger, LoanLedger};
use crate::relay::CrossChainMessage;
use crate::state::{LoanStore, MemoryLoanStore};
use crate::types::{AssetId, Clock, LoanId, LoanRecord, LoanState};

use chrono::{TimeZone, Utc};
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tokio::sync::broadcast;

const ASSET: AssetId = AssetId(1);
const PRINCIPAL: &str = "1000000000000000000";

struct Harness {
    devnet: Arc<Devnet>,
    store: Arc<dyn LoanStore>,
    engine: Arc<LoanEngine>,
    events: broadcast::Receiver<ObservedEvent>,
    deliveries: broadcast::Receiver<CrossChainMessage>,
    /// Every event the engine was fed, in order
    seen: Vec<ObservedEvent>,
    borrower: Address,
}

impl Harness {
    async fn new() -> Self {
        let store: Arc<dyn LoanStore> = Arc::new(MemoryLoanStore::new());
        let clock = Clock::manual(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let devnet = Arc::new(
            Devnet::with_clock(&local_test_settings(), store.clone(), clock)
                .await
                .unwrap(),
        );
        let engine = Self::engine(&devnet, &store);
        let events = devnet.subscribe_events();
        let deliveries = devnet.relay().subscribe();

        let borrower = Address::repeat_byte(0xb0);
        let harness = Self {
            devnet,
            store,
            engine,
            events,
            deliveries,
            seen: Vec::new(),
            borrower,
        };
        harness.register(ASSET).await;
        harness
    }

    fn engine(devnet: &Devnet, store: &Arc<dyn LoanStore>) -> Arc<LoanEngine> {
        Arc::new(LoanEngine::new(
            devnet.engine_config(),
            store.clone(),
            devnet.adapters(),
            devnet.clock().clone(),
        ))
    }

    async fn register(&self, asset_id: AssetId) {
        self.devnet
            .collateral()
            .register_asset(asset_id, self.borrower, format!("ipfs://asset-{}", asset_id));
        self.devnet
            .approve_collateral(asset_id, self.borrower)
            .await
            .unwrap();
    }

    fn request(&self, asset_id: AssetId) -> LoanId {
        self.request_amount(asset_id, PRINCIPAL)
    }

    fn request_amount(&self, asset_id: AssetId, amount: &str) -> LoanId {
        self.devnet
            .request_loan(&LoanApplication {
                asset_id: asset_id.0,
                borrower: self.borrower,
                amount: amount.to_string(),
                duration_days: 30,
                destination_chain: "arbitrum".to_string(),
            })
            .unwrap()
    }

    /// Feed events to the engine and deliveries to the inboxes until both are quiet
    async fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(observed) = self.events.try_recv() {
                self.seen.push(observed.clone());
                self.engine.handle_event(observed).await.unwrap();
                progressed = true;
            }
            while let Ok(message) = self.deliveries.try_recv() {
                // A refused delivery stays unprocessed; the engine's retry covers it
                let _ = self.devnet.deliver(&message).await;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Move the clock past every backoff and phase timeout, then tick
    async fn advance_and_tick(&mut self, by: chrono::Duration) {
        self.devnet.clock().advance(by);
        self.engine.tick(self.devnet.clock().now()).await.unwrap();
        self.pump().await;
    }

    async fn record(&self, loan_id: LoanId) -> LoanRecord {
        self.store.get_loan(&loan_id).await.unwrap().unwrap()
    }

    async fn state(&self, loan_id: LoanId) -> LoanState {
        self.record(loan_id).await.state()
    }

    async fn locked_by(&self, asset_id: AssetId) -> Option<LoanId> {
        self.devnet
            .collateral()
            .asset(asset_id)
            .await
            .unwrap()
            .unwrap()
            .locked_by
    }
}

fn hour() -> chrono::Duration {
    chrono::Duration::hours(1)
}

#[tokio::test]
async fn test_repaid_loan_returns_collateral() {
    let mut h = Harness::new().await;
    let loan_id = h.request_amount(ASSET, "350000000000000000");
    h.pump().await;

    let record = h.record(loan_id).await;
    assert_eq!(record.state(), LoanState::Active);
    assert_eq!(record.attempt_count, 0);
    let (issued_at, due_at) = (record.loan.issued_at.unwrap(), record.loan.due_at.unwrap());
    assert_eq!(due_at - issued_at, chrono::Duration::days(30));
    assert_eq!(h.locked_by(ASSET).await, Some(loan_id));

    // Day 10: nothing to do yet
    h.advance_and_tick(chrono::Duration::days(10)).await;
    assert_eq!(h.state(loan_id).await, LoanState::Active);

    let paid = h.devnet.repay_loan(loan_id).await.unwrap();
    // 5% on 0.35 ether
    assert_eq!(paid, U256::from_dec_str("367500000000000000").unwrap());
    h.pump().await;

    assert_eq!(h.state(loan_id).await, LoanState::CollateralReleased);
    assert_eq!(h.locked_by(ASSET).await, None);
    assert_eq!(h.devnet.relay().dispatched().await.len(), 2);
}

#[tokio::test]
async fn test_overdue_loan_defaults_and_keeps_collateral() {
    let mut h = Harness::new().await;
    let loan_id = h.request(ASSET);
    h.pump().await;
    assert_eq!(h.state(loan_id).await, LoanState::Active);

    // Not due yet
    h.advance_and_tick(chrono::Duration::days(29)).await;
    assert_eq!(h.state(loan_id).await, LoanState::Active);

    h.advance_and_tick(chrono::Duration::days(2)).await;
    assert_eq!(h.state(loan_id).await, LoanState::Defaulted);
    assert_eq!(h.locked_by(ASSET).await, Some(loan_id));

    // Terminal: repayment after default is refused by the ledger
    assert!(h.devnet.repay_loan(loan_id).await.is_err());
}

#[tokio::test]
async fn test_refused_dispatch_is_retried() {
    let mut h = Harness::new().await;
    h.devnet.relay().refuse_next(2).await;

    let loan_id = h.request(ASSET);
    h.pump().await;
    let record = h.record(loan_id).await;
    assert_eq!(record.state(), LoanState::CollateralLocked);
    assert_eq!(record.attempt_count, 1);
    assert!(record.last_error.is_some());

    h.advance_and_tick(hour()).await;
    assert_eq!(h.state(loan_id).await, LoanState::CollateralLocked);

    h.advance_and_tick(hour()).await;
    assert_eq!(h.state(loan_id).await, LoanState::Active);
    assert_eq!(h.devnet.relay().dispatched().await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_locked_event_moves_once() {
    let mut h = Harness::new().await;
    let loan_id = h.request(ASSET);
    h.pump().await;
    assert_eq!(h.state(loan_id).await, LoanState::Active);

    let locked = h
        .seen
        .iter()
        .find(|o| matches!(o.event, LedgerEvent::Locked { .. }))
        .cloned()
        .unwrap();
    h.engine.handle_event(locked).await.unwrap();
    h.pump().await;

    assert_eq!(h.state(loan_id).await, LoanState::Active);
    assert_eq!(h.devnet.relay().dispatched().await.len(), 1);
}

#[tokio::test]
async fn test_refused_issue_budget_fails_loan() {
    let mut h = Harness::new().await;
    let max_attempts = h.engine.config().max_attempts;
    h.devnet.relay().refuse_next(max_attempts).await;

    let loan_id = h.request(ASSET);
    h.pump().await;
    for _ in 0..10 {
        if h.state(loan_id).await == LoanState::Failed {
            break;
        }
        h.advance_and_tick(hour()).await;
    }

    let record = h.record(loan_id).await;
    assert_eq!(record.state(), LoanState::Failed);
    assert_eq!(record.attempt_count, max_attempts + 1);
    assert_eq!(h.locked_by(ASSET).await, None);
    assert!(h.devnet.relay().dispatched().await.is_empty());
    assert!(h.devnet.loans().loan(loan_id).await.unwrap().is_none());
    assert!(!h.seen.iter().any(|o| matches!(o.event, LedgerEvent::Issued { .. })));
}

#[tokio::test]
async fn test_undelivered_issue_refunds_collateral() {
    let mut h = Harness::new().await;
    let destination = h.devnet.destination_domain();
    h.devnet.relay().drop_to(destination).await;

    let loan_id = h.request(ASSET);
    h.pump().await;
    assert_eq!(h.state(loan_id).await, LoanState::MessageSentToDest);

    for _ in 0..10 {
        if h.state(loan_id).await == LoanState::Failed {
            break;
        }
        h.advance_and_tick(hour()).await;
    }

    let record = h.record(loan_id).await;
    assert_eq!(record.state(), LoanState::Failed);
    assert_eq!(h.locked_by(ASSET).await, None);
    // One dispatch per attempt in the budget
    let max_attempts = h.engine.config().max_attempts as usize;
    assert_eq!(h.devnet.relay().dispatched().await.len(), max_attempts);

    // A copy that finally lands has expired: no funds go out against returned collateral
    h.devnet.relay().restore(destination).await;
    let liquidity = h.devnet.loans().available_liquidity().await;
    for message in h.devnet.relay().dispatched().await {
        assert!(h.devnet.relay().redeliver(&message.id).await);
    }
    h.pump().await;
    assert_eq!(h.state(loan_id).await, LoanState::Failed);
    assert!(h.devnet.loans().loan(loan_id).await.unwrap().is_none());
    assert_eq!(h.devnet.loans().available_liquidity().await, liquidity);
    assert_eq!(h.locked_by(ASSET).await, None);
}

#[tokio::test]
async fn test_duplicate_delivery_issues_once() {
    let mut h = Harness::new().await;
    let liquidity = h.devnet.loans().available_liquidity().await;

    let loan_id = h.request(ASSET);
    h.pump().await;
    assert_eq!(h.state(loan_id).await, LoanState::Active);

    let issue = h.devnet.relay().dispatched().await[0].id;
    assert!(h.devnet.relay().redeliver(&issue).await);
    h.pump().await;

    let principal = U256::from_dec_str(PRINCIPAL).unwrap();
    assert_eq!(h.devnet.loans().available_liquidity().await, liquidity - principal);
    assert_eq!(h.state(loan_id).await, LoanState::Active);
}

#[tokio::test]
async fn test_reordered_deliveries_settle_every_loan() {
    let mut h = Harness::new().await;
    h.register(AssetId(2)).await;
    h.devnet.relay().hold().await;

    let first = h.request(ASSET);
    let second = h.request(AssetId(2));
    h.pump().await;
    assert_eq!(h.state(first).await, LoanState::MessageSentToDest);
    assert_eq!(h.state(second).await, LoanState::MessageSentToDest);

    assert_eq!(h.devnet.relay().flush_held(true).await, 2);
    h.pump().await;
    assert_eq!(h.state(first).await, LoanState::Active);
    assert_eq!(h.state(second).await, LoanState::Active);

    // Repay the later loan first
    h.devnet.repay_loan(second).await.unwrap();
    h.pump().await;
    assert_eq!(h.state(second).await, LoanState::CollateralReleased);
    assert_eq!(h.state(first).await, LoanState::Active);
    assert_eq!(h.locked_by(ASSET).await, Some(first));
}

/// Active loans hold their asset; released or failed ones never do
async fn assert_custody_matches(h: &Harness, loans: &[(LoanId, AssetId)]) {
    for (loan_id, asset_id) in loans {
        let state = h.state(*loan_id).await;
        let held = h.locked_by(*asset_id).await == Some(*loan_id);
        match state {
            LoanState::Active | LoanState::Defaulted => assert!(held, "{} in {}", loan_id, state),
            LoanState::CollateralReleased | LoanState::Failed => {
                assert!(!held, "{} in {}", loan_id, state)
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_interleaved_loans_keep_custody_consistent() {
    let mut h = Harness::new().await;
    let assets: Vec<AssetId> = (1..=5).map(AssetId).collect();
    for asset_id in &assets[1..] {
        h.register(*asset_id).await;
    }
    h.devnet.relay().hold().await;

    let loans: Vec<(LoanId, AssetId)> = assets.iter().map(|a| (h.request(*a), *a)).collect();
    h.pump().await;
    assert_custody_matches(&h, &loans).await;

    // Issue messages land newest first
    assert_eq!(h.devnet.relay().flush_held(true).await, loans.len());
    h.pump().await;
    for (loan_id, _) in &loans {
        assert_eq!(h.state(*loan_id).await, LoanState::Active);
    }
    assert_custody_matches(&h, &loans).await;

    // Repay two out of order with releases held, then release them newest first
    h.devnet.relay().hold().await;
    h.devnet.repay_loan(loans[3].0).await.unwrap();
    h.pump().await;
    h.devnet.repay_loan(loans[1].0).await.unwrap();
    h.pump().await;
    assert_custody_matches(&h, &loans).await;

    assert_eq!(h.devnet.relay().flush_held(true).await, 2);
    h.pump().await;
    assert_eq!(h.state(loans[1].0).await, LoanState::CollateralReleased);
    assert_eq!(h.state(loans[3].0).await, LoanState::CollateralReleased);

    // The rest run past their due date
    h.advance_and_tick(chrono::Duration::days(31)).await;
    for index in [0, 2, 4] {
        assert_eq!(h.state(loans[index].0).await, LoanState::Defaulted);
    }
    assert_custody_matches(&h, &loans).await;
}

#[tokio::test]
async fn test_restart_reconciles_missed_events() {
    let mut h = Harness::new().await;
    h.devnet.relay().hold().await;

    let loan_id = h.request(ASSET);
    h.pump().await;
    assert_eq!(h.state(loan_id).await, LoanState::MessageSentToDest);

    // Engine goes down; the issue lands and its Issued event is never seen
    h.devnet.relay().flush_held(false).await;
    while let Ok(message) = h.deliveries.try_recv() {
        h.devnet.deliver(&message).await.unwrap();
    }
    h.events = h.devnet.subscribe_events();

    h.engine = Harness::engine(&h.devnet, &h.store);
    assert_eq!(h.engine.recover().await.unwrap(), 1);

    h.advance_and_tick(hour()).await;
    assert_eq!(h.state(loan_id).await, LoanState::Active);
    // Reconciled from the ledger, not re-dispatched
    assert_eq!(h.devnet.relay().dispatched().await.len(), 1);
}

#[tokio::test]
async fn test_halt_is_isolated_to_one_loan() {
    let mut h = Harness::new().await;
    let source = h.devnet.source_domain();
    let unregistered = AssetId(77);
    let nonce = U256::from(1000);
    let stuck = LoanId::derive(source, unregistered, h.borrower, nonce);

    // A request against an asset the registry does not know
    h.engine
        .handle_event(ObservedEvent {
            meta: EventMeta {
                domain: source,
                block_number: 1,
                tx_hash: H256::repeat_byte(0x99),
                log_index: 0,
                timestamp: h.devnet.clock().now(),
            },
            event: LedgerEvent::LoanRequested {
                loan_id: stuck,
                asset_id: unregistered,
                borrower: h.borrower,
                principal: U256::from_dec_str(PRINCIPAL).unwrap(),
                interest_rate_bps: 500,
                duration_secs: 30 * 86_400,
                destination_domain: h.devnet.destination_domain(),
                nonce,
            },
        })
        .await
        .unwrap();
    let record = h.record(stuck).await;
    assert!(record.halted);
    assert_eq!(record.state(), LoanState::Requested);

    let healthy = h.request(ASSET);
    h.pump().await;
    h.advance_and_tick(hour()).await;
    assert_eq!(h.state(healthy).await, LoanState::Active);
    assert!(h.record(stuck).await.halted);

    // Operator fixes the registry and resumes
    h.register(unregistered).await;
    let resumed = h.engine.resume(stuck).await.unwrap();
    assert!(!resumed.halted);
    h.advance_and_tick(hour()).await;
    assert_eq!(h.state(stuck).await, LoanState::Active);
    assert_eq!(h.locked_by(unregistered).await, Some(stuck));
}
