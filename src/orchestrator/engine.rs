//! Loan orchestration engine
//!
//! Consumes normalized ledger events and a periodic tick, drives each loan
//! through the transition table, and talks to the ledgers and relays.
//! Every loan is processed under its own mutex so a late event and a
//! timeout check never act on the same loan at once. Events for one loan
//! apply in arrival order; different loans never wait on each other.

use super::machine::{next_state, Trigger};
use crate::config::Settings;
use crate::error::{CollateralError, ErrorClass, LoanLedgerError, RelayError, RelayerError, RelayerResult};
use crate::events::{EventMeta, LedgerEvent, ObservedEvent};
use crate::ledger::{CollateralLedger, LedgerLoanStatus, LoanLedger, LoanView};
use crate::metrics;
use crate::relay::backoff::to_chrono;
use crate::relay::{Backoff, MessageBody, RelayClient};
use crate::state::LoanStore;
use crate::types::{repayment_due, AssetId, Clock, Domain, Loan, LoanId, LoanRecord, LoanState};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use ethers::types::{Address, U256};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub source_domain: Domain,
    pub destination_domain: Domain,
    /// Recipient of release messages on the source chain
    pub collateral_manager: Address,
    /// Recipient of issue messages on the destination chain
    pub loan_manager: Address,
    /// Attempt budget per phase
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub issue_timeout: Duration,
    pub release_timeout: Duration,
}

impl EngineConfig {
    pub fn new(settings: &Settings, collateral_manager: Address, loan_manager: Address) -> Self {
        Self {
            source_domain: settings.source.domain,
            destination_domain: settings.destination.domain,
            collateral_manager,
            loan_manager,
            max_attempts: settings.relayer.max_dispatch_attempts,
            backoff: settings.relayer.backoff(),
            issue_timeout: settings.relayer.issue_timeout(),
            release_timeout: settings.relayer.release_timeout(),
        }
    }
}

/// Ledger and relay handles the engine drives
pub struct Adapters {
    pub collateral: Arc<dyn CollateralLedger>,
    pub loans: Arc<dyn LoanLedger>,
    /// Dispatches from the source chain (issue messages)
    pub source_relay: Arc<dyn RelayClient>,
    /// Dispatches from the destination chain (release messages)
    pub destination_relay: Arc<dyn RelayClient>,
}

pub struct LoanEngine {
    config: EngineConfig,
    store: Arc<dyn LoanStore>,
    adapters: Adapters,
    clock: Clock,
    locks: DashMap<LoanId, Arc<Mutex<()>>>,
    ticking: Arc<AtomicBool>,
    shutdown: Arc<RwLock<bool>>,
}

impl LoanEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LoanStore>,
        adapters: Adapters,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            store,
            adapters,
            clock,
            locks: DashMap::new(),
            ticking: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Report what a restart picks up; the first tick resumes each loan from its stored state
    pub async fn recover(&self) -> RelayerResult<usize> {
        let records = self.store.loans_in_flight().await?;
        let halted = records.iter().filter(|r| r.halted).count();
        metrics::set_loans_in_flight(records.len());
        info!(
            "Recovered {} in-flight loans ({} halted awaiting operator)",
            records.len(),
            halted
        );
        for record in records.iter().filter(|r| r.halted) {
            warn!(
                "Loan {} is halted in {}: {}",
                record.loan_id(),
                record.state(),
                record.last_error.as_deref().unwrap_or("no reason recorded")
            );
        }
        Ok(records.len())
    }

    /// Main loop: events fan out per loan, plus a background tick that never overlaps itself
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ObservedEvent>,
        tick_interval: Duration,
    ) -> RelayerResult<()> {
        info!("Loan engine started (tick every {:?})", tick_interval);
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Last queued handler per loan; the next event for that loan waits on it
        let mut queued: HashMap<LoanId, JoinHandle<()>> = HashMap::new();

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                received = events.recv() => match received {
                    Ok(observed) => self.clone().enqueue(&mut queued, observed).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The tick reconciles whatever these events would have moved
                        warn!("Engine lagged behind the event bus, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, stopping engine");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    queued.retain(|_, handler| !handler.is_finished());
                    if self.ticking.swap(true, Ordering::SeqCst) {
                        debug!("Previous tick still running");
                        continue;
                    }
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let now = engine.clock.now();
                        if let Err(e) = engine.tick(now).await {
                            error!("Engine tick failed: {}", e);
                        }
                        engine.ticking.store(false, Ordering::SeqCst);
                    });
                }
            }
        }

        info!("Loan engine stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Hand an event to a task queued behind the previous event for the same loan
    ///
    /// Bus order is chain order, so a Locked never overtakes its request.
    async fn enqueue(
        self: Arc<Self>,
        queued: &mut HashMap<LoanId, JoinHandle<()>>,
        observed: ObservedEvent,
    ) {
        let Some(loan_id) = observed.event.loan_id() else {
            // Nothing to order against; these are dropped without I/O
            let id = observed.id();
            if let Err(e) = self.handle_event(observed).await {
                error!("Failed to handle event {}: {}", id, e);
            }
            return;
        };

        let previous = queued.remove(&loan_id);
        let handler = tokio::spawn(async move {
            if let Some(previous) = previous {
                // A panicked predecessor must not wedge the loan
                let _ = previous.await;
            }
            let id = observed.id();
            if let Err(e) = self.handle_event(observed).await {
                error!("Failed to handle event {}: {}", id, e);
            }
        });
        queued.insert(loan_id, handler);
    }

    /// Apply one observed event to the loan it names
    pub async fn handle_event(&self, observed: ObservedEvent) -> RelayerResult<()> {
        metrics::record_event_received(observed.meta.domain, observed.event.name());
        let now = self.clock.now();

        let expected_domain = match &observed.event {
            LedgerEvent::LoanRequested { .. }
            | LedgerEvent::Locked { .. }
            | LedgerEvent::Released { .. } => self.config.source_domain,
            LedgerEvent::Issued { .. }
            | LedgerEvent::Repaid { .. }
            | LedgerEvent::Defaulted { .. } => self.config.destination_domain,
            other => {
                debug!("Ignoring {} event {}", other.name(), observed.id());
                return Ok(());
            }
        };
        if observed.meta.domain != expected_domain {
            warn!(
                "Ignoring {} event {} from domain {}",
                observed.event.name(),
                observed.id(),
                observed.meta.domain
            );
            return Ok(());
        }

        if let LedgerEvent::LoanRequested { .. } = observed.event {
            return self.on_loan_requested(&observed, now).await;
        }

        let Some(loan_id) = observed.event.loan_id() else {
            return Ok(());
        };

        // Untracked loans never get a lock entry
        if self.store.get_loan(&loan_id).await?.is_none() {
            debug!("{} event for untracked loan {}", observed.event.name(), loan_id);
            return Ok(());
        }

        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.store.get_loan(&loan_id).await? else {
            return Ok(());
        };
        let result = self.apply_event(&mut record, observed, now).await;
        if record.state().is_terminal() {
            self.locks.remove(&loan_id);
        }
        result
    }

    async fn apply_event(
        &self,
        record: &mut LoanRecord,
        observed: ObservedEvent,
        now: DateTime<Utc>,
    ) -> RelayerResult<()> {
        let loan_id = record.loan_id();
        if record.halted {
            warn!(
                "Loan {} is halted, not applying {} event {}",
                loan_id,
                observed.event.name(),
                observed.id()
            );
            return Ok(());
        }
        let event_id = observed.id();
        if record.last_observed_event_id.as_deref() == Some(event_id.as_str()) {
            debug!("Event {} already applied to loan {}", event_id, loan_id);
            return Ok(());
        }

        let changed = match observed.event {
            LedgerEvent::Locked { asset_id, .. } => self.on_locked(record, asset_id, now).await,
            LedgerEvent::Issued {
                borrower,
                principal,
                due_at,
                ..
            } => self.on_issued(record, &observed.meta, borrower, principal, due_at, now),
            LedgerEvent::Repaid { amount, .. } => self.on_repaid(record, amount, now).await,
            LedgerEvent::Released { asset_id, .. } => self.on_released(record, asset_id, now),
            LedgerEvent::Defaulted { .. } => self.on_defaulted(record, now),
            _ => false,
        };

        if changed {
            record.last_observed_event_id = Some(event_id);
            self.save(record, now).await?;
        }
        Ok(())
    }

    /// Run retries, timeouts and default checks for every loan whose deadline has passed
    pub async fn tick(&self, now: DateTime<Utc>) -> RelayerResult<usize> {
        let records = self.store.loans_in_flight().await?;
        metrics::set_loans_in_flight(records.len());

        let due: Vec<LoanId> = records
            .iter()
            .filter(|r| !r.halted && self.is_due(r, now))
            .map(|r| r.loan_id())
            .collect();
        if due.is_empty() {
            return Ok(0);
        }
        debug!("Tick at {}: {} loans due", now, due.len());

        let results = join_all(due.iter().map(|loan_id| self.process_due(*loan_id, now))).await;
        for (loan_id, result) in due.iter().zip(results) {
            if let Err(e) = result {
                warn!("Tick for loan {} failed: {}", loan_id, e);
            }
        }
        Ok(due.len())
    }

    /// Clear a halt; the next tick picks the loan up from its stored state
    pub async fn resume(&self, loan_id: LoanId) -> RelayerResult<LoanRecord> {
        if self.store.get_loan(&loan_id).await?.is_none() {
            return Err(RelayerError::LoanNotFound { loan_id });
        }
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .get_loan(&loan_id)
            .await?
            .ok_or(RelayerError::LoanNotFound { loan_id })?;
        if !record.halted {
            return Ok(record);
        }

        info!(
            "Resuming loan {} in {} (was: {})",
            loan_id,
            record.state(),
            record.last_error.as_deref().unwrap_or("no reason recorded")
        );
        record.halted = false;
        record.last_error = None;
        record.last_attempt_at = None;
        self.save(&mut record, self.clock.now()).await?;
        Ok(record)
    }

    // ---- event handlers ----

    async fn on_loan_requested(&self, observed: &ObservedEvent, now: DateTime<Utc>) -> RelayerResult<()> {
        let LedgerEvent::LoanRequested {
            loan_id,
            asset_id,
            borrower,
            principal,
            interest_rate_bps,
            duration_secs,
            destination_domain,
            nonce,
        } = observed.event.clone()
        else {
            return Ok(());
        };

        if destination_domain != self.config.destination_domain {
            debug!(
                "Loan {} targets domain {}, not served by this relayer",
                loan_id, destination_domain
            );
            return Ok(());
        }
        if LoanId::derive(observed.meta.domain, asset_id, borrower, nonce) != loan_id {
            self.invariant_violation(loan_id, "loan_id_mismatch", "request does not hash to its id");
            return Ok(());
        }
        if principal.is_zero() || duration_secs == 0 {
            self.invariant_violation(loan_id, "degenerate_request", "zero principal or duration");
            return Ok(());
        }
        if repayment_due(principal, interest_rate_bps).is_none() {
            self.invariant_violation(loan_id, "unrepayable_principal", "repayment overflows uint256");
            return Ok(());
        }

        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock().await;

        if self.store.get_loan(&loan_id).await?.is_some() {
            debug!("Loan {} already tracked", loan_id);
            return Ok(());
        }

        let loan = Loan {
            loan_id,
            source_domain: observed.meta.domain,
            destination_domain,
            asset_id,
            borrower,
            principal,
            interest_rate_bps,
            duration_secs,
            issued_at: None,
            due_at: None,
            state: LoanState::Requested,
        };
        let mut record = LoanRecord::new(loan, now);
        record.last_observed_event_id = Some(observed.id());
        info!(
            "Loan {} requested: asset {} principal {} for {}s",
            loan_id, asset_id, principal, duration_secs
        );
        metrics::record_loan_requested();

        self.attempt_lock(&mut record, now).await;
        self.save(&mut record, now).await
    }

    async fn on_locked(&self, record: &mut LoanRecord, asset_id: AssetId, now: DateTime<Utc>) -> bool {
        if asset_id != record.loan.asset_id {
            self.invariant_violation(record.loan_id(), "lock_asset_mismatch", "locked a different asset");
            return false;
        }
        if record.state() == LoanState::Failed {
            // A lock that landed after the request was given up on
            self.release_stray_lock(record).await;
            return false;
        }
        if !self.apply(record, Trigger::LockObserved, now) {
            debug!("Loan {} ignoring Locked in {}", record.loan_id(), record.state());
            return false;
        }
        record.reset_attempts();
        self.dispatch_issue(record, now).await;
        true
    }

    fn on_issued(
        &self,
        record: &mut LoanRecord,
        meta: &EventMeta,
        borrower: Address,
        principal: U256,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if borrower != record.loan.borrower || principal != record.loan.principal {
            self.invariant_violation(record.loan_id(), "issued_terms_mismatch", "issued terms differ from request");
            return false;
        }
        if record.state() == LoanState::Failed {
            self.invariant_violation(
                record.loan_id(),
                "issued_after_refund",
                "loan issued after its collateral was returned",
            );
            return false;
        }
        self.settle_issuance(record, meta.timestamp, due_at, now)
    }

    async fn on_repaid(&self, record: &mut LoanRecord, amount: U256, now: DateTime<Utc>) -> bool {
        match record.state() {
            LoanState::Active => {}
            LoanState::CollateralLocked | LoanState::MessageSentToDest | LoanState::Issued => {
                // Repaid overtook Issued; take both from the ledger
                debug!("Loan {} repaid before issuance was seen, reconciling", record.loan_id());
                return match self.adapters.loans.loan(record.loan_id()).await {
                    Ok(Some(view)) => self.reconcile_destination(record, &view, now).await,
                    Ok(None) => false,
                    Err(e) => self.note_query_failure(record, e.class(), e.to_string(), now),
                };
            }
            other => {
                debug!("Loan {} ignoring Repaid in {}", record.loan_id(), other);
                return false;
            }
        }

        let Some(due) = record.loan.repayment_due() else {
            self.invariant_violation(record.loan_id(), "unrepayable_principal", "repayment overflows uint256");
            return false;
        };
        if amount < due {
            self.invariant_violation(
                record.loan_id(),
                "repayment_below_due",
                &format!("paid {} of {}", amount, due),
            );
            return false;
        }
        self.confirm_repayment(record, now).await
    }

    fn on_released(&self, record: &mut LoanRecord, asset_id: AssetId, now: DateTime<Utc>) -> bool {
        if asset_id != record.loan.asset_id {
            self.invariant_violation(record.loan_id(), "release_asset_mismatch", "released a different asset");
            return false;
        }
        match record.state() {
            LoanState::RepaymentConfirmed => {
                // Released overtook the dispatch bookkeeping
                self.apply(record, Trigger::DispatchAccepted, now);
            }
            LoanState::Issued | LoanState::Active => {
                self.invariant_violation(
                    record.loan_id(),
                    "released_while_outstanding",
                    "collateral released before repayment",
                );
                return false;
            }
            _ => {}
        }
        self.apply(record, Trigger::ReleasedObserved, now)
    }

    fn on_defaulted(&self, record: &mut LoanRecord, now: DateTime<Utc>) -> bool {
        match record.state() {
            LoanState::RepaymentConfirmed | LoanState::RepaymentSent => {
                self.invariant_violation(record.loan_id(), "default_after_repayment", "defaulted a repaid loan");
                false
            }
            _ => self.apply(record, Trigger::DefaultDeclared, now),
        }
    }

    // ---- tick ----

    fn is_due(&self, record: &LoanRecord, now: DateTime<Utc>) -> bool {
        match record.state() {
            LoanState::Requested | LoanState::CollateralLocked | LoanState::MessageSentToDest => {
                now >= self.retry_at(record, self.config.issue_timeout)
            }
            LoanState::Issued => true,
            LoanState::Active => {
                let overdue = record.loan.is_overdue(now);
                let backed_off = match (record.last_attempt_at, &record.last_error) {
                    (Some(last), Some(_)) => {
                        now >= self.config.backoff.next_attempt_at(last, record.attempt_count.max(1))
                    }
                    _ => true,
                };
                overdue && backed_off
            }
            LoanState::RepaymentConfirmed | LoanState::RepaymentSent => {
                now >= self.retry_at(record, self.config.release_timeout)
            }
            _ => false,
        }
    }

    /// Backoff after a failure, the phase timeout after an accepted attempt
    fn retry_at(&self, record: &LoanRecord, timeout: Duration) -> DateTime<Utc> {
        match record.last_attempt_at {
            None => record.updated_at,
            Some(last) if record.last_error.is_some() => self
                .config
                .backoff
                .next_attempt_at(last, record.attempt_count.max(1)),
            Some(last) => last + to_chrono(timeout),
        }
    }

    async fn process_due(&self, loan_id: LoanId, now: DateTime<Utc>) -> RelayerResult<()> {
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: an event may have moved the loan since the scan
        let Some(mut record) = self.store.get_loan(&loan_id).await? else {
            return Ok(());
        };
        if record.halted || record.state().is_terminal() || !self.is_due(&record, now) {
            return Ok(());
        }

        match record.state() {
            LoanState::Requested => self.retry_lock(&mut record, now).await,
            LoanState::CollateralLocked | LoanState::MessageSentToDest => {
                self.retry_issue(&mut record, now).await
            }
            LoanState::Issued => {
                self.apply(&mut record, Trigger::Disbursed, now);
                record.reset_attempts();
            }
            LoanState::Active => self.check_default(&mut record, now).await,
            LoanState::RepaymentConfirmed | LoanState::RepaymentSent => {
                self.retry_release(&mut record, now).await
            }
            _ => {}
        }
        self.save(&mut record, now).await
    }

    async fn retry_lock(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        let loan_id = record.loan_id();
        match self.adapters.collateral.asset(record.loan.asset_id).await {
            Err(e) => {
                self.note_query_failure(record, e.class(), e.to_string(), now);
                return;
            }
            Ok(None) => {
                self.halt(record, format!("asset {} is not registered", record.loan.asset_id));
                return;
            }
            Ok(Some(view)) => match view.locked_by {
                Some(holder) if holder == loan_id => {
                    info!("Loan {}: found collateral locked, Locked event was missed", loan_id);
                    self.apply(record, Trigger::LockObserved, now);
                    record.reset_attempts();
                    self.dispatch_issue(record, now).await;
                    return;
                }
                Some(holder) => {
                    self.reject_request(record, format!("asset locked by loan {}", holder), now);
                    return;
                }
                None => {}
            },
        }

        if record.attempt_count >= self.config.max_attempts {
            self.reject_request(
                record,
                format!("lock not confirmed after {} attempts", record.attempt_count),
                now,
            );
            return;
        }
        self.attempt_lock(record, now).await;
    }

    async fn retry_issue(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        match self.adapters.loans.loan(record.loan_id()).await {
            Err(e) => {
                self.note_query_failure(record, e.class(), e.to_string(), now);
                return;
            }
            Ok(Some(view)) => {
                info!("Loan {}: found issued on the ledger, Issued event was missed", record.loan_id());
                self.reconcile_destination(record, &view, now).await;
                return;
            }
            Ok(None) => {}
        }

        if record.attempt_count >= self.config.max_attempts {
            match record.issue_expires_at {
                Some(expires_at) if now < expires_at => {
                    debug!(
                        "Loan {}: issue budget spent, holding collateral until {} when the last copy expires",
                        record.loan_id(),
                        expires_at
                    );
                }
                _ => self.refund(record, now).await,
            }
            return;
        }
        if record.state() == LoanState::MessageSentToDest {
            warn!(
                "Loan {}: no Issued within the issue timeout, re-dispatching (attempt {}/{})",
                record.loan_id(),
                record.attempt_count + 1,
                self.config.max_attempts
            );
        }
        self.dispatch_issue(record, now).await;
    }

    async fn check_default(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        let loan_id = record.loan_id();
        // A missed Repaid or Defaulted shows up here before anything is declared
        match self.adapters.loans.loan(loan_id).await {
            Err(e) => {
                self.note_query_failure(record, e.class(), e.to_string(), now);
                return;
            }
            Ok(None) => {
                self.invariant_violation(loan_id, "active_loan_unknown", "ledger has no record of an active loan");
                self.halt(record, "loan ledger does not know this loan".to_string());
                return;
            }
            Ok(Some(view)) if view.status != LedgerLoanStatus::Active => {
                self.reconcile_destination(record, &view, now).await;
                return;
            }
            Ok(Some(_)) => {}
        }

        record.record_attempt(now);
        match self.adapters.loans.mark_defaulted(loan_id).await {
            Ok(()) => {
                record.last_error = None;
                if self.apply(record, Trigger::DefaultDeclared, now) {
                    warn!("Loan {} defaulted; asset {} stays with the lender", loan_id, record.loan.asset_id);
                }
            }
            Err(LoanLedgerError::LoanNotOverdue(_)) => {
                debug!("Loan {}: ledger does not consider it overdue yet", loan_id);
                record.last_error = Some("ledger reports loan not overdue".to_string());
            }
            Err(LoanLedgerError::LoanNotActive(_)) => {
                // Repaid in between; the next tick reads the new status
                record.last_error = Some("loan left Active on the ledger".to_string());
            }
            Err(e) => match e.class() {
                ErrorClass::Unexpected => self.halt(record, e.to_string()),
                _ => {
                    warn!("Loan {}: default call failed: {}", loan_id, e);
                    record.last_error = Some(e.to_string());
                }
            },
        }
    }

    async fn retry_release(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        let loan_id = record.loan_id();
        match self.adapters.collateral.asset(record.loan.asset_id).await {
            Err(e) => {
                self.note_query_failure(record, e.class(), e.to_string(), now);
                return;
            }
            Ok(None) => {
                self.halt(record, format!("asset {} is not registered", record.loan.asset_id));
                return;
            }
            Ok(Some(view)) if view.locked_by != Some(loan_id) => {
                info!("Loan {}: collateral already released, Released event was missed", loan_id);
                if record.state() == LoanState::RepaymentConfirmed {
                    self.apply(record, Trigger::DispatchAccepted, now);
                }
                self.apply(record, Trigger::ReleasedObserved, now);
                return;
            }
            Ok(Some(_)) => {}
        }

        if record.attempt_count >= self.config.max_attempts {
            // Never give up on a repaid borrower's collateral
            error!(
                "Loan {}: release still undelivered after {} attempts",
                loan_id, record.attempt_count
            );
            metrics::record_release_stalled();
        }
        self.dispatch_release(record, now).await;
    }

    // ---- shared steps ----

    async fn attempt_lock(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        record.record_attempt(now);
        match self
            .adapters
            .collateral
            .lock(record.loan.asset_id, record.loan_id())
            .await
        {
            Ok(()) => {
                record.last_error = None;
                debug!("Lock for loan {} accepted, awaiting Locked", record.loan_id());
            }
            Err(e) => match e.class() {
                ErrorClass::Business => self.reject_request(record, e.to_string(), now),
                ErrorClass::Unexpected => self.halt(record, e.to_string()),
                _ => {
                    warn!(
                        "Lock for loan {} failed (attempt {}/{}): {}",
                        record.loan_id(),
                        record.attempt_count,
                        self.config.max_attempts,
                        e
                    );
                    record.last_error = Some(e.to_string());
                }
            },
        }
    }

    async fn dispatch_issue(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        // Whole seconds, as the recipient compares them
        let expires_at = (now + to_chrono(self.config.issue_timeout)).timestamp().max(0);
        let loan = &record.loan;
        let body = MessageBody::IssueLoan {
            loan_id: loan.loan_id,
            asset_id: loan.asset_id,
            borrower: loan.borrower,
            principal: loan.principal,
            interest_rate_bps: loan.interest_rate_bps,
            duration_secs: loan.duration_secs,
            expires_at: expires_at as u64,
        }
        .encode();

        let deadline = Utc.timestamp_opt(expires_at, 0).single();
        record.record_attempt(now);
        metrics::record_dispatch_attempt("issue_loan");
        let result = self
            .adapters
            .source_relay
            .dispatch(self.config.destination_domain, self.config.loan_manager, body)
            .await;
        // A lost receipt may still have put a copy on the wire
        if !matches!(&result, Err(e) if e.class() == ErrorClass::Transient) {
            record.issue_expires_at = record.issue_expires_at.max(deadline);
        }
        match result {
            Ok(message_id) => {
                record.last_error = None;
                info!(
                    "Dispatched issue for loan {} as message {} (attempt {})",
                    record.loan_id(),
                    message_id,
                    record.attempt_count
                );
                self.apply(record, Trigger::DispatchAccepted, now);
            }
            Err(e) => self.dispatch_failed(record, "issue_loan", e),
        }
    }

    async fn dispatch_release(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        let body = MessageBody::ReleaseCollateral {
            loan_id: record.loan_id(),
            asset_id: record.loan.asset_id,
        }
        .encode();

        record.record_attempt(now);
        metrics::record_dispatch_attempt("release_collateral");
        let result = self
            .adapters
            .destination_relay
            .dispatch(self.config.source_domain, self.config.collateral_manager, body)
            .await;
        match result {
            Ok(message_id) => {
                record.last_error = None;
                info!(
                    "Dispatched release for loan {} as message {} (attempt {})",
                    record.loan_id(),
                    message_id,
                    record.attempt_count
                );
                self.apply(record, Trigger::DispatchAccepted, now);
            }
            Err(e) => self.dispatch_failed(record, "release_collateral", e),
        }
    }

    fn dispatch_failed(&self, record: &mut LoanRecord, kind: &str, e: RelayError) {
        let class = e.class();
        metrics::record_dispatch_failure(kind, class.as_str());
        match class {
            ErrorClass::Unexpected | ErrorClass::Business => self.halt(record, e.to_string()),
            _ => {
                warn!(
                    "Dispatch {} for loan {} failed (attempt {}/{}): {}",
                    kind,
                    record.loan_id(),
                    record.attempt_count,
                    self.config.max_attempts,
                    e
                );
                record.last_error = Some(e.to_string());
            }
        }
    }

    /// Bring the record up to what the loan ledger reports
    async fn reconcile_destination(&self, record: &mut LoanRecord, view: &LoanView, now: DateTime<Utc>) -> bool {
        let mut changed = self.settle_issuance(record, view.issued_at, view.due_at, now);
        if record.state() == LoanState::Active {
            changed |= match view.status {
                LedgerLoanStatus::Repaid => self.confirm_repayment(record, now).await,
                LedgerLoanStatus::Defaulted => self.apply(record, Trigger::DefaultDeclared, now),
                LedgerLoanStatus::Active => false,
            };
        }
        changed
    }

    /// Walk a pre-disbursement record forward to Active
    fn settle_issuance(
        &self,
        record: &mut LoanRecord,
        issued_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if due_at <= issued_at {
            self.invariant_violation(record.loan_id(), "due_before_issue", "due date not after issuance");
            return false;
        }
        if record.state() == LoanState::CollateralLocked {
            self.apply(record, Trigger::DispatchAccepted, now);
        }
        if record.state() == LoanState::MessageSentToDest {
            self.apply(record, Trigger::IssuedObserved, now);
            record.loan.issued_at = Some(issued_at);
            record.loan.due_at = Some(due_at);
        }
        if record.state() != LoanState::Issued {
            return false;
        }
        self.apply(record, Trigger::Disbursed, now);
        record.reset_attempts();
        true
    }

    async fn confirm_repayment(&self, record: &mut LoanRecord, now: DateTime<Utc>) -> bool {
        if !self.apply(record, Trigger::RepaidObserved, now) {
            return false;
        }
        record.reset_attempts();
        self.dispatch_release(record, now).await;
        true
    }

    /// Issue budget spent: hand the collateral back and fail the loan
    async fn refund(&self, record: &mut LoanRecord, now: DateTime<Utc>) {
        let loan_id = record.loan_id();
        warn!(
            "Loan {}: issue not confirmed after {} attempts, returning collateral",
            loan_id, record.attempt_count
        );
        record.record_attempt(now);
        match self.adapters.collateral.release(record.loan.asset_id, loan_id).await {
            Ok(()) | Err(CollateralError::NotLockedByLoan { .. }) => {
                self.apply(record, Trigger::CollateralRefunded, now);
                record.last_error = Some("issue not delivered within the attempt budget".to_string());
            }
            Err(e) => match e.class() {
                ErrorClass::Unexpected | ErrorClass::Business => self.halt(record, e.to_string()),
                _ => {
                    warn!("Loan {}: refund release failed: {}", loan_id, e);
                    record.last_error = Some(e.to_string());
                }
            },
        }
    }

    async fn release_stray_lock(&self, record: &LoanRecord) {
        warn!(
            "Loan {} failed but its lock on asset {} landed late, releasing",
            record.loan_id(),
            record.loan.asset_id
        );
        if let Err(e) = self
            .adapters
            .collateral
            .release(record.loan.asset_id, record.loan_id())
            .await
        {
            error!("Failed to release stray lock for loan {}: {}", record.loan_id(), e);
        }
    }

    fn reject_request(&self, record: &mut LoanRecord, reason: String, now: DateTime<Utc>) {
        warn!("Loan {} rejected: {}", record.loan_id(), reason);
        record.last_error = Some(reason);
        self.apply(record, Trigger::RequestRejected, now);
    }

    fn note_query_failure(
        &self,
        record: &mut LoanRecord,
        class: ErrorClass,
        detail: String,
        now: DateTime<Utc>,
    ) -> bool {
        if class == ErrorClass::Unexpected {
            self.halt(record, detail);
        } else {
            warn!("Loan {}: ledger query failed: {}", record.loan_id(), detail);
            record.last_attempt_at = Some(now);
            record.last_error = Some(detail);
        }
        true
    }

    fn halt(&self, record: &mut LoanRecord, reason: String) {
        error!(
            "Loan {} halted in {} for operator intervention: {}",
            record.loan_id(),
            record.state(),
            reason
        );
        record.halted = true;
        record.last_error = Some(reason);
        metrics::record_loan_halted();
    }

    fn invariant_violation(&self, loan_id: LoanId, kind: &str, detail: &str) {
        error!("Invariant violation on loan {}: {} ({})", loan_id, kind, detail);
        metrics::record_invariant_violation(kind);
    }

    /// Move the record if the table allows it
    fn apply(&self, record: &mut LoanRecord, trigger: Trigger, now: DateTime<Utc>) -> bool {
        let from = record.state();
        let Some(to) = next_state(from, trigger) else {
            return false;
        };
        if to != from {
            info!("Loan {}: {} -> {}", record.loan_id(), from, to);
            metrics::record_transition(from.as_str(), to.as_str());
            if to.is_terminal() {
                let elapsed = (now - record.created_at).num_milliseconds().max(0) as f64 / 1000.0;
                metrics::record_loan_finished(to.as_str(), elapsed);
            }
        }
        record.loan.state = to;
        true
    }

    async fn save(&self, record: &mut LoanRecord, now: DateTime<Utc>) -> RelayerResult<()> {
        record.updated_at = now;
        self.store.upsert_loan(record).await?;
        if record.state().is_terminal() {
            self.locks.remove(&record.loan_id());
        }
        Ok(())
    }

    fn loan_lock(&self, loan_id: LoanId) -> Arc<Mutex<()>> {
        self.locks
            .entry(loan_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
