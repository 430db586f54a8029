//! Local transport: in-process ledgers, relay and recipients
//!
//! Wires a source chain (IP registry and collateral manager) and a
//! destination chain (loan manager) around a [`LocalRelay`], with the
//! same event bus shape the EVM listeners produce. Also hosts the
//! borrower-side actions the devnet API exposes.

use crate::chain::parse_address;
use crate::config::Settings;
use crate::error::{CollateralError, RelayerError, RelayerResult};
use crate::events::ObservedEvent;
use crate::ledger::{
    CollateralLedger, CollateralRecipient, LoanLedger, LoanRecipient, MemoryCollateralLedger,
    MemoryLoanLedger,
};
use crate::orchestrator::{Adapters, EngineConfig};
use crate::relay::{CrossChainMessage, LocalRelay, MessageInbox};
use crate::state::LoanStore;
use crate::types::{repayment_due, AssetId, Clock, Domain, LoanId};

use ethers::types::{Address, U256};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

const SECONDS_PER_DAY: u64 = 86_400;

/// A borrower's loan application
#[derive(Debug, Clone, Deserialize)]
pub struct LoanApplication {
    pub asset_id: u64,
    pub borrower: Address,
    /// Principal in wei, decimal string
    pub amount: String,
    pub duration_days: u32,
    /// Destination chain name, resolved through the route table
    pub destination_chain: String,
}

pub struct Devnet {
    settings: Settings,
    clock: Clock,
    events: broadcast::Sender<ObservedEvent>,
    relay: Arc<LocalRelay>,
    collateral: Arc<MemoryCollateralLedger>,
    loans: Arc<MemoryLoanLedger>,
    source_inbox: Arc<MessageInbox>,
    destination_inbox: Arc<MessageInbox>,
    relayer: Address,
    collateral_manager: Address,
    loan_manager: Address,
}

impl Devnet {
    pub async fn new(settings: &Settings, store: Arc<dyn LoanStore>) -> RelayerResult<Self> {
        Self::with_clock(settings, store, Clock::System).await
    }

    pub async fn with_clock(
        settings: &Settings,
        store: Arc<dyn LoanStore>,
        clock: Clock,
    ) -> RelayerResult<Self> {
        let source_domain = settings.source.domain;
        let destination_domain = settings.destination.domain;

        let collateral_manager = parse_address("collateral manager", &settings.source.collateral_manager)?
            .unwrap_or_else(|| Address::repeat_byte(0xc0));
        let loan_manager = parse_address("loan manager", &settings.destination.loan_manager)?
            .unwrap_or_else(|| Address::repeat_byte(0x10));
        // Sender the recipients trust on both sides
        let relayer = Address::repeat_byte(0xee);

        let liquidity = U256::from_dec_str(&settings.devnet.liquidity_wei).map_err(|e| {
            RelayerError::Config(format!(
                "invalid devnet liquidity {}: {}",
                settings.devnet.liquidity_wei, e
            ))
        })?;

        let (events, _) = broadcast::channel(10000);

        let collateral = Arc::new(MemoryCollateralLedger::new(
            source_domain,
            collateral_manager,
            clock.clone(),
            events.clone(),
        ));
        for asset in &settings.devnet.assets {
            let owner = asset.owner.parse::<Address>().map_err(|e| {
                RelayerError::Config(format!("invalid owner for asset {}: {}", asset.asset_id, e))
            })?;
            collateral.register_asset(AssetId(asset.asset_id), owner, asset.token_uri.clone());
        }

        let loans = Arc::new(MemoryLoanLedger::new(
            destination_domain,
            liquidity,
            clock.clone(),
            events.clone(),
        ));

        let destination_inbox = Arc::new(MessageInbox::new(destination_domain, store.clone()));
        destination_inbox
            .on_message(Arc::new(LoanRecipient::new(
                loans.clone(),
                loan_manager,
                source_domain,
                relayer,
                clock.clone(),
            )))
            .await;

        let source_inbox = Arc::new(MessageInbox::new(source_domain, store));
        source_inbox
            .on_message(Arc::new(CollateralRecipient::new(
                collateral.clone(),
                collateral_manager,
                destination_domain,
                relayer,
            )))
            .await;

        info!(
            "Local transport: domains {} -> {}, {} preloaded assets, liquidity {} wei",
            source_domain,
            destination_domain,
            settings.devnet.assets.len(),
            liquidity
        );

        Ok(Self {
            settings: settings.clone(),
            clock,
            events,
            relay: Arc::new(LocalRelay::new()),
            collateral,
            loans,
            source_inbox,
            destination_inbox,
            relayer,
            collateral_manager,
            loan_manager,
        })
    }

    /// Run both inboxes off the relay until it closes
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        [self.source_inbox.clone(), self.destination_inbox.clone()]
            .into_iter()
            .map(|inbox| {
                let deliveries = self.relay.subscribe();
                tokio::spawn(async move { inbox.run(deliveries).await })
            })
            .collect()
    }

    /// Hand one copy to the inbox of its destination domain
    pub async fn deliver(&self, message: &CrossChainMessage) -> RelayerResult<bool> {
        match message.destination_domain {
            d if d == self.source_inbox.domain() => self.source_inbox.deliver(message).await,
            d if d == self.destination_inbox.domain() => {
                self.destination_inbox.deliver(message).await
            }
            other => Err(RelayerError::Relay(crate::error::RelayError::UnknownDomain(other))),
        }
    }

    pub fn adapters(&self) -> Adapters {
        Adapters {
            collateral: self.collateral.clone(),
            loans: self.loans.clone(),
            source_relay: Arc::new(self.relay.client(self.source_domain(), self.relayer)),
            destination_relay: Arc::new(self.relay.client(self.destination_domain(), self.relayer)),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(&self.settings, self.collateral_manager, self.loan_manager)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ObservedEvent> {
        self.events.subscribe()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn relay(&self) -> &Arc<LocalRelay> {
        &self.relay
    }

    pub fn collateral(&self) -> &Arc<MemoryCollateralLedger> {
        &self.collateral
    }

    pub fn loans(&self) -> &Arc<MemoryLoanLedger> {
        &self.loans
    }

    pub fn source_domain(&self) -> Domain {
        self.settings.source.domain
    }

    pub fn destination_domain(&self) -> Domain {
        self.settings.destination.domain
    }

    /// Owner approves the collateral manager for an asset
    pub async fn approve_collateral(&self, asset_id: AssetId, owner: Address) -> Result<(), CollateralError> {
        self.collateral
            .approve(asset_id, owner, self.collateral_manager)
            .await
    }

    /// Validate an application and submit it to the collateral manager
    pub fn request_loan(&self, application: &LoanApplication) -> RelayerResult<LoanId> {
        let lending = &self.settings.lending;
        if application.duration_days < lending.min_duration_days
            || application.duration_days > lending.max_duration_days
        {
            return Err(RelayerError::InvalidRequest(format!(
                "duration must be {} to {} days",
                lending.min_duration_days, lending.max_duration_days
            )));
        }

        let principal = U256::from_dec_str(&application.amount)
            .map_err(|e| RelayerError::InvalidRequest(format!("invalid amount: {}", e)))?;
        if principal.is_zero() {
            return Err(RelayerError::InvalidRequest("amount must be positive".to_string()));
        }
        if repayment_due(principal, lending.interest_rate_bps).is_none() {
            return Err(RelayerError::InvalidRequest(format!(
                "amount {} is too large to repay",
                principal
            )));
        }

        let route = self
            .settings
            .resolve_route(&application.destination_chain)
            .ok_or_else(|| {
                RelayerError::InvalidRequest(format!(
                    "unknown destination chain {}",
                    application.destination_chain
                ))
            })?;
        if route != self.destination_domain() {
            return Err(RelayerError::InvalidRequest(format!(
                "destination {} is not served by this relayer",
                application.destination_chain
            )));
        }

        let loan_id = self.collateral.request_loan(
            AssetId(application.asset_id),
            application.borrower,
            principal,
            lending.interest_rate_bps,
            u64::from(application.duration_days) * SECONDS_PER_DAY,
            route,
        )?;
        info!(
            "Loan {} requested against asset {} for {} days",
            loan_id, application.asset_id, application.duration_days
        );
        Ok(loan_id)
    }

    /// Pay the full amount due on the destination ledger
    pub async fn repay_loan(&self, loan_id: LoanId) -> RelayerResult<U256> {
        let view = self
            .loans
            .loan(loan_id)
            .await?
            .ok_or(RelayerError::LoanNotFound { loan_id })?;
        self.loans
            .record_repayment(loan_id, view.repayment_due)
            .await?;
        Ok(view.repayment_due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::local_test_settings;
    use crate::state::MemoryLoanStore;

    async fn devnet() -> Devnet {
        Devnet::new(&local_test_settings(), Arc::new(MemoryLoanStore::new()))
            .await
            .unwrap()
    }

    fn application(days: u32, chain: &str) -> LoanApplication {
        LoanApplication {
            asset_id: 1,
            borrower: Address::repeat_byte(0xb0),
            amount: "1000000000000000000".to_string(),
            duration_days: days,
            destination_chain: chain.to_string(),
        }
    }

    #[tokio::test]
    async fn test_request_checks_duration_and_route() {
        let devnet = devnet().await;
        devnet
            .collateral()
            .register_asset(AssetId(1), Address::repeat_byte(0xb0), "ipfs://QmOne");
        devnet
            .approve_collateral(AssetId(1), Address::repeat_byte(0xb0))
            .await
            .unwrap();

        assert!(matches!(
            devnet.request_loan(&application(3, "arbitrum")),
            Err(RelayerError::InvalidRequest(_))
        ));
        assert!(matches!(
            devnet.request_loan(&application(30, "solana")),
            Err(RelayerError::InvalidRequest(_))
        ));
        // Routed, but to a domain this relayer does not serve
        assert!(matches!(
            devnet.request_loan(&application(30, "Scroll")),
            Err(RelayerError::InvalidRequest(_))
        ));

        let mut events = devnet.subscribe_events();
        let loan_id = devnet.request_loan(&application(30, "Arbitrum")).unwrap();
        let observed = events.recv().await.unwrap();
        assert_eq!(observed.event.loan_id(), Some(loan_id));
        assert_eq!(observed.meta.domain, devnet.source_domain());
    }

    #[tokio::test]
    async fn test_unrepayable_amount_is_refused() {
        let devnet = devnet().await;
        devnet
            .collateral()
            .register_asset(AssetId(1), Address::repeat_byte(0xb0), "ipfs://QmOne");
        devnet
            .approve_collateral(AssetId(1), Address::repeat_byte(0xb0))
            .await
            .unwrap();

        let mut huge = application(30, "arbitrum");
        huge.amount = U256::MAX.to_string();
        assert!(matches!(
            devnet.request_loan(&huge),
            Err(RelayerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unapproved_asset_is_refused() {
        let devnet = devnet().await;
        devnet
            .collateral()
            .register_asset(AssetId(1), Address::repeat_byte(0xb0), "ipfs://QmOne");

        assert!(matches!(
            devnet.request_loan(&application(30, "arbitrum")),
            Err(RelayerError::Collateral(CollateralError::NotApproved(_)))
        ));
    }

    #[tokio::test]
    async fn test_deliver_rejects_unknown_domain() {
        let devnet = devnet().await;
        let message = CrossChainMessage {
            id: crate::relay::MessageId([1u8; 32]),
            source_domain: 1,
            destination_domain: 999,
            sender: Address::zero(),
            recipient: Address::zero(),
            body: Vec::new(),
            nonce: 0,
            dispatched_at: chrono::Utc::now(),
        };
        assert!(devnet.deliver(&message).await.is_err());
    }
}
