//! Message recipients applying relay deliveries to a ledger

use super::{CollateralLedger, LoanLedger};
use crate::error::{CollateralError, LoanLedgerError, RelayerError, RelayerResult};
use crate::relay::{CrossChainMessage, MessageBody, MessageHandler};
use crate::types::{Clock, Domain};

use async_trait::async_trait;
use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Checks shared by both recipients: addressed to us and sent by the trusted remote
fn accepts(
    message: &CrossChainMessage,
    address: Address,
    trusted_origin: Domain,
    trusted_sender: Address,
) -> bool {
    if message.recipient != address {
        return false;
    }
    if message.source_domain != trusted_origin || message.sender != trusted_sender {
        warn!(
            "Ignoring message {} from untrusted sender {:?} on domain {}",
            message.id, message.sender, message.source_domain
        );
        return false;
    }
    true
}

/// Loan manager endpoint on the destination chain: issues loans
pub struct LoanRecipient {
    ledger: Arc<dyn LoanLedger>,
    address: Address,
    trusted_origin: Domain,
    trusted_sender: Address,
    clock: Clock,
}

impl LoanRecipient {
    pub fn new(
        ledger: Arc<dyn LoanLedger>,
        address: Address,
        trusted_origin: Domain,
        trusted_sender: Address,
        clock: Clock,
    ) -> Self {
        Self {
            ledger,
            address,
            trusted_origin,
            trusted_sender,
            clock,
        }
    }
}

#[async_trait]
impl MessageHandler for LoanRecipient {
    async fn handle(&self, message: &CrossChainMessage) -> RelayerResult<()> {
        if !accepts(message, self.address, self.trusted_origin, self.trusted_sender) {
            return Ok(());
        }

        let body = MessageBody::decode(&message.body)?;
        let now = self.clock.now();
        if body.is_expired(now) {
            // The orchestrator may already have returned the collateral
            warn!(
                "Refusing expired {} message {} for loan {}",
                body.kind(),
                message.id,
                body.loan_id()
            );
            return Ok(());
        }

        match body {
            MessageBody::IssueLoan {
                loan_id,
                borrower,
                principal,
                interest_rate_bps,
                duration_secs,
                ..
            } => {
                let due_at = now
                    + chrono::Duration::seconds(duration_secs.min(i64::MAX as u64) as i64);
                match self
                    .ledger
                    .issue_loan(loan_id, borrower, principal, interest_rate_bps, due_at)
                    .await
                {
                    Ok(()) => {
                        info!("Issued loan {} from message {}", loan_id, message.id);
                        Ok(())
                    }
                    Err(LoanLedgerError::LoanAlreadyIssued(_)) => {
                        debug!("Loan {} already issued, message {} is a retry", loan_id, message.id);
                        Ok(())
                    }
                    Err(e) => Err(RelayerError::LoanLedger(e)),
                }
            }
            other => {
                warn!("Loan recipient cannot handle {} message {}", other.kind(), message.id);
                Ok(())
            }
        }
    }
}

/// Collateral manager endpoint on the source chain: releases collateral
pub struct CollateralRecipient {
    ledger: Arc<dyn CollateralLedger>,
    address: Address,
    trusted_origin: Domain,
    trusted_sender: Address,
}

impl CollateralRecipient {
    pub fn new(
        ledger: Arc<dyn CollateralLedger>,
        address: Address,
        trusted_origin: Domain,
        trusted_sender: Address,
    ) -> Self {
        Self {
            ledger,
            address,
            trusted_origin,
            trusted_sender,
        }
    }
}

#[async_trait]
impl MessageHandler for CollateralRecipient {
    async fn handle(&self, message: &CrossChainMessage) -> RelayerResult<()> {
        if !accepts(message, self.address, self.trusted_origin, self.trusted_sender) {
            return Ok(());
        }

        match MessageBody::decode(&message.body)? {
            MessageBody::ReleaseCollateral { loan_id, asset_id } => {
                match self.ledger.release(asset_id, loan_id).await {
                    Ok(()) => {
                        info!(
                            "Released asset {} for loan {} from message {}",
                            asset_id, loan_id, message.id
                        );
                        Ok(())
                    }
                    Err(CollateralError::NotLockedByLoan { .. }) => {
                        warn!(
                            "Stale release for loan {}: asset {} is held by another loan",
                            loan_id, asset_id
                        );
                        Ok(())
                    }
                    Err(e) => Err(RelayerError::Collateral(e)),
                }
            }
            other => {
                warn!(
                    "Collateral recipient cannot handle {} message {}",
                    other.kind(),
                    message.id
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MockLoanLedger, MemoryLoanLedger};
    use crate::relay::MessageId;
    use crate::types::{AssetId, LoanId};
    use chrono::{TimeZone, Utc};
    use ethers::types::U256;
    use tokio::sync::broadcast;

    const SOURCE: Domain = 1;
    const DESTINATION: Domain = 2;

    fn issue_message(sender: Address, recipient: Address, loan_id: LoanId) -> CrossChainMessage {
        issue_message_until(sender, recipient, loan_id, u64::MAX)
    }

    fn issue_message_until(
        sender: Address,
        recipient: Address,
        loan_id: LoanId,
        expires_at: u64,
    ) -> CrossChainMessage {
        let body = MessageBody::IssueLoan {
            loan_id,
            asset_id: AssetId(5),
            borrower: Address::repeat_byte(0x01),
            principal: U256::from(100),
            interest_rate_bps: 500,
            duration_secs: 30 * 86_400,
            expires_at,
        };
        CrossChainMessage {
            id: MessageId::derive(SOURCE, sender, 0),
            source_domain: SOURCE,
            destination_domain: DESTINATION,
            sender,
            recipient,
            body: body.encode(),
            nonce: 0,
            dispatched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_issue_sets_due_date_from_duration() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let (tx, _rx) = broadcast::channel(16);
        let ledger = Arc::new(MemoryLoanLedger::new(
            DESTINATION,
            U256::from(1000),
            clock.clone(),
            tx,
        ));
        let relayer = Address::repeat_byte(0xee);
        let manager = Address::repeat_byte(0xdd);
        let recipient = LoanRecipient::new(ledger.clone(), manager, SOURCE, relayer, clock.clone());

        let loan = LoanId([8u8; 32]);
        let msg = issue_message(relayer, manager, loan);
        recipient.handle(&msg).await.unwrap();
        // A retried delivery of an issued loan is a success
        recipient.handle(&msg).await.unwrap();

        let view = ledger.loan(loan).await.unwrap().unwrap();
        assert_eq!(view.due_at, clock.now() + chrono::Duration::days(30));
        assert_eq!(ledger.available_liquidity().await, U256::from(900));
    }

    #[tokio::test]
    async fn test_expired_issue_is_refused() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let mut ledger = MockLoanLedger::new();
        ledger.expect_issue_loan().never();
        let relayer = Address::repeat_byte(0xee);
        let manager = Address::repeat_byte(0xdd);
        let recipient =
            LoanRecipient::new(Arc::new(ledger), manager, SOURCE, relayer, clock.clone());

        let deadline = clock.now().timestamp() as u64;
        let msg = issue_message_until(relayer, manager, LoanId([3u8; 32]), deadline);
        recipient.handle(&msg).await.unwrap();

        clock.advance(chrono::Duration::hours(2));
        recipient.handle(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_sender_is_ignored() {
        let mut ledger = MockLoanLedger::new();
        ledger.expect_issue_loan().never();
        let manager = Address::repeat_byte(0xdd);
        let recipient = LoanRecipient::new(
            Arc::new(ledger),
            manager,
            SOURCE,
            Address::repeat_byte(0xee),
            Clock::System,
        );

        let msg = issue_message(Address::repeat_byte(0x66), manager, LoanId([1u8; 32]));
        recipient.handle(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_liquidity_shortfall_propagates() {
        let mut ledger = MockLoanLedger::new();
        ledger.expect_issue_loan().times(1).returning(|_, _, _, _, _| {
            Err(LoanLedgerError::InsufficientLiquidity {
                available: U256::zero(),
                requested: U256::from(100),
            })
        });
        let relayer = Address::repeat_byte(0xee);
        let manager = Address::repeat_byte(0xdd);
        let recipient =
            LoanRecipient::new(Arc::new(ledger), manager, SOURCE, relayer, Clock::System);

        let result = recipient
            .handle(&issue_message(relayer, manager, LoanId([1u8; 32])))
            .await;
        assert!(matches!(
            result,
            Err(RelayerError::LoanLedger(LoanLedgerError::InsufficientLiquidity { .. }))
        ));
    }
}
