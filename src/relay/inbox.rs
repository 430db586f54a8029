//! Receiving side of the relay: idempotent delivery to message handlers

use super::CrossChainMessage;
use crate::error::RelayerResult;
use crate::state::LoanStore;
use crate::types::Domain;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Applies a delivered message to a ledger
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &CrossChainMessage) -> RelayerResult<()>;
}

/// Delivers messages addressed to one domain, at most once per message id
pub struct MessageInbox {
    domain: Domain,
    store: Arc<dyn LoanStore>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    delivery: Mutex<()>,
}

impl MessageInbox {
    pub fn new(domain: Domain, store: Arc<dyn LoanStore>) -> Self {
        Self {
            domain,
            store,
            handlers: RwLock::new(Vec::new()),
            delivery: Mutex::new(()),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Register a handler for every message delivered to this domain
    pub async fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Deliver one physical copy of a message.
    ///
    /// Returns `Ok(false)` when the copy is addressed elsewhere or its id
    /// was already processed. The id is recorded only after every handler
    /// succeeded, so a failed delivery is retried by the next copy.
    pub async fn deliver(&self, message: &CrossChainMessage) -> RelayerResult<bool> {
        if message.destination_domain != self.domain {
            return Ok(false);
        }

        let _guard = self.delivery.lock().await;

        if self.store.is_message_processed(&message.id).await? {
            debug!(
                "Domain {}: dropping duplicate message {}",
                self.domain, message.id
            );
            crate::metrics::record_message_duplicate(self.domain);
            return Ok(false);
        }

        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            handler.handle(message).await?;
        }

        self.store.record_message(&message.id, self.domain).await?;
        crate::metrics::record_message_delivered(self.domain);
        debug!(
            "Domain {}: processed message {} from domain {}",
            self.domain, message.id, message.source_domain
        );
        Ok(true)
    }

    /// Deliver every copy arriving on `deliveries` until the channel closes
    pub async fn run(&self, mut deliveries: broadcast::Receiver<CrossChainMessage>) {
        info!("Inbox for domain {} started", self.domain);
        loop {
            match deliveries.recv().await {
                Ok(message) => {
                    if let Err(e) = self.deliver(&message).await {
                        warn!(
                            "Domain {}: delivery of message {} failed: {}",
                            self.domain, message.id, e
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Domain {}: inbox lagged, {} copies skipped", self.domain, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Inbox for domain {} stopped", self.domain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayerError;
    use crate::relay::MessageId;
    use crate::state::MemoryLoanStore;
    use chrono::Utc;
    use ethers::types::Address;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &CrossChainMessage) -> RelayerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(RelayerError::Internal("ledger busy".into()));
            }
            Ok(())
        }
    }

    fn message(destination: Domain, nonce: u64) -> CrossChainMessage {
        let sender = Address::repeat_byte(0x01);
        CrossChainMessage {
            id: MessageId::derive(1, sender, nonce),
            source_domain: 1,
            destination_domain: destination,
            sender,
            recipient: Address::repeat_byte(0x02),
            body: vec![],
            nonce,
            dispatched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_copies_are_handled_once() {
        let inbox = MessageInbox::new(2, Arc::new(MemoryLoanStore::new()));
        let handler = Arc::new(CountingHandler::default());
        inbox.on_message(handler.clone()).await;

        let msg = message(2, 0);
        assert!(inbox.deliver(&msg).await.unwrap());
        assert!(!inbox.deliver(&msg).await.unwrap());
        assert!(!inbox.deliver(&msg.clone()).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_domain_is_ignored() {
        let inbox = MessageInbox::new(2, Arc::new(MemoryLoanStore::new()));
        let handler = Arc::new(CountingHandler::default());
        inbox.on_message(handler.clone()).await;

        assert!(!inbox.deliver(&message(3, 0)).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_recorded() {
        let inbox = MessageInbox::new(2, Arc::new(MemoryLoanStore::new()));
        let handler = Arc::new(CountingHandler::default());
        handler.fail_first.store(1, Ordering::SeqCst);
        inbox.on_message(handler.clone()).await;

        let msg = message(2, 4);
        assert!(inbox.deliver(&msg).await.is_err());
        assert!(inbox.deliver(&msg).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
