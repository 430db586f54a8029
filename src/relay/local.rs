//! In-process relay hub
//!
//! Delivers dispatched messages to every subscriber over a broadcast
//! channel. Faults can be injected to exercise the orchestrator: refused
//! dispatches, lost messages, held and reordered deliveries, duplicates.

use super::{CrossChainMessage, MessageId, RelayClient};
use crate::error::{RelayError, RelayResult};
use crate::types::Domain;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ethers::types::Address;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

#[derive(Default)]
struct Faults {
    refuse_next: u32,
    dropped: HashSet<Domain>,
    holding: bool,
    held: Vec<CrossChainMessage>,
}

pub struct LocalRelay {
    deliveries: broadcast::Sender<CrossChainMessage>,
    nonces: DashMap<Domain, u64>,
    faults: Mutex<Faults>,
    dispatched: Mutex<Vec<CrossChainMessage>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        let (deliveries, _) = broadcast::channel(10000);
        Self {
            deliveries,
            nonces: DashMap::new(),
            faults: Mutex::new(Faults::default()),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    /// Client dispatching from `origin` as `sender`
    pub fn client(self: &Arc<Self>, origin: Domain, sender: Address) -> LocalRelayClient {
        LocalRelayClient {
            hub: self.clone(),
            origin,
            sender,
        }
    }

    /// Receive every delivered copy, for all domains
    pub fn subscribe(&self) -> broadcast::Receiver<CrossChainMessage> {
        self.deliveries.subscribe()
    }

    /// Refuse the next `count` dispatches with `RelayUnavailable`
    pub async fn refuse_next(&self, count: u32) {
        self.faults.lock().await.refuse_next = count;
    }

    /// Accept dispatches to `domain` but never deliver them
    pub async fn drop_to(&self, domain: Domain) {
        self.faults.lock().await.dropped.insert(domain);
    }

    pub async fn restore(&self, domain: Domain) {
        self.faults.lock().await.dropped.remove(&domain);
    }

    /// Queue deliveries until `flush_held` is called
    pub async fn hold(&self) {
        self.faults.lock().await.holding = true;
    }

    /// Deliver queued copies, newest first when `reverse` is set
    pub async fn flush_held(&self, reverse: bool) -> usize {
        let mut held = {
            let mut faults = self.faults.lock().await;
            faults.holding = false;
            std::mem::take(&mut faults.held)
        };
        if reverse {
            held.reverse();
        }
        let count = held.len();
        for message in held {
            let _ = self.deliveries.send(message);
        }
        count
    }

    /// Deliver another copy of an already dispatched message
    pub async fn redeliver(&self, id: &MessageId) -> bool {
        let copy = self
            .dispatched
            .lock()
            .await
            .iter()
            .find(|m| m.id == *id)
            .cloned();
        match copy {
            Some(message) => {
                let _ = self.deliveries.send(message);
                true
            }
            None => false,
        }
    }

    /// Every message accepted so far, in dispatch order
    pub async fn dispatched(&self) -> Vec<CrossChainMessage> {
        self.dispatched.lock().await.clone()
    }

    async fn send(
        &self,
        origin: Domain,
        sender: Address,
        destination: Domain,
        recipient: Address,
        body: Vec<u8>,
    ) -> RelayResult<MessageId> {
        let mut faults = self.faults.lock().await;
        if faults.refuse_next > 0 {
            faults.refuse_next -= 1;
            return Err(RelayError::RelayUnavailable(format!(
                "local relay refused dispatch to domain {}",
                destination
            )));
        }

        let nonce = {
            let mut next = self.nonces.entry(origin).or_insert(0);
            let nonce = *next;
            *next += 1;
            nonce
        };

        let message = CrossChainMessage {
            id: MessageId::derive(origin, sender, nonce),
            source_domain: origin,
            destination_domain: destination,
            sender,
            recipient,
            body,
            nonce,
            dispatched_at: Utc::now(),
        };
        let id = message.id;
        self.dispatched.lock().await.push(message.clone());

        if faults.dropped.contains(&destination) {
            debug!("Local relay dropping message {} to domain {}", id, destination);
        } else if faults.holding {
            faults.held.push(message);
        } else {
            let _ = self.deliveries.send(message);
        }

        Ok(id)
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch handle bound to one origin domain and sender address
#[derive(Clone)]
pub struct LocalRelayClient {
    hub: Arc<LocalRelay>,
    origin: Domain,
    sender: Address,
}

#[async_trait]
impl RelayClient for LocalRelayClient {
    fn origin_domain(&self) -> Domain {
        self.origin
    }

    async fn dispatch(
        &self,
        destination: Domain,
        recipient: Address,
        body: Vec<u8>,
    ) -> RelayResult<MessageId> {
        self.hub
            .send(self.origin, self.sender, destination, recipient, body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn hub_with_client() -> (Arc<LocalRelay>, LocalRelayClient) {
        let hub = Arc::new(LocalRelay::new());
        let client = hub.client(1, Address::repeat_byte(0x0a));
        (hub, client)
    }

    #[tokio::test]
    async fn test_dispatch_delivers_with_sequential_nonces() {
        let (hub, client) = hub_with_client();
        let mut rx = hub.subscribe();

        let first = assert_ok!(client.dispatch(2, Address::zero(), vec![1]).await);
        let second = assert_ok!(client.dispatch(2, Address::zero(), vec![2]).await);
        assert_ne!(first, second);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.id, first);
        assert_eq!(delivered.nonce, 0);
        assert_eq!(rx.recv().await.unwrap().nonce, 1);
    }

    #[tokio::test]
    async fn test_refused_dispatch_consumes_no_nonce() {
        let (hub, client) = hub_with_client();
        hub.refuse_next(2).await;

        assert!(matches!(
            client.dispatch(2, Address::zero(), vec![]).await,
            Err(RelayError::RelayUnavailable(_))
        ));
        assert!(client.dispatch(2, Address::zero(), vec![]).await.is_err());
        assert_ok!(client.dispatch(2, Address::zero(), vec![]).await);
        assert_eq!(hub.dispatched().await[0].nonce, 0);
    }

    #[tokio::test]
    async fn test_held_messages_flush_in_reverse() {
        let (hub, client) = hub_with_client();
        let mut rx = hub.subscribe();
        hub.hold().await;

        let a = client.dispatch(2, Address::zero(), vec![]).await.unwrap();
        let b = client.dispatch(2, Address::zero(), vec![]).await.unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(hub.flush_held(true).await, 2);
        assert_eq!(rx.recv().await.unwrap().id, b);
        assert_eq!(rx.recv().await.unwrap().id, a);
    }

    #[tokio::test]
    async fn test_dropped_domain_and_redelivery() {
        let (hub, client) = hub_with_client();
        let mut rx = hub.subscribe();
        hub.drop_to(2).await;

        let id = client.dispatch(2, Address::zero(), vec![]).await.unwrap();
        assert!(rx.try_recv().is_err());

        assert!(hub.redeliver(&id).await);
        assert_eq!(rx.recv().await.unwrap().id, id);
        assert!(!hub.redeliver(&MessageId([0u8; 32])).await);
    }
}
