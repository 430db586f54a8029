//! Cross-chain message relay
//!
//! The relay moves opaque message bodies between domains with
//! at-least-once, unordered delivery. Nothing here knows about loans
//! beyond the [`MessageBody`] codec used by the orchestrator.

pub mod backoff;
pub mod inbox;
pub mod local;
pub mod mailbox;
pub mod message;

pub use backoff::Backoff;
pub use inbox::{MessageHandler, MessageInbox};
pub use local::{LocalRelay, LocalRelayClient};
pub use mailbox::MailboxRelay;
pub use message::{CrossChainMessage, MessageBody, MessageId};

use crate::error::RelayResult;
use crate::types::Domain;

use async_trait::async_trait;
use ethers::types::Address;

/// Sending side of the relay, bound to one origin domain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Domain messages dispatched through this client originate from
    fn origin_domain(&self) -> Domain;

    /// Hand a message to the transport.
    ///
    /// Fails with `RelayUnavailable` when the transport cannot accept it;
    /// the caller owns retry and backoff.
    async fn dispatch(
        &self,
        destination: Domain,
        recipient: Address,
        body: Vec<u8>,
    ) -> RelayResult<MessageId>;
}
