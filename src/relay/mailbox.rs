//! Relay client backed by an on-chain mailbox contract

use super::{MessageId, RelayClient};
use crate::chain::encode_call;
use crate::error::{RelayError, RelayResult};
use crate::events::topics;
use crate::tx::TransactionSender;
use crate::types::Domain;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, TransactionReceipt, H256, U256};
use std::sync::Arc;
use tracing::debug;

/// Dispatches through `dispatch(uint32,bytes32,bytes)` on the origin chain's mailbox
pub struct MailboxRelay {
    sender: Arc<TransactionSender>,
    chain_id: u64,
    origin: Domain,
    mailbox: Address,
}

impl MailboxRelay {
    pub fn new(sender: Arc<TransactionSender>, chain_id: u64, origin: Domain, mailbox: Address) -> Self {
        Self {
            sender,
            chain_id,
            origin,
            mailbox,
        }
    }
}

/// Recipient as the mailbox expects it: left-padded to 32 bytes
fn recipient_word(recipient: Address) -> [u8; 32] {
    H256::from(recipient).to_fixed_bytes()
}

/// Message id from the mailbox's `DispatchId` log
fn dispatched_id(receipt: &TransactionReceipt, mailbox: Address) -> Option<MessageId> {
    receipt
        .logs
        .iter()
        .filter(|log| log.address == mailbox)
        .find(|log| log.topics.first() == Some(&*topics::DISPATCH_ID))
        .and_then(|log| log.topics.get(1))
        .map(|topic| MessageId(topic.to_fixed_bytes()))
}

#[async_trait]
impl RelayClient for MailboxRelay {
    fn origin_domain(&self) -> Domain {
        self.origin
    }

    async fn dispatch(
        &self,
        destination: Domain,
        recipient: Address,
        body: Vec<u8>,
    ) -> RelayResult<MessageId> {
        let data = encode_call(
            "dispatch(uint32,bytes32,bytes)",
            &[
                Token::Uint(U256::from(destination)),
                Token::FixedBytes(recipient_word(recipient).to_vec()),
                Token::Bytes(body),
            ],
        );

        let receipt = self
            .sender
            .send_call(self.chain_id, self.mailbox, data, U256::zero())
            .await
            .map_err(RelayError::from)?;

        let id = dispatched_id(&receipt, self.mailbox).ok_or_else(|| {
            RelayError::Ambiguous(format!(
                "no DispatchId log in {:?}",
                receipt.transaction_hash
            ))
        })?;
        debug!("Mailbox on domain {} dispatched {} to {}", self.origin, id, destination);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Log;

    #[test]
    fn test_recipient_is_left_padded() {
        let word = recipient_word(Address::repeat_byte(0xab));
        assert_eq!(&word[..12], &[0u8; 12]);
        assert_eq!(&word[12..], &[0xab; 20]);
    }

    #[test]
    fn test_message_id_comes_from_mailbox_log_only() {
        let mailbox = Address::repeat_byte(0x01);
        let id = H256::repeat_byte(0x77);
        let log = |address| Log {
            address,
            topics: vec![*topics::DISPATCH_ID, id],
            ..Default::default()
        };

        let receipt = TransactionReceipt {
            logs: vec![log(Address::repeat_byte(0x02))],
            ..Default::default()
        };
        assert_eq!(dispatched_id(&receipt, mailbox), None);

        let receipt = TransactionReceipt {
            logs: vec![log(Address::repeat_byte(0x02)), log(mailbox)],
            ..Default::default()
        };
        assert_eq!(dispatched_id(&receipt, mailbox), Some(MessageId(id.to_fixed_bytes())));
    }
}
