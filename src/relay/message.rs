//! Relay message envelope and the loan protocol bodies carried in it

use crate::error::{RelayError, RelayResult};
use crate::types::{AssetId, Domain, LoanId};

use chrono::{DateTime, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Deterministic message identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    /// keccak256(`uint32 sourceDomain ++ bytes32 sender ++ uint64 nonce`)
    ///
    /// Every physical copy of one dispatch shares this id.
    pub fn derive(source_domain: Domain, sender: Address, nonce: u64) -> Self {
        let mut sender_word = [0u8; 32];
        sender_word[12..].copy_from_slice(sender.as_bytes());

        let mut hasher = Keccak256::new();
        hasher.update(source_domain.to_be_bytes());
        hasher.update(sender_word);
        hasher.update(nonce.to_be_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

/// A message as seen by the receiving side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub id: MessageId,
    pub source_domain: Domain,
    pub destination_domain: Domain,
    pub sender: Address,
    pub recipient: Address,
    pub body: Vec<u8>,
    pub nonce: u64,
    pub dispatched_at: DateTime<Utc>,
}

const KIND_ISSUE_LOAN: u8 = 1;
const KIND_RELEASE_COLLATERAL: u8 = 2;

/// Loan protocol payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Source → destination: collateral is locked, issue the loan
    IssueLoan {
        loan_id: LoanId,
        asset_id: AssetId,
        borrower: Address,
        principal: U256,
        interest_rate_bps: u32,
        duration_secs: u64,
        /// Unix seconds; the loan manager refuses this message from then on
        expires_at: u64,
    },
    /// Destination → source: repayment confirmed, release the collateral
    ReleaseCollateral { loan_id: LoanId, asset_id: AssetId },
}

impl MessageBody {
    pub fn loan_id(&self) -> LoanId {
        match self {
            MessageBody::IssueLoan { loan_id, .. } => *loan_id,
            MessageBody::ReleaseCollateral { loan_id, .. } => *loan_id,
        }
    }

    /// Whether an issue message has passed its deadline at `now`; release messages never expire
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            MessageBody::IssueLoan { expires_at, .. } => {
                now.timestamp() >= (*expires_at).min(i64::MAX as u64) as i64
            }
            MessageBody::ReleaseCollateral { .. } => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::IssueLoan { .. } => "issue_loan",
            MessageBody::ReleaseCollateral { .. } => "release_collateral",
        }
    }

    /// ABI-encode as a tuple led by a `uint8` kind tag
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MessageBody::IssueLoan {
                loan_id,
                asset_id,
                borrower,
                principal,
                interest_rate_bps,
                duration_secs,
                expires_at,
            } => abi::encode(&[
                Token::Uint(U256::from(KIND_ISSUE_LOAN)),
                Token::FixedBytes(loan_id.0.to_vec()),
                Token::Uint(U256::from(asset_id.0)),
                Token::Address(*borrower),
                Token::Uint(*principal),
                Token::Uint(U256::from(*interest_rate_bps)),
                Token::Uint(U256::from(*duration_secs)),
                Token::Uint(U256::from(*expires_at)),
            ]),
            MessageBody::ReleaseCollateral { loan_id, asset_id } => abi::encode(&[
                Token::Uint(U256::from(KIND_RELEASE_COLLATERAL)),
                Token::FixedBytes(loan_id.0.to_vec()),
                Token::Uint(U256::from(asset_id.0)),
            ]),
        }
    }

    pub fn decode(data: &[u8]) -> RelayResult<Self> {
        if data.len() < 32 {
            return Err(RelayError::Encoding(format!(
                "message body too short: {} bytes",
                data.len()
            )));
        }
        let kind = U256::from_big_endian(&data[..32]);
        if kind > U256::from(u8::MAX) {
            return Err(RelayError::Encoding(format!("invalid message kind {}", kind)));
        }

        match kind.as_u32() as u8 {
            KIND_ISSUE_LOAN => {
                let tokens = decode_tokens(
                    &[
                        ParamType::Uint(8),
                        ParamType::FixedBytes(32),
                        ParamType::Uint(256),
                        ParamType::Address,
                        ParamType::Uint(256),
                        ParamType::Uint(32),
                        ParamType::Uint(64),
                        ParamType::Uint(64),
                    ],
                    data,
                )?;
                Ok(MessageBody::IssueLoan {
                    loan_id: loan_id_token(&tokens[1])?,
                    asset_id: AssetId(uint_token(&tokens[2])?.low_u64()),
                    borrower: tokens[3]
                        .clone()
                        .into_address()
                        .ok_or_else(|| RelayError::Encoding("borrower".to_string()))?,
                    principal: uint_token(&tokens[4])?,
                    interest_rate_bps: uint_token(&tokens[5])?.low_u32(),
                    duration_secs: uint_token(&tokens[6])?.low_u64(),
                    expires_at: uint_token(&tokens[7])?.low_u64(),
                })
            }
            KIND_RELEASE_COLLATERAL => {
                let tokens = decode_tokens(
                    &[
                        ParamType::Uint(8),
                        ParamType::FixedBytes(32),
                        ParamType::Uint(256),
                    ],
                    data,
                )?;
                Ok(MessageBody::ReleaseCollateral {
                    loan_id: loan_id_token(&tokens[1])?,
                    asset_id: AssetId(uint_token(&tokens[2])?.low_u64()),
                })
            }
            other => Err(RelayError::Encoding(format!("unknown message kind {}", other))),
        }
    }
}

fn decode_tokens(types: &[ParamType], data: &[u8]) -> RelayResult<Vec<Token>> {
    abi::decode(types, data).map_err(|e| RelayError::Encoding(e.to_string()))
}

fn uint_token(token: &Token) -> RelayResult<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| RelayError::Encoding("expected uint".to_string()))
}

fn loan_id_token(token: &Token) -> RelayResult<LoanId> {
    let bytes = token
        .clone()
        .into_fixed_bytes()
        .ok_or_else(|| RelayError::Encoding("expected bytes32".to_string()))?;
    if bytes.len() != 32 {
        return Err(RelayError::Encoding("loan id must be 32 bytes".to_string()));
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&bytes);
    Ok(LoanId(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_message_id_depends_on_origin_sender_and_nonce() {
        let sender = Address::repeat_byte(0xaa);
        let id = MessageId::derive(1, sender, 7);
        assert_eq!(id, MessageId::derive(1, sender, 7));
        assert_ne!(id, MessageId::derive(2, sender, 7));
        assert_ne!(id, MessageId::derive(1, Address::repeat_byte(0xbb), 7));
        assert_ne!(id, MessageId::derive(1, sender, 8));
    }

    #[test]
    fn test_issue_body_decodes_to_same_fields() {
        let body = MessageBody::IssueLoan {
            loan_id: LoanId([9u8; 32]),
            asset_id: AssetId(5),
            borrower: Address::repeat_byte(0x22),
            principal: U256::exp10(18),
            interest_rate_bps: 520,
            duration_secs: 30 * 86_400,
            expires_at: 1_717_243_800,
        };
        assert_eq!(MessageBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn test_issue_expires_at_its_deadline() {
        let deadline = Utc.with_ymd_and_hms(2024, 6, 1, 12, 10, 0).unwrap();
        let body = MessageBody::IssueLoan {
            loan_id: LoanId([9u8; 32]),
            asset_id: AssetId(5),
            borrower: Address::repeat_byte(0x22),
            principal: U256::exp10(18),
            interest_rate_bps: 500,
            duration_secs: 86_400,
            expires_at: deadline.timestamp() as u64,
        };
        assert!(!body.is_expired(deadline - chrono::Duration::seconds(1)));
        assert!(body.is_expired(deadline));

        let release = MessageBody::ReleaseCollateral {
            loan_id: LoanId([9u8; 32]),
            asset_id: AssetId(5),
        };
        assert!(!release.is_expired(deadline + chrono::Duration::days(365)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(MessageBody::decode(&[0u8; 4]).is_err());

        let mut unknown = vec![0u8; 96];
        unknown[31] = 9;
        assert!(matches!(
            MessageBody::decode(&unknown),
            Err(RelayError::Encoding(_))
        ));
    }
}
