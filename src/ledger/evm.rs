//! Ledger adapters for deployed contracts
//!
//! Reads go through `eth_call`; writes through the shared transaction
//! sender. Business refusals are detected by reading state first, so a
//! revert that still slips through is reported as unexpected.

use super::{AssetView, CollateralLedger, LedgerLoanStatus, LoanLedger, LoanView};
use crate::chain::{encode_call, ChainProvider};
use crate::error::{CollateralError, LoanLedgerError, RelayerError};
use crate::tx::TransactionSender;
use crate::types::{AssetId, Domain, LoanId};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, U256};
use std::sync::Arc;
use tracing::{debug, info};

/// How a failed chain interaction should be reported
enum Failure {
    Unavailable(String),
    Ambiguous(String),
    Reverted(String),
}

impl From<RelayerError> for Failure {
    fn from(err: RelayerError) -> Self {
        match err {
            RelayerError::Timeout { operation } => Failure::Ambiguous(operation),
            RelayerError::Reverted { tx_hash, .. } => Failure::Reverted(tx_hash),
            RelayerError::Contract(msg) => Failure::Reverted(msg),
            RelayerError::GasEstimation(msg) if msg.contains("revert") => Failure::Reverted(msg),
            other => Failure::Unavailable(other.to_string()),
        }
    }
}

impl From<Failure> for CollateralError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Unavailable(msg) => CollateralError::Unavailable(msg),
            Failure::Ambiguous(msg) => CollateralError::Ambiguous(msg),
            Failure::Reverted(msg) => CollateralError::Reverted(msg),
        }
    }
}

impl From<Failure> for LoanLedgerError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Unavailable(msg) => LoanLedgerError::Unavailable(msg),
            Failure::Ambiguous(msg) => LoanLedgerError::Ambiguous(msg),
            Failure::Reverted(msg) => LoanLedgerError::Reverted(msg),
        }
    }
}

async fn read(
    provider: &ChainProvider,
    to: Address,
    signature: &str,
    args: &[Token],
    outputs: &[ParamType],
) -> Result<Vec<Token>, RelayerError> {
    let raw = provider.call(to, encode_call(signature, args)).await?;
    abi::decode(outputs, &raw)
        .map_err(|e| RelayerError::EventParsing(format!("{} returned bad data: {}", signature, e)))
}

fn timestamp(secs: U256) -> DateTime<Utc> {
    Utc.timestamp_opt(i64::try_from(secs.low_u64()).unwrap_or(i64::MAX), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Collateral manager plus the ERC-721 IP registry on the source chain
pub struct EvmCollateralLedger {
    provider: Arc<ChainProvider>,
    sender: Arc<TransactionSender>,
    manager: Address,
    registry: Address,
}

impl EvmCollateralLedger {
    pub fn new(
        provider: Arc<ChainProvider>,
        sender: Arc<TransactionSender>,
        manager: Address,
        registry: Address,
    ) -> Self {
        Self {
            provider,
            sender,
            manager,
            registry,
        }
    }

    /// `ownerOf` reverts for unminted tokens
    async fn owner_of(&self, asset_id: AssetId) -> Result<Option<Address>, CollateralError> {
        match read(
            &self.provider,
            self.registry,
            "ownerOf(uint256)",
            &[Token::Uint(asset_id.0.into())],
            &[ParamType::Address],
        )
        .await
        {
            Ok(tokens) => Ok(tokens.into_iter().next().and_then(Token::into_address)),
            Err(RelayerError::Contract(_)) => Ok(None),
            Err(e) => Err(Failure::from(e).into()),
        }
    }

    async fn send(&self, to: Address, data: ethers::types::Bytes) -> Result<(), CollateralError> {
        self.sender
            .send_call(self.provider.chain_id(), to, data, U256::zero())
            .await
            .map(|_| ())
            .map_err(|e| Failure::from(e).into())
    }
}

#[async_trait]
impl CollateralLedger for EvmCollateralLedger {
    fn domain(&self) -> Domain {
        self.provider.domain()
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
        let view = self
            .asset(asset_id)
            .await?
            .ok_or(CollateralError::UnknownAsset(asset_id))?;
        if view.owner != owner {
            return Err(CollateralError::NotOwner(asset_id));
        }
        if view.approved_operator == Some(operator) {
            return Ok(());
        }
        // Only the owner can sign an ERC-721 approval
        if owner != self.sender.wallet_address() {
            return Err(CollateralError::NotOwner(asset_id));
        }

        let data = encode_call(
            "approve(address,uint256)",
            &[Token::Address(operator), Token::Uint(asset_id.0.into())],
        );
        self.send(self.registry, data).await?;
        info!("Approved {:?} for asset {}", operator, asset_id);
        Ok(())
    }

    async fn lock(&self, asset_id: AssetId, loan_id: LoanId) -> Result<(), CollateralError> {
        let view = self
            .asset(asset_id)
            .await?
            .ok_or(CollateralError::UnknownAsset(asset_id))?;
        match view.locked_by {
            Some(holder) if holder == loan_id => return Ok(()),
            Some(holder) => {
                return Err(CollateralError::AlreadyLocked {
                    asset_id,
                    locked_by: holder,
                })
            }
            None => {}
        }
        if view.approved_operator != Some(self.manager) {
            return Err(CollateralError::NotApproved(asset_id));
        }

        let data = encode_call(
            "lockCollateral(uint256,bytes32)",
            &[
                Token::Uint(asset_id.0.into()),
                Token::FixedBytes(loan_id.as_bytes().to_vec()),
            ],
        );
        self.send(self.manager, data).await?;
        debug!("Locked asset {} for loan {}", asset_id, loan_id);
        Ok(())
    }

    async fn release(&self, asset_id: AssetId, loan_id: LoanId) -> Result<(), CollateralError> {
        let view = self
            .asset(asset_id)
            .await?
            .ok_or(CollateralError::UnknownAsset(asset_id))?;
        match view.locked_by {
            None => return Ok(()),
            Some(holder) if holder != loan_id => {
                return Err(CollateralError::NotLockedByLoan { asset_id, loan_id })
            }
            Some(_) => {}
        }

        let data = encode_call(
            "releaseCollateral(uint256,bytes32)",
            &[
                Token::Uint(asset_id.0.into()),
                Token::FixedBytes(loan_id.as_bytes().to_vec()),
            ],
        );
        self.send(self.manager, data).await?;
        debug!("Released asset {} from loan {}", asset_id, loan_id);
        Ok(())
    }

    async fn asset(&self, asset_id: AssetId) -> Result<Option<AssetView>, CollateralError> {
        let Some(owner) = self.owner_of(asset_id).await? else {
            return Ok(None);
        };
        let token = Token::Uint(asset_id.0.into());

        let approved = read(
            &self.provider,
            self.registry,
            "getApproved(uint256)",
            &[token.clone()],
            &[ParamType::Address],
        )
        .await
        .map_err(Failure::from)?
        .into_iter()
        .next()
        .and_then(Token::into_address)
        .filter(|a| !a.is_zero());

        let locked_by = read(
            &self.provider,
            self.manager,
            "lockedBy(uint256)",
            &[token],
            &[ParamType::FixedBytes(32)],
        )
        .await
        .map_err(Failure::from)?
        .into_iter()
        .next()
        .and_then(Token::into_fixed_bytes)
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .filter(|bytes| bytes != &[0u8; 32])
        .map(LoanId);

        Ok(Some(AssetView {
            asset_id,
            owner,
            approved_operator: approved,
            locked_by,
        }))
    }

    async fn token_uri(&self, asset_id: AssetId) -> Result<String, CollateralError> {
        match read(
            &self.provider,
            self.registry,
            "tokenURI(uint256)",
            &[Token::Uint(asset_id.0.into())],
            &[ParamType::String],
        )
        .await
        {
            Ok(tokens) => tokens
                .into_iter()
                .next()
                .and_then(Token::into_string)
                .ok_or(CollateralError::UnknownAsset(asset_id)),
            Err(RelayerError::Contract(_)) => Err(CollateralError::UnknownAsset(asset_id)),
            Err(e) => Err(Failure::from(e).into()),
        }
    }
}

/// Loan manager on the destination chain
pub struct EvmLoanLedger {
    provider: Arc<ChainProvider>,
    sender: Arc<TransactionSender>,
    manager: Address,
}

impl EvmLoanLedger {
    pub fn new(provider: Arc<ChainProvider>, sender: Arc<TransactionSender>, manager: Address) -> Self {
        Self {
            provider,
            sender,
            manager,
        }
    }

    pub async fn available_liquidity(&self) -> Result<U256, LoanLedgerError> {
        read(
            &self.provider,
            self.manager,
            "availableLiquidity()",
            &[],
            &[ParamType::Uint(256)],
        )
        .await
        .map_err(|e| LoanLedgerError::from(Failure::from(e)))?
        .into_iter()
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| LoanLedgerError::Unavailable("empty availableLiquidity result".to_string()))
    }

    async fn require_loan(&self, loan_id: LoanId) -> Result<LoanView, LoanLedgerError> {
        self.loan(loan_id)
            .await?
            .ok_or(LoanLedgerError::UnknownLoan(loan_id))
    }

    async fn send(
        &self,
        data: ethers::types::Bytes,
        value: U256,
    ) -> Result<(), LoanLedgerError> {
        self.sender
            .send_call(self.provider.chain_id(), self.manager, data, value)
            .await
            .map(|_| ())
            .map_err(|e| Failure::from(e).into())
    }
}

#[async_trait]
impl LoanLedger for EvmLoanLedger {
    fn domain(&self) -> Domain {
        self.provider.domain()
    }

    async fn issue_loan(
        &self,
        loan_id: LoanId,
        borrower: Address,
        principal: U256,
        interest_rate_bps: u32,
        due_at: DateTime<Utc>,
    ) -> Result<(), LoanLedgerError> {
        if self.loan(loan_id).await?.is_some() {
            return Err(LoanLedgerError::LoanAlreadyIssued(loan_id));
        }
        let available = self.available_liquidity().await?;
        if available < principal {
            return Err(LoanLedgerError::InsufficientLiquidity {
                available,
                requested: principal,
            });
        }

        let data = encode_call(
            "issueLoan(bytes32,address,uint256,uint32,uint64)",
            &[
                Token::FixedBytes(loan_id.as_bytes().to_vec()),
                Token::Address(borrower),
                Token::Uint(principal),
                Token::Uint(interest_rate_bps.into()),
                Token::Uint(U256::from(due_at.timestamp().max(0) as u64)),
            ],
        );
        self.send(data, U256::zero()).await?;
        info!("Issued loan {} to {:?}", loan_id, borrower);
        Ok(())
    }

    async fn record_repayment(&self, loan_id: LoanId, amount: U256) -> Result<(), LoanLedgerError> {
        let view = self.require_loan(loan_id).await?;
        if view.status != LedgerLoanStatus::Active {
            return Err(LoanLedgerError::LoanNotActive(loan_id));
        }
        if amount < view.repayment_due {
            return Err(LoanLedgerError::AmountInsufficient {
                due: view.repayment_due,
                paid: amount,
            });
        }

        let data = encode_call(
            "repay(bytes32)",
            &[Token::FixedBytes(loan_id.as_bytes().to_vec())],
        );
        self.send(data, amount).await
    }

    async fn mark_defaulted(&self, loan_id: LoanId) -> Result<(), LoanLedgerError> {
        let view = self.require_loan(loan_id).await?;
        match view.status {
            LedgerLoanStatus::Defaulted => return Ok(()),
            LedgerLoanStatus::Repaid => return Err(LoanLedgerError::LoanNotActive(loan_id)),
            LedgerLoanStatus::Active => {}
        }
        if Utc::now() <= view.due_at {
            return Err(LoanLedgerError::LoanNotOverdue(loan_id));
        }

        let data = encode_call(
            "markDefaulted(bytes32)",
            &[Token::FixedBytes(loan_id.as_bytes().to_vec())],
        );
        self.send(data, U256::zero()).await
    }

    async fn loan(&self, loan_id: LoanId) -> Result<Option<LoanView>, LoanLedgerError> {
        let tokens = read(
            &self.provider,
            self.manager,
            "loans(bytes32)",
            &[Token::FixedBytes(loan_id.as_bytes().to_vec())],
            &[
                ParamType::Address,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(64),
                ParamType::Uint(64),
                ParamType::Uint(8),
            ],
        )
        .await
        .map_err(Failure::from)?;

        Ok(loan_view(loan_id, tokens))
    }
}

/// Decode the `loans(bytes32)` tuple; status 0 means no such loan
fn loan_view(loan_id: LoanId, tokens: Vec<Token>) -> Option<LoanView> {
    let mut it = tokens.into_iter();
    let borrower = it.next()?.into_address()?;
    let principal = it.next()?.into_uint()?;
    let repayment_due = it.next()?.into_uint()?;
    let issued_at = timestamp(it.next()?.into_uint()?);
    let due_at = timestamp(it.next()?.into_uint()?);
    let status = match it.next()?.into_uint()?.low_u64() {
        1 => LedgerLoanStatus::Active,
        2 => LedgerLoanStatus::Repaid,
        3 => LedgerLoanStatus::Defaulted,
        _ => return None,
    };

    Some(LoanView {
        loan_id,
        borrower,
        principal,
        repayment_due,
        issued_at,
        due_at,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(status: u64) -> Vec<Token> {
        vec![
            Token::Address(Address::repeat_byte(0x11)),
            Token::Uint(U256::from(1000)),
            Token::Uint(U256::from(1050)),
            Token::Uint(U256::from(1_700_000_000u64)),
            Token::Uint(U256::from(1_700_086_400u64)),
            Token::Uint(U256::from(status)),
        ]
    }

    #[test]
    fn test_loan_tuple_decodes() {
        let view = loan_view(LoanId([1u8; 32]), tuple(2)).unwrap();
        assert_eq!(view.status, LedgerLoanStatus::Repaid);
        assert_eq!(view.repayment_due, U256::from(1050));
        assert_eq!((view.due_at - view.issued_at).num_days(), 1);
    }

    #[test]
    fn test_empty_slot_is_no_loan() {
        assert!(loan_view(LoanId([1u8; 32]), tuple(0)).is_none());
    }

    #[test]
    fn test_receipt_timeout_is_ambiguous() {
        let err: CollateralError = Failure::from(RelayerError::Timeout {
            operation: "receipt".to_string(),
        })
        .into();
        assert!(matches!(err, CollateralError::Ambiguous(_)));

        let err: LoanLedgerError = Failure::from(RelayerError::ChainConnection {
            chain_id: 1,
            message: "connection refused".to_string(),
        })
        .into();
        assert!(matches!(err, LoanLedgerError::Unavailable(_)));
    }
}
