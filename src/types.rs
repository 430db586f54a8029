//! Core domain types: loan and asset identifiers, loan state and the
//! orchestrator's per-loan tracking record.

use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Relay-level identifier of a chain endpoint
pub type Domain = u32;

/// Basis-point denominator for interest rates
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Loan identifier: keccak256 over the packed request tuple
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoanId(pub [u8; 32]);

impl LoanId {
    /// Derive the id of a loan request.
    ///
    /// Packed layout: `uint32 sourceDomain ++ uint256 assetId ++ address borrower ++ uint256 nonce`.
    /// The nonce makes every request unique, so a replayed stale request
    /// message cannot alias a newer loan on the same asset.
    pub fn derive(source_domain: Domain, asset_id: AssetId, borrower: Address, nonce: U256) -> Self {
        let mut asset_word = [0u8; 32];
        U256::from(asset_id.0).to_big_endian(&mut asset_word);
        let mut nonce_word = [0u8; 32];
        nonce.to_big_endian(&mut nonce_word);

        let mut hasher = Keccak256::new();
        hasher.update(source_domain.to_be_bytes());
        hasher.update(asset_word);
        hasher.update(borrower.as_bytes());
        hasher.update(nonce_word);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for LoanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for LoanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoanId({})", self.to_hex())
    }
}

impl FromStr for LoanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| format!("invalid loan id hex: {}", e))?;
        if bytes.len() != 32 {
            return Err(format!("loan id must be 32 bytes, got {}", bytes.len()));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl Serialize for LoanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for LoanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Token id of a registered IP asset on the source chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub u64);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a loan as tracked by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanState {
    Requested,
    CollateralLocked,
    MessageSentToDest,
    Issued,
    Active,
    RepaymentConfirmed,
    RepaymentSent,
    CollateralReleased,
    Defaulted,
    Failed,
}

impl LoanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanState::Requested => "requested",
            LoanState::CollateralLocked => "collateral_locked",
            LoanState::MessageSentToDest => "message_sent_to_dest",
            LoanState::Issued => "issued",
            LoanState::Active => "active",
            LoanState::RepaymentConfirmed => "repayment_confirmed",
            LoanState::RepaymentSent => "repayment_sent",
            LoanState::CollateralReleased => "collateral_released",
            LoanState::Defaulted => "defaulted",
            LoanState::Failed => "failed",
        }
    }

    /// Terminal states are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoanState::CollateralReleased | LoanState::Defaulted | LoanState::Failed
        )
    }

    /// States in which funds have been disbursed and the asset must stay locked
    pub fn holds_collateral(&self) -> bool {
        matches!(
            self,
            LoanState::Issued
                | LoanState::Active
                | LoanState::RepaymentConfirmed
                | LoanState::RepaymentSent
        )
    }

    /// States from which the loan may still end in `Failed`
    pub fn is_pre_disbursement(&self) -> bool {
        matches!(
            self,
            LoanState::Requested | LoanState::CollateralLocked | LoanState::MessageSentToDest
        )
    }

    pub fn all() -> [LoanState; 10] {
        [
            LoanState::Requested,
            LoanState::CollateralLocked,
            LoanState::MessageSentToDest,
            LoanState::Issued,
            LoanState::Active,
            LoanState::RepaymentConfirmed,
            LoanState::RepaymentSent,
            LoanState::CollateralReleased,
            LoanState::Defaulted,
            LoanState::Failed,
        ]
    }
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoanState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LoanState::all()
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown loan state: {}", s))
    }
}

/// A cross-chain loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub loan_id: LoanId,
    pub source_domain: Domain,
    pub destination_domain: Domain,
    pub asset_id: AssetId,
    pub borrower: Address,
    pub principal: U256,
    pub interest_rate_bps: u32,
    pub duration_secs: u64,
    /// Set when the destination ledger reports issuance
    pub issued_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub state: LoanState,
}

impl Loan {
    /// Minimum accepted repayment: `principal * (1 + rate/10000)`, rounded up
    /// to the next whole unit. `None` when the amount does not fit in a `uint256`.
    pub fn repayment_due(&self) -> Option<U256> {
        repayment_due(self.principal, self.interest_rate_bps)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due_at.map(|due| now > due).unwrap_or(false)
    }
}

/// Repayment owed on `principal` at `interest_rate_bps`, ceiling-rounded
pub fn repayment_due(principal: U256, interest_rate_bps: u32) -> Option<U256> {
    let denominator = U256::from(BPS_DENOMINATOR);
    let multiplier = U256::from(BPS_DENOMINATOR).checked_add(U256::from(interest_rate_bps))?;
    let numerator = principal.checked_mul(multiplier)?;
    let (quotient, remainder) = numerator.div_mod(denominator);
    if remainder.is_zero() {
        Some(quotient)
    } else {
        Some(quotient + U256::one())
    }
}

/// The orchestrator's durable per-loan record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub loan: Loan,
    /// Attempts made in the current phase (lock, issue dispatch or release dispatch)
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Latest deadline carried by an issue message; no copy issues after it
    pub issue_expires_at: Option<DateTime<Utc>>,
    pub last_observed_event_id: Option<String>,
    pub last_error: Option<String>,
    /// Set when an unexpected error stopped this loan pending operator action
    pub halted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanRecord {
    pub fn new(loan: Loan, now: DateTime<Utc>) -> Self {
        Self {
            loan,
            attempt_count: 0,
            last_attempt_at: None,
            issue_expires_at: None,
            last_observed_event_id: None,
            last_error: None,
            halted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn loan_id(&self) -> LoanId {
        self.loan.loan_id
    }

    pub fn state(&self) -> LoanState {
        self.loan.state
    }

    /// Start a new phase: the attempt budget is per phase
    pub fn reset_attempts(&mut self) {
        self.attempt_count = 0;
        self.last_attempt_at = None;
        self.last_error = None;
    }

    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
    }
}

/// Time source shared by the engine and the in-process ledgers
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    /// Milliseconds since the epoch, moved only by `advance`/`set`
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn manual(start: DateTime<Utc>) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start.timestamp_millis())))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Manual(millis) => Utc
                .timestamp_millis_opt(millis.load(Ordering::SeqCst))
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    /// No-op on the system clock
    pub fn advance(&self, by: chrono::Duration) {
        if let Clock::Manual(millis) = self {
            millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Clock::Manual(millis) = self {
            millis.store(to.timestamp_millis(), Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loan_id_is_deterministic_and_nonce_sensitive() {
        let borrower = Address::repeat_byte(0x11);
        let a = LoanId::derive(1, AssetId(5), borrower, U256::from(1));
        let b = LoanId::derive(1, AssetId(5), borrower, U256::from(1));
        let c = LoanId::derive(1, AssetId(5), borrower, U256::from(2));
        let d = LoanId::derive(2, AssetId(5), borrower, U256::from(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_loan_id_hex_parse() {
        let id = LoanId::derive(7, AssetId(1), Address::zero(), U256::zero());
        let parsed: LoanId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("0x1234".parse::<LoanId>().is_err());
    }

    #[test]
    fn test_loan_state_strings() {
        for state in LoanState::all() {
            assert_eq!(state.as_str().parse::<LoanState>().unwrap(), state);
        }
        assert!("bogus".parse::<LoanState>().is_err());
    }

    #[test]
    fn test_repayment_due_rounds_up() {
        // 0.35 ETH at 5.2%
        let principal = U256::from(350_000_000_000_000_000u64);
        assert_eq!(
            repayment_due(principal, 520),
            Some(U256::from(368_200_000_000_000_000u64))
        );
        // 1 wei at 1 bps cannot be represented exactly
        assert_eq!(repayment_due(U256::one(), 1), Some(U256::from(2)));
        assert_eq!(repayment_due(U256::from(100), 0), Some(U256::from(100)));
    }

    #[test]
    fn test_repayment_due_refuses_overflow() {
        assert_eq!(repayment_due(U256::MAX, 500), None);
        assert_eq!(repayment_due(U256::MAX / 2, 0), None);
        let largest = U256::MAX / U256::from(10_500);
        assert!(repayment_due(largest, 500).unwrap() > largest);
    }

    #[test]
    fn test_manual_clock_only_moves_when_told() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = Clock::manual(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::days(10));
        assert_eq!(clock.now(), start + chrono::Duration::days(10));

        let shared = clock.clone();
        shared.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_terminal_and_collateral_states_are_disjoint() {
        for state in LoanState::all() {
            assert!(!(state.is_terminal() && state.holds_collateral()));
        }
    }
}
