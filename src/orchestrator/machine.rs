//! Loan lifecycle transition table
//!
//! Pure function of (current state, trigger). Anything not listed is an
//! out-of-order or duplicate trigger and yields `None`; terminal states
//! accept nothing.

use crate::types::LoanState;

/// Inputs that can move a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `Locked` observed (or the asset found locked by this loan)
    LockObserved,
    /// Collateral ledger refused the lock on business grounds
    RequestRejected,
    /// The relay accepted an issue or release message
    DispatchAccepted,
    /// `Issued` observed on the destination ledger
    IssuedObserved,
    /// Loan funds reached the borrower
    Disbursed,
    /// `Repaid` observed on the destination ledger
    RepaidObserved,
    /// `Released` observed on the source ledger
    ReleasedObserved,
    /// Budget exhausted before disbursement and the collateral was handed back
    CollateralRefunded,
    /// Due date passed without repayment and the ledger marked the default
    DefaultDeclared,
}

pub fn next_state(from: LoanState, trigger: Trigger) -> Option<LoanState> {
    use LoanState::*;
    use Trigger::*;

    match (from, trigger) {
        (Requested, LockObserved) => Some(CollateralLocked),
        (Requested, RequestRejected) => Some(Failed),

        (CollateralLocked, DispatchAccepted) => Some(MessageSentToDest),
        (MessageSentToDest, DispatchAccepted) => Some(MessageSentToDest),
        (MessageSentToDest, IssuedObserved) => Some(Issued),

        (Requested | CollateralLocked | MessageSentToDest, CollateralRefunded) => Some(Failed),

        (Issued, Disbursed) => Some(Active),
        (Active, RepaidObserved) => Some(RepaymentConfirmed),
        (Active, DefaultDeclared) => Some(Defaulted),

        (RepaymentConfirmed, DispatchAccepted) => Some(RepaymentSent),
        (RepaymentSent, DispatchAccepted) => Some(RepaymentSent),
        (RepaymentSent, ReleasedObserved) => Some(CollateralReleased),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LoanState::*;
    use Trigger::*;

    const TRIGGERS: [Trigger; 9] = [
        LockObserved,
        RequestRejected,
        DispatchAccepted,
        IssuedObserved,
        Disbursed,
        RepaidObserved,
        ReleasedObserved,
        CollateralRefunded,
        DefaultDeclared,
    ];

    #[test]
    fn test_happy_path() {
        let path = [
            (Requested, LockObserved, CollateralLocked),
            (CollateralLocked, DispatchAccepted, MessageSentToDest),
            (MessageSentToDest, IssuedObserved, Issued),
            (Issued, Disbursed, Active),
            (Active, RepaidObserved, RepaymentConfirmed),
            (RepaymentConfirmed, DispatchAccepted, RepaymentSent),
            (RepaymentSent, ReleasedObserved, CollateralReleased),
        ];
        for (from, trigger, to) in path {
            assert_eq!(next_state(from, trigger), Some(to), "{:?} + {:?}", from, trigger);
        }
    }

    #[test]
    fn test_redispatch_keeps_state() {
        assert_eq!(
            next_state(MessageSentToDest, DispatchAccepted),
            Some(MessageSentToDest)
        );
        assert_eq!(next_state(RepaymentSent, DispatchAccepted), Some(RepaymentSent));
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for state in [CollateralReleased, Defaulted, Failed] {
            for trigger in TRIGGERS {
                assert_eq!(next_state(state, trigger), None);
            }
        }
    }

    #[test]
    fn test_failed_only_reachable_before_disbursement() {
        for state in LoanState::all() {
            for trigger in TRIGGERS {
                if next_state(state, trigger) == Some(Failed) {
                    assert!(state.is_pre_disbursement(), "{:?} -> Failed", state);
                }
            }
        }
    }

    #[test]
    fn test_disbursed_states_end_released_or_defaulted() {
        for state in [Issued, Active, RepaymentConfirmed, RepaymentSent] {
            for trigger in TRIGGERS {
                if let Some(to) = next_state(state, trigger) {
                    assert!(
                        to.holds_collateral() || to == CollateralReleased || to == Defaulted,
                        "{:?} + {:?} -> {:?}",
                        state,
                        trigger,
                        to
                    );
                }
            }
        }
    }

    #[test]
    fn test_duplicate_lock_is_ignored_after_first() {
        let first = next_state(Requested, LockObserved).unwrap();
        assert_eq!(next_state(first, LockObserved), None);
    }

    #[test]
    fn test_default_only_from_active() {
        for state in LoanState::all() {
            let result = next_state(state, DefaultDeclared);
            if state == Active {
                assert_eq!(result, Some(Defaulted));
            } else {
                assert_eq!(result, None);
            }
        }
    }
}
