// crates/keel-protocol/src/replay.rs
//
// Rebuild share balances from an event log.

use std::collections::BTreeMap;

use keel_core::error::KeelError;
use keel_core::events::{EventRecord, LedgerEvent};
use keel_core::{Address, Amount, LayerIndex, LayerKind};

/// (ledger, entry, account)
pub type ShareKey = (LayerKind, LayerIndex, Address);

/// Fold every share movement in `records` into per-account balances.
///
/// Each event's `balance_after` is checked against the running balance, so
/// a gap or reordering in the log fails with `Invariant`.
pub fn replay_shares(records: &[EventRecord]) -> Result<BTreeMap<ShareKey, Amount>, KeelError> {
    let mut balances: BTreeMap<ShareKey, Amount> = BTreeMap::new();
    for record in records {
        let (key, next, expected) = match &record.event {
            LedgerEvent::Staked {
                kind,
                entry,
                account,
                shares,
                balance_after,
                ..
            }
            | LedgerEvent::SharesCredited {
                kind,
                entry,
                account,
                shares,
                balance_after,
                ..
            } => {
                let key = (*kind, *entry, *account);
                let current = balances.get(&key).copied().unwrap_or(0);
                (key, current.checked_add(*shares), *balance_after)
            }
            LedgerEvent::Unstaked {
                kind,
                entry,
                account,
                shares,
                balance_after,
                ..
            } => {
                let key = (*kind, *entry, *account);
                let current = balances.get(&key).copied().unwrap_or(0);
                (key, current.checked_sub(*shares), *balance_after)
            }
            _ => continue,
        };
        match next {
            Some(balance) if balance == expected => {
                balances.insert(key, balance);
            }
            _ => {
                return Err(KeelError::Invariant(format!(
                    "event {} leaves {} {} {} at {:?}, log says {}",
                    record.sequence, key.0, key.1, key.2, next, expected
                )))
            }
        }
    }
    Ok(balances)
}

/// Check the before/after totals carried by withdrawal and issuance events.
///
/// A withdrawal must shrink the pending amount by exactly what was paid; an
/// issuance must grow supply by exactly what was not left unassigned.
pub fn check_totals(records: &[EventRecord]) -> Result<(), KeelError> {
    for record in records {
        let consistent = match &record.event {
            LedgerEvent::Withdrawn {
                amount,
                pending_before,
                pending_after,
                ..
            } => pending_before.checked_sub(*amount) == Some(*pending_after),
            LedgerEvent::IssuanceUpdated {
                minted,
                unassigned,
                supply_before,
                supply_after,
                ..
            } => minted
                .checked_sub(*unassigned)
                .and_then(|credited| supply_before.checked_add(credited))
                == Some(*supply_after),
            _ => true,
        };
        if !consistent {
            return Err(KeelError::Invariant(format!(
                "event {} carries inconsistent totals: {:?}",
                record.sequence, record.event
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::events::EventLog;

    fn staked(account: Address, shares: Amount, balance_after: Amount) -> LedgerEvent {
        LedgerEvent::Staked {
            kind: LayerKind::Sequencer,
            entry: 1,
            account,
            principal: shares,
            shares,
            balance_after,
            entry_total_after: balance_after,
        }
    }

    #[test]
    fn test_replay_detects_gap() {
        let alice = Address::from_label("alice");
        let mut log = EventLog::new();
        log.push(1, staked(alice, 10, 10));
        log.push(2, staked(alice, 5, 20));
        assert!(matches!(
            replay_shares(log.records()),
            Err(KeelError::Invariant(_))
        ));
    }

    #[test]
    fn test_replay_ignores_other_events() {
        let alice = Address::from_label("alice");
        let mut log = EventLog::new();
        log.push(1, staked(alice, 10, 10));
        log.push(
            2,
            LedgerEvent::RewardsClaimed {
                index: 1,
                owner: alice,
                amount: 3,
            },
        );
        let balances = replay_shares(log.records()).unwrap();
        assert_eq!(balances.get(&(LayerKind::Sequencer, 1, alice)), Some(&10));
    }

    #[test]
    fn test_totals_cross_check() {
        let alice = Address::from_label("alice");
        let withdrawn = |pending_after| LedgerEvent::Withdrawn {
            kind: LayerKind::Sequencer,
            entry: 1,
            account: alice,
            amount: 40,
            released: 1,
            pending_before: 100,
            pending_after,
        };
        let mut log = EventLog::new();
        log.push(1, withdrawn(60));
        log.push(
            2,
            LedgerEvent::IssuanceUpdated {
                elapsed_blocks: 300,
                minted: 3_000,
                to_stakers: 2_000,
                to_layers: 0,
                to_treasury: 0,
                to_secondary: 0,
                unassigned: 1_000,
                index_before: 1,
                index_after: 3,
                supply_before: 500,
                supply_after: 2_500,
                undistributed_after: 0,
            },
        );
        assert_eq!(check_totals(log.records()), Ok(()));

        log.push(3, withdrawn(70));
        assert!(matches!(
            check_totals(log.records()),
            Err(KeelError::Invariant(_))
        ));
    }
}
