// crates/keel-core/src/events.rs

use serde::{Deserialize, Serialize};

use crate::error::KeelError;
use crate::identity::{Address, Amount, LayerIndex, LayerKey, LayerKind, MessageKey};
use crate::status::FwStatus;

/// One record per state-changing operation.
///
/// Each variant carries before/after amounts (or the resulting totals) so
/// that the full ledger can be rebuilt from the log alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    LayerCreated {
        index: LayerIndex,
        key: LayerKey,
        owner: Address,
        deposit: Amount,
        total_security_deposit: Amount,
    },
    CandidateCreated {
        index: LayerIndex,
        key: LayerKey,
        operator: Address,
        sequencer_index: LayerIndex,
        commission: u16,
        deposit: Amount,
    },
    SecurityDepositChanged {
        index: LayerIndex,
        caller: Address,
        before: Amount,
        after: Amount,
        total_security_deposit: Amount,
    },
    LayerDeactivated {
        kind: LayerKind,
        index: LayerIndex,
        returned: Amount,
    },
    ExternalDepositRecorded {
        index: LayerIndex,
        delta: i128,
        before: Amount,
        after: Amount,
        total_external_deposits: Amount,
    },
    Staked {
        kind: LayerKind,
        entry: LayerIndex,
        account: Address,
        principal: Amount,
        shares: Amount,
        balance_after: Amount,
        entry_total_after: Amount,
    },
    Unstaked {
        kind: LayerKind,
        entry: LayerIndex,
        account: Address,
        shares: Amount,
        principal: Amount,
        release_block: u64,
        balance_after: Amount,
    },
    Withdrawn {
        kind: LayerKind,
        entry: LayerIndex,
        account: Address,
        amount: Amount,
        released: usize,
        /// The account's pending amount in `entry` before and after.
        pending_before: Amount,
        pending_after: Amount,
    },
    /// Shares added without a token pull (fast-withdraw fee).
    SharesCredited {
        kind: LayerKind,
        entry: LayerIndex,
        account: Address,
        principal: Amount,
        shares: Amount,
        balance_after: Amount,
    },
    IssuanceUpdated {
        elapsed_blocks: u64,
        minted: Amount,
        to_stakers: Amount,
        to_layers: Amount,
        to_treasury: Amount,
        to_secondary: Amount,
        unassigned: Amount,
        index_before: u128,
        index_after: u128,
        supply_before: Amount,
        supply_after: Amount,
        undistributed_after: Amount,
    },
    SnapshotTaken {
        snapshot_id: u64,
        index: u128,
        timestamp: u64,
    },
    RewardsDistributed {
        distributed: Amount,
        pool_before: Amount,
        pool_after: Amount,
        layers: usize,
    },
    RewardsClaimed {
        index: LayerIndex,
        owner: Address,
        amount: Amount,
    },
    LiquidityProvided {
        key: MessageKey,
        requestor: Address,
        provider: Address,
        source: LayerKind,
        entry: LayerIndex,
        amount: Amount,
        fee: Amount,
        provided: Amount,
        debt_after: Amount,
        status: FwStatus,
    },
    RequestCanceled {
        key: MessageKey,
        requestor: Address,
        status: FwStatus,
    },
    FastWithdrawSettled {
        key: MessageKey,
        status: FwStatus,
        recipient: Address,
        paid: Amount,
        fee_credited: Amount,
        debt_after: Amount,
    },
    InvalidWithdrawMessage {
        key: MessageKey,
        status: FwStatus,
    },
    ParametersChanged {
        name: String,
        before: String,
        after: String,
    },
}

/// A sequenced event with the block it was recorded at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub block: u64,
    pub event: LedgerEvent,
}

/// Append-only event log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return its sequence number.
    pub fn push(&mut self, block: u64, event: LedgerEvent) -> u64 {
        let sequence = self.records.len() as u64;
        self.records.push(EventRecord {
            sequence,
            block,
            event,
        });
        sequence
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&EventRecord> {
        self.records.last()
    }

    /// Records appended at or after `sequence`.
    pub fn since(&self, sequence: u64) -> &[EventRecord] {
        let start = (sequence as usize).min(self.records.len());
        &self.records[start..]
    }

    /// Serialize every record as one JSON object per line.
    pub fn to_json_lines(&self) -> Result<String, KeelError> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse a JSON-lines export. Blank lines are skipped; sequence numbers
    /// must be contiguous from zero.
    pub fn from_json_lines(input: &str) -> Result<Self, KeelError> {
        let mut records = Vec::new();
        for line in input.lines().filter(|l| !l.trim().is_empty()) {
            let record: EventRecord = serde_json::from_str(line)?;
            if record.sequence != records.len() as u64 {
                return Err(KeelError::Serialization(format!(
                    "expected sequence {}, found {}",
                    records.len(),
                    record.sequence
                )));
            }
            records.push(record);
        }
        Ok(Self { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LedgerEvent {
        LedgerEvent::Staked {
            kind: LayerKind::Sequencer,
            entry: 1,
            account: Address::from_label("alice"),
            principal: 1_000,
            shares: 1_000,
            balance_after: 1_000,
            entry_total_after: 1_000,
        }
    }

    #[test]
    fn test_push_assigns_sequence() {
        let mut log = EventLog::new();
        assert_eq!(log.push(5, sample()), 0);
        assert_eq!(log.push(6, sample()), 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.since(1).len(), 1);
        assert_eq!(log.last().map(|r| r.block), Some(6));
    }

    #[test]
    fn test_json_lines_export() {
        let mut log = EventLog::new();
        log.push(1, sample());
        log.push(
            2,
            LedgerEvent::InvalidWithdrawMessage {
                key: MessageKey([7u8; 32]),
                status: FwStatus::ZeroAmount,
            },
        );
        let text = log.to_json_lines().unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("{\"Staked\":"));

        let parsed = EventLog::from_json_lines(&text).unwrap();
        assert_eq!(parsed.records(), log.records());
    }

    #[test]
    fn test_json_lines_rejects_gap() {
        let mut log = EventLog::new();
        log.push(1, sample());
        log.push(2, sample());
        let text = log.to_json_lines().unwrap();
        let second_only = text.lines().nth(1).unwrap();
        assert!(EventLog::from_json_lines(second_only).is_err());
    }
}
