// crates/keel-economics/src/rebase.rs
//
// Global rebase index and the issuance schedule.
//
// New principal is minted at `issuance_rate_per_block` for every elapsed
// block, at most once per `min_block_interval` blocks. Each issuance is split:
//   1. A layer bucket, proportional to the layer basis (security deposits
//      plus externally bridged deposits) against total staked principal.
//      It feeds the registry's undistributed reward pool.
//   2. The remainder is split by the dividend weights into treasury,
//      secondary holders and stakers.
//   3. The staker share raises the index, so every outstanding share is
//      worth more principal without touching per-account storage.
//
// Nothing is silently dropped: division dust, buckets without a payout
// address and issuance with no shares outstanding are all reported as
// `unassigned`, and minted == sum of all buckets.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_core::error::KeelError;
use keel_core::{Address, Amount};

use crate::fixed::{mul_div, principal_to_shares, shares_to_principal, INDEX_PRECISION};
use crate::params::ProtocolParams;

/// Default dividend denominator (basis points).
pub const DEFAULT_DIVIDEND_DENOMINATOR: u32 = 10_000;

/// Dividend weights for the non-layer part of each issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividendSplit {
    pub treasury: u32,
    pub secondary: u32,
    pub stakers: u32,
    pub denominator: u32,
}

impl Default for DividendSplit {
    fn default() -> Self {
        Self {
            treasury: 0,
            secondary: 0,
            stakers: DEFAULT_DIVIDEND_DENOMINATOR,
            denominator: DEFAULT_DIVIDEND_DENOMINATOR,
        }
    }
}

impl DividendSplit {
    pub fn new(treasury: u32, secondary: u32, stakers: u32, denominator: u32) -> Result<Self, KeelError> {
        let split = Self {
            treasury,
            secondary,
            stakers,
            denominator,
        };
        split.validate()?;
        Ok(split)
    }

    /// The denominator is non-zero and the three weights sum to it.
    pub fn validate(&self) -> Result<(), KeelError> {
        if self.denominator == 0 {
            return Err(KeelError::InvalidDividendRates(
                "denominator must be non-zero".to_string(),
            ));
        }
        let sum = self.treasury as u64 + self.secondary as u64 + self.stakers as u64;
        if sum != self.denominator as u64 {
            return Err(KeelError::InvalidDividendRates(format!(
                "weights sum to {} but denominator is {}",
                sum, self.denominator
            )));
        }
        Ok(())
    }
}

/// Outcome class of an issuance update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuanceStatus {
    /// The minimum interval had not elapsed; nothing changed.
    Skipped,
    /// Principal was minted and assigned to the buckets.
    Issued,
    /// Principal was minted but no shares were outstanding, so the index did not move.
    IssuedUnassigned,
}

/// Per-bucket result of [`RebaseIndex::update_issuance`].
///
/// `minted == to_stakers + to_layers + to_treasury + to_secondary + unassigned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceResult {
    pub status: IssuanceStatus,
    pub elapsed_blocks: u64,
    pub minted: Amount,
    pub to_stakers: Amount,
    pub to_layers: Amount,
    pub to_treasury: Amount,
    pub to_secondary: Amount,
    pub unassigned: Amount,
    pub index_before: u128,
    pub index_after: u128,
    /// Payout addresses in force for this issuance.
    pub treasury: Option<Address>,
    pub secondary: Option<Address>,
}

impl IssuanceResult {
    fn skipped(elapsed_blocks: u64, index: u128) -> Self {
        Self {
            status: IssuanceStatus::Skipped,
            elapsed_blocks,
            minted: 0,
            to_stakers: 0,
            to_layers: 0,
            to_treasury: 0,
            to_secondary: 0,
            unassigned: 0,
            index_before: index,
            index_after: index,
            treasury: None,
            secondary: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.status == IssuanceStatus::Skipped
    }
}

/// An immutable point-in-time record of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub index: u128,
    pub timestamp: u64,
}

/// The global principal-per-share exchange rate.
#[derive(Debug, Clone)]
pub struct RebaseIndex {
    index: u128,
    issuance_rate_per_block: Amount,
    min_block_interval: u64,
    last_issuance_block: u64,
    dividend: DividendSplit,
    treasury: Option<Address>,
    secondary: Option<Address>,
    snapshots: Vec<Snapshot>,
}

impl RebaseIndex {
    /// Create an index at 1.0 with issuance counted from `start_block`.
    pub fn new(
        issuance_rate_per_block: Amount,
        min_block_interval: u64,
        dividend: DividendSplit,
        start_block: u64,
    ) -> Result<Self, KeelError> {
        dividend.validate()?;
        Ok(Self {
            index: INDEX_PRECISION,
            issuance_rate_per_block,
            min_block_interval,
            last_issuance_block: start_block,
            dividend,
            treasury: None,
            secondary: None,
            snapshots: Vec::new(),
        })
    }

    pub fn from_params(params: &ProtocolParams, start_block: u64) -> Result<Self, KeelError> {
        params.validate()?;
        let mut rebase = Self::new(
            params.issuance_rate_per_block,
            params.min_block_interval,
            params.dividend,
            start_block,
        )?;
        rebase.treasury = params.treasury_address()?.filter(|a| !a.is_zero());
        rebase.secondary = params.secondary_holders_address()?.filter(|a| !a.is_zero());
        Ok(rebase)
    }

    pub fn index(&self) -> u128 {
        self.index
    }

    pub fn issuance_rate_per_block(&self) -> Amount {
        self.issuance_rate_per_block
    }

    pub fn min_block_interval(&self) -> u64 {
        self.min_block_interval
    }

    pub fn last_issuance_block(&self) -> u64 {
        self.last_issuance_block
    }

    pub fn dividend(&self) -> DividendSplit {
        self.dividend
    }

    pub fn payout_addresses(&self) -> (Option<Address>, Option<Address>) {
        (self.treasury, self.secondary)
    }

    pub fn principal_to_shares(&self, principal: Amount) -> Result<Amount, KeelError> {
        principal_to_shares(principal, self.index)
    }

    pub fn shares_to_principal(&self, shares: Amount) -> Result<Amount, KeelError> {
        shares_to_principal(shares, self.index)
    }

    /// Mint principal for the blocks elapsed since the last issuance.
    ///
    /// `total_shares` is every share outstanding across all staking ledgers;
    /// `layer_basis` is total security deposits plus total external deposits.
    /// The caller performs the actual token mints from the returned buckets.
    /// On error nothing changes.
    pub fn update_issuance(
        &mut self,
        current_block: u64,
        total_shares: Amount,
        layer_basis: Amount,
    ) -> Result<IssuanceResult, KeelError> {
        let result = self.preview_issuance(current_block, total_shares, layer_basis)?;
        self.apply_issuance(current_block, &result);
        Ok(result)
    }

    /// Compute what [`update_issuance`](Self::update_issuance) would do at
    /// `current_block` without changing the index.
    pub fn preview_issuance(
        &self,
        current_block: u64,
        total_shares: Amount,
        layer_basis: Amount,
    ) -> Result<IssuanceResult, KeelError> {
        let elapsed = current_block.saturating_sub(self.last_issuance_block);
        if elapsed < self.min_block_interval {
            debug!(
                current_block,
                last = self.last_issuance_block,
                interval = self.min_block_interval,
                "issuance interval not reached"
            );
            return Ok(IssuanceResult::skipped(elapsed, self.index));
        }

        let minted = self
            .issuance_rate_per_block
            .checked_mul(elapsed as u128)
            .ok_or_else(|| KeelError::ArithmeticOverflow("issuance amount".to_string()))?;
        let index_before = self.index;

        if total_shares == 0 {
            return Ok(IssuanceResult {
                status: IssuanceStatus::IssuedUnassigned,
                elapsed_blocks: elapsed,
                minted,
                to_stakers: 0,
                to_layers: 0,
                to_treasury: 0,
                to_secondary: 0,
                unassigned: minted,
                index_before,
                index_after: index_before,
                treasury: self.treasury,
                secondary: self.secondary,
            });
        }

        let staked_principal = self.shares_to_principal(total_shares)?;
        let to_layers = if layer_basis == 0 {
            0
        } else {
            let basis = layer_basis
                .checked_add(staked_principal)
                .ok_or_else(|| KeelError::ArithmeticOverflow("layer basis".to_string()))?;
            mul_div(minted, layer_basis, basis)?
        };

        let rest = minted - to_layers;
        let denominator = self.dividend.denominator as u128;
        let to_stakers = mul_div(rest, self.dividend.stakers as u128, denominator)?;
        let treasury_cut = mul_div(rest, self.dividend.treasury as u128, denominator)?;
        let secondary_cut = mul_div(rest, self.dividend.secondary as u128, denominator)?;
        let mut unassigned = rest - to_stakers - treasury_cut - secondary_cut;

        let to_treasury = match self.treasury {
            Some(_) => treasury_cut,
            None => {
                unassigned += treasury_cut;
                0
            }
        };
        let to_secondary = match self.secondary {
            Some(_) => secondary_cut,
            None => {
                unassigned += secondary_cut;
                0
            }
        };

        let increment = mul_div(to_stakers, INDEX_PRECISION, total_shares)?;
        let index_after = index_before
            .checked_add(increment)
            .ok_or_else(|| KeelError::ArithmeticOverflow("rebase index".to_string()))?;

        Ok(IssuanceResult {
            status: IssuanceStatus::Issued,
            elapsed_blocks: elapsed,
            minted,
            to_stakers,
            to_layers,
            to_treasury,
            to_secondary,
            unassigned,
            index_before,
            index_after,
            treasury: self.treasury,
            secondary: self.secondary,
        })
    }

    /// Commit a result from [`preview_issuance`](Self::preview_issuance)
    /// taken at `current_block`. Skipped results change nothing.
    pub fn apply_issuance(&mut self, current_block: u64, result: &IssuanceResult) {
        if result.is_skipped() {
            return;
        }
        self.last_issuance_block = current_block;
        self.index = result.index_after;
        match result.status {
            IssuanceStatus::IssuedUnassigned => warn!(
                current_block,
                minted = result.minted,
                "no shares outstanding; issued principal is unassigned"
            ),
            _ => info!(
                current_block,
                elapsed = result.elapsed_blocks,
                minted = result.minted,
                to_stakers = result.to_stakers,
                to_layers = result.to_layers,
                to_treasury = result.to_treasury,
                to_secondary = result.to_secondary,
                unassigned = result.unassigned,
                index = self.index,
                "issuance applied"
            ),
        }
    }

    pub fn set_issuance_rate(&mut self, rate: Amount) -> Result<(), KeelError> {
        if rate == self.issuance_rate_per_block {
            return Err(KeelError::SameValue("issuance_rate_per_block".to_string()));
        }
        self.issuance_rate_per_block = rate;
        Ok(())
    }

    pub fn set_min_block_interval(&mut self, interval: u64) -> Result<(), KeelError> {
        if interval == self.min_block_interval {
            return Err(KeelError::SameValue("min_block_interval".to_string()));
        }
        if interval == 0 {
            return Err(KeelError::Configuration(
                "min_block_interval must be non-zero".to_string(),
            ));
        }
        self.min_block_interval = interval;
        Ok(())
    }

    pub fn set_last_issuance_block(&mut self, block: u64) -> Result<(), KeelError> {
        if block == self.last_issuance_block {
            return Err(KeelError::SameValue("last_issuance_block".to_string()));
        }
        self.last_issuance_block = block;
        Ok(())
    }

    pub fn set_dividend_rates(&mut self, split: DividendSplit) -> Result<(), KeelError> {
        split.validate()?;
        if split == self.dividend {
            return Err(KeelError::SameValue("dividend".to_string()));
        }
        self.dividend = split;
        Ok(())
    }

    /// Set both payout addresses. `None` unsets a bucket's address.
    pub fn set_payout_addresses(
        &mut self,
        treasury: Option<Address>,
        secondary: Option<Address>,
    ) -> Result<(), KeelError> {
        let treasury = treasury.filter(|a| !a.is_zero());
        let secondary = secondary.filter(|a| !a.is_zero());
        if treasury == self.treasury && secondary == self.secondary {
            return Err(KeelError::SameValue("payout_addresses".to_string()));
        }
        self.treasury = treasury;
        self.secondary = secondary;
        Ok(())
    }

    /// Record the current index under a new snapshot id.
    ///
    /// Two calls always allocate two ids, even within one block.
    pub fn take_snapshot(&mut self, timestamp: u64) -> Snapshot {
        let snapshot = Snapshot {
            id: self.current_snapshot_id() + 1,
            index: self.index,
            timestamp,
        };
        self.snapshots.push(snapshot);
        info!(id = snapshot.id, index = snapshot.index, "snapshot taken");
        snapshot
    }

    /// Id of the most recent snapshot; 0 before the first one.
    pub fn current_snapshot_id(&self) -> u64 {
        self.snapshots.last().map(|s| s.id).unwrap_or(0)
    }

    pub fn snapshot(&self, id: u64) -> Result<&Snapshot, KeelError> {
        if id == 0 {
            return Err(KeelError::InvalidSnapshot(id));
        }
        self.snapshots
            .get((id - 1) as usize)
            .ok_or(KeelError::InvalidSnapshot(id))
    }

    pub fn index_at(&self, id: u64) -> Result<u128, KeelError> {
        self.snapshot(id).map(|s| s.index)
    }

    pub fn snapshot_time(&self, id: u64) -> Result<u64, KeelError> {
        self.snapshot(id).map(|s| s.timestamp)
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stakers_only(rate: Amount, interval: u64) -> RebaseIndex {
        RebaseIndex::new(rate, interval, DividendSplit::default(), 0).unwrap()
    }

    fn assert_conserved(result: &IssuanceResult) {
        assert_eq!(
            result.minted,
            result.to_stakers
                + result.to_layers
                + result.to_treasury
                + result.to_secondary
                + result.unassigned
        );
    }

    #[test]
    fn test_issuance_scenario_single_staker() {
        // 10 per block, 300-block interval, one staker with 1000 shares
        let mut rebase = stakers_only(10, 300);
        let result = rebase.update_issuance(300, 1_000, 0).unwrap();
        assert_eq!(result.status, IssuanceStatus::Issued);
        assert_eq!(result.minted, 3_000);
        assert_eq!(result.to_stakers, 3_000);
        assert_eq!(rebase.index(), 4 * INDEX_PRECISION);
        assert_eq!(rebase.shares_to_principal(1_000).unwrap(), 4_000);
        assert_conserved(&result);

        // One block later: no-op
        let again = rebase.update_issuance(301, 1_000, 0).unwrap();
        assert!(again.is_skipped());
        assert_eq!(rebase.index(), 4 * INDEX_PRECISION);
        assert_eq!(rebase.last_issuance_block(), 300);
    }

    #[test]
    fn test_issuance_before_interval_is_skipped() {
        let mut rebase = stakers_only(10, 300);
        let result = rebase.update_issuance(299, 1_000, 0).unwrap();
        assert!(result.is_skipped());
        assert_eq!(result.minted, 0);
        assert_eq!(rebase.last_issuance_block(), 0);
    }

    #[test]
    fn test_zero_shares_is_issued_unassigned() {
        let mut rebase = stakers_only(10, 300);
        let result = rebase.update_issuance(300, 0, 500).unwrap();
        assert_eq!(result.status, IssuanceStatus::IssuedUnassigned);
        assert_eq!(result.unassigned, 3_000);
        assert_eq!(rebase.index(), INDEX_PRECISION);
        assert_eq!(rebase.last_issuance_block(), 300);
        assert_conserved(&result);
    }

    #[test]
    fn test_layer_bucket_and_dividend_split() {
        let split = DividendSplit::new(1_000, 500, 8_500, 10_000).unwrap();
        let mut rebase = RebaseIndex::new(10, 100, split, 0).unwrap();
        rebase
            .set_payout_addresses(Some(Address::from_label("treasury")), None)
            .unwrap();

        // Basis 1000 against 3000 staked principal: a quarter goes to layers.
        let result = rebase.update_issuance(100, 3_000, 1_000).unwrap();
        assert_eq!(result.minted, 1_000);
        assert_eq!(result.to_layers, 250);
        assert_eq!(result.to_treasury, 75);
        assert_eq!(result.to_secondary, 0);
        assert_eq!(result.to_stakers, 637);
        // 37 secondary cut (no address) + 1 dust
        assert_eq!(result.unassigned, 38);
        assert_conserved(&result);
    }

    #[test]
    fn test_dividend_validation() {
        assert!(DividendSplit::new(0, 0, 10_000, 10_000).is_ok());
        assert!(DividendSplit::new(1, 0, 10_000, 10_000).is_err());
        assert!(DividendSplit::new(0, 0, 0, 0).is_err());
    }

    #[test]
    fn test_setters_reject_same_value() {
        let mut rebase = stakers_only(10, 300);
        assert_eq!(
            rebase.set_issuance_rate(10),
            Err(KeelError::SameValue("issuance_rate_per_block".to_string()))
        );
        assert!(rebase.set_issuance_rate(20).is_ok());
        assert!(rebase.set_min_block_interval(300).is_err());
        assert!(rebase.set_min_block_interval(0).is_err());
        assert!(rebase.set_last_issuance_block(0).is_err());
        assert!(rebase.set_dividend_rates(DividendSplit::default()).is_err());
        assert!(rebase.set_payout_addresses(None, None).is_err());
        let t = Address::from_label("t");
        assert!(rebase.set_payout_addresses(Some(t), None).is_ok());
        assert!(rebase.set_payout_addresses(Some(t), None).is_err());
        assert!(rebase.set_payout_addresses(None, None).is_ok());
    }

    #[test]
    fn test_failed_issuance_leaves_interval_and_index() {
        // The staker bucket is so large the index increment overflows.
        let split = DividendSplit::new(0, 0, 1, 1).unwrap();
        let mut rebase = RebaseIndex::new(u128::MAX / 1_000, 300, split, 0).unwrap();
        assert!(matches!(
            rebase.update_issuance(300, 1, 0),
            Err(KeelError::ArithmeticOverflow(_))
        ));
        assert_eq!(rebase.last_issuance_block(), 0);
        assert_eq!(rebase.index(), INDEX_PRECISION);
    }

    #[test]
    fn test_preview_changes_nothing_until_applied() {
        let mut rebase = stakers_only(10, 300);
        let preview = rebase.preview_issuance(300, 1_000, 0).unwrap();
        assert_eq!(preview.index_after, 4 * INDEX_PRECISION);
        assert_eq!(rebase.index(), INDEX_PRECISION);
        assert_eq!(rebase.last_issuance_block(), 0);

        rebase.apply_issuance(300, &preview);
        assert_eq!(rebase.index(), 4 * INDEX_PRECISION);
        assert_eq!(rebase.last_issuance_block(), 300);
    }

    #[test]
    fn test_zero_payout_address_counts_as_unset() {
        let mut rebase = stakers_only(10, 300);
        assert_eq!(
            rebase.set_payout_addresses(Some(Address::ZERO), None),
            Err(KeelError::SameValue("payout_addresses".to_string()))
        );
        assert_eq!(rebase.payout_addresses(), (None, None));
    }

    #[test]
    fn test_snapshots() {
        let mut rebase = stakers_only(10, 300);
        assert_eq!(rebase.current_snapshot_id(), 0);
        let first = rebase.take_snapshot(1_000);
        assert_eq!(first.id, 1);
        rebase.update_issuance(300, 1_000, 0).unwrap();
        let second = rebase.take_snapshot(1_000);
        assert_eq!(second.id, 2);

        assert_eq!(rebase.index_at(1).unwrap(), INDEX_PRECISION);
        assert_eq!(rebase.index_at(2).unwrap(), 4 * INDEX_PRECISION);
        assert_eq!(rebase.snapshot_time(2).unwrap(), 1_000);
        assert_eq!(rebase.index_at(0), Err(KeelError::InvalidSnapshot(0)));
        assert_eq!(rebase.index_at(3), Err(KeelError::InvalidSnapshot(3)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_index_non_decreasing_and_conserving(
            steps in proptest::collection::vec((1u64..600, 0u128..1_000_000, 0u128..1_000_000), 1..20),
        ) {
            let split = DividendSplit::new(1_000, 1_000, 8_000, 10_000).unwrap();
            let mut rebase = RebaseIndex::new(1_000, 300, split, 0).unwrap();
            rebase.set_payout_addresses(Some(Address::from_label("t")), None).unwrap();
            let mut block = 0u64;
            for (advance, shares, basis) in steps {
                block += advance;
                let before = rebase.index();
                let result = rebase.update_issuance(block, shares, basis).unwrap();
                prop_assert!(rebase.index() >= before);
                prop_assert_eq!(
                    result.minted,
                    result.to_stakers + result.to_layers + result.to_treasury
                        + result.to_secondary + result.unassigned
                );
                if result.status != IssuanceStatus::Issued {
                    prop_assert_eq!(rebase.index(), before);
                }
            }
        }
    }
}
