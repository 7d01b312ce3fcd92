//! Signed balance changes per address and asset
//!
//! `merge` is a pointwise sum and `without` a pointwise subtraction. Zero entries are
//! never stored, so `d1.merge(&d2).without(&d2) == d1` holds exactly and an empty diff
//! compares equal to `BalanceDiff::default()`.
//!
//! Values are `i128`, so summing `i64` amounts from any number of blocks stays exact.

use crate::byte_array::Address;
use crate::hash::TxId;
use crate::types::Asset;
use std::collections::BTreeMap;
use std::ops::{AddAssign, Neg, SubAssign};

/// Balance changes attributable to one block, one transaction or an aggregated range
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BalanceDiff {
    /// Regular balance change per address and asset
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    regular: BTreeMap<Address, BTreeMap<Asset, i128>>,

    /// Outgoing leasing change per address
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    outgoing_leasing: BTreeMap<Address, i128>,
}

impl BalanceDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.outgoing_leasing.is_empty()
    }

    /// Builder form of `add_regular`
    pub fn with_regular(mut self, address: Address, asset: Asset, delta: i128) -> Self {
        self.add_regular(address, asset, delta);
        self
    }

    /// Builder form of `add_outgoing_leasing`
    pub fn with_outgoing_leasing(mut self, address: Address, delta: i128) -> Self {
        self.add_outgoing_leasing(address, delta);
        self
    }

    /// Add a regular balance change
    pub fn add_regular(&mut self, address: Address, asset: Asset, delta: i128) {
        if delta == 0 {
            return;
        }

        let assets = self.regular.entry(address).or_default();
        let value = assets.entry(asset).or_insert(0);
        *value += delta;
        if *value == 0 {
            assets.remove(&asset);
            if assets.is_empty() {
                self.regular.remove(&address);
            }
        }
    }

    /// Add an outgoing leasing change
    pub fn add_outgoing_leasing(&mut self, address: Address, delta: i128) {
        if delta == 0 {
            return;
        }

        let value = self.outgoing_leasing.entry(address).or_insert(0);
        *value += delta;
        if *value == 0 {
            self.outgoing_leasing.remove(&address);
        }
    }

    /// Regular change for an address and asset, zero if untouched
    pub fn regular(&self, address: &Address, asset: &Asset) -> i128 {
        self.regular.get(address).and_then(|assets| assets.get(asset)).copied().unwrap_or(0)
    }

    /// Outgoing leasing change for an address, zero if untouched
    pub fn outgoing_leasing(&self, address: &Address) -> i128 {
        self.outgoing_leasing.get(address).copied().unwrap_or(0)
    }

    /// Iterate regular changes as (address, asset, delta)
    pub fn regular_changes(&self) -> impl Iterator<Item = (&Address, &Asset, i128)> {
        self.regular
            .iter()
            .flat_map(|(address, assets)| assets.iter().map(move |(asset, v)| (address, asset, *v)))
    }

    /// Iterate outgoing leasing changes
    pub fn outgoing_leasing_changes(&self) -> impl Iterator<Item = (&Address, i128)> {
        self.outgoing_leasing.iter().map(|(address, v)| (address, *v))
    }

    /// Number of (address, asset) and leasing entries
    pub fn len(&self) -> usize {
        self.regular.values().map(|assets| assets.len()).sum::<usize>()
            + self.outgoing_leasing.len()
    }

    /// Pointwise sum
    pub fn merge(&self, other: &BalanceDiff) -> BalanceDiff {
        let mut result = self.clone();
        result += other;
        result
    }

    /// Pointwise subtraction
    pub fn without(&self, other: &BalanceDiff) -> BalanceDiff {
        let mut result = self.clone();
        result -= other;
        result
    }

    /// Inverse diff
    pub fn negate(&self) -> BalanceDiff {
        BalanceDiff::default().without(self)
    }

    /// Sum a sequence of diffs in order
    pub fn merge_all<'a>(diffs: impl IntoIterator<Item = &'a BalanceDiff>) -> BalanceDiff {
        diffs.into_iter().fold(BalanceDiff::default(), |mut acc, diff| {
            acc += diff;
            acc
        })
    }
}

impl AddAssign<&BalanceDiff> for BalanceDiff {
    fn add_assign(&mut self, other: &BalanceDiff) {
        for (address, asset, delta) in other.regular_changes() {
            self.add_regular(*address, *asset, delta);
        }
        for (address, delta) in other.outgoing_leasing_changes() {
            self.add_outgoing_leasing(*address, delta);
        }
    }
}

impl SubAssign<&BalanceDiff> for BalanceDiff {
    fn sub_assign(&mut self, other: &BalanceDiff) {
        for (address, asset, delta) in other.regular_changes() {
            self.add_regular(*address, *asset, -delta);
        }
        for (address, delta) in other.outgoing_leasing_changes() {
            self.add_outgoing_leasing(*address, -delta);
        }
    }
}

impl Neg for BalanceDiff {
    type Output = BalanceDiff;

    fn neg(self) -> BalanceDiff {
        self.negate()
    }
}

/// A confirmed transaction and the balance changes it caused
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionWithChanges {
    /// Transaction id
    pub tx_id: TxId,

    /// Balance changes
    #[serde(default)]
    pub changes: BalanceDiff,
}

impl TransactionWithChanges {
    pub fn new(tx_id: TxId, changes: BalanceDiff) -> Self {
        Self { tx_id, changes }
    }
}
