//! Immutable balance snapshots.
//!
//! A [`BalanceCollection`] is never mutated in place: `upsert` and
//! `remove_where` return a new collection, and the orchestrator publishes
//! each one behind an `Arc` so readers always see a whole snapshot.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::record::{BalanceKey, BalanceRecord, to_decimal};

/// Records keyed by identity, in first-insertion order of distinct keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceCollection {
    records: Vec<BalanceRecord>,
    index: HashMap<BalanceKey, usize>,
}

impl BalanceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records; later records replace earlier ones with the same
    /// key.
    pub fn from_records(records: impl IntoIterator<Item = BalanceRecord>) -> Self {
        let mut collection = Self::new();
        for record in records {
            collection.put(record);
        }
        collection
    }

    fn put(&mut self, record: BalanceRecord) {
        match self.index.get(&record.key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BalanceRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[BalanceRecord] {
        &self.records
    }

    pub fn get(&self, key: &BalanceKey) -> Option<&BalanceRecord> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    pub fn contains(&self, key: &BalanceKey) -> bool {
        self.index.contains_key(key)
    }

    /// A new snapshot with `record` inserted or replacing its key.
    pub fn upsert(&self, record: BalanceRecord) -> Self {
        let mut next = self.clone();
        next.put(record);
        next
    }

    /// A new snapshot without the records matching `pred`.
    pub fn remove_where(&self, pred: impl Fn(&BalanceRecord) -> bool) -> Self {
        Self::from_records(self.records.iter().filter(|r| !pred(r)).cloned())
    }

    pub fn find(&self, pred: impl Fn(&BalanceRecord) -> bool) -> Self {
        Self::from_records(self.records.iter().filter(|r| pred(r)).cloned())
    }

    pub fn filter_by_chain(&self, chain: &str) -> Self {
        self.find(|r| r.key.chain == chain)
    }

    pub fn filter_by_token(&self, token_id: &str) -> Self {
        self.find(|r| r.key.token_id == token_id)
    }

    /// EVM addresses match case-insensitively.
    pub fn filter_by_address(&self, address: &str) -> Self {
        let lower = address.to_lowercase();
        self.find(|r| r.key.address == address || r.key.address == lower)
    }

    pub fn non_zero(&self) -> Self {
        self.find(|r| !r.amounts.is_zero())
    }

    pub fn sorted(&self, cmp: impl FnMut(&BalanceRecord, &BalanceRecord) -> Ordering) -> Vec<BalanceRecord> {
        let mut records = self.records.clone();
        records.sort_by(cmp);
        records
    }

    /// Token totals per token id and the fiat value in `currency`.
    pub fn sum(&self, rates: &RateTable, currency: &str) -> BalanceSum {
        let mut sum = BalanceSum::default();
        for record in &self.records {
            let total = record.amounts.total();
            let entry = sum.tokens.entry(record.key.token_id.clone()).or_default();
            *entry = entry.saturating_add(total);

            let amount = to_decimal(total, record.decimals);
            sum.tokens_decimal += amount;
            if let Some(rate) = rates.get(&record.key.token_id, currency) {
                sum.fiat += amount * rate;
            }
        }
        sum
    }
}

/// Result of [`BalanceCollection::sum`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceSum {
    /// Smallest-unit totals per token id.
    pub tokens: BTreeMap<String, U256>,
    /// Whole-token total across all records.
    pub tokens_decimal: f64,
    pub fiat: f64,
}

/// Exchange rates: token id → currency → rate. Supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    rates: HashMap<String, HashMap<String, f64>>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, token_id: &str, currency: &str, rate: f64) {
        self.rates
            .entry(token_id.to_string())
            .or_default()
            .insert(currency.to_lowercase(), rate);
    }

    pub fn with(mut self, token_id: &str, currency: &str, rate: f64) -> Self {
        self.set(token_id, currency, rate);
        self
    }

    pub fn get(&self, token_id: &str, currency: &str) -> Option<f64> {
        self.rates.get(token_id)?.get(&currency.to_lowercase()).copied()
    }
}
