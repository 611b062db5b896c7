//! Last-known balances in the `balances` table, for instant paint on start.
//!
//! Rows outlive the watches that wrote them. They only go away through
//! [`BalanceCacheStore::clear`], [`BalanceCacheStore::prune`] or
//! [`BalanceCacheStore::remove`].

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tally_core::{BalanceRow, Database};
use tracing::{debug, warn};

use crate::collection::BalanceCollection;
use crate::record::{BalanceKey, BalanceRecord, BalanceStatus};

/// Persists balance records as JSON keyed by their identity string.
#[derive(Clone)]
pub struct BalanceCacheStore {
    db: Arc<Mutex<Database>>,
}

impl BalanceCacheStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Mutex::new(Database::open_in_memory()?))))
    }

    /// Every stored record, marked `cached`. Rows that no longer parse are
    /// skipped.
    pub fn load(&self) -> Result<BalanceCollection> {
        let rows = self.db.lock().load_balances().context("Failed to load cached balances")?;
        let records = rows.into_iter().filter_map(|row| {
            match serde_json::from_str::<BalanceRecord>(&row.payload) {
                Ok(record) => Some(BalanceRecord {
                    status: BalanceStatus::Cached,
                    ..record
                }),
                Err(e) => {
                    warn!(id = %row.id, "Skipping unreadable cached balance: {e}");
                    None
                }
            }
        });
        Ok(BalanceCollection::from_records(records))
    }

    /// Replace the stored set with `collection`. Error records are not
    /// worth restoring and are left out.
    pub fn save(&self, collection: &BalanceCollection) -> Result<()> {
        let rows = collection
            .iter()
            .filter(|r| !r.status.is_error())
            .map(row)
            .collect::<Result<Vec<_>>>()?;
        debug!(count = rows.len(), "Saving balance cache");
        self.db.lock().replace_balances(&rows)
    }

    /// Write the records of `current` that are new or changed since
    /// `previous`. Records missing from `current` keep their rows. Returns
    /// how many rows were written.
    pub fn store_changes(&self, previous: &BalanceCollection, current: &BalanceCollection) -> Result<usize> {
        let rows = current
            .iter()
            .filter(|r| !r.status.is_error())
            .filter(|r| previous.get(&r.key).is_none_or(|p| !p.same_state(r)))
            .map(row)
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(0);
        }
        debug!(count = rows.len(), "Storing changed balances");
        self.db.lock().upsert_balances(&rows)?;
        Ok(rows.len())
    }

    /// Write every non-error record of `current`.
    pub fn flush(&self, current: &BalanceCollection) -> Result<usize> {
        self.store_changes(&BalanceCollection::new(), current)
    }

    /// Drop every stored row.
    pub fn clear(&self) -> Result<()> {
        debug!("Clearing balance cache");
        self.db.lock().replace_balances(&[])
    }

    /// Delete rows whose key `keep` rejects, along with rows that no longer
    /// parse. Returns how many were deleted.
    pub fn prune(&self, keep: impl Fn(&BalanceKey) -> bool) -> Result<usize> {
        let db = self.db.lock();
        let rows = db.load_balances().context("Failed to load cached balances")?;
        let mut deleted = 0;
        for stored in rows {
            let wanted = serde_json::from_str::<BalanceRecord>(&stored.payload).is_ok_and(|r| keep(&r.key));
            if !wanted && db.delete_balance(&stored.id)? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!(deleted, "Pruned balance cache");
        }
        Ok(deleted)
    }

    pub fn upsert(&self, record: &BalanceRecord) -> Result<()> {
        self.db.lock().upsert_balance(&row(record)?)
    }

    pub fn remove(&self, key: &BalanceKey) -> Result<bool> {
        self.db.lock().delete_balance(&key.to_string())
    }
}

fn row(record: &BalanceRecord) -> Result<BalanceRow> {
    Ok(BalanceRow {
        id: record.key.to_string(),
        payload: serde_json::to_string(record).context("Failed to serialize balance")?,
        updated_at: record.updated_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Amounts;
    use primitive_types::U256;
    use tally_core::{ChainRef, TokenRef};

    const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";

    fn dot() -> TokenRef {
        TokenRef::substrate_native(&ChainRef::substrate("polkadot", "0x91b1"), "DOT", 10)
    }

    fn usdc() -> TokenRef {
        TokenRef::evm_erc20(&ChainRef::evm(1), "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", "USDC", 6)
    }

    fn live(token: &TokenRef, address: &str, free: u64) -> BalanceRecord {
        BalanceRecord::new(token, address, Amounts::free_only(U256::from(free)), BalanceStatus::Live)
    }

    #[test]
    fn restores_as_cached() {
        let store = BalanceCacheStore::open_in_memory().unwrap();
        let owner = "0xabcdef0123456789abcdef0123456789abcdef01";
        let collection = BalanceCollection::from_records([live(&dot(), ALICE, 7), live(&usdc(), owner, 9)]);
        store.save(&collection).unwrap();

        let restored = store.load().unwrap();
        assert_eq!(restored.len(), 2);
        for record in restored.iter() {
            assert_eq!(record.status, BalanceStatus::Cached);
            let original = collection.get(&record.key).unwrap();
            assert_eq!(record.amounts, original.amounts);
            assert_eq!(record.updated_at, original.updated_at);
        }
    }

    #[test]
    fn save_replaces_the_stored_set() {
        let store = BalanceCacheStore::open_in_memory().unwrap();
        store
            .save(&BalanceCollection::from_records([live(&dot(), ALICE, 1)]))
            .unwrap();

        let errored = live(&usdc(), "0xabcdef0123456789abcdef0123456789abcdef01", 0)
            .with_status(BalanceStatus::Error("reverted".into()));
        store.save(&BalanceCollection::from_records([errored])).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn upsert_and_remove_single_records() {
        let store = BalanceCacheStore::open_in_memory().unwrap();
        let record = live(&dot(), ALICE, 3);
        store.upsert(&record).unwrap();
        store.upsert(&live(&dot(), ALICE, 4)).unwrap();
        let restored = store.load().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.records()[0].amounts.free, U256::from(4u64));

        assert!(store.remove(&record.key).unwrap());
        assert!(!store.remove(&record.key).unwrap());
    }

    #[test]
    fn store_changes_writes_only_what_changed() {
        let store = BalanceCacheStore::open_in_memory().unwrap();
        let owner = "0xabcdef0123456789abcdef0123456789abcdef01";
        let first = BalanceCollection::from_records([live(&dot(), ALICE, 1), live(&usdc(), owner, 2)]);
        assert_eq!(store.store_changes(&BalanceCollection::new(), &first).unwrap(), 2);
        assert_eq!(store.store_changes(&first, &first).unwrap(), 0);

        // The USDC pair was evicted from the snapshot; its row stays.
        let second = BalanceCollection::from_records([live(&dot(), ALICE, 3)]);
        assert_eq!(store.store_changes(&first, &second).unwrap(), 1);
        let restored = store.load().unwrap();
        assert_eq!(restored.len(), 2);
        let dot_key = BalanceKey::for_token(&dot(), ALICE);
        assert_eq!(restored.get(&dot_key).unwrap().amounts.free, U256::from(3u64));

        let errored = second.upsert(
            live(&dot(), ALICE, 3).with_status(BalanceStatus::Error("reverted".into())),
        );
        assert_eq!(store.store_changes(&second, &errored).unwrap(), 0);
        assert_eq!(store.load().unwrap().get(&dot_key).unwrap().amounts.free, U256::from(3u64));
    }

    #[test]
    fn flush_clear_and_prune() {
        let store = BalanceCacheStore::open_in_memory().unwrap();
        let owner = "0xabcdef0123456789abcdef0123456789abcdef01";
        let collection = BalanceCollection::from_records([live(&dot(), ALICE, 1), live(&usdc(), owner, 2)]);
        assert_eq!(store.flush(&collection).unwrap(), 2);

        let usdc_id = usdc().id;
        assert_eq!(store.prune(|key| key.token_id != usdc_id).unwrap(), 1);
        let left = store.load().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left.get(&BalanceKey::for_token(&dot(), ALICE)).is_some());
        assert_eq!(store.prune(|_| true).unwrap(), 0);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn unreadable_rows_are_skipped() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        db.lock()
            .upsert_balance(&BalanceRow {
                id: "x".into(),
                payload: "{not json".into(),
                updated_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();
        let store = BalanceCacheStore::new(db);
        store.upsert(&live(&dot(), ALICE, 1)).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn survives_reopening_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        {
            let store = BalanceCacheStore::new(Arc::new(Mutex::new(Database::open_at(&path).unwrap())));
            store
                .save(&BalanceCollection::from_records([live(&dot(), ALICE, 5)]))
                .unwrap();
        }
        let store = BalanceCacheStore::new(Arc::new(Mutex::new(Database::open_at(&path).unwrap())));
        assert_eq!(store.load().unwrap().records()[0].amounts.free, U256::from(5u64));
    }
}
