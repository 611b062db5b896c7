//! Runtime metadata shared across connections, keyed by chain and spec
//! version so a reconnect to an unchanged runtime never refetches.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tally_codec::Metadata;

#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<(String, u32), Arc<Metadata>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chain: &str, spec_version: u32) -> Option<Arc<Metadata>> {
        self.entries.read().get(&(chain.to_string(), spec_version)).cloned()
    }

    /// Store metadata; returns the entry now cached, which is the existing
    /// one if this version was already present.
    pub fn insert(&self, chain: &str, spec_version: u32, metadata: Arc<Metadata>) -> Arc<Metadata> {
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry((chain.to_string(), spec_version))
                .or_insert(metadata),
        )
    }

    /// Spec versions cached for a chain, ascending.
    pub fn versions(&self, chain: &str) -> Vec<u32> {
        let mut versions: Vec<u32> = self
            .entries
            .read()
            .keys()
            .filter(|(c, _)| c == chain)
            .map(|(_, v)| *v)
            .collect();
        versions.sort_unstable();
        versions
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
