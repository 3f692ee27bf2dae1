//! Known natural keys for one listing.

use std::collections::HashSet;

use crate::repository::{DieselError, RecordStore};

#[derive(Debug, Clone, Default)]
pub struct SeenSet {
    keys: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up which of `candidates` are already stored under `external_key`
    /// and add them. Keys already in the set are not queried again. Returns
    /// how many stored keys were added.
    pub async fn absorb_stored(
        &mut self,
        store: &RecordStore,
        external_key: &str,
        candidates: &[String],
    ) -> Result<usize, DieselError> {
        let unknown: Vec<String> = candidates
            .iter()
            .filter(|key| !self.keys.contains(key.as_str()))
            .cloned()
            .collect();
        if unknown.is_empty() {
            return Ok(0);
        }
        let stored = store.bulk_index(external_key, &unknown).await?;
        Ok(self.observe(stored))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Number of distinct keys in `keys` not seen before. Does not record them.
    pub fn count_new<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let mut fresh = HashSet::new();
        for key in keys {
            if !self.keys.contains(key) {
                fresh.insert(key);
            }
        }
        fresh.len()
    }

    /// Record `keys`, returning how many were new.
    pub fn observe<I, S>(&mut self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for key in keys {
            if self.keys.insert(key.into()) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
