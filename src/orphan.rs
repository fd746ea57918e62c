//! Bounded buffers for items whose parents have not arrived yet
//!
//! Used for both transactions (missing inputs) and blocks (missing previous
//! block). Entries are indexed by their own hash and by each missing parent.
//! When full, the entry at or after a pseudo-random key is evicted; the
//! generator is seeded from the chain parameters so eviction is reproducible.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{ConsensusError, Result};
use crate::types::{short_hash, Hash};

#[derive(Debug, Clone)]
struct OrphanEntry<T> {
    item: T,
    parents: Vec<Hash>,
    size: usize,
}

#[derive(Debug)]
pub struct OrphanBuffer<T> {
    entries: BTreeMap<Hash, OrphanEntry<T>>,
    by_parent: HashMap<Hash, BTreeSet<Hash>>,
    max_count: usize,
    max_item_size: usize,
    total_size: usize,
    rng: ChaCha8Rng,
}

impl<T: Clone> OrphanBuffer<T> {
    pub fn new(max_count: usize, max_item_size: usize, seed: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_parent: HashMap::new(),
            max_count,
            max_item_size,
            total_size: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Store an orphan waiting on `parents`
    ///
    /// Returns the entries evicted to stay within the count bound. An item
    /// larger than the per-item bound is refused.
    pub fn insert(&mut self, hash: Hash, item: T, parents: Vec<Hash>, size: usize) -> Result<Vec<(Hash, T)>> {
        if self.entries.contains_key(&hash) {
            return Err(ConsensusError::AlreadyKnown(hash));
        }
        if size > self.max_item_size {
            return Err(ConsensusError::ResourceLimit(format!(
                "ignoring large orphan {} ({} bytes)",
                short_hash(&hash),
                size
            )));
        }

        for parent in &parents {
            self.by_parent.entry(*parent).or_default().insert(hash);
        }
        self.entries.insert(hash, OrphanEntry { item, parents, size });
        self.total_size += size;
        debug!("stored orphan {} ({} total)", short_hash(&hash), self.entries.len());

        let mut evicted = Vec::new();
        while self.entries.len() > self.max_count {
            match self.evict_random() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        Ok(evicted)
    }

    fn evict_random(&mut self) -> Option<(Hash, T)> {
        let key: Hash = self.rng.gen();
        let victim = self
            .entries
            .range(key..)
            .next()
            .or_else(|| self.entries.iter().next())
            .map(|(hash, _)| *hash)?;
        debug!("evicting orphan {}", short_hash(&victim));
        self.remove(&victim).map(|item| (victim, item))
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<T> {
        let entry = self.entries.remove(hash)?;
        for parent in &entry.parents {
            if let Some(children) = self.by_parent.get_mut(parent) {
                children.remove(hash);
                if children.is_empty() {
                    self.by_parent.remove(parent);
                }
            }
        }
        self.total_size -= entry.size;
        Some(entry.item)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&T> {
        self.entries.get(hash).map(|entry| &entry.item)
    }

    /// Missing parents an orphan was stored with
    pub fn parents(&self, hash: &Hash) -> Option<&[Hash]> {
        self.entries.get(hash).map(|entry| entry.parents.as_slice())
    }

    /// Orphans waiting on `parent`, in hash order
    pub fn children(&self, parent: &Hash) -> Vec<Hash> {
        self.by_parent
            .get(parent)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}
