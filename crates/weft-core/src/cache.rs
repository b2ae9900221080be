//! Stem cache
//!
//! At most one live `LiveStem` exists per stem id. The cache hands out
//! shared handles, stamps each entry with a monotonically increasing
//! generation on every request and prunes entries that have gone stale —
//! but only when nothing outside the cache still holds the handle.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::model::{StemId, StemRecord};
use crate::stem::LiveStem;

/// Shared handle to a live stem; the cache keeps one clone of its own.
pub type StemHandle = Arc<LiveStem>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unable to create stem cache directory {0}: {1}")]
    CreateRoot(PathBuf, std::io::Error),
}

struct CacheEntry {
    stem: StemHandle,
    last_touched: u64,
}

struct CacheInner {
    entries: HashMap<StemId, CacheEntry>,
    generation: u64,
}

pub struct StemCache {
    root: PathBuf,
    target_sample_rate: u32,
    inner: Mutex<CacheInner>,
}

impl StemCache {
    /// Create the cache and its on-disk root (`<cache_root>/stem/`).
    pub fn initialise(cache_root: &Path, target_sample_rate: u32) -> Result<Self, CacheError> {
        let root = cache_root.join("stem");
        fs::create_dir_all(&root).map_err(|err| CacheError::CreateRoot(root.clone(), err))?;

        Ok(Self {
            root,
            target_sample_rate,
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(2048),
                generation: 0,
            }),
        })
    }

    #[inline]
    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Fetch-or-create the live stem for this record. A fresh stem comes back
    /// in the `Empty` state; the caller is responsible for scheduling its
    /// `fetch`. Requesting always bumps the entry to the newest generation.
    pub fn request(&self, record: &StemRecord) -> StemHandle {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        let generation = inner.generation;

        match inner.entries.get_mut(&record.id) {
            Some(entry) => {
                entry.last_touched = generation;
                entry.stem.clone()
            }
            None => {
                let stem: StemHandle =
                    Arc::new(LiveStem::new(record.clone(), self.target_sample_rate));
                inner.entries.insert(
                    record.id.clone(),
                    CacheEntry { stem: stem.clone(), last_touched: generation },
                );
                stem
            }
        }
    }

    /// Drop entries untouched for more than `generations_to_keep` requests,
    /// unless a riff (or anyone else) still holds the handle.
    pub fn prune(&self, generations_to_keep: u64) {
        let mut inner = self.inner.lock().unwrap();

        if inner.generation < generations_to_keep {
            log::debug!(
                "stem cache prune skipped, generation {} below window {}",
                inner.generation,
                generations_to_keep
            );
            return;
        }

        let stale_before = inner.generation - generations_to_keep;
        let before = inner.entries.len();

        inner.entries.retain(|id, entry| {
            if entry.last_touched >= stale_before {
                return true;
            }
            // strong_count == 1 means only the cache itself holds the stem
            if Arc::strong_count(&entry.stem) > 1 {
                return true;
            }
            log::debug!("stem cache evicting [{id}]");
            false
        });

        log::info!("stem cache prune: {} -> {} entries", before, inner.entries.len());
    }

    /// Number of live entries; test and diagnostics support.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where this stem's compressed audio lives on disk; stems are sharded
    /// into subdirectories by the first character of their id.
    pub fn cache_path_for(&self, record: &StemRecord) -> PathBuf {
        let shard = record.id.as_str().get(0..1).unwrap_or("_");
        self.root.join(shard)
    }
}
