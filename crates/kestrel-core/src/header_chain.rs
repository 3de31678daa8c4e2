// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Cached view of the canonical header chain, serving the height/hash
//! lookups the gossip paths make, plus head rollback.

use std::{num::NonZeroUsize, sync::Arc};

use eyre::{eyre, Result};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rocksdb::WriteBatch;

use crate::{
    crypto::BlockHash,
    header_store::HeaderStore,
    types::{Header, Height},
};

const HEADER_CACHE_LIMIT: usize = 512;
const HEIGHT_CACHE_LIMIT: usize = 2048;

/// Invoked by `set_head` before each rewound header is deleted, so callers
/// can queue deletion of the data they key by (hash, height).
pub type DeleteCallback<'a> = dyn FnMut(&mut WriteBatch, BlockHash, Height) + 'a;

struct CurrentHead {
    header: Header,
    // Hash of the current head, kept to avoid recomputing it on every read.
    hash: BlockHash,
}

pub struct HeaderChain {
    store: Arc<HeaderStore>,
    genesis_header: Header,
    current: RwLock<CurrentHead>,
    header_cache: Mutex<LruCache<BlockHash, Header>>,
    height_cache: Mutex<LruCache<BlockHash, Height>>,
    // set_head is the only chain mutator; this excludes concurrent rewinds.
    rewind_lock: Mutex<()>,
}

impl HeaderChain {
    /// Opens the chain over an existing store. The store must hold a genesis
    /// header at height 0; the persisted head pointer is honored when its
    /// header is still present.
    pub fn open(store: Arc<HeaderStore>) -> Result<Self> {
        let genesis_hash = store
            .read_canonical_hash(0)?
            .ok_or_else(|| eyre!("No genesis header in store"))?;
        let genesis_header = store
            .read_header(genesis_hash, 0)?
            .ok_or_else(|| eyre!("No genesis header in store"))?;

        let mut head = CurrentHead {
            header: genesis_header.clone(),
            hash: genesis_hash,
        };
        if let Some(head_hash) = store.read_head_header_hash()? {
            if let Some(height) = store.read_header_height(head_hash)? {
                if let Some(header) = store.read_header(head_hash, height)? {
                    head = CurrentHead {
                        header,
                        hash: head_hash,
                    };
                }
            }
        }

        Ok(Self {
            store,
            genesis_header,
            current: RwLock::new(head),
            header_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HEADER_CACHE_LIMIT).unwrap(),
            )),
            height_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HEIGHT_CACHE_LIMIT).unwrap(),
            )),
            rewind_lock: Mutex::new(()),
        })
    }

    pub fn current_header(&self) -> Header {
        self.current.read().header.clone()
    }

    pub fn current_header_hash(&self) -> BlockHash {
        self.current.read().hash
    }

    pub fn genesis_header(&self) -> &Header {
        &self.genesis_header
    }

    /// Header at `height` on the canonical chain, if any.
    pub fn get_header_by_height(&self, height: Height) -> Option<Header> {
        let hash = self.read_store(|| self.store.read_canonical_hash(height))??;
        self.get_header(hash, height)
    }

    /// Header by hash and height; populates the header cache on a store hit.
    pub fn get_header(&self, hash: BlockHash, height: Height) -> Option<Header> {
        if let Some(header) = self.header_cache.lock().get(&hash) {
            return Some(header.clone());
        }
        let header = self.read_store(|| self.store.read_header(hash, height))??;
        self.header_cache.lock().put(hash, header.clone());
        Some(header)
    }

    pub fn get_header_by_hash(&self, hash: BlockHash) -> Option<Header> {
        let height = self.get_block_height(hash)?;
        self.get_header(hash, height)
    }

    /// Height of the block with the given hash; populates the height cache
    /// on a store hit.
    pub fn get_block_height(&self, hash: BlockHash) -> Option<Height> {
        if let Some(height) = self.height_cache.lock().get(&hash) {
            return Some(*height);
        }
        let height = self.read_store(|| self.store.read_header_height(hash))??;
        self.height_cache.lock().put(hash, height);
        Some(height)
    }

    /// Makes `header` the head of the canonical chain and persists the
    /// pointer.
    pub fn set_current_header(&self, header: Header) -> Result<()> {
        let hash = header.hash();
        self.store.write_head_header_hash(hash)?;
        *self.current.write() = CurrentHead { header, hash };
        Ok(())
    }

    /// Rewinds the chain to `new_head`. Every header above it is handed to
    /// `delete_callback` (if any) and deleted together with its canonical
    /// numbering, walking backward via `last_commit_hash`. A missing
    /// predecessor stops the walk and the head falls back to genesis.
    pub fn set_head(
        &self,
        new_head: Height,
        mut delete_callback: Option<&mut DeleteCallback<'_>>,
    ) -> Result<()> {
        let _guard = self.rewind_lock.lock();

        let start_height = self.current_header().height;
        let mut batch = WriteBatch::default();
        let mut current: Option<Header> = Some(self.current_header());

        while let Some(header) = current.take() {
            if header.height <= new_head {
                current = Some(header);
                break;
            }
            let hash = header.hash();
            let height = header.height;
            if let Some(callback) = delete_callback.as_mut() {
                callback(&mut batch, hash, height);
            }
            self.store.delete_header(&mut batch, hash, height)?;
            current = self.get_header(header.last_commit_hash, height - 1);
        }

        // Roll back the canonical chain numbering.
        for height in (new_head + 1..=start_height).rev() {
            self.store.delete_canonical_hash(&mut batch, height)?;
        }
        self.store.commit_batch(batch)?;

        // Clear out any stale content from the caches.
        self.header_cache.lock().clear();
        self.height_cache.lock().clear();

        let header = current.unwrap_or_else(|| self.genesis_header.clone());
        let hash = header.hash();
        self.store.write_head_header_hash(hash)?;
        *self.current.write() = CurrentHead { header, hash };

        Ok(())
    }

    /// Store failures are surfaced to lookups as misses.
    fn read_store<T>(&self, read: impl FnOnce() -> std::io::Result<Option<T>>) -> Option<Option<T>> {
        match read() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Header store read failed: {e}");
                None
            }
        }
    }
}
