use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use anyhow::{bail, ensure, Result};

use crate::buffer_pool::ArcBufferPool;
use crate::errors::Error;
use crate::latch::Latch;
use crate::pages::indexes::extendible_hash::bucket::{HashTableBucketPage, BUCKET_ARRAY_SIZE};
use crate::pages::indexes::extendible_hash::directory::HashTableDirectoryPage;
use crate::pages::indexes::extendible_hash::Key;
use crate::pages::PageId;
use crate::printdbg;
use crate::types::Rid;

pub type HashFn = fn(Key) -> u32;

fn default_hash(key: Key) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as u32
}

/// A disk-backed extendible hash table: one directory page plus up to
/// `2^global_depth` bucket pages, all borrowed from the buffer pool and
/// unpinned on every return path. The directory structure is guarded by a
/// table-level latch (shared for point lookups and in-bucket edits,
/// exclusive for splits and merges); individual buckets are additionally
/// guarded by their frame latch.
pub struct ExtendibleHashTable {
    directory_page_id: PageId,
    bpm: ArcBufferPool,
    table_latch: Latch,
    hasher: HashFn,
}

impl ExtendibleHashTable {
    pub fn new(bpm: ArcBufferPool) -> Result<Self> {
        Self::with_hasher(bpm, default_hash)
    }

    /// Mainly for tests that need a predictable key distribution.
    pub fn with_hasher(bpm: ArcBufferPool, hasher: HashFn) -> Result<Self> {
        let directory_page_id;
        {
            let mut guard = bpm.lock();

            let dir_frame = guard.new_page()?;
            directory_page_id = dir_frame.get_page_id();
            let mut dir = HashTableDirectoryPage::from(dir_frame);

            let bucket_frame = guard.new_page()?;
            let bucket_page_id = bucket_frame.get_page_id();

            // a single depth-0 bucket covers the whole key space
            dir.set_page_id(directory_page_id);
            dir.set_bucket_page_id(0, bucket_page_id);

            guard.unpin(directory_page_id, true);
            guard.unpin(bucket_page_id, false);
        }

        Ok(Self {
            directory_page_id,
            bpm,
            table_latch: Latch::new(),
            hasher,
        })
    }

    fn hash(&self, key: Key) -> u32 {
        (self.hasher)(key)
    }

    fn key_to_directory_index(&self, key: Key, dir: &HashTableDirectoryPage) -> usize {
        dir.key_index(self.hash(key))
    }

    fn key_to_page_id(&self, key: Key, dir: &HashTableDirectoryPage) -> PageId {
        dir.get_bucket_page_id(self.key_to_directory_index(key, dir))
    }

    /// Every value stored under `key`.
    pub fn get_value(&self, key: Key) -> Result<Vec<Rid>> {
        let _table = self.table_latch.rguard();

        let mut guard = self.bpm.lock();
        let dir: HashTableDirectoryPage = guard.fetch_frame(self.directory_page_id)?.into();
        let bucket_page_id = self.key_to_page_id(key, &dir);
        let bucket: HashTableBucketPage = guard.fetch_frame(bucket_page_id)?.into();
        drop(guard);

        bucket.get_latch().rlock();
        let result = bucket.get_value(key);
        bucket.get_latch().runlock();

        let mut guard = self.bpm.lock();
        guard.unpin(bucket_page_id, false);
        guard.unpin(self.directory_page_id, false);

        Ok(result)
    }

    /// Insert a pair; false when the exact pair already exists. Splits the
    /// target bucket (growing the directory as needed) when it is full.
    pub fn insert(&self, key: Key, rid: Rid) -> Result<bool> {
        {
            let _table = self.table_latch.rguard();

            let mut guard = self.bpm.lock();
            let dir: HashTableDirectoryPage = guard.fetch_frame(self.directory_page_id)?.into();
            let bucket_page_id = self.key_to_page_id(key, &dir);
            let mut bucket: HashTableBucketPage = guard.fetch_frame(bucket_page_id)?.into();
            drop(guard);

            bucket.get_latch().wlock();
            if !bucket.is_full() {
                let inserted = bucket.insert(key, rid);
                bucket.get_latch().wunlock();

                let mut guard = self.bpm.lock();
                guard.unpin(bucket_page_id, inserted);
                guard.unpin(self.directory_page_id, false);
                return Ok(inserted);
            }
            bucket.get_latch().wunlock();

            let mut guard = self.bpm.lock();
            guard.unpin(bucket_page_id, false);
            guard.unpin(self.directory_page_id, false);
        }

        // full bucket: retry under the exclusive table latch
        self.split_insert(key, rid)
    }

    fn split_insert(&self, key: Key, rid: Rid) -> Result<bool> {
        let _table = self.table_latch.wguard();

        let mut guard = self.bpm.lock();
        let mut dir: HashTableDirectoryPage = guard.fetch_frame(self.directory_page_id)?.into();
        let mut old_page_id = self.key_to_page_id(key, &dir);
        let mut old_bucket: HashTableBucketPage = guard.fetch_frame(old_page_id)?.into();
        drop(guard);

        old_bucket.get_latch().wlock();

        // the pair may have been inserted before we won the table latch
        if old_bucket.get_value(key).contains(&rid) {
            old_bucket.get_latch().wunlock();
            let mut guard = self.bpm.lock();
            guard.unpin(old_page_id, false);
            guard.unpin(self.directory_page_id, false);
            return Ok(false);
        }

        let mut dirty: HashMap<PageId, bool> = HashMap::new();

        loop {
            let mut idx = self.key_to_directory_index(key, &dir);

            if dir.get_local_depth(idx) == dir.get_global_depth() {
                if !dir.grow() {
                    old_bucket.get_latch().wunlock();
                    let mut guard = self.bpm.lock();
                    guard.unpin(old_page_id, *dirty.get(&old_page_id).unwrap_or(&false));
                    guard.unpin(self.directory_page_id, true);
                    bail!(Error::DirectoryFull);
                }
                idx = self.key_to_directory_index(key, &dir);
            }

            let mut guard = self.bpm.lock();
            let new_frame = match guard.new_page() {
                Ok(frame) => frame,
                Err(e) => {
                    drop(guard);
                    old_bucket.get_latch().wunlock();
                    let mut guard = self.bpm.lock();
                    guard.unpin(old_page_id, *dirty.get(&old_page_id).unwrap_or(&false));
                    guard.unpin(self.directory_page_id, true);
                    return Err(e);
                }
            };
            let new_page_id = new_frame.get_page_id();
            let mut new_bucket = HashTableBucketPage::from(new_frame);
            drop(guard);

            new_bucket.get_latch().wlock();

            let local_depth = dir.get_local_depth(idx);
            let old_prefix = idx as u32 & dir.local_depth_mask(idx);
            let new_prefix = old_prefix | (1 << local_depth);

            printdbg!(
                "Splitting bucket {old_page_id} into {new_page_id}, prefix {old_prefix:b} -> {new_prefix:b}"
            );

            // deepen every slot of the old bucket; those matching the new
            // prefix retarget to the new bucket
            for i in 0..dir.size() {
                if dir.get_bucket_page_id(i) == old_page_id {
                    dir.incr_local_depth(i);
                    if (i as u32 & dir.local_depth_mask(i)) == new_prefix {
                        dir.set_bucket_page_id(i, new_page_id);
                    }
                }
            }

            for i in 0..BUCKET_ARRAY_SIZE {
                if !old_bucket.is_readable(i) || !old_bucket.is_occupied(i) {
                    continue;
                }
                let pair_key = old_bucket.key_at(i);
                let pair_rid = old_bucket.rid_at(i);
                let target = self.key_to_directory_index(pair_key, &dir);
                if (target as u32 & dir.local_depth_mask(target)) == new_prefix {
                    old_bucket.remove_at(i);
                    assert!(new_bucket.insert(pair_key, pair_rid));
                    dirty.insert(old_page_id, true);
                    dirty.insert(new_page_id, true);
                }
            }

            if dir.get_bucket_page_id(idx) == old_page_id {
                let inserted = old_bucket.insert(key, rid);
                if inserted {
                    dirty.insert(old_page_id, true);
                }
                new_bucket.get_latch().wunlock();
                let mut guard = self.bpm.lock();
                guard.unpin(new_page_id, *dirty.get(&new_page_id).unwrap_or(&false));
                drop(guard);
                if inserted {
                    break;
                }
                // the key's bucket is still full, split it again
            } else {
                let inserted = new_bucket.insert(key, rid);
                if inserted {
                    new_bucket.get_latch().wunlock();
                    let mut guard = self.bpm.lock();
                    guard.unpin(new_page_id, true);
                    drop(guard);
                    break;
                }
                // every pair moved with the key into the new bucket;
                // continue splitting that one
                old_bucket.get_latch().wunlock();
                let mut guard = self.bpm.lock();
                guard.unpin(old_page_id, *dirty.get(&old_page_id).unwrap_or(&false));
                drop(guard);
                old_page_id = new_page_id;
                old_bucket = new_bucket;
            }
        }

        old_bucket.get_latch().wunlock();
        let mut guard = self.bpm.lock();
        guard.unpin(old_page_id, true);
        guard.unpin(self.directory_page_id, true);

        Ok(true)
    }

    /// Remove a pair; false when it was not present. An emptied bucket of
    /// nonzero depth is merged with its split image.
    pub fn remove(&self, key: Key, rid: Rid) -> Result<bool> {
        let removed;
        let mut merge_candidate = false;
        {
            let _table = self.table_latch.rguard();

            let mut guard = self.bpm.lock();
            let dir: HashTableDirectoryPage = guard.fetch_frame(self.directory_page_id)?.into();
            let idx = self.key_to_directory_index(key, &dir);
            let local_depth = dir.get_local_depth(idx);
            let bucket_page_id = dir.get_bucket_page_id(idx);
            let mut bucket: HashTableBucketPage = guard.fetch_frame(bucket_page_id)?.into();
            drop(guard);

            bucket.get_latch().wlock();
            removed = bucket.remove(key, rid);
            if bucket.is_empty() && local_depth != 0 {
                merge_candidate = true;
            }
            bucket.get_latch().wunlock();

            let mut guard = self.bpm.lock();
            guard.unpin(bucket_page_id, removed);
            guard.unpin(self.directory_page_id, false);
        }

        if merge_candidate {
            self.merge(key)?;
        }

        Ok(removed)
    }

    /// Fold an empty bucket into its split image and shrink the directory
    /// as far as possible. Conditions are re-checked under the exclusive
    /// table latch; a concurrent insert calls the merge off.
    fn merge(&self, key: Key) -> Result<()> {
        let _table = self.table_latch.wguard();

        let mut guard = self.bpm.lock();
        let mut dir: HashTableDirectoryPage = guard.fetch_frame(self.directory_page_id)?.into();

        let idx = self.key_to_directory_index(key, &dir);
        let bucket_page_id = dir.get_bucket_page_id(idx);

        if dir.get_local_depth(idx) == 0 {
            guard.unpin(self.directory_page_id, false);
            return Ok(());
        }

        let img_idx = dir.get_split_image_index(idx);
        let img_page_id = dir.get_bucket_page_id(img_idx);

        if dir.get_local_depth(idx) != dir.get_local_depth(img_idx) {
            guard.unpin(self.directory_page_id, false);
            return Ok(());
        }

        let bucket: HashTableBucketPage = guard.fetch_frame(bucket_page_id)?.into();
        drop(guard);

        bucket.get_latch().rlock();
        let empty = bucket.is_empty();
        bucket.get_latch().runlock();

        let mut guard = self.bpm.lock();
        guard.unpin(bucket_page_id, false);

        if !empty {
            guard.unpin(self.directory_page_id, false);
            return Ok(());
        }

        printdbg!("Merging empty bucket {bucket_page_id} into {img_page_id}");

        for i in 0..dir.size() {
            if dir.get_bucket_page_id(i) == img_page_id {
                dir.decr_local_depth(i);
            }
            if dir.get_bucket_page_id(i) == bucket_page_id {
                dir.decr_local_depth(i);
                dir.set_bucket_page_id(i, img_page_id);
            }
        }

        ensure!(
            guard.delete_page(bucket_page_id)?,
            Error::Internal(format!("merged bucket {bucket_page_id} still pinned"))
        );

        while dir.can_shrink() {
            dir.shrink();
        }

        guard.unpin(self.directory_page_id, true);

        Ok(())
    }

    pub fn get_global_depth(&self) -> Result<u32> {
        let _table = self.table_latch.rguard();

        let mut guard = self.bpm.lock();
        let dir: HashTableDirectoryPage = guard.fetch_frame(self.directory_page_id)?.into();
        let depth = dir.get_global_depth();
        guard.unpin(self.directory_page_id, false);

        Ok(depth)
    }

    /// Panics when a directory invariant is broken.
    pub fn verify_integrity(&self) -> Result<()> {
        let _table = self.table_latch.rguard();

        let mut guard = self.bpm.lock();
        let dir: HashTableDirectoryPage = guard.fetch_frame(self.directory_page_id)?.into();
        dir.verify_integrity();
        guard.unpin(self.directory_page_id, false);

        Ok(())
    }
}
