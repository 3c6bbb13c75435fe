use std::sync::Arc;

use super::Key;
use crate::buffer_pool::Frame;
use crate::latch::Latch;
use crate::pages::{PageId, PAGE_SIZE};
use crate::types::Rid;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Pair {
    key: Key,
    rid: Rid,
}

/// Pairs per bucket, sized so the two bitmaps plus the pair array fill a
/// page: one pair costs its own bytes plus two bits of bitmap.
pub const BUCKET_ARRAY_SIZE: usize = 4 * PAGE_SIZE / (4 * std::mem::size_of::<Pair>() + 1);
const BITMAP_SIZE: usize = (BUCKET_ARRAY_SIZE - 1) / 8 + 1;

/// On-disk layout of a bucket page. `occupied` records slots that ever
/// held a pair, `readable` the slots holding a live one.
#[repr(C)]
pub(crate) struct BucketData {
    occupied: [u8; BITMAP_SIZE],
    readable: [u8; BITMAP_SIZE],
    array: [Pair; BUCKET_ARRAY_SIZE],
}

const _: () = assert!(std::mem::size_of::<BucketData>() <= PAGE_SIZE);

/// Write-through view over a pinned bucket frame. Valid only while the
/// caller keeps the frame pinned.
#[derive(Debug)]
pub struct HashTableBucketPage {
    data: *mut BucketData,
    latch: Arc<Latch>,
    page_id: PageId,
}

impl From<&mut Frame> for HashTableBucketPage {
    fn from(frame: &mut Frame) -> Self {
        let page_id = frame.get_page_id();
        let latch = frame.get_latch().clone();
        let data = frame.page_mut().raw_data() as *mut BucketData;
        Self {
            data,
            latch,
            page_id,
        }
    }
}

impl HashTableBucketPage {
    fn data(&self) -> &BucketData {
        unsafe { self.data.as_ref().unwrap() }
    }

    fn data_mut(&mut self) -> &mut BucketData {
        unsafe { self.data.as_mut().unwrap() }
    }

    pub fn get_page_id(&self) -> PageId {
        self.page_id
    }

    pub fn get_latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    /// Every live value stored under `key`.
    pub fn get_value(&self, key: Key) -> Vec<Rid> {
        let mut result = vec![];
        for i in 0..BUCKET_ARRAY_SIZE {
            if !self.is_readable(i) || !self.is_occupied(i) {
                continue;
            }
            if self.data().array[i].key == key {
                result.push(self.data().array[i].rid);
            }
        }
        result
    }

    /// Store a pair in the first dead slot. Rejects an exact duplicate
    /// pair and a full bucket.
    pub fn insert(&mut self, key: Key, rid: Rid) -> bool {
        for i in 0..BUCKET_ARRAY_SIZE {
            if !self.is_readable(i) || !self.is_occupied(i) {
                continue;
            }
            let pair = self.data().array[i];
            if pair.key == key && pair.rid == rid {
                return false;
            }
        }

        if self.is_full() {
            return false;
        }

        for i in 0..BUCKET_ARRAY_SIZE {
            if self.is_readable(i) {
                continue;
            }
            self.data_mut().array[i] = Pair { key, rid };
            self.set_occupied(i);
            self.set_readable(i);
            break;
        }

        true
    }

    pub fn remove(&mut self, key: Key, rid: Rid) -> bool {
        for i in 0..BUCKET_ARRAY_SIZE {
            if !self.is_readable(i) || !self.is_occupied(i) {
                continue;
            }
            let pair = self.data().array[i];
            if pair.key == key && pair.rid == rid {
                self.remove_at(i);
                return true;
            }
        }
        false
    }

    pub fn key_at(&self, idx: usize) -> Key {
        self.data().array[idx].key
    }

    pub fn rid_at(&self, idx: usize) -> Rid {
        self.data().array[idx].rid
    }

    /// Kill a slot: it stays occupied (tombstone) but is no longer
    /// readable.
    pub fn remove_at(&mut self, idx: usize) {
        self.data_mut().readable[idx / 8] &= !(1 << (idx % 8));
    }

    pub fn is_occupied(&self, idx: usize) -> bool {
        (self.data().occupied[idx / 8] & (1 << (idx % 8))) != 0
    }

    pub fn set_occupied(&mut self, idx: usize) {
        self.data_mut().occupied[idx / 8] |= 1 << (idx % 8);
    }

    pub fn is_readable(&self, idx: usize) -> bool {
        (self.data().readable[idx / 8] & (1 << (idx % 8))) != 0
    }

    pub fn set_readable(&mut self, idx: usize) {
        self.data_mut().readable[idx / 8] |= 1 << (idx % 8);
    }

    pub fn is_full(&self) -> bool {
        (0..BUCKET_ARRAY_SIZE).all(|i| self.is_readable(i))
    }

    pub fn is_empty(&self) -> bool {
        (0..BUCKET_ARRAY_SIZE).all(|i| !self.is_readable(i))
    }

    pub fn num_readable(&self) -> usize {
        (0..BUCKET_ARRAY_SIZE).filter(|i| self.is_readable(*i)).count()
    }
}
