use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer_pool::Frame;
use crate::latch::Latch;
use crate::pages::{PageId, PAGE_SIZE};

/// Hash-prefix bits the directory can discriminate at most.
pub const MAX_DIR_DEPTH: u32 = 9;
pub const DIR_ARRAY_SIZE: usize = 1 << MAX_DIR_DEPTH;

/// On-disk layout of the directory page; trailing bytes up to
/// [`PAGE_SIZE`] stay zero.
#[repr(C)]
pub(crate) struct DirectoryData {
    page_id: PageId,
    lsn: u32,
    global_depth: u32,
    local_depths: [u8; DIR_ARRAY_SIZE],
    bucket_page_ids: [PageId; DIR_ARRAY_SIZE],
}

const _: () = assert!(std::mem::size_of::<DirectoryData>() <= PAGE_SIZE);

/// Write-through view over a pinned directory frame. Valid only while the
/// caller keeps the frame pinned.
#[derive(Debug)]
pub struct HashTableDirectoryPage {
    data: *mut DirectoryData,
    latch: Arc<Latch>,
    page_id: PageId,
}

impl From<&mut Frame> for HashTableDirectoryPage {
    fn from(frame: &mut Frame) -> Self {
        let page_id = frame.get_page_id();
        let latch = frame.get_latch().clone();
        let data = frame.page_mut().raw_data() as *mut DirectoryData;
        Self {
            data,
            latch,
            page_id,
        }
    }
}

impl HashTableDirectoryPage {
    fn data(&self) -> &DirectoryData {
        unsafe { self.data.as_ref().unwrap() }
    }

    fn data_mut(&mut self) -> &mut DirectoryData {
        unsafe { self.data.as_mut().unwrap() }
    }

    pub fn get_page_id(&self) -> PageId {
        self.page_id
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.data_mut().page_id = page_id;
    }

    pub fn get_lsn(&self) -> u32 {
        self.data().lsn
    }

    pub fn set_lsn(&mut self, lsn: u32) {
        self.data_mut().lsn = lsn;
    }

    pub fn get_latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    pub fn get_global_depth(&self) -> u32 {
        self.data().global_depth
    }

    pub fn global_depth_mask(&self) -> u32 {
        (1 << self.get_global_depth()) - 1
    }

    /// Number of directory slots in use: `2^global_depth`.
    pub fn size(&self) -> usize {
        1 << self.get_global_depth()
    }

    pub fn get_bucket_page_id(&self, idx: usize) -> PageId {
        self.data().bucket_page_ids[idx]
    }

    pub fn set_bucket_page_id(&mut self, idx: usize, page_id: PageId) {
        self.data_mut().bucket_page_ids[idx] = page_id;
    }

    pub fn get_local_depth(&self, idx: usize) -> u32 {
        self.data().local_depths[idx] as u32
    }

    pub fn incr_local_depth(&mut self, idx: usize) {
        self.data_mut().local_depths[idx] += 1;
    }

    pub fn decr_local_depth(&mut self, idx: usize) {
        self.data_mut().local_depths[idx] -= 1;
    }

    pub fn local_depth_mask(&self, idx: usize) -> u32 {
        (1 << self.get_local_depth(idx)) - 1
    }

    /// The slot differing from `idx` only in the topmost local-depth bit.
    /// Meaningless for a slot of local depth zero.
    pub fn get_split_image_index(&self, idx: usize) -> usize {
        debug_assert!(self.get_local_depth(idx) > 0);
        idx ^ (1 << (self.get_local_depth(idx) - 1))
    }

    /// Double the directory, mirroring depths and bucket page ids into the
    /// new upper half. Fails at [`MAX_DIR_DEPTH`].
    pub fn grow(&mut self) -> bool {
        if self.get_global_depth() == MAX_DIR_DEPTH {
            return false;
        }

        let size = self.size();
        let data = self.data_mut();
        for i in 0..size {
            data.local_depths[i + size] = data.local_depths[i];
            data.bucket_page_ids[i + size] = data.bucket_page_ids[i];
        }
        data.global_depth += 1;

        true
    }

    pub fn can_shrink(&self) -> bool {
        self.get_global_depth() > 0
            && (0..self.size()).all(|i| self.get_local_depth(i) < self.get_global_depth())
    }

    pub fn shrink(&mut self) {
        debug_assert!(self.can_shrink());
        self.data_mut().global_depth -= 1;
    }

    /// Directory index a key belongs to under the current global depth.
    pub fn key_index(&self, hash: u32) -> usize {
        (hash & self.global_depth_mask()) as usize
    }

    /// Panics when a directory invariant is broken: every local depth at
    /// most the global depth, all slots of one bucket sharing a local
    /// depth, and each bucket referenced by exactly `2^(gd - ld)` slots.
    pub fn verify_integrity(&self) {
        assert_eq!(
            self.data().page_id,
            self.page_id,
            "directory page claims a different identity than its frame"
        );

        let mut slot_counts: HashMap<PageId, u32> = HashMap::new();
        let mut local_depths: HashMap<PageId, u32> = HashMap::new();

        for i in 0..self.size() {
            let page_id = self.get_bucket_page_id(i);
            let ld = self.get_local_depth(i);

            assert!(
                ld <= self.get_global_depth(),
                "local depth {ld} exceeds global depth {}",
                self.get_global_depth()
            );

            match local_depths.get(&page_id) {
                Some(prev) => assert_eq!(
                    *prev, ld,
                    "bucket {page_id} referenced with differing local depths"
                ),
                None => {
                    local_depths.insert(page_id, ld);
                }
            }
            *slot_counts.entry(page_id).or_insert(0) += 1;
        }

        for (page_id, count) in slot_counts {
            let ld = local_depths[&page_id];
            assert_eq!(
                count,
                1 << (self.get_global_depth() - ld),
                "bucket {page_id} shared by the wrong number of slots"
            );
        }
    }
}
