use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};

use super::{ArcBufferPool, BufferPoolManager};
use crate::errors::Error;
use crate::pages::PageId;
use crate::printdbg;

/// Shards page ownership across several buffer pool instances. A page id
/// belongs to instance `page_id % num_instances`; the instances share one
/// on-disk store, which is safe because their id ranges never overlap.
pub struct ParallelBufferPoolManager {
    instances: Vec<ArcBufferPool>,
    pool_size: usize,
    /// Round-robin cursor for `new_page`, bumped once per call.
    start_index: AtomicUsize,
}

impl ParallelBufferPoolManager {
    pub fn new(num_instances: usize, pool_size: usize, path: &str) -> Self {
        assert!(num_instances > 0, "a pool has at least one instance");

        let instances = (0..num_instances)
            .map(|i| {
                BufferPoolManager::new_instance(
                    pool_size,
                    num_instances as u32,
                    i as u32,
                    path,
                )
                .into_shared()
            })
            .collect();

        Self {
            instances,
            pool_size,
            start_index: AtomicUsize::new(0),
        }
    }

    pub fn get_pool_size(&self) -> usize {
        self.instances.len() * self.pool_size
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// The instance responsible for a page id. Callers fetch and release
    /// frames through the returned handle, e.g.
    /// `pool.instance_for(id).lock().fetch_frame(id)`.
    pub fn instance_for(&self, page_id: PageId) -> &ArcBufferPool {
        &self.instances[page_id as usize % self.instances.len()]
    }

    /// Allocate a page on the first instance with a frame to spare,
    /// starting from the round-robin cursor. The new frame stays pinned on
    /// its instance; the caller reaches it through [`Self::instance_for`].
    pub fn new_page(&self) -> Result<PageId> {
        let n = self.instances.len();
        let start = self.start_index.fetch_add(1, Ordering::Relaxed) % n;

        for k in 0..n {
            let instance = &self.instances[(start + k) % n];
            if let Ok(frame) = instance.lock().new_page() {
                let page_id = frame.get_page_id();
                printdbg!("Sharded pool created page {page_id}");
                return Ok(page_id);
            }
        }

        bail!(Error::NoFreeFrames)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.instance_for(page_id).lock().unpin(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        self.instance_for(page_id).lock().flush(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        self.instance_for(page_id).lock().delete_page(page_id)
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        for instance in &self.instances {
            instance.lock().flush_all()?;
        }

        Ok(())
    }
}
