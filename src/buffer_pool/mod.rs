mod frame;
pub mod parallel;
mod replacer;

use crate::disk_manager::DiskManager;
use crate::errors::Error;
#[cfg(debug_assertions)]
use crate::get_caller_name;
use crate::pages::{Page, PageId};
use crate::printdbg;
use anyhow::{bail, Result};
use parking_lot::FairMutex;
use std::collections::{HashMap, LinkedList};
use std::sync::Arc;

pub use frame::Frame;
pub use parallel::ParallelBufferPoolManager;

pub type FrameId = usize;
pub type ArcBufferPool = Arc<FairMutex<BufferPoolManager>>;

/// One buffer pool instance: a fixed set of frames, the page table mapping
/// resident page ids to frames, a free list, and an LRU replacer picking
/// eviction victims among unpinned frames. When the instance is part of a
/// sharded pool it only ever allocates page ids congruent to its index.
pub struct BufferPoolManager {
    disk_manager: DiskManager,

    free_frames: LinkedList<FrameId>,
    page_table: HashMap<PageId, FrameId>,
    frames: Vec<Frame>,

    replacer: Box<dyn replacer::Replacer>,

    num_instances: u32,
    instance_index: u32,
    next_page_id: PageId,
}

impl BufferPoolManager {
    pub fn new(size: usize, path: &str) -> Self {
        Self::new_instance(size, 1, 0, path)
    }

    pub fn new_instance(
        size: usize,
        num_instances: u32,
        instance_index: u32,
        path: &str,
    ) -> Self {
        assert!(num_instances > 0, "a pool has at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );

        let frames = (0..size).map(|_| Frame::new()).collect::<Vec<_>>();

        Self {
            free_frames: LinkedList::from_iter(0..size),
            frames,
            page_table: HashMap::new(),
            replacer: Box::new(replacer::LRU::new(size)),
            disk_manager: DiskManager::new(path),
            num_instances,
            instance_index,
            next_page_id: instance_index,
        }
    }

    pub fn into_shared(self) -> ArcBufferPool {
        Arc::new(FairMutex::new(self))
    }

    pub fn get_pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Hand out the next page id owned by this instance. Ids advance by
    /// the instance count so `page_id % num_instances == instance_index`
    /// holds for every page allocated here.
    fn allocate_page(&mut self) -> PageId {
        let id = self.next_page_id;
        self.next_page_id += self.num_instances;
        debug_assert_eq!(id % self.num_instances, self.instance_index);
        id
    }

    fn find_free_frame(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_frames.pop_front() {
            Ok(frame_id)
        } else if let Some(frame_id) = self.evict_frame() {
            Ok(frame_id)
        } else {
            bail!(Error::NoFreeFrames)
        }
    }

    fn evict_frame(&mut self) -> Option<FrameId> {
        let frame_id = self.replacer.victim()?;
        let frame = &mut self.frames[frame_id];
        assert_eq!(frame.get_pin_count(), 0);

        let page = frame.page_mut();
        self.page_table.remove(&page.get_page_id());

        printdbg!(
            "Page {} (frame: {frame_id}) chosen for eviction, is dirty: {}",
            page.get_page_id(),
            page.is_dirty()
        );

        if page.is_dirty() {
            self.disk_manager.write_page(page).unwrap();
            page.mark_clean();
        }

        Some(frame_id)
    }

    pub fn fetch_frame(&mut self, page_id: PageId) -> Result<&mut Frame> {
        let frame_id = if let Some(frame_id) = self.page_table.get(&page_id) {
            *frame_id
        } else {
            // read before taking a victim so a missing page evicts nothing
            let page = self.disk_manager.read_page(page_id)?;
            let frame_id = self.find_free_frame()?;

            self.frames[frame_id].set_page(page);
            self.page_table.insert(page_id, frame_id);

            frame_id
        };

        let frame = &mut self.frames[frame_id];
        frame.pin();
        self.replacer.pin(frame_id);

        printdbg!(
            "{} Fetched page {page_id} (frame: {frame_id}) with pin count {}",
            get_caller_name!(),
            frame.get_pin_count()
        );

        Ok(self.frames.get_mut(frame_id).unwrap())
    }

    /// Allocate a fresh zeroed page and pin it into a frame. Fails when
    /// every frame is pinned.
    pub fn new_page(&mut self) -> Result<&mut Frame> {
        let frame_id = self.find_free_frame()?;

        let page_id = self.allocate_page();

        let mut page = Page::new();
        page.set_page_id(page_id);

        printdbg!("Created page {} and writing to disk", page_id);
        self.disk_manager.write_page(&page)?;

        let frame = &mut self.frames[frame_id];
        frame.set_page(page);
        frame.pin();
        self.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        Ok(self.frames.get_mut(frame_id).unwrap())
    }

    /// Drop one pin. The dirty flag is OR-ed in, a clean unpin never
    /// scrubs an earlier dirty one. Returns false when the page is not
    /// resident or was not pinned.
    pub fn unpin(&mut self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return false;
        };

        let frame = &mut self.frames[frame_id];
        if is_dirty {
            frame.page_mut().mark_dirty();
        }
        if frame.get_pin_count() == 0 {
            return false;
        }
        frame.unpin();

        printdbg!(
            "{} page {page_id} (frame: {frame_id}) unpinned, pin count: {}",
            get_caller_name!(),
            frame.get_pin_count()
        );

        if frame.get_pin_count() == 0 {
            self.replacer.unpin(frame_id);
        }

        true
    }

    /// Write the page back regardless of its dirty bit.
    pub fn flush(&mut self, page_id: PageId) -> Result<()> {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            bail!(Error::PageNotResident(page_id));
        };

        let page = self.frames[frame_id].page_mut();
        self.disk_manager.write_page(page)?;
        page.mark_clean();

        Ok(())
    }

    /// Write back every dirty resident page. Clean frames are skipped.
    pub fn flush_all(&mut self) -> Result<()> {
        for frame_id in self.page_table.values() {
            let page = self.frames[*frame_id].page_mut();
            if page.is_dirty() {
                self.disk_manager.write_page(page)?;
                page.mark_clean();
            }
        }

        Ok(())
    }

    /// Drop a page from the pool and from disk. A non-resident page is
    /// deallocated directly; a pinned page cannot be deleted.
    pub fn delete_page(&mut self, page_id: PageId) -> Result<bool> {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            self.disk_manager.remove_page(page_id)?;
            return Ok(true);
        };

        let frame = &mut self.frames[frame_id];
        if frame.get_pin_count() > 0 {
            return Ok(false);
        }

        let page = frame.page_mut();
        if page.is_dirty() {
            self.disk_manager.write_page(page)?;
            page.mark_clean();
        }

        // unpinned and resident, so the replacer is tracking this frame
        self.page_table.remove(&page_id);
        self.replacer.pin(frame_id);
        frame.reset();
        self.free_frames.push_back(frame_id);
        self.disk_manager.remove_page(page_id)?;

        Ok(true)
    }

    #[cfg(test)]
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u16> {
        let frame_id = *self.page_table.get(&page_id)?;
        Some(self.frames[frame_id].get_pin_count())
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        use crate::pages::INVALID_PAGE;

        for (page_id, frame_id) in &self.page_table {
            assert_eq!(self.frames[*frame_id].get_page_id(), *page_id);
            assert!(!self.free_frames.contains(frame_id));
        }
        for frame_id in &self.free_frames {
            assert_eq!(self.frames[*frame_id].get_page_id(), INVALID_PAGE);
        }
        let unpinned_resident = self
            .page_table
            .values()
            .filter(|f| self.frames[**f].get_pin_count() == 0)
            .count();
        assert_eq!(self.replacer.size(), unpinned_resident);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::disk_manager::test_path;
    use crate::pages::PAGE_SIZE;
    use anyhow::Result;
    use rand::Rng;

    fn test_bpm(size: usize, path: &str) -> BufferPoolManager {
        BufferPoolManager::new(size, path)
    }

    pub fn test_arc_bpm(size: usize) -> ArcBufferPool {
        test_bpm(size, &test_path()).into_shared()
    }

    #[test]
    fn test_dont_evict_pinned() -> Result<()> {
        let path = test_path();

        let mut bpm = test_bpm(2, &path);

        let p1 = bpm.new_page()?.get_page_id();
        let p2 = bpm.new_page()?.get_page_id();

        assert!(bpm.new_page().is_err());

        bpm.unpin(p1, false);

        assert!(bpm.new_page().is_ok());

        // p1 was evicted for the page above
        assert_eq!(bpm.get_pin_count(p1), None);

        bpm.unpin(p2, false);
        let _ = bpm.fetch_frame(p1)?;

        assert!(bpm.new_page().is_err());

        bpm.check_invariants();

        Ok(())
    }

    #[test]
    fn test_victim_ordering() -> Result<()> {
        let path = test_path();

        let mut bpm = test_bpm(3, &path);

        let p1 = bpm.new_page()?.get_page_id();
        let p2 = bpm.new_page()?.get_page_id();
        let p3 = bpm.new_page()?.get_page_id();

        bpm.unpin(p1, false);
        bpm.unpin(p2, false);
        bpm.unpin(p3, false);

        // least-recently-unpinned goes first
        let _p4 = bpm.new_page()?.get_page_id();
        assert_eq!(bpm.get_pin_count(p1), None);
        assert_eq!(bpm.get_pin_count(p2), Some(0));

        // re-touching p2 moves it to the young end of the queue
        bpm.fetch_frame(p2)?;
        bpm.unpin(p2, false);

        let _p5 = bpm.new_page()?.get_page_id();
        assert_eq!(bpm.get_pin_count(p3), None);
        assert_eq!(bpm.get_pin_count(p2), Some(0));

        bpm.check_invariants();

        Ok(())
    }

    #[test]
    fn test_binary_data_survives_restart() -> Result<()> {
        let path = test_path();
        let mut rng = rand::thread_rng();

        let mut data = [0u8; PAGE_SIZE];
        rng.fill(&mut data[..]);

        let page_id;
        {
            let mut bpm = test_bpm(2, &path);
            let frame = bpm.new_page()?;
            page_id = frame.get_page_id();
            frame.page_mut().write_bytes(0, PAGE_SIZE, &data);
            bpm.unpin(page_id, true);
            bpm.flush(page_id)?;
        }

        let mut bpm = test_bpm(2, &path);
        let frame = bpm.fetch_frame(page_id)?;
        assert_eq!(frame.page().read_bytes(0, PAGE_SIZE), &data[..]);
        bpm.unpin(page_id, false);

        Ok(())
    }

    #[test]
    fn test_eviction_writes_dirty_page_back() -> Result<()> {
        let path = test_path();

        let mut bpm = test_bpm(1, &path);

        let frame = bpm.new_page()?;
        let p1 = frame.get_page_id();
        frame.page_mut().write_bytes(0, 5, b"dirty");
        bpm.unpin(p1, true);

        // single frame pool: this evicts p1 and must persist it
        let p2 = bpm.new_page()?.get_page_id();
        bpm.unpin(p2, false);

        let frame = bpm.fetch_frame(p1)?;
        assert_eq!(frame.page().read_bytes(0, 5), b"dirty");
        bpm.unpin(p1, false);

        Ok(())
    }

    #[test]
    fn test_unpin_dirty_flag_is_sticky() -> Result<()> {
        let path = test_path();

        let mut bpm = test_bpm(2, &path);

        let frame = bpm.new_page()?;
        let p1 = frame.get_page_id();

        assert!(bpm.unpin(p1, true));

        let frame = bpm.fetch_frame(p1)?;
        assert!(frame.page().is_dirty());

        // a clean unpin must not scrub the dirty bit
        assert!(bpm.unpin(p1, false));
        let frame = bpm.fetch_frame(p1)?;
        assert!(frame.page().is_dirty());
        bpm.unpin(p1, false);

        // unpin of a non-resident page fails
        assert!(!bpm.unpin(9999, false));
        // unpin without a pin fails
        assert!(!bpm.unpin(p1, false));

        Ok(())
    }

    #[test]
    fn test_delete_page() -> Result<()> {
        let path = test_path();

        let mut bpm = test_bpm(2, &path);

        let p1 = bpm.new_page()?.get_page_id();

        // pinned pages can't be deleted
        assert!(!bpm.delete_page(p1)?);

        bpm.unpin(p1, true);
        assert!(bpm.delete_page(p1)?);
        assert_eq!(bpm.get_pin_count(p1), None);

        // gone from disk as well
        assert!(bpm.fetch_frame(p1).is_err());

        // deleting a page that is not resident succeeds
        assert!(bpm.delete_page(4242)?);

        bpm.check_invariants();

        Ok(())
    }

    #[test]
    fn test_flush_writes_clean_pages_too() -> Result<()> {
        let path = test_path();

        let mut bpm = test_bpm(2, &path);

        let p1 = bpm.new_page()?.get_page_id();
        bpm.unpin(p1, false);

        bpm.flush(p1)?;
        assert!(bpm.flush(31337).is_err());

        bpm.flush_all()?;

        Ok(())
    }
}
