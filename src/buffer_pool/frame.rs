use std::sync::Arc;

use crate::latch::Latch;
use crate::pages::{Page, PageId};

/// A buffer slot: the resident page, its pin count, and the frame latch.
/// The latch belongs to the frame, not the page, so it survives page
/// reuse after eviction.
#[derive(Debug, Default)]
pub struct Frame {
    page: Page,
    pin_count: u16,
    latch: Arc<Latch>,
}

impl Frame {
    pub(super) fn new() -> Self {
        Self {
            page: Page::new(),
            pin_count: 0,
            latch: Arc::new(Latch::new()),
        }
    }

    pub(super) fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub(super) fn unpin(&mut self) {
        self.pin_count = self.pin_count.saturating_sub(1);
    }

    pub fn get_pin_count(&self) -> u16 {
        self.pin_count
    }

    pub fn get_page_id(&self) -> PageId {
        self.page.get_page_id()
    }

    /// Install a new page into this frame. The previous pin count is
    /// meaningless for the incoming page.
    pub(super) fn set_page(&mut self, page: Page) {
        self.page = page;
        self.pin_count = 0;
    }

    pub(super) fn reset(&mut self) {
        self.page.reset();
        self.pin_count = 0;
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn page_mut(&mut self) -> &mut Page {
        &mut self.page
    }

    pub fn get_latch(&self) -> &Arc<Latch> {
        &self.latch
    }
}
