//! RAII handle for a referenced page.
//!
//! A [`PageHandle`] keeps one reference on a cached page. Dropping it gives
//! the reference back; an unreferenced clean page becomes evictable.

use parking_lot::MappedRwLockReadGuard;

use crate::cache::Page;
use crate::common::PageNo;

use super::Pager;

/// A referenced page.
///
/// Multiple handles may exist for the same page. Content is read through
/// [`data`](Self::data); writing goes through [`Pager::write`], which marks
/// the page dirty first.
///
/// # Example
/// ```ignore
/// let page = pager.get_page(PageNo::new(2))?;
/// let first = page.data()[0];
/// // handle drops here, reference released
/// ```
pub struct PageHandle<'a> {
    pager: &'a Pager,
    page: Page,
}

impl<'a> PageHandle<'a> {
    pub(crate) fn new(pager: &'a Pager, page: Page) -> Self {
        Self { pager, page }
    }

    #[inline]
    pub fn no(&self) -> PageNo {
        self.page.no()
    }

    /// Shared access to the page content.
    #[inline]
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.page.data()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    #[inline]
    pub(crate) fn page(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.pager.release(&self.page);
    }
}

impl std::fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("no", &self.page.no())
            .field("dirty", &self.page.is_dirty())
            .finish()
    }
}
