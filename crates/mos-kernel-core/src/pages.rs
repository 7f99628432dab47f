//! Physical page arena
//!
//! Pages are handed out by index and reference counted by the page tables
//! that map them. A page whose count drops to zero returns to the free list
//! and is zeroed again before its next use.

use alloc::vec::Vec;

use mos_ipc::Errno;

use crate::types::{PageFrame, PageId};

/// Bounded pool of physical pages
pub struct PageArena {
    frames: Vec<PageFrame>,
    free: Vec<PageId>,
    in_use: u32,
    max_pages: u32,
}

impl PageArena {
    /// Create an empty arena that will hand out at most `max_pages` pages
    pub fn new(max_pages: u32) -> Self {
        Self {
            frames: Vec::new(),
            free: Vec::new(),
            in_use: 0,
            max_pages,
        }
    }

    /// Take a zeroed page with a reference count of 0.
    ///
    /// The caller must map it (and thereby [`incref`](Self::incref) it)
    /// before the next call to [`reclaim`](Self::reclaim).
    pub fn alloc(&mut self) -> Result<PageId, Errno> {
        if self.in_use >= self.max_pages {
            return Err(Errno::NoMem);
        }
        let id = match self.free.pop() {
            Some(id) => {
                let frame = &mut self.frames[id.0 as usize];
                frame.data.fill(0);
                frame.refs = 0;
                id
            }
            None => {
                self.frames.push(PageFrame::zeroed());
                PageId(self.frames.len() as u32 - 1)
            }
        };
        self.in_use += 1;
        Ok(id)
    }

    /// Add one mapping reference
    pub fn incref(&mut self, id: PageId) {
        if let Some(frame) = self.frames.get_mut(id.0 as usize) {
            frame.refs += 1;
        }
    }

    /// Drop one mapping reference, freeing the page when none remain
    pub fn decref(&mut self, id: PageId) {
        let Some(frame) = self.frames.get_mut(id.0 as usize) else {
            return;
        };
        frame.refs = frame.refs.saturating_sub(1);
        if frame.refs == 0 {
            self.release(id);
        }
    }

    /// Return a page that was allocated but never mapped
    pub fn reclaim(&mut self, id: PageId) {
        if self.frames.get(id.0 as usize).is_some_and(|f| f.refs == 0) {
            self.release(id);
        }
    }

    fn release(&mut self, id: PageId) {
        if !self.free.contains(&id) {
            self.free.push(id);
            self.in_use = self.in_use.saturating_sub(1);
        }
    }

    /// Mapping count of a page
    pub fn refs(&self, id: PageId) -> u32 {
        self.frames.get(id.0 as usize).map(|f| f.refs).unwrap_or(0)
    }

    /// Page contents
    pub fn data(&self, id: PageId) -> Option<&[u8]> {
        self.frames.get(id.0 as usize).map(|f| &f.data[..])
    }

    /// Mutable page contents
    pub fn data_mut(&mut self, id: PageId) -> Option<&mut [u8]> {
        self.frames.get_mut(id.0 as usize).map(|f| &mut f.data[..])
    }

    /// Pages currently handed out
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Page budget
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Whether a page is on the free list
    pub fn is_free(&self, id: PageId) -> bool {
        self.free.contains(&id)
    }

    /// Every page ever created, with its reference count
    pub fn frames(&self) -> impl Iterator<Item = (PageId, u32)> + '_ {
        self.frames
            .iter()
            .enumerate()
            .map(|(i, f)| (PageId(i as u32), f.refs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_respects_budget() {
        let mut arena = PageArena::new(2);
        let a = arena.alloc().unwrap();
        arena.incref(a);
        let b = arena.alloc().unwrap();
        arena.incref(b);
        assert_eq!(arena.alloc(), Err(Errno::NoMem));
        assert_eq!(arena.in_use(), 2);
    }

    #[test]
    fn test_decref_recycles_and_zeroes() {
        let mut arena = PageArena::new(1);
        let a = arena.alloc().unwrap();
        arena.incref(a);
        arena.data_mut(a).unwrap()[10] = 0xaa;
        arena.decref(a);
        assert!(arena.is_free(a));
        assert_eq!(arena.in_use(), 0);

        let b = arena.alloc().unwrap();
        assert_eq!(a, b);
        assert_eq!(arena.data(b).unwrap()[10], 0);
    }

    #[test]
    fn test_shared_page_survives_one_decref() {
        let mut arena = PageArena::new(4);
        let a = arena.alloc().unwrap();
        arena.incref(a);
        arena.incref(a);
        arena.decref(a);
        assert_eq!(arena.refs(a), 1);
        assert!(!arena.is_free(a));
    }

    #[test]
    fn test_reclaim_unmapped_page() {
        let mut arena = PageArena::new(1);
        let a = arena.alloc().unwrap();
        arena.reclaim(a);
        assert_eq!(arena.in_use(), 0);
        assert!(arena.alloc().is_ok());
    }
}
