// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Memory descriptor lists.
//!
//! An [`Mdl`] pins a set of physical pages representing one
//! virtually contiguous buffer. The pages sit on the wired queue
//! for as long as the descriptor lives, so their contents stay
//! resident while a driver or the kernel works on them.

use alloc::vec::Vec;
use core::cmp::min;
use core::ptr;
use memory::{phys_to_virt, PAGE_SIZE};
use physmem::{page_alloc, page_free, PageId, PageQueueKind};

/// A pinned, virtually contiguous buffer of whole pages.
///
pub struct Mdl {
    offset: usize,
    nbytes: usize,
    pages: Vec<PageId>,
}

impl Mdl {
    /// Creates a descriptor large enough to hold `nbytes`
    /// bytes, backed by freshly wired pages.
    ///
    /// # Panics
    ///
    /// Allocation sleeps; physical exhaustion is fatal until
    /// a pager exists.
    ///
    pub fn with_capacity(nbytes: usize) -> Mdl {
        let npages = (nbytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let mut pages = Vec::with_capacity(npages);
        for _ in 0..npages {
            let page = page_alloc(true, PageQueueKind::Wired)
                .expect("sleeping allocation cannot fail");
            pages.push(page);
        }

        Mdl {
            offset: 0,
            nbytes,
            pages,
        }
    }

    /// Grows the descriptor (if necessary) so that it can
    /// hold `nbytes` bytes, wiring additional pages.
    ///
    pub fn expand(&mut self, nbytes: usize) {
        let npages = (nbytes + PAGE_SIZE - 1) / PAGE_SIZE;
        while self.pages.len() < npages {
            let page = page_alloc(true, PageQueueKind::Wired)
                .expect("sleeping allocation cannot fail");
            self.pages.push(page);
        }

        if nbytes > self.nbytes {
            self.nbytes = nbytes;
        }
    }

    /// The descriptor's capacity in bytes, in whole pages.
    ///
    pub fn capacity(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// The pages backing the descriptor.
    ///
    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    /// Copies bytes out of the descriptor, starting `offset`
    /// bytes in.
    ///
    /// # Panics
    ///
    /// `copy_out` panics if the requested range runs past the
    /// descriptor's contents.
    ///
    pub fn copy_out(&self, buffer: &mut [u8], offset: usize) {
        let start = self.offset + offset;
        assert!(start + buffer.len() <= self.nbytes, "read past end of MDL");

        let mut copied = 0;
        while copied < buffer.len() {
            let position = start + copied;
            let page = self.pages[position / PAGE_SIZE];
            let page_offset = position % PAGE_SIZE;
            let chunk = min(buffer.len() - copied, PAGE_SIZE - page_offset);

            let source = phys_to_virt(physmem::page_addr(page)).as_usize() + page_offset;
            unsafe {
                ptr::copy_nonoverlapping(
                    source as *const u8,
                    buffer[copied..].as_mut_ptr(),
                    chunk,
                );
            }

            copied += chunk;
        }
    }

    /// Writes bytes into the descriptor, starting `offset`
    /// bytes in.
    ///
    /// # Panics
    ///
    /// `copy_in` panics if the range runs past the
    /// descriptor's contents.
    ///
    pub fn copy_in(&mut self, buffer: &[u8], offset: usize) {
        let start = self.offset + offset;
        assert!(start + buffer.len() <= self.nbytes, "write past end of MDL");

        let mut copied = 0;
        while copied < buffer.len() {
            let position = start + copied;
            let page = self.pages[position / PAGE_SIZE];
            let page_offset = position % PAGE_SIZE;
            let chunk = min(buffer.len() - copied, PAGE_SIZE - page_offset);

            let destination = phys_to_virt(physmem::page_addr(page)).as_usize() + page_offset;
            unsafe {
                ptr::copy_nonoverlapping(
                    buffer[copied..].as_ptr(),
                    destination as *mut u8,
                    chunk,
                );
            }

            copied += chunk;
        }
    }

    /// Zeroes the descriptor's entire contents.
    ///
    pub fn zero(&mut self) {
        for page in self.pages.iter() {
            let base = phys_to_virt(physmem::page_addr(*page)).as_usize() as *mut u8;
            unsafe { ptr::write_bytes(base, 0, PAGE_SIZE) };
        }
    }
}

impl Drop for Mdl {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            page_free(page);
        }
    }
}
