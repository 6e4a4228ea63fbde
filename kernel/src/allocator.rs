// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The global allocator: Rust's `alloc` routed into the slab
//! ladder.
//!
//! Every `Box`, `Vec`, and `Arc` in the kernel draws from the
//! slab zones (or, for page-multiple sizes, the wired arena)
//! via [`kmem`]. The allocator is registered only when building
//! for bare metal; host-side test binaries keep their own.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// The kernel heap.
///
pub struct KernelHeap;

/// The slab ladder aligns objects to eight bytes (and
/// power-of-two sizes to themselves); stricter alignments are
/// met by rounding the request up to a power-of-two zone at
/// least as large as the alignment.
///
fn padded_size(layout: Layout) -> usize {
    if layout.align() <= 8 {
        layout.size()
    } else {
        layout
            .size()
            .max(layout.align())
            .next_power_of_two()
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return ptr::null_mut();
        }

        kmem::kmem_alloc(padded_size(layout))
    }

    unsafe fn dealloc(&self, object: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        kmem::kmem_free(object, padded_size(layout));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return ptr::null_mut();
        }

        kmem::kmem_zalloc(padded_size(layout))
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: KernelHeap = KernelHeap;
