// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use bitflags::bitflags;

bitflags! {
    /// The protection requested for a mapping.
    ///
    /// `Prot` is the machine-independent view; the physical
    /// map translates it into [`PageTableFlags`].
    ///
    pub struct Prot: u8 {
        /// The mapping can be read.
        const READ = 1 << 0;

        /// The mapping can be written.
        const WRITE = 1 << 1;

        /// Instructions can be fetched from the mapping.
        const EXECUTE = 1 << 2;
    }
}

impl Prot {
    /// Read, write, and execute.
    ///
    pub const ALL: Prot = Prot::from_bits_truncate(
        Prot::READ.bits() | Prot::WRITE.bits() | Prot::EXECUTE.bits(),
    );
}

bitflags! {
    /// The flag bits of an x86-64 page table entry.
    ///
    pub struct PageTableFlags: u64 {
        /// The entry maps a frame or references a table.
        const PRESENT = 1 << 0;

        /// Writes are allowed through this entry.
        const WRITABLE = 1 << 1;

        /// Ring 3 may use this entry.
        const USER_ACCESSIBLE = 1 << 2;

        /// Writes through this entry bypass the cache.
        const WRITE_THROUGH = 1 << 3;

        /// Reads through this entry bypass the cache.
        const NO_CACHE = 1 << 4;

        /// The CPU has read through this entry.
        const ACCESSED = 1 << 5;

        /// The CPU has written through this entry.
        const DIRTY = 1 << 6;

        /// The entry maps a huge frame instead of
        /// referencing a table.
        const HUGE_PAGE = 1 << 7;

        /// The mapping survives an address space switch.
        const GLOBAL = 1 << 8;

        /// Instructions cannot be fetched through this
        /// entry.
        const NO_EXECUTE = 1 << 63;
    }
}
