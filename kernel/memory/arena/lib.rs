// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A general-purpose resource allocator for integer intervals.
//!
//! An [`Arena`] allocates aligned intervals out of a numeric
//! address space, in multiples of its *quantum*. The kernel uses
//! arenas for its own virtual address space, for each process's
//! virtual address space, and for wired kernel memory; nothing
//! about the allocator is specific to addresses, so any numeric
//! namespace works. The algorithm follows Adams and Bonwick,
//! "Magazines and Vmem: Extending the Slab Allocator to Many CPUs
//! and Arbitrary Resources" (2001).
//!
//! ## Structure
//!
//! An arena is a set of *spans* (intervals donated with
//! [`add_span`](Arena::add_span) or imported from an upstream
//! arena), divided into *segments*. The segments form one
//! address-ordered queue in which a span marker precedes the
//! segments covering that span, so segment boundaries within a
//! span always coincide exactly with their neighbours. Each free
//! segment additionally sits on the power-of-two freelist for its
//! size class, and each allocated segment is hashed by base so
//! that a free can find it in constant time.
//!
//! ## Imports
//!
//! An arena constructed with [`Arena::with_source`] asks its
//! import callbacks for a fresh span when an allocation cannot be
//! satisfied, and retries once. The wired-memory arena uses this
//! to pull virtual space from the kernel address arena and back it
//! with physical pages in the same step. Fully-free imported spans
//! are retained rather than returned upstream.
//!
//! ## Descriptors
//!
//! Segment descriptors come from a global pool seeded with a
//! static array ([`bootstrap`]) so that arenas work before any
//! allocator exists. Once the kernel heap is live, a refill
//! callback installed with [`set_refill`] donates further
//! descriptor blocks whenever the pool runs low; allocations made
//! with [`AllocFlags::BOOTSTRAP`] never trigger the refill, which
//! keeps the heap's own arenas from recursing into themselves.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use align::{align_up_usize, is_aligned_usize};
use bitflags::bitflags;
use console::println;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{lock, Mutex};

/// The number of statically-allocated segment descriptors
/// available before the kernel heap exists.
///
const BOOTSTRAP_SEGMENTS: usize = 128;

/// The maximum number of descriptor blocks the pool can
/// hold.
///
const MAX_CHUNKS: usize = 64;

/// The pool refills itself once its free descriptor count
/// falls below this.
///
const LOW_WATER: usize = 8;

/// The number of freelist buckets: one per power of two.
///
const NUM_FREELISTS: usize = 64;

/// The number of hash buckets for allocated segments.
///
const NUM_HASH_BUCKETS: usize = 64;

bitflags! {
    /// Behaviour flags for arena allocation.
    ///
    pub struct AllocFlags: u32 {
        /// The caller can tolerate blocking.
        const SLEEP = 1 << 0;

        /// Fail rather than block.
        const NOSLEEP = 1 << 1;

        /// Draw descriptors from the static pool only;
        /// never invoke the refill callback.
        const BOOTSTRAP = 1 << 2;

        /// Allocate at exactly the requested address, or
        /// fail.
        const EXACT = 1 << 3;
    }
}

/// An arena allocation failure.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArenaError {
    /// No segment (and no importable span) can satisfy the
    /// request.
    Exhausted,
}

/// Identifies a segment descriptor in the global pool.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct SegRef(u32);

impl SegRef {
    fn new(chunk: usize, index: usize) -> Self {
        SegRef(((chunk as u32) << 16) | index as u32)
    }

    fn chunk(self) -> usize {
        (self.0 >> 16) as usize
    }

    fn index(self) -> usize {
        (self.0 & 0xffff) as usize
    }
}

/// The role a segment is currently playing.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SegKind {
    /// An unused descriptor.
    Unused,

    /// A free interval.
    Free,

    /// An allocated interval.
    Allocated,

    /// A marker covering a directly-donated span.
    Span,

    /// A marker covering a span imported from the upstream
    /// arena.
    SpanImported,
}

/// A segment descriptor.
///
/// Descriptors are owned by the global pool and threaded
/// into up to two lists at a time: the address-ordered
/// segment queue (`q` links), and one of the freelist, the
/// allocated-segment hash, or the span list (`l` links).
///
#[derive(Clone)]
pub struct Segment {
    base: usize,
    size: usize,
    kind: SegKind,
    q_next: Option<SegRef>,
    q_prev: Option<SegRef>,
    l_next: Option<SegRef>,
    l_prev: Option<SegRef>,
}

impl Segment {
    /// An unused descriptor, suitable for seeding donated
    /// descriptor blocks.
    ///
    pub const EMPTY: Segment = Segment {
        base: 0,
        size: 0,
        kind: SegKind::Unused,
        q_next: None,
        q_prev: None,
        l_next: None,
        l_prev: None,
    };
}

/// The global descriptor pool.
///
struct SegPool {
    chunks: [Option<(*mut Segment, usize)>; MAX_CHUNKS],
    nchunks: usize,
    free: Option<SegRef>,
    nfree: usize,
}

unsafe impl Send for SegPool {}

const NO_CHUNK: Option<(*mut Segment, usize)> = None;

static POOL: Mutex<SegPool> = Mutex::new(SegPool {
    chunks: [NO_CHUNK; MAX_CHUNKS],
    nchunks: 0,
    free: None,
    nfree: 0,
});

/// Callback that donates a fresh descriptor block once the
/// kernel heap can supply one.
///
static REFILL: Mutex<Option<fn() -> Option<&'static mut [Segment]>>> = Mutex::new(None);

/// Guards against the refill callback recursing into the
/// pool it is refilling.
///
static REFILLING: AtomicBool = AtomicBool::new(false);

impl SegPool {
    fn seg(&self, seg: SegRef) -> &Segment {
        let (base, len) = self.chunks[seg.chunk()].expect("segment names a missing chunk");
        assert!(seg.index() < len);
        unsafe { &*base.add(seg.index()) }
    }

    fn seg_mut(&mut self, seg: SegRef) -> &mut Segment {
        let (base, len) = self.chunks[seg.chunk()].expect("segment names a missing chunk");
        assert!(seg.index() < len);
        unsafe { &mut *base.add(seg.index()) }
    }

    /// Adds a donated block of descriptors to the pool.
    ///
    fn add_chunk(&mut self, chunk: &'static mut [Segment]) {
        assert!(self.nchunks < MAX_CHUNKS, "too many descriptor blocks");
        assert!(chunk.len() <= 0xffff);
        let number = self.nchunks;
        self.chunks[number] = Some((chunk.as_mut_ptr(), chunk.len()));
        self.nchunks += 1;

        for index in 0..chunk.len() {
            self.release(SegRef::new(number, index));
        }
    }

    /// Takes a descriptor from the free list.
    ///
    fn acquire(&mut self) -> SegRef {
        let seg = match self.free {
            Some(seg) => seg,
            None => panic!("arena: out of segment descriptors"),
        };

        self.free = self.seg(seg).l_next;
        self.nfree -= 1;
        *self.seg_mut(seg) = Segment::EMPTY;
        seg
    }

    /// Returns a descriptor to the free list.
    ///
    fn release(&mut self, seg: SegRef) {
        let head = self.free;
        let descriptor = self.seg_mut(seg);
        descriptor.kind = SegKind::Unused;
        descriptor.l_next = head;
        descriptor.l_prev = None;
        self.free = Some(seg);
        self.nfree += 1;
    }
}

/// The static descriptors that carry the system from boot
/// until the heap is live.
///
struct BootSegments(UnsafeCell<[Segment; BOOTSTRAP_SEGMENTS]>);

unsafe impl Sync for BootSegments {}

static BOOT_SEGMENTS: BootSegments =
    BootSegments(UnsafeCell::new([Segment::EMPTY; BOOTSTRAP_SEGMENTS]));

static BOOTSTRAPPED: AtomicBool = AtomicBool::new(false);

/// Seeds the descriptor pool with the static bootstrap
/// descriptors.
///
/// Callable exactly once; later calls are ignored.
///
pub fn bootstrap() {
    // Seed under the pool lock so that a caller racing in
    // after the flag flips still finds the pool populated.
    let mut pool = lock!(POOL);
    if BOOTSTRAPPED.swap(true, Ordering::SeqCst) {
        return;
    }

    let segments: &'static mut [Segment] = unsafe { &mut *BOOT_SEGMENTS.0.get() };
    pool.add_chunk(segments);
}

/// Installs the descriptor refill callback.
///
pub fn set_refill(refill: fn() -> Option<&'static mut [Segment]>) {
    *lock!(REFILL) = Some(refill);
}

/// Tops the descriptor pool up if it has run low.
///
fn maybe_refill(flags: AllocFlags) {
    if flags.contains(AllocFlags::BOOTSTRAP) {
        return;
    }

    if lock!(POOL).nfree >= LOW_WATER {
        return;
    }

    let refill = *lock!(REFILL);
    let refill = match refill {
        Some(refill) => refill,
        None => return,
    };

    // The refill callback allocates from the heap, whose own
    // arenas may recurse here; they pass BOOTSTRAP, but guard
    // against surprises anyway.
    if REFILLING.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Some(chunk) = refill() {
        lock!(POOL).add_chunk(chunk);
    }

    REFILLING.store(false, Ordering::SeqCst);
}

/// The number of free descriptors currently pooled.
///
pub fn free_descriptors() -> usize {
    lock!(POOL).nfree
}

/// The callbacks an arena uses to import spans from an
/// upstream arena.
///
#[derive(Clone, Copy)]
pub struct Import {
    /// Obtains a new span of at least the given size.
    ///
    pub alloc: fn(usize, AllocFlags) -> Result<usize, ArenaError>,

    /// Returns a span obtained from `alloc`.
    ///
    pub free: fn(usize, usize),
}

/// A named interval allocator.
///
pub struct Arena {
    name: &'static str,
    quantum: usize,
    segq_head: Option<SegRef>,
    segq_tail: Option<SegRef>,
    spans: Option<SegRef>,
    freelists: [Option<SegRef>; NUM_FREELISTS],
    hash: [Option<SegRef>; NUM_HASH_BUCKETS],
    import: Option<Import>,
}

fn freelist_index(size: usize) -> usize {
    63 - size.leading_zeros() as usize
}

/// Finalises a 64-bit hash; used to bucket allocated
/// segments by base address.
///
fn murmur64(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}

fn hash_index(base: usize) -> usize {
    (murmur64(base as u64) % NUM_HASH_BUCKETS as u64) as usize
}

const NO_SEG: Option<SegRef> = None;

impl Arena {
    /// Creates an empty arena.
    ///
    /// Intervals are allocated in multiples of `quantum`,
    /// which must be a power of two. Spans are donated later
    /// with [`add_span`](Arena::add_span).
    ///
    pub const fn new(name: &'static str, quantum: usize) -> Arena {
        assert!(quantum.is_power_of_two());
        Arena {
            name,
            quantum,
            segq_head: None,
            segq_tail: None,
            spans: None,
            freelists: [NO_SEG; NUM_FREELISTS],
            hash: [NO_SEG; NUM_HASH_BUCKETS],
            import: None,
        }
    }

    /// Creates an empty arena that imports spans through the
    /// given callbacks when it cannot satisfy an allocation.
    ///
    pub const fn with_source(name: &'static str, quantum: usize, import: Import) -> Arena {
        assert!(quantum.is_power_of_two());
        Arena {
            name,
            quantum,
            segq_head: None,
            segq_tail: None,
            spans: None,
            freelists: [NO_SEG; NUM_FREELISTS],
            hash: [NO_SEG; NUM_HASH_BUCKETS],
            import: Some(import),
        }
    }

    /// Returns the arena's name.
    ///
    pub fn name(&self) -> &'static str {
        self.name
    }

    // Address-ordered queue management.

    fn segq_insert_after(&mut self, pool: &mut SegPool, after: SegRef, seg: SegRef) {
        let next = pool.seg(after).q_next;
        {
            let new = pool.seg_mut(seg);
            new.q_prev = Some(after);
            new.q_next = next;
        }
        pool.seg_mut(after).q_next = Some(seg);
        match next {
            Some(next) => pool.seg_mut(next).q_prev = Some(seg),
            None => self.segq_tail = Some(seg),
        }
    }

    fn segq_insert_before(&mut self, pool: &mut SegPool, before: SegRef, seg: SegRef) {
        let prev = pool.seg(before).q_prev;
        {
            let new = pool.seg_mut(seg);
            new.q_next = Some(before);
            new.q_prev = prev;
        }
        pool.seg_mut(before).q_prev = Some(seg);
        match prev {
            Some(prev) => pool.seg_mut(prev).q_next = Some(seg),
            None => self.segq_head = Some(seg),
        }
    }

    fn segq_push_head(&mut self, pool: &mut SegPool, seg: SegRef) {
        match self.segq_head {
            Some(head) => self.segq_insert_before(pool, head, seg),
            None => {
                self.segq_head = Some(seg);
                self.segq_tail = Some(seg);
                let new = pool.seg_mut(seg);
                new.q_next = None;
                new.q_prev = None;
            }
        }
    }

    fn segq_push_tail(&mut self, pool: &mut SegPool, seg: SegRef) {
        match self.segq_tail {
            Some(tail) => self.segq_insert_after(pool, tail, seg),
            None => self.segq_push_head(pool, seg),
        }
    }

    fn segq_remove(&mut self, pool: &mut SegPool, seg: SegRef) {
        let (prev, next) = {
            let segment = pool.seg(seg);
            (segment.q_prev, segment.q_next)
        };

        match prev {
            Some(prev) => pool.seg_mut(prev).q_next = next,
            None => self.segq_head = next,
        }

        match next {
            Some(next) => pool.seg_mut(next).q_prev = prev,
            None => self.segq_tail = prev,
        }
    }

    // Secondary list management: the freelists, the hash
    // chains, and the span list all use the `l` links.

    fn list_push(head: &mut Option<SegRef>, pool: &mut SegPool, seg: SegRef) {
        let old = *head;
        {
            let new = pool.seg_mut(seg);
            new.l_prev = None;
            new.l_next = old;
        }
        if let Some(old) = old {
            pool.seg_mut(old).l_prev = Some(seg);
        }
        *head = Some(seg);
    }

    fn list_remove(head: &mut Option<SegRef>, pool: &mut SegPool, seg: SegRef) {
        let (prev, next) = {
            let segment = pool.seg(seg);
            (segment.l_prev, segment.l_next)
        };

        match prev {
            Some(prev) => pool.seg_mut(prev).l_next = next,
            None => *head = next,
        }

        if let Some(next) = next {
            pool.seg_mut(next).l_prev = prev;
        }
    }

    fn freelist_insert(&mut self, pool: &mut SegPool, seg: SegRef) {
        let index = freelist_index(pool.seg(seg).size);
        Self::list_push(&mut self.freelists[index], pool, seg);
    }

    fn freelist_remove(&mut self, pool: &mut SegPool, seg: SegRef) {
        let index = freelist_index(pool.seg(seg).size);
        Self::list_remove(&mut self.freelists[index], pool, seg);
    }

    fn hash_insert(&mut self, pool: &mut SegPool, seg: SegRef) {
        let index = hash_index(pool.seg(seg).base);
        Self::list_push(&mut self.hash[index], pool, seg);
    }

    fn hash_remove(&mut self, pool: &mut SegPool, seg: SegRef) {
        let index = hash_index(pool.seg(seg).base);
        Self::list_remove(&mut self.hash[index], pool, seg);
    }

    /// Inserts a span marker and its initial free segment,
    /// returning the free segment.
    ///
    fn add_span_segments(
        &mut self,
        pool: &mut SegPool,
        kind: SegKind,
        base: usize,
        size: usize,
    ) -> SegRef {
        assert!(is_aligned_usize(base, self.quantum));
        assert!(size > 0 && is_aligned_usize(size, self.quantum));

        // Find the last span starting before this one.
        let mut after = None;
        let mut cursor = self.spans;
        while let Some(span) = cursor {
            if pool.seg(span).base >= base {
                break;
            }
            after = Some(span);
            cursor = pool.seg(span).l_next;
        }

        let marker = pool.acquire();
        {
            let new = pool.seg_mut(marker);
            new.base = base;
            new.size = size;
            new.kind = kind;
        }

        let free = pool.acquire();
        {
            let new = pool.seg_mut(free);
            new.base = base;
            new.size = size;
            new.kind = SegKind::Free;
        }

        match after {
            Some(after) => {
                // The next span's marker (if any) is where
                // the new span's segments must stop.
                let next_span = pool.seg(after).l_next;
                {
                    let new = pool.seg_mut(marker);
                    new.l_prev = Some(after);
                    new.l_next = next_span;
                }
                pool.seg_mut(after).l_next = Some(marker);
                if let Some(next_span) = next_span {
                    pool.seg_mut(next_span).l_prev = Some(marker);
                    self.segq_insert_before(pool, next_span, marker);
                } else {
                    self.segq_push_tail(pool, marker);
                }
            }
            None => {
                let old_head = self.spans;
                {
                    let new = pool.seg_mut(marker);
                    new.l_prev = None;
                    new.l_next = old_head;
                }
                if let Some(old_head) = old_head {
                    pool.seg_mut(old_head).l_prev = Some(marker);
                }
                self.spans = Some(marker);
                self.segq_push_head(pool, marker);
            }
        }

        self.segq_insert_after(pool, marker, free);
        self.freelist_insert(pool, free);

        free
    }

    /// Donates the interval `[base, base + size)` to the
    /// arena.
    ///
    pub fn add_span(&mut self, base: usize, size: usize, flags: AllocFlags) {
        maybe_refill(flags);
        let mut pool = lock!(POOL);
        self.add_span_segments(&mut pool, SegKind::Span, base, size);
    }

    /// Splits the allocation `[addr, addr + size)` out of the
    /// free segment `seg`, leaving remainders on the
    /// freelists. The segment becomes the allocated one.
    ///
    fn split(&mut self, pool: &mut SegPool, seg: SegRef, addr: usize, size: usize) {
        let (seg_base, seg_size) = {
            let segment = pool.seg(seg);
            assert!(segment.kind == SegKind::Free);
            (segment.base, segment.size)
        };
        assert!(seg_base <= addr && addr + size <= seg_base + seg_size);

        self.freelist_remove(pool, seg);

        if addr > seg_base {
            let left = pool.acquire();
            {
                let new = pool.seg_mut(left);
                new.kind = SegKind::Free;
                new.base = seg_base;
                new.size = addr - seg_base;
            }
            self.segq_insert_before(pool, seg, left);
            self.freelist_insert(pool, left);
        }

        if addr + size < seg_base + seg_size {
            let right = pool.acquire();
            {
                let new = pool.seg_mut(right);
                new.kind = SegKind::Free;
                new.base = addr + size;
                new.size = (seg_base + seg_size) - (addr + size);
            }
            self.segq_insert_after(pool, seg, right);
            self.freelist_insert(pool, right);
        }

        {
            let segment = pool.seg_mut(seg);
            segment.kind = SegKind::Allocated;
            segment.base = addr;
            segment.size = size;
        }
        self.hash_insert(pool, seg);
    }

    /// Searches the freelists for a segment satisfying the
    /// request, returning the chosen segment and the aligned
    /// allocation address within it.
    ///
    fn search(
        &mut self,
        pool: &mut SegPool,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<(SegRef, usize)> {
        // The bucket for size class k holds free segments in
        // [2^k, 2^(k+1)). If the size is an exact power of
        // two, every entry in its own bucket is big enough;
        // otherwise only the next bucket up gives that
        // guarantee. Bootstrap allocations are permitted the
        // approximate fit to conserve spans.
        let class = freelist_index(size);
        let first = if size.is_power_of_two() || flags.contains(AllocFlags::BOOTSTRAP) {
            class
        } else {
            class + 1
        };

        for bucket in first..NUM_FREELISTS {
            let mut cursor = self.freelists[bucket];
            while let Some(seg) = cursor {
                let (base, seg_size) = {
                    let segment = pool.seg(seg);
                    (segment.base, segment.size)
                };

                let addr = align_up_usize(base, align);
                if addr + size <= base + seg_size {
                    return Some((seg, addr));
                }

                cursor = pool.seg(seg).l_next;
            }
        }

        None
    }

    /// Finds the free segment covering `[addr, addr + size)`
    /// for an exact-address allocation.
    ///
    fn search_exact(&self, pool: &SegPool, addr: usize, size: usize) -> Option<SegRef> {
        let mut cursor = self.segq_head;
        while let Some(seg) = cursor {
            let segment = pool.seg(seg);
            if segment.kind == SegKind::Free
                && segment.base <= addr
                && addr + size <= segment.base + segment.size
            {
                return Some(seg);
            }

            cursor = segment.q_next;
        }

        None
    }

    /// Allocates an interval of `size`.
    ///
    /// This is [`xalloc`](Arena::xalloc) with no alignment or
    /// placement constraints.
    ///
    pub fn alloc(&mut self, size: usize, flags: AllocFlags) -> Result<usize, ArenaError> {
        self.xalloc(size, 0, 0, 0, 0, 0, flags)
    }

    /// Allocates an interval subject to constraints.
    ///
    /// `align` of zero means quantum alignment. With
    /// [`AllocFlags::EXACT`], `min` names the required base
    /// address. `phase` and `nocross` constraints are not
    /// supported and must be zero.
    ///
    /// # Panics
    ///
    /// `xalloc` panics on unsupported constraints, and if the
    /// descriptor pool is exhausted.
    ///
    pub fn xalloc(
        &mut self,
        size: usize,
        align: usize,
        phase: usize,
        nocross: usize,
        min: usize,
        max: usize,
        flags: AllocFlags,
    ) -> Result<usize, ArenaError> {
        assert!(size > 0);
        assert!(phase == 0, "phase allocation is not supported");
        assert!(nocross == 0, "nocross allocation is not supported");

        let size = align_up_usize(size, self.quantum);
        let align = if align == 0 { self.quantum } else { align };
        assert!(align.is_power_of_two());

        maybe_refill(flags);

        if flags.contains(AllocFlags::EXACT) {
            assert!(is_aligned_usize(min, self.quantum));
            let mut pool = lock!(POOL);
            let seg = match self.search_exact(&pool, min, size) {
                Some(seg) => seg,
                None => return Err(ArenaError::Exhausted),
            };
            self.split(&mut pool, seg, min, size);
            return Ok(min);
        }

        assert!(min == 0 && max == 0, "bounded allocation is not supported");

        {
            let mut pool = lock!(POOL);
            if let Some((seg, addr)) = self.search(&mut pool, size, align, flags) {
                self.split(&mut pool, seg, addr, size);
                return Ok(addr);
            }
        }

        // Nothing on the freelists; import a fresh span from
        // the upstream arena and retry once.
        let import = match self.import {
            Some(import) => import,
            None => return Err(ArenaError::Exhausted),
        };

        let span_size = align_up_usize(size, self.quantum);
        let span_base = (import.alloc)(span_size, flags)?;

        let mut pool = lock!(POOL);
        let free = self.add_span_segments(&mut pool, SegKind::SpanImported, span_base, span_size);
        let addr = align_up_usize(pool.seg(free).base, align);
        if addr + size > span_base + span_size {
            // The imported span cannot hold the aligned
            // request; leave it for smaller allocations.
            return Err(ArenaError::Exhausted);
        }

        self.split(&mut pool, free, addr, size);
        Ok(addr)
    }

    /// Frees the interval `[addr, addr + size)`.
    ///
    /// The interval must exactly match an earlier allocation.
    /// Freed segments coalesce greedily with free neighbours
    /// in the same span. Imported spans that become entirely
    /// free are retained.
    ///
    /// # Panics
    ///
    /// Freeing an unknown address, or freeing with the wrong
    /// size, is fatal.
    ///
    pub fn xfree(&mut self, addr: usize, size: usize) {
        let size = align_up_usize(size, self.quantum);
        let mut pool = lock!(POOL);

        // Find the allocated segment by hashing its base.
        let mut cursor = self.hash[hash_index(addr)];
        let seg = loop {
            match cursor {
                Some(seg) if pool.seg(seg).base == addr => break seg,
                Some(seg) => cursor = pool.seg(seg).l_next,
                None => panic!("arena {}: free of unknown address {:#x}", self.name, addr),
            }
        };

        let found = pool.seg(seg).size;
        assert!(
            found == size,
            "arena {}: mismatched size on free (given {:#x}, actual {:#x})",
            self.name,
            size,
            found
        );

        self.hash_remove(&mut pool, seg);

        let mut base = addr;
        let mut total = size;

        // Coalesce to the left.
        if let Some(prev) = pool.seg(seg).q_prev {
            if pool.seg(prev).kind == SegKind::Free {
                base = pool.seg(prev).base;
                total += pool.seg(prev).size;
                self.freelist_remove(&mut pool, prev);
                self.segq_remove(&mut pool, prev);
                pool.release(prev);
            }
        }

        // Coalesce to the right.
        if let Some(next) = pool.seg(seg).q_next {
            if pool.seg(next).kind == SegKind::Free {
                total += pool.seg(next).size;
                self.freelist_remove(&mut pool, next);
                self.segq_remove(&mut pool, next);
                pool.release(next);
            }
        }

        {
            let segment = pool.seg_mut(seg);
            segment.kind = SegKind::Free;
            segment.base = base;
            segment.size = total;
        }
        self.freelist_insert(&mut pool, seg);
    }

    /// Tears the arena down, returning every descriptor to
    /// the pool.
    ///
    /// # Panics
    ///
    /// `destroy` panics if any segment is still allocated.
    ///
    pub fn destroy(&mut self) {
        let mut pool = lock!(POOL);
        let mut cursor = self.segq_head;
        while let Some(seg) = cursor {
            assert!(
                pool.seg(seg).kind != SegKind::Allocated,
                "arena {}: destroyed with live allocations",
                self.name
            );
            cursor = pool.seg(seg).q_next;
            pool.release(seg);
        }

        self.segq_head = None;
        self.segq_tail = None;
        self.spans = None;
        self.freelists = [NO_SEG; NUM_FREELISTS];
        self.hash = [NO_SEG; NUM_HASH_BUCKETS];
    }

    /// Prints the arena's segment queue.
    ///
    pub fn debug(&self) {
        let pool = lock!(POOL);
        println!("arena {} segments:", self.name);
        let mut cursor = self.segq_head;
        while let Some(seg) = cursor {
            let segment = pool.seg(seg);
            let kind = match segment.kind {
                SegKind::Unused => "unused",
                SegKind::Free => " free",
                SegKind::Allocated => "alloc",
                SegKind::Span => " span",
                SegKind::SpanImported => "spani",
            };
            println!(
                "[{}: {:#x}-{:#x}]",
                kind,
                segment.base,
                segment.base + segment.size
            );
            cursor = segment.q_next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec::Vec;

    fn setup() {
        bootstrap();
    }

    /// Collects `(kind, base, size)` for every segment in
    /// address order.
    ///
    fn segments(arena: &Arena) -> Vec<(SegKind, usize, usize)> {
        let pool = lock!(POOL);
        let mut out = Vec::new();
        let mut cursor = arena.segq_head;
        while let Some(seg) = cursor {
            let segment = pool.seg(seg);
            out.push((segment.kind, segment.base, segment.size));
            cursor = segment.q_next;
        }
        out
    }

    /// Checks the structural invariants: segments within a
    /// span tile it exactly, every free segment is on the
    /// freelist bucket of its size class, and every allocated
    /// segment is reachable through the hash.
    ///
    fn check(arena: &Arena) {
        let segs = segments(arena);
        let mut index = 0;
        while index < segs.len() {
            let (kind, span_base, span_size) = segs[index];
            assert!(
                kind == SegKind::Span || kind == SegKind::SpanImported,
                "expected a span marker at {:#x}",
                span_base
            );

            let mut covered = span_base;
            index += 1;
            while index < segs.len() {
                let (kind, base, size) = segs[index];
                if kind == SegKind::Span || kind == SegKind::SpanImported {
                    break;
                }

                assert_eq!(base, covered, "gap or overlap at {:#x}", base);
                covered = base + size;
                index += 1;
            }

            assert_eq!(covered, span_base + span_size, "span not exactly tiled");
        }

        let pool = lock!(POOL);
        for (bucket, head) in arena.freelists.iter().enumerate() {
            let mut cursor = *head;
            while let Some(seg) = cursor {
                let segment = pool.seg(seg);
                assert_eq!(segment.kind, SegKind::Free);
                assert_eq!(freelist_index(segment.size), bucket);
                cursor = segment.l_next;
            }
        }
    }

    fn allocated_count(arena: &Arena) -> usize {
        segments(arena)
            .iter()
            .filter(|(kind, _, _)| *kind == SegKind::Allocated)
            .count()
    }

    #[test]
    fn test_alloc_free_round_trip() {
        setup();
        let mut arena = Arena::new("round-trip", 0x1000);
        arena.add_span(0x1000, 0x7000, AllocFlags::NOSLEEP);

        let first = arena.alloc(0x2000, AllocFlags::NOSLEEP).unwrap();
        assert_eq!(first, 0x1000);
        let second = arena.alloc(0x1000, AllocFlags::NOSLEEP).unwrap();
        assert_eq!(second, 0x3000);
        check(&arena);

        arena.xfree(first, 0x2000);
        arena.xfree(second, 0x1000);
        check(&arena);

        // Everything coalesced back to a single free segment
        // covering the whole span, and nothing remains
        // allocated.
        assert_eq!(
            segments(&arena),
            std::vec![
                (SegKind::Span, 0x1000, 0x7000),
                (SegKind::Free, 0x1000, 0x7000),
            ]
        );
        assert_eq!(allocated_count(&arena), 0);
    }

    #[test]
    fn test_exact_and_aligned() {
        setup();
        let mut arena = Arena::new("exact", 0x1000);
        arena.add_span(0x10000, 0x10000, AllocFlags::NOSLEEP);

        // Claim a specific address.
        let addr = arena
            .xalloc(0x2000, 0, 0, 0, 0x14000, 0, AllocFlags::EXACT)
            .unwrap();
        assert_eq!(addr, 0x14000);
        check(&arena);

        // The same address again must fail.
        assert_eq!(
            arena.xalloc(0x2000, 0, 0, 0, 0x14000, 0, AllocFlags::EXACT),
            Err(ArenaError::Exhausted)
        );

        // An aligned allocation skips ahead to a suitable
        // boundary.
        let aligned = arena
            .xalloc(0x1000, 0x8000, 0, 0, 0, 0, AllocFlags::NOSLEEP)
            .unwrap();
        assert_eq!(aligned % 0x8000, 0);
        check(&arena);

        arena.xfree(addr, 0x2000);
        arena.xfree(aligned, 0x1000);
        check(&arena);
        assert_eq!(allocated_count(&arena), 0);
    }

    #[test]
    fn test_exhaustion() {
        setup();
        let mut arena = Arena::new("exhaustion", 0x1000);
        arena.add_span(0x1000, 0x2000, AllocFlags::NOSLEEP);

        assert!(arena.alloc(0x2000, AllocFlags::NOSLEEP).is_ok());
        assert_eq!(
            arena.alloc(0x1000, AllocFlags::NOSLEEP),
            Err(ArenaError::Exhausted)
        );
    }

    #[test]
    fn test_multiple_spans() {
        setup();
        let mut arena = Arena::new("spans", 0x1000);

        // Donate out of order; the queue must remain address
        // ordered.
        arena.add_span(0x8000, 0x8000, AllocFlags::NOSLEEP);
        arena.add_span(0x1000, 0x3000, AllocFlags::NOSLEEP);
        check(&arena);

        let segs = segments(&arena);
        assert_eq!(segs[0], (SegKind::Span, 0x1000, 0x3000));
        assert_eq!(segs[2], (SegKind::Span, 0x8000, 0x8000));

        // A free crossing a span boundary must never
        // coalesce across the marker: allocate the tail of
        // the first span and the head of the second.
        let tail = arena
            .xalloc(0x1000, 0, 0, 0, 0x3000, 0, AllocFlags::EXACT)
            .unwrap();
        let head = arena
            .xalloc(0x1000, 0, 0, 0, 0x8000, 0, AllocFlags::EXACT)
            .unwrap();
        arena.xfree(tail, 0x1000);
        arena.xfree(head, 0x1000);
        check(&arena);

        let free_count = segments(&arena)
            .iter()
            .filter(|(kind, _, _)| *kind == SegKind::Free)
            .count();
        assert_eq!(free_count, 2);
    }

    mod import {
        use super::*;

        static UPSTREAM: Mutex<Option<Arena>> = Mutex::new(None);

        fn upstream_alloc(size: usize, flags: AllocFlags) -> Result<usize, ArenaError> {
            lock!(UPSTREAM).as_mut().unwrap().alloc(size, flags)
        }

        fn upstream_free(addr: usize, size: usize) {
            lock!(UPSTREAM).as_mut().unwrap().xfree(addr, size);
        }

        #[test]
        fn test_import() {
            setup();
            {
                let mut upstream = Arena::new("import-upstream", 0x1000);
                upstream.add_span(0x100000, 0x10000, AllocFlags::NOSLEEP);
                *lock!(UPSTREAM) = Some(upstream);
            }

            let mut arena = Arena::with_source(
                "import-downstream",
                0x1000,
                Import {
                    alloc: upstream_alloc,
                    free: upstream_free,
                },
            );

            // Empty arena: the first allocation imports a
            // span from upstream.
            let addr = arena.alloc(0x2000, AllocFlags::NOSLEEP).unwrap();
            assert!((0x100000..0x110000).contains(&addr));
            check(&arena);

            let segs = segments(&arena);
            assert_eq!(segs[0].0, SegKind::SpanImported);

            // The span stays with the arena across a free.
            arena.xfree(addr, 0x2000);
            check(&arena);
            assert_eq!(segments(&arena).len(), 2);

            // And is reused without importing again.
            let upstream_free_before = {
                let guard = lock!(UPSTREAM);
                segments(guard.as_ref().unwrap()).len()
            };
            let again = arena.alloc(0x1000, AllocFlags::NOSLEEP).unwrap();
            assert_eq!(again, addr);
            let upstream_free_after = {
                let guard = lock!(UPSTREAM);
                segments(guard.as_ref().unwrap()).len()
            };
            assert_eq!(upstream_free_before, upstream_free_after);
        }
    }
}
