// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! VM objects, anonymous maps, and anons.
//!
//! A VM object is what a map entry maps: a reference-counted,
//! typed entity. Direct-physical objects describe fixed windows
//! onto physical memory (the physical-memory mapping and the
//! kernel binary); anonymous objects describe zero-fill,
//! copy-on-write memory and carry an anonymous map (*amap*) of
//! *anons*.
//!
//! An anon is the identity of one logical page of anonymous
//! memory. It is reference counted: an anon shared between amaps
//! (after an object copy) must never be mapped writable, which
//! [`object_copy`] enforces by downgrading every existing mapping.
//! Each anon is either resident, owning a physical page whose
//! back-pointer names the anon, or recorded as swapped out, a
//! state the fault path recognises but nothing yet produces,
//! since there is no pager.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use memory::{phys_to_virt, PhysAddr, PAGE_SIZE};
use physmem::{page_alloc, page_free, PageId, PageOwner, PageQueueKind};
use spin::{lock, Mutex};

/// The number of anon slots per amap chunk.
///
pub const AMAP_CHUNK_SLOTS: usize = 32;

/// Identifies a VM object.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectId(pub(crate) u32);

/// Identifies an anon.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AnonId(pub(crate) u32);

/// Where an anon's contents currently live.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Residence {
    /// In memory, on the given physical page.
    Resident(PageId),

    /// Swapped out to the given slot. Nothing writes this
    /// state yet; the fault path treats it as fatal.
    Swapped(u64),
}

/// One logical page of anonymous memory.
///
pub(crate) struct Anon {
    pub(crate) refcnt: u32,

    /// Page offset within the owning amap.
    pub(crate) offset: usize,

    pub(crate) residence: Residence,
}

struct AnonTable {
    slots: Vec<Option<Anon>>,
    free: Vec<u32>,
}

static ANONS: Mutex<AnonTable> = Mutex::new(AnonTable {
    slots: Vec::new(),
    free: Vec::new(),
});

impl AnonTable {
    fn insert(&mut self, anon: Anon) -> AnonId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(anon);
                AnonId(slot)
            }
            None => {
                self.slots.push(Some(anon));
                AnonId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn get(&self, id: AnonId) -> &Anon {
        self.slots[id.0 as usize].as_ref().expect("stale anon id")
    }

    fn get_mut(&mut self, id: AnonId) -> &mut Anon {
        self.slots[id.0 as usize].as_mut().expect("stale anon id")
    }

    fn remove(&mut self, id: AnonId) -> Anon {
        let anon = self.slots[id.0 as usize].take().expect("stale anon id");
        self.free.push(id.0);
        anon
    }
}

/// Creates a new resident anon for the given page offset,
/// backed by a zeroed page on the active queue.
///
pub(crate) fn anon_new(offset: usize) -> AnonId {
    let page = page_alloc(true, PageQueueKind::Active).expect("sleeping allocation cannot fail");
    let id = lock!(ANONS).insert(Anon {
        refcnt: 1,
        offset,
        residence: Residence::Resident(page),
    });
    physmem::set_page_owner(page, PageOwner::Anon(id.0));
    id
}

/// Copies an anon, yielding a new anon with its own copy of
/// the page contents.
///
pub(crate) fn anon_copy(anon: AnonId) -> AnonId {
    let source = anon_page(anon).expect("cannot copy a non-resident anon");
    let new = {
        let offset = lock!(ANONS).get(anon).offset;
        anon_new(offset)
    };
    let destination = anon_page(new).expect("fresh anon is resident");
    copy_phys_page(physmem::page_addr(destination), physmem::page_addr(source));
    new
}

/// Takes an additional reference to an anon.
///
pub(crate) fn anon_ref(anon: AnonId) {
    lock!(ANONS).get_mut(anon).refcnt += 1;
}

/// Drops a reference to an anon, freeing its page when the
/// last reference goes.
///
pub(crate) fn anon_release(anon: AnonId) {
    let mut anons = lock!(ANONS);
    let entry = anons.get_mut(anon);
    entry.refcnt -= 1;
    if entry.refcnt > 0 {
        return;
    }

    let removed = anons.remove(anon);
    drop(anons);

    match removed.residence {
        Residence::Resident(page) => page_free(page),
        Residence::Swapped(_) => panic!("anon_release: swapped-out anons are not supported"),
    }
}

/// Returns the anon's resident page, if it has one.
///
pub(crate) fn anon_page(anon: AnonId) -> Option<PageId> {
    match lock!(ANONS).get(anon).residence {
        Residence::Resident(page) => Some(page),
        Residence::Swapped(_) => None,
    }
}

/// Returns the anon's reference count.
///
pub(crate) fn anon_refcnt(anon: AnonId) -> u32 {
    lock!(ANONS).get(anon).refcnt
}

/// Copies one page of physical memory through the physical
/// window.
///
fn copy_phys_page(destination: PhysAddr, source: PhysAddr) {
    unsafe {
        ptr::copy_nonoverlapping(
            phys_to_virt(source).as_usize() as *const u8,
            phys_to_virt(destination).as_usize() as *mut u8,
            PAGE_SIZE,
        );
    }
}

/// A sparse array of anons, chunked to keep small objects
/// cheap.
///
pub(crate) struct Amap {
    chunks: Vec<Option<Box<AmapChunk>>>,
}

struct AmapChunk {
    anons: [Option<AnonId>; AMAP_CHUNK_SLOTS],
}

impl Amap {
    pub(crate) fn new() -> Amap {
        Amap { chunks: Vec::new() }
    }

    /// Returns the anon at the given page offset, if any.
    ///
    pub(crate) fn get(&self, page: usize) -> Option<AnonId> {
        let chunk = self.chunks.get(page / AMAP_CHUNK_SLOTS)?;
        chunk.as_ref()?.anons[page % AMAP_CHUNK_SLOTS]
    }

    /// Stores an anon at the given page offset, growing the
    /// chunk array as needed. Returns the previous occupant.
    ///
    pub(crate) fn set(&mut self, page: usize, anon: Option<AnonId>) -> Option<AnonId> {
        let index = page / AMAP_CHUNK_SLOTS;
        if self.chunks.len() <= index {
            self.chunks.resize_with(index + 1, || None);
        }

        let chunk = self.chunks[index].get_or_insert_with(|| {
            Box::new(AmapChunk {
                anons: [None; AMAP_CHUNK_SLOTS],
            })
        });

        core::mem::replace(&mut chunk.anons[page % AMAP_CHUNK_SLOTS], anon)
    }

    /// Iterates over every present anon.
    ///
    pub(crate) fn anons(&self) -> Vec<AnonId> {
        let mut out = Vec::new();
        for chunk in self.chunks.iter().flatten() {
            for anon in chunk.anons.iter().flatten() {
                out.push(*anon);
            }
        }
        out
    }
}

/// What a VM object maps.
///
pub(crate) enum ObjectKind {
    /// A window onto physical memory starting at `base`.
    DirectPhys { base: PhysAddr },

    /// Anonymous, zero-fill memory.
    Anon {
        amap: Amap,
        parent: Option<ObjectId>,
    },

    /// Reserved for heap-backed objects.
    KernelHeap,
}

/// A mappable, reference-counted VM object.
///
pub(crate) struct Object {
    pub(crate) refcnt: u32,

    /// Logical size in bytes.
    pub(crate) size: usize,

    pub(crate) kind: ObjectKind,
}

struct ObjectTable {
    slots: Vec<Option<Object>>,
    free: Vec<u32>,
}

static OBJECTS: Mutex<ObjectTable> = Mutex::new(ObjectTable {
    slots: Vec::new(),
    free: Vec::new(),
});

impl ObjectTable {
    fn insert(&mut self, object: Object) -> ObjectId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(object);
                ObjectId(slot)
            }
            None => {
                self.slots.push(Some(object));
                ObjectId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn get(&self, id: ObjectId) -> &Object {
        self.slots[id.0 as usize].as_ref().expect("stale object id")
    }

    fn get_mut(&mut self, id: ObjectId) -> &mut Object {
        self.slots[id.0 as usize].as_mut().expect("stale object id")
    }

    fn remove(&mut self, id: ObjectId) -> Object {
        let object = self.slots[id.0 as usize].take().expect("stale object id");
        self.free.push(id.0);
        object
    }
}

/// Runs `body` with a shared borrow of the object.
///
pub(crate) fn with_object<R>(id: ObjectId, body: impl FnOnce(&Object) -> R) -> R {
    let objects = lock!(OBJECTS);
    body(objects.get(id))
}

/// Runs `body` with an exclusive borrow of the object.
///
pub(crate) fn with_object_mut<R>(id: ObjectId, body: impl FnOnce(&mut Object) -> R) -> R {
    let mut objects = lock!(OBJECTS);
    body(objects.get_mut(id))
}

/// Creates a new anonymous object of `size` bytes.
///
pub fn aobj_new(size: usize) -> ObjectId {
    lock!(OBJECTS).insert(Object {
        refcnt: 1,
        size,
        kind: ObjectKind::Anon {
            amap: Amap::new(),
            parent: None,
        },
    })
}

/// Creates a direct-physical object mapping `size` bytes
/// starting at `base`.
///
pub fn dobj_new(base: PhysAddr, size: usize) -> ObjectId {
    lock!(OBJECTS).insert(Object {
        refcnt: 1,
        size,
        kind: ObjectKind::DirectPhys { base },
    })
}

/// Takes an additional reference to an object.
///
pub fn object_retain(id: ObjectId) {
    lock!(OBJECTS).get_mut(id).refcnt += 1;
}

/// Returns an object's reference count.
///
pub fn object_refcnt(id: ObjectId) -> u32 {
    lock!(OBJECTS).get(id).refcnt
}

/// Drops a reference to an object. The last release tears
/// down the object's anons.
///
pub fn object_release(id: ObjectId) {
    let mut objects = lock!(OBJECTS);
    let object = objects.get_mut(id);
    object.refcnt -= 1;
    if object.refcnt > 0 {
        return;
    }

    let removed = objects.remove(id);
    drop(objects);

    match removed.kind {
        ObjectKind::Anon { amap, parent } => {
            for anon in amap.anons() {
                anon_release(anon);
            }

            if let Some(parent) = parent {
                object_release(parent);
            }
        }
        ObjectKind::DirectPhys { .. } | ObjectKind::KernelHeap => {}
    }
}

/// Creates a copy of an object.
///
/// Copying an anonymous object shares its anons
/// copy-on-write: both objects see the same pages until
/// either writes, and all prior writable mappings have been
/// downgraded by the time this returns. Copying any other
/// object yields a fresh, empty anonymous object whose
/// parent pointer records where absent pages would come
/// from.
///
pub fn object_copy(id: ObjectId) -> ObjectId {
    let mut objects = lock!(OBJECTS);
    let source = objects.get(id);
    let size = source.size;

    match &source.kind {
        ObjectKind::Anon { amap, parent } => {
            let parent = *parent;

            // Snapshot the amap, then drop the object table
            // lock: the sharing pass reaches into the anon
            // table and the physical map.
            let mut pairs = Vec::new();
            for (index, chunk) in amap.chunks.iter().enumerate() {
                let chunk = match chunk {
                    Some(chunk) => chunk,
                    None => continue,
                };

                for (slot, anon) in chunk.anons.iter().enumerate() {
                    if let Some(anon) = anon {
                        pairs.push((index * AMAP_CHUNK_SLOTS + slot, *anon));
                    }
                }
            }
            drop(objects);

            // Share every anon, and downgrade all existing
            // mappings of shared pages so the next write
            // faults into a copy.
            let mut copied = Amap::new();
            for (page, anon) in pairs {
                anon_ref(anon);
                if let Some(resident) = anon_page(anon) {
                    pmap::reenter_all_readonly(resident);
                }

                copied.set(page, Some(anon));
            }

            if let Some(parent) = parent {
                object_retain(parent);
            }

            lock!(OBJECTS).insert(Object {
                refcnt: 1,
                size,
                kind: ObjectKind::Anon {
                    amap: copied,
                    parent,
                },
            })
        }
        ObjectKind::DirectPhys { .. } | ObjectKind::KernelHeap => {
            drop(objects);
            object_retain(id);
            lock!(OBJECTS).insert(Object {
                refcnt: 1,
                size,
                kind: ObjectKind::Anon {
                    amap: Amap::new(),
                    parent: Some(id),
                },
            })
        }
    }
}
