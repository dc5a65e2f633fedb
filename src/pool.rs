//! Descriptor pools: bounded free-lists of QHs and qTDs backed by
//! DMA-coherent hardware blocks.
//!
//! Storage is a slab (`alloc::vec::Vec<Option<Node>>`) addressed by a small
//! index handle rather than a raw or shared pointer — the cyclic rings this
//! crate builds (the async ring, per-QH qTD rings) are expressed as handle
//! links, so the cycle can never leak through the type system as a
//! reference-counted loop.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::num::NonZeroU32;

use crate::dma::{DmaAllocator, DmaBlock, PhysAddr};
use crate::error::Error;
use crate::qh::QhHw;
use crate::qtd::QtdHw;

/// Index handle into a [`Slab`]. `NonZeroU32` so `Option<Handle>` is free.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Handle(NonZeroU32);

impl Handle {
    fn from_index(index: usize) -> Self {
        Handle(NonZeroU32::new(index as u32 + 1).expect("index + 1 is never zero"))
    }
    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

pub type QtdHandle = Handle;
pub type QhHandle = Handle;
pub type OptionalQhHandle = Option<QhHandle>;

struct Slab<T> {
    slots: Vec<Option<T>>,
    free_slots: Vec<u32>,
}

impl<T> Slab<T> {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> Handle {
        if let Some(idx) = self.free_slots.pop() {
            self.slots[idx as usize] = Some(value);
            Handle::from_index(idx as usize)
        } else {
            self.slots.push(Some(value));
            Handle::from_index(self.slots.len() - 1)
        }
    }

    fn remove(&mut self, h: Handle) -> T {
        let idx = h.index();
        let value = self.slots[idx].take().expect("handle must reference a live slot");
        self.free_slots.push(idx as u32);
        value
    }

    fn get(&self, h: Handle) -> &T {
        self.slots[h.index()].as_ref().expect("handle must reference a live slot")
    }

    fn get_mut(&mut self, h: Handle) -> &mut T {
        self.slots[h.index()].as_mut().expect("handle must reference a live slot")
    }

    fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }
}

/// A pool entry: the typed hardware block plus the backing DMA allocation
/// (kept around so `destroy` can hand it back to the allocator) and the
/// driver-private fields that ride alongside.
pub struct QtdEntry {
    pub hw: DmaBlock,
    pub paddr: PhysAddr,
    /// Sibling next in a per-QH transfer ring.
    pub sibling_next: Option<QtdHandle>,
    /// Owning QH, set when linked into a transfer ring.
    pub owner: Option<QhHandle>,
    /// Bytes requested of this qTD at submission time, so the reaper can
    /// recover actual bytes transferred from the token's remaining-length
    /// field on completion.
    pub requested: u16,
}

impl QtdEntry {
    /// # Safety
    /// `hw` must point at a live, exclusively-owned `QtdHw`-shaped block.
    unsafe fn hw(&self) -> &QtdHw {
        &*(self.hw.virt.as_ptr() as *const QtdHw)
    }
    unsafe fn hw_mut(&mut self) -> &mut QtdHw {
        &mut *(self.hw.virt.as_ptr() as *mut QtdHw)
    }
}

/// The transfer a QH is currently carrying, retained across the
/// interrupt-driven gap between `transfer_enqueue` returning and the
/// reaper eventually reporting completion.
pub struct PendingTransfer {
    pub head_qtd: QtdHandle,
    pub private: *mut (),
    pub finished: fn(*mut (), i32),
}

pub struct QhEntry {
    pub hw: DmaBlock,
    pub paddr: PhysAddr,
    pub prev: Option<QhHandle>,
    pub next: Option<QhHandle>,
    pub last_qtd: Option<QtdHandle>,
    pub period: u32,
    pub phase: u32,
    pub uframe: u8,
    pub pending: Option<PendingTransfer>,
    /// Scratch DMA block a control pipe's SETUP qTD points its buffer at;
    /// allocated once on first use of a control QH and rewritten on every
    /// control transfer, since the stack only ever supplies a buffer for
    /// the data stage. `None` for non-control QHs.
    pub setup: Option<DmaBlock>,
}

impl QhEntry {
    unsafe fn hw(&self) -> &QhHw {
        &*(self.hw.virt.as_ptr() as *const QhHw)
    }
    unsafe fn hw_mut(&mut self) -> &mut QhHw {
        &mut *(self.hw.virt.as_ptr() as *mut QhHw)
    }
    fn reset_hw(&mut self) {
        unsafe { self.hw_mut() }.reset();
    }
}

/// The two descriptor pools, shared across the async and periodic
/// schedules since both ultimately allocate from the same qTD/QH arenas.
pub struct DescriptorPools<'a, A: DmaAllocator> {
    alloc: &'a A,
    qtds: Slab<QtdEntry>,
    qtd_free: VecDeque<QtdHandle>,
    qtd_cap: usize,
    qhs: Slab<QhEntry>,
    qh_free: VecDeque<QhHandle>,
    qh_cap: usize,
}

impl<'a, A: DmaAllocator> DescriptorPools<'a, A> {
    pub fn new(alloc: &'a A, qtd_cap: usize, qh_cap: usize) -> Self {
        Self {
            alloc,
            qtds: Slab::new(),
            qtd_free: VecDeque::new(),
            qtd_cap,
            qhs: Slab::new(),
            qh_free: VecDeque::new(),
            qh_cap,
        }
    }

    pub fn qtd_count(&self) -> usize {
        self.qtds.len()
    }
    pub fn qh_count(&self) -> usize {
        self.qhs.len()
    }

    /// Pops a qTD off the free list, or allocates a fresh one on miss. A
    /// reused entry has its driver-private bookkeeping cleared, but the
    /// hardware block is (re)initialized by [`crate::qtd::QtdHw::init`],
    /// not here.
    pub fn alloc_qtd(&mut self) -> Result<QtdHandle, Error> {
        if let Some(h) = self.qtd_free.pop_front() {
            let entry = self.qtds.get_mut(h);
            entry.sibling_next = None;
            entry.owner = None;
            entry.requested = 0;
            return Ok(h);
        }
        let block = self.alloc.alloc(core::mem::size_of::<QtdHw>(), 32).ok_or(Error::OutOfMemory)?;
        let paddr = block.phys;
        let h = self.qtds.insert(QtdEntry {
            hw: block,
            paddr,
            sibling_next: None,
            owner: None,
            requested: 0,
        });
        Ok(h)
    }

    /// Releases a qTD to the free list; if that would exceed the cap, the
    /// oldest pooled qTD is destroyed first.
    pub fn release_qtd(&mut self, h: QtdHandle) {
        self.qtd_free.push_front(h);
        if self.qtd_free.len() > self.qtd_cap {
            if let Some(victim) = self.qtd_free.pop_back() {
                let entry = self.qtds.remove(victim);
                unsafe { self.alloc.free(entry.hw) };
            }
        }
    }

    /// Pops a QH off the free list, or allocates a fresh one on miss.
    /// Resets the hardware overlay and driver-private linkage on reuse;
    /// callers still drive [`crate::qh::QhHw::configure`] themselves.
    pub fn alloc_qh(&mut self) -> Result<QhHandle, Error> {
        if let Some(h) = self.qh_free.pop_front() {
            self.qhs.get_mut(h).reset_hw();
            let entry = self.qhs.get_mut(h);
            entry.prev = None;
            entry.next = None;
            entry.last_qtd = None;
            entry.period = 0;
            entry.phase = 0;
            entry.uframe = 0;
            entry.pending = None;
            // A reused QH may have served a control pipe previously; its
            // scratch SETUP block isn't this pipe's to keep, and leaving it
            // in place would leak the old block when a fresh one is
            // allocated below for a new control pipe.
            if let Some(setup) = entry.setup.take() {
                unsafe { self.alloc.free(setup) };
            }
            return Ok(h);
        }
        let block = self.alloc.alloc(core::mem::size_of::<QhHw>(), 32).ok_or(Error::OutOfMemory)?;
        let paddr = block.phys;
        let h = self.qhs.insert(QhEntry {
            hw: block,
            paddr,
            prev: None,
            next: None,
            last_qtd: None,
            period: 0,
            phase: 0,
            uframe: 0,
            pending: None,
            setup: None,
        });
        Ok(h)
    }

    pub fn release_qh(&mut self, h: QhHandle) {
        self.qh_free.push_front(h);
        if self.qh_free.len() > self.qh_cap {
            if let Some(victim) = self.qh_free.pop_back() {
                let entry = self.qhs.remove(victim);
                if let Some(setup) = entry.setup {
                    unsafe { self.alloc.free(setup) };
                }
                unsafe { self.alloc.free(entry.hw) };
            }
        }
    }

    /// Allocates a small scratch DMA block outside the QH/qTD slabs, used to
    /// back a control pipe's SETUP packet bytes.
    pub fn alloc_scratch(&self, len: usize, align: usize) -> Result<DmaBlock, Error> {
        self.alloc.alloc(len, align).ok_or(Error::OutOfMemory)
    }

    pub fn qtd_entry(&self, h: QtdHandle) -> &QtdEntry {
        self.qtds.get(h)
    }
    pub fn qtd_entry_mut(&mut self, h: QtdHandle) -> &mut QtdEntry {
        self.qtds.get_mut(h)
    }
    pub fn qtd_hw(&self, h: QtdHandle) -> &QtdHw {
        unsafe { self.qtds.get(h).hw() }
    }
    pub fn qtd_hw_mut(&mut self, h: QtdHandle) -> &mut QtdHw {
        unsafe { self.qtds.get_mut(h).hw_mut() }
    }
    pub fn qtd_paddr(&self, h: QtdHandle) -> PhysAddr {
        self.qtds.get(h).paddr
    }

    pub fn qh_entry(&self, h: QhHandle) -> &QhEntry {
        self.qhs.get(h)
    }
    pub fn qh_entry_mut(&mut self, h: QhHandle) -> &mut QhEntry {
        self.qhs.get_mut(h)
    }
    pub fn qh_hw(&self, h: QhHandle) -> &QhHw {
        unsafe { self.qhs.get(h).hw() }
    }
    pub fn qh_hw_mut(&mut self, h: QhHandle) -> &mut QhHw {
        unsafe { self.qhs.get_mut(h).hw_mut() }
    }
    pub fn qh_paddr(&self, h: QhHandle) -> PhysAddr {
        self.qhs.get(h).paddr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::fake::FakeDma;

    #[test]
    fn alloc_free_pair_leaves_counts_unchanged() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let before = pools.qtd_count();
        let h = pools.alloc_qtd().unwrap();
        pools.release_qtd(h);
        assert_eq!(pools.qtd_count(), before + 1); // pooled, not destroyed
        let h2 = pools.alloc_qtd().unwrap();
        assert_eq!(h2, h); // LIFO reuse
    }

    #[test]
    fn pool_cap_evicts_oldest() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 2, 2);
        let a = pools.alloc_qtd().unwrap();
        let b = pools.alloc_qtd().unwrap();
        let c = pools.alloc_qtd().unwrap();
        pools.release_qtd(a);
        pools.release_qtd(b);
        pools.release_qtd(c); // cap=2: oldest (a) must be destroyed now
        assert_eq!(pools.qtd_count(), 2);
    }
}
