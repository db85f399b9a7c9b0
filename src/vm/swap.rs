//! Swap partition.
//!
//! The swap device is carved into page-sized slots of eight sectors
//! each. A bitmap tracks which slots hold a page; it lives only in
//! memory, the device itself carries no structure. One lock covers the
//! bitmap and the device, so slot reuse cannot interleave with the
//! transfer that empties it.

use alloc::sync::Arc;
use core::convert::TryInto;

use bitmaps::Bitmap;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::param::{NSWAP, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::vm::page::Page;

pub struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    /// Set bit = slot holds a swapped-out page.
    slots: Mutex<Bitmap<NSWAP>>,
    slot_count: usize,
}

impl SwapTable {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slot_count = core::cmp::min(dev.sector_count() as usize / SECTORS_PER_PAGE, NSWAP);
        Self {
            dev,
            slots: Mutex::new(Bitmap::new()),
            slot_count,
        }
    }

    /// Writes `page` into the first free slot and returns its index.
    /// Fails when the partition is full.
    pub fn swap_out(&self, page: &Page) -> Result<u32, ()> {
        let mut slots = self.slots.lock();
        let slot = match slots.first_false_index() {
            Some(i) if i < self.slot_count => i,
            _ => {
                log::warn!("swap: out of slots");
                return Err(());
            }
        };
        let _ = slots.set(slot, true);

        let base = (slot * SECTORS_PER_PAGE) as u32;
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            let sector: &[u8; SECTOR_SIZE] = chunk.try_into().expect("swap: page chunk");
            self.dev.write(base + i as u32, sector);
        }
        log::trace!("swap: page out to slot {}", slot);
        Ok(slot as u32)
    }

    /// Reads `slot` back into `page` and frees the slot.
    pub fn swap_in(&self, slot: u32, page: &mut Page) {
        let mut slots = self.slots.lock();
        assert!(slots.get(slot as usize), "swap: reading a free slot");

        let base = slot * SECTORS_PER_PAGE as u32;
        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let sector: &mut [u8; SECTOR_SIZE] = chunk.try_into().expect("swap: page chunk");
            self.dev.read(base + i as u32, sector);
        }
        let _ = slots.set(slot as usize, false);
        log::trace!("swap: page in from slot {}", slot);
    }

    /// Frees `slot` without reading it. Used when a process exits with
    /// pages still swapped out.
    pub fn release(&self, slot: u32) {
        let mut slots = self.slots.lock();
        assert!(slots.get(slot as usize), "swap: double release");
        let _ = slots.set(slot as usize, false);
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().len()
    }
}
