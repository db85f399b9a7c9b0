//! Buffer cache.
//!
//! A fixed array of sector-sized slots holding cached copies of disk
//! sector contents. Caching sectors in memory reduces the number of
//! device reads and also provides a synchronization point for sectors
//! used by multiple processes.
//!
//! Interface:
//! * `read` and `write` copy a byte range between a caller buffer and
//!   the cached sector, faulting the sector in on a miss.
//! * Dirty slots are written back when the clock sweep evicts them, on
//!   `flush_all`, and on `shutdown`. The device is never written on the
//!   write path itself.
//!
//! The cache-wide lock covers slot identity (which sector lives where)
//! and the clock hand; each slot has its own lock over its data and
//! flags. The cache-wide lock is always taken first and released once
//! the slot lock is held.

use alloc::sync::Arc;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use spin::{Mutex, MutexGuard};

use crate::device::{BlockDevice, SectorId};
use crate::param::{NBUF, SECTOR_SIZE};

/// One cached sector. The alignment lets callers view the data as a
/// table of `u32` sector indices.
#[repr(align(4))]
pub struct Block {
    inner: [u8; SECTOR_SIZE],
}

impl Block {
    pub const fn zeroed() -> Self {
        Self {
            inner: [0; SECTOR_SIZE],
        }
    }
}

impl Deref for Block {
    type Target = [u8; SECTOR_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

struct BufInner {
    /// Sector whose bytes `data` holds. Meaningful only while `valid`.
    sector: SectorId,
    /// Has data been read from (or fully written over) the device copy?
    valid: bool,
    /// Does the cached copy differ from the device?
    dirty: bool,
    data: Block,
}

struct BufSlot {
    /// Second-chance bit for the clock sweep. Set on every access, put
    /// back to false as the hand passes over.
    referenced: AtomicBool,
    inner: Mutex<BufInner>,
}

impl BufSlot {
    const fn new() -> Self {
        Self {
            referenced: AtomicBool::new(false),
            inner: Mutex::new(BufInner {
                sector: 0,
                valid: false,
                dirty: false,
                data: Block::zeroed(),
            }),
        }
    }
}

struct CacheCtl {
    /// Sector each slot is assigned to. `None` means the slot has never
    /// been claimed. At most one slot is assigned to a given sector.
    owner: [Option<SectorId>; NBUF],
    /// Clock hand for victim selection.
    hand: usize,
}

pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    ctl: Mutex<CacheCtl>,
    slots: [BufSlot; NBUF],
}

impl BufferCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            ctl: Mutex::new(CacheCtl {
                owner: [None; NBUF],
                hand: 0,
            }),
            slots: array![_ => BufSlot::new(); NBUF],
        }
    }

    /// Copies `dst.len()` bytes out of `sector`, starting `sector_ofs`
    /// bytes in. An empty `dst` never touches the cache.
    pub fn read(&self, sector: SectorId, dst: &mut [u8], sector_ofs: usize) {
        assert!(sector_ofs + dst.len() <= SECTOR_SIZE, "bc_read: range");
        if dst.is_empty() {
            return;
        }
        let buf = self.slot_for(sector, true);
        dst.copy_from_slice(&buf.data[sector_ofs..sector_ofs + dst.len()]);
    }

    /// Copies `src` into `sector` at `sector_ofs` and marks the slot
    /// dirty. A write that does not cover the whole sector reads the
    /// sector from the device first so the bytes around the range
    /// survive; a whole-sector write skips that read.
    pub fn write(&self, sector: SectorId, src: &[u8], sector_ofs: usize) {
        assert!(sector_ofs + src.len() <= SECTOR_SIZE, "bc_write: range");
        if src.is_empty() {
            return;
        }
        let whole = sector_ofs == 0 && src.len() == SECTOR_SIZE;
        let mut buf = self.slot_for(sector, !whole);
        buf.data[sector_ofs..sector_ofs + src.len()].copy_from_slice(src);
        buf.valid = true;
        buf.dirty = true;
    }

    /// Writes every dirty slot back to the device.
    pub fn flush_all(&self) {
        for slot in self.slots.iter() {
            let mut buf = slot.inner.lock();
            if buf.valid && buf.dirty {
                self.dev.write(buf.sector, &buf.data);
                buf.dirty = false;
            }
        }
    }

    /// Flushes and drops every cached sector.
    pub fn shutdown(&self) {
        self.flush_all();
        let mut ctl = self.ctl.lock();
        for (i, owner) in ctl.owner.iter_mut().enumerate() {
            *owner = None;
            self.slots[i].inner.lock().valid = false;
        }
        ctl.hand = 0;
    }

    /// Returns the locked slot holding `sector`, claiming one on a
    /// miss. With `fetch` the missed sector is read from the device;
    /// without it the caller promises to overwrite the whole sector.
    fn slot_for(&self, sector: SectorId, fetch: bool) -> MutexGuard<'_, BufInner> {
        let mut ctl = self.ctl.lock();

        if let Some(i) = ctl.owner.iter().position(|o| *o == Some(sector)) {
            let buf = self.slots[i].inner.lock();
            drop(ctl);
            self.slots[i].referenced.store(true, Ordering::Relaxed);
            debug_assert!(buf.valid && buf.sector == sector);
            return buf;
        }

        // Miss: prefer a never-claimed slot, otherwise run the clock.
        let i = match ctl.owner.iter().position(|o| o.is_none()) {
            Some(i) => i,
            None => loop {
                let h = ctl.hand;
                ctl.hand = (ctl.hand + 1) % NBUF;
                if !self.slots[h].referenced.swap(false, Ordering::Relaxed) {
                    break h;
                }
            },
        };
        ctl.owner[i] = Some(sector);
        self.slots[i].referenced.store(true, Ordering::Relaxed);
        let mut buf = self.slots[i].inner.lock();

        // The old tenant leaves through the device if it was dirty.
        // This happens before the cache-wide lock drops: a concurrent
        // probe for the old sector misses here and must find the
        // written-back bytes on the device, not a stale copy.
        if buf.valid && buf.dirty {
            self.dev.write(buf.sector, &buf.data);
        }
        drop(ctl);
        buf.sector = sector;
        buf.dirty = false;
        if fetch {
            self.dev.read(sector, &mut buf.data);
            buf.valid = true;
        } else {
            buf.valid = false;
        }
        buf
    }

    #[cfg(test)]
    fn cached_sectors(&self) -> alloc::vec::Vec<SectorId> {
        self.ctl.lock().owner.iter().filter_map(|o| *o).collect()
    }

    #[cfg(test)]
    fn is_dirty(&self, sector: SectorId) -> bool {
        let ctl = self.ctl.lock();
        ctl.owner
            .iter()
            .position(|o| *o == Some(sector))
            .map_or(false, |i| self.slots[i].inner.lock().dirty)
    }
}
