//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! structure fills exactly one sector: length and flags up front, then
//! 123 direct sector slots, one single-indirect slot and one
//! double-indirect slot. Index blocks are sectors holding 128 sector
//! indices each; a zero index always means "unallocated", which works
//! because sector 0 belongs to the volume and never holds file data.
//!
//! Files grow on write. A write whose end lies past the current length
//! takes the per-inode extension lock, bumps the length, backs every
//! sector the write spans (allocating index blocks on demand, all
//! zero-filled through the buffer cache), persists the inode and only
//! then releases the lock and copies data. Concurrent non-extending
//! reads and writes need no inode lock at all; the buffer cache's slot
//! locks order the byte copies.
//!
//! The kernel keeps a table of open inodes so that opening the same
//! sector twice yields the same in-memory object. An inode marked
//! removed is deallocated (data sectors, index blocks, then its own
//! sector) when its last opener closes it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;
use core::ptr;

use arrayvec::ArrayVec;
use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::bio::Block;
use crate::device::SectorId;
use crate::kernel::Kernel;
use crate::param::{INODE_MAGIC, MAXFILE, NDIRECT, NINDIRECT, SECTOR_SIZE};
use crate::util::div_round_up;

/// On-disk inode. Must be exactly one sector long.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    /// File size in bytes.
    pub length: i32,
    /// Must be `INODE_MAGIC`.
    pub magic: u32,
    /// 0 = regular file, 1 = directory.
    pub is_dir: u32,
    /// Directly addressed data sectors.
    pub direct: [SectorId; NDIRECT],
    /// Single-indirect index block, 0 if none.
    pub indirect: SectorId,
    /// Double-indirect index block, 0 if none.
    pub double_indirect: SectorId,
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);
const_assert_eq!(core::mem::align_of::<DiskInode>(), 4);

impl DiskInode {
    fn empty(is_dir: bool) -> Self {
        Self {
            length: 0,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            direct: [0; NDIRECT],
            indirect: 0,
            double_indirect: 0,
        }
    }

    /// Reads the inode stored at `sector` through the buffer cache.
    pub(crate) fn read_from(ctx: &Kernel, sector: SectorId) -> Self {
        let mut block = Block::zeroed();
        ctx.bcache.read(sector, &mut block[..], 0);
        // The buffer is 4-byte aligned, matching DiskInode.
        let di = unsafe { ptr::read(block.as_ptr() as *const DiskInode) };
        assert_eq!(di.magic, INODE_MAGIC, "inode {}: bad magic", sector);
        di
    }

    fn write_to(&self, ctx: &Kernel, sector: SectorId) {
        let mut block = Block::zeroed();
        unsafe { ptr::write(block.as_mut_ptr() as *mut DiskInode, *self) };
        ctx.bcache.write(sector, &block[..], 0);
    }
}

/// Where a byte position lands in the index tree.
enum Slot {
    Direct(usize),
    Indirect(usize),
    DoubleIndirect(usize, usize),
    OutOfRange,
}

fn locate(pos: usize) -> Slot {
    let sn = pos / SECTOR_SIZE;
    if sn < NDIRECT {
        Slot::Direct(sn)
    } else if sn < NDIRECT + NINDIRECT {
        Slot::Indirect(sn - NDIRECT)
    } else if sn < MAXFILE {
        let sn = sn - NDIRECT - NINDIRECT;
        Slot::DoubleIndirect(sn / NINDIRECT, sn % NINDIRECT)
    } else {
        Slot::OutOfRange
    }
}

/// One entry of an index block, as a little-endian u32 in the cache.
fn index_entry(ctx: &Kernel, table: SectorId, idx: usize) -> SectorId {
    debug_assert!(idx < NINDIRECT);
    let mut word = [0u8; 4];
    ctx.bcache.read(table, &mut word, idx * 4);
    SectorId::from_le_bytes(word)
}

fn set_index_entry(ctx: &Kernel, table: SectorId, idx: usize, value: SectorId) {
    debug_assert!(idx < NINDIRECT);
    ctx.bcache.write(table, &value.to_le_bytes(), idx * 4);
}

/// Returns the sector backing byte `pos`, or `None` when `pos` is past
/// the end of the file or falls into an unwritten hole.
fn byte_to_sector(ctx: &Kernel, di: &DiskInode, pos: usize) -> Option<SectorId> {
    if pos >= di.length as usize {
        return None;
    }
    let sector = match locate(pos) {
        Slot::Direct(i) => di.direct[i],
        Slot::Indirect(i) => {
            if di.indirect == 0 {
                return None;
            }
            index_entry(ctx, di.indirect, i)
        }
        Slot::DoubleIndirect(i, j) => {
            if di.double_indirect == 0 {
                return None;
            }
            let second = index_entry(ctx, di.double_indirect, i);
            if second == 0 {
                return None;
            }
            index_entry(ctx, second, j)
        }
        Slot::OutOfRange => return None,
    };
    if sector == 0 {
        None
    } else {
        Some(sector)
    }
}

/// Backs every sector the byte span `[start, end)` touches, allocating
/// data sectors and index blocks as needed. Already-backed sectors are
/// left alone. On failure the sectors claimed by the failing step are
/// returned to the free map; steps completed earlier stay installed.
fn extend(ctx: &Kernel, di: &mut DiskInode, start: usize, end: usize) -> Result<(), ()> {
    for sn in start / SECTOR_SIZE..div_round_up(end, SECTOR_SIZE) {
        install_sector(ctx, di, sn)?;
    }
    Ok(())
}

/// Backs file sector `sn` of the inode, creating missing index blocks
/// on the way. New blocks are zero-filled through the cache so a zero
/// entry keeps meaning "unallocated".
fn install_sector(ctx: &Kernel, di: &mut DiskInode, sn: usize) -> Result<(), ()> {
    const ZEROES: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

    // Everything claimed by this step, handed back if a later
    // allocation in the same step fails.
    let mut claimed = scopeguard::guard(ArrayVec::<SectorId, 3>::new(), |sectors| {
        if !sectors.is_empty() {
            let mut map = ctx.fs.freemap.lock();
            for s in sectors {
                map.release(s);
            }
        }
    });

    let fresh = |claimed: &mut ArrayVec<SectorId, 3>| -> Result<SectorId, ()> {
        let s = ctx.fs.freemap.lock().alloc().ok_or(())?;
        claimed.push(s);
        ctx.bcache.write(s, &ZEROES, 0);
        Ok(s)
    };

    match locate(sn * SECTOR_SIZE) {
        Slot::Direct(i) => {
            if di.direct[i] == 0 {
                di.direct[i] = fresh(&mut claimed)?;
            }
        }
        Slot::Indirect(i) => {
            let (table, new_table) = match di.indirect {
                0 => (fresh(&mut claimed)?, true),
                t => (t, false),
            };
            if new_table || index_entry(ctx, table, i) == 0 {
                let data = fresh(&mut claimed)?;
                set_index_entry(ctx, table, i, data);
            }
            di.indirect = table;
        }
        Slot::DoubleIndirect(i, j) => {
            let (first, new_first) = match di.double_indirect {
                0 => (fresh(&mut claimed)?, true),
                t => (t, false),
            };
            let existing = if new_first {
                0
            } else {
                index_entry(ctx, first, i)
            };
            let (second, new_second) = match existing {
                0 => (fresh(&mut claimed)?, true),
                t => (t, false),
            };
            if new_second || index_entry(ctx, second, j) == 0 {
                let data = fresh(&mut claimed)?;
                set_index_entry(ctx, second, j, data);
            }
            // Register the index blocks only once the whole step is
            // safe, so a rollback never leaves them reachable.
            if new_second {
                set_index_entry(ctx, first, i, second);
            }
            if new_first {
                di.double_indirect = first;
            }
        }
        Slot::OutOfRange => return Err(()),
    }

    let _ = scopeguard::ScopeGuard::into_inner(claimed);
    Ok(())
}

/// Releases every data sector and index block of the inode. Each table
/// is scanned up to its first zero entry: extension fills tables
/// densely from the front, so a zero marks the end of the used slots.
/// A sparse layout with holes would leak sectors here.
fn release_blocks(ctx: &Kernel, di: &DiskInode) {
    let free = |s: SectorId| ctx.fs.freemap.lock().release(s);

    if di.double_indirect != 0 {
        for i in 0..NINDIRECT {
            let second = index_entry(ctx, di.double_indirect, i);
            if second == 0 {
                break;
            }
            for j in 0..NINDIRECT {
                let s = index_entry(ctx, second, j);
                if s == 0 {
                    break;
                }
                free(s);
            }
            free(second);
        }
        free(di.double_indirect);
    }
    if di.indirect != 0 {
        for i in 0..NINDIRECT {
            let s = index_entry(ctx, di.indirect, i);
            if s == 0 {
                break;
            }
            free(s);
        }
        free(di.indirect);
    }
    for &s in di.direct.iter() {
        if s == 0 {
            break;
        }
        free(s);
    }
}

struct InodeMeta {
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

/// In-memory handle on an on-disk inode.
pub struct Inode {
    sector: SectorId,
    meta: Mutex<InodeMeta>,
    /// Serializes file extension. Plain reads and non-extending writes
    /// do not take it.
    extend: Mutex<()>,
}

/// Table of open inodes, so that opening a sector twice returns the
/// same `Inode`.
pub struct Itable {
    open: Mutex<Vec<Arc<Inode>>>,
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            open: Mutex::new(Vec::new()),
        }
    }

    /// Opens the inode stored at `sector`, sharing an existing handle
    /// when one is live.
    pub fn open(&self, ctx: &Kernel, sector: SectorId) -> Arc<Inode> {
        let mut open = self.open.lock();
        if let Some(ip) = open.iter().find(|ip| ip.sector == sector) {
            ip.meta.lock().open_cnt += 1;
            return ip.clone();
        }
        // Validates the magic; a non-inode sector here is a kernel bug.
        let _ = DiskInode::read_from(ctx, sector);
        let ip = Arc::new(Inode {
            sector,
            meta: Mutex::new(InodeMeta {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
            extend: Mutex::new(()),
        });
        open.push(ip.clone());
        ip
    }
}

impl Inode {
    /// Writes a fresh inode of `length` zero bytes to `sector`. The
    /// caller owns the sector; on failure the caller releases it.
    pub fn create(ctx: &Kernel, sector: SectorId, length: usize, is_dir: bool) -> Result<(), ()> {
        let mut di = DiskInode::empty(is_dir);
        if length > 0 {
            if extend(ctx, &mut di, 0, length).is_err() {
                // Hand back whatever the partial extension installed.
                release_blocks(ctx, &di);
                log::warn!("inode {}: create of {} bytes failed", sector, length);
                return Err(());
            }
            di.length = length as i32;
        }
        di.write_to(ctx, sector);
        Ok(())
    }

    /// Takes another reference on an already-open inode.
    pub fn reopen(this: &Arc<Inode>) -> Arc<Inode> {
        this.meta.lock().open_cnt += 1;
        this.clone()
    }

    /// Drops one reference. The last close of a removed inode frees its
    /// sectors.
    pub fn close(&self, ctx: &Kernel) {
        let mut open = ctx.fs.itable.open.lock();
        let (last, removed) = {
            let mut m = self.meta.lock();
            assert!(m.open_cnt > 0, "inode {}: close without open", self.sector);
            m.open_cnt -= 1;
            (m.open_cnt == 0, m.removed)
        };
        if !last {
            return;
        }
        open.retain(|ip| ip.sector != self.sector);
        drop(open);
        if removed {
            let di = DiskInode::read_from(ctx, self.sector);
            release_blocks(ctx, &di);
            ctx.fs.freemap.lock().release(self.sector);
        }
    }

    /// Marks the inode for deallocation at last close.
    pub fn remove(&self) {
        self.meta.lock().removed = true;
    }

    pub fn deny_write(&self) {
        let mut m = self.meta.lock();
        m.deny_write_cnt += 1;
        assert!(m.deny_write_cnt <= m.open_cnt);
    }

    pub fn allow_write(&self) {
        let mut m = self.meta.lock();
        assert!(m.deny_write_cnt > 0);
        m.deny_write_cnt -= 1;
    }

    pub fn inumber(&self) -> SectorId {
        self.sector
    }

    pub fn length(&self, ctx: &Kernel) -> usize {
        DiskInode::read_from(ctx, self.sector).length as usize
    }

    pub fn is_dir(&self, ctx: &Kernel) -> bool {
        DiskInode::read_from(ctx, self.sector).is_dir != 0
    }

    /// Copies up to `dst.len()` bytes starting at `offset` into `dst`.
    /// Returns the number of bytes read; reading at or past the end of
    /// the file reads nothing. Holes read as zeroes.
    pub fn read_at(&self, ctx: &Kernel, dst: &mut [u8], offset: usize) -> usize {
        let di = DiskInode::read_from(ctx, self.sector);
        let length = di.length as usize;
        if offset >= length || dst.is_empty() {
            return 0;
        }
        let n = cmp::min(dst.len(), length - offset);
        let mut done = 0;
        while done < n {
            let pos = offset + done;
            let chunk = cmp::min(n - done, SECTOR_SIZE - pos % SECTOR_SIZE);
            match byte_to_sector(ctx, &di, pos) {
                Some(sector) => {
                    ctx.bcache
                        .read(sector, &mut dst[done..done + chunk], pos % SECTOR_SIZE)
                }
                None => dst[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        n
    }

    /// Copies `src` into the file at `offset`, extending the file when
    /// the write ends past the current length. Returns the number of
    /// bytes written: all of `src`, or 0 while writes are denied.
    /// Fails when the span cannot be backed; sectors installed by the
    /// completed part of the extension stay allocated, the length does
    /// not move.
    pub fn write_at(&self, ctx: &Kernel, src: &[u8], offset: usize) -> Result<usize, ()> {
        if self.meta.lock().deny_write_cnt > 0 {
            return Ok(0);
        }
        if src.is_empty() {
            return Ok(0);
        }
        let end = offset.checked_add(src.len()).ok_or(())?;
        if end > MAXFILE * SECTOR_SIZE {
            return Err(());
        }

        let guard = self.extend.lock();
        let mut di = DiskInode::read_from(ctx, self.sector);
        let old_length = di.length;
        if end > di.length as usize {
            di.length = end as i32;
        }
        if extend(ctx, &mut di, offset, end).is_err() {
            di.length = old_length;
            di.write_to(ctx, self.sector);
            log::warn!("inode {}: extension to {} bytes failed", self.sector, end);
            drop(guard);
            return Err(());
        }
        di.write_to(ctx, self.sector);
        drop(guard);

        let mut done = 0;
        while done < src.len() {
            let pos = offset + done;
            let chunk = cmp::min(src.len() - done, SECTOR_SIZE - pos % SECTOR_SIZE);
            let sector =
                byte_to_sector(ctx, &di, pos).expect("inode: unbacked sector inside written span");
            ctx.bcache
                .write(sector, &src[done..done + chunk], pos % SECTOR_SIZE);
            done += chunk;
        }
        Ok(src.len())
    }
}
