//! Open file handles.
//!
//! A `File` pairs an open inode with a cursor. Handles are what the
//! file descriptor table and the memory-mapping layer hold on to; each
//! one owns a reference on its inode and gives it back on `close`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::device::SectorId;
use crate::fs::dir;
use crate::fs::inode::Inode;
use crate::kernel::Kernel;
use crate::param::DIRSIZ;

pub struct File {
    ip: Arc<Inode>,
    pos: Mutex<usize>,
    /// This handle currently denies writes to the inode.
    denies: AtomicBool,
    closed: AtomicBool,
}

impl File {
    pub fn new(ip: Arc<Inode>) -> Arc<File> {
        Arc::new(File {
            ip,
            pos: Mutex::new(0),
            denies: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// A second, independent handle on the same inode with its own
    /// cursor.
    pub fn reopen(&self) -> Arc<File> {
        File::new(Inode::reopen(&self.ip))
    }

    /// Releases the handle's inode reference. Safe to call once per
    /// handle; later calls do nothing.
    pub fn close(&self, ctx: &Kernel) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.denies.load(Ordering::Acquire) {
            self.ip.allow_write();
        }
        self.ip.close(ctx);
    }

    pub fn read(&self, ctx: &Kernel, dst: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.ip.read_at(ctx, dst, *pos);
        *pos += n;
        n
    }

    /// Writes at the cursor. Directory contents are off limits through
    /// a handle; only the directory layer writes them.
    pub fn write(&self, ctx: &Kernel, src: &[u8]) -> Result<usize, ()> {
        if self.ip.is_dir(ctx) {
            return Err(());
        }
        let mut pos = self.pos.lock();
        let n = self.ip.write_at(ctx, src, *pos)?;
        *pos += n;
        Ok(n)
    }

    pub fn read_at(&self, ctx: &Kernel, dst: &mut [u8], offset: usize) -> usize {
        self.ip.read_at(ctx, dst, offset)
    }

    pub fn write_at(&self, ctx: &Kernel, src: &[u8], offset: usize) -> Result<usize, ()> {
        if self.ip.is_dir(ctx) {
            return Err(());
        }
        self.ip.write_at(ctx, src, offset)
    }

    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }

    pub fn size(&self, ctx: &Kernel) -> usize {
        self.ip.length(ctx)
    }

    pub fn is_dir(&self, ctx: &Kernel) -> bool {
        self.ip.is_dir(ctx)
    }

    pub fn inumber(&self) -> SectorId {
        self.ip.inumber()
    }

    /// Keeps every handle from writing the inode until `allow_write`
    /// or `close`. Used while an executable is mapped.
    pub fn deny_write(&self) {
        if !self.denies.swap(true, Ordering::AcqRel) {
            self.ip.deny_write();
        }
    }

    pub fn allow_write(&self) {
        if self.denies.swap(false, Ordering::AcqRel) {
            self.ip.allow_write();
        }
    }

    /// Next directory entry name, skipping `.` and `..`. The handle's
    /// cursor counts entries rather than bytes here.
    pub fn readdir(&self, ctx: &Kernel) -> Option<ArrayVec<u8, DIRSIZ>> {
        if !self.ip.is_dir(ctx) {
            return None;
        }
        let mut pos = self.pos.lock();
        let name = dir::read_entry(ctx, &self.ip, *pos)?;
        *pos += 1;
        Some(name)
    }
}
