//! The kernel context.
//!
//! All process-wide state (buffer cache, file system, frame pool,
//! swap table) lives in one `Kernel` value built at boot and threaded
//! explicitly through every operation. The methods here are the
//! surface the system-call dispatcher (above this crate) calls into.

use alloc::sync::Arc;

use crate::bio::BufferCache;
use crate::device::BlockDevice;
use crate::file::File;
use crate::fs::path::Path;
use crate::fs::FileSys;
use crate::param::NFRAME;
use crate::proc::Process;
use crate::vm;
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapTable;

pub struct Kernel {
    pub(crate) bcache: BufferCache,
    pub fs: FileSys,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapTable,
}

impl Kernel {
    pub fn new(fs_dev: Arc<dyn BlockDevice>, swap_dev: Arc<dyn BlockDevice>) -> Self {
        Self::with_frames(fs_dev, swap_dev, NFRAME)
    }

    /// Boots with a frame pool of `frames` pages instead of the
    /// default.
    pub fn with_frames(
        fs_dev: Arc<dyn BlockDevice>,
        swap_dev: Arc<dyn BlockDevice>,
        frames: usize,
    ) -> Self {
        let sector_count = fs_dev.sector_count();
        Self {
            bcache: BufferCache::new(fs_dev),
            fs: FileSys::new(sector_count),
            frames: FrameTable::new(frames),
            swap: SwapTable::new(swap_dev),
        }
    }

    /// Builds an empty file system on the device.
    pub fn format(&self) {
        self.fs.format(self);
    }

    /// Brings up a previously formatted device.
    pub fn mount(&self) {
        self.fs.mount(self);
    }

    /// Persists the free map and every dirty cached sector.
    pub fn shutdown(&self) {
        self.fs.sync_free_map(self);
        self.bcache.shutdown();
    }

    // File system calls.

    pub fn create(&self, proc: &Process, path: &[u8], size: usize) -> Result<(), ()> {
        self.fs
            .create(self, &proc.cwd(), Path::new(path), size, false)
    }

    pub fn mkdir(&self, proc: &Process, path: &[u8]) -> Result<(), ()> {
        self.fs.create(self, &proc.cwd(), Path::new(path), 0, true)
    }

    pub fn remove(&self, proc: &Process, path: &[u8]) -> Result<(), ()> {
        self.fs.remove(self, &proc.cwd(), Path::new(path))
    }

    pub fn open(&self, proc: &Process, path: &[u8]) -> Result<Arc<File>, ()> {
        let ip = self.fs.open_inode(self, &proc.cwd(), Path::new(path))?;
        Ok(File::new(ip))
    }

    pub fn chdir(&self, proc: &Process, path: &[u8]) -> Result<(), ()> {
        let ip = self.fs.open_inode(self, &proc.cwd(), Path::new(path))?;
        if !ip.is_dir(self) {
            ip.close(self);
            return Err(());
        }
        proc.set_cwd(self, ip);
        Ok(())
    }

    // Memory calls.

    pub fn mmap(&self, proc: &Process, file: &Arc<File>, addr: usize) -> Result<u32, ()> {
        vm::mmap(self, proc, file, addr)
    }

    pub fn munmap(&self, proc: &Process, id: u32) -> Result<(), ()> {
        vm::munmap(self, proc, id)
    }

    pub fn page_fault(&self, proc: &Process, addr: usize, esp: usize) -> Result<(), ()> {
        vm::page_fault(self, proc, addr, esp)
    }

    // Introspection, mostly for diagnostics.

    pub fn frames_in_use(&self) -> usize {
        self.frames.frames_in_use()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.slots_in_use()
    }
}
