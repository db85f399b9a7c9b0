//! Per-process page bookkeeping.
//!
//! Every user page a process may touch has an entry here describing
//! where its bytes come from when it is not resident: a region of an
//! executable image, a region of a memory-mapped file, or swap (with
//! "never touched yet" folded in as an empty slot, meaning zero-fill).
//! A resident entry additionally names the frame backing it, as an
//! index into the global frame arena so the two structures need not
//! own each other.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use hashbrown::HashMap;
use spin::Mutex;

use crate::file::File;
use crate::param::PGSIZE;
use crate::vm::frame::FrameId;
use crate::vm::pagetable::PageTable;

/// Page-sized, page-aligned chunk of memory.
#[repr(align(4096))]
pub struct Page {
    inner: [u8; PGSIZE],
}

impl Page {
    pub const DEFAULT: Self = Self { inner: [0; PGSIZE] };
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Where a non-resident page's bytes live.
#[derive(Clone)]
pub enum Backing {
    /// Loaded from an executable image: `read_bytes` from the file at
    /// `offset`, then `zero_bytes` of zeroes. Discardable while clean.
    Binary {
        file: Arc<File>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
    /// A memory-mapped file region. Dirty pages go back to the file,
    /// never to swap.
    Mapped {
        file: Arc<File>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
    /// Stack or other private memory. `None` means the page has never
    /// left memory: fault in as zeroes.
    Anon { slot: Option<u32> },
}

pub struct VmEntry {
    pub writable: bool,
    /// Present while the page is resident.
    pub frame: Option<FrameId>,
    pub backing: Backing,
}

pub struct MmapRecord {
    pub id: u32,
    pub file: Arc<File>,
    pub pages: Vec<usize>,
}

pub struct MmapTable {
    pub(crate) next_id: u32,
    pub(crate) maps: Vec<MmapRecord>,
}

impl MmapTable {
    /// Map identifier 0 stands for "every mapping", so handing it out
    /// is never valid.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            maps: Vec::new(),
        }
    }
}

/// A process's virtual memory: the page entries, the page table the
/// (simulated) hardware walks, and the live file mappings.
pub struct AddrSpace {
    pub entries: Mutex<HashMap<usize, VmEntry>>,
    pub pagetable: Mutex<PageTable>,
    pub mmaps: Mutex<MmapTable>,
}

impl AddrSpace {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pagetable: Mutex::new(PageTable::new()),
            mmaps: Mutex::new(MmapTable::new()),
        }
    }
}
