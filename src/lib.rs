//! Storage and virtual-memory engine for an educational Unix-like
//! kernel: a write-back buffer cache over a raw block device, an
//! extensible-inode file system with multilevel indexing and
//! hierarchical directories, and a demand-paging subsystem with
//! per-process page bookkeeping, clock eviction and a swap partition.
//!
//! The thread scheduler, system-call trampoline and real hardware sit
//! outside the crate; block devices come in through a trait and the
//! MMU is modeled by a per-process page table with accessed and dirty
//! bits, so the whole engine runs (and is tested) on the host.

#![cfg_attr(not(test), no_std)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::result_unit_err)]

extern crate alloc;

pub mod bio;
pub mod device;
pub mod file;
pub mod fs;
pub mod kernel;
pub mod param;
pub mod proc;
pub mod util;
pub mod vm;

pub use device::{BlockDevice, MemDisk};
pub use file::File;
pub use kernel::Kernel;
pub use proc::Process;
