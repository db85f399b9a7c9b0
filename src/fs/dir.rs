//! Directories.
//!
//! A directory is an inode whose contents are a packed table of
//! fixed-size entries mapping a name of up to 14 bytes to the sector
//! of the named inode. Every directory carries `.` and `..` entries;
//! the root's `..` is the root itself.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use crate::kernel::Kernel;
use crate::device::SectorId;
use crate::fs::inode::Inode;
use crate::param::DIRSIZ;

/// One directory entry. The layout is written to disk as-is.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dirent {
    sector: u32,
    name: [u8; DIRSIZ],
    in_use: u8,
    _rsvd: u8,
}

pub const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

impl Dirent {
    fn matches(&self, name: &[u8]) -> bool {
        if self.in_use == 0 {
            return false;
        }
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(DIRSIZ);
        &self.name[..len] == name
    }

    fn name_len(&self) -> usize {
        self.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ)
    }
}

fn entry_at(ctx: &Kernel, dir: &Arc<Inode>, off: usize) -> Dirent {
    let mut de = Dirent::default();
    let n = dir.read_at(ctx, de.as_bytes_mut(), off);
    debug_assert_eq!(n, DIRENT_SIZE, "directory truncated mid-entry");
    de
}

/// Looks `name` up in `dir`, returning the sector of its inode.
pub fn lookup(ctx: &Kernel, dir: &Arc<Inode>, name: &[u8]) -> Option<SectorId> {
    let length = dir.length(ctx);
    for off in num_iter::range_step(0, length, DIRENT_SIZE) {
        let de = entry_at(ctx, dir, off);
        if de.matches(name) {
            return Some(de.sector);
        }
    }
    None
}

/// Adds an entry for `name` to `dir`. Fails when the name is empty,
/// too long, or already present. A freed slot is reused before the
/// directory grows.
pub fn add(ctx: &Kernel, dir: &Arc<Inode>, name: &[u8], sector: SectorId) -> Result<(), ()> {
    if name.is_empty() || name.len() > DIRSIZ || name.contains(&b'/') {
        return Err(());
    }
    if lookup(ctx, dir, name).is_some() {
        return Err(());
    }

    let length = dir.length(ctx);
    let off = num_iter::range_step(0, length, DIRENT_SIZE)
        .find(|off| entry_at(ctx, dir, *off).in_use == 0)
        .unwrap_or(length);

    let mut de = Dirent {
        sector,
        name: [0; DIRSIZ],
        in_use: 1,
        _rsvd: 0,
    };
    de.name[..name.len()].copy_from_slice(name);
    dir.write_at(ctx, de.as_bytes(), off).map(|_| ())
}

/// Drops the entry for `name`. The slot is cleared for reuse; the
/// named inode is untouched.
pub fn erase(ctx: &Kernel, dir: &Arc<Inode>, name: &[u8]) -> Result<(), ()> {
    let length = dir.length(ctx);
    for off in num_iter::range_step(0, length, DIRENT_SIZE) {
        if entry_at(ctx, dir, off).matches(name) {
            dir.write_at(ctx, Dirent::default().as_bytes(), off)?;
            return Ok(());
        }
    }
    Err(())
}

/// Reads the `idx`-th live entry name, not counting `.` and `..`.
pub fn read_entry(ctx: &Kernel, dir: &Arc<Inode>, idx: usize) -> Option<ArrayVec<u8, DIRSIZ>> {
    let length = dir.length(ctx);
    let mut seen = 0;
    for off in num_iter::range_step(0, length, DIRENT_SIZE) {
        let de = entry_at(ctx, dir, off);
        if de.in_use == 0 || de.matches(b".") || de.matches(b"..") {
            continue;
        }
        if seen == idx {
            let mut name = ArrayVec::new();
            name.try_extend_from_slice(&de.name[..de.name_len()]).ok()?;
            return Some(name);
        }
        seen += 1;
    }
    None
}

/// Whether `dir` holds anything beyond `.` and `..`.
pub fn is_empty(ctx: &Kernel, dir: &Arc<Inode>) -> bool {
    read_entry(ctx, dir, 0).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::boot;
    use crate::param::ROOT_DIR_SECTOR;

    fn root(ctx: &Kernel) -> Arc<Inode> {
        ctx.fs.itable.open(ctx, ROOT_DIR_SECTOR)
    }

    #[test]
    fn root_knows_itself() {
        let ctx = boot();
        let dir = root(&ctx);
        assert_eq!(lookup(&ctx, &dir, b"."), Some(ROOT_DIR_SECTOR));
        assert_eq!(lookup(&ctx, &dir, b".."), Some(ROOT_DIR_SECTOR));
        assert!(is_empty(&ctx, &dir));
        dir.close(&ctx);
    }

    #[test]
    fn add_lookup_erase() {
        let ctx = boot();
        let dir = root(&ctx);
        add(&ctx, &dir, b"alpha", 42).unwrap();
        add(&ctx, &dir, b"beta", 43).unwrap();
        assert_eq!(lookup(&ctx, &dir, b"alpha"), Some(42));
        assert_eq!(lookup(&ctx, &dir, b"beta"), Some(43));
        assert_eq!(lookup(&ctx, &dir, b"gamma"), None);

        // Duplicate and malformed names are refused.
        assert!(add(&ctx, &dir, b"alpha", 44).is_err());
        assert!(add(&ctx, &dir, b"", 44).is_err());
        assert!(add(&ctx, &dir, b"way-too-long-name", 44).is_err());
        assert!(add(&ctx, &dir, b"a/b", 44).is_err());

        erase(&ctx, &dir, b"alpha").unwrap();
        assert_eq!(lookup(&ctx, &dir, b"alpha"), None);
        assert!(erase(&ctx, &dir, b"alpha").is_err());

        // The freed slot is reused rather than growing the directory.
        let len = dir.length(&ctx);
        add(&ctx, &dir, b"delta", 45).unwrap();
        assert_eq!(dir.length(&ctx), len);
        dir.close(&ctx);
    }

    #[test]
    fn enumeration_skips_dot_entries() {
        let ctx = boot();
        let dir = root(&ctx);
        add(&ctx, &dir, b"one", 10).unwrap();
        add(&ctx, &dir, b"two", 11).unwrap();

        let first = read_entry(&ctx, &dir, 0).unwrap();
        let second = read_entry(&ctx, &dir, 1).unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
        assert!(read_entry(&ctx, &dir, 2).is_none());
        dir.close(&ctx);
    }
}
