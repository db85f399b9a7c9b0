//! Path lookup.
//!
//! Paths are slash-separated byte strings. An absolute path starts at
//! the root directory, a relative one at the caller's working
//! directory. Resolution walks every component but the last, requiring
//! each to name a directory; the last component is handed back so the
//! caller can create, open or delete it.

use alloc::sync::Arc;

use crate::device::SectorId;
use crate::fs::dir;
use crate::fs::inode::Inode;
use crate::kernel::Kernel;
use crate::param::ROOT_DIR_SECTOR;

#[repr(transparent)]
pub struct Path {
    inner: [u8],
}

impl Path {
    pub fn new(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of
        // its attribute `#[repr(transparent)]`.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns `Some((path, name))` where,
    ///  - `name` is the next path element from `self`, and
    ///  - `path` is the remaining path.
    ///
    /// The returned path has no leading slashes, so the caller can
    /// check `path.is_empty()` to see if the name is the last one.
    ///
    /// If no name to remove, returns `None`.
    pub fn skipelem(&self) -> Option<(&Self, &[u8])> {
        let mut bytes = &self.inner;

        let name_start = bytes.iter().position(|ch| *ch != b'/')?;
        bytes = &bytes[name_start..];

        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or(bytes.len());
        let name = &bytes[..len];
        bytes = &bytes[len..];

        let next_start = bytes
            .iter()
            .position(|ch| *ch != b'/')
            .unwrap_or(bytes.len());
        Some((Self::new(&bytes[next_start..]), name))
    }
}

/// Walks `path` up to its final component. Returns the directory that
/// would hold it, opened, together with the component itself. The path
/// `/` resolves to the root with name `.`; an empty path is an error.
pub fn resolve_parent<'p>(
    ctx: &Kernel,
    cwd: &Arc<Inode>,
    path: &'p Path,
) -> Result<(Arc<Inode>, &'p [u8]), ()> {
    if path.is_empty() {
        return Err(());
    }
    let mut dir = if path.is_absolute() {
        ctx.fs.itable.open(ctx, ROOT_DIR_SECTOR)
    } else {
        Inode::reopen(cwd)
    };

    let (mut rest, mut name) = match path.skipelem() {
        Some(parts) => parts,
        // Nothing but slashes: the root itself.
        None => return Ok((dir, &b"."[..])),
    };

    loop {
        if rest.is_empty() {
            return Ok((dir, name));
        }
        let next = match dir::lookup(ctx, &dir, name) {
            Some(sector) => sector,
            None => {
                dir.close(ctx);
                return Err(());
            }
        };
        let ip = ctx.fs.itable.open(ctx, next);
        if !ip.is_dir(ctx) {
            ip.close(ctx);
            dir.close(ctx);
            return Err(());
        }
        dir.close(ctx);
        dir = ip;

        let (next_rest, next_name) = rest.skipelem().expect("path: empty remainder");
        rest = next_rest;
        name = next_name;
    }
}

/// Resolves `path` all the way to an opened inode.
pub fn resolve(ctx: &Kernel, cwd: &Arc<Inode>, path: &Path) -> Result<Arc<Inode>, ()> {
    let (dir, name) = resolve_parent(ctx, cwd, path)?;
    let found = dir::lookup(ctx, &dir, name);
    dir.close(ctx);
    let sector: SectorId = found.ok_or(())?;
    Ok(ctx.fs.itable.open(ctx, sector))
}
