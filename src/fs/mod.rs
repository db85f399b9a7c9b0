//! File system: free map, inodes, directories and path lookup over the
//! buffer cache.
//!
//! Disk layout: sector 0 holds the inode of the free-map file, sector 1
//! the inode of the root directory; everything else is handed out by
//! the free map. The free map itself is ordinary file data, written
//! back at shutdown and reloaded at mount.

use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use crate::fs::inode::Inode;
use crate::fs::path::Path;
use crate::kernel::Kernel;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub mod dir;
mod freemap;
pub mod inode;
pub mod path;

pub use freemap::FreeMap;
pub use inode::Itable;

pub struct FileSys {
    pub(crate) freemap: Mutex<FreeMap>,
    pub(crate) itable: Itable,
    /// Coarse lock serializing path-level operations (create, remove,
    /// open, chdir). Taken before any inode or cache lock.
    lock: Mutex<()>,
    sector_count: u32,
}

impl FileSys {
    pub fn new(sector_count: u32) -> Self {
        Self {
            freemap: Mutex::new(FreeMap::new(sector_count)),
            itable: Itable::new(),
            lock: Mutex::new(()),
            sector_count,
        }
    }

    /// Builds an empty volume: a fresh free map persisted in its
    /// reserved file, and a root directory holding `.` and `..`.
    pub fn format(&self, ctx: &Kernel) {
        {
            let mut map = self.freemap.lock();
            *map = FreeMap::new(self.sector_count);
            map.reserve(FREE_MAP_SECTOR);
            map.reserve(ROOT_DIR_SECTOR);
        }
        let map_len = self.freemap.lock().byte_len();
        Inode::create(ctx, FREE_MAP_SECTOR, map_len, false).expect("format: free-map file");
        Inode::create(ctx, ROOT_DIR_SECTOR, 0, true).expect("format: root directory");

        let root = self.itable.open(ctx, ROOT_DIR_SECTOR);
        dir::add(ctx, &root, b".", ROOT_DIR_SECTOR).expect("format: root dot");
        dir::add(ctx, &root, b"..", ROOT_DIR_SECTOR).expect("format: root dotdot");
        root.close(ctx);

        self.sync_free_map(ctx);
        log::debug!("fs: formatted {} sectors", self.sector_count);
    }

    /// Loads the free map back from its file.
    pub fn mount(&self, ctx: &Kernel) {
        let ip = self.itable.open(ctx, FREE_MAP_SECTOR);
        let mut image = vec![0u8; self.freemap.lock().byte_len()];
        let n = ip.read_at(ctx, &mut image, 0);
        assert_eq!(n, image.len(), "mount: truncated free map");
        ip.close(ctx);
        self.freemap.lock().load(&image);
        log::debug!(
            "fs: mounted, {} sectors free",
            self.freemap.lock().free_count()
        );
    }

    /// Writes the free map into its file. Called at shutdown, before
    /// the cache flush.
    pub(crate) fn sync_free_map(&self, ctx: &Kernel) {
        let image = self.freemap.lock().as_bytes().to_vec();
        let ip = self.itable.open(ctx, FREE_MAP_SECTOR);
        ip.write_at(ctx, &image, 0).expect("free map: write image");
        ip.close(ctx);
    }

    /// Creates a file (or, with `is_dir`, a directory) of `size` zero
    /// bytes at `path`.
    pub fn create(
        &self,
        ctx: &Kernel,
        cwd: &Arc<Inode>,
        path: &Path,
        size: usize,
        is_dir: bool,
    ) -> Result<(), ()> {
        let _fs = self.lock.lock();
        let parent = scopeguard::guard(path::resolve_parent(ctx, cwd, path)?, |(dir, _)| {
            dir.close(ctx)
        });
        let (ref dir, name) = *parent;

        let sector = self.freemap.lock().alloc().ok_or(())?;
        if Inode::create(ctx, sector, size, is_dir).is_err() {
            self.freemap.lock().release(sector);
            return Err(());
        }

        // From here the new inode is discarded through the regular
        // removal path, so a failure cannot leak its sectors.
        let ip = self.itable.open(ctx, sector);
        let ip = scopeguard::guard(ip, |ip| ip.close(ctx));
        let linked = (!is_dir
            || (dir::add(ctx, &ip, b".", sector).is_ok()
                && dir::add(ctx, &ip, b"..", dir.inumber()).is_ok()))
            && dir::add(ctx, dir, name, sector).is_ok();
        if !linked {
            ip.remove();
            return Err(());
        }
        Ok(())
    }

    /// Opens the inode at `path`.
    pub fn open_inode(&self, ctx: &Kernel, cwd: &Arc<Inode>, path: &Path) -> Result<Arc<Inode>, ()> {
        let _fs = self.lock.lock();
        path::resolve(ctx, cwd, path)
    }

    /// Unlinks `path`. Directories must be empty; the root and the
    /// `.`/`..` names are refused. The inode's sectors are reclaimed
    /// when its last opener lets go.
    pub fn remove(&self, ctx: &Kernel, cwd: &Arc<Inode>, path: &Path) -> Result<(), ()> {
        let _fs = self.lock.lock();
        let parent = scopeguard::guard(path::resolve_parent(ctx, cwd, path)?, |(dir, _)| {
            dir.close(ctx)
        });
        let (ref dir, name) = *parent;
        if name == b"." || name == b".." {
            return Err(());
        }

        let sector = dir::lookup(ctx, dir, name).ok_or(())?;
        let ip = self.itable.open(ctx, sector);
        let ip = scopeguard::guard(ip, |ip| ip.close(ctx));
        if ip.is_dir(ctx) && (sector == ROOT_DIR_SECTOR || !dir::is_empty(ctx, &ip)) {
            return Err(());
        }
        dir::erase(ctx, dir, name)?;
        ip.remove();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::boot;

    fn root(ctx: &Kernel) -> Arc<Inode> {
        ctx.fs.itable.open(ctx, ROOT_DIR_SECTOR)
    }

    #[test]
    fn create_open_remove() {
        let ctx = boot();
        let cwd = root(&ctx);
        let before = ctx.fs.freemap.lock().free_count();

        ctx.fs
            .create(&ctx, &cwd, Path::new(b"/notes"), 100, false)
            .unwrap();
        let ip = ctx.fs.open_inode(&ctx, &cwd, Path::new(b"/notes")).unwrap();
        assert_eq!(ip.length(&ctx), 100);
        ip.close(&ctx);

        // Creating over an existing name fails.
        assert!(ctx
            .fs
            .create(&ctx, &cwd, Path::new(b"/notes"), 0, false)
            .is_err());

        ctx.fs.remove(&ctx, &cwd, Path::new(b"/notes")).unwrap();
        assert!(ctx
            .fs
            .open_inode(&ctx, &cwd, Path::new(b"/notes"))
            .is_err());
        assert_eq!(ctx.fs.freemap.lock().free_count(), before);
        cwd.close(&ctx);
    }

    #[test]
    fn directories_nest_and_protect_themselves() {
        let ctx = boot();
        let cwd = root(&ctx);
        ctx.fs
            .create(&ctx, &cwd, Path::new(b"/home"), 0, true)
            .unwrap();
        ctx.fs
            .create(&ctx, &cwd, Path::new(b"/home/user"), 0, true)
            .unwrap();
        ctx.fs
            .create(&ctx, &cwd, Path::new(b"/home/user/todo"), 0, false)
            .unwrap();

        // A populated directory will not go away.
        assert!(ctx.fs.remove(&ctx, &cwd, Path::new(b"/home")).is_err());
        assert!(ctx.fs.remove(&ctx, &cwd, Path::new(b"/")).is_err());
        assert!(ctx.fs.remove(&ctx, &cwd, Path::new(b"/home/.")).is_err());

        ctx.fs
            .remove(&ctx, &cwd, Path::new(b"/home/user/todo"))
            .unwrap();
        ctx.fs.remove(&ctx, &cwd, Path::new(b"/home/user")).unwrap();
        ctx.fs.remove(&ctx, &cwd, Path::new(b"/home")).unwrap();
        cwd.close(&ctx);
    }

    #[test]
    fn relative_walk_through_dot_dot() {
        let ctx = boot();
        let cwd = root(&ctx);
        ctx.fs.create(&ctx, &cwd, Path::new(b"/a"), 0, true).unwrap();
        ctx.fs
            .create(&ctx, &cwd, Path::new(b"/a/b"), 0, true)
            .unwrap();
        ctx.fs
            .create(&ctx, &cwd, Path::new(b"/a/c"), 0, true)
            .unwrap();

        let here = ctx.fs.open_inode(&ctx, &cwd, Path::new(b"/a/b")).unwrap();
        let target = ctx.fs.open_inode(&ctx, &cwd, Path::new(b"/a/c")).unwrap();

        // From /a/b, "../c/d" lands in /a/c with "d" left over.
        let (dir, name) = path::resolve_parent(&ctx, &here, Path::new(b"../c/d")).unwrap();
        assert_eq!(name, b"d");
        assert_eq!(dir.inumber(), target.inumber());

        dir.close(&ctx);
        target.close(&ctx);
        here.close(&ctx);
        cwd.close(&ctx);
    }

    #[test]
    fn slash_resolves_to_root_itself() {
        let ctx = boot();
        let cwd = root(&ctx);
        let (dir, name) = path::resolve_parent(&ctx, &cwd, Path::new(b"/")).unwrap();
        assert_eq!(name, b".");
        assert_eq!(dir.inumber(), ROOT_DIR_SECTOR);
        dir.close(&ctx);

        assert!(path::resolve_parent(&ctx, &cwd, Path::new(b"")).is_err());

        let ip = ctx.fs.open_inode(&ctx, &cwd, Path::new(b"/")).unwrap();
        assert!(ip.is_dir(&ctx));
        ip.close(&ctx);
        cwd.close(&ctx);
    }

    #[test]
    fn intermediate_components_must_be_directories() {
        let ctx = boot();
        let cwd = root(&ctx);
        ctx.fs
            .create(&ctx, &cwd, Path::new(b"/plain"), 0, false)
            .unwrap();
        assert!(ctx
            .fs
            .open_inode(&ctx, &cwd, Path::new(b"/plain/sub"))
            .is_err());
        assert!(ctx
            .fs
            .create(&ctx, &cwd, Path::new(b"/absent/sub"), 0, false)
            .is_err());
        cwd.close(&ctx);
    }
}
