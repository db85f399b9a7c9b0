//! Processes, as the storage and paging layers see them.
//!
//! Scheduling, exec and wait live above this crate; what remains here
//! is the per-process state those layers consume: an address space, a
//! working directory, and helpers that stand in for user-mode memory
//! accesses (they fault pages in and set the hardware bits the way a
//! real load or store would).

use alloc::sync::{Arc, Weak};
use core::cmp;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::fs::inode::Inode;
use crate::kernel::Kernel;
use crate::param::{PGSIZE, ROOT_DIR_SECTOR};
use crate::util::{pg_ofs, pg_round_down};
use crate::vm;
use crate::vm::page::{AddrSpace, Backing};

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub struct Process {
    pub pid: u32,
    pub vm: AddrSpace,
    cwd: Mutex<Option<Arc<Inode>>>,
    /// Handle frames use to point back at their owner.
    me: Weak<Process>,
}

impl Process {
    /// A fresh process rooted at `/`.
    pub fn spawn(ctx: &Kernel) -> Arc<Process> {
        let root = ctx.fs.itable.open(ctx, ROOT_DIR_SECTOR);
        Arc::new_cyclic(|me| Process {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            vm: AddrSpace::new(),
            cwd: Mutex::new(Some(root)),
            me: me.clone(),
        })
    }

    pub(crate) fn weak_self(&self) -> Weak<Process> {
        self.me.clone()
    }

    /// The working directory, shared rather than reopened; path lookup
    /// takes its own reference while walking.
    pub fn cwd(&self) -> Arc<Inode> {
        self.cwd.lock().as_ref().expect("process: exited").clone()
    }

    /// Replaces the working directory, releasing the old one.
    pub(crate) fn set_cwd(&self, ctx: &Kernel, dir: Arc<Inode>) {
        let old = self.cwd.lock().replace(dir);
        if let Some(old) = old {
            old.close(ctx);
        }
    }

    /// Tears down every mapping and page the process owns. Mapped
    /// files get their dirty pages written back on the way out.
    pub fn exit(&self, ctx: &Kernel) {
        let _ = vm::munmap(ctx, self, 0);

        let pages: alloc::vec::Vec<(usize, crate::vm::page::VmEntry)> =
            self.vm.entries.lock().drain().collect();
        for (vaddr, entry) in pages {
            match entry.frame {
                Some(frame) => {
                    self.vm.pagetable.lock().unmap(vaddr);
                    if let Some(page) = ctx.frames.detach(frame, vaddr) {
                        ctx.frames.release(page);
                    }
                }
                None => {
                    if let Backing::Anon { slot: Some(slot) } = entry.backing {
                        ctx.swap.release(slot);
                    }
                }
            }
        }

        if let Some(cwd) = self.cwd.lock().take() {
            cwd.close(ctx);
        }
        log::trace!("proc: pid {} torn down", self.pid);
    }

    /// Makes sure the page under `addr` is resident, faulting it in
    /// the way the MMU would for an access at that address.
    fn touch(&self, ctx: &Kernel, addr: usize) -> Result<(), ()> {
        if self.vm.pagetable.lock().get(pg_round_down(addr)).is_some() {
            return Ok(());
        }
        // The helper models an access by the process itself, so the
        // stack pointer sits at the touched address.
        vm::page_fault(ctx, self, addr, addr)
    }

    /// Reads user memory at `vaddr`, faulting pages in as needed.
    pub fn read_user(&self, ctx: &Kernel, vaddr: usize, dst: &mut [u8]) -> Result<(), ()> {
        self.copy_user(ctx, vaddr, dst.len(), false, |frames, frame, page, ofs, lo, hi| {
            frames.read_page(frame, page, ofs, &mut dst[lo..hi])
        })
    }

    /// Writes user memory at `vaddr`. Fails on a read-only page, as
    /// the store would.
    pub fn write_user(&self, ctx: &Kernel, vaddr: usize, src: &[u8]) -> Result<(), ()> {
        self.copy_user(ctx, vaddr, src.len(), true, |frames, frame, page, ofs, lo, hi| {
            frames.write_page(frame, page, ofs, &src[lo..hi])
        })
    }

    fn copy_user(
        &self,
        ctx: &Kernel,
        vaddr: usize,
        len: usize,
        write: bool,
        mut copy: impl FnMut(
            &crate::vm::frame::FrameTable,
            crate::vm::frame::FrameId,
            usize,
            usize,
            usize,
            usize,
        ) -> bool,
    ) -> Result<(), ()> {
        let mut done = 0;
        while done < len {
            let addr = vaddr + done;
            let page = pg_round_down(addr);
            let chunk = cmp::min(len - done, PGSIZE - pg_ofs(addr));

            self.touch(ctx, addr)?;
            let frame = {
                let pt = self.vm.pagetable.lock();
                let pte = match pt.get(page) {
                    Some(pte) => pte,
                    // Evicted again between the fault and here.
                    None => continue,
                };
                if write && !pte.writable {
                    return Err(());
                }
                pte.frame
            };
            if !copy(&ctx.frames, frame, page, pg_ofs(addr), done, done + chunk) {
                continue;
            }
            self.vm.pagetable.lock().record_access(page, write);
            done += chunk;
        }
        Ok(())
    }
}
