//! Demand paging.
//!
//! Nothing is resident until it is touched. The loader and `mmap`
//! register page entries describing backing stores; the fault handler
//! materializes them a page at a time, pulling bytes from the
//! executable image, the mapped file, swap, or nowhere (zero fill),
//! and evicting somebody else's frame when the pool is dry.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::file::File;
use crate::kernel::Kernel;
use crate::param::{PGSIZE, STACK_HEURISTIC, STACK_LIMIT, USER_BASE, USER_TOP};
use crate::proc::Process;
use crate::util::pg_round_down;
use crate::vm::frame::AllocFlags;
use crate::vm::page::{Backing, MmapRecord, VmEntry};

pub mod frame;
pub mod page;
pub mod pagetable;
pub mod swap;

/// Handles a missing translation at `addr` with user stack pointer
/// `esp`. `Err` means the access was illegal and the process must die
/// with status -1 (the dispatcher's job, above this crate).
pub fn page_fault(ctx: &Kernel, proc: &Process, addr: usize, esp: usize) -> Result<(), ()> {
    if addr < USER_BASE || addr >= USER_TOP {
        return Err(());
    }
    let vaddr = pg_round_down(addr);

    let known = proc.vm.entries.lock().contains_key(&vaddr);
    if !known {
        // A push may fault slightly below the stack pointer; anything
        // further out is a stray access, not stack growth.
        let near_stack = addr + STACK_HEURISTIC >= esp && vaddr >= USER_TOP - STACK_LIMIT;
        if !near_stack {
            log::debug!("vm: stray fault at {:#x} (esp {:#x})", addr, esp);
            return Err(());
        }
        proc.vm.entries.lock().insert(
            vaddr,
            VmEntry {
                writable: true,
                frame: None,
                backing: Backing::Anon { slot: None },
            },
        );
    }
    load_page(ctx, proc, vaddr)
}

/// Brings the page at `vaddr` into a frame and installs the
/// translation.
fn load_page(ctx: &Kernel, proc: &Process, vaddr: usize) -> Result<(), ()> {
    // Snapshot the backing, then do the slow work unlocked.
    let backing = {
        let entries = proc.vm.entries.lock();
        let entry = entries.get(&vaddr).ok_or(())?;
        if entry.frame.is_some() {
            return Ok(());
        }
        entry.backing.clone()
    };

    let mut page = ctx.frames.alloc(ctx, AllocFlags::ZERO)?;
    match &backing {
        Backing::Binary {
            file,
            offset,
            read_bytes,
            ..
        }
        | Backing::Mapped {
            file,
            offset,
            read_bytes,
            ..
        } => {
            if *read_bytes > 0 {
                let n = file.read_at(ctx, &mut page[..*read_bytes], *offset);
                if n != *read_bytes {
                    ctx.frames.release(page);
                    return Err(());
                }
            }
            // The zero_bytes tail is already zero-filled.
        }
        Backing::Anon { slot: Some(slot) } => ctx.swap.swap_in(*slot, &mut page),
        Backing::Anon { slot: None } => {}
    }

    let mut entries = proc.vm.entries.lock();
    let entry = match entries.get_mut(&vaddr) {
        Some(entry) => entry,
        None => {
            drop(entries);
            ctx.frames.release(page);
            return Err(());
        }
    };
    if entry.frame.is_some() {
        // Somebody else loaded it while we read; keep theirs.
        drop(entries);
        ctx.frames.release(page);
        return Ok(());
    }
    if let Backing::Anon { slot } = &mut entry.backing {
        // The slot was freed by the swap-in above.
        *slot = None;
    }
    let id = ctx.frames.attach(page, proc.weak_self(), vaddr);
    entry.frame = Some(id);
    proc.vm.pagetable.lock().map(vaddr, id, entry.writable);
    Ok(())
}

/// Registers the pages of an executable segment: `read_bytes` from
/// `file` at `offset`, then zeroes, starting at page-aligned `vaddr`.
/// The pages fault in lazily.
pub fn install_segment(
    proc: &Process,
    file: &Arc<File>,
    offset: usize,
    vaddr: usize,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) -> Result<(), ()> {
    if vaddr % PGSIZE != 0 || (read_bytes + zero_bytes) % PGSIZE != 0 {
        return Err(());
    }
    if vaddr < USER_BASE || vaddr + read_bytes + zero_bytes > USER_TOP {
        return Err(());
    }
    // A running image must not change under its own feet; the deny
    // lasts until the loader's handle closes.
    file.deny_write();

    let mut entries = proc.vm.entries.lock();
    let pages = (read_bytes + zero_bytes) / PGSIZE;
    let mut left = read_bytes;
    for i in 0..pages {
        let page_read = core::cmp::min(left, PGSIZE);
        left -= page_read;
        let entry = VmEntry {
            writable,
            frame: None,
            backing: Backing::Binary {
                file: file.clone(),
                offset: offset + i * PGSIZE,
                read_bytes: page_read,
                zero_bytes: PGSIZE - page_read,
            },
        };
        if entries.insert(vaddr + i * PGSIZE, entry).is_some() {
            panic!("vm: segment overlaps existing pages at {:#x}", vaddr);
        }
    }
    Ok(())
}

/// Maps `file` at page-aligned `addr`, one entry per page of the file.
/// Returns the per-process map identifier. The handle is reopened so
/// the mapping survives the caller closing its own.
pub fn mmap(ctx: &Kernel, proc: &Process, file: &Arc<File>, addr: usize) -> Result<u32, ()> {
    if addr == 0 || addr % PGSIZE != 0 {
        return Err(());
    }
    let length = file.size(ctx);
    if length == 0 {
        return Err(());
    }
    let pages = crate::util::div_round_up(length, PGSIZE);
    if addr < USER_BASE || addr + pages * PGSIZE > USER_TOP {
        return Err(());
    }

    let handle = file.reopen();
    let mut entries = proc.vm.entries.lock();
    if (0..pages).any(|i| entries.contains_key(&(addr + i * PGSIZE))) {
        drop(entries);
        handle.close(ctx);
        return Err(());
    }

    let mut mapped = Vec::with_capacity(pages);
    for i in 0..pages {
        let vaddr = addr + i * PGSIZE;
        let read_bytes = core::cmp::min(length - i * PGSIZE, PGSIZE);
        entries.insert(
            vaddr,
            VmEntry {
                writable: true,
                frame: None,
                backing: Backing::Mapped {
                    file: handle.clone(),
                    offset: i * PGSIZE,
                    read_bytes,
                    zero_bytes: PGSIZE - read_bytes,
                },
            },
        );
        mapped.push(vaddr);
    }
    drop(entries);

    let mut mmaps = proc.vm.mmaps.lock();
    let id = mmaps.next_id;
    mmaps.next_id += 1;
    mmaps.maps.push(MmapRecord {
        id,
        file: handle,
        pages: mapped,
    });
    log::trace!("vm: pid {} mapped {} pages at {:#x}", proc.pid, pages, addr);
    Ok(id)
}

/// Tears down mapping `id`, or every mapping when `id` is 0. Resident
/// pages dirtied through the mapping go back to the file first.
pub fn munmap(ctx: &Kernel, proc: &Process, id: u32) -> Result<(), ()> {
    let records: Vec<MmapRecord> = {
        let mut mmaps = proc.vm.mmaps.lock();
        if id == 0 {
            mmaps.maps.drain(..).collect()
        } else {
            let pos = mmaps.maps.iter().position(|r| r.id == id).ok_or(())?;
            alloc::vec![mmaps.maps.remove(pos)]
        }
    };

    for record in records {
        for vaddr in &record.pages {
            unmap_page(ctx, proc, *vaddr);
        }
        record.file.close(ctx);
    }
    Ok(())
}

/// Removes one mapped page, writing it back if the hardware dirty bit
/// says the process stored through it.
fn unmap_page(ctx: &Kernel, proc: &Process, vaddr: usize) {
    let entry = match proc.vm.entries.lock().remove(&vaddr) {
        Some(entry) => entry,
        None => return,
    };
    let frame = match entry.frame {
        Some(frame) => frame,
        None => return,
    };
    let dirty = proc.vm.pagetable.lock().is_dirty(vaddr);
    proc.vm.pagetable.lock().unmap(vaddr);
    let page = match ctx.frames.detach(frame, vaddr) {
        Some(page) => page,
        // An evictor got here first and already wrote the page back.
        None => return,
    };
    if dirty {
        if let Backing::Mapped {
            file,
            offset,
            read_bytes,
            ..
        } = &entry.backing
        {
            let _ = file.write_at(ctx, &page[..*read_bytes], *offset);
        }
    }
    ctx.frames.release(page);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{boot, boot_with};
    use crate::param::SECTOR_SIZE;
    use crate::proc::Process;

    const STACK_TOP: usize = USER_TOP - PGSIZE;

    #[test]
    fn fault_outside_user_space_is_fatal() {
        let ctx = boot();
        let proc = Process::spawn(&ctx);
        assert!(page_fault(&ctx, &proc, USER_BASE - 1, STACK_TOP).is_err());
        assert!(page_fault(&ctx, &proc, USER_TOP, STACK_TOP).is_err());
        assert!(page_fault(&ctx, &proc, 0, STACK_TOP).is_err());
        proc.exit(&ctx);
    }

    #[test]
    fn stack_grows_only_near_the_stack_pointer() {
        let ctx = boot();
        let proc = Process::spawn(&ctx);
        let esp = STACK_TOP;

        // A push 32 bytes under esp is legitimate growth.
        assert!(page_fault(&ctx, &proc, esp - STACK_HEURISTIC, esp).is_ok());
        assert!(proc.vm.pagetable.lock().get(pg_round_down(esp - 32)).is_some());

        // One byte further is not.
        let esp2 = STACK_TOP - 2 * PGSIZE;
        assert!(page_fault(&ctx, &proc, esp2 - STACK_HEURISTIC - 1, esp2).is_err());

        // Growth below the bounded stack region is refused outright.
        let low = USER_TOP - STACK_LIMIT - PGSIZE;
        assert!(page_fault(&ctx, &proc, low, low).is_err());
        proc.exit(&ctx);
    }

    #[test]
    fn anonymous_pages_zero_fill_and_round_trip() {
        let ctx = boot();
        let proc = Process::spawn(&ctx);
        let addr = STACK_TOP;

        let mut byte = [0xAAu8];
        proc.read_user(&ctx, addr, &mut byte).unwrap();
        assert_eq!(byte[0], 0);

        proc.write_user(&ctx, addr + 100, b"stack bytes").unwrap();
        let mut back = [0u8; 11];
        proc.read_user(&ctx, addr + 100, &mut back).unwrap();
        assert_eq!(&back, b"stack bytes");
        proc.exit(&ctx);
    }

    #[test]
    fn exhausting_frames_spills_to_swap() {
        let frames = 4;
        let ctx = boot_with(frames, 1024, 256);
        let proc = Process::spawn(&ctx);

        // Touch one more page than the pool holds; each carries its
        // own pattern.
        let base = STACK_TOP - frames * PGSIZE;
        for i in 0..frames + 1 {
            let addr = base + i * PGSIZE;
            proc.write_user(&ctx, addr, &[i as u8 + 1; 64]).unwrap();
        }
        assert_eq!(ctx.frames.frames_in_use(), frames);
        assert!(ctx.swap.slots_in_use() > 0, "someone must have spilled");

        // Every page still reads back, faulting evicted ones in from
        // swap (and spilling others out).
        for i in 0..frames + 1 {
            let addr = base + i * PGSIZE;
            let mut back = [0u8; 64];
            proc.read_user(&ctx, addr, &mut back).unwrap();
            assert_eq!(back, [i as u8 + 1; 64]);
        }
        proc.exit(&ctx);
        assert_eq!(ctx.frames.frames_in_use(), 0);
        assert_eq!(ctx.swap.slots_in_use(), 0);
    }

    #[test]
    fn clean_binary_pages_reload_instead_of_swapping() {
        let frames = 2;
        let ctx = boot_with(frames, 1024, 256);
        let proc = Process::spawn(&ctx);

        // An "executable" two pages long.
        let cwd = proc.cwd();
        ctx.fs
            .create(&ctx, &cwd, crate::fs::path::Path::new(b"/img"), 2 * PGSIZE, false)
            .unwrap();
        let file = {
            let ip = ctx
                .fs
                .open_inode(&ctx, &cwd, crate::fs::path::Path::new(b"/img"))
                .unwrap();
            crate::file::File::new(ip)
        };
        file.write_at(&ctx, b"codecodecode", 0).unwrap();
        file.write_at(&ctx, b"datadatadata", PGSIZE).unwrap();

        install_segment(&proc, &file, 0, USER_BASE, PGSIZE, 0, false).unwrap();
        install_segment(&proc, &file, PGSIZE, USER_BASE + PGSIZE, PGSIZE, 0, true).unwrap();

        let mut buf = [0u8; 12];
        proc.read_user(&ctx, USER_BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"codecodecode");
        proc.read_user(&ctx, USER_BASE + PGSIZE, &mut buf).unwrap();
        assert_eq!(&buf, b"datadatadata");

        // Push both out by touching fresh stack pages. The clean code
        // page must not cost a swap slot.
        proc.write_user(&ctx, STACK_TOP, &[1]).unwrap();
        proc.write_user(&ctx, STACK_TOP - PGSIZE, &[2]).unwrap();
        assert_eq!(ctx.swap.slots_in_use(), 0);

        // It still reads back from the file afterwards.
        proc.read_user(&ctx, USER_BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"codecodecode");

        // Writes to a read-only page are refused.
        assert!(proc.write_user(&ctx, USER_BASE, &[0]).is_err());
        proc.exit(&ctx);
        file.close(&ctx);
    }

    #[test]
    fn dirtied_binary_pages_convert_to_swap() {
        let frames = 2;
        let ctx = boot_with(frames, 1024, 256);
        let proc = Process::spawn(&ctx);
        let cwd = proc.cwd();
        ctx.fs
            .create(&ctx, &cwd, crate::fs::path::Path::new(b"/img2"), PGSIZE, false)
            .unwrap();
        let file = {
            let ip = ctx
                .fs
                .open_inode(&ctx, &cwd, crate::fs::path::Path::new(b"/img2"))
                .unwrap();
            crate::file::File::new(ip)
        };
        file.write_at(&ctx, b"mutable-data", 0).unwrap();

        install_segment(&proc, &file, 0, USER_BASE, PGSIZE, 0, true).unwrap();
        proc.write_user(&ctx, USER_BASE, b"MUTATED-DATA").unwrap();

        // Force it out; the dirtied image page must go to swap, not
        // back to the file.
        proc.write_user(&ctx, STACK_TOP, &[1]).unwrap();
        proc.write_user(&ctx, STACK_TOP - PGSIZE, &[2]).unwrap();
        assert_eq!(ctx.swap.slots_in_use(), 1);

        let mut buf = [0u8; 12];
        file.read_at(&ctx, &mut buf, 0);
        assert_eq!(&buf, b"mutable-data");

        proc.read_user(&ctx, USER_BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"MUTATED-DATA");
        proc.exit(&ctx);
        file.close(&ctx);
    }

    #[test]
    fn mmap_rejects_bad_addresses() {
        let ctx = boot();
        let proc = Process::spawn(&ctx);
        let cwd = proc.cwd();
        ctx.fs
            .create(&ctx, &cwd, crate::fs::path::Path::new(b"/m"), SECTOR_SIZE, false)
            .unwrap();
        let file = {
            let ip = ctx
                .fs
                .open_inode(&ctx, &cwd, crate::fs::path::Path::new(b"/m"))
                .unwrap();
            crate::file::File::new(ip)
        };

        assert!(mmap(&ctx, &proc, &file, 0).is_err());
        assert!(mmap(&ctx, &proc, &file, 0x1000_0001).is_err());
        let id = mmap(&ctx, &proc, &file, 0x1000_0000).unwrap();
        // Overlapping a live mapping fails.
        assert!(mmap(&ctx, &proc, &file, 0x1000_0000).is_err());
        assert!(munmap(&ctx, &proc, id).is_ok());
        assert!(munmap(&ctx, &proc, id).is_err());
        // Unmapped, the range is free again.
        let id2 = mmap(&ctx, &proc, &file, 0x1000_0000).unwrap();
        assert_ne!(id, id2);
        proc.exit(&ctx);
        file.close(&ctx);
        assert_eq!(ctx.frames.frames_in_use(), 0);
    }

    #[test]
    fn munmap_writes_dirty_pages_back() {
        let ctx = boot();
        let proc = Process::spawn(&ctx);
        let cwd = proc.cwd();
        let path = crate::fs::path::Path::new(b"/mapped");
        ctx.fs.create(&ctx, &cwd, path, 2 * PGSIZE, false).unwrap();
        let file = {
            let ip = ctx.fs.open_inode(&ctx, &cwd, path).unwrap();
            crate::file::File::new(ip)
        };

        let addr = 0x2000_0000;
        let id = mmap(&ctx, &proc, &file, addr).unwrap();
        // Page 0 is only read; page 1 is written.
        let mut buf = [0u8; 8];
        proc.read_user(&ctx, addr, &mut buf).unwrap();
        proc.write_user(&ctx, addr + PGSIZE + 9, b"pattern!").unwrap();
        munmap(&ctx, &proc, id).unwrap();
        assert_eq!(ctx.frames.frames_in_use(), 0);

        // The store through the mapping reached the file.
        file.read_at(&ctx, &mut buf, PGSIZE + 9);
        assert_eq!(&buf, b"pattern!");

        // The mapping outlives the caller's handle: map, close the
        // original, then keep using the memory.
        let id = mmap(&ctx, &proc, &file, addr).unwrap();
        file.close(&ctx);
        proc.write_user(&ctx, addr, b"still alive").unwrap();
        munmap(&ctx, &proc, id).unwrap();

        let check = ctx.fs.open_inode(&ctx, &cwd, path).unwrap();
        let mut back = [0u8; 11];
        check.read_at(&ctx, &mut back, 0);
        assert_eq!(&back, b"still alive");
        check.close(&ctx);
        proc.exit(&ctx);
    }
}
