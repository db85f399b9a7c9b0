//! End-to-end scenarios across the cache, the file system and the
//! paging layers, driven through the public surface only.

use std::sync::Arc;

use pv6_kernel::param::{PGSIZE, SECTOR_SIZE, USER_TOP};
use pv6_kernel::{Kernel, MemDisk, Process};

const FS_SECTORS: u32 = 2048;
const SWAP_SECTORS: u32 = 512;

fn boot() -> (Arc<MemDisk>, Arc<MemDisk>, Kernel) {
    let fs_dev = Arc::new(MemDisk::new(FS_SECTORS));
    let swap_dev = Arc::new(MemDisk::new(SWAP_SECTORS));
    let kernel = Kernel::new(fs_dev.clone(), swap_dev.clone());
    kernel.format();
    (fs_dev, swap_dev, kernel)
}

#[test]
fn files_survive_a_reboot() {
    let (fs_dev, swap_dev, kernel) = boot();
    let proc = Process::spawn(&kernel);

    kernel.mkdir(&proc, b"/docs").unwrap();
    kernel.create(&proc, b"/docs/readme", 0).unwrap();
    let f = kernel.open(&proc, b"/docs/readme").unwrap();
    f.write(&kernel, b"written before the reboot").unwrap();
    f.close(&kernel);
    proc.exit(&kernel);
    kernel.shutdown();

    // Same devices, fresh kernel: only what the cache flushed and the
    // free map file recorded is left.
    let kernel = Kernel::new(fs_dev, swap_dev);
    kernel.mount();
    let proc = Process::spawn(&kernel);

    let f = kernel.open(&proc, b"/docs/readme").unwrap();
    let mut back = [0u8; 25];
    assert_eq!(f.read(&kernel, &mut back), 25);
    assert_eq!(&back, b"written before the reboot");
    f.close(&kernel);

    // Allocation still works after remounting the free map.
    kernel.create(&proc, b"/docs/second", 3 * SECTOR_SIZE).unwrap();
    let g = kernel.open(&proc, b"/docs/second").unwrap();
    assert_eq!(g.size(&kernel), 3 * SECTOR_SIZE);
    g.close(&kernel);
    proc.exit(&kernel);
    kernel.shutdown();
}

#[test]
fn write_far_past_eof_then_read_back() {
    let (_, _, kernel) = boot();
    let proc = Process::spawn(&kernel);

    kernel.create(&proc, b"/sparse", 0).unwrap();
    let f = kernel.open(&proc, b"/sparse").unwrap();

    // End lands deep in the single-indirect range.
    let offset = 130 * SECTOR_SIZE + 17;
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(f.write_at(&kernel, &payload, offset), Ok(payload.len()));
    assert_eq!(f.size(&kernel), offset + payload.len());

    let mut back = vec![0u8; payload.len()];
    assert_eq!(f.read_at(&kernel, &mut back, offset), payload.len());
    assert_eq!(back, payload);

    // The short-read contract at the new end of file.
    let mut tail = [0u8; 64];
    assert_eq!(f.read_at(&kernel, &mut tail, offset + payload.len() - 10), 10);
    f.close(&kernel);
    proc.exit(&kernel);
}

#[test]
fn mapped_file_carries_stores_back_on_unmap() {
    let (_, _, kernel) = boot();
    let proc = Process::spawn(&kernel);

    kernel.create(&proc, b"/shared", 2 * PGSIZE).unwrap();
    let f = kernel.open(&proc, b"/shared").unwrap();

    let addr = 0x1800_0000;
    let id = kernel.mmap(&proc, &f, addr).unwrap();

    let pattern: Vec<u8> = (0..PGSIZE).map(|i| (i % 7) as u8 + 1).collect();
    proc.write_user(&kernel, addr + PGSIZE, &pattern).unwrap();
    kernel.munmap(&proc, id).unwrap();
    f.close(&kernel);

    // Reopen and read what the mapping wrote.
    let g = kernel.open(&proc, b"/shared").unwrap();
    let mut back = vec![0u8; PGSIZE];
    assert_eq!(g.read_at(&kernel, &mut back, PGSIZE), PGSIZE);
    assert_eq!(back, pattern);

    // Page 0 was never dirtied and must still be zeroes.
    assert_eq!(g.read_at(&kernel, &mut back, 0), PGSIZE);
    assert!(back.iter().all(|b| *b == 0));
    g.close(&kernel);
    proc.exit(&kernel);
}

#[test]
fn reads_through_a_mapping_see_file_contents() {
    let (_, _, kernel) = boot();
    let proc = Process::spawn(&kernel);

    kernel.create(&proc, b"/input", 0).unwrap();
    let f = kernel.open(&proc, b"/input").unwrap();
    f.write(&kernel, b"mapped view of a file").unwrap();

    let addr = 0x1900_0000;
    let id = kernel.mmap(&proc, &f, addr).unwrap();
    let mut view = [0u8; 21];
    proc.read_user(&kernel, addr, &mut view).unwrap();
    assert_eq!(&view, b"mapped view of a file");

    // Bytes past the file inside the page are the zero tail.
    let mut tail = [0u8; 8];
    proc.read_user(&kernel, addr + 21, &mut tail).unwrap();
    assert_eq!(tail, [0u8; 8]);

    kernel.munmap(&proc, id).unwrap();
    f.close(&kernel);
    proc.exit(&kernel);
}

#[test]
fn thrashing_a_tiny_frame_pool_preserves_contents() {
    let fs_dev = Arc::new(MemDisk::new(FS_SECTORS));
    let swap_dev = Arc::new(MemDisk::new(SWAP_SECTORS));
    let kernel = Kernel::with_frames(fs_dev, swap_dev, 3);
    kernel.format();
    let proc = Process::spawn(&kernel);

    // Ten stack pages through a three-frame pool.
    let pages = 10;
    let base = USER_TOP - pages * PGSIZE;
    for i in 0..pages {
        let mark = [(i as u8) ^ 0x5A; 32];
        proc.write_user(&kernel, base + i * PGSIZE, &mark).unwrap();
    }
    assert_eq!(kernel.frames_in_use(), 3);
    assert!(kernel.swap_slots_in_use() >= pages - 3);

    for i in (0..pages).rev() {
        let mut back = [0u8; 32];
        proc.read_user(&kernel, base + i * PGSIZE, &mut back).unwrap();
        assert_eq!(back, [(i as u8) ^ 0x5A; 32], "page {} lost its bytes", i);
    }

    proc.exit(&kernel);
    assert_eq!(kernel.frames_in_use(), 0);
    assert_eq!(kernel.swap_slots_in_use(), 0);
}

#[test]
fn stack_heuristic_boundary() {
    let (_, _, kernel) = boot();
    let proc = Process::spawn(&kernel);
    let esp = USER_TOP - 4 * PGSIZE;

    // 33 bytes below the stack pointer is no push of ours: the page
    // stays unmapped and the access is fatal.
    assert!(kernel.page_fault(&proc, esp - 33, esp).is_err());
    // 32 bytes below is what a real push touches, and grows the stack.
    assert!(kernel.page_fault(&proc, esp - 32, esp).is_ok());
    proc.exit(&kernel);
}
