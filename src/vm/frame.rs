//! Frame table and eviction.
//!
//! Physical frames handed to user pages live in an arena with stable
//! indices; resident page entries point at their frame by index and
//! each frame points back at its owner and virtual page. Frames are
//! linked in allocation order on a list a clock hand sweeps when the
//! pool runs dry: a frame whose accessed bit is set gets a second
//! chance, anything else is evicted according to its page type.
//!
//! The list lock covers selection and cursor movement only; it is
//! dropped before any file or swap I/O so eviction write-back cannot
//! entangle with the buffer-cache locks. Two evictors can therefore
//! run, but the victim is detached under the lock, so they never pick
//! the same frame.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::kernel::Kernel;
use crate::proc::Process;
use crate::vm::page::{Backing, Page};

pub type FrameId = usize;

bitflags! {
    pub struct AllocFlags: u32 {
        /// Hand out a zero-filled frame.
        const ZERO = 0b1;
    }
}

pub(crate) struct Frame {
    page: Box<Page>,
    owner: Weak<Process>,
    vaddr: usize,
}

struct FrameList {
    /// Arena of frame descriptors; indices stay valid across removals.
    slots: Vec<Option<Frame>>,
    free_ids: Vec<FrameId>,
    /// Allocation-ordered list the clock hand walks.
    clock: Vec<FrameId>,
    hand: usize,
    /// Pages currently out of the pool, attached or not.
    in_use: usize,
}

pub struct FrameTable {
    list: Mutex<FrameList>,
    capacity: usize,
}

impl FrameTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: Mutex::new(FrameList {
                slots: Vec::new(),
                free_ids: Vec::new(),
                clock: Vec::new(),
                hand: 0,
                in_use: 0,
            }),
            capacity,
        }
    }

    /// Takes a page out of the pool, evicting until one is free.
    /// Fails only when nothing can be evicted (every frame detached or
    /// swap and write-back both refuse).
    pub fn alloc(&self, ctx: &Kernel, flags: AllocFlags) -> Result<Box<Page>, ()> {
        loop {
            {
                let mut list = self.list.lock();
                if list.in_use < self.capacity {
                    list.in_use += 1;
                    drop(list);
                    // Fresh boxes start zeroed either way; the flag
                    // records the caller's requirement.
                    let _ = flags;
                    return Ok(Box::new(Page::DEFAULT));
                }
            }
            self.evict_one(ctx)?;
        }
    }

    /// Returns a page to the pool.
    pub fn release(&self, page: Box<Page>) {
        drop(page);
        let mut list = self.list.lock();
        debug_assert!(list.in_use > 0);
        list.in_use -= 1;
    }

    /// Links an allocated page into the arena and the clock list as
    /// the backing of the owner's page at `vaddr`.
    pub fn attach(&self, page: Box<Page>, owner: Weak<Process>, vaddr: usize) -> FrameId {
        self.insert(Frame { page, owner, vaddr })
    }

    fn insert(&self, frame: Frame) -> FrameId {
        let mut list = self.list.lock();
        let id = match list.free_ids.pop() {
            Some(id) => {
                list.slots[id] = Some(frame);
                id
            }
            None => {
                list.slots.push(Some(frame));
                list.slots.len() - 1
            }
        };
        list.clock.push(id);
        id
    }

    /// Unlinks frame `id`, handing its page to the caller. Fails when
    /// the frame is gone or no longer backs `vaddr` (an eviction beat
    /// the caller to it).
    pub fn detach(&self, id: FrameId, vaddr: usize) -> Option<Box<Page>> {
        let mut list = self.list.lock();
        match list.slots.get(id) {
            Some(Some(frame)) if frame.vaddr == vaddr => {}
            _ => return None,
        }
        let frame = list.slots[id].take().expect("frame arena");
        let pos = list
            .clock
            .iter()
            .position(|c| *c == id)
            .expect("frame clock list");
        list.clock.remove(pos);
        if pos < list.hand {
            list.hand -= 1;
        }
        list.free_ids.push(id);
        Some(frame.page)
    }

    /// Copies bytes out of the frame backing `vaddr`. False when the
    /// frame was evicted (or re-used) since the caller looked it up.
    pub(crate) fn read_page(&self, id: FrameId, vaddr: usize, offset: usize, dst: &mut [u8]) -> bool {
        let list = self.list.lock();
        match list.slots.get(id) {
            Some(Some(frame)) if frame.vaddr == vaddr => {
                dst.copy_from_slice(&frame.page[offset..offset + dst.len()]);
                true
            }
            _ => false,
        }
    }

    /// Copies bytes into the frame backing `vaddr`.
    pub(crate) fn write_page(&self, id: FrameId, vaddr: usize, offset: usize, src: &[u8]) -> bool {
        let mut list = self.list.lock();
        match list.slots.get_mut(id) {
            Some(Some(frame)) if frame.vaddr == vaddr => {
                frame.page[offset..offset + src.len()].copy_from_slice(src);
                true
            }
            _ => false,
        }
    }

    pub fn frames_in_use(&self) -> usize {
        self.list.lock().in_use
    }

    /// Runs the clock until a victim falls out, then pushes its
    /// contents to the right place and returns its page to the pool.
    fn evict_one(&self, ctx: &Kernel) -> Result<(), ()> {
        let (id, frame) = {
            let mut list = self.list.lock();
            if list.clock.is_empty() {
                return Err(());
            }
            loop {
                if list.hand >= list.clock.len() {
                    list.hand = 0;
                }
                let id = list.clock[list.hand];
                let frame = list.slots[id].as_ref().expect("frame arena");
                // Second chance: a page touched since the last sweep
                // loses its accessed bit and stays.
                let referenced = frame.owner.upgrade().map_or(false, |proc| {
                    let mut pt = proc.vm.pagetable.lock();
                    let touched = pt.is_accessed(frame.vaddr);
                    if touched {
                        pt.set_accessed(frame.vaddr, false);
                    }
                    touched
                });
                if referenced {
                    list.hand += 1;
                    continue;
                }
                let hand = list.hand;
                list.clock.remove(hand);
                let frame = list.slots[id].take().expect("frame arena");
                break (id, frame);
            }
            // `id` stays reserved until the eviction settles.
        };

        let result = self.push_out(ctx, id, frame);
        self.list.lock().free_ids.push(id);
        result
    }

    /// Second half of an eviction, run without the list lock.
    fn push_out(&self, ctx: &Kernel, id: FrameId, frame: Frame) -> Result<(), ()> {
        let Frame { page, owner, vaddr } = frame;
        let proc = match owner.upgrade() {
            Some(proc) => proc,
            // Owner already gone; the frame is plain reclaimable.
            None => {
                self.release(page);
                return Ok(());
            }
        };

        let mut entries = proc.vm.entries.lock();
        let entry = match entries.get_mut(&vaddr) {
            Some(entry) if entry.frame == Some(id) => entry,
            _ => {
                drop(entries);
                self.release(page);
                return Ok(());
            }
        };
        let dirty = proc.vm.pagetable.lock().is_dirty(vaddr);

        let moved = match &entry.backing {
            Backing::Anon { .. } => ctx.swap.swap_out(&page).map(Some),
            Backing::Binary { .. } if dirty => ctx.swap.swap_out(&page).map(Some),
            // A clean image page reloads from the file for free.
            Backing::Binary { .. } => Ok(None),
            Backing::Mapped {
                file,
                offset,
                read_bytes,
                ..
            } => {
                if dirty {
                    file.write_at(ctx, &page[..*read_bytes], *offset).map(|_| None)
                } else {
                    Ok(None)
                }
            }
        };

        match moved {
            Ok(slot) => {
                if let Some(slot) = slot {
                    entry.backing = Backing::Anon { slot: Some(slot) };
                }
                entry.frame = None;
                proc.vm.pagetable.lock().unmap(vaddr);
                drop(entries);
                log::trace!("vm: evicted page {:#x} of pid {}", vaddr, proc.pid);
                self.release(page);
                Ok(())
            }
            Err(()) => {
                // Nowhere to put the contents. Put the frame back and
                // let the allocation fail.
                let new_id = self.insert(Frame {
                    page,
                    owner: Arc::downgrade(&proc),
                    vaddr,
                });
                entry.frame = Some(new_id);
                Err(())
            }
        }
    }
}
