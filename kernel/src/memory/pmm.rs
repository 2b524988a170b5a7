// =============================================================================
// Protium — Physical Memory Manager (Bitmap Frame Allocator)
// =============================================================================
//
// The PMM tracks which physical page frames (4 KiB each) are free or in
// use. It uses a bitmap: one bit per frame.
//
// BITMAP LAYOUT:
//   bit = 1 → frame is USED (allocated or reserved)
//   bit = 0 → frame is FREE (available for allocation)
//
//   Bit 0 of word 0 corresponds to frame 0 (physical address 0x0000),
//   bit 1 to frame 1 (0x1000), and so on.
//
// INITIALIZATION:
//   Physical memory on this machine is one contiguous region starting at
//   0, sized by the bootloader's memory fields. The bitmap itself is a
//   placement allocation, so it sits below the identity-mapped boundary
//   and stays addressable after paging comes on. Everything the early
//   boot consumed — kernel image, bitmap, page tables — is reserved by
//   the MMU bootstrap while it identity-maps those same frames.
//
// ALLOCATION STRATEGY:
//   Linear scan, one 32-bit word at a time (a full word of 1s skips 32
//   frames in one compare). A cursor remembers where the last allocation
//   ended so repeated allocations don't rescan the used prefix.
//
// THREAD SAFETY:
//   The allocator is a global behind a SpinLock. All public functions
//   acquire the lock.
// =============================================================================

use core::slice;

use kvmem::{PhysAddr, PAGE_SIZE};

use crate::memory::kmem;
use crate::sync::spinlock::SpinLock;

/// Snapshot of physical memory usage, for boot reporting and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    /// Total number of physical frames tracked by the bitmap.
    pub total_frames: usize,
    /// Number of frames currently marked as used.
    pub used_frames: usize,
    /// Number of frames currently free.
    pub free_frames: usize,
}

/// The global physical memory manager.
///
/// `None` before `init()`; all public functions panic on an uninitialized
/// PMM, because there is no sane fallback for frame allocation.
static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

struct BitmapAllocator {
    /// One bit per frame, 1 = used. Placement-allocated, identity-mapped.
    bitmap: &'static mut [u32],
    total_frames: usize,
    used_frames: usize,
    /// Scan cursor: frames below this index are known to be used.
    search_start: usize,
}

impl BitmapAllocator {
    fn new(mem_bytes: u32) -> Self {
        let total_frames = (mem_bytes / PAGE_SIZE) as usize;
        let words = total_frames.div_ceil(32);

        let storage = kmem::alloc(
            core::alloc::Layout::array::<u32>(words).expect("pmm: bitmap layout"),
        )
        .expect("pmm: no memory for the frame bitmap");

        // SAFETY: freshly placement-allocated storage of exactly `words`
        // words, never aliased, alive for the rest of the kernel's life.
        let bitmap = unsafe { slice::from_raw_parts_mut(storage.as_ptr().cast(), words) };
        bitmap.fill(0);

        // Frames past the end of memory in the last word must never be
        // handed out; mark them used up front.
        for frame in total_frames..words * 32 {
            bitmap[frame / 32] |= 1 << (frame % 32);
        }

        klog::info!(
            "pmm: tracking {} frames ({} MiB), bitmap {} words",
            total_frames,
            mem_bytes / 1024 / 1024,
            words
        );

        Self {
            bitmap,
            total_frames,
            used_frames: 0,
            search_start: 0,
        }
    }

    /// Allocate one frame, scanning a word of 32 frames at a time.
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let words = self.bitmap.len();
        let start_word = self.search_start / 32;

        for i in 0..words {
            let word_idx = (start_word + i) % words;
            let word = self.bitmap[word_idx];
            if word == u32::MAX {
                continue;
            }

            // At least one zero bit: the first free frame in this word.
            let bit = (!word).trailing_zeros() as usize;
            let frame = word_idx * 32 + bit;
            if frame >= self.total_frames {
                continue;
            }

            self.bitmap[word_idx] |= 1 << bit;
            self.used_frames += 1;
            self.search_start = frame + 1;
            return Some(PhysAddr::from_frame(frame as u32));
        }

        None
    }

    fn free_frame(&mut self, addr: PhysAddr) {
        assert!(addr.is_page_aligned(), "pmm: freeing unaligned {addr}");
        let frame = addr.frame() as usize;
        assert!(frame < self.total_frames, "pmm: frame {frame:#x} out of range");

        let mask = 1u32 << (frame % 32);
        let word = &mut self.bitmap[frame / 32];
        assert!(*word & mask != 0, "pmm: double free of frame {frame:#x}");
        *word &= !mask;

        self.used_frames -= 1;
        if frame < self.search_start {
            self.search_start = frame;
        }
    }

    /// Mark a specific frame used, regardless of prior state. Used by the
    /// MMU bootstrap to claim the frames the early boot already consumed.
    fn reserve_frame(&mut self, frame: u32) {
        let frame = frame as usize;
        if frame >= self.total_frames {
            return;
        }
        let mask = 1u32 << (frame % 32);
        let word = &mut self.bitmap[frame / 32];
        if *word & mask == 0 {
            *word |= mask;
            self.used_frames += 1;
        }
    }

    fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.total_frames - self.used_frames,
        }
    }
}

// =============================================================================
// Public API — module-level functions that acquire the spinlock
// =============================================================================

/// Initialize the physical memory manager. Must run during early boot,
/// after the placement allocator is up and before the MMU bootstrap.
///
/// # Panics
/// If called more than once.
pub fn init(mem_bytes: u32) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "pmm: init called more than once");
    *pmm = Some(BitmapAllocator::new(mem_bytes));
}

/// Allocate a single 4 KiB physical frame. Returns a page-aligned
/// physical address, or `None` when memory is exhausted. The frame
/// contents are whatever the previous owner left there.
pub fn alloc_frame() -> Option<PhysAddr> {
    PMM.lock()
        .as_mut()
        .expect("pmm: not initialized")
        .alloc_frame()
}

/// Return a frame to the pool.
///
/// # Panics
/// On unaligned addresses, out-of-range frames, and double frees.
pub fn free_frame(addr: PhysAddr) {
    PMM.lock()
        .as_mut()
        .expect("pmm: not initialized")
        .free_frame(addr);
}

/// Claim `frame` as permanently used (identity-mapped boot memory).
pub fn reserve_frame(frame: u32) {
    PMM.lock()
        .as_mut()
        .expect("pmm: not initialized")
        .reserve_frame(frame);
}

/// Snapshot of the current allocation state.
pub fn stats() -> MemoryStats {
    PMM.lock().as_ref().expect("pmm: not initialized").stats()
}
