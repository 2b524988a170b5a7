// =============================================================================
// Protium — Kernel Memory Allocator (kmem)
// =============================================================================
//
// Dynamic memory for kernel objects, in two phases:
//
// PHASE 1 — PLACEMENT (before paging):
//   A bump cursor starting at the end of the kernel image. Nothing
//   allocated here is ever freed; this is where the PMM bitmap, the kernel
//   page directory, and the kernel-range page tables live. Memory is
//   identity-addressed, so the virtual and physical address of a placement
//   allocation coincide — which is exactly what the MMU bootstrap needs.
//
// PHASE 2 — HEAP (after paging):
//   A first-fit free-list allocator over the KERNEL_KMEM region
//   (0xE0000000, 4 MiB), whose pages the MMU bootstrap mapped and backed.
//   The list is kept sorted by address so adjacent free blocks coalesce on
//   free:
//
//     ┌──────────┐     ┌──────────────┐     ┌───────────┐
//     │ FreeBlock│ ──→ │  FreeBlock   │ ──→ │ FreeBlock │ ──→ null
//     │ size: 64 │     │ size: 4096   │     │ size: 128 │
//     └──────────┘     └──────────────┘     └───────────┘
//
// The page-aligned entry point `alloc_pages` additionally reports the
// physical address of the storage (via the kernel page tables once paging
// is on), because page tables and directories are handed to the CPU by
// physical address.
// =============================================================================

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};

use kvmem::layout::{KERNEL_KMEM_BASE, KERNEL_KMEM_SIZE};
use kvmem::{PhysAddr, PAGE_SIZE};

use crate::memory::mmu;
use crate::sync::spinlock::SpinLock;

/// Minimum carve size: every block must be able to hold a free-list node.
const MIN_BLOCK_SIZE: usize = size_of::<FreeBlock>();

/// Header stored at the beginning of each free block.
#[repr(C)]
struct FreeBlock {
    /// Total size of this free block in bytes (including the header).
    size: usize,
    /// Next free block by ascending address, or null.
    next: *mut FreeBlock,
}

/// Bump cursor for the placement phase. `None` until `init` runs.
static PLACEMENT: SpinLock<Option<u32>> = SpinLock::new(None);

/// Free-list head for the heap phase. Null until `init_heap` runs; the
/// flag distinguishes "not yet initialized" from "empty".
static HEAP: SpinLock<Heap> = SpinLock::new(Heap {
    head: ptr::null_mut(),
    ready: false,
});

struct Heap {
    head: *mut FreeBlock,
    ready: bool,
}

// SAFETY: the raw list pointers are only dereferenced under the spinlock.
unsafe impl Send for Heap {}

/// Begin the placement phase at `start` (the end of the kernel image).
pub fn init(start: u32) {
    let mut placement = PLACEMENT.lock();
    assert!(placement.is_none(), "kmem: init called more than once");
    *placement = Some(align_up(start as usize, MIN_BLOCK_SIZE) as u32);
    klog::debug!("kmem: placement allocator starts at {:#010x}", start);
}

/// The current placement cursor.
///
/// The MMU bootstrap identity-maps everything below this address (plus one
/// page of slack), so it advances monotonically and is only meaningful
/// until the heap takes over.
pub fn placement_addr() -> u32 {
    PLACEMENT.lock().expect("kmem: not initialized")
}

/// Bump-allocate permanent storage during the placement phase.
fn placement_alloc(size: usize, align: usize) -> NonNull<u8> {
    let mut placement = PLACEMENT.lock();
    let cursor = placement.expect("kmem: not initialized");
    let start = align_up(cursor as usize, align);
    *placement = Some((start + size) as u32);
    // Identity-addressed; never null because the kernel does not load at 0.
    NonNull::new(start as *mut u8).expect("placement cursor wrapped to null")
}

/// Hand the KERNEL_KMEM region to the free-list heap and leave the
/// placement phase. Requires the region to be mapped and backed, which the
/// MMU bootstrap guarantees before this is called.
pub fn init_heap() {
    let mut heap = HEAP.lock();
    assert!(!heap.ready, "kmem: init_heap called more than once");

    let base = KERNEL_KMEM_BASE as *mut FreeBlock;
    // SAFETY: the region is mapped, backed, and unused; writing the
    // initial free-block header is the act of claiming it.
    unsafe {
        (*base).size = KERNEL_KMEM_SIZE as usize;
        (*base).next = ptr::null_mut();
    }
    heap.head = base;
    heap.ready = true;

    klog::info!(
        "kmem: heap online at {:#010x}..{:#010x}",
        KERNEL_KMEM_BASE,
        KERNEL_KMEM_BASE + KERNEL_KMEM_SIZE
    );
}

/// Allocate kernel memory. Uses the heap once it is online, the placement
/// cursor before that.
pub fn alloc(layout: Layout) -> Option<NonNull<u8>> {
    let (size, align) = effective(layout);

    let mut heap = HEAP.lock();
    if !heap.ready {
        drop(heap);
        return Some(placement_alloc(size, align));
    }

    // First fit: walk the sorted list for a block that can carve an
    // aligned region of `size` bytes.
    let mut prev: *mut *mut FreeBlock = &mut heap.head;
    unsafe {
        while !(*prev).is_null() {
            let block = *prev;
            let block_addr = block as usize;
            let block_size = (*block).size;

            let mut start = align_up(block_addr, align);
            // A leading gap must be able to stand alone as a free block.
            if start != block_addr && start - block_addr < MIN_BLOCK_SIZE {
                start = align_up(block_addr + MIN_BLOCK_SIZE, align);
            }
            let pad = start - block_addr;

            if pad + size <= block_size {
                let next = (*block).next;
                let tail = block_size - pad - size;

                // Trailing remainder becomes a new free block. Sizes are
                // multiples of MIN_BLOCK_SIZE, so a nonzero tail fits one.
                let mut link = next;
                if tail > 0 {
                    let tail_block = (start + size) as *mut FreeBlock;
                    (*tail_block).size = tail;
                    (*tail_block).next = next;
                    link = tail_block;
                }

                if pad > 0 {
                    (*block).size = pad;
                    (*block).next = link;
                } else {
                    *prev = link;
                }

                return Some(NonNull::new_unchecked(start as *mut u8));
            }

            prev = &mut (*block).next;
        }
    }
    None
}

/// Return memory obtained from [`alloc`] after the heap came online.
///
/// Placement-phase allocations are permanent; passing one here is a bug.
pub fn free(ptr: NonNull<u8>, layout: Layout) {
    let (size, _) = effective(layout);
    let addr = ptr.as_ptr() as usize;
    debug_assert!(
        (KERNEL_KMEM_BASE as usize..(KERNEL_KMEM_BASE + KERNEL_KMEM_SIZE) as usize)
            .contains(&addr),
        "kmem: free of non-heap pointer {addr:#010x}"
    );

    let mut heap = HEAP.lock();
    assert!(heap.ready, "kmem: free before heap init");

    // Insert sorted by address, coalescing with both neighbours.
    let head_ptr: *mut *mut FreeBlock = &mut heap.head;
    let mut prev = head_ptr;
    unsafe {
        while !(*prev).is_null() && (*prev as usize) < addr {
            prev = &mut (**prev).next;
        }

        let next = *prev;
        let block = addr as *mut FreeBlock;
        (*block).size = size;
        (*block).next = next;
        *prev = block;

        // Merge with successor.
        if !next.is_null() && addr + (*block).size == next as usize {
            (*block).size += (*next).size;
            (*block).next = (*next).next;
        }

        // Merge with predecessor (prev points into its header unless it
        // is the list head).
        if prev != head_ptr {
            let pred = (prev as usize - core::mem::offset_of!(FreeBlock, next))
                as *mut FreeBlock;
            if pred as usize + (*pred).size == addr {
                (*pred).size += (*block).size;
                (*pred).next = (*block).next;
            }
        }
    }
}

/// Allocate `size` bytes of page-aligned storage and report both its
/// virtual and physical address — the mode page tables and directories are
/// allocated with.
///
/// During the placement phase the two addresses coincide; afterwards the
/// physical address comes from a kernel page-table walk. The storage is
/// zeroed.
pub fn alloc_pages(size: usize) -> Option<(NonNull<u8>, PhysAddr)> {
    debug_assert!(size % PAGE_SIZE as usize == 0);
    let layout = Layout::from_size_align(size, PAGE_SIZE as usize).ok()?;
    let ptr = alloc(layout)?;

    let virt = ptr.as_ptr() as u32;
    let phys = if HEAP.lock().ready {
        mmu::kernel_translate(kvmem::VirtAddr::new(virt))?
    } else {
        PhysAddr::new(virt)
    };

    // SAFETY: freshly allocated, exclusively owned.
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
    Some((ptr, phys))
}

/// Release storage from [`alloc_pages`].
pub fn free_pages(ptr: NonNull<u8>, size: usize) {
    let layout = Layout::from_size_align(size, PAGE_SIZE as usize)
        .expect("kmem: bad free_pages layout");
    free(ptr, layout);
}

/// Canonical (size, align) so that every carve is a multiple of the block
/// header and dealloc recomputes the identical size from the layout.
fn effective(layout: Layout) -> (usize, usize) {
    let size = align_up(layout.size().max(MIN_BLOCK_SIZE), MIN_BLOCK_SIZE);
    let align = layout.align().max(core::mem::align_of::<FreeBlock>());
    (size, align)
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// =============================================================================
// GlobalAlloc — Box/Vec support for the rest of the kernel
// =============================================================================

struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match crate::memory::kmem::alloc(layout) {
            Some(ptr) => ptr.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            free(ptr, layout);
        }
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;
