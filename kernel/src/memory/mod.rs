// =============================================================================
// Protium — Memory Subsystem
// =============================================================================
//
// The memory subsystem manages all physical and virtual memory in the
// kernel. It's organized into layers:
//
//   pmm.rs   — Physical Memory Manager (bitmap frame allocator)
//   kmem.rs  — kernel allocator (placement phase, then free-list heap)
//   mmu.rs   — MMU bootstrap, context switching, fault handling
//
// The virtual-memory core itself (page tables, contexts, the mapping
// engine) is the `kvmem` crate; mmu.rs binds it to this machine.
//
// Initialization order matters and is owned by `init`:
//   placement → PMM → MMU (paging on) → heap.
// =============================================================================

pub mod kmem;
pub mod mmu;
pub mod pmm;

use crate::arch::boot::{self, BootInfo};

/// Bring up the whole memory subsystem. Called once from `kmain`, before
/// anything allocates.
pub fn init(bootinfo: &BootInfo) {
    kmem::init(boot::kernel_end());
    pmm::init(bootinfo.mem_bytes);
    mmu::init();
    kmem::init_heap();

    let stats = pmm::stats();
    klog::info!(
        "memory: {} of {} frames in use after bootstrap",
        stats.used_frames,
        stats.total_frames
    );
}
