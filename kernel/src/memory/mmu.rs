// =============================================================================
// Protium — MMU Bootstrap and Kernel-Side Bindings
// =============================================================================
//
// The machine-independent mapping engine lives in the `kvmem` crate; this
// module is the kernel's half of the bargain:
//
//   - `KernelMmuEnv` implements kvmem's environment trait on top of the
//     bitmap PMM, the kernel heap, and the CPU intrinsics.
//   - The kernel MMU context and the "current address space" pointer are
//     the two process-wide singletons, initialized exactly once here.
//   - `init` performs the bootstrap dance: build the kernel context while
//     memory is still identity-addressed, then flip the paging bit with a
//     page table that describes the very code doing the flipping.
//   - The page-fault handler decodes CR2 plus the error code and panics;
//     demand paging is somebody else's kernel.
//
// BOOTSTRAP ORDERING IS LOAD-BEARING. The identity map must cover every
// byte the early boot consumed (kernel image, PMM bitmap, page tables,
// the placement cursor keeps moving while we map!) before the first
// context switch, because the instructions performing that switch are
// fetched from those pages the moment CR0.PG goes live.
// =============================================================================

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Once;

use kvmem::fault::FaultCode;
use kvmem::layout::{
    KERNEL_KMEM_BASE, KERNEL_KMEM_SIZE, KERNEL_PMAP_BASE, KERNEL_PMAP_SIZE,
};
use kvmem::{
    Context, MapError, MapFlags, MmuEnv, PageDirectory, PageTable, PhysAddr, PteFlags,
    VirtAddr, PAGE_SIZE,
};

use crate::arch::cpu;
use crate::memory::{kmem, pmm};
use crate::traps::{self, Registers};

/// The machine behind the mapping engine: frames from the PMM, table
/// storage from the kernel heap, copies and TLB control from the CPU.
struct KernelMmuEnv;

impl MmuEnv for KernelMmuEnv {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        pmm::alloc_frame()
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        pmm::free_frame(frame);
    }

    fn alloc_table(&mut self) -> Option<(NonNull<PageTable>, PhysAddr)> {
        let (ptr, phys) = kmem::alloc_pages(core::mem::size_of::<PageTable>())?;
        Some((ptr.cast(), phys))
    }

    unsafe fn free_table(&mut self, table: NonNull<PageTable>) {
        kmem::free_pages(table.cast(), core::mem::size_of::<PageTable>());
    }

    fn alloc_directory(&mut self) -> Option<(NonNull<PageDirectory>, PhysAddr)> {
        let (ptr, phys) = kmem::alloc_pages(core::mem::size_of::<PageDirectory>())?;
        Some((ptr.cast(), phys))
    }

    unsafe fn free_directory(&mut self, dir: NonNull<PageDirectory>) {
        kmem::free_pages(dir.cast(), core::mem::size_of::<PageDirectory>());
    }

    unsafe fn copy_frame(&mut self, dst: PhysAddr, src: PhysAddr) {
        // The copy runs with paging off; no interrupt may slip in between.
        let irq = cpu::irq_save();
        unsafe { cpu::copy_frame(dst.as_u32(), src.as_u32()) };
        cpu::irq_restore(irq);
    }

    fn invalidate_page(&mut self, virt: VirtAddr) {
        cpu::invlpg(virt.as_u32());
    }
}

/// The kernel address space, shared (by aliasing) with every context.
static KERNEL_CTX: Once<Context> = Once::new();

/// The context currently installed in CR3 on this CPU. Null until the
/// first switch. Only mutated inside `switch_ctx`'s IRQ-disabled window.
static CURRENT: AtomicPtr<Context> = AtomicPtr::new(core::ptr::null_mut());

/// The kernel MMU context.
///
/// # Panics
/// Before `init` has run.
pub fn kernel_ctx() -> &'static Context {
    KERNEL_CTX.get().expect("mmu: not initialized")
}

/// Build the kernel context and turn paging on. Runs exactly once, with
/// the PMM and the placement allocator already up.
pub fn init() {
    let mut env = KernelMmuEnv;

    let kernel = Context::create_kernel(&mut env).expect("mmu: no memory for kernel context");
    klog::debug!("mmu: kernel context, pdbr {}", kernel.pdbr());

    // Materialize every kernel-range page table up front (tables only, no
    // frames yet). Contexts cloned later alias these table objects, so
    // after this point the set of kernel-range tables is frozen.
    for (base, size) in [
        (KERNEL_KMEM_BASE, KERNEL_KMEM_SIZE),
        (KERNEL_PMAP_BASE, KERNEL_PMAP_SIZE),
    ] {
        let mut virt = base;
        while virt < base + size {
            kernel
                .get_page(&mut env, VirtAddr::new(virt), true)
                .expect("mmu: no memory for kernel page tables");
            virt += PAGE_SIZE;
        }
    }

    // Identity-map everything the early boot consumed, supervisor-only
    // and read-only. The loop bound re-reads the placement cursor on
    // purpose: creating page tables for low memory advances it, and those
    // new tables must be mapped (and their frames reserved) too.
    let mut virt = 0u32;
    while virt < kmem::placement_addr() + PAGE_SIZE {
        let pte = kernel
            .get_page(&mut env, VirtAddr::new(virt), true)
            .expect("mmu: no memory for identity map");
        // SAFETY: bootstrap is single-threaded; the handle is exclusive.
        unsafe {
            let pte = &mut *pte.as_ptr();
            pte.set_frame(virt >> 12);
            pte.set_flags(PteFlags::PRESENT);
        }
        pmm::reserve_frame(virt >> 12);
        virt += PAGE_SIZE;
    }
    klog::debug!("mmu: identity map covers 0..{:#010x}", virt);

    // Now give the kernel heap and physical-map regions real frames.
    // Supervisor-only and read-only, like the identity area; CR0.WP stays
    // clear, so ring 0 writes are unaffected.
    for (base, size) in [
        (KERNEL_KMEM_BASE, KERNEL_KMEM_SIZE),
        (KERNEL_PMAP_BASE, KERNEL_PMAP_SIZE),
    ] {
        let mut virt = base;
        while virt < base + size {
            let pte = kernel
                .get_page(&mut env, VirtAddr::new(virt), true)
                .expect("mmu: kernel table vanished");
            let frame = pmm::alloc_frame().expect("mmu: no frames for kernel regions");
            // SAFETY: bootstrap is single-threaded; the handle is exclusive.
            unsafe {
                let pte = &mut *pte.as_ptr();
                pte.set_frame(frame.frame());
                pte.set_flags(PteFlags::PRESENT);
            }
            virt += PAGE_SIZE;
        }
    }

    // The fault handler must be in place before the switch: from here on,
    // a bad mapping faults instead of silently corrupting memory.
    traps::register_handler(traps::PAGE_FAULT_VECTOR, page_fault);

    let kernel = KERNEL_CTX.call_once(move || kernel);

    // The first switch is the big one: it loads CR3 and sets CR0.PG.
    switch_ctx(Some(kernel));
    klog::info!("mmu: paging enabled, kernel context installed");
}

/// Install `ctx` as the current address space.
///
/// Kernel threads have no address space of their own and pass `None`: the
/// installed context is left untouched, which is fine because kernel
/// mappings are aliased into every context. Switching to the context that
/// is already installed is a no-op.
pub fn switch_ctx(ctx: Option<&Context>) {
    let Some(ctx) = ctx else { return };
    let ptr = ctx as *const Context as *mut Context;
    if CURRENT.load(Ordering::Relaxed) == ptr {
        return;
    }

    assert!(ctx.pdbr().is_page_aligned());

    // CR3 and CR0 must change as one unit as far as interrupt delivery is
    // concerned; a handler running between the two writes would observe a
    // half-switched machine.
    let irq = cpu::irq_save();
    CURRENT.store(ptr, Ordering::Relaxed);
    // SAFETY: the pdbr came from a live context whose kernel range aliases
    // ours, so the code performing this write stays mapped throughout.
    unsafe {
        cpu::write_cr3(ctx.pdbr().as_u32());
        cpu::enable_paging();
    }
    cpu::irq_restore(irq);
}

/// Create an empty user address space.
///
/// Boxed so the context has a stable address for the lifetime of its
/// process — `switch_ctx` and `destroy_ctx` compare by identity.
pub fn create_ctx() -> Option<Box<Context>> {
    Some(Box::new(Context::create(&mut KernelMmuEnv)?))
}

/// Fork-style population of `dst` from `src`: kernel-range tables are
/// aliased, userspace tables are deep-copied frame by frame.
pub fn clone_ctx(dst: &Context, src: &Context) -> Result<(), MapError> {
    dst.clone_from(&mut KernelMmuEnv, src, kernel_ctx())
}

/// Destroy a user address space, returning its frames and tables.
///
/// # Panics
/// If `ctx` is the kernel context or is currently installed.
pub fn destroy_ctx(ctx: Box<Context>) {
    assert!(
        CURRENT.load(Ordering::Relaxed) != &*ctx as *const Context as *mut Context,
        "mmu: destroying the installed context"
    );
    (*ctx).destroy(&mut KernelMmuEnv, kernel_ctx());
}

/// Map `size` bytes of fresh memory into `ctx` at `start`.
pub fn map(ctx: &Context, start: VirtAddr, size: u32, flags: MapFlags) -> Result<(), MapError> {
    ctx.map(&mut KernelMmuEnv, start, size, flags)
}

/// Remove a mapping made by [`map`].
pub fn unmap(ctx: &Context, start: VirtAddr, size: u32) -> Result<(), MapError> {
    ctx.unmap(&mut KernelMmuEnv, start, size)
}

/// Resolve a kernel virtual address against the kernel context.
pub fn kernel_translate(virt: VirtAddr) -> Option<PhysAddr> {
    kernel_ctx().translate(virt)
}

/// Exception 14. CR2 holds the faulting address; the error code says what
/// kind of access failed. This kernel has no demand paging and no swap, so
/// every page fault is a kernel bug or a wild access — dump and stop.
fn page_fault(regs: &mut Registers) {
    let faulting_addr = cpu::read_cr2();
    let code = FaultCode::from_err_code(regs.err_code);

    klog::println!("{:?}", regs);
    klog::error!(
        "Page fault({}) at {:#010x} - EIP: {:#010x}",
        code,
        faulting_addr,
        regs.eip
    );
    panic!("page fault");
}
