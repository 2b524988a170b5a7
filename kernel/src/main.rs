//! Protium kernel entry point.
//!
//! The multiboot stub in `arch::boot` lands here with protected mode on
//! and paging off. Bring-up order is rigid: logging first (so everything
//! later can speak), then segments and traps (so a bad memory access
//! faults loudly instead of rebooting), then the memory subsystem, which
//! ends with paging enabled and the kernel address space installed.

#![no_std]
#![no_main]

extern crate alloc;

mod arch;
mod memory;
mod sync;
mod traps;
mod util;

use arch::boot::{BootInfo, MultibootInfo};
use kvmem::layout::KERNEL_KMEM_BASE;
use kvmem::{MapFlags, VirtAddr, PAGE_SIZE};
use memory::mmu;

/// Kernel entry point, called from the multiboot stub with the loader's
/// magic value and boot information pointer.
#[no_mangle]
extern "C" fn kmain(magic: u32, info: *const MultibootInfo) -> ! {
    klog::init();
    klog::println!("Protium {}", env!("CARGO_PKG_VERSION"));

    // SAFETY: magic/info come straight from the multiboot handoff.
    let bootinfo = unsafe { BootInfo::parse(magic, info) };
    klog::info!("boot: {} MiB of physical memory", bootinfo.mem_bytes / 1024 / 1024);

    arch::gdt::init();
    traps::init();
    memory::init(&bootinfo);

    mmu_selfcheck();

    klog::info!("boot complete, idling");
    loop {
        arch::cpu::enable_interrupts();
        arch::cpu::halt();
    }
}

/// Exercise the MMU on the live machine: map a user page, fork the
/// address space, and prove the fork both aliases the kernel range and
/// deep-copies userspace. Failures here are failures of the paging
/// bring-up, caught while the machine state is still simple to debug.
fn mmu_selfcheck() {
    let kernel = mmu::kernel_ctx();
    let probe = VirtAddr::new(0x1000_0000);
    let probe_ptr = probe.as_mut_ptr::<u32>();

    // A fresh address space with one writable user page.
    let a = mmu::create_ctx().expect("self-check: create_ctx failed");
    mmu::clone_ctx(&a, kernel).expect("self-check: clone from kernel failed");
    mmu::map(&a, probe, PAGE_SIZE, MapFlags::WRITE | MapFlags::FIXED)
        .expect("self-check: map failed");

    mmu::switch_ctx(Some(&a));
    // SAFETY: just mapped in the installed context; nothing else uses it.
    unsafe {
        probe_ptr.write_volatile(0xCAFE_BABE);
        assert_eq!(probe_ptr.read_volatile(), 0xCAFE_BABE);
    }

    // Fork. The kernel-range slots must alias (same PDE word); the probe's
    // slot must be a distinct deep copy with equal contents.
    let b = mmu::create_ctx().expect("self-check: second create_ctx failed");
    mmu::clone_ctx(&b, &a).expect("self-check: clone failed");
    let kmem_slot = VirtAddr::new(KERNEL_KMEM_BASE).dir_index();
    assert_eq!(b.pde(kmem_slot).raw(), kernel.pde(kmem_slot).raw());
    assert_ne!(b.pde(probe.dir_index()).raw(), a.pde(probe.dir_index()).raw());

    mmu::switch_ctx(Some(&b));
    // SAFETY: the fork deep-copied the probe page into this context.
    unsafe {
        assert_eq!(probe_ptr.read_volatile(), 0xCAFE_BABE);
        probe_ptr.write_volatile(0xDEAD_BEEF);
    }

    // Writes in the fork must not leak back into the parent.
    mmu::switch_ctx(Some(&a));
    // SAFETY: `a`'s own copy of the probe page is installed again.
    unsafe {
        assert_eq!(probe_ptr.read_volatile(), 0xCAFE_BABE);
    }

    mmu::destroy_ctx(b);
    mmu::unmap(&a, probe, PAGE_SIZE).expect("self-check: unmap failed");
    assert!(mmu::unmap(&a, probe, PAGE_SIZE).is_err());

    mmu::switch_ctx(Some(kernel));
    mmu::destroy_ctx(a);

    klog::info!("mmu: self-check passed");
}
