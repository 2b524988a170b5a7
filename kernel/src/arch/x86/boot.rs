//! Multiboot entry point and boot information.
//!
//! GRUB (or any multiboot v1 loader) drops us in 32-bit protected mode
//! with paging off, a flat but foreign GDT, and EBX pointing at the boot
//! information structure. `_start` below establishes a known stack and
//! hands control to `kmain` with the magic value and info pointer intact.

use kvmem::layout::KSTK_SIZE;

/// The magic value a multiboot-compliant loader leaves in EAX.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

// Multiboot header: magic, flags, checksum. Flag bit 0 asks the loader for
// page-aligned modules, bit 1 for the memory fields we boot from.
core::arch::global_asm!(
    r#"
.section .multiboot, "a"
.align 4
.long 0x1BADB002
.long 0x00000003
.long -(0x1BADB002 + 0x00000003)

.section .bss
.align 16
boot_stack_bottom:
.skip {stack_size}
boot_stack_top:

.section .text
.global _start
_start:
    mov esp, offset boot_stack_top
    push ebx
    push eax
    call kmain
1:  cli
    hlt
    jmp 1b
"#,
    stack_size = const KSTK_SIZE as usize,
);

bitflags::bitflags! {
    /// Which fields of [`MultibootInfo`] the loader filled in.
    #[derive(Debug, Clone, Copy)]
    pub struct InfoFlags: u32 {
        /// `mem_lower` / `mem_upper` are valid.
        const MEMORY   = 1 << 0;
        /// A boot device is recorded.
        const BOOTDEV  = 1 << 1;
        /// A command line is present.
        const CMDLINE  = 1 << 2;
        /// Boot modules are present.
        const MODS     = 1 << 3;
    }
}

/// The prefix of the multiboot v1 information structure this kernel reads.
///
/// The full structure carries much more (ELF headers, memory map, VBE
/// info); only the conventional-memory fields matter here.
#[repr(C)]
pub struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
}

/// Boot facts extracted from the loader, in kernel-friendly units.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    /// Total physical memory in bytes, derived from `mem_upper` (KiB of
    /// extended memory above 1 MiB).
    pub mem_bytes: u32,
}

impl BootInfo {
    /// Validate the loader handoff and pull out what the kernel needs.
    ///
    /// # Safety
    /// `info` must be the pointer the multiboot loader passed in EBX, and
    /// the structure it addresses must still be intact.
    ///
    /// # Panics
    /// If `magic` is wrong or the loader did not provide memory bounds —
    /// there is no way to size physical memory without them.
    pub unsafe fn parse(magic: u32, info: *const MultibootInfo) -> BootInfo {
        assert_eq!(magic, BOOTLOADER_MAGIC, "not loaded by a multiboot loader");
        let info = unsafe { &*info };
        let flags = InfoFlags::from_bits_truncate(info.flags);
        assert!(
            flags.contains(InfoFlags::MEMORY),
            "bootloader provided no memory bounds"
        );
        klog::debug!(
            "boot: mem_lower={} KiB, mem_upper={} KiB",
            info.mem_lower,
            info.mem_upper
        );
        BootInfo {
            // mem_upper counts KiB above the first megabyte. Saturate: a
            // 32-bit kernel cannot use more than 4 GiB anyway.
            mem_bytes: (1024 + info.mem_upper).saturating_mul(1024),
        }
    }
}

extern "C" {
    static __kernel_end: u8;
}

/// First byte past the kernel image, as placed by the linker script. The
/// placement allocator starts here.
pub fn kernel_end() -> u32 {
    unsafe { &__kernel_end as *const u8 as u32 }
}
