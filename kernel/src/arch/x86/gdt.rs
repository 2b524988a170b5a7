//! Global Descriptor Table for protected mode.
//!
//! Protium uses the flat model: code and data segments both span the full
//! 4 GiB so segmentation stays out of the way and paging does all the
//! work. The multiboot loader leaves its own GDT behind, but its location
//! is unspecified, so the kernel installs one it owns before taking any
//! interrupt.

use core::arch::asm;
use core::mem::size_of;

use spin::Once;

/// Selector of the kernel code segment (GDT entry 1).
pub const KERNEL_CS: u16 = 0x08;
/// Selector of the kernel data segment (GDT entry 2).
pub const KERNEL_DS: u16 = 0x10;

/// A segment descriptor in the GDT.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// A null descriptor (required as the first GDT entry).
    const NULL: Self = Self(0);

    /// 32-bit kernel code segment: base 0, limit 4 GiB.
    ///
    /// Access byte 0x9A (present, DPL 0, code, readable); flags 0xC
    /// (4 KiB granularity, 32-bit default operand size).
    const fn kernel_code() -> Self {
        Self(0x00CF_9A00_0000_FFFF)
    }

    /// 32-bit kernel data segment: base 0, limit 4 GiB.
    ///
    /// Access byte 0x92 (present, DPL 0, data, writable); flags 0xC.
    const fn kernel_data() -> Self {
        Self(0x00CF_9200_0000_FFFF)
    }
}

/// The Global Descriptor Table: null, kernel code, kernel data.
#[repr(C, align(8))]
struct Gdt {
    entries: [SegmentDescriptor; 3],
}

/// Pointer structure for the `lgdt` instruction.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

static GDT: Once<Gdt> = Once::new();

/// Build and load the kernel GDT, then reload every segment register.
///
/// Must run before the IDT is loaded: gate descriptors name [`KERNEL_CS`],
/// which only means something once this table is active.
pub fn init() {
    let gdt = GDT.call_once(|| Gdt {
        entries: [
            SegmentDescriptor::NULL,
            SegmentDescriptor::kernel_code(),
            SegmentDescriptor::kernel_data(),
        ],
    });

    let ptr = GdtPointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: gdt as *const Gdt as u32,
    };

    // SAFETY: the descriptors describe the same flat address space we are
    // already executing in, so reloading CS/DS/SS mid-stream is a no-op
    // from the program's point of view. The far return reloads CS.
    unsafe {
        asm!(
            "lgdt [{ptr}]",
            "mov ax, {ds}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push {cs}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            ptr = in(reg) &ptr,
            cs = const KERNEL_CS as i32,
            ds = const KERNEL_DS as i32,
            out("eax") _,
            options(preserves_flags)
        );
    }
}
