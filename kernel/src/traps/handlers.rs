//! Default handling for unclaimed CPU exceptions.

use super::Registers;

/// Exception names for diagnostics, indexed by vector.
const EXCEPTION_NAMES: [&str; 32] = [
    "Divide Error",             // 0
    "Debug",                    // 1
    "NMI",                      // 2
    "Breakpoint",               // 3
    "Overflow",                 // 4
    "Bound Range Exceeded",     // 5
    "Invalid Opcode",           // 6
    "Device Not Available",     // 7
    "Double Fault",             // 8
    "Coprocessor Segment",      // 9
    "Invalid TSS",              // 10
    "Segment Not Present",      // 11
    "Stack-Segment Fault",      // 12
    "General Protection",       // 13
    "Page Fault",               // 14
    "Reserved",                 // 15
    "x87 FPU Error",            // 16
    "Alignment Check",          // 17
    "Machine Check",            // 18
    "SIMD Exception",           // 19
    "Virtualization",           // 20
    "Control Protection",       // 21
    "Reserved",                 // 22
    "Reserved",                 // 23
    "Reserved",                 // 24
    "Reserved",                 // 25
    "Reserved",                 // 26
    "Reserved",                 // 27
    "Hypervisor Injection",     // 28
    "VMM Communication",        // 29
    "Security Exception",       // 30
    "Reserved",                 // 31
];

/// A vector fired that nobody registered for. For CPU exceptions that
/// means the kernel hit a condition it has no policy for — dump state and
/// stop before it can do more damage.
pub fn unhandled(regs: &mut Registers) -> ! {
    let int_no = (regs.int_no & 0xFF) as usize;
    let name = EXCEPTION_NAMES.get(int_no).copied().unwrap_or("Unknown");

    klog::error!("unhandled interrupt {}: {}", int_no, name);
    klog::println!("{:?}", regs);
    panic!("unhandled {} (vector {})", name, int_no);
}
