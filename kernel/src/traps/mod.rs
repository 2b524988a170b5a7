//! Interrupt and trap handling.
//!
//! Every vector funnels through one assembly tail into [`trap_handler`],
//! which consults a 256-entry dispatch table. CPU exceptions (vectors
//! 0-31) with no registered handler are fatal; remapped hardware
//! interrupts (32-47) are acknowledged to the PIC before dispatch and
//! silently dropped when nobody claims them.

mod handlers;
mod stubs;

use core::fmt;

use spin::Once;

use crate::arch::gdt;
use crate::arch::idt::{EntryOptions, GateType, Idt, PrivilegeLevel};
use crate::sync::spinlock::SpinLock;

/// Vectors with real entry stubs: 32 CPU exceptions + 16 remapped IRQs.
pub const VECTOR_COUNT: usize = 48;

/// The exception vector the CPU raises on a page fault.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// A frozen snapshot of the interrupted context, exactly as the entry
/// stubs lay it out on the kernel stack (lowest address first).
#[repr(C)]
pub struct Registers {
    // Data segment selectors, pushed last by the stub.
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    // General-purpose registers in `pushad` order.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// ESP as saved by `pushad`; points into the trap frame itself and is
    /// ignored by `popad`.
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // Software-pushed interrupt info.
    pub int_no: u32,
    pub err_code: u32,
    // Hardware-pushed interrupt frame.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only valid when the interrupt crossed a privilege boundary.
    pub useresp: u32,
    pub ss: u32,
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "EAX={:#010x} EBX={:#010x} ECX={:#010x} EDX={:#010x}",
            self.eax, self.ebx, self.ecx, self.edx
        )?;
        writeln!(
            f,
            "ESI={:#010x} EDI={:#010x} EBP={:#010x}",
            self.esi, self.edi, self.ebp
        )?;
        writeln!(
            f,
            "EIP={:#010x} CS={:#06x} DS={:#06x} EFLAGS={:#010x}",
            self.eip, self.cs, self.ds, self.eflags
        )?;
        write!(f, "INT={:#04x} ERR={:#010x}", self.int_no, self.err_code)
    }
}

/// A registered interrupt handler.
pub type TrapHandler = fn(&mut Registers);

/// The dispatch table. Registration is rare; lookup copies the entry out
/// so the lock is never held across a handler call.
static HANDLERS: SpinLock<[Option<TrapHandler>; 256]> = SpinLock::new([None; 256]);

static IDT: Once<Idt> = Once::new();

/// Route `vector` to `handler`, replacing any previous registration.
pub fn register_handler(vector: u8, handler: TrapHandler) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Remap the PIC out of the exception range, point every implemented
/// vector at its entry stub, and load the IDT.
///
/// The GDT must already be live: the gates name the kernel code segment.
pub fn init() {
    khal::pic::remap();

    let idt = IDT.call_once(|| {
        let mut idt = Idt::new();
        let options = EntryOptions::new()
            .set_present(true)
            .set_privilege_level(PrivilegeLevel::Ring0)
            .set_gate_type(GateType::Interrupt);
        for vector in 0..VECTOR_COUNT as u8 {
            idt.set_handler(vector, stubs::stub(vector as usize), gdt::KERNEL_CS, options);
        }
        idt
    });
    idt.load();

    klog::info!("traps: IDT loaded, PIC remapped to vectors 32-47");
}

/// The single Rust entry point for every interrupt and exception.
///
/// Called by `trap_common` with a pointer to the stack-resident register
/// snapshot; mutations through it (none today) would be restored into the
/// interrupted context by `iretd`.
#[no_mangle]
extern "C" fn trap_handler(regs: *mut Registers) {
    let regs = unsafe { &mut *regs };
    // Mask before indexing so a corrupt frame cannot walk off the table.
    let int_no = (regs.int_no & 0xFF) as u8;

    let is_irq = (khal::pic::PIC1_OFFSET..khal::pic::IRQ_LIMIT).contains(&int_no);
    if is_irq {
        // Acknowledge first: the PIC delivers nothing else until the EOI,
        // and the handler may run for a while.
        khal::pic::eoi(int_no);
    }

    let handler = HANDLERS.lock()[int_no as usize];
    match handler {
        Some(handler) => handler(regs),
        // A hardware interrupt nobody claimed is just dropped; an
        // unhandled CPU exception is not survivable.
        None if is_irq => {}
        None => handlers::unhandled(regs),
    }
}
