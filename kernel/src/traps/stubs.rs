//! Exception and IRQ entry stubs.
//!
//! The CPU pushes an error code for some exceptions and nothing for the
//! rest; the stubs normalize that by pushing a dummy zero where needed,
//! then the vector number, so `trap_common` can build one uniform
//! [`Registers`](super::Registers) snapshot for every vector. The snapshot
//! layout must match that struct field for field.

core::arch::global_asm!(
    r#"
.macro ISR_NOERR n
.global isr\n
isr\n:
    push 0
    push \n
    jmp trap_common
.endm

.macro ISR_ERR n
.global isr\n
isr\n:
    push \n
    jmp trap_common
.endm

// CPU exceptions 0-31. Vectors 8, 10-14 and 17 push a real error code.
ISR_NOERR 0
ISR_NOERR 1
ISR_NOERR 2
ISR_NOERR 3
ISR_NOERR 4
ISR_NOERR 5
ISR_NOERR 6
ISR_NOERR 7
ISR_ERR   8
ISR_NOERR 9
ISR_ERR   10
ISR_ERR   11
ISR_ERR   12
ISR_ERR   13
ISR_ERR   14
ISR_NOERR 15
ISR_NOERR 16
ISR_ERR   17
ISR_NOERR 18
ISR_NOERR 19
ISR_NOERR 20
ISR_NOERR 21
ISR_NOERR 22
ISR_NOERR 23
ISR_NOERR 24
ISR_NOERR 25
ISR_NOERR 26
ISR_NOERR 27
ISR_NOERR 28
ISR_NOERR 29
ISR_NOERR 30
ISR_NOERR 31

// Remapped hardware interrupts: master PIC 32-39, slave PIC 40-47.
ISR_NOERR 32
ISR_NOERR 33
ISR_NOERR 34
ISR_NOERR 35
ISR_NOERR 36
ISR_NOERR 37
ISR_NOERR 38
ISR_NOERR 39
ISR_NOERR 40
ISR_NOERR 41
ISR_NOERR 42
ISR_NOERR 43
ISR_NOERR 44
ISR_NOERR 45
ISR_NOERR 46
ISR_NOERR 47

// Common tail: freeze the register file, switch to kernel data segments,
// and hand a pointer to the snapshot to the Rust dispatcher.
trap_common:
    pushad
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call trap_handler
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd

// One word per stub so the IDT can be wired up in a loop.
.section .rodata
.global ISR_STUB_TABLE
.align 4
ISR_STUB_TABLE:
.irp n, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47
.long isr\n
.endr
.text
"#
);

extern "C" {
    static ISR_STUB_TABLE: [u32; super::VECTOR_COUNT];
}

/// Address of the entry stub for `vector`.
pub(super) fn stub(vector: usize) -> usize {
    unsafe { ISR_STUB_TABLE[vector] as usize }
}
