// =============================================================================
// Protium — Kernel Synchronization Primitives
// =============================================================================
//
// This module provides synchronization primitives for the kernel.
// In a kernel, we can't use std::sync (there is no std). We need our own
// primitives that work in a bare-metal, interrupt-driven environment.
//
// Lock ordering rules:
//   Level 1 (innermost): PMM bitmap lock
//   Level 2: Kernel heap lock
//   Level 3: Per-context MMU lock
//   Level 4 (outermost): Trap dispatch table lock
//
// NEVER acquire a lower-level lock while holding a higher-level lock.
// =============================================================================

pub mod spinlock;
