// =============================================================================
// Protium — Architecture Abstraction
// =============================================================================
//
// This module re-exports the current architecture's low-level code.
// Currently only 32-bit x86 is supported. The rest of the kernel uses
// `crate::arch::*` and never references the architecture module directly.
//
// To add a new architecture:
//   1. Create `arch/<name>/mod.rs` with the same public interface
//   2. Add a `#[cfg(target_arch = "<name>")]` here
//   3. Everything else just works
// =============================================================================

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(target_arch = "x86")]
pub use x86::*;
