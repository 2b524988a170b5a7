//! Virtual address-space layout.
//!
//! These constants are contracts with the boot code and the linker script;
//! they must not drift. All values are byte addresses or byte lengths.
//!
//! ```text
//!   0x00000000 ┌──────────────────────────────┐
//!              │  user space                  │
//!   0xBFFFF000 ├──────────────────────────────┤
//!              │  (guard gap)                 │
//!   0xC0000000 ├──────────────────────────────┤
//!              │  kernel space (1 GiB)        │
//!   0xE0000000 │   ├─ kernel heap (4 MiB)     │
//!   0xE0400000 │   └─ kernel virtual / module │
//!   0xFFFFFFFF └──────────────────────────────┘
//! ```
//!
//! The physical-map area sits at `0x01000000` in every address space and is
//! identity-mapped during bootstrap along with all memory the early boot
//! consumed.

/// User address-space base.
pub const USER_BASE: u32 = 0x0000_0000;
/// User address-space size.
pub const USER_SIZE: u32 = 0xBFFF_F000;

/// Kernel address-space base.
pub const KERNEL_BASE: u32 = 0xC000_0000;
/// Kernel address-space size (1 GiB).
pub const KERNEL_SIZE: u32 = 0x4000_0000;

/// Physical map area base (identity area).
pub const KERNEL_PMAP_BASE: u32 = 0x0100_0000;
/// Physical map area size.
pub const KERNEL_PMAP_SIZE: u32 = 0x00FF_0000;

/// Kernel allocation (heap) area base.
pub const KERNEL_KMEM_BASE: u32 = 0xE000_0000;
/// Kernel allocation area size (4 MiB).
pub const KERNEL_KMEM_SIZE: u32 = 0x0040_0000;

/// Kernel virtual base address.
pub const KERNEL_VIRT_BASE: u32 = 0xE040_0000;
/// Module area base.
pub const KERNEL_MODULE_BASE: u32 = 0xE040_0000;
/// Module area size.
pub const KERNEL_MODULE_SIZE: u32 = 0x1FC0_0000;

/// Kernel stack size (8 KiB).
pub const KSTK_SIZE: u32 = 0x2000;
/// User stack size (128 KiB).
pub const USTK_SIZE: u32 = 0x2_0000;
