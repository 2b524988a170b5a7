//! Protium virtual-memory core.
//!
//! This crate implements the machine-independent half of the MMU: the
//! 32-bit page-table wire format, the address-space (`Context`) type, and
//! the mapping engine that walks and populates page tables. The kernel
//! binary supplies the machine-dependent half — physical frames, the
//! page-aligned kernel heap, CR3/CR0 access — through the [`MmuEnv`] trait,
//! which also lets the engine run under a mock environment in host tests.
//!
//! # x86 (protected mode, non-PAE) paging overview
//!
//! A 32-bit virtual address is translated through two levels of tables:
//!
//! ```text
//!   Page Directory (1024 PDEs) → Page Table (1024 PTEs) → 4 KiB page
//! ```
//!
//! The address decomposes as:
//!
//! ```text
//!   31        22 21        12 11         0
//!   ┌───────────┬────────────┬───────────┐
//!   │ dir index │ table index│  offset   │
//!   │ (10 bits) │ (10 bits)  │ (12 bits) │
//!   └───────────┴────────────┴───────────┘
//! ```
//!
//! Each entry is a single 32-bit word holding a page-aligned physical
//! address in its upper 20 bits and CPU-defined flags in the lower 12:
//!
//! ```text
//!   31                 12 11    7 6   5   4   3   2   1   0
//!   ┌─────────────────────┬───────┬───┬───┬───┬───┬───┬───┬───┐
//!   │    frame number     │ avail │ D │ A │PCD│PWT│U/S│R/W│ P │
//!   └─────────────────────┴───────┴───┴───┴───┴───┴───┴───┴───┘
//! ```
//!
//! The CPU consumes physical addresses; kernel code consumes virtual
//! pointers. A [`PageDirectory`] therefore carries both views as one
//! invariant-governed record: the CPU-visible `pde[1024]` array (laid out
//! first, so its physical address is the PDBR loaded into CR3) and a
//! parallel array of kernel-virtual page-table handles. Neither is ever
//! exposed without the other.

#![cfg_attr(not(test), no_std)]

mod addr;
mod context;
mod entry;
pub mod fault;
pub mod layout;

pub use addr::{PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
pub use context::{Context, ContextKind, PageDirectory};
pub use entry::{PageTable, Pde, Pte, PteFlags, ENTRIES_PER_TABLE};

use core::ptr::NonNull;

bitflags::bitflags! {
    /// Access requested by a [`Context::map`] caller.
    ///
    /// These are request flags, not PTE bits: the engine folds them into
    /// the architecture's R/W and U/S bits. There is no NX bit on this
    /// architecture, so `EXEC` is implied by any mapping and
    /// `READ | EXEC` without `WRITE` produces a read-only page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        /// Map exactly at the requested address. This is currently the
        /// only supported placement policy.
        const FIXED = 1 << 3;
    }
}

/// Error returned by the mapping engine.
///
/// Fatal conditions (invariant violations, destroying the kernel context)
/// are not errors — they assert, and the kernel's panic handler takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Bad alignment, zero size, missing permission flags, or unmapping a
    /// page that was never mapped.
    Invalid,
    /// The caller asked for a placement policy other than `FIXED`.
    Unsupported,
    /// The frame allocator or kernel heap is exhausted. The operation is
    /// abandoned where it stopped; already-installed pages stay mapped.
    OutOfMemory,
}

impl MapError {
    /// The conventional integer form: zero is success, errors are negative.
    pub const fn code(self) -> i32 {
        match self {
            MapError::Invalid => -1,
            MapError::Unsupported => -2,
            MapError::OutOfMemory => -3,
        }
    }
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::Invalid => f.write_str("invalid argument"),
            MapError::Unsupported => f.write_str("unsupported mapping mode"),
            MapError::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

/// The services the MMU borrows from the rest of the kernel.
///
/// The engine never touches physical memory directly; everything flows
/// through this trait. The kernel implements it on top of the bitmap frame
/// allocator, the kernel heap, and the CPU intrinsics. Host tests implement
/// it with heap-backed fake frames and a deterministic allocator.
pub trait MmuEnv {
    /// Hand out one free 4 KiB physical frame. Returns a page-aligned
    /// physical address, or `None` when physical memory is exhausted.
    fn alloc_frame(&mut self) -> Option<PhysAddr>;

    /// Return a frame previously obtained from [`MmuEnv::alloc_frame`].
    fn free_frame(&mut self, frame: PhysAddr);

    /// Allocate a page-aligned, zeroed page table, returning both the
    /// kernel-virtual handle and the physical address the CPU will see.
    fn alloc_table(&mut self) -> Option<(NonNull<PageTable>, PhysAddr)>;

    /// Release a page table obtained from [`MmuEnv::alloc_table`].
    ///
    /// # Safety
    /// `table` must come from `alloc_table` on this environment and must
    /// not be referenced by any live page directory afterwards.
    unsafe fn free_table(&mut self, table: NonNull<PageTable>);

    /// Allocate a page-aligned, zeroed page directory (an all-zero byte
    /// pattern is a valid empty directory), returning the virtual handle
    /// and the physical address of its `pde[]` array (the PDBR).
    fn alloc_directory(&mut self) -> Option<(NonNull<PageDirectory>, PhysAddr)>;

    /// Release a directory obtained from [`MmuEnv::alloc_directory`].
    ///
    /// # Safety
    /// `dir` must come from `alloc_directory` on this environment and must
    /// not be installed on the CPU or referenced afterwards.
    unsafe fn free_directory(&mut self, dir: NonNull<PageDirectory>);

    /// Copy 4 KiB of physical memory from `src` to `dst`.
    ///
    /// On hardware this briefly disables paging, so the caller must be on
    /// a kernel stack whose pages are identity-mapped and must tolerate an
    /// IRQ-disabled window for the duration of the copy.
    ///
    /// # Safety
    /// Both addresses must be page-aligned, allocated frames.
    unsafe fn copy_frame(&mut self, dst: PhysAddr, src: PhysAddr);

    /// Drop any cached translation for `virt` on the local CPU.
    fn invalidate_page(&mut self, virt: VirtAddr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct_and_negative() {
        let kinds = [MapError::Invalid, MapError::Unsupported, MapError::OutOfMemory];
        for (i, a) in kinds.iter().enumerate() {
            assert!(a.code() < 0);
            for b in kinds.iter().skip(i + 1) {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn map_flags_are_disjoint() {
        let all = MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC | MapFlags::FIXED;
        assert_eq!(all.bits().count_ones(), 4);
    }
}
