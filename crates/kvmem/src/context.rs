//! MMU contexts (address spaces) and the mapping engine.
//!
//! A [`Context`] owns one page directory and serializes mutation through a
//! per-context lock. The kernel context is created once at bootstrap; every
//! other context starts empty and is populated either by [`Context::map`]
//! or by [`Context::clone_from`], which aliases kernel-range page tables
//! and deep-copies userspace ones.

use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::entry::{PageTable, Pde, Pte, PteFlags, ENTRIES_PER_TABLE};
use crate::{MapError, MapFlags, MmuEnv};

// =============================================================================
// Page directory
// =============================================================================

/// A page directory: the CPU-visible `pde[]` array paired with the
/// kernel-private virtual handles to the tables those entries reference.
///
/// `pde` must stay the first member — the physical address of this
/// structure doubles as the PDBR, and the CPU reads `pde[0]` at offset 0.
///
/// Invariant: `pde[i]` is present exactly when `tables[i]` is `Some`, and
/// a present `pde[i]` encodes the physical address of `tables[i]`. The two
/// arrays are only ever updated together, in [`PageDirectory::install`],
/// [`PageDirectory::alias`], and [`PageDirectory::clear_slot`].
#[repr(C, align(4096))]
pub struct PageDirectory {
    pde: [Pde; ENTRIES_PER_TABLE],
    tables: [Option<NonNull<PageTable>>; ENTRIES_PER_TABLE],
}

impl PageDirectory {
    /// An empty directory. The all-zero byte pattern is equivalent, which
    /// is why zeroed allocations are valid directories.
    pub const fn new() -> Self {
        Self {
            pde: [Pde::MISSING; ENTRIES_PER_TABLE],
            tables: [None; ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    pub fn pde(&self, slot: usize) -> Pde {
        self.pde[slot]
    }

    #[inline]
    fn table(&self, slot: usize) -> Option<NonNull<PageTable>> {
        self.tables[slot]
    }

    /// Install a freshly allocated page table in `slot`.
    fn install(&mut self, slot: usize, table: NonNull<PageTable>, phys: PhysAddr) {
        self.pde[slot] = Pde::new(phys, PteFlags::TABLE);
        self.tables[slot] = Some(table);
    }

    /// Share `src`'s table at `slot` without taking ownership.
    fn alias(&mut self, slot: usize, src: &PageDirectory) {
        self.pde[slot] = src.pde[slot];
        self.tables[slot] = src.tables[slot];
    }

    fn clear_slot(&mut self, slot: usize) {
        self.pde[slot] = Pde::MISSING;
        self.tables[slot] = None;
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Context
// =============================================================================

/// Whether a context is the singleton kernel address space or a regular
/// (per-process) one. The distinction drives the U/S bit on mapped pages
/// and forbids destroying the kernel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Kernel,
    User,
}

/// An address space: a page directory, the physical address of its `pde[]`
/// array (the PDBR), and a lock serializing mutation.
///
/// For directory slots that alias the kernel context, the context only
/// borrows — the kernel context is the unique owner, and
/// [`Context::destroy`] leaves those tables and their frames alone.
pub struct Context {
    dir: NonNull<PageDirectory>,
    pdbr: PhysAddr,
    kind: ContextKind,
    lock: Mutex<()>,
}

// SAFETY: the directory storage is exclusively owned by this context and
// only mutated under `lock`. Kernel-aliased tables are shared between
// contexts but are immutable after bootstrap.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Create an empty user address space.
    ///
    /// Post-condition: no mappings exist; the directory is valid but empty.
    pub fn create<E: MmuEnv>(env: &mut E) -> Option<Context> {
        Self::create_with(env, ContextKind::User)
    }

    /// Create the kernel address space. Called exactly once, at bootstrap.
    pub fn create_kernel<E: MmuEnv>(env: &mut E) -> Option<Context> {
        Self::create_with(env, ContextKind::Kernel)
    }

    fn create_with<E: MmuEnv>(env: &mut E, kind: ContextKind) -> Option<Context> {
        let (dir, pdbr) = env.alloc_directory()?;
        assert!(pdbr.is_page_aligned(), "PDBR must be 4 KiB aligned");
        // The all-zero byte pattern is the empty directory. Zero in place;
        // a by-value write would put an 8 KiB temporary on the boot stack.
        unsafe {
            ptr::write_bytes(dir.as_ptr().cast::<u8>(), 0, core::mem::size_of::<PageDirectory>())
        };
        Some(Context {
            dir,
            pdbr,
            kind,
            lock: Mutex::new(()),
        })
    }

    /// The physical address to load into CR3 for this address space.
    #[inline]
    pub fn pdbr(&self) -> PhysAddr {
        self.pdbr
    }

    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.kind == ContextKind::Kernel
    }

    /// The directory entry at `slot`. Diagnostic accessor; the result is a
    /// snapshot and may be stale by the time the caller looks at it.
    pub fn pde(&self, slot: usize) -> Pde {
        unsafe { self.dir.as_ref() }.pde(slot)
    }

    /// Look up the PTE covering `virt`, optionally materializing the page
    /// table for its directory slot.
    ///
    /// With `make`, a missing page table is allocated, zeroed, and
    /// installed with present/rw/user traversal flags (per-page permission
    /// bits still gate access). Without `make`, a missing table yields
    /// `None`.
    ///
    /// Writes through the returned handle are only sound while no other
    /// thread operates on this context; `map`/`unmap` do their own walks
    /// under the context lock, and bootstrap runs single-threaded.
    pub fn get_page<E: MmuEnv>(
        &self,
        env: &mut E,
        virt: VirtAddr,
        make: bool,
    ) -> Option<NonNull<Pte>> {
        let _guard = self.lock.lock();
        let dir = unsafe { &mut *self.dir.as_ptr() };
        get_page(dir, env, virt, make)
    }

    /// Map `size` bytes of fresh physical memory at `start`.
    ///
    /// Each page in `[start, start + size)` gets a newly allocated frame.
    /// Pages map user-accessible in non-kernel contexts and supervisor-only
    /// in the kernel context; they are writable exactly when `WRITE` is
    /// requested (there is no NX bit, so `EXEC` adds nothing).
    ///
    /// Existing mappings in the range are not detected; callers must not
    /// re-map. On allocation failure the already-mapped prefix is left in
    /// place and `OutOfMemory` is returned.
    pub fn map<E: MmuEnv>(
        &self,
        env: &mut E,
        start: VirtAddr,
        size: u32,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            log::debug!("map: size {:#x} invalid", size);
            return Err(MapError::Invalid);
        }
        if !flags.intersects(MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC) {
            log::debug!("map: flags {:?} invalid", flags);
            return Err(MapError::Invalid);
        }
        if !flags.contains(MapFlags::FIXED) {
            // Address-space search for a free range is not supported yet.
            return Err(MapError::Unsupported);
        }
        if !start.is_page_aligned() {
            log::debug!("map: start {} not aligned", start);
            return Err(MapError::Invalid);
        }

        let _guard = self.lock.lock();
        let dir = unsafe { &mut *self.dir.as_ptr() };

        log::debug!("map: ctx({:?}) start({}) size({:#x})", self.kind, start, size);

        let mut pte_flags = PteFlags::PRESENT;
        if !self.is_kernel() {
            pte_flags |= PteFlags::USER;
        }
        if flags.contains(MapFlags::WRITE) {
            pte_flags |= PteFlags::RW;
        }

        let end = start.as_u32() as u64 + size as u64;
        let mut virt = start.as_u32() as u64;
        while virt < end {
            let page = VirtAddr::new(virt as u32);
            let pte = get_page(dir, env, page, true).ok_or(MapError::OutOfMemory)?;
            let frame = env.alloc_frame().ok_or(MapError::OutOfMemory)?;
            let pte = unsafe { &mut *pte.as_ptr() };
            pte.set_frame(frame.frame());
            pte.set_flags(pte_flags);
            virt += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Undo a mapping made by [`Context::map`].
    ///
    /// Frees each page's frame, clears its PTE, and invalidates its TLB
    /// entry. A page in the range that is not mapped fails the whole call
    /// with `Invalid`; pages processed before the failure stay unmapped.
    /// Page tables that become empty are deliberately not reclaimed.
    pub fn unmap<E: MmuEnv>(
        &self,
        env: &mut E,
        start: VirtAddr,
        size: u32,
    ) -> Result<(), MapError> {
        if size == 0 || size % PAGE_SIZE != 0 || !start.is_page_aligned() {
            return Err(MapError::Invalid);
        }

        let _guard = self.lock.lock();
        let dir = unsafe { &mut *self.dir.as_ptr() };

        let end = start.as_u32() as u64 + size as u64;
        let mut virt = start.as_u32() as u64;
        while virt < end {
            let page = VirtAddr::new(virt as u32);
            let Some(pte) = get_page(dir, env, page, false) else {
                log::debug!("unmap: no page table for {}", page);
                return Err(MapError::Invalid);
            };
            let pte = unsafe { &mut *pte.as_ptr() };
            if !pte.is_present() {
                log::debug!("unmap: {} not mapped", page);
                return Err(MapError::Invalid);
            }
            env.free_frame(PhysAddr::from_frame(pte.frame()));
            pte.clear();
            env.invalidate_page(page);
            virt += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Populate this freshly created context from `src`.
    ///
    /// Directory slots shared with the kernel context are aliased — both
    /// contexts reference the very same page table. Every other populated
    /// slot is deep-copied: a new table, a fresh frame per present PTE
    /// (flags carried over), and a physical copy of the frame contents.
    pub fn clone_from<E: MmuEnv>(
        &self,
        env: &mut E,
        src: &Context,
        kernel: &Context,
    ) -> Result<(), MapError> {
        let _guard = self.lock.lock();
        let dst_dir = unsafe { &mut *self.dir.as_ptr() };
        let src_dir = unsafe { src.dir.as_ref() };
        let krn_dir = unsafe { kernel.dir.as_ref() };

        for i in 0..ENTRIES_PER_TABLE {
            let Some(src_table) = src_dir.table(i) else {
                continue;
            };
            if krn_dir.table(i) == Some(src_table) {
                // Kernel-range table: shared, not copied. The kernel
                // context stays the unique owner.
                dst_dir.alias(i, src_dir);
            } else {
                log::trace!("clone: deep copy of slot {}", i);
                let (table, phys) = clone_table(env, unsafe { src_table.as_ref() })
                    .ok_or(MapError::OutOfMemory)?;
                dst_dir.install(i, table, phys);
            }
        }
        Ok(())
    }

    /// Tear down a user address space, releasing everything it owns: its
    /// page directory, and the page tables and mapped frames of every slot
    /// not aliased from the kernel context.
    ///
    /// The caller must ensure the context is not installed on the CPU.
    ///
    /// # Panics
    /// If called on the kernel context.
    pub fn destroy<E: MmuEnv>(self, env: &mut E, kernel: &Context) {
        assert!(!self.is_kernel(), "cannot destroy the kernel context");

        {
            let _guard = self.lock.lock();
            let dir = unsafe { &mut *self.dir.as_ptr() };
            let krn_dir = unsafe { kernel.dir.as_ref() };

            for i in 0..ENTRIES_PER_TABLE {
                let Some(table) = dir.table(i) else {
                    continue;
                };
                if krn_dir.table(i) == Some(table) {
                    // Borrowed from the kernel context; not ours to free.
                    continue;
                }
                for pte in unsafe { table.as_ref() }.iter() {
                    if pte.is_present() {
                        env.free_frame(PhysAddr::from_frame(pte.frame()));
                    }
                }
                unsafe { env.free_table(table) };
                dir.clear_slot(i);
            }
        }
        unsafe { env.free_directory(self.dir) };
    }

    /// Walk the directory and resolve `virt` to a physical address.
    ///
    /// Deliberately lockless: the kernel heap asks for translations while
    /// the mapping engine holds the context lock (table allocation), and
    /// the kernel-range mappings being resolved are immutable after
    /// bootstrap. Concurrent userspace callers get a snapshot.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let dir = unsafe { self.dir.as_ref() };
        let table = dir.table(virt.dir_index())?;
        let pte = *unsafe { table.as_ref() }.entry(virt.table_index());
        if !pte.is_present() {
            return None;
        }
        Some(PhysAddr::from_frame(pte.frame()) + virt.page_offset())
    }

    #[cfg(test)]
    fn table_handle(&self, slot: usize) -> Option<NonNull<PageTable>> {
        unsafe { self.dir.as_ref() }.table(slot)
    }
}

/// The walk shared by `map`, `unmap`, and the public `get_page`.
fn get_page<E: MmuEnv>(
    dir: &mut PageDirectory,
    env: &mut E,
    virt: VirtAddr,
    make: bool,
) -> Option<NonNull<Pte>> {
    let dir_idx = virt.dir_index();
    let tbl_idx = virt.table_index();

    let table = match dir.table(dir_idx) {
        Some(table) => table,
        None if make => {
            let (table, phys) = env.alloc_table()?;
            unsafe { (*table.as_ptr()).zero() };
            dir.install(dir_idx, table, phys);
            table
        }
        None => {
            log::debug!("get_page: no page table for {}", virt);
            return None;
        }
    };

    Some(unsafe { NonNull::new_unchecked((*table.as_ptr()).entry_mut(tbl_idx)) })
}

/// Deep-copy one page table: fresh frames, cloned flags, physical copy of
/// each present page's contents.
fn clone_table<E: MmuEnv>(
    env: &mut E,
    src: &PageTable,
) -> Option<(NonNull<PageTable>, PhysAddr)> {
    let (table, phys) = env.alloc_table()?;
    unsafe { (*table.as_ptr()).zero() };

    for i in 0..ENTRIES_PER_TABLE {
        let src_pte = *src.entry(i);
        if !src_pte.is_present() {
            continue;
        }
        let frame = env.alloc_frame()?;
        let dst_pte = unsafe { (*table.as_ptr()).entry_mut(i) };
        dst_pte.set_frame(frame.frame());
        dst_pte.set_flags(src_pte.flags() & PteFlags::CLONED);
        unsafe { env.copy_frame(frame, PhysAddr::from_frame(src_pte.frame())) };
    }
    Some((table, phys))
}

// =============================================================================
// Tests — the engine under a mock environment
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::collections::BTreeMap;
    use std::vec::Vec;

    /// First frame number the mock allocator hands out; subsequent frames
    /// are 0x101, 0x102, …
    const FIRST_FRAME: u32 = 0x100;

    /// A fake machine: deterministic frame numbers, heap-backed frame
    /// contents so `copy_frame` is observable, and heap-backed page
    /// tables/directories with synthetic physical addresses.
    struct MockEnv {
        next_frame: u32,
        next_table_phys: u32,
        next_dir_phys: u32,
        /// Live frames and their contents, keyed by frame number.
        frames: BTreeMap<u32, Box<[u8; PAGE_SIZE as usize]>>,
        /// Synthetic physical address of every live table/directory.
        table_phys: BTreeMap<usize, u32>,
        freed_frames: Vec<u32>,
        freed_tables: Vec<usize>,
        invalidated: Vec<u32>,
        /// When set, `alloc_frame` fails after this many successes.
        frame_budget: Option<u32>,
    }

    impl MockEnv {
        fn new() -> Self {
            Self {
                next_frame: FIRST_FRAME,
                next_table_phys: 0x0100_0000,
                next_dir_phys: 0x0200_0000,
                frames: BTreeMap::new(),
                table_phys: BTreeMap::new(),
                freed_frames: Vec::new(),
                freed_tables: Vec::new(),
                invalidated: Vec::new(),
                frame_budget: None,
            }
        }

        fn frame_data(&self, frame: u32) -> &[u8; PAGE_SIZE as usize] {
            self.frames.get(&frame).expect("frame not allocated")
        }

        fn frame_data_mut(&mut self, frame: u32) -> &mut [u8; PAGE_SIZE as usize] {
            self.frames.get_mut(&frame).expect("frame not allocated")
        }

        fn phys_of_table(&self, table: NonNull<PageTable>) -> u32 {
            self.table_phys[&(table.as_ptr() as usize)]
        }
    }

    impl MmuEnv for MockEnv {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            if let Some(budget) = self.frame_budget.as_mut() {
                if *budget == 0 {
                    return None;
                }
                *budget -= 1;
            }
            let frame = self.next_frame;
            self.next_frame += 1;
            self.frames.insert(frame, Box::new([0; PAGE_SIZE as usize]));
            Some(PhysAddr::from_frame(frame))
        }

        fn free_frame(&mut self, frame: PhysAddr) {
            let n = frame.frame();
            assert!(self.frames.remove(&n).is_some(), "double free of frame {n:#x}");
            self.freed_frames.push(n);
        }

        fn alloc_table(&mut self) -> Option<(NonNull<PageTable>, PhysAddr)> {
            let table = NonNull::from(Box::leak(Box::new(PageTable::new())));
            let phys = self.next_table_phys;
            self.next_table_phys += PAGE_SIZE;
            self.table_phys.insert(table.as_ptr() as usize, phys);
            Some((table, PhysAddr::new(phys)))
        }

        unsafe fn free_table(&mut self, table: NonNull<PageTable>) {
            let key = table.as_ptr() as usize;
            assert!(self.table_phys.remove(&key).is_some(), "double free of table");
            self.freed_tables.push(key);
            drop(unsafe { Box::from_raw(table.as_ptr()) });
        }

        fn alloc_directory(&mut self) -> Option<(NonNull<PageDirectory>, PhysAddr)> {
            let dir = NonNull::from(Box::leak(Box::new(PageDirectory::new())));
            let phys = self.next_dir_phys;
            self.next_dir_phys += 2 * PAGE_SIZE;
            Some((dir, PhysAddr::new(phys)))
        }

        unsafe fn free_directory(&mut self, dir: NonNull<PageDirectory>) {
            drop(unsafe { Box::from_raw(dir.as_ptr()) });
        }

        unsafe fn copy_frame(&mut self, dst: PhysAddr, src: PhysAddr) {
            let data = *self.frame_data(src.frame());
            *self.frame_data_mut(dst.frame()) = data;
        }

        fn invalidate_page(&mut self, virt: VirtAddr) {
            self.invalidated.push(virt.as_u32());
        }
    }

    fn pte_at(ctx: &Context, env: &mut MockEnv, virt: u32) -> Pte {
        let handle = ctx
            .get_page(env, VirtAddr::new(virt), false)
            .expect("page table missing");
        unsafe { *handle.as_ptr() }
    }

    #[test]
    fn fresh_map_populates_consecutive_frames() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();

        ctx.map(
            &mut env,
            VirtAddr::new(0x4000_0000),
            0x3000,
            MapFlags::WRITE | MapFlags::FIXED,
        )
        .unwrap();

        for (i, virt) in [0x4000_0000u32, 0x4000_1000, 0x4000_2000].iter().enumerate() {
            let pte = pte_at(&ctx, &mut env, *virt);
            assert!(pte.is_present());
            assert!(pte.flags().contains(PteFlags::RW));
            assert!(pte.flags().contains(PteFlags::USER));
            assert_eq!(pte.frame(), FIRST_FRAME + i as u32);
        }
    }

    #[test]
    fn read_only_map_clears_rw() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();

        ctx.map(
            &mut env,
            VirtAddr::new(0x4010_0000),
            0x1000,
            MapFlags::READ | MapFlags::FIXED,
        )
        .unwrap();

        let pte = pte_at(&ctx, &mut env, 0x4010_0000);
        assert!(pte.is_present());
        assert!(!pte.flags().contains(PteFlags::RW));
        assert!(pte.flags().contains(PteFlags::USER));
    }

    #[test]
    fn kernel_map_is_supervisor_only() {
        let mut env = MockEnv::new();
        let kernel = Context::create_kernel(&mut env).unwrap();

        kernel
            .map(
                &mut env,
                VirtAddr::new(0xE040_0000),
                0x1000,
                MapFlags::WRITE | MapFlags::FIXED,
            )
            .unwrap();

        let pte = pte_at(&kernel, &mut env, 0xE040_0000);
        assert!(pte.is_present());
        assert!(pte.flags().contains(PteFlags::RW));
        assert!(!pte.flags().contains(PteFlags::USER));
    }

    #[test]
    fn exec_only_map_is_read_only() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();

        // No NX bit on this architecture: EXEC alone still satisfies the
        // permission check and produces a read-only page.
        ctx.map(
            &mut env,
            VirtAddr::new(0x0800_0000),
            0x1000,
            MapFlags::EXEC | MapFlags::FIXED,
        )
        .unwrap();

        let pte = pte_at(&ctx, &mut env, 0x0800_0000);
        assert!(pte.is_present());
        assert!(!pte.flags().contains(PteFlags::RW));
    }

    #[test]
    fn map_argument_validation() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();
        let wf = MapFlags::WRITE | MapFlags::FIXED;

        // Zero size.
        assert_eq!(
            ctx.map(&mut env, VirtAddr::new(0x1000), 0, wf),
            Err(MapError::Invalid)
        );
        // Misaligned size.
        assert_eq!(
            ctx.map(&mut env, VirtAddr::new(0x1000), 0x800, wf),
            Err(MapError::Invalid)
        );
        // Misaligned start under FIXED.
        assert_eq!(
            ctx.map(&mut env, VirtAddr::new(0x1234), 0x1000, wf),
            Err(MapError::Invalid)
        );
        // No permission flags at all.
        assert_eq!(
            ctx.map(&mut env, VirtAddr::new(0x1000), 0x1000, MapFlags::FIXED),
            Err(MapError::Invalid)
        );
        // Non-FIXED placement is not supported.
        assert_eq!(
            ctx.map(&mut env, VirtAddr::new(0x1000), 0x1000, MapFlags::WRITE),
            Err(MapError::Unsupported)
        );
        // Nothing was mapped by any of the rejected calls.
        assert!(ctx.get_page(&mut env, VirtAddr::new(0x1000), false).is_none());
    }

    #[test]
    fn map_unmap_round_trip_clears_mappings() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();
        let start = VirtAddr::new(0x4000_0000);

        ctx.map(&mut env, start, 0x2000, MapFlags::WRITE | MapFlags::FIXED)
            .unwrap();
        let mapped: Vec<u32> = (0..2)
            .map(|i| pte_at(&ctx, &mut env, 0x4000_0000 + i * 0x1000).frame())
            .collect();

        ctx.unmap(&mut env, start, 0x2000).unwrap();

        for i in 0..2u32 {
            let pte = pte_at(&ctx, &mut env, 0x4000_0000 + i * 0x1000);
            assert!(!pte.is_present());
        }
        // The frames went back to the allocator and the TLB entries were
        // dropped, one per page.
        assert_eq!(env.freed_frames, mapped);
        assert_eq!(env.invalidated, vec![0x4000_0000, 0x4000_1000]);
    }

    #[test]
    fn unmap_of_unmapped_page_fails() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();
        let start = VirtAddr::new(0x4000_0000);

        // Never mapped at all: even the page table is missing.
        assert_eq!(ctx.unmap(&mut env, start, 0x1000), Err(MapError::Invalid));

        // Mapped once, unmapped once — fine. Unmapped twice — Invalid.
        ctx.map(&mut env, start, 0x1000, MapFlags::WRITE | MapFlags::FIXED)
            .unwrap();
        assert_eq!(ctx.unmap(&mut env, start, 0x1000), Ok(()));
        assert_eq!(ctx.unmap(&mut env, start, 0x1000), Err(MapError::Invalid));
    }

    #[test]
    fn unmap_argument_validation() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();

        assert_eq!(
            ctx.unmap(&mut env, VirtAddr::new(0x1000), 0),
            Err(MapError::Invalid)
        );
        assert_eq!(
            ctx.unmap(&mut env, VirtAddr::new(0x1234), 0x1000),
            Err(MapError::Invalid)
        );
        assert_eq!(
            ctx.unmap(&mut env, VirtAddr::new(0x1000), 0x800),
            Err(MapError::Invalid)
        );
    }

    #[test]
    fn map_without_rollback_keeps_prefix_on_exhaustion() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();
        env.frame_budget = Some(1);

        let err = ctx
            .map(
                &mut env,
                VirtAddr::new(0x4000_0000),
                0x2000,
                MapFlags::WRITE | MapFlags::FIXED,
            )
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory);

        // The first page stayed mapped; the second never appeared.
        assert!(pte_at(&ctx, &mut env, 0x4000_0000).is_present());
        assert!(!pte_at(&ctx, &mut env, 0x4000_1000).is_present());
    }

    #[test]
    fn directory_invariant_holds_after_map() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();
        let virt = VirtAddr::new(0x4000_0000);

        ctx.map(&mut env, virt, 0x1000, MapFlags::WRITE | MapFlags::FIXED)
            .unwrap();

        let slot = virt.dir_index();
        let pde = ctx.pde(slot);
        let table = ctx.table_handle(slot).expect("table installed");
        assert!(pde.is_present());
        assert_eq!(pde.table_addr().as_u32(), env.phys_of_table(table));
        assert_eq!(pde.flags(), PteFlags::TABLE);

        // Slots never touched hold neither a PDE nor a handle.
        assert!(!ctx.pde(slot + 1).is_present());
        assert!(ctx.table_handle(slot + 1).is_none());
    }

    #[test]
    fn clone_aliases_kernel_slots() {
        let mut env = MockEnv::new();
        let kernel = Context::create_kernel(&mut env).unwrap();
        kernel
            .map(
                &mut env,
                VirtAddr::new(0xE040_0000),
                0x1000,
                MapFlags::WRITE | MapFlags::FIXED,
            )
            .unwrap();

        let proc = Context::create(&mut env).unwrap();
        proc.clone_from(&mut env, &kernel, &kernel).unwrap();

        let slot = 0xE040_0000u32 >> 22;
        assert_eq!(
            proc.table_handle(slot as usize),
            kernel.table_handle(slot as usize),
            "kernel-range slot must share the very same page table"
        );
        assert_eq!(proc.pde(slot as usize).raw(), kernel.pde(slot as usize).raw());
    }

    #[test]
    fn clone_deep_copies_user_slots() {
        let mut env = MockEnv::new();
        let kernel = Context::create_kernel(&mut env).unwrap();

        let a = Context::create(&mut env).unwrap();
        let virt = VirtAddr::new(0x1000_0000);
        a.map(&mut env, virt, 0x1000, MapFlags::WRITE | MapFlags::FIXED)
            .unwrap();

        // Scribble on the mapped page and set CPU status bits by hand.
        let a_frame = pte_at(&a, &mut env, 0x1000_0000).frame();
        env.frame_data_mut(a_frame)[0] = 0xAB;
        {
            let handle = a.get_page(&mut env, virt, false).unwrap();
            let pte = unsafe { &mut *handle.as_ptr() };
            let flags = pte.flags() | PteFlags::ACCESSED | PteFlags::DIRTY;
            pte.set_flags(flags);
        }

        let b = Context::create(&mut env).unwrap();
        b.clone_from(&mut env, &a, &kernel).unwrap();

        let slot = virt.dir_index();
        assert_ne!(
            a.table_handle(slot),
            b.table_handle(slot),
            "user tables must be distinct objects"
        );

        let a_pte = pte_at(&a, &mut env, 0x1000_0000);
        let b_pte = pte_at(&b, &mut env, 0x1000_0000);
        assert_ne!(a_pte.frame(), b_pte.frame(), "frames must be distinct");
        assert_eq!(a_pte.flags(), b_pte.flags(), "flags carry over");

        // Contents were copied, and the copy is independent.
        assert_eq!(env.frame_data(b_pte.frame())[0], 0xAB);
        env.frame_data_mut(b_pte.frame())[0] = 0xCD;
        assert_eq!(env.frame_data(a_pte.frame())[0], 0xAB);
    }

    #[test]
    fn clone_skips_empty_slots() {
        let mut env = MockEnv::new();
        let kernel = Context::create_kernel(&mut env).unwrap();
        let a = Context::create(&mut env).unwrap();
        let b = Context::create(&mut env).unwrap();

        b.clone_from(&mut env, &a, &kernel).unwrap();
        for slot in [0usize, 512, 1023] {
            assert!(b.table_handle(slot).is_none());
            assert!(!b.pde(slot).is_present());
        }
    }

    #[test]
    fn destroy_frees_owned_but_not_kernel_aliased() {
        let mut env = MockEnv::new();
        let kernel = Context::create_kernel(&mut env).unwrap();
        kernel
            .map(
                &mut env,
                VirtAddr::new(0xE040_0000),
                0x1000,
                MapFlags::WRITE | MapFlags::FIXED,
            )
            .unwrap();
        let kernel_slot = 0xE040_0000u32 >> 22;
        let kernel_table = kernel.table_handle(kernel_slot as usize).unwrap();

        let proc = Context::create(&mut env).unwrap();
        proc.clone_from(&mut env, &kernel, &kernel).unwrap();
        proc.map(
            &mut env,
            VirtAddr::new(0x1000_0000),
            0x2000,
            MapFlags::WRITE | MapFlags::FIXED,
        )
        .unwrap();
        let user_frames: Vec<u32> = (0..2)
            .map(|i| pte_at(&proc, &mut env, 0x1000_0000 + i * 0x1000).frame())
            .collect();
        let user_table = proc.table_handle(0x1000_0000usize >> 22).unwrap();

        proc.destroy(&mut env, &kernel);

        for frame in user_frames {
            assert!(env.freed_frames.contains(&frame));
        }
        assert!(env.freed_tables.contains(&(user_table.as_ptr() as usize)));
        // The kernel's table survived and is still installed.
        assert!(!env.freed_tables.contains(&(kernel_table.as_ptr() as usize)));
        assert_eq!(kernel.table_handle(kernel_slot as usize), Some(kernel_table));
    }

    #[test]
    #[should_panic(expected = "kernel context")]
    fn destroy_of_kernel_context_is_fatal() {
        let mut env = MockEnv::new();
        let kernel = Context::create_kernel(&mut env).unwrap();
        let other = Context::create_kernel(&mut env).unwrap();
        other.destroy(&mut env, &kernel);
    }

    #[test]
    fn translate_resolves_mapped_pages_only() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();
        let virt = VirtAddr::new(0x4000_0000);

        assert_eq!(ctx.translate(virt), None);
        ctx.map(&mut env, virt, 0x1000, MapFlags::WRITE | MapFlags::FIXED)
            .unwrap();

        let frame = pte_at(&ctx, &mut env, 0x4000_0000).frame();
        assert_eq!(
            ctx.translate(VirtAddr::new(0x4000_0123)),
            Some(PhysAddr::from_frame(frame) + 0x123)
        );
        assert_eq!(ctx.translate(VirtAddr::new(0x4000_1000)), None);
    }

    #[test]
    fn create_produces_an_empty_directory() {
        let mut env = MockEnv::new();
        let ctx = Context::create(&mut env).unwrap();
        assert!(ctx.pdbr().is_page_aligned());
        assert!(!ctx.is_kernel());
        for slot in 0..ENTRIES_PER_TABLE {
            assert!(!ctx.pde(slot).is_present());
        }
    }
}
