// =============================================================================
// Protium — Ticket Spinlock
// =============================================================================
//
// A ticket spinlock provides mutual exclusion for kernel data structures.
// Waiters are served in FIFO order: take a ticket, spin until the counter
// reaches it. On today's single-CPU target the spinning never happens, but
// the IRQ discipline below is what actually matters.
//
// IRQ SAFETY:
//   Interrupts are disabled on the current CPU before the lock is taken.
//   Otherwise:
//     1. Code holds lock L with interrupts enabled
//     2. An interrupt fires on the same CPU
//     3. The interrupt handler tries to acquire L
//     4. DEADLOCK — the handler spins forever, because the holder can't
//        release the lock until the handler returns
//
//   The previous interrupt state (EFLAGS.IF) is saved in the guard and
//   restored exactly on unlock, so nested lock/unlock pairs compose.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::cpu;

/// A ticket-based spinlock that disables interrupts while held.
///
/// # Examples
/// ```
/// static COUNTER: SpinLock<u32> = SpinLock::new(0);
///
/// {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// } // Lock released, interrupt state restored
/// ```
pub struct SpinLock<T> {
    /// The next ticket to be dispensed (atomically incremented by each locker).
    next_ticket: AtomicU32,

    /// The ticket number currently being served (incremented on unlock).
    now_serving: AtomicU32,

    /// The protected data. UnsafeCell is required because we mutate through
    /// a shared reference (the lock ensures exclusive access at runtime).
    data: UnsafeCell<T>,
}

// SAFETY: the lock hands the data to one holder at a time, so sharing the
// lock between contexts is safe whenever the data itself can be sent.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock wrapping the given value.
    ///
    /// This is a const fn so spinlocks can be used in statics.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts on the current CPU.
    ///
    /// Returns a guard providing `Deref`/`DerefMut` access to the data.
    /// The lock is released (and the interrupt state restored) when the
    /// guard is dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // Save the interrupt state and disable interrupts before queueing,
        // so an interrupt handler on this CPU can never deadlock against us.
        let irq_was_enabled = cpu::irq_save();

        // Take a ticket. Relaxed is enough: the acquire loop below is the
        // synchronization point.
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Acquire ordering makes the previous holder's writes visible
        // before we touch the data.
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }
}

/// RAII guard for a held spinlock.
///
/// While this guard exists the holder has exclusive access to the data and
/// interrupts are disabled on the holding CPU.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock, so access is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock, so access is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes our writes before the next holder
        // sees the incremented counter.
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        cpu::irq_restore(self.irq_was_enabled);
    }
}
