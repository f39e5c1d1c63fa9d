// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Guest scheduler contract (threads and semaphores)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Exercised through `host::HostScheduler`

use thiserror::Error;

/// Guest semaphore handle.
pub type SemaphoreId = u32;

/// Guest thread handle.
pub type ThreadId = u32;

/// Failure reported by the guest kernel, carrying its negative result code.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("guest kernel call failed with code {code}")]
pub struct KernelError {
    /// Kernel result code.
    pub code: i32,
}

/// Thread and semaphore services of the guest OS.
///
/// Waiting does not block the caller: the scheduler parks the current guest
/// thread and switches away at its next scheduling point.
pub trait Scheduler {
    /// Creates a counting semaphore.
    fn create_semaphore(&mut self, initial: u32, max: u32) -> Result<SemaphoreId, KernelError>;

    /// Parks the current guest thread on `id`.
    fn wait_semaphore(&mut self, id: SemaphoreId) -> Result<(), KernelError>;

    /// Signals `id`; `in_interrupt` selects the interrupt-context variant.
    fn signal_semaphore(&mut self, id: SemaphoreId, in_interrupt: bool) -> Result<(), KernelError>;

    /// Deletes `id`. The handle must not be used afterwards.
    fn delete_semaphore(&mut self, id: SemaphoreId) -> Result<(), KernelError>;

    /// Wakes a sleeping thread.
    fn wakeup_thread(&mut self, thread: ThreadId, in_interrupt: bool);

    /// Puts the current thread to sleep.
    fn sleep_thread(&mut self);

    /// Asks for a scheduling pass at the next opportunity.
    fn reschedule(&mut self);
}
