// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process collaborators for host-based testing and embedding
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - host_link(): transport plus the peer-side handle observing it
//!   - struct HostTransport / PeerLink: shared wire state behind a mutex
//!   - struct HostScheduler: semaphore table with never-reused ids
//!   - struct HostExecutor: records guest invocations for the test to complete
//!   - struct MemoryArchive: snapshot files encoded as JSON in memory
//!
//! DEPENDENCIES:
//!   - parking_lot::Mutex: wire state shared between transport and peer
//!   - serde_json: archive encoding
//!
//! TEST_COVERAGE: Unit tests below; used by every integration suite

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::{Completion, EntryPoints, Executor, GuestFn};
use crate::sched::{KernelError, Scheduler, SemaphoreId, ThreadId};
use crate::snapshot::{Archive, SnapshotError, StateFile};
use crate::transport::{DmaTransfer, Transport};

/// Result code for an unknown semaphore handle.
pub const KE_UNKNOWN_SEMID: i32 = -408;

/// Result code for a signal past the semaphore maximum.
pub const KE_SEMA_OVF: i32 = -420;

/// Reply returned for an inbound call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallReply {
    /// Server the call was addressed to.
    pub server_id: u32,
    /// Local address of the reply data.
    pub reply_addr: u32,
}

#[derive(Debug, Default)]
struct Wire {
    packets: VecDeque<Vec<u8>>,
    transfers: Vec<DmaTransfer>,
    fetches: Vec<(u32, u32, u32)>,
    replies: Vec<CallReply>,
    servers: BTreeSet<u32>,
}

/// Creates a transport and the peer-side handle that observes it.
pub fn host_link() -> (HostTransport, PeerLink) {
    let wire = Arc::new(Mutex::new(Wire::default()));
    (HostTransport { wire: Arc::clone(&wire) }, PeerLink { wire })
}

/// Transport recording everything sent towards the remote side.
#[derive(Debug)]
pub struct HostTransport {
    wire: Arc<Mutex<Wire>>,
}

impl Transport for HostTransport {
    fn send_packet(&mut self, packet: &[u8]) {
        self.wire.lock().packets.push_back(packet.to_vec());
    }

    fn request_bulk_transfer(&mut self, transfer: DmaTransfer) {
        self.wire.lock().transfers.push(transfer);
    }

    fn fetch_remote(&mut self, src: u32, dst: u32, size: u32) {
        self.wire.lock().fetches.push((src, dst, size));
    }

    fn send_call_reply(&mut self, server_id: u32, reply_addr: u32) {
        self.wire.lock().replies.push(CallReply { server_id, reply_addr });
    }

    fn register_server(&mut self, server_id: u32) {
        self.wire.lock().servers.insert(server_id);
    }

    fn unregister_server(&mut self, server_id: u32) {
        self.wire.lock().servers.remove(&server_id);
    }

    fn is_server_registered(&self, server_id: u32) -> bool {
        self.wire.lock().servers.contains(&server_id)
    }
}

/// Remote-side view of a [`HostTransport`].
#[derive(Clone, Debug)]
pub struct PeerLink {
    wire: Arc<Mutex<Wire>>,
}

impl PeerLink {
    /// Takes the oldest unread packet.
    pub fn next_packet(&self) -> Option<Vec<u8>> {
        self.wire.lock().packets.pop_front()
    }

    /// Takes every unread packet.
    pub fn take_packets(&self) -> Vec<Vec<u8>> {
        self.wire.lock().packets.drain(..).collect()
    }

    /// Takes every bulk transfer request.
    pub fn take_transfers(&self) -> Vec<DmaTransfer> {
        std::mem::take(&mut self.wire.lock().transfers)
    }

    /// Takes every remote fetch request as `(src, dst, size)`.
    pub fn take_fetches(&self) -> Vec<(u32, u32, u32)> {
        std::mem::take(&mut self.wire.lock().fetches)
    }

    /// Takes every call reply.
    pub fn take_replies(&self) -> Vec<CallReply> {
        std::mem::take(&mut self.wire.lock().replies)
    }

    /// Server ids currently reachable.
    pub fn registered_servers(&self) -> Vec<u32> {
        self.wire.lock().servers.iter().copied().collect()
    }

    /// Registers a server id directly, as another module on the link would.
    pub fn register_foreign_server(&self, server_id: u32) {
        self.wire.lock().servers.insert(server_id);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct HostSemaphore {
    count: u32,
    max: u32,
    waiters: u32,
}

/// Scheduler bookkeeping without real threads.
///
/// Semaphore ids are handed out monotonically and never reused.
#[derive(Debug)]
pub struct HostScheduler {
    next_id: SemaphoreId,
    semaphores: BTreeMap<SemaphoreId, HostSemaphore>,
    created: u32,
    deleted: u32,
    woken: Vec<(ThreadId, bool)>,
    sleeps: u32,
    reschedules: u32,
}

impl Default for HostScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostScheduler {
    /// Empty scheduler; the first semaphore id is 1.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            semaphores: BTreeMap::new(),
            created: 0,
            deleted: 0,
            woken: Vec::new(),
            sleeps: 0,
            reschedules: 0,
        }
    }

    /// Semaphores created and not yet deleted.
    pub fn live_semaphores(&self) -> usize {
        self.semaphores.len()
    }

    /// Whether `id` is alive.
    pub fn is_live(&self, id: SemaphoreId) -> bool {
        self.semaphores.contains_key(&id)
    }

    /// Threads parked on `id`.
    pub fn waiters(&self, id: SemaphoreId) -> Option<u32> {
        self.semaphores.get(&id).map(|s| s.waiters)
    }

    /// Semaphores ever created.
    pub fn created(&self) -> u32 {
        self.created
    }

    /// Semaphores ever deleted.
    pub fn deleted(&self) -> u32 {
        self.deleted
    }

    /// Threads woken so far, with the interrupt flag used.
    pub fn woken(&self) -> &[(ThreadId, bool)] {
        &self.woken
    }

    /// Calls to `sleep_thread`.
    pub fn sleeps(&self) -> u32 {
        self.sleeps
    }

    /// Calls to `reschedule`.
    pub fn reschedules(&self) -> u32 {
        self.reschedules
    }

    fn semaphore(&mut self, id: SemaphoreId) -> Result<&mut HostSemaphore, KernelError> {
        self.semaphores.get_mut(&id).ok_or(KernelError { code: KE_UNKNOWN_SEMID })
    }
}

impl Scheduler for HostScheduler {
    fn create_semaphore(&mut self, initial: u32, max: u32) -> Result<SemaphoreId, KernelError> {
        let id = self.next_id;
        self.next_id += 1;
        self.created += 1;
        self.semaphores.insert(id, HostSemaphore { count: initial, max, waiters: 0 });
        Ok(id)
    }

    fn wait_semaphore(&mut self, id: SemaphoreId) -> Result<(), KernelError> {
        let sema = self.semaphore(id)?;
        if sema.count > 0 {
            sema.count -= 1;
        } else {
            sema.waiters += 1;
        }
        Ok(())
    }

    fn signal_semaphore(&mut self, id: SemaphoreId, _in_interrupt: bool) -> Result<(), KernelError> {
        let sema = self.semaphore(id)?;
        if sema.waiters > 0 {
            sema.waiters -= 1;
        } else if sema.count < sema.max {
            sema.count += 1;
        } else {
            return Err(KernelError { code: KE_SEMA_OVF });
        }
        Ok(())
    }

    fn delete_semaphore(&mut self, id: SemaphoreId) -> Result<(), KernelError> {
        self.semaphores.remove(&id).ok_or(KernelError { code: KE_UNKNOWN_SEMID })?;
        self.deleted += 1;
        Ok(())
    }

    fn wakeup_thread(&mut self, thread: ThreadId, in_interrupt: bool) {
        self.woken.push((thread, in_interrupt));
    }

    fn sleep_thread(&mut self) {
        self.sleeps += 1;
    }

    fn reschedule(&mut self) {
        self.reschedules += 1;
    }
}

/// Guest call queued by the module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// Function to run.
    pub function: GuestFn,
    /// Arguments in register order.
    pub args: Vec<u32>,
    /// Completion to report once the function returns.
    pub on_return: Completion,
}

/// Executor that only records invocations.
#[derive(Debug, Default)]
pub struct HostExecutor {
    entries: EntryPoints,
    queued: VecDeque<Invocation>,
}

impl HostExecutor {
    /// Executor advertising `entries`.
    pub fn new(entries: EntryPoints) -> Self {
        Self { entries, queued: VecDeque::new() }
    }

    /// Invocations not yet taken.
    pub fn invocations(&self) -> &VecDeque<Invocation> {
        &self.queued
    }

    /// Takes the oldest invocation.
    pub fn next_invocation(&mut self) -> Option<Invocation> {
        self.queued.pop_front()
    }
}

impl Executor for HostExecutor {
    fn invoke(&mut self, function: GuestFn, args: &[u32], on_return: Completion) {
        self.queued.push_back(Invocation { function, args: args.to_vec(), on_return });
    }

    fn entry_points(&self) -> EntryPoints {
        self.entries
    }
}

/// Archive keeping each file as JSON bytes.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    /// Empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Drops the file at `path`.
    pub fn remove(&mut self, path: &str) -> bool {
        self.files.remove(path).is_some()
    }
}

impl Archive for MemoryArchive {
    fn insert_file(&mut self, path: &str, file: StateFile) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec(&file)?;
        self.files.insert(path.to_string(), bytes);
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Option<StateFile>, SnapshotError> {
        match self.files.get(path) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }
}
