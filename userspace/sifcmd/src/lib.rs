// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SIF command dispatch and RPC layer of the emulated I/O processor
//!
//! OWNERS: @runtime
//!
//! STATUS: Functional
//!
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - SifCmd: module facade (command classifier, dispatch, RPC, export table)
//!   - GuestMemory / Transport / Scheduler / Executor / Archive: collaborator seams
//!   - Config: TOML-loadable module tunables
//!   - Error / ProtocolViolation / Rejected: fatal and soft failure tiers
//!
//! ERROR CONDITIONS:
//!   - Error::Protocol: the guest or the remote peer broke the RPC protocol (fatal)
//!   - Error::Rejected: malformed or unroutable input, state unchanged (soft)
//!   - Error::Memory / Error::Kernel: collaborator failures (fatal)
//!
//! DEPENDENCIES:
//!   - sif-wire: packet layouts
//!   - thiserror: error enums
//!   - log: diagnostics under the `sifcmd` target
//!   - serde / toml / serde_json / indexmap: config and snapshot records
//!   - parking_lot: shared state of the host backends (feature `backend-host`)
//!
//! TEST_COVERAGE: Unit tests per module, `tests/` integration suites, `tests/sifcmd_e2e`
//!
//! The core owns no threads. It is re-entered by the transport (inbound
//! packets, inbound calls) and by the execution engine (guest call
//! completions); all blocking is delegated to the guest scheduler.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod bridge;
pub mod cmd_table;
pub mod config;
pub mod desc;
pub mod exports;
#[cfg(feature = "backend-host")]
pub mod host;
pub mod memory;
pub mod module;
pub mod pending;
pub mod registry;
pub mod rpc;
pub mod sched;
pub mod snapshot;
pub mod sreg;
pub mod transport;

pub use bridge::{CallContext, Completion, EntryPoints, Executor, GuestFn};
pub use config::{Config, ConfigError, Layout};
pub use exports::{Export, MODULE_NAME, MODULE_VERSION};
pub use memory::{GuestMemory, MemoryError};
pub use module::SifCmd;
pub use registry::{ServerInstance, ServerRegistry};
pub use rpc::{RpcCall, ServerRegistration};
pub use sched::{KernelError, Scheduler, SemaphoreId, ThreadId};
pub use snapshot::{Archive, Record, SnapshotError, StateFile};
pub use transport::{DmaTransfer, Transport};

/// Log target used by every message of this crate.
pub const LOG_TARGET: &str = "sifcmd";

/// Result alias for SIF command operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the SIF command layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A guest memory access fell outside guest RAM.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The RPC protocol was violated; the emulated processor must halt.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    /// Input was refused and state left untouched.
    #[error("rejected: {0}")]
    Rejected(#[from] Rejected),
    /// Only the blocking (wait) RPC mode is supported.
    #[error("unsupported rpc mode {0:#x}")]
    UnsupportedMode(u32),
    /// The guest scheduler refused a semaphore operation.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// Saving or loading module state failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether the host should stop the emulated processor.
    ///
    /// Only [`Error::Rejected`] is recoverable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Rejected(_))
    }
}

/// Broken protocol invariants.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A request end named no client.
    #[error("request end without client")]
    NullClient,
    /// A bind completed without a resolved server.
    #[error("bind completion for client {client:#x} has no server")]
    UnresolvedServer {
        /// Client descriptor.
        client: u32,
    },
    /// A call completed for a client that asked for an asynchronous end function.
    #[error("call completion for client {client:#x} requests end function {end_function:#x}")]
    AsyncCompletionUnsupported {
        /// Client descriptor.
        client: u32,
        /// Guest end function that would have to run.
        end_function: u32,
    },
    /// A request end completed something other than a bind or a call.
    #[error("request end for unexpected command {0:#010x}")]
    UnexpectedCompletion(u32),
    /// A request end arrived for a client with nothing in flight.
    #[error("client {client:#x} has no pending operation")]
    NoPendingOperation {
        /// Client descriptor.
        client: u32,
    },
    /// A request end completed a different kind of operation than the one in flight.
    #[error("client {client:#x} completion does not match its pending operation")]
    CompletionMismatch {
        /// Client descriptor.
        client: u32,
    },
    /// A client issued a second request while the first is in flight.
    #[error("client {client:#x} already has a pending operation")]
    SessionBusy {
        /// Client descriptor.
        client: u32,
    },
    /// A call was issued on a client that never bound.
    #[error("client {client:#x} is not bound")]
    NotBound {
        /// Client descriptor.
        client: u32,
    },
    /// A queue that already has a server was handed to another one.
    #[error("queue {queue:#x} already serves {head:#x}")]
    QueueAlreadyBound {
        /// Queue descriptor.
        queue: u32,
        /// Server already attached.
        head: u32,
    },
    /// A request was posted into a queue whose slot is occupied.
    #[error("queue {queue:#x} already holds a request")]
    RequestSlotBusy {
        /// Queue descriptor.
        queue: u32,
    },
    /// The queue of a server serves another server.
    #[error("queue {queue:#x} is not served by {server:#x}")]
    QueueMismatch {
        /// Queue descriptor.
        queue: u32,
        /// Server descriptor.
        server: u32,
    },
    /// A server without a queue received a request.
    #[error("server {server:#x} has no queue")]
    NoQueue {
        /// Server descriptor.
        server: u32,
    },
    /// A command completion arrived while nothing was executing.
    #[error("command completion while idle")]
    NoCommandExecuting,
    /// A request completion arrived for a server with no request running.
    #[error("request completion for server {server:#x} that is not executing")]
    UnexpectedRequestCompletion {
        /// Server descriptor.
        server: u32,
    },
    /// An inbound call named a server id nobody registered.
    #[error("no server registered for id {0:#x}")]
    UnknownServer(u32),
    /// A request reached a server whose previous request is still running.
    #[error("server {server:#x} is still running a request")]
    RequestAlreadyRunning {
        /// Server descriptor.
        server: u32,
    },
    /// The pending buffer length word or head packet no longer describes a valid queue.
    #[error("pending buffer corrupt: length {len}, head packet {head_size} bytes")]
    PendingBufferCorrupt {
        /// Length word read from module data.
        len: u32,
        /// Packet length of the head header.
        head_size: u32,
    },
}

/// Soft failures: logged, counted, state unchanged.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Rejected {
    /// Shared register index outside the register file.
    #[error("shared register {0} out of range")]
    RegisterOutOfRange(u32),
    /// The addressed command table was never configured.
    #[error("command table for slot {0:#010x} is unset")]
    TableUnset(u32),
    /// Command slot outside its table.
    #[error("command slot {0:#010x} out of range")]
    SlotOutOfRange(u32),
    /// The pending buffer cannot hold the packet.
    #[error("pending buffer overflow: {len} + {size} > {capacity}")]
    Overflow {
        /// Bytes already queued.
        len: u32,
        /// Packet size.
        size: u32,
        /// Buffer capacity.
        capacity: u32,
    },
    /// The packet length does not fit the header or the packet kind.
    #[error("malformed packet {command_id:#010x} of {size} bytes")]
    MalformedPacket {
        /// Command id.
        command_id: u32,
        /// Declared size.
        size: u32,
    },
    /// The command resolved to an empty handler.
    #[error("no handler for command {0:#010x}")]
    NoHandler(u32),
    /// The handler slot lies outside guest memory.
    #[error("handler slot for command {0:#010x} is not addressable")]
    HandlerUnreadable(u32),
}

/// Counters of soft failures, one per [`Rejected`] kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Shared register index out of range.
    pub register_out_of_range: u64,
    /// Command table unset.
    pub table_unset: u64,
    /// Command slot out of range.
    pub slot_out_of_range: u64,
    /// Pending buffer overflow.
    pub overflow: u64,
    /// Malformed packets.
    pub malformed: u64,
    /// Commands without a handler.
    pub no_handler: u64,
    /// Handler slots outside guest memory.
    pub handler_unreadable: u64,
}

impl Diagnostics {
    /// Counts one soft failure.
    pub fn record(&mut self, rejected: &Rejected) {
        let counter = match rejected {
            Rejected::RegisterOutOfRange(_) => &mut self.register_out_of_range,
            Rejected::TableUnset(_) => &mut self.table_unset,
            Rejected::SlotOutOfRange(_) => &mut self.slot_out_of_range,
            Rejected::Overflow { .. } => &mut self.overflow,
            Rejected::MalformedPacket { .. } => &mut self.malformed,
            Rejected::NoHandler(_) => &mut self.no_handler,
            Rejected::HandlerUnreadable(_) => &mut self.handler_unreadable,
        };
        *counter += 1;
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.register_out_of_range
            + self.table_unset
            + self.slot_out_of_range
            + self.overflow
            + self.malformed
            + self.no_handler
            + self.handler_unreadable
    }
}
