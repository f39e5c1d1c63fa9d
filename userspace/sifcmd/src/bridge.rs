// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bridge between host code and guest functions
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + `tests/rpc.rs`
//!
//! Guest functions are opaque. The execution engine queues a call and
//! re-enters the module through [`crate::SifCmd::complete`] with the
//! [`Completion`] it was given once the guest function returns.

use std::collections::BTreeSet;

use crate::{ProtocolViolation, Result};

/// Address of a guest function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestFn(pub u32);

impl GuestFn {
    /// Raw guest address.
    pub const fn addr(self) -> u32 {
        self.0
    }
}

/// What the module does when an invoked guest function returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The executing command handler finished.
    Command,
    /// The request running on `server` finished; the return value is the reply address.
    Request {
        /// Server descriptor address.
        server: u32,
    },
}

/// Guest entry points provided by the execution engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryPoints {
    /// Request loop run by RPC server threads.
    pub rpc_loop: GuestFn,
    /// Runs one request: calls the server function, then finishes the request.
    pub exec_request: GuestFn,
}

/// Execution engine of the emulated processor.
pub trait Executor {
    /// Queues a call of `function` with `args`; must not run it synchronously.
    fn invoke(&mut self, function: GuestFn, args: &[u32], on_return: Completion);

    /// Entry points of the engine's guest trampolines.
    fn entry_points(&self) -> EntryPoints;
}

/// Register and stack view of an exported-function call.
pub trait CallContext {
    /// Argument `index`; indices 4 and up are read from the guest stack.
    fn arg(&self, index: usize) -> u32;

    /// Sets the value returned to the guest.
    fn set_return(&mut self, value: u32);

    /// Transfers control to `function` instead of returning.
    fn jump(&mut self, function: GuestFn);
}

/// Servers with a request running in guest code.
#[derive(Clone, Debug, Default)]
pub(crate) struct InFlight {
    servers: BTreeSet<u32>,
}

impl InFlight {
    /// Fatal when `server` is already running a request.
    pub(crate) fn start(&mut self, server: u32) -> Result<()> {
        if !self.servers.insert(server) {
            return Err(ProtocolViolation::RequestAlreadyRunning { server }.into());
        }
        Ok(())
    }

    pub(crate) fn contains(&self, server: u32) -> bool {
        self.servers.contains(&server)
    }

    pub(crate) fn finish(&mut self, server: u32) -> Result<()> {
        if !self.servers.remove(&server) {
            return Err(ProtocolViolation::UnexpectedRequestCompletion { server }.into());
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.servers.iter().copied()
    }

    pub(crate) fn replace(&mut self, servers: BTreeSet<u32>) {
        self.servers = servers;
    }
}
