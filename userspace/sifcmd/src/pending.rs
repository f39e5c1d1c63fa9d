// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pending command buffer and its single-flight dispatch state
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests below + `tests/dispatch.rs` (capacity and FIFO properties)
//!
//! Packets are stored back to back starting at the buffer base, the head is
//! always at the base. The length word lives in guest memory next to the
//! buffer so guest code and snapshots see the same value.
//!
//! INVARIANTS:
//!   - `len <= capacity`; a push that does not fit writes nothing
//!   - at most one command is executing, and it is always the head

use sif_wire::{CommandHeader, HEADER_LEN};

use crate::memory::{GuestMemory, MemoryError};
use crate::{ProtocolViolation, Rejected, Result};

/// Dispatch state of the buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchState {
    /// No handler is running.
    #[default]
    Idle,
    /// The head packet's handler is running.
    Executing,
}

/// Byte FIFO of command packets in module data.
#[derive(Clone, Debug)]
pub struct PendingCommands {
    base: u32,
    capacity: u32,
    len_addr: u32,
    state: DispatchState,
}

impl PendingCommands {
    /// Buffer of `capacity` bytes at `base`, length word at `len_addr`.
    pub const fn new(base: u32, capacity: u32, len_addr: u32) -> Self {
        Self { base, capacity, len_addr, state: DispatchState::Idle }
    }

    /// Address of the head packet.
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Buffer capacity in bytes.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current dispatch state.
    pub const fn state(&self) -> DispatchState {
        self.state
    }

    /// Whether a handler is running.
    pub fn is_executing(&self) -> bool {
        self.state == DispatchState::Executing
    }

    /// Bytes currently queued.
    pub fn len<M: GuestMemory + ?Sized>(&self, mem: &M) -> core::result::Result<u32, MemoryError> {
        mem.read_u32(self.len_addr)
    }

    /// Appends the packet whose header is at `header_addr`.
    ///
    /// Packets shorter than a header or that would overflow the buffer are
    /// rejected before anything is written.
    pub fn push<M: GuestMemory + ?Sized>(&mut self, mem: &mut M, header_addr: u32) -> Result<u32> {
        let header = CommandHeader::decode(mem.read(header_addr, HEADER_LEN as u32)?)
            .map_err(|_| Rejected::MalformedPacket { command_id: 0, size: 0 })?;
        let size = header.packet_len() as u32;
        if (size as usize) < HEADER_LEN {
            return Err(Rejected::MalformedPacket { command_id: header.command_id, size }.into());
        }
        let len = self.len(mem)?;
        if len > self.capacity {
            return Err(ProtocolViolation::PendingBufferCorrupt { len, head_size: 0 }.into());
        }
        if len.checked_add(size).map_or(true, |total| total > self.capacity) {
            return Err(Rejected::Overflow { len, size, capacity: self.capacity }.into());
        }
        // Validate the source range before touching the buffer.
        mem.range(header_addr, size)?;
        mem.copy_within(header_addr, self.base + len, size)?;
        mem.write_u32(self.len_addr, len + size)?;
        Ok(len + size)
    }

    /// Header of the head packet, if any.
    pub fn head<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<Option<CommandHeader>> {
        if self.len(mem)? == 0 {
            return Ok(None);
        }
        let bytes = mem.read(self.base, HEADER_LEN as u32)?;
        let header = CommandHeader::decode(bytes)
            .map_err(|_| Rejected::MalformedPacket { command_id: 0, size: 0 })?;
        Ok(Some(header))
    }

    /// Marks the head as executing.
    pub fn begin(&mut self) {
        self.state = DispatchState::Executing;
    }

    /// Marks the executing head as done. Fatal when nothing is executing.
    pub fn finish(&mut self) -> Result<()> {
        if self.state != DispatchState::Executing {
            return Err(ProtocolViolation::NoCommandExecuting.into());
        }
        self.state = DispatchState::Idle;
        Ok(())
    }

    /// Removes the head packet and shifts the rest down. Returns the new length.
    pub fn pop_head<M: GuestMemory + ?Sized>(&mut self, mem: &mut M) -> Result<u32> {
        let Some(header) = self.head(mem)? else {
            return Ok(0);
        };
        let len = self.len(mem)?;
        let size = header.packet_len() as u32;
        // The length word is guest-writable.
        if len > self.capacity || size < HEADER_LEN as u32 || size > len {
            return Err(ProtocolViolation::PendingBufferCorrupt { len, head_size: size }.into());
        }
        let rest = len - size;
        if rest > 0 {
            mem.copy_within(self.base + size, self.base, rest)?;
        }
        mem.write_u32(self.len_addr, rest)?;
        Ok(rest)
    }

    /// Empties the buffer and returns to idle.
    pub fn reset<M: GuestMemory + ?Sized>(&mut self, mem: &mut M) -> core::result::Result<(), MemoryError> {
        self.state = DispatchState::Idle;
        mem.fill(self.base, self.capacity, 0)?;
        mem.write_u32(self.len_addr, 0)
    }

    /// Restores the dispatch state from saved state.
    pub fn restore_state(&mut self, state: DispatchState) {
        self.state = state;
    }
}
