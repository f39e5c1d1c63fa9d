// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Save and restore of host-side module state
//!
//! OWNERS: @runtime
//!
//! STATUS: Functional
//!
//! API_STABILITY: Unstable (file names and field names are part of the snapshot format)
//!
//! FILES:
//!   - `sifcmd/servers`: one record per server, `server_data_addr`
//!   - `sifcmd/sessions`: one record per outstanding client request
//!   - `sifcmd/dispatch`: user command table, dispatch state, running requests
//!
//! Guest memory (module data included) is saved by the host with the rest
//! of RAM; only state kept outside guest memory is written here. Server ids
//! are re-read from the restored descriptors.
//!
//! TEST_COVERAGE: Unit tests below + `tests/snapshot.rs`

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::Executor;
use crate::cmd_table::UserTable;
use crate::desc::ServerData;
use crate::memory::GuestMemory;
use crate::module::SifCmd;
use crate::pending::DispatchState;
use crate::registry::ServerInstance;
use crate::rpc::{OpKind, PendingOp};
use crate::sched::Scheduler;
use crate::transport::Transport;
use crate::{Result, LOG_TARGET};

/// Registered servers.
pub const SERVERS_FILE: &str = "sifcmd/servers";
/// Outstanding client requests.
pub const SESSIONS_FILE: &str = "sifcmd/sessions";
/// Command dispatch state.
pub const DISPATCH_FILE: &str = "sifcmd/dispatch";

const STATE_RECORD: &str = "state";

/// Errors produced while saving or restoring state.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A required file is absent from the archive.
    #[error("snapshot file {0} not found")]
    NotFound(String),
    /// A record lacks a field.
    #[error("{file}: record {record} has no field {field}")]
    MissingField {
        /// File name.
        file: String,
        /// Record name.
        record: String,
        /// Field name.
        field: &'static str,
    },
    /// A field holds a value outside its domain.
    #[error("{file}: record {record} field {field} has invalid value {value:#x}")]
    InvalidValue {
        /// File name.
        file: String,
        /// Record name.
        record: String,
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u32,
    },
    /// The archive could not encode or decode a file.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Named `u32` fields, in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    fields: IndexMap<String, u32>,
}

impl Record {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field and returns the record.
    pub fn with(mut self, field: &str, value: u32) -> Self {
        self.set(field, value);
        self
    }

    /// Sets `field`.
    pub fn set(&mut self, field: &str, value: u32) {
        self.fields.insert(field.to_string(), value);
    }

    /// Value of `field`.
    pub fn get(&self, field: &str) -> Option<u32> {
        self.fields.get(field).copied()
    }

    /// Fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, u32)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Named records, in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    records: IndexMap<String, Record>,
}

impl StateFile {
    /// Empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a record.
    pub fn insert(&mut self, name: impl Into<String>, record: Record) {
        self.records.insert(name.into(), record);
    }

    /// Record called `name`.
    pub fn get(&self, name: &str) -> Option<&Record> {
        self.records.get(name)
    }

    /// Records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.records.iter().map(|(name, record)| (name.as_str(), record))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the file has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Container the host stores snapshot files in.
pub trait Archive {
    /// Stores `file` under `path`, replacing an older copy.
    fn insert_file(&mut self, path: &str, file: StateFile) -> core::result::Result<(), SnapshotError>;

    /// Reads the file at `path`; `None` when absent.
    fn read_file(&self, path: &str) -> core::result::Result<Option<StateFile>, SnapshotError>;
}

fn require(file: &str, name: &str, record: &Record, field: &'static str) -> core::result::Result<u32, SnapshotError> {
    record.get(field).ok_or_else(|| SnapshotError::MissingField {
        file: file.to_string(),
        record: name.to_string(),
        field,
    })
}

/// Host-side state decoded from an archive, applied only once complete.
struct Restored {
    servers: Vec<u32>,
    sessions: BTreeMap<u32, PendingOp>,
    user: UserTable,
    dispatch: DispatchState,
    requests: BTreeSet<u32>,
}

fn decode_servers(file: &StateFile) -> core::result::Result<Vec<u32>, SnapshotError> {
    file.records()
        .map(|(name, record)| require(SERVERS_FILE, name, record, "server_data_addr"))
        .collect()
}

fn decode_sessions(file: &StateFile) -> core::result::Result<BTreeMap<u32, PendingOp>, SnapshotError> {
    let mut ops = BTreeMap::new();
    for (name, record) in file.records() {
        let client = require(SESSIONS_FILE, name, record, "client")?;
        let kind_id = require(SESSIONS_FILE, name, record, "kind")?;
        let kind = OpKind::from_command_id(kind_id).ok_or_else(|| SnapshotError::InvalidValue {
            file: SESSIONS_FILE.to_string(),
            record: name.to_string(),
            field: "kind",
            value: kind_id,
        })?;
        let op = PendingOp {
            kind,
            semaphore: require(SESSIONS_FILE, name, record, "semaphore")?,
            end_function: require(SESSIONS_FILE, name, record, "end_function")?,
            end_param: require(SESSIONS_FILE, name, record, "end_param")?,
        };
        ops.insert(client, op);
    }
    Ok(ops)
}

fn decode_dispatch(
    file: &StateFile,
) -> core::result::Result<(UserTable, DispatchState, BTreeSet<u32>), SnapshotError> {
    let mut user = UserTable::default();
    let mut state = DispatchState::Idle;
    let mut requests = BTreeSet::new();
    for (name, record) in file.records() {
        if name == STATE_RECORD {
            user.addr = require(DISPATCH_FILE, name, record, "user_table")?;
            user.slots = require(DISPATCH_FILE, name, record, "user_slots")?;
            state = match require(DISPATCH_FILE, name, record, "executing")? {
                0 => DispatchState::Idle,
                1 => DispatchState::Executing,
                value => {
                    return Err(SnapshotError::InvalidValue {
                        file: DISPATCH_FILE.to_string(),
                        record: name.to_string(),
                        field: "executing",
                        value,
                    })
                }
            };
        } else {
            requests.insert(require(DISPATCH_FILE, name, record, "server")?);
        }
    }
    Ok((user, state, requests))
}

impl<M: GuestMemory, T: Transport, S: Scheduler, X: Executor> SifCmd<M, T, S, X> {
    /// Writes host-side state into `archive`.
    pub fn save_state<A: Archive + ?Sized>(&self, archive: &mut A) -> Result<()> {
        let mut servers = StateFile::new();
        for (index, server) in self.servers.iter().enumerate() {
            servers.insert(
                format!("server{index}"),
                Record::new().with("server_data_addr", server.server_data_addr),
            );
        }
        archive.insert_file(SERVERS_FILE, servers)?;

        let mut sessions = StateFile::new();
        for (index, (client, op)) in self.sessions.iter().enumerate() {
            sessions.insert(
                format!("session{index}"),
                Record::new()
                    .with("client", client)
                    .with("kind", op.kind.command_id())
                    .with("semaphore", op.semaphore)
                    .with("end_function", op.end_function)
                    .with("end_param", op.end_param),
            );
        }
        archive.insert_file(SESSIONS_FILE, sessions)?;

        let user = self.commands.user();
        let mut dispatch = StateFile::new();
        dispatch.insert(
            STATE_RECORD,
            Record::new()
                .with("user_table", user.addr)
                .with("user_slots", user.slots)
                .with("executing", u32::from(self.pending.is_executing())),
        );
        for (index, server) in self.in_flight.iter().enumerate() {
            dispatch.insert(format!("request{index}"), Record::new().with("server", server));
        }
        archive.insert_file(DISPATCH_FILE, dispatch)?;
        Ok(())
    }

    /// Replaces host-side state with the contents of `archive`.
    ///
    /// Guest memory must already hold the matching RAM image. Files written
    /// before sessions and dispatch state were saved load as empty.
    pub fn load_state<A: Archive + ?Sized>(&mut self, archive: &A) -> Result<()> {
        let servers = archive
            .read_file(SERVERS_FILE)?
            .ok_or_else(|| SnapshotError::NotFound(SERVERS_FILE.to_string()))?;
        let mut restored = Restored {
            servers: decode_servers(&servers)?,
            sessions: BTreeMap::new(),
            user: UserTable::default(),
            dispatch: DispatchState::Idle,
            requests: BTreeSet::new(),
        };
        if let Some(file) = archive.read_file(SESSIONS_FILE)? {
            restored.sessions = decode_sessions(&file)?;
        }
        if let Some(file) = archive.read_file(DISPATCH_FILE)? {
            (restored.user, restored.dispatch, restored.requests) = decode_dispatch(&file)?;
        }
        let ids = restored
            .servers
            .iter()
            .map(|addr| ServerData::at(*addr).server_id(&self.memory))
            .collect::<core::result::Result<Vec<u32>, _>>()?;

        self.shutdown();
        for (server_data_addr, server_id) in restored.servers.into_iter().zip(ids) {
            self.servers.push(ServerInstance { server_id, server_data_addr });
            self.transport.register_server(server_id);
        }
        self.sessions.replace(restored.sessions);
        self.commands.restore_user(restored.user);
        self.pending.restore_state(restored.dispatch);
        self.in_flight.replace(restored.requests);
        info!(
            target: LOG_TARGET,
            "restored {} servers, {} pending rpc operations",
            self.servers.len(),
            self.sessions.len()
        );
        Ok(())
    }
}
