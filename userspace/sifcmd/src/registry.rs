// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registry of locally hosted RPC servers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests below + `tests/rpc.rs`
//!
//! Entries keep insertion order; that order is what snapshots persist.

/// A server registered by guest code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerInstance {
    /// Id the remote side addresses the server by.
    pub server_id: u32,
    /// Guest address of the server descriptor.
    pub server_data_addr: u32,
}

/// Ordered set of registered servers.
#[derive(Clone, Debug, Default)]
pub struct ServerRegistry {
    servers: Vec<ServerInstance>,
}

impl ServerRegistry {
    /// Empty registry.
    pub const fn new() -> Self {
        Self { servers: Vec::new() }
    }

    /// Whether `server_id` is registered.
    pub fn contains(&self, server_id: u32) -> bool {
        self.find(server_id).is_some()
    }

    /// Entry for `server_id`.
    pub fn find(&self, server_id: u32) -> Option<&ServerInstance> {
        self.servers.iter().find(|s| s.server_id == server_id)
    }

    /// Appends an entry. Callers check for duplicates first.
    pub fn push(&mut self, instance: ServerInstance) {
        self.servers.push(instance);
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ServerInstance> {
        self.servers.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Removes and returns every entry in registration order.
    pub fn drain(&mut self) -> impl Iterator<Item = ServerInstance> + '_ {
        self.servers.drain(..)
    }
}
