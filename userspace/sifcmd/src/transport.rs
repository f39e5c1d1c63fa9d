// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Packet transport contract towards the remote processor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Exercised through `host::HostTransport`
//!
//! The transport is assumed reliable: sends cannot fail from the point of view
//! of this layer.

/// Bulk copy from local memory to the remote side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaTransfer {
    /// Local source address.
    pub src: u32,
    /// Remote destination address.
    pub dst: u32,
    /// Bytes to copy.
    pub size: u32,
    /// Transfer attributes (0 for plain copies).
    pub flags: u32,
}

/// Link to the remote processor.
pub trait Transport {
    /// Sends an encoded command packet.
    fn send_packet(&mut self, packet: &[u8]);

    /// Queues a bulk transfer to the remote side.
    fn request_bulk_transfer(&mut self, transfer: DmaTransfer);

    /// Copies `size` bytes from remote `src` into local `dst`.
    fn fetch_remote(&mut self, src: u32, dst: u32, size: u32);

    /// Returns the reply at local `reply_addr` for a call addressed to `server_id`.
    fn send_call_reply(&mut self, server_id: u32, reply_addr: u32);

    /// Makes `server_id` reachable for inbound calls.
    fn register_server(&mut self, server_id: u32);

    /// Removes `server_id`.
    fn unregister_server(&mut self, server_id: u32);

    /// Whether `server_id` is reachable.
    fn is_server_registered(&self, server_id: u32) -> bool;
}
