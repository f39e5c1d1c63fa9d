// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixture for the sifcmd integration suites.

#![allow(dead_code)]

use sif_wire::CommandHeader;
use sifcmd::host::{host_link, HostExecutor, HostScheduler, HostTransport, PeerLink};
use sifcmd::{CallContext, Config, EntryPoints, GuestFn, GuestMemory, SifCmd};

pub type Module = SifCmd<Vec<u8>, HostTransport, HostScheduler, HostExecutor>;

pub const RAM_SIZE: usize = 0x4_0000;
pub const INBOX: u32 = 0x2_0000;
pub const RPC_LOOP: GuestFn = GuestFn(0x0001_F000);
pub const EXEC_REQUEST: GuestFn = GuestFn(0x0001_F100);

pub fn module_with(config: Config) -> (Module, PeerLink) {
    let (transport, peer) = host_link();
    let entries = EntryPoints { rpc_loop: RPC_LOOP, exec_request: EXEC_REQUEST };
    let module = SifCmd::new(
        config,
        vec![0u8; RAM_SIZE],
        transport,
        HostScheduler::new(),
        HostExecutor::new(entries),
    )
    .expect("module fits in RAM");
    (module, peer)
}

pub fn module() -> (Module, PeerLink) {
    module_with(Config::default())
}

/// Writes a packet of `size` bytes at `addr`; the body is filled with `fill`.
pub fn stage_packet(module: &mut Module, addr: u32, command_id: u32, size: u32, fill: u8) {
    let mem = module.memory_mut();
    mem.fill(addr, size.max(12), fill).unwrap();
    mem.write(addr, &CommandHeader { command_id, size, dest: 0 }.to_bytes()).unwrap();
}

/// Delivers raw bytes as an inbound packet.
pub fn deliver(module: &mut Module, bytes: &[u8]) -> sifcmd::Result<()> {
    module.memory_mut().write(INBOX, bytes).unwrap();
    module.process_command(INBOX)
}

/// Call context backed by a plain argument array.
#[derive(Debug, Default)]
pub struct Regs {
    pub args: [u32; 10],
    pub ret: Option<u32>,
    pub jumped: Option<GuestFn>,
}

impl Regs {
    pub fn with(args: &[u32]) -> Self {
        let mut regs = Self::default();
        regs.args[..args.len()].copy_from_slice(args);
        regs
    }
}

impl CallContext for Regs {
    fn arg(&self, index: usize) -> u32 {
        self.args.get(index).copied().unwrap_or(0)
    }

    fn set_return(&mut self, value: u32) {
        self.ret = Some(value);
    }

    fn jump(&mut self, function: GuestFn) {
        self.jumped = Some(function);
    }
}
