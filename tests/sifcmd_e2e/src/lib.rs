//! CONTEXT: sifcmd end-to-end test harness library
//! INTENT: Scripted remote processor driving the module over the host link
//! IDL (target): BIND/CALL → REQUEST_END, SET_SREG, user commands, inbound calls
//! DEPS: sifcmd (host backend), sif-wire (packet codec)
//! READINESS: Host backend ready; in-process link established
//! TESTS: tests/rpc_flows.rs, tests/command_flows.rs
// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use log::{debug, warn};
use sif_wire::{cmd, BindPacket, CallPacket, CommandHeader, RequestEndPacket, HEADER_LEN};
use sifcmd::desc::ServerData;
use sifcmd::host::{host_link, HostExecutor, HostScheduler, HostTransport, Invocation, PeerLink};
use sifcmd::{CallContext, Completion, Config, EntryPoints, GuestFn, GuestMemory, Result, SifCmd};

/// Module wired to the in-process backends.
pub type Module = SifCmd<Vec<u8>, HostTransport, HostScheduler, HostExecutor>;

/// Local RAM size.
pub const RAM_SIZE: usize = 0x4_0000;
/// Local address where inbound packets are staged.
pub const INBOX: u32 = 0x3_F000;
/// Remote RAM size.
pub const REMOTE_RAM_SIZE: usize = 0x1_0000;
/// Guest request loop.
pub const RPC_LOOP: GuestFn = GuestFn(0x0001_F000);
/// Guest request trampoline.
pub const EXEC_REQUEST: GuestFn = GuestFn(0x0001_F100);

/// Procedure run by a server: `(rpc number, params) -> reply`.
pub type Procedure = Box<dyn FnMut(u32, &[u8]) -> Vec<u8>>;

/// Boots a module with `config` and the peer on the other end of its link.
pub fn boot(config: Config) -> (Module, Peer) {
    let (transport, link) = host_link();
    let entries = EntryPoints { rpc_loop: RPC_LOOP, exec_request: EXEC_REQUEST };
    let module = SifCmd::new(
        config,
        vec![0u8; RAM_SIZE],
        transport,
        HostScheduler::new(),
        HostExecutor::new(entries),
    )
    .expect("module fits in RAM");
    (module, Peer::new(link))
}

struct RemoteServer {
    descriptor: u32,
    buffer: u32,
    cbuffer: u32,
    procedure: Procedure,
}

/// Remote side of the link: answers binds and calls, forwards everything else.
pub struct Peer {
    link: PeerLink,
    ram: Vec<u8>,
    servers: BTreeMap<u32, RemoteServer>,
    calls: Vec<CallPacket>,
    unhandled: Vec<Vec<u8>>,
}

impl Peer {
    fn new(link: PeerLink) -> Self {
        Self {
            link,
            ram: vec![0u8; REMOTE_RAM_SIZE],
            servers: BTreeMap::new(),
            calls: Vec::new(),
            unhandled: Vec::new(),
        }
    }

    /// Raw link, for inspecting replies and registrations.
    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    /// Remote RAM.
    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Publishes a remote server under `server_id`.
    pub fn add_server(&mut self, server_id: u32, descriptor: u32, buffer: u32, cbuffer: u32, procedure: Procedure) {
        self.servers.insert(server_id, RemoteServer { descriptor, buffer, cbuffer, procedure });
    }

    /// Call packets answered so far.
    pub fn calls(&self) -> &[CallPacket] {
        &self.calls
    }

    /// Takes the packets the peer did not answer itself.
    pub fn take_unhandled(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.unhandled)
    }

    /// Stages `bytes` in the inbox and hands them to the module.
    pub fn deliver(&self, module: &mut Module, bytes: &[u8]) -> Result<()> {
        module.memory_mut().write(INBOX, bytes)?;
        module.process_command(INBOX)
    }

    /// Applies pending transfers, then answers every queued packet.
    ///
    /// Returns the number of packets consumed.
    pub fn pump(&mut self, module: &mut Module) -> Result<usize> {
        self.apply_transfers(module)?;
        let mut handled = 0;
        while let Some(packet) = self.link.next_packet() {
            handled += 1;
            let Ok(header) = CommandHeader::decode(&packet) else {
                warn!("peer: dropping short packet ({} bytes)", packet.len());
                continue;
            };
            match header.command_id {
                cmd::BIND => self.answer_bind(module, &packet)?,
                cmd::CALL => self.answer_call(module, &packet)?,
                _ => self.unhandled.push(packet),
            }
        }
        Ok(handled)
    }

    fn apply_transfers(&mut self, module: &Module) -> Result<()> {
        for transfer in self.link.take_transfers() {
            let bytes = module.memory().read(transfer.src, transfer.size)?.to_vec();
            self.ram.write(transfer.dst, &bytes)?;
        }
        Ok(())
    }

    fn answer_bind(&mut self, module: &mut Module, packet: &[u8]) -> Result<()> {
        let Ok(bind) = BindPacket::decode(packet) else {
            warn!("peer: malformed bind");
            return Ok(());
        };
        let end = match self.servers.get(&bind.server_id) {
            Some(server) => {
                RequestEndPacket::new(cmd::BIND, bind.client, server.descriptor, server.buffer, server.cbuffer)
            }
            None => RequestEndPacket::new(cmd::BIND, bind.client, 0, 0, 0),
        };
        debug!("peer: bind {:#x} for client {:#x}", bind.server_id, bind.client);
        self.deliver(module, &end.to_bytes())
    }

    fn answer_call(&mut self, module: &mut Module, packet: &[u8]) -> Result<()> {
        let Ok(call) = CallPacket::decode(packet) else {
            warn!("peer: malformed call");
            return Ok(());
        };
        self.calls.push(call);
        let Some(server) = self.servers.values_mut().find(|s| s.descriptor == call.server) else {
            warn!("peer: call to unknown descriptor {:#x}", call.server);
            return Ok(());
        };
        let params = self.ram.read(server.buffer, call.send_size)?.to_vec();
        let mut reply = (server.procedure)(call.rpc_number, &params);
        reply.truncate(call.recv_size as usize);
        module.memory_mut().write(call.recv_addr, &reply)?;
        let end = RequestEndPacket::new(cmd::CALL, call.client, call.server, 0, 0);
        self.deliver(module, &end.to_bytes())
    }

    /// Calls the local server registered under `server_id`.
    pub fn invoke(&self, module: &mut Module, server_id: u32, method: u32, params: &[u8]) -> Result<()> {
        module.invoke_server(server_id, method, params)
    }
}

/// Runs one request posted to `queue` the way the guest request loop does.
///
/// `handler` sees the method id and parameters; its reply is stored at
/// `reply_addr`. Returns the server that ran, or `None` when the queue was empty.
pub fn serve_request<F>(module: &mut Module, queue: u32, reply_addr: u32, handler: F) -> Result<Option<u32>>
where
    F: FnOnce(u32, &[u8]) -> Vec<u8>,
{
    let server = module.get_next_request(queue)?;
    if server == 0 {
        return Ok(None);
    }
    module.exec_request(server)?;
    let Some(invocation) = module.executor_mut().next_invocation() else {
        return Ok(None);
    };
    let desc = ServerData::at(server);
    let method = desc.rid(module.memory())?;
    let size = desc.rsize(module.memory())?;
    let buffer = desc.buffer(module.memory())?;
    let params = if buffer == 0 { Vec::new() } else { module.memory().read(buffer, size)?.to_vec() };
    let reply = handler(method, &params);
    module.memory_mut().write(reply_addr, &reply)?;
    module.complete(invocation.on_return, reply_addr)?;
    Ok(Some(server))
}

/// Runs queued command handlers until none is left.
///
/// `handler` sees the invocation and the packet it was started for.
/// Returns the number of handlers run.
pub fn drain_commands<F>(module: &mut Module, mut handler: F) -> Result<usize>
where
    F: FnMut(&Invocation, &[u8]),
{
    let mut ran = 0;
    while let Some(invocation) = module.executor_mut().next_invocation() {
        if invocation.on_return == Completion::Command {
            let packet = invocation.args.first().copied().unwrap_or(0);
            let size = CommandHeader::decode(module.memory().read(packet, HEADER_LEN as u32)?)
                .map_or(HEADER_LEN, |header| header.packet_len().max(HEADER_LEN)) as u32;
            let bytes = module.memory().read(packet, size)?.to_vec();
            handler(&invocation, &bytes);
            ran += 1;
        }
        module.complete(invocation.on_return, 0)?;
    }
    Ok(ran)
}

/// Call context backed by a plain argument array.
#[derive(Debug, Default)]
pub struct Regs {
    /// Argument registers.
    pub args: [u32; 10],
    /// Value returned to the guest.
    pub ret: Option<u32>,
    /// Function the guest continues in.
    pub jumped: Option<GuestFn>,
}

impl Regs {
    /// Context whose leading arguments are `args`.
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
