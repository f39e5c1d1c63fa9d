// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SIF command module facade: state, command classifier and dispatch
//!
//! OWNERS: @runtime
//!
//! STATUS: Functional
//!
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - SifCmd::new(): validate config, reserve and zero module data
//!   - SifCmd::process_command(): route an inbound packet
//!   - SifCmd::complete(): re-entry point for guest call completions
//!   - SifCmd::get_sreg() / set_cmd_buffer() / add_cmd_handler() / send_cmd() / get_other_data()
//!   - SifCmd::shutdown(): unregister every server
//!
//! INVARIANTS:
//!   - Soft failures leave state untouched and return the default value
//!   - Fatal failures are returned to the host, which halts the processor
//!
//! TEST_COVERAGE: Unit tests below + `tests/dispatch.rs`, `tests/rpc.rs`, `tests/snapshot.rs`

use log::{debug, error, info, trace, warn};
use sif_wire::{cmd, CommandHeader, SetRegisterPacket, HEADER_LEN, MAX_PACKET_LEN};

use crate::bridge::{Completion, Executor, InFlight};
use crate::cmd_table::CommandTable;
use crate::config::{Config, Layout};
use crate::memory::GuestMemory;
use crate::pending::PendingCommands;
use crate::registry::ServerRegistry;
use crate::rpc::Sessions;
use crate::sched::Scheduler;
use crate::sreg::SharedRegisters;
use crate::transport::{DmaTransfer, Transport};
use crate::{Diagnostics, Error, GuestFn, Rejected, Result, LOG_TARGET};

/// The SIF command module of the emulated I/O processor.
pub struct SifCmd<M: GuestMemory, T: Transport, S: Scheduler, X: Executor> {
    pub(crate) config: Config,
    pub(crate) layout: Layout,
    pub(crate) memory: M,
    pub(crate) transport: T,
    pub(crate) scheduler: S,
    pub(crate) executor: X,
    pub(crate) sregs: SharedRegisters,
    pub(crate) commands: CommandTable,
    pub(crate) pending: PendingCommands,
    pub(crate) servers: ServerRegistry,
    pub(crate) sessions: Sessions,
    pub(crate) in_flight: InFlight,
    pub(crate) diagnostics: Diagnostics,
}

impl<M: GuestMemory, T: Transport, S: Scheduler, X: Executor> SifCmd<M, T, S, X> {
    /// Builds the module and zeroes its data block in guest memory.
    pub fn new(config: Config, memory: M, transport: T, scheduler: S, executor: X) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        memory.range(layout.base(), layout.size())?;

        let mut module = Self {
            sregs: SharedRegisters::new(layout.registers, config.register_count),
            commands: CommandTable::new(layout.system_table, config.system_command_slots),
            pending: PendingCommands::new(layout.pending, config.pending_capacity, layout.pending_len),
            config,
            layout,
            memory,
            transport,
            scheduler,
            executor,
            servers: ServerRegistry::new(),
            sessions: Sessions::default(),
            in_flight: InFlight::default(),
            diagnostics: Diagnostics::default(),
        };
        module.sregs.clear(&mut module.memory)?;
        module.commands.clear_system(&mut module.memory)?;
        module.pending.reset(&mut module.memory)?;
        info!(
            target: LOG_TARGET,
            "module data at {:#010x}..{:#010x}",
            module.layout.base(),
            module.layout.end()
        );
        Ok(module)
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Module data layout.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Guest memory.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Mutable guest memory, for hosts delivering inbound data.
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Guest scheduler.
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Mutable guest scheduler.
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Execution engine.
    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// Mutable execution engine.
    pub fn executor_mut(&mut self) -> &mut X {
        &mut self.executor
    }

    /// Soft failure counters.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Registered servers.
    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    /// Bytes waiting in the pending command buffer.
    pub fn pending_len(&self) -> Result<u32> {
        Ok(self.pending.len(&self.memory)?)
    }

    /// Whether a command handler is running.
    pub fn is_executing_command(&self) -> bool {
        self.pending.is_executing()
    }

    /// Turns soft failures into the default value and logs fatal ones.
    pub(crate) fn settle<V: Default>(&mut self, op: &str, result: Result<V>) -> Result<V> {
        match result {
            Err(Error::Rejected(rejected)) => {
                warn!(target: LOG_TARGET, "{op}: {rejected}");
                self.diagnostics.record(&rejected);
                Ok(V::default())
            }
            Err(err) => {
                error!(target: LOG_TARGET, "{op}: {err}");
                Err(err)
            }
            ok => ok,
        }
    }

    /// Reads shared register `index`; 0 when out of range.
    pub fn get_sreg(&mut self, index: u32) -> Result<u32> {
        trace!(target: LOG_TARGET, "SifGetSreg(index = {index})");
        let result = self.sregs.get(&self.memory, index);
        self.settle("SifGetSreg", result)
    }

    /// Writes shared register `index`; no-op when out of range.
    pub fn set_sreg(&mut self, index: u32, value: u32) -> Result<()> {
        let result = self.sregs.set(&mut self.memory, index, value);
        self.settle("SetSreg", result)
    }

    /// Installs the user command table and returns the previous address.
    pub fn set_cmd_buffer(&mut self, addr: u32, slots: u32) -> u32 {
        debug!(target: LOG_TARGET, "SifSetCmdBuffer(data = {addr:#010x}, length = {slots})");
        self.commands.set_user_buffer(addr, slots)
    }

    /// Registers a command handler in the table selected by `slot`.
    pub fn add_cmd_handler(&mut self, slot: u32, handler: u32, data: u32) -> Result<()> {
        debug!(
            target: LOG_TARGET,
            "SifAddCmdHandler(pos = {slot:#010x}, handler = {handler:#010x}, data = {data:#010x})"
        );
        let result = self.commands.register(&mut self.memory, slot, handler, data);
        self.settle("SifAddCmdHandler", result)
    }

    /// Routes the inbound packet whose header is at `header_addr`.
    pub fn process_command(&mut self, header_addr: u32) -> Result<()> {
        let result = self.route(header_addr);
        self.settle("ProcessCommand", result)
    }

    fn route(&mut self, header_addr: u32) -> Result<()> {
        let header = CommandHeader::decode(self.memory.read(header_addr, HEADER_LEN as u32)?)
            .map_err(|_| Rejected::MalformedPacket { command_id: 0, size: 0 })?;
        trace!(
            target: LOG_TARGET,
            "inbound command {:#010x} ({} bytes) at {header_addr:#010x}",
            header.command_id,
            header.packet_len()
        );
        match header.command_id {
            cmd::SET_SREG => self.process_set_sreg(header_addr, header),
            cmd::IGNORED_0004 => {
                debug!(target: LOG_TARGET, "ignoring command {:#010x}", header.command_id);
                Ok(())
            }
            cmd::REQUEST_END => self.request_end(header_addr),
            _ => self.enqueue(header_addr),
        }
    }

    fn process_set_sreg(&mut self, header_addr: u32, header: CommandHeader) -> Result<()> {
        if header.packet_len() != SetRegisterPacket::LEN {
            return Err(Rejected::MalformedPacket { command_id: header.command_id, size: header.size }.into());
        }
        let frame = self.memory.read(header_addr, SetRegisterPacket::LEN as u32)?;
        let packet = SetRegisterPacket::decode(frame)
            .map_err(|_| Rejected::MalformedPacket { command_id: header.command_id, size: header.size })?;
        self.sregs.set(&mut self.memory, packet.index, packet.value)
    }

    fn enqueue(&mut self, header_addr: u32) -> Result<()> {
        let len = self.pending.push(&mut self.memory, header_addr)?;
        trace!(target: LOG_TARGET, "pending buffer now holds {len} bytes");
        if !self.pending.is_executing() {
            self.dispatch_pending()?;
        }
        Ok(())
    }

    /// Starts handlers for queued commands until one is running or the buffer is empty.
    fn dispatch_pending(&mut self) -> Result<()> {
        while !self.pending.is_executing() {
            let Some(header) = self.pending.head(&self.memory)? else {
                return Ok(());
            };
            let command_id = header.command_id;
            let resolved = match self.commands.lookup(&self.memory, command_id) {
                Ok(entry) if entry.handler != 0 => Ok(entry),
                Ok(_) => Err(Rejected::NoHandler(command_id)),
                Err(Error::Rejected(rejected)) => Err(rejected),
                Err(Error::Memory(_)) => Err(Rejected::HandlerUnreadable(command_id)),
                Err(err) => return Err(err),
            };
            match resolved {
                Ok(entry) => {
                    debug!(
                        target: LOG_TARGET,
                        "calling handler {:#010x} for command {command_id:#010x} with data {:#010x}",
                        entry.handler,
                        entry.data
                    );
                    self.pending.begin();
                    let packet = self.pending.base();
                    self.executor.invoke(GuestFn(entry.handler), &[packet, entry.data], Completion::Command);
                    self.scheduler.reschedule();
                    return Ok(());
                }
                Err(rejected) => {
                    // Dropped without ever becoming the executing command.
                    self.soft_fault("dispatch", rejected);
                    self.pending.pop_head(&mut self.memory)?;
                }
            }
        }
        Ok(())
    }

    fn soft_fault(&mut self, op: &str, rejected: Rejected) {
        warn!(target: LOG_TARGET, "{op}: {rejected}");
        self.diagnostics.record(&rejected);
    }

    /// Completes the executing command and starts the next one.
    pub(crate) fn finish_exec_cmd(&mut self) -> Result<()> {
        self.pending.finish()?;
        let rest = self.pending.pop_head(&mut self.memory)?;
        if rest > 0 {
            self.dispatch_pending()?;
        }
        Ok(())
    }

    /// Re-entry point once a guest function started by this module returns.
    pub fn complete(&mut self, completion: Completion, return_value: u32) -> Result<()> {
        let result = match completion {
            Completion::Command => self.finish_exec_cmd(),
            Completion::Request { server } => self.finish_exec_request(server, return_value),
        };
        self.settle("Complete", result)
    }

    /// Sends a raw command packet assembled by guest code. Returns 1, or 0 on a bad size.
    pub fn send_cmd(
        &mut self,
        command_id: u32,
        packet: u32,
        size: u32,
        src_extra: u32,
        dst_extra: u32,
        size_extra: u32,
    ) -> Result<u32> {
        debug!(
            target: LOG_TARGET,
            "SifSendCmd(commandId = {command_id:#010x}, packet = {packet:#010x}, size = {size:#x}, \
             srcExtra = {src_extra:#010x}, dstExtra = {dst_extra:#010x}, sizeExtra = {size_extra:#x})"
        );
        let result = self.send_raw(command_id, packet, size, src_extra, dst_extra, size_extra);
        self.settle("SifSendCmd", result)
    }

    fn send_raw(
        &mut self,
        command_id: u32,
        packet: u32,
        size: u32,
        src_extra: u32,
        dst_extra: u32,
        size_extra: u32,
    ) -> Result<u32> {
        if (size as usize) < HEADER_LEN || size as usize > MAX_PACKET_LEN {
            return Err(Rejected::MalformedPacket { command_id, size }.into());
        }
        self.memory.range(packet, size)?;
        let header = CommandHeader { command_id, size, dest: 0 };
        self.memory.write(packet, &header.to_bytes())?;
        let frame = self.memory.read(packet, size)?;
        self.transport.send_packet(frame);
        if src_extra != 0 && dst_extra != 0 && size_extra != 0 {
            self.transport.request_bulk_transfer(DmaTransfer {
                src: src_extra,
                dst: dst_extra,
                size: size_extra,
                flags: 0,
            });
        }
        Ok(1)
    }

    /// Asks the transport to copy remote data into local memory. Returns 0.
    pub fn get_other_data(&mut self, packet: u32, src: u32, dst: u32, size: u32, mode: u32) -> u32 {
        debug!(
            target: LOG_TARGET,
            "SifGetOtherData(packet = {packet:#010x}, src = {src:#010x}, dst = {dst:#010x}, size = {size:#x}, mode = {mode})"
        );
        self.transport.fetch_remote(src, dst, size);
        0
    }

    /// Unregisters every server from the transport. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        for server in self.servers.drain() {
            info!(target: LOG_TARGET, "unregistering server {:#x}", server.server_id);
            self.transport.unregister_server(server.server_id);
        }
    }
}

impl<M: GuestMemory, T: Transport, S: Scheduler, X: Executor> Drop for SifCmd<M, T, S, X> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
