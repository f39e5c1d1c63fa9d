// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RPC session protocol (bind, call, request end) and local servers
//!
//! OWNERS: @runtime
//!
//! STATUS: Functional
//!
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - SifCmd::bind_rpc() / call_rpc(): client side, block the caller until the request end
//!   - SifCmd::register_rpc() / set_rpc_queue() / get_next_request(): server side setup
//!   - SifCmd::invoke_server() / deliver_invocation(): inbound calls
//!   - SifCmd::exec_request() / rpc_loop(): request execution through the bridge
//!
//! INVARIANTS:
//!   - One pending operation per client descriptor; its semaphore is signaled and
//!     deleted exactly once, by the matching request end
//!   - A request end is fully validated before any guest memory is written
//!   - A queue's request slot is empty before a request is posted into it
//!
//! TEST_COVERAGE: Unit tests below + `tests/rpc.rs` + `tests/sifcmd_e2e`

use std::collections::BTreeMap;

use log::{debug, info};
use sif_wire::{cmd, BindPacket, CallPacket, CommandHeader, RequestEndPacket, RECV_MODE_BUFFERED};

use crate::bridge::{CallContext, Completion, Executor};
use crate::desc::{ClientData, QueueData, ServerData};
use crate::memory::{GuestMemory, MemoryError};
use crate::module::SifCmd;
use crate::registry::ServerInstance;
use crate::sched::{Scheduler, SemaphoreId};
use crate::transport::{DmaTransfer, Transport};
use crate::{Error, ProtocolViolation, Rejected, Result, LOG_TARGET};

/// Only the blocking RPC mode is implemented.
pub const RPC_MODE_WAIT: u32 = 0;

/// Kind of an outstanding client request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Waiting for a bind to resolve.
    Bind,
    /// Waiting for a call to return.
    Call,
}

impl OpKind {
    /// Command id the request end reports for this kind.
    pub const fn command_id(self) -> u32 {
        match self {
            OpKind::Bind => cmd::BIND,
            OpKind::Call => cmd::CALL,
        }
    }

    /// Kind matching a completed command id.
    pub const fn from_command_id(command_id: u32) -> Option<Self> {
        match command_id {
            cmd::BIND => Some(OpKind::Bind),
            cmd::CALL => Some(OpKind::Call),
            _ => None,
        }
    }
}

/// Outstanding request of one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingOp {
    /// Bind or call.
    pub kind: OpKind,
    /// Semaphore the issuing thread waits on.
    pub semaphore: SemaphoreId,
    /// Completion function stored by the call.
    pub end_function: u32,
    /// Argument of `end_function`.
    pub end_param: u32,
}

/// Outstanding requests keyed by client descriptor address.
#[derive(Clone, Debug, Default)]
pub struct Sessions {
    ops: BTreeMap<u32, PendingOp>,
}

impl Sessions {
    /// Outstanding request of `client`.
    pub fn get(&self, client: u32) -> Option<&PendingOp> {
        self.ops.get(&client)
    }

    /// Whether `client` has a request in flight.
    pub fn is_busy(&self, client: u32) -> bool {
        self.ops.contains_key(&client)
    }

    /// Requests in client address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &PendingOp)> {
        self.ops.iter().map(|(client, op)| (*client, op))
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn insert(&mut self, client: u32, op: PendingOp) {
        self.ops.insert(client, op);
    }

    pub(crate) fn remove(&mut self, client: u32) -> Option<PendingOp> {
        self.ops.remove(&client)
    }

    pub(crate) fn replace(&mut self, ops: BTreeMap<u32, PendingOp>) {
        self.ops = ops;
    }
}

/// Arguments of a call request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcCall {
    /// Procedure number on the remote server.
    pub rpc_number: u32,
    /// Must be [`RPC_MODE_WAIT`].
    pub mode: u32,
    /// Local parameters sent ahead of the call.
    pub send_addr: u32,
    /// Parameter size.
    pub send_size: u32,
    /// Local buffer receiving the reply.
    pub recv_addr: u32,
    /// Reply capacity.
    pub recv_size: u32,
    /// Asynchronous completion function; must be 0 by the time the call ends.
    pub end_function: u32,
    /// Argument of `end_function`.
    pub end_param: u32,
}

/// Arguments of a server registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerRegistration {
    /// Server descriptor (0 registers the id only).
    pub server: u32,
    /// Id the remote side calls.
    pub server_id: u32,
    /// Request handler.
    pub function: u32,
    /// Parameter buffer.
    pub buffer: u32,
    /// Control handler.
    pub cfunction: u32,
    /// Control buffer.
    pub cbuffer: u32,
    /// Queue serving the server (0 when none).
    pub queue: u32,
}

impl<M: GuestMemory, T: Transport, S: Scheduler, X: Executor> SifCmd<M, T, S, X> {
    /// Outstanding client requests.
    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// Requests handed to the engine and not finished yet.
    pub fn requests_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn check_mode(mode: u32) -> Result<()> {
        if mode != RPC_MODE_WAIT {
            return Err(Error::UnsupportedMode(mode));
        }
        Ok(())
    }

    fn check_idle(&self, client: u32) -> Result<()> {
        if self.sessions.is_busy(client) {
            return Err(ProtocolViolation::SessionBusy { client }.into());
        }
        Ok(())
    }

    /// Parks the calling thread on a fresh semaphore recorded for `client`.
    fn open_session(&mut self, client: u32, kind: OpKind, end_function: u32, end_param: u32) -> Result<()> {
        let semaphore = self.scheduler.create_semaphore(0, 1)?;
        ClientData::at(client).set_sema_id(&mut self.memory, semaphore)?;
        self.sessions.insert(client, PendingOp { kind, semaphore, end_function, end_param });
        self.scheduler.wait_semaphore(semaphore)?;
        Ok(())
    }

    /// Binds `client` to the remote server `server_id`. Returns 0.
    pub fn bind_rpc(&mut self, client: u32, server_id: u32, mode: u32) -> Result<u32> {
        debug!(
            target: LOG_TARGET,
            "SifBindRpc(client = {client:#010x}, serverId = {server_id:#010x}, mode = {mode:#x})"
        );
        let result = self.bind(client, server_id, mode);
        self.settle("SifBindRpc", result)
    }

    fn bind(&mut self, client: u32, server_id: u32, mode: u32) -> Result<u32> {
        Self::check_mode(mode)?;
        self.check_idle(client)?;
        // Holds the id until the request end brings the remote descriptor.
        ClientData::at(client).set_server(&mut self.memory, server_id)?;
        self.open_session(client, OpKind::Bind, 0, 0)?;
        self.transport.send_packet(&BindPacket::new(server_id, client).to_bytes());
        Ok(0)
    }

    /// Calls procedure `request.rpc_number` on the server `client` is bound to. Returns 0.
    pub fn call_rpc(&mut self, client: u32, request: RpcCall) -> Result<u32> {
        debug!(
            target: LOG_TARGET,
            "SifCallRpc(client = {client:#010x}, rpcNumber = {:#x}, mode = {:#x}, send = {:#010x}+{:#x}, \
             recv = {:#010x}+{:#x}, endFunction = {:#010x}, endParam = {:#010x})",
            request.rpc_number,
            request.mode,
            request.send_addr,
            request.send_size,
            request.recv_addr,
            request.recv_size,
            request.end_function,
            request.end_param
        );
        let result = self.call(client, request);
        self.settle("SifCallRpc", result)
    }

    fn call(&mut self, client: u32, request: RpcCall) -> Result<u32> {
        Self::check_mode(request.mode)?;
        self.check_idle(client)?;
        let view = ClientData::at(client);
        let server = view.server(&self.memory)?;
        if server == 0 {
            return Err(ProtocolViolation::NotBound { client }.into());
        }
        let buffer = view.buffer(&self.memory)?;
        view.set_end_function(&mut self.memory, request.end_function)?;
        view.set_end_param(&mut self.memory, request.end_param)?;
        self.open_session(client, OpKind::Call, request.end_function, request.end_param)?;

        self.transport.request_bulk_transfer(DmaTransfer {
            src: request.send_addr,
            dst: buffer,
            size: request.send_size,
            flags: 0,
        });
        let packet = CallPacket {
            header: CommandHeader::new(cmd::CALL, CallPacket::LEN),
            rpc_number: request.rpc_number,
            send_size: request.send_size,
            recv_addr: request.recv_addr,
            recv_size: request.recv_size,
            recv_mode: RECV_MODE_BUFFERED,
            client,
            server,
        };
        self.transport.send_packet(&packet.to_bytes());
        Ok(0)
    }

    /// Completes the bind or call named by the request end packet at `header_addr`.
    pub(crate) fn request_end(&mut self, header_addr: u32) -> Result<()> {
        let frame = self.memory.read(header_addr, RequestEndPacket::LEN as u32)?;
        let packet = RequestEndPacket::decode(frame).map_err(|_| Rejected::MalformedPacket {
            command_id: cmd::REQUEST_END,
            size: RequestEndPacket::LEN as u32,
        })?;
        let client = packet.client;
        if client == 0 {
            return Err(ProtocolViolation::NullClient.into());
        }
        let view = ClientData::at(client);
        let kind = match packet.command_id {
            cmd::BIND if packet.server == 0 => {
                return Err(ProtocolViolation::UnresolvedServer { client }.into());
            }
            cmd::CALL => {
                let end_function = view.end_function(&self.memory)?;
                if end_function != 0 {
                    return Err(ProtocolViolation::AsyncCompletionUnsupported { client, end_function }.into());
                }
                OpKind::Call
            }
            cmd::BIND => OpKind::Bind,
            other => return Err(ProtocolViolation::UnexpectedCompletion(other).into()),
        };
        let op = match self.sessions.get(client) {
            None => return Err(ProtocolViolation::NoPendingOperation { client }.into()),
            Some(op) if op.kind != kind => {
                return Err(ProtocolViolation::CompletionMismatch { client }.into());
            }
            Some(op) => *op,
        };
        // Nothing is written unless the whole descriptor is addressable.
        self.memory.range(client, ClientData::SIZE)?;

        if kind == OpKind::Bind {
            view.set_server(&mut self.memory, packet.server)?;
            view.set_buffer(&mut self.memory, packet.buffer)?;
            view.set_cbuffer(&mut self.memory, packet.cbuffer)?;
        }
        self.sessions.remove(client);
        self.scheduler.signal_semaphore(op.semaphore, true)?;
        self.scheduler.delete_semaphore(op.semaphore)?;
        view.set_sema_id(&mut self.memory, 0)?;
        debug!(
            target: LOG_TARGET,
            "request end for client {client:#010x} ({:?}, server {:#010x})",
            kind,
            packet.server
        );
        Ok(())
    }

    /// Registers a local server. Returns 0.
    pub fn register_rpc(&mut self, registration: ServerRegistration) -> Result<u32> {
        debug!(
            target: LOG_TARGET,
            "SifRegisterRpc(server = {:#010x}, serverId = {:#010x}, function = {:#010x}, buffer = {:#010x}, \
             cfunction = {:#010x}, cbuffer = {:#010x}, queue = {:#010x})",
            registration.server,
            registration.server_id,
            registration.function,
            registration.buffer,
            registration.cfunction,
            registration.cbuffer,
            registration.queue
        );
        let result = self.register(registration);
        self.settle("SifRegisterRpc", result)
    }

    fn register(&mut self, reg: ServerRegistration) -> Result<u32> {
        if reg.queue != 0 {
            let head = QueueData::at(reg.queue).chain_head(&self.memory)?;
            if head != 0 {
                return Err(ProtocolViolation::QueueAlreadyBound { queue: reg.queue, head }.into());
            }
        }
        if reg.server != 0 {
            self.memory.range(reg.server, ServerData::SIZE)?;
        }

        if !self.servers.contains(reg.server_id) && !self.transport.is_server_registered(reg.server_id) {
            self.servers.push(ServerInstance { server_id: reg.server_id, server_data_addr: reg.server });
            self.transport.register_server(reg.server_id);
            info!(
                target: LOG_TARGET,
                "registered server {:#x} at {:#010x}",
                reg.server_id,
                reg.server
            );
        }

        if reg.server != 0 {
            let server = ServerData::at(reg.server);
            server.set_server_id(&mut self.memory, reg.server_id)?;
            server.set_function(&mut self.memory, reg.function)?;
            server.set_buffer(&mut self.memory, reg.buffer)?;
            server.set_cfunction(&mut self.memory, reg.cfunction)?;
            server.set_cbuffer(&mut self.memory, reg.cbuffer)?;
            server.set_queue(&mut self.memory, reg.queue)?;
        }
        if reg.queue != 0 {
            QueueData::at(reg.queue).set_chain_head(&mut self.memory, reg.server)?;
        }
        Ok(0)
    }

    /// Sets the thread that services `queue`.
    pub fn set_rpc_queue(&mut self, queue: u32, thread: u32) -> Result<()> {
        debug!(target: LOG_TARGET, "SifSetRpcQueue(queue = {queue:#010x}, threadId = {thread})");
        if queue == 0 {
            return Ok(());
        }
        let result = QueueData::at(queue).set_thread_id(&mut self.memory, thread).map_err(Error::from);
        self.settle("SifSetRpcQueue", result)
    }

    /// Takes the request posted into `queue`; 0 when there is none.
    pub fn get_next_request(&mut self, queue: u32) -> Result<u32> {
        debug!(target: LOG_TARGET, "SifGetNextRequest(queue = {queue:#010x})");
        if queue == 0 {
            return Ok(0);
        }
        let result = self.take_request(queue).map_err(Error::from);
        self.settle("SifGetNextRequest", result)
    }

    fn take_request(&mut self, queue: u32) -> core::result::Result<u32, MemoryError> {
        let view = QueueData::at(queue);
        let server = view.pending(&self.memory)?;
        view.set_pending(&mut self.memory, 0)?;
        Ok(server)
    }

    /// Runs the request posted for `server` through the engine's request trampoline.
    pub fn exec_request(&mut self, server: u32) -> Result<()> {
        debug!(target: LOG_TARGET, "SifExecRequest(server = {server:#010x})");
        let entry = self.executor.entry_points().exec_request;
        let result = self.in_flight.start(server);
        if result.is_ok() {
            self.executor.invoke(entry, &[server], Completion::Request { server });
        }
        self.settle("SifExecRequest", result)
    }

    /// Enters the request loop for `queue`.
    pub fn rpc_loop<C: CallContext + ?Sized>(&mut self, ctx: &mut C, queue: u32) {
        debug!(target: LOG_TARGET, "SifRpcLoop(queue = {queue:#010x})");
        ctx.jump(self.executor.entry_points().rpc_loop);
    }

    /// Delivers an inbound call for the server registered under `server_id`.
    pub fn invoke_server(&mut self, server_id: u32, method: u32, params: &[u8]) -> Result<()> {
        let result = match self.servers.find(server_id) {
            Some(instance) => {
                let server = instance.server_data_addr;
                self.post_request(server, method, params)
            }
            None => Err(ProtocolViolation::UnknownServer(server_id).into()),
        };
        self.settle("InvokeServer", result)
    }

    /// Posts a request into the queue of `server` and wakes its thread.
    pub fn deliver_invocation(&mut self, server: u32, method: u32, params: &[u8]) -> Result<()> {
        let result = self.post_request(server, method, params);
        self.settle("DeliverInvocation", result)
    }

    fn post_request(&mut self, server: u32, method: u32, params: &[u8]) -> Result<()> {
        let desc = ServerData::at(server);
        let queue = desc.queue(&self.memory)?;
        if queue == 0 {
            return Err(ProtocolViolation::NoQueue { server }.into());
        }
        // The serving thread is still busy with an earlier request.
        if self.in_flight.contains(server) {
            return Err(ProtocolViolation::RequestAlreadyRunning { server }.into());
        }
        let queue_view = QueueData::at(queue);
        if queue_view.pending(&self.memory)? != 0 {
            return Err(ProtocolViolation::RequestSlotBusy { queue }.into());
        }
        if queue_view.chain_head(&self.memory)? != server {
            return Err(ProtocolViolation::QueueMismatch { queue, server }.into());
        }
        let thread = queue_view.thread_id(&self.memory)?;
        let buffer = desc.buffer(&self.memory)?;
        let size = u32::try_from(params.len()).map_err(|_| MemoryError::OutOfBounds {
            addr: buffer,
            len: u32::MAX,
            size: self.memory.bytes().len(),
        })?;
        if buffer != 0 {
            self.memory.write(buffer, params)?;
        }
        desc.set_rid(&mut self.memory, method)?;
        desc.set_rsize(&mut self.memory, size)?;
        queue_view.set_pending(&mut self.memory, server)?;
        debug!(
            target: LOG_TARGET,
            "request {method:#x} ({size} bytes) posted to server {server:#010x}, waking thread {thread}"
        );
        self.scheduler.wakeup_thread(thread, true);
        self.scheduler.reschedule();
        Ok(())
    }

    /// Returns the reply of the request that ran on `server`.
    pub(crate) fn finish_exec_request(&mut self, server: u32, reply_addr: u32) -> Result<()> {
        self.in_flight.finish(server)?;
        let server_id = ServerData::at(server).server_id(&self.memory)?;
        debug!(
            target: LOG_TARGET,
            "FinishExecRequest(server = {server:#010x}, reply = {reply_addr:#010x})"
        );
        self.transport.send_call_reply(server_id, reply_addr);
        Ok(())
    }
}
