// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Guest-visible export table of the `sifcmd` module
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (ids are fixed by guest import tables)
//! TEST_COVERAGE: Unit tests below + `tests/rpc.rs`
//!
//! Ids below 0x100 are the library's import slots; the 0x66x ids are
//! private entries used by the engine's trampolines.

use log::{debug, warn};

use crate::bridge::{CallContext, Completion, Executor};
use crate::memory::GuestMemory;
use crate::module::SifCmd;
use crate::rpc::{RpcCall, ServerRegistration};
use crate::sched::Scheduler;
use crate::transport::Transport;
use crate::{Result, LOG_TARGET};

/// Module name in the guest's library list.
pub const MODULE_NAME: &str = "sifcmd";

/// Module version reported to the guest.
pub const MODULE_VERSION: u32 = 0x101;

/// Exported functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Export {
    /// `SifGetSreg(index)`
    GetSreg = 6,
    /// `SifSetCmdBuffer(data, length)`
    SetCmdBuffer = 8,
    /// `SifAddCmdHandler(pos, handler, data)`
    AddCmdHandler = 10,
    /// `SifSendCmd(id, packet, size, src, dst, size_extra)`
    SendCmd = 12,
    /// Interrupt-context `SifSendCmd`.
    ISendCmd = 13,
    /// `SifInitRpc(mode)`
    InitRpc = 14,
    /// `SifBindRpc(client, server_id, mode)`
    BindRpc = 15,
    /// `SifCallRpc(client, rpc_number, mode, send, ssize, recv, rsize, end_fn, end_param)`
    CallRpc = 16,
    /// `SifRegisterRpc(server, id, function, buffer, cfunction, cbuffer, queue)`
    RegisterRpc = 17,
    /// `SifCheckStatRpc(client)`
    CheckStatRpc = 18,
    /// `SifSetRpcQueue(queue, thread)`
    SetRpcQueue = 19,
    /// `SifGetNextRequest(queue)`
    GetNextRequest = 20,
    /// `SifExecRequest(server)`
    ExecRequest = 21,
    /// `SifRpcLoop(queue)`
    RpcLoop = 22,
    /// `SifGetOtherData(packet, src, dst, size, mode)`
    GetOtherData = 23,
    /// Trampoline exit of a request: `(server, reply)`.
    FinishExecRequest = 0x666,
    /// Trampoline exit of a command handler.
    FinishExecCmd = 0x667,
    /// Sleep used by the request loop.
    SleepThread = 0x668,
}

impl Export {
    /// Every export, in id order.
    pub const ALL: [Export; 18] = [
        Export::GetSreg,
        Export::SetCmdBuffer,
        Export::AddCmdHandler,
        Export::SendCmd,
        Export::ISendCmd,
        Export::InitRpc,
        Export::BindRpc,
        Export::CallRpc,
        Export::RegisterRpc,
        Export::CheckStatRpc,
        Export::SetRpcQueue,
        Export::GetNextRequest,
        Export::ExecRequest,
        Export::RpcLoop,
        Export::GetOtherData,
        Export::FinishExecRequest,
        Export::FinishExecCmd,
        Export::SleepThread,
    ];

    /// Export with `id`.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|export| export.id() == id)
    }

    /// Numeric id.
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Guest-facing name.
    pub const fn name(self) -> &'static str {
        match self {
            Export::GetSreg => "SifGetSreg",
            Export::SetCmdBuffer => "SifSetCmdBuffer",
            Export::AddCmdHandler => "SifAddCmdHandler",
            Export::SendCmd => "SifSendCmd",
            Export::ISendCmd => "iSifSendCmd",
            Export::InitRpc => "SifInitRpc",
            Export::BindRpc => "SifBindRpc",
            Export::CallRpc => "SifCallRpc",
            Export::RegisterRpc => "SifRegisterRpc",
            Export::CheckStatRpc => "SifCheckStatRpc",
            Export::SetRpcQueue => "SifSetRpcQueue",
            Export::GetNextRequest => "SifGetNextRequest",
            Export::ExecRequest => "SifExecRequest",
            Export::RpcLoop => "SifRpcLoop",
            Export::GetOtherData => "SifGetOtherData",
            Export::FinishExecRequest => "FinishExecRequest",
            Export::FinishExecCmd => "FinishExecCmd",
            Export::SleepThread => "SleepThread",
        }
    }
}

/// Name of export `id`, or `"unknown"`.
pub fn function_name(id: u32) -> &'static str {
    Export::from_id(id).map_or("unknown", Export::name)
}

impl<M: GuestMemory, T: Transport, S: Scheduler, X: Executor> SifCmd<M, T, S, X> {
    /// Runs export `id` with arguments from `ctx`.
    ///
    /// Unknown ids are logged and ignored. Fatal errors are returned; the
    /// guest return value is left untouched in that case.
    pub fn invoke_export<C: CallContext + ?Sized>(&mut self, ctx: &mut C, id: u32) -> Result<()> {
        let Some(export) = Export::from_id(id) else {
            warn!(target: LOG_TARGET, "unknown function called ({id})");
            return Ok(());
        };
        match export {
            Export::GetSreg => {
                let value = self.get_sreg(ctx.arg(0))?;
                ctx.set_return(value);
            }
            Export::SetCmdBuffer => {
                let previous = self.set_cmd_buffer(ctx.arg(0), ctx.arg(1));
                ctx.set_return(previous);
            }
            Export::AddCmdHandler => self.add_cmd_handler(ctx.arg(0), ctx.arg(1), ctx.arg(2))?,
            Export::SendCmd | Export::ISendCmd => {
                let sent = self.send_cmd(ctx.arg(0), ctx.arg(1), ctx.arg(2), ctx.arg(3), ctx.arg(4), ctx.arg(5))?;
                ctx.set_return(sent);
            }
            Export::InitRpc => debug!(target: LOG_TARGET, "SifInitRpc()"),
            Export::BindRpc => {
                let result = self.bind_rpc(ctx.arg(0), ctx.arg(1), ctx.arg(2))?;
                ctx.set_return(result);
            }
            Export::CallRpc => {
                let request = RpcCall {
                    rpc_number: ctx.arg(1),
                    mode: ctx.arg(2),
                    send_addr: ctx.arg(3),
                    send_size: ctx.arg(4),
                    recv_addr: ctx.arg(5),
                    recv_size: ctx.arg(6),
                    end_function: ctx.arg(7),
                    end_param: ctx.arg(8),
                };
                let result = self.call_rpc(ctx.arg(0), request)?;
                ctx.set_return(result);
            }
            Export::RegisterRpc => {
                let registration = ServerRegistration {
                    server: ctx.arg(0),
                    server_id: ctx.arg(1),
                    function: ctx.arg(2),
                    buffer: ctx.arg(3),
                    cfunction: ctx.arg(4),
                    cbuffer: ctx.arg(5),
                    queue: ctx.arg(6),
                };
                let result = self.register_rpc(registration)?;
                ctx.set_return(result);
            }
            Export::CheckStatRpc => {
                debug!(target: LOG_TARGET, "SifCheckStatRpc(client = {:#010x})", ctx.arg(0));
                ctx.set_return(0);
            }
            Export::SetRpcQueue => self.set_rpc_queue(ctx.arg(0), ctx.arg(1))?,
            Export::GetNextRequest => {
                let server = self.get_next_request(ctx.arg(0))?;
                ctx.set_return(server);
            }
            Export::ExecRequest => self.exec_request(ctx.arg(0))?,
            Export::RpcLoop => {
                let queue = ctx.arg(0);
                self.rpc_loop(ctx, queue);
            }
            Export::GetOtherData => {
                let result = self.get_other_data(ctx.arg(0), ctx.arg(1), ctx.arg(2), ctx.arg(3), ctx.arg(4));
                ctx.set_return(result);
            }
            Export::FinishExecRequest => {
                self.complete(Completion::Request { server: ctx.arg(0) }, ctx.arg(1))?;
            }
            Export::FinishExecCmd => self.complete(Completion::Command, 0)?,
            Export::SleepThread => self.scheduler.sleep_thread(),
        }
        Ok(())
    }
}
