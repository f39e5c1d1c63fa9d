//! CONTEXT: sifcmd RPC end-to-end tests
//! INTENT: Bind, call and inbound request flows against a scripted remote side
//! IDL (target): BIND → REQUEST_END, CALL → REQUEST_END, invoke → request loop → reply
//! DEPS: sifcmd_e2e harness
//! READINESS: Host backend ready
//! TESTS: client round trips, unresolved binds, async completions, local servers, exports
// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use sif_wire::{cmd, RECV_MODE_BUFFERED};
use sifcmd::desc::ClientData;
use sifcmd::host::CallReply;
use sifcmd::{Config, Error, Export, GuestMemory, ProtocolViolation, RpcCall, ServerRegistration};
use sifcmd_e2e::{boot, serve_request, Module, Peer, Regs, RPC_LOOP};

const CLIENT: u32 = 0x4000;
const REMOTE_ID: u32 = 0x8000_0123;
const REMOTE_DESC: u32 = 0x2000;
const REMOTE_BUFFER: u32 = 0x3000;
const REMOTE_CBUFFER: u32 = 0x3800;

fn with_echo_server() -> (Module, Peer) {
    let (module, mut peer) = boot(Config::default());
    peer.add_server(
        REMOTE_ID,
        REMOTE_DESC,
        REMOTE_BUFFER,
        REMOTE_CBUFFER,
        Box::new(|_, params| params.iter().rev().copied().collect()),
    );
    (module, peer)
}

fn bound() -> (Module, Peer) {
    let (mut module, mut peer) = with_echo_server();
    module.bind_rpc(CLIENT, REMOTE_ID, 0).unwrap();
    assert_eq!(peer.pump(&mut module).unwrap(), 1);
    (module, peer)
}

#[test]
fn bind_resolves_the_remote_descriptor() {
    let (mut module, mut peer) = with_echo_server();
    assert_eq!(module.bind_rpc(CLIENT, REMOTE_ID, 0).unwrap(), 0);
    let sema = ClientData::at(CLIENT).sema_id(module.memory()).unwrap();
    assert_eq!(module.scheduler().waiters(sema), Some(1));

    assert_eq!(peer.pump(&mut module).unwrap(), 1);
    let client = ClientData::at(CLIENT);
    assert_eq!(client.server(module.memory()).unwrap(), REMOTE_DESC);
    assert_eq!(client.buffer(module.memory()).unwrap(), REMOTE_BUFFER);
    assert_eq!(client.cbuffer(module.memory()).unwrap(), REMOTE_CBUFFER);
    assert_eq!(client.sema_id(module.memory()).unwrap(), 0);
    assert!(module.sessions().is_empty());
    assert_eq!(module.scheduler().live_semaphores(), 0);
    assert_eq!((module.scheduler().created(), module.scheduler().deleted()), (1, 1));
}

#[test]
fn call_ships_parameters_and_returns_the_reply() {
    let (mut module, mut peer) = bound();
    module.memory_mut().write(0x5000, b"sif-call").unwrap();
    let request = RpcCall {
        rpc_number: 3,
        send_addr: 0x5000,
        send_size: 8,
        recv_addr: 0x6000,
        recv_size: 8,
        ..RpcCall::default()
    };
    assert_eq!(module.call_rpc(CLIENT, request).unwrap(), 0);
    assert!(module.sessions().is_busy(CLIENT));

    assert_eq!(peer.pump(&mut module).unwrap(), 1);
    assert_eq!(&peer.ram()[0x3000..0x3008], b"sif-call");
    assert_eq!(module.memory().read(0x6000, 8).unwrap(), b"llac-fis");
    assert!(module.sessions().is_empty());

    let call = peer.calls()[0];
    assert_eq!(call.rpc_number, 3);
    assert_eq!(call.server, REMOTE_DESC);
    assert_eq!(call.client, CLIENT);
    assert_eq!(call.recv_mode, RECV_MODE_BUFFERED);
    assert_eq!(module.scheduler().live_semaphores(), 0);
}

#[test]
fn reply_is_cut_to_the_receive_size() {
    let (mut module, mut peer) = bound();
    module.memory_mut().write(0x5000, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    module.memory_mut().fill(0x6000, 8, 0xEE).unwrap();
    let request =
        RpcCall { send_addr: 0x5000, send_size: 8, recv_addr: 0x6000, recv_size: 4, ..RpcCall::default() };
    module.call_rpc(CLIENT, request).unwrap();
    peer.pump(&mut module).unwrap();
    assert_eq!(module.memory().read(0x6000, 8).unwrap(), &[8, 7, 6, 5, 0xEE, 0xEE, 0xEE, 0xEE]);
}

#[test]
fn repeated_calls_reuse_the_binding() {
    let (mut module, mut peer) = bound();
    for n in 0..4u8 {
        module.memory_mut().write(0x5000, &[n, n + 1]).unwrap();
        let request = RpcCall {
            rpc_number: u32::from(n),
            send_addr: 0x5000,
            send_size: 2,
            recv_addr: 0x6000,
            recv_size: 2,
            ..RpcCall::default()
        };
        module.call_rpc(CLIENT, request).unwrap();
        peer.pump(&mut module).unwrap();
        assert_eq!(module.memory().read(0x6000, 2).unwrap(), &[n + 1, n]);
    }
    assert_eq!(peer.calls().len(), 4);
    assert_eq!(module.scheduler().created(), 5);
    assert_eq!(module.scheduler().live_semaphores(), 0);
}

#[test]
fn clients_bind_independently() {
    let (mut module, mut peer) = with_echo_server();
    peer.add_server(0x8000_0200, 0x2400, 0x3400, 0, Box::new(|_, _| Vec::new()));
    module.bind_rpc(CLIENT, REMOTE_ID, 0).unwrap();
    module.bind_rpc(CLIENT + 0x40, 0x8000_0200, 0).unwrap();
    assert_eq!(module.sessions().len(), 2);

    assert_eq!(peer.pump(&mut module).unwrap(), 2);
    assert_eq!(ClientData::at(CLIENT).server(module.memory()).unwrap(), REMOTE_DESC);
    assert_eq!(ClientData::at(CLIENT + 0x40).server(module.memory()).unwrap(), 0x2400);
    assert!(module.sessions().is_empty());
}

#[test]
fn unresolved_bind_halts_with_the_session_open() {
    let (mut module, mut peer) = boot(Config::default());
    module.bind_rpc(CLIENT, 0x8000_0999, 0).unwrap();
    let err = peer.pump(&mut module).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, Error::Protocol(ProtocolViolation::UnresolvedServer { client: CLIENT })));
    assert!(module.sessions().is_busy(CLIENT));
    assert_eq!(ClientData::at(CLIENT).server(module.memory()).unwrap(), 0x8000_0999);
}

#[test]
fn call_with_end_function_halts_on_completion() {
    let (mut module, mut peer) = bound();
    let request = RpcCall { end_function: 0x0001_A000, end_param: 9, ..RpcCall::default() };
    module.call_rpc(CLIENT, request).unwrap();
    let err = peer.pump(&mut module).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::AsyncCompletionUnsupported { client: CLIENT, end_function: 0x0001_A000 })
    ));
}

#[test]
fn call_before_bind_is_refused() {
    let (mut module, mut peer) = with_echo_server();
    let err = module.call_rpc(CLIENT, RpcCall::default()).unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolViolation::NotBound { client: CLIENT })));
    assert_eq!(peer.pump(&mut module).unwrap(), 0);
}

#[test]
fn stray_request_end_is_fatal() {
    let (mut module, peer) = boot(Config::default());
    let end = sif_wire::RequestEndPacket::new(cmd::CALL, CLIENT, REMOTE_DESC, 0, 0);
    let err = peer.deliver(&mut module, &end.to_bytes()).unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolViolation::NoPendingOperation { client: CLIENT })));
}

const LOCAL_SERVER: u32 = 0x7000;
const LOCAL_ID: u32 = 0x8000_0301;
const LOCAL_BUFFER: u32 = 0x7100;
const QUEUE: u32 = 0x7400;
const REPLY: u32 = 0x7800;

fn with_local_server() -> (Module, Peer) {
    let (mut module, peer) = boot(Config::default());
    let registration = ServerRegistration {
        server: LOCAL_SERVER,
        server_id: LOCAL_ID,
        function: 0x0001_9000,
        buffer: LOCAL_BUFFER,
        queue: QUEUE,
        ..ServerRegistration::default()
    };
    module.register_rpc(registration).unwrap();
    module.set_rpc_queue(QUEUE, 7).unwrap();
    (module, peer)
}

#[test]
fn inbound_call_runs_on_the_queue_thread_and_replies() {
    let (mut module, peer) = with_local_server();
    assert_eq!(peer.link().registered_servers(), vec![LOCAL_ID]);

    peer.invoke(&mut module, LOCAL_ID, 2, b"ping").unwrap();
    assert_eq!(module.scheduler().woken(), &[(7, true)]);

    let served = serve_request(&mut module, QUEUE, REPLY, |method, params| {
        assert_eq!(method, 2);
        assert_eq!(params, b"ping");
        b"pong".to_vec()
    })
    .unwrap();
    assert_eq!(served, Some(LOCAL_SERVER));
    assert_eq!(module.memory().read(REPLY, 4).unwrap(), b"pong");
    assert_eq!(peer.link().take_replies(), vec![CallReply { server_id: LOCAL_ID, reply_addr: REPLY }]);
    assert_eq!(module.requests_in_flight(), 0);

    assert_eq!(serve_request(&mut module, QUEUE, REPLY, |_, _| Vec::new()).unwrap(), None);
}

#[test]
fn inbound_calls_are_served_one_per_slot() {
    let (mut module, peer) = with_local_server();
    peer.invoke(&mut module, LOCAL_ID, 1, &[1]).unwrap();
    let err = peer.invoke(&mut module, LOCAL_ID, 2, &[2]).unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolViolation::RequestSlotBusy { queue: QUEUE })));

    serve_request(&mut module, QUEUE, REPLY, |_, _| Vec::new()).unwrap();
    peer.invoke(&mut module, LOCAL_ID, 2, &[2]).unwrap();
    let served = serve_request(&mut module, QUEUE, REPLY, |method, params| {
        assert_eq!((method, params), (2, &[2u8][..]));
        Vec::new()
    })
    .unwrap();
    assert_eq!(served, Some(LOCAL_SERVER));
    assert_eq!(peer.link().take_replies().len(), 2);
}

#[test]
fn inbound_call_to_unknown_server_is_fatal() {
    let (mut module, peer) = with_local_server();
    let err = peer.invoke(&mut module, 0x8000_0302, 0, &[]).unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolViolation::UnknownServer(0x8000_0302))));
}

#[test]
fn shutdown_withdraws_local_servers() {
    let (module, peer) = with_local_server();
    drop(module);
    assert!(peer.link().registered_servers().is_empty());
}

#[test]
fn guest_exports_drive_a_full_session() {
    let (mut module, mut peer) = with_echo_server();

    let mut regs = Regs::with(&[CLIENT, REMOTE_ID, 0]);
    module.invoke_export(&mut regs, Export::BindRpc.id()).unwrap();
    assert_eq!(regs.ret, Some(0));
    peer.pump(&mut module).unwrap();

    module.memory_mut().write(0x5000, b"ab").unwrap();
    let mut regs = Regs::with(&[CLIENT, 1, 0, 0x5000, 2, 0x6000, 2, 0, 0]);
    module.invoke_export(&mut regs, Export::CallRpc.id()).unwrap();
    assert_eq!(regs.ret, Some(0));
    peer.pump(&mut module).unwrap();
    assert_eq!(module.memory().read(0x6000, 2).unwrap(), b"ba");

    let mut regs = Regs::with(&[CLIENT]);
    module.invoke_export(&mut regs, Export::CheckStatRpc.id()).unwrap();
    assert_eq!(regs.ret, Some(0));

    let mut regs = Regs::with(&[QUEUE]);
    module.invoke_export(&mut regs, Export::RpcLoop.id()).unwrap();
    assert_eq!(regs.jumped, Some(RPC_LOOP));
}
