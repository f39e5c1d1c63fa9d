//! CONTEXT: sifcmd command end-to-end tests
//! INTENT: Register writes, queued handler dispatch and outgoing raw commands
//! IDL (target): SET_SREG, user/system commands → handlers, SifSendCmd → remote
//! DEPS: sifcmd_e2e harness
//! READINESS: Host backend ready
//! TESTS: register writes, arrival order under bursts, soft faults, outgoing packets
// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use proptest::prelude::*;
use sif_wire::{CommandHeader, SetRegisterPacket};
use sifcmd::{Config, Export, GuestMemory};
use sifcmd_e2e::{boot, drain_commands, Module, Peer, Regs};

const HANDLER: u32 = 0x0001_8000;

fn packet(command_id: u32, size: u32, fill: u8) -> Vec<u8> {
    let mut bytes = vec![fill; size as usize];
    bytes[..12].copy_from_slice(&CommandHeader { command_id, size, dest: 0 }.to_bytes());
    bytes
}

fn with_user_table() -> (Module, Peer) {
    let (mut module, peer) = boot(Config::default());
    module.set_cmd_buffer(0x9000, 8);
    for slot in 0..8 {
        module.add_cmd_handler(slot, HANDLER + slot * 0x10, 0x70 + slot).unwrap();
    }
    (module, peer)
}

#[test]
fn remote_register_writes_are_visible_locally() {
    let (mut module, peer) = boot(Config::default());
    peer.deliver(&mut module, &SetRegisterPacket::new(3, 0xCAFE).to_bytes()).unwrap();
    peer.deliver(&mut module, &SetRegisterPacket::new(31, 0xBEEF).to_bytes()).unwrap();
    assert_eq!(module.get_sreg(3).unwrap(), 0xCAFE);
    assert_eq!(module.get_sreg(31).unwrap(), 0xBEEF);

    peer.deliver(&mut module, &SetRegisterPacket::new(32, 1).to_bytes()).unwrap();
    assert_eq!(module.diagnostics().register_out_of_range, 1);

    let mut regs = Regs::with(&[3]);
    module.invoke_export(&mut regs, Export::GetSreg.id()).unwrap();
    assert_eq!(regs.ret, Some(0xCAFE));
}

#[test]
fn register_write_ignores_upper_size_bits() {
    let (mut module, peer) = boot(Config::default());
    let mut bytes = SetRegisterPacket::new(5, 0x1234).to_bytes();
    bytes[4..8].copy_from_slice(&0x0100_0014u32.to_le_bytes());
    peer.deliver(&mut module, &bytes).unwrap();
    assert_eq!(module.get_sreg(5).unwrap(), 0x1234);
    assert_eq!(module.diagnostics().malformed, 0);
}

#[test]
fn handler_sees_the_packet_length_not_the_raw_size_word() {
    let (mut module, peer) = with_user_table();
    let mut sent = packet(4, 24, 0x6D);
    sent[4..8].copy_from_slice(&0x0000_0318u32.to_le_bytes());
    peer.deliver(&mut module, &sent).unwrap();
    // Trailing bytes past the packet in the buffer.
    peer.deliver(&mut module, &packet(6, 16, 0x7E)).unwrap();

    let mut seen = Vec::new();
    drain_commands(&mut module, |_, bytes| seen.push(bytes.to_vec())).unwrap();
    assert_eq!(seen[0], sent);
    assert_eq!(seen[1], packet(6, 16, 0x7E));
}

#[test]
fn user_command_reaches_its_handler_with_the_packet() {
    let (mut module, peer) = with_user_table();
    let sent = packet(5, 24, 0x3C);
    peer.deliver(&mut module, &sent).unwrap();

    let mut seen = Vec::new();
    let ran = drain_commands(&mut module, |invocation, bytes| {
        seen.push((invocation.function.addr(), invocation.args[1], bytes.to_vec()));
    })
    .unwrap();
    assert_eq!(ran, 1);
    assert_eq!(seen, vec![(HANDLER + 0x50, 0x75, sent)]);
    assert_eq!(module.pending_len().unwrap(), 0);
}

#[test]
fn burst_is_handled_in_arrival_order() {
    let (mut module, peer) = with_user_table();
    let burst: Vec<Vec<u8>> = (0..6u32).map(|n| packet(n, 12 + 4 * n, n as u8)).collect();
    for bytes in &burst {
        peer.deliver(&mut module, bytes).unwrap();
    }
    assert_eq!(module.executor().invocations().len(), 1);

    let mut seen = Vec::new();
    drain_commands(&mut module, |_, bytes| seen.push(bytes.to_vec())).unwrap();
    assert_eq!(seen, burst);
    assert!(!module.is_executing_command());
}

#[test]
fn soft_faults_do_not_stall_the_queue() {
    let (mut module, peer) = with_user_table();
    module.add_cmd_handler(0x8000_0010, HANDLER + 0x100, 0).unwrap();
    peer.deliver(&mut module, &packet(1, 16, 0)).unwrap();
    // Slot past the user table, then a system slot with no handler.
    peer.deliver(&mut module, &packet(40, 16, 0)).unwrap();
    peer.deliver(&mut module, &packet(0x8000_0011, 16, 0)).unwrap();
    peer.deliver(&mut module, &packet(0x8000_0010, 16, 0)).unwrap();
    // Declared size shorter than the header.
    let mut short = packet(2, 12, 0);
    short[4..8].copy_from_slice(&8u32.to_le_bytes());
    peer.deliver(&mut module, &short).unwrap();
    assert_eq!(module.diagnostics().malformed, 1);

    let mut handlers = Vec::new();
    drain_commands(&mut module, |invocation, _| handlers.push(invocation.function.addr())).unwrap();
    assert_eq!(handlers, vec![HANDLER + 0x10, HANDLER + 0x100]);
    assert_eq!(module.diagnostics().slot_out_of_range, 1);
    assert_eq!(module.diagnostics().no_handler, 1);
    assert_eq!(module.pending_len().unwrap(), 0);
}

#[test]
fn raw_command_goes_out_with_its_extra_transfer() {
    let (mut module, mut peer) = boot(Config::default());
    module.memory_mut().fill(0xA000, 0x20, 0x11).unwrap();
    module.memory_mut().write(0xA100, b"extra payload").unwrap();

    let mut regs = Regs::with(&[9, 0xA000, 0x20, 0xA100, 0x2000, 13]);
    module.invoke_export(&mut regs, Export::SendCmd.id()).unwrap();
    assert_eq!(regs.ret, Some(1));

    assert_eq!(peer.pump(&mut module).unwrap(), 1);
    let out = peer.take_unhandled();
    assert_eq!(out.len(), 1);
    let header = CommandHeader::decode(&out[0]).unwrap();
    assert_eq!((header.command_id, header.size), (9, 0x20));
    assert!(out[0][12..].iter().all(|&b| b == 0x11));
    assert_eq!(&peer.ram()[0x2000..0x200D], b"extra payload");
}

#[test]
fn oversized_raw_command_is_refused() {
    let (mut module, mut peer) = boot(Config::default());
    let mut regs = Regs::with(&[9, 0xA000, 0x100, 0, 0, 0]);
    module.invoke_export(&mut regs, Export::ISendCmd.id()).unwrap();
    assert_eq!(regs.ret, Some(0));
    assert_eq!(peer.pump(&mut module).unwrap(), 0);
}

#[test]
fn remote_fetch_is_forwarded() {
    let (mut module, peer) = boot(Config::default());
    let mut regs = Regs::with(&[0, 0x0010_0000, 0xB000, 0x40, 0]);
    module.invoke_export(&mut regs, Export::GetOtherData.id()).unwrap();
    assert_eq!(regs.ret, Some(0));
    assert_eq!(peer.link().take_fetches(), vec![(0x0010_0000, 0xB000, 0x40)]);
}

proptest! {
    #[test]
    fn handlers_see_every_packet_in_order(
        packets in proptest::collection::vec((0u32..8, 3u32..=16, any::<u8>()), 1..12),
    ) {
        let (mut module, peer) = with_user_table();
        let sent: Vec<Vec<u8>> = packets
            .iter()
            .map(|&(slot, words, fill)| packet(slot, words * 4, fill))
            .collect();
        for bytes in &sent {
            peer.deliver(&mut module, bytes).unwrap();
        }

        let mut seen = Vec::new();
        drain_commands(&mut module, |invocation, bytes| {
            seen.push((invocation.args[1] - 0x70, bytes.to_vec()));
        })
        .unwrap();
        let expected: Vec<(u32, Vec<u8>)> =
            packets.iter().map(|&(slot, _, _)| slot).zip(sent).collect();
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(module.pending_len().unwrap(), 0);
    }
}
