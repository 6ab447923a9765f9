// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The byte-level protocol between host and controller.
//!
//! Every message is a frame of `opcode: u16`, `length: u32` and `length` bytes of payload, all
//! little-endian. Requests come from the host, and each is answered by exactly one
//! [`Opcode::Response`]. [`Opcode::Status`] and [`Opcode::AcquiredImage`] frames arrive from the
//! device whenever it has something to report.
mod codec;
pub mod image;
mod message;

use std::io::{self, Read, Write};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::TransportError;

pub use message::{
    encode_error, AcquiredImage, DeviceEvent, Reply, Request, RetrieveFrom, StatusMessage,
};

/// Bumped whenever a frame layout changes.
pub const PROTOCOL_VERSION: u16 = 1;

pub const FRAME_HEADER_LEN: usize = 6;

/// The largest payload either side accepts.
pub const MAX_PAYLOAD_LEN: u32 = 0x1000_0000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    Hello = 0x0001,
    EnumerateComponents = 0x0002,

    LoadBegin = 0x0010,
    LoadComponent = 0x0011,
    LoadImage = 0x0012,
    LoadSequence = 0x0013,
    LoadTriggerRule = 0x0014,
    LoadCommit = 0x0015,
    LoadAbort = 0x0016,

    StartSequence = 0x0020,
    StopSequence = 0x0021,
    NextSequenceItem = 0x0022,
    GotoSequenceItem = 0x0023,
    AddStreamingItem = 0x0024,

    AcquireImages = 0x0030,
    RetrieveImage = 0x0031,
    ReturnImageCredit = 0x0032,

    Response = 0x0100,
    Status = 0x0101,
    AcquiredImage = 0x0102,
}

impl Opcode {
    /// Whether the device sends this frame without being asked.
    pub fn is_unsolicited(self) -> bool {
        matches!(self, Opcode::Status | Opcode::AcquiredImage)
    }

    /// Whether sending this request twice leaves the device as sending it once would.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Opcode::Hello
                | Opcode::EnumerateComponents
                | Opcode::LoadComponent
                | Opcode::LoadImage
                | Opcode::LoadAbort
                | Opcode::StopSequence
                | Opcode::GotoSequenceItem
                | Opcode::RetrieveImage
        )
    }
}

/// The first byte of every response payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    InvalidProject = 1,
    DeviceBusy = 2,
    NotFound = 3,
    ProtocolMismatch = 4,
    InvalidArgument = 5,
}

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..2].copy_from_slice(&u16::from(opcode).to_le_bytes());
    header[2..].copy_from_slice(&length.to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame, leaving its payload in `payload`.
///
/// The buffer is reused between calls so a steady stream of same-sized frames allocates once.
pub fn read_frame<R: Read>(reader: &mut R, payload: &mut Vec<u8>) -> Result<Opcode, TransportError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => (),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(err) => return Err(err.into()),
    }
    let opcode = Opcode::try_from(u16::from_le_bytes([header[0], header[1]]))
        .map_err(|_| TransportError::Malformed("unknown opcode"))?;
    let length = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    if length > MAX_PAYLOAD_LEN {
        return Err(TransportError::Malformed("payload too large"));
    }
    payload.clear();
    payload.resize(length as usize, 0);
    reader.read_exact(payload)?;
    Ok(opcode)
}
