// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The image wire format.
//!
//! An image is a header (`width: u32`, `height: u32`, `channels: u8`, `bit_depth: u8`,
//! `major_order: u8`) followed by packed pixels:
//! * 1-bit images pack 8 pixels per byte, most significant bit first. Each major line (a column
//!   for DMD images) starts on a fresh byte.
//! * Up to 8 bits per sample, one byte per sample.
//! * More than 8 bits per sample, one little-endian `u16` per sample with the value in the low
//!   bits.
use bitvec::prelude::*;

use crate::device::MajorOrder;
use crate::error::TransportError;
use crate::util::{Buffer, BufferMut};

pub const IMAGE_HEADER_LEN: usize = 11;

/// Everything needed to interpret a packed pixel buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub major_order: MajorOrder,
}

impl ImageHeader {
    /// Length of the lines pixels are grouped into, and how many of them there are.
    fn lines(&self) -> (u64, u64) {
        match self.major_order {
            MajorOrder::Row => (self.width as u64, self.height as u64),
            MajorOrder::Column => (self.height as u64, self.width as u64),
        }
    }

    /// Bytes the packed pixels take up.
    pub fn byte_size(&self) -> u64 {
        let (line_length, line_count) = self.lines();
        let samples = line_length * self.channels as u64;
        let line_bytes = match self.bit_depth {
            0 => 0,
            1 => (samples + 7) / 8,
            2..=8 => samples,
            _ => samples * 2,
        };
        line_bytes * line_count
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32(self.width);
        out.put_u32(self.height);
        out.put_u8(self.channels);
        out.put_u8(self.bit_depth);
        out.put_u8(self.major_order.into());
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self, TransportError> {
        let width = buf.get_u32()?;
        let height = buf.get_u32()?;
        let channels = buf.get_u8()?;
        let bit_depth = buf.get_u8()?;
        let major_order = MajorOrder::try_from(buf.get_u8()?)
            .map_err(|_| TransportError::Malformed("unknown major order"))?;
        if bit_depth > 16 {
            return Err(TransportError::Malformed("bit depth above 16"));
        }
        Ok(Self {
            width,
            height,
            channels,
            bit_depth,
            major_order,
        })
    }
}

/// Write a header and its pixels.
pub fn encode_image(header: &ImageHeader, pixels: &[u8], out: &mut Vec<u8>) {
    out.reserve(IMAGE_HEADER_LEN + pixels.len());
    header.encode(out);
    out.put_bytes(pixels);
}

/// Read a header and borrow its pixels from `buf`.
pub fn decode_image<'a>(buf: &mut &'a [u8]) -> Result<(ImageHeader, &'a [u8]), TransportError> {
    let header = ImageHeader::decode(buf)?;
    let size = usize::try_from(header.byte_size())
        .map_err(|_| TransportError::Malformed("image too large"))?;
    let pixels = buf.get_bytes(size)?;
    Ok((header, pixels))
}

/// Pack 8-bit row-major pixels into 1-bit column-major lines. Values of 128 and up are on.
pub fn pack_bits_column_major(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let stride = (height as usize + 7) / 8;
    let mut packed = vec![0u8; stride * width as usize];
    let bits = packed.view_bits_mut::<Msb0>();
    for (index, &value) in pixels.iter().enumerate() {
        if value >= 0x80 {
            let row = index / width as usize;
            let column = index % width as usize;
            bits.set(column * stride * 8 + row, true);
        }
    }
    packed
}

/// Unpack 1-bit column-major lines into 8-bit row-major pixels of 0 or 255.
pub fn unpack_bits_column_major(packed: &[u8], width: u32, height: u32) -> Vec<u8> {
    let stride = (height as usize + 7) / 8;
    let bits = packed.view_bits::<Msb0>();
    let mut pixels = vec![0u8; width as usize * height as usize];
    for row in 0..height as usize {
        for column in 0..width as usize {
            if bits.get(column * stride * 8 + row).map_or(false, |bit| *bit) {
                pixels[row * width as usize + column] = 0xFF;
            }
        }
    }
    pixels
}
