// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use crate::error::TransportError;

/// Little-endian reads from the front of a byte slice, for the wire codec.
///
/// Running out of data is an error instead of a panic, as every byte here came from the other
/// end of a link and can be truncated or corrupted.
pub(crate) trait Buffer<'a> {
    fn remaining(&self) -> usize;
    fn get_bytes(&mut self, count: usize) -> Result<&'a [u8], TransportError>;

    fn get_u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.get_bytes(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, TransportError> {
        let bytes = self.get_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn get_u32(&mut self) -> Result<u32, TransportError> {
        let bytes = self.get_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn get_u64(&mut self) -> Result<u64, TransportError> {
        let bytes = self.get_bytes(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(array))
    }

    fn get_bool(&mut self) -> Result<bool, TransportError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(TransportError::Malformed("boolean out of range")),
        }
    }

    /// Strings are a `u16` length followed by that many bytes of UTF-8.
    fn get_string(&mut self) -> Result<String, TransportError> {
        let length = self.get_u16()? as usize;
        let bytes = self.get_bytes(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TransportError::Malformed("string is not UTF-8"))
    }
}

impl<'a> Buffer<'a> for &'a [u8] {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn get_bytes(&mut self, count: usize) -> Result<&'a [u8], TransportError> {
        if self.len() < count {
            return Err(TransportError::Malformed("message truncated"));
        }
        let slice: &'a [u8] = *self;
        let (bytes, rest) = slice.split_at(count);
        *self = rest;
        Ok(bytes)
    }
}

/// The writing half of [`Buffer`].
pub(crate) trait BufferMut {
    fn put_bytes(&mut self, bytes: &[u8]);

    fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes());
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn put_string(&mut self, value: &str) {
        // Names longer than a u16 can describe are cut off at a character boundary.
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.put_u16(end as u16);
        self.put_bytes(&value.as_bytes()[..end]);
    }
}

impl BufferMut for Vec<u8> {
    fn put_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Check if the n-th bit is set.
///
/// Bits are 0-indexed, from the LSB.
pub(crate) fn is_bit_set<B>(value: B, index: usize) -> bool
where
    B: num_traits::PrimInt + num_traits::Unsigned,
{
    (value & (B::one() << index)) > B::zero()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_are_little_endian() {
        let data = [0x01u8, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut buf = &data[..];
        assert_eq!(buf.get_u8().unwrap(), 0x01);
        assert_eq!(buf.get_u16().unwrap(), 0x1234);
        assert_eq!(buf.get_u32().unwrap(), 0x1234_5678);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn truncated_read_is_an_error() {
        let data = [0x01u8];
        let mut buf = &data[..];
        assert!(buf.get_u32().is_err());
    }

    #[test]
    fn string_round_trip() {
        let mut out = Vec::new();
        out.put_string("checkerboard");
        out.put_u64(u64::MAX - 1);
        let mut buf = &out[..];
        assert_eq!(buf.get_string().unwrap(), "checkerboard");
        assert_eq!(buf.get_u64().unwrap(), u64::MAX - 1);
    }

    #[test]
    fn bit_set() {
        assert!(is_bit_set(0b0100u8, 2));
        assert!(!is_bit_set(0b0100u8, 1));
        assert!(is_bit_set(0x8000u16, 15));
    }
}
