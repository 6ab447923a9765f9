// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Test patterns for DMDs.
//!
//! Everything here is plain computation on densely packed 8-bit row-major buffers, ready for
//! [`Image::from_row_major_8bit`][crate::Image::from_row_major_8bit]. Binary patterns use 0 and
//! 255.
use num_traits::{Float, FloatConst};

use crate::util::is_bit_set;

const ON: u8 = 255;

/// A row-major 8-bit pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Pattern {
    fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; width as usize * height as usize],
        }
    }

    fn from_fn<F>(width: u32, height: u32, mut value: F) -> Self
    where
        F: FnMut(u32, u32) -> u8,
    {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for row in 0..height {
            for column in 0..width {
                pixels.push(value(row, column));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn get(&self, row: u32, column: u32) -> u8 {
        self.pixels[(row * self.width + column) as usize]
    }

    /// The pattern with every pixel inverted.
    pub fn inverse(&self) -> Self {
        Self {
            pixels: self.pixels.iter().map(|p| ON - p).collect(),
            ..*self
        }
    }
}

/// Bits needed to give each of `count` positions its own code.
fn code_bits(count: u32) -> u32 {
    count.max(1).next_power_of_two().trailing_zeros()
}

/// The `index`-th (MSB first) bit of the reflected binary code of `position`, for codes
/// `bits` wide.
fn gray_bit(position: u32, bits: u32, index: u32) -> bool {
    let gray = position ^ (position >> 1);
    is_bit_set(gray, (bits - index - 1) as usize)
}

/// Gray code patterns for structured light.
///
/// The first pattern is all white. Then come the column codes (vertical stripes, MSB first),
/// then the row codes (horizontal stripes). Codes are centered: when the width is not a power of
/// two, the unused codes are split evenly between both edges.
pub fn gray_codes(width: u32, height: u32) -> Vec<Pattern> {
    let column_bits = code_bits(width);
    let column_shift = ((1u32 << column_bits) - width) / 2;
    let row_bits = code_bits(height);
    let row_shift = ((1u32 << row_bits) - height) / 2;

    let mut patterns = Vec::with_capacity((1 + column_bits + row_bits) as usize);
    patterns.push(Pattern::filled(width, height, ON));
    for index in 0..column_bits {
        patterns.push(Pattern::from_fn(width, height, |_, column| {
            gray_bit(column + column_shift, column_bits, index) as u8 * ON
        }));
    }
    for index in 0..row_bits {
        patterns.push(Pattern::from_fn(width, height, |row, _| {
            gray_bit(row + row_shift, row_bits, index) as u8 * ON
        }));
    }
    patterns
}

/// A checkerboard of `square_width` by `square_height` squares and its inverse. The top left
/// square is dark.
pub fn checkerboards(
    width: u32,
    height: u32,
    square_width: u32,
    square_height: u32,
) -> [Pattern; 2] {
    let board = Pattern::from_fn(width, height, |row, column| {
        let parity = column / square_width.max(1) + row / square_height.max(1);
        (parity % 2) as u8 * ON
    });
    let inverse = board.inverse();
    [board, inverse]
}

/// A sine wave rescaled to `0..=255`.
fn sine_level<F: Float + FloatConst>(position: F, wavelength: F, phase: F) -> u8 {
    let two_pi = F::PI() + F::PI();
    let value = (position / wavelength * two_pi + phase * two_pi).sin();
    let scaled = (value + F::one()) * F::from(ON).unwrap_or_else(F::one) / (F::one() + F::one());
    scaled.round().to_u8().unwrap_or(0)
}

/// Phase-shifted sinusoidal fringes.
///
/// Returns `phases` patterns varying along the columns, followed by `phases` varying along the
/// rows. Pattern `i` of each set is shifted by `i / phases` of a period. `wavelength` is in
/// pixels.
pub fn sinusoids(width: u32, height: u32, phases: u32, wavelength: f32) -> Vec<Pattern> {
    let mut patterns = Vec::with_capacity(phases as usize * 2);
    for i in 0..phases {
        let phase = i as f32 / phases as f32;
        patterns.push(Pattern::from_fn(width, height, |_, column| {
            sine_level(column as f32, wavelength, phase)
        }));
    }
    for i in 0..phases {
        let phase = i as f32 / phases as f32;
        patterns.push(Pattern::from_fn(width, height, |row, _| {
            sine_level(row as f32, wavelength, phase)
        }));
    }
    patterns
}

/// Extract one bitplane of one channel from interleaved 8-bit pixels, as 0 or 255 per pixel.
pub fn bitplane(pixels: &[u8], channels: usize, channel: usize, bit: u8) -> Vec<u8> {
    pixels
        .iter()
        .skip(channel)
        .step_by(channels.max(1))
        .map(|&value| is_bit_set(value, bit as usize) as u8 * ON)
        .collect()
}
