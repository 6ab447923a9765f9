// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Grayscale and color DMD items, built from binary-weighted bitplanes.
use super::{Frame, Image, ImageId, Project, SequenceId, SequenceItem};
use crate::error::{Error, NotFound, Result};
use crate::patterns::bitplane;
use crate::timing::{color_display_time, Ticks};

const BITS_PER_CHANNEL: u8 = 8;

impl Project {
    /// Append an 8-bit grayscale image to `sequence` as one item of 8 bitplane frames.
    ///
    /// The bitplanes become images `first_image..first_image + 8`. Bit `b` is shown for
    /// `display_time * 2^b / 255`, but never less than the DMD minimum frame time. If that leaves
    /// the item shorter than `display_time`, the item's repeat time pads it out. Returns the first
    /// image id after the ones used.
    #[allow(clippy::too_many_arguments)]
    pub fn add_grayscale_sequence_item(
        &mut self,
        sequence: SequenceId,
        first_image: ImageId,
        width: u32,
        height: u32,
        pixels: &[u8],
        display_time: Ticks,
        repeat_count: u32,
    ) -> Result<ImageId> {
        self.add_bitplane_item(
            sequence,
            first_image,
            (width, height),
            pixels,
            1,
            display_time,
            display_time,
            repeat_count,
        )
    }

    /// Append an interleaved 8-bit RGB image to `sequence` as one item of 24 bitplane frames, each
    /// lighting only its channel's LED.
    ///
    /// `period` is the time the whole item takes; the bitplanes share what is left after one DMD
    /// FOT per bitplane. Returns the first image id after the ones used.
    #[allow(clippy::too_many_arguments)]
    pub fn add_color_sequence_item(
        &mut self,
        sequence: SequenceId,
        first_image: ImageId,
        width: u32,
        height: u32,
        pixels: &[u8],
        period: Ticks,
        repeat_count: u32,
    ) -> Result<ImageId> {
        let per_channel = Ticks(color_display_time(period).0 / 3);
        self.add_bitplane_item(
            sequence,
            first_image,
            (width, height),
            pixels,
            3,
            per_channel,
            period,
            repeat_count,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn add_bitplane_item(
        &mut self,
        sequence_id: SequenceId,
        first_image: ImageId,
        (width, height): (u32, u32),
        pixels: &[u8],
        channels: usize,
        channel_time: Ticks,
        period: Ticks,
        repeat_count: u32,
    ) -> Result<ImageId> {
        let device_type = self
            .sequence(sequence_id)
            .ok_or(NotFound::Sequence(sequence_id))?
            .device_type();
        if !device_type.is_dmd() {
            return Err(Error::InvalidArgument("bitplane items need a DMD sequence"));
        }
        if pixels.len() != width as usize * height as usize * channels {
            return Err(Error::InvalidArgument(
                "pixel count does not match image dimensions",
            ));
        }
        let planes = channels as u16 * BITS_PER_CHANNEL as u16;
        let last = first_image
            .0
            .checked_add(planes)
            .ok_or(Error::InvalidArgument("not enough image ids left"))?;
        let minimum = device_type.min_frame_time();
        let mut item = SequenceItem::new(sequence_id, repeat_count);
        let mut next_id = first_image.0;
        for channel in 0..channels {
            for bit in 0..BITS_PER_CHANNEL {
                let plane = bitplane(pixels, channels, channel, bit);
                let id = ImageId(next_id);
                next_id += 1;
                self.add_image(Image::from_row_major_8bit(
                    id,
                    width,
                    height,
                    &plane,
                    device_type,
                )?);
                let weighted = Ticks(channel_time.0 * (1 << bit) / 255);
                let mut frame = Frame::new(sequence_id, id, weighted.max(minimum));
                if channels == 3 {
                    frame.set_led_enable(1 << channel);
                }
                item.add_frame(frame);
            }
        }
        if period > item.frame_time_total() {
            item.set_repeat_time(period);
        }
        self.add_sequence_item(item)?;
        Ok(ImageId(last))
    }
}
