// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::arena::PooledPixels;
use crate::device::{DeviceType, MajorOrder};
use crate::error::{Error, Result};
use crate::wire::image::{pack_bits_column_major, ImageHeader};

/// Identifies an image within a project. Id 0 means "no image".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ImageId(pub u16);

impl ImageId {
    pub const NONE: ImageId = ImageId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pixel storage, tagged with who owns it.
///
/// Every variant is reference counted, so cloning an [`Image`] (or a whole project) never copies
/// pixels. Use [`Image::materialize`] for a private copy.
#[derive(Clone, Default)]
pub enum PixelBuffer {
    #[default]
    Empty,

    /// Pixels created by this library.
    Owned(Arc<[u8]>),

    /// Pixels the application also holds on to, for example a streaming image it keeps
    /// reusing. The application must not need them to change until the frame carrying them has
    /// been sent.
    Shared(Arc<[u8]>),

    /// Pixels on loan from a camera's [`ImageArena`][crate::arena::ImageArena].
    Pooled(Arc<PooledPixels>),
}

impl PixelBuffer {
    pub fn owned(pixels: Vec<u8>) -> Self {
        PixelBuffer::Owned(pixels.into())
    }

    pub fn shared(pixels: Arc<[u8]>) -> Self {
        PixelBuffer::Shared(pixels)
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            PixelBuffer::Empty => &[],
            PixelBuffer::Owned(pixels) | PixelBuffer::Shared(pixels) => &pixels[..],
            PixelBuffer::Pooled(pixels) => &pixels[..],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PixelBuffer::Empty => "Empty",
            PixelBuffer::Owned(_) => "Owned",
            PixelBuffer::Shared(_) => "Shared",
            PixelBuffer::Pooled(_) => "Pooled",
        };
        f.debug_tuple(kind).field(&self.len()).finish()
    }
}

/// A pixel buffer and the metadata describing it.
#[derive(Clone, Debug)]
pub struct Image {
    id: ImageId,
    header: ImageHeader,
    device_type: Option<DeviceType>,
    pixels: PixelBuffer,
}

impl Image {
    /// An empty 8-bit row-major image.
    pub fn new(id: ImageId) -> Self {
        Self {
            id,
            header: ImageHeader {
                width: 0,
                height: 0,
                channels: 1,
                bit_depth: 8,
                major_order: MajorOrder::Row,
            },
            device_type: None,
            pixels: PixelBuffer::Empty,
        }
    }

    /// An image descriptor shaped like `device_type`'s native images, without any pixels.
    ///
    /// Camera frames refer to images like these as the place to store what they capture.
    pub fn for_device(id: ImageId, device_type: DeviceType) -> Self {
        let geometry = device_type.geometry().unwrap_or_default();
        let major_order = if device_type.is_dmd() {
            MajorOrder::Column
        } else {
            MajorOrder::Row
        };
        Self {
            id,
            header: ImageHeader {
                width: geometry.columns,
                height: geometry.rows,
                channels: 1,
                bit_depth: geometry.bit_depth.max(1),
                major_order,
            },
            device_type: Some(device_type),
            pixels: PixelBuffer::Empty,
        }
    }

    /// Build an image for `device_type` from 8-bit row-major pixels.
    ///
    /// DMD images are thresholded (128 and up is on) and packed into the DMD's native column-major
    /// 1-bit layout. Camera images keep their 8-bit row-major layout.
    pub fn from_row_major_8bit(
        id: ImageId,
        width: u32,
        height: u32,
        pixels: &[u8],
        device_type: DeviceType,
    ) -> Result<Self> {
        if pixels.len() != width as usize * height as usize {
            return Err(Error::InvalidArgument(
                "pixel count does not match image dimensions",
            ));
        }
        let (header, packed) = if device_type.is_dmd() {
            let header = ImageHeader {
                width,
                height,
                channels: 1,
                bit_depth: 1,
                major_order: MajorOrder::Column,
            };
            (header, pack_bits_column_major(pixels, width, height))
        } else if device_type.is_camera() {
            let header = ImageHeader {
                width,
                height,
                channels: 1,
                bit_depth: 8,
                major_order: MajorOrder::Row,
            };
            (header, pixels.to_vec())
        } else {
            return Err(Error::InvalidArgument("controllers do not have images"));
        };
        Ok(Self {
            id,
            header,
            device_type: Some(device_type),
            pixels: PixelBuffer::owned(packed),
        })
    }

    /// Wrap already packed pixels. `pixels` must be empty or exactly the size `header` describes.
    pub fn from_parts(
        id: ImageId,
        header: ImageHeader,
        device_type: Option<DeviceType>,
        pixels: PixelBuffer,
    ) -> Result<Self> {
        if !pixels.is_empty() && pixels.len() as u64 != header.byte_size() {
            return Err(Error::InvalidArgument(
                "pixel buffer does not match image header",
            ));
        }
        Ok(Self {
            id,
            header,
            device_type,
            pixels,
        })
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn set_id(&mut self, id: ImageId) {
        self.id = id;
    }

    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn channels(&self) -> u8 {
        self.header.channels
    }

    pub fn bit_depth(&self) -> u8 {
        self.header.bit_depth
    }

    pub fn major_order(&self) -> MajorOrder {
        self.header.major_order
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.device_type
    }

    pub fn header(&self) -> ImageHeader {
        self.header
    }

    /// Change the bit depth of a descriptor. Any pixels are dropped.
    pub fn set_bit_depth(&mut self, bit_depth: u8) {
        self.header.bit_depth = bit_depth;
        self.pixels = PixelBuffer::Empty;
    }

    /// Change the height of a descriptor, e.g. to match a camera ROI. Any pixels are dropped.
    pub fn set_height(&mut self, height: u32) {
        self.header.height = height;
        self.pixels = PixelBuffer::Empty;
    }

    /// Change the width of a descriptor. Any pixels are dropped.
    pub fn set_width(&mut self, width: u32) {
        self.header.width = width;
        self.pixels = PixelBuffer::Empty;
    }

    /// The number of bytes this image occupies on a device, with or without pixels attached.
    pub fn byte_size(&self) -> u64 {
        self.header.byte_size()
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    pub fn pixel_buffer(&self) -> &PixelBuffer {
        &self.pixels
    }

    /// True when no pixels are attached.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// A copy of this image that owns its own pixels.
    pub fn materialize(&self) -> Image {
        let pixels = match &self.pixels {
            PixelBuffer::Empty => PixelBuffer::Empty,
            other => PixelBuffer::owned(other.as_slice().to_vec()),
        };
        Image {
            pixels,
            ..self.clone()
        }
    }

    /// Read one sample, whatever the layout. Out of range reads return 0.
    pub fn sample(&self, row: u32, column: u32, channel: u8) -> u16 {
        let header = &self.header;
        if row >= header.height || column >= header.width || channel >= header.channels {
            return 0;
        }
        let pixels = self.pixels();
        let (major, minor, minor_len) = match header.major_order {
            MajorOrder::Row => (row as usize, column as usize, header.width as usize),
            MajorOrder::Column => (column as usize, row as usize, header.height as usize),
        };
        let channels = header.channels as usize;
        match header.bit_depth {
            0 => 0,
            1 => {
                let stride = (minor_len * channels + 7) / 8;
                let bit = minor * channels + channel as usize;
                pixels
                    .get(major * stride + bit / 8)
                    .map_or(0, |byte| ((byte >> (7 - bit % 8)) & 1) as u16)
            }
            2..=8 => {
                let index = (major * minor_len + minor) * channels + channel as usize;
                pixels.get(index).map_or(0, |&value| value as u16)
            }
            _ => {
                let index = ((major * minor_len + minor) * channels + channel as usize) * 2;
                match pixels.get(index..index + 2) {
                    Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]),
                    None => 0,
                }
            }
        }
    }
}
