// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::NotFound;
use crate::project::SequenceId;
use crate::timing::{Ticks, CAMERA_MIN_FRAME_TIME, CMV_FOT, DMD_MIN_FRAME_TIME};

/// The number of external trigger pins (in each direction) on a controller.
pub const CONTROLLER_TRIGGER_PINS: u8 = 4;

/// Every kind of hardware a project can describe.
///
/// The numeric codes are what goes over the wire. Devices reject codes they do not know.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u16)]
pub enum DeviceType {
    AjileController = 0x0001,
    Ajile2PortController = 0x0002,
    Ajile3PortController = 0x0003,
    DmdCameraController = 0x0004,
    Dmd4500 = 0x0100,
    Dmd3000 = 0x0101,
    Cmv4000Mono = 0x0200,
    Cmv2000Mono = 0x0201,
}

impl DeviceType {
    /// Look up a device type from its wire code.
    pub fn from_code(code: u16) -> Result<Self, NotFound> {
        Self::try_from_primitive(code).map_err(|_| NotFound::DeviceTypeCode(code))
    }

    pub fn code(self) -> u16 {
        self.into()
    }

    pub fn is_controller(self) -> bool {
        matches!(
            self,
            DeviceType::AjileController
                | DeviceType::Ajile2PortController
                | DeviceType::Ajile3PortController
                | DeviceType::DmdCameraController
        )
    }

    pub fn is_dmd(self) -> bool {
        matches!(self, DeviceType::Dmd4500 | DeviceType::Dmd3000)
    }

    pub fn is_camera(self) -> bool {
        matches!(self, DeviceType::Cmv4000Mono | DeviceType::Cmv2000Mono)
    }

    /// The imaging geometry of the device, if it has one.
    pub fn geometry(self) -> Option<Geometry> {
        match self {
            DeviceType::Dmd4500 => Some(Geometry::new(912, 1140, 1)),
            DeviceType::Dmd3000 => Some(Geometry::new(684, 608, 1)),
            DeviceType::Cmv4000Mono => Some(Geometry::new(2048, 2048, 10)),
            DeviceType::Cmv2000Mono => Some(Geometry::new(1088, 2048, 10)),
            _ => None,
        }
    }

    /// The memory set aside for images when a component is created for this device.
    pub fn default_image_memory(self) -> u64 {
        match self {
            DeviceType::Dmd4500 | DeviceType::Dmd3000 => 0x1000_0000,
            DeviceType::Cmv4000Mono | DeviceType::Cmv2000Mono => 0x4000_0000,
            _ => 0x2000_0000,
        }
    }

    /// The number of external trigger pins in each direction.
    pub fn trigger_pins(self) -> u8 {
        if self.is_controller() {
            CONTROLLER_TRIGGER_PINS
        } else {
            0
        }
    }

    /// The shortest frame time the device can run.
    pub fn min_frame_time(self) -> Ticks {
        if self.is_dmd() {
            DMD_MIN_FRAME_TIME
        } else if self.is_camera() {
            CAMERA_MIN_FRAME_TIME
        } else {
            Ticks::ZERO
        }
    }

    /// Time a frame occupies beyond its frame time.
    pub fn frame_overhead(self) -> Ticks {
        if self.is_camera() {
            CMV_FOT
        } else {
            Ticks::ZERO
        }
    }
}

/// The pixel layout of an imaging device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub rows: u32,
    pub columns: u32,
    pub bit_depth: u8,
}

impl Geometry {
    pub const fn new(rows: u32, columns: u32, bit_depth: u8) -> Self {
        Self {
            rows,
            columns,
            bit_depth,
        }
    }
}

/// Per-component run-state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RunState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Paused = 4,
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Stopped
    }
}

/// The order pixels are stored in.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum MajorOrder {
    Row = 0,
    Column = 1,
}

/// What a [`SequenceStatusValues`] reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StatusCode {
    /// A frame started.
    FrameStarted = 0,

    /// A streaming sequence ran out of items; the last frame is being held.
    Underrun = 1,

    /// A camera has a frame it cannot hand to the host until the host frees a slot.
    Backpressure = 2,
}

/// The position of a frame within its sequence. All indices are 0-based.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FramePosition {
    pub sequence: SequenceId,
    pub item: u32,
    pub frame: u32,
}

/// One report from a running component.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequenceStatusValues {
    pub code: StatusCode,
    pub position: FramePosition,

    /// Frames started since the sequence was started, counting this one.
    pub frame_count: u64,

    /// Device time of the event.
    pub timestamp: Ticks,
}

impl SequenceStatusValues {
    pub fn sequence_id(&self) -> SequenceId {
        self.position.sequence
    }

    pub fn item_index(&self) -> u32 {
        self.position.item
    }

    pub fn frame_index(&self) -> u32 {
        self.position.frame
    }
}
