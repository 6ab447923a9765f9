// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use std::io;

use thiserror::Error;

use crate::device::{DeviceType, RunState};
use crate::project::{ImageId, SequenceId, TriggerAction};
use crate::timing::Ticks;
use crate::wire::Opcode;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Link-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing answered at the configured address or device node.
    #[error("no device found at {0}")]
    DeviceNotFound(String),

    /// The device is already claimed by another host.
    #[error("device is in use by another host")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame arrived that could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("the connection is closed")]
    Closed,

    #[error("no response to {0:?}")]
    ResponseTimeout(Opcode),
}

impl TransportError {
    /// Whether trying the same operation again has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Busy | TransportError::ResponseTimeout(_) => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }
}

/// Ways a [`Project`][crate::Project] can break the rules a device enforces at load time.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProjectError {
    #[error("the project has no components")]
    NoComponents,

    #[error("component 0 must be a controller, not {0:?}")]
    FirstComponentNotController(DeviceType),

    #[error("the project has {project} components but the device has {device}")]
    ComponentCountMismatch { project: usize, device: usize },

    #[error("component {index} is a {project:?} in the project but a {device:?} on the device")]
    ComponentTypeMismatch {
        index: usize,
        project: DeviceType,
        device: DeviceType,
    },

    #[error("sequence {sequence} targets {device_type:?}, which matches {matches} components")]
    UnboundSequence {
        sequence: SequenceId,
        device_type: DeviceType,
        matches: usize,
    },

    #[error("sequence {0} has a frame referring to image {1}, which is not in the project")]
    MissingImage(SequenceId, ImageId),

    #[error("image {image} is for {image_type:?} but sequence {sequence} runs on {target:?}")]
    IncompatibleImage {
        sequence: SequenceId,
        image: ImageId,
        image_type: DeviceType,
        target: DeviceType,
    },

    #[error("sequence {0} has no sequence items")]
    EmptySequence(SequenceId),

    #[error("sequence {0} has a sequence item with no frames")]
    EmptySequenceItem(SequenceId),

    #[error("streaming sequence {0} has a frame referring to a preloaded image")]
    PreloadedImageInStream(SequenceId),

    #[error("streaming sequence {0} has a frame without an image")]
    MissingStreamImage(SequenceId),

    #[error("preloaded sequence {0} has a frame carrying a streaming image")]
    StreamImageInPreload(SequenceId),

    #[error("sequence {sequence} has a {frame_time} frame, below the {minimum} minimum")]
    FrameTimeTooShort {
        sequence: SequenceId,
        frame_time: Ticks,
        minimum: Ticks,
    },

    #[error("sequence {sequence} reads rows {first}..{end} but the sensor has {rows}")]
    RoiOutOfBounds {
        sequence: SequenceId,
        first: u32,
        end: u32,
        rows: u32,
    },

    #[error("sequence {sequence} has an item repeat time {repeat_time} shorter than its frames ({frames})")]
    RepeatTimeTooShort {
        sequence: SequenceId,
        repeat_time: Ticks,
        frames: Ticks,
    },

    #[error("component {component} needs {required} bytes of image memory but only has {budget}")]
    MemoryBudget {
        component: usize,
        required: u64,
        budget: u64,
    },

    #[error("a trigger rule refers to component {0}, which is not in the project")]
    UnknownComponent(usize),

    #[error("a trigger rule refers to pin {pin} of component {component}, which does not exist")]
    UnknownTriggerPin { component: usize, pin: u8 },

    #[error("a trigger rule has no sources")]
    EmptyTriggerRule,

    #[error("more than one trigger rule drives {action:?} on component {component}")]
    DuplicateDestination {
        component: usize,
        action: TriggerAction,
    },

    /// The device refused the project for a reason the host did not catch.
    #[error("the device rejected the project: {0}")]
    Rejected(String),
}

/// Lookups that came up empty.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum NotFound {
    #[error("no image with id {0}")]
    Image(ImageId),

    #[error("no sequence with id {0}")]
    Sequence(SequenceId),

    #[error("no sequence item to add frames to for sequence {0}")]
    SequenceItem(SequenceId),

    #[error("no component at index {0}")]
    Component(usize),

    #[error("no component of type {0:?}")]
    DeviceType(DeviceType),

    #[error("unknown device type code {0:#06x}")]
    DeviceTypeCode(u16),

    #[error("no project has been loaded")]
    Project,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol mismatch: host speaks version {host}, device speaks {device}")]
    ProtocolMismatch { host: u16, device: u16 },

    #[error("invalid project: {0}")]
    InvalidProject(#[from] ProjectError),

    #[error("component {component} is {state:?}")]
    DeviceBusy { component: usize, state: RunState },

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    NotFound(#[from] NotFound),

    /// A status message from a component never reached the host, or the host had nowhere to put
    /// it.
    #[error("status messages from component {component} were lost")]
    StatusLost { component: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// Whether the error is a link failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(err) if err.is_retryable())
    }
}
