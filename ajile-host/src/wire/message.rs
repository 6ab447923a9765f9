// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use std::sync::Arc;

use log::debug;

use super::codec::*;
use super::{Opcode, ResultCode, PROTOCOL_VERSION};
use crate::arena::ImageArena;
use crate::device::{DeviceType, FramePosition, RunState, SequenceStatusValues};
use crate::error::{Error, NotFound, ProjectError, TransportError};
use crate::project::{
    Component, Image, ImageId, PixelBuffer, Sequence, SequenceId, SequenceItem, TriggerRule,
};
use crate::timing::Ticks;
use crate::util::{Buffer, BufferMut};

/// How [`Request::RetrieveImage`] addresses a captured image.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RetrieveFrom {
    /// The most recent capture into a preloaded image id.
    Image(ImageId),

    /// The most recent capture at a position in a sequence.
    Frame(FramePosition),
}

/// Everything the host can ask of a device.
#[derive(Clone, Debug)]
pub enum Request {
    Hello { version: u16 },
    EnumerateComponents,

    /// Start staging a project. Nothing is visible to a running device until
    /// [`Request::LoadCommit`].
    LoadBegin { name: String },
    LoadComponent { index: usize, component: Component },
    LoadImage(Image),
    LoadSequence(Sequence),
    LoadTriggerRule(TriggerRule),
    LoadCommit,
    LoadAbort,

    StartSequence {
        sequence: SequenceId,
        component: usize,
        stride: u32,
    },
    StopSequence { component: usize },
    NextSequenceItem { component: usize },
    GotoSequenceItem { component: usize, item: u32 },
    AddStreamingItem { component: usize, item: SequenceItem },

    /// Capture the next `count` frames, with `credits` free slots on the host to put them in.
    AcquireImages {
        component: usize,
        count: u32,
        credits: u32,
    },
    RetrieveImage(RetrieveFrom),
    ReturnImageCredit { component: usize, credits: u32 },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Hello { .. } => Opcode::Hello,
            Request::EnumerateComponents => Opcode::EnumerateComponents,
            Request::LoadBegin { .. } => Opcode::LoadBegin,
            Request::LoadComponent { .. } => Opcode::LoadComponent,
            Request::LoadImage(_) => Opcode::LoadImage,
            Request::LoadSequence(_) => Opcode::LoadSequence,
            Request::LoadTriggerRule(_) => Opcode::LoadTriggerRule,
            Request::LoadCommit => Opcode::LoadCommit,
            Request::LoadAbort => Opcode::LoadAbort,
            Request::StartSequence { .. } => Opcode::StartSequence,
            Request::StopSequence { .. } => Opcode::StopSequence,
            Request::NextSequenceItem { .. } => Opcode::NextSequenceItem,
            Request::GotoSequenceItem { .. } => Opcode::GotoSequenceItem,
            Request::AddStreamingItem { .. } => Opcode::AddStreamingItem,
            Request::AcquireImages { .. } => Opcode::AcquireImages,
            Request::RetrieveImage(_) => Opcode::RetrieveImage,
            Request::ReturnImageCredit { .. } => Opcode::ReturnImageCredit,
        }
    }

    /// The request's payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Request::Hello { version } => out.put_u16(*version),
            Request::EnumerateComponents | Request::LoadCommit | Request::LoadAbort => (),
            Request::LoadBegin { name } => out.put_string(name),
            Request::LoadComponent { index, component } => {
                put_index(&mut out, *index);
                put_component(&mut out, component);
            }
            Request::LoadImage(image) => put_image(&mut out, image),
            Request::LoadSequence(sequence) => put_sequence(&mut out, sequence),
            Request::LoadTriggerRule(rule) => put_trigger_rule(&mut out, rule),
            Request::StartSequence {
                sequence,
                component,
                stride,
            } => {
                out.put_u16(sequence.0);
                put_index(&mut out, *component);
                out.put_u32(*stride);
            }
            Request::StopSequence { component } | Request::NextSequenceItem { component } => {
                put_index(&mut out, *component)
            }
            Request::GotoSequenceItem { component, item } => {
                put_index(&mut out, *component);
                out.put_u32(*item);
            }
            Request::AddStreamingItem { component, item } => {
                put_index(&mut out, *component);
                put_sequence_item(&mut out, item);
            }
            Request::AcquireImages {
                component,
                count,
                credits,
            } => {
                put_index(&mut out, *component);
                out.put_u32(*count);
                out.put_u32(*credits);
            }
            Request::RetrieveImage(RetrieveFrom::Image(id)) => {
                out.put_u8(0);
                out.put_u16(id.0);
            }
            Request::RetrieveImage(RetrieveFrom::Frame(position)) => {
                out.put_u8(1);
                put_position(&mut out, position);
            }
            Request::ReturnImageCredit { component, credits } => {
                put_index(&mut out, *component);
                out.put_u32(*credits);
            }
        }
        out
    }

    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, TransportError> {
        let buf = &mut &payload[..];
        let request = match opcode {
            Opcode::Hello => Request::Hello {
                version: buf.get_u16()?,
            },
            Opcode::EnumerateComponents => Request::EnumerateComponents,
            Opcode::LoadBegin => Request::LoadBegin {
                name: buf.get_string()?,
            },
            Opcode::LoadComponent => Request::LoadComponent {
                index: get_index(buf)?,
                component: get_component(buf)?,
            },
            Opcode::LoadImage => Request::LoadImage(get_image(buf)?),
            Opcode::LoadSequence => Request::LoadSequence(get_sequence(buf)?),
            Opcode::LoadTriggerRule => Request::LoadTriggerRule(get_trigger_rule(buf)?),
            Opcode::LoadCommit => Request::LoadCommit,
            Opcode::LoadAbort => Request::LoadAbort,
            Opcode::StartSequence => Request::StartSequence {
                sequence: SequenceId(buf.get_u16()?),
                component: get_index(buf)?,
                stride: buf.get_u32()?,
            },
            Opcode::StopSequence => Request::StopSequence {
                component: get_index(buf)?,
            },
            Opcode::NextSequenceItem => Request::NextSequenceItem {
                component: get_index(buf)?,
            },
            Opcode::GotoSequenceItem => Request::GotoSequenceItem {
                component: get_index(buf)?,
                item: buf.get_u32()?,
            },
            Opcode::AddStreamingItem => Request::AddStreamingItem {
                component: get_index(buf)?,
                item: get_sequence_item(buf)?,
            },
            Opcode::AcquireImages => Request::AcquireImages {
                component: get_index(buf)?,
                count: buf.get_u32()?,
                credits: buf.get_u32()?,
            },
            Opcode::RetrieveImage => Request::RetrieveImage(match buf.get_u8()? {
                0 => RetrieveFrom::Image(ImageId(buf.get_u16()?)),
                1 => RetrieveFrom::Frame(get_position(buf)?),
                _ => return Err(TransportError::Malformed("unknown retrieve mode")),
            }),
            Opcode::ReturnImageCredit => Request::ReturnImageCredit {
                component: get_index(buf)?,
                credits: buf.get_u32()?,
            },
            Opcode::Response | Opcode::Status | Opcode::AcquiredImage => {
                return Err(TransportError::Malformed("not a request"))
            }
        };
        Ok(request)
    }
}

/// A successful response.
#[derive(Clone, Debug)]
pub enum Reply {
    Done,
    Hello { version: u16 },
    Components(Vec<Component>),

    /// The project was accepted. Its images are committed to device memory in the background,
    /// with [`DeviceEvent::LoadComplete`] on the controller once they are.
    LoadCommitted { images_to_load: u32 },
    StreamingItemAdded { serial: u64 },
    Retrieved(Option<AcquiredImage>),
}

impl Reply {
    /// The response payload, result byte included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![ResultCode::Ok.into()];
        match self {
            Reply::Done => (),
            Reply::Hello { version } => out.put_u16(*version),
            Reply::Components(components) => {
                out.put_u16(components.len() as u16);
                for component in components {
                    put_component(&mut out, component);
                }
            }
            Reply::LoadCommitted { images_to_load } => out.put_u32(*images_to_load),
            Reply::StreamingItemAdded { serial } => out.put_u64(*serial),
            Reply::Retrieved(image) => {
                out.put_bool(image.is_some());
                if let Some(image) = image {
                    image.encode_into(&mut out);
                }
            }
        }
        out
    }

    /// Decode the response to a `request`, turning device errors into [`Error`]s.
    pub fn decode(request: Opcode, payload: &[u8]) -> crate::Result<Self> {
        let buf = &mut &payload[..];
        let code = ResultCode::try_from(buf.get_u8()?)
            .map_err(|_| TransportError::Malformed("unknown result code"))?;
        if code != ResultCode::Ok {
            return Err(decode_error(code, buf)?);
        }
        let reply = match request {
            Opcode::Hello => Reply::Hello {
                version: buf.get_u16()?,
            },
            Opcode::EnumerateComponents => {
                let count = buf.get_u16()?;
                let components = (0..count)
                    .map(|_| get_component(buf))
                    .collect::<Result<_, _>>()?;
                Reply::Components(components)
            }
            Opcode::LoadCommit => Reply::LoadCommitted {
                images_to_load: buf.get_u32()?,
            },
            Opcode::AddStreamingItem => Reply::StreamingItemAdded {
                serial: buf.get_u64()?,
            },
            Opcode::RetrieveImage => Reply::Retrieved(if buf.get_bool()? {
                Some(AcquiredImage::decode_from(buf, None)?)
            } else {
                None
            }),
            _ => Reply::Done,
        };
        Ok(reply)
    }
}

const NOT_FOUND_IMAGE: u8 = 0;
const NOT_FOUND_SEQUENCE: u8 = 1;
const NOT_FOUND_SEQUENCE_ITEM: u8 = 2;
const NOT_FOUND_COMPONENT: u8 = 3;
const NOT_FOUND_DEVICE_TYPE: u8 = 4;
const NOT_FOUND_PROJECT: u8 = 5;

/// The response payload reporting `err`.
pub fn encode_error(err: &Error) -> Vec<u8> {
    let mut out = Vec::new();
    match err {
        Error::InvalidProject(project) => {
            out.put_u8(ResultCode::InvalidProject.into());
            out.put_string(&project.to_string());
        }
        Error::DeviceBusy { component, state } => {
            out.put_u8(ResultCode::DeviceBusy.into());
            put_index(&mut out, *component);
            out.put_u8((*state).into());
        }
        Error::NotFound(not_found) => {
            out.put_u8(ResultCode::NotFound.into());
            let (kind, value) = match *not_found {
                NotFound::Image(id) => (NOT_FOUND_IMAGE, id.0),
                NotFound::Sequence(id) => (NOT_FOUND_SEQUENCE, id.0),
                NotFound::SequenceItem(id) => (NOT_FOUND_SEQUENCE_ITEM, id.0),
                NotFound::Component(index) => (NOT_FOUND_COMPONENT, index as u16),
                NotFound::DeviceType(device_type) => (NOT_FOUND_DEVICE_TYPE, device_type.code()),
                NotFound::DeviceTypeCode(code) => (NOT_FOUND_DEVICE_TYPE, code),
                NotFound::Project => (NOT_FOUND_PROJECT, 0),
            };
            out.put_u8(kind);
            out.put_u16(value);
        }
        Error::ProtocolMismatch { .. } => {
            out.put_u8(ResultCode::ProtocolMismatch.into());
            out.put_u16(PROTOCOL_VERSION);
        }
        other => {
            out.put_u8(ResultCode::InvalidArgument.into());
            out.put_string(&other.to_string());
        }
    }
    out
}

fn decode_error(code: ResultCode, buf: &mut &[u8]) -> Result<Error, TransportError> {
    let err = match code {
        ResultCode::Ok => return Err(TransportError::Malformed("success is not an error")),
        ResultCode::InvalidProject => {
            Error::InvalidProject(ProjectError::Rejected(buf.get_string()?))
        }
        ResultCode::DeviceBusy => Error::DeviceBusy {
            component: get_index(buf)?,
            state: get_run_state(buf)?,
        },
        ResultCode::NotFound => {
            let kind = buf.get_u8()?;
            let value = buf.get_u16()?;
            Error::NotFound(match kind {
                NOT_FOUND_IMAGE => NotFound::Image(ImageId(value)),
                NOT_FOUND_SEQUENCE => NotFound::Sequence(SequenceId(value)),
                NOT_FOUND_SEQUENCE_ITEM => NotFound::SequenceItem(SequenceId(value)),
                NOT_FOUND_COMPONENT => NotFound::Component(value as usize),
                NOT_FOUND_DEVICE_TYPE => DeviceType::from_code(value)
                    .map_or_else(|err| err, NotFound::DeviceType),
                NOT_FOUND_PROJECT => NotFound::Project,
                _ => return Err(TransportError::Malformed("unknown not-found kind")),
            })
        }
        ResultCode::ProtocolMismatch => Error::ProtocolMismatch {
            host: PROTOCOL_VERSION,
            device: buf.get_u16()?,
        },
        ResultCode::InvalidArgument => {
            let message = buf.get_string()?;
            debug!("Device rejected a request: {}", message);
            Error::InvalidArgument("rejected by the device")
        }
    };
    Ok(err)
}

/// Something a component reports without being asked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    RunState(RunState),
    Sequence(SequenceStatusValues),

    /// Every image of the last committed project is in device memory.
    LoadComplete,

    /// A streaming item has been shown (or discarded by a stop) and its slot is free.
    StreamItemDone { serial: u64 },

    /// A capture is stored and can be retrieved.
    ImageStored { capture_number: u64 },
}

/// An [`Opcode::Status`] frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusMessage {
    pub component: usize,

    /// Counts up by one for every status a component sends. A gap means a message was lost.
    pub sequence_number: u32,
    pub event: DeviceEvent,
}

impl StatusMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        put_index(&mut out, self.component);
        out.put_u32(self.sequence_number);
        match &self.event {
            DeviceEvent::RunState(state) => {
                out.put_u8(0);
                out.put_u8((*state).into());
            }
            DeviceEvent::Sequence(status) => {
                out.put_u8(1);
                put_status_values(&mut out, status);
            }
            DeviceEvent::LoadComplete => out.put_u8(2),
            DeviceEvent::StreamItemDone { serial } => {
                out.put_u8(3);
                out.put_u64(*serial);
            }
            DeviceEvent::ImageStored { capture_number } => {
                out.put_u8(4);
                out.put_u64(*capture_number);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        let buf = &mut &payload[..];
        let component = get_index(buf)?;
        let sequence_number = buf.get_u32()?;
        let event = match buf.get_u8()? {
            0 => DeviceEvent::RunState(get_run_state(buf)?),
            1 => DeviceEvent::Sequence(get_status_values(buf)?),
            2 => DeviceEvent::LoadComplete,
            3 => DeviceEvent::StreamItemDone {
                serial: buf.get_u64()?,
            },
            4 => DeviceEvent::ImageStored {
                capture_number: buf.get_u64()?,
            },
            _ => return Err(TransportError::Malformed("unknown device event")),
        };
        Ok(Self {
            component,
            sequence_number,
            event,
        })
    }
}

/// A camera capture on its way to the host.
#[derive(Clone, Debug)]
pub struct AcquiredImage {
    pub component: usize,

    /// Counts every capture since the camera's sequence was started, from 0.
    pub capture_number: u64,
    pub position: FramePosition,

    /// Device time the exposure started.
    pub timestamp: Ticks,
    pub image: Image,
}

impl AcquiredImage {
    /// The payload of an [`Opcode::AcquiredImage`] frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.image.pixels().len());
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        put_index(out, self.component);
        out.put_u64(self.capture_number);
        put_position(out, &self.position);
        out.put_u64(self.timestamp.0);
        put_image(out, &self.image);
    }

    /// Decode a capture, copying the pixels into `arena` if there is one.
    pub fn decode(payload: &[u8], arena: Option<&Arc<ImageArena>>) -> Result<Self, TransportError> {
        Self::decode_from(&mut &payload[..], arena)
    }

    fn decode_from(
        buf: &mut &[u8],
        arena: Option<&Arc<ImageArena>>,
    ) -> Result<Self, TransportError> {
        let component = get_index(buf)?;
        let capture_number = buf.get_u64()?;
        let position = get_position(buf)?;
        let timestamp = Ticks(buf.get_u64()?);
        let image = match arena {
            Some(arena) => get_image_with(buf, |pixels| {
                PixelBuffer::Pooled(Arc::new(arena.copy_from(pixels)))
            })?,
            None => get_image(buf)?,
        };
        Ok(Self {
            component,
            capture_number,
            position,
            timestamp,
            image,
        })
    }

    /// The component a capture payload came from, without decoding the rest.
    pub fn peek_component(payload: &[u8]) -> Result<usize, TransportError> {
        get_index(&mut &payload[..])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::StatusCode;
    use crate::test::dmd_project;

    #[test]
    fn sequence_request_round_trip() {
        let project = dmd_project(2, Ticks::from_ms(1.0));
        let sequence = project.sequence(SequenceId(1)).unwrap().clone();
        let request = Request::LoadSequence(sequence);
        let decoded = Request::decode(request.opcode(), &request.encode()).unwrap();
        match decoded {
            Request::LoadSequence(sequence) => {
                assert_eq!(sequence.frames().count(), 2);
                assert_eq!(sequence.device_type(), DeviceType::Dmd4500);
            }
            other => panic!("decoded as {:?}", other),
        }
    }

    #[test]
    fn device_errors_come_back() {
        let busy = Error::DeviceBusy {
            component: 2,
            state: RunState::Running,
        };
        let payload = encode_error(&busy);
        assert!(matches!(
            Reply::decode(Opcode::StartSequence, &payload),
            Err(Error::DeviceBusy {
                component: 2,
                state: RunState::Running
            })
        ));

        let missing = Error::NotFound(NotFound::Sequence(SequenceId(9)));
        assert!(matches!(
            Reply::decode(Opcode::StartSequence, &encode_error(&missing)),
            Err(Error::NotFound(NotFound::Sequence(SequenceId(9))))
        ));

        let invalid = Error::InvalidProject(ProjectError::NoComponents);
        assert!(matches!(
            Reply::decode(Opcode::LoadCommit, &encode_error(&invalid)),
            Err(Error::InvalidProject(ProjectError::Rejected(_)))
        ));
    }

    #[test]
    fn status_message() {
        let message = StatusMessage {
            component: 1,
            sequence_number: 41,
            event: DeviceEvent::Sequence(SequenceStatusValues {
                code: StatusCode::Underrun,
                position: FramePosition {
                    sequence: SequenceId(3),
                    item: 7,
                    frame: 0,
                },
                frame_count: 70,
                timestamp: Ticks(123_456),
            }),
        };
        assert_eq!(StatusMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn acquired_image_into_arena() {
        let arena = ImageArena::new(2);
        let pixels: Vec<u8> = (0..32).collect();
        let image = Image::from_row_major_8bit(ImageId(5), 8, 4, &pixels, DeviceType::Cmv4000Mono)
            .unwrap();
        let acquired = AcquiredImage {
            component: 2,
            capture_number: 9,
            position: FramePosition::default(),
            timestamp: Ticks(10),
            image,
        };
        let payload = acquired.encode();
        assert_eq!(AcquiredImage::peek_component(&payload).unwrap(), 2);
        let decoded = AcquiredImage::decode(&payload, Some(&arena)).unwrap();
        assert!(matches!(decoded.image.pixel_buffer(), PixelBuffer::Pooled(_)));
        assert_eq!(decoded.image.pixels(), &pixels[..]);
        assert_eq!(decoded.capture_number, 9);
        assert_eq!(arena.allocations(), 1);
    }
}
