// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Encoding of the project model.
use core::convert::TryFrom;

use super::image::{decode_image, encode_image, ImageHeader};
use crate::device::{DeviceType, FramePosition, RunState, SequenceStatusValues, StatusCode};
use crate::error::TransportError;
use crate::project::{
    Component, ExternalTriggerSetting, Frame, FrameTriggerSetting, Image, ImageId,
    ImagingParameter, PixelBuffer, Sequence, SequenceId, SequenceItem, SequenceKind,
    TriggerAction, TriggerEdge, TriggerEvent, TriggerRule, TriggerSettings,
};
use crate::timing::Ticks;
use crate::util::{Buffer, BufferMut};

type Result<T> = core::result::Result<T, TransportError>;

fn malformed<T>(what: &'static str) -> impl FnOnce(T) -> TransportError {
    move |_| TransportError::Malformed(what)
}

pub(crate) fn get_device_type(buf: &mut &[u8]) -> Result<DeviceType> {
    DeviceType::try_from(buf.get_u16()?).map_err(malformed("unknown device type"))
}

pub(crate) fn get_run_state(buf: &mut &[u8]) -> Result<RunState> {
    RunState::try_from(buf.get_u8()?).map_err(malformed("unknown run state"))
}

pub(crate) fn put_index(out: &mut Vec<u8>, index: usize) {
    out.put_u16(u16::try_from(index).unwrap_or(u16::MAX));
}

pub(crate) fn get_index(buf: &mut &[u8]) -> Result<usize> {
    Ok(buf.get_u16()? as usize)
}

fn put_option_u32(out: &mut Vec<u8>, value: Option<u32>) {
    out.put_bool(value.is_some());
    out.put_u32(value.unwrap_or(0));
}

fn get_option_u32(buf: &mut &[u8]) -> Result<Option<u32>> {
    let present = buf.get_bool()?;
    let value = buf.get_u32()?;
    Ok(present.then(|| value))
}

fn put_trigger_settings(out: &mut Vec<u8>, settings: &[ExternalTriggerSetting]) {
    out.put_u8(settings.len() as u8);
    for setting in settings {
        out.put_u8(setting.edge.into());
        out.put_u64(setting.hold_time.0);
    }
}

fn get_trigger_settings(buf: &mut &[u8]) -> Result<TriggerSettings> {
    let count = buf.get_u8()?;
    let mut settings = TriggerSettings::new();
    for _ in 0..count {
        let edge = TriggerEdge::try_from(buf.get_u8()?).map_err(malformed("unknown edge"))?;
        let hold_time = Ticks(buf.get_u64()?);
        settings
            .try_push(ExternalTriggerSetting::new(edge, hold_time))
            .map_err(malformed("too many trigger pins"))?;
    }
    Ok(settings)
}

pub(crate) fn put_component(out: &mut Vec<u8>, component: &Component) {
    out.put_u16(component.device_type().code());
    out.put_u64(component.image_memory_size());
    put_trigger_settings(out, component.input_trigger_settings());
    put_trigger_settings(out, component.output_trigger_settings());
}

pub(crate) fn get_component(buf: &mut &[u8]) -> Result<Component> {
    let mut component = Component::for_device(get_device_type(buf)?);
    component.set_image_memory_size(buf.get_u64()?);
    let inputs = get_trigger_settings(buf)?;
    let outputs = get_trigger_settings(buf)?;
    component
        .set_trigger_settings(&inputs, &outputs)
        .map_err(malformed("too many trigger pins"))?;
    Ok(component)
}

/// Images are the id, device type (0 for none), whether pixels follow, and the image itself.
pub(crate) fn put_image(out: &mut Vec<u8>, image: &Image) {
    out.put_u16(image.id().0);
    out.put_u16(image.device_type().map_or(0, DeviceType::code));
    out.put_bool(!image.is_empty());
    if image.is_empty() {
        image.header().encode(out);
    } else {
        encode_image(&image.header(), image.pixels(), out);
    }
}

/// Decode an image. `store` decides where the pixels end up.
pub(crate) fn get_image_with<F>(buf: &mut &[u8], store: F) -> Result<Image>
where
    F: FnOnce(&[u8]) -> PixelBuffer,
{
    let id = ImageId(buf.get_u16()?);
    let device_type = match buf.get_u16()? {
        0 => None,
        code => Some(DeviceType::try_from(code).map_err(malformed("unknown device type"))?),
    };
    let (header, pixels) = if buf.get_bool()? {
        let (header, pixels) = decode_image(buf)?;
        (header, store(pixels))
    } else {
        (ImageHeader::decode(buf)?, PixelBuffer::Empty)
    };
    Image::from_parts(id, header, device_type, pixels).map_err(malformed("image size mismatch"))
}

pub(crate) fn get_image(buf: &mut &[u8]) -> Result<Image> {
    get_image_with(buf, |pixels| PixelBuffer::owned(pixels.to_vec()))
}

fn put_frame(out: &mut Vec<u8>, frame: &Frame) {
    out.put_u16(frame.sequence_id().0);
    out.put_u16(frame.image_id().0);
    out.put_u64(frame.frame_time().0);
    out.put_u32(frame.roi_first_row());
    put_option_u32(out, frame.roi_rows());
    out.put_u32(frame.roi_first_column());
    put_option_u32(out, frame.roi_columns());
    let inputs = frame.control_input_settings();
    out.put_u8(inputs.len() as u8);
    for setting in inputs {
        out.put_u8(setting.action.into());
        out.put_bool(setting.enabled);
    }
    let parameters: Vec<_> = frame.imaging_parameters().collect();
    out.put_u8(parameters.len() as u8);
    for (key, value) in parameters {
        out.put_u16(key.into());
        out.put_u32(value);
    }
    out.put_bool(frame.streaming_image().is_some());
    if let Some(image) = frame.streaming_image() {
        put_image(out, image);
    }
}

fn get_frame(buf: &mut &[u8]) -> Result<Frame> {
    let sequence = SequenceId(buf.get_u16()?);
    let image = ImageId(buf.get_u16()?);
    let mut frame = Frame::new(sequence, image, Ticks(buf.get_u64()?));
    frame.set_roi_first_row(buf.get_u32()?);
    if let Some(rows) = get_option_u32(buf)? {
        frame.set_roi_rows(rows);
    }
    frame.set_roi_first_column(buf.get_u32()?);
    if let Some(columns) = get_option_u32(buf)? {
        frame.set_roi_columns(columns);
    }
    for _ in 0..buf.get_u8()? {
        let action =
            TriggerAction::try_from(buf.get_u8()?).map_err(malformed("unknown trigger action"))?;
        frame.add_control_input_setting(FrameTriggerSetting::new(action, buf.get_bool()?));
    }
    for _ in 0..buf.get_u8()? {
        let key = ImagingParameter::try_from(buf.get_u16()?)
            .map_err(malformed("unknown imaging parameter"))?;
        frame.add_imaging_parameter(key, buf.get_u32()?);
    }
    if buf.get_bool()? {
        frame.set_streaming_image(get_image(buf)?);
    }
    Ok(frame)
}

pub(crate) fn put_sequence_item(out: &mut Vec<u8>, item: &SequenceItem) {
    out.put_u16(item.sequence_id().0);
    out.put_u32(item.repeat_count());
    out.put_bool(item.repeat_time().is_some());
    out.put_u64(item.repeat_time().map_or(0, |t| t.0));
    out.put_u32(item.frames().len() as u32);
    for frame in item.frames() {
        put_frame(out, frame);
    }
}

pub(crate) fn get_sequence_item(buf: &mut &[u8]) -> Result<SequenceItem> {
    let mut item = SequenceItem::new(SequenceId(buf.get_u16()?), buf.get_u32()?);
    let has_repeat_time = buf.get_bool()?;
    let repeat_time = Ticks(buf.get_u64()?);
    if has_repeat_time {
        item.set_repeat_time(repeat_time);
    }
    for _ in 0..buf.get_u32()? {
        item.add_frame(get_frame(buf)?);
    }
    Ok(item)
}

pub(crate) fn put_sequence(out: &mut Vec<u8>, sequence: &Sequence) {
    out.put_u16(sequence.id().0);
    out.put_string(sequence.name());
    out.put_u16(sequence.device_type().code());
    out.put_u8(sequence.kind().into());
    out.put_u32(sequence.repeat_count());
    out.put_u8(sequence.initial_state().into());
    out.put_u32(sequence.items().len() as u32);
    for item in sequence.items() {
        put_sequence_item(out, item);
    }
}

pub(crate) fn get_sequence(buf: &mut &[u8]) -> Result<Sequence> {
    let id = SequenceId(buf.get_u16()?);
    let name = buf.get_string()?;
    let device_type = get_device_type(buf)?;
    let kind = SequenceKind::try_from(buf.get_u8()?).map_err(malformed("unknown sequence kind"))?;
    let repeat_count = buf.get_u32()?;
    let initial_state = get_run_state(buf)?;
    let mut sequence = Sequence::new(id, &name, device_type, kind, repeat_count)
        .with_initial_state(initial_state);
    for _ in 0..buf.get_u32()? {
        sequence.items_mut().push(get_sequence_item(buf)?);
    }
    Ok(sequence)
}

pub(crate) fn put_trigger_rule(out: &mut Vec<u8>, rule: &TriggerRule) {
    let destination = rule.destination();
    put_index(out, destination.component);
    out.put_u8(destination.action.into());
    out.put_u8(rule.sources().len() as u8);
    for source in rule.sources() {
        put_index(out, source.component);
        out.put_u8(source.event.into());
    }
}

pub(crate) fn get_trigger_rule(buf: &mut &[u8]) -> Result<TriggerRule> {
    let component = get_index(buf)?;
    let action =
        TriggerAction::try_from(buf.get_u8()?).map_err(malformed("unknown trigger action"))?;
    let mut rule = TriggerRule::new(component, action);
    for _ in 0..buf.get_u8()? {
        let component = get_index(buf)?;
        let event =
            TriggerEvent::try_from(buf.get_u8()?).map_err(malformed("unknown trigger event"))?;
        rule.add_source(component, event)
            .map_err(malformed("too many trigger sources"))?;
    }
    Ok(rule)
}

pub(crate) fn put_position(out: &mut Vec<u8>, position: &FramePosition) {
    out.put_u16(position.sequence.0);
    out.put_u32(position.item);
    out.put_u32(position.frame);
}

pub(crate) fn get_position(buf: &mut &[u8]) -> Result<FramePosition> {
    Ok(FramePosition {
        sequence: SequenceId(buf.get_u16()?),
        item: buf.get_u32()?,
        frame: buf.get_u32()?,
    })
}

pub(crate) fn put_status_values(out: &mut Vec<u8>, status: &SequenceStatusValues) {
    out.put_u8(status.code.into());
    put_position(out, &status.position);
    out.put_u64(status.frame_count);
    out.put_u64(status.timestamp.0);
}

pub(crate) fn get_status_values(buf: &mut &[u8]) -> Result<SequenceStatusValues> {
    Ok(SequenceStatusValues {
        code: StatusCode::try_from(buf.get_u8()?).map_err(malformed("unknown status code"))?,
        position: get_position(buf)?,
        frame_count: buf.get_u64()?,
        timestamp: Ticks(buf.get_u64()?),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::camera_project;

    #[test]
    fn sequence_survives_encoding() {
        let mut project = camera_project(2, 16);
        let mut frame = Frame::new(SequenceId(1), ImageId(2), Ticks::from_ms(10.0)).with_roi(0, 16);
        frame.set_subsample_row_skip(1);
        frame.add_control_input_setting(FrameTriggerSetting::new(TriggerAction::StartFrame, false));
        project.add_frame(frame).unwrap();
        let sequence = project.sequence(SequenceId(1)).unwrap();

        let mut out = Vec::new();
        put_sequence(&mut out, sequence);
        let decoded = get_sequence(&mut &out[..]).unwrap();
        assert_eq!(decoded.id(), sequence.id());
        assert_eq!(decoded.items()[0].frames().len(), 3);
        let frame = &decoded.items()[0].frames()[2];
        assert_eq!(frame.roi_rows(), Some(16));
        assert_eq!(frame.subsample_row_skip(), Some(1));
        assert_eq!(frame.control_input(TriggerAction::StartFrame), Some(false));
        assert_eq!(frame.frame_time(), Ticks::from_ms(10.0));
    }

    #[test]
    fn component_keeps_budget_and_triggers() {
        let mut controller = Component::for_device(DeviceType::DmdCameraController);
        controller.set_image_memory_size(1234);
        let falling = ExternalTriggerSetting::new(TriggerEdge::Falling, Ticks(50));
        controller.set_trigger_settings(&[falling], &[]).unwrap();
        let mut out = Vec::new();
        put_component(&mut out, &controller);
        assert_eq!(get_component(&mut &out[..]).unwrap(), controller);
    }

    #[test]
    fn image_descriptor_without_pixels() {
        let image = Image::for_device(ImageId(4), DeviceType::Cmv2000Mono);
        let mut out = Vec::new();
        put_image(&mut out, &image);
        let decoded = get_image(&mut &out[..]).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.header(), image.header());
        assert_eq!(decoded.device_type(), Some(DeviceType::Cmv2000Mono));
    }
}
