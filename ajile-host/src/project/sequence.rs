// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::fmt;
use std::collections::BTreeMap;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use paste::paste;
use serde::{Deserialize, Serialize};

use super::image::{Image, ImageId};
use super::trigger::{FrameTriggerSetting, TriggerAction};
use crate::device::{DeviceType, RunState};
use crate::timing::Ticks;

/// Identifies a sequence within a project.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(pub u16);

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a sequence's images come from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SequenceKind {
    /// Images are loaded with the project and stay on the device.
    Preload = 0,
    /// Images arrive with each sequence item while the sequence runs.
    Stream = 1,
}

/// Per-frame settings passed through to the imaging hardware.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u16)]
pub enum ImagingParameter {
    /// Camera rows skipped between each row read out.
    SubsampleNumRows = 1,
    /// Camera exposure in ticks, when shorter than the frame time.
    Exposure = 2,
    LedCurrentRed = 3,
    LedCurrentGreen = 4,
    LedCurrentBlue = 5,
    /// Bitmask of the LEDs lit during a DMD frame: red is bit 0, green bit 1, blue bit 2.
    LedEnable = 6,
}

/// Generates a getter and setter pair for a frame's imaging parameter.
macro_rules! imaging_parameter {
    { $field:ident, $key:ident, $doc:literal } => {
    paste! {
        #[doc = $doc]
        pub fn $field(&self) -> Option<u32> {
            self.imaging_parameters.get(&ImagingParameter::$key).copied()
        }

        #[doc = $doc]
        pub fn [< set_ $field >](&mut self, value: u32) {
            self.imaging_parameters.insert(ImagingParameter::$key, value);
        }
    }};
}

/// One display or exposure.
#[derive(Clone, Debug)]
pub struct Frame {
    sequence_id: SequenceId,
    image_id: ImageId,
    frame_time: Ticks,
    roi_first_row: u32,
    roi_rows: Option<u32>,
    roi_first_column: u32,
    roi_columns: Option<u32>,
    control_inputs: Vec<FrameTriggerSetting>,
    streaming_image: Option<Image>,
    imaging_parameters: BTreeMap<ImagingParameter, u32>,
}

impl Frame {
    /// A frame showing (or capturing into) a preloaded image.
    pub fn new(sequence_id: SequenceId, image_id: ImageId, frame_time: Ticks) -> Self {
        Self {
            sequence_id,
            image_id,
            frame_time,
            roi_first_row: 0,
            roi_rows: None,
            roi_first_column: 0,
            roi_columns: None,
            control_inputs: Vec::new(),
            streaming_image: None,
            imaging_parameters: BTreeMap::new(),
        }
    }

    /// A frame carrying its own image, for streaming sequences.
    pub fn streaming(sequence_id: SequenceId, image: Image, frame_time: Ticks) -> Self {
        Self {
            streaming_image: Some(image),
            ..Self::new(sequence_id, ImageId::NONE, frame_time)
        }
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn set_sequence_id(&mut self, sequence_id: SequenceId) {
        self.sequence_id = sequence_id;
    }

    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    pub fn set_image_id(&mut self, image_id: ImageId) {
        self.image_id = image_id;
    }

    pub fn frame_time(&self) -> Ticks {
        self.frame_time
    }

    pub fn set_frame_time(&mut self, frame_time: Ticks) {
        self.frame_time = frame_time;
    }

    pub fn set_frame_time_ms(&mut self, milliseconds: f64) {
        self.frame_time = Ticks::from_ms(milliseconds);
    }

    pub fn roi_first_row(&self) -> u32 {
        self.roi_first_row
    }

    /// Rows read out, `None` meaning everything from the first row to the end of the sensor.
    pub fn roi_rows(&self) -> Option<u32> {
        self.roi_rows
    }

    pub fn set_roi_first_row(&mut self, row: u32) {
        self.roi_first_row = row;
    }

    pub fn set_roi_rows(&mut self, rows: u32) {
        self.roi_rows = Some(rows);
    }

    pub fn roi_first_column(&self) -> u32 {
        self.roi_first_column
    }

    pub fn roi_columns(&self) -> Option<u32> {
        self.roi_columns
    }

    pub fn set_roi_first_column(&mut self, column: u32) {
        self.roi_first_column = column;
    }

    pub fn set_roi_columns(&mut self, columns: u32) {
        self.roi_columns = Some(columns);
    }

    /// Set the ROI rows, builder style.
    pub fn with_roi(mut self, first_row: u32, rows: u32) -> Self {
        self.roi_first_row = first_row;
        self.roi_rows = Some(rows);
        self
    }

    /// The ROI height on a sensor with `sensor_rows` rows.
    pub fn roi_rows_on(&self, sensor_rows: u32) -> u32 {
        self.roi_rows
            .unwrap_or_else(|| sensor_rows.saturating_sub(self.roi_first_row))
    }

    /// Rows a camera actually reads out once subsampling is applied.
    ///
    /// A row-skip at least as large as the ROI disables subsampling.
    pub fn captured_rows(&self, sensor_rows: u32) -> u32 {
        let rows = self.roi_rows_on(sensor_rows);
        match self.subsample_row_skip() {
            Some(skip) if skip > 0 && skip < rows => rows / (skip + 1),
            _ => rows,
        }
    }

    /// Choose whether this frame waits for `setting.action`. Replaces any earlier setting for the
    /// same action.
    pub fn add_control_input_setting(&mut self, setting: FrameTriggerSetting) {
        self.control_inputs.retain(|s| s.action != setting.action);
        self.control_inputs.push(setting);
    }

    pub fn control_input_settings(&self) -> &[FrameTriggerSetting] {
        &self.control_inputs
    }

    /// The explicit setting for `action`, if there is one.
    pub fn control_input(&self, action: TriggerAction) -> Option<bool> {
        self.control_inputs
            .iter()
            .find(|s| s.action == action)
            .map(|s| s.enabled)
    }

    pub fn streaming_image(&self) -> Option<&Image> {
        self.streaming_image.as_ref()
    }

    pub fn set_streaming_image(&mut self, image: Image) {
        self.streaming_image = Some(image);
    }

    pub fn add_imaging_parameter(&mut self, key: ImagingParameter, value: u32) {
        self.imaging_parameters.insert(key, value);
    }

    pub fn imaging_parameters(&self) -> impl Iterator<Item = (ImagingParameter, u32)> + '_ {
        self.imaging_parameters.iter().map(|(k, v)| (*k, *v))
    }

    imaging_parameter! {
        subsample_row_skip,
        SubsampleNumRows,
        "Camera rows skipped between every row read out."
    }

    imaging_parameter! {
        exposure,
        Exposure,
        "Camera exposure override, in ticks."
    }

    imaging_parameter! {
        led_current_red,
        LedCurrentRed,
        "Red LED current override."
    }

    imaging_parameter! {
        led_current_green,
        LedCurrentGreen,
        "Green LED current override."
    }

    imaging_parameter! {
        led_current_blue,
        LedCurrentBlue,
        "Blue LED current override."
    }

    imaging_parameter! {
        led_enable,
        LedEnable,
        "LEDs lit for this frame, red in bit 0, green in bit 1, blue in bit 2."
    }
}

/// An ordered list of frames, repeated as a unit.
#[derive(Clone, Debug)]
pub struct SequenceItem {
    sequence_id: SequenceId,
    repeat_count: u32,
    repeat_time: Option<Ticks>,
    frames: Vec<Frame>,
}

impl SequenceItem {
    /// `repeat_count` of 0 repeats forever.
    pub fn new(sequence_id: SequenceId, repeat_count: u32) -> Self {
        Self {
            sequence_id,
            repeat_count,
            repeat_time: None,
            frames: Vec::new(),
        }
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn is_infinite(&self) -> bool {
        self.repeat_count == 0
    }

    /// How long one pass through the item takes, if longer than its frames.
    pub fn repeat_time(&self) -> Option<Ticks> {
        self.repeat_time
    }

    pub fn set_repeat_time(&mut self, repeat_time: Ticks) {
        self.repeat_time = Some(repeat_time);
    }

    pub fn set_repeat_time_ms(&mut self, milliseconds: f64) {
        self.repeat_time = Some(Ticks::from_ms(milliseconds));
    }

    pub fn add_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The sum of the frame times.
    pub fn frame_time_total(&self) -> Ticks {
        self.frames.iter().map(Frame::frame_time).sum()
    }
}

/// A named, repeatable list of sequence items bound to one kind of device.
#[derive(Clone, Debug)]
pub struct Sequence {
    id: SequenceId,
    name: String,
    device_type: DeviceType,
    kind: SequenceKind,
    repeat_count: u32,
    items: Vec<SequenceItem>,
    initial_state: RunState,
}

impl Sequence {
    /// `repeat_count` of 0 repeats forever.
    pub fn new(
        id: SequenceId,
        name: &str,
        device_type: DeviceType,
        kind: SequenceKind,
        repeat_count: u32,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            device_type,
            kind,
            repeat_count,
            items: Vec::new(),
            initial_state: RunState::Stopped,
        }
    }

    /// Set the state a streaming sequence starts in. [`RunState::Paused`] holds a started sequence
    /// until its first item arrives.
    pub fn with_initial_state(mut self, state: RunState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn initial_state(&self) -> RunState {
        self.initial_state
    }

    pub fn items(&self) -> &[SequenceItem] {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut Vec<SequenceItem> {
        &mut self.items
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.items.iter().flat_map(|item| item.frames.iter())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subsampled_rows() {
        let mut frame = Frame::new(SequenceId(1), ImageId(1), Ticks::from_ms(10.0)).with_roi(0, 100);
        assert_eq!(frame.captured_rows(2048), 100);
        frame.set_subsample_row_skip(1);
        assert_eq!(frame.captured_rows(2048), 50);
        frame.set_subsample_row_skip(3);
        assert_eq!(frame.captured_rows(2048), 25);
        // Skipping the whole ROI turns subsampling off.
        frame.set_subsample_row_skip(100);
        assert_eq!(frame.captured_rows(2048), 100);
    }

    #[test]
    fn roi_defaults_to_rest_of_sensor() {
        let mut frame = Frame::new(SequenceId(1), ImageId(1), Ticks::from_ms(1.0));
        frame.set_roi_first_row(48);
        assert_eq!(frame.roi_rows_on(2048), 2000);
    }

    #[test]
    fn control_inputs_replace() {
        let mut frame = Frame::new(SequenceId(1), ImageId(1), Ticks::from_ms(1.0));
        assert_eq!(frame.control_input(TriggerAction::StartFrame), None);
        frame.add_control_input_setting(FrameTriggerSetting::new(TriggerAction::StartFrame, true));
        frame.add_control_input_setting(FrameTriggerSetting::new(TriggerAction::StartFrame, false));
        assert_eq!(frame.control_input_settings().len(), 1);
        assert_eq!(frame.control_input(TriggerAction::StartFrame), Some(false));
    }

    #[test]
    fn item_totals() {
        let mut item = SequenceItem::new(SequenceId(2), 0);
        assert!(item.is_infinite());
        item.add_frame(Frame::new(SequenceId(2), ImageId(1), Ticks(300)));
        item.add_frame(Frame::new(SequenceId(2), ImageId(2), Ticks(700)));
        assert_eq!(item.frame_time_total(), Ticks(1_000));
    }
}
