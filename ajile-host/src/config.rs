// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Run parameters shared by the example programs.
use log::warn;
use serde::{Deserialize, Serialize};

use crate::device::DeviceType;
use crate::project::{Component, Frame};
use crate::timing::Ticks;

/// Bit depths a camera can capture at.
const CAMERA_BIT_DEPTHS: [u8; 2] = [8, 10];

/// What an example run should do, independent of how the controller is reached.
///
/// Every field has a default, so a JSON document only needs the fields it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParameters {
    /// Frame time in milliseconds. Zero or negative means "whatever the example prefers".
    pub frame_time_ms: f64,

    /// Times to run the sequence. 0 repeats until stopped.
    pub repeat_count: u32,
    pub sequence_id: u16,
    pub bit_depth: u8,
    pub roi_first_row: u32,
    pub roi_num_rows: u32,

    /// Rows skipped between each row read out. 0 reads every row.
    pub subsample_row_skip: u32,

    /// Image memory to give each imaging component, in bytes. `None` keeps the device's.
    pub image_memory_budget: Option<u64>,
}

impl Default for RunParameters {
    fn default() -> Self {
        let rows = DeviceType::Cmv4000Mono
            .geometry()
            .map_or(0, |geometry| geometry.rows);
        Self {
            frame_time_ms: -1.0,
            repeat_count: 0,
            sequence_id: 1,
            bit_depth: 10,
            roi_first_row: 0,
            roi_num_rows: rows,
            subsample_row_skip: 0,
            image_memory_budget: None,
        }
    }
}

/// Camera settings after [`RunParameters::camera_settings`] has made them fit a sensor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CameraSettings {
    pub bit_depth: u8,
    pub roi_first_row: u32,
    pub roi_num_rows: u32,
    pub subsample_row_skip: u32,
}

impl CameraSettings {
    /// Rows in each captured image.
    pub fn captured_rows(&self) -> u32 {
        if self.subsample_row_skip > 0 {
            self.roi_num_rows / (self.subsample_row_skip + 1)
        } else {
            self.roi_num_rows
        }
    }

    /// Apply the ROI and subsampling to a camera frame.
    pub fn apply(&self, frame: &mut Frame) {
        frame.set_roi_first_row(self.roi_first_row);
        frame.set_roi_rows(self.roi_num_rows);
        if self.subsample_row_skip > 0 {
            frame.set_subsample_row_skip(self.subsample_row_skip);
        }
    }
}

impl RunParameters {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The frame time to use, falling back to `default` when none was given.
    pub fn frame_time(&self, default: Ticks) -> Ticks {
        if self.frame_time_ms > 0.0 {
            Ticks::from_ms(self.frame_time_ms)
        } else {
            default
        }
    }

    /// The camera settings corrected to fit a sensor with `sensor_rows` rows.
    pub fn camera_settings(&self, sensor_rows: u32) -> CameraSettings {
        let mut bit_depth = self.bit_depth;
        if !CAMERA_BIT_DEPTHS.contains(&bit_depth) {
            warn!("Bit depth {} is not supported, using 10", bit_depth);
            bit_depth = 10;
        }
        let mut roi_first_row = self.roi_first_row;
        if roi_first_row >= sensor_rows {
            warn!(
                "ROI first row {} is past the last sensor row, starting at 0",
                roi_first_row
            );
            roi_first_row = 0;
        }
        let mut roi_num_rows = self.roi_num_rows;
        if roi_num_rows == 0 || roi_first_row.saturating_add(roi_num_rows) > sensor_rows {
            let fitted = sensor_rows - roi_first_row;
            warn!(
                "{} ROI rows from row {} do not fit the sensor, using {}",
                roi_num_rows, roi_first_row, fitted
            );
            roi_num_rows = fitted;
        }
        let mut subsample_row_skip = self.subsample_row_skip;
        if subsample_row_skip >= roi_num_rows {
            warn!(
                "Skipping {} rows of a {} row ROI leaves nothing, disabling subsampling",
                subsample_row_skip, roi_num_rows
            );
            subsample_row_skip = 0;
        }
        CameraSettings {
            bit_depth,
            roi_first_row,
            roi_num_rows,
            subsample_row_skip,
        }
    }

    /// Give every imaging component the configured image memory, if there is one.
    pub fn apply_memory_budget(&self, components: &mut [Component]) {
        if let Some(budget) = self.image_memory_budget {
            components
                .iter_mut()
                .filter(|component| !component.device_type().is_controller())
                .for_each(|component| component.set_image_memory_size(budget));
        }
    }
}
