// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use arrayvec::ArrayVec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::device::{DeviceType, Geometry, CONTROLLER_TRIGGER_PINS};
use crate::error::{Error, Result};
use crate::timing::Ticks;

/// The most trigger pins any component has in one direction.
pub const MAX_TRIGGER_PINS: usize = CONTROLLER_TRIGGER_PINS as usize;

/// Which transitions of an external trigger line count as a trigger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TriggerEdge {
    Rising = 0,
    Falling = 1,
    Both = 2,
}

impl TriggerEdge {
    /// Whether a transition to `level` is an edge of this kind.
    pub fn matches(self, level: bool) -> bool {
        match self {
            TriggerEdge::Rising => level,
            TriggerEdge::Falling => !level,
            TriggerEdge::Both => true,
        }
    }
}

/// Settings for one external trigger pin.
///
/// For inputs the hold time is the shortest gap between two accepted edges. For outputs it is
/// how long each pulse is held.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExternalTriggerSetting {
    pub edge: TriggerEdge,
    pub hold_time: Ticks,
}

impl ExternalTriggerSetting {
    pub fn new(edge: TriggerEdge, hold_time: Ticks) -> Self {
        Self { edge, hold_time }
    }
}

impl Default for ExternalTriggerSetting {
    fn default() -> Self {
        Self {
            edge: TriggerEdge::Rising,
            hold_time: Ticks::from_us(10.0),
        }
    }
}

pub type TriggerSettings = ArrayVec<ExternalTriggerSetting, MAX_TRIGGER_PINS>;

/// One physical device taking part in a project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Component {
    device_type: DeviceType,
    geometry: Option<Geometry>,
    input_triggers: TriggerSettings,
    output_triggers: TriggerSettings,
    image_memory: u64,
}

impl Component {
    /// Create a component with the defaults for `device_type`.
    pub fn for_device(device_type: DeviceType) -> Self {
        let pins = device_type.trigger_pins() as usize;
        let defaults: TriggerSettings = (0..pins)
            .map(|_| ExternalTriggerSetting::default())
            .collect();
        Self {
            device_type,
            geometry: device_type.geometry(),
            input_triggers: defaults.clone(),
            output_triggers: defaults,
            image_memory: device_type.default_image_memory(),
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Sensor or mirror rows, 0 for components without an imager.
    pub fn rows(&self) -> u32 {
        self.geometry.map_or(0, |g| g.rows)
    }

    pub fn columns(&self) -> u32 {
        self.geometry.map_or(0, |g| g.columns)
    }

    pub fn bit_depth(&self) -> u8 {
        self.geometry.map_or(0, |g| g.bit_depth)
    }

    pub fn image_memory_size(&self) -> u64 {
        self.image_memory
    }

    pub fn set_image_memory_size(&mut self, bytes: u64) {
        self.image_memory = bytes;
    }

    pub fn input_trigger_settings(&self) -> &[ExternalTriggerSetting] {
        &self.input_triggers
    }

    pub fn output_trigger_settings(&self) -> &[ExternalTriggerSetting] {
        &self.output_triggers
    }

    /// The setting for 1-based input pin `pin`.
    pub fn input_trigger(&self, pin: u8) -> Option<&ExternalTriggerSetting> {
        pin.checked_sub(1)
            .and_then(|index| self.input_triggers.get(index as usize))
    }

    /// The setting for 1-based output pin `pin`.
    pub fn output_trigger(&self, pin: u8) -> Option<&ExternalTriggerSetting> {
        pin.checked_sub(1)
            .and_then(|index| self.output_triggers.get(index as usize))
    }

    /// Replace the trigger settings. Each list has one entry per pin.
    pub fn set_trigger_settings(
        &mut self,
        inputs: &[ExternalTriggerSetting],
        outputs: &[ExternalTriggerSetting],
    ) -> Result<()> {
        let pins = self.device_type.trigger_pins() as usize;
        if inputs.len() > pins || outputs.len() > pins {
            return Err(Error::InvalidArgument(
                "more trigger settings than the component has pins",
            ));
        }
        self.input_triggers = inputs.iter().copied().collect();
        self.output_triggers = outputs.iter().copied().collect();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn controller_has_trigger_pins() {
        let controller = Component::for_device(DeviceType::DmdCameraController);
        assert_eq!(controller.input_trigger_settings().len(), MAX_TRIGGER_PINS);
        assert!(controller.input_trigger(1).is_some());
        assert!(controller.input_trigger(0).is_none());
        assert!(controller.output_trigger(5).is_none());
    }

    #[test]
    fn too_many_settings() {
        let mut dmd = Component::for_device(DeviceType::Dmd4500);
        let settings = [ExternalTriggerSetting::default()];
        assert!(dmd.set_trigger_settings(&settings, &[]).is_err());
        assert_eq!(dmd.rows(), 912);
        assert_eq!(dmd.columns(), 1140);
    }

    #[test]
    fn edges() {
        assert!(TriggerEdge::Rising.matches(true));
        assert!(!TriggerEdge::Rising.matches(false));
        assert!(TriggerEdge::Falling.matches(false));
        assert!(TriggerEdge::Both.matches(false));
    }
}
