// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The in-memory description of everything a device is asked to do.
//!
//! A [`Project`] owns its components, images, sequences (which own their items, which own their
//! frames) and trigger rules. Frames refer to images by [`ImageId`] only, never by reference, so
//! the whole tree can be cloned, sent to another thread, or serialized without fuss.
mod bitplane;
mod component;
mod image;
mod sequence;
mod trigger;
mod validate;

use std::collections::BTreeMap;

pub use component::{Component, ExternalTriggerSetting, TriggerEdge, TriggerSettings, MAX_TRIGGER_PINS};
pub use image::{Image, ImageId, PixelBuffer};
pub use sequence::{Frame, ImagingParameter, Sequence, SequenceId, SequenceItem, SequenceKind};
pub use trigger::{
    FrameTriggerSetting, TriggerAction, TriggerDestination, TriggerEvent, TriggerRule,
    TriggerSource, MAX_RULE_SOURCES,
};

use crate::device::DeviceType;
use crate::error::{Error, NotFound, ProjectError, Result};

#[derive(Clone, Debug, Default)]
pub struct Project {
    name: String,
    components: Vec<Component>,
    images: BTreeMap<ImageId, Image>,
    sequences: BTreeMap<SequenceId, Sequence>,
    trigger_rules: Vec<TriggerRule>,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, index: usize) -> Option<&Component> {
        self.components.get(index)
    }

    /// Append a component, returning its index.
    pub fn add_component(&mut self, component: Component) -> usize {
        self.components.push(component);
        self.components.len() - 1
    }

    /// Replace the component at `index`.
    pub fn set_component(&mut self, index: usize, component: Component) -> Result<()> {
        let slot = self
            .components
            .get_mut(index)
            .ok_or(NotFound::Component(index))?;
        *slot = component;
        Ok(())
    }

    /// Replace every component, usually with the ones a connected device reported.
    pub fn set_components(&mut self, components: Vec<Component>) {
        self.components = components;
    }

    /// Set the external trigger settings of one component.
    pub fn set_trigger_settings(
        &mut self,
        index: usize,
        inputs: &[ExternalTriggerSetting],
        outputs: &[ExternalTriggerSetting],
    ) -> Result<()> {
        self.components
            .get_mut(index)
            .ok_or(NotFound::Component(index))?
            .set_trigger_settings(inputs, outputs)
    }

    /// The index of the first component of `device_type`.
    pub fn component_index_with_device_type(&self, device_type: DeviceType) -> Option<usize> {
        self.components
            .iter()
            .position(|c| c.device_type() == device_type)
    }

    /// The index of the first controller component.
    pub fn controller_index(&self) -> Option<usize> {
        self.components
            .iter()
            .position(|c| c.device_type().is_controller())
    }

    /// Add an image, returning the image it replaced if the id was already taken.
    pub fn add_image(&mut self, image: Image) -> Option<Image> {
        self.images.insert(image.id(), image)
    }

    pub fn image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(&id)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> + '_ {
        self.images.values()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Add a sequence, returning the sequence it replaced if the id was already taken.
    pub fn add_sequence(&mut self, sequence: Sequence) -> Option<Sequence> {
        self.sequences.insert(sequence.id(), sequence)
    }

    pub fn sequence(&self, id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(&id)
    }

    pub fn sequences(&self) -> impl Iterator<Item = &Sequence> + '_ {
        self.sequences.values()
    }

    /// Append an item to the sequence it names.
    pub fn add_sequence_item(&mut self, item: SequenceItem) -> Result<()> {
        let id = item.sequence_id();
        self.sequences
            .get_mut(&id)
            .ok_or(NotFound::Sequence(id))?
            .items_mut()
            .push(item);
        Ok(())
    }

    /// Append a frame to the last item of the sequence it names.
    pub fn add_frame(&mut self, frame: Frame) -> Result<()> {
        let id = frame.sequence_id();
        self.sequences
            .get_mut(&id)
            .ok_or(NotFound::Sequence(id))?
            .items_mut()
            .last_mut()
            .ok_or(NotFound::SequenceItem(id))?
            .add_frame(frame);
        Ok(())
    }

    pub fn add_trigger_rule(&mut self, rule: TriggerRule) {
        self.trigger_rules.push(rule);
    }

    pub fn trigger_rules(&self) -> &[TriggerRule] {
        &self.trigger_rules
    }

    /// The component a sequence runs on: the only one whose type matches the sequence's.
    pub fn bound_component(&self, id: SequenceId) -> Result<usize> {
        let sequence = self.sequence(id).ok_or(NotFound::Sequence(id))?;
        validate::bind(self, sequence).map_err(Error::from)
    }

    /// The component every sequence runs on.
    pub fn bindings(&self) -> Result<BTreeMap<SequenceId, usize>, ProjectError> {
        self.sequences()
            .map(|sequence| Ok((sequence.id(), validate::bind(self, sequence)?)))
            .collect()
    }

    /// Check every invariant a device enforces at load time.
    pub fn validate(&self) -> Result<(), ProjectError> {
        validate::validate(self)
    }

    /// Image memory each component needs for this project's preloaded images.
    pub fn memory_required(&self) -> Vec<u64> {
        validate::memory_required(self)
    }

    /// A deep copy with every pixel buffer privately owned.
    pub fn materialize(&self) -> Project {
        Project {
            images: self
                .images
                .iter()
                .map(|(id, image)| (*id, image.materialize()))
                .collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{camera_project, controller_and_dmd};
    use crate::timing::Ticks;

    #[test]
    fn builder_appends_to_latest() {
        let mut project = Project::new("builder");
        project.set_components(controller_and_dmd());
        let id = SequenceId(1);
        project.add_sequence(Sequence::new(
            id,
            "s",
            DeviceType::Dmd4500,
            SequenceKind::Preload,
            1,
        ));
        assert!(project.add_frame(Frame::new(id, ImageId(1), Ticks::from_ms(1.0))).is_err());
        project.add_sequence_item(SequenceItem::new(id, 1)).unwrap();
        project.add_sequence_item(SequenceItem::new(id, 2)).unwrap();
        project
            .add_frame(Frame::new(id, ImageId(1), Ticks::from_ms(1.0)))
            .unwrap();
        let sequence = project.sequence(id).unwrap();
        assert_eq!(sequence.items()[0].frames().len(), 0);
        assert_eq!(sequence.items()[1].frames().len(), 1);
        assert!(matches!(
            project.add_sequence_item(SequenceItem::new(SequenceId(9), 1)),
            Err(Error::NotFound(NotFound::Sequence(SequenceId(9))))
        ));
    }

    #[test]
    fn component_lookup() {
        let project = camera_project(3, 16);
        assert_eq!(
            project.component_index_with_device_type(DeviceType::Cmv4000Mono),
            Some(2)
        );
        assert_eq!(
            project.component_index_with_device_type(DeviceType::Dmd3000),
            None
        );
        assert_eq!(project.controller_index(), Some(0));
        assert_eq!(project.bound_component(SequenceId(1)).unwrap(), 2);
    }

    #[test]
    fn materialize_keeps_structure() {
        let project = camera_project(3, 16);
        let copy = project.materialize();
        assert_eq!(copy.image_count(), project.image_count());
        assert_eq!(copy.sequences().count(), 1);
        assert!(copy.validate().is_ok());
    }
}
