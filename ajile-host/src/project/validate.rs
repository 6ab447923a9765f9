// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use std::collections::{BTreeSet, HashSet};

use super::{Project, Sequence, SequenceKind, TriggerAction, TriggerEvent};
use crate::error::ProjectError;

/// Find the single component a sequence runs on.
pub(super) fn bind(project: &Project, sequence: &Sequence) -> Result<usize, ProjectError> {
    let mut matches = project
        .components()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.device_type() == sequence.device_type())
        .map(|(index, _)| index);
    match (matches.next(), matches.count()) {
        (Some(index), 0) => Ok(index),
        (first, rest) => Err(ProjectError::UnboundSequence {
            sequence: sequence.id(),
            device_type: sequence.device_type(),
            matches: first.map_or(0, |_| rest + 1),
        }),
    }
}

pub(super) fn validate(project: &Project) -> Result<(), ProjectError> {
    let first = project
        .components()
        .first()
        .ok_or(ProjectError::NoComponents)?;
    if !first.device_type().is_controller() {
        return Err(ProjectError::FirstComponentNotController(
            first.device_type(),
        ));
    }
    for sequence in project.sequences() {
        let component = bind(project, sequence)?;
        check_sequence(project, sequence, component)?;
    }
    let required = memory_required(project);
    for (index, (component, required)) in project.components().iter().zip(required).enumerate() {
        if required > component.image_memory_size() {
            return Err(ProjectError::MemoryBudget {
                component: index,
                required,
                budget: component.image_memory_size(),
            });
        }
    }
    check_trigger_rules(project)
}

fn check_sequence(
    project: &Project,
    sequence: &Sequence,
    component_index: usize,
) -> Result<(), ProjectError> {
    let id = sequence.id();
    let component = &project.components()[component_index];
    let minimum = sequence.device_type().min_frame_time();
    if sequence.kind() == SequenceKind::Preload && sequence.items().is_empty() {
        return Err(ProjectError::EmptySequence(id));
    }
    for item in sequence.items() {
        if item.frames().is_empty() {
            return Err(ProjectError::EmptySequenceItem(id));
        }
        if let Some(repeat_time) = item.repeat_time() {
            let frames = item.frame_time_total();
            if repeat_time < frames {
                return Err(ProjectError::RepeatTimeTooShort {
                    sequence: id,
                    repeat_time,
                    frames,
                });
            }
        }
        for frame in item.frames() {
            if frame.frame_time() < minimum {
                return Err(ProjectError::FrameTimeTooShort {
                    sequence: id,
                    frame_time: frame.frame_time(),
                    minimum,
                });
            }
            if let Some(geometry) = component.geometry() {
                let rows = frame.roi_rows_on(geometry.rows);
                // Saturates so a first row near the top of the range is still rejected.
                let end = frame.roi_first_row().saturating_add(rows);
                if rows == 0 || end > geometry.rows {
                    return Err(ProjectError::RoiOutOfBounds {
                        sequence: id,
                        first: frame.roi_first_row(),
                        end,
                        rows: geometry.rows,
                    });
                }
            }
            match sequence.kind() {
                SequenceKind::Preload => {
                    if frame.streaming_image().is_some() {
                        return Err(ProjectError::StreamImageInPreload(id));
                    }
                    let image = project
                        .image(frame.image_id())
                        .filter(|_| !frame.image_id().is_none())
                        .ok_or(ProjectError::MissingImage(id, frame.image_id()))?;
                    if let Some(image_type) = image.device_type() {
                        if image_type != sequence.device_type() {
                            return Err(ProjectError::IncompatibleImage {
                                sequence: id,
                                image: image.id(),
                                image_type,
                                target: sequence.device_type(),
                            });
                        }
                    }
                }
                SequenceKind::Stream => {
                    if !frame.image_id().is_none() {
                        return Err(ProjectError::PreloadedImageInStream(id));
                    }
                    if frame.streaming_image().is_none() {
                        return Err(ProjectError::MissingStreamImage(id));
                    }
                }
            }
        }
    }
    Ok(())
}

fn check_trigger_rules(project: &Project) -> Result<(), ProjectError> {
    let components = project.components();
    let pins = |component: usize| -> Result<u8, ProjectError> {
        components
            .get(component)
            .map(|c| c.device_type().trigger_pins())
            .ok_or(ProjectError::UnknownComponent(component))
    };
    let mut destinations = HashSet::new();
    for rule in project.trigger_rules() {
        if rule.sources().is_empty() {
            return Err(ProjectError::EmptyTriggerRule);
        }
        for source in rule.sources() {
            let available = pins(source.component)?;
            if let TriggerEvent::ExtTriggerInput(pin) = source.event {
                if pin == 0 || pin > available {
                    return Err(ProjectError::UnknownTriggerPin {
                        component: source.component,
                        pin,
                    });
                }
            }
        }
        let destination = rule.destination();
        let available = pins(destination.component)?;
        if let TriggerAction::ExtTriggerOutput(pin) = destination.action {
            if pin == 0 || pin > available {
                return Err(ProjectError::UnknownTriggerPin {
                    component: destination.component,
                    pin,
                });
            }
        }
        if !destinations.insert(destination) {
            return Err(ProjectError::DuplicateDestination {
                component: destination.component,
                action: destination.action,
            });
        }
    }
    Ok(())
}

/// Bytes of preloaded images each component holds. Every image is counted once per component
/// no matter how many frames show it.
pub(super) fn memory_required(project: &Project) -> Vec<u64> {
    let mut per_component: Vec<BTreeSet<_>> = vec![BTreeSet::new(); project.components().len()];
    for sequence in project
        .sequences()
        .filter(|s| s.kind() == SequenceKind::Preload)
    {
        if let Ok(component) = bind(project, sequence) {
            per_component[component].extend(sequence.frames().map(|f| f.image_id()));
        }
    }
    per_component
        .iter()
        .map(|ids| {
            ids.iter()
                .filter_map(|id| project.image(*id))
                .map(|image| image.byte_size())
                .sum()
        })
        .collect()
}
