// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use crate::device::DeviceType;
use crate::project::{Component, Frame, Image, ImageId, Project, Sequence, SequenceId, SequenceItem, SequenceKind};
use crate::timing::Ticks;

/// A controller with a single DMD 4500.
pub(crate) fn controller_and_dmd() -> Vec<Component> {
    vec![
        Component::for_device(DeviceType::AjileController),
        Component::for_device(DeviceType::Dmd4500),
    ]
}

/// Sequence 1 shows `frames` distinct full-size DMD images (ids `1..=frames`) once each.
pub(crate) fn dmd_project(frames: u16, frame_time: Ticks) -> Project {
    let mut project = Project::new("dmd");
    project.set_components(controller_and_dmd());
    let id = SequenceId(1);
    project.add_sequence(Sequence::new(
        id,
        "dmd",
        DeviceType::Dmd4500,
        SequenceKind::Preload,
        1,
    ));
    project
        .add_sequence_item(SequenceItem::new(id, 1))
        .expect("sequence was just added");
    for image_id in 1..=frames {
        let mut pixels = vec![0u8; 1140 * 912];
        pixels[image_id as usize] = 0xFF;
        project.add_image(
            Image::from_row_major_8bit(ImageId(image_id), 1140, 912, &pixels, DeviceType::Dmd4500)
                .expect("pixel count matches"),
        );
        project
            .add_frame(Frame::new(id, ImageId(image_id), frame_time))
            .expect("item was just added");
    }
    project
}

/// Sequence 1 captures `frames` 10ms frames of `roi_rows` rows from a CMV4000 at index 2.
pub(crate) fn camera_project(frames: u16, roi_rows: u32) -> Project {
    let mut project = Project::new("camera");
    project.set_components(vec![
        Component::for_device(DeviceType::DmdCameraController),
        Component::for_device(DeviceType::Dmd4500),
        Component::for_device(DeviceType::Cmv4000Mono),
    ]);
    let id = SequenceId(1);
    project.add_sequence(Sequence::new(
        id,
        "camera",
        DeviceType::Cmv4000Mono,
        SequenceKind::Preload,
        1,
    ));
    project
        .add_sequence_item(SequenceItem::new(id, 1))
        .expect("sequence was just added");
    for image_id in 1..=frames {
        let mut image = Image::for_device(ImageId(image_id), DeviceType::Cmv4000Mono);
        image.set_height(roi_rows);
        project.add_image(image);
        project
            .add_frame(Frame::new(id, ImageId(image_id), Ticks::from_ms(10.0)).with_roi(0, roi_rows))
            .expect("item was just added");
    }
    project
}
