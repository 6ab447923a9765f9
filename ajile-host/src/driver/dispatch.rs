// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The per-component threads feeding the driver's queues.
use std::sync::Arc;

use crossbeam::channel::Receiver;
use log::{debug, error, trace, warn};

use super::Shared;
use crate::device::StatusCode;
use crate::wire::{AcquiredImage, DeviceEvent, StatusMessage};

/// Drain `component`'s status stream until the connection closes.
pub(super) fn dispatch_status(
    component: usize,
    messages: Receiver<StatusMessage>,
    shared: Arc<Shared>,
) {
    let channels = &shared.channels[component];
    let mut expected: u32 = 0;
    for message in messages.iter() {
        if message.sequence_number != expected {
            error!(
                "Component {} status skipped from {} to {}",
                component, expected, message.sequence_number
            );
            channels.statuses.mark_lost();
        }
        expected = message.sequence_number.wrapping_add(1);
        match message.event {
            DeviceEvent::RunState(state) => {
                debug!("Component {} is {:?}", component, state);
                channels.state.set(state);
            }
            DeviceEvent::Sequence(status) => {
                match status.code {
                    StatusCode::Underrun => warn!(
                        "Component {} ran out of streaming items at frame {}",
                        component, status.frame_count
                    ),
                    StatusCode::Backpressure => warn!(
                        "Component {} is holding a capture until the image queue has room",
                        component
                    ),
                    StatusCode::FrameStarted => (),
                }
                channels.statuses.push(status);
            }
            DeviceEvent::LoadComplete => {
                debug!("Project images are committed");
                shared.load.complete();
            }
            DeviceEvent::StreamItemDone { serial } => {
                trace!("Component {} finished streaming item {}", component, serial);
                channels.stream.release();
            }
            DeviceEvent::ImageStored { capture_number } => {
                trace!("Component {} stored capture {}", component, capture_number);
                shared.captures.stored();
            }
        }
    }
    debug!("Status stream for component {} ended", component);
    shared.close();
}

/// Move `component`'s captures into its acquired-image queue until the connection closes.
pub(super) fn dispatch_images(
    component: usize,
    images: Receiver<AcquiredImage>,
    shared: Arc<Shared>,
) {
    let queue = match shared.channels[component].acquired.as_ref() {
        Some(queue) => queue,
        None => return,
    };
    for image in images.iter() {
        trace!(
            "Component {} capture {} arrived",
            component,
            image.capture_number
        );
        queue.push(image);
    }
    debug!("Image stream for component {} ended", component);
    queue.close();
}
