// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::arena::ImageArena;
use crate::device::{DeviceType, FramePosition, RunState};
use crate::error::{Error, TransportError};
use crate::project::{Component, Image, ImageId};
use crate::timing::Ticks;
use crate::transport::{ConnectionSettings, Transport};
use crate::wire::{
    encode_error, AcquiredImage, DeviceEvent, Opcode, Reply, Request, RetrieveFrom,
    StatusMessage, PROTOCOL_VERSION,
};

/// A device that answers requests the simplest way that keeps a driver happy.
///
/// Starting and stopping report the usual run-state transitions on the status stream before the
/// response goes back, like a real controller.
pub(crate) struct MockTransport {
    components: Vec<Component>,
    version: u16,
    requests: Mutex<Vec<Request>>,
    failures: Mutex<HashMap<Opcode, Vec<u8>>>,
    timeouts: Mutex<HashMap<Opcode, u32>>,
    states: Mutex<Vec<RunState>>,
    status: Mutex<HashMap<usize, Sender<StatusMessage>>>,
    sequence_numbers: Mutex<HashMap<usize, u32>>,
    images: Mutex<HashMap<usize, (Sender<AcquiredImage>, Arc<ImageArena>)>>,
    stored: Mutex<HashMap<ImageId, AcquiredImage>>,
    serial: AtomicU64,
    stopped: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new(components: Vec<Component>) -> Self {
        let states = vec![RunState::Stopped; components.len()];
        Self {
            components,
            version: PROTOCOL_VERSION,
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(HashMap::new()),
            states: Mutex::new(states),
            status: Mutex::new(HashMap::new()),
            sequence_numbers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            stored: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Claim to speak a different protocol version.
    pub(crate) fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Every request received so far, decoded.
    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Answer the next `opcode` request with `err` instead.
    pub(crate) fn fail_next(&self, opcode: Opcode, err: &Error) {
        self.failures.lock().insert(opcode, encode_error(err));
    }

    /// Leave the next `times` `opcode` requests unanswered, as if their responses were lost.
    pub(crate) fn time_out_next(&self, opcode: Opcode, times: u32) {
        self.timeouts.lock().insert(opcode, times);
    }

    /// How many `opcode` requests have arrived.
    pub(crate) fn request_count(&self, opcode: Opcode) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.opcode() == opcode)
            .count()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn next_sequence_number(&self, component: usize) -> u32 {
        let mut numbers = self.sequence_numbers.lock();
        let number = numbers.entry(component).or_insert(0);
        let current = *number;
        *number = number.wrapping_add(1);
        current
    }

    /// Send a status message with the next sequence number.
    pub(crate) fn send_status(&self, component: usize, event: DeviceEvent) {
        let message = StatusMessage {
            component,
            sequence_number: self.next_sequence_number(component),
            event,
        };
        if let Some(sender) = self.status.lock().get(&component) {
            let _ = sender.send(message);
        }
    }

    /// Use up a sequence number without sending anything, as if a message was lost.
    pub(crate) fn skip_status(&self, component: usize) {
        self.next_sequence_number(component);
    }

    fn capture(component: usize, capture_number: u64) -> AcquiredImage {
        let pixels = vec![capture_number as u8; 16];
        let image = Image::from_row_major_8bit(ImageId::NONE, 4, 4, &pixels, DeviceType::Cmv4000Mono)
            .expect("pixel count matches");
        AcquiredImage {
            component,
            capture_number,
            position: FramePosition::default(),
            timestamp: Ticks(capture_number),
            image,
        }
    }

    /// Keep a small capture from camera `component` for retrieval at `id`, and say so.
    pub(crate) fn store_capture(&self, component: usize, id: ImageId, capture_number: u64) {
        self.stored
            .lock()
            .insert(id, Self::capture(component, capture_number));
        self.send_status(component, DeviceEvent::ImageStored { capture_number });
    }

    /// Send a small capture from camera `component`.
    pub(crate) fn send_image(&self, component: usize, capture_number: u64) {
        let acquired = Self::capture(component, capture_number);
        if let Some((sender, arena)) = self.images.lock().get(&component) {
            let decoded =
                AcquiredImage::decode(&acquired.encode(), Some(arena)).expect("just encoded");
            let _ = sender.send(decoded);
        }
    }

    fn set_state(&self, component: usize, state: RunState) {
        self.states.lock()[component] = state;
        self.send_status(component, DeviceEvent::RunState(state));
    }

    fn reply(&self, request: &Request) -> Reply {
        match *request {
            Request::Hello { .. } => Reply::Hello {
                version: self.version,
            },
            Request::EnumerateComponents => Reply::Components(self.components.clone()),
            Request::LoadCommit => {
                self.send_status(0, DeviceEvent::LoadComplete);
                Reply::LoadCommitted { images_to_load: 3 }
            }
            Request::StartSequence { component, .. } => {
                self.set_state(component, RunState::Starting);
                self.set_state(component, RunState::Running);
                Reply::Done
            }
            Request::StopSequence { component } => {
                let state = self.states.lock()[component];
                if state != RunState::Stopped {
                    self.set_state(component, RunState::Stopping);
                    self.set_state(component, RunState::Stopped);
                }
                Reply::Done
            }
            Request::AddStreamingItem { .. } => Reply::StreamingItemAdded {
                serial: self.serial.fetch_add(1, Ordering::AcqRel),
            },
            Request::RetrieveImage(RetrieveFrom::Image(id)) => {
                Reply::Retrieved(self.stored.lock().get(&id).cloned())
            }
            Request::RetrieveImage(_) => Reply::Retrieved(None),
            _ => Reply::Done,
        }
    }
}

impl Transport for MockTransport {
    fn start(&self, _settings: &ConnectionSettings) -> Result<(), TransportError> {
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    fn request(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.is_stopped() {
            return Err(TransportError::Closed);
        }
        let request = Request::decode(opcode, payload)?;
        self.requests.lock().push(request.clone());
        if let Some(remaining) = self.timeouts.lock().get_mut(&opcode).filter(|left| **left > 0) {
            *remaining -= 1;
            return Err(TransportError::ResponseTimeout(opcode));
        }
        if let Some(failure) = self.failures.lock().remove(&opcode) {
            return Ok(failure);
        }
        Ok(self.reply(&request).encode())
    }

    fn subscribe_status(&self, component: usize) -> Receiver<StatusMessage> {
        let (sender, receiver) = channel::unbounded();
        self.status.lock().insert(component, sender);
        receiver
    }

    fn subscribe_images(
        &self,
        component: usize,
        arena: Arc<ImageArena>,
    ) -> Receiver<AcquiredImage> {
        let (sender, receiver) = channel::unbounded();
        self.images.lock().insert(component, (sender, arena));
        receiver
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.status.lock().clear();
        self.images.lock().clear();
    }
}
