// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The host-side driver: a connection to one controller and the operations applications use
//! to load projects and run them.
//!
//! [`HostSystem::connect`] opens the interface, checks the protocol version, learns which
//! components are attached and starts one status thread per component (and one image thread
//! per camera). Those threads keep each component's run-state, status queue and acquired-image
//! queue current, so the blocking calls on [`ControllerDriver`] wait on condition variables
//! instead of polling the device.
mod dispatch;
mod queue;
mod state;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use self::queue::{AcquiredQueue, StatusQueue, StreamGate};
use self::state::StateCell;
use crate::arena::ImageArena;
use crate::device::{RunState, SequenceStatusValues};
use crate::engine::{streaming_capacity, streaming_item_bytes};
use crate::error::{Error, NotFound, ProjectError, Result, TransportError};
use crate::project::{Component, Image, ImageId, Project, SequenceId, SequenceItem};
use crate::timing::WaitTimeout;
use crate::transport::{self, ConnectionSettings, RetryPolicy, Transport};
use crate::wire::{AcquiredImage, Reply, Request, RetrieveFrom, PROTOCOL_VERSION};

/// Tunables for a [`HostSystem`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    /// Status reports kept per component before the oldest is lost.
    pub status_queue_capacity: usize,

    /// Captured images kept per camera. The device is never allowed to send more.
    pub acquired_queue_capacity: usize,

    /// How long to wait for the device to answer a request.
    pub response_timeout: Duration,

    /// How long the driver waits for state changes it causes itself, like the stop before a
    /// start.
    pub state_timeout: Duration,

    /// How often to resend a request that is safe to repeat when the link hiccups.
    pub retry: RetryPolicy,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            status_queue_capacity: 4096,
            acquired_queue_capacity: 16,
            response_timeout: Duration::from_secs(5),
            state_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct ComponentChannels {
    state: StateCell,
    statuses: StatusQueue,
    acquired: Option<AcquiredQueue>,
    stream: StreamGate,
}

#[derive(Debug, Default)]
struct LoadProgress {
    pending: bool,
    images_to_load: u32,
}

/// Tracks the background commit of a project's images.
#[derive(Debug, Default)]
struct LoadTracker {
    progress: Mutex<LoadProgress>,
    done: Condvar,
}

impl LoadTracker {
    fn begin(&self) {
        let mut progress = self.progress.lock();
        progress.pending = true;
        progress.images_to_load = 0;
    }

    fn committed(&self, images_to_load: u32) {
        let mut progress = self.progress.lock();
        // LoadComplete may beat the commit reply here.
        if progress.pending {
            progress.images_to_load = images_to_load;
        }
    }

    fn complete(&self) {
        let mut progress = self.progress.lock();
        progress.pending = false;
        progress.images_to_load = 0;
        self.done.notify_all();
    }

    fn images_to_load(&self) -> u32 {
        self.progress.lock().images_to_load
    }

    fn wait(&self, timeout: WaitTimeout, closed: &AtomicBool) -> Result<()> {
        let deadline = timeout.deadline();
        let mut progress = self.progress.lock();
        while progress.pending {
            if closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed.into());
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut progress, deadline).timed_out() {
                        return if progress.pending {
                            Err(Error::Timeout)
                        } else {
                            Ok(())
                        };
                    }
                }
                None => self.done.wait(&mut progress),
            }
        }
        Ok(())
    }

    fn wake(&self) {
        let _progress = self.progress.lock();
        self.done.notify_all();
    }
}

/// Counts the captures the device has stored, so a retrieval can sleep until the next one.
#[derive(Debug, Default)]
struct StoredCaptures {
    count: Mutex<u64>,
    changed: Condvar,
}

impl StoredCaptures {
    fn count(&self) -> u64 {
        *self.count.lock()
    }

    fn stored(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.changed.notify_all();
    }

    /// Block until more than `seen` captures are stored, the deadline passes or the connection
    /// closes.
    fn wait_past(&self, seen: u64, deadline: Option<Instant>, closed: &AtomicBool) {
        let mut count = self.count.lock();
        while *count == seen && !closed.load(Ordering::Acquire) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut count, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut count),
            }
        }
    }

    fn wake(&self) {
        let _count = self.count.lock();
        self.changed.notify_all();
    }
}

/// State shared between the driver handles and the dispatch threads.
struct Shared {
    transport: Arc<dyn Transport>,
    options: HostOptions,
    components: RwLock<Vec<Component>>,
    channels: Vec<ComponentChannels>,
    load: LoadTracker,
    captures: StoredCaptures,
    project: Mutex<Option<Project>>,
    last_image: Mutex<Option<Image>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail every current and future wait.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for channels in &self.channels {
            channels.stream.close();
            channels.state.wake();
            if let Some(acquired) = channels.acquired.as_ref() {
                acquired.close();
            }
        }
        self.load.wake();
        self.captures.wake();
    }
}

fn unexpected_reply(reply: Reply) -> Error {
    debug!("Unexpected reply {:?}", reply);
    TransportError::Malformed("unexpected reply").into()
}

/// Send `request`, resending it under `retry` if it is safe to repeat.
fn call(transport: &dyn Transport, retry: &RetryPolicy, request: &Request) -> Result<Reply> {
    let opcode = request.opcode();
    debug!("Sending {:?}", opcode);
    let payload = request.encode();
    let response = if opcode.is_idempotent() {
        retry.run(&format!("{:?}", opcode), || transport.request(opcode, &payload))?
    } else {
        transport.request(opcode, &payload)?
    };
    Reply::decode(opcode, &response)
}

/// Check the protocol version and list the device's components.
fn handshake(transport: &dyn Transport, retry: &RetryPolicy) -> Result<Vec<Component>> {
    let hello = Request::Hello {
        version: PROTOCOL_VERSION,
    };
    match call(transport, retry, &hello)? {
        Reply::Hello { version } if version == PROTOCOL_VERSION => (),
        Reply::Hello { version } => {
            return Err(Error::ProtocolMismatch {
                host: PROTOCOL_VERSION,
                device: version,
            })
        }
        reply => return Err(unexpected_reply(reply)),
    }
    match call(transport, retry, &Request::EnumerateComponents)? {
        Reply::Components(components) if components.is_empty() => {
            Err(ProjectError::NoComponents.into())
        }
        Reply::Components(components) => Ok(components),
        reply => Err(unexpected_reply(reply)),
    }
}

/// A connected controller.
///
/// Dropping the host system closes the connection and joins its threads.
pub struct HostSystem {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl HostSystem {
    /// Connect to the controller `settings` describes.
    pub fn connect(settings: &ConnectionSettings, options: HostOptions) -> Result<Self> {
        let transport = transport::open(settings, options.response_timeout);
        Self::with_transport(transport, settings, options)
    }

    /// Connect through an existing transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        settings: &ConnectionSettings,
        options: HostOptions,
    ) -> Result<Self> {
        transport.start(settings)?;
        let components = match handshake(&*transport, &options.retry) {
            Ok(components) => components,
            Err(err) => {
                transport.stop();
                return Err(err);
            }
        };
        info!(
            "Connected to {}",
            components
                .iter()
                .map(|component| format!("{:?}", component.device_type()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let channels = components
            .iter()
            .enumerate()
            .map(|(index, component)| ComponentChannels {
                state: StateCell::new(),
                statuses: StatusQueue::new(index, options.status_queue_capacity),
                acquired: component
                    .device_type()
                    .is_camera()
                    .then(|| AcquiredQueue::new(index, options.acquired_queue_capacity)),
                stream: StreamGate::default(),
            })
            .collect();
        let shared = Arc::new(Shared {
            transport,
            options,
            components: RwLock::new(components),
            channels,
            load: LoadTracker::default(),
            captures: StoredCaptures::default(),
            project: Mutex::new(None),
            last_image: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let mut host = Self {
            shared,
            threads: Vec::new(),
        };
        if let Err(err) = host.spawn_threads() {
            host.shutdown();
            return Err(err);
        }
        Ok(host)
    }

    fn spawn_threads(&mut self) -> Result<()> {
        let shared = &self.shared;
        let cameras: Vec<bool> = shared
            .components
            .read()
            .iter()
            .map(|component| component.device_type().is_camera())
            .collect();
        for (index, is_camera) in cameras.into_iter().enumerate() {
            let statuses = shared.transport.subscribe_status(index);
            let thread_shared = Arc::clone(shared);
            self.threads.push(
                thread::Builder::new()
                    .name(format!("ajile-status-{}", index))
                    .spawn(move || dispatch::dispatch_status(index, statuses, thread_shared))
                    .map_err(TransportError::from)?,
            );
            if is_camera {
                let arena = ImageArena::new(shared.options.acquired_queue_capacity + 2);
                let images = shared.transport.subscribe_images(index, arena);
                let thread_shared = Arc::clone(shared);
                self.threads.push(
                    thread::Builder::new()
                        .name(format!("ajile-images-{}", index))
                        .spawn(move || dispatch::dispatch_images(index, images, thread_shared))
                        .map_err(TransportError::from)?,
                );
            }
        }
        Ok(())
    }

    /// A handle for driving the controller. Handles are cheap and can be used from any thread.
    pub fn driver(&self) -> ControllerDriver {
        ControllerDriver {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The components the device reported, updated by every load.
    pub fn components(&self) -> Vec<Component> {
        self.shared.components.read().clone()
    }

    /// The last run-state `component` reported.
    pub fn device_state(&self, component: usize) -> Result<RunState> {
        self.driver().device_state(component)
    }

    /// Close the connection and wait for every thread to finish.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() && self.shared.is_closed() {
            return;
        }
        self.shared.close();
        self.shared.transport.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("A dispatch thread panicked");
            }
        }
        info!("Host system shut down");
    }
}

impl Drop for HostSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The operations of a connected controller.
///
/// Every call blocks until the device has answered. Calls are safe from any number of threads;
/// requests are serialized by the transport.
#[derive(Clone)]
pub struct ControllerDriver {
    shared: Arc<Shared>,
}

impl ControllerDriver {
    fn channels(&self, component: usize) -> Result<&ComponentChannels> {
        self.shared
            .channels
            .get(component)
            .ok_or_else(|| NotFound::Component(component).into())
    }

    fn acquired(&self, component: usize) -> Result<&AcquiredQueue> {
        self.channels(component)?
            .acquired
            .as_ref()
            .ok_or(Error::InvalidArgument("only cameras acquire images"))
    }

    fn call(&self, request: Request) -> Result<Reply> {
        call(&*self.shared.transport, &self.shared.options.retry, &request)
    }

    fn call_done(&self, request: Request) -> Result<()> {
        match self.call(request)? {
            Reply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }

    fn state_timeout(&self) -> WaitTimeout {
        self.shared.options.state_timeout.into()
    }

    pub fn components(&self) -> Vec<Component> {
        self.shared.components.read().clone()
    }

    /// The project most recently loaded through this connection.
    pub fn project(&self) -> Option<Project> {
        self.shared.project.lock().clone()
    }

    /// Validate `project` and send it to the device.
    ///
    /// Either the whole project is accepted or the device keeps what it had. The call returns
    /// once the device has accepted the project; its images may still be on their way into
    /// device memory (see [`ControllerDriver::wait_for_load_complete`]).
    pub fn load_project(&self, project: &Project) -> Result<()> {
        project.validate()?;
        {
            let device = self.shared.components.read();
            if project.components().len() != device.len() {
                return Err(ProjectError::ComponentCountMismatch {
                    project: project.components().len(),
                    device: device.len(),
                }
                .into());
            }
            for (index, (ours, theirs)) in project.components().iter().zip(device.iter()).enumerate()
            {
                if ours.device_type() != theirs.device_type() {
                    return Err(ProjectError::ComponentTypeMismatch {
                        index,
                        project: ours.device_type(),
                        device: theirs.device_type(),
                    }
                    .into());
                }
            }
        }
        for (component, channels) in self.shared.channels.iter().enumerate() {
            let state = channels.state.state();
            if state != RunState::Stopped {
                return Err(Error::DeviceBusy { component, state });
            }
        }
        info!(
            "Loading project \"{}\" ({} images, {} bytes of image memory)",
            project.name(),
            project.image_count(),
            project.memory_required().iter().sum::<u64>()
        );
        self.shared.load.begin();
        let images_to_load = self
            .call_done(Request::LoadBegin {
                name: project.name().to_string(),
            })
            .and_then(|()| self.send_project(project));
        let images_to_load = match images_to_load {
            Ok(images_to_load) => images_to_load,
            Err(err) => {
                warn!("Loading project \"{}\" failed: {}", project.name(), err);
                if let Err(abort_err) = self.call_done(Request::LoadAbort) {
                    debug!("Aborting the load failed too: {}", abort_err);
                }
                self.shared.load.complete();
                return Err(err);
            }
        };
        *self.shared.components.write() = project.components().to_vec();
        *self.shared.project.lock() = Some(project.clone());
        for channels in &self.shared.channels {
            channels.stream.reset();
        }
        self.shared.load.committed(images_to_load);
        info!("Project \"{}\" loaded", project.name());
        Ok(())
    }

    fn send_project(&self, project: &Project) -> Result<u32> {
        for (index, component) in project.components().iter().enumerate() {
            self.call_done(Request::LoadComponent {
                index,
                component: component.clone(),
            })?;
        }
        for image in project.images() {
            self.call_done(Request::LoadImage(image.clone()))?;
        }
        for sequence in project.sequences() {
            self.call_done(Request::LoadSequence(sequence.clone()))?;
        }
        for rule in project.trigger_rules() {
            self.call_done(Request::LoadTriggerRule(rule.clone()))?;
        }
        match self.call(Request::LoadCommit)? {
            Reply::LoadCommitted { images_to_load } => Ok(images_to_load),
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Block until the last project's images are all in device memory.
    pub fn wait_for_load_complete<T: Into<WaitTimeout>>(&self, timeout: T) -> Result<()> {
        self.shared.load.wait(timeout.into(), &self.shared.closed)
    }

    /// Images of the last project still on their way into device memory.
    pub fn images_to_load(&self) -> u32 {
        self.shared.load.images_to_load()
    }

    /// Replace the settings of one (stopped) component, typically to change its image memory.
    pub fn load_component(&self, component: &Component, index: usize) -> Result<()> {
        let channels = self.channels(index)?;
        let current = self.shared.components.read()[index].device_type();
        if current != component.device_type() {
            return Err(ProjectError::ComponentTypeMismatch {
                index,
                project: component.device_type(),
                device: current,
            }
            .into());
        }
        self.call_done(Request::LoadComponent {
            index,
            component: component.clone(),
        })?;
        self.shared.components.write()[index] = component.clone();
        if let Some(project) = self.shared.project.lock().as_mut() {
            project.set_component(index, component.clone())?;
        }
        channels.stream.reset();
        debug!("Component {} reloaded", index);
        Ok(())
    }

    /// Overwrite one preloaded image.
    pub fn load_image(&self, image: &Image) -> Result<()> {
        self.call_done(Request::LoadImage(image.clone()))?;
        if let Some(project) = self.shared.project.lock().as_mut() {
            project.add_image(image.clone());
        }
        Ok(())
    }

    /// Start `sequence` on `component`, reporting status for every `stride`-th frame.
    ///
    /// A component that is not stopped is stopped first.
    pub fn start_sequence(&self, sequence: SequenceId, component: usize, stride: u32) -> Result<()> {
        let channels = self.channels(component)?;
        let state = channels.state.state();
        if state != RunState::Stopped {
            info!(
                "Component {} is {:?}, stopping it before starting sequence {}",
                component, state, sequence
            );
            self.stop_sequence(component)?;
            self.wait_for_state(component, RunState::Stopped, self.state_timeout())?;
        }
        channels.statuses.reset();
        channels.state.mark();
        let (generation, _) = channels.state.snapshot();
        self.call_done(Request::StartSequence {
            sequence,
            component,
            stride,
        })?;
        // The device reports the transition before it answers, but the report may still be on
        // its way through the status thread.
        let shared = &self.shared;
        if !channels.state.wait_until(self.state_timeout(), |current, _| {
            current != generation || shared.is_closed()
        }) {
            return Err(Error::Timeout);
        }
        if shared.is_closed() {
            return Err(TransportError::Closed.into());
        }
        info!("Started sequence {} on component {}", sequence, component);
        Ok(())
    }

    /// Stop `component` after its current frame. Stopping a stopped component is fine.
    pub fn stop_sequence(&self, component: usize) -> Result<()> {
        self.channels(component)?.state.mark();
        self.call_done(Request::StopSequence { component })?;
        info!("Stopping component {}", component);
        Ok(())
    }

    /// Move a component showing a forever-repeating item on to the next item.
    pub fn next_sequence_item(&self, component: usize) -> Result<()> {
        self.channels(component)?;
        self.call_done(Request::NextSequenceItem { component })
    }

    /// Move a component showing a forever-repeating item to item `item` (0-based).
    pub fn goto_sequence_item(&self, component: usize, item: u32) -> Result<()> {
        self.channels(component)?;
        self.call_done(Request::GotoSequenceItem { component, item })
    }

    /// Queue a streaming item, blocking while the device's streaming memory is full. Returns the
    /// item's serial number.
    pub fn add_streaming_sequence_item(&self, item: &SequenceItem, component: usize) -> Result<u64> {
        let channels = self.channels(component)?;
        let budget = self.shared.components.read()[component].image_memory_size();
        channels
            .stream
            .acquire(|| streaming_capacity(budget, streaming_item_bytes(item)))?;
        let reply = self.call(Request::AddStreamingItem {
            component,
            item: item.clone(),
        });
        match reply {
            Ok(Reply::StreamingItemAdded { serial }) => Ok(serial),
            Ok(reply) => {
                channels.stream.release();
                Err(unexpected_reply(reply))
            }
            Err(err) => {
                channels.stream.release();
                Err(err)
            }
        }
    }

    /// Streaming items sent to `component` that it has not finished with.
    pub fn num_streaming_sequence_items(&self, component: usize) -> Result<usize> {
        Ok(self.channels(component)?.stream.in_flight())
    }

    /// Have camera `component` send its next `count` captures to the acquired-image queue.
    pub fn acquire_images(&self, count: u32, component: usize) -> Result<()> {
        let queue = self.acquired(component)?;
        // A new grant covers every free slot, including any still owed.
        queue.take_owed_credits();
        let credits = queue.free_slots();
        self.call_done(Request::AcquireImages {
            component,
            count,
            credits,
        })?;
        debug!(
            "Acquiring {} images from component {} with {} credits",
            count, component, credits
        );
        Ok(())
    }

    /// Fetch the last capture stored at `from`, waiting up to `timeout` for one to exist.
    ///
    /// Returns an empty image if there is none by then. While waiting, the device is only asked
    /// again after it reports storing another capture.
    pub fn retrieve_image<T: Into<WaitTimeout>>(&self, from: RetrieveFrom, timeout: T) -> Result<Image> {
        let deadline = timeout.into().deadline();
        let shared = &self.shared;
        loop {
            let seen = shared.captures.count();
            match self.call(Request::RetrieveImage(from))? {
                Reply::Retrieved(Some(acquired)) => {
                    *self.shared.last_image.lock() = Some(acquired.image.clone());
                    return Ok(acquired.image);
                }
                Reply::Retrieved(None) => (),
                reply => return Err(unexpected_reply(reply)),
            }
            if shared.is_closed() || deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                debug!("Nothing to retrieve at {:?}", from);
                return Ok(Image::new(ImageId::NONE));
            }
            shared.captures.wait_past(seen, deadline, &shared.closed);
        }
    }

    /// The image most recently returned by [`ControllerDriver::retrieve_image`].
    pub fn last_image_retrieved(&self) -> Option<Image> {
        self.shared.last_image.lock().clone()
    }

    /// The oldest acquired image, left in the queue.
    pub fn next_acquired_image(&self, component: usize) -> Result<Option<AcquiredImage>> {
        Ok(self.acquired(component)?.peek())
    }

    /// Remove the oldest acquired image, giving the device a credit for another.
    ///
    /// A credit the device could not be given is kept and sent with the next one.
    pub fn pop_acquired_image(&self, component: usize) -> Result<Option<AcquiredImage>> {
        let queue = self.acquired(component)?;
        let image = match queue.pop() {
            Some(image) => image,
            None => return Ok(None),
        };
        queue.owe_credits(1);
        if let Err(err) = self.return_owed_credits(component) {
            warn!("Returning an image credit to component {} failed: {}", component, err);
        }
        Ok(Some(image))
    }

    /// Send camera `component` every credit it is owed.
    fn return_owed_credits(&self, component: usize) -> Result<()> {
        let queue = self.acquired(component)?;
        let credits = queue.take_owed_credits();
        if credits == 0 {
            return Ok(());
        }
        let result = self.call_done(Request::ReturnImageCredit { component, credits });
        if result.is_err() {
            queue.owe_credits(credits);
        }
        result
    }

    pub fn is_acquired_image_queue_empty(&self, component: usize) -> Result<bool> {
        Ok(self.acquired(component)?.is_empty())
    }

    /// Block until camera `component` has an acquired image queued.
    pub fn wait_for_acquired_image<T: Into<WaitTimeout>>(
        &self,
        component: usize,
        timeout: T,
    ) -> Result<()> {
        let queue = self.acquired(component)?;
        if let Err(err) = self.return_owed_credits(component) {
            warn!("Component {} is still owed image credits: {}", component, err);
        }
        if queue.wait(timeout.into()) {
            Ok(())
        } else if self.shared.is_closed() {
            Err(TransportError::Closed.into())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Take the oldest status report.
    pub fn next_sequence_status(&self, component: usize) -> Result<Option<SequenceStatusValues>> {
        self.channels(component)?.statuses.next()
    }

    /// The newest status report. Older queued reports are discarded.
    pub fn latest_sequence_status(&self, component: usize) -> Result<Option<SequenceStatusValues>> {
        Ok(self.channels(component)?.statuses.latest())
    }

    pub fn is_sequence_status_queue_empty(&self, component: usize) -> Result<bool> {
        self.channels(component)?.statuses.is_empty()
    }

    /// The last run-state `component` reported. Never touches the device.
    pub fn device_state(&self, component: usize) -> Result<RunState> {
        Ok(self.channels(component)?.state.state())
    }

    /// Block until `component` reports `expected`.
    ///
    /// A state entered since the last start or stop counts even if the component has already
    /// moved on, so waiting for `Running` on a sequence that has finished succeeds.
    pub fn wait_for_state<T: Into<WaitTimeout>>(
        &self,
        component: usize,
        expected: RunState,
        timeout: T,
    ) -> Result<()> {
        let channels = self.channels(component)?;
        let shared = &self.shared;
        let mut reached = false;
        channels.state.wait_until(timeout.into(), |_, state| {
            reached = state == expected || channels.state.entered_since_mark(expected);
            reached || shared.is_closed()
        });
        if reached {
            Ok(())
        } else if shared.is_closed() {
            Err(TransportError::Closed.into())
        } else {
            Err(Error::Timeout)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::{DeviceType, FramePosition, StatusCode};
    use crate::error::NotFound;
    use crate::test::{camera_project, dmd_project, MockTransport};
    use crate::timing::Ticks;
    use crate::wire::{DeviceEvent, Opcode};

    fn connect(mock: &Arc<MockTransport>) -> HostSystem {
        HostSystem::with_transport(
            Arc::clone(mock) as Arc<dyn Transport>,
            &ConnectionSettings::default(),
            HostOptions {
                acquired_queue_capacity: 4,
                status_queue_capacity: 8,
                retry: RetryPolicy {
                    attempts: 3,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
                ..HostOptions::default()
            },
        )
        .unwrap()
    }

    fn status(frame: u32) -> DeviceEvent {
        DeviceEvent::Sequence(SequenceStatusValues {
            code: StatusCode::FrameStarted,
            position: FramePosition {
                frame,
                ..FramePosition::default()
            },
            frame_count: frame as u64 + 1,
            timestamp: Ticks::ZERO,
        })
    }

    #[test]
    fn connect_enumerates() {
        let mock = Arc::new(MockTransport::new(camera_project(1, 16).components().to_vec()));
        let host = connect(&mock);
        let types: Vec<_> = host
            .components()
            .iter()
            .map(Component::device_type)
            .collect();
        assert_eq!(
            types,
            [
                DeviceType::DmdCameraController,
                DeviceType::Dmd4500,
                DeviceType::Cmv4000Mono
            ]
        );
        assert_eq!(host.device_state(2).unwrap(), RunState::Stopped);
        assert!(matches!(
            host.device_state(3),
            Err(Error::NotFound(NotFound::Component(3)))
        ));
    }

    #[test]
    fn version_mismatch() {
        let mock = Arc::new(MockTransport::new(dmd_project(1, Ticks::from_ms(1.0)).components().to_vec()).with_version(7));
        let result = HostSystem::with_transport(
            mock.clone(),
            &ConnectionSettings::default(),
            HostOptions::default(),
        );
        assert!(matches!(
            result,
            Err(Error::ProtocolMismatch { host: PROTOCOL_VERSION, device: 7 })
        ));
        assert!(mock.is_stopped());
    }

    #[test]
    fn load_sends_everything_then_commits() {
        let project = dmd_project(3, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        driver.load_project(&project).unwrap();
        driver.wait_for_load_complete(WaitTimeout::from_ms(1000.0)).unwrap();
        assert_eq!(driver.images_to_load(), 0);
        let opcodes: Vec<Opcode> = mock.requests().iter().map(Request::opcode).collect();
        assert_eq!(
            opcodes,
            [
                Opcode::Hello,
                Opcode::EnumerateComponents,
                Opcode::LoadBegin,
                Opcode::LoadComponent,
                Opcode::LoadComponent,
                Opcode::LoadImage,
                Opcode::LoadImage,
                Opcode::LoadImage,
                Opcode::LoadSequence,
                Opcode::LoadCommit,
            ]
        );
        assert_eq!(driver.project().unwrap().image_count(), 3);
    }

    #[test]
    fn rejected_load_is_aborted() {
        let project = dmd_project(2, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        mock.fail_next(
            Opcode::LoadSequence,
            &ProjectError::Rejected("no room".to_string()).into(),
        );
        let driver = host.driver();
        assert!(matches!(
            driver.load_project(&project),
            Err(Error::InvalidProject(ProjectError::Rejected(_)))
        ));
        assert!(matches!(
            mock.requests().last(),
            Some(Request::LoadAbort)
        ));
        assert!(driver.project().is_none());
        // Nothing is pending after a failed load.
        driver.wait_for_load_complete(WaitTimeout::from_ms(0.0)).unwrap();
    }

    #[test]
    fn invalid_projects_never_leave_the_host() {
        let mut project = dmd_project(1, Ticks::from_ms(1.0));
        project.add_image(Image::for_device(ImageId(9), DeviceType::Cmv4000Mono));
        let mut frame_project = project.clone();
        frame_project
            .add_frame(crate::project::Frame::new(
                SequenceId(1),
                ImageId(9),
                Ticks::from_ms(1.0),
            ))
            .unwrap();
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        assert!(matches!(
            host.driver().load_project(&frame_project),
            Err(Error::InvalidProject(ProjectError::IncompatibleImage { .. }))
        ));
        // Only the handshake went out.
        assert_eq!(mock.requests().len(), 2);

        let camera = camera_project(1, 16);
        assert!(matches!(
            host.driver().load_project(&camera),
            Err(Error::InvalidProject(ProjectError::ComponentCountMismatch {
                project: 3,
                device: 2
            }))
        ));
    }

    #[test]
    fn start_stops_first_and_waits() {
        let project = dmd_project(2, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        driver.start_sequence(SequenceId(1), 1, 1).unwrap();
        driver
            .wait_for_state(1, RunState::Running, WaitTimeout::from_ms(1000.0))
            .unwrap();
        driver.start_sequence(SequenceId(1), 1, 1).unwrap();
        let opcodes: Vec<Opcode> = mock.requests().iter().map(Request::opcode).skip(2).collect();
        assert_eq!(
            opcodes,
            [
                Opcode::StartSequence,
                Opcode::StopSequence,
                Opcode::StartSequence
            ]
        );
        driver.stop_sequence(1).unwrap();
        driver
            .wait_for_state(1, RunState::Stopped, WaitTimeout::from_ms(1000.0))
            .unwrap();
        // Stopping again is harmless.
        driver.stop_sequence(1).unwrap();
    }

    #[test]
    fn device_errors_surface() {
        let project = dmd_project(1, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        mock.fail_next(
            Opcode::NextSequenceItem,
            &Error::DeviceBusy {
                component: 1,
                state: RunState::Stopped,
            },
        );
        assert!(matches!(
            host.driver().next_sequence_item(1),
            Err(Error::DeviceBusy {
                component: 1,
                state: RunState::Stopped
            })
        ));
    }

    #[test]
    fn statuses_in_order_and_latest() {
        let project = dmd_project(1, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        for frame in 0..3 {
            mock.send_status(1, status(frame));
        }
        mock.send_status(1, DeviceEvent::RunState(RunState::Running));
        driver
            .wait_for_state(1, RunState::Running, WaitTimeout::from_ms(1000.0))
            .unwrap();
        let first = driver.next_sequence_status(1).unwrap().unwrap();
        assert_eq!(first.frame_index(), 0);
        assert_eq!(driver.latest_sequence_status(1).unwrap().unwrap().frame_index(), 2);
        assert!(driver.is_sequence_status_queue_empty(1).unwrap());
    }

    #[test]
    fn status_gap_is_an_error() {
        let project = dmd_project(1, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        mock.send_status(1, status(0));
        mock.skip_status(1);
        mock.send_status(1, DeviceEvent::RunState(RunState::Running));
        driver
            .wait_for_state(1, RunState::Running, WaitTimeout::from_ms(1000.0))
            .unwrap();
        assert!(matches!(
            driver.next_sequence_status(1),
            Err(Error::StatusLost { component: 1 })
        ));
    }

    #[test]
    fn acquired_images_return_credits() {
        let project = camera_project(2, 16);
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        assert!(matches!(
            driver.acquire_images(2, 1),
            Err(Error::InvalidArgument(_))
        ));
        driver.acquire_images(2, 2).unwrap();
        assert!(matches!(
            mock.requests().last(),
            Some(Request::AcquireImages {
                component: 2,
                count: 2,
                credits: 4
            })
        ));
        mock.send_image(2, 0);
        mock.send_image(2, 1);
        driver
            .wait_for_acquired_image(2, WaitTimeout::from_ms(1000.0))
            .unwrap();
        assert_eq!(driver.next_acquired_image(2).unwrap().unwrap().capture_number, 0);
        assert_eq!(driver.pop_acquired_image(2).unwrap().unwrap().capture_number, 0);
        assert!(matches!(
            mock.requests().last(),
            Some(Request::ReturnImageCredit {
                component: 2,
                credits: 1
            })
        ));
        driver
            .wait_for_acquired_image(2, WaitTimeout::from_ms(1000.0))
            .unwrap();
        assert_eq!(driver.pop_acquired_image(2).unwrap().unwrap().capture_number, 1);
        assert!(driver.is_acquired_image_queue_empty(2).unwrap());
        assert!(matches!(
            driver.wait_for_acquired_image(2, WaitTimeout::from_ms(5.0)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn failed_credit_returns_are_resent() {
        let project = camera_project(2, 16);
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        driver.acquire_images(3, 2).unwrap();
        mock.send_image(2, 0);
        mock.send_image(2, 1);
        driver
            .wait_for_acquired_image(2, WaitTimeout::from_ms(1000.0))
            .unwrap();
        mock.fail_next(
            Opcode::ReturnImageCredit,
            &Error::DeviceBusy {
                component: 2,
                state: RunState::Running,
            },
        );
        // The image still comes back; its credit waits for the next chance.
        assert_eq!(driver.pop_acquired_image(2).unwrap().unwrap().capture_number, 0);
        let mut next = None;
        while next.is_none() {
            next = driver.pop_acquired_image(2).unwrap();
            if next.is_none() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(next.unwrap().capture_number, 1);
        assert!(matches!(
            mock.requests().last(),
            Some(Request::ReturnImageCredit {
                component: 2,
                credits: 2
            })
        ));
        assert_eq!(mock.request_count(Opcode::ReturnImageCredit), 2);
    }

    #[test]
    fn idempotent_requests_are_retried() {
        let project = dmd_project(1, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        mock.time_out_next(Opcode::StopSequence, 2);
        driver.stop_sequence(1).unwrap();
        assert_eq!(mock.request_count(Opcode::StopSequence), 3);

        mock.time_out_next(Opcode::StopSequence, 3);
        assert!(matches!(
            driver.stop_sequence(1),
            Err(Error::Transport(TransportError::ResponseTimeout(Opcode::StopSequence)))
        ));

        // Sending this twice would skip two items.
        mock.time_out_next(Opcode::NextSequenceItem, 1);
        assert!(matches!(
            driver.next_sequence_item(1),
            Err(Error::Transport(TransportError::ResponseTimeout(
                Opcode::NextSequenceItem
            )))
        ));
        assert_eq!(mock.request_count(Opcode::NextSequenceItem), 1);
    }

    #[test]
    fn short_run_still_counts_as_running() {
        let project = dmd_project(1, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        driver.start_sequence(SequenceId(1), 1, 1).unwrap();
        // A one-frame sequence is over before anyone waits for it.
        mock.send_status(1, DeviceEvent::RunState(RunState::Stopping));
        mock.send_status(1, DeviceEvent::RunState(RunState::Stopped));
        driver
            .wait_for_state(1, RunState::Stopped, WaitTimeout::from_ms(1000.0))
            .unwrap();
        driver
            .wait_for_state(1, RunState::Running, WaitTimeout::from_ms(5.0))
            .unwrap();

        driver.stop_sequence(1).unwrap();
        assert!(matches!(
            driver.wait_for_state(1, RunState::Running, WaitTimeout::from_ms(5.0)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn retrieve_waits_for_a_stored_capture() {
        let project = camera_project(1, 16);
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        let retriever = driver.clone();
        let handle = thread::spawn(move || {
            retriever.retrieve_image(RetrieveFrom::Image(ImageId(1)), WaitTimeout::from_ms(5000.0))
        });
        thread::sleep(Duration::from_millis(30));
        // One look, then nothing until the device has something new.
        assert_eq!(mock.request_count(Opcode::RetrieveImage), 1);
        mock.store_capture(2, ImageId(1), 7);
        let image = handle.join().unwrap().unwrap();
        assert!(!image.is_empty());
        assert_eq!(image.pixels()[0], 7);
        assert_eq!(mock.request_count(Opcode::RetrieveImage), 2);
        assert!(driver.last_image_retrieved().is_some());
    }

    #[test]
    fn retrieve_times_out_empty() {
        let project = camera_project(1, 16);
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let host = connect(&mock);
        let driver = host.driver();
        let image = driver
            .retrieve_image(RetrieveFrom::Image(ImageId(1)), WaitTimeout::from_ms(10.0))
            .unwrap();
        assert!(image.is_empty());
        assert_eq!(image.byte_size(), 0);
        assert!(driver.last_image_retrieved().is_none());
    }

    #[test]
    fn streaming_blocks_at_capacity() {
        let project = dmd_project(1, Ticks::from_ms(1.0));
        let mut components = project.components().to_vec();
        // Room for exactly two full-size streaming images, one of which is held back.
        components[1].set_image_memory_size(2 * 1140 * 912 / 8);
        let mock = Arc::new(MockTransport::new(components));
        let host = connect(&mock);
        let driver = host.driver();
        let pixels = vec![0u8; 1140 * 912];
        let image =
            Image::from_row_major_8bit(ImageId::NONE, 1140, 912, &pixels, DeviceType::Dmd4500)
                .unwrap();
        let mut item = SequenceItem::new(SequenceId(5), 1);
        item.add_frame(crate::project::Frame::streaming(
            SequenceId(5),
            image,
            Ticks::from_ms(1.0),
        ));
        assert_eq!(driver.add_streaming_sequence_item(&item, 1).unwrap(), 0);
        assert_eq!(driver.num_streaming_sequence_items(1).unwrap(), 1);

        let adder = driver.clone();
        let blocked_item = item.clone();
        let handle = thread::spawn(move || adder.add_streaming_sequence_item(&blocked_item, 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(mock.requests().len(), 3);
        mock.send_status(1, DeviceEvent::StreamItemDone { serial: 0 });
        assert_eq!(handle.join().unwrap().unwrap(), 1);
        assert_eq!(driver.num_streaming_sequence_items(1).unwrap(), 1);
    }

    #[test]
    fn shutdown_wakes_waiters() {
        let project = dmd_project(1, Ticks::from_ms(1.0));
        let mock = Arc::new(MockTransport::new(project.components().to_vec()));
        let mut host = connect(&mock);
        let driver = host.driver();
        let waiter = thread::spawn(move || {
            driver.wait_for_state(1, RunState::Running, WaitTimeout::Forever)
        });
        thread::sleep(Duration::from_millis(20));
        host.shutdown();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(Error::Transport(TransportError::Closed))
        ));
        assert!(mock.is_stopped());
    }
}
