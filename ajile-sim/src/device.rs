// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ajile_host::device::{FramePosition, MajorOrder, RunState};
use ajile_host::engine::{Capture, Engine, EngineEvent};
use ajile_host::error::{Error, NotFound, ProjectError, Result, TransportError};
use ajile_host::project::{Component, Image, ImageId, PixelBuffer, Project, TriggerAction};
use ajile_host::timing::{MonotonicClock, SystemClock, Ticks};
use ajile_host::transport::{ConnectionSettings, Link, RetryPolicy, StreamTransport, Transport};
use ajile_host::wire::image::ImageHeader;
use ajile_host::wire::{
    self, encode_error, AcquiredImage, DeviceEvent, Opcode, Reply, Request, RetrieveFrom,
    StatusMessage, PROTOCOL_VERSION,
};
use ajile_host::{HostOptions, HostSystem};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::pipe::{pipe, PipeReader, PipeWriter};

/// The longest the clock sleeps in real time before checking the wall clock again.
const MAX_IDLE: Duration = Duration::from_millis(10);

/// Frame starts remembered per component.
const DISPLAY_LOG_LENGTH: usize = 16_384;

/// How virtual device time relates to the wall clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Pacing {
    /// Device time runs `speedup` times faster than the wall clock.
    RealTime { speedup: f64 },

    /// Device time jumps straight to the next scheduled event. Forever-repeating sequences never
    /// let the clock rest, so this suits finite or triggered sequences.
    Free,
}

/// A frame starting on a component.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DisplayRecord {
    pub position: FramePosition,

    /// [`ImageId::NONE`] for streamed frames.
    pub image: ImageId,

    /// How many times the image had been overwritten since the project was loaded.
    pub version: u64,
    pub stream_serial: Option<u64>,
    pub timestamp: Ticks,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutputPulse {
    pub component: usize,
    pub pin: u8,
    pub start: Ticks,
    pub end: Ticks,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MissedTrigger {
    pub component: usize,
    pub action: TriggerAction,
    pub timestamp: Ticks,
}

/// Device time scaled from the wall clock.
#[derive(Clone, Copy, Debug)]
struct VirtualClock {
    wall: SystemClock,
    speedup: f64,
}

impl VirtualClock {
    fn now(&self) -> Ticks {
        Ticks((self.wall.now_ticks().as_u64() as f64 * self.speedup) as u64)
    }

    /// Wall time until device time reaches `deadline`.
    fn until(&self, deadline: Ticks) -> Duration {
        let ticks = deadline.saturating_sub(self.now()).as_u64() as f64 / self.speedup;
        Ticks(ticks as u64).to_duration()
    }
}

/// Everything a test can look at after the fact.
#[derive(Debug, Default)]
struct Observations {
    frames_started: HashMap<usize, u64>,
    display_log: HashMap<usize, VecDeque<DisplayRecord>>,
    output_pulses: Vec<OutputPulse>,
    missed_triggers: Vec<MissedTrigger>,
    tears: u64,
}

struct Core {
    clock: Option<VirtualClock>,
    engine: Engine,

    /// The running project. Before the first load it only has the components.
    project: Project,
    staging: Option<Project>,
    protocol_version: u16,
    image_versions: HashMap<ImageId, u64>,
    captures: HashMap<ImageId, AcquiredImage>,
    captures_at: HashMap<FramePosition, AcquiredImage>,
    writer: Option<PipeWriter>,
    session: u64,
    sequence_numbers: HashMap<usize, u32>,
    load_complete_pending: bool,
    observed: Observations,
    shutdown: bool,
}

impl Core {
    /// Bring the engine up to the wall clock, when there is one.
    fn catch_up(&mut self) {
        if let Some(clock) = self.clock {
            self.engine.advance_to(clock.now());
            self.flush_events();
        }
    }

    fn send(&mut self, opcode: Opcode, payload: &[u8]) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = wire::write_frame(writer, opcode, payload) {
                debug!("Dropping the host connection: {}", err);
                self.writer = None;
            }
        }
    }

    fn send_status(&mut self, component: usize, event: DeviceEvent) {
        let number = self.sequence_numbers.entry(component).or_insert(0);
        let message = StatusMessage {
            component,
            sequence_number: *number,
            event,
        };
        *number = number.wrapping_add(1);
        self.send(Opcode::Status, &message.encode());
    }

    fn flush_events(&mut self) {
        let events: Vec<EngineEvent> = self.engine.drain_events().collect();
        for event in events {
            self.on_event(event);
        }
    }

    fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::RunState { component, state } => {
                self.send_status(component, DeviceEvent::RunState(state))
            }
            EngineEvent::Status { component, status } => {
                self.send_status(component, DeviceEvent::Sequence(status))
            }
            EngineEvent::FrameStarted {
                component,
                position,
                image,
                stream_serial,
                timestamp,
            } => {
                *self.observed.frames_started.entry(component).or_insert(0) += 1;
                let record = DisplayRecord {
                    position,
                    image,
                    version: self.image_versions.get(&image).copied().unwrap_or(0),
                    stream_serial,
                    timestamp,
                };
                let log = self.observed.display_log.entry(component).or_default();
                if log.len() == DISPLAY_LOG_LENGTH {
                    log.pop_front();
                }
                log.push_back(record);
            }
            EngineEvent::Captured {
                component,
                capture,
                transferred,
            } => {
                if let Some(acquired) = self.synthesize(component, &capture) {
                    if transferred {
                        self.send(Opcode::AcquiredImage, &acquired.encode());
                    }
                    let capture_number = acquired.capture_number;
                    if !capture.image.is_none() {
                        self.captures.insert(capture.image, acquired.clone());
                    }
                    self.captures_at.insert(capture.position, acquired);
                    self.send_status(component, DeviceEvent::ImageStored { capture_number });
                }
            }
            EngineEvent::Transferred { component, capture } => {
                let acquired = self
                    .captures_at
                    .get(&capture.position)
                    .filter(|stored| stored.capture_number == capture.capture_number)
                    .cloned()
                    .or_else(|| self.synthesize(component, &capture));
                if let Some(acquired) = acquired {
                    self.send(Opcode::AcquiredImage, &acquired.encode());
                }
            }
            EngineEvent::StreamItemDone { component, serial } => {
                self.send_status(component, DeviceEvent::StreamItemDone { serial })
            }
            EngineEvent::OutputPulse {
                component,
                pin,
                start,
                end,
            } => self.observed.output_pulses.push(OutputPulse {
                component,
                pin,
                start,
                end,
            }),
            EngineEvent::MissedTrigger {
                component,
                action,
                timestamp,
            } => {
                warn!(
                    "Component {} missed a {:?} trigger at {}",
                    component, action, timestamp
                );
                self.observed.missed_triggers.push(MissedTrigger {
                    component,
                    action,
                    timestamp,
                });
            }
        }
    }

    /// Make up the image a camera would have captured.
    fn synthesize(&self, component: usize, capture: &Capture) -> Option<AcquiredImage> {
        let camera = self.engine.component(component)?;
        let bit_depth = self
            .project
            .image(capture.image)
            .map_or(camera.bit_depth(), Image::bit_depth);
        let header = ImageHeader {
            width: camera.columns(),
            height: capture.rows,
            channels: 1,
            bit_depth,
            major_order: MajorOrder::Row,
        };
        let pixels = capture_pixels(&header, capture.capture_number);
        let image = Image::from_parts(
            capture.image,
            header,
            Some(camera.device_type()),
            PixelBuffer::shared(pixels.into()),
        );
        match image {
            Ok(image) => Some(AcquiredImage {
                component,
                capture_number: capture.capture_number,
                position: capture.position,
                timestamp: capture.timestamp,
                image,
            }),
            Err(err) => {
                error!("Could not build capture {}: {}", capture.capture_number, err);
                None
            }
        }
    }

    fn respond(&mut self, request: Request) -> Vec<u8> {
        self.catch_up();
        let opcode = request.opcode();
        let result = self.apply(request);
        // Status reports caused by the request go out before its response.
        self.flush_events();
        match result {
            Ok(reply) => reply.encode(),
            Err(err) => {
                debug!("Refusing {:?}: {}", opcode, err);
                encode_error(&err)
            }
        }
    }

    fn check_all_stopped(&self) -> Result<()> {
        match (0..self.engine.component_count())
            .find(|component| self.engine.run_state(*component) != RunState::Stopped)
        {
            Some(component) => Err(Error::DeviceBusy {
                component,
                state: self.engine.run_state(component),
            }),
            None => Ok(()),
        }
    }

    fn staging(&mut self) -> Result<&mut Project> {
        self.staging
            .as_mut()
            .ok_or(Error::InvalidArgument("no project load in progress"))
    }

    fn apply(&mut self, request: Request) -> Result<Reply> {
        let reply = match request {
            Request::Hello { version } => {
                if version != self.protocol_version {
                    warn!(
                        "Host speaks protocol {}, this device {}",
                        version, self.protocol_version
                    );
                }
                Reply::Hello {
                    version: self.protocol_version,
                }
            }
            Request::EnumerateComponents => Reply::Components(self.project.components().to_vec()),
            Request::LoadBegin { name } => {
                self.check_all_stopped()?;
                if self.staging.is_some() {
                    warn!("Discarding an unfinished project load");
                }
                let mut project = Project::new(&name);
                project.set_components(self.project.components().to_vec());
                self.staging = Some(project);
                Reply::Done
            }
            Request::LoadComponent { index, component } => {
                let device = self
                    .project
                    .component(index)
                    .ok_or(NotFound::Component(index))?
                    .device_type();
                if device != component.device_type() {
                    return Err(ProjectError::ComponentTypeMismatch {
                        index,
                        project: component.device_type(),
                        device,
                    }
                    .into());
                }
                match self.staging.as_mut() {
                    Some(project) => project.set_component(index, component)?,
                    None => {
                        self.engine.replace_component(index, component.clone())?;
                        self.project.set_component(index, component)?;
                    }
                }
                Reply::Done
            }
            Request::LoadImage(image) => {
                match self.staging.as_mut() {
                    Some(project) => {
                        project.add_image(image);
                    }
                    None => self.overwrite_image(image)?,
                }
                Reply::Done
            }
            Request::LoadSequence(sequence) => {
                self.staging()?.add_sequence(sequence);
                Reply::Done
            }
            Request::LoadTriggerRule(rule) => {
                self.staging()?.add_trigger_rule(rule);
                Reply::Done
            }
            Request::LoadCommit => self.commit()?,
            Request::LoadAbort => {
                if self.staging.take().is_some() {
                    info!("Project load aborted");
                }
                Reply::Done
            }
            Request::StartSequence {
                sequence,
                component,
                stride,
            } => {
                self.engine.start_sequence(sequence, component, stride)?;
                Reply::Done
            }
            Request::StopSequence { component } => {
                self.engine.stop_sequence(component)?;
                Reply::Done
            }
            Request::NextSequenceItem { component } => {
                self.engine.next_item(component)?;
                Reply::Done
            }
            Request::GotoSequenceItem { component, item } => {
                self.engine.goto_item(component, item)?;
                Reply::Done
            }
            Request::AddStreamingItem { component, item } => Reply::StreamingItemAdded {
                serial: self.engine.add_streaming_item(component, item)?,
            },
            Request::AcquireImages {
                component,
                count,
                credits,
            } => {
                self.engine.acquire_images(component, count, credits)?;
                Reply::Done
            }
            Request::RetrieveImage(from) => Reply::Retrieved(match from {
                RetrieveFrom::Image(id) => self.captures.get(&id).cloned(),
                RetrieveFrom::Frame(position) => self.captures_at.get(&position).cloned(),
            }),
            Request::ReturnImageCredit { component, credits } => {
                self.engine.return_credits(component, credits)?;
                Reply::Done
            }
        };
        Ok(reply)
    }

    /// Replace one image of the running project in place.
    fn overwrite_image(&mut self, image: Image) -> Result<()> {
        let id = image.id();
        if self.project.image(id).is_none() {
            return Err(NotFound::Image(id).into());
        }
        for component in 0..self.engine.component_count() {
            if self.engine.active_image(component) == Some(id) {
                warn!("Image {} was overwritten while component {} showed it", id, component);
                self.observed.tears += 1;
            }
        }
        *self.image_versions.entry(id).or_insert(0) += 1;
        self.project.add_image(image);
        Ok(())
    }

    fn commit(&mut self) -> Result<Reply> {
        let project = self
            .staging
            .take()
            .ok_or(Error::InvalidArgument("no project load in progress"))?;
        self.check_all_stopped()?;
        let engine = Engine::starting_at(&project, self.engine.now())?;
        let images_to_load = project.image_count() as u32;
        info!(
            "Loaded project \"{}\" with {} images",
            project.name(),
            images_to_load
        );
        self.engine = engine;
        self.project = project;
        self.image_versions.clear();
        self.captures.clear();
        self.captures_at.clear();
        self.load_complete_pending = true;
        Ok(Reply::LoadCommitted { images_to_load })
    }
}

/// Every sample of a synthetic capture holds the capture number.
fn capture_pixels(header: &ImageHeader, capture_number: u64) -> Vec<u8> {
    let size = header.byte_size() as usize;
    if header.bit_depth > 8 {
        let mask = (1u32 << header.bit_depth.min(16)) - 1;
        let sample = (capture_number as u32 & mask) as u16;
        sample.to_le_bytes().iter().copied().cycle().take(size).collect()
    } else {
        vec![capture_number as u8; size]
    }
}

struct Inner {
    core: Mutex<Core>,

    /// Notified whenever device state changes.
    changed: Condvar,
}

/// Serve one host connection until it closes.
fn serve(inner: Arc<Inner>, mut reader: PipeReader, session: u64) {
    let mut payload = Vec::new();
    loop {
        let opcode = match wire::read_frame(&mut reader, &mut payload) {
            Ok(opcode) => opcode,
            Err(TransportError::Closed) => break,
            Err(err) => {
                error!("Reading a request failed: {}", err);
                break;
            }
        };
        let mut core = inner.core.lock();
        let response = match Request::decode(opcode, &payload) {
            Ok(request) => core.respond(request),
            Err(err) => {
                warn!("Could not decode a {:?} request: {}", opcode, err);
                encode_error(&err.into())
            }
        };
        core.send(Opcode::Response, &response);
        if core.load_complete_pending {
            core.load_complete_pending = false;
            core.send_status(0, DeviceEvent::LoadComplete);
        }
        drop(core);
        inner.changed.notify_all();
    }
    let mut core = inner.core.lock();
    if core.session == session {
        core.writer = None;
        info!("Host disconnected");
    }
}

/// Move device time forward until the device is dropped.
fn run_clock(inner: Arc<Inner>) {
    let mut core = inner.core.lock();
    while !core.shutdown {
        match core.clock {
            Some(clock) => {
                core.catch_up();
                let wait = core
                    .engine
                    .next_deadline()
                    .map_or(MAX_IDLE, |deadline| clock.until(deadline).min(MAX_IDLE));
                inner.changed.notify_all();
                inner.changed.wait_for(&mut core, wait);
            }
            None => match core.engine.next_deadline() {
                Some(deadline) => {
                    core.engine.advance_to(deadline);
                    core.flush_events();
                    inner.changed.notify_all();
                    MutexGuard::bump(&mut core);
                }
                None => inner.changed.wait(&mut core),
            },
        }
    }
    debug!("Simulated clock stopped");
}

/// The host end of a [`SimulatedDevice`]: an in-memory byte stream per connection.
#[derive(Clone)]
pub struct SimLink {
    inner: Arc<Inner>,
}

impl Link for SimLink {
    type Reader = PipeReader;
    type Writer = PipeWriter;

    fn open(
        &self,
        _settings: &ConnectionSettings,
    ) -> Result<(PipeReader, PipeWriter), TransportError> {
        let mut core = self.inner.core.lock();
        if core.shutdown {
            return Err(TransportError::DeviceNotFound(
                "simulated device".to_string(),
            ));
        }
        if core.writer.is_some() {
            return Err(TransportError::Busy);
        }
        let (host_writer, device_reader) = pipe();
        let (device_writer, host_reader) = pipe();
        let session = core.session + 1;
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("ajile-sim-session".to_string())
            .spawn(move || serve(inner, device_reader, session))?;
        core.session = session;
        core.writer = Some(device_writer);
        core.sequence_numbers.clear();
        info!("Host connected");
        Ok((host_reader, host_writer))
    }

    fn close(&self, writer: &mut PipeWriter) {
        writer.close();
    }
}

/// An Ajile controller and its components, run in virtual time.
///
/// The device speaks the wire protocol over an in-memory link, so a [`HostSystem`] drives it
/// exactly like real hardware. Captured images are synthetic: every sample of capture `n` holds
/// `n`.
pub struct SimulatedDevice {
    inner: Arc<Inner>,
    clock: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    /// Build a device with `components`, the first of which must be a controller.
    pub fn new(components: Vec<Component>, pacing: Pacing) -> Result<Self> {
        let mut project = Project::new("");
        project.set_components(components);
        let engine = Engine::new(&project)?;
        let clock = match pacing {
            Pacing::RealTime { speedup } if speedup > 0.0 => Some(VirtualClock {
                wall: SystemClock::new(),
                speedup,
            }),
            Pacing::RealTime { .. } => {
                return Err(Error::InvalidArgument("the speedup must be positive"))
            }
            Pacing::Free => None,
        };
        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                clock,
                engine,
                project,
                staging: None,
                protocol_version: PROTOCOL_VERSION,
                image_versions: HashMap::new(),
                captures: HashMap::new(),
                captures_at: HashMap::new(),
                writer: None,
                session: 0,
                sequence_numbers: HashMap::new(),
                load_complete_pending: false,
                observed: Observations::default(),
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let clock_inner = Arc::clone(&inner);
        let clock = thread::Builder::new()
            .name("ajile-sim-clock".to_string())
            .spawn(move || run_clock(clock_inner))
            .map_err(TransportError::from)?;
        Ok(Self {
            inner,
            clock: Some(clock),
        })
    }

    /// Answer the handshake with a different protocol version.
    pub fn with_protocol_version(self, version: u16) -> Self {
        self.inner.core.lock().protocol_version = version;
        self
    }

    pub fn link(&self) -> SimLink {
        SimLink {
            inner: Arc::clone(&self.inner),
        }
    }

    /// A transport to this device. Only one may be connected at a time.
    pub fn transport(&self, response_timeout: Duration) -> Arc<dyn Transport> {
        let retry = RetryPolicy {
            attempts: 1,
            ..RetryPolicy::default()
        };
        Arc::new(StreamTransport::new(self.link(), response_timeout).with_retry_policy(retry))
    }

    /// Connect a host system to this device.
    pub fn connect(&self, options: HostOptions) -> Result<HostSystem> {
        HostSystem::with_transport(
            self.transport(options.response_timeout),
            &ConnectionSettings::default(),
            options,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.inner.core.lock().writer.is_some()
    }

    /// Current device time.
    pub fn now(&self) -> Ticks {
        let mut core = self.inner.core.lock();
        core.catch_up();
        core.engine.now()
    }

    pub fn run_state(&self, component: usize) -> RunState {
        self.inner.core.lock().engine.run_state(component)
    }

    /// Drive 1-based input `pin` of `component` high and then low again. Returns whether the
    /// rising edge counted as a trigger.
    pub fn pulse_input(&self, component: usize, pin: u8) -> Result<bool> {
        let mut core = self.inner.core.lock();
        core.catch_up();
        let accepted = core.engine.input_edge(component, pin, true)?;
        core.engine.input_edge(component, pin, false)?;
        core.flush_events();
        drop(core);
        self.inner.changed.notify_all();
        Ok(accepted)
    }

    /// Frames started on `component` since the device was created.
    pub fn frame_started_count(&self, component: usize) -> u64 {
        self.observed(|observed| {
            observed
                .frames_started
                .get(&component)
                .copied()
                .unwrap_or(0)
        })
    }

    /// The most recent frame starts on `component`, oldest first.
    pub fn display_log(&self, component: usize) -> Vec<DisplayRecord> {
        self.observed(|observed| {
            observed
                .display_log
                .get(&component)
                .map(|log| log.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    pub fn output_pulses(&self) -> Vec<OutputPulse> {
        self.observed(|observed| observed.output_pulses.clone())
    }

    pub fn missed_triggers(&self) -> Vec<MissedTrigger> {
        self.observed(|observed| observed.missed_triggers.clone())
    }

    /// Images overwritten while a component was showing them.
    pub fn tears(&self) -> u64 {
        self.observed(|observed| observed.tears)
    }

    /// Block until `component` has started `count` frames. Returns false on timeout.
    pub fn wait_for_frames(&self, component: usize, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let started = |core: &Core| {
            core.observed
                .frames_started
                .get(&component)
                .map_or(false, |started| *started >= count)
        };
        let mut core = self.inner.core.lock();
        while !started(&core) {
            if self.inner.changed.wait_until(&mut core, deadline).timed_out() {
                return started(&core);
            }
        }
        true
    }

    fn observed<T, F: FnOnce(&Observations) -> T>(&self, read: F) -> T {
        let mut core = self.inner.core.lock();
        core.catch_up();
        read(&core.observed)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        {
            let mut core = self.inner.core.lock();
            core.shutdown = true;
            core.writer = None;
        }
        self.inner.changed.notify_all();
        if let Some(clock) = self.clock.take() {
            if clock.join().is_err() {
                error!("The simulated clock panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use ajile_host::device::DeviceType;

    use super::*;

    fn controller_and_camera() -> Vec<Component> {
        vec![
            Component::for_device(DeviceType::DmdCameraController),
            Component::for_device(DeviceType::Cmv4000Mono),
        ]
    }

    #[test]
    fn ten_bit_samples() {
        let header = ImageHeader {
            width: 2,
            height: 1,
            channels: 1,
            bit_depth: 10,
            major_order: MajorOrder::Row,
        };
        assert_eq!(capture_pixels(&header, 0x305), [0x05, 0x03, 0x05, 0x03]);
        let header = ImageHeader {
            bit_depth: 8,
            ..header
        };
        assert_eq!(capture_pixels(&header, 7), [7, 7]);
    }

    #[test]
    fn only_one_host_at_a_time() {
        let device = SimulatedDevice::new(controller_and_camera(), Pacing::Free).unwrap();
        let link = device.link();
        let settings = ConnectionSettings::default();
        let (_reader, mut writer) = link.open(&settings).unwrap();
        assert!(device.is_connected());
        assert!(matches!(link.open(&settings), Err(TransportError::Busy)));
        link.close(&mut writer);
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!device.is_connected());
        assert!(link.open(&settings).is_ok());
    }

    #[test]
    fn first_component_must_be_a_controller() {
        let components = vec![Component::for_device(DeviceType::Dmd4500)];
        assert!(matches!(
            SimulatedDevice::new(components, Pacing::Free),
            Err(Error::InvalidProject(_))
        ));
        assert!(SimulatedDevice::new(
            controller_and_camera(),
            Pacing::RealTime { speedup: 0.0 }
        )
        .is_err());
    }

    #[test]
    fn real_time_clock_advances() {
        let device =
            SimulatedDevice::new(controller_and_camera(), Pacing::RealTime { speedup: 100.0 })
                .unwrap();
        let first = device.now();
        thread::sleep(Duration::from_millis(5));
        assert!(device.now() > first);
    }
}
