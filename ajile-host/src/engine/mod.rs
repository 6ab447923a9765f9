// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The controller's sequence engine, in virtual time.
//!
//! [`Engine`] runs every component of a loaded project: it walks sequences, items and frames,
//! routes trigger rules, feeds streaming items, and hands camera captures to the host as
//! transfer credits allow. It does no I/O and never looks at a clock. Callers move it forward
//! with [`Engine::advance_to`] (usually to [`Engine::next_deadline`]) and collect what happened
//! with [`Engine::drain_events`].
//!
//! Within a single tick, frames ending are handled before any trigger raised in that tick, so a
//! component whose frame ends at the same moment another component triggers it is ready in
//! time. Each trigger destination acts at most once per tick.
mod trigger;

use std::collections::{vec_deque, BTreeMap, HashSet, VecDeque};

use log::debug;

use self::trigger::{InputPins, TriggerDispatcher};
use crate::device::{FramePosition, RunState, SequenceStatusValues, StatusCode};
use crate::error::{Error, NotFound, ProjectError, Result};
use crate::project::{
    Component, Frame, Image, ImageId, Project, Sequence, SequenceId, SequenceItem, SequenceKind,
    TriggerAction, TriggerDestination, TriggerEvent,
};
use crate::timing::Ticks;

/// How many streaming items fit in a component's image memory: `budget / item_bytes - 1`, and
/// always at least one.
pub fn streaming_capacity(budget: u64, item_bytes: u64) -> usize {
    match budget.checked_div(item_bytes) {
        Some(items) => items.saturating_sub(1).max(1) as usize,
        None => usize::MAX,
    }
}

/// Bytes of device memory the streaming images of `item` take up.
pub fn streaming_item_bytes(item: &SequenceItem) -> u64 {
    item.frames()
        .iter()
        .filter_map(Frame::streaming_image)
        .map(Image::byte_size)
        .sum()
}

/// One camera exposure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capture {
    /// Counts every capture since the sequence was started, from 0.
    pub capture_number: u64,
    pub position: FramePosition,

    /// The frame's image id, where a preloaded capture is stored.
    pub image: ImageId,

    /// Rows read out, after ROI and subsampling.
    pub rows: u32,

    /// When the exposure started.
    pub timestamp: Ticks,
}

/// Everything observable the engine does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineEvent {
    RunState {
        component: usize,
        state: RunState,
    },

    /// A status report, as it would go to the host.
    Status {
        component: usize,
        status: SequenceStatusValues,
    },

    /// Every frame start, whatever the status stride.
    FrameStarted {
        component: usize,
        position: FramePosition,
        image: ImageId,
        stream_serial: Option<u64>,
        timestamp: Ticks,
    },

    /// A camera frame finished. `transferred` is set when it went straight to the host.
    Captured {
        component: usize,
        capture: Capture,
        transferred: bool,
    },

    /// A capture held back for lack of credit went to the host.
    Transferred {
        component: usize,
        capture: Capture,
    },

    /// A streaming item finished (or was discarded by a stop), freeing its slot.
    StreamItemDone {
        component: usize,
        serial: u64,
    },

    OutputPulse {
        component: usize,
        pin: u8,
        start: Ticks,
        end: Ticks,
    },

    /// A trigger arrived at a component that was not waiting for it.
    MissedTrigger {
        component: usize,
        action: TriggerAction,
        timestamp: Ticks,
    },
}

/// What a component is doing right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,

    /// Waiting for a trigger before starting the current frame.
    Armed(TriggerAction),
    Exposing {
        start: Ticks,
        end: Ticks,
    },

    /// Filling out an item's repeat time after its last frame.
    Padding {
        until: Ticks,
    },

    /// A streaming sequence ran out of items. The last frame stays up.
    Underrun,

    /// A camera is holding a capture until the host returns a credit.
    Backpressure,

    /// A streaming sequence waiting for its first item.
    Paused,
}

#[derive(Clone, Copy, Debug)]
enum Jump {
    Next,
    Goto(usize),
}

#[derive(Clone, Debug)]
struct StreamEntry {
    serial: u64,
    item: SequenceItem,
}

#[derive(Clone, Debug)]
struct Run {
    sequence: SequenceId,
    kind: SequenceKind,
    stride: u64,

    /// The item index for preloaded sequences. For streaming sequences, the number of items
    /// started before the current one.
    item: usize,
    frame: usize,
    item_passes: u32,
    sequence_passes: u32,
    pass_start: Ticks,
    frames_started: u64,
    captures: u64,
    streamed_items: usize,
    jump: Option<Jump>,
    stop_requested: bool,
    streaming: Option<StreamEntry>,
}

impl Run {
    fn new(sequence: SequenceId, kind: SequenceKind, stride: u32) -> Self {
        Self {
            sequence,
            kind,
            stride: stride.max(1) as u64,
            item: 0,
            frame: 0,
            item_passes: 0,
            sequence_passes: 0,
            pass_start: Ticks::ZERO,
            frames_started: 0,
            captures: 0,
            streamed_items: 0,
            jump: None,
            stop_requested: false,
            streaming: None,
        }
    }

    fn position(&self) -> FramePosition {
        FramePosition {
            sequence: self.sequence,
            item: self.item as u32,
            frame: self.frame as u32,
        }
    }
}

#[derive(Clone, Debug)]
struct Acquisition {
    remaining: u32,
    credits: u32,
    held: Option<Capture>,
}

#[derive(Clone, Debug)]
struct Unit {
    component: Component,
    state: RunState,
    phase: Phase,
    run: Option<Run>,
    pending: VecDeque<StreamEntry>,
    stream_capacity: Option<usize>,
    acquisition: Option<Acquisition>,
    inputs: InputPins,
}

impl Unit {
    fn new(component: Component) -> Self {
        Self {
            component,
            state: RunState::Stopped,
            phase: Phase::Idle,
            run: None,
            pending: VecDeque::new(),
            stream_capacity: None,
            acquisition: None,
            inputs: InputPins::default(),
        }
    }

    fn deadline(&self) -> Option<Ticks> {
        match self.phase {
            Phase::Exposing { end, .. } => Some(end),
            Phase::Padding { until } => Some(until),
            _ => None,
        }
    }

    fn in_flight(&self) -> usize {
        let current = self
            .run
            .as_ref()
            .map_or(0, |run| run.streaming.is_some() as usize);
        self.pending.len() + current
    }
}

/// What happened to a finished camera frame.
enum Delivery {
    Sent,
    Kept,
    Held,
}

/// The sequence engine of one controller and everything attached to it.
#[derive(Clone, Debug)]
pub struct Engine {
    now: Ticks,
    sequences: BTreeMap<SequenceId, Sequence>,
    bindings: BTreeMap<SequenceId, usize>,
    units: Vec<Unit>,
    dispatcher: TriggerDispatcher,
    actions: VecDeque<TriggerDestination>,
    fired: HashSet<TriggerDestination>,
    events: VecDeque<EngineEvent>,
    next_serial: u64,
}

impl Engine {
    /// Validate `project` and set every component up, stopped, at time 0.
    pub fn new(project: &Project) -> Result<Self, ProjectError> {
        Self::starting_at(project, Ticks::ZERO)
    }

    /// Like [`Engine::new`], with the clock starting at `now`.
    pub fn starting_at(project: &Project, now: Ticks) -> Result<Self, ProjectError> {
        project.validate()?;
        Ok(Self {
            now,
            sequences: project
                .sequences()
                .map(|sequence| (sequence.id(), sequence.clone()))
                .collect(),
            bindings: project.bindings()?,
            units: project.components().iter().cloned().map(Unit::new).collect(),
            dispatcher: TriggerDispatcher::new(project.trigger_rules()),
            actions: VecDeque::new(),
            fired: HashSet::new(),
            events: VecDeque::new(),
            next_serial: 0,
        })
    }

    pub fn now(&self) -> Ticks {
        self.now
    }

    pub fn component_count(&self) -> usize {
        self.units.len()
    }

    pub fn component(&self, index: usize) -> Option<&Component> {
        self.units.get(index).map(|unit| &unit.component)
    }

    /// The component `sequence` runs on.
    pub fn bound_component(&self, sequence: SequenceId) -> Option<usize> {
        self.bindings.get(&sequence).copied()
    }

    pub fn run_state(&self, component: usize) -> RunState {
        self.units
            .get(component)
            .map_or(RunState::Stopped, |unit| unit.state)
    }

    pub fn phase(&self, component: usize) -> Phase {
        self.units
            .get(component)
            .map_or(Phase::Idle, |unit| unit.phase)
    }

    pub fn all_stopped(&self) -> bool {
        self.units
            .iter()
            .all(|unit| unit.state == RunState::Stopped)
    }

    /// The preloaded image a component is showing or exposing into, if any.
    pub fn active_image(&self, component: usize) -> Option<ImageId> {
        match self.phase(component) {
            Phase::Exposing { .. } => self
                .current_frame(component)
                .map(Frame::image_id)
                .filter(|id| !id.is_none()),
            _ => None,
        }
    }

    /// When the next scheduled change happens. `None` when every component is waiting on
    /// something outside the engine.
    pub fn next_deadline(&self) -> Option<Ticks> {
        self.units.iter().filter_map(Unit::deadline).min()
    }

    /// Run everything scheduled up to and including `time`.
    pub fn advance_to(&mut self, time: Ticks) {
        while let Some(deadline) = self.next_deadline().filter(|deadline| *deadline <= time) {
            self.set_now(deadline);
            for index in 0..self.units.len() {
                if self.units[index].deadline() == Some(deadline) {
                    self.on_deadline(index);
                }
            }
            self.dispatch();
        }
        if time > self.now {
            self.set_now(time);
        }
    }

    pub fn drain_events(&mut self) -> vec_deque::Drain<'_, EngineEvent> {
        self.events.drain(..)
    }

    /// Start `sequence` on `component`, reporting every `stride`-th frame.
    pub fn start_sequence(
        &mut self,
        sequence: SequenceId,
        component: usize,
        stride: u32,
    ) -> Result<()> {
        self.check_component(component)?;
        let (kind, initial_state) = self
            .sequences
            .get(&sequence)
            .map(|s| (s.kind(), s.initial_state()))
            .ok_or(NotFound::Sequence(sequence))?;
        if self.bindings.get(&sequence) != Some(&component) {
            return Err(Error::InvalidArgument(
                "the sequence runs on a different component",
            ));
        }
        let unit = &mut self.units[component];
        if unit.state != RunState::Stopped {
            return Err(Error::DeviceBusy {
                component,
                state: unit.state,
            });
        }
        unit.run = Some(Run::new(sequence, kind, stride));
        self.set_state(component, RunState::Starting);
        match kind {
            SequenceKind::Preload => {
                self.set_state(component, RunState::Running);
                self.begin_frame(component);
            }
            SequenceKind::Stream => {
                if self.units[component].pending.is_empty() && initial_state == RunState::Paused {
                    self.units[component].phase = Phase::Paused;
                    self.set_state(component, RunState::Paused);
                } else {
                    self.set_state(component, RunState::Running);
                    self.take_stream_item(component);
                }
            }
        }
        self.dispatch();
        Ok(())
    }

    /// Stop `component` once its current frame ends. Stopping a stopped component does nothing.
    pub fn stop_sequence(&mut self, component: usize) -> Result<()> {
        self.check_component(component)?;
        let unit = &mut self.units[component];
        if matches!(unit.state, RunState::Stopped | RunState::Stopping) {
            return Ok(());
        }
        if let (Phase::Exposing { .. }, Some(run)) = (unit.phase, unit.run.as_mut()) {
            run.stop_requested = true;
            self.set_state(component, RunState::Stopping);
        } else {
            self.finish(component);
        }
        Ok(())
    }

    /// Leave the current (forever repeating) item for the next one after its current pass.
    pub fn next_item(&mut self, component: usize) -> Result<()> {
        self.jump(component, Jump::Next)
    }

    /// Leave the current (forever repeating) item for item `item` after its current pass.
    pub fn goto_item(&mut self, component: usize, item: u32) -> Result<()> {
        self.jump(component, Jump::Goto(item as usize))
    }

    fn jump(&mut self, component: usize, jump: Jump) -> Result<()> {
        self.check_component(component)?;
        let unit = &mut self.units[component];
        let run = match (unit.state, unit.run.as_mut()) {
            (RunState::Running, Some(run)) => run,
            (state, _) => return Err(Error::DeviceBusy { component, state }),
        };
        if run.kind == SequenceKind::Stream {
            return Err(Error::InvalidArgument("streaming sequences cannot change items"));
        }
        let items = self
            .sequences
            .get(&run.sequence)
            .map(Sequence::items)
            .unwrap_or(&[]);
        if !items.get(run.item).map_or(false, SequenceItem::is_infinite) {
            return Err(Error::InvalidArgument("the current item does not repeat forever"));
        }
        if let Jump::Goto(index) = jump {
            if index >= items.len() {
                return Err(Error::InvalidArgument("no sequence item at that index"));
            }
        }
        run.jump = Some(jump);
        Ok(())
    }

    /// Queue a streaming item for `component`, returning its serial number.
    ///
    /// The queue holds [`streaming_capacity`] items (counting the one showing), sized by the
    /// first item queued.
    pub fn add_streaming_item(&mut self, component: usize, item: SequenceItem) -> Result<u64> {
        self.check_component(component)?;
        let id = item.sequence_id();
        let sequence = self.sequences.get(&id).ok_or(NotFound::Sequence(id))?;
        if sequence.kind() != SequenceKind::Stream {
            return Err(Error::InvalidArgument("not a streaming sequence"));
        }
        if self.bindings.get(&id) != Some(&component) {
            return Err(Error::InvalidArgument(
                "the sequence runs on a different component",
            ));
        }
        if item.frames().is_empty() {
            return Err(ProjectError::EmptySequenceItem(id).into());
        }
        let minimum = sequence.device_type().min_frame_time();
        for frame in item.frames() {
            if frame.streaming_image().is_none() {
                return Err(ProjectError::MissingStreamImage(id).into());
            }
            if frame.frame_time() < minimum {
                return Err(ProjectError::FrameTimeTooShort {
                    sequence: id,
                    frame_time: frame.frame_time(),
                    minimum,
                }
                .into());
            }
        }
        let unit = &mut self.units[component];
        let budget = unit.component.image_memory_size();
        let capacity = *unit
            .stream_capacity
            .get_or_insert_with(|| streaming_capacity(budget, streaming_item_bytes(&item)));
        if unit.in_flight() >= capacity {
            return Err(Error::DeviceBusy {
                component,
                state: unit.state,
            });
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        unit.pending.push_back(StreamEntry { serial, item });
        let (running, phase) = (unit.run.is_some(), unit.phase);
        if running {
            match phase {
                Phase::Paused => {
                    self.set_state(component, RunState::Running);
                    self.take_stream_item(component);
                }
                Phase::Underrun => self.take_stream_item(component),
                _ => (),
            }
            self.dispatch();
        }
        Ok(serial)
    }

    /// The streaming queue size of `component`, once an item has been queued.
    pub fn streaming_capacity(&self, component: usize) -> Option<usize> {
        self.units.get(component).and_then(|unit| unit.stream_capacity)
    }

    /// Streaming items queued or showing.
    pub fn streaming_in_flight(&self, component: usize) -> usize {
        self.units.get(component).map_or(0, Unit::in_flight)
    }

    /// Send the next `count` captures of camera `component` to the host, which has room for
    /// `credits` of them right now.
    pub fn acquire_images(&mut self, component: usize, count: u32, credits: u32) -> Result<()> {
        self.check_component(component)?;
        let unit = &mut self.units[component];
        if !unit.component.device_type().is_camera() {
            return Err(Error::InvalidArgument("only cameras acquire images"));
        }
        unit.acquisition = (count > 0).then(|| Acquisition {
            remaining: count,
            credits,
            held: None,
        });
        Ok(())
    }

    /// The host freed `credits` slots for `component`'s captures.
    pub fn return_credits(&mut self, component: usize, credits: u32) -> Result<()> {
        self.check_component(component)?;
        let unit = &mut self.units[component];
        let acquisition = match unit.acquisition.as_mut() {
            Some(acquisition) => acquisition,
            None => return Ok(()),
        };
        acquisition.credits = acquisition.credits.saturating_add(credits);
        if unit.phase != Phase::Backpressure || acquisition.credits == 0 {
            return Ok(());
        }
        if let Some(capture) = acquisition.held.take() {
            acquisition.credits -= 1;
            acquisition.remaining = acquisition.remaining.saturating_sub(1);
            self.events
                .push_back(EngineEvent::Transferred { component, capture });
            self.advance_frame(component);
            self.dispatch();
        }
        Ok(())
    }

    /// An external input of `component` changed level. Returns whether it counted as a trigger.
    pub fn input_edge(&mut self, component: usize, pin: u8, level: bool) -> Result<bool> {
        self.check_component(component)?;
        let now = self.now;
        let unit = &mut self.units[component];
        let accepted = unit.inputs.edge(&unit.component, pin, level, now);
        if accepted {
            self.raise(component, TriggerEvent::ExtTriggerInput(pin));
            self.dispatch();
        }
        Ok(accepted)
    }

    /// Replace a stopped component's settings.
    pub fn replace_component(&mut self, index: usize, component: Component) -> Result<()> {
        self.check_component(index)?;
        let unit = &mut self.units[index];
        if unit.state != RunState::Stopped {
            return Err(Error::DeviceBusy {
                component: index,
                state: unit.state,
            });
        }
        if unit.component.device_type() != component.device_type() {
            return Err(ProjectError::ComponentTypeMismatch {
                index,
                project: component.device_type(),
                device: unit.component.device_type(),
            }
            .into());
        }
        unit.component = component;
        unit.stream_capacity = None;
        Ok(())
    }

    fn check_component(&self, component: usize) -> Result<()> {
        if component < self.units.len() {
            Ok(())
        } else {
            Err(NotFound::Component(component).into())
        }
    }

    fn set_now(&mut self, now: Ticks) {
        if now != self.now {
            self.fired.clear();
            self.now = now;
        }
    }

    fn set_state(&mut self, component: usize, state: RunState) {
        debug!("Component {} is now {:?}", component, state);
        self.units[component].state = state;
        self.events
            .push_back(EngineEvent::RunState { component, state });
    }

    fn push_status(&mut self, component: usize, code: StatusCode) {
        if let Some(run) = self.units[component].run.as_ref() {
            let status = SequenceStatusValues {
                code,
                position: run.position(),
                frame_count: run.frames_started,
                timestamp: self.now,
            };
            self.events
                .push_back(EngineEvent::Status { component, status });
        }
    }

    fn current_item(&self, component: usize) -> Option<&SequenceItem> {
        let run = self.units.get(component)?.run.as_ref()?;
        match run.kind {
            SequenceKind::Stream => run.streaming.as_ref().map(|entry| &entry.item),
            SequenceKind::Preload => self.sequences.get(&run.sequence)?.items().get(run.item),
        }
    }

    fn current_frame(&self, component: usize) -> Option<&Frame> {
        let frame = self.units.get(component)?.run.as_ref()?.frame;
        self.current_item(component)?.frames().get(frame)
    }

    fn raise(&mut self, component: usize, event: TriggerEvent) {
        self.actions
            .extend(self.dispatcher.fire(component, event).iter().copied());
    }

    fn dispatch(&mut self) {
        while let Some(destination) = self.actions.pop_front() {
            if self.fired.insert(destination) {
                self.apply(destination);
            }
        }
    }

    fn apply(&mut self, destination: TriggerDestination) {
        let component = destination.component;
        let unit = match self.units.get(component) {
            Some(unit) => unit,
            None => return,
        };
        match destination.action {
            TriggerAction::ExtTriggerOutput(pin) => {
                let hold = unit
                    .component
                    .output_trigger(pin)
                    .map_or(Ticks::ZERO, |setting| setting.hold_time);
                self.events.push_back(EngineEvent::OutputPulse {
                    component,
                    pin,
                    start: self.now,
                    end: self.now + hold,
                });
            }
            action if unit.phase == Phase::Armed(action) => self.start_frame(component),
            action => {
                debug!("Component {} missed a {:?} trigger", component, action);
                self.events.push_back(EngineEvent::MissedTrigger {
                    component,
                    action,
                    timestamp: self.now,
                });
            }
        }
    }

    fn on_deadline(&mut self, component: usize) {
        match self.units[component].phase {
            Phase::Exposing { start, .. } => self.end_frame(component, start),
            Phase::Padding { .. } => self.item_boundary(component),
            _ => (),
        }
    }

    /// Arm for the current frame, or start it if nothing has to trigger it.
    fn begin_frame(&mut self, component: usize) {
        let first = match self.units[component].run.as_ref() {
            Some(run) => run.frame == 0,
            None => return,
        };
        let frame = match self.current_frame(component) {
            Some(frame) => frame,
            None => return,
        };
        let waits_for = |action| {
            self.dispatcher.is_targeted(component, action)
                && frame.control_input(action) != Some(false)
        };
        let phase = if first && waits_for(TriggerAction::StartSequenceItem) {
            Phase::Armed(TriggerAction::StartSequenceItem)
        } else if waits_for(TriggerAction::StartFrame) {
            Phase::Armed(TriggerAction::StartFrame)
        } else {
            return self.start_frame(component);
        };
        self.units[component].phase = phase;
    }

    fn start_frame(&mut self, component: usize) {
        let (duration, image) = match self.current_frame(component) {
            Some(frame) => {
                let overhead = self.units[component].component.device_type().frame_overhead();
                ((frame.frame_time() + overhead).max(Ticks(1)), frame.image_id())
            }
            None => return,
        };
        let now = self.now;
        let unit = &mut self.units[component];
        let run = match unit.run.as_mut() {
            Some(run) => run,
            None => return,
        };
        unit.phase = Phase::Exposing {
            start: now,
            end: now + duration,
        };
        if run.frame == 0 {
            run.pass_start = now;
        }
        run.frames_started += 1;
        let reported = (run.frames_started - 1) % run.stride == 0;
        self.events.push_back(EngineEvent::FrameStarted {
            component,
            position: run.position(),
            image,
            stream_serial: run.streaming.as_ref().map(|entry| entry.serial),
            timestamp: now,
        });
        if reported {
            self.push_status(component, StatusCode::FrameStarted);
        }
        self.raise(component, TriggerEvent::FrameStarted);
    }

    fn end_frame(&mut self, component: usize, start: Ticks) {
        if self.units[component].component.device_type().is_camera() {
            if let Some(capture) = self.capture(component, start) {
                if let Delivery::Held = self.deliver(component, capture) {
                    return;
                }
            }
        }
        self.advance_frame(component);
    }

    fn capture(&mut self, component: usize, start: Ticks) -> Option<Capture> {
        let sensor_rows = self.units[component].component.rows();
        let (image, rows) = self
            .current_frame(component)
            .map(|frame| (frame.image_id(), frame.captured_rows(sensor_rows)))?;
        let run = self.units[component].run.as_mut()?;
        let capture_number = run.captures;
        run.captures += 1;
        Some(Capture {
            capture_number,
            position: run.position(),
            image,
            rows,
            timestamp: start,
        })
    }

    fn deliver(&mut self, component: usize, capture: Capture) -> Delivery {
        let unit = &mut self.units[component];
        let stopping = unit.run.as_ref().map_or(true, |run| run.stop_requested);
        let delivery = match unit.acquisition.as_mut() {
            Some(acquisition) if acquisition.remaining > 0 => {
                if acquisition.credits > 0 {
                    acquisition.credits -= 1;
                    acquisition.remaining -= 1;
                    Delivery::Sent
                } else if stopping {
                    Delivery::Kept
                } else {
                    acquisition.held = Some(capture);
                    Delivery::Held
                }
            }
            _ => Delivery::Kept,
        };
        self.events.push_back(EngineEvent::Captured {
            component,
            capture,
            transferred: matches!(delivery, Delivery::Sent),
        });
        if let Delivery::Held = delivery {
            debug!(
                "Component {} is holding capture {} for lack of credit",
                component, capture.capture_number
            );
            self.units[component].phase = Phase::Backpressure;
            self.push_status(component, StatusCode::Backpressure);
        }
        delivery
    }

    /// Move past a finished frame.
    fn advance_frame(&mut self, component: usize) {
        let now = self.now;
        let (frames, repeat_time) = match self.current_item(component) {
            Some(item) => (item.frames().len(), item.repeat_time()),
            None => return self.finish(component),
        };
        let run = match self.units[component].run.as_mut() {
            Some(run) => run,
            None => return,
        };
        if run.stop_requested {
            return self.finish(component);
        }
        run.frame += 1;
        if run.frame < frames {
            return self.begin_frame(component);
        }
        match repeat_time.map(|time| run.pass_start + time) {
            Some(until) if until > now => self.units[component].phase = Phase::Padding { until },
            _ => self.item_boundary(component),
        }
    }

    /// A pass through the current item is over.
    fn item_boundary(&mut self, component: usize) {
        let unit = &self.units[component];
        let (kind, stop) = match unit.run.as_ref() {
            Some(run) => (run.kind, run.stop_requested),
            None => return,
        };
        let acquired = unit
            .acquisition
            .as_ref()
            .map_or(false, |acquisition| acquisition.remaining == 0);
        if stop || acquired {
            return self.finish(component);
        }
        match kind {
            SequenceKind::Preload => self.next_preloaded_item(component),
            SequenceKind::Stream => self.next_streaming_pass(component),
        }
    }

    fn next_preloaded_item(&mut self, component: usize) {
        let unit = &mut self.units[component];
        let run = match unit.run.as_mut() {
            Some(run) => run,
            None => return,
        };
        let sequence = match self.sequences.get(&run.sequence) {
            Some(sequence) => sequence,
            None => return self.finish(component),
        };
        let items = sequence.items();
        let (mut next, restart) = match run.jump.take() {
            Some(Jump::Next) => (run.item + 1, true),
            Some(Jump::Goto(index)) => (index, true),
            None => {
                let item = &items[run.item];
                run.item_passes += 1;
                if item.is_infinite() || run.item_passes < item.repeat_count() {
                    (run.item, false)
                } else {
                    (run.item + 1, true)
                }
            }
        };
        if next >= items.len() {
            run.sequence_passes += 1;
            let repeats = sequence.repeat_count();
            if repeats != 0 && run.sequence_passes >= repeats {
                return self.finish(component);
            }
            next = 0;
        }
        if restart {
            run.item_passes = 0;
        }
        run.item = next;
        run.frame = 0;
        self.begin_frame(component);
    }

    fn next_streaming_pass(&mut self, component: usize) {
        let run = match self.units[component].run.as_mut() {
            Some(run) => run,
            None => return,
        };
        run.item_passes += 1;
        let passes = run
            .streaming
            .as_ref()
            .map_or(1, |entry| entry.item.repeat_count().max(1));
        if run.item_passes < passes {
            run.frame = 0;
            return self.begin_frame(component);
        }
        if let Some(done) = run.streaming.take() {
            self.events.push_back(EngineEvent::StreamItemDone {
                component,
                serial: done.serial,
            });
        }
        self.take_stream_item(component);
    }

    /// Show the next queued streaming item, or hold the last frame if there is none.
    fn take_stream_item(&mut self, component: usize) {
        let unit = &mut self.units[component];
        let run = match unit.run.as_mut() {
            Some(run) => run,
            None => return,
        };
        match unit.pending.pop_front() {
            Some(entry) => {
                run.item = run.streamed_items;
                run.streamed_items += 1;
                run.frame = 0;
                run.item_passes = 0;
                run.streaming = Some(entry);
                self.begin_frame(component);
            }
            None => {
                if unit.phase != Phase::Underrun {
                    debug!("Component {} ran out of streaming items", component);
                    unit.phase = Phase::Underrun;
                    self.push_status(component, StatusCode::Underrun);
                }
            }
        }
    }

    /// End the run on `component`, releasing every streaming item it still holds.
    fn finish(&mut self, component: usize) {
        if self.units[component].state != RunState::Stopping {
            self.set_state(component, RunState::Stopping);
        }
        let unit = &mut self.units[component];
        let current = unit.run.take().and_then(|run| run.streaming);
        let serials: Vec<u64> = current
            .into_iter()
            .chain(unit.pending.drain(..))
            .map(|entry| entry.serial)
            .collect();
        unit.acquisition = None;
        unit.phase = Phase::Idle;
        for serial in serials {
            self.events
                .push_back(EngineEvent::StreamItemDone { component, serial });
        }
        self.set_state(component, RunState::Stopped);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::DeviceType;
    use crate::project::{FrameTriggerSetting, TriggerRule};
    use crate::test::{camera_project, controller_and_dmd, dmd_project};

    /// Run until nothing is scheduled or `until`, collecting every event.
    fn run_until(engine: &mut Engine, until: Ticks) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        loop {
            let next = match engine.next_deadline() {
                Some(next) if next <= until => next,
                _ => break,
            };
            engine.advance_to(next);
            events.extend(engine.drain_events());
        }
        engine.advance_to(until);
        events.extend(engine.drain_events());
        events
    }

    fn frame_starts(events: &[EngineEvent], component: usize) -> Vec<(FramePosition, Ticks)> {
        events
            .iter()
            .filter_map(|event| match *event {
                EngineEvent::FrameStarted {
                    component: c,
                    position,
                    timestamp,
                    ..
                } if c == component => Some((position, timestamp)),
                _ => None,
            })
            .collect()
    }

    fn states(events: &[EngineEvent], component: usize) -> Vec<RunState> {
        events
            .iter()
            .filter_map(|event| match *event {
                EngineEvent::RunState {
                    component: c,
                    state,
                } if c == component => Some(state),
                _ => None,
            })
            .collect()
    }

    fn statuses(events: &[EngineEvent], code: StatusCode) -> usize {
        events
            .iter()
            .filter(|event| {
                matches!(event, EngineEvent::Status { status, .. } if status.code == code)
            })
            .count()
    }

    #[test]
    fn preloaded_sequence_runs_once() {
        let frame_time = Ticks::from_ms(1.0);
        let mut engine = Engine::new(&dmd_project(3, frame_time)).unwrap();
        engine.start_sequence(SequenceId(1), 1, 1).unwrap();
        let events = run_until(&mut engine, Ticks::from_ms(10.0));
        let starts = frame_starts(&events, 1);
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[2].0.frame, 2);
        assert_eq!(starts[2].1, frame_time * 2);
        assert_eq!(
            states(&events, 1),
            [
                RunState::Starting,
                RunState::Running,
                RunState::Stopping,
                RunState::Stopped
            ]
        );
        assert_eq!(statuses(&events, StatusCode::FrameStarted), 3);
        assert!(engine.all_stopped());
    }

    #[test]
    fn wrong_component_or_busy() {
        let mut engine = Engine::new(&dmd_project(1, Ticks::from_ms(1.0))).unwrap();
        assert!(matches!(
            engine.start_sequence(SequenceId(1), 0, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.start_sequence(SequenceId(2), 1, 1),
            Err(Error::NotFound(NotFound::Sequence(SequenceId(2))))
        ));
        engine.start_sequence(SequenceId(1), 1, 1).unwrap();
        assert!(matches!(
            engine.start_sequence(SequenceId(1), 1, 1),
            Err(Error::DeviceBusy {
                component: 1,
                state: RunState::Running
            })
        ));
    }

    #[test]
    fn stop_waits_for_the_frame_and_is_idempotent() {
        let frame_time = Ticks::from_ms(1.0);
        let mut engine = Engine::new(&dmd_project(4, frame_time)).unwrap();
        engine.stop_sequence(1).unwrap();
        assert!(engine.drain_events().next().is_none());
        engine.start_sequence(SequenceId(1), 1, 1).unwrap();
        engine.advance_to(Ticks::from_ms(0.5));
        engine.stop_sequence(1).unwrap();
        assert_eq!(engine.run_state(1), RunState::Stopping);
        engine.stop_sequence(1).unwrap();
        let events = run_until(&mut engine, Ticks::from_ms(10.0));
        assert_eq!(frame_starts(&events, 1).len(), 1);
        assert_eq!(states(&events, 1).last(), Some(&RunState::Stopped));
        assert_eq!(engine.now(), Ticks::from_ms(10.0));
    }

    #[test]
    fn status_stride() {
        let mut engine = Engine::new(&dmd_project(25, Ticks::from_ms(1.0))).unwrap();
        engine.start_sequence(SequenceId(1), 1, 10).unwrap();
        let events = run_until(&mut engine, Ticks::from_sec(1.0));
        let reported: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Status { status, .. } => Some(status.frame_index()),
                _ => None,
            })
            .collect();
        assert_eq!(reported, [0, 10, 20]);
    }

    #[test]
    fn item_repeats_and_repeat_time() {
        let mut project = Project::new("repeat");
        project.set_components(controller_and_dmd());
        let id = SequenceId(1);
        project.add_image(Image::for_device(ImageId(1), DeviceType::Dmd4500));
        project.add_sequence(Sequence::new(id, "r", DeviceType::Dmd4500, SequenceKind::Preload, 2));
        let mut item = SequenceItem::new(id, 3);
        item.set_repeat_time(Ticks::from_ms(5.0));
        item.add_frame(Frame::new(id, ImageId(1), Ticks::from_ms(1.0)));
        project.add_sequence_item(item).unwrap();

        let mut engine = Engine::new(&project).unwrap();
        engine.start_sequence(id, 1, 1).unwrap();
        let events = run_until(&mut engine, Ticks::from_sec(1.0));
        let starts = frame_starts(&events, 1);
        // Three passes of the item, twice over.
        assert_eq!(starts.len(), 6);
        assert!(starts.windows(2).all(|w| w[1].1 - w[0].1 == Ticks::from_ms(5.0)));
        assert!(engine.all_stopped());
    }

    fn page_flip_project() -> Project {
        let mut project = Project::new("flip");
        project.set_components(controller_and_dmd());
        let id = SequenceId(1);
        project.add_sequence(Sequence::new(id, "flip", DeviceType::Dmd4500, SequenceKind::Preload, 0));
        for image in 1..=2 {
            project.add_image(Image::for_device(ImageId(image), DeviceType::Dmd4500));
            project.add_sequence_item(SequenceItem::new(id, 0)).unwrap();
            project
                .add_frame(Frame::new(id, ImageId(image), Ticks::from_ms(1.0)))
                .unwrap();
        }
        project
    }

    #[test]
    fn next_and_goto_at_item_boundary() {
        let mut engine = Engine::new(&page_flip_project()).unwrap();
        assert!(engine.next_item(1).is_err());
        engine.start_sequence(SequenceId(1), 1, 1).unwrap();
        engine.advance_to(Ticks::from_ms(3.5));
        assert_eq!(engine.active_image(1), Some(ImageId(1)));
        engine.next_item(1).unwrap();
        engine.advance_to(Ticks::from_ms(6.5));
        assert_eq!(engine.active_image(1), Some(ImageId(2)));
        engine.next_item(1).unwrap();
        engine.advance_to(Ticks::from_ms(8.5));
        // Past the last item wraps around.
        assert_eq!(engine.active_image(1), Some(ImageId(1)));
        engine.goto_item(1, 1).unwrap();
        assert!(engine.goto_item(1, 2).is_err());
        engine.advance_to(Ticks::from_ms(9.5));
        assert_eq!(engine.active_image(1), Some(ImageId(2)));
        engine.stop_sequence(1).unwrap();
        engine.advance_to(Ticks::from_ms(11.0));
        assert_eq!(engine.run_state(1), RunState::Stopped);
    }

    #[test]
    fn finite_items_cannot_jump() {
        let mut engine = Engine::new(&dmd_project(2, Ticks::from_ms(1.0))).unwrap();
        engine.start_sequence(SequenceId(1), 1, 1).unwrap();
        assert!(matches!(engine.next_item(1), Err(Error::InvalidArgument(_))));
    }

    /// A camera at index 2 with sequence 1 of `frames` frames, started by external input 1 on
    /// the controller. Only the first frame waits.
    fn externally_triggered_camera(frames: u16) -> Project {
        let mut project = camera_project(0, 16);
        for image in 1..=frames {
            let mut descriptor = Image::for_device(ImageId(image), DeviceType::Cmv4000Mono);
            descriptor.set_height(16);
            project.add_image(descriptor);
            let mut frame =
                Frame::new(SequenceId(1), ImageId(image), Ticks::from_ms(10.0)).with_roi(0, 16);
            if image > 1 {
                frame.add_control_input_setting(FrameTriggerSetting::new(
                    TriggerAction::StartFrame,
                    false,
                ));
            }
            project.add_frame(frame).unwrap();
        }
        project.add_trigger_rule(
            TriggerRule::new(2, TriggerAction::StartFrame)
                .with_source(0, TriggerEvent::ExtTriggerInput(1)),
        );
        project
    }

    #[test]
    fn external_trigger_gates_the_camera() {
        let mut engine = Engine::new(&externally_triggered_camera(5)).unwrap();
        engine.start_sequence(SequenceId(1), 2, 1).unwrap();
        let events = run_until(&mut engine, Ticks::from_sec(1.0));
        assert!(frame_starts(&events, 2).is_empty());
        assert_eq!(engine.phase(2), Phase::Armed(TriggerAction::StartFrame));
        assert_eq!(engine.run_state(2), RunState::Running);

        assert!(engine.input_edge(0, 1, true).unwrap());
        engine.advance_to(Ticks::from_sec(1.005));
        assert!(!engine.input_edge(0, 1, false).unwrap());
        // Accepted as an edge, but the camera is already exposing.
        assert!(engine.input_edge(0, 1, true).unwrap());
        let events = run_until(&mut engine, Ticks::from_sec(2.0));
        assert_eq!(frame_starts(&events, 2).len(), 5);
        assert!(events.iter().any(|event| matches!(
            event,
            EngineEvent::MissedTrigger {
                component: 2,
                action: TriggerAction::StartFrame,
                ..
            }
        )));
        assert!(engine.all_stopped());
    }

    #[test]
    fn camera_paces_on_frame_time_plus_overhead() {
        let mut engine = Engine::new(&camera_project(3, 16)).unwrap();
        engine.start_sequence(SequenceId(1), 2, 1).unwrap();
        let events = run_until(&mut engine, Ticks::from_sec(1.0));
        let starts = frame_starts(&events, 2);
        assert_eq!(starts[1].1, Ticks::from_ms(10.0) + crate::timing::CMV_FOT);
    }

    #[test]
    fn frame_started_drives_another_component() {
        // The camera starts every DMD frame.
        let mut project = camera_project(4, 16);
        for image in 11..=14 {
            project.add_image(Image::for_device(ImageId(image), DeviceType::Dmd4500));
        }
        let dmd = SequenceId(2);
        project.add_sequence(Sequence::new(dmd, "dmd", DeviceType::Dmd4500, SequenceKind::Preload, 1));
        project.add_sequence_item(SequenceItem::new(dmd, 1)).unwrap();
        for image in 11..=14 {
            project
                .add_frame(Frame::new(dmd, ImageId(image), Ticks::from_ms(5.0)))
                .unwrap();
        }
        project.add_trigger_rule(
            TriggerRule::new(1, TriggerAction::StartFrame)
                .with_source(2, TriggerEvent::FrameStarted),
        );
        let mut engine = Engine::new(&project).unwrap();
        engine.start_sequence(dmd, 1, 1).unwrap();
        assert_eq!(engine.phase(1), Phase::Armed(TriggerAction::StartFrame));
        engine.start_sequence(SequenceId(1), 2, 1).unwrap();
        let events = run_until(&mut engine, Ticks::from_sec(1.0));
        let camera = frame_starts(&events, 2);
        let dmd_starts = frame_starts(&events, 1);
        assert_eq!(camera.len(), 4);
        assert_eq!(dmd_starts.len(), 4);
        for (k, (camera, dmd)) in camera.iter().zip(&dmd_starts).enumerate() {
            assert_eq!(dmd.0.frame as usize, k);
            assert!(dmd.1 >= camera.1);
        }
        assert!(engine.all_stopped());
    }

    #[test]
    fn output_pulses_use_hold_time() {
        let mut project = dmd_project(2, Ticks::from_ms(1.0));
        project.add_trigger_rule(
            TriggerRule::new(0, TriggerAction::ExtTriggerOutput(3))
                .with_source(1, TriggerEvent::FrameStarted),
        );
        let mut engine = Engine::new(&project).unwrap();
        engine.start_sequence(SequenceId(1), 1, 1).unwrap();
        let events = run_until(&mut engine, Ticks::from_sec(1.0));
        let pulses: Vec<_> = events
            .iter()
            .filter_map(|event| match *event {
                EngineEvent::OutputPulse { pin, start, end, .. } => Some((pin, end - start)),
                _ => None,
            })
            .collect();
        assert_eq!(pulses, [(3, Ticks::from_us(10.0)); 2]);
    }

    #[test]
    fn backpressure_holds_one_capture() {
        let mut engine = Engine::new(&camera_project(10, 16)).unwrap();
        engine.acquire_images(2, 10, 4).unwrap();
        engine.start_sequence(SequenceId(1), 2, 1).unwrap();
        let mut events = run_until(&mut engine, Ticks::from_sec(1.0));
        assert_eq!(frame_starts(&events, 2).len(), 5);
        assert_eq!(engine.phase(2), Phase::Backpressure);
        assert_eq!(statuses(&events, StatusCode::Backpressure), 1);
        for _ in 0..6 {
            engine.return_credits(2, 1).unwrap();
            let until = engine.now() + Ticks::from_sec(1.0);
            events.extend(run_until(&mut engine, until));
        }
        let sent: Vec<u64> = events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Captured {
                    capture,
                    transferred: true,
                    ..
                }
                | EngineEvent::Transferred { capture, .. } => Some(capture.capture_number),
                _ => None,
            })
            .collect();
        assert_eq!(sent, (0..10).collect::<Vec<_>>());
        assert!(engine.all_stopped());
    }

    #[test]
    fn acquisition_stops_at_item_boundary() {
        let mut project = camera_project(1, 16);
        let id = SequenceId(1);
        let mut forever = SequenceItem::new(id, 0);
        forever.add_frame(Frame::new(id, ImageId(1), Ticks::from_ms(1.0)));
        project.add_sequence_item(forever).unwrap();
        let mut engine = Engine::new(&project).unwrap();
        engine.acquire_images(2, 7, 100).unwrap();
        engine.start_sequence(id, 2, 1).unwrap();
        let events = run_until(&mut engine, Ticks::from_sec(1.0));
        assert_eq!(frame_starts(&events, 2).len(), 7);
        assert!(engine.all_stopped());
    }

    const STREAM: SequenceId = SequenceId(1);

    fn streaming_project(initial_state: RunState) -> Project {
        let mut project = Project::new("stream");
        let mut components = controller_and_dmd();
        components[1].set_image_memory_size(256 << 20);
        project.set_components(components);
        project.add_sequence(
            Sequence::new(STREAM, "stream", DeviceType::Dmd4500, SequenceKind::Stream, 1)
                .with_initial_state(initial_state),
        );
        project
    }

    fn streaming_item(frame_time: Ticks) -> SequenceItem {
        let pixels = vec![0u8; 1140 * 912];
        let image =
            Image::from_row_major_8bit(ImageId::NONE, 1140, 912, &pixels, DeviceType::Dmd4500)
                .unwrap();
        let mut item = SequenceItem::new(STREAM, 1);
        item.add_frame(Frame::streaming(STREAM, image, frame_time));
        item
    }

    #[derive(Default)]
    struct StreamTally {
        frames: u64,
        reported: u64,
        underruns: u64,
        done: Vec<u64>,
    }

    impl StreamTally {
        fn count(&mut self, engine: &mut Engine) -> usize {
            let before = self.done.len();
            for event in engine.drain_events() {
                match event {
                    EngineEvent::FrameStarted { .. } => self.frames += 1,
                    EngineEvent::Status { status, .. } if status.code == StatusCode::Underrun => {
                        self.underruns += 1
                    }
                    EngineEvent::Status { .. } => self.reported += 1,
                    EngineEvent::StreamItemDone { serial, .. } => self.done.push(serial),
                    _ => (),
                }
            }
            self.done.len() - before
        }
    }

    #[test]
    fn high_rate_streaming_never_underruns() {
        let frame_time = Ticks::from_sec(1.0 / 6600.0);
        let item = streaming_item(frame_time);
        let capacity = streaming_capacity(256 << 20, streaming_item_bytes(&item));
        assert_eq!(capacity, 2064);

        let mut engine = Engine::new(&streaming_project(RunState::Stopped)).unwrap();
        for _ in 0..capacity {
            engine.add_streaming_item(1, item.clone()).unwrap();
        }
        assert!(matches!(
            engine.add_streaming_item(1, item.clone()),
            Err(Error::DeviceBusy { .. })
        ));
        engine.start_sequence(STREAM, 1, 10).unwrap();

        let end = Ticks::from_sec(10.0);
        let mut tally = StreamTally::default();
        while engine.now() < end {
            let next = engine.next_deadline().map_or(end, |deadline| deadline.min(end));
            engine.advance_to(next);
            for _ in 0..tally.count(&mut engine) {
                engine.add_streaming_item(1, item.clone()).unwrap();
            }
        }
        assert!(tally.frames >= 65_000, "only {} frames", tally.frames);
        assert_eq!(tally.underruns, 0);
        assert_eq!(tally.reported, (tally.frames + 9) / 10);
        // Items finish in the order they were queued.
        assert!(tally.done.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn one_underrun_per_gap_in_supply() {
        let frame_time = Ticks::from_sec(1.0 / 6600.0);
        let item = streaming_item(frame_time);
        let mut engine = Engine::new(&streaming_project(RunState::Stopped)).unwrap();
        for _ in 0..8 {
            engine.add_streaming_item(1, item.clone()).unwrap();
        }
        engine.start_sequence(STREAM, 1, 1).unwrap();
        let mut tally = StreamTally::default();
        // Let the queue drain completely.
        while let Some(next) = engine.next_deadline() {
            engine.advance_to(next);
            tally.count(&mut engine);
        }
        assert_eq!(tally.underruns, 1);
        assert_eq!(engine.phase(1), Phase::Underrun);
        assert_eq!(engine.run_state(1), RunState::Running);
        assert_eq!(engine.streaming_in_flight(1), 0);

        // Supply resumes and keeps up.
        let resume = engine.now() + frame_time;
        engine.advance_to(resume);
        for _ in 0..8 {
            engine.add_streaming_item(1, item.clone()).unwrap();
        }
        let end = resume + frame_time * 100;
        while engine.now() < end {
            let next = engine.next_deadline().map_or(end, |deadline| deadline.min(end));
            engine.advance_to(next);
            for _ in 0..tally.count(&mut engine) {
                engine.add_streaming_item(1, item.clone()).unwrap();
            }
        }
        assert_eq!(tally.underruns, 1);
        // The frame starting right at `end` counts too.
        assert_eq!(tally.frames, 8 + 101);
    }

    #[test]
    fn paused_stream_waits_for_first_item() {
        let item = streaming_item(Ticks::from_ms(1.0));
        let mut engine = Engine::new(&streaming_project(RunState::Paused)).unwrap();
        engine.start_sequence(STREAM, 1, 1).unwrap();
        assert_eq!(engine.run_state(1), RunState::Paused);
        assert_eq!(engine.phase(1), Phase::Paused);
        engine.advance_to(Ticks::from_ms(3.0));
        engine.add_streaming_item(1, item).unwrap();
        assert_eq!(engine.run_state(1), RunState::Running);
        let events: Vec<_> = engine.drain_events().collect();
        assert_eq!(frame_starts(&events, 1)[0].1, Ticks::from_ms(3.0));
    }

    #[test]
    fn stop_releases_streaming_items() {
        let item = streaming_item(Ticks::from_ms(1.0));
        let mut engine = Engine::new(&streaming_project(RunState::Stopped)).unwrap();
        for _ in 0..5 {
            engine.add_streaming_item(1, item.clone()).unwrap();
        }
        engine.start_sequence(STREAM, 1, 1).unwrap();
        engine.advance_to(Ticks::from_ms(1.5));
        engine.stop_sequence(1).unwrap();
        let events = run_until(&mut engine, Ticks::from_ms(5.0));
        let done = events
            .iter()
            .filter(|event| matches!(event, EngineEvent::StreamItemDone { .. }))
            .count();
        // One finished before the stop, the rest were discarded.
        assert_eq!(done, 5);
        assert_eq!(engine.streaming_in_flight(1), 0);
        assert_eq!(engine.run_state(1), RunState::Stopped);
    }

    #[test]
    fn streaming_items_need_images() {
        let mut engine = Engine::new(&streaming_project(RunState::Stopped)).unwrap();
        let mut item = SequenceItem::new(STREAM, 1);
        item.add_frame(Frame::new(STREAM, ImageId(3), Ticks::from_ms(1.0)));
        assert!(matches!(
            engine.add_streaming_item(1, item),
            Err(Error::InvalidProject(ProjectError::MissingStreamImage(STREAM)))
        ));
    }

    #[test]
    fn capacity_formula() {
        assert_eq!(streaming_capacity(1000, 100), 9);
        assert_eq!(streaming_capacity(100, 100), 1);
        assert_eq!(streaming_capacity(100, 0), usize::MAX);
    }
}
