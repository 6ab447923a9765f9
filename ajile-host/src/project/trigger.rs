// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::convert::TryFrom;

use arrayvec::ArrayVec;

use crate::error::{Error, Result};

/// The most sources a single rule can OR together.
pub const MAX_RULE_SOURCES: usize = 8;

const EXT_PIN_BASE: u8 = 0x10;

/// Something that happens on a component and can fire a rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum TriggerEvent {
    FrameStarted,
    /// An edge on a 1-based external input pin.
    ExtTriggerInput(u8),
}

/// Something a rule makes a component do.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum TriggerAction {
    StartFrame,
    StartSequenceItem,
    /// Pulse a 1-based external output pin.
    ExtTriggerOutput(u8),
}

impl From<TriggerEvent> for u8 {
    fn from(event: TriggerEvent) -> u8 {
        match event {
            TriggerEvent::FrameStarted => 0x01,
            TriggerEvent::ExtTriggerInput(pin) => EXT_PIN_BASE + pin,
        }
    }
}

impl TryFrom<u8> for TriggerEvent {
    type Error = u8;

    fn try_from(code: u8) -> core::result::Result<Self, u8> {
        match code {
            0x01 => Ok(TriggerEvent::FrameStarted),
            code if code > EXT_PIN_BASE => Ok(TriggerEvent::ExtTriggerInput(code - EXT_PIN_BASE)),
            code => Err(code),
        }
    }
}

impl From<TriggerAction> for u8 {
    fn from(action: TriggerAction) -> u8 {
        match action {
            TriggerAction::StartFrame => 0x01,
            TriggerAction::StartSequenceItem => 0x02,
            TriggerAction::ExtTriggerOutput(pin) => EXT_PIN_BASE + pin,
        }
    }
}

impl TryFrom<u8> for TriggerAction {
    type Error = u8;

    fn try_from(code: u8) -> core::result::Result<Self, u8> {
        match code {
            0x01 => Ok(TriggerAction::StartFrame),
            0x02 => Ok(TriggerAction::StartSequenceItem),
            code if code > EXT_PIN_BASE => Ok(TriggerAction::ExtTriggerOutput(code - EXT_PIN_BASE)),
            code => Err(code),
        }
    }
}

/// A `(component, event)` pair feeding a rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TriggerSource {
    pub component: usize,
    pub event: TriggerEvent,
}

/// The `(component, action)` pair a rule drives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TriggerDestination {
    pub component: usize,
    pub action: TriggerAction,
}

/// Routes events on one or more components to an action on another.
///
/// Any one of the sources firing fires the destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TriggerRule {
    sources: ArrayVec<TriggerSource, MAX_RULE_SOURCES>,
    destination: TriggerDestination,
}

impl TriggerRule {
    /// A rule driving `action` on `component`, with no sources yet.
    pub fn new(component: usize, action: TriggerAction) -> Self {
        Self {
            sources: ArrayVec::new(),
            destination: TriggerDestination { component, action },
        }
    }

    /// Add a source, builder style.
    ///
    /// # Panics
    /// If the rule already has [`MAX_RULE_SOURCES`] sources.
    pub fn with_source(mut self, component: usize, event: TriggerEvent) -> Self {
        self.sources.push(TriggerSource { component, event });
        self
    }

    pub fn add_source(&mut self, component: usize, event: TriggerEvent) -> Result<()> {
        self.sources
            .try_push(TriggerSource { component, event })
            .map_err(|_| Error::InvalidArgument("too many sources for one trigger rule"))
    }

    pub fn sources(&self) -> &[TriggerSource] {
        &self.sources
    }

    pub fn destination(&self) -> TriggerDestination {
        self.destination
    }
}

/// Whether a frame waits for a trigger rule's action before starting.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FrameTriggerSetting {
    pub action: TriggerAction,
    pub enabled: bool,
}

impl FrameTriggerSetting {
    pub fn new(action: TriggerAction, enabled: bool) -> Self {
        Self { action, enabled }
    }
}
