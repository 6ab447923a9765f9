// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use std::collections::{HashMap, HashSet};

use crate::project::{
    Component, TriggerAction, TriggerDestination, TriggerEvent, TriggerRule, TriggerSource,
    MAX_TRIGGER_PINS,
};
use crate::timing::Ticks;

/// Trigger rules, indexed by source.
#[derive(Clone, Debug, Default)]
pub(crate) struct TriggerDispatcher {
    routes: HashMap<TriggerSource, Vec<TriggerDestination>>,
    targeted: HashSet<TriggerDestination>,
}

impl TriggerDispatcher {
    pub(crate) fn new(rules: &[TriggerRule]) -> Self {
        let mut dispatcher = Self::default();
        for rule in rules {
            let destination = rule.destination();
            dispatcher.targeted.insert(destination);
            for source in rule.sources() {
                let destinations = dispatcher.routes.entry(*source).or_default();
                if !destinations.contains(&destination) {
                    destinations.push(destination);
                }
            }
        }
        dispatcher
    }

    /// The destinations fired by `event` on `component`.
    pub(crate) fn fire(&self, component: usize, event: TriggerEvent) -> &[TriggerDestination] {
        self.routes
            .get(&TriggerSource { component, event })
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any rule drives `action` on `component`.
    pub(crate) fn is_targeted(&self, component: usize, action: TriggerAction) -> bool {
        self.targeted
            .contains(&TriggerDestination { component, action })
    }
}

/// Edge filtering for one component's external inputs.
///
/// An edge is accepted when it matches the pin's configured edge and at least the pin's hold
/// time has passed since the last accepted edge.
#[derive(Clone, Debug, Default)]
pub(crate) struct InputPins {
    last_accepted: [Option<Ticks>; MAX_TRIGGER_PINS],
    levels: [bool; MAX_TRIGGER_PINS],
}

impl InputPins {
    /// Record 1-based `pin` changing to `level` at `now`, returning whether it is a trigger.
    pub(crate) fn edge(&mut self, component: &Component, pin: u8, level: bool, now: Ticks) -> bool {
        let setting = match component.input_trigger(pin) {
            Some(setting) => *setting,
            None => return false,
        };
        let index = (pin - 1) as usize;
        if self.levels[index] == level {
            return false;
        }
        self.levels[index] = level;
        if !setting.edge.matches(level) {
            return false;
        }
        match self.last_accepted[index] {
            Some(last) if now < last + setting.hold_time => false,
            _ => {
                self.last_accepted[index] = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::DeviceType;
    use crate::project::{ExternalTriggerSetting, TriggerEdge};

    #[test]
    fn sources_fan_out_and_in() {
        let rules = [
            TriggerRule::new(1, TriggerAction::StartFrame)
                .with_source(0, TriggerEvent::ExtTriggerInput(1))
                .with_source(2, TriggerEvent::FrameStarted),
            TriggerRule::new(0, TriggerAction::ExtTriggerOutput(2))
                .with_source(2, TriggerEvent::FrameStarted),
        ];
        let dispatcher = TriggerDispatcher::new(&rules);
        assert_eq!(dispatcher.fire(2, TriggerEvent::FrameStarted).len(), 2);
        assert_eq!(dispatcher.fire(0, TriggerEvent::ExtTriggerInput(1)).len(), 1);
        assert!(dispatcher.fire(1, TriggerEvent::FrameStarted).is_empty());
        assert!(dispatcher.is_targeted(1, TriggerAction::StartFrame));
        assert!(!dispatcher.is_targeted(1, TriggerAction::StartSequenceItem));
    }

    #[test]
    fn hold_time_debounces() {
        let mut controller = Component::for_device(DeviceType::AjileController);
        let setting = ExternalTriggerSetting::new(TriggerEdge::Rising, Ticks(1_000));
        controller.set_trigger_settings(&[setting], &[]).unwrap();
        let mut pins = InputPins::default();
        assert!(pins.edge(&controller, 1, true, Ticks(0)));
        assert!(!pins.edge(&controller, 1, false, Ticks(100)));
        // Too soon after the last accepted edge.
        assert!(!pins.edge(&controller, 1, true, Ticks(500)));
        assert!(!pins.edge(&controller, 1, false, Ticks(600)));
        assert!(pins.edge(&controller, 1, true, Ticks(1_000)));
        // No such pin.
        assert!(!pins.edge(&controller, 2, true, Ticks(5_000)));
    }
}
