// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::device::RunState;
use crate::timing::WaitTimeout;

/// Number of [`RunState`] values.
const RUN_STATES: usize = 5;

/// A run-state plus a count of how many times it has been set, packed into one word so readers
/// never take a lock.
///
/// The cell also remembers the generation each state was last entered at, so a state that came
/// and went before a waiter woke up is not missed.
#[derive(Debug)]
pub(crate) struct StateCell {
    word: AtomicU64,
    entered: [AtomicU64; RUN_STATES],
    mark: AtomicU64,
    lock: Mutex<()>,
    changed: Condvar,
}

fn unpack(word: u64) -> (u64, RunState) {
    let state = RunState::try_from((word & 0xFF) as u8).unwrap_or_default();
    (word >> 8, state)
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(u8::from(RunState::Stopped) as u64),
            entered: Default::default(),
            mark: AtomicU64::new(0),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    /// The generation and the state.
    pub(crate) fn snapshot(&self) -> (u64, RunState) {
        unpack(self.word.load(Ordering::Acquire))
    }

    pub(crate) fn state(&self) -> RunState {
        self.snapshot().1
    }

    pub(crate) fn set(&self, state: RunState) {
        let _guard = self.lock.lock();
        let (generation, _) = self.snapshot();
        let word = ((generation + 1) << 8) | u8::from(state) as u64;
        self.entered[u8::from(state) as usize].store(generation + 1, Ordering::Release);
        self.word.store(word, Ordering::Release);
        self.changed.notify_all();
    }

    /// Remember the current generation, usually just before commanding a transition.
    pub(crate) fn mark(&self) {
        self.mark.store(self.snapshot().0, Ordering::Release);
    }

    /// Whether `state` has been entered since the last [`StateCell::mark`].
    pub(crate) fn entered_since_mark(&self, state: RunState) -> bool {
        let entered = self.entered[u8::from(state) as usize].load(Ordering::Acquire);
        entered > self.mark.load(Ordering::Acquire)
    }

    /// Wake every waiter without changing anything, so they can notice a shutdown.
    pub(crate) fn wake(&self) {
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }

    /// Block until `done` holds for the current generation and state, returning whether it did
    /// before `timeout`.
    pub(crate) fn wait_until<F>(&self, timeout: WaitTimeout, mut done: F) -> bool
    where
        F: FnMut(u64, RunState) -> bool,
    {
        let deadline = timeout.deadline();
        let mut guard = self.lock.lock();
        loop {
            let (generation, state) = self.snapshot();
            if done(generation, state) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.changed.wait_until(&mut guard, deadline).timed_out()
                    {
                        let (generation, state) = self.snapshot();
                        return done(generation, state);
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
    }
}
