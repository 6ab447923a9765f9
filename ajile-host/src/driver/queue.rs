// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::collections::VecDeque;

use crossbeam::queue::ArrayQueue;
use log::{error, warn};
use parking_lot::{Condvar, Mutex};

use crate::device::SequenceStatusValues;
use crate::error::{Error, Result, TransportError};
use crate::timing::WaitTimeout;
use crate::wire::AcquiredImage;

/// One component's status reports: a strict FIFO, plus the most recent report on the side.
///
/// Once a report has been lost (dropped on the wire or by a full queue) every read fails with
/// [`Error::StatusLost`] until the queue is reset.
#[derive(Debug)]
pub(crate) struct StatusQueue {
    component: usize,
    queue: ArrayQueue<SequenceStatusValues>,
    latest: Mutex<Option<SequenceStatusValues>>,
    lost: AtomicBool,
}

impl StatusQueue {
    pub(crate) fn new(component: usize, capacity: usize) -> Self {
        Self {
            component,
            queue: ArrayQueue::new(capacity.max(1)),
            latest: Mutex::new(None),
            lost: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, status: SequenceStatusValues) {
        *self.latest.lock() = Some(status);
        if self.queue.push(status).is_err() {
            error!("Status queue for component {} overflowed", self.component);
            self.mark_lost();
        }
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(Error::StatusLost {
                component: self.component,
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn next(&self) -> Result<Option<SequenceStatusValues>> {
        self.check()?;
        Ok(self.queue.pop())
    }

    /// Throw away everything queued and return the most recent report.
    pub(crate) fn latest(&self) -> Option<SequenceStatusValues> {
        while self.queue.pop().is_some() {}
        *self.latest.lock()
    }

    pub(crate) fn is_empty(&self) -> Result<bool> {
        self.check()?;
        Ok(self.queue.is_empty())
    }

    pub(crate) fn reset(&self) {
        while self.queue.pop().is_some() {}
        *self.latest.lock() = None;
        self.lost.store(false, Ordering::Release);
    }
}

/// Captured images waiting for the application.
///
/// The device only sends as many images as it has credits for, so the queue stays within its
/// capacity. Going over is logged but nothing is ever dropped.
#[derive(Debug)]
pub(crate) struct AcquiredQueue {
    component: usize,
    capacity: usize,
    images: Mutex<VecDeque<AcquiredImage>>,
    arrived: Condvar,
    closed: AtomicBool,
    // Slots freed on the host that the device has not been told about yet.
    owed_credits: AtomicU32,
}

impl AcquiredQueue {
    pub(crate) fn new(component: usize, capacity: usize) -> Self {
        Self {
            component,
            capacity: capacity.max(1),
            images: Mutex::new(VecDeque::with_capacity(capacity)),
            arrived: Condvar::new(),
            closed: AtomicBool::new(false),
            owed_credits: AtomicU32::new(0),
        }
    }

    pub(crate) fn push(&self, image: AcquiredImage) {
        let mut images = self.images.lock();
        if images.len() >= self.capacity {
            warn!(
                "Component {} sent capture {} with its image queue already full",
                self.component, image.capture_number
            );
        }
        images.push_back(image);
        self.arrived.notify_all();
    }

    pub(crate) fn peek(&self) -> Option<AcquiredImage> {
        self.images.lock().front().cloned()
    }

    pub(crate) fn pop(&self) -> Option<AcquiredImage> {
        self.images.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.images.lock().is_empty()
    }

    /// Note `credits` the device is still owed.
    pub(crate) fn owe_credits(&self, credits: u32) {
        self.owed_credits.fetch_add(credits, Ordering::AcqRel);
    }

    /// Take every owed credit, leaving none.
    pub(crate) fn take_owed_credits(&self) -> u32 {
        self.owed_credits.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn free_slots(&self) -> u32 {
        let used = self.images.lock().len();
        self.capacity.saturating_sub(used) as u32
    }

    /// Block until an image is queued. Returns whether one is.
    pub(crate) fn wait(&self, timeout: WaitTimeout) -> bool {
        let deadline = timeout.deadline();
        let mut images = self.images.lock();
        while images.is_empty() && !self.closed.load(Ordering::Acquire) {
            match deadline {
                Some(deadline) => {
                    if self.arrived.wait_until(&mut images, deadline).timed_out() {
                        break;
                    }
                }
                None => self.arrived.wait(&mut images),
            }
        }
        !images.is_empty()
    }

    pub(crate) fn close(&self) {
        let _images = self.images.lock();
        self.closed.store(true, Ordering::Release);
        self.arrived.notify_all();
    }
}

#[derive(Debug, Default)]
struct StreamSlots {
    capacity: Option<usize>,
    in_flight: usize,
    closed: bool,
}

/// Host-side accounting of a component's streaming queue.
#[derive(Debug, Default)]
pub(crate) struct StreamGate {
    slots: Mutex<StreamSlots>,
    freed: Condvar,
}

impl StreamGate {
    /// Take a slot, blocking while all of them are in use. The capacity is fixed by the first
    /// call after a reset.
    pub(crate) fn acquire<F>(&self, capacity: F) -> Result<()>
    where
        F: FnOnce() -> usize,
    {
        let mut slots = self.slots.lock();
        let capacity = *slots.capacity.get_or_insert_with(capacity);
        while slots.in_flight >= capacity && !slots.closed {
            self.freed.wait(&mut slots);
        }
        if slots.closed {
            return Err(TransportError::Closed.into());
        }
        slots.in_flight += 1;
        Ok(())
    }

    pub(crate) fn release(&self) {
        let mut slots = self.slots.lock();
        slots.in_flight = slots.in_flight.saturating_sub(1);
        self.freed.notify_all();
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.lock().in_flight
    }

    /// Forget the capacity and every slot, as after a new project or memory budget.
    pub(crate) fn reset(&self) {
        let mut slots = self.slots.lock();
        slots.capacity = None;
        slots.in_flight = 0;
        self.freed.notify_all();
    }

    pub(crate) fn close(&self) {
        self.slots.lock().closed = true;
        self.freed.notify_all();
    }
}
