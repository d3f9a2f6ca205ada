//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Single-threaded timer event loop.
//!
//! Timers are one-shot; periodic behavior is obtained by re-arming from the handler. Handlers run on the thread
//! calling `fire_due` and may add or remove timers.
//!

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type Handler = Box<dyn FnOnce() + 'static>;

pub struct EventLoop {
    next_id: Cell<u64>,
    /// Pending timers ordered by due time (ties broken by creation order).
    timers: RefCell<BTreeMap<(Instant, TimerId), Handler>>,
    due_times: RefCell<BTreeMap<TimerId, Instant>>
}

impl EventLoop {
    pub fn new() -> EventLoop {
        EventLoop{
            next_id: Cell::new(1),
            timers: RefCell::new(BTreeMap::new()),
            due_times: RefCell::new(BTreeMap::new())
        }
    }

    /// Runs `handler` once after `delay`.
    pub fn add_timer<F: FnOnce() + 'static>(&self, delay: Duration, handler: F) -> TimerId {
        let id = TimerId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let due = Instant::now() + delay;
        self.timers.borrow_mut().insert((due, id), Box::new(handler));
        self.due_times.borrow_mut().insert(id, due);

        id
    }

    /// Cancels a pending timer; returns false if it has already fired or been removed.
    pub fn remove_timer(&self, id: TimerId) -> bool {
        match self.due_times.borrow_mut().remove(&id) {
            Some(due) => self.timers.borrow_mut().remove(&(due, id)).is_some(),
            None => false
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.due_times.borrow().contains_key(&id)
    }

    pub fn num_pending(&self) -> usize {
        self.due_times.borrow().len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().keys().next().map(|(due, _)| *due)
    }

    /// Runs handlers of all timers which are due; returns the number of handlers run.
    pub fn fire_due(&self) -> usize {
        let mut num_fired = 0;

        loop {
            let now = Instant::now();
            let handler = {
                let mut timers = self.timers.borrow_mut();
                let key = match timers.keys().next() {
                    Some(key) if key.0 <= now => *key,
                    _ => break
                };
                self.due_times.borrow_mut().remove(&key.1);
                timers.remove(&key)
            };

            if let Some(handler) = handler {
                handler();
                num_fired += 1;
            }
        }

        num_fired
    }

    /// Sleeps until the nearest timer is due (but no longer than `max_wait`), then fires due timers.
    pub fn run_once(&self, max_wait: Duration) -> usize {
        let limit = Instant::now() + max_wait;
        let wake_at = match self.next_deadline() {
            Some(due) => due.min(limit),
            None => limit
        };
        let now = Instant::now();
        if wake_at > now {
            std::thread::sleep(wake_at - now);
        }

        self.fire_due()
    }
}
