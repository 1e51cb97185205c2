//! The event queue proper
//!
//! A queue owns an OS readiness poller and a roster of queued events. Each
//! [`turn`](EventQueue::turn) rebuilds nothing incrementally: interest was
//! registered at add() time, the wait bound is recomputed from the per-event
//! deadlines, and every event that became ready or expired is removed from
//! the queue before its callback runs. Callbacks are free to add or delete
//! events, including the one that just fired.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::error::{ReactorError, Result};
use crate::event::{Event, EventInner, EventKind, Filter};

/// Outcome of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// The queue is empty.
    Drained,
    /// Events remain queued.
    Pending,
}

struct QueueInner {
    poll: Poll,
    events: Events,
    slots: Vec<Option<Event>>,
    free: Vec<usize>,
    /// Live slot tokens in insertion order.
    roster: Vec<usize>,
    generation: u64,
}

/// Single-threaded event queue. Cloning shares the queue; protocol state
/// machines keep a clone so their callbacks can re-arm events.
#[derive(Clone)]
pub struct EventQueue {
    inner: Rc<std::cell::RefCell<QueueInner>>,
}

fn interest_of(filter: Filter) -> Option<Interest> {
    let mut interest: Option<Interest> = None;
    let mut push = |i: Interest| {
        interest = Some(match interest {
            Some(cur) => cur.add(i),
            None => i,
        });
    };
    if filter.contains(Filter::READ) {
        push(Interest::READABLE);
    }
    if filter.contains(Filter::WRITE) {
        push(Interest::WRITABLE);
    }
    if filter.contains(Filter::EXCEPTION) {
        push(Interest::PRIORITY);
    }
    interest
}

impl EventQueue {
    pub fn new() -> Result<EventQueue> {
        Ok(EventQueue {
            inner: Rc::new(std::cell::RefCell::new(QueueInner {
                poll: Poll::new()?,
                events: Events::with_capacity(128),
                slots: Vec::new(),
                free: Vec::new(),
                roster: Vec::new(),
                generation: 0,
            })),
        })
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner.borrow().roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().roster.is_empty()
    }

    /// Queue an event, optionally with a timeout. The timeout requires the
    /// TIMEOUT filter; a timer event requires a timeout.
    pub fn add(&self, event: &Event, timeout: Option<Duration>) -> Result<()> {
        let mut ev = event.0.borrow_mut();
        if ev.queued.is_some() {
            return Err(ReactorError::AlreadyQueued);
        }
        if timeout.is_some() && !ev.filter.contains(Filter::TIMEOUT) {
            return Err(ReactorError::TimeoutUnsupported);
        }
        if timeout.is_none() && matches!(ev.kind, EventKind::Timer) {
            return Err(ReactorError::TimeoutRequired);
        }

        let mut q = self.inner.borrow_mut();
        let token = match q.free.pop() {
            Some(t) => t,
            None => {
                q.slots.push(None);
                q.slots.len() - 1
            }
        };
        if let EventKind::Socket(fd) = ev.kind {
            if let Some(interest) = interest_of(ev.filter) {
                if let Err(e) =
                    q.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(token), interest)
                {
                    q.free.push(token);
                    return Err(ReactorError::Io(e));
                }
            }
        }
        q.generation += 1;
        ev.generation = q.generation;
        ev.deadline = timeout.map(|t| Instant::now() + t);
        ev.queued = Some(token);
        q.slots[token] = Some(event.clone());
        q.roster.push(token);
        trace!(token, filter = ?ev.filter, timeout = ?timeout, "event queued");
        Ok(())
    }

    /// Remove a queued event. Errors if the event is not queued here.
    pub fn delete(&self, event: &Event) -> Result<()> {
        let mut ev = event.0.borrow_mut();
        let token = ev.queued.ok_or(ReactorError::NotQueued)?;
        let mut q = self.inner.borrow_mut();
        match q.slots.get(token) {
            Some(Some(slot)) if Rc::ptr_eq(&slot.0, &event.0) => {}
            _ => return Err(ReactorError::NotQueued),
        }
        Self::detach(&mut q, &mut ev, token);
        Ok(())
    }

    fn detach(q: &mut QueueInner, ev: &mut EventInner, token: usize) {
        if let EventKind::Socket(fd) = ev.kind {
            if interest_of(ev.filter).is_some() {
                // The fd may already be gone; nothing to do about it here.
                let _ = q.poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
        q.slots[token] = None;
        q.free.push(token);
        q.roster.retain(|&t| t != token);
        ev.queued = None;
        ev.deadline = None;
    }

    /// Run one turn: wait at most `budget` (bounded further by the earliest
    /// event deadline), then dispatch every event that is ready or expired.
    /// Returns immediately with [`Turn::Drained`] on an empty queue. Errors
    /// [`ReactorError::WouldDeadlock`] when no queued event carries
    /// descriptor interest and no deadline exists anywhere.
    pub fn turn(&self, budget: Option<Duration>) -> Result<Turn> {
        let (snapshot, ready, end) = {
            let mut q = self.inner.borrow_mut();
            if q.roster.is_empty() {
                return Ok(Turn::Drained);
            }

            let now = Instant::now();
            let mut earliest = budget.map(|b| now + b);
            let mut has_interest = false;
            let mut snapshot = Vec::with_capacity(q.roster.len());
            for &token in &q.roster {
                let Some(event) = q.slots[token].clone() else {
                    continue;
                };
                let ev = event.0.borrow();
                if matches!(ev.kind, EventKind::Socket(_)) && interest_of(ev.filter).is_some() {
                    has_interest = true;
                }
                if let Some(d) = ev.deadline {
                    earliest = Some(earliest.map_or(d, |e| e.min(d)));
                }
                let generation = ev.generation;
                drop(ev);
                snapshot.push((token, event, generation));
            }
            if !has_interest && earliest.is_none() {
                return Err(ReactorError::WouldDeadlock);
            }

            let wait = earliest.map(|e| e.saturating_duration_since(now));
            let QueueInner { poll, events, .. } = &mut *q;
            poll.poll(events, wait)?;

            let mut ready: HashMap<usize, Filter> = HashMap::new();
            for mev in q.events.iter() {
                let mut mask = Filter::NONE;
                if mev.is_readable() {
                    mask |= Filter::READ;
                }
                if mev.is_writable() {
                    mask |= Filter::WRITE;
                }
                if mev.is_priority() {
                    mask |= Filter::EXCEPTION;
                }
                if mev.is_error() || mev.is_read_closed() || mev.is_write_closed() {
                    // Report errors and hangups through every requested
                    // filter so the owner notices on whichever it watches.
                    mask |= Filter::READ | Filter::WRITE | Filter::EXCEPTION;
                }
                *ready.entry(mev.token().0).or_insert(Filter::NONE) |= mask;
            }
            (snapshot, ready, Instant::now())
        };

        for (token, event, generation) in snapshot {
            // Skip events removed, or removed and re-added, by an earlier
            // callback in this same turn.
            let mask = {
                let ev = event.0.borrow();
                if ev.queued != Some(token) || ev.generation != generation {
                    continue;
                }
                let observed = ready.get(&token).copied().unwrap_or(Filter::NONE) & ev.filter.readiness();
                if !observed.is_empty() {
                    observed
                } else if ev.deadline.is_some_and(|d| d <= end) {
                    Filter::TIMEOUT
                } else {
                    continue;
                }
            };

            {
                let mut q = self.inner.borrow_mut();
                let mut ev = event.0.borrow_mut();
                Self::detach(&mut q, &mut ev, token);
            }
            trace!(token, mask = ?mask, "event fired");
            let callback = event.0.borrow_mut().callback.take();
            if let Some(mut callback) = callback {
                callback(mask);
                let mut ev = event.0.borrow_mut();
                if ev.callback.is_none() {
                    ev.callback = Some(callback);
                }
            }
        }

        if self.inner.borrow().roster.is_empty() {
            Ok(Turn::Drained)
        } else {
            Ok(Turn::Pending)
        }
    }

    /// Turn the queue until it drains. `limit` is a wall-clock deadline
    /// across the whole loop; exceeding it errors
    /// [`ReactorError::TimedOut`]. Interrupted waits are retried.
    pub fn run(&self, limit: Option<Duration>) -> Result<()> {
        let deadline = limit.map(|l| Instant::now() + l);
        loop {
            let budget = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(ReactorError::TimedOut);
                    }
                    Some(d - now)
                }
                None => None,
            };
            match self.turn(budget) {
                Ok(Turn::Drained) => return Ok(()),
                Ok(Turn::Pending) => {}
                Err(ReactorError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}
