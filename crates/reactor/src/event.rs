//! Socket and timer events
//!
//! An [`Event`] pairs a readiness interest (or a bare timer) with an owned
//! callback closure. The callback can be rebound with [`Event::set_callback`]
//! at any point, including from inside the running callback itself, which is
//! what lets a protocol state machine reuse one event object for every step.

use std::cell::RefCell;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

/// Interest mask for a socket event. TIMEOUT may be combined with the
/// descriptor filters so that one event can either become ready or expire,
/// never both in the same turn.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Filter(u8);

impl Filter {
    pub const NONE: Filter = Filter(0);
    pub const READ: Filter = Filter(1);
    pub const WRITE: Filter = Filter(2);
    pub const EXCEPTION: Filter = Filter(4);
    pub const TIMEOUT: Filter = Filter(8);

    pub fn contains(self, other: Filter) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Filter) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The descriptor-readiness part of the mask, with TIMEOUT stripped.
    pub fn readiness(self) -> Filter {
        self & (Filter::READ | Filter::WRITE | Filter::EXCEPTION)
    }
}

impl BitOr for Filter {
    type Output = Filter;
    fn bitor(self, rhs: Filter) -> Filter {
        Filter(self.0 | rhs.0)
    }
}

impl BitOrAssign for Filter {
    fn bitor_assign(&mut self, rhs: Filter) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Filter {
    type Output = Filter;
    fn bitand(self, rhs: Filter) -> Filter {
        Filter(self.0 & rhs.0)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Filter::READ) {
            names.push("READ");
        }
        if self.contains(Filter::WRITE) {
            names.push("WRITE");
        }
        if self.contains(Filter::EXCEPTION) {
            names.push("EXCEPTION");
        }
        if self.contains(Filter::TIMEOUT) {
            names.push("TIMEOUT");
        }
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

pub(crate) enum EventKind {
    Socket(RawFd),
    Timer,
}

pub(crate) struct EventInner {
    pub(crate) kind: EventKind,
    pub(crate) filter: Filter,
    pub(crate) callback: Option<Box<dyn FnMut(Filter)>>,
    /// Absolute expiry, set while queued with a timeout.
    pub(crate) deadline: Option<Instant>,
    /// Slot token while queued, None otherwise.
    pub(crate) queued: Option<usize>,
    /// Generation stamp of the add() that queued this event. Used by the
    /// dispatch loop to ignore readiness belonging to an earlier queuing.
    pub(crate) generation: u64,
}

/// A handle to a socket or timer event. Cloning the handle shares the
/// underlying event.
#[derive(Clone)]
pub struct Event(pub(crate) Rc<RefCell<EventInner>>);

impl Event {
    /// A descriptor event interested in `filter`. The callback receives the
    /// observed mask: the ready subset of the filter, or TIMEOUT alone when
    /// the event expired.
    pub fn socket<F>(fd: RawFd, filter: Filter, callback: F) -> Event
    where
        F: FnMut(Filter) + 'static,
    {
        Event(Rc::new(RefCell::new(EventInner {
            kind: EventKind::Socket(fd),
            filter,
            callback: Some(Box::new(callback)),
            deadline: None,
            queued: None,
            generation: 0,
        })))
    }

    /// A pure timer event. Must always be queued with a timeout; the callback
    /// receives TIMEOUT.
    pub fn timer<F>(callback: F) -> Event
    where
        F: FnMut(Filter) + 'static,
    {
        Event(Rc::new(RefCell::new(EventInner {
            kind: EventKind::Timer,
            filter: Filter::TIMEOUT,
            callback: Some(Box::new(callback)),
            deadline: None,
            queued: None,
            generation: 0,
        })))
    }

    /// Rebind the callback. Safe to call from inside the callback being
    /// replaced; the new closure is used the next time the event fires.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(Filter) + 'static,
    {
        self.0.borrow_mut().callback = Some(Box::new(callback));
    }

    pub fn filter(&self) -> Filter {
        self.0.borrow().filter
    }

    pub fn is_queued(&self) -> bool {
        self.0.borrow().queued.is_some()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        let mut d = f.debug_struct("Event");
        match inner.kind {
            EventKind::Socket(fd) => d.field("fd", &fd),
            EventKind::Timer => d.field("timer", &true),
        };
        d.field("filter", &inner.filter)
            .field("queued", &inner.queued.is_some())
            .finish()
    }
}
