//! Single-threaded event queue
//!
//! A small reactor for multiplexed protocol state machines: callers queue
//! socket or timer events with owned callbacks, then drive the queue with
//! [`EventQueue::turn`] or [`EventQueue::run`]. Events are one-shot per
//! dispatch; a callback re-arms its event (often after rebinding the
//! callback) to continue a conversation. An event queued with both a
//! readiness filter and a timeout either becomes ready or expires, never
//! both.

pub mod error;
pub mod event;
pub mod queue;

pub use error::{ReactorError, Result};
pub use event::{Event, Filter};
pub use queue::{EventQueue, Turn};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn empty_queue_drains_immediately() {
        let q = EventQueue::new().unwrap();
        assert!(matches!(q.turn(None).unwrap(), Turn::Drained));
        assert!(q.is_empty());
    }

    #[test]
    fn timer_fires_once() {
        let q = EventQueue::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        let ev = Event::timer(move |mask| {
            assert_eq!(mask, Filter::TIMEOUT);
            counter.set(counter.get() + 1);
        });
        q.add(&ev, Some(Duration::ZERO)).unwrap();
        q.run(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!ev.is_queued());
    }

    #[test]
    fn timer_requires_timeout() {
        let q = EventQueue::new().unwrap();
        let ev = Event::timer(|_| {});
        assert!(matches!(q.add(&ev, None), Err(ReactorError::TimeoutRequired)));
    }

    #[test]
    fn timeout_requires_filter() {
        let q = EventQueue::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let ev = Event::socket(a.as_raw_fd(), Filter::READ, |_| {});
        assert!(matches!(
            q.add(&ev, Some(Duration::from_millis(10))),
            Err(ReactorError::TimeoutUnsupported)
        ));
    }

    #[test]
    fn double_add_and_stray_delete_error() {
        let q = EventQueue::new().unwrap();
        let ev = Event::timer(|_| {});
        q.add(&ev, Some(Duration::from_secs(10))).unwrap();
        assert!(matches!(
            q.add(&ev, Some(Duration::from_secs(10))),
            Err(ReactorError::AlreadyQueued)
        ));
        q.delete(&ev).unwrap();
        assert!(matches!(q.delete(&ev), Err(ReactorError::NotQueued)));
    }

    #[test]
    fn deadlock_detected() {
        let q = EventQueue::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        // TIMEOUT-only filter carries no descriptor interest; queued with no
        // timeout there is no deadline either.
        let ev = Event::socket(a.as_raw_fd(), Filter::TIMEOUT, |_| {});
        q.add(&ev, None).unwrap();
        assert!(matches!(q.turn(None), Err(ReactorError::WouldDeadlock)));
    }

    #[test]
    fn readable_socket_dispatches_read() {
        let q = EventQueue::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        let got = Rc::new(Cell::new(Filter::NONE));
        let seen = got.clone();
        let mut a_reader = a.try_clone().unwrap();
        let ev = Event::socket(a.as_raw_fd(), Filter::READ, move |mask| {
            seen.set(mask);
            let mut buf = [0u8; 1];
            a_reader.read_exact(&mut buf).unwrap();
        });
        q.add(&ev, None).unwrap();
        q.run(Some(Duration::from_secs(1))).unwrap();
        assert!(got.get().contains(Filter::READ));
    }

    #[test]
    fn silent_socket_times_out() {
        let q = EventQueue::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let got = Rc::new(Cell::new(Filter::NONE));
        let seen = got.clone();
        let ev = Event::socket(a.as_raw_fd(), Filter::READ | Filter::TIMEOUT, move |mask| {
            seen.set(mask);
        });
        q.add(&ev, Some(Duration::from_millis(10))).unwrap();
        q.run(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(got.get(), Filter::TIMEOUT);
    }

    #[test]
    fn readiness_beats_expiry() {
        let q = EventQueue::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let got = Rc::new(Cell::new(Filter::NONE));
        let seen = got.clone();
        // A fresh socketpair is writable at once; even with a zero timeout
        // the observed readiness must win over TIMEOUT.
        let ev = Event::socket(a.as_raw_fd(), Filter::WRITE | Filter::TIMEOUT, move |mask| {
            seen.set(mask);
        });
        q.add(&ev, Some(Duration::ZERO)).unwrap();
        q.run(Some(Duration::from_secs(1))).unwrap();
        assert!(got.get().contains(Filter::WRITE));
        assert!(!got.get().contains(Filter::TIMEOUT));
    }

    #[test]
    fn callback_may_rearm_itself() {
        let q = EventQueue::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let ev = Event::timer(|_| {});
        let counter = fired.clone();
        let q2 = q.clone();
        let ev2 = ev.clone();
        ev.set_callback(move |_| {
            counter.set(counter.get() + 1);
            if counter.get() < 3 {
                q2.add(&ev2, Some(Duration::ZERO)).unwrap();
            }
        });
        q.add(&ev, Some(Duration::ZERO)).unwrap();
        q.run(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn run_enforces_wall_clock_limit() {
        let q = EventQueue::new().unwrap();
        let ev = Event::timer(|_| {});
        let q2 = q.clone();
        let ev2 = ev.clone();
        ev.set_callback(move |_| {
            q2.add(&ev2, Some(Duration::from_millis(1))).unwrap();
        });
        q.add(&ev, Some(Duration::from_millis(1))).unwrap();
        assert!(matches!(
            q.run(Some(Duration::from_millis(30))),
            Err(ReactorError::TimedOut)
        ));
    }
}
