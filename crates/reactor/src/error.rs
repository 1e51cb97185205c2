//! Error types for the event queue

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("event is already registered in an event queue")]
    AlreadyQueued,

    #[error("event is not registered in this event queue")]
    NotQueued,

    #[error("timeout given for an event without the TIMEOUT filter")]
    TimeoutUnsupported,

    #[error("timer event requires a timeout")]
    TimeoutRequired,

    #[error("event queue would block forever: no descriptor interest and no deadline")]
    WouldDeadlock,

    #[error("event queue did not drain before the deadline")]
    TimedOut,

    #[error("readiness wait failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
