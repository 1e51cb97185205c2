//! Typed wire channel for meshfs protocol connections
//!
//! One [`Channel`] wraps a blocking socket with the big-endian typed codec
//! the protocols speak, and can be transformed in place to and from TLS
//! without disturbing the typed surface.

pub mod channel;
pub mod error;
pub mod tls;

pub use channel::Channel;
pub use error::{Result, WireError};
pub use tls::{ClientAuth, CommonNameCheck, IdentityCheck, TlsSettings};
