//! Error types for the wire channel

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("message of {got} bytes exceeds the {limit} byte limit")]
    TooLarge { got: usize, limit: usize },

    #[error("string on the wire is not valid UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid server name: {0}")]
    ServerName(#[from] rustls_pki_types::InvalidDnsNameError),

    #[error("certificate rejected: {0}")]
    Certificate(String),

    #[error("channel does not carry a TLS session")]
    NotTls,
}

pub type Result<T> = std::result::Result<T, WireError>;
