//! MeshFS Authentication
//!
//! Client and server sides of the MeshFS connection authentication dialogue.
//! A client negotiates one method out of the set both sides accept; the
//! server verifies the credential and maps the peer to a local account.
//!
//! # Methods
//!
//! - `sharedsecret` challenge-response over the home-directory key
//! - `tls_sharedsecret` the same dialogue inside a TLS session
//! - `tls_client_certificate` client certificate plus a role announcement
//! - `sasl` / `sasl_auth` a SASL conversation under TLS, with `sasl_auth`
//!   dropping back to the plain socket once authenticated
//!
//! # Example
//!
//! ```rust,no_run
//! use std::net::TcpStream;
//! use auth::{auth_request, AuthConfig, AuthRequestParams, IdRole};
//! use wire::Channel;
//!
//! let sock = TcpStream::connect("fs1.example:600")?;
//! let mut conn = Channel::new(sock);
//! let params = AuthRequestParams {
//!     service_tag: "meshfs-md".to_string(),
//!     hostname: "fs1.example".to_string(),
//!     username: "alice".to_string(),
//!     role: IdRole::User,
//! };
//! let config = AuthConfig::new();
//! let method = auth_request(&mut conn, &params, &config)?;
//! println!("authenticated via {method}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The multiplexed flavor drives many negotiations on one
//! [`reactor::EventQueue`]; see [`auth_request_multiplexed`].

pub mod client;
mod client_async;
mod client_sasl;
mod client_tls;
pub mod config;
pub mod error;
pub mod keyfile;
pub mod proto;
pub mod sasl;
pub mod server;
mod server_sasl;
mod server_tls;
mod sharedsecret_async;

pub use client::{auth_request, AuthRequestParams};
pub use client_async::{auth_request_multiplexed, auth_result_multiplexed, AuthState};
pub use config::{AuthConfig, AuthSettings};
pub use error::{AuthError, Result};
pub use keyfile::{KeyAccess, SharedKey, DEFAULT_KEY_PERIOD, KEY_FILE_BASENAME};
pub use proto::{AuthCode, AuthMethod, IdRole, MethodSet};
pub use sasl::{
    PasswordCheck, PlainProvider, SaslClientSession, SaslCredentials, SaslProvider,
    SaslServerSession, ServerStep,
};
pub use server::{
    authorize, server_available, AuthIdMapper, Authorized, FileKeyStore, ServerEnv,
    SharedKeyLookup,
};
