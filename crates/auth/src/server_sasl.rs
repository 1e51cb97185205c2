//! SASL authentication, server side
//!
//! Mirrors the client: TLS first, then the mechanism offer and the
//! conversation. For `sasl_auth` the session is downgraded once the client
//! is in; for `sasl` it stays up.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use tracing::{debug, warn};

use wire::Channel;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::proto::{
    AuthCode, AuthMethod, IdRole, SaslStep, SASL_BUFFER_LIMIT, SASL_MECHANISM_LIST_LIMIT,
    USERNAME_LIMIT,
};
use crate::sasl::{SaslProvider, ServerStep};
use crate::server::{Authorized, ServerEnv};

pub(crate) fn authorize_sasl<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    config: &AuthConfig,
    env: &ServerEnv,
    method: AuthMethod,
) -> Result<Authorized> {
    let settings = config.tls.as_ref().ok_or(AuthError::NoMethodAvailable)?;
    conn.tls_accept(settings, false)?;
    match run_sasl_server(conn, config, env, method) {
        Ok(authorized) => {
            if method == AuthMethod::SaslAuth {
                conn.tls_downgrade()?;
            }
            Ok(authorized)
        }
        Err(e) => {
            conn.tls_reset();
            Err(e)
        }
    }
}

/// Mechanisms to offer, narrowed to the pinned one when configured.
fn offer_list(config: &AuthConfig, provider: &dyn SaslProvider) -> Vec<String> {
    let provided = provider.mechanisms();
    match &config.sasl_mechanism {
        Some(pin) => provided.into_iter().filter(|m| m == pin).collect(),
        None => provided,
    }
}

fn run_sasl_server<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    config: &AuthConfig,
    env: &ServerEnv,
    method: AuthMethod,
) -> Result<Authorized> {
    // A peer that rejected our certificate aborts its whole negotiation.
    let verdict = conn.recv_i32()?;
    if verdict != AuthCode::NoError.code() {
        warn!(code = verdict, "peer rejected our certificate");
        return Err(AuthError::HostnameMismatch);
    }

    let provider = config
        .sasl_provider
        .as_ref()
        .ok_or(AuthError::NoMethodAvailable)?;
    let offered = offer_list(config, provider.as_ref());
    conn.send_string(&offered.join(" "));
    conn.flush()?;
    if offered.is_empty() {
        warn!("no SASL mechanisms to offer");
        return Err(AuthError::Authentication);
    }

    let mechanism = conn.recv_string_bounded(SASL_MECHANISM_LIST_LIMIT)?;
    if !offered.iter().any(|m| *m == mechanism) {
        warn!(mechanism = %mechanism, "peer announced a mechanism we did not offer");
        conn.send_i32(SaslStep::Error.code());
        conn.flush()?;
        return Err(AuthError::Authentication);
    }
    let mut session = match provider.start_server(&mechanism) {
        Ok(s) => s,
        Err(e) => {
            conn.send_i32(SaslStep::Error.code());
            conn.flush()?;
            return Err(e);
        }
    };
    debug!(mechanism = %mechanism, "starting SASL conversation");

    let has_initial = conn.recv_i32()?;
    let mut incoming = if has_initial != 0 {
        conn.recv_bytes_bounded(SASL_BUFFER_LIMIT)?
    } else {
        // Client-first mechanism without an initial response: elicit one
        // with an empty challenge.
        conn.send_i32(SaslStep::Continue.code());
        conn.send_bytes(&[]);
        conn.flush()?;
        conn.recv_bytes_bounded(SASL_BUFFER_LIMIT)?
    };

    loop {
        match session.step(&incoming) {
            Ok(ServerStep::Done { authid }) => {
                if authid.len() > USERNAME_LIMIT {
                    conn.send_i32(SaslStep::Error.code());
                    conn.flush()?;
                    return Err(AuthError::Authentication);
                }
                let mapped = env.mapper.map(method, &authid, IdRole::User);
                let (role, username) = match mapped {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(authid = %authid, error = %e, "no local account for identity");
                        conn.send_i32(SaslStep::Error.code());
                        conn.flush()?;
                        return Err(AuthError::Authentication);
                    }
                };
                conn.send_i32(SaslStep::Done.code());
                conn.flush()?;
                return Ok(Authorized {
                    method,
                    role,
                    username,
                });
            }
            Ok(ServerStep::Continue(challenge)) => {
                conn.send_i32(SaslStep::Continue.code());
                conn.send_bytes(&challenge);
                conn.flush()?;
                incoming = conn.recv_bytes_bounded(SASL_BUFFER_LIMIT)?;
            }
            Err(e) => {
                warn!(mechanism = %mechanism, error = %e, "SASL step failed");
                conn.send_i32(SaslStep::Error.code());
                conn.flush()?;
                return Err(AuthError::Authentication);
            }
        }
    }
}
