//! TLS authentication methods, server side

use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use tracing::{debug, warn};

use wire::{Channel, TlsSettings};

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::proto::{
    AuthCode, AuthMethod, IdRole, METADATA_HOST_USERNAME, SPOOL_HOST_USERNAME,
    TLS_CERT_REQUEST_CLIENT_ROLE, TLS_CERT_REQUEST_GIVEUP,
};
use crate::server::{authorize_sharedsecret, Authorized, ServerEnv};

fn tls_settings(config: &AuthConfig) -> Result<&TlsSettings> {
    config.tls.as_ref().ok_or(AuthError::NoMethodAvailable)
}

/// `tls_sharedsecret`: upgrade the channel, then run the shared-secret
/// dialogue inside the session. The session stays up on success.
pub(crate) fn authorize_tls_sharedsecret<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    config: &AuthConfig,
    env: &ServerEnv,
) -> Result<Authorized> {
    conn.tls_accept(tls_settings(config)?, false)?;
    match authorize_sharedsecret(conn, env, true) {
        Ok(mut authorized) => {
            authorized.method = AuthMethod::TlsSharedSecret;
            Ok(authorized)
        }
        Err(e) => {
            conn.tls_reset();
            Err(e)
        }
    }
}

/// Identity the peer's certificate proves for the role it announced. Users
/// are known by their full subject DN, host daemons by their common name.
fn certificate_identity<S: Read + Write + AsRawFd>(
    conn: &Channel<S>,
    role: IdRole,
    env: &ServerEnv,
) -> Result<(IdRole, String)> {
    match role {
        IdRole::User | IdRole::Unknown => {
            let dn = conn.peer_subject_dn()?;
            env.mapper.map(AuthMethod::TlsClientCert, &dn, IdRole::User)
        }
        IdRole::SpoolHost => {
            conn.peer_common_name()?;
            Ok((IdRole::SpoolHost, SPOOL_HOST_USERNAME.to_string()))
        }
        IdRole::MetadataHost => {
            conn.peer_common_name()?;
            Ok((IdRole::MetadataHost, METADATA_HOST_USERNAME.to_string()))
        }
    }
}

/// `tls_client_certificate`: the handshake itself verifies the chain; what
/// remains is the client's role announcement and our verdict.
pub(crate) fn authorize_tls_client_certificate<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    config: &AuthConfig,
    env: &ServerEnv,
) -> Result<Authorized> {
    conn.tls_accept(tls_settings(config)?, true)?;
    match run_client_certificate(conn, env) {
        Ok(authorized) => Ok(authorized),
        Err(e) => {
            conn.tls_reset();
            Err(e)
        }
    }
}

fn run_client_certificate<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    env: &ServerEnv,
) -> Result<Authorized> {
    let request = conn.recv_i32()?;
    match request {
        TLS_CERT_REQUEST_CLIENT_ROLE => {}
        TLS_CERT_REQUEST_GIVEUP => {
            // The client rejected our certificate and will not offer again.
            let code = conn.recv_i32()?;
            warn!(code, "peer gave up on our certificate");
            return Err(AuthError::HostnameMismatch);
        }
        other => {
            return Err(AuthError::Protocol(format!(
                "unknown certificate request {other}"
            )));
        }
    }
    let role_code = conn.recv_i32()?;
    let role = IdRole::from_code(role_code)
        .ok_or_else(|| AuthError::Protocol(format!("unknown role code {role_code}")))?;

    let identity = match certificate_identity(conn, role, env) {
        Ok((role, username)) if role == IdRole::User && !env.switch_user => {
            debug!(user = %username, "serving another user is not permitted here");
            Err(AuthCode::Denied)
        }
        Ok(identity) => Ok(identity),
        Err(e) => {
            warn!(role = role.name(), error = %e, "certificate identity rejected");
            Err(AuthCode::InvalidCredential)
        }
    };
    match identity {
        Ok((role, username)) => {
            conn.send_i32(AuthCode::NoError.code());
            conn.flush()?;
            Ok(Authorized {
                method: AuthMethod::TlsClientCert,
                role,
                username,
            })
        }
        Err(code) => {
            conn.send_i32(code.code());
            conn.flush()?;
            Err(AuthError::Authentication)
        }
    }
}
