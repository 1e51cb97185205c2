//! Client-side negotiation, synchronous engine
//!
//! The client reads the peer's advertised methods, then offers its usable
//! candidates in preference order. A method failure from the retryable set
//! moves on to the next candidate; anything else aborts. Running out of
//! candidates sends the giveup sentinel and classifies the overall failure.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use tracing::{debug, info, warn};

use wire::Channel;

use crate::client_sasl::request_sasl;
use crate::client_tls::{request_tls_client_certificate, request_tls_sharedsecret};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::keyfile::{self, KeyAccess};
use crate::proto::{
    AuthCode, AuthMethod, IdRole, MethodSet, CHALLENGE_LEN, KEY_TYPE_GIVEUP, KEY_TYPE_HMAC_SHA256,
    METHODS_BUFFER_LIMIT,
};

/// Who the client is and who it is talking to.
#[derive(Clone, Debug)]
pub struct AuthRequestParams {
    /// Service the peer is expected to run, e.g. `meshfs-md`.
    pub service_tag: String,
    pub hostname: String,
    /// Global username presented to the peer.
    pub username: String,
    /// Role this side authenticates as.
    pub role: IdRole,
}

pub(crate) fn parse_server_methods(blob: &[u8]) -> MethodSet {
    let mut set = MethodSet::EMPTY;
    for &code in blob {
        // Codes out of the known range are ignored, not rejected; newer
        // peers may advertise methods this build does not know.
        match AuthMethod::from_code(code as i32) {
            Some(AuthMethod::None) | None => {}
            Some(m) => set.insert(m),
        }
    }
    set
}

pub(crate) fn giveup_error(
    server_methods: MethodSet,
    candidates: MethodSet,
    error_save: Option<AuthError>,
) -> AuthError {
    if server_methods.is_empty() {
        AuthError::PermissionDenied
    } else if candidates.is_empty() {
        AuthError::ProtocolNotSupported
    } else {
        error_save.unwrap_or(AuthError::Authentication)
    }
}

/// Candidate methods this client may offer a peer, or the error to report
/// before any byte hits the wire.
pub(crate) fn usable_methods(params: &AuthRequestParams, config: &AuthConfig) -> Result<MethodSet> {
    let enabled = config.enabled_for(&params.hostname);
    if enabled.is_empty() {
        return Err(AuthError::MethodDisabled);
    }
    let usable = enabled.intersect(config.available_methods());
    if usable.is_empty() {
        return Err(AuthError::NoMethodAvailable);
    }
    Ok(usable)
}

/// Negotiate and run one authentication method against the peer. Returns
/// the method that succeeded.
pub fn auth_request<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
) -> Result<AuthMethod> {
    let usable = usable_methods(params, config)?;

    let blob = conn.recv_bytes_bounded(METHODS_BUFFER_LIMIT)?;
    let server_methods = parse_server_methods(&blob);
    debug!(host = %params.hostname, ?server_methods, "peer advertised methods");

    let candidates = usable.intersect(server_methods);
    let mut error_save = None;
    for method in AuthMethod::PREFERENCE
        .iter()
        .copied()
        .filter(|m| candidates.contains(*m))
    {
        conn.send_i32(method.code());
        conn.flush()?;
        let accept = conn.recv_i32()?;
        if accept != AuthCode::NoError.code() {
            return Err(AuthError::Protocol(format!(
                "peer refused offered method {} with code {accept}",
                method.name()
            )));
        }
        debug!(method = method.name(), host = %params.hostname, "trying method");
        match request_method(method, conn, params, config) {
            Ok(()) => {
                info!(method = method.name(), host = %params.hostname, "authenticated");
                return Ok(method);
            }
            Err(e) if e.negotiation_retryable() => {
                warn!(method = method.name(), error = %e, "method failed, trying next");
                error_save = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    // Out of candidates: tell the peer and drain its acknowledgement.
    conn.send_i32(AuthMethod::None.code());
    conn.flush()?;
    let accept = conn.recv_i32()?;
    if accept != AuthCode::NoError.code() {
        return Err(AuthError::Protocol(format!(
            "peer answered giveup with code {accept}"
        )));
    }
    Err(giveup_error(server_methods, candidates, error_save))
}

pub(crate) fn request_method<S: Read + Write + AsRawFd>(
    method: AuthMethod,
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
) -> Result<()> {
    match method {
        AuthMethod::SharedSecret => request_sharedsecret(conn, params, config, None),
        AuthMethod::TlsSharedSecret => request_tls_sharedsecret(conn, params, config),
        AuthMethod::TlsClientCert => request_tls_client_certificate(conn, params, config),
        AuthMethod::Sasl => request_sasl(conn, params, config, false),
        AuthMethod::SaslAuth => request_sasl(conn, params, config, true),
        AuthMethod::None => Err(AuthError::Protocol(
            "the giveup sentinel is not a runnable method".into(),
        )),
    }
}

/// The shared-secret dialogue. `server_cert_ok` is `Some` when running under
/// TLS, where the server's certificate verdict leads the conversation.
pub(crate) fn request_sharedsecret<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
    server_cert_ok: Option<bool>,
) -> Result<()> {
    if let Some(ok) = server_cert_ok {
        conn.send_i32(if ok {
            AuthCode::NoError.code()
        } else {
            AuthCode::InvalidCredential.code()
        });
        conn.flush()?;
        if !ok {
            warn!(host = %params.hostname, "rejecting server certificate");
            return Err(AuthError::HostnameMismatch);
        }
    }

    conn.send_string(&params.username);
    conn.flush()?;

    let mut key_error = None;
    let mut last_code = None;
    match config.key_file_path() {
        Err(e) => key_error = Some(e),
        Ok(path) => {
            let mut try_count = 0u32;
            loop {
                try_count += 1;
                // After a failed round the stored key is suspect; replace it.
                let access = if try_count == 1 {
                    KeyAccess::Create
                } else {
                    KeyAccess::CreateForce
                };
                let key = match keyfile::shared_key_get(&path, access, config.key_period) {
                    Ok(k) => k,
                    Err(e) => {
                        key_error = Some(e);
                        break;
                    }
                };
                conn.send_i32(KEY_TYPE_HMAC_SHA256);
                conn.flush()?;
                let code = conn.recv_i32()?;
                if code != AuthCode::NoError.code() {
                    last_code = AuthCode::from_code(code).or(Some(AuthCode::Denied));
                    break;
                }
                let challenge = conn.recv_bytes_exact(CHALLENGE_LEN)?;
                let response = match keyfile::challenge_response(&key, &challenge) {
                    Ok(r) => r,
                    Err(e) => {
                        key_error = Some(e);
                        break;
                    }
                };
                conn.send_u32(key.expire as u32);
                conn.send_bytes(&response);
                conn.flush()?;
                let verdict = conn.recv_i32()?;
                match AuthCode::from_code(verdict) {
                    Some(AuthCode::NoError) => {
                        debug!(user = %params.username, "shared secret accepted");
                        return Ok(());
                    }
                    Some(AuthCode::Expired) if try_count < config.retry_max => {
                        debug!("peer reports the key expired, retrying with a fresh one");
                    }
                    other => {
                        last_code = other.or(Some(AuthCode::Denied));
                        break;
                    }
                }
            }
        }
    }

    conn.send_i32(KEY_TYPE_GIVEUP);
    conn.flush()?;
    let _ack = conn.recv_i32()?;

    if let Some(e) = &key_error {
        warn!(error = %e, "shared key unavailable");
    }
    Err(sharedsecret_final_error(key_error, last_code))
}

/// Overall shared-secret failure. A locally broken key outranks whatever
/// the peer reported.
pub(crate) fn sharedsecret_final_error(
    key_error: Option<AuthError>,
    last_code: Option<AuthCode>,
) -> AuthError {
    if let Some(e) = key_error {
        return e;
    }
    match last_code {
        Some(AuthCode::NotSupported) => AuthError::ProtocolNotSupported,
        Some(AuthCode::Expired) => AuthError::Expired,
        Some(AuthCode::ResourceUnavailable) | Some(AuthCode::TemporaryFailure) => {
            AuthError::RetryConnection
        }
        _ => AuthError::Authentication,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_advertised_codes_are_ignored() {
        let set = parse_server_methods(&[1, 200, 4, 0, 7]);
        assert!(set.contains(AuthMethod::SharedSecret));
        assert!(set.contains(AuthMethod::Sasl));
        assert!(!set.contains(AuthMethod::TlsSharedSecret));
    }

    #[test]
    fn giveup_classification_order() {
        let mut advertised = MethodSet::EMPTY;
        advertised.insert(AuthMethod::Sasl);
        let mut candidates = MethodSet::EMPTY;
        candidates.insert(AuthMethod::Sasl);

        assert!(matches!(
            giveup_error(MethodSet::EMPTY, MethodSet::EMPTY, None),
            AuthError::PermissionDenied
        ));
        assert!(matches!(
            giveup_error(advertised, MethodSet::EMPTY, None),
            AuthError::ProtocolNotSupported
        ));
        assert!(matches!(
            giveup_error(advertised, candidates, Some(AuthError::Expired)),
            AuthError::Expired
        ));
        assert!(matches!(
            giveup_error(advertised, candidates, None),
            AuthError::Authentication
        ));
    }
}
