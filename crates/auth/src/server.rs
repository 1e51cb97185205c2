//! Server-side authorization
//!
//! The server advertises its acceptable methods, then answers the client's
//! offers until one method authenticates the peer or the client gives up.
//! Identity mapping and shared-key lookup are injected so daemons with
//! different user databases share the wire logic.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, info, warn};

use wire::Channel;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::keyfile::{self, SharedKey, KEY_FILE_BASENAME};
use crate::proto::{
    AuthCode, AuthMethod, IdRole, MethodSet, KEY_TYPE_GIVEUP, KEY_TYPE_HMAC_SHA256,
    METADATA_HOST_USERNAME, RESPONSE_LEN, SPOOL_HOST_USERNAME, USERNAME_LIMIT,
};
use crate::server_sasl::authorize_sasl;
use crate::server_tls::{authorize_tls_client_certificate, authorize_tls_sharedsecret};

/// Maps an authenticated identifier (a global username, a certificate
/// subject, or a SASL authorization identity) to a local account.
pub trait AuthIdMapper {
    fn map(&self, method: AuthMethod, auth_id: &str, role_hint: IdRole)
        -> Result<(IdRole, String)>;
}

/// Looks up the shared key the server holds for a user.
pub trait SharedKeyLookup {
    fn lookup(&self, username: &str) -> Result<SharedKey>;
}

/// Key lookup over per-user home directories, `<base>/<user>/.meshfs_shared_key`.
pub struct FileKeyStore {
    base: PathBuf,
}

impl FileKeyStore {
    pub fn new(base: impl Into<PathBuf>) -> FileKeyStore {
        FileKeyStore { base: base.into() }
    }
}

impl SharedKeyLookup for FileKeyStore {
    fn lookup(&self, username: &str) -> Result<SharedKey> {
        if username.contains('/') {
            return Err(AuthError::Credential(format!(
                "bad username \"{username}\""
            )));
        }
        keyfile::read(&self.base.join(username).join(KEY_FILE_BASENAME))
    }
}

/// Everything the server side needs besides the connection and config.
pub struct ServerEnv {
    pub mapper: Rc<dyn AuthIdMapper>,
    pub keys: Rc<dyn SharedKeyLookup>,
    /// Whether this daemon may serve a local account other than its own.
    pub switch_user: bool,
}

/// Outcome of a successful authorization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorized {
    pub method: AuthMethod,
    pub role: IdRole,
    /// Local account the peer was mapped to.
    pub username: String,
}

/// Methods this server can accept with the given config.
pub fn server_available(config: &AuthConfig) -> MethodSet {
    let mut set = MethodSet::EMPTY;
    set.insert(AuthMethod::SharedSecret);
    // Serving any TLS method requires our own certificate.
    let tls_ready = config.tls.as_ref().is_some_and(|t| t.has_identity());
    if tls_ready {
        set.insert(AuthMethod::TlsSharedSecret);
        set.insert(AuthMethod::TlsClientCert);
        if config.sasl_provider.is_some() {
            set.insert(AuthMethod::Sasl);
            set.insert(AuthMethod::SaslAuth);
        }
    }
    set
}

/// Run the server side of the negotiation with the peer at `peer_hostname`.
pub fn authorize<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    peer_hostname: &str,
    config: &AuthConfig,
    env: &ServerEnv,
) -> Result<Authorized> {
    let acceptable = config
        .enabled_for(peer_hostname)
        .intersect(server_available(config));
    let blob: Vec<u8> = AuthMethod::PREFERENCE
        .iter()
        .filter(|m| acceptable.contains(**m))
        .map(|m| m.code() as u8)
        .collect();
    conn.send_bytes(&blob);
    conn.flush()?;
    debug!(host = %peer_hostname, methods = ?acceptable, "advertised methods");

    let mut try_count = 0u32;
    let mut last_error = None;
    loop {
        let code = conn.recv_i32()?;
        let offered = AuthMethod::from_code(code);
        let acceptance = match offered {
            None => AuthCode::NotSupported,
            Some(AuthMethod::None) => AuthCode::NoError,
            Some(m) if !acceptable.contains(m) => AuthCode::Denied,
            Some(_) => AuthCode::NoError,
        };
        conn.send_i32(acceptance.code());
        conn.flush()?;
        if acceptance != AuthCode::NoError {
            warn!(code, "refused offered method");
            return Err(AuthError::Protocol(format!(
                "unacceptable method code {code} from peer"
            )));
        }
        let method = match offered {
            Some(AuthMethod::None) | None => {
                // The client gave up; classify what the negotiation died of.
                return Err(if blob.is_empty() {
                    AuthError::PermissionDenied
                } else if try_count == 0 {
                    AuthError::ProtocolNotSupported
                } else {
                    last_error.unwrap_or(AuthError::Authentication)
                });
            }
            Some(m) => m,
        };
        try_count += 1;
        debug!(method = method.name(), host = %peer_hostname, "peer offers method");
        match authorize_method(method, conn, config, env) {
            Ok(authorized) => {
                info!(
                    method = method.name(),
                    user = %authorized.username,
                    role = authorized.role.name(),
                    "peer authenticated"
                );
                return Ok(authorized);
            }
            Err(e) if e.negotiation_retryable() => {
                warn!(method = method.name(), error = %e, "method failed, awaiting next offer");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
}

fn authorize_method<S: Read + Write + AsRawFd>(
    method: AuthMethod,
    conn: &mut Channel<S>,
    config: &AuthConfig,
    env: &ServerEnv,
) -> Result<Authorized> {
    match method {
        AuthMethod::SharedSecret => authorize_sharedsecret(conn, env, false),
        AuthMethod::TlsSharedSecret => authorize_tls_sharedsecret(conn, config, env),
        AuthMethod::TlsClientCert => authorize_tls_client_certificate(conn, config, env),
        AuthMethod::Sasl => authorize_sasl(conn, config, env, AuthMethod::Sasl),
        AuthMethod::SaslAuth => authorize_sasl(conn, config, env, AuthMethod::SaslAuth),
        AuthMethod::None => Err(AuthError::Protocol(
            "the giveup sentinel is not a runnable method".into(),
        )),
    }
}

/// Identity for the announced username. Host daemons authenticate under
/// fixed usernames that bypass the mapper.
pub(crate) fn username_identity(
    env: &ServerEnv,
    method: AuthMethod,
    username: &str,
) -> Result<(IdRole, String)> {
    match username {
        SPOOL_HOST_USERNAME => Ok((IdRole::SpoolHost, username.to_string())),
        METADATA_HOST_USERNAME => Ok((IdRole::MetadataHost, username.to_string())),
        _ => env.mapper.map(method, username, IdRole::User),
    }
}

/// The server half of the shared-secret dialogue. With `under_tls` the
/// client leads with its verdict on our certificate; a rejection there is
/// fatal for the whole negotiation, the client will not offer again.
pub(crate) fn authorize_sharedsecret<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    env: &ServerEnv,
    under_tls: bool,
) -> Result<Authorized> {
    if under_tls {
        let verdict = conn.recv_i32()?;
        if verdict != AuthCode::NoError.code() {
            warn!(code = verdict, "peer rejected our certificate");
            return Err(AuthError::HostnameMismatch);
        }
    }

    let username = conn.recv_string_bounded(USERNAME_LIMIT)?;
    let identity = username_identity(env, AuthMethod::SharedSecret, &username);

    let mut last_failure = None;
    loop {
        let key_type = conn.recv_i32()?;
        match key_type {
            KEY_TYPE_GIVEUP => {
                conn.send_i32(AuthCode::NoError.code());
                conn.flush()?;
                return Err(match last_failure {
                    Some(AuthCode::Expired) => AuthError::Expired,
                    Some(AuthCode::NotSupported) => AuthError::ProtocolNotSupported,
                    _ => AuthError::Authentication,
                });
            }
            KEY_TYPE_HMAC_SHA256 => {
                let challenge = keyfile::new_challenge();
                conn.send_i32(AuthCode::NoError.code());
                conn.send_bytes(&challenge);
                conn.flush()?;
                let expire = conn.recv_u32()?;
                let response = conn.recv_bytes_exact(RESPONSE_LEN)?;
                // The key lookup must happen after the response arrives: the
                // client (re)creates its key right before responding, and a
                // lookup taken earlier would race the file's creation.
                let verdict = round_verdict(env, &identity, &username, expire, &challenge, &response);
                conn.send_i32(verdict.code());
                conn.flush()?;
                if verdict == AuthCode::NoError {
                    let (role, local) = match identity {
                        Ok(id) => id,
                        Err(e) => return Err(e),
                    };
                    return Ok(Authorized {
                        method: AuthMethod::SharedSecret,
                        role,
                        username: local,
                    });
                }
                last_failure = Some(verdict);
            }
            other => {
                debug!(key_type = other, "unsupported key type offered");
                last_failure = Some(AuthCode::NotSupported);
                conn.send_i32(AuthCode::NotSupported.code());
                conn.flush()?;
            }
        }
    }
}

/// Verdict for one challenge round. `Expired` is reserved for a key that is
/// genuinely past its expiry; any other verification failure, including a
/// missing key or an unknown user, is an invalid credential.
fn round_verdict(
    env: &ServerEnv,
    identity: &Result<(IdRole, String)>,
    username: &str,
    expire: u32,
    challenge: &[u8],
    response: &[u8],
) -> AuthCode {
    if identity.is_err() {
        return AuthCode::InvalidCredential;
    }
    let key = match env.keys.lookup(username) {
        Ok(key) => key,
        Err(_) => return AuthCode::InvalidCredential,
    };
    if keyfile::now_secs() >= u64::from(expire) {
        return AuthCode::Expired;
    }
    if u64::from(expire) != key.expire {
        return AuthCode::InvalidCredential;
    }
    let expected = match keyfile::challenge_response(&key, challenge) {
        Ok(expected) => expected,
        Err(_) => return AuthCode::InvalidCredential,
    };
    if response != &expected[..] {
        return AuthCode::InvalidCredential;
    }
    AuthCode::NoError
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefuseAll;

    impl AuthIdMapper for RefuseAll {
        fn map(&self, _: AuthMethod, _: &str, _: IdRole) -> Result<(IdRole, String)> {
            Err(AuthError::Authentication)
        }
    }

    #[test]
    fn reserved_usernames_bypass_the_mapper() {
        let env = ServerEnv {
            mapper: Rc::new(RefuseAll),
            keys: Rc::new(FileKeyStore::new("/nonexistent")),
            switch_user: true,
        };
        let (role, name) =
            username_identity(&env, AuthMethod::SharedSecret, SPOOL_HOST_USERNAME).unwrap();
        assert_eq!(role, IdRole::SpoolHost);
        assert_eq!(name, SPOOL_HOST_USERNAME);
        let (role, _) =
            username_identity(&env, AuthMethod::SharedSecret, METADATA_HOST_USERNAME).unwrap();
        assert_eq!(role, IdRole::MetadataHost);
        assert!(username_identity(&env, AuthMethod::SharedSecret, "alice").is_err());
    }

    #[test]
    fn key_store_rejects_path_tricks() {
        let store = FileKeyStore::new("/var/lib/meshfs/users");
        assert!(matches!(
            store.lookup("../root"),
            Err(AuthError::Credential(_))
        ));
    }

    #[test]
    fn plain_server_offers_no_tls_methods() {
        let config = AuthConfig::new();
        let set = server_available(&config);
        assert!(set.contains(AuthMethod::SharedSecret));
        assert!(!set.contains(AuthMethod::TlsSharedSecret));
        assert!(!set.contains(AuthMethod::Sasl));
    }
}
