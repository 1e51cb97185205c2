//! Full loopback: a real client negotiating against a real server over a
//! socketpair, one thread per side.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use auth::{
    auth_request, authorize, AuthConfig, AuthError, AuthIdMapper, AuthMethod, AuthRequestParams,
    Authorized, FileKeyStore, IdRole, MethodSet, PlainProvider, Result, ServerEnv,
};
use wire::{Channel, TlsSettings};

const HOSTNAME: &str = "fs1.example";

fn params() -> AuthRequestParams {
    AuthRequestParams {
        service_tag: "meshfs-md".to_string(),
        hostname: HOSTNAME.to_string(),
        username: "alice".to_string(),
        role: IdRole::User,
    }
}

fn only(method: AuthMethod) -> MethodSet {
    let mut set = MethodSet::EMPTY;
    set.insert(method);
    set
}

/// Maps certificate subjects mentioning alice to her account and passes
/// every other identifier through unchanged.
struct TestMapper;

impl AuthIdMapper for TestMapper {
    fn map(&self, method: AuthMethod, auth_id: &str, role_hint: IdRole) -> Result<(IdRole, String)> {
        match method {
            AuthMethod::TlsClientCert => {
                if auth_id.contains("alice") {
                    Ok((IdRole::User, "alice".to_string()))
                } else {
                    Err(AuthError::Authentication)
                }
            }
            _ => Ok((role_hint, auth_id.to_string())),
        }
    }
}

fn server_env(key_base: &Path) -> ServerEnv {
    ServerEnv {
        mapper: Rc::new(TestMapper),
        keys: Rc::new(FileKeyStore::new(key_base)),
        switch_user: true,
    }
}

struct TestCa {
    ca_der: CertificateDer<'static>,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

fn test_ca() -> TestCa {
    let ca_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, "meshfs test ca");
    let ca_cert = params.self_signed(&ca_key).unwrap();
    TestCa {
        ca_der: ca_cert.der().clone(),
        ca_cert,
        ca_key,
    }
}

fn issue(ca: &TestCa, cn: &str, san: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![san.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    let cert = params.signed_by(&key, &ca.ca_cert, &ca.ca_key).unwrap();
    (
        cert.der().clone(),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    )
}

/// Client key file inside the same per-user directory the server's key
/// store reads from.
fn shared_key_setup(base: &Path) -> PathBuf {
    let home = base.join("alice");
    fs::create_dir_all(&home).unwrap();
    home.join(".meshfs_shared_key")
}

fn run_server(
    sock: UnixStream,
    config: impl FnOnce() -> AuthConfig + Send + 'static,
    key_base: PathBuf,
) -> thread::JoinHandle<Result<Authorized>> {
    thread::spawn(move || {
        let mut conn = Channel::new(sock);
        let env = server_env(&key_base);
        authorize(&mut conn, "client.example", &config(), &env)
    })
}

#[test]
fn sharedsecret_end_to_end() {
    let base = tempfile::tempdir().unwrap();
    let key_file = shared_key_setup(base.path());
    let (a, b) = UnixStream::pair().unwrap();

    let server = run_server(b, AuthConfig::new, base.path().to_path_buf());

    let mut config = AuthConfig::new();
    config.key_file = Some(key_file);
    let mut conn = Channel::new(a);
    let method = auth_request(&mut conn, &params(), &config).unwrap();
    assert_eq!(method, AuthMethod::SharedSecret);

    let authorized = server.join().unwrap().unwrap();
    assert_eq!(
        authorized,
        Authorized {
            method: AuthMethod::SharedSecret,
            role: IdRole::User,
            username: "alice".to_string(),
        }
    );
}

/// A user the server holds no key for is an invalid credential, not an
/// expired one; the client gets no retry out of it and both sides settle on
/// a plain authentication failure.
#[test]
fn missing_server_key_is_rejected() {
    let server_base = tempfile::tempdir().unwrap();
    let client_home = tempfile::tempdir().unwrap();
    let (a, b) = UnixStream::pair().unwrap();

    let server = run_server(b, AuthConfig::new, server_base.path().to_path_buf());

    let mut config = AuthConfig::new();
    config.key_file = Some(client_home.path().join(".meshfs_shared_key"));
    let mut conn = Channel::new(a);
    assert!(matches!(
        auth_request(&mut conn, &params(), &config),
        Err(AuthError::Authentication)
    ));
    assert!(matches!(
        server.join().unwrap(),
        Err(AuthError::Authentication)
    ));
}

#[test]
fn tls_sharedsecret_end_to_end() {
    let base = tempfile::tempdir().unwrap();
    let key_file = shared_key_setup(base.path());
    let ca = test_ca();
    let (server_cert, server_key) = issue(&ca, HOSTNAME, HOSTNAME);
    let ca_der = ca.ca_der.clone();
    let (a, b) = UnixStream::pair().unwrap();

    let server = run_server(
        b,
        move || {
            let mut config = AuthConfig::new();
            config.tls = Some(
                TlsSettings::new(vec![ca_der])
                    .unwrap()
                    .with_identity(vec![server_cert], server_key),
            );
            config
        },
        base.path().to_path_buf(),
    );

    let mut config = AuthConfig::new();
    config.key_file = Some(key_file);
    config.default_methods = only(AuthMethod::TlsSharedSecret);
    config.tls = Some(TlsSettings::new(vec![ca.ca_der.clone()]).unwrap());
    let mut conn = Channel::new(a);
    let method = auth_request(&mut conn, &params(), &config).unwrap();
    assert_eq!(method, AuthMethod::TlsSharedSecret);
    // The session protects the connection from here on.
    assert!(conn.is_tls());

    let authorized = server.join().unwrap().unwrap();
    assert_eq!(authorized.method, AuthMethod::TlsSharedSecret);
    assert_eq!(authorized.username, "alice");
}

/// `sasl_auth` borrows TLS for the PLAIN exchange and hands back a cleartext
/// channel on both sides.
#[test]
fn sasl_auth_plain_end_to_end() {
    let base = tempfile::tempdir().unwrap();
    let ca = test_ca();
    let (server_cert, server_key) = issue(&ca, HOSTNAME, HOSTNAME);
    let ca_der = ca.ca_der.clone();
    let (a, b) = UnixStream::pair().unwrap();

    let server = thread::spawn(move || {
        let mut config = AuthConfig::new();
        config.tls = Some(
            TlsSettings::new(vec![ca_der])
                .unwrap()
                .with_identity(vec![server_cert], server_key),
        );
        config.sasl_provider = Some(Rc::new(PlainProvider::server(Rc::new(
            |user: &str, password: &str| user == "alice" && password == "sesame",
        ))));
        let mut conn = Channel::new(b);
        let env = server_env(base.path());
        let authorized = authorize(&mut conn, "client.example", &config, &env)?;
        assert!(!conn.is_tls());
        Ok::<_, AuthError>(authorized)
    });

    let mut config = AuthConfig::new();
    config.default_methods = only(AuthMethod::SaslAuth);
    config.tls = Some(TlsSettings::new(vec![ca.ca_der.clone()]).unwrap());
    config.sasl_provider = Some(Rc::new(PlainProvider::client()));
    config.sasl_user = Some("alice".to_string());
    config.sasl_password = Some("sesame".to_string());
    let mut conn = Channel::new(a);
    let method = auth_request(&mut conn, &params(), &config).unwrap();
    assert_eq!(method, AuthMethod::SaslAuth);
    assert!(!conn.is_tls());

    let authorized = server.join().unwrap().unwrap();
    assert_eq!(authorized.method, AuthMethod::SaslAuth);
    assert_eq!(authorized.role, IdRole::User);
    assert_eq!(authorized.username, "alice");
}

#[test]
fn tls_client_certificate_end_to_end() {
    let base = tempfile::tempdir().unwrap();
    let ca = test_ca();
    let (server_cert, server_key) = issue(&ca, HOSTNAME, HOSTNAME);
    let (client_cert, client_key) = issue(&ca, "alice", "alice.example");
    let ca_der = ca.ca_der.clone();
    let (a, b) = UnixStream::pair().unwrap();

    let server = run_server(
        b,
        move || {
            let mut config = AuthConfig::new();
            config.tls = Some(
                TlsSettings::new(vec![ca_der])
                    .unwrap()
                    .with_identity(vec![server_cert], server_key),
            );
            config
        },
        base.path().to_path_buf(),
    );

    let mut config = AuthConfig::new();
    config.default_methods = only(AuthMethod::TlsClientCert);
    config.tls = Some(
        TlsSettings::new(vec![ca.ca_der.clone()])
            .unwrap()
            .with_identity(vec![client_cert], client_key),
    );
    let mut conn = Channel::new(a);
    let method = auth_request(&mut conn, &params(), &config).unwrap();
    assert_eq!(method, AuthMethod::TlsClientCert);

    let authorized = server.join().unwrap().unwrap();
    assert_eq!(
        authorized,
        Authorized {
            method: AuthMethod::TlsClientCert,
            role: IdRole::User,
            username: "alice".to_string(),
        }
    );
}

/// A certificate that chains correctly but names the wrong host passes the
/// handshake and fails the identity check; the client aborts outright.
#[test]
fn server_identity_mismatch_aborts() {
    let base = tempfile::tempdir().unwrap();
    let key_file = shared_key_setup(base.path());
    let ca = test_ca();
    // Valid SAN for the handshake, wrong common name for the identity check.
    let (server_cert, server_key) = issue(&ca, "impostor.example", HOSTNAME);
    let ca_der = ca.ca_der.clone();
    let (a, b) = UnixStream::pair().unwrap();

    let server = run_server(
        b,
        move || {
            let mut config = AuthConfig::new();
            config.tls = Some(
                TlsSettings::new(vec![ca_der])
                    .unwrap()
                    .with_identity(vec![server_cert], server_key),
            );
            config
        },
        base.path().to_path_buf(),
    );

    let mut config = AuthConfig::new();
    config.key_file = Some(key_file);
    config.default_methods = only(AuthMethod::TlsSharedSecret);
    config.tls = Some(TlsSettings::new(vec![ca.ca_der.clone()]).unwrap());
    let mut conn = Channel::new(a);
    assert!(matches!(
        auth_request(&mut conn, &params(), &config),
        Err(AuthError::HostnameMismatch)
    ));
    // The rejection is fatal on the server too; it must not wait for
    // another offer.
    assert!(matches!(
        server.join().unwrap(),
        Err(AuthError::HostnameMismatch)
    ));
}

/// The client-certificate method gives the round up over the leading request
/// when the server certificate fails the identity check; both ends abort.
#[test]
fn client_certificate_giveup_on_bad_server_identity() {
    let base = tempfile::tempdir().unwrap();
    let ca = test_ca();
    let (server_cert, server_key) = issue(&ca, "impostor.example", HOSTNAME);
    let (client_cert, client_key) = issue(&ca, "alice", "alice.example");
    let ca_der = ca.ca_der.clone();
    let (a, b) = UnixStream::pair().unwrap();

    let server = run_server(
        b,
        move || {
            let mut config = AuthConfig::new();
            config.tls = Some(
                TlsSettings::new(vec![ca_der])
                    .unwrap()
                    .with_identity(vec![server_cert], server_key),
            );
            config
        },
        base.path().to_path_buf(),
    );

    let mut config = AuthConfig::new();
    config.default_methods = only(AuthMethod::TlsClientCert);
    config.tls = Some(
        TlsSettings::new(vec![ca.ca_der.clone()])
            .unwrap()
            .with_identity(vec![client_cert], client_key),
    );
    let mut conn = Channel::new(a);
    assert!(matches!(
        auth_request(&mut conn, &params(), &config),
        Err(AuthError::HostnameMismatch)
    ));
    assert!(matches!(
        server.join().unwrap(),
        Err(AuthError::HostnameMismatch)
    ));
}

/// SASL leads with the client's certificate verdict; a rejection there ends
/// the negotiation on both sides.
#[test]
fn sasl_rejects_mismatched_server_identity() {
    let base = tempfile::tempdir().unwrap();
    let ca = test_ca();
    let (server_cert, server_key) = issue(&ca, "impostor.example", HOSTNAME);
    let ca_der = ca.ca_der.clone();
    let (a, b) = UnixStream::pair().unwrap();

    let server = thread::spawn(move || {
        let mut config = AuthConfig::new();
        config.tls = Some(
            TlsSettings::new(vec![ca_der])
                .unwrap()
                .with_identity(vec![server_cert], server_key),
        );
        config.sasl_provider = Some(Rc::new(PlainProvider::server(Rc::new(
            |user: &str, password: &str| user == "alice" && password == "sesame",
        ))));
        let mut conn = Channel::new(b);
        let env = server_env(base.path());
        authorize(&mut conn, "client.example", &config, &env)
    });

    let mut config = AuthConfig::new();
    config.default_methods = only(AuthMethod::SaslAuth);
    config.tls = Some(TlsSettings::new(vec![ca.ca_der.clone()]).unwrap());
    config.sasl_provider = Some(Rc::new(PlainProvider::client()));
    config.sasl_user = Some("alice".to_string());
    config.sasl_password = Some("sesame".to_string());
    let mut conn = Channel::new(a);
    assert!(matches!(
        auth_request(&mut conn, &params(), &config),
        Err(AuthError::HostnameMismatch)
    ));
    assert!(matches!(
        server.join().unwrap(),
        Err(AuthError::HostnameMismatch)
    ));
}

/// A peer offering no SASL mechanisms gets nothing back inside the session:
/// the next thing it can read is the client's close_notify.
#[test]
fn empty_sasl_offer_draws_no_reply() {
    let ca = test_ca();
    let (server_cert, server_key) = issue(&ca, HOSTNAME, HOSTNAME);
    let ca_der = ca.ca_der.clone();
    let (a, b) = UnixStream::pair().unwrap();

    let peer = thread::spawn(move || {
        let settings = TlsSettings::new(vec![ca_der])
            .unwrap()
            .with_identity(vec![server_cert], server_key);
        let mut ch = Channel::new(b);
        ch.send_bytes(&[5]); // sasl_auth only
        ch.flush().unwrap();
        assert_eq!(ch.recv_i32().unwrap(), 5);
        ch.send_i32(0);
        ch.flush().unwrap();
        ch.tls_accept(&settings, false).unwrap();
        assert_eq!(ch.recv_i32().unwrap(), 0); // certificate verdict
        ch.send_string("");
        ch.flush().unwrap();
        assert!(ch.recv_i32().is_err());
    });

    let mut config = AuthConfig::new();
    config.default_methods = only(AuthMethod::SaslAuth);
    config.tls = Some(TlsSettings::new(vec![ca.ca_der.clone()]).unwrap());
    config.sasl_provider = Some(Rc::new(PlainProvider::client()));
    config.sasl_user = Some("alice".to_string());
    config.sasl_password = Some("sesame".to_string());
    let mut conn = Channel::new(a);
    // The scripted peer stops answering once the sub-dialogue dies, so the
    // closing sentinel exchange fails too; all that matters here is that
    // the client did not keep talking inside the session.
    assert!(auth_request(&mut conn, &params(), &config).is_err());
    peer.join().unwrap();
}
