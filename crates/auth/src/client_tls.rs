//! TLS authentication methods, client side
//!
//! Both TLS methods upgrade the channel first and tear the session down
//! best-effort on every failure path. `tls_sharedsecret` leads with the
//! server-certificate verdict and then runs the shared-secret dialogue over
//! the session; `tls_client_certificate` authenticates with the client's own
//! certificate and only exchanges a role announcement and a verdict.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use reactor::{Event, EventQueue, Filter};
use wire::{Channel, ClientAuth, TlsSettings};

use crate::client::{request_sharedsecret, AuthRequestParams};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::proto::{AuthCode, TLS_CERT_REQUEST_CLIENT_ROLE, TLS_CERT_REQUEST_GIVEUP};
use crate::sharedsecret_async::SharedSecretAuth;

pub(crate) fn tls_settings(config: &AuthConfig) -> Result<&TlsSettings> {
    config.tls.as_ref().ok_or(AuthError::NoMethodAvailable)
}

/// Match the server certificate against the expected service and host.
pub(crate) fn check_server_identity<S: Read + Write + AsRawFd>(
    conn: &Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
) -> Result<()> {
    let cn = conn.peer_common_name().map_err(|e| {
        warn!(host = %params.hostname, error = %e, "cannot read server certificate");
        AuthError::HostnameMismatch
    })?;
    config
        .identity_checker()
        .check_host(Some(&params.service_tag), &params.hostname, &cn)
        .map_err(|e| {
            warn!(host = %params.hostname, error = %e, "server identity check failed");
            AuthError::HostnameMismatch
        })
}

pub(crate) fn request_tls_sharedsecret<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
) -> Result<()> {
    conn.tls_initiate(tls_settings(config)?, &params.hostname, ClientAuth::None)?;
    let cert_ok = check_server_identity(conn, params, config).is_ok();
    let result = request_sharedsecret(conn, params, config, Some(cert_ok));
    if result.is_err() {
        conn.tls_reset();
    }
    result
}

pub(crate) fn request_tls_client_certificate<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
) -> Result<()> {
    let auth = if config.tls_proxy_certificate {
        ClientAuth::ProxyCertificate
    } else {
        ClientAuth::Certificate
    };
    conn.tls_initiate(tls_settings(config)?, &params.hostname, auth)?;
    start_client_certificate(conn, params, config)?;
    finish_client_certificate(conn)
}

/// Announce our role, or give up when the server certificate fails the
/// identity check.
fn start_client_certificate<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
) -> Result<()> {
    match check_server_identity(conn, params, config) {
        Ok(()) => {
            conn.send_i32(TLS_CERT_REQUEST_CLIENT_ROLE);
            conn.send_i32(params.role.code());
            conn.flush()?;
            Ok(())
        }
        Err(e) => {
            conn.send_i32(TLS_CERT_REQUEST_GIVEUP);
            conn.send_i32(AuthCode::InvalidCredential.code());
            conn.flush()?;
            conn.tls_reset();
            Err(e)
        }
    }
}

fn finish_client_certificate<S: Read + Write + AsRawFd>(conn: &mut Channel<S>) -> Result<()> {
    let verdict = match conn.recv_i32() {
        Ok(v) => v,
        Err(e) => {
            conn.tls_reset();
            return Err(e.into());
        }
    };
    if verdict == AuthCode::NoError.code() {
        debug!("client certificate accepted");
        Ok(())
    } else {
        warn!(code = verdict, "client certificate rejected");
        conn.tls_reset();
        Err(AuthError::Authentication)
    }
}

/// Multiplexed `tls_sharedsecret`: the handshake and certificate check run
/// in the constructor, the shared-secret dialogue on the event queue.
pub(crate) fn start_tls_sharedsecret_multiplexed<S: Read + Write + AsRawFd + 'static>(
    queue: &EventQueue,
    conn: &Rc<RefCell<Channel<S>>>,
    params: &AuthRequestParams,
    config: &Rc<AuthConfig>,
    continuation: Box<dyn FnOnce()>,
) -> Result<SharedSecretAuth<S>> {
    conn.borrow_mut()
        .tls_initiate(tls_settings(config)?, &params.hostname, ClientAuth::None)?;
    let cert_ok = check_server_identity(&conn.borrow(), params, config).is_ok();
    match SharedSecretAuth::start(queue, conn, params, config, Some(cert_ok), continuation) {
        Ok(state) => Ok(state),
        Err(e) => {
            conn.borrow_mut().tls_reset();
            Err(e)
        }
    }
}

/// Multiplexed `tls_client_certificate`. Handshake, identity check, and the
/// role announcement happen in the constructor; only the final verdict read
/// waits on the event queue.
pub(crate) struct TlsClientCertAuth<S: Read + Write + AsRawFd + 'static> {
    inner: Rc<RefCell<CertInner<S>>>,
    readable: Event,
}

struct CertInner<S: Read + Write + AsRawFd + 'static> {
    conn: Rc<RefCell<Channel<S>>>,
    result: Option<Result<()>>,
    continuation: Option<Box<dyn FnOnce()>>,
}

impl<S: Read + Write + AsRawFd + 'static> TlsClientCertAuth<S> {
    pub(crate) fn start(
        queue: &EventQueue,
        conn: &Rc<RefCell<Channel<S>>>,
        params: &AuthRequestParams,
        config: &AuthConfig,
        continuation: Box<dyn FnOnce()>,
    ) -> Result<TlsClientCertAuth<S>> {
        {
            let mut ch = conn.borrow_mut();
            let auth = if config.tls_proxy_certificate {
                ClientAuth::ProxyCertificate
            } else {
                ClientAuth::Certificate
            };
            ch.tls_initiate(tls_settings(config)?, &params.hostname, auth)?;
            start_client_certificate(&mut ch, params, config)?;
        }

        let inner = Rc::new(RefCell::new(CertInner {
            conn: conn.clone(),
            result: None,
            continuation: Some(continuation),
        }));
        let fd = conn.borrow().fd();
        let state = inner.clone();
        let readable = Event::socket(fd, Filter::READ | Filter::TIMEOUT, move |mask| {
            let outcome = if mask.contains(Filter::TIMEOUT) {
                Err(AuthError::TimedOut)
            } else {
                let conn = state.borrow().conn.clone();
                let mut ch = conn.borrow_mut();
                finish_client_certificate(&mut ch)
            };
            let cont = {
                let mut s = state.borrow_mut();
                s.result = Some(outcome);
                s.continuation.take()
            };
            if let Some(cont) = cont {
                cont();
            }
        });
        queue.add(&readable, Some(config.timeout))?;
        Ok(TlsClientCertAuth { inner, readable })
    }

    pub(crate) fn result(self, queue: &EventQueue) -> Result<()> {
        let _ = queue.delete(&self.readable);
        let outcome = self
            .inner
            .borrow_mut()
            .result
            .take()
            .unwrap_or_else(|| Err(AuthError::Protocol("authentication still in progress".into())));
        if outcome.is_err() {
            let conn = self.inner.borrow().conn.clone();
            conn.borrow_mut().tls_reset();
        }
        outcome
    }
}
