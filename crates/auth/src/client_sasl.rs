//! SASL authentication, client side
//!
//! Both SASL methods run the mechanism conversation inside a TLS session.
//! `sasl` keeps the session up afterwards; `sasl_auth` only borrows TLS for
//! the credential exchange and downgrades back to the plain socket once the
//! peer accepts. Every failure path tears the session down.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use reactor::{Event, EventQueue, Filter};
use wire::{Channel, ClientAuth};

use crate::client::AuthRequestParams;
use crate::client_tls::{check_server_identity, tls_settings};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::proto::{AuthCode, SaslStep, SASL_BUFFER_LIMIT, SASL_MECHANISM_LIST_LIMIT};
use crate::sasl::SaslClientSession;

pub(crate) fn request_sasl<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
    downgrade_after: bool,
) -> Result<()> {
    conn.tls_initiate(tls_settings(config)?, &params.hostname, ClientAuth::None)?;
    let result = run_sasl_client(conn, params, config);
    match result {
        Ok(()) => {
            if downgrade_after {
                conn.tls_downgrade()?;
            }
            Ok(())
        }
        Err(e) => {
            conn.tls_reset();
            Err(e)
        }
    }
}

/// Pick the mechanism to announce from the server's offer, honoring a pinned
/// mechanism when one is configured. Nothing is sent when this fails.
fn choose_mechanism(offered: &str, config: &AuthConfig) -> Result<String> {
    let offered: Vec<&str> = offered.split(' ').filter(|m| !m.is_empty()).collect();
    if offered.is_empty() {
        warn!("peer offers no SASL mechanisms");
        return Err(AuthError::ProtocolNotSupported);
    }
    let provider = config
        .sasl_provider
        .as_ref()
        .ok_or(AuthError::NoMethodAvailable)?;
    if let Some(pin) = &config.sasl_mechanism {
        if !offered.contains(&pin.as_str()) {
            warn!(mechanism = %pin, ?offered, "configured mechanism not offered");
            return Err(AuthError::Authentication);
        }
        return Ok(pin.clone());
    }
    provider
        .mechanisms()
        .into_iter()
        .find(|m| offered.contains(&m.as_str()))
        .ok_or_else(|| {
            warn!(?offered, "no offered mechanism is provided here");
            AuthError::Authentication
        })
}

fn start_session(
    conn_offer: &str,
    config: &AuthConfig,
) -> Result<(String, Box<dyn SaslClientSession>)> {
    let mechanism = choose_mechanism(conn_offer, config)?;
    let provider = config
        .sasl_provider
        .as_ref()
        .ok_or(AuthError::NoMethodAvailable)?;
    let credentials = config.sasl_credentials()?;
    let session = provider.start_client(&mechanism, &credentials)?;
    Ok((mechanism, session))
}

fn run_sasl_client<S: Read + Write + AsRawFd>(
    conn: &mut Channel<S>,
    params: &AuthRequestParams,
    config: &AuthConfig,
) -> Result<()> {
    if check_server_identity(conn, params, config).is_err() {
        conn.send_i32(AuthCode::InvalidCredential.code());
        conn.flush()?;
        return Err(AuthError::HostnameMismatch);
    }
    conn.send_i32(AuthCode::NoError.code());
    conn.flush()?;

    let offer = conn.recv_string_bounded(SASL_MECHANISM_LIST_LIMIT)?;
    let (mechanism, mut session) = start_session(&offer, config)?;
    debug!(mechanism = %mechanism, host = %params.hostname, "starting SASL conversation");

    conn.send_string(&mechanism);
    match session.initial_response()? {
        Some(data) => {
            conn.send_i32(1);
            conn.send_bytes(&data);
        }
        None => conn.send_i32(0),
    }
    conn.flush()?;

    loop {
        let step = conn.recv_i32()?;
        match SaslStep::from_code(step) {
            Some(SaslStep::Continue) => {
                let challenge = conn.recv_bytes_bounded(SASL_BUFFER_LIMIT)?;
                let response = session.step(&challenge)?;
                conn.send_bytes(&response);
                conn.flush()?;
            }
            Some(SaslStep::Done) => {
                debug!(mechanism = %mechanism, "SASL conversation accepted");
                return Ok(());
            }
            Some(SaslStep::Error) => {
                warn!(mechanism = %mechanism, "peer aborted the SASL conversation");
                return Err(AuthError::Authentication);
            }
            None => {
                return Err(AuthError::Protocol(format!(
                    "unknown SASL step code {step}"
                )))
            }
        }
    }
}

/// Multiplexed SASL. The TLS handshake and our certificate verdict happen in
/// the constructor; the mechanism offer and the conversation proper run on
/// the event queue, rebinding the read callback as the dialogue advances.
pub(crate) struct SaslAuth<S: Read + Write + AsRawFd + 'static> {
    inner: Rc<RefCell<SaslInner<S>>>,
}

struct SaslInner<S: Read + Write + AsRawFd + 'static> {
    queue: EventQueue,
    conn: Rc<RefCell<Channel<S>>>,
    config: Rc<AuthConfig>,
    downgrade_after: bool,
    session: Option<Box<dyn SaslClientSession>>,
    /// Mechanism announcement waiting for the socket to become writable.
    pending: Option<(String, Option<Vec<u8>>)>,
    readable: Event,
    writable: Event,
    result: Option<Result<()>>,
    continuation: Option<Box<dyn FnOnce()>>,
}

impl<S: Read + Write + AsRawFd + 'static> SaslAuth<S> {
    pub(crate) fn start(
        queue: &EventQueue,
        conn: &Rc<RefCell<Channel<S>>>,
        params: &AuthRequestParams,
        config: &Rc<AuthConfig>,
        downgrade_after: bool,
        continuation: Box<dyn FnOnce()>,
    ) -> Result<SaslAuth<S>> {
        {
            let mut ch = conn.borrow_mut();
            ch.tls_initiate(tls_settings(config)?, &params.hostname, ClientAuth::None)?;
            if check_server_identity(&ch, params, config).is_err() {
                ch.send_i32(AuthCode::InvalidCredential.code());
                let _ = ch.flush();
                ch.tls_reset();
                return Err(AuthError::HostnameMismatch);
            }
            ch.send_i32(AuthCode::NoError.code());
            if let Err(e) = ch.flush() {
                ch.tls_reset();
                return Err(e.into());
            }
        }

        let fd = conn.borrow().fd();
        let inner = Rc::new(RefCell::new(SaslInner {
            queue: queue.clone(),
            conn: conn.clone(),
            config: config.clone(),
            downgrade_after,
            session: None,
            pending: None,
            readable: Event::socket(fd, Filter::READ | Filter::TIMEOUT, |_| {}),
            writable: Event::socket(fd, Filter::WRITE, |_| {}),
            result: None,
            continuation: Some(continuation),
        }));
        let state = inner.clone();
        inner
            .borrow()
            .readable
            .set_callback(move |mask| on_read_offer(&state, mask));
        let state = inner.clone();
        inner
            .borrow()
            .writable
            .set_callback(move |_mask| on_write_announce(&state));
        if let Err(e) = arm_read(&inner) {
            conn.borrow_mut().tls_reset();
            return Err(e);
        }
        Ok(SaslAuth { inner })
    }

    /// Collect the outcome. Success downgrades the session for `sasl_auth`;
    /// failure tears it down.
    pub(crate) fn result(self) -> Result<()> {
        let mut s = self.inner.borrow_mut();
        let _ = s.queue.delete(&s.readable);
        let _ = s.queue.delete(&s.writable);
        // The callbacks hold the state alive through the events; unhook
        // them so everything can be dropped.
        s.readable.set_callback(|_| {});
        s.writable.set_callback(|_| {});
        let outcome = s
            .result
            .take()
            .unwrap_or_else(|| Err(AuthError::Protocol("authentication still in progress".into())));
        let conn = s.conn.clone();
        let downgrade = s.downgrade_after;
        drop(s);
        match outcome {
            Ok(()) => {
                if downgrade {
                    conn.borrow_mut().tls_downgrade()?;
                }
                Ok(())
            }
            Err(e) => {
                conn.borrow_mut().tls_reset();
                Err(e)
            }
        }
    }
}

fn arm_read<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<SaslInner<S>>>) -> Result<()> {
    let s = rc.borrow();
    s.queue.add(&s.readable, Some(s.config.timeout))?;
    Ok(())
}

fn sasl_finish<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<SaslInner<S>>>,
    outcome: Result<()>,
) {
    let mut s = rc.borrow_mut();
    if s.result.is_some() {
        return;
    }
    s.result = Some(outcome);
    let cont = s.continuation.take();
    drop(s);
    if let Some(cont) = cont {
        cont();
    }
}

fn on_read_offer<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<SaslInner<S>>>,
    mask: Filter,
) {
    if mask.contains(Filter::TIMEOUT) {
        sasl_finish(rc, Err(AuthError::TimedOut));
        return;
    }
    if let Err(e) = read_offer(rc) {
        sasl_finish(rc, Err(e));
    }
}

fn read_offer<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<SaslInner<S>>>) -> Result<()> {
    let offer = {
        let s = rc.borrow();
        let mut ch = s.conn.borrow_mut();
        ch.recv_string_bounded(SASL_MECHANISM_LIST_LIMIT)?
    };
    let config = rc.borrow().config.clone();
    let (mechanism, mut session) = start_session(&offer, &config)?;
    let initial = session.initial_response()?;
    {
        let mut s = rc.borrow_mut();
        s.session = Some(session);
        s.pending = Some((mechanism, initial));
    }
    let s = rc.borrow();
    s.queue.add(&s.writable, None)?;
    Ok(())
}

fn on_write_announce<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<SaslInner<S>>>) {
    if let Err(e) = write_announce(rc) {
        sasl_finish(rc, Err(e));
    }
}

fn write_announce<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<SaslInner<S>>>,
) -> Result<()> {
    let pending = rc.borrow_mut().pending.take();
    let Some((mechanism, initial)) = pending else {
        return Err(AuthError::Protocol("no announcement prepared".into()));
    };
    {
        let s = rc.borrow();
        let mut ch = s.conn.borrow_mut();
        ch.send_string(&mechanism);
        match &initial {
            Some(data) => {
                ch.send_i32(1);
                ch.send_bytes(data);
            }
            None => ch.send_i32(0),
        }
        ch.flush()?;
    }
    // The offer is behind us; from here on every read is a step.
    let state = rc.clone();
    rc.borrow()
        .readable
        .set_callback(move |mask| on_read_step(&state, mask));
    arm_read(rc)
}

fn on_read_step<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<SaslInner<S>>>, mask: Filter) {
    if mask.contains(Filter::TIMEOUT) {
        sasl_finish(rc, Err(AuthError::TimedOut));
        return;
    }
    if let Err(e) = read_step(rc) {
        sasl_finish(rc, Err(e));
    }
}

fn read_step<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<SaslInner<S>>>) -> Result<()> {
    let step = {
        let s = rc.borrow();
        let mut ch = s.conn.borrow_mut();
        ch.recv_i32()?
    };
    match SaslStep::from_code(step) {
        Some(SaslStep::Continue) => {
            {
                let mut s = rc.borrow_mut();
                let challenge = s.conn.borrow_mut().recv_bytes_bounded(SASL_BUFFER_LIMIT)?;
                let session = s
                    .session
                    .as_mut()
                    .ok_or_else(|| AuthError::Protocol("step without a session".into()))?;
                let response = session.step(&challenge)?;
                let mut ch = s.conn.borrow_mut();
                ch.send_bytes(&response);
                ch.flush()?;
            }
            arm_read(rc)
        }
        Some(SaslStep::Done) => {
            debug!("SASL conversation accepted");
            sasl_finish(rc, Ok(()));
            Ok(())
        }
        Some(SaslStep::Error) => {
            warn!("peer aborted the SASL conversation");
            sasl_finish(rc, Err(AuthError::Authentication));
            Ok(())
        }
        None => Err(AuthError::Protocol(format!("unknown SASL step code {step}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::PlainProvider;

    fn config_with_provider() -> AuthConfig {
        let mut config = AuthConfig::new();
        config.sasl_provider = Some(Rc::new(PlainProvider::client()));
        config
    }

    #[test]
    fn empty_offer_is_not_supported() {
        let config = config_with_provider();
        assert!(matches!(
            choose_mechanism("", &config),
            Err(AuthError::ProtocolNotSupported)
        ));
        assert!(matches!(
            choose_mechanism("  ", &config),
            Err(AuthError::ProtocolNotSupported)
        ));
    }

    #[test]
    fn pinned_mechanism_must_be_offered() {
        let mut config = config_with_provider();
        config.sasl_mechanism = Some("SCRAM-SHA-256".to_string());
        assert!(matches!(
            choose_mechanism("PLAIN LOGIN", &config),
            Err(AuthError::Authentication)
        ));
        assert_eq!(
            choose_mechanism("PLAIN SCRAM-SHA-256", &config).unwrap(),
            "SCRAM-SHA-256"
        );
    }

    #[test]
    fn unpinned_choice_follows_provider_preference() {
        let config = config_with_provider();
        assert_eq!(
            choose_mechanism("LOGIN PLAIN", &config).unwrap(),
            "PLAIN"
        );
        assert!(matches!(
            choose_mechanism("LOGIN EXTERNAL", &config),
            Err(AuthError::Authentication)
        ));
    }
}
