//! Client-side negotiation, multiplexed engine
//!
//! The same negotiation as [`auth_request`](crate::auth_request), driven by
//! an event queue so many connections can authenticate on one thread. The
//! caller starts the engine with a continuation, runs the queue, and collects
//! the outcome once the continuation has fired.
//!
//! The engine owns one readable and one writable event for the connection
//! and rebinds their callbacks as the dialogue advances. While a method
//! attempt is in flight the attempt owns the socket; the engine arms nothing
//! until the attempt's continuation hands control back.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tracing::{debug, info, warn};

use reactor::{Event, EventQueue, Filter};
use wire::Channel;

use crate::client::{giveup_error, parse_server_methods, usable_methods, AuthRequestParams};
use crate::client_sasl::SaslAuth;
use crate::client_tls::{start_tls_sharedsecret_multiplexed, TlsClientCertAuth};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::proto::{AuthCode, AuthMethod, MethodSet, METHODS_BUFFER_LIMIT};
use crate::sharedsecret_async::SharedSecretAuth;

/// One in-flight method attempt.
enum SubAttempt<S: Read + Write + AsRawFd + 'static> {
    SharedSecret(SharedSecretAuth<S>),
    TlsSharedSecret(SharedSecretAuth<S>),
    TlsClientCert(TlsClientCertAuth<S>),
    Sasl(SaslAuth<S>),
    SaslAuth(SaslAuth<S>),
}

fn start_sub<S: Read + Write + AsRawFd + 'static>(
    method: AuthMethod,
    queue: &EventQueue,
    conn: &Rc<RefCell<Channel<S>>>,
    params: &AuthRequestParams,
    config: &Rc<AuthConfig>,
    continuation: Box<dyn FnOnce()>,
) -> Result<SubAttempt<S>> {
    match method {
        AuthMethod::SharedSecret => {
            SharedSecretAuth::start(queue, conn, params, config, None, continuation)
                .map(SubAttempt::SharedSecret)
        }
        AuthMethod::TlsSharedSecret => {
            start_tls_sharedsecret_multiplexed(queue, conn, params, config, continuation)
                .map(SubAttempt::TlsSharedSecret)
        }
        AuthMethod::TlsClientCert => {
            TlsClientCertAuth::start(queue, conn, params, config, continuation)
                .map(SubAttempt::TlsClientCert)
        }
        AuthMethod::Sasl => SaslAuth::start(queue, conn, params, config, false, continuation)
            .map(SubAttempt::Sasl),
        AuthMethod::SaslAuth => SaslAuth::start(queue, conn, params, config, true, continuation)
            .map(SubAttempt::SaslAuth),
        AuthMethod::None => Err(AuthError::Protocol(
            "the giveup sentinel is not a runnable method".into(),
        )),
    }
}

fn sub_result<S: Read + Write + AsRawFd + 'static>(
    sub: SubAttempt<S>,
    queue: &EventQueue,
    conn: &Rc<RefCell<Channel<S>>>,
) -> Result<()> {
    match sub {
        SubAttempt::SharedSecret(a) => a.result(),
        SubAttempt::TlsSharedSecret(a) => {
            let r = a.result();
            if r.is_err() {
                conn.borrow_mut().tls_reset();
            }
            r
        }
        SubAttempt::TlsClientCert(a) => a.result(queue),
        SubAttempt::Sasl(a) | SubAttempt::SaslAuth(a) => a.result(),
    }
}

pub struct AuthState<S: Read + Write + AsRawFd + 'static> {
    inner: Rc<RefCell<EngineInner<S>>>,
}

struct EngineInner<S: Read + Write + AsRawFd + 'static> {
    queue: EventQueue,
    conn: Rc<RefCell<Channel<S>>>,
    params: AuthRequestParams,
    config: Rc<AuthConfig>,
    server_methods: MethodSet,
    candidates: MethodSet,
    /// Candidates not yet tried, last is next.
    remaining: Vec<AuthMethod>,
    current: Option<AuthMethod>,
    error_save: Option<AuthError>,
    sub: Option<SubAttempt<S>>,
    readable: Event,
    writable: Event,
    result: Option<Result<AuthMethod>>,
    continuation: Option<Box<dyn FnOnce()>>,
}

/// Start negotiating on `conn`. `continuation` fires exactly once, from a
/// queue dispatch, when a result is ready for [`auth_result_multiplexed`].
pub fn auth_request_multiplexed<S: Read + Write + AsRawFd + 'static>(
    queue: &EventQueue,
    conn: &Rc<RefCell<Channel<S>>>,
    params: &AuthRequestParams,
    config: &Rc<AuthConfig>,
    continuation: Box<dyn FnOnce()>,
) -> Result<AuthState<S>> {
    usable_methods(params, config)?;

    let fd = conn.borrow().fd();
    let inner = Rc::new(RefCell::new(EngineInner {
        queue: queue.clone(),
        conn: conn.clone(),
        params: params.clone(),
        config: config.clone(),
        server_methods: MethodSet::EMPTY,
        candidates: MethodSet::EMPTY,
        remaining: Vec::new(),
        current: None,
        error_save: None,
        sub: None,
        readable: Event::socket(fd, Filter::READ | Filter::TIMEOUT, |_| {}),
        writable: Event::socket(fd, Filter::WRITE, |_| {}),
        result: None,
        continuation: Some(continuation),
    }));
    let state = inner.clone();
    inner
        .borrow()
        .readable
        .set_callback(move |mask| on_read(&state, mask, read_methods));
    let state = inner.clone();
    inner
        .borrow()
        .writable
        .set_callback(move |_mask| {
            if let Err(e) = write_offer(&state) {
                engine_finish(&state, Err(e));
            }
        });
    arm_engine_read(&inner)?;
    Ok(AuthState { inner })
}

/// Collect the negotiation outcome. The engine's events are released here.
pub fn auth_result_multiplexed<S: Read + Write + AsRawFd + 'static>(
    state: AuthState<S>,
) -> Result<AuthMethod> {
    let mut s = state.inner.borrow_mut();
    let _ = s.queue.delete(&s.readable);
    let _ = s.queue.delete(&s.writable);
    // The callbacks hold the engine alive through the events; unhook them
    // so everything can be dropped.
    s.readable.set_callback(|_| {});
    s.writable.set_callback(|_| {});
    s.result
        .take()
        .unwrap_or_else(|| Err(AuthError::Protocol("negotiation still in progress".into())))
}

fn arm_engine_read<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<EngineInner<S>>>,
) -> Result<()> {
    let s = rc.borrow();
    s.queue.add(&s.readable, Some(s.config.timeout))?;
    Ok(())
}

fn arm_engine_write<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<EngineInner<S>>>,
) -> Result<()> {
    let s = rc.borrow();
    s.queue.add(&s.writable, None)?;
    Ok(())
}

fn engine_finish<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<EngineInner<S>>>,
    outcome: Result<AuthMethod>,
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

/// Shared read-callback shell: timeout and error handling around one state.
fn on_read<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<EngineInner<S>>>,
    mask: Filter,
    state_fn: fn(&Rc<RefCell<EngineInner<S>>>) -> Result<()>,
) {
    if mask.contains(Filter::TIMEOUT) {
        engine_finish(rc, Err(AuthError::TimedOut));
        return;
    }
    if let Err(e) = state_fn(rc) {
        engine_finish(rc, Err(e));
    }
}

fn read_methods<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<EngineInner<S>>>,
) -> Result<()> {
    let blob = {
        let s = rc.borrow();
        let mut ch = s.conn.borrow_mut();
        ch.recv_bytes_bounded(METHODS_BUFFER_LIMIT)?
    };
    let server_methods = parse_server_methods(&blob);
    {
        let mut s = rc.borrow_mut();
        let usable = usable_methods(&s.params, &s.config)?;
        let candidates = usable.intersect(server_methods);
        debug!(host = %s.params.hostname, ?server_methods, "peer advertised methods");
        s.server_methods = server_methods;
        s.candidates = candidates;
        s.remaining = AuthMethod::PREFERENCE
            .iter()
            .rev()
            .copied()
            .filter(|m| candidates.contains(*m))
            .collect();
    }
    advance(rc)
}

/// Move on to the next candidate, or to the giveup exchange when none are
/// left. The writable callback reads `current` to know which it is.
fn advance<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<EngineInner<S>>>) -> Result<()> {
    {
        let mut s = rc.borrow_mut();
        s.current = s.remaining.pop();
    }
    arm_engine_write(rc)
}

fn write_offer<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<EngineInner<S>>>) -> Result<()> {
    let current = rc.borrow().current;
    let code = current.map_or(AuthMethod::None.code(), AuthMethod::code);
    {
        let s = rc.borrow();
        let mut ch = s.conn.borrow_mut();
        ch.send_i32(code);
        ch.flush()?;
    }
    let state = rc.clone();
    match current {
        Some(method) => {
            debug!(method = method.name(), "offering method");
            rc.borrow()
                .readable
                .set_callback(move |mask| on_read(&state, mask, read_accept));
        }
        None => {
            rc.borrow()
                .readable
                .set_callback(move |mask| on_read(&state, mask, read_giveup_ack));
        }
    }
    arm_engine_read(rc)
}

fn read_accept<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<EngineInner<S>>>) -> Result<()> {
    let accept = {
        let s = rc.borrow();
        let mut ch = s.conn.borrow_mut();
        ch.recv_i32()?
    };
    let method = rc
        .borrow()
        .current
        .ok_or_else(|| AuthError::Protocol("acceptance without an offer".into()))?;
    if accept != AuthCode::NoError.code() {
        return Err(AuthError::Protocol(format!(
            "peer refused offered method {} with code {accept}",
            method.name()
        )));
    }
    let (queue, conn, params, config) = {
        let s = rc.borrow();
        (s.queue.clone(), s.conn.clone(), s.params.clone(), s.config.clone())
    };
    let state = rc.clone();
    let continuation: Box<dyn FnOnce()> = Box::new(move || on_sub_done(&state));
    match start_sub(method, &queue, &conn, &params, &config, continuation) {
        Ok(sub) => {
            rc.borrow_mut().sub = Some(sub);
            Ok(())
        }
        Err(e) if e.negotiation_retryable() => {
            warn!(method = method.name(), error = %e, "method failed to start, trying next");
            rc.borrow_mut().error_save = Some(e);
            advance(rc)
        }
        Err(e) => Err(e),
    }
}

fn on_sub_done<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<EngineInner<S>>>) {
    let (sub, method, queue, conn) = {
        let mut s = rc.borrow_mut();
        (s.sub.take(), s.current, s.queue.clone(), s.conn.clone())
    };
    let Some(sub) = sub else {
        engine_finish(
            rc,
            Err(AuthError::Protocol("attempt finished twice".into())),
        );
        return;
    };
    let Some(method) = method else {
        engine_finish(rc, Err(AuthError::Protocol("attempt without a method".into())));
        return;
    };
    match sub_result(sub, &queue, &conn) {
        Ok(()) => {
            info!(method = method.name(), "authenticated");
            engine_finish(rc, Ok(method));
        }
        Err(e) if e.negotiation_retryable() => {
            warn!(method = method.name(), error = %e, "method failed, trying next");
            rc.borrow_mut().error_save = Some(e);
            if let Err(e) = advance(rc) {
                engine_finish(rc, Err(e));
            }
        }
        Err(e) => engine_finish(rc, Err(e)),
    }
}

fn read_giveup_ack<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<EngineInner<S>>>,
) -> Result<()> {
    let accept = {
        let s = rc.borrow();
        let mut ch = s.conn.borrow_mut();
        ch.recv_i32()?
    };
    if accept != AuthCode::NoError.code() {
        return Err(AuthError::Protocol(format!(
            "peer answered giveup with code {accept}"
        )));
    }
    let err = {
        let mut s = rc.borrow_mut();
        let error_save = s.error_save.take();
        giveup_error(s.server_methods, s.candidates, error_save)
    };
    engine_finish(rc, Err(err));
    Ok(())
}
