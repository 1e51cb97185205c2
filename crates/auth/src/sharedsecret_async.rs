//! Multiplexed shared-secret client
//!
//! The same dialogue as the synchronous shared-secret client, cut into
//! states driven by one readable and one writable event on the queue. Every
//! read waits with READ|TIMEOUT so a step either completes or expires.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use reactor::{Event, EventQueue, Filter};
use wire::Channel;

use crate::client::{sharedsecret_final_error, AuthRequestParams};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::keyfile::{self, KeyAccess, SharedKey};
use crate::proto::{AuthCode, CHALLENGE_LEN, KEY_TYPE_GIVEUP, KEY_TYPE_HMAC_SHA256};

#[derive(Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    /// Certificate verdict (under TLS) and username.
    Intro,
    /// Key fetch and key-type announcement for one round.
    Round,
    /// Expire stamp and challenge response.
    Response,
    Giveup,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    /// Server's error code for the round, then its challenge.
    Error,
    /// Verdict for the submitted response.
    Result,
    GiveupAck,
}

pub(crate) struct SharedSecretAuth<S: Read + Write + AsRawFd + 'static> {
    inner: Rc<RefCell<Inner<S>>>,
}

struct Inner<S: Read + Write + AsRawFd + 'static> {
    queue: EventQueue,
    conn: Rc<RefCell<Channel<S>>>,
    config: Rc<AuthConfig>,
    username: String,
    server_cert_ok: Option<bool>,
    readable: Event,
    writable: Event,
    wphase: WritePhase,
    rphase: ReadPhase,
    try_count: u32,
    key: Option<SharedKey>,
    key_error: Option<AuthError>,
    last_code: Option<AuthCode>,
    pending_response: Option<(u32, [u8; 32])>,
    result: Option<Result<()>>,
    continuation: Option<Box<dyn FnOnce()>>,
}

impl<S: Read + Write + AsRawFd + 'static> SharedSecretAuth<S> {
    pub(crate) fn start(
        queue: &EventQueue,
        conn: &Rc<RefCell<Channel<S>>>,
        params: &AuthRequestParams,
        config: &Rc<AuthConfig>,
        server_cert_ok: Option<bool>,
        continuation: Box<dyn FnOnce()>,
    ) -> Result<SharedSecretAuth<S>> {
        let fd = conn.borrow().fd();
        let inner = Rc::new(RefCell::new(Inner {
            queue: queue.clone(),
            conn: conn.clone(),
            config: config.clone(),
            username: params.username.clone(),
            server_cert_ok,
            readable: Event::socket(fd, Filter::READ | Filter::TIMEOUT, |_| {}),
            writable: Event::socket(fd, Filter::WRITE, |_| {}),
            wphase: WritePhase::Intro,
            rphase: ReadPhase::Error,
            try_count: 0,
            key: None,
            key_error: None,
            last_code: None,
            pending_response: None,
            result: None,
            continuation: Some(continuation),
        }));
        let state = inner.clone();
        inner
            .borrow()
            .writable
            .set_callback(move |_mask| on_writable(&state));
        let state = inner.clone();
        inner
            .borrow()
            .readable
            .set_callback(move |mask| on_readable(&state, mask));
        arm_write(&inner)?;
        Ok(SharedSecretAuth { inner })
    }

    /// Collect the outcome once the continuation has fired. The events are
    /// released here.
    pub(crate) fn result(self) -> Result<()> {
        let mut s = self.inner.borrow_mut();
        let _ = s.queue.delete(&s.readable);
        let _ = s.queue.delete(&s.writable);
        // The callbacks hold the state alive through the events; unhook
        // them so everything can be dropped.
        s.readable.set_callback(|_| {});
        s.writable.set_callback(|_| {});
        s.result
            .take()
            .unwrap_or_else(|| Err(AuthError::Protocol("authentication still in progress".into())))
    }
}

fn arm_write<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<Inner<S>>>) -> Result<()> {
    let s = rc.borrow();
    s.queue.add(&s.writable, None)?;
    Ok(())
}

fn arm_read<S: Read + Write + AsRawFd + 'static>(
    rc: &Rc<RefCell<Inner<S>>>,
    phase: ReadPhase,
) -> Result<()> {
    let timeout = rc.borrow().config.timeout;
    rc.borrow_mut().rphase = phase;
    let s = rc.borrow();
    s.queue.add(&s.readable, Some(timeout))?;
    Ok(())
}

fn finish<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<Inner<S>>>, outcome: Result<()>) {
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

fn on_writable<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<Inner<S>>>) {
    if let Err(e) = write_step(rc) {
        finish(rc, Err(e));
    }
}

fn on_readable<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<Inner<S>>>, mask: Filter) {
    if mask.contains(Filter::TIMEOUT) {
        finish(rc, Err(AuthError::TimedOut));
        return;
    }
    if let Err(e) = read_step(rc) {
        finish(rc, Err(e));
    }
}

fn write_step<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<Inner<S>>>) -> Result<()> {
    let phase = rc.borrow().wphase;
    match phase {
        WritePhase::Intro => {
            let cert_ok = rc.borrow().server_cert_ok;
            if let Some(ok) = cert_ok {
                {
                    let s = rc.borrow();
                    let mut ch = s.conn.borrow_mut();
                    ch.send_i32(if ok {
                        AuthCode::NoError.code()
                    } else {
                        AuthCode::InvalidCredential.code()
                    });
                    if !ok {
                        ch.flush()?;
                    }
                }
                if !ok {
                    warn!("rejecting server certificate");
                    finish(rc, Err(AuthError::HostnameMismatch));
                    return Ok(());
                }
            }
            {
                let s = rc.borrow();
                let mut ch = s.conn.borrow_mut();
                let username = s.username.clone();
                ch.send_string(&username);
            }
            rc.borrow_mut().wphase = WritePhase::Round;
            arm_write(rc)
        }
        WritePhase::Round => {
            let (path, access, period) = {
                let mut s = rc.borrow_mut();
                s.try_count += 1;
                let access = if s.try_count == 1 {
                    KeyAccess::Create
                } else {
                    KeyAccess::CreateForce
                };
                (s.config.key_file_path(), access, s.config.key_period)
            };
            let key = path.and_then(|p| keyfile::shared_key_get(&p, access, period));
            match key {
                Ok(k) => {
                    rc.borrow_mut().key = Some(k);
                    {
                        let s = rc.borrow();
                        let mut ch = s.conn.borrow_mut();
                        ch.send_i32(KEY_TYPE_HMAC_SHA256);
                        ch.flush()?;
                    }
                    arm_read(rc, ReadPhase::Error)
                }
                Err(e) => {
                    warn!(error = %e, "shared key unavailable");
                    {
                        let mut s = rc.borrow_mut();
                        s.key_error = Some(e);
                        s.wphase = WritePhase::Giveup;
                    }
                    arm_write(rc)
                }
            }
        }
        WritePhase::Response => {
            let pending = rc.borrow_mut().pending_response.take();
            let Some((expire, response)) = pending else {
                return Err(AuthError::Protocol("no response prepared".into()));
            };
            {
                let s = rc.borrow();
                let mut ch = s.conn.borrow_mut();
                ch.send_u32(expire);
                ch.send_bytes(&response);
                ch.flush()?;
            }
            arm_read(rc, ReadPhase::Result)
        }
        WritePhase::Giveup => {
            {
                let s = rc.borrow();
                let mut ch = s.conn.borrow_mut();
                ch.send_i32(KEY_TYPE_GIVEUP);
                ch.flush()?;
            }
            arm_read(rc, ReadPhase::GiveupAck)
        }
    }
}

fn read_step<S: Read + Write + AsRawFd + 'static>(rc: &Rc<RefCell<Inner<S>>>) -> Result<()> {
    let phase = rc.borrow().rphase;
    match phase {
        ReadPhase::Error => {
            let code = {
                let s = rc.borrow();
                let mut ch = s.conn.borrow_mut();
                ch.recv_i32()?
            };
            if code != AuthCode::NoError.code() {
                let mut s = rc.borrow_mut();
                s.last_code = AuthCode::from_code(code).or(Some(AuthCode::Denied));
                s.wphase = WritePhase::Giveup;
                drop(s);
                return arm_write(rc);
            }
            let pending = {
                let s = rc.borrow();
                let mut ch = s.conn.borrow_mut();
                let challenge = ch.recv_bytes_exact(CHALLENGE_LEN)?;
                let key = s
                    .key
                    .as_ref()
                    .ok_or_else(|| AuthError::Protocol("round started without a key".into()))?;
                (key.expire as u32, keyfile::challenge_response(key, &challenge))
            };
            let (expire, response) = match pending {
                (expire, Ok(response)) => (expire, response),
                (_, Err(e)) => {
                    let mut s = rc.borrow_mut();
                    s.key_error = Some(e);
                    s.wphase = WritePhase::Giveup;
                    drop(s);
                    return arm_write(rc);
                }
            };
            let mut s = rc.borrow_mut();
            s.pending_response = Some((expire, response));
            s.wphase = WritePhase::Response;
            drop(s);
            arm_write(rc)
        }
        ReadPhase::Result => {
            let verdict = {
                let s = rc.borrow();
                let mut ch = s.conn.borrow_mut();
                ch.recv_i32()?
            };
            let (try_count, retry_max) = {
                let s = rc.borrow();
                (s.try_count, s.config.retry_max)
            };
            match AuthCode::from_code(verdict) {
                Some(AuthCode::NoError) => {
                    debug!("shared secret accepted");
                    finish(rc, Ok(()));
                    Ok(())
                }
                Some(AuthCode::Expired) if try_count < retry_max => {
                    debug!("peer reports the key expired, retrying with a fresh one");
                    rc.borrow_mut().wphase = WritePhase::Round;
                    arm_write(rc)
                }
                other => {
                    let mut s = rc.borrow_mut();
                    s.last_code = other.or(Some(AuthCode::Denied));
                    s.wphase = WritePhase::Giveup;
                    drop(s);
                    arm_write(rc)
                }
            }
        }
        ReadPhase::GiveupAck => {
            {
                let s = rc.borrow();
                let mut ch = s.conn.borrow_mut();
                let _ack = ch.recv_i32()?;
            }
            let err = {
                let mut s = rc.borrow_mut();
                sharedsecret_final_error(s.key_error.take(), s.last_code)
            };
            finish(rc, Err(err));
            Ok(())
        }
    }
}
