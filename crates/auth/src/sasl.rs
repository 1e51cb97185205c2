//! SASL mechanism seam
//!
//! The negotiation code never speaks a concrete mechanism itself; it drives
//! a [`SaslClientSession`] or [`SaslServerSession`] obtained from the
//! injected [`SaslProvider`]. PLAIN ships in-crate; richer mechanisms plug
//! in through the same traits.

use std::rc::Rc;

use tracing::warn;

use crate::error::{AuthError, Result};

pub const MECHANISM_PLAIN: &str = "PLAIN";

#[derive(Clone)]
pub struct SaslCredentials {
    pub user: String,
    pub password: String,
    /// Authorization identity, when different from the authentication one.
    pub authzid: Option<String>,
}

pub trait SaslClientSession {
    fn mechanism(&self) -> &str;
    /// Data to piggyback on the mechanism announcement, if the mechanism
    /// starts the conversation.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;
    /// Answer one server challenge.
    fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;
}

pub enum ServerStep {
    /// Send this challenge and wait for the client's answer.
    Continue(Vec<u8>),
    /// The conversation finished; the client authenticated as `authid`.
    Done { authid: String },
}

pub trait SaslServerSession {
    fn mechanism(&self) -> &str;
    fn step(&mut self, response: &[u8]) -> Result<ServerStep>;
}

pub trait SaslProvider {
    /// Mechanism names this side can offer, preferred first.
    fn mechanisms(&self) -> Vec<String>;
    fn start_client(
        &self,
        mechanism: &str,
        credentials: &SaslCredentials,
    ) -> Result<Box<dyn SaslClientSession>>;
    fn start_server(&self, mechanism: &str) -> Result<Box<dyn SaslServerSession>>;
}

pub type PasswordCheck = Rc<dyn Fn(&str, &str) -> bool>;

/// In-crate PLAIN. The server flavor verifies passwords through an injected
/// check; the client flavor only needs credentials at session start.
pub struct PlainProvider {
    validator: Option<PasswordCheck>,
}

impl PlainProvider {
    pub fn client() -> PlainProvider {
        PlainProvider { validator: None }
    }

    pub fn server(validator: PasswordCheck) -> PlainProvider {
        PlainProvider {
            validator: Some(validator),
        }
    }
}

impl SaslProvider for PlainProvider {
    fn mechanisms(&self) -> Vec<String> {
        vec![MECHANISM_PLAIN.to_string()]
    }

    fn start_client(
        &self,
        mechanism: &str,
        credentials: &SaslCredentials,
    ) -> Result<Box<dyn SaslClientSession>> {
        if mechanism != MECHANISM_PLAIN {
            warn!(mechanism, "mechanism not provided here");
            return Err(AuthError::Authentication);
        }
        Ok(Box::new(PlainClient {
            credentials: credentials.clone(),
        }))
    }

    fn start_server(&self, mechanism: &str) -> Result<Box<dyn SaslServerSession>> {
        if mechanism != MECHANISM_PLAIN {
            warn!(mechanism, "mechanism not provided here");
            return Err(AuthError::Authentication);
        }
        let validator = self.validator.clone().ok_or_else(|| {
            warn!("PLAIN server session requested without a password check");
            AuthError::Authentication
        })?;
        Ok(Box::new(PlainServer { validator }))
    }
}

struct PlainClient {
    credentials: SaslCredentials,
}

impl SaslClientSession for PlainClient {
    fn mechanism(&self) -> &str {
        MECHANISM_PLAIN
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        let authzid = self.credentials.authzid.as_deref().unwrap_or("");
        let mut buf = Vec::new();
        buf.extend_from_slice(authzid.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.credentials.user.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.credentials.password.as_bytes());
        Ok(Some(buf))
    }

    fn step(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        warn!("PLAIN expects no server challenge");
        Err(AuthError::Authentication)
    }
}

struct PlainServer {
    validator: PasswordCheck,
}

impl SaslServerSession for PlainServer {
    fn mechanism(&self) -> &str {
        MECHANISM_PLAIN
    }

    fn step(&mut self, response: &[u8]) -> Result<ServerStep> {
        let mut fields = response.splitn(3, |b| *b == 0);
        let (authzid, user, password) = match (fields.next(), fields.next(), fields.next()) {
            (Some(z), Some(u), Some(p)) => (z, u, p),
            _ => {
                warn!("malformed PLAIN response");
                return Err(AuthError::Authentication);
            }
        };
        let authzid = std::str::from_utf8(authzid).map_err(|_| AuthError::Authentication)?;
        let user = std::str::from_utf8(user).map_err(|_| AuthError::Authentication)?;
        let password = std::str::from_utf8(password).map_err(|_| AuthError::Authentication)?;
        if user.is_empty() || !(self.validator)(user, password) {
            warn!(user, "PLAIN password check failed");
            return Err(AuthError::Authentication);
        }
        let authid = if authzid.is_empty() { user } else { authzid };
        Ok(ServerStep::Done {
            authid: authid.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(user: &str, password: &str) -> SaslCredentials {
        SaslCredentials {
            user: user.to_string(),
            password: password.to_string(),
            authzid: None,
        }
    }

    #[test]
    fn plain_conversation_succeeds() {
        let provider = PlainProvider::server(Rc::new(|user: &str, password: &str| {
            user == "alice" && password == "sesame"
        }));
        let mut client = PlainProvider::client()
            .start_client(MECHANISM_PLAIN, &credentials("alice", "sesame"))
            .unwrap();
        let initial = client.initial_response().unwrap().unwrap();
        let mut server = provider.start_server(MECHANISM_PLAIN).unwrap();
        match server.step(&initial).unwrap() {
            ServerStep::Done { authid } => assert_eq!(authid, "alice"),
            ServerStep::Continue(_) => panic!("PLAIN finished in one step"),
        }
    }

    #[test]
    fn plain_rejects_bad_password() {
        let provider = PlainProvider::server(Rc::new(|_: &str, _: &str| false));
        let mut client = PlainProvider::client()
            .start_client(MECHANISM_PLAIN, &credentials("alice", "wrong"))
            .unwrap();
        let initial = client.initial_response().unwrap().unwrap();
        let mut server = provider.start_server(MECHANISM_PLAIN).unwrap();
        assert!(matches!(
            server.step(&initial),
            Err(AuthError::Authentication)
        ));
    }

    #[test]
    fn authzid_overrides_authid() {
        let provider =
            PlainProvider::server(Rc::new(|user: &str, password: &str| {
                user == "alice" && password == "sesame"
            }));
        let mut creds = credentials("alice", "sesame");
        creds.authzid = Some("ops".to_string());
        let mut client = PlainProvider::client()
            .start_client(MECHANISM_PLAIN, &creds)
            .unwrap();
        let initial = client.initial_response().unwrap().unwrap();
        let mut server = provider.start_server(MECHANISM_PLAIN).unwrap();
        match server.step(&initial).unwrap() {
            ServerStep::Done { authid } => assert_eq!(authid, "ops"),
            ServerStep::Continue(_) => panic!("PLAIN finished in one step"),
        }
    }

    #[test]
    fn unknown_mechanism_is_refused() {
        assert!(PlainProvider::client()
            .start_client("SCRAM-SHA-256", &credentials("a", "b"))
            .is_err());
    }
}
