//! Protocol constants and wire-level types
//!
//! Everything both sides of the authentication dialogue agree on lives here:
//! the closed method set and its wire codes, the acceptance/verdict codes,
//! identity roles, and the size limits of the fixed protocol blobs.

use std::fmt;

/// Upper bound on the peer's advertised method-code blob.
pub const METHODS_BUFFER_LIMIT: usize = 256;

/// Shared secret material sizes.
pub const SHARED_KEY_LEN: usize = 16;
pub const CHALLENGE_LEN: usize = 32;
pub const RESPONSE_LEN: usize = 32;

/// Key-type tags sent at the top of each shared-secret round.
pub const KEY_TYPE_GIVEUP: i32 = 0;
pub const KEY_TYPE_HMAC_SHA256: i32 = 1;

/// Bounds for SASL traffic.
pub const SASL_MECHANISM_LIST_LIMIT: usize = 1024;
pub const SASL_BUFFER_LIMIT: usize = 65536;

/// Bound for usernames on the wire.
pub const USERNAME_LIMIT: usize = 1024;

/// Fixed usernames assumed by host-role peers.
pub const SPOOL_HOST_USERNAME: &str = "_meshfs_spool";
pub const METADATA_HOST_USERNAME: &str = "_meshfs_meta";

/// The closed set of authentication methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Sentinel: the client has no more candidates to offer.
    None,
    SharedSecret,
    TlsSharedSecret,
    TlsClientCert,
    Sasl,
    SaslAuth,
}

impl AuthMethod {
    /// Client preference order for negotiation.
    pub const PREFERENCE: [AuthMethod; 5] = [
        AuthMethod::SharedSecret,
        AuthMethod::TlsSharedSecret,
        AuthMethod::TlsClientCert,
        AuthMethod::Sasl,
        AuthMethod::SaslAuth,
    ];

    pub fn code(self) -> i32 {
        match self {
            AuthMethod::None => 0,
            AuthMethod::SharedSecret => 1,
            AuthMethod::TlsSharedSecret => 2,
            AuthMethod::TlsClientCert => 3,
            AuthMethod::Sasl => 4,
            AuthMethod::SaslAuth => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<AuthMethod> {
        match code {
            0 => Some(AuthMethod::None),
            1 => Some(AuthMethod::SharedSecret),
            2 => Some(AuthMethod::TlsSharedSecret),
            3 => Some(AuthMethod::TlsClientCert),
            4 => Some(AuthMethod::Sasl),
            5 => Some(AuthMethod::SaslAuth),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::SharedSecret => "sharedsecret",
            AuthMethod::TlsSharedSecret => "tls_sharedsecret",
            AuthMethod::TlsClientCert => "tls_client_certificate",
            AuthMethod::Sasl => "sasl",
            AuthMethod::SaslAuth => "sasl_auth",
        }
    }

    pub fn from_name(name: &str) -> Option<AuthMethod> {
        AuthMethod::PREFERENCE
            .iter()
            .copied()
            .find(|m| m.name() == name)
    }

    fn bit(self) -> u32 {
        1 << self.code()
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of authentication methods. The `None` sentinel is never a member.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSet(u32);

impl MethodSet {
    pub const EMPTY: MethodSet = MethodSet(0);

    pub fn all() -> MethodSet {
        let mut s = MethodSet::EMPTY;
        for m in AuthMethod::PREFERENCE {
            s.insert(m);
        }
        s
    }

    pub fn insert(&mut self, method: AuthMethod) {
        if method != AuthMethod::None {
            self.0 |= method.bit();
        }
    }

    pub fn contains(self, method: AuthMethod) -> bool {
        method != AuthMethod::None && self.0 & method.bit() != 0
    }

    pub fn intersect(self, other: MethodSet) -> MethodSet {
        MethodSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = AuthMethod::PREFERENCE
            .iter()
            .filter(|m| self.contains(**m))
            .map(|m| m.name())
            .collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Acceptance and verdict codes exchanged on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthCode {
    NoError,
    Denied,
    NotSupported,
    InvalidCredential,
    Expired,
    ResourceUnavailable,
    TemporaryFailure,
}

impl AuthCode {
    pub fn code(self) -> i32 {
        match self {
            AuthCode::NoError => 0,
            AuthCode::Denied => 1,
            AuthCode::NotSupported => 2,
            AuthCode::InvalidCredential => 3,
            AuthCode::Expired => 4,
            AuthCode::ResourceUnavailable => 5,
            AuthCode::TemporaryFailure => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<AuthCode> {
        match code {
            0 => Some(AuthCode::NoError),
            1 => Some(AuthCode::Denied),
            2 => Some(AuthCode::NotSupported),
            3 => Some(AuthCode::InvalidCredential),
            4 => Some(AuthCode::Expired),
            5 => Some(AuthCode::ResourceUnavailable),
            6 => Some(AuthCode::TemporaryFailure),
            _ => None,
        }
    }
}

/// Identity roles a peer may authenticate as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdRole {
    Unknown,
    User,
    SpoolHost,
    MetadataHost,
}

impl IdRole {
    pub fn code(self) -> i32 {
        match self {
            IdRole::Unknown => 0,
            IdRole::User => 1,
            IdRole::SpoolHost => 2,
            IdRole::MetadataHost => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<IdRole> {
        match code {
            0 => Some(IdRole::Unknown),
            1 => Some(IdRole::User),
            2 => Some(IdRole::SpoolHost),
            3 => Some(IdRole::MetadataHost),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IdRole::Unknown => "unknown",
            IdRole::User => "user",
            IdRole::SpoolHost => "spool-host",
            IdRole::MetadataHost => "metadata-host",
        }
    }
}

/// SASL conversation step codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaslStep {
    Continue,
    Done,
    Error,
}

impl SaslStep {
    pub fn code(self) -> i32 {
        match self {
            SaslStep::Continue => 0,
            SaslStep::Done => 1,
            SaslStep::Error => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<SaslStep> {
        match code {
            0 => Some(SaslStep::Continue),
            1 => Some(SaslStep::Done),
            2 => Some(SaslStep::Error),
            _ => None,
        }
    }
}

/// Leading request of the TLS client-certificate method.
pub const TLS_CERT_REQUEST_GIVEUP: i32 = 0;
pub const TLS_CERT_REQUEST_CLIENT_ROLE: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_codes_round_trip() {
        for m in AuthMethod::PREFERENCE {
            assert_eq!(AuthMethod::from_code(m.code()), Some(m));
            assert_eq!(AuthMethod::from_name(m.name()), Some(m));
        }
        assert_eq!(AuthMethod::from_code(0), Some(AuthMethod::None));
        assert_eq!(AuthMethod::from_code(99), None);
    }

    #[test]
    fn method_set_operations() {
        let mut a = MethodSet::EMPTY;
        a.insert(AuthMethod::SharedSecret);
        a.insert(AuthMethod::Sasl);
        a.insert(AuthMethod::None); // sentinel never joins
        let mut b = MethodSet::EMPTY;
        b.insert(AuthMethod::Sasl);
        b.insert(AuthMethod::TlsClientCert);
        let both = a.intersect(b);
        assert!(both.contains(AuthMethod::Sasl));
        assert!(!both.contains(AuthMethod::SharedSecret));
        assert!(!both.contains(AuthMethod::None));
        assert!(MethodSet::EMPTY.is_empty());
        assert!(!MethodSet::all().is_empty());
    }
}
