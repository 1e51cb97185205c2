//! Authentication configuration
//!
//! All policy lives in an [`AuthConfig`] value the caller threads into every
//! entry point; there is no process-global context. The serde-facing
//! [`AuthSettings`] mirrors the plain-data knobs for loading from a config
//! file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use serde::Deserialize;

use wire::TlsSettings;

use crate::error::{AuthError, Result};
use crate::keyfile::{DEFAULT_KEY_PERIOD, KEY_FILE_BASENAME};
use crate::proto::{AuthMethod, MethodSet};
use crate::sasl::{SaslCredentials, SaslProvider};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_MAX: u32 = 2;

#[derive(Clone)]
pub struct AuthConfig {
    /// Per-protocol-step timeout for the multiplexed engines.
    pub timeout: Duration,
    /// Shared-secret tries before giving up.
    pub retry_max: u32,
    /// Lifetime of freshly minted shared keys.
    pub key_period: Duration,
    /// Explicit key file location; defaults to `<home>/.meshfs_shared_key`.
    pub key_file: Option<PathBuf>,
    pub home: Option<PathBuf>,
    /// Methods enabled when no per-host override matches.
    pub default_methods: MethodSet,
    /// Per-host overrides, first exact hostname match wins.
    pub host_methods: Vec<(String, MethodSet)>,
    /// When set, only this SASL mechanism may be used.
    pub sasl_mechanism: Option<String>,
    pub sasl_user: Option<String>,
    pub sasl_password: Option<String>,
    pub sasl_provider: Option<Rc<dyn SaslProvider>>,
    pub tls: Option<TlsSettings>,
    /// Present the proxy certificate chain for the client-certificate method.
    pub tls_proxy_certificate: bool,
    /// Policy for matching peer certificates against expected identities;
    /// defaults to the common-name check.
    pub identity_check: Option<Rc<dyn wire::IdentityCheck>>,
}

impl Default for AuthConfig {
    fn default() -> AuthConfig {
        AuthConfig {
            timeout: DEFAULT_TIMEOUT,
            retry_max: DEFAULT_RETRY_MAX,
            key_period: DEFAULT_KEY_PERIOD,
            key_file: None,
            home: None,
            default_methods: MethodSet::all(),
            host_methods: Vec::new(),
            sasl_mechanism: None,
            sasl_user: None,
            sasl_password: None,
            sasl_provider: None,
            tls: None,
            tls_proxy_certificate: false,
            identity_check: None,
        }
    }
}

impl AuthConfig {
    pub fn new() -> AuthConfig {
        AuthConfig::default()
    }

    /// The method set enabled for a peer host.
    pub fn enabled_for(&self, hostname: &str) -> MethodSet {
        self.host_methods
            .iter()
            .find(|(host, _)| host == hostname)
            .map(|(_, methods)| *methods)
            .unwrap_or(self.default_methods)
    }

    pub fn key_file_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.key_file {
            return Ok(path.clone());
        }
        self.home
            .as_ref()
            .map(|home| home.join(KEY_FILE_BASENAME))
            .ok_or_else(|| AuthError::Credential("no key file location configured".into()))
    }

    pub fn sasl_credentials(&self) -> Result<SaslCredentials> {
        match (&self.sasl_user, &self.sasl_password) {
            (Some(user), Some(password)) => Ok(SaslCredentials {
                user: user.clone(),
                password: password.clone(),
                authzid: None,
            }),
            _ => {
                Err(AuthError::Credential("no SASL credentials configured".into()))
            }
        }
    }

    pub fn identity_checker(&self) -> &dyn wire::IdentityCheck {
        match &self.identity_check {
            Some(check) => check.as_ref(),
            None => &wire::CommonNameCheck,
        }
    }

    /// Whether this side can attempt `method` at all, before asking the peer.
    pub fn method_available(&self, method: AuthMethod) -> bool {
        match method {
            AuthMethod::None => false,
            AuthMethod::SharedSecret => true,
            AuthMethod::TlsSharedSecret => self.tls.is_some(),
            AuthMethod::TlsClientCert => {
                self.tls.as_ref().is_some_and(|t| t.has_identity())
            }
            AuthMethod::Sasl | AuthMethod::SaslAuth => {
                self.tls.is_some() && self.sasl_provider.is_some()
            }
        }
    }

    pub fn available_methods(&self) -> MethodSet {
        let mut set = MethodSet::EMPTY;
        for m in AuthMethod::PREFERENCE {
            if self.method_available(m) {
                set.insert(m);
            }
        }
        set
    }
}

fn parse_methods(names: &[String]) -> Result<MethodSet> {
    let mut set = MethodSet::EMPTY;
    for name in names {
        let method = AuthMethod::from_name(name).ok_or_else(|| {
            AuthError::Protocol(format!("unknown authentication method \"{name}\""))
        })?;
        set.insert(method);
    }
    Ok(set)
}

/// Plain-data configuration as read from a config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSettings {
    pub timeout_secs: Option<u64>,
    pub retry_max: Option<u32>,
    pub key_period_secs: Option<u64>,
    pub key_file: Option<PathBuf>,
    pub enabled_methods: Option<Vec<String>>,
    pub host_methods: Option<HashMap<String, Vec<String>>>,
    pub sasl_mechanism: Option<String>,
    pub sasl_user: Option<String>,
    pub sasl_password: Option<String>,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_proxy_certificate: Option<bool>,
}

impl AuthConfig {
    /// Build a runtime config from file settings. TLS material is loaded
    /// here; SASL providers and home directories are wired up by the caller.
    pub fn from_settings(settings: AuthSettings) -> Result<AuthConfig> {
        let mut config = AuthConfig::new();
        if let Some(secs) = settings.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retry_max) = settings.retry_max {
            config.retry_max = retry_max;
        }
        if let Some(secs) = settings.key_period_secs {
            config.key_period = Duration::from_secs(secs);
        }
        config.key_file = settings.key_file;
        if let Some(names) = &settings.enabled_methods {
            config.default_methods = parse_methods(names)?;
        }
        if let Some(hosts) = &settings.host_methods {
            for (host, names) in hosts {
                config
                    .host_methods
                    .push((host.clone(), parse_methods(names)?));
            }
        }
        config.sasl_mechanism = settings.sasl_mechanism;
        config.sasl_user = settings.sasl_user;
        config.sasl_password = settings.sasl_password;
        config.tls_proxy_certificate = settings.tls_proxy_certificate.unwrap_or(false);
        if let Some(ca) = &settings.tls_ca_file {
            let mut tls = TlsSettings::load(ca)?;
            if let (Some(cert), Some(key)) = (&settings.tls_cert_file, &settings.tls_key_file) {
                tls = tls.with_identity_files(cert, key)?;
            }
            config.tls = Some(tls);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_host_override_beats_default() {
        let mut config = AuthConfig::new();
        let mut only_secret = MethodSet::EMPTY;
        only_secret.insert(AuthMethod::SharedSecret);
        config.host_methods.push(("fs1.example".to_string(), only_secret));
        assert_eq!(config.enabled_for("fs1.example"), only_secret);
        assert_eq!(config.enabled_for("fs2.example"), MethodSet::all());
    }

    #[test]
    fn tls_methods_need_tls_settings() {
        let config = AuthConfig::new();
        assert!(config.method_available(AuthMethod::SharedSecret));
        assert!(!config.method_available(AuthMethod::TlsSharedSecret));
        assert!(!config.method_available(AuthMethod::Sasl));
        assert!(!config.method_available(AuthMethod::None));
    }

    #[test]
    fn settings_parse_method_names() {
        let settings = AuthSettings {
            enabled_methods: Some(vec![
                "sharedsecret".to_string(),
                "tls_client_certificate".to_string(),
            ]),
            ..AuthSettings::default()
        };
        let config = AuthConfig::from_settings(settings).unwrap();
        assert!(config.default_methods.contains(AuthMethod::SharedSecret));
        assert!(config.default_methods.contains(AuthMethod::TlsClientCert));
        assert!(!config.default_methods.contains(AuthMethod::Sasl));

        let bad = AuthSettings {
            enabled_methods: Some(vec!["kerberos5".to_string()]),
            ..AuthSettings::default()
        };
        assert!(AuthConfig::from_settings(bad).is_err());
    }
}
