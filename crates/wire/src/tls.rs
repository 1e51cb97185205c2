//! In-place TLS for the wire channel
//!
//! The TLS implementation itself is wrapped, not reimplemented: rustls runs
//! the protocol and the channel drives it over its blocking socket. A channel
//! starts in cleartext, can be upgraded with [`Channel::tls_initiate`] /
//! [`Channel::tls_accept`], downgraded back to cleartext once a TLS-protected
//! exchange is over, or reset best-effort on a failure path.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::channel::{Channel, Transport};
use crate::error::{Result, WireError};

pub(crate) enum TlsSession {
    Client(ClientConnection),
    Server(ServerConnection),
}

pub(crate) struct TlsState<S> {
    pub(crate) sock: S,
    pub(crate) session: TlsSession,
}

impl<S: Read + Write> TlsState<S> {
    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match &mut self.session {
            TlsSession::Client(c) => rustls::Stream::new(c, &mut self.sock).read_exact(buf),
            TlsSession::Server(c) => rustls::Stream::new(c, &mut self.sock).read_exact(buf),
        }
    }

    pub(crate) fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.session {
            TlsSession::Client(c) => rustls::Stream::new(c, &mut self.sock).write_all(buf),
            TlsSession::Server(c) => rustls::Stream::new(c, &mut self.sock).write_all(buf),
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match &mut self.session {
            TlsSession::Client(c) => rustls::Stream::new(c, &mut self.sock).flush(),
            TlsSession::Server(c) => rustls::Stream::new(c, &mut self.sock).flush(),
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match &self.session {
            TlsSession::Client(c) => c.peer_certificates(),
            TlsSession::Server(c) => c.peer_certificates(),
        }
    }
}

/// Which identity, if any, the client presents during the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientAuth {
    None,
    Certificate,
    /// Present the proxy certificate chain when one is configured, falling
    /// back to the regular identity otherwise.
    ProxyCertificate,
}

struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for Identity {
    fn clone(&self) -> Identity {
        Identity {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Certificate material for one side of a connection: trusted roots plus an
/// optional local identity (and an optional proxy identity for delegated
/// credentials).
#[derive(Clone)]
pub struct TlsSettings {
    roots: RootCertStore,
    identity: Option<Identity>,
    proxy_identity: Option<Identity>,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut rd).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(WireError::Certificate(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut rd)?.ok_or_else(|| {
        WireError::Certificate(format!("no private key found in {}", path.display()))
    })
}

impl TlsSettings {
    pub fn new(roots: Vec<CertificateDer<'static>>) -> Result<TlsSettings> {
        let mut store = RootCertStore::empty();
        for cert in roots {
            store.add(cert)?;
        }
        Ok(TlsSettings {
            roots: store,
            identity: None,
            proxy_identity: None,
        })
    }

    /// Load the trusted roots from a PEM bundle.
    pub fn load(ca_file: &Path) -> Result<TlsSettings> {
        TlsSettings::new(load_certs(ca_file)?)
    }

    pub fn with_identity(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> TlsSettings {
        self.identity = Some(Identity { chain, key });
        self
    }

    pub fn with_identity_files(self, cert_file: &Path, key_file: &Path) -> Result<TlsSettings> {
        let chain = load_certs(cert_file)?;
        let key = load_key(key_file)?;
        Ok(self.with_identity(chain, key))
    }

    pub fn with_proxy_identity(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> TlsSettings {
        self.proxy_identity = Some(Identity { chain, key });
        self
    }

    /// Whether a local certificate identity is configured.
    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    fn identity_for(&self, auth: ClientAuth) -> Option<&Identity> {
        match auth {
            ClientAuth::None => None,
            ClientAuth::Certificate => self.identity.as_ref(),
            ClientAuth::ProxyCertificate => self.proxy_identity.as_ref().or(self.identity.as_ref()),
        }
    }

    fn client_config(&self, auth: ClientAuth) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder().with_root_certificates(self.roots.clone());
        let config = match auth {
            ClientAuth::None => builder.with_no_client_auth(),
            _ => {
                let id = self.identity_for(auth).ok_or_else(|| {
                    WireError::Certificate("no client certificate configured".into())
                })?;
                builder.with_client_auth_cert(id.chain.clone(), id.key.clone_key())?
            }
        };
        Ok(Arc::new(config))
    }

    fn server_config(&self, request_client_cert: bool) -> Result<Arc<ServerConfig>> {
        let id = self
            .identity
            .as_ref()
            .ok_or_else(|| WireError::Certificate("no server certificate configured".into()))?;
        let builder = if request_client_cert {
            let verifier = WebPkiClientVerifier::builder(Arc::new(self.roots.clone()))
                .build()
                .map_err(|e| WireError::Certificate(e.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };
        Ok(Arc::new(
            builder.with_single_cert(id.chain.clone(), id.key.clone_key())?,
        ))
    }
}

impl<S: Read + Write + AsRawFd> Channel<S> {
    /// Upgrade the channel with a client-side handshake, run to completion.
    /// On failure the channel stays usable in cleartext.
    pub fn tls_initiate(
        &mut self,
        settings: &TlsSettings,
        server_name: &str,
        auth: ClientAuth,
    ) -> Result<()> {
        if self.is_tls() {
            return Err(WireError::Protocol("TLS session already active".into()));
        }
        let config = settings.client_config(auth)?;
        let name = ServerName::try_from(server_name.to_string())?;
        let mut conn = ClientConnection::new(config, name)?;
        let Transport::Plain(mut sock) = std::mem::replace(&mut self.transport, Transport::Dead)
        else {
            return Err(WireError::Protocol("channel transport is gone".into()));
        };
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut sock) {
                self.transport = Transport::Plain(sock);
                return Err(WireError::Io(e));
            }
        }
        debug!(server_name, "TLS session established");
        self.transport = Transport::Tls(TlsState {
            sock,
            session: TlsSession::Client(conn),
        });
        Ok(())
    }

    /// Upgrade the channel with a server-side handshake.
    pub fn tls_accept(&mut self, settings: &TlsSettings, request_client_cert: bool) -> Result<()> {
        if self.is_tls() {
            return Err(WireError::Protocol("TLS session already active".into()));
        }
        let config = settings.server_config(request_client_cert)?;
        let mut conn = ServerConnection::new(config)?;
        let Transport::Plain(mut sock) = std::mem::replace(&mut self.transport, Transport::Dead)
        else {
            return Err(WireError::Protocol("channel transport is gone".into()));
        };
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut sock) {
                self.transport = Transport::Plain(sock);
                return Err(WireError::Io(e));
            }
        }
        debug!("TLS session accepted");
        self.transport = Transport::Tls(TlsState {
            sock,
            session: TlsSession::Server(conn),
        });
        Ok(())
    }

    /// Drop the TLS session and continue in cleartext on the same socket.
    pub fn tls_downgrade(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.transport, Transport::Dead) {
            Transport::Tls(t) => {
                debug!("TLS session downgraded to cleartext");
                self.transport = Transport::Plain(t.sock);
                Ok(())
            }
            other => {
                self.transport = other;
                Err(WireError::NotTls)
            }
        }
    }

    /// Tear the TLS session down on a failure path: queue close_notify, try
    /// to push it out, then consume records up to the peer's close_notify so
    /// that the cleartext stream resumes at a defined position. Everything is
    /// best-effort; errors end the teardown early. A no-op on a cleartext
    /// channel.
    pub fn tls_reset(&mut self) {
        match std::mem::replace(&mut self.transport, Transport::Dead) {
            Transport::Tls(mut t) => {
                match &mut t.session {
                    TlsSession::Client(c) => {
                        c.send_close_notify();
                        while c.wants_write() {
                            match c.write_tls(&mut t.sock) {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                        drain_peer_close(&mut **c, &mut t.sock);
                    }
                    TlsSession::Server(c) => {
                        c.send_close_notify();
                        while c.wants_write() {
                            match c.write_tls(&mut t.sock) {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                        drain_peer_close(&mut **c, &mut t.sock);
                    }
                }
                self.transport = Transport::Plain(t.sock);
            }
            other => self.transport = other,
        }
    }

    /// The peer's end-entity certificate, when a TLS session holds one.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        match &self.transport {
            Transport::Tls(t) => t.peer_certificates().and_then(|c| c.first()).cloned(),
            _ => None,
        }
    }

    /// Full subject DN of the peer certificate, e.g. `CN=alice, O=meshfs`.
    pub fn peer_subject_dn(&self) -> Result<String> {
        let cert = self
            .peer_certificate()
            .ok_or_else(|| WireError::Certificate("peer presented no certificate".into()))?;
        let (_, parsed) = X509Certificate::from_der(&cert)
            .map_err(|e| WireError::Certificate(format!("malformed peer certificate: {e}")))?;
        Ok(parsed.subject().to_string())
    }

    /// Subject common name of the peer certificate.
    pub fn peer_common_name(&self) -> Result<String> {
        let cert = self
            .peer_certificate()
            .ok_or_else(|| WireError::Certificate("peer presented no certificate".into()))?;
        let (_, parsed) = X509Certificate::from_der(&cert)
            .map_err(|e| WireError::Certificate(format!("malformed peer certificate: {e}")))?;
        let cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        cn.ok_or_else(|| WireError::Certificate("peer certificate has no common name".into()))
    }
}

/// Largest TLS record we accept while tearing a session down.
const TLS_RECORD_LIMIT: usize = 16384 + 2048;
/// Records to inspect before giving up on the peer's close_notify.
const TLS_RESET_RECORD_LIMIT: usize = 16;

/// Consume incoming records up to the peer's close_notify, one record at a
/// time so that nothing past the alert is taken off the socket.
fn drain_peer_close<Data, S: Read>(conn: &mut rustls::ConnectionCommon<Data>, sock: &mut S) {
    // The alert may already sit in the session buffer, coalesced with the
    // last application record.
    match conn.process_new_packets() {
        Ok(state) if state.peer_has_closed() => return,
        Ok(_) => {}
        Err(_) => return,
    }
    for _ in 0..TLS_RESET_RECORD_LIMIT {
        let mut header = [0u8; 5];
        if sock.read_exact(&mut header).is_err() {
            return;
        }
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len > TLS_RECORD_LIMIT {
            return;
        }
        let mut record = vec![0u8; 5 + len];
        record[..5].copy_from_slice(&header);
        if sock.read_exact(&mut record[5..]).is_err() {
            return;
        }
        let mut cursor = io::Cursor::new(&record[..]);
        while (cursor.position() as usize) < record.len() {
            match conn.read_tls(&mut cursor) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
        match conn.process_new_packets() {
            Ok(state) if state.peer_has_closed() => return,
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

/// Decides whether a peer certificate identifies the expected service and
/// host. Injected so deployments and tests can substitute their own policy.
pub trait IdentityCheck {
    fn check_host(&self, service_tag: Option<&str>, hostname: &str, subject_cn: &str)
        -> Result<()>;
}

/// Default policy: the certificate CN must equal the hostname, or
/// `service_tag/hostname` when a service tag is expected.
pub struct CommonNameCheck;

impl IdentityCheck for CommonNameCheck {
    fn check_host(
        &self,
        service_tag: Option<&str>,
        hostname: &str,
        subject_cn: &str,
    ) -> Result<()> {
        let ok = match service_tag {
            Some(tag) => subject_cn == hostname || subject_cn == format!("{tag}/{hostname}"),
            None => subject_cn == hostname,
        };
        if ok {
            Ok(())
        } else {
            Err(WireError::Certificate(format!(
                "certificate CN \"{subject_cn}\" does not match host {hostname}"
            )))
        }
    }
}
