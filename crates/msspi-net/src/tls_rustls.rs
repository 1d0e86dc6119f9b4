//! [`Engine`] backed by rustls + ring.
//!
//! Enabled by the `engine-rustls` feature. The engine never sees the
//! transport: rustls reads and writes ciphertext through the session's
//! bridge callbacks exactly like the native library does, so sessions over
//! this engine exercise the same registry, error recording and handshake
//! driver.

use std::ffi::{CStr, c_int};
use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};

use msspi_types::tls::{CipherInfo, sp_prot};

use crate::engine::{BridgeLink, Engine, EngineProvider, EngineState, Step, clamp_len};

/// Opens rustls engines sharing one trust store and (optionally) one
/// identity key.
pub struct RustlsProvider {
    roots: Arc<RootCertStore>,
    key: Option<PrivateKeyDer<'static>>,
}

impl RustlsProvider {
    /// Trust Mozilla's root CA bundle.
    pub fn new() -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    /// Trust exactly `roots` (servers use it to verify client certificates).
    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
            key: None,
        }
    }

    /// Private key (PKCS#8 DER) matching the certificate later installed on
    /// the session.
    pub fn with_identity_key(mut self, pkcs8_der: Vec<u8>) -> Self {
        self.key = Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8_der)));
        self
    }
}

impl Default for RustlsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineProvider for RustlsProvider {
    type Engine = RustlsEngine;

    fn open(&self, link: BridgeLink) -> Option<RustlsEngine> {
        Some(RustlsEngine {
            link,
            roots: Arc::clone(&self.roots),
            key: self.key.as_ref().map(PrivateKeyDer::clone_key),
            identity: None,
            client: false,
            hostname: None,
            peer_auth: false,
            conn: None,
            error: false,
            sent_shutdown: false,
            received_shutdown: false,
        })
    }
}

/// One rustls connection. The connection object is built on the first
/// handshake step, once role, hostname and identity are known.
pub struct RustlsEngine {
    link: BridgeLink,
    roots: Arc<RootCertStore>,
    key: Option<PrivateKeyDer<'static>>,
    identity: Option<CertificateDer<'static>>,
    client: bool,
    hostname: Option<String>,
    peer_auth: bool,
    conn: Option<Connection>,
    error: bool,
    sent_shutdown: bool,
    received_shutdown: bool,
}

/// Why a flush or pull stopped.
enum Stop {
    Blocked,
    /// The transport reported end of stream.
    Eof,
    Failed,
}

impl RustlsEngine {
    fn build(&self) -> std::result::Result<Connection, String> {
        if self.client {
            let hostname = self
                .hostname
                .clone()
                .ok_or_else(|| "client needs a server name".to_string())?;
            let name = ServerName::try_from(hostname)
                .map_err(|e| format!("invalid server name: {e}"))?;
            let builder = ClientConfig::builder().with_root_certificates(Arc::clone(&self.roots));
            let config = match (&self.identity, &self.key) {
                (Some(cert), Some(key)) => builder
                    .with_client_auth_cert(vec![cert.clone()], key.clone_key())
                    .map_err(|e| format!("client identity: {e}"))?,
                _ => builder.with_no_client_auth(),
            };
            let conn = ClientConnection::new(Arc::new(config), name)
                .map_err(|e| format!("TLS init: {e}"))?;
            Ok(Connection::Client(conn))
        } else {
            let cert = self
                .identity
                .clone()
                .ok_or_else(|| "server needs a certificate".to_string())?;
            let key = self
                .key
                .as_ref()
                .ok_or_else(|| "server needs a private key".to_string())?
                .clone_key();
            let builder = ServerConfig::builder();
            let builder = if self.peer_auth {
                let verifier = WebPkiClientVerifier::builder(Arc::clone(&self.roots))
                    .build()
                    .map_err(|e| format!("client verifier: {e}"))?;
                builder.with_client_cert_verifier(verifier)
            } else {
                builder.with_no_client_auth()
            };
            let config = builder
                .with_single_cert(vec![cert], key)
                .map_err(|e| format!("server identity: {e}"))?;
            let conn =
                ServerConnection::new(Arc::new(config)).map_err(|e| format!("TLS init: {e}"))?;
            Ok(Connection::Server(conn))
        }
    }

    fn step(&mut self) -> Step {
        if self.error {
            return Step::Failed;
        }
        if self.conn.is_none() {
            match self.build() {
                Ok(conn) => self.conn = Some(conn),
                Err(e) => {
                    log::warn!("rustls engine: {e}");
                    self.error = true;
                    return Step::Failed;
                },
            }
        }
        let Some(conn) = self.conn.as_mut() else {
            return Step::Failed;
        };
        let step = drive_handshake(conn, self.link);
        if step == Step::Failed {
            self.error = true;
        }
        step
    }

    fn handshake_done(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.is_handshaking())
    }

    fn fill<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool {
        let Some(certs) = self.conn.as_ref().and_then(|c| c.peer_certificates()) else {
            return false;
        };
        if certs.is_empty() {
            return false;
        }
        match out {
            None => *count = certs.len(),
            Some(slots) => {
                for (slot, cert) in slots.iter_mut().zip(certs) {
                    *slot = cert.as_ref();
                }
                *count = slots.len().min(certs.len());
            },
        }
        true
    }
}

/// Ciphertext I/O through the bridge callbacks.
struct CallbackIo(BridgeLink);

impl Read for CallbackIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            n if n > 0 => Ok(n as usize),
            0 => Ok(0),
            _ => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for CallbackIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.write(buf) {
            n if n > 0 => Ok(n as usize),
            0 => Err(io::ErrorKind::WriteZero.into()),
            _ => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Send everything rustls has queued.
fn flush(conn: &mut Connection, link: BridgeLink) -> std::result::Result<(), Stop> {
    let mut sink = CallbackIo(link);
    while conn.wants_write() {
        match conn.write_tls(&mut sink) {
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(Stop::Blocked),
            Err(e) => {
                log::debug!("rustls write_tls: {e}");
                return Err(Stop::Failed);
            },
        }
    }
    Ok(())
}

/// Pull one batch of ciphertext in and process it.
fn pull(conn: &mut Connection, link: BridgeLink) -> std::result::Result<(), Stop> {
    match conn.read_tls(&mut CallbackIo(link)) {
        Ok(0) => return Err(Stop::Eof),
        Ok(_) => {},
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(Stop::Blocked),
        Err(e) => {
            log::debug!("rustls read_tls: {e}");
            return Err(Stop::Failed);
        },
    }
    if let Err(e) = conn.process_new_packets() {
        log::warn!("rustls: {e}");
        // Best effort: the alert describing the failure.
        let _ = flush(conn, link);
        return Err(Stop::Failed);
    }
    Ok(())
}

fn drive_handshake(conn: &mut Connection, link: BridgeLink) -> Step {
    loop {
        match flush(conn, link) {
            Ok(()) => {},
            Err(Stop::Blocked) => return Step::InProgress,
            Err(Stop::Eof | Stop::Failed) => return Step::Failed,
        }
        if !conn.is_handshaking() {
            return Step::Done;
        }
        match pull(conn, link) {
            Ok(()) => {},
            Err(Stop::Blocked) => return Step::InProgress,
            Err(Stop::Eof | Stop::Failed) => return Step::Failed,
        }
    }
}

/// `SP_PROT_*` flag for a negotiated version, from this side's perspective.
fn protocol_flag(version: rustls::ProtocolVersion, client: bool) -> u32 {
    let (server_flag, client_flag) = match version {
        rustls::ProtocolVersion::TLSv1_3 => (sp_prot::TLS1_3_SERVER, sp_prot::TLS1_3_CLIENT),
        rustls::ProtocolVersion::TLSv1_2 => (sp_prot::TLS1_2_SERVER, sp_prot::TLS1_2_CLIENT),
        rustls::ProtocolVersion::TLSv1_1 => (sp_prot::TLS1_1_SERVER, sp_prot::TLS1_1_CLIENT),
        rustls::ProtocolVersion::TLSv1_0 => (sp_prot::TLS1_0_SERVER, sp_prot::TLS1_0_CLIENT),
        _ => (0, 0),
    };
    if client { client_flag } else { server_flag }
}

impl Engine for RustlsEngine {
    fn set_client(&mut self) {
        self.client = true;
    }

    fn set_hostname(&mut self, name: &CStr) -> bool {
        match name.to_str() {
            Ok(name) => {
                self.hostname = Some(name.to_owned());
                true
            },
            Err(_) => false,
        }
    }

    fn add_certificate(&mut self, der: &[u8]) -> bool {
        if self.key.is_none() {
            log::warn!("rustls engine: certificate supplied without a private key");
            return false;
        }
        self.identity = Some(CertificateDer::from(der.to_vec()));
        true
    }

    fn set_peer_auth(&mut self, required: bool) -> bool {
        self.peer_auth = required;
        true
    }

    fn connect(&mut self) -> Step {
        self.step()
    }

    fn accept(&mut self) -> Step {
        self.step()
    }

    fn read(&mut self, buf: &mut [u8]) -> c_int {
        if self.error || buf.is_empty() {
            return 0;
        }
        let link = self.link;
        let Some(conn) = self.conn.as_mut() else {
            return 0;
        };
        let mut at_eof = false;
        loop {
            match conn.reader().read(buf) {
                Ok(0) => {
                    self.received_shutdown = true;
                    return 0;
                },
                Ok(n) => return clamp_len(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && !at_eof => {},
                Err(e) => {
                    log::debug!("rustls read: {e}");
                    return 0;
                },
            }
            match pull(conn, link) {
                Ok(()) => {},
                Err(Stop::Blocked) => return -1,
                // One more pass lets the reader tell close_notify from truncation.
                Err(Stop::Eof) => at_eof = true,
                Err(Stop::Failed) => {
                    self.error = true;
                    return 0;
                },
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> c_int {
        if self.error || self.sent_shutdown {
            return 0;
        }
        let link = self.link;
        let Some(conn) = self.conn.as_mut() else {
            return 0;
        };
        let n = match conn.writer().write(data) {
            Ok(n) => n,
            Err(e) => {
                log::debug!("rustls write: {e}");
                return 0;
            },
        };
        match flush(conn, link) {
            // Unsent records stay queued and go out with the next flush.
            Ok(()) | Err(Stop::Blocked) => clamp_len(n),
            Err(Stop::Eof | Stop::Failed) => 0,
        }
    }

    fn shutdown(&mut self) {
        if self.sent_shutdown || self.error {
            return;
        }
        let link = self.link;
        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
            self.sent_shutdown = true;
            let _ = flush(conn, link);
        }
    }

    fn state(&self) -> EngineState {
        let mut bits = 0;
        if let Some(conn) = &self.conn {
            if conn.wants_read() {
                bits |= EngineState::READING;
            }
            if conn.wants_write() {
                bits |= EngineState::WRITING;
            }
        }
        if self.sent_shutdown {
            bits |= EngineState::SENT_SHUTDOWN;
        }
        if self.received_shutdown {
            bits |= EngineState::RECEIVED_SHUTDOWN;
        }
        if self.error {
            bits |= EngineState::ERROR;
        }
        EngineState(bits)
    }

    fn cipher_info(&self) -> CipherInfo {
        let Some(conn) = self.conn.as_ref().filter(|c| !c.is_handshaking()) else {
            return CipherInfo::default();
        };
        CipherInfo {
            protocol: conn
                .protocol_version()
                .map_or(0, |v| protocol_flag(v, self.client)),
            cipher_suite: conn
                .negotiated_cipher_suite()
                .map_or(0, |s| u32::from(u16::from(s.suite()))),
        }
    }

    fn peer_certificates<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool {
        self.fill(out, count)
    }

    /// rustls rejects unverifiable peers during the handshake, so a completed
    /// handshake with peer certificates is a verified one.
    fn verify(&mut self) -> bool {
        !self.error
            && self.handshake_done()
            && self
                .conn
                .as_ref()
                .and_then(|c| c.peer_certificates())
                .is_some_and(|certs| !certs.is_empty())
    }

    fn peer_chain<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool {
        self.fill(out, count)
    }

    fn close(&mut self) {
        self.conn = None;
    }
}
