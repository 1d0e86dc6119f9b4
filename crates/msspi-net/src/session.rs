//! TLS session over an engine and a transport.

use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use msspi_types::backend::NetworkStream;
use msspi_types::config::HandshakeConfig;
use msspi_types::error::{MsspiError, Result};
use msspi_types::tls::{Certificate, CipherInfo, ProtocolVersion};

use crate::bridge::{self, Conduit};
use crate::engine::{Engine, EngineProvider, Role, Step};
use crate::lifetime::{EngineHandle, TokenGuard};

/// Hostname installed on server sessions. Engines require one even though a
/// server never verifies it.
pub const SERVER_PLACEHOLDER_NAME: &CStr = c"srv";

/// Session lifecycle.
///
/// `Created -> Handshaking -> Established -> ShuttingDown -> Closed`, with
/// `Errored` entered whenever the engine raises its error bit. `Errored` and
/// `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Handshaking,
    Established,
    ShuttingDown,
    Closed,
    Errored,
}

/// One TLS connection: an engine session plus the transport it talks through.
///
/// The engine reaches the transport only through the bridge callbacks, keyed
/// by this session's registry token. Dropping the session releases both the
/// engine and the token; [`close`](Session::close) additionally closes the
/// transport.
pub struct Session<E: Engine> {
    // Field order is drop order: the engine goes before its token.
    engine: EngineHandle<E>,
    token: TokenGuard,
    conduit: Arc<Mutex<Conduit>>,
    role: Role,
    state: SessionState,
    handshake: HandshakeConfig,
}

impl<E: Engine> Session<E> {
    /// Create a client session.
    ///
    /// A non-empty `hostname` is handed to the engine for server name
    /// verification. Only the first of `certificates` is installed.
    pub fn client<P>(
        provider: &P,
        stream: Box<dyn NetworkStream>,
        certificates: &[Certificate],
        hostname: &str,
    ) -> Result<Self>
    where
        P: EngineProvider<Engine = E>,
    {
        let hostname = CString::new(hostname)
            .map_err(|_| MsspiError::Config("hostname contains a NUL byte".to_string()))?;

        let mut session = Self::open(provider, stream, Role::Client)?;
        let engine = session.engine_mut()?;
        engine.set_client();
        if !hostname.as_bytes().is_empty() && !engine.set_hostname(&hostname) {
            return Err(MsspiError::Engine("client msspi_set_hostname() failed".to_string()));
        }
        session.install_certificate(certificates)?;
        Ok(session)
    }

    /// Create a server session.
    ///
    /// Only the first of `certificates` is installed. With
    /// `require_client_auth` the handshake fails unless the client presents
    /// a certificate.
    pub fn server<P>(
        provider: &P,
        stream: Box<dyn NetworkStream>,
        certificates: &[Certificate],
        require_client_auth: bool,
    ) -> Result<Self>
    where
        P: EngineProvider<Engine = E>,
    {
        let mut session = Self::open(provider, stream, Role::Server)?;
        let engine = session.engine_mut()?;
        if require_client_auth && !engine.set_peer_auth(true) {
            return Err(MsspiError::Engine("server msspi_set_peerauth() failed".to_string()));
        }
        if !engine.set_hostname(SERVER_PLACEHOLDER_NAME) {
            return Err(MsspiError::Engine("server msspi_set_hostname() failed".to_string()));
        }
        session.install_certificate(certificates)?;
        Ok(session)
    }

    fn open<P>(provider: &P, stream: Box<dyn NetworkStream>, role: Role) -> Result<Self>
    where
        P: EngineProvider<Engine = E>,
    {
        let conduit = Arc::new(Mutex::new(Conduit::new(stream)));
        let token = TokenGuard::register(Arc::clone(&conduit));
        let engine = provider
            .open(bridge::link(token.token()))
            .ok_or_else(|| MsspiError::Engine(format!("{role} msspi_open() failed")))?;
        log::debug!("Opened {role} session (token {})", token.token().get());
        Ok(Self {
            engine: EngineHandle::new(engine),
            token,
            conduit,
            role,
            state: SessionState::Created,
            handshake: HandshakeConfig::default(),
        })
    }

    fn install_certificate(&mut self, certificates: &[Certificate]) -> Result<()> {
        let Some(first) = certificates.first() else {
            return Ok(());
        };
        if first.is_empty() {
            return Err(MsspiError::Certificate("empty identity certificate".to_string()));
        }
        let role = self.role;
        if !self.engine_mut()?.add_certificate(first.as_der()) {
            return Err(MsspiError::Certificate(format!("{role} msspi_add_mycert() failed")));
        }
        Ok(())
    }

    /// Replace the handshake retry and backoff policy.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake = config;
        self
    }

    fn engine_mut(&mut self) -> Result<&mut E> {
        self.engine.get_mut().ok_or(MsspiError::Closed)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn token(&self) -> crate::registry::Token {
        self.token.token()
    }

    /// Most specific recorded transport error: read, then write, then
    /// [`MsspiError::Closed`].
    fn take_transport_error(&self) -> MsspiError {
        let mut conduit = bridge::lock(&self.conduit);
        conduit
            .take_read_error()
            .or_else(|| conduit.take_write_error())
            .unwrap_or(MsspiError::Closed)
    }

    fn fail_handshake(&mut self, err: MsspiError) -> MsspiError {
        self.state = SessionState::Errored;
        log::warn!("{} handshake failed: {err}", self.role);
        err
    }

    /// Drive the handshake to completion.
    ///
    /// Deadlines come from the transport. A step that moves no bytes and
    /// ends with a recorded transport timeout is retried at most
    /// `timeout_retries` times before the handshake fails with that timeout.
    /// An idle step (no bytes, no error) sleeps with a growing backoff.
    pub fn handshake(&mut self) -> Result<()> {
        match self.state {
            SessionState::Established => return Ok(()),
            SessionState::Created | SessionState::Handshaking => {},
            _ => return Err(MsspiError::Closed),
        }
        self.state = SessionState::Handshaking;

        let role = self.role;
        let mut timeouts = 0u32;
        let mut backoff = self.handshake.backoff();
        loop {
            let before = bridge::lock(&self.conduit).traffic();
            let engine = self.engine_mut()?;
            let step = match role {
                Role::Client => engine.connect(),
                Role::Server => engine.accept(),
            };
            let errored = engine.state().is_error();

            match step {
                Step::Done if !errored => {
                    self.state = SessionState::Established;
                    {
                        let mut conduit = bridge::lock(&self.conduit);
                        conduit.take_read_error();
                        conduit.take_write_error();
                    }
                    let info = self.cipher_info();
                    match info.protocol_version() {
                        Some(version) => log::info!(
                            "{} handshake complete: {version}, suite {:#06x}",
                            self.role,
                            info.cipher_suite
                        ),
                        None => log::info!(
                            "{} handshake complete: protocol {:#x}, suite {:#06x}",
                            self.role,
                            info.protocol,
                            info.cipher_suite
                        ),
                    }
                    return Ok(());
                },
                Step::InProgress if !errored => {
                    let (progressed, timeout) = {
                        let mut conduit = bridge::lock(&self.conduit);
                        (conduit.traffic() != before, conduit.take_timeout())
                    };
                    if progressed {
                        timeouts = 0;
                        backoff = self.handshake.backoff();
                        continue;
                    }
                    if let Some(err) = timeout {
                        timeouts += 1;
                        if timeouts > self.handshake.timeout_retries {
                            return Err(self.fail_handshake(err));
                        }
                        continue;
                    }
                    thread::sleep(backoff);
                    backoff = self.handshake.next_backoff(backoff);
                },
                _ => {
                    let err = self.take_transport_error();
                    return Err(self.fail_handshake(err));
                },
            }
        }
    }

    /// Run the handshake if it has not completed yet, as the engine would
    /// inside its own read or write.
    fn ensure_handshake(&mut self) -> Result<()> {
        match self.state {
            SessionState::Created | SessionState::Handshaking => self.handshake(),
            _ => Ok(()),
        }
    }

    /// Read decrypted bytes, completing the handshake first if needed.
    ///
    /// `Ok(0)` means nothing was available and no error was recorded. A peer
    /// close_notify surfaces as [`MsspiError::Eof`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if matches!(self.state, SessionState::Closed | SessionState::Errored) {
            return Err(MsspiError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_handshake()?;
        let engine = self.engine_mut()?;
        let n = engine.read(buf);
        let engine_state = engine.state();
        if n > 0 {
            return Ok((n as usize).min(buf.len()));
        }

        if engine_state.is_error() {
            self.state = SessionState::Errored;
        }
        if let Some(err) = bridge::lock(&self.conduit).take_read_error() {
            return Err(err);
        }
        if engine_state.received_shutdown() {
            return Err(MsspiError::Eof);
        }
        if engine_state.is_error() {
            return Err(MsspiError::Closed);
        }
        Ok(0)
    }

    /// Write all of `data`, completing the handshake first if needed.
    ///
    /// The engine may accept fewer bytes per call, so this loops until it
    /// either takes everything or stops accepting. A partial write reports
    /// how much was accepted along with the recorded transport error.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if matches!(
            self.state,
            SessionState::ShuttingDown | SessionState::Closed | SessionState::Errored
        ) {
            return Err(MsspiError::Closed);
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.ensure_handshake()?;
        let engine = self.engine_mut()?;
        let mut written = 0;
        while written < data.len() {
            let n = engine.write(&data[written..]);
            if n <= 0 {
                break;
            }
            written += (n as usize).min(data.len() - written);
        }
        if engine.state().is_error() {
            self.state = SessionState::Errored;
        }

        if written == data.len() {
            return Ok(written);
        }
        let source = bridge::lock(&self.conduit)
            .take_write_error()
            .unwrap_or(MsspiError::Closed);
        Err(MsspiError::ShortWrite {
            written,
            source: Box::new(source),
        })
    }

    /// Send close_notify without closing the transport.
    ///
    /// Succeeds only when the engine is healthy and a close_notify has been
    /// sent or received.
    pub fn shutdown(&mut self) -> Result<()> {
        let engine = self.engine_mut()?;
        engine.shutdown();
        let engine_state = engine.state();
        if engine_state.is_error() || self.state == SessionState::Errored {
            self.state = SessionState::Errored;
            return Err(MsspiError::Closed);
        }
        if !engine_state.shutdown_exchanged() {
            return Err(MsspiError::Closed);
        }
        self.state = SessionState::ShuttingDown;
        Ok(())
    }

    /// Shut down the engine, close the transport and release everything.
    ///
    /// The transport's close error, if any, is returned after the engine and
    /// token have been released. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if let Some(engine) = self.engine.get_mut() {
            engine.shutdown();
        }
        self.token.release();
        let result = bridge::lock(&self.conduit).close();
        self.engine.release();
        self.state = SessionState::Closed;
        log::debug!("Closed {} session", self.role);
        if let Err(e) = &result {
            log::warn!("{} transport close failed: {e}", self.role);
        }
        result
    }

    fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Negotiated protocol flags and suite. Empty unless established.
    pub fn cipher_info(&self) -> CipherInfo {
        match self.engine.get() {
            Some(engine) if self.is_established() => engine.cipher_info(),
            _ => CipherInfo::default(),
        }
    }

    /// Engine protocol flags, truncated to 16 bits. Zero before the handshake.
    pub fn version_tls(&self) -> u16 {
        (self.cipher_info().protocol & 0xFFFF) as u16
    }

    /// IANA cipher suite number. Zero before the handshake.
    pub fn cipher_suite(&self) -> u16 {
        (self.cipher_info().cipher_suite & 0xFFFF) as u16
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.cipher_info().protocol_version()
    }

    /// Certificates presented by the peer, leaf first. Empty when the peer
    /// sent none or the session is not established.
    pub fn peer_certificates(&self) -> Vec<Certificate> {
        match self.engine.get() {
            Some(engine) if self.is_established() => {
                collect_certificates(|out, count| engine.peer_certificates(out, count))
            },
            _ => Vec::new(),
        }
    }

    /// The peer's chain as validated by the engine. Empty unless the engine
    /// verifies it.
    pub fn verified_chains(&mut self) -> Vec<Certificate> {
        if !self.is_established() {
            return Vec::new();
        }
        let Some(engine) = self.engine.get_mut() else {
            return Vec::new();
        };
        if !engine.verify() {
            log::debug!("{} peer chain not verified", self.role);
            return Vec::new();
        }
        let engine = &*engine;
        collect_certificates(|out, count| engine.peer_chain(out, count))
    }
}

/// Run a two-phase certificate query and copy the results out.
fn collect_certificates<'a, F>(mut query: F) -> Vec<Certificate>
where
    F: FnMut(Option<&mut [&'a [u8]]>, &mut usize) -> bool,
{
    let mut count = 0;
    if !query(None, &mut count) || count == 0 {
        return Vec::new();
    }
    let empty: &'a [u8] = &[];
    let mut slots = vec![empty; count];
    if !query(Some(slots.as_mut_slice()), &mut count) {
        return Vec::new();
    }
    slots
        .iter()
        .take(count)
        .map(|der| Certificate::from_der(*der))
        .collect()
}

impl<E: Engine> NetworkStream for Session<E> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Session::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Session::write(self, data)
    }

    fn close(&mut self) -> Result<()> {
        Session::close(self)
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            log::debug!("Dropping unclosed {} session", self.role);
        }
        self.engine.release();
        self.token.release();
    }
}

impl<E: Engine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("token", &self.token.token().get())
            .field("engine_released", &self.engine.is_released())
            .finish()
    }
}
