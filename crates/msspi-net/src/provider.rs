//! [`TlsProvider`] implementation over any engine provider.

use msspi_types::backend::NetworkStream;
use msspi_types::config::HandshakeConfig;
use msspi_types::error::Result;
use msspi_types::tls::{Certificate, TlsProvider};

use crate::engine::EngineProvider;
use crate::session::Session;

/// Wraps plain streams in handshaken client sessions.
pub struct MsspiTlsProvider<P> {
    engines: P,
    certificates: Vec<Certificate>,
    handshake: HandshakeConfig,
}

impl<P: EngineProvider> MsspiTlsProvider<P> {
    pub fn new(engines: P) -> Self {
        Self {
            engines,
            certificates: Vec::new(),
            handshake: HandshakeConfig::default(),
        }
    }

    /// Client identity presented to servers that ask for one.
    pub fn with_certificates(mut self, certificates: Vec<Certificate>) -> Self {
        self.certificates = certificates;
        self
    }

    pub fn with_handshake_config(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn engines(&self) -> &P {
        &self.engines
    }
}

impl<P> TlsProvider for MsspiTlsProvider<P>
where
    P: EngineProvider + Send + Sync,
    P::Engine: 'static,
{
    fn connect_tls(
        &self,
        stream: Box<dyn NetworkStream>,
        server_name: &str,
    ) -> Result<Box<dyn NetworkStream>> {
        let mut session = Session::client(&self.engines, stream, &self.certificates, server_name)?
            .with_handshake_config(self.handshake);
        session.handshake()?;
        Ok(Box::new(session))
    }
}
