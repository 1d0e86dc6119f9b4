//! TLS provider abstraction and session metadata.
//!
//! Engines supply a [`TlsProvider`] that wraps a plain [`NetworkStream`] in a
//! TLS session. Code that only needs an encrypted stream depends on this
//! trait and never on a concrete engine.

use std::fmt;

use crate::backend::NetworkStream;
use crate::error::Result;

/// Provides TLS client connections.
pub trait TlsProvider: Send + Sync {
    /// Wrap `stream` in a TLS client session, performing the handshake.
    ///
    /// `server_name` is used for SNI and certificate verification.
    fn connect_tls(
        &self,
        stream: Box<dyn NetworkStream>,
        server_name: &str,
    ) -> Result<Box<dyn NetworkStream>>;
}

/// A DER-encoded X.509 certificate. The bytes are never parsed here.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self(der.into())
    }

    pub fn as_der(&self) -> &[u8] {
        &self.0
    }

    pub fn into_der(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({} bytes)", self.0.len())
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Certificate {
    fn from(der: Vec<u8>) -> Self {
        Self(der)
    }
}

/// SChannel `SP_PROT_*` protocol flags, as reported in cipher info.
pub mod sp_prot {
    pub const TLS1_0_SERVER: u32 = 0x0000_0040;
    pub const TLS1_0_CLIENT: u32 = 0x0000_0080;
    pub const TLS1_1_SERVER: u32 = 0x0000_0100;
    pub const TLS1_1_CLIENT: u32 = 0x0000_0200;
    pub const TLS1_2_SERVER: u32 = 0x0000_0400;
    pub const TLS1_2_CLIENT: u32 = 0x0000_0800;
    pub const TLS1_3_SERVER: u32 = 0x0000_1000;
    pub const TLS1_3_CLIENT: u32 = 0x0000_2000;

    pub const TLS1_0: u32 = TLS1_0_SERVER | TLS1_0_CLIENT;
    pub const TLS1_1: u32 = TLS1_1_SERVER | TLS1_1_CLIENT;
    pub const TLS1_2: u32 = TLS1_2_SERVER | TLS1_2_CLIENT;
    pub const TLS1_3: u32 = TLS1_3_SERVER | TLS1_3_CLIENT;
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum ProtocolVersion {
    Tls10 = 0x0301,
    Tls11 = 0x0302,
    Tls12 = 0x0303,
    Tls13 = 0x0304,
}

impl ProtocolVersion {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tls10 => "TLS 1.0",
            Self::Tls11 => "TLS 1.1",
            Self::Tls12 => "TLS 1.2",
            Self::Tls13 => "TLS 1.3",
        }
    }

    /// Wire value (e.g. `0x0303` for TLS 1.2).
    pub fn wire(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Negotiated protocol and cipher suite.
///
/// `protocol` carries the engine's `SP_PROT_*` flags and `cipher_suite` the
/// IANA suite number. Both are zero until a handshake succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CipherInfo {
    pub protocol: u32,
    pub cipher_suite: u32,
}

impl CipherInfo {
    /// Map the engine's protocol flags to a TLS version.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        let p = self.protocol;
        if p & sp_prot::TLS1_3 != 0 {
            Some(ProtocolVersion::Tls13)
        } else if p & sp_prot::TLS1_2 != 0 {
            Some(ProtocolVersion::Tls12)
        } else if p & sp_prot::TLS1_1 != 0 {
            Some(ProtocolVersion::Tls11)
        } else if p & sp_prot::TLS1_0 != 0 {
            Some(ProtocolVersion::Tls10)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.protocol == 0 && self.cipher_suite == 0
    }
}
