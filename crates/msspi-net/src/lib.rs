//! TLS sessions backed by callback-driven engines.
//!
//! A [`Session`] owns one engine handle and one [`NetworkStream`]. The engine
//! never touches the stream directly: whenever it needs ciphertext moved it
//! calls back into [`bridge`], which resolves an opaque token through the
//! [`registry`] and performs the transport I/O on the session's behalf.
//!
//! Engines:
//! - `native` feature: the msspi C library (SChannel / CryptoPro CAPI).
//! - `engine-rustls` feature: rustls, driven through the same callbacks.
//!
//! [`NetworkStream`]: msspi_types::backend::NetworkStream

pub mod bridge;
pub mod engine;
pub mod lifetime;
#[cfg(feature = "native")]
pub mod native;
mod provider;
pub mod registry;
mod session;
mod std_backend;
#[cfg(feature = "engine-rustls")]
pub mod tls_rustls;

pub use engine::{BridgeLink, Engine, EngineProvider, EngineState, Role, Step};
#[cfg(feature = "native")]
pub use native::{NativeEngine, NativeProvider};
pub use provider::MsspiTlsProvider;
pub use session::{SERVER_PLACEHOLDER_NAME, Session, SessionState};
pub use std_backend::StdNetworkStream;
#[cfg(feature = "engine-rustls")]
pub use tls_rustls::{RustlsEngine, RustlsProvider};

pub use msspi_types::backend::NetworkStream;
pub use msspi_types::error::{MsspiError, Result};
pub use msspi_types::tls::{Certificate, CipherInfo, ProtocolVersion, TlsProvider};

#[cfg(test)]
mod mock;
