//! Engine capability surface.
//!
//! An engine is one TLS session inside an external implementation. It is
//! opened bound to a [`BridgeLink`] and from then on moves ciphertext only by
//! calling the link's read/write callbacks. The adapter consults it through
//! exactly the operations below.

use std::ffi::{CStr, c_int, c_void};
use std::fmt;

use msspi_types::tls::CipherInfo;

/// Engine-to-transport read callback: fill up to `len` bytes of `buf`.
///
/// Returns the byte count, `0` on end of stream or hard failure, or a
/// negative value when the transport timed out and the engine may retry.
pub type ReadCallback =
    unsafe extern "C" fn(token: *mut c_void, buf: *mut c_void, len: c_int) -> c_int;

/// Engine-to-transport write callback, same return convention as
/// [`ReadCallback`].
pub type WriteCallback =
    unsafe extern "C" fn(token: *mut c_void, buf: *const c_void, len: c_int) -> c_int;

/// What an engine is handed at open time: the opaque token of its session and
/// the two callbacks that resolve it.
#[derive(Clone, Copy)]
pub struct BridgeLink {
    pub token: *mut c_void,
    pub read: ReadCallback,
    pub write: WriteCallback,
}

// SAFETY: `token` is an integer key into the session registry, never an
// address that gets dereferenced, and the callbacks are plain functions.
unsafe impl Send for BridgeLink {}

impl BridgeLink {
    /// Invoke the read callback for engines written in Rust.
    pub fn read(&self, buf: &mut [u8]) -> c_int {
        let len = clamp_len(buf.len());
        // SAFETY: `buf` is valid for writes of `len <= buf.len()` bytes for
        // the duration of the call.
        unsafe { (self.read)(self.token, buf.as_mut_ptr().cast(), len) }
    }

    /// Invoke the write callback for engines written in Rust.
    pub fn write(&self, data: &[u8]) -> c_int {
        let len = clamp_len(data.len());
        // SAFETY: `data` is valid for reads of `len <= data.len()` bytes for
        // the duration of the call.
        unsafe { (self.write)(self.token, data.as_ptr().cast(), len) }
    }
}

impl fmt::Debug for BridgeLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeLink")
            .field("token", &self.token.addr())
            .finish_non_exhaustive()
    }
}

/// Largest buffer length that crosses the C boundary in one call.
pub(crate) fn clamp_len(len: usize) -> c_int {
    c_int::try_from(len).unwrap_or(c_int::MAX)
}

/// Which side of the handshake a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Done,
    Failed,
    InProgress,
}

impl Step {
    /// Decode msspi's `1` / `0` / negative convention.
    pub fn from_raw(code: c_int) -> Self {
        match code {
            1 => Self::Done,
            c if c < 0 => Self::InProgress,
            _ => Self::Failed,
        }
    }
}

/// Engine state bitmask, msspi bit layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineState(pub u32);

impl EngineState {
    pub const READING: u32 = 0x0000_0001;
    pub const WRITING: u32 = 0x0000_0002;
    pub const X509_LOOKUP: u32 = 0x0000_0004;
    pub const SHUTDOWN_PROC: u32 = 0x0000_0008;
    pub const SENT_SHUTDOWN: u32 = 0x0000_0010;
    pub const RECEIVED_SHUTDOWN: u32 = 0x0000_0020;
    pub const LAST_PROC_WRITE: u32 = 0x0000_0040;
    pub const ERROR: u32 = 0x8000_0000;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn received_shutdown(self) -> bool {
        self.contains(Self::RECEIVED_SHUTDOWN)
    }

    /// A close_notify went out or came in.
    pub fn shutdown_exchanged(self) -> bool {
        self.contains(Self::SENT_SHUTDOWN | Self::RECEIVED_SHUTDOWN)
    }
}

/// One TLS session inside an engine.
///
/// `read`/`write` return a byte count, `0` when nothing was transferred and
/// the engine considers the direction finished or failed, and a negative
/// value when the operation should be retried.
pub trait Engine: Send {
    fn set_client(&mut self);

    /// `name` is handed over with its trailing NUL.
    fn set_hostname(&mut self, name: &CStr) -> bool;

    /// Install a DER identity certificate.
    fn add_certificate(&mut self, der: &[u8]) -> bool;

    /// Require (server side) a client certificate.
    fn set_peer_auth(&mut self, required: bool) -> bool;

    fn connect(&mut self) -> Step;
    fn accept(&mut self) -> Step;

    fn read(&mut self, buf: &mut [u8]) -> c_int;
    fn write(&mut self, data: &[u8]) -> c_int;

    /// Send (or acknowledge) close_notify. Idempotent.
    fn shutdown(&mut self);

    fn state(&self) -> EngineState;
    fn cipher_info(&self) -> CipherInfo;

    /// Two-phase peer certificate query.
    ///
    /// With `out == None` only `count` is written. With a buffer of `count`
    /// slots the slots are filled and `count` updated to the number filled.
    /// `false` from either phase means "no certificates".
    fn peer_certificates<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool;

    /// Validate the peer's chain. `true` means verified.
    fn verify(&mut self) -> bool;

    /// Two-phase verified-chain query, same protocol as
    /// [`peer_certificates`](Engine::peer_certificates).
    fn peer_chain<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool;

    /// Free the engine session. Called exactly once by the owner.
    fn close(&mut self);
}

/// Opens engines bound to a bridge link.
pub trait EngineProvider {
    type Engine: Engine;

    /// `None` when the engine could not allocate a session.
    fn open(&self, link: BridgeLink) -> Option<Self::Engine>;
}
