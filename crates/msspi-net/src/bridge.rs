//! Callback bridge between engines and transports.
//!
//! Engines call [`bridge_read`] and [`bridge_write`] on their own stack
//! whenever they need ciphertext moved, possibly many times per session call.
//! Each invocation resolves its token to the session's [`Conduit`], performs
//! blocking I/O on the transport and records the outcome for the session to
//! surface later.
//!
//! Return convention towards the engine:
//! - `n > 0`: bytes transferred
//! - `-1`: the transport timed out or had nothing ready, retry
//! - `0`: end of stream, hard error, or unknown token, stop

use std::ffi::{c_int, c_void};
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use msspi_types::backend::NetworkStream;
use msspi_types::error::{MsspiError, Result};

use crate::engine::{BridgeLink, clamp_len};
use crate::registry::{self, Token};

/// Returned to the engine when it should retry the transfer.
pub const WOULD_BLOCK: c_int = -1;

/// The transport half of a session, shared with the bridge.
pub struct Conduit {
    stream: Box<dyn NetworkStream>,
    read_error: Option<MsspiError>,
    write_error: Option<MsspiError>,
    /// Reused between reads so the engine's buffer only sees complete data.
    staging: Vec<u8>,
    bytes_read: u64,
    bytes_written: u64,
}

impl Conduit {
    pub fn new(stream: Box<dyn NetworkStream>) -> Self {
        Self {
            stream,
            read_error: None,
            write_error: None,
            staging: Vec::new(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Read up to `dst.len()` bytes from the transport into `dst`.
    pub fn receive(&mut self, dst: &mut [u8]) -> c_int {
        if dst.is_empty() {
            return 0;
        }
        self.staging.resize(dst.len(), 0);
        match self.stream.read(&mut self.staging) {
            Ok(0) => WOULD_BLOCK,
            Ok(n) => {
                let n = n.min(dst.len());
                dst[..n].copy_from_slice(&self.staging[..n]);
                self.read_error = None;
                self.bytes_read += n as u64;
                clamp_len(n)
            },
            Err(e) => record(&mut self.read_error, e),
        }
    }

    /// Write all of `data` to the transport.
    ///
    /// A failure after partial progress reports the progress and leaves the
    /// error recorded for the next call.
    pub fn send(&mut self, data: &[u8]) -> c_int {
        let mut sent = 0;
        while sent < data.len() {
            match self.stream.write(&data[sent..]) {
                Ok(0) if sent == 0 => return WOULD_BLOCK,
                Ok(0) => break,
                Ok(n) => sent += n.min(data.len() - sent),
                Err(e) if sent == 0 => return record(&mut self.write_error, e),
                Err(e) => {
                    record(&mut self.write_error, e);
                    self.bytes_written += sent as u64;
                    return clamp_len(sent);
                },
            }
        }
        self.write_error = None;
        self.bytes_written += sent as u64;
        clamp_len(sent)
    }

    pub fn take_read_error(&mut self) -> Option<MsspiError> {
        self.read_error.take()
    }

    pub fn take_write_error(&mut self) -> Option<MsspiError> {
        self.write_error.take()
    }

    /// Take a recorded timeout from either direction, leaving other errors.
    pub fn take_timeout(&mut self) -> Option<MsspiError> {
        for slot in [&mut self.read_error, &mut self.write_error] {
            if slot.as_ref().is_some_and(MsspiError::is_timeout) {
                return slot.take();
            }
        }
        None
    }

    /// Bytes moved so far as `(read, written)`.
    pub fn traffic(&self) -> (u64, u64) {
        (self.bytes_read, self.bytes_written)
    }

    pub fn close(&mut self) -> Result<()> {
        self.stream.close()
    }
}

/// Store `err` in `slot` and pick the engine-facing return code.
fn record(slot: &mut Option<MsspiError>, err: MsspiError) -> c_int {
    // A stream that stops without close_notify is plain EOF here; whether it
    // landed on a record boundary is the engine's call.
    let err = if err.is_eof() { MsspiError::Eof } else { err };
    let code = if err.is_timeout() { WOULD_BLOCK } else { 0 };
    log::trace!("Transport error ({code}): {err}");
    *slot = Some(err);
    code
}

pub(crate) fn lock(conduit: &Mutex<Conduit>) -> MutexGuard<'_, Conduit> {
    conduit.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lookup(token: *mut c_void) -> Option<Arc<Mutex<Conduit>>> {
    let conduit = Token::from_ptr(token).and_then(registry::resolve);
    if conduit.is_none() {
        log::trace!("Callback for unknown token {:#x}", token.addr());
    }
    conduit
}

/// Engine read callback.
///
/// # Safety
/// `buf` must be valid for writes of `len` bytes (or null).
pub unsafe extern "C" fn bridge_read(token: *mut c_void, buf: *mut c_void, len: c_int) -> c_int {
    let Some(conduit) = lookup(token) else {
        return 0;
    };
    let Ok(len) = usize::try_from(len) else {
        return 0;
    };
    if buf.is_null() || len == 0 {
        return 0;
    }
    // SAFETY: the caller guarantees `buf` is valid for `len` bytes.
    let dst = unsafe { slice::from_raw_parts_mut(buf.cast::<u8>(), len) };
    lock(&conduit).receive(dst)
}

/// Engine write callback.
///
/// # Safety
/// `buf` must be valid for reads of `len` bytes (or null).
pub unsafe extern "C" fn bridge_write(
    token: *mut c_void,
    buf: *const c_void,
    len: c_int,
) -> c_int {
    let Some(conduit) = lookup(token) else {
        return 0;
    };
    let Ok(len) = usize::try_from(len) else {
        return 0;
    };
    if buf.is_null() || len == 0 {
        return 0;
    }
    // SAFETY: the caller guarantees `buf` is valid for `len` bytes.
    let src = unsafe { slice::from_raw_parts(buf.cast::<u8>(), len) };
    lock(&conduit).send(src)
}

/// The link an engine for `token` gets at open time.
pub fn link(token: Token) -> BridgeLink {
    BridgeLink {
        token: token.as_ptr(),
        read: bridge_read,
        write: bridge_write,
    }
}
