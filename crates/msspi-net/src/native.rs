//! Binding to the msspi C library.
//!
//! Enabled by the `native` feature. On Windows msspi wraps SChannel; on
//! Linux `msspi-capix` wraps a CryptoPro-compatible CAPI. See `build.rs` for
//! the link setup.

use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::slice;

use msspi_types::tls::CipherInfo;

use crate::engine::{
    BridgeLink, Engine, EngineProvider, EngineState, ReadCallback, Step, WriteCallback, clamp_len,
};

/// `msspi_verify` result for a valid chain.
const MSSPI_VERIFY_OK: c_uint = 0;

/// Leading fields of SChannel's `SecPkgContext_CipherInfo`. Only read
/// through the pointer msspi returns, never allocated here.
#[repr(C)]
#[allow(dead_code)]
struct RawCipherInfo {
    version: u32,
    protocol: u32,
    cipher_suite: u32,
    base_cipher_suite: u32,
}

#[cfg_attr(windows, link(name = "msspi"))]
#[cfg_attr(not(windows), link(name = "msspi-capix"))]
unsafe extern "C" {
    fn msspi_open(arg: *mut c_void, read: ReadCallback, write: WriteCallback) -> *mut c_void;
    fn msspi_set_client(h: *mut c_void) -> c_char;
    fn msspi_set_hostname(h: *mut c_void, hostname: *const c_char) -> c_char;
    fn msspi_add_mycert(h: *mut c_void, cert: *const c_char, len: c_int) -> c_char;
    fn msspi_set_peerauth(h: *mut c_void, is_peerauth: c_char) -> c_char;
    fn msspi_connect(h: *mut c_void) -> c_int;
    fn msspi_accept(h: *mut c_void) -> c_int;
    fn msspi_read(h: *mut c_void, buf: *mut c_void, len: c_int) -> c_int;
    fn msspi_write(h: *mut c_void, buf: *const c_void, len: c_int) -> c_int;
    fn msspi_shutdown(h: *mut c_void) -> c_int;
    fn msspi_state(h: *mut c_void) -> c_int;
    fn msspi_get_cipherinfo(h: *mut c_void) -> *const RawCipherInfo;
    fn msspi_get_peercerts(
        h: *mut c_void,
        bufs: *mut *const c_char,
        lens: *mut c_int,
        count: *mut usize,
    ) -> c_char;
    fn msspi_get_peerchain(
        h: *mut c_void,
        online: c_char,
        bufs: *mut *const c_char,
        lens: *mut c_int,
        count: *mut usize,
    ) -> c_char;
    fn msspi_verify(h: *mut c_void) -> c_uint;
    fn msspi_close(h: *mut c_void);
}

/// Opens msspi sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeProvider;

impl EngineProvider for NativeProvider {
    type Engine = NativeEngine;

    fn open(&self, link: BridgeLink) -> Option<NativeEngine> {
        // SAFETY: the callbacks match msspi's callback ABI and `link.token`
        // is only ever handed back to them.
        let handle = unsafe { msspi_open(link.token, link.read, link.write) };
        NonNull::new(handle).map(|handle| NativeEngine {
            handle: Some(handle),
        })
    }
}

/// One `MSSPI_HANDLE`.
#[derive(Debug)]
pub struct NativeEngine {
    handle: Option<NonNull<c_void>>,
}

// SAFETY: an msspi handle is not tied to the thread that opened it, and all
// access goes through `&mut self` or `&self` on the owning session.
unsafe impl Send for NativeEngine {}

/// Signature shared by `msspi_get_peercerts` and `msspi_get_peerchain`.
type CertQuery<'q> = &'q dyn Fn(*mut *const c_char, *mut c_int, *mut usize) -> c_char;

impl NativeEngine {
    fn raw(&self) -> Option<*mut c_void> {
        self.handle.map(NonNull::as_ptr)
    }

    fn certificates<'a>(
        &'a self,
        out: Option<&mut [&'a [u8]]>,
        count: &mut usize,
        query: CertQuery<'_>,
    ) -> bool {
        let Some(slots) = out else {
            let mut n = 0;
            let ok = query(ptr::null_mut(), ptr::null_mut(), &mut n);
            *count = n;
            return ok != 0;
        };
        if slots.is_empty() {
            return false;
        }

        let mut bufs: Vec<*const c_char> = vec![ptr::null(); slots.len()];
        let mut lens: Vec<c_int> = vec![0; slots.len()];
        let mut n = slots.len();
        if query(bufs.as_mut_ptr(), lens.as_mut_ptr(), &mut n) == 0 {
            return false;
        }

        let n = n.min(slots.len());
        for ((slot, buf), len) in slots.iter_mut().zip(&bufs).zip(&lens).take(n) {
            let len = usize::try_from(*len).unwrap_or(0);
            *slot = if buf.is_null() || len == 0 {
                Default::default()
            } else {
                // SAFETY: msspi keeps the certificate buffers alive until the
                // next call on this handle, which cannot happen while `self`
                // is borrowed for 'a.
                unsafe { slice::from_raw_parts(buf.cast::<u8>(), len) }
            };
        }
        *count = n;
        true
    }
}

impl Engine for NativeEngine {
    fn set_client(&mut self) {
        if let Some(h) = self.raw() {
            // SAFETY: `h` is a live handle.
            unsafe { msspi_set_client(h) };
        }
    }

    fn set_hostname(&mut self, name: &CStr) -> bool {
        let Some(h) = self.raw() else { return false };
        // SAFETY: `h` is live and `name` is NUL-terminated; msspi copies it.
        unsafe { msspi_set_hostname(h, name.as_ptr()) != 0 }
    }

    fn add_certificate(&mut self, der: &[u8]) -> bool {
        let Some(h) = self.raw() else { return false };
        let Ok(len) = c_int::try_from(der.len()) else {
            return false;
        };
        // SAFETY: `der` is valid for `len` bytes; msspi copies it.
        unsafe { msspi_add_mycert(h, der.as_ptr().cast(), len) == 1 }
    }

    fn set_peer_auth(&mut self, required: bool) -> bool {
        let Some(h) = self.raw() else { return false };
        // SAFETY: `h` is a live handle.
        unsafe { msspi_set_peerauth(h, c_char::from(required)) != 0 }
    }

    fn connect(&mut self) -> Step {
        let Some(h) = self.raw() else {
            return Step::Failed;
        };
        // SAFETY: `h` is a live handle; I/O happens through the bridge.
        Step::from_raw(unsafe { msspi_connect(h) })
    }

    fn accept(&mut self) -> Step {
        let Some(h) = self.raw() else {
            return Step::Failed;
        };
        // SAFETY: as in `connect`.
        Step::from_raw(unsafe { msspi_accept(h) })
    }

    fn read(&mut self, buf: &mut [u8]) -> c_int {
        let Some(h) = self.raw() else { return 0 };
        let len = clamp_len(buf.len());
        // SAFETY: `buf` is valid for writes of `len` bytes.
        unsafe { msspi_read(h, buf.as_mut_ptr().cast(), len) }
    }

    fn write(&mut self, data: &[u8]) -> c_int {
        let Some(h) = self.raw() else { return 0 };
        let len = clamp_len(data.len());
        // SAFETY: `data` is valid for reads of `len` bytes.
        unsafe { msspi_write(h, data.as_ptr().cast(), len) }
    }

    fn shutdown(&mut self) {
        if let Some(h) = self.raw() {
            // SAFETY: `h` is a live handle.
            unsafe { msspi_shutdown(h) };
        }
    }

    fn state(&self) -> EngineState {
        let Some(h) = self.raw() else {
            return EngineState(EngineState::ERROR);
        };
        // SAFETY: `h` is a live handle.
        EngineState(unsafe { msspi_state(h) } as u32)
    }

    fn cipher_info(&self) -> CipherInfo {
        let Some(h) = self.raw() else {
            return CipherInfo::default();
        };
        // SAFETY: `h` is live; the returned struct is owned by the handle.
        let info = unsafe { msspi_get_cipherinfo(h).as_ref() };
        info.map_or_else(CipherInfo::default, |info| CipherInfo {
            protocol: info.protocol,
            cipher_suite: info.cipher_suite,
        })
    }

    fn peer_certificates<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool {
        let Some(h) = self.raw() else { return false };
        // SAFETY: `h` is live; buffer arguments come from `certificates`.
        let query = |bufs: *mut *const c_char, lens: *mut c_int, n: *mut usize| unsafe {
            msspi_get_peercerts(h, bufs, lens, n)
        };
        self.certificates(out, count, &query)
    }

    fn verify(&mut self) -> bool {
        let Some(h) = self.raw() else { return false };
        // SAFETY: `h` is a live handle.
        unsafe { msspi_verify(h) == MSSPI_VERIFY_OK }
    }

    fn peer_chain<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool {
        let Some(h) = self.raw() else { return false };
        // SAFETY: as in `peer_certificates`; `online = 0` skips revocation
        // fetches.
        let query = |bufs: *mut *const c_char, lens: *mut c_int, n: *mut usize| unsafe {
            msspi_get_peerchain(h, 0, bufs, lens, n)
        };
        self.certificates(out, count, &query)
    }

    fn close(&mut self) {
        if let Some(h) = self.handle.take() {
            // SAFETY: `h` is live and dropped from `self`, so it is closed
            // exactly once.
            unsafe { msspi_close(h.as_ptr()) };
        }
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        self.close();
    }
}
