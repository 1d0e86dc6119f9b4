//! Transport trait definitions.
//!
//! Sessions never talk to sockets directly. Every byte that reaches the
//! network goes through a [`NetworkStream`], so callers decide how the
//! connection is dialed and which deadlines apply.

use crate::error::Result;

/// A bidirectional byte stream (TCP connection or a TLS session on top of one).
///
/// `read` returning `Ok(0)` means no data is available right now. End of
/// stream and deadline expiry are reported as errors
/// ([`MsspiError::Eof`](crate::error::MsspiError::Eof) and a timeout, see
/// [`MsspiError::is_timeout`](crate::error::MsspiError::is_timeout)).
pub trait NetworkStream: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, data: &[u8]) -> Result<usize>;
    fn close(&mut self) -> Result<()>;
}
