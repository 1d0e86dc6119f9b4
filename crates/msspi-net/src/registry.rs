//! Process-wide token registry.
//!
//! Engines only ever see an integer token. Callbacks turn it back into the
//! session's [`Conduit`] here, so no Rust object address crosses the C
//! boundary and a token that outlives its session simply stops resolving.

use std::collections::HashMap;
use std::ffi::c_void;
use std::num::NonZeroU64;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::bridge::Conduit;

/// Next token to hand out. Tokens are never reused.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

static CONDUITS: OnceLock<Mutex<HashMap<u64, Arc<Mutex<Conduit>>>>> = OnceLock::new();

fn conduits() -> MutexGuard<'static, HashMap<u64, Arc<Mutex<Conduit>>>> {
    CONDUITS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Opaque session identifier passed to engines as their callback argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroU64);

impl Token {
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// The token as the engine's `void *` callback argument.
    pub fn as_ptr(self) -> *mut c_void {
        ptr::without_provenance_mut(self.0.get() as usize)
    }

    /// Recover a token from a callback argument. Null is never a token.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonZeroU64::new(ptr.addr() as u64).map(Self)
    }
}

/// Register a conduit under a fresh token.
pub fn register(conduit: Arc<Mutex<Conduit>>) -> Token {
    let id = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    let token = Token(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN));
    conduits().insert(token.get(), conduit);
    log::trace!("Registered token {id}");
    token
}

/// Look up a token. Stale or unknown tokens yield `None`.
pub fn resolve(token: Token) -> Option<Arc<Mutex<Conduit>>> {
    conduits().get(&token.get()).cloned()
}

/// Unregister a token. Returns `false` if it was already gone.
pub fn release(token: Token) -> bool {
    let removed = conduits().remove(&token.get()).is_some();
    if removed {
        log::trace!("Released token {}", token.get());
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedStream;

    fn conduit() -> Arc<Mutex<Conduit>> {
        Arc::new(Mutex::new(Conduit::new(Box::new(ScriptedStream::new()))))
    }

    #[test]
    fn register_then_resolve() {
        let c = conduit();
        let token = register(Arc::clone(&c));
        let found = resolve(token).expect("registered token resolves");
        assert!(Arc::ptr_eq(&found, &c));
        assert!(release(token));
    }

    #[test]
    fn tokens_are_unique() {
        let a = register(conduit());
        let b = register(conduit());
        assert_ne!(a, b);
        release(a);
        release(b);
    }

    #[test]
    fn release_is_idempotent() {
        let token = register(conduit());
        assert!(release(token));
        assert!(!release(token));
        assert!(resolve(token).is_none());
    }

    #[test]
    fn pointer_roundtrip() {
        let token = register(conduit());
        let ptr = token.as_ptr();
        assert!(!ptr.is_null());
        assert_eq!(Token::from_ptr(ptr), Some(token));
        release(token);
    }

    #[test]
    fn null_pointer_is_not_a_token() {
        assert_eq!(Token::from_ptr(ptr::null_mut()), None);
    }

    #[test]
    fn unknown_token_does_not_resolve() {
        let token = Token(NonZeroU64::new(u64::MAX).unwrap());
        assert!(resolve(token).is_none());
    }
}
