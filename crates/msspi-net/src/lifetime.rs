//! At-most-once release of engine handles and registry tokens.
//!
//! Both guards can be released explicitly (from `Session::close`) and are
//! released again on drop; the second release is a no-op.

use std::sync::{Arc, Mutex};

use crate::bridge::Conduit;
use crate::engine::Engine;
use crate::registry::{self, Token};

/// Owns an open engine session until it is closed.
pub struct EngineHandle<E: Engine> {
    engine: Option<E>,
}

impl<E: Engine> EngineHandle<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    /// `None` once released.
    pub fn get(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut E> {
        self.engine.as_mut()
    }

    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    /// Close the engine. Returns `false` if it was already closed.
    pub fn release(&mut self) -> bool {
        match self.engine.take() {
            Some(mut engine) => {
                engine.close();
                log::debug!("Engine session closed");
                true
            },
            None => false,
        }
    }
}

impl<E: Engine> Drop for EngineHandle<E> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Keeps a conduit registered for as long as the guard lives.
#[derive(Debug)]
pub struct TokenGuard {
    token: Token,
    released: bool,
}

impl TokenGuard {
    pub fn register(conduit: Arc<Mutex<Conduit>>) -> Self {
        Self {
            token: registry::register(conduit),
            released: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Unregister the token. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        registry::release(self.token)
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.release();
    }
}
