//! Caller scopes.
//!
//! A [`CallerScope`] stands for the lifetime of whatever issued a request
//! (a view, a connection, a task). It is checked once, synchronously, before
//! an operation is dispatched; nothing downstream keeps a reference to it.

use beacon_core::{BeaconError, Result};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CallerScope {
    token: CancellationToken,
}

impl CallerScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the caller as gone. Invalidates every child scope too.
    pub fn invalidate(&self) {
        self.token.cancel();
    }

    pub fn is_valid(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// A scope that ends with this one but can also be invalidated on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Returns [`BeaconError::StaleCaller`] once the scope has been invalidated.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(BeaconError::StaleCaller)
        }
    }

    /// Resolves when the scope is invalidated.
    pub async fn invalidated(&self) {
        self.token.cancelled().await
    }
}
