//! Cooperative cancellation.
//!
//! A `CancelToken` is checked at the operation boundaries where giving up
//! is still safe: before a statement reaches the WAL it aborts cleanly;
//! between WAL append and commit the transaction aborts at the next
//! checkpoint; once a durability flush has started, cancellation is
//! ignored and the caller observes completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, VaultError};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Bail out with `Canceled` if the token was triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(VaultError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_canceled());
        assert!(matches!(token.check(), Err(VaultError::Canceled)));
    }
}
