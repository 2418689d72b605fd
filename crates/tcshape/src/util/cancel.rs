//! Cooperative cancellation.
//!
//! Long-running operations (replaying a long event log, listing many
//! qdiscs) check a [`CancelToken`] between event boundaries and bail out
//! with [`Error::Cancelled`] without partial side effects. Netlink writes
//! are not interruptible mid-message; the token is consulted before the
//! next message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// A cheaply-clonable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones observe the flag.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.checkpoint().is_ok());

        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.checkpoint(), Err(Error::Cancelled)));
    }
}
