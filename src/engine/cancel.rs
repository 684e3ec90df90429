use std::sync::Arc;

use tokio::sync::watch;

use crate::error::EvalError;

/// Cooperative cancellation signal shared between a run and its supervisor.
///
/// Cancellation is sticky: once cancelled, a token stays cancelled. A new run
/// needs a new token.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<watch::Sender<bool>>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // the sender lives as long as `self`, so this can't fail
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub(crate) fn check(&self) -> Result<(), EvalError> {
        match self.is_cancelled() {
            true => Err(EvalError::Cancelled),
            false => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        token.cancel();
        waiter.await.unwrap();

        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(EvalError::Cancelled)));

        // already cancelled tokens resolve immediately
        token.cancelled().await;
    }
}
