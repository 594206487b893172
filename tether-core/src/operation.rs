//! Operation - single-fire asynchronous result container
//!
//! An `Operation` represents one in-flight request against the remote
//! service. It finishes exactly once, with success or with a
//! `(kind, message)` failure, and the first outcome always wins. Observers
//! wait on it through [`Operation::wait`]; completion only flips channel
//! state, so an observer is never re-entered from inside the call that
//! completed the operation - it resumes when the scheduler next polls it.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tether_model::{error_kind, OperationError};
use tokio::sync::watch;

#[derive(Clone, Debug)]
enum Outcome {
    Pending,
    Success,
    Failure(OperationError),
}

struct State {
    outcome: Outcome,
    subject: Option<Weak<dyn Any + Send + Sync>>,
}

struct Inner {
    state: Mutex<State>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// A single-fire asynchronous result. Cheap to clone; all clones observe
/// the same completion.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

impl Operation {
    pub fn new() -> Self {
        Self::with_subject(None)
    }

    /// An operation concerning `subject`. The subject is held weakly and
    /// can be retrieved by observers while it is still alive.
    pub fn new_for(subject: Weak<dyn Any + Send + Sync>) -> Self {
        Self::with_subject(Some(subject))
    }

    fn with_subject(subject: Option<Weak<dyn Any + Send + Sync>>) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: Outcome::Pending,
                    subject,
                }),
                done_tx,
                done_rx,
            }),
        }
    }

    /// An operation that has already finished successfully. Notification
    /// is still delivered asynchronously.
    pub fn succeeded() -> Self {
        let op = Self::new();
        op.complete_success();
        op
    }

    /// An operation that has already failed with `error`.
    pub fn failed(error: OperationError) -> Self {
        let op = Self::new();
        op.complete_failure(error);
        op
    }

    /// Record success. A second completion of either flavor is a caller
    /// bug: it is logged loudly and ignored, the first outcome stands.
    pub fn complete_success(&self) {
        self.finish(Outcome::Success);
    }

    /// Record failure. An empty error kind has already been normalized to
    /// [`error_kind::INTERNAL`] by `OperationError`.
    pub fn complete_failure(&self, error: OperationError) {
        self.finish(Outcome::Failure(error));
    }

    fn finish(&self, outcome: Outcome) {
        {
            let Ok(mut state) = self.inner.state.lock() else {
                tracing::error!("operation state poisoned; dropping completion");
                return;
            };
            if !matches!(state.outcome, Outcome::Pending) {
                tracing::warn!(
                    previous = ?state.outcome,
                    attempted = ?outcome,
                    "operation completed twice; keeping the first outcome"
                );
                return;
            }
            state.outcome = outcome;
        }
        self.inner.done_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.done_rx.borrow()
    }

    pub fn is_success(&self) -> bool {
        let Ok(state) = self.inner.state.lock() else {
            return false;
        };
        matches!(state.outcome, Outcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        let Ok(state) = self.inner.state.lock() else {
            return false;
        };
        matches!(state.outcome, Outcome::Failure(_))
    }

    /// The failure, if the operation has finished with one.
    pub fn error(&self) -> Option<OperationError> {
        let Ok(state) = self.inner.state.lock() else {
            return None;
        };
        match &state.outcome {
            Outcome::Failure(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// The object this operation concerns, if one was attached and is
    /// still alive.
    pub fn subject(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        let Ok(state) = self.inner.state.lock() else {
            return None;
        };
        state.subject.as_ref().and_then(Weak::upgrade)
    }

    /// Typed access to the subject.
    pub fn subject_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.subject().and_then(|s| s.downcast::<T>().ok())
    }

    /// Wait for completion. Resolves strictly after the completing call
    /// has returned control to the scheduler; every waiter observes the
    /// completion exactly once.
    pub async fn wait(&self) -> Result<(), OperationError> {
        let mut done = self.inner.done_rx.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            // Sender lives inside Inner, so this is unreachable in
            // practice; surface a failure rather than hanging or lying.
            return Err(OperationError::new(
                error_kind::INTERNAL,
                "operation abandoned before completion",
            ));
        }
        let Ok(state) = self.inner.state.lock() else {
            return Err(OperationError::internal("operation state poisoned"));
        };
        match &state.outcome {
            Outcome::Success => Ok(()),
            Outcome::Failure(err) => Err(err.clone()),
            Outcome::Pending => Err(OperationError::internal(
                "operation notified completion while still pending",
            )),
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.inner.state.lock() {
            Ok(state) => format!("{:?}", state.outcome),
            Err(_) => "<poisoned>".to_string(),
        };
        f.debug_struct("Operation").field("outcome", &outcome).finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let still_pending = self
            .state
            .get_mut()
            .map(|state| matches!(state.outcome, Outcome::Pending))
            .unwrap_or(false);
        if still_pending {
            tracing::warn!("operation dropped while still pending; it will never finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_operation_reports_nothing() {
        let op = Operation::new();
        assert!(!op.is_finished());
        assert!(!op.is_success());
        assert!(!op.is_failure());
        assert!(op.error().is_none());
    }

    #[test]
    fn subject_is_weakly_held() {
        let subject: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        let op = Operation::new_for(Arc::downgrade(&subject));
        assert_eq!(op.subject_as::<u32>().as_deref(), Some(&42));
        drop(subject);
        assert!(op.subject().is_none());
    }
}
