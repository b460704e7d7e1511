//! Completion state machine and bounded waiter.
//!
//! One run has exactly one outstanding request/response pair. The listener
//! is the sole producer and the waiter the sole consumer of a single-slot
//! oneshot handoff; the state transitions Pending -> terminal exactly once
//! and never reverses. Dropping the receiver on timeout closes the slot, so
//! a listener that matches late fails its send and winds down instead of
//! outliving its purpose.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, SignError};

/// Default wait bound for the signer response.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(3600);

/// Terminal classification of a completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Signer reported `status: success` (case-insensitive).
    Success,
    /// Signer reported anything else.
    Failure,
}

/// The first matching completion message, as delivered by the listener.
#[derive(Debug, Clone)]
pub struct CompletionState {
    /// Terminal status.
    pub status: CompletionStatus,
    /// Signer-provided failure message, surfaced verbatim when present.
    pub failure_message: Option<String>,
    /// Full message body for the verifiers.
    pub raw_body: Map<String, Value>,
}

impl CompletionState {
    /// Classify a matched message body.
    #[must_use]
    pub fn from_body(body: Map<String, Value>) -> Self {
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .filter(|s| s.eq_ignore_ascii_case("success"))
            .map_or(CompletionStatus::Failure, |_| CompletionStatus::Success);
        let failure_message = body
            .get("failure-message")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            status,
            failure_message,
            raw_body: body,
        }
    }

    /// Turn the terminal state into the run outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SignError::Signing`] for any non-success status, carrying
    /// the signer's failure message verbatim if one was provided.
    pub fn into_result(self) -> Result<Map<String, Value>> {
        match self.status {
            CompletionStatus::Success => Ok(self.raw_body),
            CompletionStatus::Failure => Err(SignError::Signing(
                self.failure_message
                    .unwrap_or_else(|| "signer reported failure".to_string()),
            )),
        }
    }
}

/// Block on the completion slot for up to `bound`.
///
/// Consumes the receiver: on timeout it is dropped, which closes the slot
/// and cancels the listener's pending send.
///
/// # Errors
///
/// - [`SignError::Timeout`] when the slot is still empty at the deadline.
/// - [`SignError::Transport`] when the listener terminated (transport
///   failure) without delivering a state.
/// - [`SignError::Signing`] when the signer reported a non-success status.
pub async fn wait_for_completion(
    slot: oneshot::Receiver<CompletionState>,
    bound: Duration,
) -> Result<Map<String, Value>> {
    match tokio::time::timeout(bound, slot).await {
        Err(_) => Err(SignError::Timeout(bound.as_secs())),
        Ok(Err(_)) => Err(SignError::Transport(
            "listener terminated before a response arrived".into(),
        )),
        Ok(Ok(state)) => {
            debug!(status = ?state.status, "signer response received");
            state.into_result()
        },
    }
}
