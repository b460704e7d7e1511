//! Response listener task.
//!
//! Consumes the `.finished` topic on its own bus connection, filters
//! inbound bodies against the request's [`CorrelationFilter`], and hands the
//! first match to the waiter through a single-slot oneshot. The slot accepts
//! exactly one value and the task stops consuming after the first match, so
//! a second matching message can never overwrite a terminal state.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::BusConnection;
use crate::completion::CompletionState;
use crate::error::{Result, SignError};
use crate::request::CorrelationFilter;

/// Handle to a spawned listener.
pub struct ListenerHandle {
    registered: oneshot::Receiver<Result<String>>,
    /// Single-slot handoff for the terminal completion state.
    pub completion: oneshot::Receiver<CompletionState>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Wait until the broker has acknowledged the queue binding.
    ///
    /// The dispatcher must not publish before this resolves: the response
    /// queue is transient and non-replayable, so a reply published before
    /// the binding exists is lost permanently. Returns the queue name.
    ///
    /// # Errors
    ///
    /// Returns [`SignError::Transport`] when the subscription failed or the
    /// listener task died before signalling.
    pub async fn registered(&mut self) -> Result<String> {
        match (&mut self.registered).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SignError::Transport(
                "listener task terminated before registering".into(),
            )),
        }
    }

    /// Abort the background task. Dropping the handle does the same once
    /// the completion receiver is gone; this is for explicit teardown.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the listener for `topic` on `connection`.
///
/// Subscription, registration signalling, and consumption all happen inside
/// the spawned task; the caller sequences itself via
/// [`ListenerHandle::registered`]. On transport failure the loop simply
/// terminates: the waiter's own timeout stays the only bound.
pub fn spawn_listener(
    connection: Arc<dyn BusConnection>,
    topic: String,
    filter: CorrelationFilter,
) -> ListenerHandle {
    let (registered_tx, registered_rx) = oneshot::channel();
    let (completion_tx, completion_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut subscription = match connection.subscribe(&topic).await {
            Ok(sub) => sub,
            Err(err) => {
                let _ = registered_tx.send(Err(err));
                return;
            },
        };
        debug!(topic = %topic, queue = %subscription.queue(), "listener registered");
        if registered_tx
            .send(Ok(subscription.queue().to_string()))
            .is_err()
        {
            return;
        }

        let mut completion_tx = completion_tx;
        let state = loop {
            tokio::select! {
                body = subscription.next() => {
                    match body {
                        None => {
                            warn!(topic = %topic, "transport closed; listener loop ends");
                            return;
                        },
                        Some(body) if filter.matches(&body) => {
                            break CompletionState::from_body(body);
                        },
                        Some(_) => {
                            debug!(topic = %topic, "unrelated message ignored");
                        },
                    }
                },
                () = completion_tx.closed() => {
                    // Waiter gave up (close-on-timeout); stop consuming
                    // instead of outliving our purpose.
                    debug!(topic = %topic, "completion slot closed; listener stops");
                    return;
                },
            }
        };
        // Send fails only when the waiter timed out between the match and
        // this point; nothing left to do then.
        let _ = completion_tx.send(state);
    });

    ListenerHandle {
        registered: registered_rx,
        completion: completion_rx,
        task,
    }
}
