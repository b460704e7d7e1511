//! Request dispatcher.
//!
//! Publishes exactly one signing request per invocation, on a connection
//! constructed from the authenticated publishing credentials. The dispatcher
//! never publishes before the listener's subscription is acknowledged; the
//! orchestration sequences that via [`ListenerHandle::registered`].
//!
//! [`ListenerHandle::registered`]: crate::listener::ListenerHandle::registered

use std::sync::Arc;

use tracing::info;

use crate::bus::BusConnection;
use crate::config::Environment;
use crate::error::Result;
use crate::request::SigningRequest;

/// One-shot publisher for a signing request.
pub struct Dispatcher {
    connection: Arc<dyn BusConnection>,
    prefix: String,
    env: Environment,
}

impl Dispatcher {
    /// Build a dispatcher over an already-authenticated connection.
    #[must_use]
    pub fn new(connection: Arc<dyn BusConnection>, prefix: &str, env: Environment) -> Self {
        Self {
            connection,
            prefix: prefix.to_string(),
            env,
        }
    }

    /// Publish the request to `<prefix>.<env>.build.request.<kind>`.
    ///
    /// # Errors
    ///
    /// Returns [`SignError::Transport`] when the publish fails. There is no
    /// retry; one attempt per invocation.
    ///
    /// [`SignError::Transport`]: crate::error::SignError::Transport
    pub async fn dispatch(&self, request: &SigningRequest) -> Result<()> {
        let topic = request.kind.request_topic(&self.prefix, self.env);
        info!(
            topic = %topic,
            build_id = %request.build_id,
            basearch = %request.basearch,
            "dispatching signing request"
        );
        self.connection.publish(&topic, &request.body()).await
    }
}
