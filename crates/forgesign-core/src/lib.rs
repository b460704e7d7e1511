//! Core of the bus-mediated artifact signing flow.
//!
//! A signing run publishes one request to a topic-based message bus, waits
//! (bounded) for the correlated completion message on the matching
//! `.finished` topic, and only then hands the returned signatures to a
//! verifier. This crate owns the request/response correlation protocol and
//! the completion state machine; the bus transport and the blob store are
//! trait seams with narrow interfaces.
//!
//! # Ordering invariant
//!
//! The response queue is transient and non-replayable: the listener's
//! subscription must be acknowledged by the broker *before* the dispatcher
//! publishes, or the reply can arrive with nobody listening and be lost
//! permanently. [`listener::spawn_listener`] exposes a `registered` signal
//! for exactly this purpose.

pub mod archive;
pub mod bus;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod meta;
pub mod request;
pub mod store;

pub use completion::{CompletionState, CompletionStatus, wait_for_completion};
pub use config::{BucketTarget, Environment, MessagingConfig};
pub use error::{Result, SignError};
pub use request::{CorrelationFilter, RequestKind, SignPayload, SigningRequest};
