//! The delivery queue: durable storage for messages that are waiting
//! to be relayed to another host.
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod queue;
pub mod queue_id;

pub use queue::{BodyWriter, DeliveryQueue, EnvelopeWriter, NewMessage};
pub use queue_id::QueueId;

/// The sender and recipients of a queued message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// `None` is the null reverse path, used by bounces
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum MessageState {
    Waiting,
    Relaying,
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(fmt, "waiting"),
            Self::Relaying => write!(fmt, "relaying"),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("message {id} is {actual}, not {expected}")]
    InvalidTransition {
        id: QueueId,
        expected: MessageState,
        actual: MessageState,
    },
    #[error("message {0} is not in the queue")]
    UnknownMessage(QueueId),
    #[error("message {0} was abandoned before it was complete")]
    Abandoned(QueueId),
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid envelope for {id}")]
    Envelope {
        id: QueueId,
        #[source]
        source: serde_json::Error,
    },
}

impl QueueError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}
