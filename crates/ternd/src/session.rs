//! One outbound connection's walk through a batch of queued messages.
//!
//! The protocol driver asks the session for the envelope and body of
//! the current message, sends them, and reports the server's verdict
//! with `sent_mail`, which moves the session on to the next message.
//! The session only classifies outcomes; what to do about them is
//! left to its `RelayObserver`.
use async_trait::async_trait;
use spool::{DeliveryQueue, Envelope, QueueError, QueueId};
use std::collections::VecDeque;
use std::sync::Arc;

pub type SessionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Between messages
    Idle,
    SendingEnvelope,
    SendingBody,
    AwaitingResult,
    /// The connection is gone; nothing more will be attempted
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpStatus {
    pub code: u16,
    pub response: String,
}

impl SmtpStatus {
    pub fn new<S: Into<String>>(code: u16, response: S) -> Self {
        Self {
            code,
            response: response.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

impl std::fmt::Display for SmtpStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} {}", self.code, self.response)
    }
}

#[async_trait]
pub trait RelayObserver: Send + Sync {
    async fn notify_success(&self, session: SessionId, id: QueueId);
    async fn notify_failure(&self, session: SessionId, id: QueueId, status: &SmtpStatus);
    /// The session has finished; any message it did not report on
    /// was never attempted
    async fn notify_done(&self, session: SessionId);
}

pub struct RelaySession {
    id: SessionId,
    queue: DeliveryQueue,
    observer: Arc<dyn RelayObserver>,
    pending: VecDeque<QueueId>,
    current: Option<(QueueId, Envelope)>,
    state: SessionState,
}

impl RelaySession {
    pub fn new(id: SessionId, queue: DeliveryQueue, observer: Arc<dyn RelayObserver>) -> Self {
        Self {
            id,
            queue,
            observer,
            pending: VecDeque::new(),
            current: None,
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Add messages to the end of the batch
    pub fn load_messages<I: IntoIterator<Item = QueueId>>(&mut self, ids: I) {
        self.pending.extend(ids);
    }

    /// The message currently being relayed
    pub fn current_message(&self) -> Option<QueueId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    /// Make the next message in the batch current, if there isn't
    /// one already. Messages whose envelope cannot be loaded are
    /// reported as failed and skipped.
    async fn ensure_current(&mut self) -> Option<&Envelope> {
        if self.state == SessionState::Done {
            return None;
        }
        while self.current.is_none() {
            let id = self.pending.pop_front()?;
            match self.queue.get_envelope(id).await {
                Ok(envelope) => {
                    self.current.replace((id, envelope));
                }
                Err(err) => {
                    tracing::error!("session {}: cannot load {id}: {err:#}", self.id);
                    let status = SmtpStatus::new(451, format!("local error: {err:#}"));
                    self.observer.notify_failure(self.id, id, &status).await;
                }
            }
        }
        self.current.as_ref().map(|(_, envelope)| envelope)
    }

    /// The reverse path of the current message; the null sender is
    /// rendered as an empty string. `None` once the batch is exhausted.
    pub async fn mail_from(&mut self) -> Option<String> {
        let sender = self
            .ensure_current()
            .await?
            .sender
            .clone()
            .unwrap_or_default();
        self.state = SessionState::SendingEnvelope;
        Some(sender)
    }

    pub async fn mail_to(&mut self) -> Option<Vec<String>> {
        let recipients = self.ensure_current().await?.recipients.clone();
        self.state = SessionState::SendingEnvelope;
        Some(recipients)
    }

    /// The body of the current message
    pub async fn mail_data(&mut self) -> Result<Option<tokio::fs::File>, QueueError> {
        if self.ensure_current().await.is_none() {
            return Ok(None);
        }
        let Some(id) = self.current_message() else {
            return Ok(None);
        };
        let data = self.queue.get_mail_data(id).await?;
        self.state = SessionState::SendingBody;
        Ok(Some(data))
    }

    /// The body has been transmitted; the verdict is pending
    pub fn data_sent(&mut self) {
        if self.current.is_some() {
            self.state = SessionState::AwaitingResult;
        }
    }

    /// The server's verdict on the current message
    pub async fn sent_mail(&mut self, code: u16, response: &str) {
        if self.state == SessionState::Done {
            tracing::debug!("session {}: ignoring late result {code}", self.id);
            return;
        }
        let Some((id, _)) = self.current.take() else {
            tracing::warn!("session {}: result {code} with no message in flight", self.id);
            return;
        };
        self.state = SessionState::Idle;

        let status = SmtpStatus::new(code, response);
        if status.is_success() {
            tracing::debug!("session {}: {id} accepted: {status}", self.id);
            self.observer.notify_success(self.id, id).await;
        } else {
            tracing::debug!("session {}: {id} refused: {status}", self.id);
            self.observer.notify_failure(self.id, id, &status).await;
        }
    }

    /// The connection is gone. Remaining messages are left for the
    /// observer to requeue.
    pub async fn connection_lost(&mut self, reason: &str) {
        if self.state == SessionState::Done {
            return;
        }
        tracing::debug!("session {}: finished: {reason}", self.id);
        self.state = SessionState::Done;
        self.current.take();
        self.pending.clear();
        self.observer.notify_done(self.id).await;
    }
}
