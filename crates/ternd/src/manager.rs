//! Drives relay sessions for the messages waiting in the queue.
//!
//! Each cycle of `check_state` groups waiting messages by destination
//! domain and starts one session per domain, up to the connection
//! limit. Sessions report back through the `RelayObserver` impl here,
//! which decides each message's fate: removed after delivery, bounced
//! and removed after a permanent refusal, or returned to the queue
//! with a retry delay after a transient one.
use crate::bounce::generate_bounce;
use crate::config::RelayConfig;
use crate::domain::Address;
use crate::session::{RelayObserver, RelaySession, SessionId, SessionState, SmtpStatus};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dns_resolver::{MxCalculator, MxRecord, DEFAULT_MAX_CNAME_CHAIN};
use parking_lot::Mutex;
use spool::{DeliveryQueue, QueueId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_clock::Clock;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Carries a session's messages to a mail exchanger.
/// This is where an SMTP client plugs in.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Connect to `exchange` and offer it the messages of `session`,
    /// reporting each verdict with `RelaySession::sent_mail`.
    /// An error means the exchanger could not be reached or the
    /// connection failed part way through.
    async fn relay(&self, exchange: &MxRecord, session: &mut RelaySession) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Deferral {
    until: Instant,
    /// Transient failures so far
    attempts: u32,
}

#[derive(Default)]
struct ManagerState {
    next_session: SessionId,
    /// Messages each running session has yet to report on
    sessions: HashMap<SessionId, BTreeSet<QueueId>>,
    deferred: HashMap<QueueId, Deferral>,
}

struct Inner {
    queue: DeliveryQueue,
    mx: Arc<MxCalculator>,
    transport: Arc<dyn RelayTransport>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    max_cname_chain: usize,
    hostname: String,
    state: Mutex<ManagerState>,
}

#[derive(Clone)]
pub struct RelayManager {
    inner: Arc<Inner>,
}

impl RelayManager {
    pub fn new(
        queue: DeliveryQueue,
        mx: Arc<MxCalculator>,
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                mx,
                transport,
                clock,
                config,
                max_cname_chain: DEFAULT_MAX_CNAME_CHAIN,
                hostname: gethostname::gethostname().to_string_lossy().into_owned(),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn with_max_cname_chain(self, max_cname_chain: usize) -> Self {
        self.modify(|inner| inner.max_cname_chain = max_cname_chain)
    }

    /// The name used in the bounces we generate
    pub fn with_hostname<S: Into<String>>(self, hostname: S) -> Self {
        let hostname = hostname.into();
        self.modify(move |inner| inner.hostname = hostname)
    }

    fn modify<F: FnOnce(&mut Inner)>(mut self, func: F) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => func(inner),
            None => tracing::error!("relay manager settings changed after it was shared"),
        }
        self
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.inner.queue
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// When a message that failed transiently will next be tried
    pub fn retry_time(&self, id: QueueId) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .deferred
            .get(&id)
            .map(|deferral| deferral.until)
    }

    /// Start sessions for whatever is waiting. The returned handles
    /// complete when the sessions they drive have finished.
    pub async fn check_state(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let queue = &self.inner.queue;
        queue
            .read_directory()
            .await
            .context("failed to scan the queue")?;

        let now = self.inner.clock.now();
        let (free, eligible) = {
            let mut state = self.inner.state.lock();
            state.deferred.retain(|id, _| queue.state_of(*id).is_some());

            let free = self
                .inner
                .config
                .max_connections
                .saturating_sub(state.sessions.len());
            if free == 0 {
                tracing::trace!("all {} sessions are busy", state.sessions.len());
                return Ok(vec![]);
            }

            let eligible: Vec<QueueId> = queue
                .get_waiting()
                .into_iter()
                .filter(|id| {
                    state
                        .deferred
                        .get(id)
                        .map_or(true, |deferral| deferral.until <= now)
                })
                .collect();
            (free, eligible)
        };
        if eligible.is_empty() {
            return Ok(vec![]);
        }

        let mut batches: BTreeMap<String, Vec<QueueId>> = BTreeMap::new();
        let mut order = vec![];
        for id in eligible {
            let envelope = match queue.get_envelope(id).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::error!("skipping {id}: {err:#}");
                    continue;
                }
            };
            let Some(domain) = envelope
                .recipients
                .first()
                .and_then(|rcpt| Address::parse(rcpt).ok())
                .and_then(|address| address.domain)
            else {
                tracing::error!("skipping {id}: no routable recipient in {envelope:?}");
                continue;
            };

            if let Some(batch) = batches.get_mut(&domain) {
                if batch.len() < self.inner.config.max_messages_per_connection {
                    batch.push(id);
                }
            } else if batches.len() < free {
                order.push(domain.clone());
                batches.insert(domain, vec![id]);
            }
        }

        let mut handles = vec![];
        for domain in order {
            let Some(batch) = batches.remove(&domain) else {
                continue;
            };
            let mut ids = vec![];
            for id in batch {
                match queue.set_relaying(id).await {
                    Ok(()) => ids.push(id),
                    Err(err) => tracing::error!("cannot relay {id}: {err:#}"),
                }
            }
            if ids.is_empty() {
                continue;
            }

            let session_id = {
                let mut state = self.inner.state.lock();
                let session_id = state.next_session;
                state.next_session += 1;
                state
                    .sessions
                    .insert(session_id, ids.iter().copied().collect());
                session_id
            };
            tracing::debug!(
                "session {session_id}: relaying {} message(s) to {domain}",
                ids.len()
            );

            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.run_session(session_id, domain, ids).await;
            }));
        }

        Ok(handles)
    }

    async fn run_session(&self, session_id: SessionId, domain: String, ids: Vec<QueueId>) {
        let exchange = match self
            .inner
            .mx
            .get_mx(&domain, self.inner.max_cname_chain)
            .await
        {
            Ok(exchange) => exchange,
            Err(err) => {
                tracing::warn!("session {session_id}: no mail exchanger for {domain}: {err:#}");
                let delay = self.inner.config.mx_failure_delay;
                for id in ids {
                    self.release(session_id, id);
                    self.defer(id, delay, false).await;
                }
                self.inner.state.lock().sessions.remove(&session_id);
                return;
            }
        };

        let mut session = RelaySession::new(
            session_id,
            self.inner.queue.clone(),
            Arc::new(self.clone()),
        );
        session.load_messages(ids);

        let reason = match self.inner.transport.relay(&exchange, &mut session).await {
            Ok(()) => {
                self.inner.mx.mark_good(&exchange.exchange);
                "finished".to_string()
            }
            Err(err) => {
                tracing::warn!(
                    "session {session_id}: relay to {} for {domain} failed: {err:#}",
                    exchange.exchange
                );
                self.inner.mx.mark_bad(&exchange.exchange);
                format!("{err:#}")
            }
        };

        if session.state() != SessionState::Done {
            session.connection_lost(&reason).await;
        }
    }

    /// The session no longer owns `id`
    fn release(&self, session: SessionId, id: QueueId) {
        if let Some(outstanding) = self.inner.state.lock().sessions.get_mut(&session) {
            outstanding.remove(&id);
        }
    }

    /// Return `id` to the queue, to be picked up no sooner than `delay`
    async fn defer(&self, id: QueueId, delay: Duration, count_attempt: bool) {
        if let Err(err) = self.inner.queue.set_waiting(id).await {
            tracing::error!("failed to requeue {id}: {err:#}");
            return;
        }
        let until = self.inner.clock.now() + delay;
        let mut state = self.inner.state.lock();
        let deferral = state.deferred.entry(id).or_insert(Deferral {
            until,
            attempts: 0,
        });
        deferral.until = until;
        if count_attempt {
            deferral.attempts += 1;
        }
    }

    async fn finish(&self, id: QueueId) {
        self.inner.state.lock().deferred.remove(&id);
        if let Err(err) = self.inner.queue.done(id).await {
            tracing::error!("failed to remove {id}: {err:#}");
        }
    }

    async fn bounce(&self, id: QueueId, status: &SmtpStatus) -> anyhow::Result<()> {
        let queue = &self.inner.queue;
        let envelope = queue.get_envelope(id).await?;
        let mut body = vec![];
        queue
            .get_mail_data(id)
            .await?
            .read_to_end(&mut body)
            .await
            .with_context(|| format!("failed to read {id}"))?;

        let date = DateTime::<Utc>::from(self.inner.clock.system_time());
        let Some((bounce_envelope, lines)) =
            generate_bounce(&envelope, &body, status, &self.inner.hostname, date)
        else {
            tracing::info!("{id} has the null sender; not bouncing it");
            return Ok(());
        };
        let bounce_id = crate::service::spool_message(queue, &bounce_envelope, &lines).await?;
        tracing::info!("bounced {id} to {:?} as {bounce_id}", bounce_envelope.recipients);
        Ok(())
    }

    /// Run `check_state` every `interval` until `shutdown` fires
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<()>) {
        loop {
            match self.check_state().await {
                Ok(sessions) if !sessions.is_empty() => {
                    tracing::debug!("started {} relay session(s)", sessions.len());
                }
                Ok(_) => {}
                Err(err) => tracing::error!("relay cycle failed: {err:#}"),
            }

            tokio::select! {
                _ = self.inner.clock.sleep(interval) => {}
                _ = shutdown.changed() => {
                    tracing::debug!("relay manager stopping");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl RelayObserver for RelayManager {
    async fn notify_success(&self, session: SessionId, id: QueueId) {
        self.release(session, id);
        tracing::info!("session {session}: relayed {id}");
        self.finish(id).await;
    }

    async fn notify_failure(&self, session: SessionId, id: QueueId, status: &SmtpStatus) {
        self.release(session, id);
        if status.is_permanent() {
            tracing::info!("session {session}: {id} refused: {status}");
            if let Err(err) = self.bounce(id, status).await {
                tracing::error!("failed to bounce {id}: {err:#}");
            }
            self.finish(id).await;
            return;
        }

        let attempts = self
            .inner
            .state
            .lock()
            .deferred
            .get(&id)
            .map_or(0, |deferral| deferral.attempts);
        let delay = self.inner.config.delay_for_attempt(attempts + 1);
        tracing::info!(
            "session {session}: {id} deferred: {status}; next attempt in {}",
            humantime::format_duration(delay)
        );
        self.defer(id, delay, true).await;
    }

    async fn notify_done(&self, session: SessionId) {
        let remaining = self
            .inner
            .state
            .lock()
            .sessions
            .remove(&session)
            .unwrap_or_default();
        for id in remaining {
            tracing::debug!("session {session}: {id} was not attempted");
            if let Err(err) = self.inner.queue.set_waiting(id).await {
                tracing::error!("failed to requeue {id}: {err:#}");
            }
        }
    }
}
