//! Accepting a message: each recipient is either delivered locally
//! right away, or admitted to the queue for relay.
use crate::config::Config;
use crate::domain::{Address, DomainWithDefault, MaildirReceiver, RecipientError};
use crate::relay_rules::{Peer, RelayRules};
use alias::{
    DeliveryError, FileReceiver, MessageReceiver, MultiReceiver, ProcessReceiver, ProcessSpawner,
    Receiver, TokioSpawner,
};
use spool::{DeliveryQueue, Envelope, QueueError, QueueId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tern_clock::Clock;

#[derive(Debug)]
pub enum RecipientOutcome {
    /// Every receiver accepted the message. `queued` names the
    /// messages admitted to the queue on this recipient's behalf.
    Accepted { queued: Vec<QueueId> },
    Rejected(RecipientError),
    Failed(String),
}

#[derive(Debug)]
pub struct RecipientReport {
    pub recipient: String,
    pub outcome: RecipientOutcome,
}

impl RecipientReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RecipientOutcome::Accepted { .. })
    }
}

impl std::fmt::Display for RecipientReport {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let recipient = &self.recipient;
        match &self.outcome {
            RecipientOutcome::Accepted { queued } if queued.is_empty() => {
                write!(fmt, "{recipient}: delivered")
            }
            RecipientOutcome::Accepted { queued } => {
                write!(fmt, "{recipient}: queued as")?;
                for id in queued {
                    write!(fmt, " {id}")?;
                }
                Ok(())
            }
            RecipientOutcome::Rejected(err) => write!(fmt, "{recipient}: rejected: {err}"),
            RecipientOutcome::Failed(reason) => write!(fmt, "{recipient}: failed: {reason}"),
        }
    }
}

/// What will happen for one accepted recipient
#[derive(Default)]
struct Plan {
    local: Option<MultiReceiver>,
    /// Recipients whose local deliveries also serve this one
    shared_with: BTreeSet<usize>,
    remote_domains: BTreeSet<String>,
    failures: Vec<String>,
}

pub struct MailService {
    domains: Arc<DomainWithDefault>,
    queue: DeliveryQueue,
    rules: RelayRules,
    spawner: Arc<dyn ProcessSpawner>,
    clock: Arc<dyn Clock>,
    process_timeout: Duration,
}

impl MailService {
    pub fn new(
        domains: Arc<DomainWithDefault>,
        queue: DeliveryQueue,
        rules: RelayRules,
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            domains,
            queue,
            rules,
            spawner,
            clock,
            process_timeout: alias::process::DEFAULT_COMPLETION_TIMEOUT,
        }
    }

    pub fn from_config(
        config: &Config,
        queue: DeliveryQueue,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let domains = DomainWithDefault::from_config(config, clock.clone())?;
        Ok(Self::new(
            Arc::new(domains),
            queue,
            RelayRules::new(config.relay.authorized_networks.clone()),
            Arc::new(TokioSpawner),
            clock,
        )
        .with_process_timeout(config.delivery.process_completion_timeout))
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn domains(&self) -> &Arc<DomainWithDefault> {
        &self.domains
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Accept a message from `peer`, returning one report per
    /// envelope recipient, in envelope order.
    /// A target named by several recipients receives a single copy.
    pub async fn submit(
        &self,
        envelope: &Envelope,
        body: &[u8],
        peer: &Peer,
        authorized: bool,
    ) -> Vec<RecipientReport> {
        let relay_permitted = self.rules.will_relay(peer, authorized);
        let mut claimed = HashMap::new();
        let mut remote: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        let mut plans: Vec<Result<Plan, RecipientError>> = envelope
            .recipients
            .iter()
            .enumerate()
            .map(|(idx, recipient)| {
                self.plan(recipient, idx, relay_permitted, &mut claimed, &mut remote)
            })
            .collect();

        let lines = body_lines(body);
        for line in &lines {
            for plan in plans.iter_mut().flatten() {
                if let Some(local) = plan.local.as_mut() {
                    if let Err(err) = local.line_received(line).await {
                        plan.failures.push(format!("{err:#}"));
                    }
                }
            }
        }

        let completions: Vec<_> = plans
            .iter_mut()
            .map(|plan| match plan {
                Ok(Plan {
                    local: Some(local), ..
                }) => Some(local.eom_received()),
                _ => None,
            })
            .collect();
        let local_results: Vec<Option<String>> = futures::future::join_all(
            completions.into_iter().map(|completion| async move {
                match completion {
                    Some(completion) => completion.await.err().map(|err| format!("{err:#}")),
                    None => None,
                }
            }),
        )
        .await;

        let mut queued: HashMap<String, Result<QueueId, String>> = HashMap::new();
        for (domain, recipients) in remote {
            let relay_envelope = Envelope {
                sender: envelope.sender.clone(),
                recipients: recipients.into_iter().collect(),
            };
            let result = spool_message(&self.queue, &relay_envelope, &lines).await;
            match &result {
                Ok(id) => tracing::info!(
                    "queued {id} for {domain}: {:?}",
                    relay_envelope.recipients
                ),
                Err(err) => tracing::error!("failed to queue mail for {domain}: {err:#}"),
            }
            queued.insert(domain, result.map_err(|err| format!("{err:#}")));
        }

        envelope
            .recipients
            .iter()
            .zip(plans)
            .enumerate()
            .map(|(idx, (recipient, plan))| {
                let outcome = match plan {
                    Err(err) => RecipientOutcome::Rejected(err),
                    Ok(plan) => {
                        let mut failures = plan.failures;
                        failures.extend(local_results[idx].clone());
                        for owner in &plan.shared_with {
                            if let Some(err) = &local_results[*owner] {
                                failures.push(format!(
                                    "delivery shared with {} failed: {err}",
                                    envelope.recipients[*owner]
                                ));
                            }
                        }
                        let mut ids = vec![];
                        for domain in &plan.remote_domains {
                            match queued.get(domain) {
                                Some(Ok(id)) => ids.push(*id),
                                Some(Err(err)) => failures.push(err.clone()),
                                None => {}
                            }
                        }
                        if failures.is_empty() {
                            RecipientOutcome::Accepted { queued: ids }
                        } else {
                            RecipientOutcome::Failed(failures.join("; "))
                        }
                    }
                };
                let report = RecipientReport {
                    recipient: recipient.clone(),
                    outcome,
                };
                if report.is_success() {
                    tracing::debug!("{report}");
                } else {
                    tracing::warn!("{report}");
                }
                report
            })
            .collect()
    }

    fn plan(
        &self,
        recipient: &str,
        idx: usize,
        relay_permitted: bool,
        claimed: &mut HashMap<Receiver, usize>,
        remote: &mut BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Plan, RecipientError> {
        let address = self.domains.qualify(Address::parse(recipient)?);
        if let Some(domain) = &address.domain {
            if !relay_permitted && !self.domains.is_local(domain) {
                return Err(RecipientError::RelayDenied(address.to_string()));
            }
        }
        let receivers = self.domains.exists(&address)?;

        let mut plan = Plan::default();
        let mut mine: Vec<Box<dyn MessageReceiver>> = vec![];
        for receiver in receivers {
            if let Receiver::Mailbox(target) = &receiver {
                if let Some(domain) = self.remote_domain(target) {
                    remote.entry(domain.clone()).or_default().insert(target.clone());
                    plan.remote_domains.insert(domain);
                    continue;
                }
            }
            if let Some(owner) = claimed.get(&receiver) {
                plan.shared_with.insert(*owner);
                continue;
            }
            match self.open_receiver(&receiver) {
                Ok(opened) => {
                    claimed.insert(receiver, idx);
                    mine.push(opened);
                }
                Err(err) => plan.failures.push(format!("{receiver}: {err:#}")),
            }
        }
        if !mine.is_empty() {
            plan.local.replace(MultiReceiver::new(mine));
        }
        Ok(plan)
    }

    fn remote_domain(&self, address: &str) -> Option<String> {
        let domain = Address::parse(address).ok()?.domain?;
        (!self.domains.is_local(&domain)).then_some(domain)
    }

    fn open_receiver(&self, receiver: &Receiver) -> Result<Box<dyn MessageReceiver>, DeliveryError> {
        match receiver {
            Receiver::Mailbox(address) => {
                let context = format!("no mailbox for {address}");
                match self.domains.maildir_for(address) {
                    Ok(Some(maildir)) => Ok(Box::new(MaildirReceiver::new(maildir))),
                    Ok(None) => Err(DeliveryError::Io {
                        context,
                        source: std::io::ErrorKind::NotFound.into(),
                    }),
                    Err(source) => Err(DeliveryError::Io { context, source }),
                }
            }
            Receiver::File(path) => Ok(Box::new(FileReceiver::new(path)?)),
            Receiver::Process { program, args } => Ok(Box::new(
                ProcessReceiver::spawn(self.spawner.as_ref(), program, args, self.clock.clone())?
                    .with_completion_timeout(self.process_timeout),
            )),
        }
    }
}

/// Split a message into lines without their terminators
pub fn body_lines(body: &[u8]) -> Vec<&[u8]> {
    if body.is_empty() {
        return vec![];
    }
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    body.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

/// Admit a message to the queue
pub async fn spool_message<L: AsRef<[u8]>>(
    queue: &DeliveryQueue,
    envelope: &Envelope,
    lines: &[L],
) -> Result<QueueId, QueueError> {
    let message = queue.create_new_message().await?;
    let id = message.id;
    let mut body = message.body;
    for line in lines {
        body.write_line(line.as_ref()).await?;
    }
    body.finish().await?;
    message.envelope.write(envelope).await?;
    Ok(id)
}
