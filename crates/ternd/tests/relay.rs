use async_trait::async_trait;
use dns_resolver::{MxCalculator, MxRecord, TestResolver};
use parking_lot::Mutex;
use spool::{DeliveryQueue, Envelope, QueueId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tern_clock::{Clock, ManualClock};
use ternd::config::RelayConfig;
use ternd::service::spool_message;
use ternd::{RelayManager, RelaySession, RelayTransport};
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, PartialEq)]
struct Relayed {
    exchange: String,
    sender: String,
    recipients: Vec<String>,
    body: String,
}

/// Accepts everything unless told otherwise
#[derive(Default)]
struct ScriptedTransport {
    unreachable: Mutex<HashSet<String>>,
    /// Verdicts keyed by the first recipient
    verdicts: Mutex<HashMap<String, (u16, String)>>,
    relayed: Mutex<Vec<Relayed>>,
    connections: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn refuse(&self, recipient: &str, code: u16, response: &str) {
        self.verdicts
            .lock()
            .insert(recipient.to_string(), (code, response.to_string()));
    }

    fn relayed(&self) -> Vec<Relayed> {
        self.relayed.lock().clone()
    }

    fn connections(&self) -> Vec<String> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    async fn relay(&self, exchange: &MxRecord, session: &mut RelaySession) -> anyhow::Result<()> {
        self.connections.lock().push(exchange.exchange.clone());
        if self.unreachable.lock().contains(&exchange.exchange) {
            anyhow::bail!("connection to {} refused", exchange.exchange);
        }

        while let Some(sender) = session.mail_from().await {
            let recipients = session.mail_to().await.unwrap_or_default();
            let mut body = String::new();
            if let Some(mut data) = session.mail_data().await? {
                data.read_to_string(&mut body).await?;
            }
            session.data_sent();

            let verdict = recipients
                .first()
                .and_then(|rcpt| self.verdicts.lock().get(rcpt).cloned());
            let (code, response) = verdict.unwrap_or((250, "2.0.0 ok".to_string()));
            if code == 250 {
                self.relayed.lock().push(Relayed {
                    exchange: exchange.exchange.clone(),
                    sender,
                    recipients,
                    body,
                });
            }
            session.sent_mail(code, &response).await;
        }
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    queue: DeliveryQueue,
    clock: Arc<ManualClock>,
    mx: Arc<MxCalculator>,
    transport: Arc<ScriptedTransport>,
    manager: RelayManager,
}

impl Fixture {
    fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let queue = DeliveryQueue::open(dir.path())?;
        let clock = Arc::new(ManualClock::new());
        let resolver = TestResolver::default()
            .with_mx("one.test", 10, "mx1.one.test")
            .with_mx("one.test", 20, "mx2.one.test")
            .with_mx("two.test", 10, "mx.two.test")
            .with_mx("three.test", 10, "mx.three.test");
        let mx = Arc::new(MxCalculator::new(Arc::new(resolver), clock.clone()));
        let transport = Arc::new(ScriptedTransport::default());
        let manager = RelayManager::new(
            queue.clone(),
            mx.clone(),
            transport.clone(),
            clock.clone(),
            config,
        )
        .with_hostname("relay.local.test");

        Ok(Self {
            _dir: dir,
            queue,
            clock,
            mx,
            transport,
            manager,
        })
    }

    async fn enqueue(&self, sender: Option<&str>, recipients: &[&str], body: &str) -> anyhow::Result<QueueId> {
        let envelope = Envelope {
            sender: sender.map(|s| s.to_string()),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
        };
        let lines: Vec<&str> = body.lines().collect();
        Ok(spool_message(&self.queue, &envelope, &lines).await?)
    }

    /// Run one cycle and wait for the sessions it started
    async fn cycle(&self) -> anyhow::Result<usize> {
        let handles = self.manager.check_state().await?;
        let count = handles.len();
        for handle in handles {
            handle.await?;
        }
        Ok(count)
    }

    async fn waiting(&self) -> anyhow::Result<Vec<QueueId>> {
        self.queue.read_directory().await?;
        Ok(self.queue.get_waiting())
    }
}

#[tokio::test]
async fn relays_by_domain() -> anyhow::Result<()> {
    let fixture = Fixture::new(RelayConfig::default())?;
    fixture.enqueue(Some("alice@local.test"), &["a@one.test"], "first\n").await?;
    fixture.enqueue(Some("alice@local.test"), &["c@two.test"], "second\n").await?;
    fixture.enqueue(None, &["b@one.test"], "third\n").await?;

    assert_eq!(fixture.cycle().await?, 2);
    assert_eq!(fixture.manager.active_sessions(), 0);

    let mut relayed = fixture.transport.relayed();
    relayed.sort_by(|a, b| a.body.cmp(&b.body));
    k9::assert_equal!(
        relayed,
        vec![
            Relayed {
                exchange: "mx1.one.test".to_string(),
                sender: "alice@local.test".to_string(),
                recipients: vec!["a@one.test".to_string()],
                body: "first\n".to_string(),
            },
            Relayed {
                exchange: "mx.two.test".to_string(),
                sender: "alice@local.test".to_string(),
                recipients: vec!["c@two.test".to_string()],
                body: "second\n".to_string(),
            },
            Relayed {
                exchange: "mx1.one.test".to_string(),
                sender: String::new(),
                recipients: vec!["b@one.test".to_string()],
                body: "third\n".to_string(),
            },
        ]
    );

    // Both one.test messages went over a single connection
    let mut connections = fixture.transport.connections();
    connections.sort();
    k9::assert_equal!(connections, vec!["mx.two.test", "mx1.one.test"]);

    assert!(fixture.waiting().await?.is_empty());
    assert!(fixture.queue.get_relaying().is_empty());
    Ok(())
}

#[tokio::test]
async fn permanent_failure_bounces() -> anyhow::Result<()> {
    let fixture = Fixture::new(RelayConfig::default())?;
    fixture.transport.refuse("nobody@one.test", 550, "5.1.1 no such user");
    let id = fixture
        .enqueue(
            Some("alice@local.test"),
            &["nobody@one.test"],
            "Subject: hi\n\nbody text\n",
        )
        .await?;

    fixture.cycle().await?;

    let waiting = fixture.waiting().await?;
    assert_eq!(waiting.len(), 1);
    assert_ne!(waiting[0], id);
    assert!(fixture.queue.state_of(id).is_none());

    let bounce = fixture.queue.get_envelope(waiting[0]).await?;
    k9::assert_equal!(
        bounce,
        Envelope {
            sender: None,
            recipients: vec!["alice@local.test".to_string()],
        }
    );
    let mut text = String::new();
    fixture
        .queue
        .get_mail_data(waiting[0])
        .await?
        .read_to_string(&mut text)
        .await?;
    assert!(text.contains("MAILER-DAEMON@relay.local.test"), "{text}");
    assert!(text.contains("550 5.1.1 no such user"), "{text}");
    assert!(text.contains("Subject: hi"), "{text}");
    assert!(!text.contains("body text"), "{text}");
    Ok(())
}

#[tokio::test]
async fn null_sender_is_not_bounced() -> anyhow::Result<()> {
    let fixture = Fixture::new(RelayConfig::default())?;
    fixture.transport.refuse("nobody@one.test", 554, "rejected");
    fixture.enqueue(None, &["nobody@one.test"], "x\n").await?;

    fixture.cycle().await?;
    assert!(fixture.waiting().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn transient_failure_backs_off() -> anyhow::Result<()> {
    let fixture = Fixture::new(RelayConfig::default())?;
    fixture.transport.refuse("busy@one.test", 451, "4.3.0 try later");
    let id = fixture.enqueue(Some("a@local.test"), &["busy@one.test"], "x\n").await?;

    assert_eq!(fixture.cycle().await?, 1);
    k9::assert_equal!(fixture.waiting().await?, vec![id]);
    assert_eq!(
        fixture.manager.retry_time(id),
        Some(fixture.clock.now() + Duration::from_secs(300))
    );

    // Not due yet
    assert_eq!(fixture.cycle().await?, 0);
    fixture.clock.advance(Duration::from_secs(299));
    assert_eq!(fixture.cycle().await?, 0);
    assert_eq!(fixture.transport.connections().len(), 1);

    fixture.clock.advance(Duration::from_secs(1));
    assert_eq!(fixture.cycle().await?, 1);
    assert_eq!(fixture.transport.connections().len(), 2);
    assert_eq!(
        fixture.manager.retry_time(id),
        Some(fixture.clock.now() + Duration::from_secs(600))
    );

    // Now it goes through
    fixture.transport.verdicts.lock().clear();
    fixture.clock.advance(Duration::from_secs(600));
    assert_eq!(fixture.cycle().await?, 1);
    assert!(fixture.waiting().await?.is_empty());
    assert_eq!(fixture.manager.retry_time(id), None);
    Ok(())
}

#[tokio::test]
async fn unreachable_exchanger_is_avoided() -> anyhow::Result<()> {
    let fixture = Fixture::new(RelayConfig::default())?;
    fixture
        .transport
        .unreachable
        .lock()
        .insert("mx1.one.test".to_string());
    let id = fixture.enqueue(Some("a@local.test"), &["x@one.test"], "x\n").await?;

    fixture.cycle().await?;
    assert!(fixture.mx.is_bad("mx1.one.test"));
    // Never attempted, so it is immediately eligible again
    k9::assert_equal!(fixture.waiting().await?, vec![id]);
    assert_eq!(fixture.manager.retry_time(id), None);

    fixture.cycle().await?;
    k9::assert_equal!(
        fixture.transport.connections(),
        vec!["mx1.one.test", "mx2.one.test"]
    );
    assert!(fixture.waiting().await?.is_empty());
    assert!(!fixture.mx.is_bad("mx2.one.test"));
    Ok(())
}

#[tokio::test]
async fn unresolvable_domain_is_deferred() -> anyhow::Result<()> {
    let config = RelayConfig::default();
    let delay = config.mx_failure_delay;
    let fixture = Fixture::new(config)?;
    let id = fixture
        .enqueue(Some("a@local.test"), &["x@nowhere.test"], "x\n")
        .await?;

    assert_eq!(fixture.cycle().await?, 1);
    assert!(fixture.transport.connections().is_empty());
    k9::assert_equal!(fixture.waiting().await?, vec![id]);
    assert_eq!(
        fixture.manager.retry_time(id),
        Some(fixture.clock.now() + delay)
    );

    assert_eq!(fixture.cycle().await?, 0);
    fixture.clock.advance(delay);
    assert_eq!(fixture.cycle().await?, 1);
    Ok(())
}

#[tokio::test]
async fn respects_limits() -> anyhow::Result<()> {
    let config = RelayConfig {
        max_connections: 1,
        max_messages_per_connection: 2,
        ..RelayConfig::default()
    };
    let fixture = Fixture::new(config)?;
    for rcpt in ["a@one.test", "b@one.test", "c@one.test"] {
        fixture.enqueue(Some("s@local.test"), &[rcpt], rcpt).await?;
    }
    fixture.enqueue(Some("s@local.test"), &["d@two.test"], "d").await?;

    let handles = fixture.manager.check_state().await?;
    assert_eq!(handles.len(), 1);
    assert_eq!(fixture.manager.active_sessions(), 1);
    assert_eq!(fixture.queue.get_relaying().len(), 2);

    // The session limit is reached until that session finishes
    assert!(fixture.manager.check_state().await?.is_empty());
    for handle in handles {
        handle.await?;
    }
    assert_eq!(fixture.transport.relayed().len(), 2);

    // Oldest first: the remaining one.test message, then two.test
    assert_eq!(fixture.cycle().await?, 1);
    assert_eq!(fixture.cycle().await?, 1);
    assert_eq!(fixture.transport.relayed().len(), 4);
    assert!(fixture.waiting().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn run_until_shutdown() -> anyhow::Result<()> {
    let fixture = Fixture::new(RelayConfig::default())?;
    fixture.enqueue(Some("s@local.test"), &["a@three.test"], "x\n").await?;

    let (tx, rx) = tokio::sync::watch::channel(());
    let manager = fixture.manager.clone();
    let runner = tokio::spawn(async move {
        manager.run(Duration::from_secs(60), rx).await;
    });

    for _ in 0..500 {
        if !fixture.transport.relayed().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fixture.transport.relayed().len(), 1);

    tx.send(())?;
    tokio::time::timeout(Duration::from_secs(5), runner).await??;
    Ok(())
}
