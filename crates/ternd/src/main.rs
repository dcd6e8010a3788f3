use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dns_resolver::{HickoryResolver, MxCalculator};
use listen_fds::ListenFds;
use spool::{DeliveryQueue, Envelope};
use std::path::PathBuf;
use std::sync::Arc;
use tern_clock::SystemClock;
use ternd::config::{Config, DEFAULT_CONFIG_PATH};
use ternd::diagnostics::{DiagnosticFormat, LoggingConfig, DEFAULT_FILTER, FILTER_ENV_VAR};
use ternd::relay_rules::Peer;
use ternd::MailService;
use tokio::io::AsyncReadExt;

#[derive(Debug, Parser)]
#[command(about = "tern mail daemon")]
struct Opt {
    /// Configuration file to load.
    /// Defaults to /etc/tern/ternd.toml, if it exists.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read a message from stdin and deliver or queue it
    Deliver {
        /// The envelope sender. Use an empty string for the null sender.
        #[arg(long)]
        from: String,

        #[arg(required = true)]
        recipients: Vec<String>,
    },
    /// List the messages in the relay queue
    Queue {
        /// Return messages left marked as relaying by a previous
        /// process to the waiting state
        #[arg(long)]
        requeue: bool,
    },
    /// Show the mail exchanger that would be used for a domain
    Mx { domain: String },
}

impl Opt {
    fn load_config(&self) -> anyhow::Result<Config> {
        match &self.config {
            Some(path) => Config::load(path),
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Config::load(&path)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    // This must happen before any threads exist, and before we spawn
    // any children that could otherwise inherit the variables
    let mut listen_fds = ListenFds::from_environment();

    let _log_flusher = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: FILTER_ENV_VAR,
        default_filter: DEFAULT_FILTER,
        diag_format: opts.diag_format,
    }
    .init()?;

    let inherited = listen_fds.take_tcp_listeners();
    if !inherited.is_empty() {
        tracing::warn!(
            "closing {} inherited listening socket(s); none of these commands accept connections",
            inherited.len()
        );
    }
    drop(inherited);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let config = opts.load_config()?;
    match opts.cmd {
        Command::Deliver { from, recipients } => deliver(&config, from, recipients).await,
        Command::Queue { requeue } => list_queue(&config, requeue).await,
        Command::Mx { domain } => show_mx(&config, &domain).await,
    }
}

async fn deliver(config: &Config, from: String, recipients: Vec<String>) -> anyhow::Result<()> {
    let mut body = vec![];
    tokio::io::stdin()
        .read_to_end(&mut body)
        .await
        .context("failed to read the message from stdin")?;

    let queue = DeliveryQueue::open(&config.queue.path)?;
    let service = MailService::from_config(config, queue, SystemClock::shared())?;

    let sender = match from.trim() {
        "" | "<>" => None,
        sender => Some(sender.to_string()),
    };
    let envelope = Envelope { sender, recipients };

    let reports = service.submit(&envelope, &body, &Peer::Local, false).await;
    let mut failed = 0;
    for report in &reports {
        println!("{report}");
        if !report.is_success() {
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} recipient(s) were not accepted", reports.len());
    }
    Ok(())
}

async fn list_queue(config: &Config, requeue: bool) -> anyhow::Result<()> {
    let queue = DeliveryQueue::open(&config.queue.path)?;
    queue.read_directory().await?;

    if requeue {
        let count = queue.requeue_relaying().await?;
        println!("returned {count} message(s) to the waiting state");
    }

    let mut ids: Vec<_> = queue
        .get_waiting()
        .into_iter()
        .chain(queue.get_relaying())
        .collect();
    ids.sort();

    for id in ids {
        let Some(state) = queue.state_of(id).map(|state| state.to_string()) else {
            continue;
        };
        let created = id
            .created()
            .map(|created| DateTime::<Utc>::from(created).to_rfc3339())
            .unwrap_or_default();
        match queue.get_envelope(id).await {
            Ok(envelope) => println!(
                "{id} {state:<8} {created} from=<{}> to={}",
                envelope.sender.unwrap_or_default(),
                envelope.recipients.join(",")
            ),
            Err(err) => println!("{id} {state:<8} {created} {err:#}"),
        }
    }
    Ok(())
}

async fn show_mx(config: &Config, domain: &str) -> anyhow::Result<()> {
    let resolver = HickoryResolver::from_system_conf()?;
    let mx = MxCalculator::new(Arc::new(resolver), SystemClock::shared())
        .with_time_out_bad_mx(config.mx.bad_mx_timeout)
        .with_fallback_to_domain(config.mx.fallback_to_domain)
        .with_shuffle_equal_preference(config.mx.shuffle_equal_preference);
    let record = mx
        .get_mx(domain, config.mx.max_cname_chain)
        .await
        .with_context(|| format!("resolving the mail exchanger for {domain}"))?;
    println!("{record}");
    Ok(())
}
