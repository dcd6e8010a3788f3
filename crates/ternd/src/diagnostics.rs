use clap::ValueEnum;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const FILTER_ENV_VAR: &str = "TERND_LOG";
pub const DEFAULT_FILTER: &str = "ternd=info,dns_resolver=info,spool=info,alias=info,maildir=info";

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl LoggingConfig<'_> {
    /// Install the global subscriber.
    /// When logging to files, the returned guard must be held until
    /// exit, otherwise buffered lines are lost.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let mut guard = None;
        let log_writer = if let Some(log_dir) = &self.log_dir {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
            let (non_blocking, flusher) = tracing_appender::non_blocking(file_appender);
            guard.replace(flusher);
            BoxMakeWriter::new(non_blocking)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let env_filter = EnvFilter::try_new(
            std::env::var(self.filter_env_var)
                .as_deref()
                .unwrap_or(self.default_filter),
        )?;
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .try_init()?;

        Ok(guard)
    }
}
