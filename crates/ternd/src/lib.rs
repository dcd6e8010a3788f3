//! The tern mail daemon: local delivery, the relay queue and the
//! machinery that drains it.
pub mod bounce;
pub mod config;
pub mod diagnostics;
pub mod domain;
pub mod duration;
pub mod manager;
pub mod relay_rules;
pub mod service;
pub mod session;

pub use config::Config;
pub use manager::{RelayManager, RelayTransport};
pub use service::{MailService, RecipientOutcome, RecipientReport};
pub use session::{RelayObserver, RelaySession, SessionState, SmtpStatus};
