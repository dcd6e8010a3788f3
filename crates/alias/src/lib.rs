//! Local delivery targets.
//!
//! An alias names one or more places a message should go: another
//! address, a file to append to, a program to feed the message to, or
//! a group of any of these. Aliases may refer to each other, and the
//! graph they form is allowed to contain cycles; resolution tracks the
//! names currently being expanded and treats a repeat as contributing
//! nothing.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod file;
pub mod process;
pub mod receiver;

pub use file::{load_alias_file, parse_aliases, AliasFileError};
pub use process::{ExitOutcome, ProcessHandle, ProcessReceiver, ProcessSpawner, TokioSpawner};
pub use receiver::{FileReceiver, MessageReceiver, MultiReceiver};

/// A concrete place to deliver a message, produced by resolving aliases
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Receiver {
    /// An address with a real mailbox behind it
    Mailbox(String),
    File(PathBuf),
    Process { program: String, args: Vec<String> },
}

impl std::fmt::Display for Receiver {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Mailbox(address) => write!(fmt, "mailbox {address}"),
            Self::File(path) => write!(fmt, "file {}", path.display()),
            Self::Process { program, args } => {
                write!(fmt, "process |{program}")?;
                for arg in args {
                    write!(fmt, " {arg}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AliasNode {
    /// Another address; either a user, or the name of another alias
    Address(String),
    File(PathBuf),
    Process { program: String, args: Vec<String> },
    Group(Vec<AliasNode>),
}

/// Alias definitions keyed by lowercased local name
pub type AliasMap = BTreeMap<String, AliasNode>;

/// The set of names currently being expanded in one resolution
pub type Memo = HashSet<String>;

/// Answers whether an address has a mailbox of its own
pub trait UserDirectory: Send + Sync {
    fn user_exists(&self, address: &str) -> bool;
}

/// The key under which an alias for `address` would be found
pub fn alias_key(address: &str) -> String {
    let local = match address.rsplit_once('@') {
        Some((local, _domain)) => local,
        None => address,
    };
    local.to_lowercase()
}

impl AliasNode {
    /// Expand this node into the receivers it ultimately names.
    ///
    /// Returns `None` when an address is neither a user nor a
    /// resolvable alias. Groups always produce a set, which may be
    /// empty if none of their members resolve.
    pub fn resolve(
        &self,
        aliases: &AliasMap,
        users: &dyn UserDirectory,
    ) -> Option<BTreeSet<Receiver>> {
        let mut memo = Memo::new();
        self.resolve_with_memo(aliases, users, &mut memo)
    }

    /// Like `resolve`, continuing an expansion that is already in
    /// progress. On return `memo` holds the same names it held on entry.
    pub fn resolve_with_memo(
        &self,
        aliases: &AliasMap,
        users: &dyn UserDirectory,
        memo: &mut Memo,
    ) -> Option<BTreeSet<Receiver>> {
        match self {
            Self::Address(address) => {
                let key = address.to_lowercase();
                if !memo.insert(key.clone()) {
                    tracing::trace!("alias cycle through {address}");
                    return None;
                }

                let result = if users.user_exists(address) {
                    Some(BTreeSet::from([Receiver::Mailbox(address.clone())]))
                } else {
                    aliases
                        .get(&alias_key(address))
                        .and_then(|node| node.resolve_with_memo(aliases, users, memo))
                };

                memo.remove(&key);
                result
            }
            Self::File(path) => Some(BTreeSet::from([Receiver::File(path.clone())])),
            Self::Process { program, args } => Some(BTreeSet::from([Receiver::Process {
                program: program.clone(),
                args: args.clone(),
            }])),
            Self::Group(members) => {
                let mut receivers = BTreeSet::new();
                for member in members {
                    if let Some(resolved) = member.resolve_with_memo(aliases, users, memo) {
                        receivers.extend(resolved);
                    }
                }
                Some(receivers)
            }
        }
    }
}

impl std::fmt::Display for AliasNode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Address(address) => write!(fmt, "{address}"),
            Self::File(path) => write!(fmt, "{}", path.display()),
            Self::Process { program, args } => {
                write!(fmt, "|{program}")?;
                for arg in args {
                    write!(fmt, " {arg}")?;
                }
                Ok(())
            }
            Self::Group(members) => {
                for (idx, member) in members.iter().enumerate() {
                    if idx > 0 {
                        write!(fmt, ", ")?;
                    }
                    member.fmt(fmt)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("{program} {outcome}")]
    ProcessTerminated {
        program: String,
        outcome: ExitOutcome,
    },
    #[error("{program} {outcome} before the message was complete")]
    ProcessExitedEarly {
        program: String,
        outcome: ExitOutcome,
    },
    #[error("{program} did not complete within {}", render_duration(.timeout))]
    ProcessAliasTimeout { program: String, timeout: Duration },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Mailbox(#[from] maildir::MaildirError),
    #[error("delivery already completed or abandoned")]
    AlreadyComplete,
    #[error("{} of the deliveries failed: {}", .0.len(), render_all(.0))]
    Partial(Vec<DeliveryError>),
}

fn render_duration(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

fn render_all(errors: &[DeliveryError]) -> String {
    errors
        .iter()
        .map(|err| format!("{err:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DeliveryError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}
