//! Local domains and recipient lookup.
//!
//! Every recipient domain maps to a `Domain`. Configured domains keep
//! their users in maildirs and may define aliases; anything else falls
//! through to a default domain, which either relays or bounces.
use crate::config::Config;
use alias::{AliasMap, AliasNode, DeliveryError, MessageReceiver, Receiver, UserDirectory};
use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use maildir::Maildir;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tern_clock::Clock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecipientError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("no such user {0}")]
    UnknownUser(String),
    #[error("relaying to {0} is not permitted")]
    RelayDenied(String),
}

/// A recipient address. The domain is absent for a bare user name,
/// which belongs to the default domain if one is configured.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub local: String,
    pub domain: Option<String>,
}

impl Address {
    pub fn parse(text: &str) -> Result<Self, RecipientError> {
        let trimmed = text.trim();
        let trimmed = trimmed
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .unwrap_or(trimmed);
        let invalid = || RecipientError::InvalidAddress(text.to_string());

        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(invalid());
        }

        match trimmed.rsplit_once('@') {
            Some((local, domain)) => {
                if local.is_empty() || domain.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    local: local.to_string(),
                    domain: Some(domain.trim_end_matches('.').to_lowercase()),
                })
            }
            None => Ok(Self {
                local: trimmed.to_string(),
                domain: None,
            }),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.domain {
            Some(domain) => write!(fmt, "{}@{domain}", self.local),
            None => write!(fmt, "{}", self.local),
        }
    }
}

pub trait Domain: Send + Sync {
    /// Resolve `address`, which belongs to this domain, to the
    /// receivers that should get a copy of the message. `directory`
    /// answers for users of other domains that aliases may refer to.
    fn exists(
        &self,
        address: &Address,
        directory: &dyn UserDirectory,
    ) -> Result<BTreeSet<Receiver>, RecipientError>;

    fn has_user(&self, user: &str) -> bool;

    /// The mailbox that holds mail for `user`, if this domain stores
    /// mail locally
    fn maildir(&self, _user: &str) -> std::io::Result<Option<Arc<Maildir>>> {
        Ok(None)
    }

    /// Whether mail for this domain is delivered on this host
    fn is_local(&self) -> bool {
        true
    }
}

/// Users with maildirs under `<root>/<domain>/<user>`, plus aliases
pub struct MaildirDomain {
    name: String,
    root: PathBuf,
    users: BTreeSet<String>,
    aliases: AliasMap,
    clock: Arc<dyn Clock>,
    dir_mode: Option<u32>,
    file_mode: Option<u32>,
    maildirs: Mutex<HashMap<String, Arc<Maildir>>>,
}

impl MaildirDomain {
    pub fn new(name: &str, mail_root: &Path, clock: Arc<dyn Clock>) -> Self {
        let name = name.to_lowercase();
        Self {
            root: mail_root.join(&name),
            name,
            users: BTreeSet::new(),
            aliases: AliasMap::new(),
            clock,
            dir_mode: None,
            file_mode: None,
            maildirs: Mutex::new(HashMap::new()),
        }
    }

    /// Permission modes for the maildirs created for this domain
    pub fn with_modes(mut self, dir_mode: Option<u32>, file_mode: Option<u32>) -> Self {
        self.dir_mode = dir_mode;
        self.file_mode = file_mode;
        self
    }

    pub fn with_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.users
            .extend(users.into_iter().map(|user| user.as_ref().to_lowercase()));
        self
    }

    pub fn with_aliases(mut self, aliases: AliasMap) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn qualify(&self, receiver: Receiver) -> Receiver {
        let Receiver::Mailbox(address) = receiver else {
            return receiver;
        };
        match Address::parse(&address) {
            Ok(Address {
                local,
                domain: None,
            }) => Receiver::Mailbox(format!("{}@{}", local.to_lowercase(), self.name)),
            Ok(Address {
                local,
                domain: Some(domain),
            }) if domain == self.name => {
                Receiver::Mailbox(format!("{}@{domain}", local.to_lowercase()))
            }
            _ => Receiver::Mailbox(address),
        }
    }
}

/// Answers for this domain's own users, and defers everything else
struct ScopedDirectory<'a> {
    domain: &'a MaildirDomain,
    outer: &'a dyn UserDirectory,
}

impl UserDirectory for ScopedDirectory<'_> {
    fn user_exists(&self, address: &str) -> bool {
        match Address::parse(address) {
            Ok(Address {
                local,
                domain: None,
            }) => self.domain.has_user(&local),
            Ok(Address {
                local,
                domain: Some(domain),
            }) if domain == self.domain.name => self.domain.has_user(&local),
            Ok(_) => self.outer.user_exists(address),
            Err(_) => false,
        }
    }
}

impl Domain for MaildirDomain {
    fn exists(
        &self,
        address: &Address,
        directory: &dyn UserDirectory,
    ) -> Result<BTreeSet<Receiver>, RecipientError> {
        let full = format!("{}@{}", address.local, self.name);
        let scoped = ScopedDirectory {
            domain: self,
            outer: directory,
        };
        match AliasNode::Address(full.clone()).resolve(&self.aliases, &scoped) {
            Some(receivers) if !receivers.is_empty() => Ok(receivers
                .into_iter()
                .map(|receiver| self.qualify(receiver))
                .collect()),
            _ => Err(RecipientError::UnknownUser(full)),
        }
    }

    fn has_user(&self, user: &str) -> bool {
        self.users.contains(&user.to_lowercase())
    }

    fn maildir(&self, user: &str) -> std::io::Result<Option<Arc<Maildir>>> {
        let user = user.to_lowercase();
        if !self.users.contains(&user) {
            return Ok(None);
        }

        let mut maildirs = self.maildirs.lock();
        if let Some(maildir) = maildirs.get(&user) {
            return Ok(Some(maildir.clone()));
        }

        let maildir = Maildir::with_clock(self.root.join(&user), self.clock.clone())
            .with_dir_mode(self.dir_mode)
            .with_file_mode(self.file_mode);
        maildir.initialize()?;
        tracing::debug!("initialized maildir {}", maildir.path().display());
        let maildir = Arc::new(maildir);
        maildirs.insert(user, maildir.clone());
        Ok(Some(maildir))
    }
}

/// Rejects everyone
pub struct BounceDomain;

impl Domain for BounceDomain {
    fn exists(
        &self,
        address: &Address,
        _directory: &dyn UserDirectory,
    ) -> Result<BTreeSet<Receiver>, RecipientError> {
        Err(RecipientError::UnknownUser(address.to_string()))
    }

    fn has_user(&self, _user: &str) -> bool {
        false
    }
}

/// Accepts everyone, for delivery by relay
pub struct RelayDomain;

impl Domain for RelayDomain {
    fn exists(
        &self,
        address: &Address,
        _directory: &dyn UserDirectory,
    ) -> Result<BTreeSet<Receiver>, RecipientError> {
        Ok(BTreeSet::from([Receiver::Mailbox(address.to_string())]))
    }

    fn has_user(&self, _user: &str) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        false
    }
}

/// Routes addresses to their domain, falling back to a default
/// domain for names that are not configured.
pub struct DomainWithDefault {
    domains: BTreeMap<String, Arc<dyn Domain>>,
    fallback: Arc<dyn Domain>,
    default_domain: Option<String>,
}

impl DomainWithDefault {
    pub fn new(fallback: Arc<dyn Domain>) -> Self {
        Self {
            domains: BTreeMap::new(),
            fallback,
            default_domain: None,
        }
    }

    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let mut domains = Self::new(Arc::new(RelayDomain));
        for entry in &config.domains {
            let mut domain = MaildirDomain::new(&entry.name, &config.maildir.root, clock.clone())
                .with_users(&entry.users)
                .with_modes(config.maildir.dir_mode, config.maildir.file_mode);
            if let Some(path) = &entry.aliases {
                let aliases = alias::load_alias_file(path)
                    .with_context(|| format!("loading aliases for {}", entry.name))?;
                tracing::debug!("{}: loaded {} aliases", entry.name, aliases.len());
                domain = domain.with_aliases(aliases);
            }
            domains.add_domain(&entry.name, Arc::new(domain));
            if entry.default {
                domains.set_default_domain(&entry.name);
            }
        }
        Ok(domains)
    }

    pub fn add_domain(&mut self, name: &str, domain: Arc<dyn Domain>) {
        self.domains.insert(name.to_lowercase(), domain);
    }

    /// Bare user names are taken to belong to `name`
    pub fn set_default_domain(&mut self, name: &str) {
        self.default_domain.replace(name.to_lowercase());
    }

    pub fn qualify(&self, mut address: Address) -> Address {
        if address.domain.is_none() {
            address.domain = self.default_domain.clone();
        }
        address
    }

    pub fn domain_for(&self, domain: &str) -> &Arc<dyn Domain> {
        self.domains
            .get(&domain.to_lowercase())
            .unwrap_or(&self.fallback)
    }

    /// Whether mail for `domain` is delivered on this host
    pub fn is_local(&self, domain: &str) -> bool {
        self.domain_for(domain).is_local()
    }

    pub fn exists(&self, address: &Address) -> Result<BTreeSet<Receiver>, RecipientError> {
        let address = self.qualify(address.clone());
        let Some(domain) = &address.domain else {
            return Err(RecipientError::UnknownUser(address.local));
        };
        self.domain_for(domain).exists(&address, self)
    }

    /// The local mailbox for a fully qualified address
    pub fn maildir_for(&self, address: &str) -> std::io::Result<Option<Arc<Maildir>>> {
        match Address::parse(address).map(|address| self.qualify(address)) {
            Ok(Address {
                local,
                domain: Some(domain),
            }) => self.domain_for(&domain).maildir(&local),
            _ => Ok(None),
        }
    }
}

impl UserDirectory for DomainWithDefault {
    fn user_exists(&self, address: &str) -> bool {
        match Address::parse(address).map(|address| self.qualify(address)) {
            Ok(Address {
                local,
                domain: Some(domain),
            }) => self.domain_for(&domain).has_user(&local),
            _ => false,
        }
    }
}

/// Collects the message and appends it to a maildir once complete
pub struct MaildirReceiver {
    maildir: Arc<Maildir>,
    buffer: Option<Vec<u8>>,
}

impl MaildirReceiver {
    pub fn new(maildir: Arc<Maildir>) -> Self {
        Self {
            maildir,
            buffer: Some(vec![]),
        }
    }
}

#[async_trait]
impl MessageReceiver for MaildirReceiver {
    async fn line_received(&mut self, line: &[u8]) -> Result<(), DeliveryError> {
        let buffer = self
            .buffer
            .as_mut()
            .ok_or(DeliveryError::AlreadyComplete)?;
        buffer.extend_from_slice(line);
        buffer.push(b'\n');
        Ok(())
    }

    fn eom_received(&mut self) -> BoxFuture<'static, Result<(), DeliveryError>> {
        let Some(data) = self.buffer.take() else {
            return futures::future::ready(Err(DeliveryError::AlreadyComplete)).boxed();
        };
        let maildir = self.maildir.clone();
        async move {
            let name = maildir.append_message(&data).await?;
            tracing::debug!("delivered {name} to {}", maildir.path().display());
            Ok(())
        }
        .boxed()
    }

    fn connection_lost(&mut self) {
        self.buffer.take();
    }
}
