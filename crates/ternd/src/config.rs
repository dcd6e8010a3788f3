use anyhow::Context;
use serde::{Deserialize, Serialize};
use crate::relay_rules::CidrSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tern/ternd.toml";

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mx: MxConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub maildir: MaildirConfig,
    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MxConfig {
    /// How long an exchanger stays out of rotation after a failure
    #[serde(default = "MxConfig::default_bad_mx_timeout", with = "crate::duration")]
    pub bad_mx_timeout: Duration,
    #[serde(default = "MxConfig::default_max_cname_chain")]
    pub max_cname_chain: usize,
    /// Use the domain's own address when it has no MX records
    #[serde(default = "default_true")]
    pub fallback_to_domain: bool,
    #[serde(default)]
    pub shuffle_equal_preference: bool,
}

impl MxConfig {
    fn default_bad_mx_timeout() -> Duration {
        dns_resolver::DEFAULT_TIME_OUT_BAD_MX
    }

    fn default_max_cname_chain() -> usize {
        dns_resolver::DEFAULT_MAX_CNAME_CHAIN
    }
}

impl Default for MxConfig {
    fn default() -> Self {
        Self {
            bad_mx_timeout: Self::default_bad_mx_timeout(),
            max_cname_chain: Self::default_max_cname_chain(),
            fallback_to_domain: true,
            shuffle_equal_preference: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "QueueConfig::default_path")]
    pub path: PathBuf,
}

impl QueueConfig {
    fn default_path() -> PathBuf {
        "/var/spool/tern/queue".into()
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MaildirConfig {
    /// Mailboxes live in `<root>/<domain>/<user>`
    #[serde(default = "MaildirConfig::default_root")]
    pub root: PathBuf,
    /// Permission mode for newly created maildir directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_mode: Option<u32>,
    /// Permission mode for delivered message files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
}

impl MaildirConfig {
    fn default_root() -> PathBuf {
        "/var/spool/tern/mail".into()
    }
}

impl Default for MaildirConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            dir_mode: None,
            file_mode: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
    /// An aliases file for this domain
    #[serde(default)]
    pub aliases: Option<PathBuf>,
    /// Recipients given without a domain belong to this one
    #[serde(default)]
    pub default: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default = "RelayConfig::default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "RelayConfig::default_max_messages_per_connection")]
    pub max_messages_per_connection: usize,
    #[serde(
        default = "RelayConfig::default_check_interval",
        with = "crate::duration"
    )]
    pub check_interval: Duration,
    /// How long to hold a batch whose MX could not be resolved
    #[serde(
        default = "RelayConfig::default_mx_failure_delay",
        with = "crate::duration"
    )]
    pub mx_failure_delay: Duration,
    #[serde(
        default = "RelayConfig::default_retry_initial",
        with = "crate::duration"
    )]
    pub retry_initial: Duration,
    #[serde(default = "RelayConfig::default_retry_max", with = "crate::duration")]
    pub retry_max: Duration,
    /// Peers that may relay without authenticating
    #[serde(default)]
    pub authorized_networks: CidrSet,
}

impl RelayConfig {
    fn default_max_connections() -> usize {
        2
    }

    fn default_max_messages_per_connection() -> usize {
        10
    }

    fn default_check_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_mx_failure_delay() -> Duration {
        Duration::from_secs(30)
    }

    fn default_retry_initial() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_retry_max() -> Duration {
        Duration::from_secs(4 * 60 * 60)
    }

    /// The delay before retry number `attempt` (starting at 1) of a
    /// message that failed transiently
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_initial
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.retry_max)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            max_messages_per_connection: Self::default_max_messages_per_connection(),
            check_interval: Self::default_check_interval(),
            mx_failure_delay: Self::default_mx_failure_delay(),
            retry_initial: Self::default_retry_initial(),
            retry_max: Self::default_retry_max(),
            authorized_networks: CidrSet::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    #[serde(
        default = "DeliveryConfig::default_process_completion_timeout",
        with = "crate::duration"
    )]
    pub process_completion_timeout: Duration,
}

impl DeliveryConfig {
    fn default_process_completion_timeout() -> Duration {
        alias::process::DEFAULT_COMPLETION_TIMEOUT
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            process_completion_timeout: Self::default_process_completion_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.relay.max_connections == 0 {
            anyhow::bail!("relay.max_connections must be at least 1");
        }
        if self.relay.max_messages_per_connection == 0 {
            anyhow::bail!("relay.max_messages_per_connection must be at least 1");
        }

        let mut seen = std::collections::HashSet::new();
        for domain in &self.domains {
            if !seen.insert(domain.name.to_lowercase()) {
                anyhow::bail!("domain {} is defined more than once", domain.name);
            }
        }
        let defaults: Vec<&str> = self
            .domains
            .iter()
            .filter(|domain| domain.default)
            .map(|domain| domain.name.as_str())
            .collect();
        if defaults.len() > 1 {
            anyhow::bail!(
                "only one domain may be the default, but {} are: {}",
                defaults.len(),
                defaults.join(", ")
            );
        }
        Ok(())
    }

    /// The domain that unqualified recipients belong to
    pub fn default_domain(&self) -> Option<&str> {
        self.domains
            .iter()
            .find(|domain| domain.default)
            .map(|domain| domain.name.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_is_valid() {
        let config = Config::parse("").unwrap();
        k9::assert_equal!(config, Config::default());
        assert_eq!(config.mx.bad_mx_timeout, Duration::from_secs(3600));
        assert_eq!(config.mx.max_cname_chain, 3);
        assert!(config.mx.fallback_to_domain);
        assert_eq!(config.relay.max_connections, 2);
        assert_eq!(config.relay.max_messages_per_connection, 10);
        assert_eq!(config.delivery.process_completion_timeout, Duration::from_secs(60));
    }

    #[test]
    fn full() {
        let config = Config::parse(
            r#"
[mx]
bad_mx_timeout = "10m"
max_cname_chain = 5
fallback_to_domain = false
shuffle_equal_preference = true

[queue]
path = "/tmp/q"

[maildir]
root = "/tmp/mail"
dir_mode = 0o700
file_mode = 0o600

[[domain]]
name = "example.com"
users = ["alice", "bob"]
aliases = "/etc/tern/aliases"
default = true

[[domain]]
name = "example.org"

[relay]
max_connections = 4
check_interval = 15
mx_failure_delay = "1m"
retry_initial = "1m 30s"
authorized_networks = ["10.0.0.1", "192.168.0.0/16", "::1"]

[delivery]
process_completion_timeout = 2.5
"#,
        )
        .unwrap();

        assert_eq!(config.mx.bad_mx_timeout, Duration::from_secs(600));
        assert_eq!(config.mx.max_cname_chain, 5);
        assert!(!config.mx.fallback_to_domain);
        assert!(config.mx.shuffle_equal_preference);
        assert_eq!(config.queue.path, PathBuf::from("/tmp/q"));
        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.default_domain(), Some("example.com"));
        k9::assert_equal!(config.domains[0].users, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(config.relay.max_connections, 4);
        assert_eq!(config.relay.check_interval, Duration::from_secs(15));
        assert_eq!(config.relay.retry_initial, Duration::from_secs(90));
        assert_eq!(config.relay.authorized_networks.len(), 3);
        assert!(config
            .relay
            .authorized_networks
            .contains("192.168.7.7".parse().unwrap()));
        assert_eq!(config.maildir.dir_mode, Some(0o700));
        assert_eq!(config.maildir.file_mode, Some(0o600));
        assert_eq!(
            config.delivery.process_completion_timeout,
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = Config::parse("[relay]\nmax_connection = 3\n").unwrap_err();
        assert!(format!("{err:#}").contains("max_connection"), "{err:#}");
    }

    #[test]
    fn rejects_bad_networks() {
        let err = Config::parse("[relay]\nauthorized_networks = [\"10.1.2.3/40\"]\n").unwrap_err();
        assert!(format!("{err:#}").contains("10.1.2.3/40"), "{err:#}");
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(Config::parse("[relay]\nretry_max = \"soon\"\n").is_err());
        assert!(Config::parse("[relay]\nretry_max = -5\n").is_err());
    }

    #[test]
    fn rejects_inconsistent_domains() {
        let err = Config::parse(
            "[[domain]]\nname = \"a\"\ndefault = true\n[[domain]]\nname = \"b\"\ndefault = true\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("only one domain"), "{err:#}");

        let err = Config::parse("[[domain]]\nname = \"a\"\n[[domain]]\nname = \"A\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("more than once"), "{err:#}");
    }

    #[test]
    fn durations_round_trip_through_humantime() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("bad_mx_timeout = \"1h\""), "{text}");
        k9::assert_equal!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    fn backoff() {
        let relay = RelayConfig::default();
        assert_eq!(relay.delay_for_attempt(1), Duration::from_secs(300));
        assert_eq!(relay.delay_for_attempt(2), Duration::from_secs(600));
        assert_eq!(relay.delay_for_attempt(3), Duration::from_secs(1200));
        assert_eq!(relay.delay_for_attempt(7), Duration::from_secs(4 * 3600));
        assert_eq!(relay.delay_for_attempt(200), Duration::from_secs(4 * 3600));
    }
}
