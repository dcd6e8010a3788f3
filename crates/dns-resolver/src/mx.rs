use crate::{normalize_name, MxAnswer, MxRecord, RecordData, ResolveError, Resolver, ResourceRecord};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_clock::Clock;
use thiserror::Error;

/// How long an exchanger stays excluded after `mark_bad`
pub const DEFAULT_TIME_OUT_BAD_MX: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_CNAME_CHAIN: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MxError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("CNAME chain for {domain} is longer than permitted: gave up after {hops} hops at {record}")]
    ChainTooLong {
        domain: String,
        record: ResourceRecord,
        hops: usize,
    },
    #[error("CNAME loop while resolving {domain}: {record}")]
    CanonicalNameLoop {
        domain: String,
        record: ResourceRecord,
    },
    #[error("no mail exchanger or address found for {0}")]
    NoAddress(String),
}

enum Step {
    Exchanges(Vec<MxRecord>),
    Follow(String),
}

/// Picks the mail exchanger to use for a domain.
///
/// Exchangers that recently failed are remembered in a negative cache
/// and skipped until `time_out_bad_mx` has elapsed, or until they are
/// explicitly marked good again.
pub struct MxCalculator {
    resolver: Arc<dyn Resolver>,
    clock: Arc<dyn Clock>,
    bad_mx: Mutex<HashMap<String, Instant>>,
    time_out_bad_mx: Duration,
    fallback_to_domain: bool,
    shuffle_equal_preference: bool,
}

impl MxCalculator {
    pub fn new(resolver: Arc<dyn Resolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            resolver,
            clock,
            bad_mx: Mutex::new(HashMap::new()),
            time_out_bad_mx: DEFAULT_TIME_OUT_BAD_MX,
            fallback_to_domain: true,
            shuffle_equal_preference: false,
        }
    }

    pub fn with_time_out_bad_mx(mut self, timeout: Duration) -> Self {
        self.time_out_bad_mx = timeout;
        self
    }

    /// When enabled, a domain whose MX lookup reports name-not-found
    /// is tried as an address instead
    pub fn with_fallback_to_domain(mut self, fallback: bool) -> Self {
        self.fallback_to_domain = fallback;
        self
    }

    /// When enabled, exchangers that share a preference are tried in
    /// random order rather than in the order the resolver returned them
    pub fn with_shuffle_equal_preference(mut self, shuffle: bool) -> Self {
        self.shuffle_equal_preference = shuffle;
        self
    }

    pub fn time_out_bad_mx(&self) -> Duration {
        self.time_out_bad_mx
    }

    pub fn fallback_to_domain(&self) -> bool {
        self.fallback_to_domain
    }

    pub fn mark_bad(&self, host: &str) {
        let now = self.clock.now();
        tracing::debug!("marking MX {host} bad");
        self.bad_mx.lock().insert(normalize_name(host), now);
    }

    pub fn mark_good(&self, host: &str) {
        self.bad_mx.lock().remove(&normalize_name(host));
    }

    /// Returns true if `host` is currently excluded from selection
    pub fn is_bad(&self, host: &str) -> bool {
        let now = self.clock.now();
        match self.bad_mx.lock().get(&normalize_name(host)) {
            Some(&marked) => !self.expired(marked, now),
            None => false,
        }
    }

    fn expired(&self, marked: Instant, now: Instant) -> bool {
        now.saturating_duration_since(marked) >= self.time_out_bad_mx
    }

    /// Resolve `domain` to the exchanger that should be tried next,
    /// following at most `max_chain_length` CNAME indirections.
    pub async fn get_mx(&self, domain: &str, max_chain_length: usize) -> Result<MxRecord, MxError> {
        let domain = normalize_name(domain);
        let mut visited = HashSet::new();
        let mut hops = 0;
        let mut name = domain.clone();

        loop {
            let answer = match self.resolver.lookup_mx(&name).await {
                Ok(answer) => answer,
                Err(err) if err.is_name_not_found() && self.fallback_to_domain => {
                    tracing::debug!(
                        "MX lookup failed: {err:#}; attempting to use hostname ({name}) directly"
                    );
                    return self.address_fallback(&name).await;
                }
                Err(err) => return Err(err.into()),
            };

            match follow_answer(
                &domain,
                &name,
                &answer,
                &mut visited,
                &mut hops,
                max_chain_length,
            )? {
                Step::Follow(canonical) => {
                    tracing::trace!("{name} is an alias for {canonical}");
                    name = canonical;
                }
                Step::Exchanges(exchanges) => {
                    return match self.select(exchanges) {
                        Some(mx) => Ok(mx),
                        None => {
                            tracing::debug!("no MX records for {name}, trying it as an address");
                            self.address_fallback(&name).await
                        }
                    };
                }
            }
        }
    }

    async fn address_fallback(&self, name: &str) -> Result<MxRecord, MxError> {
        match self.resolver.lookup_address(name).await {
            Ok(addr) => Ok(MxRecord {
                preference: 0,
                exchange: addr.to_string(),
            }),
            Err(err) if err.is_name_not_found() => Err(MxError::NoAddress(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    fn select(&self, mut exchanges: Vec<MxRecord>) -> Option<MxRecord> {
        if self.shuffle_equal_preference {
            exchanges.shuffle(&mut rand::thread_rng());
        }
        // Stable, so equal preferences keep their relative order
        exchanges.sort_by_key(|mx| mx.preference);

        let now = self.clock.now();
        let mut bad_mx = self.bad_mx.lock();
        for mx in &exchanges {
            let host = normalize_name(&mx.exchange);
            match bad_mx.get(&host) {
                None => return Some(mx.clone()),
                Some(&marked) if self.expired(marked, now) => {
                    bad_mx.remove(&host);
                    return Some(mx.clone());
                }
                Some(_) => {
                    tracing::trace!("skipping {mx}: recently marked bad");
                }
            }
        }

        // Everything is bad; trying something beats trying nothing
        exchanges.into_iter().next()
    }
}

/// Examine the answer for `name`, chasing CNAMEs through any glue
/// records that were included in the same response.
fn follow_answer(
    domain: &str,
    name: &str,
    answer: &MxAnswer,
    visited: &mut HashSet<String>,
    hops: &mut usize,
    max_chain_length: usize,
) -> Result<Step, MxError> {
    let mut by_name: HashMap<String, Vec<&ResourceRecord>> = HashMap::new();
    for record in &answer.answers {
        by_name
            .entry(normalize_name(&record.name))
            .or_default()
            .push(record);
    }

    let mut current = name.to_string();
    let mut pertinent = by_name.get(&current).cloned().unwrap_or_default();
    let mut exchanges = vec![];
    let mut idx = 0;

    while idx < pertinent.len() {
        let record = pertinent[idx];
        match &record.data {
            RecordData::Cname(canonical) => {
                let canonical = normalize_name(canonical);
                visited.insert(current.clone());
                *hops += 1;

                if visited.contains(&canonical) {
                    return Err(MxError::CanonicalNameLoop {
                        domain: domain.to_string(),
                        record: record.clone(),
                    });
                }
                if *hops > max_chain_length {
                    return Err(MxError::ChainTooLong {
                        domain: domain.to_string(),
                        record: record.clone(),
                        hops: *hops,
                    });
                }

                match by_name.get(&canonical) {
                    Some(glue) => {
                        current = canonical;
                        pertinent = glue.clone();
                        exchanges.clear();
                        idx = 0;
                        continue;
                    }
                    None => return Ok(Step::Follow(canonical)),
                }
            }
            RecordData::Mx(mx) => exchanges.push(mx.clone()),
            RecordData::Address(_) => {}
        }
        idx += 1;
    }

    Ok(Step::Exchanges(exchanges))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TestResolver;
    use futures::future::BoxFuture;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tern_clock::ManualClock;

    fn calculator(resolver: TestResolver) -> (MxCalculator, Arc<TestResolver>, Arc<ManualClock>) {
        let resolver = Arc::new(resolver);
        let clock = Arc::new(ManualClock::new());
        let mx = MxCalculator::new(resolver.clone(), clock.clone());
        (mx, resolver, clock)
    }

    fn mx(preference: u16, exchange: &str) -> MxRecord {
        MxRecord {
            preference,
            exchange: exchange.to_string(),
        }
    }

    #[test]
    fn defaults() {
        let (mx, _, _) = calculator(TestResolver::default());
        assert_eq!(mx.time_out_bad_mx(), Duration::from_secs(3600));
        assert!(mx.fallback_to_domain());
    }

    #[tokio::test]
    async fn lowest_preference_wins() {
        let (calc, _, _) = calculator(
            TestResolver::default()
                .with_mx("example.com", 2, "mx2.example.com")
                .with_mx("example.com", 1, "mx1.example.com"),
        );
        k9::assert_equal!(
            calc.get_mx("example.com", DEFAULT_MAX_CNAME_CHAIN).await,
            Ok(mx(1, "mx1.example.com"))
        );
    }

    #[tokio::test]
    async fn bad_exchanger_is_skipped_until_it_expires() {
        let (calc, _, clock) = calculator(
            TestResolver::default()
                .with_mx("example.com", 0, "good.example.com")
                .with_mx("example.com", 1, "bad.example.com")
                .with_mx("example.com", 0, "bad2.example.com"),
        );

        calc.mark_bad("good.example.com");
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Ok(mx(0, "bad2.example.com"))
        );

        clock.advance(calc.time_out_bad_mx() - Duration::from_secs(1));
        assert!(calc.is_bad("good.example.com"));

        clock.advance(Duration::from_secs(1));
        assert!(!calc.is_bad("good.example.com"));
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Ok(mx(0, "good.example.com"))
        );
    }

    #[tokio::test]
    async fn all_bad_falls_back_to_lowest_preference() {
        let (calc, _, _) = calculator(
            TestResolver::default()
                .with_mx("example.com", 1, "second.example.com")
                .with_mx("example.com", 0, "first.example.com"),
        );
        calc.mark_bad("first.example.com");
        calc.mark_bad("second.example.com");
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Ok(mx(0, "first.example.com"))
        );
    }

    #[tokio::test]
    async fn mark_good_clears_immediately() {
        let (calc, _, _) = calculator(
            TestResolver::default()
                .with_mx("example.com", 0, "first.example.com")
                .with_mx("example.com", 5, "second.example.com"),
        );
        calc.mark_bad("first.example.com");
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Ok(mx(5, "second.example.com"))
        );
        calc.mark_good("first.example.com");
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Ok(mx(0, "first.example.com"))
        );
    }

    #[tokio::test]
    async fn equal_preferences_rotate_as_hosts_go_bad() {
        let (calc, _, _) = calculator(
            TestResolver::default()
                .with_mx("example.com", 0, "mx1.example.com")
                .with_mx("example.com", 0, "mx2.example.com")
                .with_mx("example.com", 0, "mx3.example.com"),
        );

        let first = calc.get_mx("example.com", 3).await.unwrap();
        calc.mark_bad(&first.exchange);
        let second = calc.get_mx("example.com", 3).await.unwrap();
        assert_ne!(first, second);
        calc.mark_bad(&second.exchange);
        let third = calc.get_mx("example.com", 3).await.unwrap();
        assert_ne!(third, first);
        assert_ne!(third, second);

        calc.mark_good(&second.exchange);
        k9::assert_equal!(calc.get_mx("example.com", 3).await.unwrap(), second);
    }

    #[tokio::test]
    async fn shuffled_selection_stays_within_lowest_preference() {
        let (calc, _, _) = calculator(
            TestResolver::default()
                .with_mx("example.com", 0, "a.example.com")
                .with_mx("example.com", 0, "b.example.com")
                .with_mx("example.com", 10, "backup.example.com"),
        );
        let calc = calc.with_shuffle_equal_preference(true);
        for _ in 0..20 {
            let chosen = calc.get_mx("example.com", 3).await.unwrap();
            assert_eq!(chosen.preference, 0);
        }
    }

    #[tokio::test]
    async fn empty_answer_uses_address() {
        let (calc, resolver, _) = calculator(
            TestResolver::default()
                .with_answer("example.com", MxAnswer::default())
                .with_address("example.com", "10.0.0.1".parse().unwrap()),
        );
        k9::assert_equal!(calc.get_mx("example.com", 3).await, Ok(mx(0, "10.0.0.1")));
        assert_eq!(resolver.address_lookups(), 1);
    }

    #[tokio::test]
    async fn name_not_found_falls_back_to_address() {
        let (calc, _, _) = calculator(
            TestResolver::default().with_address("example.com", "10.0.0.2".parse().unwrap()),
        );
        k9::assert_equal!(calc.get_mx("example.com", 3).await, Ok(mx(0, "10.0.0.2")));
    }

    #[tokio::test]
    async fn fallback_without_address() {
        let (calc, _, _) = calculator(TestResolver::default());
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Err(MxError::NoAddress("example.com".to_string()))
        );
    }

    #[tokio::test]
    async fn fallback_disabled_propagates() {
        let (calc, resolver, _) = calculator(
            TestResolver::default().with_address("example.com", "10.0.0.2".parse().unwrap()),
        );
        let calc = calc.with_fallback_to_domain(false);
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Err(MxError::Resolve(ResolveError::NameNotFound(
                "example.com".to_string()
            )))
        );
        assert_eq!(resolver.address_lookups(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_not_masked() {
        let err = ResolveError::Transient {
            name: "example.com".to_string(),
            reason: "SERVFAIL".to_string(),
        };
        let (calc, resolver, _) = calculator(
            TestResolver::default()
                .with_mx_error("example.com", err.clone())
                .with_address("example.com", "10.0.0.2".parse().unwrap()),
        );
        k9::assert_equal!(
            calc.get_mx("example.com", 3).await,
            Err(MxError::Resolve(err))
        );
        assert_eq!(resolver.address_lookups(), 0);
    }

    #[tokio::test]
    async fn cname_is_followed() {
        let (calc, resolver, _) = calculator(
            TestResolver::default()
                .with_cname("alias.example.com", "canonical.example.com")
                .with_mx("canonical.example.com", 0, "mail.example.com"),
        );
        k9::assert_equal!(
            calc.get_mx("alias.example.com", 3).await,
            Ok(mx(0, "mail.example.com"))
        );
        assert_eq!(resolver.mx_lookups(), 2);
    }

    #[tokio::test]
    async fn cname_with_glue_records() {
        let answer = MxAnswer {
            answers: vec![
                ResourceRecord::cname("alias.example.com", "canonical.example.com"),
                ResourceRecord::mx("canonical.example.com", 0, "mail.example.com"),
            ],
            ..MxAnswer::default()
        };
        let (calc, resolver, _) =
            calculator(TestResolver::default().with_answer("alias.example.com", answer));
        k9::assert_equal!(
            calc.get_mx("alias.example.com", 3).await,
            Ok(mx(0, "mail.example.com"))
        );
        assert_eq!(resolver.mx_lookups(), 1);
    }

    #[tokio::test]
    async fn cname_loop_within_one_answer() {
        let answer = MxAnswer {
            answers: vec![
                ResourceRecord::cname("cname1.example.com", "cname2.example.com"),
                ResourceRecord::cname("cname2.example.com", "cname1.example.com"),
            ],
            ..MxAnswer::default()
        };
        let (calc, _, _) =
            calculator(TestResolver::default().with_answer("cname1.example.com", answer));
        k9::assert_equal!(
            calc.get_mx("cname1.example.com", 10).await,
            Err(MxError::CanonicalNameLoop {
                domain: "cname1.example.com".to_string(),
                record: ResourceRecord::cname("cname2.example.com", "cname1.example.com"),
            })
        );
    }

    #[tokio::test]
    async fn cname_loop_across_lookups() {
        let (calc, resolver, _) = calculator(
            TestResolver::default()
                .with_cname("a.example.com", "b.example.com")
                .with_cname("b.example.com", "a.example.com"),
        );
        let result = calc.get_mx("a.example.com", 10).await;
        assert!(
            matches!(result, Err(MxError::CanonicalNameLoop { .. })),
            "{result:?}"
        );
        assert_eq!(resolver.mx_lookups(), 2);
    }

    /// Every name is an alias for the next one in an endless series
    struct EndlessChain {
        lookups: AtomicUsize,
    }

    impl Resolver for EndlessChain {
        fn lookup_mx<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<MxAnswer, ResolveError>> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            let canonical = format!("x-{}.example.com", n + 1);
            Box::pin(async move {
                Ok(MxAnswer {
                    answers: vec![ResourceRecord::cname(name, &canonical)],
                    ..MxAnswer::default()
                })
            })
        }

        fn lookup_address<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
            Box::pin(async move { Err(ResolveError::NameNotFound(name.to_string())) })
        }
    }

    #[tokio::test]
    async fn cname_chain_too_long() {
        let resolver = Arc::new(EndlessChain {
            lookups: AtomicUsize::new(0),
        });
        let calc = MxCalculator::new(resolver.clone(), Arc::new(ManualClock::new()));
        let limit = 3;

        k9::assert_equal!(
            calc.get_mx("mail.example.com", limit).await,
            Err(MxError::ChainTooLong {
                domain: "mail.example.com".to_string(),
                record: ResourceRecord::cname("x-3.example.com", "x-4.example.com"),
                hops: limit + 1,
            })
        );
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), limit + 1);
    }

    #[tokio::test]
    async fn names_are_case_insensitive() {
        let (calc, _, _) = calculator(
            TestResolver::default().with_mx("Example.COM.", 0, "MX.example.com"),
        );
        let chosen = calc.get_mx("example.com", 3).await.unwrap();
        calc.mark_bad(&chosen.exchange);
        assert!(calc.is_bad("mx.EXAMPLE.com."));
    }
}
