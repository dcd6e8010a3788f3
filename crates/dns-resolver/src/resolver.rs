use crate::{normalize_name, MxAnswer, MxRecord, RecordData, ResolveError, Resolver, ResourceRecord};
use anyhow::Context;
use futures::future::BoxFuture;
use hickory_resolver::proto::rr::{RData, Record, RecordType};
use hickory_resolver::TokioResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Resolves against the DNS servers from the system configuration
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let resolver = TokioResolver::builder_tokio()
            .context("failed to load the system resolver configuration")?
            .build();
        Ok(Self { resolver })
    }
}

impl From<TokioResolver> for HickoryResolver {
    fn from(resolver: TokioResolver) -> Self {
        Self { resolver }
    }
}

fn classify(name: &str, err: hickory_resolver::ResolveError) -> ResolveError {
    if err.is_nx_domain() {
        ResolveError::NameNotFound(name.to_string())
    } else {
        ResolveError::Transient {
            name: name.to_string(),
            reason: format!("{err:#}"),
        }
    }
}

fn convert_record(record: &Record) -> Option<ResourceRecord> {
    let name = normalize_name(&record.name().to_utf8());
    let data = match record.data() {
        RData::MX(mx) => RecordData::Mx(MxRecord {
            preference: mx.preference(),
            exchange: normalize_name(&mx.exchange().to_utf8()),
        }),
        RData::CNAME(cname) => RecordData::Cname(normalize_name(&cname.0.to_utf8())),
        RData::A(a) => RecordData::Address(IpAddr::V4(a.0)),
        RData::AAAA(a) => RecordData::Address(IpAddr::V6(a.0)),
        _ => return None,
    };
    Some(ResourceRecord { name, data })
}

impl Resolver for HickoryResolver {
    fn lookup_mx<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<MxAnswer, ResolveError>> {
        Box::pin(async move {
            match self.resolver.lookup(name, RecordType::MX).await {
                Ok(lookup) => Ok(MxAnswer {
                    answers: lookup.records().iter().filter_map(convert_record).collect(),
                    ..MxAnswer::default()
                }),
                // NODATA: the name exists but has no MX records
                Err(err) if err.is_no_records_found() && !err.is_nx_domain() => {
                    Ok(MxAnswer::default())
                }
                Err(err) => Err(classify(name, err)),
            }
        })
    }

    fn lookup_address<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
        Box::pin(async move {
            let lookup = self.resolver.lookup_ip(name).await.map_err(|err| {
                if err.is_no_records_found() {
                    ResolveError::NameNotFound(name.to_string())
                } else {
                    classify(name, err)
                }
            })?;
            lookup
                .iter()
                .next()
                .ok_or_else(|| ResolveError::NameNotFound(name.to_string()))
        })
    }
}

/// Answers from in-memory tables; names without an entry are
/// reported as not found.
#[derive(Default)]
pub struct TestResolver {
    mx: Mutex<HashMap<String, Result<MxAnswer, ResolveError>>>,
    addresses: Mutex<HashMap<String, Result<IpAddr, ResolveError>>>,
    mx_lookups: AtomicUsize,
    address_lookups: AtomicUsize,
}

impl TestResolver {
    fn push_answer(self, name: &str, record: ResourceRecord) -> Self {
        {
            let mut mx = self.mx.lock();
            let entry = mx
                .entry(normalize_name(name))
                .or_insert_with(|| Ok(MxAnswer::default()));
            if entry.is_err() {
                *entry = Ok(MxAnswer::default());
            }
            if let Ok(answer) = entry {
                answer.answers.push(record);
            }
        }
        self
    }

    pub fn with_mx(self, domain: &str, preference: u16, exchange: &str) -> Self {
        self.push_answer(domain, ResourceRecord::mx(domain, preference, exchange))
    }

    pub fn with_cname(self, name: &str, canonical: &str) -> Self {
        self.push_answer(name, ResourceRecord::cname(name, canonical))
    }

    /// Replace the whole response for `domain`; use this to model
    /// glue records or an empty (NODATA) answer
    pub fn with_answer(self, domain: &str, answer: MxAnswer) -> Self {
        self.mx.lock().insert(normalize_name(domain), Ok(answer));
        self
    }

    pub fn with_mx_error(self, domain: &str, err: ResolveError) -> Self {
        self.mx.lock().insert(normalize_name(domain), Err(err));
        self
    }

    pub fn with_address(self, name: &str, addr: IpAddr) -> Self {
        self.addresses.lock().insert(normalize_name(name), Ok(addr));
        self
    }

    pub fn with_address_error(self, name: &str, err: ResolveError) -> Self {
        self.addresses.lock().insert(normalize_name(name), Err(err));
        self
    }

    pub fn mx_lookups(&self) -> usize {
        self.mx_lookups.load(Ordering::SeqCst)
    }

    pub fn address_lookups(&self) -> usize {
        self.address_lookups.load(Ordering::SeqCst)
    }
}

impl Resolver for TestResolver {
    fn lookup_mx<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<MxAnswer, ResolveError>> {
        self.mx_lookups.fetch_add(1, Ordering::SeqCst);
        let result = self
            .mx
            .lock()
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_else(|| Err(ResolveError::NameNotFound(name.to_string())));
        Box::pin(async move { result })
    }

    fn lookup_address<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
        self.address_lookups.fetch_add(1, Ordering::SeqCst);
        let result = self
            .addresses
            .lock()
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_else(|| Err(ResolveError::NameNotFound(name.to_string())));
        Box::pin(async move { result })
    }
}

#[cfg(all(test, feature = "live-dns-tests"))]
mod test {
    use super::*;

    #[tokio::test]
    async fn live_mx_lookup() -> anyhow::Result<()> {
        let resolver = HickoryResolver::from_system_conf()?;
        let answer = resolver.lookup_mx("gmail.com").await?;
        assert!(answer
            .answers
            .iter()
            .any(|record| matches!(&record.data, RecordData::Mx(mx) if mx.exchange.ends_with("google.com"))));
        Ok(())
    }
}
