use futures::future::BoxFuture;
use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;

mod mx;
mod resolver;

pub use mx::{MxCalculator, MxError, DEFAULT_MAX_CNAME_CHAIN, DEFAULT_TIME_OUT_BAD_MX};
pub use resolver::{HickoryResolver, TestResolver};

/// A mail exchanger and its relative preference (lower is more preferred)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

impl std::fmt::Display for MxRecord {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} {}", self.preference, self.exchange)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum RecordData {
    Mx(MxRecord),
    Cname(String),
    Address(IpAddr),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceRecord {
    pub name: String,
    pub data: RecordData,
}

impl ResourceRecord {
    pub fn mx(name: &str, preference: u16, exchange: &str) -> Self {
        Self {
            name: name.to_string(),
            data: RecordData::Mx(MxRecord {
                preference,
                exchange: exchange.to_string(),
            }),
        }
    }

    pub fn cname(name: &str, canonical: &str) -> Self {
        Self {
            name: name.to_string(),
            data: RecordData::Cname(canonical.to_string()),
        }
    }

    pub fn address(name: &str, addr: IpAddr) -> Self {
        Self {
            name: name.to_string(),
            data: RecordData::Address(addr),
        }
    }
}

impl std::fmt::Display for ResourceRecord {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.data {
            RecordData::Mx(mx) => write!(fmt, "{} MX {mx}", self.name),
            RecordData::Cname(canonical) => write!(fmt, "{} CNAME {canonical}", self.name),
            RecordData::Address(addr) => write!(fmt, "{} A {addr}", self.name),
        }
    }
}

/// The three sections of a response to an MX query
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MxAnswer {
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// An authoritative negative answer
    #[error("DNS name {0} not found")]
    NameNotFound(String),
    /// Timeouts, SERVFAIL and anything else that may succeed on retry
    #[error("DNS lookup for {name} failed: {reason}")]
    Transient { name: String, reason: String },
}

impl ResolveError {
    pub fn is_name_not_found(&self) -> bool {
        matches!(self, Self::NameNotFound(_))
    }
}

/// A trait for entities that perform DNS resolution.
pub trait Resolver: Sync + Send {
    /// Query MX records for `name`.
    /// A name that exists but has no MX records produces an
    /// empty answer rather than an error.
    fn lookup_mx<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<MxAnswer, ResolveError>>;

    fn lookup_address<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>>;
}

/// DNS names compare case-insensitively and the root label is implied
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize_name("Mail.Example.COM."), "mail.example.com");
        assert_eq!(normalize_name("example.com"), "example.com");
    }

    #[test]
    fn record_display() {
        assert_eq!(
            ResourceRecord::cname("x-3.example.com", "x-4.example.com").to_string(),
            "x-3.example.com CNAME x-4.example.com"
        );
        assert_eq!(
            ResourceRecord::mx("example.com", 10, "mx.example.com").to_string(),
            "example.com MX 10 mx.example.com"
        );
    }
}
