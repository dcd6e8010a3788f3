use cidr::IpCidr;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Where a submission came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Peer {
    Tcp(IpAddr),
    Unix,
    /// Handed to us by a local program, eg: `ternd deliver`
    Local,
}

/// A list of networks, written as `10.0.0.0/8` style prefixes or
/// as bare addresses, which stand for that one host
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CidrSet(Vec<IpCidr>);

impl CidrSet {
    pub fn new(set: Vec<IpCidr>) -> Self {
        Self(set)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        self.0.iter().any(|entry| entry.contains(&ip))
    }
}

impl TryFrom<Vec<String>> for CidrSet {
    type Error = String;

    fn try_from(entries: Vec<String>) -> Result<Self, String> {
        let mut set = vec![];
        for entry in entries {
            let cidr = if entry.contains('/') {
                entry
                    .parse::<IpCidr>()
                    .map_err(|err| format!("invalid network {entry:?}: {err}"))?
            } else {
                let addr: IpAddr = entry
                    .parse()
                    .map_err(|err| format!("invalid address {entry:?}: {err}"))?;
                IpCidr::new_host(canonical(addr))
            };
            set.push(cidr);
        }
        Ok(Self(set))
    }
}

impl From<CidrSet> for Vec<String> {
    fn from(set: CidrSet) -> Self {
        set.0.iter().map(|cidr| cidr.to_string()).collect()
    }
}

/// Decides which peers may send mail onward to other hosts
#[derive(Clone, Debug, Default)]
pub struct RelayRules {
    authorized_networks: CidrSet,
}

impl RelayRules {
    pub fn new(authorized_networks: CidrSet) -> Self {
        Self {
            authorized_networks,
        }
    }

    pub fn will_relay(&self, peer: &Peer, authorized: bool) -> bool {
        if authorized {
            return true;
        }
        match peer {
            Peer::Unix | Peer::Local => true,
            Peer::Tcp(ip) => canonical(*ip).is_loopback() || self.authorized_networks.contains(*ip),
        }
    }
}

/// Treat v4-mapped v6 addresses as the v4 address they carry
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
