use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{LOCAL_DOMAIN, SUBTYPE_LABEL};

/// Transport protocol label of a DNS-SD service type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Which advertised services a discovery session is interested in.
///
/// Also used as the type descriptor of a discovered [`ServiceRecord`], in
/// which case `subtypes` holds the subtypes the instance was matched under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceFilter {
    /// Service name without the leading underscore, e.g. "zmq"
    pub name: String,

    pub protocol: Protocol,

    /// Subtypes of interest; empty matches any subtype
    #[serde(default)]
    pub subtypes: Vec<String>,
}

impl ServiceFilter {
    pub fn new(name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            protocol,
            subtypes: Vec::new(),
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtypes.push(subtype.into());
        self
    }

    /// Fully qualified service type, e.g. "_zmq._tcp.local."
    pub fn service_type(&self) -> String {
        format!("_{}._{}.{}", self.name, self.protocol, LOCAL_DOMAIN)
    }

    /// Fully qualified subtype query, e.g. "_cpuTemp._sub._zmq._tcp.local."
    pub fn subtype_query(&self, subtype: &str) -> String {
        format!("_{}.{}.{}", subtype, SUBTYPE_LABEL, self.service_type())
    }

    /// Every query a browse for this filter has to issue, paired with the
    /// subtype it answers for. An empty subtype list browses the parent type.
    pub fn browse_queries(&self) -> Vec<(Option<String>, String)> {
        if self.subtypes.is_empty() {
            return vec![(None, self.service_type())];
        }

        self.subtypes
            .iter()
            .map(|sub| (Some(sub.clone()), self.subtype_query(sub)))
            .collect()
    }
}

impl fmt::Display for ServiceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.protocol)?;
        if !self.subtypes.is_empty() {
            write!(f, " [{}]", self.subtypes.join(","))?;
        }
        Ok(())
    }
}

/// One discovered service instance.
/// Created by the resolver when a matching advertisement resolves and never
/// mutated afterwards; a later change produces a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Type descriptor the instance was matched under
    pub service_type: ServiceFilter,

    /// Full DNS-SD instance name, e.g. "sensor-1._zmq._tcp.local."
    pub instance_name: String,

    /// Hostname, e.g. "edison.local."
    pub hostname: String,

    /// Addresses in discovery order, never empty
    pub addresses: Vec<IpAddr>,

    /// Service port, never 0
    pub port: u16,

    /// TXT record key-value pairs
    pub txt: HashMap<String, String>,

    /// First time this instance was seen in the session
    pub first_seen: DateTime<Utc>,
}

/// Addresses of one record, best candidate first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRanking(pub Vec<IpAddr>);

impl AddressRanking {
    pub fn best(&self) -> Option<IpAddr> {
        self.0.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::Index<usize> for AddressRanking {
    type Output = IpAddr;

    fn index(&self, index: usize) -> &IpAddr {
        &self.0[index]
    }
}
