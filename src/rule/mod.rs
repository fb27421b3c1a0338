//! Routing rules
//!
//! A rule is one exact-match predicate over connection metadata plus the
//! action to take when it matches. Learned rules additionally pin the
//! identity of the adapter that served the destination.

mod table;

pub use table::{Route, RuleTable};

use crate::common::Metadata;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// What to do with a matched connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterAction {
    #[default]
    Direct,
    Reject,
    Proxy,
}

impl AdapterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterAction::Direct => "Direct",
            AdapterAction::Reject => "Reject",
            AdapterAction::Proxy => "Proxy",
        }
    }
}

impl fmt::Display for AdapterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for AdapterAction {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(AdapterAction::Direct),
            "reject" => Ok(AdapterAction::Reject),
            "proxy" => Ok(AdapterAction::Proxy),
            _ => Err(Error::rule(format!("unknown adapter action: {}", s))),
        }
    }
}

/// Every rule kind the persisted format knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Domain,
    DomainKeyword,
    DomainSuffix,
    SrcIp,
    SrcIpCidr,
    SrcPort,
    DstIp,
    DstIpCidr,
    DstPort,
    Process,
    ProcessPath,
    ProcessDir,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Domain => "Domain",
            RuleKind::DomainKeyword => "DomainKey",
            RuleKind::DomainSuffix => "DomainSuffix",
            RuleKind::SrcIp => "SrcIp",
            RuleKind::SrcIpCidr => "SrcIPCIDR",
            RuleKind::SrcPort => "SrcPort",
            RuleKind::DstIp => "DstIp",
            RuleKind::DstIpCidr => "DstIPCIDR",
            RuleKind::DstPort => "DstPort",
            RuleKind::Process => "Process",
            RuleKind::ProcessPath => "ProcessPath",
            RuleKind::ProcessDir => "ProcessDir",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for RuleKind {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "domain" => RuleKind::Domain,
            "domainkey" | "domainkeyword" => RuleKind::DomainKeyword,
            "domainsuffix" => RuleKind::DomainSuffix,
            // "ScrIp" is how older stores spelled it
            "srcip" | "scrip" => RuleKind::SrcIp,
            "srcipcidr" => RuleKind::SrcIpCidr,
            "srcport" => RuleKind::SrcPort,
            "dstip" => RuleKind::DstIp,
            "dstipcidr" => RuleKind::DstIpCidr,
            "dstport" => RuleKind::DstPort,
            "process" => RuleKind::Process,
            "processpath" => RuleKind::ProcessPath,
            "processdir" => RuleKind::ProcessDir,
            _ => return Err(Error::rule(format!("unknown rule kind: {}", s))),
        };
        Ok(kind)
    }
}

/// Flat persisted / exported form of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub rule: String,
    pub payload: String,
    pub adapter: String,
    /// Identity of the adapter a learned rule is pinned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Domain(String),
    SrcIp(IpAddr),
    DstIp(IpAddr),
    SrcPort(u16),
    DstPort(u16),
}

/// One routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    matcher: Matcher,
    key: String,
    action: AdapterAction,
    proxy: Option<String>,
}

impl Rule {
    /// Build a rule of `kind` from its textual payload
    pub fn new(kind: RuleKind, payload: &str, action: AdapterAction) -> Result<Self> {
        let payload = payload.trim();
        let matcher = match kind {
            RuleKind::Domain => {
                if payload.is_empty() {
                    return Err(Error::rule("invalid rule payload: empty domain"));
                }
                Matcher::Domain(payload.to_ascii_lowercase())
            }
            RuleKind::SrcIp => Matcher::SrcIp(parse_ip(payload)?),
            RuleKind::DstIp => Matcher::DstIp(parse_ip(payload)?),
            RuleKind::SrcPort => Matcher::SrcPort(parse_port(payload)?),
            RuleKind::DstPort => Matcher::DstPort(parse_port(payload)?),
            other => {
                return Err(Error::rule(format!("unsupported rule kind: {}", other)));
            }
        };

        let key = match &matcher {
            Matcher::Domain(host) => host.clone(),
            Matcher::SrcIp(ip) | Matcher::DstIp(ip) => ip.to_string(),
            Matcher::SrcPort(port) | Matcher::DstPort(port) => port.to_string(),
        };

        Ok(Rule {
            matcher,
            key,
            action,
            proxy: None,
        })
    }

    pub fn domain(host: &str, action: AdapterAction) -> Result<Self> {
        Self::new(RuleKind::Domain, host, action)
    }

    pub fn src_ip(ip: IpAddr, action: AdapterAction) -> Self {
        Self::from_ip(Matcher::SrcIp(canonical_ip(ip)), action)
    }

    pub fn dst_ip(ip: IpAddr, action: AdapterAction) -> Self {
        Self::from_ip(Matcher::DstIp(canonical_ip(ip)), action)
    }

    fn from_ip(matcher: Matcher, action: AdapterAction) -> Self {
        let key = match &matcher {
            Matcher::SrcIp(ip) | Matcher::DstIp(ip) => ip.to_string(),
            _ => String::new(),
        };
        Rule {
            matcher,
            key,
            action,
            proxy: None,
        }
    }

    /// Pin the rule to one adapter identity
    pub fn with_proxy(mut self, identity: impl Into<String>) -> Self {
        self.proxy = Some(identity.into());
        self
    }

    /// Rebuild from the persisted form
    pub fn from_info(info: &RuleInfo) -> Result<Self> {
        let kind = RuleKind::try_from(info.rule.as_str())?;
        let action = AdapterAction::try_from(info.adapter.as_str())?;
        let rule = Self::new(kind, &info.payload, action)?;
        Ok(match info.proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(proxy) => rule.with_proxy(proxy),
            None => rule,
        })
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match &self.matcher {
            Matcher::Domain(host) => {
                !metadata.host.is_empty() && metadata.host.eq_ignore_ascii_case(host)
            }
            Matcher::SrcIp(ip) => canonical_ip(metadata.src_ip) == *ip,
            Matcher::DstIp(ip) => metadata.dst_ip.map(canonical_ip) == Some(*ip),
            Matcher::SrcPort(port) => metadata.src_port == *port,
            Matcher::DstPort(port) => metadata.dst_port == *port,
        }
    }

    /// Table key; the bare payload, shared across kinds
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn action(&self) -> AdapterAction {
        self.action
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn kind(&self) -> RuleKind {
        match self.matcher {
            Matcher::Domain(_) => RuleKind::Domain,
            Matcher::SrcIp(_) => RuleKind::SrcIp,
            Matcher::DstIp(_) => RuleKind::DstIp,
            Matcher::SrcPort(_) => RuleKind::SrcPort,
            Matcher::DstPort(_) => RuleKind::DstPort,
        }
    }

    pub fn export(&self) -> RuleInfo {
        RuleInfo {
            rule: self.kind().as_str().to_string(),
            payload: self.key.clone(),
            adapter: self.action.as_str().to_string(),
            proxy: self.proxy.clone(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) -> {}", self.kind(), self.key, self.action)
    }
}

/// IPv4-mapped IPv6 addresses compare as their IPv4 form
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

fn parse_ip(payload: &str) -> Result<IpAddr> {
    payload
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(canonical_ip)
        .map_err(|_| Error::rule(format!("invalid rule payload: {}", payload)))
}

fn parse_port(payload: &str) -> Result<u16> {
    payload
        .parse::<u16>()
        .map_err(|_| Error::rule(format!("invalid rule payload: {}", payload)))
}
