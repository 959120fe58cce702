use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use log::info;

use crate::error::{Error, Result};
use crate::net::PeerAddr;

/// One allow/deny entry: an address, a CIDR block, or a literal host name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclRule {
    Net(IpNet),
    Host(String),
}

impl FromStr for AclRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<AclRule> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty ACL entry".into()));
        }
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(AclRule::Net(net));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(AclRule::Net(IpNet::from(ip)));
        }
        if s.contains(char::is_whitespace) {
            return Err(Error::InvalidAddress(format!("bad ACL entry {:?}", s)));
        }
        Ok(AclRule::Host(s.to_ascii_lowercase()))
    }
}

impl AclRule {
    fn matches(&self, peer: &PeerAddr) -> bool {
        match (self, peer) {
            (AclRule::Net(net), PeerAddr::Inet(sa)) => net.contains(&sa.ip()),
            (AclRule::Host(h), PeerAddr::Inet(sa)) => *h == sa.ip().to_string(),
            // Hostname rules double as path rules for non-DNS peers.
            (AclRule::Host(h), PeerAddr::Unix(Some(path))) => {
                path.to_string_lossy().eq_ignore_ascii_case(h)
            }
            _ => false,
        }
    }
}

/// Peer filtering: deny wins, and a non-empty allow list is exhaustive.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    allow: Vec<AclRule>,
    deny: Vec<AclRule>,
}

impl Acl {
    pub fn new(allow: Vec<AclRule>, deny: Vec<AclRule>) -> Acl {
        Acl { allow, deny }
    }

    /// Parse comma-free textual entries into an ACL.
    pub fn parse(allow: &[&str], deny: &[&str]) -> Result<Acl> {
        let allow = allow.iter().map(|s| s.parse()).collect::<Result<_>>()?;
        let deny = deny.iter().map(|s| s.parse()).collect::<Result<_>>()?;
        Ok(Acl { allow, deny })
    }

    pub fn add_allow(&mut self, rule: AclRule) {
        self.allow.push(rule);
    }

    pub fn add_deny(&mut self, rule: AclRule) {
        self.deny.push(rule);
    }

    pub fn has_allow_rules(&self) -> bool {
        !self.allow.is_empty()
    }

    /// Evaluate the peer. Deny rules are checked first and win outright;
    /// with any allow rules present, the peer must match one.
    pub fn permits(&self, peer: &PeerAddr) -> bool {
        if self.deny.iter().any(|r| r.matches(peer)) {
            info!("acl: {} matched a deny rule", peer);
            return false;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|r| r.matches(peer)) {
            info!("acl: {} not covered by the allow list", peer);
            return false;
        }
        true
    }
}
