//! Connection matchers
//!
//! The pre-auth counterpart of `matcher`: these run before the SSH
//! handshake, when only the network endpoints of the connection are known,
//! and decide which configurator supplies the handshake parameters. They
//! deliberately cannot see authenticated data.

use std::net::SocketAddr;

use anyhow::Result;
use serde::Deserialize;

use crate::matcher::{IpRanges, RangesConfig};

/// What a config matcher gets to look at: the two ends of the TCP
/// connection, nothing else.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// A predicate deciding whether a configurator applies to a connection.
pub trait ConfigMatcher: Send + Sync {
    fn should_configure(&self, conn: &ConnInfo) -> bool;
}

/// AND-combined group of config matchers; empty matches everything.
#[derive(Default)]
pub struct ConfigMatcherSet(Vec<Box<dyn ConfigMatcher>>);

impl ConfigMatcherSet {
    pub fn new(matchers: Vec<Box<dyn ConfigMatcher>>) -> Self {
        Self(matchers)
    }

    pub fn should_configure(&self, conn: &ConnInfo) -> bool {
        self.0.iter().all(|m| m.should_configure(conn))
    }
}

/// OR-combined group of config matcher sets; empty matches everything.
#[derive(Default)]
pub struct ConfigMatcherSets(Vec<ConfigMatcherSet>);

impl ConfigMatcherSets {
    pub fn new(sets: Vec<ConfigMatcherSet>) -> Self {
        Self(sets)
    }

    pub fn any_match(&self, conn: &ConnInfo) -> bool {
        self.0.is_empty() || self.0.iter().any(|s| s.should_configure(conn))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Matches connections by client IP or CIDR range.
pub struct MatchConfigRemoteIp {
    ranges: IpRanges,
}

impl MatchConfigRemoteIp {
    pub fn new(ranges: &[String]) -> Result<Self> {
        Ok(Self {
            ranges: IpRanges::parse(ranges)?,
        })
    }
}

impl ConfigMatcher for MatchConfigRemoteIp {
    fn should_configure(&self, conn: &ConnInfo) -> bool {
        self.ranges.contains(&conn.remote_addr)
    }
}

/// Matches connections by the listener IP or CIDR range.
pub struct MatchConfigLocalIp {
    ranges: IpRanges,
}

impl MatchConfigLocalIp {
    pub fn new(ranges: &[String]) -> Result<Self> {
        Ok(Self {
            ranges: IpRanges::parse(ranges)?,
        })
    }
}

impl ConfigMatcher for MatchConfigLocalIp {
    fn should_configure(&self, conn: &ConnInfo) -> bool {
        self.ranges.contains(&conn.local_addr)
    }
}

/// Negates the OR of its inner matcher sets.
pub struct MatchConfigNot {
    inner: ConfigMatcherSets,
}

impl MatchConfigNot {
    pub fn new(inner: ConfigMatcherSets) -> Self {
        Self { inner }
    }
}

impl ConfigMatcher for MatchConfigNot {
    fn should_configure(&self, conn: &ConnInfo) -> bool {
        if self.inner.is_empty() {
            return true;
        }
        !self.inner.any_match(conn)
    }
}

/// One config matcher set as written in config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigMatcherSetConfig {
    #[serde(default)]
    pub remote_ip: Option<RangesConfig>,
    #[serde(default)]
    pub local_ip: Option<RangesConfig>,
    #[serde(default)]
    pub not: Option<Vec<ConfigMatcherSetConfig>>,
}

/// Builds the OR-of-AND config matcher sets from their config form.
pub fn provision_config_matcher_sets(
    configs: &[ConfigMatcherSetConfig],
) -> Result<ConfigMatcherSets> {
    let mut sets = Vec::with_capacity(configs.len());
    for config in configs {
        let mut matchers: Vec<Box<dyn ConfigMatcher>> = Vec::new();
        if let Some(remote) = &config.remote_ip {
            matchers.push(Box::new(MatchConfigRemoteIp::new(&remote.ranges)?));
        }
        if let Some(local) = &config.local_ip {
            matchers.push(Box::new(MatchConfigLocalIp::new(&local.ranges)?));
        }
        if let Some(inner) = &config.not {
            matchers.push(Box::new(MatchConfigNot::new(provision_config_matcher_sets(
                inner,
            )?)));
        }
        sets.push(ConfigMatcherSet::new(matchers));
    }
    Ok(ConfigMatcherSets::new(sets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(remote: &str, local: &str) -> ConnInfo {
        ConnInfo {
            remote_addr: remote.parse().unwrap(),
            local_addr: local.parse().unwrap(),
        }
    }

    #[test]
    fn empty_sets_match_all_connections() {
        let sets = ConfigMatcherSets::default();
        assert!(sets.any_match(&conn("10.1.2.3:50000", "0.0.0.0:22")));
    }

    #[test]
    fn remote_and_local_are_distinct_endpoints() {
        let c = conn("10.1.2.3:50000", "192.168.0.1:22");
        let remote = MatchConfigRemoteIp::new(&["10.0.0.0/8".into()]).unwrap();
        let local = MatchConfigLocalIp::new(&["10.0.0.0/8".into()]).unwrap();
        assert!(remote.should_configure(&c));
        assert!(!local.should_configure(&c));
    }

    #[test]
    fn not_inverts_inner_sets() {
        let configs: Vec<ConfigMatcherSetConfig> = serde_json::from_value(serde_json::json!([
            {"not": [{"remote_ip": {"ranges": ["10.0.0.0/8"]}}]}
        ]))
        .unwrap();
        let sets = provision_config_matcher_sets(&configs).unwrap();
        assert!(!sets.any_match(&conn("10.1.2.3:50000", "0.0.0.0:22")));
        assert!(sets.any_match(&conn("192.168.0.9:50000", "0.0.0.0:22")));
    }
}
