//! Session matchers
//!
//! Predicates over an authenticated session. Matchers are grouped into
//! sets: every matcher in a set must match (AND), and a list of sets
//! matches if any set does (OR). An empty list of sets matches everything.
//!
//! These run post-auth with the full session view. The pre-auth world,
//! which only sees network endpoints, lives in `config_matcher`.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Deserialize;

use crate::session::Session;

/// A predicate consulted to decide whether an actor should act on a session.
pub trait ActorMatcher: Send + Sync {
    fn should_act(&self, session: &Session) -> bool;
}

/// AND-combined group of matchers. An empty set matches every session.
#[derive(Default)]
pub struct MatcherSet(Vec<Box<dyn ActorMatcher>>);

impl MatcherSet {
    pub fn new(matchers: Vec<Box<dyn ActorMatcher>>) -> Self {
        Self(matchers)
    }

    pub fn should_act(&self, session: &Session) -> bool {
        self.0.iter().all(|m| m.should_act(session))
    }
}

/// OR-combined group of matcher sets. An empty collection matches every
/// session, so an actor without matchers acts on all of them.
#[derive(Default)]
pub struct MatcherSets(Vec<MatcherSet>);

impl MatcherSets {
    pub fn new(sets: Vec<MatcherSet>) -> Self {
        Self(sets)
    }

    pub fn any_match(&self, session: &Session) -> bool {
        self.0.is_empty() || self.0.iter().any(|s| s.should_act(session))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parsed IP ranges shared by the address matchers and the forward askers.
/// A bare IP is read as a host route (/32 or /128).
#[derive(Debug, Clone)]
pub struct IpRanges(Vec<IpNet>);

impl IpRanges {
    pub fn parse(ranges: &[String]) -> Result<Self> {
        let mut nets = Vec::with_capacity(ranges.len());
        for raw in ranges {
            let net = if raw.contains('/') {
                raw.parse::<IpNet>()
                    .with_context(|| format!("parsing CIDR expression: {raw}"))?
            } else {
                let ip: IpAddr = raw
                    .parse()
                    .with_context(|| format!("invalid IP address: {raw}"))?;
                IpNet::from(ip)
            };
            nets.push(net);
        }
        Ok(Self(nets))
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.0.iter().any(|net| net.contains(&addr.ip()))
    }
}

/// Matches sessions by client IP or CIDR range.
pub struct MatchRemoteIp {
    ranges: IpRanges,
}

impl MatchRemoteIp {
    pub fn new(ranges: &[String]) -> Result<Self> {
        Ok(Self {
            ranges: IpRanges::parse(ranges)?,
        })
    }
}

impl ActorMatcher for MatchRemoteIp {
    fn should_act(&self, session: &Session) -> bool {
        self.ranges.contains(&session.remote_addr())
    }
}

/// Matches sessions by the server-side IP or CIDR range.
pub struct MatchLocalIp {
    ranges: IpRanges,
}

impl MatchLocalIp {
    pub fn new(ranges: &[String]) -> Result<Self> {
        Ok(Self {
            ranges: IpRanges::parse(ranges)?,
        })
    }
}

impl ActorMatcher for MatchLocalIp {
    fn should_act(&self, session: &Session) -> bool {
        self.ranges.contains(&session.local_addr())
    }
}

/// Matches sessions by exact username.
pub struct MatchUser {
    users: HashSet<String>,
}

impl MatchUser {
    pub fn new(users: Vec<String>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

impl ActorMatcher for MatchUser {
    fn should_act(&self, session: &Session) -> bool {
        self.users.contains(session.user())
    }
}

/// Matches sessions whose authenticated user belongs to any of the named
/// groups.
pub struct MatchGroup {
    groups: HashSet<String>,
}

impl MatchGroup {
    pub fn new(groups: Vec<String>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
        }
    }
}

impl ActorMatcher for MatchGroup {
    fn should_act(&self, session: &Session) -> bool {
        session
            .account()
            .groups()
            .iter()
            .any(|g| self.groups.contains(g.name()))
    }
}

/// Pattern table keyed by field name. `None` is distinct from an empty
/// pattern list: an empty list never matches a present value, and a `None`
/// list never matches an absent one.
pub type PatternMap = HashMap<String, Option<Vec<String>>>;

/// Matches sessions by values in the permission extensions map.
pub struct MatchExtension {
    patterns: PatternMap,
}

impl MatchExtension {
    pub fn new(patterns: PatternMap) -> Self {
        Self { patterns }
    }
}

impl ActorMatcher for MatchExtension {
    fn should_act(&self, session: &Session) -> bool {
        match_permission_map(&self.patterns, &session.permissions().extensions)
    }
}

/// Matches sessions by values in the permission critical-options map.
pub struct MatchCriticalOption {
    patterns: PatternMap,
}

impl MatchCriticalOption {
    pub fn new(patterns: PatternMap) -> Self {
        Self { patterns }
    }
}

impl ActorMatcher for MatchCriticalOption {
    fn should_act(&self, session: &Session) -> bool {
        match_permission_map(&self.patterns, &session.permissions().critical_options)
    }
}

fn match_permission_map(patterns: &PatternMap, actual: &HashMap<String, String>) -> bool {
    for (field, value) in actual {
        for (name, allowed) in patterns {
            if !field.eq_ignore_ascii_case(name) {
                continue;
            }
            let value = value.to_lowercase();
            match allowed {
                Some(list) if list.is_empty() && !value.is_empty() => continue,
                None if value.is_empty() => continue,
                _ => {}
            }
            for pattern in allowed.iter().flatten() {
                if wildcard_match(&pattern.to_lowercase(), &value) {
                    return true;
                }
            }
        }
    }
    false
}

/// Wildcard value matching: `*` matches anything, `*x*` is substring,
/// `*x` suffix, `x*` prefix, anything else is equality. Both sides are
/// expected lowercased by the caller.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        _ if pattern == "*" => true,
        (Some(_), Some(_)) => value.contains(&pattern[1..pattern.len() - 1]),
        (Some(suffix), None) => value.ends_with(suffix),
        (None, Some(prefix)) => value.starts_with(prefix),
        (None, None) => value == pattern,
    }
}

/// Negates the OR of its inner matcher sets.
pub struct MatchNot {
    inner: MatcherSets,
}

impl MatchNot {
    pub fn new(inner: MatcherSets) -> Self {
        Self { inner }
    }
}

impl ActorMatcher for MatchNot {
    fn should_act(&self, session: &Session) -> bool {
        // No inner set matched nothing, so the negation of an empty
        // collection holds. any_match treats empty as match-all, hence the
        // explicit case.
        if self.inner.is_empty() {
            return true;
        }
        !self.inner.any_match(session)
    }
}

/// One matcher set as it appears in config: an object keyed by matcher
/// name. Absent keys contribute no matcher.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatcherSetConfig {
    #[serde(default)]
    pub remote_ip: Option<RangesConfig>,
    #[serde(default)]
    pub local_ip: Option<RangesConfig>,
    #[serde(default)]
    pub user: Option<UsersConfig>,
    #[serde(default)]
    pub group: Option<GroupsConfig>,
    #[serde(default)]
    pub extension: Option<PatternMap>,
    #[serde(default)]
    pub critical_option: Option<PatternMap>,
    #[serde(default)]
    pub not: Option<Vec<MatcherSetConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangesConfig {
    #[serde(default)]
    pub ranges: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsersConfig {
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupsConfig {
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Builds the OR-of-AND matcher sets from their config form.
pub fn provision_matcher_sets(configs: &[MatcherSetConfig]) -> Result<MatcherSets> {
    let mut sets = Vec::with_capacity(configs.len());
    for config in configs {
        sets.push(provision_matcher_set(config)?);
    }
    Ok(MatcherSets::new(sets))
}

fn provision_matcher_set(config: &MatcherSetConfig) -> Result<MatcherSet> {
    let mut matchers: Vec<Box<dyn ActorMatcher>> = Vec::new();
    if let Some(remote) = &config.remote_ip {
        matchers.push(Box::new(MatchRemoteIp::new(&remote.ranges)?));
    }
    if let Some(local) = &config.local_ip {
        matchers.push(Box::new(MatchLocalIp::new(&local.ranges)?));
    }
    if let Some(users) = &config.user {
        matchers.push(Box::new(MatchUser::new(users.users.clone())));
    }
    if let Some(groups) = &config.group {
        matchers.push(Box::new(MatchGroup::new(groups.groups.clone())));
    }
    if let Some(patterns) = &config.extension {
        matchers.push(Box::new(MatchExtension::new(patterns.clone())));
    }
    if let Some(patterns) = &config.critical_option {
        matchers.push(Box::new(MatchCriticalOption::new(patterns.clone())));
    }
    if let Some(inner) = &config.not {
        matchers.push(Box::new(MatchNot::new(provision_matcher_sets(inner)?)));
    }
    Ok(MatcherSet::new(matchers))
}
