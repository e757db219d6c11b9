//! Permission askers
//!
//! Small policy modules answering yes/no questions mid-session: may this
//! session get a PTY, open a local forward, or request a reverse forward.
//! Everything defaults to deny; the server only relaxes what the config
//! names.

use std::net::SocketAddr;

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::matcher::IpRanges;

/// What an asker gets to look at when deciding.
#[derive(Debug, Clone, Copy)]
pub struct AskContext<'a> {
    pub user: &'a str,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Decides whether a session may allocate a PTY.
pub trait PtyAsker: Send + Sync {
    fn allow(&self, ctx: &AskContext<'_>, term: &str) -> bool;
}

/// Decides whether a session may forward a port, in either direction.
pub trait ForwardAsker: Send + Sync {
    fn allow(&self, ctx: &AskContext<'_>, host: &str, port: u32) -> bool;
}

/// Always grants the PTY.
pub struct AllowPty;

impl PtyAsker for AllowPty {
    fn allow(&self, ctx: &AskContext<'_>, term: &str) -> bool {
        info!(
            user = ctx.user,
            remote_addr = %ctx.remote_addr,
            terminal = term,
            "pty allowed"
        );
        true
    }
}

/// Always rejects the PTY.
pub struct DenyPty;

impl PtyAsker for DenyPty {
    fn allow(&self, ctx: &AskContext<'_>, term: &str) -> bool {
        info!(
            user = ctx.user,
            remote_addr = %ctx.remote_addr,
            terminal = term,
            "pty denied"
        );
        false
    }
}

/// Always grants the forward.
pub struct AllowForward;

impl ForwardAsker for AllowForward {
    fn allow(&self, ctx: &AskContext<'_>, host: &str, port: u32) -> bool {
        info!(
            user = ctx.user,
            remote_addr = %ctx.remote_addr,
            destination_host = host,
            destination_port = port,
            "forward allowed"
        );
        true
    }
}

/// Always rejects the forward.
pub struct DenyForward;

impl ForwardAsker for DenyForward {
    fn allow(&self, ctx: &AskContext<'_>, host: &str, port: u32) -> bool {
        info!(
            user = ctx.user,
            remote_addr = %ctx.remote_addr,
            destination_host = host,
            destination_port = port,
            "forward denied"
        );
        false
    }
}

/// Grants the forward when the client address falls in one of the
/// configured ranges.
pub struct RemoteIpForward {
    ranges: IpRanges,
}

impl RemoteIpForward {
    pub fn new(ranges: &[String]) -> Result<Self> {
        Ok(Self {
            ranges: IpRanges::parse(ranges)?,
        })
    }
}

impl ForwardAsker for RemoteIpForward {
    fn allow(&self, ctx: &AskContext<'_>, host: &str, port: u32) -> bool {
        let allowed = self.ranges.contains(&ctx.remote_addr);
        info!(
            user = ctx.user,
            remote_addr = %ctx.remote_addr,
            destination_host = host,
            destination_port = port,
            allowed,
            "forward decision"
        );
        allowed
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "pty", rename_all = "snake_case")]
pub enum PtyAskConfig {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "forward", rename_all = "snake_case")]
pub enum ForwardAskConfig {
    Allow,
    Deny,
    RemoteIp { ranges: Vec<String> },
}

pub fn provision_pty_asker(config: Option<&PtyAskConfig>) -> Box<dyn PtyAsker> {
    match config {
        Some(PtyAskConfig::Allow) => Box::new(AllowPty),
        // deny by default, for strict reasons
        Some(PtyAskConfig::Deny) | None => Box::new(DenyPty),
    }
}

pub fn provision_forward_asker(config: Option<&ForwardAskConfig>) -> Result<Box<dyn ForwardAsker>> {
    Ok(match config {
        Some(ForwardAskConfig::Allow) => Box::new(AllowForward),
        Some(ForwardAskConfig::RemoteIp { ranges }) => Box::new(RemoteIpForward::new(ranges)?),
        Some(ForwardAskConfig::Deny) | None => Box::new(DenyForward),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(remote: &str) -> AskContext<'a> {
        AskContext {
            user: "alice",
            remote_addr: remote.parse().unwrap(),
            local_addr: "127.0.0.1:22".parse().unwrap(),
        }
    }

    #[test]
    fn defaults_deny() {
        let pty = provision_pty_asker(None);
        assert!(!pty.allow(&ctx("10.0.0.1:5000"), "xterm"));
        let forward = provision_forward_asker(None).unwrap();
        assert!(!forward.allow(&ctx("10.0.0.1:5000"), "example.com", 443));
    }

    #[test]
    fn remote_ip_forward_checks_client_address() {
        let asker = RemoteIpForward::new(&["10.0.0.0/8".into()]).unwrap();
        assert!(asker.allow(&ctx("10.1.2.3:5000"), "example.com", 443));
        assert!(!asker.allow(&ctx("192.168.1.1:5000"), "example.com", 443));
    }
}
