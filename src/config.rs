//! Configuration tree
//!
//! The JSON config mirrors the module structure: a root `ssh` app holding
//! named servers, each with its askers, authorizer, subsystems,
//! configurators, and actors. Pluggable blocks are tagged unions keyed by
//! their namespace discriminator (`loader`, `authorizer`, `module`,
//! `forward`, `pty`, `action`), so unknown module names fail at parse
//! time instead of at runtime.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::actors::ActorConfig;
use crate::ask::{ForwardAskConfig, PtyAskConfig};
use crate::authz::AuthorizerConfig;
use crate::sshconf::ConfiguratorConfig;
use crate::subsystem::SubsystemConfig;

/// Top-level config file: `{"ssh": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub ssh: AppConfig,
}

/// The SSH app: a grace period for shutdown and the set of servers keyed
/// by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Seconds to wait for open connections to drain during shutdown
    /// before closing them forcefully.
    #[serde(default)]
    pub grace_period: Option<u64>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// One server: a listener binding plus its pipelines.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listener address, `[tcp/]host:port[-port]`. Port ranges expand
    /// into one listener each.
    pub address: String,
    /// Seconds without activity before the connection is dropped.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    /// Absolute cap in seconds on a connection's lifetime.
    #[serde(default)]
    pub max_timeout: Option<u64>,
    /// Local (direct-tcpip) forward policy; defaults to deny.
    #[serde(default)]
    pub localforward: Option<ForwardAskConfig>,
    /// Reverse (tcpip-forward) policy; defaults to deny.
    #[serde(default)]
    pub reverseforward: Option<ForwardAskConfig>,
    /// PTY policy; defaults to deny.
    #[serde(default)]
    pub pty: Option<PtyAskConfig>,
    /// Session admission; defaults to public.
    #[serde(default)]
    pub authorize: Option<AuthorizerConfig>,
    /// Subsystem table keyed by the name clients request.
    #[serde(default)]
    pub subsystems: BTreeMap<String, SubsystemConfig>,
    /// Configurator pipeline; first match supplies the SSH parameters.
    #[serde(default)]
    pub configs: Vec<ConfiguratorConfig>,
    /// Actor pipeline run for every authorized session.
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("invalid config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_server() {
        let config = ConfigFile::parse(
            r#"{
              "ssh": {
                "grace_period": 10,
                "servers": {
                  "srv0": {
                    "address": "tcp/127.0.0.1:2200-2201",
                    "idle_timeout": 300,
                    "pty": {"pty": "allow"},
                    "localforward": {"forward": "deny"},
                    "reverseforward": {"forward": "remote_ip", "ranges": ["10.0.0.0/8"]},
                    "authorize": {"authorizer": "chained", "authorize": [
                      {"authorizer": "max_session", "max_sessions": 5},
                      {"authorizer": "public"}
                    ]},
                    "subsystems": {"echo": {"module": "echo"}},
                    "configs": [
                      {
                        "match": [{"remote_ip": {"ranges": ["127.0.0.1"]}}],
                        "config": {
                          "loader": "provided",
                          "server_version": "SSH-2.0-gangway",
                          "authentication": {
                            "deny_users": ["root"],
                            "public_key": {"providers": [
                              {"module": "static", "users": [{"username": "alice", "keys": []}]}
                            ]}
                          }
                        }
                      }
                    ],
                    "actors": [
                      {
                        "match": [{"user": {"users": ["alice"]}}],
                        "act": {"action": "static_response", "response": "hi"},
                        "final": true
                      },
                      {
                        "act": {"action": "shell", "force_command": "/usr/bin/uptime"}
                      }
                    ]
                  }
                }
              }
            }"#,
        )
        .unwrap();

        let app = config.ssh;
        assert_eq!(app.grace_period, Some(10));
        let server = &app.servers["srv0"];
        assert_eq!(server.address, "tcp/127.0.0.1:2200-2201");
        assert_eq!(server.actors.len(), 2);
        assert!(server.actors[0].is_final);
        assert!(!server.actors[1].is_final);
        assert_eq!(server.configs.len(), 1);
        assert!(server.subsystems.contains_key("echo"));
    }

    #[test]
    fn unknown_module_names_fail_at_parse_time() {
        let result = ConfigFile::parse(
            r#"{"ssh": {"servers": {"srv0": {
                "address": "127.0.0.1:22",
                "authorize": {"authorizer": "definitely-not-a-module"}
            }}}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn minimal_server_uses_defaults() {
        let config = ConfigFile::parse(
            r#"{"ssh": {"servers": {"srv0": {"address": "127.0.0.1:2222"}}}}"#,
        )
        .unwrap();
        let server = &config.ssh.servers["srv0"];
        assert!(server.authorize.is_none());
        assert!(server.configs.is_empty());
        assert!(server.actors.is_empty());
    }
}
