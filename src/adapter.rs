//! sshd_config adapter
//!
//! Converts an `sshd_config`-style file into the native config tree. Only
//! a subset of directives maps onto gangway; everything else is accepted
//! and reported as a warning carrying its line number, so a copied-over
//! distro config degrades loudly instead of silently.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use tracing::warn;

use crate::authn::{
    AuthnConfig, PasswordFlowConfig, PublicKeyFlowConfig,
};
use crate::ask::{ForwardAskConfig, PtyAskConfig};
use crate::config::{AppConfig, ConfigFile, ServerConfig};
use crate::sshconf::{
    ConfiguratorConfig, KeySourceConfig, LoaderConfig, ProvidedConfigSpec, SignerConfig,
};

/// A directive the adapter accepted but could not translate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub line: usize,
    pub directive: String,
    pub message: String,
}

/// Adapts the body of an sshd_config file. Returns the equivalent config
/// tree plus the warnings for everything that was ignored.
pub fn adapt(body: &str) -> Result<(ConfigFile, Vec<Warning>)> {
    let mut warnings = Vec::new();

    let mut listen_host = "0.0.0.0".to_string();
    let mut port: u16 = 22;
    let mut host_keys: Vec<String> = Vec::new();
    let mut permit_root = true;
    let mut max_auth_tries: u32 = 0;
    let mut pubkey_auth = false;
    let mut password_auth = false;
    let mut permit_empty_passwords = false;
    let mut tcp_forwarding = false;
    let mut permit_tty = false;

    for (index, raw_line) in body.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((directive, value)) = line.split_once(char::is_whitespace) else {
            bail!("line {line_no}: directive '{line}' has no value");
        };
        let value = value.trim();

        match directive.to_ascii_lowercase().as_str() {
            "port" => match value.parse::<u16>() {
                Ok(parsed) => port = parsed,
                Err(_) => bail!("line {line_no}: invalid Port value '{value}'"),
            },
            "listenaddress" => {
                // may carry its own port, which then wins over Port
                if let Some((host, p)) = value.rsplit_once(':') {
                    if let Ok(parsed) = p.parse::<u16>() {
                        listen_host = host.trim_start_matches('[').trim_end_matches(']').into();
                        port = parsed;
                    } else {
                        listen_host = value.to_string();
                    }
                } else {
                    listen_host = value.to_string();
                }
            }
            "hostkey" => host_keys.push(value.to_string()),
            "permitrootlogin" => permit_root = parse_flag(value),
            "maxauthtries" => match value.parse::<u32>() {
                Ok(parsed) => max_auth_tries = parsed,
                Err(_) => bail!("line {line_no}: invalid MaxAuthTries value '{value}'"),
            },
            "pubkeyauthentication" => pubkey_auth = parse_flag(value),
            "passwordauthentication" => password_auth = parse_flag(value),
            "permitemptypasswords" => permit_empty_passwords = parse_flag(value),
            "allowtcpforwarding" => tcp_forwarding = parse_flag(value),
            // accepted for compatibility; agent forwarding has no
            // counterpart here
            "allowagentforwarding" => {
                let _ = parse_flag(value);
            }
            "permittty" => permit_tty = parse_flag(value),
            other => {
                let warning = Warning {
                    line: line_no,
                    directive: other.to_string(),
                    message: "unrecognized directive ignored".to_string(),
                };
                warn!(
                    line = warning.line,
                    directive = warning.directive,
                    "unrecognized sshd_config directive ignored"
                );
                warnings.push(warning);
            }
        }
    }

    let mut authentication = AuthnConfig::default();
    if !permit_root {
        authentication.deny_users.push("root".to_string());
    }
    if password_auth {
        authentication.username_password = Some(PasswordFlowConfig {
            providers: Vec::new(),
            permit_empty_passwords,
        });
    }
    if pubkey_auth {
        authentication.public_key = Some(PublicKeyFlowConfig {
            providers: Vec::new(),
        });
    }

    let signer = if host_keys.is_empty() {
        None
    } else {
        Some(SignerConfig::File {
            keys: host_keys
                .into_iter()
                .map(|source| KeySourceConfig {
                    source,
                    passphrase: None,
                })
                .collect(),
        })
    };

    let spec = ProvidedConfigSpec {
        signer,
        max_auth_tries,
        authentication: Some(authentication),
        ..Default::default()
    };

    let forward = |allowed: bool| {
        if allowed {
            Some(ForwardAskConfig::Allow)
        } else {
            Some(ForwardAskConfig::Deny)
        }
    };

    let server = ServerConfig {
        address: format!("tcp/{listen_host}:{port}"),
        idle_timeout: None,
        max_timeout: None,
        localforward: forward(tcp_forwarding),
        reverseforward: forward(tcp_forwarding),
        pty: Some(if permit_tty {
            PtyAskConfig::Allow
        } else {
            PtyAskConfig::Deny
        }),
        authorize: None,
        subsystems: BTreeMap::new(),
        configs: vec![ConfiguratorConfig {
            matchers: Vec::new(),
            config: LoaderConfig::Provided(spec),
        }],
        actors: Vec::new(),
    };

    let mut servers = BTreeMap::new();
    servers.insert("srv0".to_string(), server);
    Ok((
        ConfigFile {
            ssh: AppConfig {
                grace_period: None,
                servers,
            },
        },
        warnings,
    ))
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("true")
}
