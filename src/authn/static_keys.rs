//! Static public-key provider
//!
//! Maps usernames to authorized keys given inline in config or loaded from
//! authorized_keys-format files. A successful match records the key
//! fingerprint in the permission extensions under `pubkey-fp` and the
//! username under the `user` critical option.

use std::collections::HashMap;

use anyhow::{Context, Result};
use russh::keys::{HashAlg, PublicKey};
use serde::Deserialize;

use crate::account::{Account, Permissions};
use crate::authn::{ConnContext, PublicKeyProvider};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticKeysConfig {
    #[serde(default)]
    pub users: Vec<StaticKeyUserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticKeyUserConfig {
    pub username: String,
    /// Inline authorized_keys lines ("ssh-ed25519 AAAA... comment") or
    /// paths to files containing them.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Public-key provider over a fixed user/key table.
pub struct StaticKeys {
    users: HashMap<String, Vec<PublicKey>>,
}

impl StaticKeys {
    pub fn provision(config: &StaticKeysConfig) -> Result<Self> {
        let mut users = HashMap::new();
        for user in &config.users {
            let mut keys = Vec::new();
            for source in &user.keys {
                if looks_like_key_line(source) {
                    keys.push(parse_key_line(source).with_context(|| {
                        format!("parsing inline key for user {}", user.username)
                    })?);
                } else {
                    let content = std::fs::read_to_string(source).with_context(|| {
                        format!("reading key file '{}' for user {}", source, user.username)
                    })?;
                    for line in content.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        keys.push(parse_key_line(line).with_context(|| {
                            format!("parsing key in '{}' for user {}", source, user.username)
                        })?);
                    }
                }
            }
            users.insert(user.username.clone(), keys);
        }
        Ok(Self { users })
    }
}

fn looks_like_key_line(source: &str) -> bool {
    source.starts_with("ssh-")
        || source.starts_with("ecdsa-")
        || source.starts_with("sk-")
}

fn parse_key_line(line: &str) -> Result<PublicKey> {
    PublicKey::from_openssh(line).context("invalid authorized key")
}

impl PublicKeyProvider for StaticKeys {
    fn name(&self) -> &'static str {
        "static"
    }

    fn authenticate(&self, conn: &ConnContext<'_>, key: &PublicKey) -> Result<Option<Account>> {
        if conn.username.is_empty() {
            return Ok(None);
        }
        let Some(known) = self.users.get(conn.username) else {
            return Ok(None);
        };

        if known.iter().any(|k| k.key_data() == key.key_data()) {
            let mut permissions = Permissions::default();
            permissions
                .critical_options
                .insert("user".to_string(), conn.username.to_string());
            permissions.extensions.insert(
                "pubkey-fp".to_string(),
                key.fingerprint(HashAlg::Sha256).to_string(),
            );
            let account = Account::new(conn.username)
                .with_uid(conn.username)
                .with_permissions(permissions);
            return Ok(Some(account));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{Algorithm, PrivateKey};

    fn keypair() -> (PrivateKey, String) {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let line = key.public_key().to_openssh().unwrap();
        (key, line)
    }

    fn conn<'a>(username: &'a str) -> ConnContext<'a> {
        ConnContext {
            username,
            remote_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: "127.0.0.1:22".parse().unwrap(),
        }
    }

    #[test]
    fn matches_known_key_and_sets_permissions() {
        let (key, line) = keypair();
        let provider = StaticKeys::provision(&StaticKeysConfig {
            users: vec![StaticKeyUserConfig {
                username: "alice".to_string(),
                keys: vec![line],
            }],
        })
        .unwrap();

        let account = provider
            .authenticate(&conn("alice"), key.public_key())
            .unwrap()
            .expect("authenticated");
        assert_eq!(account.username(), "alice");
        assert_eq!(
            account.permissions().critical_option("user"),
            Some("alice")
        );
        let fp = account.permissions().extension("pubkey-fp").unwrap();
        assert!(fp.starts_with("SHA256:"), "unexpected fingerprint: {fp}");
    }

    #[test]
    fn rejects_unknown_key_and_unknown_user() {
        let (_key, line) = keypair();
        let (other, _) = keypair();
        let provider = StaticKeys::provision(&StaticKeysConfig {
            users: vec![StaticKeyUserConfig {
                username: "alice".to_string(),
                keys: vec![line],
            }],
        })
        .unwrap();

        assert!(provider
            .authenticate(&conn("alice"), other.public_key())
            .unwrap()
            .is_none());
        assert!(provider
            .authenticate(&conn("bob"), other.public_key())
            .unwrap()
            .is_none());
    }

    #[test]
    fn loads_keys_from_files() {
        let (key, line) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, format!("# team keys\n{line}\n")).unwrap();

        let provider = StaticKeys::provision(&StaticKeysConfig {
            users: vec![StaticKeyUserConfig {
                username: "alice".to_string(),
                keys: vec![path.to_string_lossy().to_string()],
            }],
        })
        .unwrap();

        assert!(provider
            .authenticate(&conn("alice"), key.public_key())
            .unwrap()
            .is_some());
    }
}
