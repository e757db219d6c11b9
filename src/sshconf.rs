//! Configurator pipeline
//!
//! Before the handshake starts, the server picks per-connection SSH
//! parameters: the first configurator whose matcher sets accept the
//! connection wins. Its provided config carries the algorithm allow-lists,
//! auth method set, host-key signers, banner, and the authentication
//! flows. A connection no configurator claims runs against an empty config
//! that cannot authenticate.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::{MethodKind, MethodSet, SshId};
use serde::Deserialize;

use crate::authn::{AuthnConfig, AuthnFlows};
use crate::config_matcher::{
    provision_config_matcher_sets, ConfigMatcherSetConfig, ConfigMatcherSets, ConnInfo,
};
use crate::signer::{FallbackSigner, FileSigner, FileStorage, KeySource};

const DEFAULT_SERVER_VERSION: &str = concat!("SSH-2.0-gangway_", env!("CARGO_PKG_VERSION"));
const DEFAULT_STORAGE_ROOT: &str = "data";

#[derive(Debug, Clone, Deserialize)]
pub struct KeySourceConfig {
    pub source: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Which signer feeds the host-key set. The default is `fallback`, which
/// loads keys from storage and generates missing ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum SignerConfig {
    Fallback {
        /// Storage root directory; defaults to ./data.
        #[serde(default)]
        storage: Option<PathBuf>,
    },
    File {
        keys: Vec<KeySourceConfig>,
    },
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self::Fallback { storage: None }
    }
}

/// The typed equivalent of a per-connection SSH parameter object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidedConfigSpec {
    #[serde(default)]
    pub signer: Option<SignerConfig>,
    /// Allowed key exchange algorithms; empty keeps the library default.
    #[serde(default)]
    pub key_exchanges: Vec<String>,
    /// Allowed cipher algorithms; empty keeps the library default.
    #[serde(default)]
    pub ciphers: Vec<String>,
    /// Allowed MAC algorithms; empty keeps the library default.
    #[serde(default)]
    pub macs: Vec<String>,
    /// Allow clients to connect without authenticating.
    #[serde(default)]
    pub no_client_auth: bool,
    /// Maximum auth attempts per connection; 0 keeps the library default.
    #[serde(default)]
    pub max_auth_tries: u32,
    /// Version string announced in the handshake; must start with
    /// "SSH-2.0-".
    #[serde(default)]
    pub server_version: Option<String>,
    /// Banner sent after key exchange, before authentication.
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default)]
    pub authentication: Option<AuthnConfig>,
}

/// One provisioned parameter set, shared by every connection it matches.
pub struct ProvidedConfig {
    russh: Arc<russh::server::Config>,
    authn: Arc<AuthnFlows>,
    no_client_auth: bool,
}

impl ProvidedConfig {
    pub fn provision(spec: &ProvidedConfigSpec, idle_timeout: Option<Duration>) -> Result<Self> {
        let authn = match &spec.authentication {
            Some(config) => AuthnFlows::provision(config).context("provisioning authentication")?,
            None => AuthnFlows::default(),
        };

        let mut config = russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: idle_timeout,
            ..Default::default()
        };

        let version = spec
            .server_version
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_VERSION.to_string());
        if !version.starts_with("SSH-2.0-") {
            bail!("server_version must start with 'SSH-2.0-': {version}");
        }
        config.server_id = SshId::Standard(version);

        if spec.max_auth_tries > 0 {
            config.max_auth_attempts = spec.max_auth_tries as usize;
        }

        let mut methods = MethodSet::empty();
        if authn.public_key_enabled() {
            methods.push(MethodKind::PublicKey);
        }
        if authn.password_enabled() {
            methods.push(MethodKind::Password);
        }
        if authn.interactive_enabled() {
            methods.push(MethodKind::KeyboardInteractive);
        }
        if spec.no_client_auth {
            methods.push(MethodKind::None);
        }
        config.methods = methods;

        if !spec.key_exchanges.is_empty() {
            config.preferred.kex = Cow::Owned(lookup_all(&spec.key_exchanges, kex_by_name)?);
        }
        if !spec.ciphers.is_empty() {
            config.preferred.cipher = Cow::Owned(lookup_all(&spec.ciphers, cipher_by_name)?);
        }
        if !spec.macs.is_empty() {
            config.preferred.mac = Cow::Owned(lookup_all(&spec.macs, mac_by_name)?);
        }

        if let Some(banner) = &spec.banner {
            let mut text = banner.clone();
            if !text.ends_with('\n') {
                text.push('\n');
            }
            // provisioned once per process; leaking buys the 'static the
            // library wants
            config.auth_banner = Some(Box::leak(text.into_boxed_str()));
        }

        let signer = spec.signer.clone().unwrap_or_default();
        config.keys = match &signer {
            SignerConfig::Fallback { storage } => {
                let root = storage
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
                FallbackSigner::provision(&FileStorage::new(root))
                    .context("provisioning fallback signer")?
            }
            SignerConfig::File { keys } => {
                let sources: Vec<KeySource> = keys
                    .iter()
                    .map(|k| KeySource {
                        source: k.source.clone(),
                        passphrase: k.passphrase.clone(),
                    })
                    .collect();
                // rooted at the OS file system; sources may be relative or
                // absolute
                FileSigner::provision(&FileStorage::new(""), &sources)
                    .context("provisioning file signer")?
            }
        };

        Ok(Self {
            russh: Arc::new(config),
            authn: Arc::new(authn),
            no_client_auth: spec.no_client_auth,
        })
    }

    pub fn russh_config(&self) -> Arc<russh::server::Config> {
        Arc::clone(&self.russh)
    }

    pub fn authn(&self) -> Arc<AuthnFlows> {
        Arc::clone(&self.authn)
    }

    pub fn no_client_auth(&self) -> bool {
        self.no_client_auth
    }

    /// The method set advertised to clients, for auth rejections.
    pub fn method_set(&self) -> MethodSet {
        self.russh.methods.clone()
    }
}

fn lookup_all<T>(names: &[String], lookup: fn(&str) -> Option<T>) -> Result<Vec<T>> {
    names
        .iter()
        .map(|name| lookup(name).ok_or_else(|| anyhow::anyhow!("unknown algorithm: {name}")))
        .collect()
}

fn kex_by_name(name: &str) -> Option<russh::kex::Name> {
    use russh::kex;
    Some(match name {
        "curve25519-sha256" => kex::CURVE25519,
        "curve25519-sha256@libssh.org" => kex::CURVE25519_PRE_RFC_8731,
        "diffie-hellman-group14-sha1" => kex::DH_G14_SHA1,
        "diffie-hellman-group14-sha256" => kex::DH_G14_SHA256,
        "diffie-hellman-group16-sha512" => kex::DH_G16_SHA512,
        _ => return None,
    })
}

fn cipher_by_name(name: &str) -> Option<russh::cipher::Name> {
    use russh::cipher;
    Some(match name {
        "chacha20-poly1305@openssh.com" => cipher::CHACHA20_POLY1305,
        "aes256-gcm@openssh.com" => cipher::AES_256_GCM,
        "aes256-ctr" => cipher::AES_256_CTR,
        "aes192-ctr" => cipher::AES_192_CTR,
        "aes128-ctr" => cipher::AES_128_CTR,
        _ => return None,
    })
}

fn mac_by_name(name: &str) -> Option<russh::mac::Name> {
    use russh::mac;
    Some(match name {
        "hmac-sha2-256" => mac::HMAC_SHA256,
        "hmac-sha2-512" => mac::HMAC_SHA512,
        "hmac-sha1" => mac::HMAC_SHA1,
        "hmac-sha2-256-etm@openssh.com" => mac::HMAC_SHA256_ETM,
        "hmac-sha2-512-etm@openssh.com" => mac::HMAC_SHA512_ETM,
        "hmac-sha1-etm@openssh.com" => mac::HMAC_SHA1_ETM,
        _ => return None,
    })
}

/// One configurator: matchers plus the config its matches receive.
pub struct Configurator {
    matchers: ConfigMatcherSets,
    provided: Arc<ProvidedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfiguratorConfig {
    #[serde(default, rename = "match")]
    pub matchers: Vec<ConfigMatcherSetConfig>,
    pub config: LoaderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "loader", rename_all = "snake_case")]
pub enum LoaderConfig {
    Provided(ProvidedConfigSpec),
}

/// The ordered configurator list of one server.
#[derive(Default)]
pub struct ConfigPipeline {
    configurators: Vec<Configurator>,
}

impl ConfigPipeline {
    pub fn provision(
        configs: &[ConfiguratorConfig],
        idle_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut configurators = Vec::with_capacity(configs.len());
        for (i, config) in configs.iter().enumerate() {
            let matchers = provision_config_matcher_sets(&config.matchers)
                .with_context(|| format!("configurator {i}: loading matchers"))?;
            let LoaderConfig::Provided(spec) = &config.config;
            let provided = ProvidedConfig::provision(spec, idle_timeout)
                .with_context(|| format!("configurator {i}: loading config"))?;
            configurators.push(Configurator {
                matchers,
                provided: Arc::new(provided),
            });
        }
        Ok(Self { configurators })
    }

    /// First match wins; at most one configurator applies per connection.
    pub fn select(&self, conn: &ConnInfo) -> Option<Arc<ProvidedConfig>> {
        self.configurators
            .iter()
            .find(|c| c.matchers.any_match(conn))
            .map(|c| Arc::clone(&c.provided))
    }

    pub fn is_empty(&self) -> bool {
        self.configurators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::LineEnding;
    use russh::keys::{Algorithm, PrivateKey};

    fn spec_with_file_signer(dir: &std::path::Path) -> ProvidedConfigSpec {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let path = dir.join("host_key");
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        ProvidedConfigSpec {
            signer: Some(SignerConfig::File {
                keys: vec![KeySourceConfig {
                    source: path.to_string_lossy().to_string(),
                    passphrase: None,
                }],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn provision_validates_server_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_with_file_signer(dir.path());
        spec.server_version = Some("OpenSSH_9.7".to_string());
        assert!(ProvidedConfig::provision(&spec, None).is_err());

        spec.server_version = Some("SSH-2.0-custom".to_string());
        assert!(ProvidedConfig::provision(&spec, None).is_ok());
    }

    #[test]
    fn provision_rejects_unknown_algorithms() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_with_file_signer(dir.path());
        spec.ciphers = vec!["rot13".to_string()];
        assert!(ProvidedConfig::provision(&spec, None).is_err());
    }

    #[test]
    fn provision_accepts_known_algorithm_lists() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_with_file_signer(dir.path());
        spec.key_exchanges = vec!["curve25519-sha256".to_string()];
        spec.ciphers = vec![
            "chacha20-poly1305@openssh.com".to_string(),
            "aes256-ctr".to_string(),
        ];
        spec.macs = vec!["hmac-sha2-256".to_string()];
        let provided = ProvidedConfig::provision(&spec, None).unwrap();
        assert_eq!(provided.russh_config().keys.len(), 1);
    }

    #[test]
    fn first_matching_configurator_wins() {
        let dir = tempfile::tempdir().unwrap();
        let configs: Vec<ConfiguratorConfig> = serde_json::from_value(serde_json::json!([
            {
                "match": [{"remote_ip": {"ranges": ["10.0.0.0/8"]}}],
                "config": {"loader": "provided", "server_version": "SSH-2.0-internal", "signer": {"module": "file", "keys": [{"source": key_file(dir.path(), "a")}]}}
            },
            {
                "config": {"loader": "provided", "server_version": "SSH-2.0-public", "signer": {"module": "file", "keys": [{"source": key_file(dir.path(), "b")}]}}
            }
        ]))
        .unwrap();
        let pipeline = ConfigPipeline::provision(&configs, None).unwrap();

        let internal = pipeline
            .select(&ConnInfo {
                remote_addr: "10.1.2.3:40000".parse().unwrap(),
                local_addr: "10.0.0.1:22".parse().unwrap(),
            })
            .expect("configurator");
        assert!(matches!(
            &internal.russh_config().server_id,
            SshId::Standard(v) if v == "SSH-2.0-internal"
        ));

        let public = pipeline
            .select(&ConnInfo {
                remote_addr: "192.168.7.7:40000".parse().unwrap(),
                local_addr: "10.0.0.1:22".parse().unwrap(),
            })
            .expect("catch-all configurator");
        assert!(matches!(
            &public.russh_config().server_id,
            SshId::Standard(v) if v == "SSH-2.0-public"
        ));
    }

    fn key_file(dir: &std::path::Path, name: &str) -> String {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        path.to_string_lossy().to_string()
    }
}
