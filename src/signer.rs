//! Host-key signers
//!
//! Two providers feed the server's host-key set: `fallback` keeps keys in
//! an abstract key-value storage, generating RSA-4096 and Ed25519 keys on
//! first boot, and `file` loads pre-existing key files. Any IO or parse
//! failure here is fatal at provision time; a server without host keys
//! cannot finish a handshake.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{decode_secret_key, Algorithm, PrivateKey};
use tracing::info;

pub const RSA_HOST_KEY: &str = "ssh_host_rsa_key";
pub const ED25519_HOST_KEY: &str = "ssh_host_ed25519_key";
pub const ECDSA_HOST_KEY: &str = "ssh_host_ecdsa_key";

const RSA_BITS: usize = 4096;
const KEY_COMMENT: &str = "gangway";

/// Abstract key-value storage for host keys. Keys are slash-separated
/// logical paths. `store` must be atomic so a crash during first-boot
/// generation cannot leave a half-written host key behind.
pub trait KeyStorage: Send + Sync {
    fn exists(&self, key: &str) -> bool;
    fn is_dir(&self, key: &str) -> bool;
    fn load(&self, key: &str) -> Result<Vec<u8>>;
    fn store(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Lists the file entries directly under a prefix, as full keys.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Local-disk storage rooted at a directory. Rooting it at `/` makes it an
/// adapter for the plain OS file system, which is what the file signer
/// defaults to.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl KeyStorage for FileStorage {
    fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    fn is_dir(&self, key: &str) -> bool {
        self.path_for(key).is_dir()
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // write-temp-then-rename keeps the store atomic on the same fs
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        let mut keys = Vec::new();
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                keys.push(format!("{}/{}", prefix, entry.file_name().to_string_lossy()));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn key_path(name: &str) -> String {
    format!("ssh/signer/{name}")
}

/// Default signer: loads host keys from storage, generating and persisting
/// RSA and Ed25519 keys when absent. ECDSA keys are only ever loaded, and
/// DSA is ignored entirely.
pub struct FallbackSigner;

impl FallbackSigner {
    pub fn provision(storage: &dyn KeyStorage) -> Result<Vec<PrivateKey>> {
        let mut pems: Vec<Vec<u8>> = Vec::new();

        load_or_generate_and_store(storage, RSA_HOST_KEY, generate_rsa, &mut pems)?;
        load_or_generate_and_store(storage, ED25519_HOST_KEY, generate_ed25519, &mut pems)?;

        // ECDSA is only loaded, never generated
        if storage.exists(&key_path(ECDSA_HOST_KEY)) {
            pems.push(storage.load(&key_path(ECDSA_HOST_KEY))?);
        }

        // DSA is intentionally ignored

        pems.iter().map(|pem| parse_signer(pem, None)).collect()
    }
}

fn load_or_generate_and_store(
    storage: &dyn KeyStorage,
    name: &str,
    generate: fn() -> Result<PrivateKey>,
    pems: &mut Vec<Vec<u8>>,
) -> Result<()> {
    let path = key_path(name);
    if storage.exists(&path) {
        pems.push(storage.load(&path)?);
        return Ok(());
    }

    info!(key = name, "host key absent, generating");
    let key = generate().with_context(|| format!("generating {name}"))?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .with_context(|| format!("encoding {name}"))?;
    let public = key
        .public_key()
        .to_openssh()
        .with_context(|| format!("encoding {name}.pub"))?;

    storage.store(&path, pem.as_bytes())?;
    storage.store(&key_path(&format!("{name}.pub")), format!("{public}\n").as_bytes())?;
    pems.push(pem.as_bytes().to_vec());
    Ok(())
}

fn generate_rsa() -> Result<PrivateKey> {
    let keypair = RsaKeypair::random(&mut rand::thread_rng(), RSA_BITS)
        .context("generating RSA keypair")?;
    PrivateKey::new(KeypairData::Rsa(keypair), KEY_COMMENT).context("building RSA private key")
}

fn generate_ed25519() -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .context("generating Ed25519 key")
}

fn parse_signer(pem: &[u8], passphrase: Option<&str>) -> Result<PrivateKey> {
    let pem = std::str::from_utf8(pem).context("host key is not valid UTF-8")?;
    decode_secret_key(pem, passphrase).context("parsing host key")
}

/// One key entry for the file signer: where it lives and, when non-empty,
/// the passphrase protecting it.
#[derive(Debug, Clone)]
pub struct KeySource {
    pub source: String,
    pub passphrase: Option<String>,
}

/// Signer over pre-existing keys. Sources naming a directory are
/// enumerated through the storage's list operation, skipping `.pub` peers.
pub struct FileSigner;

impl FileSigner {
    pub fn provision(storage: &dyn KeyStorage, keys: &[KeySource]) -> Result<Vec<PrivateKey>> {
        if keys.is_empty() {
            bail!("path for host key file missing");
        }
        let mut signers = Vec::new();
        for (i, entry) in keys.iter().enumerate() {
            let passphrase = entry.passphrase.as_deref().filter(|p| !p.is_empty());
            if storage.is_dir(&entry.source) {
                for key in storage.list(&entry.source)? {
                    if key.ends_with(".pub") {
                        continue;
                    }
                    let pem = storage.load(&key)?;
                    signers.push(
                        parse_signer(&pem, passphrase)
                            .with_context(|| format!("key at index {i}, file '{key}'"))?,
                    );
                }
            } else {
                let pem = storage
                    .load(&entry.source)
                    .with_context(|| format!("key at index {i}, file '{}'", entry.source))?;
                signers.push(
                    parse_signer(&pem, passphrase)
                        .with_context(|| format!("key at index {i}, file '{}'", entry.source))?,
                );
            }
        }
        Ok(signers)
    }
}
