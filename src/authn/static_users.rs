//! Static password provider
//!
//! Accounts are listed in config with pbkdf2-sha256 password digests. The
//! lookup path always runs the key derivation, matching or not, to avoid
//! leaking account existence through timing.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use base64::prelude::{Engine, BASE64_STANDARD};
use pbkdf2::pbkdf2_hmac;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::account::{Account, Group};
use crate::authn::{ConnContext, PasswordProvider};

const DIGEST_LEN: usize = 32;
pub const DEFAULT_ROUNDS: u32 = 600_000;

fn default_rounds() -> u32 {
    DEFAULT_ROUNDS
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticUsersConfig {
    #[serde(default)]
    pub accounts: Vec<StaticAccountConfig>,
    /// pbkdf2 iteration count the stored digests were derived with.
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticAccountConfig {
    /// Stable user id; generated at provision when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// base64 of the pbkdf2-sha256 digest of the password.
    pub password: String,
    /// base64 salt the digest was derived with.
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

struct ProvisionedAccount {
    account: Account,
    digest: Vec<u8>,
    salt: Vec<u8>,
}

/// Password provider over a fixed account list.
pub struct StaticUsers {
    accounts: HashMap<String, ProvisionedAccount>,
    rounds: u32,
}

impl StaticUsers {
    pub fn provision(config: &StaticUsersConfig) -> Result<Self> {
        let mut accounts = HashMap::new();
        for (i, spec) in config.accounts.iter().enumerate() {
            if spec.name.is_empty() || spec.password.is_empty() {
                bail!("account {i}: username and password are required");
            }
            if accounts.contains_key(&spec.name) {
                bail!("account {i}: username is not unique: {}", spec.name);
            }

            let uid = match &spec.id {
                Some(id) if !id.trim().is_empty() => id.clone(),
                _ => Uuid::new_v4().to_string(),
            };
            let gid = Uuid::new_v4().to_string();
            let digest = BASE64_STANDARD
                .decode(&spec.password)
                .with_context(|| format!("account {i}: base64-decoding password"))?;
            let salt = match &spec.salt {
                Some(salt) => BASE64_STANDARD
                    .decode(salt)
                    .with_context(|| format!("account {i}: base64-decoding salt"))?,
                None => Vec::new(),
            };

            let mut account = Account::new(&spec.name)
                .with_uid(uid)
                .with_gid(gid.clone())
                // every user belongs at least to a group of their own name
                .with_groups(vec![Group::new(gid, &spec.name)])
                .with_metadata(spec.custom.clone());
            if let Some(home) = &spec.home {
                account = account.with_home(home);
            }

            accounts.insert(
                spec.name.clone(),
                ProvisionedAccount {
                    account,
                    digest,
                    salt,
                },
            );
        }
        Ok(Self {
            accounts,
            rounds: config.rounds,
        })
    }

    fn verify(&self, stored: &ProvisionedAccount, password: &str) -> bool {
        let mut derived = [0u8; DIGEST_LEN];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &stored.salt, self.rounds, &mut derived);
        stored.digest.len() == DIGEST_LEN && bool::from(derived.ct_eq(&stored.digest[..]))
    }
}

impl PasswordProvider for StaticUsers {
    fn name(&self) -> &'static str {
        "static"
    }

    fn authenticate(&self, conn: &ConnContext<'_>, password: &str) -> Result<Option<Account>> {
        if conn.username.is_empty() {
            bail!("username missing");
        }

        // run the KDF even for unknown users so both paths cost the same
        static MISSING: std::sync::OnceLock<ProvisionedAccount> = std::sync::OnceLock::new();
        let missing = MISSING.get_or_init(|| ProvisionedAccount {
            account: Account::new(""),
            digest: vec![0; DIGEST_LEN],
            salt: Vec::new(),
        });

        match self.accounts.get(conn.username) {
            Some(stored) if self.verify(stored, password) => Ok(Some(stored.account.clone())),
            Some(_) => Ok(None),
            None => {
                let _ = self.verify(missing, password);
                Ok(None)
            }
        }
    }
}

/// Derives the base64 digest the config stores for a password. Exposed for
/// the `hash-password` CLI helper and tests.
pub fn hash_password(password: &str, salt: &[u8], rounds: u32) -> String {
    let mut derived = [0u8; DIGEST_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut derived);
    BASE64_STANDARD.encode(derived)
}
