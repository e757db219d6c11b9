//! Authentication flows
//!
//! Each enabled method (password, public key, interactive) owns an ordered
//! list of provider modules. A flow tries its providers in order: provider
//! errors are logged and skipped, the first success wins, and the
//! authenticated account is handed to the connection handler. Global
//! allow/deny lists are checked in the sshd order: DenyUsers, AllowUsers,
//! DenyGroups, AllowGroups.

pub mod static_keys;
pub mod static_users;

use std::collections::HashSet;
use std::net::SocketAddr;

use anyhow::Result;
use russh::keys::PublicKey;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::account::Account;
use crate::Error;

/// Connection metadata visible to authentication providers.
#[derive(Debug, Clone, Copy)]
pub struct ConnContext<'a> {
    pub username: &'a str,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Password-based provider. `Ok(None)` means "not my user / wrong
/// password", an error means the provider itself broke.
pub trait PasswordProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn authenticate(&self, conn: &ConnContext<'_>, password: &str) -> Result<Option<Account>>;
}

/// Public-key-based provider.
pub trait PublicKeyProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn authenticate(&self, conn: &ConnContext<'_>, key: &PublicKey) -> Result<Option<Account>>;
}

/// Keyboard-interactive provider. Experimental: the flow is wired through
/// the handler but no built-in provider exists.
pub trait InteractiveProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn authenticate(&self, conn: &ConnContext<'_>, responses: &[String])
        -> Result<Option<Account>>;
}

/// Authentication configuration for one provided SSH config: allow/deny
/// lists plus up to three flows. A `None` flow disables its method.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthnConfig {
    #[serde(default)]
    pub allow_users: Vec<String>,
    #[serde(default)]
    pub deny_users: Vec<String>,
    #[serde(default)]
    pub allow_groups: Vec<String>,
    #[serde(default)]
    pub deny_groups: Vec<String>,
    #[serde(default)]
    pub username_password: Option<PasswordFlowConfig>,
    #[serde(default)]
    pub public_key: Option<PublicKeyFlowConfig>,
    #[serde(default)]
    pub interactive: Option<InteractiveFlowConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PasswordFlowConfig {
    #[serde(default)]
    pub providers: Vec<PasswordProviderConfig>,
    #[serde(default)]
    pub permit_empty_passwords: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum PasswordProviderConfig {
    Static(static_users::StaticUsersConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublicKeyFlowConfig {
    #[serde(default)]
    pub providers: Vec<PublicKeyProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum PublicKeyProviderConfig {
    Static(static_keys::StaticKeysConfig),
}

/// Experimental. Accepts no providers yet; an enabled interactive flow
/// with no providers rejects every attempt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractiveFlowConfig {}

/// The provisioned authentication suite.
#[derive(Default)]
pub struct AuthnFlows {
    allow_users: HashSet<String>,
    deny_users: HashSet<String>,
    allow_groups: HashSet<String>,
    deny_groups: HashSet<String>,
    password: Option<PasswordFlow>,
    public_key: Option<PublicKeyFlow>,
    interactive: Option<InteractiveFlow>,
}

pub struct PasswordFlow {
    providers: Vec<Box<dyn PasswordProvider>>,
    permit_empty_passwords: bool,
}

pub struct PublicKeyFlow {
    providers: Vec<Box<dyn PublicKeyProvider>>,
}

pub struct InteractiveFlow {
    providers: Vec<Box<dyn InteractiveProvider>>,
}

impl AuthnFlows {
    pub fn provision(config: &AuthnConfig) -> Result<Self> {
        let password = match &config.username_password {
            Some(flow) => {
                let mut providers: Vec<Box<dyn PasswordProvider>> = Vec::new();
                for provider in &flow.providers {
                    match provider {
                        PasswordProviderConfig::Static(cfg) => {
                            providers.push(Box::new(static_users::StaticUsers::provision(cfg)?));
                        }
                    }
                }
                Some(PasswordFlow {
                    providers,
                    permit_empty_passwords: flow.permit_empty_passwords,
                })
            }
            None => None,
        };

        let public_key = match &config.public_key {
            Some(flow) => {
                let mut providers: Vec<Box<dyn PublicKeyProvider>> = Vec::new();
                for provider in &flow.providers {
                    match provider {
                        PublicKeyProviderConfig::Static(cfg) => {
                            providers.push(Box::new(static_keys::StaticKeys::provision(cfg)?));
                        }
                    }
                }
                Some(PublicKeyFlow { providers })
            }
            None => None,
        };

        let interactive = config
            .interactive
            .as_ref()
            .map(|_| InteractiveFlow {
                providers: Vec::new(),
            });

        Ok(Self {
            allow_users: config.allow_users.iter().cloned().collect(),
            deny_users: config.deny_users.iter().cloned().collect(),
            allow_groups: config.allow_groups.iter().cloned().collect(),
            deny_groups: config.deny_groups.iter().cloned().collect(),
            password,
            public_key,
            interactive,
        })
    }

    pub fn password_enabled(&self) -> bool {
        self.password.is_some()
    }

    pub fn public_key_enabled(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn interactive_enabled(&self) -> bool {
        self.interactive.is_some()
    }

    pub fn authenticate_password(
        &self,
        conn: &ConnContext<'_>,
        password: &str,
    ) -> Result<Account, Error> {
        let Some(flow) = &self.password else {
            return Err(Error::InvalidCredentials);
        };
        if !self.subject_allowed(conn.username, &self.allow_users, &self.deny_users) {
            warn!(username = conn.username, "invalid credentials");
            return Err(Error::InvalidCredentials);
        }
        if password.is_empty() && !flow.permit_empty_passwords {
            warn!(username = conn.username, "invalid credentials");
            return Err(Error::InvalidCredentials);
        }
        info!(
            providers_count = flow.providers.len(),
            remote_addr = %conn.remote_addr,
            username = conn.username,
            "authentication start"
        );
        for provider in &flow.providers {
            match provider.authenticate(conn, password) {
                Err(err) => {
                    error!(
                        provider = provider.name(),
                        username = conn.username,
                        error = %err,
                        "authentication error"
                    );
                }
                Ok(None) => {
                    info!(
                        provider = provider.name(),
                        username = conn.username,
                        "authentication failed"
                    );
                }
                Ok(Some(account)) => {
                    self.log_success(provider.name(), &account);
                    return self.check_groups(account);
                }
            }
        }
        warn!(username = conn.username, "invalid credentials");
        Err(Error::InvalidCredentials)
    }

    pub fn authenticate_public_key(
        &self,
        conn: &ConnContext<'_>,
        key: &PublicKey,
    ) -> Result<Account, Error> {
        let Some(flow) = &self.public_key else {
            return Err(Error::InvalidCredentials);
        };
        if !self.subject_allowed(conn.username, &self.allow_users, &self.deny_users) {
            warn!(username = conn.username, "invalid credentials");
            return Err(Error::InvalidCredentials);
        }
        let key_type = key.algorithm().to_string();
        info!(
            providers_count = flow.providers.len(),
            remote_addr = %conn.remote_addr,
            username = conn.username,
            key_type,
            "authentication start"
        );
        for provider in &flow.providers {
            match provider.authenticate(conn, key) {
                Err(err) => {
                    error!(
                        provider = provider.name(),
                        username = conn.username,
                        key_type,
                        error = %err,
                        "authentication error"
                    );
                }
                Ok(None) => {
                    info!(
                        provider = provider.name(),
                        username = conn.username,
                        key_type,
                        "authentication failed"
                    );
                }
                Ok(Some(account)) => {
                    self.log_success(provider.name(), &account);
                    return self.check_groups(account);
                }
            }
        }
        warn!(username = conn.username, key_type, "invalid credentials");
        Err(Error::InvalidCredentials)
    }

    pub fn authenticate_interactive(
        &self,
        conn: &ConnContext<'_>,
        responses: &[String],
    ) -> Result<Account, Error> {
        let Some(flow) = &self.interactive else {
            return Err(Error::InvalidCredentials);
        };
        if !self.subject_allowed(conn.username, &self.allow_users, &self.deny_users) {
            warn!(username = conn.username, "invalid credentials");
            return Err(Error::InvalidCredentials);
        }
        info!(
            providers_count = flow.providers.len(),
            remote_addr = %conn.remote_addr,
            username = conn.username,
            "authentication start"
        );
        for provider in &flow.providers {
            match provider.authenticate(conn, responses) {
                Err(err) => {
                    error!(
                        provider = provider.name(),
                        username = conn.username,
                        error = %err,
                        "authentication error"
                    );
                }
                Ok(None) => {
                    info!(
                        provider = provider.name(),
                        username = conn.username,
                        "authentication failed"
                    );
                }
                Ok(Some(account)) => {
                    self.log_success(provider.name(), &account);
                    return self.check_groups(account);
                }
            }
        }
        warn!(username = conn.username, "invalid credentials");
        Err(Error::InvalidCredentials)
    }

    fn log_success(&self, provider: &str, account: &Account) {
        info!(
            provider,
            user_id = account.uid(),
            username = account.username(),
            "authentication successful"
        );
    }

    /// A group check fails when any of the user's groups is denied or
    /// misses a non-empty allowlist.
    fn check_groups(&self, account: Account) -> Result<Account, Error> {
        let all_allowed = account
            .groups()
            .iter()
            .all(|g| self.subject_allowed(g.name(), &self.allow_groups, &self.deny_groups));
        if !all_allowed {
            warn!(username = account.username(), "invalid credentials");
            return Err(Error::InvalidCredentials);
        }
        Ok(account)
    }

    fn subject_allowed(
        &self,
        subject: &str,
        allow: &HashSet<String>,
        deny: &HashSet<String>,
    ) -> bool {
        !deny.contains(subject) && (allow.is_empty() || allow.contains(subject))
    }
}
