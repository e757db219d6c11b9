//! Accounts and permissions
//!
//! An [`Account`] is the outcome of a successful authentication flow. It
//! lives for one session and is frozen into the session view once the
//! handshake completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Permissions attached to an authenticated account: the two string maps
/// carried by SSH certificates and consulted by the extension and
/// critical-option matchers.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    pub extensions: HashMap<String, String>,
    pub critical_options: HashMap<String, String>,
}

impl Permissions {
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    pub fn critical_option(&self, name: &str) -> Option<&str> {
        self.critical_options.get(name).map(String::as_str)
    }
}

/// A group the account belongs to.
#[derive(Debug, Clone)]
pub struct Group {
    id: String,
    name: String,
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn gid(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An authenticated user. Providers build one of these on success; the
/// session stores it under its user slot for the rest of the connection.
#[derive(Debug, Clone)]
pub struct Account {
    uid: String,
    gid: String,
    username: String,
    display_name: String,
    home: PathBuf,
    groups: Vec<Group>,
    metadata: HashMap<String, serde_json::Value>,
    permissions: Permissions,
}

impl Account {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            uid: String::new(),
            gid: String::new(),
            display_name: username.clone(),
            home: PathBuf::from("/var/empty"),
            groups: Vec::new(),
            metadata: HashMap::new(),
            permissions: Permissions::default(),
            username,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_gid(mut self, gid: impl Into<String>) -> Self {
        self.gid = gid.into();
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_groups(mut self, groups: Vec<Group>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn gid(&self) -> &str {
        &self.gid
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group_ids(&self) -> Vec<&str> {
        self.groups.iter().map(Group::gid).collect()
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }
}
