//! The SSH app
//!
//! Owns the provisioned servers, binds their listeners, and runs the
//! accept loops until asked to stop. Shutdown cancels the accept loops
//! first, gives in-flight connections up to the grace period to drain,
//! then force-closes whatever is left.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::server::{accept_loop, ActiveSessions, Server};

pub struct App {
    grace_period: Option<Duration>,
    servers: Vec<Server>,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
    active: ActiveSessions,
    tasks: JoinSet<()>,
    bound: BTreeMap<String, Vec<SocketAddr>>,
}

impl App {
    /// Validates the config and builds every server. Nothing is bound
    /// yet; `start` does that.
    pub fn provision(config: &AppConfig) -> Result<Self> {
        let active = ActiveSessions::default();
        let mut servers = Vec::with_capacity(config.servers.len());
        let mut taken: HashSet<(String, u16)> = HashSet::new();

        for (name, server_config) in &config.servers {
            let server = Server::provision(name, server_config, active.clone())?;
            for (host, port) in server.listen_addrs() {
                // port 0 asks the OS for a free port, so it never collides
                if port != 0 && !taken.insert((host.clone(), port)) {
                    return Err(crate::Error::Config(format!(
                        "listener address {host}:{port} is used by more than one server"
                    ))
                    .into());
                }
            }
            servers.push(server);
        }

        Ok(Self {
            grace_period: config.grace_period.map(Duration::from_secs),
            servers,
            accept_cancel: CancellationToken::new(),
            conn_cancel: CancellationToken::new(),
            active,
            tasks: JoinSet::new(),
            bound: BTreeMap::new(),
        })
    }

    /// Binds all listeners and spawns one accept loop per listener.
    pub async fn start(&mut self) -> Result<()> {
        for server in &self.servers {
            let listeners = server.bind().await?;
            for (listener, addr) in listeners {
                info!(server = server.name(), %addr, "listening");
                self.bound
                    .entry(server.name().to_string())
                    .or_default()
                    .push(addr);
                self.tasks.spawn(accept_loop(
                    listener,
                    server.context(),
                    self.accept_cancel.clone(),
                    self.conn_cancel.clone(),
                ));
            }
        }
        Ok(())
    }

    /// The addresses a named server actually bound, useful when the
    /// config asked for port 0.
    pub fn bound_addrs(&self, server: &str) -> &[SocketAddr] {
        self.bound
            .get(server)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of in-flight connections and sessions.
    pub fn active_sessions(&self) -> usize {
        self.active.count()
    }

    /// Runs until every worker exits (normally only after `stop`).
    pub async fn wait(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            joined.context("server worker panicked")?;
        }
        Ok(())
    }

    /// Stops accepting, drains within the grace period, then force-closes
    /// remaining connections and joins the workers.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping ssh app");
        self.accept_cancel.cancel();

        if let Some(grace) = self.grace_period {
            if self.active.count() > 0 {
                info!(
                    open = self.active.count(),
                    grace_seconds = grace.as_secs(),
                    "waiting for open connections to drain"
                );
                if tokio::time::timeout(grace, self.active.wait_idle())
                    .await
                    .is_err()
                {
                    warn!(
                        remaining = self.active.count(),
                        "grace period expired, closing connections forcefully"
                    );
                }
            }
        }

        self.conn_cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "server worker failed during shutdown");
            }
        }
        Ok(())
    }
}
