//! Server provisioning and the accept path
//!
//! A server is one named listener binding with its configurator pipeline,
//! authorizer, actor pipeline, askers, and subsystem table. Each listener
//! runs its own accept loop; each accepted connection picks its SSH
//! parameters through the config matchers and then runs on its own task.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::server::run_stream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actors::{provision_actor, ActorEntry};
use crate::ask::{self, ForwardAsker, PtyAsker};
use crate::authz::{self, Authorizer};
use crate::config::ServerConfig;
use crate::config_matcher::ConnInfo;
use crate::handler::ConnectionHandler;
use crate::matcher::provision_matcher_sets;
use crate::sshconf::ConfigPipeline;
use crate::subsystem::{self, Subsystem};

/// Tracks in-flight connections and sessions so shutdown can drain them
/// within the grace period.
#[derive(Clone, Default)]
pub struct ActiveSessions(Arc<ActiveInner>);

#[derive(Default)]
struct ActiveInner {
    count: AtomicUsize,
    notify: Notify,
}

impl ActiveSessions {
    pub fn guard(&self) -> ActiveGuard {
        self.0.count.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(Arc::clone(&self.0))
    }

    pub fn count(&self) -> usize {
        self.0.count.load(Ordering::SeqCst)
    }

    /// Resolves once no guards remain.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct ActiveGuard(Arc<ActiveInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }
}

/// The provisioned, immutable wiring shared by all of a server's
/// connections.
pub struct ServerContext {
    pub name: String,
    pub authorizer: Arc<dyn Authorizer>,
    pub actors: Vec<ActorEntry>,
    pub subsystems: BTreeMap<String, Arc<dyn Subsystem>>,
    pub pty_ask: Box<dyn PtyAsker>,
    pub local_forward: Box<dyn ForwardAsker>,
    pub reverse_forward: Box<dyn ForwardAsker>,
    pub configs: ConfigPipeline,
    pub max_timeout: Option<Duration>,
    pub active: ActiveSessions,
    /// Handed to connections no configurator matched; carries no host keys
    /// and no auth methods, so the handshake cannot complete.
    pub empty_config: Arc<russh::server::Config>,
}

/// One named server: shared context plus its listen range.
pub struct Server {
    ctx: Arc<ServerContext>,
    host: String,
    start_port: u16,
    end_port: u16,
}

impl Server {
    pub fn provision(name: &str, config: &ServerConfig, active: ActiveSessions) -> Result<Self> {
        let (host, start_port, end_port) = parse_listen_address(&config.address)
            .with_context(|| format!("server {name}: parsing address '{}'", config.address))?;

        let authorizer = match &config.authorize {
            Some(spec) => authz::provision_authorizer(spec),
            None => Arc::new(authz::Public) as Arc<dyn Authorizer>,
        };

        let mut actors = Vec::with_capacity(config.actors.len());
        for (i, actor) in config.actors.iter().enumerate() {
            let matchers = provision_matcher_sets(&actor.matchers)
                .with_context(|| format!("server {name}: actor {i}: loading matchers"))?;
            let handler = provision_actor(&actor.act)
                .with_context(|| format!("server {name}: actor {i}: loading actor"))?;
            actors.push(ActorEntry {
                matchers,
                actor: handler,
                is_final: actor.is_final,
            });
        }

        let idle_timeout = config.idle_timeout.map(Duration::from_secs);
        let configs = ConfigPipeline::provision(&config.configs, idle_timeout)
            .with_context(|| format!("server {name}: loading configurators"))?;

        let ctx = ServerContext {
            name: name.to_string(),
            authorizer,
            actors,
            subsystems: subsystem::provision_subsystems(&config.subsystems),
            pty_ask: ask::provision_pty_asker(config.pty.as_ref()),
            local_forward: ask::provision_forward_asker(config.localforward.as_ref())
                .with_context(|| format!("server {name}: loading localforward callback"))?,
            reverse_forward: ask::provision_forward_asker(config.reverseforward.as_ref())
                .with_context(|| format!("server {name}: loading reverseforward callback"))?,
            configs,
            max_timeout: config.max_timeout.map(Duration::from_secs),
            active,
            empty_config: Arc::new(russh::server::Config {
                methods: russh::MethodSet::empty(),
                ..Default::default()
            }),
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            host,
            start_port,
            end_port,
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// The (host, port) pairs this server wants to listen on.
    pub fn listen_addrs(&self) -> Vec<(String, u16)> {
        (self.start_port..=self.end_port)
            .map(|port| (self.host.clone(), port))
            .collect()
    }

    /// Binds every listener in the range, returning them with their bound
    /// addresses (which matters when a port was 0).
    pub async fn bind(&self) -> Result<Vec<(TcpListener, SocketAddr)>> {
        let mut listeners = Vec::new();
        for (host, port) in self.listen_addrs() {
            let listener = TcpListener::bind((host.as_str(), port))
                .await
                .with_context(|| format!("ssh: listening on {host}:{port}"))?;
            let addr = listener.local_addr().context("reading bound address")?;
            listeners.push((listener, addr));
        }
        Ok(listeners)
    }
}

/// Accepts connections until cancelled. Each connection runs on its own
/// task under `conn_cancel`.
pub async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = accept_cancel.cancelled() => {
                info!(server = ctx.name, "accept loop stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&ctx);
                    let cancel = conn_cancel.child_token();
                    tokio::spawn(async move {
                        handle_connection(ctx, stream, peer, cancel).await;
                    });
                }
                Err(err) => {
                    warn!(server = ctx.name, error = %err, "failed to accept connection");
                }
            },
        }
    }
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            warn!(server = ctx.name, error = %err, "failed to read local address");
            return;
        }
    };
    info!(server = ctx.name, remote_addr = %peer, "new connection");

    let conn = ConnInfo {
        remote_addr: peer,
        local_addr: local,
    };
    let params = ctx.configs.select(&conn);
    if params.is_none() {
        warn!(
            server = ctx.name,
            remote_addr = %peer,
            "no configurator matched; connection cannot authenticate"
        );
    }
    let config = params
        .as_ref()
        .map(|p| p.russh_config())
        .unwrap_or_else(|| Arc::clone(&ctx.empty_config));

    let _guard = ctx.active.guard();
    let max_timeout = ctx.max_timeout;
    let handler = ConnectionHandler::new(Arc::clone(&ctx), params, conn, cancel.clone());

    let running = match run_stream(config, stream, handler).await {
        Ok(running) => running,
        Err(err) => {
            // handshake failures end here; there is no session to speak of
            error!(server = ctx.name, remote_addr = %peer, error = %err, "ssh handshake failed");
            return;
        }
    };

    let drive = async {
        match running.await {
            Ok(()) => info!(server = ctx.name, remote_addr = %peer, "connection closed"),
            Err(err) => {
                warn!(server = ctx.name, remote_addr = %peer, error = %err, "connection error")
            }
        }
    };

    tokio::pin!(drive);
    let capped = async {
        match max_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, &mut drive).await.is_err() {
                    info!(server = ctx.name, remote_addr = %peer, "max session timeout reached");
                }
            }
            None => drive.await,
        }
    };

    tokio::select! {
        _ = capped => {}
        _ = cancel.cancelled() => {
            info!(server = ctx.name, remote_addr = %peer, "connection force-closed on shutdown");
        }
    }
    // connection gone; stop anything still running on its behalf
    cancel.cancel();
}

/// Parses a listener address of the form `[network/]host:port[-port]`.
/// Only the `tcp` network is supported.
pub fn parse_listen_address(address: &str) -> Result<(String, u16, u16)> {
    let (network, rest) = match address.split_once('/') {
        Some((network, rest)) => (network, rest),
        None => ("tcp", address),
    };
    if network != "tcp" {
        return Err(
            crate::Error::Config("only 'tcp' is supported in the listener address".into()).into(),
        );
    }

    let (host, ports) = rest
        .rsplit_once(':')
        .with_context(|| format!("address '{address}' has no port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("address '{address}' has no host");
    }

    let (start, end) = match ports.split_once('-') {
        Some((start, end)) => (
            start
                .parse::<u16>()
                .with_context(|| format!("invalid start port in '{address}'"))?,
            end.parse::<u16>()
                .with_context(|| format!("invalid end port in '{address}'"))?,
        ),
        None => {
            let port = ports
                .parse::<u16>()
                .with_context(|| format!("invalid port in '{address}'"))?;
            (port, port)
        }
    };
    if start > end {
        bail!("port range in '{address}' is inverted");
    }
    Ok((host.to_string(), start, end))
}
