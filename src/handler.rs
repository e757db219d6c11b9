//! Per-connection handler and session lifecycle
//!
//! One [`ConnectionHandler`] exists per accepted connection. It answers
//! the SSH library's auth callbacks through the matched configurator's
//! flows, accumulates channel state (env, pty, window size), and when the
//! client asks for work it materializes the [`Session`] and spawns the
//! lifecycle task: authorize, run the actor pipeline, send the exit
//! status, deauthorize, close.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Session as SshSession};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::actors::run_pipeline;
use crate::ask::AskContext;
use crate::authn::ConnContext;
use crate::authz::DeauthGuard;
use crate::config_matcher::ConnInfo;
use crate::server::ServerContext;
use crate::session::{PtyRequest, Session, SessionOutput, SessionParams, WindowSize};
use crate::sshconf::ProvidedConfig;

pub struct ConnectionHandler {
    server: Arc<ServerContext>,
    /// SSH parameters from the matched configurator; `None` when no
    /// configurator claimed the connection, which rejects all auth.
    params: Option<Arc<ProvidedConfig>>,
    conn: ConnInfo,
    cancel: CancellationToken,
    account: Option<Account>,
    public_key: Option<PublicKey>,
    env: Vec<(String, String)>,
    pty: Option<PtyRequest>,
    main_channel: Option<ChannelId>,
    window_tx: watch::Sender<WindowSize>,
    window_rx: watch::Receiver<WindowSize>,
    signals_tx: mpsc::UnboundedSender<Sig>,
    signals_rx: Option<mpsc::UnboundedReceiver<Sig>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    input_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    pipeline_started: bool,
    /// Active reverse-forward listeners keyed by (address, port).
    forwards: HashMap<(String, u32), CancellationToken>,
}

impl ConnectionHandler {
    pub fn new(
        server: Arc<ServerContext>,
        params: Option<Arc<ProvidedConfig>>,
        conn: ConnInfo,
        cancel: CancellationToken,
    ) -> Self {
        let (window_tx, window_rx) = watch::channel(WindowSize {
            col_width: 0,
            row_height: 0,
        });
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            server,
            params,
            conn,
            cancel,
            account: None,
            public_key: None,
            env: Vec::new(),
            pty: None,
            main_channel: None,
            window_tx,
            window_rx,
            signals_tx,
            signals_rx: Some(signals_rx),
            input_tx,
            input_rx: Some(input_rx),
            pipeline_started: false,
            forwards: HashMap::new(),
        }
    }

    fn conn_context<'a>(&self, username: &'a str) -> ConnContext<'a> {
        ConnContext {
            username,
            remote_addr: self.conn.remote_addr,
            local_addr: self.conn.local_addr,
        }
    }

    fn ask_context(&self) -> AskContext<'_> {
        AskContext {
            user: self.account.as_ref().map(Account::username).unwrap_or(""),
            remote_addr: self.conn.remote_addr,
            local_addr: self.conn.local_addr,
        }
    }

    /// Rejection advertising the remaining methods, with the one that just
    /// failed removed.
    fn reject(&self, used: Option<MethodKind>) -> Auth {
        let mut methods = self
            .params
            .as_ref()
            .map(|p| p.method_set())
            .unwrap_or_else(MethodSet::empty);
        if let Some(used) = used {
            methods.remove(used);
        }
        Auth::Reject {
            proceed_with_methods: if methods.is_empty() {
                None
            } else {
                Some(methods)
            },
            partial_success: false,
        }
    }

    /// Builds the session and spawns its lifecycle task. One unit of work
    /// per connection; later requests are refused.
    fn start_pipeline(
        &mut self,
        channel: ChannelId,
        ssh: &mut SshSession,
        raw_command: Option<String>,
        subsystem: Option<String>,
    ) -> Option<Session> {
        if self.pipeline_started {
            warn!(
                server = self.server.name,
                remote_addr = %self.conn.remote_addr,
                "session already running, refusing second request"
            );
            return None;
        }
        self.pipeline_started = true;

        let account = match &self.account {
            Some(account) => account.clone(),
            None => {
                // only reachable through no_client_auth
                Account::new("")
            }
        };

        let signals_rx = match self.signals_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.signals_tx = tx;
                rx
            }
        };
        let input_rx = match self.input_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.input_tx = tx;
                rx
            }
        };

        Some(Session::new(SessionParams {
            account,
            remote_addr: self.conn.remote_addr,
            local_addr: self.conn.local_addr,
            env: self.env.clone(),
            raw_command,
            subsystem,
            public_key: self.public_key.clone(),
            pty: self.pty.clone(),
            output: SessionOutput::Channel {
                handle: ssh.handle(),
                channel,
            },
            window: self.window_rx.clone(),
            signals: signals_rx,
            input: input_rx,
            cancel: self.cancel.child_token(),
        }))
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let Some(params) = &self.params else {
            return Ok(self.reject(None));
        };
        if params.no_client_auth() {
            info!(
                server = self.server.name,
                user,
                remote_addr = %self.conn.remote_addr,
                "client connected without authentication"
            );
            self.account = Some(Account::new(user));
            return Ok(Auth::Accept);
        }
        Ok(self.reject(Some(MethodKind::None)))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Some(params) = &self.params else {
            return Ok(self.reject(None));
        };
        match params
            .authn()
            .authenticate_password(&self.conn_context(user), password)
        {
            Ok(account) => {
                self.account = Some(account);
                Ok(Auth::Accept)
            }
            Err(_) => Ok(self.reject(Some(MethodKind::Password))),
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(params) = &self.params else {
            return Ok(self.reject(None));
        };
        // probe only; the account is adopted in auth_publickey once the
        // signature checks out
        match params
            .authn()
            .authenticate_public_key(&self.conn_context(user), key)
        {
            Ok(_) => Ok(Auth::Accept),
            Err(_) => Ok(self.reject(Some(MethodKind::PublicKey))),
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let Some(params) = &self.params else {
            return Ok(self.reject(None));
        };
        match params
            .authn()
            .authenticate_public_key(&self.conn_context(user), key)
        {
            Ok(account) => {
                self.account = Some(account);
                self.public_key = Some(key.clone());
                Ok(Auth::Accept)
            }
            Err(_) => Ok(self.reject(Some(MethodKind::PublicKey))),
        }
    }

    async fn auth_keyboard_interactive<'a>(
        &'a mut self,
        user: &str,
        _submethods: &str,
        response: Option<russh::server::Response<'a>>,
    ) -> Result<Auth, Self::Error> {
        let Some(params) = &self.params else {
            return Ok(self.reject(None));
        };
        let responses: Vec<String> = response
            .map(|r| {
                r.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .collect()
            })
            .unwrap_or_default();
        match params
            .authn()
            .authenticate_interactive(&self.conn_context(user), &responses)
        {
            Ok(account) => {
                self.account = Some(account);
                Ok(Auth::Accept)
            }
            Err(_) => Ok(self.reject(Some(MethodKind::KeyboardInteractive))),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        if self.main_channel.is_some() {
            warn!(
                server = self.server.name,
                remote_addr = %self.conn.remote_addr,
                "refusing second session channel"
            );
            return Ok(false);
        }
        debug!(channel_id = ?channel.id(), "session channel opened");
        self.main_channel = Some(channel.id());
        Ok(true)
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.env
            .push((variable_name.to_string(), variable_value.to_string()));
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if !self.server.pty_ask.allow(&self.ask_context(), term) {
            session.channel_failure(channel)?;
            return Ok(());
        }
        self.pty = Some(PtyRequest {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
        });
        let _ = self.window_tx.send(WindowSize {
            col_width,
            row_height,
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _ = self.window_tx.send(WindowSize {
            col_width,
            row_height,
        });
        Ok(())
    }

    async fn signal(
        &mut self,
        _channel: ChannelId,
        signal: Sig,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _ = self.signals_tx.send(signal);
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _ = self.input_tx.send(data.to_vec());
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        // swap the sender out so whoever holds the input receiver sees
        // end-of-input
        let (tx, _unused_rx) = mpsc::unbounded_channel();
        self.input_tx = tx;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        match self.start_pipeline(channel, session, Some(raw), None) {
            Some(work) => {
                session.channel_success(channel)?;
                spawn_session(Arc::clone(&self.server), work, session.handle(), channel);
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        match self.start_pipeline(channel, session, None, None) {
            Some(work) => {
                session.channel_success(channel)?;
                spawn_session(Arc::clone(&self.server), work, session.handle(), channel);
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let Some(subsystem) = self.server.subsystems.get(name).cloned() else {
            debug!(
                server = self.server.name,
                subsystem = name,
                "unknown subsystem requested"
            );
            session.channel_failure(channel)?;
            return Ok(());
        };
        match self.start_pipeline(channel, session, None, Some(name.to_string())) {
            Some(work) => {
                session.channel_success(channel)?;
                let server = Arc::clone(&self.server);
                let handle = session.handle();
                tokio::spawn(async move {
                    let _active = server.active.guard();
                    let session_id = work.id().to_string();
                    if let Err(err) = subsystem.handle(work).await {
                        error!(
                            server = server.name,
                            session_id,
                            error = %err,
                            "subsystem handler failed"
                        );
                    }
                    let _ = handle.eof(channel).await;
                    let _ = handle.close(channel).await;
                });
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        if !self
            .server
            .local_forward
            .allow(&self.ask_context(), host_to_connect, port_to_connect)
        {
            return Ok(false);
        }
        let target = format!("{host_to_connect}:{port_to_connect}");
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = match TcpStream::connect(&target).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target, error = %err, "direct-tcpip connect failed");
                    return;
                }
            };
            let mut channel_stream = channel.into_stream();
            tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut channel_stream, &mut stream) => {}
                _ = cancel.cancelled() => {}
            }
        });
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        if !self
            .server
            .reverse_forward
            .allow(&self.ask_context(), address, *port)
        {
            return Ok(false);
        }
        let listener = match tokio::net::TcpListener::bind((address, *port as u16)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(address, port = *port, error = %err, "reverse forward bind failed");
                return Ok(false);
            }
        };
        if *port == 0 {
            *port = u32::from(listener.local_addr()?.port());
        }

        let cancel = self.cancel.child_token();
        self.forwards
            .insert((address.to_string(), *port), cancel.clone());

        let handle = session.handle();
        let bind_address = address.to_string();
        let bind_port = *port;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((mut stream, peer)) = accepted else { return };
                        let opened = handle
                            .channel_open_forwarded_tcpip(
                                bind_address.clone(),
                                bind_port,
                                peer.ip().to_string(),
                                u32::from(peer.port()),
                            )
                            .await;
                        match opened {
                            Ok(channel) => {
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    let mut channel_stream = channel.into_stream();
                                    tokio::select! {
                                        _ = tokio::io::copy_bidirectional(
                                            &mut channel_stream,
                                            &mut stream,
                                        ) => {}
                                        _ = cancel.cancelled() => {}
                                    }
                                });
                            }
                            Err(_) => return,
                        }
                    }
                }
            }
        });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        if let Some(cancel) = self.forwards.remove(&(address.to_string(), port)) {
            cancel.cancel();
            return Ok(true);
        }
        Ok(false)
    }
}

fn spawn_session(
    server: Arc<ServerContext>,
    session: Session,
    handle: Handle,
    channel: ChannelId,
) {
    tokio::spawn(run_session(server, session, handle, channel));
}

/// The session lifecycle: authorize, act, report, deauthorize, close.
async fn run_session(
    server: Arc<ServerContext>,
    mut session: Session,
    handle: Handle,
    channel: ChannelId,
) {
    let _active = server.active.guard();
    info!(
        server = server.name,
        user = session.user(),
        remote_addr = %session.remote_addr(),
        session_id = session.id(),
        "session started"
    );

    let deauth = match server.authorizer.authorize(&session) {
        Ok(Some(deauth)) => deauth,
        Ok(None) => {
            info!(
                server = server.name,
                user = session.user(),
                remote_addr = %session.remote_addr(),
                session_id = session.id(),
                "session not authorized"
            );
            let _ = handle.close(channel).await;
            return;
        }
        Err(err) => {
            error!(
                server = server.name,
                user = session.user(),
                remote_addr = %session.remote_addr(),
                session_id = session.id(),
                error = %err,
                "error on session authorization"
            );
            let _ = handle.close(channel).await;
            return;
        }
    };
    // from here on the deauthorizer runs exactly once, panic or not
    let deauth_guard = DeauthGuard::new(deauth, session.id());

    let errors = run_pipeline(&server.actors, &mut session).await;
    let exit_code = if errors.is_empty() {
        0
    } else {
        let joined = errors
            .iter()
            .map(|e| format!("{e:#}"))
            .collect::<Vec<_>>()
            .join("; ");
        error!(
            server = server.name,
            session_id = session.id(),
            errors = joined,
            "actors errors"
        );
        1
    };

    if handle.exit_status_request(channel, exit_code).await.is_err() {
        error!(
            server = server.name,
            remote_addr = %session.remote_addr(),
            session_id = session.id(),
            "error on exit"
        );
    }
    let _ = handle.eof(channel).await;

    info!(
        server = server.name,
        user = session.user(),
        remote_addr = %session.remote_addr(),
        session_id = session.id(),
        "session ended"
    );
    drop(deauth_guard);
    let _ = handle.close(channel).await;
}
