//! Authenticated session view
//!
//! A [`Session`] is materialized once the SSH handshake and authentication
//! have completed and a channel asked for work (shell, exec, subsystem).
//! Identity and endpoints are frozen at construction; actors get mutable
//! access only to the I/O side. There is deliberately no way for an actor
//! to send the exit status or close the connection, that belongs to the
//! session lifecycle in `handler`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use russh::keys::PublicKey;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec, Sig};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::account::{Account, Permissions};

/// A granted PTY request, as reported by the client.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

/// Terminal dimensions pushed on window-change requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub col_width: u32,
    pub row_height: u32,
}

/// Where session output goes: the SSH channel in production, an in-memory
/// buffer in tests.
pub enum SessionOutput {
    Channel { handle: Handle, channel: ChannelId },
    Buffer(Arc<Mutex<Vec<u8>>>),
}

/// Everything needed to materialize a session. Collected by the connection
/// handler across the auth callbacks and channel requests.
pub struct SessionParams {
    pub account: Account,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub env: Vec<(String, String)>,
    pub raw_command: Option<String>,
    pub subsystem: Option<String>,
    pub public_key: Option<PublicKey>,
    pub pty: Option<PtyRequest>,
    pub output: SessionOutput,
    pub window: watch::Receiver<WindowSize>,
    pub signals: mpsc::UnboundedReceiver<Sig>,
    pub input: mpsc::UnboundedReceiver<Vec<u8>>,
    pub cancel: CancellationToken,
}

/// One authenticated SSH session.
pub struct Session {
    id: String,
    account: Account,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    env: Vec<(String, String)>,
    raw_command: Option<String>,
    command: Vec<String>,
    subsystem: Option<String>,
    public_key: Option<PublicKey>,
    pty: Option<PtyRequest>,
    output: SessionOutput,
    window: watch::Receiver<WindowSize>,
    signals: Option<mpsc::UnboundedReceiver<Sig>>,
    input: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        let command = params
            .raw_command
            .as_deref()
            .map(split_command)
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4().to_string(),
            account: params.account,
            remote_addr: params.remote_addr,
            local_addr: params.local_addr,
            env: params.env,
            raw_command: params.raw_command,
            command,
            subsystem: params.subsystem,
            public_key: params.public_key,
            pty: params.pty,
            output: params.output,
            window: params.window,
            signals: Some(params.signals),
            input: Some(params.input),
            cancel: params.cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Username of the authenticated account.
    pub fn user(&self) -> &str {
        self.account.username()
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Environment set by the client, in request order.
    pub fn environ(&self) -> &[(String, String)] {
        &self.env
    }

    /// The exact command string the client sent, if any.
    pub fn raw_command(&self) -> Option<&str> {
        self.raw_command.as_deref()
    }

    /// The command split by POSIX-ish shell rules (quoting respected).
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    /// Public key used for authentication, if public-key auth was used.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn permissions(&self) -> &Permissions {
        self.account.permissions()
    }

    pub fn pty(&self) -> Option<&PtyRequest> {
        self.pty.as_ref()
    }

    /// Watch channel carrying window-size changes; the latest value is the
    /// current size.
    pub fn window_changes(&self) -> watch::Receiver<WindowSize> {
        self.window.clone()
    }

    /// Takes the signal stream. Only one handler can own it; later callers
    /// get `None`.
    pub fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<Sig>> {
        self.signals.take()
    }

    /// Takes the input byte stream from the client, same ownership rule as
    /// `take_signals`.
    pub fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.input.take()
    }

    /// Cancelled when the underlying connection closes or the server shuts
    /// the session down. Long-running handlers must watch it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        match &self.output {
            SessionOutput::Channel { handle, channel } => handle
                .data(*channel, CryptoVec::from(data))
                .await
                .map_err(|_| anyhow!("writing to session channel failed")),
            SessionOutput::Buffer(buffer) => {
                buffer.lock().unwrap().extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Writes to the stderr side of the channel.
    pub async fn write_stderr(&mut self, data: &[u8]) -> Result<()> {
        match &self.output {
            SessionOutput::Channel { handle, channel } => handle
                .extended_data(*channel, 1, CryptoVec::from(data))
                .await
                .map_err(|_| anyhow!("writing to session stderr failed")),
            SessionOutput::Buffer(buffer) => {
                buffer.lock().unwrap().extend_from_slice(data);
                Ok(())
            }
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data).await
    }
}

/// Splits a raw command string the way a POSIX shell tokenizes it: on
/// whitespace, with single quotes, double quotes, and backslash escapes
/// keeping their content together. Unterminated quotes swallow the rest of
/// the line.
pub fn split_command(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            // inside double quotes the backslash only
                            // escapes the closing quote and itself
                            match chars.peek() {
                                Some('"') | Some('\\') => {
                                    current.push(chars.next().unwrap_or(q));
                                }
                                _ => current.push(q),
                            }
                        }
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}
