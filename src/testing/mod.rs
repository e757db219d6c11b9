//! Test support
//!
//! Buffer-backed session builders for unit tests and a small SSH client
//! for end-to-end tests. Compiled into the library so integration tests
//! and downstream users can drive a server without a real terminal.

mod ssh_client;

pub use ssh_client::SshTestClient;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::account::Account;
use crate::session::{PtyRequest, Session, SessionOutput, SessionParams, WindowSize};

/// Handles to the outside of a test session: captured output and the
/// senders feeding input, signals, and window changes.
pub struct TestSessionIo {
    pub buffer: Arc<Mutex<Vec<u8>>>,
    pub input_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub signals_tx: mpsc::UnboundedSender<russh::Sig>,
    pub window_tx: watch::Sender<WindowSize>,
    pub cancel: CancellationToken,
}

/// Builder for sessions that never saw a network connection.
pub struct SessionBuilder {
    account: Account,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    env: Vec<(String, String)>,
    raw_command: Option<String>,
    subsystem: Option<String>,
    pty: Option<PtyRequest>,
}

impl SessionBuilder {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            remote_addr: "127.0.0.1:50000".parse().expect("static addr"),
            local_addr: "127.0.0.1:22".parse().expect("static addr"),
            env: Vec::new(),
            raw_command: None,
            subsystem: None,
            pty: None,
        }
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.push((name.to_string(), value.to_string()));
        self
    }

    pub fn raw_command(mut self, command: &str) -> Self {
        self.raw_command = Some(command.to_string());
        self
    }

    pub fn subsystem(mut self, name: &str) -> Self {
        self.subsystem = Some(name.to_string());
        self
    }

    pub fn pty(mut self, pty: PtyRequest) -> Self {
        self.pty = Some(pty);
        self
    }

    pub fn build(self) -> (Session, TestSessionIo) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (window_tx, window_rx) = watch::channel(WindowSize {
            col_width: 80,
            row_height: 24,
        });
        let cancel = CancellationToken::new();
        let session = Session::new(SessionParams {
            account: self.account,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            env: self.env,
            raw_command: self.raw_command,
            subsystem: self.subsystem,
            public_key: None,
            pty: self.pty,
            output: SessionOutput::Buffer(buffer.clone()),
            window: window_rx,
            signals: signals_rx,
            input: input_rx,
            cancel: cancel.clone(),
        });
        (
            session,
            TestSessionIo {
                buffer,
                input_tx,
                signals_tx,
                window_tx,
                cancel,
            },
        )
    }
}

/// A session for the given account with buffered output and defaults
/// everywhere else.
pub fn session(account: Account) -> Session {
    SessionBuilder::new(account).build().0
}

/// Like [`session`], also returning the output buffer.
pub fn buffer_session(account: Account) -> (Session, Arc<Mutex<Vec<u8>>>) {
    let (session, io) = SessionBuilder::new(account).build();
    (session, io.buffer)
}
