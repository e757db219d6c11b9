//! SSH test client
//!
//! Connects to a gangway server, runs a command or shell, and captures the
//! output and exit status. Used by the end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};

/// Outcome of driving one channel to completion.
#[derive(Debug, Default)]
pub struct ChannelResult {
    pub output: Vec<u8>,
    pub exit_status: Option<u32>,
}

/// SSH test client for running commands and capturing output.
pub struct SshTestClient {
    handle: Handle<ClientHandler>,
}

impl SshTestClient {
    /// Connect and authenticate with the given private key.
    pub async fn connect(addr: &str, username: &str, key: PrivateKey) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, ClientHandler)
            .await
            .context("failed to connect")?;

        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        let auth_result = handle
            .authenticate_publickey(username, key_with_alg)
            .await
            .context("key authentication failed")?;
        if !auth_result.success() {
            anyhow::bail!("authentication rejected");
        }

        Ok(Self { handle })
    }

    /// Connect and authenticate with a password.
    pub async fn connect_with_password(
        addr: &str,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, ClientHandler)
            .await
            .context("failed to connect")?;

        let auth_result = handle
            .authenticate_password(username, password)
            .await
            .context("password authentication failed")?;
        if !auth_result.success() {
            anyhow::bail!("authentication rejected");
        }

        Ok(Self { handle })
    }

    /// Run a command and collect output until the channel closes or the
    /// timeout expires.
    pub async fn exec(&mut self, command: &str, timeout: Duration) -> Result<ChannelResult> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        channel
            .exec(true, command)
            .await
            .context("failed to send exec request")?;
        Self::drain(channel, timeout).await
    }

    /// Request a shell and collect output until the channel closes or the
    /// timeout expires.
    pub async fn shell(&mut self, timeout: Duration) -> Result<ChannelResult> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        channel
            .request_shell(true)
            .await
            .context("failed to request shell")?;
        Self::drain(channel, timeout).await
    }

    async fn drain(
        mut channel: russh::Channel<client::Msg>,
        timeout: Duration,
    ) -> Result<ChannelResult> {
        let mut result = ChannelResult::default();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, channel.wait()).await {
                Ok(Some(ChannelMsg::Data { data })) => {
                    result.output.extend_from_slice(&data);
                }
                Ok(Some(ChannelMsg::ExtendedData { data, .. })) => {
                    result.output.extend_from_slice(&data);
                }
                Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                    result.exit_status = Some(exit_status);
                }
                Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) => {
                    // keep draining briefly so a late exit status is not lost
                    if result.exit_status.is_some() {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }
        Ok(result)
    }

    /// Request a named subsystem, send a payload, and collect the bytes
    /// the subsystem writes back until at least `expect` bytes arrived or
    /// the timeout expires.
    pub async fn subsystem(
        &mut self,
        name: &str,
        payload: &[u8],
        expect: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        channel
            .request_subsystem(true, name)
            .await
            .context("failed to request subsystem")?;
        channel.data(payload).await.context("failed to send data")?;
        channel.eof().await.context("failed to send eof")?;

        let mut output = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while output.len() < expect {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, channel.wait()).await {
                Ok(Some(ChannelMsg::Data { data })) => output.extend_from_slice(&data),
                Ok(Some(ChannelMsg::Close)) | Ok(None) => break,
                Ok(Some(_)) => {}
                Err(_) => break,
            }
        }
        Ok(output)
    }

    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "goodbye", "en")
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}

/// Client handler that accepts any host key; this client only ever talks
/// to servers the test just started.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
