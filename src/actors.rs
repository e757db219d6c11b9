//! Session actors
//!
//! Actors do the actual work on an authenticated, authorized session. The
//! pipeline walks its entries in order, runs every actor whose matcher
//! sets accept the session, collects errors, and stops after an actor
//! marked final. Actor failures never abort the loop on their own; they
//! only flip the exit status.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::matcher::{MatcherSetConfig, MatcherSets};
use crate::session::Session;

/// A handler acting on a session. Actors may block for the lifetime of
/// the session (a shell does) and must watch the session's cancellation.
#[async_trait]
pub trait Actor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, session: &mut Session) -> Result<()>;
}

/// One pipeline entry: matchers, the actor, and whether a match ends the
/// pipeline after this actor ran.
pub struct ActorEntry {
    pub matchers: MatcherSets,
    pub actor: Box<dyn Actor>,
    pub is_final: bool,
}

/// One actor entry as written in config.
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    #[serde(default, rename = "match")]
    pub matchers: Vec<MatcherSetConfig>,
    pub act: ActorKindConfig,
    /// End the pipeline after this actor when it matched.
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActorKindConfig {
    StaticResponse {
        response: String,
    },
    Shell {
        #[serde(default)]
        force_command: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        force_pty: bool,
    },
}

pub fn provision_actor(config: &ActorKindConfig) -> Result<Box<dyn Actor>> {
    Ok(match config {
        ActorKindConfig::StaticResponse { response } => Box::new(StaticResponse {
            response: response.clone(),
        }),
        ActorKindConfig::Shell {
            force_command,
            env,
            force_pty,
        } => Box::new(Shell {
            force_command: force_command.clone(),
            env: env.clone(),
            force_pty: *force_pty,
        }),
    })
}

/// Runs the pipeline and returns the collected actor errors, in order.
pub async fn run_pipeline(actors: &[ActorEntry], session: &mut Session) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for entry in actors {
        if !entry.matchers.any_match(session) {
            continue;
        }
        debug!(
            actor = entry.actor.name(),
            session_id = session.id(),
            "actor matched"
        );
        if let Err(err) = entry.actor.handle(session).await {
            errors.push(err.context(entry.actor.name()));
        }
        if entry.is_final {
            break;
        }
    }
    errors
}

/// Writes a fixed response and a newline to the session.
pub struct StaticResponse {
    pub response: String,
}

#[async_trait]
impl Actor for StaticResponse {
    fn name(&self) -> &'static str {
        "static_response"
    }

    async fn handle(&self, session: &mut Session) -> Result<()> {
        session.write_line(&self.response).await
    }
}

/// Runs the session command as a child process, piping the channel to the
/// child's stdio. This is the actor-level shell contract; PTY allocation
/// is not part of it.
pub struct Shell {
    /// Runs this command regardless of what the client asked for,
    /// following the ForceCommand semantics.
    pub force_command: Option<String>,
    /// Extra environment for the child.
    pub env: HashMap<String, String>,
    /// Refuse sessions that did not get a PTY granted.
    pub force_pty: bool,
}

#[async_trait]
impl Actor for Shell {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn handle(&self, session: &mut Session) -> Result<()> {
        if self.force_pty && session.pty().is_none() {
            bail!("session has no pty and force_pty is set");
        }

        let argv: Vec<String> = match &self.force_command {
            Some(forced) => crate::session::split_command(forced),
            None => session.command().to_vec(),
        };
        if argv.is_empty() {
            bail!("no command to execute");
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(session.environ().iter().cloned())
            .envs(&self.env)
            .env("USER", session.user())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if session.account().home().is_dir() {
            command.current_dir(session.account().home());
        }
        if let Some(pty) = session.pty() {
            command.env("TERM", &pty.term);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning '{}'", argv[0]))?;

        let mut stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout missing"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("child stderr missing"))?;
        let mut input = session.take_input();
        let mut signals = session.take_signals();
        let cancel = session.cancellation();

        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let mut out_open = true;
        let mut err_open = true;

        let status = loop {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => session.write(&out_buf[..n]).await?,
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => session.write_stderr(&err_buf[..n]).await?,
                },
                data = recv_input(&mut input) => match data {
                    Some(bytes) => {
                        let broken = match stdin.as_mut() {
                            Some(pipe) => pipe.write_all(&bytes).await.is_err(),
                            None => false,
                        };
                        if broken {
                            stdin = None;
                        }
                    }
                    // client closed its write side; propagate EOF and stop
                    // polling the drained receiver
                    None => {
                        stdin = None;
                        input = None;
                    }
                },
                sig = recv_signal(&mut signals) => {
                    use russh::Sig;
                    match sig {
                        Sig::INT | Sig::TERM | Sig::KILL | Sig::QUIT => {
                            warn!(session_id = session.id(), signal = ?sig, "client signal, killing child");
                            let _ = child.kill().await;
                            bail!("terminated by client signal");
                        }
                        other => debug!(session_id = session.id(), signal = ?other, "client signal ignored"),
                    }
                }
                status = child.wait() => {
                    break status.context("waiting for child")?;
                }
                _ = cancel.cancelled() => {
                    warn!(session_id = session.id(), "session cancelled, killing child");
                    let _ = child.kill().await;
                    bail!("session cancelled");
                }
            }
        };

        // flush whatever the child left in its pipes
        while out_open {
            match stdout.read(&mut out_buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => session.write(&out_buf[..n]).await?,
            }
        }
        while err_open {
            match stderr.read(&mut err_buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => session.write_stderr(&err_buf[..n]).await?,
            }
        }

        if !status.success() {
            bail!("command exited with {status}");
        }
        Ok(())
    }
}

async fn recv_input(
    input: &mut Option<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
) -> Option<Vec<u8>> {
    match input {
        Some(rx) => rx.recv().await,
        // input already claimed by someone else; never resolve
        None => std::future::pending().await,
    }
}

async fn recv_signal(
    signals: &mut Option<tokio::sync::mpsc::UnboundedReceiver<russh::Sig>>,
) -> russh::Sig {
    match signals {
        Some(rx) => match rx.recv().await {
            Some(sig) => sig,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::matcher::{MatcherSet, MatcherSets};
    use crate::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Recorder {
        tag: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Actor for Recorder {
        fn name(&self) -> &'static str {
            self.tag
        }

        async fn handle(&self, session: &mut Session) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            session.write_line(self.tag).await?;
            if self.fail {
                bail!("{} failed", self.tag)
            }
            Ok(())
        }
    }

    fn entry(tag: &'static str, calls: &Arc<AtomicUsize>, is_final: bool) -> ActorEntry {
        ActorEntry {
            matchers: MatcherSets::default(),
            actor: Box::new(Recorder {
                tag,
                calls: Arc::clone(calls),
                fail: false,
            }),
            is_final,
        }
    }

    #[tokio::test]
    async fn static_response_writes_line() {
        let (mut session, buffer) = testing::buffer_session(Account::new("alice"));
        let actor = StaticResponse {
            response: "hello".to_string(),
        };
        actor.handle(&mut session).await.unwrap();
        assert_eq!(&*buffer.lock().unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn final_actor_stops_the_pipeline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let actors = vec![
            entry("first", &calls, false),
            entry("second", &calls, true),
            entry("third", &calls, false),
        ];
        let (mut session, buffer) = testing::buffer_session(Account::new("alice"));

        let errors = run_pipeline(&actors, &mut session).await;
        assert!(errors.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(&*buffer.lock().unwrap(), b"first\nsecond\n");
    }

    #[tokio::test]
    async fn errors_are_collected_and_pipeline_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let actors = vec![
            ActorEntry {
                matchers: MatcherSets::default(),
                actor: Box::new(Recorder {
                    tag: "boom",
                    calls: Arc::clone(&calls),
                    fail: true,
                }),
                is_final: false,
            },
            entry("after", &calls, false),
        ];
        let (mut session, _buffer) = testing::buffer_session(Account::new("alice"));

        let errors = run_pipeline(&actors, &mut session).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unmatched_actors_are_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let matchers = MatcherSets::new(vec![MatcherSet::new(vec![Box::new(
            crate::matcher::MatchUser::new(vec!["somebody-else".into()]),
        )])]);
        let actors = vec![ActorEntry {
            matchers,
            actor: Box::new(Recorder {
                tag: "skipped",
                calls: Arc::clone(&calls),
                fail: false,
            }),
            is_final: false,
        }];
        let (mut session, _buffer) = testing::buffer_session(Account::new("alice"));

        let errors = run_pipeline(&actors, &mut session).await;
        assert!(errors.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shell_runs_command_and_captures_output() {
        let account = Account::new("alice");
        let (mut session, io) = testing::SessionBuilder::new(account)
            .raw_command("/bin/echo shell-output")
            .build();
        drop(io.input_tx); // no client input

        let shell = Shell {
            force_command: None,
            env: HashMap::new(),
            force_pty: false,
        };
        shell.handle(&mut session).await.unwrap();
        let output = io.buffer.lock().unwrap().clone();
        assert_eq!(output, b"shell-output\n");
    }

    #[tokio::test]
    async fn shell_reports_nonzero_exit() {
        let (mut session, io) = testing::SessionBuilder::new(Account::new("alice"))
            .raw_command("/bin/sh -c 'exit 3'")
            .build();
        drop(io.input_tx);

        let shell = Shell {
            force_command: None,
            env: HashMap::new(),
            force_pty: false,
        };
        assert!(shell.handle(&mut session).await.is_err());
    }

    #[tokio::test]
    async fn shell_force_pty_rejects_sessions_without_pty() {
        let (mut session, _io) = testing::SessionBuilder::new(Account::new("alice"))
            .raw_command("/bin/true")
            .build();
        let shell = Shell {
            force_command: None,
            env: HashMap::new(),
            force_pty: true,
        };
        assert!(shell.handle(&mut session).await.is_err());
    }
}
