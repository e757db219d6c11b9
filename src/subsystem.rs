//! Subsystems
//!
//! Named post-auth dispatch targets registered per server. When a client
//! requests a subsystem, the connection handler routes the channel to the
//! matching entry; the actor pipeline is not involved.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::session::Session;

/// A subsystem handler owns the session for the channel's lifetime.
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, session: Session) -> Result<()>;
}

/// Echoes client input back on the channel until the client closes its
/// side or the session is cancelled. A stand-in wire target for exercising
/// subsystem routing.
pub struct EchoSubsystem;

#[async_trait]
impl Subsystem for EchoSubsystem {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn handle(&self, mut session: Session) -> Result<()> {
        info!(
            user = session.user(),
            remote_addr = %session.remote_addr(),
            session_id = session.id(),
            "handling echo subsystem session"
        );
        let Some(mut input) = session.take_input() else {
            return Ok(());
        };
        let cancel = session.cancellation();
        loop {
            tokio::select! {
                data = input.recv() => match data {
                    Some(bytes) => session.write(&bytes).await?,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum SubsystemConfig {
    Echo,
}

/// Builds the per-server subsystem table from config.
pub fn provision_subsystems(
    configs: &BTreeMap<String, SubsystemConfig>,
) -> BTreeMap<String, Arc<dyn Subsystem>> {
    configs
        .iter()
        .map(|(name, config)| {
            let subsystem: Arc<dyn Subsystem> = match config {
                SubsystemConfig::Echo => Arc::new(EchoSubsystem),
            };
            (name.clone(), subsystem)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::testing;

    #[tokio::test]
    async fn echo_round_trips_input() {
        let (session, io) = testing::SessionBuilder::new(Account::new("alice"))
            .subsystem("echo")
            .build();

        io.input_tx.send(b"ping".to_vec()).unwrap();
        drop(io.input_tx);

        EchoSubsystem.handle(session).await.unwrap();
        assert_eq!(&*io.buffer.lock().unwrap(), b"ping");
    }
}
