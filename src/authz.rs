//! Session authorization
//!
//! Authorizers admit or reject a session after authentication and before
//! any actor runs. Every grant is paired with a deauthorizer that the
//! session lifecycle invokes exactly once, on clean teardown or on any
//! error path past authorization.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::{error, info};

use crate::session::Session;

/// Undoes one authorization. Consumed on invocation; the lifecycle holds
/// it in a guard so it runs exactly once even if a handler panics.
pub type Deauthorize = Box<dyn FnOnce() -> Result<()> + Send>;

/// Admission control for authenticated sessions. `Ok(None)` denies without
/// error; `Ok(Some(_))` grants and hands back the paired deauthorizer. An
/// erroring authorizer does not require deauthorization.
pub trait Authorizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn authorize(&self, session: &Session) -> Result<Option<Deauthorize>>;
}

/// Authorizes every session.
pub struct Public;

impl Authorizer for Public {
    fn name(&self) -> &'static str {
        "public"
    }

    fn authorize(&self, _session: &Session) -> Result<Option<Deauthorize>> {
        Ok(Some(Box::new(|| Ok(()))))
    }
}

/// Rejects every session.
pub struct Reject;

impl Authorizer for Reject {
    fn name(&self) -> &'static str {
        "reject"
    }

    fn authorize(&self, _session: &Session) -> Result<Option<Deauthorize>> {
        Ok(None)
    }
}

/// Permits sessions as long as the number of active sessions stays below
/// the configured maximum. The count is guarded by a mutex so concurrent
/// admissions can never overshoot the limit.
pub struct MaxSession {
    max_sessions: u64,
    current: Arc<Mutex<u64>>,
}

impl MaxSession {
    pub fn new(max_sessions: u64) -> Self {
        Self {
            max_sessions,
            current: Arc::new(Mutex::new(0)),
        }
    }

    /// Number of currently admitted sessions.
    pub fn active_sessions(&self) -> u64 {
        *self.current.lock().unwrap()
    }
}

impl Authorizer for MaxSession {
    fn name(&self) -> &'static str {
        "max_session"
    }

    fn authorize(&self, session: &Session) -> Result<Option<Deauthorize>> {
        let mut current = self.current.lock().unwrap();
        if *current + 1 > self.max_sessions {
            info!(
                max_session_count = self.max_sessions,
                current_session_count = *current,
                user = session.user(),
                remote_addr = %session.remote_addr(),
                session_id = session.id(),
                "session count exceeds max"
            );
            return Ok(None);
        }
        *current += 1;
        info!(
            user = session.user(),
            remote_addr = %session.remote_addr(),
            session_id = session.id(),
            active_session_count = *current,
            "session authorized"
        );

        let counter = Arc::clone(&self.current);
        let session_id = session.id().to_string();
        Ok(Some(Box::new(move || {
            let mut current = counter.lock().unwrap();
            *current = current.saturating_sub(1);
            info!(
                session_id,
                active_session_count = *current,
                "session deauthorized"
            );
            Ok(())
        })))
    }
}

/// Runs a list of sub-authorizers in order, collecting their
/// deauthorizers. Any denial or error unwinds the already granted ones in
/// reverse order; full success composes them into a single deauthorizer
/// that also unwinds in reverse and aggregates failures instead of
/// stopping at the first.
pub struct Chained {
    authorizers: Vec<Arc<dyn Authorizer>>,
}

impl Chained {
    pub fn new(authorizers: Vec<Arc<dyn Authorizer>>) -> Self {
        Self { authorizers }
    }
}

impl Authorizer for Chained {
    fn name(&self) -> &'static str {
        "chained"
    }

    fn authorize(&self, session: &Session) -> Result<Option<Deauthorize>> {
        let mut granted: Vec<(&'static str, Deauthorize)> = Vec::new();

        for authorizer in &self.authorizers {
            match authorizer.authorize(session) {
                Ok(Some(deauth)) => granted.push((authorizer.name(), deauth)),
                Ok(None) => {
                    unwind(granted, session.id());
                    return Ok(None);
                }
                Err(err) => {
                    error!(
                        authorizer = authorizer.name(),
                        user = session.user(),
                        remote_addr = %session.remote_addr(),
                        session_id = session.id(),
                        error = %err,
                        "error authorizing session"
                    );
                    let mut errors = vec![err];
                    errors.extend(unwind(granted, session.id()));
                    return Err(aggregate(errors));
                }
            }
        }

        info!(
            user = session.user(),
            remote_addr = %session.remote_addr(),
            session_id = session.id(),
            "session authorized"
        );
        let session_id = session.id().to_string();
        Ok(Some(Box::new(move || {
            let errors = unwind(granted, &session_id);
            if errors.is_empty() {
                Ok(())
            } else {
                Err(aggregate(errors))
            }
        })))
    }
}

/// Runs collected deauthorizers most-recent first, reporting every failure
/// rather than stopping at the first one.
fn unwind(granted: Vec<(&'static str, Deauthorize)>, session_id: &str) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for (name, deauth) in granted.into_iter().rev() {
        if let Err(err) = deauth() {
            error!(
                authorizer = name,
                session_id,
                error = %err,
                "error deauthorizing session"
            );
            errors.push(err.context(name));
        }
    }
    errors
}

fn aggregate(errors: Vec<anyhow::Error>) -> anyhow::Error {
    let combined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    anyhow!("{} authorization error(s): {}", errors.len(), combined)
}

/// Authorizer selection as written in config. `chained` nests its
/// sub-authorizers under `authorize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "authorizer", rename_all = "snake_case")]
pub enum AuthorizerConfig {
    Public,
    Reject,
    MaxSession { max_sessions: u64 },
    Chained { authorize: Vec<AuthorizerConfig> },
}

pub fn provision_authorizer(config: &AuthorizerConfig) -> Arc<dyn Authorizer> {
    match config {
        AuthorizerConfig::Public => Arc::new(Public),
        AuthorizerConfig::Reject => Arc::new(Reject),
        AuthorizerConfig::MaxSession { max_sessions } => Arc::new(MaxSession::new(*max_sessions)),
        AuthorizerConfig::Chained { authorize } => Arc::new(Chained::new(
            authorize.iter().map(provision_authorizer).collect(),
        )),
    }
}

/// Holds a deauthorizer and guarantees it runs exactly once, including
/// when the owning task panics.
pub struct DeauthGuard {
    deauth: Option<Deauthorize>,
    session_id: String,
}

impl DeauthGuard {
    pub fn new(deauth: Deauthorize, session_id: impl Into<String>) -> Self {
        Self {
            deauth: Some(deauth),
            session_id: session_id.into(),
        }
    }
}

impl Drop for DeauthGuard {
    fn drop(&mut self) {
        if let Some(deauth) = self.deauth.take() {
            if let Err(err) = deauth() {
                error!(
                    session_id = self.session_id,
                    error = %err,
                    "error deauthorizing session"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::testing;

    struct Scripted {
        tag: &'static str,
        grant: bool,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(tag: &'static str, grant: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                grant,
                fail: false,
                log: Arc::clone(log),
            })
        }

        fn failing(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                grant: false,
                fail: true,
                log: Arc::clone(log),
            })
        }
    }

    impl Authorizer for Scripted {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn authorize(&self, _session: &Session) -> Result<Option<Deauthorize>> {
            if self.fail {
                return Err(anyhow!("error authorizing {}", self.tag));
            }
            if !self.grant {
                self.log.lock().unwrap().push(format!("deny:{}", self.tag));
                return Ok(None);
            }
            self.log.lock().unwrap().push(format!("auth:{}", self.tag));
            let log = Arc::clone(&self.log);
            let tag = self.tag;
            Ok(Some(Box::new(move || {
                log.lock().unwrap().push(format!("deauth:{tag}"));
                Ok(())
            })))
        }
    }

    fn session() -> Session {
        testing::session(Account::new("tester"))
    }

    #[test]
    fn public_grants_and_reject_denies() {
        let session = session();
        assert!(Public.authorize(&session).unwrap().is_some());
        assert!(Reject.authorize(&session).unwrap().is_none());
    }

    #[test]
    fn max_session_enforces_limit_and_decrements() {
        let authorizer = MaxSession::new(1);
        let session = session();

        let deauth = authorizer.authorize(&session).unwrap().expect("first grant");
        assert_eq!(authorizer.active_sessions(), 1);
        assert!(authorizer.authorize(&session).unwrap().is_none());

        deauth().unwrap();
        assert_eq!(authorizer.active_sessions(), 0);
        assert!(authorizer.authorize(&session).unwrap().is_some());
    }

    #[test]
    fn max_session_holds_bound_under_concurrency() {
        let authorizer = Arc::new(MaxSession::new(4));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let authorizer = Arc::clone(&authorizer);
            handles.push(std::thread::spawn(move || {
                let session = testing::session(Account::new("load"));
                for _ in 0..50 {
                    if let Some(deauth) = authorizer.authorize(&session).unwrap() {
                        assert!(authorizer.active_sessions() <= 4);
                        deauth().unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(authorizer.active_sessions(), 0);
    }

    #[test]
    fn chained_success_composes_lifo_deauth() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chained = Chained::new(vec![
            Scripted::new("a", true, &log),
            Scripted::new("b", true, &log),
            Scripted::new("c", true, &log),
        ]);
        let session = session();

        let deauth = chained.authorize(&session).unwrap().expect("grant");
        deauth().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["auth:a", "auth:b", "auth:c", "deauth:c", "deauth:b", "deauth:a"]
        );
    }

    #[test]
    fn chained_denial_unwinds_earlier_grants() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chained = Chained::new(vec![
            Scripted::new("a", true, &log),
            Scripted::new("b", false, &log),
            Scripted::new("c", true, &log),
        ]);
        let session = session();

        assert!(chained.authorize(&session).unwrap().is_none());
        assert_eq!(*log.lock().unwrap(), vec!["auth:a", "deny:b", "deauth:a"]);
    }

    #[test]
    fn chained_error_stops_and_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chained = Chained::new(vec![
            Scripted::new("a", true, &log),
            Scripted::failing("b", &log),
            Scripted::new("c", true, &log),
        ]);
        let session = session();

        assert!(chained.authorize(&session).is_err());
        assert_eq!(*log.lock().unwrap(), vec!["auth:a", "deauth:a"]);
    }

    #[test]
    fn chained_rollback_restores_max_session_counter() {
        let max = Arc::new(MaxSession::new(10));
        let chained = Chained::new(vec![
            Arc::clone(&max) as Arc<dyn Authorizer>,
            Arc::new(Reject),
        ]);
        let session = session();

        assert_eq!(max.active_sessions(), 0);
        assert!(chained.authorize(&session).unwrap().is_none());
        assert_eq!(max.active_sessions(), 0);
    }

    #[test]
    fn guard_runs_deauth_exactly_once_even_on_panic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let deauth: Deauthorize = Box::new(move || {
            log_clone.lock().unwrap().push("deauth".to_string());
            Ok(())
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = DeauthGuard::new(deauth, "s1");
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["deauth"]);
    }
}
