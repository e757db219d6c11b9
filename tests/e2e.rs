//! End-to-end tests
//!
//! Each test provisions a real app on an ephemeral port and drives it
//! with the russh-based test client: authentication flows, authorization
//! limits, actor routing, and subsystem dispatch over actual SSH
//! connections.

use std::time::Duration;

use anyhow::Result;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use serde_json::json;

use gangway::app::App;
use gangway::authn::static_users::hash_password;
use gangway::config::ConfigFile;
use gangway::testing::SshTestClient;

const DRAIN: Duration = Duration::from_secs(5);
// keep the KDF cheap in tests
const ROUNDS: u32 = 64;

// ============================================================================
// Helpers
// ============================================================================

struct TestKeys {
    _dir: tempfile::TempDir,
    host_key_path: String,
    client_key: PrivateKey,
    client_key_line: String,
}

fn test_keys() -> Result<TestKeys> {
    let dir = tempfile::tempdir()?;
    let host_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
    let host_key_path = dir.path().join("host_key");
    std::fs::write(&host_key_path, host_key.to_openssh(LineEnding::LF)?.as_bytes())?;

    let client_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
    let client_key_line = client_key.public_key().to_openssh()?;
    Ok(TestKeys {
        host_key_path: host_key_path.to_string_lossy().to_string(),
        _dir: dir,
        client_key,
        client_key_line,
    })
}

/// Provisions and starts an app from a server-config value, returning the
/// app and the address of `srv0`.
async fn start_server(server: serde_json::Value) -> Result<(App, String)> {
    let config: ConfigFile =
        serde_json::from_value(json!({"ssh": {"grace_period": 1, "servers": {"srv0": server}}}))?;
    let mut app = App::provision(&config.ssh)?;
    app.start().await?;
    let addr = app.bound_addrs("srv0")[0].to_string();
    Ok((app, addr))
}

fn pubkey_config(keys: &TestKeys, username: &str) -> serde_json::Value {
    json!({
        "loader": "provided",
        "signer": {"module": "file", "keys": [{"source": keys.host_key_path}]},
        "authentication": {
            "public_key": {"providers": [
                {"module": "static", "users": [
                    {"username": username, "keys": [keys.client_key_line]}
                ]}
            ]}
        }
    })
}

// ============================================================================
// Scenario: public authorization + static response
// ============================================================================

#[tokio::test]
async fn public_authorization_serves_static_response() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "authorize": {"authorizer": "public"},
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": [{
            "act": {"action": "static_response", "response": "hello"},
            "final": true
        }]
    }))
    .await?;

    let mut client = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let result = client.exec("anything", DRAIN).await?;
    assert_eq!(result.output, b"hello\n");
    assert_eq!(result.exit_status, Some(0));
    client.close().await?;

    app.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_client_key_is_rejected() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": [{"act": {"action": "static_response", "response": "hello"}}]
    }))
    .await?;

    let stranger = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
    let result = SshTestClient::connect(&addr, "tester", stranger).await;
    assert!(result.is_err(), "stranger key must not authenticate");

    app.stop().await?;
    Ok(())
}

// ============================================================================
// Scenario: reject authorizer
// ============================================================================

#[tokio::test]
async fn rejected_session_runs_no_actors() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "authorize": {"authorizer": "reject"},
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": [{"act": {"action": "static_response", "response": "hello"}}]
    }))
    .await?;

    let mut client = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let result = client.exec("anything", Duration::from_secs(2)).await?;
    assert!(result.output.is_empty(), "no actor output for rejected session");
    assert_eq!(result.exit_status, None);

    app.stop().await?;
    Ok(())
}

// ============================================================================
// Scenario: max_session admits one, denies the second, recovers
// ============================================================================

#[tokio::test]
async fn max_session_limits_concurrent_sessions() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "authorize": {"authorizer": "max_session", "max_sessions": 1},
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": [
            {"act": {"action": "static_response", "response": "welcome"}},
            {"act": {"action": "shell", "force_command": "sleep 1"}, "final": true}
        ]
    }))
    .await?;

    // first client occupies the only slot for ~1s
    let first_addr = addr.clone();
    let first_key = keys.client_key.clone();
    let first = tokio::spawn(async move {
        let mut client = SshTestClient::connect(&first_addr, "tester", first_key).await?;
        client.exec("anything", DRAIN).await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;

    // second client authenticates fine but is not admitted
    let mut second = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let denied = second.exec("anything", Duration::from_secs(2)).await?;
    assert!(denied.output.is_empty(), "denied session saw actor output");
    assert_eq!(denied.exit_status, None);

    let admitted = first.await??;
    assert_eq!(admitted.output, b"welcome\n");
    assert_eq!(admitted.exit_status, Some(0));

    // slot is free again
    let mut third = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let result = third.exec("anything", DRAIN).await?;
    assert_eq!(result.output, b"welcome\n");
    assert_eq!(result.exit_status, Some(0));

    app.stop().await?;
    Ok(())
}

// ============================================================================
// Scenario: allow/deny precedence on the password flow
// ============================================================================

#[tokio::test]
async fn deny_users_beats_allow_users() -> Result<()> {
    let keys = test_keys()?;
    let salt_b64 = "c2FsdA=="; // "salt"
    let alice_hash = hash_password("alice-pw", b"salt", ROUNDS);
    let bob_hash = hash_password("bob-pw", b"salt", ROUNDS);

    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "configs": [{"config": {
            "loader": "provided",
            "signer": {"module": "file", "keys": [{"source": keys.host_key_path}]},
            "authentication": {
                "deny_users": ["alice"],
                "allow_users": ["alice", "bob"],
                "username_password": {"providers": [
                    {"module": "static", "rounds": ROUNDS, "accounts": [
                        {"name": "alice", "password": alice_hash, "salt": salt_b64},
                        {"name": "bob", "password": bob_hash, "salt": salt_b64}
                    ]}
                ]}
            }
        }}],
        "actors": [{
            "act": {"action": "static_response", "response": "shell time"},
            "final": true
        }]
    }))
    .await?;

    // denied even with the correct password
    let alice = SshTestClient::connect_with_password(&addr, "alice", "alice-pw").await;
    assert!(alice.is_err(), "denied user must not authenticate");

    let mut bob = SshTestClient::connect_with_password(&addr, "bob", "bob-pw").await?;
    let result = bob.exec("anything", DRAIN).await?;
    assert_eq!(result.output, b"shell time\n");
    assert_eq!(result.exit_status, Some(0));

    app.stop().await?;
    Ok(())
}

// ============================================================================
// Scenario: wildcard extension matcher routes actors
// ============================================================================

#[tokio::test]
async fn extension_matcher_routes_on_pubkey_fingerprint() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": [
            {
                // never matches: no such extension value on this session
                "match": [{"extension": {"permit-pty": ["denied"]}}],
                "act": {"action": "static_response", "response": "wrong"}
            },
            {
                // the static key provider records pubkey-fp on every auth
                "match": [{"extension": {"pubkey-fp": ["*"]}}],
                "act": {"action": "static_response", "response": "right"},
                "final": true
            }
        ]
    }))
    .await?;

    let mut client = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let result = client.exec("anything", DRAIN).await?;
    assert_eq!(result.output, b"right\n");
    assert_eq!(result.exit_status, Some(0));

    app.stop().await?;
    Ok(())
}

// ============================================================================
// Scenario: shell actor runs the client's command
// ============================================================================

#[tokio::test]
async fn shell_actor_executes_commands_with_exit_codes() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": [{"act": {"action": "shell"}, "final": true}]
    }))
    .await?;

    let mut client = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let ok = client.exec("echo from-the-shell", DRAIN).await?;
    assert_eq!(ok.output, b"from-the-shell\n");
    assert_eq!(ok.exit_status, Some(0));

    let mut failing = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let failed = failing.exec("false", DRAIN).await?;
    assert_eq!(failed.exit_status, Some(1));

    app.stop().await?;
    Ok(())
}

// ============================================================================
// Scenario: subsystem dispatch
// ============================================================================

#[tokio::test]
async fn echo_subsystem_round_trips() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "subsystems": {"echo": {"module": "echo"}},
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": []
    }))
    .await?;

    let mut client = SshTestClient::connect(&addr, "tester", keys.client_key.clone()).await?;
    let echoed = client
        .subsystem("echo", b"ping over ssh", b"ping over ssh".len(), DRAIN)
        .await?;
    assert_eq!(echoed, b"ping over ssh");

    app.stop().await?;
    Ok(())
}

// ============================================================================
// Scenario: graceful shutdown under load
// ============================================================================

#[tokio::test]
async fn stop_force_closes_after_grace_period() -> Result<()> {
    let keys = test_keys()?;
    let (mut app, addr) = start_server(json!({
        "address": "127.0.0.1:0",
        "configs": [{"config": pubkey_config(&keys, "tester")}],
        "actors": [{"act": {"action": "shell", "force_command": "sleep 30"}, "final": true}]
    }))
    .await?;

    // park a session on the long-running shell
    let holder_addr = addr.clone();
    let holder_key = keys.client_key.clone();
    let holder = tokio::spawn(async move {
        let mut client = SshTestClient::connect(&holder_addr, "tester", holder_key).await?;
        client.exec("anything", Duration::from_secs(10)).await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(app.active_sessions() > 0);

    let started = tokio::time::Instant::now();
    app.stop().await?;
    // one second of grace, not thirty of sleep
    assert!(started.elapsed() < Duration::from_secs(5));

    holder.abort();
    Ok(())
}
