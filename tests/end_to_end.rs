//! Full-stack tests over real TCP: server accept loop, handshake, login,
//! token-based session restoration after a severed connection, and event
//! push on a promoted connection.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chatwire::client::Client;
use chatwire::config::{ClientConfig, ServerConfig};
use chatwire::core::AuthToken;
use chatwire::server::{AuthTokenStore, ConnectionRegistry, Dispatcher, Server};
use chatwire::ProtocolError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct TestServer {
    address: String,
    registry: Arc<ConnectionRegistry>,
    auth_replays: Arc<AtomicUsize>,
    // Dropping this ends the accept loop.
    _shutdown_tx: mpsc::Sender<()>,
}

/// Chat-style dispatcher: password login minting tokens, token replay via
/// `auth`, a trivial `ping`, `whoami`, and a `subscribe` request that turns
/// the connection into a push channel.
async fn start_server() -> TestServer {
    let store = Arc::new(AuthTokenStore::new());
    let auth_replays = Arc::new(AtomicUsize::new(0));

    let login_store = store.clone();
    let auth_store = store.clone();
    let replays = auth_replays.clone();

    let dispatcher = Dispatcher::new()
        .register("login", move |ctl, req| {
            let user = req["user"].as_str().unwrap_or_default();
            if user.is_empty() || req["password"].as_str() != Some("secret") {
                return Err(ProtocolError::Remote {
                    code: "login-failed".into(),
                    message: "bad credentials".into(),
                });
            }
            let token = login_store.login(user);
            ctl.authorize(user);
            Ok(json!({"user": user, "token": token.to_hex()}))
        })
        .register("auth", move |ctl, req| {
            let token = req["token"]
                .as_str()
                .ok_or_else(|| ProtocolError::MalformedRequest("missing token".into()))
                .and_then(AuthToken::from_hex)?;
            match auth_store.user_for(&token) {
                Some(user) => {
                    replays.fetch_add(1, Ordering::SeqCst);
                    ctl.authorize(user.clone());
                    Ok(json!({"user": user}))
                }
                None => Err(ProtocolError::Remote {
                    code: "auth-failed".into(),
                    message: "unknown token".into(),
                }),
            }
        })
        .register("ping", |_ctl, _req| Ok(json!({"pong": true})))
        .register("whoami", |ctl, _req| Ok(json!({"user": ctl.user()})))
        .register("subscribe", |ctl, _req| {
            if !ctl.is_authorized() {
                return Err(ProtocolError::Remote {
                    code: "access-denied".into(),
                    message: "subscribe requires authentication".into(),
                });
            }
            ctl.stop_listening();
            Ok(json!({"subscribed": true}))
        });

    let config = ServerConfig {
        address: "127.0.0.1:0".into(),
        max_connections: 16,
        shutdown_timeout: Duration::from_secs(1),
    };
    let server = Server::bind(config, dispatcher).await.expect("bind");
    let address = server.local_addr().expect("local addr").to_string();
    let registry = server.registry();

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(server.run_with_shutdown(shutdown_rx));

    TestServer {
        address,
        registry,
        auth_replays,
        _shutdown_tx: shutdown_tx,
    }
}

fn client_for(server: &TestServer) -> Client {
    Client::new(ClientConfig {
        address: server.address.clone(),
        connect_timeout: Duration::from_secs(5),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn login_and_request_roundtrip() {
    let server = start_server().await;
    let client = client_for(&server);

    let response = client.login("ada", "secret").await.expect("login");
    assert_eq!(response["user"], "ada");
    assert!(client.stored_token().is_some());

    let response = client.request(&json!({"request": "ping"})).await.expect("ping");
    assert_eq!(response["pong"], true);

    let response = client
        .request(&json!({"request": "whoami"}))
        .await
        .expect("whoami");
    assert_eq!(response["user"], "ada");
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_credentials_leave_no_token() {
    let server = start_server().await;
    let client = client_for(&server);

    let err = client.login("ada", "wrong").await.expect_err("must fail");
    match err {
        ProtocolError::Remote { code, .. } => assert_eq!(code, "login-failed"),
        other => panic!("expected Remote, got {other:?}"),
    }
    assert!(client.stored_token().is_none());

    // The connection survived the rejected login.
    let response = client.request(&json!({"request": "ping"})).await.expect("ping");
    assert_eq!(response["pong"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn severed_session_restores_with_stored_token() {
    let server = start_server().await;
    let client = client_for(&server);

    client.login("ada", "secret").await.expect("login");
    // Registration happens just after the login response is written.
    for _ in 0..100 {
        if !server.registry.connections_for("ada").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.registry.connections_for("ada").len(), 1);

    // Kill the server side of the session.
    assert_eq!(server.registry.close_user("ada").await, 1);
    for _ in 0..100 {
        if server.registry.connections_for("ada").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.registry.connections_for("ada").is_empty());

    // The next request reconnects, replays the token, and retries, all
    // invisible to the caller.
    let response = client
        .request(&json!({"request": "whoami"}))
        .await
        .expect("restored");
    assert_eq!(response["user"], "ada");
    assert_eq!(server.auth_replays.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_token_is_a_startup_error() {
    let server = start_server().await;
    let client = client_for(&server);

    client.login("ada", "secret").await.expect("login");
    // A later login elsewhere invalidates this client's token.
    let other = client_for(&server);
    other.login("ada", "secret").await.expect("second login");

    for _ in 0..100 {
        if server.registry.connections_for("ada").len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.registry.close_user("ada").await;
    for _ in 0..100 {
        if server.registry.connections_for("ada").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = client
        .request(&json!({"request": "ping"}))
        .await
        .expect_err("stale token must be rejected");
    assert!(matches!(err, ProtocolError::ConnectionStartup(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribed_connection_receives_pushes() {
    let server = start_server().await;
    let client = client_for(&server);
    client.login("ada", "secret").await.expect("login");

    let subscriber = client
        .subscribe_events(&json!({"request": "subscribe"}))
        .await
        .expect("subscribe");

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber.subscribe(move |name, payload| {
        let _ = tx.send((name.to_string(), payload.clone()));
    });

    // Promotion races with our return from subscribe_events; push until the
    // registry has the event connection.
    let mut delivered = 0;
    for _ in 0..100 {
        delivered = server
            .registry
            .push_event("ada", "message-posted", &json!({"thread": "t1"}))
            .await;
        if delivered > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, 1);

    let (name, payload) = rx.recv().await.expect("event");
    assert_eq!(name, "message-posted");
    assert_eq!(payload["thread"], "t1");
    assert!(subscriber.is_active());

    // Pushes to other users never reach this subscriber.
    assert_eq!(
        server
            .registry
            .push_event("bob", "message-posted", &Value::Null)
            .await,
        0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribed_push_request_is_rejected() {
    let server = start_server().await;
    let client = client_for(&server);

    // Not logged in: the dedicated push connection carries no token and the
    // subscribe handler refuses it.
    let err = client
        .subscribe_events(&json!({"request": "subscribe"}))
        .await
        .expect_err("must be refused");
    match err {
        ProtocolError::Remote { code, .. } => assert_eq!(code, "access-denied"),
        other => panic!("expected Remote, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_server_is_a_startup_error() {
    // Bind-then-drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let client = Client::new(ClientConfig {
        address,
        connect_timeout: Duration::from_millis(500),
    });
    let err = client
        .request(&json!({"request": "ping"}))
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, ProtocolError::ConnectionStartup(_)));
}
