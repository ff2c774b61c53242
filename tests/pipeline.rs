//! End-to-end pipeline tests.
//!
//! These drive the full in-process flow without sockets: frames go through
//! the gateway (authorizer -> registry -> publisher), land in the broker,
//! and come back out through a consumer worker's retry pipeline into the
//! session fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use relay_gateway::auth::AuthManager;
use relay_gateway::authorizer::{DestinationRules, FrameAuthorizer};
use relay_gateway::broker::Broker;
use relay_gateway::config::{
    AuthConfig, BrokerConfig, Config, DeadLetterConfig, RetryConfig, SessionConfig,
    ValidationConfig,
};
use relay_gateway::context::AppContext;
use relay_gateway::gateway;
use relay_gateway::handlers::connection::ClientConnection;
use relay_gateway::message::{Frame, ServerEvent};
use relay_gateway::payload::PayloadPipeline;
use relay_gateway::publisher::Publisher;
use relay_gateway::registry::SessionRegistry;
use relay_gateway::retry::{Outcome, RetryPipeline};

const SECRET: &str = "test_secret_key_for_testing_only_32bytes!";

fn test_config() -> Config {
    Config {
        port: 0,
        health_port: 0,
        rust_log: "info".to_string(),
        message_secret: SECRET.to_string(),
        auth: AuthConfig {
            jwt_secret: SECRET.to_string(),
            jwt_public_key: None,
            jwt_issuer: "relay-gateway".to_string(),
            access_token_ttl_hours: 1,
        },
        session: SessionConfig {
            max_sessions_per_principal: 5,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            multiplier: 2.0,
            max_backoff_ms: 10_000,
            fatal_classes: vec![
                "deserialization".to_string(),
                "invalid-argument".to_string(),
                "unsupported-operation".to_string(),
            ],
        },
        broker: BrokerConfig {
            exchange: "chat.topic".to_string(),
            general_queue: "chat.general".to_string(),
            private_queue: "chat.private".to_string(),
            general_pattern: "room.*".to_string(),
            private_pattern: "user.#".to_string(),
            dead_letter: DeadLetterConfig {
                exchange: "chat.dlx".to_string(),
                queue: "chat.dead".to_string(),
                routing_key: "chat.dead".to_string(),
            },
            message_ttl_ms: 86_400_000,
            prefetch_count: 250,
            concurrent_consumers: 3,
            max_concurrent_consumers: 10,
        },
        validation: ValidationConfig {
            max_message_len: 1000,
            denied_patterns: vec![
                "<script".to_string(),
                "javascript:".to_string(),
                "select".to_string(),
            ],
        },
    }
}

struct Harness {
    ctx: AppContext,
    auth: Arc<AuthManager>,
    broker: Broker,
}

async fn harness() -> Harness {
    let config = Arc::new(test_config());
    let (broker, _events) = Broker::new();
    broker.install_topology(&config.broker).await;

    let auth = Arc::new(AuthManager::new(&config.auth).unwrap());
    let registry = Arc::new(SessionRegistry::new(&config.session));
    let publisher = Arc::new(Publisher::new(broker.clone(), &config.broker.exchange));
    let authorizer = Arc::new(FrameAuthorizer::new(
        auth.clone(),
        DestinationRules::new(),
        PayloadPipeline::new(&config.validation, &config.message_secret),
    ));

    let ctx = AppContext::new(config, registry, authorizer, publisher, broker.clone());
    Harness { ctx, auth, broker }
}

fn frame(command: &str, destination: Option<&str>, payload: Option<&str>) -> Frame {
    Frame {
        command: command.to_string(),
        destination: destination.map(|d| d.to_string()),
        headers: HashMap::new(),
        payload: payload.map(|p| p.to_string()),
    }
}

fn connect_frame(token: &str) -> Frame {
    let mut f = frame("CONNECT", None, None);
    f.headers.insert(
        "Authorization".to_string(),
        format!("Bearer {}", token),
    );
    f
}

/// Connect a client and drain the Connected event
async fn connect_client(
    harness: &Harness,
    name: &str,
    roles: &[&str],
) -> (ClientConnection, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = ClientConnection::new(tx);
    let token = harness.auth.create_token(name, roles).unwrap();

    let keep_open = gateway::handle_frame(&mut conn, &harness.ctx, connect_frame(&token)).await;
    assert!(keep_open);

    match rx.recv().await.unwrap() {
        ServerEvent::Connected { principal, .. } => assert_eq!(principal, name),
        other => panic!("expected connected event, got {:?}", other),
    }
    (conn, rx)
}

async fn subscribe(
    harness: &Harness,
    conn: &mut ClientConnection,
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    destination: &str,
) {
    let keep_open =
        gateway::handle_frame(conn, &harness.ctx, frame("SUBSCRIBE", Some(destination), None))
            .await;
    assert!(keep_open);
    match rx.recv().await.unwrap() {
        ServerEvent::Subscribed { destination: d } => assert_eq!(d, destination),
        other => panic!("expected subscribed event, got {:?}", other),
    }
}

/// Pull one delivery off the work queues and run it through the pipeline,
/// the way a consumer worker does.
async fn consume_one(harness: &Harness) -> Outcome {
    let pipeline = RetryPipeline::new(
        &harness.ctx.config.retry,
        harness.broker.clone(),
        &harness.ctx.config.broker.dead_letter.exchange,
        &harness.ctx.config.broker.dead_letter.routing_key,
    );
    let consumer = harness
        .broker
        .consumer(
            vec![
                harness.ctx.config.broker.general_queue.clone(),
                harness.ctx.config.broker.private_queue.clone(),
            ],
            harness.ctx.config.broker.prefetch_count,
        )
        .await;

    let delivery = consumer.recv().await;
    let ctx = harness.ctx.clone();
    let outcome = pipeline
        .process(&delivery, |d| {
            let ctx = ctx.clone();
            async move { gateway::dispatch_delivery(&ctx, d).await }
        })
        .await;
    consumer.ack(delivery.tag).await;
    outcome
}

#[tokio::test]
async fn room_broadcast_reaches_all_subscribers() {
    let harness = harness().await;

    let (mut alice, mut alice_rx) = connect_client(&harness, "alice", &[]).await;
    let (mut bob, mut bob_rx) = connect_client(&harness, "bob", &[]).await;
    let (mut carol, mut carol_rx) = connect_client(&harness, "carol", &[]).await;

    subscribe(&harness, &mut alice, &mut alice_rx, "/topic/public/general").await;
    subscribe(&harness, &mut bob, &mut bob_rx, "/topic/public/general").await;
    subscribe(&harness, &mut carol, &mut carol_rx, "/topic/public/other").await;

    let keep_open = gateway::handle_frame(
        &mut alice,
        &harness.ctx,
        frame("SEND", Some("/topic/public/general"), Some("hello room")),
    )
    .await;
    assert!(keep_open);
    match alice_rx.recv().await.unwrap() {
        ServerEvent::Receipt { status, .. } => assert_eq!(status, "accepted"),
        other => panic!("expected receipt, got {:?}", other),
    }

    let outcome = consume_one(&harness).await;
    assert!(matches!(outcome, Outcome::Success { attempts: 1 }));

    for rx in [&mut alice_rx, &mut bob_rx] {
        match rx.recv().await.unwrap() {
            ServerEvent::Message {
                sender, payload, destination, ..
            } => {
                assert_eq!(sender, "alice");
                assert_eq!(destination, "/topic/public/general");
                let plain = harness
                    .ctx
                    .authorizer
                    .payload()
                    .cipher()
                    .decrypt(&payload)
                    .unwrap();
                assert_eq!(String::from_utf8(plain).unwrap(), "hello room");
            }
            other => panic!("expected message, got {:?}", other),
        }
    }
    assert!(carol_rx.try_recv().is_err(), "carol subscribed elsewhere");
}

#[tokio::test]
async fn private_message_reaches_only_the_target_principal() {
    let harness = harness().await;

    let (mut alice, mut alice_rx) = connect_client(&harness, "alice", &[]).await;
    let (_bob, mut bob_rx) = connect_client(&harness, "bob", &[]).await;

    let keep_open = gateway::handle_frame(
        &mut alice,
        &harness.ctx,
        frame("SEND", Some("/user/alice/queue/messages"), Some("note")),
    )
    .await;
    assert!(keep_open);
    match alice_rx.recv().await.unwrap() {
        ServerEvent::Receipt { status, .. } => assert_eq!(status, "accepted"),
        other => panic!("expected receipt, got {:?}", other),
    }

    let outcome = consume_one(&harness).await;
    assert!(matches!(outcome, Outcome::Success { .. }));

    match alice_rx.recv().await.unwrap() {
        ServerEvent::Message { destination, .. } => {
            assert_eq!(destination, "/user/alice/queue/messages");
        }
        other => panic!("expected message, got {:?}", other),
    }
    assert!(bob_rx.try_recv().is_err());
}

#[tokio::test]
async fn failed_connect_never_creates_a_session() {
    let harness = harness().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = ClientConnection::new(tx);

    let keep_open =
        gateway::handle_frame(&mut conn, &harness.ctx, connect_frame("not-a-token")).await;
    assert!(!keep_open, "a refused connection closes");

    match rx.recv().await.unwrap() {
        ServerEvent::Error { code, .. } => assert_eq!(code, "AUTH_FAILED"),
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(harness.ctx.registry.is_empty().await);
}

#[tokio::test]
async fn rejected_admin_send_leaves_the_session_usable() {
    let harness = harness().await;
    let (mut bob, mut bob_rx) = connect_client(&harness, "bob", &[]).await;

    let keep_open = gateway::handle_frame(
        &mut bob,
        &harness.ctx,
        frame("SEND", Some("/topic/admin/x"), Some("hi")),
    )
    .await;
    assert!(keep_open, "authorization errors keep the connection open");
    match bob_rx.recv().await.unwrap() {
        ServerEvent::Error { code, .. } => assert_eq!(code, "ACCESS_DENIED"),
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(harness.ctx.registry.contains(bob.session_id()).await);

    // a subsequent valid frame still goes through
    let keep_open = gateway::handle_frame(
        &mut bob,
        &harness.ctx,
        frame("SEND", Some("/topic/public/general"), Some("hi")),
    )
    .await;
    assert!(keep_open);
    match bob_rx.recv().await.unwrap() {
        ServerEvent::Receipt { status, .. } => assert_eq!(status, "accepted"),
        other => panic!("expected receipt, got {:?}", other),
    }
}

#[tokio::test]
async fn dead_transport_is_isolated_from_the_fanout() {
    let harness = harness().await;

    let (mut alice, mut alice_rx) = connect_client(&harness, "alice", &[]).await;
    let (mut bob, bob_rx) = connect_client(&harness, "bob", &[]).await;

    subscribe(&harness, &mut alice, &mut alice_rx, "/topic/public/general").await;
    {
        // subscribe bob, then kill his transport
        let mut bob_rx = bob_rx;
        subscribe(&harness, &mut bob, &mut bob_rx, "/topic/public/general").await;
    }

    let keep_open = gateway::handle_frame(
        &mut alice,
        &harness.ctx,
        frame("SEND", Some("/topic/public/general"), Some("still here")),
    )
    .await;
    assert!(keep_open);
    let _receipt = alice_rx.recv().await.unwrap();

    let outcome = consume_one(&harness).await;
    assert!(matches!(outcome, Outcome::Success { .. }));

    // alice still got the message, bob's dead session was removed
    match alice_rx.recv().await.unwrap() {
        ServerEvent::Message { .. } => {}
        other => panic!("expected message, got {:?}", other),
    }
    assert!(!harness.ctx.registry.contains(bob.session_id()).await);
    assert!(harness.ctx.registry.contains(alice.session_id()).await);
}

#[tokio::test]
async fn disconnect_removes_the_session_and_closes() {
    let harness = harness().await;
    let (mut alice, _alice_rx) = connect_client(&harness, "alice", &[]).await;

    let keep_open =
        gateway::handle_frame(&mut alice, &harness.ctx, frame("DISCONNECT", None, None)).await;
    assert!(!keep_open);
    assert!(harness.ctx.registry.is_empty().await);
}

#[tokio::test]
async fn corrupted_broker_payload_is_dead_lettered_fatally() {
    let harness = harness().await;

    // bypass the publisher and plant a corrupt payload on the work queue
    harness
        .broker
        .publish(relay_gateway::broker::Publication {
            exchange: "chat.topic".to_string(),
            routing_key: "room.general".to_string(),
            correlation_id: "corrupt-1".to_string(),
            payload: b"not an envelope".to_vec(),
            delivery_mode: relay_gateway::message::DeliveryMode::Persistent,
            mandatory: true,
        })
        .await
        .unwrap();

    let outcome = consume_one(&harness).await;
    assert!(matches!(outcome, Outcome::DeadLettered { attempts: 1, .. }));

    assert_eq!(
        harness.broker.queue_depth("chat.dead").await.unwrap(),
        1,
        "exactly one dead-letter record"
    );
}

#[tokio::test]
async fn sixth_session_for_a_principal_evicts_the_oldest() {
    let harness = harness().await;

    let mut first_rx = None;
    for i in 0..6 {
        let (conn, rx) = connect_client(&harness, "alice", &[]).await;
        if i == 0 {
            first_rx = Some((conn, rx));
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert_eq!(harness.ctx.registry.count_sessions("alice").await, 5);

    let (conn, mut rx) = first_rx.unwrap();
    assert!(!harness.ctx.registry.contains(conn.session_id()).await);
    match rx.recv().await.unwrap() {
        ServerEvent::Close { code, .. } => assert_eq!(code, "POLICY_VIOLATION"),
        other => panic!("expected close event, got {:?}", other),
    }
}
