use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_tungstenite::accept_async;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming as IncomingBody, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

pub mod auth;
pub mod authorizer;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod message;
pub mod metrics;
pub mod payload;
pub mod publisher;
pub mod registry;
pub mod retry;

use auth::AuthManager;
use authorizer::{DestinationRules, FrameAuthorizer};
use broker::Broker;
use config::Config;
use consumer::ConsumerPool;
use context::AppContext;
use handlers::handle_websocket;
use payload::PayloadPipeline;
use publisher::Publisher;
use registry::SessionRegistry;
use retry::RetryPipeline;

type HttpResult = Result<Response<Full<Bytes>>, Infallible>;

async fn http_handler(req: Request<IncomingBody>, broker: Broker) -> HttpResult {
    let response = match req.uri().path() {
        "/health" => {
            if broker.queue_count().await > 0 {
                Response::new(Full::new(Bytes::from("OK")))
            } else {
                let mut res = Response::new(Full::new(Bytes::from("Service Unavailable")));
                *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                res
            }
        }
        "/metrics" => match metrics::gather_metrics() {
            Ok(metrics_data) => {
                let mut res = Response::new(Full::new(Bytes::from(metrics_data)));
                res.headers_mut()
                    .insert("Content-Type", "text/plain; version=0.0.4".parse().unwrap());
                res
            }
            Err(e) => {
                tracing::error!("Failed to gather metrics: {}", e);
                let mut res = Response::new(Full::new(Bytes::from("Internal Server Error")));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        },
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::from("Not Found")));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}

pub async fn run_http_server(health_port: u16, broker: Broker) -> Result<()> {
    let http_addr = format!("0.0.0.0:{}", health_port);
    let listener = TcpListener::bind(&http_addr).await?;
    tracing::info!("HTTP server listening on http://{}", http_addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let broker = broker.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| http_handler(req, broker.clone()));

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Error serving HTTP connection: {:?}", err);
            }
        });
    }
}

pub async fn run_websocket_server(app_context: AppContext, listener: TcpListener) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to accept socket: {}", e);
                continue;
            }
        };

        let ctx = app_context.clone();

        tokio::spawn(async move {
            match accept_async(socket).await {
                Ok(ws_stream) => handle_websocket(ws_stream, addr, ctx).await,
                Err(e) => tracing::warn!("WebSocket upgrade failed for {}: {}", addr, e),
            }
        });
    }
}

/// Idle-session sweep on a dedicated timer, independent of connection traffic
fn spawn_session_sweeper(registry: Arc<SessionRegistry>, config: &config::SessionConfig) {
    let interval = Duration::from_secs(config.sweep_interval_secs);
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            registry.sweep_idle(tokio::time::Instant::now(), idle_timeout).await;
        }
    });
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);

    // Broker topology + asynchronous publish outcomes
    let (broker, broker_events) = Broker::new();
    broker.install_topology(&config.broker).await;
    Publisher::spawn_outcome_listeners(broker_events);

    let auth_manager = Arc::new(AuthManager::new(&config.auth)?);
    let registry = Arc::new(SessionRegistry::new(&config.session));
    let publisher = Arc::new(Publisher::new(broker.clone(), &config.broker.exchange));
    let authorizer = Arc::new(FrameAuthorizer::new(
        auth_manager,
        DestinationRules::new(),
        PayloadPipeline::new(&config.validation, &config.message_secret),
    ));

    let app_context = AppContext::new(
        config.clone(),
        registry.clone(),
        authorizer,
        publisher,
        broker.clone(),
    );

    spawn_session_sweeper(registry, &config.session);

    let pipeline = Arc::new(RetryPipeline::new(
        &config.retry,
        broker.clone(),
        &config.broker.dead_letter.exchange,
        &config.broker.dead_letter.routing_key,
    ));
    let consumer_pool = ConsumerPool::spawn(broker.clone(), pipeline, app_context.clone()).await;
    tracing::info!(workers = consumer_pool.worker_count(), "Consumer pool started");

    // WebSocket listener
    let bind_address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Relay gateway listening on {} (WebSocket)", bind_address);

    let websocket_server = run_websocket_server(app_context, listener);
    let http_server = run_http_server(config.health_port, broker);

    tokio::select! {
        _ = websocket_server => {
            tracing::info!("WebSocket server shut down.");
        },
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server failed: {}", e);
            }
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Shutdown signal received. Shutting down...");
            consumer_pool.shutdown().await;
        }
    }

    Ok(())
}
