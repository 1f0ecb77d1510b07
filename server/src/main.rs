use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use arena_socket_server::cluster::{self, BusPublisher, Fanout, Subscriber};
use arena_socket_server::config::{generate_config_template, Config};
use arena_socket_server::hub::Hub;
use arena_socket_server::presence::PresenceManager;
use arena_socket_server::state::AppState;
use arena_socket_server::{ingress, routes};

/// Budget for draining open connections after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let default_filter = if config.is_development() {
        "arena_socket_server=debug"
    } else {
        "arena_socket_server=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.parse().expect("valid default filter"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter).init();
    }

    tracing::info!(
        port = config.port,
        env = %config.env,
        version = env!("CARGO_PKG_VERSION"),
        "starting socket service"
    );

    if config.jwt_secret.is_empty() {
        tracing::error!("ARENA_JWT_SECRET is required");
        return Err("ARENA_JWT_SECRET is required".into());
    }

    let instance_id = cluster::generate_instance_id();

    // Shared store: commands/publishing over one managed connection,
    // the subscriber dials its own.
    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis_conn = match ConnectionManager::new(redis_client.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to redis");
            return Err(e.into());
        }
    };

    // Hub with its serial register/unregister task
    let (interest_tx, interest_rx) = mpsc::unbounded_channel();
    let (hub, hub_commands) = Hub::new(Some(interest_tx));
    tokio::spawn(Arc::clone(&hub).run(hub_commands));

    // Cross-instance plane
    let publisher = BusPublisher::new(redis_conn.clone(), instance_id.clone());
    let subscriber = Subscriber::new(redis_client, Arc::clone(&hub), instance_id.clone());
    let subscriber_handle = tokio::spawn(subscriber.run(interest_rx));

    let presence = PresenceManager::new(redis_conn, instance_id.clone());
    let fanout = Fanout::new(Arc::clone(&hub), Some(publisher));

    // Event bus ingress
    let consumer_handles = match ingress::spawn_consumers(&config, fanout) {
        Ok(handles) => handles,
        Err(e) => {
            tracing::error!(error = %e, "failed to start event bus consumers");
            return Err(e.into());
        }
    };

    let state = AppState {
        hub: Arc::clone(&hub),
        presence: Some(presence),
        jwt_secret: config.jwt_secret.clone(),
        instance_id: instance_id.clone(),
        ws_path: config.ws_path.clone(),
    };

    if config.metrics_enabled {
        let metrics_addr = format!("{}:{}", config.bind_address, config.metrics_port);
        let metrics_hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/metrics",
                axum::routing::get(move || {
                    let hub = Arc::clone(&metrics_hub);
                    async move { axum::Json(hub.stats()) }
                }),
            );
            match TcpListener::bind(&metrics_addr).await {
                Ok(listener) => {
                    tracing::info!(addr = %metrics_addr, "metrics server started");
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!(error = %e, "metrics server error");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to bind metrics port"),
            }
        });
    }

    let app = routes::build_router(state);
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, instance_id = %instance_id, "websocket server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in &consumer_handles {
        handle.abort();
    }
    subscriber_handle.abort();
    tracing::info!("server stopped gracefully");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, then arm a watchdog that force-exits if
/// draining open connections exceeds the grace budget.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining connections");

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::warn!("graceful shutdown timed out, exiting");
        std::process::exit(0);
    });
}
