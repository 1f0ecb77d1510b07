use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Resolved runtime configuration.
///
/// Layered precedence: built-in defaults < TOML file < env vars (ARENA_*)
/// < CLI args. Only flags the user actually passed occupy the CLI layer
/// (see `CliOverrides`); everything else falls through.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_address: String,
    /// Runtime environment: "development" or "production"
    pub env: String,
    /// Path to TOML config file
    pub config: String,
    /// Enable structured JSON logging (for Docker/production)
    pub json_logs: bool,
    /// Output a commented TOML config template and exit
    pub generate_config: bool,
    /// HMAC secret for validating client JWTs (required)
    pub jwt_secret: String,
    /// WebSocket endpoint path
    pub ws_path: String,
    /// Redis connection URL (presence store and cluster bus)
    pub redis_url: String,
    /// Kafka bootstrap brokers, comma separated
    pub kafka_brokers: String,
    /// Kafka consumer group id
    pub kafka_consumer_group: String,
    /// Event topics to consume, comma separated
    pub kafka_topics: String,
    /// Serve registry stats on a separate metrics port
    pub metrics_enabled: bool,
    /// Metrics port
    pub metrics_port: u16,
}

/// Command-line flags, every value optional so that only flags actually
/// supplied (or read by clap from their ARENA_* vars) are serialized into
/// the highest-precedence layer. An unset flag is absent from the merge
/// and leaves the TOML/env/default value intact. Flag-style booleans can
/// only assert `true`; left unset they don't override a TOML `true`.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "arena-socket-server", version, about = "Arena real-time socket service")]
struct CliOverrides {
    /// Port to listen on
    #[arg(long, env = "ARENA_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "ARENA_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_address: Option<String>,

    /// Runtime environment: "development" or "production"
    #[arg(long, env = "ARENA_ENV")]
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./arena-socket.toml")]
    #[serde(skip)]
    config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "ARENA_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    generate_config: bool,

    /// HMAC secret for validating client JWTs (required)
    #[arg(long, env = "ARENA_JWT_SECRET")]
    #[serde(skip_serializing_if = "Option::is_none")]
    jwt_secret: Option<String>,

    /// WebSocket endpoint path
    #[arg(long, env = "ARENA_WS_PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    ws_path: Option<String>,

    /// Redis connection URL (presence store and cluster bus)
    #[arg(long, env = "ARENA_REDIS_URL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    redis_url: Option<String>,

    /// Kafka bootstrap brokers, comma separated
    #[arg(long, env = "ARENA_KAFKA_BROKERS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    kafka_brokers: Option<String>,

    /// Kafka consumer group id
    #[arg(long, env = "ARENA_KAFKA_CONSUMER_GROUP")]
    #[serde(skip_serializing_if = "Option::is_none")]
    kafka_consumer_group: Option<String>,

    /// Event topics to consume, comma separated
    #[arg(long, env = "ARENA_KAFKA_TOPICS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    kafka_topics: Option<String>,

    /// Serve registry stats on a separate metrics port
    #[arg(long, env = "ARENA_METRICS_ENABLED")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    metrics_enabled: bool,

    /// Metrics port
    #[arg(long, env = "ARENA_METRICS_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            env: "production".to_string(),
            config: "./arena-socket.toml".to_string(),
            json_logs: false,
            generate_config: false,
            jwt_secret: String::new(),
            ws_path: "/ws".to_string(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            kafka_brokers: "127.0.0.1:9092".to_string(),
            kafka_consumer_group: "arena-socket-service".to_string(),
            kafka_topics: "submission.created,submission.judged,leaderboard.updated,contest.started,contest.ended".to_string(),
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (ARENA_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = CliOverrides::parse();
        Self::from_layers(Toml::file(&cli.config), cli)
    }

    fn from_layers(
        toml: impl figment::Provider,
        cli: CliOverrides,
    ) -> Result<Self, figment::Error> {
        let config_path = cli.config.clone();
        let generate_config = cli.generate_config;

        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(toml)
            .merge(Env::prefixed("ARENA_"))
            .merge(Serialized::defaults(cli))
            .extract()?;
        config.config = config_path;
        config.generate_config = generate_config;
        Ok(config)
    }

    pub fn is_development(&self) -> bool {
        self.env == "development"
    }

    pub fn kafka_topic_list(&self) -> Vec<String> {
        self.kafka_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Arena Socket Service Configuration
# Place this file at ./arena-socket.toml or specify with --config <path>
# All settings can be overridden via environment variables (ARENA_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Runtime environment: "development" enables debug logging
# env = "production"

# Enable structured JSON logging for Docker/production
# json_logs = false

# HMAC secret for validating client JWTs (required)
# jwt_secret = ""

# WebSocket endpoint path
# ws_path = "/ws"

# Redis connection URL (presence store and cluster bus)
# redis_url = "redis://127.0.0.1:6379/0"

# Kafka bootstrap brokers, comma separated
# kafka_brokers = "127.0.0.1:9092"

# Kafka consumer group id
# kafka_consumer_group = "arena-socket-service"

# Event topics to consume, comma separated
# kafka_topics = "submission.created,submission.judged,leaderboard.updated,contest.started,contest.ended"

# Serve registry stats on a separate metrics port
# metrics_enabled = false
# metrics_port = 9090
"#
    .to_string()
}
