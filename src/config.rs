//! Hub configuration
//!
//! Resolution order: CLI args → config file → environment → built-in defaults.
//! The config file also declares pre-configured agents and services (merged
//! into the registries at registration time) and MCP tool servers.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line surface.
#[derive(Parser, Debug, Default)]
#[command(name = "swarmhub", about = "Orchestrator hub for agents, clients, and tool services")]
pub struct Cli {
    /// Agent endpoint port
    #[arg(long)]
    pub port: Option<u16>,

    /// Client endpoint port
    #[arg(long)]
    pub client_port: Option<u16>,

    /// Service endpoint port
    #[arg(long)]
    pub service_port: Option<u16>,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log filter (overrides LOG_LEVEL)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Pre-configured agent entry, keyed by name.
///
/// Consulted at registration: the configured id is adopted and configured
/// capabilities union with the wire-declared ones.
#[derive(Debug, Clone, Deserialize)]
pub struct PreconfiguredAgent {
    pub name: String,
    pub id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Pre-configured service entry, keyed by name.
#[derive(Debug, Clone, Deserialize)]
pub struct PreconfiguredService {
    pub name: String,
    pub id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Declared MCP tool server: how to launch and whether to do so at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

fn default_true() -> bool {
    true
}

/// On-disk config file shape.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    pub port: Option<u16>,
    pub client_port: Option<u16>,
    pub service_port: Option<u16>,
    pub log_level: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub mcp_request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub agents: Vec<PreconfiguredAgent>,
    #[serde(default)]
    pub services: Vec<PreconfiguredService>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent endpoint port
    pub agent_port: u16,
    /// Client endpoint port
    pub client_port: u16,
    /// Service endpoint port
    pub service_port: u16,
    /// Log filter directive
    pub log_level: String,
    /// Ping interval for agents/services; zero disables the heartbeat
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong
    pub heartbeat_timeout: Duration,
    /// Deadline for MCP subprocess requests
    pub mcp_request_timeout: Duration,
    /// Pre-configured agents, keyed by name at registration
    pub agents: Vec<PreconfiguredAgent>,
    /// Pre-configured services, keyed by name at registration
    pub services: Vec<PreconfiguredService>,
    /// Declared MCP tool servers
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_port: 3000,
            client_port: 3001,
            service_port: 3002,
            log_level: "info".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            mcp_request_timeout: Duration::from_secs(30),
            agents: Vec::new(),
            services: Vec::new(),
            mcp_servers: Vec::new(),
        }
    }
}

impl Config {
    /// Resolve configuration from all sources.
    ///
    /// Loads the file named by `--config` (an explicitly named file must
    /// exist; the default `swarmhub.toml` is optional), then applies the
    /// CLI → file → env → defaults precedence per field.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => ConfigFile::load(path)?,
            None => {
                let default_path = Path::new("swarmhub.toml");
                if default_path.exists() {
                    ConfigFile::load(default_path)?
                } else {
                    ConfigFile::default()
                }
            }
        };
        Ok(Self::from_sources(cli, file, |key| std::env::var(key).ok()))
    }

    /// Pure resolution step, with the environment injected for testability.
    pub fn from_sources(
        cli: &Cli,
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let defaults = Config::default();
        let env_port = |key: &str| env(key).and_then(|v| v.parse::<u16>().ok());
        let secs =
            |v: Option<u64>, fallback: Duration| v.map(Duration::from_secs).unwrap_or(fallback);

        Self {
            agent_port: cli
                .port
                .or(file.port)
                .or_else(|| env_port("PORT"))
                .unwrap_or(defaults.agent_port),
            client_port: cli
                .client_port
                .or(file.client_port)
                .or_else(|| env_port("CLIENT_PORT"))
                .unwrap_or(defaults.client_port),
            service_port: cli
                .service_port
                .or(file.service_port)
                .or_else(|| env_port("SERVICE_PORT"))
                .unwrap_or(defaults.service_port),
            log_level: cli
                .log_level
                .clone()
                .or(file.log_level)
                .or_else(|| env("LOG_LEVEL"))
                .unwrap_or(defaults.log_level),
            heartbeat_interval: secs(file.heartbeat_interval_secs, defaults.heartbeat_interval),
            heartbeat_timeout: secs(file.heartbeat_timeout_secs, defaults.heartbeat_timeout),
            mcp_request_timeout: secs(
                file.mcp_request_timeout_secs,
                defaults.mcp_request_timeout,
            ),
            agents: file.agents,
            services: file.services,
            mcp_servers: file.mcp_servers,
        }
    }
}
