//! SniProxy - Main entry point
//!
//! A TLS-terminating reverse proxy routed by SNI hostname

use anyhow::{Context, Result};
use clap::Parser;
use sniproxy::{
    CredentialSet, CredentialStore, EdgeHeaders, ProxyConfig, ProxyHandler, ProxyServer, RouteTable,
    SslPaths, StartupError, UpstreamConfig,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SniProxy - A TLS-terminating reverse proxy routed by SNI hostname
#[derive(Parser, Debug)]
#[command(name = "sniproxy")]
#[command(author = "SniProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A TLS-terminating reverse proxy routed by SNI hostname")]
struct Args {
    /// HTTPS port to listen on
    #[arg(long, env = "PORT", default_value = "443")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Domain configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = "./config.json")]
    config: PathBuf,

    /// Private key served for unmatched hostnames
    #[arg(long, env = "DEFAULT_KEY_PATH", default_value = "/etc/ssl/default/privkey.pem")]
    default_key: PathBuf,

    /// Certificate chain served for unmatched hostnames
    #[arg(long, env = "DEFAULT_CERT_PATH", default_value = "/etc/ssl/default/fullchain.pem")]
    default_cert: PathBuf,

    /// CA bundle served for unmatched hostnames
    #[arg(long, env = "DEFAULT_CA_PATH", default_value = "/etc/ssl/default/chain.pem")]
    default_ca: PathBuf,

    /// Largest accepted request body in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = sniproxy::server::DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Seconds a client may take to complete the TLS handshake
    #[arg(long, env = "HANDSHAKE_TIMEOUT_SECS", default_value = "120")]
    handshake_timeout_secs: u64,

    /// Seconds a client may take to send a complete request head
    #[arg(long, env = "HEADER_TIMEOUT_SECS", default_value = "60")]
    header_timeout_secs: u64,

    /// Verify backend certificates instead of trusting targets unconditionally
    #[arg(long, env = "VERIFY_TARGETS")]
    verify_targets: bool,

    /// Do not add CORS and security headers to responses
    #[arg(long, env = "NO_EDGE_HEADERS")]
    no_edge_headers: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence when set
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => args.log_level.to_lowercase(),
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting SniProxy v1.0.0");

    let routes = match load_routes(&args) {
        Ok(routes) => Arc::new(routes),
        Err(e) => {
            report_startup_error(&e);
            return Err(e.into());
        }
    };
    info!("Loaded {} domain route(s) from {}", routes.len(), args.config.display());

    let default_credential = CredentialSet::load(&SslPaths {
        key_path: args.default_key.clone(),
        cert_path: args.default_cert.clone(),
        ca_path: args.default_ca.clone(),
    })
    .map_err(StartupError::DefaultCredential)
    .inspect_err(report_startup_error)?;

    let credentials = Arc::new(CredentialStore::new(routes.clone(), Arc::new(default_credential)));

    let upstream = UpstreamConfig {
        trust_targets_unconditionally: !args.verify_targets,
        ..UpstreamConfig::default()
    };
    if upstream.trust_targets_unconditionally {
        info!("Backend certificate verification is disabled (trusting configured targets)");
    }
    let handler = Arc::new(ProxyHandler::new(routes, &upstream).context("Failed to build HTTP client")?);

    let config = ProxyConfig {
        bind: args.bind,
        port: args.port,
        max_body_bytes: args.max_body_bytes,
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
        header_read_timeout: Duration::from_secs(args.header_timeout_secs),
        edge_headers: EdgeHeaders {
            enabled: !args.no_edge_headers,
        },
    };

    let server = Arc::new(ProxyServer::new(config, credentials, handler)?);

    info!("SniProxy started successfully");

    server.run().await?;

    Ok(())
}

fn load_routes(args: &Args) -> Result<RouteTable, StartupError> {
    let bytes = std::fs::read(&args.config).map_err(|source| StartupError::ReadConfig {
        path: args.config.clone(),
        source,
    })?;
    RouteTable::load(&bytes)
}

fn report_startup_error(err: &StartupError) {
    if let StartupError::Config(config) = err {
        for field in config.field_errors() {
            error!("Invalid configuration: {}", field);
        }
    }
    error!("Startup failed: {}", err);
}
