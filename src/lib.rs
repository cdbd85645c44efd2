//! SniProxy - A TLS-terminating reverse proxy routed by SNI hostname
//!
//! - Per-hostname certificates chosen during the TLS handshake
//! - Domain -> backend routing from a validated JSON configuration
//! - HTTPS forwarding with header rewriting and JSON-aware body relay
//! - Error-to-status mapping for unreachable or failing backends

pub mod certificate;
pub mod config;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod routes;
pub mod server;

pub use certificate::{CredentialSet, CredentialStore, SniResolver};
pub use config::{DomainConfig, DomainEntry, SslPaths};
pub use error::{ConfigError, CredentialLoadError, FieldError, ProxyError, StartupError};
pub use headers::EdgeHeaders;
pub use proxy::{ProxyHandler, ProxyRequest, ProxyResponse, UpstreamConfig};
pub use routes::{DomainRoute, RouteTable};
pub use server::{ProxyConfig, ProxyServer};
