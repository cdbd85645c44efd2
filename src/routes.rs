//! Hostname -> backend routing table
//! Built once at startup and read-only afterwards

use crate::certificate::CredentialSet;
use crate::config::DomainConfig;
use crate::error::{ConfigError, FieldError, StartupError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use url::Url;

/// A configured hostname with its backend and TLS credential
#[derive(Debug, Clone)]
pub struct DomainRoute {
    pub hostname: String,
    pub target: Url,
    /// Display label from the configuration
    pub name: Option<String>,
    pub credential: Arc<CredentialSet>,
}

/// Immutable mapping from lowercase hostname to route
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, DomainRoute>,
}

impl RouteTable {
    /// Validate configuration bytes and load every referenced credential.
    /// Either every route loads or nothing is returned.
    pub fn load(config_bytes: &[u8]) -> Result<Self, StartupError> {
        let config = DomainConfig::parse(config_bytes)?;
        Self::from_config(&config)
    }

    /// Load credentials for an already validated configuration
    pub fn from_config(config: &DomainConfig) -> Result<Self, StartupError> {
        let mut routes = Vec::with_capacity(config.len());

        for (hostname, entry) in &config.domains {
            let credential = CredentialSet::load(&entry.ssl).map_err(|source| StartupError::Credential {
                hostname: hostname.clone(),
                source,
            })?;

            // Already validated; kept fallible for configs built by hand
            let target = Url::parse(&entry.target).map_err(|e| {
                StartupError::Config(ConfigError::Validation(vec![FieldError::new(
                    format!("/{}/target", hostname),
                    e.to_string(),
                )]))
            })?;

            routes.push(DomainRoute {
                hostname: hostname.clone(),
                target,
                name: entry.name.clone(),
                credential: Arc::new(credential),
            });
        }

        Ok(Self::from_routes(routes))
    }

    pub fn from_routes(routes: Vec<DomainRoute>) -> Self {
        let routes = routes
            .into_iter()
            .map(|route| (route.hostname.to_ascii_lowercase(), route))
            .collect();
        Self { routes }
    }

    /// Exact, case-insensitive lookup
    pub fn get(&self, hostname: &str) -> Option<&DomainRoute> {
        if let Some(route) = self.routes.get(hostname) {
            return Some(route);
        }
        self.routes.get(&hostname.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes sorted by hostname
    pub fn routes(&self) -> Vec<&DomainRoute> {
        let mut routes: Vec<&DomainRoute> = self.routes.values().collect();
        routes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        routes
    }

    /// Log the routing table, one line per domain
    pub fn log_routes(&self) {
        info!("Configured routes:");
        for route in self.routes() {
            info!(
                "{} -> {} ({})",
                route.hostname,
                route.target,
                route.name.as_deref().unwrap_or("unnamed")
            );
        }
    }
}
