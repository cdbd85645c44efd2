//! Error types for startup and per-request failures

use bytes::Bytes;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single validation failure in the domain configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// JSON-pointer style location, e.g. `/api.example.com/ssl`
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "/: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Malformed or incomplete domain configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration has {} validation error(s)", .0.len())]
    Validation(Vec<FieldError>),
}

impl ConfigError {
    /// Field errors, if this is a validation failure
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ConfigError::Validation(errors) => errors,
            ConfigError::Json(_) => &[],
        }
    }
}

/// A key, certificate chain or CA bundle that could not be loaded
#[derive(Debug, Error)]
pub enum CredentialLoadError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse PEM in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {}", path.display())]
    NoCertificates { path: PathBuf },

    #[error("no private key found in {}", path.display())]
    NoPrivateKey { path: PathBuf },

    #[error("unsupported private key in {}: {source}", path.display())]
    UnsupportedKey {
        path: PathBuf,
        source: rustls::Error,
    },

    #[error("private key in {} does not match the certificate: {source}", path.display())]
    KeyMismatch {
        path: PathBuf,
        source: rustls::Error,
    },
}

/// Anything that prevents the proxy from starting
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("credential for {hostname}: {source}")]
    Credential {
        hostname: String,
        source: CredentialLoadError,
    },

    #[error("default credential: {0}")]
    DefaultCredential(CredentialLoadError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to read configuration {}: {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-request failures, each mapped to a status code and a JSON body.
///
/// None of these escape the request boundary.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("domain not configured: {host}")]
    NotConfigured { host: String },

    #[error("target server unavailable: {details}")]
    Unavailable { details: String },

    #[error("SSL protocol error: {details}")]
    SslError { details: String },

    #[error("proxy internal error: {details}")]
    InternalError {
        details: String,
        code: Option<&'static str>,
    },

    /// Backend response captured on a failed exchange, relayed as-is
    #[error("backend responded with {status} on an interrupted exchange")]
    BackendVerbatim {
        status: StatusCode,
        content_type: Option<HeaderValue>,
        location: Option<HeaderValue>,
        body: Bytes,
    },

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("bad request: {details}")]
    BadRequest { details: String },
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotConfigured { .. } => StatusCode::NOT_FOUND,
            ProxyError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::SslError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::BackendVerbatim { status, .. } => *status,
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Serialized JSON body, or the raw backend bytes for `BackendVerbatim`
    pub fn body(&self) -> Bytes {
        let body = match self {
            ProxyError::NotConfigured { .. } => ErrorBody {
                error: "Domain not configured",
                details: None,
                code: None,
            },
            ProxyError::Unavailable { details } => ErrorBody {
                error: "Target server unavailable",
                details: Some(details),
                code: None,
            },
            ProxyError::SslError { details } => ErrorBody {
                error: "SSL Protocol Error",
                details: Some(details),
                code: None,
            },
            ProxyError::InternalError { details, code } => ErrorBody {
                error: "Proxy Internal Error",
                details: Some(details),
                code: *code,
            },
            ProxyError::BackendVerbatim { body, .. } => return body.clone(),
            ProxyError::PayloadTooLarge { .. } => {
                let details = self.to_string();
                return Self::encode(&ErrorBody {
                    error: "Payload Too Large",
                    details: Some(&details),
                    code: None,
                });
            }
            ProxyError::BadRequest { details } => ErrorBody {
                error: "Bad Request",
                details: Some(details),
                code: None,
            },
        };
        Self::encode(&body)
    }

    fn encode(body: &ErrorBody<'_>) -> Bytes {
        // Serializing a struct of strings cannot fail
        Bytes::from(serde_json::to_vec(body).unwrap_or_default())
    }
}
