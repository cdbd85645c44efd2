//! Domain configuration parsing and validation
//! The file maps each hostname to a backend target and its TLS file paths

use crate::error::{ConfigError, FieldError};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

/// Paths to the PEM files making up one TLS credential
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SslPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub ca_path: PathBuf,
}

/// One configured domain, as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DomainEntry {
    pub target: String,
    pub ssl: SslPaths,
    #[serde(default)]
    pub name: Option<String>,
}

/// Validated configuration: lowercase hostname -> entry
#[derive(Debug, Clone, Default)]
pub struct DomainConfig {
    pub domains: BTreeMap<String, DomainEntry>,
}

const SSL_FIELDS: [&str; 3] = ["key_path", "cert_path", "ca_path"];

impl DomainConfig {
    /// Parse and validate raw configuration bytes.
    /// All field errors are collected before failing.
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_slice(bytes)?;

        let errors = validate(&value);
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        let raw: BTreeMap<String, DomainEntry> = serde_json::from_value(value)?;
        let domains = raw
            .into_iter()
            .map(|(host, entry)| (host.to_ascii_lowercase(), entry))
            .collect();

        Ok(Self { domains })
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }
}

/// Check a hostname key against
/// `^[A-Za-z0-9][A-Za-z0-9-]{0,61}[A-Za-z0-9](\.[A-Za-z]{2,})+$`
pub fn is_valid_hostname(host: &str) -> bool {
    let Some((first, rest)) = host.split_once('.') else {
        return false;
    };

    let first = first.as_bytes();
    if first.len() < 2 || first.len() > 63 {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(first[0]) || !edge_ok(first[first.len() - 1]) {
        return false;
    }
    if !first.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
        return false;
    }

    rest.split('.')
        .all(|label| label.len() >= 2 && label.bytes().all(|b| b.is_ascii_alphabetic()))
}

fn validate(value: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();

    let Some(root) = value.as_object() else {
        errors.push(FieldError::new("", "must be an object"));
        return errors;
    };

    let mut seen: BTreeMap<String, &str> = BTreeMap::new();

    for (host, entry) in root {
        let path = format!("/{}", host);

        if !is_valid_hostname(host) {
            errors.push(FieldError::new(&path, "key must be a valid domain name"));
        } else if let Some(previous) = seen.insert(host.to_ascii_lowercase(), host) {
            errors.push(FieldError::new(
                &path,
                format!("duplicates domain '{}' (hostnames are case-insensitive)", previous),
            ));
        }

        match entry.as_object() {
            Some(entry) => validate_entry(&path, entry, &mut errors),
            None => errors.push(FieldError::new(&path, "must be an object")),
        }
    }

    errors
}

fn validate_entry(path: &str, entry: &Map<String, Value>, errors: &mut Vec<FieldError>) {
    match entry.get("target") {
        None => errors.push(FieldError::new(path, "missing required property 'target'")),
        Some(target) => match non_empty_str(target) {
            None => errors.push(FieldError::new(
                format!("{}/target", path),
                "must be a non-empty string",
            )),
            Some(target) => {
                if let Err(reason) = check_target(target) {
                    errors.push(FieldError::new(format!("{}/target", path), reason));
                }
            }
        },
    }

    if let Some(name) = entry.get("name") {
        if !name.is_string() && !name.is_null() {
            errors.push(FieldError::new(format!("{}/name", path), "must be a string"));
        }
    }

    let ssl_path = format!("{}/ssl", path);
    let ssl = match entry.get("ssl") {
        None => {
            errors.push(FieldError::new(path, "missing required property 'ssl'"));
            return;
        }
        Some(ssl) => match ssl.as_object() {
            Some(ssl) => ssl,
            None => {
                errors.push(FieldError::new(ssl_path, "must be an object"));
                return;
            }
        },
    };

    for field in SSL_FIELDS {
        match ssl.get(field) {
            None => errors.push(FieldError::new(
                &ssl_path,
                format!("missing required property '{}'", field),
            )),
            Some(value) if non_empty_str(value).is_none() => errors.push(FieldError::new(
                format!("{}/{}", ssl_path, field),
                "must be a non-empty string",
            )),
            Some(_) => {}
        }
    }
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

fn check_target(target: &str) -> Result<(), String> {
    let url = Url::parse(target).map_err(|e| format!("must be an absolute URL: {}", e))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err("must include a host".to_string());
    }

    Ok(())
}
